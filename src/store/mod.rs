//! Persistence seam shared by every worker.
//!
//! Workers depend on the `ChatStore` trait only. The production
//! implementation is the Postgres-backed `Gateway`; tests use an in-memory
//! store with the same idempotency rules.

pub mod postgres;

use async_trait::async_trait;
use thiserror::Error;

use crate::schema::{ChatMessage, StatsSnapshot};

pub use postgres::Gateway;

#[derive(Debug, Error)]
pub enum StoreError {
    /// Every pooled connection stayed checked out past the acquire timeout.
    #[error("connection pool exhausted")]
    PoolExhausted,

    #[error("database error: {0}")]
    Database(#[from] sqlx::Error),

    #[error("migration error: {0}")]
    Migration(#[from] sqlx::migrate::MigrateError),
}

impl StoreError {
    /// Maps pool acquisition failures onto `PoolExhausted`.
    pub fn from_acquire(err: sqlx::Error) -> Self {
        match err {
            sqlx::Error::PoolTimedOut => StoreError::PoolExhausted,
            other => StoreError::Database(other),
        }
    }
}

/// Every operation is one unit of work: a connection is held only for its
/// duration.
#[async_trait]
pub trait ChatStore: Send + Sync {
    /// Reads a value from the generic settings table.
    async fn get_setting(&self, key: &str) -> Result<Option<String>, StoreError>;

    /// Inserts the message unless (broadcast_id, message_id) already exists.
    ///
    /// Returns `true` when a new row was written, `false` for a duplicate.
    async fn upsert_message(&self, message: &ChatMessage) -> Result<bool, StoreError>;

    /// Appends a statistics snapshot.
    async fn insert_snapshot(&self, snapshot: &StatsSnapshot) -> Result<(), StoreError>;
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn acquire_timeout_maps_to_pool_exhausted() {
        assert!(matches!(
            StoreError::from_acquire(sqlx::Error::PoolTimedOut),
            StoreError::PoolExhausted
        ));
        assert!(matches!(
            StoreError::from_acquire(sqlx::Error::PoolClosed),
            StoreError::Database(sqlx::Error::PoolClosed)
        ));
    }
}
