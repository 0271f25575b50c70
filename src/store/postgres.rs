use async_trait::async_trait;
use futures_util::future::BoxFuture;
use log::{info, warn};
use sqlx::postgres::{PgConnection, PgPool, PgPoolOptions};
use sqlx::Row;

use crate::config::DatabaseConfig;
use crate::schema::{ChatMessage, StatsSnapshot};

use super::{ChatStore, StoreError};

/// ============================================================
/// Gateway
/// ============================================================
///
/// Owns the bounded Postgres pool shared by all workers.
///
/// Pool sizing:
/// - One connection per resident worker (chat, stats, URL monitor)
/// - Plus `DB_POOL_OVERFLOW` for transient overlap (restarts, ad-hoc reads)
///
/// Connections are checked out per unit of work through `with_session`
/// and never held while a worker waits on the upstream feed.
///
/// Constructed explicitly in `main` and injected; there is no global.
#[derive(Clone)]
pub struct Gateway {
    pool: PgPool,
}

impl Gateway {
    /// Opens the pool and verifies connectivity.
    ///
    /// Failure here is process-fatal: nothing can run without persistence.
    pub async fn connect(cfg: &DatabaseConfig) -> Result<Self, StoreError> {
        let pool = PgPoolOptions::new()
            .max_connections(cfg.max_connections())
            .acquire_timeout(cfg.pool_timeout())
            .connect(&cfg.url)
            .await?;

        info!(
            "Connected to Postgres (pool max={} acquire_timeout={:?})",
            cfg.max_connections(),
            cfg.pool_timeout()
        );

        Ok(Self { pool })
    }

    /// Applies the embedded migrations in `migrations/`.
    pub async fn migrate(&self) -> Result<(), StoreError> {
        info!("Applying migrations...");
        sqlx::migrate!().run(&self.pool).await?;
        info!("Migrations applied");
        Ok(())
    }

    /// Runs `f` inside one transaction on one pooled connection.
    ///
    /// CONTRACT:
    /// - Commits when `f` returns `Ok`
    /// - Rolls back and returns the error when `f` fails
    /// - The connection goes back to the pool on every path
    /// - Acquisition beyond pool capacity waits up to the acquire timeout,
    ///   then fails with `StoreError::PoolExhausted`
    pub async fn with_session<T, F>(&self, f: F) -> Result<T, StoreError>
    where
        T: Send,
        F: for<'c> FnOnce(&'c mut PgConnection) -> BoxFuture<'c, Result<T, sqlx::Error>> + Send,
    {
        let mut tx = self.pool.begin().await.map_err(StoreError::from_acquire)?;

        match f(&mut *tx).await {
            Ok(value) => {
                tx.commit().await?;
                Ok(value)
            }
            Err(e) => {
                if let Err(rollback_err) = tx.rollback().await {
                    warn!("rollback failed: {rollback_err}");
                }
                Err(StoreError::Database(e))
            }
        }
    }

    pub async fn close(&self) {
        self.pool.close().await;
    }
}

#[async_trait]
impl ChatStore for Gateway {
    async fn get_setting(&self, key: &str) -> Result<Option<String>, StoreError> {
        let key = key.to_string();

        self.with_session(move |conn| {
            Box::pin(async move {
                let row = sqlx::query(
                    r#"
                    SELECT value
                    FROM settings
                    WHERE key = $1
                    "#,
                )
                .bind(&key)
                .fetch_optional(&mut *conn)
                .await?;

                match row {
                    Some(r) => Ok(Some(r.try_get("value")?)),
                    None => Ok(None),
                }
            })
        })
        .await
    }

    async fn upsert_message(&self, message: &ChatMessage) -> Result<bool, StoreError> {
        let m = message.clone();

        self.with_session(move |conn| {
            Box::pin(async move {
                let result = sqlx::query(
                    r#"
                    INSERT INTO chat_messages (
                        broadcast_id, message_id, author_name, author_channel_id,
                        body, kind, published_at, is_paid,
                        amount_micros, currency, amount_display, collected_at
                    )
                    VALUES ($1, $2, $3, $4, $5, $6, $7, $8, $9, $10, $11, $12)
                    ON CONFLICT (broadcast_id, message_id) DO NOTHING
                    "#,
                )
                .bind(&m.broadcast_id)
                .bind(&m.message_id)
                .bind(&m.author_name)
                .bind(&m.author_channel_id)
                .bind(&m.body)
                .bind(m.kind.as_str())
                .bind(m.published_at)
                .bind(m.is_paid())
                .bind(m.amount_micros)
                .bind(&m.currency)
                .bind(&m.amount_display)
                .bind(m.collected_at)
                .execute(&mut *conn)
                .await?;

                Ok(result.rows_affected() == 1)
            })
        })
        .await
    }

    async fn insert_snapshot(&self, snapshot: &StatsSnapshot) -> Result<(), StoreError> {
        let s = snapshot.clone();

        self.with_session(move |conn| {
            Box::pin(async move {
                sqlx::query(
                    r#"
                    INSERT INTO stats_snapshots (
                        broadcast_id, captured_at, concurrent_viewers,
                        view_count, like_count, is_live
                    )
                    VALUES ($1, $2, $3, $4, $5, $6)
                    "#,
                )
                .bind(&s.broadcast_id)
                .bind(s.captured_at)
                .bind(s.concurrent_viewers)
                .bind(s.view_count)
                .bind(s.like_count)
                .bind(s.is_live)
                .execute(&mut *conn)
                .await?;

                Ok(())
            })
        })
        .await
    }
}

// ------------------------------------------------------------
// Database tests
// ------------------------------------------------------------
//
// These run against the Postgres named by DATABASE_URL and are skipped
// when it is not set. Keys and broadcast ids are unique per run so the
// tests can share one database.
//
#[cfg(test)]
mod tests {
    use std::time::Duration;

    use chrono::Utc;

    use super::*;
    use crate::schema::MessageKind;

    async fn test_gateway() -> anyhow::Result<Option<Gateway>> {
        let Ok(url) = std::env::var("DATABASE_URL") else {
            println!("DATABASE_URL not set, skipping");
            return Ok(None);
        };

        let gateway = Gateway::connect(&DatabaseConfig {
            url,
            pool_overflow: 0,
            pool_timeout_secs: 5,
            run_migrations: true,
            target_setting_key: "youtube_url".into(),
        })
        .await?;
        gateway.migrate().await?;

        Ok(Some(gateway))
    }

    fn unique(prefix: &str) -> String {
        format!("{prefix}-{}", Utc::now().timestamp_nanos_opt().unwrap_or_default())
    }

    fn message(broadcast_id: &str, message_id: &str) -> ChatMessage {
        ChatMessage {
            message_id: message_id.into(),
            broadcast_id: broadcast_id.into(),
            author_name: "viewer".into(),
            author_channel_id: Some("UCviewer".into()),
            body: "hello".into(),
            kind: MessageKind::Text,
            published_at: Utc::now(),
            amount_micros: None,
            currency: None,
            amount_display: None,
            collected_at: Utc::now(),
        }
    }

    #[tokio::test]
    async fn session_commits_on_success() -> anyhow::Result<()> {
        let Some(gateway) = test_gateway().await? else {
            return Ok(());
        };
        let key = unique("commit");

        let k = key.clone();
        gateway
            .with_session(move |conn| {
                Box::pin(async move {
                    sqlx::query("INSERT INTO settings (key, value) VALUES ($1, $2)")
                        .bind(&k)
                        .bind("streamB")
                        .execute(&mut *conn)
                        .await?;
                    Ok(())
                })
            })
            .await?;

        assert_eq!(gateway.get_setting(&key).await?.as_deref(), Some("streamB"));
        Ok(())
    }

    #[tokio::test]
    async fn session_rolls_back_and_reraises_on_error() -> anyhow::Result<()> {
        let Some(gateway) = test_gateway().await? else {
            return Ok(());
        };
        let key = unique("rollback");

        let k = key.clone();
        let result: Result<(), StoreError> = gateway
            .with_session(move |conn| {
                Box::pin(async move {
                    sqlx::query("INSERT INTO settings (key, value) VALUES ($1, $2)")
                        .bind(&k)
                        .bind("streamB")
                        .execute(&mut *conn)
                        .await?;
                    Err(sqlx::Error::RowNotFound)
                })
            })
            .await;

        assert!(matches!(
            result,
            Err(StoreError::Database(sqlx::Error::RowNotFound))
        ));
        assert_eq!(gateway.get_setting(&key).await?, None);
        Ok(())
    }

    #[tokio::test]
    async fn duplicate_upsert_reports_no_insert() -> anyhow::Result<()> {
        let Some(gateway) = test_gateway().await? else {
            return Ok(());
        };
        let broadcast = unique("vid");

        assert!(gateway.upsert_message(&message(&broadcast, "m1")).await?);
        assert!(!gateway.upsert_message(&message(&broadcast, "m1")).await?);
        assert!(gateway.upsert_message(&message(&broadcast, "m2")).await?);

        let count: i64 =
            sqlx::query_scalar("SELECT COUNT(*) FROM chat_messages WHERE broadcast_id = $1")
                .bind(&broadcast)
                .fetch_one(&gateway.pool)
                .await?;
        assert_eq!(count, 2);
        Ok(())
    }

    #[tokio::test]
    async fn exhausted_pool_fails_with_pool_exhausted() -> anyhow::Result<()> {
        let Ok(url) = std::env::var("DATABASE_URL") else {
            println!("DATABASE_URL not set, skipping");
            return Ok(());
        };

        let pool = PgPoolOptions::new()
            .max_connections(1)
            .acquire_timeout(Duration::from_millis(200))
            .connect(&url)
            .await?;
        let gateway = Gateway { pool };

        let _held = gateway.pool.acquire().await?;

        let result = gateway
            .with_session(|conn| {
                Box::pin(async move {
                    sqlx::query("SELECT 1").execute(&mut *conn).await?;
                    Ok(())
                })
            })
            .await;

        assert!(matches!(result, Err(StoreError::PoolExhausted)));
        Ok(())
    }
}
