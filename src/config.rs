use std::fmt;
use std::str::FromStr;
use std::time::Duration;

use anyhow::{Context, Result, anyhow, bail};

// ------------------------------------------------------------
// Root configuration
// ------------------------------------------------------------
//
// This is the top-level configuration structure, sourced from the
// process environment (a `.env` file is honoured if present).
//
// It defines:
// - Database connection and pool sizing
// - Upstream feed credentials and the fallback target
// - Worker schedules (stats, URL check, watchdog)
// - Retry behaviour shared by every worker
//
#[derive(Debug, Clone)]
pub struct Config {
    /// Persistence settings
    pub database: DatabaseConfig,

    /// Upstream feed settings
    pub feed: FeedConfig,

    /// Worker timing
    pub schedule: ScheduleConfig,

    /// Retry policy seed values
    pub retry: RetryConfig,

    /// Replay the broadcast's available history before tailing live chat
    pub backfill_enabled: bool,

    /// Log filter used when `RUST_LOG` is not set
    pub log_level: String,

    /// Interval of the metrics log line; zero disables the reporter
    pub metrics_interval_secs: u64,
}

// ------------------------------------------------------------
// Database configuration
// ------------------------------------------------------------
//
// Notes:
// - The pool always reserves one connection per resident worker
//   (chat, stats, URL monitor); `pool_overflow` is headroom on top.
// - `url` may contain credentials and is never logged.
//
#[derive(Clone)]
pub struct DatabaseConfig {
    /// Postgres connection string
    pub url: String,

    /// Extra connections above the resident-worker reservation
    pub pool_overflow: u32,

    /// Maximum wait for a free connection before `PoolExhausted`
    pub pool_timeout_secs: u64,

    /// Apply embedded migrations at startup
    pub run_migrations: bool,

    /// Settings key that holds the current target
    pub target_setting_key: String,
}

// ------------------------------------------------------------
// Feed configuration
// ------------------------------------------------------------
//
// The API key is security-sensitive: `Debug` redacts it.
//
#[derive(Clone)]
pub struct FeedConfig {
    /// Upstream API credential
    pub api_key: String,

    /// Target used when the persisted setting is absent or unreadable
    pub fallback_target: String,
}

#[derive(Debug, Clone)]
pub struct ScheduleConfig {
    pub stats_poll_interval_secs: u64,
    pub url_check_interval_secs: u64,
    pub watchdog_timeout_secs: u64,
    pub watchdog_check_interval_secs: u64,

    /// Pause before the supervisor re-runs a faulted worker
    pub worker_restart_delay_secs: u64,
}

#[derive(Debug, Clone)]
pub struct RetryConfig {
    pub max_attempts: u32,
    pub backoff_secs: u64,
}

/// Number of workers that hold a connection per unit of work for their
/// whole lifetime: chat collector, stats collector, URL monitor.
pub const RESIDENT_WORKERS: u32 = 3;

impl Config {
    /// Loads configuration from the process environment.
    ///
    /// A `.env` file in the working directory is read first; variables
    /// already present in the environment take precedence.
    pub fn from_env() -> Result<Self> {
        // Missing .env is the normal production case
        let _ = dotenvy::dotenv();
        Self::from_lookup(|key| std::env::var(key).ok())
    }

    /// Builds a configuration from an arbitrary key lookup.
    pub fn from_lookup<F>(lookup: F) -> Result<Self>
    where
        F: Fn(&str) -> Option<String>,
    {
        let env = Env { lookup };

        let config = Config {
            database: DatabaseConfig {
                url: env.required("DATABASE_URL")?,
                pool_overflow: env.parsed("DB_POOL_OVERFLOW", 2)?,
                pool_timeout_secs: env.parsed("DB_POOL_TIMEOUT_SECS", 10)?,
                run_migrations: env.flag("RUN_MIGRATIONS", true)?,
                target_setting_key: env
                    .optional("TARGET_SETTING_KEY")
                    .unwrap_or_else(|| "youtube_url".to_string()),
            },
            feed: FeedConfig {
                api_key: env.required("YOUTUBE_API_KEY")?,
                fallback_target: env.required("YOUTUBE_URL")?,
            },
            schedule: ScheduleConfig {
                stats_poll_interval_secs: env.parsed("STATS_POLL_INTERVAL_SECS", 60)?,
                url_check_interval_secs: env.parsed("URL_CHECK_INTERVAL_SECS", 30)?,
                watchdog_timeout_secs: env.parsed("WATCHDOG_TIMEOUT_SECS", 300)?,
                watchdog_check_interval_secs: env.parsed("WATCHDOG_CHECK_INTERVAL_SECS", 30)?,
                worker_restart_delay_secs: env.parsed("WORKER_RESTART_DELAY_SECS", 5)?,
            },
            retry: RetryConfig {
                max_attempts: env.parsed("RETRY_MAX_ATTEMPTS", 5)?,
                backoff_secs: env.parsed("RETRY_BACKOFF_SECS", 2)?,
            },
            backfill_enabled: env.flag("BACKFILL_ENABLED", false)?,
            log_level: env
                .optional("LOG_LEVEL")
                .unwrap_or_else(|| "info".to_string()),
            metrics_interval_secs: env.parsed("METRICS_INTERVAL_SECS", 60)?,
        };

        config.validate()?;
        Ok(config)
    }

    /// Rejects values that would make a worker loop spin or never run.
    fn validate(&self) -> Result<()> {
        let s = &self.schedule;
        for (name, value) in [
            ("STATS_POLL_INTERVAL_SECS", s.stats_poll_interval_secs),
            ("URL_CHECK_INTERVAL_SECS", s.url_check_interval_secs),
            ("WATCHDOG_TIMEOUT_SECS", s.watchdog_timeout_secs),
            ("WATCHDOG_CHECK_INTERVAL_SECS", s.watchdog_check_interval_secs),
        ] {
            if value == 0 {
                bail!("{name} must be greater than zero");
            }
        }

        if self.retry.max_attempts == 0 {
            bail!("RETRY_MAX_ATTEMPTS must be at least 1");
        }

        if self.database.target_setting_key.trim().is_empty() {
            bail!("TARGET_SETTING_KEY must not be empty");
        }

        Ok(())
    }
}

impl DatabaseConfig {
    /// Total pool capacity: resident workers plus overflow.
    pub fn max_connections(&self) -> u32 {
        RESIDENT_WORKERS + self.pool_overflow
    }

    pub fn pool_timeout(&self) -> Duration {
        Duration::from_secs(self.pool_timeout_secs)
    }
}

impl ScheduleConfig {
    pub fn stats_poll_interval(&self) -> Duration {
        Duration::from_secs(self.stats_poll_interval_secs)
    }

    pub fn url_check_interval(&self) -> Duration {
        Duration::from_secs(self.url_check_interval_secs)
    }

    pub fn watchdog_timeout(&self) -> Duration {
        Duration::from_secs(self.watchdog_timeout_secs)
    }

    pub fn watchdog_check_interval(&self) -> Duration {
        Duration::from_secs(self.watchdog_check_interval_secs)
    }

    pub fn worker_restart_delay(&self) -> Duration {
        Duration::from_secs(self.worker_restart_delay_secs)
    }
}

impl fmt::Debug for DatabaseConfig {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("DatabaseConfig")
            .field("url", &"<redacted>")
            .field("pool_overflow", &self.pool_overflow)
            .field("pool_timeout_secs", &self.pool_timeout_secs)
            .field("run_migrations", &self.run_migrations)
            .field("target_setting_key", &self.target_setting_key)
            .finish()
    }
}

impl fmt::Debug for FeedConfig {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("FeedConfig")
            .field("api_key", &"<redacted>")
            .field("fallback_target", &self.fallback_target)
            .finish()
    }
}

// ------------------------------------------------------------
// Environment access helpers
// ------------------------------------------------------------

struct Env<F> {
    lookup: F,
}

impl<F> Env<F>
where
    F: Fn(&str) -> Option<String>,
{
    /// Present and non-blank, trimmed.
    fn optional(&self, key: &str) -> Option<String> {
        (self.lookup)(key)
            .map(|v| v.trim().to_string())
            .filter(|v| !v.is_empty())
    }

    fn required(&self, key: &str) -> Result<String> {
        self.optional(key)
            .ok_or_else(|| anyhow!("missing required environment variable {key}"))
    }

    fn parsed<T>(&self, key: &str, default: T) -> Result<T>
    where
        T: FromStr,
        T::Err: std::error::Error + Send + Sync + 'static,
    {
        match self.optional(key) {
            Some(raw) => raw
                .parse()
                .with_context(|| format!("invalid value for {key}: {raw:?}")),
            None => Ok(default),
        }
    }

    fn flag(&self, key: &str, default: bool) -> Result<bool> {
        match self.optional(key).map(|v| v.to_ascii_lowercase()) {
            None => Ok(default),
            Some(v) => match v.as_str() {
                "1" | "true" | "yes" | "on" => Ok(true),
                "0" | "false" | "no" | "off" => Ok(false),
                _ => bail!("invalid boolean for {key}: {v:?}"),
            },
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashMap;

    fn lookup(pairs: &[(&str, &str)]) -> impl Fn(&str) -> Option<String> {
        let map: HashMap<String, String> = pairs
            .iter()
            .map(|(k, v)| (k.to_string(), v.to_string()))
            .collect();
        move |key| map.get(key).cloned()
    }

    const REQUIRED: [(&str, &str); 3] = [
        ("DATABASE_URL", "postgres://localhost/chat"),
        ("YOUTUBE_API_KEY", "secret"),
        ("YOUTUBE_URL", "https://youtu.be/dQw4w9WgXcQ"),
    ];

    #[test]
    fn defaults_apply_when_only_required_values_are_set() {
        let cfg = Config::from_lookup(lookup(&REQUIRED)).unwrap();

        assert_eq!(cfg.schedule.stats_poll_interval_secs, 60);
        assert_eq!(cfg.schedule.watchdog_timeout_secs, 300);
        assert_eq!(cfg.retry.max_attempts, 5);
        assert_eq!(cfg.retry.backoff_secs, 2);
        assert!(!cfg.backfill_enabled);
        assert_eq!(cfg.log_level, "info");
        assert_eq!(cfg.database.target_setting_key, "youtube_url");
        assert_eq!(cfg.database.max_connections(), RESIDENT_WORKERS + 2);
    }

    #[test]
    fn overrides_are_parsed() {
        let mut pairs = REQUIRED.to_vec();
        pairs.extend([
            ("BACKFILL_ENABLED", "yes"),
            ("RETRY_MAX_ATTEMPTS", "3"),
            ("DB_POOL_OVERFLOW", "0"),
            ("LOG_LEVEL", "debug"),
        ]);

        let cfg = Config::from_lookup(lookup(&pairs)).unwrap();
        assert!(cfg.backfill_enabled);
        assert_eq!(cfg.retry.max_attempts, 3);
        assert_eq!(cfg.database.max_connections(), RESIDENT_WORKERS);
        assert_eq!(cfg.log_level, "debug");
    }

    #[test]
    fn missing_credential_is_an_error() {
        let err = Config::from_lookup(lookup(&REQUIRED[..1])).unwrap_err();
        assert!(err.to_string().contains("YOUTUBE_API_KEY"));
    }

    #[test]
    fn zero_intervals_are_rejected() {
        let mut pairs = REQUIRED.to_vec();
        pairs.push(("WATCHDOG_CHECK_INTERVAL_SECS", "0"));
        assert!(Config::from_lookup(lookup(&pairs)).is_err());
    }

    #[test]
    fn debug_output_redacts_secrets() {
        let cfg = Config::from_lookup(lookup(&REQUIRED)).unwrap();
        let rendered = format!("{cfg:?}");
        assert!(!rendered.contains("secret"));
        assert!(!rendered.contains("postgres://"));
    }
}
