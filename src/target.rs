use std::sync::Arc;

use log::{debug, warn};

use crate::store::ChatStore;

/// Resolves the broadcast the collectors should work against.
///
/// The persisted setting (written by the admin dashboard) wins; the static
/// fallback from configuration is used when the setting is absent, blank,
/// or cannot be read. Resolution never fails: collecting against a
/// possibly stale target beats not collecting at all.
///
/// Cloning is cheap and every clone is safe to use concurrently; the only
/// shared state is the store's pool.
#[derive(Clone)]
pub struct TargetResolver {
    store: Arc<dyn ChatStore>,
    setting_key: String,
    fallback: String,
}

impl TargetResolver {
    pub fn new(
        store: Arc<dyn ChatStore>,
        setting_key: impl Into<String>,
        fallback: impl Into<String>,
    ) -> Self {
        Self {
            store,
            setting_key: setting_key.into(),
            fallback: fallback.into().trim().to_string(),
        }
    }

    pub async fn resolve(&self) -> String {
        match self.store.get_setting(&self.setting_key).await {
            Ok(Some(value)) if !value.trim().is_empty() => value.trim().to_string(),
            Ok(_) => {
                debug!(
                    "setting '{}' not set, using fallback target",
                    self.setting_key
                );
                self.fallback.clone()
            }
            Err(e) => {
                warn!(
                    "failed to read setting '{}': {e} – using fallback target",
                    self.setting_key
                );
                self.fallback.clone()
            }
        }
    }
}
