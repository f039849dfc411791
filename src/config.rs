//! Process-level configuration: where the flow store and notification log
//! live on disk. Runtime settings (polling cadence, retention, webhook
//! defaults) are part of the store document itself, see [`crate::store`].

use std::path::PathBuf;

/// File locations, resolvable from environment variables.
#[derive(Debug, Clone)]
pub struct Config {
    /// Path to the flow store document.
    pub store_path: PathBuf,
    /// Path to the sent-notification log.
    pub notification_log_path: PathBuf,
}

impl Config {
    /// Load configuration from `HOOKFLOW_*` environment variables, falling
    /// back to the platform data directory.
    pub fn load() -> Self {
        let store_path = std::env::var("HOOKFLOW_STORE_PATH")
            .map(PathBuf::from)
            .unwrap_or_else(|_| Self::data_dir().join("flows.json"));
        let notification_log_path = std::env::var("HOOKFLOW_NOTIFICATION_LOG_PATH")
            .map(PathBuf::from)
            .unwrap_or_else(|_| Self::data_dir().join("sent_notifications.json"));

        Self { store_path, notification_log_path }
    }

    /// Get the data directory.
    pub fn data_dir() -> PathBuf {
        dirs::data_dir()
            .map(|d| d.join("hookflow"))
            .unwrap_or_else(|| PathBuf::from(".hookflow"))
    }
}

impl Default for Config {
    fn default() -> Self {
        Self::load()
    }
}
