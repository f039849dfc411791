//! Flow store: a single JSON document holding the flows, global settings,
//! user variables, and the sent-notification counter.
//!
//! The polling loop and any administrative caller share this one file, so
//! every read-modify-write runs under an exclusive lock around the whole
//! load-modify-save cycle, and saves go through a temp-file-then-rename so
//! a crash can never leave a half-written store behind.

use std::path::{Path, PathBuf};

use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};
use tokio::sync::Mutex;
use tracing::debug;

use crate::error::{Error, Result};
use crate::flow::Flow;

/// Process-wide settings stored alongside the flows.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Settings {
    /// Polling tick interval, seconds.
    #[serde(default = "default_check_interval")]
    pub check_interval: u64,

    /// Retained entries in the sent-notification log.
    #[serde(default = "default_notification_log_retention")]
    pub notification_log_retention: usize,

    /// Fallback webhook for flows without their own.
    #[serde(default)]
    pub default_webhook_url: String,

    #[serde(default = "default_webhook_name")]
    pub default_webhook_name: String,

    #[serde(default)]
    pub default_webhook_avatar: String,
}

fn default_check_interval() -> u64 {
    5
}

fn default_notification_log_retention() -> usize {
    100
}

fn default_webhook_name() -> String {
    "Notification Bot".to_string()
}

impl Default for Settings {
    fn default() -> Self {
        Self {
            check_interval: default_check_interval(),
            notification_log_retention: default_notification_log_retention(),
            default_webhook_url: String::new(),
            default_webhook_name: default_webhook_name(),
            default_webhook_avatar: String::new(),
        }
    }
}

/// The persisted store document.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct StoreFile {
    #[serde(default)]
    pub settings: Settings,

    /// Flat name -> value map injected into every render and evaluation.
    #[serde(default)]
    pub user_variables: Map<String, Value>,

    /// Monotonic count of successfully delivered notifications.
    #[serde(default)]
    pub notifications_sent: u64,

    #[serde(default)]
    pub flows: Vec<Flow>,
}

impl StoreFile {
    pub fn flow(&self, name: &str) -> Option<&Flow> {
        self.flows.iter().find(|f| f.name == name)
    }

    pub fn flow_mut(&mut self, name: &str) -> Option<&mut Flow> {
        self.flows.iter_mut().find(|f| f.name == name)
    }
}

/// Lock-guarded JSON-file store.
pub struct FlowStore {
    path: PathBuf,
    lock: Mutex<()>,
}

impl FlowStore {
    /// Open a store at the given path. The file is created lazily on the
    /// first save; a missing file loads as an empty document.
    pub fn open(path: impl Into<PathBuf>) -> Self {
        Self { path: path.into(), lock: Mutex::new(()) }
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Read the current document.
    pub async fn load(&self) -> Result<StoreFile> {
        let _guard = self.lock.lock().await;
        self.read_document()
    }

    /// Run a read-modify-write cycle under the store lock. The document is
    /// saved (atomically) only when the closure reports a change.
    pub async fn update<F, R>(&self, f: F) -> Result<R>
    where
        F: FnOnce(&mut StoreFile) -> (bool, R),
    {
        let _guard = self.lock.lock().await;
        let mut document = self.read_document()?;
        let (changed, result) = f(&mut document);
        if changed {
            self.write_document(&document)?;
            debug!(path = %self.path.display(), "flow store saved");
        }
        Ok(result)
    }

    /// Insert or replace a flow. Replacing a flow whose trigger
    /// configuration changed materially resets its runtime state, so a
    /// field-path edit cannot produce a stale-baseline "change" signal.
    pub async fn upsert_flow(&self, mut flow: Flow) -> Result<()> {
        let name = flow.name.clone();
        self.update(move |doc| {
            match doc.flow_mut(&name) {
                Some(existing) => {
                    if existing.trigger_config_changed(&flow) {
                        flow.reset_state();
                    } else {
                        flow.last_run = existing.last_run;
                        flow.last_value = existing.last_value.take();
                        flow.last_data = existing.last_data.take();
                    }
                    *existing = flow;
                }
                None => doc.flows.push(flow),
            }
            (true, ())
        })
        .await
    }

    /// Remove a flow. Returns whether it existed.
    pub async fn delete_flow(&self, name: &str) -> Result<bool> {
        self.update(|doc| {
            let before = doc.flows.len();
            doc.flows.retain(|f| f.name != name);
            let removed = doc.flows.len() != before;
            (removed, removed)
        })
        .await
    }

    /// Duplicate a flow as an inactive copy with no trigger history.
    /// Returns the new flow's name.
    pub async fn duplicate_flow(&self, name: &str) -> Result<Option<String>> {
        let stamp = chrono::Utc::now().timestamp();
        self.update(move |doc| {
            let Some(original) = doc.flow(name) else {
                return (false, None);
            };
            let new_name = format!("{}_copy_{}", original.name, stamp);
            let copy = original.duplicate(new_name.clone());
            doc.flows.push(copy);
            (true, Some(new_name))
        })
        .await
    }

    /// Activate or deactivate a flow. Returns whether it existed.
    pub async fn set_flow_active(&self, name: &str, active: bool) -> Result<bool> {
        self.update(|doc| match doc.flow_mut(name) {
            Some(flow) => {
                let changed = flow.active != active;
                flow.active = active;
                (changed, true)
            }
            None => (false, false),
        })
        .await
    }

    /// Set (or clear, with `None`) a user variable.
    pub async fn set_user_variable(&self, name: &str, value: Option<Value>) -> Result<()> {
        self.update(|doc| {
            match value {
                Some(v) => {
                    doc.user_variables.insert(name.to_string(), v);
                }
                None => {
                    doc.user_variables.remove(name);
                }
            }
            (true, ())
        })
        .await
    }

    /// Bump the monotonic sent counter.
    pub async fn increment_sent_counter(&self) -> Result<u64> {
        self.update(|doc| {
            doc.notifications_sent += 1;
            (true, doc.notifications_sent)
        })
        .await
    }

    fn read_document(&self) -> Result<StoreFile> {
        if !self.path.exists() {
            return Ok(StoreFile::default());
        }
        let data = std::fs::read(&self.path)
            .map_err(|e| Error::Store(format!("failed to read {}: {}", self.path.display(), e)))?;
        serde_json::from_slice(&data)
            .map_err(|e| Error::Store(format!("failed to parse {}: {}", self.path.display(), e)))
    }

    /// Atomic write: serialize to a temp file, then rename over the target.
    fn write_document(&self, document: &StoreFile) -> Result<()> {
        if let Some(parent) = self.path.parent() {
            if !parent.as_os_str().is_empty() {
                std::fs::create_dir_all(parent).map_err(|e| {
                    Error::Store(format!("failed to create {}: {}", parent.display(), e))
                })?;
            }
        }
        let data = serde_json::to_vec_pretty(document)
            .map_err(|e| Error::Store(format!("failed to serialize store: {}", e)))?;
        let temp_path = self.path.with_extension("json.tmp");
        std::fs::write(&temp_path, data)
            .map_err(|e| Error::Store(format!("failed to write temp file: {}", e)))?;
        std::fs::rename(&temp_path, &self.path)
            .map_err(|e| Error::Store(format!("failed to rename temp file: {}", e)))?;
        Ok(())
    }
}
