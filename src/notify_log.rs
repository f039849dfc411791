//! Sent-notification log.
//!
//! A flat JSON array of delivery records, trimmed to the configured
//! retention so the file cannot grow without bound. Only deliveries that
//! carried real content are recorded.

use std::path::{Path, PathBuf};

use chrono::Local;
use serde::{Deserialize, Serialize};
use tracing::warn;

use crate::embed::Embed;
use crate::error::{Error, Result};

/// One delivered notification.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct NotificationRecord {
    pub timestamp: String,
    pub flow_name: String,
    pub message: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub embed: Option<EmbedSummary>,
    pub webhook_name: String,
}

/// Compressed embed details kept in the log.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct EmbedSummary {
    #[serde(default)]
    pub title: String,
    #[serde(default)]
    pub description: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub color: Option<u32>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub url: Option<String>,
}

impl EmbedSummary {
    /// Summarize a delivered embed; long descriptions are truncated.
    pub fn of(embed: &Embed) -> Self {
        let mut description = embed.description.clone().unwrap_or_default();
        if description.chars().count() > 200 {
            description = description.chars().take(200).collect::<String>() + "...";
        }
        Self {
            title: embed.title.clone().unwrap_or_default(),
            description,
            color: embed.color,
            url: embed.url.clone(),
        }
    }

    fn has_content(&self) -> bool {
        !self.title.is_empty() || !self.description.is_empty()
    }
}

/// Append-and-trim log of sent notifications.
pub struct NotificationLog {
    path: PathBuf,
}

impl NotificationLog {
    pub fn open(path: impl Into<PathBuf>) -> Self {
        Self { path: path.into() }
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Record a delivery. Entries without a flow name or without any real
    /// content (blank message and contentless embed) are dropped.
    pub fn record(
        &self,
        flow_name: &str,
        message: &str,
        embed: Option<EmbedSummary>,
        webhook_name: &str,
        retention: usize,
    ) {
        if flow_name.is_empty() {
            return;
        }
        let message = message.trim();
        let embed = embed.filter(|e| e.has_content());
        if message.is_empty() && embed.is_none() {
            return;
        }

        let record = NotificationRecord {
            timestamp: Local::now().format("%Y-%m-%d %H:%M:%S").to_string(),
            flow_name: flow_name.to_string(),
            message: message.to_string(),
            embed,
            webhook_name: webhook_name.to_string(),
        };

        // A lost log entry must never fail the delivery that produced it.
        if let Err(e) = self.append(record, retention) {
            warn!(error = %e, "failed to record sent notification");
        }
    }

    /// Read all retained records.
    pub fn entries(&self) -> Result<Vec<NotificationRecord>> {
        if !self.path.exists() {
            return Ok(Vec::new());
        }
        let data = std::fs::read(&self.path)
            .map_err(|e| Error::Store(format!("failed to read {}: {}", self.path.display(), e)))?;
        serde_json::from_slice(&data)
            .map_err(|e| Error::Store(format!("failed to parse {}: {}", self.path.display(), e)))
    }

    fn append(&self, record: NotificationRecord, retention: usize) -> Result<()> {
        let mut entries = self.entries().unwrap_or_default();
        entries.push(record);
        if entries.len() > retention {
            entries.drain(..entries.len() - retention);
        }

        if let Some(parent) = self.path.parent() {
            if !parent.as_os_str().is_empty() {
                std::fs::create_dir_all(parent)?;
            }
        }
        let data = serde_json::to_vec_pretty(&entries)?;
        let temp_path = self.path.with_extension("json.tmp");
        std::fs::write(&temp_path, data)?;
        std::fs::rename(&temp_path, &self.path)?;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn log_in(dir: &tempfile::TempDir) -> NotificationLog {
        NotificationLog::open(dir.path().join("sent.json"))
    }

    #[test]
    fn test_record_and_read_back() {
        let dir = tempfile::tempdir().unwrap();
        let log = log_in(&dir);

        log.record("orders", "3 new orders", None, "Notification Bot", 100);

        let entries = log.entries().unwrap();
        assert_eq!(entries.len(), 1);
        assert_eq!(entries[0].flow_name, "orders");
        assert_eq!(entries[0].message, "3 new orders");
    }

    #[test]
    fn test_empty_deliveries_not_recorded() {
        let dir = tempfile::tempdir().unwrap();
        let log = log_in(&dir);

        log.record("orders", "   ", None, "bot", 100);
        log.record("", "message", None, "bot", 100);
        let contentless = EmbedSummary {
            title: String::new(),
            description: String::new(),
            color: None,
            url: None,
        };
        log.record("orders", "", Some(contentless), "bot", 100);

        assert!(log.entries().unwrap().is_empty());
    }

    #[test]
    fn test_retention_trims_oldest() {
        let dir = tempfile::tempdir().unwrap();
        let log = log_in(&dir);

        for i in 0..5 {
            log.record("f", &format!("msg {}", i), None, "bot", 3);
        }

        let entries = log.entries().unwrap();
        assert_eq!(entries.len(), 3);
        assert_eq!(entries[0].message, "msg 2");
        assert_eq!(entries[2].message, "msg 4");
    }

    #[test]
    fn test_embed_summary_truncates_description() {
        let embed = Embed {
            title: Some("t".to_string()),
            description: Some("x".repeat(300)),
            ..Default::default()
        };
        let summary = EmbedSummary::of(&embed);
        assert_eq!(summary.description.chars().count(), 203);
        assert!(summary.description.ends_with("..."));
    }
}
