//! Audit log for administrative cluster changes
//!
//! Each entry is one JSON line, written to the `audit` tracing target and,
//! when configured, appended to a file.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::fs::{File, OpenOptions};
use std::io::Write;
use std::path::Path;
use std::sync::Mutex;

/// Audit log event types
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum AuditEventType {
    ClusterAdded,
    NodeAdded,
    NodeEnabled,
    NodeDisabled,
    StateModelAdded,
    ResourceGroupAdded,
    ResourceGroupDropped,
    Rebalanced,
}

/// Audit log entry
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AuditEntry {
    #[serde(with = "chrono::serde::ts_milliseconds")]
    pub timestamp: DateTime<Utc>,
    pub event: AuditEventType,
    pub cluster: String,
    pub target: Option<String>,
    pub message: String,
    pub meta: Option<serde_json::Value>,
}

/// Audit logger
pub struct AuditLogger {
    file: Option<Mutex<File>>,
}

impl AuditLogger {
    /// Log entries through tracing only
    pub fn new() -> Self {
        Self { file: None }
    }

    /// Also append entries to `path`
    pub fn with_file(path: impl AsRef<Path>) -> crate::Result<Self> {
        let file = OpenOptions::new().create(true).append(true).open(path)?;
        Ok(Self {
            file: Some(Mutex::new(file)),
        })
    }

    pub fn log(&self, entry: &AuditEntry) {
        let line = match serde_json::to_string(entry) {
            Ok(line) => line,
            Err(e) => {
                tracing::error!("Failed to encode audit entry: {}", e);
                return;
            }
        };

        tracing::info!(target: "audit", "{}", line);

        if let Some(file) = &self.file {
            if let Ok(mut f) = file.lock() {
                if let Err(e) = writeln!(f, "{}", line) {
                    tracing::error!("Failed to write audit log: {}", e);
                }
            }
        }
    }

    pub fn log_event(
        &self,
        event: AuditEventType,
        cluster: &str,
        target: Option<&str>,
        message: impl Into<String>,
        meta: Option<serde_json::Value>,
    ) {
        self.log(&AuditEntry {
            timestamp: Utc::now(),
            event,
            cluster: cluster.to_string(),
            target: target.map(str::to_string),
            message: message.into(),
            meta,
        });
    }
}

impl Default for AuditLogger {
    fn default() -> Self {
        Self::new()
    }
}
