//! Append-only JSON-Lines event log.
//!
//! One file per event family under the provider log directory. Handles are
//! opened lazily on the first event of a family and held until `stop`.
//! Logging never fails the caller: write errors are traced and the event is
//! dropped.

use chrono::Utc;
use serde_json::{Value, json};
use std::collections::HashMap;
use std::fs::{File, OpenOptions};
use std::io::Write;
use std::path::PathBuf;
use std::sync::Mutex;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum EventFamily {
    VmRequests,
    VmLifecycle,
    Heartbeats,
    Resources,
    Vpn,
    Errors,
}

impl EventFamily {
    pub fn file_name(&self) -> &'static str {
        match self {
            EventFamily::VmRequests => "vm_requests.jsonl",
            EventFamily::VmLifecycle => "vm_lifecycle.jsonl",
            EventFamily::Heartbeats => "heartbeats.jsonl",
            EventFamily::Resources => "resources.jsonl",
            EventFamily::Vpn => "vpn.jsonl",
            EventFamily::Errors => "errors.jsonl",
        }
    }
}

pub struct EventLogger {
    log_dir: PathBuf,
    files: Mutex<HashMap<EventFamily, File>>,
}

impl EventLogger {
    pub fn new(log_dir: impl Into<PathBuf>) -> Self {
        Self {
            log_dir: log_dir.into(),
            files: Mutex::new(HashMap::new()),
        }
    }

    /// Append one event. `fields` must be a JSON object; a `timestamp` and
    /// the event name are injected into it.
    pub fn emit(&self, family: EventFamily, event: &str, fields: Value) {
        let mut record = json!({
            "timestamp": Utc::now().to_rfc3339(),
            "event": event,
        });
        if let (Some(record), Some(fields)) = (record.as_object_mut(), fields.as_object()) {
            for (key, value) in fields {
                record.insert(key.clone(), value.clone());
            }
        }

        let mut line = record.to_string();
        line.push('\n');

        let mut files = self.files.lock().unwrap();
        if !files.contains_key(&family) {
            match self.open(family) {
                Ok(file) => {
                    files.insert(family, file);
                }
                Err(e) => {
                    tracing::warn!(family = family.file_name(), error = %e, "cannot open event log");
                    return;
                }
            }
        }
        if let Some(file) = files.get_mut(&family) {
            if let Err(e) = file.write_all(line.as_bytes()) {
                tracing::warn!(family = family.file_name(), error = %e, "event write failed");
            }
        }
    }

    /// Shorthand for the errors family.
    pub fn error(&self, context: &str, message: &str) {
        self.emit(
            EventFamily::Errors,
            "error",
            json!({ "context": context, "message": message }),
        );
    }

    /// Close all handles. Later events reopen lazily.
    pub fn stop(&self) {
        self.files.lock().unwrap().clear();
    }

    fn open(&self, family: EventFamily) -> std::io::Result<File> {
        std::fs::create_dir_all(&self.log_dir)?;
        OpenOptions::new()
            .create(true)
            .append(true)
            .open(self.log_dir.join(family.file_name()))
    }
}
