//! Append-only diagnostics history.
//!
//! Recover records the failures it swallows here, and recipes use it for
//! their side-effect logging. Every change republishes the full history.

use crate::cflog;
use chrono::{DateTime, Utc};
use serde::Serialize;
use serde_json::Value;
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use tokio::sync::watch;

/// One `(message, payload)` pair.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct DiagnosticEntry {
    pub message: String,
    pub payload: Value,
    pub at: DateTime<Utc>,
}

impl std::fmt::Display for DiagnosticEntry {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}{}", self.message, self.payload)
    }
}

/// Shared diagnostics sink.
#[derive(Clone)]
pub struct Diagnostics {
    entries: Arc<Mutex<Vec<DiagnosticEntry>>>,
    updates: Arc<watch::Sender<Vec<DiagnosticEntry>>>,
}

impl Default for Diagnostics {
    fn default() -> Self {
        Self::new()
    }
}

impl Diagnostics {
    pub fn new() -> Self {
        let (updates, _) = watch::channel(Vec::new());
        Self {
            entries: Arc::new(Mutex::new(Vec::new())),
            updates: Arc::new(updates),
        }
    }

    /// Append an entry. Payloads that fail to serialize are kept as text.
    pub fn record<T: Serialize + std::fmt::Debug>(&self, message: impl Into<String>, payload: &T) {
        let payload = serde_json::to_value(payload)
            .unwrap_or_else(|_| Value::String(format!("{:?}", payload)));
        let entry = DiagnosticEntry {
            message: message.into(),
            payload,
            at: Utc::now(),
        };
        cflog!("diagnostics: {}", entry);

        let mut entries = self.lock();
        entries.push(entry);
        self.updates.send_replace(entries.clone());
    }

    /// Full history, oldest first.
    pub fn entries(&self) -> Vec<DiagnosticEntry> {
        self.lock().clone()
    }

    pub fn len(&self) -> usize {
        self.lock().len()
    }

    pub fn is_empty(&self) -> bool {
        self.lock().is_empty()
    }

    pub fn clear(&self) {
        let mut entries = self.lock();
        entries.clear();
        self.updates.send_replace(Vec::new());
    }

    /// Receive the full history after every change.
    pub fn subscribe(&self) -> watch::Receiver<Vec<DiagnosticEntry>> {
        self.updates.subscribe()
    }

    fn lock(&self) -> MutexGuard<'_, Vec<DiagnosticEntry>> {
        self.entries.lock().unwrap_or_else(PoisonError::into_inner)
    }
}

impl std::fmt::Debug for Diagnostics {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Diagnostics")
            .field("entries", &self.len())
            .finish()
    }
}
