//! Diagnostics sink for unknown devices and binding trouble.
//!
//! Records are deduplicated by (kind, normalized fingerprint): seeing the same
//! unknown device a hundred times yields one record with `count == 100`.
//! The log can be persisted to JSON so unknown fingerprints survive restarts
//! and can be turned into profile entries later.

use crate::fingerprint::DeviceFingerprint;
use chrono::{DateTime, Utc};
use log::{debug, error, info, warn};
use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::fs;
use std::path::{Path, PathBuf};
use strum::{AsRefStr, Display};

#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, Serialize, Deserialize, Display, AsRefStr)]
#[serde(rename_all = "snake_case")]
#[strum(serialize_all = "snake_case")]
pub enum DiagnosticKind {
    UnmatchedFingerprint,
    AmbiguousMatch,
    BindDegraded,
    ClusterUnsupported,
    ValueRejected,
}

/// What happened, as passed to [`DiagnosticsSink::record`].
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct DiagnosticContext {
    pub kind: DiagnosticKind,
    pub detail: String,
}

impl DiagnosticContext {
    pub fn new(kind: DiagnosticKind, detail: impl Into<String>) -> Self {
        Self {
            kind,
            detail: detail.into(),
        }
    }
}

/// Append-only, best-effort diagnostics collaborator.
///
/// Implementations must not block for long and must never fail the caller.
pub trait DiagnosticsSink: Send + Sync {
    fn record(&self, fingerprint: &DeviceFingerprint, context: DiagnosticContext);
}

#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct DiagnosticRecord {
    pub kind: DiagnosticKind,
    pub fingerprint: String,
    pub manufacturer: String,
    pub model: String,
    pub first_seen: DateTime<Utc>,
    pub last_seen: DateTime<Utc>,
    pub count: u64,
    pub last_context: String,
}

/// Persisted diagnostics state
#[derive(Debug, Default, Clone, Serialize, Deserialize)]
struct PersistedDiagnostics {
    records: Vec<DiagnosticRecord>,
}

/// In-memory deduplicating sink.
#[derive(Debug, Default)]
pub struct DiagnosticLog {
    records: Mutex<HashMap<String, DiagnosticRecord>>,
}

impl DiagnosticLog {
    pub fn new() -> Self {
        Self::default()
    }

    fn key(kind: DiagnosticKind, fingerprint: &str) -> String {
        format!("{}:{}", kind.as_ref(), fingerprint)
    }

    /// Load from file; a missing or unreadable file yields an empty log.
    pub fn load(path: &Path) -> Self {
        let log = Self::new();
        match fs::read(path) {
            Ok(bytes) => match serde_json::from_slice::<PersistedDiagnostics>(&bytes) {
                Ok(state) => {
                    info!(
                        "[Diagnostics] Loaded {} record(s) from {}",
                        state.records.len(),
                        path.display()
                    );
                    let mut records = log.records.lock();
                    for record in state.records {
                        records.insert(Self::key(record.kind, &record.fingerprint), record);
                    }
                }
                Err(e) => warn!("[Diagnostics] Ignoring corrupt {}: {}", path.display(), e),
            },
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => {}
            Err(e) => error!("[Diagnostics] Failed to read {}: {}", path.display(), e),
        }
        log
    }

    /// Write all records to `path` as JSON.
    pub fn save(&self, path: &Path) -> std::io::Result<()> {
        if let Some(parent) = path.parent()
            && !parent.as_os_str().is_empty()
        {
            fs::create_dir_all(parent)?;
        }
        let state = PersistedDiagnostics {
            records: self.snapshot(),
        };
        let json = serde_json::to_vec_pretty(&state)?;
        let tmp = PathBuf::from(format!("{}.tmp", path.display()));
        fs::write(&tmp, json)?;
        fs::rename(&tmp, path)
    }

    /// All records, oldest first.
    pub fn snapshot(&self) -> Vec<DiagnosticRecord> {
        let mut records: Vec<_> = self.records.lock().values().cloned().collect();
        records.sort_by(|a, b| {
            a.first_seen
                .cmp(&b.first_seen)
                .then_with(|| a.fingerprint.cmp(&b.fingerprint))
        });
        records
    }

    pub fn records_of(&self, kind: DiagnosticKind) -> Vec<DiagnosticRecord> {
        self.snapshot().into_iter().filter(|r| r.kind == kind).collect()
    }

    pub fn len(&self) -> usize {
        self.records.lock().len()
    }

    pub fn is_empty(&self) -> bool {
        self.records.lock().is_empty()
    }
}

impl DiagnosticsSink for DiagnosticLog {
    fn record(&self, fingerprint: &DeviceFingerprint, context: DiagnosticContext) {
        let normalized = fingerprint.normalized_key();
        let key = Self::key(context.kind, &normalized);
        let now = Utc::now();

        let mut records = self.records.lock();
        match records.get_mut(&key) {
            Some(record) => {
                record.count += 1;
                record.last_seen = now;
                record.last_context = context.detail;
                debug!(
                    "[Diagnostics] {} seen again for {} (count {})",
                    context.kind, fingerprint, record.count
                );
            }
            None => {
                warn!(
                    "[Diagnostics] {} for {} [{}]: {}",
                    context.kind, fingerprint.node_id, fingerprint, context.detail
                );
                records.insert(
                    key,
                    DiagnosticRecord {
                        kind: context.kind,
                        fingerprint: normalized,
                        manufacturer: fingerprint.manufacturer.clone(),
                        model: fingerprint.model.clone(),
                        first_seen: now,
                        last_seen: now,
                        count: 1,
                        last_context: context.detail,
                    },
                );
            }
        }
    }
}
