//! Filesystem protocol shared by the engine and the supervisor.
//!
//! ```text
//! <state_dir>/
//!   isolation_record.json     : IsolationRecord (+ telemetry), engine-owned
//!   verdict.json              : { "crashed": bool }, supervisor-owned
//!   crashing_candidates.txt   : fault export, written once finished
//! ```
//!
//! Documents are replaced whole (temp file + rename). There is no locking:
//! the cycle protocol guarantees the two processes never write the same
//! document concurrently. A record that cannot be read back is treated as
//! missing.

use std::fs;
use std::path::{Path, PathBuf};

use crashbisect_error::{BisectError, Result};
use serde::{Deserialize, Serialize};
use tracing::{info, warn};

use crate::fsio::{remove_if_exists, write_atomic};
use crate::record::{IsolationRecord, RECORD_SCHEMA_VERSION, RecordTelemetry};
use crate::report::FaultReport;
use crate::verdict::{Verdict, VerdictRecord};

pub const RECORD_FILE: &str = "isolation_record.json";
pub const VERDICT_FILE: &str = "verdict.json";
pub const FAULT_EXPORT_FILE: &str = "crashing_candidates.txt";

/// Progress snapshot for control surfaces.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "state", rename_all = "snake_case")]
pub enum ProgressView {
    /// No record yet: the first step has not run.
    NotStarted,
    /// Record exists but could not be read.
    Unreadable { detail: String },
    Tracking {
        #[serde(flatten)]
        telemetry: RecordTelemetry,
        candidates: usize,
        finished: bool,
        faults: Vec<String>,
    },
}

impl ProgressView {
    /// One-line rendering for logs and terminals.
    #[must_use]
    pub fn render_line(&self) -> String {
        match self {
            Self::NotStarted => "waiting for first run".to_owned(),
            Self::Unreadable { detail } => format!("isolation record unreadable: {detail}"),
            Self::Tracking {
                telemetry,
                finished,
                faults,
                ..
            } => {
                let done = telemetry.chunks_completed;
                let total = telemetry.all_chunks;
                if *finished {
                    format!(
                        "finished: {done}/{total} classified, {} crashing candidate(s)",
                        faults.len()
                    )
                } else {
                    format!(
                        "chunks: {done}/{total} (left: {}, current chunk: {})",
                        total.saturating_sub(done),
                        telemetry.current_chunk_size
                    )
                }
            }
        }
    }
}

/// Handle on a state directory.
#[derive(Debug, Clone)]
pub struct StateStore {
    root: PathBuf,
}

impl StateStore {
    pub fn new(root: impl Into<PathBuf>) -> Self {
        Self { root: root.into() }
    }

    /// Create the state directory if needed.
    pub fn open(root: impl Into<PathBuf>) -> Result<Self> {
        let store = Self::new(root);
        fs::create_dir_all(&store.root)?;
        Ok(store)
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    pub fn record_path(&self) -> PathBuf {
        self.root.join(RECORD_FILE)
    }

    pub fn verdict_path(&self) -> PathBuf {
        self.root.join(VERDICT_FILE)
    }

    pub fn fault_export_path(&self) -> PathBuf {
        self.root.join(FAULT_EXPORT_FILE)
    }

    // ─── Isolation record ───────────────────────────────────────────────

    /// Strict read: `Ok(None)` when absent, `Err` when unreadable.
    pub fn try_load_record(&self) -> Result<Option<IsolationRecord>> {
        let path = self.record_path();
        let bytes = match fs::read(&path) {
            Ok(bytes) => bytes,
            Err(err) if err.kind() == std::io::ErrorKind::NotFound => return Ok(None),
            Err(err) => return Err(err.into()),
        };
        let record: IsolationRecord = serde_json::from_slice(&bytes)
            .map_err(|err| BisectError::corrupt(format!("{}: {err}", path.display())))?;
        if record.schema_version > RECORD_SCHEMA_VERSION {
            return Err(BisectError::SchemaVersion {
                expected: RECORD_SCHEMA_VERSION,
                found: record.schema_version,
            });
        }
        record.check_invariants().map_err(BisectError::corrupt)?;
        Ok(Some(record))
    }

    /// Fail-open read: a missing or corrupt record yields a fresh one.
    pub fn load_record(&self) -> IsolationRecord {
        match self.try_load_record() {
            Ok(Some(record)) => record,
            Ok(None) => IsolationRecord::default(),
            Err(err) => {
                warn!(
                    path = %self.record_path().display(),
                    error = %err,
                    "isolation record unreadable; starting from a fresh record"
                );
                IsolationRecord::default()
            }
        }
    }

    pub fn save_record(&self, record: &IsolationRecord) -> Result<()> {
        let json = record.to_document_json()?;
        write_atomic(&self.record_path(), json.as_bytes())
    }

    /// Whether the persisted record says isolation is complete.
    pub fn is_finished(&self) -> bool {
        matches!(self.try_load_record(), Ok(Some(record)) if record.finished)
    }

    // ─── Verdict mailbox ────────────────────────────────────────────────

    /// Read the mailbox. Missing or unparseable yields [`Verdict::Unknown`].
    pub fn read_verdict(&self) -> Verdict {
        let path = self.verdict_path();
        let bytes = match fs::read(&path) {
            Ok(bytes) => bytes,
            Err(err) => {
                if err.kind() != std::io::ErrorKind::NotFound {
                    warn!(path = %path.display(), error = %err, "verdict mailbox unreadable");
                }
                return Verdict::Unknown;
            }
        };
        match serde_json::from_slice::<VerdictRecord>(&bytes) {
            Ok(record) => record.verdict(),
            Err(err) => {
                warn!(path = %path.display(), error = %err, "could not parse verdict mailbox");
                Verdict::Unknown
            }
        }
    }

    pub fn write_verdict(&self, crashed: bool) -> Result<()> {
        let path = self.verdict_path();
        let json = serde_json::to_vec(&VerdictRecord::new(crashed))?;
        write_atomic(&path, &json)?;
        info!(path = %path.display(), crashed, "verdict written");
        Ok(())
    }

    pub fn clear_verdict(&self) -> Result<()> {
        remove_if_exists(&self.verdict_path())?;
        Ok(())
    }

    // ─── Fault export / operator actions ────────────────────────────────

    pub fn export_faults(&self, report: &FaultReport) -> Result<PathBuf> {
        let path = self.fault_export_path();
        write_atomic(&path, report.render_export().as_bytes())?;
        info!(path = %path.display(), faults = report.len(), "crashing candidates exported");
        Ok(path)
    }

    pub fn read_fault_export(&self) -> Option<String> {
        fs::read_to_string(self.fault_export_path()).ok()
    }

    /// Discard isolation progress. Returns whether a record was removed.
    pub fn reset(&self) -> Result<bool> {
        let removed = remove_if_exists(&self.record_path())?;
        remove_if_exists(&self.verdict_path())?;
        remove_if_exists(&self.fault_export_path())?;
        if removed {
            info!(path = %self.record_path().display(), "isolation record deleted");
        } else {
            info!(path = %self.record_path().display(), "no isolation record to delete");
        }
        Ok(removed)
    }

    /// Progress counters and, once finished, the fault list.
    pub fn progress(&self) -> ProgressView {
        match self.try_load_record() {
            Ok(None) => ProgressView::NotStarted,
            Err(err) => ProgressView::Unreadable {
                detail: err.to_string(),
            },
            Ok(Some(record)) => {
                let faults = if record.finished {
                    FaultReport::build(&record, str::to_owned)
                        .entries
                        .into_iter()
                        .map(|e| e.id)
                        .collect()
                } else {
                    Vec::new()
                };
                ProgressView::Tracking {
                    telemetry: record.telemetry(),
                    candidates: record.candidates.len(),
                    finished: record.finished,
                    faults,
                }
            }
        }
    }
}
