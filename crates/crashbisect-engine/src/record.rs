//! Persisted isolation record: the single source of truth shared by the
//! engine (inside the target process) and the supervisor (control process).
//!
//! The record is read and overwritten as a whole document. Telemetry fields
//! are recomputed on every write and ignored on read.

use std::collections::{BTreeSet, HashMap};
use std::fmt;

use serde::{Deserialize, Serialize};

/// Schema version written into every persisted record.
pub const RECORD_SCHEMA_VERSION: u32 = 1;

/// Opaque identifier of one candidate in the universe under test.
pub type CandidateId = String;

/// Half-open index range `[start, end)` into [`IsolationRecord::candidates`].
///
/// Persisted as a two-element array `[start, end]`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(from = "[usize; 2]", into = "[usize; 2]")]
pub struct IndexRange {
    pub start: usize,
    pub end: usize,
}

impl IndexRange {
    #[must_use]
    pub const fn new(start: usize, end: usize) -> Self {
        Self { start, end }
    }

    #[must_use]
    pub const fn len(self) -> usize {
        self.end.saturating_sub(self.start)
    }

    #[must_use]
    pub const fn is_empty(self) -> bool {
        self.end <= self.start
    }

    /// Midpoint used to split a crashing chunk in two.
    #[must_use]
    pub const fn midpoint(self) -> usize {
        self.start + (self.end - self.start) / 2
    }
}

impl From<[usize; 2]> for IndexRange {
    fn from(pair: [usize; 2]) -> Self {
        Self::new(pair[0], pair[1])
    }
}

impl From<IndexRange> for [usize; 2] {
    fn from(range: IndexRange) -> Self {
        [range.start, range.end]
    }
}

impl fmt::Display for IndexRange {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "[{}, {})", self.start, self.end)
    }
}

/// Isolation progress for one session.
///
/// `pending_ranges` is a stack: the next range to test is the *last* element.
/// A non-empty `active_chunk` means a verdict is owed for that chunk.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct IsolationRecord {
    pub schema_version: u32,
    pub candidates: Vec<CandidateId>,
    pub confirmed_good: BTreeSet<CandidateId>,
    pub confirmed_bad: BTreeSet<CandidateId>,
    pub pending_ranges: Vec<IndexRange>,
    pub active_chunk: Vec<CandidateId>,
    pub initialized: bool,
    pub finished: bool,
}

impl Default for IsolationRecord {
    fn default() -> Self {
        Self {
            schema_version: RECORD_SCHEMA_VERSION,
            candidates: Vec::new(),
            confirmed_good: BTreeSet::new(),
            confirmed_bad: BTreeSet::new(),
            pending_ranges: Vec::new(),
            active_chunk: Vec::new(),
            initialized: false,
            finished: false,
        }
    }
}

impl IsolationRecord {
    /// Whether `id` already carries a good or bad classification.
    #[must_use]
    pub fn is_classified(&self, id: &str) -> bool {
        self.confirmed_good.contains(id) || self.confirmed_bad.contains(id)
    }

    /// Number of candidates classified so far.
    #[must_use]
    pub fn classified_count(&self) -> usize {
        self.confirmed_good.len() + self.confirmed_bad.len()
    }

    /// Whether a verdict is owed for an in-flight chunk.
    #[must_use]
    pub fn awaiting_verdict(&self) -> bool {
        !self.active_chunk.is_empty()
    }

    /// Map from candidate id to its first index in `candidates`.
    #[must_use]
    pub fn index_map(&self) -> HashMap<&str, usize> {
        let mut map = HashMap::with_capacity(self.candidates.len());
        for (idx, id) in self.candidates.iter().enumerate() {
            map.entry(id.as_str()).or_insert(idx);
        }
        map
    }

    /// Derived counters written alongside the record.
    #[must_use]
    pub fn telemetry(&self) -> RecordTelemetry {
        let chunks_remaining = self.pending_ranges.len() + usize::from(self.awaiting_verdict());
        let chunks_completed = self.classified_count();
        RecordTelemetry {
            chunks_remaining,
            chunks_completed,
            all_chunks: chunks_remaining + chunks_completed,
            current_chunk_size: self.active_chunk.len(),
        }
    }

    /// Check the structural invariants of the record.
    ///
    /// Returns a description of the first violation found. Active members
    /// that no longer map into `candidates` are not a violation; the engine
    /// drops such members when the chunk's verdict comes in.
    pub fn check_invariants(&self) -> Result<(), String> {
        let len = self.candidates.len();
        if !self.initialized
            && (!self.pending_ranges.is_empty() || !self.active_chunk.is_empty() || self.finished)
        {
            return Err("uninitialized record carries progress".to_owned());
        }
        for range in &self.pending_ranges {
            if range.start > range.end || range.end > len {
                return Err(format!("pending range {range} outside [0, {len})"));
            }
        }
        if let Some(id) = self.confirmed_good.intersection(&self.confirmed_bad).next() {
            return Err(format!("candidate {id} is both good and bad"));
        }
        if self.finished && (!self.pending_ranges.is_empty() || !self.active_chunk.is_empty()) {
            return Err("finished record still has pending work".to_owned());
        }
        Ok(())
    }

    /// Render the persisted JSON document, telemetry included.
    pub fn to_document_json(&self) -> serde_json::Result<String> {
        serde_json::to_string_pretty(&RecordDocument {
            record: self,
            telemetry: self.telemetry(),
        })
    }
}

/// Read-only counters recomputed on every write, for progress displays.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct RecordTelemetry {
    pub chunks_remaining: usize,
    pub chunks_completed: usize,
    pub all_chunks: usize,
    pub current_chunk_size: usize,
}

#[derive(Serialize)]
struct RecordDocument<'a> {
    #[serde(flatten)]
    record: &'a IsolationRecord,
    #[serde(flatten)]
    telemetry: RecordTelemetry,
}
