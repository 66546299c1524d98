//! Bisection engine: pure state transitions over an [`IsolationRecord`].
//!
//! One call to [`BisectionEngine::step`] happens per test cycle, inside the
//! target process. The call folds the verdict for the outstanding chunk into
//! the range stack, then picks and isolates the next chunk.
//!
//! ```text
//!  step(record, verdict)
//!    ├── finished?          → Done(report)
//!    ├── !initialized?      → capture universe, seed ranges → Initialized
//!    ├── resolve_outstanding(verdict)
//!    │     ├── Unknown      → AwaitingVerdict(same chunk)
//!    │     ├── Passed       → chunk → confirmed_good
//!    │     ├── Crashed, 1   → id → confirmed_bad
//!    │     └── Crashed, >1  → push [mid,end), [start,mid)
//!    │   persist(Resolved)
//!    └── select_next()
//!          ├── chunk        → persist(Selected), isolate → Testing(chunk)
//!          └── exhausted    → finished, persist(Finished) → Done(report)
//! ```
//!
//! Every mutation is handed to the `persist` callback before any effect on
//! the live environment, so a crash inside the target loses at most the
//! in-flight verdict, never a committed classification.
//!
//! A passing chunk exonerates every member. That holds for faults that
//! trigger on their own; a fault that needs two candidates present together
//! is only found when both land in the same chunk.

use std::collections::HashSet;

use crashbisect_error::Result;
use serde::{Deserialize, Serialize};
use tracing::{debug, error, info, warn};

use crate::provider::CandidateProvider;
use crate::record::{CandidateId, IndexRange, IsolationRecord};
use crate::report::FaultReport;
use crate::verdict::Verdict;

/// Number of pieces the universe is split into on initialization.
pub const DEFAULT_CHUNK_COUNT: usize = 10;

// ---------------------------------------------------------------------------
// Outcomes
// ---------------------------------------------------------------------------

/// Points at which the engine hands the record to its persistence callback.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Checkpoint {
    /// Universe captured and ranges seeded.
    Initialized,
    /// Outstanding verdict folded into the record.
    Resolved,
    /// New chunk recorded as active, before it is isolated.
    Selected,
    /// Range stack exhausted; record marked finished.
    Finished,
}

/// What happened to the outstanding chunk.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Resolution {
    /// No chunk was in flight.
    NothingOutstanding,
    /// Verdict unknown; the chunk stays active.
    Abstained,
    /// Chunk passed; `exonerated` members moved to `confirmed_good`.
    Passed { exonerated: usize },
    /// Single-member chunk crashed.
    ConfirmedBad { id: CandidateId },
    /// Multi-member chunk crashed and was split in two.
    Split {
        lower: IndexRange,
        upper: IndexRange,
    },
    /// Chunk members could not be located in the universe; chunk dropped
    /// without classification.
    IndexMappingFailed { dropped: usize },
}

/// Result of one engine step.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum StepOutcome {
    /// First call: universe captured, no chunk isolated yet.
    Initialized { candidates: usize, ranges: usize },
    /// Verdict unknown: the same chunk is still under test.
    AwaitingVerdict { chunk: Vec<CandidateId> },
    /// A new chunk is isolated and ready for the long operation.
    Testing { chunk: Vec<CandidateId> },
    /// Every candidate is classified.
    Done { report: FaultReport },
}

impl StepOutcome {
    /// Chunk under test after this step, if any.
    #[must_use]
    pub fn chunk(&self) -> Option<&[CandidateId]> {
        match self {
            Self::AwaitingVerdict { chunk } | Self::Testing { chunk } => Some(chunk),
            Self::Initialized { .. } | Self::Done { .. } => None,
        }
    }

    #[must_use]
    pub const fn is_done(&self) -> bool {
        matches!(self, Self::Done { .. })
    }
}

// ---------------------------------------------------------------------------
// Pure transitions
// ---------------------------------------------------------------------------

/// Split `[0, len)` into `chunk_count` contiguous ranges of `len / pieces`
/// each, the last one absorbing the remainder. Returned in ascending order.
#[must_use]
pub fn partition(len: usize, chunk_count: usize) -> Vec<IndexRange> {
    if len == 0 {
        return Vec::new();
    }
    let pieces = chunk_count.clamp(1, len);
    let size = len / pieces;
    (0..pieces)
        .map(|i| {
            let start = i * size;
            let end = if i + 1 == pieces { len } else { start + size };
            IndexRange::new(start, end)
        })
        .collect()
}

/// Capture the candidate universe and seed the range stack so that the
/// lowest range is tested first.
pub fn seed(record: &mut IsolationRecord, universe: Vec<CandidateId>, chunk_count: usize) {
    let mut seen = HashSet::with_capacity(universe.len());
    let original_len = universe.len();
    let candidates: Vec<CandidateId> = universe
        .into_iter()
        .filter(|id| seen.insert(id.clone()))
        .collect();
    if candidates.len() != original_len {
        warn!(
            duplicates = original_len - candidates.len(),
            "duplicate candidate ids dropped from universe"
        );
    }

    let mut ranges = partition(candidates.len(), chunk_count);
    ranges.reverse();

    record.candidates = candidates;
    record.pending_ranges = ranges;
    record.active_chunk.clear();
    record.initialized = true;
    record.finished = false;
}

/// Fold `verdict` into the record for the chunk currently under test.
pub fn resolve_outstanding(record: &mut IsolationRecord, verdict: Verdict) -> Resolution {
    if record.active_chunk.is_empty() {
        return Resolution::NothingOutstanding;
    }

    match verdict {
        Verdict::Unknown => {
            warn!(
                chunk_size = record.active_chunk.len(),
                "could not determine crash status; chunk stays active"
            );
            Resolution::Abstained
        }
        Verdict::Passed => {
            let chunk = std::mem::take(&mut record.active_chunk);
            let exonerated = chunk.len();
            for id in chunk {
                classify(record, id, false);
            }
            info!(exonerated, "chunk passed");
            Resolution::Passed { exonerated }
        }
        Verdict::Crashed => {
            let chunk = std::mem::take(&mut record.active_chunk);
            let Some(range) = chunk_range(record, &chunk) else {
                error!(
                    dropped = chunk.len(),
                    "index mapping failed; chunk skipped without classification"
                );
                return Resolution::IndexMappingFailed {
                    dropped: chunk.len(),
                };
            };
            if let [id] = chunk.as_slice() {
                warn!(candidate = %id, "crash confirmed");
                classify(record, id.clone(), true);
                return Resolution::ConfirmedBad { id: id.clone() };
            }
            let mid = range.midpoint();
            let upper = IndexRange::new(mid, range.end);
            let lower = IndexRange::new(range.start, mid);
            for half in [upper, lower] {
                if !half.is_empty() {
                    record.pending_ranges.push(half);
                }
            }
            warn!(%range, %lower, %upper, "crash detected; chunk split in two");
            Resolution::Split { lower, upper }
        }
    }
}

/// Pop ranges until one still holds unclassified candidates and make it the
/// active chunk. Marks the record finished when the stack runs dry.
pub fn select_next(record: &mut IsolationRecord) -> Option<Vec<CandidateId>> {
    let len = record.candidates.len();
    while let Some(range) = record.pending_ranges.pop() {
        let end = range.end.min(len);
        let start = range.start.min(end);
        let chunk: Vec<CandidateId> = record.candidates[start..end]
            .iter()
            .filter(|id| !record.is_classified(id))
            .cloned()
            .collect();
        if chunk.is_empty() {
            debug!(%range, "range fully classified; skipping");
            continue;
        }
        record.active_chunk.clone_from(&chunk);
        return Some(chunk);
    }
    record.active_chunk.clear();
    record.finished = true;
    None
}

/// Smallest index range covering every locatable member of `chunk`.
fn chunk_range(record: &IsolationRecord, chunk: &[CandidateId]) -> Option<IndexRange> {
    let index = record.index_map();
    let mut positions = chunk.iter().filter_map(|id| index.get(id.as_str()).copied());
    let first = positions.next()?;
    let (min, max) = positions.fold((first, first), |(lo, hi), p| (lo.min(p), hi.max(p)));
    Some(IndexRange::new(min, max + 1))
}

/// Classify `id` unless it already carries a classification.
fn classify(record: &mut IsolationRecord, id: CandidateId, bad: bool) {
    if record.is_classified(&id) {
        debug!(candidate = %id, "candidate already classified; keeping first verdict");
        return;
    }
    if bad {
        record.confirmed_bad.insert(id);
    } else {
        record.confirmed_good.insert(id);
    }
}

// ---------------------------------------------------------------------------
// Engine
// ---------------------------------------------------------------------------

/// Drives one isolation cycle against a [`CandidateProvider`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct BisectionEngine {
    chunk_count: usize,
}

impl Default for BisectionEngine {
    fn default() -> Self {
        Self::new(DEFAULT_CHUNK_COUNT)
    }
}

impl BisectionEngine {
    #[must_use]
    pub fn new(chunk_count: usize) -> Self {
        Self {
            chunk_count: chunk_count.max(1),
        }
    }

    #[must_use]
    pub const fn chunk_count(&self) -> usize {
        self.chunk_count
    }

    /// Run one step. `persist` is called with the record after every
    /// mutation and must make it durable before returning `Ok`.
    pub fn step<P, F>(
        &self,
        record: &mut IsolationRecord,
        verdict: Verdict,
        provider: &mut P,
        mut persist: F,
    ) -> Result<StepOutcome>
    where
        P: CandidateProvider + ?Sized,
        F: FnMut(Checkpoint, &IsolationRecord) -> Result<()>,
    {
        if record.finished {
            info!("all chunks tested; isolation already finished");
            let report = FaultReport::build(record, |id| provider.resolve_label(id));
            return Ok(StepOutcome::Done { report });
        }

        if !record.initialized {
            let universe = provider.list_candidates()?;
            seed(record, universe, self.chunk_count);
            persist(Checkpoint::Initialized, record)?;
            info!(
                candidates = record.candidates.len(),
                ranges = record.pending_ranges.len(),
                "first run complete; universe captured, awaiting first test cycle"
            );
            return Ok(StepOutcome::Initialized {
                candidates: record.candidates.len(),
                ranges: record.pending_ranges.len(),
            });
        }

        match resolve_outstanding(record, verdict) {
            Resolution::Abstained => {
                let chunk = record.active_chunk.clone();
                provider.remove_all_except(&chunk)?;
                return Ok(StepOutcome::AwaitingVerdict { chunk });
            }
            Resolution::NothingOutstanding => {}
            resolution => {
                debug!(?resolution, "outstanding chunk resolved");
                persist(Checkpoint::Resolved, record)?;
            }
        }

        if let Some(chunk) = select_next(record) {
            persist(Checkpoint::Selected, record)?;
            provider.remove_all_except(&chunk)?;
            info!(
                chunk_size = chunk.len(),
                remaining_ranges = record.pending_ranges.len(),
                "testing chunk; ready for the long operation"
            );
            for id in &chunk {
                debug!(candidate = %id, label = %provider.resolve_label(id), "chunk member");
            }
            return Ok(StepOutcome::Testing { chunk });
        }

        persist(Checkpoint::Finished, record)?;
        let report = FaultReport::build(record, |id| provider.resolve_label(id));
        info!(
            faults = report.len(),
            "all chunks tested; crashing candidates isolated"
        );
        Ok(StepOutcome::Done { report })
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------
