//! Crash-isolation bisection engine and the filesystem protocol it shares
//! with the supervisor.
//!
//! - [`record`]: the persisted [`IsolationRecord`] and its invariants.
//! - [`verdict`]: the single-slot verdict mailbox.
//! - [`engine`]: pure step logic ([`BisectionEngine`]).
//! - [`store`]: on-disk layout ([`StateStore`]).
//! - [`provider`]: the candidate enumeration seam.
//! - [`runner`]: one full engine invocation against a store.

mod fsio;

pub mod engine;
pub mod provider;
pub mod record;
pub mod report;
pub mod runner;
pub mod store;
pub mod verdict;

pub use engine::{BisectionEngine, Checkpoint, DEFAULT_CHUNK_COUNT, Resolution, StepOutcome};
pub use provider::{CandidateProvider, ManifestEntry, ManifestProvider};
pub use record::{CandidateId, IndexRange, IsolationRecord, RECORD_SCHEMA_VERSION};
pub use report::{FaultEntry, FaultReport};
pub use runner::run_step;
pub use store::{ProgressView, StateStore};
pub use verdict::{Verdict, VerdictRecord};
