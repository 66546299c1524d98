//! One engine invocation against a [`StateStore`]: load, step, persist,
//! export. This is what runs inside the target process each cycle.

use crashbisect_error::Result;
use tracing::info;

use crate::engine::{BisectionEngine, Checkpoint, StepOutcome};
use crate::provider::CandidateProvider;
use crate::store::StateStore;

/// Load the record and verdict from `store`, run one step and persist every
/// checkpoint. The verdict mailbox is cleared as soon as the verdict it held
/// has been folded into the record, and before a new chunk becomes active.
pub fn run_step<P>(
    store: &StateStore,
    engine: &BisectionEngine,
    provider: &mut P,
) -> Result<StepOutcome>
where
    P: CandidateProvider + ?Sized,
{
    let mut record = store.load_record();
    let verdict = store.read_verdict();
    info!(
        state_dir = %store.root().display(),
        initialized = record.initialized,
        finished = record.finished,
        outstanding = record.active_chunk.len(),
        ?verdict,
        "engine step starting"
    );

    let outcome = engine.step(&mut record, verdict, provider, |checkpoint, rec| {
        match checkpoint {
            Checkpoint::Resolved => {
                store.save_record(rec)?;
                store.clear_verdict()
            }
            Checkpoint::Initialized | Checkpoint::Selected => {
                store.clear_verdict()?;
                store.save_record(rec)
            }
            Checkpoint::Finished => store.save_record(rec),
        }
    })?;

    if let StepOutcome::Done { report } = &outcome {
        store.export_faults(report)?;
    }
    Ok(outcome)
}
