//! One monitored run of the expensive operation.
//!
//! Each poll checks, in order:
//!
//! ```text
//!   target alive?  ── no ──> close crash reporter, Crashed
//!        │ yes
//!   sentinel in new log output? ── yes ──> Passed
//!        │ no
//!   CPU quiet past the grace window? ── yes ──> re-click trigger
//!        │
//!   sleep(poll interval)
//! ```
//!
//! A hang alone never produces a verdict.

use std::time::Duration;

use crashbisect_error::Result;
use tracing::{debug, info, warn};

use crate::clock::Clock;
use crate::freeze::{FreezeDecision, FreezePolicy};
use crate::host::TargetHost;
use crate::injector::{InputInjector, ScreenPos};
use crate::log_tail::LogTail;

#[derive(Debug, Clone, PartialEq)]
pub struct MonitorSettings {
    pub sentinel: String,
    pub poll_interval: Duration,
    pub cpu_threshold_pct: f64,
    pub max_hang: Duration,
    pub trigger_pos: ScreenPos,
    pub move_duration: Duration,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum MonitorOutcome {
    Passed { polls: u32, retries: u32 },
    Crashed { polls: u32 },
}

impl MonitorOutcome {
    #[must_use]
    pub const fn crashed(&self) -> bool {
        matches!(self, Self::Crashed { .. })
    }
}

fn trigger<I: InputInjector + ?Sized>(injector: &mut I, settings: &MonitorSettings) -> Result<()> {
    injector.move_to(settings.trigger_pos, settings.move_duration)?;
    injector.click(settings.trigger_pos)
}

/// Start the operation and watch it until it completes or the target dies.
///
/// # Errors
///
/// Fails only if the initial trigger cannot be delivered or the log cannot
/// be positioned; no verdict should be recorded in that case. Failed
/// retries and unreadable log polls are logged and the watch continues.
pub fn monitor_operation<H, I, C>(
    host: &mut H,
    injector: &mut I,
    clock: &C,
    tail: &mut LogTail,
    settings: &MonitorSettings,
) -> Result<MonitorOutcome>
where
    H: TargetHost + ?Sized,
    I: InputInjector + ?Sized,
    C: Clock + ?Sized,
{
    tail.seek_to_end()?;
    trigger(injector, settings)?;
    info!(
        log = %tail.path().display(),
        trigger = %settings.trigger_pos,
        "operation triggered; monitoring"
    );

    let mut freeze = FreezePolicy::new(settings.cpu_threshold_pct, settings.max_hang);
    let mut polls = 0u32;
    let mut retries = 0u32;
    loop {
        polls += 1;

        if !host.is_alive() {
            warn!(polls, "target is gone; treating as crash");
            host.close_crash_reporter();
            return Ok(MonitorOutcome::Crashed { polls });
        }

        match tail.poll(&settings.sentinel) {
            Ok(true) => {
                info!(polls, retries, "completion sentinel seen");
                return Ok(MonitorOutcome::Passed { polls, retries });
            }
            Ok(false) => {}
            Err(e) => debug!(error = %e, "log poll failed; will retry"),
        }

        let cpu = host.cpu_percent();
        match freeze.observe(clock.now(), cpu) {
            FreezeDecision::Progressing => debug!(polls, cpu, "target busy"),
            FreezeDecision::Quiet { elapsed } => {
                debug!(polls, cpu, quiet_secs = elapsed.as_secs(), "target quiet");
            }
            FreezeDecision::Hang { elapsed } => {
                retries += 1;
                warn!(
                    cpu,
                    quiet_secs = elapsed.as_secs(),
                    retries,
                    "target looks stalled; re-triggering operation"
                );
                if let Err(e) = trigger(injector, settings) {
                    warn!(error = %e, "re-trigger failed");
                }
            }
        }

        clock.sleep(settings.poll_interval);
    }
}
