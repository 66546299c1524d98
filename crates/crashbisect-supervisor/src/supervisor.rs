//! The supervisor control loop.
//!
//! One cycle:
//!
//! ```text
//!   [stop requested?] ──> Stopped
//!   [record finished?] ──> Finished
//!   Launching            (skipped when the previous cycle left a healthy,
//!        │                freshly reloaded target)
//!   TriggeringStep       run one engine step inside the target
//!        │
//!   MonitoringOperation  watch liveness, log and CPU
//!        ├── Crashed ──> write {"crashed": true}, relaunch next cycle
//!        └── Passed  ──> write {"crashed": false}
//!                          │
//!                    ReloadingTarget ──> reuse the target next cycle
//! ```
//!
//! Exactly one verdict is written per monitored operation, and only after
//! the operation ends. Stop requests are honoured at cycle boundaries, so a
//! verdict for a finished operation is never lost.

use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use std::thread::{self, JoinHandle};
use std::time::Duration;

use crashbisect_engine::report::FAULT_EXPORT_HEADER;
use crashbisect_engine::{ProgressView, StateStore, Verdict};
use crashbisect_error::{BisectError, Result};
use parking_lot::Mutex;
use serde::Serialize;
use tracing::{error, info, warn};

use crate::clock::Clock;
use crate::config::SupervisorConfig;
use crate::host::TargetHost;
use crate::injector::{InputInjector, ScreenPos};
use crate::log_tail::LogTail;
use crate::monitor::{MonitorSettings, monitor_operation};

/// Consecutive launch failures tolerated before the supervisor gives up.
pub const MAX_LAUNCH_FAILURES: u32 = 3;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum SupervisorPhase {
    Idle,
    Launching,
    TriggeringStep,
    MonitoringOperation,
    Passed,
    Crashed,
    ReloadingTarget,
    Finished,
    Stopped,
}

/// Cooperative stop flag shared between the loop and its controller.
#[derive(Debug, Clone, Default)]
pub struct StopToken(Arc<AtomicBool>);

impl StopToken {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    pub fn request_stop(&self) {
        self.0.store(true, Ordering::SeqCst);
    }

    #[must_use]
    pub fn is_stop_requested(&self) -> bool {
        self.0.load(Ordering::SeqCst)
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct SupervisorStatus {
    pub phase: SupervisorPhase,
    pub cycle: u64,
    pub progress: ProgressView,
    pub last_verdict: Option<bool>,
    pub faults: Vec<String>,
}

impl Default for SupervisorStatus {
    fn default() -> Self {
        Self {
            phase: SupervisorPhase::Idle,
            cycle: 0,
            progress: ProgressView::NotStarted,
            last_verdict: None,
            faults: Vec::new(),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum SupervisorExit {
    /// Every candidate is classified; `faults` lists the crashing ones.
    Finished { faults: Vec<String> },
    Stopped,
}

/// Focus the target's console, type `text` and submit it.
fn send_console_command<I, C>(
    injector: &mut I,
    clock: &C,
    console: ScreenPos,
    settle: Duration,
    text: &str,
) -> Result<()>
where
    I: InputInjector + ?Sized,
    C: Clock + ?Sized,
{
    injector.click(console)?;
    clock.sleep(settle);
    injector.type_text(text)?;
    injector.press_enter()
}

pub struct Supervisor<H, I, C> {
    config: SupervisorConfig,
    store: StateStore,
    host: H,
    injector: I,
    clock: C,
    tail: LogTail,
    stop: StopToken,
    status: Arc<Mutex<SupervisorStatus>>,
}

impl<H, I, C> Supervisor<H, I, C>
where
    H: TargetHost,
    I: InputInjector,
    C: Clock,
{
    /// # Errors
    ///
    /// Invalid configuration, or a state directory that cannot be created.
    pub fn new(config: SupervisorConfig, host: H, injector: I, clock: C) -> Result<Self> {
        config.validate()?;
        let store = StateStore::open(&config.protocol.state_dir)?;
        let tail = LogTail::new(config.target.log_path.clone());
        Ok(Self {
            config,
            store,
            host,
            injector,
            clock,
            tail,
            stop: StopToken::new(),
            status: Arc::new(Mutex::new(SupervisorStatus::default())),
        })
    }

    #[must_use]
    pub fn stop_token(&self) -> StopToken {
        self.stop.clone()
    }

    #[must_use]
    pub fn status(&self) -> SupervisorStatus {
        self.status.lock().clone()
    }

    #[must_use]
    pub const fn store(&self) -> &StateStore {
        &self.store
    }

    fn monitor_settings(&self) -> MonitorSettings {
        let timing = &self.config.timing;
        MonitorSettings {
            sentinel: self.config.target.completion_sentinel.clone(),
            poll_interval: timing.poll_interval(),
            cpu_threshold_pct: timing.cpu_freeze_threshold_pct,
            max_hang: timing.max_hang(),
            trigger_pos: self.config.input.trigger_pos,
            move_duration: timing.move_duration(),
        }
    }

    fn set_phase(&self, phase: SupervisorPhase) {
        let cycle = {
            let mut status = self.status.lock();
            status.phase = phase;
            status.cycle
        };
        info!(?phase, cycle, "supervisor phase");
    }

    fn publish_progress(&self) {
        let progress = self.store.progress();
        info!(progress = %progress.render_line(), "isolation progress");
        let mut status = self.status.lock();
        if let ProgressView::Tracking { faults, .. } = &progress {
            status.faults.clone_from(faults);
        }
        status.progress = progress;
    }

    fn wait(&self, what: &str, duration: Duration) {
        info!(what, secs = duration.as_secs(), "waiting");
        self.clock.sleep(duration);
    }

    fn console(&mut self, text: &str) -> Result<()> {
        send_console_command(
            &mut self.injector,
            &self.clock,
            self.config.input.console_pos,
            self.config.timing.console_settle(),
            text,
        )
    }

    fn launch(&mut self) -> Result<()> {
        self.set_phase(SupervisorPhase::Launching);
        if self.host.is_alive() {
            info!("terminating running target before relaunch");
            self.host.terminate();
        }
        self.host.launch()?;
        self.wait("target startup", self.config.timing.initial_delay());
        Ok(())
    }

    fn trigger_step(&mut self) -> Result<()> {
        self.set_phase(SupervisorPhase::TriggeringStep);
        let command = self.config.render_step_command();
        self.console(&command)?;
        self.wait("engine step", self.config.timing.step_delay());
        Ok(())
    }

    fn reload(&mut self) -> Result<()> {
        self.set_phase(SupervisorPhase::ReloadingTarget);
        let reload = &self.config.reload;
        let path = reload.path_rule().normalize(&reload.target_path)?;
        let command = reload.render_command(&path);
        info!(%path, "reloading target scene");
        self.console(&command)?;
        self.wait("reload", self.config.timing.post_reload_delay());
        Ok(())
    }

    /// Labels of crashing candidates, preferring the exported report.
    fn fault_labels(&self) -> Vec<String> {
        if let Some(export) = self.store.read_fault_export() {
            return export
                .lines()
                .filter(|line| *line != FAULT_EXPORT_HEADER && !line.trim().is_empty())
                .map(str::to_owned)
                .collect();
        }
        match self.store.progress() {
            ProgressView::Tracking { faults, .. } => faults,
            _ => Vec::new(),
        }
    }

    fn finish(&self) -> SupervisorExit {
        self.set_phase(SupervisorPhase::Finished);
        self.publish_progress();
        let faults = self.fault_labels();
        info!(count = faults.len(), "isolation finished");
        for fault in &faults {
            info!(candidate = %fault, "crashing candidate");
        }
        self.status.lock().faults.clone_from(&faults);
        SupervisorExit::Finished { faults }
    }

    /// Run cycles until the record is finished or a stop is requested.
    ///
    /// # Errors
    ///
    /// Writing the verdict fails, a step or trigger fails with an error that
    /// is not [transient](BisectError::is_transient), or the target cannot be
    /// launched [`MAX_LAUNCH_FAILURES`] times in a row. Every other failure
    /// is logged and answered with a fresh launch on the next cycle.
    pub fn run(&mut self) -> Result<SupervisorExit> {
        info!(
            state_dir = %self.store.root().display(),
            log = %self.tail.path().display(),
            "supervisor starting"
        );
        self.set_phase(SupervisorPhase::Idle);
        self.publish_progress();

        let resumed_after_crash = self.store.read_verdict() == Verdict::Crashed;
        let mut skip_launch = !resumed_after_crash && self.host.is_alive();
        if skip_launch {
            info!("target already running; attaching to it");
        }
        let mut launch_failures = 0u32;

        loop {
            if self.stop.is_stop_requested() {
                info!("stop requested; halting at cycle boundary");
                self.set_phase(SupervisorPhase::Stopped);
                return Ok(SupervisorExit::Stopped);
            }
            if self.store.is_finished() {
                return Ok(self.finish());
            }
            self.status.lock().cycle += 1;

            if !skip_launch {
                match self.launch() {
                    Ok(()) => launch_failures = 0,
                    Err(e) => {
                        launch_failures += 1;
                        error!(error = %e, attempt = launch_failures, "target launch failed");
                        if launch_failures >= MAX_LAUNCH_FAILURES {
                            self.set_phase(SupervisorPhase::Stopped);
                            return Err(e);
                        }
                        self.clock.sleep(self.config.timing.poll_interval());
                        continue;
                    }
                }
            }
            // Anything that fails from here on forces a relaunch.
            skip_launch = false;

            if let Err(e) = self.trigger_step() {
                error!(error = %e, "could not trigger engine step");
                if !e.is_transient() {
                    self.set_phase(SupervisorPhase::Stopped);
                    return Err(e);
                }
                continue;
            }
            self.publish_progress();

            let record = self.store.load_record();
            if record.finished {
                continue;
            }
            if record.active_chunk.is_empty() {
                info!("no chunk under test yet; stepping again");
                skip_launch = self.host.is_alive();
                continue;
            }
            info!(chunk_size = record.active_chunk.len(), "testing chunk");

            self.set_phase(SupervisorPhase::MonitoringOperation);
            let settings = self.monitor_settings();
            let outcome = match monitor_operation(
                &mut self.host,
                &mut self.injector,
                &self.clock,
                &mut self.tail,
                &settings,
            ) {
                Ok(outcome) => outcome,
                Err(e) => {
                    error!(error = %e, "operation could not be started");
                    if !e.is_transient() {
                        self.set_phase(SupervisorPhase::Stopped);
                        return Err(e);
                    }
                    continue;
                }
            };

            let crashed = outcome.crashed();
            self.set_phase(if crashed {
                SupervisorPhase::Crashed
            } else {
                SupervisorPhase::Passed
            });
            self.store.write_verdict(crashed)?;
            self.status.lock().last_verdict = Some(crashed);
            info!(crashed, ?outcome, "verdict recorded");

            if crashed {
                continue;
            }
            match self.reload() {
                Ok(()) => skip_launch = true,
                Err(e) if e.is_user_recoverable() => error!(
                    error = %e,
                    hint = e.suggestion().unwrap_or_default(),
                    "reload misconfigured; relaunching next cycle"
                ),
                Err(e) => warn!(error = %e, "reload failed; relaunching next cycle"),
            }
        }
    }

    /// Move the supervisor onto its own thread.
    ///
    /// # Errors
    ///
    /// The thread could not be spawned.
    pub fn spawn(mut self) -> Result<SupervisorHandle>
    where
        H: 'static,
        I: 'static,
        C: 'static,
    {
        let stop = self.stop.clone();
        let status = Arc::clone(&self.status);
        let thread = thread::Builder::new()
            .name("crashbisect-supervisor".to_owned())
            .spawn(move || self.run())?;
        Ok(SupervisorHandle {
            stop,
            status,
            thread,
        })
    }
}

/// Control surface for a supervisor running on its own thread.
pub struct SupervisorHandle {
    stop: StopToken,
    status: Arc<Mutex<SupervisorStatus>>,
    thread: JoinHandle<Result<SupervisorExit>>,
}

impl SupervisorHandle {
    /// Ask the loop to halt at the next cycle boundary.
    pub fn request_stop(&self) {
        self.stop.request_stop();
    }

    #[must_use]
    pub fn status(&self) -> SupervisorStatus {
        self.status.lock().clone()
    }

    #[must_use]
    pub fn is_running(&self) -> bool {
        !self.thread.is_finished()
    }

    /// Wait for the loop to exit.
    ///
    /// # Errors
    ///
    /// Whatever the loop returned, or [`BisectError::Internal`] if it
    /// panicked.
    pub fn join(self) -> Result<SupervisorExit> {
        self.thread
            .join()
            .map_err(|_| BisectError::internal("supervisor thread panicked"))?
    }
}
