//! In-process stand-in for the target application.
//!
//! The simulated target runs real engine steps against the shared state
//! directory when the step command is typed into its console, crashes when
//! the operation is triggered with a faulty candidate loaded, and otherwise
//! logs the completion sentinel after a few polls.

#![allow(dead_code)]

use std::collections::BTreeSet;
use std::fs::OpenOptions;
use std::io::Write;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;

use crashbisect_engine::{BisectionEngine, CandidateId, CandidateProvider, StateStore, run_step};
use crashbisect_error::{BisectError, Result};
use crashbisect_supervisor::{
    InputInjector, ManualClock, ScreenPos, StopToken, Supervisor, SupervisorConfig, TargetHost,
};
use parking_lot::Mutex;
use tempfile::TempDir;

pub const STEP_COMMAND: &str = "py crashbisect_step.py --chunk-count {chunk_count}";
const STEP_PREFIX: &str = "py crashbisect_step.py --chunk-count ";
pub const SENTINEL: &str = "LogGPULightmass: Total lighting time";
pub const CONSOLE: ScreenPos = ScreenPos::new(400, 1000);
pub const TRIGGER: ScreenPos = ScreenPos::new(150, 60);

/// Liveness checks a doomed operation survives before the target dies.
const POLLS_BEFORE_CRASH: u32 = 2;
/// CPU samples a healthy operation takes before logging the sentinel.
const POLLS_BEFORE_DONE: u32 = 2;

pub struct Scene {
    universe: Vec<CandidateId>,
    pub loaded: Vec<CandidateId>,
}

impl CandidateProvider for Scene {
    fn list_candidates(&mut self) -> Result<Vec<CandidateId>> {
        Ok(self.loaded.clone())
    }

    fn remove_all_except(&mut self, keep: &[CandidateId]) -> Result<()> {
        self.loaded = keep.to_vec();
        Ok(())
    }
}

pub struct World {
    pub store: StateStore,
    pub scene: Scene,
    pub bad: BTreeSet<CandidateId>,
    pub log_path: PathBuf,

    pub alive: bool,
    pub fail_launch: bool,
    /// Console input fails with an error that a relaunch cannot fix.
    pub broken_console: bool,
    /// Trigger clicks that are swallowed without starting the operation.
    pub stalled_triggers: u32,
    busy: bool,
    doom_in: Option<u32>,
    complete_in: Option<u32>,
    console_focused: bool,
    typed: String,

    pub launches: u32,
    pub terminations: u32,
    pub reporter_closes: u32,
    pub triggers: u32,
    pub steps: u32,
    /// Chunk count parsed from every step command the target received.
    pub step_chunk_counts: Vec<usize>,
    pub reloads: u32,
    pub crashes: u32,

    pub stop: Option<StopToken>,
    pub stop_on_crash: bool,
    pub stop_on_reload: bool,
}

impl World {
    fn universe(&self) -> Vec<CandidateId> {
        self.scene.universe.clone()
    }

    fn submit(&mut self) {
        let text = std::mem::take(&mut self.typed);
        if let Some(count) = text.strip_prefix(STEP_PREFIX) {
            let count: usize = count.parse().expect("numeric chunk count");
            self.steps += 1;
            self.step_chunk_counts.push(count);
            let engine = BisectionEngine::new(count);
            run_step(&self.store, &engine, &mut self.scene).expect("engine step");
        } else if text.starts_with("LoadLevel ") {
            self.reloads += 1;
            self.scene.loaded = self.universe();
            if self.stop_on_reload {
                self.request_stop();
            }
        } else {
            panic!("unexpected console command {text:?}");
        }
    }

    fn trigger(&mut self) {
        self.triggers += 1;
        if self.stalled_triggers > 0 {
            self.stalled_triggers -= 1;
            return;
        }
        self.busy = true;
        if self.scene.loaded.iter().any(|id| self.bad.contains(id)) {
            self.doom_in = Some(POLLS_BEFORE_CRASH);
        } else {
            self.complete_in = Some(POLLS_BEFORE_DONE);
        }
    }

    fn append_log(&self, text: &str) {
        let mut file = OpenOptions::new()
            .create(true)
            .append(true)
            .open(&self.log_path)
            .expect("open log");
        file.write_all(text.as_bytes()).expect("append log");
    }

    fn request_stop(&self) {
        if let Some(stop) = &self.stop {
            stop.request_stop();
        }
    }
}

pub type SharedWorld = Arc<Mutex<World>>;

pub struct FakeHost(pub SharedWorld);

impl TargetHost for FakeHost {
    fn launch(&mut self) -> Result<()> {
        let mut w = self.0.lock();
        if w.fail_launch {
            return Err(BisectError::Launch {
                program: "fake-target".to_owned(),
                detail: "No such file or directory".to_owned(),
            });
        }
        w.launches += 1;
        w.alive = true;
        w.busy = false;
        w.doom_in = None;
        w.complete_in = None;
        w.scene.loaded = w.universe();
        w.append_log("LogInit: target started\n");
        Ok(())
    }

    fn is_alive(&mut self) -> bool {
        let mut w = self.0.lock();
        if let Some(left) = w.doom_in {
            if left == 0 {
                w.doom_in = None;
                w.busy = false;
                w.alive = false;
                w.crashes += 1;
            } else {
                w.doom_in = Some(left - 1);
            }
        }
        w.alive
    }

    fn cpu_percent(&mut self) -> f64 {
        let mut w = self.0.lock();
        if !w.busy {
            return 0.5;
        }
        if let Some(left) = w.complete_in {
            if left == 0 {
                w.complete_in = None;
                w.busy = false;
                w.append_log(&format!("{SENTINEL} = 4.2s\n"));
            } else {
                w.complete_in = Some(left - 1);
            }
        }
        85.0
    }

    fn close_crash_reporter(&mut self) {
        let mut w = self.0.lock();
        w.reporter_closes += 1;
        if w.stop_on_crash {
            w.request_stop();
        }
    }

    fn terminate(&mut self) {
        let mut w = self.0.lock();
        w.terminations += 1;
        w.alive = false;
    }
}

pub struct FakeInjector(pub SharedWorld);

impl InputInjector for FakeInjector {
    fn click(&mut self, pos: ScreenPos) -> Result<()> {
        let mut w = self.0.lock();
        if !w.alive {
            return Err(BisectError::injector("no target window"));
        }
        if pos == CONSOLE {
            w.console_focused = true;
        } else if pos == TRIGGER {
            w.console_focused = false;
            w.trigger();
        }
        Ok(())
    }

    fn move_to(&mut self, _pos: ScreenPos, _duration: Duration) -> Result<()> {
        Ok(())
    }

    fn type_text(&mut self, text: &str) -> Result<()> {
        let mut w = self.0.lock();
        if w.broken_console {
            return Err(BisectError::internal("console widget missing"));
        }
        assert!(w.console_focused, "typing without console focus");
        w.typed.push_str(text);
        Ok(())
    }

    fn press_enter(&mut self) -> Result<()> {
        self.0.lock().submit();
        Ok(())
    }
}

pub struct Harness {
    pub dir: TempDir,
    pub world: SharedWorld,
    pub clock: ManualClock,
    pub config: SupervisorConfig,
}

impl Harness {
    pub fn new(candidates: usize, bad: &[usize], chunk_count: usize) -> Self {
        let dir = tempfile::tempdir().expect("tempdir");
        let mut config = SupervisorConfig::example();
        config.protocol.state_dir = dir.path().join("state");
        config.target.log_path = dir.path().join("target.log");
        config.target.completion_sentinel = SENTINEL.to_owned();
        config.input.step_command = STEP_COMMAND.to_owned();
        config.input.console_pos = CONSOLE;
        config.input.trigger_pos = TRIGGER;
        config.bisection.chunk_count = chunk_count;

        let universe: Vec<CandidateId> = (0..candidates).map(|i| format!("c{i}")).collect();
        let world = World {
            store: StateStore::open(&config.protocol.state_dir).expect("open store"),
            scene: Scene {
                loaded: universe.clone(),
                universe,
            },
            bad: bad.iter().map(|i| format!("c{i}")).collect(),
            log_path: config.target.log_path.clone(),
            alive: false,
            fail_launch: false,
            broken_console: false,
            stalled_triggers: 0,
            busy: false,
            doom_in: None,
            complete_in: None,
            console_focused: false,
            typed: String::new(),
            launches: 0,
            terminations: 0,
            reporter_closes: 0,
            triggers: 0,
            steps: 0,
            step_chunk_counts: Vec::new(),
            reloads: 0,
            crashes: 0,
            stop: None,
            stop_on_crash: false,
            stop_on_reload: false,
        };
        Self {
            dir,
            world: Arc::new(Mutex::new(world)),
            clock: ManualClock::new(),
            config,
        }
    }

    pub fn state_dir(&self) -> &Path {
        &self.config.protocol.state_dir
    }

    pub fn store(&self) -> StateStore {
        StateStore::new(self.state_dir())
    }

    pub fn supervisor(&self) -> Supervisor<FakeHost, FakeInjector, ManualClock> {
        let supervisor = Supervisor::new(
            self.config.clone(),
            FakeHost(Arc::clone(&self.world)),
            FakeInjector(Arc::clone(&self.world)),
            self.clock.clone(),
        )
        .expect("build supervisor");
        self.world.lock().stop = Some(supervisor.stop_token());
        supervisor
    }
}
