mod common;

use std::fs;
use std::time::Duration;

use common::{FakeHost, FakeInjector, Harness, TRIGGER};
use crashbisect_engine::{IsolationRecord, Verdict};
use crashbisect_error::BisectError;
use crashbisect_supervisor::{
    Clock, LogTail, MonitorOutcome, MonitorSettings, SupervisorExit, SupervisorPhase,
    init_test_logging, monitor_operation,
};

#[test]
fn isolates_single_fault_end_to_end() {
    init_test_logging();
    let h = Harness::new(12, &[7], 3);
    let mut supervisor = h.supervisor();

    let exit = supervisor.run().expect("run");
    assert_eq!(
        exit,
        SupervisorExit::Finished {
            faults: vec!["c7".to_owned()]
        }
    );

    let w = h.world.lock();
    assert!(w.crashes > 0);
    assert_eq!(w.reporter_closes, w.crashes, "case=reporter_closed_per_crash");
    // One launch up front plus one fresh launch per crash.
    assert_eq!(w.launches, w.crashes + 1, "case=relaunch_only_after_crash");
    assert_eq!(w.terminations, 0);
    // Every monitored operation that passed was followed by a reload.
    assert_eq!(w.reloads, w.triggers - w.crashes);

    let store = h.store();
    assert!(store.is_finished());
    assert_eq!(
        store.read_fault_export().as_deref(),
        Some("Crashing candidates:\nc7\n")
    );
    assert_eq!(supervisor.status().phase, SupervisorPhase::Finished);
}

#[test]
fn target_death_mid_monitor_writes_crashed_verdict() {
    let h = Harness::new(4, &[0, 1, 2, 3], 1);
    h.world.lock().stop_on_crash = true;
    let mut supervisor = h.supervisor();

    assert_eq!(supervisor.run().expect("run"), SupervisorExit::Stopped);

    let raw = fs::read_to_string(h.store().verdict_path()).expect("verdict written");
    let value: serde_json::Value = serde_json::from_str(&raw).expect("verdict json");
    assert_eq!(value, serde_json::json!({ "crashed": true }));
    assert_eq!(h.store().read_verdict(), Verdict::Crashed);

    let w = h.world.lock();
    assert_eq!(w.crashes, 1);
    assert_eq!(w.reporter_closes, 1);
    assert_eq!(w.triggers, 1, "case=no_retrigger_after_death");
    let log = fs::read_to_string(&w.log_path).expect("log");
    assert!(!log.contains(common::SENTINEL));

    let status = supervisor.status();
    assert_eq!(status.phase, SupervisorPhase::Stopped);
    assert_eq!(status.last_verdict, Some(true));
}

#[test]
fn passing_chunk_writes_false_and_reloads() {
    let h = Harness::new(6, &[], 2);
    h.world.lock().stop_on_reload = true;
    let mut supervisor = h.supervisor();

    assert_eq!(supervisor.run().expect("run"), SupervisorExit::Stopped);
    assert_eq!(h.store().read_verdict(), Verdict::Passed);

    let w = h.world.lock();
    assert_eq!(w.launches, 1);
    assert_eq!(w.reloads, 1);
    assert_eq!(w.crashes, 0);
    assert_eq!(w.scene.loaded.len(), 6, "case=reload_restores_full_scene");
}

#[test]
fn configured_chunk_count_reaches_engine_step() {
    let mut h = Harness::new(12, &[], 2);
    h.config.bisection.chunk_count = 4;
    h.world.lock().stop_on_reload = true;
    let mut supervisor = h.supervisor();

    assert_eq!(supervisor.run().expect("run"), SupervisorExit::Stopped);

    assert_eq!(h.world.lock().step_chunk_counts, vec![4, 4]);
    let record = h.store().load_record();
    assert_eq!(record.active_chunk, vec!["c0", "c1", "c2"]);
    assert_eq!(record.pending_ranges.len(), 3, "case=universe_split_in_four");
}

#[test]
fn stall_retriggers_without_relaunch() {
    let mut h = Harness::new(4, &[], 1);
    h.config.timing.poll_interval_secs = 10;
    h.config.timing.max_hang_secs = 60;
    {
        let mut w = h.world.lock();
        w.stalled_triggers = 1;
        w.stop_on_reload = true;
    }
    let mut supervisor = h.supervisor();

    assert_eq!(supervisor.run().expect("run"), SupervisorExit::Stopped);
    assert_eq!(h.store().read_verdict(), Verdict::Passed);

    let w = h.world.lock();
    assert_eq!(w.triggers, 2, "case=one_retry_after_grace_window");
    assert_eq!(w.launches, 1, "case=hang_is_not_relaunched");
    assert_eq!(w.crashes, 0);
}

#[test]
fn stop_before_start_never_launches() {
    let h = Harness::new(4, &[1], 2);
    let mut supervisor = h.supervisor();
    supervisor.stop_token().request_stop();

    assert_eq!(supervisor.run().expect("run"), SupervisorExit::Stopped);
    assert_eq!(h.world.lock().launches, 0);
    assert_eq!(h.store().read_verdict(), Verdict::Unknown);
}

#[test]
fn finished_record_halts_without_launching() {
    let h = Harness::new(2, &[], 2);
    let record = IsolationRecord {
        candidates: vec!["c0".to_owned(), "c1".to_owned()],
        confirmed_good: ["c0".to_owned()].into_iter().collect(),
        confirmed_bad: ["c1".to_owned()].into_iter().collect(),
        initialized: true,
        finished: true,
        ..IsolationRecord::default()
    };
    h.store().save_record(&record).expect("save");

    let exit = h.supervisor().run().expect("run");
    assert_eq!(
        exit,
        SupervisorExit::Finished {
            faults: vec!["c1".to_owned()]
        }
    );
    assert_eq!(h.world.lock().launches, 0);
}

#[test]
fn attaches_to_running_target() {
    let h = Harness::new(4, &[], 2);
    {
        let mut w = h.world.lock();
        w.alive = true;
        w.stop_on_reload = true;
    }
    h.supervisor().run().expect("run");

    let w = h.world.lock();
    assert_eq!(w.launches, 0);
    assert_eq!(w.terminations, 0);
    assert_eq!(w.reloads, 1);
}

#[test]
fn resume_after_crash_verdict_relaunches_running_target() {
    let h = Harness::new(4, &[], 2);
    h.store().write_verdict(true).expect("leftover verdict");
    {
        let mut w = h.world.lock();
        w.alive = true;
        w.stop_on_reload = true;
    }
    h.supervisor().run().expect("run");

    let w = h.world.lock();
    assert_eq!(w.terminations, 1);
    assert_eq!(w.launches, 1);
}

#[test]
fn repeated_launch_failure_is_fatal() {
    let h = Harness::new(4, &[], 2);
    h.world.lock().fail_launch = true;

    let err = h.supervisor().run().unwrap_err();
    assert!(matches!(err, BisectError::Launch { .. }));
    assert_eq!(err.exit_code(), 5);
}

#[test]
fn non_transient_step_failure_stops_the_run() {
    let h = Harness::new(4, &[], 2);
    h.world.lock().broken_console = true;
    let mut supervisor = h.supervisor();

    let err = supervisor.run().unwrap_err();
    assert!(matches!(err, BisectError::Internal(_)));
    assert_eq!(h.world.lock().launches, 1, "case=no_relaunch_loop");
    assert_eq!(supervisor.status().phase, SupervisorPhase::Stopped);
}

#[test]
fn invalid_reload_path_forces_relaunch() {
    let mut h = Harness::new(4, &[], 2);
    h.config.reload.target_path = "/outside/of/content/Main.umap".to_owned();
    let mut supervisor = h.supervisor();

    assert!(matches!(
        supervisor.run().expect("run"),
        SupervisorExit::Finished { .. }
    ));
    let w = h.world.lock();
    assert_eq!(w.reloads, 0);
    // Every passing cycle ends in a forced relaunch instead of a reload.
    assert_eq!(w.launches, w.triggers + 1);
    assert_eq!(w.terminations, w.triggers);
}

#[test]
fn spawned_supervisor_reports_status_and_joins() {
    let h = Harness::new(9, &[4], 3);
    let handle = h.supervisor().spawn().expect("spawn");
    let exit = handle.join().expect("join");
    assert_eq!(
        exit,
        SupervisorExit::Finished {
            faults: vec!["c4".to_owned()]
        }
    );
}

#[test]
fn spawned_supervisor_stops_at_cycle_boundary() {
    let h = Harness::new(9, &[], 3);
    h.world.lock().stop_on_reload = true;
    let handle = h.supervisor().spawn().expect("spawn");
    while handle.is_running() {
        std::thread::yield_now();
    }
    let status = handle.status();
    assert_eq!(handle.join().expect("join"), SupervisorExit::Stopped);
    assert_eq!(status.phase, SupervisorPhase::Stopped);
    assert_eq!(status.last_verdict, Some(false));
    assert_eq!(status.cycle, 2);
}

#[test]
fn monitor_reports_completion_once_sentinel_is_logged() {
    let h = Harness::new(3, &[], 1);
    {
        let mut w = h.world.lock();
        w.alive = true;
    }
    let mut host = FakeHost(h.world.clone());
    let mut injector = FakeInjector(h.world.clone());
    let mut tail = LogTail::new(&h.config.target.log_path);
    fs::write(&h.config.target.log_path, format!("{} = 1s\n", common::SENTINEL))
        .expect("stale sentinel");
    let settings = MonitorSettings {
        sentinel: common::SENTINEL.to_owned(),
        poll_interval: Duration::from_secs(10),
        cpu_threshold_pct: 5.0,
        max_hang: Duration::from_secs(60),
        trigger_pos: TRIGGER,
        move_duration: Duration::ZERO,
    };

    let outcome =
        monitor_operation(&mut host, &mut injector, &h.clock, &mut tail, &settings).expect("monitor");
    assert_eq!(outcome, MonitorOutcome::Passed { polls: 4, retries: 0 });
    assert_eq!(h.clock.now(), Duration::from_secs(30));
}
