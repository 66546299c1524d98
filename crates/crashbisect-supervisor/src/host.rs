//! Target process lifecycle: launch, liveness, CPU sampling and cleanup.
//!
//! [`ProcessHost`] finds processes by scanning `/proc` and matching the
//! command name, so it also tracks instances it did not start itself (a
//! target left running by a previous supervisor). On systems without
//! `/proc` no process ever matches and the target is always reported dead.

use std::collections::HashMap;
use std::fs;
use std::process::{Child, Command, Stdio};
use std::thread;
use std::time::{Duration, Instant};

use crashbisect_error::{BisectError, Result};
use nix::sys::signal::{Signal, kill};
use nix::unistd::Pid;
use tracing::{debug, info, warn};

use crate::config::TargetConfig;

pub trait TargetHost: Send {
    /// Start a fresh instance of the target.
    ///
    /// # Errors
    ///
    /// [`BisectError::Launch`] when the process could not be spawned.
    fn launch(&mut self) -> Result<()>;

    fn is_alive(&mut self) -> bool;

    /// CPU usage of the target since the previous sample, in percent of one
    /// core, averaged over matching processes. The first sample after a
    /// launch reads as 0.
    fn cpu_percent(&mut self) -> f64;

    /// Dismiss the crash-report dialog, if one is showing.
    fn close_crash_reporter(&mut self);

    /// Stop any running instance so the next launch starts clean.
    fn terminate(&mut self);
}

/// `USER_HZ`; the unit of `utime`/`stime` in `/proc/<pid>/stat`.
const CLOCK_TICKS_PER_SEC: f64 = 100.0;

/// Kernel limit on `comm` length, excluding the terminator.
const COMM_MAX: usize = 15;

const EXIT_WAIT: Duration = Duration::from_secs(5);
const EXIT_POLL: Duration = Duration::from_millis(100);

#[derive(Debug, Clone, PartialEq, Eq)]
struct ProcStat {
    pid: i32,
    comm: String,
    state: char,
    cpu_ticks: u64,
}

/// Parse one `/proc/<pid>/stat` line.
fn parse_stat(line: &str) -> Option<ProcStat> {
    let open = line.find('(')?;
    let close = line.rfind(')')?;
    let pid = line.get(..open)?.trim().parse().ok()?;
    let comm = line.get(open + 1..close)?.to_owned();
    let rest: Vec<&str> = line.get(close + 1..)?.split_whitespace().collect();
    // Fields after the comm start at field 3 (state); utime and stime are
    // fields 14 and 15.
    let state = rest.first()?.chars().next()?;
    let utime: u64 = rest.get(11)?.parse().ok()?;
    let stime: u64 = rest.get(12)?.parse().ok()?;
    Some(ProcStat {
        pid,
        comm,
        state,
        cpu_ticks: utime + stime,
    })
}

/// `comm` is truncated by the kernel, so a full-length comm also matches
/// when it is a prefix of the pattern.
fn name_matches(comm: &str, pattern: &str) -> bool {
    comm.contains(pattern) || (comm.len() >= COMM_MAX && pattern.starts_with(comm))
}

/// Live (non-zombie) processes whose name matches `pattern`.
fn find_processes(pattern: &str) -> Vec<ProcStat> {
    let Ok(entries) = fs::read_dir("/proc") else {
        return Vec::new();
    };
    entries
        .filter_map(std::result::Result::ok)
        .filter(|entry| {
            entry
                .file_name()
                .to_str()
                .is_some_and(|name| name.bytes().all(|b| b.is_ascii_digit()))
        })
        .filter_map(|entry| fs::read_to_string(entry.path().join("stat")).ok())
        .filter_map(|line| parse_stat(&line))
        .filter(|stat| stat.state != 'Z' && name_matches(&stat.comm, pattern))
        .collect()
}

fn signal_all(pattern: &str, what: &str) {
    let victims = find_processes(pattern);
    if victims.is_empty() {
        return;
    }
    for stat in &victims {
        info!(pid = stat.pid, comm = %stat.comm, what, "sending SIGTERM");
        if let Err(e) = kill(Pid::from_raw(stat.pid), Signal::SIGTERM) {
            warn!(pid = stat.pid, error = %e, "SIGTERM failed");
        }
    }
    let deadline = Instant::now() + EXIT_WAIT;
    while Instant::now() < deadline {
        if find_processes(pattern).is_empty() {
            return;
        }
        thread::sleep(EXIT_POLL);
    }
    warn!(what, pattern, "processes still present after SIGTERM");
}

/// Kill our own child if it outlived the SIGTERM pass, then wait on it.
fn stop_child(mut child: Child) {
    match child.try_wait() {
        Ok(Some(status)) => debug!(%status, "target child already exited"),
        Ok(None) => {
            if let Err(e) = child.kill() {
                warn!(error = %e, "failed to kill target child");
            }
            match child.wait() {
                Ok(status) => debug!(%status, "target child reaped"),
                Err(e) => warn!(error = %e, "failed to reap target child"),
            }
        }
        Err(e) => warn!(error = %e, "could not poll target child"),
    }
}

#[derive(Debug)]
pub struct ProcessHost {
    executable: String,
    args: Vec<String>,
    process_name: String,
    crash_reporter_name: String,
    child: Option<Child>,
    samples: HashMap<i32, (u64, Instant)>,
}

impl ProcessHost {
    #[must_use]
    pub fn new(target: &TargetConfig) -> Self {
        Self {
            executable: target.executable.clone(),
            args: target.args.clone(),
            process_name: target.process_name.clone(),
            crash_reporter_name: target.crash_reporter_name.clone(),
            child: None,
            samples: HashMap::new(),
        }
    }

    /// Collect our own child once it exits so it does not linger as a
    /// zombie.
    fn reap_child(&mut self) {
        if let Some(child) = self.child.as_mut() {
            match child.try_wait() {
                Ok(Some(status)) => {
                    debug!(%status, "target child exited");
                    self.child = None;
                }
                Ok(None) => {}
                Err(e) => {
                    warn!(error = %e, "could not poll target child");
                    self.child = None;
                }
            }
        }
    }
}

impl TargetHost for ProcessHost {
    fn launch(&mut self) -> Result<()> {
        self.reap_child();
        info!(executable = %self.executable, args = ?self.args, "launching target");
        let child = Command::new(&self.executable)
            .args(&self.args)
            .stdin(Stdio::null())
            .stdout(Stdio::null())
            .stderr(Stdio::null())
            .spawn()
            .map_err(|e| BisectError::Launch {
                program: self.executable.clone(),
                detail: e.to_string(),
            })?;
        info!(pid = child.id(), "target started");
        self.child = Some(child);
        self.samples.clear();
        Ok(())
    }

    fn is_alive(&mut self) -> bool {
        self.reap_child();
        !find_processes(&self.process_name).is_empty()
    }

    fn cpu_percent(&mut self) -> f64 {
        let now = Instant::now();
        let procs = find_processes(&self.process_name);
        if procs.is_empty() {
            self.samples.clear();
            return 0.0;
        }
        let mut total = 0.0;
        let mut next = HashMap::with_capacity(procs.len());
        for stat in &procs {
            if let Some(&(ticks, at)) = self.samples.get(&stat.pid) {
                let secs = now.duration_since(at).as_secs_f64();
                if secs > 0.0 {
                    let used = stat.cpu_ticks.saturating_sub(ticks) as f64 / CLOCK_TICKS_PER_SEC;
                    total += used / secs * 100.0;
                }
            }
            next.insert(stat.pid, (stat.cpu_ticks, now));
        }
        self.samples = next;
        total / procs.len() as f64
    }

    fn close_crash_reporter(&mut self) {
        if self.crash_reporter_name.is_empty() {
            return;
        }
        signal_all(&self.crash_reporter_name, "crash reporter");
    }

    fn terminate(&mut self) {
        signal_all(&self.process_name, "target");
        if let Some(child) = self.child.take() {
            stop_child(child);
        }
        self.samples.clear();
    }
}

#[cfg(test)]
mod tests {
    use std::path::Path;

    use super::*;

    #[test]
    fn test_parse_stat_line() {
        let line = "4242 (UnrealEditor) S 1 4242 4242 0 -1 4194560 1000 0 0 0 \
                    250 50 0 0 20 0 48 0 123456 0 0";
        let stat = parse_stat(line).unwrap();
        assert_eq!(stat.pid, 4242);
        assert_eq!(stat.comm, "UnrealEditor");
        assert_eq!(stat.state, 'S');
        assert_eq!(stat.cpu_ticks, 300);
    }

    #[test]
    fn test_parse_stat_comm_with_parens_and_spaces() {
        let line = "7 (Game (Main) x) R 1 7 7 0 -1 0 0 0 0 0 3 4 0 0 20 0 1 0 9 0 0";
        let stat = parse_stat(line).unwrap();
        assert_eq!(stat.comm, "Game (Main) x");
        assert_eq!(stat.state, 'R');
        assert_eq!(stat.cpu_ticks, 7);
    }

    #[test]
    fn test_parse_stat_rejects_garbage() {
        assert!(parse_stat("").is_none());
        assert!(parse_stat("12 (short) S 1").is_none());
    }

    #[test]
    fn test_name_matching_handles_truncated_comm() {
        assert!(name_matches("UnrealEditor", "UnrealEditor"));
        assert!(name_matches("UnrealEditor-Cmd", "UnrealEditor"));
        assert!(name_matches("CrashReportClie", "CrashReportClient"));
        assert!(!name_matches("Crash", "CrashReportClient"));
        assert!(!name_matches("bash", "UnrealEditor"));
    }

    #[cfg(target_os = "linux")]
    #[test]
    fn test_finds_own_test_process() {
        let own = fs::read_to_string("/proc/self/stat").unwrap();
        let stat = parse_stat(&own).unwrap();
        let found = find_processes(&stat.comm);
        assert!(found.iter().any(|p| p.pid == stat.pid));
    }

    #[cfg(target_os = "linux")]
    #[test]
    fn test_terminate_reaps_own_child() {
        let target = TargetConfig {
            executable: "sleep".to_owned(),
            args: vec!["30".to_owned()],
            process_name: "crashbisect-no-such-process".to_owned(),
            ..TargetConfig::default()
        };
        let mut host = ProcessHost::new(&target);
        host.launch().unwrap();
        let pid = host.child.as_ref().unwrap().id();
        assert!(Path::new(&format!("/proc/{pid}")).exists());

        host.terminate();
        assert!(host.child.is_none());
        assert!(!Path::new(&format!("/proc/{pid}")).exists(), "case=no_zombie_left");
    }

    #[test]
    fn test_launch_failure_is_launch_error() {
        let target = TargetConfig {
            executable: "/nonexistent/crashbisect-target".to_owned(),
            process_name: "crashbisect-no-such-process".to_owned(),
            ..TargetConfig::default()
        };
        let mut host = ProcessHost::new(&target);
        let err = host.launch().unwrap_err();
        assert!(matches!(err, BisectError::Launch { .. }));
        assert!(!host.is_alive());
        assert!(host.cpu_percent().abs() < f64::EPSILON);
    }
}
