//! Supervisor configuration, read from a TOML file.
//!
//! Every section defaults, so a file only needs the fields that differ from
//! [`SupervisorConfig::default`]. Call [`SupervisorConfig::validate`] before
//! handing the config to a supervisor; [`SupervisorConfig::load`] does it for
//! you.

use std::fs;
use std::path::{Path, PathBuf};
use std::time::Duration;

use crashbisect_engine::DEFAULT_CHUNK_COUNT;
use crashbisect_error::{BisectError, Result};
use serde::{Deserialize, Serialize};

use crate::content_path::ContentPathRule;
use crate::injector::ScreenPos;

/// Placeholder substituted with the normalized target path in
/// [`ReloadConfig::command_template`].
pub const PATH_PLACEHOLDER: &str = "{path}";

/// Placeholder substituted with [`BisectionConfig::chunk_count`] in
/// [`InputConfig::step_command`].
pub const CHUNK_COUNT_PLACEHOLDER: &str = "{chunk_count}";

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct SupervisorConfig {
    pub target: TargetConfig,
    pub protocol: ProtocolConfig,
    pub timing: TimingConfig,
    pub bisection: BisectionConfig,
    pub input: InputConfig,
    pub reload: ReloadConfig,
}

/// The host application under test.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct TargetConfig {
    pub executable: String,
    pub args: Vec<String>,
    /// Substring matched against process names for liveness and CPU.
    pub process_name: String,
    /// Substring matched against the name of the target's crash dialog
    /// process, which is dismissed after a crash.
    pub crash_reporter_name: String,
    /// Log file the target appends to during the operation.
    pub log_path: PathBuf,
    /// Text whose appearance in the log means the operation completed.
    pub completion_sentinel: String,
}

impl Default for TargetConfig {
    fn default() -> Self {
        Self {
            executable: String::new(),
            args: Vec::new(),
            process_name: "UnrealEditor".to_owned(),
            crash_reporter_name: "CrashReportClient".to_owned(),
            log_path: PathBuf::new(),
            completion_sentinel: "LogGPULightmass: Total lighting time".to_owned(),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct ProtocolConfig {
    /// Directory shared with the engine running inside the target.
    pub state_dir: PathBuf,
}

impl Default for ProtocolConfig {
    fn default() -> Self {
        Self {
            state_dir: PathBuf::from("crashbisect-state"),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct TimingConfig {
    pub initial_delay_secs: u64,
    pub step_delay_secs: u64,
    pub post_reload_delay_secs: u64,
    pub poll_interval_secs: u64,
    pub cpu_freeze_threshold_pct: f64,
    pub max_hang_secs: u64,
    /// Pause between focusing the console and typing into it.
    pub console_settle_ms: u64,
    /// Duration of the pointer travel before clicking the trigger.
    pub move_duration_ms: u64,
}

impl Default for TimingConfig {
    fn default() -> Self {
        Self {
            initial_delay_secs: 30,
            step_delay_secs: 15,
            post_reload_delay_secs: 5,
            poll_interval_secs: 10,
            cpu_freeze_threshold_pct: 5.0,
            max_hang_secs: 60,
            console_settle_ms: 400,
            move_duration_ms: 1000,
        }
    }
}

impl TimingConfig {
    #[must_use]
    pub const fn initial_delay(&self) -> Duration {
        Duration::from_secs(self.initial_delay_secs)
    }

    #[must_use]
    pub const fn step_delay(&self) -> Duration {
        Duration::from_secs(self.step_delay_secs)
    }

    #[must_use]
    pub const fn post_reload_delay(&self) -> Duration {
        Duration::from_secs(self.post_reload_delay_secs)
    }

    #[must_use]
    pub const fn poll_interval(&self) -> Duration {
        Duration::from_secs(self.poll_interval_secs)
    }

    #[must_use]
    pub const fn max_hang(&self) -> Duration {
        Duration::from_secs(self.max_hang_secs)
    }

    #[must_use]
    pub const fn console_settle(&self) -> Duration {
        Duration::from_millis(self.console_settle_ms)
    }

    #[must_use]
    pub const fn move_duration(&self) -> Duration {
        Duration::from_millis(self.move_duration_ms)
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct BisectionConfig {
    pub chunk_count: usize,
}

impl Default for BisectionConfig {
    fn default() -> Self {
        Self {
            chunk_count: DEFAULT_CHUNK_COUNT,
        }
    }
}

/// Screen coordinates and console text used to drive the target.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct InputConfig {
    /// Program used by the command-line injector.
    pub injector_program: String,
    pub console_pos: ScreenPos,
    pub trigger_pos: ScreenPos,
    /// Console command that runs one engine step inside the target;
    /// [`CHUNK_COUNT_PLACEHOLDER`] is replaced by the configured chunk count.
    pub step_command: String,
}

impl Default for InputConfig {
    fn default() -> Self {
        Self {
            injector_program: "xdotool".to_owned(),
            console_pos: ScreenPos::new(0, 0),
            trigger_pos: ScreenPos::new(0, 0),
            step_command: String::new(),
        }
    }
}

/// How the target is told to reload its scene after a passing cycle.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct ReloadConfig {
    /// Filesystem path of the scene to reload.
    pub target_path: String,
    /// Console command; [`PATH_PLACEHOLDER`] is replaced by the normalized
    /// path.
    pub command_template: String,
    pub content_marker: String,
    pub virtual_root: String,
    pub strip_extension: String,
}

impl Default for ReloadConfig {
    fn default() -> Self {
        Self {
            target_path: String::new(),
            command_template: format!("LoadLevel {PATH_PLACEHOLDER}"),
            content_marker: "/Content/".to_owned(),
            virtual_root: "/Game/".to_owned(),
            strip_extension: ".umap".to_owned(),
        }
    }
}

impl ReloadConfig {
    #[must_use]
    pub fn path_rule(&self) -> ContentPathRule {
        ContentPathRule {
            content_marker: self.content_marker.clone(),
            virtual_root: self.virtual_root.clone(),
            strip_extension: self.strip_extension.clone(),
        }
    }

    /// Render the reload console command for `normalized_path`.
    #[must_use]
    pub fn render_command(&self, normalized_path: &str) -> String {
        self.command_template
            .replace(PATH_PLACEHOLDER, normalized_path)
    }
}

impl SupervisorConfig {
    /// Read, parse and validate a config file.
    ///
    /// # Errors
    ///
    /// I/O failures, TOML syntax errors and anything rejected by
    /// [`Self::validate`].
    pub fn load(path: &Path) -> Result<Self> {
        let text = fs::read_to_string(path)?;
        let config = Self::from_toml(&text)?;
        config.validate()?;
        Ok(config)
    }

    /// Parse without validating.
    ///
    /// # Errors
    ///
    /// Returns [`BisectError::Config`] on TOML syntax or type errors.
    pub fn from_toml(text: &str) -> Result<Self> {
        toml::from_str(text).map_err(|e| BisectError::config("<file>", e.to_string()))
    }

    /// Serialize to TOML.
    ///
    /// # Errors
    ///
    /// Returns [`BisectError::Internal`] if serialization fails.
    pub fn to_toml(&self) -> Result<String> {
        toml::to_string_pretty(self).map_err(|e| BisectError::internal(e.to_string()))
    }

    /// Reject configurations the supervisor cannot run with.
    ///
    /// # Errors
    ///
    /// Returns [`BisectError::Config`] naming the first offending field.
    pub fn validate(&self) -> Result<()> {
        if self.target.executable.trim().is_empty() {
            return Err(BisectError::config("target.executable", "must not be empty"));
        }
        if self.target.process_name.is_empty() {
            return Err(BisectError::config(
                "target.process_name",
                "must not be empty",
            ));
        }
        if self.target.log_path.as_os_str().is_empty() {
            return Err(BisectError::config("target.log_path", "must not be empty"));
        }
        if self.target.completion_sentinel.is_empty() {
            return Err(BisectError::config(
                "target.completion_sentinel",
                "must not be empty",
            ));
        }
        if self.input.step_command.trim().is_empty() {
            return Err(BisectError::config("input.step_command", "must not be empty"));
        }
        if !self.input.step_command.contains(CHUNK_COUNT_PLACEHOLDER) {
            return Err(BisectError::config(
                "input.step_command",
                format!("must contain {CHUNK_COUNT_PLACEHOLDER}"),
            ));
        }
        if self.input.injector_program.trim().is_empty() {
            return Err(BisectError::config(
                "input.injector_program",
                "must not be empty",
            ));
        }
        if self.timing.poll_interval_secs == 0 {
            return Err(BisectError::config(
                "timing.poll_interval_secs",
                "must be at least 1",
            ));
        }
        if self.timing.max_hang_secs == 0 {
            return Err(BisectError::config(
                "timing.max_hang_secs",
                "must be at least 1",
            ));
        }
        let threshold = self.timing.cpu_freeze_threshold_pct;
        if !threshold.is_finite() || threshold < 0.0 {
            return Err(BisectError::config(
                "timing.cpu_freeze_threshold_pct",
                format!("must be a finite, non-negative percentage (got {threshold})"),
            ));
        }
        if self.bisection.chunk_count == 0 {
            return Err(BisectError::config(
                "bisection.chunk_count",
                "must be at least 1",
            ));
        }
        if self.reload.target_path.trim().is_empty() {
            return Err(BisectError::config("reload.target_path", "must not be empty"));
        }
        if !self.reload.command_template.contains(PATH_PLACEHOLDER) {
            return Err(BisectError::config(
                "reload.command_template",
                format!("must contain {PATH_PLACEHOLDER}"),
            ));
        }
        Ok(())
    }

    /// Render the step console command with the configured chunk count.
    #[must_use]
    pub fn render_step_command(&self) -> String {
        self.input
            .step_command
            .replace(CHUNK_COUNT_PLACEHOLDER, &self.bisection.chunk_count.to_string())
    }

    /// A config with every required field filled in, for `init-config` and
    /// tests.
    #[must_use]
    pub fn example() -> Self {
        let mut config = Self::default();
        config.target.executable = "/opt/target/bin/TargetEditor".to_owned();
        config.target.args = vec!["/projects/Demo/Demo.uproject".to_owned()];
        config.target.log_path = PathBuf::from("/projects/Demo/Saved/Logs/Demo.log");
        config.protocol.state_dir = PathBuf::from("/projects/Demo/Saved/CrashBisect");
        config.input.console_pos = ScreenPos::new(420, 1040);
        config.input.trigger_pos = ScreenPos::new(180, 64);
        config.input.step_command =
            format!("py crashbisect_step.py --chunk-count {CHUNK_COUNT_PLACEHOLDER}");
        config.reload.target_path = "/projects/Demo/Content/Maps/Main.umap".to_owned();
        config
    }
}
