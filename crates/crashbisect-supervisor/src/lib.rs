//! Control-process side of crash isolation.
//!
//! The [`Supervisor`] launches the target, has it run one engine step,
//! triggers the expensive operation, watches for a crash, completion or a
//! stall, records the verdict and reloads the target for the next cycle.
//! Everything that touches the outside world sits behind a trait:
//! [`TargetHost`] for the process, [`InputInjector`] for UI input and
//! [`Clock`] for time.

pub mod clock;
pub mod config;
pub mod content_path;
pub mod freeze;
pub mod host;
pub mod injector;
pub mod log_tail;
pub mod logging;
pub mod monitor;
pub mod supervisor;

pub use clock::{Clock, ManualClock, SystemClock};
pub use config::{CHUNK_COUNT_PLACEHOLDER, SupervisorConfig};
pub use content_path::ContentPathRule;
pub use freeze::{FreezeDecision, FreezePolicy};
pub use host::{ProcessHost, TargetHost};
pub use injector::{CommandInjector, InputInjector, ScreenPos};
pub use log_tail::LogTail;
pub use logging::{LogGuard, init_logging, init_test_logging};
pub use monitor::{MonitorOutcome, MonitorSettings, monitor_operation};
pub use supervisor::{
    StopToken, Supervisor, SupervisorExit, SupervisorHandle, SupervisorPhase, SupervisorStatus,
};
