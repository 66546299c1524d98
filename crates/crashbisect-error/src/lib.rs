use std::path::PathBuf;

use thiserror::Error;

/// Primary error type for crashbisect operations.
///
/// Variants follow the failure taxonomy of an isolation session: persisted
/// state problems, verdict ambiguity, target process lifecycle failures and
/// collaborator (injector / provider) failures. Ambiguity that the engine is
/// expected to absorb (unknown verdicts, index-mapping failures) is modelled
/// as outcome enums in the engine, not as errors.
#[derive(Error, Debug)]
pub enum BisectError {
    // === Persisted state ===
    /// Isolation record could not be read back as a valid document.
    #[error("isolation record is corrupt: {detail}")]
    StateCorruption { detail: String },

    /// Persisted document was written by a newer, unsupported schema.
    #[error("unsupported schema version {found} (expected {expected})")]
    SchemaVersion { expected: u32, found: u32 },

    /// Candidate manifest could not be parsed.
    #[error("candidate manifest '{path}' is invalid: {detail}")]
    Manifest { path: PathBuf, detail: String },

    // === Target process lifecycle ===
    /// Target process could not be launched.
    #[error("failed to launch target '{program}': {detail}")]
    Launch { program: String, detail: String },

    /// Target-identifying path did not validate before a reload.
    #[error("invalid target path: {path}")]
    InvalidTargetPath { path: String },

    /// Simulated input could not be delivered to the target.
    #[error("input injection failed: {detail}")]
    Injector { detail: String },

    // === Configuration / usage ===
    /// Configuration value rejected during validation.
    #[error("invalid configuration for '{field}': {reason}")]
    Config { field: String, reason: String },

    /// Command-line usage error.
    #[error("usage: {0}")]
    Usage(String),

    // === I/O ===
    /// File I/O error.
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    /// JSON encode/decode error.
    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),

    /// Internal logic error (should never happen).
    #[error("internal error: {0}")]
    Internal(String),
}

impl BisectError {
    /// Whether the caller can likely fix this by editing input or config.
    pub const fn is_user_recoverable(&self) -> bool {
        matches!(
            self,
            Self::Manifest { .. }
                | Self::InvalidTargetPath { .. }
                | Self::Config { .. }
                | Self::Usage(_)
        )
    }

    /// Whether retrying the same operation on the next cycle may succeed.
    pub const fn is_transient(&self) -> bool {
        matches!(
            self,
            Self::Launch { .. } | Self::Injector { .. } | Self::Io(_)
        )
    }

    /// Human-friendly suggestion for fixing this error.
    pub const fn suggestion(&self) -> Option<&'static str> {
        match self {
            Self::StateCorruption { .. } | Self::SchemaVersion { .. } => {
                Some("Run `crashbisect reset` to discard the isolation record")
            }
            Self::Manifest { .. } => Some("Use one candidate per line: `id` or `id<TAB>label`"),
            Self::InvalidTargetPath { .. } => {
                Some("Point `reload.target_path` at a path under the content root")
            }
            Self::Launch { .. } => Some("Check `target.executable` and `target.args`"),
            Self::Injector { .. } => Some("Check that the automation tool is installed"),
            Self::Config { .. } => Some("Run `crashbisect init-config` for a valid template"),
            _ => None,
        }
    }

    /// Process exit code for this error (for CLI use).
    pub const fn exit_code(&self) -> i32 {
        match self {
            Self::Usage(_) => 2,
            Self::Config { .. } | Self::Manifest { .. } => 3,
            Self::StateCorruption { .. } | Self::SchemaVersion { .. } => 4,
            Self::Launch { .. } | Self::InvalidTargetPath { .. } | Self::Injector { .. } => 5,
            Self::Io(_) | Self::Json(_) => 6,
            Self::Internal(_) => 70,
        }
    }

    /// Create a state-corruption error.
    pub fn corrupt(detail: impl Into<String>) -> Self {
        Self::StateCorruption {
            detail: detail.into(),
        }
    }

    /// Create a configuration error.
    pub fn config(field: impl Into<String>, reason: impl Into<String>) -> Self {
        Self::Config {
            field: field.into(),
            reason: reason.into(),
        }
    }

    /// Create an injector error.
    pub fn injector(detail: impl Into<String>) -> Self {
        Self::Injector {
            detail: detail.into(),
        }
    }

    /// Create an internal error.
    pub fn internal(msg: impl Into<String>) -> Self {
        Self::Internal(msg.into())
    }
}

/// Result type alias using `BisectError`.
pub type Result<T> = std::result::Result<T, BisectError>;
