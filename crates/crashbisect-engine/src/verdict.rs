//! Single-slot verdict mailbox written by the supervisor after each
//! monitored cycle and consumed by the engine on its next invocation.

use serde::{Deserialize, Serialize};

/// Outcome of testing the chunk that was active during the last cycle.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Verdict {
    Crashed,
    Passed,
    /// Mailbox missing, unreadable, or without a `crashed` field.
    Unknown,
}

impl Verdict {
    #[must_use]
    pub const fn from_crashed(crashed: bool) -> Self {
        if crashed { Self::Crashed } else { Self::Passed }
    }
}

/// On-disk form of the mailbox: `{ "crashed": bool }`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
pub struct VerdictRecord {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub crashed: Option<bool>,
}

impl VerdictRecord {
    #[must_use]
    pub const fn new(crashed: bool) -> Self {
        Self {
            crashed: Some(crashed),
        }
    }

    #[must_use]
    pub const fn verdict(self) -> Verdict {
        match self.crashed {
            Some(crashed) => Verdict::from_crashed(crashed),
            None => Verdict::Unknown,
        }
    }
}
