use crate::error::HarnessError;
use serde::{Deserialize, Serialize};
use std::fmt;

// ---------------------------------------------------------------------------
// FeatureStatus
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum FeatureStatus {
    Pending,
    InProgress,
    Implemented,
    Verified,
    Failed,
}

impl FeatureStatus {
    pub fn all() -> &'static [FeatureStatus] {
        &[
            FeatureStatus::Pending,
            FeatureStatus::InProgress,
            FeatureStatus::Implemented,
            FeatureStatus::Verified,
            FeatureStatus::Failed,
        ]
    }

    pub fn as_str(self) -> &'static str {
        match self {
            FeatureStatus::Pending => "pending",
            FeatureStatus::InProgress => "in_progress",
            FeatureStatus::Implemented => "implemented",
            FeatureStatus::Verified => "verified",
            FeatureStatus::Failed => "failed",
        }
    }

    /// Target status for `event`, or `None` when the table has no such row.
    ///
    /// The override guard (`skip_verification`) is enforced by the registry,
    /// not here: this is the bare transition table.
    pub fn apply(self, event: Event) -> Option<FeatureStatus> {
        use Event::*;
        use FeatureStatus::*;
        match (self, event) {
            (_, Reset) => Some(Pending),
            (Pending, Start) => Some(InProgress),
            (InProgress, Complete) => Some(Implemented),
            (Implemented, Pass) => Some(Verified),
            (Implemented, Fail) => Some(Failed),
            (Failed, Resume) => Some(InProgress),
            (Implemented | Failed, Override) => Some(Verified),
            _ => None,
        }
    }
}

impl fmt::Display for FeatureStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl std::str::FromStr for FeatureStatus {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "pending" => Ok(FeatureStatus::Pending),
            "in_progress" | "in-progress" => Ok(FeatureStatus::InProgress),
            "implemented" => Ok(FeatureStatus::Implemented),
            "verified" => Ok(FeatureStatus::Verified),
            "failed" => Ok(FeatureStatus::Failed),
            _ => Err(format!("unknown status: {s}")),
        }
    }
}

// ---------------------------------------------------------------------------
// Event
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Event {
    /// pending → in_progress
    Start,
    /// in_progress → implemented
    Complete,
    /// implemented → verified, produced by the verification runner
    Pass,
    /// implemented → failed, produced by the verification runner
    Fail,
    /// failed → in_progress
    Resume,
    /// implemented | failed → verified without running the check
    Override,
    /// any → pending
    Reset,
}

impl Event {
    pub fn all() -> &'static [Event] {
        &[
            Event::Start,
            Event::Complete,
            Event::Pass,
            Event::Fail,
            Event::Resume,
            Event::Override,
            Event::Reset,
        ]
    }

    pub fn as_str(self) -> &'static str {
        match self {
            Event::Start => "start",
            Event::Complete => "complete",
            Event::Pass => "pass",
            Event::Fail => "fail",
            Event::Resume => "resume",
            Event::Override => "override",
            Event::Reset => "reset",
        }
    }

    /// Events a user may request directly. `pass` and `fail` only come out of
    /// a verification run.
    pub fn is_manual(self) -> bool {
        !matches!(self, Event::Pass | Event::Fail)
    }
}

impl fmt::Display for Event {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl std::str::FromStr for Event {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "start" => Ok(Event::Start),
            "complete" => Ok(Event::Complete),
            "pass" => Ok(Event::Pass),
            "fail" => Ok(Event::Fail),
            "resume" => Ok(Event::Resume),
            "override" => Ok(Event::Override),
            "reset" => Ok(Event::Reset),
            _ => Err(format!("unknown event: {s}")),
        }
    }
}

// ---------------------------------------------------------------------------
// VerifiedVia
// ---------------------------------------------------------------------------

/// How a feature reached `verified`. Overrides stay visible in the record.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum VerifiedVia {
    Check,
    Override,
}

impl fmt::Display for VerifiedVia {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(match self {
            VerifiedVia::Check => "check",
            VerifiedVia::Override => "override",
        })
    }
}

pub(crate) fn invalid_transition(from: FeatureStatus, event: Event) -> HarnessError {
    let hint = match (from, event) {
        (FeatureStatus::Failed, Event::Start) => Some("use 'resume' to restart work".to_string()),
        (FeatureStatus::Failed, Event::Pass) => {
            Some("resume and complete the feature before verifying again".to_string())
        }
        (FeatureStatus::InProgress, Event::Pass) => {
            Some("mark the feature complete before verifying".to_string())
        }
        _ => None,
    };
    HarnessError::InvalidTransition { from, event, hint }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------
