use crate::classify::FailureClass;
use crate::error::{HarnessError, Result};
use crate::types::{invalid_transition, Event, FeatureStatus, VerifiedVia};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

const MAX_HISTORY: usize = 100;

// ---------------------------------------------------------------------------
// TransitionRecord
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TransitionRecord {
    pub from: FeatureStatus,
    pub to: FeatureStatus,
    pub event: Event,
    pub at: DateTime<Utc>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub session: Option<u32>,
}

// ---------------------------------------------------------------------------
// TransitionOpts
// ---------------------------------------------------------------------------

/// Extra inputs a transition may need. Most events use the default.
#[derive(Debug, Clone, Default)]
pub struct TransitionOpts {
    /// Required for `override`.
    pub skip_verification: bool,
    /// Free-text justification recorded with an override.
    pub reason: Option<String>,
    /// Verification output excerpt, for `pass` and `fail`.
    pub output: Option<String>,
    /// Failed attempts in the verification invocation that produced this event.
    pub failed_attempts: u32,
    pub failure_class: Option<FailureClass>,
}

impl TransitionOpts {
    pub fn skip_verification(reason: Option<String>) -> Self {
        Self {
            skip_verification: true,
            reason,
            ..Default::default()
        }
    }
}

// ---------------------------------------------------------------------------
// Feature
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Feature {
    pub id: String,
    pub description: String,
    pub status: FeatureStatus,
    #[serde(default)]
    pub verification_command: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub external_task_ref: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub last_verified_at: Option<DateTime<Utc>>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub last_verification_output: Option<String>,
    #[serde(default)]
    pub retry_count: u32,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub verified_via: Option<VerifiedVia>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub override_reason: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub last_failure_class: Option<FailureClass>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
    #[serde(default)]
    pub history: Vec<TransitionRecord>,
}

impl Feature {
    pub fn new(
        id: impl Into<String>,
        description: impl Into<String>,
        verification_command: impl Into<String>,
    ) -> Self {
        let now = Utc::now();
        Self {
            id: id.into(),
            description: description.into(),
            status: FeatureStatus::Pending,
            verification_command: verification_command.into(),
            external_task_ref: None,
            last_verified_at: None,
            last_verification_output: None,
            retry_count: 0,
            verified_via: None,
            override_reason: None,
            last_failure_class: None,
            created_at: now,
            updated_at: now,
            history: Vec::new(),
        }
    }

    pub fn can_apply(&self, event: Event, opts: &TransitionOpts) -> Result<FeatureStatus> {
        let target = self
            .status
            .apply(event)
            .ok_or_else(|| invalid_transition(self.status, event))?;

        if event == Event::Override && !opts.skip_verification {
            return Err(HarnessError::InvalidTransition {
                from: self.status,
                event,
                hint: Some("override requires the skip-verification flag".to_string()),
            });
        }

        Ok(target)
    }

    /// Apply `event` in place. On error the feature is left untouched.
    pub fn apply(
        &mut self,
        event: Event,
        opts: &TransitionOpts,
        session: Option<u32>,
    ) -> Result<TransitionRecord> {
        let target = self.can_apply(event, opts)?;
        let from = self.status;
        let now = Utc::now();

        match event {
            Event::Pass => {
                self.last_verified_at = Some(now);
                self.last_verification_output = opts.output.clone();
                self.verified_via = Some(VerifiedVia::Check);
                self.override_reason = None;
                self.retry_count = opts.failed_attempts;
                self.last_failure_class = opts.failure_class;
            }
            Event::Fail => {
                self.last_verification_output = opts.output.clone();
                self.retry_count = opts.failed_attempts;
                self.last_failure_class = opts.failure_class;
            }
            Event::Override => {
                self.last_verified_at = Some(now);
                self.verified_via = Some(VerifiedVia::Override);
                self.override_reason = opts.reason.clone();
                let notice = match &opts.reason {
                    Some(r) => format!("verification skipped (override): {r}"),
                    None => "verification skipped (override)".to_string(),
                };
                self.last_verification_output = Some(notice);
            }
            Event::Reset => {
                self.verified_via = None;
                self.override_reason = None;
                self.last_failure_class = None;
            }
            Event::Start | Event::Complete | Event::Resume => {}
        }

        if from == FeatureStatus::Failed || event == Event::Reset {
            self.retry_count = 0;
        }

        self.status = target;
        self.updated_at = now;

        let record = TransitionRecord {
            from,
            to: target,
            event,
            at: now,
            session,
        };
        self.history.push(record.clone());
        if self.history.len() > MAX_HISTORY {
            self.history.drain(..self.history.len() - MAX_HISTORY);
        }

        Ok(record)
    }

    pub fn is_verified_by_override(&self) -> bool {
        self.status == FeatureStatus::Verified && self.verified_via == Some(VerifiedVia::Override)
    }
}

// ---------------------------------------------------------------------------
// FeatureSpec
// ---------------------------------------------------------------------------

/// One entry of a feature list handed to `initialize`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct FeatureSpec {
    pub id: String,
    pub description: String,
    #[serde(default, alias = "verification_command")]
    pub verification: String,
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------
