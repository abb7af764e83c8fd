use crate::classify::FailureClass;
use crate::types::{Event, FeatureStatus};
use std::path::PathBuf;
use thiserror::Error;

#[derive(Debug, Error)]
pub enum HarnessError {
    #[error("harness not initialized: run 'harness init'")]
    NotInitialized,

    #[error("feature not found: {0}")]
    NotFound(String),

    #[error("feature already exists: {0}")]
    DuplicateFeature(String),

    #[error("invalid feature id '{0}': must be lowercase alphanumeric with hyphens")]
    InvalidId(String),

    #[error("invalid transition: cannot apply '{event}' to a feature in status '{from}'{}", hint_suffix(.hint))]
    InvalidTransition {
        from: FeatureStatus,
        event: Event,
        hint: Option<String>,
    },

    #[error("verification failed for '{id}' after {attempts} attempt(s) ({classification})")]
    VerificationFailed {
        id: String,
        attempts: u32,
        classification: FailureClass,
    },

    #[error("verification runner unavailable for '{id}': {reason}")]
    RunnerUnavailable { id: String, reason: String },

    #[error("verification of '{0}' was cancelled")]
    Cancelled(String),

    #[error("feature '{0}' changed while its verification was running; run verify again")]
    StaleVerification(String),

    #[error("state schema version {found} is not supported (this build reads up to {supported}); migrate the state file manually")]
    SchemaMismatch { found: u32, supported: u32 },

    #[error("state store is locked by another harness process ({attempts} attempts)")]
    LockContention { attempts: u32 },

    #[error("state store at {} is unreadable: {reason}", path.display())]
    StoreCorrupted { path: PathBuf, reason: String },

    #[error(transparent)]
    Io(#[from] std::io::Error),

    #[error(transparent)]
    Yaml(#[from] serde_yaml::Error),

    #[error(transparent)]
    Json(#[from] serde_json::Error),
}

fn hint_suffix(hint: &Option<String>) -> String {
    match hint {
        Some(h) => format!(" ({h})"),
        None => String::new(),
    }
}

impl HarnessError {
    /// Errors that leave the harness unable to continue until a human
    /// intervenes (store unreadable, schema from a newer build, lock held).
    pub fn is_fatal(&self) -> bool {
        matches!(
            self,
            HarnessError::SchemaMismatch { .. }
                | HarnessError::StoreCorrupted { .. }
                | HarnessError::LockContention { .. }
                | HarnessError::Io(_)
        )
    }
}

pub type Result<T> = std::result::Result<T, HarnessError>;
