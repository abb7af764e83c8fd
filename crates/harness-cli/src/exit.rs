//! Process exit codes.
//!
//! `0` success, `1` usage or rejected operation, `2` session end blocked,
//! `3` persistence or environment failure.

use harness_core::HarnessError;
use thiserror::Error;

pub const SUCCESS: i32 = 0;
pub const USAGE: i32 = 1;
pub const BLOCKED: i32 = 2;
pub const INTERNAL: i32 = 3;

/// Returned by `session end` when unverified features remain.
#[derive(Debug, Error)]
#[error("session end blocked: {} feature(s) implemented but not verified: {}", .0.len(), .0.join(", "))]
pub struct GateBlocked(pub Vec<String>);

pub fn code_for_harness(e: &HarnessError) -> i32 {
    match e {
        HarnessError::NotInitialized
        | HarnessError::NotFound(_)
        | HarnessError::DuplicateFeature(_)
        | HarnessError::InvalidId(_)
        | HarnessError::InvalidTransition { .. }
        | HarnessError::VerificationFailed { .. }
        | HarnessError::Cancelled(_)
        | HarnessError::StaleVerification(_) => USAGE,
        HarnessError::RunnerUnavailable { .. }
        | HarnessError::SchemaMismatch { .. }
        | HarnessError::LockContention { .. }
        | HarnessError::StoreCorrupted { .. }
        | HarnessError::Io(_)
        | HarnessError::Yaml(_)
        | HarnessError::Json(_) => INTERNAL,
    }
}

/// Walk the error chain for the first cause with a known code.
pub fn code_for(err: &anyhow::Error) -> i32 {
    for cause in err.chain() {
        if cause.downcast_ref::<GateBlocked>().is_some() {
            return BLOCKED;
        }
        if let Some(e) = cause.downcast_ref::<HarnessError>() {
            return code_for_harness(e);
        }
        if cause.downcast_ref::<std::io::Error>().is_some()
            || cause.downcast_ref::<serde_yaml::Error>().is_some()
            || cause.downcast_ref::<serde_json::Error>().is_some()
        {
            return INTERNAL;
        }
    }
    USAGE
}
