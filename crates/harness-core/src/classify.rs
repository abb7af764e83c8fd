//! Advisory root-cause classification of failed verification output.
//!
//! The categories feed a hint shown to whoever picks the feature back up.
//! Nothing in the state machine branches on them.

use regex::Regex;
use serde::{Deserialize, Serialize};
use std::fmt;
use std::sync::OnceLock;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum FailureClass {
    AssertionFailure,
    BuildError,
    Timeout,
    Unknown,
}

impl FailureClass {
    pub fn as_str(self) -> &'static str {
        match self {
            FailureClass::AssertionFailure => "assertion_failure",
            FailureClass::BuildError => "build_error",
            FailureClass::Timeout => "timeout",
            FailureClass::Unknown => "unknown",
        }
    }

    /// Short root-cause note attached to the failure report.
    pub fn root_cause_hint(self) -> &'static str {
        match self {
            FailureClass::AssertionFailure => {
                "the code builds but behaves differently than the check expects; \
                 read the first failing assertion before changing tests"
            }
            FailureClass::BuildError => {
                "the check never reached the tests; fix compilation, imports, or \
                 missing dependencies first"
            }
            FailureClass::Timeout => {
                "the check did not finish in time; look for hangs, deadlocks, or \
                 waits on unavailable services"
            }
            FailureClass::Unknown => {
                "no recognizable failure pattern; inspect the captured output directly"
            }
        }
    }
}

impl fmt::Display for FailureClass {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

static BUILD_RE: OnceLock<Regex> = OnceLock::new();
static ASSERT_RE: OnceLock<Regex> = OnceLock::new();

fn build_re() -> &'static Regex {
    BUILD_RE.get_or_init(|| {
        Regex::new(
            r"(?i)(error\[E\d{4}\]|could not compile|compilation (failed|error)|build failed|cannot find (module|package|crate|symbol)|undefined reference|undefined: \w|syntaxerror|modulenotfounderror|importerror|error TS\d+|unresolved import)",
        )
        .expect("static regex is valid")
    })
}

fn assert_re() -> &'static Regex {
    ASSERT_RE.get_or_init(|| {
        Regex::new(
            r"(?i)(assert|panicked at|test result: failed|--- fail|\bfailed\b|\bfail\b|expected:|expected .+ (got|but|to be))",
        )
        .expect("static regex is valid")
    })
}

/// Classify one failed attempt. Timeouts win regardless of output; build
/// errors are checked before assertions because a broken build often prints
/// both.
pub fn classify(output: &str, timed_out: bool) -> FailureClass {
    if timed_out {
        return FailureClass::Timeout;
    }
    if build_re().is_match(output) {
        return FailureClass::BuildError;
    }
    if assert_re().is_match(output) {
        return FailureClass::AssertionFailure;
    }
    FailureClass::Unknown
}

/// Most frequent class across attempts; ties go to the latest attempt.
pub fn aggregate(classes: &[FailureClass]) -> FailureClass {
    let mut best = FailureClass::Unknown;
    let mut best_count = 0;
    for (i, class) in classes.iter().enumerate() {
        let count = classes.iter().filter(|c| *c == class).count();
        let latest_of_kind = !classes[i + 1..].contains(class);
        if latest_of_kind && count >= best_count {
            best = *class;
            best_count = count;
        }
    }
    best
}
