use crate::classify::{self, FailureClass};
use crate::error::{HarnessError, Result};
use crate::feature::TransitionOpts;
use crate::process::{self, ProcessOutput};
use crate::registry::Registry;
use crate::types::{invalid_transition, Event, FeatureStatus};
use serde::{Deserialize, Serialize};
use std::path::Path;
use std::process::Command;
use std::time::Duration;
use tokio_util::sync::CancellationToken;

/// Shells that could not run the command at all report these.
const EXIT_NOT_EXECUTABLE: i32 = 126;
const EXIT_NOT_FOUND: i32 = 127;

// ---------------------------------------------------------------------------
// Verifier
// ---------------------------------------------------------------------------

/// Executes one verification command. `Err` means the command could not be
/// launched at all, as opposed to launched and failed.
pub trait Verifier: Send + Sync {
    fn execute(
        &self,
        command: &str,
        cwd: &Path,
        timeout: Option<Duration>,
        cancel: &CancellationToken,
    ) -> std::io::Result<ProcessOutput>;
}

/// Runs commands through `sh -c` in the project root.
#[derive(Debug, Default, Clone, Copy)]
pub struct ShellVerifier;

impl Verifier for ShellVerifier {
    fn execute(
        &self,
        command: &str,
        cwd: &Path,
        timeout: Option<Duration>,
        cancel: &CancellationToken,
    ) -> std::io::Result<ProcessOutput> {
        let shell = which::which("sh").map_err(|e| {
            std::io::Error::new(std::io::ErrorKind::NotFound, format!("sh not found on PATH: {e}"))
        })?;
        let mut cmd = Command::new(shell);
        cmd.arg("-c").arg(command).current_dir(cwd);
        process::run(cmd, timeout, cancel)
    }
}

// ---------------------------------------------------------------------------
// Reports
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct AttemptReport {
    pub attempt: u32,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub exit_code: Option<i32>,
    pub passed: bool,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub classification: Option<FailureClass>,
    pub duration_ms: u64,
    /// Tail of this attempt's output.
    pub excerpt: String,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct VerificationReport {
    pub feature: String,
    pub status: FeatureStatus,
    pub attempts: Vec<AttemptReport>,
    /// Aggregated class of the failed attempts, if any failed.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub classification: Option<FailureClass>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub root_cause: Option<String>,
}

impl VerificationReport {
    pub fn passed(&self) -> bool {
        self.status == FeatureStatus::Verified
    }

    pub fn failed_attempts(&self) -> u32 {
        self.attempts.iter().filter(|a| !a.passed).count() as u32
    }
}

/// Outcome for one feature of a batch run.
#[derive(Debug)]
pub struct BatchOutcome {
    pub id: String,
    pub outcome: Result<VerificationReport>,
}

// ---------------------------------------------------------------------------
// VerificationRunner
// ---------------------------------------------------------------------------

pub struct VerificationRunner<'a> {
    registry: &'a Registry,
    verifier: Box<dyn Verifier>,
    cancel: CancellationToken,
}

impl<'a> VerificationRunner<'a> {
    pub fn new(registry: &'a Registry) -> Self {
        Self {
            registry,
            verifier: Box::new(ShellVerifier),
            cancel: CancellationToken::new(),
        }
    }

    pub fn with_verifier(mut self, verifier: Box<dyn Verifier>) -> Self {
        self.verifier = verifier;
        self
    }

    pub fn with_cancel(mut self, cancel: CancellationToken) -> Self {
        self.cancel = cancel;
        self
    }

    /// Run the feature's verification command, retrying failed attempts, and
    /// commit the result as a single `pass` or `fail` transition.
    ///
    /// When every attempt fails the `failed` status is persisted and
    /// `VerificationFailed` is returned. Launch failures and cancellation
    /// persist nothing.
    pub fn verify(&self, id: &str) -> Result<VerificationReport> {
        let feature = self.registry.get(id)?;
        if feature.status != FeatureStatus::Implemented {
            return Err(invalid_transition(feature.status, Event::Pass));
        }
        let command = feature.verification_command.trim();
        if command.is_empty() {
            return Err(HarnessError::RunnerUnavailable {
                id: id.to_string(),
                reason: "no verification command configured".to_string(),
            });
        }

        let cfg = &self.registry.config().verification;
        let max_attempts = cfg.max_attempts.max(1);
        let excerpt_limit = cfg.output_limit_bytes / max_attempts as usize;
        let mut attempts: Vec<AttemptReport> = Vec::new();

        for attempt in 1..=max_attempts {
            if self.cancel.is_cancelled() {
                return Err(HarnessError::Cancelled(id.to_string()));
            }
            tracing::info!(feature = id, attempt, max_attempts, "running verification");

            let out = self
                .verifier
                .execute(command, self.registry.root(), cfg.timeout(), &self.cancel)
                .map_err(|e| HarnessError::RunnerUnavailable {
                    id: id.to_string(),
                    reason: e.to_string(),
                })?;

            if out.cancelled {
                return Err(HarnessError::Cancelled(id.to_string()));
            }
            if let Some(code @ (EXIT_NOT_EXECUTABLE | EXIT_NOT_FOUND)) = out.exit_code {
                return Err(HarnessError::RunnerUnavailable {
                    id: id.to_string(),
                    reason: format!(
                        "command could not be executed (exit {code}): {}",
                        crate::io::tail(&out.output, 512)
                    ),
                });
            }

            let passed = out.success();
            let classification = (!passed).then(|| classify::classify(&out.output, out.timed_out));
            match classification {
                Some(class) => tracing::warn!(feature = id, attempt, %class, "verification attempt failed"),
                None => tracing::info!(feature = id, attempt, "verification passed"),
            }
            attempts.push(AttemptReport {
                attempt,
                exit_code: out.exit_code,
                passed,
                classification,
                duration_ms: out.duration.as_millis() as u64,
                excerpt: crate::io::tail(&out.output, excerpt_limit).to_string(),
            });
            if passed {
                break;
            }
        }

        let failures: Vec<FailureClass> = attempts.iter().filter_map(|a| a.classification).collect();
        let passed = attempts.last().is_some_and(|a| a.passed);
        let classification = (!failures.is_empty()).then(|| classify::aggregate(&failures));
        let opts = TransitionOpts {
            output: Some(render_output(&attempts, max_attempts, cfg.output_limit_bytes)),
            failed_attempts: failures.len() as u32,
            failure_class: classification,
            ..Default::default()
        };

        let event = if passed { Event::Pass } else { Event::Fail };
        let updated = self
            .registry
            .transition_if_unchanged(id, event, &opts, feature.updated_at)?;

        if !passed {
            let classification = classification.unwrap_or(FailureClass::Unknown);
            return Err(HarnessError::VerificationFailed {
                id: id.to_string(),
                attempts: attempts.len() as u32,
                classification,
            });
        }

        Ok(VerificationReport {
            feature: id.to_string(),
            status: updated.status,
            attempts,
            classification,
            root_cause: classification.map(|c| c.root_cause_hint().to_string()),
        })
    }

    /// Verify every `implemented` feature in insertion order.
    ///
    /// Stops early when the runner cannot launch commands, when cancelled, or
    /// when the store itself fails; the stopping outcome is included.
    pub fn verify_all_implemented(&self) -> Result<Vec<BatchOutcome>> {
        let pending = self.registry.list(Some(FeatureStatus::Implemented))?;
        let mut outcomes = Vec::with_capacity(pending.len());
        for feature in pending {
            let outcome = self.verify(&feature.id);
            let stop = match &outcome {
                Err(HarnessError::RunnerUnavailable { .. }) | Err(HarnessError::Cancelled(_)) => true,
                Err(e) => e.is_fatal(),
                Ok(_) => false,
            };
            outcomes.push(BatchOutcome {
                id: feature.id,
                outcome,
            });
            if stop {
                break;
            }
        }
        Ok(outcomes)
    }
}

/// One block per attempt, newest last, capped to `limit` bytes from the end.
fn render_output(attempts: &[AttemptReport], max_attempts: u32, limit: usize) -> String {
    let mut out = String::new();
    for a in attempts {
        let verdict = match (a.passed, a.classification) {
            (true, _) => "passed".to_string(),
            (false, Some(class)) => match a.exit_code {
                Some(code) => format!("exit {code} ({class})"),
                None => format!("no exit code ({class})"),
            },
            (false, None) => "failed".to_string(),
        };
        if !out.is_empty() {
            out.push('\n');
        }
        out.push_str(&format!("--- attempt {}/{max_attempts}: {verdict} ---\n", a.attempt));
        out.push_str(&a.excerpt);
    }
    crate::io::tail(&out, limit).to_string()
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------

#[cfg(test)]
mod tests {
    use super::*;
    use crate::bridge::NoopTracker;
    use crate::config::Config;
    use std::collections::VecDeque;
    use std::sync::atomic::{AtomicU32, Ordering};
    use std::sync::{Arc, Mutex};
    use tempfile::TempDir;

    /// Replays canned outcomes in order.
    #[derive(Clone, Default)]
    struct Scripted {
        outcomes: Arc<Mutex<VecDeque<std::io::Result<ProcessOutput>>>>,
        calls: Arc<AtomicU32>,
    }

    impl Scripted {
        fn new(outcomes: Vec<std::io::Result<ProcessOutput>>) -> Self {
            Self {
                outcomes: Arc::new(Mutex::new(outcomes.into())),
                calls: Arc::default(),
            }
        }

        fn calls(&self) -> u32 {
            self.calls.load(Ordering::SeqCst)
        }
    }

    impl Verifier for Scripted {
        fn execute(
            &self,
            _command: &str,
            _cwd: &Path,
            _timeout: Option<Duration>,
            _cancel: &CancellationToken,
        ) -> std::io::Result<ProcessOutput> {
            self.calls.fetch_add(1, Ordering::SeqCst);
            self.outcomes
                .lock()
                .unwrap()
                .pop_front()
                .expect("verifier called more often than scripted")
        }
    }

    fn exit(code: i32, output: &str) -> std::io::Result<ProcessOutput> {
        Ok(ProcessOutput {
            exit_code: Some(code),
            output: output.to_string(),
            timed_out: false,
            cancelled: false,
            duration: Duration::from_millis(5),
        })
    }

    fn timed_out() -> std::io::Result<ProcessOutput> {
        Ok(ProcessOutput {
            exit_code: None,
            output: String::new(),
            timed_out: true,
            cancelled: false,
            duration: Duration::from_secs(1),
        })
    }

    fn setup(dir: &TempDir, config: Config, features: &[(&str, &str)]) -> Registry {
        let r = Registry::with_tracker(dir.path(), config, Box::new(NoopTracker));
        r.init_store().unwrap();
        let none = TransitionOpts::default();
        for (id, cmd) in features {
            r.create(id, id, cmd).unwrap();
            r.transition(id, Event::Start, &none).unwrap();
            r.transition(id, Event::Complete, &none).unwrap();
        }
        r
    }

    #[test]
    fn pass_on_first_attempt() {
        let dir = TempDir::new().unwrap();
        let r = setup(&dir, Config::default(), &[("auth-login", "exit 0")]);
        let verifier = Scripted::new(vec![exit(0, "all good")]);

        let report = VerificationRunner::new(&r)
            .with_verifier(Box::new(verifier.clone()))
            .verify("auth-login")
            .unwrap();

        assert!(report.passed());
        assert_eq!(report.attempts.len(), 1);
        assert!(report.classification.is_none());
        assert_eq!(verifier.calls(), 1);

        let f = r.get("auth-login").unwrap();
        assert_eq!(f.status, FeatureStatus::Verified);
        assert_eq!(f.retry_count, 0);
        assert!(f.last_verified_at.is_some());
        assert!(f.last_verification_output.unwrap().contains("all good"));
    }

    #[test]
    fn three_failures_mark_failed() {
        let dir = TempDir::new().unwrap();
        let r = setup(&dir, Config::default(), &[("flaky", "exit 1")]);
        let verifier = Scripted::new(vec![
            exit(1, "assertion failed: left == right"),
            exit(1, "assertion failed: left == right"),
            exit(1, "assertion failed: left == right"),
        ]);

        let err = VerificationRunner::new(&r)
            .with_verifier(Box::new(verifier.clone()))
            .verify("flaky")
            .unwrap_err();

        assert!(matches!(
            err,
            HarnessError::VerificationFailed { ref id, attempts: 3, classification: FailureClass::AssertionFailure }
                if id == "flaky"
        ));
        assert_eq!(verifier.calls(), 3);

        let f = r.get("flaky").unwrap();
        assert_eq!(f.status, FeatureStatus::Failed);
        assert_eq!(f.retry_count, 3);
        assert_eq!(f.last_failure_class, Some(FailureClass::AssertionFailure));
        assert!(f.last_verified_at.is_none());
        let output = f.last_verification_output.unwrap();
        assert!(output.contains("attempt 1/3"));
        assert!(output.contains("attempt 3/3"));

        let f = r.transition("flaky", Event::Resume, &TransitionOpts::default()).unwrap();
        assert_eq!(f.status, FeatureStatus::InProgress);
        assert_eq!(f.retry_count, 0);
    }

    #[test]
    fn pass_on_last_attempt_keeps_retry_count() {
        let dir = TempDir::new().unwrap();
        let r = setup(&dir, Config::default(), &[("flaky", "./check")]);
        let verifier = Scripted::new(vec![
            exit(1, "error[E0425]: cannot find value"),
            exit(1, "FAILED tests::login"),
            exit(0, "ok"),
        ]);

        let report = VerificationRunner::new(&r)
            .with_verifier(Box::new(verifier))
            .verify("flaky")
            .unwrap();

        assert!(report.passed());
        assert_eq!(report.attempts.len(), 3);
        assert_eq!(report.failed_attempts(), 2);
        assert!(report.root_cause.is_some());

        let f = r.get("flaky").unwrap();
        assert_eq!(f.status, FeatureStatus::Verified);
        assert_eq!(f.retry_count, 2);
        // A single committed transition: pending, in_progress, implemented, verified.
        assert_eq!(f.history.len(), 3);
    }

    #[test]
    fn timeouts_are_classified() {
        let dir = TempDir::new().unwrap();
        let mut cfg = Config::default();
        cfg.verification.max_attempts = 2;
        let r = setup(&dir, cfg, &[("slow", "sleep 999")]);
        let verifier = Scripted::new(vec![timed_out(), timed_out()]);

        let err = VerificationRunner::new(&r)
            .with_verifier(Box::new(verifier))
            .verify("slow")
            .unwrap_err();
        assert!(matches!(
            err,
            HarnessError::VerificationFailed { attempts: 2, classification: FailureClass::Timeout, .. }
        ));
        let output = r.get("slow").unwrap().last_verification_output.unwrap();
        assert!(output.contains("no exit code (timeout)"));
    }

    #[test]
    fn not_implemented_is_rejected_without_running() {
        let dir = TempDir::new().unwrap();
        let r = setup(&dir, Config::default(), &[]);
        r.create("early", "Early", "exit 0").unwrap();
        let verifier = Scripted::new(vec![]);

        let err = VerificationRunner::new(&r)
            .with_verifier(Box::new(verifier.clone()))
            .verify("early")
            .unwrap_err();
        assert!(matches!(
            err,
            HarnessError::InvalidTransition { from: FeatureStatus::Pending, event: Event::Pass, .. }
        ));
        assert_eq!(verifier.calls(), 0);
    }

    #[test]
    fn launch_failure_is_runner_unavailable_and_persists_nothing() {
        let dir = TempDir::new().unwrap();
        let r = setup(&dir, Config::default(), &[("a", "exit 0")]);
        let before = r.get("a").unwrap();
        let verifier = Scripted::new(vec![Err(std::io::Error::new(
            std::io::ErrorKind::NotFound,
            "sh not found",
        ))]);

        let err = VerificationRunner::new(&r)
            .with_verifier(Box::new(verifier.clone()))
            .verify("a")
            .unwrap_err();
        assert!(matches!(err, HarnessError::RunnerUnavailable { .. }));
        assert_eq!(verifier.calls(), 1);
        assert_eq!(r.get("a").unwrap(), before);
    }

    #[test]
    fn command_not_found_exit_is_runner_unavailable() {
        let dir = TempDir::new().unwrap();
        let r = setup(&dir, Config::default(), &[("a", "no-such-tool")]);
        let verifier = Scripted::new(vec![exit(127, "sh: no-such-tool: not found")]);

        let err = VerificationRunner::new(&r)
            .with_verifier(Box::new(verifier.clone()))
            .verify("a")
            .unwrap_err();
        assert!(matches!(err, HarnessError::RunnerUnavailable { ref reason, .. } if reason.contains("127")));
        assert_eq!(verifier.calls(), 1);
        assert_eq!(r.get("a").unwrap().status, FeatureStatus::Implemented);
    }

    #[test]
    fn empty_command_is_runner_unavailable() {
        let dir = TempDir::new().unwrap();
        let r = setup(&dir, Config::default(), &[("a", "   ")]);
        let err = VerificationRunner::new(&r)
            .with_verifier(Box::new(Scripted::new(vec![])))
            .verify("a")
            .unwrap_err();
        assert!(matches!(err, HarnessError::RunnerUnavailable { .. }));
    }

    #[test]
    fn cancelled_before_start_runs_nothing() {
        let dir = TempDir::new().unwrap();
        let r = setup(&dir, Config::default(), &[("a", "exit 0")]);
        let token = CancellationToken::new();
        token.cancel();
        let verifier = Scripted::new(vec![]);

        let err = VerificationRunner::new(&r)
            .with_verifier(Box::new(verifier.clone()))
            .with_cancel(token)
            .verify("a")
            .unwrap_err();
        assert!(matches!(err, HarnessError::Cancelled(ref id) if id == "a"));
        assert_eq!(verifier.calls(), 0);
        assert_eq!(r.get("a").unwrap().status, FeatureStatus::Implemented);
    }

    #[test]
    fn cancelled_attempt_discards_earlier_failures() {
        let dir = TempDir::new().unwrap();
        let r = setup(&dir, Config::default(), &[("a", "exit 0")]);
        let before = r.get("a").unwrap();
        let cancelled = Ok(ProcessOutput {
            exit_code: None,
            output: String::new(),
            timed_out: false,
            cancelled: true,
            duration: Duration::from_millis(10),
        });
        let verifier = Scripted::new(vec![exit(1, "FAILED"), cancelled]);

        let err = VerificationRunner::new(&r)
            .with_verifier(Box::new(verifier))
            .verify("a")
            .unwrap_err();
        assert!(matches!(err, HarnessError::Cancelled(_)));
        assert_eq!(r.get("a").unwrap(), before);
    }

    /// Resets and re-completes the feature from another registry handle while
    /// the check is "running", then reports a pass.
    struct ReworkedMidRun {
        root: std::path::PathBuf,
        id: &'static str,
    }

    impl Verifier for ReworkedMidRun {
        fn execute(
            &self,
            _command: &str,
            _cwd: &Path,
            _timeout: Option<Duration>,
            _cancel: &CancellationToken,
        ) -> std::io::Result<ProcessOutput> {
            let other = Registry::with_tracker(&self.root, Config::default(), Box::new(NoopTracker));
            let none = TransitionOpts::default();
            for event in [Event::Reset, Event::Start, Event::Complete] {
                other.transition(self.id, event, &none).unwrap();
            }
            exit(0, "ok")
        }
    }

    #[test]
    fn result_is_discarded_when_feature_changed_during_run() {
        let dir = TempDir::new().unwrap();
        let r = setup(&dir, Config::default(), &[("a", "exit 0")]);
        let verifier = ReworkedMidRun {
            root: dir.path().to_path_buf(),
            id: "a",
        };

        let err = VerificationRunner::new(&r)
            .with_verifier(Box::new(verifier))
            .verify("a")
            .unwrap_err();
        assert!(matches!(err, HarnessError::StaleVerification(ref id) if id == "a"));

        let f = r.get("a").unwrap();
        assert_eq!(f.status, FeatureStatus::Implemented);
        assert!(f.last_verified_at.is_none());
        assert!(f.history.iter().all(|h| h.event != Event::Pass));
    }

    #[test]
    fn stored_output_is_bounded() {
        let dir = TempDir::new().unwrap();
        let mut cfg = Config::default();
        cfg.verification.output_limit_bytes = 300;
        let r = setup(&dir, cfg, &[("noisy", "yes")]);
        let noise = "x".repeat(10_000);
        let verifier = Scripted::new(vec![exit(1, &noise), exit(1, &noise), exit(1, &noise)]);

        let _ = VerificationRunner::new(&r)
            .with_verifier(Box::new(verifier))
            .verify("noisy");
        let output = r.get("noisy").unwrap().last_verification_output.unwrap();
        assert!(output.len() <= 300);
        assert!(output.contains("attempt 3/3"));
    }

    #[test]
    fn batch_verifies_in_insertion_order() {
        let dir = TempDir::new().unwrap();
        let r = setup(&dir, Config::default(), &[("auth-login", "exit 0"), ("flaky", "exit 1")]);
        let verifier = Scripted::new(vec![
            exit(0, "ok"),
            exit(1, "boom"),
            exit(1, "boom"),
            exit(1, "boom"),
        ]);

        let outcomes = VerificationRunner::new(&r)
            .with_verifier(Box::new(verifier))
            .verify_all_implemented()
            .unwrap();
        assert_eq!(outcomes.len(), 2);
        assert_eq!(outcomes[0].id, "auth-login");
        assert!(outcomes[0].outcome.is_ok());
        assert!(matches!(
            outcomes[1].outcome,
            Err(HarnessError::VerificationFailed { attempts: 3, .. })
        ));
        assert_eq!(r.summary().unwrap().verified, 1);
        assert_eq!(r.summary().unwrap().failed, 1);
    }

    #[test]
    fn batch_stops_when_runner_unavailable() {
        let dir = TempDir::new().unwrap();
        let r = setup(&dir, Config::default(), &[("a", "x"), ("b", "y")]);
        let verifier = Scripted::new(vec![exit(127, "not found")]);

        let outcomes = VerificationRunner::new(&r)
            .with_verifier(Box::new(verifier.clone()))
            .verify_all_implemented()
            .unwrap();
        assert_eq!(outcomes.len(), 1);
        assert_eq!(verifier.calls(), 1);
        assert_eq!(r.summary().unwrap().implemented, 2);
    }

    #[cfg(unix)]
    #[test]
    fn shell_verifier_runs_in_project_root() {
        let dir = TempDir::new().unwrap();
        std::fs::write(dir.path().join("marker.txt"), "present").unwrap();
        let r = setup(&dir, Config::default(), &[("marker", "grep -q present marker.txt")]);

        let report = VerificationRunner::new(&r).verify("marker").unwrap();
        assert!(report.passed());
    }

    #[cfg(unix)]
    #[test]
    fn shell_verifier_times_out() {
        let dir = TempDir::new().unwrap();
        let mut cfg = Config::default();
        cfg.verification.timeout_seconds = 1;
        cfg.verification.max_attempts = 1;
        let r = setup(&dir, cfg, &[("hang", "sleep 30")]);

        let err = VerificationRunner::new(&r).verify("hang").unwrap_err();
        assert!(matches!(
            err,
            HarnessError::VerificationFailed { classification: FailureClass::Timeout, .. }
        ));
    }
}
