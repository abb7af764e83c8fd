//! One-way mirror of feature status into an external task tracker.
//!
//! The registry never waits on the tracker for correctness: every call here is
//! best-effort, failures are logged and swallowed, and nothing is rolled back.

use crate::config::TrackerConfig;
use crate::feature::Feature;
use crate::types::{Event, FeatureStatus};
use regex::Regex;
use std::path::{Path, PathBuf};
use std::process::Command;
use std::sync::OnceLock;
use std::time::Duration;
use thiserror::Error;
use tokio_util::sync::CancellationToken;

const TRACKER_TIMEOUT: Duration = Duration::from_secs(5);

#[derive(Debug, Error)]
pub enum TrackerError {
    #[error("tracker command '{0}' not found on PATH")]
    Unavailable(String),

    #[error("tracker command exited with {code:?}: {output}")]
    CommandFailed { code: Option<i32>, output: String },

    #[error("tracker command timed out")]
    TimedOut,

    #[error("could not parse a task reference from tracker output: {0}")]
    NoRef(String),

    #[error(transparent)]
    Io(#[from] std::io::Error),
}

// ---------------------------------------------------------------------------
// TaskTracker
// ---------------------------------------------------------------------------

/// Capability interface over an external task tracker.
pub trait TaskTracker: Send + Sync {
    fn name(&self) -> &str;

    /// Create a task and return its reference. `Ok(None)` means the tracker
    /// deliberately does not create tasks.
    fn create_task(&self, description: &str) -> Result<Option<String>, TrackerError>;

    fn close_task(&self, task_ref: &str, reason: &str) -> Result<(), TrackerError>;

    fn update_task(&self, task_ref: &str, status: &str) -> Result<(), TrackerError>;
}

/// The tracker used when none is configured.
#[derive(Debug, Default, Clone, Copy)]
pub struct NoopTracker;

impl TaskTracker for NoopTracker {
    fn name(&self) -> &str {
        "none"
    }

    fn create_task(&self, _description: &str) -> Result<Option<String>, TrackerError> {
        Ok(None)
    }

    fn close_task(&self, _task_ref: &str, _reason: &str) -> Result<(), TrackerError> {
        Ok(())
    }

    fn update_task(&self, _task_ref: &str, _status: &str) -> Result<(), TrackerError> {
        Ok(())
    }
}

// ---------------------------------------------------------------------------
// CommandTracker
// ---------------------------------------------------------------------------

/// Drives any CLI tracker through argv templates.
///
/// Placeholders `{description}`, `{ref}`, `{status}` and `{reason}` are
/// substituted per argument, so values are never re-split by a shell.
#[derive(Debug, Clone)]
pub struct CommandTracker {
    create: Vec<String>,
    close: Vec<String>,
    update: Vec<String>,
    cwd: PathBuf,
}

impl CommandTracker {
    pub fn new(create: Vec<String>, close: Vec<String>, update: Vec<String>, cwd: &Path) -> Self {
        Self {
            create,
            close,
            update,
            cwd: cwd.to_path_buf(),
        }
    }

    fn invoke(&self, template: &[String], vars: &[(&str, &str)]) -> Result<String, TrackerError> {
        let Some(program) = template.first() else {
            return Err(TrackerError::Unavailable(String::new()));
        };
        if which::which(program).is_err() {
            return Err(TrackerError::Unavailable(program.clone()));
        }

        let mut cmd = Command::new(program);
        for arg in &template[1..] {
            cmd.arg(render(arg, vars));
        }
        cmd.current_dir(&self.cwd);

        let out = crate::process::run(cmd, Some(TRACKER_TIMEOUT), &CancellationToken::new())?;
        if out.timed_out {
            return Err(TrackerError::TimedOut);
        }
        if !out.success() {
            return Err(TrackerError::CommandFailed {
                code: out.exit_code,
                output: crate::io::tail(&out.output, 500).to_string(),
            });
        }
        Ok(out.output)
    }
}

impl TaskTracker for CommandTracker {
    fn name(&self) -> &str {
        self.create.first().map(String::as_str).unwrap_or("command")
    }

    fn create_task(&self, description: &str) -> Result<Option<String>, TrackerError> {
        let stdout = self.invoke(&self.create, &[("description", description)])?;
        parse_task_ref(&stdout)
            .map(Some)
            .ok_or(TrackerError::NoRef(stdout))
    }

    fn close_task(&self, task_ref: &str, reason: &str) -> Result<(), TrackerError> {
        self.invoke(&self.close, &[("ref", task_ref), ("reason", reason)])
            .map(|_| ())
    }

    fn update_task(&self, task_ref: &str, status: &str) -> Result<(), TrackerError> {
        self.invoke(&self.update, &[("ref", task_ref), ("status", status)])
            .map(|_| ())
    }
}

fn render(arg: &str, vars: &[(&str, &str)]) -> String {
    let mut out = arg.to_string();
    for (key, value) in vars {
        out = out.replace(&format!("{{{key}}}"), value);
    }
    out
}

static CREATED_RE: OnceLock<Regex> = OnceLock::new();

/// Pull a task id out of tracker output: either `Created: <id>` or a single
/// bare token.
pub fn parse_task_ref(stdout: &str) -> Option<String> {
    let re = CREATED_RE.get_or_init(|| {
        Regex::new(r"(?:Created|created)(?: issue)?:\s*(\S+)").expect("static regex is valid")
    });
    if let Some(caps) = re.captures(stdout) {
        return Some(caps[1].to_string());
    }
    let trimmed = stdout.trim();
    if !trimmed.is_empty() && !trimmed.contains(char::is_whitespace) {
        return Some(trimmed.to_string());
    }
    None
}

/// Build the tracker named by the project config.
pub fn tracker_from_config(cfg: &TrackerConfig, root: &Path) -> Box<dyn TaskTracker> {
    match cfg {
        TrackerConfig::None => Box::new(NoopTracker),
        TrackerConfig::Command {
            create,
            close,
            update,
        } => Box::new(CommandTracker::new(
            create.clone(),
            close.clone(),
            update.clone(),
            root,
        )),
    }
}

// ---------------------------------------------------------------------------
// Bridge
// ---------------------------------------------------------------------------

pub struct Bridge {
    tracker: Box<dyn TaskTracker>,
}

impl Bridge {
    pub fn new(tracker: Box<dyn TaskTracker>) -> Self {
        Self { tracker }
    }

    pub fn tracker_name(&self) -> &str {
        self.tracker.name()
    }

    /// Best-effort task creation for a new feature.
    pub fn on_create(&self, id: &str, description: &str) -> Option<String> {
        match self.tracker.create_task(description) {
            Ok(task_ref) => task_ref,
            Err(e) => {
                tracing::warn!(
                    feature = id,
                    tracker = self.tracker.name(),
                    "task creation failed, continuing without a task ref: {e}"
                );
                None
            }
        }
    }

    /// Mirror a committed transition. Never fails.
    pub fn after_transition(&self, feature: &Feature, event: Event) {
        let Some(task_ref) = feature.external_task_ref.as_deref() else {
            return;
        };
        let result = match feature.status {
            FeatureStatus::Verified => {
                let reason = match event {
                    Event::Override => format!("Feature {} verified (override)", feature.id),
                    _ => format!("Feature {} verified", feature.id),
                };
                self.tracker.close_task(task_ref, &reason)
            }
            FeatureStatus::InProgress => self
                .tracker
                .update_task(task_ref, FeatureStatus::InProgress.as_str()),
            _ => return,
        };
        if let Err(e) = result {
            tracing::warn!(
                feature = %feature.id,
                task = task_ref,
                tracker = self.tracker.name(),
                "tracker sync failed: {e}"
            );
        }
    }
}

impl Default for Bridge {
    fn default() -> Self {
        Self::new(Box::new(NoopTracker))
    }
}

// ---------------------------------------------------------------------------
// Test support
// ---------------------------------------------------------------------------


// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------
