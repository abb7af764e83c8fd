use crate::bridge::{tracker_from_config, Bridge, TaskTracker};
use crate::config::Config;
use crate::error::{HarnessError, Result};
use crate::feature::{Feature, FeatureSpec, TransitionOpts};
use crate::lock::StoreLock;
use crate::paths;
use crate::session::{SessionRecord, SessionStart};
use crate::store::State;
use crate::types::{Event, FeatureStatus};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};

// ---------------------------------------------------------------------------
// Summary
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct Summary {
    pub pending: usize,
    pub in_progress: usize,
    pub implemented: usize,
    pub verified: usize,
    pub failed: usize,
    pub total: usize,
}

impl Summary {
    pub fn count(&self, status: FeatureStatus) -> usize {
        match status {
            FeatureStatus::Pending => self.pending,
            FeatureStatus::InProgress => self.in_progress,
            FeatureStatus::Implemented => self.implemented,
            FeatureStatus::Verified => self.verified,
            FeatureStatus::Failed => self.failed,
        }
    }

    fn bump(&mut self, status: FeatureStatus) {
        match status {
            FeatureStatus::Pending => self.pending += 1,
            FeatureStatus::InProgress => self.in_progress += 1,
            FeatureStatus::Implemented => self.implemented += 1,
            FeatureStatus::Verified => self.verified += 1,
            FeatureStatus::Failed => self.failed += 1,
        }
        self.total += 1;
    }
}

// ---------------------------------------------------------------------------
// InitReport
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct InitReport {
    pub created: Vec<String>,
    /// Listed ids that already existed and were left alone.
    pub skipped: Vec<String>,
    pub session: SessionStart,
}

// ---------------------------------------------------------------------------
// Registry
// ---------------------------------------------------------------------------

/// All reads and writes of a project's features and sessions.
///
/// Mutations run as one cycle: take the store lock, re-read the document,
/// apply the change, write it back atomically, release. A failed closure
/// writes nothing.
pub struct Registry {
    root: PathBuf,
    config: Config,
    bridge: Bridge,
}

impl Registry {
    /// Open the registry for `root`, loading config and the configured tracker.
    pub fn open(root: &Path) -> Result<Self> {
        let config = Config::load(root)?;
        let tracker = tracker_from_config(&config.tracker, root);
        Ok(Self::with_tracker(root, config, tracker))
    }

    pub fn with_tracker(root: &Path, config: Config, tracker: Box<dyn TaskTracker>) -> Self {
        Self {
            root: root.to_path_buf(),
            config,
            bridge: Bridge::new(tracker),
        }
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    pub fn config(&self) -> &Config {
        &self.config
    }

    pub fn is_initialized(&self) -> bool {
        State::exists(&self.root)
    }

    // ---------------------------------------------------------------------------
    // Read-modify-write
    // ---------------------------------------------------------------------------

    pub(crate) fn mutate<T>(&self, f: impl FnOnce(&mut State) -> Result<T>) -> Result<T> {
        let _lock = StoreLock::acquire(&self.root, &self.config.lock)?;
        let mut state = State::load(&self.root)?;
        let before = state.clone();
        let value = f(&mut state)?;
        if state != before {
            state.updated_at = Utc::now();
            state.save(&self.root)?;
        }
        Ok(value)
    }

    fn read(&self) -> Result<State> {
        State::load(&self.root)
    }

    /// Create the state document if it does not exist yet. Returns true if created.
    pub fn init_store(&self) -> Result<bool> {
        std::fs::create_dir_all(paths::harness_dir(&self.root))?;
        let _lock = StoreLock::acquire(&self.root, &self.config.lock)?;
        if State::exists(&self.root) {
            return Ok(false);
        }
        State::new().save(&self.root)?;
        tracing::info!(root = %self.root.display(), "initialized harness state");
        Ok(true)
    }

    // ---------------------------------------------------------------------------
    // Sessions
    // ---------------------------------------------------------------------------

    /// Open a new session, closing a stale one left behind by a crash.
    pub fn start_session(&self) -> Result<SessionStart> {
        self.mutate(|state| {
            let now = Utc::now();
            let recovered = state.open_session_mut().map(|stale| {
                stale.close(now);
                stale.recovered = true;
                stale.session_number
            });
            if let Some(n) = recovered {
                tracing::warn!(session = n, "closed stale session left open by a previous run");
            }
            // Any other open records are older still; close them the same way.
            for s in state.sessions.iter_mut().filter(|s| s.is_open()) {
                s.close(now);
                s.recovered = true;
            }

            let session_number = state.next_session_number();
            state.sessions.push(SessionRecord::open(session_number));
            tracing::info!(session = session_number, "session started");
            Ok(SessionStart {
                session_number,
                recovered,
            })
        })
    }

    pub fn current_session(&self) -> Result<Option<SessionRecord>> {
        Ok(self.read()?.open_session().cloned())
    }

    pub fn sessions(&self) -> Result<Vec<SessionRecord>> {
        Ok(self.read()?.sessions)
    }

    // ---------------------------------------------------------------------------
    // Features
    // ---------------------------------------------------------------------------

    /// Create the store if needed, add every listed feature that is not
    /// already tracked, then start a session.
    pub fn initialize(&self, specs: &[FeatureSpec]) -> Result<InitReport> {
        self.init_store()?;
        for spec in specs {
            paths::validate_id(&spec.id)?;
        }

        let mut created = Vec::new();
        let mut skipped = Vec::new();
        for spec in specs {
            match self.create(&spec.id, &spec.description, &spec.verification) {
                Ok(_) => created.push(spec.id.clone()),
                Err(HarnessError::DuplicateFeature(id)) => skipped.push(id),
                Err(e) => return Err(e),
            }
        }

        let session = self.start_session()?;
        Ok(InitReport {
            created,
            skipped,
            session,
        })
    }

    pub fn create(
        &self,
        id: &str,
        description: &str,
        verification_command: &str,
    ) -> Result<Feature> {
        paths::validate_id(id)?;
        let feature = self.mutate(|state| {
            if state.feature(id).is_some() {
                return Err(HarnessError::DuplicateFeature(id.to_string()));
            }
            let feature = Feature::new(id, description, verification_command);
            state.features.push(feature.clone());
            state.touch(id);
            tracing::info!(feature = id, "feature created");
            Ok(feature)
        })?;

        let Some(task_ref) = self.bridge.on_create(id, description) else {
            return Ok(feature);
        };
        let linked = self.mutate(|state| {
            Ok(state.feature_mut(id).map(|f| {
                if f.external_task_ref.is_none() {
                    f.external_task_ref = Some(task_ref.clone());
                }
                f.clone()
            }))
        });
        match linked {
            Ok(Some(f)) => Ok(f),
            Ok(None) => Ok(feature),
            Err(e) => {
                tracing::warn!(feature = id, task = %task_ref, error = %e, "could not record task reference");
                Ok(feature)
            }
        }
    }

    pub fn get(&self, id: &str) -> Result<Feature> {
        self.read()?
            .feature(id)
            .cloned()
            .ok_or_else(|| HarnessError::NotFound(id.to_string()))
    }

    /// Features in insertion order, optionally restricted to one status.
    pub fn list(&self, status: Option<FeatureStatus>) -> Result<Vec<Feature>> {
        let state = self.read()?;
        Ok(state
            .features
            .into_iter()
            .filter(|f| status.map_or(true, |s| f.status == s))
            .collect())
    }

    pub fn summary(&self) -> Result<Summary> {
        let state = self.read()?;
        let mut summary = Summary::default();
        for f in &state.features {
            summary.bump(f.status);
        }
        Ok(summary)
    }

    /// Highest-priority unverified feature: in progress, then pending, then
    /// implemented-awaiting-verification.
    pub fn next_feature(&self) -> Result<Option<Feature>> {
        let state = self.read()?;
        for status in [
            FeatureStatus::InProgress,
            FeatureStatus::Pending,
            FeatureStatus::Implemented,
        ] {
            if let Some(f) = state.features.iter().find(|f| f.status == status) {
                return Ok(Some(f.clone()));
            }
        }
        Ok(None)
    }

    pub fn transition(&self, id: &str, event: Event, opts: &TransitionOpts) -> Result<Feature> {
        self.transition_guarded(id, event, opts, None)
    }

    /// Like [`Registry::transition`], but refuses with `StaleVerification`
    /// when the feature's `updated_at` no longer equals `seen_at`.
    pub fn transition_if_unchanged(
        &self,
        id: &str,
        event: Event,
        opts: &TransitionOpts,
        seen_at: DateTime<Utc>,
    ) -> Result<Feature> {
        self.transition_guarded(id, event, opts, Some(seen_at))
    }

    fn transition_guarded(
        &self,
        id: &str,
        event: Event,
        opts: &TransitionOpts,
        seen_at: Option<DateTime<Utc>>,
    ) -> Result<Feature> {
        let feature = self.mutate(|state| {
            let session = state.open_session().map(|s| s.session_number);
            let feature = state
                .feature_mut(id)
                .ok_or_else(|| HarnessError::NotFound(id.to_string()))?;
            if seen_at.is_some_and(|t| t != feature.updated_at) {
                tracing::warn!(feature = id, %event, "feature changed during verification, result discarded");
                return Err(HarnessError::StaleVerification(id.to_string()));
            }
            let record = feature.apply(event, opts, session)?;
            let updated = feature.clone();
            state.touch(id);

            if event == Event::Override {
                tracing::warn!(
                    feature = id,
                    from = %record.from,
                    reason = opts.reason.as_deref().unwrap_or(""),
                    "verification skipped by override"
                );
            } else {
                tracing::info!(feature = id, from = %record.from, to = %record.to, %event, "transition");
            }
            Ok(updated)
        })?;

        self.bridge.after_transition(&feature, event);
        Ok(feature)
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------
