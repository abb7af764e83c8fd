use crate::error::Result;
use crate::registry::Registry;
use crate::store::State;
use crate::types::FeatureStatus;
use chrono::Utc;
use serde::{Deserialize, Serialize};

// ---------------------------------------------------------------------------
// GateDecision
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "decision", rename_all = "snake_case")]
pub enum GateDecision {
    /// Features that were declared complete but never verified.
    Blocked { features: Vec<String> },
    Allowed {
        /// Session closed by this check. `None` when nothing was open.
        closed_session: Option<u32>,
        /// Features in `failed`. Reported, not blocking.
        failed: Vec<String>,
    },
}

impl GateDecision {
    pub fn is_blocked(&self) -> bool {
        matches!(self, GateDecision::Blocked { .. })
    }
}

fn ids_with(state: &State, status: FeatureStatus) -> Vec<String> {
    state
        .features
        .iter()
        .filter(|f| f.status == status)
        .map(|f| f.id.clone())
        .collect()
}

// ---------------------------------------------------------------------------
// SessionGate
// ---------------------------------------------------------------------------

/// End-of-session checkpoint: refuses to let a session end while any feature
/// sits in `implemented`.
pub struct SessionGate<'a> {
    registry: &'a Registry,
}

impl<'a> SessionGate<'a> {
    pub fn new(registry: &'a Registry) -> Self {
        Self { registry }
    }

    pub fn check_session_end(&self) -> Result<GateDecision> {
        // Blocked checks never write, so they skip the lock.
        let snapshot = State::load(self.registry.root())?;
        let unverified = ids_with(&snapshot, FeatureStatus::Implemented);
        if !unverified.is_empty() {
            tracing::warn!(count = unverified.len(), "session end blocked by unverified features");
            return Ok(GateDecision::Blocked {
                features: unverified,
            });
        }

        // Re-check under the lock before closing the session.
        let decision = self.registry.mutate(|state| {
            let unverified = ids_with(state, FeatureStatus::Implemented);
            if !unverified.is_empty() {
                return Ok(GateDecision::Blocked {
                    features: unverified,
                });
            }
            let closed_session = state.open_session_mut().map(|s| {
                s.close(Utc::now());
                s.session_number
            });
            Ok(GateDecision::Allowed {
                closed_session,
                failed: ids_with(state, FeatureStatus::Failed),
            })
        })?;

        match &decision {
            GateDecision::Allowed {
                closed_session: Some(n),
                failed,
            } => {
                if !failed.is_empty() {
                    tracing::warn!(failed = failed.len(), "session ending with failed features");
                }
                tracing::info!(session = n, "session closed");
            }
            GateDecision::Allowed { .. } => {
                tracing::debug!("session end allowed, no open session");
            }
            GateDecision::Blocked { features } => {
                tracing::warn!(count = features.len(), "session end blocked by unverified features");
            }
        }
        Ok(decision)
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------

#[cfg(test)]
mod tests {
    use super::*;
    use crate::bridge::NoopTracker;
    use crate::config::Config;
    use crate::feature::TransitionOpts;
    use crate::paths;
    use crate::types::Event;
    use tempfile::TempDir;

    fn setup(dir: &TempDir) -> Registry {
        let r = Registry::with_tracker(dir.path(), Config::default(), Box::new(NoopTracker));
        r.init_store().unwrap();
        r.start_session().unwrap();
        r
    }

    fn walk(r: &Registry, id: &str, events: &[Event]) {
        for e in events {
            r.transition(id, *e, &TransitionOpts::default()).unwrap();
        }
    }

    #[test]
    fn blocked_while_implemented() {
        let dir = TempDir::new().unwrap();
        let r = setup(&dir);
        r.create("b-feature", "B", "true").unwrap();
        r.create("a-feature", "A", "true").unwrap();
        walk(&r, "b-feature", &[Event::Start, Event::Complete]);
        walk(&r, "a-feature", &[Event::Start, Event::Complete]);

        let decision = SessionGate::new(&r).check_session_end().unwrap();
        assert_eq!(
            decision,
            GateDecision::Blocked {
                features: vec!["b-feature".into(), "a-feature".into()]
            }
        );
        assert!(r.current_session().unwrap().is_some(), "blocked gate must not close the session");
    }

    #[test]
    fn allowed_closes_session_once() {
        let dir = TempDir::new().unwrap();
        let r = setup(&dir);
        r.create("a", "A", "true").unwrap();
        walk(&r, "a", &[Event::Start]);

        let gate = SessionGate::new(&r);
        let first = gate.check_session_end().unwrap();
        assert_eq!(
            first,
            GateDecision::Allowed {
                closed_session: Some(1),
                failed: vec![]
            }
        );
        assert!(r.current_session().unwrap().is_none());

        let before = std::fs::read(paths::state_path(dir.path())).unwrap();
        let second = gate.check_session_end().unwrap();
        assert_eq!(
            second,
            GateDecision::Allowed {
                closed_session: None,
                failed: vec![]
            }
        );
        let after = std::fs::read(paths::state_path(dir.path())).unwrap();
        assert_eq!(before, after, "idempotent check must not rewrite the store");
    }

    #[test]
    fn failed_is_advisory() {
        let dir = TempDir::new().unwrap();
        let r = setup(&dir);
        r.create("flaky", "Flaky", "exit 1").unwrap();
        walk(&r, "flaky", &[Event::Start, Event::Complete, Event::Fail]);

        let decision = SessionGate::new(&r).check_session_end().unwrap();
        assert!(!decision.is_blocked());
        assert_eq!(
            decision,
            GateDecision::Allowed {
                closed_session: Some(1),
                failed: vec!["flaky".into()]
            }
        );
    }

    #[test]
    fn override_unblocks() {
        let dir = TempDir::new().unwrap();
        let r = setup(&dir);
        r.create("a", "A", "true").unwrap();
        walk(&r, "a", &[Event::Start, Event::Complete]);
        assert!(SessionGate::new(&r).check_session_end().unwrap().is_blocked());

        r.transition("a", Event::Override, &TransitionOpts::skip_verification(None))
            .unwrap();
        assert!(!SessionGate::new(&r).check_session_end().unwrap().is_blocked());
    }

    #[test]
    fn gate_blocked_iff_some_feature_implemented() {
        for status in FeatureStatus::all() {
            let dir = TempDir::new().unwrap();
            let r = setup(&dir);
            r.create("x", "X", "true").unwrap();
            let path: &[Event] = match status {
                FeatureStatus::Pending => &[],
                FeatureStatus::InProgress => &[Event::Start],
                FeatureStatus::Implemented => &[Event::Start, Event::Complete],
                FeatureStatus::Verified => &[Event::Start, Event::Complete, Event::Pass],
                FeatureStatus::Failed => &[Event::Start, Event::Complete, Event::Fail],
            };
            walk(&r, "x", path);
            let blocked = SessionGate::new(&r).check_session_end().unwrap().is_blocked();
            assert_eq!(blocked, *status == FeatureStatus::Implemented, "status {status}");
        }
    }

    #[test]
    fn decision_serializes_with_tag() {
        let json = serde_json::to_string(&GateDecision::Blocked {
            features: vec!["a".into()],
        })
        .unwrap();
        assert_eq!(json, r#"{"decision":"blocked","features":["a"]}"#);
    }
}
