use crate::error::{HarnessError, Result};
use crate::feature::Feature;
use crate::paths;
use crate::session::SessionRecord;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::path::Path;

/// Highest schema version this build can read and the one it writes.
pub const SCHEMA_VERSION: u32 = 1;

// ---------------------------------------------------------------------------
// State
// ---------------------------------------------------------------------------

/// The single persisted document: every feature and every session record.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct State {
    pub version: u32,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
    #[serde(default)]
    pub features: Vec<Feature>,
    #[serde(default)]
    pub sessions: Vec<SessionRecord>,
}

#[derive(Deserialize)]
struct VersionHeader {
    version: Option<u32>,
}

impl State {
    pub fn new() -> Self {
        let now = Utc::now();
        Self {
            version: SCHEMA_VERSION,
            created_at: now,
            updated_at: now,
            features: Vec::new(),
            sessions: Vec::new(),
        }
    }

    // ---------------------------------------------------------------------------
    // Persistence
    // ---------------------------------------------------------------------------

    pub fn exists(root: &Path) -> bool {
        paths::state_path(root).exists()
    }

    pub fn load(root: &Path) -> Result<Self> {
        let path = paths::state_path(root);
        if !path.exists() {
            return Err(HarnessError::NotInitialized);
        }
        let data = std::fs::read_to_string(&path).map_err(|e| HarnessError::StoreCorrupted {
            path: path.clone(),
            reason: e.to_string(),
        })?;
        Self::from_json(&data).map_err(|e| match e {
            HarnessError::Json(inner) => HarnessError::StoreCorrupted {
                path,
                reason: inner.to_string(),
            },
            other => other,
        })
    }

    pub fn save(&self, root: &Path) -> Result<()> {
        let data = self.to_json()?;
        crate::io::atomic_write(&paths::state_path(root), data.as_bytes())
    }

    /// Parse a state document, refusing versions this build does not know.
    pub fn from_json(data: &str) -> Result<Self> {
        let header: VersionHeader = serde_json::from_str(data)?;
        match header.version {
            Some(v) if (1..=SCHEMA_VERSION).contains(&v) => {}
            Some(found) => {
                return Err(HarnessError::SchemaMismatch {
                    found,
                    supported: SCHEMA_VERSION,
                })
            }
            None => {
                return Err(HarnessError::SchemaMismatch {
                    found: 0,
                    supported: SCHEMA_VERSION,
                })
            }
        }
        Ok(serde_json::from_str(data)?)
    }

    pub fn to_json(&self) -> Result<String> {
        let mut data = serde_json::to_string_pretty(self)?;
        data.push('\n');
        Ok(data)
    }

    // ---------------------------------------------------------------------------
    // Features
    // ---------------------------------------------------------------------------

    pub fn feature(&self, id: &str) -> Option<&Feature> {
        self.features.iter().find(|f| f.id == id)
    }

    pub fn feature_mut(&mut self, id: &str) -> Option<&mut Feature> {
        self.features.iter_mut().find(|f| f.id == id)
    }

    // ---------------------------------------------------------------------------
    // Sessions
    // ---------------------------------------------------------------------------

    pub fn open_session(&self) -> Option<&SessionRecord> {
        self.sessions.iter().rev().find(|s| s.is_open())
    }

    pub fn open_session_mut(&mut self) -> Option<&mut SessionRecord> {
        self.sessions.iter_mut().rev().find(|s| s.is_open())
    }

    pub fn next_session_number(&self) -> u32 {
        self.sessions
            .iter()
            .map(|s| s.session_number)
            .max()
            .unwrap_or(0)
            + 1
    }

    /// Record that `id` was mutated during the open session, if any.
    /// Returns the open session's number.
    pub fn touch(&mut self, id: &str) -> Option<u32> {
        let session = self.open_session_mut()?;
        session.features_touched.insert(id.to_string());
        Some(session.session_number)
    }
}

impl Default for State {
    fn default() -> Self {
        Self::new()
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------

#[cfg(test)]
mod tests {
    use super::*;
    use crate::feature::TransitionOpts;
    use crate::types::Event;
    use tempfile::TempDir;

    fn sample() -> State {
        let mut state = State::new();
        let mut f = Feature::new("auth-login", "Login with email", "exit 0");
        f.apply(Event::Start, &TransitionOpts::default(), Some(1)).unwrap();
        f.external_task_ref = Some("bd-42".into());
        state.features.push(f);
        state.features.push(Feature::new("flaky", "Flaky check", "exit 1"));
        let mut s = SessionRecord::open(1);
        s.features_touched.insert("auth-login".into());
        state.sessions.push(s);
        state
    }

    #[test]
    fn roundtrip_is_byte_identical() {
        let dir = TempDir::new().unwrap();
        let state = sample();
        state.save(dir.path()).unwrap();
        let first = std::fs::read_to_string(paths::state_path(dir.path())).unwrap();

        let loaded = State::load(dir.path()).unwrap();
        assert_eq!(loaded, state);
        loaded.save(dir.path()).unwrap();
        let second = std::fs::read_to_string(paths::state_path(dir.path())).unwrap();
        assert_eq!(first, second);
    }

    #[test]
    fn insertion_order_preserved() {
        let state = sample();
        let parsed = State::from_json(&state.to_json().unwrap()).unwrap();
        let ids: Vec<_> = parsed.features.iter().map(|f| f.id.as_str()).collect();
        assert_eq!(ids, ["auth-login", "flaky"]);
    }

    #[test]
    fn missing_store_is_not_initialized() {
        let dir = TempDir::new().unwrap();
        assert!(matches!(
            State::load(dir.path()),
            Err(HarnessError::NotInitialized)
        ));
    }

    #[test]
    fn future_version_fails_closed() {
        let json = r#"{"version": 7, "created_at": "2026-01-01T00:00:00Z", "updated_at": "2026-01-01T00:00:00Z", "features": [], "sessions": [], "brand_new_field": 1}"#;
        assert!(matches!(
            State::from_json(json),
            Err(HarnessError::SchemaMismatch { found: 7, supported: 1 })
        ));
    }

    #[test]
    fn missing_version_fails_closed() {
        let json = r#"{"features": [], "sessions": []}"#;
        assert!(matches!(
            State::from_json(json),
            Err(HarnessError::SchemaMismatch { found: 0, .. })
        ));
    }

    #[test]
    fn garbage_is_store_corrupted() {
        let dir = TempDir::new().unwrap();
        crate::io::atomic_write(&paths::state_path(dir.path()), b"{not json").unwrap();
        match State::load(dir.path()) {
            Err(HarnessError::StoreCorrupted { reason, .. }) => assert!(!reason.is_empty()),
            other => panic!("expected StoreCorrupted, got {other:?}"),
        }
    }

    #[test]
    fn touch_records_in_open_session() {
        let mut state = sample();
        assert_eq!(state.touch("flaky"), Some(1));
        assert!(state.sessions[0].features_touched.contains("flaky"));

        state.sessions[0].close(Utc::now());
        assert_eq!(state.touch("flaky"), None);
    }

    #[test]
    fn next_session_number_has_no_gaps() {
        let mut state = State::new();
        assert_eq!(state.next_session_number(), 1);
        state.sessions.push(SessionRecord::open(1));
        assert_eq!(state.next_session_number(), 2);
    }
}
