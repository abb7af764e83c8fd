use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::BTreeSet;

/// One harness-aware working session.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SessionRecord {
    pub session_number: u32,
    pub started_at: DateTime<Utc>,
    #[serde(default)]
    pub ended_at: Option<DateTime<Utc>>,
    #[serde(default)]
    pub features_touched: BTreeSet<String>,
    /// Closed by crash recovery rather than by the session gate.
    #[serde(default, skip_serializing_if = "std::ops::Not::not")]
    pub recovered: bool,
}

impl SessionRecord {
    pub fn open(session_number: u32) -> Self {
        Self {
            session_number,
            started_at: Utc::now(),
            ended_at: None,
            features_touched: BTreeSet::new(),
            recovered: false,
        }
    }

    pub fn is_open(&self) -> bool {
        self.ended_at.is_none()
    }

    pub fn close(&mut self, at: DateTime<Utc>) {
        self.ended_at = Some(at);
    }
}

/// Result of opening a session.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SessionStart {
    pub session_number: u32,
    /// Number of a stale session that was closed on the way in.
    pub recovered: Option<u32>,
}
