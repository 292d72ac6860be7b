use serde::{Deserialize, Serialize};

use crate::model::{Note, SortMode};

/// What survives a restart. Active selection and view toggles do not.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PersistedState {
    pub version: u32,
    pub notes: Vec<Note>,
    #[serde(default)]
    pub sort_mode: SortMode,
    #[serde(default)]
    pub pending: Vec<String>,
}

impl PersistedState {
    /// Parses a stored snapshot. Unreadable or other-version data yields
    /// `None` so the caller starts from an empty collection.
    pub fn decode(raw: &str, expected_version: u32) -> Option<Self> {
        match serde_json::from_str::<PersistedState>(raw) {
            Ok(state) if state.version == expected_version => Some(state),
            Ok(state) => {
                tracing::warn!(
                    found = state.version,
                    expected = expected_version,
                    "ignoring persisted notes from another version"
                );
                None
            }
            Err(err) => {
                tracing::warn!(%err, "persisted notes are unreadable, starting empty");
                None
            }
        }
    }

    pub fn encode(&self) -> serde_json::Result<String> {
        serde_json::to_string(self)
    }
}
