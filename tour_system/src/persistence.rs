//! A small key/value store standing in for the browser's `localStorage`: one JSON file under
//! the platform config directory, loaded whole at startup and rewritten whole on every mutation.
//!
//! Mirrors the load-whole/rewrite-whole shape of `GameData::create_or_load_from_file` /
//! `GameSharedData::save_state`, generalised from one game-specific blob to a typed map.

use std::collections::HashMap;
use std::path::{Path, PathBuf};

use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::error::PersistenceError;

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct PersistedState {
    pub guide_enabled: bool,
    pub continuous_tour: bool,
    pub guide_duration: Option<u32>,
    pub guide_style: Option<String>,
    pub tour_zone: Option<String>,
    pub audience_profile: Option<String>,
    pub group_mode: bool,
    pub speaker_name: Option<String>,
    pub tour_selected_stop_index: Option<i64>,
    pub client_id: String,
    /// JSON-serialised `TourState`, matching the wire contract in the persisted-state table.
    pub tour_state_v1: Option<Value>,
    /// Forward-compatible escape hatch for keys this client doesn't know about yet.
    #[serde(flatten)]
    pub extra: HashMap<String, Value>,
}

/// Owns the on-disk JSON file backing [`PersistedState`].
pub struct PersistenceStore {
    path: PathBuf,
    state: PersistedState,
}

impl PersistenceStore {
    /// Load the store from `path`, creating a default-initialised file if none exists yet.
    pub fn create_or_load_from_file(path: impl Into<PathBuf>) -> Result<Self, PersistenceError> {
        let path = path.into();
        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent).map_err(|source| PersistenceError::Io { source })?;
        }

        let state = if path.exists() {
            let raw = std::fs::read_to_string(&path).map_err(|source| PersistenceError::Io { source })?;
            serde_json::from_str(&raw).map_err(|source| PersistenceError::Json { source })?
        } else {
            let state = PersistedState {
                client_id: uuid_v4_like(),
                ..Default::default()
            };
            let store = Self { path: path.clone(), state };
            store.persist()?;
            return Ok(store);
        };

        Ok(Self { path, state })
    }

    pub fn state(&self) -> &PersistedState {
        &self.state
    }

    /// Apply `mutate`, then best-effort rewrite the backing file. A write failure is logged and
    /// swallowed: persistence is never allowed to be fatal to the running session.
    pub fn mutate(&mut self, mutate: impl FnOnce(&mut PersistedState)) {
        mutate(&mut self.state);
        if let Err(err) = self.persist() {
            tracing::warn!(?err, "failed to persist client state");
        }
    }

    fn persist(&self) -> Result<(), PersistenceError> {
        let serialised = serde_json::to_string_pretty(&self.state).map_err(|source| PersistenceError::Json { source })?;
        write_atomic(&self.path, serialised.as_bytes())?;
        Ok(())
    }
}

fn write_atomic(path: &Path, bytes: &[u8]) -> Result<(), PersistenceError> {
    let tmp_path = path.with_extension("tmp");
    std::fs::write(&tmp_path, bytes).map_err(|source| PersistenceError::Io { source })?;
    std::fs::rename(&tmp_path, path).map_err(|source| PersistenceError::Io { source })?;
    Ok(())
}

fn uuid_v4_like() -> String {
    use rand::RngCore;
    let mut bytes = [0u8; 16];
    rand::rng().fill_bytes(&mut bytes);
    bytes[6] = (bytes[6] & 0x0f) | 0x40;
    bytes[8] = (bytes[8] & 0x3f) | 0x80;
    let hex: String = bytes.iter().map(|b| format!("{b:02x}")).collect();
    format!("{}-{}-{}-{}-{}", &hex[0..8], &hex[8..12], &hex[12..16], &hex[16..20], &hex[20..32])
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn creates_default_file_when_missing() {
        let dir = tempfile_dir();
        let path = dir.join("state.json");
        let store = PersistenceStore::create_or_load_from_file(&path).unwrap();
        assert!(path.exists());
        assert!(!store.state().client_id.is_empty());
        std::fs::remove_dir_all(dir).ok();
    }

    #[test]
    fn mutation_round_trips_through_reload() {
        let dir = tempfile_dir();
        let path = dir.join("state.json");
        let mut store = PersistenceStore::create_or_load_from_file(&path).unwrap();
        store.mutate(|s| s.guide_enabled = true);

        let reloaded = PersistenceStore::create_or_load_from_file(&path).unwrap();
        assert!(reloaded.state().guide_enabled);
        std::fs::remove_dir_all(dir).ok();
    }

    fn tempfile_dir() -> PathBuf {
        let dir = std::env::temp_dir().join(format!("tour_system_test_{}", uuid_v4_like()));
        std::fs::create_dir_all(&dir).unwrap();
        dir
    }
}
