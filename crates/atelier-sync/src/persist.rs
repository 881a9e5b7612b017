//! Persistence boundary for the durable subset of the store.
//!
//! Only the fields declared in [`DurableState`] survive a process restart;
//! everything else is rebuilt from the server after reconnect. The blob is
//! written on every durable mutation and read once at startup, before any
//! event processing begins.

use std::collections::BTreeMap;
use std::fs;
use std::path::{Path, PathBuf};

use serde::{Deserialize, Serialize};
use thiserror::Error;

const DURABLE_DIR: &str = "atelier";
const DURABLE_FILE: &str = "durable.json";

#[derive(Debug, Error)]
pub enum PersistError {
    #[error("durable_write_failed:{0}")]
    Write(#[from] std::io::Error),
    #[error("durable_encode_failed:{0}")]
    Encode(#[from] serde_json::Error),
}

/// Canvas placement of a session's view, remembered across restarts.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct LayoutPosition {
    pub x: f64,
    pub y: f64,
    #[serde(default = "default_zoom")]
    pub zoom: f64,
}

fn default_zoom() -> f64 {
    1.0
}

impl Default for LayoutPosition {
    fn default() -> Self {
        Self {
            x: 0.0,
            y: 0.0,
            zoom: default_zoom(),
        }
    }
}

/// The declared durable subset, exactly: which session is selected, where
/// each session's view sits, and which sessions have produced files.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct DurableState {
    #[serde(default)]
    pub selected_session: Option<String>,
    #[serde(default)]
    pub layout: BTreeMap<String, LayoutPosition>,
    #[serde(default)]
    pub wrote_files: BTreeMap<String, bool>,
}

/// Durable blob location. Load is tolerant (a missing or corrupt blob
/// degrades to defaults); save is atomic via write-then-rename.
#[derive(Debug, Clone)]
pub struct DurableFile {
    path: PathBuf,
}

impl DurableFile {
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self { path: path.into() }
    }

    /// Default blob location under the platform data directory.
    pub fn default_path() -> Option<PathBuf> {
        dirs::data_local_dir().map(|dir| dir.join(DURABLE_DIR).join(DURABLE_FILE))
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    pub fn load(&self) -> DurableState {
        let content = match fs::read_to_string(&self.path) {
            Ok(content) => content,
            Err(error) => {
                if error.kind() != std::io::ErrorKind::NotFound {
                    tracing::warn!(error = %error, path = %self.path.display(), "Durable state read failed, starting from defaults");
                }
                return DurableState::default();
            }
        };
        match serde_json::from_str(&content) {
            Ok(state) => state,
            Err(error) => {
                tracing::warn!(error = %error, path = %self.path.display(), "Durable state decode failed, starting from defaults");
                DurableState::default()
            }
        }
    }

    pub fn save(&self, state: &DurableState) -> Result<(), PersistError> {
        if let Some(parent) = self.path.parent() {
            fs::create_dir_all(parent)?;
        }
        let json = serde_json::to_string_pretty(state)?;
        let staging = self.path.with_extension("json.tmp");
        fs::write(&staging, json)?;
        fs::rename(&staging, &self.path)?;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn round_trips_the_subset_exactly() {
        let dir = tempfile::tempdir().unwrap();
        let file = DurableFile::new(dir.path().join("durable.json"));

        let mut state = DurableState {
            selected_session: Some("ses_1".to_owned()),
            ..DurableState::default()
        };
        state.layout.insert(
            "ses_1".to_owned(),
            LayoutPosition {
                x: 120.0,
                y: -40.5,
                zoom: 0.75,
            },
        );
        state.wrote_files.insert("ses_1".to_owned(), true);

        file.save(&state).unwrap();
        assert_eq!(file.load(), state);
    }

    #[test]
    fn missing_blob_loads_defaults() {
        let dir = tempfile::tempdir().unwrap();
        let file = DurableFile::new(dir.path().join("nope.json"));
        assert_eq!(file.load(), DurableState::default());
    }

    #[test]
    fn corrupt_blob_loads_defaults() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("durable.json");
        fs::write(&path, "{not json").unwrap();
        assert_eq!(DurableFile::new(&path).load(), DurableState::default());
    }

    #[test]
    fn save_creates_parent_directories() {
        let dir = tempfile::tempdir().unwrap();
        let file = DurableFile::new(dir.path().join("deep/nested/durable.json"));
        file.save(&DurableState::default()).unwrap();
        assert!(file.path().exists());
    }
}
