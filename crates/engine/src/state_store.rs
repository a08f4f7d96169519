use crate::error::EngineError;
use crate::ladder::{LadderState, Phase};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use tracing::{debug, info};

/// The ladder as written to disk between runs.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct LadderSnapshot {
    pub saved_at: DateTime<Utc>,
    pub symbol: String,
    pub magic: u64,
    pub phase: Phase,
    pub state: Option<LadderState>,
}

/// JSON file holding the latest [`LadderSnapshot`].
#[derive(Debug, Clone)]
pub struct StateStore {
    path: PathBuf,
}

impl StateStore {
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self { path: path.into() }
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Read the saved snapshot, if any.
    pub fn load(&self) -> Result<Option<LadderSnapshot>, EngineError> {
        if !self.path.exists() {
            return Ok(None);
        }
        let raw = std::fs::read_to_string(&self.path)?;
        let snapshot: LadderSnapshot = serde_json::from_str(&raw)?;
        info!(
            path = %self.path.display(),
            phase = %snapshot.phase,
            saved_at = %snapshot.saved_at,
            "Loaded ladder snapshot"
        );
        Ok(Some(snapshot))
    }

    /// Write through a temporary file so a crash never leaves half a snapshot.
    pub fn save(&self, snapshot: &LadderSnapshot) -> Result<(), EngineError> {
        if let Some(parent) = self.path.parent() {
            if !parent.as_os_str().is_empty() {
                std::fs::create_dir_all(parent)?;
            }
        }
        let tmp = self.path.with_extension("json.tmp");
        std::fs::write(&tmp, serde_json::to_vec_pretty(snapshot)?)?;
        std::fs::rename(&tmp, &self.path)?;
        debug!(path = %self.path.display(), phase = %snapshot.phase, "Saved ladder snapshot");
        Ok(())
    }

    pub fn clear(&self) -> Result<(), EngineError> {
        match std::fs::remove_file(&self.path) {
            Ok(()) => Ok(()),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(()),
            Err(e) => Err(e.into()),
        }
    }
}
