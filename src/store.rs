//! JSON-file persistence for the run state and the pending digest.
use anyhow::{Context, Result};
use async_trait::async_trait;
use serde::Serialize;
use std::path::{Path, PathBuf};
use tokio::fs;
use tracing::{instrument, warn};

use crate::model::{Digest, State};

pub const STATE_FILE: &str = "state.json";
pub const DIGEST_FILE: &str = "digest.json";

#[async_trait]
pub trait StateStore: Send + Sync {
    /// Never fails on a corrupt file; that degrades to an empty state.
    async fn load(&self) -> Result<State>;
    async fn save(&self, state: &State) -> Result<()>;
    async fn load_digest(&self) -> Result<Option<Digest>>;
    async fn save_digest(&self, digest: &Digest) -> Result<()>;
    /// Deleting a digest that does not exist is not an error.
    async fn delete_digest(&self) -> Result<()>;
}

/// Keeps `state.json` and `digest.json` side by side in one directory.
#[derive(Debug, Clone)]
pub struct FileStore {
    dir: PathBuf,
}

impl FileStore {
    pub fn new(dir: impl Into<PathBuf>) -> Self {
        Self { dir: dir.into() }
    }

    pub fn state_path(&self) -> PathBuf {
        self.dir.join(STATE_FILE)
    }

    pub fn digest_path(&self) -> PathBuf {
        self.dir.join(DIGEST_FILE)
    }

    pub fn broken_state_path(&self) -> PathBuf {
        self.dir.join(format!("{STATE_FILE}.broken"))
    }
}

#[async_trait]
impl StateStore for FileStore {
    #[instrument(skip_all)]
    async fn load(&self) -> Result<State> {
        let path = self.state_path();
        let Some(data) = read_optional(&path).await? else {
            return Ok(State::default());
        };
        match serde_json::from_slice::<State>(&data) {
            Ok(state) => Ok(state),
            Err(err) => {
                let broken = self.broken_state_path();
                warn!(?err, path = %path.display(), broken = %broken.display(), "state file is corrupt; starting from empty state");
                if let Err(err) = fs::rename(&path, &broken).await {
                    warn!(?err, "failed to archive corrupt state file");
                }
                Ok(State::default())
            }
        }
    }

    #[instrument(skip_all)]
    async fn save(&self, state: &State) -> Result<()> {
        write_atomic(&self.state_path(), state)
            .await
            .context("failed to save state")
    }

    #[instrument(skip_all)]
    async fn load_digest(&self) -> Result<Option<Digest>> {
        let path = self.digest_path();
        let Some(data) = read_optional(&path).await? else {
            return Ok(None);
        };
        let digest = serde_json::from_slice(&data)
            .with_context(|| format!("invalid digest file: {}", path.display()))?;
        Ok(Some(digest))
    }

    #[instrument(skip_all)]
    async fn save_digest(&self, digest: &Digest) -> Result<()> {
        write_atomic(&self.digest_path(), digest)
            .await
            .context("failed to save digest")
    }

    #[instrument(skip_all)]
    async fn delete_digest(&self) -> Result<()> {
        let path = self.digest_path();
        match fs::remove_file(&path).await {
            Ok(()) => Ok(()),
            Err(err) if err.kind() == std::io::ErrorKind::NotFound => Ok(()),
            Err(err) => {
                Err(err).with_context(|| format!("failed to delete digest: {}", path.display()))
            }
        }
    }
}

async fn read_optional(path: &Path) -> Result<Option<Vec<u8>>> {
    match fs::read(path).await {
        Ok(data) => Ok(Some(data)),
        Err(err) if err.kind() == std::io::ErrorKind::NotFound => Ok(None),
        Err(err) => Err(err).with_context(|| format!("failed to read {}", path.display())),
    }
}

/// Serialize to a temp file in the target's directory, then rename over it.
async fn write_atomic<T: Serialize>(path: &Path, value: &T) -> Result<()> {
    let data = serde_json::to_vec_pretty(value).context("failed to serialize")?;
    let dir = path.parent().unwrap_or_else(|| Path::new("."));
    fs::create_dir_all(dir)
        .await
        .with_context(|| format!("failed to create dir: {}", dir.display()))?;

    let file_name = path
        .file_name()
        .and_then(|n| n.to_str())
        .unwrap_or("state");
    let tmp = dir.join(format!(".{}.{}.tmp", file_name, uuid::Uuid::new_v4()));
    fs::write(&tmp, &data)
        .await
        .with_context(|| format!("failed to write {}", tmp.display()))?;
    if let Err(err) = fs::rename(&tmp, path).await {
        let _ = fs::remove_file(&tmp).await;
        return Err(err).with_context(|| format!("failed to rename into {}", path.display()));
    }
    Ok(())
}
