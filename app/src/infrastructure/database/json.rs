use std::path::{Path, PathBuf};

use anyhow::Context;
use domain::model::entity::JobRecord;

/// Registry snapshots stored as one JSON array, replaced atomically on every save.
pub struct JsonCheckpoint {
    path: PathBuf,
}

impl JsonCheckpoint {
    pub fn new(save_dir: impl AsRef<Path>) -> Self {
        Self {
            path: save_dir.as_ref().join("jobs.json"),
        }
    }

    #[inline]
    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Records of the last save, empty if nothing was saved yet.
    pub async fn load(&self) -> anyhow::Result<Vec<JobRecord>> {
        if !self.path.is_file() {
            return Ok(vec![]);
        }
        let bytes = tokio::fs::read(&self.path)
            .await
            .with_context(|| format!("Cannot read checkpoint {}", self.path.display()))?;
        let records = serde_json::from_slice(&bytes)
            .with_context(|| format!("Malformed checkpoint {}", self.path.display()))?;
        Ok(records)
    }

    /// `records` must be sorted by id for the file to be reproducible.
    pub async fn save(&self, records: &[JobRecord]) -> anyhow::Result<()> {
        if let Some(dir) = self.path.parent() {
            tokio::fs::create_dir_all(dir).await?;
        }
        let json = serde_json::to_vec_pretty(records)?;

        let tmp = self.path.with_extension("json.tmp");
        tokio::fs::write(&tmp, json).await?;
        tokio::fs::rename(&tmp, &self.path).await?;
        tracing::debug!(path = %self.path.display(), records = records.len(), "Saved checkpoint");
        Ok(())
    }
}
