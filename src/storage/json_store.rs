use std::path::{Path, PathBuf};

use anyhow::{Context as _, Result, bail};
use async_trait::async_trait;

use crate::artifacts::is_valid_run_id;
use crate::engine::types::RunContext;
use crate::storage::{RunStore, write_atomic};

pub const CONTEXT_FILE: &str = "run_context.json";

/// File-based JSON run store. Each run lives at `<base>/<run_id>/run_context.json`.
pub struct JsonRunStore {
    base_dir: PathBuf,
}

impl JsonRunStore {
    pub fn new(base_dir: impl AsRef<Path>) -> Self {
        Self {
            base_dir: base_dir.as_ref().to_path_buf(),
        }
    }

    pub fn context_path(&self, run_id: &str) -> Result<PathBuf> {
        if !is_valid_run_id(run_id) {
            bail!("Invalid run id: {}", run_id);
        }
        Ok(self.base_dir.join(run_id).join(CONTEXT_FILE))
    }

    async fn read_context(path: &Path) -> Result<RunContext> {
        let data = tokio::fs::read_to_string(path)
            .await
            .with_context(|| format!("Failed to read run file: {}", path.display()))?;
        let ctx: RunContext = serde_json::from_str(&data)
            .with_context(|| format!("Failed to parse run file: {}", path.display()))?;
        Ok(ctx)
    }
}

#[async_trait]
impl RunStore for JsonRunStore {
    async fn load(&self, run_id: &str) -> Result<Option<RunContext>> {
        let path = self.context_path(run_id)?;
        if !tokio::fs::try_exists(&path).await? {
            return Ok(None);
        }
        Self::read_context(&path).await.map(Some)
    }

    async fn save(&self, ctx: &RunContext) -> Result<()> {
        let path = self.context_path(&ctx.run_id)?;
        if let Some(dir) = path.parent() {
            tokio::fs::create_dir_all(dir).await?;
        }
        let data = serde_json::to_vec_pretty(ctx)?;
        write_atomic(&path, &data).await
    }

    async fn exists(&self, run_id: &str) -> Result<bool> {
        let path = self.context_path(run_id)?;
        Ok(tokio::fs::try_exists(&path).await?)
    }

    async fn list(&self) -> Result<Vec<RunContext>> {
        if !tokio::fs::try_exists(&self.base_dir).await? {
            return Ok(Vec::new());
        }

        let mut runs = Vec::new();
        let mut entries = tokio::fs::read_dir(&self.base_dir).await?;

        while let Some(entry) = entries.next_entry().await? {
            let path = entry.path().join(CONTEXT_FILE);
            if tokio::fs::try_exists(&path).await.unwrap_or(false)
                && let Ok(ctx) = Self::read_context(&path).await
            {
                runs.push(ctx);
            }
        }

        // Newest first
        runs.sort_by(|a, b| b.created_at.cmp(&a.created_at));

        Ok(runs)
    }

    async fn delete(&self, run_id: &str) -> Result<()> {
        let path = self.context_path(run_id)?;
        if tokio::fs::try_exists(&path).await? {
            tokio::fs::remove_file(&path).await?;
        }
        Ok(())
    }
}
