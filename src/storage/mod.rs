pub mod json_store;
pub mod memory_store;
pub mod registry;

use std::path::Path;

use anyhow::{Context as _, Result};
use async_trait::async_trait;
use tokio::io::AsyncWriteExt;

use crate::engine::types::RunContext;

pub use registry::RunRegistry;

/// Trait for run context persistence.
#[async_trait]
pub trait RunStore: Send + Sync {
    /// Load the last persisted snapshot, or `None` if the run does not exist.
    async fn load(&self, run_id: &str) -> Result<Option<RunContext>>;

    /// Persist the full context. Must be durable when it returns.
    async fn save(&self, ctx: &RunContext) -> Result<()>;

    async fn exists(&self, run_id: &str) -> Result<bool>;

    /// List every persisted run, newest first.
    async fn list(&self) -> Result<Vec<RunContext>>;

    async fn delete(&self, run_id: &str) -> Result<()>;
}

/// Write `bytes` to a sibling temp file, fsync it, then rename over `path`.
pub async fn write_atomic(path: &Path, bytes: &[u8]) -> Result<()> {
    let mut tmp_name = path
        .file_name()
        .map(|n| n.to_os_string())
        .unwrap_or_default();
    tmp_name.push(".tmp");
    let tmp_path = path.with_file_name(tmp_name);

    let mut file = tokio::fs::File::create(&tmp_path)
        .await
        .with_context(|| format!("Failed to create {}", tmp_path.display()))?;
    file.write_all(bytes).await?;
    file.sync_all().await?;
    drop(file);

    tokio::fs::rename(&tmp_path, path)
        .await
        .with_context(|| format!("Failed to replace {}", path.display()))?;
    Ok(())
}
