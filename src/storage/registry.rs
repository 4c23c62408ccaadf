use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex, PoisonError, RwLock};

use tracing::{debug, info};

use crate::artifacts::is_valid_run_id;
use crate::engine::types::{RunContext, RunOptions, RunState};
use crate::errors::OrchestratorError;
use crate::storage::RunStore;

/// Cached, persisted container of run contexts.
///
/// Every mutation is written through to the store before the cache is
/// swapped, so readers only ever see the last persisted snapshot.
pub struct RunRegistry {
    store: Arc<dyn RunStore>,
    artifacts_root: PathBuf,
    cache: RwLock<HashMap<String, Arc<RunContext>>>,
    write_locks: Mutex<HashMap<String, Arc<tokio::sync::Mutex<()>>>>,
}

impl RunRegistry {
    pub fn new(store: Arc<dyn RunStore>, artifacts_root: impl AsRef<Path>) -> Self {
        Self {
            store,
            artifacts_root: artifacts_root.as_ref().to_path_buf(),
            cache: RwLock::new(HashMap::new()),
            write_locks: Mutex::new(HashMap::new()),
        }
    }

    fn cached(&self, run_id: &str) -> Option<Arc<RunContext>> {
        self.cache
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .get(run_id)
            .cloned()
    }

    fn put_cache(&self, ctx: RunContext) -> Arc<RunContext> {
        let snapshot = Arc::new(ctx);
        self.cache
            .write()
            .unwrap_or_else(PoisonError::into_inner)
            .insert(snapshot.run_id.clone(), snapshot.clone());
        snapshot
    }

    fn write_lock(&self, run_id: &str) -> Arc<tokio::sync::Mutex<()>> {
        self.write_locks
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .entry(run_id.to_string())
            .or_default()
            .clone()
    }

    /// Create and persist a new run in START. Fails if the id is taken.
    pub async fn create(
        &self,
        run_id: &str,
        base_url: &str,
        env: &str,
        opts: RunOptions,
    ) -> Result<RunContext, OrchestratorError> {
        if !is_valid_run_id(run_id) {
            return Err(OrchestratorError::Validation(format!(
                "invalid run id '{}'",
                run_id
            )));
        }
        let lock = self.write_lock(run_id);
        let _guard = lock.lock().await;

        if self.cached(run_id).is_some() || self.store.exists(run_id).await? {
            return Err(OrchestratorError::Conflict(format!(
                "run '{}' already exists",
                run_id
            )));
        }

        let artifacts_path = self.artifacts_root.join(run_id).to_string_lossy().to_string();
        let mut ctx = RunContext::new(run_id, base_url, env, opts, artifacts_path);
        ctx.log_line(format!("run created for {} ({})", base_url, env));
        self.store.save(&ctx).await?;
        info!(run_id = %run_id, base_url = %base_url, env = %env, "Run created");
        Ok((*self.put_cache(ctx)).clone())
    }

    /// Current snapshot: memory cache first, else the persisted file.
    pub async fn get(&self, run_id: &str) -> Result<RunContext, OrchestratorError> {
        Ok((*self.snapshot(run_id).await?).clone())
    }

    /// Shared snapshot without cloning the context.
    pub async fn snapshot(&self, run_id: &str) -> Result<Arc<RunContext>, OrchestratorError> {
        if let Some(ctx) = self.cached(run_id) {
            return Ok(ctx);
        }
        if !is_valid_run_id(run_id) {
            return Err(OrchestratorError::NotFound(format!("Run '{}'", run_id)));
        }
        match self.store.load(run_id).await? {
            Some(ctx) => {
                debug!(run_id = %run_id, "Loaded run from disk");
                Ok(self.put_cache(ctx))
            }
            None => Err(OrchestratorError::NotFound(format!("Run '{}'", run_id))),
        }
    }

    /// Read-modify-write-persist a run atomically with respect to other
    /// writers of the same run.
    pub async fn update<F>(&self, run_id: &str, mutate: F) -> Result<RunContext, OrchestratorError>
    where
        F: FnOnce(&mut RunContext),
    {
        let lock = self.write_lock(run_id);
        let _guard = lock.lock().await;

        let mut ctx = self.get(run_id).await?;
        mutate(&mut ctx);
        ctx.updated_at = chrono::Utc::now();
        self.store.save(&ctx).await?;
        Ok((*self.put_cache(ctx)).clone())
    }

    /// Replace the whole context (used by the engine, which owns the run
    /// while it drives it).
    pub async fn save(&self, ctx: RunContext) -> Result<RunContext, OrchestratorError> {
        let lock = self.write_lock(&ctx.run_id);
        let _guard = lock.lock().await;

        self.store.save(&ctx).await?;
        Ok((*self.put_cache(ctx)).clone())
    }

    /// Enter `state`, stamping the first-entry time, and persist.
    pub async fn transition_state(
        &self,
        run_id: &str,
        state: RunState,
    ) -> Result<RunContext, OrchestratorError> {
        let ctx = self.update(run_id, |ctx| ctx.enter(state)).await?;
        debug!(run_id = %run_id, state = %state, "State transition persisted");
        Ok(ctx)
    }

    pub async fn list(&self) -> Result<Vec<RunContext>, OrchestratorError> {
        Ok(self.store.list().await?)
    }

    /// Drop cached contexts whose runs were removed from disk.
    pub fn forget(&self, run_ids: &[String]) {
        let mut cache = self.cache.write().unwrap_or_else(PoisonError::into_inner);
        let mut locks = self
            .write_locks
            .lock()
            .unwrap_or_else(PoisonError::into_inner);
        for id in run_ids {
            cache.remove(id);
            locks.remove(id);
        }
    }
}
