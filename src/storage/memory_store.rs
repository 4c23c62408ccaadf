use std::collections::HashMap;
use std::sync::{Mutex, PoisonError};

use anyhow::Result;
use async_trait::async_trait;

use crate::engine::types::RunContext;
use crate::storage::RunStore;

/// In-memory run store. Holds runs only for the lifetime of the instance.
#[derive(Default)]
pub struct MemoryRunStore {
    runs: Mutex<HashMap<String, RunContext>>,
}

impl MemoryRunStore {
    pub fn new() -> Self {
        Self::default()
    }
}

#[async_trait]
impl RunStore for MemoryRunStore {
    async fn load(&self, run_id: &str) -> Result<Option<RunContext>> {
        let runs = self.runs.lock().unwrap_or_else(PoisonError::into_inner);
        Ok(runs.get(run_id).cloned())
    }

    async fn save(&self, ctx: &RunContext) -> Result<()> {
        self.runs
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .insert(ctx.run_id.clone(), ctx.clone());
        Ok(())
    }

    async fn exists(&self, run_id: &str) -> Result<bool> {
        let runs = self.runs.lock().unwrap_or_else(PoisonError::into_inner);
        Ok(runs.contains_key(run_id))
    }

    async fn list(&self) -> Result<Vec<RunContext>> {
        let runs = self.runs.lock().unwrap_or_else(PoisonError::into_inner);
        let mut all: Vec<RunContext> = runs.values().cloned().collect();
        all.sort_by(|a, b| b.created_at.cmp(&a.created_at));
        Ok(all)
    }

    async fn delete(&self, run_id: &str) -> Result<()> {
        self.runs
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .remove(run_id);
        Ok(())
    }
}
