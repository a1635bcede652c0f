//! Multi-pipeline pool with per-model-id FIFO serialization.
//!
//! A shared, lock-guarded registry (`RwLock` around a `HashMap`) of lazily
//! constructed pipelines, with a per-model-id `tokio::sync::Mutex` that
//! doubles as the serialization latch: acquiring it in FIFO order is exactly
//! what `tokio::sync::Mutex` already guarantees for its waiters.

use std::collections::HashMap;
use std::sync::Arc;

use tokio::sync::Mutex;

use crate::cache::snapshot::KvCacheSnapshot;
use crate::config::GenerationOptions;
use crate::error::Result;
use crate::pipeline::handle::Pipeline;

/// Constructs a pipeline for a model id not yet cached. Injected so the
/// pool stays agnostic to where manifests and weights come from.
pub type PipelineLoader =
    dyn Fn(&str) -> std::pin::Pin<Box<dyn std::future::Future<Output = Result<Pipeline>> + Send>> + Send + Sync;

struct PoolEntry {
    pipeline: Mutex<Pipeline>,
}

/// Holds a mapping from model-id to pipeline, each guarded by its own
/// latch. Different model-ids proceed in parallel; same-id callers
/// serialize in FIFO order via the per-entry mutex.
pub struct MultiPipelinePool {
    entries: Mutex<HashMap<String, Arc<PoolEntry>>>,
    loader: Arc<PipelineLoader>,
    shared_prefix: Mutex<Option<KvCacheSnapshot>>,
}

impl MultiPipelinePool {
    pub fn new(loader: Arc<PipelineLoader>) -> Self {
        Self {
            entries: Mutex::new(HashMap::new()),
            loader,
            shared_prefix: Mutex::new(None),
        }
    }

    /// Record a KV prefix shared across all pool-level calls that don't
    /// supply their own per-call prefix.
    pub async fn set_shared_prefix(&self, snapshot: Option<KvCacheSnapshot>) {
        *self.shared_prefix.lock().await = snapshot;
    }

    async fn get_or_create_entry(&self, model_id: &str) -> Result<Arc<PoolEntry>> {
        let mut entries = self.entries.lock().await;
        if let Some(entry) = entries.get(model_id) {
            return Ok(Arc::clone(entry));
        }

        let pipeline = (self.loader)(model_id).await?;
        let entry = Arc::new(PoolEntry {
            pipeline: Mutex::new(pipeline),
        });
        entries.insert(model_id.to_string(), Arc::clone(&entry));
        Ok(entry)
    }

    /// Acquires the per-id latch in FIFO order, then runs one generation to
    /// completion. Concurrent callers for the same `model_id` serialize;
    /// different model-ids run concurrently.
    pub async fn execute(
        &self,
        model_id: &str,
        prompt: &str,
        options: GenerationOptions,
        prefix: Option<&KvCacheSnapshot>,
    ) -> Result<Vec<String>> {
        let entry = self.get_or_create_entry(model_id).await?;
        let mut pipeline = entry.pipeline.lock().await;

        let prefix_to_use = if prefix.is_some() {
            prefix.cloned()
        } else {
            self.shared_prefix.lock().await.clone()
        };

        match prefix_to_use {
            Some(snapshot) => pipeline.generate_with_prefix_kv(&snapshot, prompt, options),
            None => pipeline.generate(prompt, options),
        }
    }
}
