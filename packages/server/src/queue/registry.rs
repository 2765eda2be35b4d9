//! Maps job-type strings to handlers, mirroring the teacher's
//! `kernel/jobs/registry.rs` boxed-closure dispatch.

use std::collections::HashMap;
use std::future::Future;
use std::pin::Pin;
use std::sync::Arc;

use anyhow::anyhow;

use crate::error::{IngestError, IngestResult};

type BoxedHandler<Ctx> = Box<
    dyn Fn(serde_json::Value, Arc<Ctx>) -> Pin<Box<dyn Future<Output = IngestResult<Option<serde_json::Value>>> + Send>>
        + Send
        + Sync,
>;

/// Registry that maps queue names to handlers. `Ctx` is the shared
/// application context (DB pool, UMS client, event bus) every handler needs.
pub struct JobRegistry<Ctx> {
    handlers: HashMap<&'static str, BoxedHandler<Ctx>>,
}

impl<Ctx: Send + Sync + 'static> Default for JobRegistry<Ctx> {
    fn default() -> Self {
        Self {
            handlers: HashMap::new(),
        }
    }
}

impl<Ctx: Send + Sync + 'static> JobRegistry<Ctx> {
    pub fn new() -> Self {
        Self::default()
    }

    /// Register a handler for `queue_name`. The handler receives the raw
    /// JSON payload and the shared context, and may return an output value
    /// persisted to `jobs.output` on success.
    pub fn register<F, Fut>(&mut self, queue_name: &'static str, handler: F)
    where
        F: Fn(serde_json::Value, Arc<Ctx>) -> Fut + Send + Sync + 'static,
        Fut: Future<Output = IngestResult<Option<serde_json::Value>>> + Send + 'static,
    {
        let boxed: BoxedHandler<Ctx> = Box::new(move |payload, ctx| Box::pin(handler(payload, ctx)));
        self.handlers.insert(queue_name, boxed);
    }

    pub fn is_registered(&self, queue_name: &str) -> bool {
        self.handlers.contains_key(queue_name)
    }

    pub fn registered_names(&self) -> Vec<&'static str> {
        self.handlers.keys().copied().collect()
    }

    pub async fn execute(
        &self,
        queue_name: &str,
        payload: serde_json::Value,
        ctx: Arc<Ctx>,
    ) -> IngestResult<Option<serde_json::Value>> {
        let handler = self
            .handlers
            .get(queue_name)
            .ok_or_else(|| IngestError::Validation {
                message: format!("unknown job type: {queue_name}"),
            })?;

        (handler)(payload, ctx).await
    }
}

/// Convenience alias used where a handler must explicitly reject rather
/// than retry (mirrors the teacher's `anyhow!` early-return idiom).
pub fn unregistered(queue_name: &str) -> anyhow::Error {
    anyhow!("unknown job type: {queue_name}")
}

#[cfg(test)]
mod tests {
    use super::*;

    struct Ctx;

    #[tokio::test]
    async fn register_and_execute_roundtrip() {
        let mut registry: JobRegistry<Ctx> = JobRegistry::new();
        registry.register("activity-sync", |payload, _ctx| async move {
            Ok(Some(payload))
        });

        assert!(registry.is_registered("activity-sync"));

        let result = registry
            .execute("activity-sync", serde_json::json!({"serverId": 1}), Arc::new(Ctx))
            .await
            .unwrap();
        assert_eq!(result, Some(serde_json::json!({"serverId": 1})));
    }

    #[tokio::test]
    async fn execute_unknown_queue_is_validation_error() {
        let registry: JobRegistry<Ctx> = JobRegistry::new();
        let err = registry
            .execute("unknown", serde_json::json!({}), Arc::new(Ctx))
            .await
            .unwrap_err();
        assert!(matches!(err, IngestError::Validation { .. }));
    }
}
