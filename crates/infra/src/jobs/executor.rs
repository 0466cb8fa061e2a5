//! Task executors: the pluggable business logic a worker runs for each job.

use std::collections::HashMap;
use std::future::Future;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use serde_json::Value;
use tracing::debug;

use jobforge_core::{TaskFailure, TaskOutcome};

/// Runs a job's task. Failures are classified, never panics or raw errors.
#[async_trait]
pub trait TaskExecutor: Send + Sync {
    async fn execute(&self, task_type: &str, payload: &Value) -> TaskOutcome;
}

/// Handler for one task type (or a family of them).
#[async_trait]
pub trait TaskHandler: Send + Sync {
    async fn handle(&self, payload: &Value) -> TaskOutcome;
}

struct FnHandler<F>(F);

#[async_trait]
impl<F, Fut> TaskHandler for FnHandler<F>
where
    F: Fn(Value) -> Fut + Send + Sync + 'static,
    Fut: Future<Output = TaskOutcome> + Send + 'static,
{
    async fn handle(&self, payload: &Value) -> TaskOutcome {
        (self.0)(payload.clone()).await
    }
}

/// Task executor dispatching on `task_type`.
///
/// Lookup order: exact name, then the longest matching `prefix.*` pattern
/// (e.g. `"email.*"` matches `"email.welcome"`), then `"*"`. A task type with
/// no handler fails as non-retryable.
#[derive(Default, Clone)]
pub struct HandlerRegistry {
    handlers: HashMap<String, Arc<dyn TaskHandler>>,
}

impl HandlerRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Registry with the built-in tasks (`sleep_test`).
    pub fn with_builtin_tasks() -> Self {
        let mut registry = Self::new();
        registry.register("sleep_test", SleepTestTask);
        registry
    }

    /// Register a handler for a task type pattern.
    pub fn register<H>(&mut self, pattern: impl Into<String>, handler: H) -> &mut Self
    where
        H: TaskHandler + 'static,
    {
        self.handlers.insert(pattern.into(), Arc::new(handler));
        self
    }

    /// Register an async closure as a handler.
    pub fn register_fn<F, Fut>(&mut self, pattern: impl Into<String>, handler: F) -> &mut Self
    where
        F: Fn(Value) -> Fut + Send + Sync + 'static,
        Fut: Future<Output = TaskOutcome> + Send + 'static,
    {
        self.register(pattern, FnHandler(handler))
    }

    /// Find the handler for a task type.
    pub fn resolve(&self, task_type: &str) -> Option<&Arc<dyn TaskHandler>> {
        if let Some(h) = self.handlers.get(task_type) {
            return Some(h);
        }

        let category = self
            .handlers
            .iter()
            .filter_map(|(pattern, handler)| {
                let prefix = pattern.strip_suffix(".*")?;
                let rest = task_type.strip_prefix(prefix)?;
                rest.starts_with('.').then_some((prefix.len(), handler))
            })
            .max_by_key(|(len, _)| *len);
        if let Some((_, h)) = category {
            return Some(h);
        }

        self.handlers.get("*")
    }

    pub fn patterns(&self) -> Vec<&str> {
        let mut patterns: Vec<&str> = self.handlers.keys().map(String::as_str).collect();
        patterns.sort_unstable();
        patterns
    }
}

impl core::fmt::Debug for HandlerRegistry {
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        f.debug_struct("HandlerRegistry")
            .field("patterns", &self.patterns())
            .finish()
    }
}

#[async_trait]
impl TaskExecutor for HandlerRegistry {
    async fn execute(&self, task_type: &str, payload: &Value) -> TaskOutcome {
        match self.resolve(task_type) {
            Some(handler) => handler.handle(payload).await,
            None => {
                debug!(task_type, "no handler registered");
                Err(TaskFailure::unknown_task_type(task_type))
            }
        }
    }
}

/// Built-in `sleep_test` task.
///
/// Sleeps `payload.seconds` (default 1, fractions allowed) and succeeds.
/// `payload.fail` set to `"retryable"` or `"permanent"` makes it fail after
/// sleeping, which is handy for exercising retries end to end.
#[derive(Debug, Default, Clone, Copy)]
pub struct SleepTestTask;

impl SleepTestTask {
    const DEFAULT_SECONDS: f64 = 1.0;
}

#[async_trait]
impl TaskHandler for SleepTestTask {
    async fn handle(&self, payload: &Value) -> TaskOutcome {
        let seconds = match payload.get("seconds") {
            None | Some(Value::Null) => Self::DEFAULT_SECONDS,
            Some(v) => v
                .as_f64()
                .ok_or_else(|| TaskFailure::non_retryable("seconds must be a number"))?,
        };
        let duration = Duration::try_from_secs_f64(seconds)
            .map_err(|e| TaskFailure::non_retryable(format!("invalid seconds {seconds}: {e}")))?;

        tokio::time::sleep(duration).await;

        match payload.get("fail").and_then(Value::as_str) {
            None => Ok(()),
            Some("retryable") => Err(TaskFailure::retryable("forced retryable failure")),
            Some("permanent") => Err(TaskFailure::non_retryable("forced permanent failure")),
            Some(other) => Err(TaskFailure::non_retryable(format!(
                "unknown fail mode: {other}"
            ))),
        }
    }
}
