//! Handler registry
//!
//! Collaborators plug real work into the queue by registering a handler under a
//! task name. The registry is built once at startup and shared with the workers;
//! there is no global registry.

use async_trait::async_trait;
use futures::future::BoxFuture;
use serde_json::Value;
use std::collections::HashMap;
use std::future::Future;
use std::sync::Arc;
use thiserror::Error;
use tracing::debug;

use super::task::TaskArgs;

/// Errors returned by task handlers
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum HandlerError {
    /// Transient failure; the task is retried while retries remain
    #[error("{0}")]
    Failed(String),

    /// Failure that retrying cannot fix
    #[error("permanent failure: {0}")]
    Permanent(String),

    /// Arguments did not have the expected shape
    #[error("invalid arguments: {0}")]
    InvalidArgs(String),
}

impl HandlerError {
    /// Transient failure from anything displayable
    pub fn failed(msg: impl std::fmt::Display) -> Self {
        HandlerError::Failed(msg.to_string())
    }

    /// Whether the worker may retry after this error
    pub fn is_retryable(&self) -> bool {
        matches!(self, HandlerError::Failed(_))
    }
}

/// What a handler knows about the task it is running
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TaskContext {
    pub task_id: String,
    pub name: String,
    /// 1 for the first run, 2 for the first retry and so on
    pub attempt: u32,
    pub owner_id: Option<String>,
}

/// A unit of work bound to a task name
#[async_trait]
pub trait TaskHandler: Send + Sync {
    /// Run the task and return its result
    async fn handle(&self, ctx: &TaskContext, args: &TaskArgs) -> Result<Value, HandlerError>;
}

type HandlerFn = dyn Fn(TaskContext, TaskArgs) -> BoxFuture<'static, Result<Value, HandlerError>> + Send + Sync;

/// Adapter turning an async closure into a [`TaskHandler`]
struct FnHandler {
    f: Box<HandlerFn>,
}

#[async_trait]
impl TaskHandler for FnHandler {
    async fn handle(&self, ctx: &TaskContext, args: &TaskArgs) -> Result<Value, HandlerError> {
        (self.f)(ctx.clone(), args.clone()).await
    }
}

/// Task name to handler lookup
#[derive(Default, Clone)]
pub struct HandlerRegistry {
    handlers: HashMap<String, Arc<dyn TaskHandler>>,
}

impl HandlerRegistry {
    /// Create an empty registry
    pub fn new() -> Self {
        Self::default()
    }

    /// Register `handler` for tasks named `name`, replacing any previous one
    pub fn register(&mut self, name: impl Into<String>, handler: Arc<dyn TaskHandler>) -> &mut Self {
        let name = name.into();
        debug!("Registering task handler '{}'", name);
        self.handlers.insert(name, handler);
        self
    }

    /// Register an async closure
    pub fn register_fn<F, Fut>(&mut self, name: impl Into<String>, f: F) -> &mut Self
    where
        F: Fn(TaskContext, TaskArgs) -> Fut + Send + Sync + 'static,
        Fut: Future<Output = Result<Value, HandlerError>> + Send + 'static,
    {
        let handler = FnHandler {
            f: Box::new(move |ctx, args| Box::pin(f(ctx, args))),
        };
        self.register(name, Arc::new(handler))
    }

    /// Look up the handler for a task name
    pub fn get(&self, name: &str) -> Option<Arc<dyn TaskHandler>> {
        self.handlers.get(name).cloned()
    }

    pub fn contains(&self, name: &str) -> bool {
        self.handlers.contains_key(name)
    }

    /// Registered task names, sorted
    pub fn names(&self) -> Vec<String> {
        let mut names: Vec<String> = self.handlers.keys().cloned().collect();
        names.sort();
        names
    }

    pub fn len(&self) -> usize {
        self.handlers.len()
    }

    pub fn is_empty(&self) -> bool {
        self.handlers.is_empty()
    }
}

impl std::fmt::Debug for HandlerRegistry {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("HandlerRegistry").field("handlers", &self.names()).finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    struct Echo;

    #[async_trait]
    impl TaskHandler for Echo {
        async fn handle(&self, _ctx: &TaskContext, args: &TaskArgs) -> Result<Value, HandlerError> {
            Ok(json!({ "text": args.require_str("text")? }))
        }
    }

    fn ctx(name: &str) -> TaskContext {
        TaskContext {
            task_id: "t-1".to_string(),
            name: name.to_string(),
            attempt: 1,
            owner_id: None,
        }
    }

    #[tokio::test]
    async fn test_register_and_dispatch() {
        let mut registry = HandlerRegistry::new();
        registry.register("echo", Arc::new(Echo));
        registry.register_fn("double", |_ctx, args| async move {
            let n = args.require_i64("n")?;
            Ok::<_, HandlerError>(json!(n * 2))
        });

        assert_eq!(registry.names(), vec!["double".to_string(), "echo".to_string()]);

        let echo = registry.get("echo").unwrap();
        let out = echo.handle(&ctx("echo"), &TaskArgs::new().with("text", "hi")).await.unwrap();
        assert_eq!(out, json!({"text": "hi"}));

        let double = registry.get("double").unwrap();
        let out = double.handle(&ctx("double"), &TaskArgs::new().with("n", 21)).await.unwrap();
        assert_eq!(out, json!(42));

        assert!(registry.get("missing").is_none());
    }

    #[tokio::test]
    async fn test_invalid_args_is_not_retryable() {
        let mut registry = HandlerRegistry::new();
        registry.register("echo", Arc::new(Echo));

        let err = registry
            .get("echo")
            .unwrap()
            .handle(&ctx("echo"), &TaskArgs::new())
            .await
            .unwrap_err();

        assert!(matches!(err, HandlerError::InvalidArgs(_)));
        assert!(!err.is_retryable());
        assert!(HandlerError::failed("timeout").is_retryable());
        assert!(!HandlerError::Permanent("gone".into()).is_retryable());
    }
}
