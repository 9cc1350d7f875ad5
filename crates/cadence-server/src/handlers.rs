//! Built-in task handlers
//!
//! Real work is plugged in by embedding applications through
//! [`HandlerRegistry::register`]; the binary ships with these two so a fresh
//! deployment can be exercised end to end.

use cadence_core::tasks::{HandlerError, HandlerRegistry, TaskArgs, TaskContext};
use serde_json::{json, Value};
use std::time::Duration;

/// Longest pause the `sleep` handler accepts
pub const MAX_SLEEP_MS: i64 = 60_000;

/// Echo the arguments back as the result
async fn echo(ctx: &TaskContext, args: &TaskArgs) -> Result<Value, HandlerError> {
    Ok(json!({
        "task_id": ctx.task_id,
        "attempt": ctx.attempt,
        "args": args,
    }))
}

/// Sleep for `ms` milliseconds, then complete
async fn sleep(args: &TaskArgs) -> Result<Value, HandlerError> {
    let ms = args.require_i64("ms")?;
    if !(0..=MAX_SLEEP_MS).contains(&ms) {
        return Err(HandlerError::InvalidArgs(format!(
            "ms must be between 0 and {}",
            MAX_SLEEP_MS
        )));
    }

    tokio::time::sleep(Duration::from_millis(ms as u64)).await;
    Ok(json!({ "slept_ms": ms }))
}

/// Registry with the built-in handlers
pub fn builtin_registry() -> HandlerRegistry {
    let mut registry = HandlerRegistry::new();
    registry.register_fn("echo", |ctx, args| async move { echo(&ctx, &args).await });
    registry.register_fn("sleep", |_ctx, args| async move { sleep(&args).await });
    registry
}
