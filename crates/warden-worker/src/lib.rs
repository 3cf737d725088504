//! Scripts compiled into the warden worker.
//!
//! Worker processes resolve a request's module path against [`registry`].
//! Embedders ship their own worker binary with their own registry; the scripts
//! here cover the behaviours the pools need to support and are what the
//! integration tests run against.

use std::time::Duration;

use serde_json::{Value, json};
use warden_core::{HostHandle, ScriptFault, ScriptRegistry};

/// Every script this worker can run, keyed by module path.
pub fn registry() -> ScriptRegistry {
    ScriptRegistry::new()
        .with("echo", echo)
        .with("callback", callback)
        .with("callback-error", callback_error)
        .with("error", error)
        .with("panic", panic)
        .with("never-finishes", never_finishes)
        .with("sleep", sleep)
        .with("parallel-callbacks", parallel_callbacks)
        .with("callback-after-end", callback_after_end)
        .with("crash", crash)
        .with("identity", identity)
}

/// Returns its inputs.
async fn echo(inputs: Value, _host: HostHandle) -> Result<Value, ScriptFault> {
    Ok(inputs)
}

/// Calls back with `inputs.arg` and returns `{"test": <first reply value>}`.
async fn callback(inputs: Value, host: HostHandle) -> Result<Value, ScriptFault> {
    let arg = inputs.get("arg").cloned().unwrap_or(Value::Null);
    let reply = host.call(vec![arg]).await?;
    Ok(json!({ "test": reply.into_iter().next().unwrap_or(Value::Null) }))
}

/// Calls back and reports the callback's error as `{"error": <message>}`.
async fn callback_error(_inputs: Value, host: HostHandle) -> Result<Value, ScriptFault> {
    match host.call(vec![]).await {
        Ok(values) => Ok(json!({ "values": values })),
        Err(fault) => Ok(json!({ "error": fault.message })),
    }
}

/// Fails with `inputs.message`.
async fn error(inputs: Value, _host: HostHandle) -> Result<Value, ScriptFault> {
    let message = inputs
        .get("message")
        .and_then(Value::as_str)
        .unwrap_or("script failed");
    Err(ScriptFault::new(message))
}

async fn panic(_inputs: Value, _host: HostHandle) -> Result<Value, ScriptFault> {
    panic!("deliberate panic");
}

async fn never_finishes(_inputs: Value, _host: HostHandle) -> Result<Value, ScriptFault> {
    futures::future::pending::<()>().await;
    Ok(Value::Null)
}

/// Sleeps `inputs.ms` milliseconds, then returns `inputs.value`.
async fn sleep(inputs: Value, _host: HostHandle) -> Result<Value, ScriptFault> {
    let ms = inputs.get("ms").and_then(Value::as_u64).unwrap_or(0);
    tokio::time::sleep(Duration::from_millis(ms)).await;
    Ok(inputs.get("value").cloned().unwrap_or(Value::Null))
}

/// Issues `inputs.count` callbacks at once and returns the replies in call order.
async fn parallel_callbacks(inputs: Value, host: HostHandle) -> Result<Value, ScriptFault> {
    let count = inputs.get("count").and_then(Value::as_u64).unwrap_or(3);
    let calls = (0..count).map(|i| {
        let host = host.clone();
        async move { host.call(vec![json!(i)]).await }
    });
    let replies = futures::future::try_join_all(calls).await?;
    Ok(Value::Array(
        replies
            .into_iter()
            .map(|values| values.into_iter().next().unwrap_or(Value::Null))
            .collect(),
    ))
}

/// Returns at once and calls back after it has finished.
async fn callback_after_end(_inputs: Value, host: HostHandle) -> Result<Value, ScriptFault> {
    tokio::spawn(async move {
        tokio::time::sleep(Duration::from_millis(20)).await;
        if let Err(fault) = host.call(vec![json!("late")]).await {
            tracing::debug!("Late callback rejected: {}", fault);
        }
    });
    Ok(json!("done"))
}

/// Takes the whole worker process down.
async fn crash(_inputs: Value, _host: HostHandle) -> Result<Value, ScriptFault> {
    std::process::abort();
}

/// Reports which process and thread ran it.
async fn identity(_inputs: Value, _host: HostHandle) -> Result<Value, ScriptFault> {
    Ok(json!({
        "pid": std::process::id(),
        "thread": std::thread::current().name().unwrap_or("unnamed"),
    }))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_registry_contents() {
        let scripts = registry();
        for module in ["echo", "callback", "error", "crash", "identity"] {
            assert!(scripts.contains(module), "missing {}", module);
        }
        assert!(!scripts.contains("missing"));
    }
}
