//! Runs one script inside an isolated unit.

use std::any::Any;
use std::panic::{AssertUnwindSafe, catch_unwind};

use futures::FutureExt;
use serde_json::Value;

use crate::script::{HostHandle, ScriptFault, ScriptRegistry};

/// Run `module_path` with `inputs`, turning every failure mode into a
/// [`ScriptFault`]: unknown module, returned error, or panic.
///
/// When the run ends, `host` is marked finished so callbacks still waiting
/// for a reply are abandoned.
pub async fn run_script(
    registry: &ScriptRegistry,
    module_path: &str,
    inputs: Value,
    host: HostHandle,
) -> Result<Value, ScriptFault> {
    let outcome = match registry.get(module_path) {
        None => Err(ScriptFault::new(format!("Script not found: {}", module_path))),
        Some(script) => {
            let guarded_host = host.clone();
            match catch_unwind(AssertUnwindSafe(|| script.run(inputs, guarded_host))) {
                Ok(future) => match AssertUnwindSafe(future).catch_unwind().await {
                    Ok(result) => result,
                    Err(payload) => Err(panic_fault(&payload)),
                },
                Err(payload) => Err(panic_fault(&payload)),
            }
        }
    };

    host.finish();

    outcome.map_err(|fault| {
        if fault.stack.is_some() {
            fault
        } else {
            let stack = format!("{}\n    at {}", fault.message, module_path);
            fault.with_stack(stack)
        }
    })
}

fn panic_fault(payload: &Box<dyn Any + Send>) -> ScriptFault {
    let message = if let Some(s) = payload.downcast_ref::<&str>() {
        s.to_string()
    } else if let Some(s) = payload.downcast_ref::<String>() {
        s.clone()
    } else {
        "unknown panic".to_string()
    };
    tracing::warn!("Script panicked: {}", message);
    ScriptFault::new(format!("script panicked: {}", message))
}
