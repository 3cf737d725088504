//! End-to-end tests of both process backends against the real worker binary.

use std::sync::Arc;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::time::Duration;

use serde_json::{Value, json};
use warden_core::pool::ServerPool;
use warden_core::{
    Backend, CallbackRelay, CorrelationRegistry, DEFAULT_TIMEOUT_MESSAGE, ExecuteOptions, ExecutionError,
    ManagerConfig, ProtocolFault, ScriptManager, ScriptRegistry, ScriptTimeout, Strategy,
};

const STRATEGIES: [Strategy; 2] = [Strategy::DedicatedProcess, Strategy::HttpServer];

fn config(strategy: Strategy) -> ManagerConfig {
    ManagerConfig::default()
        .with_strategy(strategy)
        .with_workers(2)
        .with_timeout(ScriptTimeout::After(Duration::from_secs(10)))
        .with_worker_program(env!("CARGO_BIN_EXE_warden-worker"))
}

async fn started(config: ManagerConfig) -> ScriptManager {
    // Process workers carry their own scripts.
    let manager = ScriptManager::new(config, ScriptRegistry::new());
    manager.start().await.unwrap();
    manager
}

async fn run(manager: &ScriptManager, inputs: Value, options: ExecuteOptions) -> Result<Value, ExecutionError> {
    manager.execute(inputs, options).unwrap().await
}

#[tokio::test(flavor = "multi_thread")]
async fn test_echo() {
    for strategy in STRATEGIES {
        let manager = started(config(strategy)).await;
        let result = run(&manager, json!({"foo": "foo"}), ExecuteOptions::new("echo")).await;
        assert_eq!(result, Ok(json!({"foo": "foo"})), "{:?}", strategy);
        assert_eq!(manager.pending_requests(), 0);
        manager.kill();
    }
}

#[tokio::test(flavor = "multi_thread")]
async fn test_script_error_carries_message_and_stack() {
    for strategy in STRATEGIES {
        let manager = started(config(strategy)).await;
        let err = run(&manager, json!({"message": "boom"}), ExecuteOptions::new("error"))
            .await
            .unwrap_err();
        assert!(matches!(err, ExecutionError::Script { .. }), "{:?}", strategy);
        assert_eq!(err.message(), "boom");
        assert!(err.stack().unwrap().contains("error"));
        manager.kill();
    }
}

#[tokio::test(flavor = "multi_thread")]
async fn test_panic_is_script_error() {
    for strategy in STRATEGIES {
        let manager = started(config(strategy)).await;
        let err = run(&manager, json!({}), ExecuteOptions::new("panic"))
            .await
            .unwrap_err();
        assert!(matches!(err, ExecutionError::Script { .. }), "{:?}", strategy);
        assert!(err.message().contains("deliberate panic"));
        manager.kill();
    }
}

#[tokio::test(flavor = "multi_thread")]
async fn test_unknown_module_is_script_error() {
    for strategy in STRATEGIES {
        let manager = started(config(strategy)).await;
        let err = run(&manager, json!({}), ExecuteOptions::new("no-such-script"))
            .await
            .unwrap_err();
        assert!(err.message().contains("no-such-script"), "{:?}", strategy);
        manager.kill();
    }
}

#[tokio::test(flavor = "multi_thread")]
async fn test_callback_roundtrip() {
    for strategy in STRATEGIES {
        let manager = started(config(strategy)).await;
        let options = ExecuteOptions::new("callback").with_callback(|args, responder| {
            let arg = args[0].as_str().unwrap_or_default().to_string();
            responder.ok(vec![json!(format!("{}aaa", arg))]);
        });
        let result = run(&manager, json!({"arg": "test"}), options).await;
        assert_eq!(result, Ok(json!({"test": "testaaa"})), "{:?}", strategy);
        manager.kill();
    }
}

#[tokio::test(flavor = "multi_thread")]
async fn test_callback_error_reaches_script() {
    for strategy in STRATEGIES {
        let manager = started(config(strategy)).await;
        let options = ExecuteOptions::new("callback-error").with_callback(|_args, responder| {
            responder.err("host refused");
        });
        let result = run(&manager, json!({}), options).await;
        assert_eq!(result, Ok(json!({"error": "host refused"})), "{:?}", strategy);
        manager.kill();
    }
}

#[tokio::test(flavor = "multi_thread")]
async fn test_callback_answered_later_from_another_task() {
    for strategy in STRATEGIES {
        let manager = started(config(strategy)).await;
        let options = ExecuteOptions::new("callback").with_callback(|_args, responder| {
            tokio::spawn(async move {
                tokio::time::sleep(Duration::from_millis(20)).await;
                responder.ok(vec![json!("later")]);
            });
        });
        let result = run(&manager, json!({"arg": "x"}), options).await;
        assert_eq!(result, Ok(json!({"test": "later"})), "{:?}", strategy);
        manager.kill();
    }
}

#[tokio::test(flavor = "multi_thread")]
async fn test_parallel_callbacks_resolve_independently() {
    for strategy in STRATEGIES {
        let manager = started(config(strategy)).await;
        let options = ExecuteOptions::new("parallel-callbacks").with_callback(|args, responder| {
            let i = args[0].as_u64().unwrap_or_default();
            // Answer in reverse order of arrival.
            tokio::spawn(async move {
                tokio::time::sleep(Duration::from_millis(10 * (5 - i))).await;
                responder.ok(vec![json!(i * 10)]);
            });
        });
        let result = run(&manager, json!({"count": 5}), options).await;
        assert_eq!(result, Ok(json!([0, 10, 20, 30, 40])), "{:?}", strategy);
        manager.kill();
    }
}

#[tokio::test(flavor = "multi_thread")]
async fn test_callback_after_end_is_dropped() {
    for strategy in STRATEGIES {
        let manager = started(config(strategy)).await;
        let calls = Arc::new(AtomicUsize::new(0));
        let counter = Arc::clone(&calls);
        let options = ExecuteOptions::new("callback-after-end").with_callback(move |_args, responder| {
            counter.fetch_add(1, Ordering::SeqCst);
            responder.ok(vec![]);
        });

        let result = run(&manager, json!({}), options).await;
        assert_eq!(result, Ok(json!("done")), "{:?}", strategy);

        tokio::time::sleep(Duration::from_millis(100)).await;
        assert_eq!(calls.load(Ordering::SeqCst), 0, "{:?}", strategy);
        manager.kill();
    }
}

#[tokio::test(flavor = "multi_thread")]
async fn test_many_parallel_requests_keep_their_results() {
    for strategy in STRATEGIES {
        let manager = started(config(strategy)).await;
        let executions: Vec<_> = (0..20)
            .map(|i| {
                manager
                    .execute(
                        json!({"ms": (20 - i) * 5, "value": i}),
                        ExecuteOptions::new("sleep"),
                    )
                    .unwrap()
            })
            .collect();

        let results = futures::future::join_all(executions).await;
        for (i, result) in results.into_iter().enumerate() {
            assert_eq!(result, Ok(json!(i)), "{:?}", strategy);
        }
        assert_eq!(manager.pending_requests(), 0);
        manager.kill();
    }
}

#[tokio::test(flavor = "multi_thread")]
async fn test_timeout() {
    for strategy in STRATEGIES {
        let manager = started(config(strategy)).await;
        let err = run(
            &manager,
            json!({}),
            ExecuteOptions::new("never-finishes").with_timeout_millis(10),
        )
        .await
        .unwrap_err();
        assert!(err.is_timeout(), "{:?}", strategy);
        assert_eq!(err.message(), DEFAULT_TIMEOUT_MESSAGE);
        assert_eq!(manager.pending_requests(), 0);

        // The pool keeps serving after the timed-out worker is killed.
        let result = retry_echo(&manager).await;
        assert_eq!(result, Ok(json!({"after": "timeout"})), "{:?}", strategy);
        manager.kill();
    }
}

#[tokio::test(flavor = "multi_thread")]
async fn test_crash_is_transport_error_and_pool_recovers() {
    for strategy in STRATEGIES {
        let manager = started(config(strategy).with_workers(1)).await;
        let err = run(&manager, json!({}), ExecuteOptions::new("crash"))
            .await
            .unwrap_err();
        assert!(err.is_transport(), "{:?}: {:?}", strategy, err);

        let result = retry_echo(&manager).await;
        assert_eq!(result, Ok(json!({"after": "timeout"})), "{:?}", strategy);
        manager.kill();
    }
}

/// Echo until a replacement worker is up.
async fn retry_echo(manager: &ScriptManager) -> Result<Value, ExecutionError> {
    let mut last = Err(ExecutionError::transport("never ran"));
    for _ in 0..100 {
        last = run(manager, json!({"after": "timeout"}), ExecuteOptions::new("echo")).await;
        if last.is_ok() {
            break;
        }
        tokio::time::sleep(Duration::from_millis(50)).await;
    }
    last
}

#[tokio::test(flavor = "multi_thread")]
async fn test_input_limit_rejects_large_request() {
    let config = config(Strategy::HttpServer).with_input_request_limit(Some(256));
    let manager = started(config).await;

    let big = "x".repeat(1024);
    let err = run(&manager, json!({"payload": big}), ExecuteOptions::new("echo"))
        .await
        .unwrap_err();
    assert!(err.is_transport());
    assert!(err.message().contains("256"));

    let small = run(&manager, json!({"ok": true}), ExecuteOptions::new("echo")).await;
    assert_eq!(small, Ok(json!({"ok": true})));
    manager.kill();
}

#[tokio::test(flavor = "multi_thread")]
async fn test_reservations_unsupported() {
    for strategy in STRATEGIES {
        let manager = started(config(strategy)).await;
        assert!(matches!(
            manager.reserve_for_task("task"),
            Err(ProtocolFault::ReservationsUnsupported(_))
        ));
        manager.kill();
    }
}

#[tokio::test(flavor = "multi_thread")]
async fn test_kill_fails_pending_and_is_idempotent() {
    for strategy in STRATEGIES {
        let manager = started(config(strategy)).await;
        let execution = manager
            .execute(json!({}), ExecuteOptions::new("never-finishes").with_timeout_millis(-1))
            .unwrap();
        tokio::time::sleep(Duration::from_millis(100)).await;

        manager.kill();
        manager.kill();
        assert!(execution.await.unwrap_err().is_transport(), "{:?}", strategy);
        assert_eq!(
            manager.execute(json!({}), ExecuteOptions::new("echo")).unwrap_err(),
            ProtocolFault::NotStarted
        );
    }
}

#[tokio::test(flavor = "multi_thread")]
async fn test_server_pool_restart_keeps_worker_count() {
    let relay = Arc::new(CallbackRelay::new(Arc::new(CorrelationRegistry::new())));
    let pool = ServerPool::new(&config(Strategy::HttpServer), relay);
    pool.start().await.unwrap();
    assert_eq!(pool.live_workers(), 2);
    let first = pool.generation();

    pool.kill();
    assert_eq!(pool.live_workers(), 0);
    pool.start().await.unwrap();
    assert_ne!(pool.generation(), first);

    // Supervisors of the killed workers have long noticed their exit by now.
    tokio::time::sleep(Duration::from_millis(1500)).await;
    assert_eq!(pool.live_workers(), 2);
    pool.kill();
}

#[tokio::test(flavor = "multi_thread")]
async fn test_restart_after_kill_serves_again() {
    for strategy in STRATEGIES {
        let manager = started(config(strategy)).await;
        manager.kill();
        manager.start().await.unwrap();

        let result = run(&manager, json!({"again": true}), ExecuteOptions::new("echo")).await;
        assert_eq!(result, Ok(json!({"again": true})), "{:?}", strategy);
        manager.kill();
    }
}
