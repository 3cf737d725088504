//! Worker-threads backend through the public manager API.

use std::time::Duration;

use serde_json::{Value, json};
use warden_core::{
    ExecuteOptions, ExecutionError, HostHandle, ManagerConfig, ProtocolFault, ScriptFault, ScriptManager,
    ScriptRegistry, Strategy,
};

async fn echo(inputs: Value, _host: HostHandle) -> Result<Value, ScriptFault> {
    Ok(inputs)
}

async fn fail(_inputs: Value, _host: HostHandle) -> Result<Value, ScriptFault> {
    Err(ScriptFault::new("boom"))
}

async fn callback(inputs: Value, host: HostHandle) -> Result<Value, ScriptFault> {
    let reply = host.call(vec![inputs["arg"].clone()]).await?;
    Ok(json!({ "test": reply[0] }))
}

async fn never_finishes(_inputs: Value, _host: HostHandle) -> Result<Value, ScriptFault> {
    futures::future::pending::<()>().await;
    Ok(Value::Null)
}

async fn sleep(inputs: Value, _host: HostHandle) -> Result<Value, ScriptFault> {
    let ms = inputs["ms"].as_u64().unwrap_or(0);
    tokio::time::sleep(Duration::from_millis(ms)).await;
    Ok(inputs["value"].clone())
}

async fn identity(_inputs: Value, _host: HostHandle) -> Result<Value, ScriptFault> {
    Ok(json!(std::thread::current().name().unwrap_or("unnamed")))
}

/// Asks the host for the identity of whoever serves the nested call.
async fn nested(_inputs: Value, host: HostHandle) -> Result<Value, ScriptFault> {
    let inner = host.call(vec![]).await?;
    Ok(json!({
        "outer": std::thread::current().name().unwrap_or("unnamed"),
        "inner": inner[0],
    }))
}

fn scripts() -> ScriptRegistry {
    ScriptRegistry::new()
        .with("echo", echo)
        .with("fail", fail)
        .with("callback", callback)
        .with("never-finishes", never_finishes)
        .with("sleep", sleep)
        .with("identity", identity)
        .with("nested", nested)
}

async fn started(workers: usize) -> ScriptManager {
    let config = ManagerConfig::default()
        .with_strategy(Strategy::WorkerThreads)
        .with_workers(workers);
    let manager = ScriptManager::new(config, scripts());
    manager.start().await.unwrap();
    manager
}

#[tokio::test]
async fn test_echo_and_error() {
    let manager = started(2).await;

    let ok = manager
        .execute(json!({"foo": "foo"}), ExecuteOptions::new("echo"))
        .unwrap()
        .await;
    assert_eq!(ok, Ok(json!({"foo": "foo"})));

    let err = manager
        .execute(json!({}), ExecuteOptions::new("fail"))
        .unwrap()
        .await
        .unwrap_err();
    assert!(matches!(err, ExecutionError::Script { .. }));
    assert_eq!(err.message(), "boom");
    assert!(err.stack().unwrap().contains("fail"));

    manager.kill();
}

#[tokio::test]
async fn test_callback_roundtrip() {
    let manager = started(1).await;
    let options = ExecuteOptions::new("callback").with_callback(|args, responder| {
        responder.ok(vec![json!(format!("{}aaa", args[0].as_str().unwrap_or_default()))]);
    });

    let result = manager.execute(json!({"arg": "test"}), options).unwrap().await;
    assert_eq!(result, Ok(json!({"test": "testaaa"})));
    manager.kill();
}

#[tokio::test]
async fn test_callback_without_callback_fails_script() {
    let manager = started(1).await;
    let err = manager
        .execute(json!({"arg": 1}), ExecuteOptions::new("callback"))
        .unwrap()
        .await
        .unwrap_err();
    assert!(err.message().contains("No callback"));
    manager.kill();
}

#[tokio::test]
async fn test_timeout_aborts_only_its_own_request() {
    let manager = started(1).await;
    let reservation = manager.reserve_for_task("shared").unwrap();

    let slow = manager
        .execute(
            json!({}),
            ExecuteOptions::new("never-finishes")
                .with_task_id("shared")
                .with_timeout_millis(30),
        )
        .unwrap();
    let sibling = manager
        .execute(
            json!({"ms": 100, "value": "sibling"}),
            ExecuteOptions::new("sleep").with_task_id("shared"),
        )
        .unwrap();

    let (slow, sibling) = tokio::join!(slow, sibling);
    assert!(slow.unwrap_err().is_timeout());
    assert_eq!(sibling, Ok(json!("sibling")));

    reservation.release().unwrap();
    manager.kill();
}

#[tokio::test]
async fn test_request_timed_out_in_queue_is_never_run() {
    let manager = started(1).await;

    let busy = manager
        .execute(json!({"ms": 200, "value": "busy"}), ExecuteOptions::new("sleep"))
        .unwrap();
    // Waits behind `busy` and expires before the worker frees up.
    let queued = manager
        .execute(
            json!({}),
            ExecuteOptions::new("never-finishes").with_timeout_millis(50),
        )
        .unwrap();

    assert!(queued.await.unwrap_err().is_timeout());
    assert_eq!(busy.await, Ok(json!("busy")));

    let next = manager
        .execute(
            json!("next"),
            ExecuteOptions::new("echo").with_timeout_millis(2_000),
        )
        .unwrap()
        .await;
    assert_eq!(next, Ok(json!("next")));
    assert_eq!(manager.pending_requests(), 0);
    manager.kill();
}

#[tokio::test]
async fn test_nested_execution_reuses_reserved_worker() {
    // One worker: a nested execution could only ever run on the reserved one.
    let manager = started(1).await;
    let reservation = manager.reserve_for_task("job").unwrap();

    let nested_manager = manager.clone();
    let options = ExecuteOptions::new("nested")
        .with_task_id("job")
        .with_callback(move |_args, responder| {
            let manager = nested_manager.clone();
            tokio::spawn(async move {
                let inner = match manager.execute(json!({}), ExecuteOptions::new("identity").with_task_id("job")) {
                    Ok(execution) => execution.await.map(|value| vec![value]),
                    Err(fault) => Err(ExecutionError::transport(fault.to_string())),
                };
                responder.respond(inner);
            });
        });

    let result = tokio::time::timeout(
        Duration::from_secs(5),
        manager.execute(json!({}), options).unwrap(),
    )
    .await
    .expect("nested execution deadlocked")
    .unwrap();

    assert_eq!(result["outer"], result["inner"]);
    assert_eq!(result["outer"], json!("warden-worker-0"));

    reservation.release().unwrap();
    manager.kill();
}

#[tokio::test]
async fn test_reservation_misuse() {
    let manager = started(1).await;

    let reservation = manager.reserve_for_task("job").unwrap();
    assert_eq!(
        manager.reserve_for_task("job").unwrap_err(),
        ProtocolFault::AlreadyReserved("job".to_string())
    );

    manager
        .execute(json!(1), ExecuteOptions::new("echo").with_task_id("job"))
        .unwrap()
        .await
        .unwrap();
    assert_eq!(reservation.release(), Ok(()));
    assert_eq!(
        reservation.release(),
        Err(ProtocolFault::AlreadyReleased("job".to_string()))
    );

    assert_eq!(
        manager
            .execute(json!(1), ExecuteOptions::new("echo").with_task_id("job"))
            .unwrap_err(),
        ProtocolFault::ReservationNotFound("job".to_string())
    );
    manager.kill();
}

#[tokio::test]
async fn test_release_before_binding_is_reported() {
    let manager = started(1).await;
    let reservation = manager.reserve_for_task("idle").unwrap();
    assert_eq!(
        reservation.release(),
        Err(ProtocolFault::ReservationUnbound("idle".to_string()))
    );
    // The id is free again.
    manager.reserve_for_task("idle").unwrap();
    manager.kill();
}

#[tokio::test]
async fn test_unknown_task_id_is_rejected() {
    let manager = started(1).await;
    assert_eq!(
        manager
            .execute(json!(1), ExecuteOptions::new("echo").with_task_id("ghost"))
            .unwrap_err(),
        ProtocolFault::ReservationNotFound("ghost".to_string())
    );
    manager.kill();
}

#[tokio::test]
async fn test_released_worker_serves_others() {
    let manager = started(1).await;
    let reservation = manager.reserve_for_task("job").unwrap();
    manager
        .execute(json!(1), ExecuteOptions::new("echo").with_task_id("job"))
        .unwrap()
        .await
        .unwrap();
    reservation.release().unwrap();

    let result = tokio::time::timeout(
        Duration::from_secs(5),
        manager.execute(json!(2), ExecuteOptions::new("echo")).unwrap(),
    )
    .await
    .expect("worker was not returned to the pool");
    assert_eq!(result, Ok(json!(2)));
    manager.kill();
}

#[tokio::test]
async fn test_execute_before_start() {
    let manager = ScriptManager::new(
        ManagerConfig::default().with_strategy(Strategy::WorkerThreads),
        scripts(),
    );
    assert_eq!(
        manager.execute(json!({}), ExecuteOptions::new("echo")).unwrap_err(),
        ProtocolFault::NotStarted
    );
}
