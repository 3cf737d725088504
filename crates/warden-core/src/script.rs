//! Script-side API: what runs inside an isolated worker.
//!
//! Scripts are registered by module path in a [`ScriptRegistry`] compiled into
//! the worker. Each run gets its inputs and a [`HostHandle`] through which it
//! can invoke the caller's callback.

use std::fmt;
use std::future::Future;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};

use futures::future::BoxFuture;
use rustc_hash::FxHashMap;
use serde_json::Value;
use tokio::sync::oneshot;

use crate::correlation::{CallbackId, RequestId};
use crate::relay::CallbackReply;
use crate::sync::lock;

/// Error raised by a script. Crosses the boundary as message plus stack text.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ScriptFault {
    pub message: String,
    pub stack: Option<String>,
}

impl ScriptFault {
    pub fn new(message: impl Into<String>) -> Self {
        Self {
            message: message.into(),
            stack: None,
        }
    }

    pub fn with_stack(mut self, stack: impl Into<String>) -> Self {
        self.stack = Some(stack.into());
        self
    }
}

impl fmt::Display for ScriptFault {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.message)
    }
}

impl std::error::Error for ScriptFault {}

impl From<serde_json::Error> for ScriptFault {
    fn from(e: serde_json::Error) -> Self {
        Self::new(e.to_string())
    }
}

/// A unit of user code runnable inside a worker.
pub trait Script: Send + Sync + 'static {
    fn run(&self, inputs: Value, host: HostHandle) -> BoxFuture<'static, Result<Value, ScriptFault>>;
}

impl<F, Fut> Script for F
where
    F: Fn(Value, HostHandle) -> Fut + Send + Sync + 'static,
    Fut: Future<Output = Result<Value, ScriptFault>> + Send + 'static,
{
    fn run(&self, inputs: Value, host: HostHandle) -> BoxFuture<'static, Result<Value, ScriptFault>> {
        Box::pin(self(inputs, host))
    }
}

/// Scripts available to a worker, keyed by module path.
#[derive(Clone, Default)]
pub struct ScriptRegistry {
    scripts: FxHashMap<String, Arc<dyn Script>>,
}

impl ScriptRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn register(&mut self, module_path: impl Into<String>, script: impl Script) -> &mut Self {
        self.scripts.insert(module_path.into(), Arc::new(script));
        self
    }

    /// Builder form of [`register`](Self::register).
    pub fn with(mut self, module_path: impl Into<String>, script: impl Script) -> Self {
        self.register(module_path, script);
        self
    }

    pub fn get(&self, module_path: &str) -> Option<Arc<dyn Script>> {
        self.scripts.get(module_path).cloned()
    }

    pub fn contains(&self, module_path: &str) -> bool {
        self.scripts.contains_key(module_path)
    }

    pub fn len(&self) -> usize {
        self.scripts.len()
    }

    pub fn is_empty(&self) -> bool {
        self.scripts.is_empty()
    }
}

impl fmt::Debug for ScriptRegistry {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let mut names: Vec<_> = self.scripts.keys().collect();
        names.sort();
        f.debug_struct("ScriptRegistry").field("scripts", &names).finish()
    }
}

/// Transport used by a [`HostHandle`] to ship callback requests to the host.
pub trait CallbackSink: Send + Sync {
    /// Returns `false` if the host can no longer be reached.
    fn send_callback(&self, request_id: &RequestId, callback_id: &CallbackId, args: Vec<Value>) -> bool;
}

/// Callback invocations awaiting a reply from the host, inside one worker.
#[derive(Default)]
pub struct CallbackTable {
    waiting: Mutex<FxHashMap<CallbackId, (RequestId, oneshot::Sender<CallbackReply>)>>,
}

impl CallbackTable {
    pub fn new() -> Self {
        Self::default()
    }

    fn open(&self, request_id: &RequestId, callback_id: &CallbackId) -> oneshot::Receiver<CallbackReply> {
        let (tx, rx) = oneshot::channel();
        lock(&self.waiting).insert(callback_id.clone(), (request_id.clone(), tx));
        rx
    }

    fn cancel(&self, callback_id: &CallbackId) {
        lock(&self.waiting).remove(callback_id);
    }

    /// Hand a reply to the waiting invocation. Replies for unknown ids are
    /// dropped and reported as `false`.
    pub fn resolve(&self, callback_id: &CallbackId, reply: CallbackReply) -> bool {
        match lock(&self.waiting).remove(callback_id) {
            Some((_, tx)) => tx.send(reply).is_ok(),
            None => false,
        }
    }

    /// Abandon every invocation still waiting on behalf of `request_id`.
    pub fn close_request(&self, request_id: &RequestId) -> usize {
        let mut waiting = lock(&self.waiting);
        let before = waiting.len();
        waiting.retain(|_, (rid, _)| rid != request_id);
        before - waiting.len()
    }

    pub fn len(&self) -> usize {
        lock(&self.waiting).len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

/// A script's view of the host for one execution.
#[derive(Clone)]
pub struct HostHandle {
    request_id: RequestId,
    has_callback: bool,
    table: Arc<CallbackTable>,
    sink: Arc<dyn CallbackSink>,
    finished: Arc<AtomicBool>,
}

impl HostHandle {
    pub fn new(
        request_id: RequestId,
        has_callback: bool,
        table: Arc<CallbackTable>,
        sink: Arc<dyn CallbackSink>,
    ) -> Self {
        Self {
            request_id,
            has_callback,
            table,
            sink,
            finished: Arc::new(AtomicBool::new(false)),
        }
    }

    pub fn request_id(&self) -> &RequestId {
        &self.request_id
    }

    /// Whether the caller supplied a callback for this execution.
    pub fn is_available(&self) -> bool {
        self.has_callback
    }

    /// Invoke the caller's callback and wait for its reply.
    ///
    /// Several calls may be in flight at once; each gets its own reply. A call
    /// made after the script has finished is still delivered to the host,
    /// which drops it, and fails here immediately.
    pub async fn call(&self, args: Vec<Value>) -> Result<Vec<Value>, ScriptFault> {
        if !self.has_callback {
            return Err(ScriptFault::new("No callback was provided for this execution"));
        }

        let callback_id = CallbackId::new();

        if self.finished.load(Ordering::Acquire) {
            self.sink.send_callback(&self.request_id, &callback_id, args);
            return Err(ScriptFault::new("Execution already finished"));
        }

        let rx = self.table.open(&self.request_id, &callback_id);
        if !self.sink.send_callback(&self.request_id, &callback_id, args) {
            self.table.cancel(&callback_id);
            return Err(ScriptFault::new("Lost connection to the host"));
        }

        match rx.await {
            Ok(reply) => reply.into_result().map_err(ScriptFault::new),
            Err(_) => Err(ScriptFault::new("Execution already finished")),
        }
    }

    /// Mark the execution finished and abandon outstanding callback calls.
    pub(crate) fn finish(&self) {
        self.finished.store(true, Ordering::Release);
        self.table.close_request(&self.request_id);
    }
}

impl fmt::Debug for HostHandle {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("HostHandle")
            .field("request_id", &self.request_id)
            .field("has_callback", &self.has_callback)
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    /// Sink that records requests and lets the test answer them.
    #[derive(Default)]
    struct RecordingSink {
        sent: Mutex<Vec<(RequestId, CallbackId, Vec<Value>)>>,
        closed: AtomicBool,
    }

    impl CallbackSink for RecordingSink {
        fn send_callback(&self, request_id: &RequestId, callback_id: &CallbackId, args: Vec<Value>) -> bool {
            if self.closed.load(Ordering::SeqCst) {
                return false;
            }
            self.sent
                .lock()
                .unwrap()
                .push((request_id.clone(), callback_id.clone(), args));
            true
        }
    }

    fn handle(has_callback: bool) -> (HostHandle, Arc<CallbackTable>, Arc<RecordingSink>) {
        let table = Arc::new(CallbackTable::new());
        let sink = Arc::new(RecordingSink::default());
        let host = HostHandle::new(RequestId::new(), has_callback, Arc::clone(&table), sink.clone());
        (host, table, sink)
    }

    #[test]
    fn test_registry_lookup() {
        let registry = ScriptRegistry::new().with("echo", |inputs: Value, _host: HostHandle| async move {
            Ok::<_, ScriptFault>(inputs)
        });
        assert!(registry.contains("echo"));
        assert!(registry.get("missing").is_none());
        assert_eq!(registry.len(), 1);
    }

    #[tokio::test]
    async fn test_call_resolves_with_reply() {
        let (host, table, sink) = handle(true);

        let caller = tokio::spawn({
            let host = host.clone();
            async move { host.call(vec![json!("test")]).await }
        });

        // Wait for the request to reach the sink.
        let callback_id = loop {
            if let Some((_, cid, _)) = sink.sent.lock().unwrap().first().cloned() {
                break cid;
            }
            tokio::task::yield_now().await;
        };

        assert!(table.resolve(&callback_id, CallbackReply::ok(vec![json!("testaaa")])));
        assert_eq!(caller.await.unwrap().unwrap(), vec![json!("testaaa")]);
        assert!(table.is_empty());
    }

    #[tokio::test]
    async fn test_call_error_reply_becomes_fault() {
        let (host, table, sink) = handle(true);

        let caller = tokio::spawn({
            let host = host.clone();
            async move { host.call(vec![]).await }
        });
        let callback_id = loop {
            if let Some((_, cid, _)) = sink.sent.lock().unwrap().first().cloned() {
                break cid;
            }
            tokio::task::yield_now().await;
        };

        table.resolve(&callback_id, CallbackReply::err("callback failed"));
        let fault = caller.await.unwrap().unwrap_err();
        assert_eq!(fault.message, "callback failed");
    }

    #[tokio::test]
    async fn test_call_without_callback_fails() {
        let (host, _table, sink) = handle(false);
        assert!(host.call(vec![]).await.is_err());
        assert!(sink.sent.lock().unwrap().is_empty());
    }

    #[tokio::test]
    async fn test_call_after_finish_is_sent_and_fails() {
        let (host, table, sink) = handle(true);
        host.finish();

        assert!(host.call(vec![json!(1)]).await.is_err());
        assert_eq!(sink.sent.lock().unwrap().len(), 1);
        assert!(table.is_empty());
    }

    #[tokio::test]
    async fn test_finish_abandons_waiting_calls() {
        let (host, table, _sink) = handle(true);

        let caller = tokio::spawn({
            let host = host.clone();
            async move { host.call(vec![]).await }
        });
        while table.is_empty() {
            tokio::task::yield_now().await;
        }

        host.finish();
        assert!(caller.await.unwrap().is_err());
    }

    #[tokio::test]
    async fn test_closed_sink_fails_fast() {
        let (host, table, sink) = handle(true);
        sink.closed.store(true, Ordering::SeqCst);

        let fault = host.call(vec![]).await.unwrap_err();
        assert!(fault.message.contains("Lost connection"));
        assert!(table.is_empty());
    }
}
