//! Host side of the callback relay.
//!
//! A script asks for the caller's callback by sending `(request_id,
//! callback_id, args)`. The relay looks the request up, hands the callback a
//! [`Responder`] bound to that `callback_id`, and the responder routes the
//! reply back to whichever worker sent the request. The callback function
//! itself never crosses the boundary.

use std::fmt;
use std::panic::{AssertUnwindSafe, catch_unwind};
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};

use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::correlation::{CallbackId, CorrelationRegistry, PendingRequest, RequestId};

/// Caller-supplied callback invoked on behalf of a running script.
///
/// It receives the script's arguments and a [`Responder`]; it may answer
/// synchronously or keep the responder and answer later from another task.
pub type HostCallback = Arc<dyn Fn(Vec<Value>, Responder) + Send + Sync>;

/// Wrap a closure as a [`HostCallback`].
pub fn host_callback<F>(f: F) -> HostCallback
where
    F: Fn(Vec<Value>, Responder) + Send + Sync + 'static,
{
    Arc::new(f)
}

/// Reply to one callback invocation, as it crosses the boundary.
///
/// Errors travel as message text only.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CallbackReply {
    pub error: Option<String>,
    pub values: Vec<Value>,
}

impl CallbackReply {
    pub fn ok(values: Vec<Value>) -> Self {
        Self {
            error: None,
            values,
        }
    }

    pub fn err(message: impl Into<String>) -> Self {
        Self {
            error: Some(message.into()),
            values: Vec::new(),
        }
    }

    pub fn into_result(self) -> std::result::Result<Vec<Value>, String> {
        match self.error {
            Some(message) => Err(message),
            None => Ok(self.values),
        }
    }
}

/// A script's request to invoke the caller's callback.
#[derive(Debug, Clone)]
pub struct CallbackRequest {
    pub request_id: RequestId,
    pub callback_id: CallbackId,
    pub args: Vec<Value>,
}

/// Delivers a callback reply back to the worker that asked for it.
pub type ReplyRoute = Arc<dyn Fn(RequestId, CallbackId, CallbackReply) + Send + Sync>;

/// Answers exactly one callback invocation.
///
/// Clones share state: only the first `respond` across all clones is sent.
#[derive(Clone)]
pub struct Responder {
    inner: Arc<ResponderInner>,
}

struct ResponderInner {
    pending: Arc<PendingRequest>,
    callback_id: CallbackId,
    answered: AtomicBool,
    route: ReplyRoute,
}

impl Responder {
    fn new(pending: Arc<PendingRequest>, callback_id: CallbackId, route: ReplyRoute) -> Self {
        Self {
            inner: Arc::new(ResponderInner {
                pending,
                callback_id,
                answered: AtomicBool::new(false),
                route,
            }),
        }
    }

    pub fn request_id(&self) -> &RequestId {
        self.inner.pending.request_id()
    }

    pub fn callback_id(&self) -> &CallbackId {
        &self.inner.callback_id
    }

    /// Send the reply. Returns `false` if this invocation was already answered
    /// or its execution has finished in the meantime.
    pub fn respond<E: fmt::Display>(&self, result: std::result::Result<Vec<Value>, E>) -> bool {
        if self.inner.answered.swap(true, Ordering::AcqRel) {
            tracing::debug!(
                "Ignoring repeated response for callback {} of request {}",
                self.inner.callback_id,
                self.request_id()
            );
            return false;
        }
        if self.inner.pending.is_done() {
            tracing::debug!(
                "Dropping callback response for finished request {}",
                self.request_id()
            );
            return false;
        }

        let reply = match result {
            Ok(values) => CallbackReply::ok(values),
            Err(e) => CallbackReply::err(e.to_string()),
        };
        (self.inner.route)(
            self.request_id().clone(),
            self.inner.callback_id.clone(),
            reply,
        );
        true
    }

    pub fn ok(&self, values: Vec<Value>) -> bool {
        self.respond::<String>(Ok(values))
    }

    pub fn err(&self, message: impl fmt::Display) -> bool {
        self.respond(Err(message))
    }

    fn is_answered(&self) -> bool {
        self.inner.answered.load(Ordering::Acquire)
    }
}

impl fmt::Debug for Responder {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Responder")
            .field("request_id", self.request_id())
            .field("callback_id", &self.inner.callback_id)
            .field("answered", &self.is_answered())
            .finish()
    }
}

/// Routes callback requests from workers to the callbacks registered for them.
pub struct CallbackRelay {
    registry: Arc<CorrelationRegistry>,
}

impl CallbackRelay {
    pub fn new(registry: Arc<CorrelationRegistry>) -> Self {
        Self { registry }
    }

    /// Invoke the caller's callback for `request`.
    ///
    /// Returns `false` when the message was dropped because its request is
    /// unknown or already finished.
    pub fn dispatch(&self, request: CallbackRequest, route: ReplyRoute) -> bool {
        let Some(pending) = self.registry.lookup(&request.request_id) else {
            tracing::debug!(
                "Dropping callback for unknown request {}",
                request.request_id
            );
            return false;
        };
        if pending.is_done() {
            tracing::debug!(
                "Dropping callback for finished request {}",
                request.request_id
            );
            return false;
        }

        let responder = Responder::new(Arc::clone(&pending), request.callback_id, route);

        let Some(callback) = pending.callback().cloned() else {
            responder.err("No callback was provided for this execution");
            return true;
        };

        let handed_over = responder.clone();
        let outcome = catch_unwind(AssertUnwindSafe(|| callback(request.args, handed_over)));
        if outcome.is_err() {
            tracing::warn!("Callback for request {} panicked", request.request_id);
            responder.err("Callback panicked");
        }
        true
    }
}
