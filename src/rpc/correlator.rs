//! Request/response correlation.
//!
//! The correlator owns the id counter and the table of callers waiting for a
//! response. It performs no I/O: the language client writes the envelopes it
//! hands out and feeds every decoded frame back through [`RequestCorrelator::dispatch`].

use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Mutex, MutexGuard, PoisonError};

use serde_json::Value;
use tokio::sync::oneshot;
use tracing::{debug, warn};

use crate::error::SessionError;
use crate::rpc::message::{JsonRpcMessage, JsonRpcNotification, JsonRpcRequest};

type ResponseSender = oneshot::Sender<Result<JsonRpcMessage, SessionError>>;

/// Receiving half handed to the caller of [`RequestCorrelator::request`].
pub type ResponseReceiver = oneshot::Receiver<Result<JsonRpcMessage, SessionError>>;

/// What [`RequestCorrelator::dispatch`] did with a message.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Dispatch {
    /// Response delivered to the waiting caller.
    Delivered(u64),
    /// Response whose id has no waiting caller (already answered, cancelled,
    /// or sent without a handler). Dropped.
    Unmatched(u64),
    /// Server notification. Logged and otherwise ignored.
    Notification(String),
    /// Server-to-client request. Logged and otherwise ignored.
    ServerRequest(String),
    /// Neither an id nor a method.
    Ignored,
}

#[derive(Debug, Default)]
struct PendingTable {
    waiting: HashMap<u64, ResponseSender>,
    /// Set by [`RequestCorrelator::reject_all`]; no new handlers after that.
    closed: Option<String>,
}

#[derive(Debug)]
pub struct RequestCorrelator {
    next_id: AtomicU64,
    pending: Mutex<PendingTable>,
}

impl Default for RequestCorrelator {
    fn default() -> Self {
        Self::new()
    }
}

impl RequestCorrelator {
    pub fn new() -> Self {
        RequestCorrelator {
            next_id: AtomicU64::new(1),
            pending: Mutex::new(PendingTable::default()),
        }
    }

    fn pending(&self) -> MutexGuard<'_, PendingTable> {
        self.pending.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Allocate the next request id.
    pub fn next_id(&self) -> u64 {
        self.next_id.fetch_add(1, Ordering::SeqCst)
    }

    /// Build a request and register a handler for its response.
    ///
    /// Fails with [`SessionError::Abandoned`] once [`RequestCorrelator::reject_all`]
    /// has run, since nothing would ever answer it.
    pub fn request(
        &self,
        method: &str,
        params: Value,
    ) -> Result<(JsonRpcRequest, ResponseReceiver), SessionError> {
        let mut pending = self.pending();
        if let Some(reason) = &pending.closed {
            return Err(SessionError::Abandoned(reason.clone()));
        }
        let id = self.next_id();
        let (tx, rx) = oneshot::channel();
        pending.waiting.insert(id, tx);
        Ok((JsonRpcRequest::new(method, params, id), rx))
    }

    /// Build a request whose response nobody waits for.
    ///
    /// The id is still consumed so ids stay unique; the eventual response
    /// dispatches as [`Dispatch::Unmatched`].
    pub fn request_without_handler(&self, method: &str, params: Value) -> JsonRpcRequest {
        JsonRpcRequest::new(method, params, self.next_id())
    }

    pub fn notification(method: &str, params: Value) -> JsonRpcNotification {
        JsonRpcNotification::new(method, params)
    }

    /// Route a decoded message.
    ///
    /// Responses never carry a `method`, so anything with a method is treated
    /// as server-originated even when it also has an id.
    pub fn dispatch(&self, message: JsonRpcMessage) -> Dispatch {
        if let Some(method) = message.method.clone() {
            return if message.id.is_some() {
                debug!("Ignoring server request: {}", method);
                Dispatch::ServerRequest(method)
            } else {
                debug!("Server notification: {}", method);
                Dispatch::Notification(method)
            };
        }

        let Some(id) = message.numeric_id() else {
            if message.id.is_some() {
                warn!("Dropping response with non-numeric id: {:?}", message.id);
            }
            return Dispatch::Ignored;
        };

        let handler = self.pending().waiting.remove(&id);
        match handler {
            Some(tx) => {
                if tx.send(Ok(message)).is_err() {
                    debug!("Caller for request {} went away before the response", id);
                }
                Dispatch::Delivered(id)
            }
            None => {
                debug!("Dropping response for unknown request {}", id);
                Dispatch::Unmatched(id)
            }
        }
    }

    /// Decode a raw payload and route it.
    pub fn dispatch_payload(&self, payload: &[u8]) -> Result<Dispatch, SessionError> {
        let message: JsonRpcMessage = serde_json::from_slice(payload)
            .map_err(|e| SessionError::ProtocolParse(format!("invalid JSON-RPC payload: {}", e)))?;
        Ok(self.dispatch(message))
    }

    /// Forget a pending request (after a timeout or failed write).
    pub fn cancel(&self, id: u64) -> bool {
        self.pending().waiting.remove(&id).is_some()
    }

    /// Reject every pending request with [`SessionError::Abandoned`] and
    /// refuse new ones from now on.
    ///
    /// Returns the number of callers rejected.
    pub fn reject_all(&self, reason: &str) -> usize {
        let drained: Vec<(u64, ResponseSender)> = {
            let mut pending = self.pending();
            pending.closed.get_or_insert_with(|| reason.to_string());
            pending.waiting.drain().collect()
        };
        let count = drained.len();
        for (id, tx) in drained {
            debug!("Rejecting pending request {}: {}", id, reason);
            let _ = tx.send(Err(SessionError::Abandoned(reason.to_string())));
        }
        count
    }

    pub fn pending_count(&self) -> usize {
        self.pending().waiting.len()
    }

    /// Whether [`RequestCorrelator::reject_all`] has run.
    pub fn is_closed(&self) -> bool {
        self.pending().closed.is_some()
    }
}
