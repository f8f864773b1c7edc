//! JSON-RPC 2.0 plumbing for the language session.
//!
//! - [`message`] - request, notification, and incoming-message envelopes
//! - [`correlator`] - id allocation and response routing
//!
//! Requests sent through a [`RequestCorrelator`] receive monotonically
//! increasing numeric ids starting at 1. Responses are routed back to the
//! waiting caller by id, in whatever order the server produces them.

mod correlator;
mod message;

pub use correlator::{Dispatch, RequestCorrelator, ResponseReceiver};
pub use message::{JsonRpcError, JsonRpcMessage, JsonRpcNotification, JsonRpcRequest};
