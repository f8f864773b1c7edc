//! Long-lived interpreter processes.
//!
//! - [`RSession`] - one interpreter child, its pipes, and a FIFO turn lock
//! - [`SessionRegistry`] - sessions keyed by document, created on first use
//!
//! # Lifecycle
//!
//! ```text
//! resolve(key) ──► spawn + preamble ──► evaluate … evaluate ──► kill / kill_all
//!      ▲                                                │
//!      └──────── output closed (process exited) ◄───────┘
//! ```
//!
//! A session is never recreated while its process is alive, so variables
//! defined by one evaluation are visible to the next one under the same key.

mod process;
mod registry;

pub use process::{RSession, SessionTurn, StreamEvent};
pub use registry::SessionRegistry;
