//! Ridian Library
//!
//! Persistent R sessions for notebook-style editors:
//!
//! - `session` - one long-lived interpreter per document, created on first use
//! - `eval` - batch evaluation with sentinel-delimited output
//! - `lsp` - client for the R language server (completion, signature help)
//! - `framing` - Content-Length frames and completion sentinels over byte streams
//! - `rpc` - JSON-RPC envelopes and request/response correlation
//! - `artifacts` - where plots and widgets end up
//! - `config` - settings file and environment overrides
//! - `models` - result records serialized to callers
//!
//! # Evaluating Code
//!
//! ```ignore
//! use std::sync::Arc;
//! use ridian::artifacts::DirectoryStore;
//! use ridian::config::Settings;
//! use ridian::eval::{EvaluationRequest, Evaluator};
//! use ridian::session::SessionRegistry;
//!
//! let settings = Settings::load(None)?;
//! let store = Arc::new(DirectoryStore::new(settings.artifact_root()));
//! let evaluator = Evaluator::new(Arc::new(SessionRegistry::new(settings)), store);
//!
//! let result = evaluator
//!     .evaluate("notes/analysis.md", &EvaluationRequest::new("x <- 1; x + 1", "setup"))
//!     .await?;
//! assert_eq!(result.result, "[1] 2");
//! ```

pub mod artifacts;
pub mod config;
pub mod error;
pub mod eval;
pub mod framing;
pub mod lsp;
pub mod models;
pub mod rpc;
pub mod session;

pub use error::{Result, SessionError};
