//! Running one evaluation end to end.

use std::path::Path;
use std::sync::Arc;
use std::time::Duration;

use tracing::{debug, info, warn};
use url::Url;

use crate::artifacts::{ArtifactKind, ArtifactStore};
use crate::config::Settings;
use crate::error::{Result, SessionError};
use crate::eval::call::run_program;
use crate::eval::chunk::{file_safe_label, is_help_request, ChunkOptions, CodeChunk};
use crate::eval::demux::demultiplex;
use crate::eval::program::{compose_program, ProgramSpec, Sentinels};
use crate::models::EvaluationResult;
use crate::session::{RSession, SessionRegistry};

/// Help text used when the rendered help file cannot be read.
pub const HELP_PLACEHOLDER: &str = "Failed to retrieve help content.";

/// Code to evaluate plus how to present it.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct EvaluationRequest {
    pub code: String,
    /// Used in artifact file names.
    pub label: String,
    pub options: ChunkOptions,
    /// Render documentation to the per-call help file.
    pub help: bool,
}

impl EvaluationRequest {
    /// A request with default options. Help is detected from the code.
    pub fn new(code: impl Into<String>, label: impl Into<String>) -> Self {
        let code = code.into();
        EvaluationRequest {
            help: is_help_request(&code),
            code,
            label: label.into(),
            options: ChunkOptions::default(),
        }
    }

    pub fn with_options(mut self, options: ChunkOptions) -> Self {
        self.options = options;
        self
    }

    /// Evaluate a chunk's code with the chunk's own options and label.
    pub fn from_chunk(chunk: &CodeChunk) -> Self {
        Self::new(chunk.code.clone(), chunk.label_or_generated())
            .with_options(ChunkOptions::from_map(&chunk.options))
    }
}

/// Evaluates code in registry-managed sessions.
pub struct Evaluator {
    registry: Arc<SessionRegistry>,
    store: Arc<dyn ArtifactStore>,
    timeout: Option<Duration>,
    preview_chars: usize,
}

impl Evaluator {
    /// Timeout and preview length come from the registry's settings.
    pub fn new(registry: Arc<SessionRegistry>, store: Arc<dyn ArtifactStore>) -> Self {
        let settings: &Settings = registry.settings();
        let timeout = settings.eval_timeout();
        let preview_chars = settings.preview_chars;
        Evaluator {
            registry,
            store,
            timeout,
            preview_chars,
        }
    }

    pub fn registry(&self) -> &Arc<SessionRegistry> {
        &self.registry
    }

    /// Evaluate `request` in the session for `key`, starting it if needed.
    pub async fn evaluate(&self, key: &str, request: &EvaluationRequest) -> Result<EvaluationResult> {
        let session = self.registry.resolve(key).await?;
        evaluate_in_session(
            &session,
            request,
            self.store.as_ref(),
            self.timeout,
            self.preview_chars,
        )
        .await
    }
}

/// Evaluate `request` in an already running session.
///
/// Artifacts are copied into `store` before the per-call scratch directory
/// is removed. Fails only when the process is gone, the call times out, or
/// the interpreter wrote to stderr.
pub async fn evaluate_in_session(
    session: &RSession,
    request: &EvaluationRequest,
    store: &dyn ArtifactStore,
    timeout: Option<Duration>,
    preview_chars: usize,
) -> Result<EvaluationResult> {
    let scratch = tempfile::Builder::new().prefix("rplots-").tempdir()?;
    let help_file = scratch
        .path()
        .join(format!("help_{}.html", file_safe_label(&request.label)));
    let sentinels = Sentinels::generate();

    let program = compose_program(&ProgramSpec {
        code: &request.code,
        label: &request.label,
        options: request.options,
        help: request.help,
        scratch_dir: scratch.path(),
        help_file: &help_file,
        sentinels: &sentinels,
        preview_chars,
    });

    info!(
        session = %session.key(),
        label = %request.label,
        help = request.help,
        "Evaluating {} bytes of code",
        request.code.len()
    );
    let output = run_program(session, &program, &sentinels.completion, timeout).await?;

    let help_content = if request.help {
        match tokio::fs::read_to_string(&help_file).await {
            Ok(text) => text,
            Err(e) => {
                warn!("Failed to read help file {}: {}", help_file.display(), e);
                HELP_PLACEHOLDER.to_string()
            }
        }
    } else {
        String::new()
    };

    let parts = demultiplex(&output, &sentinels);

    let mut image_paths = Vec::with_capacity(parts.image_files.len());
    for name in &parts.image_files {
        image_paths.push(store_image(scratch.path(), name, store).await);
    }

    let mut widget_paths = Vec::with_capacity(parts.widget_files.len());
    for name in &parts.widget_files {
        widget_paths.push(store_widget(scratch.path(), name, store).await);
    }

    debug!(
        session = %session.key(),
        images = image_paths.len(),
        widgets = widget_paths.len(),
        variables = parts.environment.len(),
        "Evaluation finished"
    );

    if let Err(e) = scratch.close() {
        debug!("Failed to remove scratch directory: {}", e);
    }

    Ok(EvaluationResult {
        result: parts.result,
        image_paths,
        widget_paths,
        help_content,
        environment: parts.environment,
    })
}

/// Store a plot; on failure fall back to the bare file name.
async fn store_image(scratch: &Path, name: &str, store: &dyn ArtifactStore) -> String {
    let path = scratch.join(name);
    let stored = match tokio::fs::read(&path).await {
        Ok(bytes) => store.store(ArtifactKind::Image, name, &bytes),
        Err(source) => Err(SessionError::ArtifactIo { path, source }),
    };
    match stored {
        Ok(stored) => stored.reference,
        Err(e) => {
            warn!("Keeping unresolved image reference {}: {}", name, e);
            name.to_string()
        }
    }
}

/// Store a widget and return its `file://` URL; on failure fall back to the
/// bare file name.
async fn store_widget(scratch: &Path, name: &str, store: &dyn ArtifactStore) -> String {
    let path = scratch.join(name);
    let stored = match tokio::fs::read_to_string(&path).await {
        Ok(html) => store.store(ArtifactKind::Widget, name, html.as_bytes()),
        Err(source) => Err(SessionError::ArtifactIo { path, source }),
    };
    match stored {
        Ok(stored) => Url::from_file_path(&stored.path)
            .map(String::from)
            .unwrap_or(stored.reference),
        Err(e) => {
            warn!("Keeping unresolved widget reference {}: {}", name, e);
            name.to_string()
        }
    }
}
