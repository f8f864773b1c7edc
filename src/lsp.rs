//! Client for the R language server.
//!
//! Talks JSON-RPC over the server's stdio using Content-Length framing.
//! Responses are matched to requests by id through a [`RequestCorrelator`],
//! so any number of completion or signature-help requests may be in flight
//! at once. Chunk text is shown to the server as [`VirtualDocument`]s.

use std::path::{Path, PathBuf};
use std::process::Stdio;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex, PoisonError};
use std::time::Duration;

use futures_util::StreamExt;
use serde::{Deserialize, Serialize};
use serde_json::{json, Value};
use tokio::io::{AsyncRead, AsyncWrite, AsyncWriteExt};
use tokio::process::{Child, Command};
use tokio::sync::watch;
use tokio::task::JoinHandle;
use tokio_util::codec::FramedRead;
use tracing::{debug, info, warn};
use url::Url;

use crate::config::Settings;
use crate::error::{Result, SessionError};
use crate::framing::{encode_frame, ContentLengthCodec};
use crate::models::{CompletionCandidate, Position, SignatureInfo};
use crate::rpc::{Dispatch, RequestCorrelator};

type SharedWriter = Arc<tokio::sync::Mutex<Box<dyn AsyncWrite + Send + Unpin>>>;

// =============================================================================
// Helper Functions
// =============================================================================

/// Serialize `message` and write it as one frame.
async fn write_message<T: Serialize>(writer: &SharedWriter, message: &T) -> Result<()> {
    let body = serde_json::to_string(message)
        .map_err(|e| SessionError::ProtocolParse(format!("failed to encode message: {}", e)))?;
    let frame = encode_frame(&body);

    let mut writer = writer.lock().await;
    let written = async {
        writer.write_all(&frame).await?;
        writer.flush().await
    }
    .await;
    written.map_err(|e| match e.kind() {
        std::io::ErrorKind::BrokenPipe => SessionError::ProcessExited,
        _ => SessionError::Io(e),
    })
}

/// Convert a file path to a file:// URI with proper percent-encoding.
///
/// Relative paths are resolved against the current directory first.
pub fn path_to_uri(path: &Path) -> String {
    let abs_path = if path.is_absolute() {
        path.to_path_buf()
    } else {
        std::env::current_dir()
            .map(|dir| dir.join(path))
            .unwrap_or_else(|_| path.to_path_buf())
    };

    match Url::from_file_path(&abs_path) {
        Ok(url) => url.to_string(),
        Err(_) => format!(
            "file://{}",
            abs_path.to_string_lossy().replace('%', "%25").replace(' ', "%20")
        ),
    }
}

// =============================================================================
// Wire Shapes
// =============================================================================

/// `documentation` is either a plain string or `MarkupContent`.
#[derive(Debug, Deserialize)]
#[serde(untagged)]
enum Documentation {
    Plain(String),
    Markup { value: String },
}

impl Documentation {
    fn into_text(self) -> String {
        match self {
            Documentation::Plain(text) => text,
            Documentation::Markup { value } => value,
        }
    }
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct TextEdit {
    new_text: String,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct CompletionItem {
    label: String,
    #[serde(default)]
    detail: Option<String>,
    #[serde(default)]
    documentation: Option<Documentation>,
    #[serde(default)]
    insert_text: Option<String>,
    #[serde(default)]
    text_edit: Option<TextEdit>,
}

impl From<CompletionItem> for CompletionCandidate {
    /// Insertion text falls back `textEdit.newText`, then `insertText`, then
    /// the label.
    fn from(item: CompletionItem) -> Self {
        let insert_text = item
            .text_edit
            .map(|edit| edit.new_text)
            .or(item.insert_text)
            .unwrap_or_else(|| item.label.clone());
        CompletionCandidate {
            label: item.label,
            insert_text,
            detail: item.detail.unwrap_or_default(),
            documentation: item.documentation.map(Documentation::into_text),
        }
    }
}

/// A completion result is an item array or a `CompletionList`.
#[derive(Debug, Deserialize)]
#[serde(untagged)]
enum CompletionResponse {
    Items(Vec<CompletionItem>),
    List { items: Vec<CompletionItem> },
}

#[derive(Debug, Deserialize)]
struct SignatureInformation {
    label: String,
    #[serde(default)]
    documentation: Option<Documentation>,
}

#[derive(Debug, Deserialize)]
struct SignatureHelp {
    #[serde(default)]
    signatures: Vec<SignatureInformation>,
}

/// Map a raw `textDocument/completion` result.
pub fn completion_candidates(result: Value) -> Result<Vec<CompletionCandidate>> {
    let response: Option<CompletionResponse> = serde_json::from_value(result)
        .map_err(|e| SessionError::ProtocolParse(format!("invalid completion result: {}", e)))?;
    let items = match response {
        Some(CompletionResponse::Items(items)) | Some(CompletionResponse::List { items }) => items,
        None => Vec::new(),
    };
    Ok(items.into_iter().map(CompletionCandidate::from).collect())
}

/// Map a raw `textDocument/signatureHelp` result.
pub fn signature_infos(result: Value) -> Result<Vec<SignatureInfo>> {
    let help: Option<SignatureHelp> = serde_json::from_value(result).map_err(|e| {
        SessionError::ProtocolParse(format!("invalid signature help result: {}", e))
    })?;
    Ok(help
        .map(|help| help.signatures)
        .unwrap_or_default()
        .into_iter()
        .map(|sig| SignatureInfo {
            label: sig.label,
            documentation: sig.documentation.map(Documentation::into_text),
        })
        .collect())
}

// =============================================================================
// Language Client
// =============================================================================

#[derive(Debug, Clone, PartialEq, Eq)]
enum Handshake {
    Pending,
    Ready,
    Failed(String),
}

/// Connection to a running language server.
///
/// # Teardown
/// [`LanguageClient::stop`] kills the server and rejects every pending
/// request with [`SessionError::Abandoned`]. The same happens when the
/// server's output closes on its own. Dropping the client stops it.
pub struct LanguageClient {
    writer: SharedWriter,
    correlator: Arc<RequestCorrelator>,
    child: Mutex<Option<Child>>,
    reader: Mutex<Option<JoinHandle<()>>>,
    handshake: watch::Receiver<Handshake>,
    request_timeout: Option<Duration>,
}

impl std::fmt::Debug for LanguageClient {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("LanguageClient")
            .field("pending", &self.correlator.pending_count())
            .field("handshake", &*self.handshake.borrow())
            .field("request_timeout", &self.request_timeout)
            .finish()
    }
}

impl LanguageClient {
    /// Spawn the language server and begin the initialize handshake.
    pub async fn start(settings: &Settings) -> Result<Self> {
        let executable = settings.executable();
        if !executable.exists() {
            return Err(SessionError::unavailable(&executable, "executable not found"));
        }

        let mut command = Command::new(&executable);
        command
            .args(&settings.language_server_args)
            .stdin(Stdio::piped())
            .stdout(Stdio::piped())
            .stderr(Stdio::null())
            .kill_on_drop(true);
        settings.configure_command(&mut command);

        let mut child = command
            .spawn()
            .map_err(|e| SessionError::unavailable(&executable, e))?;
        let (Some(stdin), Some(stdout)) = (child.stdin.take(), child.stdout.take()) else {
            return Err(SessionError::unavailable(&executable, "stdio not captured"));
        };

        info!(pid = ?child.id(), "Started language server {}", executable.display());
        Self::connect(stdout, stdin, Some(child), settings.request_timeout()).await
    }

    /// Drive a server over already-connected streams.
    ///
    /// Spawns the read loop and sends `initialize`. The `initialized`
    /// notification follows the response; [`LanguageClient::wait_ready`]
    /// resolves once it has been sent.
    pub async fn connect<R, W>(
        reader: R,
        writer: W,
        child: Option<Child>,
        request_timeout: Option<Duration>,
    ) -> Result<Self>
    where
        R: AsyncRead + Send + Unpin + 'static,
        W: AsyncWrite + Send + Unpin + 'static,
    {
        let writer: SharedWriter = Arc::new(tokio::sync::Mutex::new(Box::new(writer)));
        let correlator = Arc::new(RequestCorrelator::new());
        let read_loop = tokio::spawn(Self::read_loop(reader, Arc::clone(&correlator)));
        let (handshake_tx, handshake_rx) = watch::channel(Handshake::Pending);

        let client = LanguageClient {
            writer: Arc::clone(&writer),
            correlator: Arc::clone(&correlator),
            child: Mutex::new(child),
            reader: Mutex::new(Some(read_loop)),
            handshake: handshake_rx,
            request_timeout,
        };

        let (request, response) = correlator.request(
            "initialize",
            json!({
                "processId": std::process::id(),
                "rootUri": null,
                "capabilities": {}
            }),
        )?;
        if let Err(e) = write_message(&writer, &request).await {
            correlator.cancel(request.id);
            return Err(e);
        }

        tokio::spawn(async move {
            let state = match response.await {
                Ok(Ok(_)) => {
                    let initialized = RequestCorrelator::notification("initialized", json!({}));
                    match write_message(&writer, &initialized).await {
                        Ok(()) => Handshake::Ready,
                        Err(e) => Handshake::Failed(e.to_string()),
                    }
                }
                Ok(Err(e)) => Handshake::Failed(e.to_string()),
                Err(_) => Handshake::Failed("initialize response dropped".to_string()),
            };
            match &state {
                Handshake::Ready => debug!("Language server initialized"),
                other => warn!("Language server handshake failed: {:?}", other),
            }
            let _ = handshake_tx.send(state);
        });

        Ok(client)
    }

    /// Decode frames until EOF, then reject whatever is still pending.
    async fn read_loop<R>(reader: R, correlator: Arc<RequestCorrelator>)
    where
        R: AsyncRead + Send + Unpin + 'static,
    {
        let mut frames = FramedRead::new(reader, ContentLengthCodec::new());
        while let Some(frame) = frames.next().await {
            match frame {
                Ok(frame) => match correlator.dispatch_payload(&frame.body) {
                    Ok(Dispatch::Delivered(id)) => debug!(id, "Response delivered"),
                    Ok(_) => {}
                    Err(e) => warn!("Dropping frame: {}", e),
                },
                Err(e) => {
                    warn!("Language server stream failed: {}", e);
                    break;
                }
            }
        }
        let rejected = correlator.reject_all("language server output closed");
        debug!(rejected, "Language server read loop finished");
    }

    /// Wait for the initialize handshake to finish.
    pub async fn wait_ready(&self) -> Result<()> {
        let mut handshake = self.handshake.clone();
        let state = handshake
            .wait_for(|state| *state != Handshake::Pending)
            .await
            .map(|state| (*state).clone())
            .map_err(|_| SessionError::Abandoned("handshake task ended".to_string()))?;
        match state {
            Handshake::Failed(reason) => Err(SessionError::Abandoned(reason)),
            _ => Ok(()),
        }
    }

    /// Send a request and wait for its result.
    pub async fn request(&self, method: &str, params: Value) -> Result<Value> {
        let (request, response) = self.correlator.request(method, params)?;
        let id = request.id;
        debug!(id, method, "Sending request");
        if let Err(e) = write_message(&self.writer, &request).await {
            self.correlator.cancel(id);
            return Err(e);
        }

        let received = match self.request_timeout {
            Some(limit) => match tokio::time::timeout(limit, response).await {
                Ok(received) => received,
                Err(_) => {
                    self.correlator.cancel(id);
                    return Err(SessionError::Timeout(limit));
                }
            },
            None => response.await,
        };
        let message = received
            .map_err(|_| SessionError::Abandoned("response channel closed".to_string()))??;
        message.into_result()
    }

    /// Send a notification.
    pub async fn notify(&self, method: &str, params: Value) -> Result<()> {
        debug!(method, "Sending notification");
        write_message(&self.writer, &RequestCorrelator::notification(method, params)).await
    }

    /// Announce a document's full text.
    pub async fn did_open(&self, uri: &str, text: &str) -> Result<()> {
        self.notify(
            "textDocument/didOpen",
            json!({
                "textDocument": {
                    "uri": uri,
                    "languageId": "r",
                    "version": 1,
                    "text": text
                }
            }),
        )
        .await
    }

    pub async fn completion(&self, uri: &str, position: Position) -> Result<Vec<CompletionCandidate>> {
        let result = self
            .request(
                "textDocument/completion",
                json!({
                    "textDocument": { "uri": uri },
                    "position": position,
                    "context": { "triggerKind": 1 }
                }),
            )
            .await?;
        completion_candidates(result)
    }

    pub async fn signature_help(&self, uri: &str, position: Position) -> Result<Vec<SignatureInfo>> {
        let result = self
            .request(
                "textDocument/signatureHelp",
                json!({
                    "textDocument": { "uri": uri },
                    "position": position
                }),
            )
            .await?;
        signature_infos(result)
    }

    /// Ask the server to exit, then stop it.
    pub async fn shutdown(&self) -> usize {
        let shutdown = self.correlator.request_without_handler("shutdown", Value::Null);
        if write_message(&self.writer, &shutdown).await.is_ok() {
            let _ = self.notify("exit", Value::Null).await;
        }
        self.stop()
    }

    /// Kill the server and reject every pending request.
    ///
    /// Returns the number of requests rejected.
    pub fn stop(&self) -> usize {
        if let Some(mut child) = self
            .child
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .take()
        {
            if let Err(e) = child.start_kill() {
                warn!("Failed to kill language server: {}", e);
            }
        }
        if let Some(reader) = self
            .reader
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .take()
        {
            reader.abort();
        }
        let rejected = self.correlator.reject_all("language server stopped");
        info!(rejected, "Language server stopped");
        rejected
    }

    pub fn pending_requests(&self) -> usize {
        self.correlator.pending_count()
    }
}

impl Drop for LanguageClient {
    fn drop(&mut self) {
        let running = self
            .reader
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .is_some();
        if running {
            self.stop();
        }
    }
}

// =============================================================================
// Virtual Documents
// =============================================================================

static DOCUMENT_COUNTER: AtomicU64 = AtomicU64::new(0);

/// Chunk text written to a temporary `.r` file so the server can address it.
///
/// The file is removed on drop.
#[derive(Debug)]
pub struct VirtualDocument {
    path: PathBuf,
    uri: String,
}

impl VirtualDocument {
    pub fn create(text: &str) -> Result<Self> {
        Self::create_in(&std::env::temp_dir(), text)
    }

    pub fn create_in(dir: &Path, text: &str) -> Result<Self> {
        let n = DOCUMENT_COUNTER.fetch_add(1, Ordering::Relaxed);
        let path = dir.join(format!(
            "ridian-virtual-document-{}-{}.r",
            std::process::id(),
            n
        ));
        std::fs::write(&path, text).map_err(|source| SessionError::ArtifactIo {
            path: path.clone(),
            source,
        })?;
        let uri = path_to_uri(&path);
        Ok(VirtualDocument { path, uri })
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    pub fn uri(&self) -> &str {
        &self.uri
    }
}

impl Drop for VirtualDocument {
    fn drop(&mut self) {
        if let Err(e) = std::fs::remove_file(&self.path) {
            debug!("Failed to remove {}: {}", self.path.display(), e);
        }
    }
}
