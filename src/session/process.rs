//! One interpreter child process.
//!
//! stdout and stderr are pumped into channels by background tasks as soon as
//! the session exists. A caller that wants to talk to the interpreter takes a
//! [`SessionTurn`]; turns are granted in FIFO order, and whatever output is
//! still queued from an earlier turn can be discarded before writing.

use std::process::Stdio;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex, PoisonError};

use bytes::Bytes;
use chrono::{DateTime, Utc};
use futures_util::StreamExt;
use tokio::io::{AsyncRead, AsyncWrite, AsyncWriteExt};
use tokio::process::{Child, Command};
use tokio::sync::{mpsc, MutexGuard};
use tokio_util::codec::{BytesCodec, FramedRead};
use tracing::{debug, info, warn};

use crate::config::Settings;
use crate::error::{Result, SessionError};
use crate::eval::SESSION_PREAMBLE;

/// Something observed on the interpreter's output pipes.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum StreamEvent {
    Stdout(Bytes),
    Stderr(Bytes),
    /// stdout reached EOF; the process is gone.
    Closed,
}

struct SessionIo {
    stdin: Box<dyn AsyncWrite + Send + Unpin>,
    stdout: mpsc::UnboundedReceiver<Bytes>,
    stderr: mpsc::UnboundedReceiver<Bytes>,
    stderr_open: bool,
}

pub struct RSession {
    key: String,
    io: tokio::sync::Mutex<SessionIo>,
    child: Mutex<Option<Child>>,
    closed: Arc<AtomicBool>,
    started_at: DateTime<Utc>,
}

impl std::fmt::Debug for RSession {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("RSession")
            .field("key", &self.key)
            .field("pid", &self.pid())
            .field("closed", &self.is_closed())
            .field("started_at", &self.started_at)
            .finish()
    }
}

/// Forward chunks from `reader` into a channel until EOF.
fn pump<R>(
    key: String,
    stream: &'static str,
    reader: R,
    closed: Option<Arc<AtomicBool>>,
) -> mpsc::UnboundedReceiver<Bytes>
where
    R: AsyncRead + Send + Unpin + 'static,
{
    let (tx, rx) = mpsc::unbounded_channel();
    tokio::spawn(async move {
        let mut framed = FramedRead::new(reader, BytesCodec::new());
        while let Some(chunk) = framed.next().await {
            match chunk {
                Ok(bytes) => {
                    if tx.send(bytes.freeze()).is_err() {
                        break;
                    }
                }
                Err(e) => {
                    warn!(session = %key, "Failed to read interpreter {}: {}", stream, e);
                    break;
                }
            }
        }
        if let Some(flag) = closed {
            flag.store(true, Ordering::SeqCst);
        }
        debug!(session = %key, "Interpreter {} closed", stream);
    });
    rx
}

impl RSession {
    /// Start the configured interpreter and write the session preamble.
    ///
    /// A missing executable is reported as
    /// [`SessionError::ProcessUnavailable`] without spawning anything.
    pub async fn spawn(key: &str, settings: &Settings) -> Result<Self> {
        let executable = settings.executable();
        if !executable.exists() {
            return Err(SessionError::unavailable(&executable, "executable not found"));
        }

        let mut command = Command::new(&executable);
        command
            .args(&settings.interpreter_args)
            .stdin(Stdio::piped())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .kill_on_drop(true);
        settings.configure_command(&mut command);

        let mut child = command
            .spawn()
            .map_err(|e| SessionError::unavailable(&executable, e))?;
        let (Some(stdin), Some(stdout), Some(stderr)) =
            (child.stdin.take(), child.stdout.take(), child.stderr.take())
        else {
            return Err(SessionError::unavailable(&executable, "stdio not captured"));
        };

        info!(
            session = %key,
            pid = ?child.id(),
            "Started interpreter {}",
            executable.display()
        );

        let session = Self::from_io(key, stdin, stdout, stderr, Some(child));
        session.write_preamble().await?;
        Ok(session)
    }

    /// Wrap already-connected pipes.
    ///
    /// `child`, when given, is killed by [`RSession::kill`] and on drop.
    /// Must be called from within a Tokio runtime.
    pub fn from_io<W, R, E>(
        key: &str,
        stdin: W,
        stdout: R,
        stderr: E,
        child: Option<Child>,
    ) -> Self
    where
        W: AsyncWrite + Send + Unpin + 'static,
        R: AsyncRead + Send + Unpin + 'static,
        E: AsyncRead + Send + Unpin + 'static,
    {
        let closed = Arc::new(AtomicBool::new(false));
        let stdout = pump(key.to_string(), "stdout", stdout, Some(Arc::clone(&closed)));
        let stderr = pump(key.to_string(), "stderr", stderr, None);

        RSession {
            key: key.to_string(),
            io: tokio::sync::Mutex::new(SessionIo {
                stdin: Box::new(stdin),
                stdout,
                stderr,
                stderr_open: true,
            }),
            child: Mutex::new(child),
            closed,
            started_at: Utc::now(),
        }
    }

    pub async fn write_preamble(&self) -> Result<()> {
        let mut turn = self.begin_turn().await;
        turn.write(SESSION_PREAMBLE.as_bytes()).await?;
        debug!(session = %self.key, "Wrote session preamble");
        Ok(())
    }

    /// Wait for exclusive use of the session. Waiters are served in order.
    pub async fn begin_turn(&self) -> SessionTurn<'_> {
        SessionTurn {
            key: &self.key,
            io: self.io.lock().await,
        }
    }

    pub fn key(&self) -> &str {
        &self.key
    }

    pub fn started_at(&self) -> DateTime<Utc> {
        self.started_at
    }

    pub fn pid(&self) -> Option<u32> {
        self.child
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .as_ref()
            .and_then(Child::id)
    }

    /// Whether the process's stdout has closed.
    pub fn is_closed(&self) -> bool {
        self.closed.load(Ordering::SeqCst)
    }

    /// Terminate the child. Returns `false` if there was none to kill.
    ///
    /// Any call in progress observes [`StreamEvent::Closed`] once the pipes
    /// drain.
    pub fn kill(&self) -> bool {
        let child = self
            .child
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .take();
        match child {
            Some(mut child) => {
                if let Err(e) = child.start_kill() {
                    warn!(session = %self.key, "Failed to kill interpreter: {}", e);
                }
                info!(session = %self.key, "Killed interpreter");
                true
            }
            None => false,
        }
    }
}

/// Exclusive access to a session's pipes.
pub struct SessionTurn<'a> {
    key: &'a str,
    io: MutexGuard<'a, SessionIo>,
}

impl SessionTurn<'_> {
    /// Write and flush. A closed pipe is reported as [`SessionError::ProcessExited`].
    pub async fn write(&mut self, data: &[u8]) -> Result<()> {
        let stdin = &mut self.io.stdin;
        let written = async {
            stdin.write_all(data).await?;
            stdin.flush().await
        }
        .await;
        written.map_err(|e| match e.kind() {
            std::io::ErrorKind::BrokenPipe => SessionError::ProcessExited,
            _ => SessionError::Io(e),
        })
    }

    /// Drop output that arrived while nobody was listening.
    ///
    /// Returns the number of bytes discarded.
    pub fn discard_stale(&mut self) -> usize {
        let mut discarded = 0;
        while let Ok(chunk) = self.io.stdout.try_recv() {
            discarded += chunk.len();
        }
        while let Ok(chunk) = self.io.stderr.try_recv() {
            discarded += chunk.len();
        }
        if discarded > 0 {
            debug!(session = %self.key, "Discarded {} bytes of stale output", discarded);
        }
        discarded
    }

    /// Next chunk from either pipe. stderr is preferred when both are ready.
    pub async fn next_event(&mut self) -> StreamEvent {
        loop {
            let io = &mut *self.io;
            tokio::select! {
                biased;
                chunk = io.stderr.recv(), if io.stderr_open => match chunk {
                    Some(bytes) => return StreamEvent::Stderr(bytes),
                    None => io.stderr_open = false,
                },
                chunk = io.stdout.recv() => {
                    return match chunk {
                        Some(bytes) => StreamEvent::Stdout(bytes),
                        None => StreamEvent::Closed,
                    };
                }
            }
        }
    }

    /// stderr already queued, without waiting.
    pub fn try_stderr(&mut self) -> Option<Bytes> {
        self.io.stderr.try_recv().ok()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tokio::io::{duplex, AsyncReadExt};
    use tokio::time::{timeout, Duration};

    const TEST_TIMEOUT: Duration = Duration::from_secs(5);

    #[tokio::test]
    async fn test_spawn_missing_executable_is_unavailable() {
        let settings = Settings {
            executable_path: "/nonexistent/bin/R".to_string(),
            ..Settings::default()
        };
        let err = RSession::spawn("doc.md", &settings).await.unwrap_err();
        assert!(matches!(err, SessionError::ProcessUnavailable { .. }));
    }

    #[tokio::test]
    async fn test_turn_reads_both_streams() {
        let (stdin, mut stdin_peer) = duplex(1024);
        let (mut stdout_peer, stdout) = duplex(1024);
        let (mut stderr_peer, stderr) = duplex(1024);
        let session = RSession::from_io("doc.md", stdin, stdout, stderr, None);

        let mut turn = session.begin_turn().await;
        turn.write(b"1 + 1\n").await.unwrap();
        let mut received = [0u8; 6];
        stdin_peer.read_exact(&mut received).await.unwrap();
        assert_eq!(&received, b"1 + 1\n");

        stderr_peer.write_all(b"warn").await.unwrap();
        let event = timeout(TEST_TIMEOUT, turn.next_event()).await.unwrap();
        assert_eq!(event, StreamEvent::Stderr(Bytes::from_static(b"warn")));

        stdout_peer.write_all(b"[1] 2\n").await.unwrap();
        let event = timeout(TEST_TIMEOUT, turn.next_event()).await.unwrap();
        assert_eq!(event, StreamEvent::Stdout(Bytes::from_static(b"[1] 2\n")));

        drop(stderr_peer);
        drop(stdout_peer);
        let event = timeout(TEST_TIMEOUT, turn.next_event()).await.unwrap();
        assert_eq!(event, StreamEvent::Closed);
        drop(turn);

        assert!(session.is_closed());
    }

    #[tokio::test]
    async fn test_discard_stale_output() {
        let (stdin, _stdin_peer) = duplex(1024);
        let (mut stdout_peer, stdout) = duplex(1024);
        let (_stderr_peer, stderr) = duplex(1024);
        let session = RSession::from_io("doc.md", stdin, stdout, stderr, None);

        stdout_peer.write_all(b"leftover").await.unwrap();
        // Let the pump task forward the chunk.
        tokio::time::sleep(Duration::from_millis(50)).await;

        let mut turn = session.begin_turn().await;
        assert_eq!(turn.discard_stale(), 8);
        assert_eq!(turn.discard_stale(), 0);
    }

    #[tokio::test]
    async fn test_kill_without_child() {
        let (stdin, _a) = duplex(64);
        let (_b, stdout) = duplex(64);
        let (_c, stderr) = duplex(64);
        let session = RSession::from_io("doc.md", stdin, stdout, stderr, None);
        assert!(!session.kill());
        assert_eq!(session.pid(), None);
    }
}
