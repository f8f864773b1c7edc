//! Per-call state for a batch evaluation.

use std::time::Duration;

use tracing::debug;

use crate::error::{Result, SessionError};
use crate::framing::SentinelScanner;
use crate::session::{RSession, StreamEvent};

/// Where a call is in its life.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CallPhase {
    /// Program not yet written.
    Idle,
    /// Program written, waiting for the completion sentinel.
    Accumulating,
    /// Completion sentinel seen; output ready to parse.
    SentinelFound,
    /// Output handed off (or the call failed).
    Parsed,
}

/// Accumulates one call's stdout and stderr.
#[derive(Debug)]
pub struct EvaluationCall {
    phase: CallPhase,
    stdout: SentinelScanner,
    stderr: Vec<u8>,
}

impl EvaluationCall {
    pub fn new(completion_sentinel: &str) -> Self {
        EvaluationCall {
            phase: CallPhase::Idle,
            stdout: SentinelScanner::new(completion_sentinel),
            stderr: Vec::new(),
        }
    }

    pub fn phase(&self) -> CallPhase {
        self.phase
    }

    pub fn mark_sent(&mut self) {
        if self.phase == CallPhase::Idle {
            self.phase = CallPhase::Accumulating;
        }
    }

    pub fn on_stdout(&mut self, chunk: &[u8]) -> CallPhase {
        if self.phase == CallPhase::Accumulating && self.stdout.push(chunk) {
            self.phase = CallPhase::SentinelFound;
        }
        self.phase
    }

    pub fn on_stderr(&mut self, chunk: &[u8]) {
        if matches!(self.phase, CallPhase::Accumulating | CallPhase::SentinelFound) {
            self.stderr.extend_from_slice(chunk);
        }
    }

    /// Finish a call whose sentinel has been seen.
    ///
    /// Returns the stdout text preceding the sentinel, or
    /// [`SessionError::Evaluation`] with the trimmed stderr text when the
    /// interpreter wrote anything there.
    pub fn finish(&mut self) -> Result<String> {
        if self.phase != CallPhase::SentinelFound {
            return Err(SessionError::ProtocolParse(format!(
                "cannot finish a call in phase {:?}",
                self.phase
            )));
        }
        self.phase = CallPhase::Parsed;

        let stderr = String::from_utf8_lossy(&self.stderr).trim().to_string();
        if !stderr.is_empty() {
            return Err(SessionError::Evaluation(stderr));
        }
        self.stdout
            .take_before_sentinel()
            .ok_or_else(|| SessionError::ProtocolParse("sentinel output missing".to_string()))
    }
}

/// Run `program` in `session` and collect stdout up to `completion_sentinel`.
///
/// Waits for the session's turn, drops any stale output, writes the program,
/// and reads both pipes until the sentinel arrives. Without a timeout this
/// waits as long as the interpreter takes.
pub async fn run_program(
    session: &RSession,
    program: &str,
    completion_sentinel: &str,
    timeout: Option<Duration>,
) -> Result<String> {
    let mut turn = session.begin_turn().await;
    turn.discard_stale();

    let mut call = EvaluationCall::new(completion_sentinel);
    let mut payload = String::with_capacity(program.len() + 1);
    payload.push_str(program);
    payload.push('\n');
    turn.write(payload.as_bytes()).await?;
    call.mark_sent();
    debug!(session = %session.key(), "Program written ({} bytes)", payload.len());

    let drive = async {
        loop {
            match turn.next_event().await {
                StreamEvent::Stdout(chunk) => {
                    if call.on_stdout(&chunk) == CallPhase::SentinelFound {
                        while let Some(late) = turn.try_stderr() {
                            call.on_stderr(&late);
                        }
                        return call.finish();
                    }
                }
                StreamEvent::Stderr(chunk) => call.on_stderr(&chunk),
                StreamEvent::Closed => return Err(SessionError::ProcessExited),
            }
        }
    };

    match timeout {
        Some(limit) => tokio::time::timeout(limit, drive)
            .await
            .map_err(|_| SessionError::Timeout(limit))?,
        None => drive.await,
    }
}
