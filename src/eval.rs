//! Batch evaluation over the interpreter's stdin/stdout.
//!
//! One evaluation is one program written to a session:
//!
//! 1. [`compose_program`] wraps the user's code with capture logic and four
//!    per-call [`Sentinels`].
//! 2. [`EvaluationCall`] accumulates output until the completion sentinel is
//!    seen, failing if anything arrived on stderr.
//! 3. [`demultiplex`] splits the accumulated text into visible output,
//!    artifact file names and the environment snapshot.
//! 4. [`evaluate_in_session`] moves artifacts into an
//!    [`ArtifactStore`](crate::artifacts::ArtifactStore) and builds the
//!    [`EvaluationResult`](crate::models::EvaluationResult).
//!
//! [`CodeChunk`] locates fenced R chunks in markdown and reads their options.

mod call;
mod chunk;
mod demux;
mod evaluator;
mod program;

pub use call::{run_program, CallPhase, EvaluationCall};
pub use chunk::{
    file_safe_label, generate_label, is_chunk_start, is_help_request, ChunkOptions, CodeChunk,
};
pub use demux::{demultiplex, extract_tagged_lines, parse_environment, DemuxedOutput};
pub use evaluator::{evaluate_in_session, EvaluationRequest, Evaluator, HELP_PLACEHOLDER};
pub use program::{compose_program, ProgramSpec, Sentinels, SESSION_PREAMBLE};
