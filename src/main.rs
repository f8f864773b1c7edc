//! Ridian - persistent R sessions from the command line.
//!
//! Evaluates snippets or markdown chunks in long-lived R processes and
//! queries the R language server. Results are printed to stdout as JSON;
//! logs go to stderr.

use std::collections::HashMap;
use std::io::Read;
use std::path::{Path, PathBuf};
use std::sync::Arc;

use anyhow::{anyhow, bail, Context, Result};
use clap::{Args, Parser, Subcommand};
use serde::Serialize;
use tracing::info;
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

use ridian::artifacts::DirectoryStore;
use ridian::config::Settings;
use ridian::eval::{ChunkOptions, CodeChunk, EvaluationRequest, Evaluator};
use ridian::lsp::{LanguageClient, VirtualDocument};
use ridian::models::EvaluationResult;
use ridian::session::SessionRegistry;

#[derive(Parser)]
#[command(name = "ridian", version, about = "Persistent R sessions and language-server queries")]
struct Cli {
    /// Settings file (defaults to the user config directory)
    #[arg(long, global = true)]
    config: Option<PathBuf>,

    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand)]
enum Command {
    /// Evaluate a snippet read from a file or stdin
    Eval(EvalArgs),
    /// Evaluate the R chunk enclosing a document line
    Chunk(ChunkArgs),
    /// Evaluate every R chunk of a document in order, in one session
    Run(RunArgs),
    /// Completions at a position inside an R chunk
    Complete(PositionArgs),
    /// Signature help at a position inside an R chunk
    Signature(PositionArgs),
}

#[derive(Args)]
struct EvalArgs {
    /// Session key; evaluations with the same key share variables
    #[arg(long, default_value = "scratch")]
    session: String,
    /// Label used in artifact file names
    #[arg(long, default_value = "snippet")]
    label: String,
    /// Chunk option override, e.g. `-o output=false`
    #[arg(short = 'o', long = "option", value_parser = parse_key_value)]
    options: Vec<(String, String)>,
    /// File holding the code (stdin when omitted)
    file: Option<PathBuf>,
}

#[derive(Args)]
struct ChunkArgs {
    document: PathBuf,
    /// Zero-based line inside the chunk
    line: usize,
}

#[derive(Args)]
struct RunArgs {
    document: PathBuf,
}

#[derive(Args)]
struct PositionArgs {
    document: PathBuf,
    /// Zero-based document line
    line: usize,
    /// Zero-based character offset
    character: usize,
}

fn parse_key_value(raw: &str) -> Result<(String, String), String> {
    let (key, value) = raw
        .split_once('=')
        .ok_or_else(|| format!("expected key=value, got `{}`", raw))?;
    Ok((key.trim().to_string(), value.trim().to_string()))
}

/// One chunk's outcome in `run` output.
#[derive(Serialize)]
#[serde(rename_all = "camelCase")]
struct ChunkRun {
    label: String,
    start_line: usize,
    #[serde(flatten)]
    outcome: EvaluationResult,
}

fn print_json<T: Serialize>(value: &T) -> Result<()> {
    println!("{}", serde_json::to_string_pretty(value)?);
    Ok(())
}

fn read_document(path: &Path) -> Result<String> {
    std::fs::read_to_string(path).with_context(|| format!("Failed to read {}", path.display()))
}

fn chunk_at(document: &Path, line: usize) -> Result<CodeChunk> {
    let text = read_document(document)?;
    CodeChunk::at_line(&text, line)
        .ok_or_else(|| anyhow!("No R chunk encloses line {} of {}", line, document.display()))
}

/// Sessions started for a document are keyed by its path.
fn session_key(document: &Path) -> String {
    std::fs::canonicalize(document)
        .unwrap_or_else(|_| document.to_path_buf())
        .display()
        .to_string()
}

fn evaluator(settings: Settings) -> Evaluator {
    let store = Arc::new(DirectoryStore::new(settings.artifact_root()));
    Evaluator::new(Arc::new(SessionRegistry::new(settings)), store)
}

async fn eval_snippet(settings: Settings, args: EvalArgs) -> Result<()> {
    let code = match &args.file {
        Some(path) => read_document(path)?,
        None => {
            let mut code = String::new();
            std::io::stdin()
                .read_to_string(&mut code)
                .context("Failed to read code from stdin")?;
            code
        }
    };

    let chunk = CodeChunk::from_body(&code);
    let mut options: HashMap<String, String> = chunk.options.clone();
    options.extend(args.options);
    let request = EvaluationRequest::new(chunk.code, args.label)
        .with_options(ChunkOptions::from_map(&options));

    let evaluator = evaluator(settings);
    let result = evaluator.evaluate(&args.session, &request).await;
    evaluator.registry().kill_all().await;
    print_json(&result?)
}

async fn eval_chunk(settings: Settings, args: ChunkArgs) -> Result<()> {
    let chunk = chunk_at(&args.document, args.line)?;
    let request = EvaluationRequest::from_chunk(&chunk);

    let evaluator = evaluator(settings);
    let result = evaluator
        .evaluate(&session_key(&args.document), &request)
        .await;
    evaluator.registry().kill_all().await;
    print_json(&result?)
}

async fn run_document(settings: Settings, args: RunArgs) -> Result<()> {
    let text = read_document(&args.document)?;
    let chunks = CodeChunk::all(&text);
    if chunks.is_empty() {
        bail!("No R chunks in {}", args.document.display());
    }

    let key = session_key(&args.document);
    let evaluator = evaluator(settings);
    let mut runs = Vec::with_capacity(chunks.len());
    let mut failure = None;
    for chunk in &chunks {
        let request = EvaluationRequest::from_chunk(chunk);
        match evaluator.evaluate(&key, &request).await {
            Ok(outcome) => runs.push(ChunkRun {
                label: request.label,
                start_line: chunk.start_line,
                outcome,
            }),
            Err(e) => {
                failure = Some(anyhow!(e).context(format!(
                    "Chunk at line {} failed",
                    chunk.start_line
                )));
                break;
            }
        }
    }
    evaluator.registry().kill_all().await;

    print_json(&runs)?;
    match failure {
        Some(e) => Err(e),
        None => Ok(()),
    }
}

#[derive(Clone, Copy)]
enum Query {
    Completion,
    Signature,
}

async fn query_language_server(settings: Settings, args: PositionArgs, query: Query) -> Result<()> {
    let chunk = chunk_at(&args.document, args.line)?;
    let position = chunk
        .relative_position(args.line, args.character)
        .ok_or_else(|| anyhow!("Line {} is a chunk fence", args.line))?;
    let document = VirtualDocument::create(&chunk.code_with_all)?;

    let client = LanguageClient::start(&settings).await?;
    let outcome: Result<()> = async {
        client.wait_ready().await?;
        client.did_open(document.uri(), &chunk.code_with_all).await?;
        match query {
            Query::Completion => {
                print_json(&client.completion(document.uri(), position).await?)
            }
            Query::Signature => {
                print_json(&client.signature_help(document.uri(), position).await?)
            }
        }
    }
    .await;
    client.shutdown().await;
    outcome
}

#[tokio::main]
async fn main() -> Result<()> {
    tracing_subscriber::registry()
        .with(tracing_subscriber::EnvFilter::new(
            std::env::var("RUST_LOG").unwrap_or_else(|_| "ridian=info".into()),
        ))
        .with(
            tracing_subscriber::fmt::layer()
                .with_target(false)
                .with_writer(std::io::stderr),
        )
        .init();

    let cli = Cli::parse();
    let settings = Settings::load(cli.config.as_deref())?;
    info!("Using R at {}", settings.executable().display());

    match cli.command {
        Command::Eval(args) => eval_snippet(settings, args).await,
        Command::Chunk(args) => eval_chunk(settings, args).await,
        Command::Run(args) => run_document(settings, args).await,
        Command::Complete(args) => query_language_server(settings, args, Query::Completion).await,
        Command::Signature(args) => query_language_server(settings, args, Query::Signature).await,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use clap::CommandFactory;

    #[test]
    fn test_cli_definition() {
        Cli::command().debug_assert();
    }

    #[test]
    fn test_parse_key_value() {
        assert_eq!(
            parse_key_value("output = false"),
            Ok(("output".to_string(), "false".to_string()))
        );
        assert!(parse_key_value("output").is_err());
    }

    #[test]
    fn test_eval_options_parse() {
        let cli = Cli::parse_from(["ridian", "eval", "-o", "output=false", "--session", "a", "code.R"]);
        match cli.command {
            Command::Eval(args) => {
                assert_eq!(args.session, "a");
                assert_eq!(args.options, vec![("output".to_string(), "false".to_string())]);
                assert_eq!(args.file, Some(PathBuf::from("code.R")));
            }
            _ => panic!("expected eval"),
        }
    }
}
