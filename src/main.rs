use std::io::Write;
use std::path::PathBuf;
use std::time::Duration;

use anyhow::{Context, bail};
use clap::{Parser, Subcommand, ValueEnum};
use codelens_core::config::Config;
use codelens_core::{CodeLens, StreamChunk, bootstrap};
use codelens_index::{EmbeddingState, EmbeddingStatus, SearchResult};
use codelens_index::context::chunk_display_header;
use codelens_llm::any::AnyProvider;
use futures::StreamExt;

/// Index repositories, search them and ask questions about their code.
#[derive(Parser)]
#[command(name = "codelens", version, about)]
struct Cli {
    /// Path to the TOML config file. Falls back to `CODELENS_CONFIG`, then
    /// `./codelens.toml`.
    #[arg(long, global = true)]
    config: Option<PathBuf>,

    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand)]
enum Command {
    /// Import a local directory as a repository.
    Import {
        path: PathBuf,
        /// Repository id; defaults to the directory name.
        #[arg(long)]
        id: Option<String>,
        #[arg(long)]
        name: Option<String>,
    },
    /// Embed the chunks of a repository.
    Embed {
        repository: String,
        /// Go through the job queue and workers instead of running inline.
        #[arg(long)]
        queue: bool,
        #[arg(long, default_value_t = 0)]
        priority: i32,
    },
    /// Show embedding status and throughput.
    Status {
        repository: String,
        #[arg(long)]
        json: bool,
    },
    /// Search indexed code.
    Search {
        query: String,
        #[arg(long)]
        repo: Option<String>,
        #[arg(long, value_enum, default_value_t = SearchMode::Hybrid)]
        mode: SearchMode,
        /// Vector weight for hybrid mode; defaults to `chat.vector_weight`.
        #[arg(long)]
        weight: Option<f32>,
        #[arg(long, default_value_t = 10)]
        limit: usize,
    },
    /// Find chunks similar to a given chunk.
    Similar {
        chunk_id: String,
        #[arg(long, default_value_t = 5)]
        limit: usize,
    },
    /// Ask a question about a repository.
    Ask {
        question: String,
        #[arg(long)]
        repo: Option<String>,
        #[arg(long, default_value = "cli")]
        session: String,
        /// Wait for the whole answer instead of streaming it.
        #[arg(long)]
        no_stream: bool,
    },
    /// Delete a repository with its chunks and vectors.
    Remove { repository: String },
}

#[derive(Clone, Copy, ValueEnum)]
enum SearchMode {
    Vector,
    Text,
    Hybrid,
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let filter = tracing_subscriber::EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new("info"));
    tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_writer(std::io::stderr)
        .init();

    let cli = Cli::parse();
    let config_path = Config::resolve_path(cli.config.as_deref());
    let config = Config::load(&config_path)
        .with_context(|| format!("failed to load config from {}", config_path.display()))?;
    tracing::debug!(path = %config_path.display(), "config loaded");
    let lens = bootstrap::build(&config).await?;

    let result = run(&lens, &config, cli.command).await;
    lens.shutdown().await;
    result
}

async fn run(lens: &CodeLens<AnyProvider>, config: &Config, command: Command) -> anyhow::Result<()> {
    match command {
        Command::Import { path, id, name } => {
            let root = path
                .canonicalize()
                .with_context(|| format!("cannot access {}", path.display()))?;
            let dir_name = root
                .file_name()
                .map(|n| n.to_string_lossy().into_owned())
                .unwrap_or_else(|| "repository".into());
            let id = id.unwrap_or_else(|| dir_name.clone());
            let name = name.unwrap_or(dir_name);
            let report = lens.import_directory(&id, &name, root).await?;
            println!(
                "imported {} of {} files into {id} (unsupported {}, oversized {}, binary {})",
                report.files_imported,
                report.files_scanned,
                report.skipped_unsupported,
                report.skipped_oversized,
                report.skipped_binary
            );
            for error in &report.errors {
                eprintln!("warning: {error}");
            }
        }
        Command::Embed {
            repository,
            queue,
            priority,
        } => {
            let status = if queue {
                lens.start();
                let outcome = lens.queue_repository(&repository, priority).await?;
                println!("{repository}: {outcome:?}");
                wait_for_embedding(lens, &repository).await?
            } else {
                lens.process_repository(&repository).await?
            };
            println!(
                "{repository}: {:?} {}% ({} chunks, {} failed, {} reused)",
                status.state,
                status.progress,
                status.total_chunks,
                status.failed_chunks,
                status.skipped_chunks
            );
            if status.state == EmbeddingState::Failed {
                bail!("embedding failed: {}", status.error.unwrap_or_default());
            }
        }
        Command::Status { repository, json } => {
            let stats = lens.get_processing_stats(&repository).await?;
            if json {
                println!("{}", serde_json::to_string_pretty(&stats)?);
            } else {
                let s = &stats.status;
                println!("{repository}: {:?} {}%", s.state, s.progress);
                println!(
                    "chunks: {}/{} processed, {} failed, {} reused",
                    s.processed_chunks, s.total_chunks, s.failed_chunks, s.skipped_chunks
                );
                println!(
                    "batches: {}/{} succeeded, {} failed",
                    stats.batches_succeeded, stats.batches_total, stats.batches_failed
                );
                if let Some(avg) = stats.avg_ms_per_chunk {
                    println!("throughput: {avg:.1} ms/chunk");
                }
                if let Some(eta) = s.estimated_seconds_remaining {
                    println!("remaining: ~{eta}s");
                }
            }
        }
        Command::Search {
            query,
            repo,
            mode,
            weight,
            limit,
        } => {
            let repo = repo.as_deref();
            let results = match mode {
                SearchMode::Vector => lens.vector_search(repo, &query, limit).await?,
                SearchMode::Text => lens.text_search(repo, &query, limit).await?,
                SearchMode::Hybrid => {
                    let weight = weight.unwrap_or(config.chat.vector_weight);
                    lens.hybrid_search(repo, &query, weight, limit).await?
                }
            };
            print_results(&results);
        }
        Command::Similar { chunk_id, limit } => {
            let results = lens.find_similar_chunks(&chunk_id, limit).await?;
            print_results(&results);
        }
        Command::Ask {
            question,
            repo,
            session,
            no_stream,
        } => {
            if no_stream {
                let session = lens
                    .process_message(&session, repo.as_deref(), &question)
                    .await?;
                if let Some(answer) = session.last_message() {
                    println!("{}", answer.content);
                }
            } else {
                ask_streaming(lens, &session, repo.as_deref(), &question).await?;
            }
        }
        Command::Remove { repository } => {
            let removed = lens.remove_repository(&repository).await?;
            println!("removed {repository} ({removed} vectors)");
        }
    }
    Ok(())
}

async fn wait_for_embedding(
    lens: &CodeLens<AnyProvider>,
    repository: &str,
) -> anyhow::Result<EmbeddingStatus> {
    let mut last_progress = None;
    loop {
        let status = lens.get_embedding_status(repository).await?;
        if last_progress != Some(status.progress) {
            eprintln!("{repository}: {:?} {}%", status.state, status.progress);
            last_progress = Some(status.progress);
        }
        if status.state.is_terminal() {
            return Ok(status);
        }
        tokio::time::sleep(Duration::from_millis(500)).await;
    }
}

async fn ask_streaming(
    lens: &CodeLens<AnyProvider>,
    session: &str,
    repo: Option<&str>,
    question: &str,
) -> anyhow::Result<()> {
    let cancel = lens.cancellation_token().child_token();
    let on_interrupt = cancel.clone();
    tokio::spawn(async move {
        if tokio::signal::ctrl_c().await.is_ok() {
            on_interrupt.cancel();
        }
    });

    let mut stream = lens
        .process_message_streaming(session, repo, question, cancel.clone())
        .await?;
    let mut stdout = std::io::stdout();
    while let Some(chunk) = stream.next().await {
        match chunk {
            StreamChunk::Content { delta, .. } => {
                write!(stdout, "{delta}")?;
                stdout.flush()?;
            }
            StreamChunk::Done => {
                writeln!(stdout)?;
                return Ok(());
            }
            StreamChunk::Error { content } => {
                writeln!(stdout)?;
                bail!("answer failed: {content}");
            }
        }
    }
    writeln!(stdout)?;
    if cancel.is_cancelled() {
        eprintln!("interrupted; partial answer saved to session {session}");
    }
    Ok(())
}

fn print_results(results: &[SearchResult]) {
    if results.is_empty() {
        println!("no results");
        return;
    }
    for (rank, result) in results.iter().enumerate() {
        println!(
            "{:>2}. {:.3}  {}  [{}]",
            rank + 1,
            result.score,
            chunk_display_header(&result.chunk),
            result.chunk.id
        );
        if let Some(snippet) = &result.snippet {
            println!("    {}", snippet.replace('\n', " "));
        }
    }
}
