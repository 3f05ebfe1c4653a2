//! # docgraph CLI
//!
//! Index documents into collections and chat with them.
//!
//! ## Usage
//!
//! ```bash
//! docgraph --config ./config/docgraph.toml <command>
//! ```
//!
//! ## Commands
//!
//! | Command | Description |
//! |---------|-------------|
//! | `docgraph init` | Write a starter config and create storage directories |
//! | `docgraph index <paths…> --collection NAME` | Index files into a collection |
//! | `docgraph collections` | List saved collections |
//! | `docgraph ask --collection NAME "<question>"` | One-shot question |
//! | `docgraph chat --collection NAME` | Interactive chat on stdin |
//! | `docgraph serve` | Start the HTTP API |
//! | `docgraph completions <shell>` | Print shell completions |
//!
//! Logs go to stderr; set `RUST_LOG` to adjust (default `info`).

use anyhow::{Context, Result};
use clap::{CommandFactory, Parser, Subcommand, ValueEnum};
use std::path::{Path, PathBuf};
use tokio::io::{AsyncBufReadExt, BufReader};
use tracing_subscriber::EnvFilter;

use docgraph::app::{AppContext, TurnStatus};
use docgraph::config::{self, Config};
use docgraph::extract::is_supported;
use docgraph::progress::ProgressMode;
use docgraph::server;

/// docgraph: question answering over collections of documents.
///
/// All commands accept a `--config` flag pointing to a TOML configuration
/// file. Run `docgraph init` to write a starter one.
#[derive(Parser)]
#[command(name = "docgraph", version, about)]
struct Cli {
    /// Path to configuration file (TOML).
    #[arg(long, global = true, default_value = "./config/docgraph.toml")]
    config: PathBuf,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Write a starter config (if missing) and create storage directories.
    Init,

    /// Index files (or directories of files) into a collection.
    ///
    /// Each file becomes one index named after its stem; the collection is
    /// saved only if every file indexes successfully.
    Index {
        /// Files or directories (.pdf, .txt, .md).
        #[arg(required = true)]
        paths: Vec<PathBuf>,

        #[arg(long)]
        collection: String,

        /// Characters per chunk (default from `[chunking]`).
        #[arg(long)]
        chunk_size: Option<usize>,

        /// Characters shared by neighbouring chunks (default from `[chunking]`).
        #[arg(long)]
        overlap: Option<usize>,

        /// Progress output on stderr. Defaults to human on a TTY, else off.
        #[arg(long, value_enum)]
        progress: Option<ProgressArg>,
    },

    /// List saved collections.
    Collections,

    /// Ask one question against a collection.
    Ask {
        #[arg(long)]
        collection: String,

        #[arg(long)]
        temperature: Option<f32>,

        question: String,
    },

    /// Chat with a collection on stdin.
    ///
    /// `/clear` resets the conversation, `/temp <v>` changes the temperature,
    /// `/quit` exits.
    Chat {
        #[arg(long)]
        collection: String,
    },

    /// Start the HTTP API on `[server].bind`.
    Serve,

    /// Print shell completions to stdout.
    Completions {
        #[arg(value_enum)]
        shell: clap_complete::Shell,
    },
}

#[derive(Clone, Copy, ValueEnum)]
enum ProgressArg {
    Human,
    Json,
    Off,
}

impl From<ProgressArg> for ProgressMode {
    fn from(arg: ProgressArg) -> Self {
        match arg {
            ProgressArg::Human => ProgressMode::Human,
            ProgressArg::Json => ProgressMode::Json,
            ProgressArg::Off => ProgressMode::Off,
        }
    }
}

const CLI_SESSION: &str = "cli";

#[tokio::main]
async fn main() -> Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")))
        .with_writer(std::io::stderr)
        .init();

    let cli = Cli::parse();

    // Commands that don't require config
    match &cli.command {
        Commands::Completions { shell } => {
            clap_complete::generate(*shell, &mut Cli::command(), "docgraph", &mut std::io::stdout());
            return Ok(());
        }
        Commands::Init => {
            write_starter_config(&cli.config)?;
        }
        _ => {}
    }

    let cfg = config::load_config(&cli.config)?;

    match cli.command {
        Commands::Init => {
            let app = AppContext::from_config(cfg.clone())?;
            app.init_storage().await?;
            println!("Storage initialized under {}", cfg.storage.indices_dir.display());
        }
        Commands::Index {
            paths,
            collection,
            chunk_size,
            overlap,
            progress,
        } => {
            run_index(cfg, &paths, &collection, chunk_size, overlap, progress).await?;
        }
        Commands::Collections => {
            let app = AppContext::from_config(cfg)?;
            for name in app.list_collections().await? {
                println!("{}", name);
            }
        }
        Commands::Ask {
            collection,
            temperature,
            question,
        } => {
            let app = AppContext::from_config(cfg)?;
            app.select_collection(&collection).await?;
            if let Some(t) = temperature {
                app.set_temperature(t).await?;
            }
            let reply = app.chat(CLI_SESSION, &question).await?;
            for call in &reply.tool_calls {
                tracing::info!(tool = %call.tool, query = %call.query, "tool call");
            }
            println!("{}", reply.answer);
            if reply.status != TurnStatus::Answered {
                anyhow::bail!("question could not be answered ({:?})", reply.status);
            }
        }
        Commands::Chat { collection } => {
            run_chat(cfg, &collection).await?;
        }
        Commands::Serve => {
            server::run_server(&cfg).await?;
        }
        Commands::Completions { .. } => {
            // Handled above (before config loading)
        }
    }

    Ok(())
}

fn write_starter_config(path: &Path) -> Result<()> {
    if path.exists() {
        return Ok(());
    }
    if let Some(parent) = path.parent().filter(|p| !p.as_os_str().is_empty()) {
        std::fs::create_dir_all(parent)
            .with_context(|| format!("Failed to create {}", parent.display()))?;
    }
    std::fs::write(path, config::EXAMPLE_CONFIG)
        .with_context(|| format!("Failed to write config file: {}", path.display()))?;
    println!("Wrote {}", path.display());
    Ok(())
}

/// Expand directories into the supported files they contain, sorted.
fn collect_files(paths: &[PathBuf]) -> Result<Vec<PathBuf>> {
    let mut files = Vec::new();
    for path in paths {
        if path.is_dir() {
            let mut found: Vec<PathBuf> = walkdir::WalkDir::new(path)
                .into_iter()
                .filter_map(|e| e.ok())
                .filter(|e| e.file_type().is_file() && is_supported(e.path()))
                .map(|e| e.into_path())
                .collect();
            found.sort();
            files.extend(found);
        } else if path.is_file() {
            files.push(path.clone());
        } else {
            anyhow::bail!("No such file or directory: {}", path.display());
        }
    }
    Ok(files)
}

async fn run_index(
    cfg: Config,
    paths: &[PathBuf],
    collection: &str,
    chunk_size: Option<usize>,
    overlap: Option<usize>,
    progress: Option<ProgressArg>,
) -> Result<()> {
    let chunk_size = chunk_size.unwrap_or(cfg.chunking.chunk_size);
    let overlap = overlap.unwrap_or(cfg.chunking.overlap);
    let mode = progress
        .map(ProgressMode::from)
        .unwrap_or_else(ProgressMode::default_for_tty);

    let files = collect_files(paths)?;
    let app = AppContext::from_config(cfg)?;
    app.upload_paths(&files).await?;

    let reporter = mode.reporter();
    let report = app
        .index_batch(chunk_size, overlap, collection, reporter.as_ref())
        .await?;
    if !report.collection_saved {
        anyhow::bail!("{}", report.status_text());
    }
    println!("{}", report.status_text());
    Ok(())
}

async fn run_chat(cfg: Config, collection: &str) -> Result<()> {
    let app = AppContext::from_config(cfg)?;
    let selection = app.select_collection(collection).await?;
    println!(
        "Chatting with '{}' (temperature {}). /clear, /temp <v>, /quit",
        selection.collection, selection.temperature
    );

    let mut lines = BufReader::new(tokio::io::stdin()).lines();
    while let Some(line) = lines.next_line().await? {
        let line = line.trim();
        if line.is_empty() {
            continue;
        }
        match line {
            "/quit" | "/exit" => break,
            "/clear" => {
                app.clear_history(CLI_SESSION);
                println!("(history cleared)");
            }
            _ if line.starts_with("/temp") => {
                let value = line.trim_start_matches("/temp").trim();
                match value.parse::<f32>() {
                    Ok(v) => match app.set_temperature(v).await {
                        Ok(t) => println!("(temperature {})", t),
                        Err(e) => println!("(error: {})", e),
                    },
                    Err(_) => println!("(usage: /temp <0.0-2.0>)"),
                }
            }
            message => {
                let reply = app.chat(CLI_SESSION, message).await?;
                println!("{}\n", reply.answer);
            }
        }
    }
    Ok(())
}
