//! CLI entry point for Lodestone: index a directory of text documents into a
//! vector store and query it.

use std::path::{Path, PathBuf};
use std::sync::Arc;

use clap::Parser;
use lodestone_core::config::default_workers;
use lodestone_core::store::{self, VectorStore};
use lodestone_core::{
    app_data_dir, chunk_text, config_path, ensure_collection, load_config, load_config_from,
    probe_dimension, read_line_range, set_source_dir, status, until_cancelled, Config, Embedder,
    Hit, IndexError, Indexer, OllamaClient, Searcher,
};
use tokio_util::sync::CancellationToken;
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

#[derive(Parser)]
#[command(name = "lodestone")]
#[command(about = "Lodestone: chunk, embed and search a directory of text documents")]
struct Cli {
    /// Config file to use instead of the one in the app data directory.
    #[arg(long, global = true, value_name = "FILE")]
    config: Option<PathBuf>,

    #[command(subcommand)]
    command: Option<Commands>,
}

#[derive(clap::Subcommand)]
enum Commands {
    /// Show backend status.
    Status,
    /// Show where Lodestone stores its config (app data directory).
    DataDir,
    /// Print the effective config as TOML.
    Config,
    /// Remember a document directory as the default source.
    SetSource {
        #[arg(value_name = "PATH")]
        path: PathBuf,
    },
    /// Show how a document would be chunked.
    Chunks {
        #[arg(value_name = "FILE")]
        file: PathBuf,
    },
    /// Index a directory of documents into the configured collection.
    Index {
        /// Document directory. Defaults to `indexing.source_dir`.
        #[arg(long, value_name = "PATH")]
        dir: Option<PathBuf>,
        /// Drop and rebuild the database if it already exists.
        #[arg(long)]
        overwrite: bool,
    },
    /// Search the collection for chunks similar to a query.
    Query {
        #[arg(value_name = "TEXT")]
        text: String,
        #[arg(long)]
        top_k: Option<usize>,
    },
    /// Index (if needed), then query, in one process.
    Run {
        #[arg(value_name = "TEXT")]
        text: String,
        #[arg(long, value_name = "PATH")]
        dir: Option<PathBuf>,
        #[arg(long)]
        overwrite: bool,
        #[arg(long)]
        top_k: Option<usize>,
    },
}

#[tokio::main]
async fn main() {
    tracing_subscriber::registry()
        .with(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| "lodestone_cli=info,lodestone_core=info".into()),
        )
        .with(tracing_subscriber::fmt::layer().with_writer(std::io::stderr))
        .init();

    let cli = Cli::parse();
    if let Err(e) = run(cli).await {
        eprintln!("Error: {}", e);
        std::process::exit(1);
    }
}

async fn run(cli: Cli) -> Result<(), Box<dyn std::error::Error>> {
    let config = match &cli.config {
        Some(path) => load_config_from(path)?,
        None => load_config(),
    };
    let cancel = CancellationToken::new();

    match cli.command.unwrap_or(Commands::Status) {
        Commands::Status => {
            println!("Lodestone backend");
            println!("  core: {}", status());
            println!("  workers: {}", config.indexing.workers.unwrap_or_else(default_workers));
        }
        Commands::DataDir => match app_data_dir() {
            Some(p) => println!("{}", p.display()),
            None => eprintln!("Could not determine app data directory."),
        },
        Commands::Config => {
            if let Some(p) = config_path() {
                println!("# {}", p.display());
            }
            print!("{}", config.to_toml()?);
        }
        Commands::SetSource { path } => {
            set_source_dir(&path)?;
            println!("Source directory set to {}", path.display());
        }
        Commands::Chunks { file } => {
            let text = std::fs::read_to_string(&file)?;
            let name = file.display().to_string();
            for c in chunk_text(&name, &text, config.chunk_settings()) {
                println!("--- {} [{}..{})", c.filename, c.line_start, c.line_end);
                println!("{}", c.content);
            }
        }
        Commands::Index { dir, overwrite } => {
            config.validate()?;
            let app = App::open(&config, cancel_on_interrupt(cancel))?;
            let dir = source_dir(&config, dir);
            app.index(&dir, overwrite || config.indexing.overwrite).await?;
        }
        Commands::Query { text, top_k } => {
            config.validate()?;
            let app = App::open(&config, cancel_on_interrupt(cancel))?;
            let dir = source_dir(&config, None);
            let hits = app.query(&text, top_k.unwrap_or(config.search.top_k)).await?;
            print_hits(&dir, &hits);
        }
        Commands::Run {
            text,
            dir,
            overwrite,
            top_k,
        } => {
            config.validate()?;
            let app = App::open(&config, cancel_on_interrupt(cancel))?;
            let dir = source_dir(&config, dir);
            app.index(&dir, overwrite || config.indexing.overwrite).await?;
            let hits = app.query(&text, top_k.unwrap_or(config.search.top_k)).await?;
            print_hits(&dir, &hits);
        }
    }
    Ok(())
}

/// Cancels `cancel` on Ctrl-C. Once installed, Ctrl-C no longer kills the process,
/// so every long-running call below must observe the token.
fn cancel_on_interrupt(cancel: CancellationToken) -> CancellationToken {
    let on_interrupt = cancel.clone();
    tokio::spawn(async move {
        if tokio::signal::ctrl_c().await.is_ok() {
            tracing::warn!("interrupt received, stopping");
            on_interrupt.cancel();
        }
    });
    cancel
}

/// Embedding client and store built from config.
struct App {
    config: Config,
    embedder: Arc<dyn Embedder>,
    store: Arc<dyn VectorStore>,
    cancel: CancellationToken,
}

impl App {
    fn open(config: &Config, cancel: CancellationToken) -> Result<Self, Box<dyn std::error::Error>> {
        let embedder = OllamaClient::from_url(&config.embedding.base_url)?
            .with_embed_model(&config.embedding.model);
        let store = store::open(
            config.store.backend,
            &config.store.url,
            config.store.token.as_deref(),
        )?;
        Ok(Self {
            config: config.clone(),
            embedder: Arc::new(embedder),
            store,
            cancel,
        })
    }

    async fn index(&self, dir: &Path, overwrite: bool) -> Result<(), IndexError> {
        let probe = probe_dimension(self.embedder.as_ref(), self.config.embedding.dimension);
        until_cancelled(&self.cancel, probe).await?;
        let target = self.config.collection_path();
        let state = ensure_collection(
            self.store.as_ref(),
            &target,
            &self.config.schema(),
            &self.config.index_spec(),
            overwrite,
            &self.cancel,
        )
        .await?;
        if !state.should_index() {
            println!("Collection {} already indexed; pass --overwrite to rebuild.", target);
            return Ok(());
        }

        let indexer = Indexer::new(
            self.embedder.clone(),
            self.store.clone(),
            target,
            self.config.index_options(),
        );
        let stats = indexer.index_directory(dir, self.cancel.clone()).await?;
        println!(
            "Indexed {} chunk(s) from {} document(s) in {:.1}s",
            stats.chunks_inserted,
            stats.documents,
            stats.elapsed.as_secs_f64()
        );
        Ok(())
    }

    async fn query(&self, text: &str, top_k: usize) -> Result<Vec<Hit>, IndexError> {
        let searcher = Searcher::new(
            self.embedder.clone(),
            self.store.clone(),
            self.config.collection_path(),
            self.config.embedding.dimension,
        )
        .with_cancel(self.cancel.clone());
        searcher.search(text, top_k).await
    }
}

fn source_dir(config: &Config, dir: Option<PathBuf>) -> PathBuf {
    dir.unwrap_or_else(|| PathBuf::from(&config.indexing.source_dir))
}

fn print_hits(dir: &Path, hits: &[Hit]) {
    if hits.is_empty() {
        println!("No results.");
        return;
    }
    for h in hits {
        println!(
            "{:.4}  {}:{}-{}  (id {})",
            h.score, h.filename, h.line_start, h.line_end, h.id
        );
        match read_line_range(dir, &h.filename, h.line_start, h.line_end) {
            Ok(lines) => {
                for line in lines.iter().take(3) {
                    println!("    {}", line);
                }
            }
            Err(e) => tracing::debug!(error = %e, "could not read hit source"),
        }
    }
}
