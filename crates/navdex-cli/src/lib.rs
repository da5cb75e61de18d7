//! Command line interface for navdex.

pub mod logging;

use std::path::PathBuf;
use std::process::ExitCode;
use std::sync::Arc;
use std::time::Duration;

use anyhow::{Context, Result};
use clap::{Args, Parser, Subcommand, ValueEnum};
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use navdex_config::Config;
use navdex_index::emit::SEARCH_INDEX_FILE;
use navdex_index::indexer::default_jobs;
use navdex_index::{
    ArtifactFormat, GlobalSearchIndex, Indexer, IndexerConfig, JsonDirProvider, RetryPolicy,
    WatchService, WatcherConfig,
};

/// Exit status for a build interrupted by Ctrl-C.
const EXIT_INTERRUPTED: u8 = 130;

#[derive(Parser, Debug)]
#[command(
    name = "navdex",
    author,
    version,
    about = "Build sidebar and search indexes for generated documentation",
    long_about = None
)]
pub struct Cli {
    /// Enable verbose output
    #[arg(short, long, global = true)]
    verbose: bool,

    /// Configuration file (replaces ./navdex.toml)
    #[arg(short, long, global = true, value_name = "FILE")]
    config: Option<PathBuf>,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand, Debug)]
enum Commands {
    /// Build artifacts for every module under ROOT
    Build(BuildArgs),

    /// Build once, then rebuild whenever inputs under ROOT change
    Watch(BuildArgs),

    /// Query a previously written search index
    Search {
        /// Output directory of an earlier build
        #[arg(value_name = "DIR")]
        dir: PathBuf,

        /// Search query
        query: String,

        /// Maximum number of results
        #[arg(short, long, default_value = "20")]
        limit: usize,
    },

    /// Print the effective configuration as TOML
    Config,
}

#[derive(Args, Debug, Default)]
struct BuildArgs {
    /// Directory containing module input files
    #[arg(value_name = "ROOT")]
    root: PathBuf,

    /// Output directory for artifacts
    #[arg(short, long, value_name = "DIR")]
    output: Option<PathBuf>,

    /// Cache directory (defaults to <DIR>/.navdex-cache)
    #[arg(long, value_name = "DIR")]
    cache_dir: Option<PathBuf>,

    /// Rebuild every module regardless of the cache
    #[arg(long)]
    force: bool,

    /// Disable the incremental cache
    #[arg(long)]
    no_cache: bool,

    /// Maximum modules built concurrently
    #[arg(short, long, value_name = "N")]
    jobs: Option<usize>,

    /// Sidebar artifact format (repeatable)
    #[arg(long = "format", value_enum, value_name = "FORMAT")]
    formats: Vec<FormatArg>,

    /// Include crate-visible and private symbols
    #[arg(long)]
    document_private_items: bool,
}

#[derive(Clone, Copy, Debug, ValueEnum)]
enum FormatArg {
    /// Pretty-printed JSON
    Json,
    /// Script wrapped in `initSidebarItems(...)`
    Js,
}

impl From<FormatArg> for ArtifactFormat {
    fn from(arg: FormatArg) -> Self {
        match arg {
            FormatArg::Json => ArtifactFormat::Json,
            FormatArg::Js => ArtifactFormat::Js,
        }
    }
}

/// Parse arguments, set up logging and dispatch the subcommand.
pub async fn run() -> Result<ExitCode> {
    let cli = Cli::parse();

    let config = Config::load(cli.config.as_deref()).context("Failed to load configuration")?;
    logging::init(cli.verbose, &config.log.level)?;
    debug!("Effective configuration: {:?}", config);

    execute(cli.command, &config).await
}

async fn execute(command: Commands, config: &Config) -> Result<ExitCode> {
    match command {
        Commands::Build(args) => build(&args, config).await,
        Commands::Watch(args) => watch(&args, config).await,
        Commands::Search { dir, query, limit } => search(&dir, &query, limit),
        Commands::Config => {
            print!("{}", config.to_toml()?);
            Ok(ExitCode::SUCCESS)
        }
    }
}

async fn build(args: &BuildArgs, config: &Config) -> Result<ExitCode> {
    let indexer = make_indexer(args, config)?;
    let cancel = cancel_on_ctrl_c();

    let report = indexer.run_with_cancel(cancel).await?;
    print!("{}", report);

    if report.is_cancelled() {
        Ok(ExitCode::from(EXIT_INTERRUPTED))
    } else if report.is_success() {
        Ok(ExitCode::SUCCESS)
    } else {
        Ok(ExitCode::FAILURE)
    }
}

async fn watch(args: &BuildArgs, config: &Config) -> Result<ExitCode> {
    let indexer = Arc::new(make_indexer(args, config)?);
    let watch_config = WatcherConfig {
        debounce: Duration::from_millis(config.watch.debounce_ms),
        suffix: config.input.suffix.clone(),
    };

    info!("Watching {:?} (Ctrl-C to stop)", args.root);
    let cancel = cancel_on_ctrl_c();
    WatchService::new(indexer, watch_config)
        .run(cancel, |report| print!("{}", report))
        .await?;

    Ok(ExitCode::SUCCESS)
}

fn search(dir: &std::path::Path, query: &str, limit: usize) -> Result<ExitCode> {
    let index = GlobalSearchIndex::load(&dir.join(SEARCH_INDEX_FILE))?;
    let hits = index.search(query, limit);

    if hits.is_empty() {
        println!("No results for '{}'", query);
        return Ok(ExitCode::SUCCESS);
    }

    for hit in &hits {
        println!("{:.2}  {}", hit.score, hit);
    }
    Ok(ExitCode::SUCCESS)
}

fn make_indexer(args: &BuildArgs, config: &Config) -> Result<Indexer> {
    let indexer_config = indexer_config(args, config)?;
    let provider = JsonDirProvider::new(&args.root)
        .with_suffix(config.input.suffix.clone())
        .with_gitignore(config.input.respect_gitignore)
        .with_retry(indexer_config.retry.clone());
    Ok(Indexer::new(indexer_config, Arc::new(provider)))
}

/// Merge configuration with command line overrides.
fn indexer_config(args: &BuildArgs, config: &Config) -> Result<IndexerConfig> {
    let formats = if args.formats.is_empty() {
        config
            .output
            .formats
            .iter()
            .map(|name| {
                ArtifactFormat::parse(name).with_context(|| format!("Unknown output format '{}'", name))
            })
            .collect::<Result<Vec<_>>>()?
    } else {
        args.formats.iter().copied().map(ArtifactFormat::from).collect()
    };

    Ok(IndexerConfig {
        output_dir: args.output.clone().unwrap_or_else(|| config.output.dir.clone()),
        cache_enabled: config.cache.enabled && !args.no_cache,
        cache_dir: args.cache_dir.clone().or_else(|| config.cache.dir.clone()),
        formats,
        max_reexport_depth: config.index.max_reexport_depth,
        document_private_items: args.document_private_items || config.index.document_private_items,
        jobs: args.jobs.or(config.index.jobs).unwrap_or_else(default_jobs).max(1),
        force: args.force,
        retry: RetryPolicy {
            max_attempts: config.retry.max_attempts,
            initial_delay_ms: config.retry.initial_delay_ms,
            backoff_multiplier: config.retry.backoff_multiplier,
            max_delay_ms: config.retry.max_delay_ms,
        },
    })
}

/// A token cancelled by the first Ctrl-C.
fn cancel_on_ctrl_c() -> CancellationToken {
    let cancel = CancellationToken::new();
    let token = cancel.clone();
    tokio::spawn(async move {
        if tokio::signal::ctrl_c().await.is_ok() {
            warn!("Interrupted, finishing in-flight modules");
            token.cancel();
        }
    });
    cancel
}
