use clap::{Parser, Subcommand};
use std::path::{Path, PathBuf};
use std::process::ExitCode;
use std::time::Duration;

use tracing::{info, warn};
use tracing_subscriber::EnvFilter;
use tracing_subscriber::layer::SubscriberExt;
use tracing_subscriber::util::SubscriberInitExt;

use lfs_builder::Result;
use lfs_builder::cancel::CancelToken;
use lfs_builder::config::{BuilderConfig, load_builder_config};
use lfs_builder::document::{Document, load_document, rewrite};
use lfs_builder::fetch::{AcquireOptions, acquire_all, http::HttpFetcher};
use lfs_builder::planner::{
    makefile::{BuildEnv, emit},
    order_stages,
};
use lfs_builder::script::ScriptedStage;
use lfs_builder::workspace::{self, LinkState, Layout};

#[derive(Debug, Parser)]
#[command(author, version, about)]
struct Args {
    /// Builder configuration TOML
    #[arg(long, global = true, default_value = "config.toml")]
    config: PathBuf,
    /// Emit logs as JSON lines
    #[arg(long, global = true)]
    log_json: bool,
    #[command(subcommand)]
    cmd: Command,
}

#[derive(Debug, Subcommand)]
enum Command {
    /// Create the build root layout
    Init,
    /// Download and verify every package and patch
    Fetch,
    /// Verify sources and write scripts, the plan and its manifest
    Plan,
    /// init + tools link + fetch + plan
    Prepare,
    /// Show which stages of the last plan have completed
    Status,
    /// Print each stage's identity without writing anything
    Identity,
}

fn init_logging(json: bool) {
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"));
    let registry = tracing_subscriber::registry().with(filter);
    if json {
        registry
            .with(tracing_subscriber::fmt::layer().json().with_writer(std::io::stderr))
            .init();
    } else {
        registry
            .with(
                tracing_subscriber::fmt::layer()
                    .with_target(false)
                    .with_writer(std::io::stderr),
            )
            .init();
    }
}

fn main() -> ExitCode {
    let args = Args::parse();
    init_logging(args.log_json);
    match run(&args) {
        Ok(()) => ExitCode::SUCCESS,
        Err(e) => {
            eprintln!("error: {e}");
            ExitCode::FAILURE
        }
    }
}

fn run(args: &Args) -> Result<()> {
    let cfg = load_builder_config(&args.config)?;
    let layout = Layout::from_config(&cfg)?;
    match args.cmd {
        Command::Init => workspace::init_root(&layout),
        Command::Fetch => {
            let doc = load_book(&cfg)?;
            fetch_sources(&cfg, &layout, &doc)
        }
        Command::Plan => {
            let doc = load_book(&cfg)?;
            fetch_sources(&cfg, &layout, &doc)?;
            write_plan(&cfg, &layout, doc)
        }
        Command::Prepare => {
            workspace::init_root(&layout)?;
            tools_link(&cfg, &layout)?;
            let doc = load_book(&cfg)?;
            fetch_sources(&cfg, &layout, &doc)?;
            write_plan(&cfg, &layout, doc)
        }
        Command::Status => {
            println!("{}", lfs_builder::status::status(&layout)?);
            Ok(())
        }
        Command::Identity => {
            let doc = load_book(&cfg)?;
            for s in scripted_stages(&cfg, doc)? {
                println!("{}\t{}", s.identity, s.stage.name);
            }
            Ok(())
        }
    }
}

/// Loads the book, selects the configured revision and applies command
/// rewrites. Runs once per invocation.
fn load_book(cfg: &BuilderConfig) -> Result<Document> {
    let mut doc = load_document(&cfg.book_path, cfg.general.checksum)?;
    doc.select_revision(cfg.general.revision.as_deref());
    doc.map_stage_commands(rewrite::from_config(&cfg.rewrite))?;
    info!(
        version = %doc.version,
        packages = doc.packages.len(),
        patches = doc.patches.len(),
        stages = doc.stages().len(),
        "book loaded"
    );
    Ok(doc)
}

fn fetch_sources(cfg: &BuilderConfig, layout: &Layout, doc: &Document) -> Result<()> {
    workspace::ensure_dir(&layout.sources)?;
    let fetcher = HttpFetcher::new(Duration::from_secs(cfg.download.timeout_secs))?;
    let opts = AcquireOptions::from_config(cfg, &doc.version);
    let artifacts: Vec<_> = doc.artifacts().cloned().collect();
    let (cancel, _sigint) = CancelToken::with_sigint();
    let paths = acquire_all(
        &fetcher,
        &artifacts,
        &layout.sources,
        &opts,
        &cancel,
        cfg.download_jobs(),
    )?;
    info!(count = paths.len(), dir = %layout.sources.display(), "sources verified");
    Ok(())
}

fn scripted_stages(cfg: &BuilderConfig, doc: Document) -> Result<Vec<ScriptedStage>> {
    let alg = cfg.general.checksum;
    Ok(order_stages(doc.into_stages())?
        .into_iter()
        .map(|s| ScriptedStage::new(s, alg))
        .collect())
}

fn write_plan(cfg: &BuilderConfig, layout: &Layout, doc: Document) -> Result<()> {
    let stages = scripted_stages(cfg, doc)?;
    let env = BuildEnv {
        root: layout.root.clone(),
        target: cfg.general.target.clone(),
    };
    let plan = emit(&stages, layout, &env)?;
    println!("make -f {}", layout.plan_file().display());
    info!(stages = plan.nodes.len(), "ready");
    Ok(())
}

fn tools_link(cfg: &BuilderConfig, layout: &Layout) -> Result<()> {
    let link = Path::new(cfg.tools.link.trim());
    if cfg.tools.create_link {
        return workspace::ensure_tools_link(link, &layout.tools, &cfg.tools.elevate);
    }
    if workspace::check_tools_link(link, &layout.tools)? == LinkState::Missing {
        warn!(link = %link.display(), tools = %layout.tools.display(), "tools link missing");
    }
    Ok(())
}
