#![forbid(unsafe_code)]

use std::io;
use std::path::{Path, PathBuf};
use std::sync::Arc;

use clap::{Parser, Subcommand};
use tokio_util::sync::CancellationToken;

use pagesmith::catalog::{BackendCatalog, CatalogSnapshot, QualityTable};
use pagesmith::config::HarnessConfig;
use pagesmith::dispatch::{Dispatcher, JsonlTraceSink, TraceSink};
use pagesmith::gateway::OpenRouterAdapter;
use pagesmith::pipeline::{self, PipelineCoordinator};
use pagesmith::prompts::ContentBrief;
use pagesmith::roles::{Role, RoleResolver};
use pagesmith::trust::TrustLedger;

#[derive(Parser)]
#[command(name = "pagesmith", version, about = "Generate a static site across free model backends")]
struct Cli {
    /// Harness config (JSON). Falls back to $PAGESMITH_CONFIG, then defaults.
    #[arg(long, global = true)]
    config: Option<PathBuf>,
    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Backend catalog
    Catalog {
        #[command(subcommand)]
        command: CatalogCommands,
    },
    /// Trust ledger
    Trust {
        #[command(subcommand)]
        command: TrustCommands,
    },
    /// Print the backends a role currently resolves to
    Resolve { role: Role },
    /// Run a brief through the pipeline (LLM calls)
    Generate {
        #[arg(long)]
        brief: PathBuf,
        #[arg(long)]
        out: PathBuf,
        /// Per-attempt JSONL trace
        #[arg(long)]
        trace: Option<PathBuf>,
        /// Also write the merged files under this directory
        #[arg(long)]
        site_dir: Option<PathBuf>,
    },
}

#[derive(Subcommand)]
enum CatalogCommands {
    /// Refresh the catalog if older than the max age and print it
    Refresh {
        #[arg(long)]
        max_age_ms: Option<u64>,
    },
}

#[derive(Subcommand)]
enum TrustCommands {
    /// Print every ledger record
    Show,
    /// Print the trust verdict for one backend
    Check { backend_id: String },
}

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    let cli = Cli::parse();

    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| "pagesmith=info".into()),
        )
        .with_writer(io::stderr)
        .init();

    let config = HarnessConfig::resolve(cli.config.as_deref())?;

    match cli.command {
        Commands::Catalog { command } => match command {
            CatalogCommands::Refresh { max_age_ms } => {
                let catalog = build_catalog(&config)?;
                let max_age = max_age_ms
                    .map(std::time::Duration::from_millis)
                    .unwrap_or_else(|| config.catalog_max_age());
                let snapshot = catalog.refresh(max_age).await?;
                print_catalog(&snapshot);
            }
        },
        Commands::Trust { command } => {
            let ledger = open_ledger(&config)?;
            match command {
                TrustCommands::Show => {
                    for r in ledger.snapshot() {
                        println!(
                            "{:<50} {:<9} ok={:<5} fail={:<5} {}",
                            r.backend_id,
                            if r.trusted { "trusted" } else { "untrusted" },
                            r.success_count,
                            r.failure_count,
                            r.last_updated.to_rfc3339()
                        );
                    }
                }
                TrustCommands::Check { backend_id } => match ledger.record(&backend_id) {
                    Some(r) => println!(
                        "{}: {} (ok={}, fail={}, margin={})",
                        backend_id,
                        if r.trusted { "trusted" } else { "untrusted" },
                        r.success_count,
                        r.failure_count,
                        ledger.failure_margin()
                    ),
                    None => println!("{backend_id}: never observed (not trusted)"),
                },
            }
        }
        Commands::Resolve { role } => {
            let catalog = build_catalog(&config)?;
            let snapshot = catalog.refresh(config.catalog_max_age()).await?;
            let ledger = open_ledger(&config)?;
            let resolver = RoleResolver::new(config.role_settings());
            let assignment = resolver.resolve(role, &snapshot, &ledger);
            if assignment.last_resort {
                eprintln!("[resolve] no trusted backend; using last resort");
            }
            if assignment.fallback {
                eprintln!("[resolve] using configured fallback list");
            }
            for id in &assignment.ordered_backend_ids {
                println!("{id}");
            }
        }
        Commands::Generate {
            brief,
            out,
            trace,
            site_dir,
        } => {
            let brief: ContentBrief = read_json(&brief)?;
            let catalog = Arc::new(build_catalog(&config)?);
            let ledger = Arc::new(open_ledger(&config)?);
            let client = Arc::new(OpenRouterAdapter::from_env()?);
            let mut dispatcher = Dispatcher::new(
                client,
                ledger,
                RoleResolver::new(config.role_settings()),
                config.dispatch_settings(),
            );

            let mut trace_worker = None;
            if let Some(path) = trace {
                let (sink, worker) = JsonlTraceSink::new(&path)?;
                dispatcher = dispatcher.with_trace(Arc::new(sink) as Arc<dyn TraceSink>);
                trace_worker = Some(worker);
            }

            let coordinator = PipelineCoordinator::new(catalog, dispatcher, config.pipeline_settings());
            let cancel = CancellationToken::new();
            {
                let cancel = cancel.clone();
                tokio::spawn(async move {
                    if tokio::signal::ctrl_c().await.is_ok() {
                        eprintln!("[generate] interrupted; finishing in-flight work");
                        cancel.cancel();
                    }
                });
            }

            let session = coordinator.run(&brief, &cancel).await?;
            // Drops the dispatcher and with it the last trace sender.
            drop(coordinator);
            if let Some(worker) = trace_worker {
                worker.join()?;
            }

            pipeline::write_session(&out, &session)?;
            eprintln!("[generate] session written to {}", out.display());
            if let Some(dir) = site_dir {
                write_site(&dir, &session)?;
                eprintln!("[generate] {} files written under {}", session.artifacts.len(), dir.display());
            }
            eprintln!("[generate] {}", session.summary);
            if !session.is_done() {
                return Err(format!("pipeline ended in {:?}", session.state).into());
            }
        }
    }

    Ok(())
}

fn build_catalog(config: &HarnessConfig) -> Result<BackendCatalog, Box<dyn std::error::Error>> {
    let quality = match &config.quality_table {
        Some(path) => QualityTable::load(path)?,
        None => QualityTable::default(),
    };
    let source = Arc::new(OpenRouterAdapter::from_env()?);
    Ok(BackendCatalog::new(source, quality, config.catalog_settings()))
}

fn open_ledger(config: &HarnessConfig) -> Result<TrustLedger, Box<dyn std::error::Error>> {
    Ok(TrustLedger::open(config.trust_path())?.with_failure_margin(config.failure_margin)?)
}

fn print_catalog(snapshot: &CatalogSnapshot) {
    println!(
        "fetched {} ({} backends, task class {})",
        snapshot.fetched_at.to_rfc3339(),
        snapshot.backends.len(),
        snapshot.task_class
    );
    for b in &snapshot.backends {
        println!(
            "{:<50} {:<4} q={:.2} ctx={}",
            b.id,
            format!("{:?}", b.tier).to_lowercase(),
            b.quality_score,
            b.context_limit
        );
    }
}

fn read_json<T: serde::de::DeserializeOwned>(path: &Path) -> Result<T, Box<dyn std::error::Error>> {
    let raw = std::fs::read_to_string(path)?;
    Ok(serde_json::from_str(&raw)?)
}

/// Writes merged files, refusing paths that would escape `dir`.
fn write_site(dir: &Path, session: &pipeline::PipelineSession) -> Result<(), Box<dyn std::error::Error>> {
    for (rel, content) in &session.artifacts.files {
        let rel_path = Path::new(rel);
        if rel_path.is_absolute()
            || rel_path
                .components()
                .any(|c| matches!(c, std::path::Component::ParentDir))
        {
            return Err(format!("refusing to write outside site dir: {rel}").into());
        }
        let target = dir.join(rel_path);
        if let Some(parent) = target.parent() {
            std::fs::create_dir_all(parent)?;
        }
        std::fs::write(target, content)?;
    }
    Ok(())
}
