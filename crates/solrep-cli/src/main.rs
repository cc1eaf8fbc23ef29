use std::path::{Path, PathBuf};

use anyhow::{Context, Result};
use chrono::Utc;
use clap::{Parser, Subcommand};
use solrep_core::{prerequisites_of, Report, SectionName};
use solrep_pipeline::{run_worker_loop, PipelineServices};
use solrep_web::AppState;
use tracing::{info, warn};
use tracing_subscriber::EnvFilter;

#[derive(Debug, Parser)]
#[command(name = "solrep")]
#[command(about = "Solicitation report section pipeline")]
struct Cli {
    #[command(subcommand)]
    command: Commands,
}

#[derive(Debug, Subcommand)]
enum Commands {
    /// Create the Postgres tables.
    Migrate,
    #[command(subcommand)]
    Report(ReportCommand),
    /// Dispatch sections of a report; with no sections, every section without prerequisites.
    Dispatch {
        report_id: String,
        sections: Vec<SectionName>,
        #[arg(long)]
        force: bool,
    },
    /// Print a report with its overall status.
    Status { report_id: String },
    /// Process queued section jobs.
    Worker {
        /// Drain a single batch and exit.
        #[arg(long)]
        once: bool,
    },
    /// Serve the HTTP API.
    Serve,
    /// Serve the HTTP API and run a worker in the same process.
    Run,
}

#[derive(Debug, Subcommand)]
enum ReportCommand {
    /// Store source documents and create a report referencing them.
    Create {
        #[arg(long)]
        project: String,
        #[arg(long)]
        opportunity: String,
        #[arg(long)]
        id: Option<String>,
        #[arg(required = true)]
        files: Vec<PathBuf>,
    },
}

fn init_tracing() {
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info,solrep=debug")),
        )
        .init();
}

#[tokio::main]
async fn main() -> Result<()> {
    init_tracing();
    let cli = Cli::parse();
    let services = PipelineServices::connect_from_env().await?;

    match cli.command {
        Commands::Migrate => services.migrate().await?,
        Commands::Report(ReportCommand::Create {
            project,
            opportunity,
            id,
            files,
        }) => {
            warn_if_ephemeral(&services);
            let id = id.unwrap_or_else(|| format!("{project}-{opportunity}"));
            let report = create_report(&services, id, project, opportunity, &files).await?;
            println!("{}", serde_json::to_string_pretty(&report)?);
        }
        Commands::Dispatch {
            report_id,
            sections,
            force,
        } => {
            warn_if_ephemeral(&services);
            let sections = if sections.is_empty() {
                SectionName::ALL
                    .into_iter()
                    .filter(|s| prerequisites_of(*s).is_empty())
                    .collect()
            } else {
                sections
            };
            for section in sections {
                let outcome = services
                    .dispatcher
                    .dispatch(&report_id, section, force)
                    .await?;
                println!(
                    "{section}: status={} enqueued={}",
                    outcome.status, outcome.enqueued
                );
            }
        }
        Commands::Status { report_id } => {
            let report = services.store.require_report(&report_id).await?;
            println!("overall: {}", report.overall_status());
            for section in SectionName::ALL {
                let record = report.section(section);
                let error = record.and_then(|r| r.error.as_deref()).unwrap_or("");
                println!(
                    "{:>12}  {:<12} {error}",
                    section.as_str(),
                    report.section_status(section).as_str()
                );
            }
        }
        Commands::Worker { once } => {
            warn_if_ephemeral(&services);
            let worker = services.worker().await?;
            if once {
                let batch = worker
                    .drain_once(services.queue.as_ref(), services.config.worker_batch_size)
                    .await?;
                println!(
                    "processed={} failed={}",
                    batch.processed,
                    batch.failed_message_ids.len()
                );
            } else {
                run_worker_loop(
                    worker,
                    services.queue.clone(),
                    services.config.worker_batch_size,
                    services.config.poll_interval(),
                    shutdown_signal(),
                )
                .await;
            }
        }
        Commands::Serve => {
            solrep_web::serve(AppState::from_services(&services), services.config.web_port).await?;
        }
        Commands::Run => {
            let worker = services.worker().await?;
            let worker_task = tokio::spawn(run_worker_loop(
                worker,
                services.queue.clone(),
                services.config.worker_batch_size,
                services.config.poll_interval(),
                shutdown_signal(),
            ));
            let state = AppState::from_services(&services);
            tokio::select! {
                served = solrep_web::serve(state, services.config.web_port) => served?,
                _ = shutdown_signal() => info!("shutting down"),
            }
            worker_task.await.context("joining worker")?;
        }
    }

    Ok(())
}

async fn create_report(
    services: &PipelineServices,
    id: String,
    project: String,
    opportunity: String,
    files: &[PathBuf],
) -> Result<Report> {
    let mut keys = Vec::with_capacity(files.len());
    for path in files {
        let text = tokio::fs::read_to_string(path)
            .await
            .with_context(|| format!("reading {}", path.display()))?;
        let stored = services
            .objects
            .put_text("sources", extension_of(path), &text)
            .await
            .with_context(|| format!("storing {}", path.display()))?;
        info!(key = %stored.key, bytes = stored.byte_size, deduplicated = stored.deduplicated, "stored source document");
        keys.push(stored.key);
    }
    let report = Report::new(id, project, opportunity, keys, Utc::now());
    services
        .store
        .create_report(&report)
        .await
        .with_context(|| format!("creating report {}", report.id))?;
    Ok(report)
}

fn extension_of(path: &Path) -> &str {
    path.extension().and_then(|e| e.to_str()).unwrap_or("txt")
}

fn warn_if_ephemeral(services: &PipelineServices) {
    if services.config.database_url.is_none() {
        warn!("DATABASE_URL is not set; state written by this command is lost when it exits (use `run`)");
    }
}

async fn shutdown_signal() {
    if let Err(err) = tokio::signal::ctrl_c().await {
        warn!(error = %err, "could not listen for ctrl-c");
        std::future::pending::<()>().await;
    }
}
