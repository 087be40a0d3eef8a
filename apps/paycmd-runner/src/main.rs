mod dry_run;
mod surfaces;

use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use anyhow::{Context, Result};
use chrono::Utc;
use clap::Parser;
use paycmd_core::{
    Collaborators, LocalKeySigner, Orchestrator, OrchestratorConfig,
    OrchestratorError, SystemClock, ToolCatalog, ToolPlanner, store,
};

use crate::dry_run::{DryRunSwapVenue, DryRunTimelock, DryRunWallet};
use crate::surfaces::{FileCommandSource, HttpToolTransport, JsonlAuditSink};

#[derive(Parser, Debug)]
#[command(name = "paycmd-runner", about = "Poll a command file and run it through paycmd")]
struct Args {
    /// Command file, one command per line.
    #[arg(long, default_value = "commands.txt")]
    commands: PathBuf,

    /// Append-only JSONL audit log.
    #[arg(long, default_value = "paycmd-audit.jsonl")]
    audit_log: PathBuf,

    #[arg(long, default_value = "default")]
    scope: String,

    #[arg(long, default_value_t = 15)]
    interval_seconds: u64,

    /// Environment variable holding the hex secp256k1 signing key.
    #[arg(long, default_value = "PAYCMD_SIGNER_KEY")]
    signer_key_env: String,

    /// Sign carts for commands awaiting approval with the local key after every tick.
    #[arg(long)]
    auto_approve: bool,

    /// Run a single tick and exit.
    #[arg(long)]
    once: bool,
}

#[tokio::main]
async fn main() -> Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new("info")),
        )
        .init();

    let args = Args::parse();
    let config = OrchestratorConfig::from_env().context("load PAYCMD_* configuration")?;

    let signer_key = std::env::var(&args.signer_key_env)
        .with_context(|| format!("missing signing key in {}", args.signer_key_env))?;
    let signer = Arc::new(LocalKeySigner::from_hex(signer_key.trim()).context("parse signing key")?);

    let planner: Arc<dyn ToolPlanner> = match config.tool_catalog_path.as_deref() {
        Some(path) => Arc::new(
            ToolCatalog::load(path)
                .with_context(|| format!("load tool catalog {}", path.display()))?,
        ),
        None => {
            tracing::warn!("PAYCMD_TOOL_CATALOG not set; commands will run without paid tools");
            Arc::new(ToolCatalog::default())
        }
    };

    let orchestrator = Orchestrator::new(
        config,
        Collaborators {
            store: store::memory(),
            source: Arc::new(FileCommandSource::new(&args.commands)),
            signer,
            wallet: Arc::new(DryRunWallet),
            transport: Arc::new(HttpToolTransport::new()?),
            encryption: Arc::new(DryRunTimelock::default()),
            audit: Arc::new(JsonlAuditSink::new(&args.audit_log)),
            planner,
            swap_venue: Some(Arc::new(DryRunSwapVenue)),
            reflector: None,
            clock: Arc::new(SystemClock),
        },
    )?;

    tracing::info!(
        scope = %args.scope,
        commands = %args.commands.display(),
        audit_log = %args.audit_log.display(),
        "paycmd runner started"
    );

    let mut interval = tokio::time::interval(Duration::from_secs(args.interval_seconds.max(1)));
    loop {
        tokio::select! {
            _ = interval.tick() => {
                run_tick(&orchestrator, &args).await;
                if args.once {
                    break;
                }
            }
            _ = tokio::signal::ctrl_c() => {
                tracing::info!("shutdown requested");
                break;
            }
        }
    }
    Ok(())
}

async fn run_tick(orchestrator: &Orchestrator, args: &Args) {
    let report = match orchestrator.tick(&args.scope, Utc::now()).await {
        Ok(report) => report,
        Err(OrchestratorError::ScopeBusy(scope)) => {
            tracing::debug!(scope = %scope, "previous tick still running");
            return;
        }
        Err(error) => {
            tracing::warn!(code = error.code(), error = %error, "tick failed");
            return;
        }
    };

    for finished in &report.finished {
        match orchestrator
            .spend_summary(&args.scope, &finished.command_id)
            .await
        {
            Ok(summary) => tracing::info!(
                command_id = %finished.command_id,
                status = finished.status.as_str(),
                reason_code = ?finished.reason_code,
                spent_units = summary.spent_units,
                ceiling_units = summary.ceiling_units,
                "command finished"
            ),
            Err(error) => tracing::warn!(command_id = %finished.command_id, error = %error, "no spend summary"),
        }
    }

    if args.auto_approve {
        approve_waiting(orchestrator, &args.scope).await;
    }
}

async fn approve_waiting(orchestrator: &Orchestrator, scope: &str) {
    let waiting = match orchestrator.pending_approvals(scope).await {
        Ok(waiting) => waiting,
        Err(error) => {
            tracing::warn!(error = %error, "cannot list commands awaiting approval");
            return;
        }
    };
    for command in waiting {
        match orchestrator.request_approval(scope, &command.command_id).await {
            Ok(outcome) => tracing::info!(
                command_id = %command.command_id,
                approved = outcome.approved,
                signer = ?outcome.signer_address,
                "approval requested"
            ),
            Err(error) => tracing::warn!(
                command_id = %command.command_id,
                code = error.code(),
                error = %error,
                "approval failed"
            ),
        }
    }
}
