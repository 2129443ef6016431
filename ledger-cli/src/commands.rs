//! Command handlers for the CLI

use anyhow::{anyhow, bail, Context};
use ledger_engine::{
    EngineConfig, JobKind, LedgerEngine, LedgerStore, MemoryLedgerStore, PgLedgerStore, TriggerOutcome,
};
use std::sync::Arc;
use tracing::{info, warn};

use crate::{Cli, Commands, MEMORY_URL};

type CmdResult = anyhow::Result<()>;

fn load_config(cli: &Cli) -> EngineConfig {
    let mut config = if cli.dev {
        EngineConfig::development()
    } else {
        EngineConfig::from_env()
    };
    config.store.database_url = cli.database_url.clone();
    config
}

pub async fn run_command(cli: Cli) -> CmdResult {
    let config = load_config(&cli);
    let in_memory = cli.database_url == MEMORY_URL;

    match cli.command {
        Commands::InitSchema => {
            if in_memory {
                bail!("init-schema needs a PostgreSQL --database-url");
            }
            println!("Initializing ledger schema...");
            let store = PgLedgerStore::connect(&config.store)
                .await
                .context("connecting to the ledger store")?;
            store.init_schema().await?;
            println!("Ledger schema initialized successfully.");
            Ok(())
        }

        Commands::Jobs => {
            for kind in JobKind::all() {
                println!("{:<20} every {}s", kind.as_str(), config.schedule.interval(kind).as_secs());
            }
            Ok(())
        }

        Commands::Run => {
            if in_memory {
                warn!("Running against an in-memory store; nothing will be persisted");
                run_engine(build(config, Arc::new(MemoryLedgerStore::new())).await?).await
            } else {
                let store = PgLedgerStore::connect(&config.store).await?;
                run_engine(build(config, Arc::new(store)).await?).await
            }
        }

        Commands::Trigger { job } => {
            let kind = JobKind::parse(&job).ok_or_else(|| {
                let known: Vec<&str> = JobKind::all().iter().map(|k| k.as_str()).collect();
                anyhow!("unknown job '{}', expected one of: {}", job, known.join(", "))
            })?;
            if in_memory {
                trigger_job(build(config, Arc::new(MemoryLedgerStore::new())).await?, kind).await
            } else {
                let store = PgLedgerStore::connect(&config.store).await?;
                trigger_job(build(config, Arc::new(store)).await?, kind).await
            }
        }
    }
}

async fn build<S: LedgerStore + 'static>(config: EngineConfig, store: Arc<S>) -> anyhow::Result<LedgerEngine<S>> {
    let engine = LedgerEngine::builder()
        .config(config)
        .store(store)
        .build()
        .await
        .context("building the ledger engine")?;
    Ok(engine)
}

/// Start the engine and block until Ctrl-C
async fn run_engine<S: LedgerStore + 'static>(engine: LedgerEngine<S>) -> CmdResult {
    engine.start().await?;
    info!("Ledger engine running, press Ctrl-C to stop");

    tokio::signal::ctrl_c().await.context("waiting for Ctrl-C")?;
    info!("Shutdown requested");
    engine.stop().await;

    for status in engine.job_status().await {
        info!(
            job = %status.kind,
            runs = status.runs,
            failures = status.failures,
            skipped = status.skipped,
            processed = status.totals.processed,
            "Job summary"
        );
    }
    Ok(())
}

async fn trigger_job<S: LedgerStore + 'static>(engine: LedgerEngine<S>, kind: JobKind) -> CmdResult {
    engine.context().store.ping().await?;
    match engine.trigger(kind).await? {
        TriggerOutcome::Ran(report) => {
            println!(
                "{}: processed {}, succeeded {}, failed {}",
                kind, report.processed, report.succeeded, report.failed
            );
        }
        TriggerOutcome::Skipped => println!("{}: already running, skipped", kind),
    }

    // Dispatch only fills the queue; distribute what it found right away
    if kind == JobKind::ReferralDispatch {
        let report = engine.drain_referrals().await;
        println!(
            "referral worker: distributed {}, failed {}",
            report.succeeded, report.failed
        );
    }
    Ok(())
}
