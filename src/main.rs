use std::path::PathBuf;

use anyhow::{Context, Result};
use clap::{Parser, Subcommand};
use tokio_util::sync::CancellationToken;

use bde_scheduler::api::job_dto::JobSubmissionDto;
use bde_scheduler::api::topology_dto::TopologyDto;
use bde_scheduler::domain::scheduler::handle::spawn_periodic_timers;
use bde_scheduler::domain::scheduler::inbound::spawn_inbound_listener;
use bde_scheduler::domain::scheduler::{self, SchedulerContext};
use bde_scheduler::loader::parser::parse_json_file;
use bde_scheduler::{build_scheduler_context, load_config, logger};

#[derive(Debug, Parser)]
#[command(name = "bde-scheduler", version, about = "Bulk data transfer scheduler")]
struct Cli {
    #[command(subcommand)]
    command: Command,
}

#[derive(Debug, Subcommand)]
enum Command {
    /// Runs the scheduler until interrupted.
    Run {
        #[arg(long)]
        config: PathBuf,
        #[arg(long)]
        topology: PathBuf,
        /// Job submission files to enqueue at startup.
        #[arg(long = "submit")]
        submissions: Vec<PathBuf>,
    },
    /// Parses the configuration and topology files and exits.
    Check {
        #[arg(long)]
        config: PathBuf,
        #[arg(long)]
        topology: PathBuf,
    },
}

fn main() -> Result<()> {
    let cli = Cli::parse();
    logger::init();

    match cli.command {
        Command::Run { config, topology, submissions } => {
            let ctx = build_scheduler_context(&config, &topology)
                .with_context(|| format!("could not build scheduler from {} and {}", config.display(), topology.display()))?;

            let runtime = tokio::runtime::Builder::new_multi_thread()
                .worker_threads(ctx.config.worker_threads)
                .enable_all()
                .build()
                .context("could not start the async runtime")?;
            runtime.block_on(run(ctx, submissions))
        }
        Command::Check { config, topology } => {
            let parsed = load_config(&config).with_context(|| format!("invalid configuration {}", config.display()))?;
            let topology: TopologyDto = parse_json_file(&topology).with_context(|| format!("invalid topology {}", topology.display()))?;
            log::info!(
                "Configuration OK ({} authentication, group size {} bytes); topology OK (site {}, {} DTN(s), launcher {})",
                parsed.transfer_auth.mode(),
                parsed.group_size,
                topology.local_site,
                topology.dtns.len(),
                topology.launcher_queue.as_deref().unwrap_or("not registered")
            );
            Ok(())
        }
    }
}

async fn run(ctx: SchedulerContext, submissions: Vec<PathBuf>) -> Result<()> {
    let (schedule_interval, rate_interval) = (ctx.config.schedule_interval, ctx.config.rate_interval);
    let (handlers, inbox, queue) = (ctx.local_handlers.clone(), ctx.inbox.clone(), ctx.inbound_queue());
    let handle = scheduler::start(ctx);

    for path in submissions {
        let submission: JobSubmissionDto = parse_json_file(&path).with_context(|| format!("could not read submission {}", path.display()))?;
        match handle.submit(submission).await {
            Ok(id) => log::info!("Submitted {} as RawJob {}", path.display(), id),
            Err(e) => log::error!("Submission {} rejected: {}", path.display(), e),
        }
    }

    let shutdown = CancellationToken::new();
    let mut tasks = spawn_periodic_timers(&handle, schedule_interval, rate_interval, shutdown.clone());
    match inbox {
        Some(inbox) => tasks.push(spawn_inbound_listener(handle.clone(), handlers, inbox, queue, shutdown.clone())),
        None => log::warn!("No command inbox configured; launcher status reports will not be received"),
    }
    log::info!("Scheduler running (schedule every {:?}, rates every {:?}); press Ctrl-C to stop", schedule_interval, rate_interval);

    tokio::signal::ctrl_c().await.context("could not listen for Ctrl-C")?;
    log::info!("Interrupt received, stopping");

    shutdown.cancel();
    for task in tasks {
        if let Err(e) = task.await {
            log::warn!("Background task ended abnormally: {}", e);
        }
    }
    handle.shutdown().await.context("scheduler lane did not shut down cleanly")?;
    Ok(())
}
