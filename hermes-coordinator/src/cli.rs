//! CLI surface (§6.5): `run`, `validate`, `list-signals`.
use std::path::PathBuf;

use anyhow::anyhow;
use clap::{Parser, Subcommand};
use hermes_core::config::Config;
use hermes_core::error::{HermesErrorKind, HermesResult, ResultExt};
use hermes_core::segment::BackplaneSegment;
use tokio::signal::unix::{signal, SignalKind};

use crate::process_manager::ProcessManager;
use crate::scheduler::Scheduler;

#[derive(Parser)]
#[clap(name = "hermes", about = "Simulation orchestration platform")]
pub struct Cli {
    #[clap(subcommand)]
    pub command: Command,
}

#[derive(Subcommand)]
pub enum Command {
    /// Construct the segment, spawn modules, stage, run the scheduler, shut down.
    Run {
        config: PathBuf,
        /// Override the segment name (default: the config file's stem).
        #[clap(long)]
        segment: Option<String>,
    },
    /// Run every config cross-check; exit non-zero with a structured error on
    /// any failure.
    Validate { config: PathBuf },
    /// Attach read-only to a running segment and print its directory.
    ListSignals {
        #[clap(long)]
        segment: String,
    },
}

fn segment_name_for(config_path: &std::path::Path, override_name: Option<String>) -> String {
    override_name.unwrap_or_else(|| {
        format!(
            "/hermes-{}",
            config_path
                .file_stem()
                .and_then(|s| s.to_str())
                .unwrap_or("sim")
        )
    })
}

pub async fn run(command: Command) -> HermesResult<()> {
    match command {
        Command::Run { config, segment } => cmd_run(&config, segment).await,
        Command::Validate { config } => cmd_validate(&config),
        Command::ListSignals { segment } => cmd_list_signals(&segment),
    }
}

async fn cmd_run(config_path: &std::path::Path, segment_override: Option<String>) -> HermesResult<()> {
    let config = Config::load(config_path)?;
    let segment_name = segment_name_for(config_path, segment_override);

    let manager = ProcessManager::build(&config, &segment_name)?;
    let mut scheduler = Scheduler::new(
        manager,
        config.execution.dt_ns(),
        config.execution.mode,
        config.execution.end_time_ns,
    );

    scheduler.stage().await?;

    let handle = scheduler.handle();
    tokio::spawn(async move {
        let mut sigint = signal(SignalKind::interrupt()).expect("installing SIGINT handler");
        let mut sigterm = signal(SignalKind::terminate()).expect("installing SIGTERM handler");
        tokio::select! {
            _ = sigint.recv() => log::info!("received SIGINT, stopping scheduler"),
            _ = sigterm.recv() => log::info!("received SIGTERM, stopping scheduler"),
        }
        handle.stop();
    });

    let run_result = scheduler
        .run(|frame, time_ns| {
            log::debug!(target: "hermes::scheduler", "frame {frame} ({time_ns} ns)");
        })
        .await;

    scheduler.shutdown(std::time::Duration::from_secs(2), std::time::Duration::from_secs(1));

    run_result
}

fn cmd_validate(config_path: &std::path::Path) -> HermesResult<()> {
    Config::load(config_path)?;
    println!("{} is valid", config_path.display());
    Ok(())
}

fn cmd_list_signals(segment_name: &str) -> HermesResult<()> {
    let segment = BackplaneSegment::attach(segment_name)
        .map_err(|e| anyhow!("attaching to segment {segment_name:?}: {e}"))
        .typ(HermesErrorKind::SharedMemory)?;

    for entry in segment.directory() {
        println!(
            "{:<40} {:?} writable={} published={} offset={}",
            entry.name, entry.data_type, entry.flags.writable, entry.flags.published, entry.slot_offset
        );
    }
    Ok(())
}
