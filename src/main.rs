use std::{path::PathBuf, process::ExitCode};

use clap::Parser;
use log::{debug, info};
use worker::RunArgs;

/// Trains a change detection model, one process per device.
///
/// The process layout comes from the launcher through `RANK`, `WORLD_SIZE`,
/// `LOCAL_RANK`, `MASTER_ADDR` and `MASTER_PORT`.
#[derive(Debug, Parser)]
#[command(version, about)]
struct Args {
    /// YAML run configuration.
    #[arg(long)]
    config: PathBuf,

    /// File listing the labeled training ids, one per line.
    #[arg(long)]
    labeled_id_path: PathBuf,

    /// Directory for checkpoints and metrics.
    #[arg(long)]
    save_path: PathBuf,

    /// Rendezvous port, overrides `MASTER_PORT`.
    #[arg(long)]
    port: Option<u16>,

    /// Accepted for launcher compatibility, `LOCAL_RANK` wins.
    #[arg(long)]
    local_rank: Option<usize>,
}

#[tokio::main]
async fn main() -> ExitCode {
    env_logger::Builder::from_env(env_logger::Env::default().default_filter_or("info")).init();

    let args = Args::parse();
    if let Some(local_rank) = args.local_rank {
        debug!(local_rank = local_rank; "--local-rank is ignored, LOCAL_RANK is read instead");
    }

    let run_args = RunArgs {
        config: args.config,
        labeled_id_path: args.labeled_id_path,
        save_path: args.save_path,
        port: args.port,
    };

    match worker::run(run_args).await {
        Ok(()) => {
            info!("done");
            ExitCode::SUCCESS
        }
        Err(e) => {
            eprintln!("error: {e}");
            ExitCode::FAILURE
        }
    }
}
