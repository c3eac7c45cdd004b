use anyhow::Context;
use clap::Parser;
use fxcore::config::BrokerBackend;
use fxcore::pipeline::StopSignal;
use std::fs::{self, OpenOptions};
use std::io::Write;
use std::path::{Path, PathBuf};
use std::thread;
use tokio::runtime::Builder as TokioBuilder;
use tokio::signal;
use workflow::config::WorkflowConfig;
use workflow::runner::{Role, RunSummary, Runner};

mod generator;
mod workflow;

#[derive(Parser)]
#[command(author, version, about = "Offline driver for the train-processing core")]
struct Args {
    /// Load a workflow config from YAML
    #[arg(long)]
    workflow: Option<PathBuf>,
    #[arg(long, default_value_t = 10)]
    trains: u64,
    #[arg(long, default_value_t = 0)]
    seed: u64,
    /// Deliver every n-th train with a module missing
    #[arg(long)]
    malformed_every: Option<u64>,
    /// Append the JSON run summary to this file
    #[arg(long)]
    report: Option<PathBuf>,
    /// Keep feeding trains at 10 Hz until Ctrl+C
    #[arg(long, default_value_t = false)]
    serve: bool,
    /// Use the Redis broker from the pipeline config instead of an in-process one
    #[arg(long, default_value_t = false)]
    redis: bool,
    #[arg(long, value_enum, default_value_t = Role::All)]
    role: Role,
}

fn write_report(path: &Path, summary: &RunSummary) -> anyhow::Result<()> {
    if let Some(parent) = path.parent() {
        fs::create_dir_all(parent)?;
    }
    let mut file = OpenOptions::new()
        .create(true)
        .append(true)
        .open(path)
        .with_context(|| format!("opening report {}", path.display()))?;
    serde_json::to_writer(&mut file, summary)?;
    file.write_all(b"\n")?;
    Ok(())
}

fn main() -> anyhow::Result<()> {
    env_logger::init();
    let args = Args::parse();

    let mut workflow_config = if let Some(path) = args.workflow {
        WorkflowConfig::load(path)?
    } else {
        WorkflowConfig::from_args(args.trains, args.seed, args.malformed_every)
    };
    if args.redis {
        workflow_config.pipeline.broker.backend = BrokerBackend::Redis;
    }
    let runner = Runner::new(workflow_config).with_role(args.role);

    if args.role == Role::Control {
        runner.publish_control()?;
        println!("Control script published");
        return Ok(());
    }

    let summary = if args.serve {
        let stop = StopSignal::new();
        let worker_stop = stop.clone();
        let serving = thread::spawn(move || runner.serve(&worker_stop));
        log::info!("feeding trains (Ctrl+C to stop)...");

        let runtime = TokioBuilder::new_current_thread()
            .enable_all()
            .build()
            .context("creating runtime for signal handling")?;
        runtime.block_on(async {
            signal::ctrl_c().await.context("awaiting Ctrl+C to exit")?;
            Ok::<(), anyhow::Error>(())
        })?;
        stop.raise();
        serving
            .join()
            .map_err(|_| anyhow::anyhow!("train feeder panicked"))??
    } else {
        runner.execute()?
    };

    println!(
        "Run -> processed {}, invalid {}, dropped {}, control errors {}",
        summary.metrics.processed,
        summary.metrics.invalid,
        summary.metrics.dropped,
        summary.metrics.control_errors
    );
    for train in &summary.trains {
        match &train.invalid_stage {
            Some(reason) => println!("  train {} invalid ({reason})", train.train_id),
            None => println!(
                "  train {} kept {} pulses, fom {:?}, moving fom {:?}",
                train.train_id, train.kept_pulses, train.fom, train.moving_fom
            ),
        }
    }

    if let Some(path) = &args.report {
        write_report(path, &summary)?;
    }

    Ok(())
}
