use anyhow::Result;
use clap::Parser;
use itertools::Itertools;
use log::info;
use std::path;

use tracetune::measure::callback::{RecordToFile, RemoveBuildArtifact};
use tracetune::measure::local::{LocalBuilder, LocalRunner};
use tracetune::randstate::RandState;
use tracetune::scheduler::{TaskScheduler, TuneContext};
use tracetune::search::MutationSearch;
use tracetune::target::{Target, TargetKind};
use tracetune::workload;

#[derive(Parser)]
#[command(author, version, about, long_about = None)]
struct Args {
    /// Random seed for the whole tuning run
    #[arg(long, default_value_t = 42)]
    seed: u64,

    /// Trial budget per task
    #[arg(long, default_value_t = 64)]
    trials: usize,

    /// Candidates measured per round
    #[arg(long, default_value_t = 8)]
    batch: usize,

    /// Target kind (see `TargetKind::list`)
    #[arg(long, default_value = "cpu")]
    target: String,

    /// Append measurement records to this JSONL file
    #[arg(long)]
    record: Option<path::PathBuf>,

    /// Keep build artifacts instead of deleting them after measurement
    #[arg(long)]
    keep_artifacts: bool,

    #[command(subcommand)]
    workload: Workload,
}

#[derive(clap::Subcommand)]
enum Workload {
    #[command(about = "Tune a matrix multiplication")]
    Matmul {
        #[arg(default_value = "64")]
        size: i64,
    },
    #[command(about = "Tune a convolution")]
    Conv {
        #[arg(long, short, default_value = "1")]
        batch: i64,
        #[arg(long, default_value = "4")]
        channels: i64,
        #[arg(long, default_value = "8")]
        filters: i64,
        #[arg(long, default_value = "3")]
        filters_size: i64,
        #[arg(default_value = "32")]
        size: i64,
    },
}

fn main() -> Result<()> {
    env_logger::init();
    let args = Args::parse();

    let (name, mod_) = match &args.workload {
        Workload::Matmul { size } => ("matmul".to_owned(), workload::matmul(*size, *size, *size)),
        Workload::Conv {
            batch,
            channels,
            filters,
            filters_size,
            size,
        } => (
            "conv".to_owned(),
            workload::conv2d(*batch, *channels, *filters, *size, *filters_size),
        ),
    };
    let target = Target::new(&args.target).map_err(|e| {
        anyhow::anyhow!("{} (known kinds: {})", e, TargetKind::list().iter().join(", "))
    })?;

    let mut scheduler = TaskScheduler::new(Box::new(LocalBuilder::new()), Box::new(LocalRunner));
    if let Some(record_path) = &args.record {
        scheduler.add_callback(Box::new(RecordToFile::new(record_path)?));
    }
    if !args.keep_artifacts {
        scheduler.add_callback(Box::<RemoveBuildArtifact>::default());
    }

    let mut rand = RandState::new(args.seed);
    let space = workload::schedule_skeleton(&mod_)?;
    let ctx = TuneContext::new(name, mod_, target, space, rand.fork(), args.trials)
        .with_batch_size(args.batch);
    scheduler.add_task(ctx, Box::<MutationSearch>::default());

    let start_time = std::time::Instant::now();
    let reports = scheduler.tune()?;
    info!("tuning took {:?}", start_time.elapsed());

    for report in &reports {
        match report.best_latency {
            Some(latency) => println!(
                "{}: {} after {} trials, best {:.3} us",
                report.task_name,
                report.state,
                report.trials,
                latency * 1e6
            ),
            None => println!(
                "{}: {} after {} trials, no successful measurement",
                report.task_name, report.state, report.trials
            ),
        }
    }
    Ok(())
}
