//! runq - run forward-model realizations through an HPC scheduler.

use clap::Parser;
use miette::{miette, IntoDiagnostic, Result};
use runq_cli::{Args, DriverKind};
use runq_core::{Driver, QueueDriver};
use runq_local::LocalDriver;
use runq_lsf::LsfDriver;
use runq_queue::{Callbacks, JobNode, JobQueue, QueueConfig, QueueSummary};
use runq_rsh::RshDriver;
use runq_torque::TorqueDriver;
use std::sync::Arc;
use std::time::Duration;
use tracing_subscriber::EnvFilter;

fn build_driver(kind: DriverKind) -> QueueDriver {
    match kind {
        DriverKind::Local => QueueDriver::new(LocalDriver::new()),
        DriverKind::Lsf => QueueDriver::new(LsfDriver::new()),
        DriverKind::Torque => QueueDriver::new(TorqueDriver::new()),
        DriverKind::Rsh => QueueDriver::new(RshDriver::new()),
    }
}

fn callbacks() -> Callbacks {
    Callbacks {
        on_success: Some(Arc::new(|node: &JobNode| {
            println!("{}: done", node.spec().job_name);
        })),
        on_retry: Some(Arc::new(|node: &JobNode| {
            println!("{}: exited, resubmitting", node.spec().job_name);
        })),
        on_failure: Some(Arc::new(|node: &JobNode| {
            match node.error() {
                Some(error) => println!("{}: failed: {}", node.spec().job_name, error),
                None => println!("{}: failed", node.spec().job_name),
            }
        })),
    }
}

fn print_summary(summary: &QueueSummary, json: bool) -> Result<()> {
    if json {
        println!("{}", serde_json::to_string_pretty(summary).into_diagnostic()?);
    } else {
        println!(
            "{} jobs: {} done, {} failed, {} killed",
            summary.total, summary.done, summary.failed, summary.killed
        );
    }
    Ok(())
}

#[tokio::main]
async fn main() -> Result<()> {
    let args = Args::parse();

    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")),
        )
        .with_writer(std::io::stderr)
        .init();

    let mut driver = build_driver(args.driver);
    if args.list_options {
        for key in driver.option_keys() {
            println!("{}", key);
        }
        return Ok(());
    }

    for (key, value) in &args.options {
        if !driver.set_option(key, value) {
            return Err(miette!(
                "Invalid option {}={} for the {} driver",
                key,
                value,
                driver.name()
            ));
        }
    }

    let config = QueueConfig {
        max_submit: args.max_submit,
        max_running: args.max_running,
        poll_interval: Duration::from_secs(args.poll_interval),
    };
    let mut queue = JobQueue::new(driver, config).with_callbacks(callbacks());
    for spec in args.job_specs() {
        queue.add_job(spec);
    }

    let outcome = tokio::select! {
        result = queue.run() => Some(result),
        _ = tokio::signal::ctrl_c() => None,
    };

    let summary = match outcome {
        Some(result) => result.into_diagnostic()?,
        None => {
            tracing::warn!("interrupted, killing jobs");
            queue.kill_all().await;
            queue.summary()
        }
    };

    print_summary(&summary, args.json)?;
    if summary.failed > 0 {
        return Err(miette!("{} of {} jobs failed", summary.failed, summary.total));
    }
    Ok(())
}
