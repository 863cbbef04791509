//! Run command - consume actions until interrupted

use anyhow::{bail, Result};
use tracing::warn;

use affinity::config::Config;
use affinity::ingest::{self, WorkerReport};
use affinity::log;
use affinity::shutdown::{self, ShutdownSignal};

pub fn execute(config: &Config) -> Result<()> {
    let broker = log::open(&config.broker.address, config.store.busy_timeout())?;
    let signal = ShutdownSignal::new();
    let watcher = shutdown::watch_process_signals(signal.clone())?;

    println!(
        "🚀 Aggregating {} → {} (group {}, {} worker(s), {} broker)",
        config.consumer.input_topic,
        config.producer.output_topic,
        config.consumer.group_id,
        config.consumer.workers,
        broker.name()
    );
    println!("   Press Ctrl-C to stop\n");

    let result = ingest::run_workers(config, broker, &signal);

    // Releases the watcher thread as well
    signal.trigger();
    if watcher.join().is_err() {
        warn!("Signal watcher panicked");
    }

    let reports = result?;
    print_summary(&reports);

    let halted: Vec<&WorkerReport> = reports.iter().filter(|r| r.halted.is_some()).collect();
    if let Some(first) = halted.first() {
        bail!(
            "{} worker(s) halted; first: {}",
            halted.len(),
            first.halted.as_deref().unwrap_or_default()
        );
    }
    Ok(())
}

fn print_summary(reports: &[WorkerReport]) {
    println!("\n📊 Summary");
    for report in reports {
        println!(
            "   worker {}: {} processed ({} upgrades, {} ignored), {} pair updates, {} published, {} publish failures",
            report.worker,
            report.processed,
            report.upgrades,
            report.ignored,
            report.pairs_changed,
            report.emit.published,
            report.emit.failed
        );
        if report.dead_lettered > 0 {
            println!("      {} record(s) dead-lettered", report.dead_lettered);
        }
        if report.commit_failures > 0 {
            println!("      {} commit failure(s)", report.commit_failures);
        }
        for (tp, offset) in &report.committed {
            println!("      committed {} @ {}", tp, offset);
        }
    }
}
