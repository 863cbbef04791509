//! Rebuild command - recompute similarity aggregates from interactions
//!
//! `--verify` only compares; without it the stored norms and pairs are
//! replaced in one transaction. Stop the aggregator first or accept that
//! it waits on the write lock meanwhile.

use anyhow::{bail, Result};
use chrono::Utc;
use serde_json::json;

use affinity::config::Config;
use affinity::model::{ItemId, ItemPair};
use affinity::similarity::rebuild::{self, DriftReport};
use affinity::store::Store;

/// Maximum absolute difference treated as float noise
const TOLERANCE: f64 = 1e-9;

pub fn execute(config: &Config, verify_only: bool, json: bool) -> Result<()> {
    let mut store = Store::open(&config.store.path, config.store.busy_timeout())?;

    if verify_only {
        let report = rebuild::verify(store.connection(), TOLERANCE)?;
        if json {
            println!("{}", serde_json::to_string_pretty(&report_json(&report))?);
        } else {
            print_report(&report);
        }
        if !report.is_clean() {
            bail!("Stored aggregates drifted from the interaction table");
        }
        return Ok(());
    }

    println!("🔄 Rebuilding similarity aggregates");
    let tx = store.transaction()?;
    let closed = rebuild::rewrite(&tx, Utc::now())?;
    tx.commit()?;
    println!(
        "✅ Rebuilt {} item norm(s) and {} pair(s)",
        closed.sum_squares.len(),
        closed.dot_products.len()
    );
    Ok(())
}

fn report_json(report: &DriftReport) -> serde_json::Value {
    json!({
        "items": report.items,
        "pairs": report.pairs,
        "clean": report.is_clean(),
        "driftedPairs": pair_ids(&report.drifted_pairs),
        "missingPairs": pair_ids(&report.missing_pairs),
        "driftedNorms": report.drifted_norms,
        "maxScoreDrift": report.max_score_drift,
    })
}

fn pair_ids(pairs: &[ItemPair]) -> Vec<[ItemId; 2]> {
    pairs.iter().map(|p| [p.first(), p.second()]).collect()
}

fn print_report(report: &DriftReport) {
    println!("🔍 Verified {} item(s), {} pair(s)", report.items, report.pairs);
    println!("   max score drift: {:e}", report.max_score_drift);
    if report.is_clean() {
        println!("✅ Incremental aggregates match the closed form");
        return;
    }
    for pair in &report.missing_pairs {
        println!("   missing pair ({}, {})", pair.first(), pair.second());
    }
    for pair in &report.drifted_pairs {
        println!("   drifted pair ({}, {})", pair.first(), pair.second());
    }
    for item in &report.drifted_norms {
        println!("   drifted norm of item {}", item);
    }
}
