//! Status command - consumer lag and store size

use anyhow::Result;
use serde::Serialize;

use affinity::config::Config;
use affinity::log::{self, TopicPartition};
use affinity::store::Store;

#[derive(Debug, Serialize)]
#[serde(rename_all = "camelCase")]
struct PartitionStatus {
    partition: u32,
    committed: Option<u64>,
    end_offset: u64,
    lag: u64,
}

#[derive(Debug, Serialize)]
#[serde(rename_all = "camelCase")]
struct Status {
    group_id: String,
    topic: String,
    partitions: Vec<PartitionStatus>,
    interactions: usize,
    pairs: usize,
}

pub fn execute(config: &Config, json: bool) -> Result<()> {
    let broker = log::open(&config.broker.address, config.store.busy_timeout())?;
    let store = Store::open(&config.store.path, config.store.busy_timeout())?;
    let topic = &config.consumer.input_topic;
    let group_id = &config.consumer.group_id;

    let mut partitions = Vec::new();
    for partition in 0..broker.partition_count(topic)?.unwrap_or(0) {
        let tp = TopicPartition::new(topic.clone(), partition);
        let committed = broker.committed(group_id, &tp)?;
        let end_offset = broker.end_offset(&tp)?;
        partitions.push(PartitionStatus {
            partition,
            committed,
            end_offset,
            lag: end_offset.saturating_sub(committed.unwrap_or(0)),
        });
    }

    let status = Status {
        group_id: group_id.clone(),
        topic: topic.clone(),
        partitions,
        interactions: store.interactions().count()?,
        pairs: store.similarity().pair_count()?,
    };

    if json {
        println!("{}", serde_json::to_string_pretty(&status)?);
        return Ok(());
    }

    println!("📊 Group {} on {}", status.group_id, status.topic);
    if status.partitions.is_empty() {
        println!("   topic not created yet");
    }
    for p in &status.partitions {
        let committed = p
            .committed
            .map(|c| c.to_string())
            .unwrap_or_else(|| "-".to_string());
        println!(
            "   partition {:>3}  committed {:>8}  end {:>8}  lag {:>8}",
            p.partition, committed, p.end_offset, p.lag
        );
    }
    println!(
        "   store: {} interaction(s), {} pair(s)",
        status.interactions, status.pairs
    );
    Ok(())
}
