//! Send command - append one user action to the input topic

use anyhow::Result;
use chrono::{DateTime, Utc};

use affinity::config::Config;
use affinity::log;
use affinity::model::{ActionEvent, ActionType, ItemId, UserId};

pub fn execute(
    config: &Config,
    user_id: UserId,
    item_id: ItemId,
    action: ActionType,
    at: Option<DateTime<Utc>>,
) -> Result<()> {
    let broker = log::open(&config.broker.address, config.store.busy_timeout())?;
    broker.ensure_topic(&config.consumer.input_topic, config.broker.partitions)?;

    let event = ActionEvent::new(user_id, item_id, action, at.unwrap_or_else(Utc::now));
    let position = broker.append(&config.consumer.input_topic, user_id, &event.encode()?)?;

    println!(
        "✅ {} user={} item={} → {}-{} @ {}",
        action, user_id, item_id, config.consumer.input_topic, position.partition, position.offset
    );
    Ok(())
}
