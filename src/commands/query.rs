//! Read-side commands: neighbours, recommend, scores

use anyhow::Result;
use serde_json::json;

use affinity::config::Config;
use affinity::model::{ItemId, UserId};
use affinity::query::{QueryService, ScoredItem};

fn service(config: &Config) -> Result<QueryService> {
    QueryService::open(&config.store.path, config.store.busy_timeout())
}

pub fn neighbours(config: &Config, item_id: ItemId, limit: usize, json: bool) -> Result<()> {
    let items = service(config)?.neighbours(item_id, limit)?;
    if json {
        println!(
            "{}",
            serde_json::to_string_pretty(&json!({ "itemId": item_id, "neighbours": items }))?
        );
    } else {
        print_ranked(&format!("Items similar to {}", item_id), &items);
    }
    Ok(())
}

pub fn recommend(config: &Config, user_id: UserId, limit: usize, json: bool) -> Result<()> {
    let items = service(config)?.recommend(user_id, limit)?;
    if json {
        println!(
            "{}",
            serde_json::to_string_pretty(&json!({ "userId": user_id, "recommendations": items }))?
        );
    } else {
        print_ranked(&format!("Recommendations for user {}", user_id), &items);
    }
    Ok(())
}

pub fn scores(config: &Config, item_ids: &[ItemId], json: bool) -> Result<()> {
    let scores = service(config)?.interaction_scores(item_ids)?;
    if json {
        let map: serde_json::Map<String, serde_json::Value> = scores
            .iter()
            .map(|(item, score)| (item.to_string(), json!(score)))
            .collect();
        println!("{}", serde_json::to_string_pretty(&map)?);
    } else {
        println!("Interaction scores");
        for (item, score) in &scores {
            println!("  {:>10}  {:.4}", item, score);
        }
    }
    Ok(())
}

fn print_ranked(title: &str, items: &[ScoredItem]) {
    println!("{}", title);
    if items.is_empty() {
        println!("  (none)");
        return;
    }
    for (rank, item) in items.iter().enumerate() {
        println!("  {:>3}. {:>10}  {:.4}", rank + 1, item.item_id, item.score);
    }
}
