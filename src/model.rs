//! Core data model for the aggregation pipeline
//!
//! Ephemeral stream payloads (`ActionEvent`, `SimilarityMessage`) and the
//! durable rows derived from them (`InteractionRecord`, `PairwiseSimilarity`).

use anyhow::{bail, Result};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::fmt;

pub type UserId = i64;
pub type ItemId = i64;

/// Kind of interaction a user had with an item
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum ActionType {
    View,
    Register,
    Like,
}

impl ActionType {
    pub fn as_str(&self) -> &'static str {
        match self {
            ActionType::View => "VIEW",
            ActionType::Register => "REGISTER",
            ActionType::Like => "LIKE",
        }
    }

    pub fn from_str(s: &str) -> Option<Self> {
        match s.to_uppercase().as_str() {
            "VIEW" => Some(ActionType::View),
            "REGISTER" => Some(ActionType::Register),
            "LIKE" => Some(ActionType::Like),
            _ => None,
        }
    }

    /// All action types, weakest first
    pub fn all() -> &'static [ActionType] {
        &[ActionType::View, ActionType::Register, ActionType::Like]
    }
}

impl fmt::Display for ActionType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// A single user action as it arrives on the input stream
///
/// No uniqueness at this layer: duplicates and replays are expected.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ActionEvent {
    pub user_id: UserId,
    pub item_id: ItemId,
    pub action_type: ActionType,
    pub timestamp: DateTime<Utc>,
}

impl ActionEvent {
    pub fn new(
        user_id: UserId,
        item_id: ItemId,
        action_type: ActionType,
        timestamp: DateTime<Utc>,
    ) -> Self {
        Self {
            user_id,
            item_id,
            action_type,
            timestamp,
        }
    }

    pub fn encode(&self) -> Result<Vec<u8>> {
        Ok(serde_json::to_vec(self)?)
    }

    pub fn decode(payload: &[u8]) -> Result<Self> {
        Ok(serde_json::from_slice(payload)?)
    }
}

/// Durable (user, item) interaction, holding the strongest action seen so far
#[derive(Debug, Clone, PartialEq)]
pub struct InteractionRecord {
    pub user_id: UserId,
    pub item_id: ItemId,
    pub action_type: ActionType,
    pub weight: f64,
    pub timestamp: DateTime<Utc>,
}

/// Weight change produced by an upgrade (or first) action for a (user, item) pair
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct WeightDelta {
    pub user_id: UserId,
    pub item_id: ItemId,
    pub old_weight: f64,
    pub new_weight: f64,
    pub timestamp: DateTime<Utc>,
}

impl WeightDelta {
    /// `wNew - wOld`, the factor applied to dot products
    pub fn weight_change(&self) -> f64 {
        self.new_weight - self.old_weight
    }

    /// `wNew² - wOld²`, the change of the item's sum of squares
    pub fn square_change(&self) -> f64 {
        self.new_weight * self.new_weight - self.old_weight * self.old_weight
    }
}

/// Unordered item pair stored as (lower id, higher id)
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct ItemPair {
    first: ItemId,
    second: ItemId,
}

impl ItemPair {
    pub fn new(a: ItemId, b: ItemId) -> Result<Self> {
        if a == b {
            bail!("An item cannot be paired with itself ({})", a);
        }
        Ok(Self {
            first: a.min(b),
            second: a.max(b),
        })
    }

    pub fn first(&self) -> ItemId {
        self.first
    }

    pub fn second(&self) -> ItemId {
        self.second
    }
}

/// Persisted similarity aggregates for one canonical pair
#[derive(Debug, Clone, PartialEq)]
pub struct PairwiseSimilarity {
    pub pair: ItemPair,
    pub dot_product: f64,
    pub sum_squares_first: f64,
    pub sum_squares_second: f64,
    pub score: f64,
    pub updated_at: DateTime<Utc>,
}

impl PairwiseSimilarity {
    pub fn to_message(&self) -> SimilarityMessage {
        SimilarityMessage {
            item_a: self.pair.first(),
            item_b: self.pair.second(),
            score: self.score,
            updated_at: self.updated_at,
        }
    }
}

/// Outbound stream payload, one per changed pair, keyed by `item_a`
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SimilarityMessage {
    pub item_a: ItemId,
    pub item_b: ItemId,
    pub score: f64,
    pub updated_at: DateTime<Utc>,
}

impl SimilarityMessage {
    pub fn encode(&self) -> Result<Vec<u8>> {
        Ok(serde_json::to_vec(self)?)
    }

    pub fn decode(payload: &[u8]) -> Result<Self> {
        Ok(serde_json::from_slice(payload)?)
    }
}
