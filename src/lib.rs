//! Streaming item-to-item similarity aggregator
//!
//! Consumes user actions (view, register, like) from a partitioned log, keeps
//! the strongest action per (user, item), maintains cosine similarity between
//! items incrementally and publishes every changed score.

pub mod config;
pub mod db;
pub mod emitter;
pub mod ingest;
pub mod log;
pub mod logging;
pub mod model;
pub mod paths;
pub mod pipeline;
pub mod query;
pub mod shutdown;
pub mod similarity;
pub mod store;
pub mod weights;

// Re-export commonly used types
pub use config::Config;
pub use model::{ActionEvent, ActionType, ItemPair, PairwiseSimilarity, SimilarityMessage};
pub use pipeline::Aggregator;
pub use query::QueryService;
pub use store::Store;
