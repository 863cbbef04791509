//! Filesystem layout for affinity.
//!
//! This module only says WHERE data lives. No I/O, no validation.
//!
//! ```text
//! ~/.affinity/
//! └── config.toml              # User-level config
//!
//! project/.affinity/
//! ├── config.toml              # Project config (wins over user level)
//! └── data/                    # Derived, rebuildable from the log
//!     ├── store.db             # Interactions + similarity aggregates
//!     └── log.db               # Local partitioned log
//! ```

use std::path::PathBuf;

/// User's affinity home directory: `~/.affinity/`
pub fn affinity_home() -> PathBuf {
    dirs::home_dir()
        .unwrap_or_else(|| PathBuf::from("."))
        .join(".affinity")
}

/// User-level config file: `~/.affinity/config.toml`
pub fn config_path() -> PathBuf {
    affinity_home().join("config.toml")
}

/// Project-relative paths (`.affinity/` in the working directory)
pub mod project {
    use super::*;

    const AFFINITY_DIR: &str = ".affinity";

    pub fn affinity_dir() -> PathBuf {
        PathBuf::from(AFFINITY_DIR)
    }

    /// Project config: `.affinity/config.toml`
    pub fn config_path() -> PathBuf {
        affinity_dir().join("config.toml")
    }

    /// Derived data: `.affinity/data/`
    pub fn data_dir() -> PathBuf {
        affinity_dir().join("data")
    }

    /// Interaction and similarity store: `.affinity/data/store.db`
    pub fn store_db() -> PathBuf {
        data_dir().join("store.db")
    }

    /// Local partitioned log: `.affinity/data/log.db`
    pub fn log_db() -> PathBuf {
        data_dir().join("log.db")
    }
}
