use anyhow::Result;
use chrono::{DateTime, Utc};
use clap::{Parser, Subcommand};
use std::path::PathBuf;

use affinity::config::Config;
use affinity::logging;
use affinity::model::ActionType;

mod commands;

#[derive(Parser)]
#[command(
    author,
    version = env!("CARGO_PKG_VERSION"),
    about = "Streaming item-to-item similarity from user actions",
    long_about = None
)]
struct Cli {
    /// Config file (default: .affinity/config.toml, then ~/.affinity/config.toml)
    #[arg(long, global = true)]
    config: Option<PathBuf>,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Consume user actions and publish similarity updates until interrupted
    Run,

    /// Append a user action to the input topic
    Send {
        /// User id
        user: i64,

        /// Item id
        item: i64,

        /// Action type (view, register, like)
        #[arg(value_parser = parse_action)]
        action: ActionType,

        /// Event time as RFC 3339 (default: now)
        #[arg(long, value_parser = parse_timestamp)]
        at: Option<DateTime<Utc>>,
    },

    /// Items most similar to an item
    Neighbours {
        item: i64,

        #[arg(short, long, default_value_t = 10)]
        limit: usize,

        /// Output results as JSON
        #[arg(short, long)]
        json: bool,
    },

    /// Items a user has not seen, ranked by similarity to what they have
    Recommend {
        user: i64,

        #[arg(short, long, default_value_t = 10)]
        limit: usize,

        /// Output results as JSON
        #[arg(short, long)]
        json: bool,
    },

    /// Summed interaction weight per item
    Scores {
        #[arg(required = true)]
        items: Vec<i64>,

        /// Output results as JSON
        #[arg(short, long)]
        json: bool,
    },

    /// Recompute similarity aggregates from the interaction table
    Rebuild {
        /// Only report drift, change nothing
        #[arg(long)]
        verify: bool,

        /// Output results as JSON (with --verify)
        #[arg(short, long, requires = "verify")]
        json: bool,
    },

    /// Consumer offsets, lag and store size
    Status {
        /// Output results as JSON
        #[arg(short, long)]
        json: bool,
    },
}

fn parse_action(s: &str) -> Result<ActionType, String> {
    ActionType::from_str(s).ok_or_else(|| {
        let known: Vec<&str> = ActionType::all().iter().map(|a| a.as_str()).collect();
        format!("unknown action '{}', expected one of {}", s, known.join(", "))
    })
}

fn parse_timestamp(s: &str) -> Result<DateTime<Utc>, String> {
    DateTime::parse_from_rfc3339(s)
        .map(|t| t.with_timezone(&Utc))
        .map_err(|e| format!("invalid timestamp '{}': {}", s, e))
}

fn main() -> Result<()> {
    let cli = Cli::parse();
    let config = Config::resolve(cli.config.as_deref())?;
    logging::init(&config.logging)?;

    match cli.command {
        Commands::Run => {
            commands::run::execute(&config)?;
        }
        Commands::Send {
            user,
            item,
            action,
            at,
        } => {
            commands::send::execute(&config, user, item, action, at)?;
        }
        Commands::Neighbours { item, limit, json } => {
            commands::query::neighbours(&config, item, limit, json)?;
        }
        Commands::Recommend { user, limit, json } => {
            commands::query::recommend(&config, user, limit, json)?;
        }
        Commands::Scores { items, json } => {
            commands::query::scores(&config, &items, json)?;
        }
        Commands::Rebuild { verify, json } => {
            commands::rebuild::execute(&config, verify, json)?;
        }
        Commands::Status { json } => {
            commands::status::execute(&config, json)?;
        }
    }

    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use clap::CommandFactory;

    #[test]
    fn test_cli_definition_is_valid() {
        Cli::command().debug_assert();
    }

    #[test]
    fn test_parse_action_is_case_insensitive() {
        assert_eq!(parse_action("LIKE"), Ok(ActionType::Like));
        assert_eq!(parse_action("view"), Ok(ActionType::View));
        assert!(parse_action("share").unwrap_err().contains("expected one of"));
    }

    #[test]
    fn test_send_parses_timestamp() {
        let cli = Cli::parse_from([
            "affinity",
            "send",
            "1",
            "2",
            "register",
            "--at",
            "2024-05-01T10:00:00+02:00",
        ]);
        let Commands::Send { action, at, .. } = cli.command else {
            panic!("expected send");
        };
        assert_eq!(action, ActionType::Register);
        assert_eq!(at.map(|t| t.to_rfc3339()), Some("2024-05-01T08:00:00+00:00".to_string()));
    }
}
