use std::path::PathBuf;

use anyhow::Context;
use clap::{Parser, Subcommand};
use dialoguer::Confirm;
use mnemo_core::bootstrap::{open_service, resolve_config_path};
use mnemo_core::config::Config;
use mnemo_llm::EmbeddingProvider;
use mnemo_memory::{MemoryService, NewRecord};
use serde::Serialize;
use serde_json::json;

mod init;

/// Vector-indexed memory store.
#[derive(Parser, Debug)]
#[command(name = "mnemo", version, about, long_about = None)]
struct Cli {
    /// Config file (default: `MNEMO_CONFIG` or ./mnemo.toml)
    #[arg(long, global = true)]
    config: Option<PathBuf>,

    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand, Debug)]
enum Command {
    /// Write a config file interactively
    Init {
        #[arg(long)]
        output: Option<PathBuf>,
    },

    /// Add a record, or replace it with --replace
    Add {
        /// Stable id; generated when omitted
        #[arg(long)]
        id: Option<String>,
        #[arg(long)]
        conversation: String,
        #[arg(long, default_value = "user")]
        role: String,
        /// Repeat for several tags
        #[arg(long = "tag")]
        tags: Vec<String>,
        /// ISO-8601 timestamp; now when omitted
        #[arg(long)]
        timestamp: Option<String>,
        #[arg(long)]
        replace: bool,
        content: String,
    },

    /// Semantic search
    Search {
        #[arg(short)]
        k: Option<usize>,
        query: String,
    },

    /// Records carrying exactly TAG, newest first
    Tag {
        #[arg(long)]
        limit: Option<usize>,
        tag: String,
    },

    /// Most recent records of a conversation, oldest first
    History {
        #[arg(long)]
        limit: Option<usize>,
        conversation: String,
    },

    /// Fetch a record by stable id
    Get { id: String },

    /// Delete a record by stable id
    Remove { id: String },

    /// Delete every record of a conversation
    Forget { conversation: String },

    /// Delete every record (ids are not reused)
    Reset {
        /// Skip the confirmation prompt
        #[arg(long)]
        yes: bool,
    },

    /// Rebuild the similarity index from the catalogue
    Rebuild,

    /// Repair drift between the similarity index and the catalogue
    Reconcile,

    /// Show store statistics
    Stats,
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let cli = Cli::parse();
    init_subscriber();

    if let Command::Init { output } = cli.command {
        return init::run(output);
    }

    let config_path = resolve_config_path(cli.config.as_deref());
    let config = Config::load(&config_path)?;
    let service = open_service(&config).await?;

    let result = execute(&service, &config, cli.command).await;
    let closed = service
        .close()
        .await
        .context("failed to flush memory store");
    result?;
    closed
}

fn init_subscriber() {
    let filter = tracing_subscriber::EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new("info"));
    tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_writer(std::io::stderr)
        .init();
}

fn print_json<T: Serialize + ?Sized>(value: &T) -> anyhow::Result<()> {
    let out = serde_json::to_string_pretty(value)?;
    println!("{out}");
    Ok(())
}

async fn execute<P: EmbeddingProvider>(
    service: &MemoryService<P>,
    config: &Config,
    command: Command,
) -> anyhow::Result<()> {
    match command {
        Command::Init { .. } => anyhow::bail!("init does not operate on an open store"),
        Command::Add {
            id,
            conversation,
            role,
            tags,
            timestamp,
            replace,
            content,
        } => {
            let record = NewRecord {
                stable_id: id,
                conversation_id: conversation,
                role,
                content,
                timestamp,
                tags,
            };
            let outcome = service.add(record, replace).await?;
            print_json(&outcome)
        }
        Command::Search { k, query } => {
            let k = k.unwrap_or(config.search.default_k);
            let hits = service.search(&query, k).await?;
            print_json(&hits)
        }
        Command::Tag { limit, tag } => {
            let limit = limit.unwrap_or(config.search.default_tag_limit);
            let hits = service.search_by_tag(&tag, limit).await?;
            print_json(&hits)
        }
        Command::History {
            limit,
            conversation,
        } => {
            let limit = limit.unwrap_or(config.search.default_history_limit);
            let hits = service.conversation_history(&conversation, limit).await?;
            print_json(&hits)
        }
        Command::Get { id } => {
            let record = service.get(&id).await?;
            if record.is_none() {
                tracing::warn!(stable_id = %id, "record not found");
            }
            print_json(&record)
        }
        Command::Remove { id } => {
            let removed = service.remove(&id).await?;
            print_json(&json!({ "stable_id": id, "removed": removed }))
        }
        Command::Forget { conversation } => {
            let removed = service.remove_conversation(&conversation).await?;
            print_json(&json!({ "conversation_id": conversation, "removed": removed }))
        }
        Command::Reset { yes } => {
            let confirmed = yes
                || Confirm::new()
                    .with_prompt("Delete every record in the store?")
                    .default(false)
                    .interact()?;
            if confirmed {
                service.reset().await?;
            }
            print_json(&json!({ "reset": confirmed }))
        }
        Command::Rebuild => {
            let indexed = service.rebuild().await?;
            print_json(&json!({ "indexed": indexed }))
        }
        Command::Reconcile => {
            let report = service.reconcile().await?;
            print_json(&report)
        }
        Command::Stats => {
            let stats = service.stats().await?;
            print_json(&stats)
        }
    }
}

#[cfg(test)]
mod tests {
    use clap::CommandFactory;

    use super::*;

    #[test]
    fn cli_definition_is_valid() {
        Cli::command().debug_assert();
    }

    #[test]
    fn parse_add_with_tags() {
        let cli = Cli::try_parse_from([
            "mnemo",
            "add",
            "--id",
            "m1",
            "--conversation",
            "c1",
            "--tag",
            "greeting",
            "--tag",
            "en",
            "--replace",
            "hello world",
        ])
        .unwrap();
        let Command::Add {
            id,
            conversation,
            role,
            tags,
            timestamp,
            replace,
            content,
        } = cli.command
        else {
            panic!("expected add");
        };
        assert_eq!(id.as_deref(), Some("m1"));
        assert_eq!(conversation, "c1");
        assert_eq!(role, "user");
        assert_eq!(tags, ["greeting", "en"]);
        assert!(timestamp.is_none());
        assert!(replace);
        assert_eq!(content, "hello world");
    }

    #[test]
    fn add_requires_conversation() {
        assert!(Cli::try_parse_from(["mnemo", "add", "hello"]).is_err());
    }

    #[test]
    fn global_config_after_subcommand() {
        let cli =
            Cli::try_parse_from(["mnemo", "search", "-k", "3", "hi", "--config", "x.toml"]).unwrap();
        assert_eq!(cli.config, Some(PathBuf::from("x.toml")));
        assert!(matches!(
            cli.command,
            Command::Search { k: Some(3), ref query } if query == "hi"
        ));
    }

    #[test]
    fn tag_limit_optional() {
        let cli = Cli::try_parse_from(["mnemo", "tag", "greeting"]).unwrap();
        assert!(matches!(cli.command, Command::Tag { limit: None, .. }));
    }

    #[test]
    fn history_and_forget_take_conversation() {
        let cli = Cli::try_parse_from(["mnemo", "history", "--limit", "4", "conv-1"]).unwrap();
        assert!(matches!(
            cli.command,
            Command::History { limit: Some(4), ref conversation } if conversation == "conv-1"
        ));
        let cli = Cli::try_parse_from(["mnemo", "forget", "conv-1"]).unwrap();
        assert!(matches!(
            cli.command,
            Command::Forget { ref conversation } if conversation == "conv-1"
        ));
    }

    #[test]
    fn reset_yes_flag() {
        let cli = Cli::try_parse_from(["mnemo", "reset", "--yes"]).unwrap();
        assert!(matches!(cli.command, Command::Reset { yes: true }));
    }
}
