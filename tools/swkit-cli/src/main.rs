//! Operator CLI for the swkit service worker.
//!
//! Provides commands for:
//! - Printing a generation's namespaces and strategy table
//! - Working the offline submission queue (enqueue, list, drain)
//! - Precaching a generation against the live site and reporting what landed
//!
//! ## Usage
//!
//! ```bash
//! # Show what a config would install
//! swkit status --config sw.json
//!
//! # Queue a submission and deliver it later
//! swkit enqueue --db submissions.db --payload '{"name":"Ada"}'
//! swkit drain --db submissions.db --endpoint https://thegeeksinfo.com/api/contact
//!
//! # Install against the real network and print the cache report
//! swkit precache --config sw.json
//! ```

use std::path::{Path, PathBuf};
use std::sync::Arc;

use anyhow::{bail, Context};
use clap::{Parser, Subcommand};
use swkit_common::logging::{init_logging, LogConfig, LogFormat};
use swkit_net::{HttpFetcher, LoaderConfig};
use swkit_queue::{SqliteStore, SubmissionQueue, SubmissionStore};
use swkit_sw::{EventOutcome, ServiceWorkerGlobal, StrategyTable, WorkerConfig, WorkerEvent};
use tracing::info;
use url::Url;

#[derive(Parser)]
#[command(name = "swkit")]
#[command(about = "Operator CLI for the swkit caching service worker")]
struct Cli {
    /// Log output format (pretty, compact, json)
    #[arg(long, global = true, default_value = "compact")]
    log_format: LogFormat,

    /// Enable debug logging
    #[arg(short, long, global = true)]
    verbose: bool,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Print the namespace set and strategy table of a generation
    Status {
        /// Worker config (JSON); built-in defaults when omitted
        #[arg(short, long)]
        config: Option<PathBuf>,
        /// Print as JSON
        #[arg(long)]
        json: bool,
    },

    /// Add a submission to the offline queue
    Enqueue {
        /// Submission database
        #[arg(long, default_value = "submissions.db")]
        db: PathBuf,
        /// Submission payload (JSON)
        #[arg(short, long)]
        payload: String,
    },

    /// List pending submissions
    Pending {
        /// Submission database
        #[arg(long, default_value = "submissions.db")]
        db: PathBuf,
    },

    /// Deliver every pending submission once
    Drain {
        /// Submission database
        #[arg(long, default_value = "submissions.db")]
        db: PathBuf,
        /// Remote endpoint; taken from the config when omitted
        #[arg(short, long)]
        endpoint: Option<Url>,
        /// Worker config (JSON)
        #[arg(short, long)]
        config: Option<PathBuf>,
    },

    /// Install a generation against the live network and print the cache report
    Precache {
        /// Worker config (JSON)
        #[arg(short, long)]
        config: Option<PathBuf>,
        /// Request timeout in seconds
        #[arg(long, default_value = "30")]
        timeout: u64,
    },
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let cli = Cli::parse();

    let log_config = if cli.verbose {
        LogConfig::debug()
    } else {
        LogConfig::default()
    };
    init_logging(log_config.with_format(cli.log_format));

    match cli.command {
        Commands::Status { config, json } => {
            let config = load_config(config.as_deref())?;
            print_status(&config, json)?;
        }

        Commands::Enqueue { db, payload } => {
            let payload: serde_json::Value =
                serde_json::from_str(&payload).context("payload is not valid JSON")?;
            let store = SqliteStore::open(&db)?;
            let id = store.add(payload).await?;
            println!("Queued submission {id}");
        }

        Commands::Pending { db } => {
            let store = SqliteStore::open(&db)?;
            let pending = store.list().await?;
            if pending.is_empty() {
                println!("No pending submissions");
            }
            for submission in pending {
                println!(
                    "{:>6}  {}  {}",
                    submission.id,
                    submission.created_at.to_rfc3339(),
                    submission.payload
                );
            }
        }

        Commands::Drain {
            db,
            endpoint,
            config,
        } => {
            let endpoint = match endpoint {
                Some(endpoint) => endpoint,
                None => load_config(config.as_deref())?.endpoint_url()?,
            };
            let store = Arc::new(SqliteStore::open(&db)?);
            let queue = SubmissionQueue::new(store, Arc::new(http_fetcher(None)?), endpoint);

            let report = queue.drain().await?;
            println!("Drain result:");
            println!("  Attempted: {}", report.attempted);
            println!("  Delivered: {}", report.delivered.len());
            println!("  Retained:  {}", report.retained.len());
        }

        Commands::Precache { config, timeout } => {
            let config = load_config(config.as_deref())?;
            precache(config, timeout).await?;
        }
    }

    Ok(())
}

fn load_config(path: Option<&Path>) -> anyhow::Result<WorkerConfig> {
    match path {
        Some(path) => Ok(WorkerConfig::load(path)?),
        None => {
            let config = WorkerConfig::default();
            config.validate()?;
            Ok(config)
        }
    }
}

fn http_fetcher(timeout_secs: Option<u64>) -> anyhow::Result<HttpFetcher> {
    let config = LoaderConfig {
        default_timeout: timeout_secs.map(std::time::Duration::from_secs),
        ..Default::default()
    };
    Ok(HttpFetcher::new(config)?)
}

fn print_status(config: &WorkerConfig, json: bool) -> anyhow::Result<()> {
    let namespaces = config.namespaces();
    let table = StrategyTable::for_layout(config.layout);

    if json {
        let status = serde_json::json!({
            "version": config.version,
            "layout": config.layout,
            "namespaces": namespaces,
            "rules": table
                .rules()
                .iter()
                .map(|(class, rule)| serde_json::json!({ "class": class, "rule": rule }))
                .collect::<Vec<_>>(),
        });
        println!("{}", serde_json::to_string_pretty(&status)?);
        return Ok(());
    }

    println!("Generation {} ({:?} layout)", config.version, config.layout);
    println!("Namespaces:");
    for name in namespaces.names() {
        println!("  {name}");
    }
    println!("Strategies:");
    for (class, rule) in table.rules() {
        println!(
            "  {:<24} {:<24} -> {:?}{}",
            class.as_str(),
            rule.strategy.to_string(),
            rule.namespace,
            if rule.offline_fallback { " (offline fallback)" } else { "" }
        );
    }
    println!(
        "Precache: {} static, {} external",
        config.static_assets.len(),
        config.external_resources.len()
    );
    Ok(())
}

async fn precache(config: WorkerConfig, timeout: u64) -> anyhow::Result<()> {
    let skip_waiting = config.skip_waiting;
    let store = Arc::new(SqliteStore::open_in_memory()?);
    let global = ServiceWorkerGlobal::new(config, Arc::new(http_fetcher(Some(timeout))?), store)?;

    match global.dispatch(WorkerEvent::Install).await? {
        EventOutcome::Installed { worker, .. } => info!(%worker, "Install finished"),
        other => bail!("unexpected install outcome: {other:?}"),
    }
    if !skip_waiting {
        global.dispatch(WorkerEvent::Activate).await?;
    }

    let report = global.cache_report().await;
    println!("{}", serde_json::to_string_pretty(&report)?);
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use clap::CommandFactory;

    #[test]
    fn test_cli_definition() {
        Cli::command().debug_assert();
    }

    #[test]
    fn test_parse_drain() {
        let cli = Cli::try_parse_from([
            "swkit",
            "--log-format",
            "json",
            "drain",
            "--db",
            "/tmp/q.db",
            "--endpoint",
            "https://thegeeksinfo.com/api/contact",
        ])
        .unwrap();

        assert_eq!(cli.log_format, LogFormat::Json);
        match cli.command {
            Commands::Drain { db, endpoint, .. } => {
                assert_eq!(db, PathBuf::from("/tmp/q.db"));
                assert_eq!(endpoint.unwrap().path(), "/api/contact");
            }
            _ => panic!("expected drain"),
        }
    }

    #[test]
    fn test_default_config_loads() {
        let config = load_config(None).unwrap();
        assert_eq!(config.sync.tag, "contact-form-sync");
    }
}
