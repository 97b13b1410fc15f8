//! Command-line surface of the daemon.

use std::ffi::OsString;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use clap::{Parser, Subcommand};
use uuid::Uuid;

use crate::client::SchemaMap;
use crate::config::{self, Config};
use crate::runner::{ConnectionLoop, ConnectionSlots};
use crate::store::{CvrStore, SqliteCvrStore};
use crate::syncer::ViewSyncer;
use crate::{Error, Result};

#[derive(Debug, Parser)]
#[command(name = "viewsyncd", about = "Synchronized query cache daemon", version)]
pub struct Cli {
    /// Increase log verbosity (-v debug, -vv trace).
    #[arg(short, long, action = clap::ArgAction::Count, global = true)]
    pub verbose: u8,

    /// Path to the config file.
    #[arg(long, global = true)]
    pub config: Option<PathBuf>,

    #[command(subcommand)]
    pub command: Command,
}

#[derive(Debug, Subcommand)]
pub enum Command {
    /// Run the syncer daemon.
    Serve,
    /// Config management.
    Config {
        #[command(subcommand)]
        action: ConfigAction,
    },
    /// Store inspection.
    Store {
        #[command(subcommand)]
        action: StoreAction,
    },
}

#[derive(Debug, Subcommand)]
pub enum ConfigAction {
    /// Print the effective configuration.
    Show,
    /// Write a default config file.
    Init,
}

#[derive(Debug, Subcommand)]
pub enum StoreAction {
    /// Show the instance row of a client group.
    Status { group: String },
}

pub fn parse_from<I, T>(args: I) -> Cli
where
    I: IntoIterator<Item = T>,
    T: Into<OsString> + Clone,
{
    Cli::parse_from(args)
}

pub fn config_path(cli: &Cli) -> PathBuf {
    cli.config
        .clone()
        .unwrap_or_else(|| PathBuf::from(config::DEFAULT_CONFIG_FILE))
}

pub fn run(cli: Cli) -> Result<()> {
    let path = config_path(&cli);
    match cli.command {
        Command::Serve => serve(&path),
        Command::Config { action } => match action {
            ConfigAction::Show => {
                let cfg = config::load_or_init(&path);
                let rendered = toml::to_string_pretty(&cfg)
                    .map_err(|e| Error::Config(format!("render failed: {e}")))?;
                println!("{rendered}");
                Ok(())
            }
            ConfigAction::Init => {
                config::write_config(&path, &Config::default())?;
                println!("wrote {}", path.display());
                Ok(())
            }
        },
        Command::Store { action } => match action {
            StoreAction::Status { group } => store_status(&path, &group),
        },
    }
}

fn serve(config_path: &std::path::Path) -> Result<()> {
    let mut cfg = config::load_or_init(config_path);
    config::apply_env_overrides(&mut cfg);

    let owner = Uuid::new_v4();
    let store = SqliteCvrStore::open(&cfg.store.path, owner)?;
    let schema: SchemaMap = cfg.schema.to_schema_map();
    let syncer = Arc::new(
        ViewSyncer::new(Arc::new(store) as Arc<dyn CvrStore>, schema)
            .with_catchup_batch_size(cfg.sync.catchup_batch_size)
            .with_failure_handler(Box::new(|group, err| {
                // Another instance holds the lease; this process must stop
                // serving the group rather than fight over it.
                tracing::error!(group = %group, error = %err, "terminating: lease lost");
                std::process::exit(1);
            })),
    );
    tracing::info!(owner = %owner, store = %cfg.store.path.display(), "view-syncer serving");

    // Lease heartbeats ride a connection loop: paced by observed flush
    // latency, backed off on store trouble, woken by the watchdog.
    let slots = ConnectionSlots::new(cfg.runner.max_connections);
    let mut runner_cfg = cfg.runner.to_runner_config();
    runner_cfg.watchdog_interval = Duration::from_millis(cfg.sync.heartbeat_interval_ms.max(1));
    let heartbeat_syncer = Arc::clone(&syncer);
    let _heartbeat = ConnectionLoop::spawn(
        "heartbeat",
        runner_cfg,
        slots,
        None,
        Box::new(move || {
            let now = now_ms();
            for group in heartbeat_syncer.active_groups() {
                heartbeat_syncer
                    .heartbeat(&group, now)
                    .map_err(|e| e.to_string())?;
            }
            Ok(())
        }),
    );

    // Transport integration (socket accept loop) lives outside this crate;
    // the daemon parks here and works through the syncer handle.
    loop {
        std::thread::park();
    }
}

fn store_status(config_path: &std::path::Path, group: &str) -> Result<()> {
    let cfg = config::load_or_init(config_path);
    let store = SqliteCvrStore::open(&cfg.store.path, Uuid::nil())?;
    let group = crate::core::ClientGroupId::new(group)
        .map_err(|e| Error::Config(e.to_string()))?;
    match store.inspect(&group)? {
        None => println!("no instance row for {group}"),
        Some(row) => {
            println!("group:           {}", row.group);
            println!("version:         {}", row.version);
            println!(
                "replica version: {}",
                row.replica_version
                    .map(|v| v.to_string())
                    .unwrap_or_else(|| "-".to_string())
            );
            println!("last active:     {}", row.last_active);
            println!(
                "owner:           {}",
                row.owner
                    .map(|o| o.to_string())
                    .unwrap_or_else(|| "-".to_string())
            );
            println!(
                "granted at:      {}",
                row.granted_at
                    .map(|g| g.to_string())
                    .unwrap_or_else(|| "-".to_string())
            );
        }
    }
    Ok(())
}

fn now_ms() -> u64 {
    use std::time::{SystemTime, UNIX_EPOCH};
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| d.as_millis() as u64)
        .unwrap_or(0)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parses_serve() {
        let cli = parse_from(["viewsyncd", "serve"]);
        assert!(matches!(cli.command, Command::Serve));
        assert_eq!(cli.verbose, 0);
    }

    #[test]
    fn parses_verbosity_and_config_path() {
        let cli = parse_from(["viewsyncd", "-vv", "--config", "/tmp/x.toml", "serve"]);
        assert_eq!(cli.verbose, 2);
        assert_eq!(config_path(&cli), PathBuf::from("/tmp/x.toml"));
    }

    #[test]
    fn parses_store_status() {
        let cli = parse_from(["viewsyncd", "store", "status", "g1"]);
        match cli.command {
            Command::Store {
                action: StoreAction::Status { group },
            } => assert_eq!(group, "g1"),
            other => panic!("unexpected command {other:?}"),
        }
    }
}
