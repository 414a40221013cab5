//! practice-sync: command-line realtime sync client.
//!
//! Connects to the practice journal sync server, keeps a local replica up to
//! date, and inspects or resets the persisted sync state.

use anyhow::{Context, Result};
use clap::{Parser, Subcommand};
use std::path::PathBuf;
use std::sync::{Arc, Mutex};
use tracing::{info, warn};
use tracing_subscriber::EnvFilter;

use practice_sync::{ConnectionState, FileStore, SyncClient, WebSocketFactory, install_crypto_provider};
use practice_sync_core::protocol::{SyncEvent, Topic};
use practice_sync_core::store::{self, KeyValueStore, StoreKeys};
use practice_sync_core::{Environment, OutboundQueue, QueuePolicy, Replica, SyncConfig, SyncStateTracker};

#[derive(Parser, Debug)]
#[command(name = "practice-sync")]
#[command(about = "Realtime sync client for practice journal data")]
struct Args {
    /// User to sync as
    #[arg(long, env = "PRACTICE_SYNC_USER_ID")]
    user_id: Option<String>,

    /// Auth credential passed to the server
    #[arg(long, env = "PRACTICE_SYNC_TOKEN", hide_env_values = true)]
    token: Option<String>,

    /// Deployment to connect to (local, staging, production)
    #[arg(short, long, env = "PRACTICE_SYNC_ENV", default_value = "local")]
    environment: Environment,

    /// Server URL, overriding the environment default
    #[arg(long)]
    url: Option<String>,

    /// Directory holding the persisted sync state
    #[arg(short, long, default_value = ".practice-sync")]
    data_dir: PathBuf,

    /// Enable verbose logging
    #[arg(long)]
    verbose: bool,

    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand, Debug)]
enum Command {
    /// Connect and apply inbound events until Ctrl+C
    Listen,
    /// Print the offline queue size and sync cursors
    Status,
    /// Turn realtime sync on
    Enable,
    /// Turn realtime sync off
    Disable,
    /// Drop the offline queue and sync cursors
    Reset,
}

#[tokio::main]
async fn main() -> Result<()> {
    let args = Args::parse();

    // Set up logging - respects RUST_LOG env var, defaults to info (or debug with --verbose)
    let default_filter = if args.verbose {
        "debug,practice_sync=debug,practice_sync_core=debug"
    } else {
        "info"
    };
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(default_filter));
    tracing_subscriber::fmt().with_env_filter(filter).init();
    install_crypto_provider();

    let mut config = SyncConfig::new(args.environment);
    if let Some(url) = &args.url {
        config = config.with_base_url(url.clone());
    }
    let keys = StoreKeys::new(config.storage_prefix.clone());
    let store: Arc<dyn KeyValueStore> = Arc::new(
        FileStore::open(&args.data_dir)
            .with_context(|| format!("Failed to open data directory {:?}", args.data_dir))?,
    );

    match args.command {
        Command::Listen => {
            let user_id = args.user_id.context("--user-id is required to connect")?;
            let token = args.token.context("--token is required to connect")?;
            listen(config, store, keys, &user_id, &token).await
        }
        Command::Status => {
            print_status(&config, store, &keys);
            Ok(())
        }
        Command::Enable | Command::Disable => {
            let enabled = matches!(args.command, Command::Enable);
            store::set_realtime_enabled(store.as_ref(), &keys, enabled)?;
            println!("realtime sync {}", if enabled { "enabled" } else { "disabled" });
            Ok(())
        }
        Command::Reset => {
            queue(&config, Arc::clone(&store), &keys).clear();
            SyncStateTracker::new(store, keys).reset();
            println!("offline queue and sync cursors cleared");
            Ok(())
        }
    }
}

fn queue(config: &SyncConfig, store: Arc<dyn KeyValueStore>, keys: &StoreKeys) -> OutboundQueue {
    let policy = QueuePolicy {
        ttl: config.queue_ttl,
        capacity: config.queue_capacity,
    };
    OutboundQueue::new(store, keys.offline_queue(), policy)
}

fn print_status(config: &SyncConfig, store: Arc<dyn KeyValueStore>, keys: &StoreKeys) {
    let tracker = SyncStateTracker::new(Arc::clone(&store), keys.clone());
    let enabled = store::realtime_enabled(store.as_ref(), keys);
    let pending = queue(config, store, keys).len();

    println!("server:          {}", config.server_url());
    println!("realtime:        {}", if enabled { "enabled" } else { "disabled" });
    println!("queued events:   {}", pending);
    println!("last sequence:   {}", tracker.last_seq());
    println!(
        "last sync time:  {}",
        tracker.last_sync_time().as_deref().unwrap_or("never")
    );
}

async fn listen(
    config: SyncConfig,
    store: Arc<dyn KeyValueStore>,
    keys: StoreKeys,
    user_id: &str,
    token: &str,
) -> Result<()> {
    if !store::realtime_enabled(store.as_ref(), &keys) {
        warn!("Realtime sync is disabled; run `practice-sync enable` to turn it on");
        return Ok(());
    }

    info!("Starting practice-sync");
    info!("Server: {}", config.server_url());

    let replica = Arc::new(Mutex::new(Replica::restore(store.as_ref(), &keys)));
    {
        let replica = replica.lock().unwrap_or_else(|e| e.into_inner());
        info!(
            "Restored {} entries and {} pieces from backup",
            replica.entry_count(),
            replica.piece_count()
        );
    }

    let client = SyncClient::new(config, Arc::clone(&store), Arc::new(WebSocketFactory::new()));
    Replica::attach(Arc::clone(&replica), client.router());
    client.on(Topic::Wildcard, |event: &SyncEvent| {
        info!(
            "{} (seq {})",
            event.kind,
            event
                .sequence_number
                .map_or_else(|| "-".to_string(), |seq| seq.to_string())
        );
        Ok(())
    });
    let _status = client.subscribe_status(|status| {
        info!(
            "Connection {} (reconnect attempts: {})",
            status.state, status.reconnect_attempts
        );
    });

    if !client.connect(user_id, token).await {
        if client.connection_status().state != ConnectionState::Reconnecting {
            anyhow::bail!("Could not connect to {}", client.config().server_url());
        }
        warn!("Initial connection failed; retrying in the background");
    }

    info!("Running. Press Ctrl+C to stop.");
    tokio::signal::ctrl_c()
        .await
        .context("Failed to listen for Ctrl+C")?;
    info!("Shutdown signal received");

    client.disconnect().await;
    let snapshot = replica.lock().unwrap_or_else(|e| e.into_inner()).clone();
    snapshot.backup(store.as_ref(), &keys)?;

    info!("Shutting down");
    Ok(())
}
