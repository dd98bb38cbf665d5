use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use clap::ArgGroup;
use clap::Parser;
use config::ConfigError;
use d_keyval::with_ttl;
use d_keyval::Broker;
use d_keyval::ChangeType;
use d_keyval::Connection;
use d_keyval::ConnectionBuilder;
use d_keyval::Error;
use d_keyval::MemoryStore;
use d_keyval::Result;
use d_keyval::Settings;
use d_keyval::TopologyConfig;
use d_keyval::TopologyKind;
use d_keyval::WatchResponse;
use tokio::sync::mpsc;
use tracing::error;
use tracing::info;
use tracing::warn;
use tracing_subscriber::EnvFilter;

#[derive(Parser)]
#[command(name = "d-keyval")]
#[command(version)]
#[command(about = "Walks through broker, transaction and watcher calls against a store", long_about = None)]
#[command(group(ArgGroup::new("topology").required(true).args(["node", "cluster", "sentinel", "settings", "memory"])))]
struct Args {
    /// Node client config (YAML or TOML)
    #[arg(short = 'n', long, value_name = "FILE")]
    node: Option<PathBuf>,

    /// Cluster client config
    #[arg(short = 'c', long, value_name = "FILE")]
    cluster: Option<PathBuf>,

    /// Sentinel client config
    #[arg(short = 's', long, value_name = "FILE")]
    sentinel: Option<PathBuf>,

    /// Sectioned settings file holding exactly one topology
    #[arg(short = 'f', long, value_name = "FILE")]
    settings: Option<PathBuf>,

    /// Run against an in-process store
    #[arg(long)]
    memory: bool,
}

#[tokio::main(flavor = "multi_thread", worker_threads = 2)]
async fn main() -> Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")))
        .init();

    let args = Args::parse();
    let conn = match connect(&args).await {
        Ok(conn) => conn,
        Err(e) => {
            error!("Failed to open connection: {}", e);
            return Err(e);
        }
    };

    run_scenario(conn).await;
    info!("Exiting program.");
    Ok(())
}

async fn connect(args: &Args) -> Result<Connection> {
    if args.memory {
        return Ok(ConnectionBuilder::new().with_client(Arc::new(MemoryStore::new())));
    }
    if let Some(path) = &args.settings {
        let settings = Settings::load(Some(path.as_path()))?;
        return ConnectionBuilder::from_settings(&settings)?.build().await;
    }

    let (kind, path) = match (&args.node, &args.cluster, &args.sentinel) {
        (Some(path), _, _) => (TopologyKind::Node, path),
        (_, Some(path), _) => (TopologyKind::Cluster, path),
        (_, _, Some(path)) => (TopologyKind::Sentinel, path),
        _ => {
            return Err(Error::Config(ConfigError::Message(
                "usage: d-keyval -n|-c|-s <client.yaml>".into(),
            )))
        }
    };
    let topology = TopologyConfig::load(kind, path)?;
    info!(%kind, path = %path.display(), "Loaded topology");
    Connection::open(topology).await
}

async fn run_scenario(conn: Connection) {
    let broker = conn.new_broker("");
    let watcher = conn.new_watcher("");

    let (key1, key2, key3) = ("key1", "key2", "key3");
    let key_prefix = &key1[..3];

    let (tx, rx) = mpsc::channel(10);
    if let Err(e) = watcher.watch(tx, [key_prefix]).await {
        error!("{}", e);
    }
    let consumer = tokio::spawn(consume_events(rx));

    put(&broker, key1, "val 1", None).await;
    put(&broker, key2, "val 2", None).await;
    put(&broker, key3, "val 3", Some(Duration::from_secs(1))).await;

    tokio::time::sleep(Duration::from_secs(2)).await;
    get(&broker, key1).await;
    get(&broker, key2).await;
    info!("==> NOTE: {} should have expired", key3);
    get(&broker, key3).await;
    info!("==> NOTE: get({}) should return nothing", key_prefix);
    get(&broker, key_prefix).await;
    list_keys(&broker, key_prefix).await;
    list_values(&broker, key_prefix).await;

    delete(&broker, key_prefix).await;

    info!("==> NOTE: All keys should have been deleted");
    get(&broker, key1).await;
    get(&broker, key2).await;
    list_keys(&broker, key_prefix).await;
    list_values(&broker, key_prefix).await;

    if conn.topology() == Some(TopologyKind::Cluster) {
        info!("==> NOTE: the transaction keys span several hash slots, so a cluster rejects the commit");
    }
    txn(&broker).await;
    list_values(&broker, key_prefix).await;

    // Let the watcher drain before closing
    tokio::time::sleep(Duration::from_secs(1)).await;

    info!("Closing connection");
    conn.close().await;

    info!("==> NOTE: Call on a closed connection should fail.");
    delete(&broker, key_prefix).await;

    if let Err(e) = consumer.await {
        error!("Watch consumer failed: {}", e);
    }
    info!(dropped = watcher.dropped_events(), "Watcher stopped");
}

async fn consume_events(mut rx: mpsc::Receiver<WatchResponse>) {
    while let Some(response) = rx.recv().await {
        match response {
            Ok(event) => match event.change_type {
                ChangeType::Put => info!(
                    "Watcher received {:?}: {}={}",
                    event.change_type,
                    String::from_utf8_lossy(&event.key),
                    event
                        .value
                        .as_deref()
                        .map(String::from_utf8_lossy)
                        .unwrap_or_default()
                ),
                ChangeType::Delete => info!(
                    "Watcher received {:?}: {}",
                    event.change_type,
                    String::from_utf8_lossy(&event.key)
                ),
            },
            Err(e) => warn!("Watcher: {}", e),
        }
    }
    info!("Watch channel closed");
}

async fn put(
    broker: &Broker,
    key: &str,
    value: &str,
    ttl: Option<Duration>,
) {
    let options: Vec<_> = ttl.into_iter().map(with_ttl).collect();
    if let Err(e) = broker.put(key, value, &options).await {
        error!("{}", e);
    }
}

async fn get(
    broker: &Broker,
    key: &str,
) {
    match broker.get_value(key).await {
        Ok(Some(entry)) => info!(
            "GetValue({}) = true ; val = {} ; revision = {}",
            key,
            String::from_utf8_lossy(&entry.value),
            entry.revision
        ),
        Ok(None) => info!("GetValue({}) = false", key),
        Err(e) => error!("{}", e),
    }
}

async fn list_keys(
    broker: &Broker,
    prefix: &str,
) {
    let mut keys = match broker.list_keys(prefix).await {
        Ok(keys) => keys,
        Err(e) => {
            error!("{}", e);
            return;
        }
    };

    let mut count = 0;
    loop {
        match keys.next().await {
            Ok(Some((key, revision))) => {
                info!("ListKeys({}):  {} (rev {})", prefix, String::from_utf8_lossy(&key), revision);
                count += 1;
            }
            Ok(None) => break,
            Err(e) => {
                error!("{}", e);
                break;
            }
        }
    }
    info!("ListKeys({}): count = {}", prefix, count);
}

async fn list_values(
    broker: &Broker,
    prefix: &str,
) {
    let mut entries = match broker.list_values(prefix).await {
        Ok(entries) => entries,
        Err(e) => {
            error!("{}", e);
            return;
        }
    };

    let mut count = 0;
    loop {
        match entries.next().await {
            Ok(Some(entry)) => {
                info!(
                    "ListValues({}):  {} = {} (rev {})",
                    prefix,
                    String::from_utf8_lossy(&entry.key),
                    String::from_utf8_lossy(&entry.value),
                    entry.revision
                );
                count += 1;
            }
            Ok(None) => break,
            Err(e) => {
                error!("{}", e);
                break;
            }
        }
    }
    info!("ListValues({}): count = {}", prefix, count);
}

async fn delete(
    broker: &Broker,
    prefix: &str,
) {
    match broker.delete(prefix).await {
        Ok(found) => info!("Delete({}): found = {}", prefix, found),
        Err(e) => error!("{}", e),
    }
}

/// Cluster transactions must keep every key in one hash slot; these keys do
/// not, so on a cluster the commit fails with a cross-slot error.
async fn txn(broker: &Broker) {
    let mut txn = broker.new_txn();
    txn.put("key101", "val 101").put("key102", "val 102");
    txn.put("key103", "val 103").put("key104", "val 104");
    txn.delete("key101");
    if let Err(e) = txn.commit().await {
        error!("txn: {}", e);
    }
}
