//! Sharded cluster client.
//!
//! Keys map to hash slots (CRC16 of the key or its `{tag}`), slots map to a
//! master plus replicas according to `CLUSTER SLOTS`. The slot table is
//! swapped atomically on refresh so in-flight requests keep a consistent
//! view.

use std::collections::BTreeMap;
use std::collections::BTreeSet;
use std::sync::Arc;
use std::time::Duration;

use arc_swap::ArcSwap;
use bytes::Bytes;
use dashmap::DashMap;
use rand::seq::SliceRandom;
use tokio::sync::mpsc;
use tokio::time::Instant;
use tokio_util::sync::CancellationToken;
use tracing::debug;
use tracing::info;
use tracing::warn;

use super::command;
use super::command::Command;
use super::connection::Dialer;
use super::node::exec_on;
use super::node::scan_on;
use super::pool::ConnectionPool;
use super::pubsub;
use super::value::error_redirect;
use super::value::Redirect;
use super::RespValue;
use crate::config::ClusterConfig;
use crate::config::WatchConfig;
use crate::store::ScanCursor;
use crate::store::ScanPage;
use crate::store::StoreClient;
use crate::store::StoreOp;
use crate::store::StoredValue;
use crate::store::Subscription;
use crate::utils::slot::hash_slot;
use crate::ConnectionError;
use crate::Error;
use crate::Result;
use crate::TxnError;

#[derive(Debug, Clone, PartialEq, Eq)]
pub(crate) struct SlotRange {
    pub(crate) start: u16,
    pub(crate) end: u16,
    pub(crate) master: String,
    pub(crate) replicas: Vec<String>,
}

/// Slot ranges sorted by their first slot
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub(crate) struct SlotTable {
    ranges: Vec<SlotRange>,
}

impl SlotTable {
    /// Parses a `CLUSTER SLOTS` reply. Nodes reported with an empty host live
    /// on the host that answered.
    pub(crate) fn parse(
        reply: RespValue,
        answered_by: &str,
    ) -> Result<Self> {
        let fallback_host = answered_by.rsplit_once(':').map(|(h, _)| h).unwrap_or(answered_by);

        let mut ranges = Vec::new();
        for entry in reply.into_array("CLUSTER SLOTS")? {
            let mut fields = entry.into_array("CLUSTER SLOTS")?.into_iter();
            let (Some(start), Some(end)) = (fields.next(), fields.next()) else {
                return Err(RespValue::Nil.unexpected("CLUSTER SLOTS"));
            };
            let start = slot_number(start.into_integer("CLUSTER SLOTS")?)?;
            let end = slot_number(end.into_integer("CLUSTER SLOTS")?)?;

            let mut nodes = Vec::new();
            for node in fields {
                let mut parts = node.into_array("CLUSTER SLOTS")?.into_iter();
                let (Some(host), Some(port)) = (parts.next(), parts.next()) else {
                    return Err(RespValue::Nil.unexpected("CLUSTER SLOTS"));
                };
                let host = host.into_string("CLUSTER SLOTS")?;
                let port = port.into_integer("CLUSTER SLOTS")?;
                let host = if host.is_empty() { fallback_host } else { host.as_str() };
                nodes.push(format!("{host}:{port}"));
            }

            let mut nodes = nodes.into_iter();
            let Some(master) = nodes.next() else {
                return Err(RespValue::Nil.unexpected("CLUSTER SLOTS"));
            };
            ranges.push(SlotRange {
                start,
                end,
                master,
                replicas: nodes.collect(),
            });
        }

        ranges.sort_by_key(|r| r.start);
        Ok(Self { ranges })
    }

    pub(crate) fn lookup(
        &self,
        slot: u16,
    ) -> Option<&SlotRange> {
        let idx = self.ranges.partition_point(|r| r.start <= slot);
        let range = self.ranges.get(idx.checked_sub(1)?)?;
        (slot <= range.end).then_some(range)
    }

    /// Distinct masters in a stable order
    pub(crate) fn masters(&self) -> Vec<String> {
        let unique: BTreeSet<&String> = self.ranges.iter().map(|r| &r.master).collect();
        unique.into_iter().cloned().collect()
    }

    fn nodes(&self) -> BTreeSet<String> {
        self.ranges
            .iter()
            .flat_map(|r| std::iter::once(&r.master).chain(r.replicas.iter()))
            .cloned()
            .collect()
    }
}

fn slot_number(n: i64) -> Result<u16> {
    u16::try_from(n).map_err(|_| RespValue::Integer(n).unexpected("CLUSTER SLOTS"))
}

/// Client of a sharded cluster
pub struct ClusterClient {
    config: ClusterConfig,
    watch: WatchConfig,
    dialer: Dialer,
    replica_dialer: Dialer,
    slots: ArcSwap<SlotTable>,
    masters: DashMap<String, ConnectionPool>,
    replicas: DashMap<String, ConnectionPool>,
    latencies: DashMap<String, Duration>,
    closed: CancellationToken,
}

impl std::fmt::Debug for ClusterClient {
    fn fmt(
        &self,
        f: &mut std::fmt::Formatter<'_>,
    ) -> std::fmt::Result {
        f.debug_struct("ClusterClient")
            .field("endpoints", &self.config.endpoints)
            .field("slots", &**self.slots.load())
            .finish_non_exhaustive()
    }
}

impl ClusterClient {
    /// Discovers the slot layout from the first seed that answers
    pub async fn connect(
        config: &ClusterConfig,
        watch: &WatchConfig,
    ) -> Result<Self> {
        let dialer = Dialer::new(&config.client);
        let client = Self {
            config: config.clone(),
            watch: watch.clone(),
            replica_dialer: dialer.clone().readonly(true),
            dialer,
            slots: ArcSwap::from_pointee(SlotTable::default()),
            masters: DashMap::new(),
            replicas: DashMap::new(),
            latencies: DashMap::new(),
            closed: CancellationToken::new(),
        };

        client.refresh_slots(&config.endpoints).await?;
        info!(
            masters = client.slots.load().masters().len(),
            replica_reads = config.allow_read_from_replica,
            route_by_latency = config.route_by_latency,
            "Connected to cluster"
        );
        Ok(client)
    }

    /// Reloads the slot table from the first reachable endpoint
    async fn refresh_slots(
        &self,
        endpoints: &[String],
    ) -> Result<()> {
        let mut last_error: Option<Error> = None;
        for endpoint in endpoints {
            let reply = match self.master_pool(endpoint).call(command::cluster_slots()).await {
                Ok(reply) => reply,
                Err(e) => {
                    warn!(%endpoint, "CLUSTER SLOTS failed: {e}");
                    last_error = Some(e);
                    continue;
                }
            };
            let table = SlotTable::parse(reply.into_result()?, endpoint)?;
            debug!(%endpoint, ranges = table.ranges.len(), "Slot table refreshed");
            self.slots.store(Arc::new(table));

            if self.config.route_by_latency {
                self.measure_latencies().await;
            }
            return Ok(());
        }

        Err(last_error.unwrap_or_else(|| ConnectionError::Lost("no cluster endpoint answered".into()).into()))
    }

    async fn refresh_from_known(&self) -> Result<()> {
        let mut endpoints = self.slots.load().masters();
        endpoints.extend(self.config.endpoints.iter().cloned());
        self.refresh_slots(&endpoints).await
    }

    async fn measure_latencies(&self) {
        let nodes = self.slots.load().nodes();
        for node in nodes {
            let pool = self.pool_for(&node);
            let started = Instant::now();
            match pool.call(command::ping()).await {
                Ok(_) => {
                    self.latencies.insert(node, started.elapsed());
                }
                Err(e) => {
                    debug!(endpoint = %node, "Latency check failed: {e}");
                    self.latencies.remove(&node);
                }
            }
        }
    }

    fn master_pool(
        &self,
        endpoint: &str,
    ) -> ConnectionPool {
        self.masters
            .entry(endpoint.to_string())
            .or_insert_with(|| ConnectionPool::new(endpoint, self.dialer.clone(), &self.config.client))
            .clone()
    }

    fn replica_pool(
        &self,
        endpoint: &str,
    ) -> ConnectionPool {
        self.replicas
            .entry(endpoint.to_string())
            .or_insert_with(|| ConnectionPool::new(endpoint, self.replica_dialer.clone(), &self.config.client))
            .clone()
    }

    /// Pool for `endpoint`, using the read-only dialer for known replicas
    fn pool_for(
        &self,
        endpoint: &str,
    ) -> ConnectionPool {
        let is_replica = self
            .slots
            .load()
            .ranges
            .iter()
            .any(|r| r.replicas.iter().any(|e| e == endpoint));
        if is_replica {
            self.replica_pool(endpoint)
        } else {
            self.master_pool(endpoint)
        }
    }

    /// Node that should serve `command`
    fn route(
        &self,
        command: &Command,
    ) -> Result<ConnectionPool> {
        let slot = command.first_key().map(|k| hash_slot(k)).unwrap_or(0);
        let table = self.slots.load();
        let range = table
            .lookup(slot)
            .ok_or_else(|| ConnectionError::Lost(format!("no node serves slot {slot}")))?;

        if !command.is_read_only() {
            return Ok(self.master_pool(&range.master));
        }

        if self.config.route_by_latency {
            let fastest = std::iter::once(&range.master)
                .chain(range.replicas.iter())
                .filter_map(|e| self.latencies.get(e).map(|l| (*l, e.clone())))
                .min_by_key(|(latency, _)| *latency);
            if let Some((_, endpoint)) = fastest {
                return Ok(self.pool_for(&endpoint));
            }
        }

        if self.config.allow_read_from_replica {
            if let Some(replica) = range.replicas.choose(&mut rand::thread_rng()) {
                return Ok(self.replica_pool(replica));
            }
        }

        Ok(self.master_pool(&range.master))
    }

    /// Sends `command`, following `MOVED` and `ASK` redirects
    async fn execute(
        &self,
        command: Command,
    ) -> Result<RespValue> {
        if self.closed.is_cancelled() {
            return Err(ConnectionError::Closed.into());
        }

        let max_redirects = self.config.max_redirects();
        let mut target = self.route(&command)?;
        let mut asking = false;

        for _ in 0..=max_redirects {
            let reply = if asking {
                let mut replies = target.pipeline(vec![command::asking(), command.clone()]).await?;
                replies.pop().unwrap_or(RespValue::Nil)
            } else {
                target.call(command.clone()).await?
            };

            match reply.redirect() {
                Some(Redirect::Moved { slot, endpoint }) => {
                    debug!(slot, %endpoint, command = command.name(), "MOVED");
                    if let Err(e) = self.refresh_from_known().await {
                        warn!("Slot refresh after MOVED failed: {e}");
                    }
                    target = self.master_pool(&endpoint);
                    asking = false;
                }
                Some(Redirect::Ask { slot, endpoint }) => {
                    debug!(slot, %endpoint, command = command.name(), "ASK");
                    target = self.master_pool(&endpoint);
                    asking = true;
                }
                None => return reply.into_result(),
            }
        }

        Err(ConnectionError::TooManyRedirects(max_redirects).into())
    }
}

#[async_trait::async_trait]
impl StoreClient for ClusterClient {
    async fn get(
        &self,
        key: Bytes,
    ) -> Result<Option<StoredValue>> {
        let value = self.execute(command::get(key)).await?.into_optional_bytes("GET")?;
        Ok(value.map(|value| StoredValue { value, revision: 0 }))
    }

    async fn set(
        &self,
        key: Bytes,
        value: Bytes,
        ttl: Option<Duration>,
    ) -> Result<()> {
        self.execute(command::set(key, value, ttl)).await?.expect_ok("SET")
    }

    /// Keys are grouped per slot; each group is one `DEL`
    async fn del(
        &self,
        keys: Vec<Bytes>,
    ) -> Result<u64> {
        let mut by_slot: BTreeMap<u16, Vec<Bytes>> = BTreeMap::new();
        for key in keys {
            by_slot.entry(hash_slot(&key)).or_default().push(key);
        }

        let mut removed = 0u64;
        for (_, keys) in by_slot {
            let n = self.execute(command::del(keys)).await?.into_integer("DEL")?;
            removed += n.max(0) as u64;
        }
        Ok(removed)
    }

    /// Walks every master in turn; `ScanCursor::shard` is the master index
    async fn scan(
        &self,
        prefix: Bytes,
        cursor: ScanCursor,
        count: usize,
    ) -> Result<ScanPage> {
        if self.closed.is_cancelled() {
            return Err(ConnectionError::Closed.into());
        }

        let masters = self.slots.load().masters();
        let Some(endpoint) = masters.get(cursor.shard) else {
            return Ok(ScanPage::default());
        };

        let pool = self.master_pool(endpoint);
        let (keys, next) = scan_on(&pool, &prefix, cursor.position, count).await?;
        let next = match next {
            Some(position) => Some(ScanCursor {
                shard: cursor.shard,
                position,
            }),
            None if cursor.shard + 1 < masters.len() => Some(ScanCursor {
                shard: cursor.shard + 1,
                position: Bytes::new(),
            }),
            None => None,
        };
        Ok(ScanPage { keys, next })
    }

    /// `MULTI`/`EXEC` is node-local, so every key must share one slot
    async fn exec(
        &self,
        ops: Vec<StoreOp>,
    ) -> Result<()> {
        if self.closed.is_cancelled() {
            return Err(ConnectionError::Closed.into());
        }
        let slots: BTreeSet<u16> = ops.iter().map(|op| hash_slot(op.key())).collect();
        let slot = match slots.len() {
            0 => return Ok(()),
            1 => slots.into_iter().next().unwrap_or_default(),
            _ => return Err(TxnError::CrossSlot.into()),
        };

        let master = {
            let table = self.slots.load();
            let range = table
                .lookup(slot)
                .ok_or_else(|| ConnectionError::Lost(format!("no node serves slot {slot}")))?;
            range.master.clone()
        };

        match exec_on(&self.master_pool(&master), ops).await {
            Err(e) if error_redirect(&e).is_some() => {
                debug!(slot, "Transaction redirected, refreshing slot table");
                if let Err(refresh) = self.refresh_from_known().await {
                    warn!("Slot refresh failed: {refresh}");
                }
                Err(TxnError::Aborted.into())
            }
            other => other,
        }
    }

    /// Keyspace notifications are node-local: subscribe every master
    async fn subscribe(
        &self,
        prefixes: Vec<Bytes>,
    ) -> Result<Subscription> {
        if self.closed.is_cancelled() {
            return Err(ConnectionError::Closed.into());
        }

        let (tx, rx) = mpsc::channel(self.watch.subscription_buffer_size.max(1));
        let cancel = self.closed.child_token();
        let masters = self.slots.load().masters();
        for endpoint in masters {
            let conn = match pubsub::open(&self.dialer, &endpoint, &prefixes, &self.watch).await {
                Ok(conn) => conn,
                Err(e) => {
                    cancel.cancel();
                    return Err(e);
                }
            };
            tokio::spawn(pubsub::forward(conn, 0, tx.clone(), cancel.clone()));
        }
        Ok(Subscription::new(rx, cancel))
    }

    async fn close(&self) {
        if !self.closed.is_cancelled() {
            self.closed.cancel();
            for pool in self.masters.iter() {
                pool.close();
            }
            for pool in self.replicas.iter() {
                pool.close();
            }
            debug!("Cluster client closed");
        }
    }
}
