//! Redis client that rebuilds its connection after connection failures.

mod scan;

use std::{io, sync::Arc, time::Duration};

use redis::{Cmd, ConnectionInfo, IntoConnectionInfo, Pipeline, RedisError, RedisFuture, Value};
use redis::aio::{ConnectionLike, MultiplexedConnection};
use redis::cluster::ClusterClient;
use redis::cluster_async::ClusterConnection;
use serde::Deserialize;
use tokio::sync::OnceCell;

use crate::{
    config::{CLIENT_CLOSE_DELAY, Reloadable},
    error::Error,
    reconnect::{ClientFactory, Reconnectable, RefreshOutcome, RefreshPolicy, RefreshState, release_later},
};

pub use scan::{HSCAN_ONLY_KEYS, HSCAN_ONLY_VALUES, hscan_only_keys, hscan_only_values, paginate_scan};

/// Failures that mean the server is not accepting connections.
pub fn is_connection_refused(err: &RedisError) -> bool {
    err.is_connection_refusal()
        || err
            .to_string()
            .to_ascii_lowercase()
            .contains("connection refused")
}

/// Failures after which the cached connection cannot be trusted anymore:
/// refused dials, connections dropped by the server and other socket errors.
pub fn is_connection_lost(err: &RedisError) -> bool {
    is_connection_refused(err) || err.is_connection_dropped() || err.is_io_error()
}

/// Where the client connects to.
#[derive(Clone, Debug)]
pub enum Topology {
    Node(ConnectionInfo),
    Cluster {
        nodes: Vec<ConnectionInfo>,
        read_from_replicas: bool,
    },
}

enum Backend {
    Node(redis::Client),
    Cluster(ClusterClient),
}

/// Established connection to a single node or to a cluster.
#[derive(Clone)]
pub enum Connection {
    Node(MultiplexedConnection),
    Cluster(ClusterConnection),
}

impl ConnectionLike for Connection {
    fn req_packed_command<'a>(&'a mut self, cmd: &'a Cmd) -> RedisFuture<'a, Value> {
        match self {
            Connection::Node(conn) => conn.req_packed_command(cmd),
            Connection::Cluster(conn) => conn.req_packed_command(cmd),
        }
    }

    fn req_packed_commands<'a>(
        &'a mut self,
        cmd: &'a Pipeline,
        offset: usize,
        count: usize,
    ) -> RedisFuture<'a, Vec<Value>> {
        match self {
            Connection::Node(conn) => conn.req_packed_commands(cmd, offset, count),
            Connection::Cluster(conn) => conn.req_packed_commands(cmd, offset, count),
        }
    }

    fn get_db(&self) -> i64 {
        match self {
            Connection::Node(conn) => conn.get_db(),
            Connection::Cluster(conn) => conn.get_db(),
        }
    }
}

/// Connection that is only dialed on first use.
///
/// A refused dial leaves it unconnected, so the next call dials again. A
/// connection that broke after being established stays cached until the
/// wrapper replaces the whole instance.
pub struct LazyConnection {
    backend: Backend,
    response_timeout: Duration,
    connection_timeout: Duration,
    conn: OnceCell<Connection>,
}

impl LazyConnection {
    async fn get(&self) -> Result<Connection, RedisError> {
        self.conn.get_or_try_init(|| self.dial()).await.cloned()
    }

    async fn dial(&self) -> Result<Connection, RedisError> {
        match &self.backend {
            Backend::Node(client) => client
                .get_multiplexed_async_connection_with_timeouts(
                    self.response_timeout,
                    self.connection_timeout,
                )
                .await
                .map(Connection::Node),
            Backend::Cluster(client) => {
                tokio::time::timeout(self.connection_timeout, client.get_async_connection())
                    .await
                    .map_err(|_| RedisError::from(io::Error::from(io::ErrorKind::TimedOut)))?
                    .map(Connection::Cluster)
            }
        }
    }

    pub fn is_connected(&self) -> bool {
        self.conn.initialized()
    }
}

pub struct RedisFactory {
    topology: Topology,
    response_timeout: Duration,
    connection_timeout: Duration,
}

impl RedisFactory {
    pub fn topology(&self) -> &Topology {
        &self.topology
    }
}

impl ClientFactory for RedisFactory {
    type Client = LazyConnection;
    type Error = RedisError;

    fn name(&self) -> &str {
        "redis"
    }

    fn connect(&self) -> Result<LazyConnection, RedisError> {
        let backend = match &self.topology {
            Topology::Node(info) => Backend::Node(redis::Client::open(info.clone())?),
            Topology::Cluster {
                nodes,
                read_from_replicas,
            } => {
                let mut builder = ClusterClient::builder(nodes.clone());
                if *read_from_replicas {
                    builder = builder.read_from_replicas();
                }
                Backend::Cluster(builder.build()?)
            }
        };
        Ok(LazyConnection {
            backend,
            response_timeout: self.response_timeout,
            connection_timeout: self.connection_timeout,
            conn: OnceCell::new(),
        })
    }

    fn should_refresh(&self, err: &RedisError) -> bool {
        is_connection_lost(err)
    }
}

/// Cheap to clone. Implements [`ConnectionLike`], so any command or pipeline
/// can be sent through it with `query_async` or the `AsyncCommands` trait.
#[derive(Clone)]
pub struct ReconnectableRedis {
    inner: Arc<Reconnectable<RedisFactory>>,
}

impl ReconnectableRedis {
    pub fn new(cfg: &RedisCfg) -> Result<Self, Error> {
        let factory = RedisFactory {
            topology: cfg.topology()?,
            response_timeout: Duration::from_millis(cfg.response_timeout_ms),
            connection_timeout: Duration::from_millis(cfg.connection_timeout_ms),
        };
        let policy = RefreshPolicy {
            cooldown: Duration::from_millis(cfg.refresh_cooldown_ms),
            close_delay: Duration::from_millis(cfg.close_delay_ms),
        };
        Ok(Self {
            inner: Arc::new(Reconnectable::new(factory, policy)?),
        })
    }

    pub fn generation(&self) -> u64 {
        self.inner.generation()
    }

    pub fn state(&self) -> RefreshState {
        self.inner.state()
    }

    pub fn refresh(&self) -> RefreshOutcome {
        self.inner.refresh()
    }

    pub fn current(&self) -> Arc<LazyConnection> {
        self.inner.current()
    }

    pub fn topology(&self) -> &Topology {
        self.inner.factory().topology()
    }
}

impl ConnectionLike for ReconnectableRedis {
    fn req_packed_command<'a>(&'a mut self, cmd: &'a Cmd) -> RedisFuture<'a, Value> {
        Box::pin(async move {
            self.inner
                .execute(|conn| async move { conn.get().await?.req_packed_command(cmd).await })
                .await
        })
    }

    fn req_packed_commands<'a>(
        &'a mut self,
        cmd: &'a Pipeline,
        offset: usize,
        count: usize,
    ) -> RedisFuture<'a, Vec<Value>> {
        Box::pin(async move {
            self.inner
                .execute(|conn| async move {
                    conn.get()
                        .await?
                        .req_packed_commands(cmd, offset, count)
                        .await
                })
                .await
        })
    }

    fn get_db(&self) -> i64 {
        match self.topology() {
            Topology::Node(info) => info.redis.db,
            Topology::Cluster { .. } => 0,
        }
    }
}

/// Hot-reloadable Redis configuration. The client is rebuilt on every update.
///
/// A single entry in `addrs` (or `url` when `addrs` is empty) connects to one
/// node; several entries connect to a cluster seeded from them.
#[derive(Clone, Deserialize)]
pub struct RedisCfg {
    #[serde(default)]
    pub url: String,
    #[serde(default)]
    pub addrs: Vec<String>,
    /// Spreads cluster reads over replicas.
    #[serde(default = "default_read_from_replicas")]
    pub read_from_replicas: bool,
    #[serde(default = "default_refresh_cooldown_ms")]
    pub refresh_cooldown_ms: u64,
    #[serde(default = "default_close_delay_ms")]
    pub close_delay_ms: u64,
    #[serde(default = "default_response_timeout_ms")]
    pub response_timeout_ms: u64,
    #[serde(default = "default_connection_timeout_ms")]
    pub connection_timeout_ms: u64,
    #[serde(skip)]
    client: Option<ReconnectableRedis>,
}

fn default_read_from_replicas() -> bool {
    true
}

fn default_refresh_cooldown_ms() -> u64 {
    10_000
}

fn default_close_delay_ms() -> u64 {
    60_000
}

fn default_response_timeout_ms() -> u64 {
    3_000
}

fn default_connection_timeout_ms() -> u64 {
    5_000
}

impl RedisCfg {
    pub fn new(url: impl Into<String>) -> Self {
        Self {
            url: url.into(),
            addrs: Vec::new(),
            read_from_replicas: default_read_from_replicas(),
            refresh_cooldown_ms: default_refresh_cooldown_ms(),
            close_delay_ms: default_close_delay_ms(),
            response_timeout_ms: default_response_timeout_ms(),
            connection_timeout_ms: default_connection_timeout_ms(),
            client: None,
        }
    }

    pub fn cluster(addrs: impl IntoIterator<Item = impl Into<String>>) -> Self {
        Self {
            addrs: addrs.into_iter().map(Into::into).collect(),
            ..Self::new("")
        }
    }

    /// The client built by the last update, if building it succeeded.
    pub fn client(&self) -> Option<&ReconnectableRedis> {
        self.client.as_ref()
    }

    pub fn topology(&self) -> Result<Topology, Error> {
        match self.addrs.as_slice() {
            [] if self.url.is_empty() => Err(Error::Config("redis url or addrs must be set".into())),
            [] => Ok(Topology::Node(parse_addr(&self.url)?)),
            [addr] => Ok(Topology::Node(parse_addr(addr)?)),
            addrs => Ok(Topology::Cluster {
                nodes: addrs.iter().map(|addr| parse_addr(addr)).collect::<Result<_, _>>()?,
                read_from_replicas: self.read_from_replicas,
            }),
        }
    }
}

/// Accepts `redis://` URLs as well as bare `host:port` pairs.
fn parse_addr(addr: &str) -> Result<ConnectionInfo, Error> {
    let info = if addr.contains("://") {
        addr.into_connection_info()
    } else {
        format!("redis://{addr}").as_str().into_connection_info()
    };
    info.map_err(|err| Error::Config(format!("invalid redis address {addr:?}: {err}")))
}

impl std::fmt::Debug for RedisCfg {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("RedisCfg")
            .field("addrs", &self.addrs.len())
            .field("refresh_cooldown_ms", &self.refresh_cooldown_ms)
            .field("close_delay_ms", &self.close_delay_ms)
            .field("connected", &self.client.is_some())
            .finish_non_exhaustive()
    }
}

impl Reloadable for RedisCfg {
    fn on_update(old: Option<&Self>, new: &mut Self) {
        if let Some(client) = old.and_then(|old| old.client.as_ref()) {
            release_later(client.inner.clone(), CLIENT_CLOSE_DELAY, "redis".to_string());
        }
        new.client = match ReconnectableRedis::new(new) {
            Ok(client) => Some(client),
            Err(err) => {
                tracing::error!(error = %err, "failed to build redis client");
                None
            }
        };
    }
}
