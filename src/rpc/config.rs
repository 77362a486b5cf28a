use std::{
    net::{IpAddr, Ipv4Addr},
    path::PathBuf,
    time::Duration,
};

use crate::common::{Id, DEFAULT_STORAGE_TTL, MAX_BUCKET_SIZE_K};

/// Port tried first when none is given, falling back to any free port.
pub const DEFAULT_PORT: u16 = 8468;
/// Default request timeout before abandoning an inflight request to a non-responding node.
pub const DEFAULT_REQUEST_TIMEOUT: Duration = Duration::from_secs(5);
/// Number of nodes queried concurrently in each round of a lookup.
pub const DEFAULT_ALPHA: usize = 3;
/// Interval between routing table refreshes and republishing of stored values.
pub const DEFAULT_REFRESH_INTERVAL: Duration = Duration::from_secs(5 * 60);
/// Interval between snapshots when [Config::state_path] is set.
pub const DEFAULT_SAVE_STATE_FREQUENCY: Duration = Duration::from_secs(10 * 60);

#[derive(Debug, Clone)]
/// Dht Configurations
pub struct Config {
    /// Bootstrap nodes, as `host:port` strings.
    ///
    /// Defaults to none, in which case the node starts alone and
    /// waits for others to bootstrap off of it.
    pub bootstrap: Vec<String>,
    /// Explicit port to listen on.
    ///
    /// Defaults to None, trying [DEFAULT_PORT] then any free port.
    pub port: Option<u16>,
    /// Interface to listen on.
    ///
    /// Defaults to `0.0.0.0`
    pub bind_address: IpAddr,
    /// Explicit Id for this node.
    ///
    /// Defaults to None, where a random Id is used.
    pub id: Option<Id>,
    /// Bucket size and replication factor.
    ///
    /// Defaults to [MAX_BUCKET_SIZE_K]
    pub k: usize,
    /// Lookup parallelism.
    ///
    /// Defaults to [DEFAULT_ALPHA]
    pub alpha: usize,
    /// UDP socket request timeout duration.
    ///
    /// A call to a node that didn't respond within this duration fails,
    /// and the node is removed from the routing table.
    ///
    /// Defaults to [DEFAULT_REQUEST_TIMEOUT]
    pub request_timeout: Duration,
    /// How often to refresh lonely buckets and republish stored values.
    ///
    /// Defaults to [DEFAULT_REFRESH_INTERVAL]
    pub refresh_interval: Duration,
    /// Time to live of stored values, `None` keeps them forever.
    ///
    /// Defaults to [DEFAULT_STORAGE_TTL]
    pub storage_ttl: Option<Duration>,
    /// Where to regularly save this node's state, see [crate::Dht::save_state].
    ///
    /// Defaults to None
    pub state_path: Option<PathBuf>,
    /// How often to save the state to [Config::state_path].
    ///
    /// Defaults to [DEFAULT_SAVE_STATE_FREQUENCY]
    pub save_state_frequency: Duration,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            bootstrap: vec![],
            port: None,
            bind_address: IpAddr::V4(Ipv4Addr::UNSPECIFIED),
            id: None,
            k: MAX_BUCKET_SIZE_K,
            alpha: DEFAULT_ALPHA,
            request_timeout: DEFAULT_REQUEST_TIMEOUT,
            refresh_interval: DEFAULT_REFRESH_INTERVAL,
            storage_ttl: Some(DEFAULT_STORAGE_TTL),
            state_path: None,
            save_state_frequency: DEFAULT_SAVE_STATE_FREQUENCY,
        }
    }
}
