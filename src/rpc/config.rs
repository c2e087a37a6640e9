use std::time::Duration;

use crate::common::{messages::MAX_PACKET_SIZE, Id, MAX_BUCKET_SIZE_K};

use super::server::Server;

/// Default request timeout before abandoning a transaction to a non-responding node.
pub const DEFAULT_REQUEST_TIMEOUT: Duration = Duration::from_secs(20);
/// Default number of concurrent requests per action.
pub const DEFAULT_CONCURRENCY: usize = 4;
/// Default number of acknowledging nodes after which a store is considered done.
pub const DEFAULT_STORE_REDUNDANCY: usize = 3;

#[derive(Debug)]
/// Dht Configurations
pub struct Config {
    /// Bootstrap nodes, as `host:port` strings.
    ///
    /// Defaults to an empty list, a node with no bootstrap nodes is its own network.
    pub bootstrap: Vec<String>,
    /// Explicit port to listen on.
    ///
    /// Defaults to None, trying [super::socket::DEFAULT_PORT] then any free port.
    pub port: Option<u16>,
    /// This node's identity.
    ///
    /// Defaults to None, where a random [Id] is generated.
    pub id: Option<Id>,
    /// Transaction timeout duration.
    ///
    /// Defaults to [DEFAULT_REQUEST_TIMEOUT]
    pub request_timeout: Duration,
    /// Bucket size, also the number of closest nodes an iterative lookup keeps.
    ///
    /// Defaults to [MAX_BUCKET_SIZE_K]
    pub k: usize,
    /// Maximum concurrent requests per action.
    ///
    /// Defaults to [DEFAULT_CONCURRENCY]
    pub concurrency: usize,
    /// Minimum number of nodes that should acknowledge a stored value.
    ///
    /// Defaults to [DEFAULT_STORE_REDUNDANCY]
    pub store_redundancy: usize,
    /// Largest datagram this node sends in response to a request.
    ///
    /// Defaults to [MAX_PACKET_SIZE]
    pub max_packet_size: usize,
    /// Server to respond to incoming Requests
    ///
    /// Defaults to None, where the [super::server::DefaultServer] will be used.
    pub server: Option<Box<dyn Server>>,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            bootstrap: Vec::new(),
            port: None,
            id: None,
            request_timeout: DEFAULT_REQUEST_TIMEOUT,
            k: MAX_BUCKET_SIZE_K,
            concurrency: DEFAULT_CONCURRENCY,
            store_redundancy: DEFAULT_STORE_REDUNDANCY,
            max_packet_size: MAX_PACKET_SIZE,
            server: None,
        }
    }
}
