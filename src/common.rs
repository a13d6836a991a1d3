use connstring::Host;
use stream::StreamConnector;

use std::collections::BTreeMap;
use std::fmt;

/// Indicates which servers are suitable for read operations.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ReadMode {
    Primary,
    PrimaryPreferred,
    Secondary,
    SecondaryPreferred,
    Nearest,
}

impl fmt::Display for ReadMode {
    fn fmt(&self, fmt: &mut fmt::Formatter) -> fmt::Result {
        match *self {
            ReadMode::Primary => write!(fmt, "primary"),
            ReadMode::PrimaryPreferred => write!(fmt, "primaryPreferred"),
            ReadMode::Secondary => write!(fmt, "secondary"),
            ReadMode::SecondaryPreferred => write!(fmt, "secondaryPreferred"),
            ReadMode::Nearest => write!(fmt, "nearest"),
        }
    }
}

#[derive(Debug, Clone)]
pub struct ReadPreference {
    /// Indicates how a server should be selected during read operations.
    pub mode: ReadMode,
    /// Filters servers based on the first tag set that matches at least one server.
    pub tag_sets: Vec<BTreeMap<String, String>>,
}

impl ReadPreference {
    pub fn new(mode: ReadMode, tag_sets: Option<Vec<BTreeMap<String, String>>>) -> ReadPreference {
        ReadPreference {
            mode: mode,
            tag_sets: tag_sets.unwrap_or(Vec::new()),
        }
    }
}

impl fmt::Display for ReadPreference {
    fn fmt(&self, fmt: &mut fmt::Formatter) -> fmt::Result {
        write!(fmt, "ReadPreference {{ mode: {}, tag_sets: {:?} }}", self.mode, self.tag_sets)
    }
}

/// What an operation needs from the server it runs against.
#[derive(Debug, Clone)]
pub enum SelectionCriterion {
    /// The server must accept writes: a standalone, a mongos, or the replica
    /// set primary.
    Writable,
    /// The server must satisfy the given read preference.
    Readable(ReadPreference),
}

impl fmt::Display for SelectionCriterion {
    fn fmt(&self, fmt: &mut fmt::Formatter) -> fmt::Result {
        match self {
            &SelectionCriterion::Writable => write!(fmt, "a writable server"),
            &SelectionCriterion::Readable(ref pref) => write!(fmt, "{}", pref),
        }
    }
}

pub const DEFAULT_HEARTBEAT_FREQUENCY_MS: u64 = 10000;
pub const DEFAULT_MIN_HEARTBEAT_FREQUENCY_MS: u64 = 500;
pub const DEFAULT_SERVER_SELECTION_TIMEOUT_MS: u64 = 30000;
pub const DEFAULT_LOCAL_THRESHOLD_MS: u64 = 15;
pub const DEFAULT_MAX_POOL_SIZE: usize = 100;
pub const DEFAULT_WAIT_QUEUE_TIMEOUT_MS: u64 = 10000;
pub const DEFAULT_CONNECT_TIMEOUT_MS: u64 = 10000;

/// Recognized client configuration. Connection-string parsing lives outside
/// this crate; callers fill this struct in directly.
#[derive(Debug, Clone)]
pub struct ClientOptions {
    /// The initial seed list of servers to discover the topology from.
    pub hosts: Vec<Host>,
    /// The replica set name the client expects, if any. When set, servers
    /// reporting a different set name are removed from the topology.
    pub replica_set: Option<String>,
    /// How often each server is checked, in milliseconds.
    pub heartbeat_frequency_ms: u64,
    /// Lower bound between two checks of the same server, applied to
    /// immediate re-check requests.
    pub min_heartbeat_frequency_ms: u64,
    /// How long server selection may wait for a suitable server.
    pub server_selection_timeout_ms: u64,
    /// Width of the latency window over the fastest suitable server.
    pub local_threshold_ms: u64,
    /// Number of connections each pool keeps open in the background.
    pub min_pool_size: usize,
    /// Upper bound on connections per server.
    pub max_pool_size: usize,
    /// Idle connections older than this are closed by pool maintenance.
    /// Zero disables idle eviction.
    pub max_idle_time_ms: u64,
    /// Upper bound a checkout may spend waiting for a free connection.
    /// Zero leaves only the caller's own deadline in force.
    pub wait_queue_timeout_ms: u64,
    /// Timeout for establishing a single transport connection.
    pub connect_timeout_ms: u64,
    /// How transport connections are opened.
    pub stream_connector: StreamConnector,
}

impl ClientOptions {
    /// Returns options with the given seed list and defaults for everything
    /// else.
    pub fn new(hosts: Vec<Host>) -> ClientOptions {
        ClientOptions {
            hosts: hosts,
            replica_set: None,
            heartbeat_frequency_ms: DEFAULT_HEARTBEAT_FREQUENCY_MS,
            min_heartbeat_frequency_ms: DEFAULT_MIN_HEARTBEAT_FREQUENCY_MS,
            server_selection_timeout_ms: DEFAULT_SERVER_SELECTION_TIMEOUT_MS,
            local_threshold_ms: DEFAULT_LOCAL_THRESHOLD_MS,
            min_pool_size: 0,
            max_pool_size: DEFAULT_MAX_POOL_SIZE,
            max_idle_time_ms: 0,
            wait_queue_timeout_ms: DEFAULT_WAIT_QUEUE_TIMEOUT_MS,
            connect_timeout_ms: DEFAULT_CONNECT_TIMEOUT_MS,
            stream_connector: StreamConnector::Tcp,
        }
    }
}
