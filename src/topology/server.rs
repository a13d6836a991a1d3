use Error;
use Result;

use bson::{self, oid};
use chrono::{DateTime, Utc};

use connstring::Host;
use pool::ConnectionPool;

use std::collections::BTreeMap;
use std::fmt;
use std::str::FromStr;
use std::sync::Arc;
use std::thread;

use super::monitor::{HelloResult, Monitor};

/// Describes the server role within a server set.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum ServerType {
    /// Standalone server.
    Standalone,
    /// Shard router.
    Mongos,
    /// A server another replica set member reported as primary, not yet
    /// confirmed by its own handshake.
    PossiblePrimary,
    /// Replica set primary.
    RSPrimary,
    /// Replica set secondary.
    RSSecondary,
    /// Replica set arbiter.
    RSArbiter,
    /// Replica set member of some other type.
    RSOther,
    /// Replica set ghost member.
    RSGhost,
    /// Server type is currently unknown.
    Unknown,
}

impl FromStr for ServerType {
    type Err = Error;
    fn from_str(s: &str) -> Result<Self> {
        Ok(match s {
            "Standalone" => ServerType::Standalone,
            "Mongos" => ServerType::Mongos,
            "PossiblePrimary" => ServerType::PossiblePrimary,
            "RSPrimary" => ServerType::RSPrimary,
            "RSSecondary" => ServerType::RSSecondary,
            "RSArbiter" => ServerType::RSArbiter,
            "RSOther" => ServerType::RSOther,
            "RSGhost" => ServerType::RSGhost,
            _ => ServerType::Unknown,
        })
    }
}

impl ServerType {
    /// Whether servers of this type hold data and answer queries.
    pub fn is_data_bearing(&self) -> bool {
        match *self {
            ServerType::Standalone |
            ServerType::Mongos |
            ServerType::RSPrimary |
            ServerType::RSSecondary => true,
            _ => false,
        }
    }
}

/// The monotonic counter pair a server attaches to its handshake replies.
/// Replies that do not advance the counter for the same process are stale
/// and must be discarded.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct TopologyVersion {
    pub process_id: oid::ObjectId,
    pub counter: i64,
}

impl TopologyVersion {
    /// Whether a reply carrying `new` must be discarded given that `current`
    /// was already accepted. Replies from a different process, or with a
    /// missing counter on either side, are never considered stale.
    pub fn is_stale(current: &Option<TopologyVersion>, new: &Option<TopologyVersion>) -> bool {
        match (current.as_ref(), new.as_ref()) {
            (Some(current), Some(new)) if current.process_id == new.process_id => {
                new.counter <= current.counter
            }
            _ => false,
        }
    }
}

/// Server information gathered from a single monitor check. Descriptions are
/// immutable: every check produces a fresh one and the previous one is
/// discarded, never edited.
#[derive(Clone, Debug)]
pub struct ServerDescription {
    /// The address the server was contacted at; its identity in the topology.
    pub address: Host,
    /// The server type.
    pub server_type: ServerType,
    /// The error that failed the last check, if it failed.
    pub error: Arc<Option<Error>>,
    /// Exponentially weighted moving average of the check round-trip time,
    /// in milliseconds. None until the first successful check.
    pub round_trip_time: Option<f64>,
    /// The minimum wire version supported by this server.
    pub min_wire_version: i64,
    /// The maximum wire version supported by this server.
    pub max_wire_version: i64,
    /// The address the server believes it is reachable at.
    pub me: Option<Host>,
    /// All voting, data-bearing hosts in the replica set known by this server.
    pub hosts: Vec<Host>,
    /// All passive members of the replica set known by this server.
    pub passives: Vec<Host>,
    /// All arbiters in the replica set known by this server.
    pub arbiters: Vec<Host>,
    /// Server tags for targeted read operations on specific members.
    pub tags: BTreeMap<String, String>,
    /// The replica set name.
    pub set_name: Option<String>,
    /// The replica set version.
    pub set_version: Option<i64>,
    /// The server's current election id, if it believes it is a primary.
    pub election_id: Option<oid::ObjectId>,
    /// The server's opinion of who the primary is.
    pub primary: Option<Host>,
    /// When this description was produced.
    pub last_update_time: Option<DateTime<Utc>>,
    /// How long the server keeps logical sessions alive, in minutes.
    pub logical_session_timeout_minutes: Option<i64>,
    /// The stale-reply guard counter from the handshake.
    pub topology_version: Option<TopologyVersion>,
    /// The cluster time the server reported, gossiped back on later commands.
    pub cluster_time: Option<bson::Document>,
}

impl ServerDescription {
    /// Returns a default, unknown server description for the address.
    pub fn new(address: Host) -> ServerDescription {
        ServerDescription {
            address: address,
            server_type: ServerType::Unknown,
            error: Arc::new(None),
            round_trip_time: None,
            min_wire_version: 0,
            max_wire_version: 0,
            me: None,
            hosts: Vec::new(),
            passives: Vec::new(),
            arbiters: Vec::new(),
            tags: BTreeMap::new(),
            set_name: None,
            set_version: None,
            election_id: None,
            primary: None,
            last_update_time: None,
            logical_session_timeout_minutes: None,
            topology_version: None,
            cluster_time: None,
        }
    }

    /// Builds a description from a successful handshake reply.
    pub fn from_hello(address: Host, hello: HelloResult,
                      round_trip_time: Option<f64>) -> ServerDescription {
        let server_type = if !hello.ok {
            ServerType::Unknown
        } else if hello.msg == "isdbgrid" {
            ServerType::Mongos
        } else if hello.set_name.is_some() {
            if hello.is_writable_primary {
                ServerType::RSPrimary
            } else if hello.secondary {
                ServerType::RSSecondary
            } else if hello.arbiter_only {
                ServerType::RSArbiter
            } else {
                ServerType::RSOther
            }
        } else if hello.is_replica_set {
            ServerType::RSGhost
        } else {
            ServerType::Standalone
        };

        ServerDescription {
            address: address,
            server_type: server_type,
            error: Arc::new(None),
            round_trip_time: round_trip_time,
            min_wire_version: hello.min_wire_version,
            max_wire_version: hello.max_wire_version,
            me: hello.me,
            hosts: hello.hosts,
            passives: hello.passives,
            arbiters: hello.arbiters,
            tags: hello.tags,
            set_name: hello.set_name,
            set_version: hello.set_version,
            election_id: hello.election_id,
            primary: hello.primary,
            last_update_time: Some(Utc::now()),
            logical_session_timeout_minutes: hello.logical_session_timeout_minutes,
            topology_version: hello.topology_version,
            cluster_time: hello.cluster_time,
        }
    }

    /// Builds an unknown description from a failed check. It carries no
    /// topology version, so whatever the server says once it is reachable
    /// again is accepted.
    pub fn from_error(address: Host, error: Error) -> ServerDescription {
        let mut description = ServerDescription::new(address);
        description.error = Arc::new(Some(error));
        description.last_update_time = Some(Utc::now());
        description
    }

    /// All addresses this server claims are members of its replica set.
    pub fn all_hosts(&self) -> Vec<Host> {
        let mut all = Vec::with_capacity(self.hosts.len() + self.passives.len() +
                                         self.arbiters.len());
        all.extend(self.hosts.iter().cloned());
        all.extend(self.passives.iter().cloned());
        all.extend(self.arbiters.iter().cloned());
        all
    }

    /// Folds a new round-trip sample into the previous average. The most
    /// recent sample carries a fifth of the weight.
    pub fn round_trip_average(previous: Option<f64>, sample: f64) -> f64 {
        match previous {
            Some(previous) => 0.2 * sample + 0.8 * previous,
            None => sample,
        }
    }
}

impl fmt::Display for ServerDescription {
    fn fmt(&self, fmt: &mut fmt::Formatter) -> fmt::Result {
        write!(fmt, "{}: {:?}", self.address, self.server_type)?;
        if let Some(rtt) = self.round_trip_time {
            write!(fmt, " ({:.1} ms)", rtt)?;
        }
        if let Some(ref err) = *self.error {
            write!(fmt, " [{}]", err)?;
        }
        Ok(())
    }
}

/// Holds the live resources for one member of the topology: its connection
/// pool and its monitor. Descriptions live in the topology snapshot; this
/// record owns what must be started and stopped as membership changes.
#[derive(Clone)]
pub struct Server {
    /// Host connection details.
    pub host: Host,
    pool: Arc<ConnectionPool>,
    monitor: Arc<Monitor>,
}

impl Server {
    /// Creates a server record, starting its monitor thread and pool
    /// maintenance unless `run_background` is false.
    pub fn new(host: Host, pool: ConnectionPool, monitor: Monitor,
               run_background: bool) -> Server {
        let pool = Arc::new(pool);
        let monitor = Arc::new(monitor);

        if run_background {
            pool.start_maintenance();

            let monitor_clone = monitor.clone();
            let spawned = thread::Builder::new()
                .name("server-monitor".to_string())
                .spawn(move || monitor_clone.run());

            match spawned {
                Ok(handle) => monitor.set_handle(handle),
                Err(_) => (),
            }
        }

        Server {
            host: host,
            pool: pool,
            monitor: monitor,
        }
    }

    /// The connection pool for this server.
    pub fn pool(&self) -> Arc<ConnectionPool> {
        self.pool.clone()
    }

    /// The monitor for this server.
    pub fn monitor(&self) -> Arc<Monitor> {
        self.monitor.clone()
    }

    /// Asks the monitor to re-check the server as soon as possible.
    pub fn request_check(&self) {
        self.monitor.request_check();
    }

    /// Stops the monitor and closes the pool. Joins the monitor thread
    /// unless this is called from it.
    pub fn shutdown(&self) {
        self.monitor.stop();
        self.pool.close();
        self.monitor.join();
    }
}
