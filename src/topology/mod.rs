//! Server discovery and monitoring.
//!
//! The topology folds every server observation into an immutable
//! `TopologyDescription` snapshot behind a single writer. Readers copy the
//! current snapshot without locking each other out, selection requests wait
//! for snapshots that satisfy them, and monitors feed the fold from their
//! heartbeat loops.
pub mod monitor;
pub mod select;
pub mod server;

use Result;
use Error::{self, ArgumentError, CompatibilityError, OperationError, SelectionTimeout};

use apm::{Event, Listener};
use bson::{self, Bson, oid};
use common::{ClientOptions, SelectionCriterion};
use connstring::Host;
use pool::{ConnectionPool, PoolOptions, PooledStream};

use rand::{thread_rng, Rng};

use std::collections::{BTreeMap, HashMap};
use std::fmt;
use std::sync::{Arc, Condvar, Mutex};
use std::time::{Duration, Instant};

use self::monitor::Monitor;
use self::server::{Server, ServerDescription, ServerType, TopologyVersion};

/// The lowest wire version this client can speak.
pub const MIN_WIRE_VERSION: i64 = 6;
/// The highest wire version this client can speak.
pub const MAX_WIRE_VERSION: i64 = 21;

/// Describes the type of topology for a server set.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum TopologyType {
    Single,
    ReplicaSetNoPrimary,
    ReplicaSetWithPrimary,
    Sharded,
    Unknown,
}

/// An immutable snapshot of everything known about the server set. A new
/// snapshot is produced by every accepted observation; existing snapshots
/// are never edited.
#[derive(Clone, Debug)]
pub struct TopologyDescription {
    pub topology_type: TopologyType,
    /// The replica set name, learned from configuration or the first member
    /// seen.
    pub set_name: Option<String>,
    /// The largest replica set version any primary has claimed.
    pub max_set_version: Option<i64>,
    /// The election id accompanying the largest claimed set version.
    pub max_election_id: Option<oid::ObjectId>,
    /// The authoritative membership list, keyed by address.
    pub servers: BTreeMap<Host, ServerDescription>,
    /// False when some server's wire versions do not overlap this client's.
    pub compatible: bool,
    pub compatibility_error: Option<String>,
    /// Minimum logical session timeout over all data-bearing servers. None
    /// if any of them does not report one.
    pub logical_session_timeout_minutes: Option<i64>,
    /// Configuration carried on the snapshot so selection only needs the
    /// snapshot itself.
    pub heartbeat_frequency_ms: u64,
    pub local_threshold_ms: u64,
}

impl TopologyDescription {
    /// Returns a default, unknown topology description with no servers.
    pub fn new() -> TopologyDescription {
        TopologyDescription {
            topology_type: TopologyType::Unknown,
            set_name: None,
            max_set_version: None,
            max_election_id: None,
            servers: BTreeMap::new(),
            compatible: true,
            compatibility_error: None,
            logical_session_timeout_minutes: None,
            heartbeat_frequency_ms: ::common::DEFAULT_HEARTBEAT_FREQUENCY_MS,
            local_threshold_ms: ::common::DEFAULT_LOCAL_THRESHOLD_MS,
        }
    }

    /// Builds the initial description from the client configuration: every
    /// seed starts Unknown, and the type is ReplicaSetNoPrimary when a set
    /// name is expected, Unknown otherwise.
    pub fn from_options(options: &ClientOptions) -> Result<TopologyDescription> {
        if options.hosts.is_empty() {
            return Err(ArgumentError("At least one seed host is required.".to_owned()));
        }

        let mut description = TopologyDescription::new();
        description.heartbeat_frequency_ms = options.heartbeat_frequency_ms;
        description.local_threshold_ms = options.local_threshold_ms;

        if options.replica_set.is_some() {
            description.topology_type = TopologyType::ReplicaSetNoPrimary;
            description.set_name = options.replica_set.clone();
        }

        for host in options.hosts.iter() {
            description.servers.insert(host.clone(), ServerDescription::new(host.clone()));
        }

        Ok(description)
    }

    /// Folds one server observation into this snapshot, producing the next
    /// one. Pure: folding the same description twice yields the same result
    /// as folding it once, and the input snapshot is never modified.
    pub fn update(&self, server_description: ServerDescription) -> TopologyDescription {
        let mut next = self.clone();
        next.apply(server_description);
        next.recompute_derived_fields();
        next
    }

    // The transition table. Observations for addresses that are no longer
    // members are ignored; a slow heartbeat reply can arrive after removal.
    fn apply(&mut self, server_description: ServerDescription) {
        let address = server_description.address.clone();
        if !self.servers.contains_key(&address) {
            return;
        }

        let server_type = server_description.server_type;
        self.servers.insert(address.clone(), server_description);

        match self.topology_type {
            TopologyType::Unknown => {
                match server_type {
                    ServerType::Standalone => self.update_unknown_with_standalone(&address),
                    ServerType::Mongos => self.topology_type = TopologyType::Sharded,
                    ServerType::RSPrimary => self.update_rs_from_primary(&address),
                    ServerType::RSSecondary |
                    ServerType::RSArbiter |
                    ServerType::RSOther => self.update_rs_without_primary(&address),
                    _ => (),
                }
            }
            TopologyType::ReplicaSetNoPrimary => {
                match server_type {
                    ServerType::Standalone | ServerType::Mongos => {
                        self.servers.remove(&address);
                    }
                    ServerType::RSPrimary => self.update_rs_from_primary(&address),
                    ServerType::RSSecondary |
                    ServerType::RSArbiter |
                    ServerType::RSOther => self.update_rs_without_primary(&address),
                    _ => (),
                }
            }
            TopologyType::ReplicaSetWithPrimary => {
                match server_type {
                    ServerType::Standalone | ServerType::Mongos => {
                        self.servers.remove(&address);
                        self.check_if_has_primary();
                    }
                    ServerType::RSPrimary => self.update_rs_from_primary(&address),
                    ServerType::RSSecondary |
                    ServerType::RSArbiter |
                    ServerType::RSOther => self.update_rs_with_primary_from_member(&address),
                    // An Unknown or ghost observation may have taken the
                    // primary away.
                    _ => self.check_if_has_primary(),
                }
            }
            TopologyType::Sharded => {
                match server_type {
                    ServerType::Unknown | ServerType::Mongos => (),
                    _ => {
                        self.servers.remove(&address);
                    }
                }
            }
            TopologyType::Single => (),
        }
    }

    // Updates an unknown topology with a new standalone server description.
    fn update_unknown_with_standalone(&mut self, address: &Host) {
        if self.servers.len() == 1 {
            self.topology_type = TopologyType::Single;
        } else {
            // A standalone among several seeds cannot be part of the set
            // being discovered.
            self.servers.remove(address);
        }
    }

    // Updates a replica set topology from a server claiming to be primary.
    fn update_rs_from_primary(&mut self, address: &Host) {
        let description = match self.servers.get(address) {
            Some(description) => description.clone(),
            None => return,
        };

        if self.set_name.is_none() {
            self.set_name = description.set_name.clone();
        } else if self.set_name != description.set_name {
            // Primary from the wrong replica set.
            self.servers.remove(address);
            self.check_if_has_primary();
            return;
        }

        // A claim whose (setVersion, electionId) pair is behind the recorded
        // maximum comes from a stale primary: the observation is downgraded
        // to Unknown and the recorded maximum stands.
        if let (Some(set_version), Some(election_id)) =
            (description.set_version, description.election_id.clone()) {
            if let (Some(max_set_version), Some(max_election_id)) =
                (self.max_set_version, self.max_election_id.clone()) {
                if max_set_version > set_version ||
                   (max_set_version == set_version && max_election_id > election_id) {
                    self.servers.insert(address.clone(), ServerDescription::new(address.clone()));
                    self.check_if_has_primary();
                    return;
                }
            }
            self.max_election_id = Some(election_id);
        }

        if let Some(set_version) = description.set_version {
            if self.max_set_version.map_or(true, |max| set_version > max) {
                self.max_set_version = Some(set_version);
            }
        }

        // There can be at most one primary; any other one is demoted until
        // its own next heartbeat.
        let demoted: Vec<Host> = self.servers
            .iter()
            .filter(|&(host, server)| {
                server.server_type == ServerType::RSPrimary && host != address
            })
            .map(|(host, _)| host.clone())
            .collect();

        for host in demoted {
            self.servers.insert(host.clone(), ServerDescription::new(host));
        }

        // The primary's member list is authoritative: new members are added
        // as Unknown, and servers it does not list are dropped.
        let members = description.all_hosts();
        for host in members.iter() {
            if !self.servers.contains_key(host) {
                self.servers.insert(host.clone(), ServerDescription::new(host.clone()));
            }
        }

        let dropped: Vec<Host> = self.servers
            .keys()
            .filter(|host| !members.contains(*host))
            .cloned()
            .collect();

        for host in dropped {
            self.servers.remove(&host);
        }

        self.check_if_has_primary();
    }

    // Updates a replica set topology from a non-primary member while no
    // primary is known.
    fn update_rs_without_primary(&mut self, address: &Host) {
        self.topology_type = TopologyType::ReplicaSetNoPrimary;

        let description = match self.servers.get(address) {
            Some(description) => description.clone(),
            None => return,
        };

        if self.set_name.is_none() {
            self.set_name = description.set_name.clone();
        } else if self.set_name != description.set_name {
            self.servers.remove(address);
            return;
        }

        // A non-primary's view adds members but never removes them.
        for host in description.all_hosts() {
            if !self.servers.contains_key(&host) {
                self.servers.insert(host.clone(), ServerDescription::new(host));
            }
        }

        // Note who this member thinks the primary is, so its monitor can be
        // prioritized.
        if let Some(primary) = description.primary.clone() {
            let unconfirmed = self.servers
                .get(&primary)
                .map_or(false, |server| server.server_type == ServerType::Unknown);
            if unconfirmed {
                let mut marked = ServerDescription::new(primary.clone());
                marked.server_type = ServerType::PossiblePrimary;
                self.servers.insert(primary, marked);
            }
        }

        if let Some(me) = description.me {
            if &me != address {
                self.servers.remove(address);
            }
        }
    }

    // Updates a replica set topology from a non-primary member while a
    // primary is known.
    fn update_rs_with_primary_from_member(&mut self, address: &Host) {
        let description = match self.servers.get(address) {
            Some(description) => description.clone(),
            None => return,
        };

        let me_mismatch = description.me.as_ref().map_or(false, |me| me != address);
        if self.set_name != description.set_name || me_mismatch {
            self.servers.remove(address);
        }

        self.check_if_has_primary();
    }

    // Degrades to ReplicaSetNoPrimary if no primary remains.
    fn check_if_has_primary(&mut self) {
        let has_primary = self.servers
            .values()
            .any(|server| server.server_type == ServerType::RSPrimary);

        self.topology_type = if has_primary {
            TopologyType::ReplicaSetWithPrimary
        } else {
            TopologyType::ReplicaSetNoPrimary
        };
    }

    // Recomputes wire-version compatibility and the session timeout bound
    // after a fold.
    fn recompute_derived_fields(&mut self) {
        self.compatible = true;
        self.compatibility_error = None;

        for (host, server) in self.servers.iter() {
            match server.server_type {
                ServerType::Unknown | ServerType::PossiblePrimary => continue,
                _ => (),
            }

            if server.min_wire_version > MAX_WIRE_VERSION {
                self.compatible = false;
                self.compatibility_error = Some(format!(
                    "Server at {} requires wire version {}, but this client only supports up \
                     to {}.",
                    host, server.min_wire_version, MAX_WIRE_VERSION));
                break;
            }

            if server.max_wire_version < MIN_WIRE_VERSION {
                self.compatible = false;
                self.compatibility_error = Some(format!(
                    "Server at {} reports maximum wire version {}, but this client requires \
                     at least {}.",
                    host, server.max_wire_version, MIN_WIRE_VERSION));
                break;
            }
        }

        let mut minimum = None;
        let mut all_report = true;
        for server in self.servers.values() {
            if !server.server_type.is_data_bearing() {
                continue;
            }
            match server.logical_session_timeout_minutes {
                Some(minutes) => {
                    minimum = Some(match minimum {
                        Some(current) if current < minutes => current,
                        _ => minutes,
                    });
                }
                None => all_report = false,
            }
        }

        self.logical_session_timeout_minutes = if all_report { minimum } else { None };
    }
}

impl fmt::Display for TopologyDescription {
    fn fmt(&self, fmt: &mut fmt::Formatter) -> fmt::Result {
        write!(fmt, "{{ type: {:?}", self.topology_type)?;
        if let Some(ref set_name) = self.set_name {
            write!(fmt, ", set: {}", set_name)?;
        }
        write!(fmt, ", servers: [")?;
        for (index, server) in self.servers.values().enumerate() {
            if index > 0 {
                write!(fmt, ", ")?;
            }
            write!(fmt, "{}", server)?;
        }
        write!(fmt, "] }}")
    }
}

/// The shared core of a topology: configuration, the current snapshot, the
/// live server records, and the selection waiters. All writes go through
/// `process` under one lock.
pub struct TopologyInner {
    options: ClientOptions,
    state: Mutex<TopologyState>,
    // Selection requests wait here; every accepted fold notifies them.
    waiters: Condvar,
    listener: Arc<Listener>,
    run_background: bool,
}

struct TopologyState {
    description: Arc<TopologyDescription>,
    servers: HashMap<Host, Server>,
    cluster_time: Option<bson::Document>,
    closed: bool,
}

/// Holds status and connection information about a server set.
#[derive(Clone)]
pub struct Topology {
    inner: Arc<TopologyInner>,
}

impl Topology {
    /// Returns a new topology seeded from the options, with monitoring and
    /// pool maintenance running in the background.
    pub fn new(options: ClientOptions, listener: Arc<Listener>) -> Result<Topology> {
        Topology::init(options, listener, true)
    }

    /// Returns a topology with no background threads. Observations are fed
    /// in through `process_server_description`; used for embedding and for
    /// tests that drive the state machine directly.
    pub fn new_without_monitors(options: ClientOptions,
                                listener: Arc<Listener>) -> Result<Topology> {
        Topology::init(options, listener, false)
    }

    fn init(options: ClientOptions, listener: Arc<Listener>,
            run_background: bool) -> Result<Topology> {
        let description = TopologyDescription::from_options(&options)?;
        let seeds: Vec<Host> = description.servers.keys().cloned().collect();

        let inner = Arc::new(TopologyInner {
            options: options,
            state: Mutex::new(TopologyState {
                description: Arc::new(description),
                servers: HashMap::new(),
                cluster_time: None,
                closed: false,
            }),
            waiters: Condvar::new(),
            listener: listener,
            run_background: run_background,
        });

        {
            let mut state = inner.state.lock()?;
            for host in seeds {
                let server = TopologyInner::spawn_server(&inner, &host);
                state.servers.insert(host, server);
            }
        }

        Ok(Topology { inner: inner })
    }

    /// The current topology snapshot.
    pub fn description(&self) -> Result<Arc<TopologyDescription>> {
        self.inner.description()
    }

    /// The live record for a member server, if it is still one.
    pub fn server(&self, host: &Host) -> Option<Server> {
        self.inner
            .state
            .lock()
            .ok()
            .and_then(|state| state.servers.get(host).cloned())
    }

    /// The highest cluster time any server has reported.
    pub fn cluster_time(&self) -> Option<bson::Document> {
        self.inner
            .state
            .lock()
            .ok()
            .and_then(|state| state.cluster_time.clone())
    }

    /// The configuration this topology was built from.
    pub fn options(&self) -> &ClientOptions {
        &self.inner.options
    }

    /// Folds a server observation into the topology. Monitors call this
    /// from their heartbeat loops; tests call it directly.
    pub fn process_server_description(&self, description: ServerDescription) {
        TopologyInner::process(&self.inner, description);
    }

    /// Selects a server matching the criterion, waiting for topology
    /// updates until the timeout elapses. Fails immediately when the
    /// topology is incompatible with this client.
    pub fn select_server(&self, criterion: &SelectionCriterion,
                         timeout: Duration) -> Result<ServerHandle> {
        TopologyInner::select_server(&self.inner, criterion, timeout)
    }

    /// Stops all monitors, fails pending selections, and closes all pools.
    /// Idempotent.
    pub fn shutdown(&self) {
        TopologyInner::shutdown(&self.inner);
    }
}

impl TopologyInner {
    fn description(&self) -> Result<Arc<TopologyDescription>> {
        let state = self.state.lock()?;
        Ok(state.description.clone())
    }

    fn spawn_server(inner: &Arc<TopologyInner>, host: &Host) -> Server {
        let pool = ConnectionPool::new(host.clone(),
                                       PoolOptions::from_client_options(&inner.options),
                                       inner.listener.clone());
        let monitor = Monitor::new(host.clone(),
                                   Arc::downgrade(inner),
                                   inner.listener.clone(),
                                   &inner.options);
        Server::new(host.clone(), pool, monitor, inner.run_background)
    }

    /// Applies one observation: guards against stale replies, folds, keeps
    /// server records in step with membership, and wakes selection waiters.
    /// All under the single writer lock, so every waiter sees the same
    /// resulting snapshot.
    pub fn process(inner: &Arc<TopologyInner>, description: ServerDescription) {
        let mut removed: Vec<Server> = Vec::new();
        let mut events: Vec<Event> = Vec::new();

        {
            let mut state = match inner.state.lock() {
                Ok(state) => state,
                Err(_) => return,
            };

            if state.closed {
                return;
            }

            let current = state.description.clone();

            // Ignore observations for servers that were already removed.
            let previous = match current.servers.get(&description.address) {
                Some(previous) => previous.clone(),
                None => return,
            };

            // Out-of-order replies never regress state. Descriptions built
            // from failed checks carry no version and always pass.
            if TopologyVersion::is_stale(&previous.topology_version,
                                         &description.topology_version) {
                return;
            }

            if let Some(ref cluster_time) = description.cluster_time {
                advance_cluster_time(&mut state.cluster_time, cluster_time);
            }

            let address = description.address.clone();
            let previous_type = previous.server_type;
            let failed = description.error.is_some();

            let next = Arc::new(current.update(description));

            // Pool lifecycle for the observed server: a failed check
            // invalidates every connection in the same update cycle; a
            // recovery makes a cleared pool usable again.
            if let Some(server) = state.servers.get(&address) {
                if failed && previous_type != ServerType::Unknown {
                    server.pool().clear();
                } else if !failed && previous_type == ServerType::Unknown {
                    server.pool().mark_ready();
                }
            }

            // Keep the server records in step with the membership list.
            for host in next.servers.keys() {
                if !state.servers.contains_key(host) {
                    let server = TopologyInner::spawn_server(inner, host);
                    state.servers.insert(host.clone(), server);
                }
            }

            let gone: Vec<Host> = state.servers
                .keys()
                .filter(|host| !next.servers.contains_key(*host))
                .cloned()
                .collect();

            for host in gone {
                if let Some(server) = state.servers.remove(&host) {
                    removed.push(server);
                }
            }

            if let Some(new_description) = next.servers.get(&address) {
                events.push(Event::ServerDescriptionChanged {
                    host: address.clone(),
                    previous_type: previous_type,
                    new: Arc::new(new_description.clone()),
                });
            }

            events.push(Event::TopologyDescriptionChanged {
                previous_type: current.topology_type,
                new_type: next.topology_type,
                topology: format!("{}", next),
            });

            state.description = next;
            inner.waiters.notify_all();
        }

        // Removed servers are torn down outside the lock; joining a monitor
        // that is blocked on this same lock would deadlock.
        for server in removed {
            server.shutdown();
        }

        for event in events {
            inner.listener.dispatch(&event);
        }
    }

    fn select_server(inner: &Arc<TopologyInner>, criterion: &SelectionCriterion,
                     timeout: Duration) -> Result<ServerHandle> {
        let start = Instant::now();
        let mut state = inner.state.lock()?;

        loop {
            if state.closed {
                return Err(OperationError("The client has been shut down.".to_owned()));
            }

            let description = state.description.clone();

            if !description.compatible {
                let message = description.compatibility_error
                    .clone()
                    .unwrap_or("Incompatible wire versions.".to_owned());
                return Err(CompatibilityError(message));
            }

            {
                let suitable = select::suitable_servers(&description, criterion);
                let window = select::within_latency_window(suitable,
                                                           description.local_threshold_ms);

                if !window.is_empty() {
                    // Spread load uniformly across the window instead of
                    // always using the single fastest server.
                    let index = if window.len() == 1 {
                        0
                    } else {
                        thread_rng().gen_range(0, window.len())
                    };
                    let choice = window[index].clone();

                    if let Some(server) = state.servers.get(&choice.address) {
                        return Ok(ServerHandle {
                            host: choice.address.clone(),
                            description: choice,
                            pool: server.pool(),
                            monitor: server.monitor(),
                        });
                    }
                }
            }

            // Nothing suitable yet; ask the monitors to hurry up and wait
            // for the next fold.
            for server in state.servers.values() {
                server.request_check();
            }

            let elapsed = start.elapsed();
            if elapsed >= timeout {
                return Err(SelectionTimeout {
                    criterion: format!("{}", criterion),
                    topology: format!("{}", description),
                    elapsed_ms: millis(elapsed),
                });
            }

            let (reacquired, _) = inner.waiters.wait_timeout(state, timeout - elapsed)?;
            state = reacquired;
        }
    }

    fn shutdown(inner: &Arc<TopologyInner>) {
        let servers: Vec<Server> = match inner.state.lock() {
            Ok(mut state) => {
                if state.closed {
                    return;
                }
                state.closed = true;
                state.servers.drain().map(|(_, server)| server).collect()
            }
            Err(_) => return,
        };

        inner.waiters.notify_all();

        for server in servers {
            server.shutdown();
        }
    }
}

/// A selected server: the description that satisfied the criterion plus
/// access to the server's connection pool.
pub struct ServerHandle {
    host: Host,
    description: ServerDescription,
    pool: Arc<ConnectionPool>,
    monitor: Arc<Monitor>,
}

impl ServerHandle {
    pub fn host(&self) -> &Host {
        &self.host
    }

    /// The description the server was selected under.
    pub fn description(&self) -> &ServerDescription {
        &self.description
    }

    /// Checks a connection out of the server's pool. A connection-open
    /// failure also wakes the server's monitor, since the server is
    /// probably down.
    pub fn acquire_stream(&self, deadline: Duration) -> Result<PooledStream> {
        match self.pool.acquire_stream(deadline) {
            Ok(stream) => Ok(stream),
            Err(err) => {
                if let &Error::IoError(_) = &err {
                    self.monitor.request_check();
                }
                Err(err)
            }
        }
    }
}

// Keeps the highest observed cluster time. Cluster times are compared by
// their timestamp field; a document without one is ignored.
fn cluster_time_stamp(document: &bson::Document) -> Option<i64> {
    match document.get("clusterTime") {
        Some(&Bson::TimeStamp(stamp)) => Some(stamp),
        _ => None,
    }
}

fn advance_cluster_time(current: &mut Option<bson::Document>, observed: &bson::Document) {
    let observed_stamp = match cluster_time_stamp(observed) {
        Some(stamp) => stamp,
        None => return,
    };

    let advance = match *current {
        Some(ref document) => {
            cluster_time_stamp(document).map_or(true, |stamp| observed_stamp > stamp)
        }
        None => true,
    };

    if advance {
        *current = Some(observed.clone());
    }
}

fn millis(duration: Duration) -> u64 {
    duration.as_secs() * 1000 + (duration.subsec_nanos() / 1_000_000) as u64
}
