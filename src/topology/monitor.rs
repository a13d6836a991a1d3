//! Per-server heartbeat loop and handshake reply parsing.
use Result;
use Error::{OperationError, ResponseError};

use apm::{Event, Listener};
use bson::{self, Bson, oid};
use chrono::{DateTime, Utc};

use common::ClientOptions;
use connstring::{self, Host};
use stream::{Stream, StreamConnector};

use std::collections::BTreeMap;
use std::io::Cursor;
use std::net::{Shutdown, TcpStream};
use std::sync::{Arc, Condvar, Mutex, Weak};
use std::sync::atomic::{AtomicBool, Ordering};
use std::thread::{self, JoinHandle};
use std::time::{Duration, Instant};

use time;

use super::TopologyInner;
use super::server::{ServerDescription, TopologyVersion};

/// The parsed fields of a hello handshake reply. Everything else in the
/// reply document is ignored.
#[derive(Clone, Debug, PartialEq)]
pub struct HelloResult {
    pub ok: bool,
    pub is_writable_primary: bool,
    pub min_wire_version: i64,
    pub max_wire_version: i64,
    pub local_time: Option<DateTime<Utc>>,

    /// Shard-specific. mongos instances set this field to "isdbgrid".
    pub msg: String,

    // Replica set specific
    pub is_replica_set: bool,
    pub secondary: bool,
    pub arbiter_only: bool,
    pub hidden: bool,
    pub me: Option<Host>,
    pub hosts: Vec<Host>,
    pub passives: Vec<Host>,
    pub arbiters: Vec<Host>,
    pub tags: BTreeMap<String, String>,
    pub set_name: Option<String>,
    pub set_version: Option<i64>,
    pub election_id: Option<oid::ObjectId>,
    pub primary: Option<Host>,

    pub logical_session_timeout_minutes: Option<i64>,
    pub topology_version: Option<TopologyVersion>,
    pub cluster_time: Option<bson::Document>,
}

fn get_i64(doc: &bson::Document, key: &str) -> Option<i64> {
    match doc.get(key) {
        Some(&Bson::I32(v)) => Some(v as i64),
        Some(&Bson::I64(v)) => Some(v),
        Some(&Bson::FloatingPoint(v)) => Some(v as i64),
        _ => None,
    }
}

fn get_bool(doc: &bson::Document, key: &str) -> Option<bool> {
    match doc.get(key) {
        Some(&Bson::Boolean(v)) => Some(v),
        _ => None,
    }
}

fn get_host_array(doc: &bson::Document, key: &str) -> Vec<Host> {
    match doc.get(key) {
        Some(&Bson::Array(ref arr)) => {
            arr.iter()
               .filter_map(|bson| match bson {
                   &Bson::String(ref s) => connstring::parse_host(s).ok(),
                   _ => None,
               })
               .collect()
        }
        _ => Vec::new(),
    }
}

impl HelloResult {
    /// Parses a hello reply document from the server. A missing `ok` field
    /// is a protocol error; every other field is optional with a default.
    pub fn new(doc: bson::Document) -> Result<HelloResult> {
        let ok = match get_i64(&doc, "ok") {
            Some(v) => v != 0,
            None => return Err(ResponseError("Handshake reply does not contain `ok`.".to_owned())),
        };

        let mut result = HelloResult {
            ok: ok,
            is_writable_primary: false,
            min_wire_version: 0,
            max_wire_version: 0,
            local_time: None,
            msg: String::new(),
            is_replica_set: false,
            secondary: false,
            arbiter_only: false,
            hidden: false,
            me: None,
            hosts: Vec::new(),
            passives: Vec::new(),
            arbiters: Vec::new(),
            tags: BTreeMap::new(),
            set_name: None,
            set_version: None,
            election_id: None,
            primary: None,
            logical_session_timeout_minutes: None,
            topology_version: None,
            cluster_time: None,
        };

        // Modern spelling first, then the legacy one.
        if let Some(b) = get_bool(&doc, "isWritablePrimary") {
            result.is_writable_primary = b;
        } else if let Some(b) = get_bool(&doc, "ismaster") {
            result.is_writable_primary = b;
        }

        if let Some(v) = get_i64(&doc, "minWireVersion") {
            result.min_wire_version = v;
        }

        if let Some(v) = get_i64(&doc, "maxWireVersion") {
            result.max_wire_version = v;
        }

        if let Some(&Bson::UtcDatetime(ref datetime)) = doc.get("localTime") {
            result.local_time = Some(datetime.clone());
        }

        if let Some(&Bson::String(ref s)) = doc.get("msg") {
            result.msg = s.to_owned();
        }

        if let Some(b) = get_bool(&doc, "isreplicaset") {
            result.is_replica_set = b;
        }

        if let Some(b) = get_bool(&doc, "secondary") {
            result.secondary = b;
        }

        if let Some(b) = get_bool(&doc, "arbiterOnly") {
            result.arbiter_only = b;
        }

        if let Some(b) = get_bool(&doc, "hidden") {
            result.hidden = b;
        }

        if let Some(&Bson::String(ref s)) = doc.get("me") {
            result.me = Some(connstring::parse_host(s)?);
        }

        result.hosts = get_host_array(&doc, "hosts");
        result.passives = get_host_array(&doc, "passives");
        result.arbiters = get_host_array(&doc, "arbiters");

        if let Some(&Bson::Document(ref tags)) = doc.get("tags") {
            for (key, value) in tags.into_iter() {
                if let &Bson::String(ref tag) = value {
                    result.tags.insert(key.to_owned(), tag.to_owned());
                }
            }
        }

        if let Some(&Bson::String(ref s)) = doc.get("setName") {
            result.set_name = Some(s.to_owned());
        }

        result.set_version = get_i64(&doc, "setVersion");

        match doc.get("electionId") {
            Some(&Bson::ObjectId(ref id)) => result.election_id = Some(id.clone()),
            Some(&Bson::Document(ref doc)) => {
                if let Some(&Bson::String(ref s)) = doc.get("$oid") {
                    result.election_id = Some(oid::ObjectId::with_string(s)
                        .map_err(|_| ResponseError("Malformed electionId.".to_owned()))?);
                }
            }
            _ => (),
        }

        if let Some(&Bson::String(ref s)) = doc.get("primary") {
            result.primary = Some(connstring::parse_host(s)?);
        }

        result.logical_session_timeout_minutes = get_i64(&doc, "logicalSessionTimeoutMinutes");

        if let Some(&Bson::Document(ref tv)) = doc.get("topologyVersion") {
            if let (Some(&Bson::ObjectId(ref process_id)), Some(counter)) =
                (tv.get("processId"), get_i64(tv, "counter")) {
                result.topology_version = Some(TopologyVersion {
                    process_id: process_id.clone(),
                    counter: counter,
                });
            }
        }

        if let Some(&Bson::Document(ref cluster_time)) = doc.get("$clusterTime") {
            result.cluster_time = Some(cluster_time.clone());
        }

        Ok(result)
    }
}

/// Monitors a single server: issues the hello handshake on a fixed interval
/// over a dedicated connection, and feeds the outcome of every check into
/// the topology as a fresh ServerDescription.
pub struct Monitor {
    // Host being monitored.
    host: Host,
    // The topology to fold check results into. Weak so a dropped topology
    // ends its monitors.
    topology: Weak<TopologyInner>,
    listener: Arc<Listener>,
    connector: StreamConnector,
    heartbeat_frequency_ms: u64,
    min_heartbeat_frequency_ms: u64,
    connect_timeout_ms: u64,
    // Owned monitoring connection. Never borrowed from the server's pool.
    stream: Mutex<Option<Stream>>,
    // Second handle to the monitoring socket, so stop() can interrupt a
    // blocked read without contending for the stream lock.
    socket_handle: Mutex<Option<TcpStream>>,
    // EWMA state for the round-trip time.
    round_trip_time: Mutex<Option<f64>>,
    // Used for condvar functionality.
    dummy_lock: Mutex<()>,
    // Notified to wake the monitor before its next scheduled check.
    condvar: Condvar,
    check_requested: AtomicBool,
    /// While true, the monitor keeps checking at the heartbeat frequency.
    pub running: Arc<AtomicBool>,
    handle: Mutex<Option<JoinHandle<()>>>,
}

impl Monitor {
    /// Returns a new monitor for the host.
    pub fn new(host: Host, topology: Weak<TopologyInner>, listener: Arc<Listener>,
               options: &ClientOptions) -> Monitor {
        Monitor {
            host: host,
            topology: topology,
            listener: listener,
            connector: options.stream_connector.clone(),
            heartbeat_frequency_ms: options.heartbeat_frequency_ms,
            min_heartbeat_frequency_ms: options.min_heartbeat_frequency_ms,
            connect_timeout_ms: options.connect_timeout_ms,
            stream: Mutex::new(None),
            socket_handle: Mutex::new(None),
            round_trip_time: Mutex::new(None),
            dummy_lock: Mutex::new(()),
            condvar: Condvar::new(),
            check_requested: AtomicBool::new(false),
            running: Arc::new(AtomicBool::new(true)),
            handle: Mutex::new(None),
        }
    }

    /// Asks for an immediate re-check. Requests arriving faster than the
    /// minimum heartbeat frequency are coalesced.
    pub fn request_check(&self) {
        self.check_requested.store(true, Ordering::SeqCst);
        self.condvar.notify_all();
    }

    /// Stops the monitoring loop and closes the monitoring connection,
    /// interrupting a check that is blocked on the socket.
    pub fn stop(&self) {
        self.running.store(false, Ordering::SeqCst);
        self.condvar.notify_all();

        if let Ok(guard) = self.socket_handle.lock() {
            if let Some(ref socket) = *guard {
                let _ = socket.shutdown(Shutdown::Both);
            }
        }
    }

    /// Waits for the monitor thread to exit, unless called from it.
    pub fn join(&self) {
        let handle = self.handle.lock().ok().and_then(|mut guard| guard.take());
        if let Some(handle) = handle {
            if handle.thread().id() != thread::current().id() {
                let _ = handle.join();
            }
        }
    }

    pub fn set_handle(&self, handle: JoinHandle<()>) {
        if let Ok(mut guard) = self.handle.lock() {
            *guard = Some(handle);
        }
    }

    /// Runs the monitoring loop until stopped or the topology is dropped.
    pub fn run(&self) {
        while self.running.load(Ordering::SeqCst) {
            let topology = match self.topology.upgrade() {
                Some(topology) => topology,
                None => break,
            };

            let streamed = self.check(&topology);
            drop(topology);

            if streamed && self.running.load(Ordering::SeqCst) {
                // The server holds the reply until its state changes, so the
                // next check is issued immediately.
                continue;
            }

            self.wait_for_next_check();
        }
    }

    // Sleeps until the next scheduled check, an immediate-check request, or
    // shutdown. Wake requests are debounced to the minimum frequency.
    fn wait_for_next_check(&self) {
        let frequency = Duration::from_millis(self.heartbeat_frequency_ms);
        let minimum = Duration::from_millis(self.min_heartbeat_frequency_ms);
        let start = Instant::now();

        let mut guard = match self.dummy_lock.lock() {
            Ok(guard) => guard,
            Err(_) => return,
        };

        while self.running.load(Ordering::SeqCst) {
            if self.check_requested.swap(false, Ordering::SeqCst) {
                let since = start.elapsed();
                if since < minimum {
                    drop(guard);
                    thread::sleep(minimum - since);
                }
                return;
            }

            let elapsed = start.elapsed();
            if elapsed >= frequency {
                return;
            }

            match self.condvar.wait_timeout(guard, frequency - elapsed) {
                Ok((reacquired, _)) => guard = reacquired,
                Err(_) => return,
            }
        }
    }

    // Performs one check and folds the outcome into the topology. Returns
    // true if the check was an awaitable one that the server answered,
    // meaning the next one should be issued without sleeping.
    fn check(&self, topology: &Arc<TopologyInner>) -> bool {
        self.listener.dispatch(&Event::ServerHeartbeatStarted { host: self.host.clone() });

        let previous_tv = match topology.description() {
            Ok(description) => {
                description.servers
                           .get(&self.host)
                           .and_then(|server| server.topology_version.clone())
            }
            Err(_) => None,
        };
        let awaited = previous_tv.is_some();

        let started_ns = time::precise_time_ns();
        match self.hello(&previous_tv) {
            Ok(hello) => {
                let duration_ms = (time::precise_time_ns() - started_ns) as f64 / 1_000_000.0;
                self.listener.dispatch(&Event::ServerHeartbeatSucceeded {
                    host: self.host.clone(),
                    duration_ms: duration_ms,
                });

                // An awaited reply measures the server-side wait, not the
                // network, so it leaves the average untouched.
                let round_trip_time = if awaited {
                    self.round_trip_time.lock().ok().and_then(|guard| *guard)
                } else {
                    let averaged = self.round_trip_time
                        .lock()
                        .ok()
                        .and_then(|guard| *guard);
                    let updated = ServerDescription::round_trip_average(averaged, duration_ms);
                    if let Ok(mut guard) = self.round_trip_time.lock() {
                        *guard = Some(updated);
                    }
                    Some(updated)
                };

                let streamed = hello.topology_version.is_some();

                if TopologyVersion::is_stale(&previous_tv, &hello.topology_version) {
                    // Reply does not advance the server's counter; nothing
                    // new to fold.
                    return awaited && streamed;
                }

                let description = ServerDescription::from_hello(self.host.clone(), hello,
                                                                round_trip_time);
                TopologyInner::process(topology, description);
                awaited && streamed
            }
            Err(err) => {
                let duration_ms = (time::precise_time_ns() - started_ns) as f64 / 1_000_000.0;
                self.listener.dispatch(&Event::ServerHeartbeatFailed {
                    host: self.host.clone(),
                    duration_ms: duration_ms,
                    message: format!("{}", err),
                });

                self.close_stream();
                if let Ok(mut guard) = self.round_trip_time.lock() {
                    *guard = None;
                }

                let description = ServerDescription::from_error(self.host.clone(), err);
                TopologyInner::process(topology, description);
                false
            }
        }
    }

    // Issues one hello command over the monitoring connection, reconnecting
    // if necessary. When the previous reply carried a topology version, the
    // command asks the server to hold its reply until something changes.
    fn hello(&self, previous_tv: &Option<TopologyVersion>) -> Result<HelloResult> {
        let mut command = doc! { "hello": 1 };
        let mut timeout = Duration::from_millis(self.connect_timeout_ms);

        if let Some(ref tv) = *previous_tv {
            command.insert("topologyVersion".to_owned(),
                           Bson::Document(doc! {
                               "processId": tv.process_id.clone(),
                               "counter": tv.counter
                           }));
            command.insert("maxAwaitTimeMS".to_owned(),
                           Bson::I64(self.heartbeat_frequency_ms as i64));
            timeout += Duration::from_millis(self.heartbeat_frequency_ms);
        }

        let mut payload = Vec::new();
        bson::encode_document(&mut payload, &command)?;

        let mut guard = self.stream.lock()?;
        if guard.is_none() {
            let connect_timeout = Duration::from_millis(self.connect_timeout_ms);
            let stream = self.connector.connect(&self.host, connect_timeout)?;
            if let Ok(mut handle) = self.socket_handle.lock() {
                *handle = stream.tcp_handle();
            }
            *guard = Some(stream);
        }

        let reply = match guard.as_mut() {
            Some(stream) => stream.send_receive(&payload, timeout)?,
            None => {
                return Err(OperationError("Monitoring connection unavailable.".to_owned()))
            }
        };

        let doc = bson::decode_document(&mut Cursor::new(reply))?;
        HelloResult::new(doc)
    }

    fn close_stream(&self) {
        if let Ok(mut guard) = self.stream.lock() {
            if let Some(mut stream) = guard.take() {
                stream.close();
            }
        }
        if let Ok(mut handle) = self.socket_handle.lock() {
            *handle = None;
        }
    }
}
