//! Server discovery and monitoring, server selection, and connection
//! pooling for MongoDB deployments.
//!
//! This crate is the cluster-facing core of a driver. It discovers the
//! servers behind a seed list, classifies the topology they form, monitors
//! every server on a heartbeat loop, selects the right server for each
//! operation under a read preference, and multiplexes operations over a
//! bounded pool of connections per server. Command payloads stay opaque:
//! callers hand byte buffers to a checked-out connection and get byte
//! buffers back.
//!
//! ```no_run
//! use mongodb_topology::{Client, ClientOptions, SelectionCriterion};
//! use mongodb_topology::connstring::Host;
//! use std::time::Duration;
//!
//! let options = ClientOptions::new(vec![Host::new("localhost", 27017)]);
//! let client = Client::with_options(options).unwrap();
//!
//! let server = client.select_server(&SelectionCriterion::Writable).unwrap();
//! let mut stream = server.acquire_stream(Duration::from_secs(10)).unwrap();
//! ```
#[macro_use(bson, doc)]
extern crate bson;
extern crate bufstream;
extern crate byteorder;
extern crate chrono;
extern crate rand;
extern crate time;

pub mod apm;
pub mod common;
pub mod connstring;
pub mod error;
pub mod pool;
pub mod stream;
pub mod topology;

pub use common::{ClientOptions, ReadMode, ReadPreference, SelectionCriterion};
pub use error::{Error, Result};
pub use topology::{ServerHandle, Topology};

use apm::{EventHook, Listener};
use common::DEFAULT_WAIT_QUEUE_TIMEOUT_MS;
use pool::PooledStream;

use std::sync::Arc;
use std::time::Duration;

/// Interfaces with a MongoDB deployment on behalf of an operation executor.
/// Owns the monitored topology and the per-server connection pools; shuts
/// everything down when dropped.
pub struct Client {
    topology: Topology,
    listener: Arc<Listener>,
}

impl Client {
    /// Creates a new client and starts discovering the topology behind the
    /// configured seed list.
    pub fn with_options(options: ClientOptions) -> Result<Client> {
        let listener = Arc::new(Listener::new());
        let topology = Topology::new(options, listener.clone())?;

        Ok(Client {
            topology: topology,
            listener: listener,
        })
    }

    /// Registers an observability hook. Hooks receive every topology, pool
    /// and connection event; they must not block.
    pub fn add_event_hook(&self, hook: EventHook) {
        self.listener.add_hook(hook);
    }

    /// The monitored topology.
    pub fn topology(&self) -> &Topology {
        &self.topology
    }

    /// Selects a server matching the criterion, waiting up to the
    /// configured server selection timeout for one to appear.
    pub fn select_server(&self, criterion: &SelectionCriterion) -> Result<ServerHandle> {
        let timeout = Duration::from_millis(self.topology
                                                .options()
                                                .server_selection_timeout_ms);
        self.topology.select_server(criterion, timeout)
    }

    /// `select_server` with an explicit deadline.
    pub fn select_server_within(&self, criterion: &SelectionCriterion,
                                timeout: Duration) -> Result<ServerHandle> {
        self.topology.select_server(criterion, timeout)
    }

    /// Selects a server and checks a connection out of its pool in one
    /// step.
    pub fn acquire_stream(&self, criterion: &SelectionCriterion) -> Result<PooledStream> {
        let server = self.select_server(criterion)?;

        let wait_queue_timeout_ms = self.topology.options().wait_queue_timeout_ms;
        let deadline = Duration::from_millis(if wait_queue_timeout_ms > 0 {
            wait_queue_timeout_ms
        } else {
            DEFAULT_WAIT_QUEUE_TIMEOUT_MS
        });

        server.acquire_stream(deadline)
    }

    /// The highest cluster time any server has reported, for gossiping on
    /// later commands.
    pub fn cluster_time(&self) -> Option<bson::Document> {
        self.topology.cluster_time()
    }

    /// Stops all monitoring, fails pending selections and closes all pools.
    pub fn shutdown(&self) {
        self.topology.shutdown();
    }
}

impl Drop for Client {
    fn drop(&mut self) {
        self.topology.shutdown();
    }
}
