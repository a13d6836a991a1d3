use connstring::Host;
use topology::TopologyType;
use topology::server::{ServerDescription, ServerType};

use std::fmt;
use std::sync::Arc;

/// Why a pooled connection was closed.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConnectionClosedReason {
    /// The connection belonged to an invalidated pool generation.
    Stale,
    /// The connection sat idle past the pool's idle limit.
    Idle,
    /// The connection reported an error while checked out.
    Error,
    /// The pool itself was closed.
    PoolClosed,
}

/// Why a checkout request failed.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CheckoutFailedReason {
    /// The pool stayed at capacity for the whole deadline.
    Timeout,
    /// Opening a new connection failed.
    ConnectionError,
    /// The pool was closed while the request waited.
    PoolClosed,
}

/// A single observability event.
pub enum Event {
    TopologyDescriptionChanged {
        previous_type: TopologyType,
        new_type: TopologyType,
        topology: String,
    },
    ServerDescriptionChanged {
        host: Host,
        previous_type: ServerType,
        new: Arc<ServerDescription>,
    },
    ServerHeartbeatStarted { host: Host },
    ServerHeartbeatSucceeded { host: Host, duration_ms: f64 },
    ServerHeartbeatFailed {
        host: Host,
        duration_ms: f64,
        message: String,
    },
    PoolCreated { host: Host },
    PoolReady { host: Host },
    PoolCleared { host: Host, generation: u64 },
    PoolClosed { host: Host },
    ConnectionCreated { host: Host, connection_id: usize },
    ConnectionReady { host: Host, connection_id: usize },
    ConnectionClosed {
        host: Host,
        connection_id: usize,
        reason: ConnectionClosedReason,
    },
    CheckoutStarted { host: Host },
    CheckoutSucceeded { host: Host, connection_id: usize },
    CheckoutFailed { host: Host, reason: CheckoutFailedReason },
}

impl fmt::Display for Event {
    fn fmt(&self, fmt: &mut fmt::Formatter) -> fmt::Result {
        match self {
            &Event::TopologyDescriptionChanged { previous_type, new_type, ref topology } => {
                fmt.write_fmt(format_args!("TOPOLOGY CHANGED: {:?} -> {:?}: {}",
                                           previous_type, new_type, topology))
            }
            &Event::ServerDescriptionChanged { ref host, previous_type, ref new } => {
                fmt.write_fmt(format_args!("SERVER {} CHANGED: {:?} -> {:?}",
                                           host, previous_type, new.server_type))
            }
            &Event::ServerHeartbeatStarted { ref host } => {
                fmt.write_fmt(format_args!("HEARTBEAT {} STARTED", host))
            }
            &Event::ServerHeartbeatSucceeded { ref host, duration_ms } => {
                fmt.write_fmt(format_args!("HEARTBEAT {} SUCCEEDED ({} ms)", host, duration_ms))
            }
            &Event::ServerHeartbeatFailed { ref host, duration_ms, ref message } => {
                fmt.write_fmt(format_args!("HEARTBEAT {} FAILED ({} ms): {}",
                                           host, duration_ms, message))
            }
            &Event::PoolCreated { ref host } => {
                fmt.write_fmt(format_args!("POOL {} CREATED", host))
            }
            &Event::PoolReady { ref host } => fmt.write_fmt(format_args!("POOL {} READY", host)),
            &Event::PoolCleared { ref host, generation } => {
                fmt.write_fmt(format_args!("POOL {} CLEARED (generation {})", host, generation))
            }
            &Event::PoolClosed { ref host } => fmt.write_fmt(format_args!("POOL {} CLOSED", host)),
            &Event::ConnectionCreated { ref host, connection_id } => {
                fmt.write_fmt(format_args!("CONNECTION {}#{} CREATED", host, connection_id))
            }
            &Event::ConnectionReady { ref host, connection_id } => {
                fmt.write_fmt(format_args!("CONNECTION {}#{} READY", host, connection_id))
            }
            &Event::ConnectionClosed { ref host, connection_id, reason } => {
                fmt.write_fmt(format_args!("CONNECTION {}#{} CLOSED: {:?}",
                                           host, connection_id, reason))
            }
            &Event::CheckoutStarted { ref host } => {
                fmt.write_fmt(format_args!("CHECKOUT {} STARTED", host))
            }
            &Event::CheckoutSucceeded { ref host, connection_id } => {
                fmt.write_fmt(format_args!("CHECKOUT {} SUCCEEDED (connection {})",
                                           host, connection_id))
            }
            &Event::CheckoutFailed { ref host, reason } => {
                fmt.write_fmt(format_args!("CHECKOUT {} FAILED: {:?}", host, reason))
            }
        }
    }
}
