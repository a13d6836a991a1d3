use Result;
use Error::{OperationError, WaitQueueTimeout};

use apm::{CheckoutFailedReason, ConnectionClosedReason, Event, Listener};
use bson::oid;
use common::ClientOptions;
use connstring::Host;
use stream::{Stream, StreamConnector};

use std::collections::{HashMap, VecDeque};
use std::ops::{Deref, DerefMut};
use std::sync::{Arc, Condvar, Mutex};
use std::sync::atomic::{AtomicBool, Ordering};
use std::thread::{self, JoinHandle};
use std::time::{Duration, Instant};

/// How often pool maintenance evicts idle connections and tops the pool up
/// to its minimum size.
pub const DEFAULT_MAINTENANCE_FREQUENCY_MS: u64 = 60000;

/// Pool-relevant subset of the client configuration.
#[derive(Debug, Clone)]
pub struct PoolOptions {
    pub min_size: usize,
    pub max_size: usize,
    pub max_idle_time_ms: u64,
    pub wait_queue_timeout_ms: u64,
    pub connect_timeout_ms: u64,
    pub connector: StreamConnector,
}

impl PoolOptions {
    pub fn from_client_options(options: &ClientOptions) -> PoolOptions {
        PoolOptions {
            min_size: options.min_pool_size,
            max_size: options.max_pool_size,
            max_idle_time_ms: options.max_idle_time_ms,
            wait_queue_timeout_ms: options.wait_queue_timeout_ms,
            connect_timeout_ms: options.connect_timeout_ms,
            connector: options.stream_connector.clone(),
        }
    }
}

// A connection sitting in the idle list.
struct IdleConnection {
    stream: Stream,
    id: usize,
    generation: u64,
    // The backend service this connection is pinned to, with the service
    // generation it was tagged under.
    service: Option<(oid::ObjectId, u64)>,
    last_used: Instant,
}

// A connection lent out to a caller.
struct CheckedOutConnection {
    stream: Stream,
    id: usize,
    generation: u64,
    service: Option<(oid::ObjectId, u64)>,
}

struct PoolInner {
    // Incremented on every invalidation. Connections created under an older
    // generation are closed on next touch instead of being reused.
    generation: u64,
    // Idle connections, most recently used at the back.
    available: Vec<IdleConnection>,
    // Connections that exist or are currently being opened. Never exceeds
    // max_size.
    total: usize,
    next_id: usize,
    // Checkout requests waiting for a connection, oldest first.
    queue: VecDeque<u64>,
    next_ticket: u64,
    // Invalidation counters per backend service, for deployments where one
    // address fronts several server processes.
    service_generations: HashMap<oid::ObjectId, u64>,
    cleared: bool,
    closed: bool,
}

impl PoolInner {
    fn service_generation(&self, service_id: &oid::ObjectId) -> u64 {
        self.service_generations.get(service_id).cloned().unwrap_or(0)
    }

    fn service_stale(&self, service: &Option<(oid::ObjectId, u64)>) -> bool {
        match *service {
            Some((ref service_id, tagged_generation)) => {
                self.service_generation(service_id) > tagged_generation
            }
            None => false,
        }
    }
}

/// Hands out ready-to-use connections for one server, bounded and reused.
#[derive(Clone)]
pub struct ConnectionPool {
    pub host: Host,
    inner: Arc<Mutex<PoolInner>>,
    // Waiting checkouts block here; check-ins, clears and frees notify it.
    wait_lock: Arc<Condvar>,
    options: PoolOptions,
    listener: Arc<Listener>,
    maintenance_running: Arc<AtomicBool>,
    maintenance_wake: Arc<(Mutex<()>, Condvar)>,
    maintenance_handle: Arc<Mutex<Option<JoinHandle<()>>>>,
}

impl ConnectionPool {
    /// Creates an empty pool for the given host.
    pub fn new(host: Host, options: PoolOptions, listener: Arc<Listener>) -> ConnectionPool {
        let pool = ConnectionPool {
            host: host,
            inner: Arc::new(Mutex::new(PoolInner {
                generation: 0,
                available: Vec::new(),
                total: 0,
                next_id: 0,
                queue: VecDeque::new(),
                next_ticket: 0,
                service_generations: HashMap::new(),
                cleared: false,
                closed: false,
            })),
            wait_lock: Arc::new(Condvar::new()),
            options: options,
            listener: listener,
            maintenance_running: Arc::new(AtomicBool::new(false)),
            maintenance_wake: Arc::new((Mutex::new(()), Condvar::new())),
            maintenance_handle: Arc::new(Mutex::new(None)),
        };

        pool.listener.dispatch(&Event::PoolCreated { host: pool.host.clone() });
        pool.listener.dispatch(&Event::PoolReady { host: pool.host.clone() });
        pool
    }

    /// The current pool generation.
    pub fn generation(&self) -> u64 {
        self.inner.lock().map(|inner| inner.generation).unwrap_or(0)
    }

    /// Number of idle connections.
    pub fn available_count(&self) -> usize {
        self.inner.lock().map(|inner| inner.available.len()).unwrap_or(0)
    }

    /// Number of connections that exist or are being opened.
    pub fn total_count(&self) -> usize {
        self.inner.lock().map(|inner| inner.total).unwrap_or(0)
    }

    /// Attempts to check out a connection. An idle connection of the current
    /// generation is reused if one exists; otherwise a new connection is
    /// opened if the pool is below its maximum size; otherwise the request
    /// queues behind earlier ones and blocks until a connection frees up or
    /// the deadline elapses. Waiters are served strictly oldest-first.
    pub fn acquire_stream(&self, deadline: Duration) -> Result<PooledStream> {
        self.listener.dispatch(&Event::CheckoutStarted { host: self.host.clone() });

        let start = Instant::now();
        let effective = if self.options.wait_queue_timeout_ms > 0 {
            let cap = Duration::from_millis(self.options.wait_queue_timeout_ms);
            if cap < deadline { cap } else { deadline }
        } else {
            deadline
        };

        let mut inner = self.inner.lock()?;
        let ticket = inner.next_ticket;
        inner.next_ticket += 1;
        inner.queue.push_back(ticket);

        loop {
            if inner.closed {
                Self::abandon_ticket(&mut inner, ticket);
                drop(inner);
                self.wait_lock.notify_all();
                self.listener.dispatch(&Event::CheckoutFailed {
                    host: self.host.clone(),
                    reason: CheckoutFailedReason::PoolClosed,
                });
                return Err(OperationError(format!("Connection pool for {} has been closed.",
                                                  self.host)));
            }

            if inner.queue.front() == Some(&ticket) {
                // Reuse an idle connection, discarding stale or expired ones.
                let mut closed_events = Vec::new();
                let reused = loop {
                    match inner.available.pop() {
                        Some(idle) => {
                            if idle.generation != inner.generation ||
                               inner.service_stale(&idle.service) {
                                self.discard(&mut inner, idle,
                                             ConnectionClosedReason::Stale,
                                             &mut closed_events);
                            } else if self.expired(&idle) {
                                self.discard(&mut inner, idle,
                                             ConnectionClosedReason::Idle,
                                             &mut closed_events);
                            } else {
                                break Some(idle);
                            }
                        }
                        None => break None,
                    }
                };

                if let Some(idle) = reused {
                    inner.queue.pop_front();
                    drop(inner);
                    self.wait_lock.notify_all();
                    for event in closed_events {
                        self.listener.dispatch(&event);
                    }
                    self.listener.dispatch(&Event::CheckoutSucceeded {
                        host: self.host.clone(),
                        connection_id: idle.id,
                    });
                    return Ok(PooledStream {
                        conn: Some(CheckedOutConnection {
                            stream: idle.stream,
                            id: idle.id,
                            generation: idle.generation,
                            service: idle.service,
                        }),
                        pool: self.clone(),
                        has_error: false,
                    });
                }

                for event in closed_events {
                    self.listener.dispatch(&event);
                }

                // No idle connection; open a new one if capacity allows. The
                // slot is reserved before the lock is released so the pool
                // can never exceed max_size.
                if inner.total < self.options.max_size {
                    inner.total += 1;
                    let id = inner.next_id;
                    inner.next_id += 1;
                    let generation = inner.generation;
                    inner.queue.pop_front();
                    drop(inner);
                    self.wait_lock.notify_all();

                    return self.open_for_checkout(id, generation);
                }
            }

            let elapsed = start.elapsed();
            if elapsed >= effective {
                Self::abandon_ticket(&mut inner, ticket);
                drop(inner);
                self.wait_lock.notify_all();
                self.listener.dispatch(&Event::CheckoutFailed {
                    host: self.host.clone(),
                    reason: CheckoutFailedReason::Timeout,
                });
                return Err(WaitQueueTimeout {
                    address: format!("{}", self.host),
                    elapsed_ms: millis(elapsed),
                    max_size: self.options.max_size,
                });
            }

            let (guard, _) = self.wait_lock.wait_timeout(inner, effective - elapsed)?;
            inner = guard;
        }
    }

    // Opens a connection for a checkout that already reserved a slot.
    fn open_for_checkout(&self, id: usize, generation: u64) -> Result<PooledStream> {
        self.listener.dispatch(&Event::ConnectionCreated {
            host: self.host.clone(),
            connection_id: id,
        });

        let timeout = Duration::from_millis(self.options.connect_timeout_ms);
        match self.options.connector.connect(&self.host, timeout) {
            Ok(stream) => {
                self.listener.dispatch(&Event::ConnectionReady {
                    host: self.host.clone(),
                    connection_id: id,
                });
                self.listener.dispatch(&Event::CheckoutSucceeded {
                    host: self.host.clone(),
                    connection_id: id,
                });
                Ok(PooledStream {
                    conn: Some(CheckedOutConnection {
                        stream: stream,
                        id: id,
                        generation: generation,
                        service: None,
                    }),
                    pool: self.clone(),
                    has_error: false,
                })
            }
            Err(err) => {
                if let Ok(mut inner) = self.inner.lock() {
                    inner.total -= 1;
                }
                self.wait_lock.notify_all();
                self.listener.dispatch(&Event::CheckoutFailed {
                    host: self.host.clone(),
                    reason: CheckoutFailedReason::ConnectionError,
                });
                Err(err)
            }
        }
    }

    // Returns a connection to the pool, or closes it if it can no longer be
    // trusted. Always wakes the oldest waiting checkout.
    fn check_in(&self, mut conn: CheckedOutConnection, has_error: bool) {
        let mut closed_event = None;

        if let Ok(mut inner) = self.inner.lock() {
            let reason = if inner.closed {
                Some(ConnectionClosedReason::PoolClosed)
            } else if has_error {
                Some(ConnectionClosedReason::Error)
            } else if conn.generation != inner.generation ||
                      inner.service_stale(&conn.service) {
                Some(ConnectionClosedReason::Stale)
            } else {
                None
            };

            match reason {
                Some(reason) => {
                    conn.stream.close();
                    inner.total -= 1;
                    closed_event = Some(Event::ConnectionClosed {
                        host: self.host.clone(),
                        connection_id: conn.id,
                        reason: reason,
                    });
                }
                None => {
                    inner.available.push(IdleConnection {
                        stream: conn.stream,
                        id: conn.id,
                        generation: conn.generation,
                        service: conn.service,
                        last_used: Instant::now(),
                    });
                }
            }
        }

        self.wait_lock.notify_all();
        if let Some(event) = closed_event {
            self.listener.dispatch(&event);
        }
    }

    /// Invalidates every connection the pool has handed out or kept idle.
    /// Idle connections are closed immediately; checked-out connections are
    /// closed when they come back. Waiting checkouts simply retry against
    /// the freed capacity.
    pub fn clear(&self) {
        let mut events = Vec::new();

        if let Ok(mut guard) = self.inner.lock() {
            let inner = &mut *guard;
            if inner.closed {
                return;
            }

            inner.generation += 1;
            inner.cleared = true;

            let drained: Vec<IdleConnection> = inner.available.drain(..).collect();
            inner.total -= drained.len();
            for mut idle in drained {
                idle.stream.close();
                events.push(Event::ConnectionClosed {
                    host: self.host.clone(),
                    connection_id: idle.id,
                    reason: ConnectionClosedReason::Stale,
                });
            }

            events.push(Event::PoolCleared {
                host: self.host.clone(),
                generation: inner.generation,
            });
        }

        self.wait_lock.notify_all();
        for event in events {
            self.listener.dispatch(&event);
        }
    }

    /// Invalidates only the connections pinned to one backend service, for
    /// deployments where a single address fronts several server processes.
    /// The rest of the pool is untouched.
    pub fn clear_for_service_id(&self, service_id: &oid::ObjectId) {
        let mut events = Vec::new();

        if let Ok(mut guard) = self.inner.lock() {
            let inner = &mut *guard;
            if inner.closed {
                return;
            }

            let bumped = inner.service_generation(service_id) + 1;
            inner.service_generations.insert(service_id.clone(), bumped);

            let mut kept = Vec::new();
            for mut idle in inner.available.drain(..) {
                let pinned = match idle.service {
                    Some((ref pinned_id, _)) => pinned_id == service_id,
                    None => false,
                };
                if pinned {
                    idle.stream.close();
                    inner.total -= 1;
                    events.push(Event::ConnectionClosed {
                        host: self.host.clone(),
                        connection_id: idle.id,
                        reason: ConnectionClosedReason::Stale,
                    });
                } else {
                    kept.push(idle);
                }
            }
            inner.available = kept;
        }

        self.wait_lock.notify_all();
        for event in events {
            self.listener.dispatch(&event);
        }
    }

    /// Marks a previously cleared pool usable again. Fired when the server
    /// comes back from Unknown.
    pub fn mark_ready(&self) {
        let mut ready = false;

        if let Ok(mut inner) = self.inner.lock() {
            if inner.cleared && !inner.closed {
                inner.cleared = false;
                ready = true;
            }
        }

        if ready {
            self.listener.dispatch(&Event::PoolReady { host: self.host.clone() });
        }
    }

    /// Closes the pool: stops maintenance, closes idle connections and fails
    /// all waiting checkouts. Idempotent.
    pub fn close(&self) {
        self.maintenance_running.store(false, Ordering::SeqCst);
        self.maintenance_wake.1.notify_all();

        let handle = self.maintenance_handle.lock().ok().and_then(|mut guard| guard.take());
        if let Some(handle) = handle {
            if handle.thread().id() != thread::current().id() {
                let _ = handle.join();
            }
        }

        let mut events = Vec::new();

        if let Ok(mut guard) = self.inner.lock() {
            let inner = &mut *guard;
            if !inner.closed {
                inner.closed = true;

                let drained: Vec<IdleConnection> = inner.available.drain(..).collect();
                inner.total -= drained.len();
                for mut idle in drained {
                    idle.stream.close();
                    events.push(Event::ConnectionClosed {
                        host: self.host.clone(),
                        connection_id: idle.id,
                        reason: ConnectionClosedReason::PoolClosed,
                    });
                }

                events.push(Event::PoolClosed { host: self.host.clone() });
            }
        }

        self.wait_lock.notify_all();
        for event in events {
            self.listener.dispatch(&event);
        }
    }

    /// One maintenance pass: evict idle and stale connections, then open
    /// connections in the background until the pool holds min_size again.
    /// Never runs on the checkout path.
    pub fn maintain(&self) {
        let mut events = Vec::new();

        if let Ok(mut guard) = self.inner.lock() {
            let inner = &mut *guard;
            if inner.closed {
                return;
            }

            let generation = inner.generation;
            let max_idle = self.options.max_idle_time_ms;
            let mut kept = Vec::new();

            let service_generations = inner.service_generations.clone();
            for mut idle in inner.available.drain(..) {
                let stale = idle.generation != generation ||
                    match idle.service {
                        Some((ref service_id, tagged)) => {
                            service_generations.get(service_id).cloned().unwrap_or(0) > tagged
                        }
                        None => false,
                    };
                let expired = max_idle > 0
                    && millis(idle.last_used.elapsed()) > max_idle;
                if stale || expired {
                    idle.stream.close();
                    inner.total -= 1;
                    events.push(Event::ConnectionClosed {
                        host: self.host.clone(),
                        connection_id: idle.id,
                        reason: if stale {
                            ConnectionClosedReason::Stale
                        } else {
                            ConnectionClosedReason::Idle
                        },
                    });
                } else {
                    kept.push(idle);
                }
            }

            inner.available = kept;
        }

        if !events.is_empty() {
            self.wait_lock.notify_all();
        }
        for event in events {
            self.listener.dispatch(&event);
        }

        // Top up to min_size, one connection at a time. The slot is reserved
        // under the lock; the connect itself happens outside it.
        loop {
            let reserved = match self.inner.lock() {
                Ok(mut inner) => {
                    if inner.closed || inner.total >= self.options.min_size {
                        None
                    } else {
                        inner.total += 1;
                        let id = inner.next_id;
                        inner.next_id += 1;
                        Some((id, inner.generation))
                    }
                }
                Err(_) => None,
            };

            let (id, generation) = match reserved {
                Some(pair) => pair,
                None => break,
            };

            self.listener.dispatch(&Event::ConnectionCreated {
                host: self.host.clone(),
                connection_id: id,
            });

            let timeout = Duration::from_millis(self.options.connect_timeout_ms);
            match self.options.connector.connect(&self.host, timeout) {
                Ok(mut stream) => {
                    let mut pooled = false;
                    if let Ok(mut inner) = self.inner.lock() {
                        if !inner.closed && inner.generation == generation {
                            inner.available.push(IdleConnection {
                                stream: stream,
                                id: id,
                                generation: generation,
                                service: None,
                                last_used: Instant::now(),
                            });
                            pooled = true;
                        } else {
                            stream.close();
                            inner.total -= 1;
                        }
                    }

                    self.wait_lock.notify_all();
                    if pooled {
                        self.listener.dispatch(&Event::ConnectionReady {
                            host: self.host.clone(),
                            connection_id: id,
                        });
                    } else {
                        // The pool moved on while the connection was opening.
                        self.listener.dispatch(&Event::ConnectionClosed {
                            host: self.host.clone(),
                            connection_id: id,
                            reason: ConnectionClosedReason::Stale,
                        });
                    }

                    if !pooled {
                        break;
                    }
                }
                Err(_) => {
                    if let Ok(mut inner) = self.inner.lock() {
                        inner.total -= 1;
                    }
                    self.wait_lock.notify_all();
                    break;
                }
            }
        }
    }

    /// Starts the background maintenance thread for this pool.
    pub fn start_maintenance(&self) {
        if self.maintenance_running.swap(true, Ordering::SeqCst) {
            return;
        }

        let pool = self.clone();
        let spawned = thread::Builder::new()
            .name("pool-maintenance".to_string())
            .spawn(move || pool.run_maintenance());

        match spawned {
            Ok(handle) => {
                if let Ok(mut guard) = self.maintenance_handle.lock() {
                    *guard = Some(handle);
                }
            }
            Err(_) => self.maintenance_running.store(false, Ordering::SeqCst),
        }
    }

    fn run_maintenance(&self) {
        let frequency = Duration::from_millis(DEFAULT_MAINTENANCE_FREQUENCY_MS);

        while self.maintenance_running.load(Ordering::SeqCst) {
            self.maintain();

            let guard = match self.maintenance_wake.0.lock() {
                Ok(guard) => guard,
                Err(_) => return,
            };

            let _ = self.maintenance_wake.1.wait_timeout(guard, frequency);
        }
    }

    fn expired(&self, idle: &IdleConnection) -> bool {
        self.options.max_idle_time_ms > 0
            && millis(idle.last_used.elapsed()) > self.options.max_idle_time_ms
    }

    fn discard(&self, inner: &mut PoolInner, mut idle: IdleConnection,
               reason: ConnectionClosedReason, events: &mut Vec<Event>) {
        idle.stream.close();
        inner.total -= 1;
        events.push(Event::ConnectionClosed {
            host: self.host.clone(),
            connection_id: idle.id,
            reason: reason,
        });
    }

    fn abandon_ticket(inner: &mut PoolInner, ticket: u64) {
        if let Some(position) = inner.queue.iter().position(|&queued| queued == ticket) {
            inner.queue.remove(position);
        }
    }
}

/// Holds a checked-out connection, returning it to the pool when dropped.
pub struct PooledStream {
    // Some until the stream is returned on drop.
    conn: Option<CheckedOutConnection>,
    pool: ConnectionPool,
    has_error: bool,
}

impl PooledStream {
    /// The id of the underlying connection.
    pub fn connection_id(&self) -> usize {
        self.conn.as_ref().unwrap().id
    }

    /// The pool generation the underlying connection was created under.
    pub fn generation(&self) -> u64 {
        self.conn.as_ref().unwrap().generation
    }

    /// Sends one opaque request over the connection. A transport failure
    /// flags the connection so check-in closes it instead of reusing it.
    pub fn send_receive(&mut self, payload: &[u8], timeout: Duration) -> Result<Vec<u8>> {
        let result = self.conn.as_mut().unwrap().stream.send_receive(payload, timeout);
        if result.is_err() {
            self.has_error = true;
        }
        result
    }

    /// Flags the connection as broken; check-in will close it.
    pub fn mark_error(&mut self) {
        self.has_error = true;
    }

    /// Pins the connection to the backend service its handshake reported.
    /// A later `clear_for_service_id` for that service will retire it.
    pub fn set_service_id(&mut self, service_id: oid::ObjectId) {
        let generation = self.pool
            .inner
            .lock()
            .map(|inner| inner.service_generation(&service_id))
            .unwrap_or(0);

        if let Some(conn) = self.conn.as_mut() {
            conn.service = Some((service_id, generation));
        }
    }
}

impl Deref for PooledStream {
    type Target = Stream;

    fn deref(&self) -> &Stream {
        &self.conn.as_ref().unwrap().stream
    }
}

impl DerefMut for PooledStream {
    fn deref_mut(&mut self) -> &mut Stream {
        &mut self.conn.as_mut().unwrap().stream
    }
}

impl Drop for PooledStream {
    fn drop(&mut self) {
        if let Some(conn) = self.conn.take() {
            self.pool.check_in(conn, self.has_error);
        }
    }
}

fn millis(duration: Duration) -> u64 {
    duration.as_secs() * 1000 + (duration.subsec_nanos() / 1_000_000) as u64
}
