//! Server facade: binds the listener, supervises accepted connections
//! through authentication and activation, keys the live pool by connection
//! id and offers broadcast over it.

use crate::auth::{self, PeerInfo};
use crate::config::ServerConfig;
use crate::error::{Error, Result};
use crate::logging::{debug, error, info, o, warn, Logger};
use crate::net::connection::{
    wake_pair, AuthMode, Connection, ConnectionEvent, ConnectionHandle, ConnectionSettings, DriverWake,
    Inbound,
};
use crate::router::{Dispatcher, MethodSchema, Router};
use crossbeam_channel::Sender;
use hashbrown::HashSet;
use indexmap::IndexMap;
use mio::net::TcpListener;
use rmpv::Value;
use std::io;
use std::net::SocketAddr;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};
use std::thread;
use std::time::{Duration, Instant};
use uuid::Uuid;

const LISTENER_TOKEN: mio::Token = mio::Token(0);
const WAKE_TOKEN: mio::Token = mio::Token(1);
const TOKEN_BASE: usize = 2;

const POLL_INTERVAL: Duration = Duration::from_millis(50);
const HOUSEKEEPING_INTERVAL: Duration = Duration::from_millis(250);
const DEFAULT_RPC_TIMEOUT: Duration = Duration::from_secs(30);

type ServerHook = Box<dyn Fn() + Send + Sync>;
type ConnHook = Box<dyn Fn(&ConnectionHandle) + Send + Sync>;

#[derive(Default)]
struct Hooks {
    startup: Vec<ServerHook>,
    shutdown: Vec<ServerHook>,
    connect: Vec<ConnHook>,
    disconnect: Vec<ConnHook>,
}

type Pool = Arc<Mutex<IndexMap<Uuid, ConnectionHandle>>>;

/// The accept supervisor. Owns a driver thread running the poll loop and a
/// worker pool for handler dispatch.
pub struct Server {
    config: ServerConfig,
    router: Arc<Router>,
    pool: Pool,
    hooks: Arc<Mutex<Hooks>>,
    running: Arc<AtomicBool>,
    wake: Mutex<Option<DriverWake>>,
    driver: Mutex<Option<thread::JoinHandle<()>>>,
    dispatcher: Mutex<Option<Dispatcher>>,
    local_addr: Mutex<Option<SocketAddr>>,
    log: Logger,
}

impl Server {
    pub fn new(config: ServerConfig) -> Result<Server> {
        Server::with_logger(config, crate::logging::noop())
    }

    pub fn with_logger(config: ServerConfig, log: Logger) -> Result<Server> {
        config.validate()?;

        let log = log.new(o!("component" => "server"));

        Ok(Server {
            router: Arc::new(Router::new(log.new(o!("component" => "router")))),
            config,
            pool: Arc::new(Mutex::new(IndexMap::new())),
            hooks: Arc::new(Mutex::new(Hooks::default())),
            running: Arc::new(AtomicBool::new(false)),
            wake: Mutex::new(None),
            driver: Mutex::new(None),
            dispatcher: Mutex::new(None),
            local_addr: Mutex::new(None),
            log,
        })
    }

    /// The handler registry. Registration is expected during startup but is
    /// safe at any time.
    #[inline]
    pub fn router(&self) -> &Router {
        &self.router
    }

    /// Sugar over `router().register_rpc`.
    pub fn register_rpc<F>(&self, name: &str, schema: MethodSchema, handler: F)
    where
        F: Fn(&ConnectionHandle, &Value) -> std::result::Result<Value, crate::error::HandlerFault>
            + Send
            + Sync
            + 'static,
    {
        self.router.register_rpc(name, schema, handler);
    }

    /// Sugar over `router().register_message`.
    pub fn register_message<F>(&self, type_tag: &str, priority: i32, handler: F)
    where
        F: Fn(&ConnectionHandle, &Value) -> std::result::Result<Option<Value>, crate::error::HandlerFault>
            + Send
            + Sync
            + 'static,
    {
        self.router.register_message(type_tag, priority, handler);
    }

    pub fn on_startup<F: Fn() + Send + Sync + 'static>(&self, hook: F) {
        self.hooks.lock().expect("Hook lock poisoned").startup.push(Box::new(hook));
    }

    pub fn on_shutdown<F: Fn() + Send + Sync + 'static>(&self, hook: F) {
        self.hooks.lock().expect("Hook lock poisoned").shutdown.push(Box::new(hook));
    }

    pub fn on_client_connect<F: Fn(&ConnectionHandle) + Send + Sync + 'static>(&self, hook: F) {
        self.hooks.lock().expect("Hook lock poisoned").connect.push(Box::new(hook));
    }

    pub fn on_client_disconnect<F: Fn(&ConnectionHandle) + Send + Sync + 'static>(&self, hook: F) {
        self.hooks.lock().expect("Hook lock poisoned").disconnect.push(Box::new(hook));
    }

    /// Binds the listener and spins up the worker pool and the driver
    /// thread.
    pub fn start(&self) -> Result<()> {
        if self.running.swap(true, Ordering::SeqCst) {
            return Ok(());
        }

        let addr = self.config.bind_addr()?;
        let listener = TcpListener::bind(&addr)
            .map_err(|e| Error::Config(format!("cannot bind {}: {}", addr, e)))?;
        let local_addr = listener
            .local_addr()
            .map_err(|e| Error::Config(format!("listener address: {}", e)))?;

        *self.local_addr.lock().expect("Address lock poisoned") = Some(local_addr);

        let dispatcher = Dispatcher::start(self.router.clone(), self.config.handler_threads, &self.log);
        let inbound_tx = dispatcher.sender();
        *self.dispatcher.lock().expect("Dispatcher lock poisoned") = Some(dispatcher);

        let (registration, wake) = wake_pair();
        *self.wake.lock().expect("Wake lock poisoned") = Some(wake.clone());

        let driver = ServerDriver {
            listener,
            registration,
            wake,
            settings: connection_settings(&self.config),
            expected_digest: auth::password_digest(&self.config.password),
            info: PeerInfo::new(self.config.name.clone()),
            max_connections: self.config.max_connections,
            inbound_tx,
            pool: self.pool.clone(),
            hooks: self.hooks.clone(),
            running: self.running.clone(),
            log: self.log.new(o!("component" => "driver")),
        };

        let handle = thread::Builder::new()
            .name("conduit-server-driver".to_string())
            .spawn(move || driver.run())
            .map_err(|e| Error::Config(format!("driver thread spawn: {}", e)))?;

        *self.driver.lock().expect("Driver lock poisoned") = Some(handle);

        info!(self.log, "server started"; "context" => "start", "address" => local_addr.to_string());

        let hooks = self.hooks.lock().expect("Hook lock poisoned");
        for hook in &hooks.startup {
            hook();
        }

        Ok(())
    }

    /// Address actually bound; useful when the configured port is zero.
    pub fn local_addr(&self) -> Option<SocketAddr> {
        *self.local_addr.lock().expect("Address lock poisoned")
    }

    /// Stops accepting, closes every connection gracefully, and joins the
    /// driver and worker threads.
    pub fn stop(&self) {
        if !self.running.swap(false, Ordering::SeqCst) {
            return;
        }

        info!(self.log, "server stopping"; "context" => "stop");

        if let Some(wake) = self.wake.lock().expect("Wake lock poisoned").take() {
            wake.wake();
        }

        if let Some(handle) = self.driver.lock().expect("Driver lock poisoned").take() {
            drop(handle.join());
        }

        if let Some(dispatcher) = self.dispatcher.lock().expect("Dispatcher lock poisoned").take() {
            dispatcher.shutdown();
        }

        let hooks = self.hooks.lock().expect("Hook lock poisoned");
        for hook in &hooks.shutdown {
            hook();
        }

        info!(self.log, "server stopped"; "context" => "stop");
    }

    /// Snapshot of the live (activated) connections.
    pub fn connections(&self) -> Vec<ConnectionHandle> {
        self.pool
            .lock()
            .expect("Pool lock poisoned")
            .values()
            .cloned()
            .collect()
    }

    pub fn connection_count(&self) -> usize {
        self.pool.lock().expect("Pool lock poisoned").len()
    }

    /// Attempts a non-blocking send of one message to every pooled
    /// connection passing the include/exclude filters. Per-connection
    /// failures are isolated; returns the number of successful sends.
    pub fn broadcast(
        &self,
        type_tag: &str,
        data: Value,
        include: Option<&[Uuid]>,
        exclude: Option<&[Uuid]>,
    ) -> usize {
        let snapshot = self.connections();

        let include: Option<HashSet<Uuid>> = include.map(|ids| ids.iter().copied().collect());
        let exclude: Option<HashSet<Uuid>> = exclude.map(|ids| ids.iter().copied().collect());

        let mut sent = 0;

        for conn in snapshot {
            let id = conn.id();

            if let Some(include) = &include {
                if !include.contains(&id) {
                    continue;
                }
            }
            if let Some(exclude) = &exclude {
                if exclude.contains(&id) {
                    continue;
                }
            }

            match conn.try_send_message(type_tag, data.clone()) {
                Ok(()) => sent += 1,
                Err(err) => {
                    debug!(self.log, "broadcast send failed";
                           "context" => "broadcast",
                           "connection_id" => id.to_string(),
                           "error" => err.to_string());
                }
            }
        }

        sent
    }
}

impl Drop for Server {
    fn drop(&mut self) {
        self.stop();
    }
}

pub(crate) fn connection_settings(config: &ServerConfig) -> ConnectionSettings {
    ConnectionSettings {
        buffer_size: config.buffer_size,
        max_frame_size: config.max_frame_size,
        send_queue_size: config.send_queue_size,
        receive_queue_size: config.receive_queue_size,
        enable_compression: config.enable_compression,
        enable_backpressure: config.enable_backpressure,
        high_watermark: config.high_watermark,
        low_watermark: config.low_watermark,
        connect_timeout: config.connection_timeout(),
        auth_timeout: config.auth_timeout(),
        connection_timeout: config.connection_timeout(),
        heartbeat_interval: config.heartbeat_interval(),
        heartbeat_timeout: config.heartbeat_timeout(),
        rpc_timeout: DEFAULT_RPC_TIMEOUT,
    }
}

struct ServerDriver {
    listener: TcpListener,
    registration: mio::Registration,
    wake: DriverWake,
    settings: ConnectionSettings,
    expected_digest: String,
    info: PeerInfo,
    max_connections: usize,
    inbound_tx: Sender<Inbound>,
    pool: Pool,
    hooks: Arc<Mutex<Hooks>>,
    running: Arc<AtomicBool>,
    log: Logger,
}

impl ServerDriver {
    fn run(self) {
        let poll = match mio::Poll::new() {
            Ok(poll) => poll,
            Err(err) => {
                error!(self.log, "poll creation failed"; "context" => "run", "error" => %err);
                return;
            }
        };

        if let Err(err) = poll.register(
            &self.listener,
            LISTENER_TOKEN,
            mio::Ready::readable(),
            mio::PollOpt::edge(),
        ) {
            error!(self.log, "listener registration failed"; "context" => "run", "error" => %err);
            return;
        }

        if let Err(err) = poll.register(
            &self.registration,
            WAKE_TOKEN,
            mio::Ready::readable(),
            mio::PollOpt::edge(),
        ) {
            error!(self.log, "wake registration failed"; "context" => "run", "error" => %err);
            return;
        }

        let mut events = mio::Events::with_capacity(1024);
        let mut conns: Vec<Option<Connection>> = Vec::new();
        let mut free: Vec<usize> = Vec::new();
        let mut housekeeping_at = Instant::now();

        while self.running.load(Ordering::SeqCst) {
            if poll.poll(&mut events, Some(POLL_INTERVAL)).is_err() {
                error!(self.log, "poll failed"; "context" => "run");
                break;
            }

            let mut accept_ready = false;
            let mut wake_hit = false;

            for event in &events {
                match event.token() {
                    LISTENER_TOKEN => accept_ready = true,
                    WAKE_TOKEN => wake_hit = true,
                    token => {
                        let slot = token.0 - TOKEN_BASE;
                        if let Some(Some(conn)) = conns.get_mut(slot) {
                            let readiness = event.readiness();
                            conn.drive(readiness.is_readable(), readiness.is_writable());
                        }
                    }
                }
            }

            if wake_hit {
                self.wake.reset();

                // A wake flags queued output or a close request somewhere;
                // give every live connection a pass.
                for conn in conns.iter_mut().flatten() {
                    conn.drive(false, false);
                }
            }

            if accept_ready {
                self.accept_loop(&poll, &mut conns, &mut free);
            }

            let now = Instant::now();
            if now.duration_since(housekeeping_at) >= HOUSEKEEPING_INTERVAL {
                housekeeping_at = now;

                for conn in conns.iter_mut().flatten() {
                    conn.housekeeping(now);
                }
            }

            self.collect(&poll, &mut conns, &mut free);
        }

        self.shutdown(&poll, &mut conns, &mut free);
    }

    fn accept_loop(&self, poll: &mio::Poll, conns: &mut Vec<Option<Connection>>, free: &mut Vec<usize>) {
        loop {
            match self.listener.accept() {
                Ok((stream, peer)) => {
                    let live = conns.iter().filter(|c| c.is_some()).count();

                    if live >= self.max_connections {
                        warn!(self.log, "connection limit reached, rejecting";
                              "context" => "accept",
                              "peer" => peer.to_string());
                        drop(stream);
                        continue;
                    }

                    let conn = Connection::accepted(
                        stream,
                        peer,
                        self.settings.clone(),
                        AuthMode::Server {
                            expected_digest: self.expected_digest.clone(),
                            info: self.info.clone(),
                        },
                        self.inbound_tx.clone(),
                        self.wake.clone(),
                        &self.log,
                    );

                    let slot = match free.pop() {
                        Some(slot) => slot,
                        None => {
                            conns.push(None);
                            conns.len() - 1
                        }
                    };

                    if conn.register(poll, mio::Token(slot + TOKEN_BASE)).is_err() {
                        error!(self.log, "stream registration failed"; "context" => "accept");
                        free.push(slot);
                        continue;
                    }

                    debug!(self.log, "connection accepted";
                           "context" => "accept",
                           "peer" => peer.to_string());

                    conns[slot] = Some(conn);
                }
                Err(ref err) if err.kind() == io::ErrorKind::WouldBlock => break,
                Err(err) => {
                    error!(self.log, "accept failed"; "context" => "accept", "error" => %err);
                    break;
                }
            }
        }
    }

    /// Drain lifecycle events, maintain the pool, and reap terminal
    /// connections.
    fn collect(&self, poll: &mio::Poll, conns: &mut Vec<Option<Connection>>, free: &mut Vec<usize>) {
        for slot in 0..conns.len() {
            let (events, terminal) = match &mut conns[slot] {
                Some(conn) => (conn.drain_events(), conn.is_terminal()),
                None => continue,
            };

            for event in events {
                match event {
                    ConnectionEvent::Activated => {
                        let handle = conns[slot].as_ref().map(|c| c.handle().clone());

                        if let Some(handle) = handle {
                            self.pool
                                .lock()
                                .expect("Pool lock poisoned")
                                .insert(handle.id(), handle.clone());

                            let hooks = self.hooks.lock().expect("Hook lock poisoned");
                            for hook in &hooks.connect {
                                hook(&handle);
                            }
                        }
                    }
                    ConnectionEvent::Closed { .. } | ConnectionEvent::Failed { .. } => {
                        let handle = conns[slot].as_ref().map(|c| c.handle().clone());

                        if let Some(handle) = handle {
                            let removed = self
                                .pool
                                .lock()
                                .expect("Pool lock poisoned")
                                .shift_remove(&handle.id())
                                .is_some();

                            // Disconnect hooks fire only for connections
                            // that made it into the pool.
                            if removed {
                                let hooks = self.hooks.lock().expect("Hook lock poisoned");
                                for hook in &hooks.disconnect {
                                    hook(&handle);
                                }
                            }
                        }
                    }
                }
            }

            if terminal {
                if let Some(conn) = conns[slot].take() {
                    conn.deregister(poll);
                    free.push(slot);
                }
            }
        }
    }

    /// Graceful shutdown: close every connection and drive the drains to
    /// completion, bounded by the connection timeout.
    fn shutdown(&self, poll: &mio::Poll, conns: &mut Vec<Option<Connection>>, free: &mut Vec<usize>) {
        for conn in conns.iter().flatten() {
            conn.handle().close();
        }

        let deadline = Instant::now() + self.settings.connection_timeout;

        while conns.iter().any(|c| c.is_some()) && Instant::now() < deadline {
            let mut events = mio::Events::with_capacity(256);
            drop(poll.poll(&mut events, Some(Duration::from_millis(20))));

            for event in &events {
                let token = event.token();
                if token == LISTENER_TOKEN || token == WAKE_TOKEN {
                    continue;
                }

                let slot = token.0 - TOKEN_BASE;
                if let Some(Some(conn)) = conns.get_mut(slot) {
                    let readiness = event.readiness();
                    conn.drive(readiness.is_readable(), readiness.is_writable());
                }
            }

            let now = Instant::now();
            for conn in conns.iter_mut().flatten() {
                conn.drive(false, false);
                conn.housekeeping(now);
            }

            self.collect(poll, conns, free);
        }

        debug!(self.log, "driver exited"; "context" => "shutdown");
    }
}
