//! Client facade: connects and authenticates, keeps the session alive, and
//! supervises reconnection with exponential backoff. Each attempt is a fresh
//! connection; pending calls never survive a reconnect.

use crate::auth::{self, PeerInfo};
use crate::config::ClientConfig;
use crate::error::{Error, Result};
use crate::logging::{debug, error, info, o, warn, Logger};
use crate::net::connection::{
    wake_pair, AuthMode, Connection, ConnectionEvent, ConnectionFailure, ConnectionHandle,
    ConnectionSettings, ConnectionState, DriverWake, Inbound,
};
use crate::net::support::ErrorType;
use crate::router::{Dispatcher, MethodSchema, Router};
use crossbeam_channel::Sender;
use rmpv::Value;
use std::net::SocketAddr;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};
use std::thread;
use std::time::{Duration, Instant};

const CONN_TOKEN: mio::Token = mio::Token(0);
const WAKE_TOKEN: mio::Token = mio::Token(1);

const POLL_INTERVAL: Duration = Duration::from_millis(50);
const HOUSEKEEPING_INTERVAL: Duration = Duration::from_millis(250);

type ClientHook = Box<dyn Fn() + Send + Sync>;

#[derive(Default)]
struct Hooks {
    connect: Vec<ClientHook>,
    disconnect: Vec<ClientHook>,
    reconnect: Vec<ClientHook>,
}

type Current = Arc<Mutex<Option<ConnectionHandle>>>;

/// The connect/reconnect supervisor and call surface.
pub struct Client {
    config: ClientConfig,
    router: Arc<Router>,
    current: Current,
    hooks: Arc<Mutex<Hooks>>,
    running: Arc<AtomicBool>,
    last_failure: Arc<Mutex<Option<ConnectionFailure>>>,
    wake: Mutex<Option<DriverWake>>,
    driver: Mutex<Option<thread::JoinHandle<()>>>,
    dispatcher: Mutex<Option<Dispatcher>>,
    log: Logger,
}

impl Client {
    pub fn new(config: ClientConfig) -> Result<Client> {
        Client::with_logger(config, crate::logging::noop())
    }

    pub fn with_logger(config: ClientConfig, log: Logger) -> Result<Client> {
        config.validate()?;

        let log = log.new(o!("component" => "client"));

        Ok(Client {
            router: Arc::new(Router::new(log.new(o!("component" => "router")))),
            config,
            current: Arc::new(Mutex::new(None)),
            hooks: Arc::new(Mutex::new(Hooks::default())),
            running: Arc::new(AtomicBool::new(false)),
            last_failure: Arc::new(Mutex::new(None)),
            wake: Mutex::new(None),
            driver: Mutex::new(None),
            dispatcher: Mutex::new(None),
            log,
        })
    }

    /// Handler registry for server-pushed messages and calls.
    #[inline]
    pub fn router(&self) -> &Router {
        &self.router
    }

    pub fn register_message<F>(&self, type_tag: &str, priority: i32, handler: F)
    where
        F: Fn(&ConnectionHandle, &Value) -> std::result::Result<Option<Value>, crate::error::HandlerFault>
            + Send
            + Sync
            + 'static,
    {
        self.router.register_message(type_tag, priority, handler);
    }

    pub fn register_rpc<F>(&self, name: &str, schema: MethodSchema, handler: F)
    where
        F: Fn(&ConnectionHandle, &Value) -> std::result::Result<Value, crate::error::HandlerFault>
            + Send
            + Sync
            + 'static,
    {
        self.router.register_rpc(name, schema, handler);
    }

    pub fn on_connect<F: Fn() + Send + Sync + 'static>(&self, hook: F) {
        self.hooks.lock().expect("Hook lock poisoned").connect.push(Box::new(hook));
    }

    pub fn on_disconnect<F: Fn() + Send + Sync + 'static>(&self, hook: F) {
        self.hooks.lock().expect("Hook lock poisoned").disconnect.push(Box::new(hook));
    }

    pub fn on_reconnect<F: Fn() + Send + Sync + 'static>(&self, hook: F) {
        self.hooks.lock().expect("Hook lock poisoned").reconnect.push(Box::new(hook));
    }

    /// Connects, authenticates and waits for the session to become ACTIVE.
    /// A failure before the first activation is surfaced here; the reconnect
    /// supervisor only takes over once a session has been live.
    pub fn connect(&self) -> Result<()> {
        if self.running.swap(true, Ordering::SeqCst) {
            return Ok(());
        }

        *self.last_failure.lock().expect("Failure lock poisoned") = None;

        let addr = self.config.server_addr()?;

        let dispatcher = Dispatcher::start(self.router.clone(), self.config.handler_threads, &self.log);
        let inbound_tx = dispatcher.sender();
        *self.dispatcher.lock().expect("Dispatcher lock poisoned") = Some(dispatcher);

        let (registration, wake) = wake_pair();
        *self.wake.lock().expect("Wake lock poisoned") = Some(wake.clone());

        let driver = ClientDriver {
            addr,
            registration,
            wake,
            config: self.config.clone(),
            settings: connection_settings(&self.config),
            digest: auth::password_digest(&self.config.password),
            info: PeerInfo::new(self.config.name.clone()),
            inbound_tx,
            current: self.current.clone(),
            hooks: self.hooks.clone(),
            running: self.running.clone(),
            last_failure: self.last_failure.clone(),
            log: self.log.new(o!("component" => "driver")),
        };

        let handle = thread::Builder::new()
            .name("conduit-client-driver".to_string())
            .spawn(move || driver.run())
            .map_err(|e| Error::Config(format!("driver thread spawn: {}", e)))?;

        *self.driver.lock().expect("Driver lock poisoned") = Some(handle);

        // Wait for the first session to reach ACTIVE, or for its failure.
        let deadline = Instant::now()
            + self.config.connect_timeout()
            + self.config.auth_timeout()
            + Duration::from_secs(5);

        loop {
            if let Some(handle) = self.handle() {
                if handle.state() == ConnectionState::Active {
                    return Ok(());
                }
            }

            if let Some(failure) = self.last_failure.lock().expect("Failure lock poisoned").clone() {
                self.teardown();
                return Err(failure.to_error());
            }

            if Instant::now() >= deadline {
                self.teardown();
                return Err(Error::Transport(ErrorType::Timeout));
            }

            thread::sleep(Duration::from_millis(5));
        }
    }

    /// Gracefully closes the session and stops the supervisor. Also joins
    /// the driver when it already stopped on its own.
    pub fn close(&self) {
        let was_running = self.running.swap(false, Ordering::SeqCst);

        if let Some(handle) = self.handle() {
            handle.close();
            handle.wait_for_state(|s| s.is_terminal(), self.config.connection_timeout());
        }

        self.teardown();

        if was_running {
            info!(self.log, "client closed"; "context" => "close");
        }
    }

    fn teardown(&self) {
        self.running.store(false, Ordering::SeqCst);

        if let Some(wake) = self.wake.lock().expect("Wake lock poisoned").take() {
            wake.wake();
        }

        if let Some(handle) = self.driver.lock().expect("Driver lock poisoned").take() {
            drop(handle.join());
        }

        if let Some(dispatcher) = self.dispatcher.lock().expect("Dispatcher lock poisoned").take() {
            dispatcher.shutdown();
        }
    }

    /// The current session handle, if any.
    pub fn handle(&self) -> Option<ConnectionHandle> {
        self.current.lock().expect("Current lock poisoned").clone()
    }

    pub fn state(&self) -> ConnectionState {
        self.handle()
            .map(|h| h.state())
            .unwrap_or(ConnectionState::Disconnected)
    }

    pub fn is_active(&self) -> bool {
        self.state() == ConnectionState::Active
    }

    /// Submit a typed message to the server.
    pub fn send(&self, type_tag: &str, data: Value) -> Result<()> {
        match self.handle() {
            Some(handle) => handle.send_message(type_tag, data),
            None => Err(Error::NotConnected),
        }
    }

    /// Correlated call; remote faults raise. `None` uses the configured
    /// rpc timeout.
    pub fn call(&self, method: &str, params: Value, timeout: Option<Duration>) -> Result<Value> {
        match self.handle() {
            Some(handle) => handle.call(method, params, timeout),
            None => Err(Error::NotConnected),
        }
    }

    /// Correlated call returning the full envelope; remote faults are data.
    pub fn call_envelope(&self, method: &str, params: Value, timeout: Option<Duration>) -> Result<Value> {
        match self.handle() {
            Some(handle) => handle.call_envelope(method, params, timeout),
            None => Err(Error::NotConnected),
        }
    }

    /// Discovery of the server's registered methods.
    pub fn listall(&self) -> Result<Value> {
        self.call("listall", crate::payload::empty(), None)
    }
}

impl Drop for Client {
    fn drop(&mut self) {
        self.close();
    }
}

fn connection_settings(config: &ClientConfig) -> ConnectionSettings {
    ConnectionSettings {
        buffer_size: config.buffer_size,
        max_frame_size: config.max_frame_size,
        send_queue_size: config.send_queue_size,
        receive_queue_size: config.receive_queue_size,
        enable_compression: config.enable_compression,
        enable_backpressure: config.enable_backpressure,
        high_watermark: config.high_watermark,
        low_watermark: config.low_watermark,
        connect_timeout: config.connect_timeout(),
        auth_timeout: config.auth_timeout(),
        connection_timeout: config.connection_timeout(),
        heartbeat_interval: config.heartbeat_interval(),
        heartbeat_timeout: config.heartbeat_timeout(),
        rpc_timeout: config.rpc_timeout(),
    }
}

struct ClientDriver {
    addr: SocketAddr,
    registration: mio::Registration,
    wake: DriverWake,
    config: ClientConfig,
    settings: ConnectionSettings,
    digest: String,
    info: PeerInfo,
    inbound_tx: Sender<Inbound>,
    current: Current,
    hooks: Arc<Mutex<Hooks>>,
    running: Arc<AtomicBool>,
    last_failure: Arc<Mutex<Option<ConnectionFailure>>>,
    log: Logger,
}

impl ClientDriver {
    fn run(self) {
        let poll = match mio::Poll::new() {
            Ok(poll) => poll,
            Err(err) => {
                error!(self.log, "poll creation failed"; "context" => "run", "error" => %err);
                return;
            }
        };

        if let Err(err) = poll.register(
            &self.registration,
            WAKE_TOKEN,
            mio::Ready::readable(),
            mio::PollOpt::edge(),
        ) {
            error!(self.log, "wake registration failed"; "context" => "run", "error" => %err);
            return;
        }

        let mut ever_active = false;
        let mut attempt: u32 = 0;

        while self.running.load(Ordering::SeqCst) {
            let reconnecting = ever_active;

            let (session_activated, locally_closed, failure) = self.run_session(&poll, reconnecting);

            *self.current.lock().expect("Current lock poisoned") = None;

            if session_activated {
                ever_active = true;
                attempt = 0;

                let hooks = self.hooks.lock().expect("Hook lock poisoned");
                for hook in &hooks.disconnect {
                    hook();
                }
            }

            if !self.running.load(Ordering::SeqCst) || locally_closed {
                break;
            }

            // Failures before the first activation surface through
            // `connect`; the supervisor does not retry them.
            if !ever_active {
                *self.last_failure.lock().expect("Failure lock poisoned") =
                    Some(failure.unwrap_or(ConnectionFailure::Transport(ErrorType::ClosedByPeer)));
                break;
            }

            if !self.config.reconnect_enabled {
                break;
            }

            // An explicit no-retry verdict from the server is final.
            if let Some(ConnectionFailure::Authentication { retry_allowed: false, .. }) = &failure {
                warn!(self.log, "server forbade retry, giving up"; "context" => "reconnect");
                break;
            }

            if self.config.reconnect_attempts != 0 && attempt >= self.config.reconnect_attempts {
                warn!(self.log, "reconnect attempts exhausted";
                      "context" => "reconnect",
                      "attempts" => attempt);
                break;
            }

            let delay = self.config.reconnect_backoff(attempt);
            attempt += 1;

            info!(self.log, "scheduling reconnect";
                  "context" => "reconnect",
                  "attempt" => attempt,
                  "delay" => ?delay);

            // Sleep in slices so close requests are honored promptly.
            let until = Instant::now() + delay;
            while Instant::now() < until && self.running.load(Ordering::SeqCst) {
                thread::sleep(Duration::from_millis(10));
            }
        }

        self.running.store(false, Ordering::SeqCst);
        debug!(self.log, "driver exited"; "context" => "run");
    }

    /// Runs one connection attempt to its terminal state. Returns whether it
    /// activated, whether the close was local, and the failure detail if
    /// any.
    fn run_session(
        &self,
        poll: &mio::Poll,
        reconnecting: bool,
    ) -> (bool, bool, Option<ConnectionFailure>) {
        let mut conn = match Connection::connecting(
            &self.addr,
            self.settings.clone(),
            AuthMode::Client {
                digest: self.digest.clone(),
                info: self.info.clone(),
            },
            self.inbound_tx.clone(),
            self.wake.clone(),
            &self.log,
        ) {
            Ok(conn) => conn,
            Err(err) => {
                return (false, false, Some(ConnectionFailure::from_network(&err)));
            }
        };

        if conn.register(poll, CONN_TOKEN).is_err() {
            return (false, false, Some(ConnectionFailure::Transport(ErrorType::Io(
                std::io::ErrorKind::Other,
            ))));
        }

        *self.current.lock().expect("Current lock poisoned") = Some(conn.handle().clone());

        let mut events = mio::Events::with_capacity(256);
        let mut housekeeping_at = Instant::now();
        let mut activated = false;
        let mut locally_closed = false;

        while self.running.load(Ordering::SeqCst) && !conn.is_terminal() {
            if poll.poll(&mut events, Some(POLL_INTERVAL)).is_err() {
                error!(self.log, "poll failed"; "context" => "session");
                break;
            }

            let mut wake_hit = false;

            for event in &events {
                match event.token() {
                    CONN_TOKEN => {
                        let readiness = event.readiness();
                        conn.drive(readiness.is_readable(), readiness.is_writable());
                    }
                    WAKE_TOKEN => wake_hit = true,
                    _ => (),
                }
            }

            if wake_hit {
                self.wake.reset();
                conn.drive(false, false);
            }

            let now = Instant::now();
            if now.duration_since(housekeeping_at) >= HOUSEKEEPING_INTERVAL {
                housekeeping_at = now;
                conn.housekeeping(now);
            }

            for event in conn.drain_events() {
                match event {
                    ConnectionEvent::Activated => {
                        activated = true;

                        let hooks = self.hooks.lock().expect("Hook lock poisoned");
                        for hook in &hooks.connect {
                            hook();
                        }
                        if reconnecting {
                            info!(self.log, "reconnected"; "context" => "reconnect");
                            for hook in &hooks.reconnect {
                                hook();
                            }
                        }
                    }
                    ConnectionEvent::Closed { locally_initiated } => {
                        locally_closed = locally_initiated;
                    }
                    ConnectionEvent::Failed { locally_initiated } => {
                        locally_closed = locally_initiated;
                    }
                }
            }
        }

        // The session may have terminated between polls; collect any
        // remaining lifecycle events.
        for event in conn.drain_events() {
            match event {
                ConnectionEvent::Closed { locally_initiated } | ConnectionEvent::Failed { locally_initiated } => {
                    locally_closed = locally_initiated;
                }
                ConnectionEvent::Activated => activated = true,
            }
        }

        // A shutdown request with the session still open: close it cleanly.
        if !conn.is_terminal() {
            conn.handle().close();

            let deadline = Instant::now() + self.settings.connection_timeout;
            while !conn.is_terminal() && Instant::now() < deadline {
                drop(poll.poll(&mut events, Some(Duration::from_millis(20))));

                for event in &events {
                    if event.token() == CONN_TOKEN {
                        let readiness = event.readiness();
                        conn.drive(readiness.is_readable(), readiness.is_writable());
                    }
                }

                conn.drive(false, false);
                conn.housekeeping(Instant::now());
            }

            locally_closed = true;
        }

        let failure = conn.handle().failure();
        conn.deregister(poll);

        (activated, locally_closed, failure)
    }
}
