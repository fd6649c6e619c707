use crate::auth::{self, PeerInfo};
use crate::error::{Error, Result};
use crate::logging::{debug, error, info, o, trace, warn, Logger};
use crate::net::buffer::Buffer;
use crate::net::codec::{self, Frame, FrameKind, HEADER_SIZE};
use crate::net::framer::Framer;
use crate::net::support::{ErrorType, NetworkError, NetworkResult};
use crate::net::transport::Transport;
use crate::payload;
use crate::rpc::{self, CorrelationAllocator, PendingCalls, RpcOutcome};
use crossbeam_channel::{Receiver, Sender};
use hashbrown::HashMap;
use rmpv::Value;
use std::net::SocketAddr;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::{Arc, Condvar, Mutex};
use std::time::{Duration, Instant};
use uuid::Uuid;

/// Which end of the stream this connection represents.
#[derive(Debug, Clone, Copy, Eq, PartialEq)]
pub enum Role {
    Server,
    Client,
}

#[derive(Debug, Clone, Copy, Eq, PartialEq, Hash)]
pub enum ConnectionState {
    Disconnected,
    Connecting,
    Authenticating,
    Connected,
    Active,
    Paused,
    Closing,
    Closed,
    Failed,
}

impl ConnectionState {
    /// Legal transition table. Anything outside it is a state error and
    /// leaves the state untouched.
    pub fn can_transition(self, to: ConnectionState) -> bool {
        use ConnectionState::*;

        match (self, to) {
            (Disconnected, Connecting) => true,
            (Connecting, Authenticating) | (Connecting, Failed) | (Connecting, Closed) => true,
            (Authenticating, Connected) | (Authenticating, Failed) | (Authenticating, Closed) => true,
            (Connected, Active) | (Connected, Closing) | (Connected, Failed) => true,
            (Active, Paused) | (Active, Closing) | (Active, Failed) => true,
            (Paused, Active) | (Paused, Closing) | (Paused, Failed) => true,
            (Closing, Closed) | (Closing, Failed) => true,
            _ => false,
        }
    }

    #[inline]
    pub fn is_terminal(self) -> bool {
        match self {
            ConnectionState::Closed | ConnectionState::Failed => true,
            _ => false,
        }
    }

    /// States in which frames may be written to the transport.
    #[inline]
    pub fn may_emit(self) -> bool {
        match self {
            ConnectionState::Authenticating
            | ConnectionState::Connected
            | ConnectionState::Active
            | ConnectionState::Paused
            | ConnectionState::Closing => true,
            _ => false,
        }
    }

    /// States in which user traffic (messages) is accepted for sending.
    #[inline]
    fn accepts_traffic(self) -> bool {
        match self {
            ConnectionState::Active | ConnectionState::Paused => true,
            _ => false,
        }
    }

    /// States in which RPC calls may be issued. Discovery is available as
    /// soon as authentication completes.
    #[inline]
    fn accepts_calls(self) -> bool {
        match self {
            ConnectionState::Connected | ConnectionState::Active | ConnectionState::Paused => true,
            _ => false,
        }
    }
}

/// Why a connection reached a terminal failure state.
#[derive(Debug, Clone)]
pub enum ConnectionFailure {
    Authentication { reason: String, retry_allowed: bool },
    Protocol(ErrorType),
    Transport(ErrorType),
    HeartbeatTimeout,
    Timeout,
}

impl ConnectionFailure {
    pub fn to_error(&self) -> Error {
        match self {
            ConnectionFailure::Authentication { reason, retry_allowed } => Error::Authentication {
                reason: reason.clone(),
                retry_allowed: *retry_allowed,
            },
            ConnectionFailure::Protocol(kind) => Error::Protocol(kind.clone()),
            ConnectionFailure::Transport(kind) => Error::Transport(kind.clone()),
            ConnectionFailure::HeartbeatTimeout | ConnectionFailure::Timeout => {
                Error::Transport(ErrorType::Timeout)
            }
        }
    }

    pub(crate) fn from_network(err: &NetworkError) -> ConnectionFailure {
        match err {
            NetworkError::Fatal(kind) => match kind {
                ErrorType::ClosedByPeer | ErrorType::Io(_) => ConnectionFailure::Transport(kind.clone()),
                ErrorType::Timeout => ConnectionFailure::Timeout,
                kind => ConnectionFailure::Protocol(kind.clone()),
            },
            NetworkError::Wait => ConnectionFailure::Transport(ErrorType::Io(std::io::ErrorKind::WouldBlock)),
        }
    }
}

/// Snapshot of per-connection counters.
#[derive(Debug, Clone, Default)]
pub struct ConnectionStats {
    pub frames_sent: u64,
    pub frames_received: u64,
    pub bytes_sent: u64,
    pub bytes_received: u64,
    pub heartbeat_latency: Option<Duration>,
}

/// Wakes the driver loop owning the connection so it re-examines queues and
/// flags.
#[derive(Clone)]
pub(crate) struct DriverWake {
    readiness: mio::SetReadiness,
}

impl DriverWake {
    #[inline]
    pub fn wake(&self) {
        drop(self.readiness.set_readiness(mio::Ready::readable()));
    }

    #[inline]
    pub fn reset(&self) {
        drop(self.readiness.set_readiness(mio::Ready::empty()));
    }
}

/// Creates the poll-registrable half and the cloneable wake half.
pub(crate) fn wake_pair() -> (mio::Registration, DriverWake) {
    let (registration, readiness) = mio::Registration::new2();
    (registration, DriverWake { readiness })
}

/// Tuning knobs distilled from the server/client configuration.
#[derive(Debug, Clone)]
pub(crate) struct ConnectionSettings {
    pub buffer_size: usize,
    pub max_frame_size: usize,
    pub send_queue_size: usize,
    pub receive_queue_size: usize,
    pub enable_compression: bool,
    pub enable_backpressure: bool,
    pub high_watermark: f64,
    pub low_watermark: f64,
    pub connect_timeout: Duration,
    pub auth_timeout: Duration,
    pub connection_timeout: Duration,
    pub heartbeat_interval: Duration,
    pub heartbeat_timeout: Duration,
    pub rpc_timeout: Duration,
}

/// Authentication role of the connection.
pub(crate) enum AuthMode {
    /// Server side: verifies the presented digest.
    Server { expected_digest: String, info: PeerInfo },
    /// Client side: presents the digest after connecting.
    Client { digest: String, info: PeerInfo },
}

/// A frame handed to the handler pool together with its origin.
pub(crate) struct Inbound {
    pub conn: ConnectionHandle,
    pub frame: Frame,
}

struct Shared {
    id: Uuid,
    role: Role,
    state: Mutex<ConnectionState>,
    state_cond: Condvar,
    data_tx: Sender<Frame>,
    control_tx: Sender<Frame>,
    pending: PendingCalls,
    correlations: CorrelationAllocator,
    wake: DriverWake,
    close_requested: AtomicBool,
    inbound_inflight: AtomicUsize,
    local_paused: AtomicBool,
    rpc_timeout: Duration,
    stats: Mutex<ConnectionStats>,
    peer_info: Mutex<Option<PeerInfo>>,
    session_token: Mutex<Option<String>>,
    failure: Mutex<Option<ConnectionFailure>>,
}

/// Cloneable user-facing face of a connection. Submits outbound traffic,
/// issues correlated calls and requests closure; the owning driver does the
/// actual I/O.
#[derive(Clone)]
pub struct ConnectionHandle {
    shared: Arc<Shared>,
}

impl ConnectionHandle {
    #[inline]
    pub fn id(&self) -> Uuid {
        self.shared.id
    }

    #[inline]
    pub fn role(&self) -> Role {
        self.shared.role
    }

    #[inline]
    pub fn state(&self) -> ConnectionState {
        *self.shared.state.lock().expect("State lock poisoned")
    }

    pub fn stats(&self) -> ConnectionStats {
        self.shared.stats.lock().expect("Stats lock poisoned").clone()
    }

    pub fn peer_info(&self) -> Option<PeerInfo> {
        self.shared.peer_info.lock().expect("Peer info lock poisoned").clone()
    }

    /// Opaque token issued at AUTH_SUCCESS. Advisory only.
    pub fn session_token(&self) -> Option<String> {
        self.shared.session_token.lock().expect("Token lock poisoned").clone()
    }

    /// Failure detail once the connection has reached FAILED.
    pub fn failure(&self) -> Option<ConnectionFailure> {
        self.shared.failure.lock().expect("Failure lock poisoned").clone()
    }

    /// Submit a free-form typed message. Blocks while the outbound queue is
    /// full; the peer's RESUME unblocks it.
    pub fn send_message(&self, type_tag: &str, data: Value) -> Result<()> {
        if !self.state().accepts_traffic() {
            return Err(Error::NotConnected);
        }

        let value = payload::map(vec![
            ("type", Value::String(type_tag.into())),
            ("data", data),
        ]);
        let frame = Frame::new(FrameKind::Message, 0, &value)?;

        self.shared.data_tx.send(frame).map_err(|_| Error::ConnectionLost)?;
        self.shared.wake.wake();

        Ok(())
    }

    /// Non-blocking send used by broadcast: a full queue or a dead
    /// connection counts as failure without stalling the caller.
    pub(crate) fn try_send_message(&self, type_tag: &str, data: Value) -> Result<()> {
        if !self.state().accepts_traffic() {
            return Err(Error::NotConnected);
        }

        let value = payload::map(vec![
            ("type", Value::String(type_tag.into())),
            ("data", data),
        ]);
        let frame = Frame::new(FrameKind::Message, 0, &value)?;

        self.shared
            .data_tx
            .try_send(frame)
            .map_err(|_| Error::NotConnected)?;
        self.shared.wake.wake();

        Ok(())
    }

    /// Issue a correlated RPC call and block for its outcome, raising remote
    /// faults as errors. Uses the configured rpc timeout when `timeout` is
    /// `None`.
    pub fn call(&self, method: &str, params: Value, timeout: Option<Duration>) -> Result<Value> {
        let (_, outcome) = self.call_outcome(method, params, timeout)?;
        rpc::outcome_to_result(outcome)
    }

    /// Like `call`, but returns the full envelope and treats remote faults
    /// as data rather than errors.
    pub fn call_envelope(&self, method: &str, params: Value, timeout: Option<Duration>) -> Result<Value> {
        let (correlation, outcome) = self.call_outcome(method, params, timeout)?;
        rpc::outcome_to_envelope(outcome, correlation)
    }

    fn call_outcome(
        &self,
        method: &str,
        params: Value,
        timeout: Option<Duration>,
    ) -> Result<(u64, RpcOutcome)> {
        if !self.state().accepts_calls() {
            return Err(Error::NotConnected);
        }

        let timeout = timeout.unwrap_or(self.shared.rpc_timeout);
        let correlation = self.shared.correlations.allocate(&self.shared.pending);
        let slot = self.shared.pending.register(correlation);

        let value = rpc::request_payload(method, params);
        let frame = match Frame::new(FrameKind::RpcRequest, correlation, &value) {
            Ok(frame) => frame,
            Err(err) => {
                self.shared.pending.release(correlation);
                return Err(err.into());
            }
        };

        if self.shared.data_tx.send(frame).is_err() {
            self.shared.pending.release(correlation);
            return Err(Error::ConnectionLost);
        }
        self.shared.wake.wake();

        match slot.wait(timeout) {
            Some(outcome) => Ok((correlation, outcome)),
            None => {
                self.shared.pending.release(correlation);
                Err(Error::RpcTimeout(timeout))
            }
        }
    }

    /// Request a graceful close. Idempotent; the driver drains outbound
    /// traffic before shutting the transport.
    pub fn close(&self) {
        self.shared.close_requested.store(true, Ordering::SeqCst);
        self.shared.wake.wake();
    }

    /// Blocks until the state satisfies the predicate or the timeout lapses.
    /// Returns the state observed last.
    pub fn wait_for_state<F: Fn(ConnectionState) -> bool>(&self, pred: F, timeout: Duration) -> ConnectionState {
        let deadline = Instant::now() + timeout;
        let mut state = self.shared.state.lock().expect("State lock poisoned");

        loop {
            if pred(*state) {
                return *state;
            }

            let now = Instant::now();
            if now >= deadline {
                return *state;
            }

            let (guard, _) = self
                .shared
                .state_cond
                .wait_timeout(state, deadline - now)
                .expect("State lock poisoned");
            state = guard;
        }
    }

    /// Apply a state transition, enforcing the legal table.
    pub(crate) fn transition(&self, to: ConnectionState) -> Result<ConnectionState> {
        let mut state = self.shared.state.lock().expect("State lock poisoned");
        let from = *state;

        if !from.can_transition(to) {
            return Err(Error::State { from, to });
        }

        *state = to;
        self.shared.state_cond.notify_all();

        Ok(from)
    }

    /// Enqueue a frame produced by dispatch (message replies, RPC results).
    pub(crate) fn enqueue_data(&self, frame: Frame) -> Result<()> {
        if !self.state().accepts_calls() {
            return Err(Error::NotConnected);
        }

        self.shared.data_tx.send(frame).map_err(|_| Error::ConnectionLost)?;
        self.shared.wake.wake();

        Ok(())
    }

    /// Called by a handler worker after it finishes one inbound frame.
    pub(crate) fn inbound_done(&self) {
        self.shared.inbound_inflight.fetch_sub(1, Ordering::SeqCst);

        if self.shared.local_paused.load(Ordering::SeqCst) {
            self.shared.wake.wake();
        }
    }

    fn set_failure(&self, failure: ConnectionFailure) {
        let mut slot = self.shared.failure.lock().expect("Failure lock poisoned");
        if slot.is_none() {
            *slot = Some(failure);
        }
    }
}

/// Lifecycle notifications drained by the driver after each pass.
#[derive(Debug)]
pub(crate) enum ConnectionEvent {
    /// First successful heartbeat exchange; the connection is fully live.
    Activated,
    Closed { locally_initiated: bool },
    Failed { locally_initiated: bool },
}

/// Driver-side connection core. Owns the transport exclusively and is only
/// touched from the driver thread; everything shared lives behind the
/// handle.
pub(crate) struct Connection {
    handle: ConnectionHandle,
    settings: ConnectionSettings,
    auth: AuthMode,
    transport: Transport,
    framer: Framer,
    write_buf: Buffer,
    data_rx: Receiver<Frame>,
    control_rx: Receiver<Frame>,
    inbound_tx: Sender<Inbound>,

    // Flow control
    remote_paused: bool,
    local_paused: bool,
    stalled: Option<Frame>,
    high_count: usize,
    low_count: usize,

    // Lifecycle
    connect_deadline: Instant,
    auth_deadline: Instant,
    close_deadline: Option<Instant>,
    pending_auth_failure: Option<String>,
    draining: bool,
    disconnect_frame: Option<Frame>,
    disconnect_sent: bool,
    locally_closed: bool,
    activated: bool,

    // Heartbeat bookkeeping
    last_ping_sent: Instant,
    last_pong_seen: Instant,
    last_ping_seen: Instant,
    last_egress_progress: Instant,
    outstanding_pings: HashMap<u64, Instant>,

    egress_stash: Option<Vec<u8>>,
    events: Vec<ConnectionEvent>,
    log: Logger,
}

impl Connection {
    /// Wraps a server-accepted stream. The connection starts out in
    /// AUTHENTICATING under the auth deadline.
    pub fn accepted(
        stream: mio::net::TcpStream,
        peer: SocketAddr,
        settings: ConnectionSettings,
        auth: AuthMode,
        inbound_tx: Sender<Inbound>,
        wake: DriverWake,
        log: &Logger,
    ) -> Connection {
        let transport = Transport::accepted(stream, peer);

        Connection::build(
            transport,
            ConnectionState::Authenticating,
            Role::Server,
            settings,
            auth,
            inbound_tx,
            wake,
            log,
        )
    }

    /// Starts a non-blocking client connect. The connection begins in
    /// CONNECTING and advances to AUTHENTICATING once the TCP handshake
    /// resolves.
    pub fn connecting(
        addr: &SocketAddr,
        settings: ConnectionSettings,
        auth: AuthMode,
        inbound_tx: Sender<Inbound>,
        wake: DriverWake,
        log: &Logger,
    ) -> NetworkResult<Connection> {
        let transport = Transport::connect(addr)?;

        let conn = Connection::build(
            transport,
            ConnectionState::Disconnected,
            Role::Client,
            settings,
            auth,
            inbound_tx,
            wake,
            log,
        );

        conn.handle
            .transition(ConnectionState::Connecting)
            .expect("Fresh connection must accept CONNECTING");

        Ok(conn)
    }

    fn build(
        transport: Transport,
        initial: ConnectionState,
        role: Role,
        settings: ConnectionSettings,
        auth: AuthMode,
        inbound_tx: Sender<Inbound>,
        wake: DriverWake,
        log: &Logger,
    ) -> Connection {
        let id = Uuid::new_v4();
        let now = Instant::now();

        let (data_tx, data_rx) = crossbeam_channel::bounded(settings.send_queue_size);
        let (control_tx, control_rx) = crossbeam_channel::unbounded();

        let log = log.new(o!("connection_id" => id.to_string()));

        let shared = Arc::new(Shared {
            id,
            role,
            state: Mutex::new(initial),
            state_cond: Condvar::new(),
            data_tx,
            control_tx,
            pending: PendingCalls::new(),
            correlations: CorrelationAllocator::new(),
            wake,
            close_requested: AtomicBool::new(false),
            inbound_inflight: AtomicUsize::new(0),
            local_paused: AtomicBool::new(false),
            rpc_timeout: settings.rpc_timeout,
            stats: Mutex::new(ConnectionStats::default()),
            peer_info: Mutex::new(None),
            session_token: Mutex::new(None),
            failure: Mutex::new(None),
        });

        let capacity = settings.receive_queue_size;
        let high_count = ((capacity as f64) * settings.high_watermark).ceil() as usize;
        let low_count = ((capacity as f64) * settings.low_watermark).floor() as usize;

        debug!(log, "connection created";
               "context" => "build",
               "role" => format!("{:?}", role),
               "peer" => transport.peer_addr().to_string());

        Connection {
            handle: ConnectionHandle { shared },
            framer: Framer::new(settings.buffer_size, settings.max_frame_size),
            write_buf: Buffer::new(settings.buffer_size, settings.max_frame_size + HEADER_SIZE),
            transport,
            data_rx,
            control_rx,
            inbound_tx,
            remote_paused: false,
            local_paused: false,
            stalled: None,
            high_count: high_count.max(1),
            low_count,
            connect_deadline: now + settings.connect_timeout,
            auth_deadline: now + settings.auth_timeout,
            close_deadline: None,
            pending_auth_failure: None,
            draining: false,
            disconnect_frame: None,
            disconnect_sent: false,
            locally_closed: false,
            activated: false,
            last_ping_sent: now,
            last_pong_seen: now,
            last_ping_seen: now,
            last_egress_progress: now,
            outstanding_pings: HashMap::new(),
            egress_stash: None,
            events: Vec::new(),
            settings,
            auth,
            log,
        }
    }

    #[inline]
    pub fn handle(&self) -> &ConnectionHandle {
        &self.handle
    }

    #[inline]
    pub fn state(&self) -> ConnectionState {
        self.handle.state()
    }

    #[inline]
    pub fn is_terminal(&self) -> bool {
        self.state().is_terminal()
    }

    pub fn drain_events(&mut self) -> Vec<ConnectionEvent> {
        std::mem::replace(&mut self.events, Vec::new())
    }

    /// Registers the transport on the driver poll.
    pub fn register(&self, poll: &mio::Poll, token: mio::Token) -> NetworkResult<()> {
        self.transport.register(poll, token)
    }

    /// Removes the transport from the driver poll; tolerates an
    /// already-closed stream.
    pub fn deregister(&self, poll: &mio::Poll) {
        if !self.transport.is_closed() {
            drop(self.transport.deregister(poll));
        }
    }

    /// One driver pass: resolve pending connects, ingest readable bytes,
    /// honor close requests and flush outbound traffic. Fatal errors fold
    /// into the FAILED state internally.
    pub fn drive(&mut self, readable: bool, writable: bool) {
        if self.is_terminal() {
            return;
        }

        if self.state() == ConnectionState::Connecting && writable {
            match self.transport.finish_connect() {
                Ok(true) => self.begin_auth(),
                Ok(false) => (),
                Err(err) => {
                    self.fail(ConnectionFailure::from_network(&err));
                    return;
                }
            }
        }

        if readable && self.state() != ConnectionState::Connecting {
            if let Err(err) = self.ingest() {
                self.fail(ConnectionFailure::from_network(&err));
                return;
            }
        }

        if self.handle.shared.close_requested.swap(false, Ordering::SeqCst) {
            self.request_close();
        }

        // Worker wakes land here; lift a stall or pause as soon as the
        // inbound queue has drained.
        if !self.is_terminal() && (self.stalled.is_some() || self.local_paused) {
            if let Err(err) = self.recover_flow() {
                self.fail(ConnectionFailure::from_network(&err));
                return;
            }
        }

        if self.state().may_emit() {
            if let Err(err) = self.flush() {
                self.fail(ConnectionFailure::from_network(&err));
            }
        }
    }

    /// Periodic duties: deadlines, heartbeats, watermark recovery and drain
    /// completion.
    pub fn housekeeping(&mut self, now: Instant) {
        match self.state() {
            ConnectionState::Connecting => {
                if now >= self.connect_deadline {
                    info!(self.log, "tcp connect timed out"; "context" => "housekeeping");
                    self.fail(ConnectionFailure::Timeout);
                }
            }
            ConnectionState::Authenticating => {
                if now >= self.auth_deadline {
                    info!(self.log, "authentication timed out"; "context" => "housekeeping");
                    self.fail(ConnectionFailure::Authentication {
                        reason: "authentication timed out".to_string(),
                        retry_allowed: false,
                    });
                }
            }
            ConnectionState::Connected | ConnectionState::Active | ConnectionState::Paused => {
                self.heartbeat(now);

                if !self.is_terminal() {
                    if let Err(err) = self.recover_flow() {
                        self.fail(ConnectionFailure::from_network(&err));
                        return;
                    }
                }

                if !self.write_buf.is_empty()
                    && now.duration_since(self.last_egress_progress) > self.settings.connection_timeout
                {
                    warn!(self.log, "write pipeline stalled"; "context" => "housekeeping");
                    self.fail(ConnectionFailure::Timeout);
                }
            }
            ConnectionState::Closing => {
                if let Some(deadline) = self.close_deadline {
                    if now >= deadline {
                        debug!(self.log, "close drain deadline reached"; "context" => "housekeeping");
                        self.finish_close();
                        return;
                    }
                }
            }
            _ => return,
        }

        if self.is_terminal() {
            return;
        }

        // Stalled inbound frames and freshly enqueued output both need a
        // flush pass even without readiness events.
        if self.state().may_emit() {
            if let Err(err) = self.flush() {
                self.fail(ConnectionFailure::from_network(&err));
            }
        }
    }

    fn heartbeat(&mut self, now: Instant) {
        if now.duration_since(self.last_pong_seen) > self.settings.heartbeat_timeout {
            warn!(self.log, "heartbeat timeout";
                  "context" => "heartbeat",
                  "timeout" => ?self.settings.heartbeat_timeout);
            self.fail(ConnectionFailure::HeartbeatTimeout);
            return;
        }

        if now.duration_since(self.last_ping_sent) >= self.settings.heartbeat_interval {
            let correlation = self.handle.shared.correlations.allocate(&self.handle.shared.pending);

            self.outstanding_pings.insert(correlation, now);
            self.enqueue_control(Frame::control(FrameKind::Ping, correlation));
            self.last_ping_sent = now;

            trace!(self.log, "heartbeat ping enqueued";
                   "context" => "heartbeat",
                   "correlation" => correlation);
        }

        // Pings the peer never answered; no reason to track them past the
        // timeout horizon.
        let horizon = self.settings.heartbeat_timeout;
        self.outstanding_pings.retain(|_, sent| now.duration_since(*sent) < horizon);
    }

    /// Client side: TCP is up, present credentials.
    fn begin_auth(&mut self) {
        if self.handle.transition(ConnectionState::Authenticating).is_err() {
            return;
        }

        let now = Instant::now();
        self.auth_deadline = now + self.settings.auth_timeout;

        let value = match &self.auth {
            AuthMode::Client { digest, info } => auth::auth_request(digest, info),
            AuthMode::Server { .. } => return,
        };

        let correlation = self.handle.shared.correlations.allocate(&self.handle.shared.pending);

        match Frame::new(FrameKind::AuthRequest, correlation, &value) {
            Ok(frame) => {
                debug!(self.log, "authentication request enqueued"; "context" => "auth");
                self.enqueue_control(frame);
            }
            Err(err) => self.fail(ConnectionFailure::from_network(&err)),
        }
    }

    /// Pull transport bytes through the framer and handle every complete
    /// frame.
    fn ingest(&mut self) -> NetworkResult<()> {
        let received = self.transport.read_into(self.framer.buffer_mut())?;

        if received > 0 {
            let mut stats = self.handle.shared.stats.lock().expect("Stats lock poisoned");
            stats.bytes_received += received as u64;
        }

        self.process_frames()
    }

    fn process_frames(&mut self) -> NetworkResult<()> {
        loop {
            if self.is_terminal() {
                return Ok(());
            }

            // A stashed frame means the inbound queue is at capacity; no
            // more frames are pulled until the workers drain it.
            if self.stalled.is_some() {
                return Ok(());
            }

            match self.framer.next()? {
                Some(frame) => self.handle_frame(frame)?,
                None => return Ok(()),
            }
        }
    }

    fn handle_frame(&mut self, frame: Frame) -> NetworkResult<()> {
        {
            let mut stats = self.handle.shared.stats.lock().expect("Stats lock poisoned");
            stats.frames_received += 1;
        }

        let state = self.state();

        if state == ConnectionState::Authenticating {
            return self.handle_auth_frame(frame);
        }

        // One handshake per connection; auth frames afterwards are a
        // protocol violation.
        if frame.kind.is_auth() {
            warn!(self.log, "auth frame outside handshake";
                  "context" => "receive",
                  "kind" => ?frame.kind);
            return Err(NetworkError::Fatal(ErrorType::Corrupt));
        }

        match frame.kind {
            FrameKind::Ping => {
                self.last_ping_seen = Instant::now();

                let mut pong = Frame::control(FrameKind::Pong, frame.correlation);
                pong.payload = frame.payload;
                self.enqueue_control(pong);

                self.mark_live();
            }
            FrameKind::Pong => {
                let now = Instant::now();
                self.last_pong_seen = now;

                if let Some(sent) = self.outstanding_pings.remove(&frame.correlation) {
                    let latency = now.duration_since(sent);
                    let mut stats = self.handle.shared.stats.lock().expect("Stats lock poisoned");
                    stats.heartbeat_latency = Some(latency);
                }

                self.mark_live();
            }
            FrameKind::Pause => {
                trace!(self.log, "peer paused the stream"; "context" => "receive");
                self.remote_paused = true;
            }
            FrameKind::Resume => {
                trace!(self.log, "peer resumed the stream"; "context" => "receive");
                self.remote_paused = false;
            }
            FrameKind::RpcResponse => {
                let value = frame.value()?;
                if !self
                    .handle
                    .shared
                    .pending
                    .complete(frame.correlation, rpc::parse_response(&value))
                {
                    debug!(self.log, "response with no pending call, dropped";
                           "context" => "receive",
                           "correlation" => frame.correlation);
                }
            }
            FrameKind::RpcError => {
                let value = frame.value()?;
                if !self
                    .handle
                    .shared
                    .pending
                    .complete(frame.correlation, rpc::parse_error(&value))
                {
                    debug!(self.log, "error with no pending call, dropped";
                           "context" => "receive",
                           "correlation" => frame.correlation);
                }
            }
            FrameKind::Message | FrameKind::RpcRequest => {
                if state == ConnectionState::Closing {
                    debug!(self.log, "data frame during close, dropped"; "context" => "receive");
                    return Ok(());
                }
                self.enqueue_inbound(frame);
            }
            FrameKind::Disconnect => {
                debug!(self.log, "peer requested disconnect"; "context" => "receive");
                self.begin_close(false);
            }
            FrameKind::Error => {
                let detail = frame
                    .value()
                    .ok()
                    .and_then(|v| payload::get_str(&v, "message").map(str::to_string))
                    .unwrap_or_default();
                warn!(self.log, "peer error notice";
                      "context" => "receive",
                      "detail" => detail);
            }
            FrameKind::AuthRequest | FrameKind::AuthSuccess | FrameKind::AuthFailure => {
                unreachable!("Auth frames handled above")
            }
        }

        Ok(())
    }

    fn handle_auth_frame(&mut self, frame: Frame) -> NetworkResult<()> {
        match self.handle.role() {
            Role::Server => self.handle_auth_request(frame),
            Role::Client => self.handle_auth_reply(frame),
        }
    }

    /// Server side of the handshake: exactly one AUTH_REQUEST is accepted.
    fn handle_auth_request(&mut self, frame: Frame) -> NetworkResult<()> {
        let (expected_digest, info) = match &self.auth {
            AuthMode::Server { expected_digest, info } => (expected_digest.clone(), info.clone()),
            AuthMode::Client { .. } => return Err(NetworkError::Fatal(ErrorType::Corrupt)),
        };

        if frame.kind != FrameKind::AuthRequest {
            self.reject_auth("authentication required");
            return Ok(());
        }

        let value = frame.value()?;

        let (digest, client_info) = match auth::parse_auth_request(&value) {
            Some(parsed) => parsed,
            None => {
                self.reject_auth("malformed authentication request");
                return Ok(());
            }
        };

        if !auth::verify_digest(&expected_digest, &digest) {
            info!(self.log, "authentication rejected";
                  "context" => "auth",
                  "client" => client_info.name);
            self.reject_auth("invalid password");
            return Ok(());
        }

        let token = auth::mint_session_token(&mut rand::thread_rng());
        let reply = auth::auth_success(&token, &info);
        let reply = Frame::new(FrameKind::AuthSuccess, frame.correlation, &reply)?;

        self.enqueue_control(reply);

        *self.handle.shared.peer_info.lock().expect("Peer info lock poisoned") = Some(client_info.clone());
        *self.handle.shared.session_token.lock().expect("Token lock poisoned") = Some(token);

        self.complete_auth();

        info!(self.log, "client authenticated";
              "context" => "auth",
              "client" => client_info.name,
              "version" => client_info.version);

        Ok(())
    }

    /// Client side of the handshake: waits for the server's verdict.
    fn handle_auth_reply(&mut self, frame: Frame) -> NetworkResult<()> {
        match frame.kind {
            FrameKind::AuthSuccess => {
                let value = frame.value()?;

                match auth::parse_auth_success(&value) {
                    Some((token, server_info)) => {
                        info!(self.log, "authenticated";
                              "context" => "auth",
                              "server" => server_info.name.clone());

                        *self.handle.shared.peer_info.lock().expect("Peer info lock poisoned") =
                            Some(server_info);
                        *self.handle.shared.session_token.lock().expect("Token lock poisoned") = Some(token);

                        self.complete_auth();
                        Ok(())
                    }
                    None => Err(NetworkError::Fatal(ErrorType::Corrupt)),
                }
            }
            FrameKind::AuthFailure => {
                let value = frame.value()?;
                let (reason, retry_allowed) = auth::parse_auth_failure(&value);

                info!(self.log, "authentication rejected by server";
                      "context" => "auth",
                      "reason" => reason.clone(),
                      "retry_allowed" => retry_allowed);

                self.fail(ConnectionFailure::Authentication { reason, retry_allowed });
                Ok(())
            }
            _ => Err(NetworkError::Fatal(ErrorType::Corrupt)),
        }
    }

    /// Queue an AUTH_FAILURE, then fail once it has drained to the wire.
    fn reject_auth(&mut self, reason: &str) {
        let value = auth::auth_failure(reason, false);

        if let Ok(frame) = Frame::new(FrameKind::AuthFailure, 0, &value) {
            self.enqueue_control(frame);
        }

        self.pending_auth_failure = Some(reason.to_string());
    }

    fn complete_auth(&mut self) {
        if self.handle.transition(ConnectionState::Connected).is_err() {
            return;
        }

        let now = Instant::now();
        self.last_pong_seen = now;
        // Backdate so the next housekeeping pass sends the first ping
        // immediately; activation depends on it.
        self.last_ping_sent = now
            .checked_sub(self.settings.heartbeat_interval)
            .unwrap_or(now);
    }

    /// First heartbeat evidence after CONNECTED promotes the connection to
    /// ACTIVE.
    fn mark_live(&mut self) {
        if self.state() == ConnectionState::Connected {
            if self.handle.transition(ConnectionState::Active).is_ok() && !self.activated {
                self.activated = true;
                self.events.push(ConnectionEvent::Activated);
                info!(self.log, "connection active"; "context" => "lifecycle");
            }
        }
    }

    /// Accept a data frame into the bounded inbound pipeline, emitting PAUSE
    /// at the high watermark and stalling the read side when the queue is
    /// literally full.
    fn enqueue_inbound(&mut self, frame: Frame) {
        if !self.settings.enable_backpressure {
            self.handle.shared.inbound_inflight.fetch_add(1, Ordering::SeqCst);
            drop(self.inbound_tx.send(Inbound {
                conn: self.handle.clone(),
                frame,
            }));
            return;
        }

        let fill = self.handle.shared.inbound_inflight.load(Ordering::SeqCst);

        if fill >= self.settings.receive_queue_size {
            trace!(self.log, "inbound queue full, stalling reads"; "context" => "flow");
            self.stalled = Some(frame);
            return;
        }

        self.handle.shared.inbound_inflight.fetch_add(1, Ordering::SeqCst);
        drop(self.inbound_tx.send(Inbound {
            conn: self.handle.clone(),
            frame,
        }));

        if fill + 1 >= self.high_count && !self.local_paused {
            debug!(self.log, "high watermark reached, pausing peer";
                   "context" => "flow",
                   "fill" => fill + 1);

            self.local_paused = true;
            self.handle.shared.local_paused.store(true, Ordering::SeqCst);
            self.enqueue_control(Frame::control(FrameKind::Pause, 0));

            if self.state() == ConnectionState::Active {
                drop(self.handle.transition(ConnectionState::Paused));
            }
        }
    }

    /// Re-admit stalled frames and lift the pause once the workers drain the
    /// queue below the low watermark.
    fn recover_flow(&mut self) -> NetworkResult<()> {
        let fill = self.handle.shared.inbound_inflight.load(Ordering::SeqCst);

        if let Some(frame) = self.stalled.take() {
            if fill < self.settings.receive_queue_size {
                self.enqueue_inbound(frame);

                // More frames may be waiting behind the stalled one.
                if self.stalled.is_none() {
                    self.process_frames()?;
                }
            } else {
                self.stalled = Some(frame);
            }
        }

        let fill = self.handle.shared.inbound_inflight.load(Ordering::SeqCst);

        if self.local_paused && fill < self.low_count.max(1) {
            debug!(self.log, "low watermark reached, resuming peer";
                   "context" => "flow",
                   "fill" => fill);

            self.local_paused = false;
            self.handle.shared.local_paused.store(false, Ordering::SeqCst);
            self.enqueue_control(Frame::control(FrameKind::Resume, 0));

            if self.state() == ConnectionState::Paused {
                drop(self.handle.transition(ConnectionState::Active));
            }
        }

        Ok(())
    }

    fn enqueue_control(&self, frame: Frame) {
        // The control channel is unbounded; send only fails when the
        // connection is being dismantled, at which point the frame is moot.
        drop(self.handle.shared.control_tx.send(frame));
    }

    /// Local close request observed by the driver.
    fn request_close(&mut self) {
        match self.state() {
            ConnectionState::Connected | ConnectionState::Active | ConnectionState::Paused => {
                self.locally_closed = true;
                self.begin_close(true);
            }
            ConnectionState::Connecting | ConnectionState::Authenticating => {
                // Nothing worth draining before authentication completes.
                self.locally_closed = true;
                drop(self.handle.transition(ConnectionState::Closed));
                self.teardown();
                self.events.push(ConnectionEvent::Closed { locally_initiated: true });
            }
            _ => (),
        }
    }

    /// Enter CLOSING. The DISCONNECT notice is staged and goes on the wire
    /// only after the data queue has drained, so queued traffic is never
    /// cut off by it.
    fn begin_close(&mut self, locally_initiated: bool) {
        match self.state() {
            ConnectionState::Connected | ConnectionState::Active | ConnectionState::Paused => {
                if self.handle.transition(ConnectionState::Closing).is_err() {
                    return;
                }
            }
            ConnectionState::Closing => (),
            _ => return,
        }

        if !self.disconnect_sent && self.disconnect_frame.is_none() {
            let reason = if locally_initiated { "local close" } else { "peer close" };
            let value = payload::map(vec![("reason", Value::String(reason.into()))]);

            if let Ok(frame) = Frame::new(FrameKind::Disconnect, 0, &value) {
                self.disconnect_frame = Some(frame);
            }
        }

        self.draining = true;
        self.close_deadline = Some(Instant::now() + self.settings.connection_timeout);

        debug!(self.log, "closing, draining outbound queue";
               "context" => "close",
               "locally_initiated" => locally_initiated,
               "ping_idle" => ?self.last_ping_seen.elapsed(),
               "pong_idle" => ?self.last_pong_seen.elapsed());
    }

    fn finish_close(&mut self) {
        if self.handle.transition(ConnectionState::Closed).is_err() {
            return;
        }

        self.teardown();
        self.events.push(ConnectionEvent::Closed {
            locally_initiated: self.locally_closed,
        });

        info!(self.log, "connection closed"; "context" => "close");
    }

    /// Terminal failure: record the cause, release resources, fail pending
    /// calls.
    fn fail(&mut self, failure: ConnectionFailure) {
        let state = self.state();

        if state.is_terminal() {
            return;
        }

        error!(self.log, "connection failed";
               "context" => "lifecycle",
               "state" => ?state,
               "failure" => ?failure);

        self.handle.set_failure(failure);
        drop(self.handle.transition(ConnectionState::Failed));
        self.teardown();
        self.events.push(ConnectionEvent::Failed {
            locally_initiated: self.locally_closed,
        });
    }

    fn teardown(&mut self) {
        self.transport.close();
        self.handle.shared.pending.fail_all(RpcOutcome::Lost);
    }

    /// Move queued frames into the write buffer and the write buffer onto
    /// the wire.
    fn flush(&mut self) -> NetworkResult<()> {
        self.pump()?;
        self.write_out()?;

        // Draining the buffer may have opened room for queued frames.
        if !self.control_rx.is_empty() || !self.data_rx.is_empty() || self.egress_stash.is_some() {
            self.pump()?;
            self.write_out()?;
        }

        self.after_flush();

        Ok(())
    }

    fn write_out(&mut self) -> NetworkResult<()> {
        if self.write_buf.is_empty() {
            return Ok(());
        }

        let sent = self.transport.write_from(&mut self.write_buf)?;

        if sent > 0 {
            self.last_egress_progress = Instant::now();
            let mut stats = self.handle.shared.stats.lock().expect("Stats lock poisoned");
            stats.bytes_sent += sent as u64;
        }

        Ok(())
    }

    fn after_flush(&mut self) {
        let flushed =
            self.write_buf.is_empty() && self.egress_stash.is_none() && self.control_rx.is_empty();

        if flushed {
            if let Some(reason) = self.pending_auth_failure.take() {
                self.fail(ConnectionFailure::Authentication {
                    reason,
                    retry_allowed: false,
                });
                return;
            }
        }

        if self.draining && self.disconnect_sent && flushed && self.data_rx.is_empty() {
            self.finish_close();
        }
    }

    fn pump(&mut self) -> NetworkResult<()> {
        if let Some(wire) = self.egress_stash.take() {
            if !self.append_wire(&wire) {
                self.egress_stash = Some(wire);
                return Ok(());
            }
        }

        // Control frames first; they also pass a remote pause.
        while let Ok(frame) = self.control_rx.try_recv() {
            let wire = codec::encode(&frame, false)?;

            if !self.append_wire(&wire) {
                self.egress_stash = Some(wire);
                return Ok(());
            }
        }

        if !self.remote_paused {
            while let Ok(frame) = self.data_rx.try_recv() {
                let wire = codec::encode(&frame, self.settings.enable_compression)?;

                if !self.append_wire(&wire) {
                    self.egress_stash = Some(wire);
                    return Ok(());
                }
            }
        }

        // The staged DISCONNECT follows every data frame that made it into
        // the queue before close.
        if self.draining && self.data_rx.is_empty() && self.egress_stash.is_none() {
            if let Some(frame) = self.disconnect_frame.take() {
                let wire = codec::encode(&frame, false)?;

                if self.append_wire(&wire) {
                    self.disconnect_sent = true;
                } else {
                    self.disconnect_frame = Some(frame);
                }
            }
        }

        Ok(())
    }

    fn append_wire(&mut self, wire: &[u8]) -> bool {
        if self.write_buf.free_capacity() < wire.len() {
            return false;
        }

        let slice = self.write_buf.write_slice(wire.len());
        slice[..wire.len()].copy_from_slice(wire);
        self.write_buf.move_tail(wire.len());

        let mut stats = self.handle.shared.stats.lock().expect("Stats lock poisoned");
        stats.frames_sent += 1;

        true
    }
}

#[cfg(test)]
pub(crate) fn test_settings() -> ConnectionSettings {
    ConnectionSettings {
        buffer_size: 4096,
        max_frame_size: 256 * 1024,
        send_queue_size: 64,
        receive_queue_size: 64,
        enable_compression: false,
        enable_backpressure: true,
        high_watermark: 0.8,
        low_watermark: 0.5,
        connect_timeout: Duration::from_secs(5),
        auth_timeout: Duration::from_secs(5),
        connection_timeout: Duration::from_secs(5),
        heartbeat_interval: Duration::from_secs(30),
        heartbeat_timeout: Duration::from_secs(90),
        rpc_timeout: Duration::from_secs(5),
    }
}

/// Builds a driverless handle pair for dispatch tests: the returned
/// receivers observe what the handle enqueues.
#[cfg(test)]
pub(crate) fn detached_handle(
    state: ConnectionState,
    settings: &ConnectionSettings,
) -> (ConnectionHandle, Receiver<Frame>, Receiver<Frame>) {
    let (_registration, wake) = wake_pair();
    let (data_tx, data_rx) = crossbeam_channel::bounded(settings.send_queue_size);
    let (control_tx, control_rx) = crossbeam_channel::unbounded();

    let shared = Arc::new(Shared {
        id: Uuid::new_v4(),
        role: Role::Server,
        state: Mutex::new(state),
        state_cond: Condvar::new(),
        data_tx,
        control_tx,
        pending: PendingCalls::new(),
        correlations: CorrelationAllocator::new(),
        wake,
        close_requested: AtomicBool::new(false),
        inbound_inflight: AtomicUsize::new(0),
        local_paused: AtomicBool::new(false),
        rpc_timeout: settings.rpc_timeout,
        stats: Mutex::new(ConnectionStats::default()),
        peer_info: Mutex::new(None),
        session_token: Mutex::new(None),
        failure: Mutex::new(None),
    });

    (ConnectionHandle { shared }, data_rx, control_rx)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::logging;
    use crate::net::codec::encode;
    use std::io::{Read, Write};
    use std::net::TcpListener;

    const PASSWORD: &str = "hunter2";

    struct Harness {
        conn: Connection,
        peer: std::net::TcpStream,
        peer_framer: Framer,
        inbound_rx: Receiver<Inbound>,
        sent_bytes: u64,
    }

    impl Harness {
        fn server() -> Harness {
            Harness::server_with(test_settings())
        }

        fn server_with(settings: ConnectionSettings) -> Harness {
            let listener = TcpListener::bind("127.0.0.1:0").unwrap();
            let addr = listener.local_addr().unwrap();

            let peer = std::net::TcpStream::connect(addr).unwrap();
            let (accepted, peer_addr) = listener.accept().unwrap();
            accepted.set_nonblocking(true).unwrap();

            let (_registration, wake) = wake_pair();
            let (inbound_tx, inbound_rx) = crossbeam_channel::unbounded();

            let conn = Connection::accepted(
                mio::net::TcpStream::from_stream(accepted).unwrap(),
                peer_addr,
                settings,
                AuthMode::Server {
                    expected_digest: auth::password_digest(PASSWORD),
                    info: PeerInfo::new("test-server"),
                },
                inbound_tx,
                wake,
                &logging::noop(),
            );

            Harness {
                conn,
                peer,
                peer_framer: Framer::new(4096, 256 * 1024),
                inbound_rx,
                sent_bytes: 0,
            }
        }

        /// Write raw frames from the peer side and drive until the
        /// connection has ingested them (or died trying).
        fn send_frames(&mut self, frames: &[Frame]) {
            for frame in frames {
                let wire = encode(frame, false).unwrap();
                self.peer.write_all(&wire).unwrap();
                self.sent_bytes += wire.len() as u64;
            }

            for _ in 0..500 {
                self.conn.drive(true, true);

                if self.conn.is_terminal() {
                    break;
                }
                if self.conn.handle().stats().bytes_received >= self.sent_bytes {
                    break;
                }

                std::thread::sleep(Duration::from_millis(2));
            }
        }

        /// Read every frame the connection has emitted so far.
        fn recv_frames(&mut self) -> Vec<Frame> {
            self.conn.drive(false, true);

            let mut frames = Vec::new();
            let mut chunk = [0u8; 8192];

            self.peer
                .set_read_timeout(Some(Duration::from_millis(200)))
                .unwrap();

            loop {
                match self.peer.read(&mut chunk) {
                    Ok(0) => break,
                    Ok(count) => self.peer_framer.feed(&chunk[..count]),
                    Err(_) => break,
                }

                while let Ok(Some(frame)) = self.peer_framer.next() {
                    frames.push(frame);
                }
            }

            while let Ok(Some(frame)) = self.peer_framer.next() {
                frames.push(frame);
            }

            frames
        }

        fn authenticate(&mut self) {
            let value = auth::auth_request(&auth::password_digest(PASSWORD), &PeerInfo::new("test-client"));
            let frame = Frame::new(FrameKind::AuthRequest, 1, &value).unwrap();

            self.send_frames(&[frame]);
            assert_eq!(self.conn.state(), ConnectionState::Connected);

            let replies = self.recv_frames();
            assert!(replies.iter().any(|f| f.kind == FrameKind::AuthSuccess));
        }

        fn activate(&mut self) {
            self.authenticate();

            self.send_frames(&[Frame::control(FrameKind::Ping, 99)]);
            assert_eq!(self.conn.state(), ConnectionState::Active);

            // Drain the mirrored pong.
            let replies = self.recv_frames();
            assert!(replies.iter().any(|f| f.kind == FrameKind::Pong));
        }
    }

    #[test]
    fn test_transition_table() {
        use ConnectionState::*;

        let legal = [
            (Disconnected, Connecting),
            (Connecting, Authenticating),
            (Connecting, Failed),
            (Authenticating, Connected),
            (Authenticating, Failed),
            (Connected, Active),
            (Active, Paused),
            (Paused, Active),
            (Active, Closing),
            (Paused, Closing),
            (Active, Failed),
            (Paused, Failed),
            (Closing, Closed),
        ];

        for (from, to) in &legal {
            assert!(from.can_transition(*to), "{:?} -> {:?} must be legal", from, to);
        }

        let illegal = [
            (Disconnected, Active),
            (Connecting, Active),
            (Authenticating, Active),
            (Connected, Paused),
            (Closed, Connecting),
            (Failed, Connecting),
            (Closed, Active),
            (Active, Connecting),
            (Closing, Active),
        ];

        for (from, to) in &illegal {
            assert!(!from.can_transition(*to), "{:?} -> {:?} must be illegal", from, to);
        }
    }

    #[test]
    fn test_illegal_transition_leaves_state() {
        let (handle, _data, _control) = detached_handle(ConnectionState::Active, &test_settings());

        let err = handle.transition(ConnectionState::Connecting).unwrap_err();
        match err {
            Error::State { from, to } => {
                assert_eq!(from, ConnectionState::Active);
                assert_eq!(to, ConnectionState::Connecting);
            }
            err => panic!("Unexpected error {:?}", err),
        }

        assert_eq!(handle.state(), ConnectionState::Active);
    }

    #[test]
    fn test_send_requires_active_state() {
        let settings = test_settings();

        for state in &[
            ConnectionState::Disconnected,
            ConnectionState::Connecting,
            ConnectionState::Authenticating,
            ConnectionState::Connected,
            ConnectionState::Closing,
            ConnectionState::Closed,
            ConnectionState::Failed,
        ] {
            let (handle, _data, _control) = detached_handle(*state, &settings);
            let result = handle.send_message("chat", payload::empty());
            assert!(matches!(result, Err(Error::NotConnected)), "state {:?}", state);
        }

        let (handle, data_rx, _control) = detached_handle(ConnectionState::Active, &settings);
        handle.send_message("chat", payload::empty()).unwrap();

        let frame = data_rx.try_recv().unwrap();
        assert_eq!(frame.kind, FrameKind::Message);
        assert_eq!(frame.correlation, 0);
    }

    #[test]
    fn test_server_handshake_success() {
        let mut harness = Harness::server();
        assert_eq!(harness.conn.state(), ConnectionState::Authenticating);

        harness.authenticate();

        let handle = harness.conn.handle().clone();
        assert!(handle.session_token().is_some());
        assert_eq!(handle.peer_info().unwrap().name, "test-client");
    }

    #[test]
    fn test_server_handshake_wrong_password() {
        let mut harness = Harness::server();

        let value = auth::auth_request(&auth::password_digest("wrong"), &PeerInfo::new("test-client"));
        let frame = Frame::new(FrameKind::AuthRequest, 1, &value).unwrap();
        harness.send_frames(&[frame]);

        let replies = harness.recv_frames();
        assert_eq!(replies[0].kind, FrameKind::AuthFailure);

        let (reason, retry) = auth::parse_auth_failure(&replies[0].value().unwrap());
        assert_eq!(reason, "invalid password");
        assert!(!retry);

        // Failure is recorded after the notice drains.
        harness.conn.drive(false, true);
        assert_eq!(harness.conn.state(), ConnectionState::Failed);

        match harness.conn.handle().failure() {
            Some(ConnectionFailure::Authentication { retry_allowed, .. }) => assert!(!retry_allowed),
            failure => panic!("Unexpected failure {:?}", failure),
        }
    }

    #[test]
    fn test_non_auth_frame_during_handshake_rejected() {
        let mut harness = Harness::server();

        harness.send_frames(&[Frame::control(FrameKind::Ping, 1)]);
        harness.recv_frames();
        harness.conn.drive(false, true);

        assert_eq!(harness.conn.state(), ConnectionState::Failed);
    }

    #[test]
    fn test_auth_frame_after_handshake_is_fatal() {
        let mut harness = Harness::server();
        harness.activate();

        let value = auth::auth_request(&auth::password_digest(PASSWORD), &PeerInfo::new("test-client"));
        let frame = Frame::new(FrameKind::AuthRequest, 2, &value).unwrap();
        harness.send_frames(&[frame]);

        assert_eq!(harness.conn.state(), ConnectionState::Failed);
    }

    #[test]
    fn test_ping_mirrors_pong() {
        let mut harness = Harness::server();
        harness.authenticate();

        let mut ping = Frame::control(FrameKind::Ping, 77);
        ping.payload = payload::to_bytes(&payload::map(vec![("nonce", Value::from(5))])).unwrap();
        harness.send_frames(&[ping.clone()]);

        let replies = harness.recv_frames();
        let pong = replies.iter().find(|f| f.kind == FrameKind::Pong).unwrap();

        assert_eq!(pong.correlation, 77);
        assert_eq!(pong.payload, ping.payload);
    }

    #[test]
    fn test_first_heartbeat_activates() {
        let mut harness = Harness::server();
        harness.authenticate();
        assert_eq!(harness.conn.state(), ConnectionState::Connected);

        harness.send_frames(&[Frame::control(FrameKind::Ping, 1)]);
        assert_eq!(harness.conn.state(), ConnectionState::Active);

        let events = harness.conn.drain_events();
        assert!(events.iter().any(|e| matches!(e, ConnectionEvent::Activated)));
    }

    #[test]
    fn test_heartbeat_timeout_fails_connection() {
        let mut settings = test_settings();
        settings.heartbeat_timeout = Duration::from_millis(10);

        let mut harness = Harness::server_with(settings);
        harness.authenticate();

        std::thread::sleep(Duration::from_millis(30));
        harness.conn.housekeeping(Instant::now());

        assert_eq!(harness.conn.state(), ConnectionState::Failed);
        assert!(matches!(
            harness.conn.handle().failure(),
            Some(ConnectionFailure::HeartbeatTimeout)
        ));
    }

    #[test]
    fn test_auth_timeout_fails_connection() {
        let mut settings = test_settings();
        settings.auth_timeout = Duration::from_millis(10);

        let mut harness = Harness::server_with(settings);

        std::thread::sleep(Duration::from_millis(30));
        harness.conn.housekeeping(Instant::now());

        assert_eq!(harness.conn.state(), ConnectionState::Failed);
    }

    #[test]
    fn test_message_reaches_dispatch_queue() {
        let mut harness = Harness::server();
        harness.activate();

        let value = payload::map(vec![
            ("type", Value::String("chat".into())),
            ("data", payload::map(vec![("text", Value::String("hello".into()))])),
        ]);
        let frame = Frame::new(FrameKind::Message, 0, &value).unwrap();
        harness.send_frames(&[frame]);

        let inbound = harness.inbound_rx.try_recv().unwrap();
        assert_eq!(inbound.frame.kind, FrameKind::Message);
        assert_eq!(inbound.conn.id(), harness.conn.handle().id());
    }

    #[test]
    fn test_backpressure_pause_and_resume() {
        let mut settings = test_settings();
        settings.receive_queue_size = 4;
        settings.high_watermark = 0.5;
        settings.low_watermark = 0.3;

        let mut harness = Harness::server_with(settings);
        harness.activate();

        let value = payload::map(vec![("type", Value::String("flood".into()))]);
        let frames: Vec<Frame> = (0..3)
            .map(|_| Frame::new(FrameKind::Message, 0, &value).unwrap())
            .collect();

        harness.send_frames(&frames);

        // Two frames reach the 0.5 watermark of a 4-slot queue.
        assert_eq!(harness.conn.state(), ConnectionState::Paused);
        let replies = harness.recv_frames();
        assert!(replies.iter().any(|f| f.kind == FrameKind::Pause));

        // Workers drain the queue; the connection resumes.
        let handle = harness.conn.handle().clone();
        while let Ok(inbound) = harness.inbound_rx.try_recv() {
            drop(inbound);
            handle.inbound_done();
        }

        harness.conn.housekeeping(Instant::now());
        assert_eq!(harness.conn.state(), ConnectionState::Active);

        let replies = harness.recv_frames();
        assert!(replies.iter().any(|f| f.kind == FrameKind::Resume));
    }

    #[test]
    fn test_inbound_queue_never_exceeds_bound() {
        let mut settings = test_settings();
        settings.receive_queue_size = 2;
        settings.high_watermark = 0.5;
        settings.low_watermark = 0.3;

        let mut harness = Harness::server_with(settings);
        harness.activate();

        let value = payload::map(vec![("type", Value::String("flood".into()))]);
        let frames: Vec<Frame> = (0..5)
            .map(|_| Frame::new(FrameKind::Message, 0, &value).unwrap())
            .collect();

        harness.send_frames(&frames);

        // Bound is two; the third frame is stalled, the rest stay unread.
        assert!(harness.inbound_rx.len() <= 2);
        assert!(harness.conn.stalled.is_some());
    }

    #[test]
    fn test_rpc_response_completes_pending_call() {
        let mut harness = Harness::server();
        harness.activate();

        let handle = harness.conn.handle().clone();
        let correlation = handle.shared.correlations.allocate(&handle.shared.pending);
        let slot = handle.shared.pending.register(correlation);

        let frame = Frame::new(
            FrameKind::RpcResponse,
            correlation,
            &rpc::response_payload(Value::from(30)),
        )
        .unwrap();
        harness.send_frames(&[frame]);

        match slot.wait(Duration::from_millis(100)).unwrap() {
            RpcOutcome::Response(value) => assert_eq!(value, Value::from(30)),
            outcome => panic!("Unexpected outcome {:?}", outcome),
        }
    }

    #[test]
    fn test_unknown_correlation_is_dropped_quietly() {
        let mut harness = Harness::server();
        harness.activate();

        let frame = Frame::new(FrameKind::RpcResponse, 9999, &rpc::response_payload(Value::Nil)).unwrap();
        harness.send_frames(&[frame]);

        // The connection shrugs it off.
        assert_eq!(harness.conn.state(), ConnectionState::Active);
    }

    #[test]
    fn test_graceful_close_drains_and_acks() {
        let mut harness = Harness::server();
        harness.activate();

        let handle = harness.conn.handle().clone();
        handle.send_message("bye", payload::empty()).unwrap();
        handle.close();

        harness.conn.drive(false, true);
        let replies = harness.recv_frames();

        // The queued message reaches the wire before the disconnect notice.
        let message_pos = replies.iter().position(|f| f.kind == FrameKind::Message);
        let disconnect_pos = replies.iter().position(|f| f.kind == FrameKind::Disconnect);
        assert!(message_pos.is_some());
        assert!(disconnect_pos.is_some());
        assert!(message_pos.unwrap() < disconnect_pos.unwrap());

        assert_eq!(harness.conn.state(), ConnectionState::Closed);

        let result = handle.send_message("late", payload::empty());
        assert!(matches!(result, Err(Error::NotConnected)));
    }

    #[test]
    fn test_peer_disconnect_acked_and_closed() {
        let mut harness = Harness::server();
        harness.activate();

        let value = payload::map(vec![("reason", Value::String("peer shutdown".into()))]);
        let frame = Frame::new(FrameKind::Disconnect, 0, &value).unwrap();
        harness.send_frames(&[frame]);

        let replies = harness.recv_frames();
        assert!(replies.iter().any(|f| f.kind == FrameKind::Disconnect));

        assert_eq!(harness.conn.state(), ConnectionState::Closed);
    }

    #[test]
    fn test_pending_calls_fail_on_teardown() {
        let mut harness = Harness::server();
        harness.activate();

        let handle = harness.conn.handle().clone();
        let correlation = handle.shared.correlations.allocate(&handle.shared.pending);
        let slot = handle.shared.pending.register(correlation);

        // Peer vanishes.
        drop(harness.peer.shutdown(std::net::Shutdown::Both));
        for _ in 0..500 {
            harness.conn.drive(true, true);
            if harness.conn.is_terminal() {
                break;
            }
            std::thread::sleep(Duration::from_millis(2));
        }

        assert_eq!(harness.conn.state(), ConnectionState::Failed);
        assert!(matches!(slot.wait(Duration::from_millis(100)), Some(RpcOutcome::Lost)));
    }

    #[test]
    fn test_remote_pause_holds_data_frames() {
        let mut harness = Harness::server();
        harness.activate();

        harness.send_frames(&[Frame::control(FrameKind::Pause, 0)]);
        assert!(harness.conn.remote_paused);

        let handle = harness.conn.handle().clone();
        handle.send_message("held", payload::empty()).unwrap();
        harness.conn.drive(false, true);

        // Only control traffic may appear while paused.
        let replies = harness.recv_frames();
        assert!(replies.iter().all(|f| f.kind != FrameKind::Message));

        harness.send_frames(&[Frame::control(FrameKind::Resume, 0)]);
        harness.conn.drive(false, true);

        let replies = harness.recv_frames();
        assert!(replies.iter().any(|f| f.kind == FrameKind::Message));
    }
}
