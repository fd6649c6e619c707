//! Name-keyed dispatch. Free-form messages route by type tag, RPC requests
//! by method name; both handler families run on the worker pool, never on
//! the receive pipeline. Handler failures become RPC_ERROR envelopes and
//! leave the connection healthy.

use crate::error::{code, HandlerFault};
use crate::logging::{debug, warn, Logger};
use crate::net::codec::{Frame, FrameKind};
use crate::net::connection::{ConnectionHandle, Inbound};
use crate::payload::{self, map};
use crate::rpc;
use crossbeam_channel::{Receiver, Sender};
use hashbrown::HashMap;
use rmpv::Value;
use std::panic::{self, AssertUnwindSafe};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};
use std::thread;
use std::time::Duration;

pub type MessageHandler =
    Arc<dyn Fn(&ConnectionHandle, &Value) -> Result<Option<Value>, HandlerFault> + Send + Sync>;
pub type RpcHandler = Arc<dyn Fn(&ConnectionHandle, &Value) -> Result<Value, HandlerFault> + Send + Sync>;

/// Accepted value shapes for schema checks.
#[derive(Debug, Clone, Copy, Eq, PartialEq)]
pub enum ParamKind {
    Any,
    Bool,
    Integer,
    Float,
    Str,
    Binary,
    Array,
    Map,
}

impl ParamKind {
    fn matches(self, value: &Value) -> bool {
        match self {
            ParamKind::Any => true,
            ParamKind::Bool => value.is_bool(),
            ParamKind::Integer => value.is_i64() || value.is_u64(),
            ParamKind::Float => value.is_f64() || value.is_i64() || value.is_u64(),
            ParamKind::Str => value.is_str(),
            ParamKind::Binary => value.is_bin(),
            ParamKind::Array => value.is_array(),
            ParamKind::Map => value.is_map(),
        }
    }

    fn name(self) -> &'static str {
        match self {
            ParamKind::Any => "any",
            ParamKind::Bool => "bool",
            ParamKind::Integer => "int",
            ParamKind::Float => "float",
            ParamKind::Str => "str",
            ParamKind::Binary => "bin",
            ParamKind::Array => "array",
            ParamKind::Map => "map",
        }
    }
}

#[derive(Debug, Clone)]
pub struct ParamSpec {
    pub name: String,
    pub kind: ParamKind,
    pub required: bool,
}

impl ParamSpec {
    pub fn required<S: Into<String>>(name: S, kind: ParamKind) -> ParamSpec {
        ParamSpec {
            name: name.into(),
            kind,
            required: true,
        }
    }

    pub fn optional<S: Into<String>>(name: S, kind: ParamKind) -> ParamSpec {
        ParamSpec {
            name: name.into(),
            kind,
            required: false,
        }
    }
}

/// Parameter contract attached to an RPC registration; checked before the
/// handler runs and reported by `listall`.
#[derive(Debug, Clone)]
pub struct MethodSchema {
    pub description: String,
    pub params: Vec<ParamSpec>,
}

impl MethodSchema {
    pub fn new<S: Into<String>>(description: S) -> MethodSchema {
        MethodSchema {
            description: description.into(),
            params: Vec::new(),
        }
    }

    pub fn with_param(mut self, spec: ParamSpec) -> MethodSchema {
        self.params.push(spec);
        self
    }

    fn validate(&self, params: &Value) -> Result<(), HandlerFault> {
        for spec in &self.params {
            match payload::get(params, &spec.name) {
                Some(value) => {
                    if !spec.kind.matches(value) {
                        return Err(HandlerFault::with_code(
                            code::INVALID_PARAMS,
                            format!("parameter '{}' must be {}", spec.name, spec.kind.name()),
                        ));
                    }
                }
                None => {
                    if spec.required {
                        return Err(HandlerFault::with_code(
                            code::INVALID_PARAMS,
                            format!("missing required parameter '{}'", spec.name),
                        ));
                    }
                }
            }
        }

        Ok(())
    }

    fn describe(&self) -> Value {
        Value::Array(
            self.params
                .iter()
                .map(|spec| {
                    map(vec![
                        ("name", Value::String(spec.name.clone().into())),
                        ("type", Value::String(spec.kind.name().into())),
                        ("required", Value::Boolean(spec.required)),
                    ])
                })
                .collect(),
        )
    }
}

struct MessageEntry {
    priority: i32,
    handler: MessageHandler,
}

struct MethodEntry {
    schema: MethodSchema,
    handler: RpcHandler,
}

/// The handler registry. Registration happens at startup; dispatch takes a
/// snapshot of the relevant entry under a short lock and runs outside it.
pub struct Router {
    messages: Mutex<HashMap<String, Vec<MessageEntry>>>,
    methods: Mutex<HashMap<String, Arc<MethodEntry>>>,
    log: Logger,
}

impl Router {
    pub fn new(log: Logger) -> Router {
        Router {
            messages: Mutex::new(HashMap::new()),
            methods: Mutex::new(HashMap::new()),
            log,
        }
    }

    /// Register a message handler for a type tag. Priority orders handlers
    /// within one tag only; the highest-priority non-None return is the
    /// authoritative response.
    pub fn register_message<F>(&self, type_tag: &str, priority: i32, handler: F)
    where
        F: Fn(&ConnectionHandle, &Value) -> Result<Option<Value>, HandlerFault> + Send + Sync + 'static,
    {
        let mut messages = self.messages.lock().expect("Message registry lock poisoned");
        let entries = messages.entry(type_tag.to_string()).or_insert_with(Vec::new);

        entries.push(MessageEntry {
            priority,
            handler: Arc::new(handler),
        });
        entries.sort_by(|a, b| b.priority.cmp(&a.priority));

        debug!(self.log, "message handler registered";
               "context" => "register",
               "type" => type_tag,
               "priority" => priority);
    }

    /// Register an RPC method. A duplicate name replaces the prior entry.
    pub fn register_rpc<F>(&self, name: &str, schema: MethodSchema, handler: F)
    where
        F: Fn(&ConnectionHandle, &Value) -> Result<Value, HandlerFault> + Send + Sync + 'static,
    {
        self.methods
            .lock()
            .expect("Method registry lock poisoned")
            .insert(
                name.to_string(),
                Arc::new(MethodEntry {
                    schema,
                    handler: Arc::new(handler),
                }),
            );

        debug!(self.log, "rpc method registered"; "context" => "register", "method" => name);
    }

    pub fn method_count(&self) -> usize {
        self.methods.lock().expect("Method registry lock poisoned").len()
    }

    /// Route one inbound frame. Never propagates handler failures; request
    /// scoped errors go back as RPC_ERROR, everything else is logged.
    pub fn dispatch(&self, conn: &ConnectionHandle, frame: Frame) {
        match frame.kind {
            FrameKind::Message => self.dispatch_message(conn, frame),
            FrameKind::RpcRequest => self.dispatch_rpc(conn, frame),
            kind => {
                warn!(self.log, "undispatchable frame kind";
                      "context" => "dispatch",
                      "kind" => ?kind);
            }
        }
    }

    fn dispatch_message(&self, conn: &ConnectionHandle, frame: Frame) {
        let value = match frame.value() {
            Ok(value) => value,
            Err(_) => {
                warn!(self.log, "undecodable message payload, dropped"; "context" => "dispatch");
                return;
            }
        };

        let type_tag = match payload::get_str(&value, "type") {
            Some(tag) => tag.to_string(),
            None => {
                warn!(self.log, "message without type tag, dropped"; "context" => "dispatch");
                return;
            }
        };

        let data = payload::get(&value, "data").cloned().unwrap_or_else(payload::empty);

        let handlers: Vec<MessageHandler> = {
            let messages = self.messages.lock().expect("Message registry lock poisoned");
            match messages.get(&type_tag) {
                Some(entries) => entries.iter().map(|e| e.handler.clone()).collect(),
                None => {
                    debug!(self.log, "no handler for message type";
                           "context" => "dispatch",
                           "type" => type_tag);
                    return;
                }
            }
        };

        let mut reply: Option<Value> = None;

        for handler in handlers {
            match panic::catch_unwind(AssertUnwindSafe(|| handler(conn, &data))) {
                Ok(Ok(Some(value))) => {
                    // Highest priority runs first; its return is
                    // authoritative. Later handlers still observe the
                    // message.
                    if reply.is_none() {
                        reply = Some(value);
                    }
                }
                Ok(Ok(None)) => (),
                Ok(Err(fault)) => {
                    warn!(self.log, "message handler failed";
                          "context" => "dispatch",
                          "type" => type_tag.clone(),
                          "code" => fault.code,
                          "detail" => fault.message);
                }
                Err(_) => {
                    warn!(self.log, "message handler panicked";
                          "context" => "dispatch",
                          "type" => type_tag.clone());
                }
            }
        }

        if let Some(data) = reply {
            // Request/response over messaging: same type tag, mirrored
            // correlation.
            let value = map(vec![
                ("type", Value::String(type_tag.clone().into())),
                ("data", data),
            ]);

            match Frame::new(FrameKind::Message, frame.correlation, &value) {
                Ok(reply) => {
                    if conn.enqueue_data(reply).is_err() {
                        debug!(self.log, "reply dropped, connection gone";
                               "context" => "dispatch",
                               "type" => type_tag);
                    }
                }
                Err(_) => {
                    warn!(self.log, "reply payload failed to encode"; "context" => "dispatch");
                }
            }
        }
    }

    fn dispatch_rpc(&self, conn: &ConnectionHandle, frame: Frame) {
        let correlation = frame.correlation;

        let value = match frame.value() {
            Ok(value) => value,
            Err(_) => {
                self.respond_error(
                    conn,
                    correlation,
                    code::VALIDATION_PAYLOAD,
                    "request payload is not a map",
                    None,
                );
                return;
            }
        };

        let method = match payload::get_str(&value, "method") {
            Some(method) => method.to_string(),
            None => {
                self.respond_error(
                    conn,
                    correlation,
                    code::VALIDATION_PAYLOAD,
                    "request is missing 'method'",
                    None,
                );
                return;
            }
        };

        let params = payload::get(&value, "params").cloned().unwrap_or_else(payload::empty);

        if !params.is_map() {
            self.respond_error(
                conn,
                correlation,
                code::VALIDATION_PARAMS,
                "'params' must be a map",
                None,
            );
            return;
        }

        if method == "listall" {
            self.respond_result(conn, correlation, self.listall());
            return;
        }

        let entry = {
            let methods = self.methods.lock().expect("Method registry lock poisoned");
            methods.get(&method).cloned()
        };

        let entry = match entry {
            Some(entry) => entry,
            None => {
                self.respond_error(
                    conn,
                    correlation,
                    code::METHOD_NOT_FOUND,
                    &format!("unknown method '{}'", method),
                    None,
                );
                return;
            }
        };

        if let Err(fault) = entry.schema.validate(&params) {
            self.respond_error(conn, correlation, fault.code, &fault.message, fault.details);
            return;
        }

        match panic::catch_unwind(AssertUnwindSafe(|| (entry.handler)(conn, &params))) {
            Ok(Ok(result)) => self.respond_result(conn, correlation, result),
            Ok(Err(fault)) => {
                self.respond_error(conn, correlation, fault.code, &fault.message, fault.details)
            }
            Err(_) => {
                warn!(self.log, "rpc handler panicked";
                      "context" => "dispatch",
                      "method" => method);
                self.respond_error(
                    conn,
                    correlation,
                    code::HANDLER_ERROR,
                    "handler failed unexpectedly",
                    None,
                );
            }
        }
    }

    /// Discovery payload for the built-in `listall` method.
    fn listall(&self) -> Value {
        let methods = self.methods.lock().expect("Method registry lock poisoned");

        let mut entries: Vec<(String, Arc<MethodEntry>)> =
            methods.iter().map(|(name, entry)| (name.clone(), entry.clone())).collect();
        entries.sort_by(|a, b| a.0.cmp(&b.0));

        Value::Array(
            entries
                .into_iter()
                .map(|(name, entry)| {
                    map(vec![
                        ("name", Value::String(name.into())),
                        ("description", Value::String(entry.schema.description.clone().into())),
                        ("parameters", entry.schema.describe()),
                    ])
                })
                .collect(),
        )
    }

    fn respond_result(&self, conn: &ConnectionHandle, correlation: u64, result: Value) {
        let payload = rpc::response_payload(result);

        match Frame::new(FrameKind::RpcResponse, correlation, &payload) {
            Ok(frame) => {
                if conn.enqueue_data(frame).is_err() {
                    debug!(self.log, "response dropped, connection gone";
                           "context" => "dispatch",
                           "correlation" => correlation);
                }
            }
            Err(_) => warn!(self.log, "response failed to encode"; "context" => "dispatch"),
        }
    }

    fn respond_error(
        &self,
        conn: &ConnectionHandle,
        correlation: u64,
        code: i64,
        message: &str,
        details: Option<Value>,
    ) {
        let payload = rpc::error_payload(code, message, details);

        match Frame::new(FrameKind::RpcError, correlation, &payload) {
            Ok(frame) => {
                if conn.enqueue_data(frame).is_err() {
                    debug!(self.log, "error response dropped, connection gone";
                           "context" => "dispatch",
                           "correlation" => correlation);
                }
            }
            Err(_) => warn!(self.log, "error response failed to encode"; "context" => "dispatch"),
        }
    }
}

/// Worker pool draining the inbound queue into the router. A slow handler
/// occupies one worker; the receive pipelines keep running.
pub(crate) struct Dispatcher {
    inbound_tx: Sender<Inbound>,
    workers: Vec<thread::JoinHandle<()>>,
    running: Arc<AtomicBool>,
}

impl Dispatcher {
    pub fn start(router: Arc<Router>, threads: usize, log: &Logger) -> Dispatcher {
        let (inbound_tx, inbound_rx): (Sender<Inbound>, Receiver<Inbound>) = crossbeam_channel::unbounded();
        let running = Arc::new(AtomicBool::new(true));

        let workers = (0..threads.max(1))
            .map(|index| {
                let rx = inbound_rx.clone();
                let router = router.clone();
                let running = running.clone();
                let log = log.new(crate::logging::o!("worker" => index));

                thread::Builder::new()
                    .name(format!("conduit-worker-{}", index))
                    .spawn(move || {
                        loop {
                            match rx.recv_timeout(Duration::from_millis(100)) {
                                Ok(inbound) => {
                                    router.dispatch(&inbound.conn, inbound.frame);
                                    inbound.conn.inbound_done();
                                }
                                Err(crossbeam_channel::RecvTimeoutError::Timeout) => {
                                    if !running.load(Ordering::SeqCst) {
                                        break;
                                    }
                                }
                                Err(crossbeam_channel::RecvTimeoutError::Disconnected) => break,
                            }
                        }

                        debug!(log, "worker stopped"; "context" => "dispatch");
                    })
                    .expect("Worker thread spawn failed")
            })
            .collect();

        Dispatcher {
            inbound_tx,
            workers,
            running,
        }
    }

    #[inline]
    pub fn sender(&self) -> Sender<Inbound> {
        self.inbound_tx.clone()
    }

    /// Stops the workers after the queue drains.
    pub fn shutdown(self) {
        self.running.store(false, Ordering::SeqCst);
        drop(self.inbound_tx);

        for worker in self.workers {
            drop(worker.join());
        }
    }
}
