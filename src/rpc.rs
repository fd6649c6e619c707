//! Caller-side RPC machinery: correlation ids, the pending-call table, and
//! the uniform result envelopes. The driver completes slots from inbound
//! RPC_RESPONSE/RPC_ERROR frames; callers park on a slot until completion,
//! deadline, or connection loss.

use crate::error::{code, Error, Result};
use crate::payload::{self, map};
use hashbrown::HashMap;
use rmpv::Value;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Condvar, Mutex};
use std::time::{Duration, Instant};

/// Terminal result of a pending call.
#[derive(Debug, Clone)]
pub enum RpcOutcome {
    /// RPC_RESPONSE arrived; carries the `result` value.
    Response(Value),
    /// RPC_ERROR arrived.
    Fault {
        code: i64,
        message: String,
        details: Option<Value>,
    },
    /// The connection died with the call in flight.
    Lost,
}

/// One-shot completion slot. The first writer wins; later completions for
/// the same call (e.g. a response racing a teardown) are dropped.
pub struct CallSlot {
    state: Mutex<Option<RpcOutcome>>,
    cond: Condvar,
}

impl CallSlot {
    fn new() -> CallSlot {
        CallSlot {
            state: Mutex::new(None),
            cond: Condvar::new(),
        }
    }

    pub fn complete(&self, outcome: RpcOutcome) {
        let mut state = self.state.lock().expect("Call slot lock poisoned");

        if state.is_none() {
            *state = Some(outcome);
            self.cond.notify_all();
        }
    }

    /// Blocks until the slot completes or the timeout lapses.
    pub fn wait(&self, timeout: Duration) -> Option<RpcOutcome> {
        let deadline = Instant::now() + timeout;
        let mut state = self.state.lock().expect("Call slot lock poisoned");

        loop {
            if let Some(outcome) = state.take() {
                return Some(outcome);
            }

            let now = Instant::now();
            if now >= deadline {
                return None;
            }

            let (guard, _) = self
                .cond
                .wait_timeout(state, deadline - now)
                .expect("Call slot lock poisoned");
            state = guard;
        }
    }
}

/// Correlation → completion slot table for calls in flight on one
/// connection.
pub struct PendingCalls {
    slots: Mutex<HashMap<u64, Arc<CallSlot>>>,
}

impl PendingCalls {
    pub fn new() -> PendingCalls {
        PendingCalls {
            slots: Mutex::new(HashMap::new()),
        }
    }

    pub fn register(&self, correlation: u64) -> Arc<CallSlot> {
        let slot = Arc::new(CallSlot::new());

        self.slots
            .lock()
            .expect("Pending table lock poisoned")
            .insert(correlation, slot.clone());

        slot
    }

    pub fn contains(&self, correlation: u64) -> bool {
        self.slots
            .lock()
            .expect("Pending table lock poisoned")
            .contains_key(&correlation)
    }

    pub fn len(&self) -> usize {
        self.slots.lock().expect("Pending table lock poisoned").len()
    }

    /// Completes and releases the slot for a correlation. Returns false when
    /// no call is pending under that id (late or foreign response).
    pub fn complete(&self, correlation: u64, outcome: RpcOutcome) -> bool {
        let slot = self
            .slots
            .lock()
            .expect("Pending table lock poisoned")
            .remove(&correlation);

        match slot {
            Some(slot) => {
                slot.complete(outcome);
                true
            }
            None => false,
        }
    }

    /// Releases a slot without completing it (caller-side timeout cleanup).
    pub fn release(&self, correlation: u64) {
        self.slots
            .lock()
            .expect("Pending table lock poisoned")
            .remove(&correlation);
    }

    /// Completes every outstanding call with the supplied outcome. Used at
    /// connection teardown.
    pub fn fail_all(&self, outcome: RpcOutcome) {
        let slots: Vec<_> = self
            .slots
            .lock()
            .expect("Pending table lock poisoned")
            .drain()
            .collect();

        for (_, slot) in slots {
            slot.complete(outcome.clone());
        }
    }
}

/// Per-connection correlation id source. Ids are non-zero and never collide
/// with a call still in flight; zero stays reserved for unsolicited frames.
pub struct CorrelationAllocator {
    next: AtomicU64,
}

impl CorrelationAllocator {
    pub fn new() -> CorrelationAllocator {
        CorrelationAllocator {
            next: AtomicU64::new(1),
        }
    }

    pub fn allocate(&self, pending: &PendingCalls) -> u64 {
        loop {
            let id = self.next.fetch_add(1, Ordering::Relaxed);

            if id != 0 && !pending.contains(id) {
                return id;
            }
        }
    }
}

/// `{method, params}` request payload.
pub fn request_payload(method: &str, params: Value) -> Value {
    map(vec![
        ("method", Value::String(method.into())),
        ("params", params),
    ])
}

/// `{success: true, result}` wire payload.
pub fn response_payload(result: Value) -> Value {
    map(vec![("success", Value::Boolean(true)), ("result", result)])
}

/// `{success: false, error, code, details?}` wire payload.
pub fn error_payload(code: i64, message: &str, details: Option<Value>) -> Value {
    let mut entries = vec![
        ("success", Value::Boolean(false)),
        ("error", Value::String(message.into())),
        ("code", Value::from(code)),
    ];

    if let Some(details) = details {
        entries.push(("details", details));
    }

    map(entries)
}

/// Interpret an RPC_RESPONSE payload.
pub fn parse_response(value: &Value) -> RpcOutcome {
    match payload::get(value, "result") {
        Some(result) => RpcOutcome::Response(result.clone()),
        None => RpcOutcome::Response(Value::Nil),
    }
}

/// Interpret an RPC_ERROR payload.
pub fn parse_error(value: &Value) -> RpcOutcome {
    RpcOutcome::Fault {
        code: payload::get_i64(value, "code").unwrap_or(code::HANDLER_ERROR),
        message: payload::get_str(value, "error").unwrap_or("remote error").to_string(),
        details: payload::get(value, "details").cloned(),
    }
}

/// Caller-facing success envelope: `{success: true, data, correlation_id}`.
pub fn success_envelope(data: Value, correlation: u64) -> Value {
    map(vec![
        ("success", Value::Boolean(true)),
        ("data", data),
        ("correlation_id", Value::String(correlation.to_string().into())),
    ])
}

/// Caller-facing error envelope.
pub fn error_envelope(code: i64, message: &str, details: Option<Value>, correlation: u64) -> Value {
    let mut entries = vec![
        ("success", Value::Boolean(false)),
        ("error", Value::String(message.into())),
        ("code", Value::from(code)),
    ];

    if let Some(details) = details {
        entries.push(("details", details));
    }
    entries.push(("correlation_id", Value::String(correlation.to_string().into())));

    map(entries)
}

/// Raise-style interpretation of an outcome: faults and losses become
/// errors.
pub fn outcome_to_result(outcome: RpcOutcome) -> Result<Value> {
    match outcome {
        RpcOutcome::Response(value) => Ok(value),
        RpcOutcome::Fault {
            code,
            message,
            details,
        } => Err(Error::Remote {
            code,
            message,
            details,
        }),
        RpcOutcome::Lost => Err(Error::ConnectionLost),
    }
}

/// Envelope-style interpretation of an outcome: faults stay data, only a
/// lost connection is an error.
pub fn outcome_to_envelope(outcome: RpcOutcome, correlation: u64) -> Result<Value> {
    match outcome {
        RpcOutcome::Response(value) => Ok(success_envelope(value, correlation)),
        RpcOutcome::Fault {
            code,
            message,
            details,
        } => Ok(error_envelope(code, &message, details, correlation)),
        RpcOutcome::Lost => Err(Error::ConnectionLost),
    }
}
