//! Request-scoped state.
//!
//! Every [`Request`](crate::Request) owns an `Arc<RequestContext>`. Middleware
//! clone the `Arc` before handing the request downstream, so whatever a
//! handler records here is still visible once the handler has returned (or
//! panicked).
//!
//! The context has named slots for the things the middleware layer relies on
//! (trace id, bound logger, recorded errors) and one untyped map, `keys`, that
//! is only ever read back as a debug snapshot for the access log.

use std::collections::BTreeMap;
use std::fmt;
use std::fmt::Write as _;

use parking_lot::Mutex;
use serde::Serialize;
use serde_json::Value;

use crate::logging::Logger;
use crate::response::ResponseWriter;

/// Access-log exit step parked by the access logger when downstream panics.
/// The recovery middleware runs it once the response has been forced to 500.
pub(crate) type DeferredExit = Box<dyn FnOnce(&RequestContext, &dyn ResponseWriter) + Send>;

/// Where a [`RecordedError`] came from.
#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub enum ErrorKind {
    /// Attached by handler code through [`RequestContext::record_error`].
    Handler,
    /// The request body could not be read in full.
    BodyRead,
    /// A panic caused by a severed client connection.
    BrokenPipe,
    /// Any other panic.
    Panic,
}

/// An error attached to a request. Advisory only: it changes the access log
/// severity and content, never the control flow.
#[derive(Clone, Debug, Eq, PartialEq)]
pub struct RecordedError {
    kind: ErrorKind,
    message: String,
}

impl RecordedError {
    pub fn new(kind: ErrorKind, message: impl Into<String>) -> Self {
        Self { kind, message: message.into() }
    }

    pub fn kind(&self) -> ErrorKind { self.kind }
    pub fn message(&self) -> &str { &self.message }
}

impl fmt::Display for RecordedError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.message)
    }
}

/// Typed key/value store that lives exactly as long as one request.
#[derive(Default)]
pub struct RequestContext {
    state: Mutex<State>,
}

#[derive(Default)]
struct State {
    trace_id: Option<String>,
    logger: Option<Logger>,
    errors: Vec<RecordedError>,
    keys: BTreeMap<String, Value>,
    deferred: Option<DeferredExit>,
}

impl RequestContext {
    pub fn new() -> Self {
        Self::default()
    }

    /// The trace id bound to this request, if one has been resolved yet.
    pub fn trace_id(&self) -> Option<String> {
        self.state.lock().trace_id.clone()
    }

    /// Returns the bound trace id, generating and binding a UUID v4 first
    /// when there is none.
    pub fn trace_id_or_generate(&self) -> String {
        self.state
            .lock()
            .trace_id
            .get_or_insert_with(|| uuid::Uuid::new_v4().to_string())
            .clone()
    }

    pub(crate) fn bind(&self, logger: Logger, trace_id: String) {
        let mut state = self.state.lock();
        state.logger = Some(logger);
        state.trace_id = Some(trace_id);
    }

    /// The request logger bound by the trace middleware. Its span carries
    /// the trace id, so events logged through it correlate with the access
    /// log line.
    pub fn logger(&self) -> Option<Logger> {
        self.state.lock().logger.clone()
    }

    /// Attaches an error to the request. The access log switches to ERROR
    /// severity and prints every recorded error under `context_errors`.
    pub fn record_error(&self, err: impl fmt::Display) {
        self.record(RecordedError::new(ErrorKind::Handler, err.to_string()));
    }

    pub fn record(&self, err: RecordedError) {
        self.state.lock().errors.push(err);
    }

    pub fn errors(&self) -> Vec<RecordedError> {
        self.state.lock().errors.clone()
    }

    pub fn has_errors(&self) -> bool {
        !self.state.lock().errors.is_empty()
    }

    /// All recorded errors joined into one string, `None` when there are
    /// none.
    ///
    /// ```text
    /// Error #01: first
    /// Error #02: second
    /// ```
    pub fn errors_string(&self) -> Option<String> {
        let state = self.state.lock();
        if state.errors.is_empty() {
            return None;
        }
        let mut out = String::new();
        for (i, err) in state.errors.iter().enumerate() {
            let _ = writeln!(out, "Error #{:02}: {}", i + 1, err);
        }
        Some(out)
    }

    /// Stores a value under `key` for the access log's context-keys snapshot.
    pub fn set(&self, key: impl Into<String>, value: impl Serialize) -> Result<(), serde_json::Error> {
        let value = serde_json::to_value(value)?;
        self.state.lock().keys.insert(key.into(), value);
        Ok(())
    }

    pub fn get(&self, key: &str) -> Option<Value> {
        self.state.lock().keys.get(key).cloned()
    }

    /// Copy of every key set on this request.
    pub fn keys(&self) -> BTreeMap<String, Value> {
        self.state.lock().keys.clone()
    }

    pub(crate) fn defer_exit(&self, exit: DeferredExit) {
        self.state.lock().deferred = Some(exit);
    }

    pub(crate) fn take_deferred_exit(&self) -> Option<DeferredExit> {
        self.state.lock().deferred.take()
    }
}

impl fmt::Debug for RequestContext {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let state = self.state.lock();
        f.debug_struct("RequestContext")
            .field("trace_id", &state.trace_id)
            .field("errors", &state.errors)
            .field("keys", &state.keys)
            .finish_non_exhaustive()
    }
}
