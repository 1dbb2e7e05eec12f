//! Trace id resolution.
//!
//! A caller-supplied id (from an upstream service) wins over a locally
//! generated one. The default lookup order is:
//!
//! 1. the trace header on the request,
//! 2. the trace field of a urlencoded form body,
//! 3. the trace query parameter,
//! 4. the id already bound to the request context, generated on demand.
//!
//! The resolved id is written back into the request headers and the
//! response headers, and a logger carrying it is bound to the request
//! context.

use std::fmt;
use std::sync::Arc;

use http::{HeaderName, HeaderValue};
use serde::{Deserialize, Serialize};
use tracing::Instrument;

use super::{BoxFuture, Middleware, Next};
use crate::context::{ErrorKind, RecordedError};
use crate::error::Error;
use crate::logging::Logger;
use crate::request::Request;
use crate::response::ResponseWriter;

const DEFAULT_HEADER: &str = "x-trace-id";
const DEFAULT_PARAM: &str = "trace_id";

/// Where a trace id is looked up and published.
#[derive(Clone, Debug, Deserialize, Eq, PartialEq, Serialize)]
#[serde(default)]
pub struct TraceKeys {
    /// Request and response header name.
    pub header: String,
    /// Form field and query parameter name.
    pub param: String,
}

impl TraceKeys {
    /// The configured header, or `x-trace-id` when it is not a valid name.
    pub fn header_name(&self) -> HeaderName {
        HeaderName::try_from(self.header.as_str())
            .unwrap_or_else(|_| HeaderName::from_static(DEFAULT_HEADER))
    }
}

impl Default for TraceKeys {
    fn default() -> Self {
        Self { header: DEFAULT_HEADER.to_owned(), param: DEFAULT_PARAM.to_owned() }
    }
}

/// Resolves the trace id of a request.
#[derive(Clone)]
pub struct TraceIdFn(Arc<dyn Fn(&Request, &TraceKeys) -> String + Send + Sync>);

impl TraceIdFn {
    pub fn new(f: impl Fn(&Request, &TraceKeys) -> String + Send + Sync + 'static) -> Self {
        Self(Arc::new(f))
    }

    pub fn call(&self, req: &Request, keys: &TraceKeys) -> String {
        (self.0)(req, keys)
    }
}

impl Default for TraceIdFn {
    fn default() -> Self { Self::new(lookup_trace_id) }
}

impl fmt::Debug for TraceIdFn {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str("TraceIdFn")
    }
}

/// An id is usable when it is non-empty and can be echoed as a header.
fn header_value(id: &str) -> Option<HeaderValue> {
    if id.is_empty() {
        return None;
    }
    HeaderValue::try_from(id).ok()
}

/// Default lookup: header, then form, then query, then the context. A
/// source holding an empty or unprintable id is skipped.
pub fn lookup_trace_id(req: &Request, keys: &TraceKeys) -> String {
    let usable = |id: &&str| header_value(id).is_some();
    req.header(&keys.header)
        .filter(usable)
        .or_else(|| req.post_form(&keys.param).filter(usable))
        .map(str::to_owned)
        .or_else(|| req.query(&keys.param).filter(|id| header_value(id).is_some()))
        .unwrap_or_else(|| req.context().trace_id_or_generate())
}

/// Resolves and publishes the trace id, then binds `root.with_trace_id`
/// to the request context. Returns the bound logger.
pub(crate) async fn resolve(
    req: &mut Request,
    writer: &mut dyn ResponseWriter,
    keys: &TraceKeys,
    trace_id: &TraceIdFn,
    root: &Logger,
) -> Logger {
    match req.parse_form().await {
        Ok(()) => {}
        Err(Error::Form(err)) => tracing::debug!(error = %err, "ignoring malformed form body"),
        Err(err) => req.context().record(RecordedError::new(ErrorKind::BodyRead, err.to_string())),
    }

    let mut id = trace_id.call(req, keys);
    let mut value = header_value(&id);
    if value.is_none() {
        tracing::debug!(trace_id = ?id, "unusable trace id, falling back");
        id = req.context().trace_id_or_generate();
        value = header_value(&id);
    }

    if let Some(value) = value {
        let name = keys.header_name();
        req.headers_mut().insert(name.clone(), value.clone());
        writer.headers_mut().insert(name, value);
    }

    let logger = root.with_trace_id(&id);
    req.context().bind(logger.clone(), id);
    logger
}

/// Standalone trace id middleware. [`AccessLog`](super::AccessLog) already
/// resolves the trace id itself; use this one when there is no access log.
#[derive(Clone, Debug)]
pub struct TraceContext {
    keys: TraceKeys,
    trace_id: TraceIdFn,
    root: Logger,
}

impl TraceContext {
    pub fn new() -> Self {
        Self { keys: TraceKeys::default(), trace_id: TraceIdFn::default(), root: Logger::new("http") }
    }

    pub fn keys(mut self, keys: TraceKeys) -> Self {
        self.keys = keys;
        self
    }

    pub fn trace_id(mut self, f: impl Fn(&Request, &TraceKeys) -> String + Send + Sync + 'static) -> Self {
        self.trace_id = TraceIdFn::new(f);
        self
    }

    pub fn logger(mut self, root: Logger) -> Self {
        self.root = root;
        self
    }
}

impl Default for TraceContext {
    fn default() -> Self { Self::new() }
}

impl Middleware for TraceContext {
    fn handle<'a>(
        &'a self,
        mut req: Request,
        writer: &'a mut dyn ResponseWriter,
        next: Next<'a>,
    ) -> BoxFuture<'a, ()> {
        Box::pin(async move {
            let logger = resolve(&mut req, &mut *writer, &self.keys, &self.trace_id, &self.root).await;
            next.run(req, writer).instrument(logger.span().clone()).await;
        })
    }
}
