//! Access log middleware.
//!
//! One log line per request, emitted once the response is final:
//!
//! | Outcome                          | Severity |
//! |----------------------------------|----------|
//! | status ≥ 500                     | ERROR, details and a request dump always attached |
//! | 4xx, no recorded errors          | WARN     |
//! | 4xx with recorded errors         | ERROR    |
//! | < 400 with recorded errors       | ERROR    |
//! | anything else                    | INFO     |
//!
//! Handlers don't need to log their own failures: anything recorded with
//! [`RequestContext::record_error`](crate::RequestContext::record_error)
//! shows up under `context_errors` on this line.
//!
//! The request body is buffered on entry and handed downstream as a fresh
//! stream, so a 5xx line can dump the request as it arrived.
//!
//! If the chain below panics, the exit step is parked on the request context
//! and the panic carries on upward. [`Recovery`](super::Recovery) records the
//! panic, forces the 500 and then runs the parked step, so the line still
//! gets written with the final status and the panic in `context_errors`.

use std::collections::HashSet;
use std::panic::{self, AssertUnwindSafe};
use std::sync::Arc;
use std::time::Instant;

use bytes::Bytes;
use chrono::Utc;
use futures_util::FutureExt;
use serde::Deserialize;
use tracing::Instrument;

use super::capture::BodyCapture;
use super::record::{Formatter, LogRecord};
use super::trace::{self, TraceIdFn, TraceKeys};
use super::{BoxFuture, Middleware, Next};
use crate::context::{ErrorKind, RecordedError, RequestContext};
use crate::logging::{Fields, Logger, Severity};
use crate::request::{Request, RequestHead};
use crate::response::ResponseWriter;

/// Access log options.
///
/// Deserializable from any serde format; the formatter and trace id
/// function can only be set in code and default to
/// [`default_format`](super::default_format) and
/// [`lookup_trace_id`](super::lookup_trace_id).
///
/// ```rust
/// use tsu_access::middleware::AccessLogConfig;
///
/// let config = AccessLogConfig::default()
///     .skip_path("/healthz")
///     .details_with_body(true)
///     .formatter(|r| format!("{} {} {}", r.status_code, r.method, r.request_uri));
/// ```
#[derive(Clone, Debug, Deserialize)]
#[serde(default)]
pub struct AccessLogConfig {
    #[serde(skip)]
    formatter: Formatter,
    skip_paths: HashSet<String>,
    disable_details: bool,
    details_with_context_keys: bool,
    details_with_body: bool,
    #[serde(skip)]
    trace_id: TraceIdFn,
    trace_keys: TraceKeys,
    logger_name: String,
}

impl Default for AccessLogConfig {
    fn default() -> Self {
        Self {
            formatter: Formatter::default(),
            skip_paths: HashSet::new(),
            disable_details: false,
            details_with_context_keys: false,
            details_with_body: false,
            trace_id: TraceIdFn::default(),
            trace_keys: TraceKeys::default(),
            logger_name: "http".to_owned(),
        }
    }
}

impl AccessLogConfig {
    pub fn formatter(mut self, f: impl Fn(&LogRecord) -> String + Send + Sync + 'static) -> Self {
        self.formatter = Formatter::new(f);
        self
    }

    /// No line is written for requests to `path`.
    pub fn skip_path(mut self, path: impl Into<String>) -> Self {
        self.skip_paths.insert(path.into());
        self
    }

    pub fn skip_paths<I, S>(mut self, paths: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.skip_paths.extend(paths.into_iter().map(Into::into));
        self
    }

    /// Drops the `details` field from non-5xx lines.
    pub fn disable_details(mut self, disable: bool) -> Self {
        self.disable_details = disable;
        self
    }

    /// Adds the request context keys to `details`.
    pub fn details_with_context_keys(mut self, enable: bool) -> Self {
        self.details_with_context_keys = enable;
        self
    }

    /// Adds request and response bodies to `details`. The response body is
    /// copied as it is written: meant for debugging, not for production
    /// traffic.
    pub fn details_with_body(mut self, enable: bool) -> Self {
        self.details_with_body = enable;
        self
    }

    pub fn trace_id(mut self, f: impl Fn(&Request, &TraceKeys) -> String + Send + Sync + 'static) -> Self {
        self.trace_id = TraceIdFn::new(f);
        self
    }

    pub fn trace_keys(mut self, keys: TraceKeys) -> Self {
        self.trace_keys = keys;
        self
    }

    /// Root logger name; lines are logged as `<name>.access[.details]`.
    pub fn logger_name(mut self, name: impl Into<String>) -> Self {
        self.logger_name = name.into();
        self
    }

    fn captures_body(&self) -> bool {
        !self.disable_details && self.details_with_body
    }

    fn captures_context_keys(&self) -> bool {
        !self.disable_details && self.details_with_context_keys
    }
}

/// Severity for a finished request.
fn severity(status: u16, has_errors: bool) -> Severity {
    match status {
        500.. => Severity::Error,
        400..=499 if has_errors => Severity::Error,
        400..=499 => Severity::Warn,
        _ if has_errors => Severity::Error,
        _ => Severity::Info,
    }
}

/// The access log middleware.
#[derive(Clone, Debug)]
pub struct AccessLog {
    config: Arc<AccessLogConfig>,
    root: Logger,
}

impl AccessLog {
    pub fn new(config: AccessLogConfig) -> Self {
        let root = Logger::new(&config.logger_name);
        Self { config: Arc::new(config), root }
    }
}

impl Default for AccessLog {
    fn default() -> Self { Self::new(AccessLogConfig::default()) }
}

impl Middleware for AccessLog {
    fn handle<'a>(
        &'a self,
        mut req: Request,
        writer: &'a mut dyn ResponseWriter,
        next: Next<'a>,
    ) -> BoxFuture<'a, ()> {
        Box::pin(async move {
            let config = &self.config;
            let logger = trace::resolve(&mut req, &mut *writer, &config.trace_keys, &config.trace_id, &self.root).await;

            let ctx = Arc::clone(req.context());
            let start = Instant::now();
            let mut record = LogRecord::from_request(&req);

            let capture = config.captures_body();
            match req.buffer_body().await {
                Ok(bytes) if capture => {
                    record.request_body = Some(String::from_utf8_lossy(&bytes).into_owned());
                }
                Ok(_) => {}
                Err(err) => ctx.record(RecordedError::new(ErrorKind::BodyRead, err.to_string())),
            }
            let head = req.head();

            let span = logger.span().clone();
            let (outcome, response_body) = if capture {
                let mut capturing = BodyCapture::new(&mut *writer);
                let outcome = AssertUnwindSafe(next.run(req, &mut capturing).instrument(span))
                    .catch_unwind()
                    .await;
                (outcome, Some(capturing.into_body()))
            } else {
                let outcome = AssertUnwindSafe(next.run(req, &mut *writer).instrument(span))
                    .catch_unwind()
                    .await;
                (outcome, None)
            };

            let exit = Exit {
                config: Arc::clone(config),
                logger,
                record,
                head,
                start,
                response_body,
            };
            match outcome {
                Ok(()) => exit.finish(&ctx, &*writer),
                Err(payload) => {
                    ctx.defer_exit(Box::new(move |ctx: &RequestContext, writer: &dyn ResponseWriter| {
                        exit.finish(ctx, writer)
                    }));
                    panic::resume_unwind(payload)
                }
            }
        })
    }
}

/// State carried from entry to exit.
struct Exit {
    config: Arc<AccessLogConfig>,
    logger: Logger,
    record: LogRecord,
    head: RequestHead,
    start: Instant,
    response_body: Option<Bytes>,
}

impl Exit {
    fn finish(self, ctx: &RequestContext, writer: &dyn ResponseWriter) {
        let Self { config, logger, mut record, head, start, response_body } = self;
        if config.skip_paths.contains(&record.path) {
            return;
        }

        let status = writer.status().as_u16();
        record.complete(status, writer.size(), start.elapsed(), Utc::now());
        if config.captures_context_keys() {
            record.context_keys = Some(ctx.keys());
        }
        if config.captures_body() {
            record.response_body = response_body.map(|body| String::from_utf8_lossy(&body).into_owned());
        }

        let errors = ctx.errors_string();
        let level = severity(status, errors.is_some());
        let message = config.formatter.format(&record);

        let server_error = status >= 500;
        let details = (server_error || !config.disable_details)
            .then(|| serde_json::to_string(&record).ok())
            .flatten();
        let request = server_error.then(|| head.dump());

        let access = logger.named("access");
        let logger = if details.is_some() { access.named("details") } else { access };
        let fields = Fields {
            context_errors: errors.as_deref(),
            details: details.as_deref(),
            request: request.as_deref(),
        };
        logger.log(level, &fields, &message);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn severity_follows_status_and_errors() {
        assert_eq!(severity(200, false), Severity::Info);
        assert_eq!(severity(302, false), Severity::Info);
        assert_eq!(severity(200, true), Severity::Error);
        assert_eq!(severity(404, false), Severity::Warn);
        assert_eq!(severity(404, true), Severity::Error);
        assert_eq!(severity(500, false), Severity::Error);
        assert_eq!(severity(503, false), Severity::Error);
    }

    #[test]
    fn config_deserializes_with_defaults() {
        let config: AccessLogConfig = serde_json::from_str(
            r#"{"skip_paths": ["/healthz", "/readyz"], "details_with_body": true}"#,
        )
        .unwrap();

        assert!(config.skip_paths.contains("/readyz"));
        assert!(config.captures_body());
        assert!(!config.captures_context_keys());
        assert_eq!(config.logger_name, "http");
        assert_eq!(config.trace_keys, TraceKeys::default());
    }

    #[test]
    fn disabling_details_disables_captures() {
        let config = AccessLogConfig::default()
            .details_with_body(true)
            .details_with_context_keys(true)
            .disable_details(true);
        assert!(!config.captures_body());
        assert!(!config.captures_context_keys());
    }
}
