//! Named loggers on top of `tracing`.
//!
//! A [`Logger`] is a dotted name (`http`, `http.access`,
//! `http.access.details`) plus the span its events are emitted in. Binding a
//! trace id opens a `request` span carrying `trace_id`; every event logged
//! through that logger, or inside that span, is correlated by it.

use std::sync::Arc;

use tracing::Span;
use tracing_subscriber::EnvFilter;

use crate::error::BoxError;

/// Severity of an emitted line.
#[derive(Clone, Copy, Debug, Eq, Hash, Ord, PartialEq, PartialOrd)]
pub enum Severity {
    Info,
    Warn,
    Error,
}

/// Structured fields attached to an access log event. `None` fields are not
/// recorded at all.
#[derive(Clone, Copy, Debug, Default)]
pub struct Fields<'a> {
    pub context_errors: Option<&'a str>,
    pub details: Option<&'a str>,
    pub request: Option<&'a str>,
}

/// Cheap-to-clone named logger.
#[derive(Clone, Debug)]
pub struct Logger {
    name: Arc<str>,
    span: Span,
}

impl Logger {
    pub fn new(name: &str) -> Self {
        Self { name: name.into(), span: Span::none() }
    }

    /// Child logger named `<self>.<child>`, sharing the same span.
    pub fn named(&self, child: &str) -> Self {
        let name = if self.name.is_empty() {
            child.into()
        } else {
            format!("{}.{child}", self.name).into()
        };
        Self { name, span: self.span.clone() }
    }

    /// Child logger whose events are emitted inside a `request` span
    /// carrying `trace_id`.
    pub fn with_trace_id(&self, trace_id: &str) -> Self {
        let span = self
            .span
            .in_scope(|| tracing::info_span!("request", logger = %self.name, trace_id = %trace_id));
        Self { name: Arc::clone(&self.name), span }
    }

    pub fn name(&self) -> &str { &self.name }
    pub fn span(&self) -> &Span { &self.span }

    pub fn info(&self, message: &str) {
        self.log(Severity::Info, &Fields::default(), message);
    }

    pub fn warn(&self, message: &str) {
        self.log(Severity::Warn, &Fields::default(), message);
    }

    pub fn error(&self, message: &str) {
        self.log(Severity::Error, &Fields::default(), message);
    }

    pub fn log(&self, severity: Severity, fields: &Fields<'_>, message: &str) {
        let logger: &str = &self.name;
        let Fields { context_errors, details, request } = *fields;
        self.span.in_scope(|| match severity {
            Severity::Info => tracing::info!(logger, context_errors, details, request, "{message}"),
            Severity::Warn => tracing::warn!(logger, context_errors, details, request, "{message}"),
            Severity::Error => tracing::error!(logger, context_errors, details, request, "{message}"),
        });
    }
}

/// Installs a global `tracing` subscriber.
///
/// The filter comes from `RUST_LOG` (default `info`). `LOG_FORMAT=json`
/// switches to one JSON object per line, which is what log shippers expect.
pub fn init() -> Result<(), BoxError> {
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"));
    let builder = tracing_subscriber::fmt().with_env_filter(filter);

    match std::env::var("LOG_FORMAT").as_deref() {
        Ok("json") => builder.json().try_init(),
        _ => builder.try_init(),
    }
}
