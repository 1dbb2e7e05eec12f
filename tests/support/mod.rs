//! Test helpers: a `tracing` layer that keeps every event, and request
//! builders.

#![allow(dead_code)]

use std::collections::HashMap;
use std::fmt;
use std::io;
use std::net::SocketAddr;
use std::sync::{Arc, Mutex};

use bytes::Bytes;
use http_body_util::{Full, StreamBody};
use hyper::body::Frame;
use tracing::field::{Field, Visit};
use tracing::span::{Attributes, Id};
use tracing::subscriber::DefaultGuard;
use tracing::{Event, Level, Subscriber};
use tracing_subscriber::layer::{Context, Layer, SubscriberExt};
use tracing_subscriber::registry::LookupSpan;
use tsu_access::Request;

/// One captured event.
#[derive(Clone, Debug)]
pub struct Line {
    pub level: Level,
    pub fields: HashMap<String, String>,
    /// Fields of every enclosing span, outermost first.
    pub span_fields: HashMap<String, String>,
}

impl Line {
    pub fn field(&self, name: &str) -> Option<&str> {
        self.fields.get(name).map(String::as_str)
    }

    pub fn logger(&self) -> &str {
        self.field("logger").unwrap_or_default()
    }

    pub fn message(&self) -> &str {
        self.field("message").unwrap_or_default()
    }

    pub fn trace_id(&self) -> Option<&str> {
        self.span_fields.get("trace_id").map(String::as_str)
    }

    pub fn details(&self) -> Option<serde_json::Value> {
        self.field("details").map(|d| serde_json::from_str(d).expect("details is JSON"))
    }
}

#[derive(Default)]
struct FieldMap(HashMap<String, String>);

impl Visit for FieldMap {
    fn record_str(&mut self, field: &Field, value: &str) {
        self.0.insert(field.name().to_owned(), value.to_owned());
    }

    fn record_debug(&mut self, field: &Field, value: &dyn fmt::Debug) {
        self.0.insert(field.name().to_owned(), format!("{value:?}"));
    }
}

#[derive(Clone, Default)]
pub struct Captured(Arc<Mutex<Vec<Line>>>);

impl Captured {
    pub fn lines(&self) -> Vec<Line> {
        self.0.lock().unwrap().clone()
    }

    /// Lines written by the access log.
    pub fn access_lines(&self) -> Vec<Line> {
        self.lines().into_iter().filter(|l| l.logger().starts_with("http.access")).collect()
    }

    pub fn clear(&self) {
        self.0.lock().unwrap().clear();
    }
}

impl<S> Layer<S> for Captured
where
    S: Subscriber + for<'a> LookupSpan<'a>,
{
    fn on_new_span(&self, attrs: &Attributes<'_>, id: &Id, ctx: Context<'_, S>) {
        let mut fields = FieldMap::default();
        attrs.record(&mut fields);
        if let Some(span) = ctx.span(id) {
            span.extensions_mut().insert(fields);
        }
    }

    fn on_event(&self, event: &Event<'_>, ctx: Context<'_, S>) {
        let mut fields = FieldMap::default();
        event.record(&mut fields);

        let mut span_fields = HashMap::new();
        if let Some(scope) = ctx.event_scope(event) {
            for span in scope.from_root() {
                if let Some(map) = span.extensions().get::<FieldMap>() {
                    span_fields.extend(map.0.clone());
                }
            }
        }

        self.0.lock().unwrap().push(Line { level: *event.metadata().level(), fields: fields.0, span_fields });
    }
}

/// Captures events on the current thread until the guard drops.
pub fn capture() -> (Captured, DefaultGuard) {
    let captured = Captured::default();
    let subscriber = tracing_subscriber::registry().with(captured.clone());
    (captured, tracing::subscriber::set_default(subscriber))
}

pub fn peer() -> SocketAddr {
    SocketAddr::from(([192, 0, 2, 10], 50123))
}

pub fn request(builder: http::request::Builder, body: &'static str) -> Request {
    let req = builder.body(Full::new(Bytes::from_static(body.as_bytes()))).unwrap();
    Request::from_http(req, Some(peer()))
}

pub fn get(uri: &str) -> Request {
    request(http::Request::builder().uri(uri).header("host", "api.test"), "")
}

/// A request whose body stream fails on its first frame, like a client
/// that resets the connection mid-upload.
pub fn failing_body(builder: http::request::Builder) -> Request {
    let frames = futures_util::stream::iter(vec![Err::<Frame<Bytes>, _>(io::Error::other("connection reset"))]);
    let req = builder.body(StreamBody::new(frames)).unwrap();
    Request::from_http(req, Some(peer()))
}
