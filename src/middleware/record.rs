//! The access log record and its one-line rendering.

use std::collections::BTreeMap;
use std::fmt;
use std::sync::Arc;
use std::time::Duration;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::request::Request;

/// Everything the access log knows about one request.
///
/// Request fields are filled by [`from_request`](Self::from_request) on the
/// way in. `timestamp`, `status_code`, `body_size` and `latency` stay at
/// their zero values until [`complete`](Self::complete) runs on the way out.
#[derive(Clone, Debug, Default, Deserialize, PartialEq, Serialize)]
pub struct LogRecord {
    /// Completion time.
    pub timestamp: DateTime<Utc>,
    pub method: String,
    pub path: String,
    pub query: String,
    pub proto: String,
    pub content_length: u64,
    pub host: String,
    pub remote_addr: String,
    pub request_uri: String,
    pub referer: String,
    pub user_agent: String,
    pub client_ip: String,
    pub content_type: String,
    pub handler_name: String,
    pub status_code: u16,
    /// Response body bytes.
    pub body_size: usize,
    /// Seconds between entry and completion.
    pub latency: f64,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub context_keys: Option<BTreeMap<String, Value>>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub request_body: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub response_body: Option<String>,
}

impl LogRecord {
    pub fn from_request(req: &Request) -> Self {
        Self {
            method: req.method().to_string(),
            path: req.path().to_owned(),
            query: req.raw_query().to_owned(),
            proto: req.proto().to_owned(),
            content_length: req.content_length(),
            host: req.host().to_owned(),
            remote_addr: req.remote_addr().map(|a| a.to_string()).unwrap_or_default(),
            request_uri: req.request_uri().to_owned(),
            referer: req.referer().to_owned(),
            user_agent: req.user_agent().to_owned(),
            client_ip: req.client_ip(),
            content_type: req.content_type().to_owned(),
            handler_name: req.handler_name().to_owned(),
            ..Self::default()
        }
    }

    pub fn complete(&mut self, status: u16, body_size: usize, latency: Duration, at: DateTime<Utc>) {
        self.status_code = status;
        self.body_size = body_size;
        self.latency = latency.as_secs_f64();
        self.timestamp = at;
    }
}

/// Renders a [`LogRecord`] as the human-readable message of the log line.
#[derive(Clone)]
pub struct Formatter(Arc<dyn Fn(&LogRecord) -> String + Send + Sync>);

impl Formatter {
    pub fn new(f: impl Fn(&LogRecord) -> String + Send + Sync + 'static) -> Self {
        Self(Arc::new(f))
    }

    pub fn format(&self, record: &LogRecord) -> String {
        (self.0)(record)
    }
}

impl Default for Formatter {
    fn default() -> Self { Self::new(default_format) }
}

impl fmt::Debug for Formatter {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str("Formatter")
    }
}

/// `timestamp|client_ip|method|host+uri|handler|status|latency`
///
/// ```text
/// 2024-05-01 12:00:00.123456789|203.0.113.7|GET|api.example.com/users?page=2|list_users|200|0.000412
/// ```
pub fn default_format(r: &LogRecord) -> String {
    format!(
        "{}|{}|{}|{}{}|{}|{}|{:.6}",
        r.timestamp.format("%Y-%m-%d %H:%M:%S%.f"),
        r.client_ip,
        r.method,
        r.host,
        r.request_uri,
        short_handler_name(&r.handler_name),
        r.status_code,
        r.latency,
    )
}

fn short_handler_name(name: &str) -> &str {
    name.rsplit("::").next().unwrap_or(name)
}

#[cfg(test)]
mod tests {
    use chrono::TimeZone;

    use super::*;

    fn record() -> LogRecord {
        let mut record = LogRecord {
            method: "GET".into(),
            path: "/users".into(),
            query: "page=2".into(),
            proto: "HTTP/1.1".into(),
            host: "api.example.com".into(),
            request_uri: "/users?page=2".into(),
            client_ip: "203.0.113.7".into(),
            handler_name: "app::handlers::list_users".into(),
            ..LogRecord::default()
        };
        let at = Utc.with_ymd_and_hms(2024, 5, 1, 12, 0, 0).unwrap();
        record.complete(200, 2, Duration::from_millis(250), at);
        record
    }

    #[test]
    fn default_format_is_pipe_delimited() {
        assert_eq!(
            default_format(&record()),
            "2024-05-01 12:00:00|203.0.113.7|GET|api.example.com/users?page=2|list_users|200|0.250000",
        );
    }

    #[test]
    fn short_handler_name_keeps_last_segment() {
        assert_eq!(short_handler_name("app::handlers::list_users"), "list_users");
        assert_eq!(short_handler_name("main"), "main");
        assert_eq!(short_handler_name(""), "");
    }

    #[test]
    fn json_round_trip_preserves_fields() {
        let mut original = record();
        original.context_keys = Some(BTreeMap::from([("user".to_owned(), Value::from("alice"))]));
        original.request_body = Some(r#"{"k":"v"}"#.into());
        original.response_body = Some("[]".into());

        let json = serde_json::to_string(&original).unwrap();
        let parsed: LogRecord = serde_json::from_str(&json).unwrap();
        assert_eq!(parsed, original);
    }

    #[test]
    fn unset_optional_fields_are_absent() {
        let json = serde_json::to_value(record()).unwrap();
        let object = json.as_object().unwrap();

        for key in ["context_keys", "request_body", "response_body"] {
            assert!(!object.contains_key(key), "{key} should be absent");
        }
        assert_eq!(object["status_code"], 200);
        assert_eq!(object["body_size"], 2);
    }
}
