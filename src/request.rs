//! Incoming HTTP request type.

use std::collections::HashMap;
use std::fmt;
use std::fmt::Write as _;
use std::net::SocketAddr;
use std::sync::Arc;

use bytes::Bytes;
use http::header::{CONTENT_LENGTH, CONTENT_TYPE, HOST, REFERER, USER_AGENT};
use http::{HeaderMap, Method, Uri, Version};
use http_body_util::combinators::UnsyncBoxBody;
use http_body_util::{BodyExt, Full};
use hyper::body::Body as HttpBody;

use crate::context::RequestContext;
use crate::error::{BoxError, Error};

const FORM_URLENCODED: &str = "application/x-www-form-urlencoded";

// ── Body ─────────────────────────────────────────────────────────────────────

/// A request body stream. It can be read once; [`Request::replace_body`]
/// puts a fresh one back.
pub struct Body(UnsyncBoxBody<Bytes, BoxError>);

impl Body {
    pub fn new<B>(body: B) -> Self
    where
        B: HttpBody<Data = Bytes> + Send + 'static,
        B::Error: Into<BoxError>,
    {
        Self(body.map_err(Into::<BoxError>::into).boxed_unsync())
    }

    pub fn empty() -> Self {
        Self::from(Bytes::new())
    }

    /// Exact length, when the stream knows it up front.
    pub fn exact_len(&self) -> Option<u64> {
        self.0.size_hint().exact()
    }

    /// Reads the whole stream into memory.
    pub async fn collect(self) -> Result<Bytes, Error> {
        let collected = BodyExt::collect(self.0).await.map_err(Error::Body)?;
        Ok(collected.to_bytes())
    }
}

impl Default for Body {
    fn default() -> Self { Self::empty() }
}

impl From<Bytes> for Body {
    fn from(bytes: Bytes) -> Self {
        Self(Full::new(bytes).map_err(|never| match never {}).boxed_unsync())
    }
}

impl From<&'static str> for Body {
    fn from(s: &'static str) -> Self { Self::from(Bytes::from_static(s.as_bytes())) }
}

impl From<String> for Body {
    fn from(s: String) -> Self { Self::from(Bytes::from(s)) }
}

impl From<Vec<u8>> for Body {
    fn from(v: Vec<u8>) -> Self { Self::from(Bytes::from(v)) }
}

impl fmt::Debug for Body {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Body").field("exact_len", &self.exact_len()).finish()
    }
}

// ── Request ──────────────────────────────────────────────────────────────────

/// An incoming HTTP request.
#[derive(Debug)]
pub struct Request {
    method: Method,
    uri: Uri,
    version: Version,
    headers: HeaderMap,
    body: Body,
    params: HashMap<String, String>,
    remote_addr: Option<SocketAddr>,
    handler_name: &'static str,
    form: Option<Vec<(String, String)>>,
    /// Inbound body bytes, once something has read and put them back.
    buffered: Option<Bytes>,
    context: Arc<RequestContext>,
}

impl Request {
    /// Builds a request from an `http::Request`. The server passes hyper's
    /// incoming body here; tests pass any `http_body::Body`.
    pub fn from_http<B>(req: http::Request<B>, remote_addr: Option<SocketAddr>) -> Self
    where
        B: HttpBody<Data = Bytes> + Send + 'static,
        B::Error: Into<BoxError>,
    {
        let (parts, body) = req.into_parts();
        Self {
            method: parts.method,
            uri: parts.uri,
            version: parts.version,
            headers: parts.headers,
            body: Body::new(body),
            params: HashMap::new(),
            remote_addr,
            handler_name: "",
            form: None,
            buffered: None,
            context: Arc::new(RequestContext::new()),
        }
    }

    pub(crate) fn set_route(&mut self, handler_name: &'static str, params: HashMap<String, String>) {
        self.handler_name = handler_name;
        self.params = params;
    }

    pub fn method(&self) -> &Method { &self.method }
    pub fn uri(&self) -> &Uri { &self.uri }
    pub fn path(&self) -> &str { self.uri.path() }
    pub fn version(&self) -> Version { self.version }
    pub fn headers(&self) -> &HeaderMap { &self.headers }
    pub fn headers_mut(&mut self) -> &mut HeaderMap { &mut self.headers }
    pub fn remote_addr(&self) -> Option<SocketAddr> { self.remote_addr }
    pub fn context(&self) -> &Arc<RequestContext> { &self.context }

    /// Type name of the matched handler, empty when no route matched.
    pub fn handler_name(&self) -> &'static str { self.handler_name }

    /// Raw query string without the leading `?`.
    pub fn raw_query(&self) -> &str {
        self.uri.query().unwrap_or("")
    }

    /// Protocol as written on the request line, e.g. `HTTP/1.1`.
    pub fn proto(&self) -> &'static str {
        [
            (Version::HTTP_09, "HTTP/0.9"),
            (Version::HTTP_10, "HTTP/1.0"),
            (Version::HTTP_2, "HTTP/2.0"),
            (Version::HTTP_3, "HTTP/3.0"),
        ]
        .into_iter()
        .find_map(|(version, proto)| (version == self.version).then_some(proto))
        .unwrap_or("HTTP/1.1")
    }

    /// Path plus query, as sent by the client.
    pub fn request_uri(&self) -> &str {
        self.uri.path_and_query().map_or("/", |pq| pq.as_str())
    }

    /// Case-insensitive header lookup. Non-UTF-8 values read as absent.
    pub fn header(&self, name: &str) -> Option<&str> {
        self.headers.get(name).and_then(|v| v.to_str().ok())
    }

    /// `Content-Length` header, else the body's exact length, else 0.
    pub fn content_length(&self) -> u64 {
        self.headers
            .get(CONTENT_LENGTH)
            .and_then(|v| v.to_str().ok())
            .and_then(|v| v.parse().ok())
            .or_else(|| self.body.exact_len())
            .unwrap_or(0)
    }

    /// `Host` header, falling back to the URI authority (HTTP/2).
    pub fn host(&self) -> &str {
        self.headers
            .get(HOST)
            .and_then(|v| v.to_str().ok())
            .or_else(|| self.uri.authority().map(|a| a.as_str()))
            .unwrap_or("")
    }

    pub fn referer(&self) -> &str {
        self.headers.get(REFERER).and_then(|v| v.to_str().ok()).unwrap_or("")
    }

    pub fn user_agent(&self) -> &str {
        self.headers.get(USER_AGENT).and_then(|v| v.to_str().ok()).unwrap_or("")
    }

    /// Media type without parameters: `text/html; charset=utf-8` → `text/html`.
    pub fn content_type(&self) -> &str {
        self.headers
            .get(CONTENT_TYPE)
            .and_then(|v| v.to_str().ok())
            .and_then(|v| v.split(';').next())
            .map_or("", str::trim)
    }

    /// Client address as seen behind a reverse proxy: first
    /// `X-Forwarded-For` hop, then `X-Real-IP`, then the peer address.
    pub fn client_ip(&self) -> String {
        let forwarded = self
            .header("x-forwarded-for")
            .and_then(|v| v.split(',').next())
            .map(str::trim)
            .filter(|v| !v.is_empty());
        let real_ip = self.header("x-real-ip").map(str::trim).filter(|v| !v.is_empty());

        match forwarded.or(real_ip) {
            Some(ip) => ip.to_owned(),
            None => self.remote_addr.map(|a| a.ip().to_string()).unwrap_or_default(),
        }
    }

    /// Returns a named path parameter.
    ///
    /// For a route `/users/{id}`, `req.param("id")` on `/users/42` returns `Some("42")`.
    pub fn param(&self, key: &str) -> Option<&str> {
        self.params.get(key).map(String::as_str)
    }

    /// First query-string value for `key`.
    pub fn query(&self, key: &str) -> Option<String> {
        serde_urlencoded::from_str::<Vec<(String, String)>>(self.raw_query())
            .ok()?
            .into_iter()
            .find_map(|(k, v)| (k == key).then_some(v))
    }

    /// First urlencoded form value for `key`. Only populated after
    /// [`parse_form`](Self::parse_form).
    pub fn post_form(&self, key: &str) -> Option<&str> {
        self.form
            .as_ref()?
            .iter()
            .find_map(|(k, v)| (k == key).then_some(v.as_str()))
    }

    /// Parses an `application/x-www-form-urlencoded` body so
    /// [`post_form`](Self::post_form) can see it. The body stream is put
    /// back, so handlers still read the full bytes. Other content types leave
    /// the body untouched.
    pub async fn parse_form(&mut self) -> Result<(), Error> {
        if self.form.is_some() {
            return Ok(());
        }
        self.form = Some(Vec::new());
        if self.content_type() != FORM_URLENCODED {
            return Ok(());
        }
        let bytes = self.buffer_body().await?;
        self.form = Some(serde_urlencoded::from_bytes(&bytes)?);
        Ok(())
    }

    /// Reads the whole body into memory and puts an identical stream back.
    /// Later calls return the same bytes without touching the stream.
    ///
    /// On a read error the stream is gone: the body reads as empty from then
    /// on.
    pub async fn buffer_body(&mut self) -> Result<Bytes, Error> {
        if let Some(bytes) = &self.buffered {
            return Ok(bytes.clone());
        }
        let bytes = self.take_body().collect().await?;
        self.body = Body::from(bytes.clone());
        self.buffered = Some(bytes.clone());
        Ok(bytes)
    }

    /// Reads the whole body. The stream is consumed: a second call returns
    /// empty bytes.
    pub async fn bytes(&mut self) -> Result<Bytes, Error> {
        self.take_body().collect().await
    }

    /// Takes the body stream, leaving an empty one behind.
    pub fn take_body(&mut self) -> Body {
        std::mem::take(&mut self.body)
    }

    /// Installs a new body stream and returns the old one. Forgets any
    /// bytes kept by [`buffer_body`](Self::buffer_body).
    pub fn replace_body(&mut self, body: impl Into<Body>) -> Body {
        self.buffered = None;
        std::mem::replace(&mut self.body, body.into())
    }

    pub(crate) fn head(&self) -> RequestHead {
        RequestHead {
            method: self.method.clone(),
            request_uri: self.request_uri().to_owned(),
            proto: self.proto(),
            headers: self.headers.clone(),
            body: self.buffered.clone().unwrap_or_default(),
        }
    }
}

/// Copy of the request line, headers and buffered body, kept for the 5xx
/// request dump.
#[derive(Debug)]
pub(crate) struct RequestHead {
    method: Method,
    request_uri: String,
    proto: &'static str,
    headers: HeaderMap,
    body: Bytes,
}

impl RequestHead {
    /// Wire-like rendering of the request.
    pub(crate) fn dump(&self) -> String {
        let mut out = format!("{} {} {}\r\n", self.method, self.request_uri, self.proto);
        for (name, value) in &self.headers {
            let value = String::from_utf8_lossy(value.as_bytes());
            let _ = write!(out, "{name}: {value}\r\n");
        }
        out.push_str("\r\n");
        out.push_str(&String::from_utf8_lossy(&self.body));
        out
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn request(builder: http::request::Builder, body: &'static str) -> Request {
        Request::from_http(builder.body(Full::new(Bytes::from_static(body.as_bytes()))).unwrap(), None)
    }

    #[test]
    fn entry_accessors_read_the_request_line_and_headers() {
        let req = request(
            http::Request::builder()
                .method("POST")
                .uri("/users?page=2&sort=name")
                .header("host", "api.example.com")
                .header("referer", "https://example.com/")
                .header("user-agent", "curl/8.0")
                .header("content-type", "application/json; charset=utf-8"),
            r#"{"k":"v"}"#,
        );

        assert_eq!(req.path(), "/users");
        assert_eq!(req.raw_query(), "page=2&sort=name");
        assert_eq!(req.request_uri(), "/users?page=2&sort=name");
        assert_eq!(req.proto(), "HTTP/1.1");
        assert_eq!(req.host(), "api.example.com");
        assert_eq!(req.referer(), "https://example.com/");
        assert_eq!(req.user_agent(), "curl/8.0");
        assert_eq!(req.content_type(), "application/json");
        assert_eq!(req.content_length(), 9);
        assert_eq!(req.query("sort").as_deref(), Some("name"));
        assert_eq!(req.query("missing"), None);
    }

    #[test]
    fn client_ip_prefers_forwarded_headers() {
        let peer: SocketAddr = "10.0.0.9:51000".parse().unwrap();

        let mut req = Request::from_http(http::Request::new(Full::new(Bytes::new())), Some(peer));
        assert_eq!(req.client_ip(), "10.0.0.9");

        req.headers_mut().insert("x-real-ip", "198.51.100.4".parse().unwrap());
        assert_eq!(req.client_ip(), "198.51.100.4");

        req.headers_mut().insert("x-forwarded-for", "203.0.113.7, 10.0.0.1".parse().unwrap());
        assert_eq!(req.client_ip(), "203.0.113.7");
    }

    #[tokio::test]
    async fn parse_form_restores_the_body() {
        let mut req = request(
            http::Request::builder()
                .method("POST")
                .uri("/login")
                .header("content-type", "application/x-www-form-urlencoded"),
            "trace_id=from-form&user=alice",
        );

        assert_eq!(req.post_form("trace_id"), None);
        req.parse_form().await.unwrap();
        assert_eq!(req.post_form("trace_id"), Some("from-form"));
        assert_eq!(req.post_form("user"), Some("alice"));

        let body = req.bytes().await.unwrap();
        assert_eq!(&body[..], b"trace_id=from-form&user=alice");
        assert!(req.bytes().await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn parse_form_ignores_other_content_types() {
        let mut req = request(
            http::Request::builder().method("POST").uri("/").header("content-type", "application/json"),
            "trace_id=nope",
        );

        req.parse_form().await.unwrap();
        assert_eq!(req.post_form("trace_id"), None);
        assert_eq!(&req.bytes().await.unwrap()[..], b"trace_id=nope");
    }

    #[tokio::test]
    async fn head_dump_renders_request_line_headers_and_buffered_body() {
        let mut req = request(http::Request::builder().method("PUT").uri("/a?b=c").header("x-k", "v"), "payload");
        assert_eq!(req.head().dump(), "PUT /a?b=c HTTP/1.1\r\nx-k: v\r\n\r\n");

        req.buffer_body().await.unwrap();
        assert_eq!(req.head().dump(), "PUT /a?b=c HTTP/1.1\r\nx-k: v\r\n\r\npayload");
    }

    #[tokio::test]
    async fn buffer_body_keeps_the_stream_readable() {
        let mut req = request(http::Request::builder().method("POST").uri("/"), "abc");

        assert_eq!(&req.buffer_body().await.unwrap()[..], b"abc");
        assert_eq!(&req.buffer_body().await.unwrap()[..], b"abc");
        assert_eq!(&req.bytes().await.unwrap()[..], b"abc");

        req.replace_body("xyz");
        assert_eq!(&req.buffer_body().await.unwrap()[..], b"xyz");
    }
}
