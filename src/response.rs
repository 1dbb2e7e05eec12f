//! Outgoing responses.
//!
//! Two halves live here:
//!
//! - [`Response`] is what a handler returns: status, headers and a body,
//!   built in one go.
//! - [`ResponseWriter`] is what the middleware chain writes into. The chain's
//!   endpoint writes the handler's `Response` into the active writer, and a
//!   middleware may swap the writer for a decorator (see
//!   [`BodyCapture`](crate::middleware::BodyCapture)) before calling `next`.

use bytes::{Bytes, BytesMut};
use http::header::CONTENT_TYPE;
use http::{HeaderMap, HeaderName, HeaderValue, StatusCode};
use http_body_util::Full;

// ── Response ─────────────────────────────────────────────────────────────────

/// A handler's response.
///
/// ```rust
/// use tsu_access::Response;
/// use http::StatusCode;
///
/// Response::json(r#"{"id":1}"#);
/// Response::text("hello");
/// Response::status(StatusCode::NO_CONTENT);
///
/// Response::builder()
///     .status(StatusCode::CREATED)
///     .header("location", "/users/42")
///     .json(r#"{"id":42}"#);
/// ```
#[derive(Debug)]
pub struct Response {
    status: StatusCode,
    headers: HeaderMap,
    body: Bytes,
}

impl Response {
    /// `200 OK`, `application/json`.
    pub fn json(body: impl Into<Bytes>) -> Self {
        Self::with_content_type("application/json", body.into())
    }

    /// `200 OK`, `text/plain; charset=utf-8`.
    pub fn text(body: impl Into<String>) -> Self {
        Self::with_content_type("text/plain; charset=utf-8", Bytes::from(body.into()))
    }

    /// Response with no body.
    pub fn status(code: StatusCode) -> Self {
        Self { status: code, headers: HeaderMap::new(), body: Bytes::new() }
    }

    pub fn builder() -> ResponseBuilder {
        ResponseBuilder { headers: HeaderMap::new(), status: StatusCode::OK }
    }

    pub fn status_code(&self) -> StatusCode { self.status }
    pub fn headers(&self) -> &HeaderMap { &self.headers }
    pub fn body(&self) -> &Bytes { &self.body }

    fn with_content_type(content_type: &'static str, body: Bytes) -> Self {
        let mut headers = HeaderMap::new();
        headers.insert(CONTENT_TYPE, HeaderValue::from_static(content_type));
        Self { status: StatusCode::OK, headers, body }
    }

    /// Writes status, headers and body into `writer`. Headers replace any
    /// value already set under the same name.
    pub fn write_to(self, writer: &mut dyn ResponseWriter) {
        writer.set_status(self.status);
        writer.headers_mut().extend(self.headers);
        if !self.body.is_empty() {
            writer.write(&self.body);
        }
    }
}

// ── ResponseBuilder ───────────────────────────────────────────────────────────

/// Fluent builder for [`Response`]. Defaults to `200 OK`.
pub struct ResponseBuilder {
    headers: HeaderMap,
    status: StatusCode,
}

impl ResponseBuilder {
    pub fn status(mut self, code: StatusCode) -> Self {
        self.status = code;
        self
    }

    /// Adds a header. Names or values that are not valid HTTP are dropped.
    pub fn header(mut self, name: &str, value: &str) -> Self {
        match (HeaderName::try_from(name), HeaderValue::try_from(value)) {
            (Ok(name), Ok(value)) => {
                self.headers.append(name, value);
            }
            _ => tracing::debug!(name, "dropping invalid response header"),
        }
        self
    }

    pub fn json(self, body: impl Into<Bytes>) -> Response {
        self.finish("application/json", body.into())
    }

    pub fn text(self, body: impl Into<String>) -> Response {
        self.finish("text/plain; charset=utf-8", Bytes::from(body.into()))
    }

    pub fn no_body(self) -> Response {
        Response { status: self.status, headers: self.headers, body: Bytes::new() }
    }

    fn finish(mut self, content_type: &'static str, body: Bytes) -> Response {
        self.headers.insert(CONTENT_TYPE, HeaderValue::from_static(content_type));
        Response { status: self.status, headers: self.headers, body }
    }
}

// ── IntoResponse ──────────────────────────────────────────────────────────────

/// Conversion into a [`Response`]. Implement it on your own types to return
/// them straight from handlers.
pub trait IntoResponse {
    fn into_response(self) -> Response;
}

impl IntoResponse for Response {
    fn into_response(self) -> Response { self }
}

impl IntoResponse for &'static str {
    fn into_response(self) -> Response { Response::text(self) }
}

impl IntoResponse for String {
    fn into_response(self) -> Response { Response::text(self) }
}

/// Return a bare status from a handler: `return StatusCode::NOT_FOUND`.
impl IntoResponse for StatusCode {
    fn into_response(self) -> Response { Response::status(self) }
}

// ── ResponseWriter ────────────────────────────────────────────────────────────

/// The writer capability set every middleware sees.
///
/// `size` counts body bytes written so far.
pub trait ResponseWriter: Send {
    fn status(&self) -> StatusCode;
    fn set_status(&mut self, status: StatusCode);
    fn headers(&self) -> &HeaderMap;
    fn headers_mut(&mut self) -> &mut HeaderMap;
    /// Appends `buf` to the body and returns the number of bytes written.
    fn write(&mut self, buf: &[u8]) -> usize;
    fn size(&self) -> usize;
}

/// The host's writer: buffers the whole response, then hands it to hyper.
#[derive(Debug)]
pub struct ResponseBuffer {
    status: StatusCode,
    headers: HeaderMap,
    body: BytesMut,
}

impl ResponseBuffer {
    pub fn new() -> Self {
        Self { status: StatusCode::OK, headers: HeaderMap::new(), body: BytesMut::new() }
    }

    pub fn body(&self) -> &[u8] { &self.body }

    pub fn into_http(self) -> http::Response<Full<Bytes>> {
        let mut response = http::Response::new(Full::new(self.body.freeze()));
        *response.status_mut() = self.status;
        *response.headers_mut() = self.headers;
        response
    }
}

impl Default for ResponseBuffer {
    fn default() -> Self { Self::new() }
}

impl ResponseWriter for ResponseBuffer {
    fn status(&self) -> StatusCode { self.status }
    fn set_status(&mut self, status: StatusCode) { self.status = status; }
    fn headers(&self) -> &HeaderMap { &self.headers }
    fn headers_mut(&mut self) -> &mut HeaderMap { &mut self.headers }

    fn write(&mut self, buf: &[u8]) -> usize {
        self.body.extend_from_slice(buf);
        buf.len()
    }

    fn size(&self) -> usize { self.body.len() }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn write_to_replaces_headers_and_appends_body() {
        let mut writer = ResponseBuffer::new();
        writer.headers_mut().insert("x-trace-id", HeaderValue::from_static("abc"));
        writer.headers_mut().insert(CONTENT_TYPE, HeaderValue::from_static("text/html"));

        Response::builder()
            .status(StatusCode::CREATED)
            .header("location", "/users/1")
            .json(r#"{"id":1}"#)
            .write_to(&mut writer);

        assert_eq!(writer.status(), StatusCode::CREATED);
        assert_eq!(writer.headers()["x-trace-id"], "abc");
        assert_eq!(writer.headers()[CONTENT_TYPE], "application/json");
        assert_eq!(writer.headers()["location"], "/users/1");
        assert_eq!(writer.body(), br#"{"id":1}"#);
        assert_eq!(writer.size(), 8);
    }

    #[test]
    fn invalid_builder_header_is_dropped() {
        let response = Response::builder().header("bad header", "v").no_body();
        assert!(response.headers().is_empty());
    }

    #[test]
    fn into_http_keeps_status_and_headers() {
        let mut writer = ResponseBuffer::new();
        writer.set_status(StatusCode::IM_A_TEAPOT);
        writer.write(b"short and stout");

        let response = writer.into_http();
        assert_eq!(response.status(), StatusCode::IM_A_TEAPOT);
    }
}
