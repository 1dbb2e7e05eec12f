//! Response body capture.

use bytes::{Bytes, BytesMut};
use http::{HeaderMap, StatusCode};

use crate::response::ResponseWriter;

/// Writer decorator that keeps a copy of every body byte written through it.
///
/// Everything else (status, headers, size) goes straight to the wrapped
/// writer, so code downstream cannot tell the difference. The access log
/// only installs it when body capture is enabled.
pub struct BodyCapture<'w> {
    inner: &'w mut dyn ResponseWriter,
    body: BytesMut,
}

impl<'w> BodyCapture<'w> {
    pub fn new(inner: &'w mut dyn ResponseWriter) -> Self {
        Self { inner, body: BytesMut::new() }
    }

    pub fn captured(&self) -> &[u8] { &self.body }

    /// Releases the wrapped writer and returns the captured bytes.
    pub fn into_body(self) -> Bytes {
        self.body.freeze()
    }
}

impl ResponseWriter for BodyCapture<'_> {
    fn status(&self) -> StatusCode { self.inner.status() }
    fn set_status(&mut self, status: StatusCode) { self.inner.set_status(status); }
    fn headers(&self) -> &HeaderMap { self.inner.headers() }
    fn headers_mut(&mut self) -> &mut HeaderMap { self.inner.headers_mut() }

    fn write(&mut self, buf: &[u8]) -> usize {
        self.body.extend_from_slice(buf);
        self.inner.write(buf)
    }

    fn size(&self) -> usize { self.inner.size() }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::response::{Response, ResponseBuffer};

    #[test]
    fn writes_reach_both_the_buffer_and_the_inner_writer() {
        let mut inner = ResponseBuffer::new();
        inner.write(b"pre-");

        let mut capture = BodyCapture::new(&mut inner);
        Response::builder()
            .status(StatusCode::ACCEPTED)
            .text("queued")
            .write_to(&mut capture);
        capture.write(b"!");

        assert_eq!(capture.captured(), b"queued!");
        assert_eq!(capture.size(), 11);
        assert_eq!(capture.status(), StatusCode::ACCEPTED);
        assert_eq!(&capture.into_body()[..], b"queued!");

        assert_eq!(inner.body(), b"pre-queued!");
        assert_eq!(inner.status(), StatusCode::ACCEPTED);
    }
}
