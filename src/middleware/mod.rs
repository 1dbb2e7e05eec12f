//! Middleware layer.
//!
//! Middleware wrap the rest of the chain: each one gets the request, the
//! active [`ResponseWriter`] and a [`Next`] it may call (or not, to short
//! circuit). The chain ends in the matched handler, whose [`Response`] is
//! written into whatever writer is active at that point.
//!
//! Middleware run in registration order, so the first one registered on the
//! [`Router`](crate::Router) is the outermost:
//!
//! ```text
//! Recovery → AccessLog → (TraceContext) → handler
//! ```
//!
//! Built-in middleware:
//! - [`Recovery`]: panic boundary, turns a panicking request into a 500
//! - [`AccessLog`]: one structured log line per request
//! - [`TraceContext`]: trace id resolution on its own, for stacks without
//!   an access log
//!
//! [`Response`]: crate::Response

use std::future::Future;
use std::pin::Pin;
use std::sync::Arc;

use crate::handler::BoxedHandler;
use crate::request::Request;
use crate::response::ResponseWriter;

mod access_log;
mod capture;
mod record;
mod recovery;
mod trace;

pub use access_log::{AccessLog, AccessLogConfig};
pub use capture::BodyCapture;
pub use record::{default_format, Formatter, LogRecord};
pub use recovery::{ErrorHandler, PanicKind, Recovery};
pub use trace::{lookup_trace_id, TraceContext, TraceIdFn, TraceKeys};

/// A boxed, `Send` future borrowing for `'a`.
pub type BoxFuture<'a, T> = Pin<Box<dyn Future<Output = T> + Send + 'a>>;

/// A request interceptor.
///
/// ```rust
/// use tsu_access::middleware::{BoxFuture, Middleware, Next};
/// use tsu_access::{Request, ResponseWriter};
///
/// struct PoweredBy;
///
/// impl Middleware for PoweredBy {
///     fn handle<'a>(
///         &'a self,
///         req: Request,
///         writer: &'a mut dyn ResponseWriter,
///         next: Next<'a>,
///     ) -> BoxFuture<'a, ()> {
///         Box::pin(async move {
///             writer.headers_mut().insert("x-powered-by", "tsu".parse().unwrap());
///             next.run(req, writer).await;
///         })
///     }
/// }
/// ```
pub trait Middleware: Send + Sync + 'static {
    fn handle<'a>(
        &'a self,
        req: Request,
        writer: &'a mut dyn ResponseWriter,
        next: Next<'a>,
    ) -> BoxFuture<'a, ()>;
}

/// The remainder of the chain after the current middleware.
#[derive(Clone, Copy)]
pub struct Next<'a> {
    chain: &'a [Arc<dyn Middleware>],
    endpoint: &'a BoxedHandler,
}

impl<'a> Next<'a> {
    pub(crate) fn new(chain: &'a [Arc<dyn Middleware>], endpoint: &'a BoxedHandler) -> Self {
        Self { chain, endpoint }
    }

    /// Runs the rest of the chain, writing the final response into `writer`.
    pub fn run<'b>(self, req: Request, writer: &'b mut dyn ResponseWriter) -> BoxFuture<'b, ()>
    where
        'a: 'b,
    {
        match self.chain.split_first() {
            Some((first, rest)) => first.handle(req, writer, Next { chain: rest, endpoint: self.endpoint }),
            None => {
                let fut = self.endpoint.call(req);
                Box::pin(async move { fut.await.write_to(writer) })
            }
        }
    }
}
