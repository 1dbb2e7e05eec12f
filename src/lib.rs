//! # tsu-access
//!
//! Request observability for a small hyper-based HTTP framework: trace id
//! propagation, one structured access log line per request, response body
//! capture and panic recovery.
//!
//! ## Quick start
//!
//! ```rust,no_run
//! use tsu_access::middleware::{AccessLog, AccessLogConfig, Recovery};
//! use tsu_access::{logging, Request, Response, Router, Server};
//!
//! #[tokio::main]
//! async fn main() -> Result<(), Box<dyn std::error::Error + Send + Sync>> {
//!     logging::init()?;
//!
//!     let app = Router::new()
//!         .middleware(Recovery::new())
//!         .middleware(AccessLog::new(AccessLogConfig::default().skip_path("/healthz")))
//!         .get("/users/{id}", get_user)
//!         .get("/healthz", |_req: Request| async { "ok" });
//!
//!     Server::bind(([0, 0, 0, 0], 3000).into()).serve(app).await?;
//!     Ok(())
//! }
//!
//! async fn get_user(req: Request) -> Response {
//!     let id = req.param("id").unwrap_or_default();
//!     if id == "0" {
//!         req.context().record_error("user 0 is reserved");
//!     }
//!     Response::json(format!(r#"{{"id":"{id}"}}"#))
//! }
//! ```
//!
//! Every request gets a trace id: the `x-trace-id` header, a `trace_id`
//! form field or query parameter, or a fresh UUID. It is echoed on the
//! response and carried by every event logged inside the request.

mod context;
mod error;
mod handler;
mod request;
mod response;
mod router;
mod server;

pub mod logging;
pub mod middleware;

pub use context::{ErrorKind, RecordedError, RequestContext};
pub use error::{BoxError, Error};
pub use handler::Handler;
pub use request::{Body, Request};
pub use response::{IntoResponse, Response, ResponseBuffer, ResponseBuilder, ResponseWriter};
pub use router::Router;
pub use server::Server;
