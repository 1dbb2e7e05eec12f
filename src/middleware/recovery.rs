//! Panic boundary.
//!
//! A panic anywhere below [`Recovery`] is caught at the edge of the request,
//! recorded on the request context, and turned into a `500`. The connection
//! and the server keep going.
//!
//! The panic message and a backtrace are grabbed by a panic hook installed
//! the first time a `Recovery` is built. Panics raised while a `Recovery`
//! future is being polled are reported once, through the recorded error;
//! any other panic goes on to the previous hook.

use std::any::Any;
use std::backtrace::Backtrace;
use std::cell::{Cell, RefCell};
use std::future::Future;
use std::io;
use std::panic::{self, AssertUnwindSafe, PanicHookInfo};
use std::sync::{Arc, Once};

use futures_util::FutureExt;
use futures_util::future::poll_fn;
use http::StatusCode;

use super::{BoxFuture, Middleware, Next};
use crate::context::{ErrorKind, RecordedError, RequestContext};
use crate::error::Error;
use crate::request::Request;
use crate::response::ResponseWriter;

/// Called after a panic has been recorded and before the 500 is forced.
/// It may write a body.
pub type ErrorHandler = Arc<dyn Fn(&RequestContext, &mut dyn ResponseWriter) + Send + Sync>;

thread_local! {
    static LAST_PANIC: RefCell<Option<String>> = const { RefCell::new(None) };
    static BOUNDARY_DEPTH: Cell<usize> = const { Cell::new(0) };
}

/// Marks the current thread as polling inside a `Recovery` for as long as
/// it is alive, unwinding included.
struct Boundary;

impl Boundary {
    fn enter() -> Self {
        BOUNDARY_DEPTH.with(|depth| depth.set(depth.get() + 1));
        Self
    }
}

impl Drop for Boundary {
    fn drop(&mut self) {
        BOUNDARY_DEPTH.with(|depth| depth.set(depth.get().saturating_sub(1)));
    }
}

fn inside_boundary() -> bool {
    BOUNDARY_DEPTH.try_with(|depth| depth.get() > 0).unwrap_or(false)
}

static HOOK: Once = Once::new();

fn install_panic_hook() {
    HOOK.call_once(|| {
        let previous = panic::take_hook();
        panic::set_hook(Box::new(move |info: &PanicHookInfo<'_>| {
            let location = info.location().map(ToString::to_string).unwrap_or_default();
            let trace = format!("at {location}\n{}", Backtrace::force_capture());
            let _ = LAST_PANIC.try_with(|slot| *slot.borrow_mut() = Some(trace));
            if !inside_boundary() {
                previous(info);
            }
        }));
    });
}

fn take_panic_trace() -> String {
    LAST_PANIC
        .try_with(|slot| slot.borrow_mut().take())
        .ok()
        .flatten()
        .unwrap_or_default()
}

/// What kind of panic reached the boundary. Both kinds get the same
/// treatment; the kind only changes the recorded message prefix.
#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub enum PanicKind {
    /// The client went away mid-response.
    BrokenPipe,
    Generic,
}

impl PanicKind {
    /// A payload that is an I/O error saying "broken pipe" or "connection
    /// reset by peer" is a broken pipe. Everything else is generic.
    pub fn classify(payload: &(dyn Any + Send)) -> Self {
        let io_error = payload.downcast_ref::<io::Error>().or_else(|| match payload.downcast_ref::<Error>() {
            Some(Error::Io(err)) => Some(err),
            _ => None,
        });
        match io_error {
            Some(err) if is_broken_pipe(err) => Self::BrokenPipe,
            _ => Self::Generic,
        }
    }

    fn prefix(self) -> &'static str {
        match self {
            Self::BrokenPipe => "Broken pipe: ",
            Self::Generic => "Recovery from panic: ",
        }
    }
}

impl From<PanicKind> for ErrorKind {
    fn from(kind: PanicKind) -> Self {
        match kind {
            PanicKind::BrokenPipe => ErrorKind::BrokenPipe,
            PanicKind::Generic => ErrorKind::Panic,
        }
    }
}

fn is_broken_pipe(err: &io::Error) -> bool {
    if matches!(err.kind(), io::ErrorKind::BrokenPipe | io::ErrorKind::ConnectionReset) {
        return true;
    }
    let message = err.to_string().to_lowercase();
    message.contains("broken pipe") || message.contains("connection reset by peer")
}

fn panic_message(payload: &(dyn Any + Send)) -> String {
    if let Some(s) = payload.downcast_ref::<&'static str>() {
        (*s).to_owned()
    } else if let Some(s) = payload.downcast_ref::<String>() {
        s.clone()
    } else if let Some(err) = payload.downcast_ref::<io::Error>() {
        err.to_string()
    } else if let Some(err) = payload.downcast_ref::<Error>() {
        err.to_string()
    } else {
        "Box<dyn Any>".to_owned()
    }
}

/// Panic recovery middleware. Register it first so it wraps everything
/// else.
#[derive(Clone)]
pub struct Recovery {
    on_error: Option<ErrorHandler>,
}

impl Recovery {
    pub fn new() -> Self {
        install_panic_hook();
        Self { on_error: None }
    }

    /// Recovery that calls `handler` for every recovered panic.
    pub fn with_handler(
        handler: impl Fn(&RequestContext, &mut dyn ResponseWriter) + Send + Sync + 'static,
    ) -> Self {
        install_panic_hook();
        Self { on_error: Some(Arc::new(handler)) }
    }

    fn recover(&self, ctx: &RequestContext, writer: &mut dyn ResponseWriter, payload: &(dyn Any + Send)) {
        let kind = PanicKind::classify(payload);
        let message = format!("{}{}\n{}", kind.prefix(), panic_message(payload), take_panic_trace());
        ctx.record(RecordedError::new(kind.into(), message));

        if let Some(on_error) = &self.on_error {
            on_error(ctx, &mut *writer);
        }
        writer.set_status(StatusCode::INTERNAL_SERVER_ERROR);

        if let Some(exit) = ctx.take_deferred_exit() {
            exit(ctx, &*writer);
        }
    }
}

impl Default for Recovery {
    fn default() -> Self { Self::new() }
}

impl Middleware for Recovery {
    fn handle<'a>(
        &'a self,
        req: Request,
        writer: &'a mut dyn ResponseWriter,
        next: Next<'a>,
    ) -> BoxFuture<'a, ()> {
        Box::pin(async move {
            let ctx = Arc::clone(req.context());
            let mut downstream = next.run(req, &mut *writer);
            let guarded = poll_fn(move |cx| {
                let _boundary = Boundary::enter();
                downstream.as_mut().poll(cx)
            });
            let outcome = AssertUnwindSafe(guarded).catch_unwind().await;
            if let Err(payload) = outcome {
                self.recover(&ctx, writer, payload.as_ref());
            }
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn payload<T: Any + Send>(value: T) -> Box<dyn Any + Send> {
        Box::new(value)
    }

    #[test]
    fn io_broken_pipe_is_classified() {
        let err = io::Error::new(io::ErrorKind::BrokenPipe, "write failed");
        assert_eq!(PanicKind::classify(payload(err).as_ref()), PanicKind::BrokenPipe);
    }

    #[test]
    fn connection_reset_message_is_classified_case_insensitively() {
        let err = io::Error::other("write tcp 10.0.0.1:80: Connection Reset By Peer");
        assert_eq!(PanicKind::classify(payload(err).as_ref()), PanicKind::BrokenPipe);

        let wrapped = Error::Io(io::Error::other("BROKEN PIPE"));
        assert_eq!(PanicKind::classify(payload(wrapped).as_ref()), PanicKind::BrokenPipe);
    }

    #[test]
    fn plain_messages_are_generic() {
        assert_eq!(PanicKind::classify(payload("broken pipe").as_ref()), PanicKind::Generic);
        assert_eq!(PanicKind::classify(payload(io::Error::other("disk full")).as_ref()), PanicKind::Generic);
    }

    #[test]
    fn boundary_is_scoped_and_nests() {
        assert!(!inside_boundary());
        {
            let _outer = Boundary::enter();
            {
                let _inner = Boundary::enter();
                assert!(inside_boundary());
            }
            assert!(inside_boundary());
        }
        assert!(!inside_boundary());
    }

    #[test]
    fn boundary_is_released_when_a_panic_unwinds_through_it() {
        install_panic_hook();
        let caught = panic::catch_unwind(|| {
            let _boundary = Boundary::enter();
            panic!("inside");
        });

        assert!(caught.is_err());
        assert!(!inside_boundary());
        assert!(take_panic_trace().starts_with("at "));
    }

    #[test]
    fn panic_message_reads_common_payloads() {
        assert_eq!(panic_message(payload("boom").as_ref()), "boom");
        assert_eq!(panic_message(payload(String::from("owned")).as_ref()), "owned");
        assert_eq!(panic_message(payload(42_u8).as_ref()), "Box<dyn Any>");
    }
}
