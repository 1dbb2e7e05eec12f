//! Unified error type.

/// Boxed error used for body streams coming from hyper or from tests.
pub type BoxError = Box<dyn std::error::Error + Send + Sync + 'static>;

/// The error type returned by tsu's fallible operations.
///
/// Application-level errors (404, 422, etc.) are expressed as HTTP
/// [`Response`](crate::Response) values, not as `Error`s. This type surfaces
/// infrastructure failures: binding to a port, accepting a connection, or
/// reading a request body off the wire.
#[derive(Debug, thiserror::Error)]
pub enum Error {
    #[error("io: {0}")]
    Io(#[from] std::io::Error),

    #[error("request body: {0}")]
    Body(#[source] BoxError),

    #[error("form: {0}")]
    Form(#[from] serde_urlencoded::de::Error),
}
