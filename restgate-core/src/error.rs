use std::fmt;

/// All error types produced by the gateway library.
#[derive(Debug)]
pub enum GatewayError {
    /// The descriptor blob is undecodable or self-inconsistent.
    /// Fatal at startup; during a rebuild it degrades to [`GatewayError::Rebuild`].
    Descriptor(String),

    /// Service discovery or backend connection failure. Retried with backoff.
    Resolution(String),

    /// Path/query/body input could not be decoded into the request message.
    /// Translated to HTTP 400 at the dispatcher boundary.
    Binding(String),

    /// A new descriptor set was rejected; the previous route table stays live.
    Rebuild(String),

    /// A gRPC status from the backend, carried verbatim to the dispatcher.
    GrpcStatus(tonic::Status),

    /// An I/O error (file read, network, etc.).
    Io(std::io::Error),

    /// Any other error.
    Other(Box<dyn std::error::Error + Send + Sync>),
}

impl fmt::Display for GatewayError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            GatewayError::Descriptor(msg) => write!(f, "invalid descriptor: {msg}"),
            GatewayError::Resolution(msg) => write!(f, "endpoint resolution failed: {msg}"),
            GatewayError::Binding(msg) => write!(f, "request binding failed: {msg}"),
            GatewayError::Rebuild(msg) => write!(f, "route rebuild failed: {msg}"),
            GatewayError::GrpcStatus(status) => {
                write!(f, "gRPC error: {} - {}", status.code(), status.message())
            }
            GatewayError::Io(err) => write!(f, "I/O error: {err}"),
            GatewayError::Other(err) => write!(f, "{err}"),
        }
    }
}

impl std::error::Error for GatewayError {
    fn source(&self) -> Option<&(dyn std::error::Error + 'static)> {
        match self {
            GatewayError::Io(err) => Some(err),
            GatewayError::Other(err) => Some(err.as_ref()),
            _ => None,
        }
    }
}

impl From<std::io::Error> for GatewayError {
    fn from(err: std::io::Error) -> Self {
        GatewayError::Io(err)
    }
}

impl From<tonic::Status> for GatewayError {
    fn from(status: tonic::Status) -> Self {
        GatewayError::GrpcStatus(status)
    }
}

/// Convenience type alias used throughout the codebase.
pub type Result<T> = std::result::Result<T, GatewayError>;
