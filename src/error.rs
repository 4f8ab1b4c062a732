use crate::CorrelationId;
use thiserror::Error;

/// Errors surfaced to callers of the RPC layer.
///
/// Conditions local to message routing (malformed replies, replies arriving
/// after their caller timed out, individual handler failures) are absorbed
/// and logged by the delivery loops instead of being surfaced here, so they
/// cannot cascade into unrelated in-flight calls.
#[derive(Error, Debug)]
pub enum RpcError {
    /// A call tried to register a correlation id that is already in flight.
    ///
    /// This indicates a broken id generator and fails only the offending
    /// call; other pending calls are unaffected.
    #[error("correlation id already in flight: {0}")]
    DuplicateCorrelationId(CorrelationId),

    /// No reply was observed within the call deadline.
    #[error("request timed out waiting for reply")]
    Timeout,

    /// The wait was abandoned before a reply arrived, either by the caller
    /// or because the owning client shut down.
    #[error("call cancelled before a reply arrived")]
    Cancelled,

    /// Underlying connection or session failure.
    ///
    /// Not retried internally; retry policy belongs to the caller.
    #[error("transport error: {0}")]
    Transport(String),
}

/// Result type alias for RPC operations.
pub type Result<T> = std::result::Result<T, RpcError>;
