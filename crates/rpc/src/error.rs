//! Error types for the messaging runtime.

use crate::session::SessionState;

use std::io;
use std::time::Duration;
use thiserror::Error;

/// Result type alias for runtime operations.
pub type Result<T> = std::result::Result<T, Error>;

/// Main error type for runtime operations.
#[derive(Debug, Error)]
pub enum Error {
    /// Transport-level failure. Always fatal to the owning session.
    #[error("Transport error: {0}")]
    Transport(#[from] TransportError),

    /// Envelope encoding or decoding failed.
    #[error("Codec error: {0}")]
    Codec(#[from] CodecError),

    /// A call failed without affecting the session.
    #[error("RPC error: {0}")]
    Rpc(#[from] RpcError),

    /// Schema or handler registration was rejected.
    #[error("Registration error: {0}")]
    Registration(#[from] RegistrationError),

    /// The session is not in the `Established` state.
    #[error("Session is not established (state: {0:?})")]
    NotEstablished(SessionState),

    /// Connecting to a server timed out.
    #[error("Connect to {addr} timed out after {timeout:?}")]
    ConnectTimeout {
        /// The address we tried to connect to.
        addr: std::net::SocketAddr,
        /// How long we waited.
        timeout: Duration,
    },

    /// Generic I/O error (bind, connect).
    #[error("I/O error: {0}")]
    Io(#[from] io::Error),

    /// Internal channel closed unexpectedly.
    #[error("Channel closed")]
    ChannelClosed,
}

impl Error {
    /// Whether this is an RPC-class failure (timeout or remote error).
    ///
    /// RPC-class failures leave the session usable, so callers such as the
    /// heartbeat may retry them. Anything else is handled by closing the
    /// session.
    #[must_use]
    pub const fn is_rpc(&self) -> bool {
        matches!(self, Self::Rpc(RpcError::Timeout(_) | RpcError::Remote(_)))
    }

    /// Whether this is a call timeout.
    #[must_use]
    pub const fn is_timeout(&self) -> bool {
        matches!(self, Self::Rpc(RpcError::Timeout(_)))
    }

    /// The remote error string, if the handler on the other side reported one.
    #[must_use]
    pub fn remote_message(&self) -> Option<&str> {
        match self {
            Self::Rpc(RpcError::Remote(message)) => Some(message),
            _ => None,
        }
    }
}

/// Framing and socket errors.
#[derive(Debug, Error)]
pub enum TransportError {
    /// The peer closed the connection between frames.
    #[error("Connection closed by peer")]
    PeerClosed,

    /// The peer closed the connection in the middle of a frame.
    #[error("Truncated frame: announced {expected} bytes, received {received}")]
    Truncated {
        /// Bytes announced by the frame header (plus header size).
        expected: usize,
        /// Bytes actually received.
        received: usize,
    },

    /// A frame body did not arrive within the allowed window.
    #[error("Frame body stalled for more than {0:?}")]
    Stalled(Duration),

    /// Frame too large.
    #[error("Frame size {size} exceeds maximum {max}")]
    FrameTooLarge {
        /// Size of the frame.
        size: usize,
        /// Maximum allowed size.
        max: usize,
    },

    /// Underlying socket error.
    #[error("I/O error: {0}")]
    Io(#[from] io::Error),
}

/// Envelope codec errors.
#[derive(Debug, Error)]
pub enum CodecError {
    /// Serialization failed.
    #[error("Failed to serialize: {0}")]
    Serialize(String),

    /// Deserialization failed.
    #[error("Failed to deserialize: {0}")]
    Deserialize(String),

    /// The envelope carried a tag the schema does not know.
    #[error("Unknown message tag: {0}")]
    UnknownTag(String),

    /// A response arrived for a pending call but has the wrong type.
    #[error("Expected response {expected}, received {actual}")]
    UnexpectedResponse {
        /// Response tag the call waits for.
        expected: &'static str,
        /// Tag that arrived.
        actual: &'static str,
    },
}

/// Errors surfaced to the caller of [`Session::call`](crate::Session::call).
#[derive(Debug, Clone, Error)]
pub enum RpcError {
    /// No response arrived in time.
    #[error("Call timed out after {0:?}")]
    Timeout(Duration),

    /// The remote handler reported an error.
    #[error("Remote error: {0}")]
    Remote(String),

    /// The session closed while the call was pending.
    #[error("Call cancelled: session closed")]
    Cancelled,

    /// The schema pairs the request with a different response type.
    #[error("Request {request} is paired with {expected}, caller expected {actual}")]
    TypeMismatch {
        /// Request tag.
        request: &'static str,
        /// Response tag from the schema pairing table.
        expected: &'static str,
        /// Response tag the caller asked for.
        actual: &'static str,
    },

    /// The request type is not part of the schema.
    #[error("Request type {0} is not registered")]
    Unregistered(&'static str),
}

/// Schema and handler registration errors.
#[derive(Debug, Clone, Error, PartialEq, Eq)]
pub enum RegistrationError {
    /// Two types were registered with the same tag.
    #[error("Duplicate message tag: {0}")]
    DuplicateTag(&'static str),

    /// A request's paired response type is not registered.
    #[error("Request {request} is paired with unregistered response {response}")]
    UnmappedResponse {
        /// Request tag.
        request: &'static str,
        /// Missing response tag.
        response: &'static str,
    },

    /// A request's paired type is registered, but not as a response.
    #[error("Request {request} is paired with {response}, which is not a response type")]
    NotAResponse {
        /// Request tag.
        request: &'static str,
        /// Offending tag.
        response: &'static str,
    },

    /// The same callback is already subscribed to this type.
    #[error("Callback already subscribed to {0}")]
    DuplicateSubscription(&'static str),

    /// An RPC handler is already bound for this request type.
    #[error("RPC handler already bound for {0}")]
    DuplicateRpcHandler(&'static str),

    /// A handler declares a response type that differs from the schema pairing.
    #[error("Handler {handler} declares response {declared} for {request}, schema pairs {expected}")]
    ResponseMismatch {
        /// Handler name.
        handler: String,
        /// Request tag.
        request: &'static str,
        /// Declared response tag.
        declared: &'static str,
        /// Response tag from the schema.
        expected: &'static str,
    },

    /// A handler was bound to a type of the wrong kind.
    #[error("Handler {handler} expects a {expected} but {tag} is not one")]
    WrongKind {
        /// Handler name.
        handler: String,
        /// Offending tag.
        tag: &'static str,
        /// The kind the handler needs.
        expected: &'static str,
    },

    /// The type is not part of the schema.
    #[error("Type {0} is not registered in the schema")]
    UnknownType(&'static str),
}
