//! Core message traits and types.

use crate::error::CodecError;

use serde::{Deserialize, Serialize, de::DeserializeOwned};
use std::any::{Any, TypeId};
use std::fmt::Debug;
use std::time::Duration;

/// Stable string tag identifying a message type on the wire.
pub type MessageTag = &'static str;

/// How a message type takes part in a conversation.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum MessageKind {
    /// Fire-and-forget message.
    Message,
    /// Request expecting a paired response.
    Request,
    /// Response to a request.
    Response,
    /// Self-answering heartbeat: a request on the server, a response on the client.
    Ping,
}

impl MessageKind {
    /// Human readable name, used in registration errors.
    #[must_use]
    pub const fn name(self) -> &'static str {
        match self {
            Self::Message => "message",
            Self::Request => "request",
            Self::Response => "response",
            Self::Ping => "ping",
        }
    }
}

/// Identity fields carried by requests and responses.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct RpcHeader {
    /// Request id. Responses echo the id of the request they answer.
    pub rid: u32,

    /// Error reported by the remote handler. Empty means success.
    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub error: String,

    /// Caller-specified timeout. Never sent.
    #[serde(skip)]
    pub timeout: Option<Duration>,
}

/// Base trait for every message type.
///
/// Concrete types are normally produced by the schema compiler together with
/// the [`message!`](crate::message), [`request!`](crate::request) and
/// [`response!`](crate::response) impls. `Default` doubles as the pool's reset
/// state.
pub trait Message: Serialize + DeserializeOwned + Default + Debug + Send + Sync + 'static {
    /// Wire tag for this type.
    const TAG: MessageTag;

    /// RPC identity fields, for requests and responses.
    fn header(&self) -> Option<&RpcHeader> {
        None
    }

    /// Mutable RPC identity fields, for requests and responses.
    fn header_mut(&mut self) -> Option<&mut RpcHeader> {
        None
    }
}

/// A message answered by exactly one handler with a paired response.
pub trait Request: Message {
    /// The response type the schema pairs with this request.
    type Response: Response;
}

/// A message sent back in answer to a [`Request`].
pub trait Response: Message {}

/// Type-erased view of a [`Message`], used wherever the concrete type is only
/// known from the wire tag.
pub trait AnyMessage: Any + Debug + Send + Sync {
    /// Wire tag of the concrete type.
    fn tag(&self) -> MessageTag;

    /// `TypeId` of the concrete type.
    fn message_type_id(&self) -> TypeId;

    /// RPC identity fields, if any.
    fn rpc_header(&self) -> Option<&RpcHeader>;

    /// Mutable RPC identity fields, if any.
    fn rpc_header_mut(&mut self) -> Option<&mut RpcHeader>;

    /// Serialize the payload.
    ///
    /// # Errors
    ///
    /// Returns an error if the payload cannot be serialized.
    fn encode_payload(&self) -> Result<String, CodecError>;

    /// Overwrite this instance with the decoded payload.
    ///
    /// Goes through [`Deserialize::deserialize_in_place`], so types whose impl
    /// overwrites field by field keep their `String`/`Vec` buffers. For the
    /// rest the value is replaced inside the same allocation. On error the
    /// instance may be partially overwritten and must be reset before reuse.
    ///
    /// # Errors
    ///
    /// Returns an error if the payload is not valid for this type.
    fn decode_payload(&mut self, data: &str) -> Result<(), CodecError>;

    /// Reset every field to its default.
    fn reset(&mut self);

    /// Upcast for downcasting by reference.
    fn as_any(&self) -> &(dyn Any + Send + Sync);

    /// Upcast for downcasting by mutable reference.
    fn as_any_mut(&mut self) -> &mut (dyn Any + Send + Sync);

    /// Upcast for downcasting by value.
    fn into_any(self: Box<Self>) -> Box<dyn Any + Send + Sync>;
}

impl<T: Message> AnyMessage for T {
    fn tag(&self) -> MessageTag {
        T::TAG
    }

    fn message_type_id(&self) -> TypeId {
        TypeId::of::<T>()
    }

    fn rpc_header(&self) -> Option<&RpcHeader> {
        self.header()
    }

    fn rpc_header_mut(&mut self) -> Option<&mut RpcHeader> {
        self.header_mut()
    }

    fn encode_payload(&self) -> Result<String, CodecError> {
        serde_json::to_string(self).map_err(|e| CodecError::Serialize(e.to_string()))
    }

    fn decode_payload(&mut self, data: &str) -> Result<(), CodecError> {
        let mut deserializer = serde_json::Deserializer::from_str(data);
        <T as Deserialize>::deserialize_in_place(&mut deserializer, self)
            .and_then(|()| deserializer.end())
            .map_err(|e| CodecError::Deserialize(e.to_string()))
    }

    fn reset(&mut self) {
        *self = T::default();
    }

    fn as_any(&self) -> &(dyn Any + Send + Sync) {
        self
    }

    fn as_any_mut(&mut self) -> &mut (dyn Any + Send + Sync) {
        self
    }

    fn into_any(self: Box<Self>) -> Box<dyn Any + Send + Sync> {
        self
    }
}

/// Built-in heartbeat message.
///
/// The client sends it with its local time; the server answers with the same
/// type, stamping its own time.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct Ping {
    /// RPC identity.
    pub header: RpcHeader,
    /// Client wall clock when the ping was sent (ms since the Unix epoch).
    pub client_time: i64,
    /// Server wall clock when the ping was answered (ms since the Unix epoch).
    pub server_time: i64,
}

impl Message for Ping {
    const TAG: MessageTag = "Ping";

    fn header(&self) -> Option<&RpcHeader> {
        Some(&self.header)
    }

    fn header_mut(&mut self) -> Option<&mut RpcHeader> {
        Some(&mut self.header)
    }
}

impl Request for Ping {
    type Response = Self;
}

impl Response for Ping {}

/// Implement [`Message`] for a fire-and-forget type.
///
/// ```
/// use parley_rpc::message;
/// use serde::{Deserialize, Serialize};
///
/// #[derive(Debug, Default, Serialize, Deserialize)]
/// struct Chat {
///     text: String,
/// }
///
/// message!(Chat, "Chat");
/// ```
#[macro_export]
macro_rules! message {
    ($ty:ty, $tag:literal) => {
        impl $crate::Message for $ty {
            const TAG: $crate::MessageTag = $tag;
        }
    };
}

/// Implement [`Request`] for a type with a `header: RpcHeader` field.
///
/// ```
/// use parley_rpc::{RpcHeader, request, response};
/// use serde::{Deserialize, Serialize};
///
/// #[derive(Debug, Default, Serialize, Deserialize)]
/// struct Login {
///     header: RpcHeader,
///     name: String,
/// }
///
/// #[derive(Debug, Default, Serialize, Deserialize)]
/// struct LoginReply {
///     header: RpcHeader,
///     token: u64,
/// }
///
/// request!(Login => LoginReply, "Login");
/// response!(LoginReply, "LoginReply");
/// ```
#[macro_export]
macro_rules! request {
    ($ty:ty => $response:ty, $tag:literal) => {
        impl $crate::Message for $ty {
            const TAG: $crate::MessageTag = $tag;

            fn header(&self) -> Option<&$crate::RpcHeader> {
                Some(&self.header)
            }

            fn header_mut(&mut self) -> Option<&mut $crate::RpcHeader> {
                Some(&mut self.header)
            }
        }

        impl $crate::Request for $ty {
            type Response = $response;
        }
    };
}

/// Implement [`Response`] for a type with a `header: RpcHeader` field.
#[macro_export]
macro_rules! response {
    ($ty:ty, $tag:literal) => {
        impl $crate::Message for $ty {
            const TAG: $crate::MessageTag = $tag;

            fn header(&self) -> Option<&$crate::RpcHeader> {
                Some(&self.header)
            }

            fn header_mut(&mut self) -> Option<&mut $crate::RpcHeader> {
                Some(&mut self.header)
            }
        }

        impl $crate::Response for $ty {}
    };
}
