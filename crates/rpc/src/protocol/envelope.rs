//! Tagged envelope around every message on the wire.
//!
//! The payload is serialized on its own and carried as a string next to the
//! type tag, so the receiver can pick the concrete type from the tag before
//! touching the payload.

use crate::error::CodecError;
use crate::message::AnyMessage;
use crate::pool::{Pool, Pooled};
use crate::schema::Schema;

use bytes::Bytes;
use serde::{Deserialize, Serialize};

/// Wire wrapper: `{ "type": <tag>, "data": <payload> }`.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Envelope {
    /// Message type tag.
    #[serde(rename = "type")]
    pub tag: String,
    /// Serialized payload.
    pub data: String,
}

/// Encode a message into envelope bytes.
///
/// The tag is taken from the schema, so types the peer cannot resolve are
/// refused here instead of on the other side.
///
/// # Errors
///
/// Returns an error if the type is not in the schema or serialization fails.
pub fn encode(message: &dyn AnyMessage, schema: &Schema) -> Result<Bytes, CodecError> {
    let info = schema
        .by_type(message.message_type_id())
        .ok_or_else(|| CodecError::UnknownTag(message.tag().to_string()))?;

    let envelope = Envelope {
        tag: info.tag().to_string(),
        data: message.encode_payload()?,
    };

    serde_json::to_vec(&envelope)
        .map(Bytes::from)
        .map_err(|e| CodecError::Serialize(e.to_string()))
}

/// Decode envelope bytes into a pooled instance of the tagged type.
///
/// # Errors
///
/// Returns an error if the envelope is malformed, the tag is unknown, or the
/// payload does not fit the tagged type.
pub fn decode(
    frame: &[u8],
    schema: &Schema,
    pool: &Pool,
) -> Result<Pooled<dyn AnyMessage>, CodecError> {
    let envelope: Envelope =
        serde_json::from_slice(frame).map_err(|e| CodecError::Deserialize(e.to_string()))?;

    let info = schema
        .by_tag(&envelope.tag)
        .ok_or(CodecError::UnknownTag(envelope.tag))?;

    let mut message = pool.allocate_erased(info);
    if let Err(e) = message.decode_payload(&envelope.data) {
        pool.recycle(message);
        return Err(e);
    }

    Ok(message)
}
