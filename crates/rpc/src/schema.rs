//! Message type table and request/response pairing.
//!
//! The schema compiler emits the concrete message types; at start-up the
//! application lists them in a [`SchemaBuilder`]. [`SchemaBuilder::build`]
//! validates the pairing table once, so an unresolvable pairing fails before
//! any session is opened.

use crate::error::RegistrationError;
use crate::message::{AnyMessage, Message, MessageKind, MessageTag, Ping, Request, Response};

use std::any::TypeId;
use std::collections::HashMap;
use tracing::debug;

fn instantiate<T: Message>() -> Box<dyn AnyMessage> {
    Box::new(T::default())
}

/// Everything the runtime knows about one message type.
#[derive(Debug, Clone)]
pub struct TypeInfo {
    tag: MessageTag,
    type_id: TypeId,
    kind: MessageKind,
    response: Option<(MessageTag, TypeId)>,
    factory: fn() -> Box<dyn AnyMessage>,
}

impl TypeInfo {
    fn of<T: Message>(kind: MessageKind, response: Option<(MessageTag, TypeId)>) -> Self {
        Self {
            tag: T::TAG,
            type_id: TypeId::of::<T>(),
            kind,
            response,
            factory: instantiate::<T>,
        }
    }

    /// Wire tag.
    #[must_use]
    pub const fn tag(&self) -> MessageTag {
        self.tag
    }

    /// Concrete type id.
    #[must_use]
    pub const fn type_id(&self) -> TypeId {
        self.type_id
    }

    /// Message kind.
    #[must_use]
    pub const fn kind(&self) -> MessageKind {
        self.kind
    }

    /// Whether a handler may answer this type.
    #[must_use]
    pub const fn is_request(&self) -> bool {
        matches!(self.kind, MessageKind::Request | MessageKind::Ping)
    }

    /// Construct a fresh default instance.
    #[must_use]
    pub fn instantiate(&self) -> Box<dyn AnyMessage> {
        (self.factory)()
    }
}

/// Collects the message types of an application.
#[derive(Debug)]
pub struct SchemaBuilder {
    types: Vec<TypeInfo>,
}

impl SchemaBuilder {
    /// Create a builder holding only the built-in [`Ping`] type.
    #[must_use]
    pub fn new() -> Self {
        Self {
            types: vec![TypeInfo::of::<Ping>(
                MessageKind::Ping,
                Some((Ping::TAG, TypeId::of::<Ping>())),
            )],
        }
    }

    /// Register a fire-and-forget type.
    #[must_use]
    pub fn message<M: Message>(mut self) -> Self {
        self.types.push(TypeInfo::of::<M>(MessageKind::Message, None));
        self
    }

    /// Register a request type, paired with `R::Response`.
    ///
    /// The response type must be registered separately with
    /// [`response`](Self::response).
    #[must_use]
    pub fn request<R: Request>(mut self) -> Self {
        let response = (
            <R::Response as Message>::TAG,
            TypeId::of::<R::Response>(),
        );
        self.types
            .push(TypeInfo::of::<R>(MessageKind::Request, Some(response)));
        self
    }

    /// Register a response type.
    #[must_use]
    pub fn response<R: Response>(mut self) -> Self {
        self.types.push(TypeInfo::of::<R>(MessageKind::Response, None));
        self
    }

    /// Validate the table and freeze it.
    ///
    /// # Errors
    ///
    /// Returns an error if two types share a tag or a request's paired
    /// response is missing or is not a response.
    pub fn build(self) -> Result<Schema, RegistrationError> {
        let mut types: Vec<TypeInfo> = Vec::with_capacity(self.types.len());
        let mut by_tag = HashMap::new();
        let mut by_type = HashMap::new();

        for info in self.types {
            if let Some(&index) = by_tag.get(info.tag) {
                let existing: &TypeInfo = &types[index];
                if existing.type_id == info.type_id {
                    // Registered twice, nothing new.
                    continue;
                }
                return Err(RegistrationError::DuplicateTag(info.tag));
            }
            by_tag.insert(info.tag, types.len());
            by_type.insert(info.type_id, types.len());
            types.push(info);
        }

        for info in &types {
            let Some((response_tag, response_type)) = info.response else {
                continue;
            };
            let Some(&index) = by_type.get(&response_type) else {
                return Err(RegistrationError::UnmappedResponse {
                    request: info.tag,
                    response: response_tag,
                });
            };
            if !matches!(types[index].kind, MessageKind::Response | MessageKind::Ping) {
                return Err(RegistrationError::NotAResponse {
                    request: info.tag,
                    response: response_tag,
                });
            }
        }

        debug!("Schema built with {} message types", types.len());

        Ok(Schema {
            types,
            by_tag,
            by_type,
        })
    }
}

impl Default for SchemaBuilder {
    fn default() -> Self {
        Self::new()
    }
}

/// Validated, immutable message type table.
#[derive(Debug)]
pub struct Schema {
    types: Vec<TypeInfo>,
    by_tag: HashMap<MessageTag, usize>,
    by_type: HashMap<TypeId, usize>,
}

impl Schema {
    /// Start building a schema.
    #[must_use]
    pub fn builder() -> SchemaBuilder {
        SchemaBuilder::new()
    }

    /// Look a type up by wire tag.
    #[must_use]
    pub fn by_tag(&self, tag: &str) -> Option<&TypeInfo> {
        self.by_tag.get(tag).map(|&index| &self.types[index])
    }

    /// Look a type up by `TypeId`.
    #[must_use]
    pub fn by_type(&self, type_id: TypeId) -> Option<&TypeInfo> {
        self.by_type.get(&type_id).map(|&index| &self.types[index])
    }

    /// Look a type up statically.
    #[must_use]
    pub fn of<T: Message>(&self) -> Option<&TypeInfo> {
        self.by_type(TypeId::of::<T>())
    }

    /// The response type paired with a request type.
    #[must_use]
    pub fn response_for(&self, request: TypeId) -> Option<&TypeInfo> {
        let (_, response) = self.by_type(request)?.response?;
        self.by_type(response)
    }

    /// Number of registered types.
    #[must_use]
    pub fn len(&self) -> usize {
        self.types.len()
    }

    /// Whether the schema is empty. It never is: [`Ping`] is always present.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.types.is_empty()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::message::RpcHeader;
    use serde::{Deserialize, Serialize};

    #[derive(Debug, Default, Serialize, Deserialize)]
    struct Login {
        header: RpcHeader,
    }

    #[derive(Debug, Default, Serialize, Deserialize)]
    struct LoginReply {
        header: RpcHeader,
    }

    #[derive(Debug, Default, Serialize, Deserialize)]
    struct Chat {
        text: String,
    }

    #[derive(Debug, Default, Serialize, Deserialize)]
    struct OtherChat;

    crate::request!(Login => LoginReply, "Login");
    crate::response!(LoginReply, "LoginReply");
    crate::message!(Chat, "Chat");
    crate::message!(OtherChat, "Chat");

    #[test]
    fn test_pairing_resolves() {
        let schema = Schema::builder()
            .request::<Login>()
            .response::<LoginReply>()
            .message::<Chat>()
            .build()
            .unwrap();

        assert_eq!(schema.len(), 4);
        let paired = schema.response_for(TypeId::of::<Login>()).unwrap();
        assert_eq!(paired.tag(), "LoginReply");
        assert_eq!(schema.by_tag("Chat").unwrap().kind(), MessageKind::Message);
        assert_eq!(schema.of::<Ping>().unwrap().kind(), MessageKind::Ping);
    }

    #[test]
    fn test_unmapped_response_fails_fast() {
        let err = Schema::builder().request::<Login>().build().unwrap_err();
        assert_eq!(
            err,
            RegistrationError::UnmappedResponse {
                request: "Login",
                response: "LoginReply",
            }
        );
    }

    #[test]
    fn test_duplicate_tag_rejected() {
        let err = Schema::builder()
            .message::<Chat>()
            .message::<OtherChat>()
            .build()
            .unwrap_err();
        assert_eq!(err, RegistrationError::DuplicateTag("Chat"));
    }

    #[test]
    fn test_same_type_twice_is_harmless() {
        let schema = Schema::builder()
            .message::<Chat>()
            .message::<Chat>()
            .build()
            .unwrap();
        assert_eq!(schema.len(), 2);
    }

    #[test]
    fn test_instantiate_uses_default() {
        let schema = Schema::builder().message::<Chat>().build().unwrap();
        let instance = schema.by_tag("Chat").unwrap().instantiate();
        let chat = instance.as_any().downcast_ref::<Chat>().unwrap();
        assert!(chat.text.is_empty());
    }
}
