//! Handler registry.
//!
//! Each message type maps to a [`HandlerEntry`]: a single RPC handler for
//! request types, an ordered subscriber list for fire-and-forget types.
//! Two paths feed it. Handler discovery hands over a list of
//! [`HandlerBinding`]s at start-up, and application code subscribes or
//! unsubscribes event callbacks at any time.

use crate::error::RegistrationError;
use crate::message::{AnyMessage, Message, MessageKind, MessageTag, Request, Response};
use crate::pool::Pooled;
use crate::schema::Schema;
use crate::session::Session;

use async_trait::async_trait;
use futures::future::BoxFuture;
use parking_lot::RwLock;
use std::any::TypeId;
use std::collections::HashMap;
use std::fmt;
use std::sync::Arc;
use tracing::{debug, warn};

/// Callback for a fire-and-forget message type.
pub type EventCallback<M> = Arc<dyn Fn(&Session, &M) -> anyhow::Result<()> + Send + Sync>;

pub(crate) type ErasedCallback =
    Arc<dyn Fn(&Session, &dyn AnyMessage) -> anyhow::Result<()> + Send + Sync>;

/// Handler for a request type.
///
/// The response instance is pre-allocated from the pool with its id already
/// set; the handler fills in the payload. Returning an error sets the
/// response's error string unless the handler set one itself. The response
/// is sent either way.
#[async_trait]
pub trait RpcMethod<Req: Request, Res: Response>: Send + Sync + 'static {
    /// Answer one request.
    async fn call(&self, session: &Session, request: &Req, response: &mut Res)
    -> anyhow::Result<()>;
}

/// A request travelling through its handler.
pub(crate) struct RpcCall {
    pub session: Session,
    pub request: Pooled<dyn AnyMessage>,
    pub response: Pooled<dyn AnyMessage>,
}

pub(crate) type ErasedRpc =
    Arc<dyn Fn(RpcCall) -> BoxFuture<'static, (RpcCall, anyhow::Result<()>)> + Send + Sync>;

fn erase_rpc<Req, Res, H>(handler: H) -> ErasedRpc
where
    Req: Request,
    Res: Response,
    H: RpcMethod<Req, Res>,
{
    let handler = Arc::new(handler);
    Arc::new(move |mut call: RpcCall| -> BoxFuture<'static, (RpcCall, anyhow::Result<()>)> {
        let handler = Arc::clone(&handler);
        Box::pin(async move {
            let result = match (
                call.request.as_any().downcast_ref::<Req>(),
                call.response.as_any_mut().downcast_mut::<Res>(),
            ) {
                (Some(request), Some(response)) => {
                    handler.call(&call.session, request, response).await
                }
                _ => Err(anyhow::anyhow!(
                    "handler for {} received mismatched message types",
                    Req::TAG
                )),
            };
            (call, result)
        })
    })
}

fn erase_callback<M: Message>(callback: EventCallback<M>) -> ErasedCallback {
    Arc::new(move |session: &Session, message: &dyn AnyMessage| {
        message
            .as_any()
            .downcast_ref::<M>()
            .map_or(Ok(()), |message| callback(session, message))
    })
}

fn callback_key<M>(callback: &EventCallback<M>) -> usize {
    Arc::as_ptr(callback).cast::<()>() as usize
}

#[derive(Clone)]
pub(crate) struct Subscriber {
    name: String,
    key: usize,
    callback: ErasedCallback,
}

#[derive(Clone)]
pub(crate) struct RpcBinding {
    name: String,
    handler: ErasedRpc,
}

/// Handlers bound to one message type.
#[derive(Clone)]
pub(crate) enum HandlerEntry {
    /// Fire-and-forget subscribers, in registration order.
    Normal(Vec<Subscriber>),
    /// The single handler of a request type.
    Rpc(RpcBinding),
}

enum BindingTarget {
    Rpc {
        request: TypeId,
        request_tag: MessageTag,
        response: TypeId,
        response_tag: MessageTag,
        handler: ErasedRpc,
    },
    Event {
        message: TypeId,
        tag: MessageTag,
        key: usize,
        callback: ErasedCallback,
    },
}

/// One discovered handler, ready to be bound.
///
/// This is what the handler-discovery step produces: a named callback, the
/// types it handles and a priority. Bindings are applied in ascending
/// priority order; ties keep their original order.
pub struct HandlerBinding {
    name: String,
    priority: i32,
    target: BindingTarget,
}

impl HandlerBinding {
    /// Binding for an RPC handler answering `Req` with `Res`.
    ///
    /// `Res` must be the response the schema pairs with `Req`; this is
    /// checked when the binding is applied.
    pub fn rpc<Req, Res, H>(name: impl Into<String>, handler: H) -> Self
    where
        Req: Request,
        Res: Response,
        H: RpcMethod<Req, Res>,
    {
        Self {
            name: name.into(),
            priority: 0,
            target: BindingTarget::Rpc {
                request: TypeId::of::<Req>(),
                request_tag: Req::TAG,
                response: TypeId::of::<Res>(),
                response_tag: Res::TAG,
                handler: erase_rpc(handler),
            },
        }
    }

    /// Binding for a fire-and-forget callback.
    pub fn event<M: Message>(name: impl Into<String>, callback: EventCallback<M>) -> Self {
        Self {
            name: name.into(),
            priority: 0,
            target: BindingTarget::Event {
                message: TypeId::of::<M>(),
                tag: M::TAG,
                key: callback_key(&callback),
                callback: erase_callback(callback),
            },
        }
    }

    /// Set the priority. Lower binds first.
    #[must_use]
    pub const fn priority(mut self, priority: i32) -> Self {
        self.priority = priority;
        self
    }

    /// Handler name.
    #[must_use]
    pub fn name(&self) -> &str {
        &self.name
    }
}

impl fmt::Debug for HandlerBinding {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let tag = match &self.target {
            BindingTarget::Rpc { request_tag, .. } => request_tag,
            BindingTarget::Event { tag, .. } => tag,
        };
        f.debug_struct("HandlerBinding")
            .field("name", &self.name)
            .field("priority", &self.priority)
            .field("tag", tag)
            .finish_non_exhaustive()
    }
}

/// Message type to handler table.
pub struct Registry {
    schema: Arc<Schema>,
    handlers: RwLock<HashMap<TypeId, HandlerEntry>>,
}

impl Registry {
    /// Create an empty registry for the types of `schema`.
    #[must_use]
    pub fn new(schema: Arc<Schema>) -> Self {
        Self {
            schema,
            handlers: RwLock::new(HashMap::new()),
        }
    }

    /// Apply discovered bindings in priority order.
    ///
    /// Invalid bindings are logged and skipped; the rejections are returned.
    pub fn bind(&self, mut bindings: Vec<HandlerBinding>) -> Vec<RegistrationError> {
        bindings.sort_by_key(|binding| binding.priority);

        let mut rejected = Vec::new();
        for binding in bindings {
            let name = binding.name.clone();
            if let Err(e) = self.bind_one(binding) {
                warn!("Skipping handler {name}: {e}");
                rejected.push(e);
            }
        }
        rejected
    }

    /// Bind an RPC handler directly.
    ///
    /// # Errors
    ///
    /// Returns an error if `Res` is not the schema's pairing for `Req`, or a
    /// handler is already bound for `Req`.
    pub fn bind_rpc<Req, Res, H>(
        &self,
        name: impl Into<String>,
        handler: H,
    ) -> Result<(), RegistrationError>
    where
        Req: Request,
        Res: Response,
        H: RpcMethod<Req, Res>,
    {
        self.bind_one(HandlerBinding::rpc(name, handler))
    }

    /// Subscribe a callback to a fire-and-forget type.
    ///
    /// Returns `Ok(false)` and logs a warning if this exact callback is
    /// already subscribed.
    ///
    /// # Errors
    ///
    /// Returns an error if `M` is not a fire-and-forget type of the schema.
    pub fn subscribe<M: Message>(
        &self,
        callback: &EventCallback<M>,
    ) -> Result<bool, RegistrationError> {
        match self.bind_one(HandlerBinding::event::<M>(
            std::any::type_name::<M>(),
            Arc::clone(callback),
        )) {
            Ok(()) => Ok(true),
            Err(RegistrationError::DuplicateSubscription(tag)) => {
                warn!("Callback already subscribed to {tag}, ignoring");
                Ok(false)
            }
            Err(e) => Err(e),
        }
    }

    /// Remove a subscribed callback. Returns `false` if it was not subscribed.
    pub fn unsubscribe<M: Message>(&self, callback: &EventCallback<M>) -> bool {
        let key = callback_key(callback);
        let mut handlers = self.handlers.write();
        let Some(HandlerEntry::Normal(subscribers)) = handlers.get_mut(&TypeId::of::<M>()) else {
            return false;
        };
        let before = subscribers.len();
        subscribers.retain(|subscriber| subscriber.key != key);
        let removed = subscribers.len() != before;
        if removed {
            debug!("Unsubscribed callback from {}", M::TAG);
        }
        removed
    }

    /// Whether an RPC handler is bound for `R`.
    #[must_use]
    pub fn has_rpc_handler<R: Request>(&self) -> bool {
        matches!(
            self.handlers.read().get(&TypeId::of::<R>()),
            Some(HandlerEntry::Rpc(_))
        )
    }

    /// Number of callbacks subscribed to `M`.
    #[must_use]
    pub fn subscriber_count<M: Message>(&self) -> usize {
        match self.handlers.read().get(&TypeId::of::<M>()) {
            Some(HandlerEntry::Normal(subscribers)) => subscribers.len(),
            _ => 0,
        }
    }

    pub(crate) fn rpc_handler(&self, request: TypeId) -> Option<ErasedRpc> {
        match self.handlers.read().get(&request) {
            Some(HandlerEntry::Rpc(binding)) => Some(Arc::clone(&binding.handler)),
            _ => None,
        }
    }

    /// Snapshot of the subscribers, so callbacks may (un)subscribe while
    /// being dispatched.
    pub(crate) fn subscribers(&self, message: TypeId) -> Vec<(String, ErasedCallback)> {
        match self.handlers.read().get(&message) {
            Some(HandlerEntry::Normal(subscribers)) => subscribers
                .iter()
                .map(|s| (s.name.clone(), Arc::clone(&s.callback)))
                .collect(),
            _ => Vec::new(),
        }
    }

    fn bind_one(&self, binding: HandlerBinding) -> Result<(), RegistrationError> {
        let HandlerBinding { name, target, .. } = binding;
        match target {
            BindingTarget::Rpc {
                request,
                request_tag,
                response,
                response_tag,
                handler,
            } => {
                let info = self
                    .schema
                    .by_type(request)
                    .ok_or(RegistrationError::UnknownType(request_tag))?;
                if !info.is_request() {
                    return Err(RegistrationError::WrongKind {
                        handler: name,
                        tag: request_tag,
                        expected: MessageKind::Request.name(),
                    });
                }
                let paired = self
                    .schema
                    .response_for(request)
                    .ok_or(RegistrationError::UnknownType(response_tag))?;
                if paired.type_id() != response {
                    return Err(RegistrationError::ResponseMismatch {
                        handler: name,
                        request: request_tag,
                        declared: response_tag,
                        expected: paired.tag(),
                    });
                }

                let mut handlers = self.handlers.write();
                if handlers.contains_key(&request) {
                    return Err(RegistrationError::DuplicateRpcHandler(request_tag));
                }
                debug!("Bound RPC handler {name} for {request_tag}");
                handlers.insert(request, HandlerEntry::Rpc(RpcBinding { name, handler }));
                Ok(())
            }
            BindingTarget::Event {
                message,
                tag,
                key,
                callback,
            } => {
                let info = self
                    .schema
                    .by_type(message)
                    .ok_or(RegistrationError::UnknownType(tag))?;
                if info.kind() != MessageKind::Message {
                    return Err(RegistrationError::WrongKind {
                        handler: name,
                        tag,
                        expected: MessageKind::Message.name(),
                    });
                }

                let mut handlers = self.handlers.write();
                let entry = handlers
                    .entry(message)
                    .or_insert_with(|| HandlerEntry::Normal(Vec::new()));
                let HandlerEntry::Normal(subscribers) = entry else {
                    return Err(RegistrationError::WrongKind {
                        handler: name,
                        tag,
                        expected: MessageKind::Message.name(),
                    });
                };
                if subscribers.iter().any(|subscriber| subscriber.key == key) {
                    return Err(RegistrationError::DuplicateSubscription(tag));
                }
                debug!("Subscribed {name} to {tag}");
                subscribers.push(Subscriber {
                    name,
                    key,
                    callback,
                });
                Ok(())
            }
        }
    }
}

impl fmt::Debug for Registry {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let handlers = self.handlers.read();
        let names: Vec<_> = handlers
            .values()
            .flat_map(|entry| match entry {
                HandlerEntry::Normal(subscribers) => {
                    subscribers.iter().map(|s| s.name.as_str()).collect()
                }
                HandlerEntry::Rpc(binding) => vec![binding.name.as_str()],
            })
            .collect();
        f.debug_struct("Registry")
            .field("handlers", &names)
            .finish_non_exhaustive()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::message::{Ping, RpcHeader};
    use serde::{Deserialize, Serialize};

    #[derive(Debug, Default, Serialize, Deserialize)]
    struct Add {
        header: RpcHeader,
        a: i64,
        b: i64,
    }

    #[derive(Debug, Default, Serialize, Deserialize)]
    struct Sum {
        header: RpcHeader,
        value: i64,
    }

    #[derive(Debug, Default, Serialize, Deserialize)]
    struct Chat {
        text: String,
    }

    crate::request!(Add => Sum, "Add");
    crate::response!(Sum, "Sum");
    crate::message!(Chat, "Chat");

    struct Adder;

    #[async_trait]
    impl RpcMethod<Add, Sum> for Adder {
        async fn call(&self, _: &Session, request: &Add, response: &mut Sum) -> anyhow::Result<()> {
            response.value = request.a + request.b;
            Ok(())
        }
    }

    struct WrongReply;

    #[async_trait]
    impl RpcMethod<Add, Ping> for WrongReply {
        async fn call(&self, _: &Session, _: &Add, _: &mut Ping) -> anyhow::Result<()> {
            Ok(())
        }
    }

    fn registry() -> Registry {
        let schema = Schema::builder()
            .request::<Add>()
            .response::<Sum>()
            .message::<Chat>()
            .build()
            .unwrap();
        Registry::new(Arc::new(schema))
    }

    #[test]
    fn test_second_rpc_handler_is_rejected() {
        let registry = registry();
        registry.bind_rpc("first", Adder).unwrap();
        assert_eq!(
            registry.bind_rpc("second", Adder),
            Err(RegistrationError::DuplicateRpcHandler("Add"))
        );
        assert!(registry.has_rpc_handler::<Add>());
    }

    #[test]
    fn test_mismatched_response_is_rejected() {
        let registry = registry();
        let rejected = registry.bind(vec![
            HandlerBinding::rpc("wrong", WrongReply),
            HandlerBinding::rpc("right", Adder),
        ]);

        assert_eq!(
            rejected,
            vec![RegistrationError::ResponseMismatch {
                handler: "wrong".to_string(),
                request: "Add",
                declared: "Ping",
                expected: "Sum",
            }]
        );
        assert!(registry.has_rpc_handler::<Add>());
    }

    #[test]
    fn test_event_binding_on_request_type_is_rejected() {
        let registry = registry();
        let callback: EventCallback<Add> = Arc::new(|_, _| Ok(()));
        let rejected = registry.bind(vec![HandlerBinding::event("misplaced", callback)]);
        assert!(matches!(
            rejected.as_slice(),
            [RegistrationError::WrongKind { tag: "Add", .. }]
        ));
    }

    #[test]
    fn test_priority_orders_subscribers() {
        let registry = registry();
        let late: EventCallback<Chat> = Arc::new(|_, _| Ok(()));
        let early: EventCallback<Chat> = Arc::new(|_, _| Ok(()));

        let rejected = registry.bind(vec![
            HandlerBinding::event("late", late).priority(10),
            HandlerBinding::event("early", early).priority(-1),
        ]);
        assert!(rejected.is_empty());

        let names: Vec<_> = registry
            .subscribers(TypeId::of::<Chat>())
            .into_iter()
            .map(|(name, _)| name)
            .collect();
        assert_eq!(names, ["early", "late"]);
    }

    #[test]
    fn test_duplicate_subscription_is_a_warning() {
        let registry = registry();
        let callback: EventCallback<Chat> = Arc::new(|_, _| Ok(()));
        let other: EventCallback<Chat> = Arc::new(|_, _| Ok(()));

        assert_eq!(registry.subscribe(&callback), Ok(true));
        assert_eq!(registry.subscribe(&callback), Ok(false));
        assert_eq!(registry.subscribe(&other), Ok(true));
        assert_eq!(registry.subscriber_count::<Chat>(), 2);

        assert!(registry.unsubscribe(&callback));
        assert!(!registry.unsubscribe(&callback));
        assert_eq!(registry.subscriber_count::<Chat>(), 1);
    }

    #[test]
    fn test_unknown_type_is_rejected() {
        #[derive(Debug, Default, Serialize, Deserialize)]
        struct Unlisted;
        crate::message!(Unlisted, "Unlisted");

        let registry = registry();
        let callback: EventCallback<Unlisted> = Arc::new(|_, _| Ok(()));
        assert_eq!(
            registry.subscribe(&callback),
            Err(RegistrationError::UnknownType("Unlisted"))
        );
    }
}
