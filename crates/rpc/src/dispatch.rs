//! Single-consumer dispatch loop.
//!
//! Receive loops of every session push decoded messages into one queue. One
//! task drains it: event callbacks run inline, in subscription order, and RPC
//! handler futures are polled on the same task. Handler code therefore never
//! runs in parallel with other handler code or with itself.

use crate::message::AnyMessage;
use crate::pool::{Pool, Pooled};
use crate::registry::{Registry, RpcCall};
use crate::schema::Schema;
use crate::session::Session;

use futures::future::BoxFuture;
use futures::stream::FuturesUnordered;
use futures::{FutureExt, StreamExt};
use std::any::Any;
use std::panic::{self, AssertUnwindSafe};
use std::sync::Arc;
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, warn};

/// Work item for the dispatcher.
pub(crate) enum Dispatch {
    /// A request to answer.
    Request {
        session: Session,
        message: Pooled<dyn AnyMessage>,
    },
    /// A fire-and-forget message for the subscribers.
    Event {
        session: Session,
        message: Pooled<dyn AnyMessage>,
    },
}

pub(crate) struct Dispatcher {
    queue: mpsc::Receiver<Dispatch>,
    schema: Arc<Schema>,
    pool: Arc<Pool>,
    registry: Arc<Registry>,
    cancel: CancellationToken,
}

impl Dispatcher {
    pub(crate) const fn new(
        queue: mpsc::Receiver<Dispatch>,
        schema: Arc<Schema>,
        pool: Arc<Pool>,
        registry: Arc<Registry>,
        cancel: CancellationToken,
    ) -> Self {
        Self {
            queue,
            schema,
            pool,
            registry,
            cancel,
        }
    }

    pub(crate) async fn run(mut self) {
        let mut in_flight: FuturesUnordered<BoxFuture<'static, ()>> = FuturesUnordered::new();
        debug!("Dispatcher started");

        loop {
            tokio::select! {
                () = self.cancel.cancelled() => break,
                Some(()) = in_flight.next(), if !in_flight.is_empty() => {}
                item = self.queue.recv() => match item {
                    Some(Dispatch::Request { session, message }) => {
                        in_flight.push(self.request(session, message));
                    }
                    Some(Dispatch::Event { session, message }) => {
                        self.event(&session, message);
                    }
                    None => {
                        while in_flight.next().await.is_some() {}
                        break;
                    }
                },
            }
        }

        debug!("Dispatcher stopped, {} handlers abandoned", in_flight.len());
    }

    fn request(&self, session: Session, request: Pooled<dyn AnyMessage>) -> BoxFuture<'static, ()> {
        let pool = Arc::clone(&self.pool);
        let tag = request.tag();
        let rid = request.rpc_header().map_or(0, |header| header.rid);

        let Some(paired) = self.schema.response_for(request.message_type_id()).cloned() else {
            warn!(rid, "Dropping request {tag}: no paired response type");
            pool.recycle(request);
            return Box::pin(async {});
        };

        let mut response = pool.allocate_erased(&paired);
        set_rid(&mut response, rid);

        let Some(handler) = self.registry.rpc_handler(request.message_type_id()) else {
            warn!(rid, session = %session.id(), "No handler registered for request {tag}");
            set_error(&mut response, format!("no handler registered for request `{tag}`"));
            pool.recycle(request);
            return Box::pin(respond(session, response, pool));
        };

        Box::pin(async move {
            let call = RpcCall {
                session: session.clone(),
                request,
                response,
            };

            match AssertUnwindSafe(handler(call)).catch_unwind().await {
                Ok((call, result)) => {
                    let RpcCall {
                        request,
                        mut response,
                        ..
                    } = call;
                    if let Err(e) = result {
                        debug!(rid, "Handler for {tag} failed: {e:#}");
                        set_error(&mut response, format!("{e:#}"));
                    }
                    pool.recycle(request);
                    respond(session, response, pool).await;
                }
                Err(panic) => {
                    let reason = panic_message(&*panic).to_string();
                    error!(rid, "Handler for {tag} panicked: {reason}");
                    let mut response = pool.allocate_erased(&paired);
                    set_rid(&mut response, rid);
                    set_error(&mut response, format!("handler for `{tag}` panicked: {reason}"));
                    respond(session, response, pool).await;
                }
            }
        })
    }

    fn event(&self, session: &Session, message: Pooled<dyn AnyMessage>) {
        let subscribers = self.registry.subscribers(message.message_type_id());
        if subscribers.is_empty() {
            debug!("No subscribers for {}", message.tag());
        }

        for (name, callback) in subscribers {
            match panic::catch_unwind(AssertUnwindSafe(|| callback(session, &*message))) {
                Ok(Ok(())) => {}
                Ok(Err(e)) => warn!("Subscriber {name} failed on {}: {e:#}", message.tag()),
                Err(panic) => error!(
                    "Subscriber {name} panicked on {}: {}",
                    message.tag(),
                    panic_message(&*panic)
                ),
            }
        }

        self.pool.recycle(message);
    }
}

async fn respond(session: Session, response: Pooled<dyn AnyMessage>, pool: Arc<Pool>) {
    if let Err(e) = session.send_erased(&*response).await {
        debug!(session = %session.id(), "Could not send {}: {e}", response.tag());
    }
    pool.recycle(response);
}

fn set_rid(response: &mut Pooled<dyn AnyMessage>, rid: u32) {
    if let Some(header) = response.rpc_header_mut() {
        header.rid = rid;
    }
}

/// Record an error unless the handler already recorded its own.
fn set_error(response: &mut Pooled<dyn AnyMessage>, error: String) {
    if let Some(header) = response.rpc_header_mut() {
        if header.error.is_empty() {
            header.error = error;
        }
    }
}

fn panic_message(panic: &(dyn Any + Send)) -> &str {
    panic
        .downcast_ref::<&str>()
        .copied()
        .or_else(|| panic.downcast_ref::<String>().map(String::as_str))
        .unwrap_or("unknown panic")
}
