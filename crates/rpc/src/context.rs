//! Runtime context.
//!
//! Owns everything that would otherwise be process-global: configuration,
//! schema, message pool, handler registry and the dispatch loop. Sessions,
//! servers and clients all hang off a [`Context`], so independent contexts
//! (one per test, say) share nothing.

use crate::config::RpcConfig;
use crate::dispatch::{Dispatch, Dispatcher};
use crate::error::{Error, RegistrationError, Result};
use crate::heartbeat::PingResponder;
use crate::pool::Pool;
use crate::registry::{HandlerBinding, Registry};
use crate::schema::Schema;

use std::fmt;
use std::future::Future;
use std::sync::Arc;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tokio_util::task::TaskTracker;
use tracing::{error, info};

struct ContextInner {
    config: RpcConfig,
    schema: Arc<Schema>,
    pool: Arc<Pool>,
    registry: Arc<Registry>,
    queue: mpsc::Sender<Dispatch>,
    cancel: CancellationToken,
    tracker: TaskTracker,
}

/// Shared runtime state. Cheap to clone.
#[derive(Clone)]
pub struct Context {
    inner: Arc<ContextInner>,
}

impl Context {
    /// Create a context and start its dispatch loop.
    ///
    /// The built-in [`Ping`](crate::Ping) handler is bound automatically.
    ///
    /// # Panics
    ///
    /// Panics if called outside a Tokio runtime.
    #[must_use]
    pub fn new(schema: Schema, config: RpcConfig) -> Self {
        let schema = Arc::new(schema);
        let pool = Arc::new(Pool::new(config.pool.clone()));
        let registry = Arc::new(Registry::new(Arc::clone(&schema)));
        if let Err(e) = registry.bind_rpc("ping", PingResponder) {
            error!("Failed to bind the ping handler: {e}");
        }

        let (queue, rx) = mpsc::channel(config.dispatch_queue_size.max(1));
        let cancel = CancellationToken::new();
        let tracker = TaskTracker::new();

        let dispatcher = Dispatcher::new(
            rx,
            Arc::clone(&schema),
            Arc::clone(&pool),
            Arc::clone(&registry),
            cancel.clone(),
        );
        tracker.spawn(dispatcher.run());

        info!("Runtime context started with {} message types", schema.len());

        Self {
            inner: Arc::new(ContextInner {
                config,
                schema,
                pool,
                registry,
                queue,
                cancel,
                tracker,
            }),
        }
    }

    /// Runtime configuration.
    #[must_use]
    pub fn config(&self) -> &RpcConfig {
        &self.inner.config
    }

    /// Message type table.
    #[must_use]
    pub fn schema(&self) -> &Schema {
        &self.inner.schema
    }

    /// Message pool.
    #[must_use]
    pub fn pool(&self) -> &Pool {
        &self.inner.pool
    }

    /// Handler registry.
    #[must_use]
    pub fn registry(&self) -> &Registry {
        &self.inner.registry
    }

    /// Apply discovered handler bindings. See [`Registry::bind`].
    pub fn bind(&self, bindings: Vec<HandlerBinding>) -> Vec<RegistrationError> {
        self.inner.registry.bind(bindings)
    }

    /// Whether [`shutdown`](Self::shutdown) has been called.
    #[must_use]
    pub fn is_shut_down(&self) -> bool {
        self.inner.cancel.is_cancelled()
    }

    /// Stop the dispatch loop and every session of this context, and wait
    /// for their tasks to finish.
    pub async fn shutdown(&self) {
        info!("Shutting down runtime context");
        self.inner.cancel.cancel();
        self.inner.tracker.close();
        self.inner.tracker.wait().await;
    }

    pub(crate) fn spawn<F>(&self, task: F) -> JoinHandle<F::Output>
    where
        F: Future + Send + 'static,
        F::Output: Send + 'static,
    {
        self.inner.tracker.spawn(task)
    }

    pub(crate) fn child_token(&self) -> CancellationToken {
        self.inner.cancel.child_token()
    }

    pub(crate) async fn enqueue(&self, item: Dispatch) -> Result<()> {
        self.inner
            .queue
            .send(item)
            .await
            .map_err(|_| Error::ChannelClosed)
    }
}

impl fmt::Debug for Context {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Context")
            .field("config", &self.inner.config)
            .field("schema", &self.inner.schema)
            .field("pool", &self.inner.pool)
            .field("shut_down", &self.is_shut_down())
            .finish_non_exhaustive()
    }
}
