//! Server orchestration: accept loop, session set and broadcast.

use crate::context::Context;
use crate::error::{Error, Result, TransportError};
use crate::message::Message;
use crate::protocol::envelope;
use crate::session::{Session, SessionId, Side};

use dashmap::DashMap;
use std::net::SocketAddr;
use std::sync::Arc;
use tokio::net::TcpListener;
use tokio::sync::broadcast;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, instrument, warn};

/// Configuration for the server.
#[derive(Debug, Clone)]
pub struct ServerConfig {
    /// Address to listen on. Port `0` picks a free port.
    pub bind_addr: SocketAddr,
    /// Maximum concurrent sessions.
    pub max_sessions: usize,
    /// Capacity of the session event channel.
    pub event_capacity: usize,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            bind_addr: SocketAddr::from(([0, 0, 0, 0], 0)),
            max_sessions: 1024,
            event_capacity: 256,
        }
    }
}

impl ServerConfig {
    /// Set the listen address.
    #[must_use]
    pub const fn bind_addr(mut self, addr: SocketAddr) -> Self {
        self.bind_addr = addr;
        self
    }

    /// Set the session limit.
    #[must_use]
    pub const fn max_sessions(mut self, max: usize) -> Self {
        self.max_sessions = max;
        self
    }
}

/// Session membership changes.
#[derive(Debug, Clone)]
pub enum SessionEvent {
    /// A session joined the set.
    Connected(Session),
    /// A session left the set. Raised exactly once per session.
    Disconnected(Session),
}

/// The live sessions of a server.
///
/// A session is removed as soon as it closes, whatever closed it: a receive
/// failure, a failed broadcast write, or an explicit close.
#[derive(Debug)]
pub struct SessionSet {
    context: Context,
    sessions: DashMap<SessionId, Session>,
    events: broadcast::Sender<SessionEvent>,
}

impl SessionSet {
    /// Create an empty set.
    #[must_use]
    pub fn new(context: Context, event_capacity: usize) -> Arc<Self> {
        let (events, _) = broadcast::channel(event_capacity.max(1));
        Arc::new(Self {
            context,
            sessions: DashMap::new(),
            events,
        })
    }

    /// Add a session and watch it for closure.
    pub fn add(self: &Arc<Self>, session: Session) {
        self.sessions.insert(session.id(), session.clone());
        let _ = self.events.send(SessionEvent::Connected(session.clone()));

        let set = Arc::clone(self);
        self.context.spawn(async move {
            session.closed().await;
            set.remove(session.id());
        });
    }

    /// Remove a session, raising [`SessionEvent::Disconnected`] if it was
    /// still a member.
    pub fn remove(&self, id: SessionId) -> Option<Session> {
        let (_, session) = self.sessions.remove(&id)?;
        session.close();
        debug!(session = %id, "Session removed from set");
        let _ = self.events.send(SessionEvent::Disconnected(session.clone()));
        Some(session)
    }

    /// Look a session up.
    #[must_use]
    pub fn get(&self, id: SessionId) -> Option<Session> {
        self.sessions.get(&id).map(|entry| entry.value().clone())
    }

    /// Number of sessions.
    #[must_use]
    pub fn len(&self) -> usize {
        self.sessions.len()
    }

    /// Whether the set is empty.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.sessions.is_empty()
    }

    /// The sessions at this instant.
    #[must_use]
    pub fn snapshot(&self) -> Vec<Session> {
        self.sessions
            .iter()
            .map(|entry| entry.value().clone())
            .collect()
    }

    /// Subscribe to membership changes.
    #[must_use]
    pub fn subscribe(&self) -> broadcast::Receiver<SessionEvent> {
        self.events.subscribe()
    }

    /// Send a message to every session except `exclude`.
    ///
    /// The message is encoded once. A message over the configured frame size
    /// is refused before anything is written. A session whose write fails is
    /// evicted; the broadcast carries on. Returns the number of sessions
    /// reached.
    pub async fn broadcast<M: Message>(&self, message: &M, exclude: &[SessionId]) -> usize {
        let frame = match envelope::encode(message, self.context.schema()) {
            Ok(frame) => frame,
            Err(e) => {
                error!("Cannot broadcast {}: {e}", M::TAG);
                return 0;
            }
        };
        let max = self.context.config().max_frame_size;
        if frame.len() > max {
            error!(
                "Cannot broadcast {}: {} bytes exceeds the {max} byte frame limit",
                M::TAG,
                frame.len()
            );
            return 0;
        }

        let mut delivered = 0;
        for session in self.snapshot() {
            if exclude.contains(&session.id()) {
                continue;
            }
            match session.write_frame(frame.clone()).await {
                Ok(()) => delivered += 1,
                Err(e @ Error::Transport(TransportError::FrameTooLarge { .. })) => {
                    error!(session = %session.id(), "Broadcast of {} refused: {e}", M::TAG);
                }
                Err(e) => {
                    warn!(session = %session.id(), "Evicting session after failed broadcast: {e}");
                    self.remove(session.id());
                }
            }
        }
        delivered
    }

    /// Close every session.
    pub fn close_all(&self) {
        for session in self.snapshot() {
            self.remove(session.id());
        }
    }
}

/// A listening server.
#[derive(Debug)]
pub struct Server {
    local_addr: SocketAddr,
    sessions: Arc<SessionSet>,
    cancel: CancellationToken,
}

impl Server {
    /// Bind and start accepting connections.
    ///
    /// # Errors
    ///
    /// Returns an error if the listener cannot be bound.
    #[instrument(skip(context))]
    pub async fn bind(context: Context, config: ServerConfig) -> Result<Self> {
        let listener = TcpListener::bind(config.bind_addr).await?;
        let local_addr = listener.local_addr()?;
        info!("Server listening on {local_addr}");

        let sessions = SessionSet::new(context.clone(), config.event_capacity);
        let cancel = context.child_token();

        context.spawn(accept_loop(
            listener,
            context.clone(),
            Arc::clone(&sessions),
            cancel.clone(),
            config.max_sessions,
        ));

        Ok(Self {
            local_addr,
            sessions,
            cancel,
        })
    }

    /// The address actually bound.
    #[must_use]
    pub const fn local_addr(&self) -> SocketAddr {
        self.local_addr
    }

    /// Live sessions.
    #[must_use]
    pub fn sessions(&self) -> &Arc<SessionSet> {
        &self.sessions
    }

    /// Subscribe to connect/disconnect notifications.
    #[must_use]
    pub fn subscribe(&self) -> broadcast::Receiver<SessionEvent> {
        self.sessions.subscribe()
    }

    /// See [`SessionSet::broadcast`].
    pub async fn broadcast<M: Message>(&self, message: &M, exclude: &[SessionId]) -> usize {
        self.sessions.broadcast(message, exclude).await
    }

    /// Stop accepting and close every session.
    pub fn shutdown(&self) {
        info!("Server on {} shutting down", self.local_addr);
        self.cancel.cancel();
        self.sessions.close_all();
    }
}

async fn accept_loop(
    listener: TcpListener,
    context: Context,
    sessions: Arc<SessionSet>,
    cancel: CancellationToken,
    max_sessions: usize,
) {
    loop {
        tokio::select! {
            () = cancel.cancelled() => {
                debug!("Accept loop stopped");
                break;
            }
            accepted = listener.accept() => match accepted {
                Ok((stream, peer)) => {
                    if sessions.len() >= max_sessions {
                        warn!("Max sessions reached, rejecting connection from {peer}");
                        continue;
                    }
                    if let Err(e) = stream.set_nodelay(true) {
                        debug!("Failed to set TCP_NODELAY for {peer}: {e}");
                    }
                    let session = Session::start(context.clone(), stream, peer, Side::Server);
                    sessions.add(session);
                }
                Err(e) => {
                    error!("Failed to accept connection: {e}");
                }
            },
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::RpcConfig;
    use crate::schema::Schema;

    #[tokio::test]
    async fn test_remove_raises_disconnect_once() {
        let context = Context::new(Schema::builder().build().unwrap(), RpcConfig::default());
        let set = SessionSet::new(context.clone(), 16);
        let mut events = set.subscribe();

        let (local, _remote) = tokio::io::duplex(1024);
        let session = Session::start(
            context.clone(),
            local,
            SocketAddr::from(([127, 0, 0, 1], 7000)),
            Side::Server,
        );
        set.add(session.clone());
        assert!(matches!(events.recv().await, Ok(SessionEvent::Connected(_))));

        assert!(set.remove(session.id()).is_some());
        assert!(set.remove(session.id()).is_none());
        assert!(set.is_empty());

        match events.recv().await {
            Ok(SessionEvent::Disconnected(gone)) => assert_eq!(gone.id(), session.id()),
            other => panic!("unexpected event: {other:?}"),
        }
        assert!(events.try_recv().is_err());
    }
}
