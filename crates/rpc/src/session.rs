//! One live connection: receive loop, send, call and close.

use crate::context::Context;
use crate::correlation::CorrelationTable;
use crate::dispatch::Dispatch;
use crate::error::{CodecError, Error, Result, RpcError, TransportError};
use crate::message::{AnyMessage, Message, MessageKind, Request};
use crate::pool::{IntoPooled, Pooled};
use crate::protocol::{FrameCodec, FrameReader, FrameWriter, envelope};
use crate::schema::TypeInfo;

use bytes::Bytes;
use std::any::TypeId;
use std::fmt;
use std::net::SocketAddr;
use std::sync::Arc;
use std::sync::atomic::{AtomicU8, AtomicU64, Ordering};
use tokio::io::{AsyncRead, AsyncWrite};
use tokio::sync::Mutex;
use tokio::time::timeout;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, instrument, warn};

static NEXT_SESSION_ID: AtomicU64 = AtomicU64::new(1);

/// Process-unique session identifier.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct SessionId(u64);

impl SessionId {
    fn next() -> Self {
        Self(NEXT_SESSION_ID.fetch_add(1, Ordering::Relaxed))
    }

    /// Raw value.
    #[must_use]
    pub const fn get(self) -> u64 {
        self.0
    }
}

impl fmt::Display for SessionId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "#{}", self.0)
    }
}

/// Which end of the connection a session lives on.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Side {
    /// Accepted by a server.
    Server,
    /// Opened by a client.
    Client,
}

/// Session lifecycle. `Closed` is terminal.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
#[repr(u8)]
pub enum SessionState {
    /// Client side only, before the receive loop runs.
    Connecting = 0,
    /// Send, call and receive are valid.
    Established = 1,
    /// Connection released.
    Closed = 2,
}

impl SessionState {
    const fn from_u8(value: u8) -> Self {
        match value {
            0 => Self::Connecting,
            1 => Self::Established,
            _ => Self::Closed,
        }
    }
}

type BoxedWriter = FrameWriter<Box<dyn AsyncWrite + Send + Unpin>>;

struct SessionInner {
    id: SessionId,
    side: Side,
    peer: SocketAddr,
    state: AtomicU8,
    context: Context,
    writer: Mutex<Option<BoxedWriter>>,
    pending: CorrelationTable,
    cancel: CancellationToken,
}

/// Handle to one connection. Cheap to clone.
#[derive(Clone)]
pub struct Session {
    inner: Arc<SessionInner>,
}

impl Session {
    /// Take over a connected stream and start its receive loop.
    ///
    /// Any duplex byte stream works; the server and client pass TCP streams.
    pub fn start<S>(context: Context, stream: S, peer: SocketAddr, side: Side) -> Self
    where
        S: AsyncRead + AsyncWrite + Send + 'static,
    {
        let (read_half, write_half) = tokio::io::split(stream);
        let codec = FrameCodec::new().with_max_frame_size(context.config().max_frame_size);
        let reader = FrameReader::new(read_half, codec, context.config().body_read_timeout);
        let writer: Box<dyn AsyncWrite + Send + Unpin> = Box::new(write_half);

        let initial = match side {
            Side::Server => SessionState::Established,
            Side::Client => SessionState::Connecting,
        };

        let session = Self {
            inner: Arc::new(SessionInner {
                id: SessionId::next(),
                side,
                peer,
                state: AtomicU8::new(initial as u8),
                writer: Mutex::new(Some(FrameWriter::new(writer, codec))),
                pending: CorrelationTable::new(),
                cancel: context.child_token(),
                context,
            }),
        };

        session
            .inner
            .context
            .spawn(session.clone().receive_loop(reader));

        // Fails only if the receive loop already closed the session.
        if side == Side::Client
            && session
                .inner
                .state
                .compare_exchange(
                    SessionState::Connecting as u8,
                    SessionState::Established as u8,
                    Ordering::AcqRel,
                    Ordering::Acquire,
                )
                .is_err()
        {
            debug!(session = %session.id(), "Session closed before it was established");
        }

        info!(session = %session.id(), %peer, ?side, "Session established");
        session
    }

    /// Session identifier.
    #[must_use]
    pub fn id(&self) -> SessionId {
        self.inner.id
    }

    /// Which side this session is on.
    #[must_use]
    pub fn side(&self) -> Side {
        self.inner.side
    }

    /// Remote endpoint.
    #[must_use]
    pub fn peer(&self) -> SocketAddr {
        self.inner.peer
    }

    /// Current lifecycle state.
    #[must_use]
    pub fn state(&self) -> SessionState {
        SessionState::from_u8(self.inner.state.load(Ordering::Acquire))
    }

    /// Whether the session is established.
    #[must_use]
    pub fn is_alive(&self) -> bool {
        self.state() == SessionState::Established
    }

    /// Number of calls waiting for a response.
    #[must_use]
    pub fn pending_calls(&self) -> usize {
        self.inner.pending.len()
    }

    /// The runtime context this session belongs to.
    #[must_use]
    pub fn context(&self) -> &Context {
        &self.inner.context
    }

    /// Wait until the session closes.
    pub async fn closed(&self) {
        self.inner.cancel.cancelled().await;
    }

    /// Send a fire-and-forget message.
    ///
    /// The message goes back to the pool once encoded.
    ///
    /// # Errors
    ///
    /// Returns an error if the session is not established or the write
    /// fails. A failed write closes the session.
    pub async fn send<M: IntoPooled>(&self, message: M) -> Result<()> {
        let message = message.into_pooled().erase();
        let result = self.send_erased(&*message).await;
        self.inner.context.pool().recycle(message);
        result
    }

    /// Send a request and wait for its response.
    ///
    /// Waits at most the request's timeout (or the configured default),
    /// never less than the configured minimum. The request goes back to the
    /// pool once the call resolves.
    ///
    /// # Errors
    ///
    /// - [`RpcError::TypeMismatch`] / [`RpcError::Unregistered`] if the
    ///   schema does not pair the request with the expected response; the
    ///   request is not sent.
    /// - [`RpcError::Timeout`] if no response arrived in time.
    /// - [`RpcError::Remote`] if the remote handler reported an error.
    /// - [`RpcError::Cancelled`] if the session closed first.
    /// - Transport or codec errors if the request could not be sent.
    pub async fn call<Q>(&self, request: Q) -> Result<Pooled<<Q::Message as Request>::Response>>
    where
        Q: IntoPooled,
        Q::Message: Request,
    {
        self.call_pooled(request.into_pooled()).await
    }

    /// Close the session.
    ///
    /// Fails every pending call with [`RpcError::Cancelled`] and stops the
    /// receive loop, which releases the connection. Returns `false` if the
    /// session was already closed.
    pub fn close(&self) -> bool {
        let previous = SessionState::from_u8(
            self.inner
                .state
                .swap(SessionState::Closed as u8, Ordering::AcqRel),
        );
        if previous == SessionState::Closed {
            return false;
        }

        self.inner.cancel.cancel();
        self.inner.pending.fail_all(&RpcError::Cancelled);
        info!(session = %self.id(), peer = %self.peer(), "Session closed");
        true
    }

    #[instrument(skip(self, request), fields(session = %self.id(), request = R::TAG))]
    async fn call_pooled<R: Request>(&self, mut request: Pooled<R>) -> Result<Pooled<R::Response>> {
        let context = &self.inner.context;
        let pool = context.pool();

        let expected = context
            .schema()
            .response_for(TypeId::of::<R>())
            .ok_or(RpcError::Unregistered(R::TAG))?;
        if expected.type_id() != TypeId::of::<R::Response>() {
            return Err(RpcError::TypeMismatch {
                request: R::TAG,
                expected: expected.tag(),
                actual: <R::Response as Message>::TAG,
            }
            .into());
        }
        self.ensure_established()?;

        let wait = context
            .config()
            .effective_timeout(request.header().and_then(|header| header.timeout));
        let (rid, mut rx) = self.inner.pending.register(R::TAG);
        if let Some(header) = request.header_mut() {
            header.rid = rid;
        }

        // A close that raced with registration has already drained the table.
        if !self.is_alive() {
            self.inner.pending.cancel(rid);
            pool.recycle_typed(request);
            return Err(RpcError::Cancelled.into());
        }

        debug!(rid, "Sending request, waiting up to {wait:?}");
        if let Err(e) = self.send_erased(&*request).await {
            self.inner.pending.cancel(rid);
            pool.recycle_typed(request);
            return Err(e);
        }

        let completion = match timeout(wait, &mut rx).await {
            Ok(Ok(completion)) => completion,
            Ok(Err(_)) => Err(RpcError::Cancelled),
            Err(_) => {
                if self.inner.pending.cancel(rid) {
                    warn!(rid, "Call timed out after {wait:?}");
                    Err(RpcError::Timeout(wait))
                } else {
                    // Resolved while the timer fired.
                    rx.await.unwrap_or(Err(RpcError::Cancelled))
                }
            }
        };
        pool.recycle_typed(request);

        let response = completion?;
        let actual = response.tag();
        let Some(response) = response.downcast::<R::Response>() else {
            return Err(CodecError::UnexpectedResponse {
                expected: <R::Response as Message>::TAG,
                actual,
            }
            .into());
        };

        match response.header().map(|header| header.error.as_str()) {
            Some(error) if !error.is_empty() => {
                let error = error.to_string();
                pool.recycle_typed(response);
                Err(RpcError::Remote(error).into())
            }
            _ => Ok(response),
        }
    }

    pub(crate) async fn send_erased(&self, message: &dyn AnyMessage) -> Result<()> {
        self.ensure_established()?;
        let frame = envelope::encode(message, self.inner.context.schema())?;
        self.write_frame(frame).await
    }

    /// Write an already encoded envelope.
    pub(crate) async fn write_frame(&self, frame: Bytes) -> Result<()> {
        self.ensure_established()?;

        let mut writer = self.inner.writer.lock().await;
        let Some(frame_writer) = writer.as_mut() else {
            return Err(Error::NotEstablished(SessionState::Closed));
        };

        match frame_writer.write_frame(frame).await {
            Ok(()) => Ok(()),
            Err(e @ TransportError::FrameTooLarge { .. }) => Err(e.into()),
            Err(e) => {
                drop(writer);
                warn!(session = %self.id(), "Send failed: {e}");
                self.close();
                Err(e.into())
            }
        }
    }

    fn ensure_established(&self) -> Result<()> {
        match self.state() {
            SessionState::Established => Ok(()),
            state => Err(Error::NotEstablished(state)),
        }
    }

    async fn receive_loop<R: AsyncRead + Unpin>(self, mut reader: FrameReader<R>) {
        let result = loop {
            let frame = tokio::select! {
                () = self.inner.cancel.cancelled() => break Ok(()),
                frame = reader.read_frame() => frame,
            };

            let handled = match frame {
                Ok(frame) => self.handle_frame(&frame).await,
                Err(e) => Err(e.into()),
            };
            if let Err(e) = handled {
                break Err(e);
            }
        };

        match result {
            Ok(()) => debug!(session = %self.id(), "Receive loop stopped"),
            Err(Error::Transport(TransportError::PeerClosed)) => {
                info!(session = %self.id(), "Connection closed by peer");
            }
            Err(e) => warn!(session = %self.id(), "Receive loop failed: {e}"),
        }

        self.close();
        drop(reader);
        if let Some(mut writer) = self.inner.writer.lock().await.take() {
            let _ = writer.shutdown().await;
        }
    }

    async fn handle_frame(&self, frame: &[u8]) -> Result<()> {
        let context = &self.inner.context;
        let message = envelope::decode(frame, context.schema(), context.pool())?;
        let kind = context
            .schema()
            .by_type(message.message_type_id())
            .map_or(MessageKind::Message, TypeInfo::kind);

        match (kind, self.inner.side) {
            (MessageKind::Response, _) | (MessageKind::Ping, Side::Client) => {
                self.complete(message);
                Ok(())
            }
            (MessageKind::Request, _) | (MessageKind::Ping, Side::Server) => {
                context
                    .enqueue(Dispatch::Request {
                        session: self.clone(),
                        message,
                    })
                    .await
            }
            (MessageKind::Message, _) => {
                context
                    .enqueue(Dispatch::Event {
                        session: self.clone(),
                        message,
                    })
                    .await
            }
        }
    }

    fn complete(&self, response: Pooled<dyn AnyMessage>) {
        let rid = response.rpc_header().map_or(0, |header| header.rid);
        if let Some(unclaimed) = self.inner.pending.resolve(rid, response) {
            debug!(session = %self.id(), rid, "Dropping unmatched {}", unclaimed.tag());
            self.inner.context.pool().recycle(unclaimed);
        }
    }
}

impl fmt::Debug for Session {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Session")
            .field("id", &self.inner.id)
            .field("side", &self.inner.side)
            .field("peer", &self.inner.peer)
            .field("state", &self.state())
            .field("pending", &self.inner.pending.len())
            .finish_non_exhaustive()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::RpcConfig;
    use crate::message::{Ping, RpcHeader};
    use crate::schema::Schema;
    use serde::{Deserialize, Serialize};
    use std::time::Duration;
    use tokio::io::{DuplexStream, duplex};

    #[derive(Debug, Default, Serialize, Deserialize)]
    struct Slow {
        header: RpcHeader,
    }

    #[derive(Debug, Default, Serialize, Deserialize)]
    struct SlowReply {
        header: RpcHeader,
    }

    crate::request!(Slow => SlowReply, "Slow");
    crate::response!(SlowReply, "SlowReply");

    fn peer() -> SocketAddr {
        SocketAddr::from(([127, 0, 0, 1], 9000))
    }

    fn context(config: RpcConfig) -> Context {
        let schema = Schema::builder()
            .request::<Slow>()
            .response::<SlowReply>()
            .build()
            .unwrap();
        Context::new(schema, config)
    }

    /// A client session whose peer reads frames and never answers.
    fn silent_client(context: &Context) -> (Session, DuplexStream) {
        let (local, remote) = duplex(64 * 1024);
        let session = Session::start(context.clone(), local, peer(), Side::Client);
        (session, remote)
    }

    #[tokio::test(start_paused = true)]
    async fn test_timeout_is_floored_to_minimum() {
        let config = RpcConfig::default().min_rpc_timeout(Duration::from_secs(3));
        let context = context(config);
        let (session, _remote) = silent_client(&context);

        let mut request = Slow::default();
        request.header.timeout = Some(Duration::from_millis(50));

        let started = tokio::time::Instant::now();
        let err = session.call(request).await.unwrap_err();
        assert!(err.is_timeout());
        assert!(started.elapsed() >= Duration::from_secs(3));
        assert_eq!(session.pending_calls(), 0);
        assert!(session.is_alive());
    }

    #[tokio::test]
    async fn test_close_cancels_pending_and_is_idempotent() {
        let context = context(RpcConfig::default());
        let (session, _remote) = silent_client(&context);

        let caller = {
            let session = session.clone();
            tokio::spawn(async move { session.call(Slow::default()).await })
        };
        while session.pending_calls() == 0 {
            tokio::task::yield_now().await;
        }

        assert!(session.close());
        assert!(!session.close());
        assert_eq!(session.state(), SessionState::Closed);

        let err = caller.await.unwrap().unwrap_err();
        assert!(matches!(err, Error::Rpc(RpcError::Cancelled)));
        assert_eq!(session.pending_calls(), 0);

        assert!(matches!(
            session.send(Ping::default()).await,
            Err(Error::NotEstablished(SessionState::Closed))
        ));
    }

    #[tokio::test]
    async fn test_peer_hangup_closes_session() {
        let context = context(RpcConfig::default());
        let (session, remote) = silent_client(&context);
        assert!(session.is_alive());

        drop(remote);
        session.closed().await;
        assert_eq!(session.state(), SessionState::Closed);
    }

    #[tokio::test]
    async fn test_garbage_frame_closes_session() {
        use tokio::io::AsyncWriteExt;

        let context = context(RpcConfig::default());
        let (session, mut remote) = silent_client(&context);

        let body = b"not an envelope";
        remote
            .write_all(&u32::try_from(body.len()).unwrap().to_le_bytes())
            .await
            .unwrap();
        remote.write_all(body).await.unwrap();

        session.closed().await;
        assert!(!session.is_alive());
    }

    #[tokio::test]
    async fn test_unregistered_request_is_not_sent() {
        #[derive(Debug, Default, Serialize, Deserialize)]
        struct Unknown {
            header: RpcHeader,
        }
        crate::request!(Unknown => SlowReply, "Unknown");

        let context = context(RpcConfig::default());
        let (session, _remote) = silent_client(&context);

        let err = session.call(Unknown::default()).await.unwrap_err();
        assert!(matches!(err, Error::Rpc(RpcError::Unregistered("Unknown"))));
        assert_eq!(session.pending_calls(), 0);
    }
}
