//! Client orchestration: connect, start the session, start the heartbeat.

use crate::context::Context;
use crate::error::{Error, Result};
use crate::heartbeat::{Heartbeat, HeartbeatConfig};
use crate::message::Request;
use crate::pool::{IntoPooled, Pooled};
use crate::session::{Session, Side};

use std::net::SocketAddr;
use std::time::Duration;
use tokio::net::TcpStream;
use tokio::time::timeout;
use tracing::{debug, info, instrument};

/// Configuration for the client.
#[derive(Debug, Clone)]
pub struct ClientConfig {
    /// How long to wait for the TCP connection.
    pub connect_timeout: Duration,
    /// Heartbeat settings.
    pub heartbeat: HeartbeatConfig,
}

impl Default for ClientConfig {
    fn default() -> Self {
        Self {
            connect_timeout: Duration::from_secs(5),
            heartbeat: HeartbeatConfig::default(),
        }
    }
}

impl ClientConfig {
    /// Set the connect timeout.
    #[must_use]
    pub const fn connect_timeout(mut self, timeout: Duration) -> Self {
        self.connect_timeout = timeout;
        self
    }

    /// Replace the heartbeat settings.
    #[must_use]
    pub fn heartbeat(mut self, heartbeat: HeartbeatConfig) -> Self {
        self.heartbeat = heartbeat;
        self
    }
}

/// A connected client.
#[derive(Debug)]
pub struct Client {
    session: Session,
    heartbeat: Option<Heartbeat>,
}

impl Client {
    /// Connect to a server.
    ///
    /// # Errors
    ///
    /// Returns an error if the connection fails or times out.
    #[instrument(skip(context, config))]
    pub async fn connect(context: Context, addr: SocketAddr, config: ClientConfig) -> Result<Self> {
        debug!("Connecting to {addr}");
        let stream = timeout(config.connect_timeout, TcpStream::connect(addr))
            .await
            .map_err(|_| Error::ConnectTimeout {
                addr,
                timeout: config.connect_timeout,
            })??;
        if let Err(e) = stream.set_nodelay(true) {
            debug!("Failed to set TCP_NODELAY: {e}");
        }

        let session = Session::start(context, stream, addr, Side::Client);
        let heartbeat = config
            .heartbeat
            .enabled
            .then(|| Heartbeat::spawn(session.clone(), config.heartbeat.clone()));

        info!("Connected to {addr}");
        Ok(Self { session, heartbeat })
    }

    /// The client's session.
    #[must_use]
    pub const fn session(&self) -> &Session {
        &self.session
    }

    /// The running heartbeat, if enabled.
    #[must_use]
    pub const fn heartbeat(&self) -> Option<&Heartbeat> {
        self.heartbeat.as_ref()
    }

    /// See [`Session::send`].
    ///
    /// # Errors
    ///
    /// See [`Session::send`].
    pub async fn send<M: IntoPooled>(&self, message: M) -> Result<()> {
        self.session.send(message).await
    }

    /// See [`Session::call`].
    ///
    /// # Errors
    ///
    /// See [`Session::call`].
    pub async fn call<Q>(&self, request: Q) -> Result<Pooled<<Q::Message as Request>::Response>>
    where
        Q: IntoPooled,
        Q::Message: Request,
    {
        self.session.call(request).await
    }

    /// Close the connection.
    pub fn close(&self) {
        if let Some(heartbeat) = &self.heartbeat {
            heartbeat.stop();
        }
        self.session.close();
    }
}
