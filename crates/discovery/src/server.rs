//! Answering side: reply to probes and announce the session port.

use crate::config::DiscoveryConfig;
use crate::error::Result;

use std::net::SocketAddr;
use tokio::net::UdpSocket;
use tokio::task::JoinHandle;
use tokio::time::{MissedTickBehavior, interval};
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, trace, warn};

/// Makes a session server findable by [`DiscoveryClient`](crate::DiscoveryClient).
#[derive(Debug)]
pub struct DiscoveryServer {
    local_addr: SocketAddr,
    cancel: CancellationToken,
    task: JoinHandle<()>,
}

impl DiscoveryServer {
    /// Bind the discovery port and start answering for `session_port`.
    ///
    /// # Errors
    ///
    /// Returns an error if the socket cannot be bound or switched to
    /// broadcast mode.
    pub async fn start(config: DiscoveryConfig, session_port: u16) -> Result<Self> {
        let socket = UdpSocket::bind(SocketAddr::new(config.bind_addr, config.discovery_port)).await?;
        socket.set_broadcast(true)?;
        let local_addr = socket.local_addr()?;
        info!(
            "Discovery server for scope `{}` listening on {local_addr}, session port {session_port}",
            config.scope
        );

        let cancel = CancellationToken::new();
        let task = tokio::spawn(run(socket, config, session_port, cancel.clone()));

        Ok(Self {
            local_addr,
            cancel,
            task,
        })
    }

    /// Address of the discovery socket.
    #[must_use]
    pub const fn local_addr(&self) -> SocketAddr {
        self.local_addr
    }

    /// Stop answering.
    pub fn stop(&self) {
        self.cancel.cancel();
    }

    /// Whether the server task has exited.
    #[must_use]
    pub fn is_finished(&self) -> bool {
        self.task.is_finished()
    }
}

impl Drop for DiscoveryServer {
    fn drop(&mut self) {
        self.cancel.cancel();
    }
}

async fn run(
    socket: UdpSocket,
    config: DiscoveryConfig,
    session_port: u16,
    cancel: CancellationToken,
) {
    let reply = config.reply(session_port);
    let announce_to = (config.client_port != 0)
        .then(|| SocketAddr::new(config.broadcast_addr, config.client_port));

    let mut ticker = interval(config.announce_interval);
    ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
    let mut buf = [0u8; 512];

    loop {
        tokio::select! {
            () = cancel.cancelled() => break,
            _ = ticker.tick(), if announce_to.is_some() => {
                if let Some(target) = announce_to {
                    if let Err(e) = socket.send_to(reply.as_bytes(), target).await {
                        warn!("Failed to announce to {target}: {e}");
                    }
                }
            }
            received = socket.recv_from(&mut buf) => match received {
                Ok((len, from)) if config.is_probe(&buf[..len]) => {
                    trace!("Probe from {from}");
                    if let Err(e) = socket.send_to(reply.as_bytes(), from).await {
                        warn!("Failed to answer probe from {from}: {e}");
                    }
                }
                Ok(_) => {}
                Err(e) => warn!("Discovery receive failed: {e}"),
            },
        }
    }

    debug!("Discovery server for scope `{}` stopped", config.scope);
}
