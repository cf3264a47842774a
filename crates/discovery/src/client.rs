//! Scanning side: probe the network until a server in our scope answers.

use crate::config::DiscoveryConfig;
use crate::error::Result;

use parking_lot::Mutex;
use std::net::SocketAddr;
use std::sync::Arc;
use tokio::net::UdpSocket;
use tokio::sync::Notify;
use tokio::task::JoinHandle;
use tokio::time::{Instant, MissedTickBehavior, interval, sleep_until};
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

/// Callback invoked with the session address of a discovered server.
pub type DiscoveredCallback = Arc<dyn Fn(SocketAddr) + Send + Sync>;

/// Callback invoked when a scan window passes without a valid reply.
pub type TimeoutCallback = Arc<dyn Fn() + Send + Sync>;

/// Scanner state.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ScanState {
    /// Probing and listening for replies.
    Scanning,
    /// A server was found; replies are ignored until [`DiscoveryClient::rescan`].
    Waiting,
}

struct Shared {
    config: DiscoveryConfig,
    socket: UdpSocket,
    state: Mutex<ScanState>,
    rescan: Notify,
    on_discovered: DiscoveredCallback,
    on_timeout: TimeoutCallback,
}

/// Finds a server by UDP broadcast.
pub struct DiscoveryClient {
    shared: Arc<Shared>,
    local_addr: SocketAddr,
    cancel: CancellationToken,
    task: JoinHandle<()>,
}

impl std::fmt::Debug for DiscoveryClient {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("DiscoveryClient")
            .field("scope", &self.shared.config.scope)
            .field("local_addr", &self.local_addr)
            .field("state", &self.state())
            .finish_non_exhaustive()
    }
}

impl DiscoveryClient {
    /// Bind the probe socket and start scanning.
    ///
    /// # Errors
    ///
    /// Returns an error if the socket cannot be bound or switched to
    /// broadcast mode.
    pub async fn start<D, T>(config: DiscoveryConfig, on_discovered: D, on_timeout: T) -> Result<Self>
    where
        D: Fn(SocketAddr) + Send + Sync + 'static,
        T: Fn() + Send + Sync + 'static,
    {
        let socket = UdpSocket::bind(SocketAddr::new(config.bind_addr, config.client_port)).await?;
        socket.set_broadcast(true)?;
        let local_addr = socket.local_addr()?;
        debug!("Discovery client for scope `{}` bound to {local_addr}", config.scope);

        let shared = Arc::new(Shared {
            config,
            socket,
            state: Mutex::new(ScanState::Scanning),
            rescan: Notify::new(),
            on_discovered: Arc::new(on_discovered),
            on_timeout: Arc::new(on_timeout),
        });
        let cancel = CancellationToken::new();
        let task = tokio::spawn(run(Arc::clone(&shared), cancel.clone()));

        Ok(Self {
            shared,
            local_addr,
            cancel,
            task,
        })
    }

    /// Current scanner state.
    #[must_use]
    pub fn state(&self) -> ScanState {
        *self.shared.state.lock()
    }

    /// Address of the probe socket.
    #[must_use]
    pub const fn local_addr(&self) -> SocketAddr {
        self.local_addr
    }

    /// Resume scanning with a fresh timeout window.
    pub fn rescan(&self) {
        *self.shared.state.lock() = ScanState::Scanning;
        self.shared.rescan.notify_one();
    }

    /// Stop probing and release the socket.
    pub fn stop(&self) {
        self.cancel.cancel();
    }

    /// Whether the scanner task has exited.
    #[must_use]
    pub fn is_finished(&self) -> bool {
        self.task.is_finished()
    }
}

impl Drop for DiscoveryClient {
    fn drop(&mut self) {
        self.cancel.cancel();
    }
}

async fn run(shared: Arc<Shared>, cancel: CancellationToken) {
    let config = &shared.config;
    let target = SocketAddr::new(config.broadcast_addr, config.discovery_port);
    let probe = config.scope.as_bytes();

    let mut ticker = interval(config.probe_interval);
    ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
    let mut window_start = Instant::now();
    let mut buf = [0u8; 512];

    loop {
        let scanning = *shared.state.lock() == ScanState::Scanning;
        tokio::select! {
            () = cancel.cancelled() => break,
            () = shared.rescan.notified() => {
                debug!("Rescanning for scope `{}`", config.scope);
                window_start = Instant::now();
                ticker.reset_immediately();
            }
            _ = ticker.tick(), if scanning => {
                if let Err(e) = shared.socket.send_to(probe, target).await {
                    warn!("Failed to send discovery probe to {target}: {e}");
                }
            }
            () = sleep_until(window_start + config.timeout), if scanning => {
                debug!("No server answered within {:?}", config.timeout);
                (shared.on_timeout)();
                window_start = Instant::now();
            }
            received = shared.socket.recv_from(&mut buf) => match received {
                Ok((len, from)) => handle_datagram(&shared, &buf[..len], from),
                Err(e) => warn!("Discovery receive failed: {e}"),
            },
        }
    }

    debug!("Discovery client for scope `{}` stopped", config.scope);
}

fn handle_datagram(shared: &Shared, datagram: &[u8], from: SocketAddr) {
    let Some(port) = shared.config.parse_reply(datagram) else {
        return;
    };

    {
        let mut state = shared.state.lock();
        if *state != ScanState::Scanning {
            return;
        }
        *state = ScanState::Waiting;
    }

    // Replies that queued up while we were scanning are stale.
    let mut scratch = [0u8; 512];
    while shared.socket.try_recv_from(&mut scratch).is_ok() {}

    let server = SocketAddr::new(from.ip(), port);
    info!("Discovered server for scope `{}` at {server}", shared.config.scope);
    (shared.on_discovered)(server);
}
