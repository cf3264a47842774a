//! Client heartbeat: liveness, round-trip time and clock offset.

use crate::message::Ping;
use crate::registry::RpcMethod;
use crate::session::Session;

use async_trait::async_trait;
use parking_lot::Mutex;
use std::sync::Arc;
use std::time::{Duration, SystemTime, UNIX_EPOCH};
use tokio::task::JoinHandle;
use tokio::time::{Instant, sleep};
use tracing::{debug, info, warn};

/// Heartbeat settings.
#[derive(Debug, Clone)]
pub struct HeartbeatConfig {
    /// Delay between successful pings.
    pub interval: Duration,
    /// Consecutive RPC failures tolerated before the session is closed.
    pub retry_count: u32,
    /// Delay before retrying after a failed ping.
    pub retry_backoff: Duration,
    /// Whether clients run a heartbeat at all.
    pub enabled: bool,
}

impl Default for HeartbeatConfig {
    fn default() -> Self {
        Self {
            interval: Duration::from_secs(2),
            retry_count: 3,
            retry_backoff: Duration::from_millis(200),
            enabled: true,
        }
    }
}

impl HeartbeatConfig {
    /// Set the ping interval.
    #[must_use]
    pub const fn interval(mut self, interval: Duration) -> Self {
        self.interval = interval;
        self
    }

    /// Set the number of tolerated consecutive failures.
    #[must_use]
    pub const fn retry_count(mut self, count: u32) -> Self {
        self.retry_count = count;
        self
    }

    /// Set the delay before a retry.
    #[must_use]
    pub const fn retry_backoff(mut self, backoff: Duration) -> Self {
        self.retry_backoff = backoff;
        self
    }

    /// Enable or disable the heartbeat.
    #[must_use]
    pub const fn enabled(mut self, enabled: bool) -> Self {
        self.enabled = enabled;
        self
    }
}

/// What the heartbeat has measured so far.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct HeartbeatStats {
    /// Successful pings.
    pub pongs: u64,
    /// Failed pings, retried or not.
    pub failures: u64,
    /// Round-trip time of the last successful ping.
    pub last_rtt: Option<Duration>,
    /// Estimated `server clock - local clock`, in milliseconds.
    pub clock_offset_ms: i64,
}

/// Handle to a running heartbeat.
#[derive(Debug)]
pub struct Heartbeat {
    stats: Arc<Mutex<HeartbeatStats>>,
    task: JoinHandle<()>,
}

impl Heartbeat {
    /// Start pinging over `session` until it closes.
    #[must_use]
    pub fn spawn(session: Session, config: HeartbeatConfig) -> Self {
        let stats = Arc::new(Mutex::new(HeartbeatStats::default()));
        let task = session
            .context()
            .spawn(run(session.clone(), config, Arc::clone(&stats)));
        Self { stats, task }
    }

    /// Snapshot of the measurements.
    #[must_use]
    pub fn stats(&self) -> HeartbeatStats {
        *self.stats.lock()
    }

    /// Estimated server wall clock, in milliseconds since the Unix epoch.
    #[must_use]
    pub fn server_time_ms(&self) -> i64 {
        now_ms().saturating_add(self.stats.lock().clock_offset_ms)
    }

    /// Whether the heartbeat loop has ended.
    #[must_use]
    pub fn is_finished(&self) -> bool {
        self.task.is_finished()
    }

    /// Stop pinging. The session stays open.
    pub fn stop(&self) {
        self.task.abort();
    }
}

async fn run(session: Session, config: HeartbeatConfig, stats: Arc<Mutex<HeartbeatStats>>) {
    let mut failures = 0u32;
    let mut delay = config.interval;

    loop {
        tokio::select! {
            () = session.closed() => break,
            () = sleep(delay) => {}
        }

        let sent_at = Instant::now();
        let ping = Ping {
            client_time: now_ms(),
            ..Ping::default()
        };

        match session.call(ping).await {
            Ok(pong) => {
                failures = 0;
                delay = config.interval;

                let rtt = sent_at.elapsed();
                let half_rtt = i64::try_from(rtt.as_millis() / 2).unwrap_or(i64::MAX);
                let offset = pong
                    .server_time
                    .saturating_add(half_rtt)
                    .saturating_sub(now_ms());
                {
                    let mut stats = stats.lock();
                    stats.pongs += 1;
                    stats.last_rtt = Some(rtt);
                    stats.clock_offset_ms = offset;
                }
                debug!(session = %session.id(), "Heartbeat rtt {rtt:?}, clock offset {offset}ms");
                session.context().pool().recycle_typed(pong);
            }
            Err(e) if e.is_rpc() => {
                failures += 1;
                stats.lock().failures += 1;
                if failures > config.retry_count {
                    warn!(
                        session = %session.id(),
                        "Heartbeat failed {failures} times in a row, closing session: {e}"
                    );
                    session.close();
                    break;
                }
                warn!(session = %session.id(), "Heartbeat failed ({failures}/{}): {e}", config.retry_count);
                delay = config.retry_backoff;
            }
            Err(e) => {
                stats.lock().failures += 1;
                info!(session = %session.id(), "Heartbeat stopped: {e}");
                session.close();
                break;
            }
        }
    }
}

/// Built-in answer to [`Ping`]: echo the client time, stamp the server time.
pub(crate) struct PingResponder;

#[async_trait]
impl RpcMethod<Ping, Ping> for PingResponder {
    async fn call(&self, _: &Session, request: &Ping, response: &mut Ping) -> anyhow::Result<()> {
        response.client_time = request.client_time;
        response.server_time = now_ms();
        Ok(())
    }
}

/// Wall clock in milliseconds since the Unix epoch.
#[must_use]
pub fn now_ms() -> i64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map_or(0, |elapsed| i64::try_from(elapsed.as_millis()).unwrap_or(i64::MAX))
}
