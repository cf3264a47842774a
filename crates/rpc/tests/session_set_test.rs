//! Session set and heartbeat tests over in-memory streams

use parley_rpc::protocol::{FrameCodec, FrameReader, FrameWriter, envelope};
use parley_rpc::{
    AnyMessage, Context, Heartbeat, HeartbeatConfig, Ping, RpcConfig, RpcHeader, Schema, Session,
    SessionEvent, SessionSet, SessionState, Side, message, response,
};
use serde::{Deserialize, Serialize};
use std::io;
use std::net::SocketAddr;
use std::pin::Pin;
use std::task::{Context as TaskContext, Poll};
use std::time::Duration;
use tokio::io::{AsyncRead, AsyncWrite, DuplexStream, ReadBuf, duplex};
use tokio::time::timeout;

#[derive(Debug, Default, Serialize, Deserialize)]
struct Notice {
    text: String,
}

#[derive(Debug, Default, Serialize, Deserialize)]
struct Receipt {
    header: RpcHeader,
}

message!(Notice, "Notice");
response!(Receipt, "Receipt");

/// A connection whose write side is gone but whose read side never reports it.
struct Severed;

impl AsyncRead for Severed {
    fn poll_read(
        self: Pin<&mut Self>,
        _: &mut TaskContext<'_>,
        _: &mut ReadBuf<'_>,
    ) -> Poll<io::Result<()>> {
        Poll::Pending
    }
}

impl AsyncWrite for Severed {
    fn poll_write(
        self: Pin<&mut Self>,
        _: &mut TaskContext<'_>,
        _: &[u8],
    ) -> Poll<io::Result<usize>> {
        Poll::Ready(Err(io::ErrorKind::BrokenPipe.into()))
    }

    fn poll_flush(self: Pin<&mut Self>, _: &mut TaskContext<'_>) -> Poll<io::Result<()>> {
        Poll::Ready(Ok(()))
    }

    fn poll_shutdown(self: Pin<&mut Self>, _: &mut TaskContext<'_>) -> Poll<io::Result<()>> {
        Poll::Ready(Ok(()))
    }
}

fn context() -> Context {
    context_with(RpcConfig::default())
}

fn context_with(config: RpcConfig) -> Context {
    let schema = Schema::builder()
        .message::<Notice>()
        .response::<Receipt>()
        .build()
        .expect("schema is valid");
    Context::new(schema, config)
}

fn peer(port: u16) -> SocketAddr {
    SocketAddr::from(([127, 0, 0, 1], port))
}

fn accepted(context: &Context, port: u16) -> (Session, DuplexStream) {
    let (local, remote) = duplex(64 * 1024);
    let session = Session::start(context.clone(), local, peer(port), Side::Server);
    (session, remote)
}

async fn receive_notice(context: &Context, remote: DuplexStream) -> String {
    let mut reader = FrameReader::new(remote, FrameCodec::new(), Duration::from_secs(8));
    let frame = reader.read_frame().await.expect("Frame expected");
    let message = envelope::decode(&frame, context.schema(), context.pool())
        .expect("Valid envelope")
        .downcast::<Notice>()
        .expect("Notice expected");
    message.text.clone()
}

#[tokio::test]
async fn test_broadcast_evicts_severed_session() {
    let _ = tracing_subscriber::fmt::try_init();

    let context = context();
    let set = SessionSet::new(context.clone(), 16);
    let mut events = set.subscribe();

    let (first, first_remote) = accepted(&context, 4001);
    let (second, second_remote) = accepted(&context, 4002);
    let broken = Session::start(context.clone(), Severed, peer(4003), Side::Server);

    for session in [&first, &second, &broken] {
        set.add(session.clone());
    }
    for _ in 0..3 {
        assert!(matches!(
            events.recv().await,
            Ok(SessionEvent::Connected(_))
        ));
    }

    let delivered = set
        .broadcast(
            &Notice {
                text: "hello".to_string(),
            },
            &[],
        )
        .await;
    assert_eq!(delivered, 2);

    assert_eq!(receive_notice(&context, first_remote).await, "hello");
    assert_eq!(receive_notice(&context, second_remote).await, "hello");

    match events.recv().await {
        Ok(SessionEvent::Disconnected(session)) => assert_eq!(session.id(), broken.id()),
        other => panic!("unexpected event: {other:?}"),
    }
    assert_eq!(broken.state(), SessionState::Closed);

    // Let the closure watcher run; it must not report the eviction again.
    tokio::time::sleep(Duration::from_millis(50)).await;
    assert!(events.try_recv().is_err());
    assert_eq!(set.len(), 2);
    assert!(set.get(broken.id()).is_none());
    assert!(first.is_alive() && second.is_alive());
}

/// Plays the server end of a client session: every ping is answered with
/// whatever `reply` builds from it.
async fn answer_pings(
    context: Context,
    remote: DuplexStream,
    reply: fn(&Ping) -> Box<dyn AnyMessage>,
) {
    let (read_half, write_half) = tokio::io::split(remote);
    let mut reader = FrameReader::new(read_half, FrameCodec::new(), Duration::from_secs(8));
    let mut writer = FrameWriter::new(write_half, FrameCodec::new());

    while let Ok(frame) = reader.read_frame().await {
        let Some(ping) = envelope::decode(&frame, context.schema(), context.pool())
            .ok()
            .and_then(|message| message.downcast::<Ping>())
        else {
            break;
        };
        let Ok(answer) = envelope::encode(&*reply(&ping), context.schema()) else {
            break;
        };
        if writer.write_frame(answer).await.is_err() {
            break;
        }
    }
}

fn echo_header(ping: &Ping) -> RpcHeader {
    RpcHeader {
        rid: ping.header.rid,
        ..RpcHeader::default()
    }
}

#[tokio::test]
async fn test_oversized_broadcast_keeps_sessions() {
    let _ = tracing_subscriber::fmt::try_init();

    let context = context_with(RpcConfig::default().max_frame_size(64));
    let set = SessionSet::new(context.clone(), 16);
    let mut events = set.subscribe();

    let sessions: Vec<_> = (0..3).map(|i| accepted(&context, 8000 + i)).collect();
    for (session, _) in &sessions {
        set.add(session.clone());
    }
    for _ in 0..3 {
        assert!(matches!(
            events.recv().await,
            Ok(SessionEvent::Connected(_))
        ));
    }

    let delivered = set
        .broadcast(
            &Notice {
                text: "x".repeat(200),
            },
            &[],
        )
        .await;
    assert_eq!(delivered, 0);
    assert_eq!(set.len(), 3);
    assert!(sessions.iter().all(|(session, _)| session.is_alive()));

    tokio::time::sleep(Duration::from_millis(50)).await;
    assert!(events.try_recv().is_err());

    let delivered = set
        .broadcast(
            &Notice {
                text: "ok".to_string(),
            },
            &[],
        )
        .await;
    assert_eq!(delivered, 3);
}

#[tokio::test]
async fn test_heartbeat_survives_absurd_server_time() {
    let _ = tracing_subscriber::fmt::try_init();

    let context = context();
    let (local, remote) = duplex(64 * 1024);
    let session = Session::start(context.clone(), local, peer(7002), Side::Client);
    tokio::spawn(answer_pings(context.clone(), remote, |ping| {
        Box::new(Ping {
            header: echo_header(ping),
            client_time: ping.client_time,
            server_time: i64::MIN,
        })
    }));

    let heartbeat = Heartbeat::spawn(
        session.clone(),
        HeartbeatConfig::default().interval(Duration::from_millis(20)),
    );
    timeout(Duration::from_secs(5), async {
        while heartbeat.stats().pongs < 2 {
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
    })
    .await
    .expect("No heartbeat answered");

    assert!(!heartbeat.is_finished());
    assert!(session.is_alive());
    assert_eq!(heartbeat.stats().clock_offset_ms, i64::MIN);
    assert!(heartbeat.server_time_ms() < 0);
}

#[tokio::test]
async fn test_heartbeat_closes_on_wrong_response_type() {
    let _ = tracing_subscriber::fmt::try_init();

    let context = context();
    let (local, remote) = duplex(64 * 1024);
    let session = Session::start(context.clone(), local, peer(7003), Side::Client);
    tokio::spawn(answer_pings(context.clone(), remote, |ping| {
        Box::new(Receipt {
            header: echo_header(ping),
        })
    }));

    let heartbeat = Heartbeat::spawn(
        session.clone(),
        HeartbeatConfig::default()
            .interval(Duration::from_millis(20))
            .retry_count(10),
    );

    timeout(Duration::from_secs(5), session.closed())
        .await
        .expect("Session stayed open");
    assert_eq!(session.state(), SessionState::Closed);

    let stats = heartbeat.stats();
    assert_eq!(stats.failures, 1);
    assert_eq!(stats.pongs, 0);
}

#[tokio::test]
async fn test_broadcast_skips_excluded_sessions() {
    let context = context();
    let set = SessionSet::new(context.clone(), 16);

    let (sender, _sender_remote) = accepted(&context, 5001);
    let (listener, listener_remote) = accepted(&context, 5002);
    set.add(sender.clone());
    set.add(listener);

    let delivered = set
        .broadcast(
            &Notice {
                text: "from sender".to_string(),
            },
            &[sender.id()],
        )
        .await;
    assert_eq!(delivered, 1);
    assert_eq!(receive_notice(&context, listener_remote).await, "from sender");
}

#[tokio::test]
async fn test_close_all_empties_set() {
    let context = context();
    let set = SessionSet::new(context.clone(), 16);
    let sessions: Vec<_> = (0..3).map(|i| accepted(&context, 6000 + i)).collect();
    for (session, _) in &sessions {
        set.add(session.clone());
    }

    set.close_all();
    assert!(set.is_empty());
    assert!(sessions.iter().all(|(session, _)| !session.is_alive()));
}

#[tokio::test(start_paused = true)]
async fn test_heartbeat_gives_up_after_retries() {
    let _ = tracing_subscriber::fmt::try_init();

    let config = RpcConfig::default()
        .min_rpc_timeout(Duration::from_secs(1))
        .default_rpc_timeout(Duration::from_secs(1));
    let context = Context::new(
        Schema::builder().build().expect("schema is valid"),
        config,
    );

    // The peer never answers.
    let (local, _remote) = duplex(64 * 1024);
    let session = Session::start(context.clone(), local, peer(7001), Side::Client);
    let heartbeat = Heartbeat::spawn(
        session.clone(),
        HeartbeatConfig::default()
            .interval(Duration::from_secs(1))
            .retry_count(2)
            .retry_backoff(Duration::from_millis(200)),
    );

    session.closed().await;
    assert_eq!(session.state(), SessionState::Closed);

    let stats = heartbeat.stats();
    assert_eq!(stats.failures, 3);
    assert_eq!(stats.pongs, 0);
}
