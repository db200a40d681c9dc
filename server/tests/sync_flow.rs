//! End-to-end control-channel flow over localhost TCP: clients join, get
//! the current record immediately, and converge on every published update.

use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;

use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::TcpStream;
use unison_client::{ClientConfig, LocalClock, NullPipeline, SyncClient};
use unison_proto::{ClientDescriptor, ReferenceClock, SyncRecord, Track, SECOND};
use unison_server::{ServerConfig, ServerEvent, SyncServer};

struct TestClock {
    now: AtomicU64,
}

impl TestClock {
    fn new() -> Arc<Self> {
        Arc::new(Self {
            now: AtomicU64::new(1_000),
        })
    }

    fn advance(&self, delta: u64) {
        self.now.fetch_add(delta, Ordering::SeqCst);
    }
}

impl ReferenceClock for TestClock {
    fn now(&self) -> u64 {
        self.now.load(Ordering::SeqCst)
    }
}

fn test_server(clock: Arc<TestClock>) -> SyncServer {
    SyncServer::new(
        ServerConfig {
            control_address: "127.0.0.1".to_string(),
            control_port: 0,
            clock_address: "127.0.0.1".to_string(),
            clock_port: 3696,
            stream_start_delay: 0,
            tracks: vec![
                Track::new("http://media/one.mkv", 10 * SECOND),
                Track::new("http://media/two.mkv", 5 * SECOND),
            ],
            ..Default::default()
        },
        clock,
    )
}

fn test_client(port: u16, id: &str) -> SyncClient {
    SyncClient::new(
        ClientConfig {
            server_address: "127.0.0.1".to_string(),
            server_port: port,
            id: id.to_string(),
            config: HashMap::new(),
        },
        Arc::new(NullPipeline::new()),
        Box::new(|_addr, _port| Arc::new(LocalClock::new()) as Arc<dyn ReferenceClock>),
    )
}

/// Polls until `check` passes or two seconds elapse.
async fn wait_for<T>(mut check: impl FnMut() -> Option<T>) -> T {
    for _ in 0..200 {
        if let Some(value) = check() {
            return value;
        }
        tokio::time::sleep(Duration::from_millis(10)).await;
    }
    panic!("condition not reached within 2s");
}

fn record_of(client: &SyncClient) -> Option<SyncRecord> {
    client.engine().and_then(|engine| engine.current_record())
}

#[tokio::test(flavor = "multi_thread")]
async fn clients_converge_on_published_updates() {
    let clock = TestClock::new();
    let server = test_server(Arc::clone(&clock));
    server.start().await.unwrap();
    let port = server.local_addr().unwrap().port();

    let client_a = test_client(port, "a");
    let client_b = test_client(port, "b");
    client_a.start().await.unwrap();
    client_b.start().await.unwrap();

    let first = wait_for(|| record_of(&client_a)).await;
    assert_eq!(first.playlist.tracks().len(), 2);
    assert!(!first.paused);
    assert_eq!(first.base_time_offset, 0);
    wait_for(|| record_of(&client_b)).await;

    // Pause for exactly two (simulated) seconds, then resume.
    clock.advance(3 * SECOND);
    server.set_paused(true).await;
    clock.advance(2 * SECOND);
    server.set_paused(false).await;

    for client in [&client_a, &client_b] {
        let resumed = wait_for(|| {
            record_of(client).filter(|rec| !rec.paused && rec.base_time_offset > 0)
        })
        .await;
        assert_eq!(resumed.base_time_offset, 2 * SECOND);
        assert_eq!(resumed.base_time, first.base_time);
    }

    // Versions observed by a client only ever increase.
    let version_a = record_of(&client_a).unwrap().version;
    let version_b = record_of(&client_b).unwrap().version;
    assert!(version_a >= 3 && version_b >= 3);

    client_a.stop().await;
    client_b.stop().await;
    server.stop().await;
}

#[tokio::test(flavor = "multi_thread")]
async fn late_joiner_gets_the_current_record_at_once() {
    let clock = TestClock::new();
    let server = test_server(Arc::clone(&clock));
    server.start().await.unwrap();
    let port = server.local_addr().unwrap().port();

    // Advance playback state before anyone joins.
    server.set_paused(true).await;
    clock.advance(4 * SECOND);
    server.set_paused(false).await;

    let late = test_client(port, "late");
    late.start().await.unwrap();

    let record = wait_for(|| record_of(&late)).await;
    assert!(record.version >= 3, "late joiner starts from the latest");
    assert_eq!(record.base_time_offset, 4 * SECOND);

    late.stop().await;
    server.stop().await;
}

#[tokio::test(flavor = "multi_thread")]
async fn join_and_leave_are_emitted() {
    let server = test_server(TestClock::new());
    server.start().await.unwrap();
    let port = server.local_addr().unwrap().port();
    let mut events = server.subscribe_events();

    let mut stream = TcpStream::connect(("127.0.0.1", port)).await.unwrap();
    let descriptor = serde_json::to_vec(&ClientDescriptor::new("probe")).unwrap();
    stream.write_all(&descriptor).await.unwrap();

    match events.recv().await.unwrap() {
        ServerEvent::ClientJoined { id, .. } => assert_eq!(id, "probe"),
        other => panic!("expected a join, got {other:?}"),
    }

    // The current record arrives unprompted.
    let mut buf = vec![0u8; 4096];
    let n = stream.read(&mut buf).await.unwrap();
    let record: SyncRecord = serde_json::from_slice(&buf[..n]).unwrap();
    assert_eq!(record.version, 1);

    drop(stream);
    match events.recv().await.unwrap() {
        ServerEvent::ClientLeft { id } => assert_eq!(id, "probe"),
        other => panic!("expected a leave, got {other:?}"),
    }
    assert_eq!(server.client_count(), 0);

    server.stop().await;
}

#[tokio::test(flavor = "multi_thread")]
async fn unsolicited_bytes_after_join_close_the_session() {
    let server = test_server(TestClock::new());
    server.start().await.unwrap();
    let port = server.local_addr().unwrap().port();
    let mut events = server.subscribe_events();

    let mut stream = TcpStream::connect(("127.0.0.1", port)).await.unwrap();
    let descriptor = serde_json::to_vec(&ClientDescriptor::new("chatty")).unwrap();
    stream.write_all(&descriptor).await.unwrap();

    match events.recv().await.unwrap() {
        ServerEvent::ClientJoined { id, .. } => assert_eq!(id, "chatty"),
        other => panic!("expected a join, got {other:?}"),
    }

    // Nothing after the descriptor is legal; the server must hang up.
    stream.write_all(b"{\"surprise\": true}").await.unwrap();
    match events.recv().await.unwrap() {
        ServerEvent::ClientLeft { id } => assert_eq!(id, "chatty"),
        other => panic!("expected a leave, got {other:?}"),
    }

    server.stop().await;
}

#[tokio::test(flavor = "multi_thread")]
async fn duplicate_ids_join_independently() {
    let server = test_server(TestClock::new());
    server.start().await.unwrap();
    let port = server.local_addr().unwrap().port();

    let first = test_client(port, "twin");
    let second = test_client(port, "twin");
    first.start().await.unwrap();
    second.start().await.unwrap();

    wait_for(|| record_of(&first)).await;
    wait_for(|| record_of(&second)).await;
    assert_eq!(server.client_count(), 2);

    first.stop().await;
    second.stop().await;
    server.stop().await;
}

#[tokio::test(flavor = "multi_thread")]
async fn empty_playlist_refuses_to_start() {
    let server = SyncServer::new(
        ServerConfig {
            control_address: "127.0.0.1".to_string(),
            tracks: Vec::new(),
            ..Default::default()
        },
        TestClock::new(),
    );
    let err = server.start().await.expect_err("must not start");
    assert!(matches!(err, unison_proto::Error::Config(_)));
}
