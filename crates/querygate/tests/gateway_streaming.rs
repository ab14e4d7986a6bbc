use querygate::config::GatewayConfig;
use querygate::connection::run_connection;
use querygate::transport::{TransportPeer, memory_transport};
use querygate_core::{DriverRegistry, DriverRegistryBuilder, QueryResolver, Value};
use querygate_test_support::{MemoryDriver, MemoryStore};
use std::sync::Arc;
use std::time::{Duration, Instant};
use tokio_util::sync::CancellationToken;

struct Gateway {
    peer: TransportPeer,
    root: CancellationToken,
    connection: tokio::task::JoinHandle<()>,
}

impl Gateway {
    async fn shutdown(self) {
        self.root.cancel();
        let _ = tokio::time::timeout(Duration::from_secs(5), self.connection).await;
    }
}

fn test_config(max_workers: usize, queue_capacity: usize) -> GatewayConfig {
    let mut config = GatewayConfig::default();
    config.max_workers = max_workers;
    config.queue_capacity = queue_capacity;
    config
}

fn start_gateway(store: MemoryStore, registry: DriverRegistry, config: GatewayConfig) -> Gateway {
    let resolver = Arc::new(QueryResolver::new(Arc::new(store), Arc::new(registry)));
    let root = CancellationToken::new();
    let (peer, sink, stream) = memory_transport(64);

    let connection_root = root.clone();
    let connection = tokio::spawn(async move {
        run_connection(resolver, &config, connection_root, sink, stream).await;
    });

    Gateway {
        peer,
        root,
        connection,
    }
}

fn registry_with(driver: &MemoryDriver) -> DriverRegistryBuilder {
    DriverRegistry::builder().register("memory", driver.factory())
}

async fn recv_frame(peer: &mut TransportPeer) -> serde_json::Value {
    let text = tokio::time::timeout(Duration::from_secs(5), peer.recv_text())
        .await
        .expect("timed out waiting for frame")
        .expect("transport closed while waiting for frame");
    serde_json::from_str(&text).expect("frame is not valid JSON")
}

fn is_terminal_status(frame: &serde_json::Value) -> bool {
    frame["type"] == "status"
        && matches!(
            frame["payload"]["status"].as_str(),
            Some("completed") | Some("failed") | Some("cancelled")
        )
}

/// Read frames until `stream_id` reaches a terminal status frame.
async fn collect_stream(peer: &mut TransportPeer, stream_id: &str) -> Vec<serde_json::Value> {
    let mut frames = Vec::new();
    loop {
        let frame = recv_frame(peer).await;
        if frame["streamId"] != stream_id {
            continue;
        }
        let terminal = is_terminal_status(&frame);
        frames.push(frame);
        if terminal {
            return frames;
        }
    }
}

fn frame_types(frames: &[serde_json::Value]) -> Vec<String> {
    frames
        .iter()
        .map(|f| {
            if f["type"] == "status" {
                format!("status:{}", f["payload"]["status"].as_str().unwrap())
            } else {
                f["type"].as_str().unwrap().to_string()
            }
        })
        .collect()
}

fn query_frame(stream_id: &str, query_id: &str, template_data: serde_json::Value) -> String {
    serde_json::json!({
        "type": "query",
        "streamId": stream_id,
        "queryId": query_id,
        "templateData": template_data,
    })
    .to_string()
}

// S1: happy path, small result.
#[tokio::test(flavor = "multi_thread")]
async fn happy_path_small_result() {
    let driver = MemoryDriver::new().with_result(
        vec!["a", "b"],
        vec![vec![Value::Int(1), Value::Text("x".into())]],
    );
    let store = MemoryStore::new()
        .with_query("Q-ok", "c1", "SELECT 1 AS a, 'x' AS b;")
        .with_connector("c1", "memory", serde_json::json!({}));

    let mut gateway = start_gateway(store, registry_with(&driver).build(), test_config(3, 100));

    gateway
        .peer
        .send_text(query_frame("s1", "Q-ok", serde_json::json!({})))
        .await;

    let frames = collect_stream(&mut gateway.peer, "s1").await;
    assert_eq!(
        frame_types(&frames),
        [
            "status:queued",
            "status:running",
            "metadata",
            "row",
            "complete",
            "status:completed"
        ]
    );
    assert_eq!(frames[2]["payload"]["metadata"]["columns"], serde_json::json!(["a", "b"]));
    assert_eq!(frames[3]["payload"]["data"], serde_json::json!([1, "x"]));
    assert_eq!(frames[4]["payload"]["totalRows"], 1);

    assert_eq!(driver.stats().executed_sql, ["SELECT 1 AS a, 'x' AS b;"]);
    gateway.shutdown().await;
}

// S2: template substitution reaches the driver.
#[tokio::test(flavor = "multi_thread")]
async fn template_substitution() {
    let driver = MemoryDriver::new().with_result(vec!["id"], vec![]);
    let store = MemoryStore::new()
        .with_query(
            "Q-tpl",
            "c1",
            "SELECT * FROM orders WHERE region = '{{region}}'",
        )
        .with_connector("c1", "memory", serde_json::json!({}));

    let mut gateway = start_gateway(store, registry_with(&driver).build(), test_config(3, 100));

    gateway
        .peer
        .send_text(query_frame("s1", "Q-tpl", serde_json::json!({"region": "us"})))
        .await;

    collect_stream(&mut gateway.peer, "s1").await;
    assert_eq!(
        driver.stats().executed_sql,
        ["SELECT * FROM orders WHERE region = 'us'"]
    );
    gateway.shutdown().await;
}

// S3: cancellation mid-stream, driver teardown observed.
#[tokio::test(flavor = "multi_thread")]
async fn cancellation_mid_stream() {
    let rows: Vec<Vec<Value>> = (0..100).map(|i| vec![Value::Int(i)]).collect();
    let driver = MemoryDriver::new()
        .with_result(vec!["n"], rows)
        .with_row_delay(Duration::from_millis(100));
    let store = MemoryStore::new()
        .with_query("Q-slow", "c1", "SELECT n FROM slow")
        .with_connector("c1", "memory", serde_json::json!({}));

    let mut gateway = start_gateway(store, registry_with(&driver).build(), test_config(3, 100));

    gateway
        .peer
        .send_text(query_frame("s2", "Q-slow", serde_json::json!({})))
        .await;

    let mut row_count = 0;
    while row_count < 3 {
        let frame = recv_frame(&mut gateway.peer).await;
        if frame["type"] == "row" {
            row_count += 1;
        }
    }

    let cancel_sent = Instant::now();
    gateway
        .peer
        .send_text(serde_json::json!({"type": "cancel", "streamId": "s2"}).to_string())
        .await;

    loop {
        let frame = recv_frame(&mut gateway.peer).await;
        assert_ne!(frame["type"], "complete", "cancelled stream must not complete");
        if frame["type"] == "status" && frame["payload"]["status"] == "cancelled" {
            break;
        }
    }
    assert!(
        cancel_sent.elapsed() < Duration::from_millis(500),
        "cancellation took {:?}",
        cancel_sent.elapsed()
    );

    // The worker closes stream and driver before the terminal frame.
    let stats = driver.stats();
    assert!(stats.stream_close_calls >= 1);
    assert!(stats.close_calls >= 1);
    gateway.shutdown().await;
}

// Cancellation while the resolver is still connecting: the half-open
// driver session must be closed, not leaked.
#[tokio::test(flavor = "multi_thread")]
async fn cancel_during_connect_closes_driver() {
    let driver = MemoryDriver::new()
        .with_result(vec!["n"], vec![vec![Value::Int(1)]])
        .with_connect_delay(Duration::from_secs(5));
    let store = MemoryStore::new()
        .with_query("Q-slow-connect", "c1", "SELECT n")
        .with_connector("c1", "memory", serde_json::json!({}));

    let mut gateway = start_gateway(store, registry_with(&driver).build(), test_config(3, 100));

    gateway
        .peer
        .send_text(query_frame("s1", "Q-slow-connect", serde_json::json!({})))
        .await;

    loop {
        let frame = recv_frame(&mut gateway.peer).await;
        if frame["payload"]["status"] == "running" {
            break;
        }
    }

    // The driver is now sleeping inside connect.
    tokio::time::sleep(Duration::from_millis(100)).await;
    gateway
        .peer
        .send_text(serde_json::json!({"type": "cancel", "streamId": "s1"}).to_string())
        .await;

    let frame = recv_frame(&mut gateway.peer).await;
    assert_eq!(frame["type"], "status");
    assert_eq!(frame["payload"]["status"], "cancelled");

    let stats = driver.stats();
    assert_eq!(stats.connect_calls, 1);
    assert_eq!(stats.close_calls, 1, "half-open session must be closed");
    assert_eq!(stats.stream_close_calls, 0);
    gateway.shutdown().await;
}

// S4: queue-full admission with a single busy worker.
#[tokio::test(flavor = "multi_thread")]
async fn queue_full_rejects_third_admission() {
    let driver = MemoryDriver::new()
        .with_result(vec!["n"], vec![vec![Value::Int(1)], vec![Value::Int(2)]])
        .with_row_delay(Duration::from_millis(50));
    let store = MemoryStore::new()
        .with_query("Q-busy", "c1", "SELECT n")
        .with_connector("c1", "memory", serde_json::json!({}));

    let mut gateway = start_gateway(store, registry_with(&driver).build(), test_config(1, 1));

    gateway
        .peer
        .send_text(query_frame("s-a", "Q-busy", serde_json::json!({})))
        .await;

    // Wait until the single worker has s-a in flight so s-b occupies the
    // queue slot deterministically.
    loop {
        let frame = recv_frame(&mut gateway.peer).await;
        if frame["streamId"] == "s-a" && frame["payload"]["status"] == "running" {
            break;
        }
    }

    gateway
        .peer
        .send_text(query_frame("s-b", "Q-busy", serde_json::json!({})))
        .await;
    gateway
        .peer
        .send_text(query_frame("s-c", "Q-busy", serde_json::json!({})))
        .await;

    let mut saw_c_error = false;
    let mut saw_c_failed = false;
    let mut a_completed_at = None;
    let mut b_completed_at = None;
    let mut c_ran = false;
    let mut order = 0u32;

    while b_completed_at.is_none() || !saw_c_failed {
        let frame = recv_frame(&mut gateway.peer).await;
        order += 1;
        match (frame["streamId"].as_str().unwrap(), frame["type"].as_str().unwrap()) {
            ("s-c", "error") => {
                assert_eq!(frame["payload"]["code"], "QueueFull");
                saw_c_error = true;
            }
            ("s-c", "status") => {
                if frame["payload"]["status"] == "failed" {
                    saw_c_failed = true;
                }
                if frame["payload"]["status"] == "running" {
                    c_ran = true;
                }
            }
            ("s-a", "status") if frame["payload"]["status"] == "completed" => {
                a_completed_at = Some(order);
            }
            ("s-b", "status") if frame["payload"]["status"] == "completed" => {
                b_completed_at = Some(order);
            }
            _ => {}
        }
    }

    assert!(saw_c_error && saw_c_failed);
    assert!(!c_ran, "rejected stream must never reach running");
    assert!(a_completed_at.unwrap() < b_completed_at.unwrap());
    gateway.shutdown().await;
}

// S5: unknown query id.
#[tokio::test(flavor = "multi_thread")]
async fn unknown_query_id_fails_stream() {
    let driver = MemoryDriver::new();
    let store =
        MemoryStore::new().with_connector("c1", "memory", serde_json::json!({}));

    let mut gateway = start_gateway(store, registry_with(&driver).build(), test_config(3, 100));

    gateway
        .peer
        .send_text(query_frame("s1", "missing", serde_json::json!({})))
        .await;

    let frames = collect_stream(&mut gateway.peer, "s1").await;
    assert_eq!(
        frame_types(&frames),
        ["status:queued", "status:running", "error", "status:failed"]
    );
    assert_eq!(frames[2]["payload"]["code"], "QueryNotFound");
    gateway.shutdown().await;
}

// S6: two concurrent streams, independent completion, interleaving allowed.
#[tokio::test(flavor = "multi_thread")]
async fn concurrent_streams_complete_independently() {
    let fast = MemoryDriver::new().with_result(
        vec!["n"],
        (0..10).map(|i| vec![Value::Int(i)]).collect(),
    );
    let slow = MemoryDriver::new()
        .with_result(vec!["n"], (0..1000).map(|i| vec![Value::Int(i)]).collect())
        .with_row_delay(Duration::from_millis(2));

    let store = MemoryStore::new()
        .with_query("Q-fast", "c-fast", "SELECT n FROM fast")
        .with_query("Q-slow", "c-slow", "SELECT n FROM slow")
        .with_connector("c-fast", "memory-fast", serde_json::json!({}))
        .with_connector("c-slow", "memory-slow", serde_json::json!({}));

    let registry = DriverRegistry::builder()
        .register("memory-fast", fast.factory())
        .register("memory-slow", slow.factory())
        .build();

    let mut gateway = start_gateway(store, registry, test_config(3, 100));

    gateway
        .peer
        .send_text(query_frame("s4", "Q-slow", serde_json::json!({})))
        .await;
    gateway
        .peer
        .send_text(query_frame("s3", "Q-fast", serde_json::json!({})))
        .await;

    let mut s3_frames = Vec::new();
    let mut s3_done = false;
    let mut s4_done = false;
    let mut completion_order = Vec::new();

    while !(s3_done && s4_done) {
        let frame = recv_frame(&mut gateway.peer).await;
        match frame["streamId"].as_str().unwrap() {
            "s3" => {
                if is_terminal_status(&frame) {
                    s3_done = true;
                    completion_order.push("s3");
                }
                s3_frames.push(frame);
            }
            "s4" => {
                if is_terminal_status(&frame) {
                    s4_done = true;
                    completion_order.push("s4");
                }
            }
            other => panic!("unexpected stream id {other}"),
        }
    }

    assert_eq!(completion_order, ["s3", "s4"]);

    assert_eq!(
        frame_types(&s3_frames),
        std::iter::once("status:queued".to_string())
            .chain(std::iter::once("status:running".to_string()))
            .chain(std::iter::once("metadata".to_string()))
            .chain(std::iter::repeat_n("row".to_string(), 10))
            .chain(["complete".to_string(), "status:completed".to_string()])
            .collect::<Vec<_>>()
    );
    gateway.shutdown().await;
}

// Empty result: exactly one metadata, zero rows, complete with 0.
#[tokio::test(flavor = "multi_thread")]
async fn empty_result_set() {
    let driver = MemoryDriver::new().with_result(vec!["id", "name"], vec![]);
    let store = MemoryStore::new()
        .with_query("Q-empty", "c1", "SELECT id, name FROM nobody")
        .with_connector("c1", "memory", serde_json::json!({}));

    let mut gateway = start_gateway(store, registry_with(&driver).build(), test_config(3, 100));

    gateway
        .peer
        .send_text(query_frame("s1", "Q-empty", serde_json::json!({})))
        .await;

    let frames = collect_stream(&mut gateway.peer, "s1").await;
    assert_eq!(
        frame_types(&frames),
        [
            "status:queued",
            "status:running",
            "metadata",
            "complete",
            "status:completed"
        ]
    );
    assert_eq!(frames[3]["payload"]["totalRows"], 0);
    gateway.shutdown().await;
}

// Duplicate streamId while the first is still active.
#[tokio::test(flavor = "multi_thread")]
async fn duplicate_stream_id_rejected() {
    let driver = MemoryDriver::new()
        .with_result(vec!["n"], (0..50).map(|i| vec![Value::Int(i)]).collect())
        .with_row_delay(Duration::from_millis(20));
    let store = MemoryStore::new()
        .with_query("Q-slow", "c1", "SELECT n")
        .with_connector("c1", "memory", serde_json::json!({}));

    let mut gateway = start_gateway(store, registry_with(&driver).build(), test_config(3, 100));

    gateway
        .peer
        .send_text(query_frame("s1", "Q-slow", serde_json::json!({})))
        .await;
    gateway
        .peer
        .send_text(query_frame("s1", "Q-slow", serde_json::json!({})))
        .await;

    // The duplicate admission answers with a lone error frame; the
    // original stream keeps its ordered frame sequence.
    loop {
        let frame = recv_frame(&mut gateway.peer).await;
        if frame["type"] == "error" {
            assert_eq!(frame["payload"]["code"], "DuplicateStream");
            break;
        }
        assert!(matches!(
            frame["type"].as_str(),
            Some("status") | Some("metadata") | Some("row")
        ));
    }
    gateway.shutdown().await;
}

// Cancel for an unknown stream, and cancel idempotence after terminal.
#[tokio::test(flavor = "multi_thread")]
async fn cancel_unknown_and_after_terminal() {
    let driver = MemoryDriver::new().with_result(vec!["n"], vec![vec![Value::Int(1)]]);
    let store = MemoryStore::new()
        .with_query("Q-ok", "c1", "SELECT n")
        .with_connector("c1", "memory", serde_json::json!({}));

    let mut gateway = start_gateway(store, registry_with(&driver).build(), test_config(3, 100));

    gateway
        .peer
        .send_text(serde_json::json!({"type": "cancel", "streamId": "ghost"}).to_string())
        .await;
    let frame = recv_frame(&mut gateway.peer).await;
    assert_eq!(frame["type"], "error");
    assert_eq!(frame["payload"]["code"], "StreamNotFound");

    gateway
        .peer
        .send_text(query_frame("s1", "Q-ok", serde_json::json!({})))
        .await;
    collect_stream(&mut gateway.peer, "s1").await;

    // A second cancel after terminal: StreamNotFound, no duplicate
    // terminal frames.
    gateway
        .peer
        .send_text(serde_json::json!({"type": "cancel", "streamId": "s1"}).to_string())
        .await;
    let frame = recv_frame(&mut gateway.peer).await;
    assert_eq!(frame["payload"]["code"], "StreamNotFound");
    gateway.shutdown().await;
}

// Stream id reuse after terminal is permitted.
#[tokio::test(flavor = "multi_thread")]
async fn stream_id_reuse_after_terminal() {
    let driver = MemoryDriver::new().with_result(vec!["n"], vec![vec![Value::Int(1)]]);
    let store = MemoryStore::new()
        .with_query("Q-ok", "c1", "SELECT n")
        .with_connector("c1", "memory", serde_json::json!({}));

    let mut gateway = start_gateway(store, registry_with(&driver).build(), test_config(3, 100));

    for _ in 0..2 {
        gateway
            .peer
            .send_text(query_frame("s1", "Q-ok", serde_json::json!({})))
            .await;
        let frames = collect_stream(&mut gateway.peer, "s1").await;
        assert_eq!(frames.last().unwrap()["payload"]["status"], "completed");
    }
    gateway.shutdown().await;
}

// Protocol errors: recoverable with a streamId, fatal without one.
#[tokio::test(flavor = "multi_thread")]
async fn protocol_errors() {
    let driver = MemoryDriver::new().with_result(vec!["n"], vec![vec![Value::Int(1)]]);
    let store = MemoryStore::new()
        .with_query("Q-ok", "c1", "SELECT n")
        .with_connector("c1", "memory", serde_json::json!({}));

    let mut gateway = start_gateway(store, registry_with(&driver).build(), test_config(3, 100));

    // Unknown type with a streamId: answered, transport stays open.
    gateway
        .peer
        .send_text(serde_json::json!({"type": "subscribe", "streamId": "s9"}).to_string())
        .await;
    let frame = recv_frame(&mut gateway.peer).await;
    assert_eq!(frame["streamId"], "s9");
    assert_eq!(frame["payload"]["code"], "ProtocolError");

    // The connection still serves queries afterwards.
    gateway
        .peer
        .send_text(query_frame("s1", "Q-ok", serde_json::json!({})))
        .await;
    let frames = collect_stream(&mut gateway.peer, "s1").await;
    assert_eq!(frames.last().unwrap()["payload"]["status"], "completed");

    // Garbage without a streamId closes the transport.
    gateway.peer.send_text("{not json").await;
    let closed = tokio::time::timeout(Duration::from_secs(5), gateway.peer.recv_text()).await;
    assert_eq!(closed.expect("timed out"), None);
    gateway.shutdown().await;
}

// Oversize inbound frame closes the transport and tears down active work.
#[tokio::test(flavor = "multi_thread")]
async fn oversize_frame_closes_transport() {
    let driver = MemoryDriver::new()
        .with_result(vec!["n"], (0..100).map(|i| vec![Value::Int(i)]).collect())
        .with_row_delay(Duration::from_millis(20));
    let store = MemoryStore::new()
        .with_query("Q-slow", "c1", "SELECT n")
        .with_connector("c1", "memory", serde_json::json!({}));

    let mut config = test_config(3, 100);
    config.max_frame_size = 512;

    let mut gateway = start_gateway(store, registry_with(&driver).build(), config);

    gateway
        .peer
        .send_text(query_frame("s1", "Q-slow", serde_json::json!({})))
        .await;

    // Wait for streaming to begin, then violate the frame cap.
    loop {
        let frame = recv_frame(&mut gateway.peer).await;
        if frame["type"] == "row" {
            break;
        }
    }
    gateway.peer.send_text("x".repeat(1024)).await;

    // The active stream gets its `status:cancelled` before the transport
    // shuts, and its driver is torn down.
    let mut saw_cancelled = false;
    loop {
        match tokio::time::timeout(Duration::from_secs(5), gateway.peer.recv_text())
            .await
            .expect("timed out waiting for close")
        {
            Some(text) => {
                let frame: serde_json::Value = serde_json::from_str(&text).unwrap();
                if frame["streamId"] == "s1"
                    && frame["type"] == "status"
                    && frame["payload"]["status"] == "cancelled"
                {
                    saw_cancelled = true;
                }
            }
            None => break,
        }
    }
    assert!(
        saw_cancelled,
        "active stream must observe status:cancelled before the transport closes"
    );

    let stats = driver.stats();
    assert!(stats.stream_close_calls >= 1);
    assert!(stats.close_calls >= 1);
    gateway.shutdown().await;
}

// Peer disconnect cancels active tasks and closes their drivers.
#[tokio::test(flavor = "multi_thread")]
async fn disconnect_tears_down_drivers() {
    let driver = MemoryDriver::new()
        .with_result(vec!["n"], (0..100).map(|i| vec![Value::Int(i)]).collect())
        .with_row_delay(Duration::from_millis(20));
    let store = MemoryStore::new()
        .with_query("Q-slow", "c1", "SELECT n")
        .with_connector("c1", "memory", serde_json::json!({}));

    let mut gateway = start_gateway(store, registry_with(&driver).build(), test_config(3, 100));

    gateway
        .peer
        .send_text(query_frame("s1", "Q-slow", serde_json::json!({})))
        .await;
    loop {
        let frame = recv_frame(&mut gateway.peer).await;
        if frame["type"] == "row" {
            break;
        }
    }

    gateway.peer.disconnect().await;
    let _ = tokio::time::timeout(Duration::from_secs(5), gateway.connection).await;

    let stats = driver.stats();
    assert!(stats.stream_close_calls >= 1);
    assert!(stats.close_calls >= 1);
}

// Admission failures: empty ids are invalid without touching a worker.
#[tokio::test(flavor = "multi_thread")]
async fn empty_ids_are_invalid() {
    let driver = MemoryDriver::new();
    let store = MemoryStore::new();

    let mut gateway = start_gateway(store, registry_with(&driver).build(), test_config(3, 100));

    gateway
        .peer
        .send_text(query_frame("", "Q-ok", serde_json::json!({})))
        .await;
    let frame = recv_frame(&mut gateway.peer).await;
    assert_eq!(frame["type"], "error");
    assert_eq!(frame["payload"]["code"], "InvalidRequest");

    gateway
        .peer
        .send_text(query_frame("s1", "", serde_json::json!({})))
        .await;
    let frame = recv_frame(&mut gateway.peer).await;
    assert_eq!(frame["payload"]["code"], "InvalidRequest");
    assert_eq!(driver.stats().connect_calls, 0);
    gateway.shutdown().await;
}

// Backpressure: the worker pulls no further rows until the peer drains
// its frames, and the stream stays open while the peer stalls.
#[tokio::test(flavor = "multi_thread")]
async fn slow_consumer_throttles_worker() {
    let driver = MemoryDriver::new()
        .with_result(vec!["n"], (0..50).map(|i| vec![Value::Int(i)]).collect());
    let store = MemoryStore::new()
        .with_query("Q-many", "c1", "SELECT n")
        .with_connector("c1", "memory", serde_json::json!({}));

    let resolver = Arc::new(QueryResolver::new(
        Arc::new(store),
        Arc::new(registry_with(&driver).build()),
    ));
    let root = CancellationToken::new();
    // A tiny outbound buffer stands in for a slow socket.
    let (mut peer, sink, stream) = memory_transport(1);

    let config = test_config(1, 10);
    let connection_root = root.clone();
    let connection = tokio::spawn(async move {
        run_connection(resolver, &config, connection_root, sink, stream).await;
    });

    peer.send_text(query_frame("s1", "Q-many", serde_json::json!({})))
        .await;

    // Stall: the worker must block on the write path, not buffer rows.
    tokio::time::sleep(Duration::from_millis(300)).await;
    assert_eq!(driver.stats().stream_close_calls, 0);

    let mut rows = 0;
    loop {
        let text = tokio::time::timeout(Duration::from_secs(5), peer.recv_text())
            .await
            .expect("timed out")
            .expect("transport closed early");
        let frame: serde_json::Value = serde_json::from_str(&text).unwrap();
        if frame["type"] == "row" {
            rows += 1;
        }
        if is_terminal_status(&frame) {
            break;
        }
    }
    assert_eq!(rows, 50);

    root.cancel();
    let _ = tokio::time::timeout(Duration::from_secs(5), connection).await;
}

// Admission bound: with W workers and Q queue slots, at most W + Q
// streams are in flight; the surplus is rejected with QueueFull.
#[tokio::test(flavor = "multi_thread")]
async fn admission_bounded_by_queue_plus_workers() {
    let driver = MemoryDriver::new()
        .with_result(vec!["n"], (0..20).map(|i| vec![Value::Int(i)]).collect())
        .with_row_delay(Duration::from_millis(50));
    let store = MemoryStore::new()
        .with_query("Q-busy", "c1", "SELECT n")
        .with_connector("c1", "memory", serde_json::json!({}));

    let mut gateway = start_gateway(store, registry_with(&driver).build(), test_config(2, 2));

    for i in 0..2 {
        gateway
            .peer
            .send_text(query_frame(&format!("s{i}"), "Q-busy", serde_json::json!({})))
            .await;
    }

    // Both workers busy before the queue gets loaded.
    let mut running = 0;
    while running < 2 {
        let frame = recv_frame(&mut gateway.peer).await;
        if frame["type"] == "status" && frame["payload"]["status"] == "running" {
            running += 1;
        }
    }

    for i in 2..6 {
        gateway
            .peer
            .send_text(query_frame(&format!("s{i}"), "Q-busy", serde_json::json!({})))
            .await;
    }

    let mut queue_full = 0;
    let mut seen = 0;
    while seen < 4 {
        let frame = recv_frame(&mut gateway.peer).await;
        if frame["type"] == "error" {
            assert_eq!(frame["payload"]["code"], "QueueFull");
            queue_full += 1;
        }
        if frame["type"] == "status"
            && matches!(
                frame["payload"]["status"].as_str(),
                Some("queued") | Some("failed")
            )
            && frame["streamId"].as_str().unwrap() >= "s2"
        {
            seen += 1;
        }
    }
    assert_eq!(queue_full, 2);
    gateway.shutdown().await;
}
