//! Gateway integration tests: start a real gateway and talk to it over WS + HTTP.
//!
//! Run with: `cargo test -p parley-gateway --test integration`

use std::sync::Arc;
use std::time::Duration;

use futures::{SinkExt, StreamExt};
use serde_json::{Value, json};
use tokio::net::TcpListener;
use tokio::sync::oneshot;
use tokio_tungstenite::connect_async;
use tokio_tungstenite::tungstenite::Message;

use parley_core::config::ParleyConfig;
use parley_gateway::GatewayState;
use parley_models::device::StaticDetector;
use parley_models::loopback::{LoopbackBehaviors, LoopbackStats, loopback_engines};

struct TestGateway {
    port: u16,
    stats: Arc<LoopbackStats>,
    _shutdown: oneshot::Sender<()>,
}

async fn start_test_gateway() -> TestGateway {
    let stats = LoopbackStats::new();
    let state = Arc::new(GatewayState::new(
        Arc::new(ParleyConfig::default()),
        loopback_engines(stats.clone(), LoopbackBehaviors::default()),
        Arc::new(StaticDetector::new(true)),
    ));

    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let port = listener.local_addr().unwrap().port();
    let (shutdown_tx, shutdown_rx) = oneshot::channel::<()>();
    tokio::spawn(async move {
        let _ = parley_gateway::serve(listener, state, async {
            let _ = shutdown_rx.await;
        })
        .await;
    });

    TestGateway {
        port,
        stats,
        _shutdown: shutdown_tx,
    }
}

type Socket = tokio_tungstenite::WebSocketStream<
    tokio_tungstenite::MaybeTlsStream<tokio::net::TcpStream>,
>;

async fn connect(port: u16) -> Socket {
    let url = format!("ws://127.0.0.1:{port}/ws");
    let (ws, _) = connect_async(&url).await.expect("WS connect failed");
    ws
}

async fn send(ws: &mut Socket, frame: Value) {
    ws.send(Message::Text(frame.to_string().into()))
        .await
        .unwrap();
}

/// Read frames until one satisfies `done`; returns all of them.
async fn read_until(ws: &mut Socket, done: impl Fn(&Value) -> bool) -> Vec<Value> {
    let mut frames = Vec::new();
    loop {
        let msg = tokio::time::timeout(Duration::from_secs(5), ws.next())
            .await
            .expect("timed out waiting for frame")
            .unwrap()
            .unwrap();
        let Ok(text) = msg.to_text() else { continue };
        let frame: Value = serde_json::from_str(text).unwrap();
        let finished = done(&frame);
        frames.push(frame);
        if finished {
            return frames;
        }
    }
}

fn is_terminal(frame: &Value, kind: &str) -> bool {
    frame["type"] == "inference"
        && frame["model_kind"] == kind
        && (frame["status"] == "ready" || frame["status"] == "error")
}

#[tokio::test]
async fn test_health_endpoint() {
    let gateway = start_test_gateway().await;

    let resp = reqwest::get(format!("http://127.0.0.1:{}/health", gateway.port))
        .await
        .expect("Health request failed");

    assert!(resp.status().is_success());
    let body: Value = resp.json().await.unwrap();
    assert_eq!(body["status"], "ok");
    assert!(body["version"].is_string());
    assert_eq!(body["connections"], 0);
}

#[tokio::test]
async fn test_ws_text_to_speech() {
    let gateway = start_test_gateway().await;
    let mut ws = connect(gateway.port).await;

    send(
        &mut ws,
        json!({
            "type": "inference",
            "model_kind": "TTS",
            "payload": "Hello there. How are you?",
            "request_id": "tts-1",
        }),
    )
    .await;
    let frames = read_until(&mut ws, |f| is_terminal(f, "TTS")).await;

    let chunks: Vec<&Value> = frames
        .iter()
        .filter(|f| f["type"] == "inference" && f["status"] == "streaming")
        .collect();
    assert_eq!(chunks.len(), 2);
    for (i, chunk) in chunks.iter().enumerate() {
        assert_eq!(chunk["data"]["sequence_index"], i as u64);
        assert!(chunk["data"]["waveform"].as_str().unwrap().starts_with("UklGR"));
        assert_eq!(chunk["request_id"], "tts-1");
    }
    assert_eq!(frames.last().unwrap()["status"], "ready");
    assert_eq!(gateway.stats.constructions(), 1);
}

#[tokio::test]
async fn test_ws_health_lists_connection_models() {
    let gateway = start_test_gateway().await;
    let mut ws = connect(gateway.port).await;

    send(&mut ws, json!({"type": "init", "model_kind": "STT"})).await;
    read_until(&mut ws, |f| f["type"] == "init" && f["progress"]["status"] == "ready").await;

    let body: Value = reqwest::get(format!("http://127.0.0.1:{}/health", gateway.port))
        .await
        .unwrap()
        .json()
        .await
        .unwrap();
    assert_eq!(body["connections"], 1);
    let models = body["pipelines"][0]["models"].as_array().unwrap();
    assert_eq!(models.len(), 3);
    assert_eq!(models[0]["kind"], "STT");
    assert_eq!(models[0]["loaded"], true);
    assert_eq!(models[1]["loaded"], false);
}

#[tokio::test]
async fn test_ws_invalid_frame_gets_error() {
    let gateway = start_test_gateway().await;
    let mut ws = connect(gateway.port).await;

    ws.send(Message::Text("{not json".into())).await.unwrap();
    let frames = read_until(&mut ws, |f| f["type"] == "error").await;
    assert!(frames[0]["reason"]
        .as_str()
        .unwrap()
        .starts_with("Invalid message"));

    // The connection stays usable
    send(&mut ws, json!({"type": "dispose", "model_kind": "TG"})).await;
    let frames = read_until(&mut ws, |f| f["type"] == "dispose").await;
    assert_eq!(frames.last().unwrap()["status"], "disposed");
}

#[tokio::test]
async fn test_ws_terminate_then_close_disposes() {
    let gateway = start_test_gateway().await;
    let mut ws = connect(gateway.port).await;

    send(&mut ws, json!({"type": "init", "model_kind": "STS"})).await;
    read_until(&mut ws, |f| f["type"] == "init" && f["model_kind"] == "STS").await;
    assert_eq!(gateway.stats.constructions(), 3);

    send(&mut ws, json!({"type": "terminate", "request_id": "end"})).await;
    let frames = read_until(&mut ws, |f| f["type"] == "terminated").await;
    assert_eq!(frames.last().unwrap()["request_id"], "end");
    assert_eq!(gateway.stats.disposals(), 3);

    send(&mut ws, json!({"type": "init", "model_kind": "TG"})).await;
    let frames = read_until(&mut ws, |f| f["type"] == "error").await;
    assert_eq!(frames.last().unwrap()["reason"], "Worker has stopped");

    ws.close(None).await.unwrap();
}

#[tokio::test]
async fn test_connections_get_separate_pipelines() {
    let gateway = start_test_gateway().await;
    let mut first = connect(gateway.port).await;
    let mut second = connect(gateway.port).await;

    for ws in [&mut first, &mut second] {
        send(ws, json!({"type": "inference", "model_kind": "TG", "payload": "hi"})).await;
        let frames = read_until(ws, |f| is_terminal(f, "TG")).await;
        assert_eq!(frames.last().unwrap()["data"], "You said: hi");
    }
    assert_eq!(gateway.stats.constructions(), 2);
}
