//! Streaming relay tests against a mocked chat-completions endpoint.

use std::time::Duration;

use httpmock::prelude::*;
use tokio::io::{AsyncReadExt, AsyncWriteExt};

use ragline::config::CompletionConfig;
use ragline::models::StreamEvent;
use ragline::relay::{build_messages, stream_completion};

fn completion_config(base_url: &str) -> CompletionConfig {
    CompletionConfig {
        model: "test-chat".to_string(),
        base_url: base_url.to_string(),
        timeout_secs: 5,
    }
}

fn delta_frame(content: &str) -> String {
    format!(
        "data: {{\"id\":\"c1\",\"choices\":[{{\"delta\":{{\"content\":{}}},\"finish_reason\":null}}]}}\n\n",
        serde_json::Value::String(content.to_string())
    )
}

async fn collect_events(mut rx: tokio::sync::mpsc::Receiver<StreamEvent>) -> Vec<StreamEvent> {
    let mut events = Vec::new();
    while let Some(event) = rx.recv().await {
        let terminal = event.is_terminal();
        events.push(event);
        if terminal {
            break;
        }
    }
    events
}

#[tokio::test]
async fn test_deltas_forwarded_in_order_with_done_terminal() {
    std::env::set_var("OPENAI_API_KEY", "test-key");
    let server = MockServer::start_async().await;

    let body = format!(
        "{}{}{}data: [DONE]\n\n",
        delta_frame("Hello"),
        delta_frame(", "),
        delta_frame("world")
    );
    let mock = server
        .mock_async(move |when, then| {
            when.method(POST).path("/chat/completions").body_contains("\"stream\":true");
            then.status(200)
                .header("content-type", "text/event-stream")
                .body(body);
        })
        .await;

    let messages = build_messages("greet me", "");
    let rx = stream_completion(completion_config(&server.base_url()), messages);
    let events = collect_events(rx).await;

    mock.assert_async().await;
    assert_eq!(
        events,
        vec![
            StreamEvent::Delta("Hello".to_string()),
            StreamEvent::Delta(", ".to_string()),
            StreamEvent::Delta("world".to_string()),
            StreamEvent::Done,
        ]
    );
}

#[tokio::test]
async fn test_role_frames_are_skipped() {
    std::env::set_var("OPENAI_API_KEY", "test-key");
    let server = MockServer::start_async().await;

    let body = format!(
        "data: {{\"id\":\"c1\",\"choices\":[{{\"delta\":{{\"role\":\"assistant\"}},\"finish_reason\":null}}]}}\n\n{}data: [DONE]\n\n",
        delta_frame("hi")
    );
    server
        .mock_async(move |when, then| {
            when.method(POST).path("/chat/completions");
            then.status(200).body(body);
        })
        .await;

    let rx = stream_completion(
        completion_config(&server.base_url()),
        build_messages("hello", ""),
    );
    let events = collect_events(rx).await;

    assert_eq!(
        events,
        vec![StreamEvent::Delta("hi".to_string()), StreamEvent::Done]
    );
}

#[tokio::test]
async fn test_upstream_error_emits_single_error_terminal() {
    std::env::set_var("OPENAI_API_KEY", "test-key");
    let server = MockServer::start_async().await;

    server
        .mock_async(|when, then| {
            when.method(POST).path("/chat/completions");
            then.status(503).body("upstream exploded");
        })
        .await;

    let rx = stream_completion(
        completion_config(&server.base_url()),
        build_messages("hello", ""),
    );
    let events = collect_events(rx).await;

    assert_eq!(events.len(), 1);
    match &events[0] {
        StreamEvent::Error(message) => {
            assert!(message.contains("503"));
        }
        other => panic!("expected error terminal, got {:?}", other),
    }
}

#[tokio::test]
async fn test_unreachable_upstream_emits_error_terminal() {
    std::env::set_var("OPENAI_API_KEY", "test-key");

    let rx = stream_completion(
        completion_config("http://127.0.0.1:1"),
        build_messages("hello", ""),
    );
    let events = collect_events(rx).await;

    assert_eq!(events.len(), 1);
    assert!(matches!(events[0], StreamEvent::Error(_)));
}

#[tokio::test]
async fn test_dropped_receiver_cancels_upstream_request() {
    std::env::set_var("OPENAI_API_KEY", "test-key");

    // httpmock cannot drip-feed a response body, so this test serves the
    // stream by hand: one delta frame every 20ms until the peer goes away.
    let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
    let addr = listener.local_addr().unwrap();
    let (closed_tx, closed_rx) = tokio::sync::oneshot::channel::<usize>();

    tokio::spawn(async move {
        let (mut socket, _) = listener.accept().await.unwrap();

        // Drain the request (headers plus the small JSON body).
        let mut request = Vec::new();
        let mut buf = [0u8; 4096];
        loop {
            let n = socket.read(&mut buf).await.unwrap();
            request.extend_from_slice(&buf[..n]);
            if request.windows(4).any(|w| w == b"\r\n\r\n") && request.ends_with(b"}") {
                break;
            }
        }

        let head = "HTTP/1.1 200 OK\r\n\
                    content-type: text/event-stream\r\n\
                    transfer-encoding: chunked\r\n\r\n";
        socket.write_all(head.as_bytes()).await.unwrap();

        let frame = "data: {\"choices\":[{\"delta\":{\"content\":\"x\"}}]}\n\n";
        let chunk = format!("{:x}\r\n{}\r\n", frame.len(), frame);

        // Keep streaming until the write fails: the relay dropping the
        // response must close the connection from the client side.
        let mut frames_written = 0usize;
        for _ in 0..500 {
            if socket.write_all(chunk.as_bytes()).await.is_err() {
                break;
            }
            frames_written += 1;
            tokio::time::sleep(Duration::from_millis(20)).await;
        }
        let _ = closed_tx.send(frames_written);
    });

    let mut rx = stream_completion(
        completion_config(&format!("http://{}", addr)),
        build_messages("hello", ""),
    );

    // Take one delta, then hang up mid-stream.
    let first = rx.recv().await.unwrap();
    assert_eq!(first, StreamEvent::Delta("x".to_string()));
    drop(rx);

    // The server must observe the disconnect well before it runs out of
    // frames; a relay that kept reading would drain all 500.
    let frames_written = tokio::time::timeout(Duration::from_secs(5), closed_rx)
        .await
        .expect("upstream connection was never closed")
        .unwrap();
    assert!(
        frames_written < 500,
        "upstream streamed to completion after client disconnect"
    );
}

#[tokio::test]
async fn test_stream_without_done_still_terminates() {
    std::env::set_var("OPENAI_API_KEY", "test-key");
    let server = MockServer::start_async().await;

    let body = delta_frame("partial");
    server
        .mock_async(move |when, then| {
            when.method(POST).path("/chat/completions");
            then.status(200).body(body);
        })
        .await;

    let rx = stream_completion(
        completion_config(&server.base_url()),
        build_messages("hello", ""),
    );
    let events = collect_events(rx).await;

    assert_eq!(
        events,
        vec![StreamEvent::Delta("partial".to_string()), StreamEvent::Done]
    );
}
