//! Streaming completion relay.
//!
//! Sends an assembled prompt to an OpenAI-compatible chat-completions
//! endpoint with `stream: true` and re-emits the response incrementally as
//! [`StreamEvent`]s over a bounded channel. Consumers read the channel as a
//! straight-line loop; event order is exactly the upstream delta order.
//!
//! Contract:
//! - deltas are forwarded as soon as an SSE line is parsed, no batching
//! - every session ends with exactly one terminal event (`Done` or `Error`)
//! - if the consumer drops the receiver (client disconnect), the next send
//!   fails, the relay task returns, and dropping the reqwest response
//!   cancels the upstream request

use std::time::Duration;

use futures_util::StreamExt;
use serde::Serialize;
use tokio::sync::mpsc;
use tracing::{debug, warn};

use crate::config::CompletionConfig;
use crate::error::PipelineError;
use crate::models::StreamEvent;

/// One message in the chat-completions request body.
#[derive(Debug, Clone, Serialize)]
pub struct ChatMessage {
    pub role: String,
    pub content: String,
}

const SYSTEM_PREAMBLE: &str =
    "You are a helpful assistant. Use the provided document excerpts to ground \
     your answer when they are relevant.";

/// Build the message list for one chat turn.
///
/// A non-empty context block rides in the system message; an empty block
/// adds nothing beyond the preamble.
pub fn build_messages(user_message: &str, context_block: &str) -> Vec<ChatMessage> {
    let system = if context_block.is_empty() {
        SYSTEM_PREAMBLE.to_string()
    } else {
        format!("{}\n\n{}", SYSTEM_PREAMBLE, context_block)
    };

    vec![
        ChatMessage {
            role: "system".to_string(),
            content: system,
        },
        ChatMessage {
            role: "user".to_string(),
            content: user_message.to_string(),
        },
    ]
}

/// Start a relay session. Returns the consumer end of the event channel;
/// the upstream request runs in a spawned task tied to it.
pub fn stream_completion(
    config: CompletionConfig,
    messages: Vec<ChatMessage>,
) -> mpsc::Receiver<StreamEvent> {
    let (tx, rx) = mpsc::channel(32);

    tokio::spawn(async move {
        let terminal = match relay_upstream(&config, messages, &tx).await {
            Ok(()) => StreamEvent::Done,
            Err(e) => {
                warn!(error = %e, "completion stream failed");
                StreamEvent::Error(e.to_string())
            }
        };
        // Send failure here means the client already went away; the
        // upstream response was dropped above either way.
        let _ = tx.send(terminal).await;
    });

    rx
}

/// Run the upstream request, forwarding deltas. Returns `Ok(())` both on a
/// normal `[DONE]` and when the consumer disappears mid-stream; the caller
/// owns the single terminal event.
async fn relay_upstream(
    config: &CompletionConfig,
    messages: Vec<ChatMessage>,
    tx: &mpsc::Sender<StreamEvent>,
) -> Result<(), PipelineError> {
    let api_key = std::env::var("OPENAI_API_KEY")
        .map_err(|_| PipelineError::CompletionProvider("OPENAI_API_KEY not set".to_string()))?;

    let client = reqwest::Client::builder()
        .timeout(Duration::from_secs(config.timeout_secs))
        .build()
        .map_err(|e| PipelineError::CompletionProvider(e.to_string()))?;

    let url = format!("{}/chat/completions", config.base_url.trim_end_matches('/'));
    let body = serde_json::json!({
        "model": config.model,
        "messages": messages,
        "stream": true,
    });

    let response = client
        .post(&url)
        .header("Authorization", format!("Bearer {}", api_key))
        .header("Content-Type", "application/json")
        .json(&body)
        .send()
        .await
        .map_err(|e| PipelineError::CompletionProvider(e.to_string()))?;

    let status = response.status();
    if !status.is_success() {
        let body_text = response.text().await.unwrap_or_default();
        return Err(PipelineError::CompletionProvider(format!(
            "upstream HTTP {}: {}",
            status, body_text
        )));
    }

    let mut bytes_stream = response.bytes_stream();
    let mut lines = SseLineBuffer::new();

    while let Some(chunk_result) = bytes_stream.next().await {
        let chunk = chunk_result.map_err(|e| PipelineError::CompletionProvider(e.to_string()))?;

        for line in lines.push(&chunk) {
            let Some(data) = line.strip_prefix("data: ") else {
                continue;
            };
            if data == "[DONE]" {
                return Ok(());
            }
            if let Some(delta) = delta_from_data(data) {
                if tx.send(StreamEvent::Delta(delta)).await.is_err() {
                    // Client disconnected; dropping the response on return
                    // cancels the upstream request.
                    debug!("relay consumer dropped, cancelling upstream stream");
                    return Ok(());
                }
            }
        }
    }

    // Stream ended without [DONE]; treat as a normal end of response.
    Ok(())
}

/// Reassembles complete lines from arbitrarily split stream chunks.
struct SseLineBuffer {
    buf: String,
}

impl SseLineBuffer {
    fn new() -> Self {
        Self { buf: String::new() }
    }

    /// Append raw bytes and drain every complete line.
    fn push(&mut self, bytes: &[u8]) -> Vec<String> {
        self.buf.push_str(&String::from_utf8_lossy(bytes));

        let mut lines = Vec::new();
        while let Some(pos) = self.buf.find('\n') {
            let line = self.buf[..pos].trim_end_matches('\r').trim().to_string();
            self.buf = self.buf[pos + 1..].to_string();
            if !line.is_empty() {
                lines.push(line);
            }
        }
        lines
    }
}

/// Extract the content delta from one `data:` JSON payload, if any.
fn delta_from_data(data: &str) -> Option<String> {
    let json: serde_json::Value = match serde_json::from_str(data) {
        Ok(v) => v,
        Err(e) => {
            debug!(error = %e, "skipping unparseable stream chunk");
            return None;
        }
    };

    json.get("choices")
        .and_then(|c| c.get(0))
        .and_then(|c| c.get("delta"))
        .and_then(|d| d.get("content"))
        .and_then(|c| c.as_str())
        .filter(|s| !s.is_empty())
        .map(|s| s.to_string())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_line_buffer_reassembles_split_frames() {
        let mut buf = SseLineBuffer::new();
        assert!(buf.push(b"data: {\"a\":").is_empty());
        let lines = buf.push(b"1}\n\ndata: two\n");
        assert_eq!(lines, vec!["data: {\"a\":1}", "data: two"]);
    }

    #[test]
    fn test_line_buffer_strips_crlf() {
        let mut buf = SseLineBuffer::new();
        let lines = buf.push(b"data: hello\r\n");
        assert_eq!(lines, vec!["data: hello"]);
    }

    #[test]
    fn test_delta_extraction() {
        let data = r#"{"id":"c1","choices":[{"delta":{"content":"Hel"},"finish_reason":null}]}"#;
        assert_eq!(delta_from_data(data), Some("Hel".to_string()));
    }

    #[test]
    fn test_delta_absent_for_role_frame() {
        let data = r#"{"id":"c1","choices":[{"delta":{"role":"assistant"},"finish_reason":null}]}"#;
        assert_eq!(delta_from_data(data), None);
    }

    #[test]
    fn test_delta_absent_for_garbage() {
        assert_eq!(delta_from_data("not json"), None);
    }

    #[test]
    fn test_build_messages_with_and_without_context() {
        let with = build_messages("what is rust?", "[Source: a.txt (d1)]\nRust is a language.\n");
        assert_eq!(with.len(), 2);
        assert!(with[0].content.contains("[Source: a.txt (d1)]"));
        assert_eq!(with[1].role, "user");

        let without = build_messages("hello", "");
        assert!(!without[0].content.contains("[Source"));
        assert_eq!(without[1].content, "hello");
    }
}
