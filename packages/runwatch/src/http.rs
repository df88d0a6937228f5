use std::time::Duration;

use futures::future::BoxFuture;
use futures::StreamExt;
use reqwest::Client;
use serde::Deserialize;
use serde_json::Value;
use tokio::sync::mpsc;

use runwatch_engine::{
    ConnectionFactory, ExecutionRun, RunConnection, RunHistorySource, RunStatus, StreamEvent,
};
use runwatch_error::EngineError;

const API_PREFIX: &str = "/v1";
const EVENT_CHANNEL_SIZE: usize = 256;
const CONNECT_TIMEOUT: Duration = Duration::from_secs(10);

#[derive(Debug, Deserialize)]
struct RunListResponse {
    runs: Vec<ExecutionRun>,
}

/// Fetches the authoritative run list for a thread over HTTP.
#[derive(Debug, Clone)]
pub struct HttpRunSource {
    client: Client,
    endpoint: String,
}

impl HttpRunSource {
    pub fn new(endpoint: &str) -> Self {
        Self {
            client: Client::new(),
            endpoint: endpoint.trim_end_matches('/').to_string(),
        }
    }
}

impl RunHistorySource for HttpRunSource {
    fn fetch_runs(&self, key: &str) -> BoxFuture<'static, Result<Vec<ExecutionRun>, EngineError>> {
        let client = self.client.clone();
        let url = format!("{}{API_PREFIX}/threads/{key}/runs", self.endpoint);
        let key = key.to_string();
        Box::pin(async move {
            let response = client
                .get(&url)
                .timeout(CONNECT_TIMEOUT)
                .send()
                .await
                .and_then(|response| response.error_for_status())
                .map_err(|err| EngineError::FetchFailed {
                    key: key.clone(),
                    message: err.to_string(),
                })?;
            let body: RunListResponse =
                response.json().await.map_err(|err| EngineError::FetchFailed {
                    key: key.clone(),
                    message: err.to_string(),
                })?;
            Ok(body.runs)
        })
    }
}

/// Opens the SSE event stream for a run and adapts it to [`StreamEvent`]s.
#[derive(Debug, Clone)]
pub struct HttpStreamFactory {
    client: Client,
    endpoint: String,
}

impl HttpStreamFactory {
    pub fn new(endpoint: &str) -> Self {
        Self {
            client: Client::new(),
            endpoint: endpoint.trim_end_matches('/').to_string(),
        }
    }
}

impl ConnectionFactory for HttpStreamFactory {
    fn open(&self, run_id: &str) -> BoxFuture<'static, Result<RunConnection, EngineError>> {
        let client = self.client.clone();
        let url = format!("{}{API_PREFIX}/runs/{run_id}/events", self.endpoint);
        let run_id = run_id.to_string();
        Box::pin(async move {
            let response = client
                .get(&url)
                .header("accept", "text/event-stream")
                .send()
                .await
                .and_then(|response| response.error_for_status())
                .map_err(|err| EngineError::TransportFailed {
                    run_id: run_id.clone(),
                    message: err.to_string(),
                })?;

            let (tx, rx) = mpsc::channel(EVENT_CHANNEL_SIZE);
            tokio::spawn(pump_sse(run_id, response, tx));
            Ok(RunConnection { events: rx })
        })
    }
}

/// Reads the SSE body line by line and forwards decoded events. Dropping the
/// sender without a terminal event tells the registry the stream died early.
async fn pump_sse(run_id: String, response: reqwest::Response, tx: mpsc::Sender<StreamEvent>) {
    let mut body = response.bytes_stream();
    let mut buffer = String::new();

    while let Some(chunk) = body.next().await {
        let chunk = match chunk {
            Ok(chunk) => chunk,
            Err(err) => {
                let _ = tx
                    .send(StreamEvent::TransportError(err.to_string()))
                    .await;
                return;
            }
        };
        buffer.push_str(&String::from_utf8_lossy(&chunk));

        while let Some(newline) = buffer.find('\n') {
            let line: String = buffer.drain(..=newline).collect();
            let Some(event) = parse_sse_line(line.trim_end()) else {
                continue;
            };
            let terminal = matches!(event, StreamEvent::Terminal(_));
            if tx.send(event).await.is_err() {
                // receiver gone, the registry already closed this connection
                return;
            }
            if terminal {
                return;
            }
        }
    }
    tracing::debug!(run_id = %run_id, "event stream ended without a terminal event");
}

/// Decode one SSE line. Only `data:` lines carry payloads; a payload whose
/// `status` field is a terminal run status closes the stream.
fn parse_sse_line(line: &str) -> Option<StreamEvent> {
    let line = line.trim();
    if line.is_empty() || line.starts_with(':') {
        return None;
    }
    let data = line.strip_prefix("data:")?.trim_start();
    let value: Value = serde_json::from_str(data).ok()?;

    if let Some(status) = value.get("status") {
        if let Ok(status) = serde_json::from_value::<RunStatus>(status.clone()) {
            if status.is_terminal() {
                return Some(StreamEvent::Terminal(status));
            }
        }
    }
    Some(StreamEvent::Message(value))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn comments_and_field_lines_are_skipped() {
        assert!(parse_sse_line("").is_none());
        assert!(parse_sse_line(": keepalive").is_none());
        assert!(parse_sse_line("event: message").is_none());
    }

    #[test]
    fn data_line_decodes_to_message() {
        let event = parse_sse_line(r#"data: {"delta": "hello"}"#).expect("event");
        match event {
            StreamEvent::Message(value) => assert_eq!(value["delta"], "hello"),
            other => panic!("unexpected event: {other:?}"),
        }
    }

    #[test]
    fn terminal_status_closes_the_stream() {
        let event = parse_sse_line(r#"data: {"status": "completed"}"#).expect("event");
        assert!(matches!(event, StreamEvent::Terminal(RunStatus::Completed)));
    }

    #[test]
    fn running_status_is_a_plain_message() {
        let event = parse_sse_line(r#"data: {"status": "running"}"#).expect("event");
        assert!(matches!(event, StreamEvent::Message(_)));
    }

    #[test]
    fn malformed_data_is_skipped() {
        assert!(parse_sse_line("data: not json").is_none());
    }
}
