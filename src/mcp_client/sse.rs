//! JSON-RPC over server-sent events: the stream transport.
//!
//! The client holds a long-lived `GET` whose body is an SSE stream. The
//! server's first `endpoint` event names the URL to `POST` requests to;
//! responses come back as `message` events on the stream.

use std::pin::Pin;

use async_trait::async_trait;
use futures::stream::{self, Stream, StreamExt};
use reqwest::header::ACCEPT;
use reqwest::Url;

use super::errors::McpError;
use super::transport::{next_request_id, Transport};
use super::types::{JsonRpcNotification, JsonRpcRequest, JsonRpcResponse};

/// Parsed SSE events, in arrival order.
type EventStream = Pin<Box<dyn Stream<Item = Result<SseEvent, McpError>> + Send>>;

// ─── Events ──────────────────────────────────────────────────────────────────

/// One server-sent event.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SseEvent {
    /// Event type; `message` when the server sends none.
    pub event: String,
    pub data: String,
}

/// Parse one event block (the text between blank lines).
///
/// Returns `None` for blocks carrying nothing but comments or ignored
/// fields, which servers send as keep-alives.
pub fn parse_event(block: &str) -> Option<SseEvent> {
    let mut event = None;
    let mut data_lines: Vec<&str> = Vec::new();

    for line in block.lines() {
        if line.is_empty() || line.starts_with(':') {
            continue;
        }
        let (field, value) = match line.split_once(':') {
            Some((field, value)) => (field, value.strip_prefix(' ').unwrap_or(value)),
            None => (line, ""),
        };
        match field {
            "event" => event = Some(value.to_string()),
            "data" => data_lines.push(value),
            _ => {} // id, retry
        }
    }

    if event.is_none() && data_lines.is_empty() {
        return None;
    }

    Some(SseEvent {
        event: event.unwrap_or_else(|| "message".to_string()),
        data: data_lines.join("\n"),
    })
}

/// Framing state carried between polls of the event stream.
struct Framer<S> {
    bytes: Pin<Box<S>>,
    buffer: Vec<u8>,
    server_name: String,
    finished: bool,
}

/// Split a byte stream into SSE events.
///
/// Bytes are buffered across chunk boundaries so neither an event nor a
/// multi-byte character can be cut in half. Carriage returns are dropped,
/// which normalizes CRLF framing.
fn event_stream<S, B, E>(server_name: String, bytes: S) -> EventStream
where
    S: Stream<Item = Result<B, E>> + Send + 'static,
    B: AsRef<[u8]> + Send + 'static,
    E: std::fmt::Display + Send + 'static,
{
    let framer = Framer {
        bytes: Box::pin(bytes),
        buffer: Vec::new(),
        server_name,
        finished: false,
    };

    Box::pin(stream::unfold(framer, |mut st| async move {
        loop {
            if let Some(end) = st.buffer.windows(2).position(|w| w == b"\n\n") {
                let block: Vec<u8> = st.buffer.drain(..end + 2).collect();
                let text = String::from_utf8_lossy(&block[..end]);
                match parse_event(&text) {
                    Some(event) => return Some((Ok(event), st)),
                    None => continue, // keep-alive
                }
            }

            if st.finished {
                return None;
            }

            match st.bytes.next().await {
                Some(Ok(chunk)) => {
                    st.buffer
                        .extend(chunk.as_ref().iter().copied().filter(|b| *b != b'\r'));
                }
                Some(Err(e)) => {
                    st.finished = true;
                    let err = McpError::Transport {
                        server: st.server_name.clone(),
                        reason: format!("stream read error: {e}"),
                    };
                    return Some((Err(err), st));
                }
                None => {
                    // Stream ended; a final unterminated event still counts.
                    st.finished = true;
                    let rest = std::mem::take(&mut st.buffer);
                    let text = String::from_utf8_lossy(&rest);
                    return parse_event(text.trim_end()).map(|event| (Ok(event), st));
                }
            }
        }
    }))
}

/// Resolve the `endpoint` event's data against the stream URL.
///
/// The POST target must share the stream's origin.
pub fn resolve_endpoint(server_name: &str, base: &Url, data: &str) -> Result<Url, McpError> {
    let endpoint = base.join(data.trim()).map_err(|e| McpError::Protocol {
        server: server_name.to_string(),
        reason: format!("invalid endpoint '{data}': {e}"),
    })?;
    if endpoint.origin() != base.origin() {
        return Err(McpError::Protocol {
            server: server_name.to_string(),
            reason: format!("endpoint origin mismatch: {endpoint} vs {base}"),
        });
    }
    Ok(endpoint)
}

// ─── SseTransport ────────────────────────────────────────────────────────────

/// JSON-RPC transport over an SSE stream plus HTTP POSTs.
pub struct SseTransport {
    server_name: String,
    http: reqwest::Client,
    post_url: Url,
    /// `None` once closed; dropping it closes the HTTP connection.
    events: Option<EventStream>,
}

impl std::fmt::Debug for SseTransport {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SseTransport")
            .field("server_name", &self.server_name)
            .field("post_url", &self.post_url.as_str())
            .field("open", &self.events.is_some())
            .finish()
    }
}

impl SseTransport {
    /// Open the event stream and wait for the server's `endpoint` event.
    pub async fn open(server_name: &str, http: reqwest::Client, url: Url) -> Result<Self, McpError> {
        let response = http
            .get(url.clone())
            .header(ACCEPT, "text/event-stream")
            .send()
            .await
            .map_err(|e| transport_error(server_name, format!("failed to open stream {url}: {e}")))?;

        let status = response.status();
        if !status.is_success() {
            return Err(transport_error(
                server_name,
                format!("stream {url} returned HTTP {status}"),
            ));
        }

        let mut events = event_stream(server_name.to_string(), response.bytes_stream());

        let post_url = loop {
            match events.next().await {
                Some(Ok(event)) if event.event == "endpoint" => {
                    break resolve_endpoint(server_name, &url, &event.data)?;
                }
                Some(Ok(event)) => {
                    tracing::trace!(server = server_name, event = %event.event, "ignoring event before endpoint");
                }
                Some(Err(e)) => return Err(e),
                None => {
                    return Err(transport_error(
                        server_name,
                        "stream closed before endpoint event".into(),
                    ))
                }
            }
        };

        tracing::debug!(server = server_name, endpoint = %post_url, "stream endpoint received");

        Ok(Self {
            server_name: server_name.to_string(),
            http,
            post_url,
            events: Some(events),
        })
    }
}

#[async_trait]
impl Transport for SseTransport {
    async fn request(
        &mut self,
        method: &str,
        params: Option<serde_json::Value>,
    ) -> Result<JsonRpcResponse, McpError> {
        let id = next_request_id();
        let request = JsonRpcRequest::new(id, method, params);
        post_message(&self.http, &self.post_url, &self.server_name, &request).await?;

        let Some(events) = self.events.as_mut() else {
            return Err(transport_error(&self.server_name, "stream closed".into()));
        };

        loop {
            match events.next().await {
                Some(Ok(event)) if event.event == "message" => {
                    match serde_json::from_str::<JsonRpcResponse>(&event.data) {
                        Ok(resp) if resp.answers(id) => return Ok(resp),
                        Ok(_) => continue,
                        Err(e) => {
                            tracing::trace!(server = %self.server_name, error = %e, "skipping malformed message event");
                        }
                    }
                }
                Some(Ok(_)) => continue,
                Some(Err(e)) => return Err(e),
                None => {
                    return Err(transport_error(
                        &self.server_name,
                        "event stream ended".into(),
                    ))
                }
            }
        }
    }

    async fn notify(
        &mut self,
        method: &str,
        params: Option<serde_json::Value>,
    ) -> Result<(), McpError> {
        let notification = JsonRpcNotification::new(method, params);
        post_message(&self.http, &self.post_url, &self.server_name, &notification).await
    }

    async fn close(&mut self) -> Result<(), McpError> {
        self.events = None;
        Ok(())
    }
}

/// POST one JSON-RPC message to the session endpoint.
///
/// Borrows fields, not the transport: the event stream is not `Sync`.
async fn post_message<T: serde::Serialize + ?Sized>(
    http: &reqwest::Client,
    url: &Url,
    server_name: &str,
    message: &T,
) -> Result<(), McpError> {
    let response = http
        .post(url.clone())
        .json(message)
        .send()
        .await
        .map_err(|e| transport_error(server_name, format!("failed to post message: {e}")))?;

    let status = response.status();
    if !status.is_success() {
        let body = response.text().await.unwrap_or_default();
        return Err(transport_error(
            server_name,
            format!("post returned HTTP {status}: {body}"),
        ));
    }
    Ok(())
}

fn transport_error(server: &str, reason: String) -> McpError {
    McpError::Transport {
        server: server.to_string(),
        reason,
    }
}

// ─── Tests ───────────────────────────────────────────────────────────────────
