// HTTP+SSE transport for MCP
//
// The client opens a long-lived `GET` on the SSE url. The server's first
// event (`endpoint`) names the url to POST JSON-RPC messages to; responses
// come back as `message` events on the open stream and are matched to the
// waiting request by id.

use async_trait::async_trait;
use futures::{Stream, StreamExt};
use reqwest::header::{ACCEPT, CONTENT_TYPE};
use reqwest::Url;
use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, AtomicI64, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;
use tokio::sync::oneshot;
use tokio::task::JoinHandle;
use tracing::{debug, trace, warn};

use super::{check_response, McpTransport, TransportError};
use crate::mcp::types::{JsonRpcNotification, JsonRpcRequest, JsonRpcResponse, RequestId};
use crate::sse::{SseDecoder, SseEvent};

type PendingMap = Arc<Mutex<HashMap<RequestId, oneshot::Sender<JsonRpcResponse>>>>;

/// SSE transport for MCP server communication
pub struct SseTransport {
    url: String,
    client: reqwest::Client,
    endpoint: Url,
    pending: PendingMap,
    next_id: AtomicI64,
    closed: Arc<AtomicBool>,
    reader: JoinHandle<()>,
    timeout: Duration,
}

impl SseTransport {
    /// Open the event stream and wait for the server to announce its
    /// message endpoint
    pub async fn connect(url: &str, timeout: Duration) -> Result<Self, TransportError> {
        let connect_err = |reason: String| TransportError::Connect {
            url: url.to_string(),
            reason,
        };

        let base = Url::parse(url).map_err(|e| connect_err(e.to_string()))?;

        // No overall request timeout: it would cut the event stream
        let client = reqwest::Client::builder()
            .connect_timeout(timeout)
            .build()?;

        let response = tokio::time::timeout(
            timeout,
            client
                .get(base.clone())
                .header(ACCEPT, "text/event-stream")
                .send(),
        )
        .await
        .map_err(|_| connect_err("timed out opening event stream".to_string()))?
        .map_err(|e| connect_err(e.to_string()))?;

        if !response.status().is_success() {
            return Err(connect_err(format!("server answered {}", response.status())));
        }

        let mut stream = Box::pin(response.bytes_stream());
        let mut decoder = SseDecoder::new();

        let (endpoint, backlog) =
            tokio::time::timeout(timeout, wait_for_endpoint(&mut stream, &mut decoder, &base))
                .await
                .map_err(|_| connect_err("no endpoint event received".to_string()))??;

        debug!("SSE server {} announced endpoint {}", url, endpoint);

        let pending: PendingMap = Arc::new(Mutex::new(HashMap::new()));
        let closed = Arc::new(AtomicBool::new(false));

        let reader = {
            let pending = Arc::clone(&pending);
            let closed = Arc::clone(&closed);
            let label = url.to_string();
            tokio::spawn(async move {
                for event in backlog {
                    dispatch_event(&label, &pending, event);
                }
                while let Some(chunk) = stream.next().await {
                    match chunk {
                        Ok(bytes) => {
                            for event in decoder.feed(&bytes) {
                                dispatch_event(&label, &pending, event);
                            }
                        }
                        Err(e) => {
                            warn!("SSE stream from {} failed: {}", label, e);
                            break;
                        }
                    }
                }
                if let Some(event) = decoder.finish() {
                    dispatch_event(&label, &pending, event);
                }
                debug!("SSE stream from {} ended", label);
                closed.store(true, Ordering::SeqCst);
                // Dropping the senders wakes every waiter with `Closed`
                if let Ok(mut map) = pending.lock() {
                    map.clear();
                }
            })
        };

        Ok(Self {
            url: url.to_string(),
            client,
            endpoint,
            pending,
            next_id: AtomicI64::new(1),
            closed,
            reader,
            timeout,
        })
    }

    pub fn with_timeout(mut self, timeout: Duration) -> Self {
        self.timeout = timeout;
        self
    }

    pub fn endpoint(&self) -> &Url {
        &self.endpoint
    }

    async fn post(&self, body: String) -> Result<(), TransportError> {
        if self.closed.load(Ordering::SeqCst) {
            return Err(TransportError::Closed);
        }

        let response = self
            .client
            .post(self.endpoint.clone())
            .header(CONTENT_TYPE, "application/json")
            .body(body)
            .timeout(self.timeout)
            .send()
            .await?;

        if !response.status().is_success() {
            let status = response.status();
            let text = response.text().await.unwrap_or_default();
            return Err(TransportError::Protocol(format!(
                "POST to {} answered {}: {}",
                self.endpoint, status, text
            )));
        }
        Ok(())
    }

    fn forget(&self, id: &RequestId) {
        if let Ok(mut map) = self.pending.lock() {
            map.remove(id);
        }
    }
}

/// Read events until the server names the message endpoint. Events that
/// arrived in the same chunk after it are handed back.
async fn wait_for_endpoint<S, B>(
    stream: &mut S,
    decoder: &mut SseDecoder,
    base: &Url,
) -> Result<(Url, Vec<SseEvent>), TransportError>
where
    S: Stream<Item = Result<B, reqwest::Error>> + Unpin,
    B: AsRef<[u8]>,
{
    while let Some(chunk) = stream.next().await {
        let chunk = chunk?;
        let mut events = decoder.feed(chunk.as_ref()).into_iter();
        while let Some(event) = events.next() {
            if event.event_type() == "endpoint" {
                let endpoint = base
                    .join(event.data.trim())
                    .map_err(|e| TransportError::Protocol(format!("bad endpoint url: {}", e)))?;
                return Ok((endpoint, events.collect()));
            }
        }
    }
    Err(TransportError::Closed)
}

fn dispatch_event(label: &str, pending: &PendingMap, event: SseEvent) {
    if event.event_type() != "message" {
        trace!("ignoring '{}' event from {}", event.event_type(), label);
        return;
    }

    let value: serde_json::Value = match serde_json::from_str(&event.data) {
        Ok(v) => v,
        Err(e) => {
            warn!("malformed message from {}: {}", label, e);
            return;
        }
    };

    // Server-initiated requests and notifications carry a method
    if value.get("method").is_some() {
        trace!("ignoring server message from {}: {}", label, event.data);
        return;
    }

    let response: JsonRpcResponse = match serde_json::from_value(value) {
        Ok(r) => r,
        Err(e) => {
            warn!("unexpected message from {}: {}", label, e);
            return;
        }
    };

    let sender = pending
        .lock()
        .ok()
        .and_then(|mut map| map.remove(&response.id));
    match sender {
        Some(tx) => {
            let _ = tx.send(response);
        }
        None => trace!("no request waiting for id {} on {}", response.id, label),
    }
}

#[async_trait]
impl McpTransport for SseTransport {
    async fn request(
        &self,
        method: &str,
        params: Option<serde_json::Value>,
    ) -> Result<JsonRpcResponse, TransportError> {
        let id = self.next_id.fetch_add(1, Ordering::SeqCst);
        let request = JsonRpcRequest::new(method, params, id);
        let body = serde_json::to_string(&request)?;
        let id = RequestId::Number(id);

        let (tx, rx) = oneshot::channel();
        self.pending
            .lock()
            .map_err(|_| TransportError::Protocol("pending request table poisoned".into()))?
            .insert(id.clone(), tx);

        trace!(server = %self.url, "-> {}", body);
        if let Err(e) = self.post(body).await {
            self.forget(&id);
            return Err(e);
        }

        match tokio::time::timeout(self.timeout, rx).await {
            Ok(Ok(response)) => check_response(response),
            Ok(Err(_)) => Err(TransportError::Closed),
            Err(_) => {
                self.forget(&id);
                Err(TransportError::Timeout {
                    method: method.to_string(),
                    secs: self.timeout.as_secs(),
                })
            }
        }
    }

    async fn notify(
        &self,
        method: &str,
        params: Option<serde_json::Value>,
    ) -> Result<(), TransportError> {
        let notification = JsonRpcNotification::new(method, params);
        self.post(serde_json::to_string(&notification)?).await
    }

    async fn close(&self) -> Result<(), TransportError> {
        self.closed.store(true, Ordering::SeqCst);
        self.reader.abort();
        if let Ok(mut map) = self.pending.lock() {
            map.clear();
        }
        debug!("Closed SSE connection to {}", self.url);
        Ok(())
    }
}

impl Drop for SseTransport {
    fn drop(&mut self) {
        self.reader.abort();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::test_support::FakeSseServer;

    #[tokio::test]
    async fn test_connect_and_request() {
        let server = FakeSseServer::start().await;
        let transport = SseTransport::connect(&server.sse_url(), Duration::from_secs(5))
            .await
            .unwrap();
        assert!(transport.endpoint().path().starts_with("/messages"));

        let response = transport
            .request("tools/list", Some(serde_json::json!({})))
            .await
            .unwrap();
        let tools = response.result.unwrap()["tools"].as_array().unwrap().len();
        assert_eq!(tools, 4);

        transport.close().await.unwrap();
        assert!(matches!(
            transport.request("ping", None).await,
            Err(TransportError::Closed)
        ));
    }

    #[tokio::test]
    async fn test_server_error_response() {
        let server = FakeSseServer::start().await;
        let transport = SseTransport::connect(&server.sse_url(), Duration::from_secs(5))
            .await
            .unwrap();

        let err = transport.request("resources/list", None).await.unwrap_err();
        assert!(matches!(err, TransportError::Server { code: -32601, .. }));
    }

    #[tokio::test]
    async fn test_concurrent_requests_are_matched_by_id() {
        let server = FakeSseServer::start().await;
        let transport = SseTransport::connect(&server.sse_url(), Duration::from_secs(5))
            .await
            .unwrap();

        let a = transport.request(
            "tools/call",
            Some(serde_json::json!({"name": "get_weather", "arguments": {"city": "Beijing"}})),
        );
        let b = transport.request(
            "tools/call",
            Some(serde_json::json!({"name": "get_weather", "arguments": {"city": "Shanghai"}})),
        );
        let (a, b) = tokio::join!(a, b);

        let text = |r: JsonRpcResponse| r.result.unwrap()["content"][0]["text"].as_str().unwrap().to_string();
        assert!(text(a.unwrap()).starts_with("Beijing"));
        assert!(text(b.unwrap()).starts_with("Shanghai"));
    }

    #[tokio::test]
    async fn test_stream_end_fails_pending_request() {
        let server = FakeSseServer::start_dropping_stream().await;
        let transport = SseTransport::connect(&server.sse_url(), Duration::from_secs(5))
            .await
            .unwrap();

        let err = transport.request("tools/list", None).await.unwrap_err();
        assert!(matches!(err, TransportError::Closed), "unexpected error: {err}");
        // Later requests fail fast
        assert!(matches!(
            transport.request("ping", None).await,
            Err(TransportError::Closed)
        ));
    }

    #[tokio::test]
    async fn test_unanswered_request_times_out() {
        let server = FakeSseServer::start_silent().await;
        let transport = SseTransport::connect(&server.sse_url(), Duration::from_secs(5))
            .await
            .unwrap()
            .with_timeout(Duration::from_millis(200));

        let err = transport.request("tools/list", None).await.unwrap_err();
        match err {
            TransportError::Timeout { method, .. } => assert_eq!(method, "tools/list"),
            other => panic!("unexpected error: {other}"),
        }
        assert!(transport.pending.lock().unwrap().is_empty());
    }

    #[tokio::test]
    async fn test_connect_refused() {
        // Bind then drop to get a port nobody listens on
        let port = {
            let listener = std::net::TcpListener::bind("127.0.0.1:0").unwrap();
            listener.local_addr().unwrap().port()
        };
        let url = format!("http://127.0.0.1:{}/sse", port);
        let err = SseTransport::connect(&url, Duration::from_secs(2))
            .await
            .err()
            .unwrap();
        assert!(matches!(err, TransportError::Connect { .. }));
    }
}
