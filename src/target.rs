//! WebSocket JSON-RPC target.
//!
//! Requests are `{"id":n,"method":m,"params":{..}}`; replies carry the same id
//! with either `result` or `error.message`. Each slot owns one socket which is
//! opened on first use and dropped after any transport error, so the next call
//! on that slot reconnects.

use crate::error::{Error, Result};
use crate::runner::{OpContext, Outcome};
use crate::scenario::Operation;
use crate::selector::BoundSource;
use futures_util::{SinkExt, StreamExt};
use serde::{Deserialize, Serialize};
use sonic_rs::JsonValueTrait;
use std::sync::atomic::{AtomicU64, AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::net::TcpStream;
use tokio::sync::Mutex;
use tokio::time::Instant;
use tokio_tungstenite::tungstenite::Message;
use tokio_tungstenite::{connect_async, MaybeTlsStream, WebSocketStream};
use tracing::debug;
use url::Url;

type WsStream = WebSocketStream<MaybeTlsStream<TcpStream>>;

// =============================================================================
// Wire format
// =============================================================================

#[derive(Debug, Serialize)]
struct RpcRequest<'a> {
    id: u64,
    method: &'a str,
    params: &'a sonic_rs::Value,
}

#[derive(Debug, Deserialize)]
struct RpcReply {
    #[serde(default)]
    id: Option<u64>,
    #[serde(default)]
    result: Option<sonic_rs::Value>,
    #[serde(default)]
    error: Option<RpcError>,
}

#[derive(Debug, Deserialize)]
struct RpcError {
    #[serde(default)]
    message: String,
}

/// A successful reply: the `result` value and the size of the frame it came in.
#[derive(Debug, Clone)]
pub struct Reply {
    pub result: sonic_rs::Value,
    pub bytes: u64,
}

// =============================================================================
// Client
// =============================================================================

pub struct WsTarget {
    url: Url,
    slots: Vec<Mutex<Option<WsStream>>>,
    next_slot: AtomicUsize,
    next_id: AtomicU64,
}

impl WsTarget {
    /// `slots` is the number of sockets calls are spread over (at least one).
    pub fn new(target: &str, slots: usize) -> Result<Self> {
        let url = Url::parse(target).map_err(|e| Error::InvalidTarget {
            target: target.to_string(),
            reason: e.to_string(),
        })?;
        if !matches!(url.scheme(), "ws" | "wss") {
            return Err(Error::InvalidTarget {
                target: target.to_string(),
                reason: format!("unsupported scheme `{}`", url.scheme()),
            });
        }
        Ok(Self {
            url,
            slots: (0..slots.max(1)).map(|_| Mutex::new(None)).collect(),
            next_slot: AtomicUsize::new(0),
            next_id: AtomicU64::new(1),
        })
    }

    pub fn url(&self) -> &Url {
        &self.url
    }

    /// Sends one request and waits for its reply.
    ///
    /// Errors are returned as plain messages: they end up in the request log
    /// and are classified from their text.
    pub async fn call(
        &self,
        method: &str,
        params: &sonic_rs::Value,
    ) -> std::result::Result<Reply, String> {
        let slot = self.next_slot.fetch_add(1, Ordering::Relaxed) % self.slots.len();
        let mut guard = self.slots[slot].lock().await;

        if guard.is_none() {
            debug!("slot {} connecting to {}", slot, self.url);
            let (stream, _) = connect_async(self.url.as_str())
                .await
                .map_err(|e| format!("connect: {e}"))?;
            *guard = Some(stream);
        }
        let Some(stream) = guard.as_mut() else {
            return Err("connection unavailable".to_string());
        };

        let id = self.next_id.fetch_add(1, Ordering::Relaxed);
        let result = exchange(stream, id, method, params).await;
        if let Err(Failure::Transport(e)) = &result {
            debug!("slot {} dropped: {}", slot, e);
            *guard = None;
        }
        result.map_err(|f| f.to_string())
    }
}

enum Failure {
    /// The socket is unusable and must be reopened.
    Transport(String),
    /// The target answered with an error.
    Remote(String),
}

impl std::fmt::Display for Failure {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Failure::Transport(e) | Failure::Remote(e) => f.write_str(e),
        }
    }
}

async fn exchange(
    stream: &mut WsStream,
    id: u64,
    method: &str,
    params: &sonic_rs::Value,
) -> std::result::Result<Reply, Failure> {
    let request = sonic_rs::to_string(&RpcRequest { id, method, params })
        .map_err(|e| Failure::Remote(format!("encode request: {e}")))?;
    stream
        .send(Message::Text(request))
        .await
        .map_err(|e| Failure::Transport(e.to_string()))?;

    loop {
        let text = match stream.next().await {
            Some(Ok(Message::Text(text))) => text,
            Some(Ok(Message::Ping(payload))) => {
                stream
                    .send(Message::Pong(payload))
                    .await
                    .map_err(|e| Failure::Transport(e.to_string()))?;
                continue;
            }
            Some(Ok(Message::Close(_))) | None => {
                return Err(Failure::Transport("unexpected EOF".to_string()))
            }
            Some(Ok(_)) => continue,
            Some(Err(e)) => return Err(Failure::Transport(e.to_string())),
        };

        let reply: RpcReply = match sonic_rs::from_str(&text) {
            Ok(reply) => reply,
            Err(e) => {
                debug!("unparseable frame: {} - Raw: {}", e, text);
                continue;
            }
        };
        // replies to abandoned requests on this socket
        if reply.id != Some(id) {
            continue;
        }
        if let Some(err) = reply.error {
            return Err(Failure::Remote(err.message));
        }
        return Ok(Reply {
            result: reply.result.unwrap_or_default(),
            bytes: text.len() as u64,
        });
    }
}

// =============================================================================
// Operation and bound source
// =============================================================================

/// Calls `method` with parameters built from the work item.
pub struct RpcOperation<P> {
    target: Arc<WsTarget>,
    method: String,
    params: P,
}

impl<P> RpcOperation<P> {
    pub fn new(target: Arc<WsTarget>, method: impl Into<String>, params: P) -> Self {
        Self {
            target,
            method: method.into(),
            params,
        }
    }
}

impl<I, P> Operation<I> for RpcOperation<P>
where
    I: Send,
    P: Fn(I) -> sonic_rs::Value + Send + Sync,
{
    fn name(&self) -> &str {
        &self.method
    }

    async fn execute(&self, item: I, ctx: OpContext) -> Outcome {
        let params = (self.params)(item);
        let start = Instant::now();
        let call = self.target.call(&self.method, &params);
        let res = tokio::time::timeout(ctx.remaining(), call).await;
        let latency_ms = start.elapsed().as_millis() as i64;
        match res {
            Ok(Ok(reply)) => Outcome::success(latency_ms, reply.bytes),
            Ok(Err(e)) => Outcome::failure(latency_ms, e),
            Err(_) => Outcome::failure(latency_ms, format!("timeout after {:?}", ctx.timeout)),
        }
    }
}

/// Reads the head sequence number from `getLatest` → `result.seqno`.
#[derive(Clone)]
pub struct LatestSeqno {
    target: Arc<WsTarget>,
    timeout: Duration,
}

impl LatestSeqno {
    pub fn new(target: Arc<WsTarget>, timeout: Duration) -> Self {
        Self { target, timeout }
    }
}

impl BoundSource for LatestSeqno {
    async fn latest(&self) -> Result<i32> {
        let params = sonic_rs::json!({});
        let reply = tokio::time::timeout(self.timeout, self.target.call("getLatest", &params))
            .await
            .map_err(|_| Error::BoundFetch(format!("getLatest timeout after {:?}", self.timeout)))?
            .map_err(Error::BoundFetch)?;
        reply.result["seqno"]
            .as_i64()
            .and_then(|v| i32::try_from(v).ok())
            .ok_or_else(|| Error::BoundFetch("getLatest: missing result.seqno".to_string()))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tokio::net::TcpListener;

    /// Answers `getLatest` with seqno 4242, `getBlock` with the requested seqno
    /// and everything else with an error. Closes the socket on `hangup`.
    async fn serve() -> String {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        tokio::spawn(async move {
            while let Ok((tcp, _)) = listener.accept().await {
                tokio::spawn(async move {
                    let mut ws = tokio_tungstenite::accept_async(tcp).await.unwrap();
                    while let Some(Ok(Message::Text(text))) = ws.next().await {
                        let req: sonic_rs::Value = sonic_rs::from_str(&text).unwrap();
                        let id = req["id"].as_u64().unwrap();
                        let reply = match req["method"].as_str().unwrap() {
                            "getLatest" => sonic_rs::json!({"id": id, "result": {"seqno": 4242}}),
                            "getBlock" => {
                                let seqno = req["params"]["seqno"].as_i64().unwrap();
                                sonic_rs::json!({"id": id, "result": {"seqno": seqno}})
                            }
                            "hangup" => return,
                            _ => sonic_rs::json!({"id": id, "error": {"message": "unknown query"}}),
                        };
                        ws.send(Message::Text(sonic_rs::to_string(&reply).unwrap())).await.unwrap();
                    }
                });
            }
        });
        format!("ws://{addr}")
    }

    #[test]
    fn rejects_non_websocket_urls() {
        assert!(matches!(WsTarget::new("http://host:80", 1), Err(Error::InvalidTarget { .. })));
        assert!(matches!(WsTarget::new("not a url", 1), Err(Error::InvalidTarget { .. })));
        assert!(WsTarget::new("wss://host:443/rpc", 0).is_ok());
    }

    #[tokio::test]
    #[ntest::timeout(10000)]
    async fn operation_reports_success_and_remote_errors() {
        let target = Arc::new(WsTarget::new(&serve().await, 2).unwrap());

        let get_block = RpcOperation::new(Arc::clone(&target), "getBlock", |seqno: i32| {
            sonic_rs::json!({ "seqno": seqno })
        });
        let ok = get_block.execute(17, OpContext::new(Duration::from_secs(5))).await;
        assert!(ok.ok, "{:?}", ok.error);
        assert!(ok.resp_bytes > 0);

        let bogus =
            RpcOperation::new(Arc::clone(&target), "getNothing", |_: i32| sonic_rs::json!({}));
        let err = bogus.execute(1, OpContext::new(Duration::from_secs(5))).await;
        assert!(!err.ok);
        assert_eq!(err.error.as_deref(), Some("unknown query"));
        assert_eq!(Operation::<i32>::name(&bogus), "getNothing");
    }

    #[tokio::test]
    #[ntest::timeout(10000)]
    async fn bound_source_reads_seqno() {
        let target = Arc::new(WsTarget::new(&serve().await, 1).unwrap());
        let bound = LatestSeqno::new(target, Duration::from_secs(5));
        assert_eq!(bound.latest().await.unwrap(), 4242);
    }

    #[tokio::test]
    #[ntest::timeout(10000)]
    async fn reconnects_after_hangup() {
        let target = WsTarget::new(&serve().await, 1).unwrap();
        let err = target.call("hangup", &sonic_rs::json!({})).await.unwrap_err();
        let lower = err.to_lowercase();
        assert!(lower.contains("eof") || lower.contains("reset"), "{err}");

        let reply = target.call("getLatest", &sonic_rs::json!({})).await.unwrap();
        assert_eq!(reply.result["seqno"].as_i64(), Some(4242));
    }

    #[tokio::test]
    #[ntest::timeout(10000)]
    async fn connect_failure_is_an_outcome() {
        // bind then drop to get a port nothing listens on
        let addr = TcpListener::bind("127.0.0.1:0").await.unwrap().local_addr().unwrap();
        let target = Arc::new(WsTarget::new(&format!("ws://{addr}"), 1).unwrap());
        let op = RpcOperation::new(target, "getBlock", |seqno: i32| {
            sonic_rs::json!({ "seqno": seqno })
        });
        let outcome = op.execute(1, OpContext::new(Duration::from_secs(2))).await;
        assert!(!outcome.ok);
        assert!(outcome.error.unwrap().starts_with("connect:"));
    }
}
