//! JSON-RPC client for lightningd's unix socket.
//!
//! Plugins call back into lightningd over the `rpc-file` socket named in
//! the `init` configuration. Requests are written as compact JSON;
//! responses arrive as JSON objects separated by blank lines and are
//! routed back to callers by request id.

use std::collections::HashMap;
use std::path::Path;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex};

use serde_json::{json, Value};
use thiserror::Error;
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::UnixStream;
use tokio::sync::{mpsc, oneshot};

/// Errors from upstream RPC calls.
#[derive(Debug, Error)]
pub enum RpcError {
    /// Socket is gone or never came up.
    #[error("rpc connection lost")]
    Disconnected,

    /// lightningd returned a JSON-RPC error.
    #[error("rpc error {code}: {message}")]
    Rpc {
        /// JSON-RPC error code.
        code: i64,
        /// Error message.
        message: String,
    },

    /// A response did not have the expected shape.
    #[error("unexpected rpc response: {0}")]
    BadResponse(String),
}

type Pending = Arc<Mutex<HashMap<u64, oneshot::Sender<Result<Value, RpcError>>>>>;

/// Cloneable JSON-RPC client over the lightningd socket.
#[derive(Clone)]
pub struct RpcClient {
    out_tx: mpsc::UnboundedSender<Vec<u8>>,
    pending: Pending,
    next_id: Arc<AtomicU64>,
}

impl RpcClient {
    /// Connect to the socket and spawn the reader and writer tasks.
    pub async fn connect(path: &Path) -> std::io::Result<RpcClient> {
        let stream = UnixStream::connect(path).await?;
        let (mut read_half, mut write_half) = stream.into_split();

        let (out_tx, mut out_rx) = mpsc::unbounded_channel::<Vec<u8>>();
        let pending: Pending = Arc::new(Mutex::new(HashMap::new()));

        tokio::spawn(async move {
            while let Some(frame) = out_rx.recv().await {
                if write_half.write_all(&frame).await.is_err() {
                    break;
                }
            }
        });

        let reader_pending = pending.clone();
        tokio::spawn(async move {
            let mut buf: Vec<u8> = Vec::new();
            let mut chunk = [0u8; 4096];
            loop {
                match read_half.read(&mut chunk).await {
                    Ok(0) | Err(_) => break,
                    Ok(n) => {
                        buf.extend_from_slice(&chunk[..n]);
                        while let Some(pos) = find_delimiter(&buf) {
                            let frame: Vec<u8> = buf.drain(..pos + 2).collect();
                            match serde_json::from_slice::<Value>(&frame) {
                                Ok(value) => route_response(&reader_pending, value),
                                Err(e) => {
                                    tracing::warn!(error = %e, "bad rpc frame")
                                }
                            }
                        }
                    }
                }
            }
            // Fail everything still waiting.
            let mut pending = reader_pending.lock().expect("pending lock");
            for (_, tx) in pending.drain() {
                let _ = tx.send(Err(RpcError::Disconnected));
            }
        });

        Ok(RpcClient { out_tx, pending, next_id: Arc::new(AtomicU64::new(1)) })
    }

    /// Call a lightningd method and wait for its result.
    pub async fn call(&self, method: &str, params: Value) -> Result<Value, RpcError> {
        let id = self.next_id.fetch_add(1, Ordering::Relaxed);
        let (tx, rx) = oneshot::channel();
        self.pending.lock().expect("pending lock").insert(id, tx);

        let request = json!({
            "jsonrpc": "2.0",
            "id": id,
            "method": method,
            "params": params,
        });
        let mut frame = serde_json::to_vec(&request).expect("requests serialize");
        frame.extend_from_slice(b"\n\n");
        if self.out_tx.send(frame).is_err() {
            self.pending.lock().expect("pending lock").remove(&id);
            return Err(RpcError::Disconnected);
        }

        rx.await.map_err(|_| RpcError::Disconnected)?
    }
}

fn find_delimiter(buf: &[u8]) -> Option<usize> {
    buf.windows(2).position(|w| w == b"\n\n")
}

fn route_response(pending: &Pending, value: Value) {
    let Some(id) = value.get("id").and_then(Value::as_u64) else {
        tracing::debug!("rpc frame without numeric id");
        return;
    };
    let Some(tx) = pending.lock().expect("pending lock").remove(&id) else {
        tracing::debug!(id, "rpc response for unknown request");
        return;
    };
    let outcome = if let Some(err) = value.get("error").filter(|e| !e.is_null()) {
        Err(RpcError::Rpc {
            code: err.get("code").and_then(Value::as_i64).unwrap_or(0),
            message: err
                .get("message")
                .and_then(Value::as_str)
                .unwrap_or("unknown")
                .to_owned(),
        })
    } else {
        Ok(value.get("result").cloned().unwrap_or(Value::Null))
    };
    let _ = tx.send(outcome);
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_find_delimiter() {
        assert_eq!(find_delimiter(b"{}\n\nrest"), Some(2));
        assert_eq!(find_delimiter(b"{}"), None);
    }

    #[tokio::test]
    async fn test_call_roundtrip_over_socketpair() {
        let dir = tempfile::tempdir().unwrap();
        let sock = dir.path().join("lightning-rpc");
        let listener = tokio::net::UnixListener::bind(&sock).unwrap();

        // Minimal fake lightningd: answer every request with its id.
        tokio::spawn(async move {
            let (mut stream, _) = listener.accept().await.unwrap();
            let mut buf = Vec::new();
            let mut chunk = [0u8; 1024];
            loop {
                let n = match stream.read(&mut chunk).await {
                    Ok(0) | Err(_) => break,
                    Ok(n) => n,
                };
                buf.extend_from_slice(&chunk[..n]);
                while let Some(pos) = find_delimiter(&buf) {
                    let frame: Vec<u8> = buf.drain(..pos + 2).collect();
                    let req: Value = serde_json::from_slice(&frame).unwrap();
                    let resp = json!({
                        "jsonrpc": "2.0",
                        "id": req["id"],
                        "result": { "echo": req["method"] },
                    });
                    let mut out = serde_json::to_vec(&resp).unwrap();
                    out.extend_from_slice(b"\n\n");
                    stream.write_all(&out).await.unwrap();
                }
            }
        });

        let client = RpcClient::connect(&sock).await.unwrap();
        let result = client.call("getinfo", json!({})).await.unwrap();
        assert_eq!(result["echo"], "getinfo");
    }
}
