//! Core Lightning plugin front-end: JSON-RPC over stdio.
//!
//! lightningd drives the plugin with requests (`getmanifest`, `init`,
//! hooks, custom methods) and notifications over stdin; we answer over
//! stdout, each JSON object followed by a blank line. `getmanifest` is
//! answered inline; everything else becomes an [`Event`] for the
//! master's loop. Hook responses may be deferred arbitrarily long (a
//! held `htlc_accepted` resolves only when the HTLC settles), which is
//! what [`HookResponder`] is for.

use serde_json::{json, Value};
use tokio::io::{AsyncBufReadExt, AsyncWriteExt, BufReader};
use tokio::sync::mpsc;

use crate::event::Event;

/// Feature bit advertised for hosted channels.
const FEATURE_HOSTED_CHANNELS: u32 = 32973;
/// Feature bit advertised for large custom messages.
const FEATURE_LARGE_MESSAGES: u32 = 257;

/// Hooks we register.
const HOOKS: [&str; 2] = ["custommsg", "htlc_accepted"];
/// Notifications we subscribe to.
const SUBSCRIPTIONS: [&str; 4] = ["sendpay_success", "sendpay_failure", "connect", "disconnect"];
/// Custom RPC methods we expose.
const METHODS: [(&str, &str, &str); 7] = [
    ("hc-list", "", "List all hosted channels"),
    ("hc-channel", "peerid", "Show one hosted channel in detail"),
    ("hc-override", "peerid msat", "Propose overriding an errored channel to a new local balance"),
    ("hc-request-channel", "peerid", "Request a hosted channel from a connected peer"),
    ("add-hc-secret", "secret", "Add a one-time invite secret"),
    ("remove-hc-secret", "secret", "Remove a one-time invite secret"),
    ("parse-lcss", "hex", "Decode a hex last-cross-signed-state"),
];

/// Cloneable handle for writing to lightningd's side of the pipe.
#[derive(Clone, Debug)]
pub struct PluginHandle {
    out_tx: mpsc::UnboundedSender<Value>,
}

impl PluginHandle {
    /// Send a JSON-RPC result for a request id.
    pub fn respond(&self, id: Value, result: Value) {
        let _ = self.out_tx.send(json!({
            "jsonrpc": "2.0",
            "id": id,
            "result": result,
        }));
    }

    /// Send a JSON-RPC error for a request id.
    pub fn respond_error(&self, id: Value, code: i64, message: &str) {
        let _ = self.out_tx.send(json!({
            "jsonrpc": "2.0",
            "id": id,
            "error": { "code": code, "message": message },
        }));
    }
}

/// Responder bound to one inbound request, movable into whatever task
/// eventually produces the answer.
#[derive(Debug)]
pub struct HookResponder {
    handle: PluginHandle,
    id: Value,
}

impl HookResponder {
    /// Answer the request.
    pub fn respond(self, result: Value) {
        self.handle.respond(self.id, result);
    }

    /// Answer the request with an error.
    pub fn respond_error(self, code: i64, message: &str) {
        self.handle.respond_error(self.id, code, message);
    }

    /// The common `{"result": "continue"}` hook answer.
    pub fn respond_continue(self) {
        self.respond(json!({ "result": "continue" }));
    }
}

/// Start the stdio front-end; returns the write handle.
///
/// Spawns the stdout writer and the stdin reader. The reader turns every
/// inbound object into an [`Event`] (answering `getmanifest` itself) and
/// emits [`Event::Shutdown`] when stdin closes.
pub fn start(events_tx: mpsc::UnboundedSender<Event>) -> PluginHandle {
    let (out_tx, mut out_rx) = mpsc::unbounded_channel::<Value>();
    let handle = PluginHandle { out_tx };

    tokio::spawn(async move {
        let mut stdout = tokio::io::stdout();
        while let Some(value) = out_rx.recv().await {
            let mut line = serde_json::to_vec(&value).expect("responses serialize");
            line.extend_from_slice(b"\n\n");
            if stdout.write_all(&line).await.is_err() {
                break;
            }
            let _ = stdout.flush().await;
        }
    });

    let reader_handle = handle.clone();
    tokio::spawn(async move {
        let mut lines = BufReader::new(tokio::io::stdin()).lines();
        let mut pending = String::new();
        loop {
            match lines.next_line().await {
                Ok(Some(line)) => {
                    if line.trim().is_empty() && pending.is_empty() {
                        continue;
                    }
                    pending.push_str(&line);
                    // lightningd separates objects with blank lines but
                    // may pretty-print; accumulate until the buffer is a
                    // complete JSON value.
                    match serde_json::from_str::<Value>(&pending) {
                        Ok(value) => {
                            pending.clear();
                            dispatch(&reader_handle, &events_tx, value);
                        }
                        Err(e) if e.is_eof() => continue,
                        Err(e) => {
                            tracing::warn!(error = %e, "dropping undecodable input");
                            pending.clear();
                        }
                    }
                }
                Ok(None) => break,
                Err(e) => {
                    tracing::warn!(error = %e, "stdin read error");
                    break;
                }
            }
        }
        tracing::info!("stdin closed, shutting down");
        let _ = events_tx.send(Event::Shutdown);
    });

    handle
}

fn dispatch(handle: &PluginHandle, events_tx: &mpsc::UnboundedSender<Event>, value: Value) {
    let method = value.get("method").and_then(Value::as_str).map(str::to_owned);
    let id = value.get("id").cloned();
    let params = value.get("params").cloned().unwrap_or(Value::Null);

    let Some(method) = method else {
        // Neither request nor notification; lightningd does not send us
        // responses over stdio.
        tracing::debug!("ignoring non-request input");
        return;
    };

    match (method.as_str(), id) {
        ("getmanifest", Some(id)) => handle.respond(id, manifest()),
        ("init", Some(id)) => {
            let configuration = params.get("configuration").cloned().unwrap_or(Value::Null);
            let responder = HookResponder { handle: handle.clone(), id };
            let _ = events_tx.send(Event::Init { configuration, responder });
        }
        (name, Some(id)) if HOOKS.contains(&name) => {
            let responder = HookResponder { handle: handle.clone(), id };
            let _ = events_tx.send(Event::Hook { name: name.to_owned(), params, responder });
        }
        (name, Some(id)) if METHODS.iter().any(|(m, _, _)| *m == name) => {
            let responder = HookResponder { handle: handle.clone(), id };
            let _ = events_tx.send(Event::Command { method: name.to_owned(), params, responder });
        }
        (name, None) => {
            let _ = events_tx.send(Event::Notification { name: name.to_owned(), params });
        }
        (name, Some(id)) => {
            tracing::warn!(method = name, "unknown method");
            handle.respond_error(id, -32601, "unknown method");
        }
    }
}

/// The `getmanifest` response.
fn manifest() -> Value {
    let methods: Vec<Value> = METHODS
        .iter()
        .map(|(name, usage, description)| {
            json!({ "name": name, "usage": usage, "description": description })
        })
        .collect();
    let hooks: Vec<Value> = HOOKS.iter().map(|name| json!({ "name": name })).collect();

    json!({
        "options": [],
        "rpcmethods": methods,
        "subscriptions": SUBSCRIPTIONS,
        "hooks": hooks,
        "featurebits": {
            "init": feature_bits_hex(&[FEATURE_HOSTED_CHANNELS, FEATURE_LARGE_MESSAGES]),
            "node": feature_bits_hex(&[FEATURE_LARGE_MESSAGES]),
        },
        "dynamic": true,
    })
}

/// Hex bitfield with the given feature bits set, BOLT-9 byte order
/// (bit 0 is the least significant bit of the last byte).
fn feature_bits_hex(bits: &[u32]) -> String {
    let max_bit = bits.iter().copied().max().unwrap_or(0) as usize;
    let len = max_bit / 8 + 1;
    let mut field = vec![0u8; len];
    for bit in bits {
        let byte = len - 1 - (*bit as usize / 8);
        field[byte] |= 1 << (*bit % 8);
    }
    hex::encode(field)
}
