//! The channel master: owns every channel, the store and the clock.
//!
//! A single event loop consumes [`Event`]s — plugin hooks, notifications,
//! custom methods, timers and hosted-to-hosted resolutions — and drives
//! the per-peer state machines. All state mutation happens here, in
//! order; RPC calls suspend the loop but never interleave handlers.

use std::collections::HashMap;
use std::time::Duration;

use secp256k1::{PublicKey, SecretKey};
use serde_json::{json, Value};
use tokio::sync::mpsc;

use hostchan_core::types::{block_day, hosted_short_channel_id, MilliSatoshi, ShortChannelId};
use hostchan_core::wire::{encode_message, HostedChannelBranding, HostedMessage};
use hostchan_store::{ChannelRecord, ChannelStore, Data};

use crate::channel::{
    self, add_htlc, channel_status, got_payment_result, on_block_updated, on_peer_message,
    parse_payment_label, AddHtlcOutcome, Channel, ChannelStatus, HtlcResult,
};
use crate::commands;
use crate::config::Config;
use crate::event::Event;
use crate::plugin::HookResponder;
use crate::rpc::RpcError;
use crate::upstream::{parse_pubkey, PaymentStatus, UpstreamNode};

/// Seconds between block polls.
const BLOCK_POLL_SECS: u64 = 60;
/// Startup grace before replaying hosted-to-hosted forwards.
const REPLAY_GRACE_SECS: u64 = 10;
/// Delay before inspecting committed HTLCs after a reconnect.
const POST_RECONNECT_SECS: u64 = 3;
/// Spacing and budget for re-polling a pending payment.
const PENDING_POLL_SECS: u64 = 1;
const PENDING_POLL_BUDGET: u32 = 3;

/// Owns the channel collection and multiplexes all inputs onto it.
pub struct ChannelMaster<U> {
    /// Daemon configuration.
    pub config: Config,
    /// Durable state.
    pub store: ChannelStore,
    /// Interface to the upstream node.
    pub upstream: U,
    /// Node id secret, used for state signatures and onion peeling.
    pub node_secret: SecretKey,
    /// Our node id.
    pub node_id: PublicKey,
    /// Chain both sides must be on.
    pub chain_hash: [u8; 32],
    /// Latest known block height.
    pub block_height: u64,
    /// Transient per-peer state.
    pub channels: HashMap<PublicKey, Channel>,
    /// One-time invite secrets (hex), consumed on use.
    pub temporary_secrets: Vec<String>,
    /// Branding reply, when configured.
    pub branding: Option<HostedChannelBranding>,
    events_tx: mpsc::UnboundedSender<Event>,
}

impl<U: UpstreamNode> ChannelMaster<U> {
    /// Assemble the master. `events_tx` feeds the same queue the loop
    /// reads, for timers and deferred resolutions.
    #[allow(clippy::too_many_arguments)]
    pub fn new(
        config: Config,
        store: ChannelStore,
        upstream: U,
        node_secret: SecretKey,
        node_id: PublicKey,
        chain_hash: [u8; 32],
        block_height: u64,
        events_tx: mpsc::UnboundedSender<Event>,
    ) -> Self {
        let branding = config.load_branding();
        ChannelMaster {
            config,
            store,
            upstream,
            node_secret,
            node_id,
            chain_hash,
            block_height,
            channels: HashMap::new(),
            temporary_secrets: Vec::new(),
            branding,
            events_tx,
        }
    }

    /// Start the clock and the startup replay timer, then consume events
    /// until shutdown.
    pub async fn run(mut self, mut events_rx: mpsc::UnboundedReceiver<Event>) {
        self.spawn_timers();
        while let Some(event) = events_rx.recv().await {
            if matches!(event, Event::Shutdown) {
                break;
            }
            self.handle_event(event).await;
        }
        tracing::info!("event loop finished");
    }

    fn spawn_timers(&self) {
        let tick_tx = self.events_tx.clone();
        tokio::spawn(async move {
            let mut interval = tokio::time::interval(Duration::from_secs(BLOCK_POLL_SECS));
            interval.tick().await; // immediate first tick is not wanted
            loop {
                interval.tick().await;
                if tick_tx.send(Event::BlockTimer).is_err() {
                    break;
                }
            }
        });
        let replay_tx = self.events_tx.clone();
        tokio::spawn(async move {
            tokio::time::sleep(Duration::from_secs(REPLAY_GRACE_SECS)).await;
            let _ = replay_tx.send(Event::ReplayForwards);
        });
    }

    /// Handle one event to completion.
    pub async fn handle_event(&mut self, event: Event) {
        match event {
            Event::Init { responder, .. } => {
                // Handled during bootstrap; a late init is just re-acked.
                responder.respond(json!({}));
            }
            Event::Hook { name, params, responder } => match name.as_str() {
                "custommsg" => self.on_custommsg(params, responder).await,
                "htlc_accepted" => self.on_htlc_accepted(params, responder).await,
                other => {
                    tracing::warn!(hook = other, "unregistered hook");
                    responder.respond_continue();
                }
            },
            Event::Notification { name, params } => match name.as_str() {
                "sendpay_success" => self.on_sendpay_success(params).await,
                "sendpay_failure" => self.on_sendpay_failure(params).await,
                "connect" | "disconnect" => {
                    tracing::debug!(event = name.as_str(), "peer connectivity change");
                }
                other => tracing::debug!(event = other, "unhandled notification"),
            },
            Event::Command { method, params, responder } => {
                commands::dispatch(self, &method, params, responder).await;
            }
            Event::BlockTimer => self.poll_block().await,
            Event::ReplayForwards => self.replay_forwards().await,
            Event::PostReconnect { peer } => {
                channel::inspect_committed_incoming(self, peer).await;
            }
            Event::HostedResolution { peer, htlc_id, result } => {
                got_payment_result(self, peer, htlc_id, result).await;
            }
            Event::PendingPoll { peer, htlc_id, payment_hash, label, attempt } => {
                match self.upstream.inspect_outgoing_payment(payment_hash, &label).await {
                    Ok(status) => {
                        self.apply_payment_status(peer, htlc_id, payment_hash, label, status, attempt)
                            .await;
                    }
                    Err(e) => tracing::warn!(error = %e, "pending poll failed"),
                }
            }
            Event::Shutdown => unreachable!("consumed by run()"),
        }
    }

    // ---- channel plumbing -------------------------------------------------

    /// Upsert the transient channel state for a peer.
    pub fn channel(&mut self, peer: PublicKey) -> &mut Channel {
        let our_id = self.node_id;
        self.channels.entry(peer).or_insert_with(|| Channel::new(&our_id, peer))
    }

    /// The peer's durable record, if any.
    pub fn record(&self, peer: &PublicKey) -> Option<&ChannelRecord> {
        self.store.data().channels.get(peer)
    }

    /// Derived channel status for a peer.
    pub fn status(&self, peer: &PublicKey) -> ChannelStatus {
        channel_status(self.record(peer), self.channels.get(peer))
    }

    /// Current block day.
    pub fn current_block_day(&self) -> u32 {
        block_day(self.block_height)
    }

    /// The hosted-channel peer owning a short channel id, if any.
    pub fn hosted_peer_by_scid(&self, scid: ShortChannelId) -> Option<PublicKey> {
        self.store
            .data()
            .channels
            .keys()
            .find(|peer| hosted_short_channel_id(&self.node_id, peer) == scid)
            .copied()
    }

    /// Frame and deliver a hosted-channel message to a peer.
    pub async fn send_peer(&self, peer: &PublicKey, msg: HostedMessage) -> Result<(), RpcError> {
        let framed = encode_message(&msg)
            .map_err(|e| RpcError::BadResponse(format!("unencodable message: {}", e)))?;
        let result = self.upstream.send_custom_message(peer, framed).await;
        if let Err(e) = &result {
            tracing::warn!(peer = %peer, msg = msg.name(), error = %e, "send failed");
        }
        result
    }

    /// Checkpoint a mutation. The store either completes an update or
    /// leaves prior state intact; a store that cannot write at all is
    /// fatal for the daemon.
    pub fn persist(&mut self, f: impl FnOnce(&mut Data)) {
        if let Err(e) = self.store.update(f) {
            tracing::error!(error = %e, "persistence failure, shutting down");
            std::process::exit(1);
        }
    }

    /// Mutate (creating if needed) a peer's record in one checkpoint.
    pub fn persist_record(&mut self, peer: PublicKey, f: impl FnOnce(&mut ChannelRecord)) {
        self.persist_record_and(peer, |_, record| f(record));
    }

    /// Mutate a peer's record plus the aux maps in one checkpoint.
    pub fn persist_record_and(
        &mut self,
        peer: PublicKey,
        f: impl FnOnce(&mut Data, &mut ChannelRecord),
    ) {
        self.persist(|data| {
            let mut record = data.channels.remove(&peer).unwrap_or_default();
            f(data, &mut record);
            data.channels.insert(peer, record);
        });
    }

    /// Drop cached preimages no committed state references anymore.
    pub fn gc_preimages(&mut self) {
        let referenced = self.store.data().referenced_hashes();
        let stale: Vec<[u8; 32]> = self
            .store
            .data()
            .preimages
            .keys()
            .filter(|hash| !referenced.contains(*hash))
            .copied()
            .collect();
        if stale.is_empty() {
            return;
        }
        self.persist(|data| {
            for hash in &stale {
                data.preimages.remove(hash);
            }
        });
        tracing::debug!(count = stale.len(), "preimages garbage-collected");
    }

    /// Push an event onto our own queue.
    pub fn enqueue(&self, event: Event) {
        let _ = self.events_tx.send(event);
    }

    /// Schedule the post-reconnect inspection for a peer.
    pub fn schedule_post_reconnect(&self, peer: PublicKey) {
        let tx = self.events_tx.clone();
        tokio::spawn(async move {
            tokio::time::sleep(Duration::from_secs(POST_RECONNECT_SECS)).await;
            let _ = tx.send(Event::PostReconnect { peer });
        });
    }

    /// Route a hosted-to-hosted `add_htlc` outcome back to the incoming
    /// side through the event queue.
    pub fn bind_hosted_outcome(
        &self,
        source_peer: PublicKey,
        incoming_htlc_id: u64,
        outcome: AddHtlcOutcome,
    ) {
        let tx = self.events_tx.clone();
        match outcome {
            AddHtlcOutcome::Resolved(result) => {
                let _ = tx.send(Event::HostedResolution {
                    peer: source_peer,
                    htlc_id: incoming_htlc_id,
                    result,
                });
            }
            AddHtlcOutcome::Pending(rx) => {
                tokio::spawn(async move {
                    if let Ok(result) = rx.await {
                        let _ = tx.send(Event::HostedResolution {
                            peer: source_peer,
                            htlc_id: incoming_htlc_id,
                            result,
                        });
                    }
                });
            }
        }
    }

    /// Check an invoke secret against the permanent and temporary sets,
    /// consuming a temporary secret on first use.
    pub fn consume_secret(&mut self, secret: &[u8]) -> bool {
        let as_hex = hex::encode(secret);
        if self.config.permanent_secrets.iter().any(|s| *s == as_hex) {
            return true;
        }
        if let Some(pos) = self.temporary_secrets.iter().position(|s| *s == as_hex) {
            self.temporary_secrets.remove(pos);
            return true;
        }
        false
    }

    // ---- hooks ------------------------------------------------------------

    async fn on_custommsg(&mut self, params: Value, responder: HookResponder) {
        // Answer immediately; processing must not hold the hook.
        responder.respond_continue();

        let peer = params.get("peer_id").and_then(Value::as_str).and_then(parse_pubkey);
        let payload = params
            .get("payload")
            .and_then(Value::as_str)
            .and_then(|s| hex::decode(s).ok());
        let (Some(peer), Some(payload)) = (peer, payload) else {
            tracing::warn!("malformed custommsg hook payload");
            return;
        };
        on_peer_message(self, peer, &payload).await;
    }

    async fn on_htlc_accepted(&mut self, params: Value, responder: HookResponder) {
        let onion = &params["onion"];
        let htlc = &params["htlc"];

        // Not a forward, or not ours to handle.
        let Some(target_scid) = onion
            .get("short_channel_id")
            .and_then(Value::as_str)
            .and_then(|s| s.parse::<ShortChannelId>().ok())
        else {
            responder.respond_continue();
            return;
        };
        let Some(target_peer) = self.hosted_peer_by_scid(target_scid) else {
            responder.respond_continue();
            return;
        };

        let parsed = (|| -> Option<_> {
            let in_scid: ShortChannelId =
                htlc.get("short_channel_id")?.as_str()?.parse().ok()?;
            let in_id = htlc.get("id")?.as_u64()?;
            let in_amount: MilliSatoshi =
                serde_json::from_value(htlc.get("amount_msat")?.clone()).ok()?;
            let out_amount: MilliSatoshi =
                serde_json::from_value(onion.get("forward_msat")?.clone()).ok()?;
            let cltv = onion.get("outgoing_cltv_value")?.as_u64()? as u32;
            let payment_hash: [u8; 32] =
                hex::decode(htlc.get("payment_hash")?.as_str()?).ok()?.try_into().ok()?;
            let next_onion = hex::decode(onion.get("next_onion")?.as_str()?).ok()?;
            Some((in_scid, in_id, in_amount, out_amount, cltv, payment_hash, next_onion))
        })();
        let Some((in_scid, in_id, in_amount, out_amount, cltv, payment_hash, next_onion)) = parsed
        else {
            tracing::warn!("malformed htlc_accepted hook payload");
            responder.respond_continue();
            return;
        };

        let incoming = hostchan_core::types::HtlcIdentifier { scid: in_scid, id: in_id };
        let outcome = add_htlc(
            self,
            target_peer,
            incoming,
            in_amount,
            out_amount,
            payment_hash,
            cltv,
            next_onion,
        )
        .await;
        match outcome {
            AddHtlcOutcome::Resolved(result) => responder.respond(hook_response(result)),
            AddHtlcOutcome::Pending(rx) => {
                // Hold the hook open until the HTLC settles.
                tokio::spawn(async move {
                    match rx.await {
                        Ok(result) => responder.respond(hook_response(result)),
                        Err(_) => responder.respond_continue(),
                    }
                });
            }
        }
    }

    // ---- notifications ----------------------------------------------------

    async fn on_sendpay_success(&mut self, params: Value) {
        let payment = params.get("sendpay_success").unwrap_or(&params);
        let Some((peer, htlc_id)) = self.payment_source(payment) else { return };
        let Some(preimage) = payment
            .get("payment_preimage")
            .and_then(Value::as_str)
            .and_then(|s| hex::decode(s).ok())
            .and_then(|v| <[u8; 32]>::try_from(v).ok())
        else {
            return;
        };
        got_payment_result(self, peer, htlc_id, HtlcResult::Fulfill { preimage }).await;
    }

    async fn on_sendpay_failure(&mut self, params: Value) {
        let failure = params.get("sendpay_failure").unwrap_or(&params);
        let data = failure.get("data").unwrap_or(failure);
        let Some((peer, htlc_id)) = self.payment_source(data) else { return };

        if data.get("status").and_then(Value::as_str) == Some("pending") {
            let Some(label) = data.get("label").and_then(Value::as_str) else { return };
            let Some(payment_hash) = data
                .get("payment_hash")
                .and_then(Value::as_str)
                .and_then(|s| hex::decode(s).ok())
                .and_then(|v| <[u8; 32]>::try_from(v).ok())
            else {
                return;
            };
            self.schedule_pending_poll(peer, htlc_id, payment_hash, label.to_owned(), 1);
            return;
        }

        let onion_reply = data
            .get("onionreply")
            .or_else(|| data.get("erroronion"))
            .and_then(Value::as_str)
            .and_then(|s| hex::decode(s).ok());
        let result = match onion_reply {
            Some(reason) => HtlcResult::FailOnion { reason },
            None => {
                let failcode =
                    data.get("failcode").and_then(Value::as_u64).map(|c| c as u16);
                match failcode {
                    Some(code) if code & hostchan_core::onion::BADONION != 0 => {
                        HtlcResult::FailMalformed { failure_code: code }
                    }
                    _ => HtlcResult::Fail {
                        message: hostchan_core::onion::FailureMessage::TemporaryNodeFailure,
                    },
                }
            }
        };
        got_payment_result(self, peer, htlc_id, result).await;
    }

    /// Map a sendpay label back to the hosted channel and incoming HTLC
    /// it settles.
    fn payment_source(&self, payment: &Value) -> Option<(PublicKey, u64)> {
        let label = payment.get("label").and_then(Value::as_str)?;
        let (scid, htlc_id) = parse_payment_label(label)?;
        let peer = self.hosted_peer_by_scid(scid)?;
        Some((peer, htlc_id))
    }

    fn schedule_pending_poll(
        &self,
        peer: PublicKey,
        htlc_id: u64,
        payment_hash: [u8; 32],
        label: String,
        attempt: u32,
    ) {
        let tx = self.events_tx.clone();
        tokio::spawn(async move {
            tokio::time::sleep(Duration::from_secs(PENDING_POLL_SECS)).await;
            let _ = tx.send(Event::PendingPoll { peer, htlc_id, payment_hash, label, attempt });
        });
    }

    /// Act on an inspected payment status for an incoming hosted HTLC.
    pub async fn apply_payment_status(
        &mut self,
        peer: PublicKey,
        htlc_id: u64,
        payment_hash: [u8; 32],
        label: String,
        status: PaymentStatus,
        attempt: u32,
    ) {
        match status {
            PaymentStatus::Complete { preimage } => {
                got_payment_result(self, peer, htlc_id, HtlcResult::Fulfill { preimage }).await;
            }
            PaymentStatus::Failed { onion_reply: Some(reason) } => {
                got_payment_result(self, peer, htlc_id, HtlcResult::FailOnion { reason }).await;
            }
            PaymentStatus::Failed { onion_reply: None } | PaymentStatus::Unknown => {
                got_payment_result(
                    self,
                    peer,
                    htlc_id,
                    HtlcResult::Fail {
                        message: hostchan_core::onion::FailureMessage::TemporaryNodeFailure,
                    },
                )
                .await;
            }
            PaymentStatus::Pending if attempt < PENDING_POLL_BUDGET => {
                self.schedule_pending_poll(peer, htlc_id, payment_hash, label, attempt + 1);
            }
            PaymentStatus::Pending => {
                tracing::info!(peer = %peer, htlc_id,
                    "payment still pending after retries; next reconnect re-inspects");
            }
        }
    }

    // ---- timers -----------------------------------------------------------

    async fn poll_block(&mut self) {
        let info = match self.upstream.getinfo().await {
            Ok(info) => info,
            Err(e) => {
                tracing::warn!(error = %e, "block poll failed");
                return;
            }
        };
        if info.blockheight <= self.block_height {
            return;
        }
        self.block_height = info.blockheight;
        tracing::debug!(height = info.blockheight, "new block height");

        let peers: Vec<PublicKey> = self.store.data().channels.keys().copied().collect();
        for peer in peers {
            on_block_updated(self, peer, info.blockheight).await;
        }
    }

    /// Reconstruct hosted-to-hosted in-flight forwards after a restart.
    async fn replay_forwards(&mut self) {
        let forwards: Vec<_> = self
            .store
            .data()
            .htlc_forwards
            .iter()
            .map(|(k, v)| (*k, *v))
            .collect();
        for (incoming, outgoing) in forwards {
            let Some(source_peer) = self.hosted_peer_by_scid(incoming.scid) else { continue };
            if self.hosted_peer_by_scid(outgoing.scid).is_none() {
                continue;
            }
            let Some(htlc) = self
                .record(&source_peer)
                .and_then(|r| r.lcss.as_ref())
                .and_then(|l| l.incoming_htlcs.iter().find(|h| h.id == incoming.id))
                .cloned()
            else {
                continue;
            };
            let peeled = match hostchan_core::onion::peel_onion(
                &self.node_secret,
                &htlc.payment_hash,
                &htlc.onion_routing_packet,
            ) {
                Ok(peeled) => peeled,
                Err(e) => {
                    tracing::warn!(%incoming, error = %e, "stored onion no longer peels");
                    continue;
                }
            };
            let (relay, next_onion) = match (peeled.payload, peeled.next_packet) {
                (hostchan_core::onion::HopPayload::Relay(relay), Some(next)) => (relay, next),
                _ => continue,
            };
            let Some(target_peer) = self.hosted_peer_by_scid(relay.short_channel_id) else {
                continue;
            };
            tracing::info!(%incoming, %outgoing, "replaying hosted-to-hosted forward");
            let outcome = Box::pin(add_htlc(
                self,
                target_peer,
                incoming,
                htlc.amount_msat,
                relay.amt_to_forward,
                htlc.payment_hash,
                relay.outgoing_cltv,
                next_onion,
            ))
            .await;
            self.bind_hosted_outcome(source_peer, incoming.id, outcome);
        }
    }
}

/// Translate an HTLC result into an `htlc_accepted` hook response.
fn hook_response(result: HtlcResult) -> Value {
    match result {
        HtlcResult::Fulfill { preimage } => {
            json!({ "result": "resolve", "payment_key": hex::encode(preimage) })
        }
        HtlcResult::FailOnion { reason } => {
            json!({ "result": "fail", "failure_onion": hex::encode(reason) })
        }
        HtlcResult::Fail { message } => {
            json!({ "result": "fail", "failure_message": hex::encode(message.encode()) })
        }
        HtlcResult::FailMalformed { failure_code } => {
            json!({ "result": "fail", "failure_message": hex::encode(failure_code.to_be_bytes()) })
        }
    }
}

#[cfg(test)]
pub mod tests_support {
    //! Helpers shared by unit tests across modules.

    use secp256k1::{PublicKey, Secp256k1, SecretKey};

    /// Deterministic test public key.
    pub fn test_pubkey(byte: u8) -> PublicKey {
        let secp = Secp256k1::new();
        PublicKey::from_secret_key(&secp, &SecretKey::from_slice(&[byte; 32]).unwrap())
    }
}
