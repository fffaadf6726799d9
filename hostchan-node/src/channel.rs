//! The per-peer hosted-channel state machine.
//!
//! One [`Channel`] per peer holds the transient side of the protocol:
//! uncommitted updates, one-shot HTLC result promises, handshake
//! scratches and the state-update send ring. Everything durable lives in
//! the store's [`ChannelRecord`]. Handlers are free functions over the
//! [`ChannelMaster`] so a hosted-to-hosted forward is just a nested call
//! on the same borrow.

use std::collections::{HashMap, VecDeque};
use std::fmt;

use secp256k1::PublicKey;
use tokio::sync::oneshot;

use hostchan_core::crypto::{sha256, verify_digest};
use hostchan_core::onion::{
    self, create_failure_packet, wrap_failure_packet, FailureMessage, HopPayload, OnionError,
};
use hostchan_core::state::{
    next_local_unsigned_state, HtlcUpdate, UncommittedUpdate, UpdateOrigin,
};
use hostchan_core::types::{
    hosted_channel_id, hosted_short_channel_id, HtlcIdentifier, MilliSatoshi, ShortChannelId,
};
use hostchan_core::wire::{
    codec, error_codes, ChannelUpdate, ErrorMessage, HostedMessage, InvokeHostedChannel,
    LastCrossSignedState, Signature64, StateOverride, StateUpdate, UpdateAddHtlc, UpdateFailHtlc,
    UpdateFailMalformedHtlc, UpdateFulfillHtlc,
};
use hostchan_store::{ChannelRecord, DetailedError};

use crate::event::Event;
use crate::master::ChannelMaster;
use crate::upstream::{SendOnionRequest, UpstreamNode};

/// How many recently sent state updates the debounce ring remembers.
const SENT_STATE_UPDATES_KEPT: usize = 3;

/// Derived channel status.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ChannelStatus {
    /// No record, no handshake in progress.
    NotOpened,
    /// We accepted an invoke as host, awaiting the client's state update.
    Opening,
    /// We invoked as client, awaiting init or the peer's state update.
    Invoking,
    /// Cross-signed and forwarding.
    Active,
    /// We proposed an override and await the peer's acceptance.
    Overriding,
    /// A local error is recorded; no new HTLCs.
    Errored,
    /// Operator-suspended; no new HTLCs.
    Suspended,
}

impl ChannelStatus {
    /// Whether new outgoing HTLCs may be added.
    pub fn can_add_htlc(&self) -> bool {
        matches!(self, ChannelStatus::Active)
    }

    /// Whether payment results are still acted upon.
    pub fn accepts_payment_results(&self) -> bool {
        matches!(
            self,
            ChannelStatus::Active | ChannelStatus::Errored | ChannelStatus::Suspended
        )
    }
}

impl fmt::Display for ChannelStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ChannelStatus::NotOpened => write!(f, "not_opened"),
            ChannelStatus::Opening => write!(f, "opening"),
            ChannelStatus::Invoking => write!(f, "invoking"),
            ChannelStatus::Active => write!(f, "active"),
            ChannelStatus::Overriding => write!(f, "overriding"),
            ChannelStatus::Errored => write!(f, "errored"),
            ChannelStatus::Suspended => write!(f, "suspended"),
        }
    }
}

/// Final outcome of one forwarded HTLC, delivered through its promise.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum HtlcResult {
    /// The HTLC was fulfilled.
    Fulfill {
        /// The revealed preimage.
        preimage: [u8; 32],
    },
    /// Failed with an encrypted failure onion from downstream.
    FailOnion {
        /// The failure onion, already wrapped for the upstream path.
        reason: Vec<u8>,
    },
    /// Failed with a failure we originate.
    Fail {
        /// The failure message.
        message: FailureMessage,
    },
    /// Failed with a BADONION code.
    FailMalformed {
        /// The BADONION failure code.
        failure_code: u16,
    },
}

/// What `add_htlc` hands back to the caller.
#[derive(Debug)]
pub enum AddHtlcOutcome {
    /// Settled without emitting anything.
    Resolved(HtlcResult),
    /// In flight; the receiver fires when the HTLC settles.
    Pending(oneshot::Receiver<HtlcResult>),
}

/// Transient per-peer state, rebuilt from the committed record after a
/// restart.
#[derive(Debug)]
pub struct Channel {
    /// The peer's node id.
    pub peer: PublicKey,
    /// Deterministic short channel id for this pair.
    pub scid: ShortChannelId,
    /// Deterministic channel id for this pair.
    pub channel_id: [u8; 32],
    /// Updates queued since the last cross-signed state, in order.
    pub uncommitted: Vec<UncommittedUpdate>,
    /// One-shot result promises keyed by our outgoing HTLC id.
    pub results: HashMap<u64, oneshot::Sender<HtlcResult>>,
    /// Host-side handshake scratch: the client's refund script.
    pub opening_refund_spk: Option<Vec<u8>>,
    /// Client-side handshake scratch: our refund script.
    pub invoking_refund_spk: Option<Vec<u8>>,
    /// Client-side handshake scratch: the unsigned initial state.
    pub invoking_lcss: Option<LastCrossSignedState>,
    /// Ring of recently sent state updates, for send debouncing.
    sent_state_updates: VecDeque<Vec<u8>>,
}

impl Channel {
    /// Create the transient state for a peer.
    pub fn new(our_id: &PublicKey, peer: PublicKey) -> Channel {
        Channel {
            peer,
            scid: hosted_short_channel_id(our_id, &peer),
            channel_id: hosted_channel_id(our_id, &peer),
            uncommitted: Vec::new(),
            results: HashMap::new(),
            opening_refund_spk: None,
            invoking_refund_spk: None,
            invoking_lcss: None,
            sent_state_updates: VecDeque::new(),
        }
    }

    /// Resolve and drop the promise for an outgoing HTLC id.
    pub fn resolve(&mut self, htlc_id: u64, result: HtlcResult) {
        if let Some(tx) = self.results.remove(&htlc_id) {
            let _ = tx.send(result);
        }
    }

    fn note_sent_state_update(&mut self, encoded: Vec<u8>) -> bool {
        if self.sent_state_updates.contains(&encoded) {
            return false;
        }
        self.sent_state_updates.push_back(encoded);
        while self.sent_state_updates.len() > SENT_STATE_UPDATES_KEPT {
            self.sent_state_updates.pop_front();
        }
        true
    }
}

/// Derive the status per the precedence rules.
pub fn channel_status(record: Option<&ChannelRecord>, chan: Option<&Channel>) -> ChannelStatus {
    if chan.is_some_and(|c| c.opening_refund_spk.is_some()) {
        return ChannelStatus::Opening;
    }
    if chan.is_some_and(|c| c.invoking_refund_spk.is_some() || c.invoking_lcss.is_some()) {
        return ChannelStatus::Invoking;
    }
    let Some(record) = record else { return ChannelStatus::NotOpened };
    if record.proposed_override.is_some() {
        ChannelStatus::Overriding
    } else if !record.local_errors.is_empty() {
        ChannelStatus::Errored
    } else if record.suspended {
        ChannelStatus::Suspended
    } else if record.lcss.is_none() {
        ChannelStatus::NotOpened
    } else {
        ChannelStatus::Active
    }
}

/// Entry point for a framed peer message from the `custommsg` hook.
pub async fn on_peer_message<U: UpstreamNode>(
    master: &mut ChannelMaster<U>,
    peer: PublicKey,
    payload: &[u8],
) {
    let msg = match hostchan_core::wire::decode_message(payload) {
        Ok(msg) => msg,
        Err(e) => {
            tracing::debug!(peer = %peer, error = %e, "ignoring custom message");
            return;
        }
    };
    let status = master.status(&peer);
    tracing::debug!(peer = %peer, msg = msg.name(), %status, "peer message");

    match msg {
        HostedMessage::AskBrandingInfo(_) => {
            if let Some(branding) = master.branding.clone() {
                let _ = master.send_peer(&peer, HostedMessage::Branding(branding)).await;
            }
        }
        HostedMessage::Invoke(invoke) => handle_invoke(master, peer, invoke, status).await,
        HostedMessage::StateUpdate(update) => {
            handle_state_update(master, peer, update, status).await
        }
        HostedMessage::Init(init) => handle_init(master, peer, init, status).await,
        HostedMessage::Lcss(lcss) => handle_remote_lcss(master, peer, lcss, status).await,
        HostedMessage::Add(add) => handle_remote_add(master, peer, add, status).await,
        HostedMessage::Fulfill(fulfill) => {
            handle_remote_fulfill(master, peer, fulfill, status).await
        }
        HostedMessage::Fail(fail) => handle_remote_fail(master, peer, fail, status).await,
        HostedMessage::FailMalformed(fail) => {
            if status == ChannelStatus::Active {
                master.channel(peer).uncommitted.push(UncommittedUpdate {
                    origin: UpdateOrigin::Remote,
                    update: HtlcUpdate::FailMalformed(fail),
                });
            }
        }
        HostedMessage::Error(error) => handle_remote_error(master, peer, error).await,
        other => {
            tracing::debug!(peer = %peer, msg = other.name(), "unhandled message, ignoring");
        }
    }
}

async fn handle_invoke<U: UpstreamNode>(
    master: &mut ChannelMaster<U>,
    peer: PublicKey,
    invoke: InvokeHostedChannel,
    status: ChannelStatus,
) {
    match status {
        ChannelStatus::NotOpened => {
            if invoke.chain_hash != master.chain_hash {
                deny(master, peer, "wrong chain").await;
                return;
            }
            if master.config.require_secret && !master.consume_secret(&invoke.secret) {
                deny(master, peer, "wrong or missing secret").await;
                return;
            }
            if invoke.refund_script_pubkey.is_empty() {
                deny(master, peer, "empty refund script").await;
                return;
            }
            master.channel(peer).opening_refund_spk = Some(invoke.refund_script_pubkey);
            let init = master.config.init_hosted_channel();
            let _ = master.send_peer(&peer, HostedMessage::Init(init)).await;
        }
        ChannelStatus::Suspended => {
            if let Some(lcss) = master.record(&peer).and_then(|r| r.lcss.clone()) {
                let _ = master.send_peer(&peer, HostedMessage::Lcss(lcss)).await;
            }
        }
        ChannelStatus::Errored => {
            let record = master.record(&peer).cloned().unwrap_or_default();
            if let Some(lcss) = record.lcss {
                let _ = master.send_peer(&peer, HostedMessage::Lcss(lcss)).await;
            }
            if let Some(first) = record.local_errors.first() {
                let _ =
                    master.send_peer(&peer, HostedMessage::Error(first.error.clone())).await;
            }
        }
        ChannelStatus::Overriding => {
            let record = master.record(&peer).cloned().unwrap_or_default();
            if let Some(lcss) = record.lcss {
                let _ = master.send_peer(&peer, HostedMessage::Lcss(lcss)).await;
            }
            if let Some(first) = record.local_errors.first() {
                let _ =
                    master.send_peer(&peer, HostedMessage::Error(first.error.clone())).await;
            }
            if let Some(proposed) = record.proposed_override {
                let msg = StateOverride {
                    block_day: proposed.block_day,
                    local_balance_msat: proposed.local_balance_msat,
                    local_updates: proposed.local_updates,
                    remote_updates: proposed.remote_updates,
                    local_sig_of_remote_lcss: proposed.local_sig_of_remote,
                };
                let _ = master.send_peer(&peer, HostedMessage::StateOverride(msg)).await;
            }
        }
        ChannelStatus::Active => replay_after_invoke(master, peer).await,
        ChannelStatus::Opening | ChannelStatus::Invoking => {
            tracing::debug!(peer = %peer, "invoke during handshake, ignoring");
        }
    }
}

/// Reconnect path: resend the committed state, replay surviving local
/// updates (resolutions first, adds reassigned fresh ids), close with one
/// state update.
async fn replay_after_invoke<U: UpstreamNode>(master: &mut ChannelMaster<U>, peer: PublicKey) {
    let Some(lcss) = master.record(&peer).and_then(|r| r.lcss.clone()) else { return };
    let _ = master.send_peer(&peer, HostedMessage::Lcss(lcss.clone())).await;

    let chan = master.channel(peer);
    // The peer lost everything we sent since the last commit, and will
    // itself resend what we dropped here.
    let locals: Vec<UncommittedUpdate> =
        chan.uncommitted.drain(..).filter(UncommittedUpdate::is_local).collect();
    let (adds, resolutions): (Vec<_>, Vec<_>) =
        locals.into_iter().partition(|u| matches!(u.update, HtlcUpdate::Add(_)));
    chan.uncommitted = resolutions;
    chan.sent_state_updates.clear();

    let resolutions_to_send = master.channel(peer).uncommitted.clone();
    for entry in &resolutions_to_send {
        let msg = match &entry.update {
            HtlcUpdate::Fulfill(m) => HostedMessage::Fulfill(m.clone()),
            HtlcUpdate::Fail(m) => HostedMessage::Fail(m.clone()),
            HtlcUpdate::FailMalformed(m) => HostedMessage::FailMalformed(m.clone()),
            HtlcUpdate::Add(_) => continue,
        };
        let _ = master.send_peer(&peer, msg).await;
    }

    let day = master.current_block_day();
    for entry in adds {
        let (origin, HtlcUpdate::Add(mut add)) = (entry.origin, entry.update) else { continue };
        let chan = master.channel(peer);
        let Ok(next) = next_local_unsigned_state(&lcss, &chan.uncommitted, day) else { continue };
        let old_id = add.id;
        add.id = next.local_updates as u64 + 1;
        if old_id != add.id {
            if let Some(tx) = chan.results.remove(&old_id) {
                chan.results.insert(add.id, tx);
            }
        }
        chan.uncommitted.push(UncommittedUpdate { origin, update: HtlcUpdate::Add(add.clone()) });
        let _ = master.send_peer(&peer, HostedMessage::Add(add)).await;
    }

    send_state_update(master, peer).await;
}

async fn handle_init<U: UpstreamNode>(
    master: &mut ChannelMaster<U>,
    peer: PublicKey,
    init: hostchan_core::wire::InitHostedChannel,
    status: ChannelStatus,
) {
    if status != ChannelStatus::Invoking {
        tracing::debug!(peer = %peer, "unexpected init_hosted_channel, ignoring");
        return;
    }
    let Some(refund_spk) = master.channel(peer).invoking_refund_spk.clone() else { return };
    if init.initial_client_balance_msat > init.channel_capacity_msat {
        deny(master, peer, "initial balance exceeds capacity").await;
        master.channel(peer).invoking_refund_spk = None;
        return;
    }

    let day = master.current_block_day();
    let mut lcss = LastCrossSignedState {
        is_host: false,
        refund_script_pubkey: refund_spk,
        block_day: day,
        local_balance_msat: init.initial_client_balance_msat,
        remote_balance_msat: init.channel_capacity_msat - init.initial_client_balance_msat,
        init_hosted_channel: init,
        local_updates: 0,
        remote_updates: 0,
        incoming_htlcs: vec![],
        outgoing_htlcs: vec![],
        remote_sig_of_local: Signature64::ZERO,
        local_sig_of_remote: Signature64::ZERO,
    };
    lcss.local_sig_of_remote = lcss.sign_mirrored(&master.node_secret);

    let update = StateUpdate {
        block_day: day,
        local_updates: 0,
        remote_updates: 0,
        local_sig_of_remote_lcss: lcss.local_sig_of_remote,
    };
    master.channel(peer).invoking_lcss = Some(lcss);
    let _ = master.send_peer(&peer, HostedMessage::StateUpdate(update)).await;
}

async fn handle_state_update<U: UpstreamNode>(
    master: &mut ChannelMaster<U>,
    peer: PublicKey,
    msg: StateUpdate,
    status: ChannelStatus,
) {
    match status {
        ChannelStatus::Opening => finish_opening_as_host(master, peer, msg).await,
        ChannelStatus::Invoking => finish_opening_as_client(master, peer, msg).await,
        ChannelStatus::Overriding => finish_override(master, peer, msg).await,
        ChannelStatus::Active => commit(master, peer, msg).await,
        _ => {
            tracing::debug!(peer = %peer, %status, "state_update ignored in this status");
        }
    }
}

async fn finish_opening_as_host<U: UpstreamNode>(
    master: &mut ChannelMaster<U>,
    peer: PublicKey,
    msg: StateUpdate,
) {
    let Some(refund_spk) = master.channel(peer).opening_refund_spk.clone() else { return };
    let day = master.current_block_day();
    if msg.block_day.abs_diff(day) > 1 {
        master.channel(peer).opening_refund_spk = None;
        let error = ErrorMessage::new(
            master.channel(peer).channel_id,
            error_codes::ERR_WRONG_BLOCKDAY,
            "blockday too far from ours",
        );
        let _ = master.send_peer(&peer, HostedMessage::Error(error)).await;
        return;
    }

    let init = master.config.init_hosted_channel();
    let mut lcss = LastCrossSignedState {
        is_host: true,
        refund_script_pubkey: refund_spk,
        block_day: msg.block_day,
        local_balance_msat: init.channel_capacity_msat - init.initial_client_balance_msat,
        remote_balance_msat: init.initial_client_balance_msat,
        init_hosted_channel: init,
        local_updates: 0,
        remote_updates: 0,
        incoming_htlcs: vec![],
        outgoing_htlcs: vec![],
        remote_sig_of_local: msg.local_sig_of_remote_lcss,
        local_sig_of_remote: Signature64::ZERO,
    };
    if lcss.verify_remote_sig(&peer).is_err() {
        master.channel(peer).opening_refund_spk = None;
        let error = ErrorMessage::new(
            master.channel(peer).channel_id,
            error_codes::ERR_WRONG_REMOTE_SIG,
            "bad signature on initial state",
        );
        let _ = master.send_peer(&peer, HostedMessage::Error(error)).await;
        return;
    }
    lcss.local_sig_of_remote = lcss.sign_mirrored(&master.node_secret);

    master.persist_record(peer, |record| record.lcss = Some(lcss.clone()));
    master.channel(peer).opening_refund_spk = None;

    let reply = StateUpdate {
        block_day: lcss.block_day,
        local_updates: lcss.local_updates,
        remote_updates: lcss.remote_updates,
        local_sig_of_remote_lcss: lcss.local_sig_of_remote,
    };
    let _ = master.send_peer(&peer, HostedMessage::StateUpdate(reply)).await;
    send_channel_update(master, peer).await;
    tracing::info!(peer = %peer, "hosted channel opened as host");
}

async fn finish_opening_as_client<U: UpstreamNode>(
    master: &mut ChannelMaster<U>,
    peer: PublicKey,
    msg: StateUpdate,
) {
    let Some(mut lcss) = master.channel(peer).invoking_lcss.clone() else { return };
    let day = master.current_block_day();
    if msg.block_day.abs_diff(day) > 1 {
        tracing::warn!(peer = %peer, "peer blockday too far off, dropping handshake");
        clear_invoking(master, peer);
        return;
    }
    lcss.remote_sig_of_local = msg.local_sig_of_remote_lcss;
    if lcss.verify_remote_sig(&peer).is_err() {
        let error = ErrorMessage::new(
            master.channel(peer).channel_id,
            error_codes::ERR_WRONG_REMOTE_SIG,
            "bad signature on initial state",
        );
        let _ = master.send_peer(&peer, HostedMessage::Error(error)).await;
        clear_invoking(master, peer);
        return;
    }

    master.persist_record(peer, |record| record.lcss = Some(lcss.clone()));
    clear_invoking(master, peer);
    send_channel_update(master, peer).await;
    tracing::info!(peer = %peer, "hosted channel opened as client");
}

fn clear_invoking<U: UpstreamNode>(master: &mut ChannelMaster<U>, peer: PublicKey) {
    let chan = master.channel(peer);
    chan.invoking_refund_spk = None;
    chan.invoking_lcss = None;
}

async fn finish_override<U: UpstreamNode>(
    master: &mut ChannelMaster<U>,
    peer: PublicKey,
    msg: StateUpdate,
) {
    let Some(proposed) = master.record(&peer).and_then(|r| r.proposed_override.clone()) else {
        return;
    };
    if msg.block_day != proposed.block_day
        || msg.local_updates != proposed.remote_updates
        || msg.remote_updates != proposed.local_updates
    {
        tracing::debug!(peer = %peer, "state_update does not match proposed override");
        return;
    }
    let mut accepted = proposed;
    accepted.remote_sig_of_local = msg.local_sig_of_remote_lcss;
    if accepted.verify_remote_sig(&peer).is_err() {
        record_and_send_error(
            master,
            peer,
            error_codes::ERR_WRONG_REMOTE_SIG,
            "bad signature on override",
            None,
        )
        .await;
        return;
    }

    master.persist_record(peer, |record| {
        record.lcss = Some(accepted.clone());
        record.proposed_override = None;
        record.local_errors.clear();
        record.remote_errors.clear();
        record.suspended = false;
    });

    let chan = master.channel(peer);
    chan.uncommitted.clear();
    chan.sent_state_updates.clear();
    let stale: Vec<u64> = chan.results.keys().copied().collect();
    for id in stale {
        chan.resolve(id, HtlcResult::Fail { message: FailureMessage::PermanentChannelFailure });
    }

    send_channel_update(master, peer).await;
    tracing::info!(peer = %peer, "override accepted, channel active again");
}

/// The Active-status commit on a peer state update.
async fn commit<U: UpstreamNode>(
    master: &mut ChannelMaster<U>,
    peer: PublicKey,
    msg: StateUpdate,
) {
    let Some(prev) = master.record(&peer).and_then(|r| r.lcss.clone()) else { return };
    let day = master.current_block_day();
    if msg.block_day != day {
        tracing::info!(peer = %peer, their_day = msg.block_day, our_day = day,
            "state_update with different blockday, not committing");
        return;
    }
    if master.channel(peer).uncommitted.is_empty() {
        tracing::debug!(peer = %peer, "state_update with nothing uncommitted");
        return;
    }

    let uncommitted = master.channel(peer).uncommitted.clone();
    let mut next = match next_local_unsigned_state(&prev, &uncommitted, day) {
        Ok(next) => next,
        Err(e) => {
            tracing::warn!(peer = %peer, error = %e, "uncommitted updates do not apply");
            return;
        }
    };
    if msg.local_updates != next.remote_updates || msg.remote_updates != next.local_updates {
        tracing::info!(peer = %peer,
            msg_local = msg.local_updates, msg_remote = msg.remote_updates,
            next_local = next.local_updates, next_remote = next.remote_updates,
            "update counters differ, waiting for the next exchange");
        return;
    }
    next.remote_sig_of_local = msg.local_sig_of_remote_lcss;
    if next.verify_remote_sig(&peer).is_err() {
        record_and_send_error(
            master,
            peer,
            error_codes::ERR_WRONG_REMOTE_SIG,
            "bad signature on state update",
            None,
        )
        .await;
        return;
    }
    next.local_sig_of_remote = next.sign_mirrored(&master.node_secret);

    // Forwarding entries whose outgoing side just resolved are gone.
    let our_scid = master.channel(peer).scid;
    let resolved: Vec<u64> = prev
        .outgoing_htlcs
        .iter()
        .map(|h| h.id)
        .filter(|id| !next.outgoing_htlcs.iter().any(|h| h.id == *id))
        .collect();
    let committed_state = next.clone();
    master.persist_record_and(peer, move |data, record| {
        record.lcss = Some(committed_state);
        data.htlc_forwards.retain(|_, out| !(out.scid == our_scid && resolved.contains(&out.id)));
    });
    master.gc_preimages();

    // Consume the committed updates before acting on them; handlers may
    // queue new updates while we walk.
    let committed: Vec<UncommittedUpdate> = {
        let chan = master.channel(peer);
        chan.uncommitted.drain(..uncommitted.len()).collect()
    };
    for entry in committed {
        act_on_committed(master, peer, entry).await;
    }

    send_state_update(master, peer).await;
    tracing::info!(peer = %peer,
        local_updates = next.local_updates, remote_updates = next.remote_updates,
        "new cross-signed state");
}

/// Post-commit action for one update.
async fn act_on_committed<U: UpstreamNode>(
    master: &mut ChannelMaster<U>,
    peer: PublicKey,
    entry: UncommittedUpdate,
) {
    match (entry.origin, entry.update) {
        (UpdateOrigin::Remote, HtlcUpdate::Fail(fail)) => {
            master.channel(peer).resolve(fail.id, HtlcResult::FailOnion { reason: fail.reason });
        }
        (UpdateOrigin::Remote, HtlcUpdate::FailMalformed(fail)) => {
            master.channel(peer).resolve(
                fail.id,
                HtlcResult::Fail {
                    message: FailureMessage::InvalidOnionPayload { tlv_type: 0, offset: 0 },
                },
            );
        }
        // Fulfills were resolved eagerly on receipt.
        (UpdateOrigin::Remote, HtlcUpdate::Fulfill(_)) => {}
        (UpdateOrigin::Remote, HtlcUpdate::Add(add)) => {
            forward_committed_add(master, peer, add).await;
        }
        (UpdateOrigin::Local { forwarded_from: Some(incoming) }, HtlcUpdate::Add(add)) => {
            let out = HtlcIdentifier { scid: master.channel(peer).scid, id: add.id };
            master.persist(|data| {
                data.htlc_forwards.insert(incoming, out);
            });
        }
        (UpdateOrigin::Local { .. }, _) => {}
    }
}

/// A committed incoming HTLC is now safe to forward.
async fn forward_committed_add<U: UpstreamNode>(
    master: &mut ChannelMaster<U>,
    peer: PublicKey,
    add: UpdateAddHtlc,
) {
    let peeled = match onion::peel_onion(
        &master.node_secret,
        &add.payment_hash,
        &add.onion_routing_packet,
    ) {
        Ok(peeled) => peeled,
        Err(e) => {
            tracing::warn!(peer = %peer, error = %e, "committed add no longer peels");
            return;
        }
    };
    let scid = master.channel(peer).scid;
    let incoming = HtlcIdentifier { scid, id: add.id };

    match peeled.payload {
        HopPayload::Final(_) => {
            master.enqueue(Event::HostedResolution {
                peer,
                htlc_id: add.id,
                result: HtlcResult::Fail { message: FailureMessage::TemporaryNodeFailure },
            });
        }
        HopPayload::Relay(relay) => {
            let Some(next_onion) = peeled.next_packet else {
                master.enqueue(Event::HostedResolution {
                    peer,
                    htlc_id: add.id,
                    result: HtlcResult::Fail { message: FailureMessage::TemporaryNodeFailure },
                });
                return;
            };
            if let Some(target) = master.hosted_peer_by_scid(relay.short_channel_id) {
                // Hosted-to-hosted: call the target channel directly and
                // route its eventual result back through the event queue.
                let outcome = Box::pin(add_htlc(
                    master,
                    target,
                    incoming,
                    add.amount_msat,
                    relay.amt_to_forward,
                    add.payment_hash,
                    relay.outgoing_cltv,
                    next_onion,
                ))
                .await;
                master.bind_hosted_outcome(peer, add.id, outcome);
            } else {
                let request = SendOnionRequest {
                    onion: next_onion,
                    first_hop_scid: relay.short_channel_id,
                    amount_msat: relay.amt_to_forward,
                    delay: relay.outgoing_cltv.saturating_sub(master.block_height as u32),
                    payment_hash: add.payment_hash,
                    label: payment_label(scid, add.id),
                };
                if let Err(e) = master.upstream.send_onion(request).await {
                    tracing::warn!(peer = %peer, error = %e, "sendonion failed");
                    let update = make_channel_update(master, peer);
                    master.enqueue(Event::HostedResolution {
                        peer,
                        htlc_id: add.id,
                        result: HtlcResult::Fail {
                            message: FailureMessage::TemporaryChannelFailure {
                                channel_update: codec::encode_channel_update(&update),
                            },
                        },
                    });
                }
            }
        }
    }
}

/// Label `sendonion` payments so settlement notifications find their way
/// back to the incoming hosted HTLC.
pub fn payment_label(scid: ShortChannelId, htlc_id: u64) -> String {
    format!("hostchan/{}/{}", scid, htlc_id)
}

/// Parse a label produced by [`payment_label`].
pub fn parse_payment_label(label: &str) -> Option<(ShortChannelId, u64)> {
    let rest = label.strip_prefix("hostchan/")?;
    let (scid, id) = rest.rsplit_once('/')?;
    Some((scid.parse().ok()?, id.parse().ok()?))
}

async fn handle_remote_lcss<U: UpstreamNode>(
    master: &mut ChannelMaster<U>,
    peer: PublicKey,
    their_lcss: LastCrossSignedState,
    status: ChannelStatus,
) {
    if !matches!(status, ChannelStatus::Active | ChannelStatus::Opening) {
        tracing::debug!(peer = %peer, %status, "last_cross_signed_state ignored");
        return;
    }
    // Their message is their view; `remote_sig_of_local` there should be
    // *our* signature, `local_sig_of_remote` theirs.
    if verify_digest(&their_lcss.sig_hash(), &their_lcss.remote_sig_of_local, &master.node_id)
        .is_err()
    {
        record_and_send_error(
            master,
            peer,
            error_codes::ERR_WRONG_LOCAL_SIG,
            "their state does not carry our signature",
            None,
        )
        .await;
        return;
    }
    let as_our_view = their_lcss.reverse();
    if as_our_view.verify_remote_sig(&peer).is_err() {
        record_and_send_error(
            master,
            peer,
            error_codes::ERR_WRONG_REMOTE_SIG,
            "bad peer signature on their state",
            None,
        )
        .await;
        return;
    }

    let ours = master.record(&peer).and_then(|r| r.lcss.clone());
    let behind =
        ours.as_ref().map_or(true, |l| as_our_view.total_updates() > l.total_updates());
    if behind {
        tracing::info!(peer = %peer, "adopting peer state, ours is behind");
        master.persist_record(peer, |record| record.lcss = Some(as_our_view.clone()));
        let chan = master.channel(peer);
        chan.uncommitted.clear();
        chan.opening_refund_spk = None;
        chan.sent_state_updates.clear();
    }

    if let Some(lcss) = master.record(&peer).and_then(|r| r.lcss.clone()) {
        let _ = master.send_peer(&peer, HostedMessage::Lcss(lcss)).await;
    }
    send_channel_update(master, peer).await;
    master.schedule_post_reconnect(peer);
}

/// Tentatively accept a remote `update_add_htlc` (§ critical / per-HTLC
/// failure split).
async fn handle_remote_add<U: UpstreamNode>(
    master: &mut ChannelMaster<U>,
    peer: PublicKey,
    add: UpdateAddHtlc,
    status: ChannelStatus,
) {
    if status != ChannelStatus::Active {
        tracing::debug!(peer = %peer, %status, "update_add_htlc outside active, ignoring");
        return;
    }
    let Some(lcss) = master.record(&peer).and_then(|r| r.lcss.clone()) else { return };

    master.channel(peer).uncommitted.push(UncommittedUpdate {
        origin: UpdateOrigin::Remote,
        update: HtlcUpdate::Add(add.clone()),
    });

    let day = master.current_block_day();
    let next = match next_local_unsigned_state(&lcss, &master.channel(peer).uncommitted, day) {
        Ok(next) => next,
        Err(_) => {
            suspend_on_add(master, peer, add, "balance would go negative").await;
            return;
        }
    };
    let max_accepted = master.config.max_accepted_htlcs as usize;
    let max_in_flight = master.config.max_htlc_value_in_flight_msat;
    if next.incoming_htlcs.len() > max_accepted {
        suspend_on_add(master, peer, add, "too many in-flight HTLCs").await;
        return;
    }
    let in_flight: MilliSatoshi = next.incoming_htlcs.iter().map(|h| h.amount_msat).sum();
    if in_flight > max_in_flight {
        suspend_on_add(master, peer, add, "in-flight HTLC value exceeded").await;
        return;
    }

    let peeled =
        match onion::peel_onion(&master.node_secret, &add.payment_hash, &add.onion_routing_packet)
        {
            Ok(peeled) => peeled,
            Err(OnionError::BadPayload) => {
                // Sphinx layer is fine; the payload is not. Fail this
                // HTLC alone.
                fail_remote_add(
                    master,
                    peer,
                    &add,
                    FailureMessage::InvalidOnionPayload { tlv_type: 0, offset: 0 },
                )
                .await;
                return;
            }
            Err(e) => {
                suspend_on_add(master, peer, add, &format!("unparseable onion: {}", e)).await;
                return;
            }
        };

    match peeled.payload {
        HopPayload::Relay(relay) => {
            if add.amount_msat < relay.amt_to_forward {
                suspend_on_add(master, peer, add, "negative forwarding fee").await;
                return;
            }
            if add.amount_msat < master.config.htlc_minimum_msat {
                let update = make_channel_update(master, peer);
                fail_remote_add(
                    master,
                    peer,
                    &add,
                    FailureMessage::TemporaryChannelFailure {
                        channel_update: codec::encode_channel_update(&update),
                    },
                )
                .await;
                return;
            }
            // Accepted. The forward itself happens at commit time.
        }
        HopPayload::Final(_) => {
            // Receiving into the host is not supported.
            fail_remote_add(master, peer, &add, FailureMessage::TemporaryNodeFailure).await;
        }
    }
}

/// Remove the tentative add, record the error and suspend the channel.
async fn suspend_on_add<U: UpstreamNode>(
    master: &mut ChannelMaster<U>,
    peer: PublicKey,
    add: UpdateAddHtlc,
    reason: &str,
) {
    let chan = master.channel(peer);
    if let Some(pos) = chan
        .uncommitted
        .iter()
        .rposition(|u| matches!(&u.update, HtlcUpdate::Add(a) if a.id == add.id && !u.is_local()))
    {
        chan.uncommitted.remove(pos);
    }
    record_and_send_error(master, peer, error_codes::ERR_MANUAL_SUSPEND, reason, Some(add)).await;
}

/// Keep the remote add but immediately queue our failure for it.
async fn fail_remote_add<U: UpstreamNode>(
    master: &mut ChannelMaster<U>,
    peer: PublicKey,
    add: &UpdateAddHtlc,
    message: FailureMessage,
) {
    let Some(shared_secret) =
        onion::shared_secret_of(&master.node_secret, &add.onion_routing_packet)
    else {
        return;
    };
    let fail = UpdateFailHtlc {
        channel_id: master.channel(peer).channel_id,
        id: add.id,
        reason: create_failure_packet(&shared_secret, &message),
    };
    master.channel(peer).uncommitted.push(UncommittedUpdate {
        origin: UpdateOrigin::Local { forwarded_from: None },
        update: HtlcUpdate::Fail(fail.clone()),
    });
    if master.send_peer(&peer, HostedMessage::Fail(fail)).await.is_err() {
        let chan = master.channel(peer);
        chan.uncommitted.pop();
        return;
    }
    send_state_update(master, peer).await;
}

async fn handle_remote_fulfill<U: UpstreamNode>(
    master: &mut ChannelMaster<U>,
    peer: PublicKey,
    fulfill: UpdateFulfillHtlc,
    status: ChannelStatus,
) {
    if status != ChannelStatus::Active {
        tracing::debug!(peer = %peer, %status, "update_fulfill_htlc outside active, ignoring");
        return;
    }
    let lcss = master.record(&peer).and_then(|r| r.lcss.clone());
    let chan = master.channel(peer);
    let known = lcss
        .iter()
        .flat_map(|l| l.outgoing_htlcs.iter())
        .chain(chan.uncommitted.iter().filter_map(|u| match (&u.origin, &u.update) {
            (UpdateOrigin::Local { .. }, HtlcUpdate::Add(a)) => Some(a),
            _ => None,
        }))
        .find(|h| h.id == fulfill.id)
        .cloned();
    let Some(htlc) = known else {
        tracing::warn!(peer = %peer, id = fulfill.id, "fulfill for unknown htlc");
        return;
    };
    if sha256(&fulfill.payment_preimage) != htlc.payment_hash {
        tracing::warn!(peer = %peer, id = fulfill.id, "fulfill with wrong preimage");
        return;
    }

    // Keep the preimage durable before telling anyone upstream.
    let preimage = fulfill.payment_preimage;
    let hash = htlc.payment_hash;
    master.persist(|data| {
        data.preimages.insert(hash, preimage);
    });

    let chan = master.channel(peer);
    chan.resolve(fulfill.id, HtlcResult::Fulfill { preimage });
    chan.uncommitted.push(UncommittedUpdate {
        origin: UpdateOrigin::Remote,
        update: HtlcUpdate::Fulfill(fulfill),
    });
}

async fn handle_remote_fail<U: UpstreamNode>(
    master: &mut ChannelMaster<U>,
    peer: PublicKey,
    fail: UpdateFailHtlc,
    status: ChannelStatus,
) {
    if status != ChannelStatus::Active {
        tracing::debug!(peer = %peer, %status, "update_fail_htlc outside active, ignoring");
        return;
    }
    if fail.reason.is_empty() {
        record_and_send_error(
            master,
            peer,
            error_codes::ERR_WRONG_REMOTE_SIG,
            "fail with empty reason",
            None,
        )
        .await;
        return;
    }
    master.channel(peer).uncommitted.push(UncommittedUpdate {
        origin: UpdateOrigin::Remote,
        update: HtlcUpdate::Fail(fail),
    });
}

async fn handle_remote_error<U: UpstreamNode>(
    master: &mut ChannelMaster<U>,
    peer: PublicKey,
    error: ErrorMessage,
) {
    tracing::warn!(peer = %peer, error = %error.description(), "peer sent error");
    let channel_id = master.channel(peer).channel_id;
    master.persist_record(peer, |record| {
        if !record.remote_errors.contains(&error) {
            record.remote_errors.push(error.clone());
        }
        record.push_local_error(DetailedError {
            error: ErrorMessage::new(
                channel_id,
                error_codes::ERR_CLOSED_BY_REMOTE_PEER,
                &error.description(),
            ),
            htlc: None,
            reason: format!("peer error: {}", error.description()),
        });
    });
}

/// Add an outgoing HTLC that forwards `incoming`.
///
/// Returns either an immediate settlement (cached preimage, validation
/// failure) or a promise that fires when the peer settles it.
#[allow(clippy::too_many_arguments)]
pub async fn add_htlc<U: UpstreamNode>(
    master: &mut ChannelMaster<U>,
    peer: PublicKey,
    incoming: HtlcIdentifier,
    in_amount: MilliSatoshi,
    out_amount: MilliSatoshi,
    payment_hash: [u8; 32],
    cltv_expiry: u32,
    next_onion: Vec<u8>,
) -> AddHtlcOutcome {
    // A cached preimage settles the incoming side with no new HTLC.
    if let Some(preimage) = master.store.data().preimage_for(&payment_hash) {
        return AddHtlcOutcome::Resolved(HtlcResult::Fulfill { preimage });
    }

    // Replays of an already-forwarded HTLC re-bind the existing promise.
    let our_scid = master.channel(peer).scid;
    if let Some(out) = master.store.data().htlc_forwards.get(&incoming).copied() {
        if out.scid == our_scid {
            let (tx, rx) = oneshot::channel();
            master.channel(peer).results.insert(out.id, tx);
            tracing::debug!(%incoming, out_id = out.id, "re-bound in-flight forward");
            return AddHtlcOutcome::Pending(rx);
        }
    }

    let status = master.status(&peer);
    let lcss = master.record(&peer).and_then(|r| r.lcss.clone());
    if let Some(lcss) = &lcss {
        if lcss.incoming_htlcs.iter().any(|h| h.payment_hash == payment_hash) {
            return unknown_details_failure(master, in_amount);
        }
    }
    if !status.can_add_htlc() {
        return temporary_failure(master, peer);
    }
    let Some(lcss) = lcss else {
        return temporary_failure(master, peer);
    };

    if cltv_expiry.saturating_sub(master.block_height as u32) < master.config.cltv_expiry_delta {
        return unknown_details_failure(master, in_amount);
    }

    let required_fee = master.config.fee_base_msat
        + out_amount.fee_proportional(master.config.fee_proportional_millionths);
    match in_amount.checked_sub(out_amount) {
        Some(earned) if earned >= required_fee => {}
        _ => return temporary_failure(master, peer),
    }

    let day = master.current_block_day();
    let chan = master.channel(peer);
    let Ok(next) = next_local_unsigned_state(&lcss, &chan.uncommitted, day) else {
        return temporary_failure(master, peer);
    };
    let id = next.local_updates as u64 + 1;
    let add = UpdateAddHtlc {
        channel_id: chan.channel_id,
        id,
        amount_msat: out_amount,
        payment_hash,
        cltv_expiry,
        onion_routing_packet: next_onion,
    };
    chan.uncommitted.push(UncommittedUpdate {
        origin: UpdateOrigin::Local { forwarded_from: Some(incoming) },
        update: HtlcUpdate::Add(add.clone()),
    });
    if next_local_unsigned_state(&lcss, &chan.uncommitted, day).is_err() {
        chan.uncommitted.pop();
        return temporary_failure(master, peer);
    }

    let (tx, rx) = oneshot::channel();
    master.channel(peer).results.insert(id, tx);

    if master.send_peer(&peer, HostedMessage::Add(add)).await.is_err() {
        let chan = master.channel(peer);
        chan.uncommitted.pop();
        chan.results.remove(&id);
        return temporary_failure(master, peer);
    }
    send_state_update(master, peer).await;
    AddHtlcOutcome::Pending(rx)
}

fn temporary_failure<U: UpstreamNode>(
    master: &mut ChannelMaster<U>,
    peer: PublicKey,
) -> AddHtlcOutcome {
    let update = make_channel_update(master, peer);
    AddHtlcOutcome::Resolved(HtlcResult::Fail {
        message: FailureMessage::TemporaryChannelFailure {
            channel_update: codec::encode_channel_update(&update),
        },
    })
}

fn unknown_details_failure<U: UpstreamNode>(
    master: &ChannelMaster<U>,
    htlc_msat: MilliSatoshi,
) -> AddHtlcOutcome {
    AddHtlcOutcome::Resolved(HtlcResult::Fail {
        message: FailureMessage::IncorrectOrUnknownPaymentDetails {
            htlc_msat,
            height: master.block_height as u32,
        },
    })
}

/// The forwarded HTLC for `incoming_htlc_id` settled somewhere else;
/// settle our incoming side to match.
pub async fn got_payment_result<U: UpstreamNode>(
    master: &mut ChannelMaster<U>,
    peer: PublicKey,
    incoming_htlc_id: u64,
    result: HtlcResult,
) {
    let status = master.status(&peer);
    if !status.accepts_payment_results() {
        tracing::debug!(peer = %peer, %status, "payment result ignored in this status");
        return;
    }
    let channel_id = master.channel(peer).channel_id;

    match result {
        HtlcResult::Fulfill { preimage } => {
            let hash = sha256(&preimage);
            master.persist(|data| {
                data.preimages.insert(hash, preimage);
            });
            let fulfill =
                UpdateFulfillHtlc { channel_id, id: incoming_htlc_id, payment_preimage: preimage };
            master.channel(peer).uncommitted.push(UncommittedUpdate {
                origin: UpdateOrigin::Local { forwarded_from: None },
                update: HtlcUpdate::Fulfill(fulfill.clone()),
            });
            if master.send_peer(&peer, HostedMessage::Fulfill(fulfill)).await.is_err() {
                // The preimage stays cached; reconnect replays the fulfill.
                master.channel(peer).uncommitted.pop();
                return;
            }
        }
        HtlcResult::FailOnion { reason } => {
            let Some(shared_secret) = incoming_shared_secret(master, peer, incoming_htlc_id)
            else {
                return;
            };
            let fail = UpdateFailHtlc {
                channel_id,
                id: incoming_htlc_id,
                reason: wrap_failure_packet(&shared_secret, &reason),
            };
            master.channel(peer).uncommitted.push(UncommittedUpdate {
                origin: UpdateOrigin::Local { forwarded_from: None },
                update: HtlcUpdate::Fail(fail.clone()),
            });
            if master.send_peer(&peer, HostedMessage::Fail(fail)).await.is_err() {
                master.channel(peer).uncommitted.pop();
                return;
            }
        }
        HtlcResult::Fail { message } => {
            let Some(shared_secret) = incoming_shared_secret(master, peer, incoming_htlc_id)
            else {
                return;
            };
            let fail = UpdateFailHtlc {
                channel_id,
                id: incoming_htlc_id,
                reason: create_failure_packet(&shared_secret, &message),
            };
            master.channel(peer).uncommitted.push(UncommittedUpdate {
                origin: UpdateOrigin::Local { forwarded_from: None },
                update: HtlcUpdate::Fail(fail.clone()),
            });
            if master.send_peer(&peer, HostedMessage::Fail(fail)).await.is_err() {
                master.channel(peer).uncommitted.pop();
                return;
            }
        }
        HtlcResult::FailMalformed { failure_code } => {
            let onion_hash = incoming_next_onion_hash(master, peer, incoming_htlc_id)
                .unwrap_or([0u8; 32]);
            let fail = UpdateFailMalformedHtlc {
                channel_id,
                id: incoming_htlc_id,
                sha256_of_onion: onion_hash,
                failure_code,
            };
            master.channel(peer).uncommitted.push(UncommittedUpdate {
                origin: UpdateOrigin::Local { forwarded_from: None },
                update: HtlcUpdate::FailMalformed(fail.clone()),
            });
            if master.send_peer(&peer, HostedMessage::FailMalformed(fail)).await.is_err() {
                master.channel(peer).uncommitted.pop();
                return;
            }
        }
    }

    if status == ChannelStatus::Active {
        send_state_update(master, peer).await;
    }
}

/// Shared secret of a committed incoming HTLC, recovered by re-peeling
/// its stored onion.
fn incoming_shared_secret<U: UpstreamNode>(
    master: &ChannelMaster<U>,
    peer: PublicKey,
    htlc_id: u64,
) -> Option<[u8; 32]> {
    let lcss = master.record(&peer)?.lcss.as_ref()?;
    let htlc = lcss.incoming_htlcs.iter().find(|h| h.id == htlc_id)?;
    onion::shared_secret_of(&master.node_secret, &htlc.onion_routing_packet)
}

/// SHA-256 of the onion we forwarded for a committed incoming HTLC.
fn incoming_next_onion_hash<U: UpstreamNode>(
    master: &ChannelMaster<U>,
    peer: PublicKey,
    htlc_id: u64,
) -> Option<[u8; 32]> {
    let lcss = master.record(&peer)?.lcss.as_ref()?;
    let htlc = lcss.incoming_htlcs.iter().find(|h| h.id == htlc_id)?;
    let peeled =
        onion::peel_onion(&master.node_secret, &htlc.payment_hash, &htlc.onion_routing_packet)
            .ok()?;
    peeled.next_packet.map(|p| sha256(&p))
}

/// React to a new block: time out expired outgoing HTLCs and shed
/// uncommitted adds that are about to expire.
pub async fn on_block_updated<U: UpstreamNode>(
    master: &mut ChannelMaster<U>,
    peer: PublicKey,
    height: u64,
) {
    let channel_id = master.channel(peer).channel_id;
    if let Some(lcss) = master.record(&peer).and_then(|r| r.lcss.clone()) {
        let timed_out: Vec<UpdateAddHtlc> = lcss
            .outgoing_htlcs
            .iter()
            .filter(|h| (h.cltv_expiry as u64) < height)
            .cloned()
            .collect();
        if !timed_out.is_empty() {
            let error = ErrorMessage::new(
                channel_id,
                error_codes::ERR_TIMED_OUT_OUTGOING_HTLC,
                "outgoing htlc timed out",
            );
            master.persist_record(peer, |record| {
                for htlc in &timed_out {
                    record.push_local_error(DetailedError {
                        error: error.clone(),
                        htlc: Some(htlc.clone()),
                        reason: format!("outgoing htlc {} timed out at height {}", htlc.id, height),
                    });
                }
            });
            let _ = master.send_peer(&peer, HostedMessage::Error(error)).await;
            let chan = master.channel(peer);
            for htlc in &timed_out {
                chan.resolve(
                    htlc.id,
                    HtlcResult::Fail { message: FailureMessage::PermanentChannelFailure },
                );
            }
            tracing::warn!(peer = %peer, count = timed_out.len(),
                "channel errored: outgoing htlcs timed out");
        }
    }

    // Uncommitted local adds that no longer clear the CLTV margin are
    // rolled back before the peer can commit them.
    let delta = master.config.cltv_expiry_delta;
    let chan = master.channel(peer);
    let mut expired_ids = Vec::new();
    chan.uncommitted.retain(|u| match (&u.origin, &u.update) {
        (UpdateOrigin::Local { .. }, HtlcUpdate::Add(add))
            if (add.cltv_expiry.saturating_sub(height as u32)) < delta =>
        {
            expired_ids.push((add.id, add.amount_msat));
            false
        }
        _ => true,
    });
    for (id, amount) in expired_ids {
        chan.resolve(
            id,
            HtlcResult::Fail {
                message: FailureMessage::IncorrectOrUnknownPaymentDetails {
                    htlc_msat: amount,
                    height: height as u32,
                },
            },
        );
    }
}

/// Act as a client: ask `peer` to host a channel for us.
pub async fn request_hosted_channel<U: UpstreamNode>(
    master: &mut ChannelMaster<U>,
    peer: PublicKey,
) -> Result<(), String> {
    let status = master.status(&peer);
    if status != ChannelStatus::NotOpened {
        return Err(format!("channel is {}", status));
    }
    let address = master
        .upstream
        .new_address()
        .await
        .map_err(|e| format!("cannot get refund address: {}", e))?;
    let refund_script = crate::upstream::address_to_script(&address)?;

    master.channel(peer).invoking_refund_spk = Some(refund_script.clone());
    let invoke = InvokeHostedChannel {
        chain_hash: master.chain_hash,
        refund_script_pubkey: refund_script,
        secret: vec![],
    };
    master
        .send_peer(&peer, HostedMessage::Invoke(invoke))
        .await
        .map_err(|e| format!("cannot reach peer: {}", e))
}

/// Host-side error recovery: propose a fresh state with the given local
/// balance.
pub async fn propose_override<U: UpstreamNode>(
    master: &mut ChannelMaster<U>,
    peer: PublicKey,
    new_local_balance: MilliSatoshi,
) -> Result<(), String> {
    let status = master.status(&peer);
    if !matches!(status, ChannelStatus::Errored | ChannelStatus::Overriding) {
        return Err(format!("channel is {}, not errored", status));
    }
    let Some(lcss) = master.record(&peer).and_then(|r| r.lcss.clone()) else {
        return Err("no cross-signed state".into());
    };
    if !lcss.is_host {
        return Err("only the host can propose an override".into());
    }
    let capacity = lcss.init_hosted_channel.channel_capacity_msat;
    let Some(new_remote_balance) = capacity.checked_sub(new_local_balance) else {
        return Err("balance exceeds capacity".into());
    };

    let mut proposed = LastCrossSignedState {
        block_day: master.current_block_day(),
        local_balance_msat: new_local_balance,
        remote_balance_msat: new_remote_balance,
        local_updates: lcss.local_updates + 1,
        remote_updates: lcss.remote_updates + 1,
        incoming_htlcs: vec![],
        outgoing_htlcs: vec![],
        remote_sig_of_local: Signature64::ZERO,
        local_sig_of_remote: Signature64::ZERO,
        ..lcss
    };
    proposed.local_sig_of_remote = proposed.sign_mirrored(&master.node_secret);

    master.persist_record(peer, |record| record.proposed_override = Some(proposed.clone()));

    let msg = StateOverride {
        block_day: proposed.block_day,
        local_balance_msat: proposed.local_balance_msat,
        local_updates: proposed.local_updates,
        remote_updates: proposed.remote_updates,
        local_sig_of_remote_lcss: proposed.local_sig_of_remote,
    };
    master
        .send_peer(&peer, HostedMessage::StateOverride(msg))
        .await
        .map_err(|e| format!("cannot reach peer: {}", e))
}

/// Record a local error (entering Errored) and tell the peer.
pub async fn record_and_send_error<U: UpstreamNode>(
    master: &mut ChannelMaster<U>,
    peer: PublicKey,
    code: &str,
    reason: &str,
    htlc: Option<UpdateAddHtlc>,
) {
    let channel_id = master.channel(peer).channel_id;
    let error = ErrorMessage::new(channel_id, code, reason);
    master.persist_record(peer, |record| {
        record.push_local_error(DetailedError {
            error: error.clone(),
            htlc,
            reason: reason.to_owned(),
        });
    });
    let _ = master.send_peer(&peer, HostedMessage::Error(error)).await;
    tracing::warn!(peer = %peer, code, reason, "channel errored");
}

async fn deny<U: UpstreamNode>(master: &mut ChannelMaster<U>, peer: PublicKey, reason: &str) {
    let channel_id = master.channel(peer).channel_id;
    let error = ErrorMessage::new(channel_id, error_codes::ERR_CHANNEL_DENIED, reason);
    let _ = master.send_peer(&peer, HostedMessage::Error(error)).await;
    tracing::info!(peer = %peer, reason, "hosted channel denied");
}

/// Send our signed state update for the current next state, unless an
/// identical one just went out.
pub async fn send_state_update<U: UpstreamNode>(master: &mut ChannelMaster<U>, peer: PublicKey) {
    let Some(lcss) = master.record(&peer).and_then(|r| r.lcss.clone()) else { return };
    let day = master.current_block_day();
    let chan = master.channel(peer);
    let next = match next_local_unsigned_state(&lcss, &chan.uncommitted, day) {
        Ok(next) => next,
        Err(e) => {
            tracing::warn!(peer = %peer, error = %e, "cannot build next state");
            return;
        }
    };
    let update = StateUpdate {
        block_day: day,
        local_updates: next.local_updates,
        remote_updates: next.remote_updates,
        local_sig_of_remote_lcss: next.sign_mirrored(&master.node_secret),
    };
    let encoded = codec::encode_state_update(&update);
    if !master.channel(peer).note_sent_state_update(encoded) {
        tracing::debug!(peer = %peer, "state update debounced");
        return;
    }
    let _ = master.send_peer(&peer, HostedMessage::StateUpdate(update)).await;
}

/// Gossip-style channel update for our side of the hosted channel.
pub fn make_channel_update<U: UpstreamNode>(
    master: &ChannelMaster<U>,
    peer: PublicKey,
) -> ChannelUpdate {
    let timestamp = std::time::SystemTime::now()
        .duration_since(std::time::UNIX_EPOCH)
        .map(|d| d.as_secs() as u32)
        .unwrap_or(0);
    // Direction bit: whether we are the lexicographically second node.
    let direction = (master.node_id.serialize() > peer.serialize()) as u8;
    let mut update = ChannelUpdate {
        signature: Signature64::ZERO,
        chain_hash: master.chain_hash,
        short_channel_id: hosted_short_channel_id(&master.node_id, &peer),
        timestamp,
        message_flags: 1,
        channel_flags: direction,
        cltv_expiry_delta: master.config.cltv_expiry_delta as u16,
        htlc_minimum_msat: master.config.htlc_minimum_msat,
        fee_base_msat: master.config.fee_base_msat.0 as u32,
        fee_proportional_millionths: master.config.fee_proportional_millionths as u32,
        htlc_maximum_msat: master.config.channel_capacity_msat,
    };
    update.sign(&master.node_secret);
    update
}

async fn send_channel_update<U: UpstreamNode>(master: &mut ChannelMaster<U>, peer: PublicKey) {
    let update = make_channel_update(master, peer);
    let _ = master.send_peer(&peer, HostedMessage::ChannelUpdate(update)).await;
}

/// Post-reconnect (and post-catch-up) inspection: settle every committed
/// incoming HTLC we can already decide.
pub async fn inspect_committed_incoming<U: UpstreamNode>(
    master: &mut ChannelMaster<U>,
    peer: PublicKey,
) {
    let Some(lcss) = master.record(&peer).and_then(|r| r.lcss.clone()) else { return };
    let scid = master.channel(peer).scid;

    for htlc in lcss.incoming_htlcs {
        let incoming = HtlcIdentifier { scid, id: htlc.id };
        if let Some(preimage) = master.store.data().preimage_for(&htlc.payment_hash) {
            got_payment_result(master, peer, htlc.id, HtlcResult::Fulfill { preimage }).await;
            continue;
        }
        if master.store.data().htlc_forwards.contains_key(&incoming) {
            // The outgoing side lives on another hosted channel; its
            // settlement will find its way back here.
            continue;
        }
        let label = payment_label(scid, htlc.id);
        match master.upstream.inspect_outgoing_payment(htlc.payment_hash, &label).await {
            Ok(status) => {
                master.apply_payment_status(peer, htlc.id, htlc.payment_hash, label, status, 0)
                    .await;
            }
            Err(e) => {
                tracing::warn!(peer = %peer, error = %e, "cannot inspect outgoing payment");
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_status_precedence() {
        // No record, no scratches.
        assert_eq!(channel_status(None, None), ChannelStatus::NotOpened);

        let mut record = ChannelRecord::default();
        assert_eq!(channel_status(Some(&record), None), ChannelStatus::NotOpened);

        record.suspended = true;
        assert_eq!(channel_status(Some(&record), None), ChannelStatus::Suspended);

        record.local_errors.push(DetailedError {
            error: ErrorMessage::new([0u8; 32], error_codes::ERR_MANUAL_SUSPEND, ""),
            htlc: None,
            reason: "".into(),
        });
        assert_eq!(channel_status(Some(&record), None), ChannelStatus::Errored);
    }

    #[test]
    fn test_payment_label_roundtrip() {
        let scid = ShortChannelId(0x0001_0002_0003_0004);
        let label = payment_label(scid, 42);
        assert_eq!(parse_payment_label(&label), Some((scid, 42)));
        assert_eq!(parse_payment_label("unrelated"), None);
    }

    #[test]
    fn test_debounce_ring() {
        let our = crate::master::tests_support::test_pubkey(1);
        let peer = crate::master::tests_support::test_pubkey(2);
        let mut chan = Channel::new(&our, peer);
        assert!(chan.note_sent_state_update(vec![1]));
        assert!(!chan.note_sent_state_update(vec![1]));
        assert!(chan.note_sent_state_update(vec![2]));
        assert!(chan.note_sent_state_update(vec![3]));
        assert!(chan.note_sent_state_update(vec![4]));
        // vec![1] fell off the ring of three.
        assert!(chan.note_sent_state_update(vec![1]));
    }
}
