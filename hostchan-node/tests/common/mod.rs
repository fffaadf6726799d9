//! Shared test helpers for hostchan-node integration tests.

#![allow(dead_code)]

use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};

use secp256k1::{PublicKey, Secp256k1, SecretKey};
use tokio::sync::mpsc;

use hostchan_core::state::{next_local_unsigned_state, UncommittedUpdate};
use hostchan_core::types::block_day;
use hostchan_core::wire::{
    decode_message, encode_message, HostedMessage, InitHostedChannel, InvokeHostedChannel,
    LastCrossSignedState, Signature64, StateUpdate,
};
use hostchan_store::ChannelStore;

use hostchan_node::channel::{self, ChannelStatus};
use hostchan_node::config::Config;
use hostchan_node::event::Event;
use hostchan_node::master::ChannelMaster;
use hostchan_node::rpc::RpcError;
use hostchan_node::upstream::{
    chain_hash_for_network, NodeInfo, PaymentStatus, SendOnionRequest, UpstreamNode,
};

/// Block height the harness starts at.
pub const START_HEIGHT: u64 = 800_000;

/// Scripted stand-in for lightningd.
#[derive(Clone)]
pub struct FakeUpstream {
    /// Custom messages delivered to peers.
    pub sent: Arc<Mutex<Vec<(PublicKey, Vec<u8>)>>>,
    /// Onions sent via `sendonion`.
    pub onions: Arc<Mutex<Vec<SendOnionRequest>>>,
    /// Scripted `listsendpays` answers by label.
    pub payments: Arc<Mutex<HashMap<String, PaymentStatus>>>,
    /// When set, every send_custom_message fails.
    pub fail_sends: Arc<AtomicBool>,
    node_info: NodeInfo,
}

impl FakeUpstream {
    pub fn new(node_id: PublicKey) -> FakeUpstream {
        FakeUpstream {
            sent: Arc::new(Mutex::new(Vec::new())),
            onions: Arc::new(Mutex::new(Vec::new())),
            payments: Arc::new(Mutex::new(HashMap::new())),
            fail_sends: Arc::new(AtomicBool::new(false)),
            node_info: NodeInfo {
                id: node_id,
                blockheight: START_HEIGHT,
                network: "regtest".into(),
            },
        }
    }

    /// Drain and decode everything sent to `peer`.
    pub fn take_sent(&self, peer: &PublicKey) -> Vec<HostedMessage> {
        let mut sent = self.sent.lock().unwrap();
        let (ours, rest): (Vec<_>, Vec<_>) = sent.drain(..).partition(|(to, _)| to == peer);
        *sent = rest;
        ours.into_iter()
            .map(|(_, raw)| decode_message(&raw).expect("host sends well-formed messages"))
            .collect()
    }

    pub fn take_onions(&self) -> Vec<SendOnionRequest> {
        self.onions.lock().unwrap().drain(..).collect()
    }
}

impl UpstreamNode for FakeUpstream {
    async fn getinfo(&self) -> Result<NodeInfo, RpcError> {
        Ok(self.node_info.clone())
    }

    async fn send_custom_message(
        &self,
        peer: &PublicKey,
        payload: Vec<u8>,
    ) -> Result<(), RpcError> {
        if self.fail_sends.load(Ordering::SeqCst) {
            return Err(RpcError::Disconnected);
        }
        self.sent.lock().unwrap().push((*peer, payload));
        Ok(())
    }

    async fn send_onion(&self, request: SendOnionRequest) -> Result<(), RpcError> {
        self.onions.lock().unwrap().push(request);
        Ok(())
    }

    async fn inspect_outgoing_payment(
        &self,
        _payment_hash: [u8; 32],
        label: &str,
    ) -> Result<PaymentStatus, RpcError> {
        Ok(self
            .payments
            .lock()
            .unwrap()
            .get(label)
            .cloned()
            .unwrap_or(PaymentStatus::Unknown))
    }

    async fn new_address(&self) -> Result<String, RpcError> {
        // BIP-173 vector; only the decoded script matters here.
        Ok("bc1qw508d6qejxtdg4y5r3zarvary0c5xw7kv8f3t4".into())
    }
}

/// The scripted remote side of one hosted channel.
pub struct ClientSide {
    pub secret: SecretKey,
    pub id: PublicKey,
    /// The channel state as this client sees it.
    pub lcss: LastCrossSignedState,
}

impl ClientSide {
    pub fn new(seed: u8) -> ClientSide {
        let secp = Secp256k1::new();
        let secret = SecretKey::from_slice(&[seed; 32]).unwrap();
        let id = PublicKey::from_secret_key(&secp, &secret);
        ClientSide { secret, id, lcss: placeholder_lcss() }
    }

    /// Initialize the client view from the host's offer.
    pub fn begin(&mut self, init: &InitHostedChannel, refund_spk: &[u8], day: u32) {
        self.lcss = LastCrossSignedState {
            is_host: false,
            refund_script_pubkey: refund_spk.to_vec(),
            init_hosted_channel: init.clone(),
            block_day: day,
            local_balance_msat: init.initial_client_balance_msat,
            remote_balance_msat: init.channel_capacity_msat - init.initial_client_balance_msat,
            local_updates: 0,
            remote_updates: 0,
            incoming_htlcs: vec![],
            outgoing_htlcs: vec![],
            remote_sig_of_local: Signature64::ZERO,
            local_sig_of_remote: Signature64::ZERO,
        };
    }

    /// This client's signed state update for a client-view state.
    pub fn state_update_for(&self, state: &LastCrossSignedState) -> StateUpdate {
        StateUpdate {
            block_day: state.block_day,
            local_updates: state.local_updates,
            remote_updates: state.remote_updates,
            local_sig_of_remote_lcss: state.sign_mirrored(&self.secret),
        }
    }
}

fn placeholder_lcss() -> LastCrossSignedState {
    LastCrossSignedState {
        is_host: false,
        refund_script_pubkey: vec![],
        init_hosted_channel: InitHostedChannel {
            max_htlc_value_in_flight_msat: Default::default(),
            htlc_minimum_msat: Default::default(),
            max_accepted_htlcs: 0,
            channel_capacity_msat: Default::default(),
            initial_client_balance_msat: Default::default(),
            features: vec![],
        },
        block_day: 0,
        local_balance_msat: Default::default(),
        remote_balance_msat: Default::default(),
        local_updates: 0,
        remote_updates: 0,
        incoming_htlcs: vec![],
        outgoing_htlcs: vec![],
        remote_sig_of_local: Signature64::ZERO,
        local_sig_of_remote: Signature64::ZERO,
    }
}

/// A host master wired to a fake upstream, plus scripted clients.
pub struct Harness {
    pub master: ChannelMaster<FakeUpstream>,
    pub upstream: FakeUpstream,
    pub events_rx: mpsc::UnboundedReceiver<Event>,
    pub host_id: PublicKey,
    pub clients: Vec<ClientSide>,
    _dir: tempfile::TempDir,
}

impl Harness {
    pub fn new() -> Harness {
        Self::with_config(Config::default())
    }

    pub fn with_config(config: Config) -> Harness {
        let secp = Secp256k1::new();
        let host_secret = SecretKey::from_slice(&[0x42u8; 32]).unwrap();
        let host_id = PublicKey::from_secret_key(&secp, &host_secret);

        let dir = tempfile::tempdir().unwrap();
        let store = ChannelStore::open(dir.path()).unwrap();
        let upstream = FakeUpstream::new(host_id);
        let (events_tx, events_rx) = mpsc::unbounded_channel();
        let master = ChannelMaster::new(
            config,
            store,
            upstream.clone(),
            host_secret,
            host_id,
            chain_hash_for_network("regtest").unwrap(),
            START_HEIGHT,
            events_tx,
        );
        Harness {
            master,
            upstream,
            events_rx,
            host_id,
            clients: vec![ClientSide::new(0x24), ClientSide::new(0x25)],
            _dir: dir,
        }
    }

    pub fn day(&self) -> u32 {
        block_day(self.master.block_height)
    }

    /// Deliver a message from client `idx` through the custommsg path.
    pub async fn deliver(&mut self, idx: usize, msg: HostedMessage) {
        let id = self.clients[idx].id;
        let framed = encode_message(&msg).unwrap();
        channel::on_peer_message(&mut self.master, id, &framed).await;
    }

    /// Everything the host sent to client `idx` since the last call.
    pub fn host_sent(&self, idx: usize) -> Vec<HostedMessage> {
        self.upstream.take_sent(&self.clients[idx].id)
    }

    pub fn status(&self, idx: usize) -> ChannelStatus {
        self.master.status(&self.clients[idx].id)
    }

    pub fn host_lcss(&self, idx: usize) -> Option<LastCrossSignedState> {
        self.master.record(&self.clients[idx].id).and_then(|r| r.lcss.clone())
    }

    /// Run the opening handshake for client `idx`, leaving the channel
    /// Active with both views synchronized.
    pub async fn open_channel(&mut self, idx: usize) {
        let invoke = InvokeHostedChannel {
            chain_hash: self.master.chain_hash,
            refund_script_pubkey: vec![0x00, 0x14, 0xaa, 0xbb, 0xcc, idx as u8],
            secret: vec![],
        };
        self.deliver(idx, HostedMessage::Invoke(invoke.clone())).await;
        let init = match self.host_sent(idx).as_slice() {
            [HostedMessage::Init(init)] => init.clone(),
            other => panic!("expected init_hosted_channel, got {:?}", other),
        };

        let day = self.day();
        self.clients[idx].begin(&init, &invoke.refund_script_pubkey, day);
        let first_update = {
            let client = &self.clients[idx];
            client.state_update_for(&client.lcss)
        };
        self.deliver(idx, HostedMessage::StateUpdate(first_update)).await;

        // Adopt the host's counter-signature into the client view.
        let sent = self.host_sent(idx);
        let host_update = sent
            .iter()
            .find_map(|m| match m {
                HostedMessage::StateUpdate(u) => Some(u.clone()),
                _ => None,
            })
            .expect("host answers with its state update");
        let client = &mut self.clients[idx];
        client.lcss.remote_sig_of_local = host_update.local_sig_of_remote_lcss;
        client.lcss.local_sig_of_remote = client.lcss.sign_mirrored(&client.secret);
        assert!(client.lcss.verify_remote_sig(&self.host_id).is_ok());
        assert_eq!(self.status(idx), ChannelStatus::Active);
    }

    /// Countersign client `idx`'s view of the pending updates, driving a
    /// commit on the host, then mirror the committed state locally.
    pub async fn client_commits(&mut self, idx: usize, client_updates: &[UncommittedUpdate]) {
        let day = self.day();
        let next = next_local_unsigned_state(&self.clients[idx].lcss, client_updates, day)
            .expect("client updates apply");
        let update = self.clients[idx].state_update_for(&next);
        self.deliver(idx, HostedMessage::StateUpdate(update)).await;

        let host_lcss = self.host_lcss(idx).expect("host committed");
        let client = &mut self.clients[idx];
        let mut committed = next;
        committed.local_sig_of_remote = committed.sign_mirrored(&client.secret);
        committed.remote_sig_of_local = host_lcss.local_sig_of_remote;
        client.lcss = committed;
    }

    /// Drain and handle every queued master event (hosted resolutions,
    /// deferred timers that already fired).
    pub async fn pump_events(&mut self) {
        while let Ok(event) = self.events_rx.try_recv() {
            self.master.handle_event(event).await;
        }
    }
}
