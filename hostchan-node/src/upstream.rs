//! Narrow interface to the upstream Lightning node.
//!
//! The channel machinery only ever talks to [`UpstreamNode`]; the
//! production implementation translates to lightningd RPC calls, and the
//! integration tests script a fake.

use std::future::Future;
use std::path::Path;

use secp256k1::PublicKey;
use serde_json::{json, Value};

use hostchan_core::types::{MilliSatoshi, ShortChannelId};

use crate::rpc::{RpcClient, RpcError};

/// Static facts about the upstream node.
#[derive(Clone, Debug)]
pub struct NodeInfo {
    /// The node id.
    pub id: PublicKey,
    /// Current block height.
    pub blockheight: u64,
    /// Network name (`bitcoin`, `testnet`, `signet`, `regtest`).
    pub network: String,
}

/// Where an outgoing payment stands.
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum PaymentStatus {
    /// Settled; here is the preimage.
    Complete {
        /// The payment preimage.
        preimage: [u8; 32],
    },
    /// Failed; the raw failure onion when the error came from downstream.
    Failed {
        /// Encrypted failure onion, if any.
        onion_reply: Option<Vec<u8>>,
    },
    /// Still in flight.
    Pending,
    /// Never seen by the upstream node.
    Unknown,
}

/// Everything `sendonion` needs.
#[derive(Clone, Debug)]
pub struct SendOnionRequest {
    /// The onion for the next hop.
    pub onion: Vec<u8>,
    /// Channel to send the first hop over.
    pub first_hop_scid: ShortChannelId,
    /// Amount for the first hop.
    pub amount_msat: MilliSatoshi,
    /// CLTV delta for the first hop.
    pub delay: u32,
    /// Payment hash.
    pub payment_hash: [u8; 32],
    /// Label used to find the payment again.
    pub label: String,
}

/// Abstraction over the upstream Lightning node.
pub trait UpstreamNode {
    /// Current node info (height, network, id).
    fn getinfo(&self) -> impl Future<Output = Result<NodeInfo, RpcError>>;

    /// Deliver a raw custom message to a connected peer.
    fn send_custom_message(
        &self,
        peer: &PublicKey,
        payload: Vec<u8>,
    ) -> impl Future<Output = Result<(), RpcError>>;

    /// Send a payment onion along a first hop.
    fn send_onion(&self, request: SendOnionRequest) -> impl Future<Output = Result<(), RpcError>>;

    /// Inspect an outgoing payment by payment hash and label.
    fn inspect_outgoing_payment(
        &self,
        payment_hash: [u8; 32],
        label: &str,
    ) -> impl Future<Output = Result<PaymentStatus, RpcError>>;

    /// A fresh bech32 address, used to obtain a refund script.
    fn new_address(&self) -> impl Future<Output = Result<String, RpcError>>;
}

/// Production implementation over the lightningd RPC socket.
#[derive(Clone)]
pub struct ClnUpstream {
    rpc: RpcClient,
}

impl ClnUpstream {
    /// Wrap a connected RPC client.
    pub fn new(rpc: RpcClient) -> Self {
        Self { rpc }
    }

    /// Resolve the peer owning a (real) short channel id.
    async fn peer_of_scid(&self, scid: ShortChannelId) -> Result<PublicKey, RpcError> {
        let result = self.rpc.call("listpeerchannels", json!({})).await?;
        let channels = result
            .get("channels")
            .and_then(Value::as_array)
            .ok_or_else(|| RpcError::BadResponse("listpeerchannels without channels".into()))?;
        for channel in channels {
            let matches = channel
                .get("short_channel_id")
                .and_then(Value::as_str)
                .and_then(|s| s.parse::<ShortChannelId>().ok())
                == Some(scid);
            if matches {
                let peer_hex = channel
                    .get("peer_id")
                    .and_then(Value::as_str)
                    .ok_or_else(|| RpcError::BadResponse("channel without peer_id".into()))?;
                return parse_pubkey(peer_hex)
                    .ok_or_else(|| RpcError::BadResponse("bad peer_id".into()));
            }
        }
        Err(RpcError::BadResponse(format!("no channel with scid {}", scid)))
    }
}

impl UpstreamNode for ClnUpstream {
    async fn getinfo(&self) -> Result<NodeInfo, RpcError> {
        let result = self.rpc.call("getinfo", json!({})).await?;
        let id = result
            .get("id")
            .and_then(Value::as_str)
            .and_then(parse_pubkey)
            .ok_or_else(|| RpcError::BadResponse("getinfo without id".into()))?;
        let blockheight = result
            .get("blockheight")
            .and_then(Value::as_u64)
            .ok_or_else(|| RpcError::BadResponse("getinfo without blockheight".into()))?;
        let network = result
            .get("network")
            .and_then(Value::as_str)
            .ok_or_else(|| RpcError::BadResponse("getinfo without network".into()))?
            .to_owned();
        Ok(NodeInfo { id, blockheight, network })
    }

    async fn send_custom_message(
        &self,
        peer: &PublicKey,
        payload: Vec<u8>,
    ) -> Result<(), RpcError> {
        self.rpc
            .call(
                "sendcustommsg",
                json!({
                    "node_id": hex::encode(peer.serialize()),
                    "msg": hex::encode(payload),
                }),
            )
            .await
            .map(|_| ())
    }

    async fn send_onion(&self, request: SendOnionRequest) -> Result<(), RpcError> {
        let first_peer = self.peer_of_scid(request.first_hop_scid).await?;
        self.rpc
            .call(
                "sendonion",
                json!({
                    "onion": hex::encode(&request.onion),
                    "first_hop": {
                        "id": hex::encode(first_peer.serialize()),
                        "channel": request.first_hop_scid.to_string(),
                        "amount_msat": format!("{}", request.amount_msat),
                        "delay": request.delay,
                    },
                    "payment_hash": hex::encode(request.payment_hash),
                    "label": request.label,
                    // No shared secrets: we want the raw onion reply back.
                    "shared_secrets": [],
                }),
            )
            .await
            .map(|_| ())
    }

    async fn inspect_outgoing_payment(
        &self,
        payment_hash: [u8; 32],
        label: &str,
    ) -> Result<PaymentStatus, RpcError> {
        let result = self
            .rpc
            .call("listsendpays", json!({ "payment_hash": hex::encode(payment_hash) }))
            .await?;
        let payments = result
            .get("payments")
            .and_then(Value::as_array)
            .ok_or_else(|| RpcError::BadResponse("listsendpays without payments".into()))?;

        let ours = payments
            .iter()
            .find(|p| p.get("label").and_then(Value::as_str) == Some(label));
        let Some(payment) = ours else {
            return Ok(PaymentStatus::Unknown);
        };

        match payment.get("status").and_then(Value::as_str) {
            Some("complete") => {
                let preimage = payment
                    .get("payment_preimage")
                    .and_then(Value::as_str)
                    .and_then(|s| hex::decode(s).ok())
                    .and_then(|v| <[u8; 32]>::try_from(v).ok())
                    .ok_or_else(|| RpcError::BadResponse("complete without preimage".into()))?;
                Ok(PaymentStatus::Complete { preimage })
            }
            Some("failed") => {
                let onion_reply = payment
                    .get("erroronion")
                    .or_else(|| payment.get("onionreply"))
                    .and_then(Value::as_str)
                    .and_then(|s| hex::decode(s).ok());
                Ok(PaymentStatus::Failed { onion_reply })
            }
            _ => Ok(PaymentStatus::Pending),
        }
    }

    async fn new_address(&self) -> Result<String, RpcError> {
        let result = self.rpc.call("newaddr", json!({ "addresstype": "bech32" })).await?;
        result
            .get("bech32")
            .and_then(Value::as_str)
            .map(str::to_owned)
            .ok_or_else(|| RpcError::BadResponse("newaddr without bech32".into()))
    }
}

/// Parse a hex-encoded node id.
pub fn parse_pubkey(hex_str: &str) -> Option<PublicKey> {
    let raw = hex::decode(hex_str).ok()?;
    PublicKey::from_slice(&raw).ok()
}

/// BOLT chain hash for a network name.
pub fn chain_hash_for_network(network: &str) -> Option<[u8; 32]> {
    let hex_hash = match network {
        "bitcoin" => "6fe28c0ab6f1b372c1a6a246ae63f74f931e8365e15a089c68d6190000000000",
        "testnet" => "43497fd7f826957108f4a30fd9cec3aeba79972084e90ead01ea330900000000",
        "signet" => "f61eee3b63a380a477a063af32b2bbc97c9ff9f01f2c4225e973988108000000",
        "regtest" => "06226e46111a0b59caaf126043eb5bbf28c34f3a5e332a1fc7b2b73cf188910f",
        _ => return None,
    };
    hex::decode(hex_hash).ok()?.try_into().ok()
}

/// Decode a bech32/bech32m segwit address into its scriptPubKey.
pub fn address_to_script(address: &str) -> Result<Vec<u8>, String> {
    use bech32::FromBase32;

    let (_hrp, data, _variant) =
        bech32::decode(address).map_err(|e| format!("bad address: {}", e))?;
    let (version, program_base32) = data
        .split_first()
        .ok_or_else(|| "empty address payload".to_string())?;
    let version = version.to_u8();
    if version > 16 {
        return Err("bad witness version".into());
    }
    let program = Vec::<u8>::from_base32(program_base32)
        .map_err(|e| format!("bad witness program: {}", e))?;
    if program.len() < 2 || program.len() > 40 {
        return Err("bad witness program length".into());
    }

    let mut script = Vec::with_capacity(program.len() + 2);
    // OP_0 or OP_1..OP_16, then a direct push.
    script.push(if version == 0 { 0x00 } else { 0x50 + version });
    script.push(program.len() as u8);
    script.extend_from_slice(&program);
    Ok(script)
}

/// Read the node's `hsm_secret` from the lightning directory.
pub fn load_hsm_secret(lightning_dir: &Path) -> anyhow::Result<[u8; 32]> {
    let path = lightning_dir.join("hsm_secret");
    let raw = std::fs::read(&path)
        .map_err(|e| anyhow::anyhow!("reading {}: {}", path.display(), e))?;
    <[u8; 32]>::try_from(raw.as_slice())
        .map_err(|_| anyhow::anyhow!("{} is not 32 bytes (encrypted hsm_secret?)", path.display()))
}
