//! Persistent record types.

use std::collections::HashMap;

use secp256k1::PublicKey;
use serde::{Deserialize, Serialize};

use hostchan_core::types::{HtlcIdentifier, Satoshi};
use hostchan_core::wire::{ErrorMessage, LastCrossSignedState, UpdateAddHtlc};

/// A protocol error with the context it was raised in.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct DetailedError {
    /// The signed error sent to the peer.
    pub error: ErrorMessage,
    /// The HTLC the error refers to, if any.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub htlc: Option<UpdateAddHtlc>,
    /// Free-text reason for the operator.
    pub reason: String,
}

/// Everything durable about one hosted channel.
#[derive(Clone, Debug, Default, PartialEq, Serialize, Deserialize)]
pub struct ChannelRecord {
    /// The committed, mutually signed state. Absent until the opening
    /// handshake completes.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub lcss: Option<LastCrossSignedState>,
    /// Errors we raised; non-empty means the channel is errored.
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub local_errors: Vec<DetailedError>,
    /// Errors received from the peer.
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub remote_errors: Vec<ErrorMessage>,
    /// Operator-suspended flag.
    #[serde(default)]
    pub suspended: bool,
    /// Host-proposed override awaiting the peer's matching state update.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub proposed_override: Option<LastCrossSignedState>,
    /// Pre-authorized new capacity; no protocol path consumes this yet.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub accepting_resize: Option<Satoshi>,
}

impl ChannelRecord {
    /// Record a local error, keeping the first occurrence of each code.
    pub fn push_local_error(&mut self, error: DetailedError) {
        if !self.local_errors.contains(&error) {
            self.local_errors.push(error);
        }
    }
}

/// The full durable data set, held in memory and checkpointed to disk.
#[derive(Clone, Debug, Default, PartialEq)]
pub struct Data {
    /// One record per peer.
    pub channels: HashMap<PublicKey, ChannelRecord>,
    /// In-flight forwards: incoming HTLC -> the outgoing HTLC that must
    /// settle before the incoming side can.
    pub htlc_forwards: HashMap<HtlcIdentifier, HtlcIdentifier>,
    /// Preimages released to us but not yet buried in a cross-signed
    /// state everywhere they matter.
    pub preimages: HashMap<[u8; 32], [u8; 32]>,
}

impl Data {
    /// Look up a cached preimage.
    pub fn preimage_for(&self, payment_hash: &[u8; 32]) -> Option<[u8; 32]> {
        self.preimages.get(payment_hash).copied()
    }

    /// All payment hashes still referenced by any committed state.
    pub fn referenced_hashes(&self) -> std::collections::HashSet<[u8; 32]> {
        let mut hashes = std::collections::HashSet::new();
        for record in self.channels.values() {
            if let Some(lcss) = &record.lcss {
                for htlc in lcss.incoming_htlcs.iter().chain(lcss.outgoing_htlcs.iter()) {
                    hashes.insert(htlc.payment_hash);
                }
            }
        }
        hashes
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use hostchan_core::types::MilliSatoshi;
    use hostchan_core::wire::{error_codes, InitHostedChannel, Signature64};

    fn sample_lcss(hash: [u8; 32]) -> LastCrossSignedState {
        LastCrossSignedState {
            is_host: true,
            refund_script_pubkey: vec![0x00, 0x14],
            init_hosted_channel: InitHostedChannel {
                max_htlc_value_in_flight_msat: MilliSatoshi(100_000_000),
                htlc_minimum_msat: MilliSatoshi(1000),
                max_accepted_htlcs: 12,
                channel_capacity_msat: MilliSatoshi(100_000_000),
                initial_client_balance_msat: MilliSatoshi(0),
                features: vec![],
            },
            block_day: 1,
            local_balance_msat: MilliSatoshi(99_000_000),
            remote_balance_msat: MilliSatoshi(995_000),
            local_updates: 1,
            remote_updates: 0,
            incoming_htlcs: vec![],
            outgoing_htlcs: vec![UpdateAddHtlc {
                channel_id: [0u8; 32],
                id: 1,
                amount_msat: MilliSatoshi(5_000),
                payment_hash: hash,
                cltv_expiry: 800_000,
                onion_routing_packet: vec![1, 2, 3],
            }],
            remote_sig_of_local: Signature64([1u8; 64]),
            local_sig_of_remote: Signature64([2u8; 64]),
        }
    }

    #[test]
    fn test_record_json_roundtrip() {
        let record = ChannelRecord {
            lcss: Some(sample_lcss([9u8; 32])),
            local_errors: vec![DetailedError {
                error: ErrorMessage::new([0u8; 32], error_codes::ERR_MANUAL_SUSPEND, "oops"),
                htlc: None,
                reason: "oops".into(),
            }],
            remote_errors: vec![],
            suspended: false,
            proposed_override: None,
            accepting_resize: Some(Satoshi(200_000)),
        };

        let json = serde_json::to_string_pretty(&record).unwrap();
        let back: ChannelRecord = serde_json::from_str(&json).unwrap();
        assert_eq!(back, record);
    }

    #[test]
    fn test_push_local_error_dedups() {
        let mut record = ChannelRecord::default();
        let err = DetailedError {
            error: ErrorMessage::new([0u8; 32], error_codes::ERR_WRONG_REMOTE_SIG, ""),
            htlc: None,
            reason: "sig".into(),
        };
        record.push_local_error(err.clone());
        record.push_local_error(err);
        assert_eq!(record.local_errors.len(), 1);
    }

    #[test]
    fn test_referenced_hashes() {
        let mut data = Data::default();
        let key = {
            use secp256k1::{Secp256k1, SecretKey};
            let secp = Secp256k1::new();
            PublicKey::from_secret_key(&secp, &SecretKey::from_slice(&[5u8; 32]).unwrap())
        };
        data.channels.insert(
            key,
            ChannelRecord { lcss: Some(sample_lcss([7u8; 32])), ..Default::default() },
        );
        assert!(data.referenced_hashes().contains(&[7u8; 32]));
        assert!(!data.referenced_hashes().contains(&[8u8; 32]));
    }
}
