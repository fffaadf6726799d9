//! Channel and HTLC identifiers.

use std::fmt;
use std::str::FromStr;

use secp256k1::PublicKey;
use serde::{Deserialize, Deserializer, Serialize, Serializer};

use crate::crypto::sha256;

/// Absolute block height.
pub type BlockHeight = u64;

/// Number of blocks per "block day" as used in the LCSS staleness bound.
pub const BLOCKS_PER_DAY: u64 = 144;

/// Coarse time marker carried in every cross-signed state.
pub fn block_day(height: BlockHeight) -> u32 {
    (height / BLOCKS_PER_DAY) as u32
}

/// Compact deterministic channel identifier, displayed CLN-style as
/// `block x txindex x output`.
#[derive(Copy, Clone, Debug, Default, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct ShortChannelId(pub u64);

impl ShortChannelId {
    /// Block height component.
    pub fn block(self) -> u64 {
        self.0 >> 40
    }

    /// Transaction index component.
    pub fn tx_index(self) -> u64 {
        (self.0 >> 16) & 0xff_ffff
    }

    /// Output index component.
    pub fn output(self) -> u64 {
        self.0 & 0xffff
    }
}

impl fmt::Display for ShortChannelId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}x{}x{}", self.block(), self.tx_index(), self.output())
    }
}

impl FromStr for ShortChannelId {
    type Err = &'static str;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let mut parts = s.split('x');
        let block: u64 = parts
            .next()
            .and_then(|p| p.parse().ok())
            .ok_or("bad short channel id")?;
        let tx: u64 = parts
            .next()
            .and_then(|p| p.parse().ok())
            .ok_or("bad short channel id")?;
        let out: u64 = parts
            .next()
            .and_then(|p| p.parse().ok())
            .ok_or("bad short channel id")?;
        if parts.next().is_some() || block > 0xff_ffff || tx > 0xff_ffff || out > 0xffff {
            return Err("bad short channel id");
        }
        Ok(ShortChannelId((block << 40) | (tx << 16) | out))
    }
}

impl Serialize for ShortChannelId {
    fn serialize<S: Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.serialize_str(&self.to_string())
    }
}

impl<'de> Deserialize<'de> for ShortChannelId {
    fn deserialize<D: Deserializer<'de>>(deserializer: D) -> Result<Self, D::Error> {
        let s = String::deserialize(deserializer)?;
        s.parse().map_err(serde::de::Error::custom)
    }
}

/// Identifies one HTLC within one channel.
#[derive(Copy, Clone, Debug, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub struct HtlcIdentifier {
    /// The channel carrying the HTLC.
    pub scid: ShortChannelId,
    /// The HTLC id within that channel.
    pub id: u64,
}

impl fmt::Display for HtlcIdentifier {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}/{}", self.scid, self.id)
    }
}

/// Sort two public keys into lexicographic order of their serializations.
fn sorted(a: &PublicKey, b: &PublicKey) -> ([u8; 33], [u8; 33]) {
    let (sa, sb) = (a.serialize(), b.serialize());
    if sa <= sb {
        (sa, sb)
    } else {
        (sb, sa)
    }
}

/// Deterministic short channel id for a hosted channel between two nodes:
/// the first 8 bytes of `sha256(min_pubkey || max_pubkey)`.
pub fn hosted_short_channel_id(a: &PublicKey, b: &PublicKey) -> ShortChannelId {
    let (lo, hi) = sorted(a, b);
    let mut buf = [0u8; 66];
    buf[..33].copy_from_slice(&lo);
    buf[33..].copy_from_slice(&hi);
    let digest = sha256(&buf);
    ShortChannelId(u64::from_be_bytes(digest[..8].try_into().expect("8 bytes")))
}

/// Stable channel id for a hosted channel: the two 33-byte serializations
/// XORed together, hashed down to the 32-byte BOLT-2 width.
pub fn hosted_channel_id(a: &PublicKey, b: &PublicKey) -> [u8; 32] {
    let (lo, hi) = sorted(a, b);
    let mut xored = [0u8; 33];
    for (i, byte) in xored.iter_mut().enumerate() {
        *byte = lo[i] ^ hi[i];
    }
    sha256(&xored)
}
