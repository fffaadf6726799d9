//! Serde helpers for hex-encoded byte fields in JSON.
//!
//! The on-disk channel files and the RPC boundary both represent binary
//! fields as lowercase hex strings; these modules plug into
//! `#[serde(with = "...")]` attributes on the wire types.

/// Hex serialization for 32-byte arrays.
pub mod hex32 {
    use serde::{Deserialize, Deserializer, Serializer};

    /// Serialize a 32-byte array as a hex string.
    pub fn serialize<S: Serializer>(bytes: &[u8; 32], serializer: S) -> Result<S::Ok, S::Error> {
        serializer.serialize_str(&hex::encode(bytes))
    }

    /// Deserialize a 32-byte array from a hex string.
    pub fn deserialize<'de, D: Deserializer<'de>>(deserializer: D) -> Result<[u8; 32], D::Error> {
        let s = String::deserialize(deserializer)?;
        let raw = hex::decode(&s).map_err(serde::de::Error::custom)?;
        raw.try_into()
            .map_err(|_| serde::de::Error::custom("expected 32 bytes"))
    }
}

/// Hex serialization for variable-length byte strings.
pub mod hexvec {
    use serde::{Deserialize, Deserializer, Serializer};

    /// Serialize a byte vector as a hex string.
    pub fn serialize<S: Serializer>(bytes: &[u8], serializer: S) -> Result<S::Ok, S::Error> {
        serializer.serialize_str(&hex::encode(bytes))
    }

    /// Deserialize a byte vector from a hex string.
    pub fn deserialize<'de, D: Deserializer<'de>>(deserializer: D) -> Result<Vec<u8>, D::Error> {
        let s = String::deserialize(deserializer)?;
        hex::decode(&s).map_err(serde::de::Error::custom)
    }
}

#[cfg(test)]
mod tests {
    use serde::{Deserialize, Serialize};

    #[derive(Serialize, Deserialize, PartialEq, Debug)]
    struct Wrapper {
        #[serde(with = "super::hex32")]
        hash: [u8; 32],
        #[serde(with = "super::hexvec")]
        blob: Vec<u8>,
    }

    #[test]
    fn test_roundtrip() {
        let w = Wrapper { hash: [0xab; 32], blob: vec![1, 2, 3] };
        let json = serde_json::to_string(&w).unwrap();
        assert!(json.contains(&"ab".repeat(32)));
        assert!(json.contains("010203"));
        let back: Wrapper = serde_json::from_str(&json).unwrap();
        assert_eq!(back, w);
    }
}
