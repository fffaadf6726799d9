//! Daemon configuration.
//!
//! Defaults suit a small host; every key can be overridden by a
//! `config.json` in the data directory.
//!
//! Operator note: fulfills learned from downstream are passed upstream
//! *before* the peer countersigns the matching state. This is the
//! standard hosted-channel tradeoff — the host's claim on its inbound
//! HTLC never depends on the hosted peer's signature.

use std::fs;
use std::path::{Path, PathBuf};

use serde::Deserialize;

use hostchan_core::types::MilliSatoshi;
use hostchan_core::wire::{HostedChannelBranding, InitHostedChannel};

/// Complete daemon configuration.
#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct Config {
    /// Minimum CLTV margin required of forwarded HTLCs.
    pub cltv_expiry_delta: u32,

    /// Base forwarding fee.
    pub fee_base_msat: MilliSatoshi,

    /// Proportional forwarding fee in parts per million.
    pub fee_proportional_millionths: u64,

    /// Cap on the total of in-flight incoming HTLCs per channel.
    pub max_htlc_value_in_flight_msat: MilliSatoshi,

    /// Minimum accepted HTLC amount.
    pub htlc_minimum_msat: MilliSatoshi,

    /// Cap on concurrently accepted HTLCs per channel.
    pub max_accepted_htlcs: u16,

    /// Capacity of newly opened hosted channels.
    pub channel_capacity_msat: MilliSatoshi,

    /// Balance granted to a client at channel creation.
    pub initial_client_balance_msat: MilliSatoshi,

    /// Contact URL advertised in branding replies.
    pub contact_url: Option<String>,

    /// PNG logo advertised in branding replies.
    pub logo_file: Option<PathBuf>,

    /// Brand color as `#rrggbb`.
    pub hex_color: String,

    /// Development mode: more verbose defaults.
    pub is_dev: bool,

    /// Require an access secret in `invoke_hosted_channel`.
    pub require_secret: bool,

    /// Always-valid access secrets (hex strings).
    pub permanent_secrets: Vec<String>,

    /// Accepted for compatibility; no block scanner consumes it.
    pub disable_preimage_checking: bool,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            cltv_expiry_delta: 143,
            fee_base_msat: MilliSatoshi(1000),
            fee_proportional_millionths: 1000,
            max_htlc_value_in_flight_msat: MilliSatoshi(100_000_000),
            htlc_minimum_msat: MilliSatoshi(1000),
            max_accepted_htlcs: 12,
            channel_capacity_msat: MilliSatoshi(100_000_000),
            initial_client_balance_msat: MilliSatoshi(0),
            contact_url: None,
            logo_file: None,
            hex_color: "#ffffff".to_string(),
            is_dev: true,
            require_secret: false,
            permanent_secrets: Vec::new(),
            disable_preimage_checking: true,
        }
    }
}

impl Config {
    /// Load configuration from `<data_dir>/config.json`, falling back to
    /// defaults when the file is absent.
    pub fn load(data_dir: &Path) -> anyhow::Result<Self> {
        let path = data_dir.join("config.json");
        match fs::read(&path) {
            Ok(raw) => {
                let config: Config = serde_json::from_slice(&raw)
                    .map_err(|e| anyhow::anyhow!("bad config {}: {}", path.display(), e))?;
                Ok(config)
            }
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(Config::default()),
            Err(e) => Err(anyhow::anyhow!("reading {}: {}", path.display(), e)),
        }
    }

    /// The static channel parameters offered to clients.
    pub fn init_hosted_channel(&self) -> InitHostedChannel {
        InitHostedChannel {
            max_htlc_value_in_flight_msat: self.max_htlc_value_in_flight_msat,
            htlc_minimum_msat: self.htlc_minimum_msat,
            max_accepted_htlcs: self.max_accepted_htlcs,
            channel_capacity_msat: self.channel_capacity_msat,
            initial_client_balance_msat: self.initial_client_balance_msat,
            features: vec![],
        }
    }

    /// Parse `hex_color` into RGB bytes; white on parse failure.
    pub fn rgb_color(&self) -> [u8; 3] {
        let stripped = self.hex_color.strip_prefix('#').unwrap_or(&self.hex_color);
        match hex::decode(stripped).ok().and_then(|v| <[u8; 3]>::try_from(v).ok()) {
            Some(rgb) => rgb,
            None => [0xff, 0xff, 0xff],
        }
    }

    /// Branding reply, present when a contact URL is configured.
    pub fn load_branding(&self) -> Option<HostedChannelBranding> {
        let contact_info = self.contact_url.clone()?;
        let png_icon = self
            .logo_file
            .as_ref()
            .and_then(|path| match fs::read(path) {
                Ok(bytes) => Some(bytes),
                Err(e) => {
                    tracing::warn!(path = %path.display(), error = %e, "cannot read logo file");
                    None
                }
            });
        Some(HostedChannelBranding { rgb_color: self.rgb_color(), png_icon, contact_info })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_defaults() {
        let config = Config::default();
        assert_eq!(config.cltv_expiry_delta, 143);
        assert_eq!(config.fee_base_msat, MilliSatoshi(1000));
        assert_eq!(config.fee_proportional_millionths, 1000);
        assert_eq!(config.max_accepted_htlcs, 12);
        assert_eq!(config.channel_capacity_msat, MilliSatoshi(100_000_000));
        assert!(!config.require_secret);
        assert!(config.load_branding().is_none());
    }

    #[test]
    fn test_partial_override() {
        let dir = tempfile::tempdir().unwrap();
        fs::write(
            dir.path().join("config.json"),
            br#"{"channel_capacity_msat": 5000000, "require_secret": true}"#,
        )
        .unwrap();

        let config = Config::load(dir.path()).unwrap();
        assert_eq!(config.channel_capacity_msat, MilliSatoshi(5_000_000));
        assert!(config.require_secret);
        // untouched keys keep their defaults
        assert_eq!(config.max_accepted_htlcs, 12);
    }

    #[test]
    fn test_rgb_color() {
        let mut config = Config::default();
        assert_eq!(config.rgb_color(), [0xff, 0xff, 0xff]);
        config.hex_color = "#102030".into();
        assert_eq!(config.rgb_color(), [0x10, 0x20, 0x30]);
        config.hex_color = "nonsense".into();
        assert_eq!(config.rgb_color(), [0xff, 0xff, 0xff]);
    }
}
