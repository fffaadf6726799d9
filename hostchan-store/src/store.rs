//! The checkpoint store itself.

use std::collections::HashMap;
use std::fs;
use std::io::Write;
use std::path::{Path, PathBuf};

use secp256k1::PublicKey;
use serde::de::DeserializeOwned;
use serde::Serialize;
use tempfile::NamedTempFile;

use hostchan_core::types::HtlcIdentifier;

use crate::error::{StoreError, StoreResult};
use crate::records::{ChannelRecord, Data};

const FORWARDS_FILE: &str = "htlc-forwards.json";
const PREIMAGES_FILE: &str = "preimages.json";

/// Durable store for the full channel data set.
///
/// All access happens on the daemon's event loop; the store itself does
/// no locking.
pub struct ChannelStore {
    channels_dir: PathBuf,
    forwards_path: PathBuf,
    preimages_path: PathBuf,
    data: Data,
}

impl ChannelStore {
    /// Open (creating directories as needed) and load everything under
    /// `data_dir`.
    pub fn open(data_dir: &Path) -> StoreResult<Self> {
        let channels_dir = data_dir.join("channels");
        fs::create_dir_all(&channels_dir).map_err(|source| StoreError::Io {
            path: channels_dir.clone(),
            source,
        })?;

        let mut store = ChannelStore {
            forwards_path: data_dir.join(FORWARDS_FILE),
            preimages_path: data_dir.join(PREIMAGES_FILE),
            channels_dir,
            data: Data::default(),
        };
        store.load()?;
        Ok(store)
    }

    /// The current in-memory data set.
    pub fn data(&self) -> &Data {
        &self.data
    }

    /// Apply a mutation and checkpoint whatever changed by value.
    ///
    /// Channel files are written one by one, each atomically; the two aux
    /// files only when their map changed. On any write error the
    /// in-memory state keeps the *previous* value, matching what disk is
    /// guaranteed to still hold.
    pub fn update<F: FnOnce(&mut Data)>(&mut self, mutate: F) -> StoreResult<()> {
        let mut next = self.data.clone();
        mutate(&mut next);

        for (peer, record) in &next.channels {
            if self.data.channels.get(peer) != Some(record) {
                self.write_json(&self.channel_path(peer), record)?;
            }
        }
        for peer in self.data.channels.keys() {
            if !next.channels.contains_key(peer) {
                let path = self.channel_path(peer);
                fs::remove_file(&path).map_err(|source| StoreError::Io { path, source })?;
            }
        }

        if next.htlc_forwards != self.data.htlc_forwards {
            let mut listed: Vec<(HtlcIdentifier, HtlcIdentifier)> =
                next.htlc_forwards.iter().map(|(k, v)| (*k, *v)).collect();
            listed.sort();
            self.write_json(&self.forwards_path.clone(), &listed)?;
        }

        if next.preimages != self.data.preimages {
            let mut listed: Vec<(String, String)> = next
                .preimages
                .iter()
                .map(|(hash, preimage)| (hex::encode(hash), hex::encode(preimage)))
                .collect();
            listed.sort();
            self.write_json(&self.preimages_path.clone(), &listed)?;
        }

        self.data = next;
        Ok(())
    }

    fn channel_path(&self, peer: &PublicKey) -> PathBuf {
        self.channels_dir.join(format!("{}.json", hex::encode(peer.serialize())))
    }

    fn write_json<T: Serialize>(&self, path: &Path, value: &T) -> StoreResult<()> {
        let parent = path.parent().expect("store paths have a parent");
        let io_err = |source| StoreError::Io { path: path.to_path_buf(), source };

        let mut tmp = NamedTempFile::new_in(parent).map_err(io_err)?;
        let json = serde_json::to_vec_pretty(value).expect("record types serialize");
        tmp.write_all(&json).map_err(io_err)?;
        tmp.as_file().sync_all().map_err(io_err)?;
        tmp.persist(path).map_err(|e| io_err(e.error))?;
        Ok(())
    }

    fn read_json<T: DeserializeOwned>(&self, path: &Path) -> StoreResult<Option<T>> {
        let raw = match fs::read(path) {
            Ok(raw) => raw,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(None),
            Err(source) => return Err(StoreError::Io { path: path.to_path_buf(), source }),
        };
        let value = serde_json::from_slice(&raw).map_err(|e| StoreError::Corrupt {
            path: path.to_path_buf(),
            reason: e.to_string(),
        })?;
        Ok(Some(value))
    }

    fn load(&mut self) -> StoreResult<()> {
        let entries = fs::read_dir(&self.channels_dir).map_err(|source| StoreError::Io {
            path: self.channels_dir.clone(),
            source,
        })?;
        let mut channels = HashMap::new();
        for entry in entries {
            let entry = entry.map_err(|source| StoreError::Io {
                path: self.channels_dir.clone(),
                source,
            })?;
            let name = entry.file_name().to_string_lossy().into_owned();
            let Some(stem) = name.strip_suffix(".json") else { continue };
            if stem.len() != 66 || !stem.chars().all(|c| c.is_ascii_hexdigit()) {
                tracing::debug!(file = %name, "skipping non-channel file");
                continue;
            }
            let raw = hex::decode(stem).map_err(|_| StoreError::BadFileName(name.clone()))?;
            let peer =
                PublicKey::from_slice(&raw).map_err(|_| StoreError::BadFileName(name.clone()))?;
            let record: ChannelRecord = self
                .read_json(&entry.path())?
                .expect("read_dir listed the file");
            channels.insert(peer, record);
        }

        let forwards: Vec<(HtlcIdentifier, HtlcIdentifier)> =
            self.read_json(&self.forwards_path.clone())?.unwrap_or_default();
        let preimages: Vec<(String, String)> =
            self.read_json(&self.preimages_path.clone())?.unwrap_or_default();

        let mut preimage_map = HashMap::new();
        for (hash_hex, preimage_hex) in preimages {
            let decode32 = |s: &str| -> StoreResult<[u8; 32]> {
                hex::decode(s)
                    .ok()
                    .and_then(|v| v.try_into().ok())
                    .ok_or_else(|| StoreError::Corrupt {
                        path: self.preimages_path.clone(),
                        reason: format!("bad hex entry: {}", s),
                    })
            };
            preimage_map.insert(decode32(&hash_hex)?, decode32(&preimage_hex)?);
        }

        self.data = Data {
            channels,
            htlc_forwards: forwards.into_iter().collect(),
            preimages: preimage_map,
        };
        tracing::info!(
            channels = self.data.channels.len(),
            forwards = self.data.htlc_forwards.len(),
            preimages = self.data.preimages.len(),
            "store loaded"
        );
        Ok(())
    }
}
