//! # Hostchan Store
//!
//! Durable storage for the hosted-channel provider. The whole data set is
//! a value — channel records keyed by peer, the in-flight forwarding
//! table, and the preimage cache — checkpointed to JSON files:
//!
//! ```text
//! <data_dir>/
//!   channels/<peer_pubkey_hex>.json
//!   htlc-forwards.json
//!   preimages.json
//! ```
//!
//! Every mutation goes through [`ChannelStore::update`], which compares
//! the old and new values and rewrites only the files that changed, each
//! one atomically (temp file + rename). A mutation either lands fully or
//! leaves the prior state intact.

#![deny(unsafe_code)]
#![warn(missing_docs)]

mod error;
mod records;
mod store;

pub use error::StoreError;
pub use records::{ChannelRecord, Data, DetailedError};
pub use store::ChannelStore;
