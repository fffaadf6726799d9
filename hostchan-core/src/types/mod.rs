//! Protocol data types shared across the daemon.

mod amount;
pub mod hexser;
mod ids;

pub use amount::{MilliSatoshi, Satoshi};
pub use ids::{
    block_day, hosted_channel_id, hosted_short_channel_id, BlockHeight, HtlcIdentifier,
    ShortChannelId, BLOCKS_PER_DAY,
};
