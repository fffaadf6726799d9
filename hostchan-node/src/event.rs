//! Events consumed by the channel master's single event loop.
//!
//! Everything that can happen — plugin hooks and notifications, custom
//! RPC methods, timer firings and hosted-to-hosted HTLC resolutions —
//! arrives here and is handled to completion in order.

use secp256k1::PublicKey;
use serde_json::Value;

use crate::channel::HtlcResult;
use crate::plugin::HookResponder;

/// One unit of work for the event loop.
#[derive(Debug)]
pub enum Event {
    /// The plugin `init` request from lightningd.
    Init {
        /// `params.configuration` as sent by lightningd.
        configuration: Value,
        /// Responder for the init request.
        responder: HookResponder,
    },
    /// A hook invocation that must be answered.
    Hook {
        /// Hook name (`custommsg`, `htlc_accepted`).
        name: String,
        /// Raw hook payload.
        params: Value,
        /// Responder for the hook.
        responder: HookResponder,
    },
    /// A subscribed notification (no response expected).
    Notification {
        /// Notification name.
        name: String,
        /// Raw notification payload.
        params: Value,
    },
    /// A custom `hc-*` RPC method call.
    Command {
        /// Method name.
        method: String,
        /// Raw call parameters (array or object).
        params: Value,
        /// Responder for the call.
        responder: HookResponder,
    },
    /// The one-minute block poll fired.
    BlockTimer,
    /// The startup grace period ended; replay hosted-to-hosted forwards.
    ReplayForwards,
    /// Three seconds passed since a reconnect state exchange.
    PostReconnect {
        /// Peer that reconnected.
        peer: PublicKey,
    },
    /// A forwarded HTLC settled on its outgoing hosted channel.
    HostedResolution {
        /// Peer whose channel carries the *incoming* HTLC.
        peer: PublicKey,
        /// Incoming HTLC id on that channel.
        htlc_id: u64,
        /// How the outgoing side settled.
        result: HtlcResult,
    },
    /// Re-inspect a payment that was reported as still pending.
    PendingPoll {
        /// Peer whose incoming HTLC waits on the payment.
        peer: PublicKey,
        /// Incoming HTLC id.
        htlc_id: u64,
        /// Payment hash to inspect.
        payment_hash: [u8; 32],
        /// The label the payment was sent under.
        label: String,
        /// Poll attempt counter, bounded.
        attempt: u32,
    },
    /// stdin closed or lightningd asked us to stop.
    Shutdown,
}
