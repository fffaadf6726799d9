//! Pure last-cross-signed-state transitions.
//!
//! Given the committed state and the ordered list of uncommitted updates,
//! [`next_local_unsigned_state`] computes the state both sides are about
//! to sign. The function is deliberately permissive: channel-level
//! constraint checking (htlc counts, in-flight caps, fee policy) happens
//! before an update is admitted to the list. The single error reported
//! here is balance underflow, which callers treat as the "next state
//! would go negative" rejection.

use std::fmt;

use crate::types::{HtlcIdentifier, MilliSatoshi};
use crate::wire::{
    LastCrossSignedState, Signature64, UpdateAddHtlc, UpdateFailHtlc, UpdateFailMalformedHtlc,
    UpdateFulfillHtlc,
};

/// Which side originated an uncommitted update.
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum UpdateOrigin {
    /// Originated by us. An `Add` forwarded out of another channel keeps
    /// the identifier of the HTLC it forwards.
    Local {
        /// Incoming HTLC this update forwards, if any.
        forwarded_from: Option<HtlcIdentifier>,
    },
    /// Received from the peer.
    Remote,
}

/// One uncommitted channel update.
#[derive(Clone, Debug, PartialEq)]
#[allow(missing_docs)]
pub enum HtlcUpdate {
    Add(UpdateAddHtlc),
    Fulfill(UpdateFulfillHtlc),
    Fail(UpdateFailHtlc),
    FailMalformed(UpdateFailMalformedHtlc),
}

impl HtlcUpdate {
    /// The id of the HTLC this update refers to.
    pub fn htlc_id(&self) -> u64 {
        match self {
            HtlcUpdate::Add(m) => m.id,
            HtlcUpdate::Fulfill(m) => m.id,
            HtlcUpdate::Fail(m) => m.id,
            HtlcUpdate::FailMalformed(m) => m.id,
        }
    }
}

/// An update queued between two cross-signed states.
#[derive(Clone, Debug, PartialEq)]
pub struct UncommittedUpdate {
    /// Which side originated the update.
    pub origin: UpdateOrigin,
    /// The update itself.
    pub update: HtlcUpdate,
}

impl UncommittedUpdate {
    /// Whether the update was originated locally.
    pub fn is_local(&self) -> bool {
        matches!(self.origin, UpdateOrigin::Local { .. })
    }
}

/// Error from a state transition.
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum StateError {
    /// Applying an Add would drive one side's balance below zero.
    InsufficientBalance,
}

impl fmt::Display for StateError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            StateError::InsufficientBalance => write!(f, "balance would go negative"),
        }
    }
}

impl std::error::Error for StateError {}

fn remove_by_id(list: &mut Vec<UpdateAddHtlc>, id: u64) -> Option<MilliSatoshi> {
    let pos = list.iter().position(|h| h.id == id)?;
    Some(list.remove(pos).amount_msat)
}

/// Compute the next state from the committed one plus the ordered
/// uncommitted updates, with both signature slots zeroed and `block_day`
/// set to the given value.
pub fn next_local_unsigned_state(
    current: &LastCrossSignedState,
    updates: &[UncommittedUpdate],
    block_day: u32,
) -> Result<LastCrossSignedState, StateError> {
    let mut next = current.clone();
    next.block_day = block_day;
    next.remote_sig_of_local = Signature64::ZERO;
    next.local_sig_of_remote = Signature64::ZERO;

    for entry in updates {
        match (&entry.origin, &entry.update) {
            (UpdateOrigin::Local { .. }, HtlcUpdate::Add(add)) => {
                next.local_balance_msat = next
                    .local_balance_msat
                    .checked_sub(add.amount_msat)
                    .ok_or(StateError::InsufficientBalance)?;
                next.outgoing_htlcs.push(add.clone());
                next.local_updates += 1;
            }
            (UpdateOrigin::Remote, HtlcUpdate::Add(add)) => {
                next.remote_balance_msat = next
                    .remote_balance_msat
                    .checked_sub(add.amount_msat)
                    .ok_or(StateError::InsufficientBalance)?;
                next.incoming_htlcs.push(add.clone());
                next.remote_updates += 1;
            }
            (UpdateOrigin::Local { .. }, HtlcUpdate::Fulfill(f)) => {
                if let Some(amount) = remove_by_id(&mut next.incoming_htlcs, f.id) {
                    next.local_balance_msat += amount;
                    next.local_updates += 1;
                }
            }
            (UpdateOrigin::Remote, HtlcUpdate::Fulfill(f)) => {
                if let Some(amount) = remove_by_id(&mut next.outgoing_htlcs, f.id) {
                    next.remote_balance_msat += amount;
                    next.remote_updates += 1;
                }
            }
            (UpdateOrigin::Local { .. }, update) => {
                if let Some(amount) = remove_by_id(&mut next.incoming_htlcs, update.htlc_id()) {
                    next.remote_balance_msat += amount;
                    next.local_updates += 1;
                }
            }
            (UpdateOrigin::Remote, update) => {
                if let Some(amount) = remove_by_id(&mut next.outgoing_htlcs, update.htlc_id()) {
                    next.local_balance_msat += amount;
                    next.remote_updates += 1;
                }
            }
        }
    }

    Ok(next)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::types::{MilliSatoshi, ShortChannelId};
    use crate::wire::InitHostedChannel;
    use rand::rngs::StdRng;
    use rand::{Rng, SeedableRng};

    const CAPACITY: u64 = 100_000_000;

    fn base_state() -> LastCrossSignedState {
        LastCrossSignedState {
            is_host: true,
            refund_script_pubkey: vec![0x00, 0x14],
            init_hosted_channel: InitHostedChannel {
                max_htlc_value_in_flight_msat: MilliSatoshi(CAPACITY),
                htlc_minimum_msat: MilliSatoshi(1000),
                max_accepted_htlcs: 12,
                channel_capacity_msat: MilliSatoshi(CAPACITY),
                initial_client_balance_msat: MilliSatoshi(0),
                features: vec![],
            },
            block_day: 100,
            local_balance_msat: MilliSatoshi(CAPACITY / 2),
            remote_balance_msat: MilliSatoshi(CAPACITY / 2),
            local_updates: 0,
            remote_updates: 0,
            incoming_htlcs: vec![],
            outgoing_htlcs: vec![],
            remote_sig_of_local: Signature64::ZERO,
            local_sig_of_remote: Signature64::ZERO,
        }
    }

    fn add(id: u64, amount: u64) -> UpdateAddHtlc {
        UpdateAddHtlc {
            channel_id: [0u8; 32],
            id,
            amount_msat: MilliSatoshi(amount),
            payment_hash: [id as u8; 32],
            cltv_expiry: 800_000,
            onion_routing_packet: vec![],
        }
    }

    fn local(update: HtlcUpdate) -> UncommittedUpdate {
        UncommittedUpdate { origin: UpdateOrigin::Local { forwarded_from: None }, update }
    }

    fn remote(update: HtlcUpdate) -> UncommittedUpdate {
        UncommittedUpdate { origin: UpdateOrigin::Remote, update }
    }

    fn fulfill(id: u64) -> HtlcUpdate {
        HtlcUpdate::Fulfill(UpdateFulfillHtlc {
            channel_id: [0u8; 32],
            id,
            payment_preimage: [0u8; 32],
        })
    }

    fn fail(id: u64) -> HtlcUpdate {
        HtlcUpdate::Fail(UpdateFailHtlc { channel_id: [0u8; 32], id, reason: vec![1] })
    }

    fn conserved(state: &LastCrossSignedState) -> bool {
        state.is_balanced()
    }

    #[test]
    fn test_local_add_moves_balance_into_flight() {
        let state = base_state();
        let next = next_local_unsigned_state(
            &state,
            &[local(HtlcUpdate::Add(add(1, 10_000)))],
            101,
        )
        .unwrap();

        assert_eq!(next.local_balance_msat, MilliSatoshi(CAPACITY / 2 - 10_000));
        assert_eq!(next.outgoing_htlcs.len(), 1);
        assert_eq!(next.local_updates, 1);
        assert_eq!(next.remote_updates, 0);
        assert_eq!(next.block_day, 101);
        assert!(conserved(&next));
    }

    #[test]
    fn test_remote_fulfill_credits_remote() {
        let state = base_state();
        let updates = vec![
            local(HtlcUpdate::Add(add(1, 10_000))),
            remote(fulfill(1)),
        ];
        let next = next_local_unsigned_state(&state, &updates, 101).unwrap();

        assert_eq!(next.outgoing_htlcs.len(), 0);
        assert_eq!(next.remote_balance_msat, MilliSatoshi(CAPACITY / 2 + 10_000));
        assert_eq!(next.local_updates, 1);
        assert_eq!(next.remote_updates, 1);
        assert!(conserved(&next));
    }

    #[test]
    fn test_local_fail_refunds_remote() {
        let state = base_state();
        let updates = vec![
            remote(HtlcUpdate::Add(add(7, 5_000))),
            local(fail(7)),
        ];
        let next = next_local_unsigned_state(&state, &updates, 101).unwrap();

        assert_eq!(next.incoming_htlcs.len(), 0);
        assert_eq!(next.remote_balance_msat, MilliSatoshi(CAPACITY / 2));
        assert_eq!(next.local_updates, 1);
        assert_eq!(next.remote_updates, 1);
        assert!(conserved(&next));
    }

    #[test]
    fn test_add_underflow_is_reported() {
        let state = base_state();
        let result = next_local_unsigned_state(
            &state,
            &[local(HtlcUpdate::Add(add(1, CAPACITY)))],
            101,
        );
        assert_eq!(result, Err(StateError::InsufficientBalance));
    }

    #[test]
    fn test_unknown_id_resolution_is_skipped() {
        let state = base_state();
        let next = next_local_unsigned_state(&state, &[remote(fulfill(99))], 101).unwrap();
        assert_eq!(next.local_updates, 0);
        assert_eq!(next.remote_updates, 0);
        assert_eq!(&next.incoming_htlcs, &state.incoming_htlcs);
        assert!(conserved(&next));
    }

    #[test]
    fn test_application_preserves_order() {
        // Add then fail of the same htlc nets out; fail before add must not.
        let state = base_state();
        let netted = next_local_unsigned_state(
            &state,
            &[remote(HtlcUpdate::Add(add(1, 2_000))), local(fail(1))],
            101,
        )
        .unwrap();
        assert!(netted.incoming_htlcs.is_empty());

        let skipped = next_local_unsigned_state(
            &state,
            &[local(fail(1)), remote(HtlcUpdate::Add(add(1, 2_000)))],
            101,
        )
        .unwrap();
        assert_eq!(skipped.incoming_htlcs.len(), 1);
    }

    #[test]
    fn test_randomized_sequences_conserve_capacity() {
        let mut rng = StdRng::seed_from_u64(0xc0ffee);

        for _ in 0..200 {
            let state = base_state();
            let mut updates = Vec::new();
            let mut next_local_id = 1u64;
            let mut next_remote_id = 1u64;
            let mut open_outgoing: Vec<u64> = vec![];
            let mut open_incoming: Vec<u64> = vec![];

            for _ in 0..rng.gen_range(1..20) {
                match rng.gen_range(0..4u8) {
                    0 => {
                        updates.push(local(HtlcUpdate::Add(add(
                            next_local_id,
                            rng.gen_range(1..=50_000),
                        ))));
                        open_outgoing.push(next_local_id);
                        next_local_id += 1;
                    }
                    1 => {
                        updates.push(remote(HtlcUpdate::Add(add(
                            next_remote_id,
                            rng.gen_range(1..=50_000),
                        ))));
                        open_incoming.push(next_remote_id);
                        next_remote_id += 1;
                    }
                    2 if !open_incoming.is_empty() => {
                        let id = open_incoming.remove(rng.gen_range(0..open_incoming.len()));
                        updates.push(if rng.gen_bool(0.5) {
                            local(fulfill(id))
                        } else {
                            local(fail(id))
                        });
                    }
                    _ if !open_outgoing.is_empty() => {
                        let id = open_outgoing.remove(rng.gen_range(0..open_outgoing.len()));
                        updates.push(if rng.gen_bool(0.5) {
                            remote(fulfill(id))
                        } else {
                            remote(fail(id))
                        });
                    }
                    _ => {}
                }
            }

            let next = next_local_unsigned_state(&state, &updates, 101).unwrap();
            assert!(conserved(&next), "conservation violated for {:?}", updates);
            // Every generated update references a live htlc, so each one
            // bumps exactly one counter.
            assert_eq!(next.total_updates(), updates.len() as u64);
            assert_eq!(next.incoming_htlcs.len(), open_incoming.len());
            assert_eq!(next.outgoing_htlcs.len(), open_outgoing.len());
        }
    }

    #[test]
    fn test_forwarded_from_is_carried() {
        let incoming = HtlcIdentifier { scid: ShortChannelId(9), id: 4 };
        let entry = UncommittedUpdate {
            origin: UpdateOrigin::Local { forwarded_from: Some(incoming) },
            update: HtlcUpdate::Add(add(1, 1000)),
        };
        assert!(entry.is_local());
        match entry.origin {
            UpdateOrigin::Local { forwarded_from } => {
                assert_eq!(forwarded_from, Some(incoming))
            }
            _ => unreachable!(),
        }
    }
}
