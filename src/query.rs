//! Read-only summaries of channels, as reported to API users.

use crate::{
    channel::{Channel, State, VirtualChannel},
    consensus::ConsensusChannel,
    payments::VoucherInfo,
    types::{Address, Destination, U256},
};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ChannelStatus {
    Proposed,
    Open,
    Closing,
    Complete,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct LedgerBalance {
    pub asset: Address,
    pub leader: Destination,
    pub follower: Destination,
    pub leader_balance: U256,
    pub follower_balance: U256,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct LedgerChannelInfo {
    pub id: Destination,
    pub status: ChannelStatus,
    pub balance: LedgerBalance,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PaymentBalance {
    pub asset: Address,
    pub payer: Address,
    pub payee: Address,
    pub paid_so_far: U256,
    pub remaining: U256,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PaymentChannelInfo {
    pub id: Destination,
    pub status: ChannelStatus,
    pub balance: PaymentBalance,
}

pub fn ledger_info_from_consensus(cc: &ConsensusChannel) -> LedgerChannelInfo {
    let outcome = &cc.consensus_vars().outcome;
    LedgerChannelInfo {
        id: cc.id,
        status: ChannelStatus::Open,
        balance: LedgerBalance {
            asset: outcome.asset,
            leader: outcome.leader.destination,
            follower: outcome.follower.destination,
            leader_balance: outcome.leader.amount,
            follower_balance: outcome.follower.amount,
        },
    }
}

/// Summary of a ledger channel that is still being funded, or is closing.
pub fn ledger_info_from_channel(c: &Channel) -> Option<LedgerChannelInfo> {
    let state = latest_state(c)?;
    let exit = state.outcome.0.first()?;
    let [leader, follower] = exit.allocations.as_slice() else {
        return None;
    };

    let status = if state.is_final {
        if c.on_chain.holdings.is_zero() && c.complete_at(state.turn_num) {
            ChannelStatus::Complete
        } else {
            ChannelStatus::Closing
        }
    } else if c.post_fund_complete() {
        ChannelStatus::Open
    } else {
        ChannelStatus::Proposed
    };

    Some(LedgerChannelInfo {
        id: c.id,
        status,
        balance: LedgerBalance {
            asset: exit.asset,
            leader: leader.destination,
            follower: follower.destination,
            leader_balance: leader.amount,
            follower_balance: follower.amount,
        },
    })
}

/// Summary of a payment channel. Voucher info, where known, is more recent
/// than anything in the channel's states.
pub fn payment_info(v: &VirtualChannel, vouchers: Option<&VoucherInfo>) -> Option<PaymentChannelInfo> {
    let initial = v.initial_outcome().ok()?;
    let c = v.channel();

    let status = if v.final_complete() {
        ChannelStatus::Complete
    } else if v.final_state_received() {
        ChannelStatus::Closing
    } else if c.post_fund_complete() {
        ChannelStatus::Open
    } else {
        ChannelStatus::Proposed
    };

    let starting = v.payer_initial_amount().ok()?;
    let paid_so_far = match (vouchers, v.final_signed_state()) {
        (Some(info), _) => info.paid(),
        (None, Some(state)) => v.paid_in(&state).ok()?,
        (None, None) => U256::zero(),
    };

    Some(PaymentChannelInfo {
        id: v.id(),
        status,
        balance: PaymentBalance {
            asset: initial.asset,
            payer: v.payer(),
            payee: v.payee(),
            paid_so_far,
            remaining: starting.saturating_sub(paid_so_far),
        },
    })
}

fn latest_state(c: &Channel) -> Option<&State> {
    c.latest_supported_state()
        .ok()
        .or_else(|| c.pre_fund_state())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::{
        channel::state::tests::{signers, test_state},
        consensus::tests::ledger_pair,
    };

    #[test]
    fn ledger_summaries() {
        let (alice, bob) = signers();
        let (leader, follower) = ledger_pair(&alice, &bob, 7, 3);
        let info = ledger_info_from_consensus(&leader);
        assert_eq!(info.status, ChannelStatus::Open);
        assert_eq!(info.balance.leader_balance, 7.into());
        assert_eq!(info.balance.follower_balance, 3.into());
        assert_eq!(ledger_info_from_consensus(&follower), info);
    }

    #[test]
    fn proposed_channel_summary() {
        let (alice, bob) = signers();
        let state = test_state(alice.address(), bob.address());
        let c = Channel::new(state, 0).unwrap();
        let info = ledger_info_from_channel(&c).unwrap();
        assert_eq!(info.status, ChannelStatus::Proposed);
        assert_eq!(info.id, c.id);
    }
}
