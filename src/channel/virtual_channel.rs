use super::{Channel, ChannelError, PartIdx, SingleAssetExit, State};
use crate::types::{Address, Destination, TurnNum, U256};

/// A payment channel between a payer (first participant) and a payee (last
/// participant), funded through ledger channels with the intermediaries in
/// between.
///
/// Its outcome holds a single asset with exactly two allocations, the payer's
/// followed by the payee's.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct VirtualChannel {
    channel: Channel,
}

impl VirtualChannel {
    pub const FINAL_TURN_NUM: TurnNum = 2;

    pub fn new(prefund: State, my_index: PartIdx) -> Result<Self, ChannelError> {
        Self::from_channel(Channel::new(prefund, my_index)?)
    }

    pub fn from_channel(channel: Channel) -> Result<Self, ChannelError> {
        let state = channel
            .pre_fund_state()
            .or_else(|| channel.latest_supported_state().ok())
            .ok_or(ChannelError::NoSignedState)?;
        check_outcome(state)?;
        Ok(Self { channel })
    }

    pub fn id(&self) -> Destination {
        self.channel.id
    }

    pub fn channel(&self) -> &Channel {
        &self.channel
    }

    pub fn channel_mut(&mut self) -> &mut Channel {
        &mut self.channel
    }

    pub fn into_channel(self) -> Channel {
        self.channel
    }

    pub fn payer(&self) -> Address {
        self.channel.participants()[0]
    }

    pub fn payee(&self) -> Address {
        let participants = self.channel.participants();
        participants[participants.len() - 1]
    }

    pub fn payee_index(&self) -> PartIdx {
        self.channel.participants().len() - 1
    }

    /// The outcome the channel was funded with.
    pub fn initial_outcome(&self) -> Result<&SingleAssetExit, ChannelError> {
        let state = self
            .channel
            .post_fund_state()
            .or_else(|| self.channel.pre_fund_state())
            .ok_or(ChannelError::NoSignedState)?;
        state
            .outcome
            .0
            .first()
            .ok_or(ChannelError::InvalidVirtualChannel("outcome has no asset"))
    }

    /// Sum of payer and payee allocations.
    pub fn total_amount(&self) -> Result<U256, ChannelError> {
        Ok(self.initial_outcome()?.total_allocated())
    }

    pub fn payer_initial_amount(&self) -> Result<U256, ChannelError> {
        Ok(self.initial_outcome()?.allocations[0].amount)
    }

    /// The final state moving `paid` from payer to payee.
    pub fn final_state(&self, paid: U256) -> Result<State, ChannelError> {
        let post = self
            .channel
            .post_fund_state()
            .ok_or(ChannelError::NoSignedState)?;
        let mut state = post.with_turn(Self::FINAL_TURN_NUM, true);
        let allocations = &mut state.outcome.0[0].allocations;
        let balance = allocations[0].amount;
        if paid > balance {
            return Err(ChannelError::Overpaid { paid, balance });
        }
        allocations[0].amount = balance - paid;
        allocations[1].amount = allocations[1]
            .amount
            .checked_add(paid)
            .ok_or(ChannelError::Overflow { paid })?;
        Ok(state)
    }

    /// What `state` pays the payee on top of the initial outcome.
    pub fn paid_in(&self, state: &State) -> Result<U256, ChannelError> {
        check_outcome(state)?;
        let initial = self.initial_outcome()?.allocations[1].amount;
        Ok(state.outcome.0[0].allocations[1]
            .amount
            .saturating_sub(initial))
    }

    pub fn final_state_received(&self) -> bool {
        self.channel
            .latest_signed_state()
            .map(|ss| ss.state().turn_num == Self::FINAL_TURN_NUM && ss.state().is_final)
            .unwrap_or(false)
    }

    pub fn final_signed_by_me(&self) -> bool {
        self.channel.signed_by_me_at(Self::FINAL_TURN_NUM)
    }

    pub fn final_complete(&self) -> bool {
        self.channel.complete_at(Self::FINAL_TURN_NUM)
    }

    /// The final state as far as it has been received.
    pub fn final_signed_state(&self) -> Option<State> {
        self.channel
            .latest_signed_state()
            .ok()
            .map(|ss| ss.state())
            .filter(|s| s.turn_num == Self::FINAL_TURN_NUM)
            .cloned()
    }
}

fn check_outcome(state: &State) -> Result<(), ChannelError> {
    let [sae] = state.outcome.0.as_slice() else {
        return Err(ChannelError::InvalidVirtualChannel(
            "outcome must hold exactly one asset",
        ));
    };
    let [payer, payee] = sae.allocations.as_slice() else {
        return Err(ChannelError::InvalidVirtualChannel(
            "outcome must have exactly two allocations",
        ));
    };
    let participants = &state.participants;
    if payer.destination != participants[0].into()
        || payee.destination != participants[participants.len() - 1].into()
    {
        return Err(ChannelError::InvalidVirtualChannel(
            "allocations must go to payer and payee",
        ));
    }
    Ok(())
}
