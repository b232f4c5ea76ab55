//! Directly tracked channels: the history of signed states per turn number
//! and what the chain knows about the channel.

pub mod outcome;
mod signed;
pub mod state;
mod virtual_channel;

use std::collections::{BTreeMap, BTreeSet};

use crate::{
    chain::{ChainEvent, ChainPosition},
    sig::Signer,
    types::{Address, Destination, Hash, TurnNum, U256},
};

pub use outcome::{Allocation, AllocationType, Exit, Funds, GuaranteeMetadata, SingleAssetExit};
pub use signed::{SignedState, SignedStateError};
pub use state::{FixedPart, State, StateError, VariablePart};
pub use virtual_channel::VirtualChannel;

/// Index of a participant in the channel.
///
/// `0` is the participant who proposed the channel.
pub type PartIdx = usize;

pub const PRE_FUND_TURN_NUM: TurnNum = 0;
pub const POST_FUND_TURN_NUM: TurnNum = 1;

#[derive(Debug, thiserror::Error)]
pub enum ChannelError {
    #[error(transparent)]
    State(#[from] StateError),
    #[error(transparent)]
    SignedState(#[from] SignedStateError),
    #[error("participant index {0} out of range")]
    InvalidIndex(PartIdx),
    #[error("a new channel must start at turn 0, got {0}")]
    NotPrefund(TurnNum),
    #[error("no state has been signed by every participant yet")]
    NoSupportedState,
    #[error("no signed state in channel")]
    NoSignedState,
    #[error("state for channel {got} cannot go into channel {expected}")]
    WrongChannel { expected: Destination, got: Destination },
    #[error("state at turn {0} is older than the latest supported state")]
    StaleState(TurnNum),
    #[error("invalid virtual channel: {0}")]
    InvalidVirtualChannel(&'static str),
    #[error("payment of {paid} exceeds the payer's balance {balance}")]
    Overpaid { paid: U256, balance: U256 },
    #[error("payment of {paid} overflows the payee's balance")]
    Overflow { paid: U256 },
    #[error("chain event at {event:?} is not newer than last update {last:?}")]
    StaleChainEvent {
        event: ChainPosition,
        last: ChainPosition,
    },
}

/// What we have learned about the channel from the chain.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct OnChainData {
    pub holdings: Funds,
    pub outcome: Exit,
    pub state_hash: Hash,
    pub is_finalized: bool,
    pub last_update: Option<ChainPosition>,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Channel {
    pub id: Destination,
    pub my_index: PartIdx,
    pub on_chain: OnChainData,
    fixed: FixedPart,
    signed_states: BTreeMap<TurnNum, SignedState>,
    latest_supported: Option<TurnNum>,
}

impl Channel {
    /// Start tracking a channel from its (unsigned) prefund state.
    ///
    /// Stores unsigned prefund and postfund records.
    pub fn new(prefund: State, my_index: PartIdx) -> Result<Self, ChannelError> {
        prefund.validate()?;
        if prefund.turn_num != PRE_FUND_TURN_NUM {
            return Err(ChannelError::NotPrefund(prefund.turn_num));
        }
        if my_index >= prefund.participants.len() {
            return Err(ChannelError::InvalidIndex(my_index));
        }

        let postfund = prefund.with_turn(POST_FUND_TURN_NUM, false);
        let mut signed_states = BTreeMap::new();
        signed_states.insert(PRE_FUND_TURN_NUM, SignedState::new(prefund.clone()));
        signed_states.insert(POST_FUND_TURN_NUM, SignedState::new(postfund));

        Ok(Self {
            id: prefund.channel_id(),
            my_index,
            on_chain: OnChainData::default(),
            fixed: prefund.fixed_part(),
            signed_states,
            latest_supported: None,
        })
    }

    /// Start tracking a channel from an arbitrary signed state.
    pub fn from_signed_state(ss: SignedState, my_index: PartIdx) -> Result<Self, ChannelError> {
        let state = ss.state();
        state.validate()?;
        if my_index >= state.participants.len() {
            return Err(ChannelError::InvalidIndex(my_index));
        }
        let turn = state.turn_num;
        let latest_supported = ss.has_all_signatures().then_some(turn);

        Ok(Self {
            id: state.channel_id(),
            my_index,
            on_chain: OnChainData::default(),
            fixed: state.fixed_part(),
            signed_states: BTreeMap::from([(turn, ss)]),
            latest_supported,
        })
    }

    pub fn fixed_part(&self) -> &FixedPart {
        &self.fixed
    }

    pub fn participants(&self) -> &[Address] {
        &self.fixed.participants
    }

    pub fn my_address(&self) -> Address {
        self.fixed.participants[self.my_index]
    }

    pub fn my_destination(&self) -> Destination {
        self.my_address().into()
    }

    pub fn latest_supported_turn_num(&self) -> Option<TurnNum> {
        self.latest_supported
    }

    fn signed_state_for(&self, turn: TurnNum) -> Option<&SignedState> {
        self.signed_states.get(&turn)
    }

    pub fn pre_fund_state(&self) -> Option<&State> {
        self.signed_state_for(PRE_FUND_TURN_NUM).map(SignedState::state)
    }

    pub fn post_fund_state(&self) -> Option<&State> {
        self.signed_state_for(POST_FUND_TURN_NUM).map(SignedState::state)
    }

    pub fn signed_post_fund_state(&self) -> Option<&SignedState> {
        self.signed_state_for(POST_FUND_TURN_NUM)
    }

    fn signed_by_me(&self, turn: TurnNum) -> bool {
        self.signed_state_for(turn)
            .map(|ss| ss.has_signature_for(self.my_index))
            .unwrap_or(false)
    }

    fn complete(&self, turn: TurnNum) -> bool {
        self.signed_state_for(turn)
            .map(SignedState::has_all_signatures)
            .unwrap_or(false)
    }

    pub fn pre_fund_signed_by_me(&self) -> bool {
        self.signed_by_me(PRE_FUND_TURN_NUM)
    }

    pub fn post_fund_signed_by_me(&self) -> bool {
        self.signed_by_me(POST_FUND_TURN_NUM)
    }

    pub fn pre_fund_complete(&self) -> bool {
        self.complete(PRE_FUND_TURN_NUM)
    }

    pub fn post_fund_complete(&self) -> bool {
        self.complete(POST_FUND_TURN_NUM)
    }

    pub fn signed_by_me_at(&self, turn: TurnNum) -> bool {
        self.signed_by_me(turn)
    }

    pub fn complete_at(&self, turn: TurnNum) -> bool {
        self.complete(turn)
    }

    pub fn latest_supported_signed_state(&self) -> Result<&SignedState, ChannelError> {
        self.latest_supported
            .and_then(|turn| self.signed_state_for(turn))
            .ok_or(ChannelError::NoSupportedState)
    }

    pub fn latest_supported_state(&self) -> Result<&State, ChannelError> {
        self.latest_supported_signed_state().map(SignedState::state)
    }

    /// The signed state with the highest turn number carrying at least one
    /// signature.
    pub fn latest_signed_state(&self) -> Result<&SignedState, ChannelError> {
        self.signed_states
            .values()
            .rev()
            .find(|ss| ss.signature_count() > 0)
            .ok_or(ChannelError::NoSignedState)
    }

    /// Funds allocated by the latest supported state, or by the prefund state
    /// if nothing is supported yet.
    pub fn total(&self) -> Funds {
        self.latest_supported_state()
            .ok()
            .or_else(|| self.pre_fund_state())
            .map(|s| s.outcome.total_allocated())
            .unwrap_or_default()
    }

    /// Whether `allocations` are paid out by `funding`, see [Exit::affords].
    ///
    /// Uses the latest supported state, falling back to the prefund state.
    pub fn affords(&self, allocations: &BTreeMap<Address, Allocation>, funding: &Funds) -> bool {
        self.latest_supported_state()
            .ok()
            .or_else(|| self.pre_fund_state())
            .map(|s| s.outcome.affords(allocations, funding))
            .unwrap_or(false)
    }

    /// Add a signed state, returns whether it was stored.
    ///
    /// States for other channels and states older than the latest supported
    /// state are ignored. The channel is left untouched unless `true` is
    /// returned.
    pub fn add_signed_state(&mut self, ss: SignedState) -> bool {
        self.try_add_signed_state(ss).is_ok()
    }

    fn try_add_signed_state(&mut self, ss: SignedState) -> Result<(), ChannelError> {
        let state = ss.state();
        let id = state.channel_id();
        if id != self.id {
            return Err(ChannelError::WrongChannel {
                expected: self.id,
                got: id,
            });
        }
        let turn = state.turn_num;
        if let Some(latest) = self.latest_supported {
            if turn < latest {
                return Err(ChannelError::StaleState(turn));
            }
        }

        let record = match self.signed_states.get(&turn) {
            Some(existing) => {
                let mut merged = existing.clone();
                merged.merge(&ss)?;
                merged
            }
            None => ss,
        };
        let supported = record.has_all_signatures();
        self.signed_states.insert(turn, record);
        if supported && self.latest_supported.map_or(true, |latest| turn > latest) {
            self.latest_supported = Some(turn);
        }
        Ok(())
    }

    pub fn add_state_with_signature(&mut self, state: State, sig: crate::types::Signature) -> bool {
        let mut ss = SignedState::new(state);
        if ss.add_signature(sig).is_err() {
            return false;
        }
        self.add_signed_state(ss)
    }

    /// Sign `state` and store it, returns the stored record including every
    /// signature collected so far.
    pub fn sign_and_add_state(
        &mut self,
        state: State,
        signer: &Signer,
    ) -> Result<SignedState, ChannelError> {
        let mut ss = SignedState::new(state);
        ss.sign(signer)?;
        let turn = ss.state().turn_num;
        self.try_add_signed_state(ss)?;
        self.signed_state_for(turn)
            .cloned()
            .ok_or(ChannelError::NoSignedState)
    }

    pub fn sign_and_add_prefund(&mut self, signer: &Signer) -> Result<SignedState, ChannelError> {
        let state = self
            .pre_fund_state()
            .cloned()
            .ok_or(ChannelError::NoSignedState)?;
        self.sign_and_add_state(state, signer)
    }

    pub fn sign_and_add_postfund(&mut self, signer: &Signer) -> Result<SignedState, ChannelError> {
        let state = self
            .post_fund_state()
            .cloned()
            .ok_or(ChannelError::NoSignedState)?;
        self.sign_and_add_state(state, signer)
    }

    /// Apply an event observed on chain.
    ///
    /// Events must arrive in chain order; anything at or before the last
    /// processed position is rejected.
    pub fn update_with_chain_event(&mut self, event: &ChainEvent) -> Result<(), ChannelError> {
        let position = event.position();
        if let Some(last) = self.on_chain.last_update {
            if position <= last {
                return Err(ChannelError::StaleChainEvent {
                    event: position,
                    last,
                });
            }
        }

        match event {
            ChainEvent::Deposited(e) => {
                self.on_chain.holdings.set(e.asset, e.now_held);
            }
            ChainEvent::AllocationUpdated(e) => {
                self.on_chain.holdings.set(e.asset, e.amount);
            }
            ChainEvent::Concluded(_) => {
                self.on_chain.is_finalized = true;
            }
            ChainEvent::ChallengeRegistered(e) => {
                let state = State::from_parts(self.fixed.clone(), e.candidate.clone());
                self.on_chain.state_hash = state.hash();
                self.on_chain.outcome = state.outcome.clone();
                let mut ss = SignedState::new(state);
                for sig in &e.signatures {
                    if let Err(e) = ss.add_signature(*sig) {
                        tracing::debug!(error = %e, "skipping signature from challenge event");
                    }
                }
                self.add_signed_state(ss);
            }
        }
        self.on_chain.last_update = Some(position);
        Ok(())
    }

    /// Turn numbers of all stored records.
    pub fn turn_nums(&self) -> BTreeSet<TurnNum> {
        self.signed_states.keys().copied().collect()
    }
}
