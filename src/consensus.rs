//! Two party ledger channels kept up to date with the leader/follower
//! protocol.
//!
//! The leader proposes changes to the ledger outcome, signs the resulting
//! state and queues the proposal. The follower optimistically accepts
//! proposals in turn number order and countersigns them one by one. Once the
//! leader receives a countersignature, everything up to that turn number is
//! the new consensus.

mod ledger_outcome;
mod proposal;

#[cfg(test)]
pub(crate) mod tests;

use crate::{
    channel::{Funds, FixedPart, SignedState, State, StateError},
    sig::{self, Signer},
    types::{Address, Destination, Signature, TurnNum},
};

pub use ledger_outcome::{Balance, Guarantee, LedgerOutcome, SignedVars, Vars};
pub use proposal::{Add, Change, Proposal, Remove, SignedProposal};

#[derive(Debug, thiserror::Error)]
pub enum ConsensusError {
    #[error("guarantee for {0} already exists")]
    DuplicateGuarantee(Destination),
    #[error("left deposit exceeds the guarantee amount")]
    InvalidDeposit,
    #[error("insufficient funds")]
    InsufficientFunds,
    #[error("no guarantee for {0}")]
    GuaranteeNotFound(Destination),
    #[error("left amount exceeds the guarantee amount")]
    InvalidAmount,
    #[error("operation requires the leader role")]
    NotLeader,
    #[error("operation requires the follower role")]
    NotFollower,
    #[error("proposal is for ledger {got}, not {expected}")]
    IncorrectChannelId { expected: Destination, got: Destination },
    #[error("expected turn number {expected}, got {got}")]
    InvalidTurnNum { expected: TurnNum, got: TurnNum },
    #[error("countersignature is not from the follower")]
    WrongSigner,
    #[error("proposal is not signed by the leader")]
    InvalidProposalSignature,
    #[error("no queued proposal reaches turn number {0}")]
    ProposalQueueExhausted(TurnNum),
    #[error("no queued proposals")]
    NoProposals,
    #[error("proposal does not match the next queued proposal")]
    NonMatchingProposals,
    #[error("a ledger channel has exactly two participants, got {0}")]
    NotTwoParty(usize),
    #[error("state is not signed by both participants")]
    NotSupported,
    #[error("amount overflows")]
    Overflow,
    #[error("malformed ledger outcome: {0}")]
    MalformedOutcome(&'static str),
    #[error(transparent)]
    State(#[from] StateError),
    #[error(transparent)]
    Sig(#[from] sig::Error),
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Role {
    Leader = 0,
    Follower = 1,
}

impl Role {
    pub fn from_index(idx: usize) -> Option<Self> {
        match idx {
            0 => Some(Role::Leader),
            1 => Some(Role::Follower),
            _ => None,
        }
    }

    pub fn index(self) -> usize {
        self as usize
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ConsensusChannel {
    pub id: Destination,
    pub my_index: Role,
    pub on_chain_funding: Funds,
    fixed: FixedPart,
    current: SignedVars,
    proposal_queue: Vec<SignedProposal>,
}

impl ConsensusChannel {
    /// Build a ledger channel from agreed (fully signed) vars.
    pub fn new(
        fixed: FixedPart,
        my_index: Role,
        current: SignedVars,
        on_chain_funding: Funds,
    ) -> Result<Self, ConsensusError> {
        fixed.validate()?;
        if fixed.participants.len() != 2 {
            return Err(ConsensusError::NotTwoParty(fixed.participants.len()));
        }
        let channel = Self {
            id: fixed.channel_id(),
            my_index,
            on_chain_funding,
            fixed,
            current,
            proposal_queue: Vec::new(),
        };

        let state = channel.state_for(&channel.current.vars);
        for (idx, sig) in channel.current.signatures.iter().enumerate() {
            if state.recover_signer(*sig)? != channel.fixed.participants[idx] {
                return Err(ConsensusError::NotSupported);
            }
        }
        Ok(channel)
    }

    /// Take over a supported state of a directly funded channel.
    pub fn from_signed_state(
        ss: &SignedState,
        my_index: Role,
        on_chain_funding: Funds,
    ) -> Result<Self, ConsensusError> {
        let state = ss.state();
        let (Some(leader_sig), Some(follower_sig)) = (ss.signature(0), ss.signature(1)) else {
            return Err(ConsensusError::NotSupported);
        };
        let current = SignedVars {
            vars: Vars {
                turn_num: state.turn_num,
                outcome: LedgerOutcome::from_exit(&state.outcome)?,
            },
            signatures: [leader_sig, follower_sig],
        };
        Self::new(state.fixed_part(), my_index, current, on_chain_funding)
    }

    pub fn fixed_part(&self) -> &FixedPart {
        &self.fixed
    }

    pub fn participants(&self) -> &[Address] {
        &self.fixed.participants
    }

    pub fn leader(&self) -> Address {
        self.fixed.participants[Role::Leader.index()]
    }

    pub fn follower(&self) -> Address {
        self.fixed.participants[Role::Follower.index()]
    }

    pub fn is_leader(&self) -> bool {
        self.my_index == Role::Leader
    }

    pub fn is_follower(&self) -> bool {
        self.my_index == Role::Follower
    }

    pub fn counterparty(&self) -> Address {
        match self.my_index {
            Role::Leader => self.follower(),
            Role::Follower => self.leader(),
        }
    }

    pub fn consensus_turn_num(&self) -> TurnNum {
        self.current.vars.turn_num
    }

    pub fn consensus_vars(&self) -> &Vars {
        &self.current.vars
    }

    pub fn current(&self) -> &SignedVars {
        &self.current
    }

    pub fn proposal_queue(&self) -> &[SignedProposal] {
        &self.proposal_queue
    }

    /// Guarantee targets funded by the consensus outcome.
    pub fn funding_targets(&self) -> Vec<Destination> {
        self.current.vars.outcome.guarantees.keys().copied().collect()
    }

    pub fn includes(&self, g: &Guarantee) -> bool {
        self.current.vars.outcome.includes(g)
    }

    pub fn includes_target(&self, target: &Destination) -> bool {
        self.current.vars.outcome.includes_target(target)
    }

    /// The ledger state the consensus vars stand for.
    pub fn state_for(&self, vars: &Vars) -> State {
        State {
            participants: self.fixed.participants.clone(),
            channel_nonce: self.fixed.channel_nonce,
            app_definition: self.fixed.app_definition,
            challenge_duration: self.fixed.challenge_duration,
            app_data: Vec::new(),
            outcome: vars.outcome.as_exit(),
            turn_num: vars.turn_num,
            is_final: false,
        }
    }

    /// The consensus state with both signatures.
    pub fn supported_signed_state(&self) -> Result<SignedState, ConsensusError> {
        let mut ss = SignedState::new(self.state_for(&self.current.vars));
        for sig in self.current.signatures {
            ss.add_signature(sig).map_err(|_| ConsensusError::NotSupported)?;
        }
        Ok(ss)
    }

    fn sign(&self, vars: &Vars, signer: &Signer) -> Result<Signature, ConsensusError> {
        Ok(self.state_for(vars).sign(signer)?)
    }

    fn recover(&self, vars: &Vars, sig: Signature) -> Result<Address, ConsensusError> {
        Ok(self.state_for(vars).recover_signer(sig)?)
    }

    fn check_ledger(&self, proposal: &Proposal) -> Result<(), ConsensusError> {
        if proposal.ledger_id != self.id {
            return Err(ConsensusError::IncorrectChannelId {
                expected: self.id,
                got: proposal.ledger_id,
            });
        }
        Ok(())
    }

    /// Vars after applying every queued proposal to the consensus.
    pub fn latest_proposed_vars(&self) -> Result<Vars, ConsensusError> {
        let mut vars = self.current.vars.clone();
        for p in &self.proposal_queue {
            apply(&mut vars, &p.proposal)?;
        }
        Ok(vars)
    }

    /// Whether `g` is in the outcome once the whole queue is applied but not
    /// yet part of the consensus.
    pub fn is_proposed(&self, g: &Guarantee) -> Result<bool, ConsensusError> {
        let latest = self.latest_proposed_vars()?;
        Ok(latest.outcome.includes(g) && !self.includes(g))
    }

    /// Like [Self::is_proposed], but only looks at the next queued proposal.
    pub fn is_proposed_next(&self, g: &Guarantee) -> Result<bool, ConsensusError> {
        let Some(next) = self.proposal_queue.first() else {
            return Ok(false);
        };
        let mut vars = self.current.vars.clone();
        apply(&mut vars, &next.proposal)?;
        if vars.turn_num != next.turn_num {
            return Err(ConsensusError::InvalidTurnNum {
                expected: vars.turn_num,
                got: next.turn_num,
            });
        }
        Ok(vars.outcome.includes(g) && !self.includes(g))
    }

    pub fn has_removal_been_proposed(&self, target: &Destination) -> bool {
        self.proposal_queue
            .iter()
            .any(|p| is_removal_of(&p.proposal, target))
    }

    pub fn has_removal_been_proposed_next(&self, target: &Destination) -> bool {
        self.proposal_queue
            .first()
            .map(|p| is_removal_of(&p.proposal, target))
            .unwrap_or(false)
    }

    /// Leader: apply `proposal` on top of the queue, sign the outcome and
    /// queue the signed proposal.
    pub fn propose(
        &mut self,
        proposal: Proposal,
        signer: &Signer,
    ) -> Result<SignedProposal, ConsensusError> {
        if !self.is_leader() {
            return Err(ConsensusError::NotLeader);
        }
        self.check_ledger(&proposal)?;

        let mut vars = self.latest_proposed_vars()?;
        apply(&mut vars, &proposal)?;
        let signed = SignedProposal {
            signature: self.sign(&vars, signer)?,
            proposal,
            turn_num: vars.turn_num,
        };
        self.append_to_queue(signed.clone())?;
        Ok(signed)
    }

    fn append_to_queue(&mut self, signed: SignedProposal) -> Result<(), ConsensusError> {
        let tail = self
            .proposal_queue
            .last()
            .map(|p| p.turn_num)
            .unwrap_or(self.current.vars.turn_num);
        if signed.turn_num != tail + 1 {
            return Err(ConsensusError::InvalidTurnNum {
                expected: tail + 1,
                got: signed.turn_num,
            });
        }
        self.proposal_queue.push(signed);
        Ok(())
    }

    /// Dispatch an incoming signed proposal according to our role.
    pub fn receive(&mut self, sp: SignedProposal) -> Result<(), ConsensusError> {
        match self.my_index {
            Role::Leader => self.leader_receive(sp),
            Role::Follower => self.follower_receive(sp),
        }
    }

    /// Leader: accept the follower's countersignature, moving the consensus
    /// forward to its turn number.
    pub fn leader_receive(&mut self, countersigned: SignedProposal) -> Result<(), ConsensusError> {
        if !self.is_leader() {
            return Err(ConsensusError::NotLeader);
        }
        self.check_ledger(&countersigned.proposal)?;

        let target = countersigned.turn_num;
        let mut candidate = self.current.vars.clone();
        if target <= candidate.turn_num {
            tracing::debug!(ledger = %self.id, turn = target, "ignoring stale countersignature");
            return Ok(());
        }

        let mut matched = None;
        for (i, ours) in self.proposal_queue.iter().enumerate() {
            apply(&mut candidate, &ours.proposal)?;
            if candidate.turn_num == target {
                matched = Some((i, ours.signature));
                break;
            }
        }
        let (i, our_sig) = matched.ok_or(ConsensusError::ProposalQueueExhausted(target))?;

        if self.recover(&candidate, countersigned.signature)? != self.follower() {
            return Err(ConsensusError::WrongSigner);
        }
        self.current = SignedVars {
            vars: candidate,
            signatures: [our_sig, countersigned.signature],
        };
        self.proposal_queue.drain(..=i);
        Ok(())
    }

    /// Follower: optimistically queue a proposal signed by the leader.
    pub fn follower_receive(&mut self, p: SignedProposal) -> Result<(), ConsensusError> {
        if !self.is_follower() {
            return Err(ConsensusError::NotFollower);
        }
        self.check_ledger(&p.proposal)?;

        let mut vars = self.latest_proposed_vars()?;
        if p.turn_num != vars.turn_num + 1 {
            return Err(ConsensusError::InvalidTurnNum {
                expected: vars.turn_num + 1,
                got: p.turn_num,
            });
        }
        apply(&mut vars, &p.proposal)?;
        if self.recover(&vars, p.signature)? != self.leader() {
            return Err(ConsensusError::InvalidProposalSignature);
        }
        self.proposal_queue.push(p);
        Ok(())
    }

    /// Follower: countersign the oldest queued proposal, which must equal
    /// `expected`, making it the new consensus.
    pub fn sign_next_proposal(
        &mut self,
        expected: &Proposal,
        signer: &Signer,
    ) -> Result<SignedProposal, ConsensusError> {
        if !self.is_follower() {
            return Err(ConsensusError::NotFollower);
        }
        let next = self
            .proposal_queue
            .first()
            .ok_or(ConsensusError::NoProposals)?;
        if next.proposal != *expected {
            return Err(ConsensusError::NonMatchingProposals);
        }

        let mut vars = self.current.vars.clone();
        apply(&mut vars, &next.proposal)?;
        let signature = self.sign(&vars, signer)?;
        let countersigned = SignedProposal {
            signature,
            proposal: next.proposal.clone(),
            turn_num: vars.turn_num,
        };
        self.current = SignedVars {
            vars,
            signatures: [next.signature, signature],
        };
        self.proposal_queue.remove(0);
        Ok(countersigned)
    }
}

fn apply(vars: &mut Vars, proposal: &Proposal) -> Result<(), ConsensusError> {
    match &proposal.change {
        Change::Add(add) => vars.add(add),
        Change::Remove(remove) => vars.remove(remove),
    }
}

fn is_removal_of(p: &Proposal, target: &Destination) -> bool {
    matches!(&p.change, Change::Remove(r) if r.target == *target)
}
