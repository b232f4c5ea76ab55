//! Opening a ledger channel funded directly on chain.

use super::{
    others, ChannelLookup, ObjectiveId, ObjectiveKind, ObjectiveStatus, ProtocolError, Related,
    SideEffects, WaitingFor,
};
use crate::{
    chain::{ChainEvent, ChainTransaction},
    channel::{Channel, ChannelError, Exit, FixedPart, Funds, State, PRE_FUND_TURN_NUM},
    consensus::{ConsensusChannel, Role},
    messages::{Message, ObjectivePayload},
    sig::Signer,
    types::Address,
};

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ObjectiveRequest {
    pub counterparty: Address,
    pub challenge_duration: u32,
    pub outcome: Exit,
    pub app_definition: Address,
    pub app_data: Vec<u8>,
    pub nonce: u64,
}

impl ObjectiveRequest {
    pub fn fixed_part(&self, me: Address) -> FixedPart {
        FixedPart {
            participants: vec![me, self.counterparty],
            channel_nonce: self.nonce,
            app_definition: self.app_definition,
            challenge_duration: self.challenge_duration,
        }
    }

    pub fn id(&self, me: Address) -> ObjectiveId {
        ObjectiveId::new(ObjectiveKind::DirectFund, self.fixed_part(me).channel_id())
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DirectFund {
    pub status: ObjectiveStatus,
    pub c: Channel,
    fully_funded_threshold: Funds,
    my_deposit_safety_threshold: Funds,
    my_deposit_target: Funds,
    transaction_submitted: bool,
}

impl DirectFund {
    pub fn new<L: ChannelLookup + ?Sized>(
        request: &ObjectiveRequest,
        pre_approve: bool,
        me: Address,
        lookup: &L,
    ) -> Result<Self, ProtocolError> {
        if lookup.ledger_with(&request.counterparty).is_some() {
            return Err(ProtocolError::LedgerChannelExists(request.counterparty));
        }
        let prefund = State::from_parts(
            request.fixed_part(me),
            crate::channel::VariablePart {
                app_data: request.app_data.clone(),
                outcome: request.outcome.clone(),
                turn_num: PRE_FUND_TURN_NUM,
                is_final: false,
            },
        );
        Self::construct(prefund, pre_approve, me)
    }

    /// Build the objective from the prefund state proposed by a peer.
    pub fn from_payload<L: ChannelLookup + ?Sized>(
        payload: &ObjectivePayload,
        me: Address,
        lookup: &L,
    ) -> Result<Self, ProtocolError> {
        let ss = payload.decode_signed_state()?;
        let state = ss.state();
        if state.turn_num != PRE_FUND_TURN_NUM {
            return Err(ProtocolError::UnexpectedState(state.turn_num));
        }
        for p in others(&state.participants, me) {
            if lookup.ledger_with(&p).is_some() {
                return Err(ProtocolError::LedgerChannelExists(p));
            }
        }
        Self::construct(state.clone(), false, me)
    }

    fn construct(prefund: State, pre_approve: bool, me: Address) -> Result<Self, ProtocolError> {
        let n = prefund.participants.len();
        if n != 2 {
            return Err(ProtocolError::NotTwoParty(n));
        }
        let my_index = prefund
            .participant_index(me)
            .ok_or(ProtocolError::NotAParticipant(me))?;
        let c = Channel::new(prefund.clone(), my_index)?;

        let me = c.my_destination();
        let outcome = &prefund.outcome;
        let safety = outcome.deposit_safety_threshold(me);
        let target = safety.sum(&outcome.total_allocated_for(me));

        Ok(Self {
            status: if pre_approve {
                ObjectiveStatus::Approved
            } else {
                ObjectiveStatus::Unapproved
            },
            c,
            fully_funded_threshold: outcome.total_allocated(),
            my_deposit_safety_threshold: safety,
            my_deposit_target: target,
            transaction_submitted: false,
        })
    }

    pub fn id(&self) -> ObjectiveId {
        ObjectiveId::new(ObjectiveKind::DirectFund, self.c.id)
    }

    pub fn approve(&self) -> Self {
        Self {
            status: ObjectiveStatus::Approved,
            ..self.clone()
        }
    }

    pub fn reject(&self) -> Self {
        Self {
            status: ObjectiveStatus::Rejected,
            ..self.clone()
        }
    }

    pub fn update(&self, payload: &ObjectivePayload) -> Result<Self, ProtocolError> {
        let ss = payload.decode_signed_state()?;
        let mut updated = self.clone();
        if !updated.c.add_signed_state(ss) {
            tracing::warn!(objective = %self.id(), "ignoring stale or foreign signed state");
        }
        Ok(updated)
    }

    pub fn update_with_chain_event(&self, event: &ChainEvent) -> Result<Self, ProtocolError> {
        let mut updated = self.clone();
        match updated.c.update_with_chain_event(event) {
            Ok(()) => Ok(updated),
            Err(ChannelError::StaleChainEvent { .. }) => {
                tracing::debug!(objective = %self.id(), "ignoring stale chain event");
                Ok(self.clone())
            }
            Err(e) => Err(e.into()),
        }
    }

    fn funding_complete(&self) -> bool {
        self.c.on_chain.holdings.covers(&self.fully_funded_threshold)
    }

    fn safe_to_deposit(&self) -> bool {
        self.c
            .on_chain
            .holdings
            .covers(&self.my_deposit_safety_threshold)
    }

    fn amount_to_deposit(&self) -> Funds {
        self.my_deposit_target
            .saturating_sub(&self.c.on_chain.holdings)
    }

    pub fn crank(
        &self,
        signer: &Signer,
    ) -> Result<(Self, SideEffects, WaitingFor), ProtocolError> {
        let mut updated = self.clone();
        let mut side_effects = SideEffects::default();

        if updated.status == ObjectiveStatus::Completed {
            return Ok((updated, side_effects, WaitingFor::Nothing));
        }
        if updated.status != ObjectiveStatus::Approved {
            return Err(ProtocolError::NotApproved);
        }
        let id = updated.id();
        let me = signer.address();

        if !updated.c.pre_fund_signed_by_me() {
            let ss = updated.c.sign_and_add_prefund(signer)?;
            side_effects.messages_to_send.extend(Message::signed_state(
                &id,
                &ss,
                me,
                others(updated.c.participants(), me),
            ));
        }
        if !updated.c.pre_fund_complete() {
            return Ok((updated, side_effects, WaitingFor::CompletePrefund));
        }

        let funding_complete = updated.funding_complete();
        let safe_to_deposit = updated.safe_to_deposit();
        if !funding_complete && !safe_to_deposit {
            return Ok((updated, side_effects, WaitingFor::MyTurnToFund));
        }
        let amount = updated.amount_to_deposit();
        if !funding_complete && !amount.is_zero() && !updated.transaction_submitted {
            side_effects
                .transactions_to_submit
                .push(ChainTransaction::Deposit {
                    channel_id: updated.c.id,
                    amount,
                });
            updated.transaction_submitted = true;
        }
        if !funding_complete {
            return Ok((updated, side_effects, WaitingFor::CompleteFunding));
        }

        if !updated.c.post_fund_signed_by_me() {
            let ss = updated.c.sign_and_add_postfund(signer)?;
            side_effects.messages_to_send.extend(Message::signed_state(
                &id,
                &ss,
                me,
                others(updated.c.participants(), me),
            ));
        }
        if !updated.c.post_fund_complete() {
            return Ok((updated, side_effects, WaitingFor::CompletePostFund));
        }

        updated.status = ObjectiveStatus::Completed;
        Ok((updated, side_effects, WaitingFor::Nothing))
    }

    /// The ledger channel taking over from the funded channel.
    pub fn create_consensus_channel(&self) -> Result<ConsensusChannel, ProtocolError> {
        let ss = self.c.latest_supported_signed_state()?;
        let role = Role::from_index(self.c.my_index)
            .ok_or(ProtocolError::NotTwoParty(self.c.participants().len()))?;
        Ok(ConsensusChannel::from_signed_state(
            ss,
            role,
            self.c.on_chain.holdings.clone(),
        )?)
    }

    pub fn related(&self) -> Vec<Related> {
        vec![Related::Channel(self.c.clone())]
    }

    pub fn rehydrate<L: ChannelLookup + ?Sized>(&mut self, lookup: &L) {
        if let Some(c) = lookup.channel(&self.c.id) {
            self.c = c;
        }
    }
}
