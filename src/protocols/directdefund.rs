//! Closing a ledger channel and withdrawing its funds.

use super::{
    others, ChannelLookup, ObjectiveId, ObjectiveKind, ObjectiveStatus, ProtocolError, Related,
    SideEffects, WaitingFor,
};
use crate::{
    chain::{ChainEvent, ChainTransaction},
    channel::{Channel, ChannelError, State},
    consensus::ConsensusChannel,
    messages::{Message, ObjectivePayload},
    sig::Signer,
    types::{Destination, TurnNum},
};

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ObjectiveRequest {
    pub channel_id: Destination,
}

impl ObjectiveRequest {
    pub fn id(&self) -> ObjectiveId {
        ObjectiveId::new(ObjectiveKind::DirectDefund, self.channel_id)
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DirectDefund {
    pub status: ObjectiveStatus,
    pub c: Channel,
    final_turn_num: TurnNum,
    transaction_submitted: bool,
}

impl DirectDefund {
    pub fn new<L: ChannelLookup + ?Sized>(
        request: &ObjectiveRequest,
        pre_approve: bool,
        lookup: &L,
    ) -> Result<Self, ProtocolError> {
        let ledger = lookup
            .consensus_channel(&request.channel_id)
            .ok_or(ProtocolError::ConsensusChannelNotFound(request.channel_id))?;
        Self::from_consensus(&ledger, pre_approve)
    }

    /// Build the objective from the final state proposed by the counterparty.
    pub fn from_payload<L: ChannelLookup + ?Sized>(
        payload: &ObjectivePayload,
        lookup: &L,
    ) -> Result<Self, ProtocolError> {
        let ss = payload.decode_signed_state()?;
        let state = ss.state();
        let id = state.channel_id();
        let ledger = lookup
            .consensus_channel(&id)
            .ok_or(ProtocolError::ConsensusChannelNotFound(id))?;
        if !state.is_final || state.turn_num != ledger.consensus_turn_num() + 1 {
            return Err(ProtocolError::UnexpectedState(state.turn_num));
        }
        Self::from_consensus(&ledger, false)
    }

    /// Take the ledger back from the consensus protocol. Only a ledger funding
    /// nothing else can be closed.
    pub fn from_consensus(
        ledger: &ConsensusChannel,
        pre_approve: bool,
    ) -> Result<Self, ProtocolError> {
        if !ledger.funding_targets().is_empty() || !ledger.proposal_queue().is_empty() {
            return Err(ProtocolError::LedgerNotEmpty(ledger.id));
        }
        let ss = ledger.supported_signed_state()?;
        let final_turn_num = ss.state().turn_num + 1;
        let mut c = Channel::from_signed_state(ss, ledger.my_index.index())?;
        c.on_chain.holdings = ledger.on_chain_funding.clone();

        Ok(Self {
            status: if pre_approve {
                ObjectiveStatus::Approved
            } else {
                ObjectiveStatus::Unapproved
            },
            c,
            final_turn_num,
            transaction_submitted: false,
        })
    }

    pub fn id(&self) -> ObjectiveId {
        ObjectiveId::new(ObjectiveKind::DirectDefund, self.c.id)
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
        let state = ss.state();
        if !state.is_final || state.turn_num != self.final_turn_num {
            return Err(ProtocolError::UnexpectedState(state.turn_num));
        }
        let mut updated = self.clone();
        if !updated.c.add_signed_state(ss) {
            tracing::warn!(objective = %self.id(), "ignoring final state");
        }
        Ok(updated)
    }

    pub fn update_with_chain_event(&self, event: &ChainEvent) -> Result<Self, ProtocolError> {
        let mut updated = self.clone();
        match updated.c.update_with_chain_event(event) {
            Ok(()) => Ok(updated),
            Err(ChannelError::StaleChainEvent { .. }) => Ok(self.clone()),
            Err(e) => Err(e.into()),
        }
    }

    fn final_state(&self) -> Result<State, ProtocolError> {
        Ok(self
            .c
            .latest_supported_state()?
            .with_turn(self.final_turn_num, true))
    }

    fn fully_withdrawn(&self) -> bool {
        self.c.on_chain.holdings.is_zero()
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
        let me = signer.address();

        if !updated.c.signed_by_me_at(updated.final_turn_num) {
            let state = updated.final_state()?;
            let ss = updated.c.sign_and_add_state(state, signer)?;
            side_effects.messages_to_send.extend(Message::signed_state(
                &updated.id(),
                &ss,
                me,
                others(updated.c.participants(), me),
            ));
        }
        if !updated.c.complete_at(updated.final_turn_num) {
            return Ok((updated, side_effects, WaitingFor::Finalization));
        }

        if !updated.fully_withdrawn() {
            // A single withdrawal pays out everybody.
            if updated.c.my_index == 0 && !updated.transaction_submitted {
                let signed_state = updated.c.latest_supported_signed_state()?.clone();
                side_effects
                    .transactions_to_submit
                    .push(ChainTransaction::WithdrawAll {
                        channel_id: updated.c.id,
                        signed_state,
                    });
                updated.transaction_submitted = true;
            }
            return Ok((updated, side_effects, WaitingFor::Withdraw));
        }

        updated.status = ObjectiveStatus::Completed;
        Ok((updated, side_effects, WaitingFor::Nothing))
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

#[cfg(test)]
mod tests {
    use super::*;
    use crate::{
        chain::{AllocationUpdatedEvent, ChainPosition},
        channel::{state::tests::signers, SignedState},
        consensus::{tests::ledger_pair, Add, Guarantee, Proposal},
        protocols::tests::signed_states,
        types::Address,
    };

    #[test]
    fn leader_concludes_and_withdraws() {
        let (alice, bob) = signers();
        let (leader, follower) = ledger_pair(&alice, &bob, 5, 5);

        let obj = DirectDefund::from_consensus(&leader, true).unwrap();
        let (obj, se, wf) = obj.crank(&alice).unwrap();
        assert_eq!(wf, WaitingFor::Finalization);
        let sent = signed_states(&se.messages_to_send);
        assert_eq!(sent.len(), 1);
        assert!(sent[0].state().is_final);
        assert_eq!(sent[0].state().turn_num, leader.consensus_turn_num() + 1);

        let bob_obj = DirectDefund::from_consensus(&follower, true).unwrap();
        let payload = &se.messages_to_send[0].objective_payloads[0];
        let bob_obj = bob_obj.update(payload).unwrap();
        let (bob_obj, bob_se, wf) = bob_obj.crank(&bob).unwrap();
        assert_eq!(wf, WaitingFor::Withdraw);
        assert!(bob_se.transactions_to_submit.is_empty());

        let obj = obj
            .update(&bob_se.messages_to_send[0].objective_payloads[0])
            .unwrap();
        let (obj, se, wf) = obj.crank(&alice).unwrap();
        assert_eq!(wf, WaitingFor::Withdraw);
        assert_eq!(se.transactions_to_submit.len(), 1);

        let (obj, se, _) = obj.crank(&alice).unwrap();
        assert!(se.transactions_to_submit.is_empty());

        let withdrawn = ChainEvent::AllocationUpdated(AllocationUpdatedEvent {
            channel_id: obj.c.id,
            position: ChainPosition::new(9, 1),
            asset: Address::default(),
            amount: 0.into(),
        });
        for (o, signer) in [(obj, &alice), (bob_obj, &bob)] {
            let (o, _, wf) = o
                .update_with_chain_event(&withdrawn)
                .unwrap()
                .crank(signer)
                .unwrap();
            assert_eq!(wf, WaitingFor::Nothing);
            assert_eq!(o.status, ObjectiveStatus::Completed);
        }
    }

    #[test]
    fn refuses_ledger_with_guarantees() {
        let (alice, bob) = signers();
        let (mut leader, _) = ledger_pair(&alice, &bob, 5, 5);
        let g = Guarantee::new(
            2.into(),
            Destination([4; 32]),
            alice.address().into(),
            bob.address().into(),
        );
        leader
            .propose(Proposal::add(leader.id, Add::new(g, 1.into())), &alice)
            .unwrap();
        assert!(matches!(
            DirectDefund::from_consensus(&leader, true),
            Err(ProtocolError::LedgerNotEmpty(_))
        ));
    }

    #[test]
    fn rejects_non_final_payload() {
        let (alice, bob) = signers();
        let (leader, _) = ledger_pair(&alice, &bob, 5, 5);
        let obj = DirectDefund::from_consensus(&leader, true).unwrap();

        let state = obj.c.latest_supported_state().unwrap().with_turn(2, false);
        let mut ss = SignedState::new(state);
        ss.sign(&bob).unwrap();
        let payload = ObjectivePayload::signed_state(obj.id(), &ss);
        assert!(matches!(
            obj.update(&payload),
            Err(ProtocolError::UnexpectedState(2))
        ));
    }
}
