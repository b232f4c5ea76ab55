//! Closing a virtual channel off chain and returning its guarantees to the
//! ledger channels that funded it.

use super::{
    others, virtualfund::receive_on_leg, ChannelLookup, ObjectiveId, ObjectiveKind,
    ObjectiveStatus, ProtocolError, Related, SideEffects, WaitingFor,
};
use crate::{
    channel::{PartIdx, State, VirtualChannel},
    consensus::{ConsensusChannel, Proposal, Remove, SignedProposal},
    messages::{Message, ObjectivePayload, PayloadType},
    sig::Signer,
    types::{Address, Destination, U256},
};

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ObjectiveRequest {
    pub channel_id: Destination,
}

impl ObjectiveRequest {
    pub fn id(&self) -> ObjectiveId {
        ObjectiveId::new(ObjectiveKind::VirtualDefund, self.channel_id)
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct VirtualDefund {
    pub status: ObjectiveStatus,
    pub v: VirtualChannel,
    pub my_role: PartIdx,
    pub to_my_left: Option<ConsensusChannel>,
    pub to_my_right: Option<ConsensusChannel>,
    /// Voucher total known to the payer or payee, zero for intermediaries.
    paid: U256,
    final_requested: bool,
}

impl VirtualDefund {
    pub fn new<L: ChannelLookup + ?Sized>(
        request: &ObjectiveRequest,
        pre_approve: bool,
        me: Address,
        paid: U256,
        lookup: &L,
    ) -> Result<Self, ProtocolError> {
        Self::construct(request.channel_id, pre_approve, me, paid, lookup)
    }

    /// Build the objective from a final state or a final state request.
    pub fn from_payload<L: ChannelLookup + ?Sized>(
        payload: &ObjectivePayload,
        me: Address,
        paid: U256,
        lookup: &L,
    ) -> Result<Self, ProtocolError> {
        let channel_id = match payload.payload_type {
            PayloadType::SignedState => payload.decode_signed_state()?.state().channel_id(),
            PayloadType::RequestFinalState => payload.decode_channel_id()?,
        };
        if channel_id != payload.objective_id.channel_id() {
            return Err(ProtocolError::ChannelNotFound(channel_id));
        }
        Self::construct(channel_id, false, me, paid, lookup)
    }

    fn construct<L: ChannelLookup + ?Sized>(
        channel_id: Destination,
        pre_approve: bool,
        me: Address,
        paid: U256,
        lookup: &L,
    ) -> Result<Self, ProtocolError> {
        let c = lookup
            .channel(&channel_id)
            .ok_or(ProtocolError::ChannelNotFound(channel_id))?;
        let v = VirtualChannel::from_channel(c)?;
        if !v.channel().post_fund_complete() {
            return Err(ProtocolError::NotFunded(channel_id));
        }
        let participants = v.channel().participants().to_vec();
        let my_role = v.channel().my_index;
        if participants.get(my_role) != Some(&me) {
            return Err(ProtocolError::NotAParticipant(me));
        }

        let ledger = |peer: Address| {
            lookup
                .ledger_with(&peer)
                .ok_or(ProtocolError::NoLedgerChannel(peer))
        };
        let to_my_left = match my_role {
            0 => None,
            i => Some(ledger(participants[i - 1])?),
        };
        let to_my_right = match participants.get(my_role + 1) {
            Some(&peer) => Some(ledger(peer)?),
            None => None,
        };

        Ok(Self {
            status: if pre_approve {
                ObjectiveStatus::Approved
            } else {
                ObjectiveStatus::Unapproved
            },
            v,
            my_role,
            to_my_left,
            to_my_right,
            paid,
            final_requested: false,
        })
    }

    pub fn id(&self) -> ObjectiveId {
        ObjectiveId::new(ObjectiveKind::VirtualDefund, self.v.id())
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

    fn is_payer(&self) -> bool {
        self.my_role == 0
    }

    fn is_payee(&self) -> bool {
        self.my_role == self.v.payee_index()
    }

    /// Merge a final state. A request for the final state carries nothing
    /// to merge; the payer answers it on the next crank.
    pub fn update(&self, payload: &ObjectivePayload) -> Result<Self, ProtocolError> {
        if payload.payload_type == PayloadType::RequestFinalState {
            return Ok(self.clone());
        }
        let ss = payload.decode_signed_state()?;
        let state = ss.state();
        if !state.is_final || state.turn_num != VirtualChannel::FINAL_TURN_NUM {
            return Err(ProtocolError::UnexpectedState(state.turn_num));
        }
        let mut updated = self.clone();
        if !updated.v.channel_mut().add_signed_state(ss) {
            tracing::warn!(objective = %self.id(), "ignoring final state");
        }
        Ok(updated)
    }

    pub fn receive_proposal(&self, sp: SignedProposal) -> Result<Self, ProtocolError> {
        let ledger_id = sp.proposal.ledger_id;
        let mut updated = self.clone();
        let ledger = [updated.to_my_left.as_mut(), updated.to_my_right.as_mut()]
            .into_iter()
            .flatten()
            .find(|l| l.id == ledger_id)
            .ok_or(ProtocolError::UnknownLedger(ledger_id))?;
        receive_on_leg(ledger, sp)?;
        Ok(updated)
    }

    fn defunded(&self, ledger: Option<&ConsensusChannel>) -> bool {
        ledger.map_or(true, |l| !l.includes_target(&self.v.id()))
    }

    /// The final outcome's payer amount goes to the left of every leg.
    fn removal(&self, ledger: &ConsensusChannel, final_state: &State) -> Proposal {
        let left_amount = final_state.outcome.0[0].allocations[0].amount;
        Proposal::remove(ledger.id, Remove::new(self.v.id(), left_amount))
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

        if !updated.v.final_state_received() {
            if updated.is_payer() {
                let state = updated.v.final_state(updated.paid)?;
                let ss = updated.v.channel_mut().sign_and_add_state(state, signer)?;
                side_effects.messages_to_send.extend(Message::signed_state(
                    &id,
                    &ss,
                    me,
                    others(updated.v.channel().participants(), me),
                ));
            } else {
                if !updated.final_requested {
                    side_effects.messages_to_send.push(Message::request_final_state(
                        &id,
                        updated.v.id(),
                        me,
                        updated.v.payer(),
                    ));
                    updated.final_requested = true;
                }
                return Ok((updated, side_effects, WaitingFor::FinalStateFromAlice));
            }
        }

        let final_state = updated
            .v
            .final_signed_state()
            .ok_or(ProtocolError::UnexpectedState(VirtualChannel::FINAL_TURN_NUM))?;
        if !updated.v.final_signed_by_me() {
            if updated.is_payee() {
                let got = updated.v.paid_in(&final_state)?;
                if got < updated.paid {
                    return Err(ProtocolError::InsufficientFinalPayment {
                        expected: updated.paid,
                        got,
                    });
                }
            }
            let ss = updated
                .v
                .channel_mut()
                .sign_and_add_state(final_state.clone(), signer)?;
            side_effects.messages_to_send.extend(Message::signed_state(
                &id,
                &ss,
                me,
                others(updated.v.channel().participants(), me),
            ));
        }
        if !updated.v.final_complete() {
            return Ok((updated, side_effects, WaitingFor::SupportedFinalState));
        }

        let left_removal = updated
            .to_my_left
            .as_ref()
            .map(|l| updated.removal(l, &final_state));
        let right_removal = updated
            .to_my_right
            .as_ref()
            .map(|l| updated.removal(l, &final_state));
        let target = updated.v.id();
        for (ledger, removal) in [
            (updated.to_my_left.as_mut(), left_removal),
            (updated.to_my_right.as_mut(), right_removal),
        ] {
            if let (Some(ledger), Some(removal)) = (ledger, removal) {
                update_ledger_with_removal(ledger, target, removal, signer, &mut side_effects)?;
            }
        }

        if !updated.defunded(updated.to_my_left.as_ref()) {
            return Ok((updated, side_effects, WaitingFor::DefundingOnMyLeft));
        }
        if !updated.defunded(updated.to_my_right.as_ref()) {
            return Ok((updated, side_effects, WaitingFor::DefundingOnMyRight));
        }

        updated.status = ObjectiveStatus::Completed;
        Ok((updated, side_effects, WaitingFor::Nothing))
    }

    pub fn related(&self) -> Vec<Related> {
        let mut related = vec![Related::Channel(self.v.channel().clone())];
        related.extend(
            [self.to_my_left.as_ref(), self.to_my_right.as_ref()]
                .into_iter()
                .flatten()
                .map(|l| Related::Consensus(l.clone())),
        );
        related
    }

    pub fn rehydrate<L: ChannelLookup + ?Sized>(&mut self, lookup: &L) {
        if let Some(c) = lookup.channel(&self.v.id()) {
            if let Ok(v) = VirtualChannel::from_channel(c) {
                self.v = v;
            }
        }
        for ledger in [self.to_my_left.as_mut(), self.to_my_right.as_mut()]
            .into_iter()
            .flatten()
        {
            if let Some(stored) = lookup.consensus_channel(&ledger.id) {
                *ledger = stored;
            }
        }
    }
}

fn update_ledger_with_removal(
    ledger: &mut ConsensusChannel,
    target: Destination,
    removal: Proposal,
    signer: &Signer,
    side_effects: &mut SideEffects,
) -> Result<(), ProtocolError> {
    if !ledger.includes_target(&target) {
        return Ok(());
    }
    let me = signer.address();
    if ledger.is_leader() {
        if !ledger.has_removal_been_proposed(&target) {
            let sp = ledger.propose(removal, signer)?;
            side_effects
                .messages_to_send
                .push(Message::signed_proposal(me, ledger.follower(), sp));
        }
    } else if ledger.has_removal_been_proposed_next(&target) {
        let sp = ledger.sign_next_proposal(&removal, signer)?;
        side_effects
            .messages_to_send
            .push(Message::signed_proposal(me, ledger.leader(), sp));
        if let Some(next) = ledger.proposal_queue().first() {
            side_effects
                .proposals_to_process
                .push(next.proposal.clone());
        }
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use std::collections::HashMap;

    use super::*;
    use crate::{
        channel::{Channel, SignedState, VariablePart},
        consensus::{Add, Guarantee},
        protocols::{tests::Lookup, virtualfund::tests::Parties},
    };

    /// A funded virtual channel between Alice and Bob via Irene, as each of
    /// them stores it, together with their ledgers already holding the
    /// guarantees.
    fn funded(p: &Parties) -> [Lookup; 3] {
        let request = p.request();
        let (mut a, mut i, mut b) = p.lookups();
        let prefund = State::from_parts(
            request.fixed_part(p.alice.address()),
            VariablePart {
                app_data: Vec::new(),
                outcome: request.outcome.clone(),
                turn_num: 0,
                is_final: false,
            },
        );
        let id = prefund.channel_id();
        let signers = [&p.alice, &p.irene, &p.bob];

        for (idx, lookup) in [&mut a, &mut i, &mut b].into_iter().enumerate() {
            let mut c = Channel::new(prefund.clone(), idx).unwrap();
            for turn in [0, 1] {
                let mut ss = SignedState::new(prefund.with_turn(turn, false));
                for s in signers {
                    ss.sign(s).unwrap();
                }
                assert!(c.add_signed_state(ss));
            }
            lookup.channels = HashMap::from([(id, c)]);
        }

        // Fund both legs with a guarantee of 6 from the left party.
        let legs = [
            (&p.alice, &p.irene, &mut a, 0usize),
            (&p.irene, &p.bob, &mut i, 1),
        ];
        for (leader, follower, leader_lookup, leader_pos) in legs {
            let ledger = &mut leader_lookup.ledgers[leader_pos];
            let g = Guarantee::new(6.into(), id, leader.address().into(), follower.address().into());
            ledger
                .propose(Proposal::add(ledger.id, Add::new(g, 6.into())), leader)
                .unwrap();
        }
        let countersign = |leader: &mut ConsensusChannel,
                           follower: &mut ConsensusChannel,
                           s: &Signer| {
            let sp = leader.proposal_queue()[0].clone();
            follower.follower_receive(sp.clone()).unwrap();
            let counter = follower.sign_next_proposal(&sp.proposal, s).unwrap();
            leader.leader_receive(counter).unwrap();
        };
        countersign(&mut a.ledgers[0], &mut i.ledgers[0], &p.irene);
        countersign(&mut i.ledgers[1], &mut b.ledgers[0], &p.bob);
        [a, i, b]
    }

    fn request(lookup: &Lookup) -> ObjectiveRequest {
        ObjectiveRequest {
            channel_id: *lookup.channels.keys().next().unwrap(),
        }
    }

    #[test]
    fn bob_asks_alice_for_the_final_state() {
        let p = Parties::new();
        let [_, _, b] = funded(&p);
        let obj = VirtualDefund::new(&request(&b), true, p.bob.address(), 2.into(), &b).unwrap();

        let (obj, se, wf) = obj.crank(&p.bob).unwrap();
        assert_eq!(wf, WaitingFor::FinalStateFromAlice);
        assert_eq!(se.messages_to_send.len(), 1);
        assert_eq!(se.messages_to_send[0].to, p.alice.address());
        assert_eq!(
            se.messages_to_send[0].objective_payloads[0].payload_type,
            PayloadType::RequestFinalState
        );

        let (_, se, wf) = obj.crank(&p.bob).unwrap();
        assert_eq!(wf, WaitingFor::FinalStateFromAlice);
        assert!(se.is_empty());
    }

    #[test]
    fn payee_refuses_short_final_state() {
        let p = Parties::new();
        let [a, _, b] = funded(&p);
        let alice = VirtualDefund::new(&request(&a), true, p.alice.address(), 1.into(), &a).unwrap();
        let (_, se, _) = alice.crank(&p.alice).unwrap();
        let to_bob = se
            .messages_to_send
            .iter()
            .find(|m| m.to == p.bob.address())
            .unwrap();

        let bob = VirtualDefund::new(&request(&b), true, p.bob.address(), 2.into(), &b).unwrap();
        let bob = bob.update(&to_bob.objective_payloads[0]).unwrap();
        assert!(matches!(
            bob.crank(&p.bob),
            Err(ProtocolError::InsufficientFinalPayment { .. })
        ));
    }

    #[test]
    fn final_state_then_ledger_removal() {
        let p = Parties::new();
        let [a, i, b] = funded(&p);
        let alice = VirtualDefund::new(&request(&a), true, p.alice.address(), 2.into(), &a).unwrap();
        let (alice, se, wf) = alice.crank(&p.alice).unwrap();
        assert_eq!(wf, WaitingFor::SupportedFinalState);
        assert_eq!(se.messages_to_send.len(), 2);
        let final_payload = se.messages_to_send[0].objective_payloads[0].clone();
        let final_state = final_payload.decode_signed_state().unwrap().into_state();
        assert_eq!(final_state.outcome.0[0].allocations[0].amount, 4.into());
        assert_eq!(final_state.outcome.0[0].allocations[1].amount, 2.into());

        let irene = VirtualDefund::from_payload(&final_payload, p.irene.address(), 0.into(), &i)
            .unwrap()
            .approve()
            .update(&final_payload)
            .unwrap();
        let bob = VirtualDefund::new(&request(&b), true, p.bob.address(), 2.into(), &b)
            .unwrap()
            .update(&final_payload)
            .unwrap();

        let (irene, irene_se, wf) = irene.crank(&p.irene).unwrap();
        assert_eq!(wf, WaitingFor::SupportedFinalState);
        let (bob, bob_se, wf) = bob.crank(&p.bob).unwrap();
        assert_eq!(wf, WaitingFor::SupportedFinalState);

        let mut alice = alice;
        let mut irene = irene;
        let mut bob = bob;
        for m in irene_se.messages_to_send.iter().chain(&bob_se.messages_to_send) {
            let payload = &m.objective_payloads[0];
            if m.to == p.alice.address() {
                alice = alice.update(payload).unwrap();
            } else if m.to == p.irene.address() {
                irene = irene.update(payload).unwrap();
            } else {
                bob = bob.update(payload).unwrap();
            }
        }

        // Alice leads her only ledger and proposes the removal.
        let (alice, se, wf) = alice.crank(&p.alice).unwrap();
        assert_eq!(wf, WaitingFor::DefundingOnMyRight);
        let removal = se.messages_to_send[0].ledger_proposals[0].clone();

        let irene = irene.receive_proposal(removal).unwrap();
        let (irene, se, wf) = irene.crank(&p.irene).unwrap();
        assert_eq!(wf, WaitingFor::DefundingOnMyRight);
        let back_to_alice = se
            .messages_to_send
            .iter()
            .find(|m| m.to == p.alice.address())
            .unwrap()
            .ledger_proposals[0]
            .clone();
        let to_bob = se
            .messages_to_send
            .iter()
            .find(|m| m.to == p.bob.address())
            .unwrap()
            .ledger_proposals[0]
            .clone();

        let (alice, _, wf) = alice
            .receive_proposal(back_to_alice)
            .unwrap()
            .crank(&p.alice)
            .unwrap();
        assert_eq!(wf, WaitingFor::Nothing);
        assert_eq!(alice.status, ObjectiveStatus::Completed);
        let outcome = &alice.to_my_right.as_ref().unwrap().consensus_vars().outcome;
        assert_eq!(outcome.leader.amount, 8.into());
        assert_eq!(outcome.follower.amount, 12.into());

        let (bob, se, wf) = bob.receive_proposal(to_bob).unwrap().crank(&p.bob).unwrap();
        assert_eq!(wf, WaitingFor::Nothing);
        assert_eq!(bob.status, ObjectiveStatus::Completed);

        let (irene, _, wf) = irene
            .receive_proposal(se.messages_to_send[0].ledger_proposals[0].clone())
            .unwrap()
            .crank(&p.irene)
            .unwrap();
        assert_eq!(wf, WaitingFor::Nothing);
        assert_eq!(irene.status, ObjectiveStatus::Completed);
    }
}
