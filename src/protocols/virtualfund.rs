//! Opening a virtual channel funded through a chain of ledger channels.
//!
//! Participant `i` shares a ledger with `i - 1` on its left and with `i + 1`
//! on its right. Each ledger is asked to guarantee the full amount of the
//! virtual channel, the part of it coming from the left side being the
//! payer's initial balance.

use super::{
    others, ChannelLookup, ObjectiveId, ObjectiveKind, ObjectiveStatus, ProtocolError, Related,
    SideEffects, WaitingFor,
};
use crate::{
    channel::{Exit, FixedPart, PartIdx, State, VariablePart, VirtualChannel, PRE_FUND_TURN_NUM},
    consensus::{Add, ConsensusChannel, Guarantee, Proposal, SignedProposal},
    messages::{Message, ObjectivePayload},
    sig::Signer,
    types::{Address, Destination, U256},
};

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ObjectiveRequest {
    pub intermediaries: Vec<Address>,
    pub counterparty: Address,
    pub challenge_duration: u32,
    pub outcome: Exit,
    pub nonce: u64,
    pub app_definition: Address,
}

impl ObjectiveRequest {
    pub fn participants(&self, me: Address) -> Vec<Address> {
        let mut participants = Vec::with_capacity(self.intermediaries.len() + 2);
        participants.push(me);
        participants.extend_from_slice(&self.intermediaries);
        participants.push(self.counterparty);
        participants
    }

    pub fn fixed_part(&self, me: Address) -> FixedPart {
        FixedPart {
            participants: self.participants(me),
            channel_nonce: self.nonce,
            app_definition: self.app_definition,
            challenge_duration: self.challenge_duration,
        }
    }

    pub fn id(&self, me: Address) -> ObjectiveId {
        ObjectiveId::new(ObjectiveKind::VirtualFund, self.fixed_part(me).channel_id())
    }
}

/// The guarantee a ledger leg must hold for the virtual channel.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct GuaranteeInfo {
    pub left: Destination,
    pub right: Destination,
    pub left_amount: U256,
    pub right_amount: U256,
    pub guarantee_destination: Destination,
}

impl GuaranteeInfo {
    pub fn guarantee(&self) -> Guarantee {
        Guarantee::new(
            self.left_amount + self.right_amount,
            self.guarantee_destination,
            self.left,
            self.right,
        )
    }
}

/// One ledger leg of the virtual channel.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Connection {
    pub channel: ConsensusChannel,
    pub guarantee_info: GuaranteeInfo,
}

impl Connection {
    fn new(
        channel: ConsensusChannel,
        v: &VirtualChannel,
        left: Address,
        right: Address,
    ) -> Result<Self, ProtocolError> {
        let initial = v.initial_outcome()?;
        let asset = channel.consensus_vars().outcome.asset;
        if asset != initial.asset {
            return Err(ProtocolError::AssetMismatch {
                ledger: channel.id,
                expected: initial.asset,
                got: asset,
            });
        }
        let guarantee_info = GuaranteeInfo {
            left: left.into(),
            right: right.into(),
            left_amount: initial.allocations[0].amount,
            right_amount: initial.allocations[1].amount,
            guarantee_destination: v.id(),
        };
        Ok(Self {
            channel,
            guarantee_info,
        })
    }

    pub fn is_funded(&self) -> bool {
        self.channel.includes(&self.guarantee_info.guarantee())
    }

    fn expected_proposal(&self) -> Proposal {
        Proposal::add(
            self.channel.id,
            Add::new(
                self.guarantee_info.guarantee(),
                self.guarantee_info.left_amount,
            ),
        )
    }

    /// Move the guarantee forward from our side of the ledger.
    fn update_with_guarantee(
        &mut self,
        signer: &Signer,
        side_effects: &mut SideEffects,
    ) -> Result<(), ProtocolError> {
        let g = self.guarantee_info.guarantee();
        if self.channel.includes(&g) {
            return Ok(());
        }
        let me = signer.address();
        let proposal = self.expected_proposal();

        if self.channel.is_leader() {
            if self.channel.is_proposed(&g)? {
                return Ok(());
            }
            let sp = self.channel.propose(proposal, signer)?;
            side_effects
                .messages_to_send
                .push(Message::signed_proposal(me, self.channel.follower(), sp));
        } else if self.channel.is_proposed_next(&g)? {
            let sp = self.channel.sign_next_proposal(&proposal, signer)?;
            side_effects
                .messages_to_send
                .push(Message::signed_proposal(me, self.channel.leader(), sp));
            if let Some(next) = self.channel.proposal_queue().first() {
                side_effects
                    .proposals_to_process
                    .push(next.proposal.clone());
            }
        }
        Ok(())
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct VirtualFund {
    pub status: ObjectiveStatus,
    pub v: VirtualChannel,
    pub my_role: PartIdx,
    pub to_my_left: Option<Connection>,
    pub to_my_right: Option<Connection>,
}

impl VirtualFund {
    pub fn new<L: ChannelLookup + ?Sized>(
        request: &ObjectiveRequest,
        pre_approve: bool,
        me: Address,
        lookup: &L,
    ) -> Result<Self, ProtocolError> {
        let prefund = State::from_parts(
            request.fixed_part(me),
            VariablePart {
                app_data: Vec::new(),
                outcome: request.outcome.clone(),
                turn_num: PRE_FUND_TURN_NUM,
                is_final: false,
            },
        );
        Self::construct(prefund, pre_approve, me, lookup)
    }

    /// Build the objective from the prefund state proposed by the payer.
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
        Self::construct(state.clone(), false, me, lookup)
    }

    fn construct<L: ChannelLookup + ?Sized>(
        prefund: State,
        pre_approve: bool,
        me: Address,
        lookup: &L,
    ) -> Result<Self, ProtocolError> {
        let my_role = prefund
            .participant_index(me)
            .ok_or(ProtocolError::NotAParticipant(me))?;
        let participants = prefund.participants.clone();
        let v = VirtualChannel::new(prefund, my_role)?;

        let leg = |left: Address, right: Address, peer: Address| {
            let ledger = lookup
                .ledger_with(&peer)
                .ok_or(ProtocolError::NoLedgerChannel(peer))?;
            Connection::new(ledger, &v, left, right)
        };
        let to_my_left = match my_role {
            0 => None,
            i => {
                let peer = participants[i - 1];
                Some(leg(peer, me, peer)?)
            }
        };
        let to_my_right = match participants.get(my_role + 1) {
            Some(&peer) => Some(leg(me, peer, peer)?),
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
        })
    }

    pub fn id(&self) -> ObjectiveId {
        ObjectiveId::new(ObjectiveKind::VirtualFund, self.v.id())
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

    pub fn is_payer(&self) -> bool {
        self.my_role == 0
    }

    pub fn is_payee(&self) -> bool {
        self.my_role == self.v.payee_index()
    }

    pub fn update(&self, payload: &ObjectivePayload) -> Result<Self, ProtocolError> {
        let ss = payload.decode_signed_state()?;
        let mut updated = self.clone();
        if !updated.v.channel_mut().add_signed_state(ss) {
            tracing::warn!(objective = %self.id(), "ignoring stale or foreign signed state");
        }
        Ok(updated)
    }

    /// Hand a proposal for one of our ledger legs to that leg.
    pub fn receive_proposal(&self, sp: SignedProposal) -> Result<Self, ProtocolError> {
        let ledger_id = sp.proposal.ledger_id;
        let mut updated = self.clone();
        let connection = [updated.to_my_left.as_mut(), updated.to_my_right.as_mut()]
            .into_iter()
            .flatten()
            .find(|c| c.channel.id == ledger_id)
            .ok_or(ProtocolError::UnknownLedger(ledger_id))?;
        receive_on_leg(&mut connection.channel, sp)?;
        Ok(updated)
    }

    fn funding_complete(&self) -> bool {
        [self.to_my_left.as_ref(), self.to_my_right.as_ref()]
            .into_iter()
            .flatten()
            .all(Connection::is_funded)
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

        if !updated.v.channel().pre_fund_signed_by_me() {
            let ss = updated.v.channel_mut().sign_and_add_prefund(signer)?;
            side_effects.messages_to_send.extend(Message::signed_state(
                &id,
                &ss,
                me,
                others(updated.v.channel().participants(), me),
            ));
        }
        if !updated.v.channel().pre_fund_complete() {
            return Ok((updated, side_effects, WaitingFor::CompletePrefund));
        }

        for connection in [updated.to_my_left.as_mut(), updated.to_my_right.as_mut()]
            .into_iter()
            .flatten()
        {
            connection.update_with_guarantee(signer, &mut side_effects)?;
        }
        if !updated.funding_complete() {
            return Ok((updated, side_effects, WaitingFor::CompleteFunding));
        }

        if !updated.v.channel().post_fund_signed_by_me() {
            let ss = updated.v.channel_mut().sign_and_add_postfund(signer)?;
            side_effects.messages_to_send.extend(Message::signed_state(
                &id,
                &ss,
                me,
                others(updated.v.channel().participants(), me),
            ));
        }
        if !updated.v.channel().post_fund_complete() {
            return Ok((updated, side_effects, WaitingFor::CompletePostFund));
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
                .map(|c| Related::Consensus(c.channel.clone())),
        );
        related
    }

    pub fn rehydrate<L: ChannelLookup + ?Sized>(&mut self, lookup: &L) {
        if let Some(c) = lookup.channel(&self.v.id()) {
            if let Ok(v) = VirtualChannel::from_channel(c) {
                self.v = v;
            }
        }
        for connection in [self.to_my_left.as_mut(), self.to_my_right.as_mut()]
            .into_iter()
            .flatten()
        {
            if let Some(ledger) = lookup.consensus_channel(&connection.channel.id) {
                connection.channel = ledger;
            }
        }
    }
}

/// Apply a proposal to a ledger leg. The follower ignores proposals it has
/// already queued so redelivery is harmless.
pub(super) fn receive_on_leg(
    ledger: &mut ConsensusChannel,
    sp: SignedProposal,
) -> Result<(), ProtocolError> {
    if ledger.is_follower() && sp.turn_num <= ledger.latest_proposed_vars()?.turn_num {
        tracing::debug!(ledger = %ledger.id, turn = sp.turn_num, "ignoring known proposal");
        return Ok(());
    }
    ledger.receive(sp)?;
    Ok(())
}

#[cfg(test)]
pub(crate) mod tests {
    use super::*;
    use crate::{
        channel::{state::tests::signers, Allocation, SignedState, SingleAssetExit},
        consensus::tests::ledger_pair,
        protocols::tests::Lookup,
        sig::Signer,
    };
    use rand::{rngs::StdRng, SeedableRng};

    pub(crate) struct Parties {
        pub alice: Signer,
        pub irene: Signer,
        pub bob: Signer,
    }

    impl Parties {
        pub(crate) fn new() -> Self {
            let (alice, bob) = signers();
            let mut rng = StdRng::seed_from_u64(7);
            Self {
                alice,
                irene: Signer::new(&mut rng),
                bob,
            }
        }

        /// Lookups for Alice, Irene and Bob. Alice leads the ledger with
        /// Irene, Irene leads the ledger with Bob.
        pub(crate) fn lookups(&self) -> (Lookup, Lookup, Lookup) {
            let (ai_leader, ai_follower) = ledger_pair(&self.alice, &self.irene, 10, 10);
            let (ib_leader, ib_follower) = ledger_pair(&self.irene, &self.bob, 10, 10);
            (
                Lookup {
                    ledgers: vec![ai_leader],
                    ..Default::default()
                },
                Lookup {
                    ledgers: vec![ai_follower, ib_leader],
                    ..Default::default()
                },
                Lookup {
                    ledgers: vec![ib_follower],
                    ..Default::default()
                },
            )
        }

        pub(crate) fn request(&self) -> ObjectiveRequest {
            ObjectiveRequest {
                intermediaries: vec![self.irene.address()],
                counterparty: self.bob.address(),
                challenge_duration: 60,
                outcome: Exit(vec![SingleAssetExit::new(
                    Address::default(),
                    vec![
                        Allocation::normal(self.alice.address().into(), 6.into()),
                        Allocation::normal(self.bob.address().into(), 0.into()),
                    ],
                )]),
                nonce: 3,
                app_definition: Address::default(),
            }
        }
    }

    fn sign_prefund(obj: &VirtualFund, signer: &Signer) -> ObjectivePayload {
        let mut ss = SignedState::new(obj.v.channel().pre_fund_state().unwrap().clone());
        ss.sign(signer).unwrap();
        ObjectivePayload::signed_state(obj.id(), &ss)
    }

    #[test]
    fn legs_follow_participant_order() {
        let p = Parties::new();
        let (a, i, b) = p.lookups();
        let alice = VirtualFund::new(&p.request(), true, p.alice.address(), &a).unwrap();
        assert!(alice.is_payer());
        assert!(alice.to_my_left.is_none());
        let right = alice.to_my_right.as_ref().unwrap();
        assert_eq!(right.guarantee_info.left, p.alice.address().into());
        assert_eq!(right.guarantee_info.right, p.irene.address().into());
        assert_eq!(right.guarantee_info.guarantee().amount, 6.into());

        let (_, se, _) = alice.crank(&p.alice).unwrap();
        let payload = &se.messages_to_send[0].objective_payloads[0];
        let irene = VirtualFund::from_payload(payload, p.irene.address(), &i).unwrap();
        assert_eq!(irene.my_role, 1);
        assert!(irene.to_my_left.is_some() && irene.to_my_right.is_some());

        let bob = VirtualFund::from_payload(payload, p.bob.address(), &b).unwrap();
        assert!(bob.is_payee());
        assert!(bob.to_my_right.is_none());
    }

    #[test]
    fn missing_ledger_is_an_error() {
        let p = Parties::new();
        assert!(matches!(
            VirtualFund::new(&p.request(), true, p.alice.address(), &Lookup::default()),
            Err(ProtocolError::NoLedgerChannel(_))
        ));
    }

    #[test]
    fn alice_and_irene_fund_their_leg() {
        let p = Parties::new();
        let (a, i, _) = p.lookups();
        let alice = VirtualFund::new(&p.request(), true, p.alice.address(), &a).unwrap();
        let (alice, se, wf) = alice.crank(&p.alice).unwrap();
        assert_eq!(wf, WaitingFor::CompletePrefund);
        assert_eq!(se.messages_to_send.len(), 2);

        let irene = VirtualFund::from_payload(
            &se.messages_to_send[0].objective_payloads[0],
            p.irene.address(),
            &i,
        )
        .unwrap()
        .approve();
        let alice = alice
            .update(&sign_prefund(&alice, &p.irene))
            .unwrap()
            .update(&sign_prefund(&alice, &p.bob))
            .unwrap();
        let irene = irene
            .update(&sign_prefund(&irene, &p.alice))
            .unwrap()
            .update(&sign_prefund(&irene, &p.bob))
            .unwrap();

        // Alice leads her ledger and proposes the guarantee once.
        let (alice, se, wf) = alice.crank(&p.alice).unwrap();
        assert_eq!(wf, WaitingFor::CompleteFunding);
        assert_eq!(se.messages_to_send.len(), 1);
        let proposal = se.messages_to_send[0].ledger_proposals[0].clone();
        let (alice, se, _) = alice.crank(&p.alice).unwrap();
        assert!(se.is_empty());

        let irene = irene.receive_proposal(proposal.clone()).unwrap();
        let irene = irene.receive_proposal(proposal).unwrap();
        let (irene, se, wf) = irene.crank(&p.irene).unwrap();
        assert_eq!(wf, WaitingFor::CompleteFunding);
        assert!(irene.to_my_left.as_ref().unwrap().is_funded());
        assert!(!irene.to_my_right.as_ref().unwrap().is_funded());

        // Irene countersigns for Alice and proposes on her own ledger with Bob.
        let to_alice = se
            .messages_to_send
            .iter()
            .find(|m| m.to == p.alice.address() && !m.ledger_proposals.is_empty())
            .unwrap();
        assert!(se
            .messages_to_send
            .iter()
            .any(|m| m.to == p.bob.address() && m.ledger_proposals.len() == 1));

        let alice = alice
            .receive_proposal(to_alice.ledger_proposals[0].clone())
            .unwrap();
        assert!(alice.funding_complete());
        let (_, se, wf) = alice.crank(&p.alice).unwrap();
        assert_eq!(wf, WaitingFor::CompletePostFund);
        assert_eq!(se.messages_to_send.len(), 2);

        let ledger = &alice.to_my_right.as_ref().unwrap().channel;
        let outcome = &ledger.consensus_vars().outcome;
        assert_eq!(outcome.leader.amount, 4.into());
        assert_eq!(outcome.follower.amount, 10.into());
    }

    #[test]
    fn proposals_for_other_ledgers_are_refused() {
        let p = Parties::new();
        let (a, _, _) = p.lookups();
        let alice = VirtualFund::new(&p.request(), true, p.alice.address(), &a).unwrap();
        let right = alice.to_my_right.as_ref().unwrap();
        let mut proposal = right.expected_proposal();
        proposal.ledger_id = Destination([9; 32]);
        let sp = SignedProposal {
            signature: Default::default(),
            proposal,
            turn_num: 2,
        };
        assert!(matches!(
            alice.receive_proposal(sp),
            Err(ProtocolError::UnknownLedger(_))
        ));
    }
}
