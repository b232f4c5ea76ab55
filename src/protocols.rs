//! Objectives: protocol instances driven forward by repeatedly cranking them.
//!
//! An objective never changes in place. Every transition returns a new value
//! which the engine persists together with the channels it relates to.

pub mod directdefund;
pub mod directfund;
pub mod virtualdefund;
pub mod virtualfund;

use std::{fmt, str::FromStr};

use crate::{
    chain::{ChainEvent, ChainTransaction},
    channel::{Channel, ChannelError, SignedStateError, StateError},
    consensus::{Change, ConsensusChannel, ConsensusError, Proposal, SignedProposal},
    messages::{Message, ObjectivePayload},
    sig::Signer,
    types::{Address, Destination, TurnNum, U256},
    wire::WireError,
};

pub use directdefund::DirectDefund;
pub use directfund::DirectFund;
pub use virtualdefund::VirtualDefund;
pub use virtualfund::VirtualFund;

#[derive(Debug, thiserror::Error)]
pub enum ProtocolError {
    #[error("objective is not approved")]
    NotApproved,
    #[error("payload for {got} given to objective {expected}")]
    WrongObjective {
        expected: ObjectiveId,
        got: ObjectiveId,
    },
    #[error("a ledger channel with {0} already exists")]
    LedgerChannelExists(Address),
    #[error("no ledger channel with {0}")]
    NoLedgerChannel(Address),
    #[error("ledger channel {0} not found")]
    ConsensusChannelNotFound(Destination),
    #[error("channel {0} not found")]
    ChannelNotFound(Destination),
    #[error("{0} is not a participant")]
    NotAParticipant(Address),
    #[error("ledger channels have exactly two participants, got {0}")]
    NotTwoParty(usize),
    #[error("ledger channel {0} still funds other channels")]
    LedgerNotEmpty(Destination),
    #[error("channel {0} is not funded yet")]
    NotFunded(Destination),
    #[error("ledger {ledger} holds {got}, virtual channel needs {expected}")]
    AssetMismatch {
        ledger: Destination,
        expected: Address,
        got: Address,
    },
    #[error("objective {0} does not take ledger proposals")]
    UnexpectedProposal(ObjectiveId),
    #[error("proposal for unknown ledger {0}")]
    UnknownLedger(Destination),
    #[error("unexpected state at turn {0}")]
    UnexpectedState(TurnNum),
    #[error("final state pays {got}, vouchers add up to {expected}")]
    InsufficientFinalPayment { expected: U256, got: U256 },
    #[error(transparent)]
    Wire(#[from] WireError),
    #[error(transparent)]
    Channel(#[from] ChannelError),
    #[error(transparent)]
    Consensus(#[from] ConsensusError),
    #[error(transparent)]
    State(#[from] StateError),
    #[error(transparent)]
    SignedState(#[from] SignedStateError),
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub enum ObjectiveKind {
    DirectFund,
    DirectDefund,
    VirtualFund,
    VirtualDefund,
}

impl ObjectiveKind {
    pub const ALL: [ObjectiveKind; 4] = [
        ObjectiveKind::DirectFund,
        ObjectiveKind::DirectDefund,
        ObjectiveKind::VirtualFund,
        ObjectiveKind::VirtualDefund,
    ];

    pub fn prefix(self) -> &'static str {
        match self {
            ObjectiveKind::DirectFund => "DirectFunding-",
            ObjectiveKind::DirectDefund => "DirectDefunding-",
            ObjectiveKind::VirtualFund => "VirtualFund-",
            ObjectiveKind::VirtualDefund => "VirtualDefund-",
        }
    }
}

/// Protocol prefix followed by the id of the channel the objective is about.
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct ObjectiveId {
    kind: ObjectiveKind,
    channel_id: Destination,
}

impl ObjectiveId {
    pub fn new(kind: ObjectiveKind, channel_id: Destination) -> Self {
        Self { kind, channel_id }
    }

    pub fn kind(&self) -> ObjectiveKind {
        self.kind
    }

    pub fn channel_id(&self) -> Destination {
        self.channel_id
    }

    /// The objective a ledger proposal belongs to.
    pub fn for_proposal(p: &Proposal) -> Self {
        let kind = match p.change {
            Change::Add(_) => ObjectiveKind::VirtualFund,
            Change::Remove(_) => ObjectiveKind::VirtualDefund,
        };
        Self::new(kind, p.target())
    }
}

impl fmt::Display for ObjectiveId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}{}", self.kind.prefix(), self.channel_id)
    }
}

#[derive(Debug, thiserror::Error)]
#[error("malformed objective id")]
pub struct ParseObjectiveIdError;

impl FromStr for ObjectiveId {
    type Err = ParseObjectiveIdError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let (kind, rest) = ObjectiveKind::ALL
            .iter()
            .find_map(|k| s.strip_prefix(k.prefix()).map(|rest| (*k, rest)))
            .ok_or(ParseObjectiveIdError)?;
        let hex_id = rest.strip_prefix("0x").ok_or(ParseObjectiveIdError)?;
        let bytes = hex::decode(hex_id).map_err(|_| ParseObjectiveIdError)?;
        let channel_id =
            Destination::try_from(bytes.as_slice()).map_err(|_| ParseObjectiveIdError)?;
        Ok(Self::new(kind, channel_id))
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ObjectiveStatus {
    Unapproved,
    Approved,
    Rejected,
    Completed,
}

/// What an objective needs before it can make further progress.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum WaitingFor {
    Nothing,
    CompletePrefund,
    MyTurnToFund,
    CompleteFunding,
    CompletePostFund,
    Finalization,
    Withdraw,
    FinalStateFromAlice,
    SupportedFinalState,
    DefundingOnMyLeft,
    DefundingOnMyRight,
}

impl fmt::Display for WaitingFor {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            WaitingFor::Nothing => "WaitingForNothing",
            WaitingFor::CompletePrefund => "WaitingForCompletePrefund",
            WaitingFor::MyTurnToFund => "WaitingForMyTurnToFund",
            WaitingFor::CompleteFunding => "WaitingForCompleteFunding",
            WaitingFor::CompletePostFund => "WaitingForCompletePostFund",
            WaitingFor::Finalization => "WaitingForFinalization",
            WaitingFor::Withdraw => "WaitingForWithdraw",
            WaitingFor::FinalStateFromAlice => "WaitingForFinalStateFromAlice",
            WaitingFor::SupportedFinalState => "WaitingForSupportedFinalState",
            WaitingFor::DefundingOnMyLeft => "WaitingForDefundingOnMyLeft",
            WaitingFor::DefundingOnMyRight => "WaitingForDefundingOnMyRight",
        };
        f.write_str(name)
    }
}

/// Work a crank hands back to the engine.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct SideEffects {
    pub messages_to_send: Vec<Message>,
    pub transactions_to_submit: Vec<ChainTransaction>,
    pub proposals_to_process: Vec<Proposal>,
}

impl SideEffects {
    pub fn merge(&mut self, other: SideEffects) {
        self.messages_to_send.extend(other.messages_to_send);
        self.transactions_to_submit
            .extend(other.transactions_to_submit);
        self.proposals_to_process.extend(other.proposals_to_process);
    }

    pub fn is_empty(&self) -> bool {
        self.messages_to_send.is_empty()
            && self.transactions_to_submit.is_empty()
            && self.proposals_to_process.is_empty()
    }
}

/// Entities persisted together with an objective.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Related {
    Channel(Channel),
    Consensus(ConsensusChannel),
}

/// Read access to stored channels, used when building objectives and when
/// loading them again.
pub trait ChannelLookup {
    fn channel(&self, id: &Destination) -> Option<Channel>;
    fn consensus_channel(&self, id: &Destination) -> Option<ConsensusChannel>;
    /// The ledger channel shared with `counterparty`.
    fn ledger_with(&self, counterparty: &Address) -> Option<ConsensusChannel>;
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ObjectiveRequest {
    DirectFund(directfund::ObjectiveRequest),
    DirectDefund(directdefund::ObjectiveRequest),
    VirtualFund(virtualfund::ObjectiveRequest),
    VirtualDefund(virtualdefund::ObjectiveRequest),
}

impl ObjectiveRequest {
    pub fn id(&self, me: Address) -> ObjectiveId {
        match self {
            ObjectiveRequest::DirectFund(r) => r.id(me),
            ObjectiveRequest::DirectDefund(r) => r.id(),
            ObjectiveRequest::VirtualFund(r) => r.id(me),
            ObjectiveRequest::VirtualDefund(r) => r.id(),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Objective {
    DirectFund(DirectFund),
    DirectDefund(DirectDefund),
    VirtualFund(VirtualFund),
    VirtualDefund(VirtualDefund),
}

impl Objective {
    pub fn id(&self) -> ObjectiveId {
        match self {
            Objective::DirectFund(o) => o.id(),
            Objective::DirectDefund(o) => o.id(),
            Objective::VirtualFund(o) => o.id(),
            Objective::VirtualDefund(o) => o.id(),
        }
    }

    pub fn status(&self) -> ObjectiveStatus {
        match self {
            Objective::DirectFund(o) => o.status,
            Objective::DirectDefund(o) => o.status,
            Objective::VirtualFund(o) => o.status,
            Objective::VirtualDefund(o) => o.status,
        }
    }

    pub fn is_finished(&self) -> bool {
        matches!(
            self.status(),
            ObjectiveStatus::Completed | ObjectiveStatus::Rejected
        )
    }

    pub fn approve(&self) -> Self {
        match self {
            Objective::DirectFund(o) => Objective::DirectFund(o.approve()),
            Objective::DirectDefund(o) => Objective::DirectDefund(o.approve()),
            Objective::VirtualFund(o) => Objective::VirtualFund(o.approve()),
            Objective::VirtualDefund(o) => Objective::VirtualDefund(o.approve()),
        }
    }

    /// Reject the objective, telling the other participants about it.
    pub fn reject(&self, me: Address) -> (Self, SideEffects) {
        let id = self.id();
        let mut side_effects = SideEffects::default();
        side_effects
            .messages_to_send
            .extend(Message::rejection(&id, me, self.other_participants(me)));

        let rejected = match self {
            Objective::DirectFund(o) => Objective::DirectFund(o.reject()),
            Objective::DirectDefund(o) => Objective::DirectDefund(o.reject()),
            Objective::VirtualFund(o) => Objective::VirtualFund(o.reject()),
            Objective::VirtualDefund(o) => Objective::VirtualDefund(o.reject()),
        };
        (rejected, side_effects)
    }

    /// Mark the objective rejected after a peer rejected it.
    pub fn rejected_by_peer(&self) -> Self {
        match self {
            Objective::DirectFund(o) => Objective::DirectFund(o.reject()),
            Objective::DirectDefund(o) => Objective::DirectDefund(o.reject()),
            Objective::VirtualFund(o) => Objective::VirtualFund(o.reject()),
            Objective::VirtualDefund(o) => Objective::VirtualDefund(o.reject()),
        }
    }

    pub fn update(&self, payload: &ObjectivePayload) -> Result<Self, ProtocolError> {
        let id = self.id();
        if payload.objective_id != id {
            return Err(ProtocolError::WrongObjective {
                expected: id,
                got: payload.objective_id.clone(),
            });
        }
        Ok(match self {
            Objective::DirectFund(o) => Objective::DirectFund(o.update(payload)?),
            Objective::DirectDefund(o) => Objective::DirectDefund(o.update(payload)?),
            Objective::VirtualFund(o) => Objective::VirtualFund(o.update(payload)?),
            Objective::VirtualDefund(o) => Objective::VirtualDefund(o.update(payload)?),
        })
    }

    pub fn receive_proposal(&self, sp: SignedProposal) -> Result<Self, ProtocolError> {
        match self {
            Objective::VirtualFund(o) => Ok(Objective::VirtualFund(o.receive_proposal(sp)?)),
            Objective::VirtualDefund(o) => Ok(Objective::VirtualDefund(o.receive_proposal(sp)?)),
            Objective::DirectFund(_) | Objective::DirectDefund(_) => {
                Err(ProtocolError::UnexpectedProposal(self.id()))
            }
        }
    }

    /// Apply a chain event for the owned channel. Objectives without
    /// on-chain activity ignore events.
    pub fn update_with_chain_event(&self, event: &ChainEvent) -> Result<Self, ProtocolError> {
        Ok(match self {
            Objective::DirectFund(o) => Objective::DirectFund(o.update_with_chain_event(event)?),
            Objective::DirectDefund(o) => {
                Objective::DirectDefund(o.update_with_chain_event(event)?)
            }
            Objective::VirtualFund(_) | Objective::VirtualDefund(_) => self.clone(),
        })
    }

    pub fn crank(&self, signer: &Signer) -> Result<(Self, SideEffects, WaitingFor), ProtocolError> {
        Ok(match self {
            Objective::DirectFund(o) => {
                let (o, se, wf) = o.crank(signer)?;
                (Objective::DirectFund(o), se, wf)
            }
            Objective::DirectDefund(o) => {
                let (o, se, wf) = o.crank(signer)?;
                (Objective::DirectDefund(o), se, wf)
            }
            Objective::VirtualFund(o) => {
                let (o, se, wf) = o.crank(signer)?;
                (Objective::VirtualFund(o), se, wf)
            }
            Objective::VirtualDefund(o) => {
                let (o, se, wf) = o.crank(signer)?;
                (Objective::VirtualDefund(o), se, wf)
            }
        })
    }

    pub fn related(&self) -> Vec<Related> {
        match self {
            Objective::DirectFund(o) => o.related(),
            Objective::DirectDefund(o) => o.related(),
            Objective::VirtualFund(o) => o.related(),
            Objective::VirtualDefund(o) => o.related(),
        }
    }

    /// The channel this objective has exclusive write access to while running.
    pub fn owns_channel(&self) -> Destination {
        self.id().channel_id()
    }

    pub fn participants(&self) -> &[Address] {
        match self {
            Objective::DirectFund(o) => o.c.participants(),
            Objective::DirectDefund(o) => o.c.participants(),
            Objective::VirtualFund(o) => o.v.channel().participants(),
            Objective::VirtualDefund(o) => o.v.channel().participants(),
        }
    }

    pub fn other_participants(&self, me: Address) -> Vec<Address> {
        self.participants()
            .iter()
            .copied()
            .filter(|p| *p != me)
            .collect()
    }

    /// Replace related entities with their stored versions.
    pub fn rehydrate<L: ChannelLookup + ?Sized>(&mut self, lookup: &L) {
        match self {
            Objective::DirectFund(o) => o.rehydrate(lookup),
            Objective::DirectDefund(o) => o.rehydrate(lookup),
            Objective::VirtualFund(o) => o.rehydrate(lookup),
            Objective::VirtualDefund(o) => o.rehydrate(lookup),
        }
    }
}

fn others(participants: &[Address], me: Address) -> Vec<Address> {
    participants.iter().copied().filter(|p| *p != me).collect()
}

#[cfg(test)]
pub(crate) mod tests {
    use std::collections::HashMap;

    use super::*;

    /// In-memory [ChannelLookup] for protocol tests.
    #[derive(Default)]
    pub(crate) struct Lookup {
        pub channels: HashMap<Destination, Channel>,
        pub ledgers: Vec<ConsensusChannel>,
    }

    impl ChannelLookup for Lookup {
        fn channel(&self, id: &Destination) -> Option<Channel> {
            self.channels.get(id).cloned()
        }

        fn consensus_channel(&self, id: &Destination) -> Option<ConsensusChannel> {
            self.ledgers.iter().find(|l| l.id == *id).cloned()
        }

        fn ledger_with(&self, counterparty: &Address) -> Option<ConsensusChannel> {
            self.ledgers
                .iter()
                .find(|l| l.counterparty() == *counterparty)
                .cloned()
        }
    }

    /// Signed states carried by `messages`, in order.
    pub(crate) fn signed_states(messages: &[Message]) -> Vec<crate::channel::SignedState> {
        messages
            .iter()
            .flat_map(|m| &m.objective_payloads)
            .map(|p| p.decode_signed_state().unwrap())
            .collect()
    }

    #[test]
    fn objective_id_round_trip() {
        let id = ObjectiveId::new(ObjectiveKind::VirtualDefund, Destination([0xab; 32]));
        let s = id.to_string();
        assert!(s.starts_with("VirtualDefund-0xabab"));
        assert_eq!(s.parse::<ObjectiveId>().unwrap(), id);

        assert!("DirectFunding-1234".parse::<ObjectiveId>().is_err());
        assert!("Unknown-0xabab".parse::<ObjectiveId>().is_err());
    }

    #[test]
    fn proposals_map_to_virtual_objectives() {
        use crate::consensus::{Add, Guarantee, Remove};

        let target = Destination([5; 32]);
        let ledger = Destination([6; 32]);
        let g = Guarantee::new(1.into(), target, Destination::default(), Destination::default());
        let add = Proposal::add(ledger, Add::new(g, 0.into()));
        let remove = Proposal::remove(ledger, Remove::new(target, 0.into()));

        assert_eq!(
            ObjectiveId::for_proposal(&add),
            ObjectiveId::new(ObjectiveKind::VirtualFund, target)
        );
        assert_eq!(
            ObjectiveId::for_proposal(&remove),
            ObjectiveId::new(ObjectiveKind::VirtualDefund, target)
        );
    }
}
