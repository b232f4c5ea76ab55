//! Protobuf representation of [Message] and its parts.
//!
//! Frames carry a 4 byte big endian length followed by the encoded message.

use prost::Message as _;

use super::WireError;
use crate::{
    channel::{
        Allocation, AllocationType, Exit, SignedState, SignedStateError, SingleAssetExit, State,
    },
    consensus::{Add, Change, Guarantee, Proposal, Remove, SignedProposal},
    messages::{Message, ObjectivePayload, PayloadType},
    payments::Voucher,
    protocols::ObjectiveId,
    types::{Address, Destination, Signature, U256},
};

#[derive(Debug, thiserror::Error)]
pub enum ConversionError {
    #[error("{field}: expected {expected} bytes, got {got}")]
    ByteLengthMismatch {
        field: &'static str,
        expected: usize,
        got: usize,
    },
    #[error("missing field {0}")]
    MissingField(&'static str),
    #[error("unknown allocation type {0}")]
    UnknownAllocationType(u32),
    #[error("unknown payload type {0}")]
    UnknownPayloadType(u32),
    #[error("invalid objective id {0:?}")]
    InvalidObjectiveId(String),
    #[error("challenge duration {0} out of range")]
    ChallengeDurationOutOfRange(u64),
    #[error("invalid signature: {0}")]
    InvalidSignature(#[from] SignedStateError),
}

#[derive(Clone, PartialEq, prost::Message)]
pub struct AllocationProto {
    #[prost(bytes = "vec", tag = "1")]
    pub destination: Vec<u8>,
    #[prost(bytes = "vec", tag = "2")]
    pub amount: Vec<u8>,
    #[prost(uint32, tag = "3")]
    pub allocation_type: u32,
    #[prost(bytes = "vec", tag = "4")]
    pub metadata: Vec<u8>,
}

#[derive(Clone, PartialEq, prost::Message)]
pub struct SingleAssetExitProto {
    #[prost(bytes = "vec", tag = "1")]
    pub asset: Vec<u8>,
    #[prost(bytes = "vec", tag = "2")]
    pub metadata: Vec<u8>,
    #[prost(message, repeated, tag = "3")]
    pub allocations: Vec<AllocationProto>,
}

#[derive(Clone, PartialEq, prost::Message)]
pub struct StateProto {
    #[prost(bytes = "vec", repeated, tag = "1")]
    pub participants: Vec<Vec<u8>>,
    #[prost(uint64, tag = "2")]
    pub channel_nonce: u64,
    #[prost(bytes = "vec", tag = "3")]
    pub app_definition: Vec<u8>,
    #[prost(uint64, tag = "4")]
    pub challenge_duration: u64,
    #[prost(bytes = "vec", tag = "5")]
    pub app_data: Vec<u8>,
    #[prost(message, repeated, tag = "6")]
    pub outcome: Vec<SingleAssetExitProto>,
    #[prost(uint64, tag = "7")]
    pub turn_num: u64,
    #[prost(bool, tag = "8")]
    pub is_final: bool,
}

#[derive(Clone, PartialEq, prost::Message)]
pub struct SignedStateProto {
    #[prost(message, optional, tag = "1")]
    pub state: Option<StateProto>,
    #[prost(bytes = "vec", repeated, tag = "2")]
    pub signatures: Vec<Vec<u8>>,
}

#[derive(Clone, PartialEq, prost::Message)]
pub struct GuaranteeProto {
    #[prost(bytes = "vec", tag = "1")]
    pub amount: Vec<u8>,
    #[prost(bytes = "vec", tag = "2")]
    pub target: Vec<u8>,
    #[prost(bytes = "vec", tag = "3")]
    pub left: Vec<u8>,
    #[prost(bytes = "vec", tag = "4")]
    pub right: Vec<u8>,
}

#[derive(Clone, PartialEq, prost::Message)]
pub struct AddProto {
    #[prost(message, optional, tag = "1")]
    pub guarantee: Option<GuaranteeProto>,
    #[prost(bytes = "vec", tag = "2")]
    pub left_deposit: Vec<u8>,
}

#[derive(Clone, PartialEq, prost::Message)]
pub struct RemoveProto {
    #[prost(bytes = "vec", tag = "1")]
    pub target: Vec<u8>,
    #[prost(bytes = "vec", tag = "2")]
    pub left_amount: Vec<u8>,
}

#[derive(Clone, PartialEq, prost::Oneof)]
pub enum ChangeProto {
    #[prost(message, tag = "2")]
    Add(AddProto),
    #[prost(message, tag = "3")]
    Remove(RemoveProto),
}

#[derive(Clone, PartialEq, prost::Message)]
pub struct ProposalProto {
    #[prost(bytes = "vec", tag = "1")]
    pub ledger_id: Vec<u8>,
    #[prost(oneof = "ChangeProto", tags = "2, 3")]
    pub change: Option<ChangeProto>,
}

#[derive(Clone, PartialEq, prost::Message)]
pub struct SignedProposalProto {
    #[prost(bytes = "vec", tag = "1")]
    pub signature: Vec<u8>,
    #[prost(message, optional, tag = "2")]
    pub proposal: Option<ProposalProto>,
    #[prost(uint64, tag = "3")]
    pub turn_num: u64,
}

#[derive(Clone, PartialEq, prost::Message)]
pub struct VoucherProto {
    #[prost(bytes = "vec", tag = "1")]
    pub channel_id: Vec<u8>,
    #[prost(bytes = "vec", tag = "2")]
    pub amount: Vec<u8>,
    #[prost(bytes = "vec", tag = "3")]
    pub signature: Vec<u8>,
}

#[derive(Clone, PartialEq, prost::Message)]
pub struct ObjectivePayloadProto {
    #[prost(string, tag = "1")]
    pub objective_id: String,
    #[prost(bytes = "vec", tag = "2")]
    pub payload_data: Vec<u8>,
    #[prost(uint32, tag = "3")]
    pub payload_type: u32,
}

#[derive(Clone, PartialEq, prost::Message)]
pub struct MessageProto {
    #[prost(bytes = "vec", tag = "1")]
    pub to: Vec<u8>,
    #[prost(bytes = "vec", tag = "2")]
    pub from: Vec<u8>,
    #[prost(message, repeated, tag = "3")]
    pub objective_payloads: Vec<ObjectivePayloadProto>,
    #[prost(message, repeated, tag = "4")]
    pub ledger_proposals: Vec<SignedProposalProto>,
    #[prost(message, repeated, tag = "5")]
    pub payments: Vec<VoucherProto>,
    #[prost(string, repeated, tag = "6")]
    pub rejected_objectives: Vec<String>,
}

fn fixed<T: for<'a> TryFrom<&'a [u8]>>(
    field: &'static str,
    expected: usize,
    bytes: &[u8],
) -> Result<T, ConversionError> {
    T::try_from(bytes).map_err(|_| ConversionError::ByteLengthMismatch {
        field,
        expected,
        got: bytes.len(),
    })
}

fn address(field: &'static str, bytes: &[u8]) -> Result<Address, ConversionError> {
    fixed(field, 20, bytes)
}

fn destination(field: &'static str, bytes: &[u8]) -> Result<Destination, ConversionError> {
    fixed(field, 32, bytes)
}

fn signature(bytes: &[u8]) -> Result<Signature, ConversionError> {
    fixed("signature", 65, bytes)
}

fn amount(field: &'static str, bytes: &[u8]) -> Result<U256, ConversionError> {
    if bytes.len() != 32 {
        return Err(ConversionError::ByteLengthMismatch {
            field,
            expected: 32,
            got: bytes.len(),
        });
    }
    Ok(U256::from_big_endian(bytes))
}

fn objective_id(s: String) -> Result<ObjectiveId, ConversionError> {
    s.parse()
        .map_err(|_| ConversionError::InvalidObjectiveId(s))
}

impl From<&Allocation> for AllocationProto {
    fn from(a: &Allocation) -> Self {
        Self {
            destination: a.destination.0.to_vec(),
            amount: a.amount.to_be_bytes().to_vec(),
            allocation_type: a.allocation_type as u32,
            metadata: a.metadata.clone(),
        }
    }
}

impl TryFrom<AllocationProto> for Allocation {
    type Error = ConversionError;

    fn try_from(p: AllocationProto) -> Result<Self, Self::Error> {
        Ok(Self {
            destination: destination("allocation.destination", &p.destination)?,
            amount: amount("allocation.amount", &p.amount)?,
            allocation_type: AllocationType::try_from(p.allocation_type)
                .map_err(ConversionError::UnknownAllocationType)?,
            metadata: p.metadata,
        })
    }
}

impl From<&SingleAssetExit> for SingleAssetExitProto {
    fn from(e: &SingleAssetExit) -> Self {
        Self {
            asset: e.asset.0.to_vec(),
            metadata: e.metadata.clone(),
            allocations: e.allocations.iter().map(Into::into).collect(),
        }
    }
}

impl TryFrom<SingleAssetExitProto> for SingleAssetExit {
    type Error = ConversionError;

    fn try_from(p: SingleAssetExitProto) -> Result<Self, Self::Error> {
        Ok(Self {
            asset: address("exit.asset", &p.asset)?,
            metadata: p.metadata,
            allocations: p
                .allocations
                .into_iter()
                .map(TryInto::try_into)
                .collect::<Result<_, _>>()?,
        })
    }
}

impl From<&State> for StateProto {
    fn from(s: &State) -> Self {
        Self {
            participants: s.participants.iter().map(|p| p.0.to_vec()).collect(),
            channel_nonce: s.channel_nonce,
            app_definition: s.app_definition.0.to_vec(),
            challenge_duration: s.challenge_duration.into(),
            app_data: s.app_data.clone(),
            outcome: s.outcome.0.iter().map(Into::into).collect(),
            turn_num: s.turn_num,
            is_final: s.is_final,
        }
    }
}

impl TryFrom<StateProto> for State {
    type Error = ConversionError;

    fn try_from(p: StateProto) -> Result<Self, Self::Error> {
        Ok(Self {
            participants: p
                .participants
                .iter()
                .map(|b| address("state.participants", b))
                .collect::<Result<_, _>>()?,
            channel_nonce: p.channel_nonce,
            app_definition: address("state.app_definition", &p.app_definition)?,
            challenge_duration: p
                .challenge_duration
                .try_into()
                .map_err(|_| ConversionError::ChallengeDurationOutOfRange(p.challenge_duration))?,
            app_data: p.app_data,
            outcome: Exit(
                p.outcome
                    .into_iter()
                    .map(TryInto::try_into)
                    .collect::<Result<_, _>>()?,
            ),
            turn_num: p.turn_num,
            is_final: p.is_final,
        })
    }
}

impl From<&SignedState> for SignedStateProto {
    fn from(ss: &SignedState) -> Self {
        Self {
            state: Some(ss.state().into()),
            signatures: ss.signatures().map(|(_, sig)| sig.0.to_vec()).collect(),
        }
    }
}

impl TryFrom<SignedStateProto> for SignedState {
    type Error = ConversionError;

    /// Every signature is verified against the participants again.
    fn try_from(p: SignedStateProto) -> Result<Self, Self::Error> {
        let state = p
            .state
            .ok_or(ConversionError::MissingField("signed_state.state"))?;
        let mut ss = SignedState::new(state.try_into()?);
        for sig in &p.signatures {
            ss.add_signature(signature(sig)?)?;
        }
        Ok(ss)
    }
}

impl From<&Guarantee> for GuaranteeProto {
    fn from(g: &Guarantee) -> Self {
        Self {
            amount: g.amount.to_be_bytes().to_vec(),
            target: g.target.0.to_vec(),
            left: g.left.0.to_vec(),
            right: g.right.0.to_vec(),
        }
    }
}

impl TryFrom<GuaranteeProto> for Guarantee {
    type Error = ConversionError;

    fn try_from(p: GuaranteeProto) -> Result<Self, Self::Error> {
        Ok(Guarantee::new(
            amount("guarantee.amount", &p.amount)?,
            destination("guarantee.target", &p.target)?,
            destination("guarantee.left", &p.left)?,
            destination("guarantee.right", &p.right)?,
        ))
    }
}

impl From<&Proposal> for ProposalProto {
    fn from(p: &Proposal) -> Self {
        let change = match &p.change {
            Change::Add(add) => ChangeProto::Add(AddProto {
                guarantee: Some((&add.guarantee).into()),
                left_deposit: add.left_deposit.to_be_bytes().to_vec(),
            }),
            Change::Remove(remove) => ChangeProto::Remove(RemoveProto {
                target: remove.target.0.to_vec(),
                left_amount: remove.left_amount.to_be_bytes().to_vec(),
            }),
        };
        Self {
            ledger_id: p.ledger_id.0.to_vec(),
            change: Some(change),
        }
    }
}

impl TryFrom<ProposalProto> for Proposal {
    type Error = ConversionError;

    fn try_from(p: ProposalProto) -> Result<Self, Self::Error> {
        let change = match p.change.ok_or(ConversionError::MissingField("proposal.change"))? {
            ChangeProto::Add(add) => Change::Add(Add::new(
                add.guarantee
                    .ok_or(ConversionError::MissingField("add.guarantee"))?
                    .try_into()?,
                amount("add.left_deposit", &add.left_deposit)?,
            )),
            ChangeProto::Remove(remove) => Change::Remove(Remove::new(
                destination("remove.target", &remove.target)?,
                amount("remove.left_amount", &remove.left_amount)?,
            )),
        };
        Ok(Self {
            ledger_id: destination("proposal.ledger_id", &p.ledger_id)?,
            change,
        })
    }
}

impl From<&SignedProposal> for SignedProposalProto {
    fn from(sp: &SignedProposal) -> Self {
        Self {
            signature: sp.signature.0.to_vec(),
            proposal: Some((&sp.proposal).into()),
            turn_num: sp.turn_num,
        }
    }
}

impl TryFrom<SignedProposalProto> for SignedProposal {
    type Error = ConversionError;

    fn try_from(p: SignedProposalProto) -> Result<Self, Self::Error> {
        Ok(Self {
            signature: signature(&p.signature)?,
            proposal: p
                .proposal
                .ok_or(ConversionError::MissingField("signed_proposal.proposal"))?
                .try_into()?,
            turn_num: p.turn_num,
        })
    }
}

impl From<&Voucher> for VoucherProto {
    fn from(v: &Voucher) -> Self {
        Self {
            channel_id: v.channel_id.0.to_vec(),
            amount: v.amount.to_be_bytes().to_vec(),
            signature: v.signature.0.to_vec(),
        }
    }
}

impl TryFrom<VoucherProto> for Voucher {
    type Error = ConversionError;

    fn try_from(p: VoucherProto) -> Result<Self, Self::Error> {
        Ok(Self {
            channel_id: destination("voucher.channel_id", &p.channel_id)?,
            amount: amount("voucher.amount", &p.amount)?,
            signature: signature(&p.signature)?,
        })
    }
}

impl From<&ObjectivePayload> for ObjectivePayloadProto {
    fn from(p: &ObjectivePayload) -> Self {
        Self {
            objective_id: p.objective_id.to_string(),
            payload_data: p.payload_data.clone(),
            payload_type: p.payload_type as u32,
        }
    }
}

impl TryFrom<ObjectivePayloadProto> for ObjectivePayload {
    type Error = ConversionError;

    fn try_from(p: ObjectivePayloadProto) -> Result<Self, Self::Error> {
        Ok(Self {
            objective_id: objective_id(p.objective_id)?,
            payload_data: p.payload_data,
            payload_type: PayloadType::try_from(p.payload_type)
                .map_err(ConversionError::UnknownPayloadType)?,
        })
    }
}

impl From<&Message> for MessageProto {
    fn from(m: &Message) -> Self {
        Self {
            to: m.to.0.to_vec(),
            from: m.from.0.to_vec(),
            objective_payloads: m.objective_payloads.iter().map(Into::into).collect(),
            ledger_proposals: m.ledger_proposals.iter().map(Into::into).collect(),
            payments: m.payments.iter().map(Into::into).collect(),
            rejected_objectives: m
                .rejected_objectives
                .iter()
                .map(ToString::to_string)
                .collect(),
        }
    }
}

impl TryFrom<MessageProto> for Message {
    type Error = ConversionError;

    fn try_from(p: MessageProto) -> Result<Self, Self::Error> {
        Ok(Self {
            to: address("message.to", &p.to)?,
            from: address("message.from", &p.from)?,
            objective_payloads: p
                .objective_payloads
                .into_iter()
                .map(TryInto::try_into)
                .collect::<Result<_, _>>()?,
            ledger_proposals: p
                .ledger_proposals
                .into_iter()
                .map(TryInto::try_into)
                .collect::<Result<_, _>>()?,
            payments: p
                .payments
                .into_iter()
                .map(TryInto::try_into)
                .collect::<Result<_, _>>()?,
            rejected_objectives: p
                .rejected_objectives
                .into_iter()
                .map(objective_id)
                .collect::<Result<_, _>>()?,
        })
    }
}

pub fn encode_signed_state(ss: &SignedState) -> Vec<u8> {
    SignedStateProto::from(ss).encode_to_vec()
}

pub fn decode_signed_state(buf: &[u8]) -> Result<SignedState, WireError> {
    Ok(SignedStateProto::decode(buf)?.try_into()?)
}

const LEN_PREFIX: usize = 4;

/// Encode `msg` into a length prefixed frame.
pub fn encode_frame(msg: &Message) -> Result<Vec<u8>, WireError> {
    let proto = MessageProto::from(msg);
    let len = proto.encoded_len();
    let prefix = u32::try_from(len).map_err(|_| WireError::FrameTooLarge(len))?;

    let mut buf = Vec::with_capacity(LEN_PREFIX + len);
    buf.extend_from_slice(&prefix.to_be_bytes());
    proto.encode(&mut buf)?;
    Ok(buf)
}

/// Decode a frame produced by [encode_frame].
pub fn decode_frame(frame: &[u8]) -> Result<Message, WireError> {
    if frame.len() < LEN_PREFIX {
        return Err(WireError::TruncatedFrame {
            expected: LEN_PREFIX,
            got: frame.len(),
        });
    }
    let (prefix, body) = frame.split_at(LEN_PREFIX);
    let mut len_bytes = [0u8; LEN_PREFIX];
    len_bytes.copy_from_slice(prefix);
    let len = u32::from_be_bytes(len_bytes) as usize;
    if body.len() != len {
        return Err(WireError::TruncatedFrame {
            expected: LEN_PREFIX + len,
            got: frame.len(),
        });
    }
    Ok(MessageProto::decode(body)?.try_into()?)
}
