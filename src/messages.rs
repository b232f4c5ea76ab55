//! Messages exchanged between peers.

use crate::{
    channel::SignedState,
    consensus::SignedProposal,
    payments::Voucher,
    protocols::ObjectiveId,
    types::{Address, Destination},
    wire::{encoding, WireError},
};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PayloadType {
    SignedState = 0,
    /// Asks the payer of a virtual channel for its final state.
    RequestFinalState = 1,
}

impl TryFrom<u32> for PayloadType {
    type Error = u32;

    fn try_from(value: u32) -> Result<Self, Self::Error> {
        match value {
            0 => Ok(PayloadType::SignedState),
            1 => Ok(PayloadType::RequestFinalState),
            other => Err(other),
        }
    }
}

/// Data for one objective, `payload_data` is interpreted according to
/// `payload_type`.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ObjectivePayload {
    pub objective_id: ObjectiveId,
    pub payload_data: Vec<u8>,
    pub payload_type: PayloadType,
}

impl ObjectivePayload {
    pub fn signed_state(objective_id: ObjectiveId, ss: &SignedState) -> Self {
        Self {
            objective_id,
            payload_data: encoding::encode_signed_state(ss),
            payload_type: PayloadType::SignedState,
        }
    }

    pub fn request_final_state(objective_id: ObjectiveId, channel_id: Destination) -> Self {
        Self {
            objective_id,
            payload_data: channel_id.0.to_vec(),
            payload_type: PayloadType::RequestFinalState,
        }
    }

    pub fn decode_signed_state(&self) -> Result<SignedState, WireError> {
        match self.payload_type {
            PayloadType::SignedState => encoding::decode_signed_state(&self.payload_data),
            PayloadType::RequestFinalState => {
                Err(WireError::UnexpectedPayload(self.objective_id.clone()))
            }
        }
    }

    pub fn decode_channel_id(&self) -> Result<Destination, WireError> {
        match self.payload_type {
            PayloadType::RequestFinalState => Destination::try_from(self.payload_data.as_slice())
                .map_err(|_| WireError::UnexpectedPayload(self.objective_id.clone())),
            PayloadType::SignedState => {
                Err(WireError::UnexpectedPayload(self.objective_id.clone()))
            }
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Message {
    pub to: Address,
    pub from: Address,
    pub objective_payloads: Vec<ObjectivePayload>,
    pub ledger_proposals: Vec<SignedProposal>,
    pub payments: Vec<Voucher>,
    pub rejected_objectives: Vec<ObjectiveId>,
}

impl Message {
    pub fn new(from: Address, to: Address) -> Self {
        Self {
            to,
            from,
            objective_payloads: Vec::new(),
            ledger_proposals: Vec::new(),
            payments: Vec::new(),
            rejected_objectives: Vec::new(),
        }
    }

    pub fn is_empty(&self) -> bool {
        self.objective_payloads.is_empty()
            && self.ledger_proposals.is_empty()
            && self.payments.is_empty()
            && self.rejected_objectives.is_empty()
    }

    /// One message per recipient, each carrying `ss`.
    pub fn signed_state(
        id: &ObjectiveId,
        ss: &SignedState,
        from: Address,
        recipients: impl IntoIterator<Item = Address>,
    ) -> Vec<Self> {
        recipients
            .into_iter()
            .map(|to| {
                let mut msg = Self::new(from, to);
                msg.objective_payloads
                    .push(ObjectivePayload::signed_state(id.clone(), ss));
                msg
            })
            .collect()
    }

    pub fn signed_proposal(from: Address, to: Address, sp: SignedProposal) -> Self {
        let mut msg = Self::new(from, to);
        msg.ledger_proposals.push(sp);
        msg
    }

    pub fn request_final_state(
        id: &ObjectiveId,
        channel_id: Destination,
        from: Address,
        to: Address,
    ) -> Self {
        let mut msg = Self::new(from, to);
        msg.objective_payloads
            .push(ObjectivePayload::request_final_state(id.clone(), channel_id));
        msg
    }

    pub fn rejection(
        id: &ObjectiveId,
        from: Address,
        recipients: impl IntoIterator<Item = Address>,
    ) -> Vec<Self> {
        recipients
            .into_iter()
            .map(|to| {
                let mut msg = Self::new(from, to);
                msg.rejected_objectives.push(id.clone());
                msg
            })
            .collect()
    }

    pub fn voucher(from: Address, to: Address, voucher: Voucher) -> Self {
        let mut msg = Self::new(from, to);
        msg.payments.push(voucher);
        msg
    }
}
