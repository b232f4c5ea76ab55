use crate::types::{Destination, Signature, TurnNum, U256};

use super::Guarantee;

/// Fund `guarantee.target` from the ledger, `left_deposit` of it coming out
/// of the left participant's balance.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Add {
    pub guarantee: Guarantee,
    pub left_deposit: U256,
}

impl Add {
    pub fn new(guarantee: Guarantee, left_deposit: U256) -> Self {
        Self {
            guarantee,
            left_deposit,
        }
    }

    pub fn right_deposit(&self) -> U256 {
        self.guarantee.amount.saturating_sub(self.left_deposit)
    }
}

/// Release the guarantee for `target`, crediting `left_amount` to the left
/// participant and the rest to the right one.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Remove {
    pub target: Destination,
    pub left_amount: U256,
}

impl Remove {
    pub fn new(target: Destination, left_amount: U256) -> Self {
        Self {
            target,
            left_amount,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Change {
    Add(Add),
    Remove(Remove),
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Proposal {
    pub ledger_id: Destination,
    pub change: Change,
}

impl Proposal {
    pub fn add(ledger_id: Destination, add: Add) -> Self {
        Self {
            ledger_id,
            change: Change::Add(add),
        }
    }

    pub fn remove(ledger_id: Destination, remove: Remove) -> Self {
        Self {
            ledger_id,
            change: Change::Remove(remove),
        }
    }

    /// The channel the proposal funds or defunds.
    pub fn target(&self) -> Destination {
        match &self.change {
            Change::Add(a) => a.guarantee.target,
            Change::Remove(r) => r.target,
        }
    }
}

/// A proposal signed by one side, valid for the ledger state at `turn_num`.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SignedProposal {
    pub signature: Signature,
    pub proposal: Proposal,
    pub turn_num: TurnNum,
}
