use std::collections::BTreeMap;

use crate::{
    channel::{Allocation, AllocationType, Exit, GuaranteeMetadata, SingleAssetExit},
    types::{Address, Destination, Signature, TurnNum, U256},
};

use super::{Add, ConsensusError, Remove};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Balance {
    pub destination: Destination,
    pub amount: U256,
}

impl Balance {
    pub fn new(destination: Destination, amount: U256) -> Self {
        Self {
            destination,
            amount,
        }
    }

    fn as_allocation(&self) -> Allocation {
        Allocation::normal(self.destination, self.amount)
    }
}

/// Funds of a ledger channel reserved for the channel `target`.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Guarantee {
    pub amount: U256,
    pub target: Destination,
    pub left: Destination,
    pub right: Destination,
}

impl Guarantee {
    pub fn new(amount: U256, target: Destination, left: Destination, right: Destination) -> Self {
        Self {
            amount,
            target,
            left,
            right,
        }
    }

    fn as_allocation(&self) -> Allocation {
        Allocation {
            destination: self.target,
            amount: self.amount,
            allocation_type: AllocationType::Guarantee,
            metadata: GuaranteeMetadata {
                left: self.left,
                right: self.right,
            }
            .encode(),
        }
    }
}

/// Single-asset outcome of a two party ledger channel.
///
/// The amounts of both balances and all guarantees always add up to the
/// funding of the channel.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct LedgerOutcome {
    pub asset: Address,
    pub leader: Balance,
    pub follower: Balance,
    pub guarantees: BTreeMap<Destination, Guarantee>,
}

impl LedgerOutcome {
    pub fn new(asset: Address, leader: Balance, follower: Balance) -> Self {
        Self {
            asset,
            leader,
            follower,
            guarantees: BTreeMap::new(),
        }
    }

    pub fn includes(&self, g: &Guarantee) -> bool {
        self.guarantees.get(&g.target) == Some(g)
    }

    pub fn includes_target(&self, target: &Destination) -> bool {
        self.guarantees.contains_key(target)
    }

    pub fn total(&self) -> Result<U256, ConsensusError> {
        self.guarantees
            .values()
            .try_fold(self.leader.amount, |acc, g| acc.checked_add(g.amount))
            .and_then(|acc| acc.checked_add(self.follower.amount))
            .ok_or(ConsensusError::Overflow)
    }

    /// Leader, follower, then guarantees in target order.
    pub fn as_exit(&self) -> Exit {
        let mut allocations = vec![self.leader.as_allocation(), self.follower.as_allocation()];
        allocations.extend(self.guarantees.values().map(Guarantee::as_allocation));
        Exit(vec![SingleAssetExit::new(self.asset, allocations)])
    }

    pub fn from_exit(exit: &Exit) -> Result<Self, ConsensusError> {
        let [sae] = exit.0.as_slice() else {
            return Err(ConsensusError::MalformedOutcome(
                "ledger outcome must have exactly one asset",
            ));
        };
        let (leader, follower, rest) = match sae.allocations.as_slice() {
            [l, f, rest @ ..] => (l, f, rest),
            _ => {
                return Err(ConsensusError::MalformedOutcome(
                    "ledger outcome needs leader and follower allocations",
                ))
            }
        };
        if leader.allocation_type != AllocationType::Normal
            || follower.allocation_type != AllocationType::Normal
        {
            return Err(ConsensusError::MalformedOutcome(
                "leader and follower allocations must be normal",
            ));
        }

        let mut guarantees = BTreeMap::new();
        for a in rest {
            if a.allocation_type != AllocationType::Guarantee {
                return Err(ConsensusError::MalformedOutcome(
                    "only guarantees may follow the balances",
                ));
            }
            let meta = GuaranteeMetadata::decode(&a.metadata)
                .ok_or(ConsensusError::MalformedOutcome("bad guarantee metadata"))?;
            guarantees.insert(
                a.destination,
                Guarantee::new(a.amount, a.destination, meta.left, meta.right),
            );
        }

        Ok(Self {
            asset: sae.asset,
            leader: Balance::new(leader.destination, leader.amount),
            follower: Balance::new(follower.destination, follower.amount),
            guarantees,
        })
    }
}

/// A turn number together with the outcome at that turn.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Vars {
    pub turn_num: TurnNum,
    pub outcome: LedgerOutcome,
}

impl Vars {
    /// Apply `add`, leaving `self` untouched on error.
    pub fn add(&mut self, add: &Add) -> Result<(), ConsensusError> {
        let g = &add.guarantee;
        if self.outcome.includes_target(&g.target) {
            return Err(ConsensusError::DuplicateGuarantee(g.target));
        }
        if add.left_deposit > g.amount {
            return Err(ConsensusError::InvalidDeposit);
        }
        let right_deposit = g.amount - add.left_deposit;

        let mut outcome = self.outcome.clone();
        let (left, right) = if outcome.leader.destination == g.left {
            (&mut outcome.leader, &mut outcome.follower)
        } else {
            (&mut outcome.follower, &mut outcome.leader)
        };
        if add.left_deposit > left.amount || right_deposit > right.amount {
            return Err(ConsensusError::InsufficientFunds);
        }
        left.amount -= add.left_deposit;
        right.amount -= right_deposit;
        outcome.guarantees.insert(g.target, *g);

        self.outcome = outcome;
        self.turn_num += 1;
        Ok(())
    }

    /// Apply `remove`, leaving `self` untouched on error.
    pub fn remove(&mut self, remove: &Remove) -> Result<(), ConsensusError> {
        let g = *self
            .outcome
            .guarantees
            .get(&remove.target)
            .ok_or(ConsensusError::GuaranteeNotFound(remove.target))?;
        if remove.left_amount > g.amount {
            return Err(ConsensusError::InvalidAmount);
        }
        let right_amount = g.amount - remove.left_amount;

        let mut outcome = self.outcome.clone();
        let (left, right) = if outcome.leader.destination == g.left {
            (&mut outcome.leader, &mut outcome.follower)
        } else {
            (&mut outcome.follower, &mut outcome.leader)
        };
        left.amount = left
            .amount
            .checked_add(remove.left_amount)
            .ok_or(ConsensusError::Overflow)?;
        right.amount = right
            .amount
            .checked_add(right_amount)
            .ok_or(ConsensusError::Overflow)?;
        outcome.guarantees.remove(&remove.target);

        self.outcome = outcome;
        self.turn_num += 1;
        Ok(())
    }
}

/// [Vars] signed by leader (index 0) and follower (index 1).
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SignedVars {
    pub vars: Vars,
    pub signatures: [Signature; 2],
}
