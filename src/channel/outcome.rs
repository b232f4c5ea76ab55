//! Exit format: the outcome of a channel, per asset an ordered list of
//! allocations.

use std::collections::BTreeMap;

use crate::{
    abi::{self, Token},
    types::{Address, Destination, U256},
};

#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub enum AllocationType {
    Normal = 0,
    Guarantee = 1,
}

impl TryFrom<u32> for AllocationType {
    type Error = u32;

    fn try_from(value: u32) -> Result<Self, Self::Error> {
        match value {
            0 => Ok(AllocationType::Normal),
            1 => Ok(AllocationType::Guarantee),
            other => Err(other),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Allocation {
    pub destination: Destination,
    pub amount: U256,
    pub allocation_type: AllocationType,
    pub metadata: Vec<u8>,
}

impl Allocation {
    pub fn normal(destination: Destination, amount: U256) -> Self {
        Self {
            destination,
            amount,
            allocation_type: AllocationType::Normal,
            metadata: Vec::new(),
        }
    }

    fn to_token(&self) -> Token {
        Token::Tuple(vec![
            self.destination.into(),
            self.amount.into(),
            Token::uint(self.allocation_type as u8),
            Token::Bytes(self.metadata.clone()),
        ])
    }
}

/// The left and right participants of a guarantee, stored in the metadata of
/// a guarantee allocation.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct GuaranteeMetadata {
    pub left: Destination,
    pub right: Destination,
}

impl GuaranteeMetadata {
    pub fn encode(&self) -> Vec<u8> {
        abi::encode(&[self.left.into(), self.right.into()])
    }

    pub fn decode(data: &[u8]) -> Option<Self> {
        if data.len() != 64 {
            return None;
        }
        Some(Self {
            left: Destination(data[..32].try_into().ok()?),
            right: Destination(data[32..].try_into().ok()?),
        })
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SingleAssetExit {
    pub asset: Address,
    pub metadata: Vec<u8>,
    pub allocations: Vec<Allocation>,
}

impl SingleAssetExit {
    pub fn new(asset: Address, allocations: Vec<Allocation>) -> Self {
        Self {
            asset,
            metadata: Vec::new(),
            allocations,
        }
    }

    pub fn total_allocated(&self) -> U256 {
        self.allocations
            .iter()
            .fold(U256::zero(), |acc, a| acc.saturating_add(a.amount))
    }

    pub fn total_allocated_for(&self, dest: Destination) -> U256 {
        self.allocations
            .iter()
            .filter(|a| a.destination == dest)
            .fold(U256::zero(), |acc, a| acc.saturating_add(a.amount))
    }

    /// Sum of all allocations preceding the first allocation to `dest`.
    ///
    /// `None` if `dest` has no allocation at all.
    pub fn deposit_safety_threshold(&self, dest: Destination) -> Option<U256> {
        let mut sum = U256::zero();
        for a in &self.allocations {
            if a.destination == dest {
                return Some(sum);
            }
            sum = sum.saturating_add(a.amount);
        }
        None
    }

    /// Whether `given` is funded by `funding` once every allocation before it
    /// has been paid out. Allocations are paid out strictly in order.
    pub fn affords(&self, given: &Allocation, funding: U256) -> bool {
        let mut surplus = funding;
        for a in &self.allocations {
            if a == given {
                return surplus >= given.amount;
            }
            if surplus <= a.amount {
                return false;
            }
            surplus -= a.amount;
        }
        false
    }

    fn to_token(&self) -> Token {
        Token::Tuple(vec![
            self.asset.into(),
            Token::Bytes(self.metadata.clone()),
            Token::Array(self.allocations.iter().map(Allocation::to_token).collect()),
        ])
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub struct Exit(pub Vec<SingleAssetExit>);

impl Exit {
    pub fn to_token(&self) -> Token {
        Token::Array(self.0.iter().map(SingleAssetExit::to_token).collect())
    }

    pub fn total_allocated(&self) -> Funds {
        self.per_asset(SingleAssetExit::total_allocated)
    }

    pub fn total_allocated_for(&self, dest: Destination) -> Funds {
        self.per_asset(|sae| sae.total_allocated_for(dest))
    }

    /// Funds that must be on-chain before `dest` may safely deposit.
    pub fn deposit_safety_threshold(&self, dest: Destination) -> Funds {
        self.per_asset(|sae| sae.deposit_safety_threshold(dest).unwrap_or_default())
    }

    /// Checks [SingleAssetExit::affords] for every asset in `given`.
    pub fn affords(&self, given: &BTreeMap<Address, Allocation>, funding: &Funds) -> bool {
        given.iter().all(|(asset, allocation)| {
            self.0
                .iter()
                .find(|sae| sae.asset == *asset)
                .map(|sae| sae.affords(allocation, funding.get(asset)))
                .unwrap_or(false)
        })
    }

    fn per_asset<F: Fn(&SingleAssetExit) -> U256>(&self, f: F) -> Funds {
        let mut funds = Funds::default();
        for sae in &self.0 {
            funds.add(sae.asset, f(sae));
        }
        funds
    }
}

/// Amount per asset.
#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub struct Funds(BTreeMap<Address, U256>);

impl Funds {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn get(&self, asset: &Address) -> U256 {
        self.0.get(asset).copied().unwrap_or_default()
    }

    pub fn set(&mut self, asset: Address, amount: U256) {
        self.0.insert(asset, amount);
    }

    pub fn add(&mut self, asset: Address, amount: U256) {
        let entry = self.0.entry(asset).or_default();
        *entry = entry.saturating_add(amount);
    }

    pub fn iter(&self) -> impl Iterator<Item = (&Address, &U256)> {
        self.0.iter()
    }

    pub fn is_zero(&self) -> bool {
        self.0.values().all(U256::is_zero)
    }

    /// Whether every asset amount in `threshold` is covered by `self`.
    pub fn covers(&self, threshold: &Funds) -> bool {
        threshold.iter().all(|(asset, amount)| self.get(asset) >= *amount)
    }

    /// Per-asset `self - other`, floored at zero. Zero entries are dropped.
    pub fn saturating_sub(&self, other: &Funds) -> Funds {
        let mut out = Funds::default();
        for (asset, amount) in self.iter() {
            let diff = amount.saturating_sub(other.get(asset));
            if !diff.is_zero() {
                out.set(*asset, diff);
            }
        }
        out
    }

    pub fn sum(&self, other: &Funds) -> Funds {
        let mut out = self.clone();
        for (asset, amount) in other.iter() {
            out.add(*asset, *amount);
        }
        out
    }
}

impl FromIterator<(Address, U256)> for Funds {
    fn from_iter<T: IntoIterator<Item = (Address, U256)>>(iter: T) -> Self {
        let mut funds = Funds::default();
        for (asset, amount) in iter {
            funds.add(asset, amount);
        }
        funds
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn dest(b: u8) -> Destination {
        Destination::from(Address([b; 20]))
    }

    fn asset() -> Address {
        Address([0xaa; 20])
    }

    fn exit() -> Exit {
        Exit(vec![SingleAssetExit::new(
            asset(),
            vec![
                Allocation::normal(dest(1), 5.into()),
                Allocation::normal(dest(2), 2.into()),
                Allocation::normal(dest(3), 3.into()),
            ],
        )])
    }

    #[test]
    fn totals() {
        let e = exit();
        assert_eq!(e.total_allocated().get(&asset()), 10.into());
        assert_eq!(e.total_allocated_for(dest(2)).get(&asset()), 2.into());
        assert_eq!(e.total_allocated_for(dest(9)).get(&asset()), 0.into());
    }

    #[test]
    fn safety_threshold_is_sum_of_preceding() {
        let e = exit();
        assert_eq!(e.deposit_safety_threshold(dest(1)).get(&asset()), 0.into());
        assert_eq!(e.deposit_safety_threshold(dest(2)).get(&asset()), 5.into());
        assert_eq!(e.deposit_safety_threshold(dest(3)).get(&asset()), 7.into());
    }

    #[test]
    fn affords_is_order_sensitive() {
        let e = exit();
        let sae = &e.0[0];
        let second = sae.allocations[1].clone();
        let third = sae.allocations[2].clone();

        assert!(!sae.affords(&second, 5.into()));
        assert!(sae.affords(&second, 7.into()));
        assert!(!sae.affords(&third, 9.into()));
        assert!(sae.affords(&third, 10.into()));

        let mut given = BTreeMap::new();
        given.insert(asset(), third);
        let mut funding = Funds::new();
        funding.set(asset(), 10.into());
        assert!(e.affords(&given, &funding));
        funding.set(asset(), 8.into());
        assert!(!e.affords(&given, &funding));
    }

    #[test]
    fn funds_cover_and_subtract() {
        let mut held = Funds::new();
        held.set(asset(), 4.into());
        let mut target = Funds::new();
        target.set(asset(), 10.into());

        assert!(!held.covers(&target));
        assert!(target.covers(&held));
        assert_eq!(target.saturating_sub(&held).get(&asset()), 6.into());
        assert!(held.saturating_sub(&target).is_zero());
    }

    #[test]
    fn guarantee_metadata_roundtrip() {
        let meta = GuaranteeMetadata {
            left: dest(1),
            right: dest(2),
        };
        assert_eq!(GuaranteeMetadata::decode(&meta.encode()), Some(meta));
        assert_eq!(GuaranteeMetadata::decode(&[0u8; 10]), None);
    }
}
