//! Everything the node needs from the blockchain: typed events, the
//! transactions it submits and the [ChainService] collaborator.

mod event_buffer;
mod simulated;

use async_trait::async_trait;
use tokio::sync::mpsc;

use crate::{
    channel::{Funds, SignedState, VariablePart},
    types::{Address, Destination, Signature, U256},
};

pub use event_buffer::EventBuffer;
pub use simulated::{SimulatedChain, SimulatedChainService};

#[derive(Debug, thiserror::Error)]
pub enum ChainError {
    #[error("event buffer full ({0} pending events)")]
    BufferFull(usize),
    #[error("transaction rejected: {0}")]
    Rejected(String),
    #[error("chain service closed")]
    Closed,
}

/// Where an event happened on chain, ordered by block then transaction.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct ChainPosition {
    pub block_num: u64,
    pub tx_index: u32,
}

impl ChainPosition {
    pub fn new(block_num: u64, tx_index: u32) -> Self {
        Self {
            block_num,
            tx_index,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DepositedEvent {
    pub channel_id: Destination,
    pub position: ChainPosition,
    pub asset: Address,
    pub now_held: U256,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct AllocationUpdatedEvent {
    pub channel_id: Destination,
    pub position: ChainPosition,
    pub asset: Address,
    pub amount: U256,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ConcludedEvent {
    pub channel_id: Destination,
    pub position: ChainPosition,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ChallengeRegisteredEvent {
    pub channel_id: Destination,
    pub position: ChainPosition,
    pub candidate: VariablePart,
    pub signatures: Vec<Signature>,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ChainEvent {
    Deposited(DepositedEvent),
    AllocationUpdated(AllocationUpdatedEvent),
    Concluded(ConcludedEvent),
    ChallengeRegistered(ChallengeRegisteredEvent),
}

impl ChainEvent {
    pub fn channel_id(&self) -> Destination {
        match self {
            ChainEvent::Deposited(e) => e.channel_id,
            ChainEvent::AllocationUpdated(e) => e.channel_id,
            ChainEvent::Concluded(e) => e.channel_id,
            ChainEvent::ChallengeRegistered(e) => e.channel_id,
        }
    }

    pub fn position(&self) -> ChainPosition {
        match self {
            ChainEvent::Deposited(e) => e.position,
            ChainEvent::AllocationUpdated(e) => e.position,
            ChainEvent::Concluded(e) => e.position,
            ChainEvent::ChallengeRegistered(e) => e.position,
        }
    }

    pub fn block_num(&self) -> u64 {
        self.position().block_num
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ChainTransaction {
    /// Deposit `amount` (per asset) into the channel.
    Deposit {
        channel_id: Destination,
        amount: Funds,
    },
    /// Conclude the channel with a final, fully signed state and pay out
    /// all of its allocations.
    WithdrawAll {
        channel_id: Destination,
        signed_state: SignedState,
    },
}

impl ChainTransaction {
    pub fn channel_id(&self) -> Destination {
        match self {
            ChainTransaction::Deposit { channel_id, .. } => *channel_id,
            ChainTransaction::WithdrawAll { channel_id, .. } => *channel_id,
        }
    }
}

/// Access to the adjudicator contracts of one chain.
#[async_trait]
pub trait ChainService: Send + Sync {
    /// Subscribe to confirmed events. The feed ends when the subscription
    /// breaks, callers may subscribe again.
    fn event_feed(&self) -> Result<mpsc::UnboundedReceiver<ChainEvent>, ChainError>;

    async fn send_transaction(&self, tx: ChainTransaction) -> Result<(), ChainError>;

    fn chain_id(&self) -> U256;

    async fn last_confirmed_block_num(&self) -> Result<u64, ChainError>;

    async fn close(&self) -> Result<(), ChainError>;
}
