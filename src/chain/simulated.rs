use std::{
    collections::{HashMap, HashSet},
    sync::{
        atomic::{AtomicBool, Ordering},
        Arc,
    },
};

use async_trait::async_trait;
use parking_lot::Mutex;
use tokio::sync::mpsc;

use super::{
    AllocationUpdatedEvent, ChainError, ChainEvent, ChainPosition, ChainService,
    ChainTransaction, ConcludedEvent, DepositedEvent, EventBuffer,
};
use crate::{
    channel::Funds,
    config::ChainConfig,
    types::{Address, Destination, U256},
};

#[derive(Default)]
struct Ledger {
    head: u64,
    holdings: HashMap<Destination, Funds>,
    balances: HashMap<Address, Funds>,
    concluded: HashSet<Destination>,
    subscribers: Vec<mpsc::UnboundedSender<ChainEvent>>,
}

/// An in-process chain shared by every node of a test network.
///
/// Every transaction is mined into its own block.
pub struct SimulatedChain {
    chain_id: U256,
    buffer: EventBuffer,
    ledger: Mutex<Ledger>,
}

impl SimulatedChain {
    pub fn new(chain_id: U256, confirmation_depth: u64, event_buffer: usize) -> Arc<Self> {
        Arc::new(Self {
            chain_id,
            buffer: EventBuffer::new(confirmation_depth, event_buffer),
            ledger: Mutex::new(Ledger::default()),
        })
    }

    pub fn from_config(chain_id: U256, config: &ChainConfig) -> Arc<Self> {
        Self::new(chain_id, config.confirmation_depth, config.event_buffer)
    }

    pub fn head(&self) -> u64 {
        self.ledger.lock().head
    }

    pub fn holdings(&self, channel: &Destination) -> Funds {
        self.ledger
            .lock()
            .holdings
            .get(channel)
            .cloned()
            .unwrap_or_default()
    }

    /// What has been paid out to `addr` by concluded channels.
    pub fn balance_of(&self, addr: &Address) -> Funds {
        self.ledger
            .lock()
            .balances
            .get(addr)
            .cloned()
            .unwrap_or_default()
    }

    /// Mine an empty block, releasing events that became confirmed.
    pub fn mine_block(&self) {
        let mut ledger = self.ledger.lock();
        ledger.head += 1;
        self.publish(&mut ledger);
    }

    fn subscribe(&self) -> mpsc::UnboundedReceiver<ChainEvent> {
        let (tx, rx) = mpsc::unbounded_channel();
        self.ledger.lock().subscribers.push(tx);
        rx
    }

    fn publish(&self, ledger: &mut Ledger) {
        let released = self.buffer.release(ledger.head);
        for event in released {
            ledger
                .subscribers
                .retain(|sub| sub.send(event.clone()).is_ok());
        }
    }

    fn execute(&self, tx: ChainTransaction) -> Result<(), ChainError> {
        let mut ledger = self.ledger.lock();
        let channel_id = tx.channel_id();
        if ledger.concluded.contains(&channel_id) {
            return Err(ChainError::Rejected(format!(
                "channel {} is already concluded",
                channel_id
            )));
        }

        let block_num = ledger.head + 1;
        let mut events = Vec::new();
        // Changes are staged and committed only once the events are buffered.
        let mut held = ledger.holdings.get(&channel_id).cloned().unwrap_or_default();
        let mut payouts = Vec::new();
        let concludes = match tx {
            ChainTransaction::Deposit { amount, .. } => {
                for (asset, value) in amount.iter() {
                    held.add(*asset, *value);
                    events.push(ChainEvent::Deposited(DepositedEvent {
                        channel_id,
                        position: ChainPosition::new(block_num, events.len() as u32),
                        asset: *asset,
                        now_held: held.get(asset),
                    }));
                }
                false
            }
            ChainTransaction::WithdrawAll { signed_state, .. } => {
                let state = signed_state.state();
                if state.channel_id() != channel_id {
                    return Err(ChainError::Rejected("state is for another channel".into()));
                }
                if !state.is_final || !signed_state.has_all_signatures() {
                    return Err(ChainError::Rejected(
                        "withdrawal needs a final, fully signed state".into(),
                    ));
                }

                events.push(ChainEvent::Concluded(ConcludedEvent {
                    channel_id,
                    position: ChainPosition::new(block_num, 0),
                }));
                for exit in &state.outcome.0 {
                    let mut available = held.get(&exit.asset);
                    for allocation in &exit.allocations {
                        let paid = allocation.amount.min(available);
                        available -= paid;
                        if let Some(addr) = allocation.destination.to_address() {
                            payouts.push((addr, exit.asset, paid));
                        }
                    }
                    held.set(exit.asset, available);
                    events.push(ChainEvent::AllocationUpdated(AllocationUpdatedEvent {
                        channel_id,
                        position: ChainPosition::new(block_num, events.len() as u32),
                        asset: exit.asset,
                        amount: available,
                    }));
                }
                true
            }
        };

        self.buffer.push_all(events)?;
        if concludes {
            ledger.holdings.remove(&channel_id);
            ledger.concluded.insert(channel_id);
        } else {
            ledger.holdings.insert(channel_id, held);
        }
        for (addr, asset, paid) in payouts {
            ledger.balances.entry(addr).or_default().add(asset, paid);
        }
        ledger.head = block_num;
        self.publish(&mut ledger);
        Ok(())
    }
}

/// One node's handle on a [SimulatedChain].
pub struct SimulatedChainService {
    chain: Arc<SimulatedChain>,
    closed: AtomicBool,
}

impl SimulatedChainService {
    pub fn new(chain: Arc<SimulatedChain>) -> Self {
        Self {
            chain,
            closed: AtomicBool::new(false),
        }
    }
}

#[async_trait]
impl ChainService for SimulatedChainService {
    fn event_feed(&self) -> Result<mpsc::UnboundedReceiver<ChainEvent>, ChainError> {
        if self.closed.load(Ordering::Acquire) {
            return Err(ChainError::Closed);
        }
        Ok(self.chain.subscribe())
    }

    async fn send_transaction(&self, tx: ChainTransaction) -> Result<(), ChainError> {
        if self.closed.load(Ordering::Acquire) {
            return Err(ChainError::Closed);
        }
        tracing::debug!(channel = %tx.channel_id(), "submitting transaction");
        self.chain.execute(tx)
    }

    fn chain_id(&self) -> U256 {
        self.chain.chain_id
    }

    async fn last_confirmed_block_num(&self) -> Result<u64, ChainError> {
        Ok(self.chain.head())
    }

    async fn close(&self) -> Result<(), ChainError> {
        self.closed.store(true, Ordering::Release);
        Ok(())
    }
}
