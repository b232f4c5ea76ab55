//! Persistence of objectives and the channels they drive.

use std::collections::HashMap;

use parking_lot::RwLock;

use crate::{
    channel::Channel,
    consensus::ConsensusChannel,
    payments::VoucherInfo,
    protocols::{ChannelLookup, Objective, ObjectiveId, Related},
    types::{Address, Destination},
};

#[derive(Debug, thiserror::Error)]
pub enum StoreError {
    #[error("objective {0} not found")]
    ObjectiveNotFound(ObjectiveId),
    #[error("channel {0} not found")]
    ChannelNotFound(Destination),
    #[error("ledger channel {0} not found")]
    ConsensusChannelNotFound(Destination),
    #[error("no voucher info for channel {0}")]
    VoucherInfoNotFound(Destination),
    #[error("channel {channel} is owned by objective {owner}")]
    ChannelOwned {
        channel: Destination,
        owner: ObjectiveId,
    },
    #[error("store closed")]
    Closed,
}

/// Storage used by the engine.
///
/// Storing an objective also stores the channels it relates to, and, while
/// the objective is running, records it as the owner of its channel.
pub trait Store: ChannelLookup + Send + Sync {
    /// Load an objective, with its related channels as currently stored.
    fn get_objective(&self, id: &ObjectiveId) -> Result<Objective, StoreError>;
    fn set_objective(&self, objective: &Objective) -> Result<(), StoreError>;
    /// The running objective owning `channel_id`, if any.
    fn get_objective_by_channel_id(&self, channel_id: &Destination) -> Option<Objective>;
    fn release_channel_from_ownership(&self, channel_id: &Destination);

    fn get_channel(&self, id: &Destination) -> Result<Channel, StoreError>;
    fn set_channel(&self, channel: Channel) -> Result<(), StoreError>;
    fn destroy_channel(&self, id: &Destination);
    fn get_channels_by_participant(&self, participant: &Address) -> Vec<Channel>;

    fn get_consensus_channel(&self, id: &Destination) -> Result<ConsensusChannel, StoreError>;
    fn get_consensus_channel_by_counterparty(
        &self,
        counterparty: &Address,
    ) -> Option<ConsensusChannel>;
    fn get_all_consensus_channels(&self) -> Vec<ConsensusChannel>;
    fn set_consensus_channel(&self, channel: ConsensusChannel) -> Result<(), StoreError>;
    fn destroy_consensus_channel(&self, id: &Destination);

    fn get_voucher_info(&self, channel_id: &Destination) -> Result<VoucherInfo, StoreError>;
    fn set_voucher_info(&self, info: VoucherInfo) -> Result<(), StoreError>;
    fn remove_voucher_info(&self, channel_id: &Destination);

    fn get_last_block_num_seen(&self) -> u64;
    fn set_last_block_num_seen(&self, block_num: u64) -> Result<(), StoreError>;

    fn close(&self) -> Result<(), StoreError>;
}

#[derive(Default)]
struct Tables {
    objectives: HashMap<ObjectiveId, Objective>,
    channels: HashMap<Destination, Channel>,
    consensus_channels: HashMap<Destination, ConsensusChannel>,
    owners: HashMap<Destination, ObjectiveId>,
    vouchers: HashMap<Destination, VoucherInfo>,
    last_block_num_seen: u64,
    closed: bool,
}

/// In-memory [Store].
#[derive(Default)]
pub struct MemStore {
    tables: RwLock<Tables>,
}

impl MemStore {
    pub fn new() -> Self {
        Self::default()
    }

    fn write(&self) -> Result<parking_lot::RwLockWriteGuard<'_, Tables>, StoreError> {
        let tables = self.tables.write();
        if tables.closed {
            return Err(StoreError::Closed);
        }
        Ok(tables)
    }
}

impl ChannelLookup for MemStore {
    fn channel(&self, id: &Destination) -> Option<Channel> {
        self.tables.read().channels.get(id).cloned()
    }

    fn consensus_channel(&self, id: &Destination) -> Option<ConsensusChannel> {
        self.tables.read().consensus_channels.get(id).cloned()
    }

    fn ledger_with(&self, counterparty: &Address) -> Option<ConsensusChannel> {
        self.get_consensus_channel_by_counterparty(counterparty)
    }
}

impl Store for MemStore {
    fn get_objective(&self, id: &ObjectiveId) -> Result<Objective, StoreError> {
        let mut objective = self
            .tables
            .read()
            .objectives
            .get(id)
            .cloned()
            .ok_or_else(|| StoreError::ObjectiveNotFound(id.clone()))?;
        objective.rehydrate(self);
        Ok(objective)
    }

    fn set_objective(&self, objective: &Objective) -> Result<(), StoreError> {
        let id = objective.id();
        let mut tables = self.write()?;

        if !objective.is_finished() {
            let channel = objective.owns_channel();
            if let Some(owner) = tables.owners.get(&channel) {
                if *owner != id {
                    return Err(StoreError::ChannelOwned {
                        channel,
                        owner: owner.clone(),
                    });
                }
            }
            tables.owners.insert(channel, id.clone());
        }
        for related in objective.related() {
            match related {
                Related::Channel(c) => {
                    tables.channels.insert(c.id, c);
                }
                Related::Consensus(c) => {
                    tables.consensus_channels.insert(c.id, c);
                }
            }
        }
        tables.objectives.insert(id, objective.clone());
        Ok(())
    }

    fn get_objective_by_channel_id(&self, channel_id: &Destination) -> Option<Objective> {
        let id = self.tables.read().owners.get(channel_id).cloned()?;
        self.get_objective(&id).ok()
    }

    fn release_channel_from_ownership(&self, channel_id: &Destination) {
        self.tables.write().owners.remove(channel_id);
    }

    fn get_channel(&self, id: &Destination) -> Result<Channel, StoreError> {
        self.channel(id).ok_or(StoreError::ChannelNotFound(*id))
    }

    fn set_channel(&self, channel: Channel) -> Result<(), StoreError> {
        self.write()?.channels.insert(channel.id, channel);
        Ok(())
    }

    fn destroy_channel(&self, id: &Destination) {
        self.tables.write().channels.remove(id);
    }

    fn get_channels_by_participant(&self, participant: &Address) -> Vec<Channel> {
        self.tables
            .read()
            .channels
            .values()
            .filter(|c| c.participants().contains(participant))
            .cloned()
            .collect()
    }

    fn get_consensus_channel(&self, id: &Destination) -> Result<ConsensusChannel, StoreError> {
        self.consensus_channel(id)
            .ok_or(StoreError::ConsensusChannelNotFound(*id))
    }

    fn get_consensus_channel_by_counterparty(
        &self,
        counterparty: &Address,
    ) -> Option<ConsensusChannel> {
        self.tables
            .read()
            .consensus_channels
            .values()
            .find(|c| c.counterparty() == *counterparty)
            .cloned()
    }

    fn get_all_consensus_channels(&self) -> Vec<ConsensusChannel> {
        self.tables
            .read()
            .consensus_channels
            .values()
            .cloned()
            .collect()
    }

    fn set_consensus_channel(&self, channel: ConsensusChannel) -> Result<(), StoreError> {
        self.write()?.consensus_channels.insert(channel.id, channel);
        Ok(())
    }

    fn destroy_consensus_channel(&self, id: &Destination) {
        self.tables.write().consensus_channels.remove(id);
    }

    fn get_voucher_info(&self, channel_id: &Destination) -> Result<VoucherInfo, StoreError> {
        self.tables
            .read()
            .vouchers
            .get(channel_id)
            .cloned()
            .ok_or(StoreError::VoucherInfoNotFound(*channel_id))
    }

    fn set_voucher_info(&self, info: VoucherInfo) -> Result<(), StoreError> {
        self.write()?.vouchers.insert(info.channel_id, info);
        Ok(())
    }

    fn remove_voucher_info(&self, channel_id: &Destination) {
        self.tables.write().vouchers.remove(channel_id);
    }

    fn get_last_block_num_seen(&self) -> u64 {
        self.tables.read().last_block_num_seen
    }

    fn set_last_block_num_seen(&self, block_num: u64) -> Result<(), StoreError> {
        let mut tables = self.write()?;
        tables.last_block_num_seen = tables.last_block_num_seen.max(block_num);
        Ok(())
    }

    fn close(&self) -> Result<(), StoreError> {
        self.tables.write().closed = true;
        Ok(())
    }
}
