#![allow(dead_code)]

use std::{sync::Arc, time::Duration};

use nitro::{
    chain::{SimulatedChain, SimulatedChainService},
    channel::{Allocation, Exit, Funds, SingleAssetExit},
    config::EngineConfig,
    protocols::ObjectiveId,
    sig::Signer,
    store::{MemStore, Store},
    wire::{Broker, MemMessageService},
    Address, NitroClient,
};
use rand::{rngs::StdRng, SeedableRng};

pub const TIMEOUT: Duration = Duration::from_secs(10);

pub struct Network {
    pub broker: Arc<Broker>,
    pub chain: Arc<SimulatedChain>,
}

impl Network {
    pub fn new() -> Self {
        init_tracing();
        Self {
            broker: Broker::new(),
            chain: SimulatedChain::new(1337.into(), 0, 1024),
        }
    }

    /// Start a node with a key derived from `seed`.
    pub fn node(&self, seed: u64) -> NitroClient {
        let signer = Signer::new(&mut StdRng::seed_from_u64(seed));
        let me = signer.address();
        let store: Arc<dyn Store> = Arc::new(MemStore::new());
        let msg = Arc::new(MemMessageService::new(self.broker.clone(), me, 64));
        let chain = Arc::new(SimulatedChainService::new(self.chain.clone()));
        let config = EngineConfig {
            block_poll_interval_ms: 50,
            ..Default::default()
        };
        NitroClient::new(signer, store, msg, chain, config).unwrap()
    }
}

fn init_tracing() {
    let _ = tracing_subscriber::fmt()
        .with_env_filter(tracing_subscriber::EnvFilter::from_default_env())
        .with_test_writer()
        .try_init();
}

pub fn outcome(a: Address, a_amount: u64, b: Address, b_amount: u64) -> Exit {
    Exit(vec![SingleAssetExit::new(
        Address::default(),
        vec![
            Allocation::normal(a.into(), a_amount.into()),
            Allocation::normal(b.into(), b_amount.into()),
        ],
    )])
}

pub fn funds(amount: u64) -> Funds {
    let mut f = Funds::new();
    f.set(Address::default(), amount.into());
    f
}

/// Wait until every node has completed the objective.
pub async fn all_complete(nodes: &[&NitroClient], id: &ObjectiveId) {
    for node in nodes {
        tokio::time::timeout(TIMEOUT, node.objective_complete(id))
            .await
            .unwrap_or_else(|_| panic!("{} timed out on {}", node.address(), id))
            .unwrap();
    }
}

/// Poll `check` until it returns true.
pub async fn eventually(mut check: impl FnMut() -> bool) {
    tokio::time::timeout(TIMEOUT, async {
        while !check() {
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
    })
    .await
    .expect("condition never held");
}
