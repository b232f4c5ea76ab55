//! Walkthrough: three in-process nodes open ledger channels on a simulated
//! chain, route a payment channel through the one in the middle, pay and
//! close everything again.
//!
//! Run with `RUST_LOG=nitro=debug` to follow the protocol messages.

use std::sync::Arc;

use nitro::{
    chain::{SimulatedChain, SimulatedChainService},
    channel::{Allocation, Exit, SingleAssetExit},
    config::NodeConfig,
    sig::Signer,
    store::{MemStore, Store},
    wire::{Broker, MemMessageService},
    Address, ClientError, NitroClient,
};
use rand::{rngs::StdRng, SeedableRng};

const PARTICIPANTS: [&str; 3] = ["Alice", "Irene", "Bob"];

const CONFIG: &str = r#"
[engine]
block_poll_interval_ms = 500

[chain]
confirmation_depth = 0
"#;

fn outcome(a: Address, a_amount: u64, b: Address, b_amount: u64) -> Exit {
    Exit(vec![SingleAssetExit::new(
        Address::default(),
        vec![
            Allocation::normal(a.into(), a_amount.into()),
            Allocation::normal(b.into(), b_amount.into()),
        ],
    )])
}

#[tokio::main]
async fn main() -> Result<(), ClientError> {
    tracing_subscriber::fmt()
        .with_env_filter(tracing_subscriber::EnvFilter::from_default_env())
        .init();

    let config = NodeConfig::from_toml_str(CONFIG).expect("valid config");
    let broker = Broker::new();
    let chain = SimulatedChain::from_config(1337.into(), &config.chain);
    let mut rng = StdRng::seed_from_u64(0);

    let mut nodes = Vec::new();
    for name in PARTICIPANTS {
        let signer = Signer::new(&mut rng);
        let me = signer.address();
        println!("{}: {}", name, me);
        let store: Arc<dyn Store> = Arc::new(MemStore::new());
        nodes.push(NitroClient::new(
            signer,
            store,
            Arc::new(MemMessageService::new(broker.clone(), me, 64)),
            Arc::new(SimulatedChainService::new(chain.clone())),
            config.engine.clone(),
        )?);
    }
    let [alice, irene, bob] = <[NitroClient; 3]>::try_from(nodes).ok().expect("three nodes");

    let mut ledgers = Vec::new();
    for (hub, client) in [(&alice, &irene), (&irene, &bob)] {
        let id = hub
            .create_ledger_channel(client.address(), 60, outcome(hub.address(), 100, client.address(), 100))
            .await?;
        hub.objective_complete(&id).await?;
        client.objective_complete(&id).await?;
        println!("ledger channel {} open", id.channel_id());
        ledgers.push((hub, client, id.channel_id()));
    }

    let id = alice
        .create_payment_channel(
            vec![irene.address()],
            bob.address(),
            60,
            outcome(alice.address(), 50, bob.address(), 0),
        )
        .await?;
    for node in [&alice, &irene, &bob] {
        node.objective_complete(&id).await?;
    }
    let channel_id = id.channel_id();
    println!("payment channel {} open", channel_id);

    let mut events = bob.subscribe();
    for amount in [5u64, 10, 15] {
        let voucher = alice.pay(channel_id, amount.into()).await?;
        println!("Alice paid {}, {} in total", amount, voucher.amount);
    }
    while let Ok(event) = events.recv().await {
        if event
            .received_vouchers
            .iter()
            .any(|v| v.amount == 30.into())
        {
            break;
        }
    }

    let close = bob.close_payment_channel(channel_id).await?;
    for node in [&alice, &irene, &bob] {
        node.objective_complete(&close).await?;
    }
    println!("{:#?}", bob.get_payment_channel(&channel_id)?);

    for (hub, client, ledger_id) in ledgers {
        println!("{:#?}", hub.get_ledger_channel(&ledger_id)?);
        let close = client.close_ledger_channel(ledger_id).await?;
        hub.objective_complete(&close).await?;
        client.objective_complete(&close).await?;
    }
    for (name, node) in PARTICIPANTS.iter().zip([&alice, &irene, &bob]) {
        println!("{} withdrew {:?}", name, chain.balance_of(&node.address()));
    }

    for node in [alice, irene, bob] {
        node.shutdown().await?;
    }
    Ok(())
}
