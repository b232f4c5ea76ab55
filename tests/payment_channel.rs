mod common;

use common::{all_complete, eventually, outcome, Network};
use nitro::{query::ChannelStatus, NitroClient, U256};

async fn ledger(net: &Network, leader: &NitroClient, follower: &NitroClient) -> nitro::Destination {
    let id = leader
        .create_ledger_channel(
            follower.address(),
            60,
            outcome(leader.address(), 10, follower.address(), 10),
        )
        .await
        .unwrap();
    all_complete(&[leader, follower], &id).await;
    assert!(!net.chain.holdings(&id.channel_id()).is_zero());
    id.channel_id()
}

#[tokio::test]
async fn pay_through_an_intermediary() {
    let net = Network::new();
    let alice = net.node(11);
    let irene = net.node(12);
    let bob = net.node(13);

    let alice_irene = ledger(&net, &alice, &irene).await;
    let irene_bob = ledger(&net, &irene, &bob).await;

    let id = alice
        .create_payment_channel(
            vec![irene.address()],
            bob.address(),
            60,
            outcome(alice.address(), 6, bob.address(), 0),
        )
        .await
        .unwrap();
    all_complete(&[&alice, &irene, &bob], &id).await;
    let channel_id = id.channel_id();

    // Both legs lock the full channel amount.
    let leg = alice.get_ledger_channel(&alice_irene).unwrap();
    assert_eq!(leg.balance.leader_balance, 4.into());
    assert_eq!(leg.balance.follower_balance, 10.into());
    let info = bob.get_payment_channel(&channel_id).unwrap();
    assert_eq!(info.status, ChannelStatus::Open);
    assert_eq!(info.balance.remaining, 6.into());

    alice.pay(channel_id, 2.into()).await.unwrap();
    let voucher = alice.pay(channel_id, 1.into()).await.unwrap();
    assert_eq!(voucher.amount, 3.into());
    // Paying more than the channel holds is refused without stopping the node.
    assert!(alice.pay(channel_id, 4.into()).await.is_err());
    // Only the payer pays.
    assert!(bob.pay(channel_id, 1.into()).await.is_err());

    eventually(|| {
        bob.get_payment_channel(&channel_id)
            .map(|info| info.balance.paid_so_far == U256::from(3))
            .unwrap_or(false)
    })
    .await;

    let close = bob.close_payment_channel(channel_id).await.unwrap();
    all_complete(&[&bob, &alice, &irene], &close).await;

    // The payee's share moved across both ledgers.
    for (node, ledger_id, leader, follower) in [
        (&alice, alice_irene, 7u64, 13u64),
        (&irene, alice_irene, 7, 13),
        (&irene, irene_bob, 7, 13),
        (&bob, irene_bob, 7, 13),
    ] {
        let info = node.get_ledger_channel(&ledger_id).unwrap();
        assert_eq!(info.balance.leader_balance, leader.into(), "{}", node.address());
        assert_eq!(info.balance.follower_balance, follower.into(), "{}", node.address());
    }

    let info = alice.get_payment_channel(&channel_id).unwrap();
    assert_eq!(info.status, ChannelStatus::Complete);
    assert_eq!(info.balance.paid_so_far, 3.into());

    for node in [alice, irene, bob] {
        node.shutdown().await.unwrap();
    }
}

#[tokio::test]
async fn payment_channel_needs_ledgers() {
    let net = Network::new();
    let alice = net.node(21);
    let irene = net.node(22);
    let bob = net.node(23);

    let result = alice
        .create_payment_channel(
            vec![irene.address()],
            bob.address(),
            60,
            outcome(alice.address(), 1, bob.address(), 0),
        )
        .await;
    assert!(result.is_err());

    for node in [alice, irene, bob] {
        node.shutdown().await.unwrap();
    }
}
