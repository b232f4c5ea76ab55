mod common;

use common::{all_complete, funds, outcome, Network};
use nitro::{query::ChannelStatus, Destination};

#[tokio::test]
async fn fund_and_defund_ledger_channel() {
    let net = Network::new();
    let alice = net.node(1);
    let bob = net.node(2);

    let id = alice
        .create_ledger_channel(bob.address(), 60, outcome(alice.address(), 100, bob.address(), 100))
        .await
        .unwrap();
    all_complete(&[&alice, &bob], &id).await;

    let channel_id = id.channel_id();
    assert_eq!(net.chain.holdings(&channel_id), funds(200));
    for node in [&alice, &bob] {
        let info = node.get_ledger_channel(&channel_id).unwrap();
        assert_eq!(info.status, ChannelStatus::Open);
        assert_eq!(info.balance.leader, Destination::from(alice.address()));
        assert_eq!(info.balance.leader_balance, 100.into());
        assert_eq!(info.balance.follower_balance, 100.into());
    }

    // A second ledger channel with the same counterparty is refused.
    assert!(alice
        .create_ledger_channel(bob.address(), 60, outcome(alice.address(), 1, bob.address(), 1))
        .await
        .is_err());

    let close = bob.close_ledger_channel(channel_id).await.unwrap();
    all_complete(&[&bob, &alice], &close).await;

    assert!(net.chain.holdings(&channel_id).is_zero());
    assert_eq!(net.chain.balance_of(&alice.address()), funds(100));
    assert_eq!(net.chain.balance_of(&bob.address()), funds(100));
    assert_eq!(
        alice.get_ledger_channel(&channel_id).unwrap().status,
        ChannelStatus::Complete
    );

    alice.shutdown().await.unwrap();
    bob.shutdown().await.unwrap();
}

#[tokio::test]
async fn closing_unknown_ledger_fails() {
    let net = Network::new();
    let alice = net.node(3);
    assert!(alice
        .close_ledger_channel(Destination([9; 32]))
        .await
        .is_err());
    alice.shutdown().await.unwrap();
}
