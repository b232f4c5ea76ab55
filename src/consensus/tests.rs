use proptest::prelude::*;

use super::*;
use crate::{
    channel::state::tests::{signers, test_state},
    channel::Exit,
    types::U256,
};

pub(crate) fn signed_vars(fixed: &FixedPart, vars: Vars, a: &Signer, b: &Signer) -> SignedVars {
    let scratch = ConsensusChannel {
        id: fixed.channel_id(),
        my_index: Role::Leader,
        on_chain_funding: Funds::default(),
        fixed: fixed.clone(),
        current: SignedVars {
            vars: vars.clone(),
            signatures: [Signature::default(); 2],
        },
        proposal_queue: Vec::new(),
    };
    let state = scratch.state_for(&vars);
    SignedVars {
        signatures: [state.sign(a).unwrap(), state.sign(b).unwrap()],
        vars,
    }
}

/// Leader and follower views of a freshly funded ledger between `a` and `b`.
pub(crate) fn ledger_pair(
    a: &Signer,
    b: &Signer,
    leader_amount: u64,
    follower_amount: u64,
) -> (ConsensusChannel, ConsensusChannel) {
    let fixed = test_state(a.address(), b.address()).fixed_part();
    let outcome = LedgerOutcome::new(
        Address::default(),
        Balance::new(a.address().into(), leader_amount.into()),
        Balance::new(b.address().into(), follower_amount.into()),
    );
    let current = signed_vars(&fixed, Vars { turn_num: 1, outcome }, a, b);
    let mut funding = Funds::new();
    funding.set(Address::default(), (leader_amount + follower_amount).into());

    let leader =
        ConsensusChannel::new(fixed.clone(), Role::Leader, current.clone(), funding.clone())
            .unwrap();
    let follower = ConsensusChannel::new(fixed, Role::Follower, current, funding).unwrap();
    (leader, follower)
}

fn guarantee(ledger: &ConsensusChannel, target: u8, amount: u64) -> Guarantee {
    Guarantee::new(
        amount.into(),
        Destination([target; 32]),
        ledger.leader().into(),
        ledger.follower().into(),
    )
}

fn add(ledger: &ConsensusChannel, target: u8, amount: u64, left: u64) -> Proposal {
    Proposal::add(ledger.id, Add::new(guarantee(ledger, target, amount), left.into()))
}

#[test]
fn add_round_trip_converges() {
    let (a, b) = signers();
    let (mut leader, mut follower) = ledger_pair(&a, &b, 50, 50);
    let proposal = add(&leader, 0xee, 10, 4);

    let sp = leader.propose(proposal.clone(), &a).unwrap();
    assert_eq!(sp.turn_num, 2);
    assert_eq!(leader.proposal_queue().len(), 1);

    follower.follower_receive(sp).unwrap();
    let countersigned = follower.sign_next_proposal(&proposal, &b).unwrap();
    assert!(follower.proposal_queue().is_empty());

    leader.leader_receive(countersigned).unwrap();
    assert!(leader.proposal_queue().is_empty());
    assert_eq!(leader.current(), follower.current());

    let outcome = &leader.consensus_vars().outcome;
    assert_eq!(outcome.leader.amount, 46.into());
    assert_eq!(outcome.follower.amount, 44.into());
    assert_eq!(outcome.guarantees.len(), 1);
    assert_eq!(outcome.total().unwrap(), 100.into());
    assert!(leader.includes(&guarantee(&leader, 0xee, 10)));
    assert!(leader.supported_signed_state().unwrap().has_all_signatures());
}

#[test]
fn remove_round_trip_converges() {
    let (a, b) = signers();
    let (mut leader, mut follower) = ledger_pair(&a, &b, 50, 50);
    let target = Destination([0xee; 32]);

    let funding = add(&leader, 0xee, 10, 4);
    follower
        .follower_receive(leader.propose(funding.clone(), &a).unwrap())
        .unwrap();
    let added = follower.sign_next_proposal(&funding, &b).unwrap();
    leader.leader_receive(added.clone()).unwrap();

    let payout = Proposal::remove(leader.id, Remove::new(target, 1.into()));
    follower
        .follower_receive(leader.propose(payout.clone(), &a).unwrap())
        .unwrap();
    let removed = follower.sign_next_proposal(&payout, &b).unwrap();
    leader.leader_receive(removed.clone()).unwrap();

    assert_eq!(leader.current(), follower.current());
    assert_eq!(leader.consensus_turn_num(), 3);
    let outcome = &follower.consensus_vars().outcome;
    assert!(!outcome.includes_target(&target));
    assert_eq!(outcome.leader.amount, 47.into());
    assert_eq!(outcome.follower.amount, 53.into());
    assert!(follower.supported_signed_state().unwrap().has_all_signatures());

    // Redelivered countersignatures are older than the consensus.
    let settled = leader.clone();
    leader.leader_receive(added).unwrap();
    leader.leader_receive(removed).unwrap();
    assert_eq!(leader, settled);
}

#[test]
fn overflowing_amounts_are_errors() {
    let (a, b) = signers();
    let (leader, _) = ledger_pair(&a, &b, 50, 50);
    let mut vars = leader.consensus_vars().clone();
    let g = guarantee(&leader, 1, 10);
    vars.add(&Add::new(g, 5.into())).unwrap();

    vars.outcome.leader.amount = U256::MAX;
    let before = vars.clone();
    assert!(matches!(
        vars.remove(&Remove::new(g.target, 5.into())),
        Err(ConsensusError::Overflow)
    ));
    assert_eq!(vars, before);
    assert!(matches!(vars.outcome.total(), Err(ConsensusError::Overflow)));
}

#[test]
fn roles_are_enforced() {
    let (a, b) = signers();
    let (mut leader, mut follower) = ledger_pair(&a, &b, 50, 50);
    let proposal = add(&leader, 1, 10, 5);

    assert!(matches!(
        follower.propose(proposal.clone(), &b),
        Err(ConsensusError::NotLeader)
    ));
    let sp = leader.propose(proposal.clone(), &a).unwrap();
    assert!(matches!(
        leader.follower_receive(sp.clone()),
        Err(ConsensusError::NotFollower)
    ));
    assert!(matches!(
        leader.sign_next_proposal(&proposal, &a),
        Err(ConsensusError::NotFollower)
    ));
}

#[test]
fn proposal_for_other_ledger_is_rejected() {
    let (a, b) = signers();
    let (mut leader, _) = ledger_pair(&a, &b, 50, 50);
    let mut proposal = add(&leader, 1, 10, 5);
    proposal.ledger_id = Destination([9; 32]);
    assert!(matches!(
        leader.propose(proposal, &a),
        Err(ConsensusError::IncorrectChannelId { .. })
    ));
}

#[test]
fn follower_rejects_out_of_order_and_forged_proposals() {
    let (a, b) = signers();
    let (mut leader, mut follower) = ledger_pair(&a, &b, 50, 50);
    let _first = leader.propose(add(&leader, 1, 10, 5), &a).unwrap();
    let second = leader.propose(add(&leader, 2, 10, 5), &a).unwrap();

    assert!(matches!(
        follower.follower_receive(second),
        Err(ConsensusError::InvalidTurnNum {
            expected: 2,
            got: 3
        })
    ));
    assert!(follower.proposal_queue().is_empty());

    // Signed by the follower key instead of the leader.
    let mut forged_by = follower.clone();
    forged_by.my_index = Role::Leader;
    let forged = forged_by.propose(add(&leader, 1, 10, 5), &b).unwrap();
    assert!(matches!(
        follower.follower_receive(forged),
        Err(ConsensusError::InvalidProposalSignature)
    ));
    assert!(follower.proposal_queue().is_empty());
}

#[test]
fn leader_ignores_stale_and_rejects_wrong_signer() {
    let (a, b) = signers();
    let (mut leader, mut follower) = ledger_pair(&a, &b, 50, 50);
    let proposal = add(&leader, 1, 10, 5);
    let sp = leader.propose(proposal.clone(), &a).unwrap();

    let mut stale = sp.clone();
    stale.turn_num = 1;
    let before = leader.clone();
    leader.leader_receive(stale).unwrap();
    assert_eq!(leader, before);

    // Our own signature where the follower's is expected.
    assert!(matches!(
        leader.leader_receive(sp.clone()),
        Err(ConsensusError::WrongSigner)
    ));
    assert_eq!(leader, before);

    follower.follower_receive(sp).unwrap();
    let mut countersigned = follower.sign_next_proposal(&proposal, &b).unwrap();
    countersigned.turn_num = 5;
    assert!(matches!(
        leader.leader_receive(countersigned),
        Err(ConsensusError::ProposalQueueExhausted(5))
    ));
}

#[test]
fn leader_merges_a_prefix_of_its_queue() {
    let (a, b) = signers();
    let (mut leader, mut follower) = ledger_pair(&a, &b, 50, 50);
    let first = add(&leader, 1, 10, 5);
    let second = add(&leader, 2, 20, 10);

    follower
        .follower_receive(leader.propose(first.clone(), &a).unwrap())
        .unwrap();
    follower
        .follower_receive(leader.propose(second.clone(), &a).unwrap())
        .unwrap();
    assert_eq!(follower.proposal_queue().len(), 2);

    let g1 = guarantee(&leader, 1, 10);
    let g2 = guarantee(&leader, 2, 20);
    assert!(follower.is_proposed(&g2).unwrap());
    assert!(!follower.is_proposed_next(&g2).unwrap());
    assert!(follower.is_proposed_next(&g1).unwrap());

    assert!(matches!(
        follower.sign_next_proposal(&second, &b),
        Err(ConsensusError::NonMatchingProposals)
    ));
    let c1 = follower.sign_next_proposal(&first, &b).unwrap();
    leader.leader_receive(c1).unwrap();
    assert_eq!(leader.proposal_queue().len(), 1);
    assert_eq!(leader.consensus_turn_num(), 2);
    assert!(leader.includes(&g1));
    assert!(leader.is_proposed(&g2).unwrap());

    let c2 = follower.sign_next_proposal(&second, &b).unwrap();
    leader.leader_receive(c2).unwrap();
    assert_eq!(leader.current(), follower.current());
    assert_eq!(leader.funding_targets().len(), 2);
}

#[test]
fn non_consecutive_append_leaves_queue_untouched() {
    let (a, b) = signers();
    let (mut leader, _) = ledger_pair(&a, &b, 50, 50);
    let sp = leader.propose(add(&leader, 1, 10, 5), &a).unwrap();

    let mut gap = sp.clone();
    gap.turn_num = 4;
    let before = leader.proposal_queue().to_vec();
    assert!(matches!(
        leader.append_to_queue(gap),
        Err(ConsensusError::InvalidTurnNum {
            expected: 3,
            got: 4
        })
    ));
    assert_eq!(leader.proposal_queue(), before.as_slice());
}

#[test]
fn vars_reject_invalid_changes_without_mutation() {
    let (a, b) = signers();
    let (leader, _) = ledger_pair(&a, &b, 50, 50);
    let mut vars = leader.consensus_vars().clone();
    let before = vars.clone();

    let too_much_left = Add::new(guarantee(&leader, 1, 10), 11.into());
    assert!(matches!(
        vars.add(&too_much_left),
        Err(ConsensusError::InvalidDeposit)
    ));
    let broke = Add::new(guarantee(&leader, 1, 80), 10.into());
    assert!(matches!(
        vars.add(&broke),
        Err(ConsensusError::InsufficientFunds)
    ));
    assert_eq!(vars, before);

    vars.add(&Add::new(guarantee(&leader, 1, 10), 5.into()))
        .unwrap();
    let dup = Add::new(guarantee(&leader, 1, 10), 5.into());
    assert!(matches!(
        vars.add(&dup),
        Err(ConsensusError::DuplicateGuarantee(_))
    ));

    let missing = Remove::new(Destination([2; 32]), 0.into());
    assert!(matches!(
        vars.remove(&missing),
        Err(ConsensusError::GuaranteeNotFound(_))
    ));
    let overpaid = Remove::new(Destination([1; 32]), 11.into());
    assert!(matches!(
        vars.remove(&overpaid),
        Err(ConsensusError::InvalidAmount)
    ));
    assert_eq!(vars.turn_num, before.turn_num + 1);
}

#[test]
fn removal_queries() {
    let (a, b) = signers();
    let (mut leader, _) = ledger_pair(&a, &b, 50, 50);
    leader.propose(add(&leader, 1, 10, 5), &a).unwrap();
    let remove = Proposal::remove(leader.id, Remove::new(Destination([1; 32]), 5.into()));
    leader.propose(remove, &a).unwrap();

    let target = Destination([1; 32]);
    assert!(leader.has_removal_been_proposed(&target));
    assert!(!leader.has_removal_been_proposed_next(&target));
}

#[test]
fn ledger_outcome_exit_round_trip() {
    let (a, b) = signers();
    let (leader, _) = ledger_pair(&a, &b, 50, 50);
    let mut outcome = leader.consensus_vars().outcome.clone();
    let g = guarantee(&leader, 3, 7);
    outcome.guarantees.insert(g.target, g);

    let exit = outcome.as_exit();
    assert_eq!(exit.0[0].allocations.len(), 3);
    assert_eq!(LedgerOutcome::from_exit(&exit).unwrap(), outcome);
    assert!(LedgerOutcome::from_exit(&Exit::default()).is_err());
}

proptest! {
    #![proptest_config(ProptestConfig::with_cases(64))]

    #[test]
    fn add_then_remove_conserves_balances(amount in 0u64..=50, split in 0u64..=50) {
        let left = split.min(amount);
        let (a, b) = signers();
        let (leader, _) = ledger_pair(&a, &b, 50, 50);
        let mut vars = leader.consensus_vars().clone();
        let before = vars.outcome.clone();

        let g = guarantee(&leader, 1, amount);
        vars.add(&Add::new(g, left.into())).unwrap();
        prop_assert_eq!(vars.outcome.total().unwrap(), U256::from(100u64));
        vars.remove(&Remove::new(g.target, left.into())).unwrap();

        prop_assert_eq!(vars.outcome, before);
        prop_assert_eq!(vars.turn_num, leader.consensus_turn_num() + 2);
    }
}
