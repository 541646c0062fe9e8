//! End-to-end reconciliation tests against the in-process ledger.

use std::sync::Arc;

use predmarket::{
    Config, Reconciler,
    ledger::{
        Error as LedgerError, Instruction, Ledger, MemoryLedger, Transition,
    },
    math::{PRECISION, lmsr::Engine},
    state::{Ballot, MarketState, VoteKind},
    types::{MarketId, Outcome, AccountId},
};
use sneed::Env;
use tempfile::TempDir;

const B: u64 = 100 * PRECISION;

fn open_env(dir: &TempDir) -> Env {
    let mut opts = heed::EnvOpenOptions::new();
    opts.map_size(64 * 1024 * 1024)
        .max_dbs(Reconciler::NUM_DBS);
    unsafe { Env::open(&opts, dir.path()) }.expect("open env")
}

fn setup() -> (TempDir, Arc<MemoryLedger>, Reconciler) {
    let dir = tempfile::tempdir().expect("tempdir");
    let env = open_env(&dir);
    let ledger = Arc::new(MemoryLedger::new(Config::default()));
    let reconciler =
        Reconciler::new(env, ledger.clone(), Config::default()).expect("node");
    (dir, ledger, reconciler)
}

fn market_id(byte: u8) -> MarketId {
    MarketId([byte; 32])
}

fn ballot(market: MarketId, voter: u8, kind: VoteKind, approve: bool) -> Ballot {
    Ballot {
        market,
        kind,
        voter: AccountId([voter; 20]),
        approve,
        cast_at: 0,
    }
}

async fn propose(ledger: &MemoryLedger, id: MarketId) {
    ledger
        .submit(Instruction::TransitionMarket {
            market: id,
            transition: Transition::Propose { b: B },
        })
        .await
        .expect("propose");
}

#[tokio::test]
async fn full_market_lifecycle() {
    let (_dir, ledger, node) = setup();
    let config = node.config().clone();
    let id = market_id(1);

    ledger.set_time(1_000);
    propose(&ledger, id).await;

    // First scan mirrors the creation.
    let report = node.scan(1_000).await.unwrap();
    assert_eq!(report.events_mirrored, 1);
    let mirrored = node.market(&id).unwrap().expect("mirrored");
    assert_eq!(mirrored.state, MarketState::Proposed);
    assert_eq!(mirrored.b, B);

    // 7 of 10 voters approve the proposal.
    for voter in 0..10 {
        node.submit_ballot(&ballot(id, voter, VoteKind::Proposal, voter < 7))
            .unwrap();
    }
    let report = node.scan(1_100).await.unwrap();
    assert_eq!(report.intents_staged, 1);
    assert_eq!(report.submitted, 1);
    assert_eq!(ledger.market(&id).unwrap().state, MarketState::Approved);

    // Mirror catches up and the tally is retired.
    let report = node.scan(1_200).await.unwrap();
    assert_eq!(report.events_mirrored, 1);
    assert_eq!(
        node.market(&id).unwrap().unwrap().state,
        MarketState::Approved
    );
    let err = node
        .submit_ballot(&ballot(id, 99, VoteKind::Proposal, true))
        .unwrap_err();
    assert!(err.to_string().contains("closed"));

    // Activate with bounded-loss collateral and trade.
    let seeded = Engine::new(PRECISION).max_loss(B).unwrap();
    ledger
        .submit(Instruction::TransitionMarket {
            market: id,
            transition: Transition::Activate {
                seeded_liquidity: seeded,
            },
        })
        .await
        .unwrap();
    ledger
        .submit(Instruction::ExecuteTrade {
            market: id,
            trader: AccountId([7; 20]),
            side: Outcome::Yes,
            shares: 10 * PRECISION,
            is_buy: true,
            limit: None,
        })
        .await
        .unwrap();
    node.scan(1_300).await.unwrap();
    let mirrored = node.market(&id).unwrap().unwrap();
    assert_eq!(mirrored.state, MarketState::Active);
    assert_eq!(mirrored.q_yes, 10 * PRECISION);
    assert!(mirrored.total_volume > 0);
    assert!(mirrored.protocol_fees > 0);

    // Resolve YES after the minimum trading duration.
    ledger.advance_time(config.min_trading_duration_secs);
    ledger
        .submit(Instruction::TransitionMarket {
            market: id,
            transition: Transition::ProposeResolution {
                outcome: Outcome::Yes,
                resolver: AccountId([42; 20]),
            },
        })
        .await
        .unwrap();
    let resolved_at = ledger.time();
    node.scan(resolved_at).await.unwrap();
    assert_eq!(
        node.market(&id).unwrap().unwrap().state,
        MarketState::Resolving
    );

    // Before the window lapses nothing is staged.
    let report = node
        .scan(resolved_at + config.dispute_window_secs - 1)
        .await
        .unwrap();
    assert_eq!(report.intents_staged, 0);

    // Once it lapses the node finalizes the market itself.
    ledger.set_time(resolved_at + config.dispute_window_secs);
    let report = node
        .scan(resolved_at + config.dispute_window_secs)
        .await
        .unwrap();
    assert_eq!(report.intents_staged, 1);
    assert_eq!(report.submitted, 1);
    let settled = ledger.market(&id).unwrap();
    assert_eq!(settled.state, MarketState::Finalized);
    assert_eq!(settled.final_outcome, Some(Outcome::Yes));
    assert!(!settled.was_disputed);

    // And the mirror converges.
    node.scan(resolved_at + config.dispute_window_secs + 1)
        .await
        .unwrap();
    let mirrored = node.market(&id).unwrap().unwrap();
    assert_eq!(mirrored.state, MarketState::Finalized);
    assert_eq!(mirrored.final_outcome, Some(Outcome::Yes));

    // The winning trader redeems and the provider withdraws; the mirror
    // picks up both settlement events.
    ledger
        .submit(Instruction::ClaimWinnings {
            market: id,
            trader: AccountId([7; 20]),
        })
        .await
        .unwrap();
    ledger
        .submit(Instruction::WithdrawLiquidity { market: id })
        .await
        .unwrap();
    node.scan(resolved_at + config.dispute_window_secs + 2)
        .await
        .unwrap();
    let mirrored = node.market(&id).unwrap().unwrap();
    assert_eq!(mirrored.claimed_shares, 10 * PRECISION);
    assert!(mirrored.liquidity_withdrawn);
    assert_eq!(mirrored.current_liquidity, 0);
}

#[tokio::test]
async fn dispute_overturns_resolution() {
    let (_dir, ledger, node) = setup();
    let config = node.config().clone();
    let id = market_id(2);

    propose(&ledger, id).await;
    for voter in 0..10 {
        node.submit_ballot(&ballot(id, voter, VoteKind::Proposal, voter < 8))
            .unwrap();
    }
    node.scan(10).await.unwrap();
    let seeded = Engine::new(PRECISION).max_loss(B).unwrap();
    ledger
        .submit(Instruction::TransitionMarket {
            market: id,
            transition: Transition::Activate {
                seeded_liquidity: seeded,
            },
        })
        .await
        .unwrap();
    ledger.advance_time(config.min_trading_duration_secs);
    ledger
        .submit(Instruction::TransitionMarket {
            market: id,
            transition: Transition::ProposeResolution {
                outcome: Outcome::Yes,
                resolver: AccountId([42; 20]),
            },
        })
        .await
        .unwrap();
    ledger.advance_time(10);
    ledger
        .submit(Instruction::TransitionMarket {
            market: id,
            transition: Transition::Dispute,
        })
        .await
        .unwrap();
    let now = ledger.time();
    node.scan(now).await.unwrap();
    assert_eq!(
        node.market(&id).unwrap().unwrap().state,
        MarketState::Disputed
    );

    // 3 of 5 dispute voters vote to overturn: 60% meets the bar.
    for voter in 0..5 {
        node.submit_ballot(&ballot(id, voter, VoteKind::Dispute, voter < 3))
            .unwrap();
    }
    let report = node.scan(now + 1).await.unwrap();
    assert_eq!(report.submitted, 1);
    let settled = ledger.market(&id).unwrap();
    assert_eq!(settled.state, MarketState::Finalized);
    // YES was proposed; the successful dispute flips it to NO.
    assert_eq!(settled.final_outcome, Some(Outcome::No));

    node.scan(now + 2).await.unwrap();
    let mirrored = node.market(&id).unwrap().unwrap();
    assert_eq!(mirrored.final_outcome, Some(Outcome::No));
    assert!(mirrored.was_disputed);
}

#[tokio::test]
async fn repeated_scans_mirror_each_event_once() {
    let (_dir, ledger, node) = setup();
    let id = market_id(3);
    propose(&ledger, id).await;

    let report = node.scan(0).await.unwrap();
    assert_eq!(report.events_mirrored, 1);
    for now in 1..4 {
        let report = node.scan(now).await.unwrap();
        assert_eq!(report.events_mirrored, 0);
        assert_eq!(report.intents_staged, 0);
    }
}

#[tokio::test]
async fn transient_failure_retries_with_backoff() {
    let (_dir, ledger, node) = setup();
    let config = node.config().clone();
    let id = market_id(4);
    propose(&ledger, id).await;
    node.scan(0).await.unwrap();

    for voter in 0..10 {
        node.submit_ballot(&ballot(id, voter, VoteKind::Proposal, true))
            .unwrap();
    }
    ledger.inject_failure(LedgerError::Transient {
        reason: "connection reset".into(),
    });
    let report = node.scan(100).await.unwrap();
    assert_eq!(report.intents_staged, 1);
    assert_eq!(report.retried, 1);
    assert_eq!(report.submitted, 0);

    let pending = node.pending_commits().unwrap();
    assert_eq!(pending.len(), 1);
    assert_eq!(pending[0].attempts, 1);
    let due_at = 100 + config.retry_base_delay_secs;
    assert_eq!(pending[0].next_attempt_at, due_at);

    // Not due yet: nothing is submitted, and no second intent appears.
    let report = node.scan(due_at - 1).await.unwrap();
    assert_eq!(report.intents_staged, 0);
    assert_eq!(report.submitted, 0);
    assert_eq!(report.retried, 0);

    // Due: the retry goes through exactly once.
    let report = node.scan(due_at).await.unwrap();
    assert_eq!(report.submitted, 1);
    assert!(node.pending_commits().unwrap().is_empty());
    assert_eq!(ledger.market(&id).unwrap().state, MarketState::Approved);
}

#[tokio::test]
async fn rejected_commit_is_dead_lettered() {
    let (_dir, ledger, node) = setup();
    let id = market_id(5);
    propose(&ledger, id).await;
    node.scan(0).await.unwrap();

    for voter in 0..10 {
        node.submit_ballot(&ballot(id, voter, VoteKind::Proposal, true))
            .unwrap();
    }
    ledger.inject_failure(LedgerError::Rejected {
        reason: "instruction malformed".into(),
    });
    let report = node.scan(100).await.unwrap();
    assert_eq!(report.dead_lettered, 1);
    assert!(node.pending_commits().unwrap().is_empty());

    let dead = node.dead_letters().unwrap();
    assert_eq!(dead.len(), 1);
    assert!(dead[0].reason.contains("malformed"));

    // The dead slot refuses restaging even as new ballots arrive.
    node.submit_ballot(&ballot(id, 10, VoteKind::Proposal, true))
        .unwrap();
    let report = node.scan(200).await.unwrap();
    assert_eq!(report.intents_staged, 0);
    assert!(node.pending_commits().unwrap().is_empty());
}

#[tokio::test]
async fn new_ballots_supersede_pending_snapshot() {
    let (_dir, ledger, node) = setup();
    let id = market_id(6);
    propose(&ledger, id).await;
    node.scan(0).await.unwrap();

    for voter in 0..10 {
        node.submit_ballot(&ballot(id, voter, VoteKind::Proposal, true))
            .unwrap();
    }
    // Keep the first snapshot stuck in pending.
    ledger.inject_failure(LedgerError::Transient {
        reason: "timeout".into(),
    });
    node.scan(100).await.unwrap();
    assert_eq!(node.pending_commits().unwrap().len(), 1);

    // An eleventh ballot bumps the epoch; the slot is replaced, not doubled.
    node.submit_ballot(&ballot(id, 10, VoteKind::Proposal, true))
        .unwrap();
    ledger.inject_failure(LedgerError::Transient {
        reason: "timeout".into(),
    });
    let report = node.scan(101).await.unwrap();
    assert_eq!(report.intents_staged, 1);
    // Superseding resets the retry clock, so the fresh intent was due
    // immediately and took the injected failure.
    assert_eq!(report.retried, 1);
    let pending = node.pending_commits().unwrap();
    assert_eq!(pending.len(), 1);
    assert_eq!(pending[0].intent.key.epoch, 11);
    assert_eq!(pending[0].attempts, 1);

    let report = node.scan(101 + 30).await.unwrap();
    assert_eq!(report.submitted, 1);
    assert!(node.pending_commits().unwrap().is_empty());
    let aggregated = ledger.market(&id).unwrap();
    assert_eq!(aggregated.state, MarketState::Approved);
    assert!(matches!(
        ledger.events_since(0).await.unwrap().last().unwrap().kind,
        predmarket::ledger::EventKind::VotesAggregated { affirmative: 11, .. }
    ));
}

/// Delegates to a [`MemoryLedger`] after a fixed delay, to hold a scan
/// open while another is attempted.
struct SlowLedger {
    inner: Arc<MemoryLedger>,
    delay: std::time::Duration,
}

impl Ledger for SlowLedger {
    fn submit(
        &self,
        instruction: Instruction,
    ) -> futures::future::BoxFuture<
        '_,
        Result<predmarket::types::TxRef, LedgerError>,
    > {
        Box::pin(async move {
            tokio::time::sleep(self.delay).await;
            self.inner.submit(instruction).await
        })
    }

    fn events_since(
        &self,
        after: u64,
    ) -> futures::future::BoxFuture<
        '_,
        Result<Vec<predmarket::ledger::Event>, LedgerError>,
    > {
        Box::pin(async move {
            tokio::time::sleep(self.delay).await;
            self.inner.events_since(after).await
        })
    }
}

#[tokio::test]
async fn overlapping_scan_is_skipped() {
    let dir = tempfile::tempdir().expect("tempdir");
    let env = open_env(&dir);
    let memory = Arc::new(MemoryLedger::new(Config::default()));
    let slow = Arc::new(SlowLedger {
        inner: memory.clone(),
        delay: std::time::Duration::from_millis(200),
    });
    let node = Arc::new(
        Reconciler::new(env, slow, Config::default()).expect("node"),
    );
    propose(&memory, market_id(8)).await;

    let background = {
        let node = node.clone();
        tokio::spawn(async move { node.scan(0).await })
    };
    // Let the first scan reach its slow event pull, then race it.
    tokio::time::sleep(std::time::Duration::from_millis(50)).await;
    let report = node.scan(1).await.unwrap();
    assert!(report.skipped);
    assert_eq!(report.events_mirrored, 0);

    let report = background.await.unwrap().unwrap();
    assert!(!report.skipped);
    assert_eq!(report.events_mirrored, 1);
}

#[tokio::test]
async fn ledger_outage_does_not_block_submission() {
    let (_dir, ledger, node) = setup();
    let id = market_id(7);
    propose(&ledger, id).await;
    node.scan(0).await.unwrap();
    for voter in 0..10 {
        node.submit_ballot(&ballot(id, voter, VoteKind::Proposal, true))
            .unwrap();
    }
    // events_since is served from memory and cannot fail here, but a
    // failed submit must leave the staged intent durable for later.
    ledger.inject_failure(LedgerError::Timeout { secs: 20 });
    let report = node.scan(100).await.unwrap();
    assert_eq!(report.retried, 1);
    let pending = node.pending_commits().unwrap();
    assert_eq!(pending.len(), 1);
    assert!(pending[0].last_error.as_deref().unwrap().contains("timed out"));
}

#[tokio::test]
async fn spawned_loop_mirrors_and_shuts_down() {
    let (_dir, ledger, node) = setup();
    let id = market_id(9);
    propose(&ledger, id).await;

    // The interval's first tick fires immediately, so one scan runs
    // before the shutdown below.
    let node = Arc::new(node);
    let handle = node.clone().spawn();
    tokio::time::sleep(std::time::Duration::from_millis(100)).await;
    handle.shutdown().await;

    let mirrored = node.market(&id).unwrap().expect("mirrored");
    assert_eq!(mirrored.state, MarketState::Proposed);
}

#[tokio::test]
async fn stale_dropped_aggregation_reemits_when_state_permits() {
    let (_dir, ledger, node) = setup();
    let config = node.config().clone();
    let id = market_id(10);

    propose(&ledger, id).await;
    node.scan(0).await.unwrap();
    for voter in 0..10 {
        node.submit_ballot(&ballot(id, voter, VoteKind::Proposal, true))
            .unwrap();
    }
    node.scan(10).await.unwrap();
    let seeded = Engine::new(PRECISION).max_loss(B).unwrap();
    ledger
        .submit(Instruction::TransitionMarket {
            market: id,
            transition: Transition::Activate {
                seeded_liquidity: seeded,
            },
        })
        .await
        .unwrap();
    ledger.advance_time(config.min_trading_duration_secs);
    ledger
        .submit(Instruction::TransitionMarket {
            market: id,
            transition: Transition::ProposeResolution {
                outcome: Outcome::Yes,
                resolver: AccountId([42; 20]),
            },
        })
        .await
        .unwrap();
    let now = ledger.time();
    node.scan(now).await.unwrap();
    assert_eq!(
        node.market(&id).unwrap().unwrap().state,
        MarketState::Resolving
    );

    // The dispute tally crosses while the market is still Resolving.
    // The submitted aggregation bounces as stale and the slot drains.
    for voter in 0..5 {
        node.submit_ballot(&ballot(id, voter, VoteKind::Dispute, voter < 3))
            .unwrap();
    }
    let report = node.scan(now + 1).await.unwrap();
    assert_eq!(report.intents_staged, 1);
    assert_eq!(report.submitted, 0);
    assert!(node.pending_commits().unwrap().is_empty());

    // The dispute transition lands afterwards.
    ledger
        .submit(Instruction::TransitionMarket {
            market: id,
            transition: Transition::Dispute,
        })
        .await
        .unwrap();

    // The tally is still live, so the next scan emits it again and the
    // aggregation settles the dispute.
    let report = node.scan(now + 2).await.unwrap();
    assert_eq!(report.intents_staged, 1);
    assert_eq!(report.submitted, 1);
    let settled = ledger.market(&id).unwrap();
    assert_eq!(settled.state, MarketState::Finalized);
    assert_eq!(settled.final_outcome, Some(Outcome::No));
}

#[tokio::test]
async fn failing_aggregation_keeps_tally_open() {
    let (_dir, ledger, node) = setup();
    let id = market_id(11);
    propose(&ledger, id).await;
    node.scan(0).await.unwrap();

    // Three local ballots, short of the ten-vote floor.
    for voter in 0..3 {
        node.submit_ballot(&ballot(id, voter, VoteKind::Proposal, true))
            .unwrap();
    }
    // Another node aggregates a failing count: ten votes, 30 percent.
    ledger
        .submit(Instruction::AggregateVotes {
            market: id,
            kind: VoteKind::Proposal,
            affirmative: 3,
            negative: 7,
            epoch: 1,
        })
        .await
        .unwrap();
    node.scan(10).await.unwrap();
    assert_eq!(
        node.market(&id).unwrap().unwrap().state,
        MarketState::Proposed
    );

    // The market stayed Proposed, so the local tally must remain open
    // for further ballots.
    for voter in 3..10 {
        node.submit_ballot(&ballot(id, voter, VoteKind::Proposal, true))
            .unwrap();
    }
    let report = node.scan(20).await.unwrap();
    assert_eq!(report.intents_staged, 1);
    assert_eq!(report.submitted, 1);
    assert_eq!(ledger.market(&id).unwrap().state, MarketState::Approved);
}

#[tokio::test]
async fn unacknowledged_finalize_is_not_restaged() {
    let (_dir, ledger, node) = setup();
    let config = node.config().clone();
    let id = market_id(12);

    propose(&ledger, id).await;
    node.scan(0).await.unwrap();
    for voter in 0..10 {
        node.submit_ballot(&ballot(id, voter, VoteKind::Proposal, true))
            .unwrap();
    }
    node.scan(10).await.unwrap();
    let seeded = Engine::new(PRECISION).max_loss(B).unwrap();
    ledger
        .submit(Instruction::TransitionMarket {
            market: id,
            transition: Transition::Activate {
                seeded_liquidity: seeded,
            },
        })
        .await
        .unwrap();
    ledger.advance_time(config.min_trading_duration_secs);
    ledger
        .submit(Instruction::TransitionMarket {
            market: id,
            transition: Transition::ProposeResolution {
                outcome: Outcome::Yes,
                resolver: AccountId([42; 20]),
            },
        })
        .await
        .unwrap();
    let resolved_at = ledger.time();
    node.scan(resolved_at).await.unwrap();

    // The window lapses but the submission fails, so the intent stays
    // pending awaiting its retry.
    let due = resolved_at + config.dispute_window_secs;
    ledger.set_time(due);
    ledger.inject_failure(LedgerError::Transient {
        reason: "connection reset".into(),
    });
    let report = node.scan(due).await.unwrap();
    assert_eq!(report.intents_staged, 1);
    assert_eq!(report.retried, 1);

    // The market is still Resolving on the next scan; the pending slot
    // absorbs the re-evaluation instead of staging a duplicate.
    let report = node.scan(due + 1).await.unwrap();
    assert_eq!(report.intents_staged, 0);
    let pending = node.pending_commits().unwrap();
    assert_eq!(pending.len(), 1);
    assert_eq!(pending[0].attempts, 1);

    // The retry clears the slot once it falls due.
    let report = node.scan(due + config.retry_base_delay_secs).await.unwrap();
    assert_eq!(report.submitted, 1);
    assert!(node.pending_commits().unwrap().is_empty());
    assert_eq!(ledger.market(&id).unwrap().state, MarketState::Finalized);
}
