//! The reconciliation pipeline.
//!
//! A [`Reconciler`] periodically scans for divergence between local state
//! and the ledger: it drains the ledger's event stream into the market
//! mirror, evaluates vote tallies, and stages [`CommitIntent`]s for any
//! side effect owed to the ledger. Staged intents are submitted with
//! bounded retries and exponential backoff; intents the ledger rejects
//! outright land in a dead-letter table for operator inspection.
//!
//! Scans never overlap. A scheduled scan that finds the previous one
//! still running is skipped, not queued.

use std::{
    sync::{
        Arc,
        atomic::{AtomicBool, Ordering},
    },
    time::{Duration, SystemTime, UNIX_EPOCH},
};

use fallible_iterator::FallibleIterator;
use heed::types::SerdeBincode;
use serde::{Deserialize, Serialize};
use sneed::{DatabaseUnique, Env, RwTxn, UnitKey};
use thiserror::Error;
use tokio_util::{sync::CancellationToken, task::AbortOnDropHandle};
use tracing::{debug, info, warn};
use transitive::Transitive;

use crate::{
    config::{self, Config},
    ledger::{
        self, CommitIntent, Event, EventKind, Instruction, IntentAction,
        IntentKey, Ledger, Transition,
    },
    state::{
        self, Market, MarketState, Quoter, State,
        voting::{Ballot, VoteKind, VoteTally},
    },
    types::{MarketId, Timestamp, TxRef},
};

/// Submission delays are capped at one hour regardless of attempt count.
const MAX_RETRY_DELAY_SECS: u64 = 3_600;

#[derive(Debug, Error, Transitive)]
#[transitive(from(sneed::db::error::Error, sneed::Error))]
#[transitive(from(sneed::db::error::IterInit, sneed::db::error::Error))]
#[transitive(from(sneed::db::error::IterItem, sneed::db::error::Error))]
#[transitive(from(sneed::db::error::Delete, sneed::db::error::Error))]
#[transitive(from(sneed::db::error::Put, sneed::db::error::Error))]
#[transitive(from(sneed::db::error::TryGet, sneed::db::error::Error))]
#[transitive(from(sneed::env::error::Error, sneed::Error))]
#[transitive(from(sneed::env::error::CreateDb, sneed::env::error::Error))]
#[transitive(from(sneed::env::error::OpenEnv, sneed::env::error::Error))]
#[transitive(from(sneed::env::error::ReadTxn, sneed::env::error::Error))]
#[transitive(from(sneed::env::error::WriteTxn, sneed::env::error::Error))]
#[transitive(from(sneed::rwtxn::error::Error, sneed::Error))]
#[transitive(from(sneed::rwtxn::error::Commit, sneed::rwtxn::error::Error))]
pub enum Error {
    #[error(transparent)]
    Config(#[from] config::Error),
    #[error(transparent)]
    Db(#[from] sneed::Error),
    #[error(transparent)]
    State(#[from] state::Error),
}

/// Pending commit slots are keyed by market and action; the epoch lives
/// inside the intent so a newer snapshot can supersede in place.
type Slot = (MarketId, IntentAction);

#[derive(Clone, Debug, Deserialize, Serialize)]
pub struct PendingCommit {
    pub intent: CommitIntent,
    pub attempts: u32,
    pub next_attempt_at: Timestamp,
    pub last_error: Option<String>,
}

#[derive(Clone, Debug, Deserialize, Serialize)]
pub struct DeadLetter {
    pub intent: CommitIntent,
    pub attempts: u32,
    pub reason: String,
    pub dead_at: Timestamp,
}

#[derive(Clone)]
struct Dbs {
    /// Highest event sequence number mirrored so far.
    cursor: DatabaseUnique<UnitKey, SerdeBincode<u64>>,
    /// Sequence number of every mirrored transaction, for dedup.
    seen: DatabaseUnique<SerdeBincode<TxRef>, SerdeBincode<u64>>,
    pending: DatabaseUnique<SerdeBincode<Slot>, SerdeBincode<PendingCommit>>,
    dead: DatabaseUnique<SerdeBincode<Slot>, SerdeBincode<DeadLetter>>,
}

impl Dbs {
    const NUM_DBS: u32 = 4;

    fn new(env: &Env, rwtxn: &mut RwTxn) -> Result<Self, Error> {
        let cursor = DatabaseUnique::create(env, rwtxn, "event_cursor")?;
        let seen = DatabaseUnique::create(env, rwtxn, "mirrored_txs")?;
        let pending = DatabaseUnique::create(env, rwtxn, "pending_commits")?;
        let dead = DatabaseUnique::create(env, rwtxn, "dead_letters")?;
        Ok(Self {
            cursor,
            seen,
            pending,
            dead,
        })
    }
}

/// What one scan did, for logging and tests.
#[derive(Clone, Copy, Debug, Default)]
pub struct ScanReport {
    pub events_mirrored: usize,
    pub intents_staged: usize,
    pub submitted: usize,
    pub retried: usize,
    pub dead_lettered: usize,
    /// True if the scan was skipped because another was in flight.
    pub skipped: bool,
}

pub struct Reconciler {
    env: Env,
    state: State,
    dbs: Dbs,
    ledger: Arc<dyn Ledger>,
    config: Config,
    scan_in_flight: AtomicBool,
}

impl Reconciler {
    pub const NUM_DBS: u32 = State::NUM_DBS + Dbs::NUM_DBS;

    pub fn new(
        env: Env,
        ledger: Arc<dyn Ledger>,
        config: Config,
    ) -> Result<Self, Error> {
        config.validate()?;
        let state = State::new(&env)?;
        let dbs = {
            let mut rwtxn = env.write_txn()?;
            let dbs = Dbs::new(&env, &mut rwtxn)?;
            rwtxn.commit()?;
            dbs
        };
        Ok(Self {
            env,
            state,
            dbs,
            ledger,
            config,
            scan_in_flight: AtomicBool::new(false),
        })
    }

    pub fn state(&self) -> &State {
        &self.state
    }

    pub fn config(&self) -> &Config {
        &self.config
    }

    pub fn quoter(&self) -> Quoter<'_> {
        Quoter::new(&self.config)
    }

    /// Records a ballot in the local voting books.
    pub fn submit_ballot(&self, ballot: &Ballot) -> Result<VoteTally, Error> {
        let mut rwtxn = self.env.write_txn()?;
        let tally = self.state.voting().submit_ballot(&mut rwtxn, ballot)?;
        rwtxn.commit()?;
        Ok(tally)
    }

    /// Mirrored view of a market, possibly behind the ledger.
    pub fn market(&self, id: &MarketId) -> Result<Option<Market>, Error> {
        let rotxn = self.env.read_txn()?;
        Ok(self.state.markets().try_get(&rotxn, id)?)
    }

    pub fn pending_commits(&self) -> Result<Vec<PendingCommit>, Error> {
        let rotxn = self.env.read_txn()?;
        let mut pending = Vec::new();
        let mut iter = self.dbs.pending.iter(&rotxn)?;
        while let Some((_, entry)) = iter.next()? {
            pending.push(entry);
        }
        Ok(pending)
    }

    pub fn dead_letters(&self) -> Result<Vec<DeadLetter>, Error> {
        let rotxn = self.env.read_txn()?;
        let mut dead = Vec::new();
        let mut iter = self.dbs.dead.iter(&rotxn)?;
        while let Some((_, entry)) = iter.next()? {
            dead.push(entry);
        }
        Ok(dead)
    }

    /// Runs one reconciliation scan: mirror, stage, submit.
    pub async fn scan(&self, now: Timestamp) -> Result<ScanReport, Error> {
        if self.scan_in_flight.swap(true, Ordering::AcqRel) {
            debug!("scan already in flight, skipping");
            return Ok(ScanReport {
                skipped: true,
                ..ScanReport::default()
            });
        }
        let result = self.scan_inner(now).await;
        self.scan_in_flight.store(false, Ordering::Release);
        result
    }

    async fn scan_inner(&self, now: Timestamp) -> Result<ScanReport, Error> {
        let mut report = ScanReport::default();

        let cursor = {
            let rotxn = self.env.read_txn()?;
            self.dbs.cursor.try_get(&rotxn, &())?.unwrap_or(0)
        };
        let events = match self.ledger.events_since(cursor).await {
            Ok(events) => events,
            Err(err) => {
                // Mirroring can wait for the next scan; staged commits
                // are still worth submitting.
                warn!(%err, cursor, "failed to pull ledger events");
                Vec::new()
            }
        };

        // The write txn must be closed out before the first await below;
        // LMDB transactions cannot cross threads.
        {
            let mut rwtxn = self.env.write_txn()?;
            for event in &events {
                if self.dbs.seen.try_get(&rwtxn, &event.tx_ref)?.is_some() {
                    debug!(tx_ref = %event.tx_ref, "event already mirrored");
                    continue;
                }
                self.mirror_event(&mut rwtxn, event, now)?;
                self.dbs.seen.put(&mut rwtxn, &event.tx_ref, &event.seq)?;
                self.dbs.cursor.put(&mut rwtxn, &(), &event.seq)?;
                report.events_mirrored += 1;
            }

            for intent in self
                .state
                .voting()
                .evaluate_all(&mut rwtxn, &self.config, now)?
            {
                self.stage(&mut rwtxn, intent, now, &mut report)?;
            }
            self.stage_auto_finalizations(&mut rwtxn, now, &mut report)?;
            rwtxn.commit()?;
        }

        self.submit_due(now, &mut report).await?;
        Ok(report)
    }

    /// Applies one confirmed ledger event to the local mirror.
    fn mirror_event(
        &self,
        rwtxn: &mut RwTxn,
        event: &Event,
        now: Timestamp,
    ) -> Result<(), Error> {
        let markets = self.state.markets();
        match &event.kind {
            EventKind::MarketCreated { b } => {
                markets.put(
                    rwtxn,
                    &Market::new(event.market, *b, event.at),
                )?;
            }
            EventKind::TradeExecuted {
                raw_amount,
                fee_protocol,
                fee_resolver,
                fee_lp,
                is_buy,
                new_q_yes,
                new_q_no,
                ..
            } => {
                let Some(mut market) = markets.try_get(rwtxn, &event.market)?
                else {
                    warn!(market = %event.market, "trade event for unknown market");
                    return Ok(());
                };
                market.q_yes = *new_q_yes;
                market.q_no = *new_q_no;
                market.total_volume =
                    market.total_volume.saturating_add(*raw_amount);
                market.protocol_fees =
                    market.protocol_fees.saturating_add(*fee_protocol);
                market.resolver_fees =
                    market.resolver_fees.saturating_add(*fee_resolver);
                market.lp_fees = market.lp_fees.saturating_add(*fee_lp);
                market.current_liquidity = if *is_buy {
                    market.current_liquidity.saturating_add(*raw_amount)
                } else {
                    market.current_liquidity.saturating_sub(*raw_amount)
                };
                markets.put(rwtxn, &market)?;
            }
            EventKind::VotesAggregated {
                kind,
                passed,
                new_state,
                ..
            } => {
                if let Some(mut market) =
                    markets.try_get(rwtxn, &event.market)?
                {
                    market.state = *new_state;
                    match kind {
                        VoteKind::Proposal if *passed => {
                            market.approved_at = Some(event.at);
                        }
                        VoteKind::Proposal => {}
                        VoteKind::Dispute => {
                            let proposed = market.proposed_outcome;
                            market.final_outcome = proposed.map(|outcome| {
                                if *passed {
                                    outcome.opposite()
                                } else {
                                    outcome
                                }
                            });
                            market.finalized_at = Some(event.at);
                        }
                    }
                    markets.put(rwtxn, &market)?;
                } else {
                    warn!(market = %event.market, "vote event for unknown market");
                }
                // A failed proposal vote leaves the market Proposed and
                // its tally open for further ballots. Only an
                // aggregation that moved the market closes the books,
                // whether we submitted it or another node did.
                let transitioned = match kind {
                    VoteKind::Proposal => *passed,
                    VoteKind::Dispute => true,
                };
                if transitioned {
                    self.state.voting().retire(
                        rwtxn,
                        event.market,
                        *kind,
                        event.tx_ref,
                        now,
                    )?;
                    self.dbs.pending.delete(
                        rwtxn,
                        &(event.market, IntentAction::from(*kind)),
                    )?;
                }
            }
            EventKind::MarketTransitioned {
                to,
                outcome,
                seeded_liquidity,
                ..
            } => {
                let Some(mut market) = markets.try_get(rwtxn, &event.market)?
                else {
                    warn!(market = %event.market, "transition event for unknown market");
                    return Ok(());
                };
                market.state = *to;
                match to {
                    MarketState::Active => {
                        let seeded = seeded_liquidity.unwrap_or(0);
                        market.initial_liquidity = seeded;
                        market.current_liquidity = seeded;
                        market.activated_at = Some(event.at);
                    }
                    MarketState::Resolving => {
                        market.proposed_outcome = *outcome;
                        market.resolution_proposed_at = Some(event.at);
                    }
                    MarketState::Disputed => {
                        market.was_disputed = true;
                        market.dispute_initiated_at = Some(event.at);
                    }
                    MarketState::Finalized => {
                        market.final_outcome =
                            outcome.or(market.proposed_outcome);
                        market.finalized_at = Some(event.at);
                        // Another node may have finalized first.
                        self.dbs.pending.delete(
                            rwtxn,
                            &(event.market, IntentAction::AutoFinalize),
                        )?;
                    }
                    MarketState::Proposed | MarketState::Approved => {}
                }
                markets.put(rwtxn, &market)?;
            }
            EventKind::WinningsClaimed { shares, .. } => {
                let Some(mut market) = markets.try_get(rwtxn, &event.market)?
                else {
                    warn!(market = %event.market, "claim event for unknown market");
                    return Ok(());
                };
                match market.apply_claim(*shares) {
                    Ok(_) => markets.put(rwtxn, &market)?,
                    Err(err) => {
                        warn!(
                            market = %event.market,
                            %err,
                            "claim event does not apply to mirrored market"
                        );
                    }
                }
            }
            EventKind::LiquidityWithdrawn { .. } => {
                let Some(mut market) = markets.try_get(rwtxn, &event.market)?
                else {
                    warn!(market = %event.market, "withdrawal event for unknown market");
                    return Ok(());
                };
                match market.apply_withdraw_liquidity() {
                    Ok(_) => markets.put(rwtxn, &market)?,
                    Err(err) => {
                        warn!(
                            market = %event.market,
                            %err,
                            "withdrawal event does not apply to mirrored market"
                        );
                    }
                }
            }
        }
        debug!(
            tx_ref = %event.tx_ref,
            seq = event.seq,
            market = %event.market,
            "mirrored ledger event"
        );
        Ok(())
    }

    /// Stages intents finalizing markets whose dispute window has lapsed.
    fn stage_auto_finalizations(
        &self,
        rwtxn: &mut RwTxn,
        now: Timestamp,
        report: &mut ScanReport,
    ) -> Result<(), Error> {
        let resolving = self.state.markets().resolving(rwtxn)?;
        for market in resolving {
            if !market.can_finalize_automatically(
                self.config.dispute_window_secs,
                now,
            ) {
                continue;
            }
            let intent = CommitIntent {
                key: IntentKey {
                    market: market.id,
                    action: IntentAction::AutoFinalize,
                    // One resolution attempt per market at a time, so
                    // its proposal time versions the intent.
                    epoch: market.resolution_proposed_at.unwrap_or(0),
                },
                instruction: Instruction::TransitionMarket {
                    market: market.id,
                    transition: Transition::AutoFinalize,
                },
                created_at: now,
            };
            self.stage(rwtxn, intent, now, report)?;
        }
        Ok(())
    }

    fn stage(
        &self,
        rwtxn: &mut RwTxn,
        intent: CommitIntent,
        now: Timestamp,
        report: &mut ScanReport,
    ) -> Result<(), Error> {
        let slot = (intent.key.market, intent.key.action);
        if self.dbs.dead.try_get(rwtxn, &slot)?.is_some() {
            warn!(
                market = %intent.key.market,
                action = %intent.key.action,
                "slot is dead-lettered, refusing to stage"
            );
            return Ok(());
        }
        if let Some(existing) = self.dbs.pending.try_get(rwtxn, &slot)? {
            if existing.intent.key.epoch >= intent.key.epoch {
                return Ok(());
            }
            debug!(
                market = %intent.key.market,
                action = %intent.key.action,
                old_epoch = existing.intent.key.epoch,
                new_epoch = intent.key.epoch,
                "superseding pending commit"
            );
        }
        info!(
            market = %intent.key.market,
            action = %intent.key.action,
            epoch = intent.key.epoch,
            "staged commit intent"
        );
        self.dbs.pending.put(
            rwtxn,
            &slot,
            &PendingCommit {
                intent,
                attempts: 0,
                next_attempt_at: now,
                last_error: None,
            },
        )?;
        report.intents_staged += 1;
        Ok(())
    }

    /// Submits every pending commit that is due, applying retry and
    /// dead-letter policy to the outcomes.
    async fn submit_due(
        &self,
        now: Timestamp,
        report: &mut ScanReport,
    ) -> Result<(), Error> {
        let due: Vec<(Slot, PendingCommit)> = {
            let rotxn = self.env.read_txn()?;
            let mut due = Vec::new();
            let mut iter = self.dbs.pending.iter(&rotxn)?;
            while let Some((slot, entry)) = iter.next()? {
                if entry.next_attempt_at <= now {
                    due.push((slot, entry));
                }
            }
            due
        };
        if due.is_empty() {
            return Ok(());
        }

        let timeout = Duration::from_secs(self.config.submit_timeout_secs);
        let mut outcomes = Vec::with_capacity(due.len());
        for (slot, entry) in due {
            let result = match tokio::time::timeout(
                timeout,
                self.ledger.submit(entry.intent.instruction),
            )
            .await
            {
                Ok(result) => result,
                Err(_) => Err(ledger::Error::Timeout {
                    secs: self.config.submit_timeout_secs,
                }),
            };
            outcomes.push((slot, entry, result));
        }

        let mut rwtxn = self.env.write_txn()?;
        for (slot, entry, result) in outcomes {
            match result {
                Ok(tx_ref) => {
                    info!(
                        market = %slot.0,
                        action = %slot.1,
                        %tx_ref,
                        "commit confirmed"
                    );
                    self.dbs.pending.delete(&mut rwtxn, &slot)?;
                    if let Some(kind) = vote_kind(slot.1) {
                        self.state
                            .voting()
                            .retire(&mut rwtxn, slot.0, kind, tx_ref, now)?;
                    }
                    report.submitted += 1;
                }
                Err(ledger::Error::Stale { reason }) => {
                    // The ledger state disagrees with the snapshot this
                    // intent was built against. Drop it; the mirror
                    // catches up on the next event drain.
                    info!(
                        market = %slot.0,
                        action = %slot.1,
                        reason,
                        "commit superseded by ledger state, dropping"
                    );
                    self.dbs.pending.delete(&mut rwtxn, &slot)?;
                    // If the tally is still live it must be allowed to
                    // emit again once the mirrored state permits; a
                    // tally another node committed gets retired on the
                    // acknowledging event instead.
                    if let Some(kind) = vote_kind(slot.1) {
                        self.state
                            .voting()
                            .reset_emission(&mut rwtxn, slot.0, kind)?;
                    }
                }
                Err(err)
                    if err.is_transient()
                        && entry.attempts + 1
                            < self.config.max_commit_attempts =>
                {
                    let attempts = entry.attempts + 1;
                    let delay = retry_delay(
                        self.config.retry_base_delay_secs,
                        attempts,
                    );
                    warn!(
                        market = %slot.0,
                        action = %slot.1,
                        attempts,
                        delay_secs = delay,
                        %err,
                        "commit failed, will retry"
                    );
                    self.dbs.pending.put(
                        &mut rwtxn,
                        &slot,
                        &PendingCommit {
                            intent: entry.intent,
                            attempts,
                            next_attempt_at: now + delay,
                            last_error: Some(err.to_string()),
                        },
                    )?;
                    report.retried += 1;
                }
                Err(err) => {
                    let attempts = entry.attempts + 1;
                    warn!(
                        market = %slot.0,
                        action = %slot.1,
                        attempts,
                        %err,
                        "commit dead-lettered"
                    );
                    self.dbs.pending.delete(&mut rwtxn, &slot)?;
                    self.dbs.dead.put(
                        &mut rwtxn,
                        &slot,
                        &DeadLetter {
                            intent: entry.intent,
                            attempts,
                            reason: err.to_string(),
                            dead_at: now,
                        },
                    )?;
                    report.dead_lettered += 1;
                }
            }
        }
        rwtxn.commit()?;
        Ok(())
    }

    /// Spawns the periodic scan loop. Dropping the handle aborts it.
    pub fn spawn(self: Arc<Self>) -> ReconcilerHandle {
        let cancel = CancellationToken::new();
        let token = cancel.clone();
        let task = tokio::spawn(async move {
            let mut interval = tokio::time::interval(Duration::from_secs(
                self.config.scan_interval_secs,
            ));
            interval.set_missed_tick_behavior(
                tokio::time::MissedTickBehavior::Delay,
            );
            loop {
                tokio::select! {
                    () = token.cancelled() => {
                        info!("reconciler shutting down");
                        break;
                    }
                    _ = interval.tick() => {
                        match self.scan(unix_now()).await {
                            Ok(report) if report.skipped => {}
                            Ok(report) => {
                                debug!(?report, "scan complete");
                            }
                            Err(err) => {
                                warn!(%err, "scan failed");
                            }
                        }
                    }
                }
            }
        });
        ReconcilerHandle {
            cancel,
            task: AbortOnDropHandle::new(task),
        }
    }
}

pub struct ReconcilerHandle {
    cancel: CancellationToken,
    task: AbortOnDropHandle<()>,
}

impl ReconcilerHandle {
    pub async fn shutdown(self) {
        self.cancel.cancel();
        if let Err(err) = self.task.await {
            warn!(%err, "reconciler task join failed");
        }
    }
}

fn vote_kind(action: IntentAction) -> Option<VoteKind> {
    match action {
        IntentAction::ProposalVotes => Some(VoteKind::Proposal),
        IntentAction::DisputeVotes => Some(VoteKind::Dispute),
        IntentAction::AutoFinalize => None,
    }
}

fn retry_delay(base_secs: u64, attempts: u32) -> u64 {
    let shift = attempts.saturating_sub(1).min(6);
    base_secs
        .saturating_mul(1 << shift)
        .min(MAX_RETRY_DELAY_SECS)
}

fn unix_now() -> Timestamp {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|elapsed| elapsed.as_secs())
        .unwrap_or_default()
}
