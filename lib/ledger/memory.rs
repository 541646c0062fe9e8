//! An in-process ledger for tests and local development.
//!
//! Executes instructions against its own market records under a single
//! lock, assigning each confirmed transaction the next sequence number.
//! This is the authoritative side of the boundary; the node only ever
//! sees it through the [`Ledger`] trait.

use std::{
    collections::{HashMap, VecDeque, hash_map::DefaultHasher},
    hash::{Hash, Hasher},
    sync::atomic::{AtomicU64, Ordering},
};

use futures::future::BoxFuture;
use parking_lot::Mutex;

use crate::{
    config::Config,
    ledger::{
        Error, Event, EventKind, Instruction, Ledger, Position, Transition,
    },
    math::lmsr::Engine,
    state::{self, Market},
    types::{MarketId, Timestamp, TxRef, AccountId},
};

pub struct MemoryLedger {
    inner: Mutex<Inner>,
    /// Errors to return from upcoming submissions, oldest first.
    fail_queue: Mutex<VecDeque<Error>>,
    now: AtomicU64,
    engine: Engine,
    config: Config,
}

struct Inner {
    markets: HashMap<MarketId, Market>,
    positions: HashMap<(MarketId, AccountId), Position>,
    events: Vec<Event>,
}

impl MemoryLedger {
    pub fn new(config: Config) -> Self {
        let engine = Engine::new(config.min_liquidity_parameter);
        Self {
            inner: Mutex::new(Inner {
                markets: HashMap::new(),
                positions: HashMap::new(),
                events: Vec::new(),
            }),
            fail_queue: Mutex::new(VecDeque::new()),
            now: AtomicU64::new(0),
            engine,
            config,
        }
    }

    pub fn set_time(&self, now: Timestamp) {
        self.now.store(now, Ordering::SeqCst);
    }

    pub fn advance_time(&self, secs: u64) {
        self.now.fetch_add(secs, Ordering::SeqCst);
    }

    pub fn time(&self) -> Timestamp {
        self.now.load(Ordering::SeqCst)
    }

    /// Queues an error to be returned by an upcoming `submit` call.
    pub fn inject_failure(&self, error: Error) {
        self.fail_queue.lock().push_back(error);
    }

    /// Snapshot of a market's authoritative record.
    pub fn market(&self, id: &MarketId) -> Option<Market> {
        self.inner.lock().markets.get(id).cloned()
    }

    pub fn event_count(&self) -> u64 {
        self.inner.lock().events.len() as u64
    }

    /// Snapshot of a trader's holdings on a market.
    pub fn position(
        &self,
        market: &MarketId,
        trader: &AccountId,
    ) -> Option<Position> {
        self.inner.lock().positions.get(&(*market, *trader)).copied()
    }

    fn apply(
        &self,
        inner: &mut Inner,
        instruction: Instruction,
        now: Timestamp,
    ) -> Result<EventKind, state::Error> {
        match instruction {
            Instruction::TransitionMarket { market, transition } => {
                match transition {
                    Transition::Propose { b } => {
                        if inner.markets.contains_key(&market) {
                            return Err(state::Error::MarketAlreadyExists {
                                market,
                            });
                        }
                        self.engine.check_b(b)?;
                        inner
                            .markets
                            .insert(market, Market::new(market, b, now));
                        Ok(EventKind::MarketCreated { b })
                    }
                    Transition::Activate { seeded_liquidity } => {
                        let record = market_mut(inner, market)?;
                        let from = record.state;
                        record.apply_activate(
                            seeded_liquidity,
                            &self.engine,
                            now,
                        )?;
                        Ok(EventKind::MarketTransitioned {
                            from,
                            to: record.state,
                            outcome: None,
                            seeded_liquidity: Some(seeded_liquidity),
                        })
                    }
                    Transition::ProposeResolution { outcome, resolver } => {
                        let record = market_mut(inner, market)?;
                        let from = record.state;
                        record.apply_propose_resolution(
                            outcome,
                            resolver,
                            &self.config,
                            now,
                        )?;
                        Ok(EventKind::MarketTransitioned {
                            from,
                            to: record.state,
                            outcome: Some(outcome),
                            seeded_liquidity: None,
                        })
                    }
                    Transition::Dispute => {
                        let record = market_mut(inner, market)?;
                        let from = record.state;
                        record.apply_dispute(&self.config, now)?;
                        Ok(EventKind::MarketTransitioned {
                            from,
                            to: record.state,
                            outcome: None,
                            seeded_liquidity: None,
                        })
                    }
                    Transition::AutoFinalize => {
                        let record = market_mut(inner, market)?;
                        let from = record.state;
                        record.apply_auto_finalize(&self.config, now)?;
                        Ok(EventKind::MarketTransitioned {
                            from,
                            to: record.state,
                            outcome: record.final_outcome,
                            seeded_liquidity: None,
                        })
                    }
                }
            }
            Instruction::ExecuteTrade {
                market,
                trader,
                side,
                shares,
                is_buy,
                limit,
            } => {
                if !is_buy {
                    let have = inner
                        .positions
                        .get(&(market, trader))
                        .map_or(0, |pos| pos.side(side));
                    if shares > have {
                        return Err(state::Error::InsufficientShares {
                            market,
                            side,
                            have,
                            want: shares,
                        });
                    }
                }
                let record = market_mut(inner, market)?;
                let exec = record.apply_trade(
                    side,
                    shares,
                    is_buy,
                    limit,
                    &self.engine,
                    &self.config,
                )?;
                let pos =
                    inner.positions.entry((market, trader)).or_default();
                if is_buy {
                    *pos.side_mut(side) += shares;
                } else {
                    *pos.side_mut(side) -= shares;
                }
                Ok(EventKind::TradeExecuted {
                    trader,
                    side,
                    shares,
                    is_buy,
                    raw_amount: exec.raw_amount,
                    fee_protocol: exec.fees.protocol,
                    fee_resolver: exec.fees.resolver,
                    fee_lp: exec.fees.lp,
                    new_q_yes: exec.new_q_yes,
                    new_q_no: exec.new_q_no,
                })
            }
            Instruction::ClaimWinnings { market, trader } => {
                let pos = *inner
                    .positions
                    .get(&(market, trader))
                    .ok_or(state::Error::NoPosition {
                        market,
                        account: trader,
                    })?;
                if pos.claimed {
                    return Err(state::Error::AlreadyClaimed {
                        market,
                        account: trader,
                    });
                }
                let record = market_mut(inner, market)?;
                let outcome = record.final_outcome.ok_or(
                    state::Error::MarketNotSettled {
                        market,
                        state: record.state,
                    },
                )?;
                let shares = pos.side(outcome);
                if shares == 0 {
                    return Err(state::Error::NothingToClaim {
                        market,
                        account: trader,
                    });
                }
                let payout = record.apply_claim(shares)?;
                if let Some(pos) = inner.positions.get_mut(&(market, trader))
                {
                    pos.claimed = true;
                }
                Ok(EventKind::WinningsClaimed {
                    trader,
                    shares,
                    payout,
                })
            }
            Instruction::WithdrawLiquidity { market } => {
                let record = market_mut(inner, market)?;
                let amount = record.apply_withdraw_liquidity()?;
                Ok(EventKind::LiquidityWithdrawn { amount })
            }
            Instruction::AggregateVotes {
                market,
                kind,
                affirmative,
                negative,
                epoch,
            } => {
                let record = market_mut(inner, market)?;
                let agg = record.apply_votes(
                    kind,
                    affirmative,
                    negative,
                    &self.config,
                    now,
                )?;
                Ok(EventKind::VotesAggregated {
                    kind,
                    affirmative,
                    negative,
                    epoch,
                    passed: agg.passed,
                    new_state: agg.new_state,
                })
            }
        }
    }
}

fn market_mut(
    inner: &mut Inner,
    market: MarketId,
) -> Result<&mut Market, state::Error> {
    inner
        .markets
        .get_mut(&market)
        .ok_or(state::Error::MarketNotFound { market })
}

/// Guard failures against a superseded snapshot read as stale, the rest
/// as outright rejections.
fn reject(err: state::Error) -> Error {
    match err {
        state::Error::InvalidStateTransition { .. }
        | state::Error::MarketNotTradable { .. }
        | state::Error::DisputeWindowClosed { .. }
        | state::Error::DisputeWindowOpen { .. }
        | state::Error::AlreadyClaimed { .. }
        | state::Error::LiquidityAlreadyWithdrawn { .. } => Error::Stale {
            reason: err.to_string(),
        },
        _ => Error::Rejected {
            reason: err.to_string(),
        },
    }
}

fn tx_ref(seq: u64, instruction: &Instruction) -> TxRef {
    let mut hasher = DefaultHasher::new();
    seq.hash(&mut hasher);
    if let Ok(bytes) = borsh::to_vec(instruction) {
        bytes.hash(&mut hasher);
    }
    let digest = hasher.finish();
    let mut bytes = [0u8; 32];
    bytes[..8].copy_from_slice(&seq.to_be_bytes());
    bytes[8..16].copy_from_slice(&digest.to_be_bytes());
    TxRef(bytes)
}

impl Ledger for MemoryLedger {
    fn submit(
        &self,
        instruction: Instruction,
    ) -> BoxFuture<'_, Result<TxRef, Error>> {
        Box::pin(async move {
            if let Some(err) = self.fail_queue.lock().pop_front() {
                return Err(err);
            }
            let now = self.time();
            let mut inner = self.inner.lock();
            let kind =
                self.apply(&mut inner, instruction, now).map_err(reject)?;
            let seq = inner.events.len() as u64 + 1;
            let tx_ref = tx_ref(seq, &instruction);
            inner.events.push(Event {
                tx_ref,
                seq,
                market: instruction.market(),
                at: now,
                kind,
            });
            Ok(tx_ref)
        })
    }

    fn events_since(
        &self,
        after: u64,
    ) -> BoxFuture<'_, Result<Vec<Event>, Error>> {
        Box::pin(async move {
            let inner = self.inner.lock();
            let events = inner
                .events
                .iter()
                .filter(|event| event.seq > after)
                .cloned()
                .collect();
            Ok(events)
        })
    }
}
