//! Market lifecycle and trade accounting.
//!
//! A [`Market`] is the authoritative record held by the ledger. The same
//! struct doubles as the node's read cache entry, mirrored from ledger
//! events by the reconciliation pipeline (see [`MarketsDatabase`]).
//!
//! All state changes go through `apply_*` methods so that every lifecycle
//! guard lives in exactly one place.

use borsh::{BorshDeserialize, BorshSerialize};
use fallible_iterator::FallibleIterator;
use heed::types::SerdeBincode;
use serde::{Deserialize, Serialize};
use sneed::{DatabaseUnique, Env, RoTxn, RwTxn};

use crate::{
    config::Config,
    ledger::Instruction,
    math::lmsr::{Engine, FeeBreakdown, fee_breakdown},
    state::Error,
    types::{MarketId, Outcome, Timestamp, AccountId},
};

/// Lifecycle states of a market.
///
/// ```text
/// Proposed -> Approved -> Active -> Resolving -> Finalized
///                                       |            ^
///                                       v            |
///                                    Disputed -------+
/// ```
#[derive(
    BorshDeserialize,
    BorshSerialize,
    Clone,
    Copy,
    Debug,
    Deserialize,
    Eq,
    Hash,
    PartialEq,
    Serialize,
    strum::Display,
)]
pub enum MarketState {
    Proposed,
    Approved,
    Active,
    Resolving,
    Disputed,
    Finalized,
}

impl MarketState {
    /// Whether a direct transition to `target` is legal.
    pub fn can_transition_to(self, target: MarketState) -> bool {
        use MarketState::*;
        matches!(
            (self, target),
            (Proposed, Approved)
                | (Approved, Active)
                | (Active, Resolving)
                | (Resolving, Disputed)
                | (Resolving, Finalized)
                | (Disputed, Finalized)
        )
    }

    /// Trading is only permitted while a market is `Active`.
    pub fn allows_trading(self) -> bool {
        matches!(self, MarketState::Active)
    }

    /// Finalized markets accept no further instructions.
    pub fn is_terminal(self) -> bool {
        matches!(self, MarketState::Finalized)
    }
}

/// Result of applying a trade, echoed into the ledger event.
#[derive(Clone, Copy, Debug)]
pub struct TradeExecution {
    pub raw_amount: u64,
    pub fees: FeeBreakdown,
    /// Amount charged to (buy) or paid out to (sell) the trader.
    pub total: u64,
    pub new_q_yes: u64,
    pub new_q_no: u64,
}

/// Result of applying a vote aggregation.
#[derive(Clone, Copy, Debug)]
pub struct VoteAggregation {
    pub passed: bool,
    pub new_state: MarketState,
}

/// The full market record.
#[derive(
    BorshDeserialize,
    BorshSerialize,
    Clone,
    Debug,
    Deserialize,
    Eq,
    PartialEq,
    Serialize,
)]
pub struct Market {
    pub id: MarketId,
    pub state: MarketState,
    /// LMSR liquidity parameter, fixed-point.
    pub b: u64,
    pub q_yes: u64,
    pub q_no: u64,
    /// Collateral seeded at activation, fixed-point.
    pub initial_liquidity: u64,
    /// Collateral currently backing outstanding shares.
    pub current_liquidity: u64,
    /// Cumulative raw (pre-fee) trade volume.
    pub total_volume: u64,
    pub protocol_fees: u64,
    pub resolver_fees: u64,
    pub lp_fees: u64,
    /// Winning shares redeemed so far on a finalized market.
    pub claimed_shares: u64,
    pub liquidity_withdrawn: bool,
    pub proposed_outcome: Option<Outcome>,
    pub resolver: Option<AccountId>,
    pub final_outcome: Option<Outcome>,
    pub was_disputed: bool,
    pub created_at: Timestamp,
    pub approved_at: Option<Timestamp>,
    pub activated_at: Option<Timestamp>,
    pub resolution_proposed_at: Option<Timestamp>,
    pub dispute_initiated_at: Option<Timestamp>,
    pub finalized_at: Option<Timestamp>,
}

impl Market {
    pub fn new(id: MarketId, b: u64, created_at: Timestamp) -> Self {
        Self {
            id,
            state: MarketState::Proposed,
            b,
            q_yes: 0,
            q_no: 0,
            initial_liquidity: 0,
            current_liquidity: 0,
            total_volume: 0,
            protocol_fees: 0,
            resolver_fees: 0,
            lp_fees: 0,
            claimed_shares: 0,
            liquidity_withdrawn: false,
            proposed_outcome: None,
            resolver: None,
            final_outcome: None,
            was_disputed: false,
            created_at,
            approved_at: None,
            activated_at: None,
            resolution_proposed_at: None,
            dispute_initiated_at: None,
            finalized_at: None,
        }
    }

    /// End of the dispute window, if a resolution has been proposed.
    pub fn dispute_window_end(&self, window_secs: u64) -> Option<Timestamp> {
        self.resolution_proposed_at
            .map(|at| at.saturating_add(window_secs))
    }

    /// An undisputed `Resolving` market whose dispute window has elapsed
    /// is eligible for automatic finalization.
    pub fn can_finalize_automatically(
        &self,
        window_secs: u64,
        now: Timestamp,
    ) -> bool {
        self.state == MarketState::Resolving
            && !self.was_disputed
            && self
                .dispute_window_end(window_secs)
                .is_some_and(|end| now >= end)
    }

    fn transition(&mut self, to: MarketState) -> Result<(), Error> {
        if !self.state.can_transition_to(to) {
            return Err(Error::InvalidStateTransition {
                market: self.id,
                from: self.state,
                to,
            });
        }
        self.state = to;
        Ok(())
    }

    /// `Approved -> Active`. The seeded collateral must cover the LMSR
    /// worst-case loss `b * ln(2)`.
    pub fn apply_activate(
        &mut self,
        seeded_liquidity: u64,
        engine: &Engine,
        now: Timestamp,
    ) -> Result<(), Error> {
        let required = engine.max_loss(self.b)?;
        if seeded_liquidity < required {
            return Err(Error::InsufficientLiquidity {
                market: self.id,
                required,
                provided: seeded_liquidity,
            });
        }
        self.transition(MarketState::Active)?;
        self.initial_liquidity = seeded_liquidity;
        self.current_liquidity = seeded_liquidity;
        self.activated_at = Some(now);
        Ok(())
    }

    /// Executes a buy or sell against the market's quantities.
    pub fn apply_trade(
        &mut self,
        side: Outcome,
        shares: u64,
        is_buy: bool,
        limit: Option<u64>,
        engine: &Engine,
        config: &Config,
    ) -> Result<TradeExecution, Error> {
        if !self.state.allows_trading() {
            return Err(Error::MarketNotTradable {
                market: self.id,
                state: self.state,
            });
        }
        if shares == 0 {
            return Err(Error::ZeroShares { market: self.id });
        }
        let raw = if is_buy {
            engine.buy_cost(self.q_yes, self.q_no, self.b, side, shares)?
        } else {
            let have = match side {
                Outcome::Yes => self.q_yes,
                Outcome::No => self.q_no,
            };
            if shares > have {
                return Err(Error::InsufficientShares {
                    market: self.id,
                    side,
                    have,
                    want: shares,
                });
            }
            engine.sell_proceeds(self.q_yes, self.q_no, self.b, side, shares)?
        };
        let fees = fee_breakdown(
            raw,
            config.fee_total_bps,
            config.fee_protocol_bps,
            config.fee_resolver_bps,
        )?;
        let total = if is_buy {
            let total = raw
                .checked_add(fees.total)
                .ok_or(crate::math::Error::ArithmeticOverflow)?;
            if let Some(limit) = limit {
                if total > limit {
                    return Err(Error::SlippageExceeded {
                        market: self.id,
                        total,
                        limit,
                    });
                }
            }
            total
        } else {
            // Fee bps sum below 10_000, so fees never exceed proceeds.
            let total = raw.saturating_sub(fees.total);
            if let Some(limit) = limit {
                if total < limit {
                    return Err(Error::SlippageExceeded {
                        market: self.id,
                        total,
                        limit,
                    });
                }
            }
            total
        };
        if is_buy {
            match side {
                Outcome::Yes => self.q_yes += shares,
                Outcome::No => self.q_no += shares,
            }
            self.current_liquidity = self
                .current_liquidity
                .checked_add(raw)
                .ok_or(crate::math::Error::ArithmeticOverflow)?;
        } else {
            match side {
                Outcome::Yes => self.q_yes -= shares,
                Outcome::No => self.q_no -= shares,
            }
            self.current_liquidity = self
                .current_liquidity
                .checked_sub(raw)
                .ok_or(crate::math::Error::ArithmeticOverflow)?;
        }
        self.total_volume = self.total_volume.saturating_add(raw);
        self.protocol_fees = self.protocol_fees.saturating_add(fees.protocol);
        self.resolver_fees = self.resolver_fees.saturating_add(fees.resolver);
        self.lp_fees = self.lp_fees.saturating_add(fees.lp);
        Ok(TradeExecution {
            raw_amount: raw,
            fees,
            total,
            new_q_yes: self.q_yes,
            new_q_no: self.q_no,
        })
    }

    /// Applies an aggregated proposal or dispute vote count.
    pub fn apply_votes(
        &mut self,
        kind: crate::state::voting::VoteKind,
        affirmative: u32,
        negative: u32,
        config: &Config,
        now: Timestamp,
    ) -> Result<VoteAggregation, Error> {
        use crate::state::voting::VoteKind;
        let total = u64::from(affirmative) + u64::from(negative);
        let affirmative_bps = if total == 0 {
            0
        } else {
            u64::from(affirmative) * 10_000 / total
        };
        match kind {
            VoteKind::Proposal => {
                if self.state != MarketState::Proposed {
                    return Err(Error::InvalidStateTransition {
                        market: self.id,
                        from: self.state,
                        to: MarketState::Approved,
                    });
                }
                let passed = total >= u64::from(config.min_proposal_votes)
                    && affirmative_bps
                        >= u64::from(config.proposal_approval_threshold_bps);
                if passed {
                    self.transition(MarketState::Approved)?;
                    self.approved_at = Some(now);
                }
                Ok(VoteAggregation {
                    passed,
                    new_state: self.state,
                })
            }
            VoteKind::Dispute => {
                if self.state != MarketState::Disputed {
                    return Err(Error::InvalidStateTransition {
                        market: self.id,
                        from: self.state,
                        to: MarketState::Finalized,
                    });
                }
                let proposed = self
                    .proposed_outcome
                    .ok_or(Error::NoResolutionProposed { market: self.id })?;
                let overturned = affirmative_bps
                    >= u64::from(config.dispute_threshold_bps);
                self.transition(MarketState::Finalized)?;
                self.final_outcome = Some(if overturned {
                    proposed.opposite()
                } else {
                    proposed
                });
                self.finalized_at = Some(now);
                Ok(VoteAggregation {
                    passed: overturned,
                    new_state: self.state,
                })
            }
        }
    }

    /// `Active -> Resolving` with a proposed outcome.
    pub fn apply_propose_resolution(
        &mut self,
        outcome: Outcome,
        resolver: AccountId,
        config: &Config,
        now: Timestamp,
    ) -> Result<(), Error> {
        let activated_at =
            self.activated_at.ok_or(Error::InvalidTimestamp)?;
        if now.saturating_sub(activated_at) < config.min_trading_duration_secs
        {
            return Err(Error::ResolutionTooEarly {
                market: self.id,
                min_trading_secs: config.min_trading_duration_secs,
            });
        }
        self.transition(MarketState::Resolving)?;
        self.proposed_outcome = Some(outcome);
        self.resolver = Some(resolver);
        self.resolution_proposed_at = Some(now);
        Ok(())
    }

    /// `Resolving -> Disputed`, only while the dispute window is open.
    pub fn apply_dispute(
        &mut self,
        config: &Config,
        now: Timestamp,
    ) -> Result<(), Error> {
        let end = self
            .dispute_window_end(config.dispute_window_secs)
            .ok_or(Error::NoResolutionProposed { market: self.id })?;
        if now >= end {
            return Err(Error::DisputeWindowClosed { market: self.id });
        }
        self.transition(MarketState::Disputed)?;
        self.was_disputed = true;
        self.dispute_initiated_at = Some(now);
        Ok(())
    }

    /// `Resolving -> Finalized` once the dispute window has elapsed
    /// without a dispute. The proposed outcome becomes final.
    pub fn apply_auto_finalize(
        &mut self,
        config: &Config,
        now: Timestamp,
    ) -> Result<(), Error> {
        let proposed = self
            .proposed_outcome
            .ok_or(Error::NoResolutionProposed { market: self.id })?;
        let end = self
            .dispute_window_end(config.dispute_window_secs)
            .ok_or(Error::NoResolutionProposed { market: self.id })?;
        if now < end {
            return Err(Error::DisputeWindowOpen { market: self.id });
        }
        self.transition(MarketState::Finalized)?;
        self.final_outcome = Some(proposed);
        self.finalized_at = Some(now);
        Ok(())
    }

    /// Redeems `shares` winning shares at one unit of collateral each on
    /// a finalized market. Returns the payout and debits the pool.
    pub fn apply_claim(&mut self, shares: u64) -> Result<u64, Error> {
        let outcome = self.final_outcome.ok_or(Error::MarketNotSettled {
            market: self.id,
            state: self.state,
        })?;
        if shares == 0 {
            return Err(Error::ZeroShares { market: self.id });
        }
        let winning_q = match outcome {
            Outcome::Yes => self.q_yes,
            Outcome::No => self.q_no,
        };
        // Every winning share is backed: the pool never drops below the
        // LMSR cost function, which never drops below the larger side.
        let remaining = winning_q.saturating_sub(self.claimed_shares);
        if shares > remaining {
            return Err(Error::InsufficientShares {
                market: self.id,
                side: outcome,
                have: remaining,
                want: shares,
            });
        }
        self.current_liquidity = self.current_liquidity.saturating_sub(shares);
        self.claimed_shares += shares;
        Ok(shares)
    }

    /// Returns the pool's residual collateral plus accrued lp fees to
    /// the liquidity provider, keeping back one unit per unclaimed
    /// winning share.
    pub fn apply_withdraw_liquidity(&mut self) -> Result<u64, Error> {
        let outcome = self.final_outcome.ok_or(Error::MarketNotSettled {
            market: self.id,
            state: self.state,
        })?;
        if self.liquidity_withdrawn {
            return Err(Error::LiquidityAlreadyWithdrawn { market: self.id });
        }
        let winning_q = match outcome {
            Outcome::Yes => self.q_yes,
            Outcome::No => self.q_no,
        };
        let reserved = winning_q.saturating_sub(self.claimed_shares);
        let residual = self.current_liquidity.saturating_sub(reserved);
        let amount = residual.saturating_add(self.lp_fees);
        self.current_liquidity = reserved;
        self.lp_fees = 0;
        self.liquidity_withdrawn = true;
        Ok(amount)
    }
}

/// A priced trade ready for ledger submission.
#[derive(Clone, Debug)]
pub struct TradeQuote {
    pub market: MarketId,
    pub side: Outcome,
    pub shares: u64,
    /// LMSR cost (buy) or proceeds (sell) before fees, fixed-point.
    pub raw_amount: u64,
    pub fees: FeeBreakdown,
    /// Total charged (buy) or paid out (sell) after fees.
    pub total: u64,
    pub price_yes_after: u64,
    pub instruction: Instruction,
}

/// Prices trades against a market snapshot without mutating it.
///
/// The ledger reprices on execution; the quote's `limit` carries the
/// trader's slippage ceiling (buys) or proceeds floor (sells).
#[derive(Clone, Debug)]
pub struct Quoter<'a> {
    engine: Engine,
    config: &'a Config,
}

impl<'a> Quoter<'a> {
    pub fn new(config: &'a Config) -> Self {
        Self {
            engine: Engine::new(config.min_liquidity_parameter),
            config,
        }
    }

    pub fn engine(&self) -> &Engine {
        &self.engine
    }

    pub fn quote_buy(
        &self,
        market: &Market,
        trader: AccountId,
        side: Outcome,
        shares: u64,
        max_total: Option<u64>,
    ) -> Result<TradeQuote, Error> {
        if !market.state.allows_trading() {
            return Err(Error::MarketNotTradable {
                market: market.id,
                state: market.state,
            });
        }
        if shares == 0 {
            return Err(Error::ZeroShares { market: market.id });
        }
        let raw = self.engine.buy_cost(
            market.q_yes,
            market.q_no,
            market.b,
            side,
            shares,
        )?;
        self.finish_quote(market, trader, side, shares, true, raw, max_total)
    }

    /// Prices a buy that spends at most `budget` (fees included),
    /// solving for the share count by binary search.
    pub fn quote_buy_for_budget(
        &self,
        market: &Market,
        trader: AccountId,
        side: Outcome,
        budget: u64,
    ) -> Result<TradeQuote, Error> {
        if !market.state.allows_trading() {
            return Err(Error::MarketNotTradable {
                market: market.id,
                state: market.state,
            });
        }
        // Strip fees off the top so the solved cost plus its fees fits
        // inside the budget: raw <= budget * 10_000 / (10_000 + f).
        let raw_budget = u64::try_from(
            u128::from(budget) * 10_000
                / (10_000 + u128::from(self.config.fee_total_bps)),
        )
        .map_err(|_| crate::math::Error::ArithmeticOverflow)?;
        let shares = self.engine.shares_for_budget(
            market.q_yes,
            market.q_no,
            market.b,
            side,
            raw_budget,
        )?;
        if shares == 0 {
            return Err(Error::ZeroShares { market: market.id });
        }
        let raw = self.engine.buy_cost(
            market.q_yes,
            market.q_no,
            market.b,
            side,
            shares,
        )?;
        self.finish_quote(market, trader, side, shares, true, raw, Some(budget))
    }

    pub fn quote_sell(
        &self,
        market: &Market,
        trader: AccountId,
        side: Outcome,
        shares: u64,
        min_total: Option<u64>,
    ) -> Result<TradeQuote, Error> {
        if !market.state.allows_trading() {
            return Err(Error::MarketNotTradable {
                market: market.id,
                state: market.state,
            });
        }
        if shares == 0 {
            return Err(Error::ZeroShares { market: market.id });
        }
        let have = match side {
            Outcome::Yes => market.q_yes,
            Outcome::No => market.q_no,
        };
        if shares > have {
            return Err(Error::InsufficientShares {
                market: market.id,
                side,
                have,
                want: shares,
            });
        }
        let raw = self.engine.sell_proceeds(
            market.q_yes,
            market.q_no,
            market.b,
            side,
            shares,
        )?;
        self.finish_quote(market, trader, side, shares, false, raw, min_total)
    }

    fn finish_quote(
        &self,
        market: &Market,
        trader: AccountId,
        side: Outcome,
        shares: u64,
        is_buy: bool,
        raw: u64,
        limit: Option<u64>,
    ) -> Result<TradeQuote, Error> {
        let fees = fee_breakdown(
            raw,
            self.config.fee_total_bps,
            self.config.fee_protocol_bps,
            self.config.fee_resolver_bps,
        )?;
        let total = if is_buy {
            let total = raw
                .checked_add(fees.total)
                .ok_or(crate::math::Error::ArithmeticOverflow)?;
            if let Some(limit) = limit {
                if total > limit {
                    return Err(Error::SlippageExceeded {
                        market: market.id,
                        total,
                        limit,
                    });
                }
            }
            total
        } else {
            let total = raw.saturating_sub(fees.total);
            if let Some(limit) = limit {
                if total < limit {
                    return Err(Error::SlippageExceeded {
                        market: market.id,
                        total,
                        limit,
                    });
                }
            }
            total
        };
        let (new_q_yes, new_q_no) = match (is_buy, side) {
            (true, Outcome::Yes) => (market.q_yes + shares, market.q_no),
            (true, Outcome::No) => (market.q_yes, market.q_no + shares),
            (false, Outcome::Yes) => (market.q_yes - shares, market.q_no),
            (false, Outcome::No) => (market.q_yes, market.q_no - shares),
        };
        let price_yes_after =
            self.engine.yes_price(new_q_yes, new_q_no, market.b)?;
        Ok(TradeQuote {
            market: market.id,
            side,
            shares,
            raw_amount: raw,
            fees,
            total,
            price_yes_after,
            instruction: Instruction::ExecuteTrade {
                market: market.id,
                trader,
                side,
                shares,
                is_buy,
                limit,
            },
        })
    }
}

/// Read cache of market records, mirrored from ledger events.
#[derive(Clone)]
pub struct MarketsDatabase {
    markets: DatabaseUnique<SerdeBincode<MarketId>, SerdeBincode<Market>>,
}

impl MarketsDatabase {
    pub const NUM_DBS: u32 = 1;

    pub fn new(env: &Env, rwtxn: &mut RwTxn) -> Result<Self, Error> {
        let markets = DatabaseUnique::create(env, rwtxn, "markets")?;
        Ok(Self { markets })
    }

    pub fn put(&self, rwtxn: &mut RwTxn, market: &Market) -> Result<(), Error> {
        self.markets.put(rwtxn, &market.id, market)?;
        Ok(())
    }

    pub fn try_get(
        &self,
        rotxn: &RoTxn,
        id: &MarketId,
    ) -> Result<Option<Market>, Error> {
        Ok(self.markets.try_get(rotxn, id)?)
    }

    pub fn require(&self, rotxn: &RoTxn, id: &MarketId) -> Result<Market, Error> {
        self.try_get(rotxn, id)?
            .ok_or(Error::MarketNotFound { market: *id })
    }

    /// All mirrored markets currently in `Resolving`.
    pub fn resolving(&self, rotxn: &RoTxn) -> Result<Vec<Market>, Error> {
        let mut markets = Vec::new();
        let mut iter = self.markets.iter(rotxn)?;
        while let Some((_, market)) = iter.next()? {
            if market.state == MarketState::Resolving {
                markets.push(market);
            }
        }
        Ok(markets)
    }
}
