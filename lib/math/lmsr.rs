//! LMSR (Logarithmic Market Scoring Rule) pricing engine.
//!
//! Cost function: `C(q_yes, q_no) = b · ln(e^(q_yes/b) + e^(q_no/b))`,
//! computed entirely in fixed-point via the stabilized log-sum-exp form
//! so the exponent argument never leaves the valid domain. Prices use
//! the equivalent softmax form and always sum to one.

use crate::math::{Error, LN_2, MAX_EXP, PRECISION, fixed};
use crate::types::Outcome;

/// Iteration cap for the budget inverse solve.
const MAX_ITERATIONS: u32 = 50;

/// Convergence tolerance on cost for the budget inverse solve (0.001).
const COST_TOLERANCE: u64 = PRECISION / 1000;

/// Fee amounts for a single trade, split total-first so the shares sum
/// exactly to the total and no value leaks to rounding.
#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub struct FeeBreakdown {
    pub protocol: u64,
    pub resolver: u64,
    pub lp: u64,
    pub total: u64,
}

/// Compute the total fee on `amount` at `total_bps`, then split it into
/// protocol/resolver/lp shares proportional to their basis points.
///
/// The lp share is computed by subtraction, so the three shares always
/// sum exactly to the total.
pub fn fee_breakdown(
    amount: u64,
    total_bps: u16,
    protocol_bps: u16,
    resolver_bps: u16,
) -> Result<FeeBreakdown, Error> {
    let mul_bps = |value: u64, bps: u64, scale: u64| -> Result<u64, Error> {
        if scale == 0 {
            return Err(Error::DivisionByZero);
        }
        let wide = (value as u128)
            .checked_mul(bps as u128)
            .ok_or(Error::ArithmeticOverflow)?
            / scale as u128;
        u64::try_from(wide).map_err(|_| Error::ArithmeticOverflow)
    };

    if total_bps == 0 {
        return Ok(FeeBreakdown {
            protocol: 0,
            resolver: 0,
            lp: 0,
            total: 0,
        });
    }
    let total = mul_bps(amount, total_bps as u64, 10_000)?;
    let protocol = mul_bps(total, protocol_bps as u64, total_bps as u64)?;
    let resolver = mul_bps(total, resolver_bps as u64, total_bps as u64)?;
    let lp = total
        .checked_sub(protocol)
        .and_then(|v| v.checked_sub(resolver))
        .ok_or(Error::ArithmeticOverflow)?;
    Ok(FeeBreakdown {
        protocol,
        resolver,
        lp,
        total,
    })
}

/// Fixed-point LMSR engine for binary markets.
///
/// The engine is stateless apart from the configured minimum liquidity
/// parameter; callers pass current quantities explicitly so that every
/// quote is computed against a single consistent snapshot.
#[derive(Clone, Copy, Debug)]
pub struct Engine {
    min_b: u64,
}

impl Engine {
    pub fn new(min_b: u64) -> Self {
        Self { min_b }
    }

    /// Validates a liquidity parameter against the configured floor.
    pub fn check_b(&self, b: u64) -> Result<(), Error> {
        if b < self.min_b {
            return Err(Error::Domain {
                reason: "liquidity parameter below configured minimum",
            });
        }
        Ok(())
    }

    /// `C(q_yes, q_no) = b · ln(e^(q_yes/b) + e^(q_no/b))`.
    pub fn cost(&self, q_yes: u64, q_no: u64, b: u64) -> Result<u64, Error> {
        self.check_b(b)?;
        let x = fixed::div(q_yes, b)?;
        let y = fixed::div(q_no, b)?;
        if x > MAX_EXP || y > MAX_EXP {
            return Err(Error::Domain {
                reason: "share quantity too large for liquidity parameter",
            });
        }
        let log_sum = fixed::log_sum_exp(x, y)?;
        fixed::mul(b, log_sum)
    }

    /// Marginal price of one outcome, in `[0, PRECISION]`.
    ///
    /// Computed as a two-point softmax on the quantity difference, so
    /// the exponent argument is bounded by `|q_yes - q_no| / b`.
    pub fn price(
        &self,
        q_yes: u64,
        q_no: u64,
        b: u64,
        outcome: Outcome,
    ) -> Result<u64, Error> {
        let yes_price = self.yes_price(q_yes, q_no, b)?;
        match outcome {
            Outcome::Yes => Ok(yes_price),
            // The complement is exact by construction, so the two
            // prices always sum to PRECISION.
            Outcome::No => Ok(PRECISION - yes_price),
        }
    }

    pub fn yes_price(&self, q_yes: u64, q_no: u64, b: u64) -> Result<u64, Error> {
        self.check_b(b)?;
        if q_yes >= q_no {
            // P = e^(d/b) / (e^(d/b) + 1) with d = q_yes - q_no
            let ratio = fixed::div(q_yes - q_no, b)?;
            if ratio > MAX_EXP {
                return Ok(PRECISION);
            }
            let exp_ratio = fixed::exp(ratio)?;
            let denominator = exp_ratio
                .checked_add(PRECISION)
                .ok_or(Error::ArithmeticOverflow)?;
            fixed::div(exp_ratio, denominator)
        } else {
            // P = 1 / (1 + e^(d/b)) with d = q_no - q_yes
            let ratio = fixed::div(q_no - q_yes, b)?;
            if ratio > MAX_EXP {
                return Ok(0);
            }
            let exp_ratio = fixed::exp(ratio)?;
            let denominator = PRECISION
                .checked_add(exp_ratio)
                .ok_or(Error::ArithmeticOverflow)?;
            fixed::div(PRECISION, denominator)
        }
    }

    /// Raw cost of buying `delta` shares on `side`: `C(q + Δq) − C(q)`.
    ///
    /// A negative difference indicates a numerical bug and fails closed
    /// rather than pricing the trade.
    pub fn buy_cost(
        &self,
        q_yes: u64,
        q_no: u64,
        b: u64,
        side: Outcome,
        delta: u64,
    ) -> Result<u64, Error> {
        let (new_q_yes, new_q_no) = apply_buy(q_yes, q_no, side, delta)?;
        let cost_before = self.cost(q_yes, q_no, b)?;
        let cost_after = self.cost(new_q_yes, new_q_no, b)?;
        cost_after.checked_sub(cost_before).ok_or(Error::Domain {
            reason: "buy cost would be negative",
        })
    }

    /// Raw proceeds of selling `delta` shares on `side`: `C(q) − C(q − Δq)`.
    pub fn sell_proceeds(
        &self,
        q_yes: u64,
        q_no: u64,
        b: u64,
        side: Outcome,
        delta: u64,
    ) -> Result<u64, Error> {
        let (new_q_yes, new_q_no) = match side {
            Outcome::Yes => (
                q_yes.checked_sub(delta).ok_or(Error::Domain {
                    reason: "sell quantity exceeds outstanding shares",
                })?,
                q_no,
            ),
            Outcome::No => (
                q_yes,
                q_no.checked_sub(delta).ok_or(Error::Domain {
                    reason: "sell quantity exceeds outstanding shares",
                })?,
            ),
        };
        let cost_before = self.cost(q_yes, q_no, b)?;
        let cost_after = self.cost(new_q_yes, new_q_no, b)?;
        cost_before.checked_sub(cost_after).ok_or(Error::Domain {
            reason: "sell proceeds would be negative",
        })
    }

    /// Inverse solve: how many shares does `budget` buy on `side`?
    ///
    /// Bounded binary search over `Δq ∈ [0, 20·b − q_side]`, converging
    /// from below: the result is the largest visited `Δq` whose cost does
    /// not exceed the budget, so callers can re-price it without ever
    /// overshooting. Exhausting the iteration cap while still more than
    /// [`COST_TOLERANCE`] under the budget is an error; an imprecise
    /// answer is never returned.
    pub fn shares_for_budget(
        &self,
        q_yes: u64,
        q_no: u64,
        b: u64,
        side: Outcome,
        budget: u64,
    ) -> Result<u64, Error> {
        self.check_b(b)?;
        if budget == 0 {
            return Ok(0);
        }

        // Keep q/b within the exp domain for every midpoint.
        let q_side = match side {
            Outcome::Yes => q_yes,
            Outcome::No => q_no,
        };
        let max_delta = 20u64
            .checked_mul(b)
            .ok_or(Error::ArithmeticOverflow)?
            .checked_sub(q_side)
            .ok_or(Error::Domain {
                reason: "share quantity too large for liquidity parameter",
            })?;

        if self.buy_cost(q_yes, q_no, b, side, max_delta)?
            < budget.saturating_sub(COST_TOLERANCE)
        {
            return Err(Error::Domain {
                reason: "budget exceeds maximum purchasable quantity",
            });
        }

        // Invariant: cost(low) <= budget.
        let mut low = 0u64;
        let mut high = max_delta;
        for _ in 0..MAX_ITERATIONS {
            if high - low <= 1 {
                break;
            }
            let mid = low + (high - low) / 2;
            let cost = self.buy_cost(q_yes, q_no, b, side, mid)?;
            if cost <= budget {
                low = mid;
            } else {
                high = mid;
            }
        }

        let low_cost = self.buy_cost(q_yes, q_no, b, side, low)?;
        if budget - low_cost <= COST_TOLERANCE || high - low <= 1 {
            Ok(low)
        } else {
            Err(Error::Convergence {
                iterations: MAX_ITERATIONS,
            })
        }
    }

    /// Maximum possible loss to the liquidity provider: `b · ln(2)`.
    pub fn max_loss(&self, b: u64) -> Result<u64, Error> {
        self.check_b(b)?;
        fixed::mul(b, LN_2)
    }

    /// Liquidity parameter required to cap provider loss at `max_loss`.
    pub fn b_for_max_loss(&self, max_loss: u64) -> Result<u64, Error> {
        let b = fixed::div(max_loss, LN_2)?;
        Ok(b.max(self.min_b))
    }
}

fn apply_buy(
    q_yes: u64,
    q_no: u64,
    side: Outcome,
    delta: u64,
) -> Result<(u64, u64), Error> {
    match side {
        Outcome::Yes => Ok((
            q_yes.checked_add(delta).ok_or(Error::ArithmeticOverflow)?,
            q_no,
        )),
        Outcome::No => Ok((
            q_yes,
            q_no.checked_add(delta).ok_or(Error::ArithmeticOverflow)?,
        )),
    }
}
