//! Protocol configuration, validated once at load.

use serde::{Deserialize, Serialize};
use thiserror::Error;

use crate::math::PRECISION;

#[derive(Debug, Error)]
pub enum Error {
    #[error("fee shares sum to {sum} bps, exceeding the {total} bps total")]
    FeeSharesExceedTotal { sum: u16, total: u16 },
    #[error("invalid threshold {value} bps: must be ≤ 10000")]
    InvalidThreshold { value: u16 },
    #[error("invalid time window: {name} must be positive")]
    InvalidTimeWindow { name: &'static str },
    #[error("minimum liquidity parameter must be positive")]
    InvalidMinLiquidity,
    #[error("max_commit_attempts must be positive")]
    InvalidCommitAttempts,
    #[error("failed to read config file: {0}")]
    Io(#[from] std::io::Error),
    #[error("failed to parse config file: {0}")]
    Parse(#[from] serde_json::Error),
}

/// Protocol-wide parameters.
///
/// Fee rates and vote thresholds are expressed in basis points
/// (1 bps = 0.01%). Time windows are in seconds.
#[derive(Clone, Debug, Deserialize, Serialize)]
#[serde(default, deny_unknown_fields)]
pub struct Config {
    /// Total trading fee applied to raw LMSR cost/proceeds.
    pub fee_total_bps: u16,
    /// Protocol share of the total fee.
    pub fee_protocol_bps: u16,
    /// Resolver reward share of the total fee.
    pub fee_resolver_bps: u16,
    /// Liquidity provider share of the total fee.
    pub fee_lp_bps: u16,
    /// Affirmative share required for a proposal vote to pass.
    pub proposal_approval_threshold_bps: u16,
    /// Minimum number of ballots before a proposal vote can pass.
    pub min_proposal_votes: u32,
    /// Affirmative share required for a dispute to succeed.
    pub dispute_threshold_bps: u16,
    /// Time after a proposed resolution during which a dispute may be
    /// raised; elapsing with no dispute auto-finalizes the market.
    pub dispute_window_secs: u64,
    /// Minimum time a market must trade before a resolution may be
    /// proposed.
    pub min_trading_duration_secs: u64,
    /// Lower bound on the LMSR liquidity parameter `b` (fixed-point).
    pub min_liquidity_parameter: u64,
    /// Reconciliation scan interval.
    pub scan_interval_secs: u64,
    /// Bounded wait for a single ledger submission.
    pub submit_timeout_secs: u64,
    /// Base delay for commit retry backoff (doubled per attempt).
    pub retry_base_delay_secs: u64,
    /// Attempts before a commit intent is dead-lettered.
    pub max_commit_attempts: u32,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            fee_total_bps: 1000,
            fee_protocol_bps: 300,
            fee_resolver_bps: 200,
            fee_lp_bps: 500,
            proposal_approval_threshold_bps: 7000,
            min_proposal_votes: 10,
            dispute_threshold_bps: 6000,
            dispute_window_secs: 48 * 60 * 60,
            min_trading_duration_secs: 60 * 60,
            min_liquidity_parameter: 100 * PRECISION,
            scan_interval_secs: 300,
            submit_timeout_secs: 20,
            retry_base_delay_secs: 30,
            max_commit_attempts: 5,
        }
    }
}

impl Config {
    pub fn from_json_file(path: &std::path::Path) -> Result<Self, Error> {
        let contents = std::fs::read_to_string(path)?;
        let config: Self = serde_json::from_str(&contents)?;
        config.validate()?;
        Ok(config)
    }

    /// Check configuration invariants.
    ///
    /// Fee shares must not exceed the total fee, thresholds must be
    /// valid basis-point values, and all time windows must be positive.
    pub fn validate(&self) -> Result<(), Error> {
        let share_sum = self
            .fee_protocol_bps
            .saturating_add(self.fee_resolver_bps)
            .saturating_add(self.fee_lp_bps);
        if share_sum > self.fee_total_bps {
            return Err(Error::FeeSharesExceedTotal {
                sum: share_sum,
                total: self.fee_total_bps,
            });
        }
        for threshold in [
            self.fee_total_bps,
            self.proposal_approval_threshold_bps,
            self.dispute_threshold_bps,
        ] {
            if threshold > 10000 {
                return Err(Error::InvalidThreshold { value: threshold });
            }
        }
        for (name, secs) in [
            ("dispute_window_secs", self.dispute_window_secs),
            ("min_trading_duration_secs", self.min_trading_duration_secs),
            ("scan_interval_secs", self.scan_interval_secs),
            ("submit_timeout_secs", self.submit_timeout_secs),
            ("retry_base_delay_secs", self.retry_base_delay_secs),
        ] {
            if secs == 0 {
                return Err(Error::InvalidTimeWindow { name });
            }
        }
        if self.min_liquidity_parameter == 0 {
            return Err(Error::InvalidMinLiquidity);
        }
        if self.max_commit_attempts == 0 {
            return Err(Error::InvalidCommitAttempts);
        }
        Ok(())
    }
}
