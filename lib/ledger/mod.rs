//! The ledger boundary.
//!
//! The external ledger is the single source of truth for market records.
//! The node talks to it through the [`Ledger`] trait: instructions go in,
//! a transaction reference comes back on confirmation, and an ordered
//! event stream flows out for mirroring.

use borsh::{BorshDeserialize, BorshSerialize};
use futures::future::BoxFuture;
use serde::{Deserialize, Serialize};
use thiserror::Error;

use crate::{
    state::{markets::MarketState, voting::VoteKind},
    types::{MarketId, Outcome, Timestamp, TxRef, AccountId},
};

pub mod memory;

pub use memory::MemoryLedger;

/// An instruction submitted to the ledger, borsh-encoded on the wire.
#[derive(
    BorshDeserialize,
    BorshSerialize,
    Clone,
    Copy,
    Debug,
    Deserialize,
    Eq,
    PartialEq,
    Serialize,
)]
pub enum Instruction {
    /// Buy or sell shares on an active market. The ledger reprices at
    /// execution; `limit` is the trader's total ceiling (buy) or
    /// proceeds floor (sell).
    ExecuteTrade {
        market: MarketId,
        trader: AccountId,
        side: Outcome,
        shares: u64,
        is_buy: bool,
        limit: Option<u64>,
    },
    /// Redeem a winning position on a finalized market. Each winning
    /// share pays out one unit of collateral.
    ClaimWinnings {
        market: MarketId,
        trader: AccountId,
    },
    /// Return the collateral not reserved for unclaimed winning shares,
    /// plus accrued lp fees, to the liquidity provider.
    WithdrawLiquidity { market: MarketId },
    /// Commit aggregated vote counts. The ledger recomputes the
    /// threshold outcome from the counts.
    AggregateVotes {
        market: MarketId,
        kind: VoteKind,
        affirmative: u32,
        negative: u32,
        epoch: u64,
    },
    /// Drive a market through its lifecycle.
    TransitionMarket {
        market: MarketId,
        transition: Transition,
    },
}

impl Instruction {
    pub fn market(&self) -> MarketId {
        match self {
            Self::ExecuteTrade { market, .. }
            | Self::ClaimWinnings { market, .. }
            | Self::WithdrawLiquidity { market }
            | Self::AggregateVotes { market, .. }
            | Self::TransitionMarket { market, .. } => *market,
        }
    }
}

/// Payload for [`Instruction::TransitionMarket`].
#[derive(
    BorshDeserialize,
    BorshSerialize,
    Clone,
    Copy,
    Debug,
    Deserialize,
    Eq,
    PartialEq,
    Serialize,
)]
pub enum Transition {
    /// Create the market in `Proposed` with liquidity parameter `b`.
    Propose { b: u64 },
    /// `Approved -> Active`, seeding the collateral pool.
    Activate { seeded_liquidity: u64 },
    /// `Active -> Resolving` with a proposed outcome.
    ProposeResolution {
        outcome: Outcome,
        resolver: AccountId,
    },
    /// `Resolving -> Disputed`, within the dispute window.
    Dispute,
    /// `Resolving -> Finalized` after an undisputed window.
    AutoFinalize,
}

/// Per-trader share holdings on a single market.
#[derive(
    BorshDeserialize,
    BorshSerialize,
    Clone,
    Copy,
    Debug,
    Default,
    Deserialize,
    Eq,
    PartialEq,
    Serialize,
)]
pub struct Position {
    pub yes: u64,
    pub no: u64,
    /// Set once the winning side has been redeemed.
    pub claimed: bool,
}

impl Position {
    pub fn side(&self, side: Outcome) -> u64 {
        match side {
            Outcome::Yes => self.yes,
            Outcome::No => self.no,
        }
    }

    pub fn side_mut(&mut self, side: Outcome) -> &mut u64 {
        match side {
            Outcome::Yes => &mut self.yes,
            Outcome::No => &mut self.no,
        }
    }
}

/// A confirmed ledger transaction, emitted on the event stream.
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
pub struct Event {
    pub tx_ref: TxRef,
    /// Position in the ledger's total order, starting at 1.
    pub seq: u64,
    pub market: MarketId,
    pub at: Timestamp,
    pub kind: EventKind,
}

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
pub enum EventKind {
    MarketCreated {
        b: u64,
    },
    TradeExecuted {
        trader: AccountId,
        side: Outcome,
        shares: u64,
        is_buy: bool,
        raw_amount: u64,
        fee_protocol: u64,
        fee_resolver: u64,
        fee_lp: u64,
        new_q_yes: u64,
        new_q_no: u64,
    },
    WinningsClaimed {
        trader: AccountId,
        shares: u64,
        payout: u64,
    },
    LiquidityWithdrawn {
        amount: u64,
    },
    VotesAggregated {
        kind: VoteKind,
        affirmative: u32,
        negative: u32,
        epoch: u64,
        passed: bool,
        new_state: MarketState,
    },
    MarketTransitioned {
        from: MarketState,
        to: MarketState,
        outcome: Option<Outcome>,
        seeded_liquidity: Option<u64>,
    },
}

/// What a staged commit intent is trying to accomplish. Together with
/// the market this identifies the pending slot an intent occupies; the
/// epoch distinguishes superseding snapshots.
#[derive(
    Clone, Copy, Debug, Deserialize, Eq, Hash, PartialEq, Serialize, strum::Display,
)]
pub enum IntentAction {
    ProposalVotes,
    DisputeVotes,
    AutoFinalize,
}

impl From<VoteKind> for IntentAction {
    fn from(kind: VoteKind) -> Self {
        match kind {
            VoteKind::Proposal => Self::ProposalVotes,
            VoteKind::Dispute => Self::DisputeVotes,
        }
    }
}

#[derive(Clone, Copy, Debug, Deserialize, Eq, Hash, PartialEq, Serialize)]
pub struct IntentKey {
    pub market: MarketId,
    pub action: IntentAction,
    pub epoch: u64,
}

/// A side effect owed to the ledger, staged durably until acknowledged.
#[derive(Clone, Debug, Deserialize, Eq, PartialEq, Serialize)]
pub struct CommitIntent {
    pub key: IntentKey,
    pub instruction: Instruction,
    pub created_at: Timestamp,
}

#[derive(Clone, Debug, Error)]
pub enum Error {
    /// Worth retrying: congestion, connectivity, rate limits.
    #[error("transient ledger failure: {reason}")]
    Transient { reason: String },
    /// Retrying cannot help: the ledger rejected the instruction.
    #[error("ledger rejected instruction: {reason}")]
    Rejected { reason: String },
    /// The instruction was built against a stale snapshot.
    #[error("stale instruction: {reason}")]
    Stale { reason: String },
    #[error("ledger submission timed out after {secs}s")]
    Timeout { secs: u64 },
}

impl Error {
    pub fn is_transient(&self) -> bool {
        matches!(self, Self::Transient { .. } | Self::Timeout { .. })
    }
}

/// Client interface to the external ledger.
///
/// `submit` resolves once the instruction is confirmed in the ledger's
/// total order. `events_since` returns confirmed events with
/// `seq > after`, in order.
pub trait Ledger: Send + Sync {
    fn submit(
        &self,
        instruction: Instruction,
    ) -> BoxFuture<'_, Result<TxRef, Error>>;

    fn events_since(
        &self,
        after: u64,
    ) -> BoxFuture<'_, Result<Vec<Event>, Error>>;
}
