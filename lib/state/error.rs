//! State errors

use sneed::{db::error as db, env::error as env, rwtxn::error as rwtxn};
use thiserror::Error;
use transitive::Transitive;

use crate::{
    state::markets::MarketState,
    types::{MarketId, Outcome, AccountId},
};

#[derive(Debug, Error, Transitive)]
#[transitive(from(db::Clear, db::Error))]
#[transitive(from(db::Delete, db::Error))]
#[transitive(from(db::Error, sneed::Error))]
#[transitive(from(db::IterInit, db::Error))]
#[transitive(from(db::IterItem, db::Error))]
#[transitive(from(db::Last, db::Error))]
#[transitive(from(db::Put, db::Error))]
#[transitive(from(db::TryGet, db::Error))]
#[transitive(from(env::CreateDb, env::Error))]
#[transitive(from(env::Error, sneed::Error))]
#[transitive(from(env::ReadTxn, env::Error))]
#[transitive(from(env::WriteTxn, env::Error))]
#[transitive(from(rwtxn::Commit, rwtxn::Error))]
#[transitive(from(rwtxn::Error, sneed::Error))]
pub enum Error {
    #[error(transparent)]
    Db(#[from] sneed::Error),
    #[error("account {account} has already claimed winnings on market {market}")]
    AlreadyClaimed {
        market: MarketId,
        account: AccountId,
    },
    #[error("dispute window for market {market} has already closed")]
    DisputeWindowClosed { market: MarketId },
    #[error("dispute window for market {market} is still open")]
    DisputeWindowOpen { market: MarketId },
    #[error("voter {voter} has already voted on market {market}")]
    DuplicateVoter { market: MarketId, voter: AccountId },
    #[error(
        "insufficient liquidity for market {market}: \
         required {required}, provided {provided}"
    )]
    InsufficientLiquidity {
        market: MarketId,
        required: u64,
        provided: u64,
    },
    #[error(
        "insufficient {side} shares on market {market}: have {have}, want {want}"
    )]
    InsufficientShares {
        market: MarketId,
        side: Outcome,
        have: u64,
        want: u64,
    },
    #[error("invalid state transition for market {market}: {from} -> {to}")]
    InvalidStateTransition {
        market: MarketId,
        from: MarketState,
        to: MarketState,
    },
    #[error("invalid timestamp")]
    InvalidTimestamp,
    #[error("liquidity for market {market} has already been withdrawn")]
    LiquidityAlreadyWithdrawn { market: MarketId },
    #[error("market {market} already exists")]
    MarketAlreadyExists { market: MarketId },
    #[error("market {market} does not exist")]
    MarketNotFound { market: MarketId },
    #[error("market {market} is not tradable in state {state}")]
    MarketNotTradable {
        market: MarketId,
        state: MarketState,
    },
    #[error("market {market} is not settled: state is {state}")]
    MarketNotSettled {
        market: MarketId,
        state: MarketState,
    },
    #[error(transparent)]
    Math(#[from] crate::math::Error),
    #[error("account {account} holds no position on market {market}")]
    NoPosition {
        market: MarketId,
        account: AccountId,
    },
    #[error("no resolution has been proposed for market {market}")]
    NoResolutionProposed { market: MarketId },
    #[error("account {account} holds no winning shares on market {market}")]
    NothingToClaim {
        market: MarketId,
        account: AccountId,
    },
    #[error(
        "market {market} cannot resolve before {min_trading_secs}s of trading"
    )]
    ResolutionTooEarly {
        market: MarketId,
        min_trading_secs: u64,
    },
    #[error("trade on market {market} exceeds limit: {total} > {limit}")]
    SlippageExceeded {
        market: MarketId,
        total: u64,
        limit: u64,
    },
    #[error("voting epoch {epoch} is closed for market {market}")]
    VotingClosed { market: MarketId, epoch: u64 },
    #[error("zero-share trade on market {market}")]
    ZeroShares { market: MarketId },
}
