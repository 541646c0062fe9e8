//! Node-side state: the market read cache and the voting books.
//!
//! Everything here lives in one LMDB environment. Market records are a
//! mirror of the ledger rebuilt from its event stream; vote tallies and
//! commit bookkeeping are node-authoritative.

pub mod error;
pub mod markets;
pub mod voting;

pub use error::Error;
pub use markets::{
    Market, MarketState, MarketsDatabase, Quoter, TradeExecution, TradeQuote,
    VoteAggregation,
};
pub use voting::{Ballot, VoteKind, VoteTally, VotingSystem};

#[derive(Clone)]
pub struct State {
    markets: MarketsDatabase,
    voting: VotingSystem,
}

impl State {
    pub const NUM_DBS: u32 =
        MarketsDatabase::NUM_DBS + VotingSystem::NUM_DBS;

    pub fn new(env: &sneed::Env) -> Result<Self, Error> {
        let mut rwtxn = env.write_txn()?;
        let markets = MarketsDatabase::new(env, &mut rwtxn)?;
        let voting = VotingSystem::new(env, &mut rwtxn)?;
        rwtxn.commit()?;
        Ok(Self { markets, voting })
    }

    pub fn markets(&self) -> &MarketsDatabase {
        &self.markets
    }

    pub fn voting(&self) -> &VotingSystem {
        &self.voting
    }
}
