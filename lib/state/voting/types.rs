//! Vote aggregation types.

use std::collections::HashSet;

use serde::{Deserialize, Serialize};

use crate::{
    state::Error,
    types::{MarketId, Timestamp, TxRef, AccountId},
};

/// The two polls a market can run.
#[derive(
    borsh::BorshDeserialize,
    borsh::BorshSerialize,
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
pub enum VoteKind {
    /// Should the proposed market open?
    Proposal,
    /// Should the proposed resolution be overturned?
    Dispute,
}

/// One tally exists per market and vote kind.
#[derive(
    Clone, Copy, Debug, Deserialize, Eq, Hash, PartialEq, Serialize,
)]
pub struct TallyKey {
    pub market: MarketId,
    pub kind: VoteKind,
}

/// A single voter's ballot.
#[derive(Clone, Copy, Debug, Deserialize, Eq, PartialEq, Serialize)]
pub struct Ballot {
    pub market: MarketId,
    pub kind: VoteKind,
    pub voter: AccountId,
    pub approve: bool,
    pub cast_at: Timestamp,
}

/// Counts for one commit intent, frozen at emission time.
#[derive(Clone, Copy, Debug, Deserialize, Eq, PartialEq, Serialize)]
pub struct TallySnapshot {
    pub affirmative: u32,
    pub negative: u32,
    pub epoch: u64,
}

/// Running vote counts for one `(market, kind)` pair.
///
/// `epoch` increments on every recorded ballot, versioning the counts so
/// that a commit intent can be tied to the exact snapshot it aggregates.
#[derive(Clone, Debug, Deserialize, Eq, PartialEq, Serialize)]
pub struct VoteTally {
    pub market: MarketId,
    pub kind: VoteKind,
    pub affirmative: u32,
    pub negative: u32,
    pub voters: HashSet<AccountId>,
    pub epoch: u64,
}

impl VoteTally {
    pub fn new(market: MarketId, kind: VoteKind) -> Self {
        Self {
            market,
            kind,
            affirmative: 0,
            negative: 0,
            voters: HashSet::new(),
            epoch: 0,
        }
    }

    pub fn key(&self) -> TallyKey {
        TallyKey {
            market: self.market,
            kind: self.kind,
        }
    }

    pub fn total(&self) -> u64 {
        u64::from(self.affirmative) + u64::from(self.negative)
    }

    /// Affirmative share in basis points, zero for an empty tally.
    pub fn affirmative_bps(&self) -> u64 {
        let total = self.total();
        if total == 0 {
            0
        } else {
            u64::from(self.affirmative) * 10_000 / total
        }
    }

    /// Records a ballot, rejecting voters who already voted here.
    pub fn record(&mut self, ballot: &Ballot) -> Result<(), Error> {
        if !self.voters.insert(ballot.voter) {
            return Err(Error::DuplicateVoter {
                market: self.market,
                voter: ballot.voter,
            });
        }
        if ballot.approve {
            self.affirmative += 1;
        } else {
            self.negative += 1;
        }
        self.epoch += 1;
        Ok(())
    }

    pub fn snapshot(&self) -> TallySnapshot {
        TallySnapshot {
            affirmative: self.affirmative,
            negative: self.negative,
            epoch: self.epoch,
        }
    }
}

/// A tally archived after its aggregation was committed to the ledger.
#[derive(Clone, Debug, Deserialize, Eq, PartialEq, Serialize)]
pub struct RetiredTally {
    pub market: MarketId,
    pub kind: VoteKind,
    pub affirmative: u32,
    pub negative: u32,
    pub epoch: u64,
    pub tx_ref: TxRef,
    pub retired_at: Timestamp,
}
