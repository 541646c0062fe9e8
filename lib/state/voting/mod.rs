//! Vote collection and threshold evaluation.
//!
//! Ballots accumulate in per-market tallies. When a tally crosses its
//! configured threshold, [`VotingSystem::evaluate_threshold`] emits a
//! [`CommitIntent`] aggregating the counts for ledger submission. Emission
//! is keyed by the tally's epoch, so re-evaluating an unchanged tally
//! never produces a second intent, while a tally that has grown since the
//! last emission produces a superseding one.

use sneed::{Env, RoTxn, RwTxn};
use tracing::instrument;

use crate::{
    config::Config,
    ledger::{CommitIntent, Instruction, IntentAction, IntentKey},
    state::Error,
    types::{MarketId, Timestamp, TxRef},
};

mod database;
pub mod types;

pub use database::VotingDatabases;
pub use types::{Ballot, RetiredTally, TallyKey, TallySnapshot, VoteKind, VoteTally};

#[derive(Clone)]
pub struct VotingSystem {
    dbs: VotingDatabases,
}

impl VotingSystem {
    pub const NUM_DBS: u32 = VotingDatabases::NUM_DBS;

    pub fn new(env: &Env, rwtxn: &mut RwTxn) -> Result<Self, Error> {
        let dbs = VotingDatabases::new(env, rwtxn)?;
        Ok(Self { dbs })
    }

    pub fn databases(&self) -> &VotingDatabases {
        &self.dbs
    }

    /// Records a ballot, creating the tally on first vote.
    ///
    /// Rejects duplicate voters and ballots for tallies whose aggregation
    /// has already been committed.
    #[instrument(skip(self, rwtxn))]
    pub fn submit_ballot(
        &self,
        rwtxn: &mut RwTxn,
        ballot: &Ballot,
    ) -> Result<VoteTally, Error> {
        let key = TallyKey {
            market: ballot.market,
            kind: ballot.kind,
        };
        if let Some(retired) = self.dbs.try_get_retired(rwtxn, &key)? {
            return Err(Error::VotingClosed {
                market: ballot.market,
                epoch: retired.epoch,
            });
        }
        let mut tally = self
            .dbs
            .try_get_tally(rwtxn, &key)?
            .unwrap_or_else(|| VoteTally::new(ballot.market, ballot.kind));
        tally.record(ballot)?;
        self.dbs.put_tally(rwtxn, &tally)?;
        tracing::debug!(
            market = %ballot.market,
            kind = %ballot.kind,
            affirmative = tally.affirmative,
            negative = tally.negative,
            epoch = tally.epoch,
            "recorded ballot"
        );
        Ok(tally)
    }

    pub fn tally(
        &self,
        rotxn: &RoTxn,
        market: MarketId,
        kind: VoteKind,
    ) -> Result<Option<VoteTally>, Error> {
        self.dbs.try_get_tally(rotxn, &TallyKey { market, kind })
    }

    fn crossed(tally: &VoteTally, config: &Config) -> bool {
        match tally.kind {
            VoteKind::Proposal => {
                tally.total() >= u64::from(config.min_proposal_votes)
                    && tally.affirmative_bps()
                        >= u64::from(config.proposal_approval_threshold_bps)
            }
            VoteKind::Dispute => {
                tally.total() > 0
                    && tally.affirmative_bps()
                        >= u64::from(config.dispute_threshold_bps)
            }
        }
    }

    /// Emits a commit intent if the tally has crossed its threshold and
    /// the current epoch has not been emitted yet.
    pub fn evaluate_threshold(
        &self,
        rwtxn: &mut RwTxn,
        market: MarketId,
        kind: VoteKind,
        config: &Config,
        now: Timestamp,
    ) -> Result<Option<CommitIntent>, Error> {
        let key = TallyKey { market, kind };
        let Some(tally) = self.dbs.try_get_tally(rwtxn, &key)? else {
            return Ok(None);
        };
        if !Self::crossed(&tally, config) {
            return Ok(None);
        }
        if self.dbs.emitted_epoch(rwtxn, &key)? == Some(tally.epoch) {
            // Already emitted for this exact snapshot.
            return Ok(None);
        }
        self.dbs.mark_emitted(rwtxn, &key, tally.epoch)?;
        let intent = CommitIntent {
            key: IntentKey {
                market,
                action: IntentAction::from(kind),
                epoch: tally.epoch,
            },
            instruction: Instruction::AggregateVotes {
                market,
                kind,
                affirmative: tally.affirmative,
                negative: tally.negative,
                epoch: tally.epoch,
            },
            created_at: now,
        };
        tracing::info!(
            market = %market,
            kind = %kind,
            affirmative = tally.affirmative,
            negative = tally.negative,
            epoch = tally.epoch,
            "vote threshold crossed, emitting commit intent"
        );
        Ok(Some(intent))
    }

    /// Evaluates every live tally, returning the intents that fired.
    pub fn evaluate_all(
        &self,
        rwtxn: &mut RwTxn,
        config: &Config,
        now: Timestamp,
    ) -> Result<Vec<CommitIntent>, Error> {
        let tallies = self.dbs.all_tallies(rwtxn)?;
        let mut intents = Vec::new();
        for tally in tallies {
            if let Some(intent) = self.evaluate_threshold(
                rwtxn,
                tally.market,
                tally.kind,
                config,
                now,
            )? {
                intents.push(intent);
            }
        }
        Ok(intents)
    }

    /// Forgets the emission marker for a tally so its current epoch may
    /// emit again on the next evaluation. Used when a staged intent was
    /// dropped without the ledger committing it.
    pub fn reset_emission(
        &self,
        rwtxn: &mut RwTxn,
        market: MarketId,
        kind: VoteKind,
    ) -> Result<(), Error> {
        self.dbs.clear_emitted(rwtxn, &TallyKey { market, kind })
    }

    /// Called once the ledger acknowledges an aggregation.
    pub fn retire(
        &self,
        rwtxn: &mut RwTxn,
        market: MarketId,
        kind: VoteKind,
        tx_ref: TxRef,
        retired_at: Timestamp,
    ) -> Result<(), Error> {
        self.dbs
            .retire(rwtxn, &TallyKey { market, kind }, tx_ref, retired_at)
    }
}
