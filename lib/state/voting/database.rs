//! LMDB persistence for vote tallies.

use fallible_iterator::FallibleIterator;
use heed::types::SerdeBincode;
use sneed::{DatabaseUnique, Env, RoTxn, RwTxn};

use crate::{
    state::{
        Error,
        voting::types::{RetiredTally, TallyKey, VoteTally},
    },
    types::{Timestamp, TxRef},
};

#[derive(Clone)]
pub struct VotingDatabases {
    /// Live tallies, one per `(market, kind)`.
    tallies: DatabaseUnique<SerdeBincode<TallyKey>, SerdeBincode<VoteTally>>,
    /// Epoch of the last commit intent emitted per tally.
    emitted: DatabaseUnique<SerdeBincode<TallyKey>, SerdeBincode<u64>>,
    /// Tallies whose aggregation the ledger has acknowledged.
    retired:
        DatabaseUnique<SerdeBincode<TallyKey>, SerdeBincode<RetiredTally>>,
}

impl VotingDatabases {
    pub const NUM_DBS: u32 = 3;

    pub fn new(env: &Env, rwtxn: &mut RwTxn) -> Result<Self, Error> {
        let tallies = DatabaseUnique::create(env, rwtxn, "vote_tallies")?;
        let emitted = DatabaseUnique::create(env, rwtxn, "vote_emitted")?;
        let retired = DatabaseUnique::create(env, rwtxn, "vote_retired")?;
        Ok(Self {
            tallies,
            emitted,
            retired,
        })
    }

    pub fn put_tally(
        &self,
        rwtxn: &mut RwTxn,
        tally: &VoteTally,
    ) -> Result<(), Error> {
        self.tallies.put(rwtxn, &tally.key(), tally)?;
        Ok(())
    }

    pub fn try_get_tally(
        &self,
        rotxn: &RoTxn,
        key: &TallyKey,
    ) -> Result<Option<VoteTally>, Error> {
        Ok(self.tallies.try_get(rotxn, key)?)
    }

    pub fn all_tallies(&self, rotxn: &RoTxn) -> Result<Vec<VoteTally>, Error> {
        let mut tallies = Vec::new();
        let mut iter = self.tallies.iter(rotxn)?;
        while let Some((_, tally)) = iter.next()? {
            tallies.push(tally);
        }
        Ok(tallies)
    }

    pub fn emitted_epoch(
        &self,
        rotxn: &RoTxn,
        key: &TallyKey,
    ) -> Result<Option<u64>, Error> {
        Ok(self.emitted.try_get(rotxn, key)?)
    }

    pub fn mark_emitted(
        &self,
        rwtxn: &mut RwTxn,
        key: &TallyKey,
        epoch: u64,
    ) -> Result<(), Error> {
        self.emitted.put(rwtxn, key, &epoch)?;
        Ok(())
    }

    pub fn clear_emitted(
        &self,
        rwtxn: &mut RwTxn,
        key: &TallyKey,
    ) -> Result<(), Error> {
        self.emitted.delete(rwtxn, key)?;
        Ok(())
    }

    pub fn is_retired(
        &self,
        rotxn: &RoTxn,
        key: &TallyKey,
    ) -> Result<bool, Error> {
        Ok(self.retired.try_get(rotxn, key)?.is_some())
    }

    pub fn try_get_retired(
        &self,
        rotxn: &RoTxn,
        key: &TallyKey,
    ) -> Result<Option<RetiredTally>, Error> {
        Ok(self.retired.try_get(rotxn, key)?)
    }

    /// Archives a tally and clears its live entry and emission marker.
    pub fn retire(
        &self,
        rwtxn: &mut RwTxn,
        key: &TallyKey,
        tx_ref: TxRef,
        retired_at: Timestamp,
    ) -> Result<(), Error> {
        let Some(tally) = self.tallies.try_get(rwtxn, key)? else {
            return Ok(());
        };
        let archived = RetiredTally {
            market: tally.market,
            kind: tally.kind,
            affirmative: tally.affirmative,
            negative: tally.negative,
            epoch: tally.epoch,
            tx_ref,
            retired_at,
        };
        self.retired.put(rwtxn, key, &archived)?;
        self.tallies.delete(rwtxn, key)?;
        self.emitted.delete(rwtxn, key)?;
        Ok(())
    }
}
