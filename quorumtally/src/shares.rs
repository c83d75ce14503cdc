use crate::*;
use std::collections::{BTreeMap, BTreeSet};
use tracing::info;
use uuid::Uuid;

/// Compensated decryption shares of one store.
///
/// Records are keyed by `(election, compensating, missing)` and are never overwritten or
/// deleted: a compensation for a guardian that later submits directly stays on record but no
/// longer takes part in combination.
pub struct ShareStore<'a, S: Store + ?Sized> {
    store: &'a S,
}

impl<'a, S: Store + ?Sized> ShareStore<'a, S> {
    pub fn new(store: &'a S) -> Self {
        ShareStore { store }
    }

    pub async fn record_compensation(
        &self,
        share: CompensatedDecryptionShare,
    ) -> Result<(), Error> {
        let key = share.key();
        if key.compensating_sequence == key.missing_sequence {
            return Err(Error::InvalidArgument(format!(
                "guardian {} cannot compensate for itself",
                key.compensating_sequence
            )));
        }

        let fingerprint = share.tally_share.fingerprint();
        self.store.insert_compensation(share).await?;
        info!(
            election = %key.election_id,
            compensating = key.compensating_sequence,
            missing = key.missing_sequence,
            share = %fingerprint,
            "compensated decryption recorded"
        );
        Ok(())
    }

    pub async fn compensation(
        &self,
        key: CompensationKey,
    ) -> Result<Option<CompensatedDecryptionShare>, Error> {
        self.store.get_compensation(key).await
    }

    pub async fn compensations(
        &self,
        election_id: Uuid,
    ) -> Result<Vec<CompensatedDecryptionShare>, Error> {
        self.store.get_compensations(election_id).await
    }

    /// Missing guardians that have at least one compensation record
    pub async fn compensated_sequences(&self, election_id: Uuid) -> Result<BTreeSet<u32>, Error> {
        Ok(self
            .compensations(election_id)
            .await?
            .iter()
            .map(|c| c.missing_sequence)
            .collect())
    }

    /// Pick one compensation per guardian that is not directly represented.
    ///
    /// Any single compensated share is enough for a missing guardian; the one from the lowest
    /// compensating sequence is chosen so that retries forward the same set.
    pub async fn select_compensations(
        &self,
        election_id: Uuid,
        direct: &BTreeSet<u32>,
    ) -> Result<Vec<CompensatedDecryptionShare>, Error> {
        let mut selected: BTreeMap<u32, CompensatedDecryptionShare> = BTreeMap::new();

        // Records come back ordered by compensating sequence, so the first one wins
        for share in self.compensations(election_id).await? {
            if direct.contains(&share.missing_sequence) {
                continue;
            }
            selected.entry(share.missing_sequence).or_insert(share);
        }

        Ok(selected.into_iter().map(|(_, share)| share).collect())
    }
}

/// Guardians that are effectively represented: direct submitters plus compensated-for guardians
pub fn represented_sequences(direct: &BTreeSet<u32>, compensated: &BTreeSet<u32>) -> BTreeSet<u32> {
    direct.union(compensated).cloned().collect()
}
