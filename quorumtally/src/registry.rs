use crate::*;
use std::collections::BTreeSet;
use tracing::{debug, info, warn};
use uuid::Uuid;

/// Guardian bookkeeping for one store: who exists, who has submitted, who is missing.
///
/// A guardian counts as submitted purely by the presence of an accepted share.
pub struct GuardianRegistry<'a, S: Store + ?Sized> {
    store: &'a S,
}

impl<'a, S: Store + ?Sized> GuardianRegistry<'a, S> {
    pub fn new(store: &'a S) -> Self {
        GuardianRegistry { store }
    }

    /// All guardians, ordered by sequence order (the engine's interpolation index)
    pub async fn list_guardians(&self, election_id: Uuid) -> Result<Vec<Guardian>, Error> {
        self.store.get_guardians(election_id).await
    }

    /// Get a guardian, failing with `InvalidArgument` if it is not part of the election
    pub async fn guardian(
        &self,
        election_id: Uuid,
        sequence_order: u32,
    ) -> Result<Guardian, Error> {
        self.store
            .get_guardian(election_id, sequence_order)
            .await?
            .ok_or_else(|| {
                Error::InvalidArgument(format!(
                    "guardian {} is not part of election {}",
                    sequence_order, election_id
                ))
            })
    }

    /// Record a guardian's share. An identical resubmission is a no-op; a different one fails
    /// with `Conflict` and leaves the stored share untouched.
    pub async fn mark_submitted(
        &self,
        election_id: Uuid,
        sequence_order: u32,
        share: DecryptionShare,
    ) -> Result<ShareOutcome, Error> {
        let fingerprint = share.fingerprint();
        match self
            .store
            .record_share(election_id, sequence_order, share)
            .await
        {
            Ok(ShareOutcome::Accepted) => {
                info!(
                    election = %election_id,
                    sequence = sequence_order,
                    share = %fingerprint,
                    "partial decryption accepted"
                );
                Ok(ShareOutcome::Accepted)
            }
            Ok(ShareOutcome::Unchanged) => {
                debug!(
                    election = %election_id,
                    sequence = sequence_order,
                    "identical partial decryption resubmitted"
                );
                Ok(ShareOutcome::Unchanged)
            }
            Err(e @ Error::Conflict { .. }) => {
                warn!(
                    election = %election_id,
                    sequence = sequence_order,
                    share = %fingerprint,
                    "rejected conflicting partial decryption"
                );
                Err(e)
            }
            Err(e) => Err(e),
        }
    }

    pub async fn count_submitted(&self, election_id: Uuid) -> Result<u32, Error> {
        Ok(self.available_sequences(election_id).await?.len() as u32)
    }

    /// Sequence orders of guardians with an accepted share
    pub async fn available_sequences(&self, election_id: Uuid) -> Result<BTreeSet<u32>, Error> {
        Ok(self
            .list_guardians(election_id)
            .await?
            .iter()
            .filter(|g| g.has_submitted())
            .map(|g| g.sequence_order)
            .collect())
    }

    /// Sequence orders of guardians without a share: all sequences minus available ones
    pub async fn missing_sequences(&self, election_id: Uuid) -> Result<BTreeSet<u32>, Error> {
        let election = self.store.get_election(election_id).await?;
        let available = self.available_sequences(election_id).await?;
        Ok(election
            .sequences()
            .filter(|s| !available.contains(s))
            .collect())
    }

    /// Check that the stored guardians agree with the election's guardian count
    pub async fn check_integrity(&self, election: &Election) -> Result<Vec<Guardian>, Error> {
        let guardians = self.list_guardians(election.id).await?;
        if guardians.len() as u32 > election.guardian_count {
            return Err(Error::Corrupted(format!(
                "election {} has {} guardians but only {} are expected",
                election.id,
                guardians.len(),
                election.guardian_count
            )));
        }
        for guardian in &guardians {
            if guardian.election_id != election.id
                || !election.sequences().contains(&guardian.sequence_order)
            {
                return Err(Error::Corrupted(format!(
                    "guardian {} does not belong to election {}",
                    guardian.sequence_order, election.id
                )));
            }
        }
        Ok(guardians)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    async fn setup(n: u32) -> (MemStore, Uuid) {
        let store = MemStore::default();
        let election =
            Election::new(n, 1, Blob::from("pk"), Blob::from("c"), Blob::from("b")).unwrap();
        let id = election.id;
        store.insert_election(election).await.unwrap();
        for seq in 1..=n {
            store
                .insert_guardian(Guardian::new(id, seq, Blob::from("pk"), Blob::from("bk")))
                .await
                .unwrap();
        }
        (store, id)
    }

    fn share(tag: &str) -> DecryptionShare {
        DecryptionShare {
            tally_share: Blob::from(tag),
            ballot_share: Blob::from(tag),
            proof: Blob::from(tag),
        }
    }

    fn listed(sequences: BTreeSet<u32>) -> Vec<u32> {
        sequences.into_iter().collect()
    }

    #[tokio::test]
    async fn available_and_missing() {
        let (store, id) = setup(4).await;
        let registry = GuardianRegistry::new(&store);

        assert_eq!(registry.count_submitted(id).await.unwrap(), 0);
        assert_eq!(
            listed(registry.missing_sequences(id).await.unwrap()),
            vec![1, 2, 3, 4]
        );

        registry.mark_submitted(id, 3, share("three")).await.unwrap();
        registry.mark_submitted(id, 1, share("one")).await.unwrap();

        assert_eq!(registry.count_submitted(id).await.unwrap(), 2);
        assert_eq!(
            listed(registry.available_sequences(id).await.unwrap()),
            vec![1, 3]
        );
        assert_eq!(
            listed(registry.missing_sequences(id).await.unwrap()),
            vec![2, 4]
        );
    }

    #[tokio::test]
    async fn resubmission() {
        let (store, id) = setup(2).await;
        let registry = GuardianRegistry::new(&store);

        assert_eq!(
            registry.mark_submitted(id, 2, share("a")).await.unwrap(),
            ShareOutcome::Accepted
        );
        for _ in 0..3 {
            assert_eq!(
                registry.mark_submitted(id, 2, share("a")).await.unwrap(),
                ShareOutcome::Unchanged
            );
        }
        assert!(matches!(
            registry.mark_submitted(id, 2, share("b")).await,
            Err(Error::Conflict { .. })
        ));
        assert_eq!(
            registry.guardian(id, 2).await.unwrap().share,
            Some(share("a"))
        );
        assert_eq!(registry.count_submitted(id).await.unwrap(), 1);

        assert!(matches!(
            registry.guardian(id, 9).await,
            Err(Error::InvalidArgument(_))
        ));
    }
}
