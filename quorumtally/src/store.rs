use crate::*;
use async_trait::async_trait;
use std::collections::BTreeMap;
use std::sync::{Arc, RwLock, RwLockReadGuard, RwLockWriteGuard};
use uuid::Uuid;

/// Durable storage for elections, guardians, compensation records and ballots.
///
/// Every method is applied atomically, and a method that returns an error has changed
/// nothing. Status changes are only ever made through compare-and-set methods so that two
/// concurrent callers cannot both apply the same transition.
#[async_trait]
pub trait Store: Send + Sync {
    /// Get an election, failing with `ElectionNotFound` if it doesn't exist
    async fn get_election(&self, id: Uuid) -> Result<Election, Error>;

    /// Insert a new election
    async fn insert_election(&self, election: Election) -> Result<(), Error>;

    /// Set the status to `new` only if it is currently `expected`
    async fn compare_and_set_status(
        &self,
        id: Uuid,
        expected: ElectionStatus,
        new: ElectionStatus,
    ) -> Result<bool, Error>;

    /// Store the ciphertext tally and move to `Tallied`, only if the status is `expected`
    async fn record_tally(
        &self,
        id: Uuid,
        expected: ElectionStatus,
        tally: Blob,
    ) -> Result<bool, Error>;

    /// Store the result and move `PartialDecryption -> Decrypted` in one step
    async fn finalize_decryption(&self, result: DecryptionResult) -> Result<bool, Error>;

    /// Get the stored decryption result, if any
    async fn get_result(&self, election_id: Uuid) -> Result<Option<DecryptionResult>, Error>;

    /// Insert a guardian. The sequence order must be free and within `1..=n`.
    async fn insert_guardian(&self, guardian: Guardian) -> Result<(), Error>;

    /// All guardians of an election, ordered by sequence order
    async fn get_guardians(&self, election_id: Uuid) -> Result<Vec<Guardian>, Error>;

    /// Record a guardian's partial decryption. Identical resubmissions are a no-op, differing
    /// ones fail with `Conflict`.
    async fn record_share(
        &self,
        election_id: Uuid,
        sequence_order: u32,
        share: DecryptionShare,
    ) -> Result<ShareOutcome, Error>;

    /// Insert a compensation record, failing with `DuplicateCompensation` if the key exists
    async fn insert_compensation(&self, share: CompensatedDecryptionShare) -> Result<(), Error>;

    /// All compensation records of an election, ordered by key
    async fn get_compensations(
        &self,
        election_id: Uuid,
    ) -> Result<Vec<CompensatedDecryptionShare>, Error>;

    /// Add a ballot, only if the election status is `expected`
    async fn insert_ballot(
        &self,
        ballot: SubmittedBallot,
        expected: ElectionStatus,
    ) -> Result<bool, Error>;

    /// Ballots of an election in the order they were cast
    async fn get_ballots(&self, election_id: Uuid) -> Result<Vec<SubmittedBallot>, Error>;

    /// Get a single guardian
    async fn get_guardian(
        &self,
        election_id: Uuid,
        sequence_order: u32,
    ) -> Result<Option<Guardian>, Error> {
        Ok(self
            .get_guardians(election_id)
            .await?
            .into_iter()
            .find(|g| g.sequence_order == sequence_order))
    }

    /// Get a single compensation record
    async fn get_compensation(
        &self,
        key: CompensationKey,
    ) -> Result<Option<CompensatedDecryptionShare>, Error> {
        Ok(self
            .get_compensations(key.election_id)
            .await?
            .into_iter()
            .find(|c| c.key() == key))
    }
}

#[derive(Default)]
struct Tables {
    elections: BTreeMap<Uuid, Election>,
    guardians: BTreeMap<(Uuid, u32), Guardian>,
    compensations: BTreeMap<CompensationKey, CompensatedDecryptionShare>,
    ballots: BTreeMap<Uuid, Vec<SubmittedBallot>>,
    results: BTreeMap<Uuid, DecryptionResult>,
}

impl Tables {
    fn election_mut(&mut self, id: Uuid) -> Result<&mut Election, Error> {
        self.elections
            .get_mut(&id)
            .ok_or(Error::ElectionNotFound(id))
    }
}

/// A store that keeps its tables in memory and loses them on exit. Clones share the same
/// tables. Used in tests and for embedding; the daemon persists with [`SqliteStore`].
#[derive(Default, Clone)]
pub struct MemStore {
    inner: Arc<RwLock<Tables>>,
}

impl MemStore {
    fn read(&self) -> Result<RwLockReadGuard<'_, Tables>, Error> {
        self.inner
            .read()
            .map_err(|_| Error::Internal("store lock poisoned".into()))
    }

    /// Apply `mutate` under the write lock. Every mutation checks before it changes
    /// anything, so an error leaves the tables as they were.
    fn write<T, F>(&self, mutate: F) -> Result<T, Error>
    where
        F: FnOnce(&mut Tables) -> Result<T, Error>,
    {
        let mut tables: RwLockWriteGuard<'_, Tables> = self
            .inner
            .write()
            .map_err(|_| Error::Internal("store lock poisoned".into()))?;

        mutate(&mut *tables)
    }
}

#[async_trait]
impl Store for MemStore {
    async fn get_election(&self, id: Uuid) -> Result<Election, Error> {
        self.read()?
            .elections
            .get(&id)
            .cloned()
            .ok_or(Error::ElectionNotFound(id))
    }

    async fn insert_election(&self, election: Election) -> Result<(), Error> {
        election.validate()?;
        self.write(|t| {
            if t.elections.contains_key(&election.id) {
                return Err(Error::InvalidArgument(format!(
                    "election {} already exists",
                    election.id
                )));
            }
            t.elections.insert(election.id, election);
            Ok(())
        })
    }

    async fn compare_and_set_status(
        &self,
        id: Uuid,
        expected: ElectionStatus,
        new: ElectionStatus,
    ) -> Result<bool, Error> {
        self.write(|t| {
            let election = t.election_mut(id)?;
            if election.status != expected {
                return Ok(false);
            }
            election.status = new;
            Ok(true)
        })
    }

    async fn record_tally(
        &self,
        id: Uuid,
        expected: ElectionStatus,
        tally: Blob,
    ) -> Result<bool, Error> {
        self.write(|t| {
            let election = t.election_mut(id)?;
            if election.status != expected {
                return Ok(false);
            }
            election.encrypted_tally = Some(tally);
            election.status = ElectionStatus::Tallied;
            Ok(true)
        })
    }

    async fn finalize_decryption(&self, result: DecryptionResult) -> Result<bool, Error> {
        self.write(|t| {
            let election = t.election_mut(result.election_id)?;
            if election.status != ElectionStatus::PartialDecryption {
                return Ok(false);
            }
            election.status = ElectionStatus::Decrypted;
            t.results.insert(result.election_id, result);
            Ok(true)
        })
    }

    async fn get_result(&self, election_id: Uuid) -> Result<Option<DecryptionResult>, Error> {
        Ok(self.read()?.results.get(&election_id).cloned())
    }

    async fn insert_guardian(&self, guardian: Guardian) -> Result<(), Error> {
        self.write(|t| {
            let election = t
                .elections
                .get(&guardian.election_id)
                .ok_or(Error::ElectionNotFound(guardian.election_id))?;
            if !election.sequences().contains(&guardian.sequence_order) {
                return Err(Error::InvalidArgument(format!(
                    "sequence order {} is outside 1..={}",
                    guardian.sequence_order, election.guardian_count
                )));
            }
            let key = (guardian.election_id, guardian.sequence_order);
            if t.guardians.contains_key(&key) {
                return Err(Error::InvalidArgument(format!(
                    "sequence order {} is already taken in election {}",
                    key.1, key.0
                )));
            }
            t.guardians.insert(key, guardian);
            Ok(())
        })
    }

    async fn get_guardians(&self, election_id: Uuid) -> Result<Vec<Guardian>, Error> {
        let tables = self.read()?;
        if !tables.elections.contains_key(&election_id) {
            return Err(Error::ElectionNotFound(election_id));
        }
        Ok(tables
            .guardians
            .range((election_id, 0)..=(election_id, u32::MAX))
            .map(|(_, g)| g.clone())
            .collect())
    }

    async fn get_guardian(
        &self,
        election_id: Uuid,
        sequence_order: u32,
    ) -> Result<Option<Guardian>, Error> {
        Ok(self
            .read()?
            .guardians
            .get(&(election_id, sequence_order))
            .cloned())
    }

    async fn record_share(
        &self,
        election_id: Uuid,
        sequence_order: u32,
        share: DecryptionShare,
    ) -> Result<ShareOutcome, Error> {
        self.write(|t| {
            let guardian = t
                .guardians
                .get_mut(&(election_id, sequence_order))
                .ok_or_else(|| {
                    Error::InvalidArgument(format!(
                        "guardian {} is not part of election {}",
                        sequence_order, election_id
                    ))
                })?;

            if let Some(existing) = &guardian.share {
                if *existing == share {
                    return Ok(ShareOutcome::Unchanged);
                }
                return Err(Error::Conflict {
                    election_id,
                    sequence: sequence_order,
                });
            }

            guardian.share = Some(share);
            Ok(ShareOutcome::Accepted)
        })
    }

    async fn insert_compensation(&self, share: CompensatedDecryptionShare) -> Result<(), Error> {
        let key = share.key();
        self.write(|t| {
            if t.compensations.contains_key(&key) {
                return Err(Error::DuplicateCompensation {
                    election_id: key.election_id,
                    compensating: key.compensating_sequence,
                    missing: key.missing_sequence,
                });
            }
            t.compensations.insert(key, share);
            Ok(())
        })
    }

    async fn get_compensations(
        &self,
        election_id: Uuid,
    ) -> Result<Vec<CompensatedDecryptionShare>, Error> {
        let start = CompensationKey {
            election_id,
            compensating_sequence: 0,
            missing_sequence: 0,
        };
        let end = CompensationKey {
            election_id,
            compensating_sequence: u32::MAX,
            missing_sequence: u32::MAX,
        };
        Ok(self
            .read()?
            .compensations
            .range(start..=end)
            .map(|(_, c)| c.clone())
            .collect())
    }

    async fn get_compensation(
        &self,
        key: CompensationKey,
    ) -> Result<Option<CompensatedDecryptionShare>, Error> {
        Ok(self.read()?.compensations.get(&key).cloned())
    }

    async fn insert_ballot(
        &self,
        ballot: SubmittedBallot,
        expected: ElectionStatus,
    ) -> Result<bool, Error> {
        self.write(|t| {
            if t.election_mut(ballot.election_id)?.status != expected {
                return Ok(false);
            }
            let ballots = t
                .ballots
                .entry(ballot.election_id)
                .or_insert_with(Vec::new);
            if ballots.iter().any(|b| b.ballot_id == ballot.ballot_id) {
                return Err(Error::InvalidArgument(format!(
                    "ballot {} already submitted",
                    ballot.ballot_id
                )));
            }
            ballots.push(ballot);
            Ok(true)
        })
    }

    async fn get_ballots(&self, election_id: Uuid) -> Result<Vec<SubmittedBallot>, Error> {
        Ok(self
            .read()?
            .ballots
            .get(&election_id)
            .cloned()
            .unwrap_or_default())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn election(n: u32, k: u32) -> Election {
        Election::new(
            n,
            k,
            Blob::from("joint key"),
            Blob::from("commitment"),
            Blob::from("base"),
        )
        .unwrap()
    }

    fn share(tag: &str) -> DecryptionShare {
        DecryptionShare {
            tally_share: Blob::from(format!("tally {}", tag).as_str()),
            ballot_share: Blob::from(format!("ballots {}", tag).as_str()),
            proof: Blob::from(format!("proof {}", tag).as_str()),
        }
    }

    #[tokio::test]
    async fn guardians_are_ordered_and_unique() {
        let store = MemStore::default();
        let election = election(3, 2);
        let id = election.id;
        store.insert_election(election).await.unwrap();

        for seq in &[3, 1, 2] {
            let g = Guardian::new(id, *seq, Blob::from("pk"), Blob::from("backup"));
            store.insert_guardian(g).await.unwrap();
        }

        let sequences: Vec<u32> = store
            .get_guardians(id)
            .await
            .unwrap()
            .iter()
            .map(|g| g.sequence_order)
            .collect();
        assert_eq!(sequences, vec![1, 2, 3]);

        // Taken and out-of-range sequences are rejected
        let dup = Guardian::new(id, 2, Blob::from("pk"), Blob::from("backup"));
        assert!(matches!(
            store.insert_guardian(dup).await,
            Err(Error::InvalidArgument(_))
        ));
        let out = Guardian::new(id, 4, Blob::from("pk"), Blob::from("backup"));
        assert!(matches!(
            store.insert_guardian(out).await,
            Err(Error::InvalidArgument(_))
        ));
        let zero = Guardian::new(id, 0, Blob::from("pk"), Blob::from("backup"));
        assert!(store.insert_guardian(zero).await.is_err());

        let orphan = Guardian::new(Uuid::new_v4(), 1, Blob::from("pk"), Blob::from("backup"));
        assert!(matches!(
            store.insert_guardian(orphan).await,
            Err(Error::ElectionNotFound(_))
        ));
    }

    #[tokio::test]
    async fn share_recording() {
        let store = MemStore::default();
        let election = election(2, 1);
        let id = election.id;
        store.insert_election(election).await.unwrap();
        store
            .insert_guardian(Guardian::new(id, 1, Blob::from("pk"), Blob::from("b")))
            .await
            .unwrap();

        assert_eq!(
            store.record_share(id, 1, share("a")).await.unwrap(),
            ShareOutcome::Accepted
        );
        assert_eq!(
            store.record_share(id, 1, share("a")).await.unwrap(),
            ShareOutcome::Unchanged
        );
        assert!(matches!(
            store.record_share(id, 1, share("b")).await,
            Err(Error::Conflict { sequence: 1, .. })
        ));
        assert_eq!(
            store.get_guardian(id, 1).await.unwrap().unwrap().share,
            Some(share("a"))
        );

        assert!(matches!(
            store.record_share(id, 2, share("a")).await,
            Err(Error::InvalidArgument(_))
        ));
    }

    #[tokio::test]
    async fn status_compare_and_set() {
        let store = MemStore::default();
        let election = election(1, 1);
        let id = election.id;
        store.insert_election(election).await.unwrap();

        assert!(store
            .compare_and_set_status(id, ElectionStatus::Created, ElectionStatus::GuardiansReady)
            .await
            .unwrap());
        assert!(!store
            .compare_and_set_status(id, ElectionStatus::Created, ElectionStatus::GuardiansReady)
            .await
            .unwrap());
        assert_eq!(
            store.get_election(id).await.unwrap().status,
            ElectionStatus::GuardiansReady
        );

        assert!(!store
            .record_tally(id, ElectionStatus::VotingClosed, Blob::from("tally"))
            .await
            .unwrap());
        assert_eq!(store.get_election(id).await.unwrap().encrypted_tally, None);
    }

    #[tokio::test]
    async fn ballots_follow_the_status() {
        let store = MemStore::default();
        let election = election(1, 1);
        let id = election.id;
        store.insert_election(election).await.unwrap();
        for (from, to) in &[
            (ElectionStatus::Created, ElectionStatus::GuardiansReady),
            (ElectionStatus::GuardiansReady, ElectionStatus::VotingOpen),
        ] {
            store.compare_and_set_status(id, *from, *to).await.unwrap();
        }

        let ballot = SubmittedBallot::new(id, Blob::from("ballot"));
        assert!(store
            .insert_ballot(ballot.clone(), ElectionStatus::VotingOpen)
            .await
            .unwrap());
        assert!(matches!(
            store.insert_ballot(ballot, ElectionStatus::VotingOpen).await,
            Err(Error::InvalidArgument(_))
        ));

        // Once voting closed the ballot set is frozen
        store
            .compare_and_set_status(id, ElectionStatus::VotingOpen, ElectionStatus::VotingClosed)
            .await
            .unwrap();
        let late = SubmittedBallot::new(id, Blob::from("late"));
        assert!(!store
            .insert_ballot(late, ElectionStatus::VotingOpen)
            .await
            .unwrap());
        assert_eq!(store.get_ballots(id).await.unwrap().len(), 1);

        let orphan = SubmittedBallot::new(Uuid::new_v4(), Blob::from("orphan"));
        assert!(matches!(
            store.insert_ballot(orphan, ElectionStatus::VotingOpen).await,
            Err(Error::ElectionNotFound(_))
        ));
    }

    #[tokio::test]
    async fn compensation_is_never_overwritten() {
        let store = MemStore::default();
        let election = election(3, 2);
        let id = election.id;
        store.insert_election(election).await.unwrap();

        let first = CompensatedDecryptionShare {
            election_id: id,
            compensating_sequence: 1,
            missing_sequence: 3,
            tally_share: Blob::from("first"),
            ballot_share: Blob::from("first"),
        };
        let mut second = first.clone();
        second.tally_share = Blob::from("second");

        store.insert_compensation(first.clone()).await.unwrap();
        assert!(matches!(
            store.insert_compensation(second).await,
            Err(Error::DuplicateCompensation {
                compensating: 1,
                missing: 3,
                ..
            })
        ));
        assert_eq!(store.get_compensation(first.key()).await.unwrap(), Some(first));
        assert_eq!(store.get_compensations(Uuid::new_v4()).await.unwrap(), vec![]);
    }
}
