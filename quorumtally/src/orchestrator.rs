//! Threshold decryption orchestration.
//!
//! Guardians submit partial decryptions of the ciphertext tally. Guardians that never show up
//! are covered by present guardians computing compensated shares from the missing guardian's
//! key backup. Once at least `quorum` guardians are represented, the shares are combined by the
//! cryptographic engine exactly once and the election becomes `decrypted`.

use crate::*;
use std::collections::{BTreeSet, HashMap};
use std::future::Future;
use std::sync::{Arc, Mutex};
use std::time::Duration;
use tokio::sync::{Mutex as AsyncMutex, OwnedMutexGuard};
use tracing::{debug, error, info, warn};
use uuid::Uuid;

#[derive(Debug, Clone, PartialEq)]
pub struct OrchestratorConfig {
    /// Upper bound on any single engine call. Hitting it leaves all state untouched.
    pub engine_timeout: Duration,
}

impl Default for OrchestratorConfig {
    fn default() -> Self {
        OrchestratorConfig {
            engine_timeout: Duration::from_secs(120),
        }
    }
}

/// A guardian's engine-produced share, submitted directly
#[derive(Serialize, Deserialize, Debug, Clone, PartialEq)]
pub struct PartialDecryptionSubmission {
    pub sequence_order: u32,

    /// Must match the guardian's registered public key
    pub public_key: Blob,

    pub share: DecryptionShare,
}

/// Ask the engine to compute a guardian's share from its private material, then submit it
#[derive(Serialize, Deserialize, Debug, Clone, PartialEq)]
pub struct PartialDecryptionComputation {
    pub sequence_order: u32,
    pub public_key: Blob,
    pub private_material: Blob,
}

/// A present guardian offering to stand in for a missing one
#[derive(Serialize, Deserialize, Debug, Clone, PartialEq)]
pub struct CompensationRequest {
    pub compensating_sequence: u32,
    pub missing_sequence: u32,

    /// The compensating guardian's registered public key
    pub public_key: Blob,

    /// The compensating guardian's own private material
    pub private_material: Blob,
}

#[derive(Serialize, Deserialize, Debug, Clone, PartialEq)]
pub struct SubmissionReceipt {
    pub election_id: Uuid,
    pub sequence_order: u32,
    pub outcome: ShareOutcome,
    pub status: ElectionStatus,
}

#[derive(Serialize, Deserialize, Debug, Clone, PartialEq)]
pub struct DecryptionProgress {
    pub election_id: Uuid,
    pub status: ElectionStatus,
    pub total_guardians: u32,
    pub quorum: u32,
    pub submitted_count: u32,
    pub missing_sequences: Vec<u32>,

    /// Missing guardians covered by at least one compensated share
    pub compensated_sequences: Vec<u32>,

    pub represented_count: u32,
    pub quorum_met: bool,
}

/// Everything needed for one combine call
struct CombinePlan {
    request: CombineRequest,
    direct: BTreeSet<u32>,
    compensated: BTreeSet<u32>,
}

/// One async mutex per election. Operations on different elections don't contend.
#[derive(Default)]
struct ElectionLocks {
    locks: Mutex<HashMap<Uuid, Arc<AsyncMutex<()>>>>,
}

impl ElectionLocks {
    /// Lock one election. Entries that nobody holds or waits on are dropped on the way.
    async fn acquire(&self, election_id: Uuid) -> Result<OwnedMutexGuard<()>, Error> {
        let lock = {
            let mut locks = self
                .locks
                .lock()
                .map_err(|_| Error::Internal("election lock table poisoned".into()))?;
            locks.retain(|_, lock| Arc::strong_count(lock) > 1);
            locks
                .entry(election_id)
                .or_insert_with(|| Arc::new(AsyncMutex::new(())))
                .clone()
        };
        Ok(lock.lock_owned().await)
    }

    #[cfg(test)]
    fn len(&self) -> usize {
        self.locks.lock().map(|locks| locks.len()).unwrap_or(0)
    }
}

pub struct Orchestrator<S: Store, E: CryptoEngine> {
    store: S,
    engine: E,
    config: OrchestratorConfig,
    locks: ElectionLocks,
}

impl<S: Store, E: CryptoEngine> Orchestrator<S, E> {
    pub fn new(store: S, engine: E, config: OrchestratorConfig) -> Self {
        Orchestrator {
            store,
            engine,
            config,
            locks: ElectionLocks::default(),
        }
    }

    pub fn store(&self) -> &S {
        &self.store
    }

    pub fn engine(&self) -> &E {
        &self.engine
    }

    pub fn registry(&self) -> GuardianRegistry<'_, S> {
        GuardianRegistry::new(&self.store)
    }

    pub fn shares(&self) -> ShareStore<'_, S> {
        ShareStore::new(&self.store)
    }

    /// Submit a guardian's partial decryption.
    ///
    /// The first accepted share moves the election `tallied -> partial_decryption`. Never
    /// combines.
    pub async fn submit_partial_decryption(
        &self,
        election_id: Uuid,
        submission: PartialDecryptionSubmission,
    ) -> Result<SubmissionReceipt, Error> {
        let _guard = self.lock_election(election_id).await?;
        self.accept_share(election_id, submission).await
    }

    /// Have the engine compute a guardian's partial decryption, then submit it.
    ///
    /// A guardian that already has an accepted share gets its existing receipt back without
    /// an engine call.
    pub async fn compute_partial_decryption(
        &self,
        election_id: Uuid,
        computation: PartialDecryptionComputation,
    ) -> Result<SubmissionReceipt, Error> {
        let election = self.store.get_election(election_id).await?;
        require_any_phase(
            &election,
            &[ElectionStatus::Tallied, ElectionStatus::PartialDecryption],
        )?;
        let guardian = self
            .credentialed_guardian(
                election_id,
                computation.sequence_order,
                &computation.public_key,
            )
            .await?;
        if guardian.has_submitted() {
            return Ok(self.unchanged_receipt(&election, guardian.sequence_order));
        }

        let request = PartialDecryptionRequest {
            context: ElectionContext::from(&election),
            guardian_sequence: guardian.sequence_order,
            guardian_public_key: guardian.public_key.clone(),
            private_material: computation.private_material,
            ciphertext_tally: election.ciphertext_tally()?.clone(),
            submitted_ballots: self.ballot_ciphertexts(election_id).await?,
        };
        let share = self
            .call_engine(
                "partial decryption",
                self.engine.compute_partial_decryption(&request),
            )
            .await?;

        let _guard = self.lock_election(election_id).await?;

        // A concurrent computation for the same guardian won; its share stands
        let current = self
            .store
            .get_guardian(election_id, guardian.sequence_order)
            .await?;
        if let Some(current) = current {
            if current.has_submitted() {
                let election = self.store.get_election(election_id).await?;
                return Ok(self.unchanged_receipt(&election, guardian.sequence_order));
            }
        }

        self.accept_share(
            election_id,
            PartialDecryptionSubmission {
                sequence_order: guardian.sequence_order,
                public_key: guardian.public_key,
                share,
            },
        )
        .await
    }

    /// Compute and record a compensated share for a missing guardian.
    ///
    /// Each `(compensating, missing)` pair is recorded at most once; a repeat fails with
    /// `DuplicateCompensation` and leaves the first record as it was.
    pub async fn request_compensation(
        &self,
        election_id: Uuid,
        request: CompensationRequest,
    ) -> Result<CompensatedDecryptionShare, Error> {
        let (election, missing) = self.check_compensation(election_id, &request).await?;

        let engine_request = CompensatedDecryptionRequest {
            context: ElectionContext::from(&election),
            compensating_sequence: request.compensating_sequence,
            missing_sequence: request.missing_sequence,
            private_material: request.private_material.clone(),
            missing_public_key: missing.public_key,
            missing_backup: missing.backup,
            ciphertext_tally: election.ciphertext_tally()?.clone(),
            submitted_ballots: self.ballot_ciphertexts(election_id).await?,
        };
        let shares = self
            .call_engine(
                "compensated decryption",
                self.engine.compute_compensated_decryption(&engine_request),
            )
            .await?;

        let _guard = self.lock_election(election_id).await?;

        // Things may have moved while the engine was working
        self.check_compensation(election_id, &request).await?;

        let record = CompensatedDecryptionShare {
            election_id,
            compensating_sequence: request.compensating_sequence,
            missing_sequence: request.missing_sequence,
            tally_share: shares.tally_share,
            ballot_share: shares.ballot_share,
        };
        self.shares().record_compensation(record.clone()).await?;
        Ok(record)
    }

    /// Combine the collected shares, exactly once.
    ///
    /// Holds the election lock for the whole attempt. Once the election is decrypted, further
    /// calls return the stored result without touching the engine. A tallied election that no
    /// guardian has answered for yet is below quorum. An engine failure leaves the election in
    /// `partial_decryption` and can be retried.
    pub async fn attempt_combine(&self, election_id: Uuid) -> Result<DecryptionResult, Error> {
        let _guard = self.lock_election(election_id).await?;

        let election = self.store.get_election(election_id).await?;
        if election.status == ElectionStatus::Decrypted {
            debug!(election = %election_id, "already decrypted, returning stored result");
            return self.stored_result(&election).await;
        }
        if election.status == ElectionStatus::Tallied {
            let represented = self.registry().count_submitted(election_id).await?;
            if represented < election.quorum {
                return Err(Error::QuorumNotMet {
                    election_id,
                    required: election.quorum,
                    represented,
                });
            }
        }
        require_phase(&election, ElectionStatus::PartialDecryption)?;

        let plan = match self.plan_combination(&election).await {
            Ok(plan) => plan,
            Err(e @ Error::Corrupted(_)) => {
                self.mark_corrupted(&election, &e).await;
                return Err(e);
            }
            Err(e) => return Err(e),
        };

        info!(
            election = %election_id,
            direct = ?plan.direct,
            compensated = ?plan.compensated,
            "combining decryption shares"
        );
        let response = self
            .call_engine("combine", self.engine.combine(&plan.request))
            .await?;

        let result = DecryptionResult {
            election_id,
            results: response.results,
            direct_sequences: plan.direct.into_iter().collect(),
            compensated_sequences: plan.compensated.into_iter().collect(),
        };

        if !self.store.finalize_decryption(result.clone()).await? {
            let current = self.store.get_election(election_id).await?;
            if current.status == ElectionStatus::Decrypted {
                return self.stored_result(&current).await;
            }
            return Err(Error::InvalidPhase {
                election_id,
                expected: ElectionStatus::PartialDecryption.to_string(),
                actual: current.status,
            });
        }

        info!(
            election = %election_id,
            results = %result.results.fingerprint(),
            "election partial_decryption -> decrypted"
        );
        Ok(result)
    }

    /// Where decryption of an election stands
    pub async fn decryption_progress(
        &self,
        election_id: Uuid,
    ) -> Result<DecryptionProgress, Error> {
        let election = self.store.get_election(election_id).await?;
        let guardians = self.registry().check_integrity(&election).await?;

        let direct: BTreeSet<u32> = guardians
            .iter()
            .filter(|g| g.has_submitted())
            .map(|g| g.sequence_order)
            .collect();
        let missing: BTreeSet<u32> = election
            .sequences()
            .filter(|s| !direct.contains(s))
            .collect();
        let compensated: BTreeSet<u32> = self
            .shares()
            .compensated_sequences(election_id)
            .await?
            .intersection(&missing)
            .cloned()
            .collect();
        let represented = represented_sequences(&direct, &compensated);

        Ok(DecryptionProgress {
            election_id,
            status: election.status,
            total_guardians: election.guardian_count,
            quorum: election.quorum,
            submitted_count: direct.len() as u32,
            missing_sequences: missing.into_iter().collect(),
            compensated_sequences: compensated.into_iter().collect(),
            represented_count: represented.len() as u32,
            quorum_met: represented.len() as u32 >= election.quorum,
        })
    }

    /// The stored result of a decrypted election
    pub async fn decryption_result(&self, election_id: Uuid) -> Result<DecryptionResult, Error> {
        let election = self.store.get_election(election_id).await?;
        require_phase(&election, ElectionStatus::Decrypted)?;
        self.stored_result(&election).await
    }

    /// Give up on decrypting an election: `partial_decryption -> failed`
    pub async fn fail_decryption(&self, election_id: Uuid, reason: &str) -> Result<(), Error> {
        let _guard = self.lock_election(election_id).await?;
        let election = self.store.get_election(election_id).await?;
        require_phase(&election, ElectionStatus::PartialDecryption)?;
        transition(
            &self.store,
            election_id,
            ElectionStatus::PartialDecryption,
            ElectionStatus::Failed,
        )
        .await?;
        warn!(election = %election_id, reason, "decryption failed");
        Ok(())
    }

    /// Take the election lock. Unknown elections fail before they get a lock table entry.
    async fn lock_election(&self, election_id: Uuid) -> Result<OwnedMutexGuard<()>, Error> {
        self.store.get_election(election_id).await?;
        self.locks.acquire(election_id).await
    }

    // Must be called with the election lock held
    async fn accept_share(
        &self,
        election_id: Uuid,
        submission: PartialDecryptionSubmission,
    ) -> Result<SubmissionReceipt, Error> {
        let election = self.store.get_election(election_id).await?;
        require_any_phase(
            &election,
            &[ElectionStatus::Tallied, ElectionStatus::PartialDecryption],
        )?;
        self.credentialed_guardian(
            election_id,
            submission.sequence_order,
            &submission.public_key,
        )
        .await?;
        if submission.share.tally_share.is_empty() {
            return Err(Error::InvalidArgument("empty tally share".into()));
        }

        let outcome = self
            .registry()
            .mark_submitted(election_id, submission.sequence_order, submission.share)
            .await?;

        // Also repairs an election whose first share was stored without the status change
        let mut status = election.status;
        if status == ElectionStatus::Tallied {
            let moved = transition(
                &self.store,
                election_id,
                ElectionStatus::Tallied,
                ElectionStatus::PartialDecryption,
            )
            .await;
            match moved {
                Ok(()) => {}
                Err(Error::InvalidPhase {
                    actual: ElectionStatus::PartialDecryption,
                    ..
                }) => {}
                Err(e) => return Err(e),
            }
            status = ElectionStatus::PartialDecryption;
        }

        Ok(SubmissionReceipt {
            election_id,
            sequence_order: submission.sequence_order,
            outcome,
            status,
        })
    }

    fn unchanged_receipt(&self, election: &Election, sequence_order: u32) -> SubmissionReceipt {
        debug!(
            election = %election.id,
            sequence = sequence_order,
            "guardian already submitted, skipping engine"
        );
        SubmissionReceipt {
            election_id: election.id,
            sequence_order,
            outcome: ShareOutcome::Unchanged,
            status: election.status,
        }
    }

    /// Look up a guardian and check the presented public key against the registry
    async fn credentialed_guardian(
        &self,
        election_id: Uuid,
        sequence_order: u32,
        public_key: &Blob,
    ) -> Result<Guardian, Error> {
        let guardian = self.registry().guardian(election_id, sequence_order).await?;
        if guardian.public_key != *public_key {
            warn!(
                election = %election_id,
                sequence = sequence_order,
                "public key does not match registered guardian"
            );
            return Err(Error::InvalidArgument(format!(
                "credential does not match guardian {}",
                sequence_order
            )));
        }
        Ok(guardian)
    }

    /// Validate a compensation request, returning the election and the missing guardian
    async fn check_compensation(
        &self,
        election_id: Uuid,
        request: &CompensationRequest,
    ) -> Result<(Election, Guardian), Error> {
        let c = request.compensating_sequence;
        let m = request.missing_sequence;
        if c == m {
            return Err(Error::InvalidArgument(format!(
                "guardian {} cannot compensate for itself",
                c
            )));
        }

        let election = self.store.get_election(election_id).await?;
        require_phase(&election, ElectionStatus::PartialDecryption)?;

        let compensating = self
            .credentialed_guardian(election_id, c, &request.public_key)
            .await?;
        let missing = self.registry().guardian(election_id, m).await?;

        let key = CompensationKey {
            election_id,
            compensating_sequence: c,
            missing_sequence: m,
        };
        if self.shares().compensation(key).await?.is_some() {
            return Err(Error::DuplicateCompensation {
                election_id,
                compensating: c,
                missing: m,
            });
        }

        if !compensating.has_submitted() {
            return Err(Error::InvalidArgument(format!(
                "guardian {} has not submitted its own share and cannot compensate",
                c
            )));
        }
        if missing.has_submitted() {
            return Err(Error::InvalidArgument(format!(
                "guardian {} is not missing",
                m
            )));
        }

        Ok((election, missing))
    }

    async fn plan_combination(&self, election: &Election) -> Result<CombinePlan, Error> {
        let election_id = election.id;
        let guardians = self.registry().check_integrity(election).await?;
        let ciphertext_tally = election.ciphertext_tally()?.clone();

        let known: BTreeSet<u32> = guardians.iter().map(|g| g.sequence_order).collect();
        let direct: BTreeSet<u32> = guardians
            .iter()
            .filter(|g| g.has_submitted())
            .map(|g| g.sequence_order)
            .collect();

        let shares = self.shares();
        for record in shares.compensations(election_id).await? {
            if !known.contains(&record.compensating_sequence)
                || !known.contains(&record.missing_sequence)
            {
                return Err(Error::Corrupted(format!(
                    "compensation {} references an unknown guardian",
                    record.key()
                )));
            }
        }

        let selected = shares.select_compensations(election_id, &direct).await?;
        let compensated: BTreeSet<u32> = selected.iter().map(|c| c.missing_sequence).collect();
        let represented = represented_sequences(&direct, &compensated);

        if (represented.len() as u32) < election.quorum {
            return Err(Error::QuorumNotMet {
                election_id,
                required: election.quorum,
                represented: represented.len() as u32,
            });
        }

        let guardian_shares = guardians
            .into_iter()
            .filter_map(|g| {
                let public_key = g.public_key;
                let sequence_order = g.sequence_order;
                g.share.map(|share| GuardianShare {
                    sequence_order,
                    public_key,
                    tally_share: share.tally_share,
                    ballot_share: share.ballot_share,
                    proof: share.proof,
                })
            })
            .collect();

        Ok(CombinePlan {
            request: CombineRequest {
                context: ElectionContext::from(election),
                guardian_shares,
                compensated_shares: selected,
                ciphertext_tally,
                submitted_ballots: self.ballot_ciphertexts(election_id).await?,
            },
            direct,
            compensated,
        })
    }

    async fn stored_result(&self, election: &Election) -> Result<DecryptionResult, Error> {
        self.store.get_result(election.id).await?.ok_or_else(|| {
            Error::Corrupted(format!(
                "election {} is decrypted but has no stored result",
                election.id
            ))
        })
    }

    async fn mark_corrupted(&self, election: &Election, cause: &Error) {
        error!(election = %election.id, "{}", cause);
        let failed = transition(
            &self.store,
            election.id,
            ElectionStatus::PartialDecryption,
            ElectionStatus::Failed,
        )
        .await;
        if let Err(e) = failed {
            error!(election = %election.id, "unable to mark election failed: {}", e);
        }
    }

    async fn ballot_ciphertexts(&self, election_id: Uuid) -> Result<Vec<Blob>, Error> {
        Ok(self
            .store
            .get_ballots(election_id)
            .await?
            .into_iter()
            .map(|b| b.ciphertext)
            .collect())
    }

    async fn call_engine<T, F>(&self, what: &str, call: F) -> Result<T, Error>
    where
        F: Future<Output = Result<T, Error>>,
    {
        match tokio::time::timeout(self.config.engine_timeout, call).await {
            Ok(Ok(value)) => Ok(value),
            Ok(Err(e)) => {
                warn!("{} failed: {}", what, e);
                Err(e)
            }
            Err(_) => {
                warn!(
                    "{} timed out after {:?}",
                    what, self.config.engine_timeout
                );
                Err(Error::EngineUnavailable(format!(
                    "{} timed out after {:?}",
                    what, self.config.engine_timeout
                )))
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::tests::{election_in, setup_election, submission};

    #[tokio::test]
    async fn unknown_elections_leave_no_lock_behind() {
        let (orchestrator, _) = election_in(3, 2, ElectionStatus::Tallied).await;

        for _ in 0..100 {
            let err = orchestrator
                .submit_partial_decryption(Uuid::new_v4(), submission(1))
                .await
                .unwrap_err();
            assert!(matches!(err, Error::ElectionNotFound(_)));
            assert!(orchestrator.attempt_combine(Uuid::new_v4()).await.is_err());
        }
        assert_eq!(orchestrator.locks.len(), 0);
    }

    #[tokio::test]
    async fn idle_locks_are_dropped() {
        let (orchestrator, first) = election_in(3, 2, ElectionStatus::Tallied).await;
        let second = setup_election(orchestrator.store(), 3, 2, ElectionStatus::Tallied).await;

        orchestrator
            .submit_partial_decryption(first, submission(1))
            .await
            .unwrap();
        assert_eq!(orchestrator.locks.len(), 1);

        orchestrator
            .submit_partial_decryption(second, submission(1))
            .await
            .unwrap();
        assert_eq!(orchestrator.locks.len(), 1);

        // A held lock survives the sweep
        let guard = orchestrator.locks.acquire(first).await.unwrap();
        orchestrator
            .submit_partial_decryption(second, submission(2))
            .await
            .unwrap();
        assert_eq!(orchestrator.locks.len(), 2);
        drop(guard);
    }
}
