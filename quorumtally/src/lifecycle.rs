//! The election state machine.
//!
//! `created -> guardians_ready -> voting_open -> voting_closed -> tallied -> partial_decryption
//! -> decrypted`, with `failed` reachable from `partial_decryption`. The steps up to `tallied`
//! are driven by election setup and voting; the steps after it belong to the decryption
//! orchestrator.

use crate::*;
use tracing::info;
use uuid::Uuid;

/// Fail with `InvalidPhase` unless the election is in `expected`
pub fn require_phase(election: &Election, expected: ElectionStatus) -> Result<(), Error> {
    require_any_phase(election, &[expected])
}

/// Fail with `InvalidPhase` unless the election is in one of `expected`
pub fn require_any_phase(election: &Election, expected: &[ElectionStatus]) -> Result<(), Error> {
    if expected.contains(&election.status) {
        return Ok(());
    }
    let expected: Vec<&str> = expected.iter().map(|s| s.name()).collect();
    Err(Error::InvalidPhase {
        election_id: election.id,
        expected: expected.join(" or "),
        actual: election.status,
    })
}

/// Apply a single `from -> to` step with a compare-and-set on the stored status.
///
/// If another caller moved the election first, this fails with `InvalidPhase` carrying the
/// status that was actually found.
pub async fn transition<S: Store + ?Sized>(
    store: &S,
    election_id: Uuid,
    from: ElectionStatus,
    to: ElectionStatus,
) -> Result<(), Error> {
    if !from.can_transition_to(to) {
        return Err(Error::InvalidArgument(format!(
            "illegal transition {} -> {}",
            from, to
        )));
    }

    if store.compare_and_set_status(election_id, from, to).await? {
        info!(election = %election_id, "election {} -> {}", from, to);
        return Ok(());
    }

    let current = store.get_election(election_id).await?;
    Err(Error::InvalidPhase {
        election_id,
        expected: from.to_string(),
        actual: current.status,
    })
}

/// Create an election in the `Created` status
pub async fn create_election<S: Store + ?Sized>(
    store: &S,
    election: Election,
) -> Result<(), Error> {
    require_phase(&election, ElectionStatus::Created)?;
    if election.encrypted_tally.is_some() {
        return Err(Error::InvalidArgument(
            "a new election cannot carry a tally".into(),
        ));
    }
    let id = election.id;
    store.insert_election(election).await?;
    info!(election = %id, "election created");
    Ok(())
}

/// Register a guardian produced by key generation. Only allowed while the election is `Created`.
pub async fn register_guardian<S: Store + ?Sized>(
    store: &S,
    guardian: Guardian,
) -> Result<(), Error> {
    let election = store.get_election(guardian.election_id).await?;
    require_phase(&election, ElectionStatus::Created)?;
    if guardian.has_submitted() {
        return Err(Error::InvalidArgument(
            "a guardian cannot be registered with a decryption share".into(),
        ));
    }
    let sequence = guardian.sequence_order;
    store.insert_guardian(guardian).await?;
    info!(election = %election.id, sequence, "guardian registered");
    Ok(())
}

/// Register a cast ballot. Only allowed while voting is open; the status is checked by the
/// store in the same step as the insert.
pub async fn register_ballot<S: Store + ?Sized>(
    store: &S,
    ballot: SubmittedBallot,
) -> Result<(), Error> {
    let election_id = ballot.election_id;
    if store.insert_ballot(ballot, ElectionStatus::VotingOpen).await? {
        return Ok(());
    }

    let current = store.get_election(election_id).await?;
    Err(Error::InvalidPhase {
        election_id,
        expected: ElectionStatus::VotingOpen.to_string(),
        actual: current.status,
    })
}

/// Take one of the externally driven steps: `created -> guardians_ready`,
/// `guardians_ready -> voting_open` or `voting_open -> voting_closed`.
///
/// Returns the new status.
pub async fn advance<S: Store + ?Sized>(
    store: &S,
    election_id: Uuid,
    from: ElectionStatus,
) -> Result<ElectionStatus, Error> {
    let to = match from {
        ElectionStatus::Created => ElectionStatus::GuardiansReady,
        ElectionStatus::GuardiansReady => ElectionStatus::VotingOpen,
        ElectionStatus::VotingOpen => ElectionStatus::VotingClosed,
        ElectionStatus::VotingClosed => {
            return Err(Error::InvalidArgument(
                "an election is tallied by recording its ciphertext tally".into(),
            ))
        }
        other => {
            return Err(Error::InvalidArgument(format!(
                "{} is advanced by the decryption orchestrator",
                other
            )))
        }
    };

    let election = store.get_election(election_id).await?;
    require_phase(&election, from)?;

    if to == ElectionStatus::GuardiansReady {
        let registered = store.get_guardians(election_id).await?.len() as u32;
        if registered != election.guardian_count {
            return Err(Error::InvalidArgument(format!(
                "{} of {} guardians registered",
                registered, election.guardian_count
            )));
        }
    }

    transition(store, election_id, from, to).await?;
    Ok(to)
}

/// Store the ciphertext tally and take `voting_closed -> tallied`
pub async fn record_tally<S: Store + ?Sized>(
    store: &S,
    election_id: Uuid,
    ciphertext_tally: Blob,
) -> Result<(), Error> {
    if ciphertext_tally.is_empty() {
        return Err(Error::InvalidArgument("empty ciphertext tally".into()));
    }

    if store
        .record_tally(election_id, ElectionStatus::VotingClosed, ciphertext_tally)
        .await?
    {
        info!(election = %election_id, "election voting_closed -> tallied");
        return Ok(());
    }

    let current = store.get_election(election_id).await?;
    Err(Error::InvalidPhase {
        election_id,
        expected: ElectionStatus::VotingClosed.to_string(),
        actual: current.status,
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    async fn setup(n: u32, k: u32) -> (MemStore, Uuid) {
        let store = MemStore::default();
        let election = Election::new(
            n,
            k,
            Blob::from("joint key"),
            Blob::from("commitment"),
            Blob::from("base"),
        )
        .unwrap();
        let id = election.id;
        create_election(&store, election).await.unwrap();
        (store, id)
    }

    #[tokio::test]
    async fn full_setup_path() {
        let (store, id) = setup(2, 1).await;

        // Not every guardian is registered yet
        register_guardian(&store, Guardian::new(id, 1, Blob::from("pk1"), Blob::from("b1")))
            .await
            .unwrap();
        assert!(matches!(
            advance(&store, id, ElectionStatus::Created).await,
            Err(Error::InvalidArgument(_))
        ));
        register_guardian(&store, Guardian::new(id, 2, Blob::from("pk2"), Blob::from("b2")))
            .await
            .unwrap();

        assert_eq!(
            advance(&store, id, ElectionStatus::Created).await.unwrap(),
            ElectionStatus::GuardiansReady
        );

        // Guardians are fixed once key generation is over
        assert!(matches!(
            register_guardian(&store, Guardian::new(id, 2, Blob::from("x"), Blob::from("x")))
                .await,
            Err(Error::InvalidPhase { .. })
        ));

        // Ballots only while voting is open
        assert!(matches!(
            register_ballot(&store, SubmittedBallot::new(id, Blob::from("early"))).await,
            Err(Error::InvalidPhase { .. })
        ));
        advance(&store, id, ElectionStatus::GuardiansReady)
            .await
            .unwrap();
        register_ballot(&store, SubmittedBallot::new(id, Blob::from("ballot")))
            .await
            .unwrap();
        advance(&store, id, ElectionStatus::VotingOpen).await.unwrap();
        assert!(register_ballot(&store, SubmittedBallot::new(id, Blob::from("late")))
            .await
            .is_err());

        record_tally(&store, id, Blob::from("tally")).await.unwrap();
        let election = store.get_election(id).await.unwrap();
        assert_eq!(election.status, ElectionStatus::Tallied);
        assert_eq!(election.encrypted_tally, Some(Blob::from("tally")));

        // The tally is frozen
        assert!(matches!(
            record_tally(&store, id, Blob::from("other tally")).await,
            Err(Error::InvalidPhase {
                actual: ElectionStatus::Tallied,
                ..
            })
        ));
        assert_eq!(store.get_ballots(id).await.unwrap().len(), 1);
    }

    #[tokio::test]
    async fn ballot_set_is_frozen_by_the_tally() {
        let (store, id) = setup(1, 1).await;
        register_guardian(&store, Guardian::new(id, 1, Blob::from("pk"), Blob::from("b")))
            .await
            .unwrap();
        for from in &[
            ElectionStatus::Created,
            ElectionStatus::GuardiansReady,
            ElectionStatus::VotingOpen,
        ] {
            if *from == ElectionStatus::VotingOpen {
                register_ballot(&store, SubmittedBallot::new(id, Blob::from("cast")))
                    .await
                    .unwrap();
            }
            advance(&store, id, *from).await.unwrap();
        }
        record_tally(&store, id, Blob::from("tally")).await.unwrap();

        // The store refuses the insert once the election has moved past voting_open
        let stale = SubmittedBallot::new(id, Blob::from("stale"));
        assert!(matches!(
            register_ballot(&store, stale).await,
            Err(Error::InvalidPhase {
                actual: ElectionStatus::Tallied,
                ..
            })
        ));
        let ciphertexts: Vec<Blob> = store
            .get_ballots(id)
            .await
            .unwrap()
            .into_iter()
            .map(|b| b.ciphertext)
            .collect();
        assert_eq!(ciphertexts, vec![Blob::from("cast")]);

        assert!(matches!(
            register_ballot(&store, SubmittedBallot::new(Uuid::new_v4(), Blob::from("x"))).await,
            Err(Error::ElectionNotFound(_))
        ));
    }

    #[tokio::test]
    async fn out_of_order_steps() {
        let (store, id) = setup(1, 1).await;

        // Stale `from`
        assert!(matches!(
            advance(&store, id, ElectionStatus::VotingOpen).await,
            Err(Error::InvalidPhase { .. })
        ));

        // Orchestrator-owned steps are not available here
        assert!(advance(&store, id, ElectionStatus::Tallied).await.is_err());
        assert!(advance(&store, id, ElectionStatus::PartialDecryption)
            .await
            .is_err());

        assert!(matches!(
            transition(&store, id, ElectionStatus::Created, ElectionStatus::VotingOpen).await,
            Err(Error::InvalidArgument(_))
        ));
        assert!(matches!(
            transition(
                &store,
                id,
                ElectionStatus::Tallied,
                ElectionStatus::PartialDecryption
            )
            .await,
            Err(Error::InvalidPhase {
                actual: ElectionStatus::Created,
                ..
            })
        ));
        assert_eq!(
            store.get_election(id).await.unwrap().status,
            ElectionStatus::Created
        );
    }

    #[tokio::test]
    async fn phase_guard() {
        let (store, id) = setup(1, 1).await;
        let election = store.get_election(id).await.unwrap();

        assert!(require_phase(&election, ElectionStatus::Created).is_ok());
        let err = require_any_phase(
            &election,
            &[ElectionStatus::Tallied, ElectionStatus::PartialDecryption],
        )
        .unwrap_err();
        match err {
            Error::InvalidPhase {
                expected, actual, ..
            } => {
                assert_eq!(expected, "tallied or partial_decryption");
                assert_eq!(actual, ElectionStatus::Created);
            }
            other => panic!("unexpected error {}", other),
        }
    }
}
