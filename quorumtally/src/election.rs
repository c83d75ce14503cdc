use crate::*;
use uuid::Uuid;

/// Lifecycle status of an election.
///
/// Statuses only ever move forward, one step at a time. `Failed` is absorbing and can only be
/// entered from `PartialDecryption`.
#[derive(Serialize, Deserialize, Copy, Clone, Debug, PartialEq, Eq, Hash, PartialOrd, Ord)]
#[serde(rename_all = "snake_case")]
pub enum ElectionStatus {
    Created,
    GuardiansReady,
    VotingOpen,
    VotingClosed,
    Tallied,
    PartialDecryption,
    Decrypted,
    Failed,
}

impl ElectionStatus {
    pub fn name(&self) -> &'static str {
        match self {
            ElectionStatus::Created => "created",
            ElectionStatus::GuardiansReady => "guardians_ready",
            ElectionStatus::VotingOpen => "voting_open",
            ElectionStatus::VotingClosed => "voting_closed",
            ElectionStatus::Tallied => "tallied",
            ElectionStatus::PartialDecryption => "partial_decryption",
            ElectionStatus::Decrypted => "decrypted",
            ElectionStatus::Failed => "failed",
        }
    }

    /// The next status on the happy path, if any
    pub fn next(&self) -> Option<ElectionStatus> {
        match self {
            ElectionStatus::Created => Some(ElectionStatus::GuardiansReady),
            ElectionStatus::GuardiansReady => Some(ElectionStatus::VotingOpen),
            ElectionStatus::VotingOpen => Some(ElectionStatus::VotingClosed),
            ElectionStatus::VotingClosed => Some(ElectionStatus::Tallied),
            ElectionStatus::Tallied => Some(ElectionStatus::PartialDecryption),
            ElectionStatus::PartialDecryption => Some(ElectionStatus::Decrypted),
            ElectionStatus::Decrypted => None,
            ElectionStatus::Failed => None,
        }
    }

    /// Whether `self -> to` is a legal single step
    pub fn can_transition_to(&self, to: ElectionStatus) -> bool {
        if self.next() == Some(to) {
            return true;
        }
        *self == ElectionStatus::PartialDecryption && to == ElectionStatus::Failed
    }

    /// The ciphertext tally exists and is frozen from this status on
    pub fn is_tallied(&self) -> bool {
        *self >= ElectionStatus::Tallied
    }
}

impl std::fmt::Display for ElectionStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter) -> std::fmt::Result {
        write!(f, "{}", self.name())
    }
}

impl std::str::FromStr for ElectionStatus {
    type Err = Error;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let status = match s {
            "created" => ElectionStatus::Created,
            "guardians_ready" => ElectionStatus::GuardiansReady,
            "voting_open" => ElectionStatus::VotingOpen,
            "voting_closed" => ElectionStatus::VotingClosed,
            "tallied" => ElectionStatus::Tallied,
            "partial_decryption" => ElectionStatus::PartialDecryption,
            "decrypted" => ElectionStatus::Decrypted,
            "failed" => ElectionStatus::Failed,
            _ => {
                return Err(Error::InvalidArgument(format!(
                    "unknown election status {}",
                    s
                )))
            }
        };
        Ok(status)
    }
}

/// An election whose tally is decrypted by a quorum of guardians
#[derive(Serialize, Deserialize, Debug, Clone, PartialEq)]
pub struct Election {
    pub id: Uuid,

    /// Number of guardians holding a share of the election key
    pub guardian_count: u32,

    /// Minimum number of guardians that must be represented to decrypt
    pub quorum: u32,

    pub joint_public_key: Blob,

    /// Manifest / commitment hash, forwarded to the engine when combining
    pub commitment_hash: Blob,

    pub base_hash: Blob,

    pub status: ElectionStatus,

    /// Homomorphically accumulated ciphertext tally, present from `Tallied` on
    #[serde(default)]
    pub encrypted_tally: Option<Blob>,
}

impl Election {
    /// Create a new election in the `Created` status
    pub fn new(
        guardian_count: u32,
        quorum: u32,
        joint_public_key: Blob,
        commitment_hash: Blob,
        base_hash: Blob,
    ) -> Result<Self, Error> {
        let election = Election {
            id: Uuid::new_v4(),
            guardian_count,
            quorum,
            joint_public_key,
            commitment_hash,
            base_hash,
            status: ElectionStatus::Created,
            encrypted_tally: None,
        };
        election.validate()?;
        Ok(election)
    }

    /// Check that the quorum settings are sane
    pub fn validate(&self) -> Result<(), Error> {
        if self.guardian_count == 0 {
            return Err(Error::InvalidArgument(
                "an election needs at least one guardian".into(),
            ));
        }
        if self.quorum == 0 || self.quorum > self.guardian_count {
            return Err(Error::InvalidArgument(format!(
                "quorum {} is invalid for {} guardians",
                self.quorum, self.guardian_count
            )));
        }
        Ok(())
    }

    /// The ciphertext tally, which must exist once the election is tallied
    pub fn ciphertext_tally(&self) -> Result<&Blob, Error> {
        match &self.encrypted_tally {
            Some(tally) => Ok(tally),
            None if self.status.is_tallied() => Err(Error::Corrupted(format!(
                "election {} is {} but has no ciphertext tally",
                self.id, self.status
            ))),
            None => Err(Error::InvalidPhase {
                election_id: self.id,
                expected: ElectionStatus::Tallied.to_string(),
                actual: self.status,
            }),
        }
    }

    /// All sequence orders that guardians of this election can have
    pub fn sequences(&self) -> std::ops::RangeInclusive<u32> {
        1..=self.guardian_count
    }
}

/// A cast ballot, consumed read-only when decrypting challenged ballots
#[derive(Serialize, Deserialize, Debug, Clone, PartialEq)]
pub struct SubmittedBallot {
    pub election_id: Uuid,
    pub ballot_id: Uuid,
    pub ciphertext: Blob,
}

impl SubmittedBallot {
    pub fn new(election_id: Uuid, ciphertext: Blob) -> Self {
        SubmittedBallot {
            election_id,
            ballot_id: Uuid::new_v4(),
            ciphertext,
        }
    }
}

/// The outcome of combining decryption shares. Stored once, when the election becomes
/// `Decrypted`.
#[derive(Serialize, Deserialize, Debug, Clone, PartialEq)]
pub struct DecryptionResult {
    pub election_id: Uuid,

    /// Plaintext tally and challenged ballots, as returned by the engine
    pub results: Blob,

    /// Guardians represented by their own partial decryption
    pub direct_sequences: Vec<u32>,

    /// Missing guardians represented by a compensated share
    pub compensated_sequences: Vec<u32>,
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::str::FromStr;

    #[test]
    fn quorum_bounds() {
        assert!(Election::new(3, 2, Blob::default(), Blob::default(), Blob::default()).is_ok());
        assert!(Election::new(3, 3, Blob::default(), Blob::default(), Blob::default()).is_ok());
        assert!(Election::new(3, 4, Blob::default(), Blob::default(), Blob::default()).is_err());
        assert!(Election::new(3, 0, Blob::default(), Blob::default(), Blob::default()).is_err());
        assert!(Election::new(0, 0, Blob::default(), Blob::default(), Blob::default()).is_err());
    }

    #[test]
    fn status_steps() {
        use ElectionStatus::*;

        assert!(Created.can_transition_to(GuardiansReady));
        assert!(Tallied.can_transition_to(PartialDecryption));
        assert!(PartialDecryption.can_transition_to(Decrypted));
        assert!(PartialDecryption.can_transition_to(Failed));

        assert!(!Created.can_transition_to(VotingOpen));
        assert!(!Tallied.can_transition_to(Failed));
        assert!(!Decrypted.can_transition_to(PartialDecryption));
        assert!(!Failed.can_transition_to(PartialDecryption));
        assert!(!VotingClosed.can_transition_to(VotingOpen));

        assert!(Decrypted.is_tallied());
        assert!(!VotingClosed.is_tallied());
    }

    #[test]
    fn status_names() {
        let json = serde_json::to_string(&ElectionStatus::PartialDecryption).unwrap();
        assert_eq!(json, "\"partial_decryption\"");
        assert_eq!(
            ElectionStatus::from_str("voting_closed").unwrap(),
            ElectionStatus::VotingClosed
        );
        assert!(ElectionStatus::from_str("archived").is_err());
    }

    #[test]
    fn missing_tally() {
        let mut election =
            Election::new(1, 1, Blob::default(), Blob::default(), Blob::default()).unwrap();
        assert!(matches!(
            election.ciphertext_tally(),
            Err(Error::InvalidPhase { .. })
        ));

        election.status = ElectionStatus::PartialDecryption;
        assert!(matches!(
            election.ciphertext_tally(),
            Err(Error::Corrupted(_))
        ));

        election.encrypted_tally = Some(Blob::from("tally"));
        assert_eq!(election.ciphertext_tally().unwrap(), &Blob::from("tally"));
    }
}
