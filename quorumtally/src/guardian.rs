use crate::*;
use uuid::Uuid;

/// A guardian holds one share of the election key.
///
/// The sequence order is the guardian's cryptographic index (used for Lagrange interpolation by
/// the engine), not a display order. It is unique within an election and never changes.
#[derive(Serialize, Deserialize, Debug, Clone, PartialEq)]
pub struct Guardian {
    pub election_id: Uuid,
    pub sequence_order: u32,
    pub public_key: Blob,

    /// Key-backup material other guardians use to compensate for this one
    pub backup: Blob,

    /// Accepted partial decryption, if this guardian has submitted one
    #[serde(default)]
    pub share: Option<DecryptionShare>,
}

impl Guardian {
    pub fn new(election_id: Uuid, sequence_order: u32, public_key: Blob, backup: Blob) -> Self {
        Guardian {
            election_id,
            sequence_order,
            public_key,
            backup,
            share: None,
        }
    }

    pub fn has_submitted(&self) -> bool {
        self.share.is_some()
    }
}

/// A guardian's direct contribution to decrypting the tally and ballots
#[derive(Serialize, Deserialize, Debug, Clone, PartialEq, Eq)]
pub struct DecryptionShare {
    pub tally_share: Blob,
    pub ballot_share: Blob,
    pub proof: Blob,
}

impl DecryptionShare {
    pub fn fingerprint(&self) -> String {
        let mut bytes = Vec::with_capacity(
            self.tally_share.len() + self.ballot_share.len() + self.proof.len(),
        );
        bytes.extend_from_slice(&self.tally_share);
        bytes.extend_from_slice(&self.ballot_share);
        bytes.extend_from_slice(&self.proof);
        Blob::new(bytes).fingerprint()
    }
}

/// Result of recording a partial decryption
#[derive(Serialize, Deserialize, Copy, Clone, Debug, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum ShareOutcome {
    /// The share was stored
    Accepted,

    /// The identical share was already stored, nothing changed
    Unchanged,
}

/// Identity of a compensation record: at most one per ordered pair per election
#[derive(Serialize, Deserialize, Copy, Clone, Debug, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct CompensationKey {
    pub election_id: Uuid,
    pub compensating_sequence: u32,
    pub missing_sequence: u32,
}

impl std::fmt::Display for CompensationKey {
    fn fmt(&self, f: &mut std::fmt::Formatter) -> std::fmt::Result {
        write!(
            f,
            "{}:{}->{}",
            self.election_id, self.compensating_sequence, self.missing_sequence
        )
    }
}

/// A share computed by a present guardian on behalf of a missing one
#[derive(Serialize, Deserialize, Debug, Clone, PartialEq)]
pub struct CompensatedDecryptionShare {
    pub election_id: Uuid,
    pub compensating_sequence: u32,
    pub missing_sequence: u32,
    pub tally_share: Blob,
    pub ballot_share: Blob,
}

impl CompensatedDecryptionShare {
    pub fn key(&self) -> CompensationKey {
        CompensationKey {
            election_id: self.election_id,
            compensating_sequence: self.compensating_sequence,
            missing_sequence: self.missing_sequence,
        }
    }
}
