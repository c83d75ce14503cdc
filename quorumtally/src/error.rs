use crate::*;

use thiserror::Error;
use uuid::Uuid;

/// Error types
#[derive(Debug, Error)]
pub enum Error {
    #[error("quorumtally: election {election_id} is {actual}, expected {expected}")]
    InvalidPhase {
        election_id: Uuid,
        expected: String,
        actual: ElectionStatus,
    },

    #[error("quorumtally: guardian {sequence} already submitted a different share for election {election_id}")]
    Conflict { election_id: Uuid, sequence: u32 },

    #[error("quorumtally: guardian {compensating} already compensated for guardian {missing} in election {election_id}")]
    DuplicateCompensation {
        election_id: Uuid,
        compensating: u32,
        missing: u32,
    },

    #[error("quorumtally: quorum not met for election {election_id}: need {required}, have {represented}")]
    QuorumNotMet {
        election_id: Uuid,
        required: u32,
        represented: u32,
    },

    #[error("quorumtally: cryptographic engine unavailable: {0}")]
    EngineUnavailable(String),

    #[error("quorumtally: invalid argument: {0}")]
    InvalidArgument(String),

    #[error("quorumtally: election {0} not found")]
    ElectionNotFound(Uuid),

    #[error("quorumtally: data corruption detected: {0}")]
    Corrupted(String),

    #[error("quorumtally: internal error: {0}")]
    Internal(String),
}

/// What a caller should do about an error
#[derive(Serialize, Deserialize, Copy, Clone, Debug, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum Disposition {
    /// Transient or expected-while-waiting: the same request may succeed later
    RetryLater,

    /// The request was already satisfied
    Ignore,

    /// The request is malformed and must be changed before it can succeed
    FixRequest,

    /// Contradictory data was submitted; an operator has to look at it
    Investigate,

    /// Stored data is damaged
    Fatal,
}

impl Error {
    pub fn disposition(&self) -> Disposition {
        match self {
            Error::InvalidPhase { .. } => Disposition::RetryLater,
            Error::QuorumNotMet { .. } => Disposition::RetryLater,
            Error::EngineUnavailable(_) => Disposition::RetryLater,
            Error::DuplicateCompensation { .. } => Disposition::Ignore,
            Error::InvalidArgument(_) => Disposition::FixRequest,
            Error::ElectionNotFound(_) => Disposition::FixRequest,
            Error::Conflict { .. } => Disposition::Investigate,
            Error::Corrupted(_) => Disposition::Fatal,
            Error::Internal(_) => Disposition::Fatal,
        }
    }

    pub fn is_retryable(&self) -> bool {
        self.disposition() == Disposition::RetryLater
    }

    /// Short machine-readable name of the variant
    pub fn kind(&self) -> &'static str {
        match self {
            Error::InvalidPhase { .. } => "invalid_phase",
            Error::Conflict { .. } => "conflict",
            Error::DuplicateCompensation { .. } => "duplicate_compensation",
            Error::QuorumNotMet { .. } => "quorum_not_met",
            Error::EngineUnavailable(_) => "engine_unavailable",
            Error::InvalidArgument(_) => "invalid_argument",
            Error::ElectionNotFound(_) => "election_not_found",
            Error::Corrupted(_) => "corrupted",
            Error::Internal(_) => "internal",
        }
    }
}
