use crate::*;
use async_trait::async_trait;
use sqlx::sqlite::{
    SqliteConnectOptions, SqliteJournalMode, SqlitePool, SqliteRow, SqliteSynchronous,
};
use sqlx::{ConnectOptions, Row, Sqlite};
use std::convert::TryFrom;
use std::path::Path;
use std::str::FromStr;
use tracing::{debug, error};
use uuid::Uuid;

const ELECTION_COLUMNS: &str = "id, guardian_count, quorum, joint_public_key, commitment_hash, \
                                base_hash, status, encrypted_tally";

const GUARDIAN_COLUMNS: &str =
    "election_id, sequence_order, public_key, backup, tally_share, ballot_share, proof";

const COMPENSATION_COLUMNS: &str =
    "election_id, compensating_sequence, missing_sequence, tally_share, ballot_share";

/// A store backed by a SQLite database.
///
/// Status changes are conditional `UPDATE … WHERE status = ?` statements, and mutations that
/// touch more than one row run in a transaction, so a failed write leaves the database as it
/// was.
#[derive(Clone)]
pub struct SqliteStore {
    pool: SqlitePool,
}

impl SqliteStore {
    /// Open (creating if needed) the database at `path` and bring its schema up to date
    pub async fn open<P: AsRef<Path>>(path: P) -> Result<Self, Error> {
        let path = path.as_ref();
        let opts = SqliteConnectOptions::new()
            .filename(path)
            .create_if_missing(true)
            .journal_mode(SqliteJournalMode::Wal)
            .synchronous(SqliteSynchronous::Full)
            .foreign_keys(true)
            .disable_statement_logging();

        let pool = match SqlitePool::connect_with(opts).await {
            Ok(pool) => pool,
            Err(e) => {
                error!(path = %path.display(), "failed to open database: {}", e);
                return Err(db_error(e));
            }
        };

        if let Err(e) = sqlx::migrate!("./migrations").run(&pool).await {
            error!(path = %path.display(), "failed to migrate database: {}", e);
            return Err(Error::Internal(format!(
                "unable to migrate {}: {}",
                path.display(),
                e
            )));
        }

        debug!(path = %path.display(), "opened database");
        Ok(SqliteStore { pool })
    }

    /// Wait for open connections to finish and close them
    pub async fn close(&self) {
        self.pool.close().await
    }

    async fn election_exists(&self, id: Uuid) -> Result<bool, Error> {
        let row = sqlx::query("SELECT 1 FROM elections WHERE id = ?")
            .bind(id.to_string())
            .fetch_optional(&self.pool)
            .await
            .map_err(db_error)?;
        Ok(row.is_some())
    }

    /// Resolve a conditional write that touched no rows: a missing election is an error,
    /// otherwise the condition simply did not hold.
    async fn unmatched(&self, id: Uuid) -> Result<bool, Error> {
        if self.election_exists(id).await? {
            Ok(false)
        } else {
            Err(Error::ElectionNotFound(id))
        }
    }
}

fn db_error(e: sqlx::Error) -> Error {
    Error::Internal(format!("database error: {}", e))
}

fn is_unique_violation(e: &sqlx::Error) -> bool {
    match e {
        sqlx::Error::Database(e) => e.is_unique_violation(),
        _ => false,
    }
}

fn is_foreign_key_violation(e: &sqlx::Error) -> bool {
    match e {
        sqlx::Error::Database(e) => e.is_foreign_key_violation(),
        _ => false,
    }
}

fn column<'r, T>(row: &'r SqliteRow, name: &str) -> Result<T, Error>
where
    T: sqlx::Decode<'r, Sqlite> + sqlx::Type<Sqlite>,
{
    row.try_get(name)
        .map_err(|e| Error::Corrupted(format!("unreadable column {}: {}", name, e)))
}

fn uuid_column(row: &SqliteRow, name: &str) -> Result<Uuid, Error> {
    let value: String = column(row, name)?;
    Uuid::parse_str(&value)
        .map_err(|e| Error::Corrupted(format!("{} is not a uuid ({}): {}", name, value, e)))
}

fn u32_column(row: &SqliteRow, name: &str) -> Result<u32, Error> {
    let value: i64 = column(row, name)?;
    u32::try_from(value).map_err(|_| Error::Corrupted(format!("{} out of range: {}", name, value)))
}

fn blob_column(row: &SqliteRow, name: &str) -> Result<Blob, Error> {
    let bytes: Vec<u8> = column(row, name)?;
    Ok(Blob::new(bytes))
}

fn optional_blob_column(row: &SqliteRow, name: &str) -> Result<Option<Blob>, Error> {
    let bytes: Option<Vec<u8>> = column(row, name)?;
    Ok(bytes.map(Blob::new))
}

fn sequences_column(row: &SqliteRow, name: &str) -> Result<Vec<u32>, Error> {
    let json: String = column(row, name)?;
    serde_json::from_str(&json)
        .map_err(|e| Error::Corrupted(format!("unreadable {}: {}", name, e)))
}

fn election_from_row(row: &SqliteRow) -> Result<Election, Error> {
    let status: String = column(row, "status")?;
    let election = Election {
        id: uuid_column(row, "id")?,
        guardian_count: u32_column(row, "guardian_count")?,
        quorum: u32_column(row, "quorum")?,
        joint_public_key: blob_column(row, "joint_public_key")?,
        commitment_hash: blob_column(row, "commitment_hash")?,
        base_hash: blob_column(row, "base_hash")?,
        status: ElectionStatus::from_str(&status)
            .map_err(|_| Error::Corrupted(format!("unknown election status {}", status)))?,
        encrypted_tally: optional_blob_column(row, "encrypted_tally")?,
    };
    election
        .validate()
        .map_err(|e| Error::Corrupted(format!("election {}: {}", election.id, e)))?;
    Ok(election)
}

fn guardian_from_row(row: &SqliteRow) -> Result<Guardian, Error> {
    let mut guardian = Guardian::new(
        uuid_column(row, "election_id")?,
        u32_column(row, "sequence_order")?,
        blob_column(row, "public_key")?,
        blob_column(row, "backup")?,
    );

    let parts = (
        optional_blob_column(row, "tally_share")?,
        optional_blob_column(row, "ballot_share")?,
        optional_blob_column(row, "proof")?,
    );
    guardian.share = match parts {
        (Some(tally_share), Some(ballot_share), Some(proof)) => Some(DecryptionShare {
            tally_share,
            ballot_share,
            proof,
        }),
        (None, None, None) => None,
        _ => {
            return Err(Error::Corrupted(format!(
                "guardian {} of election {} has a partial share",
                guardian.sequence_order, guardian.election_id
            )))
        }
    };
    Ok(guardian)
}

fn compensation_from_row(row: &SqliteRow) -> Result<CompensatedDecryptionShare, Error> {
    Ok(CompensatedDecryptionShare {
        election_id: uuid_column(row, "election_id")?,
        compensating_sequence: u32_column(row, "compensating_sequence")?,
        missing_sequence: u32_column(row, "missing_sequence")?,
        tally_share: blob_column(row, "tally_share")?,
        ballot_share: blob_column(row, "ballot_share")?,
    })
}

fn result_from_row(row: &SqliteRow) -> Result<DecryptionResult, Error> {
    Ok(DecryptionResult {
        election_id: uuid_column(row, "election_id")?,
        results: blob_column(row, "results")?,
        direct_sequences: sequences_column(row, "direct_sequences")?,
        compensated_sequences: sequences_column(row, "compensated_sequences")?,
    })
}

fn ballot_from_row(row: &SqliteRow) -> Result<SubmittedBallot, Error> {
    Ok(SubmittedBallot {
        election_id: uuid_column(row, "election_id")?,
        ballot_id: uuid_column(row, "ballot_id")?,
        ciphertext: blob_column(row, "ciphertext")?,
    })
}

fn sequences_json(sequences: &[u32]) -> Result<String, Error> {
    serde_json::to_string(sequences)
        .map_err(|e| Error::Internal(format!("unable to serialize sequences: {}", e)))
}

#[async_trait]
impl Store for SqliteStore {
    async fn get_election(&self, id: Uuid) -> Result<Election, Error> {
        let query = format!("SELECT {} FROM elections WHERE id = ?", ELECTION_COLUMNS);
        let row = sqlx::query(&query)
            .bind(id.to_string())
            .fetch_optional(&self.pool)
            .await
            .map_err(db_error)?;
        match row {
            Some(row) => election_from_row(&row),
            None => Err(Error::ElectionNotFound(id)),
        }
    }

    async fn insert_election(&self, election: Election) -> Result<(), Error> {
        election.validate()?;
        let inserted = sqlx::query(
            "INSERT INTO elections (id, guardian_count, quorum, joint_public_key, \
             commitment_hash, base_hash, status, encrypted_tally) \
             VALUES (?, ?, ?, ?, ?, ?, ?, ?)",
        )
        .bind(election.id.to_string())
        .bind(i64::from(election.guardian_count))
        .bind(i64::from(election.quorum))
        .bind(election.joint_public_key.into_bytes())
        .bind(election.commitment_hash.into_bytes())
        .bind(election.base_hash.into_bytes())
        .bind(election.status.name())
        .bind(election.encrypted_tally.map(Blob::into_bytes))
        .execute(&self.pool)
        .await;

        match inserted {
            Ok(_) => Ok(()),
            Err(e) if is_unique_violation(&e) => Err(Error::InvalidArgument(format!(
                "election {} already exists",
                election.id
            ))),
            Err(e) => Err(db_error(e)),
        }
    }

    async fn compare_and_set_status(
        &self,
        id: Uuid,
        expected: ElectionStatus,
        new: ElectionStatus,
    ) -> Result<bool, Error> {
        let updated = sqlx::query("UPDATE elections SET status = ? WHERE id = ? AND status = ?")
            .bind(new.name())
            .bind(id.to_string())
            .bind(expected.name())
            .execute(&self.pool)
            .await
            .map_err(db_error)?;

        if updated.rows_affected() == 1 {
            return Ok(true);
        }
        self.unmatched(id).await
    }

    async fn record_tally(
        &self,
        id: Uuid,
        expected: ElectionStatus,
        tally: Blob,
    ) -> Result<bool, Error> {
        let updated = sqlx::query(
            "UPDATE elections SET status = ?, encrypted_tally = ? WHERE id = ? AND status = ?",
        )
        .bind(ElectionStatus::Tallied.name())
        .bind(tally.into_bytes())
        .bind(id.to_string())
        .bind(expected.name())
        .execute(&self.pool)
        .await
        .map_err(db_error)?;

        if updated.rows_affected() == 1 {
            return Ok(true);
        }
        self.unmatched(id).await
    }

    async fn finalize_decryption(&self, result: DecryptionResult) -> Result<bool, Error> {
        let id = result.election_id;
        let direct = sequences_json(&result.direct_sequences)?;
        let compensated = sequences_json(&result.compensated_sequences)?;

        let mut tx = self.pool.begin().await.map_err(db_error)?;

        let updated = sqlx::query("UPDATE elections SET status = ? WHERE id = ? AND status = ?")
            .bind(ElectionStatus::Decrypted.name())
            .bind(id.to_string())
            .bind(ElectionStatus::PartialDecryption.name())
            .execute(&mut *tx)
            .await
            .map_err(db_error)?;
        if updated.rows_affected() != 1 {
            tx.rollback().await.map_err(db_error)?;
            return self.unmatched(id).await;
        }

        let inserted = sqlx::query(
            "INSERT INTO results (election_id, results, direct_sequences, compensated_sequences) \
             VALUES (?, ?, ?, ?)",
        )
        .bind(id.to_string())
        .bind(result.results.into_bytes())
        .bind(direct)
        .bind(compensated)
        .execute(&mut *tx)
        .await;
        if let Err(e) = inserted {
            error!(election = %id, "unable to store decryption result: {}", e);
            tx.rollback().await.map_err(db_error)?;
            return Err(db_error(e));
        }

        tx.commit().await.map_err(db_error)?;
        Ok(true)
    }

    async fn get_result(&self, election_id: Uuid) -> Result<Option<DecryptionResult>, Error> {
        let row = sqlx::query(
            "SELECT election_id, results, direct_sequences, compensated_sequences \
             FROM results WHERE election_id = ?",
        )
        .bind(election_id.to_string())
        .fetch_optional(&self.pool)
        .await
        .map_err(db_error)?;
        row.as_ref().map(result_from_row).transpose()
    }

    async fn insert_guardian(&self, guardian: Guardian) -> Result<(), Error> {
        let id = guardian.election_id;
        let sequence = guardian.sequence_order;
        let share = guardian.share;

        let inserted = sqlx::query(
            "INSERT INTO guardians (election_id, sequence_order, public_key, backup, \
             tally_share, ballot_share, proof) \
             SELECT id, ?, ?, ?, ?, ?, ? FROM elections \
             WHERE id = ? AND ? BETWEEN 1 AND guardian_count",
        )
        .bind(i64::from(sequence))
        .bind(guardian.public_key.into_bytes())
        .bind(guardian.backup.into_bytes())
        .bind(share.as_ref().map(|s| s.tally_share.to_vec()))
        .bind(share.as_ref().map(|s| s.ballot_share.to_vec()))
        .bind(share.as_ref().map(|s| s.proof.to_vec()))
        .bind(id.to_string())
        .bind(i64::from(sequence))
        .execute(&self.pool)
        .await;

        match inserted {
            Ok(done) if done.rows_affected() == 1 => Ok(()),
            Ok(_) => {
                let election = self.get_election(id).await?;
                Err(Error::InvalidArgument(format!(
                    "sequence order {} is outside 1..={}",
                    sequence, election.guardian_count
                )))
            }
            Err(e) if is_unique_violation(&e) => Err(Error::InvalidArgument(format!(
                "sequence order {} is already taken in election {}",
                sequence, id
            ))),
            Err(e) => Err(db_error(e)),
        }
    }

    async fn get_guardians(&self, election_id: Uuid) -> Result<Vec<Guardian>, Error> {
        if !self.election_exists(election_id).await? {
            return Err(Error::ElectionNotFound(election_id));
        }
        let query = format!(
            "SELECT {} FROM guardians WHERE election_id = ? ORDER BY sequence_order",
            GUARDIAN_COLUMNS
        );
        let rows = sqlx::query(&query)
            .bind(election_id.to_string())
            .fetch_all(&self.pool)
            .await
            .map_err(db_error)?;
        rows.iter().map(guardian_from_row).collect()
    }

    async fn get_guardian(
        &self,
        election_id: Uuid,
        sequence_order: u32,
    ) -> Result<Option<Guardian>, Error> {
        let query = format!(
            "SELECT {} FROM guardians WHERE election_id = ? AND sequence_order = ?",
            GUARDIAN_COLUMNS
        );
        let row = sqlx::query(&query)
            .bind(election_id.to_string())
            .bind(i64::from(sequence_order))
            .fetch_optional(&self.pool)
            .await
            .map_err(db_error)?;
        row.as_ref().map(guardian_from_row).transpose()
    }

    async fn record_share(
        &self,
        election_id: Uuid,
        sequence_order: u32,
        share: DecryptionShare,
    ) -> Result<ShareOutcome, Error> {
        let updated = sqlx::query(
            "UPDATE guardians SET tally_share = ?, ballot_share = ?, proof = ? \
             WHERE election_id = ? AND sequence_order = ? AND tally_share IS NULL",
        )
        .bind(share.tally_share.to_vec())
        .bind(share.ballot_share.to_vec())
        .bind(share.proof.to_vec())
        .bind(election_id.to_string())
        .bind(i64::from(sequence_order))
        .execute(&self.pool)
        .await
        .map_err(db_error)?;

        if updated.rows_affected() == 1 {
            return Ok(ShareOutcome::Accepted);
        }

        // Nothing updated: the guardian is unknown or already holds a share
        let guardian = self
            .get_guardian(election_id, sequence_order)
            .await?
            .ok_or_else(|| {
                Error::InvalidArgument(format!(
                    "guardian {} is not part of election {}",
                    sequence_order, election_id
                ))
            })?;
        match guardian.share {
            Some(existing) if existing == share => Ok(ShareOutcome::Unchanged),
            Some(_) => Err(Error::Conflict {
                election_id,
                sequence: sequence_order,
            }),
            None => Err(Error::Internal(format!(
                "share of guardian {} in election {} was not recorded",
                sequence_order, election_id
            ))),
        }
    }

    async fn insert_compensation(&self, share: CompensatedDecryptionShare) -> Result<(), Error> {
        let key = share.key();
        let inserted = sqlx::query(
            "INSERT INTO compensations (election_id, compensating_sequence, missing_sequence, \
             tally_share, ballot_share) VALUES (?, ?, ?, ?, ?)",
        )
        .bind(key.election_id.to_string())
        .bind(i64::from(key.compensating_sequence))
        .bind(i64::from(key.missing_sequence))
        .bind(share.tally_share.into_bytes())
        .bind(share.ballot_share.into_bytes())
        .execute(&self.pool)
        .await;

        match inserted {
            Ok(_) => Ok(()),
            Err(e) if is_unique_violation(&e) => Err(Error::DuplicateCompensation {
                election_id: key.election_id,
                compensating: key.compensating_sequence,
                missing: key.missing_sequence,
            }),
            Err(e) if is_foreign_key_violation(&e) => Err(Error::InvalidArgument(format!(
                "compensation {} references an unknown guardian",
                key
            ))),
            Err(e) => Err(db_error(e)),
        }
    }

    async fn get_compensations(
        &self,
        election_id: Uuid,
    ) -> Result<Vec<CompensatedDecryptionShare>, Error> {
        let query = format!(
            "SELECT {} FROM compensations WHERE election_id = ? \
             ORDER BY compensating_sequence, missing_sequence",
            COMPENSATION_COLUMNS
        );
        let rows = sqlx::query(&query)
            .bind(election_id.to_string())
            .fetch_all(&self.pool)
            .await
            .map_err(db_error)?;
        rows.iter().map(compensation_from_row).collect()
    }

    async fn get_compensation(
        &self,
        key: CompensationKey,
    ) -> Result<Option<CompensatedDecryptionShare>, Error> {
        let query = format!(
            "SELECT {} FROM compensations WHERE election_id = ? \
             AND compensating_sequence = ? AND missing_sequence = ?",
            COMPENSATION_COLUMNS
        );
        let row = sqlx::query(&query)
            .bind(key.election_id.to_string())
            .bind(i64::from(key.compensating_sequence))
            .bind(i64::from(key.missing_sequence))
            .fetch_optional(&self.pool)
            .await
            .map_err(db_error)?;
        row.as_ref().map(compensation_from_row).transpose()
    }

    async fn insert_ballot(
        &self,
        ballot: SubmittedBallot,
        expected: ElectionStatus,
    ) -> Result<bool, Error> {
        let id = ballot.election_id;
        let inserted = sqlx::query(
            "INSERT INTO ballots (ballot_id, election_id, ciphertext) \
             SELECT ?, id, ? FROM elections WHERE id = ? AND status = ?",
        )
        .bind(ballot.ballot_id.to_string())
        .bind(ballot.ciphertext.into_bytes())
        .bind(id.to_string())
        .bind(expected.name())
        .execute(&self.pool)
        .await;

        match inserted {
            Ok(done) if done.rows_affected() == 1 => Ok(true),
            Ok(_) => self.unmatched(id).await,
            Err(e) if is_unique_violation(&e) => Err(Error::InvalidArgument(format!(
                "ballot {} already submitted",
                ballot.ballot_id
            ))),
            Err(e) => Err(db_error(e)),
        }
    }

    async fn get_ballots(&self, election_id: Uuid) -> Result<Vec<SubmittedBallot>, Error> {
        let rows = sqlx::query(
            "SELECT ballot_id, election_id, ciphertext FROM ballots \
             WHERE election_id = ? ORDER BY id",
        )
        .bind(election_id.to_string())
        .fetch_all(&self.pool)
        .await
        .map_err(db_error)?;
        rows.iter().map(ballot_from_row).collect()
    }
}
