use crate::*;
use async_trait::async_trait;
use reqwest::StatusCode;
use serde::de::DeserializeOwned;
use serde::Serialize;
use std::time::Duration;
use tracing::{debug, warn};
use uuid::Uuid;

/// Public parameters of an election, sent along with every engine request
#[derive(Serialize, Deserialize, Debug, Clone, PartialEq)]
pub struct ElectionContext {
    pub election_id: Uuid,
    pub guardian_count: u32,
    pub quorum: u32,
    pub joint_public_key: Blob,
    pub commitment_hash: Blob,
    pub base_hash: Blob,
}

impl From<&Election> for ElectionContext {
    fn from(election: &Election) -> Self {
        ElectionContext {
            election_id: election.id,
            guardian_count: election.guardian_count,
            quorum: election.quorum,
            joint_public_key: election.joint_public_key.clone(),
            commitment_hash: election.commitment_hash.clone(),
            base_hash: election.base_hash.clone(),
        }
    }
}

#[derive(Serialize, Deserialize, Debug, Clone, PartialEq)]
pub struct PartialDecryptionRequest {
    pub context: ElectionContext,
    pub guardian_sequence: u32,
    pub guardian_public_key: Blob,
    pub private_material: Blob,
    pub ciphertext_tally: Blob,
    pub submitted_ballots: Vec<Blob>,
}

#[derive(Serialize, Deserialize, Debug, Clone, PartialEq)]
pub struct CompensatedDecryptionRequest {
    pub context: ElectionContext,
    pub compensating_sequence: u32,
    pub missing_sequence: u32,

    /// The compensating guardian's own private key material
    pub private_material: Blob,

    pub missing_public_key: Blob,

    /// The missing guardian's key backup
    pub missing_backup: Blob,

    pub ciphertext_tally: Blob,
    pub submitted_ballots: Vec<Blob>,
}

/// Shares computed on behalf of a missing guardian
#[derive(Serialize, Deserialize, Debug, Clone, PartialEq)]
pub struct CompensatedShares {
    pub tally_share: Blob,
    pub ballot_share: Blob,
}

/// A directly submitted share, tagged with its guardian
#[derive(Serialize, Deserialize, Debug, Clone, PartialEq)]
pub struct GuardianShare {
    pub sequence_order: u32,
    pub public_key: Blob,
    pub tally_share: Blob,
    pub ballot_share: Blob,
    pub proof: Blob,
}

#[derive(Serialize, Deserialize, Debug, Clone, PartialEq)]
pub struct CombineRequest {
    pub context: ElectionContext,
    pub guardian_shares: Vec<GuardianShare>,
    pub compensated_shares: Vec<CompensatedDecryptionShare>,
    pub ciphertext_tally: Blob,
    pub submitted_ballots: Vec<Blob>,
}

#[derive(Serialize, Deserialize, Debug, Clone, PartialEq)]
pub struct CombineResponse {
    pub results: Blob,
}

/// The cryptographic engine that does the actual decryption math.
///
/// All payloads are opaque to the orchestrator.
#[async_trait]
pub trait CryptoEngine: Send + Sync {
    async fn compute_partial_decryption(
        &self,
        request: &PartialDecryptionRequest,
    ) -> Result<DecryptionShare, Error>;

    async fn compute_compensated_decryption(
        &self,
        request: &CompensatedDecryptionRequest,
    ) -> Result<CompensatedShares, Error>;

    async fn combine(&self, request: &CombineRequest) -> Result<CombineResponse, Error>;
}

/// Connection settings for [`HttpEngine`]
#[derive(Debug, Clone, PartialEq)]
pub struct EngineConfig {
    pub base_url: String,

    /// Whole-request timeout
    pub timeout: Duration,

    pub connect_timeout: Duration,

    /// Responses larger than this are refused
    pub max_response_bytes: usize,
}

impl Default for EngineConfig {
    fn default() -> Self {
        EngineConfig {
            base_url: "http://localhost:5000".to_owned(),
            timeout: Duration::from_secs(120),
            connect_timeout: Duration::from_secs(10),
            max_response_bytes: 16 * 1024 * 1024,
        }
    }
}

impl EngineConfig {
    pub fn endpoint(&self, path: &str) -> String {
        format!(
            "{}/{}",
            self.base_url.trim_end_matches('/'),
            path.trim_start_matches('/')
        )
    }
}

/// A [`CryptoEngine`] reached over JSON/HTTP
pub struct HttpEngine {
    client: reqwest::Client,
    config: EngineConfig,
}

impl HttpEngine {
    pub fn new(config: EngineConfig) -> Result<Self, Error> {
        let client = reqwest::Client::builder()
            .timeout(config.timeout)
            .connect_timeout(config.connect_timeout)
            .build()
            .map_err(|e| Error::Internal(format!("unable to build engine client: {}", e)))?;

        Ok(HttpEngine { client, config })
    }

    pub fn config(&self) -> &EngineConfig {
        &self.config
    }

    async fn post<Req, Resp>(&self, path: &str, body: &Req) -> Result<Resp, Error>
    where
        Req: Serialize + Sync,
        Resp: DeserializeOwned,
    {
        let url = self.config.endpoint(path);
        debug!(url = %url, "calling engine");

        let mut response = self
            .client
            .post(&url)
            .json(body)
            .send()
            .await
            .map_err(|e| unavailable(&url, e))?;

        let status = response.status();
        let limit = self.config.max_response_bytes;
        if let Some(len) = response.content_length() {
            if len > limit as u64 {
                return Err(too_large(&url, len as usize, limit));
            }
        }

        // Chunked bodies carry no length, so count them as they arrive
        let mut bytes = Vec::new();
        while let Some(chunk) = response.chunk().await.map_err(|e| unavailable(&url, e))? {
            if bytes.len() + chunk.len() > limit {
                return Err(too_large(&url, bytes.len() + chunk.len(), limit));
            }
            bytes.extend_from_slice(&chunk);
        }

        if !status.is_success() {
            return Err(rejected(&url, status, &bytes));
        }

        serde_json::from_slice(&bytes).map_err(|e| {
            warn!(url = %url, "malformed engine response: {}", e);
            Error::EngineUnavailable(format!("malformed response from {}: {}", url, e))
        })
    }
}

fn unavailable(url: &str, e: reqwest::Error) -> Error {
    warn!(url = %url, "engine request failed: {}", e);
    if e.is_timeout() {
        return Error::EngineUnavailable(format!("{} timed out", url));
    }
    Error::EngineUnavailable(format!("{}: {}", url, e))
}

fn too_large(url: &str, len: usize, limit: usize) -> Error {
    warn!(url = %url, len, limit, "engine response too large");
    Error::EngineUnavailable(format!(
        "response from {} is at least {} bytes, limit is {}",
        url, len, limit
    ))
}

/// 4xx means the engine refused what we sent; everything else is worth retrying
fn rejected(url: &str, status: StatusCode, body: &[u8]) -> Error {
    let detail = String::from_utf8_lossy(&body[..body.len().min(256)]).into_owned();
    warn!(url = %url, status = status.as_u16(), "engine returned an error");
    if status.is_client_error() {
        return Error::InvalidArgument(format!(
            "engine rejected request to {} ({}): {}",
            url, status, detail
        ));
    }
    Error::EngineUnavailable(format!("{} returned {}: {}", url, status, detail))
}

#[async_trait]
impl CryptoEngine for HttpEngine {
    async fn compute_partial_decryption(
        &self,
        request: &PartialDecryptionRequest,
    ) -> Result<DecryptionShare, Error> {
        self.post("create_partial_decryption", request).await
    }

    async fn compute_compensated_decryption(
        &self,
        request: &CompensatedDecryptionRequest,
    ) -> Result<CompensatedShares, Error> {
        self.post("create_compensated_decryption", request).await
    }

    async fn combine(&self, request: &CombineRequest) -> Result<CombineResponse, Error> {
        self.post("combine_decryption_shares", request).await
    }
}
