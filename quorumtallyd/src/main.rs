use config::Config;
use db::Service;
use quorumtally::*;
use rocket::http::Status;
use rocket::request::Request;
use rocket::response::status::Created;
use rocket::response::{self, Responder};
use rocket::serde::json::Json;
use rocket::{catch, catchers, get, post, routes, Build, Rocket, State};
use serde::Deserialize;
use serde_json::{json, Value};
use tracing::info;
use uuid::Uuid;

mod config;
mod db;
mod telemetry;

type ApiResult<T> = Result<Json<T>, ApiError>;

/// A library error rendered as `{ error, kind, retryable }` with a matching status code
#[derive(Debug)]
struct ApiError(Error);

impl From<Error> for ApiError {
    fn from(e: Error) -> Self {
        ApiError(e)
    }
}

impl ApiError {
    fn status(&self) -> Status {
        match &self.0 {
            Error::InvalidPhase { .. } | Error::QuorumNotMet { .. } => Status::PreconditionFailed,
            Error::Conflict { .. } | Error::DuplicateCompensation { .. } => Status::Conflict,
            Error::InvalidArgument(_) => Status::BadRequest,
            Error::ElectionNotFound(_) => Status::NotFound,
            Error::EngineUnavailable(_) => Status::ServiceUnavailable,
            Error::Corrupted(_) | Error::Internal(_) => Status::InternalServerError,
        }
    }
}

impl<'r> Responder<'r, 'static> for ApiError {
    fn respond_to(self, req: &'r Request<'_>) -> response::Result<'static> {
        let body = json!({
            "error": self.0.to_string(),
            "kind": self.0.kind(),
            "retryable": self.0.is_retryable(),
        });
        (self.status(), Json(body)).respond_to(req)
    }
}

fn election_id(id: &str) -> Result<Uuid, ApiError> {
    id.parse()
        .map_err(|_| ApiError(Error::InvalidArgument(format!("invalid election id {}", id))))
}

#[derive(Deserialize)]
struct NewElection {
    guardian_count: u32,
    quorum: u32,
    joint_public_key: Blob,
    commitment_hash: Blob,
    base_hash: Blob,
}

#[derive(Deserialize)]
struct NewGuardian {
    sequence_order: u32,
    public_key: Blob,
    backup: Blob,
}

#[derive(Deserialize)]
struct NewBallot {
    ciphertext: Blob,
}

#[derive(Deserialize)]
struct Advance {
    from: ElectionStatus,
}

#[derive(Deserialize)]
struct Tally {
    ciphertext_tally: Blob,
}

#[derive(Deserialize)]
struct FailDecryption {
    reason: String,
}

#[post("/api/election", data = "<body>")]
async fn create(
    service: &State<Service>,
    body: Json<NewElection>,
) -> Result<Created<Json<Election>>, ApiError> {
    let body = body.into_inner();
    let election = Election::new(
        body.guardian_count,
        body.quorum,
        body.joint_public_key,
        body.commitment_hash,
        body.base_hash,
    )?;
    create_election(service.store(), election.clone()).await?;

    Ok(Created::new(format!("/api/election/{}", election.id)).body(Json(election)))
}

#[get("/api/election/<id>")]
async fn read_election(service: &State<Service>, id: &str) -> ApiResult<Election> {
    Ok(Json(service.store().get_election(election_id(id)?).await?))
}

#[post("/api/election/<id>/guardians", data = "<body>")]
async fn add_guardian(
    service: &State<Service>,
    id: &str,
    body: Json<NewGuardian>,
) -> ApiResult<Guardian> {
    let body = body.into_inner();
    let guardian = Guardian::new(
        election_id(id)?,
        body.sequence_order,
        body.public_key,
        body.backup,
    );
    register_guardian(service.store(), guardian.clone()).await?;
    Ok(Json(guardian))
}

#[get("/api/election/<id>/guardians")]
async fn list_guardians(service: &State<Service>, id: &str) -> ApiResult<Vec<Guardian>> {
    let id = election_id(id)?;
    Ok(Json(service.registry().list_guardians(id).await?))
}

#[post("/api/election/<id>/ballots", data = "<body>")]
async fn add_ballot(
    service: &State<Service>,
    id: &str,
    body: Json<NewBallot>,
) -> ApiResult<SubmittedBallot> {
    let ballot = SubmittedBallot::new(election_id(id)?, body.into_inner().ciphertext);
    register_ballot(service.store(), ballot.clone()).await?;
    Ok(Json(ballot))
}

#[post("/api/election/<id>/advance", data = "<body>")]
async fn advance_election(
    service: &State<Service>,
    id: &str,
    body: Json<Advance>,
) -> ApiResult<Election> {
    let id = election_id(id)?;
    advance(service.store(), id, body.from).await?;
    Ok(Json(service.store().get_election(id).await?))
}

#[post("/api/election/<id>/tally", data = "<body>")]
async fn tally(service: &State<Service>, id: &str, body: Json<Tally>) -> ApiResult<Election> {
    let id = election_id(id)?;
    record_tally(service.store(), id, body.into_inner().ciphertext_tally).await?;
    Ok(Json(service.store().get_election(id).await?))
}

#[post("/api/election/<id>/decryption/partial", data = "<body>")]
async fn submit_partial(
    service: &State<Service>,
    id: &str,
    body: Json<PartialDecryptionSubmission>,
) -> ApiResult<SubmissionReceipt> {
    let id = election_id(id)?;
    let receipt = service
        .submit_partial_decryption(id, body.into_inner())
        .await?;
    Ok(Json(receipt))
}

#[post("/api/election/<id>/decryption/partial/compute", data = "<body>")]
async fn compute_partial(
    service: &State<Service>,
    id: &str,
    body: Json<PartialDecryptionComputation>,
) -> ApiResult<SubmissionReceipt> {
    let id = election_id(id)?;
    let receipt = service
        .compute_partial_decryption(id, body.into_inner())
        .await?;
    Ok(Json(receipt))
}

#[post("/api/election/<id>/decryption/compensation", data = "<body>")]
async fn compensate(
    service: &State<Service>,
    id: &str,
    body: Json<CompensationRequest>,
) -> ApiResult<CompensatedDecryptionShare> {
    let id = election_id(id)?;
    let record = service.request_compensation(id, body.into_inner()).await?;
    Ok(Json(record))
}

#[post("/api/election/<id>/decryption/combine")]
async fn combine(service: &State<Service>, id: &str) -> ApiResult<DecryptionResult> {
    let id = election_id(id)?;
    Ok(Json(service.attempt_combine(id).await?))
}

#[get("/api/election/<id>/decryption/progress")]
async fn progress(service: &State<Service>, id: &str) -> ApiResult<DecryptionProgress> {
    Ok(Json(service.decryption_progress(election_id(id)?).await?))
}

#[get("/api/election/<id>/decryption/result")]
async fn result(service: &State<Service>, id: &str) -> ApiResult<DecryptionResult> {
    Ok(Json(service.decryption_result(election_id(id)?).await?))
}

#[post("/api/election/<id>/decryption/fail", data = "<body>")]
async fn fail(
    service: &State<Service>,
    id: &str,
    body: Json<FailDecryption>,
) -> ApiResult<DecryptionProgress> {
    let id = election_id(id)?;
    service.fail_decryption(id, &body.reason).await?;
    Ok(Json(service.decryption_progress(id).await?))
}

/// Malformed bodies and unknown routes get the same JSON shape as library errors
#[catch(default)]
fn default_catcher(status: Status, _req: &Request) -> Json<Value> {
    Json(json!({
        "error": format!("quorumtallyd: {}", status),
        "kind": "invalid_request",
        "retryable": false,
    }))
}

fn build(config: &Config, figment: rocket::figment::Figment) -> Rocket<Build> {
    rocket::custom(figment)
        .attach(db::stage(config.clone()))
        .mount(
            "/",
            routes![
                create,
                read_election,
                add_guardian,
                list_guardians,
                add_ballot,
                advance_election,
                tally,
                submit_partial,
                compute_partial,
                compensate,
                combine,
                progress,
                result,
                fail
            ],
        )
        .register("/", catchers![default_catcher])
}

#[rocket::main]
async fn main() -> anyhow::Result<()> {
    let config = Config::from_env()?;
    telemetry::setup_tracing(config.log_level);

    info!(address = %config.address, port = config.port, "starting quorumtallyd");

    let figment = rocket::Config::figment()
        .merge(("address", config.address.clone()))
        .merge(("port", config.port));

    build(&config, figment).launch().await?;
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use rocket::http::ContentType;
    use rocket::local::blocking::Client;
    use std::path::Path;
    use tempfile::TempDir;

    fn test_config(dir: &Path) -> Config {
        let db_path = dir.join("quorumtally.db");
        Config::from_lookup(|name| match name {
            // Nothing listens here, so every engine call fails fast
            "QUORUMTALLY_ENGINE_URL" => Some("http://127.0.0.1:1".to_owned()),
            "QUORUMTALLY_ENGINE_TIMEOUT_SECS" => Some("2".to_owned()),
            "QUORUMTALLY_ENGINE_CONNECT_TIMEOUT_SECS" => Some("1".to_owned()),
            "QUORUMTALLY_DB_PATH" => Some(db_path.display().to_string()),
            _ => None,
        })
        .unwrap()
    }

    fn client_in(dir: &Path) -> Client {
        Client::tracked(build(&test_config(dir), rocket::Config::figment())).unwrap()
    }

    /// The directory holds the database and must outlive the client
    fn client() -> (Client, TempDir) {
        let dir = TempDir::new().unwrap();
        (client_in(dir.path()), dir)
    }

    fn post(client: &Client, uri: String, body: Value) -> (Status, Value) {
        let response = client.post(uri).header(ContentType::JSON).body(body.to_string()).dispatch();
        let status = response.status();
        (status, response.into_json().unwrap())
    }

    fn hex(s: &str) -> String {
        Blob::from(s).to_string()
    }

    /// A tallied 2-of-2 election
    fn tallied(client: &Client) -> String {
        let (status, election) = post(
            client,
            "/api/election".into(),
            json!({
                "guardian_count": 2,
                "quorum": 2,
                "joint_public_key": hex("joint"),
                "commitment_hash": hex("commitment"),
                "base_hash": hex("base"),
            }),
        );
        assert_eq!(status, Status::Created);
        let id = election["id"].as_str().unwrap().to_owned();

        for seq in 1..=2 {
            let (status, _) = post(
                client,
                format!("/api/election/{}/guardians", id),
                json!({
                    "sequence_order": seq,
                    "public_key": hex(&format!("pk {}", seq)),
                    "backup": hex(&format!("backup {}", seq)),
                }),
            );
            assert_eq!(status, Status::Ok);
        }

        for from in &["created", "guardians_ready", "voting_open"] {
            let (status, _) = post(
                client,
                format!("/api/election/{}/advance", id),
                json!({ "from": from }),
            );
            assert_eq!(status, Status::Ok);
        }

        let (status, election) = post(
            client,
            format!("/api/election/{}/tally", id),
            json!({ "ciphertext_tally": hex("tally") }),
        );
        assert_eq!(status, Status::Ok);
        assert_eq!(election["status"], "tallied");
        id
    }

    fn submission(seq: u32) -> Value {
        json!({
            "sequence_order": seq,
            "public_key": hex(&format!("pk {}", seq)),
            "share": {
                "tally_share": hex(&format!("tally {}", seq)),
                "ballot_share": hex(&format!("ballots {}", seq)),
                "proof": hex(&format!("proof {}", seq)),
            },
        })
    }

    #[test]
    fn decryption_flow() {
        let (client, _dir) = client();
        let id = tallied(&client);

        let (status, receipt) = post(
            &client,
            format!("/api/election/{}/decryption/partial", id),
            submission(1),
        );
        assert_eq!(status, Status::Ok);
        assert_eq!(receipt["outcome"], "accepted");
        assert_eq!(receipt["status"], "partial_decryption");

        let response = client
            .get(format!("/api/election/{}/decryption/progress", id))
            .dispatch();
        assert_eq!(response.status(), Status::Ok);
        let progress: Value = response.into_json().unwrap();
        assert_eq!(progress["submitted_count"], 1);
        assert_eq!(progress["missing_sequences"], json!([2]));
        assert_eq!(progress["quorum_met"], false);

        // Below quorum
        let (status, body) = post(
            &client,
            format!("/api/election/{}/decryption/combine", id),
            Value::Null,
        );
        assert_eq!(status, Status::PreconditionFailed);
        assert_eq!(body["kind"], "quorum_not_met");
        assert_eq!(body["retryable"], true);

        // A different share from the same guardian
        let mut conflicting = submission(1);
        conflicting["share"]["proof"] = json!(hex("other proof"));
        let (status, body) = post(
            &client,
            format!("/api/election/{}/decryption/partial", id),
            conflicting,
        );
        assert_eq!(status, Status::Conflict);
        assert_eq!(body["kind"], "conflict");

        post(
            &client,
            format!("/api/election/{}/decryption/partial", id),
            submission(2),
        );

        // Quorum is met but the engine is unreachable
        let (status, body) = post(
            &client,
            format!("/api/election/{}/decryption/combine", id),
            Value::Null,
        );
        assert_eq!(status, Status::ServiceUnavailable);
        assert_eq!(body["kind"], "engine_unavailable");

        let response = client
            .get(format!("/api/election/{}/decryption/result", id))
            .dispatch();
        assert_eq!(response.status(), Status::PreconditionFailed);

        let (status, progress) = post(
            &client,
            format!("/api/election/{}/decryption/fail", id),
            json!({ "reason": "engine gone" }),
        );
        assert_eq!(status, Status::Ok);
        assert_eq!(progress["status"], "failed");
    }

    #[test]
    fn error_statuses() {
        let (client, _dir) = client();

        let response = client.get("/api/election/not-a-uuid").dispatch();
        assert_eq!(response.status(), Status::BadRequest);

        let response = client
            .get(format!("/api/election/{}", Uuid::new_v4()))
            .dispatch();
        assert_eq!(response.status(), Status::NotFound);
        let body: Value = response.into_json().unwrap();
        assert_eq!(body["kind"], "election_not_found");

        let (status, body) = post(
            &client,
            "/api/election".into(),
            json!({
                "guardian_count": 2,
                "quorum": 3,
                "joint_public_key": hex("joint"),
                "commitment_hash": hex("commitment"),
                "base_hash": hex("base"),
            }),
        );
        assert_eq!(status, Status::BadRequest);
        assert_eq!(body["kind"], "invalid_argument");

        let (status, body) = post(&client, "/api/election".into(), json!({ "nonsense": 1 }));
        assert_eq!(status, Status::UnprocessableEntity);
        assert_eq!(body["kind"], "invalid_request");

        // Compensation before anyone submitted
        let id = tallied(&client);
        let (status, body) = post(
            &client,
            format!("/api/election/{}/decryption/compensation", id),
            json!({
                "compensating_sequence": 1,
                "missing_sequence": 2,
                "public_key": hex("pk 1"),
                "private_material": hex("secret"),
            }),
        );
        assert_eq!(status, Status::PreconditionFailed);
        assert_eq!(body["kind"], "invalid_phase");
    }

    #[test]
    fn state_survives_restart() {
        let dir = TempDir::new().unwrap();

        let id = {
            let client = client_in(dir.path());
            let id = tallied(&client);
            let (status, _) = post(
                &client,
                format!("/api/election/{}/decryption/partial", id),
                submission(1),
            );
            assert_eq!(status, Status::Ok);
            id
        };

        let client = client_in(dir.path());
        let response = client.get(format!("/api/election/{}", id)).dispatch();
        assert_eq!(response.status(), Status::Ok);
        let election: Value = response.into_json().unwrap();
        assert_eq!(election["status"], "partial_decryption");

        let response = client
            .get(format!("/api/election/{}/decryption/progress", id))
            .dispatch();
        let progress: Value = response.into_json().unwrap();
        assert_eq!(progress["submitted_count"], 1);

        // The same share again is an idempotent replay
        let (status, receipt) = post(
            &client,
            format!("/api/election/{}/decryption/partial", id),
            submission(1),
        );
        assert_eq!(status, Status::Ok);
        assert_eq!(receipt["outcome"], "unchanged");
    }

    #[test]
    fn unopenable_database_aborts_ignition() {
        let dir = TempDir::new().unwrap();
        let config = test_config(&dir.path().join("missing").join("dir"));
        assert!(Client::tracked(build(&config, rocket::Config::figment())).is_err());
    }
}
