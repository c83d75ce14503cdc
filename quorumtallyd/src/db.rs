use crate::config::Config;
use quorumtally::*;
use rocket::fairing::{self, AdHoc};
use rocket::{Build, Rocket};
use tracing::{error, info};

pub type Service = Orchestrator<SqliteStore, HttpEngine>;

async fn init_service(rocket: Rocket<Build>, config: Config) -> fairing::Result {
    let store = match SqliteStore::open(&config.db_path).await {
        Ok(store) => store,
        Err(e) => {
            error!(db = %config.db_path.display(), "Failed to open SQLite store: {}", e);
            return Err(rocket);
        }
    };

    let engine = match HttpEngine::new(config.engine.clone()) {
        Ok(engine) => engine,
        Err(e) => {
            error!("Failed to build engine client: {}", e);
            return Err(rocket);
        }
    };

    info!(
        engine = %config.engine.base_url,
        db = %config.db_path.display(),
        "decryption service ready"
    );
    Ok(rocket.manage(Orchestrator::new(store, engine, config.orchestrator)))
}

pub fn stage(config: Config) -> AdHoc {
    AdHoc::on_ignite("SQLite Stage", move |rocket| async move {
        rocket.attach(AdHoc::try_on_ignite("SQLite Store", move |rocket| {
            init_service(rocket, config)
        }))
    })
}
