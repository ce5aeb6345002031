use std::process::ExitCode;
use std::sync::Arc;

use strava_uploader::api::StravaApiClient;
use strava_uploader::auth::{FileTokenStore, StravaAuth};
use strava_uploader::{AppConfig, Uploader};

#[tokio::main]
async fn main() -> ExitCode {
    // Load .env before the logger so RUST_LOG from the file is honored.
    let _ = dotenvy::dotenv();

    env_logger::Builder::from_default_env()
        .filter_level(log::LevelFilter::Info)
        .init();

    log::info!("Starting Strava FIT uploader");

    let config = match AppConfig::from_env() {
        Ok(config) => config,
        Err(e) => {
            log::error!("{e}");
            return ExitCode::FAILURE;
        }
    };

    if !config.fit_folder.is_dir() {
        log::error!(
            "FIT folder is missing or not a directory: {}",
            config.fit_folder.display()
        );
        return ExitCode::FAILURE;
    }

    let api = Arc::new(StravaApiClient::new(&config.api_base));
    let store = FileTokenStore::new(config.token_file.clone());
    let auth = Arc::new(StravaAuth::new(
        &config.api_base,
        config.client_id.clone(),
        config.client_secret.clone(),
        config.auth_code.clone(),
        Box::new(store),
    ));

    let uploader = Uploader::new(config, api, auth);

    // On Ctrl-C, stop picking up new files; in-flight uploads finish and
    // the partial summary is still written.
    let cancel = uploader.cancel_token();
    tokio::spawn(async move {
        if tokio::signal::ctrl_c().await.is_ok() {
            log::warn!("Interrupt received; letting in-flight uploads finish");
            cancel.cancel();
        }
    });

    match uploader.run().await {
        Ok(_) => ExitCode::SUCCESS,
        Err(e) => {
            log::error!("Fatal error: {e}");
            ExitCode::FAILURE
        }
    }
}
