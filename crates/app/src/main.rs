use std::sync::Arc;

use hearth::config::{AppConfig, ConfigError};
use hearth::terminal::{self, TerminalError, TerminalObserver};
use hearth::SessionController;
use hearth_llm::RigEngine;
use hearth_storage::{SqliteKeyValueStore, StorageError};
use snafu::{ResultExt, Snafu};
use tracing_subscriber::EnvFilter;

#[derive(Debug, Snafu)]
enum StartupError {
    #[snafu(display("failed to load configuration on `{stage}`: {source}"))]
    Config {
        stage: &'static str,
        source: ConfigError,
    },
    #[snafu(display("failed to open state database {path} on `{stage}`: {source}"))]
    OpenStore {
        stage: &'static str,
        path: String,
        source: StorageError,
    },
    #[snafu(display("terminal session ended on `{stage}`: {source}"))]
    Terminal {
        stage: &'static str,
        source: TerminalError,
    },
}

#[snafu::report]
#[tokio::main]
async fn main() -> Result<(), StartupError> {
    // Logs share stderr with status lines; stdout carries only the conversation.
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")),
        )
        .with_writer(std::io::stderr)
        .init();

    let config = AppConfig::load().context(ConfigSnafu {
        stage: "load-app-config",
    })?;
    let database_location = config.database_location();
    let store = SqliteKeyValueStore::open(&database_location)
        .await
        .context(OpenStoreSnafu {
            stage: "open-state-store",
            path: database_location.clone(),
        })?;
    tracing::info!(
        endpoint = %config.endpoint,
        database = %database_location,
        "starting hearth"
    );

    let controller = SessionController::new(
        Arc::new(RigEngine::new(config.engine_config())),
        Arc::new(store),
        Arc::new(TerminalObserver::new()),
    );

    terminal::run(controller).await.context(TerminalSnafu {
        stage: "run-terminal",
    })
}
