use std::path::PathBuf;

use figment::{
    Figment,
    providers::{Env, Format, Json, Serialized},
};
use hearth_llm::{DEFAULT_API_KEY, DEFAULT_ENDPOINT, RigEngineConfig};
use serde::{Deserialize, Serialize};
use snafu::{ResultExt, Snafu};

pub const CONFIG_DIRECTORY_NAME: &str = "hearth";
pub const CONFIG_FILE_NAME: &str = "config.json";
pub const DATABASE_FILE_NAME: &str = "state.db";
pub const ENV_PREFIX: &str = "HEARTH_";

#[derive(Debug, Snafu)]
#[snafu(visibility(pub(crate)))]
pub enum ConfigError {
    #[snafu(display("failed to load configuration on `{stage}`: {source}"))]
    Extract {
        stage: &'static str,
        source: Box<figment::Error>,
    },
}

pub type ConfigResult<T> = Result<T, ConfigError>;

/// Process-level configuration of the `hearth` binary.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct AppConfig {
    pub endpoint: String,
    pub api_key: String,
    pub database_path: PathBuf,
}

impl Default for AppConfig {
    fn default() -> Self {
        Self {
            endpoint: DEFAULT_ENDPOINT.to_string(),
            api_key: DEFAULT_API_KEY.to_string(),
            database_path: default_database_path(),
        }
    }
}

impl AppConfig {
    /// Defaults, then the user config file, then `HEARTH_*` variables.
    pub fn load() -> ConfigResult<Self> {
        Self::load_from(default_config_path())
    }

    /// Same layering with an explicit config file. A missing file is skipped.
    pub fn load_from(config_file: Option<PathBuf>) -> ConfigResult<Self> {
        let mut figment = Figment::from(Serialized::defaults(AppConfig::default()));
        if let Some(path) = config_file {
            tracing::debug!(path = %path.display(), "reading config file");
            figment = figment.merge(Json::file(path));
        }

        let config = figment
            .merge(Env::prefixed(ENV_PREFIX))
            .extract::<AppConfig>()
            .map_err(Box::new)
            .context(ExtractSnafu {
                stage: "extract-app-config",
            })?;
        Ok(config.normalized())
    }

    pub fn engine_config(&self) -> RigEngineConfig {
        RigEngineConfig::new(&self.endpoint, &self.api_key)
    }

    pub fn database_location(&self) -> String {
        self.database_path.to_string_lossy().into_owned()
    }

    fn normalized(mut self) -> Self {
        self.endpoint = self.endpoint.trim().trim_end_matches('/').to_string();
        if self.endpoint.is_empty() {
            self.endpoint = DEFAULT_ENDPOINT.to_string();
        }
        if self.api_key.trim().is_empty() {
            self.api_key = DEFAULT_API_KEY.to_string();
        }
        if self.database_path.as_os_str().is_empty() {
            self.database_path = default_database_path();
        }
        self
    }
}

pub fn default_config_path() -> Option<PathBuf> {
    dirs::config_dir().map(|directory| {
        directory
            .join(CONFIG_DIRECTORY_NAME)
            .join(CONFIG_FILE_NAME)
    })
}

fn default_database_path() -> PathBuf {
    dirs::data_dir()
        .unwrap_or_else(|| PathBuf::from("."))
        .join(CONFIG_DIRECTORY_NAME)
        .join(DATABASE_FILE_NAME)
}
