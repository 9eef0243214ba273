use std::sync::Arc;

use arc_swap::ArcSwap;
use figment::{
    Figment,
    providers::{Format, Json, Serialized},
};
use hearth_llm::{CUSTOM_MODEL_ID, DEFAULT_MODEL_ID};
use serde::{Deserialize, Serialize};
use snafu::ensure;

use crate::error::{InvalidConfigurationSnafu, SessionResult};

pub const DEFAULT_SYSTEM_PROMPT: &str =
    "You are a helpful AI assistant. When asked to generate images, describe what you would create.";
pub const DEFAULT_TEMPERATURE: f64 = 0.7;
pub const DEFAULT_MAX_TOKENS: u64 = 512;
pub const MAX_TEMPERATURE: f64 = 2.0;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Theme {
    #[default]
    Dark,
    Light,
}

impl Theme {
    pub fn toggled(self) -> Self {
        match self {
            Self::Dark => Self::Light,
            Self::Light => Self::Dark,
        }
    }
}

/// Generation parameters and model selection. Persisted across restarts.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Settings {
    #[serde(default = "default_model_id")]
    pub model_id: String,
    #[serde(default)]
    pub custom_model_id: String,
    #[serde(default = "default_system_prompt")]
    pub system_prompt: String,
    #[serde(default = "default_temperature")]
    pub temperature: f64,
    #[serde(default = "default_max_tokens")]
    pub max_tokens: u64,
    #[serde(default)]
    pub concise_mode: bool,
    #[serde(default)]
    pub theme: Theme,
}

impl Default for Settings {
    fn default() -> Self {
        Self {
            model_id: default_model_id(),
            custom_model_id: String::new(),
            system_prompt: default_system_prompt(),
            temperature: DEFAULT_TEMPERATURE,
            max_tokens: DEFAULT_MAX_TOKENS,
            concise_mode: false,
            theme: Theme::default(),
        }
    }
}

impl Settings {
    /// Parses a persisted settings record, filling absent fields from defaults.
    pub fn from_persisted(raw: &str) -> Result<Self, figment::Error> {
        let settings = Figment::from(Serialized::defaults(Settings::default()))
            .merge(Json::string(raw))
            .extract::<Settings>()?;
        Ok(settings.normalized())
    }

    pub fn is_custom_model(&self) -> bool {
        self.model_id == CUSTOM_MODEL_ID
    }

    /// Resolves the identifier handed to the engine.
    ///
    /// Only checked when a load is requested; editing settings never fails.
    pub fn resolve_model_id(&self) -> SessionResult<String> {
        if !self.is_custom_model() {
            return Ok(self.model_id.clone());
        }

        let custom = self.custom_model_id.trim();
        ensure!(
            !custom.is_empty(),
            InvalidConfigurationSnafu {
                stage: "resolve-model-id",
            }
        );
        Ok(custom.to_string())
    }

    /// Label used for exports; falls back to the raw selection when unresolved.
    pub fn model_label(&self) -> String {
        self.resolve_model_id()
            .unwrap_or_else(|_| self.model_id.clone())
    }

    pub fn normalized(mut self) -> Self {
        self.model_id = self.model_id.trim().to_string();
        if self.model_id.is_empty() {
            self.model_id = default_model_id();
        }
        self.custom_model_id = self.custom_model_id.trim().to_string();

        self.temperature = if self.temperature.is_finite() {
            self.temperature.clamp(0.0, MAX_TEMPERATURE)
        } else {
            DEFAULT_TEMPERATURE
        };
        if self.max_tokens == 0 {
            self.max_tokens = DEFAULT_MAX_TOKENS;
        }

        self
    }
}

/// Lock-free snapshot holder for the live settings.
pub struct SettingsStore {
    settings: ArcSwap<Settings>,
}

impl SettingsStore {
    pub fn new(settings: Settings) -> Self {
        Self {
            settings: ArcSwap::from_pointee(settings.normalized()),
        }
    }

    pub fn settings(&self) -> Arc<Settings> {
        self.settings.load_full()
    }

    pub fn replace(&self, settings: Settings) -> Arc<Settings> {
        let settings = Arc::new(settings.normalized());
        self.settings.store(settings.clone());
        settings
    }

    pub fn update(&self, edit: impl FnOnce(&mut Settings)) -> Arc<Settings> {
        let mut next = Settings::clone(&self.settings.load());
        edit(&mut next);
        self.replace(next)
    }
}

impl Default for SettingsStore {
    fn default() -> Self {
        Self::new(Settings::default())
    }
}

fn default_model_id() -> String {
    DEFAULT_MODEL_ID.to_string()
}

fn default_system_prompt() -> String {
    DEFAULT_SYSTEM_PROMPT.to_string()
}

fn default_temperature() -> f64 {
    DEFAULT_TEMPERATURE
}

fn default_max_tokens() -> u64 {
    DEFAULT_MAX_TOKENS
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::SessionError;

    #[test]
    fn partial_record_keeps_defaults_for_missing_fields() {
        let settings =
            Settings::from_persisted(r#"{"temperature": 1.2, "theme": "light"}"#).unwrap();
        assert_eq!(settings.temperature, 1.2);
        assert_eq!(settings.theme, Theme::Light);
        assert_eq!(settings.model_id, DEFAULT_MODEL_ID);
        assert_eq!(settings.max_tokens, DEFAULT_MAX_TOKENS);
        assert_eq!(settings.system_prompt, DEFAULT_SYSTEM_PROMPT);
    }

    #[test]
    fn unreadable_record_is_an_error() {
        assert!(Settings::from_persisted("not json").is_err());
        assert!(Settings::from_persisted(r#"{"theme": "sepia"}"#).is_err());
    }

    #[test]
    fn custom_selection_requires_an_identifier() {
        let mut settings = Settings {
            model_id: CUSTOM_MODEL_ID.to_string(),
            ..Settings::default()
        };
        assert!(matches!(
            settings.resolve_model_id(),
            Err(SessionError::InvalidConfiguration { .. })
        ));
        assert_eq!(settings.model_label(), CUSTOM_MODEL_ID);

        settings.custom_model_id = "  qwen2.5:7b ".to_string();
        assert_eq!(settings.resolve_model_id().unwrap(), "qwen2.5:7b");
        assert_eq!(
            Settings::default().resolve_model_id().unwrap(),
            DEFAULT_MODEL_ID
        );
    }

    #[test]
    fn normalization_clamps_generation_parameters() {
        let settings = Settings {
            temperature: 3.5,
            max_tokens: 0,
            model_id: "   ".to_string(),
            ..Settings::default()
        }
        .normalized();
        assert_eq!(settings.temperature, MAX_TEMPERATURE);
        assert_eq!(settings.max_tokens, DEFAULT_MAX_TOKENS);
        assert_eq!(settings.model_id, DEFAULT_MODEL_ID);

        let negative = Settings {
            temperature: -1.0,
            ..Settings::default()
        }
        .normalized();
        assert_eq!(negative.temperature, 0.0);
    }

    #[test]
    fn store_updates_publish_new_snapshots() {
        let store = SettingsStore::default();
        let before = store.settings();

        let after = store.update(|settings| {
            settings.theme = settings.theme.toggled();
            settings.temperature = 9.0;
        });

        assert_eq!(before.theme, Theme::Dark);
        assert_eq!(after.theme, Theme::Light);
        assert_eq!(after.temperature, MAX_TEMPERATURE);
        assert_eq!(*store.settings(), *after);
    }
}
