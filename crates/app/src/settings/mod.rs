pub mod state;

pub use state::{
    DEFAULT_MAX_TOKENS, DEFAULT_SYSTEM_PROMPT, DEFAULT_TEMPERATURE, MAX_TEMPERATURE, Settings,
    SettingsStore, Theme,
};
