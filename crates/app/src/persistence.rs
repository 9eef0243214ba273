//! Glue between the session state and the key-value store.
//!
//! Writes are best-effort: a failed write is logged and dropped, and the session keeps
//! running from memory until the next successful one.

use hearth_storage::KeyValueStore;
use serde_json::Value;

use crate::chat::MessageStore;
use crate::settings::Settings;

pub const SETTINGS_KEY: &str = "localai_settings";
pub const HISTORY_KEY: &str = "localai_history";

/// Older front-ends stored the selection under shorter names.
const LEGACY_SETTINGS_KEYS: [(&str, &str); 2] = [("model", "modelId"), ("customModel", "customModelId")];

pub fn load_settings(store: &dyn KeyValueStore) -> Settings {
    let Some(raw) = read_record(store, SETTINGS_KEY) else {
        return Settings::default();
    };

    match Settings::from_persisted(&upgrade_legacy_settings(&raw)) {
        Ok(settings) => settings,
        Err(error) => {
            tracing::warn!(error = %error, "persisted settings are unreadable; using defaults");
            Settings::default()
        }
    }
}

pub fn load_history(store: &dyn KeyValueStore) -> MessageStore {
    let Some(raw) = read_record(store, HISTORY_KEY) else {
        return MessageStore::new();
    };

    match serde_json::from_str::<MessageStore>(&raw) {
        Ok(mut history) => {
            let reset = history.settle_all();
            if reset > 0 {
                tracing::warn!(reset, "cleared streaming flags left over from a previous run");
            }
            history
        }
        Err(error) => {
            tracing::warn!(error = %error, "persisted history is unreadable; starting empty");
            MessageStore::new()
        }
    }
}

pub fn save_settings(store: &dyn KeyValueStore, settings: &Settings) {
    match serde_json::to_string(settings) {
        Ok(raw) => write_record(store, SETTINGS_KEY, &raw),
        Err(error) => tracing::warn!(error = %error, "failed to serialize settings"),
    }
}

pub fn save_history(store: &dyn KeyValueStore, history: &MessageStore) {
    match serde_json::to_string(history) {
        Ok(raw) => write_record(store, HISTORY_KEY, &raw),
        Err(error) => tracing::warn!(error = %error, "failed to serialize history"),
    }
}

fn read_record(store: &dyn KeyValueStore, key: &str) -> Option<String> {
    match store.get(key) {
        Ok(record) => record,
        Err(error) => {
            tracing::warn!(key, error = %error, "failed to read persisted record");
            None
        }
    }
}

fn write_record(store: &dyn KeyValueStore, key: &str, raw: &str) {
    if let Err(error) = store.set(key, raw) {
        tracing::warn!(key, error = %error, "failed to persist record; continuing in memory");
    }
}

fn upgrade_legacy_settings(raw: &str) -> String {
    let Ok(Value::Object(mut fields)) = serde_json::from_str::<Value>(raw) else {
        return raw.to_string();
    };

    for (legacy, current) in LEGACY_SETTINGS_KEYS {
        if let Some(value) = fields.remove(legacy)
            && !fields.contains_key(current)
        {
            fields.insert(current.to_string(), value);
        }
    }

    Value::Object(fields).to_string()
}
