use std::{
    fmt, fs,
    path::{Path, PathBuf},
    str::FromStr,
};

use anyhow::Context;
use e2ee::IdentityKeyPair;
use serde::Deserialize;
use shared::error::ChatError;
use tracing::warn;
use zeroize::Zeroizing;

use crate::{transcript::UNREADABLE_PLACEHOLDER, ConversationOptions, KeySource};

pub const SETTINGS_FILE: &str = "dm.toml";

#[derive(Debug, Clone, Copy, PartialEq, Eq, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum KeyStrategy {
    Passphrase,
    Agreement,
}

impl FromStr for KeyStrategy {
    type Err = String;

    fn from_str(raw: &str) -> Result<Self, Self::Err> {
        match raw.trim().to_ascii_lowercase().as_str() {
            "passphrase" => Ok(Self::Passphrase),
            "agreement" => Ok(Self::Agreement),
            other => Err(format!("unknown key strategy '{other}'")),
        }
    }
}

#[derive(Clone, Deserialize)]
pub struct Settings {
    pub database_url: String,
    pub key_strategy: KeyStrategy,
    pub passphrase: Option<String>,
    pub identity_secret: Option<String>,
    pub unreadable_placeholder: String,
    pub feed_capacity: usize,
}

impl Default for Settings {
    fn default() -> Self {
        Self {
            database_url: "sqlite://./data/dm.db".into(),
            key_strategy: KeyStrategy::Agreement,
            passphrase: None,
            identity_secret: None,
            unreadable_placeholder: UNREADABLE_PLACEHOLDER.into(),
            feed_capacity: storage::DEFAULT_FEED_CAPACITY,
        }
    }
}

impl fmt::Debug for Settings {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Settings")
            .field("database_url", &self.database_url)
            .field("key_strategy", &self.key_strategy)
            .field("passphrase", &self.passphrase.as_ref().map(|_| "<redacted>"))
            .field(
                "identity_secret",
                &self.identity_secret.as_ref().map(|_| "<redacted>"),
            )
            .field("unreadable_placeholder", &self.unreadable_placeholder)
            .field("feed_capacity", &self.feed_capacity)
            .finish()
    }
}

impl Settings {
    /// Builds the key source named by `key_strategy`.
    pub fn key_source(&self) -> Result<KeySource, ChatError> {
        match self.key_strategy {
            KeyStrategy::Passphrase => {
                let passphrase = self
                    .passphrase
                    .as_deref()
                    .filter(|value| !value.is_empty())
                    .ok_or_else(|| {
                        ChatError::KeyDerivation("passphrase strategy needs a passphrase".into())
                    })?;
                Ok(KeySource::Passphrase(Zeroizing::new(passphrase.to_string())))
            }
            KeyStrategy::Agreement => {
                let secret = self.identity_secret.as_deref().ok_or_else(|| {
                    ChatError::KeyDerivation("agreement strategy needs an identity secret".into())
                })?;
                Ok(KeySource::Agreement(IdentityKeyPair::from_secret_b64(
                    secret,
                )?))
            }
        }
    }

    pub fn conversation_options(&self) -> ConversationOptions {
        ConversationOptions {
            unreadable_placeholder: self.unreadable_placeholder.clone(),
            event_capacity: self.feed_capacity,
        }
    }
}

#[derive(Debug, Default, Deserialize)]
struct FileSettings {
    database_url: Option<String>,
    key_strategy: Option<KeyStrategy>,
    passphrase: Option<String>,
    identity_secret: Option<String>,
    unreadable_placeholder: Option<String>,
    feed_capacity: Option<usize>,
}

pub fn load_settings() -> Settings {
    load_settings_from(Path::new(SETTINGS_FILE), |name| std::env::var(name).ok())
}

/// Defaults, then `path` if it parses, then variables from `env`.
pub fn load_settings_from(path: &Path, env: impl Fn(&str) -> Option<String>) -> Settings {
    let mut settings = Settings::default();

    if let Ok(raw) = fs::read_to_string(path) {
        match toml::from_str::<FileSettings>(&raw) {
            Ok(file_cfg) => apply_file(&mut settings, file_cfg),
            Err(err) => warn!(
                path = %path.display(),
                error = %err,
                "config: settings file ignored"
            ),
        }
    }

    if let Some(v) = env("DATABASE_URL") {
        settings.database_url = v;
    }
    if let Some(v) = env("APP__DATABASE_URL") {
        settings.database_url = v;
    }
    if let Some(v) = env("APP__KEY_STRATEGY") {
        match v.parse() {
            Ok(strategy) => settings.key_strategy = strategy,
            Err(err) => warn!(error = %err, "config: APP__KEY_STRATEGY ignored"),
        }
    }
    if let Some(v) = env("APP__PASSPHRASE") {
        settings.passphrase = Some(v);
    }
    if let Some(v) = env("APP__IDENTITY_SECRET") {
        settings.identity_secret = Some(v);
    }
    if let Some(v) = env("APP__UNREADABLE_PLACEHOLDER") {
        settings.unreadable_placeholder = v;
    }
    if let Some(v) = env("APP__FEED_CAPACITY") {
        if let Ok(parsed) = v.parse::<usize>() {
            settings.feed_capacity = parsed.max(1);
        }
    }

    settings
}

fn apply_file(settings: &mut Settings, file_cfg: FileSettings) {
    if let Some(v) = file_cfg.database_url {
        settings.database_url = v;
    }
    if let Some(v) = file_cfg.key_strategy {
        settings.key_strategy = v;
    }
    if let Some(v) = file_cfg.passphrase {
        settings.passphrase = Some(v);
    }
    if let Some(v) = file_cfg.identity_secret {
        settings.identity_secret = Some(v);
    }
    if let Some(v) = file_cfg.unreadable_placeholder {
        settings.unreadable_placeholder = v;
    }
    if let Some(v) = file_cfg.feed_capacity {
        settings.feed_capacity = v.max(1);
    }
}

pub fn prepare_database_url(raw_database_url: &str) -> anyhow::Result<String> {
    let database_url = normalize_database_url(raw_database_url);
    ensure_parent_dir_exists(&database_url)?;
    Ok(database_url)
}

fn normalize_database_url(raw_database_url: &str) -> String {
    let raw_database_url = raw_database_url.trim();

    if raw_database_url.is_empty() {
        return Settings::default().database_url;
    }

    if raw_database_url.starts_with("sqlite::memory:") || raw_database_url.contains("://") {
        return raw_database_url.to_string();
    }

    if let Some(path) = raw_database_url.strip_prefix("sqlite:") {
        return format!("sqlite://{}", path.replace('\\', "/"));
    }

    format!("sqlite://{}", raw_database_url.replace('\\', "/"))
}

fn ensure_parent_dir_exists(database_url: &str) -> anyhow::Result<()> {
    let Some(parent) = sqlite_path(database_url)
        .as_deref()
        .and_then(Path::parent)
        .map(Path::to_path_buf)
    else {
        return Ok(());
    };
    if parent.as_os_str().is_empty() {
        return Ok(());
    }

    fs::create_dir_all(&parent).with_context(|| {
        format!(
            "failed to create parent directory '{}' for database url '{database_url}'",
            parent.display()
        )
    })
}

fn sqlite_path(database_url: &str) -> Option<PathBuf> {
    let path = database_url
        .strip_prefix("sqlite://")?
        .split('?')
        .next()
        .unwrap_or_default();
    (!path.is_empty()).then(|| PathBuf::from(path))
}

#[cfg(test)]
#[path = "tests/config_tests.rs"]
mod tests;
