use once_cell::sync::Lazy;
use regex::Regex;
use thiserror::Error;

use super::Config;

static USER_ID_RE: Lazy<Regex> =
    Lazy::new(|| Regex::new(r"^@[a-z0-9._=\-/]+:[A-Za-z0-9.\-]+(:\d+)?$").expect("valid regex"));
static ROOM_ID_RE: Lazy<Regex> = Lazy::new(|| Regex::new(r"^!\S+:\S+$").expect("valid regex"));
static LOCALPART_PREFIX_RE: Lazy<Regex> =
    Lazy::new(|| Regex::new(r"^[a-z0-9._=\-/]+$").expect("valid regex"));

#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("failed to read config file: {0}")]
    Io(#[from] std::io::Error),
    #[error("failed to parse config file: {0}")]
    Parse(#[from] serde_yaml::Error),
    #[error("invalid config: {0}")]
    InvalidConfig(String),
}

fn invalid(message: impl Into<String>) -> ConfigError {
    ConfigError::InvalidConfig(message.into())
}

impl Config {
    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.bridge.domain.is_empty() {
            return Err(invalid("bridge.domain cannot be empty"));
        }

        if self.bridge.homeserver_url.is_empty() {
            return Err(invalid("bridge.homeserver_url cannot be empty"));
        }

        if self.bridge.port == 0 {
            return Err(invalid("bridge.port must be between 1 and 65535"));
        }

        if self.registration.appservice_token.is_empty()
            || self.registration.homeserver_token.is_empty()
        {
            return Err(invalid("registration tokens cannot be empty"));
        }

        if self.discord.bot_token.is_empty() {
            return Err(invalid("discord.bot_token cannot be empty"));
        }

        if self.database.connection_string().is_empty() {
            return Err(invalid("database connection string cannot be empty"));
        }

        if !ROOM_ID_RE.is_match(&self.portal.space) {
            return Err(invalid(format!(
                "portal.space must be a room id, got {}",
                self.portal.space
            )));
        }

        if !USER_ID_RE.is_match(&self.portal.user) {
            return Err(invalid(format!(
                "portal.user must be a user id, got {}",
                self.portal.user
            )));
        }

        if let Some(bot) = &self.portal.bot
            && !USER_ID_RE.is_match(bot)
        {
            return Err(invalid(format!("portal.bot must be a user id, got {bot}")));
        }

        if !LOCALPART_PREFIX_RE.is_match(&self.portal.puppet_prefix) {
            return Err(invalid(
                "portal.puppet_prefix must be a non-empty lowercase localpart fragment",
            ));
        }

        if self.portal.update_time == 0 {
            return Err(invalid("portal.update_time must be greater than zero"));
        }

        Ok(())
    }
}
