use super::ConfigError;
use serde::{Deserialize, Serialize};
use std::path::Path;

#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct Config {
    pub bridge: BridgeConfig,
    pub registration: RegistrationConfig,
    pub portal: PortalConfig,
    pub discord: DiscordConfig,
    pub database: DatabaseConfig,
    #[serde(default)]
    pub logging: LoggingConfig,
}

#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct BridgeConfig {
    pub domain: String,
    pub homeserver_url: String,
    #[serde(default = "default_port")]
    pub port: u16,
    #[serde(default = "default_bind_address")]
    pub bind_address: String,
}

#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct RegistrationConfig {
    #[serde(default = "default_registration_id")]
    pub id: String,
    #[serde(alias = "as_token")]
    pub appservice_token: String,
    #[serde(alias = "hs_token")]
    pub homeserver_token: String,
    #[serde(default = "default_sender_localpart")]
    pub sender_localpart: String,
}

/// Settings that drive room and puppet provisioning.
#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct PortalConfig {
    /// Parent space every bridged room is attached to.
    pub space: String,
    /// Human account that is invited into, and administers, every bridged room.
    pub user: String,
    /// Appservice user acting as the bridge identity. Defaults to the sender localpart.
    #[serde(default)]
    pub bot: Option<String>,
    pub puppet_prefix: String,
    /// Minimum interval between name/avatar refreshes, in milliseconds.
    #[serde(default = "default_update_time")]
    pub update_time: u64,
}

#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct DiscordConfig {
    #[serde(default = "default_discord_adapter_id")]
    pub adapter_id: String,
    pub bot_token: String,
    #[serde(default = "default_use_privileged_intents")]
    pub use_privileged_intents: bool,
}

#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct LoggingConfig {
    #[serde(alias = "console", default = "default_log_level")]
    pub level: String,
    #[serde(default = "default_log_format")]
    pub format: String,
}

impl Default for LoggingConfig {
    fn default() -> Self {
        Self {
            level: default_log_level(),
            format: default_log_format(),
        }
    }
}

#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct DatabaseConfig {
    #[serde(default)]
    pub url: Option<String>,
    #[serde(default)]
    pub filename: Option<String>,
    #[serde(default)]
    pub max_connections: Option<u32>,
    #[serde(default)]
    pub min_connections: Option<u32>,
}

impl DatabaseConfig {
    pub fn db_type(&self) -> DbType {
        let url = self.connection_string();
        if url.starts_with("sqlite://") || (self.url.is_none() && self.filename.is_some()) {
            DbType::Sqlite
        } else {
            DbType::Postgres
        }
    }

    pub fn connection_string(&self) -> String {
        if let Some(ref url) = self.url {
            url.clone()
        } else if let Some(ref file) = self.filename {
            format!("sqlite://{}", file)
        } else {
            String::new()
        }
    }

    pub fn sqlite_path(&self) -> Option<String> {
        if let DbType::Sqlite = self.db_type() {
            let url = self.connection_string();
            Some(url.strip_prefix("sqlite://").unwrap_or(&url).to_string())
        } else {
            None
        }
    }

    pub fn max_connections(&self) -> Option<u32> {
        match self.db_type() {
            DbType::Postgres => self.max_connections,
            DbType::Sqlite => Some(1),
        }
    }

    pub fn min_connections(&self) -> Option<u32> {
        match self.db_type() {
            DbType::Postgres => self.min_connections,
            DbType::Sqlite => Some(1),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DbType {
    Postgres,
    Sqlite,
}

impl Config {
    pub fn load_from_file<P: AsRef<Path>>(path: P) -> Result<Self, ConfigError> {
        let content = std::fs::read_to_string(path)?;
        Self::load_from_str(&content)
    }

    pub fn load_from_str(content: &str) -> Result<Self, ConfigError> {
        let mut config: Config = serde_yaml::from_str(content)?;
        config.apply_env_overrides();
        config.validate()?;
        Ok(config)
    }

    /// Full user id of the bridge identity.
    pub fn bot_user_id(&self) -> String {
        match &self.portal.bot {
            Some(bot) => bot.clone(),
            None => format!(
                "@{}:{}",
                self.registration.sender_localpart, self.bridge.domain
            ),
        }
    }

    fn apply_env_overrides(&mut self) {
        if let Ok(value) = std::env::var("MATRIX_PORT_AS_TOKEN") {
            self.registration.appservice_token = value;
        }
        if let Ok(value) = std::env::var("MATRIX_PORT_HS_TOKEN") {
            self.registration.homeserver_token = value;
        }
        if let Ok(value) = std::env::var("MATRIX_PORT_DISCORD_TOKEN") {
            self.discord.bot_token = value;
        }
    }
}

fn default_port() -> u16 {
    9006
}

fn default_bind_address() -> String {
    "0.0.0.0".to_string()
}

fn default_registration_id() -> String {
    "matrix-port".to_string()
}

fn default_sender_localpart() -> String {
    "_port_bot".to_string()
}

fn default_update_time() -> u64 {
    86_400_000
}

fn default_discord_adapter_id() -> String {
    "discord".to_string()
}

fn default_use_privileged_intents() -> bool {
    true
}

fn default_log_level() -> String {
    "info".to_string()
}

fn default_log_format() -> String {
    "pretty".to_string()
}
