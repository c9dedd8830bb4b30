pub use self::parser::{
    BridgeConfig, Config, DatabaseConfig, DbType, DiscordConfig, LoggingConfig, PortalConfig,
    RegistrationConfig,
};
pub use self::validator::ConfigError;

mod parser;
mod validator;
