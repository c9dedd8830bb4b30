use std::path::PathBuf;

use anyhow::Result;
use clap::Parser;
use serde::Serialize;

use crate::config::Config;

#[derive(Debug, Parser)]
#[command(name = "matrix-port", version, about = "Mirrors chat channels into Matrix rooms")]
pub struct Cli {
    /// Path to the YAML configuration file.
    #[arg(short, long, env = "CONFIG_PATH", default_value = "config.yaml")]
    pub config: PathBuf,

    /// Print the appservice registration for the homeserver and exit.
    #[arg(long)]
    pub generate_registration: bool,
}

#[derive(Debug, Serialize)]
struct Registration {
    id: String,
    url: String,
    as_token: String,
    hs_token: String,
    sender_localpart: String,
    rate_limited: bool,
    namespaces: Namespaces,
}

#[derive(Debug, Serialize)]
struct Namespaces {
    users: Vec<Namespace>,
    aliases: Vec<Namespace>,
    rooms: Vec<Namespace>,
}

#[derive(Debug, Serialize)]
struct Namespace {
    exclusive: bool,
    regex: String,
}

/// Appservice registration YAML claiming the puppet namespace.
pub fn registration_yaml(config: &Config) -> Result<String> {
    let registration = Registration {
        id: config.registration.id.clone(),
        url: format!(
            "http://{}:{}",
            config.bridge.bind_address, config.bridge.port
        ),
        as_token: config.registration.appservice_token.clone(),
        hs_token: config.registration.homeserver_token.clone(),
        sender_localpart: config.registration.sender_localpart.clone(),
        rate_limited: false,
        namespaces: Namespaces {
            users: vec![Namespace {
                exclusive: true,
                regex: format!(
                    "@{}.*:{}",
                    regex::escape(&config.portal.puppet_prefix),
                    regex::escape(&config.bridge.domain)
                ),
            }],
            aliases: Vec::new(),
            rooms: Vec::new(),
        },
    };
    Ok(serde_yaml::to_string(&registration)?)
}
