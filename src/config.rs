//! Configuration loading.
//!
//! Layered the same way the rest of this family of services loads config: a YAML base
//! file, overridden by `KEYWARDEN_`-prefixed environment variables (double underscore
//! for nested keys, e.g. `KEYWARDEN_LIMITS__RPM`), with `DATABASE_URL` honored as a
//! special case alongside `KEYWARDEN_DATABASE_URL`.

use std::collections::HashMap;

use clap::Parser;
use figment::{
    providers::{Env, Format, Serialized, Yaml},
    Figment,
};
use serde::{Deserialize, Serialize};

use crate::db::models::GlobalLimits;

#[derive(Parser, Debug)]
#[command(author, version, about = "OpenAI-compatible gateway fronting Gemini")]
pub struct Args {
    /// Path to the YAML configuration file.
    #[arg(short = 'f', long = "config", env = "KEYWARDEN_CONFIG", default_value = "config.yaml")]
    pub config: String,

    /// Load and validate configuration, then exit without starting the server.
    #[arg(long)]
    pub validate: bool,
}

#[derive(Debug, Clone, Deserialize, Serialize)]
#[serde(default, deny_unknown_fields)]
pub struct Config {
    pub host: String,
    pub port: u16,

    pub database_url: String,

    pub admin_email: String,
    /// Argon2 password hash, not the plaintext password.
    pub admin_password_hash: String,
    /// Static bearer token accepted on admin routes in addition to the session cookie.
    pub admin_session_token: String,

    /// Base URL of the upstream Gemini "OpenAI compatibility" endpoint, e.g.
    /// `https://generativelanguage.googleapis.com/v1beta`.
    pub upstream_base_url: String,

    /// Optional egress proxy URL; credentials carry a rotating session token.
    pub egress_proxy_url: Option<String>,

    /// Public alias -> canonical upstream model name.
    pub model_aliases: HashMap<String, String>,

    /// Whether to inject `extra_body.google.thinking_config` when absent.
    pub thinking_chain_enabled: bool,

    /// Default rate limits, used to seed the persisted record on first boot.
    pub limits: GlobalLimits,

    pub provider: String,
    pub region: String,
}

impl Default for Config {
    fn default() -> Self {
        let mut model_aliases = HashMap::new();
        model_aliases.insert("salesmanchatbot-pro".to_string(), "gemini-2.5-flash".to_string());

        Self {
            host: "0.0.0.0".to_string(),
            port: 3000,
            database_url: "postgres://localhost/keywarden".to_string(),
            admin_email: "admin@example.com".to_string(),
            admin_password_hash: String::new(),
            admin_session_token: "changeme_local_only".to_string(),
            upstream_base_url: "https://generativelanguage.googleapis.com/v1beta".to_string(),
            egress_proxy_url: None,
            model_aliases,
            thinking_chain_enabled: true,
            limits: GlobalLimits::default(),
            provider: "google-gemini".to_string(),
            region: "unknown".to_string(),
        }
    }
}

impl Config {
    pub fn load(args: &Args) -> anyhow::Result<Self> {
        let mut figment = Figment::from(Serialized::defaults(Config::default()));

        if std::path::Path::new(&args.config).exists() {
            figment = figment.merge(Yaml::file(&args.config));
        }

        figment = figment
            .merge(Env::prefixed("KEYWARDEN_").split("__"))
            .merge(Env::raw().only(&["DATABASE_URL"]).map(|_| "database_url".into()));

        let config: Config = figment.extract()?;
        Ok(config)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn defaults_are_internally_consistent() {
        let config = Config::default();
        assert!(config.model_aliases.contains_key("salesmanchatbot-pro"));
        assert_eq!(config.limits.rpm, 60);
    }

    #[test]
    fn env_override_takes_precedence_over_default() {
        figment::Jail::expect_with(|jail| {
            jail.set_env("KEYWARDEN_PORT", "9999");
            let figment = Figment::from(Serialized::defaults(Config::default())).merge(Env::prefixed("KEYWARDEN_").split("__"));
            let config: Config = figment.extract().unwrap();
            assert_eq!(config.port, 9999);
            Ok(())
        });
    }
}
