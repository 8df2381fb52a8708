//! Application configuration loaded from environment variables and config files.
//!
//! Supports `.env` files for development and environment variables for production.
//! Config precedence: env vars > .env file > config file > defaults

use serde::Deserialize;
use std::sync::OnceLock;

use crate::{duration::parse_duration, redact::RedactionPolicy};

static CONFIG: OnceLock<AppConfig> = OnceLock::new();

/// Initialize the global configuration.
///
/// `path` names an optional TOML file (extension may be omitted). Should be
/// called once at startup; later calls return the first configuration.
pub fn init(path: Option<&str>) -> Result<&'static AppConfig, config::ConfigError> {
    // Load .env file if present (development)
    let _ = dotenvy::dotenv();

    let app_config = load(path)?;
    Ok(CONFIG.get_or_init(|| app_config))
}

/// Build a configuration without touching the global.
pub fn load(path: Option<&str>) -> Result<AppConfig, config::ConfigError> {
    let cfg = config::Config::builder()
        // Defaults
        .set_default("server.name", "localhost")?
        .set_default("database.url", "sqlite://sigil.db")?
        .set_default("database.max_connections", 8)?
        .set_default("associations.lifetime", "")?
        .set_default("invites.delete_tokens_on_bind", true)?
        .set_default("invites.validity_period", "")?
        .set_default("invites.retry_interval_secs", 300)?
        .set_default("federation.key_resolution", "direct")?
        .set_default("federation.request_timeout_secs", 30)?
        .set_default("replication.batch_limit", 500)?
        .set_default("replication.poll_interval_secs", 30)?
        .set_default("replication.backoff_base_ms", 1_000)?
        .set_default("replication.backoff_max_ms", 300_000)?
        .set_default("log.filter", "sigil=info")?
        .set_default("log.format", "pretty")?
        // Optional config file
        .add_source(config::File::with_name(path.unwrap_or("sigil")).required(path.is_some()))
        // Environment variables (SIGIL_SERVER__NAME, SIGIL_DATABASE__URL, etc.)
        .add_source(
            config::Environment::with_prefix("SIGIL")
                .separator("__")
                .try_parsing(true),
        )
        .build()?;

    let app_config: AppConfig = cfg.try_deserialize()?;
    app_config.validate()?;
    Ok(app_config)
}

#[derive(Debug, Deserialize, Clone)]
pub struct AppConfig {
    pub server: ServerConfig,
    pub database: DatabaseConfig,
    #[serde(default)]
    pub crypto: CryptoConfig,
    pub associations: AssociationsConfig,
    pub invites: InvitesConfig,
    pub federation: FederationConfig,
    pub replication: ReplicationConfig,
    #[serde(default)]
    pub redaction: RedactionConfig,
    pub log: LogConfig,
}

impl AppConfig {
    /// Reject values that only fail once they are used.
    fn validate(&self) -> Result<(), config::ConfigError> {
        for (key, ms) in [
            ("associations.lifetime", self.associations.lifetime_ms()?),
            ("invites.validity_period", self.invites.validity_ms()?),
        ] {
            if ms.is_some_and(|ms| ms < 0) {
                return Err(config::ConfigError::Message(format!("{key} must not be negative")));
            }
        }
        if self.federation.key_resolution == KeyResolution::Notary
            && self.federation.notary_server.is_none()
        {
            return Err(config::ConfigError::Message(
                "federation.key_resolution = \"notary\" requires federation.notary_server".into(),
            ));
        }
        if self.replication.batch_limit == 0 {
            return Err(config::ConfigError::Message(
                "replication.batch_limit must be positive".into(),
            ));
        }
        Ok(())
    }
}

#[derive(Debug, Deserialize, Clone)]
pub struct ServerConfig {
    /// Public server name; signatures are made under this name
    /// (e.g. "id.example.com").
    pub name: String,
}

#[derive(Debug, Deserialize, Clone)]
pub struct DatabaseConfig {
    /// SQLite connection URL
    pub url: String,
    pub max_connections: u32,
}

#[derive(Debug, Deserialize, Clone, Default)]
pub struct CryptoConfig {
    /// Ed25519 seed to import on first run, either bare unpadded base64 or
    /// `ed25519 <version> <base64>`.
    pub ed25519_signing_key: Option<String>,
}

#[derive(Debug, Deserialize, Clone)]
pub struct AssociationsConfig {
    /// How long a new binding stays valid, e.g. "100y". Empty means no expiry.
    pub lifetime: String,
}

impl AssociationsConfig {
    pub fn lifetime_ms(&self) -> Result<Option<i64>, config::ConfigError> {
        parse_duration(&self.lifetime).map_err(|e| config::ConfigError::Message(e.to_string()))
    }
}

#[derive(Debug, Deserialize, Clone)]
pub struct InvitesConfig {
    /// Delete tokens once delivered; `false` keeps them marked as sent.
    pub delete_tokens_on_bind: bool,
    /// How long a stored invite stays deliverable, e.g. "2w". Empty means forever.
    pub validity_period: String,
    /// Interval of the pass that retries undelivered invites.
    pub retry_interval_secs: u64,
}

impl InvitesConfig {
    pub fn validity_ms(&self) -> Result<Option<i64>, config::ConfigError> {
        parse_duration(&self.validity_period)
            .map_err(|e| config::ConfigError::Message(e.to_string()))
    }
}

#[derive(Debug, Deserialize, Clone, Copy, PartialEq, Eq)]
#[serde(rename_all = "lowercase")]
pub enum KeyResolution {
    /// Fetch keys from the owning server.
    Direct,
    /// Ask a trusted notary for the owning server's keys.
    Notary,
}

#[derive(Debug, Deserialize, Clone)]
pub struct FederationConfig {
    pub key_resolution: KeyResolution,
    /// Notary server name, required when `key_resolution = "notary"`.
    pub notary_server: Option<String>,
    pub request_timeout_secs: u64,
}

#[derive(Debug, Deserialize, Clone)]
pub struct ReplicationConfig {
    /// Maximum records per pushed batch.
    pub batch_limit: u32,
    /// How often an idle pusher re-checks for changes without a signal.
    pub poll_interval_secs: u64,
    pub backoff_base_ms: u64,
    pub backoff_max_ms: u64,
    #[serde(default)]
    pub peers: Vec<PeerConfig>,
}

/// A peer identity server we replicate to and accept replication from.
#[derive(Debug, Deserialize, Clone, PartialEq, Eq)]
pub struct PeerConfig {
    pub name: String,
    /// Base URL of the peer's replication API (e.g. "https://id.other.tld:4434").
    pub endpoint: String,
    /// The peer's unpadded base64 Ed25519 public key.
    pub verify_key: String,
}

#[derive(Debug, Deserialize, Clone, Default)]
pub struct RedactionConfig {
    pub username_reveal_characters: Option<usize>,
    pub domain_reveal_characters: Option<usize>,
    /// Older name of `username_reveal_characters`, used only when it is unset.
    pub username_obfuscate_characters: Option<usize>,
    /// Older name of `domain_reveal_characters`, used only when it is unset.
    pub domain_obfuscate_characters: Option<usize>,
    pub username_separator: Option<String>,
}

impl RedactionConfig {
    pub fn policy(&self) -> RedactionPolicy {
        let defaults = RedactionPolicy::default();
        RedactionPolicy {
            username_reveal_characters: self
                .username_reveal_characters
                .or(self.username_obfuscate_characters)
                .unwrap_or(defaults.username_reveal_characters),
            domain_reveal_characters: self
                .domain_reveal_characters
                .or(self.domain_obfuscate_characters)
                .unwrap_or(defaults.domain_reveal_characters),
            username_separator: self.username_separator.clone(),
        }
    }
}

#[derive(Debug, Deserialize, Clone, Copy, PartialEq, Eq)]
#[serde(rename_all = "lowercase")]
pub enum LogFormat {
    Pretty,
    Json,
}

#[derive(Debug, Deserialize, Clone)]
pub struct LogConfig {
    /// `EnvFilter` directive used when `RUST_LOG` is unset.
    pub filter: String,
    pub format: LogFormat,
}
