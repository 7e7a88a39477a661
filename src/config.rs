//! Process-wide configuration
//!
//! Loaded once at startup (after `.env` is applied) and shared read-only.
//! Credentials are wrapped in [`Secret`] so they never reach logs,
//! serialized output or prompts.

use crate::error::AssistantError;
use crate::Result;
use std::env;
use std::fmt;
use std::path::{Path, PathBuf};
use std::time::Duration;
use tracing_subscriber::EnvFilter;

pub const DEFAULT_GROQ_BASE_URL: &str = "https://api.groq.com/openai/v1";
pub const DEFAULT_GROQ_MODEL: &str = "llama-3.1-8b-instant";
pub const DEFAULT_CRM_BASE_URL: &str = "https://www.zohoapis.com/crm/v2";
pub const DEFAULT_CRM_AUTH_URL: &str = "https://accounts.zoho.com/oauth/v2/token";

/// A credential value. `Debug` is redacted and there is no `Display` or
/// `Serialize`; callers must ask for the raw value explicitly.
#[derive(Clone, PartialEq, Eq)]
pub struct Secret(String);

impl Secret {
    pub fn new(value: impl Into<String>) -> Self {
        Self(value.into())
    }

    pub fn expose(&self) -> &str {
        &self.0
    }
}

impl fmt::Debug for Secret {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str("Secret([REDACTED])")
    }
}

/// OAuth material for the CRM API
#[derive(Debug, Clone)]
pub struct CrmCredentials {
    pub client_id: Secret,
    pub client_secret: Secret,
    pub refresh_token: Secret,
    /// Optional pre-issued token; refreshed on first 401
    pub access_token: Option<Secret>,
}

#[derive(Debug, Clone)]
pub struct Credentials {
    pub llm_api_key: Secret,
    pub crm: Option<CrmCredentials>,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum DataSourceKind {
    Files {
        proposals: PathBuf,
        follow_ups: PathBuf,
        delimiter: u8,
    },
    Crm {
        base_url: String,
        auth_url: String,
        timeout: Duration,
    },
}

#[derive(Debug, Clone)]
pub struct LlmConfig {
    pub base_url: String,
    pub model: String,
    pub timeout: Duration,
    pub temperature: f32,
    pub max_tokens: u32,
}

#[derive(Debug, Clone)]
pub struct AppConfig {
    pub port: u16,
    pub llm: LlmConfig,
    pub data_source: DataSourceKind,
    pub memory_max_turns: usize,
    pub prompt_history_turns: usize,
    pub max_matched_records: usize,
    pub session_idle_timeout: Duration,
    credentials: Credentials,
}

impl AppConfig {
    /// Read configuration from the process environment
    pub fn from_env() -> Result<Self> {
        Self::from_lookup(|key| env::var(key).ok())
    }

    /// Build configuration from an arbitrary key lookup.
    ///
    /// Fails with `CredentialMissing` when a required secret is absent and
    /// with `ConfigError` when a value cannot be parsed.
    pub fn from_lookup<F>(lookup: F) -> Result<Self>
    where
        F: Fn(&str) -> Option<String>,
    {
        let get = |key: &str| lookup(key).map(|v| v.trim().to_string()).filter(|v| !v.is_empty());

        let llm_api_key = required_secret(&get, "GROQ_API_KEY")?;

        let data_source = match get("DATA_SOURCE").as_deref().map(str::to_lowercase).as_deref() {
            None | Some("files") | Some("file") | Some("csv") => DataSourceKind::Files {
                proposals: PathBuf::from(
                    get("PROPOSALS_PATH").unwrap_or_else(|| "data/proposals.csv".to_string()),
                ),
                follow_ups: PathBuf::from(
                    get("FOLLOW_UPS_PATH").unwrap_or_else(|| "data/follow_ups.csv".to_string()),
                ),
                delimiter: parse_delimiter(get("CSV_DELIMITER"))?,
            },
            Some("crm") | Some("zoho") => DataSourceKind::Crm {
                base_url: get("CRM_BASE_URL")
                    .unwrap_or_else(|| DEFAULT_CRM_BASE_URL.to_string())
                    .trim_end_matches('/')
                    .to_string(),
                auth_url: get("CRM_AUTH_URL").unwrap_or_else(|| DEFAULT_CRM_AUTH_URL.to_string()),
                timeout: Duration::from_secs(parse_or(&get, "CRM_TIMEOUT_SECS", 30u64)?),
            },
            Some(other) => {
                return Err(AssistantError::ConfigError(format!(
                    "DATA_SOURCE must be 'files' or 'crm', got '{}'",
                    other
                )))
            }
        };

        let crm = match data_source {
            DataSourceKind::Crm { .. } => Some(CrmCredentials {
                client_id: required_secret(&get, "ZOHO_CLIENT_ID")?,
                client_secret: required_secret(&get, "ZOHO_CLIENT_SECRET")?,
                refresh_token: required_secret(&get, "ZOHO_REFRESH_TOKEN")?,
                access_token: get("ZOHO_ACCESS_TOKEN").map(Secret::new),
            }),
            DataSourceKind::Files { .. } => None,
        };

        let port = match get("PORT").or_else(|| get("API_PORT")) {
            Some(raw) => raw
                .parse()
                .map_err(|_| AssistantError::ConfigError(format!("PORT must be a port number, got '{}'", raw)))?,
            None => 8080,
        };

        let memory_max_turns = parse_or(&get, "MEMORY_MAX_TURNS", 20usize)?;
        if memory_max_turns == 0 {
            return Err(AssistantError::ConfigError(
                "MEMORY_MAX_TURNS must be at least 1".to_string(),
            ));
        }

        Ok(Self {
            port,
            llm: LlmConfig {
                base_url: get("GROQ_BASE_URL")
                    .unwrap_or_else(|| DEFAULT_GROQ_BASE_URL.to_string())
                    .trim_end_matches('/')
                    .to_string(),
                model: get("GROQ_MODEL").unwrap_or_else(|| DEFAULT_GROQ_MODEL.to_string()),
                timeout: Duration::from_secs(parse_or(&get, "LLM_TIMEOUT_SECS", 30u64)?),
                temperature: 0.7,
                max_tokens: 1024,
            },
            data_source,
            memory_max_turns,
            prompt_history_turns: parse_or(&get, "PROMPT_HISTORY_TURNS", 6usize)?,
            max_matched_records: parse_or(&get, "MAX_MATCHED_RECORDS", 8usize)?,
            session_idle_timeout: Duration::from_secs(
                60 * parse_or(&get, "SESSION_IDLE_MINUTES", 60u64)?,
            ),
            credentials: Credentials { llm_api_key, crm },
        })
    }

    pub fn get_credentials(&self) -> &Credentials {
        &self.credentials
    }
}

fn required_secret<G>(get: &G, key: &str) -> Result<Secret>
where
    G: Fn(&str) -> Option<String>,
{
    get(key)
        .map(Secret::new)
        .ok_or_else(|| AssistantError::CredentialMissing(key.to_string()))
}

fn parse_or<G, T>(get: &G, key: &str, default: T) -> Result<T>
where
    G: Fn(&str) -> Option<String>,
    T: std::str::FromStr,
{
    match get(key) {
        Some(raw) => raw.parse().map_err(|_| {
            AssistantError::ConfigError(format!("{} has an invalid value '{}'", key, raw))
        }),
        None => Ok(default),
    }
}

fn parse_delimiter(raw: Option<String>) -> Result<u8> {
    match raw.as_deref() {
        None => Ok(b','),
        Some("\\t") | Some("tab") => Ok(b'\t'),
        Some(value) if value.len() == 1 && value.is_ascii() => Ok(value.as_bytes()[0]),
        Some(value) => Err(AssistantError::ConfigError(format!(
            "CSV_DELIMITER must be a single ASCII character, got '{}'",
            value
        ))),
    }
}

/// Apply `.env` to the process environment, then build the log filter
/// from `RUST_LOG`. The filter must be built second so `.env` can set it.
pub fn load_env_and_log_filter(default_filter: &str) -> EnvFilter {
    env_and_log_filter(None, "RUST_LOG", default_filter)
}

fn env_and_log_filter(dotenv_path: Option<&Path>, var: &str, default_filter: &str) -> EnvFilter {
    let _ = match dotenv_path {
        Some(path) => dotenv::from_path(path),
        None => dotenv::dotenv().map(|_| ()),
    };

    EnvFilter::try_from_env(var).unwrap_or_else(|_| EnvFilter::new(default_filter))
}
