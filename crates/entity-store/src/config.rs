use std::collections::HashSet;
use std::env;

use regex::Regex;
use thiserror::Error;

#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("invalid entity store config: {0}")]
    InvalidValue(String),
    #[error("invalid pattern for {key}: {reason}")]
    InvalidPattern { key: String, reason: String },
}

/// Validation constants for the entity stores.
///
/// Regex fields are kept as pattern text (overridable from the environment)
/// and compiled once by [`Config::compile`].
#[derive(Clone, Debug)]
pub struct Config {
    pub app_name_regex: String,
    pub app_name_max_length: usize,
    pub app_title_max_length: usize,
    pub subdomain_regex: String,
    pub subdomain_max_length: usize,
    /// Words that cannot be used by others as subdomains.
    pub reserved_words: HashSet<String>,
    pub max_subdomains_per_user: u64,
    pub protocol: String,
    /// Domain under which hosted app sites are served; drives `index_url`
    /// derivation for apps created with a subdomain + source directory.
    pub static_hosting_domain: String,
}

const DEFAULT_RESERVED_WORDS: &[&str] = &[
    "admin", "api", "app", "cdn", "dev", "docs", "ftp", "login", "mail", "signup", "static",
    "status", "www",
];

impl Default for Config {
    fn default() -> Self {
        Self {
            app_name_regex: "^[a-zA-Z0-9_-]+$".to_string(),
            app_name_max_length: 60,
            app_title_max_length: 60,
            subdomain_regex: "^[a-zA-Z0-9_-]+$".to_string(),
            subdomain_max_length: 60,
            reserved_words: DEFAULT_RESERVED_WORDS
                .iter()
                .map(|word| (*word).to_string())
                .collect(),
            max_subdomains_per_user: 2_000,
            protocol: "https".to_string(),
            static_hosting_domain: "site.nexus.localhost".to_string(),
        }
    }
}

impl Config {
    pub fn from_env() -> Result<Self, ConfigError> {
        Self::from_lookup(|key| env::var(key).ok())
    }

    /// Parses the config from an injected lookup so tests can drive it
    /// without touching process state.
    pub fn from_lookup<F>(lookup: F) -> Result<Self, ConfigError>
    where
        F: Fn(&str) -> Option<String>,
    {
        let defaults = Self::default();
        Ok(Self {
            app_name_regex: lookup("NEXUS_APP_NAME_REGEX").unwrap_or(defaults.app_name_regex),
            app_name_max_length: parse_usize(
                &lookup,
                "NEXUS_APP_NAME_MAX_LENGTH",
                defaults.app_name_max_length,
            )?,
            app_title_max_length: parse_usize(
                &lookup,
                "NEXUS_APP_TITLE_MAX_LENGTH",
                defaults.app_title_max_length,
            )?,
            subdomain_regex: lookup("NEXUS_SUBDOMAIN_REGEX").unwrap_or(defaults.subdomain_regex),
            subdomain_max_length: parse_usize(
                &lookup,
                "NEXUS_SUBDOMAIN_MAX_LENGTH",
                defaults.subdomain_max_length,
            )?,
            reserved_words: lookup("NEXUS_RESERVED_WORDS")
                .map(|raw| {
                    raw.split(',')
                        .map(|word| word.trim().to_lowercase())
                        .filter(|word| !word.is_empty())
                        .collect()
                })
                .unwrap_or(defaults.reserved_words),
            max_subdomains_per_user: parse_u64(
                &lookup,
                "NEXUS_MAX_SUBDOMAINS_PER_USER",
                defaults.max_subdomains_per_user,
            )?,
            protocol: lookup("NEXUS_PROTOCOL").unwrap_or(defaults.protocol),
            static_hosting_domain: lookup("NEXUS_STATIC_HOSTING_DOMAIN")
                .unwrap_or(defaults.static_hosting_domain),
        })
    }

    /// Compiles the pattern fields, failing on malformed overrides.
    pub fn compile(&self) -> Result<CompiledPatterns, ConfigError> {
        Ok(CompiledPatterns {
            app_name: compile_pattern("NEXUS_APP_NAME_REGEX", &self.app_name_regex)?,
            subdomain: compile_pattern("NEXUS_SUBDOMAIN_REGEX", &self.subdomain_regex)?,
        })
    }
}

#[derive(Clone, Debug)]
pub struct CompiledPatterns {
    pub app_name: Regex,
    pub subdomain: Regex,
}

fn compile_pattern(key: &str, pattern: &str) -> Result<Regex, ConfigError> {
    Regex::new(pattern).map_err(|error| ConfigError::InvalidPattern {
        key: key.to_string(),
        reason: error.to_string(),
    })
}

fn parse_usize<F>(lookup: &F, key: &str, default: usize) -> Result<usize, ConfigError>
where
    F: Fn(&str) -> Option<String>,
{
    match lookup(key) {
        Some(raw) => raw
            .parse()
            .map_err(|_| ConfigError::InvalidValue(format!("{key} must be an integer"))),
        None => Ok(default),
    }
}

fn parse_u64<F>(lookup: &F, key: &str, default: u64) -> Result<u64, ConfigError>
where
    F: Fn(&str) -> Option<String>,
{
    match lookup(key) {
        Some(raw) => raw
            .parse()
            .map_err(|_| ConfigError::InvalidValue(format!("{key} must be an integer"))),
        None => Ok(default),
    }
}
