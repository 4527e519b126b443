//! Typed configuration from environment variables.
//!
//! Loads once at startup and fails fast if a required variable is missing.
//! The database URL is wrapped in `SecretString` so it never reaches a log.

pub mod secrets;

use std::path::PathBuf;

use secrecy::SecretString;

use crate::error::{Error, Result};

pub const DEFAULT_BLOB_ROOT: &str = "./data/blobs";
pub const DEFAULT_BASE_URL: &str = "http://localhost:8080";

#[derive(Debug)]
pub struct Config {
    pub database_url: SecretString,
    /// Root directory of the filesystem blob store.
    pub blob_root: PathBuf,
    /// TOML catalog of query tags; the database table is used when unset.
    pub query_tag_catalog: Option<PathBuf>,
    /// Prefix for workitem resource URLs.
    pub base_url: String,
    pub otel_endpoint: Option<String>,
    pub log_level: String,
}

impl Config {
    /// Load configuration from environment variables.
    ///
    /// In local dev, call `dotenvy::dotenv().ok()` before this.
    pub fn from_env() -> Result<Self> {
        Self::from_lookup(|name| std::env::var(name).ok())
    }

    /// Load configuration through `lookup` instead of the process
    /// environment.
    pub fn from_lookup(lookup: impl Fn(&str) -> Option<String>) -> Result<Self> {
        let var = |name: &str| lookup(name).filter(|value| !value.trim().is_empty());
        Ok(Self {
            database_url: SecretString::from(required_var(&var, "DATABASE_URL")?),
            blob_root: var("BLOB_ROOT")
                .unwrap_or_else(|| DEFAULT_BLOB_ROOT.to_string())
                .into(),
            query_tag_catalog: var("QUERY_TAG_CATALOG").map(PathBuf::from),
            base_url: var("BASE_URL")
                .unwrap_or_else(|| DEFAULT_BASE_URL.to_string())
                .trim_end_matches('/')
                .to_string(),
            otel_endpoint: var("OTEL_ENDPOINT"),
            log_level: var("LOG_LEVEL").unwrap_or_else(|| "info".to_string()),
        })
    }
}

fn required_var(var: &impl Fn(&str) -> Option<String>, name: &str) -> Result<String> {
    var(name).ok_or_else(|| Error::Config(format!("required environment variable {name} is not set")))
}
