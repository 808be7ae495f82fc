//! Runtime settings for the remote history client.

use std::time::Duration;

use crate::error::{Error, Result};

/// Constants for HTTP config
pub const HTTP_TIMEOUT_MS: u64 = 10_000;
pub const HTTP_CONNECT_TIMEOUT_MS: u64 = 3_000;

pub const RETRY_MAX_ATTEMPTS: usize = 4;
pub const RETRY_BASE_BACKOFF_MS: u64 = 250;

pub const DEFAULT_API_BASE: &str = "https://ws.audioscrobbler.com/2.0/";

#[derive(Debug, Clone)]
pub struct HttpConfig {
    pub timeout: Duration,
    pub connect_timeout: Duration,
    pub max_retries: usize,
    pub backoff: Duration,
}

impl Default for HttpConfig {
    fn default() -> Self {
        Self {
            timeout: Duration::from_millis(HTTP_TIMEOUT_MS),
            connect_timeout: Duration::from_millis(HTTP_CONNECT_TIMEOUT_MS),
            max_retries: RETRY_MAX_ATTEMPTS,
            backoff: Duration::from_millis(RETRY_BASE_BACKOFF_MS),
        }
    }
}

/// Who to ask and how to authenticate.
#[derive(Debug, Clone)]
pub struct LastFmConfig {
    pub user: String,
    pub api_key: String,
    pub api_base: String,
}

impl LastFmConfig {
    pub fn new(user: &str, api_key: Option<&str>, api_base: Option<&str>) -> Result<Self> {
        let api_key = match api_key.map(str::trim) {
            Some(k) if !k.is_empty() => k.to_string(),
            _ => {
                return Err(Error::Config(
                    "LASTFM_API_KEY was not set (use --api-key or the environment)".into(),
                ))
            }
        };
        let api_base = api_base.unwrap_or(DEFAULT_API_BASE).to_string();
        if !api_base.starts_with("https://") && !api_base.starts_with("http://") {
            return Err(Error::Config(format!("api base must be an http(s) url: {api_base}")));
        }
        if user.trim().is_empty() {
            return Err(Error::Config("user name is empty".into()));
        }
        Ok(Self {
            user: user.to_string(),
            api_key,
            api_base,
        })
    }
}
