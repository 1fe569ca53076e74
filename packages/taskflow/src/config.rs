use anyhow::{Context, Result};
use dotenvy::dotenv;
use std::env;

/// Application configuration loaded from environment variables
#[derive(Debug, Clone)]
pub struct Config {
    pub database_url: String,
    pub slack_webhook_url: Option<String>,
}

impl Config {
    /// Load configuration from environment variables
    pub fn from_env() -> Result<Self> {
        // Load .env file if present (development)
        let _ = dotenv();

        Ok(Self {
            database_url: env::var("SQL_ALCHEMY_CONNECTION")
                .context("SQL_ALCHEMY_CONNECTION must be set")?,
            slack_webhook_url: env::var("SLACK_WEBHOOK_URL").ok(),
        })
    }
}
