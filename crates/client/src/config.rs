//! Client configuration

use std::env;
use std::path::PathBuf;

use prepbuddy_shared::PriceIds;

use crate::error::{ClientError, ClientResult};

/// Subscription store configuration
#[derive(Debug, Clone)]
pub struct ClientConfig {
    /// Base URL of the PrepBuddy API, without the `/api/v1` prefix
    pub api_url: String,
    /// Browser-facing app URL used for checkout redirects
    pub app_url: String,
    /// Directory for the persisted billing cache; `None` keeps it in memory
    pub cache_dir: Option<PathBuf>,
    pub price_ids: PriceIds,
}

impl ClientConfig {
    pub fn new(api_url: impl Into<String>, app_url: impl Into<String>) -> Self {
        Self {
            api_url: api_url.into().trim_end_matches('/').to_string(),
            app_url: app_url.into().trim_end_matches('/').to_string(),
            cache_dir: None,
            price_ids: PriceIds::default(),
        }
    }

    /// Load configuration from environment variables
    pub fn from_env() -> ClientResult<Self> {
        let api_url = env::var("PREPBUDDY_API_URL")
            .map_err(|_| ClientError::Config("PREPBUDDY_API_URL is not set".to_string()))?;
        let app_url =
            env::var("PREPBUDDY_APP_URL").unwrap_or_else(|_| "http://localhost:5173".to_string());

        let mut config = Self::new(api_url, app_url);
        config.cache_dir = env::var("PREPBUDDY_CACHE_DIR").ok().map(PathBuf::from);
        config.price_ids = PriceIds::from_env();

        Ok(config)
    }

    pub(crate) fn endpoint(&self, path: &str) -> String {
        format!("{}/api/v1{}", self.api_url, path)
    }
}
