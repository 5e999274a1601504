use std::time::Duration;

use super::error::{HttpApiError, HttpResult};

const DEFAULT_CONNECT_TIMEOUT: Duration = Duration::from_secs(5);

/// Runtime configuration describing how to reach the assessment server.
#[derive(Debug, Clone)]
pub struct ApiConfig {
    pub base_url: String,
    pub token: Option<String>,
    pub connect_timeout: Duration,
}

impl ApiConfig {
    /// Construct a configuration from an explicit base URL.
    pub fn new(base_url: impl Into<String>) -> Self {
        Self {
            base_url: base_url.into(),
            token: None,
            connect_timeout: DEFAULT_CONNECT_TIMEOUT,
        }
    }

    /// Attach a bearer token sent with every request.
    pub fn with_token(mut self, token: impl Into<String>) -> Self {
        self.token = Some(token.into());
        self
    }

    /// Build a configuration by reading the expected environment variables.
    pub fn from_env() -> HttpResult<Self> {
        let base_url = std::env::var("EXAM_API_BASE_URL").map_err(|_| {
            HttpApiError::MissingEnvVar {
                var: "EXAM_API_BASE_URL",
            }
        })?;

        let mut config = Self::new(base_url);
        if let Some(token) = std::env::var("EXAM_API_TOKEN")
            .ok()
            .filter(|token| !token.is_empty())
        {
            config = config.with_token(token);
        }

        Ok(config)
    }
}
