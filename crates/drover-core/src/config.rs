//! Client configuration with explicit > environment > default
//! resolution.

use anyhow::{Context, Result};

/// Environment variable for the API key.
pub const API_KEY_ENV: &str = "DROVER_API_KEY";
/// Environment variable overriding the base URL.
pub const BASE_URL_ENV: &str = "DROVER_BASE_URL";

const DEFAULT_BASE_URL: &str = "https://api.drover.dev";
const DEFAULT_TURN_PATH: &str = "/v1/turns";
const DEFAULT_AUTOMATION_TOOL: &str = "computer";

/// Resolved configuration for a [`SessionClient`](crate::SessionClient).
#[derive(Debug, Clone)]
pub struct ClientConfig {
    pub base_url: String,
    pub path: String,
    pub api_key: String,
    pub model: Option<String>,
    /// Tool name that routes calls through the automation controller.
    pub automation_tool: String,
}

impl ClientConfig {
    /// Resolves a configuration from explicit values and the
    /// environment.
    pub fn resolve(api_key: Option<&str>, base_url: Option<&str>) -> Result<Self> {
        Ok(Self {
            base_url: resolve_base_url(base_url)?,
            path: DEFAULT_TURN_PATH.to_string(),
            api_key: resolve_api_key(api_key)?,
            model: None,
            automation_tool: DEFAULT_AUTOMATION_TOOL.to_string(),
        })
    }

    #[must_use]
    pub fn with_model(mut self, model: impl Into<String>) -> Self {
        self.model = Some(model.into());
        self
    }

    #[must_use]
    pub fn with_automation_tool(mut self, tool: impl Into<String>) -> Self {
        self.automation_tool = tool.into();
        self
    }

    pub fn turn_url(&self) -> String {
        format!("{}{}", self.base_url, self.path)
    }
}

/// Resolves the API key with precedence: explicit > env.
fn resolve_api_key(explicit: Option<&str>) -> Result<String> {
    if let Some(key) = explicit {
        let trimmed = key.trim();
        if !trimmed.is_empty() {
            return Ok(trimmed.to_string());
        }
    }
    std::env::var(API_KEY_ENV)
        .context(format!("No API key available. Set {API_KEY_ENV}."))
}

/// Resolves the base URL with precedence: env > explicit > default.
fn resolve_base_url(explicit: Option<&str>) -> Result<String> {
    if let Ok(env_url) = std::env::var(BASE_URL_ENV) {
        let trimmed = env_url.trim();
        if !trimmed.is_empty() {
            validate_url(trimmed)?;
            return Ok(trimmed.trim_end_matches('/').to_string());
        }
    }
    if let Some(config_url) = explicit {
        let trimmed = config_url.trim();
        if !trimmed.is_empty() {
            validate_url(trimmed)?;
            return Ok(trimmed.trim_end_matches('/').to_string());
        }
    }
    Ok(DEFAULT_BASE_URL.to_string())
}

fn validate_url(url: &str) -> Result<()> {
    url::Url::parse(url).with_context(|| format!("Invalid base URL: {url}"))?;
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn explicit_key_beats_missing_env() {
        let config = ClientConfig::resolve(Some("sk-test"), Some("https://api.example.test"))
            .unwrap();
        assert_eq!(config.api_key, "sk-test");
        assert_eq!(config.turn_url(), "https://api.example.test/v1/turns");
    }

    #[test]
    fn invalid_base_url_is_rejected() {
        assert!(ClientConfig::resolve(Some("sk-test"), Some("not a url")).is_err());
    }

    #[test]
    fn trailing_slash_is_normalized() {
        let config =
            ClientConfig::resolve(Some("sk-test"), Some("https://api.example.test/")).unwrap();
        assert_eq!(config.base_url, "https://api.example.test");
    }
}
