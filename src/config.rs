//! Runtime configuration
//!
//! Values come from the process environment, optionally seeded from `.env`.

use crate::error::OrchestrationError;
use crate::Result;
use std::env;
use std::str::FromStr;
use std::time::Duration;

/// Knobs of the reasoning loop and the turn pipeline
#[derive(Debug, Clone)]
pub struct AgentConfig {
    /// Maximum THINK invocations per turn
    pub max_iterations: u32,
    /// Extra THINK attempts after a model failure
    pub model_retries: u32,
    /// Linear backoff unit between THINK attempts
    pub retry_backoff: Duration,
    pub model_timeout: Duration,
    pub tool_timeout: Duration,
    pub storage_timeout: Duration,
    /// Messages shown to the intent router
    pub router_history: usize,
    pub temperature: Option<f32>,
}

impl Default for AgentConfig {
    fn default() -> Self {
        Self {
            max_iterations: 6,
            model_retries: 2,
            retry_backoff: Duration::from_millis(500),
            model_timeout: Duration::from_secs(120),
            tool_timeout: Duration::from_secs(30),
            storage_timeout: Duration::from_secs(10),
            router_history: 6,
            temperature: Some(0.2),
        }
    }
}

/// Process-level settings
#[derive(Debug, Clone)]
pub struct Settings {
    pub gemini_api_key: String,
    pub gemini_model: String,
    pub router_model: String,
    pub database_url: Option<String>,
    /// Required by the HTTP server only
    pub api_token: Option<String>,
    pub host: String,
    pub port: u16,
    pub agent: AgentConfig,
}

impl Settings {
    /// Load settings from `.env` and the environment.
    pub fn from_env() -> Result<Self> {
        dotenv::dotenv().ok();

        let defaults = AgentConfig::default();
        let agent = AgentConfig {
            max_iterations: parse_var("MAX_ITERATIONS", defaults.max_iterations)?,
            model_retries: parse_var("MODEL_RETRIES", defaults.model_retries)?,
            retry_backoff: defaults.retry_backoff,
            model_timeout: Duration::from_secs(parse_var(
                "MODEL_TIMEOUT_SECS",
                defaults.model_timeout.as_secs(),
            )?),
            tool_timeout: Duration::from_secs(parse_var(
                "TOOL_TIMEOUT_SECS",
                defaults.tool_timeout.as_secs(),
            )?),
            storage_timeout: Duration::from_secs(parse_var(
                "STORAGE_TIMEOUT_SECS",
                defaults.storage_timeout.as_secs(),
            )?),
            router_history: parse_var("ROUTER_HISTORY", defaults.router_history)?,
            temperature: match env::var("TEMPERATURE") {
                Ok(raw) => Some(parse_value("TEMPERATURE", &raw)?),
                Err(_) => defaults.temperature,
            },
        };

        if agent.max_iterations == 0 {
            return Err(OrchestrationError::ConfigError(
                "MAX_ITERATIONS must be at least 1".to_string(),
            ));
        }

        Ok(Self {
            gemini_api_key: env::var("GEMINI_API_KEY").unwrap_or_default(),
            gemini_model: env::var("GEMINI_MODEL").unwrap_or_else(|_| "gemini-2.5-pro".to_string()),
            router_model: env::var("ROUTER_MODEL")
                .unwrap_or_else(|_| "gemini-2.5-flash".to_string()),
            database_url: env::var("DATABASE_URL")
                .ok()
                .filter(|url| !url.trim().is_empty()),
            api_token: env::var("API_TOKEN")
                .ok()
                .filter(|token| !token.trim().is_empty()),
            host: env::var("HOST").unwrap_or_else(|_| "0.0.0.0".to_string()),
            port: env::var("PORT")
                .or_else(|_| env::var("API_PORT"))
                .map(|raw| parse_value("PORT", &raw))
                .unwrap_or(Ok(8000))?,
            agent,
        })
    }

    pub fn api_token(&self) -> Result<&str> {
        self.api_token
            .as_deref()
            .ok_or_else(|| OrchestrationError::ConfigError("API_TOKEN is not set".to_string()))
    }
}

fn parse_var<T: FromStr>(name: &str, default: T) -> Result<T> {
    match env::var(name) {
        Ok(raw) => parse_value(name, &raw),
        Err(_) => Ok(default),
    }
}

fn parse_value<T: FromStr>(name: &str, raw: &str) -> Result<T> {
    raw.trim()
        .parse()
        .map_err(|_| OrchestrationError::ConfigError(format!("{} has an invalid value: {}", name, raw)))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_agent_defaults() {
        let config = AgentConfig::default();
        assert_eq!(config.max_iterations, 6);
        assert_eq!(config.model_retries, 2);
        assert_eq!(config.router_history, 6);
    }

    #[test]
    fn test_parse_value_rejects_garbage() {
        let parsed: Result<u32> = parse_value("MAX_ITERATIONS", "six");
        assert!(matches!(parsed, Err(OrchestrationError::ConfigError(_))));

        let parsed: Result<u32> = parse_value("MAX_ITERATIONS", " 4 ");
        assert_eq!(parsed.unwrap(), 4);
    }
}
