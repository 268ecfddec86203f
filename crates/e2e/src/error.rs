//! Error types for E2E runs

use std::time::Duration;
use thiserror::Error;

#[derive(Error, Debug)]
pub enum E2eError {
    #[error("Invalid configuration: {0}")]
    Config(String),

    #[error("Target server failed to start: {0}")]
    ServerStartup(String),

    #[error("Target health check failed after {0} attempts")]
    ServerHealthCheck(usize),

    #[error("Playwright not found. Install with: npm install && npx playwright install")]
    PlaywrightNotFound,

    #[error("Playwright error: {0}")]
    Playwright(String),

    #[error("Scenario parse error: {0}")]
    SpecParse(String),

    #[error("Step failed: {step} - {reason}")]
    StepFailed { step: String, reason: String },

    #[error("Test timeout of {}ms exceeded: {name}", .limit.as_millis())]
    Timeout { name: String, limit: Duration },

    #[error("Worker failed: {0}")]
    Worker(String),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),

    #[error("YAML error: {0}")]
    Yaml(#[from] serde_yaml::Error),

    #[error("HTTP error: {0}")]
    Http(#[from] reqwest::Error),

    #[error("Invalid pattern: {0}")]
    Pattern(#[from] regex::Error),
}

pub type E2eResult<T> = Result<T, E2eError>;
