//! Interface to the external load-test config validator.
//!
//! The config language itself is out of scope. The validator is handed the
//! raw config text and the resolved environment and reports the facts the
//! controller needs to dispatch the job.

use std::collections::BTreeMap;

use async_trait::async_trait;

/// What the controller hands to the validator.
#[derive(Debug, Clone)]
pub struct ValidationRequest<'a> {
    pub config_filename: &'a str,
    pub config_text: &'a str,
    pub environment: &'a BTreeMap<String, String>,
    pub binary_version: &'a str,
    pub bypass: bool,
}

/// Facts extracted from a valid config.
#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub struct ValidatedConfig {
    pub runtime_minutes: u64,
    pub bucket_size_ms: u64,
    /// Additional files the config reads, relative to its own directory.
    pub required_files: Vec<String>,
    /// Environment variables the config references.
    pub required_env_vars: Vec<String>,
}

#[async_trait]
pub trait ConfigValidator: Send + Sync {
    /// Returns the validator's message on rejection.
    async fn validate(&self, request: ValidationRequest<'_>) -> Result<ValidatedConfig, String>;
}

/// Validator that accepts every config and reports fixed facts. Used when no
/// external validator is wired in, and by tests.
#[derive(Debug, Clone, Default)]
pub struct StaticValidator {
    pub facts: ValidatedConfig,
    /// Reject configs containing this text, with this message.
    pub reject_on: Option<(String, String)>,
}

impl StaticValidator {
    pub fn new(runtime_minutes: u64, bucket_size_ms: u64) -> Self {
        Self {
            facts: ValidatedConfig {
                runtime_minutes,
                bucket_size_ms,
                ..ValidatedConfig::default()
            },
            reject_on: None,
        }
    }

    pub fn requiring_files(mut self, files: &[&str]) -> Self {
        self.facts.required_files = files.iter().map(|s| s.to_string()).collect();
        self
    }

    pub fn requiring_env(mut self, vars: &[&str]) -> Self {
        self.facts.required_env_vars = vars.iter().map(|s| s.to_string()).collect();
        self
    }

    pub fn rejecting(mut self, needle: &str, message: &str) -> Self {
        self.reject_on = Some((needle.to_string(), message.to_string()));
        self
    }
}

#[async_trait]
impl ConfigValidator for StaticValidator {
    async fn validate(&self, request: ValidationRequest<'_>) -> Result<ValidatedConfig, String> {
        if let Some((needle, message)) = &self.reject_on {
            if !request.bypass && request.config_text.contains(needle.as_str()) {
                return Err(message.clone());
            }
        }
        Ok(self.facts.clone())
    }
}

/// A required file path must stay inside the config's own directory.
pub fn is_local_path(path: &str) -> bool {
    !path.is_empty() && path != "." && path != ".." && !path.contains(['/', '\\'])
}
