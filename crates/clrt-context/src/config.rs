//! Runtime configuration for context creation.
//!
//! Loads [`RuntimeConfig`] from a TOML file with environment variable
//! overrides via `CLRT_*` prefixed variables.

use std::path::Path;

use serde::{Deserialize, Serialize};

/// What the SVM coordinator does when a multi-device allocation fails partway.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum SvmFailurePolicy {
    /// Free the region on every device that already succeeded.
    #[default]
    Rollback,
    /// Leave earlier devices' regions in place; the caller owns cleanup.
    Leak,
}

impl std::fmt::Display for SvmFailurePolicy {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Rollback => write!(f, "rollback"),
            Self::Leak => write!(f, "leak"),
        }
    }
}

impl std::str::FromStr for SvmFailurePolicy {
    type Err = String;
    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_lowercase().as_str() {
            "rollback" => Ok(Self::Rollback),
            "leak" => Ok(Self::Leak),
            other => Err(format!("unknown SVM failure policy: {other}")),
        }
    }
}

/// Context runtime configuration.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct RuntimeConfig {
    /// Graphics interop library to load instead of the platform default.
    /// Override: `CLRT_GL_LIBRARY`
    pub gl_library: Option<String>,

    /// Partial-failure handling for multi-device SVM allocations.
    /// Override: `CLRT_SVM_FAILURE_POLICY`
    pub svm_failure_policy: SvmFailurePolicy,

    /// Keep a duplicate of the creation property list for introspection.
    /// Override: `CLRT_KEEP_PROPERTIES`
    pub keep_property_copy: bool,
}

impl Default for RuntimeConfig {
    fn default() -> Self {
        Self {
            gl_library: None,
            svm_failure_policy: SvmFailurePolicy::Rollback,
            keep_property_copy: true,
        }
    }
}

/// Errors that can occur when loading or validating a [`RuntimeConfig`].
#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    #[error("failed to read config file: {0}")]
    Io(#[from] std::io::Error),
    #[error("failed to parse TOML: {0}")]
    Parse(#[from] toml::de::Error),
    #[error("validation failed: {0}")]
    Validation(String),
    #[error("invalid environment override {key}={value}: {reason}")]
    EnvOverride {
        key: String,
        value: String,
        reason: String,
    },
}

impl RuntimeConfig {
    /// Load from a TOML file, then apply environment overrides.
    pub fn load(path: &Path) -> Result<Self, ConfigError> {
        let contents = std::fs::read_to_string(path)?;
        Self::from_toml(&contents)
    }

    /// Load from a TOML string, then apply environment overrides.
    pub fn from_toml(toml_str: &str) -> Result<Self, ConfigError> {
        let mut cfg: RuntimeConfig = toml::from_str(toml_str)?;
        cfg.apply_env_overrides()?;
        cfg.validate()?;
        Ok(cfg)
    }

    /// Defaults plus environment overrides.
    pub fn from_env() -> Result<Self, ConfigError> {
        let mut cfg = Self::default();
        cfg.apply_env_overrides()?;
        cfg.validate()?;
        Ok(cfg)
    }

    pub fn validate(&self) -> Result<(), ConfigError> {
        if let Some(lib) = &self.gl_library {
            if lib.trim().is_empty() {
                let reason = "gl_library must not be empty".to_string();
                return Err(ConfigError::Validation(reason));
            }
        }
        Ok(())
    }

    /// Apply `CLRT_*` environment variable overrides.
    pub fn apply_env_overrides(&mut self) -> Result<(), ConfigError> {
        if let Ok(val) = std::env::var("CLRT_GL_LIBRARY") {
            self.gl_library = Some(val);
        }

        if let Ok(val) = std::env::var("CLRT_SVM_FAILURE_POLICY") {
            match val.parse::<SvmFailurePolicy>() {
                Ok(policy) => self.svm_failure_policy = policy,
                Err(reason) => {
                    return Err(ConfigError::EnvOverride {
                        key: "CLRT_SVM_FAILURE_POLICY".into(),
                        value: val,
                        reason,
                    });
                }
            }
        }

        if let Ok(val) = std::env::var("CLRT_KEEP_PROPERTIES") {
            self.keep_property_copy = match val.to_lowercase().as_str() {
                "1" | "true" | "yes" => true,
                "0" | "false" | "no" => false,
                _ => {
                    return Err(ConfigError::EnvOverride {
                        key: "CLRT_KEEP_PROPERTIES".into(),
                        value: val.clone(),
                        reason: "expected a boolean".into(),
                    });
                }
            };
        }

        Ok(())
    }
}
