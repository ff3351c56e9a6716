//! Engine configuration.

use serde::{Deserialize, Serialize};

use crate::{Error, Result};

/// Tunables shared by every graph attached to one engine.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct EngineConfig {
    /// Upper bound on a signal's instance pool.
    pub max_instances: usize,
    /// Maximum messages drained by one `poll`.
    pub poll_batch: usize,
    /// Expression given to maps that don't set one.
    pub default_expression: String,
    /// Maximum nesting depth accepted by the expression parser.
    pub expression_depth: usize,
}

impl Default for EngineConfig {
    fn default() -> Self {
        Self {
            max_instances: 128,
            poll_batch: 256,
            default_expression: "y=x".into(),
            expression_depth: 64,
        }
    }
}

impl EngineConfig {
    /// Parse from JSON; missing fields take their defaults.
    pub fn from_json(s: &str) -> Result<Self> {
        let config: Self = serde_json::from_str(s)?;
        config.validate()?;
        Ok(config)
    }

    /// Read a JSON configuration file.
    pub fn from_file(path: impl AsRef<std::path::Path>) -> Result<Self> {
        let text = std::fs::read_to_string(path)?;
        Self::from_json(&text)
    }

    pub fn with_max_instances(mut self, n: usize) -> Self {
        self.max_instances = n;
        self
    }

    pub fn with_poll_batch(mut self, n: usize) -> Self {
        self.poll_batch = n;
        self
    }

    pub fn with_default_expression(mut self, expr: impl Into<String>) -> Self {
        self.default_expression = expr.into();
        self
    }

    pub fn with_expression_depth(mut self, depth: usize) -> Self {
        self.expression_depth = depth;
        self
    }

    pub fn validate(&self) -> Result<()> {
        if self.max_instances == 0 {
            return Err(Error::Config("max_instances must be at least 1".into()));
        }
        if self.poll_batch == 0 {
            return Err(Error::Config("poll_batch must be at least 1".into()));
        }
        if self.expression_depth == 0 {
            return Err(Error::Config("expression_depth must be at least 1".into()));
        }
        crate::expr::parse(&self.default_expression, self.expression_depth).map_err(|e| {
            Error::Config(format!("default_expression {:?}: {e}", self.default_expression))
        })?;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_defaults_validate() {
        let config = EngineConfig::default();
        assert!(config.validate().is_ok());
        assert_eq!(config.max_instances, 128);
        assert_eq!(config.default_expression, "y=x");
    }

    #[test]
    fn test_from_json_partial() {
        let config = EngineConfig::from_json(r#"{ "max_instances": 8 }"#).unwrap();
        assert_eq!(config.max_instances, 8);
        assert_eq!(config.poll_batch, 256);
    }

    #[test]
    fn test_invalid_config_rejected() {
        assert!(matches!(
            EngineConfig::from_json(r#"{ "poll_batch": 0 }"#),
            Err(Error::Config(_))
        ));
        let bad = EngineConfig::default().with_default_expression("y=");
        assert!(matches!(bad.validate(), Err(Error::Config(_))));
        assert!(matches!(EngineConfig::from_json("{"), Err(Error::Json(_))));
    }

    #[test]
    fn test_from_file() {
        let path = std::env::temp_dir().join(format!("mapper-rs-config-{}.json", std::process::id()));
        std::fs::write(&path, r#"{ "default_expression": "y=x*2" }"#).unwrap();
        let config = EngineConfig::from_file(&path).unwrap();
        std::fs::remove_file(&path).unwrap();
        assert_eq!(config.default_expression, "y=x*2");
        assert!(matches!(EngineConfig::from_file(&path), Err(Error::Io(_))));
    }
}
