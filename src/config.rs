//! Aggregate explainer configuration, loadable from JSON

use crate::error::{ExplainError, Result};
use crate::explainers::{
    AleConfig, AnchorConfig, CemConfig, CounterfactualConfig, CounterfactualProtoConfig,
    IntegratedGradientsConfig,
};
#[cfg(feature = "shap")]
use crate::explainers::KernelShapConfig;
use serde::{Deserialize, Serialize};
use std::path::Path;
use tracing::info;

/// Configuration for every explainer; missing sections take their defaults
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct ExplainConfig {
    pub ale: AleConfig,
    pub anchor: AnchorConfig,
    pub counterfactual: CounterfactualConfig,
    pub cfproto: CounterfactualProtoConfig,
    pub cem: CemConfig,
    pub integrated_gradients: IntegratedGradientsConfig,
    #[cfg(feature = "shap")]
    pub kernel_shap: KernelShapConfig,
}

impl ExplainConfig {
    /// Create the default configuration
    pub fn new() -> Self {
        Self::default()
    }

    /// Parse from a JSON string
    pub fn from_json_str(json: &str) -> Result<Self> {
        let config: Self = serde_json::from_str(json)
            .map_err(|e| ExplainError::ConfigError(format!("invalid configuration: {}", e)))?;
        config.validate()?;
        Ok(config)
    }

    /// Load from a JSON file
    pub fn from_json_file(path: impl AsRef<Path>) -> Result<Self> {
        let content = std::fs::read_to_string(path.as_ref())?;
        let config = Self::from_json_str(&content)?;
        info!(path = %path.as_ref().display(), "Loaded explainer configuration");
        Ok(config)
    }

    /// Serialize to pretty JSON
    pub fn to_json(&self) -> Result<String> {
        Ok(serde_json::to_string_pretty(self)?)
    }

    /// Validate every section
    pub fn validate(&self) -> Result<()> {
        let section = |name: &str, res: Result<()>| {
            res.map_err(|e| ExplainError::ConfigError(format!("{}: {}", name, e)))
        };
        section("ale", self.ale.validate())?;
        section("anchor", self.anchor.validate())?;
        section("counterfactual", self.counterfactual.validate())?;
        section("cfproto", self.cfproto.validate())?;
        section("cem", self.cem.validate())?;
        section("integrated_gradients", self.integrated_gradients.validate())?;
        #[cfg(feature = "shap")]
        section("kernel_shap", self.kernel_shap.validate())?;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;

    #[test]
    fn test_partial_json_uses_defaults() {
        let config =
            ExplainConfig::from_json_str(r#"{"anchor": {"threshold": 0.9, "seed": 3}}"#).unwrap();
        assert_eq!(config.anchor.threshold, 0.9);
        assert_eq!(config.anchor.seed, Some(3));
        assert_eq!(config.anchor.batch_size, AnchorConfig::default().batch_size);
        assert_eq!(config.ale, AleConfig::default());
    }

    #[test]
    fn test_invalid_values_rejected() {
        let err = ExplainConfig::from_json_str(r#"{"anchor": {"threshold": 1.5}}"#).unwrap_err();
        assert!(matches!(err, ExplainError::ConfigError(ref msg) if msg.starts_with("anchor")));
        assert!(ExplainConfig::from_json_str("not json").is_err());
    }

    #[cfg(feature = "shap")]
    #[test]
    fn test_invalid_kernel_shap_rejected() {
        let err = ExplainConfig::from_json_str(r#"{"kernel_shap": {"n_samples": 1}}"#).unwrap_err();
        assert!(matches!(err, ExplainError::ConfigError(ref msg) if msg.starts_with("kernel_shap")));
        let err = ExplainConfig::from_json_str(r#"{"kernel_shap": {"summarise_background": 0}}"#)
            .unwrap_err();
        assert!(matches!(err, ExplainError::ConfigError(ref msg) if msg.starts_with("kernel_shap")));
    }

    #[test]
    fn test_file_roundtrip() {
        let mut config = ExplainConfig::new();
        config.integrated_gradients.n_steps = 32;
        let mut file = tempfile::NamedTempFile::new().unwrap();
        file.write_all(config.to_json().unwrap().as_bytes()).unwrap();

        let loaded = ExplainConfig::from_json_file(file.path()).unwrap();
        assert_eq!(loaded, config);
    }
}
