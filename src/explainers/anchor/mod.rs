//! Anchor explanations
//!
//! An anchor is a set of predicates on the instance such that, whenever they
//! hold, the model's prediction stays the same with high probability. The
//! search is shared ([`AnchorBaseBeam`]); each data modality supplies its own
//! [`AnchorSampler`].

mod beam;
mod image;
mod tabular;
mod text;

pub use beam::{AnchorBaseBeam, AnchorSampler, BeamResult, SampleBatch};
pub use image::{AnchorImage, AnchorImageExplanation, ImageFudge};
pub use tabular::{AnchorTabular, DistributedAnchorTabular};
pub use text::{AnchorText, SamplingStrategy};

use super::explanation::ExplanationMeta;
use crate::error::{ExplainError, Result};
use serde::{Deserialize, Serialize};

/// Configuration for the anchor search
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct AnchorConfig {
    /// Minimum precision for an anchor to be accepted
    pub threshold: f64,
    /// Significance level of the precision bounds
    pub delta: f64,
    /// Gap tolerance for the KL-LUCB candidate selection
    pub tau: f64,
    /// Tolerance around `threshold` when deciding an anchor's precision
    pub epsilon_stop: f64,
    /// Samples drawn per refinement step
    pub batch_size: usize,
    /// Unconstrained samples used to estimate coverage
    pub coverage_samples: usize,
    /// Number of anchors kept per size
    pub beam_size: usize,
    /// Stop at the first anchor meeting the threshold
    pub stop_on_first: bool,
    /// Maximum number of predicates in an anchor
    pub max_anchor_size: Option<usize>,
    /// Samples drawn for every new candidate
    pub min_samples_start: usize,
    /// Upper bound on refinement batches per decision
    pub max_batches: usize,
    /// Random seed
    pub seed: Option<u64>,
}

impl Default for AnchorConfig {
    fn default() -> Self {
        Self {
            threshold: 0.95,
            delta: 0.1,
            tau: 0.15,
            epsilon_stop: 0.05,
            batch_size: 100,
            coverage_samples: 10000,
            beam_size: 1,
            stop_on_first: false,
            max_anchor_size: None,
            min_samples_start: 100,
            max_batches: 1000,
            seed: None,
        }
    }
}

impl AnchorConfig {
    /// Create a new anchor configuration
    pub fn new() -> Self {
        Self::default()
    }

    /// Set the precision threshold
    pub fn with_threshold(mut self, threshold: f64) -> Self {
        self.threshold = threshold;
        self
    }

    /// Set the batch size
    pub fn with_batch_size(mut self, size: usize) -> Self {
        self.batch_size = size.max(1);
        self
    }

    /// Set the number of coverage samples
    pub fn with_coverage_samples(mut self, n: usize) -> Self {
        self.coverage_samples = n.max(1);
        self
    }

    /// Set the beam size
    pub fn with_beam_size(mut self, size: usize) -> Self {
        self.beam_size = size.max(1);
        self
    }

    /// Set the maximum anchor size
    pub fn with_max_anchor_size(mut self, size: usize) -> Self {
        self.max_anchor_size = Some(size);
        self
    }

    /// Stop at the first valid anchor
    pub fn with_stop_on_first(mut self, stop: bool) -> Self {
        self.stop_on_first = stop;
        self
    }

    /// Set random seed
    pub fn with_seed(mut self, seed: u64) -> Self {
        self.seed = Some(seed);
        self
    }

    /// Validate parameter ranges
    pub fn validate(&self) -> Result<()> {
        if !(0.0..=1.0).contains(&self.threshold) {
            return Err(ExplainError::invalid_parameter(
                "threshold",
                self.threshold,
                "must be in [0, 1]",
            ));
        }
        if !(self.delta > 0.0 && self.delta < 1.0) {
            return Err(ExplainError::invalid_parameter(
                "delta",
                self.delta,
                "must be in (0, 1)",
            ));
        }
        if self.tau <= 0.0 {
            return Err(ExplainError::invalid_parameter(
                "tau",
                self.tau,
                "must be positive",
            ));
        }
        if self.batch_size == 0 || self.coverage_samples == 0 || self.beam_size == 0 {
            return Err(ExplainError::ConfigError(
                "batch_size, coverage_samples and beam_size must be positive".to_string(),
            ));
        }
        Ok(())
    }
}

/// Result of an anchor explanation
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AnchorExplanation {
    /// Explanation metadata
    pub meta: ExplanationMeta,
    /// Human-readable predicates of the anchor
    pub anchor: Vec<String>,
    /// Predicate indices of the anchor
    pub predicates: Vec<usize>,
    /// Estimated precision
    pub precision: f64,
    /// Estimated coverage
    pub coverage: f64,
    /// Model prediction for the explained instance
    pub prediction: usize,
    /// Whether the precision threshold was reached
    pub meets_threshold: bool,
    /// Samples drawn for the returned anchor
    pub n_samples: usize,
}

impl AnchorExplanation {
    pub(crate) fn from_beam(
        meta: ExplanationMeta,
        result: BeamResult,
        names: &[String],
        prediction: usize,
    ) -> Self {
        let anchor = result
            .anchor
            .iter()
            .map(|&p| names.get(p).cloned().unwrap_or_else(|| format!("predicate {}", p)))
            .collect();
        Self {
            meta,
            anchor,
            predicates: result.anchor,
            precision: result.precision,
            coverage: result.coverage,
            prediction,
            meets_threshold: result.meets_threshold,
            n_samples: result.n_samples,
        }
    }

    /// Anchor predicates joined with AND
    pub fn rule(&self) -> String {
        if self.anchor.is_empty() {
            "(empty anchor)".to_string()
        } else {
            self.anchor.join(" AND ")
        }
    }

    /// Serialize to a JSON string
    pub fn to_json(&self) -> Result<String> {
        Ok(serde_json::to_string_pretty(self)?)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_config_validation() {
        assert!(AnchorConfig::default().validate().is_ok());
        assert!(AnchorConfig::new().with_threshold(1.5).validate().is_err());

        let mut config = AnchorConfig::default();
        config.delta = 0.0;
        assert!(config.validate().is_err());
    }

    #[test]
    fn test_config_deserializes_with_defaults() {
        let config: AnchorConfig = serde_json::from_str(r#"{"threshold": 0.9}"#).unwrap();
        assert_eq!(config.threshold, 0.9);
        assert_eq!(config.batch_size, 100);
    }

    #[test]
    fn test_rule_formatting() {
        let result = BeamResult {
            anchor: vec![1, 0],
            precision: 0.97,
            coverage: 0.2,
            meets_threshold: true,
            n_samples: 300,
        };
        let names = vec!["a > 1".to_string(), "b = x".to_string()];
        let meta = ExplanationMeta::local("AnchorTabular", &AnchorConfig::default());
        let exp = AnchorExplanation::from_beam(meta, result, &names, 1);
        assert_eq!(exp.rule(), "b = x AND a > 1");
    }
}
