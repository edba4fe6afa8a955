//! SHAP explainers: model-agnostic Kernel SHAP and exact TreeSHAP

mod kernel;
mod tree;

pub use kernel::{KernelShap, KernelShapConfig};
pub use tree::{FeaturePerturbation, Tree, TreeEnsemble, TreeNode, TreeShap};

use super::explanation::ExplanationMeta;
use crate::error::{ExplainError, Result};
use serde::{Deserialize, Serialize};

/// Output space in which SHAP values are additive
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
pub enum Link {
    /// Raw model output
    #[default]
    Identity,
    /// Log-odds of a probability output
    Logit,
}

impl Link {
    /// Map a model output into the additive space
    pub fn apply(self, v: f64) -> f64 {
        match self {
            Link::Identity => v,
            Link::Logit => {
                let p = v.clamp(1e-12, 1.0 - 1e-12);
                (p / (1.0 - p)).ln()
            }
        }
    }
}

/// Contribution of one feature to one prediction
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct FeatureContribution {
    /// Feature index
    pub feature_index: usize,
    /// Feature name (if provided)
    pub feature_name: Option<String>,
    /// Feature value for this instance
    pub feature_value: f64,
    /// SHAP value
    pub contribution: f64,
}

/// SHAP values of a single instance for a single output
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LocalExplanation {
    /// Instance index
    pub instance_index: usize,
    /// Expected model output in link space
    pub base_value: f64,
    /// Model output for the instance in link space
    pub prediction: f64,
    /// Feature contributions
    pub contributions: Vec<FeatureContribution>,
}

impl LocalExplanation {
    /// Sum of contributions
    pub fn sum_contributions(&self) -> f64 {
        self.contributions.iter().map(|c| c.contribution).sum()
    }

    /// Contributions by absolute value, descending
    pub fn sorted_contributions(&self) -> Vec<&FeatureContribution> {
        let mut sorted: Vec<&FeatureContribution> = self.contributions.iter().collect();
        sorted.sort_by(|a, b| {
            b.contribution
                .abs()
                .partial_cmp(&a.contribution.abs())
                .unwrap_or(std::cmp::Ordering::Equal)
        });
        sorted
    }

    /// Top `k` contributors
    pub fn top_k_contributors(&self, k: usize) -> Vec<&FeatureContribution> {
        self.sorted_contributions().into_iter().take(k).collect()
    }
}

/// SHAP values for a batch of instances
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ShapExplanation {
    /// Explanation metadata
    pub meta: ExplanationMeta,
    /// Link the values are expressed in
    pub link: Link,
    /// Expected output per model output, in link space
    pub expected_value: Vec<f64>,
    /// SHAP values indexed `[output][instance][feature]`
    pub shap_values: Vec<Vec<Vec<f64>>>,
    /// Model outputs indexed `[instance][output]`, before the link
    pub raw_prediction: Vec<Vec<f64>>,
    /// Explained instances
    pub data: Vec<Vec<f64>>,
    /// Feature names, when known
    pub feature_names: Option<Vec<String>>,
}

impl ShapExplanation {
    /// Number of model outputs
    pub fn n_outputs(&self) -> usize {
        self.shap_values.len()
    }

    /// SHAP values of one output
    pub fn output(&self, output: usize) -> Result<&[Vec<f64>]> {
        self.shap_values
            .get(output)
            .map(Vec::as_slice)
            .ok_or_else(|| {
                ExplainError::invalid_parameter(
                    "output",
                    output,
                    format!("explanation has {} outputs", self.shap_values.len()),
                )
            })
    }

    /// Per-feature view of one instance and output
    pub fn local(&self, instance: usize, output: usize) -> Result<LocalExplanation> {
        let values = self.output(output)?.get(instance).ok_or_else(|| {
            ExplainError::invalid_parameter(
                "instance",
                instance,
                format!("explanation has {} instances", self.data.len()),
            )
        })?;
        let contributions = values
            .iter()
            .enumerate()
            .map(|(idx, &contribution)| FeatureContribution {
                feature_index: idx,
                feature_name: self.feature_names.as_ref().and_then(|n| n.get(idx).cloned()),
                feature_value: self.data[instance][idx],
                contribution,
            })
            .collect();
        Ok(LocalExplanation {
            instance_index: instance,
            base_value: self.expected_value[output],
            prediction: self.link.apply(self.raw_prediction[instance][output]),
            contributions,
        })
    }

    /// Serialize to a JSON string
    pub fn to_json(&self) -> Result<String> {
        Ok(serde_json::to_string_pretty(self)?)
    }
}

/// Summary of SHAP values for one output across instances
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ShapSummary {
    /// Feature names
    pub feature_names: Option<Vec<String>>,
    /// Mean absolute SHAP values per feature
    pub mean_abs_shap: Vec<f64>,
    /// Mean SHAP values per feature
    pub mean_shap: Vec<f64>,
    /// Standard deviation of SHAP values per feature
    pub std_shap: Vec<f64>,
    /// Min SHAP values per feature
    pub min_shap: Vec<f64>,
    /// Max SHAP values per feature
    pub max_shap: Vec<f64>,
}

impl ShapSummary {
    /// Summarise one output of an explanation
    pub fn from_explanation(explanation: &ShapExplanation, output: usize) -> Result<Self> {
        let values = explanation.output(output)?;
        let n_features = values.first().map_or(0, Vec::len);
        let n_instances = values.len().max(1) as f64;

        let mut mean_abs = vec![0.0; n_features];
        let mut mean = vec![0.0; n_features];
        let mut min_vals = vec![f64::INFINITY; n_features];
        let mut max_vals = vec![f64::NEG_INFINITY; n_features];

        for row in values {
            for (j, &v) in row.iter().enumerate() {
                mean_abs[j] += v.abs();
                mean[j] += v;
                min_vals[j] = min_vals[j].min(v);
                max_vals[j] = max_vals[j].max(v);
            }
        }
        for j in 0..n_features {
            mean_abs[j] /= n_instances;
            mean[j] /= n_instances;
        }

        let mut sum_sq = vec![0.0; n_features];
        for row in values {
            for (j, &v) in row.iter().enumerate() {
                sum_sq[j] += (v - mean[j]).powi(2);
            }
        }

        Ok(Self {
            feature_names: explanation.feature_names.clone(),
            mean_abs_shap: mean_abs,
            mean_shap: mean,
            std_shap: sum_sq.into_iter().map(|s| (s / n_instances).sqrt()).collect(),
            min_shap: min_vals,
            max_shap: max_vals,
        })
    }

    /// Feature ranking by mean absolute SHAP
    pub fn feature_ranking(&self) -> Vec<(usize, f64)> {
        let mut indexed: Vec<(usize, f64)> =
            self.mean_abs_shap.iter().copied().enumerate().collect();
        indexed.sort_by(|a, b| b.1.partial_cmp(&a.1).unwrap_or(std::cmp::Ordering::Equal));
        indexed
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn explanation() -> ShapExplanation {
        ShapExplanation {
            meta: ExplanationMeta::local("KernelShap", &()),
            link: Link::Identity,
            expected_value: vec![1.0],
            shap_values: vec![vec![vec![2.0, -0.5, 0.0], vec![-1.0, 0.5, 0.25]]],
            raw_prediction: vec![vec![2.5], vec![0.75]],
            data: vec![vec![1.0, 2.0, 3.0], vec![0.0, 1.0, 2.0]],
            feature_names: Some(vec!["a".into(), "b".into(), "c".into()]),
        }
    }

    #[test]
    fn test_local_view() {
        let exp = explanation();
        let local = exp.local(0, 0).unwrap();
        assert_eq!(local.contributions[1].feature_name.as_deref(), Some("b"));
        assert!((local.base_value + local.sum_contributions() - local.prediction).abs() < 1e-12);

        let top = local.top_k_contributors(2);
        assert_eq!(top[0].feature_index, 0);
        assert_eq!(top[1].feature_index, 1);
        assert!(exp.local(5, 0).is_err());
        assert!(exp.local(0, 1).is_err());
    }

    #[test]
    fn test_summary_ranking() {
        let summary = ShapSummary::from_explanation(&explanation(), 0).unwrap();
        assert_eq!(summary.mean_abs_shap, vec![1.5, 0.5, 0.125]);
        assert_eq!(summary.min_shap[0], -1.0);
        assert_eq!(summary.max_shap[0], 2.0);
        let ranking: Vec<usize> = summary.feature_ranking().iter().map(|r| r.0).collect();
        assert_eq!(ranking, vec![0, 1, 2]);
    }

    #[test]
    fn test_logit_link() {
        assert_eq!(Link::Logit.apply(0.5), 0.0);
        assert!((Link::Logit.apply(0.75) - 3.0_f64.ln()).abs() < 1e-12);
    }
}
