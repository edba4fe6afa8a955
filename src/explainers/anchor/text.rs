//! Anchors for text classifiers

use super::beam::{AnchorBaseBeam, AnchorSampler, SampleBatch};
use super::{AnchorConfig, AnchorExplanation};
use crate::error::{ExplainError, Result};
use crate::explainers::explanation::ExplanationMeta;
use ndarray::Array2;
use rand::prelude::*;
use rand_xoshiro::Xoshiro256PlusPlus;
use serde::{Deserialize, Serialize};

/// How non-anchored words are perturbed
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum SamplingStrategy {
    /// Replace the word with the unknown token
    Unknown,
    /// Remove the word
    Delete,
}

#[derive(Debug, Clone, Serialize)]
struct TextParams<'a> {
    #[serde(flatten)]
    config: &'a AnchorConfig,
    strategy: SamplingStrategy,
    sample_proba: f64,
    unk_token: &'a str,
}

/// Anchor explainer for text
pub struct AnchorText<F>
where
    F: Fn(&[String]) -> Result<Vec<usize>>,
{
    /// Classifier returning one label per text
    predict_fn: F,
    strategy: SamplingStrategy,
    /// Probability of perturbing each non-anchored word
    sample_proba: f64,
    unk_token: String,
    config: AnchorConfig,
}

impl<F> AnchorText<F>
where
    F: Fn(&[String]) -> Result<Vec<usize>>,
{
    /// Create a new text anchor explainer
    pub fn new(predict_fn: F) -> Self {
        Self {
            predict_fn,
            strategy: SamplingStrategy::Unknown,
            sample_proba: 0.5,
            unk_token: "UNK".to_string(),
            config: AnchorConfig::default(),
        }
    }

    /// Set the perturbation strategy
    pub fn with_strategy(mut self, strategy: SamplingStrategy) -> Self {
        self.strategy = strategy;
        self
    }

    /// Set the probability of perturbing a word
    pub fn with_sample_proba(mut self, p: f64) -> Self {
        self.sample_proba = p.clamp(0.0, 1.0);
        self
    }

    /// Set the unknown token
    pub fn with_unk_token(mut self, token: impl Into<String>) -> Self {
        self.unk_token = token.into();
        self
    }

    /// Set search configuration
    pub fn with_config(mut self, config: AnchorConfig) -> Self {
        self.config = config;
        self
    }

    /// Explain the prediction for a single text
    pub fn explain(&self, text: &str) -> Result<AnchorExplanation> {
        let words: Vec<String> = text.split_whitespace().map(str::to_string).collect();
        if words.is_empty() {
            return Err(ExplainError::DataError("text has no words".to_string()));
        }

        let label = *(self.predict_fn)(&[text.to_string()])?
            .first()
            .ok_or_else(|| ExplainError::PredictionError("empty prediction".to_string()))?;

        let sampler = TextSampler {
            predict_fn: &self.predict_fn,
            words: &words,
            label,
            strategy: self.strategy,
            sample_proba: self.sample_proba,
            unk_token: &self.unk_token,
        };
        let result = AnchorBaseBeam::new(&sampler, self.config.clone())?.search()?;

        let params = TextParams {
            config: &self.config,
            strategy: self.strategy,
            sample_proba: self.sample_proba,
            unk_token: &self.unk_token,
        };
        let meta = ExplanationMeta::local("AnchorText", &params);
        Ok(AnchorExplanation::from_beam(meta, result, &words, label))
    }
}

struct TextSampler<'a, F> {
    predict_fn: &'a F,
    words: &'a [String],
    label: usize,
    strategy: SamplingStrategy,
    sample_proba: f64,
    unk_token: &'a str,
}

impl<'a, F> AnchorSampler for TextSampler<'a, F>
where
    F: Fn(&[String]) -> Result<Vec<usize>>,
{
    fn n_predicates(&self) -> usize {
        self.words.len()
    }

    fn sample(
        &self,
        anchor: &[usize],
        n: usize,
        compute_labels: bool,
        rng: &mut Xoshiro256PlusPlus,
    ) -> Result<SampleBatch> {
        let d = self.words.len();
        let mut satisfied = Array2::from_elem((n, d), true);
        for i in 0..n {
            for w in 0..d {
                if !anchor.contains(&w) && rng.gen_bool(self.sample_proba) {
                    satisfied[[i, w]] = false;
                }
            }
        }
        if !compute_labels {
            return Ok(SampleBatch {
                satisfied,
                labels_match: Vec::new(),
            });
        }

        let texts: Vec<String> = satisfied
            .rows()
            .into_iter()
            .map(|row| {
                let tokens: Vec<&str> = self
                    .words
                    .iter()
                    .zip(row.iter())
                    .filter_map(|(word, &kept)| match (kept, self.strategy) {
                        (true, _) => Some(word.as_str()),
                        (false, SamplingStrategy::Unknown) => Some(self.unk_token),
                        (false, SamplingStrategy::Delete) => None,
                    })
                    .collect();
                tokens.join(" ")
            })
            .collect();

        let labels = (self.predict_fn)(&texts)?;
        if labels.len() != n {
            return Err(ExplainError::shape(
                format!("{} labels", n),
                format!("{} labels", labels.len()),
            ));
        }
        let labels_match = labels.iter().map(|&l| l == self.label).collect();

        Ok(SampleBatch {
            satisfied,
            labels_match,
        })
    }
}
