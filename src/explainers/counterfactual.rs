//! Counterfactual instances (Wachter et al., 2017)
//!
//! Finds a nearby instance `x'` whose prediction reaches a target class
//! probability by minimising
//! `lambda * (p_t(x') - target_proba)^2 + sum_i |x'_i - x_i| / mad_i`
//! against a black-box classifier.

use super::explanation::ExplanationMeta;
use super::optim::{argmax, clip, max_other, numerical_gradient, predict_one, Adam, WeightSearch};
use crate::error::{ExplainError, Result};
use ndarray::{Array1, Array2, ArrayView1};
use serde::{Deserialize, Serialize};
use tracing::debug;

/// Class a counterfactual should be predicted as
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum Target {
    /// Any class other than the original prediction
    Other,
    /// A specific class
    Class(usize),
}

/// Configuration for counterfactual search
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct CounterfactualConfig {
    /// Desired probability of the target class
    pub target_proba: f64,
    /// Target class
    pub target_class: Target,
    /// Accepted deviation from `target_proba`
    pub tol: f64,
    /// Initial weight of the prediction loss
    pub lam_init: f64,
    /// Number of lambda values tried
    pub max_lam_steps: usize,
    /// Optimizer iterations per lambda
    pub max_iter: usize,
    /// Adam learning rate
    pub learning_rate: f64,
    /// Finite-difference step for gradients
    pub eps: f64,
    /// Allowed (min, max) for every feature
    pub feature_range: (f64, f64),
    /// Iterations without improvement before stopping, once a counterfactual exists
    pub early_stop: usize,
    /// Per-feature scale for the L1 distance (median absolute deviation)
    pub mad: Option<Vec<f64>>,
}

impl Default for CounterfactualConfig {
    fn default() -> Self {
        Self {
            target_proba: 1.0,
            target_class: Target::Other,
            tol: 0.05,
            lam_init: 0.1,
            max_lam_steps: 10,
            max_iter: 1000,
            learning_rate: 0.1,
            eps: 0.01,
            feature_range: (-1e10, 1e10),
            early_stop: 50,
            mad: None,
        }
    }
}

impl CounterfactualConfig {
    /// Create a new counterfactual configuration
    pub fn new() -> Self {
        Self::default()
    }

    /// Set target probability and tolerance
    pub fn with_target_proba(mut self, proba: f64, tol: f64) -> Self {
        self.target_proba = proba;
        self.tol = tol;
        self
    }

    /// Set target class
    pub fn with_target_class(mut self, target: Target) -> Self {
        self.target_class = target;
        self
    }

    /// Set initial lambda
    pub fn with_lam_init(mut self, lam: f64) -> Self {
        self.lam_init = lam;
        self
    }

    /// Set optimizer iterations per lambda
    pub fn with_max_iter(mut self, n: usize) -> Self {
        self.max_iter = n;
        self
    }

    /// Set feature range
    pub fn with_feature_range(mut self, min: f64, max: f64) -> Self {
        self.feature_range = (min, max);
        self
    }

    /// Set per-feature distance scales
    pub fn with_mad(mut self, mad: Vec<f64>) -> Self {
        self.mad = Some(mad);
        self
    }

    /// Validate parameter ranges
    pub fn validate(&self) -> Result<()> {
        if !(0.0..=1.0).contains(&self.target_proba) {
            return Err(ExplainError::invalid_parameter(
                "target_proba",
                self.target_proba,
                "must be in [0, 1]",
            ));
        }
        if self.lam_init <= 0.0 || self.learning_rate <= 0.0 || self.eps <= 0.0 {
            return Err(ExplainError::ConfigError(
                "lam_init, learning_rate and eps must be positive".to_string(),
            ));
        }
        if self.feature_range.0 > self.feature_range.1 {
            return Err(ExplainError::invalid_parameter(
                "feature_range",
                format!("{:?}", self.feature_range),
                "min must not exceed max",
            ));
        }
        if let Some(mad) = &self.mad {
            if mad.iter().any(|&m| m <= 0.0) {
                return Err(ExplainError::invalid_parameter(
                    "mad",
                    format!("{:?}", mad),
                    "all scales must be positive",
                ));
            }
        }
        Ok(())
    }
}

/// A counterfactual instance
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CfInstance {
    /// Feature values
    pub x: Vec<f64>,
    /// Predicted class
    pub class: usize,
    /// Predicted class probabilities
    pub proba: Vec<f64>,
    /// Distance to the original instance
    pub distance: f64,
    /// Loss weight the instance was found with
    pub lambda: f64,
}

/// Result of a counterfactual search
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CounterfactualExplanation {
    /// Explanation metadata
    pub meta: ExplanationMeta,
    /// Class predicted for the original instance
    pub orig_class: usize,
    /// Probabilities for the original instance
    pub orig_proba: Vec<f64>,
    /// Closest valid counterfactual, if any
    pub cf: Option<CfInstance>,
    /// Number of valid candidates seen during the search
    pub n_valid: usize,
}

impl CounterfactualExplanation {
    /// Per-feature change from the original instance
    pub fn delta(&self, x: &Array1<f64>) -> Option<Vec<f64>> {
        self.cf
            .as_ref()
            .map(|cf| cf.x.iter().zip(x.iter()).map(|(c, o)| c - o).collect())
    }

    /// Serialize to a JSON string
    pub fn to_json(&self) -> Result<String> {
        Ok(serde_json::to_string_pretty(self)?)
    }
}

/// Counterfactual explainer for black-box classifiers
pub struct CounterFactual<F>
where
    F: Fn(&Array2<f64>) -> Result<Array2<f64>>,
{
    /// Classifier returning class probabilities (n_samples, n_classes)
    predict_fn: F,
    config: CounterfactualConfig,
}

impl<F> CounterFactual<F>
where
    F: Fn(&Array2<f64>) -> Result<Array2<f64>>,
{
    /// Create a new counterfactual explainer
    pub fn new(predict_fn: F) -> Self {
        Self {
            predict_fn,
            config: CounterfactualConfig::default(),
        }
    }

    /// Set configuration
    pub fn with_config(mut self, config: CounterfactualConfig) -> Self {
        self.config = config;
        self
    }

    /// Search for a counterfactual of `x`
    pub fn explain(&self, x: &Array1<f64>) -> Result<CounterfactualExplanation> {
        self.config.validate()?;
        let d = x.len();
        let mad = match &self.config.mad {
            Some(m) if m.len() != d => {
                return Err(ExplainError::shape(
                    format!("{} MAD values", d),
                    format!("{}", m.len()),
                ))
            }
            Some(m) => Array1::from_vec(m.clone()),
            None => Array1::ones(d),
        };

        let orig_proba = predict_one(&self.predict_fn, x)?;
        let orig_class = argmax(orig_proba.view());
        if let Target::Class(k) = self.config.target_class {
            if k >= orig_proba.len() {
                return Err(ExplainError::invalid_parameter(
                    "target_class",
                    k,
                    format!("model has {} classes", orig_proba.len()),
                ));
            }
        }

        let target = self.config.target_class;
        let target_proba = self.config.target_proba;
        let target_of = move |p: ArrayView1<f64>| -> (usize, f64) {
            match target {
                Target::Class(k) => (k, p[k]),
                Target::Other => max_other(p, orig_class),
            }
        };

        let mut search = WeightSearch::new(self.config.lam_init, 10.0);
        let mut best: Option<CfInstance> = None;
        let mut n_valid = 0;

        for step in 0..self.config.max_lam_steps {
            let lam = search.value;
            let mut xp = x.clone();
            let mut adam = Adam::new(d, self.config.learning_rate);
            let mut found = false;
            let mut since_improvement = 0;

            for _ in 0..self.config.max_iter {
                let grad_pred = numerical_gradient(&self.predict_fn, &xp, self.config.eps, |p| {
                    (target_of(p).1 - target_proba).powi(2)
                })?;
                let grad_dist = (&xp - x).mapv(sign) / &mad;
                let grad = grad_pred * lam + grad_dist;
                adam.step(&mut xp, &grad);
                clip(&mut xp, self.config.feature_range);

                let proba = predict_one(&self.predict_fn, &xp)?;
                let class = argmax(proba.view());
                let (target_class, p_target) = target_of(proba.view());
                let valid =
                    class == target_class && (p_target - target_proba).abs() <= self.config.tol;

                since_improvement += 1;
                if valid {
                    n_valid += 1;
                    found = true;
                    let distance = ((&xp - x).mapv(f64::abs) / &mad).sum();
                    if best.as_ref().map_or(true, |b| distance < b.distance) {
                        best = Some(CfInstance {
                            x: xp.to_vec(),
                            class,
                            proba: proba.to_vec(),
                            distance,
                            lambda: lam,
                        });
                        since_improvement = 0;
                    }
                }
                if found && since_improvement >= self.config.early_stop {
                    break;
                }
            }

            debug!(step, lambda = lam, found, "Counterfactual lambda step");
            search.update(found);
        }

        Ok(CounterfactualExplanation {
            meta: ExplanationMeta::local("CounterFactual", &self.config),
            orig_class,
            orig_proba: orig_proba.to_vec(),
            cf: best,
            n_valid,
        })
    }
}

/// Sign with `sign(0) = 0`
pub(crate) fn sign(v: f64) -> f64 {
    if v > 0.0 {
        1.0
    } else if v < 0.0 {
        -1.0
    } else {
        0.0
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use ndarray::array;

    // Binary logistic model on x0 + x1
    pub(crate) fn logistic(x: &Array2<f64>) -> Result<Array2<f64>> {
        let mut out = Array2::zeros((x.nrows(), 2));
        for (i, row) in x.rows().into_iter().enumerate() {
            let p = 1.0 / (1.0 + (-2.0 * (row[0] + row[1] - 1.0)).exp());
            out[[i, 0]] = 1.0 - p;
            out[[i, 1]] = p;
        }
        Ok(out)
    }

    #[test]
    fn test_counterfactual_flips_class() {
        let config = CounterfactualConfig::new()
            .with_target_proba(0.9, 0.1)
            .with_lam_init(1.0)
            .with_max_iter(300);
        let explainer = CounterFactual::new(logistic).with_config(config);

        let x = array![0.0, 0.0];
        let exp = explainer.explain(&x).unwrap();
        assert_eq!(exp.orig_class, 0);

        let cf = exp.cf.expect("counterfactual should be found");
        assert_eq!(cf.class, 1);
        assert!(cf.proba[1] >= 0.8 - 1e-9);
        assert!(cf.x[0] + cf.x[1] > 1.0);
        assert!(exp.n_valid > 0);
    }

    #[test]
    fn test_counterfactual_same_class_target() {
        // Push the original class to a higher confidence
        let config = CounterfactualConfig::new()
            .with_target_class(Target::Class(0))
            .with_target_proba(0.97, 0.02)
            .with_lam_init(1000.0)
            .with_max_iter(500);
        let explainer = CounterFactual::new(logistic).with_config(config);

        let exp = explainer.explain(&array![0.0, 0.0]).unwrap();
        assert_eq!(exp.orig_class, 0);
        let cf = exp.cf.expect("counterfactual should be found");
        assert_eq!(cf.class, 0);
        assert!((cf.proba[0] - 0.97).abs() <= 0.02 + 1e-9);
        assert!(cf.x[0] + cf.x[1] < 0.0);
    }

    #[test]
    fn test_counterfactual_specific_class_out_of_range() {
        let config = CounterfactualConfig::new().with_target_class(Target::Class(5));
        let explainer = CounterFactual::new(logistic).with_config(config);
        assert!(explainer.explain(&array![0.0, 0.0]).is_err());
    }

    #[test]
    fn test_mad_length_checked() {
        let config = CounterfactualConfig::new().with_mad(vec![1.0]);
        let explainer = CounterFactual::new(logistic).with_config(config);
        assert!(matches!(
            explainer.explain(&array![0.0, 0.0]),
            Err(ExplainError::ShapeError { .. })
        ));
    }

    #[test]
    fn test_sign() {
        assert_eq!(sign(2.0), 1.0);
        assert_eq!(sign(-0.5), -1.0);
        assert_eq!(sign(0.0), 0.0);
    }
}
