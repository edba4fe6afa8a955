//! Counterfactuals guided by class prototypes (Van Looveren & Klaise, 2019)
//!
//! Prototypes are the mean of the `k` training instances of a class that lie
//! closest to the explained instance. The search minimises
//! `c * L_pred + beta * |delta|_1 + |delta|_2^2 + theta * |x' - proto|_2^2`
//! with FISTA, bisecting on `c`.

use super::counterfactual::CfInstance;
use super::explanation::ExplanationMeta;
use super::optim::{
    argmax, clip, elastic_net, max_other, numerical_gradient, predict_one, shrink, WeightSearch,
};
use crate::error::{ExplainError, Result};
use ndarray::{Array1, Array2, ArrayView1, Axis};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use tracing::{debug, info};

/// Configuration for prototype-guided counterfactuals
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct CounterfactualProtoConfig {
    /// Confidence margin required over the original class
    pub kappa: f64,
    /// Weight of the L1 term
    pub beta: f64,
    /// Weight of the prototype term
    pub theta: f64,
    /// Initial weight of the prediction loss
    pub c_init: f64,
    /// Number of `c` values tried
    pub c_steps: usize,
    /// FISTA iterations per `c`
    pub max_iter: usize,
    /// Step size
    pub learning_rate: f64,
    /// Number of nearest class members averaged into a prototype
    pub k: usize,
    /// Finite-difference step for gradients
    pub eps: f64,
    /// Allowed (min, max) for every feature
    pub feature_range: (f64, f64),
    /// Restrict the counterfactual to a class
    pub target_class: Option<usize>,
}

impl Default for CounterfactualProtoConfig {
    fn default() -> Self {
        Self {
            kappa: 0.0,
            beta: 0.1,
            theta: 10.0,
            c_init: 1.0,
            c_steps: 5,
            max_iter: 500,
            learning_rate: 0.01,
            k: 5,
            eps: 0.01,
            feature_range: (-1e10, 1e10),
            target_class: None,
        }
    }
}

impl CounterfactualProtoConfig {
    /// Create a new configuration
    pub fn new() -> Self {
        Self::default()
    }

    /// Set prototype weight
    pub fn with_theta(mut self, theta: f64) -> Self {
        self.theta = theta;
        self
    }

    /// Set L1 weight
    pub fn with_beta(mut self, beta: f64) -> Self {
        self.beta = beta;
        self
    }

    /// Set number of neighbours per prototype
    pub fn with_k(mut self, k: usize) -> Self {
        self.k = k.max(1);
        self
    }

    /// Set FISTA iterations per `c`
    pub fn with_max_iter(mut self, n: usize) -> Self {
        self.max_iter = n;
        self
    }

    /// Restrict to a target class
    pub fn with_target_class(mut self, class: usize) -> Self {
        self.target_class = Some(class);
        self
    }

    /// Set feature range
    pub fn with_feature_range(mut self, min: f64, max: f64) -> Self {
        self.feature_range = (min, max);
        self
    }

    /// Validate parameter ranges
    pub fn validate(&self) -> Result<()> {
        if self.beta < 0.0 || self.theta < 0.0 || self.kappa < 0.0 {
            return Err(ExplainError::ConfigError(
                "beta, theta and kappa must be non-negative".to_string(),
            ));
        }
        if self.c_init <= 0.0 || self.learning_rate <= 0.0 || self.eps <= 0.0 {
            return Err(ExplainError::ConfigError(
                "c_init, learning_rate and eps must be positive".to_string(),
            ));
        }
        if self.feature_range.0 > self.feature_range.1 {
            return Err(ExplainError::invalid_parameter(
                "feature_range",
                format!("{:?}", self.feature_range),
                "min must not exceed max",
            ));
        }
        Ok(())
    }
}

/// Result of a prototype-guided counterfactual search
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CounterfactualProtoExplanation {
    /// Explanation metadata
    pub meta: ExplanationMeta,
    /// Class predicted for the original instance
    pub orig_class: usize,
    /// Probabilities for the original instance
    pub orig_proba: Vec<f64>,
    /// Class whose prototype guided the search
    pub proto_class: usize,
    /// The guiding prototype
    pub prototype: Vec<f64>,
    /// Closest valid counterfactual, if any
    pub cf: Option<CfInstance>,
}

impl CounterfactualProtoExplanation {
    /// Serialize to a JSON string
    pub fn to_json(&self) -> Result<String> {
        Ok(serde_json::to_string_pretty(self)?)
    }
}

/// Prototype-guided counterfactual explainer
pub struct CounterFactualProto<F>
where
    F: Fn(&Array2<f64>) -> Result<Array2<f64>>,
{
    /// Classifier returning class probabilities (n_samples, n_classes)
    predict_fn: F,
    config: CounterfactualProtoConfig,
    /// Training rows grouped by predicted class
    class_members: Option<BTreeMap<usize, Array2<f64>>>,
}

impl<F> CounterFactualProto<F>
where
    F: Fn(&Array2<f64>) -> Result<Array2<f64>>,
{
    /// Create a new explainer
    pub fn new(predict_fn: F) -> Self {
        Self {
            predict_fn,
            config: CounterfactualProtoConfig::default(),
            class_members: None,
        }
    }

    /// Set configuration
    pub fn with_config(mut self, config: CounterfactualProtoConfig) -> Self {
        self.config = config;
        self
    }

    /// Group the training data by predicted class
    pub fn fit(&mut self, train: &Array2<f64>) -> Result<&mut Self> {
        if train.nrows() == 0 {
            return Err(ExplainError::DataError("training data is empty".to_string()));
        }
        let proba = (self.predict_fn)(train)?;
        if proba.nrows() != train.nrows() {
            return Err(ExplainError::shape(
                format!("{} prediction rows", train.nrows()),
                format!("{} rows", proba.nrows()),
            ));
        }

        let mut groups: BTreeMap<usize, Vec<usize>> = BTreeMap::new();
        for (i, row) in proba.rows().into_iter().enumerate() {
            groups.entry(argmax(row)).or_default().push(i);
        }
        let members = groups
            .into_iter()
            .map(|(class, idx)| (class, train.select(Axis(0), &idx)))
            .collect::<BTreeMap<_, _>>();

        info!(
            n_samples = train.nrows(),
            n_classes = members.len(),
            "Fitted prototype counterfactual explainer"
        );
        self.class_members = Some(members);
        Ok(self)
    }

    /// Mean of the `k` members of `class` nearest to `x`
    fn prototype(&self, members: &Array2<f64>, x: &Array1<f64>) -> Array1<f64> {
        let mut dists: Vec<(usize, f64)> = members
            .rows()
            .into_iter()
            .enumerate()
            .map(|(i, row)| (i, (&row - x).mapv(|v| v * v).sum()))
            .collect();
        dists.sort_by(|a, b| a.1.partial_cmp(&b.1).unwrap_or(std::cmp::Ordering::Equal));
        let idx: Vec<usize> = dists.iter().take(self.config.k).map(|(i, _)| *i).collect();
        members
            .select(Axis(0), &idx)
            .mean_axis(Axis(0))
            .unwrap_or_else(|| x.clone())
    }

    /// Search for a counterfactual of `x`
    pub fn explain(&self, x: &Array1<f64>) -> Result<CounterfactualProtoExplanation> {
        self.config.validate()?;
        let members = self.class_members.as_ref().ok_or(ExplainError::NotFitted)?;
        let d = x.len();
        if let Some(first) = members.values().next() {
            if first.ncols() != d {
                return Err(ExplainError::shape(
                    format!("{} features", first.ncols()),
                    format!("{} features", d),
                ));
            }
        }

        let orig_proba = predict_one(&self.predict_fn, x)?;
        let orig_class = argmax(orig_proba.view());

        // Nearest prototype among the admissible classes
        let (proto_class, prototype) = members
            .iter()
            .filter(|(&class, _)| class != orig_class)
            .filter(|(&class, _)| self.config.target_class.map_or(true, |t| t == class))
            .map(|(&class, rows)| {
                let proto = self.prototype(rows, x);
                let dist = (&proto - x).mapv(|v| v * v).sum();
                (class, proto, dist)
            })
            .min_by(|a, b| a.2.partial_cmp(&b.2).unwrap_or(std::cmp::Ordering::Equal))
            .map(|(class, proto, _)| (class, proto))
            .ok_or_else(|| {
                ExplainError::DataError(
                    "no training instances predicted as a counterfactual class".to_string(),
                )
            })?;
        debug!(proto_class, "Selected prototype");

        let kappa = self.config.kappa;
        let attack = move |p: ArrayView1<f64>| -> f64 {
            (p[orig_class] - max_other(p, orig_class).1 + kappa).max(0.0)
        };

        let mut search = WeightSearch::new(self.config.c_init, 10.0);
        let mut best: Option<CfInstance> = None;

        for step in 0..self.config.c_steps {
            let c = search.value;
            let mut x_k = x.clone();
            let mut y = x.clone();
            let mut found = false;

            for k in 0..self.config.max_iter {
                let grad_attack = numerical_gradient(&self.predict_fn, &y, self.config.eps, &attack)?;
                let grad = grad_attack * c
                    + (&y - x) * 2.0
                    + (&y - &prototype) * (2.0 * self.config.theta);
                let z = &y - &(grad * self.config.learning_rate);
                let mut x_next = shrink(&z, x, self.config.beta * self.config.learning_rate);
                clip(&mut x_next, self.config.feature_range);

                let momentum = k as f64 / (k as f64 + 3.0);
                y = &x_next + &((&x_next - &x_k) * momentum);
                clip(&mut y, self.config.feature_range);
                x_k = x_next;

                let proba = predict_one(&self.predict_fn, &x_k)?;
                let class = argmax(proba.view());
                let valid = class != orig_class
                    && self.config.target_class.map_or(true, |t| t == class)
                    && proba[class] - proba[orig_class] >= kappa;
                if valid {
                    found = true;
                    let distance = elastic_net(&(&x_k - x), self.config.beta);
                    if best.as_ref().map_or(true, |b| distance < b.distance) {
                        best = Some(CfInstance {
                            x: x_k.to_vec(),
                            class,
                            proba: proba.to_vec(),
                            distance,
                            lambda: c,
                        });
                    }
                }
            }

            debug!(step, c, found, "Prototype counterfactual c step");
            search.update(found);
        }

        Ok(CounterfactualProtoExplanation {
            meta: ExplanationMeta::local("CounterFactualProto", &self.config),
            orig_class,
            orig_proba: orig_proba.to_vec(),
            proto_class,
            prototype: prototype.to_vec(),
            cf: best,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn logistic(x: &Array2<f64>) -> Result<Array2<f64>> {
        let mut out = Array2::zeros((x.nrows(), 2));
        for (i, row) in x.rows().into_iter().enumerate() {
            let p = 1.0 / (1.0 + (-4.0 * (row[0] + row[1] - 1.0)).exp());
            out[[i, 0]] = 1.0 - p;
            out[[i, 1]] = p;
        }
        Ok(out)
    }

    fn grid() -> Array2<f64> {
        let mut rows = Vec::new();
        for i in 0..9 {
            for j in 0..9 {
                rows.push(i as f64 * 0.25);
                rows.push(j as f64 * 0.25);
            }
        }
        Array2::from_shape_vec((81, 2), rows).unwrap()
    }

    #[test]
    fn test_requires_fit() {
        let explainer = CounterFactualProto::new(logistic);
        assert!(matches!(
            explainer.explain(&ndarray::array![0.2, 0.2]),
            Err(ExplainError::NotFitted)
        ));
    }

    #[test]
    fn test_prototype_guides_counterfactual() {
        let mut explainer = CounterFactualProto::new(logistic)
            .with_config(CounterfactualProtoConfig::new().with_max_iter(200));
        explainer.fit(&grid()).unwrap();

        let x = ndarray::array![0.2, 0.2];
        let exp = explainer.explain(&x).unwrap();
        assert_eq!(exp.orig_class, 0);
        assert_eq!(exp.proto_class, 1);
        assert!(exp.prototype[0] + exp.prototype[1] > 1.0);

        let cf = exp.cf.expect("counterfactual should be found");
        assert_eq!(cf.class, 1);
        assert!(cf.x[0] + cf.x[1] > 1.0);
    }

    #[test]
    fn test_prototype_is_mean_of_nearest() {
        let mut explainer =
            CounterFactualProto::new(logistic).with_config(CounterfactualProtoConfig::new().with_k(2));
        explainer.fit(&grid()).unwrap();
        let members = explainer.class_members.as_ref().unwrap();
        let proto = explainer.prototype(&members[&1], &ndarray::array![0.2, 0.2]);
        // Two nearest class-1 points are (0.5, 0.75) and (0.75, 0.5)
        assert!((proto[0] - 0.625).abs() < 1e-12);
        assert!((proto[1] - 0.625).abs() < 1e-12);
    }
}
