//! Integrated gradients (Sundararajan et al., 2017)
//!
//! Attributions are `(x - baseline) * integral_0^1 grad f(baseline + a (x - baseline)) da`,
//! approximated with a Riemann sum or Gauss-Legendre quadrature.

use super::explanation::ExplanationMeta;
use super::optim::argmax;
use crate::error::{ExplainError, Result};
use ndarray::{concatenate, s, Array1, Array2, Axis};
use rayon::prelude::*;
use serde::{Deserialize, Serialize};
use tracing::debug;

/// Quadrature used along the integration path
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum IntegrationMethod {
    /// Gauss-Legendre nodes on `[0, 1]`
    GaussLegendre,
    /// Left Riemann sum
    RiemannLeft,
    /// Right Riemann sum
    RiemannRight,
    /// Midpoint Riemann sum
    RiemannMiddle,
    /// Trapezoidal rule
    RiemannTrapezoid,
}

/// Reference input the path starts from
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub enum BaselineType {
    /// All zeros
    Zeros,
    /// Same value for every feature
    Constant(f64),
    /// Column means of the background data
    Mean,
    /// Explicit baseline, one value per feature
    Custom(Vec<f64>),
}

/// Which model output is attributed
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum TargetSelection {
    /// A fixed output column
    Fixed(usize),
    /// The arg-max output for each instance
    Predicted,
}

/// Configuration for integrated gradients
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct IntegratedGradientsConfig {
    /// Number of points on the path
    pub n_steps: usize,
    /// Quadrature rule
    pub method: IntegrationMethod,
    /// Path start
    pub baseline: BaselineType,
    /// Maximum rows sent to the model at once
    pub internal_batch_size: usize,
    /// Finite-difference step when no gradient function is given
    pub eps: f64,
}

impl Default for IntegratedGradientsConfig {
    fn default() -> Self {
        Self {
            n_steps: 50,
            method: IntegrationMethod::GaussLegendre,
            baseline: BaselineType::Zeros,
            internal_batch_size: 100,
            eps: 1e-4,
        }
    }
}

impl IntegratedGradientsConfig {
    /// Create a new configuration
    pub fn new() -> Self {
        Self::default()
    }

    /// Set number of path points
    pub fn with_n_steps(mut self, n: usize) -> Self {
        self.n_steps = n;
        self
    }

    /// Set quadrature rule
    pub fn with_method(mut self, method: IntegrationMethod) -> Self {
        self.method = method;
        self
    }

    /// Set baseline
    pub fn with_baseline(mut self, baseline: BaselineType) -> Self {
        self.baseline = baseline;
        self
    }

    /// Set internal batch size
    pub fn with_internal_batch_size(mut self, size: usize) -> Self {
        self.internal_batch_size = size;
        self
    }

    /// Validate parameter ranges
    pub fn validate(&self) -> Result<()> {
        if self.n_steps < 2 {
            return Err(ExplainError::invalid_parameter(
                "n_steps",
                self.n_steps,
                "at least 2 path points are required",
            ));
        }
        if self.internal_batch_size == 0 {
            return Err(ExplainError::invalid_parameter(
                "internal_batch_size",
                0,
                "must be positive",
            ));
        }
        if self.eps <= 0.0 {
            return Err(ExplainError::invalid_parameter("eps", self.eps, "must be positive"));
        }
        Ok(())
    }
}

/// Attributions for a batch of instances
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct IntegratedGradientsExplanation {
    /// Explanation metadata
    pub meta: ExplanationMeta,
    /// Per-instance, per-feature attributions
    pub attributions: Vec<Vec<f64>>,
    /// Baseline used for each instance
    pub baselines: Vec<Vec<f64>>,
    /// Attributed output column per instance
    pub targets: Vec<usize>,
    /// Model output at the instance for the target
    pub predictions: Vec<f64>,
    /// `sum(attributions) - (f(x) - f(baseline))` per instance
    pub deltas: Vec<f64>,
    /// Feature names, when known
    pub feature_names: Option<Vec<String>>,
}

impl IntegratedGradientsExplanation {
    /// Attributions of one instance
    pub fn attribution(&self, instance: usize) -> Option<&[f64]> {
        self.attributions.get(instance).map(Vec::as_slice)
    }

    /// Largest completeness violation
    pub fn max_abs_delta(&self) -> f64 {
        self.deltas.iter().fold(0.0, |m, d| m.max(d.abs()))
    }

    /// Serialize to a JSON string
    pub fn to_json(&self) -> Result<String> {
        Ok(serde_json::to_string_pretty(self)?)
    }
}

type GradientFn = Box<dyn Fn(&Array2<f64>, usize) -> Result<Array2<f64>> + Send + Sync>;

/// Integrated gradients explainer
pub struct IntegratedGradients<F>
where
    F: Fn(&Array2<f64>) -> Result<Array2<f64>> + Sync,
{
    /// Model returning outputs (n_samples, n_outputs)
    predict_fn: F,
    /// Analytic gradients of one output w.r.t. the inputs
    gradient_fn: Option<GradientFn>,
    background: Option<Array2<f64>>,
    feature_names: Option<Vec<String>>,
    config: IntegratedGradientsConfig,
}

impl<F> IntegratedGradients<F>
where
    F: Fn(&Array2<f64>) -> Result<Array2<f64>> + Sync,
{
    /// Create a new explainer; gradients are estimated numerically
    pub fn new(predict_fn: F) -> Self {
        Self {
            predict_fn,
            gradient_fn: None,
            background: None,
            feature_names: None,
            config: IntegratedGradientsConfig::default(),
        }
    }

    /// Supply gradients `(points, target) -> d output[target] / d points`
    pub fn with_gradient_fn<G>(mut self, gradient_fn: G) -> Self
    where
        G: Fn(&Array2<f64>, usize) -> Result<Array2<f64>> + Send + Sync + 'static,
    {
        self.gradient_fn = Some(Box::new(gradient_fn));
        self
    }

    /// Background data for the mean baseline
    pub fn with_background(mut self, background: Array2<f64>) -> Self {
        self.background = Some(background);
        self
    }

    /// Set feature names
    pub fn with_feature_names(mut self, names: Vec<String>) -> Self {
        self.feature_names = Some(names);
        self
    }

    /// Set configuration
    pub fn with_config(mut self, config: IntegratedGradientsConfig) -> Self {
        self.config = config;
        self
    }

    /// Attribute the `target` output of every row of `x`
    pub fn explain(
        &self,
        x: &Array2<f64>,
        target: TargetSelection,
    ) -> Result<IntegratedGradientsExplanation> {
        self.config.validate()?;
        if x.nrows() == 0 {
            return Err(ExplainError::DataError("no instances to explain".to_string()));
        }
        let d = x.ncols();
        let baseline = self.baseline(d)?;
        let (alphas, weights) = path_nodes(self.config.method, self.config.n_steps);

        let outputs = self.predict_batched(x)?;
        let baseline_out = self.predict_batched(&baseline.clone().insert_axis(Axis(0)))?;
        let targets = (0..x.nrows())
            .map(|i| match target {
                TargetSelection::Fixed(t) if t < outputs.ncols() => Ok(t),
                TargetSelection::Fixed(t) => Err(ExplainError::invalid_parameter(
                    "target",
                    t,
                    format!("model has {} outputs", outputs.ncols()),
                )),
                TargetSelection::Predicted => Ok(argmax(outputs.row(i))),
            })
            .collect::<Result<Vec<_>>>()?;

        let attributions = (0..x.nrows())
            .into_par_iter()
            .map(|i| {
                let t = targets[i];
                let diff = &x.row(i) - &baseline;
                let path = Array2::from_shape_fn((alphas.len(), d), |(k, j)| {
                    baseline[j] + alphas[k] * diff[j]
                });
                let grads = self.gradients(&path, t)?;
                let mut integral = Array1::<f64>::zeros(d);
                for (k, w) in weights.iter().enumerate() {
                    integral.scaled_add(*w, &grads.row(k));
                }
                Ok((diff * integral).to_vec())
            })
            .collect::<Result<Vec<_>>>()?;

        let predictions: Vec<f64> = targets
            .iter()
            .enumerate()
            .map(|(i, &t)| outputs[[i, t]])
            .collect();
        let deltas = attributions
            .iter()
            .zip(targets.iter())
            .zip(predictions.iter())
            .map(|((attr, &t), &pred)| attr.iter().sum::<f64>() - (pred - baseline_out[[0, t]]))
            .collect::<Vec<_>>();

        debug!(
            n_instances = x.nrows(),
            n_steps = self.config.n_steps,
            max_delta = deltas.iter().fold(0.0_f64, |m, d| m.max(d.abs())),
            "Computed integrated gradients"
        );

        Ok(IntegratedGradientsExplanation {
            meta: ExplanationMeta::local("IntegratedGradients", &self.config),
            attributions,
            baselines: vec![baseline.to_vec(); x.nrows()],
            targets,
            predictions,
            deltas,
            feature_names: self.feature_names.clone(),
        })
    }

    fn baseline(&self, d: usize) -> Result<Array1<f64>> {
        match &self.config.baseline {
            BaselineType::Zeros => Ok(Array1::zeros(d)),
            BaselineType::Constant(v) => Ok(Array1::from_elem(d, *v)),
            BaselineType::Mean => {
                // Mean baseline needs with_background
                let bg = self.background.as_ref().ok_or(ExplainError::NotFitted)?;
                if bg.ncols() != d {
                    return Err(ExplainError::shape(
                        format!("{} background features", d),
                        format!("{}", bg.ncols()),
                    ));
                }
                bg.mean_axis(Axis(0))
                    .ok_or_else(|| ExplainError::DataError("background data is empty".to_string()))
            }
            BaselineType::Custom(values) if values.len() == d => Ok(Array1::from_vec(values.clone())),
            BaselineType::Custom(values) => Err(ExplainError::shape(
                format!("{} baseline values", d),
                format!("{}", values.len()),
            )),
        }
    }

    /// Run the model in chunks of `internal_batch_size` rows
    fn predict_batched(&self, batch: &Array2<f64>) -> Result<Array2<f64>> {
        let size = self.config.internal_batch_size;
        let mut parts = Vec::with_capacity(batch.nrows().div_ceil(size));
        for start in (0..batch.nrows()).step_by(size) {
            let end = (start + size).min(batch.nrows());
            let chunk = batch.slice(s![start..end, ..]).to_owned();
            let out = (self.predict_fn)(&chunk)?;
            if out.nrows() != end - start {
                return Err(ExplainError::shape(
                    format!("{} prediction rows", end - start),
                    format!("{} rows", out.nrows()),
                ));
            }
            parts.push(out);
        }
        let views: Vec<_> = parts.iter().map(|p| p.view()).collect();
        Ok(concatenate(Axis(0), &views)?)
    }

    /// Gradients of output `target` at every row of `points`
    fn gradients(&self, points: &Array2<f64>, target: usize) -> Result<Array2<f64>> {
        if let Some(gradient_fn) = &self.gradient_fn {
            let grads = gradient_fn(points, target)?;
            if grads.dim() != points.dim() {
                return Err(ExplainError::shape(
                    format!("{:?}", points.dim()),
                    format!("{:?}", grads.dim()),
                ));
            }
            return Ok(grads);
        }

        let (m, d) = points.dim();
        let eps = self.config.eps;
        let mut perturbed = Array2::zeros((2 * m * d, d));
        for k in 0..m {
            for j in 0..d {
                let base = 2 * (k * d + j);
                perturbed.row_mut(base).assign(&points.row(k));
                perturbed.row_mut(base + 1).assign(&points.row(k));
                perturbed[[base, j]] += eps;
                perturbed[[base + 1, j]] -= eps;
            }
        }
        let out = self.predict_batched(&perturbed)?;
        Ok(Array2::from_shape_fn((m, d), |(k, j)| {
            let base = 2 * (k * d + j);
            (out[[base, target]] - out[[base + 1, target]]) / (2.0 * eps)
        }))
    }
}

/// Path positions in `[0, 1]` and their quadrature weights
pub(crate) fn path_nodes(method: IntegrationMethod, n: usize) -> (Vec<f64>, Vec<f64>) {
    let nf = n as f64;
    match method {
        IntegrationMethod::RiemannLeft => ((0..n).map(|i| i as f64 / nf).collect(), vec![1.0 / nf; n]),
        IntegrationMethod::RiemannRight => {
            ((1..=n).map(|i| i as f64 / nf).collect(), vec![1.0 / nf; n])
        }
        IntegrationMethod::RiemannMiddle => {
            ((0..n).map(|i| (i as f64 + 0.5) / nf).collect(), vec![1.0 / nf; n])
        }
        IntegrationMethod::RiemannTrapezoid => {
            let h = 1.0 / (nf - 1.0);
            let alphas = (0..n).map(|i| i as f64 * h).collect();
            let weights = (0..n)
                .map(|i| if i == 0 || i == n - 1 { h / 2.0 } else { h })
                .collect();
            (alphas, weights)
        }
        IntegrationMethod::GaussLegendre => {
            let (nodes, weights) = gauss_legendre(n);
            (
                nodes.iter().map(|t| (t + 1.0) / 2.0).collect(),
                weights.iter().map(|w| w / 2.0).collect(),
            )
        }
    }
}

/// Gauss-Legendre nodes and weights on `[-1, 1]`, by Newton iteration on `P_n`
fn gauss_legendre(n: usize) -> (Vec<f64>, Vec<f64>) {
    let mut nodes = vec![0.0; n];
    let mut weights = vec![0.0; n];
    let nf = n as f64;
    for i in 0..n {
        let mut z = (std::f64::consts::PI * (i as f64 + 0.75) / (nf + 0.5)).cos();
        let mut dp = 1.0;
        for _ in 0..100 {
            let (mut p1, mut p2) = (1.0, 0.0);
            for j in 1..=n {
                let p3 = p2;
                p2 = p1;
                let jf = j as f64;
                p1 = ((2.0 * jf - 1.0) * z * p2 - (jf - 1.0) * p3) / jf;
            }
            dp = nf * (z * p1 - p2) / (z * z - 1.0);
            let step = p1 / dp;
            z -= step;
            if step.abs() < 1e-15 {
                break;
            }
        }
        nodes[i] = z;
        weights[i] = 2.0 / ((1.0 - z * z) * dp * dp);
    }
    (nodes, weights)
}

#[cfg(test)]
mod tests {
    use super::*;
    use ndarray::array;

    // f(x) = x0^2 + 3 x1, and a second output 2 x0
    fn model(x: &Array2<f64>) -> Result<Array2<f64>> {
        Ok(Array2::from_shape_fn((x.nrows(), 2), |(i, o)| match o {
            0 => x[[i, 0]].powi(2) + 3.0 * x[[i, 1]],
            _ => 2.0 * x[[i, 0]],
        }))
    }

    #[test]
    fn test_gauss_legendre_weights_sum_to_one() {
        for n in [2, 5, 16, 50] {
            let (alphas, weights) = path_nodes(IntegrationMethod::GaussLegendre, n);
            assert!((weights.iter().sum::<f64>() - 1.0).abs() < 1e-10);
            assert!(alphas.iter().all(|a| (0.0..=1.0).contains(a)));
        }
    }

    #[test]
    fn test_integrated_gradients_completeness() {
        let ig = IntegratedGradients::new(model)
            .with_config(IntegratedGradientsConfig::new().with_n_steps(20));
        let x = array![[2.0, 1.0], [-1.0, 0.5]];
        let exp = ig.explain(&x, TargetSelection::Fixed(0)).unwrap();

        let a = exp.attribution(0).unwrap();
        assert!((a[0] - 4.0).abs() < 1e-4);
        assert!((a[1] - 3.0).abs() < 1e-4);
        assert!(exp.max_abs_delta() < 1e-4);
        assert_eq!(exp.targets, vec![0, 0]);
    }

    #[test]
    fn test_riemann_trapezoid_with_gradient_fn() {
        let ig = IntegratedGradients::new(model)
            .with_gradient_fn(|points: &Array2<f64>, _target: usize| {
                Ok(Array2::from_shape_fn(points.dim(), |(k, j)| {
                    if j == 0 {
                        2.0 * points[[k, 0]]
                    } else {
                        3.0
                    }
                }))
            })
            .with_config(
                IntegratedGradientsConfig::new()
                    .with_n_steps(11)
                    .with_method(IntegrationMethod::RiemannTrapezoid),
            );
        let exp = ig.explain(&array![[2.0, 1.0]], TargetSelection::Fixed(0)).unwrap();
        // Trapezoid is exact for a linear integrand
        assert!((exp.attributions[0][0] - 4.0).abs() < 1e-10);
        assert!((exp.attributions[0][1] - 3.0).abs() < 1e-10);
    }

    #[test]
    fn test_predicted_target_and_mean_baseline() {
        let ig = IntegratedGradients::new(model)
            .with_background(array![[0.0, 0.0], [2.0, 0.0]])
            .with_config(IntegratedGradientsConfig::new().with_baseline(BaselineType::Mean));
        let exp = ig.explain(&array![[3.0, -5.0]], TargetSelection::Predicted).unwrap();
        // Output 1 (= 6) beats output 0 (= -6)
        assert_eq!(exp.targets, vec![1]);
        assert_eq!(exp.baselines[0], vec![1.0, 0.0]);
        assert!((exp.attributions[0][0] - 4.0).abs() < 1e-6);
        assert!(exp.attributions[0][1].abs() < 1e-6);
    }

    #[test]
    fn test_mean_baseline_requires_background() {
        let ig = IntegratedGradients::new(model)
            .with_config(IntegratedGradientsConfig::new().with_baseline(BaselineType::Mean));
        assert!(matches!(
            ig.explain(&array![[1.0, 1.0]], TargetSelection::Fixed(0)),
            Err(ExplainError::NotFitted)
        ));
    }

    #[test]
    fn test_target_out_of_range() {
        let ig = IntegratedGradients::new(model);
        assert!(ig.explain(&array![[1.0, 1.0]], TargetSelection::Fixed(3)).is_err());
    }
}
