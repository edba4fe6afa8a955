//! Kernel SHAP (Lundberg & Lee, 2017)
//!
//! Shapley values are recovered by a weighted linear regression over feature
//! coalitions. Features outside a coalition are integrated out over a
//! background dataset. The efficiency constraint is enforced exactly by
//! eliminating one coefficient.

use super::{Link, ShapExplanation};
use crate::error::{ExplainError, Result};
use crate::explainers::explanation::ExplanationMeta;
use ndarray::{Array1, Array2, ArrayView1, Axis};
use rand::prelude::*;
use rand::rngs::StdRng;
use rayon::prelude::*;
use serde::{Deserialize, Serialize};
use tracing::{debug, warn};

/// Background sizes above this slow every evaluation down linearly
const LARGE_BACKGROUND: usize = 100;

/// Configuration for Kernel SHAP
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct KernelShapConfig {
    /// Coalition budget per instance; defaults to `2 * M + 2048`
    pub n_samples: Option<usize>,
    /// Link the values are additive in
    pub link: Link,
    /// Random seed for coalition sampling and background summarising
    pub seed: Option<u64>,
    /// Subsample the background to at most this many rows
    pub summarise_background: Option<usize>,
}

impl Default for KernelShapConfig {
    fn default() -> Self {
        Self {
            n_samples: None,
            link: Link::Identity,
            seed: None,
            summarise_background: None,
        }
    }
}

impl KernelShapConfig {
    /// Create a new configuration
    pub fn new() -> Self {
        Self::default()
    }

    /// Set coalition budget
    pub fn with_n_samples(mut self, n: usize) -> Self {
        self.n_samples = Some(n.max(2));
        self
    }

    /// Set link
    pub fn with_link(mut self, link: Link) -> Self {
        self.link = link;
        self
    }

    /// Set random seed
    pub fn with_seed(mut self, seed: u64) -> Self {
        self.seed = Some(seed);
        self
    }

    /// Limit the background to `n` rows
    pub fn with_summarise_background(mut self, n: usize) -> Self {
        self.summarise_background = Some(n.max(1));
        self
    }

    /// Validate configuration
    pub fn validate(&self) -> Result<()> {
        if let Some(n) = self.n_samples {
            if n < 2 {
                return Err(ExplainError::invalid_parameter(
                    "n_samples",
                    n,
                    "must be at least 2",
                ));
            }
        }
        if self.summarise_background == Some(0) {
            return Err(ExplainError::invalid_parameter(
                "summarise_background",
                0,
                "must be at least 1",
            ));
        }
        Ok(())
    }
}

/// Model-agnostic SHAP explainer
pub struct KernelShap<F>
where
    F: Fn(&Array2<f64>) -> Result<Array2<f64>> + Sync,
{
    /// Model returning outputs (n_samples, n_outputs)
    predict_fn: F,
    /// Background dataset for computing expectations
    background: Array2<f64>,
    feature_names: Option<Vec<String>>,
    config: KernelShapConfig,
}

impl<F> KernelShap<F>
where
    F: Fn(&Array2<f64>) -> Result<Array2<f64>> + Sync,
{
    /// Create a new explainer
    pub fn new(predict_fn: F, background: Array2<f64>) -> Self {
        Self {
            predict_fn,
            background,
            feature_names: None,
            config: KernelShapConfig::default(),
        }
    }

    /// Set feature names
    pub fn with_feature_names(mut self, names: Vec<String>) -> Self {
        self.feature_names = Some(names);
        self
    }

    /// Set configuration; a background summary limit takes effect here
    pub fn with_config(mut self, config: KernelShapConfig) -> Self {
        self.config = config;
        if let Some(n) = self.config.summarise_background {
            if self.background.nrows() > n {
                let mut rng = match self.config.seed {
                    Some(seed) => StdRng::seed_from_u64(seed),
                    None => StdRng::from_entropy(),
                };
                let mut idx: Vec<usize> = (0..self.background.nrows()).collect();
                idx.shuffle(&mut rng);
                idx.truncate(n);
                idx.sort_unstable();
                self.background = self.background.select(Axis(0), &idx);
                debug!(n_background = n, "Summarised Kernel SHAP background");
            }
        }
        self
    }

    /// Background rows in use
    pub fn background(&self) -> &Array2<f64> {
        &self.background
    }

    /// Explain every row of `x`
    pub fn explain(&self, x: &Array2<f64>) -> Result<ShapExplanation> {
        self.config.validate()?;
        if self.background.nrows() == 0 {
            return Err(ExplainError::DataError("background data is empty".to_string()));
        }
        if x.ncols() != self.background.ncols() {
            return Err(ExplainError::shape(
                format!("{} features", self.background.ncols()),
                format!("{} features", x.ncols()),
            ));
        }
        if self.background.nrows() > LARGE_BACKGROUND {
            warn!(
                n_background = self.background.nrows(),
                "Large background dataset slows Kernel SHAP down; consider summarising it"
            );
        }

        let link = self.config.link;
        let bg_out = (self.predict_fn)(&self.background)?;
        let expected_raw = bg_out
            .mean_axis(Axis(0))
            .ok_or_else(|| ExplainError::PredictionError("empty background prediction".to_string()))?;
        let expected: Vec<f64> = expected_raw.iter().map(|&v| link.apply(v)).collect();

        let x_out = (self.predict_fn)(x)?;
        if x_out.nrows() != x.nrows() || x_out.ncols() != expected.len() {
            return Err(ExplainError::shape(
                format!("({}, {})", x.nrows(), expected.len()),
                format!("{:?}", x_out.dim()),
            ));
        }

        let per_instance = (0..x.nrows())
            .into_par_iter()
            .map(|i| {
                let mut rng = match self.config.seed {
                    Some(seed) => StdRng::seed_from_u64(seed.wrapping_add(i as u64)),
                    None => StdRng::from_entropy(),
                };
                self.explain_instance(x.row(i), x_out.row(i), &expected, &mut rng)
            })
            .collect::<Result<Vec<_>>>()?;

        // [instance][output][feature] -> [output][instance][feature]
        let shap_values = (0..expected.len())
            .map(|o| per_instance.iter().map(|inst| inst[o].clone()).collect())
            .collect();

        Ok(ShapExplanation {
            meta: ExplanationMeta::local("KernelShap", &self.config),
            link,
            expected_value: expected,
            shap_values,
            raw_prediction: x_out.rows().into_iter().map(|r| r.to_vec()).collect(),
            data: x.rows().into_iter().map(|r| r.to_vec()).collect(),
            feature_names: self.feature_names.clone(),
        })
    }

    fn explain_instance(
        &self,
        x: ArrayView1<f64>,
        fx: ArrayView1<f64>,
        expected: &[f64],
        rng: &mut StdRng,
    ) -> Result<Vec<Vec<f64>>> {
        let d = x.len();
        let n_out = expected.len();
        let link = self.config.link;
        let mut phi = vec![vec![0.0; d]; n_out];

        // Features equal to every background value cannot change the output
        let varying: Vec<usize> = (0..d)
            .filter(|&j| self.background.column(j).iter().any(|&b| b != x[j]))
            .collect();
        let m = varying.len();
        if m == 0 {
            return Ok(phi);
        }
        if m == 1 {
            for o in 0..n_out {
                phi[o][varying[0]] = link.apply(fx[o]) - expected[o];
            }
            return Ok(phi);
        }

        let budget = self.config.n_samples.unwrap_or(2 * m + 2048);
        let (masks, weights) = coalitions(m, budget, rng);
        let ey = self.coalition_outputs(x, &varying, &masks)?;

        for o in 0..n_out {
            let total = link.apply(fx[o]) - expected[o];
            let last = m - 1;
            let mut a = Array2::<f64>::zeros((last, last));
            let mut b = Array1::<f64>::zeros(last);
            for (k, mask) in masks.iter().enumerate() {
                let z_last = f64::from(u8::from(mask[last]));
                let y = link.apply(ey[[k, o]]) - expected[o] - z_last * total;
                let row: Vec<f64> = (0..last)
                    .map(|j| f64::from(u8::from(mask[j])) - z_last)
                    .collect();
                let w = weights[k];
                for p in 0..last {
                    if row[p] == 0.0 {
                        continue;
                    }
                    b[p] += w * row[p] * y;
                    for q in 0..last {
                        a[[p, q]] += w * row[p] * row[q];
                    }
                }
            }

            let coef = cholesky_solve(&a, &b).ok_or_else(|| {
                ExplainError::ComputationError("coalition system is singular".to_string())
            })?;
            let mut assigned = 0.0;
            for (j, &c) in coef.iter().enumerate() {
                phi[o][varying[j]] = c;
                assigned += c;
            }
            phi[o][varying[last]] = total - assigned;
        }

        debug!(n_varying = m, n_coalitions = masks.len(), "Kernel SHAP instance");
        Ok(phi)
    }

    /// Expected model output per coalition, averaged over the background
    fn coalition_outputs(
        &self,
        x: ArrayView1<f64>,
        varying: &[usize],
        masks: &[Vec<bool>],
    ) -> Result<Array2<f64>> {
        let n_bg = self.background.nrows();
        let d = x.len();
        let mut synthetic = Array2::zeros((masks.len() * n_bg, d));
        for (k, mask) in masks.iter().enumerate() {
            for r in 0..n_bg {
                let mut row = synthetic.row_mut(k * n_bg + r);
                row.assign(&self.background.row(r));
                for (pos, &j) in varying.iter().enumerate() {
                    if mask[pos] {
                        row[j] = x[j];
                    }
                }
            }
        }

        let out = (self.predict_fn)(&synthetic)?;
        if out.nrows() != synthetic.nrows() {
            return Err(ExplainError::shape(
                format!("{} prediction rows", synthetic.nrows()),
                format!("{} rows", out.nrows()),
            ));
        }
        let n_out = out.ncols();
        Ok(Array2::from_shape_fn((masks.len(), n_out), |(k, o)| {
            (0..n_bg).map(|r| out[[k * n_bg + r, o]]).sum::<f64>() / n_bg as f64
        }))
    }
}

/// Shapley kernel weight of a coalition of size `s` out of `m`
fn shapley_kernel(m: usize, s: usize) -> f64 {
    let mut binom = 1.0;
    for i in 0..s {
        binom = binom * (m - i) as f64 / (i + 1) as f64;
    }
    (m - 1) as f64 / (binom * s as f64 * (m - s) as f64)
}

/// Coalitions with their regression weights.
///
/// Every proper non-empty subset is enumerated when the budget allows it.
/// Otherwise coalition sizes are drawn in proportion to their total kernel
/// weight and members uniformly, so each draw carries unit weight. Every
/// sampled coalition is paired with its complement.
fn coalitions(m: usize, budget: usize, rng: &mut StdRng) -> (Vec<Vec<bool>>, Vec<f64>) {
    let full = if m < 31 { (1usize << m) - 2 } else { usize::MAX };
    if full <= budget {
        let masks: Vec<Vec<bool>> = (1..(1usize << m) - 1)
            .map(|bits| (0..m).map(|j| bits & (1 << j) != 0).collect())
            .collect();
        let weights = masks
            .iter()
            .map(|mask| shapley_kernel(m, mask.iter().filter(|&&z| z).count()))
            .collect();
        return (masks, weights);
    }

    let size_weights: Vec<f64> = (1..m).map(|s| 1.0 / (s * (m - s)) as f64).collect();
    let total: f64 = size_weights.iter().sum();
    let mut features: Vec<usize> = (0..m).collect();
    let mut masks = Vec::with_capacity(budget + 1);
    while masks.len() < budget {
        let mut u = rng.gen::<f64>() * total;
        let mut size = m - 1;
        for (i, w) in size_weights.iter().enumerate() {
            if u < *w {
                size = i + 1;
                break;
            }
            u -= w;
        }
        let (chosen, _) = features.partial_shuffle(rng, size);
        let mut mask = vec![false; m];
        for &j in chosen.iter() {
            mask[j] = true;
        }
        let complement = mask.iter().map(|z| !z).collect();
        masks.push(mask);
        masks.push(complement);
    }
    let weights = vec![1.0; masks.len()];
    (masks, weights)
}

/// Solve `A x = b` for symmetric positive definite `A` via Cholesky,
/// retrying once with a small ridge when `A` is not positive definite
fn cholesky_solve(a: &Array2<f64>, b: &Array1<f64>) -> Option<Array1<f64>> {
    let n = a.nrows();
    if n != a.ncols() || n != b.len() {
        return None;
    }
    if n == 0 {
        return Some(Array1::zeros(0));
    }
    cholesky_factor(a).or_else(|| {
        let ridge = 1e-8 * a.diag().iter().map(|v| v.abs()).sum::<f64>() / n as f64;
        let mut a_reg = a.clone();
        for k in 0..n {
            a_reg[[k, k]] += ridge.max(1e-12);
        }
        cholesky_factor(&a_reg)
    })
    .map(|l| {
        // Forward substitution: L * y = b
        let mut y = Array1::zeros(n);
        for i in 0..n {
            let sum: f64 = (0..i).map(|j| l[[i, j]] * y[j]).sum();
            y[i] = (b[i] - sum) / l[[i, i]];
        }
        // Backward substitution: L^T * x = y
        let mut x = Array1::zeros(n);
        for i in (0..n).rev() {
            let sum: f64 = ((i + 1)..n).map(|j| l[[j, i]] * x[j]).sum();
            x[i] = (y[i] - sum) / l[[i, i]];
        }
        x
    })
}

fn cholesky_factor(a: &Array2<f64>) -> Option<Array2<f64>> {
    let n = a.nrows();
    let mut l = Array2::zeros((n, n));
    for i in 0..n {
        for j in 0..=i {
            let sum: f64 = (0..j).map(|k| l[[i, k]] * l[[j, k]]).sum();
            if i == j {
                let diag = a[[i, i]] - sum;
                if diag <= 0.0 {
                    return None;
                }
                l[[i, j]] = diag.sqrt();
            } else {
                l[[i, j]] = (a[[i, j]] - sum) / l[[j, j]];
            }
        }
    }
    Some(l)
}

#[cfg(test)]
mod tests {
    use super::*;
    use ndarray::array;

    fn linear(x: &Array2<f64>) -> Result<Array2<f64>> {
        let w = array![1.0, -2.0, 3.0];
        Ok(x.dot(&w).insert_axis(Axis(1)) + 0.5)
    }

    fn background() -> Array2<f64> {
        array![[0.0, 1.0, 2.0], [2.0, 3.0, 0.0], [1.0, 2.0, 1.0], [3.0, 2.0, 1.0]]
    }

    #[test]
    fn test_kernel_shap_exact_for_linear_model() {
        let explainer = KernelShap::new(linear, background());
        let x = array![[2.0, 0.0, 4.0]];
        let exp = explainer.explain(&x).unwrap();

        // phi_j = w_j * (x_j - E[x_j]) with E[x] = (1.5, 2.0, 1.0)
        let phi = &exp.shap_values[0][0];
        assert!((phi[0] - 0.5).abs() < 1e-8);
        assert!((phi[1] - 4.0).abs() < 1e-8);
        assert!((phi[2] - 9.0).abs() < 1e-8);

        let local = exp.local(0, 0).unwrap();
        assert!((local.base_value + local.sum_contributions() - local.prediction).abs() < 1e-8);
    }

    #[test]
    fn test_non_varying_feature_gets_zero() {
        let bg = array![[0.0, 5.0], [1.0, 5.0]];
        let explainer = KernelShap::new(
            |x: &Array2<f64>| Ok(x.map_axis(Axis(1), |r| r[0] * r[1]).insert_axis(Axis(1))),
            bg,
        );
        let exp = explainer.explain(&array![[3.0, 5.0]]).unwrap();
        let phi = &exp.shap_values[0][0];
        assert_eq!(phi[1], 0.0);
        assert!((phi[0] - (15.0 - 2.5)).abs() < 1e-10);
    }

    #[test]
    fn test_sampled_coalitions_preserve_efficiency() {
        let d = 12;
        let bg = Array2::from_shape_fn((5, d), |(i, j)| ((i * 7 + j * 3) % 5) as f64);
        let model = |x: &Array2<f64>| -> Result<Array2<f64>> {
            Ok(x.map_axis(Axis(1), |r| r.iter().enumerate().map(|(j, v)| (j as f64) * v).sum::<f64>() + r[0] * r[1])
                .insert_axis(Axis(1)))
        };
        let explainer = KernelShap::new(model, bg)
            .with_config(KernelShapConfig::new().with_n_samples(300).with_seed(7));
        let x = Array2::from_elem((1, d), 2.0);
        let exp = explainer.explain(&x).unwrap();
        let local = exp.local(0, 0).unwrap();
        assert!((local.base_value + local.sum_contributions() - local.prediction).abs() < 1e-8);
    }

    #[test]
    fn test_logit_link_multi_output() {
        let model = |x: &Array2<f64>| -> Result<Array2<f64>> {
            let mut out = Array2::zeros((x.nrows(), 2));
            for (i, r) in x.rows().into_iter().enumerate() {
                let p = 1.0 / (1.0 + (-(r[0] - r[1])).exp());
                out[[i, 0]] = 1.0 - p;
                out[[i, 1]] = p;
            }
            Ok(out)
        };
        let explainer = KernelShap::new(model, array![[0.0, 0.0], [1.0, 1.0]])
            .with_config(KernelShapConfig::new().with_link(Link::Logit));
        let exp = explainer.explain(&array![[2.0, 0.0], [0.0, 1.0]]).unwrap();
        assert_eq!(exp.n_outputs(), 2);
        for i in 0..2 {
            for o in 0..2 {
                let local = exp.local(i, o).unwrap();
                assert!((local.base_value + local.sum_contributions() - local.prediction).abs() < 1e-8);
            }
        }
    }

    #[test]
    fn test_summarise_background() {
        let bg = Array2::from_shape_fn((50, 3), |(i, j)| (i + j) as f64);
        let explainer = KernelShap::new(linear, bg).with_config(
            KernelShapConfig::new().with_summarise_background(10).with_seed(1),
        );
        assert_eq!(explainer.background().nrows(), 10);
    }

    #[test]
    fn test_sampled_coalitions_are_paired() {
        let mut rng = StdRng::seed_from_u64(3);
        let (masks, weights) = coalitions(20, 40, &mut rng);
        assert_eq!(masks.len(), 40);
        assert_eq!(weights.len(), 40);
        for pair in masks.chunks(2) {
            assert!(pair[0].iter().zip(pair[1].iter()).all(|(a, b)| a != b));
        }
    }

    #[test]
    fn test_shapley_kernel_symmetry() {
        assert!((shapley_kernel(4, 1) - shapley_kernel(4, 3)).abs() < 1e-12);
        assert!((shapley_kernel(4, 1) - 0.25).abs() < 1e-12);
    }

    #[test]
    fn test_seed_near_max_does_not_overflow() {
        let explainer = KernelShap::new(linear, background())
            .with_config(KernelShapConfig::new().with_seed(u64::MAX));
        let x = array![[2.0, 0.0, 4.0], [1.0, 1.0, 1.0]];
        let exp = explainer.explain(&x).unwrap();
        assert_eq!(exp.shap_values[0].len(), 2);
    }

    #[test]
    fn test_config_validation() {
        assert!(KernelShapConfig::default().validate().is_ok());
        assert!(KernelShapConfig::new().with_n_samples(64).validate().is_ok());

        let mut config = KernelShapConfig::default();
        config.n_samples = Some(1);
        assert!(matches!(
            config.validate(),
            Err(ExplainError::InvalidParameter { ref name, .. }) if name == "n_samples"
        ));

        let mut config = KernelShapConfig::default();
        config.summarise_background = Some(0);
        assert!(config.validate().is_err());
    }

    #[test]
    fn test_cholesky_solve() {
        let a = array![[4.0, 2.0], [2.0, 3.0]];
        let b = array![2.0, 1.0];
        let x = cholesky_solve(&a, &b).unwrap();
        assert!((x[0] - 0.5).abs() < 1e-12);
        assert!(x[1].abs() < 1e-12);
    }

    #[test]
    fn test_feature_mismatch() {
        let explainer = KernelShap::new(linear, background());
        assert!(explainer.explain(&array![[1.0, 2.0]]).is_err());
    }
}
