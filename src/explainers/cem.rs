//! Contrastive explanation method (Dhurandhar et al., 2018)
//!
//! A pertinent negative is a minimal addition to the instance that changes
//! the prediction. A pertinent positive is a minimal subset of the instance,
//! measured from an uninformative background value, that keeps it.

use super::explanation::ExplanationMeta;
use super::optim::{argmax, clip, elastic_net, max_other, numerical_gradient, predict_one, shrink, WeightSearch};
use crate::error::{ExplainError, Result};
use ndarray::{Array1, Array2, ArrayView1, Axis};
use serde::{Deserialize, Serialize};
use tracing::{debug, info};

/// Kind of contrastive explanation
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum CemMode {
    /// What must be absent for the prediction to hold
    PertinentNegative,
    /// What must be present for the prediction to hold
    PertinentPositive,
}

/// Configuration for CEM
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct CemConfig {
    /// Which explanation to search for
    pub mode: CemMode,
    /// Confidence margin
    pub kappa: f64,
    /// Weight of the L1 term
    pub beta: f64,
    /// Initial weight of the prediction loss
    pub c_init: f64,
    /// Number of `c` values tried
    pub c_steps: usize,
    /// FISTA iterations per `c`
    pub max_iter: usize,
    /// Step size
    pub learning_rate: f64,
    /// Finite-difference step for gradients
    pub eps: f64,
    /// Allowed (min, max) for every feature
    pub feature_range: (f64, f64),
    /// Per-feature value carrying no information
    pub no_info_val: Option<Vec<f64>>,
}

impl Default for CemConfig {
    fn default() -> Self {
        Self {
            mode: CemMode::PertinentNegative,
            kappa: 0.0,
            beta: 0.1,
            c_init: 10.0,
            c_steps: 10,
            max_iter: 1000,
            learning_rate: 0.01,
            eps: 0.01,
            feature_range: (-1e10, 1e10),
            no_info_val: None,
        }
    }
}

impl CemConfig {
    /// Create a new configuration
    pub fn new(mode: CemMode) -> Self {
        Self {
            mode,
            ..Self::default()
        }
    }

    /// Set confidence margin
    pub fn with_kappa(mut self, kappa: f64) -> Self {
        self.kappa = kappa;
        self
    }

    /// Set L1 weight
    pub fn with_beta(mut self, beta: f64) -> Self {
        self.beta = beta;
        self
    }

    /// Set number of `c` values tried
    pub fn with_c_steps(mut self, steps: usize) -> Self {
        self.c_steps = steps;
        self
    }

    /// Set FISTA iterations per `c`
    pub fn with_max_iter(mut self, n: usize) -> Self {
        self.max_iter = n;
        self
    }

    /// Set the uninformative value for every feature
    pub fn with_no_info_val(mut self, values: Vec<f64>) -> Self {
        self.no_info_val = Some(values);
        self
    }

    /// Set feature range
    pub fn with_feature_range(mut self, min: f64, max: f64) -> Self {
        self.feature_range = (min, max);
        self
    }

    /// Validate parameter ranges
    pub fn validate(&self) -> Result<()> {
        if self.beta < 0.0 || self.kappa < 0.0 {
            return Err(ExplainError::ConfigError(
                "beta and kappa must be non-negative".to_string(),
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

/// Result of a CEM search
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CemExplanation {
    /// Explanation metadata
    pub meta: ExplanationMeta,
    /// Which explanation was searched for
    pub mode: CemMode,
    /// Original instance
    pub x: Vec<f64>,
    /// Class predicted for the original instance
    pub orig_class: usize,
    /// Probabilities for the original instance
    pub orig_proba: Vec<f64>,
    /// Pertinent negative or positive, if found
    pub pertinent: Option<Vec<f64>>,
    /// Class predicted for the pertinent instance
    pub pertinent_class: Option<usize>,
    /// Probabilities for the pertinent instance
    pub pertinent_proba: Option<Vec<f64>>,
    /// Uninformative values used
    pub no_info_val: Vec<f64>,
}

impl CemExplanation {
    /// Serialize to a JSON string
    pub fn to_json(&self) -> Result<String> {
        Ok(serde_json::to_string_pretty(self)?)
    }
}

/// Contrastive explanation method
pub struct Cem<F>
where
    F: Fn(&Array2<f64>) -> Result<Array2<f64>>,
{
    /// Classifier returning class probabilities (n_samples, n_classes)
    predict_fn: F,
    config: CemConfig,
}

impl<F> Cem<F>
where
    F: Fn(&Array2<f64>) -> Result<Array2<f64>>,
{
    /// Create a new CEM explainer
    pub fn new(predict_fn: F, mode: CemMode) -> Self {
        Self {
            predict_fn,
            config: CemConfig::new(mode),
        }
    }

    /// Set configuration
    pub fn with_config(mut self, config: CemConfig) -> Self {
        self.config = config;
        self
    }

    /// Use per-feature medians of `train` as uninformative values
    pub fn fit(&mut self, train: &Array2<f64>) -> Result<&mut Self> {
        if train.nrows() == 0 {
            return Err(ExplainError::DataError("training data is empty".to_string()));
        }
        let medians = train
            .axis_iter(Axis(1))
            .map(|col| {
                let mut v = col.to_vec();
                v.sort_by(|a, b| a.partial_cmp(b).unwrap_or(std::cmp::Ordering::Equal));
                let n = v.len();
                if n % 2 == 1 {
                    v[n / 2]
                } else {
                    (v[n / 2 - 1] + v[n / 2]) / 2.0
                }
            })
            .collect();
        info!(n_features = train.ncols(), "Fitted CEM uninformative values");
        self.config.no_info_val = Some(medians);
        Ok(self)
    }

    /// Search for a pertinent negative or positive of `x`
    pub fn explain(&self, x: &Array1<f64>) -> Result<CemExplanation> {
        self.config.validate()?;
        let d = x.len();
        let no_info = match &self.config.no_info_val {
            Some(v) if v.len() != d => {
                return Err(ExplainError::shape(
                    format!("{} uninformative values", d),
                    format!("{}", v.len()),
                ))
            }
            Some(v) => Array1::from_vec(v.clone()),
            None => Array1::zeros(d),
        };

        let orig_proba = predict_one(&self.predict_fn, x)?;
        let orig_class = argmax(orig_proba.view());
        let mode = self.config.mode;
        let kappa = self.config.kappa;

        let attack = move |p: ArrayView1<f64>| -> f64 {
            let other = max_other(p, orig_class).1;
            match mode {
                CemMode::PertinentNegative => (p[orig_class] - other + kappa).max(0.0),
                CemMode::PertinentPositive => (other - p[orig_class] + kappa).max(0.0),
            }
        };

        // The elastic net is measured from the instance for PN and from the
        // uninformative values for PP
        let anchor = match mode {
            CemMode::PertinentNegative => x.clone(),
            CemMode::PertinentPositive => no_info.clone(),
        };

        let mut search = WeightSearch::new(self.config.c_init, 10.0);
        let mut best: Option<(f64, Array1<f64>, Array1<f64>)> = None;

        for step in 0..self.config.c_steps {
            let c = search.value;
            let mut x_k = x.clone();
            let mut y = x.clone();
            let mut found = false;

            for k in 0..self.config.max_iter {
                let grad_attack = numerical_gradient(&self.predict_fn, &y, self.config.eps, &attack)?;
                let grad = grad_attack * c + (&y - &anchor) * 2.0;
                let z = &y - &(grad * self.config.learning_rate);
                let mut x_next = shrink(&z, &anchor, self.config.beta * self.config.learning_rate);
                self.project(&mut x_next, x, &no_info);

                let momentum = k as f64 / (k as f64 + 3.0);
                y = &x_next + &((&x_next - &x_k) * momentum);
                self.project(&mut y, x, &no_info);
                x_k = x_next;

                let proba = predict_one(&self.predict_fn, &x_k)?;
                let class = argmax(proba.view());
                let margin = proba[orig_class] - max_other(proba.view(), orig_class).1;
                let valid = match mode {
                    CemMode::PertinentNegative => class != orig_class && -margin >= kappa,
                    CemMode::PertinentPositive => class == orig_class && margin >= kappa,
                };
                if valid {
                    found = true;
                    let distance = elastic_net(&(&x_k - &anchor), self.config.beta);
                    if best.as_ref().map_or(true, |b| distance < b.0) {
                        best = Some((distance, x_k.clone(), proba));
                    }
                }
            }

            debug!(step, c, found, ?mode, "CEM c step");
            search.update(found);
        }

        let (pertinent, pertinent_class, pertinent_proba) = match best {
            Some((_, p, proba)) => (
                Some(p.to_vec()),
                Some(argmax(proba.view())),
                Some(proba.to_vec()),
            ),
            None => (None, None, None),
        };

        Ok(CemExplanation {
            meta: ExplanationMeta::local("CEM", &self.config),
            mode,
            x: x.to_vec(),
            orig_class,
            orig_proba: orig_proba.to_vec(),
            pertinent,
            pertinent_class,
            pertinent_proba,
            no_info_val: no_info.to_vec(),
        })
    }

    /// Keep the iterate feasible.
    ///
    /// PN may only move features further from their uninformative value; PP
    /// stays between the uninformative value and the instance.
    fn project(&self, v: &mut Array1<f64>, x: &Array1<f64>, no_info: &Array1<f64>) {
        for ((vi, &xi), &ni) in v.iter_mut().zip(x.iter()).zip(no_info.iter()) {
            match self.config.mode {
                CemMode::PertinentNegative => {
                    let orig = xi - ni;
                    let cur = *vi - ni;
                    if cur.abs() < orig.abs() {
                        *vi = xi;
                    }
                }
                CemMode::PertinentPositive => {
                    let (lo, hi) = if xi < ni { (xi, ni) } else { (ni, xi) };
                    *vi = vi.clamp(lo, hi);
                }
            }
        }
        clip(v, self.config.feature_range);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use ndarray::array;

    fn logistic(x: &Array2<f64>) -> Result<Array2<f64>> {
        let mut out = Array2::zeros((x.nrows(), 2));
        for (i, row) in x.rows().into_iter().enumerate() {
            let p = 1.0 / (1.0 + (-4.0 * (row[0] + row[1] - 1.0)).exp());
            out[[i, 0]] = 1.0 - p;
            out[[i, 1]] = p;
        }
        Ok(out)
    }

    #[test]
    fn test_pertinent_negative_changes_class() {
        let config = CemConfig::new(CemMode::PertinentNegative)
            .with_no_info_val(vec![0.0, 0.0])
            .with_c_steps(4)
            .with_max_iter(300);
        let cem = Cem::new(logistic, CemMode::PertinentNegative).with_config(config);

        let x = array![0.2, 0.2];
        let exp = cem.explain(&x).unwrap();
        assert_eq!(exp.orig_class, 0);
        let pn = exp.pertinent.expect("pertinent negative should be found");
        assert_eq!(exp.pertinent_class, Some(1));
        assert!(pn[0] >= 0.2 && pn[1] >= 0.2);
        assert!(pn[0] + pn[1] > 1.0);
    }

    #[test]
    fn test_pertinent_positive_keeps_class() {
        let config = CemConfig::new(CemMode::PertinentPositive)
            .with_no_info_val(vec![0.0, 0.0])
            .with_c_steps(4)
            .with_max_iter(300);
        let cem = Cem::new(logistic, CemMode::PertinentPositive).with_config(config);

        let x = array![1.5, 0.3];
        let exp = cem.explain(&x).unwrap();
        assert_eq!(exp.orig_class, 1);
        let pp = exp.pertinent.expect("pertinent positive should be found");
        assert_eq!(exp.pertinent_class, Some(1));
        assert!((0.0..=1.5).contains(&pp[0]));
        assert!((0.0..=0.3).contains(&pp[1]));
        let full = elastic_net(&x, 0.1);
        assert!(elastic_net(&Array1::from_vec(pp), 0.1) < full);
    }

    #[test]
    fn test_fit_uses_medians() {
        let train = array![[1.0, 10.0], [2.0, 20.0], [3.0, 40.0], [4.0, 30.0]];
        let mut cem = Cem::new(logistic, CemMode::PertinentPositive);
        cem.fit(&train).unwrap();
        assert_eq!(cem.config.no_info_val, Some(vec![2.5, 25.0]));
    }

    #[test]
    fn test_projection_pn_blocks_moves_toward_no_info() {
        let cem = Cem::new(logistic, CemMode::PertinentNegative);
        let x = array![0.5, -0.5];
        let mut v = array![0.2, -1.0];
        cem.project(&mut v, &x, &array![0.0, 0.0]);
        assert_eq!(v, array![0.5, -1.0]);
    }

    #[test]
    fn test_projection_pn_blocks_crossing_no_info() {
        let cem = Cem::new(logistic, CemMode::PertinentNegative);
        let x = array![0.5, -0.5, 0.0];
        let no_info = array![0.0, 0.0, 0.0];

        // Crossing to the other side but ending closer is rejected
        let mut v = array![-0.1, 0.3, 0.4];
        cem.project(&mut v, &x, &no_info);
        assert_eq!(v, array![0.5, -0.5, 0.4]);

        // Crossing and ending further away is kept
        let mut w = array![-0.8, 0.9, -0.2];
        cem.project(&mut w, &x, &no_info);
        assert_eq!(w, array![-0.8, 0.9, -0.2]);
        for ((wi, xi), ni) in w.iter().zip(x.iter()).zip(no_info.iter()) {
            assert!((wi - ni).abs() >= (xi - ni).abs());
        }
    }
}
