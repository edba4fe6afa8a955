//! Numerical optimization helpers shared by the counterfactual explainers

use crate::error::{ExplainError, Result};
use ndarray::{Array1, Array2, ArrayView1, Axis};

/// Call a batch predictor on a single instance
pub(crate) fn predict_one<F>(predict_fn: &F, x: &Array1<f64>) -> Result<Array1<f64>>
where
    F: Fn(&Array2<f64>) -> Result<Array2<f64>>,
{
    let batch = x.clone().insert_axis(Axis(0));
    let out = predict_fn(&batch)?;
    if out.nrows() != 1 {
        return Err(ExplainError::shape(
            "1 prediction row",
            format!("{} rows", out.nrows()),
        ));
    }
    Ok(out.row(0).to_owned())
}

/// Index of the largest value
pub(crate) fn argmax(values: ArrayView1<f64>) -> usize {
    values
        .iter()
        .enumerate()
        .fold((0, f64::NEG_INFINITY), |(bi, bv), (i, &v)| {
            if v > bv {
                (i, v)
            } else {
                (bi, bv)
            }
        })
        .0
}

/// Largest probability over classes other than `exclude`
pub(crate) fn max_other(values: ArrayView1<f64>, exclude: usize) -> (usize, f64) {
    values
        .iter()
        .enumerate()
        .filter(|(i, _)| *i != exclude)
        .fold((exclude, f64::NEG_INFINITY), |(bi, bv), (i, &v)| {
            if v > bv {
                (i, v)
            } else {
                (bi, bv)
            }
        })
}

/// Central finite-difference gradient of `score(predict(x))`.
///
/// All `2 * d` perturbed points go through the predictor in one batch.
pub(crate) fn numerical_gradient<F, S>(
    predict_fn: &F,
    x: &Array1<f64>,
    eps: f64,
    score: S,
) -> Result<Array1<f64>>
where
    F: Fn(&Array2<f64>) -> Result<Array2<f64>>,
    S: Fn(ArrayView1<f64>) -> f64,
{
    let d = x.len();
    let mut batch = Array2::zeros((2 * d, d));
    for j in 0..d {
        let mut plus = x.clone();
        plus[j] += eps;
        let mut minus = x.clone();
        minus[j] -= eps;
        batch.row_mut(2 * j).assign(&plus);
        batch.row_mut(2 * j + 1).assign(&minus);
    }

    let preds = predict_fn(&batch)?;
    if preds.nrows() != 2 * d {
        return Err(ExplainError::shape(
            format!("{} prediction rows", 2 * d),
            format!("{} rows", preds.nrows()),
        ));
    }

    let grad = (0..d)
        .map(|j| (score(preds.row(2 * j)) - score(preds.row(2 * j + 1))) / (2.0 * eps))
        .collect::<Vec<_>>();
    Ok(Array1::from_vec(grad))
}

/// Clip every coordinate into `[low, high]`
pub(crate) fn clip(x: &mut Array1<f64>, range: (f64, f64)) {
    x.mapv_inplace(|v| v.clamp(range.0, range.1));
}

/// Soft-thresholding of `z` around `center` with threshold `beta`
pub(crate) fn shrink(z: &Array1<f64>, center: &Array1<f64>, beta: f64) -> Array1<f64> {
    let mut out = center.clone();
    for ((o, &zi), &ci) in out.iter_mut().zip(z.iter()).zip(center.iter()) {
        let diff = zi - ci;
        if diff > beta {
            *o = zi - beta;
        } else if diff < -beta {
            *o = zi + beta;
        }
    }
    out
}

/// Elastic-net norm `beta * |d|_1 + |d|_2^2`
pub(crate) fn elastic_net(delta: &Array1<f64>, beta: f64) -> f64 {
    beta * delta.iter().map(|v| v.abs()).sum::<f64>() + delta.iter().map(|v| v * v).sum::<f64>()
}

/// Adam optimizer state for a single parameter vector
pub(crate) struct Adam {
    lr: f64,
    beta1: f64,
    beta2: f64,
    eps: f64,
    m: Array1<f64>,
    v: Array1<f64>,
    t: i32,
}

impl Adam {
    pub(crate) fn new(dim: usize, lr: f64) -> Self {
        Self {
            lr,
            beta1: 0.9,
            beta2: 0.999,
            eps: 1e-8,
            m: Array1::zeros(dim),
            v: Array1::zeros(dim),
            t: 0,
        }
    }

    /// Apply one update to `x` in place
    pub(crate) fn step(&mut self, x: &mut Array1<f64>, grad: &Array1<f64>) {
        self.t += 1;
        self.m = &self.m * self.beta1 + grad * (1.0 - self.beta1);
        self.v = &self.v * self.beta2 + &(grad * grad) * (1.0 - self.beta2);
        let m_hat = &self.m / (1.0 - self.beta1.powi(self.t));
        let v_hat = &self.v / (1.0 - self.beta2.powi(self.t));
        let update = m_hat / (v_hat.mapv(f64::sqrt) + self.eps) * self.lr;
        *x -= &update;
    }
}

/// Bisection state for a loss weight such as `lambda` or `c`.
///
/// The weight grows by `growth` until a step succeeds, then bisects between
/// the largest failing and smallest succeeding values.
#[derive(Debug, Clone)]
pub(crate) struct WeightSearch {
    pub(crate) value: f64,
    lower: f64,
    upper: Option<f64>,
    growth: f64,
}

impl WeightSearch {
    pub(crate) fn new(initial: f64, growth: f64) -> Self {
        Self {
            value: initial,
            lower: 0.0,
            upper: None,
            growth,
        }
    }

    /// Record whether the current weight produced a valid solution
    pub(crate) fn update(&mut self, success: bool) {
        if success {
            self.upper = Some(self.upper.map_or(self.value, |u| u.min(self.value)));
            self.value = (self.lower + self.value) / 2.0;
        } else {
            self.lower = self.lower.max(self.value);
            self.value = match self.upper {
                Some(upper) => (self.lower + upper) / 2.0,
                None => self.value * self.growth,
            };
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use ndarray::array;

    #[test]
    fn test_numerical_gradient_linear() {
        let predict_fn = |x: &Array2<f64>| -> Result<Array2<f64>> {
            let col: Vec<f64> = x.rows().into_iter().map(|r| 3.0 * r[0] - 2.0 * r[1]).collect();
            Ok(Array2::from_shape_vec((x.nrows(), 1), col)?)
        };
        let grad = numerical_gradient(&predict_fn, &array![1.0, 1.0], 1e-4, |p| p[0]).unwrap();
        assert!((grad[0] - 3.0).abs() < 1e-6);
        assert!((grad[1] + 2.0).abs() < 1e-6);
    }

    #[test]
    fn test_shrink() {
        let z = array![1.0, -1.0, 0.05];
        let center = array![0.0, 0.0, 0.0];
        let out = shrink(&z, &center, 0.1);
        assert!((out[0] - 0.9).abs() < 1e-12);
        assert!((out[1] + 0.9).abs() < 1e-12);
        assert_eq!(out[2], 0.0);
    }

    #[test]
    fn test_argmax_and_max_other() {
        let p = array![0.2, 0.5, 0.3];
        assert_eq!(argmax(p.view()), 1);
        assert_eq!(max_other(p.view(), 1), (2, 0.3));
    }

    #[test]
    fn test_adam_minimizes_quadratic() {
        let mut x = array![5.0];
        let mut adam = Adam::new(1, 0.1);
        for _ in 0..500 {
            let grad = &x * 2.0;
            adam.step(&mut x, &grad);
        }
        assert!(x[0].abs() < 0.1);
    }

    #[test]
    fn test_weight_search() {
        let mut search = WeightSearch::new(1.0, 10.0);
        search.update(false);
        assert_eq!(search.value, 10.0);
        search.update(true);
        assert_eq!(search.value, 5.5);
        search.update(false);
        assert_eq!(search.value, 7.75);
    }
}
