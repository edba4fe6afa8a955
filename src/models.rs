//! Linear models used to drive the explainers from the command line

use crate::error::{ExplainError, Result};
use ndarray::{Array1, Array2, Axis};
use serde::{Deserialize, Serialize};
use std::path::Path;

/// Output transformation of a linear model
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum LinkFunction {
    /// Regression output
    #[default]
    Identity,
    /// Binary classifier, `sigmoid(w.x + b)` is the positive-class probability
    Logistic,
}

/// A fitted linear model
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct LinearModel {
    /// Coefficients, one per feature
    pub weights: Vec<f64>,
    /// Intercept
    #[serde(default)]
    pub intercept: f64,
    /// Output transformation
    #[serde(default)]
    pub link: LinkFunction,
    /// Feature names, matched against CSV headers
    #[serde(default)]
    pub feature_names: Option<Vec<String>>,
}

impl LinearModel {
    /// Create a model
    pub fn new(weights: Vec<f64>, intercept: f64, link: LinkFunction) -> Self {
        Self {
            weights,
            intercept,
            link,
            feature_names: None,
        }
    }

    /// Set feature names
    pub fn with_feature_names(mut self, names: Vec<String>) -> Self {
        self.feature_names = Some(names);
        self
    }

    /// Load a model from a JSON file
    pub fn from_json_file(path: impl AsRef<Path>) -> Result<Self> {
        let content = std::fs::read_to_string(path)?;
        let model: Self = serde_json::from_str(&content)?;
        if let Some(names) = &model.feature_names {
            if names.len() != model.weights.len() {
                return Err(ExplainError::shape(
                    format!("{} feature names", model.weights.len()),
                    format!("{}", names.len()),
                ));
            }
        }
        Ok(model)
    }

    /// Number of input features
    pub fn n_features(&self) -> usize {
        self.weights.len()
    }

    fn check(&self, x: &Array2<f64>) -> Result<()> {
        if x.ncols() != self.weights.len() {
            return Err(ExplainError::shape(
                format!("{} features", self.weights.len()),
                format!("{} features", x.ncols()),
            ));
        }
        Ok(())
    }

    /// Linear predictor `w.x + b`
    pub fn decision_function(&self, x: &Array2<f64>) -> Result<Array1<f64>> {
        self.check(x)?;
        let w = Array1::from_vec(self.weights.clone());
        Ok(x.dot(&w) + self.intercept)
    }

    /// Model output: the regression value or the positive-class probability
    pub fn predict(&self, x: &Array2<f64>) -> Result<Array1<f64>> {
        let z = self.decision_function(x)?;
        Ok(match self.link {
            LinkFunction::Identity => z,
            LinkFunction::Logistic => z.mapv(sigmoid),
        })
    }

    /// Output matrix: one column for regression, two class columns for logistic
    pub fn predict_proba(&self, x: &Array2<f64>) -> Result<Array2<f64>> {
        let p = self.predict(x)?;
        Ok(match self.link {
            LinkFunction::Identity => p.insert_axis(Axis(1)),
            LinkFunction::Logistic => {
                Array2::from_shape_fn((p.len(), 2), |(i, c)| if c == 1 { p[i] } else { 1.0 - p[i] })
            }
        })
    }

    /// Predicted class; regression outputs are thresholded at zero
    pub fn predict_class(&self, x: &Array2<f64>) -> Result<Array1<usize>> {
        let z = self.decision_function(x)?;
        Ok(z.mapv(|v| usize::from(v > 0.0)))
    }
}

fn sigmoid(z: f64) -> f64 {
    1.0 / (1.0 + (-z).exp())
}

#[cfg(test)]
mod tests {
    use super::*;
    use ndarray::array;
    use std::io::Write;

    #[test]
    fn test_linear_predict() {
        let model = LinearModel::new(vec![1.0, 2.0], 0.5, LinkFunction::Identity);
        let x = array![[1.0, 1.0], [0.0, -1.0]];
        assert_eq!(model.predict(&x).unwrap(), array![3.5, -1.5]);
        assert_eq!(model.predict_class(&x).unwrap(), array![1, 0]);
        assert_eq!(model.predict_proba(&x).unwrap().dim(), (2, 1));
    }

    #[test]
    fn test_logistic_proba() {
        let model = LinearModel::new(vec![1.0], 0.0, LinkFunction::Logistic);
        let proba = model.predict_proba(&array![[0.0], [100.0]]).unwrap();
        assert!((proba[[0, 0]] - 0.5).abs() < 1e-12);
        assert!((proba[[1, 1]] - 1.0).abs() < 1e-9);
        assert!((proba.row(1).sum() - 1.0).abs() < 1e-12);
    }

    #[test]
    fn test_shape_mismatch() {
        let model = LinearModel::new(vec![1.0, 2.0], 0.0, LinkFunction::Identity);
        assert!(matches!(
            model.predict(&array![[1.0]]),
            Err(ExplainError::ShapeError { .. })
        ));
    }

    #[test]
    fn test_from_json_file() {
        let mut file = tempfile::NamedTempFile::new().unwrap();
        write!(
            file,
            r#"{{"weights": [0.5, -1.0], "intercept": 2.0, "link": "logistic", "feature_names": ["a", "b"]}}"#
        )
        .unwrap();
        let model = LinearModel::from_json_file(file.path()).unwrap();
        assert_eq!(model.link, LinkFunction::Logistic);
        assert_eq!(model.n_features(), 2);
        assert_eq!(model.feature_names.as_deref(), Some(&["a".to_string(), "b".to_string()][..]));
    }
}
