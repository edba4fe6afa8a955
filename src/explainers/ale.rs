//! Accumulated Local Effects (ALE)
//!
//! ALE describes how a feature influences the prediction on average, using
//! finite differences inside quantile intervals of the feature so that
//! correlated features do not force the model into unrealistic regions
//! (Apley & Zhu, 2020).

use super::explanation::ExplanationMeta;
use crate::error::{ExplainError, Result};
use ndarray::{Array2, Axis};
use rayon::prelude::*;
use serde::{Deserialize, Serialize};
use tracing::debug;

/// Configuration for ALE
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct AleConfig {
    /// Minimum number of samples per quantile interval
    pub min_bin_points: usize,
    /// Features with at most this many unique values use them as the grid
    pub low_resolution_threshold: usize,
    /// Extrapolate a small interval around constant features
    pub extrapolate_constant: bool,
    /// Half-width of the constant-feature interval, as a percentage of the value
    pub extrapolate_constant_perc: f64,
    /// Minimum half-width of the constant-feature interval
    pub extrapolate_constant_min: f64,
}

impl Default for AleConfig {
    fn default() -> Self {
        Self {
            min_bin_points: 4,
            low_resolution_threshold: 10,
            extrapolate_constant: true,
            extrapolate_constant_perc: 10.0,
            extrapolate_constant_min: 0.1,
        }
    }
}

impl AleConfig {
    /// Create a new ALE configuration
    pub fn new() -> Self {
        Self::default()
    }

    /// Set minimum points per interval
    pub fn with_min_bin_points(mut self, n: usize) -> Self {
        self.min_bin_points = n.max(1);
        self
    }

    /// Set the low-resolution threshold
    pub fn with_low_resolution_threshold(mut self, n: usize) -> Self {
        self.low_resolution_threshold = n;
        self
    }

    /// Enable or disable constant-feature extrapolation
    pub fn with_extrapolate_constant(mut self, enabled: bool) -> Self {
        self.extrapolate_constant = enabled;
        self
    }

    /// Validate parameter ranges
    pub fn validate(&self) -> Result<()> {
        if self.min_bin_points == 0 {
            return Err(ExplainError::invalid_parameter(
                "min_bin_points",
                self.min_bin_points,
                "must be at least 1",
            ));
        }
        if self.extrapolate_constant_perc < 0.0 || self.extrapolate_constant_min < 0.0 {
            return Err(ExplainError::invalid_parameter(
                "extrapolate_constant",
                format!(
                    "({}, {})",
                    self.extrapolate_constant_perc, self.extrapolate_constant_min
                ),
                "percentages and minimum must be non-negative",
            ));
        }
        Ok(())
    }
}

/// ALE curve for a single feature
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AleFeatureEffect {
    /// Feature index
    pub feature_index: usize,
    /// Feature name (if provided)
    pub feature_name: Option<String>,
    /// Grid values at which the effect is evaluated
    pub feature_values: Vec<f64>,
    /// Centered ALE: shape (n_grid, n_targets)
    pub ale_values: Vec<Vec<f64>>,
    /// Value subtracted from the uncentered curve, per target
    pub ale0: Vec<f64>,
    /// Deciles (0%, 10%, ..., 100%) of the feature
    pub feature_deciles: Vec<f64>,
}

impl AleFeatureEffect {
    /// ALE curve for one target
    pub fn target_curve(&self, target: usize) -> Vec<f64> {
        self.ale_values
            .iter()
            .map(|row| row.get(target).copied().unwrap_or(0.0))
            .collect()
    }
}

/// Result of an ALE computation
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AleExplanation {
    /// Explanation metadata
    pub meta: ExplanationMeta,
    /// Per-feature effects, in requested order
    pub effects: Vec<AleFeatureEffect>,
    /// Mean prediction over the data, per target
    pub constant_value: Vec<f64>,
    /// Target names (if provided)
    pub target_names: Option<Vec<String>>,
}

impl AleExplanation {
    /// Find the effect for a feature index
    pub fn effect(&self, feature_index: usize) -> Option<&AleFeatureEffect> {
        self.effects.iter().find(|e| e.feature_index == feature_index)
    }

    /// Number of targets
    pub fn n_targets(&self) -> usize {
        self.constant_value.len()
    }

    /// Serialize to a JSON string
    pub fn to_json(&self) -> Result<String> {
        Ok(serde_json::to_string_pretty(self)?)
    }
}

/// Accumulated Local Effects explainer
pub struct Ale<F>
where
    F: Fn(&Array2<f64>) -> Result<Array2<f64>> + Sync,
{
    /// Prediction function returning (n_samples, n_targets)
    predict_fn: F,
    config: AleConfig,
    feature_names: Option<Vec<String>>,
    target_names: Option<Vec<String>>,
}

impl<F> Ale<F>
where
    F: Fn(&Array2<f64>) -> Result<Array2<f64>> + Sync,
{
    /// Create new ALE explainer
    pub fn new(predict_fn: F) -> Self {
        Self {
            predict_fn,
            config: AleConfig::default(),
            feature_names: None,
            target_names: None,
        }
    }

    /// Set configuration
    pub fn with_config(mut self, config: AleConfig) -> Self {
        self.config = config;
        self
    }

    /// Set feature names
    pub fn with_feature_names(mut self, names: Vec<String>) -> Self {
        self.feature_names = Some(names);
        self
    }

    /// Set target names
    pub fn with_target_names(mut self, names: Vec<String>) -> Self {
        self.target_names = Some(names);
        self
    }

    /// Compute ALE for the given features (all features when `None`)
    pub fn explain(&self, x: &Array2<f64>, features: Option<&[usize]>) -> Result<AleExplanation> {
        self.config.validate()?;
        if x.nrows() == 0 || x.ncols() == 0 {
            return Err(ExplainError::DataError(
                "ALE requires a non-empty dataset".to_string(),
            ));
        }

        let all: Vec<usize> = (0..x.ncols()).collect();
        let features = features.unwrap_or(&all);
        if let Some(&bad) = features.iter().find(|&&f| f >= x.ncols()) {
            return Err(ExplainError::FeatureNotFound(format!(
                "feature index {} out of bounds (n_features={})",
                bad,
                x.ncols()
            )));
        }

        let preds = (self.predict_fn)(x)?;
        if preds.nrows() != x.nrows() {
            return Err(ExplainError::shape(
                format!("{} prediction rows", x.nrows()),
                format!("{} rows", preds.nrows()),
            ));
        }
        let constant_value = preds
            .mean_axis(Axis(0))
            .map(|m| m.to_vec())
            .unwrap_or_default();

        debug!(
            n_samples = x.nrows(),
            n_features = features.len(),
            n_targets = constant_value.len(),
            "Computing ALE"
        );

        let effects = features
            .par_iter()
            .map(|&j| self.feature_effect(x, j, constant_value.len()))
            .collect::<Result<Vec<_>>>()?;

        Ok(AleExplanation {
            meta: ExplanationMeta::global("ALE", &self.config),
            effects,
            constant_value,
            target_names: self.target_names.clone(),
        })
    }

    fn feature_effect(
        &self,
        x: &Array2<f64>,
        feature: usize,
        n_targets: usize,
    ) -> Result<AleFeatureEffect> {
        let column: Vec<f64> = x.column(feature).to_vec();
        let mut sorted = column.clone();
        sorted.sort_by(|a, b| a.partial_cmp(b).unwrap_or(std::cmp::Ordering::Equal));
        let feature_deciles: Vec<f64> = (0..=10)
            .map(|i| quantile(&sorted, i as f64 / 10.0))
            .collect();
        let feature_name = self
            .feature_names
            .as_ref()
            .and_then(|names| names.get(feature).cloned());

        let grid = match self.grid(&sorted) {
            Some(grid) => grid,
            None => {
                // Constant feature without extrapolation: flat zero effect
                return Ok(AleFeatureEffect {
                    feature_index: feature,
                    feature_name,
                    feature_values: vec![sorted[0]],
                    ale_values: vec![vec![0.0; n_targets]],
                    ale0: vec![0.0; n_targets],
                    feature_deciles,
                });
            }
        };

        let n_intervals = grid.len() - 1;
        let interval_of: Vec<usize> = column
            .iter()
            .map(|&v| grid.partition_point(|&g| g < v).clamp(1, n_intervals))
            .collect();

        let mut lower = x.clone();
        let mut upper = x.clone();
        for (i, &k) in interval_of.iter().enumerate() {
            lower[[i, feature]] = grid[k - 1];
            upper[[i, feature]] = grid[k];
        }
        let pred_lower = (self.predict_fn)(&lower)?;
        let pred_upper = (self.predict_fn)(&upper)?;
        if pred_lower.ncols() != n_targets || pred_upper.ncols() != n_targets {
            return Err(ExplainError::shape(
                format!("{} targets", n_targets),
                format!("{} / {}", pred_lower.ncols(), pred_upper.ncols()),
            ));
        }

        // Mean finite difference per interval
        let mut sums = vec![vec![0.0; n_targets]; n_intervals + 1];
        let mut counts = vec![0usize; n_intervals + 1];
        for (i, &k) in interval_of.iter().enumerate() {
            counts[k] += 1;
            for t in 0..n_targets {
                sums[k][t] += pred_upper[[i, t]] - pred_lower[[i, t]];
            }
        }

        let mut accumulated = vec![vec![0.0; n_targets]; n_intervals + 1];
        for k in 1..=n_intervals {
            for t in 0..n_targets {
                let mean = if counts[k] > 0 {
                    sums[k][t] / counts[k] as f64
                } else {
                    0.0
                };
                accumulated[k][t] = accumulated[k - 1][t] + mean;
            }
        }

        // Center by the sample-weighted mean over interval midpoints
        let n = x.nrows() as f64;
        let ale0: Vec<f64> = (0..n_targets)
            .map(|t| {
                (1..=n_intervals)
                    .map(|k| {
                        (accumulated[k - 1][t] + accumulated[k][t]) / 2.0 * counts[k] as f64
                    })
                    .sum::<f64>()
                    / n
            })
            .collect();

        let ale_values = accumulated
            .into_iter()
            .map(|row| row.iter().zip(&ale0).map(|(v, c)| v - c).collect())
            .collect();

        Ok(AleFeatureEffect {
            feature_index: feature,
            feature_name,
            feature_values: grid,
            ale_values,
            ale0,
            feature_deciles,
        })
    }

    // Grid for a sorted feature column; None for a constant feature that is
    // not extrapolated.
    fn grid(&self, sorted: &[f64]) -> Option<Vec<f64>> {
        let mut unique = sorted.to_vec();
        unique.dedup();

        if unique.len() == 1 {
            if !self.config.extrapolate_constant {
                return None;
            }
            let v = unique[0];
            let half = (v.abs() * self.config.extrapolate_constant_perc / 100.0)
                .max(self.config.extrapolate_constant_min);
            return Some(vec![v - half, v + half]);
        }

        if unique.len() <= self.config.low_resolution_threshold {
            return Some(unique);
        }

        let n_intervals = (sorted.len() / self.config.min_bin_points).max(1);
        let mut grid: Vec<f64> = (0..=n_intervals)
            .map(|i| quantile(sorted, i as f64 / n_intervals as f64))
            .collect();
        grid.dedup();
        if grid.len() < 2 {
            grid = vec![unique[0], unique[unique.len() - 1]];
        }
        Some(grid)
    }
}

/// Linear-interpolated quantile of sorted data, `q` in [0, 1]
fn quantile(sorted: &[f64], q: f64) -> f64 {
    if sorted.is_empty() {
        return f64::NAN;
    }
    let pos = q.clamp(0.0, 1.0) * (sorted.len() - 1) as f64;
    let lo = pos.floor() as usize;
    let hi = pos.ceil() as usize;
    let frac = pos - lo as f64;
    sorted[lo] + (sorted[hi] - sorted[lo]) * frac
}

/// One panel of an ALE plot
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AlePanel {
    /// Panel title (feature name or index)
    pub title: String,
    /// Grid values
    pub x: Vec<f64>,
    /// One (label, curve) pair per target
    pub lines: Vec<(String, Vec<f64>)>,
    /// Feature deciles for the rug
    pub deciles: Vec<f64>,
}

/// Plot-ready ALE curves
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AlePlot {
    /// Panels in row-major order
    pub panels: Vec<AlePanel>,
    /// Panels per row
    pub n_cols: usize,
}

const MARKERS: &[char] = &['*', '+', 'o', 'x', '#', '@'];

impl AlePlot {
    /// Render the panels as an ASCII chart
    pub fn render_text(&self, width: usize, height: usize) -> String {
        let width = width.max(10);
        let height = height.max(3);
        let rendered: Vec<Vec<String>> = self
            .panels
            .iter()
            .map(|p| render_panel(p, width, height))
            .collect();

        let mut out = String::new();
        for row in rendered.chunks(self.n_cols.max(1)) {
            let n_lines = row.iter().map(|p| p.len()).max().unwrap_or(0);
            for i in 0..n_lines {
                let line: Vec<String> = row
                    .iter()
                    .map(|p| {
                        let cell = p.get(i).map(String::as_str).unwrap_or("");
                        format!("{:<w$}", cell, w = width + 12)
                    })
                    .collect();
                out.push_str(line.join("  ").trim_end());
                out.push('\n');
            }
            out.push('\n');
        }
        out
    }
}

fn render_panel(panel: &AlePanel, width: usize, height: usize) -> Vec<String> {
    let (x_min, x_max) = min_max(panel.x.iter().copied());
    let (y_min, y_max) = min_max(panel.lines.iter().flat_map(|(_, y)| y.iter().copied()));
    let x_span = if x_max > x_min { x_max - x_min } else { 1.0 };
    let y_span = if y_max > y_min { y_max - y_min } else { 1.0 };

    let mut canvas = vec![vec![' '; width]; height];
    for (line_idx, (_, ys)) in panel.lines.iter().enumerate() {
        let marker = MARKERS[line_idx % MARKERS.len()];
        for (&xv, &yv) in panel.x.iter().zip(ys.iter()) {
            let col = (((xv - x_min) / x_span) * (width - 1) as f64).round() as usize;
            let row = (((y_max - yv) / y_span) * (height - 1) as f64).round() as usize;
            canvas[row.min(height - 1)][col.min(width - 1)] = marker;
        }
    }

    let mut rug = vec![' '; width];
    for &d in &panel.deciles {
        let col = (((d - x_min) / x_span) * (width - 1) as f64).round();
        if col >= 0.0 && (col as usize) < width {
            rug[col as usize] = '|';
        }
    }

    let mut lines = vec![panel.title.clone()];
    for (i, row) in canvas.into_iter().enumerate() {
        let label = if i == 0 {
            format!("{:>9.3}", y_max)
        } else if i == height - 1 {
            format!("{:>9.3}", y_min)
        } else {
            " ".repeat(9)
        };
        lines.push(format!("{} |{}", label, row.into_iter().collect::<String>()));
    }
    lines.push(format!("{} +{}", " ".repeat(9), "-".repeat(width)));
    lines.push(format!("{}  {}", " ".repeat(9), rug.into_iter().collect::<String>()));
    lines.push(format!(
        "{}  {:<w$}{:>8.3}",
        " ".repeat(9),
        format!("{:.3}", x_min),
        x_max,
        w = width.saturating_sub(8)
    ));
    for (line_idx, (label, _)) in panel.lines.iter().enumerate() {
        lines.push(format!(
            "{}  {} {}",
            " ".repeat(9),
            MARKERS[line_idx % MARKERS.len()],
            label
        ));
    }
    lines
}

fn min_max(values: impl Iterator<Item = f64>) -> (f64, f64) {
    let (lo, hi) = values.fold((f64::INFINITY, f64::NEG_INFINITY), |(lo, hi), v| {
        (lo.min(v), hi.max(v))
    });
    if lo.is_finite() && hi.is_finite() {
        (lo, hi)
    } else {
        (0.0, 1.0)
    }
}

/// Build plot-ready panels from an ALE explanation.
///
/// `features` and `targets` select by feature index and target position;
/// `None` selects everything.
pub fn plot_ale(
    exp: &AleExplanation,
    features: Option<&[usize]>,
    targets: Option<&[usize]>,
    n_cols: usize,
) -> Result<AlePlot> {
    let all_targets: Vec<usize> = (0..exp.n_targets()).collect();
    let targets = targets.unwrap_or(&all_targets);
    if let Some(&bad) = targets.iter().find(|&&t| t >= exp.n_targets()) {
        return Err(ExplainError::invalid_parameter(
            "targets",
            bad,
            format!("explanation has {} targets", exp.n_targets()),
        ));
    }

    let effects: Vec<&AleFeatureEffect> = match features {
        Some(indices) => indices
            .iter()
            .map(|&f| {
                exp.effect(f).ok_or_else(|| {
                    ExplainError::FeatureNotFound(format!("no ALE computed for feature {}", f))
                })
            })
            .collect::<Result<_>>()?,
        None => exp.effects.iter().collect(),
    };

    let panels = effects
        .into_iter()
        .map(|effect| AlePanel {
            title: effect
                .feature_name
                .clone()
                .unwrap_or_else(|| format!("feature {}", effect.feature_index)),
            x: effect.feature_values.clone(),
            lines: targets
                .iter()
                .map(|&t| {
                    let label = exp
                        .target_names
                        .as_ref()
                        .and_then(|names| names.get(t).cloned())
                        .unwrap_or_else(|| format!("target {}", t));
                    (label, effect.target_curve(t))
                })
                .collect(),
            deciles: effect.feature_deciles.clone(),
        })
        .collect();

    Ok(AlePlot {
        panels,
        n_cols: n_cols.max(1),
    })
}
