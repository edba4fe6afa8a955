//! Anchors for tabular data

use super::beam::{AnchorBaseBeam, AnchorSampler, SampleBatch};
use super::{AnchorConfig, AnchorExplanation};
use crate::error::{ExplainError, Result};
use crate::explainers::explanation::ExplanationMeta;
use ndarray::{Array1, Array2, Axis};
use rand::prelude::*;
use rand_xoshiro::Xoshiro256PlusPlus;
use rayon::prelude::*;
use std::collections::HashMap;
use tracing::debug;

/// Discretization learned from the training data
#[derive(Debug, Clone)]
struct TabularFit {
    train: Array2<f64>,
    /// Bin boundaries per feature; `None` for categorical features
    boundaries: Vec<Option<Vec<f64>>>,
    /// Training values per (feature, bin)
    bin_values: Vec<HashMap<usize, Vec<f64>>>,
}

impl TabularFit {
    fn bin_of(&self, feature: usize, value: f64) -> usize {
        match &self.boundaries[feature] {
            Some(bounds) => bounds.partition_point(|&q| q < value),
            None => value.round().max(0.0) as usize,
        }
    }
}

/// Anchor explainer for tabular data
pub struct AnchorTabular<F>
where
    F: Fn(&Array2<f64>) -> Result<Array1<usize>> + Sync,
{
    /// Classifier returning one label per row
    predict_fn: F,
    feature_names: Vec<String>,
    /// Category names for categorical features, indexed by integer code
    categorical_names: HashMap<usize, Vec<String>>,
    /// Percentiles used to discretize numerical features
    disc_perc: Vec<f64>,
    config: AnchorConfig,
    fitted: Option<TabularFit>,
}

impl<F> AnchorTabular<F>
where
    F: Fn(&Array2<f64>) -> Result<Array1<usize>> + Sync,
{
    /// Create a new tabular anchor explainer
    pub fn new(predict_fn: F, feature_names: Vec<String>) -> Self {
        Self {
            predict_fn,
            feature_names,
            categorical_names: HashMap::new(),
            disc_perc: vec![25.0, 50.0, 75.0],
            config: AnchorConfig::default(),
            fitted: None,
        }
    }

    /// Mark features as categorical; values are integer codes into the names
    pub fn with_categorical_names(mut self, names: HashMap<usize, Vec<String>>) -> Self {
        self.categorical_names = names;
        self
    }

    /// Set discretization percentiles
    pub fn with_disc_perc(mut self, perc: Vec<f64>) -> Self {
        self.disc_perc = perc.into_iter().map(|p| p.clamp(0.0, 100.0)).collect();
        self
    }

    /// Set search configuration
    pub fn with_config(mut self, config: AnchorConfig) -> Self {
        self.config = config;
        self
    }

    /// Learn the discretization from training data
    pub fn fit(&mut self, train: &Array2<f64>) -> Result<&mut Self> {
        if train.nrows() == 0 {
            return Err(ExplainError::DataError(
                "training data must not be empty".to_string(),
            ));
        }
        if train.ncols() != self.feature_names.len() {
            return Err(ExplainError::shape(
                format!("{} features", self.feature_names.len()),
                format!("{} columns", train.ncols()),
            ));
        }

        let mut boundaries = Vec::with_capacity(train.ncols());
        for (j, column) in train.axis_iter(Axis(1)).enumerate() {
            if self.categorical_names.contains_key(&j) {
                boundaries.push(None);
                continue;
            }
            let mut sorted = column.to_vec();
            sorted.sort_by(|a, b| a.partial_cmp(b).unwrap_or(std::cmp::Ordering::Equal));
            let mut bounds: Vec<f64> = self
                .disc_perc
                .iter()
                .map(|&p| percentile(&sorted, p))
                .collect();
            bounds.dedup();
            boundaries.push(Some(bounds));
        }

        let mut fit = TabularFit {
            train: train.clone(),
            boundaries,
            bin_values: vec![HashMap::new(); train.ncols()],
        };
        for j in 0..train.ncols() {
            for &v in train.column(j) {
                let bin = fit.bin_of(j, v);
                fit.bin_values[j].entry(bin).or_default().push(v);
            }
        }

        debug!(
            n_samples = train.nrows(),
            n_features = train.ncols(),
            n_categorical = self.categorical_names.len(),
            "Fitted tabular anchor discretizer"
        );
        self.fitted = Some(fit);
        Ok(self)
    }

    /// Explain the prediction for a single instance
    pub fn explain(&self, instance: &Array1<f64>) -> Result<AnchorExplanation> {
        self.explain_partitioned(instance, 1, "AnchorTabular")
    }

    fn explain_partitioned(
        &self,
        instance: &Array1<f64>,
        n_partitions: usize,
        name: &str,
    ) -> Result<AnchorExplanation> {
        let fit = self.fitted.as_ref().ok_or(ExplainError::NotFitted)?;
        if instance.len() != self.feature_names.len() {
            return Err(ExplainError::shape(
                format!("{} features", self.feature_names.len()),
                format!("{} values", instance.len()),
            ));
        }

        let batch = instance.clone().insert_axis(Axis(0));
        let label = *(self.predict_fn)(&batch)?
            .get(0)
            .ok_or_else(|| ExplainError::PredictionError("empty prediction".to_string()))?;

        let instance_bins: Vec<usize> = instance
            .iter()
            .enumerate()
            .map(|(j, &v)| fit.bin_of(j, v))
            .collect();
        let names = self.predicate_names(fit, instance, &instance_bins);

        let sampler = TabularSampler {
            predict_fn: &self.predict_fn,
            fit,
            instance: instance.clone(),
            instance_bins,
            label,
            n_partitions: n_partitions.max(1),
        };
        let result = AnchorBaseBeam::new(&sampler, self.config.clone())?.search()?;

        let meta = ExplanationMeta::local(name, &self.config);
        Ok(AnchorExplanation::from_beam(meta, result, &names, label))
    }

    fn predicate_names(
        &self,
        fit: &TabularFit,
        instance: &Array1<f64>,
        bins: &[usize],
    ) -> Vec<String> {
        self.feature_names
            .iter()
            .enumerate()
            .map(|(j, name)| match &fit.boundaries[j] {
                None => {
                    let category = self
                        .categorical_names
                        .get(&j)
                        .and_then(|c| c.get(bins[j]).cloned())
                        .unwrap_or_else(|| format!("{}", instance[j]));
                    format!("{} = {}", name, category)
                }
                Some(bounds) if bounds.is_empty() => format!("{} = {:.2}", name, instance[j]),
                Some(bounds) => {
                    let b = bins[j];
                    if b == 0 {
                        format!("{} <= {:.2}", name, bounds[0])
                    } else if b >= bounds.len() {
                        format!("{} > {:.2}", name, bounds[bounds.len() - 1])
                    } else {
                        format!("{:.2} < {} <= {:.2}", bounds[b - 1], name, bounds[b])
                    }
                }
            })
            .collect()
    }
}

/// Tabular anchors with sampling and prediction split across rayon workers
pub struct DistributedAnchorTabular<F>
where
    F: Fn(&Array2<f64>) -> Result<Array1<usize>> + Sync,
{
    inner: AnchorTabular<F>,
    n_partitions: usize,
}

impl<F> DistributedAnchorTabular<F>
where
    F: Fn(&Array2<f64>) -> Result<Array1<usize>> + Sync,
{
    /// Create a distributed explainer; partitions default to the rayon pool size
    pub fn new(predict_fn: F, feature_names: Vec<String>) -> Self {
        Self {
            inner: AnchorTabular::new(predict_fn, feature_names),
            n_partitions: rayon::current_num_threads().max(1),
        }
    }

    /// Set the number of sampling partitions
    pub fn with_partitions(mut self, n: usize) -> Self {
        self.n_partitions = n.max(1);
        self
    }

    /// Mark features as categorical
    pub fn with_categorical_names(mut self, names: HashMap<usize, Vec<String>>) -> Self {
        self.inner = self.inner.with_categorical_names(names);
        self
    }

    /// Set discretization percentiles
    pub fn with_disc_perc(mut self, perc: Vec<f64>) -> Self {
        self.inner = self.inner.with_disc_perc(perc);
        self
    }

    /// Set search configuration
    pub fn with_config(mut self, config: AnchorConfig) -> Self {
        self.inner = self.inner.with_config(config);
        self
    }

    /// Learn the discretization from training data
    pub fn fit(&mut self, train: &Array2<f64>) -> Result<&mut Self> {
        self.inner.fit(train)?;
        Ok(self)
    }

    /// Explain the prediction for a single instance
    pub fn explain(&self, instance: &Array1<f64>) -> Result<AnchorExplanation> {
        self.inner
            .explain_partitioned(instance, self.n_partitions, "DistributedAnchorTabular")
    }
}

struct TabularSampler<'a, F> {
    predict_fn: &'a F,
    fit: &'a TabularFit,
    instance: Array1<f64>,
    instance_bins: Vec<usize>,
    label: usize,
    n_partitions: usize,
}

impl<'a, F> TabularSampler<'a, F>
where
    F: Fn(&Array2<f64>) -> Result<Array1<usize>> + Sync,
{
    fn sample_chunk(
        &self,
        anchor: &[usize],
        n: usize,
        compute_labels: bool,
        rng: &mut Xoshiro256PlusPlus,
    ) -> Result<SampleBatch> {
        let train = &self.fit.train;
        let d = train.ncols();
        let mut raw = Array2::zeros((n, d));
        for i in 0..n {
            let row = rng.gen_range(0..train.nrows());
            raw.row_mut(i).assign(&train.row(row));
        }

        // Anchored features are redrawn from training values in the instance's bin
        for &f in anchor {
            let pool = self.fit.bin_values[f].get(&self.instance_bins[f]);
            for i in 0..n {
                raw[[i, f]] = match pool {
                    Some(values) if !values.is_empty() => values[rng.gen_range(0..values.len())],
                    _ => self.instance[f],
                };
            }
        }

        let mut satisfied = Array2::from_elem((n, d), false);
        for i in 0..n {
            for f in 0..d {
                satisfied[[i, f]] = self.fit.bin_of(f, raw[[i, f]]) == self.instance_bins[f];
            }
        }

        if !compute_labels {
            return Ok(SampleBatch {
                satisfied,
                labels_match: Vec::new(),
            });
        }

        let labels = (self.predict_fn)(&raw)?;
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

impl<'a, F> AnchorSampler for TabularSampler<'a, F>
where
    F: Fn(&Array2<f64>) -> Result<Array1<usize>> + Sync,
{
    fn n_predicates(&self) -> usize {
        self.fit.train.ncols()
    }

    fn sample(
        &self,
        anchor: &[usize],
        n: usize,
        compute_labels: bool,
        rng: &mut Xoshiro256PlusPlus,
    ) -> Result<SampleBatch> {
        if self.n_partitions <= 1 || n < 2 * self.n_partitions {
            return self.sample_chunk(anchor, n, compute_labels, rng);
        }

        let base = n / self.n_partitions;
        let extra = n % self.n_partitions;
        let jobs: Vec<(usize, u64)> = (0..self.n_partitions)
            .map(|p| (base + usize::from(p < extra), rng.gen::<u64>()))
            .collect();

        let chunks = jobs
            .into_par_iter()
            .map(|(size, seed)| {
                let mut chunk_rng = Xoshiro256PlusPlus::seed_from_u64(seed);
                self.sample_chunk(anchor, size, compute_labels, &mut chunk_rng)
            })
            .collect::<Result<Vec<_>>>()?;

        let views: Vec<_> = chunks.iter().map(|c| c.satisfied.view()).collect();
        let satisfied = ndarray::concatenate(Axis(0), &views)?;
        let labels_match = chunks.into_iter().flat_map(|c| c.labels_match).collect();
        Ok(SampleBatch {
            satisfied,
            labels_match,
        })
    }
}

fn percentile(sorted: &[f64], p: f64) -> f64 {
    let pos = (p / 100.0) * (sorted.len() - 1) as f64;
    let lo = pos.floor() as usize;
    let hi = pos.ceil() as usize;
    sorted[lo] + (sorted[hi] - sorted[lo]) * (pos - lo as f64)
}

#[cfg(test)]
mod tests {
    use super::*;
    use ndarray::array;

    fn train_data() -> Array2<f64> {
        Array2::from_shape_fn((200, 3), |(i, j)| match j {
            0 => (i % 20) as f64,
            1 => ((i * 7) % 13) as f64,
            _ => (i % 2) as f64,
        })
    }

    // Label depends only on feature 0
    fn classifier(x: &Array2<f64>) -> Result<Array1<usize>> {
        Ok(x.column(0).mapv(|v| usize::from(v > 10.0)))
    }

    fn names() -> Vec<String> {
        vec!["age".to_string(), "score".to_string(), "member".to_string()]
    }

    fn categories() -> HashMap<usize, Vec<String>> {
        let mut map = HashMap::new();
        map.insert(2, vec!["no".to_string(), "yes".to_string()]);
        map
    }

    #[test]
    fn test_requires_fit() {
        let explainer = AnchorTabular::new(classifier, names());
        let result = explainer.explain(&array![15.0, 3.0, 1.0]);
        assert!(matches!(result, Err(ExplainError::NotFitted)));
    }

    #[test]
    fn test_anchor_on_deciding_feature() {
        let mut explainer = AnchorTabular::new(classifier, names())
            .with_categorical_names(categories())
            .with_config(AnchorConfig::new().with_seed(3).with_coverage_samples(1000));
        explainer.fit(&train_data()).unwrap();

        let exp = explainer.explain(&array![18.0, 3.0, 1.0]).unwrap();
        assert_eq!(exp.prediction, 1);
        assert!(exp.meets_threshold);
        assert!(exp.predicates.contains(&0));
        assert!(exp.anchor.iter().any(|a| a.starts_with("age")));
        assert!(exp.precision >= 0.95);
    }

    #[test]
    fn test_categorical_predicate_name() {
        let mut explainer =
            AnchorTabular::new(classifier, names()).with_categorical_names(categories());
        explainer.fit(&train_data()).unwrap();
        let fit = explainer.fitted.as_ref().unwrap();
        let instance = array![2.0, 3.0, 1.0];
        let bins: Vec<usize> = (0..3).map(|j| fit.bin_of(j, instance[j])).collect();
        let names = explainer.predicate_names(fit, &instance, &bins);
        assert_eq!(names[2], "member = yes");
        assert!(names[0].starts_with("age <="));
    }

    #[test]
    fn test_distributed_matches_semantics() {
        let mut explainer = DistributedAnchorTabular::new(classifier, names())
            .with_partitions(4)
            .with_categorical_names(categories())
            .with_config(AnchorConfig::new().with_seed(11).with_coverage_samples(1000));
        explainer.fit(&train_data()).unwrap();

        let exp = explainer.explain(&array![18.0, 3.0, 1.0]).unwrap();
        assert_eq!(exp.meta.name, "DistributedAnchorTabular");
        assert!(exp.predicates.contains(&0));
        assert!(exp.precision >= 0.95);
    }

    #[test]
    fn test_coverage_samples_are_not_predicted() {
        use std::sync::atomic::{AtomicUsize, Ordering};

        let rows_predicted = AtomicUsize::new(0);
        let counting = |x: &Array2<f64>| {
            rows_predicted.fetch_add(x.nrows(), Ordering::Relaxed);
            classifier(x)
        };
        let mut explainer = AnchorTabular::new(counting, names())
            .with_categorical_names(categories())
            .with_config(AnchorConfig::new().with_seed(3).with_coverage_samples(10000));
        explainer.fit(&train_data()).unwrap();

        let exp = explainer.explain(&array![18.0, 3.0, 1.0]).unwrap();
        assert!(exp.predicates.contains(&0));
        // Only the instance and anchor refinement batches reach the model
        let predicted = rows_predicted.load(Ordering::Relaxed);
        assert!(predicted > exp.n_samples);
        assert!(predicted < 10000, "coverage rows were predicted: {}", predicted);
    }
}
