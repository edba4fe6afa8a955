//! KL-LUCB beam search over anchor candidates

use super::AnchorConfig;
use crate::error::{ExplainError, Result};
use ndarray::Array2;
use rand::prelude::*;
use rand_xoshiro::Xoshiro256PlusPlus;
use std::collections::HashMap;
use tracing::{debug, warn};

/// Samples drawn under an anchor
#[derive(Debug, Clone)]
pub struct SampleBatch {
    /// `satisfied[[i, p]]`: sample `i` satisfies predicate `p`
    pub satisfied: Array2<bool>,
    /// Whether the model's prediction on sample `i` matches the instance's;
    /// empty when labels were not requested
    pub labels_match: Vec<bool>,
}

impl SampleBatch {
    /// Number of samples in the batch
    pub fn len(&self) -> usize {
        self.satisfied.nrows()
    }

    /// Whether the batch is empty
    pub fn is_empty(&self) -> bool {
        self.satisfied.nrows() == 0
    }
}

/// Perturbation distribution conditioned on an anchor
pub trait AnchorSampler {
    /// Number of candidate predicates
    fn n_predicates(&self) -> usize;

    /// Draw `n` samples satisfying every predicate in `anchor`.
    ///
    /// With `compute_labels == false` only the predicate masks are drawn:
    /// no perturbed inputs are built and the model is not called.
    fn sample(
        &self,
        anchor: &[usize],
        n: usize,
        compute_labels: bool,
        rng: &mut Xoshiro256PlusPlus,
    ) -> Result<SampleBatch>;
}

/// Outcome of the beam search
#[derive(Debug, Clone, PartialEq)]
pub struct BeamResult {
    /// Predicate indices, in the order they were added
    pub anchor: Vec<usize>,
    /// Estimated precision
    pub precision: f64,
    /// Estimated coverage
    pub coverage: f64,
    /// Whether `precision` reached the threshold
    pub meets_threshold: bool,
    /// Samples drawn for this anchor
    pub n_samples: usize,
}

#[derive(Debug, Clone, Default)]
struct AnchorState {
    n_samples: usize,
    positives: usize,
    coverage: f64,
    // Insertion order of predicates, for readable output
    order: Vec<usize>,
}

impl AnchorState {
    fn precision(&self) -> f64 {
        if self.n_samples == 0 {
            0.0
        } else {
            self.positives as f64 / self.n_samples as f64
        }
    }
}

/// Beam search for the highest-coverage anchor meeting a precision threshold
pub struct AnchorBaseBeam<'a, S: AnchorSampler> {
    sampler: &'a S,
    config: AnchorConfig,
    rng: Xoshiro256PlusPlus,
    coverage_data: Array2<bool>,
    states: HashMap<Vec<usize>, AnchorState>,
}

impl<'a, S: AnchorSampler> AnchorBaseBeam<'a, S> {
    /// Create a new beam search, drawing the coverage samples up front
    pub fn new(sampler: &'a S, config: AnchorConfig) -> Result<Self> {
        config.validate()?;
        let mut rng = match config.seed {
            Some(seed) => Xoshiro256PlusPlus::seed_from_u64(seed),
            None => Xoshiro256PlusPlus::from_entropy(),
        };
        let coverage_data = sampler
            .sample(&[], config.coverage_samples, false, &mut rng)?
            .satisfied;
        if coverage_data.ncols() != sampler.n_predicates() {
            return Err(ExplainError::shape(
                format!("{} predicate columns", sampler.n_predicates()),
                format!("{} columns", coverage_data.ncols()),
            ));
        }

        Ok(Self {
            sampler,
            config,
            rng,
            coverage_data,
            states: HashMap::new(),
        })
    }

    /// Run the search
    pub fn search(mut self) -> Result<BeamResult> {
        let n_predicates = self.sampler.n_predicates();
        let threshold = self.config.threshold;

        if n_predicates == 0 {
            // Nothing to anchor on: report the unconditional precision
            let batch = self.sampler.sample(
                &[],
                self.config.min_samples_start.max(1),
                true,
                &mut self.rng,
            )?;
            let precision = fraction(&batch.labels_match);
            return Ok(BeamResult {
                anchor: vec![],
                precision,
                coverage: 1.0,
                meets_threshold: precision >= threshold,
                n_samples: batch.len(),
            });
        }

        let max_size = self
            .config
            .max_anchor_size
            .unwrap_or(n_predicates)
            .clamp(1, n_predicates);

        let mut previous: Vec<Vec<usize>> = vec![vec![]];
        let mut best: Option<Vec<usize>> = None;
        let mut best_coverage = -1.0;

        for size in 1..=max_size {
            let candidates = self.propose(&previous, best_coverage);
            if candidates.is_empty() {
                debug!(size, "No candidate anchors can improve coverage");
                break;
            }

            for candidate in &candidates {
                let drawn = self.state(candidate).n_samples;
                if drawn < self.config.min_samples_start {
                    self.draw(candidate, self.config.min_samples_start - drawn)?;
                }
            }

            let chosen = self.kl_lucb(&candidates)?;
            debug!(size, n_candidates = candidates.len(), n_chosen = chosen.len(), "Selected anchors");

            let mut stop = false;
            for anchor in &chosen {
                let (mean, lower) = self.resolve_precision(anchor)?;
                if mean >= threshold && lower > threshold - self.config.epsilon_stop {
                    let coverage = self.state(anchor).coverage;
                    if coverage > best_coverage {
                        best_coverage = coverage;
                        best = Some(anchor.clone());
                        if coverage >= 1.0 || self.config.stop_on_first {
                            stop = true;
                        }
                    }
                }
            }

            if stop {
                break;
            }
            previous = chosen;
        }

        match best {
            Some(anchor) => Ok(self.result(&anchor, true)),
            None => {
                let fallback = self
                    .states
                    .iter()
                    .max_by(|(_, a), (_, b)| {
                        a.precision()
                            .partial_cmp(&b.precision())
                            .unwrap_or(std::cmp::Ordering::Equal)
                            .then(
                                a.coverage
                                    .partial_cmp(&b.coverage)
                                    .unwrap_or(std::cmp::Ordering::Equal),
                            )
                    })
                    .map(|(key, _)| key.clone())
                    .unwrap_or_default();
                let result = self.result(&fallback, false);
                warn!(
                    threshold,
                    precision = result.precision,
                    "Could not find an anchor satisfying the precision threshold; returning the best anchor found"
                );
                Ok(result)
            }
        }
    }

    fn result(&self, key: &[usize], meets_threshold: bool) -> BeamResult {
        let state = self.states.get(key).cloned().unwrap_or_default();
        BeamResult {
            anchor: state.order.clone(),
            precision: state.precision(),
            coverage: state.coverage,
            meets_threshold,
            n_samples: state.n_samples,
        }
    }

    // Extend each previous anchor by one predicate, keeping candidates whose
    // coverage can still beat the best valid anchor.
    fn propose(&mut self, previous: &[Vec<usize>], best_coverage: f64) -> Vec<Vec<usize>> {
        let n_predicates = self.sampler.n_predicates();
        let mut out: Vec<Vec<usize>> = Vec::new();
        for prev_key in previous {
            let prev_order = self
                .states
                .get(prev_key)
                .map(|s| s.order.clone())
                .unwrap_or_else(|| prev_key.clone());
            for p in 0..n_predicates {
                if prev_key.contains(&p) {
                    continue;
                }
                let mut key = prev_key.clone();
                key.push(p);
                key.sort_unstable();
                if out.contains(&key) {
                    continue;
                }
                let coverage = self.coverage(&key);
                if coverage <= best_coverage {
                    continue;
                }
                let state = self.states.entry(key.clone()).or_default();
                state.coverage = coverage;
                if state.order.is_empty() {
                    state.order = prev_order.clone();
                    state.order.push(p);
                }
                out.push(key);
            }
        }
        out
    }

    fn coverage(&self, key: &[usize]) -> f64 {
        let n = self.coverage_data.nrows();
        if n == 0 {
            return 0.0;
        }
        let covered = self
            .coverage_data
            .rows()
            .into_iter()
            .filter(|row| key.iter().all(|&p| row[p]))
            .count();
        covered as f64 / n as f64
    }

    fn state(&mut self, key: &[usize]) -> &AnchorState {
        self.states.entry(key.to_vec()).or_default()
    }

    fn draw(&mut self, key: &[usize], n: usize) -> Result<()> {
        if n == 0 {
            return Ok(());
        }
        let batch = self.sampler.sample(key, n, true, &mut self.rng)?;
        let positives = batch.labels_match.iter().filter(|&&m| m).count();
        let state = self.states.entry(key.to_vec()).or_default();
        state.n_samples += batch.len();
        state.positives += positives;
        Ok(())
    }

    // Sample an anchor until its precision is clearly above or below the
    // threshold; returns (mean, lower bound).
    fn resolve_precision(&mut self, key: &[usize]) -> Result<(f64, f64)> {
        let threshold = self.config.threshold;
        let eps = self.config.epsilon_stop;
        let beta = (1.0 / self.config.delta).ln();

        for _ in 0..self.config.max_batches {
            let (mean, lower, upper) = self.bounds(key, beta);
            let undecided = (mean >= threshold && lower < threshold - eps)
                || (mean < threshold && upper >= threshold + eps);
            if !undecided {
                return Ok((mean, lower));
            }
            self.draw(key, self.config.batch_size)?;
        }
        let (mean, lower, _) = self.bounds(key, beta);
        Ok((mean, lower))
    }

    fn bounds(&self, key: &[usize], beta: f64) -> (f64, f64, f64) {
        let state = self.states.get(key).cloned().unwrap_or_default();
        let n = state.n_samples.max(1) as f64;
        let mean = state.precision();
        (
            mean,
            kl_lower_bound(mean, beta / n),
            kl_upper_bound(mean, beta / n),
        )
    }

    // KL-LUCB: returns the `beam_size` candidates with the highest precision,
    // sampling until the weakest chosen and strongest rejected are separated.
    fn kl_lucb(&mut self, candidates: &[Vec<usize>]) -> Result<Vec<Vec<usize>>> {
        let beam = self.config.beam_size;
        let by_mean = |this: &Self| {
            let mut idx: Vec<usize> = (0..candidates.len()).collect();
            idx.sort_by(|&a, &b| {
                let ma = this.states.get(&candidates[a]).map(|s| s.precision()).unwrap_or(0.0);
                let mb = this.states.get(&candidates[b]).map(|s| s.precision()).unwrap_or(0.0);
                mb.partial_cmp(&ma).unwrap_or(std::cmp::Ordering::Equal)
            });
            idx
        };

        if candidates.len() <= beam {
            return Ok(by_mean(&*self).into_iter().map(|i| candidates[i].clone()).collect());
        }

        let mut t = 1usize;
        for _ in 0..self.config.max_batches {
            let order = by_mean(&*self);
            let (chosen, rest) = order.split_at(beam);
            let beta = lucb_beta(candidates.len(), t, self.config.delta);

            let weakest = chosen
                .iter()
                .map(|&i| (i, self.bounds(&candidates[i], beta).1))
                .min_by(|a, b| a.1.partial_cmp(&b.1).unwrap_or(std::cmp::Ordering::Equal));
            let strongest = rest
                .iter()
                .map(|&i| (i, self.bounds(&candidates[i], beta).2))
                .max_by(|a, b| a.1.partial_cmp(&b.1).unwrap_or(std::cmp::Ordering::Equal));

            let (Some((lt, lb)), Some((ut, ub))) = (weakest, strongest) else {
                break;
            };
            if ub - lb <= self.config.tau {
                break;
            }

            let lower_key = candidates[lt].clone();
            let upper_key = candidates[ut].clone();
            self.draw(&lower_key, self.config.batch_size)?;
            self.draw(&upper_key, self.config.batch_size)?;
            t += 1;
        }

        Ok(by_mean(&*self)
            .into_iter()
            .take(beam)
            .map(|i| candidates[i].clone())
            .collect())
    }
}

fn fraction(values: &[bool]) -> f64 {
    if values.is_empty() {
        0.0
    } else {
        values.iter().filter(|&&v| v).count() as f64 / values.len() as f64
    }
}

/// Exploration rate for KL-LUCB (Kaufmann & Kalyanakrishnan, 2013)
fn lucb_beta(n_candidates: usize, t: usize, delta: f64) -> f64 {
    let alpha = 1.1;
    let k = 405.5;
    let temp = (k * n_candidates as f64 * (t as f64).powf(alpha) / delta).ln();
    temp + temp.ln()
}

/// Bernoulli KL divergence
fn kl_bernoulli(p: f64, q: f64) -> f64 {
    let p = p.clamp(1e-7, 1.0 - 1e-7);
    let q = q.clamp(1e-7, 1.0 - 1e-7);
    p * (p / q).ln() + (1.0 - p) * ((1.0 - p) / (1.0 - q)).ln()
}

/// Largest q >= p with KL(p, q) <= level
fn kl_upper_bound(p: f64, level: f64) -> f64 {
    let mut lm = p;
    let mut um = (p + (level / 2.0).sqrt()).min(1.0);
    for _ in 0..16 {
        let qm = (um + lm) / 2.0;
        if kl_bernoulli(p, qm) > level {
            um = qm;
        } else {
            lm = qm;
        }
    }
    um
}

/// Smallest q <= p with KL(p, q) <= level
fn kl_lower_bound(p: f64, level: f64) -> f64 {
    let mut um = p;
    let mut lm = (p - (level / 2.0).sqrt()).max(0.0);
    for _ in 0..16 {
        let qm = (um + lm) / 2.0;
        if kl_bernoulli(p, qm) > level {
            lm = qm;
        } else {
            um = qm;
        }
    }
    lm
}

#[cfg(test)]
mod tests {
    use super::*;

    /// Predicate 0 alone guarantees the label; predicate 1 is noise.
    struct ToySampler;

    impl AnchorSampler for ToySampler {
        fn n_predicates(&self) -> usize {
            2
        }

        fn sample(
            &self,
            anchor: &[usize],
            n: usize,
            _compute_labels: bool,
            rng: &mut Xoshiro256PlusPlus,
        ) -> Result<SampleBatch> {
            let mut satisfied = Array2::from_elem((n, 2), false);
            let mut labels_match = Vec::with_capacity(n);
            for i in 0..n {
                let p0 = anchor.contains(&0) || rng.gen_bool(0.5);
                let p1 = anchor.contains(&1) || rng.gen_bool(0.5);
                satisfied[[i, 0]] = p0;
                satisfied[[i, 1]] = p1;
                labels_match.push(p0 || rng.gen_bool(0.3));
            }
            Ok(SampleBatch {
                satisfied,
                labels_match,
            })
        }
    }

    #[test]
    fn test_kl_bounds_bracket_mean() {
        for &p in &[0.0, 0.3, 0.9, 1.0] {
            let lo = kl_lower_bound(p, 0.05);
            let hi = kl_upper_bound(p, 0.05);
            assert!(lo <= p + 1e-12 && p <= hi + 1e-12, "p={} lo={} hi={}", p, lo, hi);
        }
        // More samples, tighter bounds
        assert!(kl_upper_bound(0.5, 0.01) < kl_upper_bound(0.5, 0.1));
    }

    #[test]
    fn test_lucb_beta_grows_with_t() {
        assert!(lucb_beta(4, 10, 0.1) > lucb_beta(4, 1, 0.1));
    }

    #[test]
    fn test_beam_finds_informative_predicate() {
        let config = AnchorConfig::new()
            .with_seed(7)
            .with_coverage_samples(2000)
            .with_threshold(0.95);
        let result = AnchorBaseBeam::new(&ToySampler, config)
            .unwrap()
            .search()
            .unwrap();

        assert!(result.meets_threshold);
        assert_eq!(result.anchor, vec![0]);
        assert!(result.precision >= 0.95);
        assert!((result.coverage - 0.5).abs() < 0.1);
    }

    #[test]
    fn test_beam_unreachable_threshold_falls_back() {
        struct Coin;
        impl AnchorSampler for Coin {
            fn n_predicates(&self) -> usize {
                1
            }
            fn sample(
                &self,
                _anchor: &[usize],
                n: usize,
                _compute_labels: bool,
                rng: &mut Xoshiro256PlusPlus,
            ) -> Result<SampleBatch> {
                Ok(SampleBatch {
                    satisfied: Array2::from_elem((n, 1), true),
                    labels_match: (0..n).map(|_| rng.gen_bool(0.5)).collect(),
                })
            }
        }

        let config = AnchorConfig::new().with_seed(1).with_coverage_samples(100);
        let result = AnchorBaseBeam::new(&Coin, config).unwrap().search().unwrap();
        assert!(!result.meets_threshold);
        assert_eq!(result.anchor, vec![0]);
        assert!(result.precision < 0.95);
    }

    #[test]
    fn test_coverage_draws_skip_labels() {
        use std::cell::Cell;

        struct Counting {
            labelled: Cell<usize>,
            unlabelled: Cell<usize>,
        }
        impl AnchorSampler for Counting {
            fn n_predicates(&self) -> usize {
                ToySampler.n_predicates()
            }
            fn sample(
                &self,
                anchor: &[usize],
                n: usize,
                compute_labels: bool,
                rng: &mut Xoshiro256PlusPlus,
            ) -> Result<SampleBatch> {
                let counter = if compute_labels { &self.labelled } else { &self.unlabelled };
                counter.set(counter.get() + n);
                let mut batch = ToySampler.sample(anchor, n, compute_labels, rng)?;
                if !compute_labels {
                    batch.labels_match.clear();
                }
                Ok(batch)
            }
        }

        let sampler = Counting {
            labelled: Cell::new(0),
            unlabelled: Cell::new(0),
        };
        let config = AnchorConfig::new().with_seed(7).with_coverage_samples(5000);
        let beam = AnchorBaseBeam::new(&sampler, config).unwrap();
        assert_eq!(sampler.unlabelled.get(), 5000);
        assert_eq!(sampler.labelled.get(), 0);
        assert_eq!(beam.coverage_data.nrows(), 5000);

        let result = beam.search().unwrap();
        assert_eq!(result.anchor, vec![0]);
        assert_eq!(sampler.unlabelled.get(), 5000);
    }
}
