//! Anchors for image classifiers
//!
//! Images are split into a regular grid of square superpixels; an anchor is a
//! set of superpixels that keeps the prediction when the rest of the image is
//! randomly blanked out.

use super::beam::{AnchorBaseBeam, AnchorSampler, SampleBatch};
use super::{AnchorConfig, AnchorExplanation};
use crate::error::{ExplainError, Result};
use crate::explainers::explanation::ExplanationMeta;
use ndarray::{Array1, Array2, Array3, Array4, Axis};
use rand::prelude::*;
use rand_xoshiro::Xoshiro256PlusPlus;
use serde::{Deserialize, Serialize};

/// Replacement for superpixels that are switched off
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub enum ImageFudge {
    /// Mean colour of the superpixel
    SegmentMean,
    /// Fixed value in every channel
    Constant(f64),
}

/// Anchor explanation for an image
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AnchorImageExplanation {
    /// The anchor itself; predicates are segment ids
    pub explanation: AnchorExplanation,
    /// Segment id per pixel, shape (height, width)
    pub segments: Array2<usize>,
    /// Image with only the anchor segments kept, shape (height, width, channels)
    pub anchor_image: Array3<f64>,
}

#[derive(Debug, Clone, Serialize)]
struct ImageParams<'a> {
    #[serde(flatten)]
    config: &'a AnchorConfig,
    segment_size: usize,
    p_sample: f64,
    fudge: ImageFudge,
}

/// Anchor explainer for images
pub struct AnchorImage<F>
where
    F: Fn(&Array4<f64>) -> Result<Array1<usize>>,
{
    /// Classifier on (batch, height, width, channels)
    predict_fn: F,
    segment_size: usize,
    /// Probability of keeping a non-anchored segment
    p_sample: f64,
    fudge: ImageFudge,
    config: AnchorConfig,
}

impl<F> AnchorImage<F>
where
    F: Fn(&Array4<f64>) -> Result<Array1<usize>>,
{
    /// Create a new image anchor explainer
    pub fn new(predict_fn: F) -> Self {
        Self {
            predict_fn,
            segment_size: 8,
            p_sample: 0.5,
            fudge: ImageFudge::SegmentMean,
            config: AnchorConfig::default(),
        }
    }

    /// Set superpixel side length
    pub fn with_segment_size(mut self, size: usize) -> Self {
        self.segment_size = size.max(1);
        self
    }

    /// Set probability of keeping a segment
    pub fn with_p_sample(mut self, p: f64) -> Self {
        self.p_sample = p.clamp(0.0, 1.0);
        self
    }

    /// Set the replacement for switched-off segments
    pub fn with_fudge(mut self, fudge: ImageFudge) -> Self {
        self.fudge = fudge;
        self
    }

    /// Set search configuration
    pub fn with_config(mut self, config: AnchorConfig) -> Self {
        self.config = config;
        self
    }

    /// Explain the prediction for a single image of shape (height, width, channels)
    pub fn explain(&self, image: &Array3<f64>) -> Result<AnchorImageExplanation> {
        let (h, w, c) = image.dim();
        if h == 0 || w == 0 || c == 0 {
            return Err(ExplainError::DataError("image must not be empty".to_string()));
        }

        let segments = grid_segments(h, w, self.segment_size);
        let n_segments = segments.iter().max().map_or(0, |&m| m + 1);
        let fudged = self.fudged_image(image, &segments, n_segments);

        let batch = image.clone().insert_axis(Axis(0));
        let label = *(self.predict_fn)(&batch)?
            .get(0)
            .ok_or_else(|| ExplainError::PredictionError("empty prediction".to_string()))?;

        let sampler = ImageSampler {
            predict_fn: &self.predict_fn,
            image,
            fudged: &fudged,
            segments: &segments,
            n_segments,
            label,
            p_sample: self.p_sample,
        };
        let result = AnchorBaseBeam::new(&sampler, self.config.clone())?.search()?;

        let mut anchor_image = fudged.clone();
        for ((y, x), &s) in segments.indexed_iter() {
            if result.anchor.contains(&s) {
                for ch in 0..c {
                    anchor_image[[y, x, ch]] = image[[y, x, ch]];
                }
            }
        }

        let names: Vec<String> = (0..n_segments).map(|s| format!("segment {}", s)).collect();
        let params = ImageParams {
            config: &self.config,
            segment_size: self.segment_size,
            p_sample: self.p_sample,
            fudge: self.fudge,
        };
        let meta = ExplanationMeta::local("AnchorImage", &params);

        Ok(AnchorImageExplanation {
            explanation: AnchorExplanation::from_beam(meta, result, &names, label),
            segments,
            anchor_image,
        })
    }

    fn fudged_image(
        &self,
        image: &Array3<f64>,
        segments: &Array2<usize>,
        n_segments: usize,
    ) -> Array3<f64> {
        let (_, _, c) = image.dim();
        match self.fudge {
            ImageFudge::Constant(v) => Array3::from_elem(image.dim(), v),
            ImageFudge::SegmentMean => {
                let mut sums = Array2::<f64>::zeros((n_segments, c));
                let mut counts = vec![0usize; n_segments];
                for ((y, x), &s) in segments.indexed_iter() {
                    counts[s] += 1;
                    for ch in 0..c {
                        sums[[s, ch]] += image[[y, x, ch]];
                    }
                }
                let mut out = Array3::zeros(image.dim());
                for ((y, x), &s) in segments.indexed_iter() {
                    for ch in 0..c {
                        out[[y, x, ch]] = sums[[s, ch]] / counts[s].max(1) as f64;
                    }
                }
                out
            }
        }
    }
}

/// Regular grid segmentation; ids increase row-major
fn grid_segments(h: usize, w: usize, size: usize) -> Array2<usize> {
    let per_row = w.div_ceil(size);
    Array2::from_shape_fn((h, w), |(y, x)| (y / size) * per_row + x / size)
}

struct ImageSampler<'a, F> {
    predict_fn: &'a F,
    image: &'a Array3<f64>,
    fudged: &'a Array3<f64>,
    segments: &'a Array2<usize>,
    n_segments: usize,
    label: usize,
    p_sample: f64,
}

impl<'a, F> AnchorSampler for ImageSampler<'a, F>
where
    F: Fn(&Array4<f64>) -> Result<Array1<usize>>,
{
    fn n_predicates(&self) -> usize {
        self.n_segments
    }

    fn sample(
        &self,
        anchor: &[usize],
        n: usize,
        compute_labels: bool,
        rng: &mut Xoshiro256PlusPlus,
    ) -> Result<SampleBatch> {
        let (h, w, c) = self.image.dim();
        let mut satisfied = Array2::from_elem((n, self.n_segments), false);
        for i in 0..n {
            for s in 0..self.n_segments {
                satisfied[[i, s]] = anchor.contains(&s) || rng.gen_bool(self.p_sample);
            }
        }

        if !compute_labels {
            return Ok(SampleBatch {
                satisfied,
                labels_match: Vec::new(),
            });
        }

        let mut batch = Array4::zeros((n, h, w, c));
        for i in 0..n {
            for ((y, x), &s) in self.segments.indexed_iter() {
                let source = if satisfied[[i, s]] { self.image } else { self.fudged };
                for ch in 0..c {
                    batch[[i, y, x, ch]] = source[[y, x, ch]];
                }
            }
        }

        let labels = (self.predict_fn)(&batch)?;
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

#[cfg(test)]
mod tests {
    use super::*;

    // Class 1 iff the top-left quadrant is bright
    fn bright_corner(batch: &Array4<f64>) -> Result<Array1<usize>> {
        Ok(Array1::from_iter(batch.axis_iter(Axis(0)).map(|img| {
            let mut total = 0.0;
            for y in 0..4 {
                for x in 0..4 {
                    total += img[[y, x, 0]];
                }
            }
            usize::from(total / 16.0 > 0.5)
        })))
    }

    #[test]
    fn test_grid_segments() {
        let seg = grid_segments(8, 8, 4);
        assert_eq!(seg[[0, 0]], 0);
        assert_eq!(seg[[0, 7]], 1);
        assert_eq!(seg[[7, 0]], 2);
        assert_eq!(seg[[7, 7]], 3);

        let ragged = grid_segments(5, 5, 4);
        assert_eq!(ragged[[4, 4]], 3);
    }

    #[test]
    fn test_anchor_image_selects_bright_segment() {
        let image = Array3::from_shape_fn((8, 8, 1), |(y, x, _)| {
            if y < 4 && x < 4 {
                1.0
            } else {
                0.2
            }
        });
        let explainer = AnchorImage::new(bright_corner)
            .with_segment_size(4)
            .with_fudge(ImageFudge::Constant(0.0))
            .with_config(AnchorConfig::new().with_seed(2).with_coverage_samples(500));

        let exp = explainer.explain(&image).unwrap();
        assert_eq!(exp.explanation.prediction, 1);
        assert_eq!(exp.explanation.predicates, vec![0]);
        assert_eq!(exp.anchor_image[[0, 0, 0]], 1.0);
        assert_eq!(exp.anchor_image[[7, 7, 0]], 0.0);
    }

    #[test]
    fn test_segment_mean_fudge() {
        let image = Array3::from_shape_fn((2, 2, 1), |(y, _, _)| y as f64);
        let explainer = AnchorImage::new(bright_corner).with_segment_size(2);
        let segments = grid_segments(2, 2, 2);
        let fudged = explainer.fudged_image(&image, &segments, 1);
        assert!(fudged.iter().all(|&v| (v - 0.5).abs() < 1e-12));
    }
}
