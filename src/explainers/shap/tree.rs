//! Exact SHAP values for tree ensembles (Lundberg et al., 2018, 2020)
//!
//! Two feature perturbations are supported. Path-dependent TreeSHAP uses
//! node covers to integrate out missing features and needs no data.
//! Interventional TreeSHAP averages exact Shapley values against every row
//! of a background dataset.

use super::{Link, ShapExplanation};
use crate::error::{ExplainError, Result};
use crate::explainers::explanation::{ExplanationKind, ExplanationMeta};
use ndarray::{Array1, Array2, ArrayView1};
use rayon::prelude::*;
use serde::{Deserialize, Serialize};
use tracing::{debug, info};

/// Tree node
#[derive(Debug, Clone, Serialize, Deserialize)]
pub enum TreeNode {
    /// Leaf node with prediction value
    Leaf {
        value: f64,
        /// Training weight that reached the node
        cover: f64,
    },
    /// Internal node; `x[feature_idx] <= threshold` goes left
    Split {
        feature_idx: usize,
        threshold: f64,
        left: Box<TreeNode>,
        right: Box<TreeNode>,
        cover: f64,
    },
}

impl TreeNode {
    /// Training weight that reached the node
    pub fn cover(&self) -> f64 {
        match self {
            TreeNode::Leaf { cover, .. } | TreeNode::Split { cover, .. } => *cover,
        }
    }

    fn predict(&self, x: ArrayView1<f64>) -> f64 {
        match self {
            TreeNode::Leaf { value, .. } => *value,
            TreeNode::Split {
                feature_idx,
                threshold,
                left,
                right,
                ..
            } => {
                if x[*feature_idx] <= *threshold {
                    left.predict(x)
                } else {
                    right.predict(x)
                }
            }
        }
    }

    fn max_feature(&self) -> Option<usize> {
        match self {
            TreeNode::Leaf { .. } => None,
            TreeNode::Split {
                feature_idx,
                left,
                right,
                ..
            } => [Some(*feature_idx), left.max_feature(), right.max_feature()]
                .into_iter()
                .flatten()
                .max(),
        }
    }

    fn depth(&self) -> usize {
        match self {
            TreeNode::Leaf { .. } => 0,
            TreeNode::Split { left, right, .. } => 1 + left.depth().max(right.depth()),
        }
    }

    /// Cover-weighted mean of the leaves below this node
    fn expected_value(&self) -> f64 {
        match self {
            TreeNode::Leaf { value, .. } => *value,
            TreeNode::Split { left, right, .. } => {
                let total = left.cover() + right.cover();
                if total <= 0.0 {
                    return 0.0;
                }
                (left.cover() * left.expected_value() + right.cover() * right.expected_value())
                    / total
            }
        }
    }

    fn has_valid_covers(&self) -> bool {
        match self {
            TreeNode::Leaf { cover, .. } => *cover >= 0.0,
            TreeNode::Split { left, right, cover, .. } => {
                *cover > 0.0 && left.has_valid_covers() && right.has_valid_covers()
            }
        }
    }
}

/// A single regression tree
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Tree {
    /// Tree root
    pub root: TreeNode,
}

impl Tree {
    /// Create a tree from its root node
    pub fn new(root: TreeNode) -> Self {
        Self { root }
    }

    /// Predict a single instance
    pub fn predict_row(&self, x: ArrayView1<f64>) -> f64 {
        self.root.predict(x)
    }

    /// Depth of the deepest leaf
    pub fn depth(&self) -> usize {
        self.root.depth()
    }
}

/// Additive ensemble of regression trees
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TreeEnsemble {
    /// Member trees
    pub trees: Vec<Tree>,
    /// Constant added to the sum of tree outputs
    #[serde(default)]
    pub base_value: f64,
}

impl TreeEnsemble {
    /// Create an ensemble
    pub fn new(trees: Vec<Tree>, base_value: f64) -> Self {
        Self { trees, base_value }
    }

    /// Predict a single instance
    pub fn predict_row(&self, x: ArrayView1<f64>) -> f64 {
        self.base_value + self.trees.iter().map(|t| t.predict_row(x)).sum::<f64>()
    }

    /// Predict every row of `x`
    pub fn predict(&self, x: &Array2<f64>) -> Array1<f64> {
        x.rows().into_iter().map(|r| self.predict_row(r)).collect()
    }

    /// Number of features the trees refer to
    pub fn n_features(&self) -> usize {
        self.trees
            .iter()
            .filter_map(|t| t.root.max_feature())
            .max()
            .map_or(0, |m| m + 1)
    }

    /// Load an ensemble from a JSON file
    pub fn from_json_file(path: impl AsRef<std::path::Path>) -> Result<Self> {
        let content = std::fs::read_to_string(path)?;
        Ok(serde_json::from_str(&content)?)
    }
}

/// How absent features are integrated out
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum FeaturePerturbation {
    /// Follow training covers down both branches
    TreePathDependent,
    /// Replace absent features by background values
    Interventional,
}

#[derive(Debug, Clone, Serialize)]
struct TreeShapParams {
    feature_perturbation: FeaturePerturbation,
    n_trees: usize,
    n_background: usize,
}

/// Exact SHAP explainer for tree ensembles
pub struct TreeShap {
    model: TreeEnsemble,
    background: Option<Array2<f64>>,
    feature_names: Option<Vec<String>>,
}

impl TreeShap {
    /// Create a path-dependent explainer
    pub fn new(model: TreeEnsemble) -> Self {
        Self {
            model,
            background: None,
            feature_names: None,
        }
    }

    /// Switch to interventional perturbation against `background`
    pub fn with_background(mut self, background: Array2<f64>) -> Self {
        self.background = Some(background);
        self
    }

    /// Set feature names
    pub fn with_feature_names(mut self, names: Vec<String>) -> Self {
        self.feature_names = Some(names);
        self
    }

    /// Active feature perturbation
    pub fn feature_perturbation(&self) -> FeaturePerturbation {
        if self.background.is_some() {
            FeaturePerturbation::Interventional
        } else {
            FeaturePerturbation::TreePathDependent
        }
    }

    /// Explain every row of `x`
    pub fn explain(&self, x: &Array2<f64>) -> Result<ShapExplanation> {
        let d = x.ncols();
        if self.model.n_features() > d {
            return Err(ExplainError::shape(
                format!("at least {} features", self.model.n_features()),
                format!("{} features", d),
            ));
        }
        let perturbation = self.feature_perturbation();

        let (expected, phi) = match &self.background {
            None => {
                if !self.model.trees.iter().all(|t| t.root.has_valid_covers()) {
                    return Err(ExplainError::DataError(
                        "path-dependent TreeSHAP needs positive covers on every split".to_string(),
                    ));
                }
                let expected = self.model.base_value
                    + self
                        .model
                        .trees
                        .iter()
                        .map(|t| t.root.expected_value())
                        .sum::<f64>();
                let phi = (0..x.nrows())
                    .into_par_iter()
                    .map(|i| self.path_dependent(x.row(i)))
                    .collect::<Vec<_>>();
                (expected, phi)
            }
            Some(bg) => {
                if bg.nrows() == 0 || bg.ncols() != d {
                    return Err(ExplainError::shape(
                        format!("non-empty background with {} features", d),
                        format!("{:?}", bg.dim()),
                    ));
                }
                let expected = self.model.predict(bg).mean().unwrap_or(0.0);
                let phi = (0..x.nrows())
                    .into_par_iter()
                    .map(|i| self.interventional(x.row(i), bg))
                    .collect::<Vec<_>>();
                (expected, phi)
            }
        };

        debug!(
            n_instances = x.nrows(),
            n_trees = self.model.trees.len(),
            ?perturbation,
            "Computed TreeSHAP values"
        );
        info!(expected_value = expected, "TreeSHAP explanation ready");

        let params = TreeShapParams {
            feature_perturbation: perturbation,
            n_trees: self.model.trees.len(),
            n_background: self.background.as_ref().map_or(0, |b| b.nrows()),
        };
        Ok(ShapExplanation {
            meta: ExplanationMeta::new(
                "TreeShap",
                &[ExplanationKind::Local, ExplanationKind::Global],
                &params,
            ),
            link: Link::Identity,
            expected_value: vec![expected],
            shap_values: vec![phi],
            raw_prediction: x
                .rows()
                .into_iter()
                .map(|r| vec![self.model.predict_row(r)])
                .collect(),
            data: x.rows().into_iter().map(|r| r.to_vec()).collect(),
            feature_names: self.feature_names.clone(),
        })
    }

    fn path_dependent(&self, x: ArrayView1<f64>) -> Vec<f64> {
        let mut phi = vec![0.0; x.len()];
        let max_depth = self.model.trees.iter().map(Tree::depth).max().unwrap_or(0);
        for tree in &self.model.trees {
            let path = Vec::with_capacity(max_depth + 2);
            tree_shap_recurse(&tree.root, x, &mut phi, path, 1.0, 1.0, None);
        }
        phi
    }

    fn interventional(&self, x: ArrayView1<f64>, background: &Array2<f64>) -> Vec<f64> {
        let d = x.len();
        let mut phi = vec![0.0; d];
        let mut state = vec![Side::Unset; d];
        for r in background.rows() {
            for tree in &self.model.trees {
                interventional_recurse(&tree.root, x, r, &mut phi, &mut state, 0, 0);
            }
        }
        let n = background.nrows() as f64;
        phi.iter_mut().for_each(|v| *v /= n);
        phi
    }
}

/// One element of the unique feature path
#[derive(Debug, Clone, Copy)]
struct PathElement {
    feature: Option<usize>,
    zero_fraction: f64,
    one_fraction: f64,
    weight: f64,
}

/// Grow the path by one feature, updating the permutation weights
fn extend_path(path: &mut Vec<PathElement>, zero_fraction: f64, one_fraction: f64, feature: Option<usize>) {
    let l = path.len();
    path.push(PathElement {
        feature,
        zero_fraction,
        one_fraction,
        weight: if l == 0 { 1.0 } else { 0.0 },
    });
    let denom = (l + 1) as f64;
    for i in (0..l).rev() {
        path[i + 1].weight += one_fraction * path[i].weight * (i + 1) as f64 / denom;
        path[i].weight = zero_fraction * path[i].weight * (l - i) as f64 / denom;
    }
}

/// Undo `extend_path` for the element at `index`
fn unwind_path(path: &mut Vec<PathElement>, index: usize) {
    let l = path.len() - 1;
    let one = path[index].one_fraction;
    let zero = path[index].zero_fraction;
    let denom = (l + 1) as f64;
    let mut next = path[l].weight;

    for j in (0..l).rev() {
        if one != 0.0 {
            let tmp = path[j].weight;
            path[j].weight = next * denom / ((j + 1) as f64 * one);
            next = tmp - path[j].weight * zero * (l - j) as f64 / denom;
        } else {
            path[j].weight = path[j].weight * denom / (zero * (l - j) as f64);
        }
    }
    for j in index..l {
        path[j].feature = path[j + 1].feature;
        path[j].zero_fraction = path[j + 1].zero_fraction;
        path[j].one_fraction = path[j + 1].one_fraction;
    }
    path.pop();
}

/// Total permutation weight of the path with element `index` unwound
fn unwound_path_sum(path: &[PathElement], index: usize) -> f64 {
    let l = path.len() - 1;
    let one = path[index].one_fraction;
    let zero = path[index].zero_fraction;
    let denom = (l + 1) as f64;
    let mut next = path[l].weight;
    let mut total = 0.0;

    for j in (0..l).rev() {
        if one != 0.0 {
            let tmp = next * denom / ((j + 1) as f64 * one);
            total += tmp;
            next = path[j].weight - tmp * zero * (l - j) as f64 / denom;
        } else {
            total += path[j].weight * denom / (zero * (l - j) as f64);
        }
    }
    total
}

fn tree_shap_recurse(
    node: &TreeNode,
    x: ArrayView1<f64>,
    phi: &mut [f64],
    mut path: Vec<PathElement>,
    zero_fraction: f64,
    one_fraction: f64,
    feature: Option<usize>,
) {
    extend_path(&mut path, zero_fraction, one_fraction, feature);

    match node {
        TreeNode::Leaf { value, .. } => {
            for i in 1..path.len() {
                let w = unwound_path_sum(&path, i);
                let el = path[i];
                if let Some(f) = el.feature {
                    phi[f] += w * (el.one_fraction - el.zero_fraction) * value;
                }
            }
        }
        TreeNode::Split {
            feature_idx,
            threshold,
            left,
            right,
            cover,
        } => {
            let (hot, cold) = if x[*feature_idx] <= *threshold {
                (left.as_ref(), right.as_ref())
            } else {
                (right.as_ref(), left.as_ref())
            };
            let hot_zero = hot.cover() / cover;
            let cold_zero = cold.cover() / cover;

            let mut incoming_zero = 1.0;
            let mut incoming_one = 1.0;
            if let Some(k) = (1..path.len()).find(|&k| path[k].feature == Some(*feature_idx)) {
                incoming_zero = path[k].zero_fraction;
                incoming_one = path[k].one_fraction;
                unwind_path(&mut path, k);
            }

            tree_shap_recurse(
                hot,
                x,
                phi,
                path.clone(),
                hot_zero * incoming_zero,
                incoming_one,
                Some(*feature_idx),
            );
            tree_shap_recurse(
                cold,
                x,
                phi,
                path,
                cold_zero * incoming_zero,
                0.0,
                Some(*feature_idx),
            );
        }
    }
}

/// Which input decided a feature on the current path
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Side {
    Unset,
    Instance,
    Reference,
}

/// `a! b! / (a + b + 1)!`
fn coalition_weight(a: usize, b: usize) -> f64 {
    let mut binom = 1.0;
    for i in 0..a.min(b) {
        binom = binom * (a + b - i) as f64 / (i + 1) as f64;
    }
    1.0 / ((a + b + 1) as f64 * binom)
}

fn interventional_recurse(
    node: &TreeNode,
    x: ArrayView1<f64>,
    r: ArrayView1<f64>,
    phi: &mut [f64],
    state: &mut [Side],
    n_instance: usize,
    n_reference: usize,
) {
    match node {
        TreeNode::Leaf { value, .. } => {
            if n_instance + n_reference == 0 {
                return;
            }
            let pos = if n_instance > 0 {
                coalition_weight(n_instance - 1, n_reference) * value
            } else {
                0.0
            };
            let neg = if n_reference > 0 {
                coalition_weight(n_instance, n_reference - 1) * value
            } else {
                0.0
            };
            for (p, s) in phi.iter_mut().zip(state.iter()) {
                match s {
                    Side::Instance => *p += pos,
                    Side::Reference => *p -= neg,
                    Side::Unset => {}
                }
            }
        }
        TreeNode::Split {
            feature_idx,
            threshold,
            left,
            right,
            ..
        } => {
            let f = *feature_idx;
            let x_child = if x[f] <= *threshold { left.as_ref() } else { right.as_ref() };
            let r_child = if r[f] <= *threshold { left.as_ref() } else { right.as_ref() };

            match state[f] {
                Side::Instance => {
                    interventional_recurse(x_child, x, r, phi, state, n_instance, n_reference)
                }
                Side::Reference => {
                    interventional_recurse(r_child, x, r, phi, state, n_instance, n_reference)
                }
                Side::Unset if std::ptr::eq(x_child, r_child) => {
                    interventional_recurse(x_child, x, r, phi, state, n_instance, n_reference)
                }
                Side::Unset => {
                    state[f] = Side::Instance;
                    interventional_recurse(x_child, x, r, phi, state, n_instance + 1, n_reference);
                    state[f] = Side::Reference;
                    interventional_recurse(r_child, x, r, phi, state, n_instance, n_reference + 1);
                    state[f] = Side::Unset;
                }
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use ndarray::array;

    fn leaf(value: f64, cover: f64) -> Box<TreeNode> {
        Box::new(TreeNode::Leaf { value, cover })
    }

    fn split(feature_idx: usize, threshold: f64, left: Box<TreeNode>, right: Box<TreeNode>) -> Box<TreeNode> {
        let cover = left.cover() + right.cover();
        Box::new(TreeNode::Split {
            feature_idx,
            threshold,
            left,
            right,
            cover,
        })
    }

    // Depth-3 tree using feature 0 twice
    fn sample_tree() -> Tree {
        let root = split(
            0,
            0.5,
            split(1, 0.5, leaf(1.0, 10.0), leaf(3.0, 30.0)),
            split(2, 0.5, leaf(-2.0, 20.0), split(0, 1.5, leaf(4.0, 15.0), leaf(8.0, 25.0))),
        );
        Tree::new(*root)
    }

    fn factorial(n: usize) -> f64 {
        (1..=n).map(|i| i as f64).product()
    }

    /// Conditional expectation following covers for absent features
    fn cond_expectation(node: &TreeNode, x: ArrayView1<f64>, present: &[bool]) -> f64 {
        match node {
            TreeNode::Leaf { value, .. } => *value,
            TreeNode::Split {
                feature_idx,
                threshold,
                left,
                right,
                cover,
            } => {
                if present[*feature_idx] {
                    if x[*feature_idx] <= *threshold {
                        cond_expectation(left, x, present)
                    } else {
                        cond_expectation(right, x, present)
                    }
                } else {
                    (left.cover() * cond_expectation(left, x, present)
                        + right.cover() * cond_expectation(right, x, present))
                        / cover
                }
            }
        }
    }

    fn brute_force_shapley<V: Fn(&[bool]) -> f64>(d: usize, value: V) -> Vec<f64> {
        let mut phi = vec![0.0; d];
        for bits in 0..(1usize << d) {
            let present: Vec<bool> = (0..d).map(|j| bits & (1 << j) != 0).collect();
            let s = present.iter().filter(|&&p| p).count();
            let v = value(&present);
            for j in 0..d {
                let w = factorial(s.saturating_sub(usize::from(present[j])))
                    * factorial(d - s - usize::from(!present[j]))
                    / factorial(d);
                if present[j] {
                    phi[j] += w * v;
                } else {
                    phi[j] -= w * v;
                }
            }
        }
        phi
    }

    #[test]
    fn test_stump_path_dependent() {
        let tree = Tree::new(*split(0, 0.5, leaf(1.0, 3.0), leaf(5.0, 1.0)));
        let explainer = TreeShap::new(TreeEnsemble::new(vec![tree], 0.0));
        let exp = explainer.explain(&array![[1.0]]).unwrap();
        assert!((exp.expected_value[0] - 2.0).abs() < 1e-12);
        assert!((exp.shap_values[0][0][0] - 3.0).abs() < 1e-12);
    }

    #[test]
    fn test_path_dependent_matches_brute_force() {
        let tree = sample_tree();
        let explainer = TreeShap::new(TreeEnsemble::new(vec![tree.clone()], 0.0));
        for x in [array![1.0, 0.0, 0.0], array![0.0, 1.0, 1.0], array![2.0, 0.0, 1.0]] {
            let expected = brute_force_shapley(3, |present| cond_expectation(&tree.root, x.view(), present));
            let exp = explainer
                .explain(&x.clone().insert_axis(ndarray::Axis(0)))
                .unwrap();
            for j in 0..3 {
                assert!(
                    (exp.shap_values[0][0][j] - expected[j]).abs() < 1e-10,
                    "feature {}: {} vs {}",
                    j,
                    exp.shap_values[0][0][j],
                    expected[j]
                );
            }
            let local = exp.local(0, 0).unwrap();
            assert!((local.base_value + local.sum_contributions() - local.prediction).abs() < 1e-10);
        }
    }

    #[test]
    fn test_interventional_matches_brute_force() {
        let tree = sample_tree();
        let ensemble = TreeEnsemble::new(vec![tree.clone(), tree], 0.5);
        let bg = array![[0.0, 0.0, 0.0], [1.0, 1.0, 0.0], [2.0, 0.0, 1.0]];
        let x = array![2.0, 1.0, 1.0];
        let explainer = TreeShap::new(ensemble.clone()).with_background(bg.clone());
        assert_eq!(explainer.feature_perturbation(), FeaturePerturbation::Interventional);

        let expected = brute_force_shapley(3, |present| {
            bg.rows()
                .into_iter()
                .map(|r| {
                    let z: Array1<f64> = (0..3).map(|j| if present[j] { x[j] } else { r[j] }).collect();
                    ensemble.predict_row(z.view())
                })
                .sum::<f64>()
                / bg.nrows() as f64
        });
        let exp = explainer.explain(&x.insert_axis(ndarray::Axis(0))).unwrap();
        for j in 0..3 {
            assert!((exp.shap_values[0][0][j] - expected[j]).abs() < 1e-10);
        }
    }

    #[test]
    fn test_coalition_weight() {
        // 1! 2! / 4! = 1 / 12
        assert!((coalition_weight(1, 2) - 1.0 / 12.0).abs() < 1e-12);
        assert!((coalition_weight(0, 0) - 1.0).abs() < 1e-12);
    }

    #[test]
    fn test_missing_features_rejected() {
        let explainer = TreeShap::new(TreeEnsemble::new(vec![sample_tree()], 0.0));
        assert!(explainer.explain(&array![[1.0, 2.0]]).is_err());
    }

    #[test]
    fn test_ensemble_json_roundtrip() {
        let ensemble = TreeEnsemble::new(vec![sample_tree()], 1.0);
        let json = serde_json::to_string(&ensemble).unwrap();
        let back: TreeEnsemble = serde_json::from_str(&json).unwrap();
        assert_eq!(back.n_features(), 3);
        assert_eq!(back.predict_row(array![2.0, 0.0, 1.0].view()), 9.0);
    }
}
