//! Model explainers
//!
//! Provides model interpretation and explanation methods including:
//! - Accumulated local effects (ALE) and ALE plotting
//! - Anchor explanations for tabular data, text and images
//! - Contrastive explanations (pertinent negatives and positives)
//! - Counterfactual search, plain and prototype-guided
//! - Integrated gradients
//! - Kernel SHAP and TreeSHAP (behind the `shap` feature)

mod ale;
pub mod anchor;
mod cem;
mod cfproto;
mod counterfactual;
mod explanation;
mod integrated_gradients;
pub(crate) mod optim;

#[cfg(feature = "shap")]
pub mod shap;

use crate::registry::{LoadResult, OptionalGroup};

pub use ale::{plot_ale, Ale, AleConfig, AleExplanation, AleFeatureEffect, AlePanel, AlePlot};
pub use anchor::{
    AnchorConfig, AnchorExplanation, AnchorImage, AnchorImageExplanation, AnchorTabular,
    AnchorText, DistributedAnchorTabular, ImageFudge, SamplingStrategy,
};
pub use cem::{Cem, CemConfig, CemExplanation, CemMode};
pub use cfproto::{CounterFactualProto, CounterfactualProtoConfig, CounterfactualProtoExplanation};
pub use counterfactual::{
    CfInstance, CounterFactual, CounterfactualConfig, CounterfactualExplanation, Target,
};
pub use explanation::{ExplanationKind, ExplanationMeta};
pub use integrated_gradients::{
    BaselineType, IntegratedGradients, IntegratedGradientsConfig, IntegratedGradientsExplanation,
    IntegrationMethod, TargetSelection,
};

#[cfg(feature = "shap")]
pub use self::shap::{
    FeaturePerturbation, KernelShap, KernelShapConfig, Link, ShapExplanation, ShapSummary, Tree,
    TreeEnsemble, TreeNode, TreeShap,
};

/// Explainer names exported unconditionally, in publication order
pub const BASE_EXPORTS: &[&str] = &[
    "ALE",
    "AnchorTabular",
    "DistributedAnchorTabular",
    "AnchorText",
    "AnchorImage",
    "CEM",
    "CounterFactual",
    "CounterFactualProto",
    "plot_ale",
    "IntegratedGradients",
];

/// Explainer names contributed by the optional SHAP group
pub const SHAP_EXPORTS: &[&str] = &["KernelShap", "TreeShap"];

/// Loader for the SHAP group
#[cfg(feature = "shap")]
pub fn load_shap_exports() -> LoadResult {
    Ok(SHAP_EXPORTS)
}

/// Loader for the SHAP group
#[cfg(not(feature = "shap"))]
pub fn load_shap_exports() -> LoadResult {
    Err(crate::registry::LoadError::DependencyUnavailable {
        group: "shap",
        dependency: "shap",
    })
}

/// Optional export groups, attempted in order after the base names
pub fn optional_groups() -> Vec<OptionalGroup> {
    vec![OptionalGroup {
        name: "shap",
        loader: load_shap_exports,
    }]
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_base_exports_unique() {
        for (i, name) in BASE_EXPORTS.iter().enumerate() {
            assert!(!BASE_EXPORTS[i + 1..].contains(name), "duplicate export {}", name);
        }
        assert!(SHAP_EXPORTS.iter().all(|n| !BASE_EXPORTS.contains(n)));
    }

    #[cfg(feature = "shap")]
    #[test]
    fn test_shap_loader_present() {
        assert_eq!(load_shap_exports().unwrap(), SHAP_EXPORTS);
    }

    #[cfg(not(feature = "shap"))]
    #[test]
    fn test_shap_loader_absent() {
        assert!(matches!(
            load_shap_exports(),
            Err(crate::registry::LoadError::DependencyUnavailable { .. })
        ));
    }
}
