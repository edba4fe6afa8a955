//! Kolosal Explain - Model explainability for black-box predictors
//!
//! This crate explains models given only as prediction functions:
//! - [`Ale`] / [`plot_ale`] - Accumulated local effects and plot panels
//! - [`AnchorTabular`], [`AnchorText`], [`AnchorImage`] - Anchor rules
//! - [`Cem`] - Contrastive explanations (pertinent negatives and positives)
//! - [`CounterFactual`], [`CounterFactualProto`] - Counterfactual search
//! - [`IntegratedGradients`] - Path-integrated attributions
//! - `KernelShap`, `TreeShap` - Shapley values (`shap` feature)
//!
//! # Modules
//!
//! - [`explainers`] - All explainer implementations
//! - [`registry`] - Ordered list of exported explainer names
//! - [`models`] - Linear model used by the CLI and tests
//! - [`config`] - Aggregate JSON configuration
//! - [`utils`] - CSV loading into feature matrices
//! - [`cli`] - Command-line interface

pub mod error;

pub mod config;
pub mod explainers;
pub mod models;
pub mod registry;
pub mod utils;

pub mod cli;

pub use config::ExplainConfig;
pub use error::{ExplainError, Result};
pub use explainers::*;
pub use registry::{exported_names, load_exports, ExportRegistry, LoadError};

/// Re-export commonly used types
pub mod prelude {
    // Error handling
    pub use crate::error::{ExplainError, Result};

    // Configuration
    pub use crate::config::ExplainConfig;

    // Explainers
    pub use crate::explainers::{
        plot_ale, Ale, AleConfig, AleExplanation, AnchorConfig, AnchorExplanation, AnchorImage,
        AnchorTabular, AnchorText, Cem, CemConfig, CemMode, CounterFactual, CounterFactualProto,
        CounterfactualConfig, CounterfactualProtoConfig, DistributedAnchorTabular,
        IntegratedGradients, IntegratedGradientsConfig, Target, TargetSelection,
    };

    // SHAP
    #[cfg(feature = "shap")]
    pub use crate::explainers::{KernelShap, KernelShapConfig, ShapExplanation, TreeEnsemble, TreeShap};

    // Models and data
    pub use crate::models::{LinearModel, LinkFunction};
    pub use crate::utils::{DataLoader, Dataset};

    // Registry
    pub use crate::registry::{exported_names, load_exports};
}
