//! Export registry for the explainer surface
//!
//! The crate publishes a fixed list of explainer names. Optional groups
//! (currently only SHAP) are appended when their loader succeeds. A loader
//! reporting [`LoadError::DependencyUnavailable`] is skipped silently; any
//! other loader failure is returned to the caller.

use crate::error::{ExplainError, Result};
use std::fmt;
use std::sync::OnceLock;

/// Failure reported by an optional export loader
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum LoadError {
    /// The group's dependency is not available in this build
    DependencyUnavailable {
        group: &'static str,
        dependency: &'static str,
    },
    /// The group is present but failed to load
    Failed { group: &'static str, reason: String },
}

impl fmt::Display for LoadError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            LoadError::DependencyUnavailable { group, dependency } => {
                write!(f, "group '{}' requires unavailable dependency '{}'", group, dependency)
            }
            LoadError::Failed { group, reason } => {
                write!(f, "group '{}' failed to load: {}", group, reason)
            }
        }
    }
}

impl std::error::Error for LoadError {}

/// Outcome of a single loader call
pub type LoadResult = std::result::Result<&'static [&'static str], LoadError>;

/// Ordered list of exported names
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ExportRegistry {
    names: Vec<&'static str>,
}

impl ExportRegistry {
    /// Create a registry holding the base names in the given order
    pub fn new(base: &[&'static str]) -> Self {
        Self {
            names: base.to_vec(),
        }
    }

    /// Attempt to register an optional group.
    ///
    /// Returns `Ok(true)` when the names were appended and `Ok(false)` when the
    /// group's dependency is unavailable. Any other loader failure is
    /// returned as [`ExplainError::Registration`] and the registry is left
    /// untouched.
    pub fn try_register<L>(&mut self, group: &'static str, loader: L) -> Result<bool>
    where
        L: FnOnce() -> LoadResult,
    {
        match loader() {
            Ok(names) => {
                for name in names {
                    if !self.names.contains(name) {
                        self.names.push(name);
                    }
                }
                Ok(true)
            }
            Err(LoadError::DependencyUnavailable { .. }) => Ok(false),
            Err(LoadError::Failed { reason, .. }) => Err(ExplainError::Registration {
                group: group.to_string(),
                reason,
            }),
        }
    }

    /// Exported names in registration order
    pub fn names(&self) -> &[&'static str] {
        &self.names
    }

    /// Check whether a name is exported
    pub fn contains(&self, name: &str) -> bool {
        self.names.iter().any(|n| *n == name)
    }

    /// Number of exported names
    pub fn len(&self) -> usize {
        self.names.len()
    }

    /// Whether the registry is empty
    pub fn is_empty(&self) -> bool {
        self.names.is_empty()
    }

    /// Consume the registry, returning the names
    pub fn into_names(self) -> Vec<&'static str> {
        self.names
    }
}

/// An optional export group and its loader
pub struct OptionalGroup {
    /// Group name, used in error reports
    pub name: &'static str,
    /// Loader returning the group's names
    pub loader: fn() -> LoadResult,
}

/// Build a registry from base names and a sequence of optional groups.
///
/// Each group is attempted independently, in order.
pub fn load_exports_with(
    base: &[&'static str],
    groups: &[OptionalGroup],
) -> Result<ExportRegistry> {
    let mut registry = ExportRegistry::new(base);
    for group in groups {
        registry.try_register(group.name, group.loader)?;
    }
    Ok(registry)
}

/// Build the crate's export registry
pub fn load_exports() -> Result<ExportRegistry> {
    load_exports_with(crate::explainers::BASE_EXPORTS, &crate::explainers::optional_groups())
}

static EXPORTS: OnceLock<Vec<&'static str>> = OnceLock::new();

/// Process-wide exported names, computed on first use
pub fn exported_names() -> Result<&'static [&'static str]> {
    if let Some(names) = EXPORTS.get() {
        return Ok(names.as_slice());
    }
    let names = load_exports()?.into_names();
    Ok(EXPORTS.get_or_init(|| names).as_slice())
}
