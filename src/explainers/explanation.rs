//! Metadata shared by explanation results

use serde::{Deserialize, Serialize};
use tracing::warn;

/// Scope of an explanation
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ExplanationKind {
    /// Explains a single prediction
    Local,
    /// Explains model behaviour over a dataset
    Global,
}

/// Metadata attached to every explanation
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ExplanationMeta {
    /// Explainer name, as exported
    pub name: String,
    /// Explanation scopes
    pub kind: Vec<ExplanationKind>,
    /// Parameters the explainer ran with
    pub params: serde_json::Value,
}

impl ExplanationMeta {
    pub(crate) fn new<P: Serialize>(name: &str, kind: &[ExplanationKind], params: &P) -> Self {
        Self {
            name: name.to_string(),
            kind: kind.to_vec(),
            params: serde_json::to_value(params).unwrap_or_else(|e| {
                warn!(explainer = name, error = %e, "Failed to serialize explainer parameters");
                serde_json::Value::Null
            }),
        }
    }

    /// Local-only metadata
    pub(crate) fn local<P: Serialize>(name: &str, params: &P) -> Self {
        Self::new(name, &[ExplanationKind::Local], params)
    }

    /// Global-only metadata
    pub(crate) fn global<P: Serialize>(name: &str, params: &P) -> Self {
        Self::new(name, &[ExplanationKind::Global], params)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[derive(Serialize)]
    struct Params {
        n_steps: usize,
    }

    #[test]
    fn test_meta_serializes_params() {
        let meta = ExplanationMeta::local("IntegratedGradients", &Params { n_steps: 50 });
        assert_eq!(meta.params["n_steps"], 50);
        let json = serde_json::to_string(&meta).unwrap();
        assert!(json.contains("\"local\""));
    }

    struct Unserializable;

    impl Serialize for Unserializable {
        fn serialize<S: serde::Serializer>(&self, _: S) -> std::result::Result<S::Ok, S::Error> {
            Err(serde::ser::Error::custom("not serializable"))
        }
    }

    #[test]
    fn test_meta_params_null_on_serialization_failure() {
        let meta = ExplanationMeta::global("ALE", &Unserializable);
        assert_eq!(meta.params, serde_json::Value::Null);
        assert_eq!(meta.kind, vec![ExplanationKind::Global]);
    }
}
