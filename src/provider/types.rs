//! Core types shared by provider adapters.

use serde::{Deserialize, Serialize};

/// A cited source attached to a generation.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SourceRef {
    pub url: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub title: Option<String>,
}

impl SourceRef {
    pub fn new(url: impl Into<String>) -> Self {
        Self {
            url: url.into(),
            title: None,
        }
    }

    pub fn titled(url: impl Into<String>, title: impl Into<String>) -> Self {
        Self {
            url: url.into(),
            title: Some(title.into()),
        }
    }
}

/// Outcome of one provider call.
///
/// Adapters return `Err(ProviderError)` on failure; the `error` field is only
/// populated by the retry wrapper when it degrades to the empty-result
/// sentinel after exhausting its budget.
#[derive(Debug, Clone, Default, Serialize)]
pub struct Generation {
    pub text: String,
    pub latency_ms: Option<u64>,
    pub tokens_in: Option<u32>,
    pub tokens_out: Option<u32>,
    pub cost_usd: Option<f64>,
    pub sources: Vec<SourceRef>,
    pub error: Option<String>,
}

impl Generation {
    /// The empty-result sentinel: no text, no sources, error message set.
    pub fn failed(error: impl Into<String>) -> Self {
        Self {
            error: Some(error.into()),
            ..Default::default()
        }
    }

    /// Whether this generation is the degraded sentinel rather than a real
    /// (possibly empty) provider response.
    pub fn is_failed(&self) -> bool {
        self.error.is_some() && self.text.is_empty()
    }
}
