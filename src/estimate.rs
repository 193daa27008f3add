use serde_json::Value;

/// Requested fidelity for image token accounting.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum ImageDetail {
    Low,
    #[default]
    High,
}

/// Token estimation seam. The bundled heuristic is chars/4 — good enough for
/// budget trend detection; providers with exact tokenizers can override.
pub trait TokenEstimator: Send + Sync {
    fn estimate_text(&self, text: &str) -> u32;

    /// JSON-serialize, then estimate.
    fn estimate_data(&self, value: &Value) -> u32 {
        self.estimate_text(&value.to_string())
    }

    fn estimate_image(&self, width: Option<u32>, height: Option<u32>, detail: ImageDetail) -> u32 {
        match detail {
            ImageDetail::Low => 85,
            ImageDetail::High => match (width, height) {
                (Some(w), Some(h)) => 85 + 170 * w.div_ceil(512) * h.div_ceil(512),
                _ => 1000,
            },
        }
    }
}

/// The default chars/4 estimator.
#[derive(Debug, Clone, Copy, Default)]
pub struct HeuristicEstimator;

impl TokenEstimator for HeuristicEstimator {
    fn estimate_text(&self, text: &str) -> u32 {
        (text.len() as u32) / 4
    }
}
