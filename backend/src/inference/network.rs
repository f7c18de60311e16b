use ndarray::Array4;
use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};

#[derive(Debug, thiserror::Error)]
pub enum NetworkError {
    #[error("Invalid input: {0}")]
    InvalidInput(String),
    #[error("Forward pass failed: {0}")]
    Forward(String),
}

/// A loaded classifier: NHWC batch in, flat output vector out.
pub trait Network: Send + Sync {
    fn forward(&self, input: &Array4<f32>) -> Result<Vec<f32>, NetworkError>;

    fn parameter_count(&self) -> u64;
}

/// Counts forward passes in which an attention layer fell back to returning its input.
#[derive(Debug, Clone, Default)]
pub struct DegradationCounter(Arc<AtomicU64>);

impl DegradationCounter {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn record(&self, layer: &str, reason: &str) {
        let count = self.0.fetch_add(1, Ordering::Relaxed) + 1;
        log::warn!(
            target: "hairscan::degradation",
            "event=attention_passthrough layer={} count={} reason={:?}",
            layer,
            count,
            reason
        );
    }

    pub fn count(&self) -> u64 {
        self.0.load(Ordering::Relaxed)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn clones_share_the_count() {
        let counter = DegradationCounter::new();
        let clone = counter.clone();
        clone.record("attention", "shape error");
        counter.record("attention", "shape error");
        assert_eq!(counter.count(), 2);
        assert_eq!(clone.count(), 2);
    }
}
