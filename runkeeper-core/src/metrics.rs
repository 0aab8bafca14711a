//! Evaluation metric interface.
//!
//! A run receives its metrics at construction and applies them in its own
//! validation step; the controller only carries them.

/// A named scalar metric over paired predictions and targets.
pub trait Metric: Send + Sync {
    fn name(&self) -> &str;

    fn compute(&self, output: &[f32], target: &[f32]) -> f64;
}
