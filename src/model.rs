use crate::domain::{Classification, Frame};
use async_trait::async_trait;
use rand::Rng;
use std::time::Duration;
use thiserror::Error;

#[derive(Error, Debug)]
pub enum InferenceError {
    #[error("Model failed: {0}")]
    ModelFailed(String),
    #[error("Model returned {got} verdicts for a batch of {expected}")]
    VerdictCountMismatch { expected: usize, got: usize },
}

/// Batch-in, verdicts-out boundary around whatever model does the sorting.
///
/// Implementations must return exactly one verdict per frame, in the order
/// the frames were given.
#[async_trait]
pub trait InferenceModel: Send + Sync + 'static {
    async fn infer(&self, frames: &[Frame]) -> Result<Vec<Classification>, InferenceError>;
}

/// Stand-in model used until a real one is plugged in.
///
/// Cost scales with batch size so load tests see realistic flush latency.
#[derive(Debug, Clone)]
pub struct MockModel {
    accept_rate: f64,
    min_cost: Duration,
    max_cost: Duration,
}

impl MockModel {
    pub fn new(accept_rate: f64) -> Self {
        Self {
            accept_rate,
            min_cost: Duration::from_millis(1),
            max_cost: Duration::from_millis(5),
        }
    }

    fn batch_cost(&self, batch_len: usize) -> Duration {
        let per_frame = rand::rng().random_range(self.min_cost..=self.max_cost);
        per_frame * batch_len as u32
    }
}

impl Default for MockModel {
    fn default() -> Self {
        Self::new(0.8)
    }
}

#[async_trait]
impl InferenceModel for MockModel {
    async fn infer(&self, frames: &[Frame]) -> Result<Vec<Classification>, InferenceError> {
        tokio::time::sleep(self.batch_cost(frames.len())).await;

        let verdicts = frames
            .iter()
            .map(|_| {
                if rand::random::<f64>() < self.accept_rate {
                    Classification::Accept
                } else {
                    Classification::Reject
                }
            })
            .collect();

        Ok(verdicts)
    }
}
