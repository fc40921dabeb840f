use crate::config::BatchingConfig;
use crate::domain::{Classification, ClassificationResult, Frame};
use crate::model::{InferenceError, InferenceModel};
use futures::FutureExt;
use std::{panic::AssertUnwindSafe, sync::Arc};
use thiserror::Error;
use tokio::{
    sync::{mpsc, oneshot},
    time::{Duration, Instant},
};
use uuid::Uuid;

#[derive(Error, Debug)]
pub enum ClassifierError {
    #[error("Batch classifier is no longer running")]
    Unavailable,
}

/// What a submission produced: either an acknowledgement that the frame is
/// waiting in the current batch, or the verdicts of the batch it closed.
#[derive(Debug)]
pub enum BatchOutcome {
    Pending(ClassificationResult),
    Flushed(Vec<ClassificationResult>),
}

struct Submission {
    frame: Frame,
    reply: oneshot::Sender<BatchOutcome>,
}

/// Handle to a batching worker task.
///
/// The batch itself lives inside the worker and is only ever touched there;
/// handles just enqueue frames. Dropping every handle stops the worker.
#[derive(Clone)]
pub struct BatchClassifier {
    tx: mpsc::Sender<Submission>,
}

impl BatchClassifier {
    pub fn spawn<M: InferenceModel>(config: BatchingConfig, model: Arc<M>) -> Self {
        let (tx, rx) = mpsc::channel(config.max_batch_size.max(1) * 2);
        let worker = BatchWorker::new(config, model);
        tokio::spawn(worker.run(rx));
        Self { tx }
    }

    pub async fn submit(&self, frame: Frame) -> Result<BatchOutcome, ClassifierError> {
        let (reply, outcome) = oneshot::channel();
        self.tx
            .send(Submission { frame, reply })
            .await
            .map_err(|_| ClassifierError::Unavailable)?;
        outcome.await.map_err(|_| ClassifierError::Unavailable)
    }
}

struct BatchWorker<M> {
    config: BatchingConfig,
    model: Arc<M>,
    batch: Vec<Frame>,
    batch_started: Option<Instant>,
}

impl<M: InferenceModel> BatchWorker<M> {
    fn new(config: BatchingConfig, model: Arc<M>) -> Self {
        let batch = Vec::with_capacity(config.max_batch_size);
        Self {
            config,
            model,
            batch,
            batch_started: None,
        }
    }

    async fn run(mut self, mut rx: mpsc::Receiver<Submission>) {
        while let Some(Submission { frame, reply }) = rx.recv().await {
            let Some(batch) = self.accept(frame) else {
                let _ = reply.send(BatchOutcome::Pending(ClassificationResult::pending()));
                continue;
            };

            // Inference runs off the worker so the next batch starts forming
            // while this one is being classified.
            let model = self.model.clone();
            let sampling_rate = self.config.sampling_rate;
            let reference_root = self.config.image_reference_root.clone();
            tokio::spawn(async move {
                let results = classify_batch(&*model, batch, sampling_rate, &reference_root).await;
                let _ = reply.send(BatchOutcome::Flushed(results));
            });
        }

        if !self.batch.is_empty() {
            tracing::debug!(
                "Batch classifier stopped with {} unflushed frames",
                self.batch.len()
            );
        }
    }

    /// Appends a frame and hands back the closed batch when a threshold is hit.
    fn accept(&mut self, frame: Frame) -> Option<Vec<Frame>> {
        let started = *self.batch_started.get_or_insert_with(Instant::now);
        self.batch.push(frame);

        let full = self.batch.len() >= self.config.max_batch_size;
        let expired = started.elapsed() >= Duration::from_millis(self.config.max_latency_ms);
        if !(full || expired) {
            return None;
        }

        self.batch_started = None;
        let next = Vec::with_capacity(self.config.max_batch_size);
        Some(std::mem::replace(&mut self.batch, next))
    }
}

async fn classify_batch<M: InferenceModel + ?Sized>(
    model: &M,
    frames: Vec<Frame>,
    sampling_rate: f64,
    reference_root: &str,
) -> Vec<ClassificationResult> {
    let expected = frames.len();
    // A panicking model must not take the batch down with it.
    let inferred = AssertUnwindSafe(model.infer(&frames)).catch_unwind().await;
    let verdicts = match inferred {
        Ok(Ok(verdicts)) if verdicts.len() == expected => Ok(verdicts),
        Ok(Ok(verdicts)) => Err(InferenceError::VerdictCountMismatch {
            expected,
            got: verdicts.len(),
        }),
        Ok(Err(e)) => Err(e),
        Err(_) => Err(InferenceError::ModelFailed("model panicked".to_string())),
    };

    let verdicts = verdicts.unwrap_or_else(|e| {
        tracing::warn!("Inference failed, rejecting {} frames: {}", expected, e);
        vec![Classification::Reject; expected]
    });

    verdicts
        .into_iter()
        .map(|classification| {
            let id = Uuid::new_v4().to_string();
            let sampled = rand::random::<f64>() < sampling_rate;
            let image_reference = if sampled {
                None
            } else {
                Some(format!("{}/{}.jpg", reference_root, id))
            };
            ClassificationResult {
                id,
                classification,
                sampled,
                image_reference,
            }
        })
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::testing::{FailingModel, FixedModel, PanickingModel, ParityModel, SlowModel};

    fn batching(max_batch_size: usize, max_latency_ms: u64, sampling_rate: f64) -> BatchingConfig {
        BatchingConfig {
            max_batch_size,
            max_latency_ms,
            sampling_rate,
            image_reference_root: "images".to_string(),
        }
    }

    fn frame(sequence: u64) -> Frame {
        Frame::new(sequence, vec![sequence as u8; 4])
    }

    #[tokio::test]
    async fn test_flushes_exactly_once_when_size_reached() {
        let classifier = BatchClassifier::spawn(
            batching(4, 60_000, 0.0),
            Arc::new(FixedModel(Classification::Accept)),
        );

        let mut flushes = Vec::new();
        for i in 0..10 {
            match classifier.submit(frame(i)).await.unwrap() {
                BatchOutcome::Pending(ack) => {
                    assert_eq!(ack.classification, Classification::Pending)
                }
                BatchOutcome::Flushed(results) => flushes.push((i, results.len())),
            }
        }

        assert_eq!(flushes, vec![(3, 4), (7, 4)]);
    }

    #[tokio::test]
    async fn test_results_keep_arrival_order() {
        let classifier = BatchClassifier::spawn(batching(6, 60_000, 0.0), Arc::new(ParityModel));

        let mut flushed = None;
        for i in 0..6 {
            if let BatchOutcome::Flushed(results) = classifier.submit(frame(i)).await.unwrap() {
                flushed = Some(results);
            }
        }

        let verdicts: Vec<_> = flushed
            .unwrap()
            .into_iter()
            .map(|r| r.classification)
            .collect();
        assert_eq!(
            verdicts,
            vec![
                Classification::Accept,
                Classification::Reject,
                Classification::Accept,
                Classification::Reject,
                Classification::Accept,
                Classification::Reject,
            ]
        );
    }

    #[tokio::test]
    async fn test_latency_flush_below_size_threshold() {
        let classifier = BatchClassifier::spawn(
            batching(100, 20, 0.0),
            Arc::new(FixedModel(Classification::Accept)),
        );

        assert!(matches!(
            classifier.submit(frame(0)).await.unwrap(),
            BatchOutcome::Pending(_)
        ));
        tokio::time::sleep(Duration::from_millis(40)).await;

        match classifier.submit(frame(1)).await.unwrap() {
            BatchOutcome::Flushed(results) => assert_eq!(results.len(), 2),
            BatchOutcome::Pending(_) => panic!("expected a latency flush"),
        }
    }

    #[tokio::test]
    async fn test_flushed_batches_never_exceed_max_size() {
        let classifier = BatchClassifier::spawn(
            batching(5, 15, 0.0),
            Arc::new(FixedModel(Classification::Reject)),
        );

        let mut total = 0;
        for i in 0..40u64 {
            if i % 7 == 0 {
                tokio::time::sleep(Duration::from_millis(20)).await;
            }
            if let BatchOutcome::Flushed(results) = classifier.submit(frame(i)).await.unwrap() {
                assert!(!results.is_empty());
                assert!(results.len() <= 5);
                total += results.len();
            }
        }
        assert!(total <= 40);
    }

    #[tokio::test]
    async fn test_sampled_results_drop_image_reference() {
        let sampled_all = BatchClassifier::spawn(
            batching(3, 60_000, 1.0),
            Arc::new(FixedModel(Classification::Accept)),
        );
        let sampled_none = BatchClassifier::spawn(
            batching(3, 60_000, 0.0),
            Arc::new(FixedModel(Classification::Accept)),
        );

        for i in 0..2 {
            sampled_all.submit(frame(i)).await.unwrap();
            sampled_none.submit(frame(i)).await.unwrap();
        }

        let BatchOutcome::Flushed(results) = sampled_all.submit(frame(2)).await.unwrap() else {
            panic!("expected a flush");
        };
        assert!(results
            .iter()
            .all(|r| r.sampled && r.image_reference.is_none()));

        let BatchOutcome::Flushed(results) = sampled_none.submit(frame(2)).await.unwrap() else {
            panic!("expected a flush");
        };
        for result in results {
            assert!(!result.sampled);
            assert_eq!(
                result.image_reference,
                Some(format!("images/{}.jpg", result.id))
            );
        }
    }

    #[tokio::test]
    async fn test_failed_inference_rejects_every_frame() {
        let classifier = BatchClassifier::spawn(batching(3, 60_000, 0.0), Arc::new(FailingModel));

        classifier.submit(frame(0)).await.unwrap();
        classifier.submit(frame(1)).await.unwrap();
        let BatchOutcome::Flushed(results) = classifier.submit(frame(2)).await.unwrap() else {
            panic!("expected a flush");
        };

        assert_eq!(results.len(), 3);
        assert!(results
            .iter()
            .all(|r| r.classification == Classification::Reject));
    }

    #[tokio::test]
    async fn test_panicking_model_rejects_every_frame() {
        let classifier = BatchClassifier::spawn(batching(2, 60_000, 0.0), Arc::new(PanickingModel));

        classifier.submit(frame(0)).await.unwrap();
        let BatchOutcome::Flushed(results) = classifier.submit(frame(1)).await.unwrap() else {
            panic!("expected a flush");
        };
        assert_eq!(results.len(), 2);
        assert!(results
            .iter()
            .all(|r| r.classification == Classification::Reject));

        // The worker survives and keeps batching.
        classifier.submit(frame(2)).await.unwrap();
        let BatchOutcome::Flushed(results) = classifier.submit(frame(3)).await.unwrap() else {
            panic!("expected a flush");
        };
        assert_eq!(results.len(), 2);
    }

    #[tokio::test]
    async fn test_next_batch_forms_during_inference() {
        let classifier = BatchClassifier::spawn(
            batching(2, 60_000, 0.0),
            Arc::new(SlowModel(Duration::from_millis(300))),
        );

        let first = classifier.clone();
        let flushing = tokio::spawn(async move {
            first.submit(frame(0)).await.unwrap();
            first.submit(frame(1)).await.unwrap()
        });
        tokio::time::sleep(Duration::from_millis(30)).await;

        let started = Instant::now();
        let outcome = classifier.submit(frame(2)).await.unwrap();
        assert!(matches!(outcome, BatchOutcome::Pending(_)));
        assert!(started.elapsed() < Duration::from_millis(200));

        assert!(matches!(
            flushing.await.unwrap(),
            BatchOutcome::Flushed(ref results) if results.len() == 2
        ));
    }
}
