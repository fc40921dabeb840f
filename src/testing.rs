//! Fakes shared by the unit test suites.

use crate::camera::{FrameSource, FrameSourceError};
use crate::config::DatabaseConfig;
use crate::connection::{Outbound, Transport, TransportError};
use crate::domain::{Classification, ClassificationRecord, Frame, Session};
use crate::model::{InferenceError, InferenceModel};
use crate::store::{ResultStore, SessionStore, SqliteStore, StoreError};
use async_trait::async_trait;
use parking_lot::Mutex;
use std::sync::{
    atomic::{AtomicUsize, Ordering},
    Arc,
};
use std::time::Duration;

pub async fn memory_store() -> SqliteStore {
    SqliteStore::connect(&DatabaseConfig {
        url: "sqlite::memory:".to_string(),
        max_connections: 1,
    })
    .await
    .unwrap()
}

#[derive(Default)]
struct LogState {
    messages: Vec<Outbound>,
    closes: Vec<(u16, String)>,
}

/// Everything a recording transport saw, readable after the transport moved.
#[derive(Clone, Default)]
pub struct TransportLog {
    inner: Arc<Mutex<LogState>>,
}

impl TransportLog {
    pub fn messages(&self) -> Vec<Outbound> {
        self.inner.lock().messages.clone()
    }

    pub fn closes(&self) -> Vec<(u16, String)> {
        self.inner.lock().closes.clone()
    }

    pub fn results(&self) -> Vec<serde_json::Value> {
        self.messages()
            .into_iter()
            .filter_map(|m| match m {
                Outbound::Text(text) => serde_json::from_str(&text).ok(),
                _ => None,
            })
            .collect()
    }

    pub fn binary_count(&self) -> usize {
        self.messages()
            .iter()
            .filter(|m| matches!(m, Outbound::Binary(_)))
            .count()
    }
}

/// Records what it is sent. A send budget makes it fail once spent.
pub struct RecordingTransport {
    log: TransportLog,
    sends_left: Option<usize>,
    closed: bool,
}

impl RecordingTransport {
    pub fn new(log: TransportLog) -> Self {
        Self {
            log,
            sends_left: None,
            closed: false,
        }
    }

    pub fn failing(log: TransportLog) -> Self {
        Self::failing_after(log, 0)
    }

    pub fn failing_after(log: TransportLog, sends: usize) -> Self {
        Self {
            log,
            sends_left: Some(sends),
            closed: false,
        }
    }
}

#[async_trait]
impl Transport for RecordingTransport {
    async fn send(&mut self, message: Outbound) -> Result<(), TransportError> {
        if self.closed {
            return Err(TransportError::Closed);
        }
        match &mut self.sends_left {
            Some(0) => return Err(TransportError::SendFailed("peer reset".to_string())),
            Some(left) => *left -= 1,
            None => {}
        }
        self.log.inner.lock().messages.push(message);
        Ok(())
    }

    async fn close(&mut self, code: u16, reason: &str) -> Result<(), TransportError> {
        if self.closed || self.sends_left == Some(0) {
            return Err(TransportError::Closed);
        }
        self.closed = true;
        self.log.inner.lock().closes.push((code, reason.to_string()));
        Ok(())
    }
}

/// Yields a fixed number of frames, then either waits forever or fails.
pub struct ScriptedSource {
    remaining: usize,
    sequence: u64,
    fail_when_empty: bool,
    releases: Arc<AtomicUsize>,
}

impl ScriptedSource {
    pub fn new(frames: usize) -> (Self, Arc<AtomicUsize>) {
        let releases = Arc::new(AtomicUsize::new(0));
        let source = Self {
            remaining: frames,
            sequence: 0,
            fail_when_empty: false,
            releases: releases.clone(),
        };
        (source, releases)
    }

    pub fn failing_after(frames: usize) -> (Self, Arc<AtomicUsize>) {
        let (mut source, releases) = Self::new(frames);
        source.fail_when_empty = true;
        (source, releases)
    }
}

#[async_trait]
impl FrameSource for ScriptedSource {
    async fn next_frame(&mut self) -> Result<Frame, FrameSourceError> {
        if self.remaining == 0 {
            if self.fail_when_empty {
                return Err(FrameSourceError::ReadFrameFailed("device unplugged".to_string()));
            }
            std::future::pending::<()>().await;
        }
        self.remaining -= 1;
        let frame = Frame::new(self.sequence, vec![self.sequence as u8; 16]);
        self.sequence += 1;
        Ok(frame)
    }

    fn release(&mut self) {
        self.releases.fetch_add(1, Ordering::SeqCst);
    }
}

pub struct FixedModel(pub Classification);

#[async_trait]
impl InferenceModel for FixedModel {
    async fn infer(&self, frames: &[Frame]) -> Result<Vec<Classification>, InferenceError> {
        Ok(vec![self.0; frames.len()])
    }
}

/// Accepts even sequence numbers and rejects odd ones.
pub struct ParityModel;

#[async_trait]
impl InferenceModel for ParityModel {
    async fn infer(&self, frames: &[Frame]) -> Result<Vec<Classification>, InferenceError> {
        Ok(frames
            .iter()
            .map(|f| {
                if f.sequence % 2 == 0 {
                    Classification::Accept
                } else {
                    Classification::Reject
                }
            })
            .collect())
    }
}

pub struct FailingModel;

#[async_trait]
impl InferenceModel for FailingModel {
    async fn infer(&self, _frames: &[Frame]) -> Result<Vec<Classification>, InferenceError> {
        Err(InferenceError::ModelFailed("out of device memory".to_string()))
    }
}

pub struct PanickingModel;

#[async_trait]
impl InferenceModel for PanickingModel {
    async fn infer(&self, _frames: &[Frame]) -> Result<Vec<Classification>, InferenceError> {
        panic!("inference kernel crashed");
    }
}

pub struct SlowModel(pub Duration);

#[async_trait]
impl InferenceModel for SlowModel {
    async fn infer(&self, frames: &[Frame]) -> Result<Vec<Classification>, InferenceError> {
        tokio::time::sleep(self.0).await;
        Ok(vec![Classification::Accept; frames.len()])
    }
}

/// Result store whose commits always fail, counting the attempts.
#[derive(Clone, Default)]
pub struct BrokenResultStore {
    pub attempts: Arc<AtomicUsize>,
}

#[async_trait]
impl ResultStore for BrokenResultStore {
    async fn append(&self, _records: &[ClassificationRecord]) -> Result<(), StoreError> {
        self.attempts.fetch_add(1, Ordering::SeqCst);
        Err(StoreError::Database(sqlx::Error::PoolClosed))
    }
}

/// Session store whose lookups always fail.
pub struct BrokenSessionStore;

#[async_trait]
impl SessionStore for BrokenSessionStore {
    async fn resolve(&self, _session_id: &str) -> Result<Option<Session>, StoreError> {
        Err(StoreError::Database(sqlx::Error::PoolClosed))
    }
}
