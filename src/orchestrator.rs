use crate::camera::{CaptureGuard, FrameSource, FrameSourceError};
use crate::classifier::{BatchClassifier, BatchOutcome};
use crate::config::{BatchingConfig, Config};
use crate::connection::{
    ConnectionId, ConnectionManager, Outbound, SessionSnapshot, Transport, GOING_AWAY,
    INTERNAL_ERROR, NORMAL_CLOSURE, POLICY_VIOLATION,
};
use crate::domain::{ClassificationRecord, Frame, Session};
use crate::model::InferenceModel;
use crate::store::{ResultStore, SessionStore};
use crate::telemetry::Metrics;
use chrono::Utc;
use futures::{Stream, StreamExt};
use std::sync::Arc;
use tokio::{
    sync::broadcast::{self, error::RecvError},
    time::{interval, interval_at, Duration, Instant, Interval, MissedTickBehavior},
};
use tracing::instrument;
use uuid::Uuid;

/// Out-of-band instructions fanned out to every running stream.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ControlSignal {
    SessionStopped(Uuid),
    Shutdown,
}

/// What the client side of the socket told us.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ClientEvent {
    Activity,
    Closed,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum StreamState {
    Validating,
    Connected,
    Streaming,
    Closing,
    Closed,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SessionInvalid {
    NotFound,
    NotActive,
}

/// Why a stream ended. Every variant maps to the close code sent to the client.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum StreamExit {
    Rejected(SessionInvalid),
    LookupFailed(String),
    ClientDisconnected,
    SessionStopped,
    Shutdown,
    DeviceFailure(String),
    Internal(String),
}

impl StreamExit {
    pub fn close_code(&self) -> u16 {
        match self {
            StreamExit::Rejected(_) => POLICY_VIOLATION,
            StreamExit::ClientDisconnected | StreamExit::SessionStopped => NORMAL_CLOSURE,
            StreamExit::Shutdown => GOING_AWAY,
            StreamExit::LookupFailed(_) | StreamExit::DeviceFailure(_) | StreamExit::Internal(_) => {
                INTERNAL_ERROR
            }
        }
    }

    pub fn reason(&self) -> &'static str {
        match self {
            StreamExit::Rejected(SessionInvalid::NotFound) => "Session not found",
            StreamExit::Rejected(SessionInvalid::NotActive) => "Session is not active",
            StreamExit::LookupFailed(_) => "Session lookup failed",
            StreamExit::ClientDisconnected => "Client disconnected",
            StreamExit::SessionStopped => "Session stopped",
            StreamExit::Shutdown => "Server shutting down",
            StreamExit::DeviceFailure(_) => "Frame source failed",
            StreamExit::Internal(_) => "Internal error",
        }
    }
}

#[derive(Debug, Clone)]
pub struct StreamSettings {
    pub batching: BatchingConfig,
    pub frame_interval: Duration,
    pub ping_interval: Duration,
}

impl StreamSettings {
    pub fn from_config(config: &Config) -> Self {
        Self {
            batching: config.batching.clone(),
            frame_interval: Duration::from_millis(config.camera.get_frame_delay_ms()),
            ping_interval: Duration::from_secs(config.websocket.ping_interval_secs.max(1)),
        }
    }
}

/// Drives one (session, connection) pair from handshake to close.
///
/// Each call to [`StreamOrchestrator::run`] owns its own classifier and
/// connection scope; only the stores are shared between streams.
pub struct StreamOrchestrator<S, P, M> {
    sessions: Arc<S>,
    results: Arc<P>,
    model: Arc<M>,
    settings: StreamSettings,
    metrics: Arc<Metrics>,
}

impl<S, P, M> Clone for StreamOrchestrator<S, P, M> {
    fn clone(&self) -> Self {
        Self {
            sessions: self.sessions.clone(),
            results: self.results.clone(),
            model: self.model.clone(),
            settings: self.settings.clone(),
            metrics: self.metrics.clone(),
        }
    }
}

fn transition(state: &mut StreamState, next: StreamState) {
    tracing::debug!("Stream state {:?} -> {:?}", state, next);
    *state = next;
}

impl<S: SessionStore, P: ResultStore, M: InferenceModel> StreamOrchestrator<S, P, M> {
    pub fn new(
        sessions: Arc<S>,
        results: Arc<P>,
        model: Arc<M>,
        settings: StreamSettings,
        metrics: Arc<Metrics>,
    ) -> Self {
        Self {
            sessions,
            results,
            model,
            settings,
            metrics,
        }
    }

    #[instrument(skip_all, fields(session_id = %session_id))]
    pub async fn run<T, E, F, O>(
        &self,
        session_id: &str,
        mut transport: T,
        mut inbound: E,
        open_source: O,
        mut control: broadcast::Receiver<ControlSignal>,
    ) -> StreamExit
    where
        T: Transport,
        E: Stream<Item = ClientEvent> + Unpin + Send,
        F: FrameSource,
        O: FnOnce() -> Result<F, FrameSourceError> + Send,
    {
        let mut state = StreamState::Validating;

        let session = match self.validate(session_id).await {
            Ok(session) => session,
            Err(exit) => {
                tracing::warn!("Refusing stream: {:?}", exit);
                if let Err(e) = transport.close(exit.close_code(), exit.reason()).await {
                    tracing::debug!("Ignoring close error on refused stream: {}", e);
                }
                transition(&mut state, StreamState::Closed);
                return exit;
            }
        };

        transition(&mut state, StreamState::Connected);
        let mut manager = ConnectionManager::new();
        let connection = manager.connect(transport, SessionSnapshot::from(&session));
        tracing::info!("Stream connected for lot {}", session.lot_id);

        let mut capture = match open_source() {
            Ok(source) => CaptureGuard::new(source),
            Err(e) => {
                tracing::error!("Failed to open frame source: {}", e);
                let exit = StreamExit::DeviceFailure(e.to_string());
                transition(&mut state, StreamState::Closing);
                manager.close(connection, exit.close_code(), exit.reason()).await;
                transition(&mut state, StreamState::Closed);
                return exit;
            }
        };
        let classifier = BatchClassifier::spawn(self.settings.batching.clone(), self.model.clone());

        transition(&mut state, StreamState::Streaming);
        self.metrics.stream_opened();
        let exit = self
            .stream(
                session.id,
                &mut manager,
                connection,
                &mut capture,
                &classifier,
                &mut inbound,
                &mut control,
            )
            .await;

        transition(&mut state, StreamState::Closing);
        tracing::info!("Closing stream: {:?}", exit);
        manager.close(connection, exit.close_code(), exit.reason()).await;
        capture.release();
        self.metrics.stream_closed();

        transition(&mut state, StreamState::Closed);
        exit
    }

    async fn validate(&self, session_id: &str) -> Result<Session, StreamExit> {
        let exit = match self.sessions.resolve(session_id).await {
            Ok(Some(session)) if session.is_active() => return Ok(session),
            Ok(Some(_)) => StreamExit::Rejected(SessionInvalid::NotActive),
            Ok(None) => StreamExit::Rejected(SessionInvalid::NotFound),
            Err(e) => StreamExit::LookupFailed(e.to_string()),
        };

        let label = match &exit {
            StreamExit::Rejected(SessionInvalid::NotActive) => "not_active",
            StreamExit::Rejected(SessionInvalid::NotFound) => "not_found",
            _ => "lookup_failed",
        };
        self.metrics.record_rejected_connection(label);
        Err(exit)
    }

    #[allow(clippy::too_many_arguments)]
    async fn stream<T, E, F>(
        &self,
        session_id: Uuid,
        manager: &mut ConnectionManager<T>,
        connection: ConnectionId,
        capture: &mut CaptureGuard<F>,
        classifier: &BatchClassifier,
        inbound: &mut E,
        control: &mut broadcast::Receiver<ControlSignal>,
    ) -> StreamExit
    where
        T: Transport,
        E: Stream<Item = ClientEvent> + Unpin + Send,
        F: FrameSource,
    {
        let mut frames = interval(self.settings.frame_interval);
        frames.set_missed_tick_behavior(MissedTickBehavior::Delay);
        let ping_interval = self.settings.ping_interval;
        let mut pings = interval_at(Instant::now() + ping_interval, ping_interval);

        loop {
            tokio::select! {
                signal = control.recv() => match signal {
                    Ok(ControlSignal::SessionStopped(id)) if id == session_id => {
                        return StreamExit::SessionStopped;
                    }
                    Ok(ControlSignal::SessionStopped(_)) => {}
                    Ok(ControlSignal::Shutdown) | Err(RecvError::Closed) => {
                        return StreamExit::Shutdown;
                    }
                    Err(RecvError::Lagged(skipped)) => {
                        tracing::warn!("Control channel lagged, skipped {} signals", skipped);
                        // A skipped signal may have been this session's stop.
                        if !self.still_active(session_id).await {
                            return StreamExit::SessionStopped;
                        }
                    }
                },
                event = inbound.next() => match event {
                    Some(ClientEvent::Activity) => manager.record_activity(connection),
                    Some(ClientEvent::Closed) | None => return StreamExit::ClientDisconnected,
                },
                _ = pings.tick() => {
                    manager.ping_all().await;
                    if !manager.is_registered(connection) {
                        return StreamExit::ClientDisconnected;
                    }
                }
                frame = next_paced_frame(&mut frames, capture) => {
                    let frame = match frame {
                        Ok(frame) => frame,
                        Err(e) => {
                            tracing::error!("Frame source failed: {}", e);
                            return StreamExit::DeviceFailure(e.to_string());
                        }
                    };
                    if let Err(exit) = self
                        .process_frame(session_id, manager, connection, classifier, frame)
                        .await
                    {
                        return exit;
                    }
                }
            }
        }
    }

    async fn still_active(&self, session_id: Uuid) -> bool {
        match self.sessions.resolve(&session_id.to_string()).await {
            Ok(session) => session.is_some_and(|s| s.is_active()),
            Err(e) => {
                tracing::warn!("Could not re-check session status: {}", e);
                true
            }
        }
    }

    /// Fans a frame out, classifies it, then delivers and persists any
    /// flushed results.
    async fn process_frame<T: Transport>(
        &self,
        session_id: Uuid,
        manager: &mut ConnectionManager<T>,
        connection: ConnectionId,
        classifier: &BatchClassifier,
        frame: Frame,
    ) -> Result<(), StreamExit> {
        self.metrics.record_frame();

        manager.broadcast_bytes(frame.data.clone()).await;
        if !manager.is_registered(connection) {
            return Err(StreamExit::ClientDisconnected);
        }

        let submitted = Instant::now();
        let outcome = classifier
            .submit(frame)
            .await
            .map_err(|e| StreamExit::Internal(e.to_string()))?;
        let BatchOutcome::Flushed(results) = outcome else {
            return Ok(());
        };
        self.metrics
            .record_flush(results.len(), submitted.elapsed().as_millis() as u64);

        let mut staged = Vec::with_capacity(results.len());
        let mut disconnected = false;
        for result in results {
            let payload = match serde_json::to_string(&result) {
                Ok(payload) => payload,
                Err(e) => {
                    tracing::warn!("Skipping result {}: {}", result.id, e);
                    continue;
                }
            };
            if manager.send(connection, Outbound::Text(payload)).await.is_err() {
                disconnected = true;
                break;
            }
            staged.push(result.into_record(session_id, Utc::now()));
        }

        self.commit(&staged).await;
        if disconnected {
            return Err(StreamExit::ClientDisconnected);
        }
        Ok(())
    }

    /// Commits one tick's records. Delivered messages are not retracted when
    /// this fails, so the client may have seen results that were never stored.
    async fn commit(&self, staged: &[ClassificationRecord]) {
        if staged.is_empty() {
            return;
        }
        if let Err(e) = self.results.append(staged).await {
            self.metrics.record_persistence_failure();
            tracing::error!(
                "Rolled back {} results after commit failure: {}",
                staged.len(),
                e
            );
        }
    }
}

/// Waits for the next cadence slot, then pulls a frame. Dropping this future
/// mid-read abandons the read without losing the source.
async fn next_paced_frame<F: FrameSource>(
    frames: &mut Interval,
    capture: &mut CaptureGuard<F>,
) -> Result<Frame, FrameSourceError> {
    frames.tick().await;
    capture.next_frame().await
}
