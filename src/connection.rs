use crate::domain::{Session, SessionStatus};
use async_trait::async_trait;
use axum::extract::ws::{CloseFrame, Message, WebSocket};
use bytes::Bytes;
use chrono::{DateTime, Utc};
use futures::{stream::SplitSink, SinkExt};
use thiserror::Error;
use uuid::Uuid;

pub const NORMAL_CLOSURE: u16 = 1000;
pub const GOING_AWAY: u16 = 1001;
pub const POLICY_VIOLATION: u16 = 1008;
pub const INTERNAL_ERROR: u16 = 1011;

#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum TransportError {
    #[error("Transport closed")]
    Closed,
    #[error("Transport send failed: {0}")]
    SendFailed(String),
}

#[derive(Debug, Clone, PartialEq)]
pub enum Outbound {
    Text(String),
    Binary(Bytes),
    Ping,
}

/// One duplex client connection, seen from the sending side.
#[async_trait]
pub trait Transport: Send {
    async fn send(&mut self, message: Outbound) -> Result<(), TransportError>;
    async fn close(&mut self, code: u16, reason: &str) -> Result<(), TransportError>;
}

pub struct WsTransport {
    sink: SplitSink<WebSocket, Message>,
}

impl WsTransport {
    pub fn new(sink: SplitSink<WebSocket, Message>) -> Self {
        Self { sink }
    }
}

#[async_trait]
impl Transport for WsTransport {
    async fn send(&mut self, message: Outbound) -> Result<(), TransportError> {
        let message = match message {
            Outbound::Text(text) => Message::Text(text.into()),
            Outbound::Binary(data) => Message::Binary(data),
            Outbound::Ping => Message::Ping(Bytes::new()),
        };
        self.sink
            .send(message)
            .await
            .map_err(|e| TransportError::SendFailed(e.to_string()))
    }

    async fn close(&mut self, code: u16, reason: &str) -> Result<(), TransportError> {
        let frame = CloseFrame {
            code,
            reason: reason.to_owned().into(),
        };
        self.sink
            .send(Message::Close(Some(frame)))
            .await
            .map_err(|e| TransportError::SendFailed(e.to_string()))?;
        self.sink
            .close()
            .await
            .map_err(|e| TransportError::SendFailed(e.to_string()))
    }
}

/// Session details attached to a connection when it registers.
#[derive(Debug, Clone, PartialEq)]
pub struct SessionSnapshot {
    pub session_id: Uuid,
    pub lot_id: String,
    pub status: SessionStatus,
}

impl From<&Session> for SessionSnapshot {
    fn from(session: &Session) -> Self {
        Self {
            session_id: session.id,
            lot_id: session.lot_id.clone(),
            status: session.status,
        }
    }
}

#[derive(Debug, Clone)]
pub struct ConnectionMetadata {
    pub connected_at: DateTime<Utc>,
    pub last_activity: DateTime<Utc>,
    pub session: SessionSnapshot,
}

/// Opaque handle to a registration. The generation makes a handle go stale
/// once its connection is removed, even if the slot is later reused.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct ConnectionId {
    index: usize,
    generation: u64,
}

struct Connection<T> {
    transport: T,
    metadata: ConnectionMetadata,
}

struct Slot<T> {
    generation: u64,
    entry: Option<Connection<T>>,
}

/// Registry of live transports for one session scope.
///
/// There is no internal locking: every mutating call takes `&mut self`, so a
/// manager is owned and driven by a single task.
pub struct ConnectionManager<T> {
    slots: Vec<Slot<T>>,
    free: Vec<usize>,
    active: usize,
}

impl<T> Default for ConnectionManager<T> {
    fn default() -> Self {
        Self {
            slots: Vec::new(),
            free: Vec::new(),
            active: 0,
        }
    }
}

impl<T: Transport> ConnectionManager<T> {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn connect(&mut self, transport: T, session: SessionSnapshot) -> ConnectionId {
        let now = Utc::now();
        let connection = Connection {
            transport,
            metadata: ConnectionMetadata {
                connected_at: now,
                last_activity: now,
                session,
            },
        };

        let index = match self.free.pop() {
            Some(index) => index,
            None => {
                self.slots.push(Slot {
                    generation: 0,
                    entry: None,
                });
                self.slots.len() - 1
            }
        };
        let slot = &mut self.slots[index];
        slot.entry = Some(connection);
        self.active += 1;

        ConnectionId {
            index,
            generation: slot.generation,
        }
    }

    /// Removes the registration. Unknown or stale ids are ignored.
    pub fn disconnect(&mut self, id: ConnectionId) {
        let _ = self.remove(id);
    }

    fn remove(&mut self, id: ConnectionId) -> Option<T> {
        let slot = self.slots.get_mut(id.index)?;
        if slot.generation != id.generation {
            return None;
        }
        let connection = slot.entry.take()?;
        slot.generation += 1;
        self.free.push(id.index);
        self.active -= 1;
        Some(connection.transport)
    }

    fn entry_mut(&mut self, id: ConnectionId) -> Option<&mut Connection<T>> {
        self.slots
            .get_mut(id.index)
            .filter(|slot| slot.generation == id.generation)
            .and_then(|slot| slot.entry.as_mut())
    }

    pub fn is_registered(&self, id: ConnectionId) -> bool {
        self.metadata(id).is_some()
    }

    pub fn active_count(&self) -> usize {
        self.active
    }

    pub fn metadata(&self, id: ConnectionId) -> Option<&ConnectionMetadata> {
        self.slots
            .get(id.index)
            .filter(|slot| slot.generation == id.generation)
            .and_then(|slot| slot.entry.as_ref())
            .map(|connection| &connection.metadata)
    }

    pub fn record_activity(&mut self, id: ConnectionId) {
        if let Some(connection) = self.entry_mut(id) {
            connection.metadata.last_activity = Utc::now();
        }
    }

    /// Delivers to one connection. Any failure deregisters it and surfaces as
    /// [`TransportError::Closed`].
    pub async fn send(&mut self, id: ConnectionId, message: Outbound) -> Result<(), TransportError> {
        let Some(connection) = self.entry_mut(id) else {
            return Err(TransportError::Closed);
        };

        match connection.transport.send(message).await {
            Ok(()) => {
                connection.metadata.last_activity = Utc::now();
                Ok(())
            }
            Err(e) => {
                tracing::debug!("Send failed, dropping connection {:?}: {}", id, e);
                self.disconnect(id);
                Err(TransportError::Closed)
            }
        }
    }

    pub async fn send_bytes(&mut self, id: ConnectionId, data: Bytes) -> Result<(), TransportError> {
        self.send(id, Outbound::Binary(data)).await
    }

    /// Delivers to every registered connection, reaping the ones that fail.
    /// Returns the number of successful deliveries.
    pub async fn broadcast(&mut self, message: Outbound) -> usize {
        let mut delivered = 0;
        let mut failed = Vec::new();

        for (index, slot) in self.slots.iter_mut().enumerate() {
            let Some(connection) = slot.entry.as_mut() else {
                continue;
            };
            match connection.transport.send(message.clone()).await {
                Ok(()) => {
                    connection.metadata.last_activity = Utc::now();
                    delivered += 1;
                }
                Err(e) => {
                    tracing::debug!("Broadcast failed for connection slot {}: {}", index, e);
                    failed.push(ConnectionId {
                        index,
                        generation: slot.generation,
                    });
                }
            }
        }

        for id in failed {
            self.disconnect(id);
        }
        delivered
    }

    pub async fn broadcast_bytes(&mut self, data: Bytes) -> usize {
        self.broadcast(Outbound::Binary(data)).await
    }

    pub async fn ping_all(&mut self) -> usize {
        self.broadcast(Outbound::Ping).await
    }

    /// Gracefully closes and deregisters. Close errors are ignored and an
    /// already removed connection is a no-op.
    pub async fn close(&mut self, id: ConnectionId, code: u16, reason: &str) {
        if let Some(mut transport) = self.remove(id) {
            if let Err(e) = transport.close(code, reason).await {
                tracing::debug!("Ignoring close error on connection {:?}: {}", id, e);
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::testing::{RecordingTransport, TransportLog};

    fn snapshot() -> SessionSnapshot {
        SessionSnapshot {
            session_id: Uuid::new_v4(),
            lot_id: "L1".to_string(),
            status: SessionStatus::Active,
        }
    }

    #[tokio::test]
    async fn test_broadcast_reaps_only_failing_transport() {
        let mut manager = ConnectionManager::new();
        let logs: Vec<TransportLog> = (0..4).map(|_| TransportLog::default()).collect();
        let mut ids = Vec::new();
        for (i, log) in logs.iter().enumerate() {
            let transport = if i == 2 {
                RecordingTransport::failing(log.clone())
            } else {
                RecordingTransport::new(log.clone())
            };
            ids.push(manager.connect(transport, snapshot()));
        }

        let delivered = manager.broadcast_bytes(Bytes::from_static(b"frame")).await;

        assert_eq!(delivered, 3);
        assert_eq!(manager.active_count(), 3);
        assert!(!manager.is_registered(ids[2]));
        for i in [0, 1, 3] {
            assert!(manager.is_registered(ids[i]));
            assert_eq!(
                logs[i].messages(),
                vec![Outbound::Binary(Bytes::from_static(b"frame"))]
            );
        }
    }

    #[tokio::test]
    async fn test_disconnect_twice_is_noop() {
        let mut manager = ConnectionManager::new();
        let first = manager.connect(RecordingTransport::new(TransportLog::default()), snapshot());
        let _second = manager.connect(RecordingTransport::new(TransportLog::default()), snapshot());

        manager.disconnect(first);
        assert_eq!(manager.active_count(), 1);
        manager.disconnect(first);
        assert_eq!(manager.active_count(), 1);
    }

    #[tokio::test]
    async fn test_send_failure_deregisters_and_reports_closed() {
        let mut manager = ConnectionManager::new();
        let id = manager.connect(RecordingTransport::failing(TransportLog::default()), snapshot());

        let err = manager
            .send(id, Outbound::Text("{}".to_string()))
            .await
            .unwrap_err();

        assert_eq!(err, TransportError::Closed);
        assert!(!manager.is_registered(id));

        let err = manager
            .send_bytes(id, Bytes::from_static(b"again"))
            .await
            .unwrap_err();
        assert_eq!(err, TransportError::Closed);
    }

    #[tokio::test]
    async fn test_stale_id_cannot_reach_reused_slot() {
        let mut manager = ConnectionManager::new();
        let stale = manager.connect(RecordingTransport::new(TransportLog::default()), snapshot());
        manager.disconnect(stale);

        let log = TransportLog::default();
        let fresh = manager.connect(RecordingTransport::new(log.clone()), snapshot());
        assert_ne!(stale, fresh);

        assert_eq!(
            manager.send(stale, Outbound::Ping).await,
            Err(TransportError::Closed)
        );
        manager.disconnect(stale);

        assert!(manager.is_registered(fresh));
        assert!(log.messages().is_empty());
    }

    #[tokio::test]
    async fn test_close_always_deregisters() {
        let mut manager = ConnectionManager::new();
        let log = TransportLog::default();
        let healthy = manager.connect(RecordingTransport::new(log.clone()), snapshot());
        let broken = manager.connect(RecordingTransport::failing(TransportLog::default()), snapshot());

        manager.close(healthy, NORMAL_CLOSURE, "done").await;
        manager.close(broken, INTERNAL_ERROR, "boom").await;
        manager.close(healthy, NORMAL_CLOSURE, "again").await;

        assert_eq!(manager.active_count(), 0);
        assert_eq!(log.closes(), vec![(NORMAL_CLOSURE, "done".to_string())]);
    }

    #[tokio::test]
    async fn test_ping_all_reaps_dead_peers() {
        let mut manager = ConnectionManager::new();
        let log = TransportLog::default();
        manager.connect(RecordingTransport::new(log.clone()), snapshot());
        manager.connect(RecordingTransport::failing(TransportLog::default()), snapshot());

        assert_eq!(manager.ping_all().await, 1);
        assert_eq!(manager.active_count(), 1);
        assert_eq!(log.messages(), vec![Outbound::Ping]);
    }

    #[tokio::test]
    async fn test_send_refreshes_last_activity() {
        let mut manager = ConnectionManager::new();
        let id = manager.connect(RecordingTransport::new(TransportLog::default()), snapshot());
        let connected_at = manager.metadata(id).unwrap().connected_at;

        tokio::time::sleep(std::time::Duration::from_millis(5)).await;
        manager.send(id, Outbound::Ping).await.unwrap();

        let metadata = manager.metadata(id).unwrap();
        assert_eq!(metadata.session.lot_id, "L1");
        assert!(metadata.last_activity > connected_at);
    }
}
