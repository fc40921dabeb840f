use crate::config::DatabaseConfig;
use crate::domain::{
    Classification, ClassificationRecord, SampledResult, Session, SessionStats, SessionStatus,
};
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use sqlx::{
    sqlite::{SqliteConnectOptions, SqlitePoolOptions, SqliteRow},
    Row, SqlitePool,
};
use std::str::FromStr;
use thiserror::Error;
use uuid::Uuid;

#[derive(Error, Debug)]
pub enum StoreError {
    #[error("Database error: {0}")]
    Database(#[from] sqlx::Error),
    #[error("Corrupt row: {0}")]
    CorruptRow(String),
    #[error("Session {0} not found")]
    SessionNotFound(String),
}

/// Session lookup used when a stream is opened.
#[async_trait]
pub trait SessionStore: Send + Sync + 'static {
    async fn resolve(&self, session_id: &str) -> Result<Option<Session>, StoreError>;
}

/// Append-only sink for delivered results. One call is one transaction.
#[async_trait]
pub trait ResultStore: Send + Sync + 'static {
    async fn append(&self, records: &[ClassificationRecord]) -> Result<(), StoreError>;
}

const SCHEMA: &[&str] = &[
    "CREATE TABLE IF NOT EXISTS sessions (
        id TEXT PRIMARY KEY,
        lot_id TEXT NOT NULL,
        status TEXT NOT NULL,
        start_time TEXT NOT NULL,
        end_time TEXT
    )",
    "CREATE INDEX IF NOT EXISTS idx_sessions_lot_id ON sessions (lot_id)",
    "CREATE TABLE IF NOT EXISTS classifications (
        row_id INTEGER PRIMARY KEY AUTOINCREMENT,
        id TEXT NOT NULL,
        classification TEXT NOT NULL,
        sampled INTEGER NOT NULL DEFAULT 0,
        image_reference TEXT,
        session_id TEXT NOT NULL REFERENCES sessions (id),
        timestamp TEXT NOT NULL
    )",
    "CREATE INDEX IF NOT EXISTS idx_classifications_session ON classifications (session_id)",
];

#[derive(Clone)]
pub struct SqliteStore {
    pool: SqlitePool,
}

impl SqliteStore {
    pub async fn connect(config: &DatabaseConfig) -> Result<Self, StoreError> {
        let options = SqliteConnectOptions::from_str(&config.url)?.create_if_missing(true);
        let mut pool_options = SqlitePoolOptions::new().max_connections(config.max_connections);
        if config.url.contains(":memory:") {
            // Every pooled connection would otherwise see its own empty database.
            pool_options = pool_options
                .max_connections(1)
                .idle_timeout(None)
                .max_lifetime(None);
        }
        let pool = pool_options.connect_with(options).await?;

        let store = Self { pool };
        store.migrate().await?;
        Ok(store)
    }

    async fn migrate(&self) -> Result<(), StoreError> {
        for statement in SCHEMA {
            sqlx::query(statement).execute(&self.pool).await?;
        }
        Ok(())
    }

    pub async fn create_session(
        &self,
        lot_id: &str,
        status: SessionStatus,
    ) -> Result<Session, StoreError> {
        let session = Session {
            id: Uuid::new_v4(),
            lot_id: lot_id.to_string(),
            status,
            start_time: Utc::now(),
            end_time: None,
        };

        sqlx::query("INSERT INTO sessions (id, lot_id, status, start_time) VALUES (?, ?, ?, ?)")
            .bind(session.id.to_string())
            .bind(&session.lot_id)
            .bind(session.status.as_str())
            .bind(session.start_time.to_rfc3339())
            .execute(&self.pool)
            .await?;

        tracing::info!("Created session {} for lot {}", session.id, session.lot_id);
        Ok(session)
    }

    pub async fn get_session(&self, session_id: &str) -> Result<Option<Session>, StoreError> {
        let Ok(id) = Uuid::parse_str(session_id) else {
            return Ok(None);
        };

        let row = sqlx::query(
            "SELECT id, lot_id, status, start_time, end_time FROM sessions WHERE id = ?",
        )
        .bind(id.to_string())
        .fetch_optional(&self.pool)
        .await?;

        row.map(|row| session_from_row(&row)).transpose()
    }

    /// Marks the session stopped and stamps its end time.
    pub async fn stop_session(&self, session_id: &str) -> Result<Session, StoreError> {
        let Some(mut session) = self.get_session(session_id).await? else {
            return Err(StoreError::SessionNotFound(session_id.to_string()));
        };

        let end_time = Utc::now();
        sqlx::query("UPDATE sessions SET status = ?, end_time = ? WHERE id = ?")
            .bind(SessionStatus::Stopped.as_str())
            .bind(end_time.to_rfc3339())
            .bind(session.id.to_string())
            .execute(&self.pool)
            .await?;

        session.status = SessionStatus::Stopped;
        session.end_time = Some(end_time);
        tracing::info!("Stopped session {}", session.id);
        Ok(session)
    }

    pub async fn session_stats(&self, session_id: &str) -> Result<Option<SessionStats>, StoreError> {
        let Some(session) = self.get_session(session_id).await? else {
            return Ok(None);
        };

        let row = sqlx::query(
            "SELECT
                COUNT(*) AS total,
                COALESCE(SUM(classification = 'accept'), 0) AS accepted,
                COALESCE(SUM(classification = 'reject'), 0) AS rejected,
                COALESCE(SUM(classification = 'pending'), 0) AS pending,
                COALESCE(SUM(sampled), 0) AS sampled
             FROM classifications WHERE session_id = ?",
        )
        .bind(session.id.to_string())
        .fetch_one(&self.pool)
        .await?;

        Ok(Some(SessionStats {
            accepted: row.try_get("accepted")?,
            rejected: row.try_get("rejected")?,
            pending: row.try_get("pending")?,
            sampled: row.try_get("sampled")?,
            total: row.try_get("total")?,
            session,
        }))
    }

    pub async fn sampled_results(
        &self,
        session_id: &str,
        limit: i64,
    ) -> Result<Vec<SampledResult>, StoreError> {
        let Ok(id) = Uuid::parse_str(session_id) else {
            return Ok(Vec::new());
        };

        let rows = sqlx::query(
            "SELECT id, image_reference FROM classifications
             WHERE session_id = ? AND sampled = 1
             ORDER BY row_id LIMIT ?",
        )
        .bind(id.to_string())
        .bind(limit)
        .fetch_all(&self.pool)
        .await?;

        rows.iter()
            .map(|row| {
                Ok(SampledResult {
                    id: row.try_get("id")?,
                    image_reference: row.try_get("image_reference")?,
                })
            })
            .collect()
    }

    pub async fn records_for_session(
        &self,
        session_id: Uuid,
    ) -> Result<Vec<ClassificationRecord>, StoreError> {
        let rows = sqlx::query(
            "SELECT id, classification, sampled, image_reference, session_id, timestamp
             FROM classifications WHERE session_id = ? ORDER BY row_id",
        )
        .bind(session_id.to_string())
        .fetch_all(&self.pool)
        .await?;

        rows.iter().map(record_from_row).collect()
    }
}

#[async_trait]
impl SessionStore for SqliteStore {
    async fn resolve(&self, session_id: &str) -> Result<Option<Session>, StoreError> {
        self.get_session(session_id).await
    }
}

#[async_trait]
impl ResultStore for SqliteStore {
    async fn append(&self, records: &[ClassificationRecord]) -> Result<(), StoreError> {
        // An early return drops the transaction, which rolls it back.
        let mut tx = self.pool.begin().await?;
        for record in records {
            sqlx::query(
                "INSERT INTO classifications
                    (id, classification, sampled, image_reference, session_id, timestamp)
                 VALUES (?, ?, ?, ?, ?, ?)",
            )
            .bind(&record.id)
            .bind(record.classification.as_str())
            .bind(record.sampled)
            .bind(&record.image_reference)
            .bind(record.session_id.to_string())
            .bind(record.timestamp.to_rfc3339())
            .execute(&mut *tx)
            .await?;
        }
        tx.commit().await?;
        Ok(())
    }
}

fn parse_uuid(value: &str) -> Result<Uuid, StoreError> {
    Uuid::parse_str(value).map_err(|e| StoreError::CorruptRow(format!("bad uuid {value}: {e}")))
}

fn parse_time(value: &str) -> Result<DateTime<Utc>, StoreError> {
    DateTime::parse_from_rfc3339(value)
        .map(|t| t.with_timezone(&Utc))
        .map_err(|e| StoreError::CorruptRow(format!("bad timestamp {value}: {e}")))
}

fn session_from_row(row: &SqliteRow) -> Result<Session, StoreError> {
    let id: String = row.try_get("id")?;
    let status: String = row.try_get("status")?;
    let start_time: String = row.try_get("start_time")?;
    let end_time: Option<String> = row.try_get("end_time")?;

    Ok(Session {
        id: parse_uuid(&id)?,
        lot_id: row.try_get("lot_id")?,
        status: SessionStatus::try_from(status.as_str()).map_err(StoreError::CorruptRow)?,
        start_time: parse_time(&start_time)?,
        end_time: end_time.as_deref().map(parse_time).transpose()?,
    })
}

fn record_from_row(row: &SqliteRow) -> Result<ClassificationRecord, StoreError> {
    let classification: String = row.try_get("classification")?;
    let session_id: String = row.try_get("session_id")?;
    let timestamp: String = row.try_get("timestamp")?;

    Ok(ClassificationRecord {
        id: row.try_get("id")?,
        classification: Classification::try_from(classification.as_str())
            .map_err(StoreError::CorruptRow)?,
        sampled: row.try_get("sampled")?,
        image_reference: row.try_get("image_reference")?,
        session_id: parse_uuid(&session_id)?,
        timestamp: parse_time(&timestamp)?,
    })
}
