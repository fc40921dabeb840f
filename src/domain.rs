use bytes::Bytes;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

/// One encoded image as produced by a frame source. Never persisted.
#[derive(Debug, Clone)]
pub struct Frame {
    pub sequence: u64,
    pub data: Bytes,
}

impl Frame {
    pub fn new(sequence: u64, data: impl Into<Bytes>) -> Self {
        Self {
            sequence,
            data: data.into(),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Classification {
    Accept,
    Reject,
    Pending,
}

impl Classification {
    pub fn as_str(&self) -> &'static str {
        match self {
            Classification::Accept => "accept",
            Classification::Reject => "reject",
            Classification::Pending => "pending",
        }
    }
}

impl TryFrom<&str> for Classification {
    type Error = String;

    fn try_from(s: &str) -> Result<Self, Self::Error> {
        match s {
            "accept" => Ok(Self::Accept),
            "reject" => Ok(Self::Reject),
            "pending" => Ok(Self::Pending),
            other => Err(format!("{} is not a known classification", other)),
        }
    }
}

/// Client-facing verdict for a single frame.
///
/// A sampled result never carries an image reference: the image is kept
/// server-side for audit and is not echoed back to the client.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ClassificationResult {
    pub id: String,
    pub classification: Classification,
    pub sampled: bool,
    pub image_reference: Option<String>,
}

impl ClassificationResult {
    /// Synthetic acknowledgement for a frame that is still waiting in a batch.
    pub fn pending() -> Self {
        Self {
            id: Uuid::new_v4().to_string(),
            classification: Classification::Pending,
            sampled: false,
            image_reference: None,
        }
    }

    pub fn into_record(self, session_id: Uuid, timestamp: DateTime<Utc>) -> ClassificationRecord {
        ClassificationRecord {
            id: self.id,
            classification: self.classification,
            sampled: self.sampled,
            image_reference: self.image_reference,
            session_id,
            timestamp,
        }
    }
}

/// Durable form of a result, appended once per delivered verdict.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct ClassificationRecord {
    pub id: String,
    pub classification: Classification,
    pub sampled: bool,
    pub image_reference: Option<String>,
    pub session_id: Uuid,
    pub timestamp: DateTime<Utc>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum SessionStatus {
    Active,
    Stopped,
}

impl SessionStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            SessionStatus::Active => "active",
            SessionStatus::Stopped => "stopped",
        }
    }
}

impl TryFrom<&str> for SessionStatus {
    type Error = String;

    fn try_from(s: &str) -> Result<Self, Self::Error> {
        match s.to_lowercase().as_str() {
            "active" => Ok(Self::Active),
            "stopped" => Ok(Self::Stopped),
            other => Err(format!(
                "{} is not a supported session status. Use either `active` or `stopped`.",
                other
            )),
        }
    }
}

/// A bounded sorting run for one lot.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct Session {
    pub id: Uuid,
    pub lot_id: String,
    pub status: SessionStatus,
    pub start_time: DateTime<Utc>,
    pub end_time: Option<DateTime<Utc>>,
}

impl Session {
    pub fn is_active(&self) -> bool {
        self.status == SessionStatus::Active
    }
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct SessionStats {
    pub session: Session,
    pub accepted: i64,
    pub rejected: i64,
    pub pending: i64,
    pub sampled: i64,
    pub total: i64,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct SampledResult {
    pub id: String,
    pub image_reference: Option<String>,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_result_payload_shape() {
        let result = ClassificationResult {
            id: "abc".to_string(),
            classification: Classification::Accept,
            sampled: true,
            image_reference: None,
        };

        let payload = serde_json::to_value(&result).unwrap();
        assert_eq!(payload["classification"], "accept");
        assert_eq!(payload["sampled"], true);
        assert!(payload["image_reference"].is_null());
    }

    #[test]
    fn test_pending_is_not_a_verdict() {
        let ack = ClassificationResult::pending();
        assert_eq!(ack.classification, Classification::Pending);
        assert!(!ack.sampled);
        assert!(ack.image_reference.is_none());
    }

    #[test]
    fn test_session_status_parsing() {
        assert_eq!(SessionStatus::try_from("Active"), Ok(SessionStatus::Active));
        assert!(SessionStatus::try_from("paused").is_err());
    }
}
