use tracing::warn;

use wardflow_core::audit::{AuditEvent, AuditSink};

use super::RepositoryError;
use crate::DbPool;

/// Persists audit events without ever gating the workflow transition that
/// produced them: `emit` hands the write to a background task and failures
/// are logged and dropped. Must be constructed inside a tokio runtime.
#[derive(Clone)]
pub struct SqlAuditSink {
    pool: DbPool,
}

impl SqlAuditSink {
    pub fn new(pool: DbPool) -> Self {
        Self { pool }
    }

    pub async fn write(&self, event: &AuditEvent) -> Result<(), RepositoryError> {
        let metadata_json = serde_json::to_string(&event.metadata)
            .map_err(|error| RepositoryError::Decode(error.to_string()))?;

        sqlx::query(
            "INSERT INTO audit_event (event_id, request_id, correlation_id, event_type,
                                      category, actor, outcome, metadata_json, occurred_at)
             VALUES (?, ?, ?, ?, ?, ?, ?, ?, ?)",
        )
        .bind(&event.event_id)
        .bind(event.request_id.as_ref().map(|id| id.0.as_str()))
        .bind(&event.correlation_id)
        .bind(&event.event_type)
        .bind(event.category.as_str())
        .bind(&event.actor)
        .bind(event.outcome.as_str())
        .bind(&metadata_json)
        .bind(event.occurred_at.to_rfc3339())
        .execute(&self.pool)
        .await?;

        Ok(())
    }
}

impl AuditSink for SqlAuditSink {
    fn emit(&self, event: AuditEvent) {
        let sink = self.clone();
        tokio::spawn(async move {
            if let Err(error) = sink.write(&event).await {
                warn!(
                    event_name = "audit.persist_failed",
                    event_type = %event.event_type,
                    error = %error,
                    "dropping audit event after persistence failure"
                );
            }
        });
    }
}

#[cfg(test)]
mod tests {
    use sqlx::Row;

    use wardflow_core::audit::{AuditCategory, AuditEvent, AuditOutcome};
    use wardflow_core::domain::request::RequestId;

    use super::SqlAuditSink;
    use crate::{connect_with_settings, migrations};

    #[tokio::test]
    async fn write_persists_the_event_with_its_metadata() {
        let pool = connect_with_settings("sqlite::memory:", 1, 30).await.expect("connect");
        migrations::run_pending(&pool).await.expect("migrations");
        let sink = SqlAuditSink::new(pool.clone());

        let event = AuditEvent::new(
            Some(RequestId("REQ-1".to_string())),
            "req-123",
            "approval.stage_approved",
            AuditCategory::Approval,
            "user-hod",
            AuditOutcome::Success,
        )
        .with_metadata("from", "level1")
        .with_metadata("to", "hod");

        sink.write(&event).await.expect("write");

        let row = sqlx::query(
            "SELECT request_id, event_type, category, outcome, metadata_json
             FROM audit_event WHERE event_id = ?",
        )
        .bind(&event.event_id)
        .fetch_one(&pool)
        .await
        .expect("stored event");

        assert_eq!(row.get::<String, _>("request_id"), "REQ-1");
        assert_eq!(row.get::<String, _>("event_type"), "approval.stage_approved");
        assert_eq!(row.get::<String, _>("category"), "approval");
        assert_eq!(row.get::<String, _>("outcome"), "success");
        assert!(row.get::<String, _>("metadata_json").contains("level1"));
    }
}
