use std::collections::BTreeMap;
use std::str::FromStr;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use rust_decimal::Decimal;
use sqlx::{sqlite::SqliteRow, Row, SqliteConnection};

use wardflow_core::chain::Stage;
use wardflow_core::domain::asset::AssetId;
use wardflow_core::domain::request::{
    ApprovalStep, AssetRequest, EscalationPolicy, FinalStatus, FulfilledAsset, Fulfillment,
    Priority, RejectedAsset, RequestId, RequestLevel, RequestScope, RequestType, ScopeLevel,
    StepStatus,
};
use wardflow_core::domain::{DepartmentId, HospitalId, OrganizationId};
use wardflow_core::store::{RequestStore, StoreError};

use super::{db_err, RepositoryError};
use crate::DbPool;

pub struct SqlRequestStore {
    pool: DbPool,
}

impl SqlRequestStore {
    pub fn new(pool: DbPool) -> Self {
        Self { pool }
    }
}

const REQUEST_COLUMNS: &str = "id, request_type, requested_assets, requested_count, \
     fulfilled_count, current_level, final_status, scope_level, department_id, hospital_id, \
     organization_id, escalation_enabled, escalate_after_hours, last_action_at, justification, \
     priority, estimated_cost, requested_by, created_at, updated_at";

fn parse_timestamp(column: &str, raw: &str) -> Result<DateTime<Utc>, RepositoryError> {
    DateTime::parse_from_rfc3339(raw)
        .map(|value| value.with_timezone(&Utc))
        .map_err(|error| RepositoryError::Decode(format!("{column}: {error}")))
}

fn row_to_request(row: &SqliteRow) -> Result<AssetRequest, RepositoryError> {
    let request_type_raw: String = row.try_get("request_type")?;
    let requested_assets_raw: String = row.try_get("requested_assets")?;
    let requested_count: i64 = row.try_get("requested_count")?;
    let fulfilled_count: i64 = row.try_get("fulfilled_count")?;
    let current_level_raw: String = row.try_get("current_level")?;
    let final_status_raw: String = row.try_get("final_status")?;
    let scope_level_raw: String = row.try_get("scope_level")?;
    let escalation_enabled: i64 = row.try_get("escalation_enabled")?;
    let escalate_after_hours: i64 = row.try_get("escalate_after_hours")?;
    let last_action_at_raw: String = row.try_get("last_action_at")?;
    let priority_raw: String = row.try_get("priority")?;
    let estimated_cost_raw: Option<String> = row.try_get("estimated_cost")?;
    let created_at_raw: String = row.try_get("created_at")?;
    let updated_at_raw: String = row.try_get("updated_at")?;

    let request_type = RequestType::parse(&request_type_raw).ok_or_else(|| {
        RepositoryError::Decode(format!("unknown request type `{request_type_raw}`"))
    })?;
    let requested_assets: Vec<String> = serde_json::from_str(&requested_assets_raw)
        .map_err(|error| RepositoryError::Decode(format!("requested_assets: {error}")))?;
    let current_level = RequestLevel::parse(&current_level_raw).ok_or_else(|| {
        RepositoryError::Decode(format!("unknown request level `{current_level_raw}`"))
    })?;
    let final_status = FinalStatus::parse(&final_status_raw).ok_or_else(|| {
        RepositoryError::Decode(format!("unknown final status `{final_status_raw}`"))
    })?;
    let scope_level = ScopeLevel::parse(&scope_level_raw).ok_or_else(|| {
        RepositoryError::Decode(format!("unknown scope level `{scope_level_raw}`"))
    })?;
    let priority = Priority::parse(&priority_raw)
        .ok_or_else(|| RepositoryError::Decode(format!("unknown priority `{priority_raw}`")))?;
    let estimated_cost = estimated_cost_raw
        .map(|raw| {
            Decimal::from_str(&raw)
                .map_err(|error| RepositoryError::Decode(format!("estimated_cost: {error}")))
        })
        .transpose()?;

    Ok(AssetRequest {
        id: RequestId(row.try_get("id")?),
        request_type,
        requested_assets: requested_assets.into_iter().map(AssetId).collect(),
        fulfillment: Fulfillment {
            requested_count: requested_count as u32,
            fulfilled_count: fulfilled_count as u32,
            fulfilled_assets: Vec::new(),
        },
        rejected_assets: Vec::new(),
        approval_flow: BTreeMap::new(),
        current_level,
        final_status,
        scope: RequestScope {
            level: scope_level,
            department_id: DepartmentId(row.try_get("department_id")?),
            hospital_id: HospitalId(row.try_get("hospital_id")?),
            organization_id: OrganizationId(row.try_get("organization_id")?),
        },
        escalation: EscalationPolicy {
            enabled: escalation_enabled != 0,
            escalate_after_hours,
            last_action_at: parse_timestamp("last_action_at", &last_action_at_raw)?,
        },
        justification: row.try_get("justification")?,
        priority,
        estimated_cost,
        requested_by: row.try_get("requested_by")?,
        created_at: parse_timestamp("created_at", &created_at_raw)?,
        updated_at: parse_timestamp("updated_at", &updated_at_raw)?,
    })
}

impl SqlRequestStore {
    async fn hydrate(&self, row: &SqliteRow) -> Result<AssetRequest, StoreError> {
        let mut request = row_to_request(row).map_err(StoreError::from)?;

        let steps = sqlx::query(
            "SELECT stage, status, decided_by, decided_at, remarks
             FROM approval_step WHERE request_id = ?",
        )
        .bind(&request.id.0)
        .fetch_all(&self.pool)
        .await
        .map_err(db_err)?;
        for step in steps {
            let stage_raw: String = step.try_get("stage").map_err(db_err)?;
            let status_raw: String = step.try_get("status").map_err(db_err)?;
            let decided_by: Option<String> = step.try_get("decided_by").map_err(db_err)?;
            let decided_at_raw: Option<String> = step.try_get("decided_at").map_err(db_err)?;
            let remarks: Option<String> = step.try_get("remarks").map_err(db_err)?;

            let stage = Stage::parse(&stage_raw).ok_or_else(|| {
                StoreError::from(RepositoryError::Decode(format!("unknown stage `{stage_raw}`")))
            })?;
            let status = StepStatus::parse(&status_raw).ok_or_else(|| {
                StoreError::from(RepositoryError::Decode(format!(
                    "unknown step status `{status_raw}`"
                )))
            })?;
            let decided_at = decided_at_raw
                .map(|raw| parse_timestamp("decided_at", &raw))
                .transpose()
                .map_err(StoreError::from)?;

            request
                .approval_flow
                .insert(stage, ApprovalStep { status, decided_by, decided_at, remarks });
        }

        let fulfilled = sqlx::query(
            "SELECT asset_id, from_department_id, fulfilled_by, fulfilled_at
             FROM fulfilled_asset WHERE request_id = ?
             ORDER BY fulfilled_at ASC, asset_id ASC",
        )
        .bind(&request.id.0)
        .fetch_all(&self.pool)
        .await
        .map_err(db_err)?;
        for entry in fulfilled {
            let fulfilled_at_raw: String = entry.try_get("fulfilled_at").map_err(db_err)?;
            request.fulfillment.fulfilled_assets.push(FulfilledAsset {
                asset_id: AssetId(entry.try_get("asset_id").map_err(db_err)?),
                from_department_id: DepartmentId(
                    entry.try_get("from_department_id").map_err(db_err)?,
                ),
                fulfilled_by: entry.try_get("fulfilled_by").map_err(db_err)?,
                fulfilled_at: parse_timestamp("fulfilled_at", &fulfilled_at_raw)
                    .map_err(StoreError::from)?,
            });
        }

        let rejected = sqlx::query(
            "SELECT asset_id, from_department_id, rejected_by, rejected_at, remarks
             FROM rejected_asset WHERE request_id = ?
             ORDER BY rejected_at ASC, asset_id ASC",
        )
        .bind(&request.id.0)
        .fetch_all(&self.pool)
        .await
        .map_err(db_err)?;
        for entry in rejected {
            let rejected_at_raw: String = entry.try_get("rejected_at").map_err(db_err)?;
            request.rejected_assets.push(RejectedAsset {
                asset_id: AssetId(entry.try_get("asset_id").map_err(db_err)?),
                from_department_id: DepartmentId(
                    entry.try_get("from_department_id").map_err(db_err)?,
                ),
                rejected_by: entry.try_get("rejected_by").map_err(db_err)?,
                rejected_at: parse_timestamp("rejected_at", &rejected_at_raw)
                    .map_err(StoreError::from)?,
                remarks: entry.try_get("remarks").map_err(db_err)?,
            });
        }

        Ok(request)
    }
}

fn requested_assets_json(request: &AssetRequest) -> String {
    let ids: Vec<&str> = request.requested_assets.iter().map(|id| id.0.as_str()).collect();
    serde_json::to_string(&ids).unwrap_or_else(|_| "[]".to_string())
}

async fn write_children(
    conn: &mut SqliteConnection,
    request: &AssetRequest,
) -> Result<(), sqlx::Error> {
    sqlx::query("DELETE FROM approval_step WHERE request_id = ?")
        .bind(&request.id.0)
        .execute(&mut *conn)
        .await?;
    for (stage, step) in &request.approval_flow {
        sqlx::query(
            "INSERT INTO approval_step (request_id, stage, status, decided_by, decided_at, remarks)
             VALUES (?, ?, ?, ?, ?, ?)",
        )
        .bind(&request.id.0)
        .bind(stage.as_str())
        .bind(step.status.as_str())
        .bind(step.decided_by.as_deref())
        .bind(step.decided_at.map(|at| at.to_rfc3339()))
        .bind(step.remarks.as_deref())
        .execute(&mut *conn)
        .await?;
    }

    sqlx::query("DELETE FROM fulfilled_asset WHERE request_id = ?")
        .bind(&request.id.0)
        .execute(&mut *conn)
        .await?;
    for entry in &request.fulfillment.fulfilled_assets {
        sqlx::query(
            "INSERT INTO fulfilled_asset (request_id, asset_id, from_department_id, fulfilled_by, fulfilled_at)
             VALUES (?, ?, ?, ?, ?)",
        )
        .bind(&request.id.0)
        .bind(&entry.asset_id.0)
        .bind(&entry.from_department_id.0)
        .bind(&entry.fulfilled_by)
        .bind(entry.fulfilled_at.to_rfc3339())
        .execute(&mut *conn)
        .await?;
    }

    sqlx::query("DELETE FROM rejected_asset WHERE request_id = ?")
        .bind(&request.id.0)
        .execute(&mut *conn)
        .await?;
    for entry in &request.rejected_assets {
        sqlx::query(
            "INSERT INTO rejected_asset (request_id, asset_id, from_department_id, rejected_by, rejected_at, remarks)
             VALUES (?, ?, ?, ?, ?, ?)",
        )
        .bind(&request.id.0)
        .bind(&entry.asset_id.0)
        .bind(&entry.from_department_id.0)
        .bind(&entry.rejected_by)
        .bind(entry.rejected_at.to_rfc3339())
        .bind(entry.remarks.as_deref())
        .execute(&mut *conn)
        .await?;
    }

    Ok(())
}

#[async_trait]
impl RequestStore for SqlRequestStore {
    async fn find_by_id(&self, id: &RequestId) -> Result<Option<AssetRequest>, StoreError> {
        let row = sqlx::query(&format!("SELECT {REQUEST_COLUMNS} FROM asset_request WHERE id = ?"))
            .bind(&id.0)
            .fetch_optional(&self.pool)
            .await
            .map_err(db_err)?;

        match row {
            Some(row) => Ok(Some(self.hydrate(&row).await?)),
            None => Ok(None),
        }
    }

    async fn insert(&self, request: AssetRequest) -> Result<(), StoreError> {
        let mut tx = self.pool.begin().await.map_err(db_err)?;

        sqlx::query(
            "INSERT INTO asset_request (id, request_type, requested_assets, requested_count,
                                        fulfilled_count, current_level, final_status, scope_level,
                                        department_id, hospital_id, organization_id,
                                        escalation_enabled, escalate_after_hours, last_action_at,
                                        justification, priority, estimated_cost, requested_by,
                                        created_at, updated_at)
             VALUES (?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?)",
        )
        .bind(&request.id.0)
        .bind(request.request_type.as_str())
        .bind(requested_assets_json(&request))
        .bind(i64::from(request.fulfillment.requested_count))
        .bind(i64::from(request.fulfillment.fulfilled_count))
        .bind(request.current_level.as_str())
        .bind(request.final_status.as_str())
        .bind(request.scope.level.as_str())
        .bind(&request.scope.department_id.0)
        .bind(&request.scope.hospital_id.0)
        .bind(&request.scope.organization_id.0)
        .bind(i64::from(request.escalation.enabled))
        .bind(request.escalation.escalate_after_hours)
        .bind(request.escalation.last_action_at.to_rfc3339())
        .bind(&request.justification)
        .bind(request.priority.as_str())
        .bind(request.estimated_cost.map(|cost| cost.to_string()))
        .bind(&request.requested_by)
        .bind(request.created_at.to_rfc3339())
        .bind(request.updated_at.to_rfc3339())
        .execute(&mut *tx)
        .await
        .map_err(db_err)?;

        write_children(&mut *tx, &request).await.map_err(db_err)?;

        tx.commit().await.map_err(db_err)?;
        Ok(())
    }

    async fn update_if_level(
        &self,
        expected: &RequestLevel,
        request: AssetRequest,
    ) -> Result<bool, StoreError> {
        let mut tx = self.pool.begin().await.map_err(db_err)?;

        let result = sqlx::query(
            "UPDATE asset_request
             SET requested_assets = ?,
                 requested_count = ?,
                 fulfilled_count = ?,
                 current_level = ?,
                 final_status = ?,
                 escalation_enabled = ?,
                 escalate_after_hours = ?,
                 last_action_at = ?,
                 justification = ?,
                 priority = ?,
                 estimated_cost = ?,
                 updated_at = ?
             WHERE id = ? AND current_level = ?",
        )
        .bind(requested_assets_json(&request))
        .bind(i64::from(request.fulfillment.requested_count))
        .bind(i64::from(request.fulfillment.fulfilled_count))
        .bind(request.current_level.as_str())
        .bind(request.final_status.as_str())
        .bind(i64::from(request.escalation.enabled))
        .bind(request.escalation.escalate_after_hours)
        .bind(request.escalation.last_action_at.to_rfc3339())
        .bind(&request.justification)
        .bind(request.priority.as_str())
        .bind(request.estimated_cost.map(|cost| cost.to_string()))
        .bind(request.updated_at.to_rfc3339())
        .bind(&request.id.0)
        .bind(expected.as_str())
        .execute(&mut *tx)
        .await
        .map_err(db_err)?;

        if result.rows_affected() == 0 {
            // A concurrent writer moved the request past `expected`.
            tx.rollback().await.map_err(db_err)?;
            return Ok(false);
        }

        write_children(&mut *tx, &request).await.map_err(db_err)?;

        tx.commit().await.map_err(db_err)?;
        Ok(true)
    }

    async fn list_pending_for_stage(
        &self,
        stage: Stage,
        organization_id: &OrganizationId,
    ) -> Result<Vec<AssetRequest>, StoreError> {
        let rows = sqlx::query(&format!(
            "SELECT {REQUEST_COLUMNS} FROM asset_request
             WHERE final_status = 'pending' AND current_level = ? AND organization_id = ?
             ORDER BY created_at ASC"
        ))
        .bind(stage.as_str())
        .bind(&organization_id.0)
        .fetch_all(&self.pool)
        .await
        .map_err(db_err)?;

        let mut requests = Vec::with_capacity(rows.len());
        for row in &rows {
            requests.push(self.hydrate(row).await?);
        }
        Ok(requests)
    }

    async fn list_escalation_candidates(
        &self,
        stages: &[Stage],
    ) -> Result<Vec<AssetRequest>, StoreError> {
        let mut requests = Vec::new();
        for stage in stages {
            let rows = sqlx::query(&format!(
                "SELECT {REQUEST_COLUMNS} FROM asset_request
                 WHERE final_status = 'pending'
                   AND escalation_enabled = 1
                   AND current_level = ?"
            ))
            .bind(stage.as_str())
            .fetch_all(&self.pool)
            .await
            .map_err(db_err)?;

            for row in &rows {
                requests.push(self.hydrate(row).await?);
            }
        }
        requests.sort_by(|left, right| left.created_at.cmp(&right.created_at));
        Ok(requests)
    }
}
