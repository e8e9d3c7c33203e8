use async_trait::async_trait;
use chrono::{DateTime, Utc};
use sqlx::{sqlite::SqliteRow, Row};

use wardflow_core::domain::asset::{
    Asset, AssetId, AssetStatus, LifecycleStatus, Reservation, UtilizationStatus,
};
use wardflow_core::domain::request::RequestId;
use wardflow_core::domain::DepartmentId;
use wardflow_core::store::{AssetStore, StoreError};

use super::{db_err, RepositoryError};
use crate::DbPool;

pub struct SqlAssetStore {
    pool: DbPool,
}

impl SqlAssetStore {
    pub fn new(pool: DbPool) -> Self {
        Self { pool }
    }
}

const ASSET_COLUMNS: &str = "id, name, current_department_id, status, lifecycle_status, \
     utilization_status, is_reserved, reserved_request_id, reserved_by_department_id, \
     reserved_at, created_at, updated_at";

fn parse_timestamp(column: &str, raw: &str) -> Result<DateTime<Utc>, RepositoryError> {
    DateTime::parse_from_rfc3339(raw)
        .map(|value| value.with_timezone(&Utc))
        .map_err(|error| RepositoryError::Decode(format!("{column}: {error}")))
}

fn row_to_asset(row: &SqliteRow) -> Result<Asset, RepositoryError> {
    let status_raw: String = row.try_get("status")?;
    let lifecycle_raw: String = row.try_get("lifecycle_status")?;
    let utilization_raw: String = row.try_get("utilization_status")?;
    let is_reserved: i64 = row.try_get("is_reserved")?;
    let reserved_request_id: Option<String> = row.try_get("reserved_request_id")?;
    let reserved_by: Option<String> = row.try_get("reserved_by_department_id")?;
    let reserved_at_raw: Option<String> = row.try_get("reserved_at")?;
    let created_at_raw: String = row.try_get("created_at")?;
    let updated_at_raw: String = row.try_get("updated_at")?;

    let status = AssetStatus::parse(&status_raw)
        .ok_or_else(|| RepositoryError::Decode(format!("unknown asset status `{status_raw}`")))?;
    let lifecycle_status = LifecycleStatus::parse(&lifecycle_raw).ok_or_else(|| {
        RepositoryError::Decode(format!("unknown lifecycle status `{lifecycle_raw}`"))
    })?;
    let utilization_status = UtilizationStatus::parse(&utilization_raw).ok_or_else(|| {
        RepositoryError::Decode(format!("unknown utilization status `{utilization_raw}`"))
    })?;
    let reserved_at = reserved_at_raw
        .map(|raw| parse_timestamp("reserved_at", &raw))
        .transpose()?;

    Ok(Asset {
        id: AssetId(row.try_get("id")?),
        name: row.try_get("name")?,
        current_department_id: DepartmentId(row.try_get("current_department_id")?),
        status,
        lifecycle_status,
        utilization_status,
        reservation: Reservation {
            is_reserved: is_reserved != 0,
            request_id: reserved_request_id.map(RequestId),
            reserved_by_department_id: reserved_by.map(DepartmentId),
            reserved_at,
        },
        created_at: parse_timestamp("created_at", &created_at_raw)?,
        updated_at: parse_timestamp("updated_at", &updated_at_raw)?,
    })
}

#[async_trait]
impl AssetStore for SqlAssetStore {
    async fn find_by_id(&self, id: &AssetId) -> Result<Option<Asset>, StoreError> {
        let row = sqlx::query(&format!("SELECT {ASSET_COLUMNS} FROM asset WHERE id = ?"))
            .bind(&id.0)
            .fetch_optional(&self.pool)
            .await
            .map_err(db_err)?;

        row.map(|row| row_to_asset(&row).map_err(StoreError::from)).transpose()
    }

    async fn find_many(&self, ids: &[AssetId]) -> Result<Vec<Asset>, StoreError> {
        let mut assets = Vec::with_capacity(ids.len());
        for id in ids {
            if let Some(asset) = self.find_by_id(id).await? {
                assets.push(asset);
            }
        }
        Ok(assets)
    }

    async fn save(&self, asset: Asset) -> Result<(), StoreError> {
        sqlx::query(
            "INSERT INTO asset (id, name, current_department_id, status, lifecycle_status,
                                utilization_status, is_reserved, reserved_request_id,
                                reserved_by_department_id, reserved_at, created_at, updated_at)
             VALUES (?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?)
             ON CONFLICT(id) DO UPDATE SET
                 name = excluded.name,
                 current_department_id = excluded.current_department_id,
                 status = excluded.status,
                 lifecycle_status = excluded.lifecycle_status,
                 utilization_status = excluded.utilization_status,
                 is_reserved = excluded.is_reserved,
                 reserved_request_id = excluded.reserved_request_id,
                 reserved_by_department_id = excluded.reserved_by_department_id,
                 reserved_at = excluded.reserved_at,
                 updated_at = excluded.updated_at",
        )
        .bind(&asset.id.0)
        .bind(&asset.name)
        .bind(&asset.current_department_id.0)
        .bind(asset.status.as_str())
        .bind(asset.lifecycle_status.as_str())
        .bind(asset.utilization_status.as_str())
        .bind(i64::from(asset.reservation.is_reserved))
        .bind(asset.reservation.request_id.as_ref().map(|id| id.0.as_str()))
        .bind(
            asset
                .reservation
                .reserved_by_department_id
                .as_ref()
                .map(|id| id.0.as_str()),
        )
        .bind(asset.reservation.reserved_at.map(|at| at.to_rfc3339()))
        .bind(asset.created_at.to_rfc3339())
        .bind(asset.updated_at.to_rfc3339())
        .execute(&self.pool)
        .await
        .map_err(db_err)?;

        Ok(())
    }

    async fn update_if_reservable(
        &self,
        id: &AssetId,
        reservation: Reservation,
        now: DateTime<Utc>,
    ) -> Result<bool, StoreError> {
        let result = sqlx::query(
            "UPDATE asset
             SET is_reserved = 1,
                 reserved_request_id = ?,
                 reserved_by_department_id = ?,
                 reserved_at = ?,
                 updated_at = ?
             WHERE id = ?
               AND status = 'active'
               AND utilization_status = 'not_in_use'
               AND is_reserved = 0",
        )
        .bind(reservation.request_id.as_ref().map(|id| id.0.as_str()))
        .bind(
            reservation
                .reserved_by_department_id
                .as_ref()
                .map(|id| id.0.as_str()),
        )
        .bind(reservation.reserved_at.map(|at| at.to_rfc3339()))
        .bind(now.to_rfc3339())
        .bind(&id.0)
        .execute(&self.pool)
        .await
        .map_err(db_err)?;

        Ok(result.rows_affected() == 1)
    }

    async fn release_if_held(
        &self,
        id: &AssetId,
        request_id: &RequestId,
        now: DateTime<Utc>,
    ) -> Result<bool, StoreError> {
        let result = sqlx::query(
            "UPDATE asset
             SET is_reserved = 0,
                 reserved_request_id = NULL,
                 reserved_by_department_id = NULL,
                 reserved_at = NULL,
                 updated_at = ?
             WHERE id = ? AND reserved_request_id = ?",
        )
        .bind(now.to_rfc3339())
        .bind(&id.0)
        .bind(&request_id.0)
        .execute(&self.pool)
        .await
        .map_err(db_err)?;

        Ok(result.rows_affected() == 1)
    }

    async fn transfer_if_reserved_by(
        &self,
        id: &AssetId,
        request_id: &RequestId,
        department_id: &DepartmentId,
        now: DateTime<Utc>,
    ) -> Result<bool, StoreError> {
        let result = sqlx::query(
            "UPDATE asset
             SET current_department_id = ?,
                 utilization_status = 'in_use',
                 is_reserved = 0,
                 reserved_request_id = NULL,
                 reserved_by_department_id = NULL,
                 reserved_at = NULL,
                 updated_at = ?
             WHERE id = ?
               AND reserved_request_id = ?
               AND is_reserved = 1
               AND status = 'active'
               AND lifecycle_status = 'active'",
        )
        .bind(&department_id.0)
        .bind(now.to_rfc3339())
        .bind(&id.0)
        .bind(&request_id.0)
        .execute(&self.pool)
        .await
        .map_err(db_err)?;

        Ok(result.rows_affected() == 1)
    }

    async fn find_reserved_by_request(
        &self,
        request_id: &RequestId,
    ) -> Result<Vec<Asset>, StoreError> {
        let rows = sqlx::query(&format!(
            "SELECT {ASSET_COLUMNS} FROM asset WHERE reserved_request_id = ? ORDER BY id ASC"
        ))
        .bind(&request_id.0)
        .fetch_all(&self.pool)
        .await
        .map_err(db_err)?;

        rows.iter()
            .map(|row| row_to_asset(row).map_err(StoreError::from))
            .collect()
    }
}
