pub mod memory;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use thiserror::Error;

use crate::chain::Stage;
use crate::domain::asset::{Asset, AssetId, Reservation};
use crate::domain::request::{AssetRequest, RequestId, RequestLevel};
use crate::domain::{DepartmentId, OrganizationId};
use crate::errors::ApplicationError;

/// Storage failure as seen by the engine. Backends map their own error
/// types into this before it crosses the port boundary.
#[derive(Clone, Debug, Error, PartialEq, Eq)]
#[error("store failure: {0}")]
pub struct StoreError(pub String);

impl From<StoreError> for ApplicationError {
    fn from(value: StoreError) -> Self {
        ApplicationError::Persistence(value.0)
    }
}

/// Asset ledger port. The `*_if_*` methods are the conditional-update
/// primitives the engine's concurrency discipline depends on: each applies
/// its new state only while the expected prior state still holds, and
/// reports whether it did.
#[async_trait]
pub trait AssetStore: Send + Sync {
    async fn find_by_id(&self, id: &AssetId) -> Result<Option<Asset>, StoreError>;

    /// Batch read preserving input order; unknown ids are simply absent
    /// from the result.
    async fn find_many(&self, ids: &[AssetId]) -> Result<Vec<Asset>, StoreError>;

    /// Upsert. Used by ingestion/seeding and by compensating restores of
    /// assets the caller exclusively holds.
    async fn save(&self, asset: Asset) -> Result<(), StoreError>;

    /// Claim the asset iff it is still active, idle, and unreserved.
    async fn update_if_reservable(
        &self,
        id: &AssetId,
        reservation: Reservation,
        now: DateTime<Utc>,
    ) -> Result<bool, StoreError>;

    /// Clear the reservation iff it is still held by `request_id`.
    async fn release_if_held(
        &self,
        id: &AssetId,
        request_id: &RequestId,
        now: DateTime<Utc>,
    ) -> Result<bool, StoreError>;

    /// Move the asset to `department_id`, mark it in use, and clear the
    /// reservation, provided it is still reserved by `request_id` with an
    /// active status and lifecycle.
    async fn transfer_if_reserved_by(
        &self,
        id: &AssetId,
        request_id: &RequestId,
        department_id: &DepartmentId,
        now: DateTime<Utc>,
    ) -> Result<bool, StoreError>;

    async fn find_reserved_by_request(
        &self,
        request_id: &RequestId,
    ) -> Result<Vec<Asset>, StoreError>;
}

/// Request store port.
#[async_trait]
pub trait RequestStore: Send + Sync {
    async fn find_by_id(&self, id: &RequestId) -> Result<Option<AssetRequest>, StoreError>;

    /// Create only. Requests are never deleted and never blindly replaced.
    async fn insert(&self, request: AssetRequest) -> Result<(), StoreError>;

    /// Persist the whole aggregate iff `current_level` still equals
    /// `expected`. A `false` result means a concurrent writer won.
    async fn update_if_level(
        &self,
        expected: &RequestLevel,
        request: AssetRequest,
    ) -> Result<bool, StoreError>;

    async fn list_pending_for_stage(
        &self,
        stage: Stage,
        organization_id: &OrganizationId,
    ) -> Result<Vec<AssetRequest>, StoreError>;

    /// Requests the escalation sweep should consider: pending, escalation
    /// enabled, current level in `stages`. Due-time filtering is the
    /// sweeper's job.
    async fn list_escalation_candidates(
        &self,
        stages: &[Stage],
    ) -> Result<Vec<AssetRequest>, StoreError>;
}
