use std::sync::Arc;

use chrono::{DateTime, Utc};

use crate::domain::asset::{Asset, AssetId, Reservation};
use crate::domain::request::{
    ApprovalStep, AssetRequest, FinalStatus, FulfilledAsset, RejectedAsset, RequestId,
    RequestLevel, StepStatus,
};
use crate::domain::DepartmentId;
use crate::errors::{ApplicationError, DomainError};
use crate::store::AssetStore;

pub const FULFILLED_REMARK: &str = "Assets fulfilled and transferred";

/// Result of a fulfillment application. `prior_snapshots` holds the assets
/// as they were before the transfer so the caller can compensate if the
/// request-level conditional update loses a race.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct FulfillOutcome {
    pub fulfilled: usize,
    pub completed: bool,
    pub prior_snapshots: Vec<Asset>,
}

#[derive(Clone, Debug, PartialEq, Eq)]
pub struct RejectAssetsOutcome {
    pub released: usize,
    pub completed: bool,
    pub prior_snapshots: Vec<Asset>,
}

/// Enforces at-most-one-open-request-per-asset. All multi-asset operations
/// are all-or-nothing: preconditions are verified against a batch read,
/// state is applied through per-asset conditional updates, and a mid-batch
/// conditional-update failure rolls back the members already applied.
#[derive(Clone)]
pub struct ReservationCoordinator<A> {
    assets: Arc<A>,
}

impl<A> ReservationCoordinator<A>
where
    A: AssetStore,
{
    pub fn new(assets: Arc<A>) -> Self {
        Self { assets }
    }

    /// Claims every listed asset for the request, or none of them.
    pub async fn reserve(
        &self,
        request: &AssetRequest,
        department_id: &DepartmentId,
        asset_ids: &[AssetId],
        now: DateTime<Utc>,
    ) -> Result<usize, ApplicationError> {
        let batch = self.load_batch(asset_ids).await?;

        let satisfied = batch.iter().filter(|asset| asset.is_reservable()).count();
        if satisfied < asset_ids.len() {
            return Err(DomainError::AssetConflict { requested: asset_ids.len(), satisfied }.into());
        }

        let mut applied: Vec<AssetId> = Vec::with_capacity(asset_ids.len());
        for asset in &batch {
            let reservation =
                Reservation::held_by(request.id.clone(), department_id.clone(), now);
            let claimed = self
                .assets
                .update_if_reservable(&asset.id, reservation, now)
                .await?;
            if !claimed {
                // A concurrent claim won between the read and the update;
                // undo our partial progress and report the conflict.
                self.rollback_reservations(&applied, &request.id, now).await?;
                return Err(DomainError::AssetConflict {
                    requested: asset_ids.len(),
                    satisfied: applied.len(),
                }
                .into());
            }
            applied.push(asset.id.clone());
        }

        Ok(applied.len())
    }

    /// Clears every reservation the request still holds. Safe to repeat:
    /// a second call finds nothing to release.
    pub async fn release(
        &self,
        request_id: &RequestId,
        now: DateTime<Utc>,
    ) -> Result<usize, ApplicationError> {
        let held = self.assets.find_reserved_by_request(request_id).await?;
        let mut released = 0;
        for asset in held {
            if self.assets.release_if_held(&asset.id, request_id, now).await? {
                released += 1;
            }
        }
        Ok(released)
    }

    /// Binds reserved assets to the request: moves each to the request's
    /// destination department, marks it in use, clears its reservation, and
    /// records fulfillment progress. Closes the request when the total is
    /// reached.
    pub async fn fulfill(
        &self,
        request: &mut AssetRequest,
        asset_ids: &[AssetId],
        actor_id: &str,
        now: DateTime<Utc>,
    ) -> Result<FulfillOutcome, ApplicationError> {
        let batch = self.load_batch(asset_ids).await?;

        let satisfied = batch
            .iter()
            .filter(|asset| asset.is_fulfillable_by(&request.id))
            .count();
        if satisfied < asset_ids.len() {
            return Err(DomainError::AssetConflict { requested: asset_ids.len(), satisfied }.into());
        }

        let destination = request.scope.department_id.clone();
        let mut applied: Vec<Asset> = Vec::with_capacity(batch.len());
        for asset in &batch {
            let transferred = self
                .assets
                .transfer_if_reserved_by(&asset.id, &request.id, &destination, now)
                .await?;
            if !transferred {
                self.restore(&applied, now).await?;
                return Err(DomainError::AssetConflict {
                    requested: asset_ids.len(),
                    satisfied: applied.len(),
                }
                .into());
            }
            applied.push(asset.clone());
        }

        for asset in &applied {
            request.fulfillment.fulfilled_assets.push(FulfilledAsset {
                asset_id: asset.id.clone(),
                from_department_id: asset.current_department_id.clone(),
                fulfilled_by: actor_id.to_string(),
                fulfilled_at: now,
            });
            request.fulfillment.fulfilled_count += 1;
        }
        request.escalation.last_action_at = now;
        request.updated_at = now;

        let completed = close_if_satisfied(request, actor_id, now);

        Ok(FulfillOutcome { fulfilled: applied.len(), completed, prior_snapshots: applied })
    }

    /// Rejects offered assets out of a count-mode request: releases their
    /// reservations and records the rejection with the department each
    /// asset would have come from.
    pub async fn reject_assets(
        &self,
        request: &mut AssetRequest,
        asset_ids: &[AssetId],
        remarks: Option<String>,
        actor_id: &str,
        now: DateTime<Utc>,
    ) -> Result<RejectAssetsOutcome, ApplicationError> {
        if !request.is_count_mode() {
            return Err(DomainError::Validation(
                "assets can only be rejected out of count-mode requests".to_string(),
            )
            .into());
        }

        let batch = self.load_batch(asset_ids).await?;

        let satisfied = batch
            .iter()
            .filter(|asset| asset.reservation.is_held_by(&request.id))
            .count();
        if satisfied < asset_ids.len() {
            return Err(DomainError::AssetConflict { requested: asset_ids.len(), satisfied }.into());
        }

        let mut applied: Vec<Asset> = Vec::with_capacity(batch.len());
        for asset in &batch {
            let released = self.assets.release_if_held(&asset.id, &request.id, now).await?;
            if !released {
                self.restore(&applied, now).await?;
                return Err(DomainError::AssetConflict {
                    requested: asset_ids.len(),
                    satisfied: applied.len(),
                }
                .into());
            }
            applied.push(asset.clone());
        }

        for asset in &applied {
            // from_department_id is the department captured before release.
            request.rejected_assets.push(RejectedAsset {
                asset_id: asset.id.clone(),
                from_department_id: asset.current_department_id.clone(),
                rejected_by: actor_id.to_string(),
                rejected_at: now,
                remarks: remarks.clone(),
            });
        }
        request.escalation.last_action_at = now;
        request.updated_at = now;

        let completed = close_if_satisfied(request, actor_id, now);

        Ok(RejectAssetsOutcome { released: applied.len(), completed, prior_snapshots: applied })
    }

    /// Compensating restore of assets this request exclusively held. Only
    /// ever applied to snapshots taken while the reservation was ours, so
    /// no other writer can have legally touched them in between.
    pub async fn restore(
        &self,
        snapshots: &[Asset],
        now: DateTime<Utc>,
    ) -> Result<(), ApplicationError> {
        for snapshot in snapshots {
            let mut asset = snapshot.clone();
            asset.updated_at = now;
            self.assets.save(asset).await?;
        }
        Ok(())
    }

    async fn load_batch(&self, asset_ids: &[AssetId]) -> Result<Vec<Asset>, ApplicationError> {
        if asset_ids.is_empty() {
            return Err(
                DomainError::Validation("at least one asset must be named".to_string()).into()
            );
        }
        for (index, asset_id) in asset_ids.iter().enumerate() {
            if asset_ids[..index].contains(asset_id) {
                return Err(DomainError::Validation(format!(
                    "asset `{}` is listed more than once",
                    asset_id.0
                ))
                .into());
            }
        }

        let batch = self.assets.find_many(asset_ids).await?;
        if batch.len() < asset_ids.len() {
            let loaded: Vec<&AssetId> = batch.iter().map(|asset| &asset.id).collect();
            let missing = asset_ids
                .iter()
                .find(|id| !loaded.contains(id))
                .map(|id| id.0.clone())
                .unwrap_or_default();
            return Err(DomainError::NotFound { kind: "asset", id: missing }.into());
        }
        Ok(batch)
    }

    async fn rollback_reservations(
        &self,
        applied: &[AssetId],
        request_id: &RequestId,
        now: DateTime<Utc>,
    ) -> Result<(), ApplicationError> {
        for asset_id in applied {
            self.assets.release_if_held(asset_id, request_id, now).await?;
        }
        Ok(())
    }
}

/// Marks the current stage approved and closes the request once the
/// fulfilled count covers everything asked for.
fn close_if_satisfied(request: &mut AssetRequest, actor_id: &str, now: DateTime<Utc>) -> bool {
    if request.is_terminal() {
        return false;
    }
    if request.fulfillment.fulfilled_count < request.total_requested() {
        return false;
    }

    if let Some(stage) = request.current_stage() {
        request.approval_flow.insert(
            stage,
            ApprovalStep::decided(
                StepStatus::Approved,
                actor_id,
                now,
                Some(FULFILLED_REMARK.to_string()),
            ),
        );
    }
    request.final_status = FinalStatus::Approved;
    request.current_level = RequestLevel::Completed;
    true
}

#[cfg(test)]
mod tests {
    use std::sync::Arc;

    use async_trait::async_trait;
    use chrono::{DateTime, Utc};

    use crate::chain::Stage;
    use crate::domain::asset::{
        Asset, AssetId, AssetStatus, LifecycleStatus, Reservation, UtilizationStatus,
    };
    use crate::domain::request::{
        AssetRequest, FinalStatus, Priority, RequestId, RequestLevel, RequestMode, RequestScope,
        RequestSeed, RequestType, ScopeLevel, StepStatus,
    };
    use crate::domain::{DepartmentId, HospitalId, OrganizationId};
    use crate::errors::{ApplicationError, DomainError};
    use crate::store::memory::InMemoryAssetStore;
    use crate::store::{AssetStore, StoreError};

    use super::{ReservationCoordinator, FULFILLED_REMARK};

    fn asset(id: &str, department: &str) -> Asset {
        let now = Utc::now();
        Asset {
            id: AssetId(id.to_string()),
            name: format!("Asset {id}"),
            current_department_id: DepartmentId(department.to_string()),
            status: AssetStatus::Active,
            lifecycle_status: LifecycleStatus::Active,
            utilization_status: UtilizationStatus::NotInUse,
            reservation: Reservation::free(),
            created_at: now,
            updated_at: now,
        }
    }

    fn request(id: &str, mode: RequestMode) -> AssetRequest {
        AssetRequest::create(
            RequestSeed {
                id: RequestId(id.to_string()),
                request_type: match mode {
                    RequestMode::Assets(_) => RequestType::AssetTransfer,
                    RequestMode::Count(_) => RequestType::Procurement,
                },
                mode,
                scope: RequestScope {
                    level: ScopeLevel::SameHospital,
                    department_id: DepartmentId("dept-icu".to_string()),
                    hospital_id: HospitalId("hosp-1".to_string()),
                    organization_id: OrganizationId("org-1".to_string()),
                },
                justification: "test".to_string(),
                priority: Priority::Medium,
                estimated_cost: None,
                requested_by: "user-req".to_string(),
                escalation_enabled: true,
                escalate_after_hours: 24,
            },
            Stage::Level1,
            &[Stage::Level1, Stage::Hod, Stage::Cfo],
            Utc::now(),
        )
        .expect("valid request")
    }

    fn ids(raw: &[&str]) -> Vec<AssetId> {
        raw.iter().map(|id| AssetId(id.to_string())).collect()
    }

    async fn store_with(assets: Vec<Asset>) -> Arc<InMemoryAssetStore> {
        let store = Arc::new(InMemoryAssetStore::default());
        for asset in assets {
            store.save(asset).await.expect("save");
        }
        store
    }

    #[tokio::test]
    async fn reserve_claims_every_asset_for_the_request() {
        let store = store_with(vec![asset("AST-1", "dept-er"), asset("AST-2", "dept-er")]).await;
        let coordinator = ReservationCoordinator::new(store.clone());
        let request = request("REQ-1", RequestMode::Assets(ids(&["AST-1", "AST-2"])));

        let reserved = coordinator
            .reserve(&request, &DepartmentId("dept-icu".to_string()), &ids(&["AST-1", "AST-2"]), Utc::now())
            .await
            .expect("reserve");
        assert_eq!(reserved, 2);

        for id in ids(&["AST-1", "AST-2"]) {
            let stored = store.find_by_id(&id).await.expect("find").expect("exists");
            assert!(stored.reservation.is_held_by(&request.id));
        }
    }

    #[tokio::test]
    async fn reserve_is_all_or_nothing_when_one_asset_is_taken() {
        let mut taken = asset("AST-2", "dept-er");
        taken.reservation = Reservation::held_by(
            RequestId("REQ-OTHER".to_string()),
            DepartmentId("dept-or".to_string()),
            Utc::now(),
        );
        let store = store_with(vec![
            asset("AST-1", "dept-er"),
            taken,
            asset("AST-3", "dept-er"),
        ])
        .await;
        let coordinator = ReservationCoordinator::new(store.clone());
        let request = request("REQ-1", RequestMode::Count(3));

        let error = coordinator
            .reserve(
                &request,
                &DepartmentId("dept-icu".to_string()),
                &ids(&["AST-1", "AST-2", "AST-3"]),
                Utc::now(),
            )
            .await
            .expect_err("conflict");
        assert!(matches!(
            error,
            ApplicationError::Domain(DomainError::AssetConflict { requested: 3, satisfied: 2 })
        ));

        // No partial reservation committed.
        for id in ids(&["AST-1", "AST-3"]) {
            let stored = store.find_by_id(&id).await.expect("find").expect("exists");
            assert!(!stored.reservation.is_reserved);
        }
    }

    /// Delegating store that makes the conditional update lose for one
    /// asset even though the read said it was reservable, imitating a
    /// concurrent claim landing between read and write.
    struct RacingAssetStore {
        inner: Arc<InMemoryAssetStore>,
        contested: AssetId,
    }

    #[async_trait]
    impl AssetStore for RacingAssetStore {
        async fn find_by_id(&self, id: &AssetId) -> Result<Option<Asset>, StoreError> {
            self.inner.find_by_id(id).await
        }

        async fn find_many(&self, ids: &[AssetId]) -> Result<Vec<Asset>, StoreError> {
            self.inner.find_many(ids).await
        }

        async fn save(&self, asset: Asset) -> Result<(), StoreError> {
            self.inner.save(asset).await
        }

        async fn update_if_reservable(
            &self,
            id: &AssetId,
            reservation: Reservation,
            now: DateTime<Utc>,
        ) -> Result<bool, StoreError> {
            if *id == self.contested {
                return Ok(false);
            }
            self.inner.update_if_reservable(id, reservation, now).await
        }

        async fn release_if_held(
            &self,
            id: &AssetId,
            request_id: &RequestId,
            now: DateTime<Utc>,
        ) -> Result<bool, StoreError> {
            self.inner.release_if_held(id, request_id, now).await
        }

        async fn transfer_if_reserved_by(
            &self,
            id: &AssetId,
            request_id: &RequestId,
            department_id: &DepartmentId,
            now: DateTime<Utc>,
        ) -> Result<bool, StoreError> {
            self.inner.transfer_if_reserved_by(id, request_id, department_id, now).await
        }

        async fn find_reserved_by_request(
            &self,
            request_id: &RequestId,
        ) -> Result<Vec<Asset>, StoreError> {
            self.inner.find_reserved_by_request(request_id).await
        }
    }

    #[tokio::test]
    async fn losing_a_cas_race_mid_batch_rolls_back_earlier_claims() {
        let inner = store_with(vec![
            asset("AST-1", "dept-er"),
            asset("AST-2", "dept-er"),
            asset("AST-3", "dept-er"),
        ])
        .await;
        let store = Arc::new(RacingAssetStore {
            inner: inner.clone(),
            contested: AssetId("AST-3".to_string()),
        });
        let coordinator = ReservationCoordinator::new(store);
        let request = request("REQ-1", RequestMode::Count(3));

        let error = coordinator
            .reserve(
                &request,
                &DepartmentId("dept-icu".to_string()),
                &ids(&["AST-1", "AST-2", "AST-3"]),
                Utc::now(),
            )
            .await
            .expect_err("conflict");
        assert!(matches!(
            error,
            ApplicationError::Domain(DomainError::AssetConflict { .. })
        ));

        // The two claims that landed first were compensated.
        for id in ids(&["AST-1", "AST-2", "AST-3"]) {
            let stored = inner.find_by_id(&id).await.expect("find").expect("exists");
            assert!(!stored.reservation.is_reserved, "{} must be unreserved", id.0);
        }
    }

    #[tokio::test]
    async fn release_twice_is_the_same_as_release_once() {
        let store = store_with(vec![asset("AST-1", "dept-er"), asset("AST-2", "dept-er")]).await;
        let coordinator = ReservationCoordinator::new(store.clone());
        let request = request("REQ-1", RequestMode::Assets(ids(&["AST-1", "AST-2"])));

        coordinator
            .reserve(&request, &DepartmentId("dept-icu".to_string()), &ids(&["AST-1", "AST-2"]), Utc::now())
            .await
            .expect("reserve");

        let first = coordinator.release(&request.id, Utc::now()).await.expect("release");
        assert_eq!(first, 2);
        let states_after_first: Vec<Asset> = store
            .find_many(&ids(&["AST-1", "AST-2"]))
            .await
            .expect("find");

        let second = coordinator.release(&request.id, Utc::now()).await.expect("release again");
        assert_eq!(second, 0);
        let states_after_second: Vec<Asset> = store
            .find_many(&ids(&["AST-1", "AST-2"]))
            .await
            .expect("find");

        assert_eq!(states_after_first, states_after_second);
    }

    #[tokio::test]
    async fn fulfillment_across_calls_accumulates_and_auto_completes() {
        let store = store_with(vec![
            asset("AST-1", "dept-er"),
            asset("AST-2", "dept-or"),
            asset("AST-3", "dept-er"),
        ])
        .await;
        let coordinator = ReservationCoordinator::new(store.clone());
        let mut request = request("REQ-1", RequestMode::Count(3));

        coordinator
            .reserve(
                &request,
                &DepartmentId("dept-icu".to_string()),
                &ids(&["AST-1", "AST-2", "AST-3"]),
                Utc::now(),
            )
            .await
            .expect("reserve");

        let first = coordinator
            .fulfill(&mut request, &ids(&["AST-1", "AST-2"]), "user-keeper", Utc::now())
            .await
            .expect("first fulfillment");
        assert_eq!(first.fulfilled, 2);
        assert!(!first.completed);
        assert_eq!(request.fulfillment.fulfilled_count, 2);
        assert_eq!(request.final_status, FinalStatus::Pending);

        let second = coordinator
            .fulfill(&mut request, &ids(&["AST-3"]), "user-keeper", Utc::now())
            .await
            .expect("second fulfillment");
        assert!(second.completed);
        assert_eq!(request.fulfillment.fulfilled_count, 3);
        assert_eq!(request.final_status, FinalStatus::Approved);
        assert_eq!(request.current_level, RequestLevel::Completed);
        assert!(request.status_is_consistent());

        // Closing approval carries the fulfillment remark.
        let step = request
            .approval_flow
            .get(&Stage::Level1)
            .expect("closing step recorded");
        assert_eq!(step.status, StepStatus::Approved);
        assert_eq!(step.remarks.as_deref(), Some(FULFILLED_REMARK));

        // Fulfilled assets moved to the requesting department, in use,
        // unreserved, with their source department recorded.
        let moved = store
            .find_by_id(&AssetId("AST-2".to_string()))
            .await
            .expect("find")
            .expect("exists");
        assert_eq!(moved.current_department_id, DepartmentId("dept-icu".to_string()));
        assert_eq!(moved.utilization_status, UtilizationStatus::InUse);
        assert!(!moved.reservation.is_reserved);
        let recorded = request
            .fulfillment
            .fulfilled_assets
            .iter()
            .find(|entry| entry.asset_id.0 == "AST-2")
            .expect("recorded");
        assert_eq!(recorded.from_department_id, DepartmentId("dept-or".to_string()));
    }

    #[tokio::test]
    async fn fulfill_rejects_assets_reserved_by_another_request() {
        let store = store_with(vec![asset("AST-1", "dept-er")]).await;
        let coordinator = ReservationCoordinator::new(store.clone());
        let other = request("REQ-OTHER", RequestMode::Count(1));
        coordinator
            .reserve(&other, &DepartmentId("dept-or".to_string()), &ids(&["AST-1"]), Utc::now())
            .await
            .expect("reserve for other");

        let mut mine = request("REQ-1", RequestMode::Count(1));
        let error = coordinator
            .fulfill(&mut mine, &ids(&["AST-1"]), "user-keeper", Utc::now())
            .await
            .expect_err("conflict");
        assert!(matches!(
            error,
            ApplicationError::Domain(DomainError::AssetConflict { requested: 1, satisfied: 0 })
        ));
        assert_eq!(mine.fulfillment.fulfilled_count, 0);
    }

    #[tokio::test]
    async fn rejecting_assets_is_count_mode_only() {
        let store = store_with(vec![asset("AST-1", "dept-er")]).await;
        let coordinator = ReservationCoordinator::new(store);
        let mut transfer = request("REQ-1", RequestMode::Assets(ids(&["AST-1"])));

        let error = coordinator
            .reject_assets(&mut transfer, &ids(&["AST-1"]), None, "user-keeper", Utc::now())
            .await
            .expect_err("asset mode");
        assert!(matches!(
            error,
            ApplicationError::Domain(DomainError::Validation(_))
        ));
    }

    #[tokio::test]
    async fn rejected_assets_record_their_source_department_before_release() {
        let store = store_with(vec![asset("AST-1", "dept-er"), asset("AST-2", "dept-or")]).await;
        let coordinator = ReservationCoordinator::new(store.clone());
        let mut request = request("REQ-1", RequestMode::Count(2));

        coordinator
            .reserve(&request, &DepartmentId("dept-icu".to_string()), &ids(&["AST-1", "AST-2"]), Utc::now())
            .await
            .expect("reserve");

        let outcome = coordinator
            .reject_assets(
                &mut request,
                &ids(&["AST-2"]),
                Some("wrong model".to_string()),
                "user-keeper",
                Utc::now(),
            )
            .await
            .expect("reject assets");
        assert_eq!(outcome.released, 1);
        assert!(!outcome.completed);

        let entry = request.rejected_assets.first().expect("entry recorded");
        assert_eq!(entry.asset_id.0, "AST-2");
        assert_eq!(entry.from_department_id, DepartmentId("dept-or".to_string()));
        assert_eq!(entry.remarks.as_deref(), Some("wrong model"));

        let released = store
            .find_by_id(&AssetId("AST-2".to_string()))
            .await
            .expect("find")
            .expect("exists");
        assert!(!released.reservation.is_reserved);
    }

    #[tokio::test]
    async fn rejecting_surplus_after_completion_only_releases() {
        let store = store_with(vec![
            asset("AST-1", "dept-er"),
            asset("AST-2", "dept-er"),
            asset("AST-3", "dept-or"),
        ])
        .await;
        let coordinator = ReservationCoordinator::new(store.clone());
        let mut request = request("REQ-1", RequestMode::Count(2));

        coordinator
            .reserve(
                &request,
                &DepartmentId("dept-icu".to_string()),
                &ids(&["AST-1", "AST-2", "AST-3"]),
                Utc::now(),
            )
            .await
            .expect("reserve");
        coordinator
            .fulfill(&mut request, &ids(&["AST-1", "AST-2"]), "user-keeper", Utc::now())
            .await
            .expect("fulfill to the count");
        assert_eq!(request.current_level, RequestLevel::Completed);

        // The surplus offer is rejected after completion; the request is
        // already closed, so only the release and the record happen.
        let outcome = coordinator
            .reject_assets(&mut request, &ids(&["AST-3"]), None, "user-keeper", Utc::now())
            .await
            .expect("reject surplus");
        assert_eq!(outcome.released, 1);
        assert!(!outcome.completed, "already closed requests are not closed again");
        assert!(request.status_is_consistent());
    }
}
