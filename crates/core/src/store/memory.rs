use std::collections::HashMap;
use std::sync::{Mutex, MutexGuard};

use async_trait::async_trait;
use chrono::{DateTime, Utc};

use crate::chain::Stage;
use crate::domain::asset::{Asset, AssetId, Reservation, UtilizationStatus};
use crate::domain::request::{AssetRequest, FinalStatus, RequestId, RequestLevel};
use crate::domain::{DepartmentId, OrganizationId};

use super::{AssetStore, RequestStore, StoreError};

fn lock_or_recover<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    match mutex.lock() {
        Ok(guard) => guard,
        Err(poisoned) => poisoned.into_inner(),
    }
}

#[derive(Default)]
pub struct InMemoryAssetStore {
    assets: Mutex<HashMap<String, Asset>>,
}

#[async_trait]
impl AssetStore for InMemoryAssetStore {
    async fn find_by_id(&self, id: &AssetId) -> Result<Option<Asset>, StoreError> {
        let assets = lock_or_recover(&self.assets);
        Ok(assets.get(&id.0).cloned())
    }

    async fn find_many(&self, ids: &[AssetId]) -> Result<Vec<Asset>, StoreError> {
        let assets = lock_or_recover(&self.assets);
        Ok(ids.iter().filter_map(|id| assets.get(&id.0).cloned()).collect())
    }

    async fn save(&self, asset: Asset) -> Result<(), StoreError> {
        let mut assets = lock_or_recover(&self.assets);
        assets.insert(asset.id.0.clone(), asset);
        Ok(())
    }

    async fn update_if_reservable(
        &self,
        id: &AssetId,
        reservation: Reservation,
        now: DateTime<Utc>,
    ) -> Result<bool, StoreError> {
        let mut assets = lock_or_recover(&self.assets);
        match assets.get_mut(&id.0) {
            Some(asset) if asset.is_reservable() => {
                asset.reservation = reservation;
                asset.updated_at = now;
                Ok(true)
            }
            _ => Ok(false),
        }
    }

    async fn release_if_held(
        &self,
        id: &AssetId,
        request_id: &RequestId,
        now: DateTime<Utc>,
    ) -> Result<bool, StoreError> {
        let mut assets = lock_or_recover(&self.assets);
        match assets.get_mut(&id.0) {
            Some(asset) if asset.reservation.request_id.as_ref() == Some(request_id) => {
                asset.reservation = Reservation::free();
                asset.updated_at = now;
                Ok(true)
            }
            _ => Ok(false),
        }
    }

    async fn transfer_if_reserved_by(
        &self,
        id: &AssetId,
        request_id: &RequestId,
        department_id: &DepartmentId,
        now: DateTime<Utc>,
    ) -> Result<bool, StoreError> {
        let mut assets = lock_or_recover(&self.assets);
        match assets.get_mut(&id.0) {
            Some(asset) if asset.is_fulfillable_by(request_id) => {
                asset.current_department_id = department_id.clone();
                asset.utilization_status = UtilizationStatus::InUse;
                asset.reservation = Reservation::free();
                asset.updated_at = now;
                Ok(true)
            }
            _ => Ok(false),
        }
    }

    async fn find_reserved_by_request(
        &self,
        request_id: &RequestId,
    ) -> Result<Vec<Asset>, StoreError> {
        let assets = lock_or_recover(&self.assets);
        let mut held: Vec<Asset> = assets
            .values()
            .filter(|asset| asset.reservation.request_id.as_ref() == Some(request_id))
            .cloned()
            .collect();
        held.sort_by(|left, right| left.id.cmp(&right.id));
        Ok(held)
    }
}

#[derive(Default)]
pub struct InMemoryRequestStore {
    requests: Mutex<HashMap<String, AssetRequest>>,
}

#[async_trait]
impl RequestStore for InMemoryRequestStore {
    async fn find_by_id(&self, id: &RequestId) -> Result<Option<AssetRequest>, StoreError> {
        let requests = lock_or_recover(&self.requests);
        Ok(requests.get(&id.0).cloned())
    }

    async fn insert(&self, request: AssetRequest) -> Result<(), StoreError> {
        let mut requests = lock_or_recover(&self.requests);
        if requests.contains_key(&request.id.0) {
            return Err(StoreError(format!("request `{}` already exists", request.id.0)));
        }
        requests.insert(request.id.0.clone(), request);
        Ok(())
    }

    async fn update_if_level(
        &self,
        expected: &RequestLevel,
        request: AssetRequest,
    ) -> Result<bool, StoreError> {
        let mut requests = lock_or_recover(&self.requests);
        match requests.get_mut(&request.id.0) {
            Some(stored) if stored.current_level == *expected => {
                *stored = request;
                Ok(true)
            }
            _ => Ok(false),
        }
    }

    async fn list_pending_for_stage(
        &self,
        stage: Stage,
        organization_id: &OrganizationId,
    ) -> Result<Vec<AssetRequest>, StoreError> {
        let requests = lock_or_recover(&self.requests);
        let mut pending: Vec<AssetRequest> = requests
            .values()
            .filter(|request| {
                request.final_status == FinalStatus::Pending
                    && request.current_level == RequestLevel::Stage(stage)
                    && request.scope.organization_id == *organization_id
            })
            .cloned()
            .collect();
        pending.sort_by(|left, right| left.created_at.cmp(&right.created_at));
        Ok(pending)
    }

    async fn list_escalation_candidates(
        &self,
        stages: &[Stage],
    ) -> Result<Vec<AssetRequest>, StoreError> {
        let requests = lock_or_recover(&self.requests);
        let mut candidates: Vec<AssetRequest> = requests
            .values()
            .filter(|request| {
                request.final_status == FinalStatus::Pending
                    && request.escalation.enabled
                    && request
                        .current_stage()
                        .is_some_and(|stage| stages.contains(&stage))
            })
            .cloned()
            .collect();
        candidates.sort_by(|left, right| left.created_at.cmp(&right.created_at));
        Ok(candidates)
    }
}

#[cfg(test)]
mod tests {
    use chrono::Utc;

    use crate::chain::Stage;
    use crate::domain::asset::{
        Asset, AssetId, AssetStatus, LifecycleStatus, Reservation, UtilizationStatus,
    };
    use crate::domain::request::{
        AssetRequest, Priority, RequestId, RequestMode, RequestScope, RequestSeed, RequestType,
        ScopeLevel,
    };
    use crate::domain::{DepartmentId, HospitalId, OrganizationId};
    use crate::store::{AssetStore, RequestStore};

    use super::{InMemoryAssetStore, InMemoryRequestStore};

    fn asset(id: &str) -> Asset {
        let now = Utc::now();
        Asset {
            id: AssetId(id.to_string()),
            name: "Ventilator".to_string(),
            current_department_id: DepartmentId("dept-er".to_string()),
            status: AssetStatus::Active,
            lifecycle_status: LifecycleStatus::Active,
            utilization_status: UtilizationStatus::NotInUse,
            reservation: Reservation::free(),
            created_at: now,
            updated_at: now,
        }
    }

    fn request(id: &str) -> AssetRequest {
        AssetRequest::create(
            RequestSeed {
                id: RequestId(id.to_string()),
                request_type: RequestType::Procurement,
                mode: RequestMode::Count(1),
                scope: RequestScope {
                    level: ScopeLevel::SameHospital,
                    department_id: DepartmentId("dept-icu".to_string()),
                    hospital_id: HospitalId("hosp-1".to_string()),
                    organization_id: OrganizationId("org-1".to_string()),
                },
                justification: "test".to_string(),
                priority: Priority::Medium,
                estimated_cost: None,
                requested_by: "user-1".to_string(),
                escalation_enabled: true,
                escalate_after_hours: 24,
            },
            Stage::Level1,
            &[Stage::Level1, Stage::Hod, Stage::Cfo],
            Utc::now(),
        )
        .expect("valid request")
    }

    #[tokio::test]
    async fn reserve_cas_claims_only_reservable_assets() {
        let store = InMemoryAssetStore::default();
        store.save(asset("AST-1")).await.expect("save");

        let now = Utc::now();
        let reservation = Reservation::held_by(
            RequestId("REQ-1".to_string()),
            DepartmentId("dept-icu".to_string()),
            now,
        );

        let claimed = store
            .update_if_reservable(&AssetId("AST-1".to_string()), reservation.clone(), now)
            .await
            .expect("cas");
        assert!(claimed);

        // Second claim must lose: the asset is no longer reservable.
        let reclaimed = store
            .update_if_reservable(&AssetId("AST-1".to_string()), reservation, now)
            .await
            .expect("cas");
        assert!(!reclaimed);
    }

    #[tokio::test]
    async fn release_is_conditional_on_the_holder() {
        let store = InMemoryAssetStore::default();
        let mut held = asset("AST-1");
        held.reservation = Reservation::held_by(
            RequestId("REQ-1".to_string()),
            DepartmentId("dept-icu".to_string()),
            Utc::now(),
        );
        store.save(held).await.expect("save");

        let now = Utc::now();
        let wrong_holder = store
            .release_if_held(&AssetId("AST-1".to_string()), &RequestId("REQ-2".to_string()), now)
            .await
            .expect("cas");
        assert!(!wrong_holder);

        let released = store
            .release_if_held(&AssetId("AST-1".to_string()), &RequestId("REQ-1".to_string()), now)
            .await
            .expect("cas");
        assert!(released);

        let again = store
            .release_if_held(&AssetId("AST-1".to_string()), &RequestId("REQ-1".to_string()), now)
            .await
            .expect("cas");
        assert!(!again, "release is a no-op once the reservation is gone");
    }

    #[tokio::test]
    async fn request_cas_rejects_stale_expectations() {
        let store = InMemoryRequestStore::default();
        let request = request("REQ-1");
        store.insert(request.clone()).await.expect("insert");

        let mut advanced = request.clone();
        advanced.current_level =
            crate::domain::request::RequestLevel::Stage(Stage::Hod);

        let applied = store
            .update_if_level(&request.current_level, advanced.clone())
            .await
            .expect("cas");
        assert!(applied);

        // The original expectation is now stale.
        let stale = store
            .update_if_level(&request.current_level, advanced)
            .await
            .expect("cas");
        assert!(!stale);
    }

    #[tokio::test]
    async fn insert_refuses_duplicate_request_ids() {
        let store = InMemoryRequestStore::default();
        store.insert(request("REQ-1")).await.expect("first insert");
        assert!(store.insert(request("REQ-1")).await.is_err());
    }
}
