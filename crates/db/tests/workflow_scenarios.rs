//! End-to-end workflow scenarios driven through the SQL stores.

use std::sync::Arc;

use chrono::Utc;

use wardflow_core::audit::InMemoryAuditSink;
use wardflow_core::chain::Stage;
use wardflow_core::domain::asset::{
    Asset, AssetId, AssetStatus, LifecycleStatus, Reservation, UtilizationStatus,
};
use wardflow_core::domain::request::{
    FinalStatus, Priority, RequestLevel, RequestMode, RequestScope, RequestType, ScopeLevel,
};
use wardflow_core::domain::{DepartmentId, HospitalId, OrganizationId};
use wardflow_core::errors::{ApplicationError, DomainError};
use wardflow_core::notify::InMemoryNotificationSink;
use wardflow_core::service::{NewRequestInput, RequestService};
use wardflow_core::store::AssetStore;
use wardflow_core::workflow::{Actor, ApprovalEngine};
use wardflow_db::{connect_with_settings, migrations, SqlAssetStore, SqlRequestStore};

type SqlService =
    RequestService<SqlAssetStore, SqlRequestStore, InMemoryAuditSink, InMemoryNotificationSink>;

struct Harness {
    service: SqlService,
    assets: Arc<SqlAssetStore>,
}

async fn harness(asset_seeds: &[(&str, &str)]) -> Harness {
    let pool = connect_with_settings("sqlite::memory:", 1, 30).await.expect("connect");
    migrations::run_pending(&pool).await.expect("migrations");

    let assets = Arc::new(SqlAssetStore::new(pool.clone()));
    for (id, department) in asset_seeds {
        let now = Utc::now();
        assets
            .save(Asset {
                id: AssetId(id.to_string()),
                name: format!("Asset {id}"),
                current_department_id: DepartmentId(department.to_string()),
                status: AssetStatus::Active,
                lifecycle_status: LifecycleStatus::Active,
                utilization_status: UtilizationStatus::NotInUse,
                reservation: Reservation::free(),
                created_at: now,
                updated_at: now,
            })
            .await
            .expect("seed asset");
    }

    let service = RequestService::new(
        assets.clone(),
        Arc::new(SqlRequestStore::new(pool)),
        ApprovalEngine::canonical(),
        Arc::new(InMemoryAuditSink::default()),
        Arc::new(InMemoryNotificationSink::default()),
    );

    Harness { service, assets }
}

fn actor(role: &str, department: &str) -> Actor {
    Actor {
        actor_id: format!("user-{role}"),
        role: role.to_string(),
        organization_id: OrganizationId("org-1".to_string()),
        hospital_id: HospitalId("hosp-1".to_string()),
        department_id: DepartmentId(department.to_string()),
    }
}

fn input(request_type: RequestType, mode: RequestMode) -> NewRequestInput {
    NewRequestInput {
        request_type,
        scope: RequestScope {
            level: ScopeLevel::SameHospital,
            department_id: DepartmentId("dept-icu".to_string()),
            hospital_id: HospitalId("hosp-1".to_string()),
            organization_id: OrganizationId("org-1".to_string()),
        },
        mode,
        justification: "ward expansion".to_string(),
        priority: Priority::High,
        estimated_cost: None,
        escalation_enabled: None,
        escalate_after_hours: None,
    }
}

fn ids(raw: &[&str]) -> Vec<AssetId> {
    raw.iter().map(|id| AssetId(id.to_string())).collect()
}

#[tokio::test]
async fn transfer_request_lifecycle_reserves_and_rejection_releases() {
    let hx = harness(&[("AST-1", "dept-er"), ("AST-2", "dept-er")]).await;

    let request = hx
        .service
        .create_request(
            input(RequestType::AssetTransfer, RequestMode::Assets(ids(&["AST-1", "AST-2"]))),
            &actor("requester", "dept-icu"),
        )
        .await
        .expect("create transfer");

    for id in ids(&["AST-1", "AST-2"]) {
        let stored = hx.assets.find_by_id(&id).await.expect("find").expect("exists");
        assert!(stored.reservation.is_held_by(&request.id), "{} should be reserved", id.0);
    }

    let rejected = hx
        .service
        .reject_request(&request.id, &actor("supervisor", "dept-icu"), Some("duplicate".into()))
        .await
        .expect("reject");
    assert_eq!(rejected.final_status, FinalStatus::Rejected);
    assert_eq!(rejected.current_level, RequestLevel::Rejected);

    for id in ids(&["AST-1", "AST-2"]) {
        let stored = hx.assets.find_by_id(&id).await.expect("find").expect("exists");
        assert!(!stored.reservation.is_reserved, "{} should be free again", id.0);
    }
}

#[tokio::test]
async fn two_requests_cannot_claim_the_same_asset() {
    let hx = harness(&[("AST-1", "dept-er"), ("AST-2", "dept-er")]).await;
    let requester = actor("requester", "dept-icu");

    hx.service
        .create_request(
            input(RequestType::AssetTransfer, RequestMode::Assets(ids(&["AST-1"]))),
            &requester,
        )
        .await
        .expect("first claim");

    let error = hx
        .service
        .create_request(
            input(RequestType::AssetTransfer, RequestMode::Assets(ids(&["AST-1", "AST-2"]))),
            &requester,
        )
        .await
        .expect_err("second claim must conflict");
    assert!(matches!(
        error,
        ApplicationError::Domain(DomainError::AssetConflict { requested: 2, satisfied: 1 })
    ));

    // The conflicting request committed nothing.
    let untouched = hx
        .assets
        .find_by_id(&AssetId("AST-2".to_string()))
        .await
        .expect("find")
        .expect("exists");
    assert!(!untouched.reservation.is_reserved);
}

#[tokio::test]
async fn procurement_approval_chain_runs_to_completion() {
    let hx = harness(&[]).await;

    let request = hx
        .service
        .create_request(
            input(RequestType::Procurement, RequestMode::Count(2)),
            &actor("requester", "dept-icu"),
        )
        .await
        .expect("create procurement");
    assert_eq!(request.current_level, RequestLevel::Stage(Stage::Level1));

    hx.service
        .approve_request(&request.id, &actor("supervisor", "dept-icu"), None)
        .await
        .expect("level1 approval");
    hx.service
        .approve_request(&request.id, &actor("hod", "dept-icu"), None)
        .await
        .expect("hod approval");
    let approved = hx
        .service
        .approve_request(&request.id, &actor("cfo", "dept-icu"), Some("cleared".into()))
        .await
        .expect("cfo approval");

    assert_eq!(approved.final_status, FinalStatus::Approved);
    assert_eq!(approved.current_level, RequestLevel::Completed);
    assert!(approved.status_is_consistent());
}

#[tokio::test]
async fn count_mode_offers_fulfill_and_auto_complete() {
    let hx = harness(&[("AST-1", "dept-er"), ("AST-2", "dept-or"), ("AST-3", "dept-er")]).await;

    let request = hx
        .service
        .create_request(
            input(RequestType::Procurement, RequestMode::Count(3)),
            &actor("requester", "dept-icu"),
        )
        .await
        .expect("create procurement");

    let keeper = actor("keeper", "dept-er");
    hx.service
        .reserve_specific_assets(&request.id, &keeper, &ids(&["AST-1", "AST-2", "AST-3"]))
        .await
        .expect("offer assets");

    // Fulfillment lands across two calls; the third asset closes it.
    hx.service
        .fulfill_request(&request.id, &keeper, &ids(&["AST-1", "AST-2"]))
        .await
        .expect("partial fulfillment");
    let fulfilled = hx
        .service
        .fulfill_request(&request.id, &keeper, &ids(&["AST-3"]))
        .await
        .expect("closing fulfillment");

    assert_eq!(fulfilled.final_status, FinalStatus::Approved);
    assert_eq!(fulfilled.current_level, RequestLevel::Completed);
    assert_eq!(fulfilled.fulfillment.fulfilled_count, 3);
    assert_eq!(fulfilled.fulfillment.fulfilled_assets.len(), 3);

    let moved = hx
        .assets
        .find_by_id(&AssetId("AST-2".to_string()))
        .await
        .expect("find")
        .expect("exists");
    assert_eq!(moved.current_department_id, DepartmentId("dept-icu".to_string()));
    assert_eq!(moved.utilization_status, UtilizationStatus::InUse);
    assert!(!moved.reservation.is_reserved);

    // The recorded source department survives persistence.
    let reloaded = hx
        .service
        .list_pending_for_actor(&actor("supervisor", "dept-icu"))
        .await
        .expect("queue");
    assert!(reloaded.is_empty(), "completed requests leave the pending queue");
}

#[tokio::test]
async fn rejected_offers_are_released_and_recorded() {
    let hx = harness(&[("AST-1", "dept-er"), ("AST-2", "dept-or")]).await;

    let request = hx
        .service
        .create_request(
            input(RequestType::Procurement, RequestMode::Count(1)),
            &actor("requester", "dept-icu"),
        )
        .await
        .expect("create procurement");

    let keeper = actor("keeper", "dept-er");
    hx.service
        .reserve_specific_assets(&request.id, &keeper, &ids(&["AST-1", "AST-2"]))
        .await
        .expect("offer");

    let updated = hx
        .service
        .reject_request_assets(&request.id, &keeper, &ids(&["AST-2"]), Some("too old".into()))
        .await
        .expect("reject offer");

    assert_eq!(updated.rejected_assets.len(), 1);
    assert_eq!(updated.rejected_assets[0].from_department_id.0, "dept-or");

    let released = hx
        .assets
        .find_by_id(&AssetId("AST-2".to_string()))
        .await
        .expect("find")
        .expect("exists");
    assert!(!released.reservation.is_reserved);

    let still_held = hx
        .assets
        .find_by_id(&AssetId("AST-1".to_string()))
        .await
        .expect("find")
        .expect("exists");
    assert!(still_held.reservation.is_held_by(&request.id));
}
