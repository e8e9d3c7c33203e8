use chrono::Utc;
use std::sync::Arc;

use crate::commands::CommandResult;
use wardflow_core::config::{AppConfig, LoadOptions};
use wardflow_core::domain::asset::{
    Asset, AssetId, AssetStatus, LifecycleStatus, Reservation, UtilizationStatus,
};
use wardflow_core::domain::request::{
    Priority, RequestId, RequestMode, RequestScope, RequestSeed, RequestType, ScopeLevel,
};
use wardflow_core::domain::{DepartmentId, HospitalId, OrganizationId};
use wardflow_core::store::{AssetStore, RequestStore};
use wardflow_core::workflow::ApprovalEngine;
use wardflow_db::{connect_with_settings, migrations, SqlAssetStore, SqlRequestStore};

const DEMO_PROCUREMENT_ID: &str = "REQ-DEMO-0001";
const DEMO_TRANSFER_ID: &str = "REQ-DEMO-0002";

const DEMO_ASSETS: &[(&str, &str, &str)] = &[
    ("AST-DEMO-0001", "Infusion Pump", "dept-icu"),
    ("AST-DEMO-0002", "Patient Monitor", "dept-icu"),
    ("AST-DEMO-0003", "Ventilator", "dept-er"),
    ("AST-DEMO-0004", "Defibrillator", "dept-er"),
    ("AST-DEMO-0005", "Ultrasound Scanner", "dept-radiology"),
    ("AST-DEMO-0006", "Wheelchair", "dept-radiology"),
];

pub fn run() -> CommandResult {
    let config = match AppConfig::load(LoadOptions::default()) {
        Ok(config) => config,
        Err(error) => {
            return CommandResult::failure(
                "seed",
                "config_validation",
                format!("configuration issue: {error}"),
                2,
            );
        }
    };

    let runtime = match tokio::runtime::Builder::new_current_thread().enable_all().build() {
        Ok(runtime) => runtime,
        Err(error) => {
            return CommandResult::failure(
                "seed",
                "runtime_init",
                format!("failed to initialize async runtime: {error}"),
                3,
            );
        }
    };

    let result = runtime.block_on(async {
        let pool = connect_with_settings(
            &config.database.url,
            config.database.max_connections,
            config.database.timeout_secs,
        )
        .await
        .map_err(|error| ("db_connectivity", error.to_string(), 4u8))?;
        migrations::run_pending(&pool)
            .await
            .map_err(|error| ("migration", error.to_string(), 5u8))?;

        let seeded = seed_dataset(&config, &pool)
            .await
            .map_err(|error| ("seed", error, 6u8))?;

        pool.close().await;
        Ok::<bool, (&'static str, String, u8)>(seeded)
    });

    match result {
        Ok(true) => CommandResult::success(
            "seed",
            format!(
                "seeded {} demo assets and 2 demo requests",
                DEMO_ASSETS.len()
            ),
        ),
        Ok(false) => CommandResult::success("seed", "demo dataset already present"),
        Err((error_class, message, exit_code)) => {
            CommandResult::failure("seed", error_class, message, exit_code)
        }
    }
}

async fn seed_dataset(config: &AppConfig, pool: &wardflow_db::DbPool) -> Result<bool, String> {
    let assets = Arc::new(SqlAssetStore::new(pool.clone()));
    let requests = Arc::new(SqlRequestStore::new(pool.clone()));

    if requests
        .find_by_id(&RequestId(DEMO_PROCUREMENT_ID.to_string()))
        .await
        .map_err(|error| error.to_string())?
        .is_some()
    {
        return Ok(false);
    }

    let now = Utc::now();
    for (id, name, department) in DEMO_ASSETS {
        assets
            .save(Asset {
                id: AssetId(id.to_string()),
                name: name.to_string(),
                current_department_id: DepartmentId(department.to_string()),
                status: AssetStatus::Active,
                lifecycle_status: LifecycleStatus::Active,
                utilization_status: UtilizationStatus::NotInUse,
                reservation: Reservation::free(),
                created_at: now,
                updated_at: now,
            })
            .await
            .map_err(|error| error.to_string())?;
    }

    let chain = config.approval_chain().map_err(|error| error.to_string())?;
    let roles = config.role_map().map_err(|error| error.to_string())?;
    let engine = ApprovalEngine::new(chain, roles);

    let scope = RequestScope {
        level: ScopeLevel::SameHospital,
        department_id: DepartmentId("dept-icu".to_string()),
        hospital_id: HospitalId("hosp-demo".to_string()),
        organization_id: OrganizationId("org-demo".to_string()),
    };

    let procurement = engine
        .new_request(
            RequestSeed {
                id: RequestId(DEMO_PROCUREMENT_ID.to_string()),
                request_type: RequestType::Procurement,
                mode: RequestMode::Count(2),
                scope: scope.clone(),
                justification: "ICU expansion needs two more patient monitors".to_string(),
                priority: Priority::High,
                estimated_cost: None,
                requested_by: "user-demo-requester".to_string(),
                escalation_enabled: true,
                escalate_after_hours: config.escalation.default_escalate_after_hours,
            },
            now,
        )
        .map_err(|error| error.to_string())?;
    requests.insert(procurement).await.map_err(|error| error.to_string())?;

    let transfer_assets =
        vec![AssetId("AST-DEMO-0003".to_string()), AssetId("AST-DEMO-0004".to_string())];
    let transfer = engine
        .new_request(
            RequestSeed {
                id: RequestId(DEMO_TRANSFER_ID.to_string()),
                request_type: RequestType::AssetTransfer,
                mode: RequestMode::Assets(transfer_assets.clone()),
                scope: scope.clone(),
                justification: "Move resuscitation equipment to the ICU".to_string(),
                priority: Priority::Urgent,
                estimated_cost: None,
                requested_by: "user-demo-requester".to_string(),
                escalation_enabled: true,
                escalate_after_hours: config.escalation.default_escalate_after_hours,
            },
            now,
        )
        .map_err(|error| error.to_string())?;

    // Transfer requests hold their named assets from the moment they exist.
    for asset_id in &transfer_assets {
        let claimed = assets
            .update_if_reservable(
                asset_id,
                Reservation::held_by(transfer.id.clone(), scope.department_id.clone(), now),
                now,
            )
            .await
            .map_err(|error| error.to_string())?;
        if !claimed {
            return Err(format!("demo asset `{}` was not reservable", asset_id.0));
        }
    }
    requests.insert(transfer).await.map_err(|error| error.to_string())?;

    Ok(true)
}
