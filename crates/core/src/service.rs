use std::sync::Arc;

use chrono::Utc;
use rust_decimal::Decimal;
use uuid::Uuid;

use crate::audit::{AuditCategory, AuditEvent, AuditOutcome, AuditSink};
use crate::domain::asset::AssetId;
use crate::domain::request::{
    AssetRequest, FinalStatus, Priority, RequestId, RequestLevel, RequestMode, RequestScope,
    RequestSeed, RequestType,
};
use crate::errors::{ApplicationError, DomainError};
use crate::notify::{NotificationSink, StageChangeNotice};
use crate::reservation::ReservationCoordinator;
use crate::store::{AssetStore, RequestStore};
use crate::workflow::{Actor, ApprovalEngine};

/// Bounded optimistic-concurrency retry. Each attempt re-runs the whole
/// precondition check against a fresh read; exhausting the budget surfaces
/// as a persistence failure the caller may retry.
const MAX_CAS_ATTEMPTS: u32 = 5;

#[derive(Clone, Copy, Debug)]
pub struct ServiceDefaults {
    pub escalation_enabled: bool,
    pub escalate_after_hours: i64,
}

impl Default for ServiceDefaults {
    fn default() -> Self {
        Self { escalation_enabled: true, escalate_after_hours: 24 }
    }
}

/// Caller-facing creation payload. Exactly one of the two fulfillment
/// modes; escalation knobs fall back to the service defaults.
#[derive(Clone, Debug)]
pub struct NewRequestInput {
    pub request_type: RequestType,
    pub scope: RequestScope,
    pub mode: RequestMode,
    pub justification: String,
    pub priority: Priority,
    pub estimated_cost: Option<Decimal>,
    pub escalation_enabled: Option<bool>,
    pub escalate_after_hours: Option<i64>,
}

/// Inbound operations of the approval & reservation engine. Invoked by
/// request handlers after authentication has resolved the acting identity.
pub struct RequestService<A, R, S, N> {
    assets: Arc<A>,
    requests: Arc<R>,
    engine: ApprovalEngine,
    coordinator: ReservationCoordinator<A>,
    audit: Arc<S>,
    notifications: Arc<N>,
    defaults: ServiceDefaults,
}

impl<A, R, S, N> RequestService<A, R, S, N>
where
    A: AssetStore,
    R: RequestStore,
    S: AuditSink,
    N: NotificationSink,
{
    pub fn new(
        assets: Arc<A>,
        requests: Arc<R>,
        engine: ApprovalEngine,
        audit: Arc<S>,
        notifications: Arc<N>,
    ) -> Self {
        let coordinator = ReservationCoordinator::new(assets.clone());
        Self {
            assets,
            requests,
            engine,
            coordinator,
            audit,
            notifications,
            defaults: ServiceDefaults::default(),
        }
    }

    pub fn with_defaults(mut self, defaults: ServiceDefaults) -> Self {
        self.defaults = defaults;
        self
    }

    pub fn engine(&self) -> &ApprovalEngine {
        &self.engine
    }

    /// Creates a request. Asset-mode requests claim their named assets
    /// before anything is persisted; if the claim fails, nothing exists
    /// afterwards.
    pub async fn create_request(
        &self,
        input: NewRequestInput,
        actor: &Actor,
    ) -> Result<AssetRequest, ApplicationError> {
        let now = Utc::now();
        let correlation_id = Uuid::new_v4().to_string();
        let is_asset_mode = matches!(input.mode, RequestMode::Assets(_));

        let seed = RequestSeed {
            id: RequestId(Uuid::new_v4().to_string()),
            request_type: input.request_type,
            mode: input.mode,
            scope: input.scope,
            justification: input.justification,
            priority: input.priority,
            estimated_cost: input.estimated_cost,
            requested_by: actor.actor_id.clone(),
            escalation_enabled: input
                .escalation_enabled
                .unwrap_or(self.defaults.escalation_enabled),
            escalate_after_hours: input
                .escalate_after_hours
                .unwrap_or(self.defaults.escalate_after_hours),
        };
        let request = self.engine.new_request(seed, now)?;

        if is_asset_mode {
            self.coordinator
                .reserve(&request, &request.scope.department_id, &request.requested_assets, now)
                .await?;
        }

        if let Err(error) = self.requests.insert(request.clone()).await {
            if is_asset_mode {
                // Undo the claims; the request never existed.
                self.coordinator.release(&request.id, now).await?;
            }
            return Err(error.into());
        }

        self.audit.emit(
            AuditEvent::new(
                Some(request.id.clone()),
                correlation_id,
                "request.created",
                AuditCategory::Request,
                &actor.actor_id,
                AuditOutcome::Success,
            )
            .with_metadata("request_type", request.request_type.as_str())
            .with_metadata("entry_level", request.current_level.as_str())
            .with_metadata("total_requested", request.total_requested().to_string()),
        );

        Ok(request)
    }

    /// Records the actor's approval at the request's current stage.
    pub async fn approve_request(
        &self,
        request_id: &RequestId,
        actor: &Actor,
        remarks: Option<String>,
    ) -> Result<AssetRequest, ApplicationError> {
        let correlation_id = Uuid::new_v4().to_string();

        for _ in 0..MAX_CAS_ATTEMPTS {
            let mut request = self.load(request_id).await?;
            let expected = request.current_level;
            let now = Utc::now();

            let outcome = match self.engine.approve(&mut request, actor, remarks.clone(), now) {
                Ok(outcome) => outcome,
                Err(error) => {
                    self.emit_denied(request_id, &correlation_id, actor, &error);
                    return Err(error.into());
                }
            };

            if self.requests.update_if_level(&expected, request.clone()).await? {
                self.audit.emit(
                    AuditEvent::new(
                        Some(request.id.clone()),
                        correlation_id,
                        "approval.stage_approved",
                        AuditCategory::Approval,
                        &actor.actor_id,
                        AuditOutcome::Success,
                    )
                    .with_metadata("from", outcome.from.as_str())
                    .with_metadata("to", outcome.to.as_str()),
                );
                if outcome.from != outcome.to {
                    self.notifications.notify(StageChangeNotice {
                        request_id: request.id.clone(),
                        from: outcome.from,
                        to: outcome.to,
                        actor: actor.actor_id.clone(),
                        occurred_at: now,
                    });
                }
                return Ok(request);
            }
        }

        Err(contention(request_id))
    }

    /// Rejects the request at its current stage and releases every asset
    /// it holds.
    pub async fn reject_request(
        &self,
        request_id: &RequestId,
        actor: &Actor,
        remarks: Option<String>,
    ) -> Result<AssetRequest, ApplicationError> {
        let correlation_id = Uuid::new_v4().to_string();

        for _ in 0..MAX_CAS_ATTEMPTS {
            let mut request = self.load(request_id).await?;
            let expected = request.current_level;
            let now = Utc::now();

            let outcome = match self.engine.reject(&mut request, actor, remarks.clone(), now) {
                Ok(outcome) => outcome,
                Err(error) => {
                    self.emit_denied(request_id, &correlation_id, actor, &error);
                    return Err(error.into());
                }
            };

            if !self.requests.update_if_level(&expected, request.clone()).await? {
                continue;
            }

            let released = self.coordinator.release(request_id, now).await?;

            self.audit.emit(
                AuditEvent::new(
                    Some(request.id.clone()),
                    correlation_id,
                    "approval.rejected",
                    AuditCategory::Approval,
                    &actor.actor_id,
                    AuditOutcome::Rejected,
                )
                .with_metadata("from", outcome.from.as_str())
                .with_metadata("released_assets", released.to_string()),
            );
            self.notifications.notify(StageChangeNotice {
                request_id: request.id.clone(),
                from: outcome.from,
                to: outcome.to,
                actor: actor.actor_id.clone(),
                occurred_at: now,
            });
            return Ok(request);
        }

        Err(contention(request_id))
    }

    /// Offers specific assets into a pending request's reservation pool.
    /// The claim is all-or-nothing across the listed assets.
    pub async fn reserve_specific_assets(
        &self,
        request_id: &RequestId,
        actor: &Actor,
        asset_ids: &[AssetId],
    ) -> Result<AssetRequest, ApplicationError> {
        let now = Utc::now();
        let request = self.load(request_id).await?;
        ensure_same_hospital(actor, &request)?;
        if request.final_status != FinalStatus::Pending {
            return Err(DomainError::AlreadyClosed {
                id: request.id.0.clone(),
                final_status: request.final_status,
            }
            .into());
        }

        let reserved = self
            .coordinator
            .reserve(&request, &actor.department_id, asset_ids, now)
            .await?;

        self.audit.emit(
            AuditEvent::new(
                Some(request.id.clone()),
                Uuid::new_v4().to_string(),
                "reservation.reserved",
                AuditCategory::Reservation,
                &actor.actor_id,
                AuditOutcome::Success,
            )
            .with_metadata("reserved_assets", reserved.to_string())
            .with_metadata("offering_department", actor.department_id.0.clone()),
        );

        Ok(request)
    }

    /// Binds reserved assets to the request, auto-completing it when the
    /// requested total is covered.
    pub async fn fulfill_request(
        &self,
        request_id: &RequestId,
        actor: &Actor,
        asset_ids: &[AssetId],
    ) -> Result<AssetRequest, ApplicationError> {
        let correlation_id = Uuid::new_v4().to_string();

        for _ in 0..MAX_CAS_ATTEMPTS {
            let mut request = self.load(request_id).await?;
            ensure_same_hospital(actor, &request)?;
            if request.final_status != FinalStatus::Pending {
                return Err(DomainError::AlreadyClosed {
                    id: request.id.0.clone(),
                    final_status: request.final_status,
                }
                .into());
            }
            let expected = request.current_level;
            let now = Utc::now();

            let outcome = self
                .coordinator
                .fulfill(&mut request, asset_ids, &actor.actor_id, now)
                .await?;

            if self.requests.update_if_level(&expected, request.clone()).await? {
                self.audit.emit(
                    AuditEvent::new(
                        Some(request.id.clone()),
                        correlation_id,
                        "fulfillment.applied",
                        AuditCategory::Fulfillment,
                        &actor.actor_id,
                        AuditOutcome::Success,
                    )
                    .with_metadata("fulfilled_assets", outcome.fulfilled.to_string())
                    .with_metadata("fulfilled_count", request.fulfillment.fulfilled_count.to_string())
                    .with_metadata("completed", outcome.completed.to_string()),
                );
                if outcome.completed {
                    self.notifications.notify(StageChangeNotice {
                        request_id: request.id.clone(),
                        from: expected,
                        to: RequestLevel::Completed,
                        actor: actor.actor_id.clone(),
                        occurred_at: now,
                    });
                }
                return Ok(request);
            }

            // A concurrent writer changed the request; put the assets back
            // the way we found them and re-run from the precondition check.
            self.coordinator.restore(&outcome.prior_snapshots, now).await?;
        }

        Err(contention(request_id))
    }

    /// Rejects offered assets out of a count-mode request's pool.
    pub async fn reject_request_assets(
        &self,
        request_id: &RequestId,
        actor: &Actor,
        asset_ids: &[AssetId],
        remarks: Option<String>,
    ) -> Result<AssetRequest, ApplicationError> {
        let correlation_id = Uuid::new_v4().to_string();

        for _ in 0..MAX_CAS_ATTEMPTS {
            let mut request = self.load(request_id).await?;
            ensure_same_hospital(actor, &request)?;
            let expected = request.current_level;
            let now = Utc::now();

            let outcome = self
                .coordinator
                .reject_assets(&mut request, asset_ids, remarks.clone(), &actor.actor_id, now)
                .await?;

            if self.requests.update_if_level(&expected, request.clone()).await? {
                self.audit.emit(
                    AuditEvent::new(
                        Some(request.id.clone()),
                        correlation_id,
                        "fulfillment.assets_rejected",
                        AuditCategory::Fulfillment,
                        &actor.actor_id,
                        AuditOutcome::Success,
                    )
                    .with_metadata("released_assets", outcome.released.to_string())
                    .with_metadata("completed", outcome.completed.to_string()),
                );
                return Ok(request);
            }

            self.coordinator.restore(&outcome.prior_snapshots, now).await?;
        }

        Err(contention(request_id))
    }

    /// Work queue for an approver: pending requests sitting at the stage
    /// the actor's role resolves to, within the actor's organization.
    pub async fn list_pending_for_actor(
        &self,
        actor: &Actor,
    ) -> Result<Vec<AssetRequest>, ApplicationError> {
        let stage = self.engine.resolve_stage(&actor.role)?;
        Ok(self
            .requests
            .list_pending_for_stage(stage, &actor.organization_id)
            .await?)
    }

    async fn load(&self, request_id: &RequestId) -> Result<AssetRequest, ApplicationError> {
        self.requests
            .find_by_id(request_id)
            .await?
            .ok_or_else(|| {
                DomainError::NotFound { kind: "request", id: request_id.0.clone() }.into()
            })
    }

    fn emit_denied(
        &self,
        request_id: &RequestId,
        correlation_id: &str,
        actor: &Actor,
        error: &DomainError,
    ) {
        self.audit.emit(
            AuditEvent::new(
                Some(request_id.clone()),
                correlation_id,
                "approval.denied",
                AuditCategory::Approval,
                &actor.actor_id,
                AuditOutcome::Rejected,
            )
            .with_metadata("error", error.to_string()),
        );
    }
}

fn ensure_same_hospital(actor: &Actor, request: &AssetRequest) -> Result<(), DomainError> {
    if actor.hospital_id != request.scope.hospital_id {
        return Err(DomainError::CrossHospitalDenied {
            request_hospital: request.scope.hospital_id.0.clone(),
            actor_hospital: actor.hospital_id.0.clone(),
        });
    }
    Ok(())
}

fn contention(request_id: &RequestId) -> ApplicationError {
    ApplicationError::Persistence(format!(
        "request `{}` kept changing under concurrent writers; giving up after {MAX_CAS_ATTEMPTS} attempts",
        request_id.0
    ))
}
