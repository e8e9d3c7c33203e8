use chrono::{DateTime, Utc};

use crate::chain::{ApprovalChain, ChainError, RoleMap, Stage};
use crate::domain::request::{
    ApprovalStep, AssetRequest, FinalStatus, RequestLevel, RequestSeed, RequestType, StepStatus,
};
use crate::domain::{DepartmentId, HospitalId, OrganizationId};
use crate::errors::DomainError;

/// Resolved caller identity. Produced by the (external) transport layer
/// after authentication; the engine only checks it against request scope.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct Actor {
    pub actor_id: String,
    pub role: String,
    pub organization_id: OrganizationId,
    pub hospital_id: HospitalId,
    pub department_id: DepartmentId,
}

#[derive(Clone, Debug, PartialEq, Eq)]
pub struct ApprovalOutcome {
    pub from: RequestLevel,
    pub to: RequestLevel,
}

#[derive(Clone, Debug, PartialEq, Eq)]
pub enum EscalationOutcome {
    Escalated { from: Stage, to: Stage },
    /// The final chain stage is never skipped; a human owns that decision.
    NotEscalatable { stage: Stage },
    AlreadyTerminal,
}

/// The approval state machine. Owns the configured chain and role mapping;
/// transition methods mutate the aggregate in memory and leave persistence
/// (the conditional update) to the caller.
#[derive(Clone, Debug)]
pub struct ApprovalEngine {
    chain: ApprovalChain,
    roles: RoleMap,
}

impl ApprovalEngine {
    pub fn new(chain: ApprovalChain, roles: RoleMap) -> Self {
        Self { chain, roles }
    }

    pub fn canonical() -> Self {
        Self::new(ApprovalChain::canonical(), RoleMap::canonical())
    }

    pub fn chain(&self) -> &ApprovalChain {
        &self.chain
    }

    pub fn resolve_stage(&self, role: &str) -> Result<Stage, DomainError> {
        self.roles
            .resolve(role)
            .ok_or_else(|| DomainError::UnknownRole { role: role.to_string() })
    }

    /// Builds a new pending request positioned at the chain's entry stage
    /// for the request's scope level.
    pub fn new_request(
        &self,
        seed: RequestSeed,
        now: DateTime<Utc>,
    ) -> Result<AssetRequest, DomainError> {
        let entry = self.chain.entry_stage(seed.scope.level);
        let flow = self.chain.stages_from(entry);
        AssetRequest::create(seed, entry, &flow, now)
    }

    /// Records the actor's approval at the current stage. Asset transfers
    /// use a single-stage gate and do not advance; every other type moves
    /// to the successor stage, completing the request when the chain ends.
    pub fn approve(
        &self,
        request: &mut AssetRequest,
        actor: &Actor,
        remarks: Option<String>,
        now: DateTime<Utc>,
    ) -> Result<ApprovalOutcome, DomainError> {
        let stage = self.authorized_stage(request, actor)?;
        let from = request.current_level;

        request.approval_flow.insert(
            stage,
            ApprovalStep::decided(StepStatus::Approved, actor.actor_id.clone(), now, remarks),
        );

        if request.request_type != RequestType::AssetTransfer {
            match self.chain.successor(stage) {
                Some(next) => request.current_level = RequestLevel::Stage(next),
                None => {
                    request.current_level = RequestLevel::Completed;
                    request.final_status = FinalStatus::Approved;
                }
            }
        }

        request.escalation.last_action_at = now;
        request.updated_at = now;

        Ok(ApprovalOutcome { from, to: request.current_level })
    }

    /// Rejects the request at the current stage. Terminal; the caller must
    /// release every reservation the request holds.
    pub fn reject(
        &self,
        request: &mut AssetRequest,
        actor: &Actor,
        remarks: Option<String>,
        now: DateTime<Utc>,
    ) -> Result<ApprovalOutcome, DomainError> {
        if request.final_status != FinalStatus::Pending {
            return Err(DomainError::AlreadyClosed {
                id: request.id.0.clone(),
                final_status: request.final_status,
            });
        }

        let stage = self.authorized_stage(request, actor)?;
        let from = request.current_level;

        request.approval_flow.insert(
            stage,
            ApprovalStep::decided(StepStatus::Rejected, actor.actor_id.clone(), now, remarks),
        );
        request.current_level = RequestLevel::Rejected;
        request.final_status = FinalStatus::Rejected;
        request.escalation.last_action_at = now;
        request.updated_at = now;

        Ok(ApprovalOutcome { from, to: RequestLevel::Rejected })
    }

    /// Force-advances a stalled request past its current stage, recording a
    /// skipped step. Invoked only by the escalation sweep; never touches
    /// `final_status`.
    pub fn escalate(
        &self,
        request: &mut AssetRequest,
        now: DateTime<Utc>,
    ) -> Result<EscalationOutcome, DomainError> {
        let Some(stage) = request.current_stage() else {
            return Ok(EscalationOutcome::AlreadyTerminal);
        };
        if !self.chain.contains(stage) {
            return Err(ChainError::StageNotInChain(stage).into());
        }

        let Some(next) = self.chain.successor(stage) else {
            return Ok(EscalationOutcome::NotEscalatable { stage });
        };

        request.approval_flow.insert(
            stage,
            ApprovalStep {
                status: StepStatus::Skipped,
                decided_by: None,
                decided_at: Some(now),
                remarks: Some("auto-escalated after SLA window".to_string()),
            },
        );
        request.current_level = RequestLevel::Stage(next);
        request.escalation.last_action_at = now;
        request.updated_at = now;

        Ok(EscalationOutcome::Escalated { from: stage, to: next })
    }

    /// Stage/scope gate shared by approve and reject.
    fn authorized_stage(
        &self,
        request: &AssetRequest,
        actor: &Actor,
    ) -> Result<Stage, DomainError> {
        let stage = self.resolve_stage(&actor.role)?;
        if request.current_level != RequestLevel::Stage(stage) {
            return Err(DomainError::StageMismatch {
                actor_stage: stage,
                current: request.current_level,
            });
        }
        if request.scope.organization_id != actor.organization_id {
            return Err(DomainError::OutOfScope {
                request_organization: request.scope.organization_id.0.clone(),
                actor_organization: actor.organization_id.0.clone(),
            });
        }
        if !self.chain.contains(stage) {
            return Err(ChainError::StageNotInChain(stage).into());
        }
        Ok(stage)
    }
}

#[cfg(test)]
mod tests {
    use chrono::Utc;

    use crate::chain::{ApprovalChain, RoleMap, Stage};
    use crate::domain::request::{
        AssetRequest, FinalStatus, Priority, RequestId, RequestLevel, RequestMode, RequestScope,
        RequestSeed, RequestType, ScopeLevel, StepStatus,
    };
    use crate::domain::{DepartmentId, HospitalId, OrganizationId};
    use crate::errors::DomainError;

    use super::{Actor, ApprovalEngine, EscalationOutcome};

    fn engine() -> ApprovalEngine {
        ApprovalEngine::canonical()
    }

    fn actor(role: &str) -> Actor {
        Actor {
            actor_id: format!("user-{role}"),
            role: role.to_string(),
            organization_id: OrganizationId("org-1".to_string()),
            hospital_id: HospitalId("hosp-1".to_string()),
            department_id: DepartmentId("dept-icu".to_string()),
        }
    }

    fn seed(request_type: RequestType, mode: RequestMode) -> RequestSeed {
        RequestSeed {
            id: RequestId("REQ-1".to_string()),
            request_type,
            mode,
            scope: RequestScope {
                level: ScopeLevel::SameHospital,
                department_id: DepartmentId("dept-icu".to_string()),
                hospital_id: HospitalId("hosp-1".to_string()),
                organization_id: OrganizationId("org-1".to_string()),
            },
            justification: "two replacement monitors".to_string(),
            priority: Priority::Medium,
            estimated_cost: None,
            requested_by: "user-req".to_string(),
            escalation_enabled: true,
            escalate_after_hours: 24,
        }
    }

    fn procurement() -> AssetRequest {
        engine()
            .new_request(seed(RequestType::Procurement, RequestMode::Count(2)), Utc::now())
            .expect("valid request")
    }

    #[test]
    fn procurement_walks_all_three_stages_to_completion() {
        let engine = engine();
        let mut request = procurement();

        let first = engine
            .approve(&mut request, &actor("supervisor"), None, Utc::now())
            .expect("level1 approval");
        assert_eq!(first.to, RequestLevel::Stage(Stage::Hod));
        assert!(request.status_is_consistent());

        engine
            .approve(&mut request, &actor("hod"), None, Utc::now())
            .expect("hod approval");
        assert_eq!(request.current_level, RequestLevel::Stage(Stage::Cfo));

        let last = engine
            .approve(&mut request, &actor("cfo"), Some("budget cleared".to_string()), Utc::now())
            .expect("cfo approval");
        assert_eq!(last.to, RequestLevel::Completed);
        assert_eq!(request.final_status, FinalStatus::Approved);
        assert!(request.status_is_consistent());
        assert!(request
            .approval_flow
            .values()
            .all(|step| step.status == StepStatus::Approved));
    }

    #[test]
    fn asset_transfer_approval_records_but_does_not_advance() {
        let engine = engine();
        let mut request = engine
            .new_request(
                seed(
                    RequestType::AssetTransfer,
                    RequestMode::Assets(vec![crate::domain::asset::AssetId(
                        "AST-1".to_string(),
                    )]),
                ),
                Utc::now(),
            )
            .expect("valid request");

        let outcome = engine
            .approve(&mut request, &actor("supervisor"), None, Utc::now())
            .expect("transfer approval");

        assert_eq!(outcome.from, outcome.to);
        assert_eq!(request.current_level, RequestLevel::Stage(Stage::Level1));
        assert_eq!(
            request.approval_flow.get(&Stage::Level1).map(|step| step.status),
            Some(StepStatus::Approved)
        );
        assert_eq!(request.final_status, FinalStatus::Pending);
    }

    #[test]
    fn approving_at_the_wrong_stage_is_a_stage_mismatch() {
        let engine = engine();
        let mut request = procurement();

        let error = engine
            .approve(&mut request, &actor("cfo"), None, Utc::now())
            .expect_err("cfo cannot act at level1");
        assert!(matches!(error, DomainError::StageMismatch { .. }));
        assert_eq!(request.current_level, RequestLevel::Stage(Stage::Level1));
    }

    #[test]
    fn unknown_role_is_rejected_before_any_mutation() {
        let engine = engine();
        let mut request = procurement();

        let error = engine
            .approve(&mut request, &actor("janitor"), None, Utc::now())
            .expect_err("unmapped role");
        assert!(matches!(error, DomainError::UnknownRole { .. }));
    }

    #[test]
    fn foreign_organization_is_out_of_scope() {
        let engine = engine();
        let mut request = procurement();
        let mut foreign = actor("supervisor");
        foreign.organization_id = OrganizationId("org-2".to_string());

        let error = engine
            .approve(&mut request, &foreign, None, Utc::now())
            .expect_err("foreign organization");
        assert!(matches!(error, DomainError::OutOfScope { .. }));
    }

    #[test]
    fn reject_is_terminal_and_cannot_be_repeated() {
        let engine = engine();
        let mut request = procurement();

        let outcome = engine
            .reject(&mut request, &actor("supervisor"), Some("no budget".to_string()), Utc::now())
            .expect("rejection");
        assert_eq!(outcome.to, RequestLevel::Rejected);
        assert_eq!(request.final_status, FinalStatus::Rejected);
        assert!(request.status_is_consistent());

        let error = engine
            .reject(&mut request, &actor("supervisor"), None, Utc::now())
            .expect_err("already closed");
        assert!(matches!(error, DomainError::AlreadyClosed { .. }));
    }

    #[test]
    fn no_transition_is_legal_once_terminal() {
        let engine = engine();
        let mut request = procurement();
        engine
            .reject(&mut request, &actor("supervisor"), None, Utc::now())
            .expect("rejection");

        let error = engine
            .approve(&mut request, &actor("supervisor"), None, Utc::now())
            .expect_err("terminal request");
        assert!(matches!(error, DomainError::StageMismatch { .. }));
        assert_eq!(
            engine.escalate(&mut request, Utc::now()).expect("no-op"),
            EscalationOutcome::AlreadyTerminal
        );
    }

    #[test]
    fn escalation_skips_the_stage_and_advances() {
        let engine = engine();
        let mut request = procurement();

        let outcome = engine.escalate(&mut request, Utc::now()).expect("escalation");
        assert_eq!(
            outcome,
            EscalationOutcome::Escalated { from: Stage::Level1, to: Stage::Hod }
        );
        assert_eq!(request.current_level, RequestLevel::Stage(Stage::Hod));
        assert_eq!(request.final_status, FinalStatus::Pending);
        assert_eq!(
            request.approval_flow.get(&Stage::Level1).map(|step| step.status),
            Some(StepStatus::Skipped)
        );
    }

    #[test]
    fn the_final_stage_is_never_escalated() {
        let engine = engine();
        let mut request = procurement();
        engine.escalate(&mut request, Utc::now()).expect("level1 -> hod");
        engine.escalate(&mut request, Utc::now()).expect("hod -> cfo");

        let outcome = engine.escalate(&mut request, Utc::now()).expect("no-op at cfo");
        assert_eq!(outcome, EscalationOutcome::NotEscalatable { stage: Stage::Cfo });
        assert_eq!(request.current_level, RequestLevel::Stage(Stage::Cfo));
        assert_eq!(request.final_status, FinalStatus::Pending);
    }

    #[test]
    fn current_level_only_ever_moves_forward() {
        let engine = engine();
        let chain = ApprovalChain::canonical();
        let mut request = procurement();
        let mut last_position = chain
            .position(request.current_stage().expect("initial stage"))
            .expect("in chain");

        engine
            .approve(&mut request, &actor("supervisor"), None, Utc::now())
            .expect("approve");
        let position = chain.position(request.current_stage().expect("stage")).expect("in chain");
        assert!(position > last_position);
        last_position = position;

        engine.escalate(&mut request, Utc::now()).expect("escalate");
        let position = chain.position(request.current_stage().expect("stage")).expect("in chain");
        assert!(position > last_position);
    }

    #[test]
    fn cross_hospital_requests_enter_at_the_configured_stage() {
        let chain = ApprovalChain::new(vec![
            Stage::Level1,
            Stage::Level2,
            Stage::Level3,
            Stage::Hod,
            Stage::Cfo,
        ])
        .expect("chain")
        .with_cross_hospital_entry(Stage::Level3)
        .expect("entry");
        let engine = ApprovalEngine::new(chain, RoleMap::canonical());

        let mut cross = seed(RequestType::Procurement, RequestMode::Count(1));
        cross.scope.level = ScopeLevel::CrossHospital;
        let request = engine.new_request(cross, Utc::now()).expect("valid request");

        assert_eq!(request.current_level, RequestLevel::Stage(Stage::Level3));
        assert_eq!(request.approval_flow.len(), 3, "only the remaining stages are seeded");
    }
}
