use std::collections::BTreeMap;

use chrono::{DateTime, Utc};
use rust_decimal::Decimal;
use serde::{Deserialize, Serialize};

use crate::chain::Stage;
use crate::domain::asset::AssetId;
use crate::domain::{DepartmentId, HospitalId, OrganizationId};
use crate::errors::DomainError;

#[derive(Clone, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct RequestId(pub String);

#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RequestType {
    AssetTransfer,
    Procurement,
    Scrap,
    ScrapReversal,
}

impl RequestType {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::AssetTransfer => "asset_transfer",
            Self::Procurement => "procurement",
            Self::Scrap => "scrap",
            Self::ScrapReversal => "scrap_reversal",
        }
    }

    pub fn parse(value: &str) -> Option<Self> {
        match value.trim().to_ascii_lowercase().as_str() {
            "asset_transfer" => Some(Self::AssetTransfer),
            "procurement" => Some(Self::Procurement),
            "scrap" => Some(Self::Scrap),
            "scrap_reversal" => Some(Self::ScrapReversal),
            _ => None,
        }
    }
}

#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Priority {
    Low,
    Medium,
    High,
    Urgent,
}

impl Priority {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Low => "low",
            Self::Medium => "medium",
            Self::High => "high",
            Self::Urgent => "urgent",
        }
    }

    pub fn parse(value: &str) -> Option<Self> {
        match value.trim().to_ascii_lowercase().as_str() {
            "low" => Some(Self::Low),
            "medium" => Some(Self::Medium),
            "high" => Some(Self::High),
            "urgent" => Some(Self::Urgent),
            _ => None,
        }
    }
}

#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ScopeLevel {
    SameHospital,
    CrossHospital,
}

impl ScopeLevel {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::SameHospital => "same_hospital",
            Self::CrossHospital => "cross_hospital",
        }
    }

    pub fn parse(value: &str) -> Option<Self> {
        match value.trim().to_ascii_lowercase().as_str() {
            "same_hospital" => Some(Self::SameHospital),
            "cross_hospital" => Some(Self::CrossHospital),
            _ => None,
        }
    }
}

/// Organizational boundary a request and its approvers are confined to.
/// Immutable after creation.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct RequestScope {
    pub level: ScopeLevel,
    pub department_id: DepartmentId,
    pub hospital_id: HospitalId,
    pub organization_id: OrganizationId,
}

#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum StepStatus {
    Pending,
    Approved,
    Rejected,
    Skipped,
}

impl StepStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Pending => "pending",
            Self::Approved => "approved",
            Self::Rejected => "rejected",
            Self::Skipped => "skipped",
        }
    }

    pub fn parse(value: &str) -> Option<Self> {
        match value.trim().to_ascii_lowercase().as_str() {
            "pending" => Some(Self::Pending),
            "approved" => Some(Self::Approved),
            "rejected" => Some(Self::Rejected),
            "skipped" => Some(Self::Skipped),
            _ => None,
        }
    }
}

#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct ApprovalStep {
    pub status: StepStatus,
    pub decided_by: Option<String>,
    pub decided_at: Option<DateTime<Utc>>,
    pub remarks: Option<String>,
}

impl ApprovalStep {
    pub fn pending() -> Self {
        Self { status: StepStatus::Pending, decided_by: None, decided_at: None, remarks: None }
    }

    pub fn decided(
        status: StepStatus,
        decided_by: impl Into<String>,
        decided_at: DateTime<Utc>,
        remarks: Option<String>,
    ) -> Self {
        Self {
            status,
            decided_by: Some(decided_by.into()),
            decided_at: Some(decided_at),
            remarks,
        }
    }
}

#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct FulfilledAsset {
    pub asset_id: AssetId,
    pub from_department_id: DepartmentId,
    pub fulfilled_by: String,
    pub fulfilled_at: DateTime<Utc>,
}

#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct RejectedAsset {
    pub asset_id: AssetId,
    pub from_department_id: DepartmentId,
    pub rejected_by: String,
    pub rejected_at: DateTime<Utc>,
    pub remarks: Option<String>,
}

/// Count-mode fulfillment progress. `fulfilled_count` only ever grows.
#[derive(Clone, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct Fulfillment {
    pub requested_count: u32,
    pub fulfilled_count: u32,
    pub fulfilled_assets: Vec<FulfilledAsset>,
}

/// Position of a request in its approval chain, including the two terminal
/// markers. No transition is legal once terminal.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RequestLevel {
    Stage(Stage),
    Completed,
    Rejected,
}

impl RequestLevel {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Stage(stage) => stage.as_str(),
            Self::Completed => "completed",
            Self::Rejected => "rejected",
        }
    }

    pub fn parse(value: &str) -> Option<Self> {
        match value.trim().to_ascii_lowercase().as_str() {
            "completed" => Some(Self::Completed),
            "rejected" => Some(Self::Rejected),
            other => Stage::parse(other).map(Self::Stage),
        }
    }

    pub fn is_terminal(&self) -> bool {
        matches!(self, Self::Completed | Self::Rejected)
    }

    pub fn stage(&self) -> Option<Stage> {
        match self {
            Self::Stage(stage) => Some(*stage),
            _ => None,
        }
    }
}

#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum FinalStatus {
    Pending,
    Approved,
    Rejected,
}

impl FinalStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Pending => "pending",
            Self::Approved => "approved",
            Self::Rejected => "rejected",
        }
    }

    pub fn parse(value: &str) -> Option<Self> {
        match value.trim().to_ascii_lowercase().as_str() {
            "pending" => Some(Self::Pending),
            "approved" => Some(Self::Approved),
            "rejected" => Some(Self::Rejected),
            _ => None,
        }
    }
}

/// SLA window driving automatic escalation. `last_action_at` moves on every
/// state-changing action.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct EscalationPolicy {
    pub enabled: bool,
    pub escalate_after_hours: i64,
    pub last_action_at: DateTime<Utc>,
}

/// Fulfillment mode chosen at creation: specific assets, or a bare count to
/// be satisfied later. Exactly one of the two, enforced by `AssetRequest::
/// create`.
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum RequestMode {
    Assets(Vec<AssetId>),
    Count(u32),
}

/// Caller-supplied fields for a new request.
#[derive(Clone, Debug)]
pub struct RequestSeed {
    pub id: RequestId,
    pub request_type: RequestType,
    pub mode: RequestMode,
    pub scope: RequestScope,
    pub justification: String,
    pub priority: Priority,
    pub estimated_cost: Option<Decimal>,
    pub requested_by: String,
    pub escalation_enabled: bool,
    pub escalate_after_hours: i64,
}

#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct AssetRequest {
    pub id: RequestId,
    pub request_type: RequestType,
    pub requested_assets: Vec<AssetId>,
    pub fulfillment: Fulfillment,
    pub rejected_assets: Vec<RejectedAsset>,
    pub approval_flow: BTreeMap<Stage, ApprovalStep>,
    pub current_level: RequestLevel,
    pub final_status: FinalStatus,
    pub scope: RequestScope,
    pub escalation: EscalationPolicy,
    pub justification: String,
    pub priority: Priority,
    pub estimated_cost: Option<Decimal>,
    pub requested_by: String,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

impl AssetRequest {
    /// Validates the seed and builds a pending request positioned at
    /// `entry_stage`, with one pending approval step per stage it will
    /// traverse. The caller (the approval engine) supplies the chain suffix.
    pub fn create(
        seed: RequestSeed,
        entry_stage: Stage,
        flow_stages: &[Stage],
        now: DateTime<Utc>,
    ) -> Result<Self, DomainError> {
        let (requested_assets, requested_count) = match seed.mode {
            RequestMode::Assets(asset_ids) => {
                if asset_ids.is_empty() {
                    return Err(DomainError::Validation(
                        "asset-mode requests must name at least one asset".to_string(),
                    ));
                }
                for (index, asset_id) in asset_ids.iter().enumerate() {
                    if asset_ids[..index].contains(asset_id) {
                        return Err(DomainError::Validation(format!(
                            "asset `{}` is listed more than once",
                            asset_id.0
                        )));
                    }
                }
                (asset_ids, 0)
            }
            RequestMode::Count(count) => {
                if count == 0 {
                    return Err(DomainError::Validation(
                        "count-mode requests must ask for at least one asset".to_string(),
                    ));
                }
                (Vec::new(), count)
            }
        };

        validate_scope(&seed.scope)?;
        if seed.escalate_after_hours <= 0 {
            return Err(DomainError::Validation(
                "escalate_after_hours must be positive".to_string(),
            ));
        }

        let approval_flow = flow_stages
            .iter()
            .map(|stage| (*stage, ApprovalStep::pending()))
            .collect();

        Ok(Self {
            id: seed.id,
            request_type: seed.request_type,
            requested_assets,
            fulfillment: Fulfillment {
                requested_count,
                fulfilled_count: 0,
                fulfilled_assets: Vec::new(),
            },
            rejected_assets: Vec::new(),
            approval_flow,
            current_level: RequestLevel::Stage(entry_stage),
            final_status: FinalStatus::Pending,
            scope: seed.scope,
            escalation: EscalationPolicy {
                enabled: seed.escalation_enabled,
                escalate_after_hours: seed.escalate_after_hours,
                last_action_at: now,
            },
            justification: seed.justification,
            priority: seed.priority,
            estimated_cost: seed.estimated_cost,
            requested_by: seed.requested_by,
            created_at: now,
            updated_at: now,
        })
    }

    pub fn is_count_mode(&self) -> bool {
        self.requested_assets.is_empty()
    }

    /// Total assets needed to satisfy the request, regardless of mode.
    pub fn total_requested(&self) -> u32 {
        if self.is_count_mode() {
            self.fulfillment.requested_count
        } else {
            self.requested_assets.len() as u32
        }
    }

    pub fn is_terminal(&self) -> bool {
        self.current_level.is_terminal()
    }

    pub fn current_stage(&self) -> Option<Stage> {
        self.current_level.stage()
    }

    /// `final_status` is a summary flag and must always agree with
    /// `current_level`. Exercised by tests after every transition.
    pub fn status_is_consistent(&self) -> bool {
        match self.current_level {
            RequestLevel::Completed => self.final_status == FinalStatus::Approved,
            RequestLevel::Rejected => self.final_status == FinalStatus::Rejected,
            RequestLevel::Stage(_) => self.final_status == FinalStatus::Pending,
        }
    }
}

fn validate_scope(scope: &RequestScope) -> Result<(), DomainError> {
    let fields = [
        ("department_id", scope.department_id.0.as_str()),
        ("hospital_id", scope.hospital_id.0.as_str()),
        ("organization_id", scope.organization_id.0.as_str()),
    ];
    for (name, value) in fields {
        if value.trim().is_empty() {
            return Err(DomainError::Validation(format!("scope.{name} must not be blank")));
        }
    }
    Ok(())
}
