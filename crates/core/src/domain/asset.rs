use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::domain::request::RequestId;
use crate::domain::DepartmentId;

#[derive(Clone, Debug, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct AssetId(pub String);

#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum AssetStatus {
    Active,
    Maintenance,
    Disposed,
}

impl AssetStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Active => "active",
            Self::Maintenance => "maintenance",
            Self::Disposed => "disposed",
        }
    }

    pub fn parse(value: &str) -> Option<Self> {
        match value.trim().to_ascii_lowercase().as_str() {
            "active" => Some(Self::Active),
            "maintenance" => Some(Self::Maintenance),
            "disposed" => Some(Self::Disposed),
            _ => None,
        }
    }
}

#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum LifecycleStatus {
    Active,
    PendingScrap,
    Scrapped,
}

impl LifecycleStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Active => "active",
            Self::PendingScrap => "pending_scrap",
            Self::Scrapped => "scrapped",
        }
    }

    pub fn parse(value: &str) -> Option<Self> {
        match value.trim().to_ascii_lowercase().as_str() {
            "active" => Some(Self::Active),
            "pending_scrap" => Some(Self::PendingScrap),
            "scrapped" => Some(Self::Scrapped),
            _ => None,
        }
    }
}

#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum UtilizationStatus {
    InUse,
    NotInUse,
    UnderMaintenance,
}

impl UtilizationStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::InUse => "in_use",
            Self::NotInUse => "not_in_use",
            Self::UnderMaintenance => "under_maintenance",
        }
    }

    pub fn parse(value: &str) -> Option<Self> {
        match value.trim().to_ascii_lowercase().as_str() {
            "in_use" => Some(Self::InUse),
            "not_in_use" => Some(Self::NotInUse),
            "under_maintenance" => Some(Self::UnderMaintenance),
            _ => None,
        }
    }
}

/// Exclusive claim an open request holds over an asset. Set and cleared only
/// by the reservation coordinator.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct Reservation {
    pub is_reserved: bool,
    pub request_id: Option<RequestId>,
    pub reserved_by_department_id: Option<DepartmentId>,
    pub reserved_at: Option<DateTime<Utc>>,
}

impl Reservation {
    pub fn free() -> Self {
        Self {
            is_reserved: false,
            request_id: None,
            reserved_by_department_id: None,
            reserved_at: None,
        }
    }

    pub fn held_by(
        request_id: RequestId,
        department_id: DepartmentId,
        reserved_at: DateTime<Utc>,
    ) -> Self {
        Self {
            is_reserved: true,
            request_id: Some(request_id),
            reserved_by_department_id: Some(department_id),
            reserved_at: Some(reserved_at),
        }
    }

    pub fn is_held_by(&self, request_id: &RequestId) -> bool {
        self.is_reserved && self.request_id.as_ref() == Some(request_id)
    }
}

impl Default for Reservation {
    fn default() -> Self {
        Self::free()
    }
}

#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct Asset {
    pub id: AssetId,
    pub name: String,
    pub current_department_id: DepartmentId,
    pub status: AssetStatus,
    pub lifecycle_status: LifecycleStatus,
    pub utilization_status: UtilizationStatus,
    pub reservation: Reservation,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

impl Asset {
    /// An asset can be claimed only while active, idle, and unclaimed.
    pub fn is_reservable(&self) -> bool {
        self.status == AssetStatus::Active
            && self.utilization_status == UtilizationStatus::NotInUse
            && !self.reservation.is_reserved
    }

    /// Preconditions for moving a reserved asset to its destination.
    pub fn is_fulfillable_by(&self, request_id: &RequestId) -> bool {
        self.reservation.is_held_by(request_id)
            && self.status == AssetStatus::Active
            && self.lifecycle_status == LifecycleStatus::Active
    }
}
