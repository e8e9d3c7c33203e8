pub mod audit;
pub mod chain;
pub mod config;
pub mod domain;
pub mod errors;
pub mod escalation;
pub mod notify;
pub mod reservation;
pub mod service;
pub mod store;
pub mod workflow;

pub use audit::{AuditCategory, AuditEvent, AuditOutcome, AuditSink, InMemoryAuditSink};
pub use chain::{ApprovalChain, ChainError, RoleMap, Stage};
pub use domain::asset::{Asset, AssetId, AssetStatus, LifecycleStatus, Reservation, UtilizationStatus};
pub use domain::request::{
    ApprovalStep, AssetRequest, FinalStatus, Fulfillment, Priority, RequestId, RequestLevel,
    RequestMode, RequestScope, RequestSeed, RequestType, ScopeLevel, StepStatus,
};
pub use domain::{DepartmentId, HospitalId, OrganizationId};
pub use errors::{ApplicationError, DomainError, InterfaceError};
pub use escalation::{EscalationSweeper, SweepReport};
pub use notify::{NotificationSink, NoopNotificationSink, StageChangeNotice};
pub use reservation::ReservationCoordinator;
pub use service::{NewRequestInput, RequestService, ServiceDefaults};
pub use store::{AssetStore, RequestStore, StoreError};
pub use workflow::{Actor, ApprovalEngine, ApprovalOutcome, EscalationOutcome};
