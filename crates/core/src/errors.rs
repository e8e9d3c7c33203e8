use thiserror::Error;

use crate::chain::{ChainError, Stage};
use crate::domain::request::{FinalStatus, RequestLevel};

#[derive(Clone, Debug, Error, PartialEq, Eq)]
pub enum DomainError {
    #[error("validation failed: {0}")]
    Validation(String),
    #[error("{kind} `{id}` not found")]
    NotFound { kind: &'static str, id: String },
    #[error("role `{role}` does not map to an approval stage")]
    UnknownRole { role: String },
    #[error("stage `{}` is not the request's current level `{}`", .actor_stage.as_str(), .current.as_str())]
    StageMismatch { actor_stage: Stage, current: RequestLevel },
    #[error("request belongs to organization `{request_organization}`, actor belongs to `{actor_organization}`")]
    OutOfScope { request_organization: String, actor_organization: String },
    #[error("request is scoped to hospital `{request_hospital}`, actor acts for `{actor_hospital}`")]
    CrossHospitalDenied { request_hospital: String, actor_hospital: String },
    #[error("request `{id}` is already closed as {}", .final_status.as_str())]
    AlreadyClosed { id: String, final_status: FinalStatus },
    #[error("only {satisfied} of {requested} assets satisfy the preconditions")]
    AssetConflict { requested: usize, satisfied: usize },
    #[error(transparent)]
    Chain(#[from] ChainError),
}

#[derive(Clone, Debug, Error, PartialEq, Eq)]
pub enum ApplicationError {
    #[error(transparent)]
    Domain(#[from] DomainError),
    #[error("persistence failure: {0}")]
    Persistence(String),
    #[error("configuration failure: {0}")]
    Configuration(String),
}

#[derive(Clone, Debug, Error, PartialEq, Eq)]
pub enum InterfaceError {
    #[error("bad request: {message}")]
    BadRequest { message: String, correlation_id: String },
    #[error("not found: {message}")]
    NotFound { message: String, correlation_id: String },
    #[error("conflict: {message}")]
    Conflict { message: String, correlation_id: String },
    #[error("forbidden: {message}")]
    Forbidden { message: String, correlation_id: String },
    #[error("service unavailable: {message}")]
    ServiceUnavailable { message: String, correlation_id: String },
    #[error("internal error: {message}")]
    Internal { message: String, correlation_id: String },
}

impl InterfaceError {
    pub fn user_message(&self) -> &'static str {
        match self {
            Self::BadRequest { .. } => {
                "The request could not be processed. Check inputs and try again."
            }
            Self::NotFound { .. } => "The requested record does not exist.",
            Self::Conflict { .. } => {
                "The requested assets are no longer available. Re-check and retry."
            }
            Self::Forbidden { .. } => "You are not authorized to act on this request.",
            Self::ServiceUnavailable { .. } => {
                "The service is temporarily unavailable. Please retry shortly."
            }
            Self::Internal { .. } => "An unexpected internal error occurred.",
        }
    }
}

impl ApplicationError {
    pub fn into_interface(self, correlation_id: impl Into<String>) -> InterfaceError {
        let correlation_id = correlation_id.into();
        let mut mapped = InterfaceError::from(self);
        match &mut mapped {
            InterfaceError::BadRequest { correlation_id: id, .. }
            | InterfaceError::NotFound { correlation_id: id, .. }
            | InterfaceError::Conflict { correlation_id: id, .. }
            | InterfaceError::Forbidden { correlation_id: id, .. }
            | InterfaceError::ServiceUnavailable { correlation_id: id, .. }
            | InterfaceError::Internal { correlation_id: id, .. } => *id = correlation_id,
        }
        mapped
    }
}

impl From<ApplicationError> for InterfaceError {
    fn from(value: ApplicationError) -> Self {
        let unassigned = "unassigned".to_owned();
        match value {
            ApplicationError::Domain(domain) => match domain {
                DomainError::NotFound { .. } => Self::NotFound {
                    message: domain.to_string(),
                    correlation_id: unassigned,
                },
                DomainError::AssetConflict { .. } | DomainError::AlreadyClosed { .. } => {
                    Self::Conflict { message: domain.to_string(), correlation_id: unassigned }
                }
                DomainError::StageMismatch { .. }
                | DomainError::UnknownRole { .. }
                | DomainError::OutOfScope { .. }
                | DomainError::CrossHospitalDenied { .. } => {
                    Self::Forbidden { message: domain.to_string(), correlation_id: unassigned }
                }
                DomainError::Validation(_) | DomainError::Chain(_) => Self::BadRequest {
                    message: domain.to_string(),
                    correlation_id: unassigned,
                },
            },
            ApplicationError::Persistence(message) => {
                Self::ServiceUnavailable { message, correlation_id: unassigned }
            }
            ApplicationError::Configuration(message) => {
                Self::Internal { message, correlation_id: unassigned }
            }
        }
    }
}
