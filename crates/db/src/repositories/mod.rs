use thiserror::Error;

use wardflow_core::store::StoreError;

pub mod asset;
pub mod audit;
pub mod request;

pub use asset::SqlAssetStore;
pub use audit::SqlAuditSink;
pub use request::SqlRequestStore;

#[derive(Debug, Error)]
pub enum RepositoryError {
    #[error("database error: {0}")]
    Database(#[from] sqlx::Error),
    #[error("decode error: {0}")]
    Decode(String),
}

impl From<RepositoryError> for StoreError {
    fn from(value: RepositoryError) -> Self {
        StoreError(value.to_string())
    }
}

pub(crate) fn db_err(error: sqlx::Error) -> StoreError {
    RepositoryError::Database(error).into()
}
