use crate::domain::model::Record;
use crate::utils::error::Result;
use async_trait::async_trait;

/// Lazy, forward-only sequence of records. Pulled one row at a time so the
/// whole input is never materialized for file-backed sources.
pub type RecordIter = Box<dyn Iterator<Item = Result<Record>> + Send>;

/// Resolves a source descriptor into a sequence of records.
#[async_trait]
pub trait RecordSource: Send + Sync {
    async fn records(&self) -> Result<RecordIter>;
}

/// Read access to a secret-management backend.
#[async_trait]
pub trait SecretStore: Send + Sync {
    async fn access(&self, name: &str) -> Result<String>;
}
