use std::sync::Arc;

use async_trait::async_trait;
use tessera_core::AppResult;
use tessera_domain::SchemaOverview;

/// Source of the schema snapshot used for one request.
#[async_trait]
pub trait SchemaProvider: Send + Sync {
    /// Returns the current snapshot.
    async fn schema(&self) -> AppResult<Arc<SchemaOverview>>;
}
