use std::sync::Arc;

use async_trait::async_trait;
use tessera_application::SchemaProvider;
use tessera_core::{AppError, AppResult};
use tessera_domain::SchemaOverview;
use tokio::sync::RwLock;
use tracing::info;

/// Schema provider serving a snapshot loaded at startup.
///
/// Requests keep the snapshot they started with when it is replaced.
#[derive(Clone)]
pub struct StaticSchemaProvider {
    snapshot: Arc<RwLock<Arc<SchemaOverview>>>,
}

impl StaticSchemaProvider {
    /// Creates a provider serving `schema`.
    #[must_use]
    pub fn new(schema: SchemaOverview) -> Self {
        Self {
            snapshot: Arc::new(RwLock::new(Arc::new(schema))),
        }
    }

    /// Parses a JSON schema snapshot (`{"collections": [..], "relations": [..]}`).
    pub fn from_json(document: &str) -> AppResult<Self> {
        let schema = serde_json::from_str::<SchemaOverview>(document)
            .map_err(|error| AppError::Validation(format!("invalid schema snapshot: {error}")))?;
        info!(
            collections = schema.collections().count(),
            relations = schema.relations().len(),
            "loaded schema snapshot"
        );
        Ok(Self::new(schema))
    }

    /// Swaps the served snapshot.
    pub async fn replace(&self, schema: SchemaOverview) {
        *self.snapshot.write().await = Arc::new(schema);
    }
}

#[async_trait]
impl SchemaProvider for StaticSchemaProvider {
    async fn schema(&self) -> AppResult<Arc<SchemaOverview>> {
        Ok(Arc::clone(&*self.snapshot.read().await))
    }
}
