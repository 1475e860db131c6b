use std::sync::Arc;

use chrono::Utc;
use serde::Serialize;
use serde_json::Value;
use tessera_core::AppResult;
use tessera_domain::{Accountability, QueryTree};
use tracing::{info, warn};

use crate::query_plan::PlannedLevel;
use crate::query_runner::{FetchedRecord, QueryRunner};
use crate::{
    CancellationSignal, DynamicVariableResolver, EngineConfig, PermissionCatalog,
    PermissionInjector, RelationalDriver, SchemaProvider, prune_records, render_records,
};

/// Rows returned for one read request.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct NestedResult {
    /// Root collection.
    pub collection: String,
    /// Root rows with nested relations.
    pub items: Vec<Value>,
}

/// Read path: authorizes a query tree, fetches it and shapes the rows.
#[derive(Clone)]
pub struct QueryEngine {
    catalog: Arc<PermissionCatalog>,
    schema_provider: Arc<dyn SchemaProvider>,
    driver: Arc<dyn RelationalDriver>,
    config: EngineConfig,
}

impl QueryEngine {
    /// Creates an engine over one database.
    #[must_use]
    pub fn new(
        catalog: Arc<PermissionCatalog>,
        schema_provider: Arc<dyn SchemaProvider>,
        driver: Arc<dyn RelationalDriver>,
        config: EngineConfig,
    ) -> Self {
        Self {
            catalog,
            schema_provider,
            driver,
            config,
        }
    }

    /// Returns the permission catalog, e.g. to invalidate it after edits.
    #[must_use]
    pub fn catalog(&self) -> &PermissionCatalog {
        &self.catalog
    }

    /// Runs a read request to completion.
    pub async fn run_query(
        &self,
        tree: &QueryTree,
        accountability: &Accountability,
    ) -> AppResult<NestedResult> {
        self.run_query_with_cancellation(tree, accountability, &CancellationSignal::never())
            .await
    }

    /// Runs a read request, stopping before the next statement once `signal`
    /// fires.
    pub async fn run_query_with_cancellation(
        &self,
        tree: &QueryTree,
        accountability: &Accountability,
        signal: &CancellationSignal,
    ) -> AppResult<NestedResult> {
        let schema = self.schema_provider.schema().await?;
        let accountability = self.catalog.resolve_accountability(accountability).await;

        let injector = PermissionInjector::new(
            &schema,
            &self.catalog,
            &self.config,
            DynamicVariableResolver::new(Utc::now()),
        );
        let plan = injector.inject(tree, &accountability).await?;

        let mut records = if self.config.snapshot_consistency {
            self.fetch_in_transaction(&plan, signal).await?
        } else {
            QueryRunner::new(
                self.driver.as_ref(),
                self.driver.dialect(),
                &self.config,
                signal,
            )
            .run(&plan)
            .await?
        };

        prune_records(&plan, &mut records);
        let items = render_records(&plan, records)?;
        info!(
            collection = %plan.collection,
            rows = items.len(),
            admin = accountability.is_admin(),
            "read request completed"
        );

        Ok(NestedResult {
            collection: plan.collection,
            items,
        })
    }

    async fn fetch_in_transaction(
        &self,
        plan: &PlannedLevel,
        signal: &CancellationSignal,
    ) -> AppResult<Vec<FetchedRecord>> {
        let transaction = self.driver.begin_transaction().await?;
        let result = QueryRunner::new(
            transaction.as_ref(),
            self.driver.dialect(),
            &self.config,
            signal,
        )
        .run(plan)
        .await;

        match result {
            Ok(records) => {
                transaction.commit().await?;
                Ok(records)
            }
            Err(error) => {
                if let Err(rollback_error) = transaction.rollback().await {
                    warn!(error = %rollback_error, "failed to roll back read transaction");
                }
                Err(error)
            }
        }
    }
}
