use tessera_domain::Limit;

/// Tunables of the query engine.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct EngineConfig {
    /// Row limit applied when a level has none.
    pub default_limit: u64,
    /// Upper bound on any requested limit.
    pub max_limit: Option<u64>,
    /// Parent keys per deferred one-to-many statement.
    pub relational_batch_size: usize,
    /// Maximum relation nesting, including relational filters.
    pub max_relational_depth: usize,
    /// Run every statement of a request inside one transaction.
    pub snapshot_consistency: bool,
    /// Collection backing `$CURRENT_USER.<path>` lookups.
    pub user_collection: String,
}

impl Default for EngineConfig {
    fn default() -> Self {
        Self {
            default_limit: 100,
            max_limit: None,
            relational_batch_size: 1_000,
            max_relational_depth: 10,
            snapshot_consistency: false,
            user_collection: "system_users".to_owned(),
        }
    }
}

impl EngineConfig {
    /// Resolves the effective limit of a level, `None` meaning every row.
    #[must_use]
    pub fn effective_limit(&self, requested: Option<Limit>) -> Option<u64> {
        let limit = match requested {
            Some(Limit::Rows(rows)) => rows,
            Some(Limit::Unlimited) => return self.max_limit,
            None => self.default_limit,
        };
        Some(match self.max_limit {
            Some(max_limit) => limit.min(max_limit),
            None => limit,
        })
    }
}
