use std::collections::{BTreeSet, HashMap, HashSet};
use std::future::Future;
use std::hash::Hash;
use std::sync::Arc;

use tessera_core::{AppError, AppResult};
use tessera_domain::{Accountability, PermissionAction, PermissionRule, Policy, app_access_rules};
use tokio::sync::RwLock;
use tracing::{debug, info, warn};

use crate::PermissionRepository;

const MAX_ROLE_CHAIN: usize = 64;

#[derive(Debug, Clone, PartialEq, Eq, Hash)]
struct SubjectKey {
    roles: Vec<String>,
    user: Option<String>,
}

#[derive(Debug, Clone, PartialEq, Eq, Hash)]
struct RuleKey {
    policies: Vec<String>,
    collection: String,
    action: PermissionAction,
}

#[derive(Default)]
struct CatalogGeneration {
    generation: u64,
    role_chains: HashMap<String, Arc<Vec<String>>>,
    policies: HashMap<SubjectKey, Arc<Vec<Policy>>>,
    rules: HashMap<RuleKey, Arc<Vec<PermissionRule>>>,
}

/// Read-through cache over role, policy and rule storage.
///
/// Cache entries belong to one generation. [`PermissionCatalog::invalidate`]
/// replaces the whole generation at once, and fills started before an
/// invalidation are dropped instead of being stored in the new generation.
/// Loading failures fail closed: the caller gets no policies or rules.
pub struct PermissionCatalog {
    repository: Arc<dyn PermissionRepository>,
    user_collection: String,
    state: RwLock<CatalogGeneration>,
}

impl PermissionCatalog {
    /// Creates an empty catalog.
    #[must_use]
    pub fn new(repository: Arc<dyn PermissionRepository>) -> Self {
        Self {
            repository,
            user_collection: "system_users".to_owned(),
            state: RwLock::new(CatalogGeneration::default()),
        }
    }

    /// Sets the collection targeted by the app access user rule.
    #[must_use]
    pub fn with_user_collection(mut self, user_collection: impl Into<String>) -> Self {
        self.user_collection = user_collection.into();
        self
    }

    /// Drops every cached entry.
    pub async fn invalidate(&self) {
        let mut state = self.state.write().await;
        let generation = state.generation + 1;
        *state = CatalogGeneration {
            generation,
            ..CatalogGeneration::default()
        };
        info!(generation, "permission catalog invalidated");
    }

    /// Returns the ancestor chain of `role`, ordered ancestor to self.
    pub async fn role_chain(&self, role: &str) -> AppResult<Arc<Vec<String>>> {
        let repository = Arc::clone(&self.repository);
        let root = role.to_owned();
        self.read_through(
            role.to_owned(),
            |state| &state.role_chains,
            |state| &mut state.role_chains,
            || load_role_chain(repository, root),
        )
        .await
    }

    /// Returns ids of the policies effective for the caller.
    pub async fn effective_policies(&self, accountability: &Accountability) -> Vec<String> {
        self.effective_policy_records(accountability)
            .await
            .iter()
            .map(|policy| policy.id().to_owned())
            .collect()
    }

    /// Returns a copy of `accountability` with role chain, policies and
    /// policy flags filled in from storage.
    pub async fn resolve_accountability(&self, accountability: &Accountability) -> Accountability {
        let roles = match accountability.role() {
            Some(role) => self.role_chain_or_empty(role).await,
            None => Vec::new(),
        };
        let policies = self.effective_policy_records(accountability).await;

        let admin = accountability.is_admin() || policies.iter().any(Policy::admin_access);
        let app = accountability.has_app_access() || policies.iter().any(Policy::app_access);

        accountability
            .clone()
            .with_roles(roles)
            .with_policies(policies.iter().map(|policy| policy.id().to_owned()).collect())
            .with_admin(admin)
            .with_app(app)
    }

    /// Returns stored rules of `policies` for one collection and action.
    pub async fn rules_for(
        &self,
        policies: &[String],
        collection: &str,
        action: PermissionAction,
    ) -> Vec<PermissionRule> {
        if policies.is_empty() {
            return Vec::new();
        }

        let mut sorted = policies.to_vec();
        sorted.sort();
        sorted.dedup();

        let key = RuleKey {
            policies: sorted.clone(),
            collection: collection.to_owned(),
            action,
        };
        let repository = Arc::clone(&self.repository);
        let collection_name = collection.to_owned();
        let loaded = self
            .read_through(
                key,
                |state| &state.rules,
                |state| &mut state.rules,
                || async move {
                    repository
                        .list_permission_rules(&sorted, &collection_name, action)
                        .await
                },
            )
            .await;

        match loaded {
            Ok(rules) => rules.as_ref().clone(),
            Err(error) => {
                warn!(
                    collection,
                    action = action.as_str(),
                    %error,
                    "permission rules unavailable, denying access"
                );
                Vec::new()
            }
        }
    }

    /// Returns the rules that apply to an already resolved caller, including
    /// the fixed app access set.
    pub async fn rules_for_accountability(
        &self,
        accountability: &Accountability,
        collection: &str,
        action: PermissionAction,
    ) -> Vec<PermissionRule> {
        let mut rules = self
            .rules_for(accountability.policies(), collection, action)
            .await;
        if accountability.has_app_access() && action == PermissionAction::Read {
            rules.extend(app_access_rules(collection, &self.user_collection));
        }
        rules
    }

    async fn role_chain_or_empty(&self, role: &str) -> Vec<String> {
        match self.role_chain(role).await {
            Ok(chain) => chain.as_ref().clone(),
            Err(error) => {
                warn!(role, %error, "role chain unavailable, denying role policies");
                Vec::new()
            }
        }
    }

    async fn effective_policy_records(&self, accountability: &Accountability) -> Vec<Policy> {
        let roles = match accountability.role() {
            Some(role) => {
                let chain = self.role_chain_or_empty(role).await;
                if chain.is_empty() {
                    return Vec::new();
                }
                chain
            }
            None => Vec::new(),
        };
        let key = SubjectKey {
            roles: roles.clone(),
            user: accountability.user().map(str::to_owned),
        };

        let repository = Arc::clone(&self.repository);
        let user = key.user.clone();
        let loaded = self
            .read_through(
                key,
                |state| &state.policies,
                |state| &mut state.policies,
                || async move {
                    repository
                        .list_policies_for_subject(&roles, user.as_deref())
                        .await
                },
            )
            .await;

        let policies = match loaded {
            Ok(policies) => policies,
            Err(error) => {
                warn!(%error, "policies unavailable, denying access");
                return Vec::new();
            }
        };

        let mut seen = HashSet::new();
        policies
            .iter()
            .filter(|policy| policy.allows_ip(accountability.ip()))
            .filter(|policy| seen.insert(policy.id().to_owned()))
            .cloned()
            .collect()
    }

    async fn read_through<K, V, Fut>(
        &self,
        key: K,
        slot: fn(&CatalogGeneration) -> &HashMap<K, Arc<V>>,
        slot_mut: fn(&mut CatalogGeneration) -> &mut HashMap<K, Arc<V>>,
        load: impl FnOnce() -> Fut,
    ) -> AppResult<Arc<V>>
    where
        K: Eq + Hash,
        Fut: Future<Output = AppResult<V>>,
    {
        let generation = {
            let state = self.state.read().await;
            if let Some(entry) = slot(&*state).get(&key) {
                return Ok(Arc::clone(entry));
            }
            state.generation
        };

        let value = Arc::new(load().await?);

        let mut state = self.state.write().await;
        if state.generation == generation {
            slot_mut(&mut *state).insert(key, Arc::clone(&value));
        } else {
            debug!(
                fill_generation = generation,
                current_generation = state.generation,
                "discarding permission catalog fill from a stale generation"
            );
        }

        Ok(value)
    }
}

async fn load_role_chain(
    repository: Arc<dyn PermissionRepository>,
    role: String,
) -> AppResult<Vec<String>> {
    let mut chain = Vec::new();
    let mut visited = BTreeSet::new();
    let mut current = Some(role);

    while let Some(role_id) = current {
        if !visited.insert(role_id.clone()) || chain.len() >= MAX_ROLE_CHAIN {
            return Err(AppError::Internal(format!(
                "role hierarchy above '{role_id}' is cyclic or too deep"
            )));
        }

        match repository.find_role(&role_id).await? {
            Some(role) => {
                current = role.parent().map(str::to_owned);
                chain.push(role_id);
            }
            None if chain.is_empty() => {
                return Err(AppError::Internal(format!("role '{role_id}' does not exist")));
            }
            None => {
                warn!(role = %role_id, "parent role is missing, truncating role chain");
                current = None;
            }
        }
    }

    chain.reverse();
    Ok(chain)
}
