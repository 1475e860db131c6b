use std::collections::HashMap;

use async_trait::async_trait;
use tessera_application::PermissionRepository;
use tessera_core::AppResult;
use tessera_domain::{PermissionAction, PermissionRule, Policy, Role};
use tokio::sync::RwLock;

/// Subject a policy is attached to.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum PolicyAttachment {
    /// Every user holding the role or a descendant of it.
    Role(String),
    /// One user.
    User(String),
    /// Anonymous callers.
    Public,
}

/// In-memory permission repository implementation.
#[derive(Debug, Default)]
pub struct InMemoryPermissionRepository {
    roles: RwLock<HashMap<String, Role>>,
    policies: RwLock<HashMap<String, Policy>>,
    attachments: RwLock<Vec<(PolicyAttachment, String)>>,
    rules: RwLock<Vec<PermissionRule>>,
}

impl InMemoryPermissionRepository {
    /// Creates an empty in-memory repository.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Stores or replaces a role.
    pub async fn save_role(&self, role: Role) {
        self.roles.write().await.insert(role.id().to_owned(), role);
    }

    /// Stores or replaces a policy.
    pub async fn save_policy(&self, policy: Policy) {
        self.policies
            .write()
            .await
            .insert(policy.id().to_owned(), policy);
    }

    /// Attaches a stored policy to a subject.
    pub async fn attach_policy(&self, attachment: PolicyAttachment, policy: impl Into<String>) {
        self.attachments
            .write()
            .await
            .push((attachment, policy.into()));
    }

    /// Appends a permission rule.
    pub async fn save_rule(&self, rule: PermissionRule) {
        self.rules.write().await.push(rule);
    }
}

#[async_trait]
impl PermissionRepository for InMemoryPermissionRepository {
    async fn find_role(&self, role_id: &str) -> AppResult<Option<Role>> {
        Ok(self.roles.read().await.get(role_id).cloned())
    }

    async fn list_policies_for_subject(
        &self,
        roles: &[String],
        user: Option<&str>,
    ) -> AppResult<Vec<Policy>> {
        let public = roles.is_empty() && user.is_none();
        let attachments = self.attachments.read().await;
        let policies = self.policies.read().await;

        Ok(attachments
            .iter()
            .filter(|(attachment, _)| match attachment {
                PolicyAttachment::Role(role) => roles.contains(role),
                PolicyAttachment::User(attached) => user == Some(attached.as_str()),
                PolicyAttachment::Public => public,
            })
            .filter_map(|(_, policy)| policies.get(policy).cloned())
            .collect())
    }

    async fn list_permission_rules(
        &self,
        policies: &[String],
        collection: &str,
        action: PermissionAction,
    ) -> AppResult<Vec<PermissionRule>> {
        Ok(self
            .rules
            .read()
            .await
            .iter()
            .filter(|rule| {
                rule.collection() == collection
                    && rule.action() == action
                    && policies.iter().any(|policy| policy == rule.policy())
            })
            .cloned()
            .collect())
    }
}
