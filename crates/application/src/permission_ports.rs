use async_trait::async_trait;
use tessera_core::AppResult;
use tessera_domain::{PermissionAction, PermissionRule, Policy, Role};

/// Read access to role, policy and permission rule records.
#[async_trait]
pub trait PermissionRepository: Send + Sync {
    /// Finds one role by id.
    async fn find_role(&self, role_id: &str) -> AppResult<Option<Role>>;

    /// Lists policies attached to any of `roles` or to `user`.
    ///
    /// With no roles and no user, returns the public policies.
    async fn list_policies_for_subject(
        &self,
        roles: &[String],
        user: Option<&str>,
    ) -> AppResult<Vec<Policy>>;

    /// Lists rules of the given policies for one collection and action.
    async fn list_permission_rules(
        &self,
        policies: &[String],
        collection: &str,
        action: PermissionAction,
    ) -> AppResult<Vec<PermissionRule>>;
}
