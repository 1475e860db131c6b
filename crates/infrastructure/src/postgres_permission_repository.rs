use std::str::FromStr;

use async_trait::async_trait;
use serde_json::Value;
use sqlx::{FromRow, PgPool};
use tessera_application::PermissionRepository;
use tessera_core::{AppError, AppResult};
use tessera_domain::{FieldAllowList, Filter, PermissionAction, PermissionRule, Policy, Role};

/// PostgreSQL-backed repository for roles, policies and permission rules.
#[derive(Clone)]
pub struct PostgresPermissionRepository {
    pool: PgPool,
}

impl PostgresPermissionRepository {
    /// Creates a repository with the provided connection pool.
    #[must_use]
    pub fn new(pool: PgPool) -> Self {
        Self { pool }
    }
}

#[derive(Debug, FromRow)]
struct RoleRow {
    id: String,
    parent: Option<String>,
}

#[derive(Debug, FromRow)]
struct PolicyRow {
    id: String,
    name: String,
    ip_access: Option<String>,
    admin_access: bool,
    app_access: bool,
}

#[derive(Debug, FromRow)]
struct PermissionRow {
    policy: String,
    collection: String,
    action: String,
    permissions: Option<Value>,
    validation: Option<Value>,
    presets: Option<Value>,
    fields: Option<Vec<String>>,
}

#[async_trait]
impl PermissionRepository for PostgresPermissionRepository {
    async fn find_role(&self, role_id: &str) -> AppResult<Option<Role>> {
        let row = sqlx::query_as::<_, RoleRow>(
            r#"
            SELECT id, parent
            FROM tessera_roles
            WHERE id = $1
            "#,
        )
        .bind(role_id)
        .fetch_optional(&self.pool)
        .await
        .map_err(|error| AppError::Internal(format!("failed to load role: {error}")))?;

        row.map(|row| Role::new(row.id, row.parent)).transpose()
    }

    async fn list_policies_for_subject(
        &self,
        roles: &[String],
        user: Option<&str>,
    ) -> AppResult<Vec<Policy>> {
        let public = roles.is_empty() && user.is_none();
        let rows = sqlx::query_as::<_, PolicyRow>(
            r#"
            SELECT DISTINCT policies.id, policies.name, policies.ip_access,
                policies.admin_access, policies.app_access
            FROM tessera_access AS access
            INNER JOIN tessera_policies AS policies
                ON policies.id = access.policy
            WHERE access.role = ANY($1)
                OR access.user_id = $2
                OR ($3 AND access.role IS NULL AND access.user_id IS NULL)
            ORDER BY policies.id
            "#,
        )
        .bind(roles)
        .bind(user)
        .bind(public)
        .fetch_all(&self.pool)
        .await
        .map_err(|error| AppError::Internal(format!("failed to load policies: {error}")))?;

        rows.into_iter().map(policy_from_row).collect()
    }

    async fn list_permission_rules(
        &self,
        policies: &[String],
        collection: &str,
        action: PermissionAction,
    ) -> AppResult<Vec<PermissionRule>> {
        let rows = sqlx::query_as::<_, PermissionRow>(
            r#"
            SELECT policy, collection, action, permissions, validation, presets, fields
            FROM tessera_permissions
            WHERE policy = ANY($1)
                AND collection = $2
                AND action = $3
            ORDER BY id
            "#,
        )
        .bind(policies)
        .bind(collection)
        .bind(action.as_str())
        .fetch_all(&self.pool)
        .await
        .map_err(|error| {
            AppError::Internal(format!("failed to load permission rules: {error}"))
        })?;

        rows.into_iter().map(rule_from_row).collect()
    }
}

fn policy_from_row(row: PolicyRow) -> AppResult<Policy> {
    let decode = |error: AppError| {
        AppError::Internal(format!("failed to decode policy '{}': {error}", row.id))
    };
    let ip_access = row
        .ip_access
        .as_deref()
        .map(Policy::parse_ip_access)
        .transpose()
        .map_err(decode)?
        .unwrap_or_default();

    Ok(Policy::new(row.id.as_str(), row.name.as_str())
        .map_err(decode)?
        .with_ip_access(ip_access)
        .with_admin_access(row.admin_access)
        .with_app_access(row.app_access))
}

fn rule_from_row(row: PermissionRow) -> AppResult<PermissionRule> {
    let decode = |error: AppError| {
        AppError::Internal(format!(
            "failed to decode {} permission of policy '{}' on '{}': {error}",
            row.action, row.policy, row.collection
        ))
    };
    let action = PermissionAction::from_str(row.action.as_str()).map_err(decode)?;
    let filter = |value: &Option<Value>| {
        value
            .as_ref()
            .filter(|value| !value.is_null())
            .map(Filter::from_json)
            .transpose()
    };
    let permissions = filter(&row.permissions).map_err(decode)?;
    let validation = filter(&row.validation).map_err(decode)?;

    let mut rule = PermissionRule::new(row.policy.as_str(), row.collection.as_str(), action)
        .with_fields(FieldAllowList::from_fields(row.fields.clone()));
    if let Some(permissions) = permissions {
        rule = rule.with_filter(permissions);
    }
    if let Some(validation) = validation {
        rule = rule.with_validation(validation);
    }
    if let Some(presets) = row.presets.clone() {
        rule = rule.with_presets(presets);
    }
    Ok(rule)
}
