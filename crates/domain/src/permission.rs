use std::collections::BTreeSet;
use std::net::IpAddr;
use std::str::FromStr;

use ipnet::IpNet;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use tessera_core::{AppError, AppResult, NonEmptyString};

use crate::Filter;

/// Action a permission rule grants.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum PermissionAction {
    /// Create rows.
    Create,
    /// Read rows.
    Read,
    /// Update rows.
    Update,
    /// Delete rows.
    Delete,
    /// Share rows.
    Share,
}

impl PermissionAction {
    /// Returns stable storage value.
    #[must_use]
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Create => "create",
            Self::Read => "read",
            Self::Update => "update",
            Self::Delete => "delete",
            Self::Share => "share",
        }
    }
}

impl FromStr for PermissionAction {
    type Err = AppError;

    fn from_str(value: &str) -> Result<Self, Self::Err> {
        match value {
            "create" => Ok(Self::Create),
            "read" => Ok(Self::Read),
            "update" => Ok(Self::Update),
            "delete" => Ok(Self::Delete),
            "share" => Ok(Self::Share),
            _ => Err(AppError::Validation(format!(
                "unknown permission action '{value}'"
            ))),
        }
    }
}

/// Fields a rule exposes.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(from = "Option<Vec<String>>", into = "Vec<String>")]
pub enum FieldAllowList {
    /// Every field (`["*"]`).
    All,
    /// Only the listed fields. Empty means none.
    Only(BTreeSet<String>),
}

impl FieldAllowList {
    /// Returns the empty allow-list.
    #[must_use]
    pub fn none() -> Self {
        Self::Only(BTreeSet::new())
    }

    /// Builds an allow-list from stored field names; `None` grants nothing.
    #[must_use]
    pub fn from_fields<I, S>(fields: Option<I>) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        let Some(fields) = fields else {
            return Self::none();
        };

        let mut names = BTreeSet::new();
        for field in fields {
            let field = field.into();
            if field == "*" {
                return Self::All;
            }
            names.insert(field);
        }

        Self::Only(names)
    }

    /// Returns whether the field is exposed.
    #[must_use]
    pub fn allows(&self, field: &str) -> bool {
        match self {
            Self::All => true,
            Self::Only(fields) => fields.contains(field),
        }
    }

    /// Returns whether every field is exposed.
    #[must_use]
    pub fn is_all(&self) -> bool {
        matches!(self, Self::All)
    }

    /// Returns whether nothing is exposed.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        matches!(self, Self::Only(fields) if fields.is_empty())
    }

    /// Returns whether every field allowed here is also allowed by `other`.
    #[must_use]
    pub fn is_subset_of(&self, other: &Self) -> bool {
        match (self, other) {
            (_, Self::All) => true,
            (Self::All, Self::Only(_)) => false,
            (Self::Only(left), Self::Only(right)) => left.is_subset(right),
        }
    }

    /// Union; `*` absorbs.
    #[must_use]
    pub fn union(&self, other: &Self) -> Self {
        match (self, other) {
            (Self::All, _) | (_, Self::All) => Self::All,
            (Self::Only(left), Self::Only(right)) => {
                Self::Only(left.union(right).cloned().collect())
            }
        }
    }

    /// Intersection; `*` is the identity.
    #[must_use]
    pub fn intersection(&self, other: &Self) -> Self {
        match (self, other) {
            (Self::All, other) | (other, Self::All) => other.clone(),
            (Self::Only(left), Self::Only(right)) => {
                Self::Only(left.intersection(right).cloned().collect())
            }
        }
    }

    /// Returns the stored representation.
    #[must_use]
    pub fn to_vec(&self) -> Vec<String> {
        match self {
            Self::All => vec!["*".to_owned()],
            Self::Only(fields) => fields.iter().cloned().collect(),
        }
    }
}

impl From<Option<Vec<String>>> for FieldAllowList {
    fn from(fields: Option<Vec<String>>) -> Self {
        Self::from_fields(fields)
    }
}

impl From<FieldAllowList> for Vec<String> {
    fn from(fields: FieldAllowList) -> Self {
        fields.to_vec()
    }
}

/// Access grant for one policy, collection and action.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PermissionRule {
    policy: String,
    collection: String,
    action: PermissionAction,
    #[serde(default)]
    permissions: Option<Filter>,
    #[serde(default)]
    validation: Option<Filter>,
    #[serde(default = "FieldAllowList::none")]
    fields: FieldAllowList,
    #[serde(default)]
    presets: Option<Value>,
}

impl PermissionRule {
    /// Creates a rule with no row restriction and no fields.
    #[must_use]
    pub fn new(
        policy: impl Into<String>,
        collection: impl Into<String>,
        action: PermissionAction,
    ) -> Self {
        Self {
            policy: policy.into(),
            collection: collection.into(),
            action,
            permissions: None,
            validation: None,
            fields: FieldAllowList::none(),
            presets: None,
        }
    }

    /// Sets the row filter.
    #[must_use]
    pub fn with_filter(mut self, filter: Filter) -> Self {
        self.permissions = Some(filter);
        self
    }

    /// Sets the validation filter.
    #[must_use]
    pub fn with_validation(mut self, validation: Filter) -> Self {
        self.validation = Some(validation);
        self
    }

    /// Sets the field allow-list.
    #[must_use]
    pub fn with_fields(mut self, fields: FieldAllowList) -> Self {
        self.fields = fields;
        self
    }

    /// Sets default values applied on write.
    #[must_use]
    pub fn with_presets(mut self, presets: Value) -> Self {
        self.presets = Some(presets);
        self
    }

    /// Returns the granting policy id.
    #[must_use]
    pub fn policy(&self) -> &str {
        self.policy.as_str()
    }

    /// Returns the collection.
    #[must_use]
    pub fn collection(&self) -> &str {
        self.collection.as_str()
    }

    /// Returns the action.
    #[must_use]
    pub fn action(&self) -> PermissionAction {
        self.action
    }

    /// Returns the row filter; `None` is unrestricted.
    #[must_use]
    pub fn filter(&self) -> Option<&Filter> {
        self.permissions.as_ref()
    }

    /// Returns the validation filter.
    #[must_use]
    pub fn validation(&self) -> Option<&Filter> {
        self.validation.as_ref()
    }

    /// Returns the field allow-list.
    #[must_use]
    pub fn fields(&self) -> &FieldAllowList {
        &self.fields
    }

    /// Returns presets.
    #[must_use]
    pub fn presets(&self) -> Option<&Value> {
        self.presets.as_ref()
    }
}

/// Named bundle of permission rules.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Policy {
    id: NonEmptyString,
    name: String,
    #[serde(default)]
    ip_access: Vec<IpNet>,
    #[serde(default)]
    admin_access: bool,
    #[serde(default)]
    app_access: bool,
}

impl Policy {
    /// Creates a policy without IP restrictions or elevated flags.
    pub fn new(id: impl Into<String>, name: impl Into<String>) -> AppResult<Self> {
        Ok(Self {
            id: NonEmptyString::new(id)?,
            name: name.into(),
            ip_access: Vec::new(),
            admin_access: false,
            app_access: false,
        })
    }

    /// Restricts the policy to the given networks.
    #[must_use]
    pub fn with_ip_access(mut self, ip_access: Vec<IpNet>) -> Self {
        self.ip_access = ip_access;
        self
    }

    /// Sets the admin flag.
    #[must_use]
    pub fn with_admin_access(mut self, admin_access: bool) -> Self {
        self.admin_access = admin_access;
        self
    }

    /// Sets the app flag.
    #[must_use]
    pub fn with_app_access(mut self, app_access: bool) -> Self {
        self.app_access = app_access;
        self
    }

    /// Parses a stored comma-separated network list.
    pub fn parse_ip_access(value: &str) -> AppResult<Vec<IpNet>> {
        value
            .split(',')
            .map(str::trim)
            .filter(|entry| !entry.is_empty())
            .map(|entry| {
                entry
                    .parse::<IpNet>()
                    .or_else(|_| entry.parse::<IpAddr>().map(IpNet::from))
                    .map_err(|error| {
                        AppError::Validation(format!("invalid ip access entry '{entry}': {error}"))
                    })
            })
            .collect()
    }

    /// Returns the policy id.
    #[must_use]
    pub fn id(&self) -> &str {
        self.id.as_str()
    }

    /// Returns the display name.
    #[must_use]
    pub fn name(&self) -> &str {
        self.name.as_str()
    }

    /// Returns the allowed networks; empty means unrestricted.
    #[must_use]
    pub fn ip_access(&self) -> &[IpNet] {
        &self.ip_access
    }

    /// Returns whether the policy grants full bypass.
    #[must_use]
    pub fn admin_access(&self) -> bool {
        self.admin_access
    }

    /// Returns whether the policy grants the minimal app set.
    #[must_use]
    pub fn app_access(&self) -> bool {
        self.app_access
    }

    /// Returns whether a caller at `ip` may use this policy.
    ///
    /// An unknown caller address never satisfies a restricted policy.
    #[must_use]
    pub fn allows_ip(&self, ip: Option<IpAddr>) -> bool {
        if self.ip_access.is_empty() {
            return true;
        }

        ip.is_some_and(|ip| self.ip_access.iter().any(|network| network.contains(&ip)))
    }
}

/// Role with an optional parent.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Role {
    id: NonEmptyString,
    #[serde(default)]
    parent: Option<String>,
}

impl Role {
    /// Creates a role.
    pub fn new(id: impl Into<String>, parent: Option<String>) -> AppResult<Self> {
        Ok(Self {
            id: NonEmptyString::new(id)?,
            parent,
        })
    }

    /// Returns the role id.
    #[must_use]
    pub fn id(&self) -> &str {
        self.id.as_str()
    }

    /// Returns the parent role id.
    #[must_use]
    pub fn parent(&self) -> Option<&str> {
        self.parent.as_deref()
    }
}
