use std::net::IpAddr;

use serde::{Deserialize, Serialize};

/// Resolved identity of the caller for one request.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct Accountability {
    #[serde(default)]
    user: Option<String>,
    #[serde(default)]
    role: Option<String>,
    #[serde(default)]
    roles: Vec<String>,
    #[serde(default)]
    policies: Vec<String>,
    #[serde(default)]
    ip: Option<IpAddr>,
    #[serde(default)]
    admin: bool,
    #[serde(default)]
    app: bool,
}

impl Accountability {
    /// Creates an anonymous caller.
    #[must_use]
    pub fn anonymous() -> Self {
        Self::default()
    }

    /// Creates an authenticated caller with an optional primary role.
    #[must_use]
    pub fn for_user(user: impl Into<String>, role: Option<String>) -> Self {
        Self {
            user: Some(user.into()),
            role,
            ..Self::default()
        }
    }

    /// Sets the caller IP address.
    #[must_use]
    pub fn with_ip(mut self, ip: IpAddr) -> Self {
        self.ip = Some(ip);
        self
    }

    /// Sets the admin bypass flag.
    #[must_use]
    pub fn with_admin(mut self, admin: bool) -> Self {
        self.admin = admin;
        self
    }

    /// Sets the app access flag.
    #[must_use]
    pub fn with_app(mut self, app: bool) -> Self {
        self.app = app;
        self
    }

    /// Replaces the effective role chain, ordered ancestor to self.
    #[must_use]
    pub fn with_roles(mut self, roles: Vec<String>) -> Self {
        self.roles = roles;
        self
    }

    /// Replaces the effective policy set.
    #[must_use]
    pub fn with_policies(mut self, policies: Vec<String>) -> Self {
        self.policies = policies;
        self
    }

    /// Returns the user id, if authenticated.
    #[must_use]
    pub fn user(&self) -> Option<&str> {
        self.user.as_deref()
    }

    /// Returns the primary role id.
    #[must_use]
    pub fn role(&self) -> Option<&str> {
        self.role.as_deref()
    }

    /// Returns effective role ids, ordered ancestor to self.
    #[must_use]
    pub fn roles(&self) -> &[String] {
        &self.roles
    }

    /// Returns effective policy ids.
    #[must_use]
    pub fn policies(&self) -> &[String] {
        &self.policies
    }

    /// Returns the caller IP address.
    #[must_use]
    pub fn ip(&self) -> Option<IpAddr> {
        self.ip
    }

    /// Returns whether the caller bypasses all permission checks.
    #[must_use]
    pub fn is_admin(&self) -> bool {
        self.admin
    }

    /// Returns whether the caller receives the minimal app permission set.
    #[must_use]
    pub fn has_app_access(&self) -> bool {
        self.app
    }

    /// Returns whether no user is authenticated.
    #[must_use]
    pub fn is_anonymous(&self) -> bool {
        self.user.is_none()
    }
}
