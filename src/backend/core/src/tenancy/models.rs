//! Tenancy data models: identifiers, roles, actions, and membership records.
//!
//! Role names arrive from identity providers and policy files in many
//! spellings ("admin", "ADMIN", "workspace_owner", "read-only"). They are
//! collapsed into closed enums by [`normalize_role_name`] at the boundary and
//! never compared as strings afterwards.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;
use uuid::Uuid;

use crate::error::BastionError;

// ═══════════════════════════════════════════════════════════════════════════════
// Identifiers
// ═══════════════════════════════════════════════════════════════════════════════

macro_rules! string_id {
    ($(#[$meta:meta])* $name:ident) => {
        $(#[$meta])*
        #[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
        #[serde(transparent)]
        pub struct $name(pub String);

        impl $name {
            pub fn new(id: impl Into<String>) -> Self {
                Self(id.into())
            }

            pub fn generate() -> Self {
                Self(Uuid::new_v4().to_string())
            }

            pub fn as_str(&self) -> &str {
                &self.0
            }
        }

        impl fmt::Display for $name {
            fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
                write!(f, "{}", self.0)
            }
        }

        impl From<String> for $name {
            fn from(s: String) -> Self {
                Self(s)
            }
        }

        impl From<&str> for $name {
            fn from(s: &str) -> Self {
                Self(s.to_string())
            }
        }
    };
}

string_id!(
    /// Strongly-typed user identifier, as verified by the identity provider.
    UserId
);
string_id!(
    /// Strongly-typed organization (tenant) identifier.
    OrganizationId
);
string_id!(
    /// Strongly-typed workspace identifier.
    WorkspaceId
);
string_id!(
    /// Identifier of a business entity (project, task, document, form).
    EntityId
);

/// Per-request identifier.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct RequestId(pub Uuid);

impl RequestId {
    pub fn new() -> Self {
        Self(Uuid::new_v4())
    }
}

impl Default for RequestId {
    fn default() -> Self {
        Self::new()
    }
}

impl fmt::Display for RequestId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

// ═══════════════════════════════════════════════════════════════════════════════
// Role name normalization
// ═══════════════════════════════════════════════════════════════════════════════

/// Canonical role name after normalization.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RoleName {
    Admin,
    Owner,
    Member,
    Viewer,
}

/// Collapse any accepted spelling of a role into its canonical name.
///
/// Case, surrounding whitespace, `-`/space separators and a scope prefix
/// (`workspace_`, `platform_`, `org_`, `organization_`) are ignored.
pub fn normalize_role_name(raw: &str) -> Option<RoleName> {
    let lowered = raw.trim().to_ascii_lowercase().replace(['-', ' '], "_");
    let bare = ["workspace_", "platform_", "organization_", "org_"]
        .iter()
        .find_map(|prefix| lowered.strip_prefix(prefix))
        .unwrap_or(lowered.as_str());

    match bare {
        "admin" | "administrator" | "superadmin" | "super_admin" => Some(RoleName::Admin),
        "owner" => Some(RoleName::Owner),
        "member" => Some(RoleName::Member),
        "viewer" | "readonly" | "read_only" => Some(RoleName::Viewer),
        _ => None,
    }
}

fn unknown_role(kind: &str, raw: &str) -> BastionError {
    BastionError::invalid_input(format!("Unknown {} role: {}", kind, raw))
}

// ═══════════════════════════════════════════════════════════════════════════════
// Roles
// ═══════════════════════════════════════════════════════════════════════════════

/// A caller's role at the organization level, supplied by the identity provider.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase", try_from = "String")]
pub enum PlatformRole {
    Admin,
    Member,
    Viewer,
}

impl FromStr for PlatformRole {
    type Err = BastionError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match normalize_role_name(s) {
            Some(RoleName::Admin) => Ok(Self::Admin),
            Some(RoleName::Member) => Ok(Self::Member),
            Some(RoleName::Viewer) => Ok(Self::Viewer),
            _ => Err(unknown_role("platform", s)),
        }
    }
}

impl TryFrom<String> for PlatformRole {
    type Error = BastionError;

    fn try_from(value: String) -> Result<Self, Self::Error> {
        value.parse()
    }
}

/// A caller's role inside one workspace.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase", try_from = "String")]
pub enum WorkspaceRole {
    Owner,
    Member,
    Viewer,
}

impl FromStr for WorkspaceRole {
    type Err = BastionError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match normalize_role_name(s) {
            Some(RoleName::Owner) => Ok(Self::Owner),
            Some(RoleName::Member) => Ok(Self::Member),
            Some(RoleName::Viewer) => Ok(Self::Viewer),
            _ => Err(unknown_role("workspace", s)),
        }
    }
}

impl TryFrom<String> for WorkspaceRole {
    type Error = BastionError;

    fn try_from(value: String) -> Result<Self, Self::Error> {
        value.parse()
    }
}

/// Organization-level membership role.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase", try_from = "String")]
pub enum OrganizationRole {
    Owner,
    Admin,
    Member,
}

impl FromStr for OrganizationRole {
    type Err = BastionError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match normalize_role_name(s) {
            Some(RoleName::Owner) => Ok(Self::Owner),
            Some(RoleName::Admin) => Ok(Self::Admin),
            Some(RoleName::Member) => Ok(Self::Member),
            _ => Err(unknown_role("organization", s)),
        }
    }
}

impl TryFrom<String> for OrganizationRole {
    type Error = BastionError;

    fn try_from(value: String) -> Result<Self, Self::Error> {
        value.parse()
    }
}

/// Effective role evaluated by the policy matrix.
///
/// Ordered by privilege: `Viewer < Member < Owner < Admin`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "lowercase", try_from = "String")]
pub enum Role {
    Viewer,
    Member,
    Owner,
    Admin,
}

impl Role {
    /// All roles, least privileged first.
    pub const ALL: [Role; 4] = [Role::Viewer, Role::Member, Role::Owner, Role::Admin];

    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Viewer => "viewer",
            Self::Member => "member",
            Self::Owner => "owner",
            Self::Admin => "admin",
        }
    }
}

impl fmt::Display for Role {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for Role {
    type Err = BastionError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match normalize_role_name(s) {
            Some(RoleName::Admin) => Ok(Self::Admin),
            Some(RoleName::Owner) => Ok(Self::Owner),
            Some(RoleName::Member) => Ok(Self::Member),
            Some(RoleName::Viewer) => Ok(Self::Viewer),
            None => Err(unknown_role("policy", s)),
        }
    }
}

impl TryFrom<String> for Role {
    type Error = BastionError;

    fn try_from(value: String) -> Result<Self, Self::Error> {
        value.parse()
    }
}

impl From<WorkspaceRole> for Role {
    fn from(role: WorkspaceRole) -> Self {
        match role {
            WorkspaceRole::Owner => Self::Owner,
            WorkspaceRole::Member => Self::Member,
            WorkspaceRole::Viewer => Self::Viewer,
        }
    }
}

// ═══════════════════════════════════════════════════════════════════════════════
// Actions
// ═══════════════════════════════════════════════════════════════════════════════

/// How an action relates to the ownership tie-break.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ActionKind {
    Read,
    Create,
    Mutate,
}

/// Action identifiers evaluated against the policy matrix.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "lowercase", try_from = "String")]
pub enum Action {
    Read,
    Create,
    Update,
    Delete,
    Comment,
    Assign,
    Invite,
    Manage,
    Execute,
}

impl Action {
    pub const ALL: [Action; 9] = [
        Action::Read,
        Action::Create,
        Action::Update,
        Action::Delete,
        Action::Comment,
        Action::Assign,
        Action::Invite,
        Action::Manage,
        Action::Execute,
    ];

    pub fn kind(&self) -> ActionKind {
        match self {
            Self::Read => ActionKind::Read,
            Self::Create => ActionKind::Create,
            _ => ActionKind::Mutate,
        }
    }

    pub fn is_mutating(&self) -> bool {
        self.kind() == ActionKind::Mutate
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Read => "read",
            Self::Create => "create",
            Self::Update => "update",
            Self::Delete => "delete",
            Self::Comment => "comment",
            Self::Assign => "assign",
            Self::Invite => "invite",
            Self::Manage => "manage",
            Self::Execute => "execute",
        }
    }
}

impl fmt::Display for Action {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for Action {
    type Err = BastionError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let lowered = s.trim().to_ascii_lowercase();
        Self::ALL
            .into_iter()
            .find(|a| a.as_str() == lowered)
            .ok_or_else(|| BastionError::invalid_input(format!("Unknown action: {}", s)))
    }
}

impl TryFrom<String> for Action {
    type Error = BastionError;

    fn try_from(value: String) -> Result<Self, Self::Error> {
        value.parse()
    }
}

// ═══════════════════════════════════════════════════════════════════════════════
// Organizations, workspaces and memberships
// ═══════════════════════════════════════════════════════════════════════════════

/// A workspace inside an organization.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Workspace {
    pub id: WorkspaceId,
    pub organization_id: OrganizationId,
    pub name: String,
}

impl Workspace {
    pub fn new(
        id: impl Into<WorkspaceId>,
        organization_id: impl Into<OrganizationId>,
        name: impl Into<String>,
    ) -> Self {
        Self {
            id: id.into(),
            organization_id: organization_id.into(),
            name: name.into(),
        }
    }
}

/// Membership record linking a user to an organization.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct OrganizationMembership {
    pub user_id: UserId,
    pub organization_id: OrganizationId,
    pub role: OrganizationRole,
    #[serde(default = "Utc::now")]
    pub joined_at: DateTime<Utc>,
}

impl OrganizationMembership {
    pub fn new(
        user_id: impl Into<UserId>,
        organization_id: impl Into<OrganizationId>,
        role: OrganizationRole,
    ) -> Self {
        Self {
            user_id: user_id.into(),
            organization_id: organization_id.into(),
            role,
            joined_at: Utc::now(),
        }
    }
}

/// Membership record linking a user to a workspace.
///
/// `organization_id` must equal the workspace's own organization.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct WorkspaceMembership {
    pub user_id: UserId,
    pub workspace_id: WorkspaceId,
    pub organization_id: OrganizationId,
    pub role: WorkspaceRole,
    #[serde(default = "Utc::now")]
    pub joined_at: DateTime<Utc>,
}

impl WorkspaceMembership {
    pub fn new(
        user_id: impl Into<UserId>,
        workspace_id: impl Into<WorkspaceId>,
        organization_id: impl Into<OrganizationId>,
        role: WorkspaceRole,
    ) -> Self {
        Self {
            user_id: user_id.into(),
            workspace_id: workspace_id.into(),
            organization_id: organization_id.into(),
            role,
            joined_at: Utc::now(),
        }
    }

    pub fn is_owner(&self) -> bool {
        self.role == WorkspaceRole::Owner
    }
}

// ═══════════════════════════════════════════════════════════════════════════════
// Tests
// ═══════════════════════════════════════════════════════════════════════════════
