//! Shared fixtures for integration tests.
//!
//! Two organizations: `org-a` owns workspace `w1`, `org-b` owns `w2`.
//! `u1` owns `w1`, `u2` owns `w2`, `u3` is a member and `u4` a viewer of
//! `w1`, `u5` belongs to `org-a` without any workspace membership.

#![allow(dead_code)]

use std::sync::Arc;

use bastion_core::tenancy::{
    AccessService, EntityFixtures, EntityRegistry, InMemoryEntityStore, InMemoryMembershipStore,
    MembershipFixtures, OrganizationId, PlatformRole, PolicyMatrix, RoleResolver,
    ScopedAccessGuard, TenantContext, UserId, WorkspaceId,
};

pub const FIXTURES: &str = r#"
[[workspaces]]
id = "w1"
organization_id = "org-a"
name = "Alpha Launch"

[[workspaces]]
id = "w2"
organization_id = "org-b"
name = "Beta Research"

[[organization_memberships]]
user_id = "u1"
organization_id = "org-a"
role = "owner"

[[organization_memberships]]
user_id = "u3"
organization_id = "org-a"
role = "member"

[[organization_memberships]]
user_id = "u4"
organization_id = "org-a"
role = "member"

[[organization_memberships]]
user_id = "u5"
organization_id = "org-a"
role = "member"

[[organization_memberships]]
user_id = "u2"
organization_id = "org-b"
role = "owner"

[[workspace_memberships]]
user_id = "u1"
workspace_id = "w1"
organization_id = "org-a"
role = "workspace_owner"

[[workspace_memberships]]
user_id = "u3"
workspace_id = "w1"
organization_id = "org-a"
role = "workspace_member"

[[workspace_memberships]]
user_id = "u4"
workspace_id = "w1"
organization_id = "org-a"
role = "workspace_viewer"

[[workspace_memberships]]
user_id = "u2"
workspace_id = "w2"
organization_id = "org-b"
role = "workspace_owner"

[[entities]]
entity_type = "task"
id = "t1"
organization_id = "org-a"
workspace_id = "w1"
created_by = "u3"
attributes = { status = "done" }

[[entities]]
entity_type = "task"
id = "t2"
organization_id = "org-a"
workspace_id = "w1"
created_by = "u1"
attributes = { status = "open" }

[[entities]]
entity_type = "task"
id = "t9"
organization_id = "org-b"
workspace_id = "w2"
created_by = "u2"
attributes = { status = "done" }

[[entities]]
entity_type = "document"
id = "d1"
organization_id = "org-a"
workspace_id = "w1"
created_by = "u1"
"#;

pub fn membership_store() -> Arc<InMemoryMembershipStore> {
    let fixtures = MembershipFixtures::from_toml_str(FIXTURES).expect("membership fixtures");
    Arc::new(InMemoryMembershipStore::from_fixtures(fixtures))
}

pub fn entity_store() -> Arc<InMemoryEntityStore> {
    let fixtures = EntityFixtures::from_toml_str(FIXTURES).expect("entity fixtures");
    Arc::new(InMemoryEntityStore::from_fixtures(fixtures))
}

pub fn guard() -> ScopedAccessGuard {
    ScopedAccessGuard::new(Arc::new(EntityRegistry::standard()))
}

pub fn access_service(store: Arc<InMemoryMembershipStore>) -> AccessService {
    AccessService::new(
        RoleResolver::new(store),
        Arc::new(PolicyMatrix::default_matrix()),
        guard(),
    )
}

pub fn context(user: &str, organization: &str, workspace: Option<&str>) -> TenantContext {
    context_as(user, organization, workspace, PlatformRole::Member)
}

pub fn context_as(
    user: &str,
    organization: &str,
    workspace: Option<&str>,
    platform_role: PlatformRole,
) -> TenantContext {
    TenantContext::establish(
        UserId::new(user),
        Some(OrganizationId::new(organization)),
        workspace.map(WorkspaceId::new),
        platform_role,
    )
    .expect("valid context")
}
