//! Membership store contract and serialized membership mutations.
//!
//! The access core only reads memberships on the decision path. Writes go
//! through [`MembershipService`], which runs every check-then-write for a
//! workspace under that workspace's lock so two concurrent removals cannot
//! both observe "two owners left".

use async_trait::async_trait;
use dashmap::DashMap;
use serde::Deserialize;
use std::path::Path;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use thiserror::Error;
use tokio::sync::{Mutex, OwnedMutexGuard};
use tracing::{debug, info, warn};

use super::context::TenantContext;
use super::models::{
    OrganizationId, OrganizationMembership, UserId, Workspace, WorkspaceId,
    WorkspaceMembership, WorkspaceRole,
};
use crate::error::{BastionError, Result};

// ═══════════════════════════════════════════════════════════════════════════════
// Store errors
// ═══════════════════════════════════════════════════════════════════════════════

/// Errors reported by backing stores (membership, entity, audit).
#[derive(Debug, Error)]
pub enum StoreError {
    #[error("store unavailable: {0}")]
    Unavailable(String),

    #[error("store operation failed: {0}")]
    Backend(String),
}

pub type StoreResult<T> = std::result::Result<T, StoreError>;

impl From<StoreError> for BastionError {
    fn from(error: StoreError) -> Self {
        let message = error.to_string();
        BastionError::service_unavailable("store", message).with_source(error)
    }
}

// ═══════════════════════════════════════════════════════════════════════════════
// Store contract
// ═══════════════════════════════════════════════════════════════════════════════

/// Read/write contract of the membership store.
///
/// Implementations must give read-your-writes consistency per workspace so the
/// "at least one owner" check in [`MembershipService`] sees committed state.
#[async_trait]
pub trait MembershipStore: Send + Sync {
    async fn workspace(&self, id: &WorkspaceId) -> StoreResult<Option<Workspace>>;

    async fn organization_membership(
        &self,
        user_id: &UserId,
        organization_id: &OrganizationId,
    ) -> StoreResult<Option<OrganizationMembership>>;

    async fn workspace_membership(
        &self,
        user_id: &UserId,
        workspace_id: &WorkspaceId,
    ) -> StoreResult<Option<WorkspaceMembership>>;

    async fn workspace_members(
        &self,
        workspace_id: &WorkspaceId,
    ) -> StoreResult<Vec<WorkspaceMembership>>;

    async fn put_workspace(&self, workspace: Workspace) -> StoreResult<()>;

    async fn put_organization_membership(
        &self,
        membership: OrganizationMembership,
    ) -> StoreResult<()>;

    async fn put_workspace_membership(&self, membership: WorkspaceMembership) -> StoreResult<()>;

    async fn delete_workspace_membership(
        &self,
        user_id: &UserId,
        workspace_id: &WorkspaceId,
    ) -> StoreResult<bool>;
}

// ═══════════════════════════════════════════════════════════════════════════════
// In-memory store
// ═══════════════════════════════════════════════════════════════════════════════

/// In-memory membership store used by the server binary, the CLI and tests.
#[derive(Debug, Default)]
pub struct InMemoryMembershipStore {
    workspaces: DashMap<WorkspaceId, Workspace>,
    organization_memberships: DashMap<(UserId, OrganizationId), OrganizationMembership>,
    workspace_memberships: DashMap<(UserId, WorkspaceId), WorkspaceMembership>,
    unavailable: AtomicBool,
}

impl InMemoryMembershipStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// Build a store pre-populated from fixtures.
    pub fn from_fixtures(fixtures: MembershipFixtures) -> Self {
        let store = Self::new();
        for ws in fixtures.workspaces {
            store.workspaces.insert(ws.id.clone(), ws);
        }
        for m in fixtures.organization_memberships {
            store
                .organization_memberships
                .insert((m.user_id.clone(), m.organization_id.clone()), m);
        }
        for m in fixtures.workspace_memberships {
            store
                .workspace_memberships
                .insert((m.user_id.clone(), m.workspace_id.clone()), m);
        }
        store
    }

    /// Simulate an outage: every call fails with `StoreError::Unavailable`.
    pub fn set_available(&self, available: bool) {
        self.unavailable.store(!available, Ordering::SeqCst);
    }

    async fn io(&self) -> StoreResult<()> {
        // Yield like a network round-trip would, so concurrent callers interleave.
        tokio::task::yield_now().await;
        if self.unavailable.load(Ordering::SeqCst) {
            return Err(StoreError::Unavailable("membership store offline".into()));
        }
        Ok(())
    }
}

#[async_trait]
impl MembershipStore for InMemoryMembershipStore {
    async fn workspace(&self, id: &WorkspaceId) -> StoreResult<Option<Workspace>> {
        self.io().await?;
        Ok(self.workspaces.get(id).map(|w| w.clone()))
    }

    async fn organization_membership(
        &self,
        user_id: &UserId,
        organization_id: &OrganizationId,
    ) -> StoreResult<Option<OrganizationMembership>> {
        self.io().await?;
        let key = (user_id.clone(), organization_id.clone());
        Ok(self.organization_memberships.get(&key).map(|m| m.clone()))
    }

    async fn workspace_membership(
        &self,
        user_id: &UserId,
        workspace_id: &WorkspaceId,
    ) -> StoreResult<Option<WorkspaceMembership>> {
        self.io().await?;
        let key = (user_id.clone(), workspace_id.clone());
        Ok(self.workspace_memberships.get(&key).map(|m| m.clone()))
    }

    async fn workspace_members(
        &self,
        workspace_id: &WorkspaceId,
    ) -> StoreResult<Vec<WorkspaceMembership>> {
        self.io().await?;
        Ok(self
            .workspace_memberships
            .iter()
            .filter(|entry| &entry.workspace_id == workspace_id)
            .map(|entry| entry.value().clone())
            .collect())
    }

    async fn put_workspace(&self, workspace: Workspace) -> StoreResult<()> {
        self.io().await?;
        self.workspaces.insert(workspace.id.clone(), workspace);
        Ok(())
    }

    async fn put_organization_membership(
        &self,
        membership: OrganizationMembership,
    ) -> StoreResult<()> {
        self.io().await?;
        let key = (membership.user_id.clone(), membership.organization_id.clone());
        self.organization_memberships.insert(key, membership);
        Ok(())
    }

    async fn put_workspace_membership(&self, membership: WorkspaceMembership) -> StoreResult<()> {
        self.io().await?;
        let key = (membership.user_id.clone(), membership.workspace_id.clone());
        self.workspace_memberships.insert(key, membership);
        Ok(())
    }

    async fn delete_workspace_membership(
        &self,
        user_id: &UserId,
        workspace_id: &WorkspaceId,
    ) -> StoreResult<bool> {
        self.io().await?;
        let key = (user_id.clone(), workspace_id.clone());
        Ok(self.workspace_memberships.remove(&key).is_some())
    }
}

// ═══════════════════════════════════════════════════════════════════════════════
// Fixtures
// ═══════════════════════════════════════════════════════════════════════════════

/// Seed data for the in-memory store, loadable from TOML.
///
/// ```toml
/// [[workspaces]]
/// id = "w1"
/// organization_id = "org-a"
/// name = "Design"
///
/// [[organization_memberships]]
/// user_id = "u1"
/// organization_id = "org-a"
/// role = "member"
///
/// [[workspace_memberships]]
/// user_id = "u1"
/// workspace_id = "w1"
/// organization_id = "org-a"
/// role = "workspace_owner"
/// ```
#[derive(Debug, Clone, Default, Deserialize)]
pub struct MembershipFixtures {
    #[serde(default)]
    pub workspaces: Vec<Workspace>,
    #[serde(default)]
    pub organization_memberships: Vec<OrganizationMembership>,
    #[serde(default)]
    pub workspace_memberships: Vec<WorkspaceMembership>,
}

impl MembershipFixtures {
    pub fn from_toml_str(s: &str) -> Result<Self> {
        let fixtures: Self = toml::from_str(s)?;
        fixtures.validate()?;
        Ok(fixtures)
    }

    pub fn from_file(path: impl AsRef<Path>) -> Result<Self> {
        let raw = std::fs::read_to_string(path.as_ref())?;
        Self::from_toml_str(&raw)
    }

    /// Reject fixtures that would seed a cross-tenant membership.
    fn validate(&self) -> Result<()> {
        for m in &self.workspace_memberships {
            let Some(ws) = self.workspaces.iter().find(|w| w.id == m.workspace_id) else {
                return Err(BastionError::configuration(format!(
                    "membership of {} references unknown workspace {}",
                    m.user_id, m.workspace_id
                )));
            };
            if ws.organization_id != m.organization_id {
                return Err(BastionError::configuration(format!(
                    "membership of {} in {} names organization {} but the workspace belongs to {}",
                    m.user_id, m.workspace_id, m.organization_id, ws.organization_id
                )));
            }
        }
        Ok(())
    }
}

// ═══════════════════════════════════════════════════════════════════════════════
// Membership service
// ═══════════════════════════════════════════════════════════════════════════════

/// Held for the duration of one membership mutation.
///
/// On release the workspace's entry is evicted unless another task still
/// holds or waits on the same mutex.
struct WorkspaceLock<'a> {
    locks: &'a DashMap<WorkspaceId, Arc<Mutex<()>>>,
    workspace_id: WorkspaceId,
    guard: Option<OwnedMutexGuard<()>>,
}

impl Drop for WorkspaceLock<'_> {
    fn drop(&mut self) {
        drop(self.guard.take());
        self.locks
            .remove_if(&self.workspace_id, |_, lock| Arc::strong_count(lock) == 1);
    }
}

/// Serialized membership mutations.
///
/// Callers authorize the change through the decision API first; this service
/// enforces the data invariants.
pub struct MembershipService {
    store: Arc<dyn MembershipStore>,
    locks: DashMap<WorkspaceId, Arc<Mutex<()>>>,
}

impl MembershipService {
    pub fn new(store: Arc<dyn MembershipStore>) -> Self {
        Self {
            store,
            locks: DashMap::new(),
        }
    }

    async fn lock_workspace(&self, workspace_id: &WorkspaceId) -> WorkspaceLock<'_> {
        let lock = self.locks.entry(workspace_id.clone()).or_default().clone();
        WorkspaceLock {
            locks: &self.locks,
            workspace_id: workspace_id.clone(),
            guard: Some(lock.lock_owned().await),
        }
    }

    /// Number of workspaces with a mutation in flight or queued.
    pub fn active_locks(&self) -> usize {
        self.locks.len()
    }

    /// Load the workspace and check it belongs to the caller's organization.
    async fn tenant_workspace(
        &self,
        ctx: &TenantContext,
        workspace_id: &WorkspaceId,
    ) -> Result<Workspace> {
        let workspace = self
            .store
            .workspace(workspace_id)
            .await?
            .ok_or_else(|| BastionError::not_found("workspace", workspace_id.as_str()))?;

        if &workspace.organization_id != ctx.organization_id() {
            warn!(
                request_id = %ctx.request_id(),
                user_id = %ctx.user_id(),
                caller_org = %ctx.organization_id(),
                workspace_id = %workspace_id,
                "Membership change targeted a workspace of another organization"
            );
            return Err(BastionError::forbidden(format!(
                "workspace {} is outside organization {}",
                workspace_id,
                ctx.organization_id()
            )));
        }
        Ok(workspace)
    }

    /// Add `user_id` to a workspace of the caller's organization.
    ///
    /// The membership's organization is taken from the workspace itself, and
    /// the user must already belong to that organization.
    pub async fn add_member(
        &self,
        ctx: &TenantContext,
        user_id: &UserId,
        workspace_id: &WorkspaceId,
        role: WorkspaceRole,
    ) -> Result<WorkspaceMembership> {
        let _guard = self.lock_workspace(workspace_id).await;
        let workspace = self.tenant_workspace(ctx, workspace_id).await?;

        if self
            .store
            .organization_membership(user_id, &workspace.organization_id)
            .await?
            .is_none()
        {
            return Err(BastionError::forbidden(format!(
                "user {} is not a member of organization {}",
                user_id, workspace.organization_id
            )));
        }

        if self
            .store
            .workspace_membership(user_id, workspace_id)
            .await?
            .is_some()
        {
            return Err(BastionError::invalid_input(format!(
                "User {} is already a member of this workspace",
                user_id
            )));
        }

        let membership = WorkspaceMembership::new(
            user_id.clone(),
            workspace_id.clone(),
            workspace.organization_id.clone(),
            role,
        );
        self.store.put_workspace_membership(membership.clone()).await?;

        info!(
            request_id = %ctx.request_id(),
            actor = %ctx.user_id(),
            user_id = %user_id,
            workspace_id = %workspace_id,
            role = ?role,
            "Workspace member added"
        );
        Ok(membership)
    }

    /// Change a member's role. Demoting the last owner is rejected.
    pub async fn change_role(
        &self,
        ctx: &TenantContext,
        user_id: &UserId,
        workspace_id: &WorkspaceId,
        role: WorkspaceRole,
    ) -> Result<WorkspaceMembership> {
        let _guard = self.lock_workspace(workspace_id).await;
        self.tenant_workspace(ctx, workspace_id).await?;

        let mut membership = self
            .store
            .workspace_membership(user_id, workspace_id)
            .await?
            .ok_or_else(|| BastionError::not_found("workspace_membership", user_id.as_str()))?;

        if membership.is_owner() && role != WorkspaceRole::Owner {
            self.ensure_another_owner(workspace_id, user_id).await?;
        }

        membership.role = role;
        self.store.put_workspace_membership(membership.clone()).await?;

        info!(
            request_id = %ctx.request_id(),
            actor = %ctx.user_id(),
            user_id = %user_id,
            workspace_id = %workspace_id,
            role = ?role,
            "Workspace member role changed"
        );
        Ok(membership)
    }

    /// Remove a member. Removing the last owner is rejected.
    pub async fn remove_member(
        &self,
        ctx: &TenantContext,
        user_id: &UserId,
        workspace_id: &WorkspaceId,
    ) -> Result<()> {
        let _guard = self.lock_workspace(workspace_id).await;
        self.tenant_workspace(ctx, workspace_id).await?;

        let membership = self
            .store
            .workspace_membership(user_id, workspace_id)
            .await?
            .ok_or_else(|| BastionError::not_found("workspace_membership", user_id.as_str()))?;

        if membership.is_owner() {
            self.ensure_another_owner(workspace_id, user_id).await?;
        }

        self.store
            .delete_workspace_membership(user_id, workspace_id)
            .await?;

        info!(
            request_id = %ctx.request_id(),
            actor = %ctx.user_id(),
            user_id = %user_id,
            workspace_id = %workspace_id,
            "Workspace member removed"
        );
        Ok(())
    }

    async fn ensure_another_owner(
        &self,
        workspace_id: &WorkspaceId,
        leaving: &UserId,
    ) -> Result<()> {
        let remaining = self
            .store
            .workspace_members(workspace_id)
            .await?
            .into_iter()
            .filter(|m| m.is_owner() && &m.user_id != leaving)
            .count();

        if remaining == 0 {
            debug!(workspace_id = %workspace_id, "Rejected change that would leave no owner");
            return Err(BastionError::last_owner(workspace_id.as_str()));
        }
        Ok(())
    }
}

// ═══════════════════════════════════════════════════════════════════════════════
// Tests
// ═══════════════════════════════════════════════════════════════════════════════

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::ErrorCode;
    use crate::tenancy::models::{OrganizationRole, PlatformRole};

    fn ctx(user: &str, org: &str) -> TenantContext {
        TenantContext::establish(
            UserId::new(user),
            Some(OrganizationId::new(org)),
            None,
            PlatformRole::Member,
        )
        .unwrap()
    }

    async fn seeded() -> (Arc<InMemoryMembershipStore>, MembershipService) {
        let store = Arc::new(InMemoryMembershipStore::new());
        store
            .put_workspace(Workspace::new("w1", "org-a", "Design"))
            .await
            .unwrap();
        store
            .put_workspace(Workspace::new("w2", "org-b", "Finance"))
            .await
            .unwrap();
        for user in ["alice", "bob"] {
            store
                .put_organization_membership(OrganizationMembership::new(
                    user,
                    "org-a",
                    OrganizationRole::Member,
                ))
                .await
                .unwrap();
        }
        store
            .put_workspace_membership(WorkspaceMembership::new(
                "alice",
                "w1",
                "org-a",
                WorkspaceRole::Owner,
            ))
            .await
            .unwrap();
        let service = MembershipService::new(store.clone());
        (store, service)
    }

    #[tokio::test]
    async fn test_add_member_takes_workspace_organization() {
        let (_, service) = seeded().await;
        let m = service
            .add_member(
                &ctx("alice", "org-a"),
                &UserId::new("bob"),
                &WorkspaceId::new("w1"),
                WorkspaceRole::Member,
            )
            .await
            .unwrap();
        assert_eq!(m.organization_id.as_str(), "org-a");
    }

    #[tokio::test]
    async fn test_add_member_rejects_cross_tenant_workspace() {
        let (_, service) = seeded().await;
        let err = service
            .add_member(
                &ctx("alice", "org-a"),
                &UserId::new("bob"),
                &WorkspaceId::new("w2"),
                WorkspaceRole::Member,
            )
            .await
            .unwrap_err();
        assert_eq!(err.code(), ErrorCode::Forbidden);
    }

    #[tokio::test]
    async fn test_add_member_requires_organization_membership() {
        let (_, service) = seeded().await;
        let err = service
            .add_member(
                &ctx("alice", "org-a"),
                &UserId::new("mallory"),
                &WorkspaceId::new("w1"),
                WorkspaceRole::Viewer,
            )
            .await
            .unwrap_err();
        assert_eq!(err.code(), ErrorCode::Forbidden);
    }

    #[tokio::test]
    async fn test_sole_owner_cannot_be_demoted_or_removed() {
        let (_, service) = seeded().await;
        let caller = ctx("alice", "org-a");
        let alice = UserId::new("alice");
        let w1 = WorkspaceId::new("w1");

        let err = service
            .change_role(&caller, &alice, &w1, WorkspaceRole::Member)
            .await
            .unwrap_err();
        assert_eq!(err.code(), ErrorCode::LastOwner);

        let err = service.remove_member(&caller, &alice, &w1).await.unwrap_err();
        assert_eq!(err.code(), ErrorCode::LastOwner);
    }

    #[tokio::test]
    async fn test_owner_can_leave_when_another_owner_exists() {
        let (store, service) = seeded().await;
        let caller = ctx("alice", "org-a");
        let w1 = WorkspaceId::new("w1");

        service
            .add_member(&caller, &UserId::new("bob"), &w1, WorkspaceRole::Owner)
            .await
            .unwrap();
        service
            .remove_member(&caller, &UserId::new("alice"), &w1)
            .await
            .unwrap();

        let owners: Vec<_> = store
            .workspace_members(&w1)
            .await
            .unwrap()
            .into_iter()
            .filter(|m| m.is_owner())
            .collect();
        assert_eq!(owners.len(), 1);
        assert_eq!(owners[0].user_id.as_str(), "bob");
    }

    #[tokio::test]
    async fn test_workspace_locks_are_released() {
        let (_, service) = seeded().await;
        let caller = ctx("alice", "org-a");

        service
            .add_member(&caller, &UserId::new("bob"), &WorkspaceId::new("w1"), WorkspaceRole::Member)
            .await
            .unwrap();
        let _ = service
            .remove_member(&caller, &UserId::new("alice"), &WorkspaceId::new("w1"))
            .await;
        let _ = service
            .add_member(&caller, &UserId::new("bob"), &WorkspaceId::new("w2"), WorkspaceRole::Member)
            .await;

        assert_eq!(service.active_locks(), 0);
    }

    #[tokio::test]
    async fn test_unavailable_store_surfaces_service_unavailable() {
        let (store, service) = seeded().await;
        store.set_available(false);
        let err = service
            .remove_member(&ctx("alice", "org-a"), &UserId::new("alice"), &WorkspaceId::new("w1"))
            .await
            .unwrap_err();
        assert_eq!(err.code(), ErrorCode::ServiceUnavailable);
    }

    #[test]
    fn test_fixtures_reject_cross_tenant_membership() {
        let raw = r#"
            [[workspaces]]
            id = "w1"
            organization_id = "org-a"
            name = "Design"

            [[workspace_memberships]]
            user_id = "u1"
            workspace_id = "w1"
            organization_id = "org-b"
            role = "owner"
        "#;
        let err = MembershipFixtures::from_toml_str(raw).unwrap_err();
        assert_eq!(err.code(), ErrorCode::ConfigurationError);
    }

    #[test]
    fn test_fixtures_normalize_role_names() {
        let raw = r#"
            [[workspaces]]
            id = "w1"
            organization_id = "org-a"
            name = "Design"

            [[workspace_memberships]]
            user_id = "u1"
            workspace_id = "w1"
            organization_id = "org-a"
            role = "WORKSPACE_OWNER"
        "#;
        let fixtures = MembershipFixtures::from_toml_str(raw).unwrap();
        assert_eq!(fixtures.workspace_memberships[0].role, WorkspaceRole::Owner);
    }
}
