//! Effective-role resolution.
//!
//! Combines the caller's platform role, organization membership and
//! workspace membership into a single [`Role`] for one workspace. Every
//! lookup is memoized for the rest of the request and any store failure
//! resolves to "no access".

use metrics::counter;
use parking_lot::Mutex;
use std::collections::HashMap;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::time::timeout;
use tracing::{debug, error, warn};

use super::context::TenantContext;
use super::decision::DecisionReason;
use super::membership::MembershipStore;
use super::models::{
    OrganizationId, OrganizationMembership, PlatformRole, Role, UserId, Workspace,
    WorkspaceId, WorkspaceMembership,
};
use crate::error::Result;
use crate::telemetry::BYPASS_ATTEMPTS_TOTAL;

/// Default bound on a single membership lookup.
pub const DEFAULT_LOOKUP_TIMEOUT: Duration = Duration::from_secs(2);

// ═══════════════════════════════════════════════════════════════════════════════
// Per-request memo
// ═══════════════════════════════════════════════════════════════════════════════

/// Membership lookups already performed by one request.
///
/// Owned by the request's [`TenantContext`] and dropped with it. Only
/// successful lookups are remembered. Locks are never held across `.await`.
#[derive(Debug, Default)]
pub struct MembershipMemo {
    workspaces: Mutex<HashMap<WorkspaceId, Option<Workspace>>>,
    organization_memberships: Mutex<HashMap<(UserId, OrganizationId), Option<OrganizationMembership>>>,
    workspace_memberships: Mutex<HashMap<(UserId, WorkspaceId), Option<WorkspaceMembership>>>,
    store_calls: AtomicUsize,
}

impl MembershipMemo {
    /// Number of store round-trips made on behalf of this request.
    pub fn store_calls(&self) -> usize {
        self.store_calls.load(Ordering::Relaxed)
    }

    fn count_call(&self) {
        self.store_calls.fetch_add(1, Ordering::Relaxed);
    }
}

// ═══════════════════════════════════════════════════════════════════════════════
// Resolution
// ═══════════════════════════════════════════════════════════════════════════════

/// Detailed outcome of resolving a caller's role in a workspace.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Resolution {
    /// The caller holds this effective role.
    Granted(Role),
    /// The caller has no access; the reason is for logs only.
    Denied(DecisionReason),
    /// The workspace does not exist in any organization.
    WorkspaceNotFound,
    /// A lookup failed or timed out.
    Unavailable,
}

impl Resolution {
    pub fn role(&self) -> Option<Role> {
        match self {
            Self::Granted(role) => Some(*role),
            _ => None,
        }
    }
}

// ═══════════════════════════════════════════════════════════════════════════════
// Resolver
// ═══════════════════════════════════════════════════════════════════════════════

/// Resolves effective roles against a membership store.
#[derive(Clone)]
pub struct RoleResolver {
    store: Arc<dyn MembershipStore>,
    lookup_timeout: Duration,
}

impl RoleResolver {
    pub fn new(store: Arc<dyn MembershipStore>) -> Self {
        Self {
            store,
            lookup_timeout: DEFAULT_LOOKUP_TIMEOUT,
        }
    }

    pub fn with_lookup_timeout(mut self, lookup_timeout: Duration) -> Self {
        self.lookup_timeout = lookup_timeout;
        self
    }

    /// The caller's effective role in `workspace_id`, or `None` for no access.
    pub async fn resolve(&self, ctx: &TenantContext, workspace_id: &WorkspaceId) -> Option<Role> {
        self.resolve_detailed(ctx, workspace_id).await.role()
    }

    /// Resolve with the reason behind a refusal.
    pub async fn resolve_detailed(
        &self,
        ctx: &TenantContext,
        workspace_id: &WorkspaceId,
    ) -> Resolution {
        match self.try_resolve(ctx, workspace_id).await {
            Ok(resolution) => resolution,
            Err(err) => {
                error!(
                    request_id = %ctx.request_id(),
                    user_id = %ctx.user_id(),
                    workspace_id = %workspace_id,
                    error = %err,
                    "Membership lookup failed; denying access"
                );
                Resolution::Unavailable
            }
        }
    }

    /// Whether the caller belongs to the context's organization.
    ///
    /// Platform admins always do. Lookup failures answer `false`.
    pub async fn is_organization_member(&self, ctx: &TenantContext) -> bool {
        if ctx.platform_role() == PlatformRole::Admin {
            return true;
        }
        match self
            .organization_membership(ctx, ctx.user_id(), ctx.organization_id())
            .await
        {
            Ok(found) => found.is_some(),
            Err(err) => {
                error!(
                    request_id = %ctx.request_id(),
                    user_id = %ctx.user_id(),
                    error = %err,
                    "Organization membership lookup failed; denying access"
                );
                false
            }
        }
    }

    async fn try_resolve(
        &self,
        ctx: &TenantContext,
        workspace_id: &WorkspaceId,
    ) -> Result<Resolution> {
        let Some(workspace) = self.workspace(ctx, workspace_id).await? else {
            return Ok(Resolution::WorkspaceNotFound);
        };

        // Platform roles never reach across organizations, admins included.
        if &workspace.organization_id != ctx.organization_id() {
            report_bypass_attempt(ctx, workspace_id, &workspace.organization_id, "workspace");
            return Ok(Resolution::Denied(DecisionReason::TenantMismatch));
        }

        if ctx.platform_role() == PlatformRole::Admin {
            debug!(
                request_id = %ctx.request_id(),
                user_id = %ctx.user_id(),
                workspace_id = %workspace_id,
                "Platform admin resolved to full access"
            );
            return Ok(Resolution::Granted(Role::Admin));
        }

        if self
            .organization_membership(ctx, ctx.user_id(), ctx.organization_id())
            .await?
            .is_none()
        {
            return Ok(Resolution::Denied(DecisionReason::NoMembership));
        }

        let Some(membership) = self
            .workspace_membership(ctx, ctx.user_id(), workspace_id)
            .await?
        else {
            return Ok(Resolution::Denied(DecisionReason::NoMembership));
        };

        if &membership.organization_id != ctx.organization_id() {
            report_bypass_attempt(ctx, workspace_id, &membership.organization_id, "membership");
            return Ok(Resolution::Denied(DecisionReason::TenantMismatch));
        }

        let mut role = Role::from(membership.role);
        if ctx.platform_role() == PlatformRole::Viewer {
            role = role.min(Role::Viewer);
        }
        Ok(Resolution::Granted(role))
    }

    // ─────────────────────────────────────────────────────────────────────────
    // Memoized lookups
    // ─────────────────────────────────────────────────────────────────────────

    async fn workspace(
        &self,
        ctx: &TenantContext,
        workspace_id: &WorkspaceId,
    ) -> Result<Option<Workspace>> {
        let memo = ctx.memo();
        if let Some(hit) = memo.workspaces.lock().get(workspace_id) {
            return Ok(hit.clone());
        }

        memo.count_call();
        let found = timeout(self.lookup_timeout, self.store.workspace(workspace_id)).await??;
        memo.workspaces
            .lock()
            .insert(workspace_id.clone(), found.clone());
        Ok(found)
    }

    async fn organization_membership(
        &self,
        ctx: &TenantContext,
        user_id: &UserId,
        organization_id: &OrganizationId,
    ) -> Result<Option<OrganizationMembership>> {
        let memo = ctx.memo();
        let key = (user_id.clone(), organization_id.clone());
        if let Some(hit) = memo.organization_memberships.lock().get(&key) {
            return Ok(hit.clone());
        }

        memo.count_call();
        let found = timeout(
            self.lookup_timeout,
            self.store.organization_membership(user_id, organization_id),
        )
        .await??;
        memo.organization_memberships
            .lock()
            .insert(key, found.clone());
        Ok(found)
    }

    async fn workspace_membership(
        &self,
        ctx: &TenantContext,
        user_id: &UserId,
        workspace_id: &WorkspaceId,
    ) -> Result<Option<WorkspaceMembership>> {
        let memo = ctx.memo();
        let key = (user_id.clone(), workspace_id.clone());
        if let Some(hit) = memo.workspace_memberships.lock().get(&key) {
            return Ok(hit.clone());
        }

        memo.count_call();
        let found = timeout(
            self.lookup_timeout,
            self.store.workspace_membership(user_id, workspace_id),
        )
        .await??;
        memo.workspace_memberships
            .lock()
            .insert(key, found.clone());
        Ok(found)
    }
}

fn report_bypass_attempt(
    ctx: &TenantContext,
    workspace_id: &WorkspaceId,
    foreign_org: &OrganizationId,
    via: &'static str,
) {
    warn!(
        request_id = %ctx.request_id(),
        user_id = %ctx.user_id(),
        caller_org = %ctx.organization_id(),
        target_org = %foreign_org,
        workspace_id = %workspace_id,
        via = via,
        "Potential cross-tenant bypass attempt"
    );
    counter!(BYPASS_ATTEMPTS_TOTAL, "via" => via).increment(1);
}

// ═══════════════════════════════════════════════════════════════════════════════
// Tests
// ═══════════════════════════════════════════════════════════════════════════════
