//! Immutable per-request tenant context.
//!
//! A [`TenantContext`] is established once per request from the verified
//! identity and then either passed explicitly down the call chain or
//! installed in a task-local slot with [`TenantContext::scope`]. There is no
//! process-wide "current tenant"; code running outside a scope that asks for
//! the context gets [`ErrorCode::MissingContext`](crate::error::ErrorCode).

use chrono::{DateTime, Utc};
use std::fmt;
use std::future::Future;
use std::sync::Arc;
use tracing::error;

use super::models::{OrganizationId, PlatformRole, RequestId, UserId, WorkspaceId};
use super::resolver::MembershipMemo;
use crate::error::{BastionError, Result};

tokio::task_local! {
    static CURRENT_TENANT: TenantContext;
}

/// Caller and tenant identity for exactly one in-flight request.
///
/// All fields are private and there are no setters. Clones refer to the same
/// request and share its membership memo.
#[derive(Clone)]
pub struct TenantContext {
    inner: Arc<ContextInner>,
}

struct ContextInner {
    request_id: RequestId,
    user_id: UserId,
    organization_id: OrganizationId,
    workspace_id: Option<WorkspaceId>,
    platform_role: PlatformRole,
    established_at: DateTime<Utc>,
    memo: Arc<MembershipMemo>,
}

impl TenantContext {
    /// Establish the context for a new request.
    ///
    /// Fails with `InvalidContext` when the organization is absent or blank,
    /// or the user id is blank.
    pub fn establish(
        user_id: UserId,
        organization_id: Option<OrganizationId>,
        workspace_id: Option<WorkspaceId>,
        platform_role: PlatformRole,
    ) -> Result<Self> {
        if user_id.as_str().trim().is_empty() {
            return Err(BastionError::invalid_context("A user identity is required"));
        }

        let organization_id = match organization_id {
            Some(org) if !org.as_str().trim().is_empty() => org,
            _ => {
                return Err(BastionError::invalid_context(
                    "An organization is required to establish a tenant context",
                ))
            }
        };

        let workspace_id = workspace_id.filter(|ws| !ws.as_str().trim().is_empty());

        Ok(Self {
            inner: Arc::new(ContextInner {
                request_id: RequestId::new(),
                user_id,
                organization_id,
                workspace_id,
                platform_role,
                established_at: Utc::now(),
                memo: Arc::new(MembershipMemo::default()),
            }),
        })
    }

    /// Return a context for the same request targeting `workspace_id`.
    ///
    /// The request id and membership memo carry over; `self` is unchanged.
    pub fn with_workspace(&self, workspace_id: WorkspaceId) -> Self {
        let inner = &self.inner;
        Self {
            inner: Arc::new(ContextInner {
                request_id: inner.request_id,
                user_id: inner.user_id.clone(),
                organization_id: inner.organization_id.clone(),
                workspace_id: Some(workspace_id),
                platform_role: inner.platform_role,
                established_at: inner.established_at,
                memo: inner.memo.clone(),
            }),
        }
    }

    /// Require an explicitly threaded context.
    pub fn require(ctx: Option<&TenantContext>) -> Result<TenantContext> {
        ctx.cloned().ok_or_else(|| {
            error!("Data operation reached the access layer without a tenant context");
            BastionError::missing_context("no context was threaded to this call")
        })
    }

    /// The context installed for the current task by [`TenantContext::scope`].
    pub fn current() -> Result<TenantContext> {
        CURRENT_TENANT.try_with(|ctx| ctx.clone()).map_err(|_| {
            error!("No tenant context installed for the current task");
            BastionError::missing_context("no context installed for the current task")
        })
    }

    /// Run `fut` with this context installed as the task's current context.
    ///
    /// The slot is visible only to `fut`; other tasks, including tasks spawned
    /// from inside it, see their own context or none.
    pub async fn scope<F>(self, fut: F) -> F::Output
    where
        F: Future,
    {
        CURRENT_TENANT.scope(self, fut).await
    }

    /// Synchronous variant of [`TenantContext::scope`].
    pub fn sync_scope<F, R>(self, f: F) -> R
    where
        F: FnOnce() -> R,
    {
        CURRENT_TENANT.sync_scope(self, f)
    }

    // ─────────────────────────────────────────────────────────────────────────
    // Accessors
    // ─────────────────────────────────────────────────────────────────────────

    pub fn request_id(&self) -> RequestId {
        self.inner.request_id
    }

    pub fn user_id(&self) -> &UserId {
        &self.inner.user_id
    }

    pub fn organization_id(&self) -> &OrganizationId {
        &self.inner.organization_id
    }

    pub fn workspace_id(&self) -> Option<&WorkspaceId> {
        self.inner.workspace_id.as_ref()
    }

    pub fn platform_role(&self) -> PlatformRole {
        self.inner.platform_role
    }

    pub fn established_at(&self) -> DateTime<Utc> {
        self.inner.established_at
    }

    pub fn is_platform_admin(&self) -> bool {
        self.inner.platform_role == PlatformRole::Admin
    }

    /// Membership store round-trips made so far by this request.
    pub fn membership_lookups(&self) -> usize {
        self.inner.memo.store_calls()
    }

    pub(crate) fn memo(&self) -> &MembershipMemo {
        &self.inner.memo
    }
}

impl PartialEq for TenantContext {
    fn eq(&self, other: &Self) -> bool {
        let (a, b) = (&self.inner, &other.inner);
        a.request_id == b.request_id
            && a.user_id == b.user_id
            && a.organization_id == b.organization_id
            && a.workspace_id == b.workspace_id
            && a.platform_role == b.platform_role
    }
}

impl Eq for TenantContext {}

impl fmt::Debug for TenantContext {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("TenantContext")
            .field("request_id", &self.inner.request_id)
            .field("user_id", &self.inner.user_id)
            .field("organization_id", &self.inner.organization_id)
            .field("workspace_id", &self.inner.workspace_id)
            .field("platform_role", &self.inner.platform_role)
            .finish()
    }
}

// ═══════════════════════════════════════════════════════════════════════════════
// Tests
// ═══════════════════════════════════════════════════════════════════════════════

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::ErrorCode;

    fn ctx(org: &str) -> TenantContext {
        TenantContext::establish(
            UserId::new("alice"),
            Some(OrganizationId::new(org)),
            None,
            PlatformRole::Member,
        )
        .unwrap()
    }

    #[test]
    fn test_establish_requires_organization() {
        let err = TenantContext::establish(UserId::new("alice"), None, None, PlatformRole::Member)
            .unwrap_err();
        assert_eq!(err.code(), ErrorCode::InvalidContext);

        let blank = TenantContext::establish(
            UserId::new("alice"),
            Some(OrganizationId::new("  ")),
            None,
            PlatformRole::Member,
        );
        assert!(blank.is_err());
    }

    #[test]
    fn test_establish_requires_user() {
        let err = TenantContext::establish(
            UserId::new(""),
            Some(OrganizationId::new("org-a")),
            None,
            PlatformRole::Member,
        )
        .unwrap_err();
        assert_eq!(err.code(), ErrorCode::InvalidContext);
    }

    #[test]
    fn test_each_establish_is_a_new_request() {
        assert_ne!(ctx("org-a").request_id(), ctx("org-a").request_id());
    }

    #[test]
    fn test_with_workspace_leaves_original_untouched() {
        let base = ctx("org-a");
        let scoped = base.with_workspace(WorkspaceId::new("w1"));

        assert!(base.workspace_id().is_none());
        assert_eq!(scoped.workspace_id().unwrap().as_str(), "w1");
        assert_eq!(scoped.request_id(), base.request_id());
        assert_eq!(scoped.organization_id(), base.organization_id());
    }

    #[test]
    fn test_require_without_context() {
        let err = TenantContext::require(None).unwrap_err();
        assert_eq!(err.code(), ErrorCode::MissingContext);
        assert!(TenantContext::require(Some(&ctx("org-a"))).is_ok());
    }

    #[test]
    fn test_current_outside_scope_is_missing() {
        let err = TenantContext::current().unwrap_err();
        assert_eq!(err.code(), ErrorCode::MissingContext);
    }

    #[test]
    fn test_sync_scope_installs_context() {
        let org = ctx("org-a")
            .sync_scope(|| TenantContext::current().map(|c| c.organization_id().clone()))
            .unwrap();
        assert_eq!(org.as_str(), "org-a");
        assert!(TenantContext::current().is_err());
    }

    #[tokio::test]
    async fn test_scope_is_not_visible_to_spawned_tasks() {
        let seen_inside = ctx("org-a")
            .scope(async {
                let own = TenantContext::current().is_ok();
                let spawned = tokio::spawn(async { TenantContext::current().is_ok() })
                    .await
                    .unwrap();
                (own, spawned)
            })
            .await;

        assert_eq!(seen_inside, (true, false));
    }
}
