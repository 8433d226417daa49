//! Access decisions and the Decision API.
//!
//! [`AccessService`] ties the pieces together: resolve the caller's effective
//! role, evaluate the policy matrix, and scope entity reads through the guard.
//! Every denial carries a [`DecisionReason`] for logs and metrics, but callers
//! only ever see the uniform `Forbidden` error produced by
//! [`AccessDecision::into_result`].

use metrics::counter;
use serde::Serialize;
use std::fmt;
use std::sync::Arc;
use tracing::{debug, warn};

use super::context::TenantContext;
use super::guard::{EntityRecord, EntityStore, Query, ScopedAccessGuard, TenantScope};
use super::models::{Action, EntityId, Role, WorkspaceId};
use super::policy::{EntityOwnership, PolicyMatrix, RouteContext};
use super::resolver::{Resolution, RoleResolver};
use super::route::normalize_route_with_ids;
use crate::error::{BastionError, ErrorCode, Result};
use crate::telemetry::DECISIONS_TOTAL;

// ═══════════════════════════════════════════════════════════════════════════════
// Decision types
// ═══════════════════════════════════════════════════════════════════════════════

/// Why a decision came out the way it did. Internal only.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum DecisionReason {
    Granted,
    TenantMismatch,
    NoMembership,
    InsufficientRole,
    NotOwner,
    NoMatchingRule { role: Role, route: String },
    WorkspaceNotFound,
    StoreUnavailable,
}

impl DecisionReason {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Granted => "granted",
            Self::TenantMismatch => "tenant_mismatch",
            Self::NoMembership => "no_membership",
            Self::InsufficientRole => "insufficient_role",
            Self::NotOwner => "not_owner",
            Self::NoMatchingRule { .. } => "no_matching_rule",
            Self::WorkspaceNotFound => "workspace_not_found",
            Self::StoreUnavailable => "store_unavailable",
        }
    }
}

impl fmt::Display for DecisionReason {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::NoMatchingRule { role, route } => {
                write!(f, "no_matching_rule(role={}, route={})", role, route)
            }
            other => f.write_str(other.as_str()),
        }
    }
}

/// Outcome of one access check. Never persisted.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct AccessDecision {
    pub allowed: bool,
    pub reason: DecisionReason,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub required_role: Option<Role>,
}

impl AccessDecision {
    pub fn allow() -> Self {
        Self {
            allowed: true,
            reason: DecisionReason::Granted,
            required_role: None,
        }
    }

    pub fn deny(reason: DecisionReason, required_role: Option<Role>) -> Self {
        Self {
            allowed: false,
            reason,
            required_role,
        }
    }

    /// Map to the caller-facing result.
    ///
    /// Every access refusal becomes the same `Forbidden` error; only a
    /// workspace missing from every tenant is `NotFound`.
    pub fn into_result(self) -> Result<()> {
        if self.allowed {
            Ok(())
        } else {
            Err(self.into_error())
        }
    }

    /// The error this decision's reason maps to, regardless of `allowed`.
    pub fn into_error(self) -> BastionError {
        match self.reason {
            DecisionReason::WorkspaceNotFound => {
                BastionError::new(ErrorCode::NotFound, "Workspace not found")
            }
            DecisionReason::StoreUnavailable => BastionError::service_unavailable(
                "membership_store",
                "membership lookup failed during access evaluation",
            ),
            reason => BastionError::forbidden(reason.to_string()),
        }
    }
}

// ═══════════════════════════════════════════════════════════════════════════════
// Decision API
// ═══════════════════════════════════════════════════════════════════════════════

/// Entry point for access checks.
#[derive(Clone)]
pub struct AccessService {
    resolver: RoleResolver,
    policy: Arc<PolicyMatrix>,
    guard: ScopedAccessGuard,
}

impl AccessService {
    pub fn new(resolver: RoleResolver, policy: Arc<PolicyMatrix>, guard: ScopedAccessGuard) -> Self {
        Self {
            resolver,
            policy,
            guard,
        }
    }

    pub fn resolver(&self) -> &RoleResolver {
        &self.resolver
    }

    pub fn policy(&self) -> &PolicyMatrix {
        &self.policy
    }

    pub fn guard(&self) -> &ScopedAccessGuard {
        &self.guard
    }

    /// Decide whether the caller may perform `action` on `route` in `workspace_id`.
    ///
    /// The organization is always taken from `ctx`; nothing in `route`
    /// (including its query string) can change it.
    pub async fn evaluate(
        &self,
        ctx: &TenantContext,
        workspace_id: &WorkspaceId,
        action: Action,
        route: &str,
    ) -> AccessDecision {
        self.evaluate_with_ownership(ctx, workspace_id, action, route, None)
            .await
    }

    pub async fn evaluate_with_ownership(
        &self,
        ctx: &TenantContext,
        workspace_id: &WorkspaceId,
        action: Action,
        route: &str,
        ownership: Option<&EntityOwnership>,
    ) -> AccessDecision {
        let route = normalize_route_with_ids(route, &[workspace_id.as_str()]);

        let decision = match self.resolver.resolve_detailed(ctx, workspace_id).await {
            Resolution::Granted(role) => {
                let at = RouteContext::new(&route, ctx.user_id()).with_ownership(ownership);
                self.policy.can_perform(action, role, &at)
            }
            Resolution::Denied(reason) => {
                AccessDecision::deny(reason, self.policy.required_role(action, &route))
            }
            Resolution::WorkspaceNotFound => {
                AccessDecision::deny(DecisionReason::WorkspaceNotFound, None)
            }
            Resolution::Unavailable => AccessDecision::deny(DecisionReason::StoreUnavailable, None),
        };

        record_decision(ctx, workspace_id, action, &route, &decision);
        decision
    }

    /// Evaluate and convert to the caller-facing result.
    pub async fn enforce(
        &self,
        ctx: &TenantContext,
        workspace_id: &WorkspaceId,
        action: Action,
        route: &str,
    ) -> Result<()> {
        self.evaluate(ctx, workspace_id, action, route)
            .await
            .into_result()
    }

    /// Read one entity through the guard.
    ///
    /// Absent in the caller's scope but present under another tenant is
    /// `Forbidden`; absent everywhere is `NotFound`. The same rule applies to
    /// every entity type.
    pub async fn load_entity(
        &self,
        ctx: &TenantContext,
        entity_type: &str,
        id: &EntityId,
        store: &dyn EntityStore,
    ) -> Result<EntityRecord> {
        self.authorize_entity(ctx, entity_type, id, Action::Read, store)
            .await
    }

    /// Load an entity and check `action` against it, ownership included.
    pub async fn authorize_entity(
        &self,
        ctx: &TenantContext,
        entity_type: &str,
        id: &EntityId,
        action: Action,
        store: &dyn EntityStore,
    ) -> Result<EntityRecord> {
        let scoped = self
            .guard
            .assert_scoped(entity_type, Query::by_id(id.as_str()), Some(ctx))?;

        let Some(record) = store.find_one(&scoped).await? else {
            return if store.exists_in_any_tenant(entity_type, id).await? {
                warn!(
                    request_id = %ctx.request_id(),
                    user_id = %ctx.user_id(),
                    entity_type = entity_type,
                    entity_id = %id,
                    "Entity exists outside the caller's scope"
                );
                Err(BastionError::forbidden(format!(
                    "{} {} is outside the caller's scope",
                    entity_type, id
                )))
            } else {
                Err(BastionError::not_found(entity_type, id.as_str()))
            };
        };

        match scoped.scope() {
            TenantScope::Workspace => {
                // The guard guarantees a workspace in the context for this scope.
                let workspace_id = ctx.workspace_id().cloned().ok_or_else(|| {
                    BastionError::missing_context("workspace vanished after scoping")
                })?;
                let route = self
                    .guard
                    .registry()
                    .get(entity_type)
                    .map(|d| d.route.clone())
                    .unwrap_or_default();
                let ownership = record.ownership();
                self.evaluate_with_ownership(ctx, &workspace_id, action, &route, Some(&ownership))
                    .await
                    .into_result()?;
            }
            TenantScope::Organization => {
                if !self.resolver.is_organization_member(ctx).await {
                    return Err(BastionError::forbidden(format!(
                        "caller is not a member of organization {}",
                        ctx.organization_id()
                    )));
                }
            }
            TenantScope::Unscoped => {}
        }

        Ok(record)
    }
}

fn record_decision(
    ctx: &TenantContext,
    workspace_id: &WorkspaceId,
    action: Action,
    route: &str,
    decision: &AccessDecision,
) {
    let outcome = if decision.allowed { "allow" } else { "deny" };
    counter!(
        DECISIONS_TOTAL,
        "outcome" => outcome,
        "reason" => decision.reason.as_str()
    )
    .increment(1);

    if decision.allowed {
        debug!(
            request_id = %ctx.request_id(),
            user_id = %ctx.user_id(),
            workspace_id = %workspace_id,
            action = %action,
            route = route,
            "Access granted"
        );
    } else {
        warn!(
            request_id = %ctx.request_id(),
            user_id = %ctx.user_id(),
            organization_id = %ctx.organization_id(),
            workspace_id = %workspace_id,
            action = %action,
            route = route,
            reason = %decision.reason,
            "Access denied"
        );
    }
}

// ═══════════════════════════════════════════════════════════════════════════════
// Tests
// ═══════════════════════════════════════════════════════════════════════════════

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::FORBIDDEN_MESSAGE;
    use crate::tenancy::guard::{EntityRegistry, InMemoryEntityStore};
    use crate::tenancy::membership::{InMemoryMembershipStore, MembershipStore};
    use crate::tenancy::models::{
        OrganizationId, OrganizationMembership, OrganizationRole, PlatformRole, UserId, Workspace,
        WorkspaceMembership, WorkspaceRole,
    };

    async fn service() -> (Arc<InMemoryMembershipStore>, AccessService) {
        let store = Arc::new(InMemoryMembershipStore::new());
        store.put_workspace(Workspace::new("w1", "org-a", "Alpha")).await.unwrap();
        store.put_workspace(Workspace::new("w2", "org-b", "Beta")).await.unwrap();
        for (user, org, ws) in [("u1", "org-a", "w1"), ("u2", "org-b", "w2")] {
            store
                .put_organization_membership(OrganizationMembership::new(user, org, OrganizationRole::Member))
                .await
                .unwrap();
            store
                .put_workspace_membership(WorkspaceMembership::new(user, ws, org, WorkspaceRole::Member))
                .await
                .unwrap();
        }

        let service = AccessService::new(
            RoleResolver::new(store.clone()),
            Arc::new(PolicyMatrix::default_matrix()),
            ScopedAccessGuard::new(Arc::new(EntityRegistry::standard())),
        );
        (store, service)
    }

    fn ctx(user: &str, org: &str, ws: Option<&str>) -> TenantContext {
        TenantContext::establish(
            UserId::new(user),
            Some(OrganizationId::new(org)),
            ws.map(WorkspaceId::new),
            PlatformRole::Member,
        )
        .unwrap()
    }

    #[test]
    fn test_every_refusal_reads_the_same() {
        let reasons = [
            DecisionReason::TenantMismatch,
            DecisionReason::NoMembership,
            DecisionReason::InsufficientRole,
            DecisionReason::NotOwner,
            DecisionReason::NoMatchingRule {
                role: Role::Viewer,
                route: "/x".into(),
            },
        ];
        for reason in reasons {
            let err = AccessDecision::deny(reason, None).into_result().unwrap_err();
            assert_eq!(err.code(), ErrorCode::Forbidden);
            assert_eq!(err.user_message(), FORBIDDEN_MESSAGE);
        }

        let missing = AccessDecision::deny(DecisionReason::WorkspaceNotFound, None);
        assert_eq!(missing.into_result().unwrap_err().code(), ErrorCode::NotFound);
        let down = AccessDecision::deny(DecisionReason::StoreUnavailable, None);
        assert_eq!(down.into_result().unwrap_err().code(), ErrorCode::ServiceUnavailable);
        assert!(AccessDecision::allow().into_result().is_ok());
    }

    #[tokio::test]
    async fn test_route_with_literal_workspace_id() {
        let (_, service) = service().await;
        let w1 = WorkspaceId::new("w1");
        let decision = service
            .evaluate(&ctx("u1", "org-a", None), &w1, Action::Create, "/workspaces/w1/tasks")
            .await;
        assert!(decision.allowed);
    }

    #[tokio::test]
    async fn test_concrete_entity_id_matches_entity_rule() {
        let (_, service) = service().await;
        let w1 = WorkspaceId::new("w1");
        let caller = ctx("u1", "org-a", None);
        let mine = EntityOwnership::created_by("u1");

        for route in ["/workspaces/w1/tasks/t1", "/workspaces/w1/tasks/:id", "/workspaces/:id/tasks/other"] {
            let decision = service
                .evaluate_with_ownership(&caller, &w1, Action::Update, route, Some(&mine))
                .await;
            assert!(decision.allowed, "{} gave {}", route, decision.reason);
        }
    }

    #[tokio::test]
    async fn test_cross_tenant_workspace_is_forbidden() {
        let (_, service) = service().await;
        let err = service
            .enforce(&ctx("u1", "org-a", None), &WorkspaceId::new("w2"), Action::Read, "/workspaces/:id")
            .await
            .unwrap_err();
        assert_eq!(err.code(), ErrorCode::Forbidden);
    }

    #[tokio::test]
    async fn test_load_entity_forbidden_vs_not_found() {
        let (_, service) = service().await;
        let entities = InMemoryEntityStore::new();
        entities.insert(EntityRecord::new("task", "t1", "org-a", Some(WorkspaceId::new("w1"))));
        entities.insert(EntityRecord::new("task", "t2", "org-b", Some(WorkspaceId::new("w2"))));

        let caller = ctx("u1", "org-a", Some("w1"));
        let own = service
            .load_entity(&caller, "task", &EntityId::new("t1"), &entities)
            .await
            .unwrap();
        assert_eq!(own.id.as_str(), "t1");

        let foreign = service
            .load_entity(&caller, "task", &EntityId::new("t2"), &entities)
            .await
            .unwrap_err();
        assert_eq!(foreign.code(), ErrorCode::Forbidden);

        let missing = service
            .load_entity(&caller, "task", &EntityId::new("t3"), &entities)
            .await
            .unwrap_err();
        assert_eq!(missing.code(), ErrorCode::NotFound);
    }

    #[tokio::test]
    async fn test_authorize_entity_applies_ownership() {
        let (_, service) = service().await;
        let entities = InMemoryEntityStore::new();
        entities.insert(
            EntityRecord::new("task", "mine", "org-a", Some(WorkspaceId::new("w1"))).created_by("u1"),
        );
        entities.insert(
            EntityRecord::new("task", "theirs", "org-a", Some(WorkspaceId::new("w1"))).created_by("u9"),
        );

        let caller = ctx("u1", "org-a", Some("w1"));
        assert!(service
            .authorize_entity(&caller, "task", &EntityId::new("mine"), Action::Update, &entities)
            .await
            .is_ok());
        let err = service
            .authorize_entity(&caller, "task", &EntityId::new("theirs"), Action::Update, &entities)
            .await
            .unwrap_err();
        assert_eq!(err.code(), ErrorCode::Forbidden);
    }

    #[tokio::test]
    async fn test_outage_is_service_unavailable() {
        let (store, service) = service().await;
        store.set_available(false);
        let err = service
            .enforce(&ctx("u1", "org-a", None), &WorkspaceId::new("w1"), Action::Read, "/workspaces/:id")
            .await
            .unwrap_err();
        assert_eq!(err.code(), ErrorCode::ServiceUnavailable);
    }
}
