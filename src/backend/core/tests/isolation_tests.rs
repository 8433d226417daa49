//! Tenant isolation tests.
//!
//! Tests cover:
//! - Cross-organization decisions are always Forbidden, never NotFound
//! - Organization identifiers smuggled into routes or queries are ignored
//! - Entity reads through the guard, in and out of scope
//! - Fail-closed behaviour when the membership store is down
//! - Per-task context isolation under concurrent interleaving
//! - Per-request memoization of membership lookups

mod common;

use std::collections::HashSet;

use bastion_core::error::ErrorCode;
use bastion_core::tenancy::{
    Action, DecisionReason, EntityId, EntityOwnership, EntityStore, Field, PlatformRole, Query,
    Role, TenantContext, WorkspaceId,
};
use common::{access_service, context, context_as, entity_store, membership_store};

// ============================================================================
// Decisions across organizations
// ============================================================================

#[tokio::test]
async fn test_owner_scenario_across_two_organizations() {
    let access = access_service(membership_store());
    let u1 = context("u1", "org-a", None);
    let u2 = context("u2", "org-b", None);

    let u1_w2 = access
        .evaluate(&u1, &WorkspaceId::new("w2"), Action::Read, "/workspaces/:id")
        .await;
    assert!(!u1_w2.allowed);
    assert_eq!(u1_w2.into_result().unwrap_err().code(), ErrorCode::Forbidden);

    let u1_w1 = access
        .evaluate(&u1, &WorkspaceId::new("w1"), Action::Read, "/workspaces/:id")
        .await;
    assert!(u1_w1.allowed);

    let u2_w1 = access
        .evaluate(&u2, &WorkspaceId::new("w1"), Action::Read, "/workspaces/:id")
        .await;
    assert_eq!(u2_w1.into_result().unwrap_err().code(), ErrorCode::Forbidden);
}

#[tokio::test]
async fn test_outsider_is_forbidden_for_every_route_and_action() {
    let access = access_service(membership_store());
    let routes = [
        "/workspaces/:id",
        "/workspaces/w1/tasks",
        "/workspaces/w1/tasks/550e8400-e29b-41d4-a716-446655440000",
        "/workspaces/w1/documents?organization_id=org-a",
        "/workspaces/w1/members#owners",
        "/somewhere/else",
    ];

    // Same user under their own organization, and claiming org-a outright.
    for ctx in [context("u2", "org-b", None), context("u2", "org-a", None)] {
        for route in routes {
            for action in Action::ALL {
                let err = access
                    .enforce(&ctx, &WorkspaceId::new("w1"), action, route)
                    .await
                    .unwrap_err();
                assert_eq!(
                    err.code(),
                    ErrorCode::Forbidden,
                    "{} {} as {}",
                    action,
                    route,
                    ctx.organization_id()
                );
            }
        }
    }
}

#[tokio::test]
async fn test_unknown_workspace_is_not_found() {
    let access = access_service(membership_store());
    let ctx = context("u1", "org-a", None);

    let decision = access
        .evaluate(&ctx, &WorkspaceId::new("w404"), Action::Read, "/workspaces/:id")
        .await;
    assert_eq!(decision.reason, DecisionReason::WorkspaceNotFound);
    assert_eq!(decision.into_result().unwrap_err().code(), ErrorCode::NotFound);
}

#[tokio::test]
async fn test_forbidden_message_does_not_reveal_the_reason() {
    let access = access_service(membership_store());
    let outsider = access
        .enforce(&context("u2", "org-b", None), &WorkspaceId::new("w1"), Action::Read, "/workspaces/:id")
        .await
        .unwrap_err();
    let viewer = access
        .enforce(&context("u4", "org-a", None), &WorkspaceId::new("w1"), Action::Delete, "/workspaces/:id")
        .await
        .unwrap_err();

    assert_eq!(outsider.code(), viewer.code());
    assert_eq!(outsider.user_message(), viewer.user_message());
}

#[tokio::test]
async fn test_spoofed_organization_in_query_does_not_change_outcome() {
    let access = access_service(membership_store());
    let cases = [
        (context("u1", "org-a", None), "w1"),
        (context("u1", "org-a", None), "w2"),
        (context("u2", "org-b", None), "w1"),
        (context("u3", "org-a", None), "w1"),
    ];

    for (ctx, workspace) in cases {
        let workspace = WorkspaceId::new(workspace);
        let plain = access
            .evaluate(&ctx, &workspace, Action::Read, "/workspaces/:id/tasks")
            .await;
        for spoof in ["org-a", "org-b", "org-z"] {
            let route = format!("/workspaces/:id/tasks?organization_id={}&orgId={}", spoof, spoof);
            let spoofed = access.evaluate(&ctx, &workspace, Action::Read, &route).await;
            assert_eq!(plain.allowed, spoofed.allowed);
            assert_eq!(plain.reason, spoofed.reason);
        }
    }
}

#[tokio::test]
async fn test_platform_admin_never_crosses_organizations() {
    let access = access_service(membership_store());
    let admin = context_as("ops", "org-a", None, PlatformRole::Admin);

    assert!(
        access
            .evaluate(&admin, &WorkspaceId::new("w1"), Action::Delete, "/workspaces/:id")
            .await
            .allowed
    );

    let foreign = access
        .evaluate(&admin, &WorkspaceId::new("w2"), Action::Read, "/workspaces/:id")
        .await;
    assert_eq!(foreign.reason, DecisionReason::TenantMismatch);
}

// ============================================================================
// Roles and ownership
// ============================================================================

#[tokio::test]
async fn test_platform_viewer_is_capped_at_viewer() {
    let store = membership_store();
    let access = access_service(store);
    let ctx = context_as("u1", "org-a", None, PlatformRole::Viewer);

    assert_eq!(
        access.resolver().resolve(&ctx, &WorkspaceId::new("w1")).await,
        Some(Role::Viewer)
    );
    let decision = access
        .evaluate(&ctx, &WorkspaceId::new("w1"), Action::Update, "/workspaces/:id/tasks/:id")
        .await;
    assert_eq!(decision.reason, DecisionReason::InsufficientRole);
}

#[tokio::test]
async fn test_member_may_only_mutate_own_entities() {
    let access = access_service(membership_store());
    let member = context("u3", "org-a", None);
    let w1 = WorkspaceId::new("w1");
    let route = "/workspaces/:id/tasks/:id";

    let own = EntityOwnership::created_by("u3");
    let theirs = EntityOwnership::created_by("u1");
    let assigned = EntityOwnership::created_by("u1").with_assignee("u3");

    for (ownership, allowed) in [(Some(&own), true), (Some(&assigned), true), (Some(&theirs), false), (None, false)] {
        let decision = access
            .evaluate_with_ownership(&member, &w1, Action::Update, route, ownership)
            .await;
        assert_eq!(decision.allowed, allowed, "{:?}", ownership);
    }

    let denied = access
        .evaluate_with_ownership(&member, &w1, Action::Delete, route, Some(&theirs))
        .await;
    assert_eq!(denied.reason, DecisionReason::NotOwner);
    assert_eq!(denied.required_role, Some(Role::Owner));
}

#[tokio::test]
async fn test_organization_member_without_workspace_membership_is_denied() {
    let access = access_service(membership_store());
    let decision = access
        .evaluate(&context("u5", "org-a", None), &WorkspaceId::new("w1"), Action::Read, "/workspaces/:id")
        .await;
    assert_eq!(decision.reason, DecisionReason::NoMembership);
}

// ============================================================================
// Entity access through the guard
// ============================================================================

#[tokio::test]
async fn test_load_entity_in_scope() {
    let access = access_service(membership_store());
    let entities = entity_store();
    let ctx = context("u1", "org-a", Some("w1"));

    let task = access
        .load_entity(&ctx, "task", &EntityId::new("t1"), entities.as_ref())
        .await
        .unwrap();
    assert_eq!(task.organization_id.as_str(), "org-a");
}

#[tokio::test]
async fn test_load_entity_of_other_tenant_is_forbidden_not_missing() {
    let access = access_service(membership_store());
    let entities = entity_store();

    for ctx in [
        context("u1", "org-a", Some("w1")),
        // Naming the other organization's workspace does not help.
        context("u1", "org-a", Some("w2")),
    ] {
        let err = access
            .load_entity(&ctx, "task", &EntityId::new("t9"), entities.as_ref())
            .await
            .unwrap_err();
        assert_eq!(err.code(), ErrorCode::Forbidden);
    }

    let err = access
        .load_entity(&context("u2", "org-b", Some("w2")), "document", &EntityId::new("d1"), entities.as_ref())
        .await
        .unwrap_err();
    assert_eq!(err.code(), ErrorCode::Forbidden);

    let missing = access
        .load_entity(&context("u1", "org-a", Some("w1")), "task", &EntityId::new("t404"), entities.as_ref())
        .await
        .unwrap_err();
    assert_eq!(missing.code(), ErrorCode::NotFound);
}

#[tokio::test]
async fn test_member_cannot_update_someone_elses_task() {
    let access = access_service(membership_store());
    let entities = entity_store();
    let member = context("u3", "org-a", Some("w1"));

    // t1 was created by u3, t2 by u1.
    access
        .authorize_entity(&member, "task", &EntityId::new("t1"), Action::Update, entities.as_ref())
        .await
        .unwrap();
    let err = access
        .authorize_entity(&member, "task", &EntityId::new("t2"), Action::Update, entities.as_ref())
        .await
        .unwrap_err();
    assert_eq!(err.code(), ErrorCode::Forbidden);
}

#[tokio::test]
async fn test_guard_rejects_query_naming_another_organization() {
    let access = access_service(membership_store());
    let ctx = context("u1", "org-a", Some("w1"));

    let err = access
        .guard()
        .assert_scoped("task", Query::new().filter(Field::OrganizationId, "org-b"), Some(&ctx))
        .unwrap_err();
    assert_eq!(err.code(), ErrorCode::Forbidden);

    let err = access
        .guard()
        .assert_scoped("task", Query::new().filter(Field::WorkspaceId, "w2"), Some(&ctx))
        .unwrap_err();
    assert_eq!(err.code(), ErrorCode::Forbidden);
}

#[tokio::test]
async fn test_guard_without_context_is_missing_context() {
    let access = access_service(membership_store());
    let err = access.guard().assert_scoped("task", Query::new(), None).unwrap_err();
    assert_eq!(err.code(), ErrorCode::MissingContext);

    let err = access.guard().assert_scoped_current("task", Query::new()).unwrap_err();
    assert_eq!(err.code(), ErrorCode::MissingContext);
}

// ============================================================================
// Failure handling
// ============================================================================

#[tokio::test]
async fn test_store_outage_fails_closed() {
    let store = membership_store();
    let access = access_service(store.clone());
    store.set_available(false);

    let ctx = context("u1", "org-a", None);
    let decision = access
        .evaluate(&ctx, &WorkspaceId::new("w1"), Action::Read, "/workspaces/:id")
        .await;
    assert!(!decision.allowed);
    assert_eq!(decision.reason, DecisionReason::StoreUnavailable);
    assert_eq!(
        decision.into_result().unwrap_err().code(),
        ErrorCode::ServiceUnavailable
    );

    store.set_available(true);
    let fresh = context("u1", "org-a", None);
    assert!(
        access
            .evaluate(&fresh, &WorkspaceId::new("w1"), Action::Read, "/workspaces/:id")
            .await
            .allowed
    );
}

// ============================================================================
// Concurrency
// ============================================================================

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn test_interleaved_tasks_only_see_their_own_scope() {
    let access = access_service(membership_store());
    let entities = entity_store();

    let mut handles = Vec::new();
    for (user, org, workspace) in [("u1", "org-a", "w1"), ("u2", "org-b", "w2")] {
        let ctx = context(user, org, Some(workspace));
        let guard = access.guard().clone();
        let entities = entities.clone();

        handles.push(tokio::spawn(ctx.scope(async move {
            let mut seen = HashSet::new();
            for _ in 0..1000 {
                let current = TenantContext::current().expect("context in scope");
                assert_eq!(current.organization_id().as_str(), org);

                let scoped = guard.assert_scoped_current("task", Query::new()).unwrap();
                for record in entities.find(&scoped).await.unwrap() {
                    assert_eq!(record.organization_id.as_str(), org);
                    assert_eq!(record.workspace_id.as_ref().map(|w| w.as_str()), Some(workspace));
                    seen.insert(record.id.to_string());
                }
                tokio::task::yield_now().await;
            }
            seen
        })));
    }

    let mut results = Vec::new();
    for handle in handles {
        results.push(handle.await.unwrap());
    }
    assert_eq!(results[0], HashSet::from(["t1".to_string(), "t2".to_string()]));
    assert_eq!(results[1], HashSet::from(["t9".to_string()]));

    // Nothing leaks out of the scoped tasks.
    assert!(TenantContext::current().is_err());
}

// ============================================================================
// Memoization
// ============================================================================

#[tokio::test]
async fn test_membership_lookups_are_memoized_per_request() {
    let access = access_service(membership_store());
    let ctx = context("u3", "org-a", None);
    let w1 = WorkspaceId::new("w1");

    access.evaluate(&ctx, &w1, Action::Read, "/workspaces/:id").await;
    let after_first = ctx.membership_lookups();
    assert_eq!(after_first, 3);

    for action in [Action::Read, Action::Create, Action::Update] {
        access.evaluate(&ctx, &w1, action, "/workspaces/:id/tasks").await;
    }
    // Same request, other workspace view: the memo is shared.
    let narrowed = ctx.with_workspace(w1.clone());
    access.evaluate(&narrowed, &w1, Action::Read, "/workspaces/:id").await;
    assert_eq!(ctx.membership_lookups(), after_first);

    // A new request starts with an empty memo.
    let next = context("u3", "org-a", None);
    access.evaluate(&next, &w1, Action::Read, "/workspaces/:id").await;
    assert_eq!(next.membership_lookups(), 3);
}
