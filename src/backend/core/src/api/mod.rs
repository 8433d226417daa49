//! HTTP reference binding for the Decision API and the preview/execute protocol.
//!
//! Every `/v1` route runs behind [`TenantContextLayer`], so handlers receive
//! an established [`TenantContext`](crate::tenancy::TenantContext) and never
//! read tenant identifiers from request bodies. `/health` is outside the layer.

mod handlers;

use axum::{
    routing::{get, post},
    Router,
};
use serde::Serialize;
use std::sync::Arc;
use std::time::Duration;
use tower_http::trace::TraceLayer;

use crate::actions::standard_handlers;
use crate::tenancy::{
    AccessService, ActionCollaborator, AuditSink, EntityRegistry, EntityStore, MembershipStore,
    PolicyMatrix, RoleResolver, ScopedAccessGuard, TenantContextLayer,
};

pub use handlers::{ActionRequest, DecisionRequest, DecisionResponse, EntityRef};

/// Application state shared across handlers.
#[derive(Clone)]
pub struct AppState {
    pub access: AccessService,
    pub actions: Arc<ActionCollaborator>,
    pub entities: Arc<dyn EntityStore>,
}

impl AppState {
    /// Wire the standard registry and archive actions over the given stores.
    pub fn assemble(
        memberships: Arc<dyn MembershipStore>,
        entities: Arc<dyn EntityStore>,
        policy: PolicyMatrix,
        lookup_timeout: Duration,
        sink: Arc<dyn AuditSink>,
    ) -> Self {
        let resolver = RoleResolver::new(memberships).with_lookup_timeout(lookup_timeout);
        let guard = ScopedAccessGuard::new(Arc::new(EntityRegistry::standard()));
        let access = AccessService::new(resolver, Arc::new(policy), guard.clone());

        let mut actions = ActionCollaborator::new(access.clone(), sink);
        for handler in standard_handlers(&guard, &entities) {
            actions.register(handler);
        }

        Self {
            access,
            actions: Arc::new(actions),
            entities,
        }
    }
}

/// Build the API router.
///
/// ```rust,ignore
/// let state = AppState { access, actions, entities };
/// let app = build_router(state);
/// ```
pub fn build_router(state: AppState) -> Router {
    Router::new()
        .route("/v1/decisions", post(handlers::evaluate_decision))
        .route(
            "/v1/workspaces/:workspace_id/actions/:action/preview",
            post(handlers::preview_action),
        )
        .route(
            "/v1/workspaces/:workspace_id/actions/:action/execute",
            post(handlers::execute_action),
        )
        .route(
            "/v1/workspaces/:workspace_id/entities/:entity_type/:entity_id",
            get(handlers::get_entity),
        )
        .layer(TenantContextLayer::new())
        // Added after the tenant layer so it is not wrapped by it.
        .route("/health", get(handlers::health_check))
        .layer(TraceLayer::new_for_http())
        .with_state(state)
}

/// Standard success envelope. Errors render through `BastionError`.
#[derive(Debug, Serialize)]
pub struct ApiResponse<T> {
    pub success: bool,
    pub data: T,
}

impl<T: Serialize> ApiResponse<T> {
    pub fn success(data: T) -> Self {
        Self {
            success: true,
            data,
        }
    }
}
