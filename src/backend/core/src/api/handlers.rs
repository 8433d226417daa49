//! API request handlers.
//!
//! All handlers return `Result<impl IntoResponse, BastionError>` so that
//! errors are converted to HTTP status codes via the `IntoResponse`
//! implementation on `BastionError`.

use axum::{
    extract::{Path, State},
    response::IntoResponse,
    Json,
};
use metrics::counter;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use tracing::warn;

use super::{ApiResponse, AppState};
use crate::error::{BastionError, ErrorContext};
use crate::telemetry::BYPASS_ATTEMPTS_TOTAL;
use crate::tenancy::{Action, EntityId, TenantContext, WorkspaceId};

// ═══════════════════════════════════════════════════════════════════════════════
// Health Check
// ═══════════════════════════════════════════════════════════════════════════════

pub async fn health_check() -> impl IntoResponse {
    Json(serde_json::json!({
        "status": "healthy",
        "version": env!("CARGO_PKG_VERSION"),
        "timestamp": chrono::Utc::now().to_rfc3339()
    }))
}

// ═══════════════════════════════════════════════════════════════════════════════
// Decisions
// ═══════════════════════════════════════════════════════════════════════════════

/// Entity a decision targets. Ownership is always read from the stored record.
#[derive(Debug, Clone, Deserialize)]
pub struct EntityRef {
    pub entity_type: String,
    pub entity_id: EntityId,
}

#[derive(Debug, Deserialize)]
pub struct DecisionRequest {
    pub workspace_id: WorkspaceId,
    pub action: Action,
    pub route: String,
    /// When set, the decision is made against this entity and `route` is
    /// replaced by the entity type's registered route.
    #[serde(default)]
    pub entity: Option<EntityRef>,
    /// Never used for the decision; the authenticated context wins.
    #[serde(default)]
    pub organization_id: Option<String>,
}

#[derive(Debug, Serialize)]
pub struct DecisionResponse {
    pub allowed: bool,
    pub workspace_id: WorkspaceId,
    pub action: Action,
}

pub async fn evaluate_decision(
    State(state): State<AppState>,
    ctx: TenantContext,
    Json(req): Json<DecisionRequest>,
) -> Result<impl IntoResponse, BastionError> {
    if let Some(claimed) = req.organization_id.as_deref() {
        if claimed != ctx.organization_id().as_str() {
            counter!(BYPASS_ATTEMPTS_TOTAL, "via" => "body").increment(1);
            warn!(
                request_id = %ctx.request_id(),
                user_id = %ctx.user_id(),
                organization_id = %ctx.organization_id(),
                claimed_organization_id = claimed,
                "Ignoring organization supplied in request body"
            );
        }
    }

    match &req.entity {
        Some(entity) => {
            ensure_entity_type(&state, &entity.entity_type)?;
            let scoped = ctx.with_workspace(req.workspace_id.clone());
            state
                .access
                .authorize_entity(
                    &scoped,
                    &entity.entity_type,
                    &entity.entity_id,
                    req.action,
                    &*state.entities,
                )
                .await?;
        }
        None => {
            state
                .access
                .evaluate(&ctx, &req.workspace_id, req.action, &req.route)
                .await
                .into_result()?;
        }
    }

    Ok(Json(ApiResponse::success(DecisionResponse {
        allowed: true,
        workspace_id: req.workspace_id,
        action: req.action,
    })))
}

// ═══════════════════════════════════════════════════════════════════════════════
// Actions
// ═══════════════════════════════════════════════════════════════════════════════

#[derive(Debug, Default, Deserialize)]
pub struct ActionRequest {
    #[serde(default)]
    pub params: Value,
    /// Must be exactly `true` for execution.
    #[serde(default)]
    pub confirmed: bool,
}

pub async fn preview_action(
    State(state): State<AppState>,
    ctx: TenantContext,
    Path((workspace_id, action)): Path<(String, String)>,
    Json(req): Json<ActionRequest>,
) -> Result<impl IntoResponse, BastionError> {
    let scoped = ctx.with_workspace(WorkspaceId::new(workspace_id));
    let preview = scoped
        .clone()
        .scope(async { state.actions.preview(&action, &req.params, &scoped).await })
        .await?;

    Ok(Json(ApiResponse::success(preview)))
}

pub async fn execute_action(
    State(state): State<AppState>,
    ctx: TenantContext,
    Path((workspace_id, action)): Path<(String, String)>,
    Json(req): Json<ActionRequest>,
) -> Result<impl IntoResponse, BastionError> {
    let scoped = ctx.with_workspace(WorkspaceId::new(workspace_id));
    let receipt = scoped
        .clone()
        .scope(async {
            state
                .actions
                .execute(&action, &req.params, &scoped, req.confirmed)
                .await
        })
        .await?;

    Ok(Json(ApiResponse::success(receipt)))
}

// ═══════════════════════════════════════════════════════════════════════════════
// Entities
// ═══════════════════════════════════════════════════════════════════════════════

pub async fn get_entity(
    State(state): State<AppState>,
    ctx: TenantContext,
    Path((workspace_id, entity_type, entity_id)): Path<(String, String, String)>,
) -> Result<impl IntoResponse, BastionError> {
    ensure_entity_type(&state, &entity_type)?;
    let scoped = ctx.with_workspace(WorkspaceId::new(workspace_id));
    let record = state
        .access
        .load_entity(
            &scoped,
            &entity_type,
            &EntityId::new(entity_id),
            &*state.entities,
        )
        .await?;

    Ok(Json(ApiResponse::success(record)))
}

/// Entity types arrive from the caller; an unregistered one is `NotFound`,
/// not a server misconfiguration.
fn ensure_entity_type(state: &AppState, entity_type: &str) -> Result<(), BastionError> {
    state
        .access
        .guard()
        .registry()
        .get(entity_type)
        .context(format!("Unknown entity type: {}", entity_type))
        .map(|_| ())
}
