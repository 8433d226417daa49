//! Tower middleware that establishes the tenant context for each request.
//!
//! The upstream identity provider has already verified the caller and
//! forwards the identity in trusted headers. This layer turns those headers
//! into a [`TenantContext`], inserts it into the request extensions, and runs
//! the rest of the stack inside [`TenantContext::scope`] so the context is
//! visible to this request's task only.

use axum::{
    body::Body,
    extract::{FromRequestParts, Request},
    http::{request::Parts, HeaderMap},
    response::{IntoResponse, Response},
};
use futures::future::BoxFuture;
use std::task::{Context, Poll};
use tower::{Layer, Service};
use tracing::{debug, warn};

use super::context::TenantContext;
use super::models::{OrganizationId, PlatformRole, UserId, WorkspaceId};
use crate::error::{BastionError, Result};

pub const USER_ID_HEADER: &str = "x-user-id";
pub const ORGANIZATION_ID_HEADER: &str = "x-organization-id";
pub const WORKSPACE_ID_HEADER: &str = "x-workspace-id";
pub const PLATFORM_ROLE_HEADER: &str = "x-platform-role";

// ═══════════════════════════════════════════════════════════════════════════════
// Extractor
// ═══════════════════════════════════════════════════════════════════════════════

#[axum::async_trait]
impl<S> FromRequestParts<S> for TenantContext
where
    S: Send + Sync,
{
    type Rejection = BastionError;

    async fn from_request_parts(parts: &mut Parts, _state: &S) -> std::result::Result<Self, Self::Rejection> {
        parts
            .extensions
            .get::<TenantContext>()
            .cloned()
            .ok_or_else(|| BastionError::missing_context("TenantContextLayer is not installed"))
    }
}

/// Build a context from identity-provider headers.
pub fn context_from_headers(headers: &HeaderMap) -> Result<TenantContext> {
    let user_id = header_str(headers, USER_ID_HEADER).ok_or_else(BastionError::unauthenticated)?;

    let platform_role = match header_str(headers, PLATFORM_ROLE_HEADER) {
        Some(raw) => raw
            .parse::<PlatformRole>()
            .map_err(|_| BastionError::invalid_context("Unrecognized platform role"))?,
        None => PlatformRole::Member,
    };

    TenantContext::establish(
        UserId::new(user_id),
        header_str(headers, ORGANIZATION_ID_HEADER).map(OrganizationId::new),
        header_str(headers, WORKSPACE_ID_HEADER).map(WorkspaceId::new),
        platform_role,
    )
}

fn header_str<'a>(headers: &'a HeaderMap, name: &str) -> Option<&'a str> {
    headers
        .get(name)
        .and_then(|v| v.to_str().ok())
        .map(str::trim)
        .filter(|v| !v.is_empty())
}

// ═══════════════════════════════════════════════════════════════════════════════
// Tower Layer
// ═══════════════════════════════════════════════════════════════════════════════

/// Layer that establishes a [`TenantContext`] per request.
#[derive(Debug, Clone, Default)]
pub struct TenantContextLayer;

impl TenantContextLayer {
    pub fn new() -> Self {
        Self
    }
}

impl<S> Layer<S> for TenantContextLayer {
    type Service = TenantContextService<S>;

    fn layer(&self, inner: S) -> Self::Service {
        TenantContextService { inner }
    }
}

#[derive(Debug, Clone)]
pub struct TenantContextService<S> {
    inner: S,
}

impl<S> Service<Request<Body>> for TenantContextService<S>
where
    S: Service<Request<Body>, Response = Response> + Clone + Send + 'static,
    S::Future: Send,
{
    type Response = Response;
    type Error = S::Error;
    type Future = BoxFuture<'static, std::result::Result<Self::Response, Self::Error>>;

    fn poll_ready(&mut self, cx: &mut Context<'_>) -> Poll<std::result::Result<(), Self::Error>> {
        self.inner.poll_ready(cx)
    }

    fn call(&mut self, mut request: Request<Body>) -> Self::Future {
        let mut inner = self.inner.clone();

        Box::pin(async move {
            let ctx = match context_from_headers(request.headers()) {
                Ok(ctx) => ctx,
                Err(err) => {
                    warn!(
                        path = %request.uri().path(),
                        code = %err.code(),
                        "Rejected request without a usable tenant identity"
                    );
                    return Ok(err.into_response());
                }
            };

            debug!(
                request_id = %ctx.request_id(),
                user_id = %ctx.user_id(),
                organization_id = %ctx.organization_id(),
                "Tenant context established"
            );

            request.extensions_mut().insert(ctx.clone());
            ctx.scope(inner.call(request)).await
        })
    }
}

// ═══════════════════════════════════════════════════════════════════════════════
// Tests
// ═══════════════════════════════════════════════════════════════════════════════
