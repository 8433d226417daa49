#![allow(clippy::result_large_err)]
//! # Bastion Core
//!
//! Multi-tenant authorization and data isolation.
//!
//! ## Architecture
//!
//! - **Tenant Context**: Immutable per-request identity, scoped to the request's task
//! - **Role Resolver**: Platform, organization and workspace roles folded into one effective role
//! - **Policy Matrix**: Declarative role × route × action rules with an ownership tie-break
//! - **Scoped Access Guard**: Tenant predicates injected into every data query
//! - **Action Collaborator**: Preview, confirm and execute with audit records
//! - **API**: HTTP reference binding of the decision and action APIs
//! - **Telemetry**: Structured logging and access-decision counters

pub mod actions;
pub mod api;
pub mod config;
pub mod error;
pub mod telemetry;
pub mod tenancy;

pub use error::{BastionError, ErrorCode, ErrorContext, ErrorDetails, ErrorSeverity, Result};

/// Re-export commonly used types
pub mod prelude {
    pub use crate::error::{BastionError, ErrorCode, ErrorContext, ErrorDetails, ErrorSeverity, Result};
    pub use crate::tenancy::{
        AccessDecision, AccessService, Action, ActionCollaborator, ActionHandler, AuditSink,
        DecisionReason, EntityId, EntityOwnership, EntityRegistry, EntityStore, MembershipStore,
        OrganizationId, PlatformRole, PolicyMatrix, Query, Role, RoleResolver, ScopedAccessGuard,
        TenantContext, TenantContextLayer, UserId, WorkspaceId, WorkspaceRole,
    };
}
