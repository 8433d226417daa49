//! Multi-tenant authorization and data isolation.
//!
//! Request flow:
//!
//! 1. [`TenantContextLayer`] establishes an immutable [`TenantContext`] from
//!    the verified identity and installs it for the request's task.
//! 2. [`RoleResolver`] combines platform role, organization membership and
//!    workspace membership into one effective [`Role`] per workspace.
//! 3. [`PolicyMatrix`] decides whether that role may perform an [`Action`]
//!    on a route, with an ownership tie-break for members.
//! 4. [`ScopedAccessGuard`] injects the tenant predicate into every data query.
//! 5. [`ActionCollaborator`] previews autonomous actions and, once confirmed,
//!    executes them and writes an [`AuditRecord`].
//!
//! [`AccessService`] is the Decision API that callers use for steps 2 to 4.

pub mod audit;
pub mod context;
pub mod decision;
pub mod guard;
pub mod membership;
pub mod middleware;
pub mod models;
pub mod policy;
pub mod resolver;
pub mod route;

pub use audit::{
    ActionCollaborator, ActionHandler, AuditOutcome, AuditRecord, AuditSink, AuditStatus,
    EntityRef, ExecutionReceipt, Impact, InMemoryAuditSink, Preview, TracingAuditSink,
};
pub use context::TenantContext;
pub use decision::{AccessDecision, AccessService, DecisionReason};
pub use guard::{
    EntityDescriptor, EntityFixtures, EntityRecord, EntityRegistry, EntityStore, Field, InMemoryEntityStore,
    Predicate, Query, ScopedAccessGuard, ScopedEntity, ScopedQuery, TenantScope,
};
pub use membership::{
    InMemoryMembershipStore, MembershipFixtures, MembershipService, MembershipStore, StoreError,
};
pub use middleware::{context_from_headers, TenantContextLayer, TenantContextService};
pub use models::{
    normalize_role_name, Action, ActionKind, EntityId, OrganizationId, OrganizationMembership,
    OrganizationRole, PlatformRole, RequestId, Role, RoleName, UserId, Workspace, WorkspaceId,
    WorkspaceMembership, WorkspaceRole,
};
pub use policy::{ActionSet, EntityOwnership, PolicyMatrix, PolicyMatrixBuilder, PolicyRule, RouteContext};
pub use resolver::{MembershipMemo, Resolution, RoleResolver};
pub use route::{normalize_route, normalize_route_with_ids, ID_PLACEHOLDER};
