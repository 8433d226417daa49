//! Tenant predicate enforcement for data access.
//!
//! Every query against tenant data passes through [`ScopedAccessGuard::assert_scoped`],
//! which injects the organization (and, where applicable, workspace) predicate
//! taken from the [`TenantContext`] and rejects queries that try to name a
//! different tenant. The result is a [`ScopedQuery`]; storage only accepts
//! that type, so an unscoped query cannot reach it.

use async_trait::async_trait;
use dashmap::DashMap;
use metrics::counter;
use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, HashMap};
use std::fmt;
use std::path::Path;
use std::sync::Arc;
use tracing::{error, warn};

use super::context::TenantContext;
use super::models::{EntityId, OrganizationId, UserId, WorkspaceId};
use super::policy::EntityOwnership;
use crate::error::{BastionError, Result};
use crate::telemetry::BYPASS_ATTEMPTS_TOTAL;

// ═══════════════════════════════════════════════════════════════════════════════
// Scope registry
// ═══════════════════════════════════════════════════════════════════════════════

/// Which tenant boundary an entity type lives under.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum TenantScope {
    Organization,
    Workspace,
    Unscoped,
}

/// Compile-time scope declaration for an entity type.
pub trait ScopedEntity {
    const ENTITY_TYPE: &'static str;
    const SCOPE: TenantScope;
    /// Policy route for a single instance, e.g. `/workspaces/:id/tasks/:id`.
    const ROUTE: &'static str;
}

/// Registration details for one entity type.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct EntityDescriptor {
    pub scope: TenantScope,
    pub route: String,
}

/// Entity type → scope map, built at startup.
#[derive(Debug, Clone, Default)]
pub struct EntityRegistry {
    entries: HashMap<String, EntityDescriptor>,
}

impl EntityRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Registry for the platform's built-in entity types.
    pub fn standard() -> Self {
        let mut registry = Self::new();
        registry.register("workspace", TenantScope::Workspace, "/workspaces/:id");
        for (entity_type, collection) in [
            ("project", "projects"),
            ("task", "tasks"),
            ("document", "documents"),
            ("form", "forms"),
            ("sprint", "sprints"),
            ("comment", "comments"),
        ] {
            registry.register(
                entity_type,
                TenantScope::Workspace,
                &format!("/workspaces/:id/{}/:id", collection),
            );
        }
        registry.register(
            "organization_member",
            TenantScope::Organization,
            "/organization/members/:id",
        );
        registry.register("audit_record", TenantScope::Organization, "/organization/audit/:id");
        registry
    }

    pub fn register(&mut self, entity_type: &str, scope: TenantScope, route: &str) {
        self.entries.insert(
            entity_type.to_string(),
            EntityDescriptor {
                scope,
                route: route.to_string(),
            },
        );
    }

    pub fn register_entity<T: ScopedEntity>(&mut self) {
        self.register(T::ENTITY_TYPE, T::SCOPE, T::ROUTE);
    }

    pub fn get(&self, entity_type: &str) -> Option<&EntityDescriptor> {
        self.entries.get(entity_type)
    }

    pub fn scope_of(&self, entity_type: &str) -> Option<TenantScope> {
        self.get(entity_type).map(|d| d.scope)
    }

    pub fn entity_types(&self) -> Vec<&str> {
        let mut types: Vec<&str> = self.entries.keys().map(String::as_str).collect();
        types.sort_unstable();
        types
    }
}

// ═══════════════════════════════════════════════════════════════════════════════
// Queries
// ═══════════════════════════════════════════════════════════════════════════════

/// Queryable field of an entity record.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Field {
    Id,
    OrganizationId,
    WorkspaceId,
    Attribute(String),
}

impl fmt::Display for Field {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Id => f.write_str("id"),
            Self::OrganizationId => f.write_str("organization_id"),
            Self::WorkspaceId => f.write_str("workspace_id"),
            Self::Attribute(name) => f.write_str(name),
        }
    }
}

/// Equality predicate.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Predicate {
    pub field: Field,
    pub value: String,
}

/// A proposed, not yet scoped, query.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct Query {
    predicates: Vec<Predicate>,
}

impl Query {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn by_id(id: impl Into<String>) -> Self {
        Self::new().filter(Field::Id, id)
    }

    pub fn filter(mut self, field: Field, value: impl Into<String>) -> Self {
        self.predicates.push(Predicate {
            field,
            value: value.into(),
        });
        self
    }

    pub fn predicates(&self) -> &[Predicate] {
        &self.predicates
    }
}

/// A query carrying the authoritative tenant predicates.
///
/// Only [`ScopedAccessGuard`] constructs these.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ScopedQuery {
    entity_type: String,
    scope: TenantScope,
    predicates: Vec<Predicate>,
}

impl ScopedQuery {
    pub fn entity_type(&self) -> &str {
        &self.entity_type
    }

    pub fn scope(&self) -> TenantScope {
        self.scope
    }

    pub fn predicates(&self) -> &[Predicate] {
        &self.predicates
    }

    /// Value of the first predicate on `field`.
    pub fn value_of(&self, field: &Field) -> Option<&str> {
        self.predicates
            .iter()
            .find(|p| &p.field == field)
            .map(|p| p.value.as_str())
    }

    /// Whether `record` satisfies every predicate.
    pub fn matches(&self, record: &EntityRecord) -> bool {
        record.entity_type == self.entity_type
            && self.predicates.iter().all(|p| record.field_value(&p.field) == Some(p.value.as_str()))
    }
}

// ═══════════════════════════════════════════════════════════════════════════════
// Guard
// ═══════════════════════════════════════════════════════════════════════════════

/// Injects and verifies tenant predicates.
#[derive(Debug, Clone)]
pub struct ScopedAccessGuard {
    registry: Arc<EntityRegistry>,
}

impl ScopedAccessGuard {
    pub fn new(registry: Arc<EntityRegistry>) -> Self {
        Self { registry }
    }

    pub fn registry(&self) -> &EntityRegistry {
        &self.registry
    }

    /// Scope `query` for `entity_type` to the caller's tenant.
    ///
    /// # Errors
    ///
    /// * `MissingContext` when `ctx` is `None`, or a workspace-scoped type is
    ///   queried from a context without a workspace.
    /// * `ConfigurationError` when `entity_type` is not registered.
    /// * `Forbidden` when the query already names a different tenant.
    pub fn assert_scoped(
        &self,
        entity_type: &str,
        query: Query,
        ctx: Option<&TenantContext>,
    ) -> Result<ScopedQuery> {
        let Some(ctx) = ctx else {
            error!(entity_type = entity_type, "Data access attempted without a tenant context");
            return Err(BastionError::missing_context(format!(
                "query for {} reached the guard without a context",
                entity_type
            )));
        };

        let Some(scope) = self.registry.scope_of(entity_type) else {
            error!(entity_type = entity_type, "Entity type has no tenant scope registration");
            return Err(BastionError::configuration(format!(
                "Entity type {} is not registered with a tenant scope",
                entity_type
            )));
        };

        let mut required: Vec<Predicate> = Vec::with_capacity(2);
        match scope {
            TenantScope::Unscoped => {}
            TenantScope::Organization => {
                required.push(Predicate {
                    field: Field::OrganizationId,
                    value: ctx.organization_id().to_string(),
                });
            }
            TenantScope::Workspace => {
                let Some(workspace_id) = ctx.workspace_id() else {
                    error!(
                        request_id = %ctx.request_id(),
                        entity_type = entity_type,
                        "Workspace-scoped access without a workspace in context"
                    );
                    return Err(BastionError::missing_context(format!(
                        "{} is workspace-scoped but the context has no workspace",
                        entity_type
                    )));
                };
                required.push(Predicate {
                    field: Field::OrganizationId,
                    value: ctx.organization_id().to_string(),
                });
                required.push(Predicate {
                    field: Field::WorkspaceId,
                    value: workspace_id.to_string(),
                });
            }
        }

        for proposed in query.predicates() {
            let conflict = required
                .iter()
                .any(|r| r.field == proposed.field && r.value != proposed.value);
            if conflict {
                warn!(
                    request_id = %ctx.request_id(),
                    user_id = %ctx.user_id(),
                    entity_type = entity_type,
                    field = %proposed.field,
                    "Query names a tenant other than the caller's; potential bypass attempt"
                );
                counter!(BYPASS_ATTEMPTS_TOTAL, "via" => "query").increment(1);
                return Err(BastionError::forbidden(format!(
                    "spoofed {} predicate on {}",
                    proposed.field, entity_type
                )));
            }
        }

        let mut predicates = required;
        predicates.extend(
            query
                .predicates
                .into_iter()
                .filter(|p| !tenant_fields(scope).contains(&p.field)),
        );

        Ok(ScopedQuery {
            entity_type: entity_type.to_string(),
            scope,
            predicates,
        })
    }

    /// [`ScopedAccessGuard::assert_scoped`] against the task's installed context.
    pub fn assert_scoped_current(&self, entity_type: &str, query: Query) -> Result<ScopedQuery> {
        let ctx = TenantContext::current()?;
        self.assert_scoped(entity_type, query, Some(&ctx))
    }
}

fn tenant_fields(scope: TenantScope) -> &'static [Field] {
    match scope {
        TenantScope::Unscoped => &[],
        TenantScope::Organization => &[Field::OrganizationId],
        TenantScope::Workspace => &[Field::OrganizationId, Field::WorkspaceId],
    }
}

// ═══════════════════════════════════════════════════════════════════════════════
// Entity storage
// ═══════════════════════════════════════════════════════════════════════════════

/// A stored business entity with its tenant keys.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct EntityRecord {
    pub entity_type: String,
    pub id: EntityId,
    pub organization_id: OrganizationId,
    #[serde(default)]
    pub workspace_id: Option<WorkspaceId>,
    #[serde(default)]
    pub created_by: Option<UserId>,
    #[serde(default)]
    pub assignee: Option<UserId>,
    #[serde(default)]
    pub attributes: BTreeMap<String, String>,
}

impl EntityRecord {
    pub fn new(
        entity_type: impl Into<String>,
        id: impl Into<EntityId>,
        organization_id: impl Into<OrganizationId>,
        workspace_id: Option<WorkspaceId>,
    ) -> Self {
        Self {
            entity_type: entity_type.into(),
            id: id.into(),
            organization_id: organization_id.into(),
            workspace_id,
            created_by: None,
            assignee: None,
            attributes: BTreeMap::new(),
        }
    }

    pub fn created_by(mut self, user: impl Into<UserId>) -> Self {
        self.created_by = Some(user.into());
        self
    }

    pub fn assigned_to(mut self, user: impl Into<UserId>) -> Self {
        self.assignee = Some(user.into());
        self
    }

    pub fn with_attribute(mut self, key: impl Into<String>, value: impl Into<String>) -> Self {
        self.attributes.insert(key.into(), value.into());
        self
    }

    pub fn ownership(&self) -> EntityOwnership {
        EntityOwnership {
            created_by: self.created_by.clone(),
            assignee: self.assignee.clone(),
        }
    }

    fn field_value(&self, field: &Field) -> Option<&str> {
        match field {
            Field::Id => Some(self.id.as_str()),
            Field::OrganizationId => Some(self.organization_id.as_str()),
            Field::WorkspaceId => self.workspace_id.as_ref().map(WorkspaceId::as_str),
            Field::Attribute(name) => self.attributes.get(name).map(String::as_str),
        }
    }
}

/// Entity storage contract. Reads accept only scoped queries.
#[async_trait]
pub trait EntityStore: Send + Sync {
    async fn find(&self, query: &ScopedQuery) -> Result<Vec<EntityRecord>>;

    async fn find_one(&self, query: &ScopedQuery) -> Result<Option<EntityRecord>> {
        Ok(self.find(query).await?.into_iter().next())
    }

    /// Set an attribute on every record matching `query`; returns how many changed.
    async fn set_attribute(&self, query: &ScopedQuery, key: &str, value: &str) -> Result<usize>;

    /// Whether an entity with this id exists under any tenant.
    ///
    /// Used only to tell `NotFound` apart from `Forbidden`; never returns data.
    async fn exists_in_any_tenant(&self, entity_type: &str, id: &EntityId) -> Result<bool>;
}

/// Seed data for [`InMemoryEntityStore`]: the `[[entities]]` tables of a
/// fixtures file. Other tables in the same file are ignored.
#[derive(Debug, Clone, Default, Deserialize)]
pub struct EntityFixtures {
    #[serde(default)]
    pub entities: Vec<EntityRecord>,
}

impl EntityFixtures {
    pub fn from_toml_str(s: &str) -> Result<Self> {
        Ok(toml::from_str(s)?)
    }

    pub fn from_file(path: impl AsRef<Path>) -> Result<Self> {
        let raw = std::fs::read_to_string(path.as_ref())?;
        Self::from_toml_str(&raw)
    }
}

/// DashMap-backed reference store.
#[derive(Debug, Default)]
pub struct InMemoryEntityStore {
    records: DashMap<(String, EntityId), EntityRecord>,
}

impl InMemoryEntityStore {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn from_fixtures(fixtures: EntityFixtures) -> Self {
        let store = Self::new();
        for record in fixtures.entities {
            store.insert(record);
        }
        store
    }

    pub fn insert(&self, record: EntityRecord) {
        self.records
            .insert((record.entity_type.clone(), record.id.clone()), record);
    }

    pub fn len(&self) -> usize {
        self.records.len()
    }

    pub fn is_empty(&self) -> bool {
        self.records.is_empty()
    }
}

#[async_trait]
impl EntityStore for InMemoryEntityStore {
    async fn find(&self, query: &ScopedQuery) -> Result<Vec<EntityRecord>> {
        tokio::task::yield_now().await;
        let mut found: Vec<EntityRecord> = self
            .records
            .iter()
            .filter(|entry| query.matches(entry.value()))
            .map(|entry| entry.value().clone())
            .collect();
        found.sort_by(|a, b| a.id.as_str().cmp(b.id.as_str()));
        Ok(found)
    }

    async fn set_attribute(&self, query: &ScopedQuery, key: &str, value: &str) -> Result<usize> {
        tokio::task::yield_now().await;
        let mut changed = 0;
        for mut entry in self.records.iter_mut() {
            if query.matches(entry.value()) {
                entry
                    .value_mut()
                    .attributes
                    .insert(key.to_string(), value.to_string());
                changed += 1;
            }
        }
        Ok(changed)
    }

    async fn exists_in_any_tenant(&self, entity_type: &str, id: &EntityId) -> Result<bool> {
        Ok(self
            .records
            .contains_key(&(entity_type.to_string(), id.clone())))
    }
}

// ═══════════════════════════════════════════════════════════════════════════════
// Tests
// ═══════════════════════════════════════════════════════════════════════════════
