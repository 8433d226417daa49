//! Built-in autonomous actions.

use async_trait::async_trait;
use serde_json::{json, Value};
use std::sync::Arc;

use crate::error::Result;
use crate::tenancy::{
    Action, ActionHandler, EntityRef, EntityStore, Field, Impact, Preview, Query,
    ScopedAccessGuard, ScopedQuery, TenantContext,
};

const STATUS_ATTRIBUTE: &str = "status";
const ARCHIVED: &str = "archived";

/// Entity type and collection segment of every archivable workspace entity.
pub const ARCHIVABLE: [(&str, &str); 4] = [
    ("project", "projects"),
    ("task", "tasks"),
    ("document", "documents"),
    ("form", "forms"),
];

/// One archive handler per entry of [`ARCHIVABLE`].
pub fn standard_handlers(
    guard: &ScopedAccessGuard,
    store: &Arc<dyn EntityStore>,
) -> Vec<Arc<dyn ActionHandler>> {
    ARCHIVABLE
        .iter()
        .map(|(entity_type, collection)| {
            Arc::new(ArchiveEntitiesHandler::new(
                entity_type,
                collection,
                guard.clone(),
                store.clone(),
            )) as Arc<dyn ActionHandler>
        })
        .collect()
}

/// Marks every entity of one type in the caller's workspace as archived,
/// optionally narrowed by a `status` filter in the params.
pub struct ArchiveEntitiesHandler {
    name: String,
    route: String,
    entity_type: String,
    guard: ScopedAccessGuard,
    store: Arc<dyn EntityStore>,
}

impl ArchiveEntitiesHandler {
    pub fn new(
        entity_type: &str,
        collection: &str,
        guard: ScopedAccessGuard,
        store: Arc<dyn EntityStore>,
    ) -> Self {
        Self {
            name: format!("archive_{}", collection),
            route: format!("/workspaces/:id/{}", collection),
            entity_type: entity_type.to_string(),
            guard,
            store,
        }
    }

    fn scoped(&self, params: &Value, ctx: &TenantContext) -> Result<ScopedQuery> {
        let mut query = Query::new();
        if let Some(status) = params.get(STATUS_ATTRIBUTE).and_then(Value::as_str) {
            query = query.filter(Field::Attribute(STATUS_ATTRIBUTE.to_string()), status);
        }
        self.guard.assert_scoped(&self.entity_type, query, Some(ctx))
    }
}

#[async_trait]
impl ActionHandler for ArchiveEntitiesHandler {
    fn name(&self) -> &str {
        &self.name
    }

    fn route(&self) -> &str {
        &self.route
    }

    fn required_action(&self) -> Action {
        Action::Manage
    }

    async fn preview(&self, params: &Value, ctx: &TenantContext) -> Result<Preview> {
        let scoped = self.scoped(params, ctx)?;
        let affected: Vec<EntityRef> = self
            .store
            .find(&scoped)
            .await?
            .into_iter()
            .map(|record| EntityRef {
                entity_type: record.entity_type,
                id: record.id,
            })
            .collect();

        Ok(Preview {
            description: format!("Archive {} {} record(s)", affected.len(), self.entity_type),
            estimated_impact: Impact::from_count(affected.len()),
            affected_entities: affected,
        })
    }

    async fn execute(&self, params: &Value, ctx: &TenantContext) -> Result<Value> {
        let scoped = self.scoped(params, ctx)?;
        let archived = self
            .store
            .set_attribute(&scoped, STATUS_ATTRIBUTE, ARCHIVED)
            .await?;
        Ok(json!({ "archived": archived, "entity_type": self.entity_type }))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::tenancy::{
        EntityRecord, EntityRegistry, InMemoryEntityStore, OrganizationId, PlatformRole, UserId,
        WorkspaceId,
    };

    #[tokio::test]
    async fn test_archive_touches_only_own_workspace() {
        let store = Arc::new(InMemoryEntityStore::new());
        store.insert(EntityRecord::new("task", "t1", "org-a", Some(WorkspaceId::new("w1"))).with_attribute("status", "done"));
        store.insert(EntityRecord::new("task", "t2", "org-a", Some(WorkspaceId::new("w1"))).with_attribute("status", "open"));
        store.insert(EntityRecord::new("task", "t3", "org-b", Some(WorkspaceId::new("w2"))).with_attribute("status", "done"));

        let guard = ScopedAccessGuard::new(Arc::new(EntityRegistry::standard()));
        let handler = ArchiveEntitiesHandler::new("task", "tasks", guard, store.clone());
        assert_eq!(handler.name(), "archive_tasks");

        let ctx = TenantContext::establish(
            UserId::new("u1"),
            Some(OrganizationId::new("org-a")),
            Some(WorkspaceId::new("w1")),
            PlatformRole::Member,
        )
        .unwrap();
        let params = json!({ "status": "done" });

        let preview = handler.preview(&params, &ctx).await.unwrap();
        assert_eq!(preview.affected_entities.len(), 1);
        assert_eq!(preview.affected_entities[0].id.as_str(), "t1");

        let output = handler.execute(&params, &ctx).await.unwrap();
        assert_eq!(output["archived"], 1);
    }

    #[test]
    fn test_standard_handlers_cover_archivable_collections() {
        let guard = ScopedAccessGuard::new(Arc::new(EntityRegistry::standard()));
        let store: Arc<dyn EntityStore> = Arc::new(InMemoryEntityStore::new());
        let names: Vec<String> = standard_handlers(&guard, &store)
            .iter()
            .map(|h| h.name().to_string())
            .collect();
        assert_eq!(
            names,
            ["archive_projects", "archive_tasks", "archive_documents", "archive_forms"]
        );
    }
}
