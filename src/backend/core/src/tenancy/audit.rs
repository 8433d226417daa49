//! Preview / confirm / execute for autonomous actions, with audit records.
//!
//! An action is previewed first, then executed only when the caller passes an
//! explicit confirmation. Each execution that gets past confirmation writes an
//! [`AuditRecord`] before the caller hears back, whether it succeeded, failed
//! or was denied. A failed audit write never hides the fact that the action
//! ran: it is logged at `error`, counted, and reported on the receipt.

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use metrics::counter;
use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use tokio::sync::mpsc;
use tracing::{error, info};
use uuid::Uuid;

use super::context::TenantContext;
use super::decision::AccessService;
use super::models::{Action, EntityId, OrganizationId, RequestId, UserId, WorkspaceId};
use crate::error::{BastionError, Result};
use crate::telemetry::AUDIT_WRITE_FAILURES_TOTAL;

// ═══════════════════════════════════════════════════════════════════════════════
// Preview
// ═══════════════════════════════════════════════════════════════════════════════

/// Reference to an entity an action would touch.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct EntityRef {
    pub entity_type: String,
    pub id: EntityId,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Impact {
    Low,
    Medium,
    High,
}

impl Impact {
    /// Rough impact by number of affected entities.
    pub fn from_count(count: usize) -> Self {
        match count {
            0..=10 => Self::Low,
            11..=100 => Self::Medium,
            _ => Self::High,
        }
    }
}

/// What an action would do if executed.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Preview {
    pub description: String,
    pub affected_entities: Vec<EntityRef>,
    pub estimated_impact: Impact,
}

/// A named, previewable action.
#[async_trait]
pub trait ActionHandler: Send + Sync {
    fn name(&self) -> &str;

    /// Policy route the action is authorized against.
    fn route(&self) -> &str;

    fn required_action(&self) -> Action;

    async fn preview(&self, params: &Value, ctx: &TenantContext) -> Result<Preview>;

    async fn execute(&self, params: &Value, ctx: &TenantContext) -> Result<Value>;
}

// ═══════════════════════════════════════════════════════════════════════════════
// Audit records and sinks
// ═══════════════════════════════════════════════════════════════════════════════

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "status", rename_all = "snake_case")]
pub enum AuditOutcome {
    Succeeded,
    Failed { reason: String },
    Denied { reason: String },
}

impl AuditOutcome {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Succeeded => "succeeded",
            Self::Failed { .. } => "failed",
            Self::Denied { .. } => "denied",
        }
    }
}

/// Append-only record of one action execution.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct AuditRecord {
    pub id: Uuid,
    pub timestamp: DateTime<Utc>,
    pub request_id: RequestId,
    pub actor: UserId,
    pub organization_id: OrganizationId,
    pub workspace_id: Option<WorkspaceId>,
    pub action: String,
    pub outcome: AuditOutcome,
}

impl AuditRecord {
    pub fn new(ctx: &TenantContext, action: impl Into<String>, outcome: AuditOutcome) -> Self {
        Self {
            id: Uuid::new_v4(),
            timestamp: Utc::now(),
            request_id: ctx.request_id(),
            actor: ctx.user_id().clone(),
            organization_id: ctx.organization_id().clone(),
            workspace_id: ctx.workspace_id().cloned(),
            action: action.into(),
            outcome,
        }
    }
}

/// Append-only audit destination.
#[async_trait]
pub trait AuditSink: Send + Sync {
    async fn write(&self, record: AuditRecord) -> Result<()>;
}

/// Keeps records in memory. Can be switched off to simulate an outage.
#[derive(Debug)]
pub struct InMemoryAuditSink {
    records: Mutex<Vec<AuditRecord>>,
    available: AtomicBool,
}

impl Default for InMemoryAuditSink {
    fn default() -> Self {
        Self {
            records: Mutex::new(Vec::new()),
            available: AtomicBool::new(true),
        }
    }
}

impl InMemoryAuditSink {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn set_available(&self, available: bool) {
        self.available.store(available, Ordering::SeqCst);
    }

    pub fn records(&self) -> Vec<AuditRecord> {
        self.records.lock().clone()
    }
}

#[async_trait]
impl AuditSink for InMemoryAuditSink {
    async fn write(&self, record: AuditRecord) -> Result<()> {
        if !self.available.load(Ordering::SeqCst) {
            return Err(BastionError::service_unavailable("audit_sink", "sink offline"));
        }
        self.records.lock().push(record);
        Ok(())
    }
}

/// Ships records to a background task that emits them as `audit` events.
///
/// `write` succeeds once the record is queued on the channel. Records still
/// queued when the process exits are lost; use a durable sink where that
/// matters. A full queue applies backpressure to the writer.
#[derive(Debug, Clone)]
pub struct TracingAuditSink {
    sender: mpsc::Sender<AuditRecord>,
}

impl TracingAuditSink {
    /// Spawn the drain task. Must be called inside a Tokio runtime.
    pub fn new(buffer: usize) -> Self {
        let (tx, mut rx) = mpsc::channel::<AuditRecord>(buffer.max(1));
        tokio::spawn(async move {
            while let Some(record) = rx.recv().await {
                info!(
                    target: "audit",
                    audit_id = %record.id,
                    request_id = %record.request_id,
                    actor = %record.actor,
                    organization_id = %record.organization_id,
                    workspace_id = record.workspace_id.as_ref().map(|w| w.as_str()).unwrap_or("-"),
                    action = %record.action,
                    outcome = record.outcome.as_str(),
                    "AUDIT"
                );
            }
        });
        Self { sender: tx }
    }
}

#[async_trait]
impl AuditSink for TracingAuditSink {
    async fn write(&self, record: AuditRecord) -> Result<()> {
        self.sender.send(record).await.map_err(|e| {
            BastionError::service_unavailable("audit_sink", format!("audit channel closed: {}", e))
        })
    }
}

// ═══════════════════════════════════════════════════════════════════════════════
// Collaborator
// ═══════════════════════════════════════════════════════════════════════════════

/// Whether the audit record for an execution was written.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum AuditStatus {
    Recorded,
    Failed,
}

/// Result of a confirmed, authorized execution.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct ExecutionReceipt {
    pub action: String,
    pub output: Value,
    pub audit_id: Uuid,
    pub audit: AuditStatus,
}

/// Registry of action handlers plus the preview/execute protocol.
#[derive(Clone)]
pub struct ActionCollaborator {
    handlers: HashMap<String, Arc<dyn ActionHandler>>,
    access: AccessService,
    sink: Arc<dyn AuditSink>,
}

impl ActionCollaborator {
    pub fn new(access: AccessService, sink: Arc<dyn AuditSink>) -> Self {
        Self {
            handlers: HashMap::new(),
            access,
            sink,
        }
    }

    pub fn register(&mut self, handler: Arc<dyn ActionHandler>) {
        self.handlers.insert(handler.name().to_string(), handler);
    }

    pub fn with_handler(mut self, handler: Arc<dyn ActionHandler>) -> Self {
        self.register(handler);
        self
    }

    pub fn action_names(&self) -> Vec<&str> {
        let mut names: Vec<&str> = self.handlers.keys().map(String::as_str).collect();
        names.sort_unstable();
        names
    }

    fn handler(&self, action: &str) -> Result<Arc<dyn ActionHandler>> {
        self.handlers
            .get(action)
            .cloned()
            .ok_or_else(|| BastionError::unknown_action(action))
    }

    fn target_workspace(ctx: &TenantContext) -> Result<WorkspaceId> {
        ctx.workspace_id()
            .cloned()
            .ok_or_else(|| BastionError::missing_context("actions require a workspace in context"))
    }

    /// Describe what `action` would do. Requires the same permission as executing it.
    pub async fn preview(&self, action: &str, params: &Value, ctx: &TenantContext) -> Result<Preview> {
        let handler = self.handler(action)?;
        let workspace_id = Self::target_workspace(ctx)?;
        self.access
            .enforce(ctx, &workspace_id, handler.required_action(), handler.route())
            .await?;
        handler.preview(params, ctx).await
    }

    /// Run `action` if `confirmed` is exactly `true`, writing an audit record.
    ///
    /// An unconfirmed call is refused with `NotConfirmed` before anything
    /// happens, so no record is written for it, even if the action was
    /// previewed earlier.
    pub async fn execute(
        &self,
        action: &str,
        params: &Value,
        ctx: &TenantContext,
        confirmed: bool,
    ) -> Result<ExecutionReceipt> {
        let handler = self.handler(action)?;
        if !confirmed {
            info!(
                request_id = %ctx.request_id(),
                user_id = %ctx.user_id(),
                action = action,
                "Execution refused without confirmation"
            );
            return Err(BastionError::not_confirmed(action));
        }

        let workspace_id = Self::target_workspace(ctx)?;
        let decision = self
            .access
            .evaluate(ctx, &workspace_id, handler.required_action(), handler.route())
            .await;
        if !decision.allowed {
            let record = AuditRecord::new(
                ctx,
                action,
                AuditOutcome::Denied {
                    reason: decision.reason.to_string(),
                },
            );
            self.record(record).await;
            return Err(decision.into_error());
        }

        let result = handler.execute(params, ctx).await;
        let outcome = match &result {
            Ok(_) => AuditOutcome::Succeeded,
            Err(err) => AuditOutcome::Failed {
                reason: err.to_string(),
            },
        };
        let record = AuditRecord::new(ctx, action, outcome);
        let audit_id = record.id;
        let audit = self.record(record).await;

        let output = result?;
        Ok(ExecutionReceipt {
            action: action.to_string(),
            output,
            audit_id,
            audit,
        })
    }

    async fn record(&self, record: AuditRecord) -> AuditStatus {
        let (audit_id, action, outcome) = (record.id, record.action.clone(), record.outcome.as_str());
        match self.sink.write(record).await {
            Ok(()) => AuditStatus::Recorded,
            Err(err) => {
                error!(
                    audit_id = %audit_id,
                    action = %action,
                    outcome = outcome,
                    error = %err,
                    "Failed to write audit record; the action outcome stands"
                );
                counter!(AUDIT_WRITE_FAILURES_TOTAL).increment(1);
                AuditStatus::Failed
            }
        }
    }
}

// ═══════════════════════════════════════════════════════════════════════════════
// Tests
// ═══════════════════════════════════════════════════════════════════════════════
