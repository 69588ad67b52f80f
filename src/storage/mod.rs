// Directory store: the tenant-scoped repository contract over the hosted
// backend. Backends publish their change log to an attached feed hub.

mod memory;
mod sqlite;

use crate::config::StorageConfig;
use crate::feed::{ChangeEvent, FeedHub, FeedOp, FeedTable};
use crate::model::{
    ContactRecord, ConversationRecord, ConversationStateRecord, ConversationStatus,
    MediaDescriptor, MessageDirection, MessageRecord, StageRecord, TenantContext,
};
use anyhow::{anyhow, Result};
use serde::Serialize;
use serde_json::Value;
use std::sync::Arc;

pub use memory::MemoryDirectoryStore;
pub use sqlite::SqliteDirectoryStore;

/// Inbox/list filter. `status: None` means any status; the inbox default
/// is active conversations across all departments.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ConversationFilter {
    pub department: Option<String>,
    pub status: Option<ConversationStatus>,
}

impl Default for ConversationFilter {
    fn default() -> Self {
        Self {
            department: None,
            status: Some(ConversationStatus::Active),
        }
    }
}

impl ConversationFilter {
    pub fn matches(&self, record: &ConversationRecord) -> bool {
        if let Some(status) = self.status {
            if record.status != status {
                return false;
            }
        }
        if let Some(department) = &self.department {
            if record.department.as_deref() != Some(department.as_str()) {
                return false;
            }
        }
        true
    }
}

pub trait DirectoryStore: Send + Sync {
    fn ensure_initialized(&self) -> Result<()>;

    fn upsert_conversation(&self, tenant: &TenantContext, record: &ConversationRecord)
        -> Result<()>;
    fn get_conversation(
        &self,
        tenant: &TenantContext,
        conversation_id: &str,
    ) -> Result<Option<ConversationRecord>>;
    fn get_conversation_by_phone(
        &self,
        tenant: &TenantContext,
        phone: &str,
    ) -> Result<Option<ConversationRecord>>;
    fn list_conversations(
        &self,
        tenant: &TenantContext,
        filter: &ConversationFilter,
    ) -> Result<Vec<ConversationRecord>>;
    fn update_conversation_stage(
        &self,
        tenant: &TenantContext,
        conversation_id: &str,
        stage_id: Option<&str>,
        now: f64,
    ) -> Result<ConversationRecord>;
    fn update_conversation_status(
        &self,
        tenant: &TenantContext,
        conversation_id: &str,
        status: ConversationStatus,
        now: f64,
    ) -> Result<ConversationRecord>;

    fn get_conversation_state(
        &self,
        tenant: &TenantContext,
        phone: &str,
    ) -> Result<Option<ConversationStateRecord>>;
    fn list_conversation_states(
        &self,
        tenant: &TenantContext,
    ) -> Result<Vec<ConversationStateRecord>>;
    fn upsert_conversation_state(
        &self,
        tenant: &TenantContext,
        record: &ConversationStateRecord,
    ) -> Result<()>;
    /// Flips the ownership flag on an existing state row. The row is
    /// created by the AI pipeline, never by this core; a missing row is
    /// an error surfaced to the caller. `takeover_at: None` leaves the
    /// audit timestamp untouched.
    fn set_conversation_ownership(
        &self,
        tenant: &TenantContext,
        phone: &str,
        is_ai_active: bool,
        operator_id: Option<&str>,
        takeover_at: Option<f64>,
        now: f64,
    ) -> Result<ConversationStateRecord>;

    fn upsert_stage(&self, tenant: &TenantContext, record: &StageRecord) -> Result<()>;
    fn get_stage(&self, tenant: &TenantContext, stage_id: &str) -> Result<Option<StageRecord>>;
    fn list_stages(
        &self,
        tenant: &TenantContext,
        department: Option<&str>,
    ) -> Result<Vec<StageRecord>>;
    fn delete_stage(&self, tenant: &TenantContext, stage_id: &str) -> Result<bool>;

    fn upsert_contact(&self, tenant: &TenantContext, record: &ContactRecord) -> Result<()>;
    fn get_contact(
        &self,
        tenant: &TenantContext,
        contact_id: &str,
    ) -> Result<Option<ContactRecord>>;

    fn append_message(
        &self,
        tenant: &TenantContext,
        conversation_id: &str,
        direction: MessageDirection,
        body: Option<&str>,
        media: Option<&MediaDescriptor>,
        now: f64,
    ) -> Result<MessageRecord>;
    /// Most recent `limit` messages, returned ascending by numeric id.
    fn list_recent_messages(
        &self,
        tenant: &TenantContext,
        conversation_id: &str,
        limit: i64,
    ) -> Result<Vec<MessageRecord>>;
}

/// Ownership argument check shared by all backends: operator_id must be
/// present exactly when the AI is inactive.
pub(crate) fn validate_ownership_args(
    is_ai_active: bool,
    operator_id: Option<&str>,
) -> Result<()> {
    match (is_ai_active, operator_id) {
        (true, None) | (false, Some(_)) => Ok(()),
        (true, Some(_)) => Err(anyhow!("operator_id must be null while the AI is active")),
        (false, None) => Err(anyhow!("operator_id is required when the AI is inactive")),
    }
}

pub(crate) fn publish_change<T: Serialize>(
    feed: Option<&Arc<FeedHub>>,
    table: FeedTable,
    op: FeedOp,
    tenant_id: &str,
    entity_id: &str,
    record: &T,
) {
    let Some(hub) = feed else {
        return;
    };
    let row = serde_json::to_value(record).unwrap_or(Value::Null);
    hub.publish(ChangeEvent {
        table,
        op,
        tenant_id: tenant_id.to_string(),
        entity_id: entity_id.to_string(),
        row,
    });
}

/// Builds the configured backend and attaches the feed hub its change
/// log publishes into.
pub fn build_storage(
    config: &StorageConfig,
    feed: Arc<FeedHub>,
) -> Result<Arc<dyn DirectoryStore>> {
    let backend = config.backend.trim().to_lowercase();
    let backend = if backend.is_empty() {
        "sqlite".to_string()
    } else {
        backend
    };
    match backend.as_str() {
        "sqlite" | "default" => Ok(Arc::new(
            SqliteDirectoryStore::new(config.db_path.trim().to_string()).with_feed(feed),
        )),
        "memory" => Ok(Arc::new(MemoryDirectoryStore::new().with_feed(feed))),
        other => Err(anyhow!("unknown storage backend: {other}")),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn filter_defaults_to_active_any_department() {
        let filter = ConversationFilter::default();
        let mut record = ConversationRecord {
            conversation_id: "c1".to_string(),
            tenant_id: "t1".to_string(),
            phone: "5511999990000".to_string(),
            contact_id: None,
            department: Some("vendas".to_string()),
            stage_id: None,
            status: ConversationStatus::Active,
            last_message_at: 0.0,
            created_at: 0.0,
            updated_at: 0.0,
        };
        assert!(filter.matches(&record));
        record.status = ConversationStatus::Closed;
        assert!(!filter.matches(&record));
    }

    #[test]
    fn filter_department_is_exact() {
        let filter = ConversationFilter {
            department: Some("locacao".to_string()),
            status: None,
        };
        let record = ConversationRecord {
            conversation_id: "c1".to_string(),
            tenant_id: "t1".to_string(),
            phone: "5511999990000".to_string(),
            contact_id: None,
            department: Some("vendas".to_string()),
            stage_id: None,
            status: ConversationStatus::Archived,
            last_message_at: 0.0,
            created_at: 0.0,
            updated_at: 0.0,
        };
        assert!(!filter.matches(&record));
    }

    #[test]
    fn ownership_args_reject_hybrid_rows() {
        assert!(validate_ownership_args(true, None).is_ok());
        assert!(validate_ownership_args(false, Some("op_1")).is_ok());
        assert!(validate_ownership_args(true, Some("op_1")).is_err());
        assert!(validate_ownership_args(false, None).is_err());
    }
}
