// Handoff controller: who owns a conversation, the AI or a human
// operator. Races between operators resolve by last writer wins; there
// is deliberately no locking or version check on the state row.

use crate::model::{now_ts, ConversationStateRecord, OwnershipIndicator, TenantContext};
use crate::storage::DirectoryStore;
use anyhow::{anyhow, Result};
use parking_lot::Mutex;
use std::collections::HashMap;
use std::sync::Arc;
use tracing::debug;

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum HandoffState {
    AiOwned,
    OperatorOwned { operator_id: String },
}

pub fn handoff_state(record: &ConversationStateRecord) -> HandoffState {
    match (&record.operator_id, record.is_ai_active) {
        (Some(operator_id), false) => HandoffState::OperatorOwned {
            operator_id: operator_id.clone(),
        },
        _ => HandoffState::AiOwned,
    }
}

/// Owns the AI_OWNED / OPERATOR_OWNED transition for conversations of
/// one tenant. Keeps a last-known-good cache per phone so a failed write
/// rolls the local view back instead of leaving an optimistic lie.
pub struct HandoffController {
    store: Arc<dyn DirectoryStore>,
    tenant: TenantContext,
    cache: Mutex<HashMap<String, ConversationStateRecord>>,
}

impl HandoffController {
    pub fn new(store: Arc<dyn DirectoryStore>, tenant: TenantContext) -> Self {
        Self {
            store,
            tenant,
            cache: Mutex::new(HashMap::new()),
        }
    }

    /// Cached view only; `Unknown` until a state row has been observed.
    /// Never blocks on a store read.
    pub fn indicator(&self, phone: &str) -> OwnershipIndicator {
        self.cache
            .lock()
            .get(phone.trim())
            .map(|record| record.ownership())
            .unwrap_or(OwnershipIndicator::Unknown)
    }

    pub fn cached_state(&self, phone: &str) -> Option<ConversationStateRecord> {
        self.cache.lock().get(phone.trim()).cloned()
    }

    pub fn refresh(&self, phone: &str) -> Result<Option<ConversationStateRecord>> {
        let cleaned = phone.trim();
        if cleaned.is_empty() {
            return Ok(None);
        }
        let record = self.store.get_conversation_state(&self.tenant, cleaned)?;
        let mut guard = self.cache.lock();
        match &record {
            Some(state) => {
                guard.insert(cleaned.to_string(), state.clone());
            }
            None => {
                guard.remove(cleaned);
            }
        }
        Ok(record)
    }

    /// Operator takes the conversation from the AI. Idempotent when the
    /// same operator already owns it; a different owner is overwritten
    /// (last writer wins). The state row is created by the AI pipeline,
    /// never here.
    pub fn takeover(&self, phone: &str, operator_id: &str) -> Result<ConversationStateRecord> {
        let cleaned = phone.trim();
        let operator = operator_id.trim();
        if cleaned.is_empty() || operator.is_empty() {
            return Err(anyhow!("phone or operator_id is empty"));
        }
        let current = self
            .store
            .get_conversation_state(&self.tenant, cleaned)?
            .ok_or_else(|| anyhow!("conversation state not found: {cleaned}"))?;
        if !current.is_ai_active && current.operator_id.as_deref() == Some(operator) {
            self.cache
                .lock()
                .insert(cleaned.to_string(), current.clone());
            return Ok(current);
        }
        if !current.is_ai_active {
            debug!(
                phone = cleaned,
                previous = current.operator_id.as_deref().unwrap_or(""),
                operator,
                "takeover overwrites current owner"
            );
        }
        let now = now_ts();
        let mut optimistic = current.clone();
        optimistic.is_ai_active = false;
        optimistic.operator_id = Some(operator.to_string());
        optimistic.operator_takeover_at = Some(now);
        optimistic.updated_at = now;
        self.cache.lock().insert(cleaned.to_string(), optimistic);
        match self.store.set_conversation_ownership(
            &self.tenant,
            cleaned,
            false,
            Some(operator),
            Some(now),
            now,
        ) {
            Ok(updated) => {
                self.cache
                    .lock()
                    .insert(cleaned.to_string(), updated.clone());
                Ok(updated)
            }
            Err(err) => {
                // Roll back to the last known-good value; no retry.
                self.cache.lock().insert(cleaned.to_string(), current);
                Err(err)
            }
        }
    }

    /// Hands the conversation back to the AI. `operator_takeover_at` is
    /// kept as the audit trail of the most recent handoff.
    pub fn give_back(&self, phone: &str) -> Result<ConversationStateRecord> {
        let cleaned = phone.trim();
        if cleaned.is_empty() {
            return Err(anyhow!("phone is empty"));
        }
        let current = self
            .store
            .get_conversation_state(&self.tenant, cleaned)?
            .ok_or_else(|| anyhow!("conversation state not found: {cleaned}"))?;
        if current.is_ai_active {
            self.cache
                .lock()
                .insert(cleaned.to_string(), current.clone());
            return Ok(current);
        }
        let now = now_ts();
        let mut optimistic = current.clone();
        optimistic.is_ai_active = true;
        optimistic.operator_id = None;
        optimistic.updated_at = now;
        self.cache.lock().insert(cleaned.to_string(), optimistic);
        match self
            .store
            .set_conversation_ownership(&self.tenant, cleaned, true, None, None, now)
        {
            Ok(updated) => {
                self.cache
                    .lock()
                    .insert(cleaned.to_string(), updated.clone());
                Ok(updated)
            }
            Err(err) => {
                self.cache.lock().insert(cleaned.to_string(), current);
                Err(err)
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::model::TriageStage;
    use crate::storage::MemoryDirectoryStore;
    use serde_json::json;
    use std::sync::atomic::{AtomicBool, Ordering};

    fn tenant() -> TenantContext {
        TenantContext::new("t1")
    }

    fn seed_state(store: &MemoryDirectoryStore, phone: &str) {
        store
            .upsert_conversation_state(
                &tenant(),
                &ConversationStateRecord {
                    tenant_id: "t1".to_string(),
                    phone: phone.to_string(),
                    is_ai_active: true,
                    operator_id: None,
                    operator_takeover_at: None,
                    triage_stage: TriageStage::AwaitingTriage,
                    ai_payload: json!({ "pending_properties": [] }),
                    updated_at: now_ts(),
                },
            )
            .unwrap();
    }

    #[test]
    fn takeover_then_give_back_round_trips() {
        let store = Arc::new(MemoryDirectoryStore::new());
        seed_state(&store, "5511999990000");
        let controller = HandoffController::new(store.clone(), tenant());

        let taken = controller.takeover("5511999990000", "op_1").unwrap();
        assert!(!taken.is_ai_active);
        assert_eq!(taken.operator_id.as_deref(), Some("op_1"));
        assert!(taken.operator_takeover_at.is_some());
        assert!(taken.is_consistent());
        let takeover_at = taken.operator_takeover_at;

        let returned = controller.give_back("5511999990000").unwrap();
        assert!(returned.is_ai_active);
        assert_eq!(returned.operator_id, None);
        // Audit trail survives the return.
        assert_eq!(returned.operator_takeover_at, takeover_at);
        assert!(returned.is_consistent());
    }

    #[test]
    fn takeover_is_idempotent_for_same_operator() {
        let store = Arc::new(MemoryDirectoryStore::new());
        seed_state(&store, "5511999990000");
        let controller = HandoffController::new(store.clone(), tenant());

        let first = controller.takeover("5511999990000", "op_1").unwrap();
        let second = controller.takeover("5511999990000", "op_1").unwrap();
        assert_eq!(first.operator_takeover_at, second.operator_takeover_at);
    }

    #[test]
    fn concurrent_takeover_resolves_last_writer_wins() {
        let store = Arc::new(MemoryDirectoryStore::new());
        seed_state(&store, "5511999990000");
        let controller = HandoffController::new(store.clone(), tenant());

        controller.takeover("5511999990000", "op_a").unwrap();
        let final_state = controller.takeover("5511999990000", "op_b").unwrap();
        assert_eq!(final_state.operator_id.as_deref(), Some("op_b"));
        assert!(!final_state.is_ai_active);
        assert!(final_state.is_consistent());
    }

    #[test]
    fn give_back_is_noop_when_ai_already_owns() {
        let store = Arc::new(MemoryDirectoryStore::new());
        seed_state(&store, "5511999990000");
        let controller = HandoffController::new(store.clone(), tenant());
        let state = controller.give_back("5511999990000").unwrap();
        assert!(state.is_ai_active);
        assert_eq!(state.operator_takeover_at, None);
    }

    #[test]
    fn missing_state_row_is_an_error_not_a_create() {
        let store = Arc::new(MemoryDirectoryStore::new());
        let controller = HandoffController::new(store, tenant());
        let err = controller.takeover("5511999990000", "op_1").unwrap_err();
        assert!(err.to_string().contains("not found"));
    }

    #[test]
    fn failed_write_rolls_back_local_state() {
        struct FailingWrites {
            inner: MemoryDirectoryStore,
            fail: AtomicBool,
        }

        impl DirectoryStore for FailingWrites {
            fn ensure_initialized(&self) -> Result<()> {
                self.inner.ensure_initialized()
            }
            fn upsert_conversation(
                &self,
                tenant: &TenantContext,
                record: &crate::model::ConversationRecord,
            ) -> Result<()> {
                self.inner.upsert_conversation(tenant, record)
            }
            fn get_conversation(
                &self,
                tenant: &TenantContext,
                conversation_id: &str,
            ) -> Result<Option<crate::model::ConversationRecord>> {
                self.inner.get_conversation(tenant, conversation_id)
            }
            fn get_conversation_by_phone(
                &self,
                tenant: &TenantContext,
                phone: &str,
            ) -> Result<Option<crate::model::ConversationRecord>> {
                self.inner.get_conversation_by_phone(tenant, phone)
            }
            fn list_conversations(
                &self,
                tenant: &TenantContext,
                filter: &crate::storage::ConversationFilter,
            ) -> Result<Vec<crate::model::ConversationRecord>> {
                self.inner.list_conversations(tenant, filter)
            }
            fn update_conversation_stage(
                &self,
                tenant: &TenantContext,
                conversation_id: &str,
                stage_id: Option<&str>,
                now: f64,
            ) -> Result<crate::model::ConversationRecord> {
                self.inner
                    .update_conversation_stage(tenant, conversation_id, stage_id, now)
            }
            fn update_conversation_status(
                &self,
                tenant: &TenantContext,
                conversation_id: &str,
                status: crate::model::ConversationStatus,
                now: f64,
            ) -> Result<crate::model::ConversationRecord> {
                self.inner
                    .update_conversation_status(tenant, conversation_id, status, now)
            }
            fn get_conversation_state(
                &self,
                tenant: &TenantContext,
                phone: &str,
            ) -> Result<Option<ConversationStateRecord>> {
                self.inner.get_conversation_state(tenant, phone)
            }
            fn list_conversation_states(
                &self,
                tenant: &TenantContext,
            ) -> Result<Vec<ConversationStateRecord>> {
                self.inner.list_conversation_states(tenant)
            }
            fn upsert_conversation_state(
                &self,
                tenant: &TenantContext,
                record: &ConversationStateRecord,
            ) -> Result<()> {
                self.inner.upsert_conversation_state(tenant, record)
            }
            fn set_conversation_ownership(
                &self,
                tenant: &TenantContext,
                phone: &str,
                is_ai_active: bool,
                operator_id: Option<&str>,
                takeover_at: Option<f64>,
                now: f64,
            ) -> Result<ConversationStateRecord> {
                if self.fail.load(Ordering::SeqCst) {
                    return Err(anyhow!("storage unavailable"));
                }
                self.inner.set_conversation_ownership(
                    tenant,
                    phone,
                    is_ai_active,
                    operator_id,
                    takeover_at,
                    now,
                )
            }
            fn upsert_stage(
                &self,
                tenant: &TenantContext,
                record: &crate::model::StageRecord,
            ) -> Result<()> {
                self.inner.upsert_stage(tenant, record)
            }
            fn get_stage(
                &self,
                tenant: &TenantContext,
                stage_id: &str,
            ) -> Result<Option<crate::model::StageRecord>> {
                self.inner.get_stage(tenant, stage_id)
            }
            fn list_stages(
                &self,
                tenant: &TenantContext,
                department: Option<&str>,
            ) -> Result<Vec<crate::model::StageRecord>> {
                self.inner.list_stages(tenant, department)
            }
            fn delete_stage(&self, tenant: &TenantContext, stage_id: &str) -> Result<bool> {
                self.inner.delete_stage(tenant, stage_id)
            }
            fn upsert_contact(
                &self,
                tenant: &TenantContext,
                record: &crate::model::ContactRecord,
            ) -> Result<()> {
                self.inner.upsert_contact(tenant, record)
            }
            fn get_contact(
                &self,
                tenant: &TenantContext,
                contact_id: &str,
            ) -> Result<Option<crate::model::ContactRecord>> {
                self.inner.get_contact(tenant, contact_id)
            }
            fn append_message(
                &self,
                tenant: &TenantContext,
                conversation_id: &str,
                direction: crate::model::MessageDirection,
                body: Option<&str>,
                media: Option<&crate::model::MediaDescriptor>,
                now: f64,
            ) -> Result<crate::model::MessageRecord> {
                self.inner
                    .append_message(tenant, conversation_id, direction, body, media, now)
            }
            fn list_recent_messages(
                &self,
                tenant: &TenantContext,
                conversation_id: &str,
                limit: i64,
            ) -> Result<Vec<crate::model::MessageRecord>> {
                self.inner
                    .list_recent_messages(tenant, conversation_id, limit)
            }
        }

        let store = Arc::new(FailingWrites {
            inner: MemoryDirectoryStore::new(),
            fail: AtomicBool::new(false),
        });
        seed_state(&store.inner, "5511999990000");
        let controller = HandoffController::new(store.clone(), tenant());
        controller.refresh("5511999990000").unwrap();
        assert_eq!(
            controller.indicator("5511999990000"),
            OwnershipIndicator::AiActive
        );

        store.fail.store(true, Ordering::SeqCst);
        let err = controller.takeover("5511999990000", "op_1").unwrap_err();
        assert!(err.to_string().contains("unavailable"));
        // Optimistic flip rolled back to last known good.
        assert_eq!(
            controller.indicator("5511999990000"),
            OwnershipIndicator::AiActive
        );
        let cached = controller.cached_state("5511999990000").unwrap();
        assert!(cached.is_ai_active);
        assert_eq!(cached.operator_id, None);
    }

    #[test]
    fn indicator_defaults_to_unknown() {
        let store = Arc::new(MemoryDirectoryStore::new());
        let controller = HandoffController::new(store, tenant());
        assert_eq!(
            controller.indicator("5511999990000"),
            OwnershipIndicator::Unknown
        );
    }
}
