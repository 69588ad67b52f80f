// In-memory directory store, used by tests and embedded setups.

use crate::feed::{FeedHub, FeedOp, FeedTable};
use crate::model::{
    ContactRecord, ConversationRecord, ConversationStateRecord, ConversationStatus,
    MediaDescriptor, MessageDirection, MessageRecord, StageRecord, TenantContext,
};
use crate::storage::{
    publish_change, validate_ownership_args, ConversationFilter, DirectoryStore,
};
use anyhow::{anyhow, Result};
use parking_lot::Mutex;
use std::collections::HashMap;
use std::sync::Arc;

type Key = (String, String);

#[derive(Default)]
struct Inner {
    conversations: HashMap<Key, ConversationRecord>,
    states: HashMap<Key, ConversationStateRecord>,
    stages: HashMap<Key, StageRecord>,
    stage_seq: HashMap<Key, u64>,
    next_stage_seq: u64,
    contacts: HashMap<Key, ContactRecord>,
    messages: Vec<MessageRecord>,
    next_message_id: i64,
}

#[derive(Default)]
pub struct MemoryDirectoryStore {
    inner: Mutex<Inner>,
    feed: Option<Arc<FeedHub>>,
}

impl MemoryDirectoryStore {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_feed(mut self, feed: Arc<FeedHub>) -> Self {
        self.feed = Some(feed);
        self
    }

    fn key(tenant: &TenantContext, id: &str) -> Key {
        (tenant.tenant_id.clone(), id.to_string())
    }

    fn check_tenant(tenant: &TenantContext, record_tenant: &str) -> Result<()> {
        if tenant.tenant_id != record_tenant {
            return Err(anyhow!("record tenant does not match the session tenant"));
        }
        Ok(())
    }
}

impl DirectoryStore for MemoryDirectoryStore {
    fn ensure_initialized(&self) -> Result<()> {
        Ok(())
    }

    fn upsert_conversation(
        &self,
        tenant: &TenantContext,
        record: &ConversationRecord,
    ) -> Result<()> {
        Self::check_tenant(tenant, &record.tenant_id)?;
        let op = {
            let mut guard = self.inner.lock();
            let key = Self::key(tenant, &record.conversation_id);
            if let Some(stage_id) = &record.stage_id {
                if !guard.stages.contains_key(&Self::key(tenant, stage_id)) {
                    return Err(anyhow!("stage not found for tenant: {stage_id}"));
                }
            }
            match guard.conversations.get(&key) {
                Some(existing) => {
                    if existing.phone != record.phone {
                        return Err(anyhow!("conversation phone is immutable"));
                    }
                    guard.conversations.insert(key, record.clone());
                    FeedOp::Update
                }
                None => {
                    guard.conversations.insert(key, record.clone());
                    FeedOp::Insert
                }
            }
        };
        publish_change(
            self.feed.as_ref(),
            FeedTable::Conversations,
            op,
            &tenant.tenant_id,
            &record.conversation_id,
            record,
        );
        Ok(())
    }

    fn get_conversation(
        &self,
        tenant: &TenantContext,
        conversation_id: &str,
    ) -> Result<Option<ConversationRecord>> {
        let guard = self.inner.lock();
        Ok(guard
            .conversations
            .get(&Self::key(tenant, conversation_id))
            .cloned())
    }

    fn get_conversation_by_phone(
        &self,
        tenant: &TenantContext,
        phone: &str,
    ) -> Result<Option<ConversationRecord>> {
        let guard = self.inner.lock();
        Ok(guard
            .conversations
            .values()
            .find(|item| item.tenant_id == tenant.tenant_id && item.phone == phone)
            .cloned())
    }

    fn list_conversations(
        &self,
        tenant: &TenantContext,
        filter: &ConversationFilter,
    ) -> Result<Vec<ConversationRecord>> {
        let guard = self.inner.lock();
        let mut items = guard
            .conversations
            .values()
            .filter(|item| item.tenant_id == tenant.tenant_id && filter.matches(item))
            .cloned()
            .collect::<Vec<_>>();
        items.sort_by(|left, right| {
            right
                .last_message_at
                .total_cmp(&left.last_message_at)
                .then_with(|| left.conversation_id.cmp(&right.conversation_id))
        });
        Ok(items)
    }

    fn update_conversation_stage(
        &self,
        tenant: &TenantContext,
        conversation_id: &str,
        stage_id: Option<&str>,
        now: f64,
    ) -> Result<ConversationRecord> {
        let updated = {
            let mut guard = self.inner.lock();
            if let Some(stage_id) = stage_id {
                if !guard.stages.contains_key(&Self::key(tenant, stage_id)) {
                    return Err(anyhow!("stage not found for tenant: {stage_id}"));
                }
            }
            let record = guard
                .conversations
                .get_mut(&Self::key(tenant, conversation_id))
                .ok_or_else(|| anyhow!("conversation not found: {conversation_id}"))?;
            record.stage_id = stage_id.map(str::to_string);
            record.updated_at = now;
            record.clone()
        };
        publish_change(
            self.feed.as_ref(),
            FeedTable::Conversations,
            FeedOp::Update,
            &tenant.tenant_id,
            conversation_id,
            &updated,
        );
        Ok(updated)
    }

    fn update_conversation_status(
        &self,
        tenant: &TenantContext,
        conversation_id: &str,
        status: ConversationStatus,
        now: f64,
    ) -> Result<ConversationRecord> {
        let updated = {
            let mut guard = self.inner.lock();
            let record = guard
                .conversations
                .get_mut(&Self::key(tenant, conversation_id))
                .ok_or_else(|| anyhow!("conversation not found: {conversation_id}"))?;
            record.status = status;
            record.updated_at = now;
            record.clone()
        };
        publish_change(
            self.feed.as_ref(),
            FeedTable::Conversations,
            FeedOp::Update,
            &tenant.tenant_id,
            conversation_id,
            &updated,
        );
        Ok(updated)
    }

    fn get_conversation_state(
        &self,
        tenant: &TenantContext,
        phone: &str,
    ) -> Result<Option<ConversationStateRecord>> {
        let guard = self.inner.lock();
        Ok(guard.states.get(&Self::key(tenant, phone)).cloned())
    }

    fn list_conversation_states(
        &self,
        tenant: &TenantContext,
    ) -> Result<Vec<ConversationStateRecord>> {
        let guard = self.inner.lock();
        let mut items = guard
            .states
            .values()
            .filter(|item| item.tenant_id == tenant.tenant_id)
            .cloned()
            .collect::<Vec<_>>();
        items.sort_by(|left, right| left.phone.cmp(&right.phone));
        Ok(items)
    }

    fn upsert_conversation_state(
        &self,
        tenant: &TenantContext,
        record: &ConversationStateRecord,
    ) -> Result<()> {
        Self::check_tenant(tenant, &record.tenant_id)?;
        if !record.is_consistent() {
            return Err(anyhow!(
                "operator_id must be set exactly when is_ai_active is false"
            ));
        }
        let op = {
            let mut guard = self.inner.lock();
            let key = Self::key(tenant, &record.phone);
            if guard.states.insert(key, record.clone()).is_some() {
                FeedOp::Update
            } else {
                FeedOp::Insert
            }
        };
        publish_change(
            self.feed.as_ref(),
            FeedTable::ConversationStates,
            op,
            &tenant.tenant_id,
            &record.phone,
            record,
        );
        Ok(())
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
        validate_ownership_args(is_ai_active, operator_id)?;
        let updated = {
            let mut guard = self.inner.lock();
            let record = guard
                .states
                .get_mut(&Self::key(tenant, phone))
                .ok_or_else(|| anyhow!("conversation state not found: {phone}"))?;
            record.is_ai_active = is_ai_active;
            record.operator_id = operator_id.map(str::to_string);
            if let Some(at) = takeover_at {
                record.operator_takeover_at = Some(at);
            }
            record.updated_at = now;
            record.clone()
        };
        publish_change(
            self.feed.as_ref(),
            FeedTable::ConversationStates,
            FeedOp::Update,
            &tenant.tenant_id,
            phone,
            &updated,
        );
        Ok(updated)
    }

    fn upsert_stage(&self, tenant: &TenantContext, record: &StageRecord) -> Result<()> {
        Self::check_tenant(tenant, &record.tenant_id)?;
        let op = {
            let mut guard = self.inner.lock();
            let key = Self::key(tenant, &record.stage_id);
            if !guard.stage_seq.contains_key(&key) {
                let seq = guard.next_stage_seq;
                guard.next_stage_seq += 1;
                guard.stage_seq.insert(key.clone(), seq);
            }
            if guard.stages.insert(key, record.clone()).is_some() {
                FeedOp::Update
            } else {
                FeedOp::Insert
            }
        };
        publish_change(
            self.feed.as_ref(),
            FeedTable::Stages,
            op,
            &tenant.tenant_id,
            &record.stage_id,
            record,
        );
        Ok(())
    }

    fn get_stage(&self, tenant: &TenantContext, stage_id: &str) -> Result<Option<StageRecord>> {
        let guard = self.inner.lock();
        Ok(guard.stages.get(&Self::key(tenant, stage_id)).cloned())
    }

    fn list_stages(
        &self,
        tenant: &TenantContext,
        department: Option<&str>,
    ) -> Result<Vec<StageRecord>> {
        let guard = self.inner.lock();
        let mut items = guard
            .stages
            .values()
            .filter(|item| item.tenant_id == tenant.tenant_id)
            .filter(|item| match (department, &item.department) {
                (None, _) => true,
                // Stages without a department scope are visible everywhere.
                (Some(_), None) => true,
                (Some(wanted), Some(scope)) => wanted == scope,
            })
            .cloned()
            .collect::<Vec<_>>();
        items.sort_by(|left, right| {
            let left_seq = guard
                .stage_seq
                .get(&Self::key(tenant, &left.stage_id))
                .copied()
                .unwrap_or(u64::MAX);
            let right_seq = guard
                .stage_seq
                .get(&Self::key(tenant, &right.stage_id))
                .copied()
                .unwrap_or(u64::MAX);
            left.order_index
                .cmp(&right.order_index)
                .then(left_seq.cmp(&right_seq))
        });
        Ok(items)
    }

    fn delete_stage(&self, tenant: &TenantContext, stage_id: &str) -> Result<bool> {
        let mut guard = self.inner.lock();
        let key = Self::key(tenant, stage_id);
        guard.stage_seq.remove(&key);
        Ok(guard.stages.remove(&key).is_some())
    }

    fn upsert_contact(&self, tenant: &TenantContext, record: &ContactRecord) -> Result<()> {
        Self::check_tenant(tenant, &record.tenant_id)?;
        let op = {
            let mut guard = self.inner.lock();
            let key = Self::key(tenant, &record.contact_id);
            if guard.contacts.insert(key, record.clone()).is_some() {
                FeedOp::Update
            } else {
                FeedOp::Insert
            }
        };
        publish_change(
            self.feed.as_ref(),
            FeedTable::Contacts,
            op,
            &tenant.tenant_id,
            &record.contact_id,
            record,
        );
        Ok(())
    }

    fn get_contact(
        &self,
        tenant: &TenantContext,
        contact_id: &str,
    ) -> Result<Option<ContactRecord>> {
        let guard = self.inner.lock();
        Ok(guard.contacts.get(&Self::key(tenant, contact_id)).cloned())
    }

    fn append_message(
        &self,
        tenant: &TenantContext,
        conversation_id: &str,
        direction: MessageDirection,
        body: Option<&str>,
        media: Option<&MediaDescriptor>,
        now: f64,
    ) -> Result<MessageRecord> {
        let (message, conversation) = {
            let mut guard = self.inner.lock();
            let key = Self::key(tenant, conversation_id);
            if !guard.conversations.contains_key(&key) {
                return Err(anyhow!("conversation not found: {conversation_id}"));
            }
            guard.next_message_id += 1;
            let message = MessageRecord {
                message_id: guard.next_message_id,
                tenant_id: tenant.tenant_id.clone(),
                conversation_id: conversation_id.to_string(),
                direction,
                body: body.map(str::to_string),
                media: media.cloned(),
                created_at: now,
            };
            guard.messages.push(message.clone());
            let conversation = guard
                .conversations
                .get_mut(&key)
                .map(|record| {
                    record.last_message_at = now;
                    record.updated_at = now;
                    record.clone()
                })
                .ok_or_else(|| anyhow!("conversation not found: {conversation_id}"))?;
            (message, conversation)
        };
        publish_change(
            self.feed.as_ref(),
            FeedTable::Messages,
            FeedOp::Insert,
            &tenant.tenant_id,
            &message.message_id.to_string(),
            &message,
        );
        publish_change(
            self.feed.as_ref(),
            FeedTable::Conversations,
            FeedOp::Update,
            &tenant.tenant_id,
            conversation_id,
            &conversation,
        );
        Ok(message)
    }

    fn list_recent_messages(
        &self,
        tenant: &TenantContext,
        conversation_id: &str,
        limit: i64,
    ) -> Result<Vec<MessageRecord>> {
        let guard = self.inner.lock();
        let mut items = guard
            .messages
            .iter()
            .filter(|item| {
                item.tenant_id == tenant.tenant_id && item.conversation_id == conversation_id
            })
            .cloned()
            .collect::<Vec<_>>();
        items.sort_by_key(|item| item.message_id);
        let keep = if limit <= 0 { items.len() } else { limit as usize };
        if items.len() > keep {
            items.drain(..items.len() - keep);
        }
        Ok(items)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::model::now_ts;
    use serde_json::json;

    fn tenant() -> TenantContext {
        TenantContext::new("t1")
    }

    fn conversation(id: &str, phone: &str) -> ConversationRecord {
        let now = now_ts();
        ConversationRecord {
            conversation_id: id.to_string(),
            tenant_id: "t1".to_string(),
            phone: phone.to_string(),
            contact_id: None,
            department: None,
            stage_id: None,
            status: ConversationStatus::Active,
            last_message_at: now,
            created_at: now,
            updated_at: now,
        }
    }

    #[test]
    fn phone_is_immutable_once_set() {
        let store = MemoryDirectoryStore::new();
        let tenant = tenant();
        store
            .upsert_conversation(&tenant, &conversation("c1", "5511999990000"))
            .unwrap();
        let err = store
            .upsert_conversation(&tenant, &conversation("c1", "5511888880000"))
            .unwrap_err();
        assert!(err.to_string().contains("immutable"));
    }

    #[test]
    fn stage_reference_must_be_same_tenant() {
        let store = MemoryDirectoryStore::new();
        let tenant = tenant();
        let other = TenantContext::new("t2");
        let now = now_ts();
        store
            .upsert_stage(
                &other,
                &StageRecord {
                    stage_id: "s1".to_string(),
                    tenant_id: "t2".to_string(),
                    name: "Novo".to_string(),
                    color: "#00aa55".to_string(),
                    order_index: 0,
                    department: None,
                    created_at: now,
                },
            )
            .unwrap();
        store
            .upsert_conversation(&tenant, &conversation("c1", "5511999990000"))
            .unwrap();
        let err = store
            .update_conversation_stage(&tenant, "c1", Some("s1"), now)
            .unwrap_err();
        assert!(err.to_string().contains("stage not found"));
    }

    #[test]
    fn message_ids_are_monotonic_and_touch_conversation() {
        let store = MemoryDirectoryStore::new();
        let tenant = tenant();
        store
            .upsert_conversation(&tenant, &conversation("c1", "5511999990000"))
            .unwrap();
        let first = store
            .append_message(&tenant, "c1", MessageDirection::Inbound, Some("oi"), None, 10.0)
            .unwrap();
        let second = store
            .append_message(&tenant, "c1", MessageDirection::Outbound, Some("ola"), None, 11.0)
            .unwrap();
        assert!(second.message_id > first.message_id);
        let refreshed = store.get_conversation(&tenant, "c1").unwrap().unwrap();
        assert_eq!(refreshed.last_message_at, 11.0);
    }

    #[test]
    fn ownership_flip_requires_existing_state_row() {
        let store = MemoryDirectoryStore::new();
        let tenant = tenant();
        let err = store
            .set_conversation_ownership(
                &tenant,
                "5511999990000",
                false,
                Some("op_1"),
                Some(now_ts()),
                now_ts(),
            )
            .unwrap_err();
        assert!(err.to_string().contains("not found"));
    }

    #[test]
    fn stage_order_breaks_ties_by_insertion() {
        let store = MemoryDirectoryStore::new();
        let tenant = tenant();
        let now = now_ts();
        for stage_id in ["s1", "s2", "s3"] {
            store
                .upsert_stage(
                    &tenant,
                    &StageRecord {
                        stage_id: stage_id.to_string(),
                        tenant_id: "t1".to_string(),
                        name: stage_id.to_uppercase(),
                        color: "#123456".to_string(),
                        order_index: 1,
                        department: None,
                        created_at: now,
                    },
                )
                .unwrap();
        }
        let stages = store.list_stages(&tenant, None).unwrap();
        let ids = stages.iter().map(|item| item.stage_id.as_str()).collect::<Vec<_>>();
        assert_eq!(ids, vec!["s1", "s2", "s3"]);
    }

    #[test]
    fn recent_messages_are_bounded_and_ascending() {
        let store = MemoryDirectoryStore::new();
        let tenant = tenant();
        store
            .upsert_conversation(&tenant, &conversation("c1", "5511999990000"))
            .unwrap();
        for index in 0..10 {
            store
                .append_message(
                    &tenant,
                    "c1",
                    MessageDirection::Inbound,
                    Some(&format!("m{index}")),
                    None,
                    index as f64,
                )
                .unwrap();
        }
        let items = store.list_recent_messages(&tenant, "c1", 4).unwrap();
        assert_eq!(items.len(), 4);
        assert!(items.windows(2).all(|pair| pair[0].message_id < pair[1].message_id));
        assert_eq!(items.last().unwrap().body.as_deref(), Some("m9"));
    }

    #[test]
    fn inconsistent_state_upsert_is_rejected() {
        let store = MemoryDirectoryStore::new();
        let tenant = tenant();
        let err = store
            .upsert_conversation_state(
                &tenant,
                &ConversationStateRecord {
                    tenant_id: "t1".to_string(),
                    phone: "5511999990000".to_string(),
                    is_ai_active: false,
                    operator_id: None,
                    operator_takeover_at: None,
                    triage_stage: crate::model::TriageStage::Greeting,
                    ai_payload: json!({}),
                    updated_at: now_ts(),
                },
            )
            .unwrap_err();
        assert!(err.to_string().contains("operator_id"));
    }
}
