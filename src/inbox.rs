// Inbox projector: a live, filtered, de-duplicated list of conversation
// summaries ordered by last message time. Change events trigger a
// targeted re-fetch of the affected row, never a full reload.

use crate::config::InboxConfig;
use crate::feed::{ChangeEvent, FeedTable};
use crate::model::{
    ConversationRecord, ConversationStateRecord, OwnershipIndicator, TenantContext,
};
use crate::storage::{ConversationFilter, DirectoryStore};
use anyhow::Result;
use serde::Serialize;
use std::collections::HashMap;
use std::sync::Arc;
use tracing::debug;

#[derive(Debug, Clone, Serialize)]
pub struct InboxSummary {
    pub conversation_id: String,
    pub phone: String,
    pub contact_name: Option<String>,
    pub department: Option<String>,
    pub stage_id: Option<String>,
    pub last_message_at: f64,
    pub ownership: OwnershipIndicator,
}

pub struct InboxProjector {
    store: Arc<dyn DirectoryStore>,
    tenant: TenantContext,
    filter: ConversationFilter,
    max_cached: usize,
    conversations: HashMap<String, ConversationRecord>,
    contact_names: HashMap<String, String>,
    states: HashMap<String, ConversationStateRecord>,
}

impl InboxProjector {
    pub fn new(
        store: Arc<dyn DirectoryStore>,
        tenant: TenantContext,
        filter: ConversationFilter,
        config: &InboxConfig,
    ) -> Self {
        Self {
            store,
            tenant,
            filter,
            max_cached: config.max_cached.max(1),
            conversations: HashMap::new(),
            contact_names: HashMap::new(),
            states: HashMap::new(),
        }
    }

    pub fn filter(&self) -> &ConversationFilter {
        &self.filter
    }

    /// Replaces the filter; the caller is expected to `load` afterwards.
    pub fn set_filter(&mut self, filter: ConversationFilter) {
        self.filter = filter;
    }

    /// Full snapshot fetch replacing the cached collection. Also the
    /// recovery path after a feed resync.
    pub fn load(&mut self) -> Result<()> {
        let mut items = self.store.list_conversations(&self.tenant, &self.filter)?;
        items.truncate(self.max_cached);
        self.conversations = items
            .into_iter()
            .map(|record| (record.conversation_id.clone(), record))
            .collect();
        self.states = self
            .store
            .list_conversation_states(&self.tenant)?
            .into_iter()
            .map(|record| (record.phone.clone(), record))
            .collect();
        let contact_ids = self
            .conversations
            .values()
            .filter_map(|record| record.contact_id.clone())
            .collect::<Vec<_>>();
        for contact_id in contact_ids {
            self.resolve_contact_name(&contact_id)?;
        }
        Ok(())
    }

    /// Applies one change event. Merges are keyed on entity id, so the
    /// at-least-once feed can deliver the same event twice harmlessly.
    pub fn apply_event(&mut self, event: &ChangeEvent) -> Result<()> {
        if event.tenant_id != self.tenant.tenant_id {
            return Ok(());
        }
        match event.table {
            FeedTable::Conversations => self.refresh_conversation(&event.entity_id),
            FeedTable::Messages => {
                // The message row carries its conversation id; the list
                // only cares about the conversation's new recency.
                let conversation_id = event
                    .row
                    .get("conversation_id")
                    .and_then(|value| value.as_str())
                    .map(str::to_string);
                match conversation_id {
                    Some(conversation_id) => self.refresh_conversation(&conversation_id),
                    None => Ok(()),
                }
            }
            FeedTable::ConversationStates => self.refresh_state(&event.entity_id),
            FeedTable::Contacts => {
                if self.contact_names.contains_key(&event.entity_id) {
                    self.contact_names.remove(&event.entity_id);
                    self.resolve_contact_name(&event.entity_id)?;
                }
                Ok(())
            }
            FeedTable::Stages => Ok(()),
        }
    }

    fn refresh_conversation(&mut self, conversation_id: &str) -> Result<()> {
        let fetched = self.store.get_conversation(&self.tenant, conversation_id)?;
        match fetched {
            Some(record) if self.filter.matches(&record) => {
                if let Some(contact_id) = record.contact_id.clone() {
                    self.resolve_contact_name(&contact_id)?;
                }
                self.conversations
                    .insert(conversation_id.to_string(), record);
                self.enforce_cap();
            }
            _ => {
                // Row gone or no longer matching the filter: drop from
                // the projection without a full reload.
                if self.conversations.remove(conversation_id).is_some() {
                    debug!(conversation_id, "conversation left the inbox filter");
                }
            }
        }
        Ok(())
    }

    // The cap holds across merges too, not just the initial load. The
    // eviction order mirrors the render order: the summary that would
    // render last goes first.
    fn enforce_cap(&mut self) {
        while self.conversations.len() > self.max_cached {
            let evict = self
                .conversations
                .values()
                .min_by(|left, right| {
                    left.last_message_at
                        .total_cmp(&right.last_message_at)
                        .then_with(|| right.conversation_id.cmp(&left.conversation_id))
                })
                .map(|record| record.conversation_id.clone());
            match evict {
                Some(conversation_id) => {
                    self.conversations.remove(&conversation_id);
                }
                None => break,
            }
        }
    }

    fn refresh_state(&mut self, phone: &str) -> Result<()> {
        if let Some(record) = self.store.get_conversation_state(&self.tenant, phone)? {
            self.states.insert(phone.to_string(), record);
        }
        Ok(())
    }

    fn resolve_contact_name(&mut self, contact_id: &str) -> Result<()> {
        if self.contact_names.contains_key(contact_id) {
            return Ok(());
        }
        if let Some(contact) = self.store.get_contact(&self.tenant, contact_id)? {
            self.contact_names
                .insert(contact_id.to_string(), contact.name);
        }
        Ok(())
    }

    /// Ordered summaries for rendering. The ownership indicator comes
    /// from the cached state map and defaults to `Unknown`; the list
    /// never waits on that lookup.
    pub fn summaries(&self) -> Vec<InboxSummary> {
        let mut items = self
            .conversations
            .values()
            .map(|record| self.summarize(record))
            .collect::<Vec<_>>();
        items.sort_by(|left, right| {
            right
                .last_message_at
                .total_cmp(&left.last_message_at)
                .then_with(|| left.conversation_id.cmp(&right.conversation_id))
        });
        items
    }

    /// Client-side substring match on contact name or phone; never hits
    /// the store.
    pub fn search(&self, query: &str) -> Vec<InboxSummary> {
        let needle = query.trim().to_lowercase();
        if needle.is_empty() {
            return self.summaries();
        }
        self.summaries()
            .into_iter()
            .filter(|item| {
                item.phone.to_lowercase().contains(&needle)
                    || item
                        .contact_name
                        .as_deref()
                        .map(|name| name.to_lowercase().contains(&needle))
                        .unwrap_or(false)
            })
            .collect()
    }

    fn summarize(&self, record: &ConversationRecord) -> InboxSummary {
        let ownership = self
            .states
            .get(&record.phone)
            .map(|state| state.ownership())
            .unwrap_or(OwnershipIndicator::Unknown);
        InboxSummary {
            conversation_id: record.conversation_id.clone(),
            phone: record.phone.clone(),
            contact_name: record
                .contact_id
                .as_ref()
                .and_then(|contact_id| self.contact_names.get(contact_id).cloned()),
            department: record.department.clone(),
            stage_id: record.stage_id.clone(),
            last_message_at: record.last_message_at,
            ownership,
        }
    }
}
