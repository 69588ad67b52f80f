// Chat transcript: append-only message view for one conversation,
// ordered by message id and deduplicated against redelivery.

use crate::config::TranscriptConfig;
use crate::feed::{ChangeEvent, FeedTable};
use crate::model::{MessageRecord, TenantContext};
use crate::storage::DirectoryStore;
use anyhow::Result;
use std::collections::HashSet;
use std::sync::Arc;
use tracing::debug;

pub struct ChatTranscript {
    store: Arc<dyn DirectoryStore>,
    tenant: TenantContext,
    conversation_id: String,
    initial_limit: i64,
    messages: Vec<MessageRecord>,
    seen: HashSet<i64>,
    // Bumped once per appended message; the view layer scrolls to the
    // bottom when it observes a new generation.
    scroll_generation: u64,
}

impl ChatTranscript {
    pub fn new(
        store: Arc<dyn DirectoryStore>,
        tenant: TenantContext,
        conversation_id: impl Into<String>,
        config: &TranscriptConfig,
    ) -> Self {
        Self {
            store,
            tenant,
            conversation_id: conversation_id.into(),
            initial_limit: config.initial_limit,
            messages: Vec::new(),
            seen: HashSet::new(),
            scroll_generation: 0,
        }
    }

    /// Loads the most recent window of history, oldest first. Also the
    /// resync path; already-seen ids stay deduplicated across reloads.
    pub fn load(&mut self) -> Result<()> {
        let history = self.store.list_recent_messages(
            &self.tenant,
            &self.conversation_id,
            self.initial_limit,
        )?;
        self.messages.clear();
        self.seen.clear();
        for message in history {
            self.seen.insert(message.message_id);
            self.messages.push(message);
        }
        Ok(())
    }

    /// Applies one change event. Events for other conversations or with
    /// already-seen message ids are dropped; redelivery is expected.
    pub fn apply_event(&mut self, event: &ChangeEvent) -> Result<()> {
        if event.tenant_id != self.tenant.tenant_id || event.table != FeedTable::Messages {
            return Ok(());
        }
        let Ok(message) = serde_json::from_value::<MessageRecord>(event.row.clone()) else {
            return Ok(());
        };
        if message.conversation_id != self.conversation_id {
            return Ok(());
        }
        if !self.seen.insert(message.message_id) {
            debug!(
                message_id = message.message_id,
                "duplicate message delivery, skipping"
            );
            return Ok(());
        }
        // Unordered delivery: insert at the position its id dictates.
        let at = self
            .messages
            .partition_point(|existing| existing.message_id < message.message_id);
        let is_tail = at == self.messages.len();
        self.messages.insert(at, message);
        // Scroll-to-latest only fires for genuinely new tail messages;
        // a stale redelivery filling in older history must not yank the
        // view to the bottom.
        if is_tail {
            self.scroll_generation += 1;
        }
        Ok(())
    }

    pub fn messages(&self) -> &[MessageRecord] {
        &self.messages
    }

    pub fn conversation_id(&self) -> &str {
        &self.conversation_id
    }

    pub fn scroll_generation(&self) -> u64 {
        self.scroll_generation
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::feed::FeedOp;
    use crate::model::{now_ts, ConversationRecord, ConversationStatus, MessageDirection};
    use crate::storage::MemoryDirectoryStore;

    fn tenant() -> TenantContext {
        TenantContext::new("t1")
    }

    fn seeded_store() -> Arc<MemoryDirectoryStore> {
        let store = Arc::new(MemoryDirectoryStore::new());
        store
            .upsert_conversation(
                &tenant(),
                &ConversationRecord {
                    conversation_id: "c1".to_string(),
                    tenant_id: "t1".to_string(),
                    phone: "111".to_string(),
                    contact_id: None,
                    department: None,
                    stage_id: None,
                    status: ConversationStatus::Active,
                    last_message_at: now_ts(),
                    created_at: now_ts(),
                    updated_at: now_ts(),
                },
            )
            .unwrap();
        store
    }

    fn message(message_id: i64, conversation_id: &str, body: &str) -> MessageRecord {
        MessageRecord {
            message_id,
            tenant_id: "t1".to_string(),
            conversation_id: conversation_id.to_string(),
            direction: MessageDirection::Inbound,
            body: Some(body.to_string()),
            media: None,
            created_at: now_ts(),
        }
    }

    fn event_for(message: &MessageRecord) -> ChangeEvent {
        ChangeEvent {
            table: FeedTable::Messages,
            op: FeedOp::Insert,
            tenant_id: message.tenant_id.clone(),
            entity_id: message.message_id.to_string(),
            row: serde_json::to_value(message).unwrap(),
        }
    }

    fn transcript() -> ChatTranscript {
        let store = Arc::new(MemoryDirectoryStore::new());
        ChatTranscript::new(
            store as Arc<dyn DirectoryStore>,
            tenant(),
            "c1",
            &TranscriptConfig::default(),
        )
    }

    #[test]
    fn duplicate_delivery_appears_once() {
        let mut view = transcript();
        let msg = message(7, "c1", "ola");
        view.apply_event(&event_for(&msg)).unwrap();
        view.apply_event(&event_for(&msg)).unwrap();
        assert_eq!(view.messages().len(), 1);
        assert_eq!(view.scroll_generation(), 1);
    }

    #[test]
    fn out_of_order_delivery_sorts_by_id() {
        let mut view = transcript();
        for id in [5, 2, 9, 3] {
            view.apply_event(&event_for(&message(id, "c1", "x"))).unwrap();
        }
        let ids = view
            .messages()
            .iter()
            .map(|item| item.message_id)
            .collect::<Vec<_>>();
        assert_eq!(ids, vec![2, 3, 5, 9]);
        // Only 5 and 9 arrived as the newest message; the backfills do
        // not move the scroll.
        assert_eq!(view.scroll_generation(), 2);
    }

    #[test]
    fn backfill_below_the_window_does_not_move_the_scroll() {
        let store = seeded_store();
        let config = TranscriptConfig { initial_limit: 2 };
        for body in ["a", "b", "c"] {
            store
                .append_message(&tenant(), "c1", MessageDirection::Inbound, Some(body), None, now_ts())
                .unwrap();
        }
        let mut view =
            ChatTranscript::new(store as Arc<dyn DirectoryStore>, tenant(), "c1", &config);
        view.load().unwrap();
        assert_eq!(view.messages().len(), 2);
        // A late delivery of the message the window cut off lands at the
        // front without a scroll bump.
        view.apply_event(&event_for(&message(1, "c1", "a"))).unwrap();
        assert_eq!(view.messages().len(), 3);
        assert_eq!(view.scroll_generation(), 0);
        view.apply_event(&event_for(&message(9, "c1", "d"))).unwrap();
        assert_eq!(view.scroll_generation(), 1);
    }

    #[test]
    fn other_conversation_events_are_ignored() {
        let mut view = transcript();
        view.apply_event(&event_for(&message(1, "c2", "outro"))).unwrap();
        assert!(view.messages().is_empty());
        assert_eq!(view.scroll_generation(), 0);
    }

    #[test]
    fn reload_window_keeps_most_recent_ascending() {
        let store = seeded_store();
        let config = TranscriptConfig { initial_limit: 3 };
        for body in ["a", "b", "c", "d", "e"] {
            store
                .append_message(&tenant(), "c1", MessageDirection::Inbound, Some(body), None, now_ts())
                .unwrap();
        }
        let mut view = ChatTranscript::new(store as Arc<dyn DirectoryStore>, tenant(), "c1", &config);
        view.load().unwrap();
        let bodies = view
            .messages()
            .iter()
            .filter_map(|item| item.body.as_deref())
            .collect::<Vec<_>>();
        assert_eq!(bodies, vec!["c", "d", "e"]);
        let ids = view
            .messages()
            .iter()
            .map(|item| item.message_id)
            .collect::<Vec<_>>();
        assert!(ids.windows(2).all(|pair| pair[0] < pair[1]));
    }

    #[test]
    fn redelivery_of_loaded_history_is_dropped() {
        let store = seeded_store();
        let stored = store
            .append_message(&tenant(), "c1", MessageDirection::Inbound, Some("oi"), None, now_ts())
            .unwrap();
        let mut view = ChatTranscript::new(
            store as Arc<dyn DirectoryStore>,
            tenant(),
            "c1",
            &TranscriptConfig::default(),
        );
        view.load().unwrap();
        view.apply_event(&event_for(&stored)).unwrap();
        assert_eq!(view.messages().len(), 1);
        assert_eq!(view.scroll_generation(), 0);
    }
}
