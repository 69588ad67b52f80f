// Pipeline board: stage columns with drag-and-drop reassignment. Card
// moves are optimistic; a pending value masks the server value until the
// persistence request resolves, after which the server is authoritative.

use crate::feed::{ChangeEvent, FeedTable};
use crate::model::{now_ts, ConversationRecord, ConversationStatus, StageRecord, TenantContext};
use crate::storage::{ConversationFilter, DirectoryStore};
use anyhow::{anyhow, Result};
use serde::Serialize;
use std::collections::HashMap;
use std::sync::Arc;
use tracing::{debug, warn};

/// Per-card reconciliation cell. `pending_value` is the optimistic stage
/// assignment while `pending_request_id` is in flight; display prefers
/// it over `server_value` to avoid flicker when events interleave.
#[derive(Debug, Clone, Default)]
struct StageCell {
    server_value: Option<String>,
    pending_value: Option<Option<String>>,
    pending_request_id: Option<u64>,
}

impl StageCell {
    fn display(&self) -> Option<&str> {
        match &self.pending_value {
            Some(pending) => pending.as_deref(),
            None => self.server_value.as_deref(),
        }
    }
}

#[derive(Debug, Clone, Serialize)]
pub struct CardView {
    pub conversation_id: String,
    pub phone: String,
    pub last_message_at: f64,
    pub stage_id: Option<String>,
}

/// One rendered column. `stage: None` is the unassigned column, which
/// collects null and dangling stage references and is never a drop
/// target.
#[derive(Debug, Clone, Serialize)]
pub struct ColumnView {
    pub stage: Option<StageRecord>,
    pub cards: Vec<CardView>,
}

/// Horizontal extent of a rendered stage column, used to resolve where a
/// drag gesture was released.
#[derive(Debug, Clone)]
pub struct ColumnRegion {
    pub stage_id: String,
    pub min_x: f64,
    pub max_x: f64,
}

/// Stage whose column region contains the release point; `None` when
/// released outside every column, which callers treat as a no-op.
pub fn resolve_drop_target(x: f64, regions: &[ColumnRegion]) -> Option<String> {
    regions
        .iter()
        .find(|region| x >= region.min_x && x < region.max_x)
        .map(|region| region.stage_id.clone())
}

#[derive(Debug, Clone)]
pub struct MoveTicket {
    pub request_id: u64,
    pub conversation_id: String,
    pub target_stage_id: String,
}

pub struct PipelineBoard {
    store: Arc<dyn DirectoryStore>,
    tenant: TenantContext,
    department: Option<String>,
    stages: Vec<StageRecord>,
    conversations: HashMap<String, ConversationRecord>,
    cells: HashMap<String, StageCell>,
    next_request_id: u64,
}

impl PipelineBoard {
    pub fn new(
        store: Arc<dyn DirectoryStore>,
        tenant: TenantContext,
        department: Option<String>,
    ) -> Self {
        Self {
            store,
            tenant,
            department,
            stages: Vec::new(),
            conversations: HashMap::new(),
            cells: HashMap::new(),
            next_request_id: 1,
        }
    }

    fn filter(&self) -> ConversationFilter {
        ConversationFilter {
            department: self.department.clone(),
            status: Some(ConversationStatus::Active),
        }
    }

    /// Full snapshot load; also the resync path. Pending optimistic
    /// values of still-in-flight moves survive the reload.
    pub fn load(&mut self) -> Result<()> {
        self.stages = self
            .store
            .list_stages(&self.tenant, self.department.as_deref())?;
        let items = self.store.list_conversations(&self.tenant, &self.filter())?;
        let mut cells = HashMap::new();
        let mut conversations = HashMap::new();
        for record in items {
            let mut cell = self
                .cells
                .remove(&record.conversation_id)
                .unwrap_or_default();
            cell.server_value = record.stage_id.clone();
            if cell.pending_request_id.is_none() {
                cell.pending_value = None;
            }
            cells.insert(record.conversation_id.clone(), cell);
            conversations.insert(record.conversation_id.clone(), record);
        }
        self.cells = cells;
        self.conversations = conversations;
        Ok(())
    }

    /// Local half of a move: the card jumps to the target column before
    /// any persistence round-trip is issued.
    pub fn begin_move(&mut self, conversation_id: &str, target_stage_id: &str) -> Result<MoveTicket> {
        if !self.conversations.contains_key(conversation_id) {
            return Err(anyhow!("unknown card: {conversation_id}"));
        }
        let request_id = self.next_request_id;
        self.next_request_id += 1;
        let cell = self.cells.entry(conversation_id.to_string()).or_default();
        cell.pending_value = Some(Some(target_stage_id.to_string()));
        cell.pending_request_id = Some(request_id);
        Ok(MoveTicket {
            request_id,
            conversation_id: conversation_id.to_string(),
            target_stage_id: target_stage_id.to_string(),
        })
    }

    /// Resolution half: on success the acknowledged row becomes the
    /// server value; on failure the pending value is discarded and the
    /// card falls back to where the server last had it.
    pub fn resolve_move(
        &mut self,
        ticket: &MoveTicket,
        result: Result<ConversationRecord>,
    ) -> Result<ConversationRecord> {
        match result {
            Ok(record) => {
                // Merge re-creates the cell if a feed event removed it
                // mid-flight, so the acked stage still renders.
                self.merge_conversation(record.clone());
                if let Some(cell) = self.cells.get_mut(&ticket.conversation_id) {
                    if cell.pending_request_id == Some(ticket.request_id) {
                        cell.pending_value = None;
                        cell.pending_request_id = None;
                    }
                }
                Ok(record)
            }
            Err(err) => {
                if let Some(cell) = self.cells.get_mut(&ticket.conversation_id) {
                    if cell.pending_request_id == Some(ticket.request_id) {
                        cell.pending_value = None;
                        cell.pending_request_id = None;
                        warn!(
                            conversation_id = %ticket.conversation_id,
                            error = %err,
                            "card move failed, reverting"
                        );
                    }
                }
                Err(err)
            }
        }
    }

    /// Optimistic move plus persistence in one call.
    pub fn move_card(
        &mut self,
        conversation_id: &str,
        target_stage_id: &str,
    ) -> Result<ConversationRecord> {
        let ticket = self.begin_move(conversation_id, target_stage_id)?;
        let result = self.store.update_conversation_stage(
            &self.tenant,
            conversation_id,
            Some(target_stage_id),
            now_ts(),
        );
        self.resolve_move(&ticket, result)
    }

    /// Drag release: resolves the drop point to a column and starts the
    /// move, or does nothing when released outside every column.
    pub fn drop_card(
        &mut self,
        conversation_id: &str,
        release_x: f64,
        regions: &[ColumnRegion],
    ) -> Result<Option<ConversationRecord>> {
        let Some(target) = resolve_drop_target(release_x, regions) else {
            debug!(conversation_id, "drop outside columns, ignoring");
            return Ok(None);
        };
        self.move_card(conversation_id, &target).map(Some)
    }

    /// Applies one change event; full-row replacement in arrival order.
    /// A pending optimistic value keeps masking the display until its
    /// request resolves.
    pub fn apply_event(&mut self, event: &ChangeEvent) -> Result<()> {
        if event.tenant_id != self.tenant.tenant_id {
            return Ok(());
        }
        match event.table {
            FeedTable::Conversations => {
                let record = serde_json::from_value::<ConversationRecord>(event.row.clone())
                    .ok()
                    .map(Ok)
                    .unwrap_or_else(|| {
                        // Row payload undecodable: fall back to a
                        // targeted read.
                        self.store
                            .get_conversation(&self.tenant, &event.entity_id)
                            .map(|fetched| {
                                fetched.unwrap_or_else(|| missing_conversation(&event.entity_id))
                            })
                    })?;
                self.merge_conversation(record);
                Ok(())
            }
            FeedTable::Messages => {
                let conversation_id = event
                    .row
                    .get("conversation_id")
                    .and_then(|value| value.as_str())
                    .map(str::to_string);
                if let Some(conversation_id) = conversation_id {
                    if let Some(fetched) =
                        self.store.get_conversation(&self.tenant, &conversation_id)?
                    {
                        self.merge_conversation(fetched);
                    }
                }
                Ok(())
            }
            FeedTable::Stages => {
                if let Ok(stage) = serde_json::from_value::<StageRecord>(event.row.clone()) {
                    match self
                        .stages
                        .iter_mut()
                        .find(|item| item.stage_id == stage.stage_id)
                    {
                        Some(existing) => *existing = stage,
                        None => self.stages.push(stage),
                    }
                    // Stable sort keeps insertion order on equal indexes.
                    self.stages.sort_by_key(|item| item.order_index);
                }
                Ok(())
            }
            FeedTable::ConversationStates | FeedTable::Contacts => Ok(()),
        }
    }

    fn merge_conversation(&mut self, record: ConversationRecord) {
        let matches = self.filter().matches(&record) && record.status == ConversationStatus::Active;
        if !matches {
            self.conversations.remove(&record.conversation_id);
            self.cells.remove(&record.conversation_id);
            return;
        }
        let cell = self.cells.entry(record.conversation_id.clone()).or_default();
        cell.server_value = record.stage_id.clone();
        self.conversations
            .insert(record.conversation_id.clone(), record);
    }

    /// Columns in stage order, unassigned first. Cards whose display
    /// stage is null or references a deleted stage land in unassigned;
    /// a dangling reference must never break rendering.
    pub fn columns(&self) -> Vec<ColumnView> {
        let known = self
            .stages
            .iter()
            .map(|stage| stage.stage_id.as_str())
            .collect::<Vec<_>>();
        let mut by_stage: HashMap<&str, Vec<CardView>> = HashMap::new();
        let mut unassigned = Vec::new();
        for record in self.conversations.values() {
            let display = self
                .cells
                .get(&record.conversation_id)
                .and_then(|cell| cell.display())
                .filter(|stage_id| known.contains(stage_id));
            let card = CardView {
                conversation_id: record.conversation_id.clone(),
                phone: record.phone.clone(),
                last_message_at: record.last_message_at,
                stage_id: display.map(str::to_string),
            };
            match display {
                Some(stage_id) => by_stage.entry(stage_id).or_default().push(card),
                None => unassigned.push(card),
            }
        }
        let mut columns = Vec::with_capacity(self.stages.len() + 1);
        sort_cards(&mut unassigned);
        columns.push(ColumnView {
            stage: None,
            cards: unassigned,
        });
        for stage in &self.stages {
            let mut cards = by_stage.remove(stage.stage_id.as_str()).unwrap_or_default();
            sort_cards(&mut cards);
            columns.push(ColumnView {
                stage: Some(stage.clone()),
                cards,
            });
        }
        columns
    }

    pub fn stages(&self) -> &[StageRecord] {
        &self.stages
    }
}

fn sort_cards(cards: &mut [CardView]) {
    cards.sort_by(|left, right| {
        right
            .last_message_at
            .total_cmp(&left.last_message_at)
            .then_with(|| left.conversation_id.cmp(&right.conversation_id))
    });
}

fn missing_conversation(conversation_id: &str) -> ConversationRecord {
    // Placeholder that fails every filter, so the merge drops the card.
    ConversationRecord {
        conversation_id: conversation_id.to_string(),
        tenant_id: String::new(),
        phone: String::new(),
        contact_id: None,
        department: None,
        stage_id: None,
        status: ConversationStatus::Archived,
        last_message_at: 0.0,
        created_at: 0.0,
        updated_at: 0.0,
    }
}
