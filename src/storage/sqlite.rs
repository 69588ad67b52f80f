// SQLite directory store: embedded persistence with the same contract
// the hosted backend exposes, used for local runs and integration tests.

use crate::feed::{FeedHub, FeedOp, FeedTable};
use crate::model::{
    ContactRecord, ConversationRecord, ConversationStateRecord, ConversationStatus,
    MediaDescriptor, MessageDirection, MessageRecord, StageRecord, TenantContext, TriageStage,
};
use crate::storage::{
    publish_change, validate_ownership_args, ConversationFilter, DirectoryStore,
};
use anyhow::{anyhow, Result};
use parking_lot::Mutex;
use rusqlite::{params, Connection, OptionalExtension, Row, TransactionBehavior};
use serde_json::Value;
use std::path::PathBuf;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

pub struct SqliteDirectoryStore {
    db_path: PathBuf,
    initialized: AtomicBool,
    init_guard: Mutex<()>,
    feed: Option<Arc<FeedHub>>,
}

impl SqliteDirectoryStore {
    pub fn new(db_path: String) -> Self {
        let path = if db_path.trim().is_empty() {
            PathBuf::from("./data/imovia.db")
        } else {
            PathBuf::from(db_path)
        };
        Self {
            db_path: path,
            initialized: AtomicBool::new(false),
            init_guard: Mutex::new(()),
            feed: None,
        }
    }

    pub fn with_feed(mut self, feed: Arc<FeedHub>) -> Self {
        self.feed = Some(feed);
        self
    }

    fn ensure_db_dir(&self) -> Result<()> {
        if let Some(parent) = self.db_path.parent() {
            std::fs::create_dir_all(parent)?;
        }
        Ok(())
    }

    fn open(&self) -> Result<Connection> {
        self.ensure_db_dir()?;
        let conn = Connection::open(&self.db_path)?;
        conn.pragma_update(None, "journal_mode", "WAL").ok();
        conn.pragma_update(None, "synchronous", "NORMAL").ok();
        Ok(conn)
    }

    fn map_conversation(row: &Row<'_>) -> rusqlite::Result<ConversationRecord> {
        let status: String = row.get(6)?;
        Ok(ConversationRecord {
            conversation_id: row.get(0)?,
            tenant_id: row.get(1)?,
            phone: row.get(2)?,
            contact_id: row.get(3)?,
            department: row.get(4)?,
            stage_id: row.get(5)?,
            status: ConversationStatus::parse(&status).unwrap_or(ConversationStatus::Active),
            last_message_at: row.get(7)?,
            created_at: row.get(8)?,
            updated_at: row.get(9)?,
        })
    }

    fn map_state(row: &Row<'_>) -> rusqlite::Result<ConversationStateRecord> {
        let is_ai_active: i64 = row.get(2)?;
        let triage: String = row.get(5)?;
        let payload: String = row.get(6)?;
        Ok(ConversationStateRecord {
            tenant_id: row.get(0)?,
            phone: row.get(1)?,
            is_ai_active: is_ai_active != 0,
            operator_id: row.get(3)?,
            operator_takeover_at: row.get(4)?,
            triage_stage: TriageStage::parse(&triage).unwrap_or(TriageStage::Greeting),
            ai_payload: serde_json::from_str(&payload).unwrap_or(Value::Null),
            updated_at: row.get(7)?,
        })
    }

    fn map_stage(row: &Row<'_>) -> rusqlite::Result<StageRecord> {
        Ok(StageRecord {
            stage_id: row.get(0)?,
            tenant_id: row.get(1)?,
            name: row.get(2)?,
            color: row.get(3)?,
            order_index: row.get(4)?,
            department: row.get(5)?,
            created_at: row.get(6)?,
        })
    }

    fn map_contact(row: &Row<'_>) -> rusqlite::Result<ContactRecord> {
        Ok(ContactRecord {
            contact_id: row.get(0)?,
            tenant_id: row.get(1)?,
            name: row.get(2)?,
            phone: row.get(3)?,
            created_at: row.get(4)?,
        })
    }

    fn map_message(row: &Row<'_>) -> rusqlite::Result<MessageRecord> {
        let direction: String = row.get(3)?;
        let media: Option<String> = row.get(5)?;
        Ok(MessageRecord {
            message_id: row.get(0)?,
            tenant_id: row.get(1)?,
            conversation_id: row.get(2)?,
            direction: MessageDirection::parse(&direction).unwrap_or(MessageDirection::Inbound),
            body: row.get(4)?,
            media: media.and_then(|raw| serde_json::from_str(&raw).ok()),
            created_at: row.get(6)?,
        })
    }

    fn stage_exists(conn: &Connection, tenant_id: &str, stage_id: &str) -> Result<bool> {
        let count: i64 = conn.query_row(
            "SELECT COUNT(1) FROM stages WHERE tenant_id = ?1 AND stage_id = ?2",
            params![tenant_id, stage_id],
            |row| row.get(0),
        )?;
        Ok(count > 0)
    }

    fn fetch_conversation(
        conn: &Connection,
        tenant_id: &str,
        conversation_id: &str,
    ) -> Result<Option<ConversationRecord>> {
        let record = conn
            .query_row(
                "SELECT conversation_id, tenant_id, phone, contact_id, department, stage_id,
                        status, last_message_at, created_at, updated_at
                 FROM conversations WHERE tenant_id = ?1 AND conversation_id = ?2",
                params![tenant_id, conversation_id],
                Self::map_conversation,
            )
            .optional()?;
        Ok(record)
    }

    fn fetch_state(
        conn: &Connection,
        tenant_id: &str,
        phone: &str,
    ) -> Result<Option<ConversationStateRecord>> {
        let record = conn
            .query_row(
                "SELECT tenant_id, phone, is_ai_active, operator_id, operator_takeover_at,
                        triage_stage, ai_payload, updated_at
                 FROM conversation_states WHERE tenant_id = ?1 AND phone = ?2",
                params![tenant_id, phone],
                Self::map_state,
            )
            .optional()?;
        Ok(record)
    }
}

impl DirectoryStore for SqliteDirectoryStore {
    fn ensure_initialized(&self) -> Result<()> {
        if self.initialized.load(Ordering::SeqCst) {
            return Ok(());
        }
        let _guard = self.init_guard.lock();
        if self.initialized.load(Ordering::SeqCst) {
            return Ok(());
        }
        let conn = self.open()?;
        conn.execute_batch(
            r#"
            CREATE TABLE IF NOT EXISTS conversations (
              conversation_id TEXT NOT NULL,
              tenant_id TEXT NOT NULL,
              phone TEXT NOT NULL,
              contact_id TEXT,
              department TEXT,
              stage_id TEXT,
              status TEXT NOT NULL,
              last_message_at REAL NOT NULL,
              created_at REAL NOT NULL,
              updated_at REAL NOT NULL,
              PRIMARY KEY (tenant_id, conversation_id)
            );
            CREATE INDEX IF NOT EXISTS idx_conversations_phone
              ON conversations (tenant_id, phone);
            CREATE INDEX IF NOT EXISTS idx_conversations_status
              ON conversations (tenant_id, status, last_message_at);
            CREATE TABLE IF NOT EXISTS conversation_states (
              tenant_id TEXT NOT NULL,
              phone TEXT NOT NULL,
              is_ai_active INTEGER NOT NULL,
              operator_id TEXT,
              operator_takeover_at REAL,
              triage_stage TEXT NOT NULL,
              ai_payload TEXT NOT NULL,
              updated_at REAL NOT NULL,
              PRIMARY KEY (tenant_id, phone)
            );
            CREATE TABLE IF NOT EXISTS stages (
              stage_id TEXT NOT NULL,
              tenant_id TEXT NOT NULL,
              name TEXT NOT NULL,
              color TEXT NOT NULL,
              order_index INTEGER NOT NULL,
              department TEXT,
              created_at REAL NOT NULL,
              PRIMARY KEY (tenant_id, stage_id)
            );
            CREATE TABLE IF NOT EXISTS contacts (
              contact_id TEXT NOT NULL,
              tenant_id TEXT NOT NULL,
              name TEXT NOT NULL,
              phone TEXT NOT NULL,
              created_at REAL NOT NULL,
              PRIMARY KEY (tenant_id, contact_id)
            );
            CREATE TABLE IF NOT EXISTS messages (
              message_id INTEGER PRIMARY KEY AUTOINCREMENT,
              tenant_id TEXT NOT NULL,
              conversation_id TEXT NOT NULL,
              direction TEXT NOT NULL,
              body TEXT,
              media TEXT,
              created_at REAL NOT NULL
            );
            CREATE INDEX IF NOT EXISTS idx_messages_conversation
              ON messages (tenant_id, conversation_id, message_id);
            "#,
        )?;
        self.initialized.store(true, Ordering::SeqCst);
        Ok(())
    }

    fn upsert_conversation(
        &self,
        tenant: &TenantContext,
        record: &ConversationRecord,
    ) -> Result<()> {
        if tenant.tenant_id != record.tenant_id {
            return Err(anyhow!("record tenant does not match the session tenant"));
        }
        self.ensure_initialized()?;
        let conn = self.open()?;
        if let Some(stage_id) = &record.stage_id {
            if !Self::stage_exists(&conn, &tenant.tenant_id, stage_id)? {
                return Err(anyhow!("stage not found for tenant: {stage_id}"));
            }
        }
        let existing: Option<String> = conn
            .query_row(
                "SELECT phone FROM conversations WHERE tenant_id = ?1 AND conversation_id = ?2",
                params![tenant.tenant_id, record.conversation_id],
                |row| row.get(0),
            )
            .optional()?;
        let op = match existing {
            Some(phone) => {
                if phone != record.phone {
                    return Err(anyhow!("conversation phone is immutable"));
                }
                FeedOp::Update
            }
            None => FeedOp::Insert,
        };
        conn.execute(
            "INSERT INTO conversations
               (conversation_id, tenant_id, phone, contact_id, department, stage_id,
                status, last_message_at, created_at, updated_at)
             VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10)
             ON CONFLICT (tenant_id, conversation_id) DO UPDATE SET
               contact_id = excluded.contact_id,
               department = excluded.department,
               stage_id = excluded.stage_id,
               status = excluded.status,
               last_message_at = excluded.last_message_at,
               updated_at = excluded.updated_at",
            params![
                record.conversation_id,
                record.tenant_id,
                record.phone,
                record.contact_id,
                record.department,
                record.stage_id,
                record.status.as_str(),
                record.last_message_at,
                record.created_at,
                record.updated_at,
            ],
        )?;
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
        self.ensure_initialized()?;
        let conn = self.open()?;
        Self::fetch_conversation(&conn, &tenant.tenant_id, conversation_id)
    }

    fn get_conversation_by_phone(
        &self,
        tenant: &TenantContext,
        phone: &str,
    ) -> Result<Option<ConversationRecord>> {
        self.ensure_initialized()?;
        let conn = self.open()?;
        let record = conn
            .query_row(
                "SELECT conversation_id, tenant_id, phone, contact_id, department, stage_id,
                        status, last_message_at, created_at, updated_at
                 FROM conversations WHERE tenant_id = ?1 AND phone = ?2",
                params![tenant.tenant_id, phone],
                Self::map_conversation,
            )
            .optional()?;
        Ok(record)
    }

    fn list_conversations(
        &self,
        tenant: &TenantContext,
        filter: &ConversationFilter,
    ) -> Result<Vec<ConversationRecord>> {
        self.ensure_initialized()?;
        let conn = self.open()?;
        let mut stmt = conn.prepare(
            "SELECT conversation_id, tenant_id, phone, contact_id, department, stage_id,
                    status, last_message_at, created_at, updated_at
             FROM conversations WHERE tenant_id = ?1
             ORDER BY last_message_at DESC, conversation_id ASC",
        )?;
        let rows = stmt.query_map(params![tenant.tenant_id], Self::map_conversation)?;
        let mut items = Vec::new();
        for row in rows {
            let record = row?;
            if filter.matches(&record) {
                items.push(record);
            }
        }
        Ok(items)
    }

    fn update_conversation_stage(
        &self,
        tenant: &TenantContext,
        conversation_id: &str,
        stage_id: Option<&str>,
        now: f64,
    ) -> Result<ConversationRecord> {
        self.ensure_initialized()?;
        let conn = self.open()?;
        if let Some(stage_id) = stage_id {
            if !Self::stage_exists(&conn, &tenant.tenant_id, stage_id)? {
                return Err(anyhow!("stage not found for tenant: {stage_id}"));
            }
        }
        let changed = conn.execute(
            "UPDATE conversations SET stage_id = ?3, updated_at = ?4
             WHERE tenant_id = ?1 AND conversation_id = ?2",
            params![tenant.tenant_id, conversation_id, stage_id, now],
        )?;
        if changed == 0 {
            return Err(anyhow!("conversation not found: {conversation_id}"));
        }
        let updated = Self::fetch_conversation(&conn, &tenant.tenant_id, conversation_id)?
            .ok_or_else(|| anyhow!("conversation not found: {conversation_id}"))?;
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
        self.ensure_initialized()?;
        let conn = self.open()?;
        let changed = conn.execute(
            "UPDATE conversations SET status = ?3, updated_at = ?4
             WHERE tenant_id = ?1 AND conversation_id = ?2",
            params![tenant.tenant_id, conversation_id, status.as_str(), now],
        )?;
        if changed == 0 {
            return Err(anyhow!("conversation not found: {conversation_id}"));
        }
        let updated = Self::fetch_conversation(&conn, &tenant.tenant_id, conversation_id)?
            .ok_or_else(|| anyhow!("conversation not found: {conversation_id}"))?;
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
        self.ensure_initialized()?;
        let conn = self.open()?;
        Self::fetch_state(&conn, &tenant.tenant_id, phone)
    }

    fn list_conversation_states(
        &self,
        tenant: &TenantContext,
    ) -> Result<Vec<ConversationStateRecord>> {
        self.ensure_initialized()?;
        let conn = self.open()?;
        let mut stmt = conn.prepare(
            "SELECT tenant_id, phone, is_ai_active, operator_id, operator_takeover_at,
                    triage_stage, ai_payload, updated_at
             FROM conversation_states WHERE tenant_id = ?1 ORDER BY phone ASC",
        )?;
        let rows = stmt.query_map(params![tenant.tenant_id], Self::map_state)?;
        let mut items = Vec::new();
        for row in rows {
            items.push(row?);
        }
        Ok(items)
    }

    fn upsert_conversation_state(
        &self,
        tenant: &TenantContext,
        record: &ConversationStateRecord,
    ) -> Result<()> {
        if tenant.tenant_id != record.tenant_id {
            return Err(anyhow!("record tenant does not match the session tenant"));
        }
        if !record.is_consistent() {
            return Err(anyhow!(
                "operator_id must be set exactly when is_ai_active is false"
            ));
        }
        self.ensure_initialized()?;
        let conn = self.open()?;
        let existing: Option<i64> = conn
            .query_row(
                "SELECT 1 FROM conversation_states WHERE tenant_id = ?1 AND phone = ?2",
                params![tenant.tenant_id, record.phone],
                |row| row.get(0),
            )
            .optional()?;
        let op = if existing.is_some() {
            FeedOp::Update
        } else {
            FeedOp::Insert
        };
        let payload = serde_json::to_string(&record.ai_payload)
            .unwrap_or_else(|_| "null".to_string());
        conn.execute(
            "INSERT INTO conversation_states
               (tenant_id, phone, is_ai_active, operator_id, operator_takeover_at,
                triage_stage, ai_payload, updated_at)
             VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8)
             ON CONFLICT (tenant_id, phone) DO UPDATE SET
               is_ai_active = excluded.is_ai_active,
               operator_id = excluded.operator_id,
               operator_takeover_at = excluded.operator_takeover_at,
               triage_stage = excluded.triage_stage,
               ai_payload = excluded.ai_payload,
               updated_at = excluded.updated_at",
            params![
                record.tenant_id,
                record.phone,
                record.is_ai_active as i64,
                record.operator_id,
                record.operator_takeover_at,
                record.triage_stage.as_str(),
                payload,
                record.updated_at,
            ],
        )?;
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
        self.ensure_initialized()?;
        let mut conn = self.open()?;
        let updated = {
            let tx = conn.transaction_with_behavior(TransactionBehavior::Immediate)?;
            let mut record = Self::fetch_state(&tx, &tenant.tenant_id, phone)?
                .ok_or_else(|| anyhow!("conversation state not found: {phone}"))?;
            record.is_ai_active = is_ai_active;
            record.operator_id = operator_id.map(str::to_string);
            if let Some(at) = takeover_at {
                record.operator_takeover_at = Some(at);
            }
            record.updated_at = now;
            tx.execute(
                "UPDATE conversation_states
                 SET is_ai_active = ?3, operator_id = ?4, operator_takeover_at = ?5,
                     updated_at = ?6
                 WHERE tenant_id = ?1 AND phone = ?2",
                params![
                    tenant.tenant_id,
                    phone,
                    record.is_ai_active as i64,
                    record.operator_id,
                    record.operator_takeover_at,
                    record.updated_at,
                ],
            )?;
            tx.commit()?;
            record
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
        if tenant.tenant_id != record.tenant_id {
            return Err(anyhow!("record tenant does not match the session tenant"));
        }
        self.ensure_initialized()?;
        let conn = self.open()?;
        let existing = Self::stage_exists(&conn, &tenant.tenant_id, &record.stage_id)?;
        conn.execute(
            "INSERT INTO stages
               (stage_id, tenant_id, name, color, order_index, department, created_at)
             VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7)
             ON CONFLICT (tenant_id, stage_id) DO UPDATE SET
               name = excluded.name,
               color = excluded.color,
               order_index = excluded.order_index,
               department = excluded.department",
            params![
                record.stage_id,
                record.tenant_id,
                record.name,
                record.color,
                record.order_index,
                record.department,
                record.created_at,
            ],
        )?;
        publish_change(
            self.feed.as_ref(),
            FeedTable::Stages,
            if existing { FeedOp::Update } else { FeedOp::Insert },
            &tenant.tenant_id,
            &record.stage_id,
            record,
        );
        Ok(())
    }

    fn get_stage(&self, tenant: &TenantContext, stage_id: &str) -> Result<Option<StageRecord>> {
        self.ensure_initialized()?;
        let conn = self.open()?;
        let record = conn
            .query_row(
                "SELECT stage_id, tenant_id, name, color, order_index, department, created_at
                 FROM stages WHERE tenant_id = ?1 AND stage_id = ?2",
                params![tenant.tenant_id, stage_id],
                Self::map_stage,
            )
            .optional()?;
        Ok(record)
    }

    fn list_stages(
        &self,
        tenant: &TenantContext,
        department: Option<&str>,
    ) -> Result<Vec<StageRecord>> {
        self.ensure_initialized()?;
        let conn = self.open()?;
        // Ties on order_index fall back to rowid, the insertion order.
        let mut stmt = conn.prepare(
            "SELECT stage_id, tenant_id, name, color, order_index, department, created_at
             FROM stages
             WHERE tenant_id = ?1 AND (?2 IS NULL OR department IS NULL OR department = ?2)
             ORDER BY order_index ASC, rowid ASC",
        )?;
        let rows = stmt.query_map(params![tenant.tenant_id, department], Self::map_stage)?;
        let mut items = Vec::new();
        for row in rows {
            items.push(row?);
        }
        Ok(items)
    }

    fn delete_stage(&self, tenant: &TenantContext, stage_id: &str) -> Result<bool> {
        self.ensure_initialized()?;
        let conn = self.open()?;
        let deleted = conn.execute(
            "DELETE FROM stages WHERE tenant_id = ?1 AND stage_id = ?2",
            params![tenant.tenant_id, stage_id],
        )?;
        Ok(deleted > 0)
    }

    fn upsert_contact(&self, tenant: &TenantContext, record: &ContactRecord) -> Result<()> {
        if tenant.tenant_id != record.tenant_id {
            return Err(anyhow!("record tenant does not match the session tenant"));
        }
        self.ensure_initialized()?;
        let conn = self.open()?;
        let existing: Option<i64> = conn
            .query_row(
                "SELECT 1 FROM contacts WHERE tenant_id = ?1 AND contact_id = ?2",
                params![tenant.tenant_id, record.contact_id],
                |row| row.get(0),
            )
            .optional()?;
        conn.execute(
            "INSERT INTO contacts (contact_id, tenant_id, name, phone, created_at)
             VALUES (?1, ?2, ?3, ?4, ?5)
             ON CONFLICT (tenant_id, contact_id) DO UPDATE SET
               name = excluded.name,
               phone = excluded.phone",
            params![
                record.contact_id,
                record.tenant_id,
                record.name,
                record.phone,
                record.created_at,
            ],
        )?;
        publish_change(
            self.feed.as_ref(),
            FeedTable::Contacts,
            if existing.is_some() {
                FeedOp::Update
            } else {
                FeedOp::Insert
            },
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
        self.ensure_initialized()?;
        let conn = self.open()?;
        let record = conn
            .query_row(
                "SELECT contact_id, tenant_id, name, phone, created_at
                 FROM contacts WHERE tenant_id = ?1 AND contact_id = ?2",
                params![tenant.tenant_id, contact_id],
                Self::map_contact,
            )
            .optional()?;
        Ok(record)
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
        self.ensure_initialized()?;
        let mut conn = self.open()?;
        let (message, conversation) = {
            let tx = conn.transaction_with_behavior(TransactionBehavior::Immediate)?;
            let existing = Self::fetch_conversation(&tx, &tenant.tenant_id, conversation_id)?
                .ok_or_else(|| anyhow!("conversation not found: {conversation_id}"))?;
            let media_json = media
                .map(serde_json::to_string)
                .transpose()
                .unwrap_or(None);
            tx.execute(
                "INSERT INTO messages
                   (tenant_id, conversation_id, direction, body, media, created_at)
                 VALUES (?1, ?2, ?3, ?4, ?5, ?6)",
                params![
                    tenant.tenant_id,
                    conversation_id,
                    direction.as_str(),
                    body,
                    media_json,
                    now,
                ],
            )?;
            let message_id = tx.last_insert_rowid();
            tx.execute(
                "UPDATE conversations SET last_message_at = ?3, updated_at = ?3
                 WHERE tenant_id = ?1 AND conversation_id = ?2",
                params![tenant.tenant_id, conversation_id, now],
            )?;
            tx.commit()?;
            let message = MessageRecord {
                message_id,
                tenant_id: tenant.tenant_id.clone(),
                conversation_id: conversation_id.to_string(),
                direction,
                body: body.map(str::to_string),
                media: media.cloned(),
                created_at: now,
            };
            let mut conversation = existing;
            conversation.last_message_at = now;
            conversation.updated_at = now;
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
        self.ensure_initialized()?;
        let conn = self.open()?;
        let capped = if limit <= 0 { i64::MAX } else { limit };
        let mut stmt = conn.prepare(
            "SELECT message_id, tenant_id, conversation_id, direction, body, media, created_at
             FROM messages WHERE tenant_id = ?1 AND conversation_id = ?2
             ORDER BY message_id DESC LIMIT ?3",
        )?;
        let rows = stmt.query_map(
            params![tenant.tenant_id, conversation_id, capped],
            Self::map_message,
        )?;
        let mut items = Vec::new();
        for row in rows {
            items.push(row?);
        }
        items.reverse();
        Ok(items)
    }
}
