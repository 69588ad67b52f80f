// Domain records shared by the handoff core: conversations, ownership
// state, pipeline stages and transcript messages.

use chrono::Utc;
use serde::{Deserialize, Serialize};
use serde_json::Value;

pub fn now_ts() -> f64 {
    Utc::now().timestamp_millis() as f64 / 1000.0
}

/// Tenant scope injected by the calling context, never parsed from
/// end-user input. Every store call is bound to one of these.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct TenantContext {
    pub tenant_id: String,
}

impl TenantContext {
    pub fn new(tenant_id: impl Into<String>) -> Self {
        Self {
            tenant_id: tenant_id.into(),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ConversationStatus {
    Active,
    Closed,
    Archived,
}

impl ConversationStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Active => "active",
            Self::Closed => "closed",
            Self::Archived => "archived",
        }
    }

    pub fn parse(value: &str) -> Option<Self> {
        match value.trim().to_ascii_lowercase().as_str() {
            "active" => Some(Self::Active),
            "closed" => Some(Self::Closed),
            "archived" => Some(Self::Archived),
            _ => None,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum MessageDirection {
    Inbound,
    Outbound,
}

impl MessageDirection {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Inbound => "inbound",
            Self::Outbound => "outbound",
        }
    }

    pub fn parse(value: &str) -> Option<Self> {
        match value.trim().to_ascii_lowercase().as_str() {
            "inbound" => Some(Self::Inbound),
            "outbound" => Some(Self::Outbound),
            _ => None,
        }
    }
}

/// The AI pipeline's own conversational progress marker. Distinct from
/// the operator-facing pipeline stage; this core only reads it.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TriageStage {
    Greeting,
    AwaitingName,
    AwaitingTriage,
    Completed,
}

impl TriageStage {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Greeting => "greeting",
            Self::AwaitingName => "awaiting_name",
            Self::AwaitingTriage => "awaiting_triage",
            Self::Completed => "completed",
        }
    }

    pub fn parse(value: &str) -> Option<Self> {
        match value.trim().to_ascii_lowercase().as_str() {
            "greeting" => Some(Self::Greeting),
            "awaiting_name" => Some(Self::AwaitingName),
            "awaiting_triage" => Some(Self::AwaitingTriage),
            "completed" => Some(Self::Completed),
            _ => None,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum OwnershipIndicator {
    AiActive,
    OperatorOwned,
    Unknown,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ConversationRecord {
    pub conversation_id: String,
    pub tenant_id: String,
    pub phone: String,
    pub contact_id: Option<String>,
    pub department: Option<String>,
    pub stage_id: Option<String>,
    pub status: ConversationStatus,
    pub last_message_at: f64,
    pub created_at: f64,
    pub updated_at: f64,
}

/// Authoritative ownership record, one row per (tenant, phone).
/// `ai_payload` carries the AI pipeline's bookkeeping (pending property
/// list, last AI messages, feedback flag) and is opaque to this core.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ConversationStateRecord {
    pub tenant_id: String,
    pub phone: String,
    pub is_ai_active: bool,
    pub operator_id: Option<String>,
    pub operator_takeover_at: Option<f64>,
    pub triage_stage: TriageStage,
    pub ai_payload: Value,
    pub updated_at: f64,
}

impl ConversationStateRecord {
    pub fn ownership(&self) -> OwnershipIndicator {
        if self.is_ai_active {
            OwnershipIndicator::AiActive
        } else {
            OwnershipIndicator::OperatorOwned
        }
    }

    /// Invariant: operator_id is set exactly when the AI is inactive.
    pub fn is_consistent(&self) -> bool {
        self.is_ai_active == self.operator_id.is_none()
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ContactRecord {
    pub contact_id: String,
    pub tenant_id: String,
    pub name: String,
    pub phone: String,
    pub created_at: f64,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct StageRecord {
    pub stage_id: String,
    pub tenant_id: String,
    pub name: String,
    pub color: String,
    pub order_index: i64,
    pub department: Option<String>,
    pub created_at: f64,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct MediaDescriptor {
    pub kind: String,
    pub url: String,
    #[serde(default)]
    pub mime: Option<String>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct MessageRecord {
    pub message_id: i64,
    pub tenant_id: String,
    pub conversation_id: String,
    pub direction: MessageDirection,
    pub body: Option<String>,
    pub media: Option<MediaDescriptor>,
    pub created_at: f64,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn status_round_trips_through_strings() {
        for status in [
            ConversationStatus::Active,
            ConversationStatus::Closed,
            ConversationStatus::Archived,
        ] {
            assert_eq!(ConversationStatus::parse(status.as_str()), Some(status));
        }
        assert_eq!(ConversationStatus::parse("deleted"), None);
    }

    #[test]
    fn ownership_consistency_matches_invariant() {
        let mut state = ConversationStateRecord {
            tenant_id: "t1".to_string(),
            phone: "5511999990000".to_string(),
            is_ai_active: true,
            operator_id: None,
            operator_takeover_at: None,
            triage_stage: TriageStage::Greeting,
            ai_payload: serde_json::json!({}),
            updated_at: now_ts(),
        };
        assert!(state.is_consistent());
        assert_eq!(state.ownership(), OwnershipIndicator::AiActive);

        state.is_ai_active = false;
        assert!(!state.is_consistent());
        state.operator_id = Some("op_1".to_string());
        assert!(state.is_consistent());
        assert_eq!(state.ownership(), OwnershipIndicator::OperatorOwned);
    }
}
