use imovia::model::{
    ConversationRecord, ConversationStateRecord, ConversationStatus, MessageDirection,
    StageRecord, TriageStage,
};
use imovia::storage::{ConversationFilter, DirectoryStore};
use imovia::{
    Config, DashboardSession, FeedHub, FeedTransport, HubTransport, OwnershipIndicator,
    SqliteDirectoryStore, TenantContext,
};
use serde_json::json;
use std::sync::Arc;
use std::time::Duration;

fn now_ts() -> f64 {
    chrono::Utc::now().timestamp_millis() as f64 / 1000.0
}

fn tenant() -> TenantContext {
    TenantContext::new("tenant_a")
}

fn build_session(tag: &str) -> (DashboardSession, Arc<SqliteDirectoryStore>) {
    let db_path = std::env::temp_dir().join(format!(
        "imovia_{tag}_{}.db",
        uuid::Uuid::new_v4().simple()
    ));
    let hub = Arc::new(FeedHub::new(64));
    let store = Arc::new(
        SqliteDirectoryStore::new(db_path.to_string_lossy().to_string()).with_feed(hub.clone()),
    );
    store.ensure_initialized().unwrap();
    let transport: Arc<dyn FeedTransport> = Arc::new(HubTransport::new(hub.clone()));
    let session = DashboardSession::from_parts(
        Config::default(),
        "tenant_a",
        store.clone() as Arc<dyn DirectoryStore>,
        hub,
        transport,
    )
    .unwrap();
    (session, store)
}

fn seed_conversation(store: &SqliteDirectoryStore, id: &str, phone: &str) {
    let now = now_ts();
    store
        .upsert_conversation(
            &tenant(),
            &ConversationRecord {
                conversation_id: id.to_string(),
                tenant_id: "tenant_a".to_string(),
                phone: phone.to_string(),
                contact_id: None,
                department: None,
                stage_id: None,
                status: ConversationStatus::Active,
                last_message_at: now,
                created_at: now,
                updated_at: now,
            },
        )
        .unwrap();
    store
        .upsert_conversation_state(
            &tenant(),
            &ConversationStateRecord {
                tenant_id: "tenant_a".to_string(),
                phone: phone.to_string(),
                is_ai_active: true,
                operator_id: None,
                operator_takeover_at: None,
                triage_stage: TriageStage::AwaitingTriage,
                ai_payload: json!({}),
                updated_at: now,
            },
        )
        .unwrap();
}

async fn settle() {
    tokio::time::sleep(Duration::from_millis(50)).await;
}

#[tokio::test]
async fn inbox_reflects_takeover_through_the_feed() {
    let (session, store) = build_session("session_inbox");
    seed_conversation(&store, "c1", "5511988880001");

    let mut inbox = session.open_inbox(ConversationFilter::default()).unwrap();
    let snapshot = inbox.snapshot();
    assert_eq!(snapshot.len(), 1);
    assert_eq!(snapshot[0].ownership, OwnershipIndicator::AiActive);

    session.handoff().takeover("5511988880001", "op_ana").unwrap();
    for _ in 0..50 {
        if inbox.snapshot()[0].ownership == OwnershipIndicator::OperatorOwned {
            break;
        }
        tokio::time::timeout(Duration::from_millis(200), inbox.changed())
            .await
            .ok();
    }
    assert_eq!(
        inbox.snapshot()[0].ownership,
        OwnershipIndicator::OperatorOwned
    );
    inbox.close();
}

#[tokio::test]
async fn inbound_message_bumps_the_inbox_and_reaches_the_transcript() {
    let (session, store) = build_session("session_message");
    seed_conversation(&store, "c1", "5511988880002");
    seed_conversation(&store, "c2", "5511988880003");

    let mut inbox = session.open_inbox(ConversationFilter::default()).unwrap();
    let mut transcript = session.open_transcript("c2").unwrap();
    assert!(transcript.snapshot().messages.is_empty());

    store
        .append_message(
            &tenant(),
            "c2",
            MessageDirection::Inbound,
            Some("tem apartamento de 2 quartos?"),
            None,
            now_ts() + 60.0,
        )
        .unwrap();

    for _ in 0..50 {
        let snapshot = transcript.snapshot();
        if !snapshot.messages.is_empty() {
            break;
        }
        tokio::time::timeout(Duration::from_millis(200), transcript.changed())
            .await
            .ok();
    }
    let snapshot = transcript.snapshot();
    assert_eq!(snapshot.messages.len(), 1);
    assert_eq!(snapshot.scroll_generation, 1);

    for _ in 0..50 {
        if inbox.snapshot()[0].conversation_id == "c2" {
            break;
        }
        tokio::time::timeout(Duration::from_millis(200), inbox.changed())
            .await
            .ok();
    }
    // The conversation that just received a message sorts first.
    assert_eq!(inbox.snapshot()[0].conversation_id, "c2");
    inbox.close();
    transcript.close();
}

#[tokio::test]
async fn operator_reply_lands_as_outbound_message() {
    let (session, store) = build_session("session_reply");
    seed_conversation(&store, "c1", "5511988880004");
    session.handoff().takeover("5511988880004", "op_ana").unwrap();

    let transcript = session.open_transcript("c1").unwrap();
    let sent = transcript
        .send(Some("posso agendar uma visita amanha".to_string()), None)
        .await
        .unwrap();
    assert_eq!(sent.direction, MessageDirection::Outbound);

    let history = store.list_recent_messages(&tenant(), "c1", 10).unwrap();
    assert_eq!(history.len(), 1);
    assert_eq!(history[0].message_id, sent.message_id);
    transcript.close();
}

#[tokio::test]
async fn board_sees_stage_created_after_open() {
    let (session, store) = build_session("session_board");
    seed_conversation(&store, "c1", "5511988880005");
    let mut board = session.open_board(None).unwrap();
    assert_eq!(board.snapshot().len(), 1); // unassigned only

    store
        .upsert_stage(
            &tenant(),
            &StageRecord {
                stage_id: "novo".to_string(),
                tenant_id: "tenant_a".to_string(),
                name: "Novo".to_string(),
                color: "#3366ff".to_string(),
                order_index: 0,
                department: None,
                created_at: now_ts(),
            },
        )
        .unwrap();
    for _ in 0..50 {
        if board.snapshot().len() == 2 {
            break;
        }
        tokio::time::timeout(Duration::from_millis(200), board.changed())
            .await
            .ok();
    }
    assert_eq!(board.snapshot().len(), 2);

    let moved = board.move_card("c1", "novo").await.unwrap();
    assert_eq!(moved.stage_id.as_deref(), Some("novo"));
    board.close();
}

#[tokio::test]
async fn closing_a_view_stops_its_loop() {
    let (session, store) = build_session("session_teardown");
    seed_conversation(&store, "c1", "5511988880006");
    let inbox = session.open_inbox(ConversationFilter::default()).unwrap();
    inbox.close();
    settle().await;

    // Writes after teardown must not wedge the publisher.
    store
        .append_message(
            &tenant(),
            "c1",
            MessageDirection::Inbound,
            Some("ainda ai?"),
            None,
            now_ts(),
        )
        .unwrap();
}
