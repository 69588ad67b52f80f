// Dashboard session: wires storage, the change feed and the handoff
// controller for one tenant, and runs one reconciliation loop per open
// view. Each loop owns its projector; views observe watch snapshots and
// talk to the loop over a command channel.

use crate::config::Config;
use crate::feed::{FeedClient, FeedHub, FeedNotice, FeedTable, FeedTransport, HubTransport};
use crate::handoff::HandoffController;
use crate::inbox::{InboxProjector, InboxSummary};
use crate::model::{
    now_ts, ConversationRecord, MediaDescriptor, MessageDirection, MessageRecord, TenantContext,
};
use crate::pipeline::{ColumnRegion, ColumnView, PipelineBoard};
use crate::storage::{build_storage, ConversationFilter, DirectoryStore};
use crate::transcript::ChatTranscript;
use anyhow::{anyhow, Result};
use std::sync::Arc;
use tokio::sync::{mpsc, oneshot, watch};
use tokio::task::JoinHandle;
use tracing::warn;

#[derive(Clone)]
pub struct DashboardSession {
    tenant: TenantContext,
    config: Config,
    store: Arc<dyn DirectoryStore>,
    hub: Arc<FeedHub>,
    feed: Arc<FeedClient>,
    handoff: Arc<HandoffController>,
}

impl DashboardSession {
    /// Builds the full stack from configuration: store, in-process feed
    /// hub and a feed client connected through it.
    pub fn new(config: Config, tenant_id: &str) -> Result<Self> {
        let hub = Arc::new(FeedHub::new(config.feed.buffer));
        let store = build_storage(&config.storage, hub.clone())?;
        store.ensure_initialized()?;
        let transport: Arc<dyn FeedTransport> = Arc::new(HubTransport::new(hub.clone()));
        Self::from_parts(config, tenant_id, store, hub, transport)
    }

    /// Assembly from pre-built parts; tests inject their own store or
    /// transport here.
    pub fn from_parts(
        config: Config,
        tenant_id: &str,
        store: Arc<dyn DirectoryStore>,
        hub: Arc<FeedHub>,
        transport: Arc<dyn FeedTransport>,
    ) -> Result<Self> {
        let tenant = TenantContext::new(tenant_id);
        let feed = Arc::new(FeedClient::new(tenant_id, transport, config.feed.clone()));
        let handoff = Arc::new(HandoffController::new(store.clone(), tenant.clone()));
        Ok(Self {
            tenant,
            config,
            store,
            hub,
            feed,
            handoff,
        })
    }

    pub fn tenant(&self) -> &TenantContext {
        &self.tenant
    }

    pub fn store(&self) -> Arc<dyn DirectoryStore> {
        self.store.clone()
    }

    pub fn hub(&self) -> Arc<FeedHub> {
        self.hub.clone()
    }

    pub fn handoff(&self) -> Arc<HandoffController> {
        self.handoff.clone()
    }

    /// Opens the inbox view and starts its reconciliation loop.
    pub fn open_inbox(&self, filter: ConversationFilter) -> Result<InboxHandle> {
        let mut projector = InboxProjector::new(
            self.store.clone(),
            self.tenant.clone(),
            filter,
            &self.config.inbox,
        );
        projector.load()?;
        let (snapshot_tx, snapshot_rx) = watch::channel(projector.summaries());
        let (command_tx, mut command_rx) = mpsc::channel::<InboxCommand>(32);
        let mut listener = self.feed.listen(&[
            FeedTable::Conversations,
            FeedTable::ConversationStates,
            FeedTable::Messages,
            FeedTable::Contacts,
        ]);
        let task = tokio::spawn(async move {
            loop {
                tokio::select! {
                    notice = listener.recv() => match notice {
                        Some(FeedNotice::Event(event)) => {
                            if let Err(err) = projector.apply_event(&event) {
                                warn!(error = %err, "inbox event apply failed");
                            }
                            let _ = snapshot_tx.send(projector.summaries());
                        }
                        Some(FeedNotice::Resync) => {
                            if let Err(err) = projector.load() {
                                warn!(error = %err, "inbox resync reload failed");
                            }
                            let _ = snapshot_tx.send(projector.summaries());
                        }
                        None => break,
                    },
                    command = command_rx.recv() => match command {
                        Some(InboxCommand::Search { query, reply }) => {
                            let _ = reply.send(projector.search(&query));
                        }
                        Some(InboxCommand::SetFilter { filter, reply }) => {
                            projector.set_filter(filter);
                            let result = projector.load();
                            let _ = snapshot_tx.send(projector.summaries());
                            let _ = reply.send(result);
                        }
                        None => break,
                    },
                }
            }
        });
        Ok(InboxHandle {
            commands: command_tx,
            snapshots: snapshot_rx,
            task,
        })
    }

    /// Opens the pipeline board and starts its reconciliation loop.
    pub fn open_board(&self, department: Option<String>) -> Result<BoardHandle> {
        let mut board = PipelineBoard::new(self.store.clone(), self.tenant.clone(), department);
        board.load()?;
        let (snapshot_tx, snapshot_rx) = watch::channel(board.columns());
        let (command_tx, mut command_rx) = mpsc::channel::<BoardCommand>(32);
        let mut listener = self.feed.listen(&[
            FeedTable::Conversations,
            FeedTable::Messages,
            FeedTable::Stages,
        ]);
        let task = tokio::spawn(async move {
            loop {
                tokio::select! {
                    notice = listener.recv() => match notice {
                        Some(FeedNotice::Event(event)) => {
                            if let Err(err) = board.apply_event(&event) {
                                warn!(error = %err, "board event apply failed");
                            }
                            let _ = snapshot_tx.send(board.columns());
                        }
                        Some(FeedNotice::Resync) => {
                            if let Err(err) = board.load() {
                                warn!(error = %err, "board resync reload failed");
                            }
                            let _ = snapshot_tx.send(board.columns());
                        }
                        None => break,
                    },
                    command = command_rx.recv() => match command {
                        Some(BoardCommand::MoveCard { conversation_id, target_stage_id, reply }) => {
                            let result = board.move_card(&conversation_id, &target_stage_id);
                            let _ = snapshot_tx.send(board.columns());
                            let _ = reply.send(result);
                        }
                        Some(BoardCommand::DropCard { conversation_id, release_x, regions, reply }) => {
                            let result = board.drop_card(&conversation_id, release_x, &regions);
                            let _ = snapshot_tx.send(board.columns());
                            let _ = reply.send(result);
                        }
                        None => break,
                    },
                }
            }
        });
        Ok(BoardHandle {
            commands: command_tx,
            snapshots: snapshot_rx,
            task,
        })
    }

    /// Opens one conversation's transcript and starts its loop.
    pub fn open_transcript(&self, conversation_id: &str) -> Result<TranscriptHandle> {
        let mut transcript = ChatTranscript::new(
            self.store.clone(),
            self.tenant.clone(),
            conversation_id,
            &self.config.transcript,
        );
        transcript.load()?;
        let store = self.store.clone();
        let tenant = self.tenant.clone();
        let conversation_id = conversation_id.to_string();
        let (snapshot_tx, snapshot_rx) = watch::channel(TranscriptSnapshot {
            messages: transcript.messages().to_vec(),
            scroll_generation: transcript.scroll_generation(),
        });
        let (command_tx, mut command_rx) = mpsc::channel::<TranscriptCommand>(32);
        let mut listener = self.feed.listen(&[FeedTable::Messages]);
        let task = tokio::spawn(async move {
            loop {
                tokio::select! {
                    notice = listener.recv() => match notice {
                        Some(FeedNotice::Event(event)) => {
                            if let Err(err) = transcript.apply_event(&event) {
                                warn!(error = %err, "transcript event apply failed");
                            }
                            let _ = snapshot_tx.send(TranscriptSnapshot {
                                messages: transcript.messages().to_vec(),
                                scroll_generation: transcript.scroll_generation(),
                            });
                        }
                        Some(FeedNotice::Resync) => {
                            if let Err(err) = transcript.load() {
                                warn!(error = %err, "transcript resync reload failed");
                            }
                            let _ = snapshot_tx.send(TranscriptSnapshot {
                                messages: transcript.messages().to_vec(),
                                scroll_generation: transcript.scroll_generation(),
                            });
                        }
                        None => break,
                    },
                    command = command_rx.recv() => match command {
                        Some(TranscriptCommand::Send { body, media, reply }) => {
                            let result = send_operator_message(
                                store.as_ref(),
                                &tenant,
                                &conversation_id,
                                body.as_deref(),
                                media.as_ref(),
                            );
                            let _ = reply.send(result);
                        }
                        None => break,
                    },
                }
            }
        });
        Ok(TranscriptHandle {
            commands: command_tx,
            snapshots: snapshot_rx,
            task,
        })
    }
}

fn send_operator_message(
    store: &dyn DirectoryStore,
    tenant: &TenantContext,
    conversation_id: &str,
    body: Option<&str>,
    media: Option<&MediaDescriptor>,
) -> Result<MessageRecord> {
    if body.map(str::trim).filter(|text| !text.is_empty()).is_none() && media.is_none() {
        return Err(anyhow!("message requires a body or media"));
    }
    store.append_message(
        tenant,
        conversation_id,
        MessageDirection::Outbound,
        body,
        media,
        now_ts(),
    )
}

pub enum InboxCommand {
    Search {
        query: String,
        reply: oneshot::Sender<Vec<InboxSummary>>,
    },
    SetFilter {
        filter: ConversationFilter,
        reply: oneshot::Sender<Result<()>>,
    },
}

pub enum BoardCommand {
    MoveCard {
        conversation_id: String,
        target_stage_id: String,
        reply: oneshot::Sender<Result<ConversationRecord>>,
    },
    DropCard {
        conversation_id: String,
        release_x: f64,
        regions: Vec<ColumnRegion>,
        reply: oneshot::Sender<Result<Option<ConversationRecord>>>,
    },
}

pub enum TranscriptCommand {
    Send {
        body: Option<String>,
        media: Option<MediaDescriptor>,
        reply: oneshot::Sender<Result<MessageRecord>>,
    },
}

#[derive(Debug, Clone)]
pub struct TranscriptSnapshot {
    pub messages: Vec<MessageRecord>,
    pub scroll_generation: u64,
}

pub struct InboxHandle {
    commands: mpsc::Sender<InboxCommand>,
    snapshots: watch::Receiver<Vec<InboxSummary>>,
    task: JoinHandle<()>,
}

impl InboxHandle {
    pub fn snapshot(&self) -> Vec<InboxSummary> {
        self.snapshots.borrow().clone()
    }

    pub async fn changed(&mut self) -> Result<()> {
        self.snapshots
            .changed()
            .await
            .map_err(|_| anyhow!("inbox loop stopped"))
    }

    pub async fn search(&self, query: &str) -> Result<Vec<InboxSummary>> {
        let (reply, response) = oneshot::channel();
        self.commands
            .send(InboxCommand::Search {
                query: query.to_string(),
                reply,
            })
            .await
            .map_err(|_| anyhow!("inbox loop stopped"))?;
        response.await.map_err(|_| anyhow!("inbox loop stopped"))
    }

    pub async fn set_filter(&self, filter: ConversationFilter) -> Result<()> {
        let (reply, response) = oneshot::channel();
        self.commands
            .send(InboxCommand::SetFilter { filter, reply })
            .await
            .map_err(|_| anyhow!("inbox loop stopped"))?;
        response.await.map_err(|_| anyhow!("inbox loop stopped"))?
    }

    pub fn close(self) {
        self.task.abort();
    }
}

impl Drop for InboxHandle {
    fn drop(&mut self) {
        self.task.abort();
    }
}

pub struct BoardHandle {
    commands: mpsc::Sender<BoardCommand>,
    snapshots: watch::Receiver<Vec<ColumnView>>,
    task: JoinHandle<()>,
}

impl BoardHandle {
    pub fn snapshot(&self) -> Vec<ColumnView> {
        self.snapshots.borrow().clone()
    }

    pub async fn changed(&mut self) -> Result<()> {
        self.snapshots
            .changed()
            .await
            .map_err(|_| anyhow!("board loop stopped"))
    }

    pub async fn move_card(
        &self,
        conversation_id: &str,
        target_stage_id: &str,
    ) -> Result<ConversationRecord> {
        let (reply, response) = oneshot::channel();
        self.commands
            .send(BoardCommand::MoveCard {
                conversation_id: conversation_id.to_string(),
                target_stage_id: target_stage_id.to_string(),
                reply,
            })
            .await
            .map_err(|_| anyhow!("board loop stopped"))?;
        response.await.map_err(|_| anyhow!("board loop stopped"))?
    }

    pub async fn drop_card(
        &self,
        conversation_id: &str,
        release_x: f64,
        regions: Vec<ColumnRegion>,
    ) -> Result<Option<ConversationRecord>> {
        let (reply, response) = oneshot::channel();
        self.commands
            .send(BoardCommand::DropCard {
                conversation_id: conversation_id.to_string(),
                release_x,
                regions,
                reply,
            })
            .await
            .map_err(|_| anyhow!("board loop stopped"))?;
        response.await.map_err(|_| anyhow!("board loop stopped"))?
    }

    pub fn close(self) {
        self.task.abort();
    }
}

impl Drop for BoardHandle {
    fn drop(&mut self) {
        self.task.abort();
    }
}

pub struct TranscriptHandle {
    commands: mpsc::Sender<TranscriptCommand>,
    snapshots: watch::Receiver<TranscriptSnapshot>,
    task: JoinHandle<()>,
}

impl TranscriptHandle {
    pub fn snapshot(&self) -> TranscriptSnapshot {
        self.snapshots.borrow().clone()
    }

    pub async fn changed(&mut self) -> Result<()> {
        self.snapshots
            .changed()
            .await
            .map_err(|_| anyhow!("transcript loop stopped"))
    }

    /// Operator reply while in takeover; persisted as an outbound
    /// message and echoed back through the feed.
    pub async fn send(
        &self,
        body: Option<String>,
        media: Option<MediaDescriptor>,
    ) -> Result<MessageRecord> {
        let (reply, response) = oneshot::channel();
        self.commands
            .send(TranscriptCommand::Send { body, media, reply })
            .await
            .map_err(|_| anyhow!("transcript loop stopped"))?;
        response
            .await
            .map_err(|_| anyhow!("transcript loop stopped"))?
    }

    pub fn close(self) {
        self.task.abort();
    }
}

impl Drop for TranscriptHandle {
    fn drop(&mut self) {
        self.task.abort();
    }
}
