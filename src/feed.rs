// Event feed: change notifications from the directory store fanned out
// to projectors. Delivery is at-least-once and unordered across rows;
// gaps (reconnect, lagged listener) are closed by a fresh snapshot, not
// by replay.

use crate::config::FeedConfig;
use anyhow::Result;
use async_trait::async_trait;
use dashmap::DashMap;
use futures::StreamExt;
use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{broadcast, mpsc};
use tokio::task::JoinHandle;
use tokio_stream::wrappers::errors::BroadcastStreamRecvError;
use tokio_stream::wrappers::BroadcastStream;
use tracing::{debug, warn};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum FeedTable {
    Conversations,
    ConversationStates,
    Messages,
    Stages,
    Contacts,
}

impl FeedTable {
    pub const ALL: [FeedTable; 5] = [
        FeedTable::Conversations,
        FeedTable::ConversationStates,
        FeedTable::Messages,
        FeedTable::Stages,
        FeedTable::Contacts,
    ];

    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Conversations => "conversations",
            Self::ConversationStates => "conversation_states",
            Self::Messages => "messages",
            Self::Stages => "stages",
            Self::Contacts => "contacts",
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum FeedOp {
    Insert,
    Update,
}

/// One row change. `entity_id` is the merge key consumers de-duplicate
/// on: conversation id, phone for state rows, numeric id for messages.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ChangeEvent {
    pub table: FeedTable,
    pub op: FeedOp,
    pub tenant_id: String,
    pub entity_id: String,
    pub row: Value,
}

#[derive(Debug, Clone)]
pub enum FeedNotice {
    Event(ChangeEvent),
    /// A gap happened (transport drop or lagged listener); the consumer
    /// must reload a fresh snapshot before trusting further events.
    Resync,
}

/// In-process fanout over the directory store's change log. One
/// broadcast channel per (tenant, table); channels with no remaining
/// receivers are pruned on the next publish.
pub struct FeedHub {
    buffer: usize,
    channels: DashMap<(String, FeedTable), broadcast::Sender<ChangeEvent>>,
}

impl FeedHub {
    pub fn new(buffer: usize) -> Self {
        Self {
            buffer: buffer.max(16),
            channels: DashMap::new(),
        }
    }

    pub fn publish(&self, event: ChangeEvent) {
        let key = (event.tenant_id.clone(), event.table);
        let Some(sender) = self.channels.get(&key).map(|entry| entry.clone()) else {
            return;
        };
        if sender.receiver_count() == 0 {
            self.channels.remove(&key);
            return;
        }
        let _ = sender.send(event);
    }

    pub fn subscribe(&self, tenant_id: &str, table: FeedTable) -> broadcast::Receiver<ChangeEvent> {
        let key = (tenant_id.trim().to_string(), table);
        self.channels
            .entry(key)
            .or_insert_with(|| broadcast::channel(self.buffer).0)
            .subscribe()
    }
}

impl Default for FeedHub {
    fn default() -> Self {
        Self::new(256)
    }
}

/// Swappable transport seam: the concrete delivery mechanism (in-process
/// hub, streaming connection, polling) is invisible to the projectors,
/// which only rely on eventually-delivered, idempotently-mergeable
/// events. The returned channel closing means the connection is gone.
#[async_trait]
pub trait FeedTransport: Send + Sync {
    async fn connect(
        &self,
        tenant_id: &str,
        tables: &[FeedTable],
    ) -> Result<mpsc::Receiver<ChangeEvent>>;
}

pub struct HubTransport {
    hub: Arc<FeedHub>,
}

impl HubTransport {
    pub fn new(hub: Arc<FeedHub>) -> Self {
        Self { hub }
    }
}

#[async_trait]
impl FeedTransport for HubTransport {
    async fn connect(
        &self,
        tenant_id: &str,
        tables: &[FeedTable],
    ) -> Result<mpsc::Receiver<ChangeEvent>> {
        let streams = tables
            .iter()
            .map(|table| BroadcastStream::new(self.hub.subscribe(tenant_id, *table)))
            .collect::<Vec<_>>();
        let mut merged = futures::stream::select_all(streams);
        let (tx, rx) = mpsc::channel(64);
        tokio::spawn(async move {
            while let Some(item) = merged.next().await {
                match item {
                    Ok(event) => {
                        if tx.send(event).await.is_err() {
                            return;
                        }
                    }
                    Err(BroadcastStreamRecvError::Lagged(skipped)) => {
                        // A lagged listener lost events it can never get
                        // back; closing the connection forces the same
                        // resync path as a transport failure.
                        warn!(skipped, "feed listener lagged, dropping connection");
                        return;
                    }
                }
            }
        });
        Ok(rx)
    }
}

struct ListenerEntry {
    tables: Vec<FeedTable>,
    tx: mpsc::UnboundedSender<FeedNotice>,
}

struct ClientInner {
    next_id: u64,
    listeners: HashMap<u64, ListenerEntry>,
    pump: Option<JoinHandle<()>>,
    live: bool,
}

/// One logical feed connection per tenant session, fanned out in-process
/// to registered listeners. Reconnects transparently; after any gap every
/// listener receives `FeedNotice::Resync` instead of replayed events.
/// The last listener removal tears the connection down.
pub struct FeedClient {
    tenant_id: String,
    transport: Arc<dyn FeedTransport>,
    config: FeedConfig,
    inner: Arc<Mutex<ClientInner>>,
}

impl FeedClient {
    pub fn new(tenant_id: &str, transport: Arc<dyn FeedTransport>, config: FeedConfig) -> Self {
        Self {
            tenant_id: tenant_id.trim().to_string(),
            transport,
            config,
            inner: Arc::new(Mutex::new(ClientInner {
                next_id: 1,
                listeners: HashMap::new(),
                pump: None,
                live: false,
            })),
        }
    }

    pub fn listen(&self, tables: &[FeedTable]) -> FeedListener {
        let (tx, rx) = mpsc::unbounded_channel();
        let mut guard = self.inner.lock();
        let listener_id = guard.next_id;
        guard.next_id += 1;
        if guard.live {
            // The connection predates this listener: anything published
            // since its snapshot was never delivered here.
            let _ = tx.send(FeedNotice::Resync);
        }
        guard.listeners.insert(
            listener_id,
            ListenerEntry {
                tables: tables.to_vec(),
                tx,
            },
        );
        if guard.pump.is_none() {
            guard.pump = Some(spawn_pump(
                self.tenant_id.clone(),
                self.transport.clone(),
                self.config.clone(),
                self.inner.clone(),
            ));
        }
        FeedListener {
            listener_id,
            inner: self.inner.clone(),
            rx,
        }
    }

    pub fn listener_count(&self) -> usize {
        self.inner.lock().listeners.len()
    }

    pub fn connected(&self) -> bool {
        self.inner.lock().pump.is_some()
    }
}

pub struct FeedListener {
    listener_id: u64,
    inner: Arc<Mutex<ClientInner>>,
    rx: mpsc::UnboundedReceiver<FeedNotice>,
}

impl FeedListener {
    pub async fn recv(&mut self) -> Option<FeedNotice> {
        self.rx.recv().await
    }
}

impl Drop for FeedListener {
    fn drop(&mut self) {
        let mut guard = self.inner.lock();
        guard.listeners.remove(&self.listener_id);
        if guard.listeners.is_empty() {
            guard.live = false;
            if let Some(pump) = guard.pump.take() {
                pump.abort();
            }
        }
    }
}

fn spawn_pump(
    tenant_id: String,
    transport: Arc<dyn FeedTransport>,
    config: FeedConfig,
    inner: Arc<Mutex<ClientInner>>,
) -> JoinHandle<()> {
    tokio::spawn(async move {
        let mut backoff_ms = config.reconnect_initial_ms.max(1);
        loop {
            match transport.connect(&tenant_id, &FeedTable::ALL).await {
                Ok(mut rx) => {
                    backoff_ms = config.reconnect_initial_ms.max(1);
                    // Every (re)connect opens a gap, including the first:
                    // writes between the consumer's initial snapshot and
                    // this subscription were never delivered.
                    mark_live_and_resync(&inner);
                    debug!(tenant = %tenant_id, "feed connected");
                    while let Some(event) = rx.recv().await {
                        fanout_event(&inner, event);
                    }
                    inner.lock().live = false;
                    warn!(tenant = %tenant_id, "feed connection lost, reconnecting");
                }
                Err(err) => {
                    warn!(tenant = %tenant_id, error = %err, "feed connect failed");
                }
            }
            tokio::time::sleep(Duration::from_millis(backoff_ms)).await;
            backoff_ms = (backoff_ms * 2).min(config.reconnect_max_ms.max(backoff_ms));
        }
    })
}

fn fanout_event(inner: &Arc<Mutex<ClientInner>>, event: ChangeEvent) {
    let mut guard = inner.lock();
    guard.listeners.retain(|_, entry| {
        if !entry.tables.contains(&event.table) {
            return !entry.tx.is_closed();
        }
        entry.tx.send(FeedNotice::Event(event.clone())).is_ok()
    });
}

fn mark_live_and_resync(inner: &Arc<Mutex<ClientInner>>) {
    let mut guard = inner.lock();
    guard.live = true;
    guard
        .listeners
        .retain(|_, entry| entry.tx.send(FeedNotice::Resync).is_ok());
}
