// Library entrypoint for integration tests and the embedding dashboard.
pub mod config;
pub mod feed;
pub mod handoff;
pub mod inbox;
pub mod logging;
pub mod model;
pub mod pipeline;
pub mod session;
pub mod storage;
pub mod transcript;

pub use config::Config;
pub use feed::{ChangeEvent, FeedClient, FeedHub, FeedNotice, FeedTable, FeedTransport, HubTransport};
pub use handoff::{HandoffController, HandoffState};
pub use inbox::{InboxProjector, InboxSummary};
pub use model::{
    ConversationRecord, ConversationStateRecord, ConversationStatus, MessageDirection,
    MessageRecord, OwnershipIndicator, StageRecord, TenantContext,
};
pub use pipeline::{ColumnRegion, ColumnView, PipelineBoard};
pub use session::{BoardHandle, DashboardSession, InboxHandle, TranscriptHandle};
pub use storage::{
    build_storage, ConversationFilter, DirectoryStore, MemoryDirectoryStore, SqliteDirectoryStore,
};
pub use transcript::ChatTranscript;
