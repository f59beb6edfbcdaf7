// Module declarations
mod client;
mod error;
mod link;
pub mod memory;
mod operations;
mod session;
mod sort;
mod task;
mod types;
mod utils;
pub mod view;

// Public API exports
pub use client::DeviceFileManager;
pub use error::{
    ChannelReporter, EngineError, ErrorReport, ErrorReporter, TracingReporter, is_cancellation,
};
pub use link::{ByteStream, ChunkSink, DeviceLink, EntryStream, SyncSession};
pub use operations::delete::DeleteSummary;
pub use operations::list::DirectorySync;
pub use operations::upload::{ChunkSplitter, ProgressObserver, TransferPipeline};
pub use session::DeviceSessionManager;
pub use sort::{SortKey, compare, sort_items};
pub use task::{CancellableTask, RunToken};
pub use types::{
    EngineConfig, Entry, EntryType, FileTransferOperationResult, FileTransferProgress, ListItem,
    ListSnapshot, MAX_PACKET_SIZE, S_IFDIR, S_IFLNK, S_IFMT, S_IFREG, TransferSession,
    TransferSource, TransferStatus,
};
pub use utils::{extname, resolve, shell_quote};

// Re-export commonly used external types for convenience
pub use tokio_util::sync::CancellationToken;
