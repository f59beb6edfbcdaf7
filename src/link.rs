//! Contract of the device link the engine drives.
//!
//! Pairing, authentication and transport negotiation happen behind these
//! traits; the engine only sees sessions, entry streams and byte sinks.

use async_trait::async_trait;
use bytes::Bytes;
use futures_util::stream::BoxStream;

use crate::types::Entry;

/// Entries of one directory in device order
pub type EntryStream = BoxStream<'static, Result<Entry, anyhow::Error>>;

/// Raw file content
pub type ByteStream = BoxStream<'static, Result<Bytes, anyhow::Error>>;

/// Connection to one device
#[async_trait]
pub trait DeviceLink: Send + Sync {
    /// Opens a sync session; every session must be disposed by its user
    async fn open_session(&self) -> Result<Box<dyn SyncSession>, anyhow::Error>;

    /// Runs a shell command and returns its combined output
    async fn shell(&self, command: &str) -> Result<String, anyhow::Error>;

    /// Fails when the device is no longer reachable
    async fn check(&self) -> Result<(), anyhow::Error>;

    /// Tears down the connection. Idempotent.
    async fn close(&self) -> Result<(), anyhow::Error>;
}

/// A sync session opened on a [`DeviceLink`]
#[async_trait]
pub trait SyncSession: Send + Sync {
    /// Streams the entries of `path`, including `.` and `..` if the device sends them
    async fn open_directory_stream(&self, path: &str) -> Result<EntryStream, anyhow::Error>;

    /// Follows symlinks and reports whether `path` ends at a directory
    async fn probe_is_directory(&self, path: &str) -> Result<bool, anyhow::Error>;

    /// Starts writing `path` with the given mode and modification time (epoch seconds)
    async fn open_writer(
        &self,
        path: &str,
        mode: u32,
        mtime: u64,
    ) -> Result<Box<dyn ChunkSink>, anyhow::Error>;

    async fn open_reader(&self, path: &str) -> Result<ByteStream, anyhow::Error>;

    /// Releases the session. Idempotent and safe after a partial failure.
    async fn dispose(&self);
}

/// Destination of an upload
#[async_trait]
pub trait ChunkSink: Send {
    /// Writes one frame; frames never exceed the transport packet size
    async fn write_chunk(&mut self, chunk: Bytes) -> Result<(), anyhow::Error>;

    /// Releases the destination, committing the file only when `complete`.
    /// Idempotent.
    async fn close(&mut self, complete: bool) -> Result<(), anyhow::Error>;
}
