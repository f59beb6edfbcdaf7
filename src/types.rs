use bytes::Bytes;
use futures::stream::{self, StreamExt};
use serde::{Deserialize, Serialize};
use std::path::Path;
use std::sync::Arc;
use std::time::{Duration, UNIX_EPOCH};
use tokio_util::io::ReaderStream;

use crate::error::EngineError;
use crate::link::ByteStream;

/// Mask selecting the file type bits of a POSIX mode
pub const S_IFMT: u32 = 0o170000;
/// Regular file type bits
pub const S_IFREG: u32 = 0o100000;
/// Directory type bits
pub const S_IFDIR: u32 = 0o040000;
/// Symbolic link type bits
pub const S_IFLNK: u32 = 0o120000;

/// Largest payload a single sync data packet may carry
pub const MAX_PACKET_SIZE: usize = 64 * 1024;

/// Type of a remote entry
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub enum EntryType {
    File,
    Directory,
    Symlink,
}

impl EntryType {
    /// Classifies the `S_IFMT` bits of a mode. Other file types (sockets,
    /// devices, fifos) are not representable and yield `None`.
    pub fn from_mode(mode: u32) -> Option<Self> {
        match mode & S_IFMT {
            S_IFREG => Some(EntryType::File),
            S_IFDIR => Some(EntryType::Directory),
            S_IFLNK => Some(EntryType::Symlink),
            _ => None,
        }
    }

    pub fn mode_bits(self) -> u32 {
        match self {
            EntryType::File => S_IFREG,
            EntryType::Directory => S_IFDIR,
            EntryType::Symlink => S_IFLNK,
        }
    }
}

/// One record of a remote directory listing
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Entry {
    pub name: String,
    pub entry_type: EntryType,
    /// Permission bits (`0o7777` range)
    pub permission: u32,
    pub size: u64,
    pub mtime: Option<u64>,
    pub ctime: Option<u64>,
    pub atime: Option<u64>,
}

impl Entry {
    /// Builds an entry from raw stat fields as the device reports them
    ///
    /// # Errors
    ///
    /// Returns [`EngineError::Protocol`] when the mode does not describe a
    /// file, directory or symlink.
    pub fn from_stat(
        name: impl Into<String>,
        mode: u32,
        size: u64,
        mtime: Option<u64>,
    ) -> Result<Self, EngineError> {
        let name = name.into();
        let entry_type = EntryType::from_mode(mode).ok_or_else(|| {
            EngineError::Protocol(format!("unsupported file type {:o} for {:?}", mode & S_IFMT, name))
        })?;
        Ok(Self {
            name,
            entry_type,
            permission: mode & 0o7777,
            size,
            mtime,
            ctime: None,
            atime: None,
        })
    }

    /// Full POSIX mode (type bits and permission bits)
    pub fn mode(&self) -> u32 {
        self.entry_type.mode_bits() | self.permission
    }

    /// `.` and `..` are synthesized by the device and never listed
    pub fn is_dot_entry(&self) -> bool {
        self.name == "." || self.name == ".."
    }

    pub fn is_file(&self) -> bool {
        self.entry_type == EntryType::File
    }

    /// Copy of a symlink entry whose target is not a directory.
    /// The target's real size is never fetched, so the size is zeroed.
    pub fn coerced_to_file(&self) -> Self {
        Self {
            entry_type: EntryType::File,
            size: 0,
            ..self.clone()
        }
    }
}

/// An entry as it appears in a listing, keyed once at ingestion
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct ListItem {
    pub key: String,
    #[serde(flatten)]
    pub entry: Entry,
    /// The device reported a symlink; `entry` describes what it resolved to
    pub symlink: bool,
}

impl ListItem {
    /// Projects a symlink once its target has been probed. Links to
    /// directories list as directories, anything else as an empty file.
    pub fn resolved_link(link: Entry, target_is_dir: bool) -> Self {
        let entry = if target_is_dir {
            Entry {
                entry_type: EntryType::Directory,
                ..link
            }
        } else {
            link.coerced_to_file()
        };
        Self {
            key: entry.name.clone(),
            entry,
            symlink: true,
        }
    }
}

impl From<Entry> for ListItem {
    fn from(entry: Entry) -> Self {
        Self {
            key: entry.name.clone(),
            entry,
            symlink: false,
        }
    }
}

/// Point-in-time result of a directory listing
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct ListSnapshot {
    pub path: String,
    pub items: Vec<ListItem>,
    pub loading: bool,
    /// Generation of the run that published this snapshot (0 before any run)
    pub generation: u64,
}

impl ListSnapshot {
    pub fn empty(path: impl Into<String>) -> Self {
        Self {
            path: path.into(),
            items: Vec::new(),
            loading: false,
            generation: 0,
        }
    }

    pub fn item(&self, name: &str) -> Option<&ListItem> {
        self.items.iter().find(|item| item.key == name)
    }
}

/// Lifecycle of an upload
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub enum TransferStatus {
    Running,
    Completed,
    Failed,
    Cancelled,
}

/// State of the single upload an engine may run
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct TransferSession {
    pub source: String,
    pub destination: String,
    pub total_bytes: u64,
    pub transferred_bytes: u64,
    /// `transferred_bytes` at the last sampling tick
    pub sampled_bytes: u64,
    /// Bytes transferred during the last sampling interval
    pub speed: u64,
    pub status: TransferStatus,
    /// Run that owns this session
    pub generation: u64,
}

impl TransferSession {
    pub(crate) fn start(source: &str, destination: &str, total_bytes: u64, generation: u64) -> Self {
        Self {
            source: source.to_string(),
            destination: destination.to_string(),
            total_bytes,
            transferred_bytes: 0,
            sampled_bytes: 0,
            speed: 0,
            status: TransferStatus::Running,
            generation,
        }
    }

    pub(crate) fn sample(&mut self) {
        self.speed = self.transferred_bytes - self.sampled_bytes;
        self.sampled_bytes = self.transferred_bytes;
    }

    pub fn progress(&self) -> FileTransferProgress {
        let percentage_progress = if self.total_bytes == 0 {
            100.0_f64
        } else {
            self.transferred_bytes as f64 * 100.0 / self.total_bytes as f64
        };
        FileTransferProgress {
            src_file: self.source.clone(),
            dest_file: self.destination.clone(),
            file_size: self.total_bytes,
            transferred_bytes: self.transferred_bytes,
            bytes_per_second: self.speed,
            percentage_progress,
        }
    }
}

/// Configuration for the listing and transfer engine
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct EngineConfig {
    /// Largest frame handed to a device writer in bytes
    pub max_packet_size: usize,
    /// Period between incremental listing snapshots
    pub snapshot_interval_ms: u64,
    /// Period between upload speed samples
    pub sample_interval_ms: u64,
    /// Permission bits given to uploaded files
    pub upload_permission: u32,
    /// Chunks buffered between the device reader and the local writer
    pub download_queue_depth: usize,
}

impl Default for EngineConfig {
    /// - max_packet_size: 65536 (64KB)
    /// - snapshot_interval_ms / sample_interval_ms: 1000
    /// - upload_permission: 0o666
    /// - download_queue_depth: 8
    fn default() -> Self {
        Self {
            max_packet_size: MAX_PACKET_SIZE,
            snapshot_interval_ms: 1000,
            sample_interval_ms: 1000,
            upload_permission: 0o666,
            download_queue_depth: 8,
        }
    }
}

impl EngineConfig {
    /// Creates a new configuration with a custom packet size and default timings
    pub fn new(max_packet_size: usize) -> Self {
        Self {
            max_packet_size,
            ..Self::default()
        }
    }

    /// Parses a JSON document; missing fields keep their defaults
    pub fn from_json(json: &str) -> Result<Self, anyhow::Error> {
        let config: Self = serde_json::from_str(json)?;
        if config.max_packet_size == 0 {
            anyhow::bail!("max_packet_size must be greater than zero");
        }
        Ok(config)
    }

    pub fn snapshot_interval(&self) -> Duration {
        Duration::from_millis(self.snapshot_interval_ms)
    }

    pub fn sample_interval(&self) -> Duration {
        Duration::from_millis(self.sample_interval_ms)
    }
}

/// Result of a file transfer operation
#[derive(Debug, Clone, PartialEq)]
pub enum FileTransferOperationResult {
    /// Transfer completed successfully
    Completed(FileTransferProgress),
    /// Transfer was cancelled by user
    Cancelled { src_file: String, dest_file: String },
}

/// Progress information for an ongoing or completed file transfer
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct FileTransferProgress {
    /// Source file path
    pub src_file: String,
    /// Destination file path
    pub dest_file: String,
    /// Total size of the file in bytes
    pub file_size: u64,
    pub transferred_bytes: u64,
    /// Speed computed at the last sample
    pub bytes_per_second: u64,
    /// Percentage of transfer completed (0.0 to 100.0)
    pub percentage_progress: f64,
}

/// A local byte source to upload
pub struct TransferSource {
    pub name: String,
    pub size: u64,
    /// Modification time in epoch seconds
    pub modified: u64,
    pub(crate) stream: ByteStream,
}

impl TransferSource {
    /// Opens a local file for upload
    pub async fn from_path(path: impl AsRef<Path>) -> Result<Self, anyhow::Error> {
        let path = path.as_ref();
        let file = tokio::fs::File::open(path).await?;
        let metadata = file.metadata().await?;
        let modified = metadata
            .modified()
            .ok()
            .and_then(|t| t.duration_since(UNIX_EPOCH).ok())
            .map(|d| d.as_secs())
            .unwrap_or_default();
        let name = path
            .file_name()
            .map(|n| n.to_string_lossy().into_owned())
            .ok_or_else(|| anyhow::anyhow!("{} has no file name", path.display()))?;
        let stream = ReaderStream::new(file)
            .map(|chunk| chunk.map_err(anyhow::Error::from))
            .boxed();
        Ok(Self {
            name,
            size: metadata.len(),
            modified,
            stream,
        })
    }

    pub fn from_bytes(name: impl Into<String>, data: Bytes, modified: u64) -> Self {
        Self {
            name: name.into(),
            size: data.len() as u64,
            modified,
            stream: stream::once(async move { Ok(data) }).boxed(),
        }
    }

    pub fn from_stream(name: impl Into<String>, size: u64, modified: u64, stream: ByteStream) -> Self {
        Self {
            name: name.into(),
            size,
            modified,
            stream,
        }
    }
}

impl std::fmt::Debug for TransferSource {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("TransferSource")
            .field("name", &self.name)
            .field("size", &self.size)
            .field("modified", &self.modified)
            .finish_non_exhaustive()
    }
}

/// Internal configuration wrapper with Arc for shared ownership
#[derive(Debug, Clone)]
pub(crate) struct EngineConfigArc {
    pub(crate) inner: Arc<EngineConfig>,
}

impl From<EngineConfig> for EngineConfigArc {
    fn from(config: EngineConfig) -> Self {
        Self {
            inner: Arc::new(config),
        }
    }
}

impl std::ops::Deref for EngineConfigArc {
    type Target = EngineConfig;

    fn deref(&self) -> &Self::Target {
        &self.inner
    }
}
