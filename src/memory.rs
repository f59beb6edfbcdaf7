//! In-memory device for tests and demos.
//!
//! Holds a tree of files, directories and symlinks behind the
//! [`DeviceLink`] contract, counts session and writer lifetimes, and can
//! inject delays and failures.

use async_trait::async_trait;
use bytes::Bytes;
use futures::stream::{self, StreamExt};
use std::collections::{BTreeMap, HashMap, HashSet};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use std::time::Duration;

use crate::error::EngineError;
use crate::link::{ByteStream, ChunkSink, DeviceLink, EntryStream, SyncSession};
use crate::types::{Entry, EntryType, MAX_PACKET_SIZE};
use crate::utils::resolve;

const DEFAULT_MTIME: u64 = 1_700_000_000;
const MAX_LINK_DEPTH: usize = 8;

#[derive(Debug, Clone)]
enum Node {
    File { data: Bytes, permission: u32, mtime: u64 },
    Directory { permission: u32, mtime: u64 },
    Symlink { target: String, mtime: u64 },
}

impl Node {
    fn entry(&self, name: &str) -> Entry {
        let (entry_type, permission, size, mtime) = match self {
            Node::File { data, permission, mtime } => {
                (EntryType::File, *permission, data.len() as u64, *mtime)
            }
            Node::Directory { permission, mtime } => (EntryType::Directory, *permission, 4096, *mtime),
            Node::Symlink { target, mtime } => (EntryType::Symlink, 0o777, target.len() as u64, *mtime),
        };
        Entry {
            name: name.to_string(),
            entry_type,
            permission,
            size,
            mtime: Some(mtime),
            ctime: Some(mtime),
            atime: Some(mtime),
        }
    }
}

/// Lifetime counters of an [`InMemoryDevice`]
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct DeviceStats {
    pub sessions_opened: usize,
    pub sessions_disposed: usize,
    pub writers_opened: usize,
    pub writers_closed: usize,
}

/// One writer as the device saw it once released
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct WriteRecord {
    pub path: String,
    pub mode: u32,
    pub mtime: u64,
    pub chunk_sizes: Vec<usize>,
    pub completed: bool,
}

#[derive(Debug, Default)]
struct DeviceState {
    nodes: BTreeMap<String, Node>,
    stats: DeviceStats,
    writes: Vec<WriteRecord>,
    shell_history: Vec<String>,
    disconnected: bool,
    entry_delay: Option<Duration>,
    write_delay: Option<Duration>,
    listing_failures: HashMap<String, usize>,
    probe_failures: HashSet<String>,
    write_failure_after: Option<usize>,
    denied_deletes: HashSet<String>,
}

/// A [`DeviceLink`] over an in-memory file tree
#[derive(Debug, Clone)]
pub struct InMemoryDevice {
    state: Arc<Mutex<DeviceState>>,
}

impl Default for InMemoryDevice {
    fn default() -> Self {
        Self::new()
    }
}

fn parent_of(path: &str) -> String {
    match path.rfind('/') {
        Some(0) | None => "/".to_string(),
        Some(index) => path[..index].to_string(),
    }
}

fn name_of(path: &str) -> &str {
    path.rsplit('/').next().unwrap_or(path)
}

fn transport(message: impl Into<String>) -> anyhow::Error {
    EngineError::Transport(message.into()).into()
}

impl InMemoryDevice {
    /// A device holding only the root directory
    pub fn new() -> Self {
        let mut state = DeviceState::default();
        state.nodes.insert(
            "/".to_string(),
            Node::Directory {
                permission: 0o755,
                mtime: DEFAULT_MTIME,
            },
        );
        Self {
            state: Arc::new(Mutex::new(state)),
        }
    }

    fn state(&self) -> MutexGuard<'_, DeviceState> {
        self.state.lock().unwrap_or_else(PoisonError::into_inner)
    }

    fn insert(&self, path: &str, node: Node) {
        let path = resolve(["/", path]);
        let mut state = self.state();
        let mut parent = parent_of(&path);
        while !state.nodes.contains_key(&parent) {
            state.nodes.insert(
                parent.clone(),
                Node::Directory {
                    permission: 0o755,
                    mtime: DEFAULT_MTIME,
                },
            );
            parent = parent_of(&parent);
        }
        state.nodes.insert(path, node);
    }

    pub fn with_dir(self, path: &str) -> Self {
        self.insert(
            path,
            Node::Directory {
                permission: 0o755,
                mtime: DEFAULT_MTIME,
            },
        );
        self
    }

    pub fn with_file(self, path: &str, data: impl Into<Bytes>) -> Self {
        self.insert(
            path,
            Node::File {
                data: data.into(),
                permission: 0o644,
                mtime: DEFAULT_MTIME,
            },
        );
        self
    }

    /// `target` may be relative to the directory holding the link
    pub fn with_symlink(self, path: &str, target: &str) -> Self {
        self.insert(
            path,
            Node::Symlink {
                target: target.to_string(),
                mtime: DEFAULT_MTIME,
            },
        );
        self
    }

    /// Sleeps before yielding each listing entry
    pub fn with_entry_delay(self, delay: Duration) -> Self {
        self.state().entry_delay = Some(delay);
        self
    }

    /// Sleeps before accepting each written chunk
    pub fn with_write_delay(self, delay: Duration) -> Self {
        self.state().write_delay = Some(delay);
        self
    }

    /// Listing `path` fails with a transport error after `entries` entries
    pub fn fail_listing_after(self, path: &str, entries: usize) -> Self {
        self.state().listing_failures.insert(resolve(["/", path]), entries);
        self
    }

    /// Probing `path` fails with a transport error
    pub fn fail_probe(self, path: &str) -> Self {
        self.state().probe_failures.insert(resolve(["/", path]));
        self
    }

    /// Every writer fails once it has accepted `chunks` chunks
    pub fn fail_write_after(self, chunks: usize) -> Self {
        self.state().write_failure_after = Some(chunks);
        self
    }

    /// `rm` of `path` prints a permission error and leaves it in place
    pub fn deny_delete(self, path: &str) -> Self {
        self.state().denied_deletes.insert(resolve(["/", path]));
        self
    }

    /// Every later operation fails as if the cable was pulled
    pub fn disconnect(&self) {
        self.state().disconnected = true;
    }

    pub fn stats(&self) -> DeviceStats {
        self.state().stats
    }

    pub fn writes(&self) -> Vec<WriteRecord> {
        self.state().writes.clone()
    }

    pub fn shell_history(&self) -> Vec<String> {
        self.state().shell_history.clone()
    }

    pub fn exists(&self, path: &str) -> bool {
        self.state().nodes.contains_key(&resolve(["/", path]))
    }

    pub fn file(&self, path: &str) -> Option<Bytes> {
        match self.state().nodes.get(&resolve(["/", path])) {
            Some(Node::File { data, .. }) => Some(data.clone()),
            _ => None,
        }
    }

    fn ensure_connected(&self) -> Result<(), anyhow::Error> {
        if self.state().disconnected {
            Err(transport("device disconnected"))
        } else {
            Ok(())
        }
    }

    fn list(&self, path: &str) -> Result<(Vec<Entry>, Option<usize>, Option<Duration>), anyhow::Error> {
        let state = self.state();
        let mut entries = match state.nodes.get(path) {
            Some(node @ Node::Directory { .. }) => vec![node.entry("."), node.entry("..")],
            Some(_) => return Err(transport(format!("{path} is not a directory"))),
            None => return Err(transport(format!("{path} does not exist"))),
        };
        for (child, node) in &state.nodes {
            if child != "/" && parent_of(child) == path {
                entries.push(node.entry(name_of(child)));
            }
        }
        Ok((
            entries,
            state.listing_failures.get(path).copied(),
            state.entry_delay,
        ))
    }

    fn is_directory(&self, path: &str) -> bool {
        let state = self.state();
        let mut current = path.to_string();
        for _ in 0..MAX_LINK_DEPTH {
            match state.nodes.get(&current) {
                Some(Node::Directory { .. }) => return true,
                Some(Node::Symlink { target, .. }) => {
                    current = resolve([parent_of(&current).as_str(), target.as_str()]);
                }
                _ => return false,
            }
        }
        false
    }

    fn remove(&self, path: &str) -> String {
        let mut state = self.state();
        if state.denied_deletes.contains(path) {
            return format!("rm: {path}: Permission denied\n");
        }
        let prefix = format!("{path}/");
        state
            .nodes
            .retain(|key, _| key == "/" || (key != path && !key.starts_with(&prefix)));
        String::new()
    }
}

/// Undoes `shell_quote`
fn shell_unquote(arg: &str) -> String {
    arg.trim()
        .trim_start_matches('\'')
        .trim_end_matches('\'')
        .replace(r"'\''", "'")
}

#[async_trait]
impl DeviceLink for InMemoryDevice {
    async fn open_session(&self) -> Result<Box<dyn SyncSession>, anyhow::Error> {
        self.ensure_connected()?;
        self.state().stats.sessions_opened += 1;
        Ok(Box::new(MemorySession {
            device: self.clone(),
            disposed: AtomicBool::new(false),
        }))
    }

    async fn shell(&self, command: &str) -> Result<String, anyhow::Error> {
        self.ensure_connected()?;
        self.state().shell_history.push(command.to_string());
        match command.strip_prefix("rm -rf ") {
            Some(arg) => Ok(self.remove(&resolve(["/", shell_unquote(arg).as_str()]))),
            None => Ok(format!("sh: {command}: not found\n")),
        }
    }

    async fn check(&self) -> Result<(), anyhow::Error> {
        self.ensure_connected()
    }

    async fn close(&self) -> Result<(), anyhow::Error> {
        self.state().disconnected = true;
        Ok(())
    }
}

struct MemorySession {
    device: InMemoryDevice,
    disposed: AtomicBool,
}

#[async_trait]
impl SyncSession for MemorySession {
    async fn open_directory_stream(&self, path: &str) -> Result<EntryStream, anyhow::Error> {
        self.device.ensure_connected()?;
        let (entries, fail_after, delay) = self.device.list(&resolve(["/", path]))?;
        let path = path.to_string();
        let items = entries
            .into_iter()
            .enumerate()
            .map(move |(index, entry)| match fail_after {
                Some(limit) if index >= limit => Err(transport(format!("connection lost while listing {path}"))),
                _ => Ok(entry),
            })
            // nothing after the first error
            .scan(false, |failed, item| {
                if *failed {
                    return None;
                }
                *failed = item.is_err();
                Some(item)
            })
            .collect::<Vec<_>>();
        Ok(stream::iter(items)
            .then(move |item| async move {
                if let Some(delay) = delay {
                    tokio::time::sleep(delay).await;
                }
                item
            })
            .boxed())
    }

    async fn probe_is_directory(&self, path: &str) -> Result<bool, anyhow::Error> {
        self.device.ensure_connected()?;
        let path = resolve(["/", path]);
        if self.device.state().probe_failures.contains(&path) {
            return Err(transport(format!("stat {path} failed")));
        }
        Ok(self.device.is_directory(&path))
    }

    async fn open_writer(
        &self,
        path: &str,
        mode: u32,
        mtime: u64,
    ) -> Result<Box<dyn ChunkSink>, anyhow::Error> {
        self.device.ensure_connected()?;
        self.device.state().stats.writers_opened += 1;
        Ok(Box::new(MemorySink {
            device: self.device.clone(),
            path: resolve(["/", path]),
            mode,
            mtime,
            chunks: Vec::new(),
            closed: false,
        }))
    }

    async fn open_reader(&self, path: &str) -> Result<ByteStream, anyhow::Error> {
        self.device.ensure_connected()?;
        let path = resolve(["/", path]);
        let data = self
            .device
            .file(&path)
            .ok_or_else(|| transport(format!("{path} is not a readable file")))?;
        let chunks: Vec<Result<Bytes, anyhow::Error>> = (0..data.len())
            .step_by(MAX_PACKET_SIZE)
            .map(|start| Ok(data.slice(start..(start + MAX_PACKET_SIZE).min(data.len()))))
            .collect();
        Ok(stream::iter(chunks).boxed())
    }

    async fn dispose(&self) {
        if !self.disposed.swap(true, Ordering::SeqCst) {
            self.device.state().stats.sessions_disposed += 1;
        }
    }
}

struct MemorySink {
    device: InMemoryDevice,
    path: String,
    mode: u32,
    mtime: u64,
    chunks: Vec<Bytes>,
    closed: bool,
}

#[async_trait]
impl ChunkSink for MemorySink {
    async fn write_chunk(&mut self, chunk: Bytes) -> Result<(), anyhow::Error> {
        let (delay, fail_after) = {
            let state = self.device.state();
            (state.write_delay, state.write_failure_after)
        };
        if let Some(delay) = delay {
            tokio::time::sleep(delay).await;
        }
        self.device.ensure_connected()?;
        if fail_after.is_some_and(|limit| self.chunks.len() >= limit) {
            return Err(transport(format!("write to {} interrupted", self.path)));
        }
        self.chunks.push(chunk);
        Ok(())
    }

    async fn close(&mut self, complete: bool) -> Result<(), anyhow::Error> {
        if self.closed {
            return Ok(());
        }
        self.closed = true;
        let data: Vec<u8> = self.chunks.iter().flat_map(|chunk| chunk.iter().copied()).collect();
        let record = WriteRecord {
            path: self.path.clone(),
            mode: self.mode,
            mtime: self.mtime,
            chunk_sizes: self.chunks.iter().map(Bytes::len).collect(),
            completed: complete,
        };
        {
            let mut state = self.device.state();
            state.stats.writers_closed += 1;
            state.writes.push(record);
        }
        if complete {
            self.device.insert(
                &self.path,
                Node::File {
                    data: Bytes::from(data),
                    permission: self.mode & 0o7777,
                    mtime: self.mtime,
                },
            );
        }
        Ok(())
    }
}
