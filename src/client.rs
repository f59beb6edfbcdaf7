use std::sync::Arc;
use tokio::sync::watch;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;

use crate::error::{EngineError, ErrorReporter};
use crate::link::DeviceLink;
use crate::operations::delete::{self, DeleteSummary};
use crate::operations::download;
use crate::operations::list::DirectorySync;
use crate::operations::upload::TransferPipeline;
use crate::sort::sort_items;
use crate::types::{
    EngineConfig, EngineConfigArc, FileTransferOperationResult, ListItem, ListSnapshot,
    TransferSession, TransferSource,
};
use crate::utils::resolve;
use crate::view::{Breadcrumb, SortState, breadcrumbs};

/// File browser over one device: the current listing plus one upload slot
#[derive(Clone)]
pub struct DeviceFileManager {
    pub(crate) link: Arc<dyn DeviceLink>,
    pub(crate) config: EngineConfigArc,
    reporter: Arc<dyn ErrorReporter>,
    listing: DirectorySync,
    transfers: TransferPipeline,
}

impl DeviceFileManager {
    /// Creates a file manager driving `link`
    ///
    /// Errors from background runs go to `reporter`; cancellations never do.
    pub fn new(
        link: Arc<dyn DeviceLink>,
        config: EngineConfig,
        reporter: Arc<dyn ErrorReporter>,
    ) -> Self {
        let config: EngineConfigArc = config.into();
        let listing = DirectorySync::new(link.clone(), config.clone(), reporter.clone());
        let transfers = TransferPipeline::new(
            link.clone(),
            config.clone(),
            reporter.clone(),
            listing.clone(),
        );
        Self {
            link,
            config,
            reporter,
            listing,
            transfers,
        }
    }

    /// Lists a remote directory
    ///
    /// Returns immediately; snapshots arrive through
    /// [`subscribe_listing`](Self::subscribe_listing). A listing still in
    /// flight is aborted first.
    ///
    /// # Example
    ///
    /// ```ignore
    /// let snapshot = manager.ls("/sdcard").await?.expect("listing failed");
    /// for item in &snapshot.items {
    ///     println!("{}: {} bytes", item.key, item.entry.size);
    /// }
    /// ```
    pub fn ls(&self, remote_dir: impl Into<String>) -> JoinHandle<Option<ListSnapshot>> {
        self.listing.list(remote_dir)
    }

    /// Lists `name` relative to the current directory (`..` goes up)
    pub fn cd(&self, name: &str) -> JoinHandle<Option<ListSnapshot>> {
        let target = resolve([self.listing.path().as_str(), name]);
        self.listing.list(target)
    }

    pub fn refresh(&self) -> JoinHandle<Option<ListSnapshot>> {
        self.listing.refresh()
    }

    pub fn cancel_listing(&self) {
        self.listing.cancel()
    }

    /// Latest listing snapshot
    pub fn snapshot(&self) -> ListSnapshot {
        self.listing.snapshot()
    }

    pub fn subscribe_listing(&self) -> watch::Receiver<ListSnapshot> {
        self.listing.subscribe()
    }

    pub fn path(&self) -> String {
        self.listing.path()
    }

    /// Items of the latest snapshot in presentation order
    pub fn sorted_items(&self, sort: SortState) -> Vec<ListItem> {
        sort_items(&self.snapshot().items, sort.key, sort.descending)
    }

    pub fn breadcrumbs(&self) -> Vec<Breadcrumb> {
        breadcrumbs(&self.path())
    }

    /// Uploads a local source into the current directory
    ///
    /// # Errors
    ///
    /// Returns [`EngineError::TransferInProgress`] while another upload runs
    ///
    /// # Example
    ///
    /// ```ignore
    /// let source = TransferSource::from_path("/local/file.txt").await?;
    /// let handle = manager.put(source)?;
    /// if let Some(FileTransferOperationResult::Completed(progress)) = handle.await? {
    ///     println!("{} bytes", progress.file_size);
    /// }
    /// ```
    pub fn put(
        &self,
        source: TransferSource,
    ) -> Result<JoinHandle<Option<FileTransferOperationResult>>, EngineError> {
        let destination = resolve([self.listing.path().as_str(), source.name.as_str()]);
        self.transfers.transfer(source, destination)
    }

    /// Uploads a local source to an explicit remote path
    pub fn put_to(
        &self,
        source: TransferSource,
        remote_path: impl Into<String>,
    ) -> Result<JoinHandle<Option<FileTransferOperationResult>>, EngineError> {
        self.transfers.transfer(source, remote_path)
    }

    pub fn cancel_transfer(&self) {
        self.transfers.cancel()
    }

    /// The running upload, if any
    pub fn transfer_session(&self) -> Option<TransferSession> {
        self.transfers.session()
    }

    pub fn subscribe_transfers(&self) -> watch::Receiver<Option<TransferSession>> {
        self.transfers.subscribe()
    }

    /// Downloads `name` from the current directory (or an absolute remote path)
    ///
    /// # Example
    ///
    /// ```ignore
    /// let cancel_token = CancellationToken::new();
    /// let result = manager
    ///     .get("config.json", "/local/path/config.json".to_string(), cancel_token)
    ///     .await?;
    /// ```
    pub async fn get(
        &self,
        name: &str,
        local_path: String,
        cancel_token: CancellationToken,
    ) -> Result<FileTransferOperationResult, anyhow::Error> {
        let remote_path = resolve([self.listing.path().as_str(), name]);
        download::get(
            self.link.clone(),
            self.config.clone(),
            remote_path,
            local_path,
            cancel_token,
        )
        .await
    }

    /// Deletes the named entries of the current directory one by one
    ///
    /// Each failure is reported on its own and does not stop the batch.
    pub async fn rm(&self, names: Vec<String>) -> DeleteSummary {
        delete::rm(
            self.link.clone(),
            self.reporter.clone(),
            self.listing.clone(),
            self.listing.path(),
            names,
        )
        .await
    }

    /// Aborts running work. The device link itself stays open; it belongs to
    /// the session manager.
    pub fn close(&self) {
        self.listing.cancel();
        self.transfers.cancel();
    }
}

impl std::fmt::Debug for DeviceFileManager {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("DeviceFileManager")
            .field("config", &self.config)
            .field("listing", &self.listing)
            .field("transfers", &self.transfers)
            .finish_non_exhaustive()
    }
}
