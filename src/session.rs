use anyhow::anyhow;
use std::sync::Arc;
use tracing::{debug, error, info, warn};

use crate::client::DeviceFileManager;
use crate::error::ErrorReporter;
use crate::link::DeviceLink;
use crate::types::EngineConfig;

/// Owns the link to one device and creates file managers over it
#[derive(Default)]
pub struct DeviceSessionManager {
    pub link: Option<Arc<dyn DeviceLink>>,
}

impl DeviceSessionManager {
    /// Takes ownership of an already negotiated device link
    ///
    /// Pairing and transport negotiation happen before this point.
    pub fn attach(link: Arc<dyn DeviceLink>) -> Self {
        info!("Device link attached");
        Self { link: Some(link) }
    }

    /// Creates a new file manager from the managed link
    ///
    /// # Errors
    ///
    /// Returns an error if:
    /// - No device is attached
    /// - The link check fails (device gone)
    ///
    /// # Example
    ///
    /// ```ignore
    /// let manager = session.create_file_manager(
    ///     EngineConfig::default(),
    ///     Arc::new(TracingReporter),
    /// ).await?;
    /// ```
    pub async fn create_file_manager(
        &self,
        config: EngineConfig,
        reporter: Arc<dyn ErrorReporter>,
    ) -> Result<DeviceFileManager, anyhow::Error> {
        debug!("Creating file manager from device link");
        let link = self
            .link
            .as_ref()
            .ok_or(anyhow!("device not connected"))?;
        link.check()
            .await
            .map_err(|e| anyhow!("device link is already closed: {e}"))?;
        Ok(DeviceFileManager::new(link.clone(), config, reporter))
    }

    /// Closes the device link if no file manager still uses it
    ///
    /// # Errors
    ///
    /// Returns an error if:
    /// - Some file manager still holds the link (it is kept in that case)
    /// - No link is attached
    /// - Closing the link fails
    pub async fn close(&mut self) -> Result<(), anyhow::Error> {
        match self.link.take() {
            Some(link) if Arc::strong_count(&link) == 1 => {
                info!("No file manager is using the device anymore so can close the link");
                link.close().await?;
                Ok(())
            }
            Some(link) => {
                error!("Some file manager still holds the device link so could not close it");
                self.link = Some(link);
                Err(anyhow!("failed to close device link"))
            }
            None => {
                error!("Device link not found");
                Err(anyhow!("failed to close device link"))
            }
        }
    }

    /// Checks if the device is still reachable
    ///
    /// A dead link is dropped from the manager.
    pub async fn connected(&mut self) -> bool {
        match self.link.as_ref() {
            Some(link) => {
                if link.check().await.is_ok() {
                    true
                } else {
                    warn!("Device link is dead so setting status to disconnected");
                    self.link = None;
                    false
                }
            }
            None => false,
        }
    }
}

impl std::fmt::Debug for DeviceSessionManager {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("DeviceSessionManager")
            .field("attached", &self.link.is_some())
            .finish()
    }
}
