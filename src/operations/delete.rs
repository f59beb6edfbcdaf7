use std::sync::Arc;
use tracing::{info, warn};

use crate::error::{ErrorReport, ErrorReporter};
use crate::link::DeviceLink;
use crate::operations::list::DirectorySync;
use crate::utils::{resolve, shell_quote};

/// Outcome of a batch delete
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct DeleteSummary {
    pub removed: Vec<String>,
    pub failed: Vec<String>,
}

/// Removes each of `names` under `base` through the device shell.
///
/// Items are independent: a failure is reported and the next item is still
/// attempted. Any output from `rm` counts as a failure and is reported
/// verbatim. The listing is refreshed after every item.
pub(crate) async fn rm(
    link: Arc<dyn DeviceLink>,
    reporter: Arc<dyn ErrorReporter>,
    listing: DirectorySync,
    base: String,
    names: Vec<String>,
) -> DeleteSummary {
    let mut summary = DeleteSummary::default();
    for name in names {
        let target = resolve([base.as_str(), name.as_str()]);
        match link.shell(&format!("rm -rf {}", shell_quote(&target))).await {
            Ok(output) if output.trim().is_empty() => {
                info!("Removed {:?}", target);
                summary.removed.push(target);
            }
            Ok(output) => {
                warn!("rm {:?} printed: {}", target, output.trim());
                reporter.report(ErrorReport::message(output.trim()));
                summary.failed.push(target);
            }
            Err(e) => {
                let e = e.context(format!("Failed to delete {target}"));
                reporter.report(ErrorReport::from_error(&e));
                summary.failed.push(target);
            }
        }
        listing.refresh();
    }
    summary
}
