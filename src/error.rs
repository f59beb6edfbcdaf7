use serde::Serialize;
use tokio::sync::mpsc;
use tracing::{debug, error};

/// Conditions callers of the engine need to tell apart
#[derive(Debug, thiserror::Error)]
pub enum EngineError {
    /// Link-level failure such as a disconnect
    #[error("device link failure: {0}")]
    Transport(String),
    /// The device sent a record the engine cannot interpret
    #[error("malformed entry from device: {0}")]
    Protocol(String),
    /// The run observed its abort signal; never shown to the user
    #[error("operation cancelled")]
    Cancelled,
    #[error("a transfer is already in progress: {0}")]
    TransferInProgress(String),
}

/// Returns true when `err` is (or wraps) a cancellation
pub fn is_cancellation(err: &anyhow::Error) -> bool {
    err.chain()
        .any(|cause| matches!(cause.downcast_ref::<EngineError>(), Some(EngineError::Cancelled)))
}

/// A user-visible error: a message and an optional detail trace
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct ErrorReport {
    pub message: String,
    pub detail: Option<String>,
}

impl ErrorReport {
    pub fn message(message: impl Into<String>) -> Self {
        Self {
            message: message.into(),
            detail: None,
        }
    }

    /// Uses the outermost context as message and the cause chain as detail
    pub fn from_error(err: &anyhow::Error) -> Self {
        let causes: Vec<String> = err.chain().skip(1).map(|cause| cause.to_string()).collect();
        Self {
            message: err.to_string(),
            detail: if causes.is_empty() {
                None
            } else {
                Some(causes.join("\n"))
            },
        }
    }
}

/// Receiver of user-visible errors (an error dialog, a status bar, a log)
pub trait ErrorReporter: Send + Sync {
    fn report(&self, report: ErrorReport);
}

/// Reports errors as `tracing` events
#[derive(Debug, Default, Clone, Copy)]
pub struct TracingReporter;

impl ErrorReporter for TracingReporter {
    fn report(&self, report: ErrorReport) {
        error!(detail = ?report.detail, "{}", report.message);
    }
}

/// Forwards reports over a channel to whoever presents them
#[derive(Debug, Clone)]
pub struct ChannelReporter {
    tx: mpsc::UnboundedSender<ErrorReport>,
}

impl ChannelReporter {
    pub fn new() -> (Self, mpsc::UnboundedReceiver<ErrorReport>) {
        let (tx, rx) = mpsc::unbounded_channel();
        (Self { tx }, rx)
    }
}

impl ErrorReporter for ChannelReporter {
    fn report(&self, report: ErrorReport) {
        if let Err(err) = self.tx.send(report) {
            error!("error report dropped, receiver is gone: {}", err.0.message);
        }
    }
}

/// Surfaces `err` unless it is a cancellation
pub(crate) fn report_failure(reporter: &dyn ErrorReporter, err: &anyhow::Error) {
    if is_cancellation(err) {
        debug!("run cancelled: {}", err);
        return;
    }
    reporter.report(ErrorReport::from_error(err));
}

#[cfg(test)]
mod tests {
    use super::*;
    use anyhow::Context;

    #[test]
    fn test_cancellation_detected_through_context() {
        let err = Err::<(), _>(EngineError::Cancelled)
            .context("listing /sdcard")
            .unwrap_err();
        assert!(is_cancellation(&err));
        assert!(!is_cancellation(&anyhow::Error::from(EngineError::Transport(
            "usb reset".into()
        ))));
    }

    #[test]
    fn test_report_carries_cause_chain() {
        let err = Err::<(), _>(EngineError::Transport("closed".into()))
            .context("failed to open /data")
            .unwrap_err();
        let report = ErrorReport::from_error(&err);
        assert_eq!(report.message, "failed to open /data");
        assert_eq!(report.detail.as_deref(), Some("device link failure: closed"));
    }

    #[test]
    fn test_channel_reporter_skips_cancellation() {
        let (reporter, mut rx) = ChannelReporter::new();
        report_failure(&reporter, &EngineError::Cancelled.into());
        report_failure(&reporter, &EngineError::Protocol("bad mode".into()).into());
        let report = rx.try_recv().unwrap();
        assert_eq!(report.message, "malformed entry from device: bad mode");
        assert!(rx.try_recv().is_err());
    }
}
