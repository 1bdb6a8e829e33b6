//! Error/severity reporting.

use tokio::sync::mpsc;

use crate::error::{Severity, SyncEngineError};

/// Receives engine errors and decides whether to surface them or only log.
pub trait ErrorReporter: Send + Sync {
    fn report(&self, error: &SyncEngineError, severity: Severity);
}

/// Logs every report at a level derived from its severity.
#[derive(Debug, Default, Clone, Copy)]
pub struct LogReporter;

impl ErrorReporter for LogReporter {
    fn report(&self, error: &SyncEngineError, severity: Severity) {
        match severity {
            Severity::Low => log::debug!("{error}"),
            Severity::Moderate => log::warn!("{error}"),
            Severity::High => log::error!("{error}"),
        }
    }
}

/// A surfaced error for the UI to display until dismissed.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SurfacedError {
    pub message: String,
    pub severity: Severity,
}

/// Logs everything and forwards high-severity reports to a channel.
pub struct ChannelReporter {
    tx: mpsc::UnboundedSender<SurfacedError>,
}

impl ChannelReporter {
    pub fn channel() -> (Self, mpsc::UnboundedReceiver<SurfacedError>) {
        let (tx, rx) = mpsc::unbounded_channel();
        (Self { tx }, rx)
    }
}

impl ErrorReporter for ChannelReporter {
    fn report(&self, error: &SyncEngineError, severity: Severity) {
        LogReporter.report(error, severity);
        if severity >= Severity::High {
            // Receiver gone means nobody is displaying errors any more.
            let _ = self.tx.send(SurfacedError {
                message: error.to_string(),
                severity,
            });
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use brewline_core::EntityKind;

    #[test]
    fn test_channel_reporter_forwards_high_only() {
        let (reporter, mut rx) = ChannelReporter::channel();

        reporter.report(&SyncEngineError::Network("down".into()), Severity::Low);
        assert!(rx.try_recv().is_err());

        let err = SyncEngineError::Validation {
            status: 400,
            message: "bad recipe".into(),
        };
        reporter.report(&err, err.severity());
        let surfaced = rx.try_recv().unwrap();
        assert_eq!(surfaced.severity, Severity::High);
        assert!(surfaced.message.contains("bad recipe"));

        reporter.report(&SyncEngineError::FlushInProgress(EntityKind::Recipe), Severity::Moderate);
        assert!(rx.try_recv().is_err());
    }
}
