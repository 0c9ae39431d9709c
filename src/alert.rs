// ============================================================================
// ALERT SINKS
// ============================================================================
// Where collector alerts go. Emission must never block or fail the recording
// path, so sinks are synchronous and non-blocking; the collector logs and
// swallows any error a sink returns.
// ============================================================================

use std::fmt::Debug;

use tokio::sync::mpsc::{self, error::TrySendError};
use tracing::{error, warn};

use crate::error::SinkError;
use crate::types::{AlertEvent, Severity};

/// Consumer of alert events.
pub trait AlertSink: Send + Sync + Debug {
    /// Hand an alert to the sink. Must not block.
    fn emit(&self, event: AlertEvent) -> Result<(), SinkError>;
}

/// Writes every alert to the log at a level matching its severity.
#[derive(Debug, Default, Clone, Copy)]
pub struct TracingAlertSink;

impl AlertSink for TracingAlertSink {
    fn emit(&self, event: AlertEvent) -> Result<(), SinkError> {
        match event.severity {
            Severity::Critical => error!(
                target: "pulse::alert",
                metric_type = %event.metric_type,
                key = %event.key,
                value = event.value,
                threshold = event.threshold,
                "{}", event.message
            ),
            Severity::Warning => warn!(
                target: "pulse::alert",
                metric_type = %event.metric_type,
                key = %event.key,
                value = event.value,
                threshold = event.threshold,
                "{}", event.message
            ),
        }
        Ok(())
    }
}

/// Forwards alerts into a bounded channel for a notification task.
/// A full or closed channel is reported as an error, never waited on.
#[derive(Debug, Clone)]
pub struct ChannelAlertSink {
    tx: mpsc::Sender<AlertEvent>,
}

impl ChannelAlertSink {
    pub fn new(capacity: usize) -> (Self, mpsc::Receiver<AlertEvent>) {
        let (tx, rx) = mpsc::channel(capacity.max(1));
        (Self { tx }, rx)
    }
}

impl AlertSink for ChannelAlertSink {
    fn emit(&self, event: AlertEvent) -> Result<(), SinkError> {
        self.tx.try_send(event).map_err(|e| match e {
            TrySendError::Full(_) => SinkError::Full,
            TrySendError::Closed(_) => SinkError::Closed,
        })
    }
}
