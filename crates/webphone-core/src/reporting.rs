//! Call record reporting
//!
//! The control plane keeps a record per call (who dialed what, when it was
//! answered, how it ended). [`CallReporter`] derives those records from the
//! event stream and hands every update to a [`CallRecordSink`].

use std::collections::HashMap;
use std::sync::Arc;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use thiserror::Error;
use tokio::task::JoinHandle;
use tracing::{Instrument, debug, info, info_span, warn};

use crate::call::CallId;
use crate::events::{CallStatusCode, EventStream, SoftphoneEvent};
use crate::signaling::CallDirection;

/// Lifecycle of a call as the control plane records it
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum CallRecordStatus {
    /// Outbound call placed
    Initiating,
    /// Remote side alerting, or inbound call offered
    Ringing,
    /// Call established
    Answered,
    /// Transfer pending
    Transferring,
    /// Call ended
    Terminated,
    /// Call failed
    Failed,
}

/// One call as reported to the control plane
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct CallRecord {
    pub call_id: CallId,
    pub user_id: String,
    /// Dialed number or calling party
    pub number: String,
    pub direction: CallDirection,
    pub status: CallRecordStatus,
    pub started_at: DateTime<Utc>,
    pub answered_at: Option<DateTime<Utc>>,
    pub ended_at: Option<DateTime<Utc>>,
    pub failure_cause: Option<String>,
}

/// Errors a sink can report
#[derive(Debug, Error)]
pub enum ReportError {
    #[error("serialization failed: {0}")]
    Serialization(#[from] serde_json::Error),

    #[error("sink unavailable: {0}")]
    Unavailable(String),
}

/// Destination for call records
#[async_trait]
pub trait CallRecordSink: Send + Sync {
    /// Store or update `record`
    async fn publish(&self, record: &CallRecord) -> Result<(), ReportError>;
}

/// Sink that writes each record to the log as JSON
#[derive(Debug, Default, Clone, Copy)]
pub struct TracingRecordSink;

#[async_trait]
impl CallRecordSink for TracingRecordSink {
    async fn publish(&self, record: &CallRecord) -> Result<(), ReportError> {
        let json = serde_json::to_string(record)?;
        info!(call_id = %record.call_id, record = %json, "call record");
        Ok(())
    }
}

/// Folds softphone events into call records
#[derive(Debug)]
pub struct CallReporter {
    user_id: String,
    records: HashMap<CallId, CallRecord>,
}

impl CallReporter {
    /// Reporter attributing calls to `user_id`
    pub fn new(user_id: impl Into<String>) -> Self {
        Self {
            user_id: user_id.into(),
            records: HashMap::new(),
        }
    }

    /// Apply one event, returning the updated record if it changed
    ///
    /// Records are dropped from the reporter once their call is over.
    pub fn apply(&mut self, event: &SoftphoneEvent) -> Option<CallRecord> {
        match event {
            SoftphoneEvent::OutgoingCall {
                call_id,
                remote_party,
            } => Some(self.open(
                *call_id,
                remote_party,
                CallDirection::Outbound,
                CallRecordStatus::Initiating,
            )),
            SoftphoneEvent::IncomingCall { info } => Some(self.open(
                info.call_id,
                &info.remote_party,
                CallDirection::Inbound,
                CallRecordStatus::Ringing,
            )),
            SoftphoneEvent::CallStatus { info } => {
                let record = self.records.get_mut(&info.call_id)?;
                match info.code {
                    CallStatusCode::Progress => record.status = CallRecordStatus::Ringing,
                    CallStatusCode::Confirmed => {
                        record.status = CallRecordStatus::Answered;
                        record.answered_at.get_or_insert(info.timestamp);
                    }
                    CallStatusCode::Refer => record.status = CallRecordStatus::Transferring,
                    CallStatusCode::TransferFailed => record.status = CallRecordStatus::Answered,
                    CallStatusCode::Ended => {
                        record.status = CallRecordStatus::Terminated;
                        record.ended_at = Some(info.timestamp);
                    }
                    CallStatusCode::Failed => {
                        record.status = CallRecordStatus::Failed;
                        record.ended_at = Some(info.timestamp);
                        if let crate::call::CallState::Failed(cause) = &info.state {
                            record.failure_cause = Some(cause.clone());
                        }
                    }
                }

                if matches!(info.code, CallStatusCode::Ended | CallStatusCode::Failed) {
                    self.records.remove(&info.call_id)
                } else {
                    Some(record.clone())
                }
            }
            _ => None,
        }
    }

    /// Number of calls still being tracked
    pub fn open_calls(&self) -> usize {
        self.records.len()
    }

    fn open(
        &mut self,
        call_id: CallId,
        number: &str,
        direction: CallDirection,
        status: CallRecordStatus,
    ) -> CallRecord {
        let record = CallRecord {
            call_id,
            user_id: self.user_id.clone(),
            number: number.to_string(),
            direction,
            status,
            started_at: Utc::now(),
            answered_at: None,
            ended_at: None,
            failure_cause: None,
        };
        self.records.insert(call_id, record.clone());
        record
    }

    /// Feed `events` into `sink` until the stream closes
    pub fn spawn(mut self, mut events: EventStream, sink: Arc<dyn CallRecordSink>) -> JoinHandle<()> {
        let span = info_span!("call_reporter", user_id = %self.user_id);
        tokio::spawn(
            async move {
                while let Some(event) = events.next_event().await {
                    let Some(record) = self.apply(&event) else {
                        continue;
                    };
                    if let Err(e) = sink.publish(&record).await {
                        warn!(call_id = %record.call_id, error = %e, "failed to publish call record");
                    }
                }
                debug!("call reporter stopped");
            }
            .instrument(span),
        )
    }
}
