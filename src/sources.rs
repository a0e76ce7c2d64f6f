//! Collaborators a recording strategy consumes but does not implement.

use crate::error::RResult;
use crate::measurement::Measurement;
use crate::session::SessionMetadata;
use crate::storage::Track;
use futures::stream::BoxStream;
use serde::{Deserialize, Serialize};
use thiserror::Error;
use tokio::time::Duration;

pub type SignalStream = BoxStream<'static, SignalEvent>;
pub type MeasurementStream = BoxStream<'static, Measurement>;

/// GPS location fix
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct GpsFix {
    pub latitude: f64,
    pub longitude: f64,
    pub accuracy: f64,
    /// km/h
    pub speed: f64,
    pub timestamp: f64,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum ActivityTransition {
    Enter,
    Exit,
}

/// Inbound events of the external link
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub enum SignalEvent {
    GpsFix(GpsFix),
    /// Reply of the vehicle to a looped OBD command
    CommandReply { command: String, timestamp: f64 },
    /// In-vehicle activity entered or left
    ActivityTransition(ActivityTransition),
    /// The OBD adapter answered the init sequence
    ConnectionVerified,
    ConnectionLost(String),
    AllAdaptersFailed,
    Fatal(String),
}

/// Source of link events (GPS receiver, OBD command looper).
///
/// Must accept a new `subscribe` after `unsubscribe`.
pub trait SignalSource: Send + Sync {
    fn subscribe(&self) -> RResult<SignalStream>;

    /// Release the registration. Calling it without an active subscription is
    /// an error the caller logs and ignores.
    fn unsubscribe(&self) -> RResult<()>;
}

/// Lazy, restartable measurement sequence sampled at the given interval
pub trait MeasurementSource: Send + Sync {
    fn measurements(&self, sampling_interval: Duration) -> MeasurementStream;
}

#[derive(Error, Debug, Clone, PartialEq)]
pub enum SinkError {
    #[error("Write failed: {0}")]
    WriteFailed(String),

    #[error("Track storage closed")]
    Closed,
}

/// Per-session storage transform
pub trait TrackWriter: Send {
    /// Store one enriched measurement. Returns the track handle when this write
    /// started a new track.
    fn write(&mut self, measurement: &Measurement) -> Result<Option<Track>, SinkError>;
}

/// Track persistence
pub trait TrackSink: Send + Sync {
    fn storage(&self, session: &SessionMetadata) -> Box<dyn TrackWriter>;
}
