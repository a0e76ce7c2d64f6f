// Trip Recorder
// Recording-session lifecycle for vehicle trips: liveness watchdog, driving
// detection trim and the measurement pipeline behind GPS and OBD strategies.

pub mod consumption;
pub mod error;
pub mod event_bus;
pub mod measurement;
pub mod pipeline;
pub mod sensors;
pub mod session;
pub mod settings;
pub mod sources;
pub mod storage;
pub mod strategy;
pub mod watchdog;

pub use consumption::{ConsumptionAlgorithm, FuelType, LoadBasedConsumption};
pub use error::{RResult, RecorderError};
pub use event_bus::{BusEvent, EventBus, SubscriptionId};
pub use measurement::{Measurement, PropertyKey};
pub use session::{Session, SessionMetadata, SessionState, StopReason};
pub use settings::{RecorderSettings, SettingsSource};
pub use sources::{MeasurementSource, SignalEvent, SignalSource, TrackSink, TrackWriter};
pub use storage::{MemoryTrackSink, Track, TrackExport};
pub use strategy::{
    GpsRecordingStrategy, ObdRecordingStrategy, RecordingListener, RecordingState,
    RecordingStrategy, StrategyBuilder,
};
