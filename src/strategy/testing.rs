//! Fixtures shared by the strategy tests.

use super::{
    GpsRecordingStrategy, ObdRecordingStrategy, RecordingListener, RecordingState, StopHandle,
    StrategyBuilder,
};
use crate::consumption::{ConsumptionAlgorithm, ConsumptionError};
use crate::event_bus::{BusEvent, EventBus};
use crate::measurement::{Measurement, PropertyKey};
use crate::sensors::{ChannelSignalSource, SimulatedMeasurements};
use crate::settings::{RecorderSettings, SettingsSource};
use crate::session::SessionMetadata;
use crate::sources::{MeasurementSource, MeasurementStream, SinkError, TrackSink, TrackWriter};
use crate::storage::{MemoryTrackSink, Track};
use crossbeam::channel::Receiver;
use futures::StreamExt;
use std::sync::{Arc, Mutex};
use tokio::time::{sleep, Duration};

#[derive(Debug, Clone, PartialEq)]
pub enum Heard {
    State(RecordingState),
    Finished(String),
}

/// Listener that remembers every callback in order
#[derive(Default)]
pub struct EventLog {
    heard: Mutex<Vec<Heard>>,
}

impl EventLog {
    pub fn heard(&self) -> Vec<Heard> {
        self.heard.lock().unwrap().clone()
    }

    pub fn count(&self, item: &Heard) -> usize {
        self.heard().iter().filter(|h| *h == item).count()
    }

    pub fn finished_tracks(&self) -> Vec<String> {
        self.heard()
            .into_iter()
            .filter_map(|h| match h {
                Heard::Finished(id) => Some(id),
                _ => None,
            })
            .collect()
    }

    pub fn finished_count(&self) -> usize {
        self.finished_tracks().len()
    }

    /// Every finished track directly follows a stopped notification
    pub fn assert_finished_after_stopped(&self) {
        let heard = self.heard();
        for (i, h) in heard.iter().enumerate() {
            if matches!(h, Heard::Finished(_)) {
                assert!(i > 0, "track finished before any state");
                assert_eq!(heard[i - 1], Heard::State(RecordingState::RecordingStopped));
            }
        }
    }
}

impl RecordingListener for EventLog {
    fn on_recording_state_changed(&self, state: RecordingState) {
        self.heard.lock().unwrap().push(Heard::State(state));
    }

    fn on_track_finished(&self, track: Track) {
        self.heard.lock().unwrap().push(Heard::Finished(track.id));
    }
}

/// Never yields a measurement
pub struct Silent;

impl MeasurementSource for Silent {
    fn measurements(&self, _: Duration) -> MeasurementStream {
        futures::stream::pending().boxed()
    }
}

/// Yields a fixed number of measurements at once, then ends
pub struct Finite(pub u64);

impl MeasurementSource for Finite {
    fn measurements(&self, _: Duration) -> MeasurementStream {
        futures::stream::iter((0..self.0).map(|i| {
            Measurement::new(i as f64)
                .with_position(52.0, 7.6)
                .with_property(PropertyKey::GpsSpeed, 40.0)
        }))
        .boxed()
    }
}

/// Blocks its thread on every measurement
pub struct SlowAlgorithm(pub Duration);

impl ConsumptionAlgorithm for SlowAlgorithm {
    fn calculate_consumption(&mut self, _: &Measurement) -> Result<f64, ConsumptionError> {
        std::thread::sleep(self.0);
        Ok(1.0)
    }

    fn calculate_co2_from_consumption(&self, consumption: f64) -> Result<f64, ConsumptionError> {
        Ok(consumption * 2.35)
    }
}

/// Asks the session to stop from inside its first write, so the stop is
/// queued ahead of the track announcement.
#[derive(Clone, Default)]
pub struct StopOnFirstWrite {
    pub inner: MemoryTrackSink,
    pub stop: Arc<Mutex<Option<StopHandle>>>,
}

impl TrackSink for StopOnFirstWrite {
    fn storage(&self, session: &SessionMetadata) -> Box<dyn TrackWriter> {
        Box::new(StopOnFirstWriteWriter {
            inner: self.inner.storage(session),
            stop: self.stop.clone(),
        })
    }
}

struct StopOnFirstWriteWriter {
    inner: Box<dyn TrackWriter>,
    stop: Arc<Mutex<Option<StopHandle>>>,
}

impl TrackWriter for StopOnFirstWriteWriter {
    fn write(&mut self, measurement: &Measurement) -> Result<Option<Track>, SinkError> {
        let written = self.inner.write(measurement);
        if let Some(handle) = self.stop.lock().unwrap().take() {
            handle.stop();
        }
        written
    }
}

pub struct Fixture {
    pub signals: ChannelSignalSource,
    pub sink: MemoryTrackSink,
    pub settings: SettingsSource,
    pub bus: EventBus,
    pub log: Arc<EventLog>,
    measurements: Arc<dyn MeasurementSource>,
    bus_rx: Receiver<BusEvent>,
}

impl Fixture {
    pub fn new(settings: RecorderSettings) -> Self {
        Self::with_measurements(settings, Arc::new(SimulatedMeasurements::gps_only()))
    }

    pub fn with_measurements(
        settings: RecorderSettings,
        measurements: Arc<dyn MeasurementSource>,
    ) -> Self {
        let _ = env_logger::builder().is_test(true).try_init();

        let bus = EventBus::new();
        let (_, bus_rx) = bus.subscribe_channel().unwrap();
        Self {
            signals: ChannelSignalSource::new(),
            sink: MemoryTrackSink::new(),
            settings: SettingsSource::new(settings).unwrap(),
            bus,
            log: Arc::new(EventLog::default()),
            measurements,
            bus_rx,
        }
    }

    pub fn builder(&self) -> StrategyBuilder {
        self.builder_with_sink(Arc::new(self.sink.clone()))
    }

    pub fn builder_with_sink(&self, sink: Arc<dyn TrackSink>) -> StrategyBuilder {
        StrategyBuilder::new(
            Arc::new(self.signals.clone()),
            self.measurements.clone(),
            sink,
        )
        .settings(self.settings.clone())
        .event_bus(self.bus.clone())
    }

    pub fn gps(&self) -> GpsRecordingStrategy {
        self.builder().build_gps()
    }

    pub fn obd(&self) -> ObdRecordingStrategy {
        self.builder().build_obd()
    }

    /// Let the driver and its helpers run until they are all waiting
    pub async fn settle(&self) {
        sleep(Duration::from_millis(10)).await;
    }

    /// Advisories published so far
    pub fn bus_events(&self) -> Vec<BusEvent> {
        self.bus_rx.try_iter().collect()
    }
}

pub fn settings_with(change: impl FnOnce(&mut RecorderSettings)) -> RecorderSettings {
    let mut settings = RecorderSettings::default();
    change(&mut settings);
    settings
}
