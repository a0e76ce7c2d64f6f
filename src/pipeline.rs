use crate::consumption::{ConsumptionAlgorithm, ConsumptionError};
use crate::measurement::{Measurement, PropertyKey};
use crate::sources::{MeasurementStream, TrackWriter};
use crate::storage::Track;
use futures::StreamExt;
use std::sync::{Arc, Mutex};

/// What the pipeline reports back to the session driver
#[derive(Debug, Clone, PartialEq)]
pub enum PipelineEvent {
    /// The sink started a track; reported once per session
    TrackStarted(Track),
    /// One measurement went through enrichment and storage
    Measured,
    /// The source stream ended
    Completed,
}

#[derive(Debug, Default)]
struct GateState {
    closed: bool,
    track: Option<Track>,
}

/// Storage gate shared by a pipeline and its session.
///
/// Holds the first track the writer started. Once closed, no further write
/// reaches the writer, so the track returned by `close` is final.
#[derive(Debug, Clone, Default)]
pub struct TrackGate {
    state: Arc<Mutex<GateState>>,
}

impl TrackGate {
    pub fn new() -> Self {
        Self::default()
    }

    /// Refuse every later write and return the started track, if any
    pub fn close(&self) -> Option<Track> {
        match self.state.lock() {
            Ok(mut state) => {
                state.closed = true;
                state.track.clone()
            }
            Err(_) => {
                log::error!("Track gate poisoned");
                None
            }
        }
    }

    pub fn is_closed(&self) -> bool {
        self.state.lock().map(|s| s.closed).unwrap_or(true)
    }

    pub fn track(&self) -> Option<Track> {
        self.state.lock().ok().and_then(|s| s.track.clone())
    }
}

/// Enriches raw measurements and forwards them to the track writer, strictly
/// in source order.
pub struct MeasurementPipeline {
    algorithm: Box<dyn ConsumptionAlgorithm>,
    writer: Box<dyn TrackWriter>,
    gate: TrackGate,
    processed: u64,
    failed_enrichments: u64,
    failed_writes: u64,
}

impl MeasurementPipeline {
    pub fn new(algorithm: Box<dyn ConsumptionAlgorithm>, writer: Box<dyn TrackWriter>) -> Self {
        Self {
            algorithm,
            writer,
            gate: TrackGate::new(),
            processed: 0,
            failed_enrichments: 0,
            failed_writes: 0,
        }
    }

    /// Handle on the storage gate of this pipeline
    pub fn gate(&self) -> TrackGate {
        self.gate.clone()
    }

    /// Add consumption and CO2. On failure the measurement passes through
    /// unchanged.
    pub fn enhance(&mut self, measurement: Measurement) -> Measurement {
        match self.derive(&measurement) {
            Ok((consumption, co2)) => measurement
                .with_property(PropertyKey::EnergyConsumption, consumption)
                .with_property(PropertyKey::EnergyConsumptionCo2, co2),
            Err(e) => {
                self.failed_enrichments += 1;
                log::warn!(
                    "Could not enrich measurement at {:.3}: {}",
                    measurement.timestamp,
                    e
                );
                measurement
            }
        }
    }

    fn derive(&mut self, measurement: &Measurement) -> Result<(f64, f64), ConsumptionError> {
        let consumption = self.algorithm.calculate_consumption(measurement)?;
        let co2 = self.algorithm.calculate_co2_from_consumption(consumption)?;
        Ok((consumption, co2))
    }

    /// Store an enriched measurement. Returns the track handle the first time
    /// the writer reports one; write failures are logged and skipped, and
    /// nothing is written once the gate is closed.
    pub fn forward(&mut self, measurement: &Measurement) -> Option<Track> {
        let mut gate = match self.gate.state.lock() {
            Ok(gate) => gate,
            Err(_) => {
                self.failed_writes += 1;
                log::error!("Track gate poisoned, dropping measurement");
                return None;
            }
        };
        if gate.closed {
            log::debug!("Track closed, dropping measurement at {:.3}", measurement.timestamp);
            return None;
        }

        match self.writer.write(measurement) {
            Ok(Some(track)) if gate.track.is_none() => {
                log::info!("Started new track with ID={}", track.id);
                gate.track = Some(track.clone());
                Some(track)
            }
            Ok(_) => None,
            Err(e) => {
                self.failed_writes += 1;
                log::warn!(
                    "Dropping measurement at {:.3} from storage: {}",
                    measurement.timestamp,
                    e
                );
                None
            }
        }
    }

    /// Enhance then forward one measurement
    pub fn process(&mut self, measurement: Measurement) -> (Measurement, Option<Track>) {
        log::debug!("Received next recorded measurement");
        let enriched = self.enhance(measurement);
        let track = self.forward(&enriched);
        self.processed += 1;
        (enriched, track)
    }

    /// Drain the stream until it ends or the task is aborted.
    ///
    /// Each measurement is processed on the blocking pool, so a slow algorithm
    /// never occupies an async worker. An abort leaves the measurement in
    /// flight to finish on its own; close the gate to keep it out of storage.
    pub async fn run<F>(mut self, mut measurements: MeasurementStream, mut emit: F)
    where
        F: FnMut(PipelineEvent) + Send,
    {
        while let Some(raw) = measurements.next().await {
            let outcome = tokio::task::spawn_blocking(move || {
                let (_, track) = self.process(raw);
                (self, track)
            })
            .await;

            let track = match outcome {
                Ok((pipeline, track)) => {
                    self = pipeline;
                    track
                }
                Err(e) => {
                    log::error!("Measurement processing failed: {}", e);
                    emit(PipelineEvent::Completed);
                    return;
                }
            };

            if let Some(track) = track {
                emit(PipelineEvent::TrackStarted(track));
            }
            emit(PipelineEvent::Measured);
        }

        log::info!(
            "Measurement stream finished after {} measurement(s) ({} unenriched, {} unstored)",
            self.processed,
            self.failed_enrichments,
            self.failed_writes
        );
        emit(PipelineEvent::Completed);
    }

    pub fn processed(&self) -> u64 {
        self.processed
    }

    pub fn failed_enrichments(&self) -> u64 {
        self.failed_enrichments
    }

    pub fn failed_writes(&self) -> u64 {
        self.failed_writes
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::consumption::{FuelType, LoadBasedConsumption};
    use crate::session::Session;
    use crate::sources::{SinkError, TrackSink};
    use crate::storage::MemoryTrackSink;
    use std::sync::{Arc, Mutex};

    /// Fails on one timestamp, otherwise reports 1 l/h
    struct FlakyAlgorithm {
        fail_at: f64,
    }

    impl ConsumptionAlgorithm for FlakyAlgorithm {
        fn calculate_consumption(&mut self, m: &Measurement) -> Result<f64, ConsumptionError> {
            if m.timestamp == self.fail_at {
                Err(ConsumptionError::MissingProperty(PropertyKey::Speed))
            } else {
                Ok(1.0)
            }
        }

        fn calculate_co2_from_consumption(
            &self,
            consumption: f64,
        ) -> Result<f64, ConsumptionError> {
            Ok(consumption * 2.0)
        }
    }

    #[derive(Clone, Default)]
    struct RecordingWriter {
        written: Arc<Mutex<Vec<Measurement>>>,
    }

    impl TrackWriter for RecordingWriter {
        fn write(&mut self, m: &Measurement) -> Result<Option<Track>, SinkError> {
            let mut written = self.written.lock().unwrap();
            written.push(m.clone());
            if written.len() == 1 {
                Ok(Some(Track::new("track_1", "session_1", chrono::Utc::now())))
            } else {
                Ok(None)
            }
        }
    }

    fn raw(timestamp: f64) -> Measurement {
        Measurement::new(timestamp).with_property(PropertyKey::Speed, 50.0)
    }

    #[test]
    fn test_enhance_adds_derived_properties() {
        let sink = MemoryTrackSink::new();
        let mut pipeline = MeasurementPipeline::new(
            Box::new(LoadBasedConsumption::new(FuelType::Gasoline)),
            sink.storage(&Session::new().metadata()),
        );

        let enriched = pipeline.enhance(raw(0.0));
        let consumption = enriched.property(PropertyKey::EnergyConsumption).unwrap();
        let co2 = enriched.property(PropertyKey::EnergyConsumptionCo2).unwrap();
        assert!(consumption > 0.0);
        assert!((co2 - consumption * 2.35).abs() < 1e-9);
    }

    #[tokio::test]
    async fn test_enrichment_failure_passes_measurement_through() {
        let writer = RecordingWriter::default();
        let written = writer.written.clone();
        let pipeline =
            MeasurementPipeline::new(Box::new(FlakyAlgorithm { fail_at: 2.0 }), Box::new(writer));

        let stream = futures::stream::iter((1..=4).map(|t| raw(t as f64))).boxed();
        let mut events = Vec::new();
        pipeline.run(stream, |e| events.push(e)).await;

        let written = written.lock().unwrap();
        let timestamps: Vec<f64> = written.iter().map(|m| m.timestamp).collect();
        assert_eq!(timestamps, vec![1.0, 2.0, 3.0, 4.0]);

        assert!(!written[1].has_property(PropertyKey::EnergyConsumption));
        assert_eq!(written[1].property(PropertyKey::Speed), Some(50.0));
        assert_eq!(written[2].property(PropertyKey::EnergyConsumptionCo2), Some(2.0));

        assert!(matches!(events.first(), Some(PipelineEvent::TrackStarted(_))));
        assert_eq!(events.last(), Some(&PipelineEvent::Completed));
        let measured = events.iter().filter(|e| **e == PipelineEvent::Measured).count();
        assert_eq!(measured, 4);
    }

    #[test]
    fn test_write_failure_is_not_fatal() {
        let sink = MemoryTrackSink::new();
        let mut pipeline = MeasurementPipeline::new(
            Box::new(FlakyAlgorithm { fail_at: -1.0 }),
            sink.storage(&Session::new().metadata()),
        );

        sink.fail_writes(true);
        let (_, none) = pipeline.process(raw(1.0));
        assert!(none.is_none());

        sink.fail_writes(false);
        let (_, track) = pipeline.process(raw(2.0));
        assert!(track.is_some());
        let (_, again) = pipeline.process(raw(3.0));
        assert!(again.is_none());

        assert_eq!(pipeline.processed(), 3);
        assert_eq!(pipeline.failed_writes(), 1);
    }

    #[test]
    fn test_closed_gate_keeps_track_final() {
        let sink = MemoryTrackSink::new();
        let mut pipeline = MeasurementPipeline::new(
            Box::new(FlakyAlgorithm { fail_at: -1.0 }),
            sink.storage(&Session::new().metadata()),
        );
        let gate = pipeline.gate();
        assert_eq!(gate.close(), None);

        // a measurement processed after the close never starts a track
        let (_, track) = pipeline.process(raw(1.0));
        assert!(track.is_none());
        assert_eq!(sink.track_count(), 0);
        assert!(gate.is_closed());
    }

    #[test]
    fn test_gate_reports_started_track() {
        let sink = MemoryTrackSink::new();
        let mut pipeline = MeasurementPipeline::new(
            Box::new(FlakyAlgorithm { fail_at: -1.0 }),
            sink.storage(&Session::new().metadata()),
        );
        let gate = pipeline.gate();

        let (_, started) = pipeline.process(raw(1.0));
        pipeline.process(raw(2.0));

        let closed = gate.close();
        assert_eq!(closed, started);
        assert_eq!(gate.track(), started);
        pipeline.process(raw(3.0));
        assert_eq!(sink.measurements(&closed.unwrap().id).len(), 2);
    }
}
