//! Recording strategies: the public facade over one session driver per
//! recording attempt.
//!
//! Both variants share the same lifecycle; they differ only in how inbound
//! link events are read (see [`SignalPolicy`]).

mod driver;
pub mod gps;
pub mod obd;

#[cfg(test)]
mod testing;

use crate::consumption::{ConsumptionAlgorithm, FuelType, LoadBasedConsumption};
use crate::event_bus::{BusEvent, EventBus};
use crate::session::{Session, SessionMetadata, StopReason};
use crate::settings::{RecorderSettings, SettingsSource};
use crate::sources::{MeasurementSource, SignalEvent, SignalSource, TrackSink};
use crate::storage::Track;
use driver::{Input, SessionDriver};
use serde::{Deserialize, Serialize};
use std::sync::Arc;
use tokio::runtime::Handle;
use tokio::sync::{mpsc, watch};
use tokio::task::JoinHandle;
use tokio::time::Duration;

pub use gps::{GpsPolicy, GpsRecordingStrategy};
pub use obd::{ObdPolicy, ObdRecordingStrategy};

/// States announced to the listener
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum RecordingState {
    RecordingInit,
    RecordingRunning,
    RecordingStopped,
}

/// Receives the lifecycle of every session started with it
pub trait RecordingListener: Send + Sync {
    fn on_recording_state_changed(&self, state: RecordingState);

    /// At most once per session, always after `RecordingStopped`
    fn on_track_finished(&self, track: Track);
}

/// Public contract shared by the GPS and OBD strategies
pub trait RecordingStrategy {
    /// Start a new session. Silently ignored while one is recording.
    fn start_recording(&mut self, listener: Arc<dyn RecordingListener>);

    /// Ask the current session to stop. A no-op without one, or once a stop
    /// is already under way.
    fn stop_recording(&self);

    fn is_recording(&self) -> bool;

    /// Last state announced by the current (or previous) session
    fn state(&self) -> RecordingState;
}

/// How a variant reads a link event
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum LinkSignal {
    /// Evidence the link is alive
    Liveness,
    /// The source acknowledged start; also counts as liveness
    Acknowledged,
    DrivingEnter,
    DrivingExit,
    /// The link is gone for good
    Terminal {
        reason: String,
        permanently_failed: bool,
    },
    Ignored,
}

/// Variant-specific reading of the link
pub trait SignalPolicy: Clone + Send + Sync + 'static {
    fn name(&self) -> &'static str;

    /// Whether the session runs as soon as the signal source is acquired
    fn acknowledges_on_subscribe(&self) -> bool;

    fn classify(&self, event: &SignalEvent) -> LinkSignal;

    /// Silence tolerated before the link counts as degraded
    fn stale_after(&self, settings: &RecorderSettings) -> Duration;

    /// Advisory published when the link goes quiet
    fn degraded_event(&self, settings: &RecorderSettings) -> BusEvent;
}

pub type AlgorithmFactory = Arc<dyn Fn() -> Box<dyn ConsumptionAlgorithm> + Send + Sync>;

/// External collaborators shared by every session of a strategy
#[derive(Clone)]
pub(crate) struct Collaborators {
    pub signal_source: Arc<dyn SignalSource>,
    pub measurement_source: Arc<dyn MeasurementSource>,
    pub track_sink: Arc<dyn TrackSink>,
    pub settings: SettingsSource,
    pub bus: EventBus,
    pub algorithm: AlgorithmFactory,
    pub timer_scheduler: Option<Handle>,
}

/// Wires the collaborators of a strategy
pub struct StrategyBuilder {
    collaborators: Collaborators,
}

impl StrategyBuilder {
    pub fn new(
        signal_source: Arc<dyn SignalSource>,
        measurement_source: Arc<dyn MeasurementSource>,
        track_sink: Arc<dyn TrackSink>,
    ) -> Self {
        Self {
            collaborators: Collaborators {
                signal_source,
                measurement_source,
                track_sink,
                settings: SettingsSource::default(),
                bus: EventBus::new(),
                algorithm: fuel_algorithm(FuelType::Gasoline),
                timer_scheduler: None,
            },
        }
    }

    pub fn settings(mut self, settings: SettingsSource) -> Self {
        self.collaborators.settings = settings;
        self
    }

    pub fn event_bus(mut self, bus: EventBus) -> Self {
        self.collaborators.bus = bus;
        self
    }

    /// Use the load-based algorithm for this fuel type
    pub fn fuel_type(mut self, fuel_type: FuelType) -> Self {
        self.collaborators.algorithm = fuel_algorithm(fuel_type);
        self
    }

    /// Use a custom algorithm; the factory runs once per session
    pub fn algorithm<F>(mut self, factory: F) -> Self
    where
        F: Fn() -> Box<dyn ConsumptionAlgorithm> + Send + Sync + 'static,
    {
        self.collaborators.algorithm = Arc::new(factory);
        self
    }

    /// Runtime for watchdog timers; defaults to the runtime that starts the
    /// session
    pub fn timer_scheduler(mut self, handle: Handle) -> Self {
        self.collaborators.timer_scheduler = Some(handle);
        self
    }

    pub fn build_gps(self) -> GpsRecordingStrategy {
        Recorder::new(GpsPolicy, self.collaborators)
    }

    pub fn build_obd(self) -> ObdRecordingStrategy {
        Recorder::new(ObdPolicy, self.collaborators)
    }
}

fn fuel_algorithm(fuel_type: FuelType) -> AlgorithmFactory {
    Arc::new(move || {
        Box::new(LoadBasedConsumption::new(fuel_type)) as Box<dyn ConsumptionAlgorithm>
    })
}

/// Cloneable stop trigger for other tasks and threads
#[derive(Clone)]
pub struct StopHandle {
    inputs: mpsc::UnboundedSender<Input>,
}

impl StopHandle {
    /// Returns false if the session had already ended
    pub fn stop(&self) -> bool {
        self.inputs.send(Input::Stop(StopReason::Requested)).is_ok()
    }
}

struct ActiveSession {
    inputs: mpsc::UnboundedSender<Input>,
    state: watch::Receiver<RecordingState>,
    metadata: watch::Receiver<SessionMetadata>,
    task: Option<JoinHandle<()>>,
}

/// Strategy facade, generic over the variant policy
pub struct Recorder<P: SignalPolicy> {
    policy: P,
    collaborators: Collaborators,
    active: Option<ActiveSession>,
}

impl<P: SignalPolicy> Recorder<P> {
    fn new(policy: P, collaborators: Collaborators) -> Self {
        Self {
            policy,
            collaborators,
            active: None,
        }
    }

    pub fn event_bus(&self) -> &EventBus {
        &self.collaborators.bus
    }

    pub fn settings(&self) -> &SettingsSource {
        &self.collaborators.settings
    }

    /// Snapshot of the current (or previous) session
    pub fn session(&self) -> Option<SessionMetadata> {
        self.active.as_ref().map(|a| a.metadata.borrow().clone())
    }

    pub fn stop_handle(&self) -> Option<StopHandle> {
        self.active.as_ref().map(|a| StopHandle {
            inputs: a.inputs.clone(),
        })
    }

    /// Wait until the current session has released everything
    pub async fn join(&mut self) {
        let task = self.active.as_mut().and_then(|a| a.task.take());
        if let Some(task) = task {
            if let Err(e) = task.await {
                log::error!("{} session driver ended abnormally: {}", self.policy.name(), e);
            }
        }
    }

    /// Host teardown: stop a running session and wait for it. Never produces a
    /// second stopped notification.
    pub async fn shutdown(&mut self) {
        log::info!("Destroying {} recording strategy", self.policy.name());
        if let Some(active) = &self.active {
            let _ = active.inputs.send(Input::Stop(StopReason::Shutdown));
        }
        self.join().await;
    }
}

impl<P: SignalPolicy> RecordingStrategy for Recorder<P> {
    fn start_recording(&mut self, listener: Arc<dyn RecordingListener>) {
        if self.is_recording() {
            log::info!("{} recording already running, start ignored", self.policy.name());
            return;
        }

        let runtime = match Handle::try_current() {
            Ok(handle) => handle,
            Err(e) => {
                log::error!("Cannot start recording outside a tokio runtime: {}", e);
                listener.on_recording_state_changed(RecordingState::RecordingInit);
                listener.on_recording_state_changed(RecordingState::RecordingStopped);
                return;
            }
        };

        let session = Session::new();
        log::info!("Starting {} recording, session {}", self.policy.name(), session.id());

        let (inputs_tx, inputs_rx) = mpsc::unbounded_channel();
        let (state_tx, state_rx) = watch::channel(RecordingState::RecordingInit);
        let (metadata_tx, metadata_rx) = watch::channel(session.metadata());

        let driver = SessionDriver::new(
            self.policy.clone(),
            session,
            self.collaborators.clone(),
            listener,
            inputs_tx.clone(),
            inputs_rx,
            state_tx,
            metadata_tx,
            runtime.clone(),
        );
        let task = runtime.spawn(driver.run());

        self.active = Some(ActiveSession {
            inputs: inputs_tx,
            state: state_rx,
            metadata: metadata_rx,
            task: Some(task),
        });
    }

    fn stop_recording(&self) {
        log::info!("Stopping the track recording");
        match &self.active {
            Some(active) => {
                if active.inputs.send(Input::Stop(StopReason::Requested)).is_err() {
                    log::debug!("Session already ended");
                }
            }
            None => log::debug!("No session to stop"),
        }
    }

    fn is_recording(&self) -> bool {
        self.active.as_ref().is_some_and(|a| {
            !a.inputs.is_closed() && *a.state.borrow() != RecordingState::RecordingStopped
        })
    }

    fn state(&self) -> RecordingState {
        self.active
            .as_ref()
            .map(|a| *a.state.borrow())
            .unwrap_or(RecordingState::RecordingStopped)
    }
}
