use super::{Collaborators, LinkSignal, RecordingListener, RecordingState, SignalPolicy};
use crate::error::{RResult, RecorderError};
use crate::event_bus::{BusEvent, SubscriptionId};
use crate::pipeline::{MeasurementPipeline, PipelineEvent, TrackGate};
use crate::session::{Session, SessionMetadata, SessionState, StopReason};
use crate::settings::RecorderSettings;
use crate::sources::SignalEvent;
use crate::watchdog::{
    FireCallback, LivenessWatchdog, RearmableTimer, TimerConcern, TimerFired, WatchdogVerdict,
};
use futures::StreamExt;
use std::sync::Arc;
use tokio::runtime::Handle;
use tokio::sync::{mpsc, watch};
use tokio::task::JoinHandle;

/// Everything that can reach a session, serialized through one queue
#[derive(Debug)]
pub(crate) enum Input {
    Signal(SignalEvent),
    /// The signal stream ended without a terminal event
    SignalClosed,
    Pipeline(PipelineEvent),
    Timer(TimerFired),
    Settings(RecorderSettings),
    Bus(BusEvent),
    Stop(StopReason),
}

/// A resource acquired during startup, released in reverse order on stop
enum Resource {
    Task {
        name: &'static str,
        handle: JoinHandle<()>,
    },
    BusSubscription(SubscriptionId),
    SignalRegistration,
}

/// Owns one session and everything it acquired. Runs as a single task, so
/// state changes never interleave.
pub(crate) struct SessionDriver<P: SignalPolicy> {
    policy: P,
    session: Session,
    collaborators: Collaborators,
    listener: Arc<dyn RecordingListener>,
    inputs_tx: mpsc::UnboundedSender<Input>,
    inputs: mpsc::UnboundedReceiver<Input>,
    state_tx: watch::Sender<RecordingState>,
    metadata_tx: watch::Sender<SessionMetadata>,
    settings: RecorderSettings,
    settings_rx: Option<watch::Receiver<RecorderSettings>>,
    watchdog: LivenessWatchdog,
    trim: RearmableTimer,
    track_gate: Option<TrackGate>,
    resources: Vec<Resource>,
}

impl<P: SignalPolicy> SessionDriver<P> {
    #[allow(clippy::too_many_arguments)]
    pub(crate) fn new(
        policy: P,
        session: Session,
        collaborators: Collaborators,
        listener: Arc<dyn RecordingListener>,
        inputs_tx: mpsc::UnboundedSender<Input>,
        inputs: mpsc::UnboundedReceiver<Input>,
        state_tx: watch::Sender<RecordingState>,
        metadata_tx: watch::Sender<SessionMetadata>,
        runtime: Handle,
    ) -> Self {
        let scheduler = collaborators.timer_scheduler.clone().unwrap_or(runtime);
        let timer_tx = inputs_tx.clone();
        let on_fire: FireCallback = Arc::new(move |fired| {
            let _ = timer_tx.send(Input::Timer(fired));
        });

        // subscribe before reading, so no change slips in between
        let mut settings_rx = collaborators.settings.subscribe();
        let settings = *settings_rx.borrow_and_update();

        Self {
            policy,
            session,
            listener,
            inputs_tx,
            inputs,
            state_tx,
            metadata_tx,
            settings,
            settings_rx: Some(settings_rx),
            watchdog: LivenessWatchdog::new(scheduler.clone(), on_fire.clone()),
            trim: RearmableTimer::new(TimerConcern::DrivingTrim, scheduler, on_fire),
            track_gate: None,
            resources: Vec::new(),
            collaborators,
        }
    }

    pub(crate) async fn run(mut self) {
        self.announce(RecordingState::RecordingInit);

        if let Err(e) = self.acquire() {
            log::error!("Unable to start {} recording: {}", self.policy.name(), e);
            self.stop(StopReason::UpstreamFailed).await;
            return;
        }

        if self.policy.acknowledges_on_subscribe() {
            self.acknowledge();
        }
        self.ping();

        while let Some(input) = self.inputs.recv().await {
            if let Some(reason) = self.handle(input) {
                self.stop(reason).await;
                break;
            }
        }

        // unreachable while we hold a sender, kept so the session always ends
        if self.session.is_active() {
            self.stop(StopReason::Shutdown).await;
        }
    }

    fn acquire(&mut self) -> RResult<()> {
        let mut signals = self.collaborators.signal_source.subscribe()?;
        self.resources.push(Resource::SignalRegistration);

        let tx = self.inputs_tx.clone();
        let forwarder = tokio::spawn(async move {
            while let Some(event) = signals.next().await {
                if tx.send(Input::Signal(event)).is_err() {
                    return;
                }
            }
            let _ = tx.send(Input::SignalClosed);
        });
        self.resources.push(Resource::Task {
            name: "signal forwarder",
            handle: forwarder,
        });

        let tx = self.inputs_tx.clone();
        let subscription = self.collaborators.bus.subscribe(move |event| {
            if *event == BusEvent::TrackRecordingContinue {
                let _ = tx.send(Input::Bus(event.clone()));
            }
        })?;
        self.resources.push(Resource::BusSubscription(subscription));

        let mut settings_rx = self
            .settings_rx
            .take()
            .ok_or_else(|| RecorderError::Internal("settings already watched".to_string()))?;
        let tx = self.inputs_tx.clone();
        let settings_forwarder = tokio::spawn(async move {
            while settings_rx.changed().await.is_ok() {
                let settings = *settings_rx.borrow_and_update();
                if tx.send(Input::Settings(settings)).is_err() {
                    return;
                }
            }
        });
        self.resources.push(Resource::Task {
            name: "settings forwarder",
            handle: settings_forwarder,
        });

        let writer = self.collaborators.track_sink.storage(&self.session.metadata());
        let algorithm = (self.collaborators.algorithm)();
        let pipeline = MeasurementPipeline::new(algorithm, writer);
        self.track_gate = Some(pipeline.gate());
        let measurements = self
            .collaborators
            .measurement_source
            .measurements(self.settings.sampling_interval());
        let tx = self.inputs_tx.clone();
        let pipeline_task = tokio::spawn(pipeline.run(measurements, move |event| {
            let _ = tx.send(Input::Pipeline(event));
        }));
        self.resources.push(Resource::Task {
            name: "measurement pipeline",
            handle: pipeline_task,
        });

        Ok(())
    }

    /// Apply one input. Returns a reason when the session has to stop.
    fn handle(&mut self, input: Input) -> Option<StopReason> {
        if !self.session.is_active() {
            log::debug!("Session {} inactive, dropping {:?}", self.session.id(), input);
            return None;
        }

        match input {
            Input::Signal(event) => self.on_signal(event),
            Input::SignalClosed => {
                log::info!("{} signal stream ended", self.policy.name());
                None
            }
            Input::Pipeline(event) => self.on_pipeline(event),
            Input::Timer(fired) => self.on_timer(fired),
            Input::Settings(settings) => {
                log::debug!("Session {} picked up new settings", self.session.id());
                self.settings = settings;
                None
            }
            Input::Bus(BusEvent::TrackRecordingContinue) => {
                log::info!("Continuing the track recording despite the silent link");
                self.ping();
                None
            }
            Input::Bus(_) => None,
            Input::Stop(reason) => Some(reason),
        }
    }

    fn on_signal(&mut self, event: SignalEvent) -> Option<StopReason> {
        match self.policy.classify(&event) {
            LinkSignal::Liveness => {
                self.ping();
                None
            }
            LinkSignal::Acknowledged => {
                self.ping();
                if self.session.state() == SessionState::Init {
                    self.acknowledge();
                }
                None
            }
            LinkSignal::DrivingEnter => {
                match self.session.enter_driving() {
                    Ok(()) => {
                        log::info!("Driving detected");
                        self.trim.disarm();
                        self.announce(RecordingState::RecordingRunning);
                        self.collaborators
                            .bus
                            .publish(BusEvent::DrivingDetected { driving: true });
                        self.publish_metadata();
                    }
                    Err(e) => log::debug!("Ignoring driving start: {}", e),
                }
                None
            }
            LinkSignal::DrivingExit => {
                match self.session.exit_driving() {
                    Ok(()) => {
                        let trim = self.settings.track_trim_duration();
                        log::info!("Driving stopped, ending the track in {:?}", trim);
                        self.collaborators
                            .bus
                            .publish(BusEvent::DrivingDetected { driving: false });
                        self.trim.reset(trim);
                        self.publish_metadata();
                    }
                    Err(e) => log::debug!("Ignoring driving stop: {}", e),
                }
                None
            }
            LinkSignal::Terminal {
                reason,
                permanently_failed,
            } => {
                log::error!("{} link failed: {}", self.policy.name(), reason);
                if permanently_failed {
                    self.collaborators
                        .bus
                        .publish(BusEvent::ConnectionPermanentlyFailed);
                }
                Some(StopReason::UpstreamFailed)
            }
            LinkSignal::Ignored => None,
        }
    }

    fn on_pipeline(&mut self, event: PipelineEvent) -> Option<StopReason> {
        match event {
            PipelineEvent::TrackStarted(track) => {
                if let Err(e) = self.session.attach_track(track) {
                    log::warn!("Ignoring track handle: {}", e);
                }
                self.publish_metadata();
                None
            }
            PipelineEvent::Measured => {
                if self.session.record_measurement().is_ok() {
                    self.publish_metadata();
                }
                None
            }
            PipelineEvent::Completed => Some(StopReason::SourceCompleted),
        }
    }

    fn on_timer(&mut self, fired: TimerFired) -> Option<StopReason> {
        if fired.concern == TimerConcern::DrivingTrim {
            if self.trim.accept(fired) {
                log::info!("No driving for the trim duration, stopping");
                return Some(StopReason::DrivingEnded);
            }
            return None;
        }

        match self
            .watchdog
            .handle_fire(fired, self.settings.pending_termination())
        {
            WatchdogVerdict::Degraded => {
                log::warn!(
                    "No {} liveness for {:?}, ending in {:?} unless it recovers",
                    self.policy.name(),
                    self.policy.stale_after(&self.settings),
                    self.settings.pending_termination()
                );
                self.collaborators
                    .bus
                    .publish(self.policy.degraded_event(&self.settings));
                None
            }
            WatchdogVerdict::Terminate => {
                log::warn!("{} link still silent, stopping", self.policy.name());
                Some(StopReason::LinkLost)
            }
            WatchdogVerdict::Ignored => None,
        }
    }

    fn ping(&mut self) {
        let stale_after = self.policy.stale_after(&self.settings);
        if self.watchdog.ping(stale_after) {
            log::info!("{} link recovered", self.policy.name());
        }
    }

    fn acknowledge(&mut self) {
        match self.session.start() {
            Ok(()) => {
                self.announce(RecordingState::RecordingRunning);
                self.publish_metadata();
            }
            Err(e) => log::warn!("Cannot mark session running: {}", e),
        }
    }

    /// The single stop path. Only the first call does anything.
    async fn stop(&mut self, reason: StopReason) {
        if !self.session.is_active() {
            return;
        }

        // a track started by a write still queued behind this stop counts too
        if let Some(track) = self.track_gate.as_ref().and_then(TrackGate::close) {
            if self.session.track().is_none() {
                if let Err(e) = self.session.attach_track(track) {
                    log::warn!("Ignoring track handle: {}", e);
                }
            }
        }

        if !self.session.stop(reason) {
            return;
        }
        log::info!(
            "Stopping session {} ({:?}) after {} measurement(s)",
            self.session.id(),
            reason,
            self.session.metadata().measurement_count
        );

        self.watchdog.disarm();
        self.trim.disarm();

        let resources = std::mem::take(&mut self.resources);
        for resource in resources.into_iter().rev() {
            self.release(resource).await;
        }

        self.publish_metadata();
        self.announce(RecordingState::RecordingStopped);

        if let Some(track) = self.session.finish_track() {
            log::info!("Track {} finished", track.id);
            self.listener.on_track_finished(track);
        }
    }

    async fn release(&self, resource: Resource) {
        match resource {
            Resource::Task { name, handle } => finish_task(name, handle).await,
            Resource::BusSubscription(id) => {
                if let Err(e) = self.collaborators.bus.unsubscribe(id) {
                    log::error!("Failed to unregister from the event bus: {}", e);
                }
            }
            Resource::SignalRegistration => {
                if let Err(e) = self.collaborators.signal_source.unsubscribe() {
                    log::error!("Failed to unregister {} signals: {}", self.policy.name(), e);
                }
            }
        }
    }

    fn announce(&self, state: RecordingState) {
        log::info!("Session {}: {:?}", self.session.id(), state);
        self.state_tx.send_replace(state);
        self.listener.on_recording_state_changed(state);
    }

    fn publish_metadata(&self) {
        self.metadata_tx.send_replace(self.session.metadata());
    }
}

/// Abort a helper task and wait until it is gone
async fn finish_task(name: &'static str, handle: JoinHandle<()>) {
    handle.abort();
    match handle.await {
        Ok(()) => log::debug!("{} finished", name),
        Err(e) if e.is_cancelled() => log::debug!("{} cancelled", name),
        Err(e) => log::error!("{} failed: {}", name, e),
    }
}
