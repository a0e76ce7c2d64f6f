//! Simulated link and measurement sources for the demo binary and tests.

use crate::error::{RResult, RecorderError};
use crate::measurement::{Measurement, PropertyKey};
use crate::sources::{
    GpsFix, MeasurementSource, MeasurementStream, SignalEvent, SignalSource, SignalStream,
};
use futures::channel::mpsc::{unbounded, UnboundedSender};
use futures::StreamExt;
use std::f64::consts::PI;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use tokio::time::{interval, sleep, Duration, Interval};

/// Signal source fed by hand through `emit`.
///
/// Every `subscribe` opens a fresh channel; `unsubscribe` closes it.
#[derive(Clone, Default)]
pub struct ChannelSignalSource {
    current: Arc<Mutex<Option<UnboundedSender<SignalEvent>>>>,
    subscriptions: Arc<AtomicUsize>,
    refuse_subscribe: Arc<AtomicBool>,
}

impl ChannelSignalSource {
    pub fn new() -> Self {
        Self::default()
    }

    /// Deliver an event to the current subscriber. Returns false if nobody is
    /// subscribed.
    pub fn emit(&self, event: SignalEvent) -> bool {
        match self.current.lock() {
            Ok(guard) => guard
                .as_ref()
                .map(|tx| tx.unbounded_send(event).is_ok())
                .unwrap_or(false),
            Err(_) => false,
        }
    }

    pub fn is_subscribed(&self) -> bool {
        self.current.lock().map(|g| g.is_some()).unwrap_or(false)
    }

    /// Number of successful subscribes so far
    pub fn subscription_count(&self) -> usize {
        self.subscriptions.load(Ordering::SeqCst)
    }

    /// Make `subscribe` fail, as an unreachable receiver would
    pub fn refuse_subscribe(&self, refuse: bool) {
        self.refuse_subscribe.store(refuse, Ordering::SeqCst);
    }
}

impl SignalSource for ChannelSignalSource {
    fn subscribe(&self) -> RResult<SignalStream> {
        if self.refuse_subscribe.load(Ordering::SeqCst) {
            return Err(RecorderError::SignalSource("receiver unavailable".to_string()));
        }

        let (tx, rx) = unbounded();
        let mut current = self
            .current
            .lock()
            .map_err(|_| RecorderError::Internal("Failed to acquire signal lock".to_string()))?;
        *current = Some(tx);
        self.subscriptions.fetch_add(1, Ordering::SeqCst);
        Ok(rx.boxed())
    }

    fn unsubscribe(&self) -> RResult<()> {
        let mut current = self
            .current
            .lock()
            .map_err(|_| RecorderError::Internal("Failed to acquire signal lock".to_string()))?;
        match current.take() {
            Some(_) => Ok(()),
            None => Err(RecorderError::SignalSource("not subscribed".to_string())),
        }
    }
}

/// Periodic mock GPS fixes, optionally going silent after `dropout_after` fixes
#[derive(Clone)]
pub struct SimulatedGps {
    period: Duration,
    dropout_after: Option<u64>,
    active: Arc<AtomicBool>,
}

impl SimulatedGps {
    pub fn new(period: Duration) -> Self {
        Self {
            period,
            dropout_after: None,
            active: Arc::new(AtomicBool::new(false)),
        }
    }

    pub fn with_dropout_after(mut self, fixes: u64) -> Self {
        self.dropout_after = Some(fixes);
        self
    }
}

impl SignalSource for SimulatedGps {
    fn subscribe(&self) -> RResult<SignalStream> {
        self.active.store(true, Ordering::SeqCst);

        let limit = self.dropout_after.unwrap_or(u64::MAX);
        let active = self.active.clone();
        let ticker = sampling_ticker(self.period);
        let stream = futures::stream::unfold((ticker, 0u64), move |(mut ticker, seq)| {
            let active = active.clone();
            async move {
                if seq >= limit || !active.load(Ordering::SeqCst) {
                    log::info!("Simulated GPS stopped after {} fixes", seq);
                    return None;
                }
                ticker.tick().await;
                Some((SignalEvent::GpsFix(mock_gps_fix(seq)), (ticker, seq + 1)))
            }
        });
        Ok(stream.boxed())
    }

    fn unsubscribe(&self) -> RResult<()> {
        if self.active.swap(false, Ordering::SeqCst) {
            Ok(())
        } else {
            Err(RecorderError::SignalSource("GPS not subscribed".to_string()))
        }
    }
}

const OBD_COMMANDS: [&str; 6] = [
    "Speed",
    "RPM",
    "MAF",
    "IntakeTemperature",
    "IntakePressure",
    "EngineLoad",
];

/// OBD command looper stand-in: verifies the connection, then replies to a
/// looped command set; optionally loses the socket after `disconnect_after`
/// replies.
#[derive(Clone)]
pub struct SimulatedObd {
    connect_delay: Duration,
    period: Duration,
    disconnect_after: Option<u64>,
    active: Arc<AtomicBool>,
}

impl SimulatedObd {
    pub fn new(connect_delay: Duration, period: Duration) -> Self {
        Self {
            connect_delay,
            period,
            disconnect_after: None,
            active: Arc::new(AtomicBool::new(false)),
        }
    }

    pub fn with_disconnect_after(mut self, replies: u64) -> Self {
        self.disconnect_after = Some(replies);
        self
    }
}

impl SignalSource for SimulatedObd {
    fn subscribe(&self) -> RResult<SignalStream> {
        self.active.store(true, Ordering::SeqCst);

        let connect_delay = self.connect_delay;
        let verified = futures::stream::once(async move {
            sleep(connect_delay).await;
            SignalEvent::ConnectionVerified
        });

        let limit = self.disconnect_after;
        let active = self.active.clone();
        let ticker = sampling_ticker(self.period);
        let replies = futures::stream::unfold(
            (ticker, 0u64, false),
            move |(mut ticker, seq, lost)| {
                let active = active.clone();
                async move {
                    if lost || !active.load(Ordering::SeqCst) {
                        return None;
                    }
                    if limit.is_some_and(|n| seq >= n) {
                        let event = SignalEvent::ConnectionLost("socket closed".to_string());
                        return Some((event, (ticker, seq, true)));
                    }
                    ticker.tick().await;
                    let command = OBD_COMMANDS[(seq as usize) % OBD_COMMANDS.len()];
                    let event = SignalEvent::CommandReply {
                        command: command.to_string(),
                        timestamp: current_timestamp(),
                    };
                    Some((event, (ticker, seq + 1, false)))
                }
            },
        );

        Ok(verified.chain(replies).boxed())
    }

    fn unsubscribe(&self) -> RResult<()> {
        if self.active.swap(false, Ordering::SeqCst) {
            Ok(())
        } else {
            Err(RecorderError::SignalSource("OBD looper not running".to_string()))
        }
    }
}

/// Synthetic drive: speed oscillates between 20 and 80 km/h along a straight
/// line. With `obd` set, engine properties are included as well.
#[derive(Clone)]
pub struct SimulatedMeasurements {
    obd: bool,
}

impl SimulatedMeasurements {
    pub fn gps_only() -> Self {
        Self { obd: false }
    }

    pub fn with_obd() -> Self {
        Self { obd: true }
    }
}

impl MeasurementSource for SimulatedMeasurements {
    fn measurements(&self, sampling_interval: Duration) -> MeasurementStream {
        let obd = self.obd;
        let ticker = sampling_ticker(sampling_interval);
        futures::stream::unfold((ticker, 0u64), move |(mut ticker, seq)| async move {
            ticker.tick().await;
            Some((mock_measurement(seq, obd), (ticker, seq + 1)))
        })
        .boxed()
    }
}

/// `interval` panics on a zero period
fn sampling_ticker(period: Duration) -> Interval {
    interval(period.max(Duration::from_millis(1)))
}

fn mock_measurement(seq: u64, obd: bool) -> Measurement {
    let fix = mock_gps_fix(seq);
    let mut m = Measurement::new(fix.timestamp)
        .with_position(fix.latitude, fix.longitude)
        .with_property(PropertyKey::GpsSpeed, fix.speed)
        .with_property(PropertyKey::GpsAccuracy, fix.accuracy);

    if obd {
        let t = seq as f64;
        m = m
            .with_property(PropertyKey::Speed, fix.speed)
            .with_property(PropertyKey::Rpm, 1500.0 + fix.speed * 20.0)
            .with_property(PropertyKey::Maf, 5.0 + fix.speed * 0.2)
            .with_property(PropertyKey::IntakeTemperature, 30.0 + (t * 0.01).sin())
            .with_property(PropertyKey::EngineLoad, 25.0 + (t * 0.2).sin() * 10.0);
    }
    m
}

fn mock_gps_fix(seq: u64) -> GpsFix {
    let t = seq as f64;
    GpsFix {
        timestamp: current_timestamp(),
        latitude: 51.9607 + t * 0.00005,
        longitude: 7.6261 + t * 0.00005,
        accuracy: 5.0 + (t * 0.1).sin() * 2.0,
        speed: 50.0 + (t * 2.0 * PI / 60.0).sin() * 30.0,
    }
}

fn current_timestamp() -> f64 {
    use std::time::{SystemTime, UNIX_EPOCH};
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .unwrap_or_default()
        .as_secs_f64()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_channel_source_restarts_after_unsubscribe() {
        let source = ChannelSignalSource::new();
        assert!(!source.emit(SignalEvent::ConnectionVerified));

        let mut first = source.subscribe().unwrap();
        assert!(source.emit(SignalEvent::ConnectionVerified));
        assert_eq!(first.next().await, Some(SignalEvent::ConnectionVerified));

        source.unsubscribe().unwrap();
        assert_eq!(first.next().await, None);
        assert!(source.unsubscribe().is_err());

        let mut second = source.subscribe().unwrap();
        assert!(source.emit(SignalEvent::AllAdaptersFailed));
        assert_eq!(second.next().await, Some(SignalEvent::AllAdaptersFailed));
        assert_eq!(source.subscription_count(), 2);
    }

    #[tokio::test(start_paused = true)]
    async fn test_gps_dropout() {
        let gps = SimulatedGps::new(Duration::from_secs(1)).with_dropout_after(3);
        let fixes: Vec<SignalEvent> = gps.subscribe().unwrap().collect().await;
        assert_eq!(fixes.len(), 3);
        assert!(fixes.iter().all(|e| matches!(e, SignalEvent::GpsFix(_))));
    }

    #[tokio::test(start_paused = true)]
    async fn test_obd_verifies_then_replies() {
        let obd = SimulatedObd::new(Duration::from_secs(2), Duration::from_millis(500))
            .with_disconnect_after(4);
        let events: Vec<SignalEvent> = obd.subscribe().unwrap().collect().await;

        assert_eq!(events.first(), Some(&SignalEvent::ConnectionVerified));
        assert!(matches!(events.last(), Some(SignalEvent::ConnectionLost(_))));
        assert_eq!(events.len(), 6);
    }

    #[tokio::test(start_paused = true)]
    async fn test_measurements_carry_speed() {
        let source = SimulatedMeasurements::with_obd();
        let batch: Vec<Measurement> = source
            .measurements(Duration::from_millis(100))
            .take(5)
            .collect()
            .await;

        assert_eq!(batch.len(), 5);
        assert!(batch.iter().all(|m| m.speed_kmh().is_some() && m.has_position()));
        assert!(batch.iter().all(|m| m.has_property(PropertyKey::Rpm)));
    }

    #[tokio::test(start_paused = true)]
    async fn test_zero_interval_does_not_panic() {
        let batch: Vec<Measurement> = SimulatedMeasurements::gps_only()
            .measurements(Duration::ZERO)
            .take(3)
            .collect()
            .await;
        assert_eq!(batch.len(), 3);

        let fixes: Vec<SignalEvent> = SimulatedGps::new(Duration::ZERO)
            .with_dropout_after(2)
            .subscribe()
            .unwrap()
            .collect()
            .await;
        assert_eq!(fixes.len(), 2);
    }
}
