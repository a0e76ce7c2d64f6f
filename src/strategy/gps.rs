use super::{LinkSignal, Recorder, SignalPolicy};
use crate::event_bus::BusEvent;
use crate::settings::RecorderSettings;
use crate::sources::{ActivityTransition, SignalEvent};
use std::time::Duration;

/// Records while GPS fixes keep arriving; activity recognition decides when
/// the drive is over.
pub type GpsRecordingStrategy = Recorder<GpsPolicy>;

#[derive(Debug, Clone, Copy, Default)]
pub struct GpsPolicy;

impl SignalPolicy for GpsPolicy {
    fn name(&self) -> &'static str {
        "GPS"
    }

    fn acknowledges_on_subscribe(&self) -> bool {
        true
    }

    fn classify(&self, event: &SignalEvent) -> LinkSignal {
        match event {
            SignalEvent::GpsFix(_) => LinkSignal::Liveness,
            SignalEvent::ActivityTransition(ActivityTransition::Enter) => LinkSignal::DrivingEnter,
            SignalEvent::ActivityTransition(ActivityTransition::Exit) => LinkSignal::DrivingExit,
            SignalEvent::Fatal(reason) => LinkSignal::Terminal {
                reason: reason.clone(),
                permanently_failed: false,
            },
            _ => LinkSignal::Ignored,
        }
    }

    fn stale_after(&self, settings: &RecorderSettings) -> Duration {
        settings.gps_connection_duration()
    }

    fn degraded_event(&self, settings: &RecorderSettings) -> BusEvent {
        BusEvent::GpsNotChanged {
            connection_duration_secs: settings.gps_connection_duration_secs,
        }
    }
}
