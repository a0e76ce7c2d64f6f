use super::{LinkSignal, Recorder, SignalPolicy};
use crate::event_bus::BusEvent;
use crate::settings::RecorderSettings;
use crate::sources::SignalEvent;
use std::time::Duration;

/// Records while the OBD adapter answers the command loop. The session only
/// runs once the connection is verified.
pub type ObdRecordingStrategy = Recorder<ObdPolicy>;

#[derive(Debug, Clone, Copy, Default)]
pub struct ObdPolicy;

impl SignalPolicy for ObdPolicy {
    fn name(&self) -> &'static str {
        "OBD"
    }

    fn acknowledges_on_subscribe(&self) -> bool {
        false
    }

    fn classify(&self, event: &SignalEvent) -> LinkSignal {
        match event {
            SignalEvent::CommandReply { .. } => LinkSignal::Liveness,
            SignalEvent::ConnectionVerified => LinkSignal::Acknowledged,
            SignalEvent::ConnectionLost(reason) => LinkSignal::Terminal {
                reason: format!("connection lost: {}", reason),
                permanently_failed: false,
            },
            SignalEvent::AllAdaptersFailed => LinkSignal::Terminal {
                reason: "all adapters failed".to_string(),
                permanently_failed: true,
            },
            SignalEvent::Fatal(reason) => LinkSignal::Terminal {
                reason: reason.clone(),
                permanently_failed: false,
            },
            SignalEvent::GpsFix(_) | SignalEvent::ActivityTransition(_) => LinkSignal::Ignored,
        }
    }

    fn stale_after(&self, settings: &RecorderSettings) -> Duration {
        settings.obd_reply_timeout()
    }

    fn degraded_event(&self, settings: &RecorderSettings) -> BusEvent {
        BusEvent::ObdConnectionStale {
            timeout_secs: settings.obd_reply_timeout_secs,
        }
    }
}
