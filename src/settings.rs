use crate::error::{RResult, RecorderError};
use serde::{Deserialize, Serialize};
use std::path::Path;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::watch;

/// Recording preferences consumed by the strategies.
///
/// Every field has a default, so a settings file only needs the keys it
/// overrides.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct RecorderSettings {
    /// Interval between two measurements requested from the source
    pub sampling_rate_ms: u64,
    /// Grace period after "driving stopped" before the session ends
    pub track_trim_duration_secs: u64,
    /// GPS silence tolerated before the link is reported as degraded
    pub gps_connection_duration_secs: u64,
    /// Time left after the degraded notification before the session ends
    pub pending_termination_secs: u64,
    /// OBD reply silence tolerated before the link is reported as degraded
    pub obd_reply_timeout_secs: u64,
}

impl Default for RecorderSettings {
    fn default() -> Self {
        Self {
            sampling_rate_ms: 1000,
            track_trim_duration_secs: 55 * 2,
            gps_connection_duration_secs: 60 * 2,
            pending_termination_secs: 30,
            obd_reply_timeout_secs: 30,
        }
    }
}

impl RecorderSettings {
    /// Parse settings from a JSON document and validate them
    pub fn from_json_str(json: &str) -> RResult<Self> {
        let settings: RecorderSettings =
            serde_json::from_str(json).map_err(|e| RecorderError::Settings(e.to_string()))?;
        settings.validate()?;
        Ok(settings)
    }

    /// Load settings from a JSON file
    pub fn load(path: impl AsRef<Path>) -> RResult<Self> {
        let path = path.as_ref();
        let json = std::fs::read_to_string(path).map_err(|e| {
            RecorderError::Settings(format!("cannot read {}: {}", path.display(), e))
        })?;
        Self::from_json_str(&json)
    }

    /// Reject zero durations; a zero timer would fire immediately on every arm.
    pub fn validate(&self) -> RResult<()> {
        let fields = [
            ("sampling_rate_ms", self.sampling_rate_ms),
            ("track_trim_duration_secs", self.track_trim_duration_secs),
            ("gps_connection_duration_secs", self.gps_connection_duration_secs),
            ("pending_termination_secs", self.pending_termination_secs),
            ("obd_reply_timeout_secs", self.obd_reply_timeout_secs),
        ];

        for (name, value) in fields {
            if value == 0 {
                return Err(RecorderError::Settings(format!(
                    "{} must be greater than zero",
                    name
                )));
            }
        }

        for warning in self.warnings() {
            log::warn!("{}", warning);
        }
        Ok(())
    }

    /// Accepted but suspicious combinations
    pub fn warnings(&self) -> Vec<String> {
        let mut warnings = Vec::new();
        if self.pending_termination_secs > self.gps_connection_duration_secs {
            warnings.push(format!(
                "pending_termination_secs ({}) exceeds gps_connection_duration_secs ({})",
                self.pending_termination_secs, self.gps_connection_duration_secs
            ));
        }
        if self.pending_termination_secs > self.obd_reply_timeout_secs {
            warnings.push(format!(
                "pending_termination_secs ({}) exceeds obd_reply_timeout_secs ({})",
                self.pending_termination_secs, self.obd_reply_timeout_secs
            ));
        }
        warnings
    }

    pub fn sampling_interval(&self) -> Duration {
        Duration::from_millis(self.sampling_rate_ms)
    }

    pub fn track_trim_duration(&self) -> Duration {
        Duration::from_secs(self.track_trim_duration_secs)
    }

    pub fn gps_connection_duration(&self) -> Duration {
        Duration::from_secs(self.gps_connection_duration_secs)
    }

    pub fn pending_termination(&self) -> Duration {
        Duration::from_secs(self.pending_termination_secs)
    }

    pub fn obd_reply_timeout(&self) -> Duration {
        Duration::from_secs(self.obd_reply_timeout_secs)
    }
}

/// Live, read-mostly settings shared between the host and running sessions.
///
/// Sessions only ever hold a receiver; a change is picked up by timers armed
/// after it, never by one already counting down.
#[derive(Clone)]
pub struct SettingsSource {
    tx: Arc<watch::Sender<RecorderSettings>>,
}

impl SettingsSource {
    /// Fails on settings `validate` rejects
    pub fn new(initial: RecorderSettings) -> RResult<Self> {
        initial.validate()?;
        Ok(Self::from_valid(initial))
    }

    fn from_valid(initial: RecorderSettings) -> Self {
        let (tx, _rx) = watch::channel(initial);
        Self { tx: Arc::new(tx) }
    }

    /// Current snapshot
    pub fn current(&self) -> RecorderSettings {
        *self.tx.borrow()
    }

    /// Receiver that observes every later change
    pub fn subscribe(&self) -> watch::Receiver<RecorderSettings> {
        self.tx.subscribe()
    }

    /// Apply a change; invalid results are rejected and the old value kept.
    pub fn update<F>(&self, change: F) -> RResult<RecorderSettings>
    where
        F: FnOnce(&mut RecorderSettings),
    {
        let mut next = self.current();
        change(&mut next);
        next.validate()?;
        self.tx.send_replace(next);
        log::info!("Settings updated: {:?}", next);
        Ok(next)
    }

    pub fn set_track_trim_duration_secs(&self, secs: u64) -> RResult<RecorderSettings> {
        self.update(|s| s.track_trim_duration_secs = secs)
    }

    pub fn set_gps_connection_duration_secs(&self, secs: u64) -> RResult<RecorderSettings> {
        self.update(|s| s.gps_connection_duration_secs = secs)
    }

    pub fn set_sampling_rate_ms(&self, millis: u64) -> RResult<RecorderSettings> {
        self.update(|s| s.sampling_rate_ms = millis)
    }
}

impl Default for SettingsSource {
    fn default() -> Self {
        Self::from_valid(RecorderSettings::default())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_defaults_match_recording_preferences() {
        let settings = RecorderSettings::default();
        assert_eq!(settings.track_trim_duration_secs, 110);
        assert_eq!(settings.gps_connection_duration_secs, 120);
        assert_eq!(settings.pending_termination(), Duration::from_secs(30));
        assert!(settings.validate().is_ok());
    }

    #[test]
    fn test_partial_json_keeps_defaults() {
        let settings = RecorderSettings::from_json_str(r#"{"track_trim_duration_secs": 45}"#)
            .unwrap();
        assert_eq!(settings.track_trim_duration_secs, 45);
        assert_eq!(settings.sampling_rate_ms, 1000);
    }

    #[test]
    fn test_zero_duration_rejected() {
        let err = RecorderSettings::from_json_str(r#"{"sampling_rate_ms": 0}"#).unwrap_err();
        assert!(matches!(err, RecorderError::Settings(_)));
    }

    #[test]
    fn test_update_is_observed_by_subscribers() {
        let source = SettingsSource::default();
        let rx = source.subscribe();

        source.set_track_trim_duration_secs(10).unwrap();
        assert_eq!(rx.borrow().track_trim_duration_secs, 10);

        // invalid change leaves the previous value in place
        assert!(source.set_gps_connection_duration_secs(0).is_err());
        assert_eq!(source.current().gps_connection_duration_secs, 120);
    }

    #[test]
    fn test_source_rejects_invalid_initial_settings() {
        let zero_sampling = RecorderSettings {
            sampling_rate_ms: 0,
            ..RecorderSettings::default()
        };
        assert!(matches!(
            SettingsSource::new(zero_sampling),
            Err(RecorderError::Settings(_))
        ));

        let source = SettingsSource::new(RecorderSettings::default()).unwrap();
        assert_eq!(source.current(), RecorderSettings::default());
    }

    #[test]
    fn test_longer_pending_termination_warns() {
        assert!(RecorderSettings::default().warnings().is_empty());

        // equal windows are fine
        let equal = RecorderSettings {
            gps_connection_duration_secs: 30,
            pending_termination_secs: 30,
            ..RecorderSettings::default()
        };
        assert!(equal.warnings().is_empty());

        let inverted = RecorderSettings {
            gps_connection_duration_secs: 20,
            pending_termination_secs: 60,
            obd_reply_timeout_secs: 90,
            ..RecorderSettings::default()
        };
        let warnings = inverted.warnings();
        assert_eq!(warnings.len(), 1);
        assert!(warnings[0].contains("gps_connection_duration_secs"));
        assert!(inverted.validate().is_ok());
    }
}
