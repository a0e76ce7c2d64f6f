use crate::error::{RResult, RecorderError};
use crate::storage::Track;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

/// Session state machine states
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum SessionState {
    /// Created, waiting for the source to acknowledge start
    Init,
    /// Measurements flowing
    Running,
    /// Terminal; resources released
    Stopped,
}

/// Why a session ended
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum StopReason {
    /// `stop_recording` from the host
    Requested,
    /// Host lifecycle teardown
    Shutdown,
    /// Pending termination fired after a stale link
    LinkLost,
    /// Trim timer fired after driving stopped
    DrivingEnded,
    /// The measurement source ran dry
    SourceCompleted,
    /// The signal source failed or was lost
    UpstreamFailed,
}

/// Serializable snapshot of a session
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SessionMetadata {
    pub session_id: String,
    pub start_time: DateTime<Utc>,
    pub state: SessionState,
    pub driving_detected: bool,
    pub measurement_count: u64,
    pub track_id: Option<String>,
    pub stop_reason: Option<StopReason>,
}

/// One recording attempt.
///
/// Owned by a single session driver; every mutation goes through the
/// transition methods below.
#[derive(Debug)]
pub struct Session {
    id: String,
    state: SessionState,
    starting_time: DateTime<Utc>,
    track: Option<Track>,
    track_finished: bool,
    driving_detected: bool,
    measurement_count: u64,
    stop_reason: Option<StopReason>,
}

impl Session {
    /// Create new session in Init state
    pub fn new() -> Self {
        let now = Utc::now();
        Session {
            id: format!("session_{}", now.timestamp_millis()),
            state: SessionState::Init,
            starting_time: now,
            track: None,
            track_finished: false,
            driving_detected: false,
            measurement_count: 0,
            stop_reason: None,
        }
    }

    pub fn id(&self) -> &str {
        &self.id
    }

    pub fn state(&self) -> SessionState {
        self.state
    }

    pub fn starting_time(&self) -> DateTime<Utc> {
        self.starting_time
    }

    /// Guard for late callbacks: false once Stopped
    pub fn is_active(&self) -> bool {
        self.state != SessionState::Stopped
    }

    pub fn is_running(&self) -> bool {
        self.state == SessionState::Running
    }

    pub fn driving_detected(&self) -> bool {
        self.driving_detected
    }

    pub fn track(&self) -> Option<&Track> {
        self.track.as_ref()
    }

    pub fn stop_reason(&self) -> Option<StopReason> {
        self.stop_reason
    }

    /// Transition to Running (Init → Running)
    pub fn start(&mut self) -> RResult<()> {
        match self.state {
            SessionState::Init => {
                self.state = SessionState::Running;
                Ok(())
            }
            SessionState::Running => Err(RecorderError::AlreadyRunning),
            SessionState::Stopped => Err(RecorderError::InvalidState(
                "Session already stopped".to_string(),
            )),
        }
    }

    /// Take ownership of the track started by the sink. The first handle wins.
    pub fn attach_track(&mut self, track: Track) -> RResult<()> {
        if !self.is_active() {
            return Err(RecorderError::NotRunning);
        }
        if let Some(existing) = &self.track {
            return Err(RecorderError::InvalidState(format!(
                "Track {} already attached",
                existing.id
            )));
        }
        self.track = Some(track);
        Ok(())
    }

    pub fn record_measurement(&mut self) -> RResult<()> {
        if !self.is_active() {
            return Err(RecorderError::NotRunning);
        }
        self.measurement_count += 1;
        Ok(())
    }

    /// Activity recognition saw the vehicle activity begin
    pub fn enter_driving(&mut self) -> RResult<()> {
        match self.state {
            SessionState::Running => {
                self.driving_detected = true;
                Ok(())
            }
            SessionState::Init => Err(RecorderError::InvalidState("Not running yet".to_string())),
            SessionState::Stopped => Err(RecorderError::NotRunning),
        }
    }

    /// Activity recognition saw the vehicle activity end
    pub fn exit_driving(&mut self) -> RResult<()> {
        if !self.is_running() {
            return Err(RecorderError::NotRunning);
        }
        self.driving_detected = false;
        Ok(())
    }

    /// Transition to Stopped. Returns false if already stopped, so only the
    /// first caller runs the teardown.
    pub fn stop(&mut self, reason: StopReason) -> bool {
        match self.state {
            SessionState::Init | SessionState::Running => {
                self.state = SessionState::Stopped;
                self.driving_detected = false;
                self.stop_reason = Some(reason);
                true
            }
            SessionState::Stopped => false,
        }
    }

    /// Hand off the finished track. Yields it at most once, and only after stop.
    pub fn finish_track(&mut self) -> Option<Track> {
        if self.state != SessionState::Stopped || self.track_finished {
            return None;
        }
        let track = self.track.clone()?;
        self.track_finished = true;
        Some(track)
    }

    /// Get metadata snapshot
    pub fn metadata(&self) -> SessionMetadata {
        SessionMetadata {
            session_id: self.id.clone(),
            start_time: self.starting_time,
            state: self.state,
            driving_detected: self.driving_detected,
            measurement_count: self.measurement_count,
            track_id: self.track.as_ref().map(|t| t.id.clone()),
            stop_reason: self.stop_reason,
        }
    }
}

impl Default for Session {
    fn default() -> Self {
        Self::new()
    }
}
