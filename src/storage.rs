use crate::measurement::{Measurement, PropertyKey};
use crate::session::SessionMetadata;
use crate::sources::{SinkError, TrackSink, TrackWriter};
use chrono::{DateTime, TimeZone, Utc};
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};

/// Handle of a stored track
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Track {
    pub id: String,
    pub name: String,
    pub session_id: String,
    pub started_at: DateTime<Utc>,
}

impl Track {
    pub fn new(id: &str, session_id: &str, started_at: DateTime<Utc>) -> Self {
        Self {
            id: id.to_string(),
            name: format!("Track {}", started_at.format("%Y-%m-%d %H:%M")),
            session_id: session_id.to_string(),
            started_at,
        }
    }
}

#[derive(Default)]
struct StoredTracks {
    next_id: u64,
    tracks: HashMap<String, (Track, Vec<Measurement>)>,
}

/// Keeps every track and its measurements in memory.
///
/// Clones share the same storage.
#[derive(Clone, Default)]
pub struct MemoryTrackSink {
    stored: Arc<Mutex<StoredTracks>>,
    fail_writes: Arc<AtomicBool>,
}

impl MemoryTrackSink {
    pub fn new() -> Self {
        Self::default()
    }

    /// Make every following write fail until switched off again
    pub fn fail_writes(&self, fail: bool) {
        self.fail_writes.store(fail, Ordering::SeqCst);
    }

    pub fn track_count(&self) -> usize {
        self.stored.lock().map(|s| s.tracks.len()).unwrap_or(0)
    }

    pub fn measurements(&self, track_id: &str) -> Vec<Measurement> {
        self.stored
            .lock()
            .ok()
            .and_then(|s| s.tracks.get(track_id).map(|(_, m)| m.clone()))
            .unwrap_or_default()
    }

    /// Export a stored track with its measurements
    pub fn export(&self, track_id: &str) -> Option<TrackExport> {
        let stored = self.stored.lock().ok()?;
        let (track, measurements) = stored.tracks.get(track_id)?;
        Some(TrackExport {
            track: track.clone(),
            measurements: measurements.clone(),
        })
    }
}

impl TrackSink for MemoryTrackSink {
    fn storage(&self, session: &SessionMetadata) -> Box<dyn TrackWriter> {
        Box::new(MemoryTrackWriter {
            sink: self.clone(),
            session_id: session.session_id.clone(),
            started_at: session.start_time,
            track_id: None,
        })
    }
}

struct MemoryTrackWriter {
    sink: MemoryTrackSink,
    session_id: String,
    started_at: DateTime<Utc>,
    track_id: Option<String>,
}

impl TrackWriter for MemoryTrackWriter {
    fn write(&mut self, measurement: &Measurement) -> Result<Option<Track>, SinkError> {
        if self.sink.fail_writes.load(Ordering::SeqCst) {
            return Err(SinkError::WriteFailed("storage rejected the write".to_string()));
        }

        let mut stored = self
            .sink
            .stored
            .lock()
            .map_err(|_| SinkError::WriteFailed("Failed to acquire track store lock".to_string()))?;

        if let Some(id) = &self.track_id {
            let (_, measurements) = stored.tracks.get_mut(id).ok_or(SinkError::Closed)?;
            measurements.push(measurement.clone());
            return Ok(None);
        }

        stored.next_id += 1;
        let id = format!("track_{}", stored.next_id);
        let track = Track::new(&id, &self.session_id, self.started_at);
        stored
            .tracks
            .insert(id.clone(), (track.clone(), vec![measurement.clone()]));
        self.track_id = Some(id);
        Ok(Some(track))
    }
}

/// Complete track export (JSON-serializable)
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TrackExport {
    pub track: Track,
    pub measurements: Vec<Measurement>,
}

impl TrackExport {
    /// Serialize to JSON string
    pub fn to_json(&self) -> Result<String, serde_json::Error> {
        serde_json::to_string_pretty(self)
    }

    pub fn stats(&self) -> TrackStats {
        TrackStats::from_measurements(&self.measurements)
    }
}

/// Track statistics for display
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TrackStats {
    pub duration_seconds: f64,
    pub measurement_count: usize,
    pub peak_speed_kmh: f64,
    /// Integrated consumption, litres
    pub fuel_litres: f64,
    /// Integrated emission, kg
    pub co2_kg: f64,
}

impl TrackStats {
    pub fn from_measurements(measurements: &[Measurement]) -> Self {
        let duration_seconds = match (measurements.first(), measurements.last()) {
            (Some(first), Some(last)) => (last.timestamp - first.timestamp).max(0.0),
            _ => 0.0,
        };

        let peak_speed_kmh = measurements
            .iter()
            .filter_map(|m| m.speed_kmh())
            .fold(0.0, f64::max);

        // rectangle rule over the gap to the next sample, values are per hour
        let mut fuel_litres = 0.0;
        let mut co2_kg = 0.0;
        for pair in measurements.windows(2) {
            let hours = (pair[1].timestamp - pair[0].timestamp).max(0.0) / 3600.0;
            fuel_litres += pair[0].property(PropertyKey::EnergyConsumption).unwrap_or(0.0) * hours;
            co2_kg += pair[0].property(PropertyKey::EnergyConsumptionCo2).unwrap_or(0.0) * hours;
        }

        TrackStats {
            duration_seconds,
            measurement_count: measurements.len(),
            peak_speed_kmh,
            fuel_litres,
            co2_kg,
        }
    }
}

/// GPX track format for mapping applications
#[derive(Debug, Serialize)]
pub struct GpxTrack {
    pub name: String,
    pub description: String,
    pub track_points: Vec<GpxPoint>,
}

#[derive(Debug, Serialize)]
pub struct GpxPoint {
    pub lat: f64,
    pub lon: f64,
    pub ele: Option<f64>,
    pub time: String,
}

impl GpxTrack {
    /// Generate GPX document XML string
    pub fn to_gpx_xml(&self) -> String {
        let mut xml = String::new();
        xml.push_str("<?xml version=\"1.0\" encoding=\"UTF-8\"?>\n");
        xml.push_str("<gpx version=\"1.1\" creator=\"TripRecorder\">\n");
        xml.push_str("  <metadata>\n");
        xml.push_str(&format!("    <name>{}</name>\n", xml_escape(&self.name)));
        xml.push_str(&format!("    <desc>{}</desc>\n", xml_escape(&self.description)));
        xml.push_str("  </metadata>\n");
        xml.push_str("  <trk>\n");
        xml.push_str(&format!("    <name>{}</name>\n", xml_escape(&self.name)));
        xml.push_str("    <trkseg>\n");

        for point in &self.track_points {
            xml.push_str(&format!("      <trkpt lat=\"{}\" lon=\"{}\">\n", point.lat, point.lon));
            if let Some(ele) = point.ele {
                xml.push_str(&format!("        <ele>{}</ele>\n", ele));
            }
            xml.push_str(&format!("        <time>{}</time>\n", point.time));
            xml.push_str("      </trkpt>\n");
        }

        xml.push_str("    </trkseg>\n");
        xml.push_str("  </trk>\n");
        xml.push_str("</gpx>\n");

        xml
    }
}

/// Create GPX track from the positioned measurements of a track
pub fn create_gpx_track(track: &Track, measurements: &[Measurement]) -> GpxTrack {
    let track_points = measurements
        .iter()
        .filter_map(|m| {
            let (lat, lon) = (m.latitude?, m.longitude?);
            let millis = (m.timestamp * 1000.0) as i64;
            let time = Utc
                .timestamp_millis_opt(millis)
                .single()
                .map(|t| t.to_rfc3339())
                .unwrap_or_default();

            Some(GpxPoint {
                lat,
                lon,
                ele: m.property(PropertyKey::GpsAltitude),
                time,
            })
        })
        .collect();

    GpxTrack {
        name: track.name.clone(),
        description: format!("Recorded from {}", track.started_at.to_rfc3339()),
        track_points,
    }
}

fn xml_escape(text: &str) -> String {
    text.replace('&', "&amp;")
        .replace('<', "&lt;")
        .replace('>', "&gt;")
        .replace('"', "&quot;")
}
