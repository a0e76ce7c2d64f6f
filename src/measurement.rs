use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;

/// Keys of the measurement property bag
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum PropertyKey {
    /// Vehicle speed from OBD, km/h
    Speed,
    Rpm,
    /// Mass air flow, g/s
    Maf,
    IntakeTemperature,
    IntakePressure,
    EngineLoad,
    /// Ground speed from GPS, km/h
    GpsSpeed,
    GpsAccuracy,
    GpsAltitude,
    GpsBearing,
    /// Derived, l/h
    EnergyConsumption,
    /// Derived, kg/h
    EnergyConsumptionCo2,
}

/// One sample of the trip, raw from the source or enriched by the pipeline
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Measurement {
    /// Seconds since the unix epoch
    pub timestamp: f64,
    pub latitude: Option<f64>,
    pub longitude: Option<f64>,
    properties: BTreeMap<PropertyKey, f64>,
}

impl Measurement {
    pub fn new(timestamp: f64) -> Self {
        Self {
            timestamp,
            latitude: None,
            longitude: None,
            properties: BTreeMap::new(),
        }
    }

    pub fn with_position(mut self, latitude: f64, longitude: f64) -> Self {
        self.latitude = Some(latitude);
        self.longitude = Some(longitude);
        self
    }

    pub fn with_property(mut self, key: PropertyKey, value: f64) -> Self {
        self.properties.insert(key, value);
        self
    }

    pub fn property(&self, key: PropertyKey) -> Option<f64> {
        self.properties.get(&key).copied()
    }

    pub fn has_property(&self, key: PropertyKey) -> bool {
        self.properties.contains_key(&key)
    }

    pub fn properties(&self) -> impl Iterator<Item = (PropertyKey, f64)> + '_ {
        self.properties.iter().map(|(k, v)| (*k, *v))
    }

    /// Best available speed in km/h, OBD first, GPS second
    pub fn speed_kmh(&self) -> Option<f64> {
        self.property(PropertyKey::Speed)
            .or_else(|| self.property(PropertyKey::GpsSpeed))
    }

    pub fn has_position(&self) -> bool {
        self.latitude.is_some() && self.longitude.is_some()
    }
}
