//! Load-based energy consumption estimate
//! Derives tractive power from speed and acceleration, then converts it into
//! fuel flow (l/h) and CO2 emission (kg/h) for the configured fuel type.
use crate::measurement::{Measurement, PropertyKey};
use serde::{Deserialize, Serialize};
use thiserror::Error;

const GRAVITY: f64 = 9.81; // m/s²
const SECONDS_PER_HOUR: f64 = 3600.0;

#[derive(Error, Debug, Clone, PartialEq)]
pub enum ConsumptionError {
    #[error("Missing property: {0:?}")]
    MissingProperty(PropertyKey),

    #[error("Invalid value for {key:?}: {value}")]
    InvalidValue { key: PropertyKey, value: f64 },

    #[error("Unsupported fuel type: {0:?}")]
    UnsupportedFuel(FuelType),
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum FuelType {
    Gasoline,
    Diesel,
    Electric,
}

impl FuelType {
    /// kg CO2 per litre burned
    fn co2_factor(self) -> Option<f64> {
        match self {
            FuelType::Gasoline => Some(2.35),
            FuelType::Diesel => Some(2.65),
            FuelType::Electric => None,
        }
    }

    /// Usable energy per litre, J/l
    fn energy_density(self) -> Option<f64> {
        match self {
            FuelType::Gasoline => Some(32.0e6),
            FuelType::Diesel => Some(35.8e6),
            FuelType::Electric => None,
        }
    }

    fn engine_efficiency(self) -> f64 {
        match self {
            FuelType::Gasoline => 0.25,
            FuelType::Diesel => 0.30,
            FuelType::Electric => 0.90,
        }
    }

    /// Fuel flow with the engine idling, l/h
    fn idle_rate(self) -> f64 {
        match self {
            FuelType::Gasoline => 0.8,
            FuelType::Diesel => 0.6,
            FuelType::Electric => 0.0,
        }
    }
}

/// Per-session consumption calculator.
///
/// Implementations may keep state between measurements, so a fresh instance is
/// created for every session.
pub trait ConsumptionAlgorithm: Send {
    /// Fuel consumption in l/h for this measurement
    fn calculate_consumption(&mut self, measurement: &Measurement) -> Result<f64, ConsumptionError>;

    /// CO2 emission in kg/h for a consumption in l/h
    fn calculate_co2_from_consumption(&self, consumption: f64) -> Result<f64, ConsumptionError>;
}

#[derive(Debug, Clone, Copy)]
pub struct VehicleParameters {
    pub mass_kg: f64,
    pub rolling_resistance: f64,
    /// Drag coefficient times frontal area, m²
    pub drag_area: f64,
    pub air_density: f64,
}

impl Default for VehicleParameters {
    fn default() -> Self {
        Self {
            mass_kg: 1500.0,
            rolling_resistance: 0.015,
            drag_area: 0.7,
            air_density: 1.2,
        }
    }
}

pub struct LoadBasedConsumption {
    fuel_type: FuelType,
    vehicle: VehicleParameters,
    // (timestamp, speed m/s) of the previous measurement
    previous: Option<(f64, f64)>,
}

impl LoadBasedConsumption {
    pub fn new(fuel_type: FuelType) -> Self {
        Self::with_vehicle(fuel_type, VehicleParameters::default())
    }

    pub fn with_vehicle(fuel_type: FuelType, vehicle: VehicleParameters) -> Self {
        Self {
            fuel_type,
            vehicle,
            previous: None,
        }
    }

    pub fn fuel_type(&self) -> FuelType {
        self.fuel_type
    }

    /// Tractive power in watts: (rolling + drag + inertia) × v, never negative
    fn tractive_power(&self, speed_ms: f64, accel_ms2: f64) -> f64 {
        let v = &self.vehicle;
        let rolling = v.mass_kg * GRAVITY * v.rolling_resistance;
        let drag = 0.5 * v.air_density * v.drag_area * speed_ms * speed_ms;
        let inertia = v.mass_kg * accel_ms2;
        ((rolling + drag + inertia) * speed_ms).max(0.0)
    }
}

impl ConsumptionAlgorithm for LoadBasedConsumption {
    fn calculate_consumption(
        &mut self,
        measurement: &Measurement,
    ) -> Result<f64, ConsumptionError> {
        let energy_density = self
            .fuel_type
            .energy_density()
            .ok_or(ConsumptionError::UnsupportedFuel(self.fuel_type))?;

        let speed_kmh = measurement
            .speed_kmh()
            .ok_or(ConsumptionError::MissingProperty(PropertyKey::Speed))?;
        if !speed_kmh.is_finite() || speed_kmh < 0.0 {
            return Err(ConsumptionError::InvalidValue {
                key: PropertyKey::Speed,
                value: speed_kmh,
            });
        }
        let speed_ms = speed_kmh / 3.6;

        let accel_ms2 = match self.previous {
            Some((t0, v0)) if measurement.timestamp > t0 => {
                (speed_ms - v0) / (measurement.timestamp - t0)
            }
            _ => 0.0,
        };
        self.previous = Some((measurement.timestamp, speed_ms));

        let power = self.tractive_power(speed_ms, accel_ms2);
        let fuel_power = power / self.fuel_type.engine_efficiency();
        let litres_per_hour = fuel_power / energy_density * SECONDS_PER_HOUR;

        Ok(litres_per_hour + self.fuel_type.idle_rate())
    }

    fn calculate_co2_from_consumption(&self, consumption: f64) -> Result<f64, ConsumptionError> {
        if !consumption.is_finite() || consumption < 0.0 {
            return Err(ConsumptionError::InvalidValue {
                key: PropertyKey::EnergyConsumption,
                value: consumption,
            });
        }
        let factor = self
            .fuel_type
            .co2_factor()
            .ok_or(ConsumptionError::UnsupportedFuel(self.fuel_type))?;
        Ok(consumption * factor)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use approx::assert_relative_eq;

    fn at_speed(timestamp: f64, kmh: f64) -> Measurement {
        Measurement::new(timestamp).with_property(PropertyKey::Speed, kmh)
    }

    #[test]
    fn test_standstill_is_idle_rate() {
        let mut algo = LoadBasedConsumption::new(FuelType::Gasoline);
        let consumption = algo.calculate_consumption(&at_speed(0.0, 0.0)).unwrap();
        assert_relative_eq!(consumption, 0.8);
    }

    #[test]
    fn test_constant_speed_gasoline() {
        let mut algo = LoadBasedConsumption::new(FuelType::Gasoline);
        // 72 km/h = 20 m/s, no acceleration
        let consumption = algo.calculate_consumption(&at_speed(0.0, 72.0)).unwrap();

        // rolling 220.725 N + drag 168 N, times 20 m/s
        let power = (1500.0 * 9.81 * 0.015 + 0.5 * 1.2 * 0.7 * 400.0) * 20.0;
        let expected = power / 0.25 / 32.0e6 * 3600.0 + 0.8;
        assert_relative_eq!(consumption, expected, epsilon = 1e-9);
    }

    #[test]
    fn test_acceleration_raises_consumption() {
        let mut cruising = LoadBasedConsumption::new(FuelType::Diesel);
        cruising.calculate_consumption(&at_speed(0.0, 50.0)).unwrap();
        let steady = cruising.calculate_consumption(&at_speed(1.0, 50.0)).unwrap();

        let mut accelerating = LoadBasedConsumption::new(FuelType::Diesel);
        accelerating.calculate_consumption(&at_speed(0.0, 40.0)).unwrap();
        let pushing = accelerating.calculate_consumption(&at_speed(1.0, 50.0)).unwrap();

        assert!(pushing > steady);
    }

    #[test]
    fn test_co2_factor() {
        let algo = LoadBasedConsumption::new(FuelType::Diesel);
        assert_relative_eq!(algo.calculate_co2_from_consumption(2.0).unwrap(), 5.3);
    }

    #[test]
    fn test_missing_speed_is_error() {
        let mut algo = LoadBasedConsumption::new(FuelType::Gasoline);
        let err = algo.calculate_consumption(&Measurement::new(0.0)).unwrap_err();
        assert_eq!(err, ConsumptionError::MissingProperty(PropertyKey::Speed));
    }

    #[test]
    fn test_electric_unsupported() {
        let mut algo = LoadBasedConsumption::new(FuelType::Electric);
        assert!(matches!(
            algo.calculate_consumption(&at_speed(0.0, 30.0)),
            Err(ConsumptionError::UnsupportedFuel(FuelType::Electric))
        ));
    }
}
