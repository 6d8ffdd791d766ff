use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use time::{Date, Duration, OffsetDateTime, PrimitiveDateTime};

pub mod timefmt;

use timefmt::{device_date, device_time};

pub type SensorId = u32;
pub type SensorStationId = u32;

/// One observation window reported by the device. Never mutated after creation.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct HistoricalRecord {
    #[serde(with = "device_time")]
    pub time: PrimitiveDateTime,
    /// Length of the observation window in seconds.
    pub duration: i64,
    #[serde(default)]
    pub avg_outdoor_temperature: Option<f64>,
    #[serde(default)]
    pub high_outdoor_temperature: Option<f64>,
    #[serde(default)]
    pub low_outdoor_temperature: Option<f64>,
    #[serde(default)]
    pub outdoor_humidity: Option<f64>,
    #[serde(default)]
    pub avg_indoor_temperature: Option<f64>,
    #[serde(default)]
    pub indoor_humidity: Option<f64>,
    #[serde(default)]
    pub avg_wind_speed: Option<f64>,
    #[serde(default)]
    pub high_wind_speed: Option<f64>,
    #[serde(default)]
    pub baro_pressure: Option<f64>,
    #[serde(default)]
    pub rainfall: Option<f64>,
    #[serde(default)]
    pub high_rainfall_rate: Option<f64>,
    #[serde(default)]
    pub avg_solar_radiation: Option<f64>,
    #[serde(default)]
    pub high_solar_radiation: Option<f64>,
    #[serde(default)]
    pub avg_uv_index: Option<f64>,
    #[serde(default)]
    pub high_uv_index: Option<f64>,
    #[serde(default)]
    pub sensor_values: BTreeMap<SensorId, f64>,
}

impl HistoricalRecord {
    /// A record with no measurements, mostly useful as a base for tests.
    pub fn empty(time: PrimitiveDateTime, duration: Duration) -> Self {
        Self {
            time,
            duration: duration.whole_seconds(),
            avg_outdoor_temperature: None,
            high_outdoor_temperature: None,
            low_outdoor_temperature: None,
            outdoor_humidity: None,
            avg_indoor_temperature: None,
            indoor_humidity: None,
            avg_wind_speed: None,
            high_wind_speed: None,
            baro_pressure: None,
            rainfall: None,
            high_rainfall_rate: None,
            avg_solar_radiation: None,
            high_solar_radiation: None,
            avg_uv_index: None,
            high_uv_index: None,
            sensor_values: BTreeMap::new(),
        }
    }

    pub fn duration(&self) -> Duration {
        Duration::seconds(self.duration)
    }

    pub fn date(&self) -> Date {
        self.time.date()
    }
}

/// Rainfall reported by a single historical record.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct RainRecord {
    pub time: PrimitiveDateTime,
    pub rainfall: f64,
}

/// `end_time == None` means the storm is still active.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Storm {
    #[serde(with = "device_time")]
    pub start_time: PrimitiveDateTime,
    #[serde(default, with = "device_time::option")]
    pub end_time: Option<PrimitiveDateTime>,
    pub total_rainfall: f64,
}

impl Storm {
    pub fn is_active(&self) -> bool {
        self.end_time.is_none()
    }
}

/// Snapshot of conditions pushed by the device every few seconds.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CurrentWeather {
    #[serde(with = "device_time")]
    pub time: PrimitiveDateTime,
    #[serde(default)]
    pub outdoor_temperature: Option<f64>,
    #[serde(default)]
    pub outdoor_humidity: Option<f64>,
    #[serde(default)]
    pub indoor_temperature: Option<f64>,
    #[serde(default)]
    pub wind_speed: Option<f64>,
    #[serde(default)]
    pub wind_direction: Option<f64>,
    #[serde(default)]
    pub baro_pressure: Option<f64>,
    #[serde(default)]
    pub rain_rate: Option<f64>,
    #[serde(default)]
    pub day_rainfall: Option<f64>,
    /// Date the device considers the current storm to have started; `None` when no storm.
    #[serde(default, with = "device_date::option")]
    pub storm_start: Option<Date>,
    #[serde(default)]
    pub storm_rainfall: f64,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Sensor {
    pub sensor_id: SensorId,
    pub sensor_station_id: SensorStationId,
    pub sensor_type: String,
    #[serde(default)]
    pub name: String,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SensorStation {
    pub sensor_station_id: SensorStationId,
    pub station_type: String,
    #[serde(default)]
    pub name: String,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SensorStationStatus {
    pub sensor_station_id: SensorStationId,
    #[serde(with = "device_time")]
    pub time: PrimitiveDateTime,
    pub battery_ok: bool,
    #[serde(default)]
    pub link_quality: Option<u8>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct WeatherStationParameters {
    pub manufacturer: String,
    pub model: String,
    #[serde(default)]
    pub firmware_version: Option<String>,
    #[serde(default)]
    pub latitude: Option<f64>,
    #[serde(default)]
    pub longitude: Option<f64>,
    #[serde(default)]
    pub altitude: Option<f64>,
    #[serde(default)]
    pub rainfall_season_start_month: Option<u8>,
    #[serde(flatten)]
    pub extra: BTreeMap<String, serde_json::Value>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct WeatherStation {
    pub name: String,
    #[serde(default)]
    pub parameters: Option<WeatherStationParameters>,
}

/// A decoded radar frame. Only the pixels take part in change detection.
#[derive(Debug, Clone, PartialEq)]
pub struct DopplerImage {
    pub time: PrimitiveDateTime,
    pub width: u32,
    pub height: u32,
    /// RGBA8, row major.
    pub pixels: Vec<u8>,
    /// The bytes as fetched, kept for persistence.
    pub encoded: Vec<u8>,
}

impl DopplerImage {
    pub fn same_pixels(&self, other: &DopplerImage) -> bool {
        self.width == other.width && self.height == other.height && self.pixels == other.pixels
    }
}

/// Station-local wall clock time.
pub fn local_now() -> PrimitiveDateTime {
    let now = OffsetDateTime::now_local().unwrap_or_else(|_| OffsetDateTime::now_utc());
    PrimitiveDateTime::new(now.date(), now.time())
}
