//! Persistence collaborator.
//!
//! The collection engine is the only caller of a [`WeatherStore`]; every
//! method either applies completely or returns an error and leaves the
//! store as it was.

use crate::model::{
    DopplerImage, HistoricalRecord, RainRecord, Sensor, SensorStation, SensorStationStatus,
    Storm, WeatherStation, WeatherStationParameters,
};
use crate::summary::aggregate::{DailyRecord, DailySummary, ExtremeKind};
use thiserror::Error;
use time::{Date, PrimitiveDateTime};

pub mod memory;
pub mod sqlite;

pub use memory::{MemoryStore, WriteFault};
pub use sqlite::SqliteStore;

#[derive(Debug, Error)]
pub enum StoreError {
    #[error("io error: {0}")]
    Io(#[from] std::io::Error),
    #[error("sqlite error: {0}")]
    Sqlite(#[from] rusqlite::Error),
    #[error("serialization error: {0}")]
    Json(#[from] serde_json::Error),
    #[error("timestamp format error: {0}")]
    Timestamp(#[from] time::error::Format),
    #[error("timestamp parse error: {0}")]
    TimestampParse(#[from] time::error::Parse),
    #[error("no weather station registered")]
    MissingWeatherStation,
    #[error("store unavailable: {0}")]
    Unavailable(String),
}

pub trait WeatherStore: Send {
    fn newest_record_time(&self) -> Result<Option<PrimitiveDateTime>, StoreError>;

    fn oldest_record_time(&self) -> Result<Option<PrimitiveDateTime>, StoreError>;

    /// Every record whose `time` falls on `date`, oldest first.
    fn records_for_day(&self, date: Date) -> Result<Vec<HistoricalRecord>, StoreError>;

    /// Appends a batch. Re-delivery of a record with an existing `time` replaces it.
    fn add_historical_records(&mut self, records: &[HistoricalRecord]) -> Result<(), StoreError>;

    /// Rainfall of every record in `[start, end]`, oldest first.
    fn rain_records(
        &self,
        start: PrimitiveDateTime,
        end: PrimitiveDateTime,
    ) -> Result<Vec<RainRecord>, StoreError>;

    /// Upsert keyed by `start_time`.
    fn save_storm(&mut self, storm: &Storm) -> Result<(), StoreError>;

    /// The storm with the newest `start_time`.
    fn latest_storm(&self) -> Result<Option<Storm>, StoreError>;

    fn newest_summary_date(&self) -> Result<Option<Date>, StoreError>;

    fn daily_summary(&self, date: Date) -> Result<Option<DailySummary>, StoreError>;

    /// Replaces any summary already stored for the same date.
    fn upsert_daily_summary(&mut self, summary: &DailySummary) -> Result<(), StoreError>;

    fn daily_record(
        &self,
        month: time::Month,
        day: u8,
        kind: ExtremeKind,
    ) -> Result<Option<DailyRecord>, StoreError>;

    /// Replaces the record for the same month, day and kind.
    fn save_daily_record(&mut self, record: &DailyRecord) -> Result<(), StoreError>;

    fn replace_sensors(&mut self, sensors: &[Sensor]) -> Result<(), StoreError>;

    fn replace_sensor_stations(&mut self, stations: &[SensorStation]) -> Result<(), StoreError>;

    /// Replaces the latest status of each station in `statuses`.
    fn update_sensor_station_status(
        &mut self,
        statuses: &[SensorStationStatus],
    ) -> Result<(), StoreError>;

    fn register_weather_station(&mut self, name: &str) -> Result<(), StoreError>;

    fn weather_station(&self) -> Result<Option<WeatherStation>, StoreError>;

    /// Fails with [`StoreError::MissingWeatherStation`] when no station is registered.
    fn save_weather_station_parameters(
        &mut self,
        parameters: &WeatherStationParameters,
    ) -> Result<(), StoreError>;

    fn save_doppler_image(&mut self, image: &DopplerImage) -> Result<(), StoreError>;

    fn add_storm_doppler_image(
        &mut self,
        storm_start: PrimitiveDateTime,
        image_time: PrimitiveDateTime,
    ) -> Result<(), StoreError>;
}
