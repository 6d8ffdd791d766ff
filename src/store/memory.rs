use crate::model::timefmt::device_time;
use crate::model::{
    DopplerImage, HistoricalRecord, RainRecord, Sensor, SensorStation, SensorStationStatus,
    Storm, WeatherStation, WeatherStationParameters,
};
use crate::store::{StoreError, WeatherStore};
use crate::summary::aggregate::{DailyRecord, DailySummary, ExtremeKind};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use time::{Date, Month, PrimitiveDateTime};

/// Shared switch that makes every write of the owning store fail.
#[derive(Debug, Clone, Default)]
pub struct WriteFault(Arc<AtomicBool>);

impl WriteFault {
    pub fn set(&self, failing: bool) {
        self.0.store(failing, Ordering::SeqCst);
    }

    pub fn is_set(&self) -> bool {
        self.0.load(Ordering::SeqCst)
    }

    fn check(&self) -> Result<(), StoreError> {
        if self.is_set() {
            Err(StoreError::Unavailable("write fault injected".to_string()))
        } else {
            Ok(())
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct DopplerImageEntry {
    #[serde(with = "device_time")]
    pub time: PrimitiveDateTime,
    pub width: u32,
    pub height: u32,
    pub size: usize,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct StormImage {
    #[serde(with = "device_time")]
    pub storm_start: PrimitiveDateTime,
    #[serde(with = "device_time")]
    pub image_time: PrimitiveDateTime,
}

/// Everything except the historical records.
#[derive(Debug, Clone, Default)]
struct Tables {
    storms: Vec<Storm>,
    summaries: Vec<DailySummary>,
    daily_records: Vec<DailyRecord>,
    sensors: Vec<Sensor>,
    sensor_stations: Vec<SensorStation>,
    station_status: Vec<SensorStationStatus>,
    weather_station: Option<WeatherStation>,
    doppler_images: Vec<DopplerImageEntry>,
    storm_images: Vec<StormImage>,
}

impl Tables {
    fn upsert_storm(&mut self, storm: &Storm) {
        match self
            .storms
            .binary_search_by_key(&storm.start_time, |s| s.start_time)
        {
            Ok(index) => self.storms[index] = storm.clone(),
            Err(index) => self.storms.insert(index, storm.clone()),
        }
    }

    fn upsert_summary(&mut self, summary: &DailySummary) {
        match self.summaries.binary_search_by_key(&summary.date, |s| s.date) {
            Ok(index) => self.summaries[index] = summary.clone(),
            Err(index) => self.summaries.insert(index, summary.clone()),
        }
    }

    fn upsert_daily_record(&mut self, record: &DailyRecord) {
        let existing = self.daily_records.iter_mut().find(|r| {
            r.month == record.month && r.day == record.day && r.kind == record.kind
        });
        match existing {
            Some(slot) => *slot = record.clone(),
            None => self.daily_records.push(record.clone()),
        }
    }

    fn replace_sensors(&mut self, sensors: &[Sensor]) {
        self.sensors = sensors.to_vec();
    }

    fn replace_sensor_stations(&mut self, stations: &[SensorStation]) {
        self.sensor_stations = stations.to_vec();
    }

    fn update_station_status(&mut self, statuses: &[SensorStationStatus]) {
        for status in statuses {
            self.station_status
                .retain(|s| s.sensor_station_id != status.sensor_station_id);
            self.station_status.push(status.clone());
        }
        self.station_status.sort_by_key(|s| s.sensor_station_id);
    }

    fn register_weather_station(&mut self, name: &str) {
        match &mut self.weather_station {
            Some(station) => station.name = name.to_string(),
            None => {
                self.weather_station = Some(WeatherStation {
                    name: name.to_string(),
                    parameters: None,
                })
            }
        }
    }

    fn set_station_parameters(
        &mut self,
        parameters: &WeatherStationParameters,
    ) -> Result<(), StoreError> {
        let station = self
            .weather_station
            .as_mut()
            .ok_or(StoreError::MissingWeatherStation)?;
        station.parameters = Some(parameters.clone());
        Ok(())
    }

    fn add_doppler_image(&mut self, image: &DopplerImage) {
        self.doppler_images.retain(|entry| entry.time != image.time);
        self.doppler_images.push(DopplerImageEntry {
            time: image.time,
            width: image.width,
            height: image.height,
            size: image.encoded.len(),
        });
    }

    fn add_storm_image(
        &mut self,
        storm_start: PrimitiveDateTime,
        image_time: PrimitiveDateTime,
    ) {
        let link = StormImage {
            storm_start,
            image_time,
        };
        if !self.storm_images.contains(&link) {
            self.storm_images.push(link);
        }
    }
}

/// In-process store for tests and for running without a database.
#[derive(Debug, Default)]
pub struct MemoryStore {
    records: BTreeMap<PrimitiveDateTime, HistoricalRecord>,
    tables: Tables,
    fault: WriteFault,
}

impl MemoryStore {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn write_fault(&self) -> WriteFault {
        self.fault.clone()
    }

    pub fn record_count(&self) -> usize {
        self.records.len()
    }

    pub fn storms(&self) -> Vec<Storm> {
        self.tables.storms.clone()
    }

    pub fn summaries(&self) -> Vec<DailySummary> {
        self.tables.summaries.clone()
    }

    pub fn sensors(&self) -> &[Sensor] {
        &self.tables.sensors
    }

    pub fn sensor_stations(&self) -> &[SensorStation] {
        &self.tables.sensor_stations
    }

    pub fn station_status(&self) -> &[SensorStationStatus] {
        &self.tables.station_status
    }

    pub fn doppler_images(&self) -> &[DopplerImageEntry] {
        &self.tables.doppler_images
    }

    pub fn storm_images(&self) -> &[StormImage] {
        &self.tables.storm_images
    }

    fn insert_records(&mut self, records: &[HistoricalRecord]) {
        for record in records {
            self.records.insert(record.time, record.clone());
        }
    }

    fn apply(&mut self, change: impl FnOnce(&mut Tables) -> Result<(), StoreError>) -> Result<(), StoreError> {
        self.fault.check()?;
        change(&mut self.tables)
    }
}

impl WeatherStore for MemoryStore {
    fn newest_record_time(&self) -> Result<Option<PrimitiveDateTime>, StoreError> {
        Ok(self.records.keys().next_back().copied())
    }

    fn oldest_record_time(&self) -> Result<Option<PrimitiveDateTime>, StoreError> {
        Ok(self.records.keys().next().copied())
    }

    fn records_for_day(&self, date: Date) -> Result<Vec<HistoricalRecord>, StoreError> {
        let start = date.midnight();
        let records = match date.next_day() {
            Some(next) => self
                .records
                .range(start..next.midnight())
                .map(|(_, record)| record.clone())
                .collect(),
            None => self
                .records
                .range(start..)
                .map(|(_, record)| record.clone())
                .collect(),
        };
        Ok(records)
    }

    fn add_historical_records(&mut self, records: &[HistoricalRecord]) -> Result<(), StoreError> {
        self.fault.check()?;
        self.insert_records(records);
        Ok(())
    }

    fn rain_records(
        &self,
        start: PrimitiveDateTime,
        end: PrimitiveDateTime,
    ) -> Result<Vec<RainRecord>, StoreError> {
        if start > end {
            return Ok(Vec::new());
        }
        Ok(self
            .records
            .range(start..=end)
            .map(|(time, record)| RainRecord {
                time: *time,
                rainfall: record.rainfall.unwrap_or(0.0),
            })
            .collect())
    }

    fn save_storm(&mut self, storm: &Storm) -> Result<(), StoreError> {
        self.apply(|tables| {
            tables.upsert_storm(storm);
            Ok(())
        })
    }

    fn latest_storm(&self) -> Result<Option<Storm>, StoreError> {
        Ok(self.tables.storms.last().cloned())
    }

    fn newest_summary_date(&self) -> Result<Option<Date>, StoreError> {
        Ok(self.tables.summaries.last().map(|summary| summary.date))
    }

    fn daily_summary(&self, date: Date) -> Result<Option<DailySummary>, StoreError> {
        Ok(self
            .tables
            .summaries
            .binary_search_by_key(&date, |s| s.date)
            .ok()
            .map(|index| self.tables.summaries[index].clone()))
    }

    fn upsert_daily_summary(&mut self, summary: &DailySummary) -> Result<(), StoreError> {
        self.apply(|tables| {
            tables.upsert_summary(summary);
            Ok(())
        })
    }

    fn daily_record(
        &self,
        month: Month,
        day: u8,
        kind: ExtremeKind,
    ) -> Result<Option<DailyRecord>, StoreError> {
        let month = month as u8;
        Ok(self
            .tables
            .daily_records
            .iter()
            .find(|r| r.month == month && r.day == day && r.kind == kind)
            .cloned())
    }

    fn save_daily_record(&mut self, record: &DailyRecord) -> Result<(), StoreError> {
        self.apply(|tables| {
            tables.upsert_daily_record(record);
            Ok(())
        })
    }

    fn replace_sensors(&mut self, sensors: &[Sensor]) -> Result<(), StoreError> {
        self.apply(|tables| {
            tables.replace_sensors(sensors);
            Ok(())
        })
    }

    fn replace_sensor_stations(&mut self, stations: &[SensorStation]) -> Result<(), StoreError> {
        self.apply(|tables| {
            tables.replace_sensor_stations(stations);
            Ok(())
        })
    }

    fn update_sensor_station_status(
        &mut self,
        statuses: &[SensorStationStatus],
    ) -> Result<(), StoreError> {
        self.apply(|tables| {
            tables.update_station_status(statuses);
            Ok(())
        })
    }

    fn register_weather_station(&mut self, name: &str) -> Result<(), StoreError> {
        self.apply(|tables| {
            tables.register_weather_station(name);
            Ok(())
        })
    }

    fn weather_station(&self) -> Result<Option<WeatherStation>, StoreError> {
        Ok(self.tables.weather_station.clone())
    }

    fn save_weather_station_parameters(
        &mut self,
        parameters: &WeatherStationParameters,
    ) -> Result<(), StoreError> {
        self.apply(|tables| tables.set_station_parameters(parameters))
    }

    fn save_doppler_image(&mut self, image: &DopplerImage) -> Result<(), StoreError> {
        self.apply(|tables| {
            tables.add_doppler_image(image);
            Ok(())
        })
    }

    fn add_storm_doppler_image(
        &mut self,
        storm_start: PrimitiveDateTime,
        image_time: PrimitiveDateTime,
    ) -> Result<(), StoreError> {
        self.apply(|tables| {
            tables.add_storm_image(storm_start, image_time);
            Ok(())
        })
    }
}
