//! Durable store backed by a single SQLite database file.
//!
//! Every trait method runs in one transaction. Nested structures
//! (summaries, daily records, free-form station parameters, the full
//! historical record) are kept as JSON next to the columns that are
//! queried.

use crate::model::timefmt::{DEVICE_DATE, DEVICE_TIME};
use crate::model::{
    DopplerImage, HistoricalRecord, RainRecord, Sensor, SensorStation, SensorStationStatus,
    Storm, WeatherStation, WeatherStationParameters,
};
use crate::store::{StoreError, WeatherStore};
use crate::summary::aggregate::{DailyRecord, DailySummary, ExtremeKind};
use rusqlite::{Connection, OptionalExtension, params};
use std::path::Path;
use time::{Date, Month, PrimitiveDateTime};
use tracing::info;

const SCHEMA: &str = "
PRAGMA journal_mode = WAL;

CREATE TABLE IF NOT EXISTS historical_records (
    time TEXT PRIMARY KEY NOT NULL,
    duration INTEGER NOT NULL CHECK (duration > 0),
    rainfall REAL,
    record TEXT NOT NULL
);

CREATE TABLE IF NOT EXISTS storms (
    start_time TEXT PRIMARY KEY NOT NULL,
    end_time TEXT,
    total_rainfall REAL NOT NULL
);

CREATE TABLE IF NOT EXISTS daily_summaries (
    date TEXT PRIMARY KEY NOT NULL,
    summary TEXT NOT NULL
);

CREATE TABLE IF NOT EXISTS daily_records (
    month INTEGER NOT NULL,
    day INTEGER NOT NULL,
    kind TEXT NOT NULL,
    record TEXT NOT NULL,
    PRIMARY KEY (month, day, kind)
);

CREATE TABLE IF NOT EXISTS sensors (
    sensor_id INTEGER PRIMARY KEY NOT NULL,
    sensor_station_id INTEGER NOT NULL,
    sensor_type TEXT NOT NULL,
    name TEXT NOT NULL
);

CREATE TABLE IF NOT EXISTS sensor_stations (
    sensor_station_id INTEGER PRIMARY KEY NOT NULL,
    station_type TEXT NOT NULL,
    name TEXT NOT NULL
);

CREATE TABLE IF NOT EXISTS sensor_station_status (
    sensor_station_id INTEGER PRIMARY KEY NOT NULL,
    time TEXT NOT NULL,
    battery_ok INTEGER NOT NULL,
    link_quality INTEGER
);

CREATE TABLE IF NOT EXISTS weather_station (
    id INTEGER PRIMARY KEY NOT NULL CHECK (id = 1),
    name TEXT NOT NULL,
    parameters TEXT
);

CREATE TABLE IF NOT EXISTS doppler_images (
    time TEXT PRIMARY KEY NOT NULL,
    width INTEGER NOT NULL,
    height INTEGER NOT NULL,
    encoded BLOB NOT NULL
);

CREATE TABLE IF NOT EXISTS storm_doppler_images (
    storm_start TEXT NOT NULL,
    image_time TEXT NOT NULL,
    PRIMARY KEY (storm_start, image_time)
);
";

#[derive(Debug)]
pub struct SqliteStore {
    conn: Connection,
}

impl SqliteStore {
    /// Opens (creating if needed) the database at `path`.
    pub fn open(path: impl AsRef<Path>) -> Result<Self, StoreError> {
        let path = path.as_ref();
        if let Some(parent) = path.parent()
            && !parent.as_os_str().is_empty()
        {
            std::fs::create_dir_all(parent)?;
        }
        let store = Self::with_connection(Connection::open(path)?)?;
        info!(
            path = %path.display(),
            records = store.record_count()?,
            "SQLite store opened"
        );
        Ok(store)
    }

    pub fn open_in_memory() -> Result<Self, StoreError> {
        Self::with_connection(Connection::open_in_memory()?)
    }

    fn with_connection(conn: Connection) -> Result<Self, StoreError> {
        conn.execute_batch(SCHEMA)?;
        Ok(Self { conn })
    }

    pub fn record_count(&self) -> Result<u64, StoreError> {
        let count: i64 = self
            .conn
            .query_row("SELECT COUNT(*) FROM historical_records", [], |row| row.get(0))?;
        Ok(count as u64)
    }

    pub fn storms(&self) -> Result<Vec<Storm>, StoreError> {
        let mut statement = self.conn.prepare(
            "SELECT start_time, end_time, total_rainfall FROM storms ORDER BY start_time",
        )?;
        let rows = statement
            .query_map([], |row| {
                Ok((
                    row.get::<_, String>(0)?,
                    row.get::<_, Option<String>>(1)?,
                    row.get::<_, f64>(2)?,
                ))
            })?
            .collect::<Result<Vec<_>, _>>()?;
        rows.into_iter()
            .map(|(start, end, total_rainfall)| storm_from_row(&start, end.as_deref(), total_rainfall))
            .collect()
    }

    pub fn doppler_image_count(&self) -> Result<u64, StoreError> {
        let count: i64 = self
            .conn
            .query_row("SELECT COUNT(*) FROM doppler_images", [], |row| row.get(0))?;
        Ok(count as u64)
    }

    /// Times of the images linked to the storm starting at `storm_start`.
    pub fn storm_images(&self, storm_start: PrimitiveDateTime) -> Result<Vec<PrimitiveDateTime>, StoreError> {
        let mut statement = self.conn.prepare(
            "SELECT image_time FROM storm_doppler_images WHERE storm_start = ?1 ORDER BY image_time",
        )?;
        let times = statement
            .query_map(params![time_key(storm_start)?], |row| row.get::<_, String>(0))?
            .collect::<Result<Vec<_>, _>>()?;
        times.iter().map(|raw| parse_time(raw)).collect()
    }

    fn time_column(&self, sql: &str) -> Result<Option<PrimitiveDateTime>, StoreError> {
        let raw: Option<String> = self.conn.query_row(sql, [], |row| row.get(0))?;
        raw.as_deref().map(parse_time).transpose()
    }
}

fn time_key(time: PrimitiveDateTime) -> Result<String, StoreError> {
    Ok(time.format(DEVICE_TIME)?)
}

fn parse_time(raw: &str) -> Result<PrimitiveDateTime, StoreError> {
    Ok(PrimitiveDateTime::parse(raw, DEVICE_TIME)?)
}

fn date_key(date: Date) -> Result<String, StoreError> {
    Ok(date.format(DEVICE_DATE)?)
}

fn storm_from_row(start: &str, end: Option<&str>, total_rainfall: f64) -> Result<Storm, StoreError> {
    Ok(Storm {
        start_time: parse_time(start)?,
        end_time: end.map(parse_time).transpose()?,
        total_rainfall,
    })
}

impl WeatherStore for SqliteStore {
    fn newest_record_time(&self) -> Result<Option<PrimitiveDateTime>, StoreError> {
        self.time_column("SELECT MAX(time) FROM historical_records")
    }

    fn oldest_record_time(&self) -> Result<Option<PrimitiveDateTime>, StoreError> {
        self.time_column("SELECT MIN(time) FROM historical_records")
    }

    fn records_for_day(&self, date: Date) -> Result<Vec<HistoricalRecord>, StoreError> {
        let start = time_key(date.midnight())?;
        let end = date
            .next_day()
            .map(|next| time_key(next.midnight()))
            .transpose()?;
        let mut statement = self.conn.prepare_cached(
            "SELECT record FROM historical_records
             WHERE time >= ?1 AND (?2 IS NULL OR time < ?2)
             ORDER BY time",
        )?;
        let rows = statement
            .query_map(params![start, end], |row| row.get::<_, String>(0))?
            .collect::<Result<Vec<_>, _>>()?;
        rows.iter()
            .map(|json| serde_json::from_str(json).map_err(StoreError::from))
            .collect()
    }

    fn add_historical_records(&mut self, records: &[HistoricalRecord]) -> Result<(), StoreError> {
        let tx = self.conn.transaction()?;
        {
            let mut insert = tx.prepare_cached(
                "INSERT OR REPLACE INTO historical_records (time, duration, rainfall, record)
                 VALUES (?1, ?2, ?3, ?4)",
            )?;
            for record in records {
                insert.execute(params![
                    time_key(record.time)?,
                    record.duration,
                    record.rainfall,
                    serde_json::to_string(record)?,
                ])?;
            }
        }
        tx.commit()?;
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
        let mut statement = self.conn.prepare_cached(
            "SELECT time, COALESCE(rainfall, 0.0) FROM historical_records
             WHERE time >= ?1 AND time <= ?2
             ORDER BY time",
        )?;
        let rows = statement
            .query_map(params![time_key(start)?, time_key(end)?], |row| {
                Ok((row.get::<_, String>(0)?, row.get::<_, f64>(1)?))
            })?
            .collect::<Result<Vec<_>, _>>()?;
        rows.into_iter()
            .map(|(time, rainfall)| parse_time(&time).map(|time| RainRecord { time, rainfall }))
            .collect()
    }

    fn save_storm(&mut self, storm: &Storm) -> Result<(), StoreError> {
        let end = storm.end_time.map(time_key).transpose()?;
        self.conn.execute(
            "INSERT INTO storms (start_time, end_time, total_rainfall) VALUES (?1, ?2, ?3)
             ON CONFLICT (start_time) DO UPDATE
             SET end_time = excluded.end_time, total_rainfall = excluded.total_rainfall",
            params![time_key(storm.start_time)?, end, storm.total_rainfall],
        )?;
        Ok(())
    }

    fn latest_storm(&self) -> Result<Option<Storm>, StoreError> {
        let row = self
            .conn
            .query_row(
                "SELECT start_time, end_time, total_rainfall FROM storms
                 ORDER BY start_time DESC LIMIT 1",
                [],
                |row| {
                    Ok((
                        row.get::<_, String>(0)?,
                        row.get::<_, Option<String>>(1)?,
                        row.get::<_, f64>(2)?,
                    ))
                },
            )
            .optional()?;
        row.map(|(start, end, total_rainfall)| storm_from_row(&start, end.as_deref(), total_rainfall))
            .transpose()
    }

    fn newest_summary_date(&self) -> Result<Option<Date>, StoreError> {
        let raw: Option<String> =
            self.conn
                .query_row("SELECT MAX(date) FROM daily_summaries", [], |row| row.get(0))?;
        Ok(raw
            .as_deref()
            .map(|raw| Date::parse(raw, DEVICE_DATE))
            .transpose()?)
    }

    fn daily_summary(&self, date: Date) -> Result<Option<DailySummary>, StoreError> {
        let json: Option<String> = self
            .conn
            .query_row(
                "SELECT summary FROM daily_summaries WHERE date = ?1",
                params![date_key(date)?],
                |row| row.get(0),
            )
            .optional()?;
        Ok(json.as_deref().map(serde_json::from_str).transpose()?)
    }

    fn upsert_daily_summary(&mut self, summary: &DailySummary) -> Result<(), StoreError> {
        self.conn.execute(
            "INSERT OR REPLACE INTO daily_summaries (date, summary) VALUES (?1, ?2)",
            params![date_key(summary.date)?, serde_json::to_string(summary)?],
        )?;
        Ok(())
    }

    fn daily_record(
        &self,
        month: Month,
        day: u8,
        kind: ExtremeKind,
    ) -> Result<Option<DailyRecord>, StoreError> {
        let json: Option<String> = self
            .conn
            .query_row(
                "SELECT record FROM daily_records WHERE month = ?1 AND day = ?2 AND kind = ?3",
                params![month as u8, day, kind.as_str()],
                |row| row.get(0),
            )
            .optional()?;
        Ok(json.as_deref().map(serde_json::from_str).transpose()?)
    }

    fn save_daily_record(&mut self, record: &DailyRecord) -> Result<(), StoreError> {
        self.conn.execute(
            "INSERT OR REPLACE INTO daily_records (month, day, kind, record) VALUES (?1, ?2, ?3, ?4)",
            params![
                record.month,
                record.day,
                record.kind.as_str(),
                serde_json::to_string(record)?
            ],
        )?;
        Ok(())
    }

    fn replace_sensors(&mut self, sensors: &[Sensor]) -> Result<(), StoreError> {
        let tx = self.conn.transaction()?;
        tx.execute("DELETE FROM sensors", [])?;
        {
            let mut insert = tx.prepare_cached(
                "INSERT OR REPLACE INTO sensors (sensor_id, sensor_station_id, sensor_type, name)
                 VALUES (?1, ?2, ?3, ?4)",
            )?;
            for sensor in sensors {
                insert.execute(params![
                    sensor.sensor_id,
                    sensor.sensor_station_id,
                    sensor.sensor_type,
                    sensor.name
                ])?;
            }
        }
        tx.commit()?;
        Ok(())
    }

    fn replace_sensor_stations(&mut self, stations: &[SensorStation]) -> Result<(), StoreError> {
        let tx = self.conn.transaction()?;
        tx.execute("DELETE FROM sensor_stations", [])?;
        {
            let mut insert = tx.prepare_cached(
                "INSERT OR REPLACE INTO sensor_stations (sensor_station_id, station_type, name)
                 VALUES (?1, ?2, ?3)",
            )?;
            for station in stations {
                insert.execute(params![
                    station.sensor_station_id,
                    station.station_type,
                    station.name
                ])?;
            }
        }
        tx.commit()?;
        Ok(())
    }

    fn update_sensor_station_status(
        &mut self,
        statuses: &[SensorStationStatus],
    ) -> Result<(), StoreError> {
        let tx = self.conn.transaction()?;
        {
            let mut upsert = tx.prepare_cached(
                "INSERT OR REPLACE INTO sensor_station_status
                 (sensor_station_id, time, battery_ok, link_quality)
                 VALUES (?1, ?2, ?3, ?4)",
            )?;
            for status in statuses {
                upsert.execute(params![
                    status.sensor_station_id,
                    time_key(status.time)?,
                    status.battery_ok,
                    status.link_quality
                ])?;
            }
        }
        tx.commit()?;
        Ok(())
    }

    fn register_weather_station(&mut self, name: &str) -> Result<(), StoreError> {
        self.conn.execute(
            "INSERT INTO weather_station (id, name) VALUES (1, ?1)
             ON CONFLICT (id) DO UPDATE SET name = excluded.name",
            params![name],
        )?;
        Ok(())
    }

    fn weather_station(&self) -> Result<Option<WeatherStation>, StoreError> {
        let row = self
            .conn
            .query_row(
                "SELECT name, parameters FROM weather_station WHERE id = 1",
                [],
                |row| Ok((row.get::<_, String>(0)?, row.get::<_, Option<String>>(1)?)),
            )
            .optional()?;
        let Some((name, parameters)) = row else {
            return Ok(None);
        };
        Ok(Some(WeatherStation {
            name,
            parameters: parameters.as_deref().map(serde_json::from_str).transpose()?,
        }))
    }

    fn save_weather_station_parameters(
        &mut self,
        parameters: &WeatherStationParameters,
    ) -> Result<(), StoreError> {
        let updated = self.conn.execute(
            "UPDATE weather_station SET parameters = ?1 WHERE id = 1",
            params![serde_json::to_string(parameters)?],
        )?;
        if updated == 0 {
            return Err(StoreError::MissingWeatherStation);
        }
        Ok(())
    }

    fn save_doppler_image(&mut self, image: &DopplerImage) -> Result<(), StoreError> {
        self.conn.execute(
            "INSERT OR REPLACE INTO doppler_images (time, width, height, encoded)
             VALUES (?1, ?2, ?3, ?4)",
            params![time_key(image.time)?, image.width, image.height, image.encoded],
        )?;
        Ok(())
    }

    fn add_storm_doppler_image(
        &mut self,
        storm_start: PrimitiveDateTime,
        image_time: PrimitiveDateTime,
    ) -> Result<(), StoreError> {
        self.conn.execute(
            "INSERT OR IGNORE INTO storm_doppler_images (storm_start, image_time) VALUES (?1, ?2)",
            params![time_key(storm_start)?, time_key(image_time)?],
        )?;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::BTreeMap;
    use std::path::PathBuf;
    use std::time::{SystemTime, UNIX_EPOCH};
    use time::Duration;
    use time::macros::{date, datetime};

    fn temp_db(label: &str) -> Result<PathBuf, Box<dyn std::error::Error>> {
        let unique = SystemTime::now().duration_since(UNIX_EPOCH)?.as_nanos();
        Ok(std::env::temp_dir()
            .join(format!("weather-store-{label}-{unique}"))
            .join("collector.db"))
    }

    fn remove_db(path: &Path) {
        if let Some(dir) = path.parent() {
            let _ = std::fs::remove_dir_all(dir);
        }
    }

    fn rainy(time: PrimitiveDateTime, rainfall: Option<f64>) -> HistoricalRecord {
        let mut record = HistoricalRecord::empty(time, Duration::minutes(5));
        record.rainfall = rainfall;
        record.avg_outdoor_temperature = Some(9.5);
        record
    }

    #[test]
    fn reopen_restores_records_and_tables() -> Result<(), Box<dyn std::error::Error>> {
        let path = temp_db("reopen")?;
        let storm = Storm {
            start_time: datetime!(2024-01-05 03:00),
            end_time: None,
            total_rainfall: 0.2,
        };
        {
            let mut store = SqliteStore::open(&path)?;
            store.add_historical_records(&[
                rainy(datetime!(2024-01-05 10:00), None),
                rainy(datetime!(2024-01-05 10:05), Some(0.01)),
            ])?;
            store.save_storm(&storm)?;
            store.register_weather_station("Backyard")?;
        }

        let store = SqliteStore::open(&path)?;
        let day = store.records_for_day(date!(2024 - 01 - 05));
        let latest = store.latest_storm();
        let station = store.weather_station();
        drop(store);
        remove_db(&path);

        let day = day?;
        assert_eq!(day.len(), 2);
        assert_eq!(day[1].rainfall, Some(0.01));
        assert_eq!(day[1].avg_outdoor_temperature, Some(9.5));
        assert_eq!(latest?, Some(storm));
        assert_eq!(station?.map(|station| station.name), Some("Backyard".to_string()));
        Ok(())
    }

    #[test]
    fn batch_with_a_rejected_row_stores_nothing() -> Result<(), StoreError> {
        let mut store = SqliteStore::open_in_memory()?;
        let broken = HistoricalRecord::empty(datetime!(2024-01-05 10:05), Duration::ZERO);

        let result = store.add_historical_records(&[rainy(datetime!(2024-01-05 10:00), None), broken]);

        assert!(matches!(result, Err(StoreError::Sqlite(_))));
        assert_eq!(store.record_count()?, 0);
        assert_eq!(store.newest_record_time()?, None);
        Ok(())
    }

    #[test]
    fn redelivered_records_replace_existing_rows() -> Result<(), StoreError> {
        let mut store = SqliteStore::open_in_memory()?;
        store.add_historical_records(&[rainy(datetime!(2024-01-05 10:00), Some(0.01))])?;
        store.add_historical_records(&[rainy(datetime!(2024-01-05 10:00), Some(0.02))])?;

        assert_eq!(store.record_count()?, 1);
        let rain = store.rain_records(datetime!(2024-01-05 00:00), datetime!(2024-01-05 23:59))?;
        assert_eq!(
            rain,
            vec![RainRecord {
                time: datetime!(2024-01-05 10:00),
                rainfall: 0.02,
            }]
        );
        Ok(())
    }

    #[test]
    fn day_range_and_extremes_are_ordered() -> Result<(), StoreError> {
        let mut store = SqliteStore::open_in_memory()?;
        store.add_historical_records(&[
            rainy(datetime!(2024-01-06 00:00), None),
            rainy(datetime!(2024-01-04 23:55), None),
            rainy(datetime!(2024-01-05 12:00), None),
            rainy(datetime!(2024-01-05 00:00), None),
        ])?;

        let day: Vec<_> = store
            .records_for_day(date!(2024 - 01 - 05))?
            .into_iter()
            .map(|record| record.time)
            .collect();

        assert_eq!(day, vec![datetime!(2024-01-05 00:00), datetime!(2024-01-05 12:00)]);
        assert_eq!(store.oldest_record_time()?, Some(datetime!(2024-01-04 23:55)));
        assert_eq!(store.newest_record_time()?, Some(datetime!(2024-01-06 00:00)));
        assert!(store.rain_records(datetime!(2024-01-06 00:00), datetime!(2024-01-05 00:00))?.is_empty());
        Ok(())
    }

    #[test]
    fn storms_upsert_by_start_time() -> Result<(), StoreError> {
        let mut store = SqliteStore::open_in_memory()?;
        let mut storm = Storm {
            start_time: datetime!(2024-01-05 03:00),
            end_time: None,
            total_rainfall: 0.1,
        };
        store.save_storm(&storm)?;
        storm.total_rainfall = 0.3;
        storm.end_time = Some(datetime!(2024-01-05 09:00));
        store.save_storm(&storm)?;

        assert_eq!(store.storms()?, vec![storm.clone()]);
        assert_eq!(store.latest_storm()?, Some(storm));
        Ok(())
    }

    #[test]
    fn summaries_and_daily_records_replace_by_key() -> Result<(), Box<dyn std::error::Error>> {
        let mut store = SqliteStore::open_in_memory()?;
        let records = [rainy(datetime!(2024-01-05 10:00), Some(0.1))];
        let summary = crate::summary::aggregate::summarize_records(date!(2024 - 01 - 05), &records)
            .ok_or("summary")?;
        store.upsert_daily_summary(&summary)?;
        store.upsert_daily_summary(&summary)?;
        let record = DailyRecord {
            month: 1,
            day: 5,
            kind: ExtremeKind::MaxRainfall,
            value: 0.1,
            year: 2024,
            previous_value: None,
            previous_year: None,
        };
        store.save_daily_record(&record)?;

        assert_eq!(store.newest_summary_date()?, Some(date!(2024 - 01 - 05)));
        assert_eq!(store.daily_summary(date!(2024 - 01 - 05))?, Some(summary));
        assert_eq!(store.daily_summary(date!(2024 - 01 - 06))?, None);
        assert_eq!(
            store.daily_record(Month::January, 5, ExtremeKind::MaxRainfall)?,
            Some(record)
        );
        assert_eq!(store.daily_record(Month::January, 5, ExtremeKind::MaxHighTemperature)?, None);
        Ok(())
    }

    #[test]
    fn parameters_require_registered_station() -> Result<(), StoreError> {
        let mut store = SqliteStore::open_in_memory()?;
        let parameters = WeatherStationParameters {
            manufacturer: "Davis".to_string(),
            model: "Vantage Pro2".to_string(),
            firmware_version: Some("3.12".to_string()),
            latitude: None,
            longitude: None,
            altitude: None,
            rainfall_season_start_month: Some(7),
            extra: BTreeMap::new(),
        };

        let result = store.save_weather_station_parameters(&parameters);
        assert!(matches!(result, Err(StoreError::MissingWeatherStation)));

        store.register_weather_station("Backyard")?;
        store.save_weather_station_parameters(&parameters)?;
        store.register_weather_station("Garden")?;

        let station = store.weather_station()?;
        assert_eq!(station.as_ref().map(|s| s.name.as_str()), Some("Garden"));
        assert_eq!(station.and_then(|s| s.parameters), Some(parameters));
        Ok(())
    }

    #[test]
    fn doppler_images_link_to_storms_once() -> Result<(), StoreError> {
        let mut store = SqliteStore::open_in_memory()?;
        let image = DopplerImage {
            time: datetime!(2024-01-05 03:05),
            width: 1,
            height: 1,
            pixels: vec![0, 0, 0, 255],
            encoded: vec![1, 2, 3],
        };
        store.save_doppler_image(&image)?;
        store.add_storm_doppler_image(datetime!(2024-01-05 03:00), image.time)?;
        store.add_storm_doppler_image(datetime!(2024-01-05 03:00), image.time)?;

        assert_eq!(store.doppler_image_count()?, 1);
        assert_eq!(
            store.storm_images(datetime!(2024-01-05 03:00))?,
            vec![datetime!(2024-01-05 03:05)]
        );
        Ok(())
    }
}
