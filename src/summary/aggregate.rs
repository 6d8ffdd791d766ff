//! Daily aggregation of historical records.
//!
//! Every record is lifted into a [`SummaryAccumulator`] and the accumulators
//! are merged pairwise. `merge` is commutative and associative, so the
//! resulting [`DailySummary`] does not depend on the order records were
//! loaded in.

use crate::model::timefmt::{device_date, device_time};
use crate::model::{HistoricalRecord, SensorId};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use time::{Date, PrimitiveDateTime};

#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct MeasurementSummary {
    pub min: f64,
    #[serde(with = "device_time")]
    pub min_time: PrimitiveDateTime,
    pub max: f64,
    #[serde(with = "device_time")]
    pub max_time: PrimitiveDateTime,
    /// Average weighted by record duration.
    pub average: f64,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct DailySummary {
    #[serde(with = "device_date")]
    pub date: Date,
    pub record_count: u32,
    /// Seconds of observation covered by the folded records.
    pub total_duration: i64,
    pub outdoor_temperature: Option<MeasurementSummary>,
    pub outdoor_humidity: Option<MeasurementSummary>,
    pub indoor_temperature: Option<MeasurementSummary>,
    pub indoor_humidity: Option<MeasurementSummary>,
    pub wind_speed: Option<MeasurementSummary>,
    pub baro_pressure: Option<MeasurementSummary>,
    pub solar_radiation: Option<MeasurementSummary>,
    pub uv_index: Option<MeasurementSummary>,
    pub rainfall: f64,
    pub max_rainfall_rate: Option<f64>,
    #[serde(default)]
    pub sensor_values: BTreeMap<SensorId, MeasurementSummary>,
}

#[derive(Debug, Clone, Copy, PartialEq)]
struct Accumulator {
    min: f64,
    min_time: PrimitiveDateTime,
    max: f64,
    max_time: PrimitiveDateTime,
    weighted_sum: f64,
    weight: f64,
}

impl Accumulator {
    /// `low`/`high` fall back to `average` when the device did not report them.
    fn observe(
        average: Option<f64>,
        low: Option<f64>,
        high: Option<f64>,
        time: PrimitiveDateTime,
        weight: f64,
    ) -> Option<Self> {
        let min = low.or(average).or(high)?;
        let max = high.or(average).or(low)?;
        let mean = average.unwrap_or((min + max) / 2.0);
        Some(Self {
            min,
            min_time: time,
            max,
            max_time: time,
            weighted_sum: mean * weight,
            weight,
        })
    }

    fn merge(self, other: Self) -> Self {
        // Ties resolve to the earlier time so the fold stays order independent.
        let (min, min_time) = if other.min < self.min
            || (other.min == self.min && other.min_time < self.min_time)
        {
            (other.min, other.min_time)
        } else {
            (self.min, self.min_time)
        };
        let (max, max_time) = if other.max > self.max
            || (other.max == self.max && other.max_time < self.max_time)
        {
            (other.max, other.max_time)
        } else {
            (self.max, self.max_time)
        };
        Self {
            min,
            min_time,
            max,
            max_time,
            weighted_sum: self.weighted_sum + other.weighted_sum,
            weight: self.weight + other.weight,
        }
    }

    fn finish(self) -> MeasurementSummary {
        MeasurementSummary {
            min: self.min,
            min_time: self.min_time,
            max: self.max,
            max_time: self.max_time,
            average: self.weighted_sum / self.weight,
        }
    }
}

fn merge_option(a: Option<Accumulator>, b: Option<Accumulator>) -> Option<Accumulator> {
    match (a, b) {
        (Some(a), Some(b)) => Some(a.merge(b)),
        (a, None) => a,
        (None, b) => b,
    }
}

fn max_option(a: Option<f64>, b: Option<f64>) -> Option<f64> {
    match (a, b) {
        (Some(a), Some(b)) => Some(a.max(b)),
        (a, None) => a,
        (None, b) => b,
    }
}

#[derive(Debug, Clone, Default, PartialEq)]
pub struct SummaryAccumulator {
    record_count: u32,
    total_duration: i64,
    outdoor_temperature: Option<Accumulator>,
    outdoor_humidity: Option<Accumulator>,
    indoor_temperature: Option<Accumulator>,
    indoor_humidity: Option<Accumulator>,
    wind_speed: Option<Accumulator>,
    baro_pressure: Option<Accumulator>,
    solar_radiation: Option<Accumulator>,
    uv_index: Option<Accumulator>,
    rainfall: f64,
    max_rainfall_rate: Option<f64>,
    sensor_values: BTreeMap<SensorId, Accumulator>,
}

impl SummaryAccumulator {
    pub fn from_record(record: &HistoricalRecord) -> Self {
        let time = record.time;
        let weight = record.duration.max(1) as f64;
        let single = |value: Option<f64>| Accumulator::observe(value, None, None, time, weight);

        Self {
            record_count: 1,
            total_duration: record.duration,
            outdoor_temperature: Accumulator::observe(
                record.avg_outdoor_temperature,
                record.low_outdoor_temperature,
                record.high_outdoor_temperature,
                time,
                weight,
            ),
            outdoor_humidity: single(record.outdoor_humidity),
            indoor_temperature: single(record.avg_indoor_temperature),
            indoor_humidity: single(record.indoor_humidity),
            wind_speed: Accumulator::observe(
                record.avg_wind_speed,
                None,
                record.high_wind_speed,
                time,
                weight,
            ),
            baro_pressure: single(record.baro_pressure),
            solar_radiation: Accumulator::observe(
                record.avg_solar_radiation,
                None,
                record.high_solar_radiation,
                time,
                weight,
            ),
            uv_index: Accumulator::observe(
                record.avg_uv_index,
                None,
                record.high_uv_index,
                time,
                weight,
            ),
            rainfall: record.rainfall.unwrap_or(0.0),
            max_rainfall_rate: record.high_rainfall_rate,
            sensor_values: record
                .sensor_values
                .iter()
                .filter_map(|(id, value)| single(Some(*value)).map(|acc| (*id, acc)))
                .collect(),
        }
    }

    pub fn merge(self, other: Self) -> Self {
        let mut sensor_values = self.sensor_values;
        for (id, acc) in other.sensor_values {
            let merged = match sensor_values.remove(&id) {
                Some(existing) => existing.merge(acc),
                None => acc,
            };
            sensor_values.insert(id, merged);
        }

        Self {
            record_count: self.record_count + other.record_count,
            total_duration: self.total_duration + other.total_duration,
            outdoor_temperature: merge_option(self.outdoor_temperature, other.outdoor_temperature),
            outdoor_humidity: merge_option(self.outdoor_humidity, other.outdoor_humidity),
            indoor_temperature: merge_option(self.indoor_temperature, other.indoor_temperature),
            indoor_humidity: merge_option(self.indoor_humidity, other.indoor_humidity),
            wind_speed: merge_option(self.wind_speed, other.wind_speed),
            baro_pressure: merge_option(self.baro_pressure, other.baro_pressure),
            solar_radiation: merge_option(self.solar_radiation, other.solar_radiation),
            uv_index: merge_option(self.uv_index, other.uv_index),
            rainfall: self.rainfall + other.rainfall,
            max_rainfall_rate: max_option(self.max_rainfall_rate, other.max_rainfall_rate),
            sensor_values,
        }
    }

    /// `None` when nothing was folded in.
    pub fn finish(self, date: Date) -> Option<DailySummary> {
        if self.record_count == 0 {
            return None;
        }
        Some(DailySummary {
            date,
            record_count: self.record_count,
            total_duration: self.total_duration,
            outdoor_temperature: self.outdoor_temperature.map(Accumulator::finish),
            outdoor_humidity: self.outdoor_humidity.map(Accumulator::finish),
            indoor_temperature: self.indoor_temperature.map(Accumulator::finish),
            indoor_humidity: self.indoor_humidity.map(Accumulator::finish),
            wind_speed: self.wind_speed.map(Accumulator::finish),
            baro_pressure: self.baro_pressure.map(Accumulator::finish),
            solar_radiation: self.solar_radiation.map(Accumulator::finish),
            uv_index: self.uv_index.map(Accumulator::finish),
            rainfall: self.rainfall,
            max_rainfall_rate: self.max_rainfall_rate,
            sensor_values: self
                .sensor_values
                .into_iter()
                .map(|(id, acc)| (id, acc.finish()))
                .collect(),
        })
    }
}

/// Folds the records that fall on `date`; records for other dates are ignored.
pub fn summarize_records(date: Date, records: &[HistoricalRecord]) -> Option<DailySummary> {
    records
        .iter()
        .filter(|record| record.date() == date)
        .map(SummaryAccumulator::from_record)
        .reduce(SummaryAccumulator::merge)?
        .finish(date)
}

/// All-time records kept per calendar day (month and day, any year).
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ExtremeKind {
    MaxHighTemperature,
    MinHighTemperature,
    MaxLowTemperature,
    MinLowTemperature,
    MaxRainfall,
}

impl ExtremeKind {
    pub const ALL: [ExtremeKind; 5] = [
        ExtremeKind::MaxHighTemperature,
        ExtremeKind::MinHighTemperature,
        ExtremeKind::MaxLowTemperature,
        ExtremeKind::MinLowTemperature,
        ExtremeKind::MaxRainfall,
    ];

    /// Same spelling as the serde representation.
    pub fn as_str(self) -> &'static str {
        match self {
            ExtremeKind::MaxHighTemperature => "max_high_temperature",
            ExtremeKind::MinHighTemperature => "min_high_temperature",
            ExtremeKind::MaxLowTemperature => "max_low_temperature",
            ExtremeKind::MinLowTemperature => "min_low_temperature",
            ExtremeKind::MaxRainfall => "max_rainfall",
        }
    }

    fn value_from(self, summary: &DailySummary) -> Option<f64> {
        match self {
            ExtremeKind::MaxHighTemperature | ExtremeKind::MinHighTemperature => {
                summary.outdoor_temperature.map(|t| t.max)
            }
            ExtremeKind::MaxLowTemperature | ExtremeKind::MinLowTemperature => {
                summary.outdoor_temperature.map(|t| t.min)
            }
            ExtremeKind::MaxRainfall => Some(summary.rainfall).filter(|rain| *rain > 0.0),
        }
    }

    /// Ties count as new records.
    pub fn at_least_as_extreme(self, candidate: f64, existing: f64) -> bool {
        match self {
            ExtremeKind::MaxHighTemperature
            | ExtremeKind::MaxLowTemperature
            | ExtremeKind::MaxRainfall => candidate >= existing,
            ExtremeKind::MinHighTemperature | ExtremeKind::MinLowTemperature => {
                candidate <= existing
            }
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct DailyRecord {
    pub month: u8,
    pub day: u8,
    pub kind: ExtremeKind,
    pub value: f64,
    pub year: i32,
    /// The record this one displaced, kept for display.
    pub previous_value: Option<f64>,
    pub previous_year: Option<i32>,
}

/// Returns the record to store when `summary` sets (or ties) the all-time
/// extreme of `kind` for its calendar day, `None` when nothing changes.
pub fn new_extreme(
    kind: ExtremeKind,
    summary: &DailySummary,
    existing: Option<&DailyRecord>,
) -> Option<DailyRecord> {
    let candidate = kind.value_from(summary)?;
    let year = summary.date.year();
    let fresh = |previous_value, previous_year| DailyRecord {
        month: summary.date.month() as u8,
        day: summary.date.day(),
        kind,
        value: candidate,
        year,
        previous_value,
        previous_year,
    };

    match existing {
        None => Some(fresh(None, None)),
        // Recomputing the day that holds the record: revise it in place, or
        // hand the record back to its previous holder if it no longer beats it.
        Some(current) if current.year == year => {
            if candidate == current.value {
                return None;
            }
            match (current.previous_value, current.previous_year) {
                (Some(value), Some(prior_year)) if !kind.at_least_as_extreme(candidate, value) => {
                    Some(DailyRecord {
                        value,
                        year: prior_year,
                        previous_value: None,
                        previous_year: None,
                        ..current.clone()
                    })
                }
                _ => Some(fresh(current.previous_value, current.previous_year)),
            }
        }
        Some(current) if kind.at_least_as_extreme(candidate, current.value) => {
            Some(fresh(Some(current.value), Some(current.year)))
        }
        Some(_) => None,
    }
}
