//! Storm tracking.
//!
//! The device only reports the *date* a storm started and keeps a storm
//! "active" for up to a day after the last rain, so both ends of a storm are
//! resolved against the stored rain records.

use crate::model::{RainRecord, Storm};
use crate::store::{StoreError, WeatherStore};
use time::{Date, PrimitiveDateTime};
use tracing::{info, warn};

#[derive(Debug, Clone, Copy, PartialEq)]
pub enum StormState {
    NoActiveStorm,
    ActiveStorm {
        start_time: PrimitiveDateTime,
        rainfall: f64,
    },
}

#[derive(Debug, Clone, PartialEq)]
pub enum StormTransition {
    Unchanged,
    Started(Storm),
    Updated(Storm),
    /// `conflicting` is the stored active storm when its start time differs
    /// from the tracked one. It is left untouched for an operator to resolve.
    Ended {
        storm: Storm,
        conflicting: Option<Storm>,
    },
}

#[derive(Debug, Clone)]
pub struct StormTracker {
    state: StormState,
}

impl Default for StormTracker {
    fn default() -> Self {
        Self::new()
    }
}

impl StormTracker {
    pub fn new() -> Self {
        Self {
            state: StormState::NoActiveStorm,
        }
    }

    /// Resumes tracking of a storm left open by a previous run.
    pub fn restore<S: WeatherStore + ?Sized>(store: &S) -> Result<Self, StoreError> {
        let state = match store.latest_storm()? {
            Some(storm) if storm.is_active() => StormState::ActiveStorm {
                start_time: storm.start_time,
                rainfall: storm.total_rainfall,
            },
            _ => StormState::NoActiveStorm,
        };
        Ok(Self { state })
    }

    pub fn state(&self) -> StormState {
        self.state
    }

    pub fn active_storm(&self) -> Option<Storm> {
        match self.state {
            StormState::NoActiveStorm => None,
            StormState::ActiveStorm {
                start_time,
                rainfall,
            } => Some(Storm {
                start_time,
                end_time: None,
                total_rainfall: rainfall,
            }),
        }
    }

    /// Applies one current-weather observation. The in-memory state only
    /// moves once the store has accepted the write.
    pub fn update<S: WeatherStore + ?Sized>(
        &mut self,
        store: &mut S,
        storm_start: Option<Date>,
        storm_rainfall: f64,
        now: PrimitiveDateTime,
    ) -> Result<StormTransition, StoreError> {
        match (self.state, storm_start) {
            (StormState::NoActiveStorm, None) => Ok(StormTransition::Unchanged),
            (StormState::NoActiveStorm, Some(date)) => {
                let start_time = resolve_start_time(store, date, now)?;
                let storm = Storm {
                    start_time,
                    end_time: None,
                    total_rainfall: storm_rainfall,
                };
                store.save_storm(&storm)?;
                info!(start = %start_time, rainfall = storm_rainfall, "Storm started");
                self.state = StormState::ActiveStorm {
                    start_time,
                    rainfall: storm_rainfall,
                };
                Ok(StormTransition::Started(storm))
            }
            (StormState::ActiveStorm { start_time, .. }, Some(_)) => {
                let storm = Storm {
                    start_time,
                    end_time: None,
                    total_rainfall: storm_rainfall,
                };
                store.save_storm(&storm)?;
                self.state = StormState::ActiveStorm {
                    start_time,
                    rainfall: storm_rainfall,
                };
                Ok(StormTransition::Updated(storm))
            }
            (StormState::ActiveStorm { start_time, rainfall }, None) => {
                let conflicting = match store.latest_storm()? {
                    Some(stored) if stored.is_active() && stored.start_time != start_time => {
                        warn!(
                            tracked_start = %start_time,
                            stored_start = %stored.start_time,
                            "Active storm in store does not match tracked storm"
                        );
                        Some(stored)
                    }
                    _ => None,
                };
                let end_time = resolve_end_time(store, start_time, now)?;
                let storm = Storm {
                    start_time,
                    end_time: Some(end_time),
                    total_rainfall: rainfall,
                };
                store.save_storm(&storm)?;
                info!(
                    start = %start_time,
                    end = %end_time,
                    rainfall = rainfall,
                    "Storm ended"
                );
                self.state = StormState::NoActiveStorm;
                Ok(StormTransition::Ended { storm, conflicting })
            }
        }
    }
}

fn is_wet(record: &RainRecord) -> bool {
    record.rainfall > 0.0
}

/// First rain on or after midnight of `date`, or midnight if none has been stored yet.
pub fn resolve_start_time<S: WeatherStore + ?Sized>(
    store: &S,
    date: Date,
    now: PrimitiveDateTime,
) -> Result<PrimitiveDateTime, StoreError> {
    let midnight = date.midnight();
    let first_rain = store
        .rain_records(midnight, now)?
        .into_iter()
        .find(is_wet)
        .map(|record| record.time);
    Ok(first_rain.unwrap_or(midnight))
}

/// Last rain in `[start, now]`, trimming the dry tail the device keeps
/// reporting as "active". Falls back to `start` when no rain was stored.
pub fn resolve_end_time<S: WeatherStore + ?Sized>(
    store: &S,
    start: PrimitiveDateTime,
    now: PrimitiveDateTime,
) -> Result<PrimitiveDateTime, StoreError> {
    let last_rain = store
        .rain_records(start, now)?
        .into_iter()
        .rev()
        .find(is_wet)
        .map(|record| record.time);
    Ok(last_rain.unwrap_or(start))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::model::HistoricalRecord;
    use crate::store::MemoryStore;
    use time::Duration;
    use time::macros::{date, datetime};

    fn rain(time: PrimitiveDateTime, amount: f64) -> HistoricalRecord {
        let mut record = HistoricalRecord::empty(time, Duration::minutes(5));
        record.rainfall = Some(amount);
        record
    }

    fn wet_store() -> Result<MemoryStore, StoreError> {
        let mut store = MemoryStore::new();
        store.add_historical_records(&[
            rain(datetime!(2024-01-05 02:55), 0.0),
            rain(datetime!(2024-01-05 03:00), 0.01),
            rain(datetime!(2024-01-05 03:05), 0.02),
            rain(datetime!(2024-01-05 09:40), 0.01),
            rain(datetime!(2024-01-05 09:45), 0.0),
            rain(datetime!(2024-01-05 18:00), 0.0),
        ])?;
        Ok(store)
    }

    #[test]
    fn start_resolves_to_first_wet_record() -> Result<(), StoreError> {
        let mut store = wet_store()?;
        let mut tracker = StormTracker::new();

        let transition = tracker.update(
            &mut store,
            Some(date!(2024 - 01 - 05)),
            0.03,
            datetime!(2024-01-05 03:10),
        )?;

        let expected = Storm {
            start_time: datetime!(2024-01-05 03:00),
            end_time: None,
            total_rainfall: 0.03,
        };
        assert_eq!(transition, StormTransition::Started(expected.clone()));
        assert_eq!(store.latest_storm()?, Some(expected));
        Ok(())
    }

    #[test]
    fn start_falls_back_to_midnight() -> Result<(), StoreError> {
        let mut store = MemoryStore::new();
        let mut tracker = StormTracker::new();

        tracker.update(
            &mut store,
            Some(date!(2024 - 01 - 05)),
            0.0,
            datetime!(2024-01-05 03:10),
        )?;

        assert_eq!(
            tracker.active_storm().map(|storm| storm.start_time),
            Some(datetime!(2024-01-05 00:00))
        );
        Ok(())
    }

    #[test]
    fn full_lifecycle_yields_one_closed_storm() -> Result<(), StoreError> {
        let mut store = wet_store()?;
        let mut tracker = StormTracker::new();
        let day = Some(date!(2024 - 01 - 05));

        tracker.update(&mut store, day, 0.01, datetime!(2024-01-05 03:01))?;
        tracker.update(&mut store, day, 0.03, datetime!(2024-01-05 03:06))?;
        tracker.update(&mut store, day, 0.04, datetime!(2024-01-05 09:41))?;
        tracker.update(&mut store, day, 0.04, datetime!(2024-01-05 12:00))?;
        let transition = tracker.update(&mut store, None, 0.0, datetime!(2024-01-05 20:00))?;

        let closed = Storm {
            start_time: datetime!(2024-01-05 03:00),
            end_time: Some(datetime!(2024-01-05 09:40)),
            total_rainfall: 0.04,
        };
        assert_eq!(
            transition,
            StormTransition::Ended {
                storm: closed.clone(),
                conflicting: None
            }
        );
        assert_eq!(store.storms(), vec![closed]);
        assert_eq!(tracker.state(), StormState::NoActiveStorm);
        Ok(())
    }

    #[test]
    fn no_storm_reports_are_ignored() -> Result<(), StoreError> {
        let mut store = wet_store()?;
        let mut tracker = StormTracker::new();

        let transition = tracker.update(&mut store, None, 0.0, datetime!(2024-01-05 20:00))?;

        assert_eq!(transition, StormTransition::Unchanged);
        assert!(store.storms().is_empty());
        Ok(())
    }

    #[test]
    fn mismatched_stored_storm_is_reported_and_preserved() -> Result<(), StoreError> {
        let mut store = wet_store()?;
        let stray = Storm {
            start_time: datetime!(2024-01-05 05:00),
            end_time: None,
            total_rainfall: 0.5,
        };
        let mut tracker = StormTracker::new();
        tracker.update(
            &mut store,
            Some(date!(2024 - 01 - 05)),
            0.03,
            datetime!(2024-01-05 03:10),
        )?;
        store.save_storm(&stray)?;

        let transition = tracker.update(&mut store, None, 0.0, datetime!(2024-01-05 20:00))?;

        match transition {
            StormTransition::Ended { storm, conflicting } => {
                assert_eq!(storm.end_time, Some(datetime!(2024-01-05 09:40)));
                assert_eq!(conflicting, Some(stray.clone()));
            }
            other => panic!("expected storm end, got {other:?}"),
        }
        assert!(store.storms().contains(&stray));
        Ok(())
    }

    #[test]
    fn failed_write_leaves_state_unchanged() -> Result<(), StoreError> {
        let mut store = wet_store()?;
        let fault = store.write_fault();
        let mut tracker = StormTracker::new();
        fault.set(true);

        let result = tracker.update(
            &mut store,
            Some(date!(2024 - 01 - 05)),
            0.03,
            datetime!(2024-01-05 03:10),
        );

        assert!(result.is_err());
        assert_eq!(tracker.state(), StormState::NoActiveStorm);
        Ok(())
    }

    #[test]
    fn restore_picks_up_open_storm() -> Result<(), StoreError> {
        let mut store = MemoryStore::new();
        store.save_storm(&Storm {
            start_time: datetime!(2024-01-05 03:00),
            end_time: None,
            total_rainfall: 0.2,
        })?;

        let tracker = StormTracker::restore(&store)?;

        assert_eq!(
            tracker.state(),
            StormState::ActiveStorm {
                start_time: datetime!(2024-01-05 03:00),
                rainfall: 0.2
            }
        );
        Ok(())
    }
}
