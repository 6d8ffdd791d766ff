use crate::model::HistoricalRecord;
use serde::Deserialize;
use time::{Duration, PrimitiveDateTime};

/// What the engine does with a historical batch that contains a gap.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum GapPolicy {
    /// Count and log the gap, then store the batch anyway.
    #[default]
    Log,
    /// Drop the batch and reset the connection so the device resends from the
    /// cursor, up to `max_gap_resets` times in a row.
    Reconnect,
}

/// Consecutive resets for the same gap before the batch is stored anyway.
pub const DEFAULT_MAX_GAP_RESETS: u32 = 3;

/// A discontinuity between `previous` and the record at `time`.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Gap {
    pub previous: PrimitiveDateTime,
    pub time: PrimitiveDateTime,
    pub expected: Duration,
    pub actual: Duration,
}

/// Drops records at or before the cursor. The device resends from the cursor
/// it was given, so those were stored by an earlier batch.
pub fn skip_stored(
    cursor: Option<PrimitiveDateTime>,
    records: Vec<HistoricalRecord>,
) -> Vec<HistoricalRecord> {
    match cursor {
        Some(cursor) => records.into_iter().filter(|record| record.time > cursor).collect(),
        None => records,
    }
}

/// Checks every consecutive pair, starting from the cursor left by the previous batch.
pub fn detect_gaps(previous: Option<PrimitiveDateTime>, records: &[HistoricalRecord]) -> Vec<Gap> {
    let mut gaps = Vec::new();
    let mut previous = previous;
    for record in records {
        if let Some(prev) = previous {
            let actual = record.time - prev;
            let expected = record.duration();
            if actual != expected {
                gaps.push(Gap {
                    previous: prev,
                    time: record.time,
                    expected,
                    actual,
                });
            }
        }
        previous = Some(record.time);
    }
    gaps
}

#[cfg(test)]
mod tests {
    use super::*;
    use time::macros::datetime;

    fn five_minute(time: PrimitiveDateTime) -> HistoricalRecord {
        HistoricalRecord::empty(time, Duration::minutes(5))
    }

    #[test]
    fn steady_cadence_has_no_gaps() {
        let batch = vec![
            five_minute(datetime!(2024-01-05 10:00)),
            five_minute(datetime!(2024-01-05 10:05)),
            five_minute(datetime!(2024-01-05 10:10)),
        ];

        assert!(detect_gaps(None, &batch).is_empty());
        assert!(detect_gaps(Some(datetime!(2024-01-05 09:55)), &batch).is_empty());
    }

    #[test]
    fn gap_against_cursor_is_detected() {
        let batch = vec![five_minute(datetime!(2024-01-05 10:20))];

        let gaps = detect_gaps(Some(datetime!(2024-01-05 10:10)), &batch);

        assert_eq!(
            gaps,
            vec![Gap {
                previous: datetime!(2024-01-05 10:10),
                time: datetime!(2024-01-05 10:20),
                expected: Duration::minutes(5),
                actual: Duration::minutes(10),
            }]
        );
    }

    #[test]
    fn gap_inside_batch_is_detected() {
        let batch = vec![
            five_minute(datetime!(2024-01-05 10:00)),
            five_minute(datetime!(2024-01-05 10:05)),
            five_minute(datetime!(2024-01-05 10:15)),
            five_minute(datetime!(2024-01-05 10:20)),
        ];

        let gaps = detect_gaps(None, &batch);

        assert_eq!(gaps.len(), 1);
        assert_eq!(gaps[0].time, datetime!(2024-01-05 10:15));
    }

    #[test]
    fn records_up_to_the_cursor_are_skipped() {
        let batch = vec![
            five_minute(datetime!(2024-01-05 10:00)),
            five_minute(datetime!(2024-01-05 10:05)),
            five_minute(datetime!(2024-01-05 10:10)),
        ];

        let fresh = skip_stored(Some(datetime!(2024-01-05 10:05)), batch.clone());

        assert_eq!(fresh.len(), 1);
        assert_eq!(fresh[0].time, datetime!(2024-01-05 10:10));
        assert!(detect_gaps(Some(datetime!(2024-01-05 10:05)), &fresh).is_empty());
        assert_eq!(skip_stored(None, batch).len(), 3);
        assert!(skip_stored(Some(datetime!(2024-01-05 10:10)), vec![five_minute(datetime!(2024-01-05 09:00))]).is_empty());
    }

    #[test]
    fn duration_comes_from_the_later_record() {
        let hourly = HistoricalRecord::empty(datetime!(2024-01-05 11:00), Duration::hours(1));
        let batch = vec![five_minute(datetime!(2024-01-05 10:00)), hourly];

        assert!(detect_gaps(None, &batch).is_empty());
    }
}
