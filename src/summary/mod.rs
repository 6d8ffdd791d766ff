//! Daily summary scheduling.
//!
//! The scheduler lives inside the collection engine. Debounce timers run as
//! detached tokio tasks, but all they do when they fire is enqueue a
//! [`Command::SummaryDue`] back onto the engine queue, so the recomputation
//! itself always happens on the engine's execution context.

use crate::engine::{Command, Queued};
use crate::store::{StoreError, WeatherStore};
use std::collections::HashMap;
use std::time::Duration;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tracing::{debug, info};
use time::Date;

pub mod aggregate;

use aggregate::{DailySummary, ExtremeKind};

pub const DEFAULT_DEBOUNCE: Duration = Duration::from_secs(3);

#[derive(Debug)]
struct PendingSummary {
    generation: u64,
    timer: JoinHandle<()>,
}

#[derive(Debug)]
pub struct SummaryScheduler {
    delay: Duration,
    pending: HashMap<Date, PendingSummary>,
    next_generation: u64,
    queue: mpsc::UnboundedSender<Queued>,
}

impl SummaryScheduler {
    pub fn new(delay: Duration, queue: mpsc::UnboundedSender<Queued>) -> Self {
        Self {
            delay,
            pending: HashMap::new(),
            next_generation: 0,
            queue,
        }
    }

    /// Arms the debounce timer for `date`, cancelling any timer already armed for it.
    pub fn schedule(&mut self, date: Date) {
        self.next_generation += 1;
        let generation = self.next_generation;
        let delay = self.delay;
        let queue = self.queue.clone();
        let timer = tokio::spawn(async move {
            tokio::time::sleep(delay).await;
            let _ = queue.send(Command::SummaryDue { date, generation }.into());
        });

        if let Some(superseded) = self.pending.insert(date, PendingSummary { generation, timer }) {
            superseded.timer.abort();
            debug!(date = %date, "Superseded pending summary request");
        }
    }

    /// Consumes the pending request for `date` if `generation` is still the
    /// live one. A timer that fired just before being superseded is stale.
    pub fn take_due(&mut self, date: Date, generation: u64) -> bool {
        match self.pending.get(&date) {
            Some(pending) if pending.generation == generation => {
                self.pending.remove(&date);
                true
            }
            _ => false,
        }
    }

    pub fn is_pending(&self, date: Date) -> bool {
        self.pending.contains_key(&date)
    }

    pub fn pending_count(&self) -> usize {
        self.pending.len()
    }

    pub fn cancel_all(&mut self) {
        for (_, pending) in self.pending.drain() {
            pending.timer.abort();
        }
    }

    /// Enqueues one summarize command per day in [`catchup_range`], oldest first.
    pub fn catchup<S: WeatherStore + ?Sized>(&self, store: &S) -> Result<Vec<Date>, StoreError> {
        let dates = match catchup_range(store)? {
            Some((first, last)) => days_between(first, last),
            None => Vec::new(),
        };
        for date in &dates {
            let _ = self.queue.send(Command::Summarize(Some(*date)).into());
        }
        if let (Some(first), Some(last)) = (dates.first(), dates.last()) {
            info!(first = %first, last = %last, days = dates.len(), "Summary catch-up issued");
        }
        Ok(dates)
    }
}

impl Drop for SummaryScheduler {
    fn drop(&mut self) {
        self.cancel_all();
    }
}

/// `[max(newest summary, oldest record), newest record]`, or `None` when
/// there are no historical records.
pub fn catchup_range<S: WeatherStore + ?Sized>(
    store: &S,
) -> Result<Option<(Date, Date)>, StoreError> {
    let Some(oldest) = store.oldest_record_time()? else {
        return Ok(None);
    };
    let Some(newest) = store.newest_record_time()? else {
        return Ok(None);
    };
    let start = match store.newest_summary_date()? {
        Some(summarized) => summarized.max(oldest.date()),
        None => oldest.date(),
    };
    Ok(Some((start, newest.date())))
}

/// Inclusive, ascending.
pub fn days_between(first: Date, last: Date) -> Vec<Date> {
    let mut days = Vec::new();
    let mut current = Some(first);
    while let Some(day) = current {
        if day > last {
            break;
        }
        days.push(day);
        current = day.next_day();
    }
    days
}

/// Rebuilds the summary for `date` and updates the all-time daily records.
/// Returns `None` without touching the store when the day has no records.
pub fn recompute_day<S: WeatherStore + ?Sized>(
    store: &mut S,
    date: Date,
) -> Result<Option<DailySummary>, StoreError> {
    let records = store.records_for_day(date)?;
    let Some(summary) = aggregate::summarize_records(date, &records) else {
        debug!(date = %date, "No historical records for day, summary skipped");
        return Ok(None);
    };
    store.upsert_daily_summary(&summary)?;

    for kind in ExtremeKind::ALL {
        let existing = store.daily_record(date.month(), date.day(), kind)?;
        if let Some(record) = aggregate::new_extreme(kind, &summary, existing.as_ref()) {
            info!(
                date = %date,
                kind = ?kind,
                value = record.value,
                previous_year = ?record.previous_year,
                "New daily record"
            );
            store.save_daily_record(&record)?;
        }
    }

    debug!(date = %date, records = summary.record_count, "Daily summary stored");
    Ok(Some(summary))
}
