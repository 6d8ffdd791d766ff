//! Collection engine.
//!
//! Every mutation of collector state and every store write is funnelled
//! through one FIFO queue drained by a single tokio task. Producers
//! (connection supervisor, doppler poller, summary timers, HTTP commands)
//! only ever hold an [`EngineHandle`].

use crate::model::{
    CurrentWeather, DopplerImage, HistoricalRecord, Sensor, SensorStation, SensorStationStatus,
    WeatherStationParameters,
};
use crate::storm::{StormTracker, StormTransition};
use crate::store::{StoreError, WeatherStore};
use crate::summary::{self, SummaryScheduler};
use crate::supervisor::{ConnectionControl, ConnectionId};
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use std::time::Duration;
use thiserror::Error;
use time::Date;
use tokio::sync::{broadcast, mpsc, oneshot, watch};
use tokio::task::JoinHandle;
use tracing::{debug, error, info, warn};

pub mod gap;
pub mod state;

use gap::{Gap, GapPolicy};
use state::{CollectorState, CollectorStatistics};

const LIVE_FEED_CAPACITY: usize = 16;

#[derive(Debug, Error, PartialEq, Eq)]
pub enum EngineError {
    #[error("collection engine is not accepting commands")]
    Closed,
}

#[derive(Debug)]
pub enum Command {
    HistoricalBatch(Vec<HistoricalRecord>),
    CurrentWeather {
        weather: CurrentWeather,
        raw: Arc<str>,
    },
    Sensors(Vec<Sensor>),
    SensorStations(Vec<SensorStation>),
    SensorStationStatus(Vec<SensorStationStatus>),
    StationParameters(WeatherStationParameters),
    DopplerImage(DopplerImage),
    /// `None` rebuilds every day that has records.
    Summarize(Option<Date>),
    SummaryDue {
        date: Date,
        generation: u64,
    },
    Barrier(oneshot::Sender<()>),
}

/// A queued command and the device connection it came from, if any.
#[derive(Debug)]
pub struct Queued {
    pub command: Command,
    pub origin: Option<ConnectionId>,
}

impl From<Command> for Queued {
    fn from(command: Command) -> Self {
        Self {
            command,
            origin: None,
        }
    }
}

#[derive(Debug, Clone, Copy)]
pub struct EngineSettings {
    pub debounce: Duration,
    pub gap_policy: GapPolicy,
    pub max_gap_resets: u32,
}

impl Default for EngineSettings {
    fn default() -> Self {
        Self {
            debounce: summary::DEFAULT_DEBOUNCE,
            gap_policy: GapPolicy::default(),
            max_gap_resets: gap::DEFAULT_MAX_GAP_RESETS,
        }
    }
}

#[derive(Debug, Clone)]
pub struct EngineHandle {
    queue: mpsc::UnboundedSender<Queued>,
    origin: Option<ConnectionId>,
    accepting: Arc<AtomicBool>,
    stop: Arc<watch::Sender<bool>>,
    statistics: watch::Receiver<CollectorStatistics>,
    live: broadcast::Sender<Arc<str>>,
}

impl EngineHandle {
    fn enqueue(&self, command: Command) -> Result<(), EngineError> {
        if !self.accepting.load(Ordering::Acquire) {
            return Err(EngineError::Closed);
        }
        self.queue
            .send(Queued {
                command,
                origin: self.origin,
            })
            .map_err(|_| EngineError::Closed)
    }

    /// A handle whose commands are attributed to `connection`, so a reset
    /// they cause only drops that connection.
    pub fn for_connection(&self, connection: ConnectionId) -> Self {
        Self {
            origin: Some(connection),
            ..self.clone()
        }
    }

    pub fn submit_historical_batch(&self, records: Vec<HistoricalRecord>) -> Result<(), EngineError> {
        if records.is_empty() {
            return Ok(());
        }
        self.enqueue(Command::HistoricalBatch(records))
    }

    pub fn submit_current_weather(
        &self,
        weather: CurrentWeather,
        raw: impl Into<Arc<str>>,
    ) -> Result<(), EngineError> {
        self.enqueue(Command::CurrentWeather {
            weather,
            raw: raw.into(),
        })
    }

    pub fn submit_sensors(&self, sensors: Vec<Sensor>) -> Result<(), EngineError> {
        self.enqueue(Command::Sensors(sensors))
    }

    pub fn submit_sensor_stations(&self, stations: Vec<SensorStation>) -> Result<(), EngineError> {
        self.enqueue(Command::SensorStations(stations))
    }

    pub fn submit_sensor_station_status(
        &self,
        statuses: Vec<SensorStationStatus>,
    ) -> Result<(), EngineError> {
        self.enqueue(Command::SensorStationStatus(statuses))
    }

    pub fn submit_station_parameters(
        &self,
        parameters: WeatherStationParameters,
    ) -> Result<(), EngineError> {
        self.enqueue(Command::StationParameters(parameters))
    }

    pub fn submit_doppler_image(&self, image: DopplerImage) -> Result<(), EngineError> {
        self.enqueue(Command::DopplerImage(image))
    }

    /// Summarizes one day, or every day with records when `date` is `None`.
    pub fn request_summarize(&self, date: Option<Date>) -> Result<(), EngineError> {
        self.enqueue(Command::Summarize(date))
    }

    /// Resolves once every command enqueued before it has been executed.
    pub async fn barrier(&self) -> Result<(), EngineError> {
        let (done, wait) = oneshot::channel();
        self.enqueue(Command::Barrier(done))?;
        wait.await.map_err(|_| EngineError::Closed)
    }

    /// Stops accepting commands and tells the worker to exit after the
    /// command it is currently executing.
    pub fn shutdown(&self) {
        if self.accepting.swap(false, Ordering::AcqRel) {
            info!("Collection engine shutdown requested");
        }
        self.stop.send_replace(true);
    }

    pub fn is_accepting(&self) -> bool {
        self.accepting.load(Ordering::Acquire)
    }

    pub fn statistics(&self) -> CollectorStatistics {
        self.statistics.borrow().clone()
    }

    pub fn subscribe_statistics(&self) -> watch::Receiver<CollectorStatistics> {
        self.statistics.clone()
    }

    /// Raw current-weather payloads, in arrival order.
    pub fn subscribe_current_weather(&self) -> broadcast::Receiver<Arc<str>> {
        self.live.subscribe()
    }
}

/// Restores the cursor and any open storm from `store` and starts the
/// worker, which runs a summary catch-up before taking commands. The join handle hands the store back
/// once the worker has stopped.
pub fn spawn<S>(
    store: S,
    settings: EngineSettings,
    connection: ConnectionControl,
) -> Result<(EngineHandle, JoinHandle<S>), StoreError>
where
    S: WeatherStore + 'static,
{
    let state = CollectorState {
        last_saved_record_time: store.newest_record_time()?,
        storm: StormTracker::restore(&store)?,
        ..CollectorState::default()
    };
    info!(
        cursor = ?state.last_saved_record_time,
        active_storm = ?state.storm.active_storm().map(|storm| storm.start_time),
        "Collector state restored"
    );

    let (queue, commands) = mpsc::unbounded_channel();
    let (stop, stop_rx) = watch::channel(false);
    let (statistics_tx, statistics) = watch::channel(state.snapshot(0));
    let (live, _) = broadcast::channel(LIVE_FEED_CAPACITY);

    let engine = CollectionEngine {
        store,
        state,
        scheduler: SummaryScheduler::new(settings.debounce, queue.clone()),
        settings,
        live: live.clone(),
        statistics: statistics_tx,
        connection,
        origin: None,
    };

    let handle = EngineHandle {
        queue,
        origin: None,
        accepting: Arc::new(AtomicBool::new(true)),
        stop: Arc::new(stop),
        statistics,
        live,
    };

    let worker = tokio::spawn(engine.run(commands, stop_rx));
    Ok((handle, worker))
}

struct CollectionEngine<S> {
    store: S,
    state: CollectorState,
    scheduler: SummaryScheduler,
    settings: EngineSettings,
    live: broadcast::Sender<Arc<str>>,
    statistics: watch::Sender<CollectorStatistics>,
    connection: ConnectionControl,
    /// Connection that sent the command being executed.
    origin: Option<ConnectionId>,
}

impl<S: WeatherStore> CollectionEngine<S> {
    async fn run(
        mut self,
        mut commands: mpsc::UnboundedReceiver<Queued>,
        mut stop: watch::Receiver<bool>,
    ) -> S {
        info!("Collection engine started");
        if let Err(err) = self.scheduler.catchup(&self.store) {
            error!(error = %err, "Summary catch-up failed");
        }
        self.publish_statistics();
        loop {
            let queued = tokio::select! {
                biased;
                _ = stop.changed() => break,
                queued = commands.recv() => match queued {
                    Some(queued) => queued,
                    None => break,
                },
            };
            self.origin = queued.origin;
            self.execute(queued.command);
            self.publish_statistics();
        }

        commands.close();
        let mut discarded = 0usize;
        while commands.try_recv().is_ok() {
            discarded += 1;
        }
        self.scheduler.cancel_all();
        info!(
            discarded,
            processed = self.state.commands_processed,
            "Collection engine stopped"
        );
        self.store
    }

    fn execute(&mut self, command: Command) {
        match command {
            Command::HistoricalBatch(records) => self.handle_historical_batch(records),
            Command::CurrentWeather { weather, raw } => self.handle_current_weather(weather, raw),
            Command::Sensors(sensors) => {
                let result = self.store.replace_sensors(&sensors);
                self.reset_on_failure("sensors", result);
            }
            Command::SensorStations(stations) => {
                let result = self.store.replace_sensor_stations(&stations);
                self.reset_on_failure("sensor stations", result);
            }
            Command::SensorStationStatus(statuses) => {
                let result = self.store.update_sensor_station_status(&statuses);
                self.reset_on_failure("sensor station status", result);
            }
            Command::StationParameters(parameters) => {
                let result = self.store.save_weather_station_parameters(&parameters);
                self.reset_on_failure("weather station parameters", result);
            }
            Command::DopplerImage(image) => self.handle_doppler_image(image),
            Command::Summarize(Some(date)) => self.summarize(date),
            Command::Summarize(None) => self.rebuild_summaries(),
            Command::SummaryDue { date, generation } => {
                if self.scheduler.take_due(date, generation) {
                    self.summarize(date);
                } else {
                    debug!(date = %date, generation, "Ignoring superseded summary timer");
                }
            }
            Command::Barrier(done) => {
                let _ = done.send(());
            }
        }
        self.state.commands_processed += 1;
    }

    fn handle_historical_batch(&mut self, records: Vec<HistoricalRecord>) {
        let cursor = self.state.last_saved_record_time;
        let received = records.len();
        let records = gap::skip_stored(cursor, records);
        let skipped = received - records.len();
        if skipped > 0 {
            self.state.records_skipped += skipped as u64;
            debug!(skipped, cursor = ?cursor, "Skipping records already stored");
        }
        let Some(last) = records.last().map(|record| record.time) else {
            return;
        };

        let gaps = gap::detect_gaps(cursor, &records);
        for found in &gaps {
            warn!(
                previous = %found.previous,
                time = %found.time,
                expected_secs = found.expected.whole_seconds(),
                actual_secs = found.actual.whole_seconds(),
                "Gap in historical records"
            );
        }

        if !gaps.is_empty() && self.settings.gap_policy == GapPolicy::Reconnect {
            if self.state.consecutive_gap_resets < self.settings.max_gap_resets {
                self.note_gaps(&gaps);
                self.state.consecutive_gap_resets += 1;
                self.state.batches_dropped += 1;
                warn!(
                    records = records.len(),
                    missing = self.state.missing_data_count,
                    attempt = self.state.consecutive_gap_resets,
                    "Dropping historical batch with gap"
                );
                self.request_reset();
                return;
            }
            warn!(
                resets = self.state.consecutive_gap_resets,
                "Gap persists after repeated resets, storing batch"
            );
        }

        if let Err(err) = self.store.add_historical_records(&records) {
            self.state.batches_dropped += 1;
            error!(error = %err, records = records.len(), "Failed to store historical batch");
            return;
        }

        if gaps.is_empty() {
            self.state.missing_data_count = 0;
        } else {
            self.note_gaps(&gaps);
        }
        self.state.consecutive_gap_resets = 0;
        self.state.records_saved += records.len() as u64;
        self.state.last_saved_record_time = Some(match cursor {
            Some(cursor) => cursor.max(last),
            None => last,
        });

        let mut dates: Vec<Date> = records.iter().map(HistoricalRecord::date).collect();
        dates.dedup();
        for date in dates {
            self.scheduler.schedule(date);
        }
        debug!(records = records.len(), cursor = %last, "Historical batch stored");
    }

    fn note_gaps(&mut self, gaps: &[Gap]) {
        self.state.missing_data_count += 1;
        self.state.gaps_detected += gaps.len() as u64;
        self.state.last_bad_record_time = gaps.last().map(|found| found.time);
    }

    fn handle_current_weather(&mut self, weather: CurrentWeather, raw: Arc<str>) {
        // No subscribers is not an error.
        let _ = self.live.send(raw);

        match self.state.storm.update(
            &mut self.store,
            weather.storm_start,
            weather.storm_rainfall,
            weather.time,
        ) {
            Ok(StormTransition::Ended {
                conflicting: Some(_),
                ..
            }) => self.state.storm_warnings += 1,
            Ok(_) => {}
            Err(err) => error!(error = %err, "Failed to update storm"),
        }
    }

    fn handle_doppler_image(&mut self, image: DopplerImage) {
        if let Err(err) = self.store.save_doppler_image(&image) {
            error!(error = %err, time = %image.time, "Failed to store doppler image");
            return;
        }
        self.state.doppler_images_saved += 1;
        if let Some(storm) = self.state.storm.active_storm()
            && let Err(err) = self.store.add_storm_doppler_image(storm.start_time, image.time)
        {
            error!(error = %err, storm = %storm.start_time, "Failed to link doppler image to storm");
        }
    }

    fn summarize(&mut self, date: Date) {
        match summary::recompute_day(&mut self.store, date) {
            Ok(Some(computed)) => {
                self.state.summaries_computed += 1;
                debug!(date = %date, records = computed.record_count, "Daily summary stored");
            }
            Ok(None) => debug!(date = %date, "No records to summarize"),
            Err(err) => error!(date = %date, error = %err, "Failed to summarize day"),
        }
    }

    fn rebuild_summaries(&mut self) {
        let range = match (self.store.oldest_record_time(), self.store.newest_record_time()) {
            (Ok(Some(oldest)), Ok(Some(newest))) => (oldest.date(), newest.date()),
            (Ok(_), Ok(_)) => {
                info!("No historical records to summarize");
                return;
            }
            (Err(err), _) | (_, Err(err)) => {
                error!(error = %err, "Failed to read record range");
                return;
            }
        };
        let days = summary::days_between(range.0, range.1);
        info!(first = %range.0, last = %range.1, days = days.len(), "Rebuilding all daily summaries");
        for date in days {
            self.summarize(date);
        }
    }

    fn reset_on_failure(&mut self, what: &str, result: Result<(), StoreError>) {
        if let Err(err) = result {
            error!(error = %err, "Failed to store {what}");
            self.request_reset();
        }
    }

    fn request_reset(&mut self) {
        self.state.connection_resets += 1;
        self.connection.request_reset(self.origin);
    }

    fn publish_statistics(&self) {
        self.statistics
            .send_replace(self.state.snapshot(self.scheduler.pending_count()));
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::store::MemoryStore;
    use time::macros::{date, datetime};
    use time::{Duration as TimeDuration, PrimitiveDateTime};

    fn record(time: PrimitiveDateTime) -> HistoricalRecord {
        let mut record = HistoricalRecord::empty(time, TimeDuration::minutes(5));
        record.avg_outdoor_temperature = Some(10.0);
        record.high_outdoor_temperature = Some(12.0);
        record.low_outdoor_temperature = Some(8.0);
        record
    }

    fn start(store: MemoryStore) -> (EngineHandle, JoinHandle<MemoryStore>, ConnectionControl) {
        let connection = ConnectionControl::new();
        let (handle, worker) =
            spawn(store, EngineSettings::default(), connection.clone()).expect("engine starts");
        (handle, worker, connection)
    }

    async fn stop(handle: EngineHandle, worker: JoinHandle<MemoryStore>) -> MemoryStore {
        handle.shutdown();
        worker.await.expect("engine task")
    }

    #[tokio::test]
    async fn stores_batches_and_advances_cursor() {
        let (handle, worker, _) = start(MemoryStore::new());

        handle
            .submit_historical_batch(vec![
                record(datetime!(2024-01-05 10:00)),
                record(datetime!(2024-01-05 10:05)),
                record(datetime!(2024-01-05 10:10)),
            ])
            .expect("accepted");
        handle.barrier().await.expect("barrier");

        let statistics = handle.statistics();
        assert_eq!(statistics.last_saved_record_time, Some(datetime!(2024-01-05 10:10)));
        assert_eq!(statistics.records_saved, 3);
        assert_eq!(statistics.gaps_detected, 0);
        assert_eq!(statistics.pending_summaries, 1);

        let store = stop(handle, worker).await;
        assert_eq!(store.record_count(), 3);
    }

    #[tokio::test]
    async fn logged_gap_still_stores_batch() {
        let (handle, worker, connection) = start(MemoryStore::new());
        let mut resets = connection.subscribe();

        handle
            .submit_historical_batch(vec![
                record(datetime!(2024-01-05 10:00)),
                record(datetime!(2024-01-05 10:05)),
                record(datetime!(2024-01-05 10:10)),
            ])
            .expect("accepted");
        handle
            .submit_historical_batch(vec![record(datetime!(2024-01-05 10:20))])
            .expect("accepted");
        handle.barrier().await.expect("barrier");

        let statistics = handle.statistics();
        assert_eq!(statistics.gaps_detected, 1);
        assert_eq!(statistics.last_bad_record_time, Some(datetime!(2024-01-05 10:20)));
        assert_eq!(statistics.last_saved_record_time, Some(datetime!(2024-01-05 10:20)));
        assert!(!resets.has_changed().expect("control alive"));

        let store = stop(handle, worker).await;
        assert_eq!(store.record_count(), 4);
    }

    #[tokio::test]
    async fn reconnect_policy_drops_gapped_batch() {
        let connection = ConnectionControl::new();
        let mut resets = connection.subscribe();
        let settings = EngineSettings {
            gap_policy: GapPolicy::Reconnect,
            ..EngineSettings::default()
        };
        let (handle, worker) =
            spawn(MemoryStore::new(), settings, connection).expect("engine starts");

        handle
            .submit_historical_batch(vec![record(datetime!(2024-01-05 10:00))])
            .expect("accepted");
        handle
            .submit_historical_batch(vec![record(datetime!(2024-01-05 10:20))])
            .expect("accepted");
        handle.barrier().await.expect("barrier");

        let statistics = handle.statistics();
        assert_eq!(statistics.last_saved_record_time, Some(datetime!(2024-01-05 10:00)));
        assert_eq!(statistics.missing_data_count, 1);
        assert_eq!(statistics.batches_dropped, 1);
        assert_eq!(statistics.connection_resets, 1);
        assert!(resets.has_changed().expect("control alive"));

        let store = stop(handle, worker).await;
        assert_eq!(store.record_count(), 1);
    }

    #[tokio::test]
    async fn redelivered_records_are_skipped_under_either_policy() {
        for gap_policy in [GapPolicy::Log, GapPolicy::Reconnect] {
            let connection = ConnectionControl::new();
            let resets = connection.subscribe();
            let settings = EngineSettings {
                gap_policy,
                ..EngineSettings::default()
            };
            let (handle, worker) =
                spawn(MemoryStore::new(), settings, connection).expect("engine starts");

            handle
                .submit_historical_batch(vec![
                    record(datetime!(2024-01-05 10:00)),
                    record(datetime!(2024-01-05 10:05)),
                ])
                .expect("accepted");
            handle
                .submit_historical_batch(vec![
                    record(datetime!(2024-01-05 10:05)),
                    record(datetime!(2024-01-05 10:10)),
                ])
                .expect("accepted");
            handle
                .submit_historical_batch(vec![record(datetime!(2024-01-05 10:10))])
                .expect("accepted");
            handle.barrier().await.expect("barrier");

            let statistics = handle.statistics();
            assert_eq!(statistics.last_saved_record_time, Some(datetime!(2024-01-05 10:10)), "{gap_policy:?}");
            assert_eq!(statistics.records_skipped, 2, "{gap_policy:?}");
            assert_eq!(statistics.gaps_detected, 0, "{gap_policy:?}");
            assert_eq!(statistics.missing_data_count, 0, "{gap_policy:?}");
            assert_eq!(statistics.batches_dropped, 0, "{gap_policy:?}");
            assert_eq!(statistics.connection_resets, 0, "{gap_policy:?}");
            assert!(!resets.has_changed().expect("control alive"));

            let store = stop(handle, worker).await;
            assert_eq!(store.record_count(), 3);
        }
    }

    #[tokio::test]
    async fn logged_gaps_count_until_a_clean_batch() {
        let (handle, worker, _) = start(MemoryStore::new());

        for time in [
            datetime!(2024-01-05 10:00),
            datetime!(2024-01-05 10:20),
            datetime!(2024-01-05 10:40),
        ] {
            handle.submit_historical_batch(vec![record(time)]).expect("accepted");
        }
        handle.barrier().await.expect("barrier");

        let statistics = handle.statistics();
        assert_eq!(statistics.missing_data_count, 2);
        assert_eq!(statistics.gaps_detected, 2);
        assert_eq!(statistics.last_saved_record_time, Some(datetime!(2024-01-05 10:40)));

        handle
            .submit_historical_batch(vec![record(datetime!(2024-01-05 10:45))])
            .expect("accepted");
        handle.barrier().await.expect("barrier");

        let statistics = handle.statistics();
        assert_eq!(statistics.missing_data_count, 0);
        assert_eq!(statistics.last_bad_record_time, Some(datetime!(2024-01-05 10:40)));

        let store = stop(handle, worker).await;
        assert_eq!(store.record_count(), 4);
    }

    #[tokio::test]
    async fn persistent_gap_is_stored_after_max_resets() {
        let connection = ConnectionControl::new();
        let settings = EngineSettings {
            gap_policy: GapPolicy::Reconnect,
            max_gap_resets: 2,
            ..EngineSettings::default()
        };
        let (handle, worker) =
            spawn(MemoryStore::new(), settings, connection.clone()).expect("engine starts");

        handle
            .submit_historical_batch(vec![record(datetime!(2024-01-05 10:00))])
            .expect("accepted");
        for _ in 0..3 {
            handle
                .submit_historical_batch(vec![record(datetime!(2024-01-05 10:20))])
                .expect("accepted");
        }
        handle.barrier().await.expect("barrier");

        let statistics = handle.statistics();
        assert_eq!(statistics.connection_resets, 2);
        assert_eq!(connection.resets_requested(), 2);
        assert_eq!(statistics.batches_dropped, 2);
        assert_eq!(statistics.missing_data_count, 3);
        assert_eq!(statistics.last_saved_record_time, Some(datetime!(2024-01-05 10:20)));

        // A fresh gap gets the full number of resets again.
        handle
            .submit_historical_batch(vec![record(datetime!(2024-01-05 10:40))])
            .expect("accepted");
        handle.barrier().await.expect("barrier");
        assert_eq!(handle.statistics().connection_resets, 3);

        let store = stop(handle, worker).await;
        assert_eq!(store.record_count(), 2);
    }

    #[tokio::test]
    async fn reset_targets_the_connection_that_sent_the_command() {
        let store = MemoryStore::new();
        let fault = store.write_fault();
        let (handle, worker, connection) = start(store);
        let mut resets = connection.subscribe();

        fault.set(true);
        handle.for_connection(7).submit_sensors(Vec::new()).expect("accepted");
        handle.barrier().await.expect("barrier");
        assert!(resets.has_changed().expect("control alive"));
        assert_eq!(resets.borrow_and_update().target, Some(7));

        handle.submit_sensors(Vec::new()).expect("accepted");
        handle.barrier().await.expect("barrier");
        assert_eq!(resets.borrow_and_update().target, None);

        fault.set(false);
        let _ = stop(handle, worker).await;
    }

    #[tokio::test]
    async fn failed_write_leaves_cursor_in_place() {
        let store = MemoryStore::new();
        let fault = store.write_fault();
        let (handle, worker, _) = start(store);

        handle
            .submit_historical_batch(vec![record(datetime!(2024-01-05 10:00))])
            .expect("accepted");
        handle.barrier().await.expect("barrier");
        fault.set(true);
        handle
            .submit_historical_batch(vec![record(datetime!(2024-01-05 10:05))])
            .expect("accepted");
        handle.barrier().await.expect("barrier");

        let statistics = handle.statistics();
        assert_eq!(statistics.last_saved_record_time, Some(datetime!(2024-01-05 10:00)));
        assert_eq!(statistics.batches_dropped, 1);
        assert_eq!(statistics.pending_summaries, 1);

        fault.set(false);
        let store = stop(handle, worker).await;
        assert_eq!(store.record_count(), 1);
    }

    #[tokio::test]
    async fn failed_table_write_requests_reset() {
        let store = MemoryStore::new();
        let fault = store.write_fault();
        let (handle, worker, connection) = start(store);
        let mut resets = connection.subscribe();

        fault.set(true);
        handle.submit_sensors(Vec::new()).expect("accepted");
        handle.barrier().await.expect("barrier");

        assert!(resets.has_changed().expect("control alive"));
        assert_eq!(handle.statistics().connection_resets, 1);
        let _ = stop(handle, worker).await;
    }

    #[tokio::test]
    async fn station_parameters_without_station_request_reset() {
        let (handle, worker, _) = start(MemoryStore::new());

        handle
            .submit_station_parameters(WeatherStationParameters {
                manufacturer: "Davis".to_string(),
                model: "Vantage Pro2".to_string(),
                firmware_version: None,
                latitude: None,
                longitude: None,
                altitude: None,
                rainfall_season_start_month: None,
                extra: Default::default(),
            })
            .expect("accepted");
        handle.barrier().await.expect("barrier");

        assert_eq!(handle.statistics().connection_resets, 1);
        let _ = stop(handle, worker).await;
    }

    #[tokio::test]
    async fn current_weather_is_broadcast_and_starts_storm() {
        let (handle, worker, _) = start(MemoryStore::new());
        let mut live = handle.subscribe_current_weather();
        let weather = CurrentWeather {
            time: datetime!(2024-01-05 09:00),
            outdoor_temperature: Some(4.0),
            outdoor_humidity: None,
            indoor_temperature: None,
            wind_speed: None,
            wind_direction: None,
            baro_pressure: None,
            rain_rate: None,
            day_rainfall: None,
            storm_start: Some(date!(2024 - 01 - 05)),
            storm_rainfall: 0.1,
        };

        handle
            .submit_current_weather(weather, "{\"raw\":true}")
            .expect("accepted");
        handle.barrier().await.expect("barrier");

        assert_eq!(&*live.recv().await.expect("payload"), "{\"raw\":true}");
        let active = handle.statistics().active_storm.expect("storm active");
        assert_eq!(active.start_time, datetime!(2024-01-05 00:00));

        let store = stop(handle, worker).await;
        assert_eq!(store.storms().len(), 1);
    }

    #[tokio::test]
    async fn explicit_summarize_runs_immediately() {
        let mut store = MemoryStore::new();
        store
            .add_historical_records(&[
                record(datetime!(2024-01-04 23:55)),
                record(datetime!(2024-01-05 00:00)),
            ])
            .expect("seed");
        let (handle, worker, _) = start(store);
        // Catch-up may queue its summarize commands behind the first barrier.
        handle.barrier().await.expect("barrier");
        handle.barrier().await.expect("barrier");
        let after_catchup = handle.statistics().summaries_computed;

        handle
            .request_summarize(Some(date!(2024 - 01 - 05)))
            .expect("accepted");
        handle.barrier().await.expect("barrier");

        assert_eq!(after_catchup, 2);
        assert_eq!(handle.statistics().summaries_computed, 3);
        let store = stop(handle, worker).await;
        assert_eq!(store.summaries().len(), 2);
    }

    #[tokio::test]
    async fn commands_after_shutdown_are_rejected() {
        let (handle, worker, _) = start(MemoryStore::new());

        let _ = stop(handle.clone(), worker).await;

        assert!(!handle.is_accepting());
        assert_eq!(
            handle.submit_historical_batch(vec![record(datetime!(2024-01-05 10:00))]),
            Err(EngineError::Closed)
        );
        assert_eq!(handle.barrier().await, Err(EngineError::Closed));
    }
}
