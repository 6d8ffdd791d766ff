use crate::model::Storm;
use crate::model::timefmt::device_time;
use crate::storm::StormTracker;
use serde::Serialize;
use time::PrimitiveDateTime;

/// Collector state. Lives on the engine task and is never shared; other
/// tasks see it only through [`CollectorStatistics`] snapshots.
#[derive(Debug, Default)]
pub struct CollectorState {
    pub last_saved_record_time: Option<PrimitiveDateTime>,
    /// Gapped batches seen since the last gap-free save.
    pub missing_data_count: u32,
    /// Batches dropped for a gap in a row; cleared by any stored batch.
    pub consecutive_gap_resets: u32,
    pub last_bad_record_time: Option<PrimitiveDateTime>,
    pub storm: StormTracker,
    pub gaps_detected: u64,
    pub records_saved: u64,
    pub records_skipped: u64,
    pub batches_dropped: u64,
    pub summaries_computed: u64,
    pub storm_warnings: u64,
    pub doppler_images_saved: u64,
    pub connection_resets: u64,
    pub commands_processed: u64,
}

impl CollectorState {
    pub fn snapshot(&self, pending_summaries: usize) -> CollectorStatistics {
        CollectorStatistics {
            last_saved_record_time: self.last_saved_record_time,
            missing_data_count: self.missing_data_count,
            last_bad_record_time: self.last_bad_record_time,
            active_storm: self.storm.active_storm(),
            gaps_detected: self.gaps_detected,
            records_saved: self.records_saved,
            records_skipped: self.records_skipped,
            batches_dropped: self.batches_dropped,
            summaries_computed: self.summaries_computed,
            pending_summaries,
            storm_warnings: self.storm_warnings,
            doppler_images_saved: self.doppler_images_saved,
            connection_resets: self.connection_resets,
            commands_processed: self.commands_processed,
        }
    }
}

#[derive(Debug, Clone, Default, PartialEq, Serialize)]
pub struct CollectorStatistics {
    #[serde(with = "device_time::option")]
    pub last_saved_record_time: Option<PrimitiveDateTime>,
    pub missing_data_count: u32,
    #[serde(with = "device_time::option")]
    pub last_bad_record_time: Option<PrimitiveDateTime>,
    pub active_storm: Option<Storm>,
    pub gaps_detected: u64,
    pub records_saved: u64,
    /// Redelivered records at or before the cursor.
    pub records_skipped: u64,
    pub batches_dropped: u64,
    pub summaries_computed: u64,
    pub pending_summaries: usize,
    pub storm_warnings: u64,
    pub doppler_images_saved: u64,
    pub connection_resets: u64,
    pub commands_processed: u64,
}
