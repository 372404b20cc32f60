use serde::{Deserialize, Serialize};

/// Engine-wide tunables. Every field has a serving default so a settings
/// file only needs to name what it overrides.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct Settings {
    /// Worker tasks draining the stream queue.
    pub num_workers: usize,
    /// Combiner tasks; partial results shard across them by group hash.
    pub num_combiners: usize,
    /// Max stream tuples pulled into one microbatch.
    pub batch_size: usize,
    /// Max milliseconds a worker waits for a batch to fill.
    pub max_wait_ms: u64,
    /// Physical size in bytes of each ring buffer.
    pub queue_size: usize,
    /// When set, INSERT blocks until every worker batch touching the rows
    /// has been combined.
    pub synchronous_stream_insert: bool,
    /// Default sliding-window step as a percent of window width, 1..=50.
    pub sliding_window_step_factor: u8,
    /// Sliding-window vacuum period.
    pub sw_vacuum_interval_ms: u64,
    /// Adhoc client heartbeat period.
    pub adhoc_heartbeat_ms: u64,
}

impl Default for Settings {
    fn default() -> Self {
        Self {
            num_workers: 1,
            num_combiners: 1,
            batch_size: 10_000,
            max_wait_ms: 10,
            queue_size: 1 << 20,
            synchronous_stream_insert: false,
            sliding_window_step_factor: 5,
            sw_vacuum_interval_ms: 1_000,
            adhoc_heartbeat_ms: 1_000,
        }
    }
}
