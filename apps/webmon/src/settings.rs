use std::time::Duration;

/// Tunables handed to every stage at construction.
///
/// One immutable value shared by clone; nothing reads these out of global
/// state, which keeps tests free to shrink the timings.
#[derive(Debug, Clone)]
pub struct Settings {
    /// Shortest polling interval a target may request, seconds.
    pub min_poll_period_sec: u64,
    /// Longest polling interval a target may request, seconds.
    pub max_poll_period_sec: u64,
    /// Scheduler evaluation period.
    pub tick_period: Duration,
    /// Cap on requests in flight plus requests queued inside the fetcher.
    pub max_connections: usize,
    /// New targets admitted per second; drives the reload jitter spread.
    pub max_connections_per_second: u32,
    /// Ceiling for a single request's total timeout, seconds.
    pub max_connection_timeout_sec: u64,
    /// Largest response body the fetcher will hold in memory, bytes.
    pub max_content_length: usize,
    /// How long the fetcher waits for completions before emitting a batch.
    pub fetch_poll_window: Duration,
    /// Fetcher sleep when it has nothing in flight.
    pub idle_sleep: Duration,
    /// Grace delay after closing HTTP sessions, lets transports drain.
    pub session_close_grace: Duration,
    /// Bodies at or above this size are matched on the blocking pool.
    pub offload_body_bytes: usize,
    /// Cap on rows buffered while the database is unreachable.
    pub max_db_records: usize,
    /// Concurrent insert tasks, also the connection pool size.
    pub insert_pool_size: usize,
    /// How long the sink refuses to retry a failed pool creation.
    pub db_cooldown: Duration,
    /// How long the sink waits on in-flight inserts per iteration.
    pub sink_poll_window: Duration,
    /// Minimum gap between database error reports.
    pub error_report_period: Duration,
}

impl Default for Settings {
    fn default() -> Self {
        Self {
            min_poll_period_sec: 5,
            max_poll_period_sec: 300,
            tick_period: Duration::from_millis(50),
            max_connections: 512,
            max_connections_per_second: 100,
            max_connection_timeout_sec: 10,
            max_content_length: 1 << 20,
            fetch_poll_window: Duration::from_millis(300),
            idle_sleep: Duration::from_millis(100),
            session_close_grace: Duration::from_millis(250),
            offload_body_bytes: 64 << 10,
            max_db_records: 10_000,
            insert_pool_size: 10,
            db_cooldown: Duration::from_secs(10),
            sink_poll_window: Duration::from_secs(1),
            error_report_period: Duration::from_secs(10),
        }
    }
}
