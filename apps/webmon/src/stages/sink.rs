use std::time::Duration;

use async_trait::async_trait;
use chrono::NaiveDateTime;
use deadpool_postgres::{Manager, ManagerConfig, Pool, RecyclingMethod};
use pipeline::{Receiver, Sender, Stage};
use tokio::task::JoinSet;
use tokio::time::{Instant, timeout};
use tokio_postgres::NoTls;
use tokio_postgres::config::SslMode;
use tokio_postgres::types::ToSql;

use crate::settings::Settings;
use crate::types::{Measurement, Message};

/// Database connection details: username, password, etc.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ConnectionDetails {
    pub user: String,
    pub password: String,
    pub database: String,
    pub host: String,
    pub port: u16,
    pub sslmode: String,
}

impl ConnectionDetails {
    pub fn new(user: &str, password: &str, database: &str, host: &str) -> Self {
        Self {
            user: user.to_string(),
            password: password.to_string(),
            database: database.to_string(),
            host: host.to_string(),
            port: 5432,
            sslmode: "require".to_string(),
        }
    }

    fn pg_config(&self) -> tokio_postgres::Config {
        let mut config = tokio_postgres::Config::new();
        config
            .user(&self.user)
            .password(&self.password)
            .dbname(&self.database)
            .host(&self.host)
            .port(self.port)
            .ssl_mode(match self.sslmode.as_str() {
                "disable" => SslMode::Disable,
                "prefer" => SslMode::Prefer,
                _ => SslMode::Require,
            });
        config
    }
}

const CREATE_TABLE: &str = "CREATE TABLE IF NOT EXISTS webmon (
    id SERIAL PRIMARY KEY,
    url VARCHAR(2000),
    code INT,
    status VARCHAR(255),
    timestamp TIMESTAMP,
    response_time INT)";

/// One measurement flattened into the column order of the webmon table.
#[derive(Debug, Clone, PartialEq)]
pub struct Row {
    url: String,
    code: Option<i32>,
    status: String,
    timestamp: NaiveDateTime,
    response_time: i32,
}

/// Convert a batch of measurements into rows ready for insertion.
pub fn convert_rows(batch: Vec<Measurement>) -> Vec<Row> {
    batch
        .into_iter()
        .map(|measurement| Row {
            url: measurement.url,
            code: measurement.code.map(i32::from),
            status: measurement.status,
            timestamp: measurement.ts.naive_utc(),
            response_time: measurement.response_time_ms.min(i32::MAX as u64) as i32,
        })
        .collect()
}

/// Drop the oldest entries once the pending buffer outgrows the cap; a
/// sustained backend outage costs the oldest data, never the process.
pub fn shed_excess(pending: &mut Vec<Row>, cap: usize) {
    if pending.len() > cap {
        let excess = pending.len() - cap;
        tracing::warn!(
            "too many measurements waiting for database insertion, removing the oldest {excess}"
        );
        pending.drain(..excess);
    }
}

/// Creates one connection pool and caches it; failed attempts are not
/// retried before a cool-down deadline passes.
struct PoolFactory {
    details: ConnectionDetails,
    settings: Settings,
    pool: Option<Pool>,
    next_attempt: Instant,
}

impl PoolFactory {
    fn new(details: ConnectionDetails, settings: Settings) -> Self {
        Self { details, settings, pool: None, next_attempt: Instant::now() }
    }

    async fn obtain(&mut self) -> Option<Pool> {
        if let Some(pool) = &self.pool {
            return Some(pool.clone());
        }

        if Instant::now() < self.next_attempt {
            return None;
        }

        match create_pool(&self.details, &self.settings).await {
            Ok(pool) => {
                self.pool = Some(pool.clone());
                Some(pool)
            }
            Err(error) => {
                let cooldown = self.settings.db_cooldown;
                tracing::error!(
                    "database misconfiguration or connection error: {error:#}; \
                     will attempt again in {} seconds",
                    cooldown.as_secs()
                );
                self.next_attempt = Instant::now() + cooldown;
                None
            }
        }
    }
}

/// Build the pool and prove it works: check a connection out and make sure
/// the measurement table exists before the pool is cached.
async fn create_pool(details: &ConnectionDetails, settings: &Settings) -> anyhow::Result<Pool> {
    let manager_config = ManagerConfig { recycling_method: RecyclingMethod::Fast };
    let manager = Manager::from_config(details.pg_config(), NoTls, manager_config);
    let pool = Pool::builder(manager).max_size(settings.insert_pool_size.max(1)).build()?;

    let client = pool.get().await?;
    client.batch_execute(CREATE_TABLE).await?;

    Ok(pool)
}

/// Write one buffer of rows as a single multi-row insert in a transaction.
/// The rows ride along in the error so a failed task can be requeued.
async fn insert_rows(pool: Pool, rows: Vec<Row>) -> Result<usize, (Vec<Row>, anyhow::Error)> {
    match try_insert(&pool, &rows).await {
        Ok(()) => Ok(rows.len()),
        Err(error) => Err((rows, error)),
    }
}

async fn try_insert(pool: &Pool, rows: &[Row]) -> anyhow::Result<()> {
    let mut client = pool.get().await?;
    let transaction = client.transaction().await?;

    let sql = insert_statement(rows.len());
    let mut params: Vec<&(dyn ToSql + Sync)> = Vec::with_capacity(rows.len() * 5);
    for row in rows {
        params.push(&row.url);
        params.push(&row.code);
        params.push(&row.status);
        params.push(&row.timestamp);
        params.push(&row.response_time);
    }

    transaction.execute(&sql, &params).await?;
    transaction.commit().await?;
    Ok(())
}

/// Multi-row VALUES statement for `count` rows of the webmon table.
fn insert_statement(count: usize) -> String {
    let mut sql =
        String::from("INSERT INTO webmon(url, code, status, timestamp, response_time) VALUES");
    for index in 0..count {
        if index > 0 {
            sql.push(',');
        }
        let base = index * 5;
        sql.push_str(&format!(
            " (${}, ${}, ${}, ${}, ${})",
            base + 1,
            base + 2,
            base + 3,
            base + 4,
            base + 5
        ));
    }
    sql
}

/// Accumulates insert failures and reports them at a bounded rate, so a
/// database that stays down produces one line per report period instead of
/// a log storm.
pub struct ErrorLog {
    count: u64,
    reported: u64,
    last_report: Option<Instant>,
    period: Duration,
}

impl ErrorLog {
    pub fn new(period: Duration) -> Self {
        Self { count: 0, reported: 0, last_report: None, period }
    }

    pub fn accumulate(&mut self) {
        self.count += 1;
    }

    /// Log the errors seen since the previous report, if the report period
    /// has passed. Returns whether a report was emitted.
    pub fn report(&mut self) -> bool {
        let due = match self.last_report {
            None => true,
            Some(at) => at.elapsed() >= self.period,
        };
        if self.count > self.reported && due {
            tracing::error!(
                "encountered a number of database errors: {}",
                self.count - self.reported
            );
            self.reported = self.count;
            self.last_report = Some(Instant::now());
            return true;
        }
        false
    }
}

/// Tail stage: batches measurements into the webmon table through a
/// reconnecting pool, shedding the oldest rows when the backend stays
/// unreachable for too long.
pub struct Sink {
    details: ConnectionDetails,
    settings: Settings,
}

impl Sink {
    pub fn new(details: ConnectionDetails, settings: Settings) -> Self {
        Self { details, settings }
    }
}

#[async_trait]
impl Stage<Message> for Sink {
    fn name(&self) -> &'static str {
        "sink"
    }

    async fn run(
        self: Box<Self>,
        mut source: Receiver<Message>,
        _sink: Sender<Message>,
    ) -> anyhow::Result<()> {
        let settings = self.settings.clone();
        let mut factory = PoolFactory::new(self.details, settings.clone());
        let mut pending: Vec<Row> = Vec::new();
        let mut errors = ErrorLog::new(settings.error_report_period);
        let mut tasks: JoinSet<Result<usize, (Vec<Row>, anyhow::Error)>> = JoinSet::new();
        let mut terminated = false;

        let mut pool = factory.obtain().await;

        while !terminated || !tasks.is_empty() || !pending.is_empty() {
            if pool.is_none() {
                if terminated {
                    if !pending.is_empty() {
                        tracing::warn!(
                            "shutting down without a database, discarding {} buffered rows",
                            pending.len()
                        );
                    }
                    break;
                }
                pool = factory.obtain().await;
            }

            if !terminated {
                terminated = drain_input(&mut source, &mut pending);
                shed_excess(&mut pending, settings.max_db_records);
            }

            if let Some(pool) = &pool {
                if !pending.is_empty() && tasks.len() < settings.insert_pool_size {
                    // the whole buffer goes out in one task and is cleared
                    // on handoff, so rows are never sent twice
                    let rows = std::mem::take(&mut pending);
                    let pool = pool.clone();
                    tasks.spawn(insert_rows(pool, rows));
                }
            }

            if tasks.is_empty() {
                tokio::time::sleep(settings.sink_poll_window).await;
                continue;
            }

            let failures = drain_inserts(&mut tasks, &mut errors, settings.sink_poll_window).await;
            for rows in failures {
                match &pool {
                    // buffered data is retried on transient failure, not dropped
                    Some(pool) => {
                        tasks.spawn(insert_rows(pool.clone(), rows));
                    }
                    None => pending.extend(rows),
                }
            }
            errors.report();
        }

        Ok(())
    }
}

/// Read everything currently waiting on the input queue. Returns whether
/// the terminal value was seen.
fn drain_input(source: &mut Receiver<Message>, pending: &mut Vec<Row>) -> bool {
    while let Some(message) = source.try_take() {
        match message {
            Message::Terminal => return true,
            Message::Measurements(batch) => pending.extend(convert_rows(batch)),
            other => tracing::warn!("sink ignoring unexpected message: {other:?}"),
        }
    }
    false
}

/// Poll in-flight insert tasks for up to `window`, collecting the rows of
/// any that failed. Failures are counted but reported elsewhere, at a
/// bounded rate.
async fn drain_inserts(
    tasks: &mut JoinSet<Result<usize, (Vec<Row>, anyhow::Error)>>,
    errors: &mut ErrorLog,
    window: Duration,
) -> Vec<Vec<Row>> {
    let mut failures = Vec::new();
    let deadline = Instant::now() + window;

    loop {
        let remaining = deadline.saturating_duration_since(Instant::now());
        match timeout(remaining, tasks.join_next()).await {
            Ok(Some(Ok(Ok(_)))) => {}
            Ok(Some(Ok(Err((rows, error))))) => {
                tracing::debug!("insert failed, requeueing {} rows: {error:#}", rows.len());
                errors.accumulate();
                failures.push(rows);
            }
            Ok(Some(Err(join_error))) => {
                tracing::error!("insert task failed: {join_error}");
                errors.accumulate();
            }
            Ok(None) | Err(_) => break,
        }
    }

    failures
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::{TimeZone, Utc};

    fn measurement(url: &str, code: Option<u16>, status: &str) -> Measurement {
        Measurement {
            url: url.to_string(),
            code,
            status: status.to_string(),
            ts: Utc.with_ymd_and_hms(2023, 7, 7, 5, 11, 36).unwrap(),
            response_time_ms: 10,
            body: None,
            regex: None,
        }
    }

    fn row(url: &str) -> Row {
        Row {
            url: url.to_string(),
            code: Some(200),
            status: "completed".to_string(),
            timestamp: Utc.with_ymd_and_hms(2023, 7, 7, 5, 11, 36).unwrap().naive_utc(),
            response_time: 10,
        }
    }

    #[test]
    fn conversion_keeps_column_values() {
        let rows = convert_rows(vec![
            measurement("http://acme.com", Some(200), "completed"),
            measurement("http://foo.com", None, "connectionerror"),
        ]);

        assert_eq!(2, rows.len());
        assert_eq!("http://acme.com", rows[0].url);
        assert_eq!(Some(200), rows[0].code);
        assert_eq!("completed", rows[0].status);
        assert_eq!(10, rows[0].response_time);
        assert_eq!(None, rows[1].code);
    }

    #[test]
    fn shed_keeps_the_newest_rows() {
        let mut pending: Vec<Row> = (0..15).map(|i| row(&format!("http://{i}"))).collect();
        shed_excess(&mut pending, 10);

        assert_eq!(10, pending.len());
        assert_eq!("http://5", pending[0].url);
        assert_eq!("http://14", pending[9].url);
    }

    #[test]
    fn shed_leaves_small_buffers_alone() {
        let mut pending = vec![row("http://acme.com")];
        shed_excess(&mut pending, 10);
        assert_eq!(1, pending.len());
    }

    #[test]
    fn error_reports_are_throttled() {
        let mut errors = ErrorLog::new(Duration::from_secs(600));

        assert!(!errors.report());

        errors.accumulate();
        errors.accumulate();
        assert!(errors.report());

        // more errors inside the report period stay quiet
        errors.accumulate();
        assert!(!errors.report());
    }

    #[test]
    fn connection_details_map_to_pg_config() {
        let mut details = ConnectionDetails::new("u", "p", "db", "h");
        details.port = 5433;
        let config = details.pg_config();

        assert_eq!(Some("u"), config.get_user());
        assert_eq!(Some("db"), config.get_dbname());
        assert_eq!(&[5433][..], config.get_ports());
    }

    #[test]
    fn insert_statement_is_one_multi_row_values_list() {
        let sql = insert_statement(2);
        assert_eq!(
            "INSERT INTO webmon(url, code, status, timestamp, response_time) VALUES \
             ($1, $2, $3, $4, $5), ($6, $7, $8, $9, $10)",
            sql
        );
    }
}
