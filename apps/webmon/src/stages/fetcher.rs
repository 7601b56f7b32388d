use std::collections::{HashMap, VecDeque};
use std::time::Duration;

use async_trait::async_trait;
use encoding_rs::Encoding;
use pipeline::{Receiver, Sender, Stage};
use reqwest::header::CONTENT_TYPE;
use reqwest::{Client, Response, redirect};
use tokio::task::JoinSet;
use tokio::time::{Instant, timeout};

use crate::settings::Settings;
use crate::types::{Measurement, Message, Target};

/// Status tag for a request that got a response.
pub const STATUS_COMPLETED: &str = "completed";
/// Status tag for a request that ran out its timeout.
pub const STATUS_TIMEOUT: &str = "timeout";
/// Status tag for a request that could not connect.
pub const STATUS_CONNECTION_ERROR: &str = "connectionerror";
/// Status tag for a TLS handshake or certificate failure.
pub const STATUS_SSL_ERROR: &str = "sslerror";
/// Status tag for everything else.
pub const STATUS_UNKNOWN_ERROR: &str = "unknownerror";

/// Pool of HTTP clients, one per timeout bucket.
///
/// A target's request timeout is its own polling interval capped at the
/// configured maximum, so with a 10 second cap the pool holds at most ten
/// clients. Connection reuse between requests is off: one slow host must
/// not hold a pooled connection hostage for unrelated targets. DNS answers
/// are cached.
struct SessionPool {
    settings: Settings,
    clients: HashMap<u64, Client>,
}

impl SessionPool {
    fn new(settings: Settings) -> Self {
        Self { settings, clients: HashMap::new() }
    }

    /// Construct or fetch the client for the target's timeout bucket.
    fn client(&mut self, target: &Target) -> reqwest::Result<Client> {
        let bucket = target.schedule.clamp(1, self.settings.max_connection_timeout_sec);
        if let Some(client) = self.clients.get(&bucket) {
            return Ok(client.clone());
        }

        let client = Client::builder()
            .timeout(Duration::from_secs(bucket))
            .redirect(redirect::Policy::none())
            .pool_max_idle_per_host(0)
            .hickory_dns(true)
            .build()?;
        self.clients.insert(bucket, client.clone());
        Ok(client)
    }

    /// Drop all clients and give the underlying transports a moment to
    /// finish closing their connections.
    async fn close(self) {
        let grace = self.settings.session_close_grace;
        drop(self.clients);
        tokio::time::sleep(grace).await;
    }
}

/// Middle stage: turns due-target batches into measurements with bounded
/// resource usage.
///
/// Admission control is the input side: the stage only drains its source
/// queue while `in_flight + backlog < max_connections`, so upstream
/// pressure accumulates in the queue where the scheduler can see it and
/// shed, instead of as unbounded spawned tasks here.
pub struct Fetcher {
    settings: Settings,
}

impl Fetcher {
    pub fn new(settings: Settings) -> Self {
        Self { settings }
    }
}

#[async_trait]
impl Stage<Message> for Fetcher {
    fn name(&self) -> &'static str {
        "fetcher"
    }

    async fn run(
        self: Box<Self>,
        mut source: Receiver<Message>,
        sink: Sender<Message>,
    ) -> anyhow::Result<()> {
        let settings = self.settings.clone();
        let mut pool = SessionPool::new(settings.clone());
        let mut backlog: VecDeque<Target> = VecDeque::new();
        let mut in_flight: JoinSet<Measurement> = JoinSet::new();
        let mut terminate = false;

        while !terminate {
            while backlog.len() + in_flight.len() < settings.max_connections {
                match source.try_take() {
                    Some(Message::Due(batch)) => backlog.extend(batch),
                    Some(Message::Terminal) => {
                        terminate = true;
                        break;
                    }
                    Some(other) => {
                        tracing::warn!("fetcher ignoring unexpected message: {other:?}");
                    }
                    None => break,
                }
            }

            let mut completed = launch(&mut backlog, &mut in_flight, &mut pool, &settings);

            if in_flight.is_empty() && completed.is_empty() {
                tokio::time::sleep(settings.idle_sleep).await;
                continue;
            }

            completed.extend(drain_completed(&mut in_flight, settings.fetch_poll_window).await);
            if !completed.is_empty() {
                sink.put(Message::Measurements(completed));
            }
        }

        // Shutdown: everything admitted still runs to completion, under the
        // same concurrency cap, before the terminal value moves on.
        let mut last = Vec::new();
        while !backlog.is_empty() || !in_flight.is_empty() {
            last.extend(launch(&mut backlog, &mut in_flight, &mut pool, &settings));
            match in_flight.join_next().await {
                Some(Ok(measurement)) => last.push(measurement),
                Some(Err(error)) => tracing::error!("fetch task failed: {error}"),
                None => {}
            }
        }
        if !last.is_empty() {
            sink.put(Message::Measurements(last));
        }

        pool.close().await;
        Ok(())
    }
}

/// Move targets from the backlog into flight while capacity allows.
///
/// A target whose client cannot even be constructed still yields a
/// measurement; time-to-failure telemetry applies to local failures too.
fn launch(
    backlog: &mut VecDeque<Target>,
    in_flight: &mut JoinSet<Measurement>,
    pool: &mut SessionPool,
    settings: &Settings,
) -> Vec<Measurement> {
    let mut failed = Vec::new();

    while in_flight.len() < settings.max_connections {
        let Some(target) = backlog.pop_front() else { break };
        match pool.client(&target) {
            Ok(client) => {
                let max_content_length = settings.max_content_length;
                in_flight.spawn(fetch_target(client, target, max_content_length));
            }
            Err(error) => {
                tracing::error!("failed to build an http client for {}: {error:#}", target.url);
                let mut measurement = Measurement::new(&target);
                measurement.push_status(STATUS_UNKNOWN_ERROR);
                failed.push(measurement);
            }
        }
    }

    failed
}

/// Collect finished requests for up to `window`, without waiting for the
/// whole cohort; slow targets never delay fast ones from being reported.
async fn drain_completed(in_flight: &mut JoinSet<Measurement>, window: Duration) -> Vec<Measurement> {
    let mut completed = Vec::new();
    let deadline = Instant::now() + window;

    loop {
        let remaining = deadline.saturating_duration_since(Instant::now());
        match timeout(remaining, in_flight.join_next()).await {
            Ok(Some(Ok(measurement))) => completed.push(measurement),
            Ok(Some(Err(error))) => tracing::error!("fetch task failed: {error}"),
            Ok(None) | Err(_) => break,
        }
    }

    completed
}

/// Issue one GET and classify the outcome. Every path, success or failure,
/// produces a measurement with the time spent.
async fn fetch_target(client: Client, target: Target, max_content_length: usize) -> Measurement {
    let mut measurement = Measurement::new(&target);
    let started = Instant::now();

    match client.get(&target.url).send().await {
        Ok(response) => {
            measurement.code = Some(response.status().as_u16());

            if target.regex.is_some() && is_textual(&response) {
                match read_body(response, max_content_length).await {
                    Ok(body) => {
                        measurement.body = Some(body);
                        measurement.push_status(STATUS_COMPLETED);
                    }
                    Err(error) => measurement.push_status(classify(&error)),
                }
            } else {
                measurement.push_status(STATUS_COMPLETED);
            }
        }
        Err(error) => measurement.push_status(classify(&error)),
    }

    measurement.response_time_ms = started.elapsed().as_millis() as u64;
    measurement
}

/// Whether the response declares itself as text worth matching against.
fn is_textual(response: &Response) -> bool {
    let Some(content_type) = content_type(response) else {
        return false;
    };
    content_type.starts_with("text/") || content_type.contains("charset=")
}

/// Read the response body, capped at `max_content_length` bytes.
///
/// Small bodies with a declared length come in one read; anything with an
/// unknown, oversized or lying `Content-Length` is streamed chunk by chunk
/// and cut off at exactly the cap.
async fn read_body(response: Response, max_content_length: usize) -> reqwest::Result<String> {
    let encoding = declared_encoding(&response);

    let direct = matches!(
        response.content_length(),
        Some(length) if (length as usize) < max_content_length
    );

    let data = if direct {
        response.bytes().await?.to_vec()
    } else {
        let mut response = response;
        let mut data: Vec<u8> = Vec::new();
        while let Some(chunk) = response.chunk().await? {
            let remaining = max_content_length - data.len();
            if chunk.len() >= remaining {
                data.extend_from_slice(&chunk[..remaining]);
                break;
            }
            data.extend_from_slice(&chunk);
        }
        data
    };

    let (text, _, _) = encoding.decode(&data);
    Ok(text.into_owned())
}

/// The encoding the response declares in its Content-Type, UTF-8 otherwise.
fn declared_encoding(response: &Response) -> &'static Encoding {
    content_type(response)
        .and_then(|content_type| {
            content_type
                .split(';')
                .find_map(|part| part.trim().strip_prefix("charset=").map(str::to_string))
        })
        .map(|label| label.trim_matches('"').to_string())
        .and_then(|label| Encoding::for_label(label.as_bytes()))
        .unwrap_or(encoding_rs::UTF_8)
}

fn content_type(response: &Response) -> Option<String> {
    response
        .headers()
        .get(CONTENT_TYPE)
        .and_then(|value| value.to_str().ok())
        .map(str::to_ascii_lowercase)
}

/// Map a transport error to a status tag.
pub fn classify(error: &reqwest::Error) -> &'static str {
    if error.is_timeout() {
        return STATUS_TIMEOUT;
    }
    if is_tls(error) {
        return STATUS_SSL_ERROR;
    }
    if error.is_connect() {
        return STATUS_CONNECTION_ERROR;
    }
    STATUS_UNKNOWN_ERROR
}

/// reqwest does not expose its TLS failure class; look for one down the
/// error chain.
fn is_tls(error: &reqwest::Error) -> bool {
    let mut source = std::error::Error::source(error);
    while let Some(inner) = source {
        let text = inner.to_string().to_ascii_lowercase();
        if text.contains("certificate") || text.contains("tls") || text.contains("ssl") {
            return true;
        }
        source = inner.source();
    }
    false
}
