//! Shared fixtures: a local HTTP server and trivial pipeline stages.
#![allow(dead_code)]

use std::collections::HashMap;
use std::sync::{Arc, Mutex};
use std::time::Duration;

use async_trait::async_trait;
use axum::extract::Query;
use axum::http::{StatusCode, header};
use axum::response::IntoResponse;
use axum::routing::get;
use axum::Router;
use pipeline::{Receiver, Sender, Stage};
use webmon::{Measurement, Message, Settings};

/// Settings shrunk so tests do not take wall-clock minutes.
pub fn fast_settings() -> Settings {
    Settings {
        min_poll_period_sec: 0,
        tick_period: Duration::from_millis(10),
        fetch_poll_window: Duration::from_millis(50),
        idle_sleep: Duration::from_millis(10),
        session_close_grace: Duration::from_millis(10),
        ..Settings::default()
    }
}

/// Start the fixture server on an ephemeral port; returns its base url.
pub async fn start_server() -> String {
    let app = Router::new()
        .route("/http200", get(http200))
        .route("/http404", get(http404))
        .route("/sleep", get(sleep))
        .route("/big", get(big))
        .route("/utf16", get(utf16));

    let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
    let address = listener.local_addr().unwrap();
    tokio::spawn(async move {
        axum::serve(listener, app).await.unwrap();
    });

    format!("http://{address}")
}

/// An address nothing listens on.
pub async fn refused_address() -> String {
    let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
    let address = listener.local_addr().unwrap();
    drop(listener);
    format!("http://{address}")
}

async fn http200() -> &'static str {
    "success"
}

async fn http404() -> impl IntoResponse {
    (StatusCode::NOT_FOUND, "missing")
}

async fn sleep(Query(params): Query<HashMap<String, String>>) -> &'static str {
    let ms: u64 = params.get("ms").and_then(|value| value.parse().ok()).unwrap_or(0);
    tokio::time::sleep(Duration::from_millis(ms)).await;
    "slept"
}

async fn big(Query(params): Query<HashMap<String, String>>) -> String {
    let bytes: usize = params.get("bytes").and_then(|value| value.parse().ok()).unwrap_or(0);
    "x".repeat(bytes)
}

async fn utf16(Query(params): Query<HashMap<String, String>>) -> impl IntoResponse {
    let body = params.get("body").cloned().unwrap_or_default();
    let encoded: Vec<u8> = body.encode_utf16().flat_map(u16::to_le_bytes).collect();
    ([(header::CONTENT_TYPE, "text/plain; charset=utf-16")], encoded)
}

/// Messages collected by a [`Store`] stage.
pub type Shared = Arc<Mutex<Vec<Message>>>;

/// Collects every message it sees.
pub struct Store {
    data: Shared,
}

impl Store {
    pub fn new() -> (Self, Shared) {
        let data = Arc::new(Mutex::new(Vec::new()));
        (Self { data: Arc::clone(&data) }, data)
    }
}

#[async_trait]
impl Stage<Message> for Store {
    fn name(&self) -> &'static str {
        "store"
    }

    async fn run(
        self: Box<Self>,
        mut source: Receiver<Message>,
        _sink: Sender<Message>,
    ) -> anyhow::Result<()> {
        loop {
            let message = source.take().await;
            if matches!(message, Message::Terminal) {
                return Ok(());
            }
            self.data.lock().unwrap().push(message);
        }
    }
}

/// Forwards messages after a fixed delay; simulates a slow stage.
pub struct Slow {
    delay: Duration,
}

impl Slow {
    pub fn new(delay: Duration) -> Self {
        Self { delay }
    }
}

#[async_trait]
impl Stage<Message> for Slow {
    fn name(&self) -> &'static str {
        "slow"
    }

    async fn run(
        self: Box<Self>,
        mut source: Receiver<Message>,
        sink: Sender<Message>,
    ) -> anyhow::Result<()> {
        loop {
            let message = source.take().await;
            if matches!(message, Message::Terminal) {
                return Ok(());
            }
            tokio::time::sleep(self.delay).await;
            sink.put(message);
        }
    }
}

/// Flatten stored messages into their measurements.
pub fn measurements(data: &Shared) -> Vec<Measurement> {
    data.lock()
        .unwrap()
        .iter()
        .filter_map(|message| match message {
            Message::Measurements(batch) => Some(batch.clone()),
            _ => None,
        })
        .flatten()
        .collect()
}
