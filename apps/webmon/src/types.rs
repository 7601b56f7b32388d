use chrono::{DateTime, Utc};
use pipeline::Sentinel;
use serde::{Deserialize, Serialize};

/// One URL under watch: polling interval in seconds plus an optional
/// content pattern the response body must match.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Target {
    pub url: String,
    pub schedule: u64,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub regex: Option<String>,
}

/// Outcome of polling a single target once.
///
/// `status` is a comma-joined tag sequence ("completed,regexok"); tags are
/// appended as the measurement moves through the pipeline, never replaced.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Measurement {
    pub url: String,
    pub code: Option<u16>,
    pub status: String,
    pub ts: DateTime<Utc>,
    pub response_time_ms: u64,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub body: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub regex: Option<String>,
}

impl Measurement {
    pub fn new(target: &Target) -> Self {
        Self {
            url: target.url.clone(),
            code: None,
            status: String::new(),
            ts: Utc::now(),
            response_time_ms: 0,
            body: None,
            regex: target.regex.clone(),
        }
    }

    /// Append a tag to the status sequence.
    pub fn push_status(&mut self, tag: &str) {
        if !self.status.is_empty() {
            self.status.push(',');
        }
        self.status.push_str(tag);
    }
}

/// Everything that travels between pipeline stages.
#[derive(Debug, Clone)]
pub enum Message {
    /// Raw target entries from the control input, not yet validated.
    Reload(Vec<serde_json::Value>),
    /// Targets due for polling this tick.
    Due(Vec<Target>),
    /// Poll outcomes on their way to persistence.
    Measurements(Vec<Measurement>),
    /// End of input; propagates shutdown through the chain.
    Terminal,
}

impl Sentinel for Message {
    fn terminal() -> Self {
        Message::Terminal
    }

    fn is_terminal(&self) -> bool {
        matches!(self, Message::Terminal)
    }
}
