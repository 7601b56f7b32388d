use std::collections::HashMap;

use async_trait::async_trait;
use futures::future::join_all;
use pipeline::{Receiver, Sender, Stage};
use regex::Regex;

use crate::settings::Settings;
use crate::types::{Measurement, Message};

/// Status tag for a body that matched its target's pattern.
pub const STATUS_REGEX_OK: &str = "regexok";
/// Status tag for a body that did not match, or could not be evaluated.
pub const STATUS_REGEX_FAIL: &str = "regexfail";

/// Pass-through stage that applies per-target content patterns.
///
/// A measurement with a pattern and a body gets `regexok`/`regexfail`
/// appended; a pattern without a body is a failure, not a skip. Bodies are
/// dropped after evaluation in every case so nothing downstream ever holds
/// response content.
pub struct Validator {
    settings: Settings,
}

impl Validator {
    pub fn new(settings: Settings) -> Self {
        Self { settings }
    }

    /// Evaluate one batch. Large bodies are matched on the blocking pool
    /// so a pathological pattern cannot stall this stage's queue loop; the
    /// results are folded back into a single output batch.
    async fn validate_batch(
        &self,
        batch: Vec<Measurement>,
        cache: &mut HashMap<String, Option<Regex>>,
    ) -> Vec<Measurement> {
        let mut output = Vec::with_capacity(batch.len());
        let mut offloaded = Vec::new();

        for mut measurement in batch {
            match (measurement.regex.clone(), measurement.body.take()) {
                (Some(pattern), Some(body)) => {
                    let regex = compiled(cache, &pattern);
                    if body.len() >= self.settings.offload_body_bytes {
                        offloaded.push(tokio::task::spawn_blocking(move || {
                            let matched =
                                regex.as_ref().map(|regex| regex.is_match(&body)).unwrap_or(false);
                            (measurement, matched)
                        }));
                    } else {
                        let matched =
                            regex.as_ref().map(|regex| regex.is_match(&body)).unwrap_or(false);
                        push_verdict(&mut measurement, matched);
                        output.push(measurement);
                    }
                }
                (Some(_), None) => {
                    measurement.push_status(STATUS_REGEX_FAIL);
                    output.push(measurement);
                }
                (None, _) => output.push(measurement),
            }
        }

        for joined in join_all(offloaded).await {
            match joined {
                Ok((mut measurement, matched)) => {
                    push_verdict(&mut measurement, matched);
                    output.push(measurement);
                }
                Err(error) => tracing::error!("regex match task failed: {error}"),
            }
        }

        output
    }
}

fn push_verdict(measurement: &mut Measurement, matched: bool) {
    measurement.push_status(if matched { STATUS_REGEX_OK } else { STATUS_REGEX_FAIL });
}

/// Compile-once cache keyed by pattern text. A pattern that does not
/// compile is remembered as a permanent mismatch.
fn compiled(cache: &mut HashMap<String, Option<Regex>>, pattern: &str) -> Option<Regex> {
    if let Some(entry) = cache.get(pattern) {
        return entry.clone();
    }

    let regex = match Regex::new(pattern) {
        Ok(regex) => Some(regex),
        Err(error) => {
            tracing::warn!("invalid content pattern {pattern:?}: {error}");
            None
        }
    };
    cache.insert(pattern.to_string(), regex.clone());
    regex
}

#[async_trait]
impl Stage<Message> for Validator {
    fn name(&self) -> &'static str {
        "validator"
    }

    async fn run(
        self: Box<Self>,
        mut source: Receiver<Message>,
        sink: Sender<Message>,
    ) -> anyhow::Result<()> {
        let mut cache: HashMap<String, Option<Regex>> = HashMap::new();

        loop {
            match source.take().await {
                Message::Terminal => return Ok(()),
                Message::Measurements(batch) => {
                    let batch = self.validate_batch(batch, &mut cache).await;
                    sink.put(Message::Measurements(batch));
                }
                other => sink.put(other),
            }
        }
    }
}
