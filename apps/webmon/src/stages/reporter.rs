use async_trait::async_trait;
use pipeline::{Receiver, Sender, Stage};

use crate::types::Message;

/// Log-only tail stage, used when no database is configured.
pub struct Reporter;

#[async_trait]
impl Stage<Message> for Reporter {
    fn name(&self) -> &'static str {
        "reporter"
    }

    async fn run(
        self: Box<Self>,
        mut source: Receiver<Message>,
        _sink: Sender<Message>,
    ) -> anyhow::Result<()> {
        loop {
            match source.take().await {
                Message::Terminal => return Ok(()),
                Message::Measurements(batch) => {
                    for measurement in &batch {
                        tracing::info!(
                            url = %measurement.url,
                            code = ?measurement.code,
                            status = %measurement.status,
                            response_time_ms = measurement.response_time_ms,
                            "measurement"
                        );
                    }
                }
                other => tracing::warn!("reporter ignoring unexpected message: {other:?}"),
            }
        }
    }
}
