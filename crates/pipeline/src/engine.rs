use async_trait::async_trait;
use thiserror::Error;
use tokio::task::JoinHandle;

use crate::queue::{queue, Receiver, Sender, Sentinel};

#[derive(Debug, Error)]
pub enum PipelineError {
    #[error("unable to create an empty pipeline")]
    Empty,
}

/// One processing stage of a pipeline.
///
/// A stage reads messages from `source` until it takes the terminal value,
/// writes its results to `sink`, and returns. It must not forward the
/// terminal value itself; the engine does that once the stage has exited,
/// whether it returned `Ok` or `Err`.
#[async_trait]
pub trait Stage<M: Sentinel>: Send + 'static {
    /// Name used in worker logs.
    fn name(&self) -> &'static str {
        "stage"
    }

    async fn run(self: Box<Self>, source: Receiver<M>, sink: Sender<M>) -> anyhow::Result<()>;
}

/// An ordered chain of stages connected by queues.
///
/// N stages run over N+1 queues: the first queue is the external control
/// input, the last is a drain for whatever the final stage emits. Each
/// stage runs on its own tokio task.
pub struct Pipeline<M: Sentinel> {
    head: Sender<M>,
    tail: Option<Receiver<M>>,
    workers: Vec<JoinHandle<()>>,
}

impl<M: Sentinel> Pipeline<M> {
    /// Wire up the stages and start a worker task for each.
    pub fn build(stages: Vec<Box<dyn Stage<M>>>) -> Result<Self, PipelineError> {
        if stages.is_empty() {
            return Err(PipelineError::Empty);
        }

        let (head, mut source) = queue();
        let mut workers = Vec::with_capacity(stages.len());

        for stage in stages {
            let (sink, next_source) = queue();
            workers.push(Self::spawn(stage, source, sink));
            source = next_source;
        }

        Ok(Self { head, tail: Some(source), workers })
    }

    fn spawn(stage: Box<dyn Stage<M>>, source: Receiver<M>, sink: Sender<M>) -> JoinHandle<()> {
        tokio::spawn(async move {
            let name = stage.name();
            if let Err(error) = stage.run(source, sink.clone()).await {
                tracing::error!("stage {name} failed: {error:#}");
            }
            // A failed stage still signals the ones after it, so one bad
            // worker can never stall the rest of the chain.
            sink.put(M::terminal());
        })
    }

    /// Enqueue a message on the head queue.
    pub fn put(&self, message: M) -> &Self {
        self.head.put(message);
        self
    }

    /// A handle to the head queue, for feeding the pipeline from elsewhere.
    pub fn input(&self) -> Sender<M> {
        self.head.clone()
    }

    /// Take the tail receiver. Callers that want the final stage's output
    /// (tests, mostly) read it from here; otherwise it acts as a drain.
    pub fn drain(&mut self) -> Option<Receiver<M>> {
        self.tail.take()
    }

    /// Wait until every worker has exited.
    pub async fn wait(mut self) {
        for worker in self.workers.drain(..) {
            if let Err(error) = worker.await {
                tracing::error!("pipeline worker panicked: {error}");
            }
        }
    }

    /// Check for completion without waiting.
    pub fn try_wait(&self) -> bool {
        self.workers.iter().all(JoinHandle::is_finished)
    }
}
