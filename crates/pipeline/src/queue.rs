use std::sync::Arc;
use std::sync::atomic::{AtomicUsize, Ordering};

use tokio::sync::mpsc;

/// Message types carried by a [`queue`] designate one value as terminal.
///
/// The terminal value is the end-of-stream marker: it is the only way to
/// tell a stage to stop reading, and every stage forwards it exactly once
/// on exit.
pub trait Sentinel: Send + 'static {
    fn terminal() -> Self;
    fn is_terminal(&self) -> bool;
}

/// Create a linked sender/receiver pair over an unbounded FIFO channel.
///
/// The pair shares an outstanding-depth counter so producers can check how
/// far behind the consumer is ([`Sender::depth`]) and shed load instead of
/// queueing without limit.
pub fn queue<M: Sentinel>() -> (Sender<M>, Receiver<M>) {
    let (tx, rx) = mpsc::unbounded_channel();
    let depth = Arc::new(AtomicUsize::new(0));
    (Sender { tx, depth: Arc::clone(&depth) }, Receiver { rx, depth })
}

/// Producing half of a queue.
pub struct Sender<M> {
    tx: mpsc::UnboundedSender<M>,
    depth: Arc<AtomicUsize>,
}

impl<M> Clone for Sender<M> {
    fn clone(&self) -> Self {
        Self { tx: self.tx.clone(), depth: Arc::clone(&self.depth) }
    }
}

impl<M: Sentinel> Sender<M> {
    /// Enqueue a message. A message to a dropped receiver is discarded.
    pub fn put(&self, message: M) {
        self.depth.fetch_add(1, Ordering::Relaxed);
        if self.tx.send(message).is_err() {
            self.depth.fetch_sub(1, Ordering::Relaxed);
        }
    }

    /// Number of messages put but not yet taken.
    pub fn depth(&self) -> usize {
        self.depth.load(Ordering::Relaxed)
    }
}

/// Consuming half of a queue.
pub struct Receiver<M> {
    rx: mpsc::UnboundedReceiver<M>,
    depth: Arc<AtomicUsize>,
}

impl<M: Sentinel> Receiver<M> {
    /// Wait for the next message.
    ///
    /// Yields the terminal value if every sender is gone, so a stage whose
    /// upstream died abnormally still unblocks and shuts down instead of
    /// stalling the rest of the chain.
    pub async fn take(&mut self) -> M {
        match self.rx.recv().await {
            Some(message) => {
                self.depth.fetch_sub(1, Ordering::Relaxed);
                message
            }
            None => M::terminal(),
        }
    }

    /// Dequeue without waiting; `None` when the queue is currently empty.
    pub fn try_take(&mut self) -> Option<M> {
        match self.rx.try_recv() {
            Ok(message) => {
                self.depth.fetch_sub(1, Ordering::Relaxed);
                Some(message)
            }
            Err(_) => None,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[derive(Debug, Clone, PartialEq)]
    enum Msg {
        Text(&'static str),
        Terminal,
    }

    impl Sentinel for Msg {
        fn terminal() -> Self {
            Msg::Terminal
        }

        fn is_terminal(&self) -> bool {
            matches!(self, Msg::Terminal)
        }
    }

    #[tokio::test]
    async fn fifo_order_and_depth() {
        let (tx, mut rx) = queue::<Msg>();

        tx.put(Msg::Text("a"));
        tx.put(Msg::Text("b"));
        assert_eq!(2, tx.depth());

        assert_eq!(Some(Msg::Text("a")), rx.try_take());
        assert_eq!(Msg::Text("b"), rx.take().await);
        assert_eq!(0, tx.depth());
        assert_eq!(None, rx.try_take());
    }

    #[tokio::test]
    async fn closed_queue_yields_terminal() {
        let (tx, mut rx) = queue::<Msg>();
        drop(tx);

        assert!(rx.take().await.is_terminal());
    }
}
