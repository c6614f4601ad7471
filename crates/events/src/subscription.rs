//! The observer's end of a progress stream.

use tokio::sync::mpsc;
use tokio_stream::wrappers::ReceiverStream;

/// Bounded, ordered stream of events for one observer.
///
/// Ends (`recv` returns `None`) after the final event of a job, when the
/// broadcaster shuts down, or when the observer fell behind and was
/// dropped.
#[derive(Debug)]
pub struct Subscription<T> {
    rx: mpsc::Receiver<T>,
}

impl<T> Subscription<T> {
    pub(crate) fn new(rx: mpsc::Receiver<T>) -> Self {
        Self { rx }
    }

    /// A subscription that yields `item` once and then ends.
    pub fn once(item: T) -> Self {
        let (tx, rx) = mpsc::channel(1);
        // A fresh channel of capacity one always has room.
        let _ = tx.try_send(item);
        Self::new(rx)
    }

    pub async fn recv(&mut self) -> Option<T> {
        self.rx.recv().await
    }

    /// Next buffered event, without waiting.
    pub fn try_recv(&mut self) -> Option<T> {
        self.rx.try_recv().ok()
    }

    pub fn into_stream(self) -> ReceiverStream<T> {
        ReceiverStream::new(self.rx)
    }
}
