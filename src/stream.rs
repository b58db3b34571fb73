//! Bounded async event streams.
//!
//! Used to fan notifications out to subscribers without letting a slow
//! subscriber hold up the core: producers only ever `try_send`.

use std::pin::Pin;

use futures_core::Stream;
use tokio::sync::mpsc;
use tokio_stream::wrappers::ReceiverStream;

/// Type alias for a boxed async stream of events.
pub type EventStream<T> = Pin<Box<dyn Stream<Item = T> + Send>>;

/// Why an event could not be queued.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SendRejection {
    /// The subscriber's buffer is full; the event was dropped.
    Full,
    /// The subscriber went away.
    Closed,
}

/// Producer half of an event stream.
#[derive(Debug)]
pub struct EventSender<T> {
    tx: mpsc::Sender<T>,
}

impl<T> EventSender<T> {
    pub fn new(tx: mpsc::Sender<T>) -> Self {
        Self { tx }
    }

    /// Queue an event without waiting.
    pub fn try_send(&self, event: T) -> Result<(), SendRejection> {
        self.tx.try_send(event).map_err(|e| match e {
            mpsc::error::TrySendError::Full(_) => SendRejection::Full,
            mpsc::error::TrySendError::Closed(_) => SendRejection::Closed,
        })
    }

    /// Check if the receiver has been dropped.
    pub fn is_closed(&self) -> bool {
        self.tx.is_closed()
    }
}

impl<T> Clone for EventSender<T> {
    fn clone(&self) -> Self {
        Self {
            tx: self.tx.clone(),
        }
    }
}

/// Builder for creating event streams.
pub struct StreamBuilder<T> {
    buffer_size: usize,
    _marker: std::marker::PhantomData<T>,
}

impl<T: Send + 'static> StreamBuilder<T> {
    /// Create a new stream builder with a buffer of 100 events.
    pub fn new() -> Self {
        Self {
            buffer_size: 100,
            _marker: std::marker::PhantomData,
        }
    }

    pub fn buffer_size(mut self, size: usize) -> Self {
        self.buffer_size = size.max(1);
        self
    }

    /// Build the stream and sender.
    pub fn build(self) -> (EventSender<T>, EventStream<T>) {
        let (tx, rx) = mpsc::channel(self.buffer_size);
        let sender = EventSender::new(tx);
        let stream: EventStream<T> = Box::pin(ReceiverStream::new(rx));
        (sender, stream)
    }
}

impl<T: Send + 'static> Default for StreamBuilder<T> {
    fn default() -> Self {
        Self::new()
    }
}
