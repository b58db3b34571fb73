//! One-way notifications emitted by the core.
//!
//! Delivery never blocks the caller: listener errors and panics are logged and
//! ignored, and stream subscribers whose buffers are full miss the event.

use std::panic::{self, AssertUnwindSafe};
use std::sync::Arc;

use parking_lot::{Mutex, RwLock};
use tracing::{debug, warn};

use crate::exchange::RouteId;
use crate::provider::ExtensionKey;
use crate::stream::{EventSender, EventStream, SendRejection, StreamBuilder};

/// Something the core wants collaborators to know about.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Notification {
    BeanLoaded { id: String },
    DependencyDetected { extension: ExtensionKey, dependency: String },
    RouteTemplateLoading { route_id: RouteId },
    EndpointRegistering { uri: String },
    ReloadCompleted { source: String },
    ReloadFailed { source: String, error: String },
}

/// Callback receiving notifications.
pub trait Listener: Send + Sync {
    fn on_notification(&self, notification: &Notification) -> Result<(), String>;
}

impl<F> Listener for F
where
    F: Fn(&Notification) -> Result<(), String> + Send + Sync,
{
    fn on_notification(&self, notification: &Notification) -> Result<(), String> {
        self(notification)
    }
}

/// Fans notifications out to listeners and stream subscribers.
pub struct Notifier {
    listeners: RwLock<Vec<Arc<dyn Listener>>>,
    subscribers: Mutex<Vec<EventSender<Notification>>>,
    buffer: usize,
}

impl Notifier {
    pub fn new(buffer: usize) -> Self {
        Self {
            listeners: RwLock::new(Vec::new()),
            subscribers: Mutex::new(Vec::new()),
            buffer,
        }
    }

    pub fn add_listener(&self, listener: Arc<dyn Listener>) {
        self.listeners.write().push(listener);
    }

    /// Receive every notification emitted from now on.
    pub fn subscribe(&self) -> EventStream<Notification> {
        let (sender, stream) = StreamBuilder::new().buffer_size(self.buffer).build();
        self.subscribers.lock().push(sender);
        stream
    }

    pub fn notify(&self, notification: Notification) {
        let listeners = self.listeners.read().clone();
        for listener in listeners {
            let outcome =
                panic::catch_unwind(AssertUnwindSafe(|| listener.on_notification(&notification)));
            match outcome {
                Ok(Ok(())) => {}
                Ok(Err(error)) => warn!(?notification, %error, "listener failed"),
                Err(_) => warn!(?notification, "listener panicked"),
            }
        }

        self.subscribers
            .lock()
            .retain(|sender| match sender.try_send(notification.clone()) {
                Ok(()) => true,
                Err(SendRejection::Full) => {
                    debug!(?notification, "subscriber buffer full, notification dropped");
                    true
                }
                Err(SendRejection::Closed) => false,
            });
    }

    pub fn subscriber_count(&self) -> usize {
        self.subscribers.lock().len()
    }
}

impl Default for Notifier {
    fn default() -> Self {
        Self::new(100)
    }
}
