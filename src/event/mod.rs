//! Event system for session notifications.
//!
//! Telemetry updates, device log lines and session lifecycle changes are
//! broadcast to any number of subscribers. Slow subscribers skip events rather
//! than slowing down the receive path.

use std::sync::Arc;

use tokio::sync::broadcast;

use crate::abort::AbortReason;
use crate::logging::LogLevel;
use crate::telemetry::Snapshot;

/// Event types that can be dispatched.
#[derive(Debug, Clone)]
pub enum Event {
    /// Sockets bound and background tasks running.
    Connected,
    /// A hand telemetry frame was accepted.
    HandUpdated(Arc<Snapshot>),
    /// A tactile frame was accepted.
    TactileUpdated {
        /// Sensor serial number.
        serial: String,
        /// Updated snapshot.
        snapshot: Arc<Snapshot>,
    },
    /// A device sent a log line.
    DeviceLog {
        /// Originating device.
        device: String,
        /// Level, if the wire code was valid.
        level: Option<LogLevel>,
        /// Message text.
        message: String,
    },
    /// The watchdog fired.
    LivenessLost { ticks: u32 },
    /// An emergency abort ran.
    Aborted { reason: AbortReason },
    /// The session ended.
    Disconnected,
}

/// Event discriminant used for filtering.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum EventKind {
    /// [`Event::Connected`].
    Connected,
    /// [`Event::HandUpdated`].
    HandUpdated,
    /// [`Event::TactileUpdated`].
    TactileUpdated,
    /// [`Event::DeviceLog`].
    DeviceLog,
    /// [`Event::LivenessLost`].
    LivenessLost,
    /// [`Event::Aborted`].
    Aborted,
    /// [`Event::Disconnected`].
    Disconnected,
}

impl Event {
    /// Returns the event's kind.
    #[must_use]
    pub const fn kind(&self) -> EventKind {
        match self {
            Self::Connected => EventKind::Connected,
            Self::HandUpdated(_) => EventKind::HandUpdated,
            Self::TactileUpdated { .. } => EventKind::TactileUpdated,
            Self::DeviceLog { .. } => EventKind::DeviceLog,
            Self::LivenessLost { .. } => EventKind::LivenessLost,
            Self::Aborted { .. } => EventKind::Aborted,
            Self::Disconnected => EventKind::Disconnected,
        }
    }
}

/// A subscription to events.
pub struct Subscription {
    receiver: broadcast::Receiver<Event>,
    filter: Option<EventFilter>,
}

impl Subscription {
    /// Receives the next matching event.
    ///
    /// Returns `None` once the dispatcher is gone.
    pub async fn recv(&mut self) -> Option<Event> {
        loop {
            match self.receiver.recv().await {
                Ok(event) => {
                    if self.filter.as_ref().is_none_or(|f| f.matches(&event)) {
                        return Some(event);
                    }
                }
                Err(broadcast::error::RecvError::Lagged(skipped)) => {
                    tracing::debug!(skipped, "subscriber lagged, events skipped");
                }
                Err(broadcast::error::RecvError::Closed) => return None,
            }
        }
    }
}

/// Subscription filter for specific event kinds.
#[derive(Debug, Clone, Default)]
pub struct EventFilter {
    /// Accepted kinds. `None` accepts everything.
    pub kinds: Option<Vec<EventKind>>,
    /// Accepted tactile serial number.
    pub serial: Option<String>,
}

impl EventFilter {
    /// Creates a filter for specific event kinds.
    #[must_use]
    pub const fn kinds(kinds: Vec<EventKind>) -> Self {
        Self {
            kinds: Some(kinds),
            serial: None,
        }
    }

    /// Creates a filter for updates from one tactile sensor.
    #[must_use]
    pub fn tactile(serial: impl Into<String>) -> Self {
        Self {
            kinds: Some(vec![EventKind::TactileUpdated]),
            serial: Some(serial.into()),
        }
    }

    /// Checks if an event matches this filter.
    #[must_use]
    pub fn matches(&self, event: &Event) -> bool {
        if let Some(ref kinds) = self.kinds {
            if !kinds.contains(&event.kind()) {
                return false;
            }
        }

        if let Some(ref expected) = self.serial {
            match event {
                Event::TactileUpdated { serial, .. } => serial == expected,
                _ => false,
            }
        } else {
            true
        }
    }
}

/// Dispatches events to subscribers.
#[derive(Clone)]
pub struct EventDispatcher {
    sender: broadcast::Sender<Event>,
}

impl EventDispatcher {
    /// Creates a new event dispatcher.
    #[must_use]
    pub fn new(capacity: usize) -> Self {
        let (sender, _) = broadcast::channel(capacity);
        Self { sender }
    }

    /// Dispatches an event to all subscribers.
    pub fn dispatch(&self, event: Event) {
        // No subscribers is fine.
        let _ = self.sender.send(event);
    }

    /// Subscribes to events with an optional filter.
    #[must_use]
    pub fn subscribe(&self, filter: Option<EventFilter>) -> Subscription {
        Subscription {
            receiver: self.sender.subscribe(),
            filter,
        }
    }

    /// Waits for an event matching the filter with timeout.
    ///
    /// Returns `None` if the timeout expires or the dispatcher is gone.
    pub async fn wait_for(
        &self,
        filter: EventFilter,
        timeout: std::time::Duration,
    ) -> Option<Event> {
        let mut subscription = self.subscribe(Some(filter));
        tokio::time::timeout(timeout, subscription.recv())
            .await
            .ok()
            .flatten()
    }
}
