//! Build event definitions and dispatch.

use std::fmt;
use std::sync::Arc;
use std::time::{Duration, Instant};

use serde::Serialize;
use tokio::sync::broadcast;

/// Severity of a build log message.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum LogLevel {
    /// Failure.
    Error,
    /// Recoverable anomaly.
    Warn,
    /// Milestone shown to the user.
    Lifecycle,
    /// Informational.
    Info,
    /// Diagnostic detail.
    Debug,
}

/// Events emitted during a build.
#[derive(Debug, Clone, Serialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum BuildEvent {
    /// Work was completed on a progress allocation.
    Progress {
        /// Path of the allocation that advanced.
        allocation: String,
        /// Fraction of the whole build completed by this update.
        fraction: f64,
    },
    /// A log message.
    Log {
        /// Severity.
        level: LogLevel,
        /// Message text.
        message: String,
    },
    /// A step finished (successfully or not).
    Timer {
        /// Step description.
        description: String,
        /// Time the step took.
        elapsed: Duration,
    },
}

/// Receiver of build events.
pub trait EventSink: Send + Sync {
    /// Handle one event. Must not block.
    fn dispatch(&self, event: &BuildEvent);
}

/// Sink that drops everything.
#[derive(Debug, Clone, Copy, Default)]
pub struct NoopSink;

impl EventSink for NoopSink {
    fn dispatch(&self, _event: &BuildEvent) {}
}

/// Broadcast bus for build events.
#[derive(Debug, Clone)]
pub struct EventBus {
    sender: broadcast::Sender<BuildEvent>,
}

impl Default for EventBus {
    fn default() -> Self {
        let (sender, _) = broadcast::channel(1024);
        Self { sender }
    }
}

impl EventBus {
    /// Create a new event bus.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Subscribe to events.
    #[must_use]
    pub fn subscribe(&self) -> broadcast::Receiver<BuildEvent> {
        self.sender.subscribe()
    }
}

impl EventSink for EventBus {
    fn dispatch(&self, event: &BuildEvent) {
        // Ignore SendError (no subscribers)
        let _ = self.sender.send(event.clone());
    }
}

/// Fan-out of build events to every registered sink.
///
/// Log events are also forwarded to `tracing`.
#[derive(Clone, Default)]
pub struct EventHandlers {
    sinks: Vec<Arc<dyn EventSink>>,
}

impl fmt::Debug for EventHandlers {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("EventHandlers")
            .field("sinks", &self.sinks.len())
            .finish()
    }
}

impl EventHandlers {
    /// Handlers with no sinks.
    #[must_use]
    pub fn none() -> Self {
        Self::default()
    }

    /// Add a sink.
    #[must_use]
    pub fn with(mut self, sink: impl EventSink + 'static) -> Self {
        self.sinks.push(Arc::new(sink));
        self
    }

    /// Dispatch an event to every sink.
    pub fn dispatch(&self, event: &BuildEvent) {
        if let BuildEvent::Log { level, message } = event {
            match level {
                LogLevel::Error => tracing::error!("{message}"),
                LogLevel::Warn => tracing::warn!("{message}"),
                LogLevel::Lifecycle | LogLevel::Info => tracing::info!("{message}"),
                LogLevel::Debug => tracing::debug!("{message}"),
            }
        }
        for sink in &self.sinks {
            sink.dispatch(event);
        }
    }

    /// Emit a log event.
    pub fn log(&self, level: LogLevel, message: impl Into<String>) {
        self.dispatch(&BuildEvent::Log {
            level,
            message: message.into(),
        });
    }

    /// Emit a lifecycle message.
    pub fn lifecycle(&self, message: impl Into<String>) {
        self.log(LogLevel::Lifecycle, message);
    }

    /// Emit a warning.
    pub fn warn(&self, message: impl Into<String>) {
        self.log(LogLevel::Warn, message);
    }
}

/// Measures a step from creation until drop.
pub struct StepTimer {
    events: EventHandlers,
    description: String,
    start: Instant,
}

impl StepTimer {
    /// Start timing `description`.
    pub fn start(events: &EventHandlers, description: impl Into<String>) -> Self {
        Self {
            events: events.clone(),
            description: description.into(),
            start: Instant::now(),
        }
    }
}

impl Drop for StepTimer {
    fn drop(&mut self) {
        let elapsed = self.start.elapsed();
        tracing::debug!(step = %self.description, ?elapsed, "Step finished");
        self.events.dispatch(&BuildEvent::Timer {
            description: std::mem::take(&mut self.description),
            elapsed,
        });
    }
}

#[cfg(test)]
mod tests {
    use parking_lot::Mutex;

    use super::*;

    #[derive(Default)]
    struct Recorder(Mutex<Vec<BuildEvent>>);

    impl EventSink for Arc<Recorder> {
        fn dispatch(&self, event: &BuildEvent) {
            self.0.lock().push(event.clone());
        }
    }

    #[test]
    fn handlers_fan_out() {
        let first = Arc::new(Recorder::default());
        let second = Arc::new(Recorder::default());
        let handlers = EventHandlers::none()
            .with(Arc::clone(&first))
            .with(Arc::clone(&second));

        handlers.lifecycle("Building");
        assert_eq!(first.0.lock().len(), 1);
        assert_eq!(second.0.lock().len(), 1);
    }

    #[test]
    fn timer_reports_on_drop() {
        let recorder = Arc::new(Recorder::default());
        let handlers = EventHandlers::none().with(Arc::clone(&recorder));
        drop(StepTimer::start(&handlers, "pull base image"));

        let events = recorder.0.lock();
        assert!(matches!(
            &events[0],
            BuildEvent::Timer { description, .. } if description == "pull base image"
        ));
    }

    #[tokio::test]
    async fn bus_delivers_to_subscribers() {
        let bus = EventBus::new();
        let mut rx = bus.subscribe();
        EventHandlers::none().with(bus.clone()).warn("careful");

        match rx.recv().await.unwrap() {
            BuildEvent::Log { level, message } => {
                assert_eq!(level, LogLevel::Warn);
                assert_eq!(message, "careful");
            }
            other => panic!("unexpected event {other:?}"),
        }
    }

    #[test]
    fn events_serialize_tagged() {
        let json = serde_json::to_value(BuildEvent::Progress {
            allocation: "build".to_string(),
            fraction: 0.5,
        })
        .unwrap();
        assert_eq!(json["type"], "progress");
    }
}
