//! Inbound datagram routing.
//!
//! Both receive loops hand every datagram to [`Router::handle`]. Envelopes are
//! dispatched by their `Type`: log lines go to the log sink, task updates to
//! the correlator, telemetry to the unpacker queue. A datagram that cannot be
//! routed is logged and dropped; it never affects anything else.

use std::net::SocketAddr;
use std::sync::Arc;

use tokio::sync::broadcast;

use crate::error::ProtocolError;
use crate::event::{Event, EventDispatcher};
use crate::logging::{LogLevel, LogSink};
use crate::protocol::{DataFrame, Device, DeviceMessage, Envelope};
use crate::task::TaskCorrelator;

/// Routes decoded envelopes to their consumers.
pub struct Router {
    correlator: Arc<TaskCorrelator>,
    telemetry: broadcast::Sender<DataFrame>,
    log: Arc<dyn LogSink>,
    dispatcher: EventDispatcher,
}

impl Router {
    /// Creates a router. Telemetry frames are pushed to `telemetry`, which
    /// drops the oldest frame when full.
    #[must_use]
    pub fn new(
        correlator: Arc<TaskCorrelator>,
        telemetry: broadcast::Sender<DataFrame>,
        log: Arc<dyn LogSink>,
        dispatcher: EventDispatcher,
    ) -> Self {
        Self {
            correlator,
            telemetry,
            log,
            dispatcher,
        }
    }

    /// Routes one datagram, logging and dropping it on error.
    pub fn handle(&self, datagram: &[u8], from: SocketAddr) {
        if let Err(e) = self.route(datagram) {
            tracing::warn!(%from, "dropping datagram: {e}");
        }
    }

    /// Routes one datagram.
    pub fn route(&self, datagram: &[u8]) -> Result<(), ProtocolError> {
        match Envelope::decode(datagram)? {
            Envelope::Message(message) => self.on_message(message),
            Envelope::Task(update) => {
                self.correlator.on_message(&update);
                Ok(())
            }
            Envelope::Data(frame) => {
                // Never blocks; with no consumer the frame is discarded.
                if self.telemetry.send(frame).is_err() {
                    tracing::trace!("no telemetry consumer, frame discarded");
                }
                Ok(())
            }
        }
    }

    fn on_message(&self, message: DeviceMessage) -> Result<(), ProtocolError> {
        if Device::from_name(&message.device).is_none() {
            return Err(ProtocolError::UnknownDevice(message.device));
        }
        self.log.log_code(
            message.level,
            &format!("{}: {}", message.device, message.message),
            true,
        );
        self.dispatcher.dispatch(Event::DeviceLog {
            level: LogLevel::from_code(message.level),
            device: message.device,
            message: message.message,
        });
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    use std::time::Duration;

    use crate::abort::AbortState;
    use crate::logging::tests::RecordingSink;
    use crate::protocol::{Outcome, TaskState};

    struct Fixture {
        router: Router,
        correlator: Arc<TaskCorrelator>,
        sink: Arc<RecordingSink>,
        frames: broadcast::Receiver<DataFrame>,
        dispatcher: EventDispatcher,
        _abort: AbortState,
    }

    fn fixture() -> Fixture {
        let abort = AbortState::new();
        let sink = Arc::new(RecordingSink::default());
        let correlator = Arc::new(TaskCorrelator::with_initial_id(&abort, sink.clone(), 0));
        let (tx, frames) = broadcast::channel(2);
        let dispatcher = EventDispatcher::new(8);
        let router = Router::new(Arc::clone(&correlator), tx, sink.clone(), dispatcher.clone());
        Fixture {
            router,
            correlator,
            sink,
            frames,
            dispatcher,
            _abort: abort,
        }
    }

    #[test]
    fn test_malformed_datagrams_dropped() {
        let f = fixture();
        assert!(matches!(f.router.route(b"\xff\x00garbage"), Err(ProtocolError::Decode(_))));
        assert!(f.router.route(br#"{"Type":"Bogus"}"#).is_err());
        assert!(f.router.route(br#"{"Device":"Hand","Msg":"no type"}"#).is_err());
        assert!(matches!(
            f.router.route(br#"{"Type":"Message","Device":"Arm","Msg":"hi","LogLevel":20}"#),
            Err(ProtocolError::UnknownDevice(_))
        ));
        assert!(f.sink.lines.lock().is_empty());
        assert_eq!(f.correlator.active_count(), 0);
    }

    #[tokio::test]
    async fn test_message_logged_and_dispatched() {
        let f = fixture();
        let mut sub = f.dispatcher.subscribe(None);
        f.router
            .route(br#"{"Type":"Message","Device":"Server","Msg":"ready","LogLevel":20}"#)
            .unwrap();

        assert_eq!(
            f.sink.lines.lock()[0],
            (LogLevel::Info, "Server: ready".to_owned(), true)
        );
        match sub.recv().await {
            Some(Event::DeviceLog { device, level, message }) => {
                assert_eq!(device, "Server");
                assert_eq!(level, Some(LogLevel::Info));
                assert_eq!(message, "ready");
            }
            other => panic!("Expected device log, got {other:?}"),
        }
    }

    #[tokio::test(start_paused = true)]
    async fn test_task_update_reaches_correlator() {
        let f = fixture();
        let mut pending = f.correlator.register(7);

        f.router
            .route(br#"{"Type":"Task","Device":"Hand","TaskID":7,"TaskInfo":2,"Msg":"started","LogLevel":20}"#)
            .unwrap();
        f.router
            .route(br#"{"Type":"Task","Device":"Hand","TaskID":7,"TaskInfo":5,"LogLevel":20}"#)
            .unwrap();

        assert_eq!(pending.completion(Duration::from_secs(1)).await, Outcome::Succeeded);
        assert_eq!(pending.record().state, TaskState::Succeed);
        assert_eq!(f.sink.lines.lock()[0].1, "Hand: started");
    }

    #[test]
    fn test_telemetry_queue_drops_oldest() {
        let mut f = fixture();
        for t in 1..=3 {
            let datagram = format!(r#"{{"Type":"Data","Device":"Hand","Time":{t},"Data":{{}}}}"#);
            f.router.route(datagram.as_bytes()).unwrap();
        }

        assert!(matches!(
            f.frames.try_recv(),
            Err(broadcast::error::TryRecvError::Lagged(1))
        ));
        let frame = f.frames.try_recv().unwrap();
        assert!((frame.time - 2.0).abs() < f64::EPSILON);
    }
}
