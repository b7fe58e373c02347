//! In-memory [`Transport`] for tests. Records subscriptions and publishes,
//! and can be scripted to fail. Also a [`LogCapture`] layer for asserting
//! on emitted log events.

use std::collections::VecDeque;
use std::fmt::{self, Write as _};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use rumqttc::QoS;
use tokio::sync::mpsc;
use tracing::field::{Field, Visit};
use tracing::subscriber::DefaultGuard;
use tracing::{Event, Level, Subscriber};
use tracing_subscriber::layer::{Context, Layer, SubscriberExt};

use crate::config::BrokerConfig;
use crate::mqtt::{InboundMessage, Transport, TransportError};

pub(crate) struct MockTransport {
    inbound: mpsc::Sender<InboundMessage>,
    /// Delivered on the next `process_pending`.
    pub(crate) script: VecDeque<InboundMessage>,
    pub(crate) connected: bool,
    pub(crate) fail_connect: bool,
    /// Fail this many upcoming publish calls.
    pub(crate) fail_publishes: usize,
    /// Drop the session after this many successful `process_pending` calls.
    pub(crate) drop_after: Option<usize>,
    pub(crate) connects: usize,
    pub(crate) disconnects: usize,
    pub(crate) processed: usize,
    pub(crate) publish_calls: usize,
    pub(crate) published: Vec<(String, String)>,
    pub(crate) last_options: Option<(QoS, bool)>,
    pub(crate) subscriptions: Vec<String>,
}

impl MockTransport {
    pub(crate) fn new() -> (Self, mpsc::Receiver<InboundMessage>) {
        let (tx, rx) = mpsc::channel(64);
        let t = Self {
            inbound: tx,
            script: VecDeque::new(),
            connected: false,
            fail_connect: false,
            fail_publishes: 0,
            drop_after: None,
            connects: 0,
            disconnects: 0,
            processed: 0,
            publish_calls: 0,
            published: Vec::new(),
            last_options: None,
            subscriptions: Vec::new(),
        };
        (t, rx)
    }

    pub(crate) fn connected() -> (Self, mpsc::Receiver<InboundMessage>) {
        let (mut t, rx) = Self::new();
        t.connected = true;
        (t, rx)
    }

    pub(crate) fn push(&mut self, topic: &str, payload: &str) {
        self.script.push_back(InboundMessage::new(topic, payload));
    }

    pub(crate) fn published_to(&self, topic: &str) -> Vec<&str> {
        self.published
            .iter()
            .filter(|(t, _)| t == topic)
            .map(|(_, p)| p.as_str())
            .collect()
    }
}

impl Transport for MockTransport {
    async fn connect(&mut self, _broker: &BrokerConfig) -> Result<(), TransportError> {
        self.connects += 1;
        if self.fail_connect {
            return Err(TransportError::Connect("connection refused".into()));
        }
        self.connected = true;
        Ok(())
    }

    async fn subscribe(&mut self, topic: &str, _qos: QoS) -> Result<(), TransportError> {
        if !self.connected {
            return Err(TransportError::NotConnected);
        }
        self.subscriptions.push(topic.to_string());
        Ok(())
    }

    async fn publish(
        &mut self,
        topic: &str,
        payload: &[u8],
        qos: QoS,
        retain: bool,
    ) -> Result<(), TransportError> {
        self.publish_calls += 1;
        self.last_options = Some((qos, retain));
        if !self.connected {
            return Err(TransportError::NotConnected);
        }
        if self.fail_publishes > 0 {
            self.fail_publishes -= 1;
            return Err(TransportError::Request("request queue full".into()));
        }
        self.published.push((
            topic.to_string(),
            String::from_utf8_lossy(payload).into_owned(),
        ));
        Ok(())
    }

    async fn process_pending(&mut self, _wait: Duration) -> Result<(), TransportError> {
        if !self.connected {
            return Err(TransportError::NotConnected);
        }
        if self.drop_after == Some(self.processed) {
            self.connected = false;
            return Err(TransportError::Disconnected("broker went away".into()));
        }
        self.processed += 1;
        while let Some(msg) = self.script.pop_front() {
            if let Err(e) = self.inbound.try_send(msg) {
                // Queue full: keep the message for the next call.
                self.script.push_front(e.into_inner());
                break;
            }
        }
        Ok(())
    }

    async fn disconnect(&mut self) {
        self.disconnects += 1;
        self.connected = false;
    }
}

// ---------------------------------------------------------------------------
// Log capture
// ---------------------------------------------------------------------------

/// One recorded event: its level and every field rendered as `name=value`.
#[derive(Debug, Clone)]
pub(crate) struct LoggedEvent {
    pub(crate) level: Level,
    pub(crate) fields: String,
}

/// Layer that keeps every event emitted while its subscriber is the
/// thread default.
#[derive(Clone, Default)]
pub(crate) struct LogCapture {
    events: Arc<Mutex<Vec<LoggedEvent>>>,
}

impl LogCapture {
    /// Install a capturing subscriber for the current thread until the
    /// returned guard drops. `#[tokio::test]` runs on the current thread.
    pub(crate) fn install() -> (Self, DefaultGuard) {
        let capture = Self::default();
        let subscriber = tracing_subscriber::registry().with(capture.clone());
        let guard = tracing::subscriber::set_default(subscriber);
        (capture, guard)
    }

    pub(crate) fn at(&self, level: Level) -> Vec<LoggedEvent> {
        self.events
            .lock()
            .map(|events| events.iter().filter(|e| e.level == level).cloned().collect())
            .unwrap_or_default()
    }
}

struct FieldWriter<'a>(&'a mut String);

impl Visit for FieldWriter<'_> {
    fn record_debug(&mut self, field: &Field, value: &dyn fmt::Debug) {
        if !self.0.is_empty() {
            self.0.push(' ');
        }
        let _ = write!(self.0, "{}={:?}", field.name(), value);
    }
}

impl<S: Subscriber> Layer<S> for LogCapture {
    fn on_event(&self, event: &Event<'_>, _ctx: Context<'_, S>) {
        let mut fields = String::new();
        event.record(&mut FieldWriter(&mut fields));
        if let Ok(mut events) = self.events.lock() {
            events.push(LoggedEvent {
                level: *event.metadata().level(),
                fields,
            });
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn scripted_messages_survive_a_full_inbound_queue() {
        let (mut t, mut rx) = MockTransport::connected();
        for i in 0..70 {
            t.push("hana/externo/senseclima/01/temperature", &i.to_string());
        }

        t.process_pending(Duration::ZERO).await.unwrap();
        let mut delivered = Vec::new();
        while let Ok(msg) = rx.try_recv() {
            delivered.push(msg);
        }
        assert_eq!(delivered.len(), 64);
        assert_eq!(t.script.len(), 6);

        t.process_pending(Duration::ZERO).await.unwrap();
        while let Ok(msg) = rx.try_recv() {
            delivered.push(msg);
        }
        assert_eq!(delivered.len(), 70);
        assert_eq!(delivered[64].payload, b"64".to_vec());
        assert!(t.script.is_empty());
    }
}
