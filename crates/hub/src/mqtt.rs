use std::fmt;
use std::time::Duration;

use rumqttc::{AsyncClient, Event, EventLoop, MqttOptions, Packet, QoS};
use tokio::sync::mpsc;
use tokio::time::{timeout, Instant};
use tracing::{debug, warn};

use crate::config::BrokerConfig;
use crate::state::{DoorState, Switch};

// ---------------------------------------------------------------------------
// Inbound message
// ---------------------------------------------------------------------------

/// Raw message as delivered by the broker, before routing.
#[derive(Debug, Clone, PartialEq, Eq)]
pub(crate) struct InboundMessage {
    pub(crate) topic: String,
    pub(crate) payload: Vec<u8>,
}

impl InboundMessage {
    pub(crate) fn new(topic: impl Into<String>, payload: impl Into<Vec<u8>>) -> Self {
        Self {
            topic: topic.into(),
            payload: payload.into(),
        }
    }
}

// ---------------------------------------------------------------------------
// Payload helpers
// ---------------------------------------------------------------------------

/// Decode a decimal sensor payload.
///
/// Accepts an optional leading `-`, then digits with at most one `.`; parsing
/// stops at the first other character. Anything unparseable decodes to `0.0`.
pub(crate) fn parse_decimal(payload: &[u8]) -> f32 {
    let s = String::from_utf8_lossy(payload);
    let s = s.trim();
    let (sign, digits) = match s.strip_prefix('-') {
        Some(rest) => (-1.0, rest),
        None => (1.0, s),
    };

    let mut seen_point = false;
    let end = digits
        .char_indices()
        .find(|&(_, c)| {
            if c == '.' && !seen_point {
                seen_point = true;
                false
            } else {
                !c.is_ascii_digit()
            }
        })
        .map_or(digits.len(), |(i, _)| i);

    let number = &digits[..end];
    if !number.bytes().any(|b| b.is_ascii_digit()) {
        return 0.0;
    }
    // A lone trailing point ("12.") is accepted by `f32::from_str`.
    number.parse::<f32>().map_or(0.0, |v| sign * v)
}

/// Parse an `ON`/`OFF` payload (case-insensitive, trims whitespace). Anything
/// other than `ON` reads as off.
pub(crate) fn parse_switch(payload: &[u8]) -> Switch {
    let s = String::from_utf8_lossy(payload);
    if s.trim().eq_ignore_ascii_case("ON") {
        Switch::On
    } else {
        Switch::Off
    }
}

/// Parse an `OPEN`/`CLOSED` payload. Unknown payloads yield `None`.
pub(crate) fn parse_door(payload: &[u8]) -> Option<DoorState> {
    let s = String::from_utf8_lossy(payload).trim().to_uppercase();
    match s.as_str() {
        "OPEN" => Some(DoorState::Open),
        "CLOSED" => Some(DoorState::Closed),
        _ => None,
    }
}

/// Map a numeric QoS level from config onto the client enum.
pub(crate) fn qos_from_level(level: u8) -> Option<QoS> {
    match level {
        0 => Some(QoS::AtMostOnce),
        1 => Some(QoS::AtLeastOnce),
        2 => Some(QoS::ExactlyOnce),
        _ => None,
    }
}

// ---------------------------------------------------------------------------
// Transport capability
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, PartialEq, Eq)]
pub(crate) enum TransportError {
    /// An operation was attempted without a live session.
    NotConnected,
    /// The broker could not be reached or refused the session.
    Connect(String),
    /// The client rejected a subscribe/publish request.
    Request(String),
    /// The session dropped while processing traffic.
    Disconnected(String),
}

impl fmt::Display for TransportError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::NotConnected => write!(f, "not connected"),
            Self::Connect(e) => write!(f, "connect failed: {e}"),
            Self::Request(e) => write!(f, "request rejected: {e}"),
            Self::Disconnected(e) => write!(f, "connection lost: {e}"),
        }
    }
}

impl std::error::Error for TransportError {}

/// The single broker connection shared by every environment.
///
/// Inbound messages are not returned from these calls; an implementation
/// forwards them into the channel it was built with while
/// [`process_pending`](Transport::process_pending) runs.
#[allow(async_fn_in_trait)]
pub(crate) trait Transport {
    async fn connect(&mut self, broker: &BrokerConfig) -> Result<(), TransportError>;

    async fn subscribe(&mut self, topic: &str, qos: QoS) -> Result<(), TransportError>;

    async fn publish(
        &mut self,
        topic: &str,
        payload: &[u8],
        qos: QoS,
        retain: bool,
    ) -> Result<(), TransportError>;

    /// Drive network I/O for at most `wait`, forwarding received messages.
    async fn process_pending(&mut self, wait: Duration) -> Result<(), TransportError>;

    async fn disconnect(&mut self);
}

// ---------------------------------------------------------------------------
// rumqttc implementation
// ---------------------------------------------------------------------------

/// How long a full request queue is driven before a subscribe is retried.
const SUBSCRIBE_FLUSH: Duration = Duration::from_millis(200);

struct Session {
    client: AsyncClient,
    eventloop: EventLoop,
}

/// [`Transport`] backed by a `rumqttc` client and event loop.
pub(crate) struct MqttTransport {
    inbound: mpsc::Sender<InboundMessage>,
    session: Option<Session>,
}

impl MqttTransport {
    pub(crate) fn new(inbound: mpsc::Sender<InboundMessage>) -> Self {
        Self {
            inbound,
            session: None,
        }
    }

    fn session(&mut self) -> Result<&mut Session, TransportError> {
        self.session.as_mut().ok_or(TransportError::NotConnected)
    }

    fn forward(&self, topic: String, payload: &[u8]) {
        let msg = InboundMessage::new(topic, payload);
        if let Err(e) = self.inbound.try_send(msg) {
            warn!("inbound queue rejected message: {e}");
        }
    }
}

impl Transport for MqttTransport {
    async fn connect(&mut self, broker: &BrokerConfig) -> Result<(), TransportError> {
        self.session = None;

        let mut options = MqttOptions::new(&broker.client_id, &broker.host, broker.port);
        options.set_keep_alive(Duration::from_secs(broker.keep_alive_sec));
        options.set_clean_session(true);
        if !broker.username.is_empty() {
            options.set_credentials(&broker.username, &broker.password);
        }

        let (client, mut eventloop) = AsyncClient::new(options, broker.channel_capacity);

        // The client connects lazily; drive the loop until CONNACK.
        let deadline = Instant::now() + Duration::from_secs(broker.connect_timeout_sec);
        loop {
            let remaining = deadline.saturating_duration_since(Instant::now());
            match timeout(remaining, eventloop.poll()).await {
                Ok(Ok(Event::Incoming(Packet::ConnAck(_)))) => break,
                Ok(Ok(_)) => {}
                Ok(Err(e)) => return Err(TransportError::Connect(e.to_string())),
                Err(_) => {
                    return Err(TransportError::Connect(format!(
                        "no CONNACK within {}s",
                        broker.connect_timeout_sec
                    )))
                }
            }
        }

        self.session = Some(Session { client, eventloop });
        Ok(())
    }

    async fn subscribe(&mut self, topic: &str, qos: QoS) -> Result<(), TransportError> {
        // Nothing drains the request queue between subscribes, so a full
        // queue is flushed through the event loop once before giving up.
        let mut flushed = false;
        loop {
            let attempt = self.session()?.client.try_subscribe(topic, qos);
            match attempt {
                Ok(()) => return Ok(()),
                Err(e) if flushed => return Err(TransportError::Request(e.to_string())),
                Err(_) => {
                    debug!(topic, "request queue full, flushing");
                    self.process_pending(SUBSCRIBE_FLUSH).await?;
                    flushed = true;
                }
            }
        }
    }

    async fn publish(
        &mut self,
        topic: &str,
        payload: &[u8],
        qos: QoS,
        retain: bool,
    ) -> Result<(), TransportError> {
        // Non-blocking: a full request queue is a failed attempt, not a stall.
        self.session()?
            .client
            .try_publish(topic, qos, retain, payload.to_vec())
            .map_err(|e| TransportError::Request(e.to_string()))
    }

    async fn process_pending(&mut self, wait: Duration) -> Result<(), TransportError> {
        let deadline = Instant::now() + wait;
        loop {
            let remaining = deadline.saturating_duration_since(Instant::now());
            let event = {
                let session = self.session()?;
                match timeout(remaining, session.eventloop.poll()).await {
                    Ok(event) => event,
                    Err(_) => return Ok(()),
                }
            };

            match event {
                Ok(Event::Incoming(Packet::Publish(p))) => {
                    debug!(topic = %p.topic, bytes = p.payload.len(), "mqtt message");
                    self.forward(p.topic, &p.payload);
                }
                Ok(Event::Incoming(Packet::Disconnect)) => {
                    self.session = None;
                    return Err(TransportError::Disconnected("broker sent DISCONNECT".into()));
                }
                Ok(_) => {}
                Err(e) => {
                    self.session = None;
                    return Err(TransportError::Disconnected(e.to_string()));
                }
            }
        }
    }

    async fn disconnect(&mut self) {
        if let Some(mut session) = self.session.take() {
            if session.client.try_disconnect().is_ok() {
                // Give the loop one short chance to flush the DISCONNECT.
                let _ = timeout(Duration::from_millis(100), session.eventloop.poll()).await;
            }
        }
    }
}

// ===========================================================================
// Tests
// ===========================================================================

#[cfg(test)]
mod tests {
    use super::*;

    // -- parse_decimal ----------------------------------------------------

    #[test]
    fn parse_decimal_plain() {
        assert!((parse_decimal(b"26.5") - 26.5).abs() < 1e-6);
        assert!((parse_decimal(b"29") - 29.0).abs() < 1e-6);
    }

    #[test]
    fn parse_decimal_negative() {
        assert!((parse_decimal(b"-3.25") + 3.25).abs() < 1e-6);
    }

    #[test]
    fn parse_decimal_stops_at_garbage() {
        assert!((parse_decimal(b"28.3C") - 28.3).abs() < 1e-5);
        assert!((parse_decimal(b"1.2.3") - 1.2).abs() < 1e-6);
    }

    #[test]
    fn parse_decimal_whitespace() {
        assert!((parse_decimal(b" 24.0\n") - 24.0).abs() < 1e-6);
    }

    #[test]
    fn parse_decimal_trailing_point() {
        assert!((parse_decimal(b"12.") - 12.0).abs() < 1e-6);
    }

    #[test]
    fn parse_decimal_malformed_is_zero() {
        assert_eq!(parse_decimal(b"abc"), 0.0);
        assert_eq!(parse_decimal(b""), 0.0);
        assert_eq!(parse_decimal(b"-"), 0.0);
        assert_eq!(parse_decimal(b"."), 0.0);
        assert_eq!(parse_decimal(&[0xff, 0xfe]), 0.0);
    }

    // -- parse_switch -------------------------------------------------------

    #[test]
    fn parse_switch_on() {
        assert_eq!(parse_switch(b"ON"), Switch::On);
        assert_eq!(parse_switch(b" on\n"), Switch::On);
    }

    #[test]
    fn parse_switch_everything_else_is_off() {
        assert_eq!(parse_switch(b"OFF"), Switch::Off);
        assert_eq!(parse_switch(b"TOGGLE"), Switch::Off);
        assert_eq!(parse_switch(b""), Switch::Off);
    }

    // -- parse_door ---------------------------------------------------------

    #[test]
    fn parse_door_states() {
        assert_eq!(parse_door(b"OPEN"), Some(DoorState::Open));
        assert_eq!(parse_door(b"closed"), Some(DoorState::Closed));
        assert_eq!(parse_door(b"AJAR"), None);
    }

    // -- qos_from_level -----------------------------------------------------

    #[test]
    fn qos_levels() {
        assert_eq!(qos_from_level(0), Some(QoS::AtMostOnce));
        assert_eq!(qos_from_level(1), Some(QoS::AtLeastOnce));
        assert_eq!(qos_from_level(2), Some(QoS::ExactlyOnce));
        assert_eq!(qos_from_level(3), None);
    }

    // -- MqttTransport with an unreachable broker ----------------------------

    /// A session whose event loop was never driven, pointed at a closed port.
    fn unreachable(capacity: usize) -> MqttTransport {
        let (tx, _rx) = mpsc::channel(4);
        let mut t = MqttTransport::new(tx);
        let options = MqttOptions::new("corehub-test", "127.0.0.1", 1);
        let (client, eventloop) = AsyncClient::new(options, capacity);
        t.session = Some(Session { client, eventloop });
        t
    }

    #[tokio::test]
    async fn subscribe_beyond_queue_capacity_fails_instead_of_blocking() {
        let mut t = unreachable(2);
        let env = crate::topics::EnvironmentTopics::new("mesanino");
        let topics = env.inbound();

        let results = timeout(Duration::from_secs(5), async {
            let mut results = Vec::new();
            for topic in &topics {
                results.push(t.subscribe(topic, QoS::AtMostOnce).await);
            }
            results
        })
        .await
        .expect("subscribe must not block on a full request queue");

        assert_eq!(results[..2], [Ok(()), Ok(())]);
        // The flush drives the loop, which cannot reach the broker, so the
        // overflowing subscribes are reported rather than awaited.
        assert!(results[2..].iter().all(|r| r.is_err()));
    }

    // -- MqttTransport without a session -------------------------------------

    #[tokio::test]
    async fn transport_requires_connection() {
        let (tx, _rx) = mpsc::channel(4);
        let mut t = MqttTransport::new(tx);
        assert_eq!(
            t.publish("hana/x/smartdoor/buzzer", b"ON", QoS::AtMostOnce, true)
                .await,
            Err(TransportError::NotConnected)
        );
        assert_eq!(
            t.subscribe("hana/x/smartdoor/door", QoS::AtMostOnce).await,
            Err(TransportError::NotConnected)
        );
        assert_eq!(
            t.process_pending(Duration::from_millis(1)).await,
            Err(TransportError::NotConnected)
        );
        // No-op without a session.
        t.disconnect().await;
    }
}
