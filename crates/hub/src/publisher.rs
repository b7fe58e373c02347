//! Retry-wrapped publishing: bounded attempts with linear, capped backoff.

use std::fmt;
use std::time::Duration;

use rumqttc::QoS;
use tracing::{error, warn};

use crate::config::PublishConfig;
use crate::mqtt::{qos_from_level, Transport, TransportError};

#[derive(Debug, Clone, PartialEq, Eq)]
pub(crate) enum PublishError {
    /// Empty topic or payload; nothing was sent.
    InvalidInput,
    /// Every attempt failed; carries the last transport failure.
    Exhausted {
        attempts: u32,
        last: TransportError,
    },
}

impl fmt::Display for PublishError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::InvalidInput => write!(f, "empty topic or payload"),
            Self::Exhausted { attempts, last } => {
                write!(f, "gave up after {attempts} attempts: {last}")
            }
        }
    }
}

impl std::error::Error for PublishError {}

#[derive(Debug, Clone)]
pub(crate) struct Publisher {
    max_retries: u32,
    backoff_step: Duration,
    backoff_cap: Duration,
    qos: QoS,
    retain: bool,
}

impl Publisher {
    pub(crate) fn new(cfg: &PublishConfig) -> Self {
        Self {
            max_retries: cfg.max_retries.max(1),
            backoff_step: Duration::from_millis(cfg.backoff_step_ms),
            backoff_cap: Duration::from_millis(cfg.backoff_cap_ms),
            qos: qos_from_level(cfg.qos).unwrap_or(QoS::AtMostOnce),
            retain: cfg.retain,
        }
    }

    /// Delay after failed attempt number `attempt` (1-based).
    pub(crate) fn backoff(&self, attempt: u32) -> Duration {
        (self.backoff_step * attempt).min(self.backoff_cap)
    }

    /// Publish with the configured QoS and retain flag.
    pub(crate) async fn send<T: Transport>(
        &self,
        transport: &mut T,
        topic: &str,
        payload: &[u8],
    ) -> Result<(), PublishError> {
        self.publish(transport, topic, payload, self.qos, self.retain)
            .await
    }

    /// Try up to `max_retries` times, sleeping between failed attempts.
    /// Returns on the first success; on exhaustion logs one error naming the
    /// topic and attempt count and returns the last failure.
    pub(crate) async fn publish<T: Transport>(
        &self,
        transport: &mut T,
        topic: &str,
        payload: &[u8],
        qos: QoS,
        retain: bool,
    ) -> Result<(), PublishError> {
        if topic.is_empty() || payload.is_empty() {
            return Err(PublishError::InvalidInput);
        }

        let mut last = TransportError::NotConnected;
        for attempt in 1..=self.max_retries {
            match transport.publish(topic, payload, qos, retain).await {
                Ok(()) => return Ok(()),
                Err(e) => {
                    warn!(topic, attempt, "publish attempt failed: {e}");
                    last = e;
                }
            }
            if attempt < self.max_retries {
                tokio::time::sleep(self.backoff(attempt)).await;
            }
        }

        error!(
            topic,
            attempts = self.max_retries,
            "publish failed after {} attempts: {last}",
            self.max_retries
        );
        Err(PublishError::Exhausted {
            attempts: self.max_retries,
            last,
        })
    }
}

// ===========================================================================
// Tests
// ===========================================================================
