//! The single driving loop: owns the broker connection, feeds inbound
//! messages to the handler, runs the global watchdog and ticks every
//! environment's machine.
//!
//! ## Connection lifecycle
//!
//! ```text
//! connect ──ok──▶ subscribe all ──▶ settle ──▶ cycle ◀──┐
//!    ▲                                           │      │ all connected
//!    │                                           ├──────┘
//!    │                                           │ connection lost
//!    └──── backoff ◀──── disconnect ◀────────────┘
//!    ▲
//!    └──── backoff ◀──── connect failed
//! ```
//!
//! Retries are permanent; the loop never gives up.

use std::time::Duration;

use rumqttc::QoS;
use tokio::sync::mpsc;
use tokio::time::{sleep, Instant};
use tracing::{error, info, warn};

use crate::config::{BrokerConfig, Config, TimingConfig};
use crate::handler;
use crate::mqtt::{InboundMessage, Transport};
use crate::publisher::Publisher;
use crate::runner::Runner;
use crate::state::{EnvId, EnvironmentStore};

const SUBSCRIBE_QOS: QoS = QoS::AtMostOnce;

pub(crate) struct Scheduler<T: Transport> {
    transport: T,
    inbound: mpsc::Receiver<InboundMessage>,
    store: EnvironmentStore,
    runner: Runner,
    broker: BrokerConfig,
    timing: TimingConfig,
    started_at: Instant,
    last_watchdog_check: Instant,
    watchdog_checks: u32,
}

impl<T: Transport> Scheduler<T> {
    pub(crate) fn new(
        transport: T,
        inbound: mpsc::Receiver<InboundMessage>,
        store: EnvironmentStore,
        cfg: &Config,
    ) -> Self {
        let runner = Runner::new(
            cfg.control.limits(),
            &cfg.timing,
            Publisher::new(&cfg.publish),
        );
        let now = Instant::now();
        Self {
            transport,
            inbound,
            store,
            runner,
            broker: cfg.broker.clone(),
            timing: cfg.timing.clone(),
            started_at: now,
            last_watchdog_check: now,
            watchdog_checks: 0,
        }
    }

    /// Run forever.
    pub(crate) async fn run(&mut self) {
        info!(environments = self.store.len(), "scheduler started");
        loop {
            self.serve_once().await;
            info!(
                "reconnecting in {}s",
                self.timing.reconnect_backoff_sec
            );
            sleep(Duration::from_secs(self.timing.reconnect_backoff_sec)).await;
        }
    }

    /// One connection attempt and, if it succeeds, one session until the
    /// connection is lost.
    async fn serve_once(&mut self) {
        info!(host = %self.broker.host, port = self.broker.port, "connecting to broker");
        if let Err(e) = self.transport.connect(&self.broker).await {
            error!("broker connection failed: {e}");
            return;
        }
        info!("connected to broker");

        self.store.set_connected(true);
        self.subscribe_all().await;
        sleep(Duration::from_millis(self.timing.settle_ms)).await;

        self.session().await;

        info!("disconnecting from broker");
        self.transport.disconnect().await;
        self.store.set_connected(false);
    }

    async fn subscribe_all(&mut self) {
        let mut count = 0;
        for env in self.store.iter() {
            for topic in env.topics.inbound() {
                match self.transport.subscribe(topic, SUBSCRIBE_QOS).await {
                    Ok(()) => count += 1,
                    Err(e) => warn!(topic, "subscribe failed: {e}"),
                }
            }
        }
        info!(
            topics = count,
            environments = self.store.len(),
            "subscribed"
        );
    }

    async fn session(&mut self) {
        let interval = Duration::from_millis(self.timing.loop_interval_ms);
        loop {
            self.cycle(Instant::now()).await;
            if !self.store.all_connected() {
                warn!("broker connection lost");
                break;
            }
            sleep(interval).await;
        }
    }

    /// One pass: uptime, inbound traffic, watchdog, one tick per environment.
    pub(crate) async fn cycle(&mut self, now: Instant) {
        self.store
            .stamp_uptime(now.saturating_duration_since(self.started_at));

        let wait = Duration::from_millis(self.timing.process_timeout_ms);
        if let Err(e) = self.transport.process_pending(wait).await {
            warn!("mqtt: {e}");
            self.store.set_connected(false);
        }
        while let Ok(msg) = self.inbound.try_recv() {
            handler::handle(&mut self.store, &msg);
        }

        self.watchdog_check(now);

        let ids: Vec<EnvId> = self.store.ids().collect();
        for id in ids {
            let env = &mut self.store[id];
            if env.watchdog.stuck {
                warn!(env = %env.name, state = %env.state, "resetting stuck machine");
                env.force_reset();
            } else {
                self.runner.tick(env, now, &mut self.transport).await;
            }
        }
    }

    /// Flag machines whose execution counter ran past the stuck threshold,
    /// and log a heartbeat every `heartbeat_every` checks.
    fn watchdog_check(&mut self, now: Instant) {
        let interval = Duration::from_secs(self.timing.watchdog_interval_sec);
        if now.saturating_duration_since(self.last_watchdog_check) < interval {
            return;
        }
        self.last_watchdog_check = now;

        for env in self.store.iter_mut() {
            if env.watchdog.exec_count > self.timing.stuck_threshold {
                env.watchdog.stuck = true;
                warn!(
                    env = %env.name,
                    exec_count = env.watchdog.exec_count,
                    "watchdog: machine flagged as stuck"
                );
            }
        }

        self.watchdog_checks += 1;
        if self.watchdog_checks >= self.timing.heartbeat_every {
            self.watchdog_checks = 0;
            let states = self
                .store
                .iter()
                .map(|e| format!("{}={}", e.name, e.state))
                .collect::<Vec<_>>()
                .join(" ");
            info!(
                uptime_sec = now.saturating_duration_since(self.started_at).as_secs(),
                "health: {states}"
            );
        }
    }
}

// ===========================================================================
// Tests
// ===========================================================================

#[cfg(test)]
mod tests {
    use super::*;
    use crate::fsm::{FsmState, Trigger};
    use crate::mock::MockTransport;
    use crate::state::{DoorState, Switch};

    fn config() -> Config {
        let mut cfg: Config = crate::config::parse(include_str!("../config.toml")).unwrap();
        cfg.timing.settle_ms = 0;
        cfg.timing.loop_interval_ms = 0;
        cfg.publish.backoff_step_ms = 1;
        cfg.publish.backoff_cap_ms = 1;
        cfg
    }

    fn scheduler(transport: MockTransport, rx: mpsc::Receiver<InboundMessage>) -> Scheduler<MockTransport> {
        let cfg = config();
        let store = EnvironmentStore::new(&cfg.environment_names());
        Scheduler::new(transport, rx, store, &cfg)
    }

    fn secs(s: u64) -> Duration {
        Duration::from_secs(s)
    }

    // -- session lifecycle --------------------------------------------------

    #[tokio::test]
    async fn session_subscribes_and_ends_on_lost_connection() {
        let (mut t, rx) = MockTransport::new();
        t.drop_after = Some(3);
        let mut s = scheduler(t, rx);

        s.serve_once().await;

        assert_eq!(s.transport.connects, 1);
        assert_eq!(s.transport.subscriptions.len(), 15);
        assert!(s
            .transport
            .subscriptions
            .contains(&"hana/prototipagem/aircontrol/01/power".to_string()));
        assert_eq!(s.transport.processed, 3);
        assert_eq!(s.transport.disconnects, 1);
        assert!(!s.store.all_connected());
    }

    #[tokio::test]
    async fn failed_connect_skips_session() {
        let (mut t, rx) = MockTransport::new();
        t.fail_connect = true;
        let mut s = scheduler(t, rx);

        s.serve_once().await;

        assert_eq!(s.transport.connects, 1);
        assert!(s.transport.subscriptions.is_empty());
        assert_eq!(s.transport.processed, 0);
        assert!(!s.store.all_connected());
    }

    #[tokio::test]
    async fn processing_failure_marks_all_disconnected() {
        let (mut t, rx) = MockTransport::connected();
        t.drop_after = Some(0);
        let mut s = scheduler(t, rx);
        s.store.set_connected(true);

        s.cycle(s.started_at).await;
        assert!(!s.store.all_connected());
    }

    #[tokio::test]
    async fn cycle_stamps_uptime() {
        let (t, rx) = MockTransport::connected();
        let mut s = scheduler(t, rx);
        s.store.set_connected(true);

        s.cycle(s.started_at + secs(42)).await;
        assert!(s.store.iter().all(|e| e.uptime == secs(42)));
    }

    // -- inbound to actuators -----------------------------------------------

    #[tokio::test]
    async fn door_and_light_flow_through_alarm_to_ac() {
        let (t, rx) = MockTransport::connected();
        let mut s = scheduler(t, rx);
        s.store.set_connected(true);
        let id = s.store.find("mesanino").unwrap();
        let t0 = s.started_at;

        s.cycle(t0).await;
        s.cycle(t0 + secs(1)).await;
        assert_eq!(s.store[id].state, FsmState::Idle);

        s.transport.push("hana/mesanino/smartdoor/light", "ON");
        s.transport.push("hana/mesanino/smartdoor/door", "OPEN");
        s.cycle(t0 + secs(2)).await;
        assert_eq!(s.store[id].state, FsmState::AlarmLogic);
        s.cycle(t0 + secs(3)).await;
        assert_eq!(s.store[id].state, FsmState::WaitTimer);
        assert_eq!(s.store[id].alarm_started_at(), Some(t0 + secs(3)));

        // Closing the door pre-empts the timer.
        s.transport.push("hana/mesanino/smartdoor/door", "CLOSED");
        s.cycle(t0 + secs(4)).await;
        assert!(!s.store[id].alarm_active());
        assert_eq!(s.store[id].state, FsmState::AnalyzeDoor);

        s.cycle(t0 + secs(5)).await;
        assert_eq!(s.store[id].state, FsmState::AcOn(Trigger::DoorLight));
        s.cycle(t0 + secs(6)).await;
        assert_eq!(s.store[id].state, FsmState::Idle);
        assert_eq!(s.store[id].ac, Switch::On);
        assert_eq!(s.store[id].door, DoorState::Closed);

        assert_eq!(
            s.transport.published_to("hana/mesanino/aircontrol/01/power"),
            vec!["ON"]
        );
        assert_eq!(
            s.transport
                .published_to("hana/mesanino/aircontrol/01/temperature"),
            vec!["22"]
        );
        assert!(s
            .transport
            .published_to("hana/mesanino/smartdoor/buzzer")
            .is_empty());
        // Other environments saw nothing.
        assert_eq!(s.transport.published.len(), 2);
    }

    #[tokio::test]
    async fn temperature_is_consumed_by_next_tick() {
        let (t, rx) = MockTransport::connected();
        let mut s = scheduler(t, rx);
        s.store.set_connected(true);
        let id = s.store.find("externo").unwrap();
        let t0 = s.started_at;
        s.cycle(t0).await;
        s.cycle(t0 + secs(1)).await;

        s.transport.push("hana/externo/senseclima/01/temperature", "26.5");
        s.transport.push("hana/externo/senseclima/01/humidity", "55.0");
        s.cycle(t0 + secs(2)).await;
        assert!((s.store[id].temperature - 26.5).abs() < 1e-6);
        assert_eq!(s.store[id].humidity, 55.0);
        assert_eq!(s.store[id].pending_temperature.pending(), None);
        assert_eq!(s.store[id].state, FsmState::Idle);
    }

    // -- watchdog -----------------------------------------------------------

    #[tokio::test]
    async fn stuck_machine_is_reset_on_next_cycle() {
        let (t, rx) = MockTransport::connected();
        let mut s = scheduler(t, rx);
        s.store.set_connected(true);
        let id = s.store.find("prototipagem").unwrap();
        s.store[id].state = FsmState::WaitTimer;
        s.store[id].watchdog.exec_count = 501;

        s.cycle(s.started_at + secs(30)).await;

        let env = &s.store[id];
        assert_eq!(env.state, FsmState::Idle);
        assert_eq!(env.watchdog.exec_count, 0);
        assert!(!env.watchdog.stuck);
        assert_eq!(env.watchdog.last_run, None);
    }

    #[tokio::test]
    async fn alarm_armed_before_stuck_reset_still_sounds_buzzer() {
        let (t, rx) = MockTransport::connected();
        let mut s = scheduler(t, rx);
        s.store.set_connected(true);
        let id = s.store.find("mesanino").unwrap();
        let t0 = s.started_at;

        for i in 0..480 {
            s.cycle(t0 + secs(i)).await;
        }
        s.transport.push("hana/mesanino/smartdoor/light", "ON");
        s.transport.push("hana/mesanino/smartdoor/door", "OPEN");
        for i in 480..700 {
            s.cycle(t0 + secs(i)).await;
        }

        // The watchdog fired at 510s while the alarm was armed; the timer
        // was restarted rather than left dangling.
        let env = &s.store[id];
        assert!(env.alarm_started_at().unwrap() > t0 + secs(510));
        assert!(env.buzzer_on());
        assert_eq!(env.state, FsmState::Idle);
        assert_eq!(
            s.transport.published_to("hana/mesanino/smartdoor/buzzer"),
            vec!["ON"]
        );
    }

    #[tokio::test]
    async fn watchdog_respects_interval() {
        let (t, rx) = MockTransport::connected();
        let mut s = scheduler(t, rx);
        s.store[EnvId(0)].watchdog.exec_count = 900;

        s.watchdog_check(s.started_at + secs(29));
        assert!(!s.store[EnvId(0)].watchdog.stuck);
        assert_eq!(s.watchdog_checks, 0);

        s.watchdog_check(s.started_at + secs(30));
        assert!(s.store[EnvId(0)].watchdog.stuck);
        assert!(!s.store[EnvId(1)].watchdog.stuck);
        assert_eq!(s.watchdog_checks, 1);
    }

    #[tokio::test]
    async fn heartbeat_counter_wraps() {
        let (t, rx) = MockTransport::connected();
        let mut s = scheduler(t, rx);
        for n in 1..=10 {
            s.watchdog_check(s.started_at + secs(30 * n));
        }
        assert_eq!(s.watchdog_checks, 0);
        s.watchdog_check(s.started_at + secs(330));
        assert_eq!(s.watchdog_checks, 1);
    }
}
