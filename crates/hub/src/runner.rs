//! Executes one debounced FSM step for an environment and carries out its
//! effects against the transport.

use std::time::Duration;

use tokio::time::Instant;
use tracing::{debug, info, warn};

use crate::config::TimingConfig;
use crate::fsm::{transition, Effect, FsmState, Limits};
use crate::mqtt::Transport;
use crate::publisher::Publisher;
use crate::state::{Environment, Switch};

pub(crate) struct Runner {
    limits: Limits,
    debounce: Duration,
    exec_reset_bound: u32,
    publisher: Publisher,
}

impl Runner {
    pub(crate) fn new(limits: Limits, timing: &TimingConfig, publisher: Publisher) -> Self {
        Self {
            limits,
            debounce: Duration::from_millis(timing.debounce_ms),
            exec_reset_bound: timing.exec_reset_bound,
            publisher,
        }
    }

    /// Run one step for `env` unless the previous one was less than the
    /// debounce interval ago. Returns `true` if a step ran.
    pub(crate) async fn tick<T: Transport>(
        &self,
        env: &mut Environment,
        now: Instant,
        transport: &mut T,
    ) -> bool {
        if let Some(last) = env.watchdog.last_run {
            if now.saturating_duration_since(last) < self.debounce {
                return false;
            }
        }
        env.watchdog.last_run = Some(now);
        env.watchdog.exec_count = env.watchdog.exec_count.saturating_add(1);

        if env.watchdog.exec_count > self.exec_reset_bound {
            if env.watchdog.stuck {
                warn!(env = %env.name, state = %env.state, "stuck machine forced to reset");
                env.force_reset();
            } else {
                env.watchdog.exec_count = 0;
            }
        }

        let step = transition(env, now, &self.limits);
        if step.fault {
            warn!(
                env = %env.name,
                "alarm timer exceeded {}s, resetting",
                self.limits.alarm_overflow.as_secs()
            );
        }

        for effect in step.effects {
            self.apply(env, effect, now, transport).await;
        }

        if step.next != env.state {
            debug!(env = %env.name, from = %env.state, to = %step.next, "transition");
        }
        env.state = step.next;
        true
    }

    async fn apply<T: Transport>(
        &self,
        env: &mut Environment,
        effect: Effect,
        now: Instant,
        transport: &mut T,
    ) {
        match effect {
            Effect::TakeTemperature(t) => {
                env.temperature = t;
                env.pending_temperature.take();
                debug!(env = %env.name, temperature = t, "temperature");
            }
            Effect::TakeHumidity(h) => {
                env.humidity = h;
                env.pending_humidity.take();
                debug!(env = %env.name, humidity = h, "humidity");
            }
            Effect::Publish(command) => {
                let topic = command.topic(&env.topics);
                let payload = command.payload();
                // Failures are logged by the publisher; beliefs stay optimistic.
                if self
                    .publisher
                    .send(transport, topic, payload.as_bytes())
                    .await
                    .is_ok()
                {
                    debug!(env = %env.name, topic, payload = %payload, "published");
                }
            }
            Effect::SetAc(power) => {
                env.ac = power;
                info!(env = %env.name, temperature = env.temperature, "AC {}", power.as_payload());
            }
            Effect::ArmAlarm => {
                env.arm_alarm(now);
                info!(
                    env = %env.name,
                    "door open with light on, buzzer in {}s",
                    self.limits.alarm_timeout.as_secs()
                );
            }
            Effect::ClearAlarm => env.clear_alarm(),
            Effect::SetBuzzer(Switch::On) => {
                env.set_buzzer(true, now);
                info!(env = %env.name, "buzzer ON");
            }
            Effect::SetBuzzer(Switch::Off) => {
                let sounded = env
                    .buzzer_started_at()
                    .map(|t| now.saturating_duration_since(t).as_secs());
                env.set_buzzer(false, now);
                info!(env = %env.name, sounded_sec = ?sounded, "buzzer OFF");
            }
        }
    }
}

// ===========================================================================
// Tests
// ===========================================================================
