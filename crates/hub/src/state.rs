use std::ops::{Index, IndexMut};
use std::time::Duration;

use tokio::time::Instant;

use crate::fsm::FsmState;
use crate::topics::{self, EnvironmentTopics, Field};

// ---------------------------------------------------------------------------
// Identity
// ---------------------------------------------------------------------------

/// Stable index of an environment inside the [`EnvironmentStore`].
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct EnvId(pub usize);

// ---------------------------------------------------------------------------
// Sensor / actuator values
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum DoorState {
    #[default]
    Closed,
    Open,
}

/// Two-position state shared by the light sensor and the AC power relay.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum Switch {
    #[default]
    Off,
    On,
}

impl Switch {
    pub fn is_on(self) -> bool {
        self == Switch::On
    }

    pub fn as_payload(self) -> &'static str {
        match self {
            Switch::On => "ON",
            Switch::Off => "OFF",
        }
    }
}

/// Latest value received for a sensor, waiting for the next tick.
#[derive(Debug, Clone, Copy, Default)]
pub struct Staged {
    value: f32,
    fresh: bool,
}

impl Staged {
    /// Overwrite the slot; an unconsumed older value is superseded.
    pub fn stage(&mut self, value: f32) {
        self.value = value;
        self.fresh = true;
    }

    /// Peek at the pending value without consuming it.
    pub fn pending(&self) -> Option<f32> {
        self.fresh.then_some(self.value)
    }

    /// Consume the pending value. A second call returns `None`.
    pub fn take(&mut self) -> Option<f32> {
        let v = self.pending();
        self.fresh = false;
        v
    }
}

/// Per-environment debounce and liveness bookkeeping.
#[derive(Debug, Clone, Default)]
pub struct Watchdog {
    pub last_run: Option<Instant>,
    pub exec_count: u32,
    pub stuck: bool,
}

impl Watchdog {
    pub fn clear(&mut self) {
        self.exec_count = 0;
        self.stuck = false;
    }
}

// ---------------------------------------------------------------------------
// Environment record
// ---------------------------------------------------------------------------

/// Everything the hub knows about one monitored space.
///
/// The alarm and the buzzer are modelled as `Option<Instant>`: `Some(t)` means
/// active since `t`, so a start time always exists while either is on.
#[derive(Debug, Clone)]
pub struct Environment {
    pub name: String,
    pub topics: EnvironmentTopics,

    pub temperature: f32,
    pub humidity: f32,
    pub door: DoorState,
    pub light: Switch,

    pub ac: Switch,
    buzzer: Option<Instant>,
    alarm: Option<Instant>,

    pub state: FsmState,
    pub connected: bool,
    pub uptime: Duration,
    pub watchdog: Watchdog,

    pub pending_temperature: Staged,
    pub pending_humidity: Staged,
}

impl Environment {
    pub fn new(name: &str) -> Self {
        Self {
            name: name.to_string(),
            topics: EnvironmentTopics::new(name),
            temperature: 0.0,
            humidity: 0.0,
            door: DoorState::Closed,
            light: Switch::Off,
            ac: Switch::Off,
            buzzer: None,
            alarm: None,
            state: FsmState::Init,
            connected: false,
            uptime: Duration::ZERO,
            watchdog: Watchdog::default(),
            pending_temperature: Staged::default(),
            pending_humidity: Staged::default(),
        }
    }

    pub fn alarm_active(&self) -> bool {
        self.alarm.is_some()
    }

    pub fn alarm_started_at(&self) -> Option<Instant> {
        self.alarm
    }

    /// Arm the alarm at `now`. Re-arming keeps the original start time.
    pub fn arm_alarm(&mut self, now: Instant) {
        self.alarm.get_or_insert(now);
    }

    pub fn clear_alarm(&mut self) {
        self.alarm = None;
    }

    pub fn buzzer_on(&self) -> bool {
        self.buzzer.is_some()
    }

    pub fn buzzer_started_at(&self) -> Option<Instant> {
        self.buzzer
    }

    pub fn set_buzzer(&mut self, on: bool, now: Instant) {
        self.buzzer = on.then_some(now);
    }

    /// Alarm or buzzer still engaged; door-close / light-off must cancel it.
    pub fn alarm_engaged(&self) -> bool {
        self.alarm_active() || self.buzzer_on()
    }

    /// Forced recovery from a stuck machine; clears watchdog counters.
    ///
    /// With the alarm or buzzer engaged the machine goes to `BuzzerOff`,
    /// which silences the buzzer, clears the alarm and re-analyses the door,
    /// so an alarm is never left armed without a running timer. Otherwise
    /// it goes straight to `Idle`.
    pub fn force_reset(&mut self) {
        self.state = if self.alarm_engaged() {
            FsmState::BuzzerOff
        } else {
            FsmState::Idle
        };
        self.watchdog.clear();
    }
}

// ---------------------------------------------------------------------------
// Store
// ---------------------------------------------------------------------------

/// Arena of environment records, created once at start-up.
#[derive(Debug, Clone)]
pub struct EnvironmentStore {
    envs: Vec<Environment>,
}

impl EnvironmentStore {
    pub fn new<S: AsRef<str>>(names: &[S]) -> Self {
        Self {
            envs: names.iter().map(|n| Environment::new(n.as_ref())).collect(),
        }
    }

    pub fn len(&self) -> usize {
        self.envs.len()
    }

    pub fn ids(&self) -> impl Iterator<Item = EnvId> {
        (0..self.envs.len()).map(EnvId)
    }

    pub fn iter(&self) -> impl Iterator<Item = &Environment> {
        self.envs.iter()
    }

    pub fn iter_mut(&mut self) -> impl Iterator<Item = &mut Environment> {
        self.envs.iter_mut()
    }

    #[cfg(test)]
    pub fn find(&self, name: &str) -> Option<EnvId> {
        self.envs.iter().position(|e| e.name == name).map(EnvId)
    }

    /// Resolve an inbound topic against every environment's namespace.
    pub fn route(&self, topic: &str) -> Option<(EnvId, Field)> {
        topics::route(topic, self.envs.iter().map(|e| &e.topics))
    }

    pub fn set_connected(&mut self, connected: bool) {
        for env in &mut self.envs {
            env.connected = connected;
        }
    }

    pub fn all_connected(&self) -> bool {
        self.envs.iter().all(|e| e.connected)
    }

    pub fn stamp_uptime(&mut self, uptime: Duration) {
        for env in &mut self.envs {
            env.uptime = uptime;
        }
    }
}

impl Index<EnvId> for EnvironmentStore {
    type Output = Environment;

    fn index(&self, id: EnvId) -> &Environment {
        &self.envs[id.0]
    }
}

impl IndexMut<EnvId> for EnvironmentStore {
    fn index_mut(&mut self, id: EnvId) -> &mut Environment {
        &mut self.envs[id.0]
    }
}

// ===========================================================================
// Tests
// ===========================================================================
