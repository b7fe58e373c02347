//! Per-environment control state machine.
//!
//! ```text
//! Init ─▶ ConnectCheck ─┬─▶ Idle ◀──────────────────────────────┐
//!            ▲          └─▶ Reconnect ─┐                         │
//!            └─────────────────────────┘                         │
//!
//! Idle ──[temp > upper]──▶ AcOn ──▶ Idle
//! Idle ──[temp < lower]──▶ AcOff ─▶ Idle
//! (door/light msg) ──▶ AnalyzeDoor ─┬─[light ON, door CLOSED]─▶ AcOn
//!                                   ├─[light OFF]─────────────▶ AcOff
//!                                   ├─[light ON, door OPEN]───▶ AlarmLogic
//!                                   └─────────────────────────▶ Idle
//! AlarmLogic ─[arm]─▶ WaitTimer ─┬─[timeout]───────────▶ BuzzerOn ─▶ Idle
//!                                ├─[door CLOSED / light OFF]─▶ BuzzerOff ─▶ AnalyzeDoor
//!                                └─[overflow]──────────▶ Idle (alarm cleared)
//! ```
//!
//! [`transition`] is pure: it reads an environment and returns the next
//! state plus the side effects to apply. The runner owns applying them.

use std::fmt;
use std::time::Duration;

use tokio::time::Instant;

use crate::state::{DoorState, Environment, Switch};
use crate::topics::EnvironmentTopics;

// ---------------------------------------------------------------------------
// States
// ---------------------------------------------------------------------------

/// What caused an AC decision.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Trigger {
    /// Door/light analysis.
    DoorLight,
    /// A temperature reading crossed a threshold while idle.
    Temperature,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum FsmState {
    #[default]
    Init,
    ConnectCheck,
    Reconnect,
    Idle,
    AnalyzeDoor,
    AcOn(Trigger),
    AcOff(Trigger),
    AlarmLogic,
    WaitTimer,
    BuzzerOn,
    BuzzerOff,
}

impl FsmState {
    pub fn name(self) -> &'static str {
        match self {
            FsmState::Init => "INIT",
            FsmState::ConnectCheck => "CONNECT_CHECK",
            FsmState::Reconnect => "RECONNECT",
            FsmState::Idle => "IDLE",
            FsmState::AnalyzeDoor => "ANALYZE_DOOR",
            FsmState::AcOn(_) => "AC_ON",
            FsmState::AcOff(_) => "AC_OFF",
            FsmState::AlarmLogic => "ALARM_LOGIC",
            FsmState::WaitTimer => "WAIT_TIMER",
            FsmState::BuzzerOn => "BUZZER_ON",
            FsmState::BuzzerOff => "BUZZER_OFF",
        }
    }
}

impl fmt::Display for FsmState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.name())
    }
}

// ---------------------------------------------------------------------------
// Effects
// ---------------------------------------------------------------------------

/// Outbound command for an environment's actuators.
#[derive(Debug, Clone, Copy, PartialEq)]
pub enum Command {
    AcPower(Switch),
    AcSetpoint(i32),
    Buzzer(Switch),
}

impl Command {
    pub fn topic<'a>(&self, topics: &'a EnvironmentTopics) -> &'a str {
        match self {
            Command::AcPower(_) => &topics.ac_power,
            Command::AcSetpoint(_) => &topics.ac_setpoint,
            Command::Buzzer(_) => &topics.buzzer,
        }
    }

    pub fn payload(&self) -> String {
        match self {
            Command::AcPower(s) | Command::Buzzer(s) => s.as_payload().to_string(),
            Command::AcSetpoint(t) => t.to_string(),
        }
    }
}

#[derive(Debug, Clone, PartialEq)]
pub enum Effect {
    /// Move the staged temperature into sensed state.
    TakeTemperature(f32),
    /// Move the staged humidity into sensed state.
    TakeHumidity(f32),
    Publish(Command),
    SetAc(Switch),
    ArmAlarm,
    ClearAlarm,
    SetBuzzer(Switch),
}

/// Next state plus the ordered side effects that lead to it.
#[derive(Debug, Clone, PartialEq)]
pub struct Step {
    pub next: FsmState,
    pub effects: Vec<Effect>,
    /// The alarm timer passed its overflow ceiling; the alarm is cleared and `next` is `Idle`.
    pub fault: bool,
}

impl Step {
    fn to(next: FsmState) -> Self {
        Self {
            next,
            effects: Vec::new(),
            fault: false,
        }
    }

    fn with(next: FsmState, effects: Vec<Effect>) -> Self {
        Self {
            next,
            effects,
            fault: false,
        }
    }
}

// ---------------------------------------------------------------------------
// Limits
// ---------------------------------------------------------------------------

/// Control thresholds the machine decides against.
#[derive(Debug, Clone, PartialEq)]
pub struct Limits {
    pub temp_upper: f32,
    pub temp_lower: f32,
    pub ac_setpoint: i32,
    pub alarm_timeout: Duration,
    pub alarm_overflow: Duration,
}

// ---------------------------------------------------------------------------
// Transition function
// ---------------------------------------------------------------------------

/// Compute one step of `env`'s machine at `now`.
pub fn transition(env: &Environment, now: Instant, limits: &Limits) -> Step {
    let door_closed = env.door == DoorState::Closed;
    let light_on = env.light.is_on();

    match env.state {
        FsmState::Init => Step::to(FsmState::ConnectCheck),

        FsmState::ConnectCheck => {
            if env.connected {
                Step::to(FsmState::Idle)
            } else {
                Step::to(FsmState::Reconnect)
            }
        }

        FsmState::Reconnect => Step::to(FsmState::ConnectCheck),

        FsmState::Idle => idle(env, limits),

        FsmState::AnalyzeDoor => {
            let next = if light_on && door_closed {
                FsmState::AcOn(Trigger::DoorLight)
            } else if !light_on {
                FsmState::AcOff(Trigger::DoorLight)
            } else if env.door == DoorState::Open {
                FsmState::AlarmLogic
            } else {
                FsmState::Idle
            };
            Step::to(next)
        }

        FsmState::AcOn(_) => {
            let mut effects = Vec::new();
            if !env.ac.is_on() {
                if door_closed && light_on {
                    effects.push(Effect::Publish(Command::AcPower(Switch::On)));
                }
                effects.push(Effect::Publish(Command::AcSetpoint(limits.ac_setpoint)));
                effects.push(Effect::SetAc(Switch::On));
            }
            Step::with(FsmState::Idle, effects)
        }

        FsmState::AcOff(trigger) => {
            let mut effects = Vec::new();
            if env.ac.is_on() {
                if !light_on || trigger == Trigger::Temperature {
                    effects.push(Effect::Publish(Command::AcPower(Switch::Off)));
                }
                effects.push(Effect::SetAc(Switch::Off));
            }
            Step::with(FsmState::Idle, effects)
        }

        FsmState::AlarmLogic => {
            if env.door == DoorState::Open && light_on && !env.alarm_active() {
                Step::with(FsmState::WaitTimer, vec![Effect::ArmAlarm])
            } else {
                Step::to(FsmState::Idle)
            }
        }

        FsmState::WaitTimer => wait_timer(env, now, limits),

        FsmState::BuzzerOn => {
            let mut effects = Vec::new();
            if !env.buzzer_on() {
                effects.push(Effect::Publish(Command::Buzzer(Switch::On)));
                effects.push(Effect::SetBuzzer(Switch::On));
            }
            Step::with(FsmState::Idle, effects)
        }

        FsmState::BuzzerOff => {
            let mut effects = Vec::new();
            if env.buzzer_on() {
                effects.push(Effect::Publish(Command::Buzzer(Switch::Off)));
                effects.push(Effect::SetBuzzer(Switch::Off));
            }
            if env.alarm_active() {
                effects.push(Effect::ClearAlarm);
            }
            // Re-evaluate door/light right after the alarm is cancelled.
            Step::with(FsmState::AnalyzeDoor, effects)
        }
    }
}

fn idle(env: &Environment, limits: &Limits) -> Step {
    let mut step = Step::to(FsmState::Idle);

    if let Some(t) = env.pending_temperature.pending() {
        step.effects.push(Effect::TakeTemperature(t));
        let occupied = env.door == DoorState::Closed && env.light.is_on();
        if occupied && !env.alarm_active() && !env.buzzer_on() {
            if t > limits.temp_upper {
                step.next = FsmState::AcOn(Trigger::Temperature);
            } else if t < limits.temp_lower {
                step.next = FsmState::AcOff(Trigger::Temperature);
            }
        }
    }

    if let Some(h) = env.pending_humidity.pending() {
        step.effects.push(Effect::TakeHumidity(h));
    }

    step
}

fn wait_timer(env: &Environment, now: Instant, limits: &Limits) -> Step {
    let Some(started) = env.alarm_started_at() else {
        return Step::to(FsmState::Idle);
    };

    let elapsed = now.saturating_duration_since(started);
    if elapsed > limits.alarm_overflow {
        return Step {
            next: FsmState::Idle,
            effects: vec![Effect::ClearAlarm],
            fault: true,
        };
    }

    if elapsed >= limits.alarm_timeout {
        Step::to(FsmState::BuzzerOn)
    } else if env.door == DoorState::Closed || !env.light.is_on() {
        Step::to(FsmState::BuzzerOff)
    } else {
        Step::to(FsmState::WaitTimer)
    }
}

// ===========================================================================
// Tests
// ===========================================================================
