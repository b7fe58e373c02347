//! Inbound message handling: size guard, routing, sensor staging and the
//! alarm-cancel short-circuit.
//!
//! The handler only writes data and forces states. It never publishes and
//! never waits, so draining the inbound queue can not stall the loop.

use tracing::{debug, info};

use crate::fsm::FsmState;
use crate::mqtt::{parse_decimal, parse_door, parse_switch, InboundMessage};
use crate::state::{DoorState, EnvId, EnvironmentStore, Switch};
use crate::topics::Field;

/// Longest topic accepted from the broker, in bytes.
pub const MAX_TOPIC_LEN: usize = 127;
/// Longest payload accepted from the broker, in bytes.
pub const MAX_PAYLOAD_LEN: usize = 63;

/// A routed, decoded inbound value.
#[derive(Debug, Clone, Copy, PartialEq)]
pub(crate) enum Reading {
    /// `None` for payloads other than OPEN/CLOSED.
    Door(Option<DoorState>),
    Light(Switch),
    Temperature(f32),
    Humidity(f32),
    AcPower(Switch),
}

/// Validate, route and decode a raw message. Oversized, empty and foreign
/// messages yield `None`.
pub(crate) fn decode(store: &EnvironmentStore, msg: &InboundMessage) -> Option<(EnvId, Reading)> {
    if msg.topic.len() > MAX_TOPIC_LEN || msg.payload.len() > MAX_PAYLOAD_LEN {
        debug!(
            topic_len = msg.topic.len(),
            payload_len = msg.payload.len(),
            "dropping oversized message"
        );
        return None;
    }
    if msg.payload.is_empty() {
        return None;
    }

    let (id, field) = store.route(&msg.topic)?;
    let p = msg.payload.as_slice();
    let reading = match field {
        Field::Door => Reading::Door(parse_door(p)),
        Field::Light => Reading::Light(parse_switch(p)),
        Field::Temperature => Reading::Temperature(parse_decimal(p)),
        Field::Humidity => Reading::Humidity(parse_decimal(p)),
        Field::AcPower => Reading::AcPower(parse_switch(p)),
    };
    Some((id, reading))
}

/// Apply a decoded reading to its environment. Returns the state forced onto
/// the machine, if any.
pub(crate) fn apply(store: &mut EnvironmentStore, id: EnvId, reading: Reading) -> Option<FsmState> {
    let env = &mut store[id];

    let forced = match reading {
        Reading::Door(door) => {
            if let Some(door) = door {
                env.door = door;
            }
            if door == Some(DoorState::Closed) && env.alarm_engaged() {
                FsmState::BuzzerOff
            } else {
                FsmState::AnalyzeDoor
            }
        }
        Reading::Light(light) => {
            env.light = light;
            if light == Switch::Off && env.alarm_engaged() {
                FsmState::BuzzerOff
            } else {
                FsmState::AnalyzeDoor
            }
        }
        Reading::Temperature(t) => {
            env.pending_temperature.stage(t);
            return None;
        }
        Reading::Humidity(h) => {
            env.pending_humidity.stage(h);
            return None;
        }
        Reading::AcPower(power) => {
            env.ac = power;
            return None;
        }
    };

    if forced == FsmState::BuzzerOff {
        info!(env = %env.name, from = %env.state, "alarm cancelled by door/light");
    }
    env.state = forced;
    Some(forced)
}

/// Decode and apply one raw message. Returns `true` if it touched an
/// environment.
pub(crate) fn handle(store: &mut EnvironmentStore, msg: &InboundMessage) -> bool {
    match decode(store, msg) {
        Some((id, reading)) => {
            apply(store, id, reading);
            true
        }
        None => false,
    }
}

// ===========================================================================
// Tests
// ===========================================================================
