//! Per-environment topic namespace and inbound topic routing.
//!
//! Every environment `E` owns a fixed set of topics under `hana/E/`:
//!
//! ```text
//! hana/E/smartdoor/door              in   OPEN | CLOSED
//! hana/E/smartdoor/light             in   ON | OFF
//! hana/E/smartdoor/buzzer            out  ON | OFF
//! hana/E/senseclima/01/temperature   in   decimal text
//! hana/E/senseclima/01/humidity      in   decimal text
//! hana/E/aircontrol/01/power         both ON | OFF
//! hana/E/aircontrol/01/temperature   out  integer setpoint
//! ```

use crate::state::EnvId;

/// Root segment shared by every topic in the deployment.
pub const ROOT: &str = "hana";

// ---------------------------------------------------------------------------
// Field kinds
// ---------------------------------------------------------------------------

/// Semantic field carried by an inbound topic.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Field {
    Door,
    Light,
    Temperature,
    Humidity,
    AcPower,
}

impl Field {
    /// All fields the hub subscribes to, in subscription order.
    pub const INBOUND: [Field; 5] = [
        Field::Door,
        Field::Light,
        Field::Temperature,
        Field::Humidity,
        Field::AcPower,
    ];

    /// Topic suffix following `hana/<name>/`.
    pub fn suffix(self) -> &'static str {
        match self {
            Field::Door => "smartdoor/door",
            Field::Light => "smartdoor/light",
            Field::Temperature => "senseclima/01/temperature",
            Field::Humidity => "senseclima/01/humidity",
            Field::AcPower => "aircontrol/01/power",
        }
    }

    fn from_suffix(suffix: &str) -> Option<Self> {
        Self::INBOUND.into_iter().find(|f| f.suffix() == suffix)
    }
}

const BUZZER_SUFFIX: &str = "smartdoor/buzzer";
const SETPOINT_SUFFIX: &str = "aircontrol/01/temperature";

/// Longest suffix any environment topic can carry. Used by config validation
/// to bound environment name length.
pub const LONGEST_SUFFIX: usize = SETPOINT_SUFFIX.len();

// ---------------------------------------------------------------------------
// Cached topic strings
// ---------------------------------------------------------------------------

/// Topic strings for one environment, derived once from its name.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct EnvironmentTopics {
    prefix: String,
    pub door: String,
    pub light: String,
    pub buzzer: String,
    pub temperature: String,
    pub humidity: String,
    pub ac_power: String,
    pub ac_setpoint: String,
}

impl EnvironmentTopics {
    pub fn new(name: &str) -> Self {
        let prefix = format!("{ROOT}/{name}/");
        let topic = |suffix: &str| format!("{prefix}{suffix}");
        Self {
            door: topic(Field::Door.suffix()),
            light: topic(Field::Light.suffix()),
            buzzer: topic(BUZZER_SUFFIX),
            temperature: topic(Field::Temperature.suffix()),
            humidity: topic(Field::Humidity.suffix()),
            ac_power: topic(Field::AcPower.suffix()),
            ac_setpoint: topic(SETPOINT_SUFFIX),
            prefix,
        }
    }

    /// `hana/<name>/`
    pub fn prefix(&self) -> &str {
        &self.prefix
    }

    /// Topics to subscribe to for this environment.
    pub fn inbound(&self) -> [&str; 5] {
        [
            &self.door,
            &self.light,
            &self.temperature,
            &self.humidity,
            &self.ac_power,
        ]
    }

    /// Match `topic` against this environment's namespace.
    pub fn field_of(&self, topic: &str) -> Option<Field> {
        topic
            .strip_prefix(self.prefix.as_str())
            .and_then(Field::from_suffix)
    }
}

// ---------------------------------------------------------------------------
// Router
// ---------------------------------------------------------------------------

/// Map an inbound topic to the environment that owns it and the field it
/// carries. Foreign topics and unknown environments yield `None`.
pub fn route<'a, I>(topic: &str, environments: I) -> Option<(EnvId, Field)>
where
    I: IntoIterator<Item = &'a EnvironmentTopics>,
{
    environments
        .into_iter()
        .enumerate()
        .find(|(_, t)| topic.starts_with(t.prefix()))
        .and_then(|(i, t)| t.field_of(topic).map(|f| (EnvId(i), f)))
}

// ===========================================================================
// Tests
// ===========================================================================
