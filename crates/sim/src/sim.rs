//! Device models for one simulated environment.
//!
//! - SenseClima: temperature follows a daily curve, humidity falls as it
//!   warms, both with small jitter and reported to one decimal.
//! - SmartDoor: door and light flip on independent randomised intervals.
//! - AirControl: holds the power state and setpoint commanded by the hub.

use std::fmt;
use std::time::Duration;

use fastrand::Rng;

pub const ROOT: &str = "hana";

// ---------------------------------------------------------------------------
// Topics
// ---------------------------------------------------------------------------

/// Command topics the simulator listens on.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Command {
    Buzzer,
    AcPower,
    AcSetpoint,
}

/// Topic strings for one environment.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Topics {
    pub door: String,
    pub light: String,
    pub buzzer: String,
    pub temperature: String,
    pub humidity: String,
    pub ac_power: String,
    pub ac_setpoint: String,
}

impl Topics {
    pub fn new(env: &str) -> Self {
        let t = |suffix: &str| format!("{ROOT}/{env}/{suffix}");
        Self {
            door: t("smartdoor/door"),
            light: t("smartdoor/light"),
            buzzer: t("smartdoor/buzzer"),
            temperature: t("senseclima/01/temperature"),
            humidity: t("senseclima/01/humidity"),
            ac_power: t("aircontrol/01/power"),
            ac_setpoint: t("aircontrol/01/temperature"),
        }
    }

    pub fn commands(&self) -> [&str; 3] {
        [&self.buzzer, &self.ac_power, &self.ac_setpoint]
    }

    pub fn classify(&self, topic: &str) -> Option<Command> {
        if topic == self.buzzer {
            Some(Command::Buzzer)
        } else if topic == self.ac_power {
            Some(Command::AcPower)
        } else if topic == self.ac_setpoint {
            Some(Command::AcSetpoint)
        } else {
            None
        }
    }
}

// ---------------------------------------------------------------------------
// Climate
// ---------------------------------------------------------------------------

/// (hour of day, °C) key points of the daily temperature curve.
const DAILY_CURVE: [(f64, f64); 5] = [
    (0.0, 14.0),
    (8.0, 18.0),
    (12.0, 30.0),
    (18.0, 22.0),
    (24.0, 14.0),
];

const TEMP_JITTER: f64 = 0.3;
const HUMIDITY_JITTER: f64 = 1.5;

/// Temperature at `hour` (wrapped into `[0, 24)`), linear between key points.
pub fn daily_temperature(hour: f64) -> f64 {
    let hour = hour.rem_euclid(24.0);
    for pair in DAILY_CURVE.windows(2) {
        let ((h0, t0), (h1, t1)) = (pair[0], pair[1]);
        if hour <= h1 {
            return t0 + (t1 - t0) * (hour - h0) / (h1 - h0);
        }
    }
    DAILY_CURVE[0].1
}

/// Relative humidity for a temperature: 85% at 14°C down to 40% at 30°C.
pub fn humidity_for(temperature: f64) -> f64 {
    let frac = (temperature - 14.0) / (30.0 - 14.0);
    (85.0 - 45.0 * frac).clamp(0.0, 100.0)
}

fn round1(v: f64) -> f64 {
    (v * 10.0).round() / 10.0
}

#[derive(Debug, Clone, Copy, PartialEq)]
pub struct Climate {
    pub temperature: f64,
    pub humidity: f64,
}

impl Climate {
    pub fn temperature_payload(&self) -> String {
        format!("{:.1}", self.temperature)
    }

    pub fn humidity_payload(&self) -> String {
        format!("{:.1}", self.humidity)
    }
}

/// Share of the excess above the setpoint left while the AC runs.
const COOLING_RETAIN: f64 = 0.25;

/// SenseClima model. Simulated time runs `speed` times faster than real time,
/// starting at `start_hour`.
pub struct ClimateSim {
    start_hour: f64,
    speed: f64,
    /// Setpoint of a running AC unit in the same room.
    cooling: Option<f64>,
    rng: Rng,
}

impl ClimateSim {
    pub fn new(start_hour: f64, speed: f64, rng: Rng) -> Self {
        Self {
            start_hour,
            speed,
            cooling: None,
            rng,
        }
    }

    pub fn set_cooling(&mut self, setpoint: Option<f64>) {
        self.cooling = setpoint;
    }

    pub fn hour_at(&self, elapsed: Duration) -> f64 {
        (self.start_hour + elapsed.as_secs_f64() * self.speed / 3600.0).rem_euclid(24.0)
    }

    pub fn sample(&mut self, elapsed: Duration) -> Climate {
        let mut base = daily_temperature(self.hour_at(elapsed));
        if let Some(setpoint) = self.cooling {
            if base > setpoint {
                base = setpoint + (base - setpoint) * COOLING_RETAIN;
            }
        }
        let temperature = base + self.jitter(TEMP_JITTER);
        let humidity = humidity_for(temperature) + self.jitter(HUMIDITY_JITTER);
        Climate {
            temperature: round1(temperature),
            humidity: round1(humidity.clamp(0.0, 100.0)),
        }
    }

    /// Uniform in `[-amplitude, amplitude)`.
    fn jitter(&mut self, amplitude: f64) -> f64 {
        (self.rng.f64() * 2.0 - 1.0) * amplitude
    }
}

// ---------------------------------------------------------------------------
// Door / light
// ---------------------------------------------------------------------------

/// A binary input that flips after a random interval in `[min, max]`.
pub struct Toggle {
    on: bool,
    min: Duration,
    max: Duration,
    next_at: Duration,
    rng: Rng,
}

impl Toggle {
    pub fn new(min: Duration, max: Duration, rng: Rng) -> Self {
        let mut t = Self {
            on: false,
            min,
            max,
            next_at: Duration::ZERO,
            rng,
        };
        t.next_at = t.interval();
        t
    }

    #[cfg(test)]
    pub fn is_on(&self) -> bool {
        self.on
    }

    /// Flip if the deadline has passed. Returns the new value when it flips.
    pub fn poll(&mut self, elapsed: Duration) -> Option<bool> {
        if elapsed < self.next_at {
            return None;
        }
        self.on = !self.on;
        self.next_at = elapsed + self.interval();
        Some(self.on)
    }

    fn interval(&mut self) -> Duration {
        let (min, max) = (self.min.as_millis() as u64, self.max.as_millis() as u64);
        if max <= min {
            return self.min;
        }
        Duration::from_millis(self.rng.u64(min..=max))
    }
}

// ---------------------------------------------------------------------------
// AirControl
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct AcUnit {
    pub power: bool,
    pub setpoint: i32,
}

impl Default for AcUnit {
    fn default() -> Self {
        Self {
            power: false,
            setpoint: 24,
        }
    }
}

impl AcUnit {
    pub fn set_power(&mut self, payload: &str) -> Result<(), String> {
        match payload.trim().to_ascii_uppercase().as_str() {
            "ON" => self.power = true,
            "OFF" => self.power = false,
            other => return Err(format!("invalid power payload '{other}', expected ON or OFF")),
        }
        Ok(())
    }

    pub fn set_setpoint(&mut self, payload: &str) -> Result<(), String> {
        let value = payload
            .trim()
            .parse::<i32>()
            .map_err(|_| format!("invalid setpoint payload '{}', expected an integer", payload.trim()))?;
        self.setpoint = value;
        Ok(())
    }
}

impl fmt::Display for AcUnit {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let power = if self.power { "ON" } else { "OFF" };
        write!(f, "power={power} setpoint={}°C", self.setpoint)
    }
}

// ===========================================================================
// Tests
// ===========================================================================
