//! TOML config file loading, environment overrides, and validation.

use anyhow::{bail, Context, Result};
use serde::Deserialize;
use std::collections::HashSet;
use std::time::Duration;

use crate::fsm::Limits;
use crate::handler::MAX_TOPIC_LEN;
use crate::mqtt::qos_from_level;
use crate::topics::{LONGEST_SUFFIX, ROOT};

// ---------------------------------------------------------------------------
// Config file structures
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Default, Deserialize)]
#[serde(default)]
pub struct Config {
    pub broker: BrokerConfig,
    pub control: ControlConfig,
    pub timing: TimingConfig,
    pub publish: PublishConfig,
    pub environments: Vec<EnvironmentEntry>,
}

#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct BrokerConfig {
    pub host: String,
    pub port: u16,
    pub client_id: String,
    pub username: String,
    pub password: String,
    pub keep_alive_sec: u64,
    pub connect_timeout_sec: u64,
    pub channel_capacity: usize,
}

impl Default for BrokerConfig {
    fn default() -> Self {
        Self {
            host: "127.0.0.1".to_string(),
            port: 1883,
            client_id: "corehub01".to_string(),
            username: String::new(),
            password: String::new(),
            keep_alive_sec: 240,
            connect_timeout_sec: 60,
            channel_capacity: 64,
        }
    }
}

#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct ControlConfig {
    pub temp_upper: f32,
    pub temp_lower: f32,
    pub ac_setpoint: i32,
    pub alarm_timeout_sec: u64,
    pub alarm_overflow_sec: u64,
}

impl Default for ControlConfig {
    fn default() -> Self {
        Self {
            temp_upper: 28.0,
            temp_lower: 24.0,
            ac_setpoint: 22,
            alarm_timeout_sec: 60,
            alarm_overflow_sec: 3600,
        }
    }
}

impl ControlConfig {
    pub fn limits(&self) -> Limits {
        Limits {
            temp_upper: self.temp_upper,
            temp_lower: self.temp_lower,
            ac_setpoint: self.ac_setpoint,
            alarm_timeout: Duration::from_secs(self.alarm_timeout_sec),
            alarm_overflow: Duration::from_secs(self.alarm_overflow_sec),
        }
    }
}

#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct TimingConfig {
    pub debounce_ms: u64,
    pub loop_interval_ms: u64,
    pub process_timeout_ms: u64,
    pub reconnect_backoff_sec: u64,
    pub settle_ms: u64,
    pub watchdog_interval_sec: u64,
    pub heartbeat_every: u32,
    pub stuck_threshold: u32,
    pub exec_reset_bound: u32,
}

impl Default for TimingConfig {
    fn default() -> Self {
        Self {
            debounce_ms: 1000,
            loop_interval_ms: 50,
            process_timeout_ms: 10,
            reconnect_backoff_sec: 5,
            settle_ms: 1000,
            watchdog_interval_sec: 30,
            heartbeat_every: 10,
            stuck_threshold: 500,
            exec_reset_bound: 1000,
        }
    }
}

#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct PublishConfig {
    pub max_retries: u32,
    pub backoff_step_ms: u64,
    pub backoff_cap_ms: u64,
    pub qos: u8,
    pub retain: bool,
}

impl Default for PublishConfig {
    fn default() -> Self {
        Self {
            max_retries: 3,
            backoff_step_ms: 50,
            backoff_cap_ms: 500,
            qos: 0,
            retain: true,
        }
    }
}

#[derive(Debug, Clone, Deserialize)]
pub struct EnvironmentEntry {
    pub name: String,
}

// ---------------------------------------------------------------------------
// Validation
// ---------------------------------------------------------------------------

/// Longest environment name whose derived topics still fit the inbound
/// topic bound (`hana/` + name + `/` + suffix).
pub const MAX_NAME_LEN: usize = MAX_TOPIC_LEN - ROOT.len() - 2 - LONGEST_SUFFIX;

impl Config {
    pub fn environment_names(&self) -> Vec<String> {
        self.environments.iter().map(|e| e.name.clone()).collect()
    }

    /// Validate all config entries. Returns `Ok(())` or an error describing
    /// every violation found (not just the first one).
    pub fn validate(&self) -> Result<()> {
        let mut errors: Vec<String> = Vec::new();

        self.validate_broker(&mut errors);
        self.validate_control(&mut errors);
        self.validate_timing(&mut errors);
        self.validate_publish(&mut errors);
        self.validate_environments(&mut errors);

        if errors.is_empty() {
            Ok(())
        } else {
            bail!(
                "config validation failed ({} error{}):\n  - {}",
                errors.len(),
                if errors.len() == 1 { "" } else { "s" },
                errors.join("\n  - ")
            );
        }
    }

    fn validate_broker(&self, errors: &mut Vec<String>) {
        let b = &self.broker;
        if b.host.trim().is_empty() {
            errors.push("broker: host is empty".to_string());
        }
        if b.port == 0 {
            errors.push("broker: port must be positive".to_string());
        }
        if b.client_id.trim().is_empty() {
            errors.push("broker: client_id is empty".to_string());
        }
        if b.connect_timeout_sec == 0 {
            errors.push("broker: connect_timeout_sec must be positive".to_string());
        }
        if b.channel_capacity == 0 {
            errors.push("broker: channel_capacity must be positive".to_string());
        }
    }

    fn validate_control(&self, errors: &mut Vec<String>) {
        let c = &self.control;
        if c.temp_lower >= c.temp_upper {
            errors.push(format!(
                "control: temp_lower ({}) must be less than temp_upper ({})",
                c.temp_lower, c.temp_upper
            ));
        }
        if c.alarm_timeout_sec == 0 {
            errors.push("control: alarm_timeout_sec must be positive".to_string());
        }
        if c.alarm_timeout_sec >= c.alarm_overflow_sec {
            errors.push(format!(
                "control: alarm_timeout_sec ({}) must be less than alarm_overflow_sec ({})",
                c.alarm_timeout_sec, c.alarm_overflow_sec
            ));
        }
    }

    fn validate_timing(&self, errors: &mut Vec<String>) {
        let t = &self.timing;
        if t.debounce_ms == 0 {
            errors.push("timing: debounce_ms must be positive".to_string());
        }
        if t.watchdog_interval_sec == 0 {
            errors.push("timing: watchdog_interval_sec must be positive".to_string());
        }
        if t.heartbeat_every == 0 {
            errors.push("timing: heartbeat_every must be positive".to_string());
        }
        if t.stuck_threshold >= t.exec_reset_bound {
            errors.push(format!(
                "timing: stuck_threshold ({}) must be less than exec_reset_bound ({})",
                t.stuck_threshold, t.exec_reset_bound
            ));
        }
    }

    fn validate_publish(&self, errors: &mut Vec<String>) {
        let p = &self.publish;
        if p.max_retries == 0 {
            errors.push("publish: max_retries must be at least 1".to_string());
        }
        if qos_from_level(p.qos).is_none() {
            errors.push(format!("publish: qos {} out of range [0, 2]", p.qos));
        }
    }

    fn validate_environments(&self, errors: &mut Vec<String>) {
        if self.environments.is_empty() {
            errors.push("environments: at least one environment is required".to_string());
        }

        let mut seen: HashSet<&str> = HashSet::new();
        for (i, e) in self.environments.iter().enumerate() {
            let ctx = || {
                if e.name.is_empty() {
                    format!("environments[{i}]")
                } else {
                    format!("environment '{}'", e.name)
                }
            };

            if e.name.trim().is_empty() {
                errors.push(format!("{}: name is empty", ctx()));
                continue;
            }
            if !seen.insert(&e.name) {
                errors.push(format!("{}: duplicate name", ctx()));
            }
            if e
                .name
                .chars()
                .any(|c| c == '/' || c == '+' || c == '#' || c.is_whitespace())
            {
                errors.push(format!(
                    "{}: name must not contain '/', '+', '#' or whitespace",
                    ctx()
                ));
            }
            if e.name.len() > MAX_NAME_LEN {
                errors.push(format!(
                    "{}: name longer than {MAX_NAME_LEN} bytes; derived topics would exceed {MAX_TOPIC_LEN} bytes",
                    ctx()
                ));
            }
        }
    }

    /// Apply `MQTT_HOST` / `MQTT_PORT` overrides.
    pub fn apply_env_overrides(&mut self) {
        if let Ok(host) = std::env::var("MQTT_HOST") {
            self.broker.host = host;
        }
        if let Some(port) = std::env::var("MQTT_PORT")
            .ok()
            .and_then(|s| s.parse().ok())
        {
            self.broker.port = port;
        }
    }
}

// ---------------------------------------------------------------------------
// Load
// ---------------------------------------------------------------------------

/// Parse a TOML config string. Missing keys take their defaults.
pub fn parse(contents: &str) -> Result<Config> {
    Ok(toml::from_str(contents)?)
}

/// Read, parse, apply environment overrides, and validate a TOML config file.
pub fn load(path: &str) -> Result<Config> {
    let contents =
        std::fs::read_to_string(path).with_context(|| format!("failed to read config: {path}"))?;
    let mut config =
        parse(&contents).with_context(|| format!("failed to parse config: {path}"))?;
    config.apply_env_overrides();
    config
        .validate()
        .with_context(|| format!("invalid config: {path}"))?;

    tracing::info!(
        environments = config.environments.len(),
        broker = %format!("{}:{}", config.broker.host, config.broker.port),
        "config loaded"
    );

    Ok(config)
}

// ===========================================================================
// Tests
// ===========================================================================
