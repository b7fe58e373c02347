mod sim;

use std::{env, str::FromStr, time::Duration};

use anyhow::{bail, Result};
use rumqttc::{AsyncClient, Event, MqttOptions, Packet, QoS};
use tokio::sync::mpsc;
use tokio::time::{interval, sleep, Instant};
use tracing::{info, warn};
use tracing_subscriber::EnvFilter;

use sim::{AcUnit, ClimateSim, Command, Toggle, Topics};

/// One simulated environment: SmartDoor, SenseClima and AirControl.
struct Device {
    name: String,
    topics: Topics,
    door: Toggle,
    light: Toggle,
    climate: ClimateSim,
    ac: AcUnit,
}

struct SimConfig {
    environments: Vec<String>,
    speed: f64,
    start_hour: f64,
    sample_every: Duration,
    door: (Duration, Duration),
    light: (Duration, Duration),
}

fn env_or<T: FromStr>(key: &str, default: T) -> T {
    env::var(key)
        .ok()
        .and_then(|s| s.trim().parse().ok())
        .unwrap_or(default)
}

fn secs_or(key: &str, default: u64) -> Duration {
    Duration::from_secs(env_or(key, default))
}

fn utc_hour_now() -> f64 {
    let secs = std::time::SystemTime::now()
        .duration_since(std::time::UNIX_EPOCH)
        .unwrap_or_default()
        .as_secs();
    (secs % 86_400) as f64 / 3600.0
}

impl SimConfig {
    fn from_env() -> Result<Self> {
        let environments: Vec<String> = env::var("SIM_ENVIRONMENTS")
            .unwrap_or_else(|_| "externo,mesanino,prototipagem".to_string())
            .split(',')
            .map(|s| s.trim().to_string())
            .filter(|s| !s.is_empty())
            .collect();
        if environments.is_empty() {
            bail!("SIM_ENVIRONMENTS lists no environments");
        }

        let speed: f64 = env_or("SIM_SPEED", 1.0);
        if !speed.is_finite() || speed <= 0.0 {
            bail!("SIM_SPEED must be positive, got {speed}");
        }

        Ok(Self {
            environments,
            speed,
            start_hour: env_or("SIM_START_HOUR", utc_hour_now()),
            sample_every: secs_or("SIM_SAMPLE_EVERY_S", 30),
            door: (secs_or("SIM_DOOR_MIN_S", 20), secs_or("SIM_DOOR_MAX_S", 90)),
            light: (secs_or("SIM_LIGHT_MIN_S", 60), secs_or("SIM_LIGHT_MAX_S", 300)),
        })
    }
}

impl Device {
    fn new(name: &str, cfg: &SimConfig) -> Self {
        Self {
            name: name.to_string(),
            topics: Topics::new(name),
            door: Toggle::new(cfg.door.0, cfg.door.1, fastrand::Rng::new()),
            light: Toggle::new(cfg.light.0, cfg.light.1, fastrand::Rng::new()),
            climate: ClimateSim::new(cfg.start_hour, cfg.speed, fastrand::Rng::new()),
            ac: AcUnit::default(),
        }
    }

    async fn step(&mut self, client: &AsyncClient, elapsed: Duration, sample: bool) {
        if let Some(open) = self.door.poll(elapsed) {
            let payload = if open { "OPEN" } else { "CLOSED" };
            info!(env = %self.name, "door {payload}");
            publish(client, &self.topics.door, payload, true).await;
        }
        if let Some(on) = self.light.poll(elapsed) {
            let payload = if on { "ON" } else { "OFF" };
            info!(env = %self.name, "light {payload}");
            publish(client, &self.topics.light, payload, true).await;
        }
        if sample {
            let c = self.climate.sample(elapsed);
            info!(
                env = %self.name,
                hour = %format!("{:.1}", self.climate.hour_at(elapsed)),
                "climate {:.1}°C {:.1}%",
                c.temperature,
                c.humidity
            );
            publish(client, &self.topics.temperature, &c.temperature_payload(), false).await;
            publish(client, &self.topics.humidity, &c.humidity_payload(), false).await;
        }
    }

    /// Returns `false` if `topic` is not one of this device's command topics.
    fn command(&mut self, topic: &str, payload: &str) -> bool {
        let Some(command) = self.topics.classify(topic) else {
            return false;
        };
        let result = match command {
            Command::Buzzer => {
                info!(env = %self.name, "buzzer {}", payload.trim());
                return true;
            }
            Command::AcPower => self.ac.set_power(payload),
            Command::AcSetpoint => self.ac.set_setpoint(payload),
        };
        match result {
            Ok(()) => {
                info!(env = %self.name, "AC {}", self.ac);
                self.climate
                    .set_cooling(self.ac.power.then_some(f64::from(self.ac.setpoint)));
            }
            Err(e) => warn!(env = %self.name, "{e}"),
        }
        true
    }
}

async fn publish(client: &AsyncClient, topic: &str, payload: &str, retain: bool) {
    if let Err(e) = client
        .publish(topic, QoS::AtMostOnce, retain, payload.as_bytes().to_vec())
        .await
    {
        warn!(topic, "publish error: {e}");
    }
}

#[tokio::main(flavor = "current_thread")]
async fn main() -> Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")),
        )
        .init();

    // Env config
    let broker = env::var("MQTT_HOST").unwrap_or_else(|_| "127.0.0.1".to_string());
    let port: u16 = env_or("MQTT_PORT", 1883);
    let cfg = SimConfig::from_env()?;

    let mut devices: Vec<Device> = cfg
        .environments
        .iter()
        .map(|name| Device::new(name, &cfg))
        .collect();

    let client_id = format!("corehub-sim-{}", fastrand::u32(..10_000));
    let mut options = MqttOptions::new(client_id, broker, port);
    options.set_keep_alive(Duration::from_secs(30));

    let (client, mut eventloop) = AsyncClient::new(options, 64);

    // Commands from the hub are forwarded to the main loop, which owns the
    // devices. Subscriptions are renewed on every CONNACK.
    let subscriptions: Vec<String> = devices
        .iter()
        .flat_map(|d| d.topics.commands().map(String::from))
        .collect();
    let (tx, mut rx) = mpsc::channel::<(String, String)>(64);
    let sub_client = client.clone();
    tokio::spawn(async move {
        loop {
            match eventloop.poll().await {
                Ok(Event::Incoming(Packet::ConnAck(_))) => {
                    info!(topics = subscriptions.len(), "simulator connected to mqtt");
                    for topic in &subscriptions {
                        if let Err(e) = sub_client.try_subscribe(topic, QoS::AtMostOnce) {
                            warn!(topic = %topic, "subscribe failed: {e}");
                        }
                    }
                }
                Ok(Event::Incoming(Packet::Publish(p))) => {
                    let payload = String::from_utf8_lossy(&p.payload).into_owned();
                    if tx.send((p.topic, payload)).await.is_err() {
                        break;
                    }
                }
                Ok(_) => {}
                Err(e) => {
                    warn!("mqtt error: {e}. retrying...");
                    sleep(Duration::from_secs(2)).await;
                }
            }
        }
    });

    for d in &devices {
        publish(&client, &d.topics.door, "CLOSED", true).await;
        publish(&client, &d.topics.light, "OFF", true).await;
    }
    info!(
        environments = ?cfg.environments,
        speed = cfg.speed,
        start_hour = %format!("{:.1}", cfg.start_hour),
        "simulating"
    );

    let start = Instant::now();
    let mut ticker = interval(Duration::from_secs(1));
    let mut next_sample = Duration::ZERO;

    loop {
        tokio::select! {
            Some((topic, payload)) = rx.recv() => {
                if !devices.iter_mut().any(|d| d.command(&topic, &payload)) {
                    warn!(topic = %topic, "unhandled topic");
                }
            }
            _ = ticker.tick() => {
                let elapsed = start.elapsed();
                let sample = elapsed >= next_sample;
                if sample {
                    next_sample = elapsed + cfg.sample_every;
                }
                for d in &mut devices {
                    d.step(&client, elapsed, sample).await;
                }
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

    fn config() -> SimConfig {
        SimConfig {
            environments: vec!["externo".to_string()],
            speed: 1.0,
            start_hour: 12.0,
            sample_every: Duration::from_secs(30),
            door: (Duration::from_secs(20), Duration::from_secs(90)),
            light: (Duration::from_secs(60), Duration::from_secs(300)),
        }
    }

    #[test]
    fn utc_hour_in_range() {
        let h = utc_hour_now();
        assert!((0.0..24.0).contains(&h), "hour out of range: {h}");
    }

    #[test]
    fn env_or_falls_back_on_missing_or_garbage() {
        assert_eq!(env_or("COREHUB_SIM_TEST_UNSET_KEY", 7_u64), 7);
    }

    #[test]
    fn ac_commands_update_unit_and_cooling() {
        let mut d = Device::new("externo", &config());
        assert!(d.command("hana/externo/aircontrol/01/temperature", "22"));
        assert!(d.command("hana/externo/aircontrol/01/power", "ON"));
        assert_eq!(d.ac.to_string(), "power=ON setpoint=22°C");

        let cooled = d.climate.sample(Duration::ZERO).temperature;
        assert!(cooled < 26.0, "AC should cool the room: {cooled}");
    }

    #[test]
    fn invalid_ac_payload_is_consumed_without_change() {
        let mut d = Device::new("externo", &config());
        assert!(d.command("hana/externo/aircontrol/01/power", "MAYBE"));
        assert_eq!(d.ac, AcUnit::default());
    }

    #[test]
    fn buzzer_is_consumed() {
        let mut d = Device::new("externo", &config());
        assert!(d.command("hana/externo/smartdoor/buzzer", "ON"));
    }

    #[test]
    fn foreign_topics_are_not_consumed() {
        let mut d = Device::new("externo", &config());
        assert!(!d.command("hana/mesanino/aircontrol/01/power", "ON"));
        assert!(!d.command("hana/externo/smartdoor/door", "OPEN"));
    }
}
