use std::{fs, io, path::Path, time::Duration};

use rand::Rng;
use serde::{Deserialize, Serialize};
use thiserror::Error;

use crate::{error::SimError, strategy::Strategy, PhilosopherId};

pub const MIN_PHILOSOPHERS: usize = 3;
pub const MAX_PHILOSOPHERS: usize = 10;

#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("failed to read config file: {0}")]
    Io(#[from] io::Error),
    #[error("failed to parse config file: {0}")]
    Parse(#[from] toml::de::Error),
}

/// Delays used by philosophers and observers. Durations are illustrative
/// only; in TOML every field is given in milliseconds.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct Timing {
    #[serde(with = "millis")]
    pub think_base: Duration,
    // id ごとに考える時間をずらす
    #[serde(with = "millis")]
    pub think_step: Duration,
    #[serde(with = "millis")]
    pub think_jitter: Duration,
    #[serde(with = "millis")]
    pub eat: Duration,
    // 左を取ってから右を取りに行くまでの間
    #[serde(with = "millis")]
    pub naive_skew: Duration,
    #[serde(with = "millis")]
    pub naive_timeout: Duration,
    #[serde(with = "millis")]
    pub naive_backoff: Duration,
    #[serde(with = "millis")]
    pub monitor_period: Duration,
    #[serde(with = "millis")]
    pub stats_period: Duration,
    // true なら最初の思考時間を全員 think_base に揃える
    pub synchronized_start: bool,
}

impl Default for Timing {
    fn default() -> Self {
        Timing {
            think_base: Duration::from_millis(500),
            think_step: Duration::from_millis(100),
            think_jitter: Duration::ZERO,
            eat: Duration::from_secs(1),
            naive_skew: Duration::from_millis(300),
            naive_timeout: Duration::from_secs(2),
            naive_backoff: Duration::from_millis(500),
            monitor_period: Duration::from_millis(500),
            stats_period: Duration::from_secs(1),
            synchronized_start: false,
        }
    }
}

impl Timing {
    // 全ての待ち時間を factor 倍する
    pub fn scaled(&self, factor: f64) -> Self {
        let f = |d: Duration| d.mul_f64(factor);
        Timing {
            think_base: f(self.think_base),
            think_step: f(self.think_step),
            think_jitter: f(self.think_jitter),
            eat: f(self.eat),
            naive_skew: f(self.naive_skew),
            naive_timeout: f(self.naive_timeout),
            naive_backoff: f(self.naive_backoff),
            monitor_period: f(self.monitor_period),
            stats_period: f(self.stats_period),
            synchronized_start: self.synchronized_start,
        }
    }

    pub fn think_for<R: Rng>(&self, id: PhilosopherId, first_cycle: bool, rng: &mut R) -> Duration {
        if first_cycle && self.synchronized_start {
            return self.think_base;
        }
        let step = u32::try_from(id).map_or(Duration::ZERO, |id| self.think_step * id);
        let jitter = match u64::try_from(self.think_jitter.as_micros()) {
            Ok(0) | Err(_) => Duration::ZERO,
            Ok(max) => Duration::from_micros(rng.gen_range(0..=max)),
        };
        self.think_base + step + jitter
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct SimulationConfig {
    pub philosophers: usize,
    pub strategy: Strategy,
    pub timing: Timing,
}

impl Default for SimulationConfig {
    fn default() -> Self {
        SimulationConfig {
            philosophers: 5,
            strategy: Strategy::Naive,
            timing: Timing::default(),
        }
    }
}

impl SimulationConfig {
    pub fn from_toml_str(s: &str) -> Result<Self, ConfigError> {
        Ok(toml::from_str(s)?)
    }

    pub fn load(path: impl AsRef<Path>) -> Result<Self, ConfigError> {
        let text = fs::read_to_string(path)?;
        Self::from_toml_str(&text)
    }

    pub fn validate(&self) -> Result<(), SimError> {
        validate_philosophers(self.philosophers)
    }
}

pub fn validate_philosophers(requested: usize) -> Result<(), SimError> {
    if (MIN_PHILOSOPHERS..=MAX_PHILOSOPHERS).contains(&requested) {
        Ok(())
    } else {
        Err(SimError::InvalidConfiguration {
            requested,
            min: MIN_PHILOSOPHERS,
            max: MAX_PHILOSOPHERS,
        })
    }
}

mod millis {
    use std::time::Duration;

    use serde::{Deserialize, Deserializer, Serializer};

    pub fn serialize<S: Serializer>(d: &Duration, s: S) -> Result<S::Ok, S::Error> {
        s.serialize_u64(u64::try_from(d.as_millis()).unwrap_or(u64::MAX))
    }

    pub fn deserialize<'de, D: Deserializer<'de>>(d: D) -> Result<Duration, D::Error> {
        u64::deserialize(d).map(Duration::from_millis)
    }
}
