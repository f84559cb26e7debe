//! Curriculum schedule for the source corruption rate.
//!
//! The rate follows a power-law ramp between `min_rate` and `max_rate` over
//! `mupdates` optimizer updates. A ceiling is recomputed every `cupdates`
//! updates and the per-row rate is derived from it according to the
//! configured [`RateSampling`].

use rand::Rng;
use serde::{Deserialize, Deserializer, Serialize, de::Error as _};
use tracing::debug;

use crate::ConfigError;

/// Direction of the ramp. `Decaying` is what the `reverse` flag selects: the
/// rate starts at `max_rate` and shrinks, clamped at zero.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ScheduleDirection {
    #[default]
    Growing,
    Decaying,
}

/// How the per-row rate is taken from the schedule.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RateSampling {
    /// The ceiling itself, as last recomputed.
    Ceiling,
    /// The ramp evaluated afresh at the current update.
    Direct,
    /// Uniform in `[0, ceiling]`.
    #[default]
    UniformBelowCeiling,
    /// Uniform in `[0, max_rate]`, ignoring the ramp.
    UniformBelowMax,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CurriculumConfig {
    pub max_rate: f64,

    #[serde(default)]
    pub min_rate: f64,

    /// Exponent of the power-law ramp.
    #[serde(rename = "p", default = "default_exponent")]
    pub exponent: f64,

    /// Updates over which the ramp runs from `min_rate` to `max_rate`.
    #[serde(rename = "mupdates")]
    pub ramp_updates: u64,

    /// The ceiling is recomputed every this many updates.
    #[serde(rename = "cupdates", default = "default_update_period")]
    pub update_period: u64,

    #[serde(
        rename = "reverse",
        default,
        deserialize_with = "deserialize_direction"
    )]
    pub direction: ScheduleDirection,

    #[serde(rename = "type", default, deserialize_with = "deserialize_sampling")]
    pub sampling: RateSampling,
}

fn default_exponent() -> f64 {
    2.0
}

fn default_update_period() -> u64 {
    1
}

fn deserialize_direction<'de, D: Deserializer<'de>>(d: D) -> Result<ScheduleDirection, D::Error> {
    #[derive(Deserialize)]
    #[serde(untagged)]
    enum Repr {
        Flag(bool),
        Code(i64),
        Named(ScheduleDirection),
    }
    Ok(match Repr::deserialize(d)? {
        Repr::Flag(false) | Repr::Code(0) => ScheduleDirection::Growing,
        Repr::Flag(true) | Repr::Code(_) => ScheduleDirection::Decaying,
        Repr::Named(direction) => direction,
    })
}

fn deserialize_sampling<'de, D: Deserializer<'de>>(d: D) -> Result<RateSampling, D::Error> {
    #[derive(Deserialize)]
    #[serde(untagged)]
    enum Repr {
        Code(i64),
        Named(RateSampling),
    }
    match Repr::deserialize(d)? {
        Repr::Code(0) => Ok(RateSampling::Ceiling),
        Repr::Code(1) => Ok(RateSampling::UniformBelowCeiling),
        Repr::Code(2) => Ok(RateSampling::Direct),
        Repr::Code(3) => Ok(RateSampling::UniformBelowMax),
        Repr::Code(other) => Err(D::Error::custom(format!(
            "unknown curriculum type {other}, expected 0, 1, 2 or 3"
        ))),
        Repr::Named(sampling) => Ok(sampling),
    }
}

impl CurriculumConfig {
    pub fn from_json(json: &str) -> Result<Self, ConfigError> {
        let config: Self = serde_json::from_str(json)?;
        config.validate()?;
        Ok(config)
    }

    pub fn validate(&self) -> Result<(), ConfigError> {
        if !(0.0..=1.0).contains(&self.max_rate) {
            return Err(ConfigError::RateOutOfRange(self.max_rate));
        }
        if !(0.0..=self.max_rate).contains(&self.min_rate) {
            return Err(ConfigError::MinRateAboveMax {
                min_rate: self.min_rate,
                max_rate: self.max_rate,
            });
        }
        if self.exponent.is_nan() || self.exponent <= 0.0 {
            return Err(ConfigError::InvalidExponent(self.exponent));
        }
        if self.ramp_updates == 0 {
            return Err(ConfigError::ZeroUpdates("mupdates"));
        }
        if self.update_period == 0 {
            return Err(ConfigError::ZeroUpdates("cupdates"));
        }
        Ok(())
    }

    pub fn rate_at(&self, num_updates: u64) -> f64 {
        curriculum_rate(
            num_updates,
            self.ramp_updates,
            self.max_rate,
            self.min_rate,
            self.exponent,
            self.direction,
        )
    }
}

/// Interpolates `rate^p` linearly between `r_min^p` and `r_max^p` over
/// `max_updates` and takes the `p`-th root. Progress is clamped to `[0, max_updates]`.
pub fn curriculum_rate(
    num_updates: u64,
    max_updates: u64,
    r_max: f64,
    r_min: f64,
    p: f64,
    direction: ScheduleDirection,
) -> f64 {
    let progress = if max_updates == 0 {
        1.0
    } else {
        num_updates.min(max_updates) as f64 / max_updates as f64
    };
    let low = if r_min != 0.0 { r_min.powf(p) } else { 0.0 };
    let temp = (r_max.powf(p) - low) * progress + low;
    let root = if temp != 0.0 { temp.powf(1.0 / p) } else { 0.0 };
    match direction {
        ScheduleDirection::Growing => root.min(r_max),
        ScheduleDirection::Decaying => (r_max - root).max(0.0),
    }
}

/// Schedule state carried across steps.
#[derive(Debug, Clone)]
pub struct CurriculumSchedule {
    config: CurriculumConfig,
    ceiling: Option<f64>,
}

impl CurriculumSchedule {
    pub fn new(config: CurriculumConfig) -> Self {
        Self {
            config,
            ceiling: None,
        }
    }

    pub fn config(&self) -> &CurriculumConfig {
        &self.config
    }

    /// Current ceiling, zero before the first [`Self::advance`].
    pub fn ceiling(&self) -> f64 {
        self.ceiling.unwrap_or(0.0)
    }

    /// Recomputes the ceiling on period boundaries, or when none has been computed yet
    /// (e.g. resuming mid-period).
    pub fn advance(&mut self, num_updates: u64) {
        let period = self.config.update_period.max(1);
        if self.ceiling.is_none() || num_updates % period == 0 {
            let ceiling = self.config.rate_at(num_updates);
            if self.ceiling != Some(ceiling) {
                debug!(num_updates, ceiling, "curriculum noise ceiling updated");
            }
            self.ceiling = Some(ceiling);
        }
    }

    pub fn sample_rate<R: Rng + ?Sized>(&self, num_updates: u64, rng: &mut R) -> f64 {
        match self.config.sampling {
            RateSampling::Ceiling => self.ceiling(),
            RateSampling::Direct => self.config.rate_at(num_updates),
            RateSampling::UniformBelowCeiling => self.ceiling() * rng.random::<f64>(),
            RateSampling::UniformBelowMax => self.config.max_rate * rng.random::<f64>(),
        }
    }
}
