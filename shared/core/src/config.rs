use std::{fmt, str::FromStr};

use serde::{Deserialize, Serialize};
use thiserror::Error;

use crate::{CurriculumConfig, InfeasiblePolicy, NoiseLayout, NoiseType};

#[derive(Error, Debug)]
pub enum ConfigError {
    #[error("failed to parse curriculum args: {0}")]
    CurriculumArgs(#[from] serde_json::Error),

    #[error("curriculum learning is enabled but no curriculum args were given")]
    MissingCurriculumArgs,

    #[error("unknown {kind} '{value}', expected one of: {expected}")]
    UnknownVariant {
        kind: &'static str,
        value: String,
        expected: &'static str,
    },

    #[error("noise rate {0} is outside [0, 1]")]
    RateOutOfRange(f64),

    #[error("curriculum min_rate {min_rate} must lie in [0, max_rate = {max_rate}]")]
    MinRateAboveMax { min_rate: f64, max_rate: f64 },

    #[error("curriculum exponent p must be positive, got {0}")]
    InvalidExponent(f64),

    #[error("curriculum {0} must be positive")]
    ZeroUpdates(&'static str),

    #[error("label smoothing must lie in [0, 1), got {0}")]
    InvalidLabelSmoothing(f64),

    #[error("reg_alpha must be finite and non-negative, got {0}")]
    InvalidRegAlpha(f64),

    #[error(
        "only_nll={subset} needs noise on the leading half of the doubled batch, but the model's noise layout is {layout:?}"
    )]
    SubsetWithoutNoisedHalf { subset: NllSubset, layout: NoiseLayout },
}

/// Which directions of the consistency KL to compute between the two halves.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum KlDirection {
    /// Average of both directions.
    #[default]
    Both,
    /// `KL(clean || noised)` only.
    Clean,
    /// `KL(noised || clean)` only.
    Noise,
}

/// Which half of the doubled batch feeds the label-smoothed NLL term.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum NllSubset {
    #[default]
    Both,
    /// Trailing (clean) half only.
    Clean,
    /// Leading (noised) half only.
    Noise,
}

impl KlDirection {
    pub fn as_str(&self) -> &'static str {
        match self {
            KlDirection::Both => "both",
            KlDirection::Clean => "clean",
            KlDirection::Noise => "noise",
        }
    }
}

impl NllSubset {
    pub fn as_str(&self) -> &'static str {
        match self {
            NllSubset::Both => "both",
            NllSubset::Clean => "clean",
            NllSubset::Noise => "noise",
        }
    }
}

impl FromStr for KlDirection {
    type Err = ConfigError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_lowercase().as_str() {
            "both" => Ok(KlDirection::Both),
            "clean" => Ok(KlDirection::Clean),
            "noise" => Ok(KlDirection::Noise),
            _ => Err(ConfigError::UnknownVariant {
                kind: "kl direction",
                value: s.to_string(),
                expected: "both, clean, noise",
            }),
        }
    }
}

impl FromStr for NllSubset {
    type Err = ConfigError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_lowercase().as_str() {
            "both" => Ok(NllSubset::Both),
            "clean" => Ok(NllSubset::Clean),
            "noise" => Ok(NllSubset::Noise),
            _ => Err(ConfigError::UnknownVariant {
                kind: "nll subset",
                value: s.to_string(),
                expected: "both, clean, noise",
            }),
        }
    }
}

impl fmt::Display for KlDirection {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl fmt::Display for NllSubset {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Source corruption flags as they appear on the training command line.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct NoiseArgs {
    #[serde(default)]
    pub add_noise: bool,

    #[serde(default)]
    pub noise_rate: f64,

    #[serde(default)]
    pub noise_type: NoiseType,

    /// Corrupt only the leading half of the batch the encoder sees.
    #[serde(default)]
    pub is_half_batch: bool,

    #[serde(default)]
    pub curriculum_learning: bool,

    /// JSON object with `max_rate`, `min_rate`, `cupdates`, `mupdates`, `reverse`, `p`, `type`.
    #[serde(default)]
    pub curriculum_args: Option<String>,

    /// Seed for position, substitute and hybrid draws. Entropy-seeded when unset.
    #[serde(default)]
    pub noise_seed: Option<u64>,

    #[serde(default)]
    pub on_infeasible: InfeasiblePolicy,
}

/// Validated corruption settings.
#[derive(Debug, Clone, PartialEq)]
pub struct CorruptionConfig {
    pub enabled: bool,
    pub operator: NoiseType,
    pub base_rate: f64,
    pub curriculum: Option<CurriculumConfig>,
    pub apply_to_half_batch: bool,
    pub seed: Option<u64>,
    pub on_infeasible: InfeasiblePolicy,
}

impl CorruptionConfig {
    pub fn disabled() -> Self {
        Self {
            enabled: false,
            operator: NoiseType::default(),
            base_rate: 0.0,
            curriculum: None,
            apply_to_half_batch: false,
            seed: None,
            on_infeasible: InfeasiblePolicy::default(),
        }
    }

    /// Where corrupted rows land in the batch handed to the encoder.
    pub fn layout(&self) -> NoiseLayout {
        match (self.enabled, self.apply_to_half_batch) {
            (false, _) => NoiseLayout::Disabled,
            (true, true) => NoiseLayout::LeadingHalf,
            (true, false) => NoiseLayout::Full,
        }
    }
}

impl NoiseArgs {
    /// Validates the flags and parses the curriculum JSON once, before any batch is seen.
    pub fn resolve(&self) -> Result<CorruptionConfig, ConfigError> {
        if !(0.0..=1.0).contains(&self.noise_rate) {
            return Err(ConfigError::RateOutOfRange(self.noise_rate));
        }
        let parsed = self
            .curriculum_args
            .as_deref()
            .map(CurriculumConfig::from_json)
            .transpose()?;
        let curriculum = if self.curriculum_learning {
            Some(parsed.ok_or(ConfigError::MissingCurriculumArgs)?)
        } else {
            None
        };
        let enabled = self.add_noise && (curriculum.is_some() || self.noise_rate != 0.0);
        Ok(CorruptionConfig {
            enabled,
            operator: self.noise_type,
            base_rate: self.noise_rate,
            curriculum,
            apply_to_half_batch: self.is_half_batch,
            seed: self.noise_seed,
            on_infeasible: self.on_infeasible,
        })
    }
}

/// Settings of the label-smoothed cross entropy with consistency regularization.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CriterionArgs {
    #[serde(default)]
    pub label_smoothing: f64,

    /// Weight of the KL consistency term.
    #[serde(default = "default_reg_alpha")]
    pub reg_alpha: f64,

    #[serde(default)]
    pub kl_direction: KlDirection,

    #[serde(default)]
    pub only_nll: NllSubset,

    /// Leading target positions excluded from the NLL term.
    #[serde(default)]
    pub ignore_prefix_size: usize,

    /// Normalize by sentences instead of tokens.
    #[serde(default)]
    pub sentence_avg: bool,

    #[serde(default)]
    pub report_accuracy: bool,
}

fn default_reg_alpha() -> f64 {
    1.5
}

impl Default for CriterionArgs {
    fn default() -> Self {
        Self {
            label_smoothing: 0.0,
            reg_alpha: default_reg_alpha(),
            kl_direction: KlDirection::default(),
            only_nll: NllSubset::default(),
            ignore_prefix_size: 0,
            sentence_avg: false,
            report_accuracy: false,
        }
    }
}

impl CriterionArgs {
    pub fn validate(&self) -> Result<(), ConfigError> {
        if !(0.0..1.0).contains(&self.label_smoothing) {
            return Err(ConfigError::InvalidLabelSmoothing(self.label_smoothing));
        }
        if !self.reg_alpha.is_finite() || self.reg_alpha < 0.0 {
            return Err(ConfigError::InvalidRegAlpha(self.reg_alpha));
        }
        Ok(())
    }

    /// Checks that the halves the NLL subset refers to exist under the model's noise layout.
    pub fn check_layout(&self, layout: NoiseLayout) -> Result<(), ConfigError> {
        match (self.only_nll, layout) {
            (NllSubset::Both, _) | (_, NoiseLayout::LeadingHalf) => Ok(()),
            (subset, layout) => Err(ConfigError::SubsetWithoutNoisedHalf { subset, layout }),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::{RateSampling, ScheduleDirection};

    #[test]
    fn test_resolve_plain_noise() {
        let args = NoiseArgs {
            add_noise: true,
            noise_rate: 0.15,
            noise_type: NoiseType::Swap,
            is_half_batch: true,
            ..Default::default()
        };
        let config = args.resolve().unwrap();
        assert!(config.enabled);
        assert_eq!(config.operator, NoiseType::Swap);
        assert_eq!(config.layout(), NoiseLayout::LeadingHalf);
        assert!(config.curriculum.is_none());
    }

    #[test]
    fn test_resolve_gates() {
        let zero_rate = NoiseArgs {
            add_noise: true,
            ..Default::default()
        };
        assert_eq!(zero_rate.resolve().unwrap().layout(), NoiseLayout::Disabled);

        let off = NoiseArgs {
            noise_rate: 0.3,
            ..Default::default()
        };
        assert!(!off.resolve().unwrap().enabled);
    }

    #[test]
    fn test_resolve_curriculum() {
        let args = NoiseArgs {
            add_noise: true,
            curriculum_learning: true,
            curriculum_args: Some(
                r#"{"max_rate":0.2,"min_rate":0.0,"cupdates":5,"mupdates":100,"p":2}"#.into(),
            ),
            ..Default::default()
        };
        let config = args.resolve().unwrap();
        assert!(config.enabled);
        let curriculum = config.curriculum.unwrap();
        assert_eq!(curriculum.direction, ScheduleDirection::Growing);
        assert_eq!(curriculum.sampling, RateSampling::UniformBelowCeiling);

        let missing = NoiseArgs {
            add_noise: true,
            curriculum_learning: true,
            ..Default::default()
        };
        assert!(matches!(
            missing.resolve(),
            Err(ConfigError::MissingCurriculumArgs)
        ));

        // unparseable args fail even when the curriculum is off
        let broken = NoiseArgs {
            curriculum_args: Some("{".into()),
            ..Default::default()
        };
        assert!(matches!(broken.resolve(), Err(ConfigError::CurriculumArgs(_))));
    }

    #[test]
    fn test_resolve_rejects_rate() {
        let args = NoiseArgs {
            add_noise: true,
            noise_rate: 1.2,
            ..Default::default()
        };
        assert!(matches!(args.resolve(), Err(ConfigError::RateOutOfRange(_))));
    }

    #[test]
    fn test_enum_names() {
        assert_eq!("clean".parse::<KlDirection>().unwrap(), KlDirection::Clean);
        assert_eq!("NOISE".parse::<NllSubset>().unwrap(), NllSubset::Noise);
        assert!("sideways".parse::<KlDirection>().is_err());
        assert_eq!(NllSubset::Both.to_string(), "both");

        let args: CriterionArgs =
            serde_json::from_str(r#"{"label_smoothing":0.1,"kl_direction":"noise"}"#).unwrap();
        assert_eq!(args.kl_direction, KlDirection::Noise);
        assert_eq!(args.reg_alpha, 1.5);
        args.validate().unwrap();
    }

    #[test]
    fn test_criterion_validation() {
        let args = CriterionArgs {
            label_smoothing: 1.0,
            ..Default::default()
        };
        assert!(args.validate().is_err());

        let args = CriterionArgs {
            reg_alpha: -1.0,
            ..Default::default()
        };
        assert!(args.validate().is_err());
    }

    #[test]
    fn test_subset_layout_contract() {
        let both = CriterionArgs::default();
        assert!(both.check_layout(NoiseLayout::Disabled).is_ok());

        let noise_only = CriterionArgs {
            only_nll: NllSubset::Noise,
            ..Default::default()
        };
        assert!(noise_only.check_layout(NoiseLayout::LeadingHalf).is_ok());
        assert!(matches!(
            noise_only.check_layout(NoiseLayout::Full),
            Err(ConfigError::SubsetWithoutNoisedHalf { .. })
        ));
    }
}
