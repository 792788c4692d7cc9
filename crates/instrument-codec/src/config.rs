//! Typed partial configuration layers and their resolution into an [`EmfiSeqConfig`].

use crate::emfi_seq::{DELAY_MAX, STATES, VOLTAGE_LIMIT};
use crate::{ConfigError, EmfiSeqConfig, Result};
use serde::{Deserialize, Serialize};
use tracing::debug;

/// `state1..state4` of one per-state section.
#[derive(Clone, Copy, Debug, Default, PartialEq, Serialize, Deserialize)]
#[cfg_attr(feature = "schema", derive(schemars::JsonSchema))]
#[serde(default, deny_unknown_fields)]
pub struct StateLayer<T> {
    #[serde(skip_serializing_if = "Option::is_none")]
    pub state1: Option<T>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub state2: Option<T>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub state3: Option<T>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub state4: Option<T>,
}

impl<T: Copy> StateLayer<T> {
    pub fn full(values: [T; STATES]) -> Self {
        let [a, b, c, d] = values;
        Self {
            state1: Some(a),
            state2: Some(b),
            state3: Some(c),
            state4: Some(d),
        }
    }

    pub fn slots(&self) -> [Option<T>; STATES] {
        [self.state1, self.state2, self.state3, self.state4]
    }

    fn slot_mut(&mut self, key: &str) -> Option<&mut Option<T>> {
        match key {
            "state1" => Some(&mut self.state1),
            "state2" => Some(&mut self.state2),
            "state3" => Some(&mut self.state3),
            "state4" => Some(&mut self.state4),
            _ => None,
        }
    }

    fn overlay(&mut self, upper: &Self) {
        lift(&mut self.state1, upper.state1);
        lift(&mut self.state2, upper.state2);
        lift(&mut self.state3, upper.state3);
        lift(&mut self.state4, upper.state4);
    }
}

#[derive(Clone, Copy, Debug, Default, PartialEq, Serialize, Deserialize)]
#[cfg_attr(feature = "schema", derive(schemars::JsonSchema))]
#[serde(default, deny_unknown_fields)]
pub struct ClockLayer {
    #[serde(skip_serializing_if = "Option::is_none")]
    pub divider: Option<i64>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub enabled: Option<bool>,
}

#[derive(Clone, Copy, Debug, Default, PartialEq, Serialize, Deserialize)]
#[cfg_attr(feature = "schema", derive(schemars::JsonSchema))]
#[serde(default, deny_unknown_fields)]
pub struct SequencerLayer {
    #[serde(skip_serializing_if = "Option::is_none")]
    pub enabled: Option<bool>,
}

/// One layer of EMFI-Seq configuration. Every field is optional; an absent field falls
/// through to the layer below.
///
/// ```yaml
/// delays:
///   state1: 12
/// voltages:
///   state2: -1.25
/// clock:
///   divider: 3
/// ```
#[derive(Clone, Debug, Default, PartialEq, Serialize, Deserialize)]
#[cfg_attr(feature = "schema", derive(schemars::JsonSchema))]
#[serde(default, deny_unknown_fields)]
pub struct EmfiSeqLayer {
    pub delays: StateLayer<i64>,
    pub voltages: StateLayer<f64>,
    pub clock: ClockLayer,
    pub sequencer: SequencerLayer,
}

fn lift<T: Copy>(dst: &mut Option<T>, src: Option<T>) {
    if src.is_some() {
        *dst = src;
    }
}

impl EmfiSeqLayer {
    /// The built-in defaults as a complete layer.
    pub fn defaults() -> Self {
        Self::from_config(&EmfiSeqConfig::default())
    }

    pub fn from_config(config: &EmfiSeqConfig) -> Self {
        Self {
            delays: StateLayer::full(config.delays.map(i64::from)),
            voltages: StateLayer::full(config.voltages),
            clock: ClockLayer {
                divider: Some(i64::from(config.clock_divider)),
                enabled: Some(config.clock_enabled),
            },
            sequencer: SequencerLayer {
                enabled: Some(config.sequencer_enabled),
            },
        }
    }

    pub fn is_empty(&self) -> bool {
        *self == Self::default()
    }

    /// Apply every field `upper` sets on top of `self`.
    pub fn overlay(&mut self, upper: &Self) {
        self.delays.overlay(&upper.delays);
        self.voltages.overlay(&upper.voltages);
        lift(&mut self.clock.divider, upper.clock.divider);
        lift(&mut self.clock.enabled, upper.clock.enabled);
        lift(&mut self.sequencer.enabled, upper.sequencer.enabled);
    }

    /// Set one field from its dotted path, e.g. `set("voltages.state2", "-1.25")`.
    pub fn set(&mut self, path: &str, value: &str) -> Result<()> {
        let unknown = || ConfigError::UnknownField(path.to_string());
        let invalid = || ConfigError::InvalidValue {
            field: path.to_string(),
            value: value.to_string(),
        };
        let (section, key) = path.split_once('.').ok_or_else(unknown)?;
        let value = value.trim();
        match (section, key) {
            ("delays", key) => {
                let slot = self.delays.slot_mut(key).ok_or_else(unknown)?;
                *slot = Some(value.parse().map_err(|_| invalid())?);
            }
            ("voltages", key) => {
                let slot = self.voltages.slot_mut(key).ok_or_else(unknown)?;
                *slot = Some(value.parse().map_err(|_| invalid())?);
            }
            ("clock", "divider") => {
                self.clock.divider = Some(value.parse().map_err(|_| invalid())?);
            }
            ("clock", "enabled") => {
                self.clock.enabled = Some(parse_flag(value).ok_or_else(invalid)?);
            }
            ("sequencer", "enabled") => {
                self.sequencer.enabled = Some(parse_flag(value).ok_or_else(invalid)?);
            }
            _ => return Err(unknown()),
        }
        Ok(())
    }

    /// Apply a `section.key=value` assignment.
    pub fn apply_assignment(&mut self, assignment: &str) -> Result<()> {
        let (path, value) = assignment
            .split_once('=')
            .ok_or_else(|| ConfigError::InvalidValue {
                field: assignment.to_string(),
                value: String::new(),
            })?;
        self.set(path.trim(), value)
    }
}

pub(crate) fn parse_flag(value: &str) -> Option<bool> {
    match value.to_ascii_lowercase().as_str() {
        "true" | "1" | "yes" | "on" => Some(true),
        "false" | "0" | "no" | "off" => Some(false),
        _ => None,
    }
}

fn integer(field: String, value: Option<i64>, max: u8) -> Result<u8> {
    let value = value.ok_or_else(|| ConfigError::Missing(field.clone()))?;
    u8::try_from(value)
        .ok()
        .filter(|v| *v <= max)
        .ok_or(ConfigError::Range {
            field,
            value: value as f64,
            min: 0.0,
            max: f64::from(max),
        })
}

fn volts(field: String, value: Option<f64>) -> Result<f64> {
    let value = value.ok_or_else(|| ConfigError::Missing(field.clone()))?;
    if !value.is_finite() || value.abs() > VOLTAGE_LIMIT {
        return Err(ConfigError::Range {
            field,
            value,
            min: -VOLTAGE_LIMIT,
            max: VOLTAGE_LIMIT,
        });
    }
    Ok(value)
}

fn flag(field: &str, value: Option<bool>) -> Result<bool> {
    value.ok_or_else(|| ConfigError::Missing(field.to_string()))
}

/// Merge `defaults < file < overrides` field by field and validate the result.
pub fn resolve(
    defaults: &EmfiSeqLayer,
    file: Option<&EmfiSeqLayer>,
    overrides: &EmfiSeqLayer,
) -> Result<EmfiSeqConfig> {
    let mut merged = defaults.clone();
    if let Some(file) = file {
        merged.overlay(file);
    }
    merged.overlay(overrides);

    let mut delays = [0u8; STATES];
    for (i, (slot, value)) in delays.iter_mut().zip(merged.delays.slots()).enumerate() {
        *slot = integer(format!("delays.state{}", i + 1), value, DELAY_MAX)?;
    }
    let mut voltages = [0.0; STATES];
    for (i, (slot, value)) in voltages.iter_mut().zip(merged.voltages.slots()).enumerate() {
        *slot = volts(format!("voltages.state{}", i + 1), value)?;
    }
    let config = EmfiSeqConfig {
        delays,
        voltages,
        clock_divider: integer("clock.divider".to_string(), merged.clock.divider, u8::MAX)?,
        clock_enabled: flag("clock.enabled", merged.clock.enabled)?,
        sequencer_enabled: flag("sequencer.enabled", merged.sequencer.enabled)?,
    };
    debug!(?config, from_file = file.is_some(), "configuration resolved");
    Ok(config)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_precedence_per_field() {
        let mut defaults = EmfiSeqLayer::defaults();
        defaults.delays.state1 = Some(10);
        let file = EmfiSeqLayer {
            delays: StateLayer {
                state1: Some(20),
                state2: Some(30),
                ..StateLayer::default()
            },
            ..EmfiSeqLayer::default()
        };
        let mut overrides = EmfiSeqLayer::default();
        overrides.set("delays.state2", "99").unwrap();

        let config = resolve(&defaults, Some(&file), &overrides).unwrap();
        assert_eq!(config.delays[0], 20);
        assert_eq!(config.delays[1], 99);
        assert_eq!(config.delays[2], 30);
        assert_eq!(config.voltages, [1.1, 1.2, 1.3, 1.4]);
    }

    #[test]
    fn test_partial_layers_leave_other_fields() {
        let mut file = EmfiSeqLayer::default();
        file.voltages.state3 = Some(-2.0);
        let config = resolve(&EmfiSeqLayer::defaults(), Some(&file), &EmfiSeqLayer::default()).unwrap();
        assert_eq!(config.voltages, [1.1, 1.2, -2.0, 1.4]);
        assert_eq!(config.delays, [10, 20, 30, 40]);
        assert!(config.clock_enabled);
        assert!(!config.sequencer_enabled);
    }

    #[test]
    fn test_six_volts_is_a_range_error() {
        let mut overrides = EmfiSeqLayer::default();
        overrides.set("voltages.state1", "6.0").unwrap();
        let err = resolve(&EmfiSeqLayer::defaults(), None, &overrides).unwrap_err();
        match err {
            ConfigError::Range {
                field,
                value,
                min,
                max,
            } => {
                assert_eq!(field, "voltages.state1");
                assert_eq!(value, 6.0);
                assert_eq!((min, max), (-5.0, 5.0));
            }
            other => panic!("unexpected {other:?}"),
        }
    }

    #[test]
    fn test_delay_and_divider_bounds() {
        let mut overrides = EmfiSeqLayer::default();
        overrides.delays.state4 = Some(128);
        let err = resolve(&EmfiSeqLayer::defaults(), None, &overrides).unwrap_err();
        assert!(err.to_string().contains("delays.state4 = 128"));

        let mut overrides = EmfiSeqLayer::default();
        overrides.clock.divider = Some(-1);
        assert!(matches!(
            resolve(&EmfiSeqLayer::defaults(), None, &overrides),
            Err(ConfigError::Range { .. })
        ));

        let mut overrides = EmfiSeqLayer::default();
        overrides.clock.divider = Some(255);
        overrides.delays.state1 = Some(127);
        overrides.voltages.state1 = Some(-5.0);
        let config = resolve(&EmfiSeqLayer::defaults(), None, &overrides).unwrap();
        assert_eq!(config.clock_divider, 255);
        assert_eq!(config.delays[0], 127);
    }

    #[test]
    fn test_missing_field_without_defaults() {
        let mut file = EmfiSeqLayer::defaults();
        file.voltages.state2 = None;
        let err = resolve(&EmfiSeqLayer::default(), Some(&file), &EmfiSeqLayer::default()).unwrap_err();
        assert!(matches!(err, ConfigError::Missing(f) if f == "voltages.state2"));
    }

    #[test]
    fn test_assignments() {
        let mut layer = EmfiSeqLayer::default();
        layer.apply_assignment("sequencer.enabled=yes").unwrap();
        layer.apply_assignment("clock.enabled = off").unwrap();
        layer.apply_assignment("voltages.state2=-1.25").unwrap();
        assert_eq!(layer.sequencer.enabled, Some(true));
        assert_eq!(layer.clock.enabled, Some(false));
        assert_eq!(layer.voltages.state2, Some(-1.25));

        assert!(matches!(
            layer.apply_assignment("delays.state5=1"),
            Err(ConfigError::UnknownField(_))
        ));
        assert!(matches!(
            layer.apply_assignment("timing.delay=1"),
            Err(ConfigError::UnknownField(_))
        ));
        assert!(matches!(
            layer.apply_assignment("delays.state1=ten"),
            Err(ConfigError::InvalidValue { .. })
        ));
        assert!(layer.apply_assignment("delays.state1").is_err());
    }

    #[test]
    fn test_resolved_config_encodes() {
        let config = resolve(&EmfiSeqLayer::defaults(), None, &EmfiSeqLayer::default()).unwrap();
        assert_eq!(config, EmfiSeqConfig::default());
        assert_eq!(config.encode().unwrap().len(), 9);
    }
}
