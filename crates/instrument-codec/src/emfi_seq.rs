//! EMFI-Seq: a four-state stair-step sequencer bitstream.
//!
//! Control map:
//!
//! | Register    | Bits  | Field               |
//! |-------------|-------|---------------------|
//! | Control0    | 31    | sequencer enable, inverted (1 = disabled) |
//! | Control0    | 30    | clock enable, inverted (1 = frozen) |
//! | Control0    | 7:0   | clock divider (divide by value + 1) |
//! | Control1..4 | 6:0   | state 1..4 delay in cycles |
//! | Control5..8 | 15:0  | state 1..4 DAC level, signed 16-bit |

use crate::layout::{self, unpack_field, ControlLayout, RegisterWord};
use crate::{BitField, CodecError, FieldSpec, FieldValue, Transform, MOKU_DAC};
use serde::{Deserialize, Serialize};

pub const STATES: usize = 4;
pub const DELAY_MAX: u8 = 127;
pub const VOLTAGE_LIMIT: f64 = 5.0;
pub const CONTROL_COUNT: u8 = 9;

pub const DEFAULT_DELAYS: [u8; STATES] = [10, 20, 30, 40];
pub const DEFAULT_VOLTAGES: [f64; STATES] = [1.1, 1.2, 1.3, 1.4];

const DELAY: BitField = BitField::new(0, 7);
const LEVEL: BitField = BitField::new(0, 16);
const VOLTS: Transform = Transform::Volts(MOKU_DAC);

static FIELDS: [FieldSpec; 11] = [
    FieldSpec::new("sequencer.enabled", 0, BitField::bit(31), Transform::Flag { inverted: true }),
    FieldSpec::new("clock.enabled", 0, BitField::bit(30), Transform::Flag { inverted: true }),
    FieldSpec::new("clock.divider", 0, BitField::new(0, 8), Transform::Unsigned),
    FieldSpec::new("delays.state1", 1, DELAY, Transform::Unsigned),
    FieldSpec::new("delays.state2", 2, DELAY, Transform::Unsigned),
    FieldSpec::new("delays.state3", 3, DELAY, Transform::Unsigned),
    FieldSpec::new("delays.state4", 4, DELAY, Transform::Unsigned),
    FieldSpec::new("voltages.state1", 5, LEVEL, VOLTS),
    FieldSpec::new("voltages.state2", 6, LEVEL, VOLTS),
    FieldSpec::new("voltages.state3", 7, LEVEL, VOLTS),
    FieldSpec::new("voltages.state4", 8, LEVEL, VOLTS),
];

/// Canonical EMFI-Seq configuration, as produced by [`resolve`](crate::resolve).
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct EmfiSeqConfig {
    /// Cycles spent in each state, 0..=127.
    pub delays: [u8; STATES],
    /// DAC level of each state in volts, -5.0..=5.0.
    pub voltages: [f64; STATES],
    /// Raw divider select; the sequencer clock runs at f / (divider + 1).
    pub clock_divider: u8,
    pub clock_enabled: bool,
    pub sequencer_enabled: bool,
}

impl Default for EmfiSeqConfig {
    fn default() -> Self {
        Self {
            delays: DEFAULT_DELAYS,
            voltages: DEFAULT_VOLTAGES,
            clock_divider: 0,
            clock_enabled: true,
            sequencer_enabled: false,
        }
    }
}

/// `delays.state3` -> 2
fn state_slot(name: &str, section: &str) -> Option<usize> {
    let n: usize = name
        .strip_prefix(section)?
        .strip_prefix(".state")?
        .parse()
        .ok()?;
    n.checked_sub(1).filter(|i| *i < STATES)
}

impl EmfiSeqConfig {
    /// Control words 0..=8, in order.
    pub fn encode(&self) -> Result<Vec<RegisterWord>, CodecError> {
        layout::encode(self)
    }

    /// Rebuild a configuration from control words read back from the device.
    pub fn from_controls(words: &[u32]) -> Result<Self, CodecError> {
        if words.len() < usize::from(CONTROL_COUNT) {
            return Err(CodecError::WordCount {
                expected: usize::from(CONTROL_COUNT),
                got: words.len(),
            });
        }
        let mut config = Self::default();
        for field in &FIELDS {
            config.set_field(field, unpack_field(words, field)?)?;
        }
        Ok(config)
    }

    pub fn with_sequencer_enabled(mut self, enabled: bool) -> Self {
        self.sequencer_enabled = enabled;
        self
    }

    fn set_field(&mut self, field: &FieldSpec, value: FieldValue) -> Result<(), CodecError> {
        let kind = CodecError::FieldKind { field: field.name };
        match (field.name, value) {
            ("sequencer.enabled", FieldValue::Flag(on)) => self.sequencer_enabled = on,
            ("clock.enabled", FieldValue::Flag(on)) => self.clock_enabled = on,
            ("clock.divider", FieldValue::Unsigned(v)) => {
                self.clock_divider = u8::try_from(v).map_err(|_| kind)?;
            }
            (name, FieldValue::Unsigned(v)) => {
                let slot = state_slot(name, "delays").ok_or(kind)?;
                self.delays[slot] = u8::try_from(v).map_err(|_| CodecError::FieldKind {
                    field: field.name,
                })?;
            }
            (name, FieldValue::Volts(v)) => {
                let slot = state_slot(name, "voltages").ok_or(kind)?;
                self.voltages[slot] = v;
            }
            _ => return Err(kind),
        }
        Ok(())
    }
}

impl ControlLayout for EmfiSeqConfig {
    const CONTROL_COUNT: u8 = CONTROL_COUNT;

    fn fields() -> &'static [FieldSpec] {
        &FIELDS
    }

    fn field_value(&self, field: &FieldSpec) -> Option<FieldValue> {
        let value = match field.name {
            "sequencer.enabled" => FieldValue::Flag(self.sequencer_enabled),
            "clock.enabled" => FieldValue::Flag(self.clock_enabled),
            "clock.divider" => FieldValue::Unsigned(u32::from(self.clock_divider)),
            name => {
                if let Some(i) = state_slot(name, "delays") {
                    FieldValue::Unsigned(u32::from(self.delays[i]))
                } else if let Some(i) = state_slot(name, "voltages") {
                    FieldValue::Volts(self.voltages[i])
                } else {
                    return None;
                }
            }
        };
        Some(value)
    }
}
