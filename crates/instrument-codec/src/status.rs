use crate::{BitField, CodecError, MOKU_DAC};
use serde::Serialize;

pub const OUTPUT_WORDS: usize = 4;

const DAC_CODE: BitField = BitField::new(0, 16);
const ENTERED: BitField = BitField::new(0, 4);
const STATE: BitField = BitField::new(0, 4);
const MONITOR: BitField = BitField::new(4, 12);
const CLOCK_COUNTER: BitField = BitField::new(0, 8);

/// Sequencer position as reported by the one-hot state field.
#[derive(Clone, Copy, Debug, Eq, PartialEq, Serialize)]
pub enum SequencerState {
    Idle,
    /// 1-based state number.
    Step(u8),
    /// More than one bit set; the raw field is kept for diagnostics.
    Invalid(u8),
}

impl SequencerState {
    fn from_one_hot(raw: u32) -> Self {
        match raw {
            0 => Self::Idle,
            r if r.is_power_of_two() => Self::Step(r.trailing_zeros() as u8 + 1),
            r => Self::Invalid(r as u8),
        }
    }
}

/// Bits of each output word that no known field covers, left in place.
#[derive(Clone, Copy, Debug, Default, Eq, PartialEq, Serialize)]
pub struct ReservedBits {
    pub output_a: u32,
    pub output_b: u32,
    pub output_c: u32,
    pub output_d: u32,
}

impl ReservedBits {
    pub fn is_clear(&self) -> bool {
        *self == Self::default()
    }
}

#[derive(Clone, Debug, PartialEq, Serialize)]
pub struct StatusSnapshot {
    pub dac_code: i16,
    pub dac_volts: f64,
    /// Sticky "state N was entered" markers.
    pub entered: [bool; 4],
    pub state: SequencerState,
    pub monitor_msbs: u16,
    pub clock_counter: u8,
    pub reserved: ReservedBits,
}

/// Decode OutputA..OutputD of the EMFI-Seq bitstream.
pub fn decode_status(words: &[u32]) -> Result<StatusSnapshot, CodecError> {
    let [a, b, c, d] = <[u32; OUTPUT_WORDS]>::try_from(words).map_err(|_| CodecError::WordCount {
        expected: OUTPUT_WORDS,
        got: words.len(),
    })?;

    let dac_code = DAC_CODE.extract_signed(a) as i16;
    let markers = ENTERED.extract(b);
    let mut entered = [false; 4];
    for (i, slot) in entered.iter_mut().enumerate() {
        *slot = markers & (1 << i) != 0;
    }

    let reserved = ReservedBits {
        output_a: a & !DAC_CODE.mask(),
        output_b: b & !ENTERED.mask(),
        output_c: c & !(STATE.mask() | MONITOR.mask()),
        output_d: d & !CLOCK_COUNTER.mask(),
    };
    if !reserved.is_clear() {
        tracing::debug!(?reserved, "reserved status bits set");
    }

    Ok(StatusSnapshot {
        dac_code,
        dac_volts: MOKU_DAC.to_volts(dac_code),
        entered,
        state: SequencerState::from_one_hot(STATE.extract(c)),
        monitor_msbs: MONITOR.extract(c) as u16,
        clock_counter: CLOCK_COUNTER.extract(d) as u8,
        reserved,
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_decode_typical_status() {
        let snap = decode_status(&[0x1EB8, 0b0011, 0x0AB2, 0x07]).unwrap();
        assert_eq!(snap.dac_code, 0x1EB8);
        assert!((snap.dac_volts - 1.2).abs() <= MOKU_DAC.step());
        assert_eq!(snap.entered, [true, true, false, false]);
        assert_eq!(snap.state, SequencerState::Step(2));
        assert_eq!(snap.monitor_msbs, 0x0AB);
        assert_eq!(snap.clock_counter, 7);
        assert!(snap.reserved.is_clear());
    }

    #[test]
    fn test_negative_dac_code() {
        let snap = decode_status(&[0x8001, 0, 0, 0]).unwrap();
        assert_eq!(snap.dac_code, -32767);
        assert!((snap.dac_volts + 5.0).abs() < 1e-9);
        assert_eq!(snap.state, SequencerState::Idle);
    }

    #[test]
    fn test_multiple_state_bits_are_invalid() {
        let snap = decode_status(&[0, 0, 0b0101, 0]).unwrap();
        assert_eq!(snap.state, SequencerState::Invalid(0b0101));
    }

    #[test]
    fn test_reserved_bits_are_surfaced_not_dropped() {
        let snap = decode_status(&[0xDEAD_0001, 0xF0, 0x0001_0008, 0x1234_5678]).unwrap();
        assert_eq!(snap.dac_code, 1);
        assert_eq!(snap.entered, [false; 4]);
        assert_eq!(snap.state, SequencerState::Step(4));
        assert_eq!(snap.clock_counter, 0x78);
        assert_eq!(
            snap.reserved,
            ReservedBits {
                output_a: 0xDEAD_0000,
                output_b: 0xF0,
                output_c: 0x0001_0000,
                output_d: 0x1234_5600,
            }
        );
    }

    #[test]
    fn test_word_count_is_exact() {
        assert!(matches!(
            decode_status(&[0; 3]),
            Err(CodecError::WordCount { expected: 4, got: 3 })
        ));
        assert!(decode_status(&[0; 5]).is_err());
    }
}
