use crate::CodecError;

/// A contiguous bit range inside a 32-bit register word.
#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub struct BitField {
    pub offset: u8,
    pub width: u8,
}

impl BitField {
    /// `offset + width` must not exceed 32.
    pub const fn new(offset: u8, width: u8) -> Self {
        Self { offset, width }
    }

    pub const fn bit(offset: u8) -> Self {
        Self { offset, width: 1 }
    }

    /// Largest value the field holds.
    pub const fn max_value(self) -> u32 {
        if self.width >= 32 {
            u32::MAX
        } else {
            (1u32 << self.width) - 1
        }
    }

    /// Positioned mask of the field within the word.
    pub const fn mask(self) -> u32 {
        self.max_value() << self.offset
    }

    /// `value` placed at the field position, or `None` if it does not fit.
    pub fn place(self, value: u32) -> Option<u32> {
        if value > self.max_value() {
            return None;
        }
        Some(value << self.offset)
    }

    pub const fn extract(self, word: u32) -> u32 {
        (word >> self.offset) & self.max_value()
    }

    /// Extract and sign-extend a two's complement field.
    pub const fn extract_signed(self, word: u32) -> i32 {
        let raw = self.extract(word);
        if self.width == 0 {
            return 0;
        }
        if self.width >= 32 {
            return raw as i32;
        }
        let shift = 32 - self.width as u32;
        ((raw << shift) as i32) >> shift
    }
}

/// Linear map between volts and a signed DAC code: `code = round(v / full_scale * max_code)`.
#[derive(Clone, Copy, Debug, PartialEq)]
pub struct VoltageScale {
    pub full_scale: f64,
    pub max_code: i32,
}

/// Moku DAC range: +/-5 V onto signed 16-bit codes.
pub const MOKU_DAC: VoltageScale = VoltageScale {
    full_scale: 5.0,
    max_code: 32767,
};

impl VoltageScale {
    /// Smallest representable voltage change.
    pub fn step(self) -> f64 {
        self.full_scale / f64::from(self.max_code)
    }

    pub fn contains(self, volts: f64) -> bool {
        volts.is_finite() && volts.abs() <= self.full_scale
    }

    /// Quantize, clamping to the signed 16-bit range.
    pub fn to_code(self, volts: f64) -> i16 {
        let code = (volts / self.full_scale * f64::from(self.max_code)).round();
        code.clamp(f64::from(i16::MIN), f64::from(i16::MAX)) as i16
    }

    /// Codes past `max_code` (the asymmetric two's complement minimum) read as full scale.
    pub fn to_volts(self, code: i16) -> f64 {
        let code = i32::from(code).clamp(-self.max_code, self.max_code);
        f64::from(code) / f64::from(self.max_code) * self.full_scale
    }
}

/// How a logical value maps onto raw field bits.
#[derive(Clone, Copy, Debug, PartialEq)]
pub enum Transform {
    /// Packed verbatim.
    Unsigned,
    /// Signed fixed-point voltage, two's complement within the field.
    Volts(VoltageScale),
    /// Single bit; `inverted` means logical true is a cleared bit.
    Flag { inverted: bool },
}

#[derive(Clone, Copy, Debug, PartialEq)]
pub enum FieldValue {
    Unsigned(u32),
    Volts(f64),
    Flag(bool),
}

/// One named field of an instrument's register map.
#[derive(Clone, Copy, Debug, PartialEq)]
pub struct FieldSpec {
    pub name: &'static str,
    pub register: u8,
    pub bits: BitField,
    pub transform: Transform,
}

impl FieldSpec {
    pub const fn new(name: &'static str, register: u8, bits: BitField, transform: Transform) -> Self {
        Self {
            name,
            register,
            bits,
            transform,
        }
    }

    /// Raw bits for `value`, already shifted into position.
    pub fn pack(&self, value: FieldValue) -> Result<u32, CodecError> {
        let raw = match (self.transform, value) {
            (Transform::Unsigned, FieldValue::Unsigned(v)) => v,
            (Transform::Volts(scale), FieldValue::Volts(v)) => {
                if !scale.contains(v) {
                    return Err(CodecError::EncodeRange {
                        field: self.name,
                        value: v,
                        min: -scale.full_scale,
                        max: scale.full_scale,
                    });
                }
                // two's complement, truncated to the field width
                (scale.to_code(v) as i32 as u32) & self.bits.max_value()
            }
            (Transform::Flag { inverted }, FieldValue::Flag(on)) => u32::from(on != inverted),
            _ => return Err(CodecError::FieldKind { field: self.name }),
        };
        self.bits.place(raw).ok_or(CodecError::EncodeRange {
            field: self.name,
            value: f64::from(raw),
            min: 0.0,
            max: f64::from(self.bits.max_value()),
        })
    }

    /// Logical value held by this field in `word`.
    pub fn unpack(&self, word: u32) -> FieldValue {
        match self.transform {
            Transform::Unsigned => FieldValue::Unsigned(self.bits.extract(word)),
            Transform::Volts(scale) => {
                let code = self
                    .bits
                    .extract_signed(word)
                    .clamp(i32::from(i16::MIN), i32::from(i16::MAX)) as i16;
                FieldValue::Volts(scale.to_volts(code))
            }
            Transform::Flag { inverted } => FieldValue::Flag((self.bits.extract(word) == 1) != inverted),
        }
    }
}
