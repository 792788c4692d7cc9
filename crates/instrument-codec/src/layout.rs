use crate::{CodecError, FieldSpec, FieldValue};
use core::fmt;
use serde::Serialize;

/// One control register write: the wire-level contract with the device.
#[derive(Clone, Copy, Debug, Eq, PartialEq, Hash, Serialize)]
pub struct RegisterWord {
    pub index: u8,
    pub value: u32,
}

impl fmt::Display for RegisterWord {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "Control{:<2} 0x{:08X}", self.index, self.value)
    }
}

/// A configuration that maps onto an instrument's control registers field by field.
pub trait ControlLayout {
    /// Control registers `0..CONTROL_COUNT` are written, in order.
    const CONTROL_COUNT: u8;

    /// The register map, one entry per field.
    fn fields() -> &'static [FieldSpec];

    /// Logical value of `field`; `None` for a field this configuration does not know.
    fn field_value(&self, field: &FieldSpec) -> Option<FieldValue>;
}

/// Build one word per control register in ascending index order. Bits not covered by
/// any field are zero.
pub fn encode<L: ControlLayout>(config: &L) -> Result<Vec<RegisterWord>, CodecError> {
    let mut words = Vec::with_capacity(usize::from(L::CONTROL_COUNT));
    for index in 0..L::CONTROL_COUNT {
        let mut value = 0u32;
        for field in L::fields().iter().filter(|f| f.register == index) {
            let logical = config
                .field_value(field)
                .ok_or(CodecError::FieldKind { field: field.name })?;
            value |= field.pack(logical)?;
        }
        words.push(RegisterWord { index, value });
    }
    Ok(words)
}

/// Read `field` back out of a full set of control words.
pub fn unpack_field(words: &[u32], field: &FieldSpec) -> Result<FieldValue, CodecError> {
    let word = words
        .get(usize::from(field.register))
        .ok_or(CodecError::WordCount {
            expected: usize::from(field.register) + 1,
            got: words.len(),
        })?;
    Ok(field.unpack(*word))
}
