//! instrument-codec: configuration layering and register encoding for Moku instruments
//!
//! A configuration is resolved from typed partial layers (built-in defaults, a YAML file,
//! per-field overrides), validated, and packed into control register words through a
//! per-instrument field table. Output words decode back into a [`StatusSnapshot`].

mod error;
pub use error::{CodecError, ConfigError, Result};

mod field;
pub use field::{BitField, FieldSpec, FieldValue, Transform, VoltageScale, MOKU_DAC};

mod layout;
pub use layout::{encode, unpack_field, ControlLayout, RegisterWord};

pub mod emfi_seq;
pub use emfi_seq::EmfiSeqConfig;

mod status;
pub use status::{decode_status, ReservedBits, SequencerState, StatusSnapshot, OUTPUT_WORDS};

mod config;
pub use config::{resolve, ClockLayer, EmfiSeqLayer, SequencerLayer, StateLayer};

mod loader;
pub use loader::{load_layer_file, locate, resolve_with_file};
