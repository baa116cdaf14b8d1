//! Raw instruction stream: `(u16 opcode, immediate)` pairs.
//!
//! The stream itself does not say how long an immediate is, so both
//! directions ask an [`ImmediateLookup`] for the kind of every opcode.

pub mod decode;
pub mod encode;

pub use decode::{decode, Instruction};
pub use encode::encode;

use crate::immediate::ImmediateKind;

/// Source of immediate kinds per raw opcode.
///
/// Takes `&mut self` so that a lookup may record opcodes it has never seen.
pub trait ImmediateLookup {
    fn immediate_kind(&mut self, opcode: u16) -> ImmediateKind;
}

impl<F: FnMut(u16) -> ImmediateKind> ImmediateLookup for F {
    fn immediate_kind(&mut self, opcode: u16) -> ImmediateKind {
        self(opcode)
    }
}
