use serde::{Deserialize, Serialize};

use crate::bytecode::ImmediateLookup;
use crate::cursor::Cursor;
use crate::error::{Error, Result};
use crate::immediate::{read_immediate, Payload};

/// A decoded instruction with its raw opcode.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Instruction {
    /// Byte offset within the instruction stream.
    pub offset: usize,
    pub opcode: u16,
    /// Integer immediate. For tagged constants this holds the tag.
    pub imm: i32,
    pub payload: Payload,
}

impl Instruction {
    pub fn new(opcode: u16, imm: i32, payload: Payload) -> Self {
        Self {
            offset: 0,
            opcode,
            imm,
            payload,
        }
    }
}

/// Decode exactly `count` instructions from `code`.
///
/// Bytes left over after the last instruction mean the immediate kinds
/// used were wrong, so they are reported as an error rather than ignored.
pub fn decode(
    code: &[u8],
    count: usize,
    lookup: &mut impl ImmediateLookup,
) -> Result<Vec<Instruction>> {
    let mut c = Cursor::new(code);
    let mut instructions = Vec::with_capacity(count);

    for _ in 0..count {
        let offset = c.offset();
        let opcode = c.read_u16()?;
        let kind = lookup.immediate_kind(opcode);
        let (imm, payload) = read_immediate(&mut c, kind)?;
        instructions.push(Instruction {
            offset,
            opcode,
            imm,
            payload,
        });
    }

    if !c.at_end() {
        return Err(Error::TrailingBytes {
            offset: c.offset(),
            count: c.rest(),
        });
    }
    Ok(instructions)
}
