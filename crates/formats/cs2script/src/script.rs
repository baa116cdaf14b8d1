use serde::{Deserialize, Serialize};

use crate::bytecode::{decode, encode, ImmediateLookup, Instruction};
use crate::cursor::{Cursor, Writer};
use crate::error::{Error, Result};

/// One entry of a switch jump table. `jump` is relative to the instruction
/// following the `switch` op.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct SwitchCase {
    pub value: i32,
    pub jump: i32,
}

/// Per-primitive slot counts, used for both arguments and locals.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct SlotCounts {
    pub int: u16,
    pub long: u16,
    pub string: u16,
}

/// Fixed part of a script blob that precedes the instruction stream.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct ScriptHeader {
    pub byte0: u8,
    pub switches: Vec<Vec<SwitchCase>>,
    pub args: SlotCounts,
    pub locals: SlotCounts,
    pub instruction_count: u16,
}

impl ScriptHeader {
    /// Byte size of the switch table section as stored in the header.
    pub fn switch_size(switches: &[Vec<SwitchCase>]) -> usize {
        if switches.is_empty() {
            return 0;
        }
        1 + switches.iter().map(|t| 2 + t.len() * 8).sum::<usize>()
    }

    pub fn parse(c: &mut Cursor<'_>) -> Result<Self> {
        let byte0 = c.read_u8()?;
        let switch_size = c.read_u16()?;
        let mut switches = Vec::new();
        if switch_size > 0 {
            let table_count = c.read_u8()?;
            for _ in 0..table_count {
                let case_count = c.read_u16()?;
                let mut table = Vec::with_capacity(case_count as usize);
                for _ in 0..case_count {
                    let value = c.read_i32()?;
                    let jump = c.read_i32()?;
                    table.push(SwitchCase { value, jump });
                }
                switches.push(table);
            }
        }
        let args = SlotCounts {
            long: c.read_u16()?,
            string: c.read_u16()?,
            int: c.read_u16()?,
        };
        let locals = SlotCounts {
            long: c.read_u16()?,
            string: c.read_u16()?,
            int: c.read_u16()?,
        };
        let instruction_count = c.read_u16()?;
        Ok(Self {
            byte0,
            switches,
            args,
            locals,
            instruction_count,
        })
    }

    pub fn write(&self, w: &mut Writer) -> Result<()> {
        let switch_size = Self::switch_size(&self.switches);
        let switch_size = check_limit("switch table size", switch_size, u16::MAX as usize)?;
        w.write_u8(self.byte0);
        w.write_u16(switch_size as u16);
        if switch_size > 0 {
            let count = check_limit("switch table count", self.switches.len(), u8::MAX as usize)?;
            w.write_u8(count as u8);
            for table in &self.switches {
                w.write_u16(table.len() as u16);
                for case in table {
                    w.write_i32(case.value);
                    w.write_i32(case.jump);
                }
            }
        }
        for counts in [&self.args, &self.locals] {
            w.write_u16(counts.long);
            w.write_u16(counts.string);
            w.write_u16(counts.int);
        }
        w.write_u16(self.instruction_count);
        Ok(())
    }
}

fn check_limit(field: &'static str, value: usize, max: usize) -> Result<usize> {
    if value > max {
        return Err(Error::LimitExceeded { field, value, max });
    }
    Ok(value)
}

/// A script whose header is parsed but whose instruction stream is still
/// raw bytes. Used while opcode immediates are unknown.
#[derive(Debug, Clone)]
pub struct RawScript<'a> {
    pub header: ScriptHeader,
    pub code: &'a [u8],
}

impl<'a> RawScript<'a> {
    pub fn parse(data: &'a [u8]) -> Result<Self> {
        let mut c = Cursor::new(data);
        let header = ScriptHeader::parse(&mut c)?;
        let code = &data[c.offset()..];
        Ok(Self { header, code })
    }

    pub fn decode(&self, lookup: &mut impl ImmediateLookup) -> Result<Vec<Instruction>> {
        decode(self.code, self.header.instruction_count as usize, lookup)
    }
}

/// A fully decoded script.
#[derive(Debug, Clone, PartialEq)]
pub struct Script {
    pub header: ScriptHeader,
    pub instructions: Vec<Instruction>,
}

impl Script {
    pub fn read(data: &[u8], lookup: &mut impl ImmediateLookup) -> Result<Self> {
        let raw = RawScript::parse(data)?;
        let instructions = raw.decode(lookup)?;
        Ok(Self {
            header: raw.header,
            instructions,
        })
    }

    /// Serialize, taking the instruction count from `instructions`.
    pub fn write(&self, lookup: &mut impl ImmediateLookup) -> Result<Vec<u8>> {
        let count = check_limit(
            "instruction count",
            self.instructions.len(),
            u16::MAX as usize,
        )?;
        let mut header = self.header.clone();
        header.instruction_count = count as u16;

        let mut w = Writer::new();
        header.write(&mut w)?;
        w.write_bytes(&encode(&self.instructions, lookup)?);
        Ok(w.into_bytes())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::immediate::{ImmediateKind, Payload};

    fn kinds(op: u16) -> ImmediateKind {
        match op {
            3 => ImmediateKind::Switch,
            21 => ImmediateKind::Byte,
            _ => ImmediateKind::Int,
        }
    }

    #[test]
    fn header_field_order() {
        let header = ScriptHeader {
            byte0: 0,
            switches: vec![vec![SwitchCase { value: 4, jump: 2 }]],
            args: SlotCounts { int: 1, long: 2, string: 3 },
            locals: SlotCounts { int: 4, long: 5, string: 6 },
            instruction_count: 0,
        };
        let mut w = Writer::new();
        header.write(&mut w).unwrap();
        let bytes = w.into_bytes();
        assert_eq!(
            bytes,
            [
                0, 0, 11, 1, 0, 1, 0, 0, 0, 4, 0, 0, 0, 2, // switches
                0, 2, 0, 3, 0, 1, // args: long, string, int
                0, 5, 0, 6, 0, 4, // locals
                0, 0,
            ]
        );
        let parsed = ScriptHeader::parse(&mut Cursor::new(&bytes)).unwrap();
        assert_eq!(parsed, header);
    }

    #[test]
    fn read_write_script() {
        let script = Script {
            header: ScriptHeader::default(),
            instructions: vec![
                Instruction::new(3, 0, Payload::Int(5)),
                Instruction::new(3, 0, Payload::Int(1)),
                Instruction::new(4000, 0, Payload::None),
                Instruction::new(21, 0, Payload::None),
            ],
        };
        let mut lookup = kinds;
        let bytes = script.write(&mut lookup).unwrap();
        let back = Script::read(&bytes, &mut lookup).unwrap();
        assert_eq!(back.header.instruction_count, 4);
        let ops: Vec<_> = back.instructions.iter().map(|i| (i.opcode, i.imm)).collect();
        assert_eq!(ops, [(3, 0), (3, 0), (4000, 0), (21, 0)]);
        assert_eq!(back.instructions[1].payload, Payload::Int(1));
    }

    #[test]
    fn oversized_switch_section_is_rejected() {
        let header = ScriptHeader {
            switches: vec![vec![SwitchCase { value: 0, jump: 0 }; 8200]],
            ..Default::default()
        };
        let mut w = Writer::new();
        assert!(matches!(
            header.write(&mut w),
            Err(Error::LimitExceeded { field: "switch table size", .. })
        ));
    }
}
