//! Canonical operations and the registry mapping raw opcodes onto them.

pub mod named;
pub mod registry;
pub mod translate;

pub use named::OpId;
pub use registry::{OpcodeInfo, OpcodeRegistry};

use cs2script::{Payload, ScriptHeader};
use serde::{Deserialize, Serialize};

use crate::stack::{StackDiff, StackList, StackType};

/// One decoded operation with its canonical id.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Operation {
    pub opcode: OpId,
    pub imm: i32,
    #[serde(default)]
    pub payload: Payload,
}

impl Operation {
    pub fn new(opcode: OpId, imm: i32) -> Self {
        Self {
            opcode,
            imm,
            payload: Payload::None,
        }
    }

    pub fn push_int(v: i32) -> Self {
        Self {
            opcode: named::PUSHCONST,
            imm: 0,
            payload: Payload::Int(v),
        }
    }

    pub fn push_long(v: i64) -> Self {
        Self {
            opcode: named::PUSHCONST,
            imm: 1,
            payload: Payload::Long(v),
        }
    }

    pub fn push_string(s: impl Into<String>) -> Self {
        Self {
            opcode: named::PUSHCONST,
            imm: 2,
            payload: Payload::String(s.into()),
        }
    }

    /// Stack a constant push writes to, if this is one.
    pub fn const_type(&self) -> Option<StackType> {
        match self.opcode {
            named::PUSHCONST => match self.imm {
                0 => Some(StackType::Int),
                1 => Some(StackType::Long),
                2 => Some(StackType::String),
                _ => None,
            },
            named::PUSHINT => Some(StackType::Int),
            named::PUSHLONG => Some(StackType::Long),
            named::PUSHSTRING => Some(StackType::String),
            _ => None,
        }
    }

    pub fn const_int(&self) -> Option<i32> {
        match (self.opcode, &self.payload) {
            (named::PUSHCONST, Payload::Int(v)) => Some(*v),
            (named::PUSHINT, _) => Some(self.imm),
            _ => None,
        }
    }

    pub fn const_string(&self) -> Option<&str> {
        match (self.opcode, &self.payload) {
            (named::PUSHCONST | named::PUSHSTRING, Payload::String(s)) => Some(s),
            _ => None,
        }
    }
}

impl std::fmt::Display for Operation {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{} {}", named::display_name(self.opcode), self.imm)?;
        match &self.payload {
            Payload::None => Ok(()),
            Payload::Int(v) => write!(f, " {v}"),
            Payload::Long(v) => write!(f, " {v}L"),
            Payload::String(s) => write!(f, " {s:?}"),
        }
    }
}

/// A script with its instructions mapped to canonical operations.
#[derive(Debug, Clone, PartialEq)]
pub struct ClientScript {
    pub header: ScriptHeader,
    pub ops: Vec<Operation>,
}

impl ClientScript {
    pub fn arg_type(&self) -> StackDiff {
        let a = &self.header.args;
        StackDiff::new(a.int as i32, a.long as i32, a.string as i32, 0)
    }

    pub fn local_counts(&self) -> StackDiff {
        let l = &self.header.locals;
        StackDiff::new(l.int as i32, l.long as i32, l.string as i32, 0)
    }

    /// Return type recovered from the default return the compiler appends
    /// to every script: the run of constant pushes before the final op.
    pub fn return_type(&self) -> StackList {
        let mut res: Vec<StackType> = Vec::new();
        for op in self.ops.iter().rev().skip(1) {
            match op.const_type() {
                Some(ty) => res.push(ty),
                None => break,
            }
        }
        res.into_iter().rev().collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn return_type_from_default_return() {
        let script = ClientScript {
            header: ScriptHeader::default(),
            ops: vec![
                Operation::new(named::PUSHLOCALINT, 0),
                Operation::push_int(0),
                Operation::push_string(""),
                Operation::new(named::RETURN, 0),
            ],
        };
        assert_eq!(
            script.return_type(),
            [StackType::Int, StackType::String].into_iter().collect::<StackList>()
        );
    }

    #[test]
    fn display() {
        assert_eq!(Operation::push_int(5).to_string(), "pushconst 0 5");
        assert_eq!(Operation::new(99999, 1).to_string(), "unk_99999 1");
    }
}
