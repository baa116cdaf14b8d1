//! Best-effort interpreter over decoded scripts.
//!
//! Control flow, locals, constants, arithmetic and string comparison are
//! executed for real. Everything that would touch game state (variables,
//! params, enums, db rows, other scripts) only keeps the stacks in shape:
//! inputs are popped and zero values of the right primitives pushed.
//! Operations without a dedicated implementation fall back to their solved
//! stack effect from the registry.

use std::cmp::Ordering;
use std::fmt::Write as _;

use cs2script::{Payload, SwitchCase};
use tracing::{debug, info};

use crate::error::{CoreError, Result};
use crate::ops::named::{self, *};
use crate::ops::{ClientScript, OpcodeRegistry, Operation};
use crate::stack::{PrimitiveType, StackDiff, StackList};
use crate::subtypes::Subtype;

/// One value per slot of each primitive stack.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct Values {
    pub int: Vec<i32>,
    pub long: Vec<i64>,
    pub string: Vec<String>,
}

impl Values {
    fn sized(counts: StackDiff) -> Self {
        let n = |v: i32| v.max(0) as usize;
        Self {
            int: vec![0; n(counts.int)],
            long: vec![0; n(counts.long)],
            string: vec![String::new(); n(counts.string)],
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Step {
    Continue,
    Returned,
}

fn fail(msg: impl Into<String>) -> CoreError {
    CoreError::Interpreter(msg.into())
}

/// `value` in base `radix`, lowercase digits.
fn format_radix(value: i32, radix: i32) -> Result<String> {
    let radix = u32::try_from(radix)
        .ok()
        .filter(|r| (2..=36).contains(r))
        .ok_or_else(|| fail(format!("invalid radix {radix}")))?;
    let mut n = value.unsigned_abs();
    let mut digits = Vec::new();
    loop {
        let d = n % radix;
        digits.push(char::from_digit(d, radix).unwrap_or('?'));
        n /= radix;
        if n == 0 {
            break;
        }
    }
    if value < 0 {
        digits.push('-');
    }
    Ok(digits.into_iter().rev().collect())
}

pub struct Interpreter<'a> {
    registry: &'a OpcodeRegistry,
    ops: &'a [Operation],
    switches: &'a [Vec<SwitchCase>],
    /// Next instruction.
    pub index: usize,
    pub locals: Values,
    pub stack: Values,
    /// Text passed to `printmessage`.
    pub messages: Vec<String>,
}

impl<'a> Interpreter<'a> {
    pub fn new(registry: &'a OpcodeRegistry, script: &'a ClientScript) -> Self {
        Self {
            registry,
            ops: &script.ops,
            switches: &script.header.switches,
            index: 0,
            locals: Values::sized(script.local_counts()),
            stack: Values::default(),
            messages: Vec::new(),
        }
    }

    /// Store arguments in the leading local slots, the way a caller would.
    pub fn with_args(mut self, args: Values) -> Self {
        for (slot, v) in self.locals.int.iter_mut().zip(args.int) {
            *slot = v;
        }
        for (slot, v) in self.locals.long.iter_mut().zip(args.long) {
            *slot = v;
        }
        for (slot, v) in self.locals.string.iter_mut().zip(args.string) {
            *slot = v;
        }
        self
    }

    /// Run until a `return`, giving up after `max_steps` instructions.
    pub fn run(&mut self, max_steps: usize) -> Result<()> {
        for _ in 0..max_steps {
            if self.step()? == Step::Returned {
                return Ok(());
            }
        }
        Err(fail(format!("no return within {max_steps} steps")))
    }

    // ---------------------------------------------------------------------
    // Stacks
    // ---------------------------------------------------------------------

    pub fn pop_int(&mut self) -> Result<i32> {
        let at = self.index;
        self.stack.int.pop().ok_or_else(|| fail(format!("int stack empty at {at}")))
    }

    pub fn pop_long(&mut self) -> Result<i64> {
        let at = self.index;
        self.stack.long.pop().ok_or_else(|| fail(format!("long stack empty at {at}")))
    }

    pub fn pop_string(&mut self) -> Result<String> {
        let at = self.index;
        self.stack
            .string
            .pop()
            .ok_or_else(|| fail(format!("string stack empty at {at}")))
    }

    fn push_default(&mut self, p: PrimitiveType) {
        match p {
            PrimitiveType::Int => self.stack.int.push(0),
            PrimitiveType::Long => self.stack.long.push(0),
            PrimitiveType::String => self.stack.string.push(String::new()),
        }
    }

    fn pop_any(&mut self, p: PrimitiveType) -> Result<()> {
        match p {
            PrimitiveType::Int => self.pop_int().map(drop),
            PrimitiveType::Long => self.pop_long().map(drop),
            PrimitiveType::String => self.pop_string().map(drop),
        }
    }

    fn pop_list(&mut self, list: &StackList) -> Result<()> {
        let diff = list.to_diff();
        if diff.vararg != 0 {
            return Err(fail("vararg values cannot be interpreted"));
        }
        for p in PrimitiveType::ALL {
            for _ in 0..diff.prim(p) {
                self.pop_any(p)?;
            }
        }
        Ok(())
    }

    fn push_list(&mut self, list: &StackList) -> Result<()> {
        let diff = list.to_diff();
        if diff.vararg != 0 {
            return Err(fail("vararg values cannot be interpreted"));
        }
        for p in PrimitiveType::ALL {
            for _ in 0..diff.prim(p) {
                self.push_default(p);
            }
        }
        Ok(())
    }

    fn local_slot(&self, op: &Operation, len: usize) -> Result<usize> {
        usize::try_from(op.imm)
            .ok()
            .filter(|&i| i < len)
            .ok_or_else(|| fail(format!("local {} out of range ({len}) at {}", op.imm, self.index)))
    }

    fn jump(&mut self, offset: i32) -> Result<()> {
        let target = self.index as i64 + offset as i64;
        if target < 0 || target >= self.ops.len() as i64 {
            return Err(fail(format!("jump to {target} is out of bounds")));
        }
        self.index = target as usize;
        Ok(())
    }

    // ---------------------------------------------------------------------
    // Execution
    // ---------------------------------------------------------------------

    /// Execute one instruction.
    pub fn step(&mut self) -> Result<Step> {
        let ops = self.ops;
        let op = ops
            .get(self.index)
            .ok_or_else(|| fail(format!("ran past the end at {}", self.index)))?;
        if op.opcode == RETURN {
            return Ok(Step::Returned);
        }
        self.index += 1;
        self.execute(op)?;
        Ok(Step::Continue)
    }

    fn execute(&mut self, op: &Operation) -> Result<()> {
        let registry = self.registry;
        let switches = self.switches;
        match op.opcode {
            PUSHCONST | PUSHINT | PUSHLONG | PUSHSTRING => match &op.payload {
                Payload::Int(v) => self.stack.int.push(*v),
                Payload::Long(v) => self.stack.long.push(*v),
                Payload::String(s) => self.stack.string.push(s.clone()),
                Payload::None if op.opcode == PUSHINT => self.stack.int.push(op.imm),
                Payload::None => return Err(fail(format!("constant without a value: {op}"))),
            },
            JUMP => self.jump(op.imm)?,
            id if named::BRANCH_INT.contains(&id) => {
                let b = self.pop_int()?;
                let a = self.pop_int()?;
                if compare(id, a.cmp(&b)) {
                    self.jump(op.imm)?;
                }
            }
            id if named::BRANCH_LONG.contains(&id) => {
                let b = self.pop_long()?;
                let a = self.pop_long()?;
                if compare(id, a.cmp(&b)) {
                    self.jump(op.imm)?;
                }
            }
            SWITCH => {
                let value = self.pop_int()?;
                let table = usize::try_from(op.imm)
                    .ok()
                    .and_then(|i| switches.get(i))
                    .ok_or_else(|| fail(format!("missing switch table {}", op.imm)))?;
                if let Some(case) = table.iter().find(|c| c.value == value) {
                    self.jump(case.jump)?;
                }
            }
            PUSHLOCALINT => {
                let i = self.local_slot(op, self.locals.int.len())?;
                self.stack.int.push(self.locals.int[i]);
            }
            PUSHLOCALLONG => {
                let i = self.local_slot(op, self.locals.long.len())?;
                self.stack.long.push(self.locals.long[i]);
            }
            PUSHLOCALSTRING => {
                let i = self.local_slot(op, self.locals.string.len())?;
                self.stack.string.push(self.locals.string[i].clone());
            }
            POPLOCALINT => {
                let i = self.local_slot(op, self.locals.int.len())?;
                let v = self.pop_int()?;
                self.locals.int[i] = v;
            }
            POPLOCALLONG => {
                let i = self.local_slot(op, self.locals.long.len())?;
                let v = self.pop_long()?;
                self.locals.long[i] = v;
            }
            POPLOCALSTRING => {
                let i = self.local_slot(op, self.locals.string.len())?;
                let v = self.pop_string()?;
                self.locals.string[i] = v;
            }
            POPDISCARDINT => self.pop_int().map(drop)?,
            POPDISCARDLONG => self.pop_long().map(drop)?,
            POPDISCARDSTRING => self.pop_string().map(drop)?,
            PLUS | MINUS | INTMUL | INTDIV => {
                let b = self.pop_int()?;
                let a = self.pop_int()?;
                let v = match op.opcode {
                    PLUS => a.wrapping_add(b),
                    MINUS => a.wrapping_sub(b),
                    INTMUL => a.wrapping_mul(b),
                    _ => a
                        .checked_div(b)
                        .ok_or_else(|| fail(format!("division of {a} by {b}")))?,
                };
                self.stack.int.push(v);
            }
            JOINSTRING => {
                let n = usize::try_from(op.imm).map_err(|_| fail(format!("joinstring of {}", op.imm)))?;
                let mut parts = Vec::with_capacity(n);
                for _ in 0..n {
                    parts.push(self.pop_string()?);
                }
                parts.reverse();
                self.stack.string.push(parts.concat());
            }
            STRCMP => {
                let right = self.pop_string()?;
                let left = self.pop_string()?;
                self.stack.int.push(match left.cmp(&right) {
                    Ordering::Less => -1,
                    Ordering::Equal => 0,
                    Ordering::Greater => 1,
                });
            }
            INTTOSTRING => {
                let radix = self.pop_int()?;
                let value = self.pop_int()?;
                self.stack.string.push(format_radix(value, radix)?);
            }
            PRINTMESSAGE => {
                let text = self.pop_string()?;
                info!(message = %text, "printmessage");
                self.messages.push(text);
            }
            GOSUB => {
                let id = u32::try_from(op.imm).map_err(|_| fail(format!("gosub of {}", op.imm)))?;
                let sig = registry
                    .scripts
                    .get(&id)
                    .ok_or_else(|| fail(format!("calling unknown script {id}")))?;
                debug!(script = id, "gosub");
                self.pop_list(&sig.input)?;
                self.push_list(&sig.output)?;
            }
            PUSHVAR | POPVAR => {
                let var = registry
                    .symbols
                    .var(op.imm)
                    .ok_or_else(|| fail(format!("unknown client variable {:#x}", op.imm)))?;
                let p = var.subtype.primitive();
                if op.opcode == PUSHVAR {
                    self.push_default(p);
                } else {
                    self.pop_any(p)?;
                }
            }
            id if named::GET_PARAM.contains(&id) => {
                let param = self.pop_int()?;
                let subtype = registry
                    .symbols
                    .param(param)
                    .ok_or_else(|| fail(format!("unknown param {param}")))?;
                if id != CC_GETPARAM {
                    self.pop_int()?;
                }
                self.push_default(subtype.primitive());
            }
            ENUM_GETVALUE => {
                let _key = self.pop_int()?;
                let _enum_id = self.pop_int()?;
                let out_type = self.pop_int()?;
                let _key_type = self.pop_int()?;
                let subtype = u16::try_from(out_type)
                    .ok()
                    .map(Subtype)
                    .ok_or_else(|| fail(format!("invalid enum output type {out_type}")))?;
                self.push_default(subtype.primitive());
            }
            DBROW_GETFIELD => {
                let _subrow = self.pop_int()?;
                let field = self.pop_int()?;
                let _row = self.pop_int()?;
                let types = registry
                    .symbols
                    .db_field(field)
                    .ok_or_else(|| fail(format!("unknown db field {field:#x}")))?;
                for p in types.iter().map(|t| t.primitive()).collect::<Vec<_>>() {
                    self.push_default(p);
                }
            }
            id => {
                let stack = registry
                    .stack_of(id)
                    .ok_or_else(|| fail(format!("no stack effect known for {}", named::display_name(id))))?;
                self.pop_list(&stack.input)?;
                self.push_list(&stack.output)?;
            }
        }
        Ok(())
    }

    /// Locals, stacks and the next few instructions, for debugging.
    pub fn dump(&self) -> String {
        let mut res = String::new();
        let _ = writeln!(res, "locals: {:?} {:?} {:?}", self.locals.int, self.locals.long, self.locals.string);
        let _ = writeln!(res, "stack:  {:?} {:?} {:?}", self.stack.int, self.stack.long, self.stack.string);
        for i in self.index..(self.index + 10).min(self.ops.len()) {
            let marker = if i == self.index { ">>" } else { "  " };
            let _ = writeln!(res, "{i:5} {marker} {}", self.ops[i]);
        }
        res
    }
}

/// Outcome of a branch given how its operands compare.
fn compare(branch: OpId, ord: Ordering) -> bool {
    match branch {
        BRANCH_EQ | BRANCH_EQ_LONG => ord == Ordering::Equal,
        BRANCH_NOT | BRANCH_NOT_LONG => ord != Ordering::Equal,
        BRANCH_LT | BRANCH_LT_LONG => ord == Ordering::Less,
        BRANCH_GT | BRANCH_GT_LONG => ord == Ordering::Greater,
        BRANCH_LTEQ | BRANCH_LTEQ_LONG => ord != Ordering::Greater,
        BRANCH_GTEQ | BRANCH_GTEQ_LONG => ord != Ordering::Less,
        _ => false,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::stack::{StackInOut, StackType};
    use crate::symbols::VarInfo;
    use cs2script::{BuildNumber, ScriptHeader, SlotCounts};

    fn registry() -> OpcodeRegistry {
        let mut reg = OpcodeRegistry::unscrambled(BuildNumber(900));
        reg.scripts.insert(55, StackInOut::of(&[StackType::Int, StackType::String], &[StackType::Long]));
        reg
    }

    fn script(ops: Vec<Operation>) -> ClientScript {
        ClientScript {
            header: ScriptHeader {
                locals: SlotCounts { int: 2, long: 0, string: 1 },
                ..Default::default()
            },
            ops,
        }
    }

    #[test]
    fn counting_loop() {
        // local1 = 0; while (local1 < local0) { local1 = local1 + 3 } return local1
        let s = script(vec![
            Operation::push_int(0),
            Operation::new(POPLOCALINT, 1),
            Operation::new(PUSHLOCALINT, 1),
            Operation::new(PUSHLOCALINT, 0),
            Operation::new(BRANCH_LT, 1),
            Operation::new(JUMP, 5),
            Operation::new(PUSHLOCALINT, 1),
            Operation::push_int(3),
            Operation::new(PLUS, 0),
            Operation::new(POPLOCALINT, 1),
            Operation::new(JUMP, -9),
            Operation::new(PUSHLOCALINT, 1),
            Operation::new(RETURN, 0),
        ]);
        let reg = registry();
        let mut it = Interpreter::new(&reg, &s).with_args(Values {
            int: vec![10],
            ..Default::default()
        });
        it.run(1000).unwrap();
        assert_eq!(it.stack.int, [12]);
        assert_eq!(it.index, 12);
    }

    #[test]
    fn switch_and_strings() {
        let mut s = script(vec![
            Operation::push_int(2),
            Operation::new(SWITCH, 0),
            Operation::push_string("none"),
            Operation::new(RETURN, 0),
            Operation::push_string("a"),
            Operation::push_string("b"),
            Operation::new(JOINSTRING, 2),
            Operation::new(RETURN, 0),
        ]);
        s.header.switches = vec![vec![SwitchCase { value: 2, jump: 2 }]];
        let reg = registry();
        let mut it = Interpreter::new(&reg, &s);
        it.run(100).unwrap();
        assert_eq!(it.stack.string, ["ab"]);
    }

    #[test]
    fn game_state_only_keeps_stacks_in_shape() {
        let mut reg = registry();
        reg.symbols.vars.insert(
            crate::symbols::SymbolTables::var_key(1, 5),
            VarInfo {
                name: None,
                subtype: Subtype::STRING,
            },
        );
        let s = script(vec![
            Operation::new(PUSHVAR, (1 << 24) | (5 << 8)),
            Operation::push_int(4),
            Operation::push_string("x"),
            Operation::new(GOSUB, 55),
            Operation::new(RETURN, 0),
        ]);
        let mut it = Interpreter::new(&reg, &s);
        it.run(100).unwrap();
        assert_eq!(it.stack.string, [""]);
        assert_eq!(it.stack.long, [0]);
        assert!(it.stack.int.is_empty());
    }

    #[test]
    fn messages_and_errors() {
        let reg = registry();
        let s = script(vec![
            Operation::push_int(255),
            Operation::push_int(16),
            Operation::new(INTTOSTRING, 0),
            Operation::new(PRINTMESSAGE, 0),
            Operation::new(POPDISCARDINT, 0),
        ]);
        let mut it = Interpreter::new(&reg, &s);
        let err = it.run(100).unwrap_err();
        assert_eq!(it.messages, ["ff"]);
        assert!(matches!(err, CoreError::Interpreter(_)), "{err}");
    }

    #[test]
    fn radix_formatting() {
        assert_eq!(format_radix(-10, 10).unwrap(), "-10");
        assert_eq!(format_radix(5, 2).unwrap(), "101");
        assert!(format_radix(5, 1).is_err());
    }
}
