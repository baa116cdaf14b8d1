//! Stack effects that follow from an instruction's context rather than
//! from its opcode: calls and returns from script signatures, variable ops
//! from variable metadata, lookups from the constants they are fed.
//!
//! Shared by calibration (unexplained blocks are skipped), the subtype
//! solver and argument binding in the decompiler.

use crate::ops::named::{
    self, DBROW_GETFIELD, ENUM_GETVALUE, GOSUB, ITEM_GETPARAM, JOINSTRING, NPC_GETPARAM, POPVAR,
    PUSHCONST, PUSHINT, PUSHLONG, PUSHSTRING, PUSHVAR, RETURN, STRUCT_GETPARAM,
};
use crate::ops::{OpcodeRegistry, Operation};
use crate::stack::{is_vararg_tag, vararg_type, StackInOut, StackList, StackSlot, StackType};
use crate::subtypes::Subtype;

/// Context-derived stack effects of one straight-line run of operations.
#[derive(Debug, Clone, Default)]
pub struct BlockAnnotation {
    /// Per instruction, the effect derived from context.
    pub known: Vec<Option<StackInOut>>,
    /// Per instruction, whether its effect depends on context that could
    /// not be resolved.
    pub unresolved: Vec<bool>,
    /// Any entry of `unresolved` is set.
    pub unexplained: bool,
    pub has_vararg_tag: bool,
}

impl BlockAnnotation {
    /// Effect of instruction `index`: the annotation, else the registry's.
    pub fn stack_of<'a>(
        &'a self,
        index: usize,
        op: &Operation,
        registry: &'a OpcodeRegistry,
    ) -> Option<&'a StackInOut> {
        self.known
            .get(index)
            .and_then(Option::as_ref)
            .or_else(|| registry.stack_of(op.opcode))
    }
}

/// Int constants currently on the int stack, top last. `None` for values
/// produced by anything but a constant push.
#[derive(Debug, Default)]
pub(crate) struct ConstStack {
    ints: Vec<Option<i32>>,
    last_int: Option<i32>,
}

impl ConstStack {
    pub(crate) fn peek(&self, depth: usize) -> Option<i32> {
        let len = self.ints.len();
        if depth >= len {
            return None;
        }
        self.ints[len - 1 - depth]
    }

    pub(crate) fn step(&mut self, op: &Operation, stack: Option<&StackInOut>) {
        if let Some(v) = op.const_int() {
            self.ints.push(Some(v));
            self.last_int = Some(v);
            return;
        }
        let Some(stack) = stack else {
            self.ints.clear();
            return;
        };
        let pops = stack.input.to_diff().int.max(0) as usize;
        let keep = self.ints.len().saturating_sub(pops);
        self.ints.truncate(keep);
        for _ in 0..stack.output.to_diff().int.max(0) {
            self.ints.push(None);
        }
    }
}

fn strings(n: i32) -> StackList {
    (0..n.max(0)).map(|_| StackType::String).collect()
}

fn subtype_of(v: Option<i32>) -> Option<Subtype> {
    let v = v?;
    (0..=Subtype::MAX as i32).contains(&v).then_some(Subtype(v as u16))
}

fn param_target(op: u32) -> Subtype {
    match op {
        NPC_GETPARAM => Subtype::NPC,
        ITEM_GETPARAM => Subtype::OBJ,
        STRUCT_GETPARAM => Subtype::STRUCT,
        _ => Subtype::UNKNOWN_INT,
    }
}

/// Whether the operation after a tag-shaped string takes a vararg pack.
fn feeds_vararg(next: Option<&Operation>, registry: &OpcodeRegistry) -> Option<bool> {
    let stack = registry.stack_of(next?.opcode)?;
    Some(stack.input.values.contains(&StackSlot::Vararg))
}

/// Annotate `ops`, one straight-line block of script `script_id`.
pub fn annotate_block(script_id: u32, ops: &[Operation], registry: &OpcodeRegistry) -> BlockAnnotation {
    let mut res = BlockAnnotation {
        known: Vec::with_capacity(ops.len()),
        unresolved: Vec::with_capacity(ops.len()),
        ..Default::default()
    };
    let mut consts = ConstStack::default();

    for (i, op) in ops.iter().enumerate() {
        let mut unresolved = false;
        let known = match op.opcode {
            RETURN => registry.scripts.get(&script_id).map(|sig| StackInOut {
                input: sig.output.clone(),
                output: StackList::new(),
                exact_in: sig.exact_out.clone(),
                exact_out: None,
                ..StackInOut::new(StackList::new(), StackList::new())
            }),
            GOSUB => registry.scripts.get(&(op.imm as u32)).cloned(),
            JOINSTRING => Some(StackInOut::new(strings(op.imm), [StackType::String].into_iter().collect())),
            PUSHVAR | POPVAR => registry.symbols.var(op.imm).map(|var| {
                let value = [var.subtype];
                if op.opcode == POPVAR {
                    StackInOut::from_exact(&value, &[])
                } else {
                    StackInOut::from_exact(&[], &value)
                }
            }),
            PUSHINT => Some(StackInOut::of(&[], &[StackType::Int])),
            PUSHLONG => Some(StackInOut::of(&[], &[StackType::Long])),
            PUSHSTRING => Some(StackInOut::of(&[], &[StackType::String])),
            PUSHCONST => match op.imm {
                0 => Some(StackInOut::of(&[], &[StackType::Int])),
                1 => Some(StackInOut::of(&[], &[StackType::Long])),
                _ => {
                    let text = op.const_string().unwrap_or_default();
                    let is_tag = is_vararg_tag(text)
                        && match feeds_vararg(ops.get(i + 1), registry) {
                            Some(feeds) => feeds,
                            None if text.len() >= 3 => true,
                            None => {
                                unresolved = true;
                                false
                            }
                        };
                    if is_tag {
                        let count = consts.peek(0).or(consts.last_int);
                        match vararg_type(text, count) {
                            Some(args) => {
                                res.has_vararg_tag = true;
                                let mut input: StackList = [StackType::Int].into_iter().collect();
                                input.push(&args);
                                Some(StackInOut::new(input, [StackType::Vararg].into_iter().collect()))
                            }
                            None => {
                                unresolved = true;
                                None
                            }
                        }
                    } else {
                        Some(StackInOut::of(&[], &[StackType::String]))
                    }
                }
            },
            ENUM_GETVALUE => subtype_of(consts.peek(2)).map(|out| {
                let key = subtype_of(consts.peek(3)).unwrap_or(Subtype::UNKNOWN_INT);
                StackInOut::from_exact(
                    &[Subtype::UNKNOWN_INT, Subtype::UNKNOWN_INT, Subtype::ENUM, key],
                    &[out],
                )
            }),
            DBROW_GETFIELD => consts
                .peek(1)
                .and_then(|field| registry.symbols.db_field(field))
                .map(|types| {
                    StackInOut::from_exact(&[Subtype::DBROW, Subtype::UNKNOWN_INT, Subtype::UNKNOWN_INT], types)
                }),
            o if named::GET_PARAM.contains(&o) => consts
                .peek(0)
                .and_then(|param| registry.symbols.param(param))
                .map(|out| {
                    if o == named::CC_GETPARAM {
                        StackInOut::from_exact(&[Subtype::UNKNOWN_INT], &[out])
                    } else {
                        StackInOut::from_exact(&[param_target(o), Subtype::UNKNOWN_INT], &[out])
                    }
                }),
            _ => None,
        };

        let context_dependent = matches!(
            op.opcode,
            RETURN | GOSUB | PUSHVAR | POPVAR | ENUM_GETVALUE | DBROW_GETFIELD
        ) || named::GET_PARAM.contains(&op.opcode);
        if known.is_none() && context_dependent {
            unresolved = true;
        }

        let effective = known.as_ref().or_else(|| registry.stack_of(op.opcode));
        consts.step(op, effective);
        res.known.push(known);
        res.unresolved.push(unresolved);
        res.unexplained |= unresolved;
    }
    res
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::ops::named::{CC_GETPARAM, PLUS};
    use crate::ops::OpcodeInfo;
    use crate::symbols::VarInfo;
    use cs2script::{BuildNumber, ImmediateKind};

    fn registry() -> OpcodeRegistry {
        let mut reg = OpcodeRegistry::unscrambled(BuildNumber(900));
        reg.scripts.insert(
            7,
            StackInOut::of(&[StackType::Int, StackType::String], &[StackType::Long]),
        );
        reg
    }

    #[test]
    fn calls_use_script_signatures() {
        let reg = registry();
        let ops = [Operation::new(GOSUB, 7), Operation::new(RETURN, 0)];
        let ann = annotate_block(7, &ops, &reg);
        assert!(!ann.unexplained);
        assert_eq!(ann.known[0].as_ref().unwrap().to_string(), "long(int,string)");
        assert_eq!(ann.known[1].as_ref().unwrap().to_string(), "void(long)");

        let ann = annotate_block(8, &ops[1..], &reg);
        assert!(ann.unexplained);
    }

    #[test]
    fn vararg_tag_takes_script_id_and_args() {
        let reg = registry();
        let ops = [
            Operation::push_int(1234),
            Operation::push_int(5),
            Operation::push_string("abc"),
            Operation::push_string("isi"),
        ];
        let ann = annotate_block(0, &ops, &reg);
        assert!(ann.has_vararg_tag);
        assert_eq!(ann.known[3].as_ref().unwrap().to_string(), "vararg(int,int,string,int)");
        // too short to be sure without knowing the consumer
        let ann = annotate_block(0, &[Operation::push_string("s")], &reg);
        assert!(ann.unexplained);
        assert_eq!(ann.known[0].as_ref().unwrap().output.to_string(), "string");
    }

    #[test]
    fn int_array_count_from_last_constant() {
        let reg = registry();
        let ops = [
            Operation::push_int(1),
            Operation::push_int(7),
            Operation::push_int(8),
            Operation::push_int(10),
            Operation::push_int(20),
            Operation::push_int(2),
            Operation::push_string("iiY"),
        ];
        let ann = annotate_block(0, &ops, &reg);
        let io = ann.known[6].as_ref().unwrap();
        // script id, two letters, two array values and the count
        assert_eq!(io.input.total(), 6);
    }

    #[test]
    fn lookups_follow_constants() {
        let mut reg = registry();
        reg.symbols.params.insert(55, Subtype::COMPONENT);
        reg.insert(OpcodeInfo::new(0x90, PLUS, &[ImmediateKind::Byte]));
        reg.get_mut(PLUS).unwrap().stack = StackInOut::of(&[StackType::Int, StackType::Int], &[StackType::Int]);
        let ops = [Operation::push_int(55), Operation::new(CC_GETPARAM, 0)];
        let ann = annotate_block(0, &ops, &reg);
        let exact = ann.known[1].as_ref().unwrap().exact_out.clone().unwrap();
        assert_eq!(exact.int, [Subtype::COMPONENT]);

        // the constant is consumed before the lookup sees it
        let ops = [
            Operation::push_int(55),
            Operation::push_int(1),
            Operation::new(PLUS, 0),
            Operation::new(CC_GETPARAM, 0),
        ];
        let ann = annotate_block(0, &ops, &reg);
        assert!(ann.known[3].is_none());
        assert!(ann.unexplained);

        let ops = [
            Operation::push_int(3),
            Operation::push_int(36),
            Operation::push_int(12),
            Operation::new(PUSHVAR, 0),
            Operation::new(ENUM_GETVALUE, 0),
        ];
        reg.symbols.vars.insert(
            0,
            VarInfo {
                name: None,
                subtype: Subtype::INT,
            },
        );
        let ann = annotate_block(0, &ops, &reg);
        let io = ann.known[4].as_ref().unwrap();
        assert_eq!(io.output.to_string(), "string");
    }
}
