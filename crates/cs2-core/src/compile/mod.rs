//! Lowering of a decompiled (or hand-built) tree back to operations.
//!
//! Emission runs in two phases. Nodes are first lowered to [`Item`]s that
//! refer to jump targets through symbolic [`Label`]s; [`assemble`] then
//! places the labels, turns them into relative jumps and switch tables and
//! computes the script header.
//!
//! The VM has no call stack, so calls of functions defined in the same
//! unit are emulated: the caller pushes a return-site id and jumps to the
//! function, which spills its arguments and the caller's locals into
//! temporary locals and finally jumps to a shared dispatch switch that
//! maps the return-site id back to the call site.

mod assemble;
mod subfunc;

use std::collections::BTreeMap;

use tracing::debug;

pub use subfunc::{intrinsic_signature, INTRINSICS};

use crate::ast::{Ast, FunctionDef, NodeId, NodeKind};
use crate::error::{CoreError, Result};
use crate::ops::named::{self, OpId, JUMP, RETURN, SHORTING_AND, SHORTING_OR, SWITCH};
use crate::ops::{ClientScript, OpcodeRegistry, Operation};
use crate::stack::{PrimitiveType, StackDiff, StackList, StackSlot};

/// Jump target that is placed somewhere in the item stream.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct Label(u32);

#[derive(Debug, Clone)]
pub enum Item {
    Op(Operation),
    /// Jump or branch to a label.
    Goto { opcode: OpId, target: Label },
    /// `switch` over a table of case values.
    Switch(Vec<(i32, Label)>),
    /// Zero-width marker.
    Place(Label),
    /// Local access in temporary slot `slot`, relocated past the locals of
    /// every function in the unit.
    Temp { opcode: OpId, slot: u16 },
}

fn goto(opcode: OpId, target: Label) -> Item {
    Item::Goto { opcode, target }
}

/// Number of instructions `items` assemble to.
fn op_count(items: &[Item]) -> usize {
    items.iter().filter(|i| !matches!(i, Item::Place(_))).count()
}

/// Compile the function at `root` into a complete script.
pub fn compile(ast: &Ast, root: NodeId, registry: &OpcodeRegistry) -> Result<ClientScript> {
    let NodeKind::Function(def) = ast.kind(root) else {
        return Err(CoreError::Compile(format!("{root} is not a function")));
    };
    let body = function_body(ast, root)?;

    let mut em = Emitter::new(ast, registry);
    em.locals = def.locals;
    let mut main = Vec::new();
    em.emit_function_body(body, &def.returns, &mut main)?;

    let mut items = em.call_sections()?;
    items.extend(main);

    let (mut script, temps) = em.finish(items)?;
    script.header.args = assemble::slot_counts(def.args.to_diff())?;
    script.header.locals = assemble::slot_counts(em.locals + temps)?;
    debug!(name = %def.name, ops = script.ops.len(), "compiled function");
    Ok(script)
}

/// Compile a single statement or expression without any surrounding
/// function. Calls of unit functions are rejected since there is nowhere
/// to put their bodies.
pub fn compile_fragment(ast: &Ast, node: NodeId, registry: &OpcodeRegistry) -> Result<ClientScript> {
    let mut em = Emitter::new(ast, registry);
    let mut items = Vec::new();
    em.emit(node, &mut items)?;
    if !em.functions.is_empty() {
        return Err(CoreError::Compile("fragment calls a function of the unit".into()));
    }
    let (mut script, temps) = em.finish(items)?;
    script.header.locals = assemble::slot_counts(temps)?;
    Ok(script)
}

fn function_body(ast: &Ast, func: NodeId) -> Result<NodeId> {
    ast.children(func)
        .first()
        .copied()
        .ok_or_else(|| CoreError::Compile(format!("function {func} has no body")))
}

fn function_def(ast: &Ast, func: NodeId) -> Result<&FunctionDef> {
    match ast.kind(func) {
        NodeKind::Function(def) => Ok(def),
        _ => Err(CoreError::Compile(format!("{func} is not a function"))),
    }
}

/// Constant pushes producing the zero value of every slot of `types`.
fn default_values(types: &StackList) -> Result<Vec<Operation>> {
    types
        .values
        .iter()
        .map(|slot| match slot {
            StackSlot::Int => Ok(Operation::push_int(0)),
            StackSlot::Long => Ok(Operation::push_long(0)),
            StackSlot::String => Ok(Operation::push_string("")),
            other => Err(CoreError::Compile(format!("no default value for a {other} slot"))),
        })
        .collect()
}

// -------------------------------------------------------------------------
// Emitter
// -------------------------------------------------------------------------

pub(crate) struct Emitter<'a> {
    ast: &'a Ast,
    registry: &'a OpcodeRegistry,
    next_label: u32,
    /// Temporary slots used so far, per primitive.
    temps: StackDiff,
    /// Highest local counts of any function in the unit.
    locals: StackDiff,
    /// Call targets in order of first use, with their entry labels.
    functions: Vec<(String, Label)>,
    /// Functions defined in the unit.
    definitions: BTreeMap<String, NodeId>,
    return_table: Option<Label>,
    return_sites: Vec<(i32, Label)>,
    /// End of the function being emitted, when it is a unit function.
    function_end: Option<Label>,
}

impl<'a> Emitter<'a> {
    fn new(ast: &'a Ast, registry: &'a OpcodeRegistry) -> Self {
        Self {
            ast,
            registry,
            next_label: 0,
            temps: StackDiff::default(),
            locals: StackDiff::default(),
            functions: Vec::new(),
            definitions: BTreeMap::new(),
            return_table: None,
            return_sites: Vec::new(),
            function_end: None,
        }
    }

    fn label(&mut self) -> Label {
        let l = Label(self.next_label);
        self.next_label += 1;
        l
    }

    fn reserve_temps(&mut self, p: PrimitiveType, count: i32) {
        if self.temps.prim(p) < count {
            self.temps.set(p.into(), count);
        }
    }

    fn finish(&self, items: Vec<Item>) -> Result<(ClientScript, StackDiff)> {
        let script = assemble::assemble(items, self.locals)?;
        Ok((script, self.temps))
    }

    /// Entry label of a unit function or intrinsic, allocated on first use.
    fn function_label(&mut self, name: &str) -> Label {
        if let Some(&(_, l)) = self.functions.iter().find(|(n, _)| n == name) {
            return l;
        }
        let l = self.label();
        self.functions.push((name.to_string(), l));
        l
    }

    fn define_function(&mut self, func: NodeId) -> Result<()> {
        let name = function_def(self.ast, func)?.name.clone();
        if self.definitions.insert(name.clone(), func).is_some() {
            return Err(CoreError::Compile(format!("function {name} is defined twice")));
        }
        self.function_label(&name);
        Ok(())
    }

    fn return_table(&mut self) -> Label {
        match self.return_table {
            Some(l) => l,
            None => {
                let l = self.label();
                self.return_table = Some(l);
                l
            }
        }
    }

    /// Jump into the shared return dispatch.
    fn return_op(&mut self) -> Item {
        goto(JUMP, self.return_table())
    }

    fn emit_call(&mut self, name: &str, out: &mut Vec<Item>) {
        let site = self.return_sites.len() as i32 + 1;
        let resume = self.label();
        let entry = self.function_label(name);
        out.push(Item::Op(Operation::push_int(site)));
        out.push(goto(JUMP, entry));
        out.push(Item::Place(resume));
        self.return_sites.push((site, resume));
    }

    /// Body of a function followed by a default return when control can
    /// reach its end.
    fn emit_function_body(&mut self, body: NodeId, returns: &StackList, out: &mut Vec<Item>) -> Result<()> {
        self.emit(body, out)?;
        if !self.ends_in_return(body) {
            out.extend(default_values(returns)?.into_iter().map(Item::Op));
            match self.function_end {
                // falls through into the function epilogue
                Some(_) => {}
                None => out.push(Item::Op(Operation::new(RETURN, 0))),
            }
        }
        Ok(())
    }

    /// Control never continues past `id`.
    fn ends_in_return(&self, id: NodeId) -> bool {
        let ast = self.ast;
        match ast.kind(id) {
            NodeKind::RawOp(op) => op.opcode == RETURN,
            NodeKind::CodeBlock(_) => ast.children(id).last().is_some_and(|&c| self.ends_in_return(c)),
            NodeKind::If(stmt) => {
                stmt.false_branch.is_some_and(|f| self.ends_in_return(f)) && self.ends_in_return(stmt.true_branch)
            }
            NodeKind::Switch(sw) => {
                sw.default.is_some_and(|d| self.ends_in_return(d))
                    && sw.cases.iter().all(|&(_, b)| self.ends_in_return(b))
            }
            _ => false,
        }
    }

    fn emit_children(&mut self, id: NodeId, out: &mut Vec<Item>) -> Result<()> {
        for &child in self.ast.children(id) {
            self.emit(child, out)?;
        }
        Ok(())
    }

    pub(crate) fn emit(&mut self, id: NodeId, out: &mut Vec<Item>) -> Result<()> {
        let ast = self.ast;
        match ast.kind(id) {
            NodeKind::RawOp(op) => {
                self.emit_children(id, out)?;
                if op.opcode == RETURN {
                    if let Some(end) = self.function_end {
                        out.push(goto(JUMP, end));
                        return Ok(());
                    }
                }
                if named::is_branch(op.opcode) || matches!(op.opcode, JUMP | SWITCH) {
                    return Err(CoreError::Compile(format!(
                        "unstructured {op} from instruction {:?}",
                        ast[id].original_index
                    )));
                }
                out.push(Item::Op(op.clone()));
            }
            NodeKind::CodeBlock(_) => self.emit_children(id, out)?,
            NodeKind::If(stmt) => {
                let then = self.label();
                let end = self.label();
                let otherwise = match stmt.false_branch {
                    Some(_) => self.label(),
                    None => end,
                };
                self.emit_condition(stmt.condition, then, otherwise, out)?;
                out.push(Item::Place(then));
                self.emit(stmt.true_branch, out)?;
                if let Some(f) = stmt.false_branch {
                    if !self.ends_in_return(stmt.true_branch) {
                        out.push(goto(JUMP, end));
                    }
                    out.push(Item::Place(otherwise));
                    self.emit(f, out)?;
                }
                out.push(Item::Place(end));
            }
            &NodeKind::While { condition, body } => {
                let head = self.label();
                let enter = self.label();
                let end = self.label();
                out.push(Item::Place(head));
                self.emit_condition(condition, enter, end, out)?;
                out.push(Item::Place(enter));
                self.emit(body, out)?;
                out.push(goto(JUMP, head));
                out.push(Item::Place(end));
            }
            NodeKind::Switch(sw) => {
                if let Some(value) = sw.value {
                    self.emit(value, out)?;
                }
                let end = self.label();
                let mut bodies: Vec<(NodeId, Label)> = Vec::new();
                let mut table = Vec::with_capacity(sw.cases.len());
                for &(value, block) in &sw.cases {
                    let l = match bodies.iter().find(|(b, _)| *b == block) {
                        Some(&(_, l)) => l,
                        None => {
                            let l = self.label();
                            bodies.push((block, l));
                            l
                        }
                    };
                    table.push((value, l));
                }
                out.push(Item::Switch(table));
                match sw.default {
                    Some(d) => match bodies.iter().find(|(b, _)| *b == d) {
                        Some(&(_, l)) => out.push(goto(JUMP, l)),
                        None => {
                            self.emit(d, out)?;
                            if !bodies.is_empty() && !self.ends_in_return(d) {
                                out.push(goto(JUMP, end));
                            }
                        }
                    },
                    None => out.push(goto(JUMP, end)),
                }
                let last = bodies.len().saturating_sub(1);
                for (i, &(block, l)) in bodies.iter().enumerate() {
                    out.push(Item::Place(l));
                    self.emit(block, out)?;
                    if i != last && !self.ends_in_return(block) {
                        out.push(goto(JUMP, end));
                    }
                }
                out.push(Item::Place(end));
            }
            NodeKind::Branching(op) => {
                return Err(CoreError::Compile(format!(
                    "{} used as a value",
                    named::display_name(*op)
                )));
            }
            NodeKind::VarAssign { targets } => {
                self.emit_children(id, out)?;
                out.extend(targets.iter().rev().cloned().map(Item::Op));
            }
            NodeKind::Composed(c) => out.extend(c.ops.iter().cloned().map(Item::Op)),
            NodeKind::FunctionBind { tag } => {
                self.emit_children(id, out)?;
                out.push(Item::Op(Operation::push_string(tag.clone())));
            }
            NodeKind::Subcall { name } => {
                self.emit_children(id, out)?;
                self.emit_call(name, out);
            }
            NodeKind::Intrinsic { name } => {
                if intrinsic_signature(name).is_none() {
                    return Err(CoreError::Compile(format!("unknown intrinsic {name}")));
                }
                self.emit_children(id, out)?;
                self.emit_call(name, out);
            }
            NodeKind::Function(_) => self.define_function(id)?,
        }
        Ok(())
    }

    /// Jump to `on_true` when `id` holds, else to `on_false`.
    fn emit_condition(&mut self, id: NodeId, on_true: Label, on_false: Label, out: &mut Vec<Item>) -> Result<()> {
        let ast = self.ast;
        let NodeKind::Branching(op) = *ast.kind(id) else {
            return Err(CoreError::Compile(format!("condition {id} is not a comparison")));
        };
        match op {
            SHORTING_AND | SHORTING_OR => {
                let &[left, right] = ast.children(id) else {
                    return Err(CoreError::Compile(format!(
                        "{} needs two operands",
                        named::display_name(op)
                    )));
                };
                let mid = self.label();
                if op == SHORTING_AND {
                    self.emit_condition(left, mid, on_false, out)?;
                } else {
                    self.emit_condition(left, on_true, mid, out)?;
                }
                out.push(Item::Place(mid));
                self.emit_condition(right, on_true, on_false, out)
            }
            op => {
                self.emit_children(id, out)?;
                out.push(goto(op, on_true));
                out.push(goto(JUMP, on_false));
                Ok(())
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::ast::{decompile, IfStatement};
    use crate::ops::named::{BRANCH_EQ, BRANCH_LT, MINUS, PLUS, POPLOCALINT, PUSHCONST, PUSHLOCALINT};
    use crate::ops::OpcodeInfo;
    use crate::stack::{StackInOut, StackType};
    use cs2script::{BuildNumber, ImmediateKind, ScriptHeader, SlotCounts, SwitchCase};

    fn registry() -> OpcodeRegistry {
        let mut reg = OpcodeRegistry::unscrambled(BuildNumber(900));
        reg.insert(OpcodeInfo::new(0x93, PUSHCONST, &[ImmediateKind::Switch]));
        for (raw, id) in [(0x90, PLUS), (0x91, MINUS)] {
            reg.insert(OpcodeInfo::new(raw, id, &[ImmediateKind::Byte]));
            if let Some(info) = reg.get_mut(id) {
                info.stack = StackInOut::of(&[StackType::Int, StackType::Int], &[StackType::Int]);
            }
        }
        reg.scripts.insert(1, StackInOut::of(&[], &[StackType::Int]));
        reg
    }

    fn script(ops: Vec<Operation>) -> ClientScript {
        ClientScript {
            header: ScriptHeader {
                locals: SlotCounts { int: 1, long: 0, string: 0 },
                ..Default::default()
            },
            ops,
        }
    }

    fn round_trip(s: &ClientScript) -> ClientScript {
        let reg = registry();
        let (ast, root) = decompile(1, s, &reg).unwrap();
        compile(&ast, root, &reg).unwrap()
    }

    #[test]
    fn five_plus_one_is_byte_identical() {
        let reg = registry();
        let original = ClientScript {
            header: ScriptHeader::default(),
            ops: vec![Operation::push_int(5), Operation::push_int(1), Operation::new(PLUS, 0)],
        };
        let (ast, root) = decompile(7, &original, &reg).unwrap();
        let plus = ast
            .descendants(root)
            .into_iter()
            .find(|&n| ast.raw_op(n).is_some_and(|op| op.opcode == PLUS))
            .unwrap();
        assert_eq!(ast.children(plus).len(), 2);

        let compiled = compile_fragment(&ast, plus, &reg).unwrap();
        assert_eq!(compiled.ops, original.ops);
        assert_eq!(reg.encode(&compiled).unwrap(), reg.encode(&original).unwrap());
    }

    #[test]
    fn if_without_else_is_identical() {
        let s = script(vec![
            Operation::new(PUSHLOCALINT, 0),
            Operation::push_int(5),
            Operation::new(BRANCH_LT, 1),
            Operation::new(JUMP, 2),
            Operation::push_int(3),
            Operation::new(POPLOCALINT, 0),
            Operation::push_int(0),
            Operation::new(RETURN, 0),
        ]);
        let back = round_trip(&s);
        assert_eq!(back.ops, s.ops);
        assert_eq!(back.header.locals, s.header.locals);
    }

    #[test]
    fn if_else_drops_the_dead_default_return() {
        let s = script(vec![
            Operation::new(PUSHLOCALINT, 0),
            Operation::push_int(1),
            Operation::new(BRANCH_EQ, 1),
            Operation::new(JUMP, 2),
            Operation::push_int(1),
            Operation::new(RETURN, 0),
            Operation::push_int(2),
            Operation::new(RETURN, 0),
            Operation::push_int(0),
            Operation::new(RETURN, 0),
        ]);
        let back = round_trip(&s);
        assert_eq!(back.ops, s.ops[..8]);
    }

    #[test]
    fn while_loop_is_identical() {
        let s = script(vec![
            Operation::new(PUSHLOCALINT, 0),
            Operation::push_int(5),
            Operation::new(BRANCH_LT, 1),
            Operation::new(JUMP, 3),
            Operation::push_int(6),
            Operation::new(POPLOCALINT, 0),
            Operation::new(JUMP, -7),
            Operation::push_int(0),
            Operation::new(RETURN, 0),
        ]);
        assert_eq!(round_trip(&s).ops, s.ops);
    }

    #[test]
    fn switch_tables_are_rebuilt() {
        let mut s = script(vec![
            Operation::new(PUSHLOCALINT, 0),
            Operation::new(SWITCH, 0),
            Operation::push_int(2),
            Operation::new(RETURN, 0),
            Operation::push_int(1),
            Operation::new(RETURN, 0),
        ]);
        s.header.switches = vec![vec![SwitchCase { value: 1, jump: 2 }, SwitchCase { value: 2, jump: 2 }]];
        let back = round_trip(&s);
        assert_eq!(back.ops, s.ops);
        assert_eq!(back.header.switches, s.header.switches);
    }

    #[test]
    fn conjunction_uses_separate_branches() {
        // if (local0 == 1 && local0 < 5) { return 1 }
        let mut ast = Ast::new();
        let cmp = |ast: &mut Ast, op: OpId, v: i32| {
            let a = ast.raw(Operation::new(PUSHLOCALINT, 0));
            let b = ast.raw(Operation::push_int(v));
            ast.add_with(NodeKind::Branching(op), &[a, b]).unwrap()
        };
        let left = cmp(&mut ast, BRANCH_EQ, 1);
        let right = cmp(&mut ast, BRANCH_LT, 5);
        let cond = ast.add_with(NodeKind::Branching(SHORTING_AND), &[left, right]).unwrap();
        let one = ast.raw(Operation::push_int(1));
        let ret = ast.add_with(NodeKind::RawOp(Operation::new(RETURN, 0)), &[one]).unwrap();
        let then = ast.code_block(0, 0);
        ast.push(then, ret).unwrap();
        let stmt = ast.add(
            NodeKind::If(IfStatement {
                condition: cond,
                true_branch: then,
                false_branch: None,
                end_block: None,
                end_index: 0,
            }),
            None,
        );
        ast.push_list(stmt, &[cond, then]).unwrap();
        let body = ast.code_block(0, 0);
        ast.push(body, stmt).unwrap();
        let root = ast
            .add_with(
                NodeKind::Function(FunctionDef {
                    name: "script1".into(),
                    args: StackList::new(),
                    returns: [StackType::Int].into_iter().collect(),
                    locals: StackDiff::new(1, 0, 0, 0),
                }),
                &[body],
            )
            .unwrap();

        let out = compile(&ast, root, &registry()).unwrap();
        let expected = vec![
            Operation::new(PUSHLOCALINT, 0),
            Operation::push_int(1),
            Operation::new(BRANCH_EQ, 1),
            Operation::new(JUMP, 6),
            Operation::new(PUSHLOCALINT, 0),
            Operation::push_int(5),
            Operation::new(BRANCH_LT, 1),
            Operation::new(JUMP, 2),
            Operation::push_int(1),
            Operation::new(RETURN, 0),
            // default return
            Operation::push_int(0),
            Operation::new(RETURN, 0),
        ];
        assert_eq!(out.ops, expected);
        assert_eq!(out.header.instruction_count, 12);
    }

    #[test]
    fn leftover_jump_is_rejected() {
        let mut ast = Ast::new();
        let block = ast.code_block(0, 0);
        let jump = ast.raw(Operation::new(JUMP, 3));
        ast.push(block, jump).unwrap();
        assert!(matches!(compile_fragment(&ast, block, &registry()), Err(CoreError::Compile(_))));
    }

    #[test]
    fn instruction_limit() {
        let mut ast = Ast::new();
        let block = ast.code_block(0, 0);
        for _ in 0..=u16::MAX as usize {
            let op = ast.raw(Operation::new(PUSHLOCALINT, 0));
            ast.push(block, op).unwrap();
        }
        let err = compile_fragment(&ast, block, &registry()).unwrap_err();
        assert!(matches!(err, CoreError::Compile(_)), "{err}");
    }
}
