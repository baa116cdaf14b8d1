use tracing::{debug, trace};

use super::control::fix_control_flow;
use super::{Ast, ComposedKind, ComposedOp, FunctionDef, NodeId, NodeKind};
use crate::annotate::annotate_block;
use crate::cfg::Cfg;
use crate::entity::EntityRef;
use crate::error::Result;
use crate::ops::named::{
    self, OpId, MINUS, PLUS, POPLOCALINT, POPVAR, POPVARBIT, PUSHLOCALINT, PUSHVAR, PUSHVARBIT,
};
use crate::ops::{ClientScript, OpcodeRegistry, Operation};
use crate::stack::{StackInOut, StackList, StackSlot, StackType};

/// Decompile one script into a tree rooted at a [`NodeKind::Function`].
///
/// `registry` supplies opcode stack effects and script signatures; ops
/// without a known effect are left unbound.
pub fn decompile(script_id: u32, script: &ClientScript, registry: &OpcodeRegistry) -> Result<(Ast, NodeId)> {
    let cfg = Cfg::build(script)?;
    let mut ast = Ast::new();

    let mut sections = Vec::with_capacity(cfg.blocks.len());
    for (_, block) in cfg.blocks.iter() {
        let ops = &script.ops[block.start..block.end];
        let annotation = annotate_block(script_id, ops, registry);
        let section = ast.code_block(script_id, block.start);
        if let Some(b) = ast.block_mut(section) {
            b.unexplained = annotation.unexplained;
        }
        for (i, (op, known)) in ops.iter().zip(annotation.known).enumerate() {
            let node = ast.add(NodeKind::RawOp(op.clone()), Some(block.start + i));
            ast[node].known_stack = known;
            ast.push(section, node)?;
        }
        sections.push(section);
    }
    for (id, block) in cfg.blocks.iter() {
        let from = sections[id.index() as usize];
        for succ in &block.successors {
            ast.add_successor(from, sections[succ.index() as usize])?;
        }
    }

    let program = ast.code_block(script_id, 0);
    if let Some(&first) = sections.first() {
        ast.add_successor(program, first)?;
    }
    // settle join points along the main path first
    let mut node = Some(program);
    for _ in 0..=sections.len() {
        match node {
            Some(n) => node = ast.find_next(n),
            None => break,
        }
    }

    for &section in &sections {
        fold_inc_dec(&mut ast, section)?;
        merge_assignments(&mut ast, section, registry)?;
        bind_arguments(&mut ast, section, registry)?;
        bind_functions(&mut ast, section);
    }
    debug!(script_id, blocks = sections.len(), "built sections");

    fix_control_flow(&mut ast, program, script)?;

    let args = &script.header.args;
    let mut arg_list = StackList::new();
    for (ty, n) in [
        (StackType::Int, args.int),
        (StackType::Long, args.long),
        (StackType::String, args.string),
    ] {
        for _ in 0..n {
            arg_list.push_one(ty);
        }
    }
    let returns = registry
        .scripts
        .get(&script_id)
        .map(|sig| sig.output.clone())
        .unwrap_or_else(|| script.return_type());
    let def = FunctionDef {
        name: format!("script{script_id}"),
        args: arg_list,
        returns,
        locals: script.local_counts(),
    };
    let root = ast.add(NodeKind::Function(def), Some(0));
    ast.push(root, program)?;
    Ok((ast, root))
}

fn raw_ops(ast: &Ast, nodes: &[NodeId]) -> Option<Vec<Operation>> {
    nodes.iter().map(|&n| ast.raw_op(n).cloned()).collect()
}

fn matching_pop(push: OpId) -> Option<OpId> {
    match push {
        PUSHLOCALINT => Some(POPLOCALINT),
        PUSHVAR => Some(POPVAR),
        PUSHVARBIT => Some(POPVARBIT),
        _ => None,
    }
}

/// Recognize `v++`/`v--` (`push v; push v; push 1; plus; pop v`) and
/// `++v`/`--v` (`push v; push 1; plus; pop v; push v`).
fn match_inc_dec(ops: &[Operation]) -> Option<ComposedKind> {
    let [a, b, c, d, e] = ops else {
        return None;
    };
    let step = |op: &Operation| match op.opcode {
        PLUS => Some(true),
        MINUS => Some(false),
        _ => None,
    };
    let same = |x: &Operation, y: &Operation| x.opcode == y.opcode && x.imm == y.imm;
    let stores = |push: &Operation, pop: &Operation| matching_pop(push.opcode) == Some(pop.opcode) && push.imm == pop.imm;

    if same(a, b) && stores(a, e) && c.const_int() == Some(1) {
        if let Some(inc) = step(d) {
            return Some(if inc { ComposedKind::PostInc } else { ComposedKind::PostDec });
        }
    }
    if same(a, e) && stores(a, d) && b.const_int() == Some(1) {
        if let Some(inc) = step(c) {
            return Some(if inc { ComposedKind::PreInc } else { ComposedKind::PreDec });
        }
    }
    None
}

fn fold_inc_dec(ast: &mut Ast, section: NodeId) -> Result<()> {
    let children = ast.children(section).to_vec();
    let mut out = Vec::with_capacity(children.len());
    let mut i = 0;
    let mut folded = false;
    while i < children.len() {
        let window = &children[i..(i + 5).min(children.len())];
        let composed = raw_ops(ast, window).and_then(|ops| match_inc_dec(&ops).map(|kind| (kind, ops)));
        match composed {
            Some((kind, ops)) => {
                let original = ast[window[0]].original_index;
                let node = ast.add(
                    NodeKind::Composed(ComposedOp {
                        kind,
                        target: ops[0].clone(),
                        ops,
                    }),
                    original,
                );
                ast[node].known_stack = Some(StackInOut::of(&[], &[StackType::Int]));
                out.push(node);
                i += 5;
                folded = true;
            }
            None => {
                out.push(children[i]);
                i += 1;
            }
        }
    }
    if folded {
        ast.set_children(section, out)?;
    }
    Ok(())
}

fn is_assign_target(ast: &Ast, node: NodeId, registry: &OpcodeRegistry) -> bool {
    let Some(op) = ast.raw_op(node) else {
        return false;
    };
    let pops = named::POP_LOCAL.contains(&op.opcode)
        || named::POP_DISCARD.contains(&op.opcode)
        || matches!(op.opcode, POPVAR | POPVARBIT);
    pops && ast
        .stack(node, registry)
        .is_some_and(|s| s.output.is_empty() && !s.input.is_empty())
}

/// Coalesce runs of pops into one assignment with several targets.
fn merge_assignments(ast: &mut Ast, section: NodeId, registry: &OpcodeRegistry) -> Result<()> {
    let children = ast.children(section).to_vec();
    let mut out = Vec::with_capacity(children.len());
    let mut run: Vec<NodeId> = Vec::new();
    let mut changed = false;

    let mut flush = |ast: &mut Ast, run: &mut Vec<NodeId>, out: &mut Vec<NodeId>| {
        if run.is_empty() {
            return;
        }
        let mut targets = Vec::with_capacity(run.len());
        let mut input = StackList::new();
        for &pop in run.iter().rev() {
            if let Some(op) = ast.raw_op(pop) {
                targets.push(op.clone());
            }
            if let Some(stack) = ast.stack(pop, registry) {
                input.push(&stack.input);
            }
        }
        let original = ast[run[0]].original_index;
        let node = ast.add(NodeKind::VarAssign { targets }, original);
        ast[node].known_stack = Some(StackInOut::new(input, StackList::new()));
        out.push(node);
        run.clear();
        changed = true;
    };

    for child in children {
        if is_assign_target(ast, child, registry) {
            run.push(child);
            continue;
        }
        flush(ast, &mut run, &mut out);
        out.push(child);
    }
    flush(ast, &mut run, &mut out);
    if changed {
        ast.set_children(section, out)?;
    }
    Ok(())
}

/// Move producers under the operation consuming their values, as long as
/// the stack effects line up exactly.
fn bind_arguments(ast: &mut Ast, section: NodeId, registry: &OpcodeRegistry) -> Result<()> {
    let children = ast.children(section).to_vec();
    let mut usable: Vec<NodeId> = Vec::new();
    for node in children {
        let (mut args, output) = match ast.stack(node, registry) {
            Some(stack) => (stack.input.clone(), stack.output.clone()),
            None => (StackList::new(), StackList::new()),
        };
        while !args.is_empty() {
            let Some(&producer) = usable.last() else {
                break;
            };
            let produced = match ast.stack(producer, registry) {
                Some(stack) if !stack.output.is_empty() => stack.output.clone(),
                _ => break,
            };
            let mut remaining = args.clone();
            if remaining.try_pop(&produced, 0) != 0 {
                break;
            }
            ast.unshift(node, producer)?;
            usable.pop();
            args = remaining;
        }
        if output.is_empty() {
            usable.clear();
        } else {
            usable.push(node);
        }
    }
    Ok(())
}

/// Turn type tags packing a vararg into function binds, which keep the
/// script id and arguments as children.
fn bind_functions(ast: &mut Ast, section: NodeId) {
    for id in ast.descendants(section) {
        let node = &ast[id];
        let packs = node
            .known_stack
            .as_ref()
            .is_some_and(|s| s.output.values == [StackSlot::Vararg]);
        let tag = match &node.kind {
            NodeKind::RawOp(op) if packs => op.const_string().map(str::to_string),
            _ => None,
        };
        if let Some(tag) = tag {
            trace!(%id, %tag, "function bind");
            ast[id].kind = NodeKind::FunctionBind { tag };
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::ops::named::{JUMP, RETURN};
    use cs2script::{BuildNumber, ScriptHeader, SlotCounts};

    fn registry() -> OpcodeRegistry {
        let mut reg = OpcodeRegistry::unscrambled(BuildNumber(900));
        reg.insert(crate::ops::OpcodeInfo::new(0x92, named::POPDISCARDINT, &[cs2script::ImmediateKind::Byte]));
        for (raw, id) in [(0x90, PLUS), (0x91, MINUS)] {
            reg.insert(crate::ops::OpcodeInfo::new(raw, id, &[cs2script::ImmediateKind::Byte]));
            if let Some(info) = reg.get_mut(id) {
                info.stack = StackInOut::of(&[StackType::Int, StackType::Int], &[StackType::Int]);
            }
        }
        reg
    }

    fn script(ops: Vec<Operation>) -> ClientScript {
        ClientScript {
            header: ScriptHeader {
                locals: SlotCounts { int: 2, long: 0, string: 0 },
                ..Default::default()
            },
            ops,
        }
    }

    fn body(ast: &Ast, root: NodeId) -> Vec<NodeId> {
        let program = ast.children(root)[0];
        ast.children(program).to_vec()
    }

    #[test]
    fn increments_fold() {
        let s = script(vec![
            Operation::new(PUSHLOCALINT, 1),
            Operation::new(PUSHLOCALINT, 1),
            Operation::push_int(1),
            Operation::new(PLUS, 0),
            Operation::new(POPLOCALINT, 1),
            Operation::new(named::POPDISCARDINT, 0),
            Operation::push_int(0),
            Operation::new(RETURN, 0),
        ]);
        let (ast, root) = decompile(3, &s, &registry()).unwrap();
        let stmts = body(&ast, root);
        let NodeKind::VarAssign { targets } = ast.kind(stmts[0]) else {
            panic!("expected assignment, got {:?}", ast.kind(stmts[0]));
        };
        assert_eq!(targets[0].opcode, named::POPDISCARDINT);
        let value = ast.children(stmts[0])[0];
        assert!(matches!(
            ast.kind(value),
            NodeKind::Composed(ComposedOp { kind: ComposedKind::PostInc, .. })
        ));
    }

    #[test]
    fn consecutive_pops_share_one_assignment() {
        let s = script(vec![
            Operation::push_int(4),
            Operation::push_int(5),
            Operation::new(POPLOCALINT, 0),
            Operation::new(POPLOCALINT, 1),
            Operation::push_int(0),
            Operation::new(RETURN, 0),
        ]);
        let (ast, root) = decompile(3, &s, &registry()).unwrap();
        let stmts = body(&ast, root);
        let NodeKind::VarAssign { targets } = ast.kind(stmts[0]) else {
            panic!("expected assignment");
        };
        // reverse pop order: the first target receives the bottom value
        assert_eq!(targets.iter().map(|t| t.imm).collect::<Vec<_>>(), [1, 0]);
        let values: Vec<_> = ast
            .children(stmts[0])
            .iter()
            .map(|&c| ast.raw_op(c).and_then(Operation::const_int))
            .collect();
        assert_eq!(values, [Some(4), Some(5)]);
    }

    #[test]
    fn arithmetic_binds_operands() {
        let s = script(vec![
            Operation::new(PUSHLOCALINT, 0),
            Operation::push_int(2),
            Operation::new(PLUS, 0),
            Operation::new(RETURN, 0),
        ]);
        let mut reg = registry();
        reg.scripts.insert(3, StackInOut::of(&[], &[StackType::Int]));
        let (ast, root) = decompile(3, &s, &reg).unwrap();
        let stmts = body(&ast, root);
        assert_eq!(stmts.len(), 1);
        let plus = ast.children(stmts[0])[0];
        assert_eq!(ast.raw_op(plus).map(|o| o.opcode), Some(PLUS));
        assert_eq!(ast.children(plus).len(), 2);
    }

    #[test]
    fn unknown_ops_stay_unbound() {
        let s = script(vec![
            Operation::push_int(1),
            Operation::new(9999, 0),
            Operation::new(JUMP, 0),
            Operation::push_int(0),
            Operation::new(RETURN, 0),
        ]);
        let (ast, root) = decompile(3, &s, &registry()).unwrap();
        let stmts = body(&ast, root);
        assert!(stmts.len() >= 3);
        assert!(ast.children(stmts[0]).is_empty());
    }
}
