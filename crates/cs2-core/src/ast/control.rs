//! Folding of branch, switch and jump operations into structured
//! statements.
//!
//! A post-order walk visits every node once; rewrites re-position the
//! cursor so that the freshly created statement is walked from its first
//! leaf. Code blocks absorb their join block after their own contents were
//! processed, which pulls the rest of the script into the tree piece by
//! piece.

use tracing::{debug, trace};

use super::{Ast, BranchEnd, NodeId, NodeKind, RewriteCursor, SwitchStatement};
use crate::cfg::{jump_target, switch_targets};
use crate::error::{CoreError, Result};
use crate::ops::named::{self, JUMP, SHORTING_AND, SHORTING_OR, SWITCH};
use crate::ops::{ClientScript, Operation};

pub(super) fn fix_control_flow(ast: &mut Ast, program: NodeId, script: &ClientScript) -> Result<()> {
    let mut cursor = RewriteCursor::new(program);
    let mut steps = 0usize;
    let mut node = cursor.go_to_start(ast);
    while let Some(id) = node {
        steps += 1;
        if steps > 64 * (ast.len() + 16) {
            return Err(CoreError::Structure("control flow rewrite did not settle".into()));
        }
        if let Some(op) = ast.raw_op(id).cloned() {
            let index = ast[id].original_index.unwrap_or(0);
            if named::is_branch(op.opcode) {
                rewrite_branch(ast, &mut cursor, id, script.ops.len())?;
            } else if op.opcode == SWITCH {
                rewrite_switch(ast, &mut cursor, id, index, script)?;
            } else if op.opcode == JUMP {
                rewrite_jump(ast, &mut cursor, id, index, &op, script.ops.len())?;
            }
        } else if ast.block(id).is_some() {
            merge_join(ast, &mut cursor, id)?;
        }
        node = cursor.next(ast);
    }
    Ok(())
}

fn expect_parent(ast: &Ast, id: NodeId) -> Result<NodeId> {
    ast.parent(id)
        .ok_or_else(|| CoreError::Structure(format!("{id} has no parent")))
}

/// Wrap a loop head so that the loop can later replace it in place.
fn wrap_loop_head(ast: &mut Ast, block: NodeId) -> Result<NodeId> {
    let (script_id, start, max_end, is_head) = match ast.block(block) {
        Some(b) => (b.script_id, b.start, b.max_end, b.last_pointer.is_some()),
        None => return Ok(block),
    };
    if !is_head {
        return Ok(block);
    }
    let wrapper = ast.code_block(script_id, start);
    ast.merge_block(wrapper, block, false)?;
    if let Some(b) = ast.block_mut(wrapper) {
        b.max_end = max_end;
    }
    Ok(wrapper)
}

fn rewrite_branch(ast: &mut Ast, cursor: &mut RewriteCursor, id: NodeId, len: usize) -> Result<()> {
    let parent = expect_parent(ast, id)?;
    let successors = match ast.block(parent) {
        Some(b) if b.successors.len() == 2 => b.successors.clone(),
        _ => return Err(CoreError::Structure("branch outside a two-way code block".into())),
    };
    if ast.children(parent).last() != Some(&id) {
        return Err(CoreError::Structure("branch is not the last op of its block".into()));
    }
    let end = ast.find_next(parent);
    let op = ast
        .raw_op(id)
        .map(|op| op.opcode)
        .ok_or_else(|| CoreError::Structure(format!("{id} is not an operation")))?;

    let true_block = wrap_loop_head(ast, successors[1])?;
    let mut false_block = Some(successors[0]);
    if ast.is_lone_jump(successors[0]) {
        let target = ast.block(successors[0]).and_then(|b| b.successors.first().copied());
        false_block = target.filter(|&t| Some(t) != end);
    }
    let false_block = match false_block {
        Some(f) => Some(wrap_loop_head(ast, f)?),
        None => None,
    };

    let condition = ast.add(NodeKind::Branching(op), ast[id].original_index);
    let operands = ast.children(id).to_vec();
    ast.push_list(condition, &operands)?;

    // a lone branch block directly inside an if extends that if's condition
    let grandparent = ast.parent(parent);
    if let Some(gp) = grandparent.filter(|_| ast.children(parent).len() == 1) {
        if let Some(outer) = ast.if_statement(gp).cloned() {
            if outer.end_block == end {
                let merged = if outer.true_branch == true_block && outer.false_branch == Some(parent) {
                    Some((SHORTING_OR, outer.true_branch, false_block))
                } else if outer.false_branch == false_block && outer.true_branch == parent {
                    Some((SHORTING_AND, true_block, outer.false_branch))
                } else {
                    None
                };
                if let Some((logic, t, f)) = merged {
                    trace!(%gp, logic = named::display_name(logic), "merging condition");
                    let combined = ast.add(NodeKind::Branching(logic), ast[gp].original_index);
                    ast.push_list(combined, &[outer.condition, condition])?;
                    ast.set_if_branches(gp, combined, t, f)?;
                    // the emptied block must not absorb anything anymore
                    if let Some(b) = ast.block_mut(parent) {
                        b.branch_end = BranchEnd::Done(None);
                    }
                    return terminal_else(ast, gp);
                }
            }
        }
    }

    let end_index = end.map_or(len, |e| ast.start_of(e));
    let if_node = ast.new_if(condition, true_block, false_block, end, end_index)?;
    cursor.replace_node(ast, if_node)?;
    terminal_else(ast, if_node)?;
    cursor.set_first_child(ast, if_node, true);
    Ok(())
}

/// `if (c) { ...; return } <rest>` where `<rest>` is a returning block
/// only reachable from here reads as an if/else.
fn terminal_else(ast: &mut Ast, if_node: NodeId) -> Result<()> {
    let Some(stmt) = ast.if_statement(if_node).cloned() else {
        return Ok(());
    };
    let Some(end) = stmt.end_block.filter(|_| stmt.false_branch.is_none()) else {
        return Ok(());
    };
    let single_entry = ast.block(end).is_some_and(|b| b.predecessors == 1);
    if !(single_entry && ast.is_terminal_block(stmt.true_branch) && ast.is_terminal_block(end)) {
        return Ok(());
    }
    let Some(holder) = ast.parent(if_node) else {
        return Ok(());
    };
    trace!(%if_node, %end, "both arms return");
    if let NodeKind::If(s) = &mut ast[if_node].kind {
        s.end_block = None;
    }
    if let Some(b) = ast.block_mut(holder) {
        b.branch_end = BranchEnd::Done(None);
    }
    ast.set_if_branches(if_node, stmt.condition, stmt.true_branch, Some(end))
}

fn rewrite_switch(
    ast: &mut Ast,
    cursor: &mut RewriteCursor,
    id: NodeId,
    index: usize,
    script: &ClientScript,
) -> Result<()> {
    let parent = expect_parent(ast, id)?;
    let successors = ast
        .block(parent)
        .map(|b| b.successors.clone())
        .ok_or_else(|| CoreError::Structure("switch outside a code block".into()))?;
    let end = ast.find_next(parent);
    let end_index = end.map_or(script.ops.len(), |e| ast.start_of(e));

    let block_at = |ast: &Ast, start: usize| -> Result<NodeId> {
        successors
            .iter()
            .copied()
            .find(|&s| ast.start_of(s) == start)
            .ok_or_else(|| CoreError::Structure(format!("no switch branch starts at {start}")))
    };

    let mut cases = Vec::new();
    for (value, target) in switch_targets(script, index)? {
        cases.push((value, block_at(ast, target)?));
    }
    let mut default = successors.iter().copied().find(|&s| ast.start_of(s) == index + 1);
    if let Some(d) = default.filter(|&d| ast.is_lone_jump(d)) {
        default = ast.block(d).and_then(|b| b.successors.first().copied());
    }
    let default = default.filter(|&d| ast.start_of(d) != end_index);

    let value = ast.children(id).first().copied();
    let switch = ast.add(
        NodeKind::Switch(SwitchStatement {
            value,
            cases: cases.clone(),
            default,
        }),
        Some(index),
    );
    let mut children: Vec<NodeId> = value.into_iter().collect();
    for branch in cases.iter().map(|&(_, b)| b).chain(default) {
        if !children.contains(&branch) {
            children.push(branch);
        }
        if let Some(b) = ast.block_mut(branch) {
            b.max_end = Some(end_index);
        }
    }
    ast.push_list(switch, &children)?;
    // operands beyond the value stay with the switch
    let rest = ast.children(id).to_vec();
    ast.push_list(switch, &rest)?;

    cursor.replace_node(ast, switch)?;
    cursor.set_first_child(ast, switch, true);
    Ok(())
}

fn rewrite_jump(
    ast: &mut Ast,
    cursor: &mut RewriteCursor,
    id: NodeId,
    index: usize,
    op: &Operation,
    len: usize,
) -> Result<()> {
    let target = jump_target(index, op.imm, len)?;
    let parent = expect_parent(ast, id)?;
    if ast.block(parent).is_some_and(|b| b.max_end == Some(target)) {
        // closing jump of a branch, implied by the structure
        cursor.remove(ast)?;
        return Ok(());
    }

    let mut ancestor = Some(parent);
    while let Some(a) = ancestor {
        ancestor = ast.parent(a);
        let Some(stmt) = ast.if_statement(a).cloned() else {
            continue;
        };
        let head = ast
            .parent(a)
            .filter(|&h| ast.block(h).is_some())
            .ok_or_else(|| CoreError::Structure("if statement outside a code block".into()))?;
        if ast.start_of(head) != target {
            continue;
        }
        let outer = ast
            .parent(head)
            .ok_or_else(|| CoreError::Structure("loop head without parent".into()))?;
        if ast.children(head) != [a] {
            debug!(target, "loop head has statements before its condition, keeping the jump");
            return Ok(());
        }
        if stmt.false_branch.is_some() {
            return Err(CoreError::Structure(format!("loop at {target} has an else branch")));
        }
        trace!(target, "while loop");
        let while_node = ast.add(
            NodeKind::While {
                condition: stmt.condition,
                body: stmt.true_branch,
            },
            Some(target),
        );
        ast.replace_child(outer, head, while_node)?;
        ast.push_list(while_node, &[stmt.condition, stmt.true_branch])?;
        cursor.rebuild_stack(ast);
        cursor.remove(ast)?;
        return Ok(());
    }
    Ok(())
}

/// Absorb the join block of a finished code block.
fn merge_join(ast: &mut Ast, cursor: &mut RewriteCursor, id: NodeId) -> Result<()> {
    let Some(end) = ast.find_next(id) else {
        return Ok(());
    };
    let max_end = ast.block(id).and_then(|b| b.max_end);
    if max_end.is_some_and(|m| ast.start_of(end) >= m) {
        return Ok(());
    }
    let flatten = ast.block(end).is_some_and(|b| b.last_pointer.is_none());
    trace!(%id, %end, flatten, "merging join block");
    cursor.prev(ast);
    ast.merge_block(id, end, flatten)
}
