//! Basic blocks of one script and the edges between them.
//!
//! Blocks start at every jump/branch/switch target and after every
//! instruction that leaves straight-line flow. Blocks are numbered in
//! instruction order, so comparing [`BlockId`]s compares positions.

use std::collections::BTreeSet;

use crate::define_entity;
use crate::entity::PrimaryMap;
use crate::error::{CoreError, Result};
use crate::ops::named::{self, JUMP, RETURN, SWITCH};
use crate::ops::ClientScript;

define_entity!(BlockId);

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct BasicBlock {
    /// Index of the first instruction.
    pub start: usize,
    /// One past the last instruction.
    pub end: usize,
    pub successors: Vec<BlockId>,
    pub predecessors: Vec<BlockId>,
    /// Earliest preceding block with an edge into this one.
    pub first_pointer: Option<BlockId>,
    /// Furthest following block with an edge into this one. Set on loop
    /// heads only.
    pub last_pointer: Option<BlockId>,
}

impl BasicBlock {
    fn new(start: usize, end: usize) -> Self {
        Self {
            start,
            end,
            successors: Vec::new(),
            predecessors: Vec::new(),
            first_pointer: None,
            last_pointer: None,
        }
    }

    pub fn len(&self) -> usize {
        self.end - self.start
    }

    pub fn is_empty(&self) -> bool {
        self.start == self.end
    }

    /// Instruction index where the loop closing on this block ends.
    pub fn max_end(&self, cfg: &Cfg) -> Option<usize> {
        self.last_pointer.map(|b| cfg.blocks[b].start)
    }
}

#[derive(Debug, Clone)]
pub struct Cfg {
    pub blocks: PrimaryMap<BlockId, BasicBlock>,
}

/// Absolute target of a jump/branch at `index`.
pub fn jump_target(index: usize, imm: i32, len: usize) -> Result<usize> {
    let target = index as i64 + 1 + imm as i64;
    if target < 0 || target as usize > len {
        return Err(CoreError::Structure(format!(
            "jump at {index} to {target} is outside the script (len {len})"
        )));
    }
    Ok(target as usize)
}

/// Absolute targets of the switch at `index`, in table order.
pub fn switch_targets(script: &ClientScript, index: usize) -> Result<Vec<(i32, usize)>> {
    let op = &script.ops[index];
    let table = script
        .header
        .switches
        .get(op.imm as usize)
        .ok_or_else(|| CoreError::Structure(format!("switch at {index} uses missing table {}", op.imm)))?;
    table
        .iter()
        .map(|case| Ok((case.value, jump_target(index, case.jump, script.ops.len())?)))
        .collect()
}

impl Cfg {
    pub fn build(script: &ClientScript) -> Result<Self> {
        let ops = &script.ops;
        let len = ops.len();

        let mut starts = BTreeSet::new();
        starts.insert(0);
        for (i, op) in ops.iter().enumerate() {
            let leaves_flow = match op.opcode {
                JUMP => {
                    starts.insert(jump_target(i, op.imm, len)?);
                    true
                }
                SWITCH => {
                    for (_, target) in switch_targets(script, i)? {
                        starts.insert(target);
                    }
                    true
                }
                op if named::is_branch(op) => {
                    starts.insert(jump_target(i, ops[i].imm, len)?);
                    true
                }
                RETURN => true,
                _ => false,
            };
            if leaves_flow {
                starts.insert(i + 1);
            }
        }
        starts.retain(|&s| s < len);

        let starts: Vec<usize> = starts.into_iter().collect();
        let mut cfg = Cfg {
            blocks: PrimaryMap::new(),
        };
        for (n, &start) in starts.iter().enumerate() {
            let end = starts.get(n + 1).copied().unwrap_or(len);
            cfg.blocks.push(BasicBlock::new(start, end));
        }

        for id in cfg.blocks.keys().collect::<Vec<_>>() {
            let block = &cfg.blocks[id];
            if block.is_empty() {
                continue;
            }
            let last = block.end - 1;
            let op = &ops[last];
            let next = block.end;
            let mut targets = Vec::new();
            match op.opcode {
                RETURN => {}
                JUMP => targets.push(jump_target(last, op.imm, len)?),
                SWITCH => {
                    for (_, t) in switch_targets(script, last)? {
                        if !targets.contains(&t) {
                            targets.push(t);
                        }
                    }
                    if !targets.contains(&next) {
                        targets.push(next);
                    }
                }
                o if named::is_branch(o) => {
                    targets.push(next);
                    targets.push(jump_target(last, op.imm, len)?);
                }
                _ => targets.push(next),
            }
            for target in targets {
                if target == len {
                    // falls off the end, or jumps to it
                    continue;
                }
                let to = cfg.block_at(target).ok_or_else(|| {
                    CoreError::Structure(format!("no block starts at {target}"))
                })?;
                cfg.add_successor(id, to)?;
            }
        }
        Ok(cfg)
    }

    pub fn block_at(&self, start: usize) -> Option<BlockId> {
        self.blocks.iter().find(|(_, b)| b.start == start).map(|(id, _)| id)
    }

    /// Block containing instruction `index`.
    pub fn block_of(&self, index: usize) -> Option<BlockId> {
        self.blocks
            .iter()
            .find(|(_, b)| b.start <= index && index < b.end)
            .map(|(id, _)| id)
    }

    pub fn add_successor(&mut self, from: BlockId, to: BlockId) -> Result<()> {
        if self.blocks[from].successors.contains(&to) {
            return Err(CoreError::Structure(format!(
                "{to} is already a successor of {from}"
            )));
        }
        self.blocks[from].successors.push(to);
        let target = &mut self.blocks[to];
        target.predecessors.push(from);
        if from < to && target.first_pointer.map_or(true, |p| from < p) {
            target.first_pointer = Some(from);
        }
        if from > to && target.last_pointer.map_or(true, |p| from > p) {
            target.last_pointer = Some(from);
        }
        Ok(())
    }

    pub fn is_loop_head(&self, id: BlockId) -> bool {
        self.blocks[id].last_pointer.is_some()
    }
}
