//! Per-opcode stack effects from straight-line blocks.
//!
//! Every block of every decoded script leaves the stack as it found it.
//! Scanning a block from the front tells an opcode what may be on the
//! stack when it runs (an upper bound for its inputs); scanning from the
//! back tells it what the rest of the block still needs (an upper bound
//! for its outputs). A block with exactly one opcode of unknown effect,
//! possibly repeated, fixes that opcode's net change, which trims the
//! bounds down to the real effect.

use std::collections::BTreeMap;

use tracing::{debug, info};

use super::Candidate;
use crate::annotate::annotate_block;
use crate::cfg::Cfg;
use crate::config::CalibrationConfig;
use crate::error::{CoreError, Result};
use crate::ops::named::OpId;
use crate::ops::{OpcodeRegistry, Operation};
use crate::stack::{StackInOut, StackList};

/// One straight-line block and the effects its context gives away.
#[derive(Debug, Clone)]
pub struct Equation {
    pub script: u32,
    pub start: usize,
    ops: Vec<Operation>,
    known: Vec<Option<StackInOut>>,
    unresolved: Vec<bool>,
    pub has_vararg_tag: bool,
}

impl Equation {
    fn describe(&self) -> String {
        format!("script {} block at {}", self.script, self.start)
    }

    fn is_problem(&self, i: usize) -> bool {
        self.unresolved[i]
    }
}

/// Split every decoded candidate into block equations, shortest first.
pub fn collect_equations(registry: &OpcodeRegistry, candidates: &BTreeMap<u32, Candidate>) -> Vec<Equation> {
    let mut res = Vec::new();
    for cand in candidates.values() {
        let Some(script) = &cand.script else {
            continue;
        };
        let cfg = match Cfg::build(script) {
            Ok(cfg) => cfg,
            Err(e) => {
                debug!(script = cand.id, error = %e, "no block graph, skipping");
                continue;
            }
        };
        for (_, block) in cfg.blocks.iter() {
            let ops = &script.ops[block.start..block.end];
            let ann = annotate_block(cand.id, ops, registry);
            res.push(Equation {
                script: cand.id,
                start: block.start,
                ops: ops.to_vec(),
                known: ann.known,
                unresolved: ann.unresolved,
                has_vararg_tag: ann.has_vararg_tag,
            });
        }
    }
    res.sort_by_key(|eq| eq.ops.len());
    res
}

fn incompatible(eq: &Equation, op: OpId, stack: &StackInOut, side: &str) -> CoreError {
    CoreError::Calibration(format!(
        "{side} of op {op} ({stack}) in {} contradicts its solved effect",
        eq.describe()
    ))
}

/// Narrow inputs walking the block front to back.
fn front_scan(eq: &Equation, registry: &mut OpcodeRegistry) -> Result<()> {
    let mut front = StackList::new();
    for (i, op) in eq.ops.iter().enumerate() {
        if eq.is_problem(i) {
            break;
        }
        if let Some(known) = &eq.known[i] {
            if front.try_pop(&known.input, 0) != 0 {
                break;
            }
            front.push(&known.output);
            continue;
        }
        let Some(info) = registry.get_mut(op.opcode) else {
            break;
        };
        let stack = &mut info.stack;
        if !stack.initialized_in {
            stack.input = front.clone();
            stack.initialized_in = true;
        } else {
            let shortage = front.try_pop(&stack.input, 0);
            if shortage > 0 {
                if stack.initialized_through {
                    let keep = stack.input.values.len() - shortage;
                    if stack.output.try_pop_reverse(&stack.input, keep) != 0 {
                        return Err(incompatible(eq, op.opcode, stack, "input"));
                    }
                }
                stack.input.values.drain(..shortage);
            }
        }
        if !stack.initialized_through || !stack.initialized_out {
            break;
        }
        front.push(&stack.output);
    }
    Ok(())
}

/// Narrow outputs walking the block back to front.
fn back_scan(eq: &Equation, registry: &mut OpcodeRegistry) -> Result<()> {
    let mut back = StackList::new();
    for (i, op) in eq.ops.iter().enumerate().rev() {
        if eq.is_problem(i) {
            break;
        }
        if let Some(known) = &eq.known[i] {
            if back.try_pop(&known.output, 0) != 0 {
                break;
            }
            back.push(&known.input);
            continue;
        }
        let Some(info) = registry.get_mut(op.opcode) else {
            break;
        };
        let stack = &mut info.stack;
        if !stack.initialized_out {
            stack.output = back.clone();
            stack.initialized_out = true;
        } else {
            let shortage = back.try_pop(&stack.output, 0);
            if shortage > 0 {
                if stack.initialized_through {
                    let keep = stack.output.values.len() - shortage;
                    if stack.input.try_pop_reverse(&stack.output, keep) != 0 {
                        return Err(incompatible(eq, op.opcode, stack, "output"));
                    }
                }
                stack.output.values.drain(..shortage);
            }
        }
        if !stack.initialized_through || !stack.initialized_in {
            break;
        }
        back.push(&stack.input);
    }
    Ok(())
}

/// Apply one block equation. Returns the opcode it solved, if any.
pub fn test_equation(eq: &Equation, registry: &mut OpcodeRegistry) -> Result<Option<OpId>> {
    front_scan(eq, registry)?;
    back_scan(eq, registry)?;

    let mut total = 0;
    let mut unknown: Option<OpId> = None;
    let mut unknown_count = 0;
    for (i, op) in eq.ops.iter().enumerate() {
        if eq.is_problem(i) {
            return Ok(None);
        }
        if let Some(known) = &eq.known[i] {
            total += known.total_change();
            continue;
        }
        match registry.stack_of(op.opcode) {
            Some(stack) => total += stack.total_change(),
            None => match unknown {
                None => {
                    unknown = Some(op.opcode);
                    unknown_count = 1;
                }
                Some(u) if u == op.opcode => unknown_count += 1,
                // a second distinct unknown, nothing to solve here
                Some(_) => return Ok(None),
            },
        }
    }

    let Some(id) = unknown else {
        if total != 0 {
            return Err(CoreError::Calibration(format!(
                "net stack change of fully known {} is {total}, not 0",
                eq.describe()
            )));
        }
        return Ok(None);
    };
    if total.rem_euclid(unknown_count) != 0 {
        return Err(CoreError::Calibration(format!(
            "net change {total} of {} does not divide over {unknown_count} uses of op {id}",
            eq.describe()
        )));
    }
    let Some(info) = registry.get_mut(id) else {
        return Ok(None);
    };
    let stack = &mut info.stack;
    if !stack.initialized_in || !stack.initialized_out {
        return Ok(None);
    }
    let excess = total / unknown_count + stack.total_change();
    let trimmed = match excess {
        0 => true,
        n if n > 0 => stack.output.try_shift(n as usize),
        n => stack.input.try_shift((-n) as usize),
    };
    if !trimmed {
        return Ok(None);
    }
    stack.initialized_through = true;
    Ok(Some(id))
}

#[derive(Debug, Default, Clone, Copy, PartialEq, Eq)]
struct Progress {
    done: usize,
    partial: usize,
    missing: usize,
}

fn progress(registry: &OpcodeRegistry) -> Progress {
    let mut p = Progress::default();
    for info in registry.iter() {
        let s = &info.stack;
        if s.initialized_through {
            p.done += 1;
        } else if s.initialized_in || s.initialized_out {
            p.partial += 1;
        } else {
            p.missing += 1;
        }
    }
    p
}

/// Solve stack effects for every opcode the candidates use. Blocks with
/// vararg tags are left out of the first stage since their shapes lean on
/// guesses about the tags.
pub fn find_stack_effects(
    registry: &mut OpcodeRegistry,
    candidates: &BTreeMap<u32, Candidate>,
    config: &CalibrationConfig,
) -> Result<()> {
    let equations = collect_equations(registry, candidates);
    for (stage, with_varargs) in [false, true].into_iter().enumerate() {
        let mut last = progress(registry);
        for iteration in 0..config.stack_iterations {
            let mut solved = 0;
            for eq in equations.iter().filter(|eq| with_varargs || !eq.has_vararg_tag) {
                if test_equation(eq, registry)?.is_some() {
                    solved += 1;
                }
            }
            let now = progress(registry);
            info!(
                stage,
                iteration,
                solved,
                done = now.done,
                partial = now.partial,
                missing = now.missing,
                "stack effect solving"
            );
            if now == last && solved == 0 {
                break;
            }
            last = now;
        }
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::ops::named::{PLUS, POPLOCALINT, PUSHLOCALINT, RETURN};
    use crate::ops::OpcodeInfo;
    use crate::stack::StackType;
    use cs2script::{BuildNumber, ImmediateKind};

    fn registry() -> OpcodeRegistry {
        let mut reg = OpcodeRegistry::unscrambled(BuildNumber(950));
        reg.insert(OpcodeInfo::new(0x90, PLUS, &[ImmediateKind::Byte]));
        reg.insert(OpcodeInfo::new(0x91, 20000, &[ImmediateKind::Byte]));
        reg.insert(OpcodeInfo::new(0x92, 20001, &[ImmediateKind::Byte]));
        reg.scripts.insert(1, StackInOut::of(&[], &[StackType::Int]));
        reg
    }

    fn equation(reg: &OpcodeRegistry, ops: Vec<Operation>) -> Equation {
        let ann = annotate_block(1, &ops, reg);
        Equation {
            script: 1,
            start: 0,
            ops,
            known: ann.known,
            unresolved: ann.unresolved,
            has_vararg_tag: ann.has_vararg_tag,
        }
    }

    #[test]
    fn single_unknown_is_divided_out() {
        let mut reg = registry();
        let eq = equation(
            &reg,
            vec![
                Operation::push_int(5),
                Operation::push_int(1),
                Operation::new(PLUS, 0),
                Operation::new(POPLOCALINT, 0),
                Operation::new(PUSHLOCALINT, 0),
                Operation::new(RETURN, 0),
            ],
        );
        assert_eq!(test_equation(&eq, &mut reg).unwrap(), Some(PLUS));
        assert_eq!(reg.stack_of(PLUS).unwrap().to_string(), "int(int,int)");
    }

    #[test]
    fn repeated_unknown_shares_the_change() {
        let mut reg = registry();
        // two pops of a value each from an op nobody knows yet
        let eq = equation(
            &reg,
            vec![
                Operation::push_int(1),
                Operation::push_int(2),
                Operation::new(20000, 0),
                Operation::new(20000, 0),
                Operation::push_int(0),
                Operation::new(RETURN, 0),
            ],
        );
        test_equation(&eq, &mut reg).unwrap();
        // the front scan only reaches the first use, which could see both
        // values, so the division trims it down to one
        let stack = reg.stack_of(20000).unwrap();
        assert_eq!(stack.total_change(), -1);
        assert_eq!(stack.input.to_string(), "int");
    }

    #[test]
    fn two_distinct_unknowns_stay_open() {
        let mut reg = registry();
        let eq = equation(
            &reg,
            vec![
                Operation::push_int(1),
                Operation::new(20000, 0),
                Operation::new(20001, 0),
                Operation::push_int(0),
                Operation::new(RETURN, 0),
            ],
        );
        assert_eq!(test_equation(&eq, &mut reg).unwrap(), None);
        let first = &reg.get(20000).unwrap().stack;
        assert!(first.initialized_in && !first.initialized_through);
        // the later op learns what the rest of the block needs
        let second = &reg.get(20001).unwrap().stack;
        assert!(second.initialized_out);
        assert!(second.output.is_empty());
    }

    #[test]
    fn unbalanced_known_block_is_fatal() {
        let mut reg = registry();
        let eq = equation(
            &reg,
            vec![
                Operation::push_int(1),
                Operation::push_int(0),
                Operation::new(RETURN, 0),
            ],
        );
        assert!(matches!(test_equation(&eq, &mut reg), Err(CoreError::Calibration(_))));
    }
}
