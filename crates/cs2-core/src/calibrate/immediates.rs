//! Immediate-kind search for opcodes no reference script contains.
//!
//! The instruction stream does not delimit immediates, so every way of
//! reading a script is a path through a tree of `(opcode, kind)` choices.
//! A path is a solution when it consumes exactly the declared number of
//! instructions and ends on the last byte. Positions where all surviving
//! solutions agree on the opcode narrow that opcode's kinds to the ones
//! the solutions used.
//!
//! The search is breadth first and bails out once too many states are
//! live. Short scripts are tried first; scripts left with unknowns are then
//! chained on their first unknown opcode so that one opcode must be read
//! the same way in all of them.

use std::collections::BTreeMap;

use cs2script::immediate::try_read_immediate;
use cs2script::ImmediateKind;
use tracing::{debug, info};

use super::Candidate;
use crate::config::CalibrationConfig;
use crate::error::{CoreError, Result};
use crate::ops::OpcodeRegistry;

/// The opcode set holds exactly this many `switch`-kind opcodes...
const SWITCH_OPS: usize = 1;
/// ...and this many `tribyte`-kind ones.
const TRIBYTE_OPS: usize = 2;

#[derive(Debug, Clone, Copy)]
struct SearchState {
    raw: u16,
    kind: ImmediateKind,
    end: usize,
    ops_left: usize,
    parent: Option<usize>,
}

/// Kinds of the closed-world opcode classes that are all accounted for.
#[derive(Debug, Clone, Copy, Default)]
struct ClosedWorld {
    switch_done: bool,
    tribyte_done: bool,
}

impl ClosedWorld {
    fn update(&mut self, registry: &OpcodeRegistry) -> Result<()> {
        let count = |kind| registry.iter().filter(|i| i.kind == Some(kind)).count();
        let switches = count(ImmediateKind::Switch);
        let tribytes = count(ImmediateKind::Tribyte);
        if switches > SWITCH_OPS || tribytes > TRIBYTE_OPS {
            return Err(CoreError::Calibration(format!(
                "found {switches} switch and {tribytes} tribyte opcodes, expected {SWITCH_OPS} and {TRIBYTE_OPS}"
            )));
        }
        if !self.switch_done && switches == SWITCH_OPS {
            info!("all switch opcodes found");
            self.switch_done = true;
        }
        if !self.tribyte_done && tribytes == TRIBYTE_OPS {
            info!("all tribyte opcodes found");
            self.tribyte_done = true;
        }
        Ok(())
    }

    fn excludes(&self, kind: ImmediateKind) -> bool {
        match kind {
            ImmediateKind::Switch => self.switch_done,
            ImmediateKind::Tribyte => self.tribyte_done,
            _ => false,
        }
    }
}

/// States of one search. Solutions of a chained search keep pointing into
/// the same arena, so it lives as long as the chain.
struct Search<'a> {
    registry: &'a OpcodeRegistry,
    closed: ClosedWorld,
    max_states: usize,
    states: Vec<SearchState>,
}

impl<'a> Search<'a> {
    fn new(registry: &'a OpcodeRegistry, closed: ClosedWorld, max_states: usize) -> Self {
        Self {
            registry,
            closed,
            max_states,
            states: Vec::new(),
        }
    }

    /// Kind this path already committed `raw` to, if any.
    fn theory(&self, mut node: Option<usize>, raw: u16) -> Option<ImmediateKind> {
        while let Some(i) = node {
            let state = &self.states[i];
            if state.raw == raw {
                return Some(state.kind);
            }
            node = state.parent;
        }
        None
    }

    fn expand(&mut self, code: &[u8], offset: usize, parent: Option<usize>, ops_left: usize, out: &mut Vec<usize>) {
        let (Some(&hi), Some(&lo)) = (code.get(offset), code.get(offset + 1)) else {
            return;
        };
        let raw = u16::from_be_bytes([hi, lo]);
        // raw opcode 0 does not occur in scrambled builds and rules out
        // most misaligned reads
        if raw == 0 {
            return;
        }
        let known = self.registry.by_raw(raw);
        let options: Vec<ImmediateKind> = match self.theory(parent, raw) {
            Some(kind) => vec![kind],
            None => match known {
                Some(info) => info.possible_kinds.clone(),
                None => ImmediateKind::DETECTABLE.to_vec(),
            },
        };
        let unsettled = known.map_or(true, |i| i.kind.is_none());
        for kind in options {
            if unsettled && self.closed.excludes(kind) {
                continue;
            }
            let Some((_, _, end)) = try_read_immediate(code, offset + 2, kind) else {
                continue;
            };
            self.states.push(SearchState {
                raw,
                kind,
                end,
                ops_left,
                parent,
            });
            out.push(self.states.len() - 1);
        }
    }

    /// All readings of `cand`, continuing each of `chained`. `None` when
    /// the search had to give up.
    fn run(&mut self, cand: &Candidate, chained: &[Option<usize>]) -> Option<Vec<usize>> {
        let code = cand.code();
        let count = cand.instruction_count();
        let mut solutions = Vec::new();
        if count == 0 {
            return Some(solutions);
        }
        let mut frontier = Vec::new();
        for &prev in chained {
            self.expand(code, 0, prev, count - 1, &mut frontier);
        }
        while !frontier.is_empty() {
            if frontier.len() > self.max_states {
                debug!(script = cand.id, states = frontier.len(), "immediate search bailed");
                return None;
            }
            let mut next = Vec::new();
            for i in frontier {
                let state = self.states[i];
                if state.ops_left == 0 {
                    if state.end == code.len() {
                        solutions.push(i);
                    }
                } else {
                    self.expand(code, state.end, Some(i), state.ops_left - 1, &mut next);
                }
            }
            frontier = next;
        }
        Some(solutions)
    }

    /// Per position, the raw opcode all solutions agree on and the kinds
    /// they read it with. Walks from the last instruction backwards.
    fn agreement(&self, solutions: &[usize]) -> Vec<(u16, Vec<ImmediateKind>)> {
        let mut res = Vec::new();
        let mut row: Vec<usize> = solutions.to_vec();
        while let Some(&first) = row.first() {
            let raw = self.states[first].raw;
            let mut kinds = Vec::new();
            let mut agreed = true;
            let mut next = Vec::with_capacity(row.len());
            for &i in &row {
                let state = &self.states[i];
                if state.raw == raw {
                    if !kinds.contains(&state.kind) {
                        kinds.push(state.kind);
                    }
                } else {
                    agreed = false;
                }
                if let Some(p) = state.parent {
                    next.push(p);
                }
            }
            if agreed {
                res.push((raw, kinds));
            }
            row = next;
        }
        res
    }
}

/// Narrow opcode kinds using the agreed positions of `solutions`. With a
/// candidate, its unknowns and solution count are refreshed. Returns how
/// many candidate kinds were ruled out.
fn evaluate(
    registry: &mut OpcodeRegistry,
    agreed: Option<Vec<(u16, Vec<ImmediateKind>)>>,
    solution_count: usize,
    mut cand: Option<&mut Candidate>,
) -> Result<usize> {
    let mut info_count = 0;
    if let Some(agreed) = agreed {
        if let Some(c) = cand.as_deref_mut() {
            c.unknowns.clear();
        }
        for (raw, kinds) in agreed {
            let id = match registry.by_raw(raw) {
                Some(info) => info.id,
                None => registry.declare_op(raw, &ImmediateKind::DETECTABLE)?,
            };
            let Some(info) = registry.get_mut(id) else {
                continue;
            };
            info_count += info.retain_kinds(&kinds);
            if info.kind.is_none() {
                if let Some(c) = cand.as_deref_mut() {
                    if !c.unknowns.contains(&id) {
                        c.unknowns.push(id);
                    }
                }
            }
        }
    }
    if let Some(c) = cand {
        c.solution_count = solution_count;
    }
    Ok(info_count)
}

/// Run the escalating immediate-kind search over all candidates.
pub fn find_immediates(
    registry: &mut OpcodeRegistry,
    candidates: &mut BTreeMap<u32, Candidate>,
    config: &CalibrationConfig,
) -> Result<()> {
    let mut order: Vec<u32> = candidates.keys().copied().collect();
    order.sort_by_key(|id| {
        let c = &candidates[id];
        (c.instruction_count(), c.code().len())
    });
    let mut closed = ClosedWorld::default();

    for (round, &limit) in config.escalation.iter().enumerate() {
        for id in &order {
            let Some(cand) = candidates.get(id) else {
                continue;
            };
            if cand.solution_count == 1 {
                continue;
            }
            if limit.is_some_and(|l| cand.instruction_count() > l) {
                break;
            }
            closed.update(registry)?;

            let outcome = {
                let mut search = Search::new(registry, closed, config.max_search_states);
                search.run(cand, &[None]).map(|solutions| {
                    let agreed = (solutions.len() <= config.max_solutions).then(|| search.agreement(&solutions));
                    (agreed, solutions.len())
                })
            };
            if let Some((agreed, count)) = outcome {
                evaluate(registry, agreed, count, candidates.get_mut(id))?;
            }
        }

        run_chains(registry, candidates, closed, config)?;
        let unsettled = registry.iter().filter(|i| i.kind.is_none()).count();
        info!(round, ?limit, mappings = registry.len(), unsettled, "immediate search");
    }
    Ok(())
}

/// Search candidates that share their first unknown opcode together.
fn run_chains(
    registry: &mut OpcodeRegistry,
    candidates: &BTreeMap<u32, Candidate>,
    closed: ClosedWorld,
    config: &CalibrationConfig,
) -> Result<()> {
    let mut combinable: Vec<&Candidate> = candidates.values().filter(|c| !c.unknowns.is_empty()).collect();
    combinable.sort_by_key(|c| (c.unknowns.len(), c.unknowns[0]));

    let mut groups: Vec<Vec<&Candidate>> = Vec::new();
    for cand in combinable {
        match groups.last_mut() {
            Some(group) if group[0].unknowns[0] == cand.unknowns[0] => group.push(cand),
            _ => groups.push(vec![cand]),
        }
    }

    for group in groups {
        let agreed = {
            let mut search = Search::new(registry, closed, config.max_search_states);
            let mut solutions: Option<Vec<usize>> = None;
            let mut bailed = false;
            for cand in &group {
                let chained: Vec<Option<usize>> = match &solutions {
                    Some(prev) => prev.iter().copied().map(Some).collect(),
                    None => vec![None],
                };
                match search.run(cand, &chained) {
                    Some(res) => solutions = Some(res),
                    None => {
                        bailed = true;
                        break;
                    }
                }
            }
            match solutions {
                Some(sols) if !bailed && sols.len() <= config.max_solutions => Some(search.agreement(&sols)),
                _ => None,
            }
        };
        if agreed.is_some() {
            evaluate(registry, agreed, 0, None)?;
        }
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::ops::named::{PUSHCONST, RETURN};
    use crate::ops::{ClientScript, OpcodeInfo, Operation};
    use cs2script::{BuildNumber, Payload, ScriptHeader};

    const RAW_PUSH: u16 = 0x0a01;
    const RAW_RETURN: u16 = 0x0b02;
    const RAW_NEW: u16 = 0x0c03;

    fn known() -> OpcodeRegistry {
        let mut reg = OpcodeRegistry::new(BuildNumber(950));
        reg.insert(OpcodeInfo::new(RAW_PUSH, PUSHCONST, &[ImmediateKind::Switch]));
        reg.insert(OpcodeInfo::new(RAW_RETURN, RETURN, &[ImmediateKind::Byte]));
        reg
    }

    /// `pushconst 7; <new op> imm; return` with the new op encoded as `kind`.
    fn candidate(kind: ImmediateKind, imm: i32) -> Candidate {
        let mut reg = known();
        reg.insert(OpcodeInfo::new(RAW_NEW, 30000, &[kind]));
        let bytes = reg
            .encode(&ClientScript {
                header: ScriptHeader::default(),
                ops: vec![
                    Operation::push_int(7),
                    Operation {
                        opcode: 30000,
                        imm,
                        payload: Payload::None,
                    },
                    Operation::new(RETURN, 0),
                ],
            })
            .unwrap();
        Candidate::parse(1, bytes).unwrap()
    }

    #[test]
    fn unique_reading_settles_the_kind() {
        let mut reg = known();
        let mut cands = BTreeMap::from([(1, candidate(ImmediateKind::Int, 5))]);
        find_immediates(&mut reg, &mut cands, &CalibrationConfig::default()).unwrap();
        let info = reg.by_raw(RAW_NEW).unwrap();
        assert_eq!(info.kind, Some(ImmediateKind::Int));
        assert!(info.id >= crate::ops::named::FIRST_GENERATED_ID);
        assert_eq!(cands[&1].solution_count, 1);
        assert!(cands[&1].unknowns.is_empty());
    }

    #[test]
    fn ambiguous_reading_only_narrows() {
        let reg = known();
        // a large int immediate can also be read as a byte followed by an
        // unknown int-immediate op
        let cand = candidate(ImmediateKind::Int, 0x0102_0304);
        let mut search = Search::new(&reg, ClosedWorld::default(), 1000);
        let solutions = search.run(&cand, &[None]).unwrap();
        assert!(solutions.len() > 1);
        let agreed = search.agreement(&solutions);
        let new = agreed.iter().find(|(raw, _)| *raw == RAW_NEW).unwrap();
        assert!(new.1.contains(&ImmediateKind::Int));
        assert!(new.1.contains(&ImmediateKind::Byte));
    }

    #[test]
    fn closed_world_rejects_a_second_switch() {
        let mut reg = known();
        reg.insert(OpcodeInfo::new(0x0d04, 30001, &[ImmediateKind::Switch]));
        let mut closed = ClosedWorld::default();
        assert!(matches!(closed.update(&reg), Err(CoreError::Calibration(_))));

        let reg = known();
        closed.update(&reg).unwrap();
        assert!(closed.excludes(ImmediateKind::Switch));
        assert!(!closed.excludes(ImmediateKind::Tribyte));
    }

    #[test]
    fn search_gives_up_on_too_many_states() {
        let reg = OpcodeRegistry::new(BuildNumber(950));
        let cand = candidate(ImmediateKind::Int, 0x0101_0101);
        let mut search = Search::new(&reg, ClosedWorld::default(), 1);
        assert!(search.run(&cand, &[None]).is_none());
    }
}
