//! Cache-wide subtype inference.
//!
//! Every value slot that crosses an operation boundary gets a [`DepKey`]:
//! the n-th int input of an opcode, the m-th string return of a script, a
//! local variable of a script. Tracing the stack of each basic block links
//! the key that produced a value with the key that consumed it. Keys with
//! a known subtype are then propagated through the links; two different
//! subtypes meeting in one component is a hard error.

use std::collections::{BTreeMap, BTreeSet};

use serde::{Deserialize, Serialize};
use tracing::{debug, info, warn};

use crate::annotate::annotate_block;
use crate::cfg::Cfg;
use crate::error::{CoreError, Result};
use crate::ops::named::{
    self, OpId, CC_SETPARAM, DB_FIND_WITH_COUNT, ENUM_GETREVERSECOUNT, ENUM_GETREVERSEINDEX,
    ENUM_GETSTRING, ENUM_HASOUTPUT, GOSUB, LC_GETPARAM, POPDISCARDINT, POP_ARRAY, PUSH_ARRAY,
    RETURN, SWITCH,
};
use crate::ops::{ClientScript, OpcodeRegistry, Operation};
use crate::stack::{ExactStack, PrimitiveType, StackInOut, StackSlot};
use crate::subtypes::Subtype;

#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum KeyRole {
    /// A fixed subtype; `index` holds the subtype id.
    Known,
    OpIn,
    OpOut,
    /// Arguments and locals of a script share one slot numbering.
    ScriptArg,
    ScriptRet,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub struct DepKey {
    pub role: KeyRole,
    pub prim: PrimitiveType,
    /// Opcode or script id.
    pub group: u32,
    pub index: u32,
}

impl DepKey {
    pub fn known(subtype: Subtype) -> Self {
        Self {
            role: KeyRole::Known,
            prim: subtype.primitive(),
            group: 0,
            index: subtype.0 as u32,
        }
    }

    pub fn new(role: KeyRole, group: u32, prim: PrimitiveType, index: u32) -> Self {
        Self {
            role,
            prim,
            group,
            index,
        }
    }
}

impl std::fmt::Display for DepKey {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self.role {
            KeyRole::Known => write!(f, "known type {} {}", self.index, Subtype(self.index as u16).name()),
            KeyRole::OpIn => write!(
                f,
                "opin {} {} {} {}",
                self.group,
                named::display_name(self.group),
                self.index,
                self.prim
            ),
            KeyRole::OpOut => write!(
                f,
                "opout {} {} {} {}",
                self.group,
                named::display_name(self.group),
                self.index,
                self.prim
            ),
            KeyRole::ScriptArg => write!(f, "script {} arg/local {} {}", self.group, self.index, self.prim),
            KeyRole::ScriptRet => write!(f, "script {} return {} {}", self.group, self.index, self.prim),
        }
    }
}

/// Keys whose values legitimately mix subtypes and are never linked.
fn loose_keys() -> BTreeSet<DepKey> {
    use KeyRole::{OpIn, OpOut};
    use PrimitiveType::{Int, Long};
    let mut keys: BTreeSet<DepKey> = [
        (OpIn, ENUM_HASOUTPUT, 2),
        (OpOut, ENUM_GETREVERSEINDEX, 0),
        (OpIn, ENUM_GETREVERSEINDEX, 3),
        (OpIn, ENUM_GETREVERSECOUNT, 2),
        (OpIn, ENUM_GETSTRING, 1),
        (OpIn, POPDISCARDINT, 0),
        (OpOut, LC_GETPARAM, 0),
        (OpIn, CC_SETPARAM, 1),
        (OpIn, DB_FIND_WITH_COUNT, 1),
        (OpIn, POP_ARRAY, 1),
        (OpOut, PUSH_ARRAY, 0),
        (OpIn, SWITCH, 0),
    ]
    .into_iter()
    .map(|(role, op, index)| DepKey::new(role, op, Int, index))
    .collect();
    keys.extend(
        [Subtype::UNKNOWN_INT, Subtype::UNKNOWN_LONG, Subtype::UNKNOWN_STRING].map(DepKey::known),
    );
    for op in named::BRANCH_INT {
        keys.extend([0, 1].map(|i| DepKey::new(OpIn, op, Int, i)));
    }
    for op in named::BRANCH_LONG {
        keys.extend([0, 1].map(|i| DepKey::new(OpIn, op, Long, i)));
    }
    keys
}

#[derive(Debug, Clone)]
pub struct SubtypeSolver {
    links: BTreeMap<DepKey, BTreeSet<DepKey>>,
    pub known: BTreeMap<DepKey, Subtype>,
    loose: BTreeSet<DepKey>,
}

impl Default for SubtypeSolver {
    fn default() -> Self {
        Self::new()
    }
}

impl SubtypeSolver {
    pub fn new() -> Self {
        let known = Subtype::all_known().map(|t| (DepKey::known(t), t)).collect();
        Self {
            links: BTreeMap::new(),
            known,
            loose: loose_keys(),
        }
    }

    pub fn link_count(&self) -> usize {
        self.links.values().map(BTreeSet::len).sum::<usize>() / 2
    }

    /// Declare that `key` and `other` carry the same value.
    pub fn entangle(&mut self, key: DepKey, other: Option<DepKey>) {
        let Some(other) = other else {
            return;
        };
        if key == other || self.loose.contains(&key) || self.loose.contains(&other) {
            return;
        }
        if key.role == KeyRole::Known && other.role == KeyRole::Known {
            debug!(%key, %other, "linking two fixed subtypes");
        }
        self.links.entry(key).or_default().insert(other);
        self.links.entry(other).or_default().insert(key);
    }

    /// Trace one straight-line block of script `script_id`. Stops at the
    /// first operation whose stack effect isn't known.
    pub fn trace_block(&mut self, script_id: u32, ops: &[Operation], registry: &OpcodeRegistry) {
        let annotation = annotate_block(script_id, ops, registry);
        let mut stack = TraceStack::default();
        for (i, op) in ops.iter().enumerate() {
            let known = annotation.known[i].as_ref();
            let io = match known.or_else(|| registry.stack_of(op.opcode)) {
                Some(io) => io,
                None => break,
            };
            if known.is_none() && named::is_dynamic(op.opcode) {
                break;
            }
            if !self.trace_op(&mut stack, script_id, op, io, known.is_some()) {
                break;
            }
        }
    }

    fn trace_op(
        &mut self,
        stack: &mut TraceStack,
        script_id: u32,
        op: &Operation,
        io: &StackInOut,
        annotated: bool,
    ) -> bool {
        // locals use their slot number, everything else its stack position
        let local = named::local_primitive(op.opcode)
            .filter(|_| named::is_local_op(op.opcode))
            .and_then(|t| t.primitive());
        let (env_in, env_out) = match op.opcode {
            _ if local.is_some() => (KeyRole::ScriptArg, KeyRole::ScriptArg),
            GOSUB => (KeyRole::ScriptArg, KeyRole::ScriptRet),
            RETURN => (KeyRole::ScriptRet, KeyRole::ScriptRet),
            _ => (KeyRole::OpIn, KeyRole::OpOut),
        };
        let group = match op.opcode {
            _ if local.is_some() => script_id,
            GOSUB => op.imm as u32,
            RETURN => script_id,
            o => o,
        };
        let key = |role: KeyRole, prim: PrimitiveType, index: u32| match local {
            Some(p) => DepKey::new(role, group, p, op.imm as u32),
            None => DepKey::new(role, group, prim, index),
        };

        match io.exact_in.as_ref().filter(|_| annotated) {
            Some(exact) => {
                for prim in PrimitiveType::ALL {
                    for &t in exact.get(prim).iter().rev() {
                        let popped = stack.get_mut(prim).pop();
                        self.entangle(DepKey::known(t), popped);
                    }
                }
            }
            None => {
                let mut counts = io.input.to_diff();
                for slot in io.input.values.iter().rev() {
                    let mut take = |solver: &mut Self, prim: PrimitiveType, counts: &mut crate::stack::StackDiff| {
                        let n = counts.prim(prim) - 1;
                        counts.set(prim.into(), n);
                        let popped = stack.get_mut(prim).pop();
                        solver.entangle(key(env_in, prim, n.max(0) as u32), popped);
                    };
                    match slot {
                        StackSlot::Vararg => return false,
                        StackSlot::Diff(d) => {
                            for prim in PrimitiveType::ALL {
                                for _ in 0..d.prim(prim).max(0) {
                                    take(self, prim, &mut counts);
                                }
                            }
                        }
                        s => {
                            if let Some(prim) = s.stack_type().and_then(|t| t.primitive()) {
                                take(self, prim, &mut counts);
                            }
                        }
                    }
                }
            }
        }

        match io.exact_out.as_ref().filter(|_| annotated) {
            Some(exact) => {
                for prim in PrimitiveType::ALL {
                    for &t in exact.get(prim) {
                        stack.get_mut(prim).push(DepKey::known(t));
                    }
                }
            }
            None => {
                let out = io.output.to_diff();
                if out.vararg != 0 || !out.is_non_negative() {
                    return false;
                }
                for prim in PrimitiveType::ALL {
                    for i in 0..out.prim(prim) {
                        stack.get_mut(prim).push(key(env_out, prim, i as u32));
                    }
                }
            }
        }
        true
    }

    /// Seed fixed subtypes from exact stacks already in the registry.
    /// `unknown_*` entries are not evidence and are skipped.
    pub fn add_known_from_registry(&mut self, registry: &OpcodeRegistry) {
        let mut found = Vec::new();
        for &key in self.links.keys() {
            let io = match key.role {
                KeyRole::Known => continue,
                KeyRole::OpIn | KeyRole::OpOut => registry.get(key.group as OpId).map(|i| &i.stack),
                KeyRole::ScriptArg | KeyRole::ScriptRet => registry.scripts.get(&key.group),
            };
            let exact = io.and_then(|io| match key.role {
                KeyRole::OpIn | KeyRole::ScriptArg => io.exact_in.as_ref(),
                _ => io.exact_out.as_ref(),
            });
            if let Some(&t) = exact.and_then(|e| e.get(key.prim).get(key.index as usize)) {
                if t != Subtype::unknown(key.prim) {
                    found.push((key, t));
                }
            }
        }
        self.known.extend(found);
    }

    /// Propagate known subtypes breadth first through the links.
    pub fn solve(&mut self) -> Result<()> {
        let mut active: BTreeSet<DepKey> = self.known.keys().copied().collect();
        let mut iteration = 0;
        while !active.is_empty() {
            iteration += 1;
            debug!(iteration, known = self.known.len(), active = active.len(), "subtype pass");
            let mut next = BTreeSet::new();
            for key in active {
                let Some(links) = self.links.get(&key) else {
                    continue;
                };
                let Some(&known) = self.known.get(&key) else {
                    continue;
                };
                for &link in links {
                    match self.known.get(&link) {
                        None => {
                            self.known.insert(link, known);
                            next.insert(link);
                        }
                        Some(&prev) if prev != known => {
                            return Err(CoreError::SubtypeConflict {
                                old: prev.name(),
                                new: known.name(),
                                key: key.to_string(),
                                link: link.to_string(),
                            });
                        }
                        Some(_) => {}
                    }
                }
            }
            active = next;
        }
        info!(iterations = iteration, known = self.known.len(), "subtypes solved");
        Ok(())
    }

    fn exact_for(&self, role: KeyRole, group: u32, io: &crate::stack::StackList) -> ExactStack {
        let counts = io.to_diff();
        let mut exact = ExactStack::default();
        for prim in PrimitiveType::ALL {
            for i in 0..counts.prim(prim).max(0) {
                let key = DepKey::new(role, group, prim, i as u32);
                let t = self.known.get(&key).copied().unwrap_or(Subtype::unknown(prim));
                exact.get_mut(prim).push(t);
            }
        }
        exact
    }

    /// Write solved exact stacks into the registry, `unknown_*` where
    /// nothing was learned.
    pub fn assign_known_types(&self, registry: &mut OpcodeRegistry) {
        let ids: Vec<OpId> = registry.iter().map(|i| i.id).collect();
        for id in ids {
            let Some(info) = registry.get(id) else {
                continue;
            };
            if !info.stack.initialized_through {
                continue;
            }
            let exact_in = self.exact_for(KeyRole::OpIn, id, &info.stack.input);
            let exact_out = self.exact_for(KeyRole::OpOut, id, &info.stack.output);
            if let Some(info) = registry.get_mut(id) {
                info.stack.exact_in = Some(exact_in);
                info.stack.exact_out = Some(exact_out);
            }
        }
        let scripts: Vec<u32> = registry.scripts.keys().copied().collect();
        for id in scripts {
            let Some(sig) = registry.scripts.get(&id) else {
                continue;
            };
            let exact_in = self.exact_for(KeyRole::ScriptArg, id, &sig.input);
            let exact_out = self.exact_for(KeyRole::ScriptRet, id, &sig.output);
            if let Some(sig) = registry.scripts.get_mut(&id) {
                sig.exact_in = Some(exact_in);
                sig.exact_out = Some(exact_out);
            }
        }
    }
}

/// Producer keys currently on each VM stack.
#[derive(Debug, Default)]
struct TraceStack {
    int: Vec<DepKey>,
    long: Vec<DepKey>,
    string: Vec<DepKey>,
}

impl TraceStack {
    fn get_mut(&mut self, p: PrimitiveType) -> &mut Vec<DepKey> {
        match p {
            PrimitiveType::Int => &mut self.int,
            PrimitiveType::Long => &mut self.long,
            PrimitiveType::String => &mut self.string,
        }
    }
}

/// Run subtype detection over a set of scripts and store the result in
/// the registry.
pub fn detect_subtypes<'a>(
    registry: &mut OpcodeRegistry,
    scripts: impl IntoIterator<Item = (u32, &'a ClientScript)>,
) -> Result<SubtypeSolver> {
    let mut solver = SubtypeSolver::new();
    for (id, script) in scripts {
        let cfg = match Cfg::build(script) {
            Ok(cfg) => cfg,
            Err(e) => {
                warn!(script = id, error = %e, "skipping script in subtype detection");
                continue;
            }
        };
        for (_, block) in cfg.blocks.iter() {
            solver.trace_block(id, &script.ops[block.start..block.end], registry);
        }
    }
    debug!(links = solver.link_count(), "traced scripts");
    solver.add_known_from_registry(registry);
    solver.solve()?;
    solver.assign_known_types(registry);
    Ok(solver)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::ops::named::{POPLOCALINT, PUSHLOCALINT};
    use crate::ops::OpcodeInfo;
    use crate::stack::StackType;
    use cs2script::{BuildNumber, ImmediateKind, ScriptHeader, SlotCounts};

    const A: OpId = 20000;
    const B: OpId = 20001;
    const X: OpId = 20002;

    fn registry() -> OpcodeRegistry {
        let mut reg = OpcodeRegistry::new(BuildNumber(900));
        for (raw, id) in [(0x200, A), (0x201, B), (0x202, X)] {
            reg.insert(OpcodeInfo::new(raw, id, &[ImmediateKind::Byte]));
        }
        reg.insert(OpcodeInfo::new(0x21, PUSHLOCALINT, &[ImmediateKind::Int]));
        reg.insert(OpcodeInfo::new(0x22, POPLOCALINT, &[ImmediateKind::Int]));
        reg.get_mut(A).unwrap().stack = StackInOut::from_exact(&[], &[Subtype::COMPONENT]);
        reg.get_mut(B).unwrap().stack = StackInOut::from_exact(&[], &[Subtype::NPC]);
        reg.get_mut(X).unwrap().stack = StackInOut::of(&[StackType::Int], &[]);
        reg
    }

    fn script(ops: Vec<Operation>, args: u16) -> ClientScript {
        ClientScript {
            header: ScriptHeader {
                args: SlotCounts { int: args, long: 0, string: 0 },
                locals: SlotCounts { int: 1, long: 0, string: 0 },
                ..Default::default()
            },
            ops,
        }
    }

    #[test]
    fn types_flow_through_locals_and_arguments() {
        let mut reg = registry();
        reg.scripts.insert(2, StackInOut::of(&[StackType::Int], &[]));
        let one = script(
            vec![
                Operation::new(A, 0),
                Operation::new(POPLOCALINT, 0),
                Operation::new(PUSHLOCALINT, 0),
                Operation::new(X, 0),
            ],
            0,
        );
        let two = script(vec![Operation::new(PUSHLOCALINT, 0), Operation::new(X, 0)], 1);
        detect_subtypes(&mut reg, [(1, &one), (2, &two)]).unwrap();

        let x_in = reg.get(X).unwrap().stack.exact_in.clone().unwrap();
        assert_eq!(x_in.int, [Subtype::COMPONENT]);
        let sig = reg.scripts[&2].exact_in.clone().unwrap();
        assert_eq!(sig.int, [Subtype::COMPONENT]);
    }

    #[test]
    fn conflicting_producers_are_an_error() {
        let mut reg = registry();
        let one = script(vec![Operation::new(A, 0), Operation::new(X, 0)], 0);
        let two = script(vec![Operation::new(B, 0), Operation::new(X, 0)], 0);
        let err = detect_subtypes(&mut reg, [(1, &one), (2, &two)]).unwrap_err();
        let CoreError::SubtypeConflict { old, new, .. } = err else {
            panic!("expected a conflict, got {err}");
        };
        let mut pair = [old, new];
        pair.sort();
        assert_eq!(pair, ["component".to_string(), "npc".to_string()]);
    }

    #[test]
    fn loose_keys_never_link() {
        let mut solver = SubtypeSolver::new();
        let a = DepKey::new(KeyRole::OpOut, A, PrimitiveType::Int, 0);
        solver.entangle(DepKey::new(KeyRole::OpIn, SWITCH, PrimitiveType::Int, 0), Some(a));
        solver.entangle(DepKey::known(Subtype::UNKNOWN_INT), Some(a));
        solver.entangle(a, None);
        assert_eq!(solver.link_count(), 0);
        assert_eq!(a.to_string(), "opout 20000 unk_20000 0 int");
    }
}
