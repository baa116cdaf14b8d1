//! Cross-build candidate matching.
//!
//! Script ids are stable across builds and most scripts do not change
//! between two nearby builds, so a target script with the same id and
//! instruction count as a reference script is walked byte-wise with the
//! reference's immediate kinds. When the whole stream is consumed and every
//! operation agrees, each raw opcode of the target script is confirmed.

use std::collections::BTreeMap;

use cs2script::immediate::try_read_immediate;
use cs2script::ImmediateKind;
use tracing::{debug, info};

use super::{Candidate, ReferenceDump};
use crate::config::{CalibrationConfig, ImmediateTolerance};
use crate::ops::named::OpId;
use crate::ops::translate::{is_op_equal, translate_ops};
use crate::ops::{OpcodeInfo, OpcodeRegistry, Operation};

/// One raw opcode confirmed by a matching script.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Confirmed {
    pub raw: u16,
    pub id: OpId,
    pub kind: ImmediateKind,
}

/// Walk `code` using the immediate kinds of `reference`. Returns the raw
/// opcodes it confirms, or `None` when the script does not match.
pub fn test_candidate(
    cand: &Candidate,
    reference: &[Operation],
    dump: &ReferenceDump,
    tolerance: &ImmediateTolerance,
) -> Option<Vec<Confirmed>> {
    if cand.instruction_count() != reference.len() {
        return None;
    }
    let code = cand.code();
    let mut offset = 0;
    let mut found = Vec::with_capacity(reference.len());
    for refop in reference {
        let kind = dump.kind_of(refop.opcode);
        let raw = u16::from_be_bytes([*code.get(offset)?, *code.get(offset + 1)?]);
        let (imm, payload, end) = try_read_immediate(code, offset + 2, kind)?;
        offset = end;
        let op = Operation {
            opcode: refop.opcode,
            imm,
            payload,
        };
        if !is_op_equal(&op, refop, tolerance) {
            return None;
        }
        found.push(Confirmed {
            raw,
            id: refop.opcode,
            kind,
        });
    }
    (offset == code.len()).then_some(found)
}

/// Mapping that `confirmed` contradicts, if any: a raw opcode already bound
/// to another id, or an id already bound to another raw opcode.
fn find_conflict(registry: &OpcodeRegistry, confirmed: &[Confirmed]) -> Option<String> {
    let mut raws: BTreeMap<u16, OpId> = BTreeMap::new();
    let mut ids: BTreeMap<OpId, u16> = BTreeMap::new();
    for c in confirmed {
        if let Some(existing) = registry.by_raw(c.raw).filter(|i| i.id != c.id) {
            return Some(format!("raw {:#x} is {} not {}", c.raw, existing.id, c.id));
        }
        if let Some(existing) = registry.get(c.id).filter(|i| i.raw_id != c.raw) {
            return Some(format!("op {} is raw {:#x} not {:#x}", c.id, existing.raw_id, c.raw));
        }
        if *raws.entry(c.raw).or_insert(c.id) != c.id || *ids.entry(c.id).or_insert(c.raw) != c.raw {
            return Some(format!("raw {:#x} and op {} are used inconsistently", c.raw, c.id));
        }
    }
    None
}

/// Confirm mappings from every candidate matching its reference script.
/// Returns the number of new mappings.
pub fn match_candidates(
    registry: &mut OpcodeRegistry,
    candidates: &mut BTreeMap<u32, Candidate>,
    dump: &ReferenceDump,
    config: &CalibrationConfig,
) -> usize {
    let translated: Vec<(u32, Vec<Operation>)> = dump
        .scripts
        .iter()
        .map(|s| (s.id, translate_ops(&s.ops, dump.build, registry.build)))
        .collect();

    let start = registry.len();
    let mut passes = 0;
    for pass in 0..config.match_iterations {
        passes = pass + 1;
        let before = registry.len();
        for (id, ops) in &translated {
            let Some(cand) = candidates.get_mut(id) else {
                continue;
            };
            if cand.matched {
                continue;
            }
            let Some(confirmed) = test_candidate(cand, ops, dump, &config.tolerance) else {
                continue;
            };
            if let Some(conflict) = find_conflict(registry, &confirmed) {
                debug!(script = id, %conflict, "rejecting matching candidate");
                continue;
            }
            cand.matched = true;
            for c in confirmed {
                if registry.by_raw(c.raw).is_none() {
                    registry.insert(OpcodeInfo::new(c.raw, c.id, &[c.kind]));
                }
            }
        }
        let found = registry.len() - before;
        info!(pass, found, "candidate matching");
        if found == 0 {
            break;
        }
    }
    let matched = candidates.values().filter(|c| c.matched).count();
    info!(passes, matched, mappings = registry.len(), "candidate matching done");
    registry.len() - start
}
