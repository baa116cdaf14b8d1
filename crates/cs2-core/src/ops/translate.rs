//! Bridging operations between cache builds for cross-build matching.

use cs2script::{BuildNumber, Payload};

use super::named::{PUSHCONST, PUSHINT, PUSHLONG, PUSHSTRING, PUSHVAR, POPVAR};
use super::Operation;
use crate::config::ImmediateTolerance;

/// Rewrite operations of build `from` into the shape build `to` would use.
///
/// The only known breaking change is the unified `pushconst` and the
/// packed variable reference of `pushvar`/`popvar`, both introduced by 751.
pub fn translate_ops(ops: &[Operation], from: BuildNumber, to: BuildNumber) -> Vec<Operation> {
    if from.has_unified_push_const() || !to.has_unified_push_const() {
        return ops.to_vec();
    }
    ops.iter()
        .map(|op| match op.opcode {
            PUSHINT => Operation::push_int(op.imm),
            PUSHLONG => Operation {
                opcode: PUSHCONST,
                imm: 1,
                payload: op.payload.clone(),
            },
            PUSHSTRING => Operation {
                opcode: PUSHCONST,
                imm: 2,
                payload: op.payload.clone(),
            },
            PUSHVAR | POPVAR => Operation {
                opcode: op.opcode,
                imm: (2 << 24) | (op.imm << 8),
                payload: op.payload.clone(),
            },
            _ => op.clone(),
        })
        .collect()
}

/// Normalize the legacy constant pushes sharing canonical id 3 so their
/// value sits where a comparison expects it.
pub fn canonical_op(op: &Operation) -> Operation {
    if op.opcode != PUSHSTRING {
        return op.clone();
    }
    match &op.payload {
        Payload::Int(v) => Operation::new(PUSHINT, *v),
        Payload::String(_) => Operation {
            imm: 0,
            ..op.clone()
        },
        Payload::Long(_) => Operation {
            opcode: PUSHLONG,
            imm: 0,
            payload: op.payload.clone(),
        },
        Payload::None => op.clone(),
    }
}

/// Whether two operations of different builds are plausibly the same
/// instruction. Numbers may drift within `tolerance`; strings and longs
/// may differ freely as long as the payload shape agrees.
pub fn is_op_equal(a: &Operation, b: &Operation, tolerance: &ImmediateTolerance) -> bool {
    let a = canonical_op(a);
    let b = canonical_op(b);
    if a.opcode != b.opcode {
        return false;
    }
    if !tolerance.matches(a.imm as i64, b.imm as i64) {
        return false;
    }
    match (&a.payload, &b.payload) {
        (Payload::None, Payload::None) => true,
        (Payload::Int(x), Payload::Int(y)) => tolerance.matches(*x as i64, *y as i64),
        (Payload::Long(_), Payload::Long(_)) => true,
        (Payload::String(_), Payload::String(_)) => true,
        _ => false,
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    const OLD: BuildNumber = BuildNumber(700);
    const NEW: BuildNumber = BuildNumber(900);

    #[test]
    fn legacy_pushes_become_pushconst() {
        let ops = [
            Operation::new(PUSHINT, 7),
            Operation {
                opcode: PUSHSTRING,
                imm: 0,
                payload: Payload::String("abc".into()),
            },
            Operation::new(PUSHVAR, 0x1234),
        ];
        let out = translate_ops(&ops, OLD, NEW);
        assert_eq!(out[0], Operation::push_int(7));
        assert_eq!(out[1], Operation::push_string("abc"));
        assert_eq!(out[2].imm, (2 << 24) | (0x1234 << 8));

        assert_eq!(translate_ops(&ops, NEW, NEW), ops);
        assert_eq!(translate_ops(&ops, OLD, BuildNumber(740)), ops);
    }

    #[test]
    fn fuzzy_equality() {
        let t = ImmediateTolerance::default();
        assert!(is_op_equal(&Operation::push_int(1000), &Operation::push_int(1100), &t));
        assert!(!is_op_equal(&Operation::push_int(3), &Operation::push_int(4), &t));
        assert!(is_op_equal(&Operation::push_string("a"), &Operation::push_string("b"), &t));
        assert!(!is_op_equal(&Operation::push_string("a"), &Operation::push_int(0), &t));
        assert!(!is_op_equal(&Operation::new(40, 500), &Operation::new(41, 500), &t));
        assert!(!is_op_equal(&Operation::push_int(1000), &Operation::push_int(1100), &ImmediateTolerance::exact()));
    }

    #[test]
    fn canonical_legacy_int() {
        let op = Operation {
            opcode: PUSHSTRING,
            imm: 0,
            payload: Payload::Int(42),
        };
        assert_eq!(canonical_op(&op), Operation::new(PUSHINT, 42));
    }
}
