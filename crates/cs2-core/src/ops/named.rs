//! Canonical operation ids with a fixed meaning.
//!
//! Ids below 0x80 are the raw ids of unscrambled caches. The 9000 range
//! holds operations whose original id is unknown or that never exist in
//! bytecode. Everything else comes from calibration.

use cs2script::ImmediateKind;

use crate::stack::{StackInOut, StackType};

/// Canonical operation id.
pub type OpId = u32;

// only in caches before the unified pushconst
pub const PUSHINT: OpId = 0;
pub const PUSHLONG: OpId = 54;
pub const PUSHSTRING: OpId = 3;

pub const PUSHLOCALINT: OpId = 33;
pub const POPLOCALINT: OpId = 34;
pub const PUSHLOCALSTRING: OpId = 35;
pub const POPLOCALSTRING: OpId = 36;
pub const PUSHLOCALLONG: OpId = 10024;
pub const POPLOCALLONG: OpId = 10237;

pub const POPDISCARDINT: OpId = 10004;
pub const POPDISCARDLONG: OpId = 9104;
pub const POPDISCARDSTRING: OpId = 10360;

pub const JOINSTRING: OpId = 37;
pub const GOSUB: OpId = 40;

pub const PUSHVAR: OpId = 42;
pub const POPVAR: OpId = 43;
pub const PUSHVARBIT: OpId = 10022;
pub const POPVARBIT: OpId = 10023;

pub const JUMP: OpId = 6;
pub const BRANCH_NOT: OpId = 7;
pub const BRANCH_EQ: OpId = 8;
pub const BRANCH_LT: OpId = 9;
pub const BRANCH_GT: OpId = 10;
pub const BRANCH_LTEQ: OpId = 31;
pub const BRANCH_GTEQ: OpId = 32;
pub const BRANCH_EQ_LONG: OpId = 10153;
pub const BRANCH_NOT_LONG: OpId = 10449;
pub const BRANCH_LT_LONG: OpId = 10411;
pub const BRANCH_GT_LONG: OpId = 10321;
pub const BRANCH_LTEQ_LONG: OpId = 10491;
pub const BRANCH_GTEQ_LONG: OpId = 10349;
pub const SWITCH: OpId = 51;
pub const RETURN: OpId = 21;

pub const PUSHCONST: OpId = 9001;
pub const TRIBYTE1: OpId = 9002;
pub const TRIBYTE2: OpId = 9003;

// never present in bytecode
pub const SHORTING_OR: OpId = 9100;
pub const SHORTING_AND: OpId = 9101;

pub const PLUS: OpId = 4000;
pub const MINUS: OpId = 4001;
pub const INTMUL: OpId = 4002;
pub const INTDIV: OpId = 4003;
pub const STRCMP: OpId = 4107;
pub const STRCONCAT: OpId = 4101;
pub const INTTOSTRING: OpId = 10064;

pub const ENUM_GETVALUE: OpId = 3408;
pub const STRUCT_GETPARAM: OpId = 4500;
pub const ITEM_GETPARAM: OpId = 4208;
pub const QUEST_GETPARAM: OpId = 10262;
pub const NPC_GETPARAM: OpId = 10076;
pub const CC_GETPARAM: OpId = 10049;
pub const MEC_GETPARAM: OpId = 10192;
pub const DBROW_GETFIELD: OpId = 10094;
pub const DBROW_FINDNEXT: OpId = 10112;

pub const CC_SETPARAM: OpId = 10098;
pub const DB_FIND_WITH_COUNT: OpId = 10100;
pub const LC_GETPARAM: OpId = 10798;
pub const ENUM_GETSTRING: OpId = 10047;
pub const ENUM_GETREVERSEINDEX: OpId = 10154;
pub const ENUM_GETREVERSECOUNT: OpId = 10240;
pub const ENUM_HASOUTPUT: OpId = 10244;

pub const DEFINE_ARRAY: OpId = 10569;
pub const POP_ARRAY: OpId = 46;
pub const PUSH_ARRAY: OpId = 45;

pub const PRINTMESSAGE: OpId = 3100;

/// First id handed out to operations discovered by calibration.
pub const FIRST_GENERATED_ID: OpId = 10000;

pub static NAMED_OPS: &[(OpId, &str)] = &[
    (PUSHINT, "pushint"),
    (PUSHLONG, "pushlong"),
    (PUSHSTRING, "pushstring"),
    (PUSHLOCALINT, "pushlocalint"),
    (POPLOCALINT, "poplocalint"),
    (PUSHLOCALSTRING, "pushlocalstring"),
    (POPLOCALSTRING, "poplocalstring"),
    (PUSHLOCALLONG, "pushlocallong"),
    (POPLOCALLONG, "poplocallong"),
    (POPDISCARDINT, "popdiscardint"),
    (POPDISCARDLONG, "popdiscardlong"),
    (POPDISCARDSTRING, "popdiscardstring"),
    (JOINSTRING, "joinstring"),
    (GOSUB, "gosub"),
    (PUSHVAR, "pushvar"),
    (POPVAR, "popvar"),
    (PUSHVARBIT, "pushvarbit"),
    (POPVARBIT, "popvarbit"),
    (JUMP, "jump"),
    (BRANCH_NOT, "branch_not"),
    (BRANCH_EQ, "branch_eq"),
    (BRANCH_LT, "branch_lt"),
    (BRANCH_GT, "branch_gt"),
    (BRANCH_LTEQ, "branch_lteq"),
    (BRANCH_GTEQ, "branch_gteq"),
    (BRANCH_EQ_LONG, "branch_eq_long"),
    (BRANCH_NOT_LONG, "branch_not_long"),
    (BRANCH_LT_LONG, "branch_lt_long"),
    (BRANCH_GT_LONG, "branch_gt_long"),
    (BRANCH_LTEQ_LONG, "branch_lteq_long"),
    (BRANCH_GTEQ_LONG, "branch_gteq_long"),
    (SWITCH, "switch"),
    (RETURN, "return"),
    (PUSHCONST, "pushconst"),
    (TRIBYTE1, "tribyte1"),
    (TRIBYTE2, "tribyte2"),
    (SHORTING_OR, "shorting_or"),
    (SHORTING_AND, "shorting_and"),
    (PLUS, "plus"),
    (MINUS, "minus"),
    (INTMUL, "intmul"),
    (INTDIV, "intdiv"),
    (STRCMP, "strcmp"),
    (STRCONCAT, "strconcat"),
    (INTTOSTRING, "inttostring"),
    (ENUM_GETVALUE, "enum_getvalue"),
    (STRUCT_GETPARAM, "struct_getparam"),
    (ITEM_GETPARAM, "item_getparam"),
    (QUEST_GETPARAM, "quest_getparam"),
    (NPC_GETPARAM, "npc_getparam"),
    (CC_GETPARAM, "cc_getparam"),
    (MEC_GETPARAM, "mec_getparam"),
    (DBROW_GETFIELD, "dbrow_getfield"),
    (DBROW_FINDNEXT, "dbrow_findnext"),
    (CC_SETPARAM, "cc_setparam"),
    (DB_FIND_WITH_COUNT, "db_find_with_count"),
    (LC_GETPARAM, "lc_getparam"),
    (ENUM_GETSTRING, "enum_getstring"),
    (ENUM_GETREVERSEINDEX, "enum_getreverseindex"),
    (ENUM_GETREVERSECOUNT, "enum_getreversecount"),
    (ENUM_HASOUTPUT, "enum_hasoutput"),
    (DEFINE_ARRAY, "define_array"),
    (POP_ARRAY, "pop_array"),
    (PUSH_ARRAY, "push_array"),
    (PRINTMESSAGE, "printmessage"),
];

pub const BRANCH_INT: [OpId; 6] = [
    BRANCH_NOT,
    BRANCH_EQ,
    BRANCH_LT,
    BRANCH_GT,
    BRANCH_LTEQ,
    BRANCH_GTEQ,
];
pub const BRANCH_LONG: [OpId; 6] = [
    BRANCH_NOT_LONG,
    BRANCH_EQ_LONG,
    BRANCH_LT_LONG,
    BRANCH_GT_LONG,
    BRANCH_LTEQ_LONG,
    BRANCH_GTEQ_LONG,
];
pub const POP_DISCARD: [OpId; 3] = [POPDISCARDINT, POPDISCARDLONG, POPDISCARDSTRING];
pub const POP_LOCAL: [OpId; 3] = [POPLOCALINT, POPLOCALLONG, POPLOCALSTRING];
pub const PUSH_LOCAL: [OpId; 3] = [PUSHLOCALINT, PUSHLOCALLONG, PUSHLOCALSTRING];
pub const GET_PARAM: [OpId; 6] = [
    CC_GETPARAM,
    MEC_GETPARAM,
    NPC_GETPARAM,
    ITEM_GETPARAM,
    QUEST_GETPARAM,
    STRUCT_GETPARAM,
];

/// Operations whose stack effect depends on constant operands or on
/// external metadata rather than on the opcode alone.
pub fn is_dynamic(op: OpId) -> bool {
    GET_PARAM.contains(&op)
        || matches!(
            op,
            PUSHVAR | POPVAR | ENUM_GETVALUE | DBROW_GETFIELD | DBROW_FINDNEXT
        )
}

pub fn is_branch(op: OpId) -> bool {
    BRANCH_INT.contains(&op) || BRANCH_LONG.contains(&op)
}

pub fn is_local_op(op: OpId) -> bool {
    POP_LOCAL.contains(&op) || PUSH_LOCAL.contains(&op)
}

/// Infix symbol of comparison, logic and arithmetic operations.
pub fn binary_symbol(op: OpId) -> Option<&'static str> {
    Some(match op {
        SHORTING_OR => "||",
        SHORTING_AND => "&&",
        BRANCH_NOT => "!=",
        BRANCH_EQ => "==",
        BRANCH_LTEQ => "<=",
        BRANCH_GTEQ => ">=",
        BRANCH_LT => "<",
        BRANCH_GT => ">",
        PLUS => "+",
        MINUS => "-",
        INTDIV => "/",
        INTMUL => "*",
        _ => return None,
    })
}

/// Primitive stack a local/discard operation works on.
pub fn local_primitive(op: OpId) -> Option<StackType> {
    match op {
        PUSHLOCALINT | POPLOCALINT | POPDISCARDINT => Some(StackType::Int),
        PUSHLOCALLONG | POPLOCALLONG | POPDISCARDLONG => Some(StackType::Long),
        PUSHLOCALSTRING | POPLOCALSTRING | POPDISCARDSTRING => Some(StackType::String),
        _ => None,
    }
}

pub fn op_name(op: OpId) -> Option<&'static str> {
    NAMED_OPS.iter().find(|(id, _)| *id == op).map(|(_, n)| *n)
}

pub fn op_id(name: &str) -> Option<OpId> {
    NAMED_OPS.iter().find(|(_, n)| *n == name).map(|(id, _)| *id)
}

/// Display name, `unk_<id>` for operations without a name.
pub fn display_name(op: OpId) -> String {
    op_name(op).map_or_else(|| format!("unk_{op}"), str::to_string)
}

/// Immediate kind implied by a canonical id in an unscrambled cache.
pub fn default_kind(op: OpId) -> ImmediateKind {
    match op {
        PUSHCONST => ImmediateKind::Switch,
        TRIBYTE1 | TRIBYTE2 => ImmediateKind::Tribyte,
        PUSHSTRING => ImmediateKind::String,
        PUSHLONG => ImmediateKind::Long,
        0x15 | 0x26 | 0x27 | 0x66 => ImmediateKind::Byte,
        op if op < 0x80 => ImmediateKind::Int,
        _ => ImmediateKind::Byte,
    }
}

/// Stack effects fixed by the VM for structural operations. Constants,
/// calls, returns and joins are handled per instruction instead.
pub fn structural_stack(op: OpId) -> Option<StackInOut> {
    use StackType::{Int, Long, String};
    let io = match op {
        PUSHLOCALINT => StackInOut::of(&[], &[Int]),
        PUSHLOCALLONG => StackInOut::of(&[], &[Long]),
        PUSHLOCALSTRING => StackInOut::of(&[], &[String]),
        POPLOCALINT | POPDISCARDINT => StackInOut::of(&[Int], &[]),
        POPLOCALLONG | POPDISCARDLONG => StackInOut::of(&[Long], &[]),
        POPLOCALSTRING | POPDISCARDSTRING => StackInOut::of(&[String], &[]),
        JUMP => StackInOut::of(&[], &[]),
        SWITCH => StackInOut::of(&[Int], &[]),
        op if BRANCH_INT.contains(&op) => StackInOut::of(&[Int, Int], &[]),
        op if BRANCH_LONG.contains(&op) => StackInOut::of(&[Long, Long], &[]),
        _ => return None,
    };
    Some(io)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn names_round_trip() {
        for &(id, name) in NAMED_OPS {
            assert_eq!(op_id(name), Some(id), "{name}");
        }
        assert_eq!(display_name(PLUS), "plus");
        assert_eq!(display_name(12345), "unk_12345");
    }

    #[test]
    fn unscrambled_kinds() {
        assert_eq!(default_kind(PUSHLOCALINT), ImmediateKind::Int);
        assert_eq!(default_kind(RETURN), ImmediateKind::Byte);
        assert_eq!(default_kind(PUSHCONST), ImmediateKind::Switch);
        assert_eq!(default_kind(PLUS), ImmediateKind::Byte);
        assert_eq!(default_kind(PUSHSTRING), ImmediateKind::String);
    }

    #[test]
    fn branch_stack() {
        let io = structural_stack(BRANCH_LT_LONG).unwrap();
        assert_eq!(io.total_change(), -2);
        assert!(structural_stack(GOSUB).is_none());
    }
}
