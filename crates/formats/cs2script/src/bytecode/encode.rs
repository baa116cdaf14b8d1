use crate::bytecode::decode::Instruction;
use crate::bytecode::ImmediateLookup;
use crate::cursor::Writer;
use crate::error::Result;
use crate::immediate::write_immediate;

/// Encode instructions back into an instruction stream.
///
/// Inverse of [`decode`](crate::bytecode::decode::decode); the `offset`
/// field of the input is ignored.
pub fn encode(instructions: &[Instruction], lookup: &mut impl ImmediateLookup) -> Result<Vec<u8>> {
    let mut w = Writer::with_capacity(instructions.len() * 3);
    for inst in instructions {
        w.write_u16(inst.opcode);
        let kind = lookup.immediate_kind(inst.opcode);
        write_immediate(&mut w, kind, inst.imm, &inst.payload)?;
    }
    Ok(w.into_bytes())
}

/// Decode then re-encode and compare with the input. Returns the offset of
/// the first differing byte on mismatch.
pub fn verify_round_trip(
    code: &[u8],
    count: usize,
    lookup: &mut impl ImmediateLookup,
) -> Result<Option<usize>> {
    let insts = crate::bytecode::decode(code, count, lookup)?;
    let out = encode(&insts, lookup)?;
    if out == code {
        return Ok(None);
    }
    let first = code
        .iter()
        .zip(&out)
        .position(|(a, b)| a != b)
        .unwrap_or(code.len().min(out.len()));
    Ok(Some(first))
}
