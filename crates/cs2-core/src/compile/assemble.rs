use std::collections::HashMap;

use cs2script::{ScriptHeader, SlotCounts, SwitchCase};

use super::{Item, Label};
use crate::error::{CoreError, Result};
use crate::ops::named;
use crate::ops::{ClientScript, Operation};
use crate::stack::StackDiff;

/// Place labels and resolve every reference to them. Temporary locals are
/// moved to the slots following `temp_base`.
pub(super) fn assemble(items: Vec<Item>, temp_base: StackDiff) -> Result<ClientScript> {
    let mut positions: HashMap<Label, usize> = HashMap::new();
    let mut index = 0;
    for item in &items {
        match item {
            Item::Place(l) => {
                if positions.insert(*l, index).is_some() {
                    return Err(CoreError::Compile(format!("label {l:?} placed twice")));
                }
            }
            _ => index += 1,
        }
    }
    if index > u16::MAX as usize {
        return Err(CoreError::Compile(format!(
            "{index} instructions, at most {} fit in a script",
            u16::MAX
        )));
    }

    let resolve = |l: &Label, at: usize| -> Result<i32> {
        let target = positions
            .get(l)
            .ok_or_else(|| CoreError::Compile(format!("label {l:?} was never placed")))?;
        Ok(*target as i32 - (at as i32 + 1))
    };

    let mut ops = Vec::with_capacity(index);
    let mut switches: Vec<Vec<SwitchCase>> = Vec::new();
    for item in items {
        let at = ops.len();
        let op = match item {
            Item::Place(_) => continue,
            Item::Op(op) => op,
            Item::Goto { opcode, target } => Operation::new(opcode, resolve(&target, at)?),
            Item::Switch(table) => {
                let cases = table
                    .iter()
                    .map(|(value, l)| {
                        Ok(SwitchCase {
                            value: *value,
                            jump: resolve(l, at)?,
                        })
                    })
                    .collect::<Result<Vec<_>>>()?;
                switches.push(cases);
                Operation::new(named::SWITCH, switches.len() as i32 - 1)
            }
            Item::Temp { opcode, slot } => {
                let p = named::local_primitive(opcode)
                    .and_then(|t| t.primitive())
                    .ok_or_else(|| {
                        CoreError::Compile(format!("{} has no local slot", named::display_name(opcode)))
                    })?;
                Operation::new(opcode, temp_base.prim(p) + slot as i32)
            }
        };
        ops.push(op);
    }

    let switch_size = ScriptHeader::switch_size(&switches);
    if switch_size > u16::MAX as usize || switches.len() > u8::MAX as usize {
        return Err(CoreError::Compile(format!(
            "{} switch tables of {switch_size} bytes exceed the header limits",
            switches.len()
        )));
    }
    let instruction_count = u16::try_from(ops.len())
        .map_err(|_| CoreError::Compile(format!("{} instructions do not fit in a script header", ops.len())))?;
    Ok(ClientScript {
        header: ScriptHeader {
            switches,
            instruction_count,
            ..Default::default()
        },
        ops,
    })
}

pub(super) fn slot_counts(d: StackDiff) -> Result<SlotCounts> {
    let slots = |n: i32| {
        u16::try_from(n).map_err(|_| CoreError::Compile(format!("{n} slots do not fit in a script header")))
    };
    Ok(SlotCounts {
        int: slots(d.int)?,
        long: slots(d.long)?,
        string: slots(d.string)?,
    })
}
