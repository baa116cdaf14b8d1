//! Emulated calls: unit functions, intrinsics and the shared return
//! dispatch.
//!
//! Every section starts with an unreachable string constant describing its
//! layout (`type=... entry=... end=... in=... out=...`) so that the
//! sections can be recognized in compiled output. Tracer no-ops (a string
//! push and discard) mark the body and footer of unit functions.

use cs2script::ImmediateKind;

use super::{function_body, function_def, goto, op_count, Emitter, Item, Label};
use crate::error::{CoreError, Result};
use crate::ops::named::{
    self, OpId, BRANCH_EQ, BRANCH_LT, GOSUB, JUMP, POPDISCARDSTRING, POPLOCALINT, POPLOCALSTRING,
    PRINTMESSAGE, PUSHCONST, PUSHLOCALINT, PUSHLOCALSTRING, PUSHVAR, RETURN, STRCMP, SWITCH,
};
use crate::ops::Operation;
use crate::stack::{PrimitiveType, StackDiff, StackList, StackType};

/// Functions provided by the compiler itself.
pub const INTRINSICS: [&str; 4] = ["opnametoid", "call", "op", "getvar"];

/// Arguments and results of an intrinsic.
pub fn intrinsic_signature(name: &str) -> Option<(StackList, StackList)> {
    use StackType::{Int, String};
    let (input, output): (&[StackType], &[StackType]) = match name {
        "opnametoid" => (&[String], &[Int]),
        "call" => (&[Int], &[]),
        "op" => (&[Int], &[]),
        "getvar" => (&[Int], &[Int]),
        _ => return None,
    };
    Some((input.iter().copied().collect(), output.iter().copied().collect()))
}

/// Below this many cases a dispatch tree compares linearly.
const LINEAR_CASES: usize = 8;

fn push_local(p: PrimitiveType) -> OpId {
    named::PUSH_LOCAL[p as usize]
}

fn pop_local(p: PrimitiveType) -> OpId {
    named::POP_LOCAL[p as usize]
}

fn count(d: &StackDiff, p: PrimitiveType) -> u16 {
    d.prim(p).clamp(0, u16::MAX as i32) as u16
}

fn temp(opcode: OpId, slot: u16) -> Item {
    Item::Temp { opcode, slot }
}

fn local(opcode: OpId, slot: u16) -> Item {
    Item::Op(Operation::new(opcode, slot as i32))
}

fn tracer(text: String) -> [Item; 2] {
    [
        Item::Op(Operation::push_string(text)),
        Item::Op(Operation::new(POPDISCARDSTRING, 0)),
    ]
}

fn layout_tag(kind: &str, entry: usize, end: usize, input: &StackDiff, output: &StackDiff) -> String {
    format!(
        "type={kind} entry={entry} end={end} in={},{},{} out={},{},{}",
        input.int, input.long, input.string, output.int, output.long, output.string
    )
}

fn fail_message(text: &str) -> [Item; 2] {
    [
        Item::Op(Operation::push_string(text)),
        Item::Op(Operation::new(PRINTMESSAGE, 0)),
    ]
}

impl Emitter<'_> {
    /// Return dispatch followed by the body of every called function, in
    /// order of first use, jumped over on entry. Empty when nothing is
    /// called.
    pub(super) fn call_sections(&mut self) -> Result<Vec<Item>> {
        let mut bodies = Vec::new();
        // emitting a body may call further functions
        let mut i = 0;
        while i < self.functions.len() {
            let (name, entry) = self.functions[i].clone();
            if intrinsic_signature(&name).is_some() {
                bodies.extend(self.intrinsic(&name, entry)?);
            } else {
                let func = *self
                    .definitions
                    .get(&name)
                    .ok_or_else(|| CoreError::Compile(format!("function {name} is not defined")))?;
                bodies.extend(self.unit_function(func, entry)?);
            }
            i += 1;
        }
        if self.functions.is_empty() {
            return Ok(Vec::new());
        }

        let skip = self.label();
        let table = self.return_table();
        let mut items = vec![
            goto(JUMP, skip),
            Item::Op(Operation::push_string(layout_tag(
                "returnjumps",
                1,
                6,
                &StackDiff::new(1, 0, 0, 0),
                &StackDiff::default(),
            ))),
            Item::Place(table),
            Item::Switch(self.return_sites.clone()),
        ];
        items.extend(fail_message("unknown return address on stack (stack is corrupt)"));
        items.push(Item::Op(Operation::new(RETURN, 0)));
        items.extend(bodies);
        items.push(Item::Place(skip));
        Ok(items)
    }

    /// A function of the unit. On entry the int stack holds the arguments
    /// with the return-site id on top; the caller's locals are parked on
    /// the stacks while the body runs in the same local frame.
    fn unit_function(&mut self, func: crate::ast::NodeId, entry: Label) -> Result<Vec<Item>> {
        let def = function_def(self.ast, func)?;
        let body = function_body(self.ast, func)?;
        let (name, returns, locals) = (def.name.clone(), def.returns.clone(), def.locals);
        let input = def.args.to_diff();
        let output = returns.to_diff();
        if input.vararg != 0 || output.vararg != 0 {
            return Err(CoreError::Compile(format!("function {name} passes a vararg")));
        }
        self.locals = self.locals.max(locals);

        let ret = count(&input, PrimitiveType::Int).max(count(&output, PrimitiveType::Int));
        self.reserve_temps(PrimitiveType::Int, ret as i32 + 1);
        for p in [PrimitiveType::Long, PrimitiveType::String] {
            self.reserve_temps(p, input.prim(p).max(output.prim(p)));
        }

        let mut items = vec![Item::Op(Operation::push_string(String::new())), Item::Place(entry)];
        items.push(temp(POPLOCALINT, ret));
        for p in PrimitiveType::ALL {
            items.extend((0..count(&input, p)).rev().map(|i| temp(pop_local(p), i)));
        }
        for p in PrimitiveType::ALL {
            items.extend((0..count(&locals, p)).map(|i| local(push_local(p), i)));
        }
        items.push(temp(PUSHLOCALINT, ret));
        for p in PrimitiveType::ALL {
            for i in 0..count(&input, p) {
                items.push(temp(push_local(p), i));
                items.push(local(pop_local(p), i));
            }
        }
        items.extend(tracer(format!("subfunc {name} body")));

        let body_at = op_count(&items);
        let end = self.label();
        let outer_end = self.function_end.replace(end);
        let mut code = Vec::new();
        let res = self.emit_function_body(body, &returns, &mut code);
        self.function_end = outer_end;
        res?;
        items.extend(code);

        let foot_at = op_count(&items);
        items.push(Item::Place(end));
        items.extend(tracer(format!("subfunc {name} footer")));
        for p in PrimitiveType::ALL {
            items.extend((0..count(&output, p)).rev().map(|i| temp(pop_local(p), i)));
        }
        items.push(temp(POPLOCALINT, ret));
        for p in PrimitiveType::ALL {
            items.extend((0..count(&locals, p)).rev().map(|i| local(pop_local(p), i)));
        }
        for p in PrimitiveType::ALL {
            items.extend((0..count(&output, p)).map(|i| temp(push_local(p), i)));
        }
        items.push(temp(PUSHLOCALINT, ret));
        items.push(self.return_op());
        items.extend(tracer(format!("subfunc {name} end")));

        let tag = format!(
            "{} body={body_at} foot={foot_at}",
            layout_tag("subfunc", 1, op_count(&items), &input, &output)
        );
        items[0] = Item::Op(Operation::push_string(tag));
        Ok(items)
    }

    fn intrinsic(&mut self, name: &str, entry: Label) -> Result<Vec<Item>> {
        let (input, output) = intrinsic_signature(name)
            .ok_or_else(|| CoreError::Compile(format!("unknown intrinsic {name}")))?;
        let mut items = vec![Item::Op(Operation::push_string(String::new())), Item::Place(entry)];
        match name {
            "opnametoid" => self.op_name_to_id(&mut items),
            "call" => self.call_script(&mut items),
            "op" => self.call_op(&mut items),
            _ => self.get_var(&mut items),
        }
        let tag = format!(
            "{} name={name}",
            layout_tag("intrinsic", 1, op_count(&items), &input.to_diff(), &output.to_diff())
        );
        items[0] = Item::Op(Operation::push_string(tag));
        Ok(items)
    }

    /// `string -> int`: canonical id of the op with the given name, -1 if
    /// there is none.
    fn op_name_to_id(&mut self, out: &mut Vec<Item>) {
        self.reserve_temps(PrimitiveType::Int, 1);
        self.reserve_temps(PrimitiveType::String, 1);
        out.push(temp(POPLOCALINT, 0));
        out.push(temp(POPLOCALSTRING, 0));
        let end = self.label();
        let registry = self.registry;
        for info in registry.iter() {
            let hit = self.label();
            let miss = self.label();
            out.push(Item::Op(Operation::push_string(named::display_name(info.id))));
            out.push(temp(PUSHLOCALSTRING, 0));
            out.push(Item::Op(Operation::new(STRCMP, 0)));
            out.push(Item::Op(Operation::push_int(0)));
            out.push(goto(BRANCH_EQ, hit));
            out.push(goto(JUMP, miss));
            out.push(Item::Place(hit));
            out.push(Item::Op(Operation::push_int(info.id as i32)));
            out.push(goto(JUMP, end));
            out.push(Item::Place(miss));
        }
        out.push(Item::Op(Operation::push_int(-1)));
        out.push(Item::Place(end));
        out.push(temp(PUSHLOCALINT, 0));
        out.push(self.return_op());
    }

    /// `int -> ()`: `gosub` of a script chosen at runtime. The script id
    /// is looked up in a comparison tree since switch tables are too
    /// small to hold every script.
    fn call_script(&mut self, out: &mut Vec<Item>) {
        self.reserve_temps(PrimitiveType::Int, 2);
        out.push(temp(POPLOCALINT, 1));
        let end = self.label();
        let fallback = self.label();
        let ids: Vec<u32> = self.registry.scripts.keys().copied().collect();
        let cases: Vec<(i32, Label)> = ids.iter().map(|&id| (id as i32, self.label())).collect();

        out.push(temp(POPLOCALINT, 0));
        self.dispatch_tree(&cases, 0, fallback, out);
        out.push(Item::Place(fallback));
        out.extend(fail_message("no script matched"));
        out.push(goto(JUMP, end));
        for (&id, &(_, l)) in ids.iter().zip(&cases) {
            out.push(Item::Place(l));
            out.push(Item::Op(Operation::new(GOSUB, id as i32)));
            out.push(goto(JUMP, end));
        }
        out.push(Item::Place(end));
        out.push(temp(PUSHLOCALINT, 1));
        out.push(self.return_op());
    }

    /// Binary search over sorted `cases` on the value in temp `slot`.
    fn dispatch_tree(&mut self, cases: &[(i32, Label)], slot: u16, fallback: Label, out: &mut Vec<Item>) {
        if cases.len() < LINEAR_CASES {
            for &(value, target) in cases {
                out.push(temp(PUSHLOCALINT, slot));
                out.push(Item::Op(Operation::push_int(value)));
                out.push(goto(BRANCH_EQ, target));
            }
            out.push(goto(JUMP, fallback));
            return;
        }
        let split = cases.len().div_ceil(2);
        let lower = self.label();
        out.push(temp(PUSHLOCALINT, slot));
        out.push(Item::Op(Operation::push_int(cases[split].0)));
        out.push(goto(BRANCH_LT, lower));
        self.dispatch_tree(&cases[split..], slot, fallback, out);
        out.push(Item::Place(lower));
        self.dispatch_tree(&cases[..split], slot, fallback, out);
    }

    /// `int -> ()`: run the operation with the given canonical id. Ops
    /// with control flow or inline payloads are left out.
    fn call_op(&mut self, out: &mut Vec<Item>) {
        self.reserve_temps(PrimitiveType::Int, 1);
        out.push(temp(POPLOCALINT, 0));
        let end = self.label();
        let registry = self.registry;
        let mut table = Vec::new();
        let mut ops = Vec::new();
        for info in registry.iter() {
            let id = info.id;
            let control = named::is_branch(id) || matches!(id, JUMP | SWITCH | RETURN | PUSHCONST);
            let payload = matches!(info.kind, Some(ImmediateKind::String | ImmediateKind::Long));
            if control || payload {
                continue;
            }
            let l = self.label();
            table.push((id as i32, l));
            ops.push((id, l));
        }
        out.push(Item::Switch(table));
        out.extend(fail_message("no opcodes matched"));
        out.push(goto(JUMP, end));
        for (id, l) in ops {
            out.push(Item::Place(l));
            out.push(Item::Op(Operation::new(id, 0)));
            out.push(goto(JUMP, end));
        }
        out.push(Item::Place(end));
        out.push(temp(PUSHLOCALINT, 0));
        out.push(self.return_op());
    }

    /// `int -> int`: value of the client variable with the given packed
    /// `pushvar` immediate.
    fn get_var(&mut self, out: &mut Vec<Item>) {
        self.reserve_temps(PrimitiveType::Int, 1);
        out.push(temp(POPLOCALINT, 0));
        let end = self.label();
        let registry = self.registry;
        let mut table = Vec::new();
        for &key in registry.symbols.vars.keys() {
            let domain = (key >> 16) as i32;
            let id = (key & 0xffff) as i32;
            table.push(((domain << 24) | (id << 8), self.label()));
        }
        out.push(Item::Switch(table.clone()));
        out.extend(fail_message("no variable matched"));
        out.push(Item::Op(Operation::push_int(-1)));
        out.push(goto(JUMP, end));
        for (value, l) in table {
            out.push(Item::Place(l));
            out.push(Item::Op(Operation::new(PUSHVAR, value)));
            out.push(goto(JUMP, end));
        }
        out.push(Item::Place(end));
        out.push(temp(PUSHLOCALINT, 0));
        out.push(self.return_op());
    }
}
