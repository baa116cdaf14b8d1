//! Pseudo-source printer for decompiled trees.
//!
//! The output is TypeScript flavoured and meant for reading, not for
//! parsing back. Operations without a known name print as `unk_<id>`.

use cs2script::Payload;

use crate::ast::{Ast, ComposedKind, FunctionDef, NodeId, NodeKind};
use crate::ops::named::{self, *};
use crate::ops::{OpcodeRegistry, Operation};
use crate::stack::{ExactStack, PrimitiveType, StackList, StackType};
use crate::subtypes::Subtype;

const INDENT: &str = "    ";

/// Render `root` and everything below it.
pub fn render(ast: &Ast, root: NodeId, registry: &OpcodeRegistry) -> String {
    Printer {
        ast,
        registry,
        indent: 0,
    }
    .node(root)
}

struct Printer<'a> {
    ast: &'a Ast,
    registry: &'a OpcodeRegistry,
    indent: usize,
}

fn quote(s: &str) -> String {
    let mut res = String::with_capacity(s.len() + 2);
    res.push('"');
    for c in s.chars() {
        if matches!(c, '"' | '\\') {
            res.push('\\');
        }
        res.push(c);
    }
    res.push('"');
    res
}

/// Name of the variable a local or client variable operation touches.
fn variable_name(registry: &OpcodeRegistry, op: &Operation) -> Option<String> {
    if let Some(ty) = named::local_primitive(op.opcode) {
        if named::is_local_op(op.opcode) {
            return Some(format!("{}{}", ty.name(), op.imm));
        }
    }
    if matches!(op.opcode, PUSHVAR | POPVAR) {
        return Some(var_name(registry, op.imm));
    }
    None
}

/// Display name of the client variable packed into a `pushvar`/`popvar`
/// immediate.
pub fn var_name(registry: &OpcodeRegistry, imm: i32) -> String {
    let domain = (imm >> 24) & 0xff;
    let id = (imm >> 8) & 0xffff;
    match registry.symbols.var(imm).and_then(|v| v.name.as_deref()) {
        Some(name) => format!("var{name}_{id}"),
        None => format!("var{domain}_{id}"),
    }
}

/// Parameter names and type names of a function, `int0`, `string0`, ...
fn params(list: &StackList, exact: Option<&ExactStack>) -> Vec<(String, String)> {
    let mut seen = [0usize; 3];
    let mut res = Vec::new();
    for slot in &list.values {
        let Some(ty) = slot.stack_type() else {
            res.push((format!("args{}", res.len()), "unknown[]".to_string()));
            continue;
        };
        let Some(p) = ty.primitive() else {
            res.push((format!("vararg{}", res.len()), ty.name().to_string()));
            continue;
        };
        let n = seen[p as usize];
        seen[p as usize] += 1;
        let type_name = exact
            .and_then(|e| e.get(p).get(n).copied())
            .map_or_else(|| StackType::from(p).name().to_string(), Subtype::name);
        res.push((format!("{}{n}", StackType::from(p).name()), type_name));
    }
    res
}

impl Printer<'_> {
    fn line_prefix(&self) -> String {
        INDENT.repeat(self.indent)
    }

    fn list(&mut self, ids: &[NodeId]) -> String {
        ids.iter().map(|&c| self.node(c)).collect::<Vec<_>>().join(", ")
    }

    fn node(&mut self, id: NodeId) -> String {
        let ast = self.ast;
        let children = ast.children(id);
        match ast.kind(id) {
            NodeKind::RawOp(op) => self.raw_op(id, op),
            NodeKind::Branching(op) => self.call(&Operation::new(*op, 0), children, None),
            NodeKind::CodeBlock(_) => self.block(id),
            NodeKind::If(s) => {
                let mut res = format!("if ({}) {}", self.condition(s.condition), self.node(s.true_branch));
                if let Some(f) = s.false_branch {
                    res.push_str(" else ");
                    match ast.children(f) {
                        [only] if matches!(ast.kind(*only), NodeKind::If(_)) => res.push_str(&self.node(*only)),
                        _ => res.push_str(&self.node(f)),
                    }
                }
                res
            }
            NodeKind::While { condition, body } => {
                format!("while ({}) {}", self.condition(*condition), self.node(*body))
            }
            NodeKind::Switch(s) => {
                let value = s.value.map(|v| self.node(v)).unwrap_or_default();
                let mut res = format!("switch ({value}) {{\n");
                self.indent += 1;
                for (i, &(case, block)) in s.cases.iter().enumerate() {
                    res.push_str(&format!("{}case {case}:", self.line_prefix()));
                    if s.cases.get(i + 1).is_some_and(|next| next.1 == block) {
                        res.push('\n');
                    } else {
                        res.push_str(&format!(" {}\n", self.node(block)));
                    }
                }
                if let Some(d) = s.default {
                    res.push_str(&format!("{}default: {}\n", self.line_prefix(), self.node(d)));
                }
                self.indent -= 1;
                res.push_str(&format!("{}}}", self.line_prefix()));
                res
            }
            NodeKind::VarAssign { targets } => {
                let names: Vec<_> = targets
                    .iter()
                    .map(|t| variable_name(self.registry, t).unwrap_or_else(|| named::display_name(t.opcode)))
                    .collect();
                let values = self.list(children);
                match names.as_slice() {
                    [one] => format!("{one} = {values}"),
                    _ => format!("[{}] = [{values}]", names.join(", ")),
                }
            }
            NodeKind::Composed(c) => {
                let name = variable_name(self.registry, &c.target).unwrap_or_else(|| "??".into());
                match c.kind {
                    ComposedKind::PostInc => format!("{name}++"),
                    ComposedKind::PostDec => format!("{name}--"),
                    ComposedKind::PreInc => format!("++{name}"),
                    ComposedKind::PreDec => format!("--{name}"),
                }
            }
            NodeKind::FunctionBind { .. } => {
                let script = children
                    .first()
                    .and_then(|&c| ast.raw_op(c))
                    .and_then(Operation::const_int)
                    .unwrap_or(-1);
                let rest = children.get(1..).unwrap_or_default();
                if script == -1 && rest.is_empty() {
                    return "callback()".into();
                }
                let mut res = format!("callback(script{script}");
                if !rest.is_empty() {
                    res.push_str(", ");
                    res.push_str(&self.list(rest));
                }
                res.push(')');
                res
            }
            NodeKind::Subcall { name } | NodeKind::Intrinsic { name } => {
                format!("{name}({})", self.list(children))
            }
            NodeKind::Function(def) => self.function(def, children),
        }
    }

    /// Condition of an if or loop, without the outer parentheses.
    fn condition(&mut self, id: NodeId) -> String {
        let ast = self.ast;
        let op = match ast.kind(id) {
            NodeKind::Branching(op) => *op,
            NodeKind::RawOp(op) => op.opcode,
            _ => return self.node(id),
        };
        match (named::binary_symbol(op), ast.children(id)) {
            (Some(sym), [a, b]) => format!("{} {sym} {}", self.node(*a), self.node(*b)),
            _ => self.node(id),
        }
    }

    fn block(&mut self, id: NodeId) -> String {
        let ast = self.ast;
        let nested = ast.parent(id).is_some();
        let mut res = String::new();
        if nested {
            res.push_str("{\n");
            self.indent += 1;
        }
        for &child in ast.children(id) {
            let statement = self.node(child);
            let terminator = match ast.kind(child) {
                NodeKind::If(_) | NodeKind::While { .. } | NodeKind::Switch(_) | NodeKind::Function(_) => "",
                _ => ";",
            };
            res.push_str(&format!("{}{statement}{terminator}\n", self.line_prefix()));
        }
        if nested {
            self.indent -= 1;
            res.push_str(&format!("{}}}", self.line_prefix()));
        }
        res
    }

    fn function(&mut self, def: &FunctionDef, children: &[NodeId]) -> String {
        let registry = self.registry;
        let signature = def
            .name
            .strip_prefix("script")
            .and_then(|id| id.parse::<u32>().ok())
            .and_then(|id| registry.scripts.get(&id));
        let args = params(&def.args, signature.and_then(|s| s.exact_in.as_ref()))
            .into_iter()
            .map(|(name, ty)| format!("{name}: {ty}"))
            .collect::<Vec<_>>()
            .join(", ");
        let returns: Vec<_> = params(&def.returns, signature.and_then(|s| s.exact_out.as_ref()))
            .into_iter()
            .map(|(_, ty)| ty)
            .collect();
        let returns = match returns.as_slice() {
            [] => "void".to_string(),
            [one] => one.clone(),
            many => format!("[{}]", many.join(", ")),
        };
        let body = children.first().map(|&b| self.node(b)).unwrap_or_else(|| "{}".into());
        format!("function {}({args}): {returns} {body}", def.name)
    }

    fn raw_op(&mut self, id: NodeId, op: &Operation) -> String {
        let ast = self.ast;
        let children = ast.children(id);
        match (&op.payload, op.opcode) {
            (Payload::Int(v), _) => return format!("{v}{}", self.cast(id, PrimitiveType::Int)),
            (Payload::Long(v), _) => return format!("{v}n{}", self.cast(id, PrimitiveType::Long)),
            (Payload::String(s), _) => return format!("{}{}", quote(s), self.cast(id, PrimitiveType::String)),
            (Payload::None, PUSHINT) => return op.imm.to_string(),
            _ => {}
        }
        if named::PUSH_LOCAL.contains(&op.opcode) || op.opcode == PUSHVAR {
            if let Some(name) = variable_name(self.registry, op) {
                return name;
            }
        }
        if op.opcode == JOINSTRING {
            let mut res = String::from("`");
            for &child in children {
                match ast.raw_op(child).and_then(Operation::const_string) {
                    Some(s) => res.push_str(s),
                    None => res.push_str(&format!("${{{}}}", self.node(child))),
                }
            }
            res.push('`');
            return res;
        }
        self.call(op, children, ast[id].original_index)
    }

    /// ` as <subtype>` when the solver pinned a constant to a domain type.
    fn cast(&self, id: NodeId, p: PrimitiveType) -> String {
        let exact = self.ast[id]
            .known_stack
            .as_ref()
            .and_then(|s| s.exact_out.as_ref())
            .and_then(|e| e.get(p).first().copied());
        match exact {
            Some(t) if t != Subtype::INT && t != Subtype::LONG && t != Subtype::STRING && t != Subtype::unknown(p) => {
                format!(" as {t}")
            }
            _ => String::new(),
        }
    }

    fn call(&mut self, op: &Operation, children: &[NodeId], index: Option<usize>) -> String {
        if let Some(sym) = named::binary_symbol(op.opcode) {
            return match children {
                [a, b] => format!("({} {sym} {})", self.node(*a), self.node(*b)),
                _ => {
                    let args: Vec<_> = children.iter().map(|&c| self.node(c)).collect();
                    format!("({sym} {})", args.join(" "))
                }
            };
        }
        match op.opcode {
            RETURN => {
                return match children {
                    [] => "return".into(),
                    [one] => format!("return {}", self.node(*one)),
                    many => format!("return [{}]", self.list(many)),
                }
            }
            GOSUB => return format!("script{}({})", op.imm, self.list(children)),
            _ => {}
        }
        let name = variable_name(self.registry, op).unwrap_or_else(|| named::display_name(op.opcode));
        let meta = if named::is_branch(op.opcode) || op.opcode == JUMP {
            match index {
                Some(i) => format!("[{}]", i as i64 + op.imm as i64 + 1),
                None => format!("[{:+}]", op.imm),
            }
        } else if op.imm != 0 && !named::is_local_op(op.opcode) {
            format!("[{}]", op.imm)
        } else {
            String::new()
        };
        format!("{name}{meta}({})", self.list(children))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::stack::StackInOut;
    use crate::stack::StackDiff;
    use crate::symbols::{SymbolTables, VarInfo};
    use cs2script::BuildNumber;

    fn registry() -> OpcodeRegistry {
        OpcodeRegistry::unscrambled(BuildNumber(900))
    }

    fn value(ast: &mut Ast, op: Operation, children: &[NodeId]) -> NodeId {
        let id = ast.raw(op);
        ast.push_list(id, children).unwrap();
        id
    }

    #[test]
    fn expression_statement() {
        let mut ast = Ast::new();
        let block = ast.code_block(0, 0);
        let five = ast.raw(Operation::push_int(5));
        let one = ast.raw(Operation::push_int(1));
        let plus = value(&mut ast, Operation::new(PLUS, 0), &[five, one]);
        let ret = value(&mut ast, Operation::new(RETURN, 0), &[plus]);
        ast.push(block, ret).unwrap();
        assert_eq!(render(&ast, block, &registry()), "return (5 + 1);\n");
    }

    #[test]
    fn function_signature_uses_exact_types() {
        let mut reg = registry();
        reg.scripts.insert(7, StackInOut::from_exact(&[Subtype::OBJ, Subtype::STRING], &[Subtype::BOOLEAN]));
        let mut ast = Ast::new();
        let root = ast.add(
            NodeKind::Function(FunctionDef {
                name: "script7".into(),
                args: [StackType::Int, StackType::String].into_iter().collect(),
                returns: [StackType::Int].into_iter().collect(),
                locals: StackDiff::new(1, 0, 1, 0),
            }),
            Some(0),
        );
        let body = ast.code_block(7, 0);
        let text = ast.raw(Operation::push_string("a \"b\""));
        let print = value(&mut ast, Operation::new(PRINTMESSAGE, 0), &[text]);
        let zero = ast.raw(Operation::push_int(0));
        let ret = value(&mut ast, Operation::new(RETURN, 0), &[zero]);
        ast.push_list(body, &[print, ret]).unwrap();
        ast.push(root, body).unwrap();

        let out = render(&ast, root, &reg);
        assert_eq!(
            out,
            "function script7(int0: obj, string0: string): boolean {\n    printmessage(\"a \\\"b\\\"\");\n    return 0;\n}"
        );
    }

    #[test]
    fn else_if_chains_and_names() {
        let mut reg = registry();
        reg.symbols.vars.insert(
            SymbolTables::var_key(0, 12),
            VarInfo {
                name: Some("player".into()),
                subtype: Subtype::INT,
            },
        );
        let mut ast = Ast::new();
        let root = ast.code_block(0, 0);
        let local = ast.raw(Operation::new(PUSHLOCALINT, 0));
        let two = ast.raw(Operation::push_int(2));
        let cond = value(&mut ast, Operation::new(BRANCH_EQ, 1), &[local, two]);
        let then = ast.code_block(0, 4);
        let var = ast.raw(Operation::new(PUSHVAR, 12 << 8));
        let unknown = value(&mut ast, Operation::new(12345, 0), &[var]);
        ast.push(then, unknown).unwrap();

        let inner_cond = ast.raw(Operation::new(20000, 0));
        let inner_then = ast.code_block(0, 8);
        let ret = ast.raw(Operation::new(RETURN, 0));
        ast.push(inner_then, ret).unwrap();
        let inner = ast.new_if(inner_cond, inner_then, None, None, 9).unwrap();
        let otherwise = ast.code_block(0, 6);
        ast.push(otherwise, inner).unwrap();

        let outer = ast.new_if(cond, then, Some(otherwise), None, 9).unwrap();
        ast.push(root, outer).unwrap();

        let out = render(&ast, root, &reg);
        assert_eq!(
            out,
            "if (int0 == 2) {\n    unk_12345(varplayer_12);\n} else if (unk_20000()) {\n    return;\n}\n"
        );
    }

    #[test]
    fn join_string_template() {
        let mut ast = Ast::new();
        let a = ast.raw(Operation::push_string("hp: "));
        let b = ast.raw(Operation::new(PUSHLOCALINT, 3));
        let join = value(&mut ast, Operation::new(JOINSTRING, 2), &[a, b]);
        assert_eq!(render(&ast, join, &registry()), "`hp: ${int3}`");
    }
}
