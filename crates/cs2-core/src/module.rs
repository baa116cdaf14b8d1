//! Isolating a set of entry scripts together with every script they reach
//! through `gosub`.
//!
//! Each loaded script is scanned once for what it depends on: callees,
//! client variables, and the enums, structs and params it looks up with
//! constant ids. The scan follows int constants through each basic block
//! the same way stack annotation does, so a lookup fed by a computed id
//! simply records nothing.

use std::collections::{BTreeMap, BTreeSet, VecDeque};
use std::fmt::Write as _;

use tracing::{info, warn};

use crate::annotate::{annotate_block, ConstStack};
use crate::ast::decompile;
use crate::calibrate::Calibrator;
use crate::cfg::Cfg;
use crate::error::{CoreError, Result};
use crate::ops::named::{
    self, ENUM_GETREVERSEINDEX, ENUM_GETVALUE, GOSUB, POPVAR, POPVARBIT, PUSHVAR, PUSHVARBIT,
    STRUCT_GETPARAM,
};
use crate::ops::{ClientScript, OpcodeRegistry};
use crate::render::{render, var_name};
use crate::source::{CacheSource, CLIENTSCRIPT_MAJOR};

/// Everything one script refers to by id.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ScriptDeps {
    /// Scripts called with `gosub`.
    pub scripts: BTreeSet<u32>,
    pub enums: BTreeSet<i32>,
    pub structs: BTreeSet<i32>,
    pub params: BTreeSet<i32>,
    /// Packed `pushvar`/`popvar` immediates.
    pub vars: BTreeSet<i32>,
    pub varbits: BTreeSet<i32>,
}

/// Collect the dependencies of `script`.
pub fn script_deps(script_id: u32, script: &ClientScript, registry: &OpcodeRegistry) -> Result<ScriptDeps> {
    let mut deps = ScriptDeps::default();
    let cfg = Cfg::build(script)?;
    for (_, block) in cfg.blocks.iter() {
        let ops = &script.ops[block.start..block.end];
        let ann = annotate_block(script_id, ops, registry);
        let mut consts = ConstStack::default();
        for (i, op) in ops.iter().enumerate() {
            let mut record = |set: &mut BTreeSet<i32>, depth: usize| {
                if let Some(v) = consts.peek(depth) {
                    set.insert(v);
                }
            };
            match op.opcode {
                GOSUB => {
                    if let Ok(id) = u32::try_from(op.imm) {
                        deps.scripts.insert(id);
                    }
                }
                // keytype, outtype, enum, key
                ENUM_GETVALUE => record(&mut deps.enums, 1),
                // keytype, outtype, enum, key, index
                ENUM_GETREVERSEINDEX => record(&mut deps.enums, 2),
                STRUCT_GETPARAM => {
                    record(&mut deps.structs, 1);
                    record(&mut deps.params, 0);
                }
                o if named::GET_PARAM.contains(&o) => record(&mut deps.params, 0),
                PUSHVAR | POPVAR => {
                    deps.vars.insert(op.imm);
                }
                PUSHVARBIT | POPVARBIT => {
                    deps.varbits.insert(op.imm);
                }
                _ => {}
            }
            consts.step(op, ann.stack_of(i, op, registry));
        }
    }
    Ok(deps)
}

/// A loaded script and what it refers to.
#[derive(Debug, Clone)]
pub struct ModuleScript {
    pub script: ClientScript,
    pub deps: ScriptDeps,
}

/// Edge of a call graph. `caller` is `None` for entry points.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord)]
pub struct CallEdge {
    pub caller: Option<u32>,
    pub callee: u32,
}

/// Entry scripts plus the closure of their callees.
#[derive(Debug, Clone, Default)]
pub struct IsolatedModule {
    pub entrypoints: Vec<u32>,
    pub scripts: BTreeMap<u32, ModuleScript>,
    /// Called but not loadable; rendered as empty stubs.
    pub missing: BTreeSet<u32>,
}

impl IsolatedModule {
    /// Load `entrypoints` and everything they call. `load` returns `None`
    /// for scripts that do not exist, which is an error for entry points
    /// only.
    pub fn extract(
        registry: &OpcodeRegistry,
        entrypoints: &[u32],
        mut load: impl FnMut(u32) -> Result<Option<ClientScript>>,
    ) -> Result<Self> {
        let mut module = Self {
            entrypoints: entrypoints.to_vec(),
            ..Default::default()
        };
        let mut queue: Vec<(u32, bool)> = entrypoints.iter().map(|&id| (id, true)).collect();
        while let Some((id, entry)) = queue.pop() {
            if module.scripts.contains_key(&id) || (!entry && module.missing.contains(&id)) {
                continue;
            }
            let Some(script) = load(id)? else {
                if entry {
                    return Err(CoreError::Source(format!("entry script {id} not found")));
                }
                warn!(script = id, "called script is missing");
                module.missing.insert(id);
                continue;
            };
            let deps = script_deps(id, &script, registry)?;
            queue.extend(
                deps.scripts
                    .iter()
                    .filter(|callee| !module.scripts.contains_key(callee))
                    .map(|&callee| (callee, false)),
            );
            module.scripts.insert(id, ModuleScript { script, deps });
            if module.scripts.len() % 100 == 0 {
                info!(scripts = module.scripts.len(), queued = queue.len(), "extracting module");
            }
        }
        Ok(module)
    }

    /// Read scripts straight from a cache with a calibrated registry.
    /// Callees that fail to load become stubs.
    pub fn from_source(source: &dyn CacheSource, registry: &OpcodeRegistry, entrypoints: &[u32]) -> Result<Self> {
        Self::extract(registry, entrypoints, |id| {
            match source.get_file(CLIENTSCRIPT_MAJOR, id, None) {
                Ok(data) => registry.read(&data).map(Some),
                Err(e) => {
                    warn!(script = id, error = %e, "failed to fetch script");
                    Ok(None)
                }
            }
        })
    }

    /// Use the decoded candidates of a finished calibration.
    pub fn from_calibrator(calibrator: &Calibrator, entrypoints: &[u32]) -> Result<Self> {
        Self::extract(calibrator.registry(), entrypoints, |id| {
            Ok(calibrator.candidate(id).and_then(|c| c.script.clone()))
        })
    }

    /// Every call between loaded scripts and from loaded scripts to
    /// missing ones.
    pub fn call_graph(&self) -> Vec<CallEdge> {
        self.scripts
            .iter()
            .flat_map(|(&caller, s)| {
                s.deps.scripts.iter().map(move |&callee| CallEdge {
                    caller: Some(caller),
                    callee,
                })
            })
            .collect()
    }

    /// Spanning tree of the loaded scripts that reaches each one over its
    /// shortest call chain from an entry point.
    pub fn call_tree(&self) -> Vec<CallEdge> {
        let mut seen = BTreeSet::new();
        let mut queue = VecDeque::new();
        let mut edges = Vec::new();
        for &id in &self.entrypoints {
            if self.scripts.contains_key(&id) && seen.insert(id) {
                edges.push(CallEdge { caller: None, callee: id });
                queue.push_back(id);
            }
        }
        while let Some(id) = queue.pop_front() {
            let Some(s) = self.scripts.get(&id) else {
                continue;
            };
            for &callee in &s.deps.scripts {
                if self.scripts.contains_key(&callee) && seen.insert(callee) {
                    edges.push(CallEdge {
                        caller: Some(id),
                        callee,
                    });
                    queue.push_back(callee);
                }
            }
        }
        edges
    }

    /// Render the module as pseudo-source: stubs for missing scripts,
    /// declarations of the variables used, then every script by id.
    pub fn render(&self, registry: &OpcodeRegistry) -> Result<String> {
        let mut out = String::new();
        for id in &self.missing {
            let _ = writeln!(out, "function script{id}(...args: unknown[]) {{}}");
        }
        out.push('\n');

        let vars: BTreeSet<i32> = self.scripts.values().flat_map(|s| s.deps.vars.iter().copied()).collect();
        for imm in vars {
            let ty = registry
                .symbols
                .var(imm)
                .map_or_else(|| "unknown".to_string(), |v| v.subtype.name());
            let _ = writeln!(out, "var {}: {ty};", var_name(registry, imm));
        }
        let varbits: BTreeSet<i32> = self.scripts.values().flat_map(|s| s.deps.varbits.iter().copied()).collect();
        for imm in varbits {
            let _ = writeln!(out, "var varbit_{}: int;", imm >> 8);
        }
        out.push('\n');

        for (&id, s) in &self.scripts {
            let (ast, root) = decompile(id, &s.script, registry)?;
            let _ = writeln!(out, "{}\n", render(&ast, root, registry));
        }
        Ok(out)
    }
}

/// `from,to` lines with `-1` standing for the entry point caller.
pub fn call_graph_csv(edges: &[CallEdge]) -> String {
    let mut out = String::from("from,to\n");
    for e in edges {
        let caller = e.caller.map_or(-1, i64::from);
        let _ = writeln!(out, "{caller},{}", e.callee);
    }
    out
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::ops::named::{POPDISCARDINT, PUSHINT, RETURN};
    use crate::ops::Operation;
    use crate::stack::StackInOut;
    use crate::subtypes::Subtype;
    use crate::symbols::{SymbolTables, VarInfo};
    use cs2script::BuildNumber;

    const HEALTH: i32 = (1 << 24) | (7 << 8);

    fn registry() -> OpcodeRegistry {
        let mut reg = OpcodeRegistry::unscrambled(BuildNumber(900));
        for id in [1, 2, 3, 99] {
            reg.scripts.insert(id, StackInOut::of(&[], &[]));
        }
        reg.symbols.vars.insert(
            SymbolTables::var_key(1, 7),
            VarInfo {
                name: Some("health".into()),
                subtype: Subtype::INT,
            },
        );
        reg
    }

    fn script(ops: Vec<Operation>) -> ClientScript {
        ClientScript {
            header: Default::default(),
            ops,
        }
    }

    /// 1 calls 2, 2 calls 3, 3 calls back into 1 and into the missing 99.
    fn cyclic_chain() -> BTreeMap<u32, ClientScript> {
        BTreeMap::from([
            (1, script(vec![Operation::new(GOSUB, 2), Operation::new(RETURN, 0)])),
            (
                2,
                script(vec![
                    Operation::new(PUSHVAR, HEALTH),
                    Operation::new(POPVAR, HEALTH),
                    Operation::new(GOSUB, 3),
                    Operation::new(RETURN, 0),
                ]),
            ),
            (
                3,
                script(vec![
                    Operation::new(GOSUB, 1),
                    Operation::new(GOSUB, 99),
                    Operation::new(RETURN, 0),
                ]),
            ),
        ])
    }

    fn extract(entries: &[u32]) -> Result<IsolatedModule> {
        let scripts = cyclic_chain();
        IsolatedModule::extract(&registry(), entries, |id| Ok(scripts.get(&id).cloned()))
    }

    #[test]
    fn callees_are_pulled_in_through_cycles() {
        let module = extract(&[1]).unwrap();
        assert_eq!(module.scripts.keys().copied().collect::<Vec<_>>(), [1, 2, 3]);
        assert_eq!(module.missing, BTreeSet::from([99]));
        assert_eq!(module.scripts[&2].deps.vars, BTreeSet::from([HEALTH]));

        let edge = |caller, callee| CallEdge { caller, callee };
        assert_eq!(
            module.call_graph(),
            [
                edge(Some(1), 2),
                edge(Some(2), 3),
                edge(Some(3), 1),
                edge(Some(3), 99),
            ]
        );
        assert_eq!(
            call_graph_csv(&module.call_tree()),
            "from,to\n-1,1\n1,2\n2,3\n"
        );
    }

    #[test]
    fn tree_takes_the_shortest_chain() {
        // entering at 3 reaches 1 directly, 2 only through 1
        let module = extract(&[3]).unwrap();
        let tree = module.call_tree();
        assert_eq!(call_graph_csv(&tree), "from,to\n-1,3\n3,1\n1,2\n");
    }

    #[test]
    fn missing_entry_point_is_an_error() {
        assert!(matches!(extract(&[1, 42]), Err(CoreError::Source(_))));
        // 99 is first seen as a missing callee of 3, then as an entry
        assert!(matches!(extract(&[99, 1]), Err(CoreError::Source(_))));
    }

    #[test]
    fn constant_lookup_ids_are_recorded() {
        let reg = registry();
        let s = script(vec![
            // enum_getvalue(int, string, enum 77, key 5)
            Operation::push_int(0),
            Operation::push_int(36),
            Operation::push_int(77),
            Operation::push_int(5),
            Operation::new(ENUM_GETVALUE, 0),
            // struct_getparam(struct 300, param 12)
            Operation::push_int(300),
            Operation::push_int(12),
            Operation::new(STRUCT_GETPARAM, 0),
            Operation::new(POPDISCARDINT, 0),
            Operation::new(PUSHVARBIT, 0x0501),
            Operation::new(POPDISCARDINT, 0),
            Operation::new(RETURN, 0),
        ]);
        let deps = script_deps(4, &s, &reg).unwrap();
        assert_eq!(deps.enums, BTreeSet::from([77]));
        assert_eq!(deps.structs, BTreeSet::from([300]));
        assert_eq!(deps.params, BTreeSet::from([12]));
        assert_eq!(deps.varbits, BTreeSet::from([0x0501]));
        assert!(deps.scripts.is_empty());
    }

    #[test]
    fn computed_ids_record_nothing() {
        let reg = registry();
        let s = script(vec![
            Operation::push_int(0),
            Operation::push_int(36),
            Operation::new(PUSHVAR, HEALTH),
            Operation::new(PUSHINT, 5),
            Operation::new(ENUM_GETVALUE, 0),
            Operation::new(RETURN, 0),
        ]);
        assert!(script_deps(4, &s, &reg).unwrap().enums.is_empty());
    }

    #[test]
    fn module_renders_stubs_vars_and_scripts() {
        let reg = registry();
        let module = extract(&[1]).unwrap();
        let text = module.render(&reg).unwrap();
        assert!(text.starts_with("function script99(...args: unknown[]) {}\n"), "{text}");
        assert!(text.contains("var varhealth_7: int;\n"), "{text}");
        for id in [1, 2, 3] {
            assert!(text.contains(&format!("function script{id}(): void {{")), "{text}");
        }
    }
}
