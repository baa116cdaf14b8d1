use cs2_core::ast::{decompile, Ast, FunctionDef, NodeId, NodeKind};
use cs2_core::cfg::Cfg;
use cs2_core::compile::compile;
use cs2_core::interpreter::Interpreter;
use cs2_core::ops::named::{BRANCH_LT, JUMP, MINUS, PLUS, POPLOCALINT, PUSHCONST, PUSHLOCALINT, RETURN, SWITCH};
use cs2_core::ops::OpcodeInfo;
use cs2_core::render::render;
use cs2_core::stack::{StackDiff, StackInOut, StackType};
use cs2_core::{ClientScript, OpcodeRegistry, Operation};
use cs2script::{BuildNumber, ImmediateKind, ScriptHeader, SlotCounts, SwitchCase};

fn registry() -> OpcodeRegistry {
    let mut reg = OpcodeRegistry::unscrambled(BuildNumber(900));
    reg.insert(OpcodeInfo::new(0x93, PUSHCONST, &[ImmediateKind::Switch]));
    for (raw, id) in [(0x90, PLUS), (0x91, MINUS)] {
        reg.insert(OpcodeInfo::new(raw, id, &[ImmediateKind::Byte]));
        if let Some(info) = reg.get_mut(id) {
            info.stack = StackInOut::of(&[StackType::Int, StackType::Int], &[StackType::Int]);
        }
    }
    reg.scripts.insert(1, StackInOut::of(&[], &[StackType::Int]));
    reg
}

fn with_locals(ops: Vec<Operation>) -> ClientScript {
    ClientScript {
        header: ScriptHeader {
            locals: SlotCounts { int: 1, long: 0, string: 0 },
            ..Default::default()
        },
        ops,
    }
}

/// `if (local0 < 5) { local0 = local0 - 1 } return local0 + 1`
fn branchy() -> ClientScript {
    with_locals(vec![
        Operation::new(PUSHLOCALINT, 0),
        Operation::push_int(5),
        Operation::new(BRANCH_LT, 1),
        Operation::new(JUMP, 4),
        Operation::new(PUSHLOCALINT, 0),
        Operation::push_int(1),
        Operation::new(MINUS, 0),
        Operation::new(POPLOCALINT, 0),
        Operation::new(PUSHLOCALINT, 0),
        Operation::push_int(1),
        Operation::new(PLUS, 0),
        Operation::new(RETURN, 0),
    ])
}

fn switchy() -> ClientScript {
    let mut s = with_locals(vec![
        Operation::new(PUSHLOCALINT, 0),
        Operation::new(SWITCH, 0),
        Operation::push_int(0),
        Operation::new(RETURN, 0),
        Operation::push_int(10),
        Operation::new(RETURN, 0),
        Operation::push_int(20),
        Operation::new(RETURN, 0),
    ]);
    s.header.switches = vec![vec![SwitchCase { value: 1, jump: 2 }, SwitchCase { value: 2, jump: 4 }]];
    s
}

#[test]
fn blocks_cover_every_instruction() {
    for script in [branchy(), switchy()] {
        let cfg = Cfg::build(&script).unwrap();
        let covered: usize = cfg.blocks.iter().map(|(_, b)| b.len()).sum();
        assert_eq!(covered, script.ops.len());
        for i in 0..script.ops.len() {
            assert!(cfg.block_of(i).is_some(), "instruction {i} has no block");
        }
    }
}

#[test]
fn bytes_survive_decompile_and_compile() {
    let mut reg = registry();
    for script in [branchy(), switchy()] {
        let bytes = reg.encode(&script).unwrap();
        let decoded = reg.decode(&bytes).unwrap();
        let (ast, root) = decompile(1, &decoded, &reg).unwrap();
        let compiled = compile(&ast, root, &reg).unwrap();
        assert_eq!(compiled.ops, script.ops);
        assert_eq!(reg.encode(&compiled).unwrap(), bytes);
    }
}

#[test]
fn compiled_script_behaves_like_the_original() {
    let reg = registry();
    let original = branchy();
    let (ast, root) = decompile(1, &original, &reg).unwrap();
    let compiled = compile(&ast, root, &reg).unwrap();
    for (arg, expected) in [(3, 3), (9, 10)] {
        for script in [&original, &compiled] {
            let mut it = Interpreter::new(&reg, script).with_args(cs2_core::interpreter::Values {
                int: vec![arg],
                ..Default::default()
            });
            it.run(100).unwrap();
            assert_eq!(it.stack.int, [expected], "local0 = {arg}");
        }
    }
}

#[test]
fn decompiled_source_reads_naturally() {
    let reg = registry();
    let (ast, root) = decompile(1, &branchy(), &reg).unwrap();
    let text = render(&ast, root, &reg);
    assert!(text.starts_with("function script1(): int {"), "{text}");
    assert!(text.contains("if (int0 < 5) {"), "{text}");
    assert!(text.contains("int0 = (int0 - 1);"), "{text}");
    assert!(text.contains("return (int0 + 1);"), "{text}");
}

// -------------------------------------------------------------------------
// Emulated calls
// -------------------------------------------------------------------------

fn function(ast: &mut Ast, name: &str, args: &[StackType], returns: &[StackType], locals: StackDiff) -> (NodeId, NodeId) {
    let def = FunctionDef {
        name: name.into(),
        args: args.iter().copied().collect(),
        returns: returns.iter().copied().collect(),
        locals,
    };
    let func = ast.add(NodeKind::Function(def), None);
    let body = ast.code_block(0, 0);
    ast.push(func, body).unwrap();
    (func, body)
}

fn returning(ast: &mut Ast, value: NodeId) -> NodeId {
    ast.add_with(NodeKind::RawOp(Operation::new(RETURN, 0)), &[value]).unwrap()
}

#[test]
fn unit_functions_run_in_the_interpreter() {
    // function script1(): int { return double(3) + 1 }
    // function double(int0: int): int { return int0 + int0 }
    let reg = registry();
    let mut ast = Ast::new();
    let (root, main) = function(&mut ast, "script1", &[], &[StackType::Int], StackDiff::new(1, 0, 0, 0));
    let (helper, helper_body) = function(&mut ast, "double", &[StackType::Int], &[StackType::Int], StackDiff::new(1, 0, 0, 0));

    let a = ast.raw(Operation::new(PUSHLOCALINT, 0));
    let b = ast.raw(Operation::new(PUSHLOCALINT, 0));
    let sum = ast.add_with(NodeKind::RawOp(Operation::new(PLUS, 0)), &[a, b]).unwrap();
    let ret = returning(&mut ast, sum);
    ast.push(helper_body, ret).unwrap();

    let three = ast.raw(Operation::push_int(3));
    let call = ast.add_with(NodeKind::Subcall { name: "double".into() }, &[three]).unwrap();
    let one = ast.raw(Operation::push_int(1));
    let plus = ast.add_with(NodeKind::RawOp(Operation::new(PLUS, 0)), &[call, one]).unwrap();
    let ret = returning(&mut ast, plus);
    ast.push_list(main, &[helper, ret]).unwrap();

    let compiled = compile(&ast, root, &reg).unwrap();
    let mut it = Interpreter::new(&reg, &compiled).with_args(cs2_core::interpreter::Values {
        int: vec![42],
        ..Default::default()
    });
    it.run(1000).unwrap();
    assert_eq!(it.stack.int, [7], "{}", it.dump());
    assert!(it.stack.string.is_empty());
    // the caller's local survives the call
    assert_eq!(it.locals.int[0], 42);
    assert!(it.messages.is_empty());
}

#[test]
fn opnametoid_intrinsic_runs_in_the_interpreter() {
    let reg = registry();
    let mut ast = Ast::new();
    let (root, main) = function(&mut ast, "script1", &[], &[StackType::Int], StackDiff::default());
    let name = ast.raw(Operation::push_string("minus"));
    let call = ast.add_with(NodeKind::Intrinsic { name: "opnametoid".into() }, &[name]).unwrap();
    let ret = returning(&mut ast, call);
    ast.push(main, ret).unwrap();

    let compiled = compile(&ast, root, &reg).unwrap();
    let mut it = Interpreter::new(&reg, &compiled);
    it.run(10_000).unwrap();
    assert_eq!(it.stack.int, [MINUS as i32]);
}

#[test]
fn calling_an_undefined_function_fails() {
    let reg = registry();
    let mut ast = Ast::new();
    let (root, main) = function(&mut ast, "script1", &[], &[], StackDiff::default());
    let call = ast.add_with(NodeKind::Subcall { name: "missing".into() }, &[]).unwrap();
    ast.push(main, call).unwrap();
    assert!(compile(&ast, root, &reg).is_err());
}

// -------------------------------------------------------------------------
// Cache fixtures
// -------------------------------------------------------------------------

fn fixture_dir() -> Option<std::path::PathBuf> {
    let dir = std::env::var_os("CS2_FIXTURES")
        .map(std::path::PathBuf::from)
        .unwrap_or_else(|| format!("{}/cs2/build668", env!("HOME")).into());
    dir.is_dir().then_some(dir)
}

#[test]
fn unscrambled_cache_decompiles() {
    let Some(dir) = fixture_dir() else {
        eprintln!("skipping: no build 668 script fixtures");
        return;
    };
    let mut reg = OpcodeRegistry::unscrambled(BuildNumber(668));
    let mut decompiled = 0;
    let mut failed = 0;
    for entry in std::fs::read_dir(&dir).expect("failed to list fixtures") {
        let path = entry.expect("bad dir entry").path();
        let data = std::fs::read(&path).expect("failed to read fixture");
        let Ok(script) = reg.decode(&data) else {
            failed += 1;
            continue;
        };
        let cfg = Cfg::build(&script).unwrap_or_else(|e| panic!("{}: {e}", path.display()));
        let covered: usize = cfg.blocks.iter().map(|(_, b)| b.len()).sum();
        assert_eq!(covered, script.ops.len(), "{}", path.display());
        match decompile(0, &script, &reg) {
            Ok(_) => decompiled += 1,
            Err(_) => failed += 1,
        }
    }
    eprintln!("decompiled {decompiled} scripts, {failed} failed");
}
