use std::path::{Path, PathBuf};

use anyhow::{bail, Context, Result};
use clap::{Parser, Subcommand};
use cs2_core::ast::decompile;
use cs2_core::calibrate::{Calibrator, ReferenceDump};
use cs2_core::compile::compile;
use cs2_core::module::{call_graph_csv, IsolatedModule};
use cs2_core::render::render;
use cs2_core::source::{CacheSource, DirectorySource, CLIENTSCRIPT_MAJOR};
use cs2_core::{CalibrationConfig, OpcodeRegistry};
use cs2script::BuildNumber;
use tracing::{info, warn};
use tracing_subscriber::filter::EnvFilter;

#[derive(Parser)]
#[command(name = "cs2", about = "ClientScript decompiler, recompiler and opcode calibration")]
struct Cli {
    #[command(subcommand)]
    command: Command,
}

/// Options shared by commands that read scripts.
#[derive(clap::Args)]
struct Decoding {
    /// Build number of the cache the scripts come from.
    #[arg(long)]
    build: u32,
    /// Calibrated opcode registry. Required for scrambled builds.
    #[arg(long)]
    registry: Option<PathBuf>,
}

#[derive(Subcommand)]
enum Command {
    /// Print the operations of a script file.
    Decode {
        file: PathBuf,
        #[command(flatten)]
        decoding: Decoding,
    },
    /// Print a script file as pseudo-source.
    Decompile {
        file: PathBuf,
        /// Script id, used to look up its signature.
        #[arg(long, default_value_t = 0)]
        id: u32,
        #[command(flatten)]
        decoding: Decoding,
    },
    /// Decompile and recompile scripts, reporting those that change.
    Roundtrip {
        /// A script file or a directory of `<id>.bin` files.
        path: PathBuf,
        #[command(flatten)]
        decoding: Decoding,
    },
    /// Recover the opcode table of an extracted cache.
    Calibrate {
        /// Cache extracted as `<major>/<minor>.bin`.
        #[arg(long)]
        cache: PathBuf,
        #[arg(long)]
        build: u32,
        /// Reference dump of another build. Required for scrambled builds.
        #[arg(long)]
        reference: Option<PathBuf>,
        /// Calibration settings as JSON.
        #[arg(long)]
        config: Option<PathBuf>,
        /// Also infer exact subtypes.
        #[arg(long)]
        subtypes: bool,
        /// Where to write the registry.
        #[arg(long)]
        out: Option<PathBuf>,
    },
    /// Extract entry scripts with every script they call as one source file.
    Module {
        #[arg(long)]
        cache: PathBuf,
        /// Entry script ids.
        #[arg(required = true)]
        entries: Vec<u32>,
        #[command(flatten)]
        decoding: Decoding,
        /// Where to write the module source; stdout when omitted.
        #[arg(long)]
        out: Option<PathBuf>,
        /// Also write the shortest-path call tree as `from,to` lines.
        #[arg(long)]
        graph: Option<PathBuf>,
    },
    /// Decode a calibrated cache into a reference dump for other builds.
    DumpReference {
        #[arg(long)]
        cache: PathBuf,
        #[command(flatten)]
        decoding: Decoding,
        #[arg(long)]
        out: PathBuf,
    },
}

fn load_registry(decoding: &Decoding) -> Result<OpcodeRegistry> {
    let build = BuildNumber(decoding.build);
    match &decoding.registry {
        Some(path) => OpcodeRegistry::load(path, build)
            .with_context(|| format!("failed to load registry: {}", path.display())),
        None if !build.is_scrambled() => Ok(OpcodeRegistry::unscrambled(build)),
        None => bail!("build {build} is scrambled, pass --registry"),
    }
}

fn read_script(path: &Path) -> Result<Vec<u8>> {
    std::fs::read(path).with_context(|| format!("failed to read script: {}", path.display()))
}

fn cmd_decode(file: &Path, decoding: &Decoding) -> Result<()> {
    let mut registry = load_registry(decoding)?;
    let script = registry.decode(&read_script(file)?)?;
    let h = &script.header;
    println!(
        "args int={} long={} string={}  locals int={} long={} string={}",
        h.args.int, h.args.long, h.args.string, h.locals.int, h.locals.long, h.locals.string
    );
    for (i, table) in h.switches.iter().enumerate() {
        let cases: Vec<String> = table.iter().map(|c| format!("{}=>{:+}", c.value, c.jump)).collect();
        println!("switch {i}: {}", cases.join(" "));
    }
    for (i, op) in script.ops.iter().enumerate() {
        println!("{i:5} {op}");
    }
    Ok(())
}

fn cmd_decompile(file: &Path, id: u32, decoding: &Decoding) -> Result<()> {
    let mut registry = load_registry(decoding)?;
    let script = registry.decode(&read_script(file)?)?;
    let (ast, root) = decompile(id, &script, &registry)?;
    println!("{}", render(&ast, root, &registry));
    Ok(())
}

/// Script files under `path` with the id from their file name.
fn script_files(path: &Path) -> Result<Vec<(u32, PathBuf)>> {
    let id_of = |p: &Path| {
        p.file_stem()
            .and_then(|s| s.to_str())
            .and_then(|s| s.parse::<u32>().ok())
    };
    if path.is_file() {
        return Ok(vec![(id_of(path).unwrap_or(0), path.to_path_buf())]);
    }
    let mut files = Vec::new();
    for entry in std::fs::read_dir(path).with_context(|| format!("failed to list {}", path.display()))? {
        let file = entry?.path();
        if let Some(id) = id_of(&file) {
            files.push((id, file));
        }
    }
    files.sort();
    Ok(files)
}

fn cmd_roundtrip(path: &Path, decoding: &Decoding) -> Result<()> {
    let mut registry = load_registry(decoding)?;
    let (mut same, mut changed, mut failed) = (0, 0, 0);
    for (id, file) in script_files(path)? {
        let data = read_script(&file)?;
        let res = registry.decode(&data).map_err(anyhow::Error::from).and_then(|script| {
            let (ast, root) = decompile(id, &script, &registry)?;
            let compiled = compile(&ast, root, &registry)?;
            Ok(registry.encode(&compiled)?)
        });
        match res {
            Ok(bytes) if bytes == data => same += 1,
            Ok(_) => {
                changed += 1;
                info!(script = id, "script changed after recompiling");
            }
            Err(e) => {
                failed += 1;
                warn!(script = id, error = %e, "round trip failed");
            }
        }
    }
    println!("{same} identical, {changed} changed, {failed} failed");
    Ok(())
}

fn cmd_calibrate(
    cache: &Path,
    build: u32,
    reference: Option<&Path>,
    config: Option<&Path>,
    subtypes: bool,
    out: Option<&Path>,
) -> Result<()> {
    let build = BuildNumber(build);
    let config = match config {
        Some(path) => CalibrationConfig::load(path).with_context(|| format!("failed to load config: {}", path.display()))?,
        None => CalibrationConfig::default(),
    };
    let reference = reference
        .map(|p| ReferenceDump::load(p).with_context(|| format!("failed to load reference: {}", p.display())))
        .transpose()?;

    let source = DirectorySource::new(cache, build);
    let mut calibrator = Calibrator::new(build, config);
    let loaded = calibrator.load_candidates(&source)?;
    calibrator.calibrate(reference.as_ref())?;
    if subtypes {
        calibrator.detect_subtypes()?;
    }

    let decoded = calibrator.candidates().filter(|c| c.script.is_some()).count();
    let unsettled = calibrator.registry().iter().filter(|i| i.kind.is_none()).count();
    println!(
        "{decoded}/{loaded} scripts decode, {} opcodes known, {unsettled} without an immediate kind",
        calibrator.registry().len()
    );

    let out = out
        .map(Path::to_path_buf)
        .unwrap_or_else(|| PathBuf::from(OpcodeRegistry::save_name(build)));
    calibrator.into_registry().save(&out)?;
    println!("wrote {}", out.display());
    Ok(())
}

fn cmd_module(
    cache: &Path,
    entries: &[u32],
    decoding: &Decoding,
    out: Option<&Path>,
    graph: Option<&Path>,
) -> Result<()> {
    let registry = load_registry(decoding)?;
    let source = DirectorySource::new(cache, registry.build);
    let module = IsolatedModule::from_source(&source, &registry, entries)?;
    eprintln!(
        "[module] {} scripts, {} missing",
        module.scripts.len(),
        module.missing.len()
    );
    let text = module.render(&registry)?;
    match out {
        Some(path) => std::fs::write(path, text).with_context(|| format!("failed to write {}", path.display()))?,
        None => print!("{text}"),
    }
    if let Some(path) = graph {
        std::fs::write(path, call_graph_csv(&module.call_tree()))
            .with_context(|| format!("failed to write {}", path.display()))?;
    }
    Ok(())
}

fn cmd_dump_reference(cache: &Path, decoding: &Decoding, out: &Path) -> Result<()> {
    let registry = load_registry(decoding)?;
    let source = DirectorySource::new(cache, registry.build);
    if source.get_cache_index(CLIENTSCRIPT_MAJOR)?.is_empty() {
        bail!("no scripts under {}", source.file_path(CLIENTSCRIPT_MAJOR, 0).display());
    }
    let mut calibrator = Calibrator::with_registry(registry, CalibrationConfig::default());
    calibrator.load_candidates(&source)?;
    calibrator.calibrate(None)?;
    let dump = calibrator.generate_dump();
    dump.save(out)?;
    println!("wrote {} scripts to {}", dump.scripts.len(), out.display());
    Ok(())
}

fn main() -> Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::from_default_env().add_directive("info".parse()?))
        .with_writer(std::io::stderr)
        .init();

    let cli = Cli::parse();
    match &cli.command {
        Command::Decode { file, decoding } => cmd_decode(file, decoding),
        Command::Decompile { file, id, decoding } => cmd_decompile(file, *id, decoding),
        Command::Roundtrip { path, decoding } => cmd_roundtrip(path, decoding),
        Command::Calibrate {
            cache,
            build,
            reference,
            config,
            subtypes,
            out,
        } => cmd_calibrate(
            cache,
            *build,
            reference.as_deref(),
            config.as_deref(),
            *subtypes,
            out.as_deref(),
        ),
        Command::Module {
            cache,
            entries,
            decoding,
            out,
            graph,
        } => cmd_module(cache, entries, decoding, out.as_deref(), graph.as_deref()),
        Command::DumpReference { cache, decoding, out } => cmd_dump_reference(cache, decoding, out),
    }
}
