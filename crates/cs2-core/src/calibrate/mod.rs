//! Opcode calibration: recovering the raw opcode table of a scrambled
//! cache build.
//!
//! Pipeline for one target cache:
//! 1. [`matching`]: scripts whose reference counterpart decodes byte for
//!    byte with the reference's immediate kinds confirm every raw opcode
//!    they contain
//! 2. [`immediates`]: a bounded search over immediate-kind interpretations
//!    narrows the kinds of opcodes no reference script contains
//! 3. [`stack_effects`]: per-block stack equations give each opcode its
//!    input and output lists
//!
//! Caches from before scrambling skip all of this and use the structural
//! table of [`OpcodeRegistry::unscrambled`].

mod dump;
pub mod immediates;
pub mod matching;
pub mod stack_effects;

pub use dump::{ReferenceDump, ReferenceScript};

use std::collections::BTreeMap;

use cs2script::{BuildNumber, RawScript, ScriptHeader};
use tracing::{debug, info, warn};

use crate::config::CalibrationConfig;
use crate::error::{CoreError, Result};
use crate::ops::{ClientScript, OpId, OpcodeRegistry};
use crate::solver::{detect_subtypes, SubtypeSolver};
use crate::source::{self, CacheSource};
use crate::stack::StackInOut;

/// One script of the target cache, as raw bytes plus what calibration has
/// learned about it so far.
#[derive(Debug, Clone)]
pub struct Candidate {
    pub id: u32,
    pub header: ScriptHeader,
    data: Vec<u8>,
    code_start: usize,
    /// Surviving interpretations in the last immediate search.
    pub solution_count: usize,
    /// Opcodes whose immediate kind this script could settle, in the order
    /// the last search met them.
    pub unknowns: Vec<OpId>,
    /// Confirmed by a reference script.
    pub matched: bool,
    /// Decoded once the registry can read it.
    pub script: Option<ClientScript>,
}

impl Candidate {
    pub fn parse(id: u32, data: Vec<u8>) -> Result<Self> {
        let raw = RawScript::parse(&data)?;
        let header = raw.header;
        let code_start = data.len() - raw.code.len();
        Ok(Self {
            id,
            header,
            data,
            code_start,
            solution_count: 0,
            unknowns: Vec::new(),
            matched: false,
            script: None,
        })
    }

    /// The whole script blob.
    pub fn data(&self) -> &[u8] {
        &self.data
    }

    /// The instruction stream.
    pub fn code(&self) -> &[u8] {
        &self.data[self.code_start..]
    }

    pub fn instruction_count(&self) -> usize {
        self.header.instruction_count as usize
    }
}

/// Drives calibration of one target cache.
#[derive(Debug)]
pub struct Calibrator {
    registry: OpcodeRegistry,
    candidates: BTreeMap<u32, Candidate>,
    pub config: CalibrationConfig,
}

impl Calibrator {
    pub fn new(build: BuildNumber, config: CalibrationConfig) -> Self {
        Self::with_registry(OpcodeRegistry::new(build), config)
    }

    /// Start from an existing registry, e.g. one loaded from disk.
    pub fn with_registry(registry: OpcodeRegistry, config: CalibrationConfig) -> Self {
        Self {
            registry,
            candidates: BTreeMap::new(),
            config,
        }
    }

    pub fn registry(&self) -> &OpcodeRegistry {
        &self.registry
    }

    pub fn into_registry(self) -> OpcodeRegistry {
        self.registry
    }

    pub fn candidates(&self) -> impl Iterator<Item = &Candidate> {
        self.candidates.values()
    }

    pub fn candidate(&self, id: u32) -> Option<&Candidate> {
        self.candidates.get(&id)
    }

    pub fn add_candidate(&mut self, id: u32, data: Vec<u8>) -> Result<()> {
        let cand = Candidate::parse(id, data)?;
        self.candidates.insert(id, cand);
        Ok(())
    }

    /// Fetch every script of `source` as a candidate. Scripts whose header
    /// cannot be parsed are logged and skipped.
    pub fn load_candidates(&mut self, source: &dyn CacheSource) -> Result<usize> {
        if source.build_number() != self.registry.build {
            return Err(CoreError::BuildMismatch {
                expected: self.registry.build.0,
                found: source.build_number().0,
            });
        }
        let files = source::fetch_scripts(source, self.config.fetch_workers)?;
        self.candidates.clear();
        for (id, data) in files {
            if let Err(e) = self.add_candidate(id, data) {
                warn!(script = id, error = %e, "unreadable script header");
            }
        }
        info!(count = self.candidates.len(), "loaded candidate scripts");
        Ok(self.candidates.len())
    }

    /// Decode every candidate the registry can read and record its
    /// argument/return signature. Returns the number of decoded scripts.
    pub fn parse_candidate_contents(&mut self) -> usize {
        let mut decoded = 0;
        for cand in self.candidates.values_mut() {
            if cand.script.is_none() {
                match self.registry.decode(cand.data()) {
                    Ok(script) => cand.script = Some(script),
                    Err(e) => debug!(script = cand.id, error = %e, "candidate does not decode yet"),
                }
            }
            let Some(script) = &cand.script else {
                continue;
            };
            decoded += 1;
            // the compiler does not keep return values in a fixed order, so
            // only their counts are kept
            let returns = script.return_type().to_diff().arglist();
            let args = script.arg_type().arglist();
            self.registry.scripts.insert(cand.id, StackInOut::new(args, returns));
        }
        decoded
    }

    /// Snapshot of the decoded candidates, to serve as the reference of
    /// another calibration.
    pub fn generate_dump(&mut self) -> ReferenceDump {
        self.parse_candidate_contents();
        let scripts: Vec<ReferenceScript> = self
            .candidates
            .values()
            .filter_map(|cand| {
                cand.script.as_ref().map(|s| ReferenceScript {
                    id: cand.id,
                    header: s.header.clone(),
                    ops: s.ops.clone(),
                })
            })
            .collect();
        info!(dumped = scripts.len(), total = self.candidates.len(), "generated reference dump");
        ReferenceDump::new(&self.registry, scripts)
    }

    /// Calibrate using the structural table when the build predates
    /// scrambling, otherwise against `reference`.
    pub fn calibrate(&mut self, reference: Option<&ReferenceDump>) -> Result<()> {
        if !self.registry.build.is_scrambled() {
            self.set_unscrambled_mappings();
            self.parse_candidate_contents();
            return Ok(());
        }
        if self.registry.calibrated {
            return Ok(());
        }
        let reference = reference.ok_or_else(|| {
            CoreError::Calibration(format!(
                "build {} is scrambled and needs a reference dump",
                self.registry.build
            ))
        })?;
        self.run_calibration(reference)
    }

    pub fn set_unscrambled_mappings(&mut self) {
        let mut reg = OpcodeRegistry::unscrambled(self.registry.build);
        reg.scripts = std::mem::take(&mut self.registry.scripts);
        reg.symbols = std::mem::take(&mut self.registry.symbols);
        self.registry = reg;
        for cand in self.candidates.values_mut() {
            cand.script = None;
        }
    }

    /// Full calibration of a scrambled build against `reference`.
    pub fn run_calibration(&mut self, reference: &ReferenceDump) -> Result<()> {
        let next = self.registry.next_id().max(reference.next_id);
        self.registry.set_next_id(next);

        matching::match_candidates(&mut self.registry, &mut self.candidates, reference, &self.config);
        immediates::find_immediates(&mut self.registry, &mut self.candidates, &self.config)?;
        self.registry.calibrated = true;
        self.registry.seed_structural_stacks();

        let decoded = self.parse_candidate_contents();
        info!(decoded, total = self.candidates.len(), "decoded candidates");
        stack_effects::find_stack_effects(&mut self.registry, &self.candidates, &self.config)?;
        Ok(())
    }

    /// Run the subtype solver over every decoded candidate and write the
    /// result into the registry.
    pub fn detect_subtypes(&mut self) -> Result<SubtypeSolver> {
        let scripts = self
            .candidates
            .values()
            .filter_map(|c| c.script.as_ref().map(|s| (c.id, s)));
        detect_subtypes(&mut self.registry, scripts)
    }
}
