use std::collections::BTreeMap;
use std::path::Path;

use cs2script::{BuildNumber, ImmediateKind, ImmediateLookup, Instruction, Script};
use serde::{Deserialize, Serialize};
use tracing::warn;

use super::named::{self, OpId};
use super::{ClientScript, Operation};
use crate::error::{CoreError, Result};
use crate::stack::StackInOut;
use crate::symbols::SymbolTables;

/// What is known about one raw opcode of a cache.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct OpcodeInfo {
    pub raw_id: u16,
    pub id: OpId,
    /// Remaining candidate immediate kinds, sorted.
    pub possible_kinds: Vec<ImmediateKind>,
    /// Set once exactly one candidate is left.
    pub kind: Option<ImmediateKind>,
    #[serde(default)]
    pub stack: StackInOut,
}

impl OpcodeInfo {
    pub fn new(raw_id: u16, id: OpId, kinds: &[ImmediateKind]) -> Self {
        let mut possible_kinds = kinds.to_vec();
        possible_kinds.sort();
        possible_kinds.dedup();
        let kind = match possible_kinds.as_slice() {
            [only] => Some(*only),
            _ => None,
        };
        let stack = named::structural_stack(id).unwrap_or_default();
        Self {
            raw_id,
            id,
            possible_kinds,
            kind,
            stack,
        }
    }

    /// Drop candidate kinds not in `allowed`; returns how many were dropped.
    pub fn retain_kinds(&mut self, allowed: &[ImmediateKind]) -> usize {
        let before = self.possible_kinds.len();
        self.possible_kinds.retain(|k| allowed.contains(k));
        if let ([only], None) = (self.possible_kinds.as_slice(), self.kind) {
            self.kind = Some(*only);
        }
        before - self.possible_kinds.len()
    }
}

/// Raw opcode to canonical operation mapping of one cache build, plus the
/// per-script signatures discovered alongside it.
#[derive(Debug, Clone)]
pub struct OpcodeRegistry {
    pub build: BuildNumber,
    by_raw: BTreeMap<u16, OpId>,
    ops: BTreeMap<OpId, OpcodeInfo>,
    next_id: OpId,
    /// Frozen: no new mappings are expected.
    pub calibrated: bool,
    /// Script id to argument/return stack.
    pub scripts: BTreeMap<u32, StackInOut>,
    pub symbols: SymbolTables,
}

#[derive(Serialize, Deserialize)]
struct RegistryFile {
    build: BuildNumber,
    mappings: Vec<OpcodeInfo>,
    next_id: OpId,
    scripts: Vec<ScriptEntry>,
}

#[derive(Serialize, Deserialize)]
struct ScriptEntry {
    id: u32,
    stack: StackInOut,
}

impl OpcodeRegistry {
    pub fn new(build: BuildNumber) -> Self {
        Self {
            build,
            by_raw: BTreeMap::new(),
            ops: BTreeMap::new(),
            next_id: named::FIRST_GENERATED_ID,
            calibrated: false,
            scripts: BTreeMap::new(),
            symbols: SymbolTables::default(),
        }
    }

    /// Mappings of a cache from before opcode scrambling: every raw id
    /// below 0x80 is its own canonical id.
    pub fn unscrambled(build: BuildNumber) -> Self {
        let mut reg = Self::new(build);
        for raw in 0..0x80u16 {
            let id = raw as OpId;
            reg.insert(OpcodeInfo::new(raw, id, &[named::default_kind(id)]));
        }
        reg.calibrated = true;
        reg
    }

    pub fn len(&self) -> usize {
        self.ops.len()
    }

    pub fn is_empty(&self) -> bool {
        self.ops.is_empty()
    }

    pub fn next_id(&self) -> OpId {
        self.next_id
    }

    pub fn set_next_id(&mut self, id: OpId) {
        self.next_id = id;
    }

    pub fn get(&self, id: OpId) -> Option<&OpcodeInfo> {
        self.ops.get(&id)
    }

    pub fn get_mut(&mut self, id: OpId) -> Option<&mut OpcodeInfo> {
        self.ops.get_mut(&id)
    }

    pub fn by_raw(&self, raw: u16) -> Option<&OpcodeInfo> {
        self.by_raw.get(&raw).and_then(|id| self.ops.get(id))
    }

    pub fn iter(&self) -> impl Iterator<Item = &OpcodeInfo> {
        self.ops.values()
    }

    /// Stack effect of `id`, if fully known.
    pub fn stack_of(&self, id: OpId) -> Option<&StackInOut> {
        self.ops
            .get(&id)
            .map(|info| &info.stack)
            .filter(|s| s.initialized_through)
    }

    /// Insert or replace a mapping, keeping both directions consistent.
    pub fn insert(&mut self, info: OpcodeInfo) {
        if let Some(old) = self.ops.get(&info.id) {
            if old.raw_id != info.raw_id {
                self.by_raw.remove(&old.raw_id);
            }
        }
        if let Some(old_id) = self.by_raw.insert(info.raw_id, info.id) {
            if old_id != info.id {
                self.ops.remove(&old_id);
            }
        }
        self.ops.insert(info.id, info);
    }

    /// Allocate a fresh canonical id for a raw opcode nobody knows yet.
    pub fn declare_op(&mut self, raw: u16, kinds: &[ImmediateKind]) -> Result<OpId> {
        if self.by_raw.contains_key(&raw) {
            return Err(CoreError::Calibration(format!("op {raw} already exists")));
        }
        while self.ops.contains_key(&self.next_id) {
            self.next_id += 1;
        }
        let id = self.next_id;
        self.next_id += 1;
        self.insert(OpcodeInfo::new(raw, id, kinds));
        Ok(id)
    }

    /// Give every mapped structural op its fixed stack effect.
    pub fn seed_structural_stacks(&mut self) {
        for info in self.ops.values_mut() {
            if !info.stack.initialized_through {
                if let Some(io) = named::structural_stack(info.id) {
                    info.stack = io;
                }
            }
        }
    }

    fn kind_of_raw(&self, raw: u16) -> ImmediateKind {
        match self.by_raw(raw) {
            Some(info) => info
                .kind
                .or_else(|| info.possible_kinds.first().copied())
                .unwrap_or(ImmediateKind::Byte),
            None => ImmediateKind::Byte,
        }
    }

    /// Decode a script blob into canonical operations. While calibrating,
    /// raw opcodes nobody has seen yet are declared with a byte immediate;
    /// a calibrated registry rejects them.
    pub fn decode(&mut self, data: &[u8]) -> Result<ClientScript> {
        if self.calibrated {
            return self.read(data);
        }
        let script = Script::read(data, self)?;
        self.canonical(script)
    }

    /// Decode against the frozen table. Any unmapped raw opcode is an error.
    pub fn read(&self, data: &[u8]) -> Result<ClientScript> {
        let mut unknown = None;
        let mut lookup = |raw: u16| {
            if self.by_raw.contains_key(&raw) {
                self.kind_of_raw(raw)
            } else {
                if unknown.is_none() {
                    unknown = Some(raw);
                }
                ImmediateKind::Byte
            }
        };
        let script = Script::read(data, &mut lookup);
        if let Some(raw) = unknown {
            return Err(CoreError::UnknownOpcode(raw as u32));
        }
        self.canonical(script?)
    }

    fn canonical(&self, script: Script) -> Result<ClientScript> {
        let ops = script
            .instructions
            .into_iter()
            .map(|inst| {
                let opcode = *self
                    .by_raw
                    .get(&inst.opcode)
                    .ok_or(CoreError::UnknownOpcode(inst.opcode as u32))?;
                Ok(Operation {
                    opcode,
                    imm: inst.imm,
                    payload: inst.payload,
                })
            })
            .collect::<Result<Vec<_>>>()?;
        Ok(ClientScript {
            header: script.header,
            ops,
        })
    }

    /// Encode canonical operations back into a script blob.
    pub fn encode(&self, script: &ClientScript) -> Result<Vec<u8>> {
        let instructions = script
            .ops
            .iter()
            .map(|op| {
                let info = self
                    .ops
                    .get(&op.opcode)
                    .ok_or(CoreError::UnknownOpcode(op.opcode))?;
                Ok(Instruction::new(info.raw_id, op.imm, op.payload.clone()))
            })
            .collect::<Result<Vec<_>>>()?;
        let raw = Script {
            header: script.header.clone(),
            instructions,
        };
        let mut lookup = |raw: u16| self.kind_of_raw(raw);
        Ok(raw.write(&mut lookup)?)
    }

    pub fn to_json(&self) -> Result<String> {
        let file = RegistryFile {
            build: self.build,
            mappings: self.ops.values().cloned().collect(),
            next_id: self.next_id,
            scripts: self
                .scripts
                .iter()
                .map(|(&id, stack)| ScriptEntry {
                    id,
                    stack: stack.clone(),
                })
                .collect(),
        };
        Ok(serde_json::to_string(&file)?)
    }

    /// Load a saved registry. Refuses files written for another build.
    pub fn from_json(json: &str, build: BuildNumber) -> Result<Self> {
        let file: RegistryFile = serde_json::from_str(json)?;
        if file.build != build {
            return Err(CoreError::BuildMismatch {
                expected: build.0,
                found: file.build.0,
            });
        }
        let mut reg = Self::new(build);
        for info in file.mappings {
            reg.insert(info);
        }
        reg.next_id = file.next_id;
        reg.scripts = file.scripts.into_iter().map(|e| (e.id, e.stack)).collect();
        reg.calibrated = true;
        Ok(reg)
    }

    pub fn save(&self, path: &Path) -> Result<()> {
        if let Some(dir) = path.parent() {
            std::fs::create_dir_all(dir)?;
        }
        std::fs::write(path, self.to_json()?)?;
        Ok(())
    }

    pub fn load(path: &Path, build: BuildNumber) -> Result<Self> {
        let json = std::fs::read_to_string(path)?;
        Self::from_json(&json, build)
    }

    /// Conventional file name for a build's registry.
    pub fn save_name(build: BuildNumber) -> String {
        format!("opcodes-build{build}.json")
    }
}

impl ImmediateLookup for OpcodeRegistry {
    fn immediate_kind(&mut self, raw: u16) -> ImmediateKind {
        if let Some(info) = self.by_raw(raw) {
            if let Some(kind) = info.kind {
                return kind;
            }
            let kind = info
                .possible_kinds
                .first()
                .copied()
                .unwrap_or(ImmediateKind::Byte);
            warn!(raw, id = info.id, %kind, "immediate kind not settled, guessing");
            return kind;
        }
        warn!(raw, "unknown opcode, assuming byte immediate");
        if let Err(e) = self.declare_op(raw, &[ImmediateKind::Byte]) {
            warn!(raw, error = %e, "failed to declare opcode");
        }
        ImmediateKind::Byte
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use cs2script::ScriptHeader;

    fn modern() -> OpcodeRegistry {
        let mut reg = OpcodeRegistry::new(BuildNumber(900));
        reg.insert(OpcodeInfo::new(0x1234, named::PUSHCONST, &[ImmediateKind::Switch]));
        reg.insert(OpcodeInfo::new(0x0007, named::PLUS, &[ImmediateKind::Byte]));
        reg.insert(OpcodeInfo::new(0x0100, named::RETURN, &[ImmediateKind::Byte]));
        reg.calibrated = true;
        reg
    }

    #[test]
    fn encode_decode_through_scrambled_ids() {
        let mut reg = modern();
        let script = ClientScript {
            header: ScriptHeader::default(),
            ops: vec![
                Operation::push_int(5),
                Operation::push_int(1),
                Operation::new(named::PLUS, 0),
                Operation::new(named::RETURN, 0),
            ],
        };
        let bytes = reg.encode(&script).unwrap();
        // header (17 bytes) then the first raw opcode
        assert_eq!(&bytes[17..19], &[0x12, 0x34]);
        let back = reg.decode(&bytes).unwrap();
        assert_eq!(back.ops, script.ops);
    }

    fn one_unknown_op() -> Vec<u8> {
        let mut w = cs2script::cursor::Writer::new();
        ScriptHeader {
            instruction_count: 1,
            ..Default::default()
        }
        .write(&mut w)
        .unwrap();
        w.write_u16(0x4321);
        w.write_u8(9);
        w.into_bytes()
    }

    #[test]
    fn unknown_raw_ops_are_declared_while_calibrating() {
        let mut reg = modern();
        reg.calibrated = false;
        let script = reg.decode(&one_unknown_op()).unwrap();
        assert_eq!(script.ops[0].opcode, named::FIRST_GENERATED_ID);
        assert_eq!(script.ops[0].imm, 9);
        assert_eq!(reg.by_raw(0x4321).map(|i| i.id), Some(named::FIRST_GENERATED_ID));
        assert!(reg.declare_op(0x4321, &[ImmediateKind::Int]).is_err());
    }

    #[test]
    fn calibrated_registry_rejects_unknown_raw_ops() {
        let mut reg = modern();
        let before = reg.len();
        assert!(matches!(
            reg.decode(&one_unknown_op()),
            Err(CoreError::UnknownOpcode(0x4321))
        ));
        assert_eq!(reg.len(), before);
        assert!(reg.by_raw(0x4321).is_none());
    }

    #[test]
    fn retain_settles_kind() {
        let mut info = OpcodeInfo::new(1, 20000, &ImmediateKind::DETECTABLE);
        assert_eq!(info.kind, None);
        assert_eq!(info.retain_kinds(&[ImmediateKind::Int, ImmediateKind::Long]), 3);
        assert_eq!(info.kind, Some(ImmediateKind::Int));
    }

    #[test]
    fn save_and_reload() {
        let mut reg = modern();
        reg.scripts.insert(
            12,
            StackInOut::of(&[crate::stack::StackType::Int], &[]),
        );
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join(OpcodeRegistry::save_name(reg.build));
        reg.save(&path).unwrap();

        let back = OpcodeRegistry::load(&path, BuildNumber(900)).unwrap();
        assert_eq!(back.by_raw(0x1234).map(|i| i.id), Some(named::PUSHCONST));
        assert_eq!(back.scripts.get(&12), reg.scripts.get(&12));
        assert!(matches!(
            OpcodeRegistry::load(&path, BuildNumber(901)),
            Err(CoreError::BuildMismatch { expected: 901, found: 900 })
        ));
    }

    #[test]
    fn unscrambled_special_cases() {
        let reg = OpcodeRegistry::unscrambled(BuildNumber(600));
        assert_eq!(reg.by_raw(0x03).and_then(|i| i.kind), Some(ImmediateKind::String));
        assert_eq!(reg.by_raw(0x15).and_then(|i| i.kind), Some(ImmediateKind::Byte));
        assert_eq!(reg.by_raw(0x21).and_then(|i| i.kind), Some(ImmediateKind::Int));
        assert!(reg.stack_of(named::POPLOCALINT).is_some());
    }
}
