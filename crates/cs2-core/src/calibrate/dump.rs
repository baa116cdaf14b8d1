use std::collections::BTreeMap;
use std::path::Path;

use cs2script::{BuildNumber, ImmediateKind, ScriptHeader};
use serde::{Deserialize, Serialize};

use crate::error::Result;
use crate::ops::named::{self, OpId};
use crate::ops::{OpcodeInfo, OpcodeRegistry, Operation};

/// A decoded script of a calibrated cache.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ReferenceScript {
    pub id: u32,
    pub header: ScriptHeader,
    pub ops: Vec<Operation>,
}

/// Decoded scripts and opcode table of a calibrated cache, used as the
/// reference when calibrating another build.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ReferenceDump {
    pub build: BuildNumber,
    pub scripts: Vec<ReferenceScript>,
    pub mappings: Vec<OpcodeInfo>,
    pub next_id: OpId,
    #[serde(skip)]
    kinds: BTreeMap<OpId, ImmediateKind>,
}

impl ReferenceDump {
    pub fn new(registry: &OpcodeRegistry, scripts: Vec<ReferenceScript>) -> Self {
        let mut dump = Self {
            build: registry.build,
            scripts,
            mappings: registry.iter().cloned().collect(),
            next_id: registry.next_id(),
            kinds: BTreeMap::new(),
        };
        dump.index_kinds();
        dump
    }

    fn index_kinds(&mut self) {
        self.kinds = self
            .mappings
            .iter()
            .filter_map(|info| info.kind.map(|k| (info.id, k)))
            .collect();
    }

    /// Immediate kind of canonical op `id` in the reference build. Ops the
    /// reference never settled fall back to the kind implied by their id.
    pub fn kind_of(&self, id: OpId) -> ImmediateKind {
        self.kinds
            .get(&id)
            .copied()
            .unwrap_or_else(|| named::default_kind(id))
    }

    pub fn to_json(&self) -> Result<String> {
        Ok(serde_json::to_string(self)?)
    }

    pub fn from_json(json: &str) -> Result<Self> {
        let mut dump: Self = serde_json::from_str(json)?;
        dump.index_kinds();
        Ok(dump)
    }

    pub fn save(&self, path: &Path) -> Result<()> {
        if let Some(dir) = path.parent() {
            std::fs::create_dir_all(dir)?;
        }
        std::fs::write(path, self.to_json()?)?;
        Ok(())
    }

    pub fn load(path: &Path) -> Result<Self> {
        Self::from_json(&std::fs::read_to_string(path)?)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::ops::named::{PLUS, PUSHCONST, RETURN};

    #[test]
    fn kinds_survive_a_reload() {
        let mut reg = OpcodeRegistry::new(BuildNumber(900));
        reg.insert(OpcodeInfo::new(0x500, PUSHCONST, &[ImmediateKind::Switch]));
        reg.insert(OpcodeInfo::new(0x501, 20000, &[ImmediateKind::Int]));
        reg.insert(OpcodeInfo::new(0x502, 20001, &ImmediateKind::DETECTABLE));
        let script = ReferenceScript {
            id: 3,
            header: ScriptHeader::default(),
            ops: vec![
                Operation::push_int(1),
                Operation::new(PLUS, 0),
                Operation::new(RETURN, 0),
            ],
        };
        let dump = ReferenceDump::new(&reg, vec![script.clone()]);

        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("ref/dump.json");
        dump.save(&path).unwrap();
        let back = ReferenceDump::load(&path).unwrap();

        assert_eq!(back.build, BuildNumber(900));
        assert_eq!(back.scripts, [script]);
        assert_eq!(back.kind_of(20000), ImmediateKind::Int);
        // unsettled and unmapped ops use the structural default
        assert_eq!(back.kind_of(20001), ImmediateKind::Byte);
        assert_eq!(back.kind_of(0x21), ImmediateKind::Int);
        assert_eq!(back.kind_of(PUSHCONST), ImmediateKind::Switch);
    }
}
