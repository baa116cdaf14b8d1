//! Lookup tables supplied by the cache: client variables, params and
//! database fields. Only the subtype of each entry matters here.
//!
//! Missing entries are never an error; callers fall back to leaving the
//! affected operation unannotated.

use std::collections::BTreeMap;

use serde::{Deserialize, Serialize};

use crate::subtypes::Subtype;

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct VarInfo {
    #[serde(default)]
    pub name: Option<String>,
    pub subtype: Subtype,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct SymbolTables {
    /// Keyed by [`SymbolTables::var_key`].
    #[serde(default)]
    pub vars: BTreeMap<u32, VarInfo>,
    /// Param id to value subtype.
    #[serde(default)]
    pub params: BTreeMap<i32, Subtype>,
    /// Packed db field constant to the subtypes of one field tuple.
    #[serde(default)]
    pub db_fields: BTreeMap<i32, Vec<Subtype>>,
}

impl SymbolTables {
    pub fn var_key(domain: u8, id: u16) -> u32 {
        ((domain as u32) << 16) | id as u32
    }

    /// Variable referenced by a `pushvar`/`popvar` immediate, laid out as
    /// `(domain << 24) | (id << 8)`.
    pub fn var(&self, imm: i32) -> Option<&VarInfo> {
        let domain = ((imm >> 24) & 0xff) as u8;
        let id = ((imm >> 8) & 0xffff) as u16;
        self.vars.get(&Self::var_key(domain, id))
    }

    pub fn param(&self, id: i32) -> Option<Subtype> {
        self.params.get(&id).copied()
    }

    pub fn db_field(&self, field: i32) -> Option<&[Subtype]> {
        self.db_fields.get(&field).map(Vec::as_slice)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn var_immediate_layout() {
        let mut t = SymbolTables::default();
        t.vars.insert(
            SymbolTables::var_key(2, 300),
            VarInfo {
                name: None,
                subtype: Subtype::COMPONENT,
            },
        );
        let imm = (2 << 24) | (300 << 8);
        assert_eq!(t.var(imm).map(|v| v.subtype), Some(Subtype::COMPONENT));
        assert!(t.var(imm + (1 << 8)).is_none());
    }
}
