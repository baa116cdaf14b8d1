use serde::{Deserialize, Serialize};

use super::{PrimitiveType, StackList, StackType};
use crate::subtypes::Subtype;

/// Exact subtypes per primitive stack, bottom first.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct ExactStack {
    pub int: Vec<Subtype>,
    pub long: Vec<Subtype>,
    pub string: Vec<Subtype>,
}

impl ExactStack {
    pub fn from_list(types: &[Subtype]) -> Self {
        let mut res = Self::default();
        for &t in types {
            res.get_mut(t.primitive()).push(t);
        }
        res
    }

    pub fn get(&self, p: PrimitiveType) -> &Vec<Subtype> {
        match p {
            PrimitiveType::Int => &self.int,
            PrimitiveType::Long => &self.long,
            PrimitiveType::String => &self.string,
        }
    }

    pub fn get_mut(&mut self, p: PrimitiveType) -> &mut Vec<Subtype> {
        match p {
            PrimitiveType::Int => &mut self.int,
            PrimitiveType::Long => &mut self.long,
            PrimitiveType::String => &mut self.string,
        }
    }

    pub fn all(&self) -> impl Iterator<Item = Subtype> + '_ {
        self.int.iter().chain(&self.long).chain(&self.string).copied()
    }
}

/// Stack effect of an operation: what it pops (`input`) and pushes
/// (`output`), each bottom first.
///
/// During calibration the two sides are discovered separately, tracked by
/// the `initialized_*` flags; `initialized_through` means the effect is
/// fully known.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct StackInOut {
    #[serde(rename = "in")]
    pub input: StackList,
    #[serde(rename = "out")]
    pub output: StackList,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub exact_in: Option<ExactStack>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub exact_out: Option<ExactStack>,
    #[serde(default)]
    pub initialized_in: bool,
    #[serde(default)]
    pub initialized_out: bool,
    #[serde(default)]
    pub initialized_through: bool,
}

impl StackInOut {
    /// A fully known effect.
    pub fn new(input: StackList, output: StackList) -> Self {
        Self {
            input,
            output,
            exact_in: None,
            exact_out: None,
            initialized_in: true,
            initialized_out: true,
            initialized_through: true,
        }
    }

    pub fn of(input: &[StackType], output: &[StackType]) -> Self {
        Self::new(input.iter().copied().collect(), output.iter().copied().collect())
    }

    /// Known effect with exact subtypes on both sides.
    pub fn from_exact(input: &[Subtype], output: &[Subtype]) -> Self {
        let prims = |types: &[Subtype]| -> StackList {
            types.iter().map(|t| StackType::from(t.primitive())).collect()
        };
        let mut res = Self::new(prims(input), prims(output));
        res.exact_in = Some(ExactStack::from_list(input));
        res.exact_out = Some(ExactStack::from_list(output));
        res
    }

    pub fn total_change(&self) -> i32 {
        self.output.total() as i32 - self.input.total() as i32
    }
}

impl std::fmt::Display for StackInOut {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        if self.output.values.is_empty() {
            f.write_str("void")?;
        } else {
            write!(f, "{}", self.output)?;
        }
        if !self.initialized_through {
            f.write_str("??")?;
        }
        write!(f, "({})", self.input)
    }
}
