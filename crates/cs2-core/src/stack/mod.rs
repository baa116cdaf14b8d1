//! Stack type model: counts of values per primitive stack, ordered slot
//! lists and exact subtype stacks.
//!
//! The VM keeps three separate value stacks (int, long, string). `vararg`
//! is a pseudo stack used for bound-function argument packs; it has no VM
//! representation and must be resolved before code is emitted.

mod diff;
mod inout;
mod list;

pub use diff::StackDiff;
pub use inout::{ExactStack, StackInOut};
pub use list::{is_vararg_tag, vararg_type, StackList, StackSlot};

use serde::{Deserialize, Serialize};

/// One of the three VM value stacks.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum PrimitiveType {
    Int,
    Long,
    String,
}

impl PrimitiveType {
    pub const ALL: [PrimitiveType; 3] = [PrimitiveType::Int, PrimitiveType::Long, PrimitiveType::String];

    pub fn name(self) -> &'static str {
        match self {
            PrimitiveType::Int => "int",
            PrimitiveType::Long => "long",
            PrimitiveType::String => "string",
        }
    }
}

impl std::fmt::Display for PrimitiveType {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.name())
    }
}

/// A primitive stack or the vararg pseudo stack.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum StackType {
    Int,
    Long,
    String,
    Vararg,
}

impl StackType {
    pub fn primitive(self) -> Option<PrimitiveType> {
        match self {
            StackType::Int => Some(PrimitiveType::Int),
            StackType::Long => Some(PrimitiveType::Long),
            StackType::String => Some(PrimitiveType::String),
            StackType::Vararg => None,
        }
    }

    pub fn name(self) -> &'static str {
        match self {
            StackType::Int => "int",
            StackType::Long => "long",
            StackType::String => "string",
            StackType::Vararg => "vararg",
        }
    }
}

impl From<PrimitiveType> for StackType {
    fn from(p: PrimitiveType) -> Self {
        match p {
            PrimitiveType::Int => StackType::Int,
            PrimitiveType::Long => StackType::Long,
            PrimitiveType::String => StackType::String,
        }
    }
}
