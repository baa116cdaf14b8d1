use serde::{Deserialize, Serialize};

/// Client build number of the cache a script was taken from.
///
/// Known format boundaries:
/// - up to 668: opcodes are stored unscrambled
/// - 751: `pushint`/`pushlong`/`pushstring` merged into one tagged `pushconst`
///   and var ops switched to the `(domain << 24) | (id << 8)` immediate layout
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct BuildNumber(pub u32);

impl BuildNumber {
    pub const LAST_UNSCRAMBLED: Self = Self(668);
    pub const UNIFIED_PUSH_CONST: Self = Self(751);

    /// Whether raw opcode ids are scrambled per build.
    pub fn is_scrambled(self) -> bool {
        self > Self::LAST_UNSCRAMBLED
    }

    /// Whether constants are pushed through the tagged `pushconst` op.
    pub fn has_unified_push_const(self) -> bool {
        self >= Self::UNIFIED_PUSH_CONST
    }
}

impl std::fmt::Display for BuildNumber {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.0)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn boundaries() {
        assert!(!BuildNumber(668).is_scrambled());
        assert!(BuildNumber(669).is_scrambled());
        assert!(!BuildNumber(750).has_unified_push_const());
        assert!(BuildNumber(751).has_unified_push_const());
    }
}
