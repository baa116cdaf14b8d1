use std::ops::{Add, AddAssign, Sub, SubAssign};

use serde::{Deserialize, Serialize};

use super::{PrimitiveType, StackList, StackSlot, StackType};
use crate::error::{CoreError, Result};

/// Per-stack value counts. Used both for unordered blocks of values and for
/// net stack effects, so components may be negative.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct StackDiff {
    pub int: i32,
    pub long: i32,
    pub string: i32,
    pub vararg: i32,
}

impl StackDiff {
    pub const fn new(int: i32, long: i32, string: i32, vararg: i32) -> Self {
        Self {
            int,
            long,
            string,
            vararg,
        }
    }

    pub fn single(ty: StackType) -> Self {
        let mut d = Self::default();
        d.set(ty, 1);
        d
    }

    pub fn get(&self, ty: StackType) -> i32 {
        match ty {
            StackType::Int => self.int,
            StackType::Long => self.long,
            StackType::String => self.string,
            StackType::Vararg => self.vararg,
        }
    }

    pub fn set(&mut self, ty: StackType, value: i32) {
        match ty {
            StackType::Int => self.int = value,
            StackType::Long => self.long = value,
            StackType::String => self.string = value,
            StackType::Vararg => self.vararg = value,
        }
    }

    pub fn prim(&self, p: PrimitiveType) -> i32 {
        self.get(p.into())
    }

    pub fn min(self, other: Self) -> Self {
        Self::new(
            self.int.min(other.int),
            self.long.min(other.long),
            self.string.min(other.string),
            self.vararg.min(other.vararg),
        )
    }

    pub fn max(self, other: Self) -> Self {
        Self::new(
            self.int.max(other.int),
            self.long.max(other.long),
            self.string.max(other.string),
            self.vararg.max(other.vararg),
        )
    }

    pub fn mult(self, n: i32) -> Self {
        Self::new(self.int * n, self.long * n, self.string * n, self.vararg * n)
    }

    /// Divide every component by `n`; fails if any component would leave a
    /// remainder.
    pub fn int_div(self, n: i32) -> Result<Self> {
        let parts = [self.int, self.long, self.string, self.vararg];
        if n == 0 || parts.iter().any(|p| p % n != 0) {
            return Err(CoreError::StackRemainder {
                diff: self,
                divisor: n,
            });
        }
        Ok(Self::new(self.int / n, self.long / n, self.string / n, self.vararg / n))
    }

    pub fn lteq(&self, other: &Self) -> bool {
        self.int <= other.int
            && self.long <= other.long
            && self.string <= other.string
            && self.vararg <= other.vararg
    }

    pub fn is_empty(&self) -> bool {
        *self == Self::default()
    }

    pub fn is_non_negative(&self) -> bool {
        self.int >= 0 && self.long >= 0 && self.string >= 0 && self.vararg >= 0
    }

    pub fn total(&self) -> i32 {
        self.int + self.long + self.string + self.vararg
    }

    /// The single primitive stack touched, if exactly one is.
    pub fn mono_type(&self) -> Option<PrimitiveType> {
        match (self.int != 0, self.long != 0, self.string != 0, self.vararg != 0) {
            (true, false, false, false) => Some(PrimitiveType::Int),
            (false, true, false, false) => Some(PrimitiveType::Long),
            (false, false, true, false) => Some(PrimitiveType::String),
            _ => None,
        }
    }

    /// Expand into an argument list. Counts spanning more than one stack
    /// stay a single unordered block since their interleaving is unknown.
    pub fn arglist(&self) -> StackList {
        let ntypes = [self.int, self.long, self.string, self.vararg]
            .iter()
            .filter(|&&n| n != 0)
            .count();
        if ntypes > 1 {
            return StackList::from(vec![StackSlot::Diff(*self)]);
        }
        let mut list = StackList::new();
        for (ty, n) in [
            (StackType::Int, self.int),
            (StackType::String, self.string),
            (StackType::Long, self.long),
            (StackType::Vararg, self.vararg),
        ] {
            for _ in 0..n {
                list.push_one(ty);
            }
        }
        list
    }

    pub fn function_bind_string(&self) -> Result<String> {
        if self.vararg != 0 {
            return Err(CoreError::Stack("vararg not supported in a bound function".into()));
        }
        Ok(format!(
            "{}{}{}",
            "i".repeat(self.int.max(0) as usize),
            "l".repeat(self.long.max(0) as usize),
            "s".repeat(self.string.max(0) as usize)
        ))
    }
}

impl Add for StackDiff {
    type Output = Self;
    fn add(self, o: Self) -> Self {
        Self::new(
            self.int + o.int,
            self.long + o.long,
            self.string + o.string,
            self.vararg + o.vararg,
        )
    }
}

impl Sub for StackDiff {
    type Output = Self;
    fn sub(self, o: Self) -> Self {
        Self::new(
            self.int - o.int,
            self.long - o.long,
            self.string - o.string,
            self.vararg - o.vararg,
        )
    }
}

impl AddAssign for StackDiff {
    fn add_assign(&mut self, o: Self) {
        *self = *self + o;
    }
}

impl SubAssign for StackDiff {
    fn sub_assign(&mut self, o: Self) {
        *self = *self - o;
    }
}

impl std::fmt::Display for StackDiff {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "({},{},{},{})", self.int, self.long, self.string, self.vararg)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use proptest::prelude::*;

    fn diff() -> impl Strategy<Value = StackDiff> {
        (-50..50i32, -50..50i32, -50..50i32, -50..50i32)
            .prop_map(|(a, b, c, d)| StackDiff::new(a, b, c, d))
    }

    proptest! {
        #[test]
        fn add_then_sub_is_identity(a in diff(), b in diff()) {
            prop_assert_eq!((a + b) - b, a);
        }

        #[test]
        fn min_max_bound(a in diff(), b in diff()) {
            let lo = a.min(b);
            let hi = a.max(b);
            prop_assert!(lo.lteq(&a) && lo.lteq(&b));
            prop_assert!(a.lteq(&hi) && b.lteq(&hi));
            prop_assert_eq!(lo + hi, a + b);
        }

        #[test]
        fn mult_then_div(a in diff(), n in 1..9i32) {
            prop_assert_eq!(a.mult(n).int_div(n).unwrap(), a);
        }
    }

    #[test]
    fn remainder_fails() {
        let d = StackDiff::new(3, 0, 2, 0);
        assert!(matches!(
            d.int_div(2),
            Err(CoreError::StackRemainder { divisor: 2, .. })
        ));
        assert!(d.int_div(0).is_err());
        assert_eq!(StackDiff::new(4, 0, 2, 0).int_div(-2).unwrap(), StackDiff::new(-2, 0, -1, 0));
    }

    #[test]
    fn arglist_keeps_mixed_blocks() {
        let mixed = StackDiff::new(1, 0, 1, 0).arglist();
        assert_eq!(mixed.values, [StackSlot::Diff(StackDiff::new(1, 0, 1, 0))]);
        let ints = StackDiff::new(2, 0, 0, 0).arglist();
        assert_eq!(ints.values, [StackSlot::Int, StackSlot::Int]);
    }

    #[test]
    fn mono_type() {
        assert_eq!(StackDiff::new(0, 0, 3, 0).mono_type(), Some(PrimitiveType::String));
        assert_eq!(StackDiff::new(1, 1, 0, 0).mono_type(), None);
        assert_eq!(StackDiff::default().mono_type(), None);
    }
}
