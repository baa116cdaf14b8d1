use serde::{Deserialize, Serialize};

use super::{StackDiff, StackType};
use crate::error::{CoreError, Result};

/// One slot of a [`StackList`]: a single value or an unordered block.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum StackSlot {
    Int,
    Long,
    String,
    Vararg,
    Diff(StackDiff),
}

impl StackSlot {
    /// The stack of a single-value slot.
    pub fn stack_type(self) -> Option<StackType> {
        match self {
            StackSlot::Int => Some(StackType::Int),
            StackSlot::Long => Some(StackType::Long),
            StackSlot::String => Some(StackType::String),
            StackSlot::Vararg => Some(StackType::Vararg),
            StackSlot::Diff(_) => None,
        }
    }

    fn count(self) -> usize {
        match self {
            StackSlot::Diff(d) => d.total().max(0) as usize,
            _ => 1,
        }
    }
}

impl From<StackType> for StackSlot {
    fn from(ty: StackType) -> Self {
        match ty {
            StackType::Int => StackSlot::Int,
            StackType::Long => StackSlot::Long,
            StackType::String => StackSlot::String,
            StackType::Vararg => StackSlot::Vararg,
        }
    }
}

impl std::fmt::Display for StackSlot {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            StackSlot::Diff(d) => write!(f, "{d}"),
            slot => f.write_str(slot.stack_type().map_or("?", StackType::name)),
        }
    }
}

/// Ordered stack contents, bottom first.
#[derive(Debug, Clone, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct StackList {
    pub values: Vec<StackSlot>,
}

impl From<Vec<StackSlot>> for StackList {
    fn from(values: Vec<StackSlot>) -> Self {
        Self { values }
    }
}

impl FromIterator<StackType> for StackList {
    fn from_iter<T: IntoIterator<Item = StackType>>(iter: T) -> Self {
        Self {
            values: iter.into_iter().map(StackSlot::from).collect(),
        }
    }
}

impl StackList {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn len(&self) -> usize {
        self.values.len()
    }

    /// True when no slot holds a value (empty blocks don't count).
    pub fn is_empty(&self) -> bool {
        self.values
            .iter()
            .all(|v| matches!(v, StackSlot::Diff(d) if d.is_empty()))
    }

    pub fn push_one(&mut self, ty: StackType) {
        self.values.push(ty.into());
    }

    pub fn push(&mut self, other: &StackList) {
        self.values.extend_from_slice(&other.values);
    }

    /// Number of values in slots `end_offset..`.
    pub fn total_from(&self, end_offset: usize) -> usize {
        self.values
            .iter()
            .skip(end_offset)
            .map(|v| v.count())
            .sum()
    }

    pub fn total(&self) -> usize {
        self.total_from(0)
    }

    pub fn to_diff(&self) -> StackDiff {
        let mut res = StackDiff::default();
        for v in &self.values {
            match v {
                StackSlot::Diff(d) => res += *d,
                slot => {
                    if let Some(ty) = slot.stack_type() {
                        res.set(ty, res.get(ty) + 1);
                    }
                }
            }
        }
        res
    }

    /// Remove `n` values from the bottom. Fails (leaving the list intact)
    /// when `n` would split a block or exceeds the contents.
    pub fn try_shift(&mut self, n: usize) -> bool {
        if n == 0 {
            return true;
        }
        let mut count = 0;
        for i in 0..self.values.len() {
            count += self.values[i].count();
            if count >= n {
                if count != n {
                    return false;
                }
                self.values.drain(..=i);
                return true;
            }
        }
        false
    }

    /// Pop one value of type `ty` from the top.
    pub fn try_pop_single(&mut self, ty: StackType) -> bool {
        let Some(last) = self.values.last_mut() else {
            return false;
        };
        match last {
            StackSlot::Diff(d) => {
                let amount = d.get(ty);
                if amount <= 0 {
                    return false;
                }
                d.set(ty, amount - 1);
                if d.is_empty() {
                    self.values.pop();
                }
            }
            slot => {
                if slot.stack_type() != Some(ty) {
                    return false;
                }
                self.values.pop();
            }
        }
        true
    }

    /// Pop an unordered block of values from the top.
    pub fn try_pop_unordered(&mut self, mut other: StackDiff) -> bool {
        while !other.is_empty() {
            let Some(last) = self.values.last_mut() else {
                return false;
            };
            let pop_last = match last {
                StackSlot::Diff(val) => {
                    if other.lteq(val) {
                        *val -= other;
                        other = StackDiff::default();
                        false
                    } else if val.lteq(&other) {
                        other -= *val;
                        true
                    } else {
                        return false;
                    }
                }
                slot => {
                    let Some(ty) = slot.stack_type() else {
                        return false;
                    };
                    let amount = other.get(ty);
                    if amount <= 0 {
                        return false;
                    }
                    other.set(ty, amount - 1);
                    true
                }
            };
            if pop_last {
                self.values.pop();
            }
        }
        true
    }

    /// Pop the slots of `list` above index `limit` from this list, top
    /// first, stopping at the first mismatch. Returns how many slots of
    /// `list` were left unresolved (0 on full match).
    pub fn try_pop(&mut self, list: &StackList, limit: usize) -> usize {
        let mut other_index = list.values.len();
        while other_index > limit {
            let matched = match list.values[other_index - 1] {
                StackSlot::Diff(d) => self.try_pop_unordered(d),
                slot => match slot.stack_type() {
                    Some(ty) => self.try_pop_single(ty),
                    None => false,
                },
            };
            if !matched {
                break;
            }
            other_index -= 1;
        }
        other_index - limit
    }

    pub fn pop(&mut self, list: &StackList, limit: usize) -> Result<()> {
        if self.try_pop(list, limit) != 0 {
            return Err(CoreError::StackUnderflow);
        }
        Ok(())
    }

    /// [`try_pop`](Self::try_pop) working from the bottom of both lists.
    pub fn try_pop_reverse(&mut self, list: &StackList, limit: usize) -> usize {
        self.values.reverse();
        let reversed: StackList = list.values.iter().rev().copied().collect::<Vec<_>>().into();
        let res = self.try_pop(&reversed, limit);
        self.values.reverse();
        res
    }

    /// Tag string of a bound-function signature, e.g. `"isl"`.
    pub fn function_bind_string(&self) -> Result<String> {
        let mut res = String::new();
        for slot in &self.values {
            match slot {
                StackSlot::Diff(d) => res.push_str(&d.function_bind_string()?),
                StackSlot::Int => res.push('i'),
                StackSlot::Long => res.push('l'),
                StackSlot::String => res.push('s'),
                StackSlot::Vararg => {
                    return Err(CoreError::Stack("unsupported stack type vararg".into()))
                }
            }
        }
        Ok(res)
    }
}

impl std::fmt::Display for StackList {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        for (i, v) in self.values.iter().enumerate() {
            if i != 0 {
                f.write_str(",")?;
            }
            write!(f, "{v}")?;
        }
        Ok(())
    }
}

/// Whether `s` has the shape of a bound-function type tag: `[ils]*Y?`.
pub fn is_vararg_tag(s: &str) -> bool {
    let letters = s.strip_suffix('Y').unwrap_or(s);
    letters.chars().all(|c| matches!(c, 'i' | 'l' | 's'))
}

/// Argument list described by a type tag, in push order.
///
/// A trailing `Y` appends an int array: `last_int` int values followed by
/// the count itself, which is the last int constant pushed before the tag.
pub fn vararg_type(tag: &str, last_int: Option<i32>) -> Option<StackList> {
    if !is_vararg_tag(tag) {
        return None;
    }
    let (letters, array) = match tag.strip_suffix('Y') {
        Some(rest) => (rest, true),
        None => (tag, false),
    };
    let mut list: StackList = letters
        .chars()
        .map(|c| match c {
            'i' => StackType::Int,
            'l' => StackType::Long,
            _ => StackType::String,
        })
        .collect();
    if array {
        let count = last_int.filter(|n| *n >= 0)?;
        for _ in 0..=count {
            list.push_one(StackType::Int);
        }
    }
    Some(list)
}

#[cfg(test)]
mod tests {
    use super::*;
    use proptest::prelude::*;

    fn list(types: &[StackType]) -> StackList {
        types.iter().copied().collect()
    }

    fn slot() -> impl Strategy<Value = StackType> {
        prop_oneof![
            Just(StackType::Int),
            Just(StackType::Long),
            Just(StackType::String),
        ]
    }

    proptest! {
        #[test]
        fn push_then_pop_matches(base in prop::collection::vec(slot(), 0..8), sub in prop::collection::vec(slot(), 0..8)) {
            let mut l = list(&base);
            let sub = list(&sub);
            l.push(&sub);
            prop_assert_eq!(l.try_pop(&sub, 0), 0);
            prop_assert_eq!(l, list(&base));
        }
    }

    #[test]
    fn partial_pop_reports_shortage() {
        let mut l = list(&[StackType::Int]);
        let want = list(&[StackType::String, StackType::Int]);
        assert_eq!(l.try_pop(&want, 0), 1);
        assert!(l.values.is_empty());
        assert!(matches!(
            list(&[]).pop(&want, 0),
            Err(CoreError::StackUnderflow)
        ));
    }

    #[test]
    fn unordered_blocks() {
        let mut l = list(&[StackType::String, StackType::Int, StackType::String]);
        let block = StackList::from(vec![StackSlot::Diff(StackDiff::new(1, 0, 2, 0))]);
        assert_eq!(l.try_pop(&block, 0), 0);
        assert!(l.is_empty());

        let mut l = StackList::from(vec![StackSlot::Diff(StackDiff::new(2, 0, 1, 0))]);
        assert!(l.try_pop_single(StackType::Int));
        assert_eq!(l.to_diff(), StackDiff::new(1, 0, 1, 0));
        assert!(!l.try_pop_single(StackType::Long));
    }

    #[test]
    fn shift_from_bottom() {
        let mut l = list(&[StackType::Int, StackType::Long, StackType::String]);
        assert!(l.try_shift(2));
        assert_eq!(l, list(&[StackType::String]));
        assert!(!l.try_shift(2));
        assert!(l.try_shift(0));

        let mut blocked = StackList::from(vec![StackSlot::Diff(StackDiff::new(2, 0, 0, 0))]);
        assert!(!blocked.try_shift(1));
        assert_eq!(blocked.total(), 2);
    }

    #[test]
    fn reverse_pop_matches_bottom() {
        let mut out = list(&[StackType::Int, StackType::String]);
        let input = list(&[StackType::Int, StackType::Long]);
        // only the bottom int is shared
        assert_eq!(out.try_pop_reverse(&input, 1), 0);
        assert_eq!(out, list(&[StackType::String]));
    }

    #[test]
    fn vararg_tags() {
        assert_eq!(
            vararg_type("isl", None),
            Some(list(&[StackType::Int, StackType::String, StackType::Long]))
        );
        assert_eq!(vararg_type("iY", Some(2)).map(|l| l.total()), Some(4));
        assert_eq!(vararg_type("iY", None), None);
        assert_eq!(vararg_type("hello", None), None);
        assert!(is_vararg_tag(""));
        assert_eq!(list(&[StackType::Int, StackType::Long]).function_bind_string().unwrap(), "il");
    }
}
