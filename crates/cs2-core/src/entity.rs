//! Typed `u32` handles for the block and node arenas.

use std::fmt;
use std::marker::PhantomData;

use serde::{Deserialize, Serialize};

/// A handle into a [`PrimaryMap`].
pub trait EntityRef: Copy + Eq + Ord + fmt::Debug {
    fn new(index: u32) -> Self;
    fn index(self) -> u32;
}

/// Declare a handle type, displayed as its name followed by the index
/// (`NodeId3`).
#[macro_export]
macro_rules! define_entity {
    ($name:ident) => {
        #[derive(
            Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Debug, serde::Serialize, serde::Deserialize,
        )]
        pub struct $name(u32);

        impl $crate::entity::EntityRef for $name {
            fn new(index: u32) -> Self {
                Self(index)
            }

            fn index(self) -> u32 {
                self.0
            }
        }

        impl std::fmt::Display for $name {
            fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
                write!(f, "{}{}", stringify!($name), self.0)
            }
        }
    };
}

/// Arena that only grows. The decompiler detaches rewritten nodes rather
/// than removing them, so every handle it ever gave out stays valid.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(transparent)]
pub struct PrimaryMap<K, V> {
    items: Vec<V>,
    #[serde(skip)]
    key: PhantomData<fn() -> K>,
}

impl<K: EntityRef, V> Default for PrimaryMap<K, V> {
    fn default() -> Self {
        Self::new()
    }
}

impl<K: EntityRef, V> PrimaryMap<K, V> {
    pub fn new() -> Self {
        Self {
            items: Vec::new(),
            key: PhantomData,
        }
    }

    /// The handle the next `push` will return.
    pub fn next_key(&self) -> K {
        K::new(self.items.len() as u32)
    }

    pub fn push(&mut self, value: V) -> K {
        let key = self.next_key();
        self.items.push(value);
        key
    }

    pub fn get(&self, key: K) -> Option<&V> {
        self.items.get(key.index() as usize)
    }

    pub fn get_mut(&mut self, key: K) -> Option<&mut V> {
        self.items.get_mut(key.index() as usize)
    }

    pub fn len(&self) -> usize {
        self.items.len()
    }

    pub fn is_empty(&self) -> bool {
        self.items.is_empty()
    }

    pub fn keys(&self) -> impl Iterator<Item = K> {
        (0..self.items.len() as u32).map(K::new)
    }

    pub fn iter(&self) -> impl Iterator<Item = (K, &V)> {
        self.keys().zip(&self.items)
    }
}

impl<K: EntityRef, V> std::ops::Index<K> for PrimaryMap<K, V> {
    type Output = V;

    fn index(&self, key: K) -> &V {
        &self.items[key.index() as usize]
    }
}

impl<K: EntityRef, V> std::ops::IndexMut<K> for PrimaryMap<K, V> {
    fn index_mut(&mut self, key: K) -> &mut V {
        &mut self.items[key.index() as usize]
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    define_entity!(SlotId);

    #[test]
    fn handles_are_dense_and_named() {
        let mut map: PrimaryMap<SlotId, &str> = PrimaryMap::new();
        assert_eq!(map.next_key(), SlotId::new(0));
        let a = map.push("a");
        let b = map.push("b");
        assert_eq!(map[b], "b");
        assert_eq!(map.keys().collect::<Vec<_>>(), [a, b]);
        assert_eq!(map.iter().map(|(_, v)| *v).collect::<String>(), "ab");
        assert!(map.get(SlotId::new(2)).is_none());
        assert_eq!(b.to_string(), "SlotId1");
    }
}
