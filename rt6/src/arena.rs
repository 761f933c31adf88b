// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

//! Generational slot storage for trie nodes and route entries.
//!
//! An [`Index`] names a slot together with the generation the slot had when
//! the value was inserted. Once the value is removed the slot's generation is
//! bumped, so stale indices held by destination-cache users resolve to `None`
//! instead of aliasing whatever reuses the slot.

use std::fmt;
use std::hash::{Hash, Hasher};
use std::marker::PhantomData;

pub struct Index<T> {
    slot: u32,
    generation: u32,
    _t: PhantomData<fn() -> T>,
}

impl<T> Index<T> {
    pub fn slot(&self) -> u32 {
        self.slot
    }
}

impl<T> Clone for Index<T> {
    fn clone(&self) -> Self {
        *self
    }
}

impl<T> Copy for Index<T> {}

impl<T> PartialEq for Index<T> {
    fn eq(&self, other: &Self) -> bool {
        self.slot == other.slot && self.generation == other.generation
    }
}

impl<T> Eq for Index<T> {}

impl<T> Hash for Index<T> {
    fn hash<H: Hasher>(&self, state: &mut H) {
        self.slot.hash(state);
        self.generation.hash(state);
    }
}

impl<T> fmt::Debug for Index<T> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "#{}.{}", self.slot, self.generation)
    }
}

struct Slot<T> {
    generation: u32,
    value: Option<T>,
}

pub struct Arena<T> {
    slots: Vec<Slot<T>>,
    free: Vec<u32>,
    len: usize,
    limit: Option<usize>,
}

impl<T> Default for Arena<T> {
    fn default() -> Self {
        Self::new()
    }
}

impl<T> Arena<T> {
    pub fn new() -> Self {
        Self {
            slots: Vec::new(),
            free: Vec::new(),
            len: 0,
            limit: None,
        }
    }

    /// Cap the number of live values accepted by [`Arena::try_insert`].
    pub fn set_limit(&mut self, limit: Option<usize>) {
        self.limit = limit;
    }

    pub fn len(&self) -> usize {
        self.len
    }

    pub fn is_empty(&self) -> bool {
        self.len == 0
    }

    /// Insert a value, failing and handing the value back when the arena is
    /// at its limit.
    pub fn try_insert(&mut self, value: T) -> Result<Index<T>, T> {
        if let Some(limit) = self.limit {
            if self.len >= limit {
                return Err(value);
            }
        }
        Ok(self.push(value))
    }

    /// Insert a value regardless of the limit.
    pub fn push(&mut self, value: T) -> Index<T> {
        self.len += 1;
        match self.free.pop() {
            Some(slot) => {
                let s = &mut self.slots[slot as usize];
                s.value = Some(value);
                Index {
                    slot,
                    generation: s.generation,
                    _t: PhantomData,
                }
            }
            None => {
                let slot = self.slots.len() as u32;
                self.slots.push(Slot {
                    generation: 0,
                    value: Some(value),
                });
                Index {
                    slot,
                    generation: 0,
                    _t: PhantomData,
                }
            }
        }
    }

    pub fn remove(&mut self, idx: Index<T>) -> Option<T> {
        let s = self.slots.get_mut(idx.slot as usize)?;
        if s.generation != idx.generation {
            return None;
        }
        let value = s.value.take()?;
        s.generation = s.generation.wrapping_add(1);
        self.free.push(idx.slot);
        self.len -= 1;
        Some(value)
    }

    pub fn get(&self, idx: Index<T>) -> Option<&T> {
        let s = self.slots.get(idx.slot as usize)?;
        if s.generation != idx.generation {
            return None;
        }
        s.value.as_ref()
    }

    pub fn get_mut(&mut self, idx: Index<T>) -> Option<&mut T> {
        let s = self.slots.get_mut(idx.slot as usize)?;
        if s.generation != idx.generation {
            return None;
        }
        s.value.as_mut()
    }

    pub fn iter(&self) -> impl Iterator<Item = (Index<T>, &T)> {
        self.slots.iter().enumerate().filter_map(|(i, s)| {
            s.value.as_ref().map(|v| {
                (
                    Index {
                        slot: i as u32,
                        generation: s.generation,
                        _t: PhantomData,
                    },
                    v,
                )
            })
        })
    }
}

/// Indexing is for links the trie itself maintains. A stale index here is a
/// broken trie invariant and panics; handles that came from outside the table
/// go through [`Arena::get`].
impl<T> std::ops::Index<Index<T>> for Arena<T> {
    type Output = T;

    fn index(&self, idx: Index<T>) -> &T {
        match self.get(idx) {
            Some(v) => v,
            None => panic!("stale arena index {idx:?}"),
        }
    }
}

impl<T> std::ops::IndexMut<Index<T>> for Arena<T> {
    fn index_mut(&mut self, idx: Index<T>) -> &mut T {
        match self.get_mut(idx) {
            Some(v) => v,
            None => panic!("stale arena index {idx:?}"),
        }
    }
}

#[cfg(test)]
mod test {
    use super::*;

    #[test]
    fn stale_index_after_reuse() {
        let mut a = Arena::new();
        let x = a.push("x");
        assert_eq!(a.remove(x), Some("x"));
        let y = a.push("y");
        assert_eq!(x.slot(), y.slot());
        assert!(a.get(x).is_none());
        assert_eq!(a.get(y), Some(&"y"));
        assert_eq!(a.len(), 1);
    }

    #[test]
    fn limit_rejects_insert() {
        let mut a = Arena::new();
        a.set_limit(Some(1));
        assert!(a.try_insert(1).is_ok());
        assert_eq!(a.try_insert(2), Err(2));
        assert_eq!(a.iter().count(), 1);
    }
}
