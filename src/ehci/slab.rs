//! Fixed-capacity slot storage indexed by small integers

use core::ops::{Index, IndexMut};

/// Slots of `T` addressed by index; freed slots are reused lowest first
pub struct Slab<T, const N: usize> {
    slots: [Option<T>; N],
    len: usize,
}

impl<T, const N: usize> Slab<T, N> {
    /// Empty slab
    pub fn new() -> Self {
        Self {
            slots: core::array::from_fn(|_| None),
            len: 0,
        }
    }

    /// Store `value`, returning its index, or hand it back when full
    pub fn insert(&mut self, value: T) -> Result<usize, T> {
        match self.slots.iter().position(Option::is_none) {
            Some(index) => {
                self.slots[index] = Some(value);
                self.len += 1;
                Ok(index)
            }
            None => Err(value),
        }
    }

    /// Take the value out of a slot
    pub fn remove(&mut self, index: usize) -> Option<T> {
        let value = self.slots.get_mut(index)?.take();
        if value.is_some() {
            self.len -= 1;
        }

        value
    }

    /// Borrow an occupied slot
    pub fn get(&self, index: usize) -> Option<&T> {
        self.slots.get(index)?.as_ref()
    }

    /// Mutably borrow an occupied slot
    pub fn get_mut(&mut self, index: usize) -> Option<&mut T> {
        self.slots.get_mut(index)?.as_mut()
    }

    /// Occupied slots with their indices
    pub fn iter(&self) -> impl Iterator<Item = (usize, &T)> {
        self.slots
            .iter()
            .enumerate()
            .filter_map(|(index, slot)| slot.as_ref().map(|value| (index, value)))
    }

    /// Number of occupied slots
    pub fn len(&self) -> usize {
        self.len
    }

    /// Free slots left
    pub fn available(&self) -> usize {
        N - self.len
    }

    /// Check if no slot is occupied
    pub fn is_empty(&self) -> bool {
        self.len == 0
    }
}

impl<T, const N: usize> Index<usize> for Slab<T, N> {
    type Output = T;

    fn index(&self, index: usize) -> &T {
        match self.get(index) {
            Some(value) => value,
            None => panic!("slab slot {} is free", index),
        }
    }
}

impl<T, const N: usize> IndexMut<usize> for Slab<T, N> {
    fn index_mut(&mut self, index: usize) -> &mut T {
        match self.get_mut(index) {
            Some(value) => value,
            None => panic!("slab slot {} is free", index),
        }
    }
}

impl<T, const N: usize> Default for Slab<T, N> {
    fn default() -> Self {
        Self::new()
    }
}
