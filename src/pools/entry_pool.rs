//! Fixed-capacity arena for operation entries with generational handles.
//!
//! A handle stores the slot index plus the slot's generation at allocation
//! time; releasing a slot bumps the generation, so any handle still floating
//! around afterwards resolves to `None` instead of aliasing the slot's next
//! occupant. That property is what lets the progress engine detect that an
//! entry was released inline while a drain loop still holds its handle.

use std::fmt::{Debug, Formatter};
use std::hash::{Hash, Hasher};
use std::marker::PhantomData;

use crate::error::{Error, Result};

pub struct Handle<T> {
    index: u32,
    generation: u32,
    _marker: PhantomData<fn() -> T>,
}

impl<T> Handle<T> {
    /// Encoding used to carry entry ids on the wire: generation in the upper
    /// half, index in the lower.
    pub fn to_wire(self) -> u64 {
        ((self.generation as u64) << 32) | self.index as u64
    }

    pub fn from_wire(raw: u64) -> Handle<T> {
        Handle {
            index: raw as u32,
            generation: (raw >> 32) as u32,
            _marker: PhantomData,
        }
    }
}

// manual impls: derive would put unwanted bounds on T
impl<T> Clone for Handle<T> {
    fn clone(&self) -> Self {
        *self
    }
}
impl<T> Copy for Handle<T> {}
impl<T> PartialEq for Handle<T> {
    fn eq(&self, other: &Self) -> bool {
        self.index == other.index && self.generation == other.generation
    }
}
impl<T> Eq for Handle<T> {}
impl<T> Hash for Handle<T> {
    fn hash<H: Hasher>(&self, state: &mut H) {
        self.index.hash(state);
        self.generation.hash(state);
    }
}
impl<T> Debug for Handle<T> {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        write!(f, "Handle({}@{})", self.index, self.generation)
    }
}

struct Slot<T> {
    generation: u32,
    value: Option<T>,
}

pub struct EntryPool<T> {
    name: &'static str,
    slots: Vec<Slot<T>>,
    free: Vec<u32>,
}

impl<T> EntryPool<T> {
    pub fn new(name: &'static str, capacity: u32) -> EntryPool<T> {
        let mut slots = Vec::with_capacity(capacity as usize);
        let mut free = Vec::with_capacity(capacity as usize);
        for index in 0..capacity {
            slots.push(Slot { generation: 0, value: None });
            free.push(capacity - 1 - index);
        }
        EntryPool { name, slots, free }
    }

    pub fn alloc(&mut self, value: T) -> Result<Handle<T>> {
        let Some(index) = self.free.pop() else {
            tracing::debug!(pool = self.name, "entry pool exhausted");
            return Err(Error::Exhausted);
        };
        let slot = &mut self.slots[index as usize];
        debug_assert!(slot.value.is_none());
        slot.value = Some(value);
        Ok(Handle { index, generation: slot.generation, _marker: PhantomData })
    }

    pub fn get(&self, handle: Handle<T>) -> Option<&T> {
        let slot = self.slots.get(handle.index as usize)?;
        if slot.generation != handle.generation {
            return None;
        }
        slot.value.as_ref()
    }

    pub fn get_mut(&mut self, handle: Handle<T>) -> Option<&mut T> {
        let slot = self.slots.get_mut(handle.index as usize)?;
        if slot.generation != handle.generation {
            return None;
        }
        slot.value.as_mut()
    }

    /// Returns the entry and retires the handle's generation. Releasing
    /// through a stale handle is a no-op returning `None`.
    pub fn release(&mut self, handle: Handle<T>) -> Option<T> {
        let slot = self.slots.get_mut(handle.index as usize)?;
        if slot.generation != handle.generation || slot.value.is_none() {
            return None;
        }
        slot.generation = slot.generation.wrapping_add(1);
        self.free.push(handle.index);
        slot.value.take()
    }

    pub fn in_use(&self) -> usize {
        self.slots.len() - self.free.len()
    }

    /// Handles of all live entries, in slot order.
    pub fn live_handles(&self) -> Vec<Handle<T>> {
        self.slots
            .iter()
            .enumerate()
            .filter(|(_, slot)| slot.value.is_some())
            .map(|(index, slot)| Handle {
                index: index as u32,
                generation: slot.generation,
                _marker: PhantomData,
            })
            .collect()
    }

    pub fn capacity(&self) -> usize {
        self.slots.len()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_alloc_and_get() {
        let mut pool: EntryPool<String> = EntryPool::new("test", 4);
        let a = pool.alloc("a".to_string()).unwrap();
        let b = pool.alloc("b".to_string()).unwrap();

        assert_eq!(pool.get(a).unwrap(), "a");
        assert_eq!(pool.get(b).unwrap(), "b");
        assert_eq!(pool.in_use(), 2);

        pool.get_mut(a).unwrap().push('!');
        assert_eq!(pool.get(a).unwrap(), "a!");
    }

    #[test]
    fn test_exhaustion_is_recoverable() {
        let mut pool: EntryPool<u32> = EntryPool::new("test", 2);
        let a = pool.alloc(1).unwrap();
        let _b = pool.alloc(2).unwrap();

        assert_eq!(pool.alloc(3), Err(Error::Exhausted));

        assert_eq!(pool.release(a), Some(1));
        assert!(pool.alloc(3).is_ok());
    }

    #[test]
    fn test_stale_handle_resolves_to_none() {
        let mut pool: EntryPool<u32> = EntryPool::new("test", 2);
        let a = pool.alloc(1).unwrap();

        assert_eq!(pool.release(a), Some(1));
        assert_eq!(pool.get(a), None);
        assert_eq!(pool.release(a), None);

        // the slot gets reused under a new generation
        let b = pool.alloc(2).unwrap();
        assert_ne!(a, b);
        assert_eq!(pool.get(a), None);
        assert_eq!(pool.get(b), Some(&2));
    }

    #[test]
    fn test_wire_roundtrip() {
        let mut pool: EntryPool<u32> = EntryPool::new("test", 8);
        pool.alloc(0).unwrap();
        let h = pool.alloc(42).unwrap();

        let decoded = Handle::<u32>::from_wire(h.to_wire());
        assert_eq!(decoded, h);
        assert_eq!(pool.get(decoded), Some(&42));
    }
}
