use std::hash::Hash;
use std::marker::PhantomData;

/// Untyped slot + generation pair, used where a handle crosses the
/// backend contract boundary and the concrete resource type is private
/// to the engine.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default)]
pub struct RawHandle {
    pub slot: u16,
    pub generation: u16,
}

/// Typed handle into a [`Pool`]. Stale handles (whose slot was released
/// and reused) fail generation checks instead of aliasing a new resource.
#[derive(Debug)]
pub struct Handle<T> {
    pub slot: u16,
    pub generation: u16,
    phantom: PhantomData<T>,
}

impl<T> Handle<T> {
    pub fn from_raw(raw: RawHandle) -> Self {
        Self {
            slot: raw.slot,
            generation: raw.generation,
            phantom: PhantomData,
        }
    }

    pub fn into_raw(self) -> RawHandle {
        RawHandle {
            slot: self.slot,
            generation: self.generation,
        }
    }
}

impl<T> PartialEq for Handle<T> {
    fn eq(&self, other: &Self) -> bool {
        self.slot == other.slot && self.generation == other.generation
    }
}

impl<T> Eq for Handle<T> {}

impl<T> Clone for Handle<T> {
    fn clone(&self) -> Self {
        *self
    }
}

impl<T> Copy for Handle<T> {}

impl<T> Hash for Handle<T> {
    fn hash<H: std::hash::Hasher>(&self, state: &mut H) {
        self.slot.hash(state);
        self.generation.hash(state);
    }
}

impl<T> Default for Handle<T> {
    fn default() -> Self {
        Self {
            slot: 0,
            generation: 0,
            phantom: PhantomData,
        }
    }
}

/// Generational slot storage for backend-private resources.
pub struct Pool<T> {
    items: Vec<Option<T>>,
    empty: Vec<usize>,
    generation: Vec<u16>,
}

impl<T> Default for Pool<T> {
    fn default() -> Self {
        Self::new(256)
    }
}

impl<T> Pool<T> {
    pub fn new(initial_size: usize) -> Self {
        let mut p = Pool {
            items: Vec::with_capacity(initial_size),
            empty: Vec::with_capacity(initial_size),
            generation: vec![0; initial_size],
        };

        p.empty = (0..initial_size).rev().collect();
        p.items.resize_with(initial_size, || None);
        p
    }

    pub fn insert(&mut self, item: T) -> Option<Handle<T>> {
        let slot = match self.empty.pop() {
            Some(slot) => slot,
            None => {
                let slot = self.items.len();
                if slot > u16::MAX as usize {
                    return None;
                }
                self.items.push(None);
                self.generation.push(0);
                slot
            }
        };

        self.items[slot] = Some(item);

        Some(Handle {
            slot: slot as u16,
            generation: self.generation[slot],
            phantom: PhantomData,
        })
    }

    /// Removes the item behind `handle` and bumps the slot generation so
    /// every outstanding copy of the handle goes stale.
    pub fn release(&mut self, handle: Handle<T>) -> Option<T> {
        let slot = handle.slot as usize;
        if self.generation[slot] != handle.generation {
            return None;
        }
        let item = self.items[slot].take();
        if item.is_some() {
            self.generation[slot] = self.generation[slot].wrapping_add(1);
            self.empty.push(slot);
        }
        item
    }

    pub fn get_ref(&self, handle: Handle<T>) -> Option<&T> {
        let slot = handle.slot as usize;
        if self.generation.get(slot) == Some(&handle.generation) {
            self.items[slot].as_ref()
        } else {
            None
        }
    }

    pub fn get_mut_ref(&mut self, handle: Handle<T>) -> Option<&mut T> {
        let slot = handle.slot as usize;
        if self.generation.get(slot) == Some(&handle.generation) {
            self.items[slot].as_mut()
        } else {
            None
        }
    }

    /// Drains every live item, releasing all slots. Used by engine
    /// teardown to destroy resources the caller leaked.
    pub fn drain(&mut self) -> Vec<T> {
        let mut out = Vec::new();
        for (slot, item) in self.items.iter_mut().enumerate() {
            if let Some(item) = item.take() {
                self.generation[slot] = self.generation[slot].wrapping_add(1);
                self.empty.push(slot);
                out.push(item);
            }
        }
        out
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn release_invalidates_outstanding_handles() {
        let mut pool: Pool<u32> = Pool::new(4);
        let h = pool.insert(7).unwrap();
        assert_eq!(pool.get_ref(h), Some(&7));
        assert_eq!(pool.release(h), Some(7));
        assert_eq!(pool.get_ref(h), None);
        assert_eq!(pool.release(h), None);

        let h2 = pool.insert(9).unwrap();
        assert_eq!(pool.get_ref(h2), Some(&9));
        // The old handle may alias the new slot but not the new generation.
        assert_eq!(pool.get_ref(h), None);
    }

    #[test]
    fn grows_past_initial_capacity() {
        let mut pool: Pool<usize> = Pool::new(2);
        let handles: Vec<_> = (0..8).map(|i| pool.insert(i).unwrap()).collect();
        for (i, h) in handles.iter().enumerate() {
            assert_eq!(pool.get_ref(*h), Some(&i));
        }
    }
}
