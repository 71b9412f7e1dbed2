use std::hash::Hash;
use std::marker::PhantomData;

/// Typed, generational reference into a [`Pool`].
///
/// Handles are cheap to copy and never dangle: releasing the slot bumps its
/// generation, so a stale handle simply resolves to `None`.
#[derive(Debug)]
pub struct Handle<T> {
    pub slot: u16,
    pub generation: u16,
    phantom: PhantomData<T>,
}

impl<T> PartialEq for Handle<T> {
    fn eq(&self, other: &Self) -> bool {
        self.slot == other.slot && self.generation == other.generation
    }
}

impl<T> Eq for Handle<T> {}

impl<T> Clone for Handle<T> {
    fn clone(&self) -> Self {
        Self {
            slot: self.slot,
            generation: self.generation,
            phantom: PhantomData,
        }
    }
}

impl<T> Hash for Handle<T> {
    fn hash<H: std::hash::Hasher>(&self, state: &mut H) {
        self.slot.hash(state);
        self.generation.hash(state);
    }
}

impl<T> Copy for Handle<T> {}
impl<T> Default for Handle<T> {
    fn default() -> Self {
        Self {
            slot: Default::default(),
            generation: Default::default(),
            phantom: Default::default(),
        }
    }
}

/// Generational slot map backing every handle the crate gives out.
///
/// The generation counter is what turns a double-release or use-after-release
/// into a visible `None` instead of silent reuse of someone else's slot.
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

        p.empty = (0..initial_size).collect();
        p.items.resize_with(initial_size, || None);
        p
    }

    pub fn insert(&mut self, item: T) -> Option<Handle<T>> {
        let empty_slot = match self.empty.pop() {
            Some(slot) => slot,
            None => {
                // Grow until the 16-bit slot index runs out.
                let old_len = self.items.len();
                if old_len >= u16::MAX as usize {
                    return None;
                }
                let new_len = (old_len * 2).max(old_len + 1).min(u16::MAX as usize);
                self.items.resize_with(new_len, || None);
                self.generation.resize(new_len, 0);
                self.empty.extend(old_len + 1..new_len);
                old_len
            }
        };

        self.items[empty_slot] = Some(item);

        Some(Handle {
            slot: empty_slot as u16,
            generation: self.generation[empty_slot],
            phantom: PhantomData,
        })
    }

    /// Removes the item, bumping the slot generation so `item` goes stale.
    /// Handles from another pool, or with a slot this pool never grew to,
    /// resolve to `None` like any other stale handle.
    pub fn take(&mut self, item: Handle<T>) -> Option<T> {
        let slot = item.slot as usize;
        if self.generation.get(slot) != Some(&item.generation) {
            return None;
        }
        let taken = self.items[slot].take()?;
        self.generation[slot] = self.generation[slot].wrapping_add(1);
        self.empty.push(slot);
        Some(taken)
    }

    pub fn release(&mut self, item: Handle<T>) {
        let _ = self.take(item);
    }

    pub fn get_ref(&self, item: Handle<T>) -> Option<&T> {
        let slot = item.slot as usize;
        if self.generation.get(slot) == Some(&item.generation) {
            self.items[slot].as_ref()
        } else {
            None
        }
    }

    pub fn get_mut_ref(&mut self, item: Handle<T>) -> Option<&mut T> {
        let slot = item.slot as usize;
        if self.generation.get(slot) == Some(&item.generation) {
            self.items[slot].as_mut()
        } else {
            None
        }
    }

    pub fn len_occupied(&self) -> usize {
        self.items.iter().filter(|i| i.is_some()).count()
    }

    pub fn for_each_occupied_mut<F>(&mut self, mut func: F)
    where
        F: FnMut(&mut T),
    {
        for item in self.items.iter_mut().flatten() {
            func(item);
        }
    }

    pub fn clear(&mut self) {
        for (slot, item) in self.items.iter_mut().enumerate() {
            if item.take().is_some() {
                self.generation[slot] = self.generation[slot].wrapping_add(1);
                self.empty.push(slot);
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn insert_and_get() {
        let mut pool = Pool::new(4);
        let h = pool.insert(42u32).unwrap();
        assert_eq!(pool.get_ref(h), Some(&42));
        assert_eq!(pool.len_occupied(), 1);
    }

    #[test]
    fn release_invalidates_handle() {
        let mut pool = Pool::new(4);
        let h = pool.insert(7u32).unwrap();
        pool.release(h);
        assert_eq!(pool.get_ref(h), None);
        assert_eq!(pool.len_occupied(), 0);
    }

    #[test]
    fn take_is_exactly_once() {
        let mut pool = Pool::new(4);
        let h = pool.insert(String::from("x")).unwrap();
        assert_eq!(pool.take(h).as_deref(), Some("x"));
        assert_eq!(pool.take(h), None);
    }

    #[test]
    fn reused_slot_gets_new_generation() {
        let mut pool = Pool::new(1);
        let a = pool.insert(1u32).unwrap();
        pool.release(a);
        let b = pool.insert(2u32).unwrap();
        assert_eq!(a.slot, b.slot);
        assert_ne!(a.generation, b.generation);
        assert_eq!(pool.get_ref(a), None);
        assert_eq!(pool.get_ref(b), Some(&2));
    }

    #[test]
    fn out_of_range_handles_resolve_to_none() {
        let mut big = Pool::new(8);
        // Slots pop from the high end, so the first handle lands at slot 7.
        let foreign = big.insert(1u32).unwrap();
        assert_eq!(foreign.slot, 7);

        let mut small = Pool::new(2);
        assert_eq!(small.get_ref(foreign), None);
        assert_eq!(small.get_mut_ref(foreign), None);
        assert_eq!(small.take(foreign), None);
        assert_eq!(small.len_occupied(), 0);
    }

    #[test]
    fn zero_capacity_pool_grows_on_first_insert() {
        let mut pool = Pool::new(0);
        let h = pool.insert(9u32).unwrap();
        assert_eq!(pool.get_ref(h), Some(&9));
    }

    #[test]
    fn grows_past_initial_capacity() {
        let mut pool = Pool::new(2);
        let handles: Vec<_> = (0..10).map(|i| pool.insert(i).unwrap()).collect();
        for (i, h) in handles.iter().enumerate() {
            assert_eq!(pool.get_ref(*h), Some(&i));
        }
    }
}
