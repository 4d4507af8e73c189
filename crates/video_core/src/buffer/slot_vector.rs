//! Slot-indexed arena.
//!
//! Values are addressed by a `SlotId` that stays valid until the value is
//! removed, however the arena grows. Slot 0 is reserved so that the zero id
//! can act as a null reference in page-table entries. Freed slots are reused
//! in LIFO order.

use std::fmt;

/// Stable index into a [`SlotVector`]. Zero is the null id.
#[derive(Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Default)]
pub struct SlotId(u32);

impl SlotId {
    /// The null id.
    pub const NULL: Self = Self(0);

    /// Creates an id from a raw slot index.
    #[inline(always)]
    pub const fn from_index(index: u32) -> Self {
        Self(index)
    }

    /// Returns the raw slot index.
    #[inline(always)]
    pub const fn index(self) -> usize {
        self.0 as usize
    }

    /// Returns `true` for the null id.
    #[inline(always)]
    pub const fn is_null(self) -> bool {
        self.0 == 0
    }
}

impl fmt::Debug for SlotId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        if self.is_null() {
            write!(f, "SlotId(null)")
        } else {
            write!(f, "SlotId({})", self.0)
        }
    }
}

impl fmt::Display for SlotId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "#{}", self.0)
    }
}

/// Arena of values addressed by [`SlotId`].
pub struct SlotVector<T> {
    values: Vec<Option<T>>,
    free_list: Vec<u32>,
    len: usize,
}

impl<T> Default for SlotVector<T> {
    fn default() -> Self {
        Self::new()
    }
}

impl<T> fmt::Debug for SlotVector<T> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("SlotVector")
            .field("len", &self.len)
            .field("capacity", &self.values.len())
            .field("free", &self.free_list.len())
            .finish()
    }
}

impl<T> SlotVector<T> {
    /// Creates an empty arena with the null slot reserved.
    pub fn new() -> Self {
        Self {
            values: vec![None],
            free_list: Vec::new(),
            len: 0,
        }
    }

    /// Returns the number of occupied slots.
    pub fn len(&self) -> usize {
        self.len
    }

    /// Returns `true` if no slot is occupied.
    pub fn is_empty(&self) -> bool {
        self.len == 0
    }

    /// Stores `value` and returns its id.
    ///
    /// # Panics
    ///
    /// Panics if more than `u32::MAX - 1` slots are ever allocated at once.
    pub fn insert(&mut self, value: T) -> SlotId {
        self.len += 1;
        if let Some(index) = self.free_list.pop() {
            self.values[index as usize] = Some(value);
            return SlotId(index);
        }
        let index = u32::try_from(self.values.len()).unwrap_or_else(|_| {
            panic!("slot arena exhausted");
        });
        self.values.push(Some(value));
        SlotId(index)
    }

    /// Removes and returns the value in `id`, freeing the slot for reuse.
    pub fn remove(&mut self, id: SlotId) -> Option<T> {
        if id.is_null() {
            return None;
        }
        let value = self.values.get_mut(id.index())?.take()?;
        self.free_list.push(id.0);
        self.len -= 1;
        Some(value)
    }

    /// Returns the value in `id`.
    #[inline(always)]
    pub fn get(&self, id: SlotId) -> Option<&T> {
        self.values.get(id.index()).and_then(Option::as_ref)
    }

    /// Returns the value in `id` mutably.
    #[inline(always)]
    pub fn get_mut(&mut self, id: SlotId) -> Option<&mut T> {
        self.values.get_mut(id.index()).and_then(Option::as_mut)
    }

    /// Returns `true` if `id` refers to an occupied slot.
    pub fn contains(&self, id: SlotId) -> bool {
        self.get(id).is_some()
    }

    /// Iterates occupied slots in index order.
    pub fn iter(&self) -> impl Iterator<Item = (SlotId, &T)> {
        self.values
            .iter()
            .enumerate()
            .filter_map(|(i, v)| v.as_ref().map(|v| (SlotId(i as u32), v)))
    }

    /// Removes every value, returning them in index order.
    pub fn drain(&mut self) -> Vec<T> {
        let out: Vec<T> = self.values.iter_mut().filter_map(Option::take).collect();
        self.values.truncate(1);
        self.free_list.clear();
        self.len = 0;
        out
    }
}
