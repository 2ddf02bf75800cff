use std::{collections::HashMap, fmt, hash::Hash};

/// A vector partitioned into an active prefix and an inactive suffix.
///
/// Moving a handle between the two partitions is O(1): the handle is swapped
/// with the one sitting at the partition boundary and the boundary is moved by
/// one. This reorders handles, which is fine for round-robin scheduling since
/// the relative order of the other active handles is preserved up to the
/// swapped pair.
///
/// ```text
///   index:   0    1    2  | 3    4
///   items: [p0] [p4] [p2] | [p1] [p3]
///            '- active -'    '- inactive -'
/// ```
pub struct ActiveSet<H> {
    items: Vec<H>,
    index: HashMap<H, usize>,
    active: usize,
}

impl<H> ActiveSet<H>
where
    H: Copy + Eq + Hash,
{
    pub fn new() -> Self {
        Self {
            items: Vec::new(),
            index: HashMap::new(),
            active: 0,
        }
    }

    /// Total number of handles, active or not.
    pub fn len(&self) -> usize {
        self.items.len()
    }

    pub fn is_empty(&self) -> bool {
        self.items.is_empty()
    }

    /// Number of handles in the active partition.
    pub fn active_len(&self) -> usize {
        self.active
    }

    /// The active partition.
    pub fn active(&self) -> &[H] {
        &self.items[..self.active]
    }

    pub fn get(&self, i: usize) -> Option<H> {
        self.items.get(i).copied()
    }

    pub fn contains(&self, h: H) -> bool {
        self.index.contains_key(&h)
    }

    pub fn is_active(&self, h: H) -> bool {
        self.index.get(&h).is_some_and(|&i| i < self.active)
    }

    /// Index of `h` in the active partition.
    pub fn active_index(&self, h: H) -> Option<usize> {
        self.index.get(&h).copied().filter(|&i| i < self.active)
    }

    /// Adds `h` to the active partition.
    ///
    /// Returns `false` and leaves the set untouched if `h` is already present.
    pub fn push_active(&mut self, h: H) -> bool {
        if !self.push_inactive(h) {
            return false;
        }
        let last = self.items.len() - 1;
        self.swap(last, self.active);
        self.active += 1;
        true
    }

    /// Adds `h` to the inactive partition.
    pub fn push_inactive(&mut self, h: H) -> bool {
        if self.index.contains_key(&h) {
            return false;
        }
        self.index.insert(h, self.items.len());
        self.items.push(h);
        true
    }

    /// Moves `h` into the active partition, returning `false` if `h` is unknown
    /// or already active.
    pub fn activate(&mut self, h: H) -> bool {
        match self.index.get(&h) {
            Some(&i) if i >= self.active => {
                self.swap(i, self.active);
                self.active += 1;
                true
            }
            _ => false,
        }
    }

    /// Moves the active handle at index `i` to the inactive partition.
    ///
    /// The handle previously at the end of the active partition takes its
    /// slot.
    pub fn deactivate_at(&mut self, i: usize) {
        debug_assert!(i < self.active, "Deactivating an inactive slot");
        self.active -= 1;
        self.swap(i, self.active);
    }

    /// Removes `h`, returning whether it was in the active partition, or `None`
    /// if it was unknown.
    pub fn remove(&mut self, h: H) -> Option<bool> {
        let mut i = *self.index.get(&h)?;
        let was_active = i < self.active;
        if was_active {
            self.deactivate_at(i);
            i = self.active;
        }
        let last = self.items.len() - 1;
        self.swap(i, last);
        self.items.pop();
        self.index.remove(&h);
        Some(was_active)
    }

    fn swap(&mut self, a: usize, b: usize) {
        if a == b {
            return;
        }
        self.items.swap(a, b);
        self.index.insert(self.items[a], a);
        self.index.insert(self.items[b], b);
    }
}

impl<H> Default for ActiveSet<H>
where
    H: Copy + Eq + Hash,
{
    fn default() -> Self {
        Self::new()
    }
}

impl<H: fmt::Debug> fmt::Debug for ActiveSet<H> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ActiveSet")
            .field("active", &&self.items[..self.active])
            .field("inactive", &&self.items[self.active..])
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use rand::Rng;

    use super::*;

    fn check<H: Copy + Eq + Hash + fmt::Debug>(set: &ActiveSet<H>) {
        assert_eq!(set.items.len(), set.index.len());
        assert!(set.active <= set.items.len());
        for (i, h) in set.items.iter().enumerate() {
            assert_eq!(set.index[h], i, "{set:?}");
        }
    }

    #[test]
    fn partitions() {
        let mut set = ActiveSet::new();
        for i in 0..5 {
            assert!(set.push_active(i));
        }
        assert!(!set.push_active(3));
        assert_eq!(set.active(), &[0, 1, 2, 3, 4]);

        set.deactivate_at(1);
        assert_eq!(set.active(), &[0, 4, 2, 3]);
        assert!(!set.is_active(1));

        assert!(set.activate(1));
        assert!(!set.activate(1));
        assert_eq!(set.active(), &[0, 4, 2, 3, 1]);

        set.push_inactive(9);
        assert_eq!(set.active_len(), 5);
        assert_eq!(set.len(), 6);

        assert_eq!(set.remove(4), Some(true));
        assert_eq!(set.remove(9), Some(false));
        assert_eq!(set.remove(9), None);
        assert_eq!(set.active_len(), 4);
        check(&set);
    }

    #[test]
    fn random_ops_keep_index_consistent() {
        let mut rng = rand::rng();
        let mut set = ActiveSet::new();
        for _ in 0..10_000 {
            let h: u8 = rng.random_range(0..32);
            match rng.random_range(0..5) {
                0 => {
                    set.push_active(h);
                }
                1 => {
                    set.push_inactive(h);
                }
                2 => {
                    set.activate(h);
                }
                3 if set.active_len() > 0 => {
                    let i = rng.random_range(0..set.active_len());
                    set.deactivate_at(i);
                }
                _ => {
                    set.remove(h);
                }
            }
            check(&set);
        }
    }
}
