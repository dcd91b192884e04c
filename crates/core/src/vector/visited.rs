//! Generation-stamped visited set for graph traversal.
//!
//! Clearing bumps a generation counter instead of zeroing the array, so one
//! set can be reused across every search on a thread.

#[derive(Debug)]
pub struct VisitedSet {
    marks: Vec<u16>,
    generation: u16,
}

impl VisitedSet {
    pub fn new(capacity: usize) -> Self {
        Self {
            marks: vec![0; capacity],
            generation: 1,
        }
    }

    pub fn clear(&mut self) {
        if self.generation == u16::MAX {
            self.marks.fill(0);
            self.generation = 1;
        } else {
            self.generation += 1;
        }
    }

    pub fn ensure_capacity(&mut self, cap: usize) {
        if cap > self.marks.len() {
            self.marks.resize(cap, 0);
        }
    }

    /// Returns `true` the first time `id` is seen since the last clear.
    #[inline]
    pub fn insert(&mut self, id: u32) -> bool {
        let idx = id as usize;
        if idx >= self.marks.len() {
            self.marks.resize(idx + 1, 0);
        }
        if self.marks[idx] == self.generation {
            false
        } else {
            self.marks[idx] = self.generation;
            true
        }
    }
}

impl Default for VisitedSet {
    fn default() -> Self {
        Self::new(0)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn clear_forgets_previous_marks() {
        let mut vs = VisitedSet::new(8);
        assert!(vs.insert(3));
        assert!(!vs.insert(3));
        vs.clear();
        assert!(vs.insert(3));
    }

    #[test]
    fn grows_on_out_of_range_ids() {
        let mut vs = VisitedSet::default();
        assert!(vs.insert(100));
        assert!(!vs.insert(100));
    }

    #[test]
    fn generation_wraps_with_full_reset() {
        let mut vs = VisitedSet::new(4);
        for _ in 0..u16::MAX as usize {
            vs.clear();
        }
        assert_eq!(vs.generation, 1);
        assert!(vs.insert(2));
    }
}
