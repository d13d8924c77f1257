use std::collections::BTreeMap;

/// Tracks which ranges of a VM's address space are bound.
///
/// Addresses here are caller-chosen; the aperture only rejects ranges that fall
/// outside `[base, limit)` or overlap an existing binding.
#[derive(Debug)]
pub struct Aperture {
    base: u64,
    limit: u64,

    // Start Address -> Size
    ranges: BTreeMap<u64, u64>,
}

impl Aperture {
    #[must_use]
    pub const fn new(base: u64, limit: u64) -> Self {
        Self {
            base,
            limit,
            ranges: BTreeMap::new(),
        }
    }

    #[must_use]
    pub const fn bounds(&self) -> (u64, u64) {
        (self.base, self.limit)
    }

    /// Claims `[start, start + size)`. Returns `false` on overlap or out of bounds.
    pub fn reserve_fixed(&mut self, start: u64, size: u64) -> bool {
        let Some(end) = start.checked_add(size) else {
            return false;
        };
        if size == 0 || start < self.base || end > self.limit {
            return false;
        }

        // Closest range starting at or below `start` must end before it
        if let Some((&prev_start, &prev_size)) = self.ranges.range(..=start).next_back()
            && prev_start + prev_size > start
        {
            return false;
        }

        // Next range must start at or after our end
        if let Some((&next_start, _)) = self.ranges.range(start..).next()
            && next_start < end
        {
            return false;
        }

        self.ranges.insert(start, size);
        true
    }

    /// Releases a range claimed by `reserve_fixed`, returning its size.
    pub fn release(&mut self, start: u64) -> Option<u64> {
        self.ranges.remove(&start)
    }

    #[must_use]
    pub fn len(&self) -> usize {
        self.ranges.len()
    }

    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.ranges.is_empty()
    }
}
