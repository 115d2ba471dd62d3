/// [start, end)
#[derive(Debug, Copy, Clone, PartialEq, Eq)]
pub struct AddressRange {
    pub start: usize,
    pub end: usize,
}

impl AddressRange {
    #[inline]
    pub fn new(start: usize, len: usize) -> Self {
        Self {
            start,
            end: start.saturating_add(len),
        }
    }

    /// Determine whether the target address is in the current range.
    #[inline]
    pub fn contains(&self, target: usize) -> bool {
        self.start <= target && target < self.end
    }

    #[inline]
    pub fn len(&self) -> usize {
        self.end - self.start
    }

    #[inline]
    pub fn is_empty(&self) -> bool {
        self.start >= self.end
    }
}
