use std::cmp::Reverse;
use std::collections::BinaryHeap;

/// Hands out small thread identity numbers, reusing freed ones lowest first.
///
/// Each pool owns one allocator, so ids are only unique within that pool.
#[derive(Debug, Default)]
pub struct IdAllocator {
    next: usize,
    free: BinaryHeap<Reverse<usize>>,
}

impl IdAllocator {
    /// Creates an allocator whose first id is `0`.
    pub fn new() -> Self {
        Self::default()
    }

    /// Returns the smallest free id.
    pub fn acquire(&mut self) -> usize {
        match self.free.pop() {
            Some(Reverse(id)) => id,
            None => {
                let id = self.next;
                self.next += 1;
                id
            }
        }
    }

    /// Returns `id` to the free list.
    pub fn release(&mut self, id: usize) {
        debug_assert!(id < self.next, "releasing id {id} that was never acquired");
        self.free.push(Reverse(id));
    }

    /// Number of ids currently handed out.
    pub fn in_use(&self) -> usize {
        self.next - self.free.len()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn freed_ids_are_reused_lowest_first() {
        let mut ids = IdAllocator::new();
        assert_eq!((ids.acquire(), ids.acquire(), ids.acquire()), (0, 1, 2));

        ids.release(2);
        ids.release(0);
        assert_eq!(ids.in_use(), 1);
        assert_eq!(ids.acquire(), 0);
        assert_eq!(ids.acquire(), 2);
        assert_eq!(ids.acquire(), 3);
        assert_eq!(ids.in_use(), 4);
    }
}
