//! Small integer handles with lowest-free reuse.
//!
//! Pools hand out opaque `u32` handles instead of references to the resources
//! they own. A released integer is reissued before any fresh one, and the
//! smallest released integer always goes first.

use std::collections::BTreeSet;
use std::fmt;

/// Handle to a buffer region owned by a [`MemoryBlock`](crate::memory::MemoryBlock).
///
/// Unique among the live buffers of one block only.
#[derive(Clone, Copy, Debug, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct BufferHandle(pub(crate) u32);

impl BufferHandle {
    /// Raw integer value.
    pub const fn index(self) -> u32 {
        self.0
    }
}

impl fmt::Display for BufferHandle {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "buffer#{}", self.0)
    }
}

/// Handle to a command buffer owned by a [`CommandPool`](crate::command::CommandPool).
#[derive(Clone, Copy, Debug, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct CommandBufferHandle(pub(crate) u32);

impl CommandBufferHandle {
    /// Raw integer value.
    pub const fn index(self) -> u32 {
        self.0
    }
}

impl fmt::Display for CommandBufferHandle {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "cmd#{}", self.0)
    }
}

/// Issues and recycles handle integers.
#[derive(Clone, Debug, Default)]
pub struct HandleAllocator {
    released: BTreeSet<u32>,
    next: u32,
}

impl HandleAllocator {
    /// Create an empty allocator.
    pub fn new() -> Self {
        Self::default()
    }

    /// Issue the lowest integer not currently live.
    pub fn acquire(&mut self) -> u32 {
        self.released.pop_first().unwrap_or_else(|| {
            let id = self.next;
            self.next += 1;
            id
        })
    }

    /// Return an integer for reuse. Returns `false` if it was not live.
    pub fn release(&mut self, id: u32) -> bool {
        if !self.is_live(id) {
            return false;
        }
        if id + 1 == self.next {
            // Shrink the high-water mark so released ids never pile up at the top.
            self.next -= 1;
            while self.next > 0 && self.released.remove(&(self.next - 1)) {
                self.next -= 1;
            }
        } else {
            self.released.insert(id);
        }
        true
    }

    /// Whether `id` is currently issued.
    pub fn is_live(&self, id: u32) -> bool {
        id < self.next && !self.released.contains(&id)
    }

    /// Number of live handles.
    pub fn live_count(&self) -> usize {
        self.next as usize - self.released.len()
    }

    /// Highest issued integer + 1.
    pub fn high_water_mark(&self) -> u32 {
        self.next
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn reuses_lowest_released() {
        let mut alloc = HandleAllocator::new();
        assert_eq!(alloc.acquire(), 0);
        assert_eq!(alloc.acquire(), 1);
        assert_eq!(alloc.acquire(), 2);
        assert_eq!(alloc.acquire(), 3);

        assert!(alloc.release(2));
        assert!(alloc.release(1));
        assert_eq!(alloc.acquire(), 1);
        assert_eq!(alloc.acquire(), 2);
        assert_eq!(alloc.acquire(), 4);
    }

    #[test]
    fn double_release_is_rejected() {
        let mut alloc = HandleAllocator::new();
        let a = alloc.acquire();
        assert!(alloc.release(a));
        assert!(!alloc.release(a));
        assert!(!alloc.release(17));
    }

    #[test]
    fn releasing_top_shrinks_high_water_mark() {
        let mut alloc = HandleAllocator::new();
        for _ in 0..4 {
            alloc.acquire();
        }
        alloc.release(1);
        alloc.release(2);
        alloc.release(3);
        assert_eq!(alloc.high_water_mark(), 1);
        assert_eq!(alloc.live_count(), 1);
        assert_eq!(alloc.acquire(), 1);
    }

    #[test]
    fn display_names_the_kind() {
        assert_eq!(BufferHandle(3).to_string(), "buffer#3");
        assert_eq!(CommandBufferHandle(0).to_string(), "cmd#0");
    }
}
