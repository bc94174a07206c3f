//! Fixed-size heap arena.
//!
//! The arena is the memory budget every instance allocation is carved from.
//! It never grows. Regions are handed out first-fit over the arena's address
//! range and return to the free list (coalescing with neighbours) when the
//! [`ArenaRegion`] guard drops, so fragmentation behaves as it would on a
//! fixed pool in device RAM.
//!
//! Only the guest-visible budget is charged: each instance's execution
//! stack and linear memory. The interpreter's own allocations (engine,
//! compiled code, store bookkeeping) live outside the arena and are not
//! reflected in [`MemoryUsage`].

use std::fmt;
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};

use serde::{Deserialize, Serialize};

use crate::error::{BridgeError, Result};

/// Allocation granularity in bytes.
pub const ARENA_ALIGN: usize = 16;

/// Snapshot of arena usage.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct MemoryUsage {
    /// Total arena size in bytes
    pub capacity: usize,
    /// Bytes currently reserved
    pub used: usize,
    /// High-water mark of `used`
    pub peak: usize,
    /// Bytes not reserved
    pub free: usize,
    /// Largest contiguous free block
    pub largest_free_block: usize,
    /// Number of live regions
    pub live_regions: usize,
}

impl fmt::Display for MemoryUsage {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let pct = if self.capacity == 0 {
            0.0
        } else {
            self.used as f64 * 100.0 / self.capacity as f64
        };
        write!(
            f,
            "heap arena: {}/{} bytes used ({:.1}%), peak {} bytes, free {} bytes, largest free block {} bytes, {} live regions",
            self.used, self.capacity, pct, self.peak, self.free, self.largest_free_block, self.live_regions
        )
    }
}

#[derive(Debug, Clone, Copy)]
struct FreeBlock {
    offset: usize,
    len: usize,
}

#[derive(Debug)]
struct ArenaState {
    capacity: usize,
    /// Sorted by offset, never adjacent.
    free: Vec<FreeBlock>,
    used: usize,
    peak: usize,
    live: usize,
}

impl ArenaState {
    fn allocate(&mut self, len: usize) -> Option<usize> {
        let idx = self.free.iter().position(|b| b.len >= len)?;
        let block = &mut self.free[idx];
        let offset = block.offset;
        if block.len == len {
            self.free.remove(idx);
        } else {
            block.offset += len;
            block.len -= len;
        }
        self.used += len;
        self.peak = self.peak.max(self.used);
        self.live += 1;
        Some(offset)
    }

    fn release(&mut self, offset: usize, len: usize) {
        let idx = self.free.partition_point(|b| b.offset < offset);
        self.free.insert(idx, FreeBlock { offset, len });

        if idx + 1 < self.free.len() && self.free[idx].offset + self.free[idx].len == self.free[idx + 1].offset {
            self.free[idx].len += self.free[idx + 1].len;
            self.free.remove(idx + 1);
        }
        if idx > 0 && self.free[idx - 1].offset + self.free[idx - 1].len == self.free[idx].offset {
            self.free[idx - 1].len += self.free[idx].len;
            self.free.remove(idx);
        }

        self.used -= len;
        self.live -= 1;
    }

    fn largest_free_block(&self) -> usize {
        self.free.iter().map(|b| b.len).max().unwrap_or(0)
    }

    fn usage(&self) -> MemoryUsage {
        MemoryUsage {
            capacity: self.capacity,
            used: self.used,
            peak: self.peak,
            free: self.capacity - self.used,
            largest_free_block: self.largest_free_block(),
            live_regions: self.live,
        }
    }
}

fn lock(state: &Mutex<ArenaState>) -> MutexGuard<'_, ArenaState> {
    state.lock().unwrap_or_else(PoisonError::into_inner)
}

/// Fixed-size memory pool shared by the runtime and its instances.
///
/// Cloning yields another handle to the same pool.
#[derive(Clone)]
pub struct HeapArena {
    state: Arc<Mutex<ArenaState>>,
}

impl HeapArena {
    /// Create an arena of `capacity` bytes.
    pub fn new(capacity: usize) -> Result<Self> {
        if capacity < ARENA_ALIGN {
            return Err(BridgeError::InvalidSize {
                what: "heap",
                detail: format!("{} bytes cannot hold a single region", capacity),
            });
        }
        let state = ArenaState {
            capacity,
            free: vec![FreeBlock { offset: 0, len: capacity }],
            used: 0,
            peak: 0,
            live: 0,
        };
        Ok(Self {
            state: Arc::new(Mutex::new(state)),
        })
    }

    /// Total size in bytes.
    pub fn capacity(&self) -> usize {
        lock(&self.state).capacity
    }

    /// Reserve `len` bytes (rounded up to [`ARENA_ALIGN`]).
    pub fn allocate(&self, len: usize, purpose: &'static str) -> Result<ArenaRegion> {
        let mut state = lock(&self.state);
        let (offset, len) = reserve(&mut state, len, purpose)?;
        drop(state);
        Ok(self.region(offset, len, purpose))
    }

    /// Reserve `first` and, if given, `second` as one step: either both
    /// regions are committed or the arena is left exactly as it was,
    /// peak included.
    pub fn allocate_pair(
        &self,
        first: (usize, &'static str),
        second: Option<(usize, &'static str)>,
    ) -> Result<(ArenaRegion, Option<ArenaRegion>)> {
        let mut state = lock(&self.state);
        let peak = state.peak;

        let (first_offset, first_len) = reserve(&mut state, first.0, first.1)?;
        let second = match second {
            Some((len, purpose)) => match reserve(&mut state, len, purpose) {
                Ok((offset, len)) => Some((offset, len, purpose)),
                Err(e) => {
                    state.release(first_offset, first_len);
                    state.peak = peak;
                    return Err(e);
                }
            },
            None => None,
        };
        drop(state);

        Ok((
            self.region(first_offset, first_len, first.1),
            second.map(|(offset, len, purpose)| self.region(offset, len, purpose)),
        ))
    }

    fn region(&self, offset: usize, len: usize, purpose: &'static str) -> ArenaRegion {
        ArenaRegion {
            state: Arc::clone(&self.state),
            offset,
            len,
            purpose,
        }
    }

    /// Current usage snapshot.
    pub fn usage(&self) -> MemoryUsage {
        lock(&self.state).usage()
    }
}

impl fmt::Debug for HeapArena {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("HeapArena").field("usage", &self.usage()).finish()
    }
}

/// A reserved arena range. Released on drop.
pub struct ArenaRegion {
    state: Arc<Mutex<ArenaState>>,
    offset: usize,
    len: usize,
    purpose: &'static str,
}

impl ArenaRegion {
    /// Offset within the arena.
    pub fn offset(&self) -> usize {
        self.offset
    }

    /// Reserved length (aligned).
    pub fn len(&self) -> usize {
        self.len
    }

    /// Always false; regions are at least [`ARENA_ALIGN`] bytes.
    pub fn is_empty(&self) -> bool {
        self.len == 0
    }

    /// What the region was reserved for.
    pub fn purpose(&self) -> &'static str {
        self.purpose
    }
}

impl Drop for ArenaRegion {
    fn drop(&mut self) {
        let mut state = lock(&self.state);
        state.release(self.offset, self.len);
        tracing::trace!(purpose = self.purpose, offset = self.offset, len = self.len, "arena region released");
    }
}

impl fmt::Debug for ArenaRegion {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ArenaRegion")
            .field("purpose", &self.purpose)
            .field("offset", &self.offset)
            .field("len", &self.len)
            .finish()
    }
}

/// Carve an aligned block out of locked state. Returns `(offset, len)`.
fn reserve(state: &mut ArenaState, len: usize, purpose: &'static str) -> Result<(usize, usize)> {
    let aligned = align_up(len.max(1)).ok_or(BridgeError::ArenaExhausted {
        purpose,
        requested: len,
        available: 0,
    })?;
    let offset = state.allocate(aligned).ok_or_else(|| BridgeError::ArenaExhausted {
        purpose,
        requested: aligned,
        available: state.largest_free_block(),
    })?;
    tracing::trace!(purpose, offset, len = aligned, used = state.used, "arena region reserved");
    Ok((offset, aligned))
}

fn align_up(len: usize) -> Option<usize> {
    len.checked_add(ARENA_ALIGN - 1).map(|n| n & !(ARENA_ALIGN - 1))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_new_rejects_tiny_capacity() {
        assert!(matches!(HeapArena::new(0), Err(BridgeError::InvalidSize { .. })));
        assert!(HeapArena::new(1024).is_ok());
    }

    #[test]
    fn test_allocate_aligns_and_accounts() {
        let arena = HeapArena::new(1024).unwrap();
        let a = arena.allocate(10, "stack").unwrap();
        assert_eq!(a.len(), 16);
        assert_eq!(a.offset(), 0);

        let b = arena.allocate(100, "memory").unwrap();
        assert_eq!(b.offset(), 16);
        assert_eq!(b.len(), 112);

        let usage = arena.usage();
        assert_eq!(usage.used, 128);
        assert_eq!(usage.free, 1024 - 128);
        assert_eq!(usage.live_regions, 2);
    }

    #[test]
    fn test_exhaustion_reports_largest_block() {
        let arena = HeapArena::new(256).unwrap();
        let _a = arena.allocate(200, "memory").unwrap();
        let err = arena.allocate(100, "stack").unwrap_err();
        match err {
            BridgeError::ArenaExhausted { purpose, requested, available } => {
                assert_eq!(purpose, "stack");
                assert_eq!(requested, 112);
                assert_eq!(available, 48);
            }
            other => panic!("unexpected error: {other}"),
        }
    }

    #[test]
    fn test_drop_releases_and_coalesces() {
        let arena = HeapArena::new(512).unwrap();
        let a = arena.allocate(128, "a").unwrap();
        let b = arena.allocate(128, "b").unwrap();
        let c = arena.allocate(128, "c").unwrap();

        drop(b);
        assert_eq!(arena.usage().largest_free_block, 128);

        drop(a);
        // a and b merge into one 256 byte hole
        assert_eq!(arena.usage().largest_free_block, 256);

        drop(c);
        let usage = arena.usage();
        assert_eq!(usage.used, 0);
        assert_eq!(usage.largest_free_block, 512);
        assert_eq!(usage.live_regions, 0);
        assert_eq!(usage.peak, 384);
    }

    #[test]
    fn test_usage_never_exceeds_capacity() {
        let arena = HeapArena::new(4096).unwrap();
        let mut held = Vec::new();
        for i in 0..64 {
            match arena.allocate(100 + i * 7, "churn") {
                Ok(region) => held.push(region),
                Err(_) => {
                    held.remove(0);
                }
            }
            let usage = arena.usage();
            assert!(usage.used <= usage.capacity);
            assert!(usage.peak <= usage.capacity);
        }
    }

    #[test]
    fn test_pair_is_all_or_nothing() {
        let arena = HeapArena::new(1024).unwrap();
        let _held = arena.allocate(256, "held").unwrap();

        let err = arena
            .allocate_pair((512, "stack"), Some((512, "memory")))
            .unwrap_err();
        assert!(matches!(err, BridgeError::ArenaExhausted { purpose: "memory", .. }));

        let usage = arena.usage();
        assert_eq!(usage.used, 256);
        assert_eq!(usage.peak, 256);
        assert_eq!(usage.live_regions, 1);
        assert_eq!(usage.largest_free_block, 768);

        let (stack, memory) = arena.allocate_pair((256, "stack"), Some((512, "memory"))).unwrap();
        assert_eq!(stack.offset(), 256);
        assert_eq!(memory.map(|m| m.offset()), Some(512));
        assert_eq!(arena.usage().used, 1024);
    }

    #[test]
    fn test_pair_without_second() {
        let arena = HeapArena::new(1024).unwrap();
        let (stack, memory) = arena.allocate_pair((100, "stack"), None).unwrap();
        assert_eq!(stack.len(), 112);
        assert!(memory.is_none());
        assert_eq!(arena.usage().live_regions, 1);
    }

    #[test]
    fn test_usage_display() {
        let arena = HeapArena::new(1024).unwrap();
        let _r = arena.allocate(256, "memory").unwrap();
        let text = arena.usage().to_string();
        assert!(text.contains("256/1024 bytes used"));
        assert!(text.contains("25.0%"));
    }
}
