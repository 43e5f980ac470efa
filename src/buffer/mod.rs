// Segmented buffer pool
// One contiguous arena carved into fixed-size slices for socket I/O

use crate::error::{EngineError, Result};
use bytes::BytesMut;
use parking_lot::Mutex;
use std::ops::{Deref, DerefMut};
use std::sync::atomic::{AtomicU64, Ordering};
use tracing::{debug, info, warn};

/// Slices reserved per connection slot (client side plus one provider call)
pub const PREALLOCATED_OPS_PER_CONNECTION: usize = 2;

/// A fixed-size window into the arena, lent to one operation at a time
#[derive(Debug)]
pub struct BufferSlice {
    offset: usize,
    data: BytesMut,
}

impl BufferSlice {
    /// Byte offset of this slice inside the arena
    pub fn offset(&self) -> usize {
        self.offset
    }
}

impl Deref for BufferSlice {
    type Target = [u8];

    fn deref(&self) -> &[u8] {
        &self.data
    }
}

impl DerefMut for BufferSlice {
    fn deref_mut(&mut self) -> &mut [u8] {
        &mut self.data
    }
}

/// Arena bookkeeping, guarded by the pool mutex
struct ArenaState {
    /// Not-yet-carved tail of the arena; `None` until `initialize`
    tail: Option<BytesMut>,

    /// Next offset handed out by bump allocation
    bump_index: usize,

    /// Released slices, reused LIFO
    free: Vec<BufferSlice>,

    /// Per-slot marker so an offset is never on the free list twice
    slot_free: Vec<bool>,
}

/// Pool of uniform slices over a single pre-allocated arena
///
/// Slices are handed out by bump allocation until the arena is fully carved,
/// then recycled through a stack. Every slice has the same size, so there is
/// no coalescing or compaction.
pub struct SegmentedBufferPool {
    slice_size: usize,
    total_size: usize,
    state: Mutex<ArenaState>,
    acquisitions: AtomicU64,
}

impl SegmentedBufferPool {
    /// Describe a pool for `max_connections * ops_per_connection` slices
    pub fn new(slice_size: usize, max_connections: usize, ops_per_connection: usize) -> Result<Self> {
        let sizing = max_connections
            .checked_mul(ops_per_connection)
            .and_then(|slots| slice_size.checked_mul(slots).map(|total| (slots, total)));
        let Some((slots, total_size)) = sizing else {
            return Err(EngineError::Configuration(format!(
                "buffer arena of {max_connections} x {ops_per_connection} slices of {slice_size} bytes overflows"
            )));
        };

        Ok(Self {
            slice_size,
            total_size,
            state: Mutex::new(ArenaState {
                tail: None,
                bump_index: 0,
                free: Vec::with_capacity(slots),
                slot_free: vec![false; slots],
            }),
            acquisitions: AtomicU64::new(0),
        })
    }

    /// Allocate the arena; later calls are no-ops
    pub fn initialize(&self) {
        let mut state = self.state.lock();
        if state.tail.is_some() || state.bump_index > 0 {
            warn!("Buffer arena already initialized");
            return;
        }
        state.tail = Some(BytesMut::zeroed(self.total_size));
        info!(
            total_bytes = self.total_size,
            slice_size = self.slice_size,
            slices = self.capacity(),
            "Buffer arena allocated"
        );
    }

    /// Take one slice, preferring recycled ones
    pub fn acquire(&self) -> Result<BufferSlice> {
        let mut state = self.state.lock();

        if let Some(slice) = state.free.pop() {
            let slot = slice.offset / self.slice_size;
            state.slot_free[slot] = false;
            self.acquisitions.fetch_add(1, Ordering::Relaxed);
            return Ok(slice);
        }

        if state.bump_index + self.slice_size <= self.total_size {
            let offset = state.bump_index;
            let data = match state.tail.as_mut() {
                Some(tail) => tail.split_to(self.slice_size),
                None => {
                    return Err(EngineError::Configuration(
                        "buffer arena used before initialize".to_string(),
                    ))
                }
            };
            state.bump_index += self.slice_size;
            self.acquisitions.fetch_add(1, Ordering::Relaxed);
            debug!(offset = offset, "Carved new buffer slice");
            return Ok(BufferSlice { offset, data });
        }

        Err(EngineError::BufferExhausted {
            requested: 1,
            capacity: self.capacity(),
        })
    }

    /// Return a slice to the free list
    pub fn release(&self, slice: BufferSlice) {
        let slot = slice.offset / self.slice_size;
        let mut state = self.state.lock();

        if state.slot_free.get(slot).copied().unwrap_or(true) {
            warn!(offset = slice.offset, "Ignoring release of a slice that is already free");
            return;
        }

        state.slot_free[slot] = true;
        state.free.push(slice);
    }

    /// Fail unless `count` more slices can be handed out
    pub fn ensure_available(&self, count: usize) -> Result<()> {
        let available = self.available();
        if count > available {
            return Err(EngineError::BufferExhausted {
                requested: count,
                capacity: available,
            });
        }
        Ok(())
    }

    /// Slices that can still be handed out
    pub fn available(&self) -> usize {
        let state = self.state.lock();
        let uncarved = (self.total_size - state.bump_index) / self.slice_size.max(1);
        state.free.len() + uncarved
    }

    /// Total number of slices the arena holds
    pub fn capacity(&self) -> usize {
        self.total_size / self.slice_size.max(1)
    }

    pub fn slice_size(&self) -> usize {
        self.slice_size
    }

    pub fn stats(&self) -> BufferPoolStats {
        BufferPoolStats {
            total_acquisitions: self.acquisitions.load(Ordering::Relaxed),
            capacity: self.capacity(),
            available: self.available(),
        }
    }
}

/// Statistics for the buffer arena
#[derive(Debug, Clone, Copy)]
pub struct BufferPoolStats {
    pub total_acquisitions: u64,
    pub capacity: usize,
    pub available: usize,
}
