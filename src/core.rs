//! Shared queue state behind one coarse mutex.
//!
//! Every multi-step operation on [`QueueCore`] holds the state lock for its
//! full duration except two documented windows: waiting on the dequeue
//! condition, and calling out to the allocator. Both re-validate state after
//! reacquiring. The `CoreState` helpers here assume the lock is held and are
//! never independently thread-safe.

use std::collections::VecDeque;
use std::sync::Arc;

use tracing::debug;

use crate::buffer::{BufferAllocator, BufferFormat};
use crate::consumer::ConsumerListener;
use crate::error::{QueueError, Result};
use crate::fence::Fence;
use crate::producer::ProducerListener;
use crate::slot::{BufferSlot, SlotIndex, SlotState, MAX_SLOT_COUNT, MIN_BUFFER_COUNT};
use crate::sync::{Condvar, Mutex, MutexGuard};

/// Which producer API owns the connection.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum ProducerApi {
    Egl,
    Cpu,
    Media,
    Camera,
}

/// Display transform to apply when the frame is consumed.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub enum Transform {
    #[default]
    Identity,
    FlipHorizontal,
    FlipVertical,
    Rotate90,
    Rotate180,
    Rotate270,
}

/// Axis-aligned crop rectangle in buffer pixel coordinates.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub struct Rect {
    pub left: u32,
    pub top: u32,
    pub right: u32,
    pub bottom: u32,
}

impl Rect {
    pub fn new(left: u32, top: u32, right: u32, bottom: u32) -> Self {
        Rect {
            left,
            top,
            right,
            bottom,
        }
    }

    /// An empty crop means "the whole buffer".
    pub fn is_empty(&self) -> bool {
        self.right <= self.left || self.bottom <= self.top
    }

    pub fn fits_within(&self, width: u32, height: u32) -> bool {
        self.right <= width && self.bottom <= height
    }
}

/// One FIFO entry: a queued frame waiting to be acquired.
#[derive(Clone, Debug)]
pub struct QueueItem {
    pub slot: SlotIndex,
    pub fence: Fence,
    pub timestamp_ns: u64,
    pub crop: Rect,
    pub transform: Transform,
    pub frame_number: u64,
}

/// Producer-visible query surface.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum Query {
    Width,
    Height,
    Format,
    MinUndequeuedBuffers,
    ConsumerUsageBits,
}

pub(crate) struct CoreState {
    pub(crate) slots: [BufferSlot; MAX_SLOT_COUNT],
    pub(crate) fifo: VecDeque<QueueItem>,
    pub(crate) connected_api: Option<ProducerApi>,
    pub(crate) producer_listener: Option<Arc<dyn ProducerListener>>,
    pub(crate) consumer_listener: Option<Arc<dyn ConsumerListener>>,
    pub(crate) consumer_connected: bool,
    pub(crate) default_max_buffer_count: usize,
    /// Producer override of the pool capacity; 0 means unset.
    pub(crate) override_max_buffer_count: usize,
    pub(crate) max_acquired_buffers: usize,
    pub(crate) async_mode: bool,
    pub(crate) abandoned: bool,
    /// A bulk allocation is in flight with the lock released.
    pub(crate) allocating: bool,
    pub(crate) frame_counter: u64,
    /// Bumped on every producer connect; stamped into slots at dequeue.
    pub(crate) connect_epoch: u64,
    /// Buffers must carry this generation to be attached.
    pub(crate) generation: u32,
    /// Every slot was invalidated since the producer's last dequeue.
    pub(crate) release_all_pending: bool,
    pub(crate) default_width: u32,
    pub(crate) default_height: u32,
    pub(crate) default_format: BufferFormat,
    pub(crate) consumer_usage_bits: u64,
    pub(crate) consumer_controlled_by_app: bool,
    pub(crate) producer_controlled_by_app: bool,
    /// Computed once at producer connect from both controlled-by-app bits.
    pub(crate) dequeue_cannot_block: bool,
}

impl CoreState {
    fn new() -> Self {
        CoreState {
            slots: std::array::from_fn(|_| BufferSlot::new()),
            fifo: VecDeque::new(),
            connected_api: None,
            producer_listener: None,
            consumer_listener: None,
            consumer_connected: false,
            default_max_buffer_count: MAX_SLOT_COUNT,
            override_max_buffer_count: 0,
            max_acquired_buffers: 1,
            async_mode: false,
            abandoned: false,
            allocating: false,
            frame_counter: 0,
            connect_epoch: 0,
            generation: 0,
            release_all_pending: false,
            default_width: 1,
            default_height: 1,
            default_format: BufferFormat::RGBA_8888,
            consumer_usage_bits: 0,
            consumer_controlled_by_app: false,
            producer_controlled_by_app: false,
            dequeue_cannot_block: false,
        }
    }

    /// How many slots must stay un-dequeued so the consumer can keep up.
    pub(crate) fn min_undequeued_count(&self, async_mode: bool) -> usize {
        self.max_acquired_buffers + if async_mode { 2 } else { 1 }
    }

    /// Effective pool capacity for the given mode.
    pub(crate) fn max_buffer_count(&self, async_mode: bool) -> usize {
        let floor = self.min_undequeued_count(async_mode) + 1;
        let requested = if self.override_max_buffer_count > 0 {
            self.override_max_buffer_count
        } else {
            self.default_max_buffer_count
        };
        floor.max(requested).clamp(MIN_BUFFER_COUNT, MAX_SLOT_COUNT)
    }

    pub(crate) fn used_slot_count(&self) -> usize {
        self.slots.iter().filter(|s| !s.is_free()).count()
    }

    pub(crate) fn acquired_count(&self) -> usize {
        self.slots
            .iter()
            .filter(|s| s.state == SlotState::Acquired)
            .count()
    }

    /// Pick a free slot for dequeue: the oldest already-allocated one if any,
    /// otherwise the first unallocated one.
    pub(crate) fn find_free_slot(&self) -> Option<SlotIndex> {
        let allocated = self
            .slots
            .iter()
            .enumerate()
            .filter(|(_, s)| s.is_free() && s.buffer.is_some())
            .min_by_key(|(_, s)| s.frame_number)
            .map(|(i, _)| i);
        allocated
            .or_else(|| {
                self.slots
                    .iter()
                    .position(|s| s.is_free() && s.buffer.is_none())
            })
            .map(SlotIndex)
    }

    /// Common precondition for producer operations taking a slot they hold.
    pub(crate) fn validate_owned_by_producer(&self, index: SlotIndex) -> Result<()> {
        if self.abandoned {
            return Err(QueueError::Abandoned);
        }
        if self.connected_api.is_none() {
            return Err(QueueError::NotConnected);
        }
        let slot = self
            .slots
            .get(index.get())
            .ok_or(QueueError::InvalidArgument("slot index out of range"))?;
        if slot.state != SlotState::Dequeued {
            return Err(QueueError::InvalidArgument("slot is not dequeued"));
        }
        if slot.epoch != self.connect_epoch {
            return Err(QueueError::InvalidArgument(
                "slot predates the current producer connection",
            ));
        }
        Ok(())
    }

    /// Release a slot's buffer and reset it to the unallocated free state.
    /// Never legal on an `Acquired` slot. The stored fence may still be
    /// unsignaled here; deferring reclamation behind it is the allocator's
    /// contract (see [`BufferAllocator::release`]).
    pub(crate) fn free_slot(&mut self, index: SlotIndex, allocator: &dyn BufferAllocator) {
        let slot = &mut self.slots[index.get()];
        debug_assert_ne!(slot.state, SlotState::Acquired);
        if let Some(buffer) = slot.clear() {
            allocator.release(buffer);
        }
    }

    /// Free every non-`Acquired` slot and drop all pending frames. The next
    /// dequeue reports `release_all_buffers` so the producer drops its cached
    /// handles.
    pub(crate) fn free_all_slots(&mut self, allocator: &dyn BufferAllocator) {
        for i in 0..self.slots.len() {
            if self.slots[i].state != SlotState::Acquired {
                self.free_slot(SlotIndex(i), allocator);
            }
        }
        self.fifo.clear();
        self.release_all_pending = true;
    }
}

pub(crate) struct QueueCore {
    pub(crate) allocator: Arc<dyn BufferAllocator>,
    pub(crate) state: Mutex<CoreState>,
    /// Woken by queue, cancel, release, teardown and every capacity-policy
    /// change.
    pub(crate) dequeue_cond: Condvar,
    /// Woken when an in-flight bulk allocation finishes.
    pub(crate) allocating_cond: Condvar,
}

impl QueueCore {
    pub(crate) fn new(allocator: Arc<dyn BufferAllocator>) -> Arc<Self> {
        Arc::new(QueueCore {
            allocator,
            state: Mutex::new(CoreState::new()),
            dequeue_cond: Condvar::new(),
            allocating_cond: Condvar::new(),
        })
    }

    pub(crate) fn lock(&self) -> MutexGuard<'_, CoreState> {
        self.state.lock().unwrap()
    }

    /// Cooperative wait while another caller is inside the allocator with the
    /// lock released. Callers must re-check `abandoned` afterwards.
    pub(crate) fn wait_while_allocating<'a>(
        &self,
        mut guard: MutexGuard<'a, CoreState>,
    ) -> MutexGuard<'a, CoreState> {
        while guard.allocating {
            guard = self.allocating_cond.wait(guard).unwrap();
        }
        guard
    }

    /// Permanent consumer-side teardown. Frees every non-`Acquired` slot and
    /// deterministically wakes all blocked waiters so they fail fast.
    pub(crate) fn abandon(&self) {
        let mut guard = self.lock();
        if guard.abandoned {
            return;
        }
        guard.abandoned = true;
        guard.consumer_connected = false;
        guard.consumer_listener = None;
        guard.free_all_slots(&*self.allocator);
        debug!("buffer queue abandoned");
        self.dequeue_cond.notify_all();
        self.allocating_cond.notify_all();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use rstest::*;

    fn state() -> CoreState {
        CoreState::new()
    }

    #[rstest]
    #[case(1, false, 2)]
    #[case(1, true, 3)]
    #[case(3, false, 4)]
    #[case(3, true, 5)]
    fn test_min_undequeued_count(
        #[case] max_acquired: usize,
        #[case] async_mode: bool,
        #[case] expected: usize,
    ) {
        let mut state = state();
        state.max_acquired_buffers = max_acquired;
        assert_eq!(state.min_undequeued_count(async_mode), expected);
    }

    #[rstest]
    // default_max dominates when above the floor
    #[case(1, 0, 8, false, 8)]
    // floor = min_undequeued + 1 wins over a small default
    #[case(4, 0, 2, false, 6)]
    // override beats default
    #[case(1, 4, 8, false, 4)]
    // async mode raises the floor by one
    #[case(4, 0, 2, true, 7)]
    // everything clamps to the arena size
    #[case(1, 0, 4096, false, MAX_SLOT_COUNT)]
    fn test_max_buffer_count(
        #[case] max_acquired: usize,
        #[case] override_count: usize,
        #[case] default_count: usize,
        #[case] async_mode: bool,
        #[case] expected: usize,
    ) {
        let mut state = state();
        state.max_acquired_buffers = max_acquired;
        state.override_max_buffer_count = override_count;
        state.default_max_buffer_count = default_count;
        assert_eq!(state.max_buffer_count(async_mode), expected);
    }

    #[test]
    fn test_find_free_slot_prefers_oldest_allocated() {
        use crate::buffer::GraphicsBuffer;

        let mut state = state();
        let buffer = |id| GraphicsBuffer {
            id,
            width: 1,
            height: 1,
            format: BufferFormat::RGBA_8888,
            usage: 0,
            generation: 0,
        };
        state.slots[3].buffer = Some(buffer(3));
        state.slots[3].frame_number = 9;
        state.slots[5].buffer = Some(buffer(5));
        state.slots[5].frame_number = 4;

        assert_eq!(state.find_free_slot(), Some(SlotIndex(5)));

        state.slots[5].state = SlotState::Dequeued;
        assert_eq!(state.find_free_slot(), Some(SlotIndex(3)));

        state.slots[3].state = SlotState::Queued;
        // falls back to the first unallocated slot
        assert_eq!(state.find_free_slot(), Some(SlotIndex(0)));
    }

    #[test]
    fn test_free_all_slots_spares_acquired() {
        use crate::buffer::SoftwareAllocator;

        let allocator = SoftwareAllocator::new();
        let mut state = state();
        for i in 0..3 {
            state.slots[i].buffer = Some(
                allocator
                    .allocate(1, 1, BufferFormat::RGBA_8888, 0)
                    .unwrap(),
            );
        }
        state.slots[0].state = SlotState::Acquired;
        state.slots[1].state = SlotState::Queued;

        state.free_all_slots(&allocator);

        assert_eq!(state.slots[0].state, SlotState::Acquired);
        assert!(state.slots[0].buffer.is_some());
        assert!(state.slots[1].is_free());
        assert!(state.slots[1].buffer.is_none());
        assert!(state.release_all_pending);
        assert_eq!(allocator.live(), 1);
    }
}
