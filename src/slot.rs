//! Slot arena entries and the contract constants.

use std::fmt;

use crate::buffer::GraphicsBuffer;
use crate::fence::Fence;

/// Fixed size of the slot arena.
pub const MAX_SLOT_COUNT: usize = 64;

/// Upper bound for the consumer's acquired-buffer budget. Two slots always
/// stay out of the acquired set so the producer can make progress.
pub const MAX_MAX_ACQUIRED_BUFFERS: usize = MAX_SLOT_COUNT - 2;

/// The pool never shrinks below this many slots.
pub const MIN_BUFFER_COUNT: usize = 2;

/// Typed index into the slot arena.
///
/// Only the queue constructs these, so holding one proves the slot was handed
/// out by a queue operation; staleness across reconnects is still checked per
/// call via the connection epoch.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct SlotIndex(pub(crate) usize);

impl SlotIndex {
    pub fn get(self) -> usize {
        self.0
    }
}

impl fmt::Display for SlotIndex {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        self.0.fmt(f)
    }
}

/// Lifecycle state of one slot. Legal transitions:
/// Free -> Dequeued -> Queued -> Acquired -> Free, plus Dequeued -> Free
/// (cancel, detach) and Queued -> Free (async replacement).
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum SlotState {
    Free,
    Dequeued,
    Queued,
    Acquired,
}

#[derive(Debug)]
pub(crate) struct BufferSlot {
    pub(crate) state: SlotState,
    pub(crate) buffer: Option<GraphicsBuffer>,
    /// What the next owner of the slot must wait on before touching the
    /// buffer contents.
    pub(crate) fence: Fence,
    /// Frame number of the last queue of this slot; orders free-slot reuse.
    pub(crate) frame_number: u64,
    /// Connection epoch at dequeue time; rejects slots from a previous
    /// producer connection.
    pub(crate) epoch: u64,
    /// Set when dequeue reallocated the buffer and the producer has not yet
    /// re-requested the handle.
    pub(crate) needs_reallocation: bool,
}

impl BufferSlot {
    pub(crate) fn new() -> Self {
        BufferSlot {
            state: SlotState::Free,
            buffer: None,
            fence: Fence::signaled(),
            frame_number: 0,
            epoch: 0,
            needs_reallocation: false,
        }
    }

    pub(crate) fn is_free(&self) -> bool {
        self.state == SlotState::Free
    }

    /// Reset to the unallocated free state, handing back whatever buffer the
    /// slot held.
    pub(crate) fn clear(&mut self) -> Option<GraphicsBuffer> {
        self.state = SlotState::Free;
        self.fence = Fence::signaled();
        self.needs_reallocation = false;
        self.buffer.take()
    }
}
