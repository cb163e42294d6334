//! Producer side of the buffer queue.
//!
//! The producer dequeues a free slot, writes into its buffer (off-lock; once
//! a slot is `Dequeued` its contents belong to the producer thread) and
//! queues it for the consumer. Connection, capacity overrides and bulk
//! pre-allocation also live here.

use std::sync::Arc;
use std::time::{SystemTime, UNIX_EPOCH};

use tracing::{debug, trace, warn};

use crate::buffer::{BufferFormat, GraphicsBuffer};
use crate::core::{CoreState, ProducerApi, Query, QueueCore, QueueItem, Rect, Transform};
use crate::error::{QueueError, Result};
use crate::fence::Fence;
use crate::slot::{SlotIndex, SlotState, MAX_SLOT_COUNT, MIN_BUFFER_COUNT};
use crate::sync::MutexGuard;

/// Notifications delivered to the producer side. Called with the queue lock
/// released.
pub trait ProducerListener: Send + Sync {
    /// The consumer released a buffer back to the free pool.
    fn on_buffer_released(&self);
}

/// Per-dequeue hints the producer must act on.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub struct DequeueFlags {
    /// The slot's buffer was (re)allocated; fetch the new handle with
    /// [`Producer::request_buffer`] before queueing.
    pub needs_reallocation: bool,
    /// Every slot was invalidated since the last dequeue; drop *all* cached
    /// handles, not just this slot's.
    pub release_all_buffers: bool,
}

#[derive(Debug)]
pub struct DequeueOutput {
    pub slot: SlotIndex,
    /// Fence left by the previous owner; wait on it before writing.
    pub fence: Fence,
    pub flags: DequeueFlags,
}

/// Frame metadata handed over with a queued buffer.
#[derive(Clone, Debug)]
pub struct QueueInput {
    /// Signals when the producer's writes to the buffer are visible.
    pub fence: Fence,
    /// Zero means "stamp with the current time".
    pub timestamp_ns: u64,
    /// Empty means the whole buffer.
    pub crop: Rect,
    pub transform: Transform,
}

impl Default for QueueInput {
    fn default() -> Self {
        QueueInput {
            fence: Fence::signaled(),
            timestamp_ns: 0,
            crop: Rect::default(),
            transform: Transform::default(),
        }
    }
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct QueueOutput {
    pub width: u32,
    pub height: u32,
    pub pending_buffers: usize,
    pub frame_number: u64,
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct ConnectOutput {
    pub width: u32,
    pub height: u32,
    pub pending_buffers: usize,
}

/// The single producer endpoint of a queue.
pub struct Producer {
    core: Arc<QueueCore>,
}

impl Producer {
    pub(crate) fn new(core: Arc<QueueCore>) -> Self {
        Producer { core }
    }

    /// Connect this producer. Fails `NotConnected` until the consumer side is
    /// connected, and `InvalidArgument` while another connection is live.
    ///
    /// The non-blocking dequeue policy is fixed here: if both endpoints are
    /// controlled by the application, dequeue never blocks.
    pub fn connect(
        &self,
        api: ProducerApi,
        listener: Option<Arc<dyn ProducerListener>>,
        controlled_by_app: bool,
    ) -> Result<ConnectOutput> {
        let mut guard = self.core.lock();
        if guard.abandoned {
            return Err(QueueError::Abandoned);
        }
        if !guard.consumer_connected {
            return Err(QueueError::NotConnected);
        }
        if guard.connected_api.is_some() {
            return Err(QueueError::InvalidArgument(
                "a producer is already connected",
            ));
        }
        guard.connected_api = Some(api);
        guard.producer_listener = listener;
        guard.producer_controlled_by_app = controlled_by_app;
        guard.dequeue_cannot_block = controlled_by_app && guard.consumer_controlled_by_app;
        guard.connect_epoch += 1;
        debug!(
            api = ?api,
            cannot_block = guard.dequeue_cannot_block,
            "producer connected"
        );
        Ok(ConnectOutput {
            width: guard.default_width,
            height: guard.default_height,
            pending_buffers: guard.fifo.len(),
        })
    }

    /// Disconnect, freeing every slot and waking every blocked dequeuer so it
    /// observes `NotConnected`. A no-op when not connected.
    pub fn disconnect(&self) -> Result<()> {
        let listener = {
            let mut guard = self.core.lock();
            if guard.abandoned {
                return Err(QueueError::Abandoned);
            }
            if guard.connected_api.is_none() {
                return Ok(());
            }
            guard.connected_api = None;
            guard.producer_listener = None;
            guard.free_all_slots(&*self.core.allocator);
            self.core.dequeue_cond.notify_all();
            debug!("producer disconnected");
            guard.consumer_listener.clone()
        };
        if let Some(listener) = listener {
            listener.on_buffers_released();
            listener.on_producer_disconnected();
        }
        Ok(())
    }

    /// Dequeue a free slot for writing.
    ///
    /// `width`/`height` must both be zero (use the queue defaults) or both be
    /// set; `usage` is ORed with the consumer's usage bits. Blocks while no
    /// slot is available unless the connection was established with both
    /// endpoints app-controlled, in which case it fails `Busy` immediately.
    /// Teardown wakes and fails every blocked caller.
    pub fn dequeue(
        &self,
        async_op: bool,
        width: u32,
        height: u32,
        format: BufferFormat,
        usage: u64,
    ) -> Result<DequeueOutput> {
        if (width == 0) != (height == 0) {
            return Err(QueueError::InvalidArgument(
                "width and height must both be zero or both be set",
            ));
        }

        let mut guard = self.core.lock();
        let index = loop {
            if guard.abandoned {
                return Err(QueueError::Abandoned);
            }
            if guard.connected_api.is_none() {
                return Err(QueueError::NotConnected);
            }
            let max = guard.max_buffer_count(async_op || guard.async_mode);
            if guard.used_slot_count() < max {
                if let Some(index) = guard.find_free_slot() {
                    break index;
                }
            }
            if guard.dequeue_cannot_block {
                return Err(QueueError::Busy);
            }
            trace!("dequeue waiting for a free slot");
            guard = self.core.dequeue_cond.wait(guard).unwrap();
        };

        let (want_width, want_height) = if width == 0 {
            (guard.default_width, guard.default_height)
        } else {
            (width, height)
        };
        let want_format = if format == BufferFormat::UNDEFINED {
            guard.default_format
        } else {
            format
        };
        let want_usage = usage | guard.consumer_usage_bits;

        let epoch = guard.connect_epoch;
        let release_all = std::mem::take(&mut guard.release_all_pending);

        let slot = &mut guard.slots[index.get()];
        slot.state = SlotState::Dequeued;
        slot.epoch = epoch;
        let fence = std::mem::replace(&mut slot.fence, Fence::signaled());
        let needs_reallocation = match &slot.buffer {
            Some(buffer) => !buffer.matches(want_width, want_height, want_format, want_usage),
            None => true,
        };

        slot.needs_reallocation = needs_reallocation;

        if needs_reallocation {
            guard = self.allocate_into_slot(
                guard,
                index,
                want_width,
                want_height,
                want_format,
                want_usage,
            )?;
        }

        debug!(
            slot = index.get(),
            needs_reallocation, release_all, "buffer dequeued"
        );
        drop(guard);
        Ok(DequeueOutput {
            slot: index,
            fence,
            flags: DequeueFlags {
                needs_reallocation,
                release_all_buffers: release_all,
            },
        })
    }

    /// Allocate a buffer for `index` with the lock released. The slot is
    /// already `Dequeued` and owned by this caller; the `allocating` flag
    /// keeps a concurrent bulk allocation from racing slot assignment.
    fn allocate_into_slot<'a>(
        &'a self,
        guard: MutexGuard<'a, CoreState>,
        index: SlotIndex,
        width: u32,
        height: u32,
        format: BufferFormat,
        usage: u64,
    ) -> Result<MutexGuard<'a, CoreState>> {
        let mut guard = self.core.wait_while_allocating(guard);
        if guard.abandoned {
            // abandon already freed the slot while we waited
            return Err(QueueError::Abandoned);
        }
        if guard.connected_api.is_none() || guard.slots[index.get()].state != SlotState::Dequeued {
            // likewise a disconnect during the wait
            return Err(QueueError::NotConnected);
        }
        guard.allocating = true;
        let old = guard.slots[index.get()].buffer.take();
        let generation = guard.generation;
        let epoch = guard.slots[index.get()].epoch;
        drop(guard);

        if let Some(old) = old {
            self.core.allocator.release(old);
        }
        let result = self.core.allocator.allocate(width, height, format, usage);

        let mut guard = self.core.lock();
        guard.allocating = false;
        self.core.allocating_cond.notify_all();

        // the slot is ours only if it survived the window untouched;
        // disconnect frees it and a reconnect would re-stamp its epoch
        let still_owned = !guard.abandoned
            && guard.connected_api.is_some()
            && guard.slots[index.get()].state == SlotState::Dequeued
            && guard.slots[index.get()].epoch == epoch;

        match result {
            Ok(mut buffer) => {
                buffer.generation = generation;
                if guard.abandoned {
                    self.core.allocator.release(buffer);
                    return Err(QueueError::Abandoned);
                }
                if !still_owned {
                    self.core.allocator.release(buffer);
                    return Err(QueueError::NotConnected);
                }
                trace!(slot = index.get(), width, height, "allocated into slot");
                guard.slots[index.get()].buffer = Some(buffer);
                Ok(guard)
            }
            Err(err) => {
                warn!(slot = index.get(), error = %err, "buffer allocation failed");
                if still_owned {
                    let slot = &mut guard.slots[index.get()];
                    slot.state = SlotState::Free;
                    slot.needs_reallocation = false;
                    self.core.dequeue_cond.notify_all();
                }
                Err(err.into())
            }
        }
    }

    /// Fetch the buffer handle for a slot whose dequeue reported
    /// `needs_reallocation`.
    pub fn request_buffer(&self, slot: SlotIndex) -> Result<GraphicsBuffer> {
        let mut guard = self.core.lock();
        guard.validate_owned_by_producer(slot)?;
        let entry = &mut guard.slots[slot.get()];
        let buffer = entry
            .buffer
            .clone()
            .ok_or(QueueError::InvalidArgument("slot has no buffer attached"))?;
        entry.needs_reallocation = false;
        Ok(buffer)
    }

    /// Hand a written buffer to the consumer.
    ///
    /// In async mode, if an unconsumed frame is already pending the oldest
    /// one is evicted back to `Free` instead of growing the FIFO, bounding
    /// consumer latency at the cost of dropped frames.
    pub fn queue(&self, slot: SlotIndex, input: QueueInput) -> Result<QueueOutput> {
        let (item, replaced, listener, output) = {
            let mut guard = self.core.lock();
            guard.validate_owned_by_producer(slot)?;

            let (buffer_width, buffer_height) = match &guard.slots[slot.get()].buffer {
                Some(buffer) => (buffer.width, buffer.height),
                None => {
                    return Err(QueueError::InvalidArgument("slot has no buffer attached"));
                }
            };
            if guard.slots[slot.get()].needs_reallocation {
                return Err(QueueError::InvalidArgument(
                    "buffer was reallocated but never re-requested",
                ));
            }
            if !input.crop.is_empty() && !input.crop.fits_within(buffer_width, buffer_height) {
                return Err(QueueError::InvalidArgument("crop rect exceeds buffer bounds"));
            }

            let mut replaced = None;
            if guard.async_mode {
                if let Some(old) = guard.fifo.pop_front() {
                    let entry = &mut guard.slots[old.slot.get()];
                    debug_assert_eq!(entry.state, SlotState::Queued);
                    entry.state = SlotState::Free;
                    entry.fence = old.fence.clone();
                    replaced = Some(old);
                }
            }

            guard.frame_counter += 1;
            let frame_number = guard.frame_counter;
            let timestamp_ns = if input.timestamp_ns == 0 {
                timestamp_now_ns()
            } else {
                input.timestamp_ns
            };

            let entry = &mut guard.slots[slot.get()];
            entry.state = SlotState::Queued;
            entry.fence = input.fence.clone();
            entry.frame_number = frame_number;

            let item = QueueItem {
                slot,
                fence: input.fence,
                timestamp_ns,
                crop: input.crop,
                transform: input.transform,
                frame_number,
            };
            guard.fifo.push_back(item.clone());

            // a new queued entry may change capacity pressure
            self.core.dequeue_cond.notify_all();

            let output = QueueOutput {
                width: guard.default_width,
                height: guard.default_height,
                pending_buffers: guard.fifo.len(),
                frame_number,
            };
            (item, replaced, guard.consumer_listener.clone(), output)
        };

        trace!(
            slot = slot.get(),
            frame = item.frame_number,
            replaced = replaced.is_some(),
            "buffer queued"
        );
        if let Some(listener) = listener {
            if replaced.is_some() {
                listener.on_frame_replaced(&item);
            } else {
                listener.on_frame_available(&item);
            }
        }
        Ok(output)
    }

    /// Return a dequeued slot unused. `fence` is what the next dequeuer of
    /// this slot must wait on.
    pub fn cancel(&self, slot: SlotIndex, fence: Fence) -> Result<()> {
        let mut guard = self.core.lock();
        guard.validate_owned_by_producer(slot)?;
        let entry = &mut guard.slots[slot.get()];
        entry.state = SlotState::Free;
        entry.fence = fence;
        self.core.dequeue_cond.notify_all();
        trace!(slot = slot.get(), "buffer cancelled");
        Ok(())
    }

    /// Remove a dequeued slot's buffer from the queue's bookkeeping entirely,
    /// moving ownership to the caller.
    pub fn detach(&self, slot: SlotIndex) -> Result<GraphicsBuffer> {
        let mut guard = self.core.lock();
        guard.validate_owned_by_producer(slot)?;
        let entry = &mut guard.slots[slot.get()];
        if entry.needs_reallocation {
            return Err(QueueError::InvalidArgument(
                "buffer was reallocated but never re-requested",
            ));
        }
        match entry.buffer.take() {
            Some(buffer) => {
                entry.state = SlotState::Free;
                entry.fence = Fence::signaled();
                self.core.dequeue_cond.notify_all();
                debug!(slot = slot.get(), buffer = buffer.id, "buffer detached");
                Ok(buffer)
            }
            None => Err(QueueError::InvalidArgument("slot has no buffer attached")),
        }
    }

    /// Re-insert an externally held buffer. The buffer's generation stamp
    /// must match the queue's current generation; the chosen slot comes back
    /// `Dequeued` and owned by the caller. Never blocks: fails `Busy` when no
    /// slot is available within the capacity budget.
    pub fn attach(&self, buffer: GraphicsBuffer) -> Result<SlotIndex> {
        let mut guard = self.core.lock();
        if guard.abandoned {
            return Err(QueueError::Abandoned);
        }
        if guard.connected_api.is_none() {
            return Err(QueueError::NotConnected);
        }
        if buffer.generation != guard.generation {
            return Err(QueueError::InvalidArgument(
                "buffer generation does not match the queue",
            ));
        }
        let max = guard.max_buffer_count(guard.async_mode);
        if guard.used_slot_count() >= max {
            return Err(QueueError::Busy);
        }
        let index = guard
            .slots
            .iter()
            .position(|s| s.is_free() && s.buffer.is_none())
            .map(SlotIndex)
            .or_else(|| guard.find_free_slot())
            .ok_or(QueueError::Busy)?;

        let epoch = guard.connect_epoch;
        let entry = &mut guard.slots[index.get()];
        let displaced = entry.buffer.replace(buffer);
        entry.state = SlotState::Dequeued;
        entry.epoch = epoch;
        entry.fence = Fence::signaled();
        entry.needs_reallocation = false;
        if let Some(displaced) = displaced {
            self.core.allocator.release(displaced);
        }
        debug!(slot = index.get(), "buffer attached");
        Ok(index)
    }

    /// Pre-allocate every unallocated free slot up to the capacity budget.
    ///
    /// The allocator runs with the queue lock released; slot availability is
    /// re-validated afterwards, so buffers that lost their slot in the
    /// meantime go straight back to the allocator. On partial failure the
    /// successful allocations are kept and the error is returned; an earlier
    /// failure here never fails a later dequeue that an allocated free slot
    /// can satisfy.
    pub fn allocate_buffers(
        &self,
        async_op: bool,
        width: u32,
        height: u32,
        format: BufferFormat,
        usage: u64,
    ) -> Result<()> {
        if (width == 0) != (height == 0) {
            return Err(QueueError::InvalidArgument(
                "width and height must both be zero or both be set",
            ));
        }
        let guard = self.core.lock();
        let mut guard = self.core.wait_while_allocating(guard);
        if guard.abandoned {
            return Err(QueueError::Abandoned);
        }
        if guard.connected_api.is_none() {
            return Err(QueueError::NotConnected);
        }

        let (want_width, want_height) = if width == 0 {
            (guard.default_width, guard.default_height)
        } else {
            (width, height)
        };
        let want_format = if format == BufferFormat::UNDEFINED {
            guard.default_format
        } else {
            format
        };
        let want_usage = usage | guard.consumer_usage_bits;

        let max = guard.max_buffer_count(async_op || guard.async_mode);
        let allocated = guard.slots.iter().filter(|s| s.buffer.is_some()).count();
        let open_slots = guard
            .slots
            .iter()
            .filter(|s| s.is_free() && s.buffer.is_none())
            .count();
        let count = max.saturating_sub(allocated).min(open_slots);
        if count == 0 {
            return Ok(());
        }

        let generation = guard.generation;
        guard.allocating = true;
        drop(guard);

        let mut buffers = Vec::with_capacity(count);
        let mut failure = None;
        for _ in 0..count {
            match self
                .core
                .allocator
                .allocate(want_width, want_height, want_format, want_usage)
            {
                Ok(mut buffer) => {
                    buffer.generation = generation;
                    buffers.push(buffer);
                }
                Err(err) => {
                    warn!(error = %err, "bulk allocation stopped early");
                    failure = Some(err);
                    break;
                }
            }
        }

        let mut guard = self.core.lock();
        guard.allocating = false;
        self.core.allocating_cond.notify_all();

        if guard.abandoned {
            for buffer in buffers {
                self.core.allocator.release(buffer);
            }
            return Err(QueueError::Abandoned);
        }
        // a disconnect during the window invalidated the whole request
        if guard.connected_api.is_none() {
            for buffer in buffers {
                self.core.allocator.release(buffer);
            }
            return Err(QueueError::NotConnected);
        }

        // slots may have changed state while the lock was released
        let mut installed = 0;
        for buffer in buffers {
            match guard
                .slots
                .iter()
                .position(|s| s.is_free() && s.buffer.is_none())
            {
                Some(i) => {
                    guard.slots[i].buffer = Some(buffer);
                    installed += 1;
                }
                None => self.core.allocator.release(buffer),
            }
        }
        debug!(installed, requested = count, "pre-allocated buffers");

        match failure {
            Some(err) => Err(err.into()),
            None => Ok(()),
        }
    }

    /// Switch the queue's replacement policy. Any capacity-policy change
    /// wakes all blocked waiters.
    pub fn set_async_mode(&self, enabled: bool) -> Result<()> {
        let mut guard = self.core.lock();
        if guard.abandoned {
            return Err(QueueError::Abandoned);
        }
        if guard.async_mode != enabled {
            guard.async_mode = enabled;
            debug!(enabled, "async mode changed");
            self.core.dequeue_cond.notify_all();
        }
        Ok(())
    }

    /// Override the pool capacity. Zero clears the override. Fails while any
    /// buffer is dequeued; on success every slot is freed (a full
    /// renegotiation), so the next dequeue reports `release_all_buffers`.
    pub fn set_buffer_count(&self, count: usize) -> Result<()> {
        let mut guard = self.core.lock();
        if guard.abandoned {
            return Err(QueueError::Abandoned);
        }
        if guard.connected_api.is_none() {
            return Err(QueueError::NotConnected);
        }
        if count == 0 {
            guard.override_max_buffer_count = 0;
            self.core.dequeue_cond.notify_all();
            return Ok(());
        }
        if !(MIN_BUFFER_COUNT..=MAX_SLOT_COUNT).contains(&count) {
            return Err(QueueError::InvalidArgument(
                "buffer count outside the legal range",
            ));
        }
        if count < guard.min_undequeued_count(guard.async_mode) + 1 {
            return Err(QueueError::InvalidArgument(
                "buffer count below the undequeued minimum",
            ));
        }
        if guard
            .slots
            .iter()
            .any(|s| s.state == SlotState::Dequeued)
        {
            return Err(QueueError::InvalidArgument(
                "buffers are currently dequeued",
            ));
        }
        guard.override_max_buffer_count = count;
        guard.free_all_slots(&*self.core.allocator);
        debug!(count, "buffer count overridden");
        self.core.dequeue_cond.notify_all();
        Ok(())
    }

    pub fn query(&self, what: Query) -> Result<u64> {
        let guard = self.core.lock();
        if guard.abandoned {
            return Err(QueueError::Abandoned);
        }
        Ok(match what {
            Query::Width => guard.default_width as u64,
            Query::Height => guard.default_height as u64,
            Query::Format => guard.default_format.0 as u64,
            Query::MinUndequeuedBuffers => guard.min_undequeued_count(guard.async_mode) as u64,
            Query::ConsumerUsageBits => guard.consumer_usage_bits,
        })
    }
}

fn timestamp_now_ns() -> u64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| d.as_nanos() as u64)
        .unwrap_or(0)
}
