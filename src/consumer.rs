//! Consumer side of the buffer queue.
//!
//! The consumer acquires frames from the FIFO head, reads the buffer once the
//! frame's fence signals, and releases the slot back to the free pool.
//! Consumer disconnect is permanent: it abandons the queue and fails every
//! in-flight and future operation on both sides.

use std::sync::Arc;

use tracing::{debug, trace};

use crate::buffer::{BufferFormat, GraphicsBuffer};
use crate::core::{QueueCore, QueueItem, Rect, Transform};
use crate::error::{QueueError, Result};
use crate::fence::Fence;
use crate::slot::{SlotIndex, SlotState, MAX_MAX_ACQUIRED_BUFFERS, MAX_SLOT_COUNT, MIN_BUFFER_COUNT};

/// Notifications delivered to the consumer side. Called with the queue lock
/// released; implementations may call back into the queue.
pub trait ConsumerListener: Send + Sync {
    /// A new frame was appended to the FIFO.
    fn on_frame_available(&self, item: &QueueItem);

    /// Async mode replaced a pending frame instead of appending one.
    fn on_frame_replaced(&self, _item: &QueueItem) {}

    /// The producer dropped all of its buffers (disconnect or renegotiation).
    fn on_buffers_released(&self) {}

    /// Producer-liveness notification.
    fn on_producer_disconnected(&self) {}
}

/// A frame held by the consumer until [`Consumer::release`].
#[derive(Clone, Debug)]
pub struct AcquiredFrame {
    pub slot: SlotIndex,
    pub buffer: GraphicsBuffer,
    /// Wait on this before reading the buffer contents.
    pub fence: Fence,
    pub timestamp_ns: u64,
    pub crop: Rect,
    pub transform: Transform,
    pub frame_number: u64,
}

/// The single consumer endpoint of a queue.
pub struct Consumer {
    core: Arc<QueueCore>,
}

impl Consumer {
    pub(crate) fn new(core: Arc<QueueCore>) -> Self {
        Consumer { core }
    }

    /// Connect the consumer side. Must happen before a producer can connect.
    pub fn connect(
        &self,
        listener: Arc<dyn ConsumerListener>,
        controlled_by_app: bool,
    ) -> Result<()> {
        let mut guard = self.core.lock();
        if guard.abandoned {
            return Err(QueueError::Abandoned);
        }
        if guard.consumer_connected {
            return Err(QueueError::InvalidArgument(
                "a consumer is already connected",
            ));
        }
        guard.consumer_connected = true;
        guard.consumer_listener = Some(listener);
        guard.consumer_controlled_by_app = controlled_by_app;
        debug!(controlled_by_app, "consumer connected");
        Ok(())
    }

    /// Permanently tear the queue down. Frees every non-acquired slot and
    /// wakes all blocked waiters so they fail promptly instead of stalling.
    /// Idempotent.
    pub fn disconnect(&self) {
        self.core.abandon();
    }

    /// Take the oldest pending frame, moving its slot to `Acquired`.
    ///
    /// Returns `Ok(None)` when the FIFO is empty and `Busy` when the acquired
    /// budget is exhausted; release a frame before acquiring another.
    pub fn acquire(&self) -> Result<Option<AcquiredFrame>> {
        let mut guard = self.core.lock();
        if guard.abandoned {
            return Err(QueueError::Abandoned);
        }
        if !guard.consumer_connected {
            return Err(QueueError::NotConnected);
        }
        if guard.acquired_count() >= guard.max_acquired_buffers {
            return Err(QueueError::Busy);
        }
        let Some(item) = guard.fifo.pop_front() else {
            return Ok(None);
        };
        let entry = &mut guard.slots[item.slot.get()];
        debug_assert_eq!(entry.state, SlotState::Queued);
        entry.state = SlotState::Acquired;
        let Some(buffer) = entry.buffer.clone() else {
            return Err(QueueError::InvalidArgument("queued slot lost its buffer"));
        };
        trace!(
            slot = item.slot.get(),
            frame = item.frame_number,
            "frame acquired"
        );
        Ok(Some(AcquiredFrame {
            slot: item.slot,
            buffer,
            fence: item.fence,
            timestamp_ns: item.timestamp_ns,
            crop: item.crop,
            transform: item.transform,
            frame_number: item.frame_number,
        }))
    }

    /// Hand an acquired slot back to the free pool. `fence` signals when the
    /// consumer's reads are done; the next dequeue of the slot returns it to
    /// the producer. Wakes blocked dequeuers.
    pub fn release(&self, slot: SlotIndex, fence: Fence) -> Result<()> {
        let listener = {
            let mut guard = self.core.lock();
            if guard.abandoned {
                return Err(QueueError::Abandoned);
            }
            if !guard.consumer_connected {
                return Err(QueueError::NotConnected);
            }
            let entry = guard
                .slots
                .get_mut(slot.get())
                .ok_or(QueueError::InvalidArgument("slot index out of range"))?;
            if entry.state != SlotState::Acquired {
                return Err(QueueError::InvalidArgument("slot is not acquired"));
            }
            entry.state = SlotState::Free;
            entry.fence = fence;
            self.core.dequeue_cond.notify_all();
            trace!(slot = slot.get(), "buffer released");
            guard.producer_listener.clone()
        };
        if let Some(listener) = listener {
            listener.on_buffer_released();
        }
        Ok(())
    }

    /// Budget of simultaneously acquired buffers. Feeds the min-undequeued
    /// computation, so it is only legal while no producer is connected; the
    /// change wakes all waiters.
    pub fn set_max_acquired_buffers(&self, count: usize) -> Result<()> {
        let mut guard = self.core.lock();
        if guard.abandoned {
            return Err(QueueError::Abandoned);
        }
        if guard.connected_api.is_some() {
            return Err(QueueError::InvalidArgument(
                "cannot change the acquired budget while a producer is connected",
            ));
        }
        if !(1..=MAX_MAX_ACQUIRED_BUFFERS).contains(&count) {
            return Err(QueueError::InvalidArgument(
                "acquired budget outside the legal range",
            ));
        }
        guard.max_acquired_buffers = count;
        self.core.dequeue_cond.notify_all();
        Ok(())
    }

    /// Default pool capacity, before any producer override. Valid range is
    /// `MIN_BUFFER_COUNT..=MAX_SLOT_COUNT`; failure leaves all state
    /// untouched.
    pub fn set_default_max_buffer_count(&self, count: usize) -> Result<()> {
        let mut guard = self.core.lock();
        if guard.abandoned {
            return Err(QueueError::Abandoned);
        }
        if !(MIN_BUFFER_COUNT..=MAX_SLOT_COUNT).contains(&count) {
            return Err(QueueError::InvalidArgument(
                "buffer count outside the legal range",
            ));
        }
        guard.default_max_buffer_count = count;
        debug!(count, "default max buffer count changed");
        self.core.dequeue_cond.notify_all();
        Ok(())
    }

    /// Dimensions used when the producer dequeues with zero width and height.
    pub fn set_default_buffer_size(&self, width: u32, height: u32) -> Result<()> {
        let mut guard = self.core.lock();
        if guard.abandoned {
            return Err(QueueError::Abandoned);
        }
        if width == 0 || height == 0 {
            return Err(QueueError::InvalidArgument(
                "default buffer size must be non-zero",
            ));
        }
        guard.default_width = width;
        guard.default_height = height;
        Ok(())
    }

    /// Format used when the producer dequeues with `BufferFormat::UNDEFINED`.
    pub fn set_default_buffer_format(&self, format: BufferFormat) -> Result<()> {
        let mut guard = self.core.lock();
        if guard.abandoned {
            return Err(QueueError::Abandoned);
        }
        guard.default_format = format;
        Ok(())
    }

    /// Usage bits ORed into every producer allocation request.
    pub fn set_consumer_usage_bits(&self, usage: u64) -> Result<()> {
        let mut guard = self.core.lock();
        if guard.abandoned {
            return Err(QueueError::Abandoned);
        }
        guard.consumer_usage_bits = usage;
        Ok(())
    }

    /// Number of frames queued but not yet acquired.
    pub fn pending_frames(&self) -> usize {
        self.core.lock().fifo.len()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::buffer::{usage, SoftwareAllocator};
    use crate::core::ProducerApi;
    use crate::producer::{Producer, ProducerListener, QueueInput};
    use crate::{buffer_queue, QueueError};
    use rstest::*;
    use std::sync::atomic::{AtomicUsize, Ordering};

    struct NullListener;

    impl ConsumerListener for NullListener {
        fn on_frame_available(&self, _item: &QueueItem) {}
    }

    #[derive(Default)]
    struct ReleaseCounter {
        released: AtomicUsize,
    }

    impl ProducerListener for ReleaseCounter {
        fn on_buffer_released(&self) {
            self.released.fetch_add(1, Ordering::SeqCst);
        }
    }

    struct Harness {
        releases: Arc<ReleaseCounter>,
        producer: Producer,
        consumer: Consumer,
    }

    #[fixture]
    fn queue() -> Harness {
        let (producer, consumer) = buffer_queue(Arc::new(SoftwareAllocator::new()));
        consumer.connect(Arc::new(NullListener), false).unwrap();
        let releases = Arc::new(ReleaseCounter::default());
        producer
            .connect(ProducerApi::Cpu, Some(releases.clone()), false)
            .unwrap();
        Harness {
            releases,
            producer,
            consumer,
        }
    }

    fn queue_one_frame(producer: &Producer) -> SlotIndex {
        let out = producer
            .dequeue(false, 32, 32, BufferFormat::RGBA_8888, usage::CPU_WRITE)
            .unwrap();
        if out.flags.needs_reallocation {
            producer.request_buffer(out.slot).unwrap();
        }
        producer.queue(out.slot, QueueInput::default()).unwrap();
        out.slot
    }

    #[rstest]
    fn test_connect_twice_fails(queue: Harness) {
        assert!(matches!(
            queue.consumer.connect(Arc::new(NullListener), false),
            Err(QueueError::InvalidArgument(_))
        ));
    }

    #[rstest]
    fn test_acquire_empty_returns_none(queue: Harness) {
        assert!(queue.consumer.acquire().unwrap().is_none());
        assert_eq!(queue.consumer.pending_frames(), 0);
    }

    #[rstest]
    fn test_acquire_respects_budget(queue: Harness) {
        queue_one_frame(&queue.producer);
        queue_one_frame(&queue.producer);
        assert_eq!(queue.consumer.pending_frames(), 2);

        let first = queue.consumer.acquire().unwrap().unwrap();
        // default budget is one acquired buffer
        assert!(matches!(
            queue.consumer.acquire(),
            Err(QueueError::Busy)
        ));

        queue
            .consumer
            .release(first.slot, Fence::signaled())
            .unwrap();
        let second = queue.consumer.acquire().unwrap().unwrap();
        assert_eq!(second.frame_number, first.frame_number + 1);
    }

    #[rstest]
    fn test_release_requires_acquired_state(queue: Harness) {
        let out = queue
            .producer
            .dequeue(false, 32, 32, BufferFormat::RGBA_8888, 0)
            .unwrap();
        // dequeued, not acquired
        assert!(matches!(
            queue.consumer.release(out.slot, Fence::signaled()),
            Err(QueueError::InvalidArgument(_))
        ));
    }

    #[rstest]
    fn test_release_notifies_producer_listener(queue: Harness) {
        queue_one_frame(&queue.producer);
        let frame = queue.consumer.acquire().unwrap().unwrap();
        assert_eq!(queue.releases.released.load(Ordering::SeqCst), 0);
        queue
            .consumer
            .release(frame.slot, Fence::signaled())
            .unwrap();
        assert_eq!(queue.releases.released.load(Ordering::SeqCst), 1);
    }

    #[rstest]
    fn test_acquired_frame_carries_queue_metadata(queue: Harness) {
        let out = queue
            .producer
            .dequeue(false, 32, 32, BufferFormat::RGBA_8888, 0)
            .unwrap();
        let buffer = queue.producer.request_buffer(out.slot).unwrap();
        let input = QueueInput {
            timestamp_ns: 42,
            crop: Rect::new(0, 0, 16, 16),
            transform: Transform::Rotate90,
            ..QueueInput::default()
        };
        queue.producer.queue(out.slot, input).unwrap();

        let frame = queue.consumer.acquire().unwrap().unwrap();
        assert_eq!(frame.buffer.id, buffer.id);
        assert_eq!(frame.timestamp_ns, 42);
        assert_eq!(frame.crop, Rect::new(0, 0, 16, 16));
        assert_eq!(frame.transform, Transform::Rotate90);
    }

    #[rstest]
    fn test_set_max_acquired_rejected_while_producer_connected(queue: Harness) {
        assert!(matches!(
            queue.consumer.set_max_acquired_buffers(2),
            Err(QueueError::InvalidArgument(_))
        ));
        queue.producer.disconnect().unwrap();
        queue.consumer.set_max_acquired_buffers(2).unwrap();
    }

    #[test]
    fn test_set_max_acquired_range() {
        let (_producer, consumer) = buffer_queue(Arc::new(SoftwareAllocator::new()));
        consumer.connect(Arc::new(NullListener), false).unwrap();
        assert!(matches!(
            consumer.set_max_acquired_buffers(0),
            Err(QueueError::InvalidArgument(_))
        ));
        assert!(matches!(
            consumer.set_max_acquired_buffers(MAX_MAX_ACQUIRED_BUFFERS + 1),
            Err(QueueError::InvalidArgument(_))
        ));
        consumer
            .set_max_acquired_buffers(MAX_MAX_ACQUIRED_BUFFERS)
            .unwrap();
    }

    #[rstest]
    fn test_disconnect_abandons_queue_permanently(queue: Harness) {
        queue_one_frame(&queue.producer);
        queue.consumer.disconnect();
        // idempotent
        queue.consumer.disconnect();

        assert!(matches!(
            queue.consumer.acquire(),
            Err(QueueError::Abandoned)
        ));
        assert!(matches!(
            queue.producer.dequeue(false, 32, 32, BufferFormat::RGBA_8888, 0),
            Err(QueueError::Abandoned)
        ));
        assert!(matches!(
            queue.consumer.connect(Arc::new(NullListener), false),
            Err(QueueError::Abandoned)
        ));
    }

    #[rstest]
    fn test_default_setters_validate(queue: Harness) {
        assert!(matches!(
            queue.consumer.set_default_buffer_size(0, 32),
            Err(QueueError::InvalidArgument(_))
        ));
        queue.consumer.set_default_buffer_size(64, 64).unwrap();
        queue
            .consumer
            .set_default_buffer_format(BufferFormat::RGBX_8888)
            .unwrap();
        queue
            .consumer
            .set_consumer_usage_bits(usage::CPU_READ)
            .unwrap();
    }
}
