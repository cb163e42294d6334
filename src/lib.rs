//! # framequeue - Bounded Graphics Buffer Exchange Queue
//!
//! A fixed pool of shared graphics buffers mediated between exactly one
//! producer and one consumer, possibly on different threads. The producer
//! dequeues a free slot, writes into its buffer, and queues it; the consumer
//! acquires frames in FIFO order, reads, and releases the slot back to the
//! pool. Slot metadata is guarded by one coarse lock; buffer *contents* are
//! synchronized only through [`Fence`]s, so writes never serialize on the
//! queue lock.
//!
//! Buffer memory itself lives with a [`BufferAllocator`] collaborator; the
//! queue allocates lazily on first dequeue of a slot, or in bulk via
//! [`Producer::allocate_buffers`].
//!
//! ## Setting Up a Queue
//!
//! The consumer connects first, then the producer:
//!
//! ```rust
//! use std::sync::Arc;
//! use framequeue::{
//!     buffer_queue, BufferFormat, ConsumerListener, ProducerApi, QueueItem, SoftwareAllocator,
//! };
//!
//! struct Frames;
//!
//! impl ConsumerListener for Frames {
//!     fn on_frame_available(&self, _item: &QueueItem) {}
//! }
//!
//! let (producer, consumer) = buffer_queue(Arc::new(SoftwareAllocator::new()));
//! consumer.connect(Arc::new(Frames), false)?;
//! producer.connect(ProducerApi::Cpu, None, false)?;
//! # Ok::<(), framequeue::QueueError>(())
//! ```
//!
//! ## Producing and Consuming Frames
//!
//! A dequeue that (re)allocated the slot's buffer reports
//! `needs_reallocation`; fetch the fresh handle with
//! [`Producer::request_buffer`] before queueing:
//!
//! ```rust
//! # use std::sync::Arc;
//! # use framequeue::{buffer_queue, BufferFormat, ConsumerListener, Fence, ProducerApi,
//! #     QueueInput, QueueItem, SoftwareAllocator, usage};
//! # struct Frames;
//! # impl ConsumerListener for Frames {
//! #     fn on_frame_available(&self, _item: &QueueItem) {}
//! # }
//! # let (producer, consumer) = buffer_queue(Arc::new(SoftwareAllocator::new()));
//! # consumer.connect(Arc::new(Frames), false)?;
//! # producer.connect(ProducerApi::Cpu, None, false)?;
//! let out = producer.dequeue(false, 640, 480, BufferFormat::RGBA_8888, usage::CPU_WRITE)?;
//! if out.flags.needs_reallocation {
//!     let buffer = producer.request_buffer(out.slot)?;
//!     assert_eq!(buffer.width, 640);
//! }
//! // out.fence is what the previous owner left; wait on it before writing.
//! producer.queue(out.slot, QueueInput::default())?;
//!
//! let frame = consumer.acquire()?.expect("a frame was queued");
//! assert_eq!(frame.buffer.width, 640);
//! consumer.release(frame.slot, Fence::signaled())?;
//! # Ok::<(), framequeue::QueueError>(())
//! ```
//!
//! ## Async Mode
//!
//! With [`Producer::set_async_mode`] enabled, queueing while an unconsumed
//! frame is pending evicts the oldest pending frame back to the free pool
//! instead of growing the FIFO, bounding consumer latency:
//!
//! ```rust
//! # use std::sync::Arc;
//! # use framequeue::{buffer_queue, BufferFormat, ConsumerListener, Fence, ProducerApi,
//! #     QueueInput, QueueItem, SoftwareAllocator};
//! # struct Frames;
//! # impl ConsumerListener for Frames {
//! #     fn on_frame_available(&self, _item: &QueueItem) {}
//! # }
//! # let (producer, consumer) = buffer_queue(Arc::new(SoftwareAllocator::new()));
//! # consumer.connect(Arc::new(Frames), false)?;
//! # producer.connect(ProducerApi::Cpu, None, false)?;
//! producer.set_async_mode(true)?;
//! for _ in 0..3 {
//!     let out = producer.dequeue(false, 64, 64, BufferFormat::RGBA_8888, 0)?;
//!     producer.request_buffer(out.slot)?;
//!     producer.queue(out.slot, QueueInput::default())?;
//! }
//! // only the most recent frame is ever acquired
//! let frame = consumer.acquire()?.expect("one frame pending");
//! assert_eq!(frame.frame_number, 3);
//! assert!(consumer.acquire()?.is_none());
//! # consumer.release(frame.slot, Fence::signaled())?;
//! # Ok::<(), framequeue::QueueError>(())
//! ```
//!
//! ## Blocking and Teardown
//!
//! When the pool is exhausted, [`Producer::dequeue`] blocks until the
//! consumer releases a slot — unless both endpoints declared themselves
//! app-controlled at connect time, in which case it fails
//! [`QueueError::Busy`] immediately. Teardown (producer disconnect, or the
//! permanent consumer disconnect that abandons the queue) wakes every blocked
//! waiter so it fails promptly instead of stalling.

pub use buffer::{
    usage, AllocationError, BufferAllocator, BufferFormat, GraphicsBuffer, SoftwareAllocator,
};
pub use consumer::{AcquiredFrame, Consumer, ConsumerListener};
pub use self::core::{ProducerApi, Query, QueueItem, Rect, Transform};
pub use error::{QueueError, Result};
pub use fence::{Fence, FenceState};
pub use producer::{
    ConnectOutput, DequeueFlags, DequeueOutput, Producer, ProducerListener, QueueInput,
    QueueOutput,
};
pub use slot::{
    SlotIndex, SlotState, MAX_MAX_ACQUIRED_BUFFERS, MAX_SLOT_COUNT, MIN_BUFFER_COUNT,
};

pub mod buffer;
pub mod consumer;
pub mod core;
pub mod error;
pub mod fence;
#[cfg(all(test, feature = "loom"))]
pub(crate) mod loom;
pub mod producer;
pub mod slot;
pub(crate) mod sync;

use std::sync::Arc;

/// Create a connected pair of queue endpoints sharing one slot pool.
///
/// The queue holds the allocator for the lifetime of both endpoints; buffers
/// go back to it whenever a slot is freed.
pub fn buffer_queue(allocator: Arc<dyn BufferAllocator>) -> (Producer, Consumer) {
    let core = self::core::QueueCore::new(allocator);
    (Producer::new(core.clone()), Consumer::new(core))
}
