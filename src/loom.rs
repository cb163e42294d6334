#[cfg(all(test, feature = "loom"))]
mod tests {
    use crate::buffer::{BufferFormat, SoftwareAllocator};
    use crate::consumer::ConsumerListener;
    use crate::core::QueueItem;
    use crate::producer::{ProducerApi, QueueInput};
    use crate::{buffer_queue, QueueError};
    use loom::{model::Builder, thread};
    use std::sync::Arc;

    struct NullListener;

    impl ConsumerListener for NullListener {
        fn on_frame_available(&self, _item: &QueueItem) {}
    }

    #[test]
    fn test_producer_consumer_interleaving() {
        let mut builder = Builder::new();
        if builder.preemption_bound.is_none() {
            builder.preemption_bound = Some(3);
        }

        builder.check(|| {
            let (producer, consumer) = buffer_queue(Arc::new(SoftwareAllocator::new()));
            consumer.connect(Arc::new(NullListener), false).unwrap();
            producer.connect(ProducerApi::Cpu, None, false).unwrap();

            let num_frames = 2;

            let producer_handle = thread::spawn(move || {
                for _ in 0..num_frames {
                    let out = producer
                        .dequeue(false, 8, 8, BufferFormat::RGBA_8888, 0)
                        .unwrap();
                    if out.flags.needs_reallocation {
                        producer.request_buffer(out.slot).unwrap();
                    }
                    producer.queue(out.slot, QueueInput::default()).unwrap();
                }
            });

            let mut received = vec![];
            while received.len() < num_frames {
                match consumer.acquire().unwrap() {
                    Some(frame) => {
                        received.push(frame.frame_number);
                        consumer
                            .release(frame.slot, crate::fence::Fence::signaled())
                            .unwrap();
                    }
                    None => thread::yield_now(),
                }
            }

            producer_handle.join().unwrap();
            assert_eq!(received, vec![1, 2]);
        });
    }

    #[test]
    fn test_teardown_races_with_producer() {
        let mut builder = Builder::new();
        if builder.preemption_bound.is_none() {
            builder.preemption_bound = Some(3);
        }

        builder.check(|| {
            let (producer, consumer) = buffer_queue(Arc::new(SoftwareAllocator::new()));
            consumer.connect(Arc::new(NullListener), false).unwrap();
            producer.connect(ProducerApi::Cpu, None, false).unwrap();

            let producer_handle = thread::spawn(move || {
                match producer.dequeue(false, 8, 8, BufferFormat::RGBA_8888, 0) {
                    Ok(out) => {
                        if out.flags.needs_reallocation {
                            if producer.request_buffer(out.slot).is_err() {
                                return;
                            }
                        }
                        match producer.queue(out.slot, QueueInput::default()) {
                            Ok(_) | Err(QueueError::Abandoned) => {}
                            Err(err) => panic!("unexpected queue error: {err}"),
                        }
                    }
                    Err(QueueError::Abandoned) => {}
                    Err(err) => panic!("unexpected dequeue error: {err}"),
                }
            });

            consumer.disconnect();
            producer_handle.join().unwrap();
        });
    }
}
