use clap::Parser;
use framequeue::{
    buffer_queue, BufferFormat, ConsumerListener, Fence, ProducerApi, QueueError, QueueInput,
    QueueItem, SoftwareAllocator, usage,
};
use std::sync::mpsc::{channel, Sender};
use std::sync::Arc;
use std::thread;
use std::time::Duration;
use tracing::{debug, info};

#[derive(Parser, Debug)]
#[clap(name = "pingpong")]
#[clap(about = "Buffer queue producer/consumer example", long_about = None)]
struct Args {
    #[clap(short, long, default_value_t = 100)]
    frames: u64,

    #[clap(long, default_value_t = 640)]
    width: u32,

    #[clap(long, default_value_t = 480)]
    height: u32,

    #[clap(short, long, default_value_t = 4)]
    buffer_count: usize,

    /// Replace pending frames instead of blocking on a full FIFO.
    #[clap(short, long)]
    async_mode: bool,
}

enum Event {
    Frame,
    ProducerGone,
}

struct FrameNotifier {
    tx: Sender<Event>,
}

impl ConsumerListener for FrameNotifier {
    fn on_frame_available(&self, _item: &QueueItem) {
        let _ = self.tx.send(Event::Frame);
    }

    fn on_frame_replaced(&self, item: &QueueItem) {
        debug!(frame = item.frame_number, "frame replaced before acquire");
    }

    fn on_producer_disconnected(&self) {
        let _ = self.tx.send(Event::ProducerGone);
    }
}

fn main() -> Result<(), Box<dyn std::error::Error>> {
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new("info")),
        )
        .init();

    let args = Args::parse();

    let (producer, consumer) = buffer_queue(Arc::new(SoftwareAllocator::new()));

    let (tx, rx) = channel();
    consumer.connect(Arc::new(FrameNotifier { tx }), false)?;
    consumer.set_default_max_buffer_count(args.buffer_count)?;

    producer.connect(ProducerApi::Cpu, None, false)?;
    producer.set_async_mode(args.async_mode)?;

    info!(
        frames = args.frames,
        width = args.width,
        height = args.height,
        buffer_count = args.buffer_count,
        async_mode = args.async_mode,
        "queue connected"
    );

    let consumer_handle = thread::spawn(move || {
        let mut consumed = 0u64;
        loop {
            match consumer.acquire() {
                Ok(Some(frame)) => {
                    frame.fence.wait(Duration::from_secs(1));
                    debug!(
                        frame = frame.frame_number,
                        buffer = frame.buffer.id,
                        timestamp = frame.timestamp_ns,
                        "frame consumed"
                    );
                    consumed += 1;
                    if let Err(err) = consumer.release(frame.slot, Fence::signaled()) {
                        debug!(error = %err, "release failed, shutting down");
                        break;
                    }
                }
                Ok(None) => match rx.recv() {
                    Ok(Event::Frame) => continue,
                    Ok(Event::ProducerGone) | Err(_) => break,
                },
                Err(QueueError::Busy) => continue,
                Err(err) => {
                    debug!(error = %err, "acquire failed, shutting down");
                    break;
                }
            }
        }
        consumed
    });

    for _ in 0..args.frames {
        let out = producer.dequeue(
            false,
            args.width,
            args.height,
            BufferFormat::RGBA_8888,
            usage::CPU_WRITE,
        )?;
        if out.flags.needs_reallocation {
            let buffer = producer.request_buffer(out.slot)?;
            debug!(slot = %out.slot, buffer = buffer.id, "buffer reallocated");
        }
        // a real producer would wait on out.fence and render here
        let output = producer.queue(out.slot, QueueInput::default())?;
        debug!(
            frame = output.frame_number,
            pending = output.pending_buffers,
            "frame queued"
        );
    }

    producer.disconnect()?;

    let consumed = consumer_handle.join().expect("consumer thread panicked");
    info!(produced = args.frames, consumed, "done");
    Ok(())
}
