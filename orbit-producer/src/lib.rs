//! Producer side of the Orbit capture pipeline: a bounded lock-free event
//! buffer drained by a background thread over one gRPC bidirectional stream.

mod event_buffer;
mod producer;

pub use producer::LockfreeBufferCaptureEventProducer;

use std::sync::{Mutex, OnceLock};

use orbit_proto::CaptureEvent;

/// Default capacity of the producer buffer. Events are a few hundred bytes,
/// so this bounds producer memory at tens of megabytes while riding out
/// multi-second service stalls.
pub const DEFAULT_BUFFER_CAPACITY: usize = 65_536;

static GLOBAL_PRODUCER: OnceLock<Mutex<Option<LockfreeBufferCaptureEventProducer>>> =
    OnceLock::new();

fn global_producer() -> &'static Mutex<Option<LockfreeBufferCaptureEventProducer>> {
    GLOBAL_PRODUCER.get_or_init(|| Mutex::new(None))
}

/// Starts the process-wide producer. Subsequent calls are no-ops. This is
/// the only global state the producer library holds, together with the
/// transmit thread it spawns.
pub fn start_global_producer(service_address: &str) {
    let mut producer = global_producer().lock().unwrap();
    if producer.is_none() {
        *producer = Some(LockfreeBufferCaptureEventProducer::start(
            service_address.to_string(),
            DEFAULT_BUFFER_CAPACITY,
        ));
    }
}

pub fn is_capturing() -> bool {
    global_producer()
        .lock()
        .unwrap()
        .as_ref()
        .is_some_and(|producer| producer.is_capturing())
}

/// Enqueues onto the global producer; false when none is running or no
/// capture is active.
pub fn enqueue_capture_event(event: CaptureEvent) -> bool {
    global_producer()
        .lock()
        .unwrap()
        .as_ref()
        .is_some_and(|producer| producer.enqueue_capture_event(event))
}

/// Tears the global producer down, joining its transmit thread.
pub fn shutdown_global_producer() {
    if let Some(producer) = global_producer().lock().unwrap().take() {
        producer.shutdown();
    }
}
