//! OrbitService: the server side of the Orbit capture pipeline. Hosts the
//! capture service the client talks to and the producer service out-of-process
//! event producers connect to, and merges everything into one ordered stream.

mod capture_service;
mod producer_event_processor;
mod producer_service;
mod tracer_listener;

pub use capture_service::CaptureServiceImpl;
pub use producer_event_processor::{
    ClientCaptureEventCollector, ProducerEventProcessor, DEFAULT_PRODUCER_DELAY_NS,
    TRACER_PRODUCER_ID,
};
pub use producer_service::ProducerService;
pub use tracer_listener::TracerEventForwarder;
