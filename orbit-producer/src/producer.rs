//! The out-of-process capture event producer.
//!
//! Any thread of the instrumented process may enqueue events; enqueueing is
//! wait-free. A single background thread owns the gRPC stream to the
//! service: it receives capture commands, drains the buffer on a fixed
//! cadence, and is the only place that ever blocks on the network.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::thread::{self, JoinHandle};
use std::time::Duration;

use orbit_proto::capture_event_producer_service_client::CaptureEventProducerServiceClient;
use orbit_proto::receive_commands_and_send_events_request;
use orbit_proto::receive_commands_and_send_events_response::Command;
use orbit_proto::{
    AllEventsSent, BufferedCaptureEvents, CaptureEvent, ReceiveCommandsAndSendEventsRequest,
};
use tokio_stream::wrappers::ReceiverStream;

use crate::event_buffer::EventBuffer;

const RECONNECT_DELAY: Duration = Duration::from_secs(1);
const SEND_PERIOD: Duration = Duration::from_millis(20);
const MAX_EVENTS_PER_SEND: usize = 5_000;

struct ProducerState {
    service_address: String,
    buffer: EventBuffer,
    is_capturing: AtomicBool,
    shutdown: AtomicBool,
}

/// Producer backed by a bounded lock-free buffer and a dedicated transmit
/// thread.
pub struct LockfreeBufferCaptureEventProducer {
    state: Arc<ProducerState>,
    transmit_thread: Option<JoinHandle<()>>,
}

impl LockfreeBufferCaptureEventProducer {
    /// Starts the transmit thread. `service_address` is a tonic endpoint
    /// like `http://127.0.0.1:44765`. The producer keeps reconnecting in the
    /// background for its whole lifetime.
    pub fn start(service_address: String, buffer_capacity: usize) -> Self {
        let state = Arc::new(ProducerState {
            service_address,
            buffer: EventBuffer::new(buffer_capacity),
            is_capturing: AtomicBool::new(false),
            shutdown: AtomicBool::new(false),
        });
        let transmit_thread = {
            let state = state.clone();
            thread::Builder::new()
                .name("orbit-producer-tx".to_string())
                .spawn(move || transmit_thread_main(state))
                .expect("spawning the producer transmit thread")
        };
        LockfreeBufferCaptureEventProducer {
            state,
            transmit_thread: Some(transmit_thread),
        }
    }

    /// Wait-free; instrumentation call sites check this before building an
    /// event at all.
    pub fn is_capturing(&self) -> bool {
        self.state.is_capturing.load(Ordering::Relaxed)
    }

    /// Wait-free enqueue. Returns false when no capture is running and the
    /// event was not recorded.
    pub fn enqueue_capture_event(&self, event: CaptureEvent) -> bool {
        if !self.is_capturing() {
            return false;
        }
        self.state.buffer.push(event);
        true
    }

    pub fn shutdown(mut self) {
        self.shutdown_impl();
    }

    fn shutdown_impl(&mut self) {
        self.state.shutdown.store(true, Ordering::Relaxed);
        if let Some(transmit_thread) = self.transmit_thread.take() {
            let _ = transmit_thread.join();
        }
    }
}

impl Drop for LockfreeBufferCaptureEventProducer {
    fn drop(&mut self) {
        self.shutdown_impl();
    }
}

fn transmit_thread_main(state: Arc<ProducerState>) {
    let runtime = tokio::runtime::Builder::new_current_thread()
        .enable_all()
        .build()
        .expect("building the producer runtime");
    runtime.block_on(async {
        while !state.shutdown.load(Ordering::Relaxed) {
            match CaptureEventProducerServiceClient::connect(state.service_address.clone()).await {
                Ok(client) => {
                    if let Err(err) = run_stream(client, &state).await {
                        log::warn!("producer stream ended: {err}");
                    }
                    // While disconnected we are certainly not capturing.
                    state.is_capturing.store(false, Ordering::Relaxed);
                }
                Err(err) => {
                    log::debug!(
                        "cannot reach producer service at {}: {err}",
                        state.service_address
                    );
                }
            }
            tokio::time::sleep(RECONNECT_DELAY).await;
        }
    });
}

async fn run_stream(
    mut client: CaptureEventProducerServiceClient<tonic::transport::Channel>,
    state: &Arc<ProducerState>,
) -> Result<(), Box<dyn std::error::Error + Send + Sync>> {
    let (sender, receiver) = tokio::sync::mpsc::channel::<ReceiveCommandsAndSendEventsRequest>(4);
    let mut commands = client
        .receive_commands_and_send_events(ReceiverStream::new(receiver))
        .await?
        .into_inner();

    let mut ticker = tokio::time::interval(SEND_PERIOD);
    let mut all_events_sent_pending = false;
    loop {
        tokio::select! {
            command = commands.message() => {
                match command? {
                    Some(response) => match response.command {
                        Some(Command::StartCaptureCommand(_start)) => {
                            // Whatever is still buffered predates this
                            // capture.
                            state.buffer.drain(usize::MAX);
                            state.buffer.take_lost_events();
                            state.is_capturing.store(true, Ordering::Relaxed);
                        }
                        Some(Command::StopCaptureCommand(_)) => {
                            state.is_capturing.store(false, Ordering::Relaxed);
                            all_events_sent_pending = true;
                        }
                        Some(Command::CaptureFinishedCommand(_)) => {}
                        None => {}
                    },
                    // Server closed the stream.
                    None => return Ok(()),
                }
            }
            _ = ticker.tick() => {
                let events = state.buffer.drain(MAX_EVENTS_PER_SEND);
                if !events.is_empty() {
                    let request = ReceiveCommandsAndSendEventsRequest {
                        event: Some(
                            receive_commands_and_send_events_request::Event::BufferedCaptureEvents(
                                BufferedCaptureEvents {
                                    capture_events: events,
                                    num_lost_events: state.buffer.take_lost_events(),
                                },
                            ),
                        ),
                    };
                    sender.send(request).await?;
                }
                if all_events_sent_pending && state.buffer.is_empty() {
                    all_events_sent_pending = false;
                    let request = ReceiveCommandsAndSendEventsRequest {
                        event: Some(
                            receive_commands_and_send_events_request::Event::AllEventsSent(
                                AllEventsSent {},
                            ),
                        ),
                    };
                    sender.send(request).await?;
                }
                if state.shutdown.load(Ordering::Relaxed) {
                    return Ok(());
                }
            }
        }
    }
}
