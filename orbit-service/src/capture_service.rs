//! The gRPC service the client drives a capture through.
//!
//! The client opens `Capture`, sends the capture options, and receives the
//! totally-ordered event stream. Sending StopCapture (or closing the request
//! stream) quiesces the tracer, drains the producers, and ends the response
//! stream with a CaptureFinished event.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::thread;
use std::time::Duration;

use crossbeam_channel::RecvTimeoutError;
use orbit_linux_tracing::{monotonic_now_ns, validate_capture_options, Tracer};
use orbit_proto::capture_event::Event;
use orbit_proto::capture_request::Request as CaptureRequestKind;
use orbit_proto::capture_service_server::CaptureService;
use orbit_proto::{
    capture_finished, CaptureEvent, CaptureFinished, CaptureRequest, CaptureResponse,
    CaptureStarted,
};
use tokio::sync::mpsc;
use tokio_stream::wrappers::ReceiverStream;
use tonic::{Request, Response, Status, Streaming};

use crate::producer_event_processor::{
    ProducerEventProcessor, DEFAULT_PRODUCER_DELAY_NS, TRACER_PRODUCER_ID,
};
use crate::producer_service::ProducerService;
use crate::tracer_listener::TracerEventForwarder;

/// How long producers get to flush their buffers after StopCapture.
const DRAIN_TIMEOUT: Duration = Duration::from_secs(5);

/// Events per CaptureResponse message sent to the client.
const RESPONSE_BATCH_SIZE: usize = 512;

pub struct CaptureServiceImpl {
    producer_service: ProducerService,
    capture_running: Arc<AtomicBool>,
}

impl CaptureServiceImpl {
    pub fn new(producer_service: ProducerService) -> Self {
        CaptureServiceImpl {
            producer_service,
            capture_running: Arc::new(AtomicBool::new(false)),
        }
    }
}

/// Batches ordered events into CaptureResponses on the dispatcher thread.
struct StreamingCollector {
    sender: mpsc::Sender<Result<CaptureResponse, Status>>,
    batch: Vec<CaptureEvent>,
}

impl StreamingCollector {
    fn push(&mut self, event: CaptureEvent) {
        self.batch.push(event);
        if self.batch.len() >= RESPONSE_BATCH_SIZE {
            self.flush();
        }
    }

    fn flush(&mut self) {
        if self.batch.is_empty() {
            return;
        }
        let response = CaptureResponse {
            capture_events: std::mem::take(&mut self.batch),
        };
        // The client going away mid-capture just discards the rest of the
        // stream.
        let _ = self.sender.blocking_send(Ok(response));
    }
}

fn dispatcher_thread_main(
    event_receiver: crossbeam_channel::Receiver<(u64, CaptureEvent)>,
    sender: mpsc::Sender<Result<CaptureResponse, Status>>,
) {
    let collector = StreamingCollector {
        sender,
        batch: Vec::new(),
    };
    let mut processor = ProducerEventProcessor::new(collector, DEFAULT_PRODUCER_DELAY_NS);
    loop {
        match event_receiver.recv_timeout(Duration::from_millis(50)) {
            Ok((producer_id, event)) => processor.process_event(producer_id, event),
            Err(RecvTimeoutError::Timeout) => {
                processor.process_old_events(monotonic_now_ns());
                processor.collector_mut().flush();
            }
            Err(RecvTimeoutError::Disconnected) => break,
        }
    }
    // All senders are gone: the tracer has flushed and the producers are
    // drained (or timed out). Everything left goes out now, finished last.
    processor.process_all_events();
    processor.process_event(
        TRACER_PRODUCER_ID,
        Event::CaptureFinished(CaptureFinished {
            status: capture_finished::Status::Successful as i32,
            error_message: String::new(),
        })
        .into(),
    );
    processor.collector_mut().flush();
}

impl crate::producer_event_processor::ClientCaptureEventCollector for StreamingCollector {
    fn add_event(&mut self, event: CaptureEvent) {
        self.push(event);
    }
}

#[tonic::async_trait]
impl CaptureService for CaptureServiceImpl {
    type CaptureStream = ReceiverStream<Result<CaptureResponse, Status>>;

    async fn capture(
        &self,
        request: Request<Streaming<CaptureRequest>>,
    ) -> Result<Response<Self::CaptureStream>, Status> {
        let mut requests = request.into_inner();
        let first = requests
            .message()
            .await?
            .ok_or_else(|| Status::invalid_argument("empty capture request stream"))?;
        let options = match first.request {
            Some(CaptureRequestKind::StartCapture(options)) => options,
            _ => {
                return Err(Status::invalid_argument(
                    "the first capture request must carry the capture options",
                ))
            }
        };
        validate_capture_options(&options).map_err(|err| {
            Status::invalid_argument(err.to_string())
        })?;

        if self
            .capture_running
            .compare_exchange(false, true, Ordering::SeqCst, Ordering::SeqCst)
            .is_err()
        {
            return Err(Status::failed_precondition("a capture is already in progress"));
        }

        let (event_sender, event_receiver) = crossbeam_channel::unbounded::<(u64, CaptureEvent)>();
        let (response_sender, response_receiver) = mpsc::channel(64);

        let dispatcher = thread::Builder::new()
            .name("orbit-dispatcher".to_string())
            .spawn(move || dispatcher_thread_main(event_receiver, response_sender))
            .expect("spawning the dispatcher thread");

        // The start marker goes through the same pipe so it is first in the
        // stream.
        let _ = event_sender.send((
            TRACER_PRODUCER_ID,
            Event::CaptureStarted(CaptureStarted {
                pid: options.pid,
                capture_start_timestamp_ns: monotonic_now_ns(),
            })
            .into(),
        ));

        self.producer_service
            .begin_capture(event_sender.clone(), options.clone());

        let tracer = match Tracer::start(options, TracerEventForwarder::new(event_sender.clone()))
        {
            Ok(tracer) => tracer,
            Err(err) => {
                self.producer_service.finish_capture();
                drop(event_sender);
                self.capture_running.store(false, Ordering::SeqCst);
                return Err(Status::invalid_argument(err.to_string()));
            }
        };

        let producer_service = self.producer_service.clone();
        let capture_running = self.capture_running.clone();
        tokio::spawn(async move {
            // Hold the tracer and the event sender until stop.
            loop {
                match requests.message().await {
                    Ok(Some(request)) => match request.request {
                        Some(CaptureRequestKind::StopCapture(_)) => break,
                        _ => log::warn!("unexpected capture request mid-capture"),
                    },
                    // Client gone; treat like a stop.
                    Ok(None) | Err(_) => break,
                }
            }

            // Quiesce: dropping the tracer stops and joins it, flushing the
            // merger synchronously; then producers get their drain window,
            // then the dispatcher sees the channel close and finishes the
            // stream.
            let tracer_join = tokio::task::spawn_blocking(move || drop(tracer));
            let _ = tracer_join.await;
            producer_service.stop_capture_and_drain(DRAIN_TIMEOUT).await;
            producer_service.finish_capture();
            drop(event_sender);

            let _ = tokio::task::spawn_blocking(move || {
                let _ = dispatcher.join();
            })
            .await;
            capture_running.store(false, Ordering::SeqCst);
            log::info!("capture ended");
        });

        Ok(Response::new(ReceiverStream::new(response_receiver)))
    }
}
