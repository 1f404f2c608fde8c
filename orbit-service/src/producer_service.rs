//! The gRPC service producers connect to.
//!
//! Each producer holds one bidirectional stream for its whole lifetime. We
//! push capture commands down the stream and pull buffered events up, fanning
//! them into the dispatcher channel under the producer's id.

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use crossbeam_channel::Sender;
use orbit_proto::capture_event_producer_service_server::CaptureEventProducerService;
use orbit_proto::receive_commands_and_send_events_request::Event as RequestEvent;
use orbit_proto::receive_commands_and_send_events_response::Command;
use orbit_proto::{
    CaptureEvent, CaptureFinishedCommand, CaptureOptions, ReceiveCommandsAndSendEventsRequest,
    ReceiveCommandsAndSendEventsResponse, StartCaptureCommand, StopCaptureCommand,
};
use rustc_hash::FxHashSet;
use tokio::sync::{broadcast, mpsc};
use tokio_stream::wrappers::ReceiverStream;
use tonic::{Request, Response, Status, Streaming};

#[derive(Clone, Debug)]
enum ProducerCommand {
    StartCapture(Box<CaptureOptions>),
    StopCapture,
    CaptureFinished,
}

#[derive(Default)]
struct Connections {
    connected: FxHashSet<u64>,
    all_events_sent: FxHashSet<u64>,
    active_options: Option<CaptureOptions>,
}

struct ProducerServiceInner {
    commands: broadcast::Sender<ProducerCommand>,
    connections: Mutex<Connections>,
    event_sink: Mutex<Option<Sender<(u64, CaptureEvent)>>>,
    next_producer_id: AtomicU64,
}

/// Shared handle; clones refer to the same service.
#[derive(Clone)]
pub struct ProducerService {
    inner: Arc<ProducerServiceInner>,
}

impl Default for ProducerService {
    fn default() -> Self {
        Self::new()
    }
}

impl ProducerService {
    pub fn new() -> Self {
        let (commands, _) = broadcast::channel(16);
        ProducerService {
            inner: Arc::new(ProducerServiceInner {
                commands,
                connections: Mutex::new(Connections::default()),
                event_sink: Mutex::new(None),
                // Producer id 0 is the in-process tracer.
                next_producer_id: AtomicU64::new(1),
            }),
        }
    }

    /// Starts routing producer events into `sink` and tells every connected
    /// producer to start capturing.
    pub fn begin_capture(&self, sink: Sender<(u64, CaptureEvent)>, options: CaptureOptions) {
        *self.inner.event_sink.lock().unwrap() = Some(sink);
        {
            let mut connections = self.inner.connections.lock().unwrap();
            connections.all_events_sent.clear();
            connections.active_options = Some(options.clone());
        }
        let _ = self
            .inner
            .commands
            .send(ProducerCommand::StartCapture(Box::new(options)));
    }

    /// Broadcasts StopCapture, then waits until every connected producer has
    /// sent AllEventsSent or `drain_timeout` elapses. Events still in flight
    /// after the timeout are lost and reported in the log.
    pub async fn stop_capture_and_drain(&self, drain_timeout: Duration) {
        self.inner.connections.lock().unwrap().active_options = None;
        let _ = self.inner.commands.send(ProducerCommand::StopCapture);

        let deadline = tokio::time::Instant::now() + drain_timeout;
        loop {
            {
                let connections = self.inner.connections.lock().unwrap();
                if connections
                    .connected
                    .iter()
                    .all(|id| connections.all_events_sent.contains(id))
                {
                    return;
                }
            }
            if tokio::time::Instant::now() >= deadline {
                let connections = self.inner.connections.lock().unwrap();
                let missing = connections
                    .connected
                    .difference(&connections.all_events_sent)
                    .count();
                log::warn!("{missing} producer(s) did not finish sending within the drain timeout");
                return;
            }
            tokio::time::sleep(Duration::from_millis(20)).await;
        }
    }

    /// Tells producers the capture is over and stops routing their events.
    pub fn finish_capture(&self) {
        let _ = self.inner.commands.send(ProducerCommand::CaptureFinished);
        *self.inner.event_sink.lock().unwrap() = None;
    }
}

fn command_to_response(command: ProducerCommand) -> ReceiveCommandsAndSendEventsResponse {
    let command = match command {
        ProducerCommand::StartCapture(options) => Command::StartCaptureCommand(StartCaptureCommand {
            capture_options: Some(*options),
        }),
        ProducerCommand::StopCapture => Command::StopCaptureCommand(StopCaptureCommand {}),
        ProducerCommand::CaptureFinished => {
            Command::CaptureFinishedCommand(CaptureFinishedCommand {})
        }
    };
    ReceiveCommandsAndSendEventsResponse {
        command: Some(command),
    }
}

#[tonic::async_trait]
impl CaptureEventProducerService for ProducerService {
    type ReceiveCommandsAndSendEventsStream =
        ReceiverStream<Result<ReceiveCommandsAndSendEventsResponse, Status>>;

    async fn receive_commands_and_send_events(
        &self,
        request: Request<Streaming<ReceiveCommandsAndSendEventsRequest>>,
    ) -> Result<Response<Self::ReceiveCommandsAndSendEventsStream>, Status> {
        let producer_id = self.inner.next_producer_id.fetch_add(1, Ordering::Relaxed);
        log::info!("producer {producer_id} connected");

        let (response_sender, response_receiver) = mpsc::channel(16);
        let mut command_receiver = self.inner.commands.subscribe();

        // A producer that connects mid-capture starts capturing right away.
        let active_options = {
            let mut connections = self.inner.connections.lock().unwrap();
            connections.connected.insert(producer_id);
            connections.active_options.clone()
        };
        if let Some(options) = active_options {
            let _ = response_sender
                .send(Ok(command_to_response(ProducerCommand::StartCapture(
                    Box::new(options),
                ))))
                .await;
        }

        // Command fan-out.
        tokio::spawn(async move {
            loop {
                match command_receiver.recv().await {
                    Ok(command) => {
                        if response_sender
                            .send(Ok(command_to_response(command)))
                            .await
                            .is_err()
                        {
                            return;
                        }
                    }
                    Err(broadcast::error::RecvError::Lagged(skipped)) => {
                        log::warn!("producer {producer_id} missed {skipped} command(s)");
                    }
                    Err(broadcast::error::RecvError::Closed) => return,
                }
            }
        });

        // Event fan-in.
        let inner = self.inner.clone();
        let mut requests = request.into_inner();
        tokio::spawn(async move {
            loop {
                match requests.message().await {
                    Ok(Some(request)) => match request.event {
                        Some(RequestEvent::BufferedCaptureEvents(buffered)) => {
                            if buffered.num_lost_events > 0 {
                                log::warn!(
                                    "producer {producer_id} dropped {} event(s) on overflow",
                                    buffered.num_lost_events
                                );
                            }
                            let sink = inner.event_sink.lock().unwrap().clone();
                            let Some(sink) = sink else {
                                continue;
                            };
                            for event in buffered.capture_events {
                                let _ = sink.send((producer_id, event));
                            }
                        }
                        Some(RequestEvent::AllEventsSent(_)) => {
                            inner
                                .connections
                                .lock()
                                .unwrap()
                                .all_events_sent
                                .insert(producer_id);
                        }
                        None => {}
                    },
                    Ok(None) => break,
                    Err(status) => {
                        log::warn!("producer {producer_id} stream error: {status}");
                        break;
                    }
                }
            }
            log::info!("producer {producer_id} disconnected");
            let mut connections = inner.connections.lock().unwrap();
            connections.connected.remove(&producer_id);
            connections.all_events_sent.remove(&producer_id);
        });

        Ok(Response::new(ReceiverStream::new(response_receiver)))
    }
}
