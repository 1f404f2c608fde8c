//! Driving a capture over the service's gRPC interface.
//!
//! Thin edge around [`CaptureEventProcessor`]: opens the `Capture` stream,
//! sends the options, feeds every received event into the processor, and
//! translates `stop()` into a StopCapture message. The stream ends when the
//! service has delivered CaptureFinished.

use std::sync::Arc;

use orbit_proto::capture_request::Request as CaptureRequestKind;
use orbit_proto::capture_service_client::CaptureServiceClient;
use orbit_proto::{CaptureOptions, CaptureRequest, StopCapture};
use tokio::sync::mpsc;
use tokio_stream::wrappers::ReceiverStream;

use crate::capture_data::CaptureData;
use crate::capture_event_processor::CaptureEventProcessor;

#[derive(Debug, thiserror::Error)]
pub enum CaptureClientError {
    #[error("cannot reach the capture service: {0}")]
    Connect(#[from] tonic::transport::Error),
    #[error("capture failed: {0}")]
    Rpc(#[from] tonic::Status),
    #[error("the capture ended without a CaptureFinished event")]
    MissingCaptureFinished,
}

/// A capture in progress. Stopping it (or the service finishing on its own)
/// resolves the session.
pub struct CaptureSession {
    request_sender: mpsc::Sender<CaptureRequest>,
    receive_task: tokio::task::JoinHandle<Result<(), CaptureClientError>>,
}

impl CaptureSession {
    /// Connects to the service, starts a capture with `options`, and
    /// materializes every received event into `capture_data`.
    pub async fn start(
        endpoint: String,
        options: CaptureOptions,
        capture_data: Arc<CaptureData>,
    ) -> Result<CaptureSession, CaptureClientError> {
        let mut client = CaptureServiceClient::connect(endpoint).await?;

        let (request_sender, request_receiver) = mpsc::channel::<CaptureRequest>(4);
        request_sender
            .send(CaptureRequest {
                request: Some(CaptureRequestKind::StartCapture(options)),
            })
            .await
            .expect("the receiver is alive, we hold it");

        let mut responses = client
            .capture(ReceiverStream::new(request_receiver))
            .await?
            .into_inner();

        let receive_task = tokio::spawn(async move {
            let mut processor = CaptureEventProcessor::new(capture_data);
            while let Some(response) = responses.message().await? {
                for event in response.capture_events {
                    processor.process_event(event);
                }
            }
            if !processor.has_finished() {
                return Err(CaptureClientError::MissingCaptureFinished);
            }
            Ok(())
        });

        Ok(CaptureSession {
            request_sender,
            receive_task,
        })
    }

    /// Requests the stop and waits for the stream to finish draining.
    pub async fn stop(self) -> Result<(), CaptureClientError> {
        let _ = self
            .request_sender
            .send(CaptureRequest {
                request: Some(CaptureRequestKind::StopCapture(StopCapture {})),
            })
            .await;
        match self.receive_task.await {
            Ok(result) => result,
            Err(join_error) => {
                log::error!("capture receive task panicked: {join_error}");
                Err(CaptureClientError::MissingCaptureFinished)
            }
        }
    }
}
