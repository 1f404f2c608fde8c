use std::net::SocketAddr;

use clap::Parser;
use orbit_proto::capture_event_producer_service_server::CaptureEventProducerServiceServer;
use orbit_proto::capture_service_server::CaptureServiceServer;
use orbit_service::{CaptureServiceImpl, ProducerService};

/// Orbit capture service daemon.
#[derive(Parser)]
#[command(name = "orbitd")]
struct Options {
    /// Address to serve the capture and producer services on.
    #[arg(long, default_value = "127.0.0.1:44765")]
    listen: SocketAddr,
}

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    env_logger::Builder::from_env(env_logger::Env::default().default_filter_or("info")).init();
    let options = Options::parse();

    let producer_service = ProducerService::new();
    let capture_service = CaptureServiceImpl::new(producer_service.clone());

    log::info!("orbitd listening on {}", options.listen);
    tonic::transport::Server::builder()
        .add_service(CaptureServiceServer::new(capture_service))
        .add_service(CaptureEventProducerServiceServer::new(producer_service))
        .serve(options.listen)
        .await?;
    Ok(())
}
