use std::net::SocketAddr;
use std::path::PathBuf;

use clap::Parser;
use tonic::transport::Server;
use tracing::{info, warn};
use xds_networking::{Bootstrap, generator};
use xds_server::DiscoveryServer;

#[derive(Parser, Debug)]
#[command(about = "Serves listeners, routes, clusters and endpoints over ADS")]
struct Args {
    /// Address to serve the aggregated discovery service on.
    #[arg(long, default_value = "0.0.0.0:15010")]
    addr: SocketAddr,

    /// JSON file with server settings and the initial configuration.
    #[arg(long)]
    config: Option<PathBuf>,
}

fn init_tracing() {
    let sub = tracing_subscriber::FmtSubscriber::builder()
        .with_env_filter(tracing_subscriber::filter::EnvFilter::from_default_env())
        .finish();

    let _ = tracing::subscriber::set_global_default(sub);
}

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    init_tracing();
    let args = Args::parse();

    let bootstrap = match &args.config {
        Some(path) => Bootstrap::from_file(path)?,
        None => {
            warn!("no --config given, starting with an empty configuration store");
            Bootstrap::default()
        }
    };
    let store = bootstrap.store()?;
    let server = generator::install(DiscoveryServer::builder(bootstrap.server.clone(), store)).build()?;

    info!(addr = %args.addr, configs = bootstrap.configs.len(), "serving aggregated discovery service");
    let shutdown = server.clone();
    Server::builder()
        .add_service(server.into_service())
        .serve_with_shutdown(args.addr, async move {
            if let Err(error) = tokio::signal::ctrl_c().await {
                warn!(%error, "failed to listen for ctrl-c");
            }
            info!("shutting down");
            shutdown.shutdown();
        })
        .await?;

    Ok(())
}
