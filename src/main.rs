use clap::Parser;
use grovekv::config::Config;
use grovekv::node::{api::grpc::grove_server::GroveServer, GroveNode};
use tonic::transport::Server;
use tracing_subscriber::EnvFilter;

#[derive(Parser)]
#[command(version, about, long_about = None)]
struct Args {
    /// Node id, overrides the config file
    #[arg(short, long)]
    id: Option<String>,
    /// Listen port, overrides the config file
    #[arg(short, long)]
    port: Option<u16>,
    #[arg(short, long, default_value = "config.toml")]
    config: String,
}

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::from_default_env())
        .init();

    let args = Args::parse();
    let mut cfg = Config::new(&args.config)?;
    if let Some(id) = args.id {
        cfg.node_id = id;
    }
    if let Some(port) = args.port {
        cfg.port = port;
    }

    let host = cfg.host.clone().unwrap_or_else(|| "[::]".to_string());
    let addr = format!("{host}:{}", cfg.port).parse()?;
    let node = GroveNode::new(&cfg)?;

    Server::builder()
        .add_service(GroveServer::new(node))
        .serve(addr)
        .await?;

    Ok(())
}
