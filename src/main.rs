use latticedb::{LatticeConfig, LatticeKvServer, LatticeKvService, LatticeNode};
use tonic::transport::Server;
use tracing::info;
use tracing_subscriber::EnvFilter;

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    setup_tracing();

    let config = LatticeConfig::default();
    info!("starting LatticeDB node with config {:?}", config);

    let addr = config.listen_addr.parse()?;
    let node = LatticeNode::start(config).await?;
    node.create_table("kv").await?;

    let service = LatticeKvService::new(node);
    info!(%addr, "serving key-value rpc");
    Server::builder()
        .add_service(LatticeKvServer::new(service))
        .serve(addr)
        .await?;
    Ok(())
}

fn setup_tracing() {
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"));
    tracing_subscriber::fmt().with_env_filter(filter).init();
}
