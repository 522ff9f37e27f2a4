use std::env::args;
use std::process::exit;
use std::sync::Arc;
use taskmesh::core::MulticastTransport;
use taskmesh::testkit::{init_logging, LogLevel};
use taskmesh::{error, info};
use taskmesh::{Orchestrator, OrchestratorConfig, TaskmeshError};

const LOG_LEVEL: LogLevel = LogLevel::Info;

async fn run(config: OrchestratorConfig) -> Result<(), TaskmeshError> {
  let group = config.bus.group_v4()?;
  let transport = MulticastTransport::bind(group, config.bus.interface, config.bus.max_datagram)?;
  let node = Orchestrator::new(config, Arc::new(transport));
  node.start().await?;
  tokio::signal::ctrl_c().await?;
  info!(LOG_LEVEL, "interrupted, shutting down {}", node.node_id());
  node.shutdown().await;
  Ok(())
}

fn main() {
  init_logging("info");
  let config = match args().nth(1) {
    Some(path) => OrchestratorConfig::from_file(path),
    None => Ok(OrchestratorConfig::default()),
  };
  let config = match config {
    Ok(config) => config,
    Err(e) => {
      error!(LOG_LEVEL, "{}", e);
      exit(2);
    }
  };
  let rt = tokio::runtime::Builder::new_multi_thread()
    .worker_threads(num_cpus::get())
    .enable_all()
    .build();
  let result = match rt {
    Ok(rt) => rt.block_on(run(config)),
    Err(e) => Err(e.into()),
  };
  if let Err(e) = result {
    error!(LOG_LEVEL, "{}", e);
    exit(1);
  }
}
