use fogsync::failover::FailoverController;
use fogsync::node::{DiscoveryEvent, NodeContext};
use fogsync::observability::{init_tracing, json_requested};
use fogsync::transport::{BackendConnector, RedisConnector};
use fogsync::NodeConfig;
use std::path::PathBuf;
use std::process::ExitCode;
use std::sync::Arc;
use tokio::io::{AsyncBufReadExt, BufReader};
use tokio::sync::mpsc;
use tracing::{error, info, warn};

/// Discovery events arrive as JSON lines on stdin
fn spawn_stdin_reader(tx: mpsc::Sender<DiscoveryEvent>) {
    tokio::spawn(async move {
        let mut lines = BufReader::new(tokio::io::stdin()).lines();
        loop {
            match lines.next_line().await {
                Ok(Some(line)) if line.trim().is_empty() => continue,
                Ok(Some(line)) => match DiscoveryEvent::from_json(&line) {
                    Ok(event) => {
                        if tx.send(event).await.is_err() {
                            break;
                        }
                    }
                    Err(e) => warn!("{}", e),
                },
                Ok(None) => break,
                Err(e) => {
                    warn!(error = %e, "stdin read failed");
                    break;
                }
            }
        }
        info!("discovery input closed");
    });
}

#[tokio::main]
async fn main() -> ExitCode {
    init_tracing(json_requested());

    let path = std::env::args().nth(1).map(PathBuf::from);
    let config = match NodeConfig::load(path.as_deref()) {
        Ok(config) => config,
        Err(e) => {
            error!(error = %e, "cannot load configuration");
            return ExitCode::from(2);
        }
    };

    let connector: Arc<dyn BackendConnector> = Arc::new(RedisConnector::default());
    let failover_config = config.failover.clone();
    let node = match NodeContext::start(config, connector.clone()).await {
        Ok(node) => node,
        Err(e) => {
            error!(error = %e, "cannot start node");
            return ExitCode::FAILURE;
        }
    };

    let _failover = match failover_config {
        Some(fc) => match FailoverController::start(node.clone(), connector, fc).await {
            Ok(controller) => Some(controller),
            Err(e) => {
                warn!(error = %e, "sentinel unavailable, failover disabled");
                None
            }
        },
        None => None,
    };

    let (tx, rx) = mpsc::channel(64);
    spawn_stdin_reader(tx);
    tokio::spawn(node.clone().run_discovery(rx));

    let code = tokio::select! {
        err = node.wait_fatal() => {
            error!(error = %err, "shutting down");
            ExitCode::FAILURE
        }
        _ = tokio::signal::ctrl_c() => {
            info!("interrupted");
            ExitCode::SUCCESS
        }
    };

    node.shutdown().await;
    code
}
