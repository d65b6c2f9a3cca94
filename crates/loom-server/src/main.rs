//! Loom coordination service
//!
//! Resolves configuration, connects the JetStream substrate (with the
//! startup retry budget), initializes the engine, and serves the tool
//! surface over newline-delimited JSON on stdin/stdout:
//!
//! ```text
//! > {"tool": "registry_register", "args": {"agentType": "builder"}}
//! < {"result": "..."}
//! ```
//!
//! Exit codes: 0 on graceful shutdown, 1 on startup failure.

mod config;
mod tools;

use std::sync::Arc;

use config::{LogFormat, LoomConfig};
use loom_adapters::{NatsConfig, NatsSubstrate};
use loom_engine::{CoordinationEngine, GarbageCollector, IdentityOverrides};
use serde_json::{json, Value};
use tokio::io::{AsyncBufReadExt, AsyncWriteExt, BufReader};
use tokio::signal;
use tools::ToolRouter;
use tracing::{error, info};

#[tokio::main]
async fn main() {
    let config = match LoomConfig::resolve() {
        Ok(config) => config,
        Err(e) => {
            eprintln!("Error: {e}");
            std::process::exit(1);
        }
    };

    init_tracing(&config);

    info!(
        nats_url = %config.nats_url,
        project_id = %config.project_id,
        namespace = %config.namespace,
        channels = config.channels.len(),
        "Starting loom"
    );

    if let Err(e) = run(config).await {
        error!(error = %e, "Startup failed");
        eprintln!("Error: {e}");
        std::process::exit(1);
    }
}

fn init_tracing(config: &LoomConfig) {
    let filter = tracing_subscriber::EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new(config.logging.level.as_filter()));
    let builder = tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_writer(std::io::stderr);
    match config.logging.format {
        LogFormat::Json => builder.json().init(),
        LogFormat::Text => builder.init(),
    }
}

async fn run(config: LoomConfig) -> Result<(), loom_domain::LoomError> {
    let substrate = Arc::new(
        NatsSubstrate::connect_with_retry(&NatsConfig {
            url: config.nats_url.clone(),
            ..Default::default()
        })
        .await?,
    );

    let engine = Arc::new(CoordinationEngine::new(
        substrate.clone(),
        config.engine_config(),
    ));
    engine.init().await?;

    let identity = engine
        .identity
        .initialize(
            &config.project_id,
            &config.project_path,
            &IdentityOverrides::from_env(),
        )
        .await?;
    info!(agent_id = %identity.agent_id(), "Identity resolved");

    let gc = GarbageCollector::new(engine.registry.clone(), engine.config.lifecycle.clone())
        .start();

    let router = Arc::new(ToolRouter::new(
        engine.clone(),
        Some(identity.agent_id().to_string()),
    ));

    serve(router.clone()).await;

    info!("Shutting down");
    router.shutdown().await;
    gc.stop();
    substrate.shutdown().await;
    info!("Shutdown complete");
    Ok(())
}

/// Serve tool calls until stdin closes or a shutdown signal arrives.
async fn serve<S: loom_ports::Substrate>(router: Arc<ToolRouter<S>>) {
    let mut lines = BufReader::new(tokio::io::stdin()).lines();
    let mut stdout = tokio::io::stdout();

    loop {
        tokio::select! {
            _ = shutdown_signal() => break,
            line = lines.next_line() => {
                match line {
                    Ok(Some(line)) => {
                        let line = line.trim();
                        if line.is_empty() {
                            continue;
                        }
                        let response = handle_line(&router, line).await;
                        let mut payload = response.to_string();
                        payload.push('\n');
                        if stdout.write_all(payload.as_bytes()).await.is_err() {
                            break;
                        }
                        let _ = stdout.flush().await;
                    }
                    Ok(None) => break,
                    Err(e) => {
                        error!(error = %e, "Failed to read stdin");
                        break;
                    }
                }
            }
        }
    }
}

async fn handle_line<S: loom_ports::Substrate>(router: &ToolRouter<S>, line: &str) -> Value {
    let request: Value = match serde_json::from_str(line) {
        Ok(request) => request,
        Err(e) => return json!({ "result": format!("Error: request is not JSON: {e}") }),
    };
    let Some(tool) = request.get("tool").and_then(Value::as_str) else {
        return json!({ "result": "Error: request must carry a \"tool\" field" });
    };
    let args = request.get("args").cloned().unwrap_or_else(|| json!({}));

    let result = router.dispatch(tool, &args).await;
    json!({ "result": result })
}

/// Wait for Ctrl+C or SIGTERM.
async fn shutdown_signal() {
    let ctrl_c = async {
        if signal::ctrl_c().await.is_err() {
            std::future::pending::<()>().await;
        }
    };

    #[cfg(unix)]
    let terminate = async {
        match signal::unix::signal(signal::unix::SignalKind::terminate()) {
            Ok(mut sig) => {
                sig.recv().await;
            }
            Err(_) => std::future::pending::<()>().await,
        }
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        _ = ctrl_c => {},
        _ = terminate => {},
    }
}
