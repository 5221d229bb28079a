//! XML log agent - follows a rotating log directory and emits parsed records as JSON lines.

use anyhow::{Context, Result};
use std::sync::Arc;
use std::time::Duration;
use tracing::{error, info};
use xmllog_agent::config::Config;
use xmllog_agent::consumer::{JsonLinesConsumer, LogConsumer};
use xmllog_agent::metrics;
use xmllog_agent::pipeline::{Pipeline, PipelineOptions};

const CONFIG_ENV: &str = "XMLLOG_AGENT_CONFIG";
const SHUTDOWN_TIMEOUT: Duration = Duration::from_secs(5);

#[tokio::main]
async fn main() -> Result<()> {
    init_tracing();

    let config_path = std::env::var(CONFIG_ENV).unwrap_or_else(|_| "config.toml".to_string());
    let config = Config::load(&config_path)
        .with_context(|| format!("failed to load config from {config_path}"))?;

    let consumer: Arc<dyn LogConsumer> = match config.output_path() {
        Some(path) => {
            info!(output = %path.display(), "writing records to file");
            Arc::new(JsonLinesConsumer::to_file(&path)?)
        }
        None => Arc::new(JsonLinesConsumer::stdout()),
    };

    let mut pipeline = Pipeline::start(PipelineOptions::from(&config), consumer)
        .context("failed to start log pipeline")?;

    if let Some(addr) = config.metrics.listen_addr {
        let cancel_token = pipeline.cancel_token();
        tokio::spawn(async move {
            if let Err(err) = metrics::serve(addr, cancel_token).await {
                error!(error = %err, "metrics server exited");
            }
        });
    }

    let outcome = tokio::select! {
        result = pipeline.wait() => result,
        result = tokio::signal::ctrl_c() => {
            if let Err(err) = result {
                error!(error = %err, "failed while waiting for shutdown signal");
            }
            info!("shutdown signal received");
            Ok(())
        }
    };

    if let Err(err) = &outcome {
        error!(error = %format!("{err:#}"), "pipeline failed; shutting down");
    }

    let stopped = pipeline.shutdown(SHUTDOWN_TIMEOUT).await;
    outcome.and(stopped)
}

fn init_tracing() {
    let subscriber = tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env().unwrap_or_else(|_| "info".into()),
        )
        .with_target(false)
        .with_writer(std::io::stderr)
        .finish();

    let _ = tracing::subscriber::set_global_default(subscriber);
}
