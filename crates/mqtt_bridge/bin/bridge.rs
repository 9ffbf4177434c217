//! Service entry point.
//!
//! Loads the YAML configuration, installs termination-signal handling, and
//! runs the supervisor until cancelled. Start-up failures exit non-zero with
//! a code identifying the failing step (2 config, 3 exporter init, 4 broker
//! connect, 5 subscribe); a clean shutdown exits 0.
//!
//! ```bash
//! bridge --config /etc/mqtt-otlp-bridge/config.yaml
//! RUST_LOG=debug bridge -c config.yaml
//! ```

use anyhow::bail;
use mqtt_bridge::config::BridgeConfig;
use mqtt_bridge::supervisor::{self, ShutdownSignal, SupervisorError};
use span_pipeline::ShutdownReport;
use tracing::info;
use tracing_subscriber::EnvFilter;

fn parse_args() -> anyhow::Result<String> {
    let mut args = std::env::args().skip(1);
    let mut config_path = "config.yaml".to_string();

    while let Some(arg) = args.next() {
        match arg.as_str() {
            "--config" | "-c" => {
                config_path = match args.next() {
                    Some(path) => path,
                    None => bail!("{arg} requires a path argument"),
                };
            }
            other => bail!("unknown argument: {other}"),
        }
    }

    Ok(config_path)
}

async fn run(config_path: &str) -> Result<ShutdownReport, SupervisorError> {
    let config = BridgeConfig::load(config_path)?;

    let signal = ShutdownSignal::new();
    supervisor::listen_for_termination(signal.clone());

    supervisor::run(&config, &signal).await
}

#[tokio::main]
async fn main() {
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")),
        )
        .init();

    let config_path = match parse_args() {
        Ok(path) => path,
        Err(e) => {
            eprintln!("{e}");
            std::process::exit(2);
        }
    };

    match run(&config_path).await {
        Ok(report) => {
            info!(
                spans_exported = report.spans_exported,
                spans_dropped = report.spans_dropped,
                "bridge exited cleanly"
            );
        }
        Err(e) => {
            eprintln!("bridge failed: {e}");
            std::process::exit(e.exit_code());
        }
    }
}
