//! Gargantua - VM lifecycle control plane for HobbyFarm

use std::time::Duration;

use anyhow::Context as _;
use clap::Parser;
use kube::Client;
use tokio_util::sync::CancellationToken;

use gargantua_common::crd::all_crds;
use gargantua_common::store::KubeStoreProvider;
use gargantua_common::telemetry::{init_telemetry, LogFormat, TelemetryConfig};
use gargantua_common::DEFAULT_NAMESPACE;
use gargantua_operator::{controller_runner, OperatorConfig};

/// Gargantua - pools, claims and Terraform provisioning for HobbyFarm VMs
#[derive(Parser, Debug)]
#[command(name = "gargantua", version, about, long_about = None)]
struct Cli {
    /// Print the hobbyfarm.io CRD manifests and exit
    #[arg(long)]
    crd: bool,

    /// Namespace for every read and write
    #[arg(long, env = "RELEASE_NAMESPACE", default_value = DEFAULT_NAMESPACE)]
    namespace: String,

    /// Informer resync period in seconds, 0 disables resync
    #[arg(long, default_value_t = 1800)]
    resync_secs: u64,

    /// Attempts written on new DynamicBindRequests
    #[arg(long, default_value_t = 5)]
    dynamic_bind_attempts: i32,

    /// Seconds between checks on a pending Terraform run
    #[arg(long, default_value_t = 10)]
    provision_poll_secs: u64,

    /// Human readable logs instead of JSON
    #[arg(long)]
    text_logs: bool,
}

impl Cli {
    fn operator_config(&self) -> OperatorConfig {
        OperatorConfig {
            namespace: self.namespace.clone(),
            resync: (self.resync_secs > 0).then(|| Duration::from_secs(self.resync_secs)),
            dynamic_bind_attempts: self.dynamic_bind_attempts,
            provision_poll_interval: Duration::from_secs(self.provision_poll_secs),
        }
    }
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let cli = Cli::parse();

    if cli.crd {
        for crd in all_crds() {
            let yaml = serde_yaml::to_string(&crd)
                .map_err(|e| anyhow::anyhow!("Failed to serialize CRD: {}", e))?;
            println!("---\n{yaml}");
        }
        return Ok(());
    }

    init_telemetry(TelemetryConfig {
        log_format: if cli.text_logs {
            LogFormat::Text
        } else {
            LogFormat::Json
        },
        ..Default::default()
    })?;

    let config = cli.operator_config();
    tracing::info!(
        namespace = %config.namespace,
        dynamic_bind_attempts = config.dynamic_bind_attempts,
        "Starting gargantua"
    );

    let client = Client::try_default()
        .await
        .context("Failed to create Kubernetes client")?;
    let stores = KubeStoreProvider::new(client, config.namespace.clone());

    let shutdown = CancellationToken::new();
    let signal = shutdown.clone();
    tokio::spawn(async move {
        if let Err(e) = tokio::signal::ctrl_c().await {
            tracing::error!(error = %e, "Failed to listen for shutdown signal");
        }
        tracing::info!("Shutdown signal received");
        signal.cancel();
    });

    controller_runner::run(&stores, &config, shutdown).await;
    Ok(())
}
