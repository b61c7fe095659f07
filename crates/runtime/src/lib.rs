use std::sync::Arc;

use anyhow::{Context, Result};
use chatline_config::ClientConfig;
use chatline_sync::{HttpChatApi, SyncOrchestrator, SyncSettings};
use chatline_transport::{handshake_url, WsConnector};
use tracing::info;

pub mod telemetry {
    use anyhow::Result;
    use tracing_subscriber::{fmt::SubscriberBuilder, EnvFilter};

    pub fn init_tracing() -> Result<()> {
        let env_filter =
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"));

        let subscriber = SubscriberBuilder::default()
            .with_env_filter(env_filter)
            .with_writer(std::io::stderr)
            .finish();

        tracing::subscriber::set_global_default(subscriber)
            .map_err(|error| anyhow::anyhow!("failed to set tracing subscriber: {error}"))
    }
}

/// The REST client and push connector a chat session is built from.
#[derive(Clone)]
pub struct ClientServices {
    pub api: Arc<HttpChatApi>,
    pub connector: Arc<WsConnector>,
    pub settings: SyncSettings,
}

impl ClientServices {
    pub fn initialise(config: &ClientConfig) -> Result<Self> {
        let api = HttpChatApi::new(&config.api).context("failed to build REST client")?;

        // Reject a bad push endpoint now rather than on the first connect.
        handshake_url(&config.push.url, "")
            .with_context(|| format!("invalid push endpoint {}", config.push.url))?;
        let connector = WsConnector::new(config.push.clone());

        info!(api = %config.api.base_url, push = %config.push.url, "client services ready");

        Ok(Self {
            api: Arc::new(api),
            connector: Arc::new(connector),
            settings: SyncSettings::from(&config.typing),
        })
    }

    pub fn orchestrator(&self) -> SyncOrchestrator {
        SyncOrchestrator::new(self.api.clone(), self.connector.clone(), self.settings)
    }
}

pub async fn shutdown_signal() {
    if let Err(error) = tokio::signal::ctrl_c().await {
        tracing::warn!(?error, "failed to listen for shutdown signal");
    }
    info!("shutdown signal received");
}
