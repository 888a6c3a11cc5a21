/*
 * OpenClaw Bridge - Fleet Command Bridge Agent
 * Copyright (c) 2024 OpenClaw Fleet Project
 * 
 * This work is licensed under CC BY-NC-SA 4.0
 * https://creativecommons.org/licenses/by-nc-sa/4.0/
 */

use openclaw_bridge::{config::BridgeConfig, error::AppResult, runtime::BridgeRuntime};
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

#[tokio::main(flavor = "current_thread")]
async fn main() -> AppResult<()> {
    // Logging
    tracing_subscriber::registry()
        .with(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| "openclaw_bridge=info,tower_http=info".into()),
        )
        .with(tracing_subscriber::fmt::layer())
        .init();

    // Configuration errors (including an expired token) stop here, before any network call.
    let config = match BridgeConfig::load() {
        Ok(config) => config,
        Err(e) => {
            tracing::error!(error = %e, "bridge configuration rejected");
            return Err(e);
        }
    };

    tracing::info!(
        control_plane = %config.control.base_url,
        state_dir = %config.storage.state_dir.display(),
        health = config.health.enabled,
        "bridge configuration loaded"
    );

    let mut runtime = BridgeRuntime::init(config).await?;
    runtime.start()?;

    let shutdown = runtime.shutdown_token();
    tokio::select! {
        signal = tokio::signal::ctrl_c() => {
            if let Err(e) = signal {
                tracing::error!(error = %e, "failed to listen for ctrl-c");
            }
            tracing::info!("shutdown signal received");
        }
        _ = shutdown.cancelled() => {}
    }

    runtime.shutdown().await
}
