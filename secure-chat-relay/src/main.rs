use std::sync::Arc;

use anyhow::Result;
use clap::Parser;
use tokio::net::TcpListener;
use tracing::{error, info, warn};

use secure_chat_relay::{cli::Cli, config::ServerConfig, listener::Listener};

fn init_tracing() {
    use tracing_subscriber::{EnvFilter, fmt};

    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"));
    let _ = fmt().with_env_filter(filter).with_target(false).try_init();
}

#[tokio::main]
async fn main() -> Result<()> {
    init_tracing();

    let cli = Cli::parse();
    let config = ServerConfig::from_env(cli.port)?;

    info!("loading server credential");
    let credential = match config.key_provider().load() {
        Ok(credential) => credential,
        Err(err) => {
            error!(error = %err, "cannot load server credential");
            return Err(err.into());
        }
    };
    info!(subject = %credential.certificate().subject, "server credential loaded");

    let listener = TcpListener::bind(config.bind_addr()).await?;
    let server = Listener::new(listener, Arc::new(credential)).with_delivery_policy(config.delivery);
    let addr = server.local_addr()?;
    info!("server waiting for clients on {}", addr);
    if let Err(err) = server.run_until_ctrl_c().await {
        warn!("server exited with error: {err:?}");
        return Err(err);
    }

    Ok(())
}
