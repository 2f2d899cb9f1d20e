pub mod chat;

use std::sync::Arc;

use anyhow::{Context, Result};
use tokio_util::sync::CancellationToken;
use tracing::{info, warn};

use huayi_im::{
    Client, CommandApi, CredentialStore, FileCredentialStore, HttpCommandApi, HuayiConfig,
    WsConnector,
};

fn open_credentials(config: &HuayiConfig) -> Arc<dyn CredentialStore> {
    Arc::new(FileCredentialStore::new(config.credentials_path()))
}

/// Restore or log in, then run the interactive chat loop until `/exit`,
/// `/logout`, end of input, or a forced logout.
pub async fn chat_command(config: &HuayiConfig, user: Option<String>) -> Result<()> {
    let credentials = open_credentials(config);
    let api = HttpCommandApi::new(&config.file.server.base_url, Arc::clone(&credentials))?;
    let connection = config.connection()?;
    info!(server = %config.file.server.base_url, "starting chat client");

    let (client, handle) = Client::new(
        Arc::new(api),
        credentials,
        Box::new(WsConnector),
        connection,
    );
    let shutdown = CancellationToken::new();
    let runtime = tokio::spawn(client.run(shutdown.clone()));

    let result = chat::run(&handle, user).await;

    shutdown.cancel();
    if let Err(e) = runtime.await {
        warn!(error = %e, "client runtime did not stop cleanly");
    }
    result
}

/// Best-effort remote logout, then forget the saved session.
pub async fn logout_command(config: &HuayiConfig) -> Result<()> {
    let credentials = open_credentials(config);
    if credentials.session_token().is_none() {
        credentials.clear().context("Failed to clear saved credentials")?;
        println!("Not logged in.");
        return Ok(());
    }

    let api = HttpCommandApi::new(&config.file.server.base_url, Arc::clone(&credentials))?;
    if let Err(e) = api.logout().await {
        warn!(error = %e, "remote logout failed (ignored)");
    }
    credentials
        .clear()
        .context("Failed to clear saved credentials")?;
    println!("Logged out.");
    Ok(())
}

pub fn config_show_command(config: &HuayiConfig) -> Result<()> {
    println!("# data dir: {}", config.data_dir.display());
    println!("# config file: {}", config.config_toml_path().display());
    print!("{}", config.to_toml()?);
    Ok(())
}

pub fn config_set_server_command(config: &HuayiConfig, base_url: &str) -> Result<()> {
    config.save_server_url(base_url)?;
    println!(
        "Saved server {} to {}",
        base_url,
        config.config_toml_path().display()
    );
    Ok(())
}
