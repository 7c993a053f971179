use gpilot::auth::{OAuthRefresher, TokenManager};
use gpilot::calendar_automation::CalendarAutomation;
use gpilot::clients::{ClientFactory, GoogleClients};
use gpilot::config::Config;
use gpilot::db::Database;
use gpilot::mail_automation::MailAutomation;
use gpilot::vault::{Vault, load_or_create_keyring_key};
use gpilot::worker::Worker;
use anyhow::Context;
use std::sync::Arc;
use tokio_util::sync::CancellationToken;
use tracing::info;

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let config = Config::load()?;

    tracing_subscriber::fmt()
        .with_max_level(config.log_level()?)
        .with_target(false)
        .init();

    let db = Database::new(&config.database_url).await?;
    db.run_migrations().await?;

    let vault = match &config.vault.key {
        Some(key) => Vault::from_base64(key)?,
        None => Vault::new(load_or_create_keyring_key()?),
    };
    let vault = Arc::new(vault);

    let (client_id, client_secret) = config.oauth.client_credentials()?;
    let refresher = OAuthRefresher::new(client_id, client_secret, &config.oauth.token_url)?;
    let tokens = Arc::new(TokenManager::new(
        db.clone(),
        vault,
        Arc::new(refresher),
        config.oauth.expiry_margin(),
    ));

    let clients: Arc<dyn ClientFactory> = Arc::new(
        GoogleClients::new(config.calendar.calendar_id.clone())
            .context("Failed to set up Google API clients")?,
    );
    let calendar = Arc::new(CalendarAutomation::new(
        db.clone(),
        Arc::clone(&clients),
        &config.calendar,
    ));
    let mail = Arc::new(MailAutomation::new(db.clone(), clients, &config.mail));

    let worker = Arc::new(Worker::new(db, tokens, calendar, mail, &config.worker));
    let cancel = CancellationToken::new();
    let handle = worker.start(cancel.clone());

    tokio::signal::ctrl_c()
        .await
        .context("Failed to listen for shutdown signal")?;
    info!("Shutdown requested");
    cancel.cancel();
    handle.await?;

    Ok(())
}
