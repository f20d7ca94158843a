//! NATS message handlers

pub mod import;

use std::sync::Arc;

use anyhow::Result;
use async_nats::Client;
use tokio::select;
use tracing::{error, info};

use crate::services::import_service::ImportService;

/// Start all message handlers
pub async fn start_handlers(client: Client, service: Arc<ImportService>, jwt_secret: String) -> Result<()> {
    info!("Starting message handlers...");
    let jwt_secret = Arc::new(jwt_secret);

    let stage_sub = client.subscribe("crm.import.stage").await?;
    let preview_sub = client.subscribe("crm.import.preview").await?;
    let start_sub = client.subscribe("crm.import.start").await?;
    let continue_sub = client.subscribe("crm.import.continue").await?;
    let undo_sub = client.subscribe("crm.import.undo").await?;
    let status_sub = client.subscribe("crm.import.status").await?;

    let stage_handle = tokio::spawn(import::handle_stage(
        client.clone(),
        stage_sub,
        Arc::clone(&service),
        Arc::clone(&jwt_secret),
    ));
    let preview_handle = tokio::spawn(import::handle_preview(
        client.clone(),
        preview_sub,
        Arc::clone(&service),
        Arc::clone(&jwt_secret),
    ));
    let start_handle = tokio::spawn(import::handle_start(
        client.clone(),
        start_sub,
        Arc::clone(&service),
        Arc::clone(&jwt_secret),
    ));
    let continue_handle = tokio::spawn(import::handle_continue(
        client.clone(),
        continue_sub,
        Arc::clone(&service),
        Arc::clone(&jwt_secret),
    ));
    let undo_handle = tokio::spawn(import::handle_undo(
        client.clone(),
        undo_sub,
        Arc::clone(&service),
        Arc::clone(&jwt_secret),
    ));
    let status_handle = tokio::spawn(import::handle_status(client, status_sub, service, jwt_secret));

    info!("Import handlers subscribed on crm.import.*");

    select! {
        result = stage_handle => {
            error!("Import stage handler finished: {:?}", result);
        }
        result = preview_handle => {
            error!("Import preview handler finished: {:?}", result);
        }
        result = start_handle => {
            error!("Import start handler finished: {:?}", result);
        }
        result = continue_handle => {
            error!("Import continue handler finished: {:?}", result);
        }
        result = undo_handle => {
            error!("Import undo handler finished: {:?}", result);
        }
        result = status_handle => {
            error!("Import status handler finished: {:?}", result);
        }
    }

    Ok(())
}
