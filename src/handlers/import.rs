//! Import handlers for NATS messages
//!
//! Every subject follows the same request/reply shape, so the loop lives in
//! `serve` and each handler only names the service call.

use std::future::Future;
use std::sync::Arc;

use anyhow::Result;
use async_nats::{Client, Subscriber};
use futures::StreamExt;
use serde::de::DeserializeOwned;
use serde::Serialize;
use tracing::{debug, error, warn};
use uuid::Uuid;

use crate::auth;
use crate::error::ImportError;
use crate::services::import_service::ImportService;
use crate::types::{
    ContinueImportRequest, ErrorResponse, ModuleRequest, Request, StageRowsRequest,
    StartImportRequest, SuccessResponse, UndoImportRequest, View,
};

/// Error reply carrying the error-page view as details
pub fn error_response(request_id: Uuid, err: &ImportError) -> ErrorResponse {
    let code = err.code();
    let message = err.to_string();
    let view = View::error_page(code, &message);
    let response = ErrorResponse::new(request_id, code, message);
    match serde_json::to_value(&view) {
        Ok(details) => response.with_details(details),
        Err(_) => response,
    }
}

/// Decode, authenticate and dispatch one message; returns the reply body
pub async fn respond<P, R, F, Fut>(subject: &str, body: &[u8], jwt_secret: &str, handle: F) -> Result<Vec<u8>>
where
    P: DeserializeOwned,
    R: Serialize,
    F: FnOnce(Uuid, P) -> Fut,
    Fut: Future<Output = Result<R, ImportError>>,
{
    let request: Request<P> = match serde_json::from_slice(body) {
        Ok(req) => req,
        Err(e) => {
            error!("Failed to parse {} request: {}", subject, e);
            let error = ErrorResponse::new(Uuid::nil(), "INVALID_REQUEST", e.to_string());
            return Ok(serde_json::to_vec(&error)?);
        }
    };

    let user_id = match auth::extract_auth(&request, jwt_secret) {
        Ok(info) => info.import_user_id(),
        Err(e) => {
            warn!("{} auth failed: {}", subject, e);
            let error = ErrorResponse::new(request.id, "UNAUTHORIZED", "Authentication required");
            return Ok(serde_json::to_vec(&error)?);
        }
    };

    match handle(user_id, request.payload).await {
        Ok(payload) => Ok(serde_json::to_vec(&SuccessResponse::new(request.id, payload))?),
        Err(e) => {
            match &e {
                ImportError::Database(_) | ImportError::Other(_) | ImportError::Collaborator(_) => {
                    error!(%user_id, error = %e, "{} failed", subject)
                }
                _ => warn!(%user_id, code = e.code(), error = %e, "{} refused", subject),
            }
            Ok(serde_json::to_vec(&error_response(request.id, &e))?)
        }
    }
}

async fn serve<P, R, F, Fut>(
    client: Client,
    mut subscriber: Subscriber,
    jwt_secret: Arc<String>,
    subject: &'static str,
    handle: F,
) -> Result<()>
where
    P: DeserializeOwned,
    R: Serialize,
    F: Fn(Uuid, P) -> Fut,
    Fut: Future<Output = Result<R, ImportError>>,
{
    while let Some(msg) = subscriber.next().await {
        debug!("Received {} message", subject);

        let reply = match msg.reply {
            Some(ref reply) => reply.clone(),
            None => {
                warn!("Message without reply subject");
                continue;
            }
        };

        let body = respond(subject, &msg.payload, &jwt_secret, &handle).await?;
        if let Err(e) = client.publish(reply, body.into()).await {
            error!("Failed to publish {} reply: {}", subject, e);
        }
    }

    Ok(())
}

/// Handle crm.import.stage messages
pub async fn handle_stage(
    client: Client,
    subscriber: Subscriber,
    service: Arc<ImportService>,
    jwt_secret: Arc<String>,
) -> Result<()> {
    serve(client, subscriber, jwt_secret, "crm.import.stage", |user_id, payload: StageRowsRequest| {
        let service = service.clone();
        async move { service.stage(user_id, payload).await }
    })
    .await
}

/// Handle crm.import.preview messages
pub async fn handle_preview(
    client: Client,
    subscriber: Subscriber,
    service: Arc<ImportService>,
    jwt_secret: Arc<String>,
) -> Result<()> {
    serve(client, subscriber, jwt_secret, "crm.import.preview", |user_id, payload: ModuleRequest| {
        let service = service.clone();
        async move { service.preview(user_id, &payload.module).await }
    })
    .await
}

/// Handle crm.import.start messages
pub async fn handle_start(
    client: Client,
    subscriber: Subscriber,
    service: Arc<ImportService>,
    jwt_secret: Arc<String>,
) -> Result<()> {
    serve(client, subscriber, jwt_secret, "crm.import.start", |user_id, payload: StartImportRequest| {
        let service = service.clone();
        async move { service.import(user_id, payload).await }
    })
    .await
}

/// Handle crm.import.continue messages
pub async fn handle_continue(
    client: Client,
    subscriber: Subscriber,
    service: Arc<ImportService>,
    jwt_secret: Arc<String>,
) -> Result<()> {
    serve(client, subscriber, jwt_secret, "crm.import.continue", |user_id, payload: ContinueImportRequest| {
        let service = service.clone();
        async move { service.continue_import(user_id, payload.job_id).await }
    })
    .await
}

/// Handle crm.import.undo messages
pub async fn handle_undo(
    client: Client,
    subscriber: Subscriber,
    service: Arc<ImportService>,
    jwt_secret: Arc<String>,
) -> Result<()> {
    serve(client, subscriber, jwt_secret, "crm.import.undo", |user_id, payload: UndoImportRequest| {
        let service = service.clone();
        async move { service.undo(user_id, payload).await }
    })
    .await
}

/// Handle crm.import.status messages
pub async fn handle_status(
    client: Client,
    subscriber: Subscriber,
    service: Arc<ImportService>,
    jwt_secret: Arc<String>,
) -> Result<()> {
    serve(client, subscriber, jwt_secret, "crm.import.status", |user_id, _payload: ModuleRequest| {
        let service = service.clone();
        async move { service.show_status(user_id).await }
    })
    .await
}

#[cfg(test)]
mod tests {
    use serde_json::Value;

    use super::*;
    use crate::config::ImportSettings;
    use crate::services::strategy::StrategyRegistry;
    use crate::services::testing::{contacts, Harness, CONTACT_FIELDS};
    use crate::types::{MergePolicy, StatusPage};

    const TEST_SECRET: &str = "test-secret-key-for-jwt-at-least-32-bytes-long";

    fn service(harness: &Harness) -> Arc<ImportService> {
        let settings = ImportSettings::default();
        Arc::new(ImportService::new(
            harness.backends(),
            Arc::new(StrategyRegistry::with_builtin(&settings.inventory_modules)),
            settings,
        ))
    }

    fn body<T: Serialize>(user_id: Uuid, payload: T) -> Vec<u8> {
        let token = auth::generate_token(user_id, "user", None, TEST_SECRET).unwrap();
        serde_json::to_vec(&Request::with_token(token, payload)).unwrap()
    }

    #[tokio::test]
    async fn test_start_replies_with_status_page() {
        let harness = Harness::new();
        harness.stage("Contacts", &CONTACT_FIELDS, contacts(2)).await;
        let service = service(&harness);
        let request = StartImportRequest {
            module: "Contacts".to_string(),
            modules: vec![],
            source: "CsvSource".to_string(),
            merge_policy: MergePolicy::Skip,
        };

        let reply = respond(
            "crm.import.start",
            &body(harness.user_id, request),
            TEST_SECRET,
            |user_id, payload: StartImportRequest| async move { service.import(user_id, payload).await },
        )
        .await
        .unwrap();

        let response: SuccessResponse<StatusPage> = serde_json::from_slice(&reply).unwrap();
        assert!(!response.payload.views.is_empty());
    }

    #[tokio::test]
    async fn test_failure_reply_carries_error_page() {
        let harness = Harness::new();
        let service = service(&harness);

        let reply = respond(
            "crm.import.status",
            &body(harness.user_id, ModuleRequest::default()),
            TEST_SECRET,
            |user_id, _payload: ModuleRequest| async move { service.show_status(user_id).await },
        )
        .await
        .unwrap();

        let response: ErrorResponse = serde_json::from_slice(&reply).unwrap();
        assert_eq!(response.error.code, "IMPORT_INTERRUPTED");
        let details = response.error.details.unwrap();
        assert_eq!(details["template"], Value::from("errorPage"));
    }

    #[tokio::test]
    async fn test_missing_token_is_unauthorized() {
        let request = Request {
            id: Uuid::new_v4(),
            timestamp: chrono::Utc::now(),
            token: None,
            payload: ModuleRequest::default(),
        };

        let reply = respond(
            "crm.import.status",
            &serde_json::to_vec(&request).unwrap(),
            TEST_SECRET,
            |_user_id, _payload: ModuleRequest| async move { Ok::<_, ImportError>(()) },
        )
        .await
        .unwrap();

        let response: ErrorResponse = serde_json::from_slice(&reply).unwrap();
        assert_eq!(response.error.code, "UNAUTHORIZED");
        assert_eq!(response.id, request.id);
    }

    #[tokio::test]
    async fn test_malformed_body_is_invalid_request() {
        let reply = respond(
            "crm.import.start",
            b"{not json",
            TEST_SECRET,
            |_user_id, _payload: StartImportRequest| async move { Ok::<_, ImportError>(()) },
        )
        .await
        .unwrap();

        let response: ErrorResponse = serde_json::from_slice(&reply).unwrap();
        assert_eq!(response.error.code, "INVALID_REQUEST");
    }
}
