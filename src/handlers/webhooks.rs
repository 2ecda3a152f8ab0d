use crate::consts::{RECORDS_SIGNATURE_HEADER, VOICE_SIGNATURE_HEADER};
use crate::error::{log_error, AppError};
use crate::reconcile::{apply_records_event, apply_voice_event, resolve_voice_tenant, Reconciled};
use crate::records_types::RecordsWebhook;
use crate::signature::verify_signature;
use crate::tools::{run_tool_calls, unconfigured};
use crate::types::AppState;
use crate::voice_types::{VoiceMessage, VoiceWebhook};

use axum::{
    body::Bytes,
    extract::State,
    http::HeaderMap,
    response::{IntoResponse, Response},
    Json,
};
use serde::de::DeserializeOwned;
use serde_json::json;
use std::sync::Arc;
use time::OffsetDateTime;
use tracing::{debug, info, warn};

fn received() -> Response {
    Json(json!({ "received": true })).into_response()
}

/// Check the signature over the raw bytes, then decode.
fn authenticate<T: DeserializeOwned>(
    headers: &HeaderMap,
    header_name: &str,
    secret: Option<&str>,
    body: &Bytes,
) -> Result<T, AppError> {
    let signature = headers.get(header_name).and_then(|v| v.to_str().ok());
    if let Err(e) = verify_signature(body, signature, secret) {
        warn!(header = header_name, error = %e, "rejecting webhook");
        return Err(e);
    }
    serde_json::from_slice(body).map_err(|e| {
        warn!(error = %e, "undecodable webhook payload");
        AppError::MalformedPayload(e.to_string())
    })
}

/// Appointment sync outcomes from the Practice Records System.
pub async fn records_webhook(
    State(app_state): State<Arc<AppState>>,
    headers: HeaderMap,
    body: Bytes,
) -> Result<Response, AppError> {
    let event: RecordsWebhook = authenticate(
        &headers,
        RECORDS_SIGNATURE_HEADER,
        app_state.config.records_webhook_secret.as_deref(),
        &body,
    )?;

    match apply_records_event(app_state.store.as_ref(), &event, OffsetDateTime::now_utc()).await? {
        Reconciled::Updated(log) => {
            info!(call_id = %log.external_call_id, status = %log.status, "records event applied")
        }
        Reconciled::Skipped(reason) => debug!(?reason, "records event acknowledged without changes"),
    }
    Ok(received())
}

/// Server messages from the Voice Assistant Platform. `tool-calls` are answered inline.
pub async fn voice_webhook(
    State(app_state): State<Arc<AppState>>,
    headers: HeaderMap,
    body: Bytes,
) -> Result<Response, AppError> {
    let VoiceWebhook { message } = authenticate(
        &headers,
        VOICE_SIGNATURE_HEADER,
        app_state.config.voice_webhook_secret.as_deref(),
        &body,
    )?;
    let store = app_state.store.as_ref();
    let now = OffsetDateTime::now_utc();
    debug!(kind = message.kind(), call_id = %message.call().id, "voice event");

    let Some(practice) = resolve_voice_tenant(store, &message).await? else {
        return Ok(match &message {
            VoiceMessage::ToolCalls { tool_call_list, .. } => {
                Json(unconfigured(tool_call_list)).into_response()
            }
            _ => received(),
        });
    };

    match &message {
        VoiceMessage::ToolCalls {
            call,
            tool_call_list,
            ..
        } => {
            // tool results are returned even when the log write fails
            if let Err(e) = apply_voice_event(store, &practice, &message, now).await {
                log_error("failed to record tool-calls event", &e);
            }
            let ctx = app_state.tool_context(&practice, Some(&call.id), call.caller_phone());
            let results = run_tool_calls(&ctx, tool_call_list, now).await;
            Ok(Json(results).into_response())
        }
        _ => {
            if let Reconciled::Skipped(reason) =
                apply_voice_event(store, &practice, &message, now).await?
            {
                debug!(?reason, call_id = %message.call().id, "voice event acknowledged without changes");
            }
            Ok(received())
        }
    }
}
