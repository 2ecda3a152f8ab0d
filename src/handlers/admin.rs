//! Operator-facing REST API. Every route is scoped to one practice and sits behind the admin
//! bearer token.

use super::views::{CallLogView, Paginated, VoiceCallView};
use crate::consts::{DEFAULT_PAGE_LIMIT, MAX_PAGE_LIMIT};
use crate::db_types::{CallLogFilter, NewServiceMapping, Page, Practice, PracticeInput};
use crate::error::AppError;
use crate::records_types::{AppointmentType, Operatory, Provider, ProviderSlots, SlotQuery};
use crate::tasks::{subscribe_records_webhooks, SyncJob};
use crate::types::AppState;
use crate::utils::{practice_tz, to_utc};

use axum::{
    extract::{Path, Query, State},
    http::StatusCode,
    response::IntoResponse,
    routing::{delete, get, post},
    Json, Router,
};
use chrono::NaiveDate;
use serde::Deserialize;
use serde_json::json;
use std::sync::Arc;
use time::OffsetDateTime;
use tracing::info;
use uuid::Uuid;

type Shared = State<Arc<AppState>>;

pub fn routes() -> Router<Arc<AppState>> {
    Router::new()
        .route("/practices", get(list_practices).post(create_practice))
        .route(
            "/practices/:id",
            get(get_practice).put(update_practice).delete(delete_practice),
        )
        .route(
            "/practices/:id/service-mappings",
            get(list_service_mappings).post(create_service_mapping),
        )
        .route(
            "/practices/:id/service-mappings/:mapping_id",
            delete(delete_service_mapping),
        )
        .route("/practices/:id/call-logs", get(list_call_logs))
        .route("/practices/:id/call-logs/:call_log_id", get(get_call_log))
        .route("/practices/:id/appointments", get(list_appointments))
        .route("/practices/:id/voice-calls", get(list_voice_calls))
        .route("/practices/:id/voice-calls/:call_id", get(get_voice_call))
        .route(
            "/practices/:id/records/appointment-types",
            get(records_appointment_types),
        )
        .route("/practices/:id/records/providers", get(records_providers))
        .route("/practices/:id/records/operatories", get(records_operatories))
        .route("/practices/:id/records/slots", get(records_slots))
        .route(
            "/practices/:id/webhook-subscriptions",
            post(retry_webhook_subscription),
        )
}

async fn load_practice(app_state: &AppState, id: Uuid) -> Result<Practice, AppError> {
    app_state
        .store
        .get_practice(id)
        .await?
        .ok_or(AppError::NotFound)
}

fn queue_practice_setup(app_state: &AppState, practice: &Practice) {
    let practice_id = practice.id;
    app_state
        .sync
        .enqueue(SyncJob::ProvisionAssistant { practice_id });
    app_state
        .sync
        .enqueue(SyncJob::SubscribeRecordsWebhooks { practice_id });
}

// practices

async fn list_practices(State(app_state): Shared) -> Result<Json<Vec<Practice>>, AppError> {
    Ok(Json(app_state.store.list_practices().await?))
}

async fn create_practice(
    State(app_state): Shared,
    Json(input): Json<PracticeInput>,
) -> Result<impl IntoResponse, AppError> {
    let input = input.normalize().map_err(AppError::Validation)?;
    let practice = app_state.store.insert_practice(input).await?;
    info!(practice = %practice.id, subdomain = %practice.records_subdomain, "practice created");
    queue_practice_setup(&app_state, &practice);
    Ok((StatusCode::CREATED, Json(practice)))
}

async fn get_practice(
    State(app_state): Shared,
    Path(id): Path<Uuid>,
) -> Result<Json<Practice>, AppError> {
    Ok(Json(load_practice(&app_state, id).await?))
}

async fn update_practice(
    State(app_state): Shared,
    Path(id): Path<Uuid>,
    Json(input): Json<PracticeInput>,
) -> Result<Json<Practice>, AppError> {
    let input = input.normalize().map_err(AppError::Validation)?;
    let practice = app_state
        .store
        .update_practice(id, input)
        .await?
        .ok_or(AppError::NotFound)?;
    info!(practice = %practice.id, "practice updated");
    queue_practice_setup(&app_state, &practice);
    Ok(Json(practice))
}

async fn delete_practice(
    State(app_state): Shared,
    Path(id): Path<Uuid>,
) -> Result<StatusCode, AppError> {
    if !app_state.store.delete_practice(id).await? {
        return Err(AppError::NotFound);
    }
    info!(practice = %id, "practice deleted");
    Ok(StatusCode::NO_CONTENT)
}

// service mappings

async fn list_service_mappings(
    State(app_state): Shared,
    Path(id): Path<Uuid>,
) -> Result<impl IntoResponse, AppError> {
    let practice = load_practice(&app_state, id).await?;
    Ok(Json(
        app_state.store.list_service_mappings(practice.id).await?,
    ))
}

async fn create_service_mapping(
    State(app_state): Shared,
    Path(id): Path<Uuid>,
    Json(mut mapping): Json<NewServiceMapping>,
) -> Result<impl IntoResponse, AppError> {
    let practice = load_practice(&app_state, id).await?;
    mapping.spoken_name = mapping.spoken_name.trim().to_string();
    if mapping.spoken_name.is_empty() {
        return Err(AppError::Validation("spoken_name must not be empty".to_string()));
    }
    if mapping.appointment_type_id <= 0 {
        return Err(AppError::Validation(
            "appointment_type_id must be positive".to_string(),
        ));
    }
    let created = app_state
        .store
        .insert_service_mapping(practice.id, mapping)
        .await?;
    Ok((StatusCode::CREATED, Json(created)))
}

async fn delete_service_mapping(
    State(app_state): Shared,
    Path((id, mapping_id)): Path<(Uuid, Uuid)>,
) -> Result<StatusCode, AppError> {
    if !app_state
        .store
        .delete_service_mapping(id, mapping_id)
        .await?
    {
        return Err(AppError::NotFound);
    }
    Ok(StatusCode::NO_CONTENT)
}

// call logs

#[derive(Deserialize, Debug, Default)]
struct CallLogQuery {
    page: Option<u32>,
    limit: Option<u32>,
    patient_id: Option<i64>,
}

async fn list_call_logs(
    State(app_state): Shared,
    Path(id): Path<Uuid>,
    Query(query): Query<CallLogQuery>,
) -> Result<Json<Paginated<CallLogView>>, AppError> {
    let practice = load_practice(&app_state, id).await?;
    let page = Page::new(query.page, query.limit);
    let filter = CallLogFilter {
        patient_id: query.patient_id,
        booked_only: false,
    };
    let (rows, total) = app_state
        .store
        .list_call_logs(practice.id, &filter, page)
        .await?;
    Ok(Json(Paginated::new(rows, page, total)))
}

async fn get_call_log(
    State(app_state): Shared,
    Path((id, call_log_id)): Path<(Uuid, Uuid)>,
) -> Result<Json<CallLogView>, AppError> {
    let log = app_state
        .store
        .get_call_log(id, call_log_id)
        .await?
        .ok_or(AppError::NotFound)?;
    Ok(Json(log.into()))
}

async fn list_appointments(
    State(app_state): Shared,
    Path(id): Path<Uuid>,
    Query(query): Query<CallLogQuery>,
) -> Result<Json<Paginated<CallLogView>>, AppError> {
    let practice = load_practice(&app_state, id).await?;
    let page = Page::new(query.page, query.limit);
    let filter = CallLogFilter {
        patient_id: query.patient_id,
        booked_only: true,
    };
    let (rows, total) = app_state
        .store
        .list_call_logs(practice.id, &filter, page)
        .await?;
    Ok(Json(Paginated::new(rows, page, total)))
}

// live voice platform calls

#[derive(Deserialize, Debug)]
struct VoiceCallQuery {
    limit: Option<u32>,
}

fn assistant_of(practice: &Practice) -> Result<&str, AppError> {
    practice
        .voice_assistant_id
        .as_deref()
        .ok_or_else(|| AppError::Validation("practice has no voice assistant yet".to_string()))
}

async fn list_voice_calls(
    State(app_state): Shared,
    Path(id): Path<Uuid>,
    Query(query): Query<VoiceCallQuery>,
) -> Result<Json<Vec<VoiceCallView>>, AppError> {
    let practice = load_practice(&app_state, id).await?;
    let limit = query
        .limit
        .unwrap_or(DEFAULT_PAGE_LIMIT)
        .clamp(1, MAX_PAGE_LIMIT);
    let calls = app_state
        .voice
        .list_calls(assistant_of(&practice)?, limit)
        .await?;
    let views = calls.iter().map(VoiceCallView::summary).collect();
    for call in calls {
        app_state.sync.enqueue(SyncJob::SyncCall {
            practice_id: practice.id,
            call: Box::new(call),
        });
    }
    Ok(Json(views))
}

async fn get_voice_call(
    State(app_state): Shared,
    Path((id, call_id)): Path<(Uuid, String)>,
) -> Result<Json<VoiceCallView>, AppError> {
    let practice = load_practice(&app_state, id).await?;
    let assistant_id = assistant_of(&practice)?;
    let call = app_state.voice.get_call(&call_id).await?;
    if call.assistant_id.as_deref().map_or(false, |a| a != assistant_id) {
        return Err(AppError::NotFound);
    }
    let view = VoiceCallView::detail(&call);
    app_state.sync.enqueue(SyncJob::SyncCall {
        practice_id: practice.id,
        call: Box::new(call),
    });
    Ok(Json(view))
}

// records system passthrough

async fn records_appointment_types(
    State(app_state): Shared,
    Path(id): Path<Uuid>,
) -> Result<Json<Vec<AppointmentType>>, AppError> {
    let practice = load_practice(&app_state, id).await?;
    let types = app_state
        .records
        .appointment_types(&practice.records_subdomain, practice.records_location_id)
        .await?;
    Ok(Json(types))
}

async fn records_providers(
    State(app_state): Shared,
    Path(id): Path<Uuid>,
) -> Result<Json<Vec<Provider>>, AppError> {
    let practice = load_practice(&app_state, id).await?;
    let providers = app_state
        .records
        .providers(&practice.records_subdomain, practice.records_location_id)
        .await?;
    Ok(Json(providers))
}

async fn records_operatories(
    State(app_state): Shared,
    Path(id): Path<Uuid>,
) -> Result<Json<Vec<Operatory>>, AppError> {
    let practice = load_practice(&app_state, id).await?;
    let operatories = app_state
        .records
        .operatories(&practice.records_subdomain, practice.records_location_id)
        .await?;
    Ok(Json(operatories))
}

#[derive(Deserialize, Debug)]
struct SlotsQuery {
    start_date: Option<String>,
    days: Option<u32>,
    appointment_type_id: Option<i64>,
}

async fn records_slots(
    State(app_state): Shared,
    Path(id): Path<Uuid>,
    Query(query): Query<SlotsQuery>,
) -> Result<Json<Vec<ProviderSlots>>, AppError> {
    let practice = load_practice(&app_state, id).await?;
    let start_date = match query.start_date {
        Some(date) => NaiveDate::parse_from_str(&date, "%Y-%m-%d")
            .map_err(|_| AppError::Validation(format!("start_date {date} is not YYYY-MM-DD")))?,
        None => to_utc(OffsetDateTime::now_utc())
            .with_timezone(&practice_tz(&practice))
            .date_naive(),
    };
    let slot_query = SlotQuery {
        start_date: start_date.format("%Y-%m-%d").to_string(),
        days: query.days.unwrap_or(1).clamp(1, 31),
        provider_ids: practice.provider_ids.clone(),
        operatory_ids: practice.default_operatory_id.into_iter().collect(),
        appointment_type_id: query.appointment_type_id,
    };
    let slots = app_state
        .records
        .available_slots(
            &practice.records_subdomain,
            practice.records_location_id,
            &slot_query,
        )
        .await?;
    Ok(Json(slots))
}

/// Manual retry of the appointment webhook subscription. Upstream failures surface as 502.
async fn retry_webhook_subscription(
    State(app_state): Shared,
    Path(id): Path<Uuid>,
) -> Result<impl IntoResponse, AppError> {
    let practice = load_practice(&app_state, id).await?;
    subscribe_records_webhooks(&app_state, &practice).await?;
    Ok(Json(json!({
        "subscribed": true,
        "subdomain": practice.records_subdomain,
        "target_url": app_state.config.records_webhook_url(),
    })))
}
