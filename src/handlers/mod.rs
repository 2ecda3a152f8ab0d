mod admin;
mod views;
mod webhooks;

use crate::error::AppError;
use crate::signature::secrets_match;
use crate::types::AppState;

use axum::{
    extract::State,
    middleware::{self, Next},
    response::{IntoResponse, Response},
    routing::{get, post},
    Json, Router,
};
use http::{header, Request};
use serde_json::json;
use std::sync::Arc;
use tracing::warn;

pub fn router(app_state: Arc<AppState>) -> Router {
    let admin = admin::routes().route_layer(middleware::from_fn_with_state(
        app_state.clone(),
        require_admin,
    ));

    Router::new()
        .route("/health", get(health))
        .route("/webhook/scheduling", post(webhooks::records_webhook))
        .route("/webhook/voice-platform", post(webhooks::voice_webhook))
        .nest("/api", admin)
        .with_state(app_state)
}

async fn health() -> impl IntoResponse {
    Json(json!({ "status": "ok" }))
}

/// Admin requests carry the operator session token as a bearer token.
async fn require_admin<B>(
    State(app_state): State<Arc<AppState>>,
    req: Request<B>,
    next: Next<B>,
) -> Result<Response, AppError> {
    let authorized = req
        .headers()
        .get(header::AUTHORIZATION)
        .and_then(|v| v.to_str().ok())
        .and_then(|v| v.strip_prefix("Bearer "))
        .map(|token| secrets_match(token, &app_state.config.admin_api_key));
    match authorized {
        Some(true) => Ok(next.run(req).await),
        Some(false) => {
            warn!(path = %req.uri().path(), "admin request with wrong token");
            Err(AppError::Unauthorized)
        }
        None => Err(AppError::Unauthorized),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::db_types::{BookedAppointment, CallStatus, Practice, PracticeInput};
    use crate::reconcile::record_booking;
    use crate::signature::sign;
    use crate::store::memory::MemoryStore;
    use crate::store::Store;
    use crate::tasks::SyncJob;

    use axum::body::Body;
    use http::{Method, StatusCode};
    use serde_json::Value;
    use time::OffsetDateTime;
    use tokio::sync::mpsc;
    use tower::ServiceExt;
    use uuid::Uuid;

    struct Harness {
        app: Router,
        store: Arc<MemoryStore>,
        jobs: mpsc::Receiver<SyncJob>,
    }

    fn harness() -> Harness {
        let store = Arc::new(MemoryStore::new());
        let (app_state, jobs) =
            AppState::for_tests(store.clone(), "http://records.invalid", "http://voice.invalid");
        Harness {
            app: router(app_state),
            store,
            jobs,
        }
    }

    async fn add_practice(store: &MemoryStore, subdomain: &str, assistant: &str) -> Practice {
        store
            .insert_practice(PracticeInput {
                name: format!("{subdomain} dental"),
                records_subdomain: subdomain.to_string(),
                records_location_id: 1,
                provider_ids: vec![100],
                default_operatory_id: None,
                voice_assistant_id: Some(assistant.to_string()),
                timezone: "America/New_York".to_string(),
                greeting: None,
            })
            .await
            .unwrap()
    }

    async fn send(app: &Router, req: Request<Body>) -> (StatusCode, Value) {
        let resp = app.clone().oneshot(req).await.unwrap();
        let status = resp.status();
        let bytes = hyper::body::to_bytes(resp.into_body()).await.unwrap();
        let body = if bytes.is_empty() {
            Value::Null
        } else {
            serde_json::from_slice(&bytes).unwrap_or(Value::Null)
        };
        (status, body)
    }

    fn webhook(path: &str, header_name: &str, signature: Option<String>, body: &Value) -> Request<Body> {
        let mut builder = Request::builder()
            .method(Method::POST)
            .uri(path)
            .header(header::CONTENT_TYPE, "application/json");
        if let Some(signature) = signature {
            builder = builder.header(header_name, signature);
        }
        builder.body(Body::from(body.to_string())).unwrap()
    }

    fn voice_webhook(body: &Value, secret: Option<&str>) -> Request<Body> {
        let signature = secret.map(|s| sign(body.to_string().as_bytes(), s));
        webhook("/webhook/voice-platform", "x-voice-signature", signature, body)
    }

    fn records_webhook(body: &Value) -> Request<Body> {
        let signature = Some(sign(body.to_string().as_bytes(), "records-secret"));
        webhook("/webhook/scheduling", "x-records-signature", signature, body)
    }

    fn admin(method: Method, uri: &str, token: Option<&str>, body: Option<Value>) -> Request<Body> {
        let mut builder = Request::builder().method(method).uri(uri);
        if let Some(token) = token {
            builder = builder.header(header::AUTHORIZATION, format!("Bearer {token}"));
        }
        match body {
            Some(body) => builder
                .header(header::CONTENT_TYPE, "application/json")
                .body(Body::from(body.to_string()))
                .unwrap(),
            None => builder.body(Body::empty()).unwrap(),
        }
    }

    fn end_of_call(call_id: &str) -> Value {
        json!({"message": {
            "type": "end-of-call-report",
            "call": {"id": call_id, "assistantId": "asst_a", "customer": {"number": "+15551234567"}},
            "endedReason": "customer-ended-call",
            "artifact": {"transcript": "AI: Hello"}
        }})
    }

    #[tokio::test]
    async fn health_needs_no_auth() {
        let h = harness();
        let req = Request::builder().uri("/health").body(Body::empty()).unwrap();
        let (status, body) = send(&h.app, req).await;
        assert_eq!(status, StatusCode::OK);
        assert_eq!(body["status"], "ok");
    }

    #[tokio::test]
    async fn bad_signature_is_forbidden_and_changes_nothing() {
        let h = harness();
        add_practice(&h.store, "alpha", "asst_a").await;

        let (status, _) = send(&h.app, voice_webhook(&end_of_call("call_1"), Some("wrong-secret"))).await;
        assert_eq!(status, StatusCode::FORBIDDEN);
        assert_eq!(h.store.call_log_count().await, 0);
    }

    #[tokio::test]
    async fn missing_signature_is_unauthorized() {
        let h = harness();
        add_practice(&h.store, "alpha", "asst_a").await;

        let (status, _) = send(&h.app, voice_webhook(&end_of_call("call_1"), None)).await;
        assert_eq!(status, StatusCode::UNAUTHORIZED);
        assert_eq!(h.store.call_log_count().await, 0);
    }

    #[tokio::test]
    async fn signed_voice_event_is_reconciled() {
        let h = harness();
        add_practice(&h.store, "alpha", "asst_a").await;

        let (status, body) = send(&h.app, voice_webhook(&end_of_call("call_1"), Some("voice-secret"))).await;
        assert_eq!(status, StatusCode::OK);
        assert_eq!(body, json!({"received": true}));
        let log = h.store.find_call_log_by_call_id("call_1").await.unwrap().unwrap();
        assert_eq!(log.status, CallStatus::Ended);
    }

    #[tokio::test]
    async fn call_claimed_by_another_practice_mid_delivery_is_acknowledged() {
        let h = harness();
        let alpha = add_practice(&h.store, "alpha", "asst_a").await;
        add_practice(&h.store, "beta", "asst_b").await;
        let (status, _) = send(&h.app, voice_webhook(&end_of_call("call_1"), Some("voice-secret"))).await;
        assert_eq!(status, StatusCode::OK);
        let owned = h.store.find_call_log_by_call_id("call_1").await.unwrap().unwrap();

        // beta's delivery reads before alpha's row is visible, then hits it on write
        h.store.serve_stale_call_lookups();
        let body = json!({"message": {
            "type": "status-update",
            "status": "in-progress",
            "call": {"id": "call_1", "assistantId": "asst_b"}
        }});
        let (status, body) = send(&h.app, voice_webhook(&body, Some("voice-secret"))).await;
        assert_eq!(status, StatusCode::OK);
        assert_eq!(body, json!({"received": true}));

        let log = h.store.get_call_log(alpha.id, owned.id).await.unwrap().unwrap();
        assert_eq!(log.practice_id, alpha.id);
        assert_eq!(log.status, CallStatus::Ended);
        assert_eq!(h.store.call_log_count().await, 1);
    }

    #[tokio::test]
    async fn tool_calls_answer_with_results() {
        let h = harness();
        add_practice(&h.store, "alpha", "asst_a").await;
        let body = json!({"message": {
            "type": "tool-calls",
            "call": {"id": "call_1", "assistantId": "asst_a"},
            "toolCallList": [{"id": "tc_1", "type": "function", "function": {"name": "list_services", "arguments": {}}}]
        }});

        let (status, resp) = send(&h.app, voice_webhook(&body, Some("voice-secret"))).await;
        assert_eq!(status, StatusCode::OK);
        assert_eq!(resp["results"][0]["toolCallId"], "tc_1");
        assert!(resp["results"][0]["result"].as_str().unwrap().contains("No services"));
        let log = h.store.find_call_log_by_call_id("call_1").await.unwrap().unwrap();
        assert_eq!(log.status, CallStatus::InProgress);
    }

    #[tokio::test]
    async fn unknown_assistant_is_acknowledged_without_storage() {
        let h = harness();
        let body = json!({"message": {
            "type": "tool-calls",
            "call": {"id": "call_1", "assistantId": "asst_nobody"},
            "toolCallList": [{"id": "tc_1", "function": {"name": "get_current_date"}}]
        }});
        let (status, resp) = send(&h.app, voice_webhook(&body, Some("voice-secret"))).await;
        assert_eq!(status, StatusCode::OK);
        assert!(resp["results"][0]["result"].as_str().unwrap().contains("not configured"));
        assert_eq!(h.store.call_log_count().await, 0);
    }

    #[tokio::test]
    async fn unrecognised_payloads_are_bad_requests() {
        let h = harness();
        let unknown = json!({"message": {"type": "hang", "call": {"id": "c"}}});
        let (status, _) = send(&h.app, voice_webhook(&unknown, Some("voice-secret"))).await;
        assert_eq!(status, StatusCode::BAD_REQUEST);

        let not_json = Request::builder()
            .method(Method::POST)
            .uri("/webhook/scheduling")
            .header("x-records-signature", sign(b"{oops", "records-secret"))
            .body(Body::from("{oops"))
            .unwrap();
        let (status, _) = send(&h.app, not_json).await;
        assert_eq!(status, StatusCode::BAD_REQUEST);
    }

    #[tokio::test]
    async fn records_event_for_unknown_appointment_is_acknowledged() {
        let h = harness();
        add_practice(&h.store, "alpha", "asst_a").await;
        let body = json!({
            "resource_type": "Appointment",
            "event": "appointment_insertion",
            "subdomain": "alpha",
            "status": "failure",
            "data": {"id": 404},
            "message": "boom"
        });
        let (status, resp) = send(&h.app, records_webhook(&body)).await;
        assert_eq!(status, StatusCode::OK);
        assert_eq!(resp, json!({"received": true}));
        assert_eq!(h.store.call_log_count().await, 0);
    }

    #[tokio::test]
    async fn records_event_completes_booked_call() {
        let h = harness();
        let practice = add_practice(&h.store, "alpha", "asst_a").await;
        let appointment = BookedAppointment {
            external_appointment_id: 55,
            patient_id: 9,
            ..Default::default()
        };
        record_booking(h.store.as_ref(), &practice, "call_1", appointment, OffsetDateTime::now_utc())
            .await
            .unwrap();

        let body = json!({
            "resource_type": "Appointment",
            "event": "appointment_insertion",
            "subdomain": "alpha",
            "status": "success",
            "data": {"id": 55}
        });
        let (status, _) = send(&h.app, records_webhook(&body)).await;
        assert_eq!(status, StatusCode::OK);
        let log = h.store.find_call_log_by_call_id("call_1").await.unwrap().unwrap();
        assert_eq!(log.status, CallStatus::CompletedEhrSynced);
    }

    #[tokio::test]
    async fn admin_routes_require_the_bearer_token() {
        let h = harness();
        let (status, _) = send(&h.app, admin(Method::GET, "/api/practices", None, None)).await;
        assert_eq!(status, StatusCode::UNAUTHORIZED);
        let (status, _) = send(&h.app, admin(Method::GET, "/api/practices", Some("guess"), None)).await;
        assert_eq!(status, StatusCode::UNAUTHORIZED);
        let (status, body) = send(&h.app, admin(Method::GET, "/api/practices", Some("admin-key"), None)).await;
        assert_eq!(status, StatusCode::OK);
        assert_eq!(body, json!([]));
    }

    #[tokio::test]
    async fn creating_a_practice_queues_provisioning() {
        let mut h = harness();
        let input = json!({
            "name": "Smile Dental",
            "records_subdomain": " SmileDental ",
            "records_location_id": 12,
            "provider_ids": [100]
        });
        let (status, body) = send(
            &h.app,
            admin(Method::POST, "/api/practices", Some("admin-key"), Some(input)),
        )
        .await;
        assert_eq!(status, StatusCode::CREATED);
        assert_eq!(body["records_subdomain"], "smiledental");
        assert_eq!(body["timezone"], "America/New_York");

        let id: Uuid = body["id"].as_str().unwrap().parse().unwrap();
        assert!(matches!(
            h.jobs.try_recv().unwrap(),
            SyncJob::ProvisionAssistant { practice_id } if practice_id == id
        ));
        assert!(matches!(
            h.jobs.try_recv().unwrap(),
            SyncJob::SubscribeRecordsWebhooks { practice_id } if practice_id == id
        ));

        let bad = json!({"name": "x", "records_subdomain": "y", "records_location_id": 1, "timezone": "Mars/Olympus"});
        let (status, _) = send(&h.app, admin(Method::POST, "/api/practices", Some("admin-key"), Some(bad))).await;
        assert_eq!(status, StatusCode::BAD_REQUEST);
    }

    #[tokio::test]
    async fn duplicate_service_mapping_conflicts() {
        let h = harness();
        let practice = add_practice(&h.store, "alpha", "asst_a").await;
        let uri = format!("/api/practices/{}/service-mappings", practice.id);

        let (status, _) = send(
            &h.app,
            admin(Method::POST, &uri, Some("admin-key"), Some(json!({"spoken_name": "Cleaning", "appointment_type_id": 3}))),
        )
        .await;
        assert_eq!(status, StatusCode::CREATED);
        let (status, _) = send(
            &h.app,
            admin(Method::POST, &uri, Some("admin-key"), Some(json!({"spoken_name": " cleaning", "appointment_type_id": 4}))),
        )
        .await;
        assert_eq!(status, StatusCode::CONFLICT);

        let (_, body) = send(&h.app, admin(Method::GET, &uri, Some("admin-key"), None)).await;
        assert_eq!(body.as_array().unwrap().len(), 1);
    }

    #[tokio::test]
    async fn call_logs_are_paginated_and_masked() {
        let h = harness();
        let practice = add_practice(&h.store, "alpha", "asst_a").await;
        for n in 0..3 {
            let call = json!({"message": {
                "type": "status-update",
                "status": "in-progress",
                "call": {"id": format!("call_{n}"), "assistantId": "asst_a", "customer": {"number": format!("+1555000777{n}")}}
            }});
            let (status, _) = send(&h.app, voice_webhook(&call, Some("voice-secret"))).await;
            assert_eq!(status, StatusCode::OK);
        }

        let uri = format!("/api/practices/{}/call-logs?page=2&limit=2", practice.id);
        let (status, body) = send(&h.app, admin(Method::GET, &uri, Some("admin-key"), None)).await;
        assert_eq!(status, StatusCode::OK);
        assert_eq!(body["page"], 2);
        assert_eq!(body["limit"], 2);
        assert_eq!(body["total"], 3);
        let data = body["data"].as_array().unwrap();
        assert_eq!(data.len(), 1);
        let phone = data[0]["caller_phone"].as_str().unwrap();
        assert!(phone.starts_with("***-***-777"), "{phone}");
        assert!(!body.to_string().contains("+1555"));

        let id = data[0]["id"].as_str().unwrap();
        let uri = format!("/api/practices/{}/call-logs/{id}", practice.id);
        let (status, detail) = send(&h.app, admin(Method::GET, &uri, Some("admin-key"), None)).await;
        assert_eq!(status, StatusCode::OK);
        assert!(detail["caller_phone"].as_str().unwrap().starts_with("***-***-"));
        assert!(!detail.to_string().contains("+1555"));
    }

    #[tokio::test]
    async fn far_out_page_is_empty() {
        let h = harness();
        let practice = add_practice(&h.store, "alpha", "asst_a").await;
        let uri = format!(
            "/api/practices/{}/call-logs?page=50000000&limit=100",
            practice.id
        );
        let (status, body) = send(&h.app, admin(Method::GET, &uri, Some("admin-key"), None)).await;
        assert_eq!(status, StatusCode::OK);
        assert_eq!(body["page"], 50000000);
        assert_eq!(body["data"], json!([]));

        let uri = format!("/api/practices/{}/appointments?page={}", practice.id, u32::MAX);
        let (status, _) = send(&h.app, admin(Method::GET, &uri, Some("admin-key"), None)).await;
        assert_eq!(status, StatusCode::OK);
    }

    #[tokio::test]
    async fn call_logs_are_scoped_to_their_practice() {
        let h = harness();
        let a = add_practice(&h.store, "alpha", "asst_a").await;
        let b = add_practice(&h.store, "beta", "asst_b").await;
        send(&h.app, voice_webhook(&end_of_call("call_1"), Some("voice-secret"))).await;
        let log = h.store.find_call_log_by_call_id("call_1").await.unwrap().unwrap();
        assert_eq!(log.practice_id, a.id);

        let uri = format!("/api/practices/{}/call-logs/{}", b.id, log.id);
        let (status, _) = send(&h.app, admin(Method::GET, &uri, Some("admin-key"), None)).await;
        assert_eq!(status, StatusCode::NOT_FOUND);
    }
}
