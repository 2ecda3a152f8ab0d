//! Client for the Practice Records System (scheduling/EHR) REST API.

use crate::config::Config;
use crate::consts::{RECORDS_TOKEN_LIFETIME, TOKEN_REFRESH_MARGIN};
use crate::gateway::{read_json, ErrorKind, GatewayError};
use crate::records_types::{
    Appointment, AppointmentType, AuthToken, BookAppointmentRequest, BookedAppt,
    CreatePatientRequest, CreatedPatient, Envelope, NewAppointment, NewPatient, Operatory,
    Patient, PatientList, Provider, ProviderRef, ProviderSlots, SlotQuery, WebhookEndpoint,
    WebhookSubscription,
};

use reqwest::{header, Method, RequestBuilder, StatusCode};
use serde::de::DeserializeOwned;
use std::future::Future;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::Mutex;
use tokio::time::Instant;
use tracing::{debug, info, warn};

const SERVICE: &str = "records";

struct CachedToken {
    token: String,
    expires_at: Instant,
}

/// The platform-level bearer token, shared by every request path of one client.
pub struct TokenCache {
    lifetime: Duration,
    margin: Duration,
    current: Mutex<Option<CachedToken>>,
}

impl TokenCache {
    pub fn new(lifetime: Duration, margin: Duration) -> Self {
        Self {
            lifetime,
            margin,
            current: Mutex::new(None),
        }
    }

    /// Return the cached token, fetching a fresh one when none is cached or the cached one is
    /// within the refresh margin of expiry. Concurrent callers wait on a single refresh.
    pub async fn get_or_refresh<F, Fut>(&self, fetch: F) -> Result<String, GatewayError>
    where
        F: FnOnce() -> Fut,
        Fut: Future<Output = Result<String, GatewayError>>,
    {
        let mut current = self.current.lock().await;
        if let Some(cached) = current.as_ref() {
            if Instant::now() + self.margin < cached.expires_at {
                return Ok(cached.token.clone());
            }
            debug!("records token close to expiry, refreshing");
        }
        let token = fetch().await?;
        *current = Some(CachedToken {
            token: token.clone(),
            expires_at: Instant::now() + self.lifetime,
        });
        Ok(token)
    }

    pub async fn invalidate(&self) {
        *self.current.lock().await = None;
    }
}

#[derive(Clone)]
pub struct RecordsClient {
    http: reqwest::Client,
    base_url: String,
    api_key: String,
    accept: String,
    tokens: Arc<TokenCache>,
}

impl RecordsClient {
    pub fn new(http: reqwest::Client, config: &Config) -> Self {
        Self {
            http,
            base_url: config.records_api_base.clone(),
            api_key: config.records_api_key.clone(),
            accept: config.records_api_version.clone(),
            tokens: Arc::new(TokenCache::new(
                RECORDS_TOKEN_LIFETIME,
                TOKEN_REFRESH_MARGIN,
            )),
        }
    }

    async fn authenticate(&self) -> Result<String, GatewayError> {
        info!("requesting records api token");
        let resp = self
            .http
            .post(format!("{}/authenticates", self.base_url))
            .header(header::ACCEPT, &self.accept)
            .header(header::AUTHORIZATION, &self.api_key)
            .send()
            .await
            .map_err(|source| GatewayError::Transport {
                service: SERVICE,
                source,
            })?;
        let auth: AuthToken = unwrap_envelope(read_json(SERVICE, resp).await?)?;
        Ok(auth.token)
    }

    async fn token(&self) -> Result<String, GatewayError> {
        self.tokens.get_or_refresh(|| self.authenticate()).await
    }

    fn request(&self, method: Method, path: &str, token: &str) -> RequestBuilder {
        self.http
            .request(method, format!("{}{}", self.base_url, path))
            .header(header::ACCEPT, &self.accept)
            .bearer_auth(token)
    }

    /// Send an authenticated request and unwrap the response envelope.
    async fn send<T, B>(&self, build: B) -> Result<T, GatewayError>
    where
        T: DeserializeOwned,
        B: FnOnce(&str) -> RequestBuilder,
    {
        let token = self.token().await?;
        let resp = build(&token)
            .send()
            .await
            .map_err(|source| GatewayError::Transport {
                service: SERVICE,
                source,
            })?;
        if resp.status() == StatusCode::UNAUTHORIZED {
            warn!("records api rejected cached token");
            self.tokens.invalidate().await;
        }
        unwrap_envelope(read_json(SERVICE, resp).await?)
    }

    pub async fn appointment_types(
        &self,
        subdomain: &str,
        location_id: i64,
    ) -> Result<Vec<AppointmentType>, GatewayError> {
        self.send(|token| {
            self.request(Method::GET, "/appointment_types", token)
                .query(&[("subdomain", subdomain)])
                .query(&[("location_id", location_id)])
        })
        .await
    }

    pub async fn providers(
        &self,
        subdomain: &str,
        location_id: i64,
    ) -> Result<Vec<Provider>, GatewayError> {
        self.send(|token| {
            self.request(Method::GET, "/providers", token)
                .query(&[("subdomain", subdomain)])
                .query(&[("location_id", location_id)])
                .query(&[("requestable", true)])
        })
        .await
    }

    pub async fn operatories(
        &self,
        subdomain: &str,
        location_id: i64,
    ) -> Result<Vec<Operatory>, GatewayError> {
        self.send(|token| {
            self.request(Method::GET, "/operatories", token)
                .query(&[("subdomain", subdomain)])
                .query(&[("location_id", location_id)])
        })
        .await
    }

    pub async fn available_slots(
        &self,
        subdomain: &str,
        location_id: i64,
        query: &SlotQuery,
    ) -> Result<Vec<ProviderSlots>, GatewayError> {
        self.send(|token| {
            let mut rq = self
                .request(Method::GET, "/appointment_slots", token)
                .query(&[("subdomain", subdomain), ("start_date", query.start_date.as_str())])
                .query(&[("days", query.days)])
                .query(&[("lids[]", location_id)]);
            for pid in &query.provider_ids {
                rq = rq.query(&[("pids[]", pid)]);
            }
            for oid in &query.operatory_ids {
                rq = rq.query(&[("operatory_ids[]", oid)]);
            }
            if let Some(type_id) = query.appointment_type_id {
                rq = rq.query(&[("appointment_type_id", type_id)]);
            }
            rq
        })
        .await
    }

    pub async fn search_patients(
        &self,
        subdomain: &str,
        location_id: i64,
        phone: Option<&str>,
        name: Option<&str>,
    ) -> Result<Vec<Patient>, GatewayError> {
        let list: PatientList = self
            .send(|token| {
                let mut rq = self
                    .request(Method::GET, "/patients", token)
                    .query(&[("subdomain", subdomain)])
                    .query(&[("location_id", location_id)]);
                if let Some(phone) = phone {
                    rq = rq.query(&[("phone_number", phone)]);
                }
                if let Some(name) = name {
                    rq = rq.query(&[("name", name)]);
                }
                rq
            })
            .await?;
        Ok(list.patients)
    }

    pub async fn create_patient(
        &self,
        subdomain: &str,
        location_id: i64,
        provider_id: i64,
        patient: &NewPatient,
    ) -> Result<Patient, GatewayError> {
        let body = CreatePatientRequest {
            provider: ProviderRef { provider_id },
            patient,
        };
        let created: CreatedPatient = self
            .send(|token| {
                self.request(Method::POST, "/patients", token)
                    .query(&[("subdomain", subdomain)])
                    .query(&[("location_id", location_id)])
                    .json(&body)
            })
            .await?;
        Ok(created.user)
    }

    pub async fn book_appointment(
        &self,
        subdomain: &str,
        location_id: i64,
        appointment: &NewAppointment,
    ) -> Result<Appointment, GatewayError> {
        let body = BookAppointmentRequest { appt: appointment };
        let booked: BookedAppt = self
            .send(|token| {
                self.request(Method::POST, "/appointments", token)
                    .query(&[("subdomain", subdomain)])
                    .query(&[("location_id", location_id)])
                    .json(&body)
            })
            .await?;
        Ok(booked.appt)
    }

    pub async fn webhook_endpoints(&self) -> Result<Vec<WebhookEndpoint>, GatewayError> {
        self.send(|token| self.request(Method::GET, "/webhook_endpoints", token))
            .await
    }

    pub async fn create_webhook_endpoint(
        &self,
        target_url: &str,
        secret: Option<&str>,
    ) -> Result<WebhookEndpoint, GatewayError> {
        let mut body = serde_json::json!({ "target_url": target_url, "active": true });
        if let Some(secret) = secret {
            body["secret"] = serde_json::Value::from(secret);
        }
        self.send(|token| {
            self.request(Method::POST, "/webhook_endpoints", token)
                .json(&body)
        })
        .await
    }

    pub async fn subscribe(
        &self,
        endpoint_id: i64,
        subdomain: &str,
        resource_type: &str,
        event: &str,
    ) -> Result<WebhookSubscription, GatewayError> {
        let body = serde_json::json!({
            "resource_type": resource_type,
            "event": event,
            "active": true,
        });
        let path = format!("/webhook_endpoints/{endpoint_id}/webhook_subscriptions");
        self.send(|token| {
            self.request(Method::POST, &path, token)
                .query(&[("subdomain", subdomain)])
                .json(&body)
        })
        .await
    }

    /// Make sure `target_url` is registered and subscribed to appointment insertions for
    /// `subdomain`. An existing subscription is not an error.
    pub async fn ensure_appointment_subscription(
        &self,
        target_url: &str,
        secret: Option<&str>,
        subdomain: &str,
    ) -> Result<(), GatewayError> {
        let endpoints = self.webhook_endpoints().await?;
        let endpoint = match endpoints.into_iter().find(|e| e.target_url == target_url) {
            Some(endpoint) => endpoint,
            None => self.create_webhook_endpoint(target_url, secret).await?,
        };
        match self
            .subscribe(endpoint.id, subdomain, "Appointment", "appointment_insertion")
            .await
        {
            Ok(subscription) => {
                info!(subscription = subscription.id, %subdomain, "subscribed to appointment insertions");
                Ok(())
            }
            Err(e) if e.kind() == ErrorKind::Duplicate => {
                debug!(%subdomain, "appointment insertion subscription already present");
                Ok(())
            }
            Err(e) => Err(e),
        }
    }
}

fn envelope_message<T>(env: &Envelope<T>) -> String {
    env.error
        .as_ref()
        .or(env.description.as_ref())
        .map(|v| match v {
            serde_json::Value::String(s) => s.clone(),
            serde_json::Value::Array(items) => items
                .iter()
                .map(|i| i.as_str().map(str::to_string).unwrap_or_else(|| i.to_string()))
                .collect::<Vec<_>>()
                .join("; "),
            other => other.to_string(),
        })
        .unwrap_or_else(|| "request was not successful".to_string())
}

fn unwrap_envelope<T>(env: Envelope<T>) -> Result<T, GatewayError> {
    if !env.code {
        let message = envelope_message(&env);
        warn!(%message, "records api reported a failure");
        // a 2xx carrying a failure flag; classify as if it were a 400
        return Err(GatewayError::api(
            SERVICE,
            StatusCode::BAD_REQUEST,
            message.clone(),
            message,
        ));
    }
    env.data.ok_or_else(|| GatewayError::Decode {
        service: SERVICE,
        message: "response envelope had no data".to_string(),
    })
}
