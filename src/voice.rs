//! Client for the Voice Assistant Platform REST API.

use crate::config::Config;
use crate::gateway::{read_json, GatewayError};
use crate::voice_types::{Assistant, AssistantConfig, VoiceCallRecord};

use reqwest::{Method, RequestBuilder};
use serde::de::DeserializeOwned;
use tracing::debug;

const SERVICE: &str = "voice";

#[derive(Clone)]
pub struct VoiceClient {
    http: reqwest::Client,
    base_url: String,
    api_key: String,
}

impl VoiceClient {
    pub fn new(http: reqwest::Client, config: &Config) -> Self {
        Self {
            http,
            base_url: config.voice_api_base.clone(),
            api_key: config.voice_api_key.clone(),
        }
    }

    fn request(&self, method: Method, path: &str) -> RequestBuilder {
        self.http
            .request(method, format!("{}{}", self.base_url, path))
            .bearer_auth(&self.api_key)
    }

    async fn send<T: DeserializeOwned>(&self, rq: RequestBuilder) -> Result<T, GatewayError> {
        let resp = rq.send().await.map_err(|source| GatewayError::Transport {
            service: SERVICE,
            source,
        })?;
        read_json(SERVICE, resp).await
    }

    pub async fn get_call(&self, call_id: &str) -> Result<VoiceCallRecord, GatewayError> {
        debug!(%call_id, "fetching call");
        self.send(self.request(Method::GET, &format!("/call/{call_id}")))
            .await
    }

    pub async fn list_calls(
        &self,
        assistant_id: &str,
        limit: u32,
    ) -> Result<Vec<VoiceCallRecord>, GatewayError> {
        let rq = self
            .request(Method::GET, "/call")
            .query(&[("assistantId", assistant_id)])
            .query(&[("limit", limit)]);
        self.send(rq).await
    }

    pub async fn create_assistant(
        &self,
        assistant: &AssistantConfig,
    ) -> Result<Assistant, GatewayError> {
        self.send(self.request(Method::POST, "/assistant").json(assistant))
            .await
    }

    pub async fn update_assistant(
        &self,
        assistant_id: &str,
        assistant: &AssistantConfig,
    ) -> Result<Assistant, GatewayError> {
        self.send(
            self.request(Method::PATCH, &format!("/assistant/{assistant_id}"))
                .json(assistant),
        )
        .await
    }
}
