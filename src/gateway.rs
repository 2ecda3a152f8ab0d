//! Shared error type and response handling for the two outbound REST clients.

use reqwest::{Response, StatusCode};
use serde::{de::DeserializeOwned, Serialize};
use thiserror::Error;
use tracing::error;

/// Best-effort classification of an upstream failure.
///
/// Neither upstream API returns structured error codes, so this is derived from the HTTP status
/// and from substrings of the error message.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum ErrorKind {
    Duplicate,
    InvalidField,
    Unauthorized,
    NotFound,
    Other,
}

#[derive(Error, Debug)]
pub enum GatewayError {
    #[error("{service} request failed: {source}")]
    Transport {
        service: &'static str,
        #[source]
        source: reqwest::Error,
    },

    #[error("{service} returned {status}: {message}")]
    Api {
        service: &'static str,
        status: u16,
        body: String,
        message: String,
        kind: ErrorKind,
    },

    #[error("{service} response could not be decoded: {message}")]
    Decode {
        service: &'static str,
        message: String,
    },
}

impl GatewayError {
    pub fn kind(&self) -> ErrorKind {
        match self {
            GatewayError::Api { kind, .. } => *kind,
            _ => ErrorKind::Other,
        }
    }

    pub fn status(&self) -> Option<u16> {
        match self {
            GatewayError::Api { status, .. } => Some(*status),
            GatewayError::Transport { source, .. } => source.status().map(|s| s.as_u16()),
            GatewayError::Decode { .. } => None,
        }
    }

    pub fn api(service: &'static str, status: StatusCode, body: String, message: String) -> Self {
        let kind = classify(status, &message);
        GatewayError::Api {
            service,
            status: status.as_u16(),
            body,
            message,
            kind,
        }
    }
}

pub fn classify(status: StatusCode, message: &str) -> ErrorKind {
    match status {
        StatusCode::UNAUTHORIZED | StatusCode::FORBIDDEN => return ErrorKind::Unauthorized,
        StatusCode::NOT_FOUND => return ErrorKind::NotFound,
        _ => {}
    }
    let message = message.to_lowercase();
    let has = |needles: &[&str]| needles.iter().any(|n| message.contains(n));
    if has(&["duplicate", "already exists", "already been taken", "already taken"]) {
        ErrorKind::Duplicate
    } else if has(&["unauthorized", "not authorized", "forbidden", "invalid token"]) {
        ErrorKind::Unauthorized
    } else if has(&["invalid", "is required", "can't be blank", "must be", "missing"]) {
        ErrorKind::InvalidField
    } else if has(&["not found", "does not exist"]) {
        ErrorKind::NotFound
    } else {
        ErrorKind::Other
    }
}

/// Pull a human readable message out of an error body, falling back to the raw text.
pub fn error_message(body: &str) -> String {
    let Ok(value) = serde_json::from_str::<serde_json::Value>(body) else {
        return body.trim().to_string();
    };
    for key in ["error", "message", "description"] {
        match value.get(key) {
            Some(serde_json::Value::String(s)) if !s.is_empty() => return s.clone(),
            Some(serde_json::Value::Array(items)) if !items.is_empty() => {
                return items
                    .iter()
                    .map(|i| match i {
                        serde_json::Value::String(s) => s.clone(),
                        other => other.to_string(),
                    })
                    .collect::<Vec<_>>()
                    .join("; ")
            }
            _ => {}
        }
    }
    body.trim().to_string()
}

/// Turn a response into `T`, surfacing non-2xx statuses as [`GatewayError::Api`].
pub async fn read_json<T: DeserializeOwned>(
    service: &'static str,
    resp: Response,
) -> Result<T, GatewayError> {
    let status = resp.status();
    let body = resp
        .text()
        .await
        .map_err(|source| GatewayError::Transport { service, source })?;
    if !status.is_success() {
        let message = error_message(&body);
        error!(%service, status = status.as_u16(), %message, "upstream request failed");
        return Err(GatewayError::api(service, status, body, message));
    }
    serde_json::from_str(&body).map_err(|e| {
        error!(%service, error = %e, "failed to deserialize upstream response");
        GatewayError::Decode {
            service,
            message: e.to_string(),
        }
    })
}
