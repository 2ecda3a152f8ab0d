use crate::config::Config;
use crate::db_types::Practice;
use crate::error::AppError;
use crate::reconcile::{apply_call_record, Reconciled};
use crate::tools::tool_definitions;
use crate::types::AppState;
use crate::voice_types::{
    AssistantConfig, AssistantMessage, AssistantModel, AssistantServer, VoiceCallRecord,
};

use std::collections::HashMap;
use std::fmt;
use std::future::Future;
use std::sync::Arc;
use std::time::Duration;
use time::OffsetDateTime;
use tokio::sync::mpsc::{self, error::TrySendError};
use tokio::sync::Mutex;
use tracing::{debug, error, info, warn};
use uuid::Uuid;

const ASSISTANT_MODEL_PROVIDER: &str = "openai";
const ASSISTANT_MODEL: &str = "gpt-4o";
const SERVER_MESSAGES: &[&str] = &[
    "tool-calls",
    "status-update",
    "transcript",
    "end-of-call-report",
];

/// Background work that must never hold up the request that triggered it.
#[derive(Clone)]
pub enum SyncJob {
    /// Fold a call already fetched from the voice platform into the call log.
    SyncCall {
        practice_id: Uuid,
        call: Box<VoiceCallRecord>,
    },
    /// Create or update the practice's voice assistant.
    ProvisionAssistant { practice_id: Uuid },
    /// Subscribe to appointment insertions for the practice's subdomain.
    SubscribeRecordsWebhooks { practice_id: Uuid },
}

// call payloads are logged by id only
impl fmt::Debug for SyncJob {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            SyncJob::SyncCall { practice_id, call } => f
                .debug_struct("SyncCall")
                .field("practice_id", practice_id)
                .field("call_id", &call.id)
                .finish(),
            SyncJob::ProvisionAssistant { practice_id } => f
                .debug_struct("ProvisionAssistant")
                .field("practice_id", practice_id)
                .finish(),
            SyncJob::SubscribeRecordsWebhooks { practice_id } => f
                .debug_struct("SubscribeRecordsWebhooks")
                .field("practice_id", practice_id)
                .finish(),
        }
    }
}

impl SyncJob {
    fn practice_id(&self) -> Uuid {
        match self {
            SyncJob::SyncCall { practice_id, .. }
            | SyncJob::ProvisionAssistant { practice_id }
            | SyncJob::SubscribeRecordsWebhooks { practice_id } => *practice_id,
        }
    }
}

/// Sending half of the sync worker's queue.
#[derive(Clone)]
pub struct SyncQueue {
    tx: mpsc::Sender<SyncJob>,
}

impl SyncQueue {
    pub fn new(capacity: usize) -> (Self, mpsc::Receiver<SyncJob>) {
        let (tx, rx) = mpsc::channel(capacity.max(1));
        (Self { tx }, rx)
    }

    /// Queue a job without waiting. A job that can't be queued is dead-lettered.
    pub fn enqueue(&self, job: SyncJob) -> bool {
        match self.tx.try_send(job) {
            Ok(()) => true,
            Err(TrySendError::Full(job)) => {
                error!(target: "dead_letter", ?job, "sync queue full, dropping job");
                false
            }
            Err(TrySendError::Closed(job)) => {
                error!(target: "dead_letter", ?job, "sync worker not running, dropping job");
                false
            }
        }
    }
}

#[derive(Clone, Copy, Debug)]
pub struct RetryPolicy {
    pub max_attempts: u32,
    pub base_delay: Duration,
}

impl RetryPolicy {
    pub fn from_config(config: &Config) -> Self {
        Self {
            max_attempts: config.sync_max_attempts.max(1),
            base_delay: config.sync_retry_base,
        }
    }

    /// Delay before retrying after the given (1-based) failed attempt.
    pub fn delay(&self, attempt: u32) -> Duration {
        self.base_delay
            .saturating_mul(2u32.saturating_pow(attempt.saturating_sub(1)))
    }
}

fn retryable(e: &AppError) -> bool {
    !matches!(
        e,
        AppError::NotFound | AppError::Validation(_) | AppError::MalformedPayload(_)
    )
}

/// Run `attempt` until it succeeds or the policy gives up; the final failure is dead-lettered.
pub async fn run_with_retry<F, Fut>(
    policy: RetryPolicy,
    job: &SyncJob,
    mut attempt: F,
) -> Result<(), AppError>
where
    F: FnMut() -> Fut,
    Fut: Future<Output = Result<(), AppError>>,
{
    let mut tries = 1;
    loop {
        match attempt().await {
            Ok(()) => return Ok(()),
            Err(e) if tries >= policy.max_attempts || !retryable(&e) => {
                error!(target: "dead_letter", ?job, attempts = tries, error = %e, "sync job failed");
                return Err(e);
            }
            Err(e) => {
                let delay = policy.delay(tries);
                warn!(?job, attempt = tries, error = %e, ?delay, "sync job failed, retrying");
                tokio::time::sleep(delay).await;
                tries += 1;
            }
        }
    }
}

/// Drain the queue until every sender is gone. Different practices' jobs run concurrently,
/// each with its own retries; one practice's jobs run in the order they were queued.
pub async fn run_sync_worker(
    app_state: Arc<AppState>,
    mut rx: mpsc::Receiver<SyncJob>,
    policy: RetryPolicy,
) {
    info!("sync worker started");
    let mut practice_locks: HashMap<Uuid, Arc<Mutex<()>>> = HashMap::new();
    while let Some(job) = rx.recv().await {
        debug!(?job, "sync job received");
        let lock = practice_locks.entry(job.practice_id()).or_default().clone();
        tokio::spawn(process_job(app_state.clone(), lock, policy, job));
    }
    info!("sync worker stopped");
}

async fn process_job(
    app_state: Arc<AppState>,
    practice_lock: Arc<Mutex<()>>,
    policy: RetryPolicy,
    job: SyncJob,
) {
    let _turn = practice_lock.lock().await;
    let (state, job_ref) = (app_state.as_ref(), &job);
    if run_with_retry(policy, &job, move || run_job(state, job_ref))
        .await
        .is_ok()
    {
        debug!(?job, "sync job done");
    }
}

async fn run_job(app_state: &AppState, job: &SyncJob) -> Result<(), AppError> {
    let practice = app_state
        .store
        .get_practice(job.practice_id())
        .await?
        .ok_or(AppError::NotFound)?;
    match job {
        SyncJob::SyncCall { call, .. } => sync_call(app_state, &practice, call).await,
        SyncJob::ProvisionAssistant { .. } => {
            provision_assistant(app_state, &practice).await.map(|_| ())
        }
        SyncJob::SubscribeRecordsWebhooks { .. } => {
            subscribe_records_webhooks(app_state, &practice).await
        }
    }
}

async fn sync_call(
    app_state: &AppState,
    practice: &Practice,
    record: &VoiceCallRecord,
) -> Result<(), AppError> {
    let call_id = &record.id;
    if let Some(assistant_id) = record.assistant_id.as_deref() {
        if practice.voice_assistant_id.as_deref() != Some(assistant_id) {
            warn!(%call_id, practice = %practice.id, %assistant_id, "call ran on another practice's assistant, not syncing");
            return Ok(());
        }
    }
    let outcome =
        apply_call_record(app_state.store.as_ref(), practice, record, OffsetDateTime::now_utc())
            .await?;
    if let Reconciled::Skipped(reason) = outcome {
        warn!(%call_id, ?reason, "call sync skipped");
    }
    Ok(())
}

fn assistant_config(config: &Config, practice: &Practice) -> AssistantConfig {
    let first_message = practice.greeting.clone().unwrap_or_else(|| {
        format!(
            "Thank you for calling {}. How can I help you today?",
            practice.name
        )
    });
    let prompt = format!(
        "You are the friendly phone receptionist for {name}, a dental practice. \
         Help callers book appointments. Look up existing patients before creating new ones, \
         only offer times returned by check_availability, and confirm the date and time before \
         booking. The practice is in the {tz} timezone; use get_current_date when the caller \
         refers to relative days.",
        name = practice.name,
        tz = practice.timezone,
    );
    AssistantConfig {
        name: format!("{} Receptionist", practice.name),
        first_message,
        model: AssistantModel {
            provider: ASSISTANT_MODEL_PROVIDER.to_string(),
            model: ASSISTANT_MODEL.to_string(),
            messages: vec![AssistantMessage {
                role: "system".to_string(),
                content: prompt,
            }],
            tools: tool_definitions(),
        },
        server: AssistantServer {
            url: config.voice_webhook_url(),
            secret: config.voice_webhook_secret.clone(),
        },
        server_messages: SERVER_MESSAGES.iter().map(|m| m.to_string()).collect(),
    }
}

/// Create the practice's assistant, or bring an existing one up to date. Returns its id.
pub async fn provision_assistant(
    app_state: &AppState,
    practice: &Practice,
) -> Result<String, AppError> {
    let assistant = assistant_config(&app_state.config, practice);
    match practice.voice_assistant_id.as_deref() {
        Some(assistant_id) => {
            app_state
                .voice
                .update_assistant(assistant_id, &assistant)
                .await?;
            info!(practice = %practice.id, %assistant_id, "assistant updated");
            Ok(assistant_id.to_string())
        }
        None => {
            let created = app_state.voice.create_assistant(&assistant).await?;
            app_state
                .store
                .set_voice_assistant_id(practice.id, &created.id)
                .await?;
            info!(practice = %practice.id, assistant_id = %created.id, "assistant created");
            Ok(created.id)
        }
    }
}

pub async fn subscribe_records_webhooks(
    app_state: &AppState,
    practice: &Practice,
) -> Result<(), AppError> {
    let config = &app_state.config;
    app_state
        .records
        .ensure_appointment_subscription(
            &config.records_webhook_url(),
            config.records_webhook_secret.as_deref(),
            &practice.records_subdomain,
        )
        .await?;
    Ok(())
}
