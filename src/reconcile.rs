//! Merges the two webhook streams into one call/appointment lifecycle per call.
//!
//! Voice events are keyed by the platform's call id, records events by the appointment id the
//! booking flow stored on the call. Both are resolved to a practice first, and nothing here
//! ever touches a call owned by a different practice.

use crate::db_types::{BookedAppointment, CallLog, CallStatus, Practice};
use crate::error::AppError;
use crate::records_types::{DeliveryStatus, RecordsWebhook};
use crate::store::{Store, StoreResult};
use crate::voice_types::{TranscriptType, VoiceCallRecord, VoiceMessage};

use time::OffsetDateTime;
use tracing::{debug, info, warn};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Skip {
    UnknownTenant,
    UnknownAppointment,
    ForeignCall,
    PartialTranscript,
}

#[derive(Debug)]
pub enum Reconciled {
    Updated(CallLog),
    Skipped(Skip),
}

/// Map a platform call status onto our lifecycle.
pub fn voice_status(status: &str) -> Option<CallStatus> {
    match status {
        "queued" | "ringing" | "scheduled" => Some(CallStatus::Initiated),
        "in-progress" | "forwarding" => Some(CallStatus::InProgress),
        "ended" => Some(CallStatus::Ended),
        _ => None,
    }
}

pub async fn resolve_voice_tenant(
    store: &dyn Store,
    message: &VoiceMessage,
) -> StoreResult<Option<Practice>> {
    let Some(assistant_id) = message.assistant_id() else {
        warn!(call_id = %message.call().id, "voice event carries no assistant id");
        return Ok(None);
    };
    let practice = store.find_practice_by_assistant_id(assistant_id).await?;
    if practice.is_none() {
        warn!(%assistant_id, "no practice configured for assistant");
    }
    Ok(practice)
}

/// Load the call's record, or start one. `None` when the call id belongs to another practice.
async fn load_or_start(
    store: &dyn Store,
    practice: &Practice,
    call_id: &str,
    started_at: Option<OffsetDateTime>,
    caller_phone: Option<&str>,
    now: OffsetDateTime,
) -> StoreResult<Option<CallLog>> {
    let mut log = match store.find_call_log_by_call_id(call_id).await? {
        Some(existing) if existing.practice_id != practice.id => {
            warn!(%call_id, practice = %practice.id, owner = %existing.practice_id, "call belongs to another practice");
            return Ok(None);
        }
        Some(existing) => existing,
        None => {
            info!(%call_id, practice = %practice.id, "new call");
            CallLog::new(practice.id, call_id, now)
        }
    };
    if log.started_at.is_none() {
        log.started_at = started_at;
    }
    if log.caller_phone.is_none() {
        log.caller_phone = caller_phone.map(str::to_string);
    }
    Ok(Some(log))
}

fn append_transcript(log: &mut CallLog, role: &str, text: &str) {
    let line = format!("{}: {}", role, text.trim());
    let transcript = log.transcript.get_or_insert_with(String::new);
    // a redelivered fragment lands as the last line already
    if transcript.lines().last() == Some(line.as_str()) {
        return;
    }
    if !transcript.is_empty() {
        transcript.push('\n');
    }
    transcript.push_str(&line);
}

/// Write the call back. A call id another practice claimed since it was read is left alone.
async fn save(store: &dyn Store, log: &CallLog) -> StoreResult<Reconciled> {
    match store.save_call_log(log).await {
        Ok(saved) => Ok(Reconciled::Updated(saved)),
        Err(AppError::Conflict(reason)) => {
            warn!(call_id = %log.external_call_id, practice = %log.practice_id, %reason, "call claimed by another practice");
            Ok(Reconciled::Skipped(Skip::ForeignCall))
        }
        Err(e) => Err(e),
    }
}

fn replace_if_some(field: &mut Option<String>, value: Option<&str>) {
    if let Some(value) = value.filter(|v| !v.is_empty()) {
        *field = Some(value.to_string());
    }
}

/// Apply one voice platform event to the call it belongs to.
pub async fn apply_voice_event(
    store: &dyn Store,
    practice: &Practice,
    message: &VoiceMessage,
    now: OffsetDateTime,
) -> StoreResult<Reconciled> {
    if let VoiceMessage::Transcript {
        transcript_type: TranscriptType::Partial,
        ..
    } = message
    {
        return Ok(Reconciled::Skipped(Skip::PartialTranscript));
    }

    let call = message.call();
    let Some(mut log) = load_or_start(
        store,
        practice,
        &call.id,
        call.started_at,
        call.caller_phone(),
        now,
    )
    .await?
    else {
        return Ok(Reconciled::Skipped(Skip::ForeignCall));
    };
    let before = log.status;

    match message {
        VoiceMessage::ToolCalls { .. } => log.advance_status(CallStatus::InProgress),
        VoiceMessage::StatusUpdate {
            status,
            ended_reason,
            ..
        } => {
            match voice_status(status) {
                Some(CallStatus::Ended) => {
                    log.advance_status(CallStatus::Ended);
                    log.ended_at = Some(call.ended_at.or(log.ended_at).unwrap_or(now));
                }
                Some(target) => log.advance_status(target),
                None => warn!(call_id = %call.id, %status, "unrecognised call status"),
            }
            replace_if_some(&mut log.ended_reason, ended_reason.as_deref());
        }
        VoiceMessage::Transcript {
            role, transcript, ..
        } => append_transcript(&mut log, role, transcript),
        VoiceMessage::EndOfCallReport {
            ended_reason,
            transcript,
            summary,
            recording_url,
            artifact,
            analysis,
            ..
        } => {
            log.advance_status(CallStatus::Ended);
            log.ended_at = Some(call.ended_at.or(log.ended_at).unwrap_or(now));
            let artifact = artifact.as_ref();
            replace_if_some(
                &mut log.transcript,
                artifact
                    .and_then(|a| a.transcript.as_deref())
                    .or(transcript.as_deref()),
            );
            replace_if_some(
                &mut log.summary,
                analysis
                    .as_ref()
                    .and_then(|a| a.summary.as_deref())
                    .or(summary.as_deref()),
            );
            replace_if_some(
                &mut log.recording_url,
                artifact
                    .and_then(|a| a.recording_url.as_deref())
                    .or(recording_url.as_deref()),
            );
            replace_if_some(&mut log.ended_reason, ended_reason.as_deref());
        }
    }

    if log.status != before {
        debug!(call_id = %call.id, from = %before, to = %log.status, event = message.kind(), "call status changed");
    }
    log.updated_at = now;
    save(store, &log).await
}

/// Fold a call fetched from the platform API into its record.
pub async fn apply_call_record(
    store: &dyn Store,
    practice: &Practice,
    record: &VoiceCallRecord,
    now: OffsetDateTime,
) -> StoreResult<Reconciled> {
    let Some(mut log) = load_or_start(
        store,
        practice,
        &record.id,
        record.started_at,
        record.caller_phone(),
        now,
    )
    .await?
    else {
        return Ok(Reconciled::Skipped(Skip::ForeignCall));
    };

    if let Some(target) = record.status.as_deref().and_then(voice_status) {
        log.advance_status(target);
    }
    if let Some(ended_at) = record.ended_at {
        log.advance_status(CallStatus::Ended);
        log.ended_at = Some(ended_at);
    }
    replace_if_some(&mut log.transcript, record.transcript());
    replace_if_some(&mut log.summary, record.summary());
    replace_if_some(&mut log.recording_url, record.recording_url());
    replace_if_some(&mut log.ended_reason, record.ended_reason.as_deref());

    log.updated_at = now;
    save(store, &log).await
}

/// Attach a booked appointment to the call it was booked on.
pub async fn record_booking(
    store: &dyn Store,
    practice: &Practice,
    call_id: &str,
    appointment: BookedAppointment,
    now: OffsetDateTime,
) -> StoreResult<Reconciled> {
    let Some(mut log) = load_or_start(store, practice, call_id, None, None, now).await? else {
        return Ok(Reconciled::Skipped(Skip::ForeignCall));
    };
    info!(%call_id, appointment = appointment.external_appointment_id, "appointment booked on call");
    log.appointment = Some(appointment);
    log.advance_status(CallStatus::CompletedBooking);
    log.updated_at = now;
    save(store, &log).await
}

/// Apply a records system event. Unknown tenants and appointments are acknowledged untouched.
pub async fn apply_records_event(
    store: &dyn Store,
    event: &RecordsWebhook,
    now: OffsetDateTime,
) -> StoreResult<Reconciled> {
    let subdomain = event.subdomain().trim().to_lowercase();
    let Some(practice) = store.find_practice_by_subdomain(&subdomain).await? else {
        warn!(%subdomain, "records webhook for unknown subdomain");
        return Ok(Reconciled::Skipped(Skip::UnknownTenant));
    };

    match event {
        RecordsWebhook::AppointmentInsertion {
            resource_type,
            status,
            data,
            message,
            ..
        } => {
            let Some(mut log) = store
                .find_call_log_by_appointment(practice.id, data.id)
                .await?
            else {
                warn!(%subdomain, appointment = data.id, %resource_type, "no call log for appointment");
                return Ok(Reconciled::Skipped(Skip::UnknownAppointment));
            };

            match status {
                DeliveryStatus::Success => {
                    log.advance_status(CallStatus::CompletedEhrSynced);
                    log.sync_message = Some(match data.foreign_id() {
                        Some(foreign_id) => format!(
                            "Appointment {} written to the practice's records as {foreign_id}",
                            data.id
                        ),
                        None => format!("Appointment {} written to the practice's records", data.id),
                    });
                }
                DeliveryStatus::Failure => {
                    log.advance_status(CallStatus::FailedEhrSync);
                    log.sync_message = Some(format!(
                        "Appointment {} failed to sync: {}",
                        data.id,
                        message.as_deref().unwrap_or("no reason given")
                    ));
                }
            }
            info!(call_id = %log.external_call_id, appointment = data.id, status = %log.status, "appointment sync reconciled");
            log.updated_at = now;
            save(store, &log).await
        }
    }
}
