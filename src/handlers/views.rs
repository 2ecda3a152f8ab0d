//! Response bodies for the admin API. Caller phone numbers only ever leave masked.

use crate::db_types::{BookedAppointment, CallLog, CallStatus, Page};
use crate::utils::mask_phone;
use crate::voice_types::VoiceCallRecord;

use serde::Serialize;
use time::OffsetDateTime;
use uuid::Uuid;

#[derive(Serialize, Debug)]
pub struct Paginated<T> {
    pub data: Vec<T>,
    pub page: u32,
    pub limit: u32,
    pub total: i64,
}

impl<T> Paginated<T> {
    pub fn new<S: Into<T>>(rows: Vec<S>, page: Page, total: i64) -> Self {
        Self {
            data: rows.into_iter().map(Into::into).collect(),
            page: page.page,
            limit: page.limit,
            total,
        }
    }
}

#[derive(Serialize, Debug)]
pub struct AppointmentView {
    pub external_appointment_id: i64,
    pub patient_id: i64,
    pub provider_id: i64,
    pub operatory_id: Option<i64>,
    pub appointment_type_id: i64,
    #[serde(with = "time::serde::rfc3339::option")]
    pub start: Option<OffsetDateTime>,
    #[serde(with = "time::serde::rfc3339::option")]
    pub end: Option<OffsetDateTime>,
    pub note: Option<String>,
}

impl From<BookedAppointment> for AppointmentView {
    fn from(a: BookedAppointment) -> Self {
        Self {
            external_appointment_id: a.external_appointment_id,
            patient_id: a.patient_id,
            provider_id: a.provider_id,
            operatory_id: a.operatory_id,
            appointment_type_id: a.appointment_type_id,
            start: a.start,
            end: a.end,
            note: a.note,
        }
    }
}

#[derive(Serialize, Debug)]
pub struct CallLogView {
    pub id: Uuid,
    pub practice_id: Uuid,
    pub external_call_id: String,
    pub status: CallStatus,
    #[serde(with = "time::serde::rfc3339::option")]
    pub started_at: Option<OffsetDateTime>,
    #[serde(with = "time::serde::rfc3339::option")]
    pub ended_at: Option<OffsetDateTime>,
    pub caller_phone: Option<String>,
    pub transcript: Option<String>,
    pub summary: Option<String>,
    pub recording_url: Option<String>,
    pub ended_reason: Option<String>,
    pub appointment: Option<AppointmentView>,
    pub sync_message: Option<String>,
    #[serde(with = "time::serde::rfc3339")]
    pub created_at: OffsetDateTime,
    #[serde(with = "time::serde::rfc3339")]
    pub updated_at: OffsetDateTime,
}

impl From<CallLog> for CallLogView {
    fn from(log: CallLog) -> Self {
        Self {
            id: log.id,
            practice_id: log.practice_id,
            external_call_id: log.external_call_id,
            status: log.status,
            started_at: log.started_at,
            ended_at: log.ended_at,
            caller_phone: log.caller_phone.as_deref().map(mask_phone),
            transcript: log.transcript,
            summary: log.summary,
            recording_url: log.recording_url,
            ended_reason: log.ended_reason,
            appointment: log.appointment.map(Into::into),
            sync_message: log.sync_message,
            created_at: log.created_at,
            updated_at: log.updated_at,
        }
    }
}

/// A call as reported live by the voice platform.
#[derive(Serialize, Debug)]
pub struct VoiceCallView {
    pub id: String,
    pub status: Option<String>,
    #[serde(with = "time::serde::rfc3339::option")]
    pub started_at: Option<OffsetDateTime>,
    #[serde(with = "time::serde::rfc3339::option")]
    pub ended_at: Option<OffsetDateTime>,
    pub ended_reason: Option<String>,
    pub caller_phone: Option<String>,
    pub summary: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub transcript: Option<String>,
    pub recording_url: Option<String>,
}

impl VoiceCallView {
    pub fn summary(record: &VoiceCallRecord) -> Self {
        Self {
            id: record.id.clone(),
            status: record.status.clone(),
            started_at: record.started_at,
            ended_at: record.ended_at,
            ended_reason: record.ended_reason.clone(),
            caller_phone: record.caller_phone().map(mask_phone),
            summary: record.summary().map(str::to_string),
            transcript: None,
            recording_url: record.recording_url().map(str::to_string),
        }
    }

    pub fn detail(record: &VoiceCallRecord) -> Self {
        Self {
            transcript: record.transcript().map(str::to_string),
            ..Self::summary(record)
        }
    }
}
