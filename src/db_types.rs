use crate::consts::{DEFAULT_PAGE_LIMIT, MAX_PAGE_LIMIT};

use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;
use time::OffsetDateTime;
use uuid::Uuid;

/// A tenant of the platform: one dental practice and its integration settings.
#[derive(Clone, Debug, PartialEq, Serialize, sqlx::FromRow)]
pub struct Practice {
    pub id: Uuid,
    pub name: String,
    pub records_subdomain: String,
    pub records_location_id: i64,
    pub provider_ids: Vec<i64>,
    pub default_operatory_id: Option<i64>,
    pub voice_assistant_id: Option<String>,
    pub timezone: String,
    pub greeting: Option<String>,
    #[serde(with = "time::serde::rfc3339")]
    pub created_at: OffsetDateTime,
    #[serde(with = "time::serde::rfc3339")]
    pub updated_at: OffsetDateTime,
}

impl Practice {
    pub fn from_input(input: PracticeInput, now: OffsetDateTime) -> Self {
        let mut practice = Self {
            id: Uuid::new_v4(),
            name: String::new(),
            records_subdomain: String::new(),
            records_location_id: 0,
            provider_ids: vec![],
            default_operatory_id: None,
            voice_assistant_id: None,
            timezone: String::new(),
            greeting: None,
            created_at: now,
            updated_at: now,
        };
        practice.apply(input, now);
        practice
    }

    pub fn apply(&mut self, input: PracticeInput, now: OffsetDateTime) {
        self.name = input.name;
        self.records_subdomain = input.records_subdomain;
        self.records_location_id = input.records_location_id;
        self.provider_ids = input.provider_ids;
        self.default_operatory_id = input.default_operatory_id;
        if input.voice_assistant_id.is_some() {
            self.voice_assistant_id = input.voice_assistant_id;
        }
        self.timezone = input.timezone;
        self.greeting = input.greeting;
        self.updated_at = now;
    }

    /// Provider used when a booking doesn't name one.
    pub fn default_provider_id(&self) -> Option<i64> {
        self.provider_ids.first().copied()
    }
}

fn default_timezone() -> String {
    "America/New_York".to_string()
}

/// Admin-submitted practice settings.
#[derive(Clone, Debug, Deserialize)]
pub struct PracticeInput {
    pub name: String,
    pub records_subdomain: String,
    pub records_location_id: i64,
    #[serde(default)]
    pub provider_ids: Vec<i64>,
    #[serde(default)]
    pub default_operatory_id: Option<i64>,
    #[serde(default)]
    pub voice_assistant_id: Option<String>,
    #[serde(default = "default_timezone")]
    pub timezone: String,
    #[serde(default)]
    pub greeting: Option<String>,
}

impl PracticeInput {
    pub fn normalize(mut self) -> Result<Self, String> {
        self.name = self.name.trim().to_string();
        self.records_subdomain = self.records_subdomain.trim().to_lowercase();
        self.voice_assistant_id = self
            .voice_assistant_id
            .map(|a| a.trim().to_string())
            .filter(|a| !a.is_empty());
        if self.name.is_empty() {
            return Err("name must not be empty".to_string());
        }
        if self.records_subdomain.is_empty() {
            return Err("records_subdomain must not be empty".to_string());
        }
        if self.records_location_id <= 0 {
            return Err("records_location_id must be positive".to_string());
        }
        if self.timezone.parse::<chrono_tz::Tz>().is_err() {
            return Err(format!("unknown timezone {}", self.timezone));
        }
        Ok(self)
    }
}

#[derive(Clone, Debug, PartialEq, Serialize, sqlx::FromRow)]
pub struct ServiceMapping {
    pub id: Uuid,
    pub practice_id: Uuid,
    pub spoken_name: String,
    pub appointment_type_id: i64,
    #[serde(with = "time::serde::rfc3339")]
    pub created_at: OffsetDateTime,
}

#[derive(Clone, Debug, Deserialize)]
pub struct NewServiceMapping {
    pub spoken_name: String,
    pub appointment_type_id: i64,
}

/// Lifecycle of one voice call and the appointment booked during it.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum CallStatus {
    Initiated,
    InProgress,
    Ended,
    CompletedBooking,
    CompletedEhrSynced,
    FailedEhrSync,
    Error,
}

impl CallStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            CallStatus::Initiated => "initiated",
            CallStatus::InProgress => "in_progress",
            CallStatus::Ended => "ended",
            CallStatus::CompletedBooking => "completed_booking",
            CallStatus::CompletedEhrSynced => "completed_ehr_synced",
            CallStatus::FailedEhrSync => "failed_ehr_sync",
            CallStatus::Error => "error",
        }
    }

    fn rank(&self) -> Option<u8> {
        match self {
            CallStatus::Initiated => Some(0),
            CallStatus::InProgress => Some(1),
            CallStatus::Ended => Some(2),
            CallStatus::CompletedBooking => Some(3),
            CallStatus::CompletedEhrSynced | CallStatus::FailedEhrSync => Some(4),
            CallStatus::Error => None,
        }
    }

    fn is_sync_outcome(&self) -> bool {
        matches!(
            self,
            CallStatus::CompletedEhrSynced | CallStatus::FailedEhrSync
        )
    }

    /// The status after a transition to `target`. Transitions never move backwards; `Error` is
    /// reachable from anywhere and only an EHR sync outcome leaves it.
    pub fn advance(self, target: CallStatus) -> CallStatus {
        match (self.rank(), target.rank()) {
            (_, None) => CallStatus::Error,
            (None, Some(_)) if target.is_sync_outcome() => target,
            (None, Some(_)) => self,
            (Some(current), Some(next)) if next >= current => target,
            _ => self,
        }
    }
}

impl fmt::Display for CallStatus {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        write!(f, "{}", self.as_str())
    }
}

impl FromStr for CallStatus {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Ok(match s {
            "initiated" => CallStatus::Initiated,
            "in_progress" => CallStatus::InProgress,
            "ended" => CallStatus::Ended,
            "completed_booking" => CallStatus::CompletedBooking,
            "completed_ehr_synced" => CallStatus::CompletedEhrSynced,
            "failed_ehr_sync" => CallStatus::FailedEhrSync,
            "error" => CallStatus::Error,
            other => return Err(format!("unknown call status {other}")),
        })
    }
}

/// Appointment details recorded on a call once the assistant books.
#[derive(Clone, Debug, Default, PartialEq)]
pub struct BookedAppointment {
    pub external_appointment_id: i64,
    pub patient_id: i64,
    pub provider_id: i64,
    pub operatory_id: Option<i64>,
    pub appointment_type_id: i64,
    pub start: Option<OffsetDateTime>,
    pub end: Option<OffsetDateTime>,
    pub note: Option<String>,
}

/// The interaction record. Deliberately not `Serialize`: responses go through a masked view.
#[derive(Clone, Debug, PartialEq)]
pub struct CallLog {
    pub id: Uuid,
    pub practice_id: Uuid,
    pub external_call_id: String,
    pub status: CallStatus,
    pub started_at: Option<OffsetDateTime>,
    pub ended_at: Option<OffsetDateTime>,
    pub caller_phone: Option<String>,
    pub transcript: Option<String>,
    pub summary: Option<String>,
    pub recording_url: Option<String>,
    pub ended_reason: Option<String>,
    pub appointment: Option<BookedAppointment>,
    pub sync_message: Option<String>,
    pub created_at: OffsetDateTime,
    pub updated_at: OffsetDateTime,
}

impl CallLog {
    pub fn new(practice_id: Uuid, external_call_id: &str, now: OffsetDateTime) -> Self {
        Self {
            id: Uuid::new_v4(),
            practice_id,
            external_call_id: external_call_id.to_string(),
            status: CallStatus::Initiated,
            started_at: None,
            ended_at: None,
            caller_phone: None,
            transcript: None,
            summary: None,
            recording_url: None,
            ended_reason: None,
            appointment: None,
            sync_message: None,
            created_at: now,
            updated_at: now,
        }
    }

    pub fn advance_status(&mut self, target: CallStatus) {
        self.status = self.status.advance(target);
    }

    pub fn external_appointment_id(&self) -> Option<i64> {
        self.appointment.as_ref().map(|a| a.external_appointment_id)
    }

    pub fn patient_id(&self) -> Option<i64> {
        self.appointment.as_ref().map(|a| a.patient_id)
    }
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct Page {
    pub page: u32,
    pub limit: u32,
}

impl Page {
    pub fn new(page: Option<u32>, limit: Option<u32>) -> Self {
        Self {
            page: page.unwrap_or(1).max(1),
            limit: limit.unwrap_or(DEFAULT_PAGE_LIMIT).clamp(1, MAX_PAGE_LIMIT),
        }
    }

    /// Rows to skip. Widened so any `page` a client sends stays representable.
    pub fn offset(&self) -> i64 {
        i64::from(self.page - 1).saturating_mul(i64::from(self.limit))
    }
}

#[derive(Clone, Debug, Default)]
pub struct CallLogFilter {
    pub patient_id: Option<i64>,
    pub booked_only: bool,
}
