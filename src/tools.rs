//! Functions the voice assistant calls mid-conversation.
//!
//! Every outcome, including failures, is rendered as a sentence the assistant can read back to
//! the caller. The webhook that carries the calls always answers 200.

use crate::db_types::{BookedAppointment, Practice, ServiceMapping};
use crate::error::{log_error, AppError};
use crate::gateway::{ErrorKind, GatewayError};
use crate::reconcile::{record_booking, Reconciled};
use crate::records::RecordsClient;
use crate::records_types::{NewAppointment, NewPatient, Patient, PatientBio, SlotQuery};
use crate::store::Store;
use crate::utils::{parse_rfc3339, practice_tz, spoken_time, to_offset, to_utc};
use crate::voice_types::{ToolCall, ToolCallResponse, ToolResult};

use chrono::NaiveDate;
use serde::de::DeserializeOwned;
use serde::Deserialize;
use serde_json::{json, Value};
use thiserror::Error;
use time::OffsetDateTime;
use tracing::{debug, info, warn};

const MAX_SPOKEN_SLOTS: usize = 6;
const MAX_SEARCH_DAYS: u32 = 7;

pub struct ToolContext<'a> {
    pub store: &'a dyn Store,
    pub records: &'a RecordsClient,
    pub practice: &'a Practice,
    pub call_id: Option<&'a str>,
    pub caller_phone: Option<&'a str>,
}

#[derive(Error, Debug)]
pub enum ToolError {
    #[error("unknown tool {0}")]
    UnknownTool(String),

    #[error("invalid arguments: {0}")]
    Arguments(String),

    /// Already phrased for the caller.
    #[error("{0}")]
    Spoken(String),

    #[error(transparent)]
    Gateway(#[from] GatewayError),

    #[error(transparent)]
    Store(#[from] AppError),
}

impl ToolError {
    fn spoken(&self) -> String {
        match self {
            ToolError::UnknownTool(name) => format!("The tool {name} is not available."),
            ToolError::Arguments(message) => {
                format!("I could not use those details: {message}. Please confirm them with the caller.")
            }
            ToolError::Spoken(message) => message.clone(),
            ToolError::Gateway(e) => match e {
                GatewayError::Api {
                    kind: ErrorKind::InvalidField,
                    message,
                    ..
                } => format!("The scheduling system rejected those details: {message}"),
                _ => "I could not reach the scheduling system just now. Please offer to have the office call back.".to_string(),
            },
            ToolError::Store(_) => {
                "Something went wrong on our side. Please offer to have the office call back."
                    .to_string()
            }
        }
    }
}

type ToolOutcome = Result<String, ToolError>;

/// Run every call in a `tool-calls` message, in order.
pub async fn run_tool_calls(
    ctx: &ToolContext<'_>,
    calls: &[ToolCall],
    now: OffsetDateTime,
) -> ToolCallResponse {
    let mut results = Vec::with_capacity(calls.len());
    for call in calls {
        let result = match run_tool(ctx, call, now).await {
            Ok(result) => result,
            Err(e) => {
                warn!(tool = %call.function.name, tool_call_id = %call.id, error = %e, "tool call failed");
                e.spoken()
            }
        };
        results.push(ToolResult {
            tool_call_id: call.id.clone(),
            result,
        });
    }
    ToolCallResponse { results }
}

/// Answer for tool calls arriving on an assistant no practice is configured for.
pub fn unconfigured(calls: &[ToolCall]) -> ToolCallResponse {
    ToolCallResponse {
        results: calls
            .iter()
            .map(|call| ToolResult {
                tool_call_id: call.id.clone(),
                result: "This practice is not configured for scheduling yet. Please offer to take a message.".to_string(),
            })
            .collect(),
    }
}

async fn run_tool(ctx: &ToolContext<'_>, call: &ToolCall, now: OffsetDateTime) -> ToolOutcome {
    let args = call.function.arguments();
    debug!(tool = %call.function.name, ?args, "running tool");
    match call.function.name.as_str() {
        "get_current_date" => get_current_date(ctx, now),
        "list_services" => list_services(ctx).await,
        "find_patient" => find_patient(ctx, parse_args(args)?).await,
        "create_patient" => create_patient(ctx, parse_args(args)?).await,
        "check_availability" => check_availability(ctx, parse_args(args)?, now).await,
        "book_appointment" => book_appointment(ctx, parse_args(args)?, now).await,
        other => Err(ToolError::UnknownTool(other.to_string())),
    }
}

fn parse_args<T: DeserializeOwned>(args: Value) -> Result<T, ToolError> {
    // a tool with only optional arguments may be called with nothing at all
    let args = if args.is_null() { json!({}) } else { args };
    serde_json::from_value(args).map_err(|e| ToolError::Arguments(e.to_string()))
}

fn non_empty(value: Option<String>) -> Option<String> {
    value
        .map(|v| v.trim().to_string())
        .filter(|v| !v.is_empty())
}

fn get_current_date(ctx: &ToolContext<'_>, now: OffsetDateTime) -> ToolOutcome {
    let local = to_utc(now).with_timezone(&practice_tz(ctx.practice));
    Ok(format!(
        "Today is {} ({}).",
        local.format("%A, %B %-d, %Y"),
        local.format("%Y-%m-%d")
    ))
}

async fn list_services(ctx: &ToolContext<'_>) -> ToolOutcome {
    let mappings = ctx.store.list_service_mappings(ctx.practice.id).await?;
    if mappings.is_empty() {
        return Ok("No services are set up for booking by phone. Please offer to take a message.".to_string());
    }
    let names: Vec<&str> = mappings.iter().map(|m| m.spoken_name.as_str()).collect();
    Ok(format!("Services we can book: {}.", names.join(", ")))
}

async fn service_mapping(ctx: &ToolContext<'_>, service: &str) -> Result<ServiceMapping, ToolError> {
    match ctx
        .store
        .find_service_mapping(ctx.practice.id, service)
        .await?
    {
        Some(mapping) => Ok(mapping),
        None => {
            let offered = ctx.store.list_service_mappings(ctx.practice.id).await?;
            let names: Vec<&str> = offered.iter().map(|m| m.spoken_name.as_str()).collect();
            Err(ToolError::Spoken(if names.is_empty() {
                format!("We can't book {service} by phone.")
            } else {
                format!("We can't book {service} by phone. Services we can book: {}.", names.join(", "))
            }))
        }
    }
}

fn default_provider(practice: &Practice) -> Result<i64, ToolError> {
    practice.default_provider_id().ok_or_else(|| {
        ToolError::Spoken("No provider is set up for booking at this practice. Please offer to take a message.".to_string())
    })
}

#[derive(Deserialize, Debug, Default)]
struct FindPatientArgs {
    #[serde(default)]
    phone: Option<String>,
    #[serde(default)]
    first_name: Option<String>,
    #[serde(default)]
    last_name: Option<String>,
    #[serde(default)]
    date_of_birth: Option<String>,
}

fn describe_patient(patient: &Patient) -> String {
    format!("{} (patient id {})", patient.display_name(), patient.id)
}

async fn find_patient(ctx: &ToolContext<'_>, args: FindPatientArgs) -> ToolOutcome {
    let phone = non_empty(args.phone).or_else(|| ctx.caller_phone.map(str::to_string));
    let name = [non_empty(args.first_name), non_empty(args.last_name)]
        .into_iter()
        .flatten()
        .collect::<Vec<_>>()
        .join(" ");
    let name = Some(name).filter(|n| !n.is_empty());
    if phone.is_none() && name.is_none() {
        return Err(ToolError::Arguments("a phone number or a name is needed".to_string()));
    }

    let practice = ctx.practice;
    let mut patients = ctx
        .records
        .search_patients(
            &practice.records_subdomain,
            practice.records_location_id,
            phone.as_deref(),
            name.as_deref(),
        )
        .await?;
    if let Some(dob) = non_empty(args.date_of_birth) {
        patients.retain(|p| {
            p.bio
                .as_ref()
                .and_then(|b| b.date_of_birth.as_deref())
                .map_or(false, |d| d == dob)
        });
    }

    Ok(match patients.as_slice() {
        [] => "No patient record matches those details. Offer to create a new patient.".to_string(),
        [patient] => format!("Found {}.", describe_patient(patient)),
        many => format!(
            "Found {} patients: {}. Ask the caller for their date of birth to pick the right one.",
            many.len(),
            many.iter().map(describe_patient).collect::<Vec<_>>().join("; ")
        ),
    })
}

#[derive(Deserialize, Debug)]
struct CreatePatientArgs {
    first_name: String,
    last_name: String,
    #[serde(default)]
    phone: Option<String>,
    #[serde(default)]
    email: Option<String>,
    #[serde(default)]
    date_of_birth: Option<String>,
}

async fn create_patient(ctx: &ToolContext<'_>, args: CreatePatientArgs) -> ToolOutcome {
    let first_name = args.first_name.trim().to_string();
    let last_name = args.last_name.trim().to_string();
    if first_name.is_empty() || last_name.is_empty() {
        return Err(ToolError::Arguments("first and last name are required".to_string()));
    }
    let phone = non_empty(args.phone).or_else(|| ctx.caller_phone.map(str::to_string));
    if phone.is_none() {
        return Err(ToolError::Arguments("a phone number is required".to_string()));
    }
    let date_of_birth = match non_empty(args.date_of_birth) {
        Some(dob) => Some(
            NaiveDate::parse_from_str(&dob, "%Y-%m-%d")
                .map_err(|_| ToolError::Arguments(format!("date of birth {dob} is not YYYY-MM-DD")))?
                .to_string(),
        ),
        None => None,
    };

    let practice = ctx.practice;
    let provider_id = default_provider(practice)?;
    let new_patient = NewPatient {
        first_name,
        last_name,
        email: non_empty(args.email),
        bio: PatientBio {
            phone_number: phone,
            date_of_birth,
        },
    };
    let created = ctx
        .records
        .create_patient(
            &practice.records_subdomain,
            practice.records_location_id,
            provider_id,
            &new_patient,
        )
        .await
        .map_err(|e| match e.kind() {
            ErrorKind::Duplicate => ToolError::Spoken(
                "A patient with those details already exists. Try looking them up instead."
                    .to_string(),
            ),
            _ => e.into(),
        })?;
    info!(practice = %practice.id, patient = created.id, "patient created");
    Ok(format!("Created {}.", describe_patient(&created)))
}

#[derive(Deserialize, Debug)]
struct AvailabilityArgs {
    service: String,
    #[serde(default)]
    date: Option<String>,
    #[serde(default)]
    days: Option<u32>,
}

async fn check_availability(
    ctx: &ToolContext<'_>,
    args: AvailabilityArgs,
    now: OffsetDateTime,
) -> ToolOutcome {
    let practice = ctx.practice;
    let tz = practice_tz(practice);
    let mapping = service_mapping(ctx, &args.service).await?;
    let start_date = match non_empty(args.date) {
        Some(date) => NaiveDate::parse_from_str(&date, "%Y-%m-%d")
            .map_err(|_| ToolError::Arguments(format!("date {date} is not YYYY-MM-DD")))?,
        None => to_utc(now).with_timezone(&tz).date_naive(),
    };
    let query = SlotQuery {
        start_date: start_date.format("%Y-%m-%d").to_string(),
        days: args.days.unwrap_or(1).clamp(1, MAX_SEARCH_DAYS),
        provider_ids: practice.provider_ids.clone(),
        operatory_ids: practice.default_operatory_id.into_iter().collect(),
        appointment_type_id: Some(mapping.appointment_type_id),
    };

    let found = ctx
        .records
        .available_slots(&practice.records_subdomain, practice.records_location_id, &query)
        .await?;
    let mut times: Vec<_> = found
        .iter()
        .flat_map(|p| p.slots.iter())
        .filter_map(|slot| parse_rfc3339(&slot.time))
        .collect();
    times.sort();
    times.dedup();

    if times.is_empty() {
        return Ok(format!(
            "There are no openings for {} in that range. Offer to check other days.",
            mapping.spoken_name
        ));
    }
    let offered = times
        .iter()
        .take(MAX_SPOKEN_SLOTS)
        .map(|t| format!("{} (start_time {})", spoken_time(*t, tz), t.to_rfc3339()))
        .collect::<Vec<_>>()
        .join("; ");
    Ok(format!("Open times for {}: {offered}.", mapping.spoken_name))
}

#[derive(Deserialize, Debug)]
struct BookArgs {
    patient_id: i64,
    service: String,
    start_time: String,
    #[serde(default)]
    note: Option<String>,
}

async fn book_appointment(ctx: &ToolContext<'_>, args: BookArgs, now: OffsetDateTime) -> ToolOutcome {
    let practice = ctx.practice;
    let mapping = service_mapping(ctx, &args.service).await?;
    let start = parse_rfc3339(&args.start_time).ok_or_else(|| {
        ToolError::Arguments(format!("start time {} is not a valid timestamp", args.start_time))
    })?;
    let provider_id = default_provider(practice)?;
    let note = non_empty(args.note);

    let request = NewAppointment {
        patient_id: args.patient_id,
        provider_id,
        operatory_id: practice.default_operatory_id,
        appointment_type_id: mapping.appointment_type_id,
        start_time: start.to_rfc3339(),
        note: note.clone(),
    };
    let booked = ctx
        .records
        .book_appointment(&practice.records_subdomain, practice.records_location_id, &request)
        .await
        .map_err(|e| match e.kind() {
            ErrorKind::Duplicate => ToolError::Spoken(
                "That time was just taken. Please offer the caller another open time.".to_string(),
            ),
            _ => e.into(),
        })?;
    info!(practice = %practice.id, appointment = booked.id, patient = args.patient_id, "appointment booked");

    let starts_at = booked.start_time.as_deref().and_then(parse_rfc3339).unwrap_or(start);
    if let Some(call_id) = ctx.call_id {
        let appointment = BookedAppointment {
            external_appointment_id: booked.id,
            patient_id: args.patient_id,
            provider_id,
            operatory_id: booked.operatory_id.or(practice.default_operatory_id),
            appointment_type_id: mapping.appointment_type_id,
            start: Some(to_offset(starts_at)),
            end: booked.end_time.as_deref().and_then(parse_rfc3339).map(to_offset),
            note,
        };
        // the booking stands upstream whatever happens to the call log
        match record_booking(ctx.store, practice, call_id, appointment, now).await {
            Ok(Reconciled::Updated(_)) => {}
            Ok(Reconciled::Skipped(reason)) => {
                warn!(%call_id, ?reason, appointment = booked.id, "booking not recorded on call")
            }
            Err(e) => log_error("failed to record booking on call", &e),
        }
    }

    Ok(format!(
        "Booked {} for {}. The confirmation number is {}.",
        mapping.spoken_name,
        spoken_time(starts_at, practice_tz(practice)),
        booked.id
    ))
}

fn function(name: &str, description: &str, parameters: Value) -> Value {
    json!({
        "type": "function",
        "function": {
            "name": name,
            "description": description,
            "parameters": parameters,
        }
    })
}

/// Tool definitions registered on every practice's assistant.
pub fn tool_definitions() -> Vec<Value> {
    vec![
        function(
            "get_current_date",
            "Get today's date at the practice.",
            json!({"type": "object", "properties": {}}),
        ),
        function(
            "list_services",
            "List the services that can be booked by phone.",
            json!({"type": "object", "properties": {}}),
        ),
        function(
            "find_patient",
            "Look up an existing patient by phone number and/or name.",
            json!({
                "type": "object",
                "properties": {
                    "phone": {"type": "string"},
                    "first_name": {"type": "string"},
                    "last_name": {"type": "string"},
                    "date_of_birth": {"type": "string", "description": "YYYY-MM-DD"}
                }
            }),
        ),
        function(
            "create_patient",
            "Register a new patient.",
            json!({
                "type": "object",
                "properties": {
                    "first_name": {"type": "string"},
                    "last_name": {"type": "string"},
                    "phone": {"type": "string"},
                    "email": {"type": "string"},
                    "date_of_birth": {"type": "string", "description": "YYYY-MM-DD"}
                },
                "required": ["first_name", "last_name"]
            }),
        ),
        function(
            "check_availability",
            "Find open appointment times for a service.",
            json!({
                "type": "object",
                "properties": {
                    "service": {"type": "string"},
                    "date": {"type": "string", "description": "First day to search, YYYY-MM-DD"},
                    "days": {"type": "integer", "minimum": 1, "maximum": MAX_SEARCH_DAYS}
                },
                "required": ["service"]
            }),
        ),
        function(
            "book_appointment",
            "Book an appointment at one of the open times.",
            json!({
                "type": "object",
                "properties": {
                    "patient_id": {"type": "integer"},
                    "service": {"type": "string"},
                    "start_time": {"type": "string", "description": "start_time exactly as returned by check_availability"},
                    "note": {"type": "string"}
                },
                "required": ["patient_id", "service", "start_time"]
            }),
        ),
    ]
}
