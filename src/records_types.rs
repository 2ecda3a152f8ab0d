mod webhook {
    use serde::Deserialize;

    /// Practice Records System webhook deliveries, keyed on `event`. Unknown events fail to decode.
    #[derive(Deserialize, Debug)]
    #[serde(tag = "event")]
    pub enum RecordsWebhook {
        #[serde(rename = "appointment_insertion")]
        AppointmentInsertion {
            resource_type: String,
            subdomain: String,
            status: DeliveryStatus,
            data: AppointmentRef,
            #[serde(default)]
            message: Option<String>,
        },
    }

    impl RecordsWebhook {
        pub fn subdomain(&self) -> &str {
            match self {
                RecordsWebhook::AppointmentInsertion { subdomain, .. } => subdomain,
            }
        }
    }

    #[derive(Deserialize, Debug, Clone, Copy, PartialEq, Eq)]
    #[serde(rename_all = "lowercase")]
    pub enum DeliveryStatus {
        Success,
        Failure,
    }

    #[derive(Deserialize, Debug, Clone)]
    pub struct AppointmentRef {
        pub id: i64,
        /// Identifier in the practice's EHR; number or string depending on the EHR.
        #[serde(default)]
        pub foreign_id: Option<serde_json::Value>,
        #[serde(default)]
        pub patient_id: Option<i64>,
    }

    impl AppointmentRef {
        pub fn foreign_id(&self) -> Option<String> {
            match self.foreign_id.as_ref()? {
                serde_json::Value::String(s) if !s.is_empty() => Some(s.clone()),
                serde_json::Value::Number(n) => Some(n.to_string()),
                _ => None,
            }
        }
    }
}
pub use webhook::*;

mod api {
    use serde::{Deserialize, Serialize};

    /// Every 2xx body is wrapped like this; `code == false` marks a business-level failure.
    #[derive(Deserialize, Debug)]
    pub struct Envelope<T> {
        pub code: bool,
        #[serde(default)]
        pub description: Option<serde_json::Value>,
        #[serde(default)]
        pub error: Option<serde_json::Value>,
        #[serde(default = "Option::default")]
        pub data: Option<T>,
    }

    #[derive(Deserialize, Debug)]
    pub struct AuthToken {
        pub token: String,
    }

    #[derive(Serialize, Deserialize, Debug, Clone, PartialEq)]
    pub struct AppointmentType {
        pub id: i64,
        pub name: String,
        #[serde(default)]
        pub minutes: Option<i32>,
    }

    #[derive(Serialize, Deserialize, Debug, Clone, PartialEq)]
    pub struct Provider {
        pub id: i64,
        #[serde(default)]
        pub name: Option<String>,
        #[serde(default)]
        pub first_name: Option<String>,
        #[serde(default)]
        pub last_name: Option<String>,
    }

    #[derive(Serialize, Deserialize, Debug, Clone, PartialEq)]
    pub struct Operatory {
        pub id: i64,
        pub name: String,
        #[serde(default)]
        pub active: Option<bool>,
    }

    #[derive(Serialize, Deserialize, Debug, Clone, PartialEq)]
    pub struct Slot {
        /// RFC 3339 with the location's UTC offset.
        pub time: String,
        #[serde(default)]
        pub end_time: Option<String>,
        #[serde(default)]
        pub operatory_id: Option<i64>,
    }

    #[derive(Serialize, Deserialize, Debug, Clone, PartialEq)]
    pub struct ProviderSlots {
        #[serde(default)]
        pub lid: Option<i64>,
        pub pid: i64,
        #[serde(default)]
        pub slots: Vec<Slot>,
    }

    /// Query for open slots.
    #[derive(Debug, Clone)]
    pub struct SlotQuery {
        /// `YYYY-MM-DD` in the location's timezone.
        pub start_date: String,
        pub days: u32,
        pub provider_ids: Vec<i64>,
        pub operatory_ids: Vec<i64>,
        pub appointment_type_id: Option<i64>,
    }

    #[derive(Serialize, Deserialize, Debug, Clone, Default, PartialEq)]
    pub struct PatientBio {
        #[serde(default, skip_serializing_if = "Option::is_none")]
        pub phone_number: Option<String>,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        pub date_of_birth: Option<String>,
    }

    #[derive(Serialize, Deserialize, Debug, Clone, PartialEq)]
    pub struct Patient {
        pub id: i64,
        #[serde(default)]
        pub first_name: Option<String>,
        #[serde(default)]
        pub last_name: Option<String>,
        #[serde(default)]
        pub email: Option<String>,
        #[serde(default)]
        pub bio: Option<PatientBio>,
    }

    impl Patient {
        pub fn display_name(&self) -> String {
            [self.first_name.as_deref(), self.last_name.as_deref()]
                .into_iter()
                .flatten()
                .collect::<Vec<_>>()
                .join(" ")
        }
    }

    #[derive(Deserialize, Debug)]
    pub struct PatientList {
        #[serde(default)]
        pub patients: Vec<Patient>,
    }

    #[derive(Deserialize, Debug)]
    pub struct CreatedPatient {
        pub user: Patient,
    }

    #[derive(Serialize, Debug, Clone, Default)]
    pub struct NewPatient {
        pub first_name: String,
        pub last_name: String,
        #[serde(skip_serializing_if = "Option::is_none")]
        pub email: Option<String>,
        pub bio: PatientBio,
    }

    #[derive(Serialize, Debug)]
    pub struct CreatePatientRequest<'a> {
        pub provider: ProviderRef,
        pub patient: &'a NewPatient,
    }

    #[derive(Serialize, Debug)]
    pub struct ProviderRef {
        pub provider_id: i64,
    }

    #[derive(Serialize, Debug, Clone)]
    pub struct NewAppointment {
        pub patient_id: i64,
        pub provider_id: i64,
        #[serde(skip_serializing_if = "Option::is_none")]
        pub operatory_id: Option<i64>,
        pub appointment_type_id: i64,
        pub start_time: String,
        #[serde(skip_serializing_if = "Option::is_none")]
        pub note: Option<String>,
    }

    #[derive(Serialize, Debug)]
    pub struct BookAppointmentRequest<'a> {
        pub appt: &'a NewAppointment,
    }

    #[derive(Deserialize, Debug, Clone)]
    pub struct Appointment {
        pub id: i64,
        #[serde(default)]
        pub start_time: Option<String>,
        #[serde(default)]
        pub end_time: Option<String>,
        #[serde(default)]
        pub operatory_id: Option<i64>,
    }

    #[derive(Deserialize, Debug)]
    pub struct BookedAppt {
        pub appt: Appointment,
    }

    #[derive(Serialize, Deserialize, Debug, Clone)]
    pub struct WebhookEndpoint {
        pub id: i64,
        pub target_url: String,
        #[serde(default)]
        pub active: Option<bool>,
    }

    #[derive(Serialize, Deserialize, Debug, Clone)]
    pub struct WebhookSubscription {
        pub id: i64,
        pub resource_type: String,
        pub event: String,
        #[serde(default)]
        pub subdomain: Option<String>,
    }
}
pub use api::*;

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn decodes_appointment_insertion() {
        let raw = json!({
            "resource_type": "Appointment",
            "event": "appointment_insertion",
            "subdomain": "smiledental",
            "status": "failure",
            "data": {"id": 991, "foreign_id": 77},
            "message": "Operatory is closed"
        });
        let event: RecordsWebhook = serde_json::from_value(raw).unwrap();
        assert_eq!(event.subdomain(), "smiledental");
        let RecordsWebhook::AppointmentInsertion { status, data, .. } = event;
        assert_eq!(status, DeliveryStatus::Failure);
        assert_eq!(data.foreign_id(), Some("77".to_string()));
    }

    #[test]
    fn rejects_unknown_events_and_statuses() {
        let unknown_event = json!({
            "resource_type": "Patient", "event": "patient_created",
            "subdomain": "x", "status": "success", "data": {"id": 1}
        });
        assert!(serde_json::from_value::<RecordsWebhook>(unknown_event).is_err());
        let unknown_status = json!({
            "resource_type": "Appointment", "event": "appointment_insertion",
            "subdomain": "x", "status": "pending", "data": {"id": 1}
        });
        assert!(serde_json::from_value::<RecordsWebhook>(unknown_status).is_err());
    }

    #[test]
    fn envelope_tolerates_missing_data() {
        let env: Envelope<PatientList> =
            serde_json::from_value(json!({"code": false, "error": ["Patient invalid"]})).unwrap();
        assert!(!env.code);
        assert!(env.data.is_none());
    }
}
