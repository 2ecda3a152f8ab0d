mod webhook {
    use serde::{Deserialize, Serialize};
    use time::OffsetDateTime;

    /// Envelope of every Voice Assistant Platform webhook delivery.
    #[derive(Deserialize, Debug)]
    pub struct VoiceWebhook {
        pub message: VoiceMessage,
    }

    /// The server messages we subscribe to. Any other `type` fails to decode and is rejected.
    #[derive(Deserialize, Debug)]
    #[serde(rename_all = "kebab-case", tag = "type")]
    pub enum VoiceMessage {
        ToolCalls {
            call: CallMeta,
            #[serde(default)]
            assistant: Option<AssistantRef>,
            #[serde(rename = "toolCallList")]
            tool_call_list: Vec<ToolCall>,
        },
        StatusUpdate {
            call: CallMeta,
            #[serde(default)]
            assistant: Option<AssistantRef>,
            status: String,
            #[serde(rename = "endedReason", default)]
            ended_reason: Option<String>,
        },
        Transcript {
            call: CallMeta,
            #[serde(default)]
            assistant: Option<AssistantRef>,
            #[serde(default = "default_role")]
            role: String,
            #[serde(rename = "transcriptType")]
            transcript_type: TranscriptType,
            transcript: String,
        },
        EndOfCallReport {
            call: CallMeta,
            #[serde(default)]
            assistant: Option<AssistantRef>,
            #[serde(rename = "endedReason", default)]
            ended_reason: Option<String>,
            #[serde(default)]
            transcript: Option<String>,
            #[serde(default)]
            summary: Option<String>,
            #[serde(rename = "recordingUrl", default)]
            recording_url: Option<String>,
            #[serde(default)]
            artifact: Option<Artifact>,
            #[serde(default)]
            analysis: Option<Analysis>,
        },
    }

    fn default_role() -> String {
        "user".to_string()
    }

    impl VoiceMessage {
        pub fn call(&self) -> &CallMeta {
            match self {
                VoiceMessage::ToolCalls { call, .. }
                | VoiceMessage::StatusUpdate { call, .. }
                | VoiceMessage::Transcript { call, .. }
                | VoiceMessage::EndOfCallReport { call, .. } => call,
            }
        }

        pub fn kind(&self) -> &'static str {
            match self {
                VoiceMessage::ToolCalls { .. } => "tool-calls",
                VoiceMessage::StatusUpdate { .. } => "status-update",
                VoiceMessage::Transcript { .. } => "transcript",
                VoiceMessage::EndOfCallReport { .. } => "end-of-call-report",
            }
        }

        /// The assistant the call ran on; the call's own field wins over the message-level one.
        pub fn assistant_id(&self) -> Option<&str> {
            let assistant = match self {
                VoiceMessage::ToolCalls { assistant, .. }
                | VoiceMessage::StatusUpdate { assistant, .. }
                | VoiceMessage::Transcript { assistant, .. }
                | VoiceMessage::EndOfCallReport { assistant, .. } => assistant,
            };
            self.call()
                .assistant_id
                .as_deref()
                .or_else(|| assistant.as_ref().and_then(|a| a.id.as_deref()))
        }
    }

    #[derive(Deserialize, Debug, Clone, Copy, PartialEq, Eq)]
    #[serde(rename_all = "lowercase")]
    pub enum TranscriptType {
        Partial,
        Final,
    }

    #[derive(Deserialize, Debug, Clone)]
    pub struct CallMeta {
        pub id: String,
        #[serde(rename = "assistantId", default)]
        pub assistant_id: Option<String>,
        #[serde(rename = "startedAt", default, with = "time::serde::rfc3339::option")]
        pub started_at: Option<OffsetDateTime>,
        #[serde(rename = "endedAt", default, with = "time::serde::rfc3339::option")]
        pub ended_at: Option<OffsetDateTime>,
        #[serde(rename = "customerPhoneNumber", default)]
        pub customer_phone_number: Option<String>,
        #[serde(default)]
        pub customer: Option<Customer>,
    }

    impl CallMeta {
        pub fn caller_phone(&self) -> Option<&str> {
            self.customer_phone_number
                .as_deref()
                .or_else(|| self.customer.as_ref().and_then(|c| c.number.as_deref()))
                .filter(|n| !n.is_empty())
        }
    }

    #[derive(Deserialize, Serialize, Debug, Clone, Default)]
    pub struct Customer {
        #[serde(default)]
        pub number: Option<String>,
    }

    #[derive(Deserialize, Debug, Clone)]
    pub struct AssistantRef {
        #[serde(default)]
        pub id: Option<String>,
    }

    #[derive(Deserialize, Debug, Clone)]
    pub struct ToolCall {
        pub id: String,
        pub function: ToolFunction,
    }

    #[derive(Deserialize, Debug, Clone)]
    pub struct ToolFunction {
        pub name: String,
        /// Either a JSON object or a string containing one, depending on the model provider.
        #[serde(default)]
        pub arguments: serde_json::Value,
    }

    impl ToolFunction {
        pub fn arguments(&self) -> serde_json::Value {
            match &self.arguments {
                serde_json::Value::String(raw) => {
                    serde_json::from_str(raw).unwrap_or(serde_json::Value::Null)
                }
                other => other.clone(),
            }
        }
    }

    #[derive(Deserialize, Debug, Clone, Default)]
    pub struct Artifact {
        #[serde(default)]
        pub transcript: Option<String>,
        #[serde(rename = "recordingUrl", default)]
        pub recording_url: Option<String>,
    }

    #[derive(Deserialize, Debug, Clone, Default)]
    pub struct Analysis {
        #[serde(default)]
        pub summary: Option<String>,
    }

    /// Synchronous reply to a `tool-calls` message.
    #[derive(Serialize, Debug)]
    pub struct ToolCallResponse {
        pub results: Vec<ToolResult>,
    }

    #[derive(Serialize, Debug, PartialEq)]
    pub struct ToolResult {
        #[serde(rename = "toolCallId")]
        pub tool_call_id: String,
        pub result: String,
    }
}
pub use webhook::*;

mod api {
    use super::webhook::{Analysis, Artifact, Customer};
    use serde::{Deserialize, Serialize};
    use time::OffsetDateTime;

    /// A call as returned by the platform's REST API.
    #[derive(Deserialize, Debug, Clone)]
    pub struct VoiceCallRecord {
        pub id: String,
        #[serde(rename = "assistantId", default)]
        pub assistant_id: Option<String>,
        #[serde(default)]
        pub status: Option<String>,
        #[serde(rename = "startedAt", default, with = "time::serde::rfc3339::option")]
        pub started_at: Option<OffsetDateTime>,
        #[serde(rename = "endedAt", default, with = "time::serde::rfc3339::option")]
        pub ended_at: Option<OffsetDateTime>,
        #[serde(rename = "endedReason", default)]
        pub ended_reason: Option<String>,
        #[serde(default)]
        pub customer: Option<Customer>,
        #[serde(default)]
        pub transcript: Option<String>,
        #[serde(default)]
        pub summary: Option<String>,
        #[serde(rename = "recordingUrl", default)]
        pub recording_url: Option<String>,
        #[serde(default)]
        pub artifact: Option<Artifact>,
        #[serde(default)]
        pub analysis: Option<Analysis>,
    }

    impl VoiceCallRecord {
        pub fn caller_phone(&self) -> Option<&str> {
            self.customer
                .as_ref()
                .and_then(|c| c.number.as_deref())
                .filter(|n| !n.is_empty())
        }

        pub fn transcript(&self) -> Option<&str> {
            self.artifact
                .as_ref()
                .and_then(|a| a.transcript.as_deref())
                .or(self.transcript.as_deref())
        }

        pub fn summary(&self) -> Option<&str> {
            self.analysis
                .as_ref()
                .and_then(|a| a.summary.as_deref())
                .or(self.summary.as_deref())
        }

        pub fn recording_url(&self) -> Option<&str> {
            self.artifact
                .as_ref()
                .and_then(|a| a.recording_url.as_deref())
                .or(self.recording_url.as_deref())
        }
    }

    #[derive(Serialize, Deserialize, Debug, Clone)]
    pub struct AssistantServer {
        pub url: String,
        #[serde(skip_serializing_if = "Option::is_none")]
        pub secret: Option<String>,
    }

    #[derive(Serialize, Deserialize, Debug, Clone)]
    pub struct AssistantMessage {
        pub role: String,
        pub content: String,
    }

    #[derive(Serialize, Deserialize, Debug, Clone)]
    pub struct AssistantModel {
        pub provider: String,
        pub model: String,
        pub messages: Vec<AssistantMessage>,
        pub tools: Vec<serde_json::Value>,
    }

    /// Body of assistant create/update requests.
    #[derive(Serialize, Debug, Clone)]
    pub struct AssistantConfig {
        pub name: String,
        #[serde(rename = "firstMessage")]
        pub first_message: String,
        pub model: AssistantModel,
        pub server: AssistantServer,
        #[serde(rename = "serverMessages")]
        pub server_messages: Vec<String>,
    }

    #[derive(Deserialize, Debug, Clone)]
    pub struct Assistant {
        pub id: String,
        #[serde(default)]
        pub name: Option<String>,
    }
}
pub use api::*;

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn decodes_tool_calls_with_string_arguments() {
        let raw = json!({
            "message": {
                "type": "tool-calls",
                "call": {"id": "call_1", "assistantId": "asst_1", "customer": {"number": "+15551234567"}},
                "toolCallList": [{
                    "id": "tc_1",
                    "type": "function",
                    "function": {"name": "list_services", "arguments": "{\"a\":1}"}
                }]
            }
        });
        let webhook: VoiceWebhook = serde_json::from_value(raw).unwrap();
        assert_eq!(webhook.message.assistant_id(), Some("asst_1"));
        assert_eq!(webhook.message.call().caller_phone(), Some("+15551234567"));
        let VoiceMessage::ToolCalls { tool_call_list, .. } = webhook.message else {
            panic!("expected tool calls");
        };
        assert_eq!(tool_call_list[0].function.arguments(), json!({"a": 1}));
    }

    #[test]
    fn assistant_falls_back_to_message_level_ref() {
        let raw = json!({
            "message": {
                "type": "status-update",
                "status": "in-progress",
                "call": {"id": "call_1", "startedAt": "2024-03-01T15:00:00Z"},
                "assistant": {"id": "asst_2"}
            }
        });
        let webhook: VoiceWebhook = serde_json::from_value(raw).unwrap();
        assert_eq!(webhook.message.assistant_id(), Some("asst_2"));
        assert!(webhook.message.call().started_at.is_some());
    }

    #[test]
    fn rejects_unknown_message_types() {
        let raw = json!({"message": {"type": "speech-update", "call": {"id": "c"}}});
        assert!(serde_json::from_value::<VoiceWebhook>(raw).is_err());
    }

    #[test]
    fn rejects_known_type_with_missing_fields() {
        let raw = json!({"message": {"type": "transcript", "call": {"id": "c"}}});
        assert!(serde_json::from_value::<VoiceWebhook>(raw).is_err());
    }

    #[test]
    fn call_record_prefers_artifact_fields() {
        let raw = json!({
            "id": "call_9",
            "transcript": "old",
            "artifact": {"transcript": "new", "recordingUrl": "https://rec"},
            "analysis": {"summary": "booked a cleaning"}
        });
        let record: VoiceCallRecord = serde_json::from_value(raw).unwrap();
        assert_eq!(record.transcript(), Some("new"));
        assert_eq!(record.recording_url(), Some("https://rec"));
        assert_eq!(record.summary(), Some("booked a cleaning"));
    }
}
