//! Wire protocol for the session WebSocket.
//!
//! Both directions carry JSON objects with a `type` tag. The command and
//! event vocabularies are closed enums; an unknown `type` is a parse error
//! surfaced to the client rather than silently ignored.

use serde::de::Error as DeError;
use serde::{Deserialize, Deserializer, Serialize};

/// Conversation role.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Role {
    User,
    Assistant,
}

/// A single turn as carried inside a `chat_message` command.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct HistoryTurn {
    pub role: Role,
    pub text: String,
}

/// Client-to-server commands.
#[derive(Debug, Clone, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum ClientCommand {
    /// Run the full analysis pipeline on the session's uploaded image.
    ProcessImage,

    /// Ask a follow-up question about the current analysis.
    ChatMessage {
        text: String,
        #[serde(default)]
        history: Vec<HistoryTurn>,
        /// Optional session override; must resolve to the same uploaded image.
        #[serde(default)]
        session_id: Option<String>,
    },
}

/// Server-to-client events. Transient, never persisted or replayed.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum ServerEvent {
    Status { message: String },
    ReasoningChunk { text: String },
    Coordinates { text: String },
    CoordinatesChunk { text: String },
    ChatResponseChunk { text: String },
    ChatResponseCoordinates { text: String },
    Error { message: String },
    Complete { message: String },
}

/// Envelope wrapping every outbound event with its session identifier.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Envelope {
    pub session_id: String,
    #[serde(flatten)]
    pub event: ServerEvent,
}

/// One candidate location produced by coordinate extraction.
///
/// `facts` is three strings by contract, but the producing collaborator does
/// not enforce that and sometimes emits a single string; both shapes are
/// accepted.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CandidateLocation {
    pub latitude: f64,
    pub longitude: f64,
    pub name: String,
    pub accuracy: f64,
    #[serde(deserialize_with = "facts_string_or_list")]
    pub facts: Vec<String>,
}

fn facts_string_or_list<'de, D>(deserializer: D) -> Result<Vec<String>, D::Error>
where
    D: Deserializer<'de>,
{
    #[derive(Deserialize)]
    #[serde(untagged)]
    enum Facts {
        One(String),
        Many(Vec<String>),
    }

    match Facts::deserialize(deserializer)? {
        Facts::One(s) => Ok(vec![s]),
        Facts::Many(v) => {
            if v.is_empty() {
                return Err(D::Error::custom("facts list is empty"));
            }
            Ok(v)
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn process_image_command_parses() {
        let cmd: ClientCommand =
            serde_json::from_str(r#"{"type": "process_image"}"#).expect("parse command");
        assert!(matches!(cmd, ClientCommand::ProcessImage));
    }

    #[test]
    fn chat_message_command_parses() {
        let cmd: ClientCommand = serde_json::from_str(
            r#"{"type": "chat_message", "text": "where is this?",
                "history": [{"role": "user", "text": "hi"}, {"role": "assistant", "text": "hello"}]}"#,
        )
        .expect("parse command");
        match cmd {
            ClientCommand::ChatMessage {
                text,
                history,
                session_id,
            } => {
                assert_eq!(text, "where is this?");
                assert_eq!(history.len(), 2);
                assert_eq!(history[0].role, Role::User);
                assert!(session_id.is_none());
            }
            other => panic!("unexpected command: {other:?}"),
        }
    }

    #[test]
    fn unknown_command_type_is_rejected() {
        let result = serde_json::from_str::<ClientCommand>(r#"{"type": "restart_server"}"#);
        assert!(result.is_err());
    }

    #[test]
    fn events_serialize_with_snake_case_tags() {
        let event = ServerEvent::ReasoningChunk {
            text: "the signage".into(),
        };
        let json = serde_json::to_value(&event).expect("serialize event");
        assert_eq!(json["type"], "reasoning_chunk");
        assert_eq!(json["text"], "the signage");

        let event = ServerEvent::ChatResponseCoordinates {
            text: "Recalculating coordinates".into(),
        };
        let json = serde_json::to_value(&event).expect("serialize event");
        assert_eq!(json["type"], "chat_response_coordinates");
    }

    #[test]
    fn envelope_flattens_event_fields() {
        let envelope = Envelope {
            session_id: "s1".into(),
            event: ServerEvent::Complete {
                message: "done".into(),
            },
        };
        let json = serde_json::to_value(&envelope).expect("serialize envelope");
        assert_eq!(json["session_id"], "s1");
        assert_eq!(json["type"], "complete");
        assert_eq!(json["message"], "done");
    }

    #[test]
    fn candidate_accepts_facts_as_string_or_list() {
        let one: CandidateLocation = serde_json::from_str(
            r#"{"latitude": 1.0, "longitude": 2.0, "name": "X", "accuracy": 50.0, "facts": "a"}"#,
        )
        .expect("parse single-fact candidate");
        assert_eq!(one.facts, vec!["a".to_string()]);

        let many: CandidateLocation = serde_json::from_str(
            r#"{"latitude": 1.0, "longitude": 2.0, "name": "X", "accuracy": 50.0,
                "facts": ["a", "b", "c"]}"#,
        )
        .expect("parse multi-fact candidate");
        assert_eq!(many.facts.len(), 3);
    }
}
