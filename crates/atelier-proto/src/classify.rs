//! Narrowing of raw envelopes into the closed [`StreamEvent`] set.
//!
//! Classification is shape-checking only: an envelope is narrowed when its
//! `type` matches a known event name and its properties carry the minimal
//! fields that event's handler requires. Anything else degrades to
//! [`StreamEvent::Unknown`]; never an error, never a panic.

use serde::Deserialize;
use serde_json::Value;

use crate::events::{
    EventEnvelope, FileChange, MessageInfo, MessagePart, PermissionRequest, QuestionRequest,
    SessionErrorInfo, SessionInfo, SessionStatus, StreamEvent,
};

/// Classify one decoded envelope. Pure; inspects only the fields needed to
/// decide and does not clone the payload wholesale.
pub fn classify(envelope: &EventEnvelope) -> StreamEvent {
    let props = &envelope.properties;
    match envelope.kind.as_str() {
        "message.part.updated" => match decode::<PartProps>(props) {
            Some(p) => StreamEvent::MessagePartUpdated { part: p.part },
            None => unknown(envelope),
        },
        "message.updated" => match decode::<InfoProps<MessageInfo>>(props) {
            Some(p) => StreamEvent::MessageUpdated { info: p.info },
            None => unknown(envelope),
        },
        "message.removed" => match decode::<MessageRemovedProps>(props) {
            Some(p) => StreamEvent::MessageRemoved {
                session_id: p.session_id,
                message_id: p.message_id,
            },
            None => unknown(envelope),
        },
        "session.status" => match decode::<StatusProps>(props) {
            Some(p) => StreamEvent::SessionStatusChanged {
                session_id: p.session_id,
                status: p.status,
            },
            None => unknown(envelope),
        },
        "session.diff" => match decode::<DiffProps>(props) {
            Some(p) => StreamEvent::SessionDiffUpdated {
                session_id: p.session_id,
                diff: p.diff,
            },
            None => unknown(envelope),
        },
        "session.idle" => match decode::<SessionScopedProps>(props) {
            Some(p) => StreamEvent::SessionIdle {
                session_id: p.session_id,
            },
            None => unknown(envelope),
        },
        "session.error" => match decode::<SessionScopedProps>(props) {
            Some(p) => StreamEvent::SessionErrored {
                session_id: p.session_id,
                error: extract_error(props),
            },
            None => unknown(envelope),
        },
        "session.updated" => match decode::<InfoProps<SessionInfo>>(props) {
            Some(p) => StreamEvent::SessionUpdated { info: p.info },
            None => unknown(envelope),
        },
        "server.heartbeat" => StreamEvent::ServerHeartbeat {
            retry_ms: props.get("retryMs").and_then(Value::as_u64),
        },
        "server.disposed" => StreamEvent::ServerDisposed,
        "file.watcher.updated" => match decode::<FileChange>(props) {
            Some(change) => StreamEvent::FileWatcherUpdated { change },
            None => unknown(envelope),
        },
        "vcs.branch.updated" => match decode::<BranchProps>(props) {
            Some(p) => StreamEvent::VcsBranchUpdated { branch: p.branch },
            None => unknown(envelope),
        },
        "permission.asked" => match decode::<PermissionProps>(props) {
            Some(p) => StreamEvent::PermissionAsked {
                request: p.permission,
            },
            None => unknown(envelope),
        },
        "permission.replied" => match decode::<PermissionRepliedProps>(props) {
            Some(p) => StreamEvent::PermissionReplied {
                session_id: p.session_id,
                permission_id: p.permission_id,
            },
            None => unknown(envelope),
        },
        "permission.sync" => match decode::<PermissionSyncProps>(props) {
            Some(p) => StreamEvent::PermissionSync {
                requests: p.permissions,
            },
            None => unknown(envelope),
        },
        "question.asked" => match decode::<QuestionProps>(props) {
            Some(p) => StreamEvent::QuestionAsked {
                request: p.question,
            },
            None => unknown(envelope),
        },
        "question.replied" => match decode::<QuestionRepliedProps>(props) {
            Some(p) => StreamEvent::QuestionReplied {
                session_id: p.session_id,
                question_id: p.question_id,
            },
            None => unknown(envelope),
        },
        "question.rejected" => match decode::<QuestionRepliedProps>(props) {
            Some(p) => StreamEvent::QuestionRejected {
                session_id: p.session_id,
                question_id: p.question_id,
            },
            None => unknown(envelope),
        },
        "question.sync" => match decode::<QuestionSyncProps>(props) {
            Some(p) => StreamEvent::QuestionSync {
                requests: p.questions,
            },
            None => unknown(envelope),
        },
        _ => unknown(envelope),
    }
}

fn decode<'de, T: Deserialize<'de>>(props: &'de Value) -> Option<T> {
    T::deserialize(props).ok()
}

fn unknown(envelope: &EventEnvelope) -> StreamEvent {
    StreamEvent::Unknown {
        raw_type: envelope.kind.clone(),
        session_id: probe_session_id(&envelope.properties).map(str::to_owned),
    }
}

/// Best-effort session id for envelopes the classifier does not understand,
/// probing the nesting patterns the server is known to use, in order.
fn probe_session_id(props: &Value) -> Option<&str> {
    const PATHS: [&[&str]; 3] = [
        &["sessionId"],
        &["info", "sessionId"],
        &["part", "sessionId"],
    ];
    PATHS.iter().find_map(|path| {
        path.iter()
            .try_fold(props, |value, key| value.get(key))
            .and_then(Value::as_str)
    })
}

/// An error payload counts as extractable when it carries a usable name or
/// message; otherwise the store keeps whatever error it already had.
fn extract_error(props: &Value) -> Option<SessionErrorInfo> {
    let raw = props.get("error")?;
    if let Some(text) = raw.as_str() {
        let text = text.trim();
        if text.is_empty() {
            return None;
        }
        return Some(SessionErrorInfo {
            name: "error".to_owned(),
            message: text.to_owned(),
        });
    }
    let info = decode::<SessionErrorInfo>(raw)?;
    if info.name.is_empty() && info.message.is_empty() {
        None
    } else {
        Some(info)
    }
}

#[derive(Deserialize)]
struct PartProps {
    part: MessagePart,
}

#[derive(Deserialize)]
struct InfoProps<T> {
    info: T,
}

#[derive(Deserialize)]
#[serde(rename_all = "camelCase")]
struct MessageRemovedProps {
    session_id: String,
    message_id: String,
}

#[derive(Deserialize)]
#[serde(rename_all = "camelCase")]
struct SessionScopedProps {
    session_id: String,
}

#[derive(Deserialize)]
#[serde(rename_all = "camelCase")]
struct StatusProps {
    session_id: String,
    #[serde(default)]
    status: SessionStatus,
}

#[derive(Deserialize)]
#[serde(rename_all = "camelCase")]
struct DiffProps {
    session_id: String,
    #[serde(default)]
    diff: Value,
}

#[derive(Deserialize)]
struct BranchProps {
    branch: String,
}

#[derive(Deserialize)]
struct PermissionProps {
    permission: PermissionRequest,
}

#[derive(Deserialize)]
#[serde(rename_all = "camelCase")]
struct PermissionRepliedProps {
    session_id: String,
    permission_id: String,
}

#[derive(Deserialize)]
struct PermissionSyncProps {
    permissions: Vec<PermissionRequest>,
}

#[derive(Deserialize)]
struct QuestionProps {
    question: QuestionRequest,
}

#[derive(Deserialize)]
#[serde(rename_all = "camelCase")]
struct QuestionRepliedProps {
    session_id: String,
    question_id: String,
}

#[derive(Deserialize)]
struct QuestionSyncProps {
    questions: Vec<QuestionRequest>,
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn envelope(kind: &str, properties: Value) -> EventEnvelope {
        EventEnvelope {
            kind: kind.to_owned(),
            properties,
        }
    }

    #[test]
    fn classifies_message_part_updated() {
        let event = classify(&envelope(
            "message.part.updated",
            json!({"part": {"id": "prt_1", "messageId": "msg_1", "sessionId": "ses_1", "type": "text", "text": "hi"}}),
        ));
        match event {
            StreamEvent::MessagePartUpdated { part } => {
                assert_eq!(part.id, "prt_1");
                assert_eq!(part.message_id.as_deref(), Some("msg_1"));
                assert_eq!(part.text.as_deref(), Some("hi"));
            }
            other => panic!("unexpected classification: {other:?}"),
        }
    }

    #[test]
    fn part_without_message_id_still_classifies() {
        let event = classify(&envelope(
            "message.part.updated",
            json!({"part": {"id": "prt_1", "type": "text"}}),
        ));
        match event {
            StreamEvent::MessagePartUpdated { part } => assert!(part.message_id.is_none()),
            other => panic!("unexpected classification: {other:?}"),
        }
    }

    #[test]
    fn malformed_known_type_degrades_to_unknown() {
        let event = classify(&envelope("message.updated", json!({"info": {"id": "msg_1"}})));
        match event {
            StreamEvent::Unknown { raw_type, .. } => assert_eq!(raw_type, "message.updated"),
            other => panic!("expected Unknown, got {other:?}"),
        }
    }

    #[test]
    fn unknown_type_probes_session_id_paths() {
        let direct = classify(&envelope("mystery.event", json!({"sessionId": "ses_a"})));
        let nested_info = classify(&envelope("mystery.event", json!({"info": {"sessionId": "ses_b"}})));
        let nested_part = classify(&envelope("mystery.event", json!({"part": {"sessionId": "ses_c"}})));
        let none = classify(&envelope("mystery.event", json!({"other": true})));

        for (event, expected) in [
            (direct, Some("ses_a")),
            (nested_info, Some("ses_b")),
            (nested_part, Some("ses_c")),
            (none, None),
        ] {
            match event {
                StreamEvent::Unknown { session_id, .. } => {
                    assert_eq!(session_id.as_deref(), expected);
                }
                other => panic!("expected Unknown, got {other:?}"),
            }
        }
    }

    #[test]
    fn probe_prefers_top_level_session_id() {
        let event = classify(&envelope(
            "mystery.event",
            json!({"sessionId": "ses_top", "info": {"sessionId": "ses_nested"}}),
        ));
        match event {
            StreamEvent::Unknown { session_id, .. } => {
                assert_eq!(session_id.as_deref(), Some("ses_top"));
            }
            other => panic!("expected Unknown, got {other:?}"),
        }
    }

    #[test]
    fn session_error_without_extractable_payload_keeps_error_none() {
        let event = classify(&envelope(
            "session.error",
            json!({"sessionId": "ses_1", "error": {}}),
        ));
        match event {
            StreamEvent::SessionErrored { session_id, error } => {
                assert_eq!(session_id, "ses_1");
                assert!(error.is_none());
            }
            other => panic!("unexpected classification: {other:?}"),
        }
    }

    #[test]
    fn session_error_accepts_string_payload() {
        let event = classify(&envelope(
            "session.error",
            json!({"sessionId": "ses_1", "error": "model quota exceeded"}),
        ));
        match event {
            StreamEvent::SessionErrored { error, .. } => {
                let error = error.unwrap();
                assert_eq!(error.message, "model quota exceeded");
            }
            other => panic!("unexpected classification: {other:?}"),
        }
    }

    #[test]
    fn heartbeat_carries_optional_retry_hint() {
        match classify(&envelope("server.heartbeat", json!({"retryMs": 2500}))) {
            StreamEvent::ServerHeartbeat { retry_ms } => assert_eq!(retry_ms, Some(2500)),
            other => panic!("unexpected classification: {other:?}"),
        }
        match classify(&envelope("server.heartbeat", Value::Null)) {
            StreamEvent::ServerHeartbeat { retry_ms } => assert!(retry_ms.is_none()),
            other => panic!("unexpected classification: {other:?}"),
        }
    }

    #[test]
    fn session_updated_decodes_revert_pointer() {
        let with_revert = classify(&envelope(
            "session.updated",
            json!({"info": {"id": "ses_1", "revert": {"messageId": "msg_5"}}}),
        ));
        match with_revert {
            StreamEvent::SessionUpdated { info } => {
                assert_eq!(info.revert.unwrap().message_id, "msg_5");
            }
            other => panic!("unexpected classification: {other:?}"),
        }

        let cleared = classify(&envelope("session.updated", json!({"info": {"id": "ses_1"}})));
        match cleared {
            StreamEvent::SessionUpdated { info } => assert!(info.revert.is_none()),
            other => panic!("unexpected classification: {other:?}"),
        }
    }

    #[test]
    fn sync_events_decode_request_lists() {
        let event = classify(&envelope(
            "permission.sync",
            json!({"permissions": [
                {"id": "perm_1", "sessionId": "ses_1", "title": "Run tests"},
                {"id": "perm_2", "sessionId": "ses_2"}
            ]}),
        ));
        match event {
            StreamEvent::PermissionSync { requests } => {
                assert_eq!(requests.len(), 2);
                assert_eq!(requests[0].title.as_deref(), Some("Run tests"));
            }
            other => panic!("unexpected classification: {other:?}"),
        }
    }

    #[test]
    fn envelope_decodes_from_wire_line() {
        let line = r#"{"type":"session.idle","properties":{"sessionId":"ses_9"}}"#;
        let envelope: EventEnvelope = serde_json::from_str(line).unwrap();
        match classify(&envelope) {
            StreamEvent::SessionIdle { session_id } => assert_eq!(session_id, "ses_9"),
            other => panic!("unexpected classification: {other:?}"),
        }
    }
}
