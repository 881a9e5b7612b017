//! Typed payloads for the agent-server event stream.

use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};

/// Raw wire envelope, decoded from one stream line before classification.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct EventEnvelope {
    #[serde(rename = "type")]
    pub kind: String,
    #[serde(default)]
    pub properties: Value,
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum MessageRole {
    #[default]
    User,
    Assistant,
}

/// Creation/completion stamps in epoch milliseconds, as the server emits them.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct MessageTime {
    #[serde(default)]
    pub created: i64,
    #[serde(default)]
    pub completed: Option<i64>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct MessageInfo {
    pub id: String,
    pub session_id: String,
    #[serde(default)]
    pub role: MessageRole,
    #[serde(default)]
    pub time: MessageTime,
}

/// One fragment of a streamed message. The server always sends the latest
/// complete snapshot of a part, never a delta; payload fields this crate does
/// not model ride along in `extra` so a wholesale replace loses nothing.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct MessagePart {
    pub id: String,
    #[serde(default)]
    pub message_id: Option<String>,
    #[serde(default)]
    pub session_id: Option<String>,
    #[serde(rename = "type", default)]
    pub kind: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub text: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub tool: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub state: Option<Value>,
    #[serde(flatten)]
    pub extra: Map<String, Value>,
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum SessionStatus {
    Idle,
    Running,
    Busy,
    Error,
    #[default]
    Unknown,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SessionErrorInfo {
    #[serde(default)]
    pub name: String,
    #[serde(default)]
    pub message: String,
}

/// Revert pointer: messages whose id sorts at or past `message_id` are hidden
/// from the effective view without being deleted.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct RevertInfo {
    pub message_id: String,
}

/// Session record carried by `session.updated`, the sole authority for the
/// revert pointer.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SessionInfo {
    pub id: String,
    #[serde(default)]
    pub title: Option<String>,
    #[serde(default)]
    pub revert: Option<RevertInfo>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct PermissionRequest {
    pub id: String,
    pub session_id: String,
    #[serde(default)]
    pub title: Option<String>,
    #[serde(flatten)]
    pub extra: Map<String, Value>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct QuestionRequest {
    pub id: String,
    pub session_id: String,
    #[serde(default)]
    pub text: Option<String>,
    #[serde(default)]
    pub options: Vec<String>,
    #[serde(flatten)]
    pub extra: Map<String, Value>,
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum FileEventKind {
    Created,
    Modified,
    Deleted,
    #[default]
    Unknown,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct FileChange {
    pub file: String,
    #[serde(default)]
    pub event: FileEventKind,
    #[serde(default)]
    pub session_id: Option<String>,
}

/// The closed set of classified stream events, with an explicit `Unknown`
/// variant for envelopes the classifier does not understand. Downstream code
/// matches exhaustively over this set.
#[derive(Debug, Clone)]
pub enum StreamEvent {
    MessagePartUpdated {
        part: MessagePart,
    },
    MessageUpdated {
        info: MessageInfo,
    },
    MessageRemoved {
        session_id: String,
        message_id: String,
    },
    SessionStatusChanged {
        session_id: String,
        status: SessionStatus,
    },
    SessionDiffUpdated {
        session_id: String,
        diff: Value,
    },
    SessionIdle {
        session_id: String,
    },
    SessionErrored {
        session_id: String,
        error: Option<SessionErrorInfo>,
    },
    SessionUpdated {
        info: SessionInfo,
    },
    ServerHeartbeat {
        retry_ms: Option<u64>,
    },
    /// The server discarded its side of the session state; the client must
    /// resync even though the connection itself is still up.
    ServerDisposed,
    FileWatcherUpdated {
        change: FileChange,
    },
    VcsBranchUpdated {
        branch: String,
    },
    PermissionAsked {
        request: PermissionRequest,
    },
    PermissionReplied {
        session_id: String,
        permission_id: String,
    },
    PermissionSync {
        requests: Vec<PermissionRequest>,
    },
    QuestionAsked {
        request: QuestionRequest,
    },
    QuestionReplied {
        session_id: String,
        question_id: String,
    },
    QuestionRejected {
        session_id: String,
        question_id: String,
    },
    QuestionSync {
        requests: Vec<QuestionRequest>,
    },
    Unknown {
        raw_type: String,
        session_id: Option<String>,
    },
}

impl StreamEvent {
    /// Wire name of the event; for `Unknown` the raw type as received.
    pub fn name(&self) -> &str {
        match self {
            Self::MessagePartUpdated { .. } => "message.part.updated",
            Self::MessageUpdated { .. } => "message.updated",
            Self::MessageRemoved { .. } => "message.removed",
            Self::SessionStatusChanged { .. } => "session.status",
            Self::SessionDiffUpdated { .. } => "session.diff",
            Self::SessionIdle { .. } => "session.idle",
            Self::SessionErrored { .. } => "session.error",
            Self::SessionUpdated { .. } => "session.updated",
            Self::ServerHeartbeat { .. } => "server.heartbeat",
            Self::ServerDisposed => "server.disposed",
            Self::FileWatcherUpdated { .. } => "file.watcher.updated",
            Self::VcsBranchUpdated { .. } => "vcs.branch.updated",
            Self::PermissionAsked { .. } => "permission.asked",
            Self::PermissionReplied { .. } => "permission.replied",
            Self::PermissionSync { .. } => "permission.sync",
            Self::QuestionAsked { .. } => "question.asked",
            Self::QuestionReplied { .. } => "question.replied",
            Self::QuestionRejected { .. } => "question.rejected",
            Self::QuestionSync { .. } => "question.sync",
            Self::Unknown { raw_type, .. } => raw_type,
        }
    }

    /// Session the event is scoped to, when it is scoped to one at all.
    /// Sync snapshots and server-wide signals return `None`.
    pub fn session_id(&self) -> Option<&str> {
        match self {
            Self::MessagePartUpdated { part } => part.session_id.as_deref(),
            Self::MessageUpdated { info } => Some(&info.session_id),
            Self::SessionUpdated { info } => Some(&info.id),
            Self::MessageRemoved { session_id, .. }
            | Self::SessionStatusChanged { session_id, .. }
            | Self::SessionDiffUpdated { session_id, .. }
            | Self::SessionIdle { session_id }
            | Self::SessionErrored { session_id, .. }
            | Self::PermissionReplied { session_id, .. }
            | Self::QuestionReplied { session_id, .. }
            | Self::QuestionRejected { session_id, .. } => Some(session_id),
            Self::PermissionAsked { request } => Some(&request.session_id),
            Self::QuestionAsked { request } => Some(&request.session_id),
            Self::FileWatcherUpdated { change } => change.session_id.as_deref(),
            Self::Unknown { session_id, .. } => session_id.as_deref(),
            Self::ServerHeartbeat { .. }
            | Self::ServerDisposed
            | Self::VcsBranchUpdated { .. }
            | Self::PermissionSync { .. }
            | Self::QuestionSync { .. } => None,
        }
    }
}
