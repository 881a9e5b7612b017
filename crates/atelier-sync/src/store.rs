//! Reconciliation store: the in-memory mirror of all session-scoped state.
//!
//! Every classified event funnels through [`SyncStore::apply_event`]; update
//! rules are deterministic and idempotent so duplicated or reordered delivery
//! cannot corrupt the mirror. The store is the only shared mutable resource
//! in the crate and is mutated from exactly one call site at a time (the
//! consumption loop); UI reads take snapshots through the accessors.

use std::collections::{HashMap, VecDeque};

use chrono::{DateTime, Utc};
use serde_json::Value;

use atelier_proto::{
    FileChange, FileEventKind, MessageInfo, MessagePart, MessageRole, PermissionRequest,
    QuestionRequest, SessionErrorInfo, SessionInfo, SessionStatus, StreamEvent,
};

use crate::collections::{insert_by_timestamp, upsert_by_id};
use crate::persist::{DurableFile, DurableState, LayoutPosition};
use crate::subscription::{Subscribers, Subscription};

/// Advisory signal rings (file watcher, vcs branch) keep this many entries.
const RING_CAP: usize = 32;
const AUDIT_CAP: usize = 128;

/// A mirrored message. Created on first observation; once a completion stamp
/// is recorded the message never streams again.
#[derive(Debug, Clone, PartialEq)]
pub struct Message {
    pub id: String,
    pub session_id: String,
    pub role: MessageRole,
    pub created_at: i64,
    pub completed_at: Option<i64>,
    pub streaming: bool,
}

impl From<MessageInfo> for Message {
    fn from(info: MessageInfo) -> Self {
        Self {
            streaming: info.time.completed.is_none(),
            id: info.id,
            session_id: info.session_id,
            role: info.role,
            created_at: info.time.created,
            completed_at: info.time.completed,
        }
    }
}

/// One line of the audit trail: which event types arrived, scoped to which
/// session, including types the classifier does not understand.
#[derive(Debug, Clone, PartialEq)]
pub struct AuditEntry {
    pub raw_type: String,
    pub session_id: Option<String>,
}

#[derive(Debug, Clone, Default)]
pub struct ServerHealth {
    pub last_heartbeat_at: Option<DateTime<Utc>>,
    pub healthy: bool,
    retry_hint_ms: Option<u64>,
}

#[derive(Default)]
struct SessionState {
    messages: Vec<Message>,
    status: SessionStatus,
    error: Option<SessionErrorInfo>,
    diff: Option<Value>,
    revert: Option<String>,
    pending_permissions: Vec<PermissionRequest>,
    pending_questions: Vec<QuestionRequest>,
}

#[derive(Default)]
pub struct SyncStore {
    sessions: HashMap<String, SessionState>,
    parts: HashMap<String, Vec<MessagePart>>,
    health: ServerHealth,
    branch: Option<String>,
    branch_updates: VecDeque<String>,
    file_changes: VecDeque<FileChange>,
    audit: VecDeque<AuditEntry>,
    durable: DurableState,
    durable_file: Option<DurableFile>,
    subscribers: Subscribers,
}

impl SyncStore {
    /// In-memory store; durable mutations are kept but not written anywhere.
    pub fn new() -> Self {
        Self::default()
    }

    /// Store backed by a durable blob, rehydrated before any event arrives.
    pub fn with_durable_file(file: DurableFile) -> Self {
        Self {
            durable: file.load(),
            durable_file: Some(file),
            ..Self::default()
        }
    }

    /// Fold one classified event into the mirror, then notify subscribers.
    /// Never fails: malformed-but-classified input degrades field by field.
    pub fn apply_event(&mut self, event: StreamEvent) {
        self.record_audit(&event);
        self.reconcile(&event);
        self.subscribers.dispatch(&event);
    }

    fn reconcile(&mut self, event: &StreamEvent) {
        match event {
            StreamEvent::MessagePartUpdated { part } => self.apply_part_update(part),
            StreamEvent::MessageUpdated { info } => self.apply_message_updated(info),
            StreamEvent::MessageRemoved {
                session_id,
                message_id,
            } => self.apply_message_removed(session_id, message_id),
            StreamEvent::SessionStatusChanged { session_id, status } => {
                self.session_mut(session_id).status = *status;
            }
            StreamEvent::SessionDiffUpdated { session_id, diff } => {
                self.session_mut(session_id).diff = Some(diff.clone());
            }
            StreamEvent::SessionIdle { session_id } => {
                self.session_mut(session_id).status = SessionStatus::Idle;
            }
            StreamEvent::SessionErrored { session_id, error } => {
                self.apply_session_errored(session_id, error.as_ref());
            }
            StreamEvent::SessionUpdated { info } => self.apply_session_updated(info),
            StreamEvent::ServerHeartbeat { retry_ms } => self.apply_heartbeat(*retry_ms),
            StreamEvent::FileWatcherUpdated { change } => self.apply_file_change(change),
            StreamEvent::VcsBranchUpdated { branch } => {
                self.branch = Some(branch.clone());
                push_ring(&mut self.branch_updates, branch.clone(), RING_CAP);
            }
            StreamEvent::PermissionAsked { request } => {
                let pending = &mut self.session_mut(&request.session_id).pending_permissions;
                if !pending.iter().any(|r| r.id == request.id) {
                    pending.push(request.clone());
                }
            }
            StreamEvent::PermissionReplied {
                session_id,
                permission_id,
            } => {
                if let Some(session) = self.sessions.get_mut(session_id) {
                    session.pending_permissions.retain(|r| r.id != *permission_id);
                }
            }
            StreamEvent::PermissionSync { requests } => {
                for session in self.sessions.values_mut() {
                    session.pending_permissions.clear();
                }
                for request in requests {
                    let pending = &mut self.session_mut(&request.session_id).pending_permissions;
                    if !pending.iter().any(|r| r.id == request.id) {
                        pending.push(request.clone());
                    }
                }
            }
            StreamEvent::QuestionAsked { request } => {
                let pending = &mut self.session_mut(&request.session_id).pending_questions;
                if !pending.iter().any(|r| r.id == request.id) {
                    pending.push(request.clone());
                }
            }
            StreamEvent::QuestionReplied {
                session_id,
                question_id,
            }
            | StreamEvent::QuestionRejected {
                session_id,
                question_id,
            } => {
                if let Some(session) = self.sessions.get_mut(session_id) {
                    session.pending_questions.retain(|r| r.id != *question_id);
                }
            }
            StreamEvent::QuestionSync { requests } => {
                for session in self.sessions.values_mut() {
                    session.pending_questions.clear();
                }
                for request in requests {
                    let pending = &mut self.session_mut(&request.session_id).pending_questions;
                    if !pending.iter().any(|r| r.id == request.id) {
                        pending.push(request.clone());
                    }
                }
            }
            // Disposal is acted on by the connection manager; the audit entry
            // recorded above is all the store keeps.
            StreamEvent::ServerDisposed => {}
            StreamEvent::Unknown { raw_type, .. } => {
                tracing::debug!(raw_type = %raw_type, "Unrecognized event recorded to audit log only");
            }
        }
    }

    fn apply_part_update(&mut self, part: &MessagePart) {
        let Some(message_id) = part.message_id.clone() else {
            tracing::debug!(part_id = %part.id, "Dropping part update without message id");
            return;
        };
        upsert_by_id(self.parts.entry(message_id).or_default(), part.clone(), |p| {
            p.id.as_str()
        });
    }

    fn apply_message_updated(&mut self, info: &MessageInfo) {
        let session = self.session_mut(&info.session_id);
        if let Some(existing) = session.messages.iter_mut().find(|m| m.id == info.id) {
            if existing.streaming {
                if let Some(completed) = info.time.completed {
                    existing.streaming = false;
                    existing.completed_at = Some(completed);
                }
            }
        } else {
            insert_by_timestamp(&mut session.messages, Message::from(info.clone()), |m| {
                m.created_at
            });
        }
    }

    fn apply_message_removed(&mut self, session_id: &str, message_id: &str) {
        if let Some(session) = self.sessions.get_mut(session_id) {
            session.messages.retain(|m| m.id != message_id);
        }
        // Parts are never orphaned: the whole collection goes with the message.
        self.parts.remove(message_id);
    }

    fn apply_session_errored(&mut self, session_id: &str, error: Option<&SessionErrorInfo>) {
        let session = self.session_mut(session_id);
        session.status = SessionStatus::Error;
        if let Some(error) = error {
            session.error = Some(error.clone());
        }
    }

    fn apply_session_updated(&mut self, info: &SessionInfo) {
        let session = self.session_mut(&info.id);
        session.revert = info.revert.as_ref().map(|r| r.message_id.clone());
    }

    fn apply_heartbeat(&mut self, retry_ms: Option<u64>) {
        self.health.last_heartbeat_at = Some(Utc::now());
        self.health.healthy = true;
        if retry_ms.is_some() {
            self.health.retry_hint_ms = retry_ms;
        }
    }

    fn apply_file_change(&mut self, change: &FileChange) {
        push_ring(&mut self.file_changes, change.clone(), RING_CAP);
        if matches!(change.event, FileEventKind::Created | FileEventKind::Modified) {
            if let Some(session_id) = change.session_id.clone() {
                self.mark_session_wrote_files(&session_id);
            }
        }
    }

    fn record_audit(&mut self, event: &StreamEvent) {
        push_ring(
            &mut self.audit,
            AuditEntry {
                raw_type: event.name().to_owned(),
                session_id: event.session_id().map(str::to_owned),
            },
            AUDIT_CAP,
        );
    }

    fn session_mut(&mut self, session_id: &str) -> &mut SessionState {
        self.sessions.entry(session_id.to_owned()).or_default()
    }

    /// Drop every transient collection. The durable subset survives. Called
    /// by the connection manager before resuming events after a reconnect,
    /// because the server does not replay history.
    pub fn reset_realtime_state(&mut self) {
        self.sessions.clear();
        self.parts.clear();
        self.health = ServerHealth::default();
        self.branch = None;
        self.branch_updates.clear();
        self.file_changes.clear();
        self.audit.clear();
    }

    // ---- subscriptions -------------------------------------------------

    pub fn subscribe(
        &self,
        handler: impl Fn(&StreamEvent) + Send + Sync + 'static,
    ) -> Subscription {
        self.subscribers.subscribe(handler)
    }

    pub fn subscribe_session(
        &self,
        session_id: impl Into<String>,
        handler: impl Fn(&StreamEvent) + Send + Sync + 'static,
    ) -> Subscription {
        self.subscribers.subscribe_session(session_id, handler)
    }

    // ---- durable subset ------------------------------------------------

    pub fn select_session(&mut self, session_id: Option<String>) {
        self.durable.selected_session = session_id;
        self.persist_durable();
    }

    pub fn set_layout_position(&mut self, session_id: impl Into<String>, position: LayoutPosition) {
        self.durable.layout.insert(session_id.into(), position);
        self.persist_durable();
    }

    pub fn mark_session_wrote_files(&mut self, session_id: &str) {
        if self.durable.wrote_files.get(session_id) == Some(&true) {
            return;
        }
        self.durable.wrote_files.insert(session_id.to_owned(), true);
        self.persist_durable();
    }

    fn persist_durable(&self) {
        if let Some(file) = &self.durable_file {
            if let Err(error) = file.save(&self.durable) {
                tracing::warn!(error = %error, path = %file.path().display(), "Durable state write failed");
            }
        }
    }

    // ---- reads ---------------------------------------------------------

    pub fn messages(&self, session_id: &str) -> &[Message] {
        self.sessions
            .get(session_id)
            .map(|s| s.messages.as_slice())
            .unwrap_or(&[])
    }

    /// Effective message view: when a revert pointer is set, only messages
    /// whose id sorts strictly before the boundary are visible. Pure filter;
    /// the underlying collection is untouched.
    pub fn visible_messages(&self, session_id: &str) -> Vec<Message> {
        let Some(session) = self.sessions.get(session_id) else {
            return Vec::new();
        };
        match session.revert.as_deref() {
            None => session.messages.clone(),
            Some(boundary) => session
                .messages
                .iter()
                .filter(|m| m.id.as_str() < boundary)
                .cloned()
                .collect(),
        }
    }

    /// Part collection for a message. `None` means no collection exists,
    /// distinguishable from an existing-but-empty one.
    pub fn parts(&self, message_id: &str) -> Option<&[MessagePart]> {
        self.parts.get(message_id).map(|parts| parts.as_slice())
    }

    pub fn status(&self, session_id: &str) -> SessionStatus {
        self.sessions
            .get(session_id)
            .map(|s| s.status)
            .unwrap_or_default()
    }

    pub fn error(&self, session_id: &str) -> Option<&SessionErrorInfo> {
        self.sessions.get(session_id)?.error.as_ref()
    }

    pub fn diff(&self, session_id: &str) -> Option<&Value> {
        self.sessions.get(session_id)?.diff.as_ref()
    }

    pub fn revert_boundary(&self, session_id: &str) -> Option<&str> {
        self.sessions.get(session_id)?.revert.as_deref()
    }

    pub fn pending_permissions(&self, session_id: &str) -> &[PermissionRequest] {
        self.sessions
            .get(session_id)
            .map(|s| s.pending_permissions.as_slice())
            .unwrap_or(&[])
    }

    pub fn pending_questions(&self, session_id: &str) -> &[QuestionRequest] {
        self.sessions
            .get(session_id)
            .map(|s| s.pending_questions.as_slice())
            .unwrap_or(&[])
    }

    pub fn pending_permissions_total(&self) -> usize {
        self.sessions
            .values()
            .map(|s| s.pending_permissions.len())
            .sum()
    }

    pub fn branch(&self) -> Option<&str> {
        self.branch.as_deref()
    }

    pub fn file_changes(&self) -> &VecDeque<FileChange> {
        &self.file_changes
    }

    pub fn audit_log(&self) -> &VecDeque<AuditEntry> {
        &self.audit
    }

    pub fn health(&self) -> &ServerHealth {
        &self.health
    }

    /// Milliseconds since the last heartbeat, for UI staleness badges.
    pub fn heartbeat_age_ms(&self) -> Option<i64> {
        let last = self.health.last_heartbeat_at?;
        Some((Utc::now() - last).num_milliseconds())
    }

    /// Consume the server-suggested retry delay, if one was advertised.
    pub fn take_retry_hint(&mut self) -> Option<u64> {
        self.health.retry_hint_ms.take()
    }

    pub fn selected_session(&self) -> Option<&str> {
        self.durable.selected_session.as_deref()
    }

    pub fn layout_position(&self, session_id: &str) -> Option<LayoutPosition> {
        self.durable.layout.get(session_id).copied()
    }

    pub fn session_wrote_files(&self, session_id: &str) -> bool {
        self.durable.wrote_files.get(session_id) == Some(&true)
    }

    pub fn durable_state(&self) -> &DurableState {
        &self.durable
    }
}

fn push_ring<T>(ring: &mut VecDeque<T>, item: T, cap: usize) {
    ring.push_back(item);
    while ring.len() > cap {
        ring.pop_front();
    }
}
