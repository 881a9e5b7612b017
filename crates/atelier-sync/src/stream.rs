//! Stream connection manager.
//!
//! Owns the lifecycle of the long-lived `GET /event` connection: connect,
//! consume line-delimited envelopes, detect termination, back off, retry.
//! There is exactly one consumption loop per process; it is the sole mutator
//! of the store. An open, healthy stream is held indefinitely; only a failed
//! open or a stream termination enters the backoff path.

use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use std::time::Duration;

use futures::StreamExt;
use reqwest::StatusCode;
use reqwest::header::{HeaderMap, RETRY_AFTER};
use thiserror::Error;
use tokio::sync::watch;
use uuid::Uuid;

use atelier_proto::{EventEnvelope, StreamEvent, classify};

use crate::store::SyncStore;

pub const DEFAULT_BASE_URL: &str = "http://127.0.0.1:4096";
pub const DEFAULT_BASE_DELAY_MS: u64 = 1_000;
pub const DEFAULT_BACKOFF_FACTOR: f64 = 2.0;
pub const DEFAULT_MAX_DELAY_MS: u64 = 16_000;
const ENV_SERVER_BASE_URL: &str = "ATELIER_SERVER_BASE_URL";
const EVENT_PATH: &str = "/event";

#[derive(Debug, Error)]
pub enum StreamError {
    #[error("stream_request_failed:{message}")]
    Request { message: String },
    #[error("stream_http_{status}")]
    Http {
        status: StatusCode,
        retry_after_ms: Option<u64>,
    },
    #[error("stream_read_failed:{message}")]
    Read { message: String },
    #[error("stream_attempts_exhausted")]
    AttemptsExhausted,
}

#[derive(Debug, Clone)]
pub struct StreamConfig {
    pub base_url: String,
    pub backoff: BackoffPolicy,
    /// Retry budget before `Disconnected` becomes terminal. `None` retries
    /// forever, which is the intended production setting.
    pub max_attempts: Option<u32>,
}

impl Default for StreamConfig {
    fn default() -> Self {
        Self {
            base_url: std::env::var(ENV_SERVER_BASE_URL)
                .unwrap_or_else(|_| DEFAULT_BASE_URL.to_owned()),
            backoff: BackoffPolicy::default(),
            max_attempts: None,
        }
    }
}

impl StreamConfig {
    pub fn new(base_url: impl Into<String>) -> Self {
        Self {
            base_url: base_url.into(),
            ..Self::default()
        }
    }

    fn event_url(&self) -> String {
        format!("{}{EVENT_PATH}", self.base_url.trim_end_matches('/'))
    }
}

#[derive(Debug, Clone, Copy, PartialEq)]
pub struct BackoffPolicy {
    pub base_delay_ms: u64,
    pub factor: f64,
    pub max_delay_ms: u64,
}

impl Default for BackoffPolicy {
    fn default() -> Self {
        Self {
            base_delay_ms: DEFAULT_BASE_DELAY_MS,
            factor: DEFAULT_BACKOFF_FACTOR,
            max_delay_ms: DEFAULT_MAX_DELAY_MS,
        }
    }
}

impl BackoffPolicy {
    /// Delay after failed attempt `attempt` (1-based):
    /// `base × factor^(attempt−1)`, clamped to the ceiling.
    pub fn delay_ms(&self, attempt: u32) -> u64 {
        if attempt <= 1 {
            return self.base_delay_ms.min(self.max_delay_ms);
        }
        let exponent = (attempt - 1).min(32);
        let scaled = self.base_delay_ms as f64 * self.factor.powi(exponent as i32);
        if scaled.is_finite() && scaled < self.max_delay_ms as f64 {
            scaled as u64
        } else {
            self.max_delay_ms
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum ConnectionPhase {
    #[default]
    Disconnected,
    Connecting,
    Connected,
    Reconnecting,
}

/// Process-wide connection snapshot published for the UI layer; never a
/// fatal error surface: the worst state is "reconnecting".
#[derive(Debug, Clone, Default)]
pub struct ConnectionState {
    pub phase: ConnectionPhase,
    pub attempt: u32,
    pub retry_hint_ms: Option<u64>,
}

pub struct SyncClient {
    config: StreamConfig,
    http: reqwest::Client,
    store: Arc<Mutex<SyncStore>>,
    state_tx: watch::Sender<ConnectionState>,
    state_rx: watch::Receiver<ConnectionState>,
}

impl SyncClient {
    pub fn new(config: StreamConfig, store: Arc<Mutex<SyncStore>>) -> Self {
        let (state_tx, state_rx) = watch::channel(ConnectionState::default());
        Self {
            config,
            http: reqwest::Client::new(),
            store,
            state_tx,
            state_rx,
        }
    }

    pub fn store(&self) -> Arc<Mutex<SyncStore>> {
        Arc::clone(&self.store)
    }

    pub fn connection_state(&self) -> watch::Receiver<ConnectionState> {
        self.state_rx.clone()
    }

    /// Run the consumption loop until `shutdown` flips true (or its sender is
    /// dropped), or the configured attempt budget is exhausted. Both the
    /// stream await and the backoff sleep abort promptly on shutdown.
    pub async fn run(&self, mut shutdown: watch::Receiver<bool>) -> Result<(), StreamError> {
        let mut attempt: u32 = 0;
        let mut first_connection = true;

        loop {
            if *shutdown.borrow() {
                break;
            }
            attempt += 1;
            self.publish(attempt_phase(first_connection, attempt), attempt, None);

            let mut server_hint = None;
            let mut connected = false;
            match self.open_stream().await {
                Ok(response) => {
                    connected = true;
                    attempt = 0;
                    self.publish(ConnectionPhase::Connected, 0, None);
                    // The server never replays history, so every connection
                    // after the first starts from a clean transient slate.
                    if first_connection {
                        first_connection = false;
                    } else {
                        tracing::debug!("Resyncing store after reconnect");
                        self.lock_store().reset_realtime_state();
                    }
                    match self.consume(response, &mut shutdown).await {
                        Ok(()) => tracing::debug!("Event stream closed by server"),
                        Err(error) => {
                            tracing::warn!(error = %error, "Event stream read failed");
                        }
                    }
                }
                Err(error) => {
                    if let StreamError::Http {
                        retry_after_ms: Some(ms),
                        ..
                    } = &error
                    {
                        server_hint = Some(*ms);
                    }
                    tracing::warn!(error = %error, url = %self.config.event_url(), "Event stream connect failed");
                }
            }

            if *shutdown.borrow() {
                break;
            }
            if let Some(max) = self.config.max_attempts {
                if !connected && attempt >= max {
                    self.publish(ConnectionPhase::Disconnected, attempt, None);
                    return Err(StreamError::AttemptsExhausted);
                }
            }

            // A drop after a successful connection restarts the schedule at
            // the base delay; `attempt` was reset to zero above.
            let failed_attempt = attempt.max(1);
            let hint = server_hint.or_else(|| self.lock_store().take_retry_hint());
            let delay = hint.unwrap_or_else(|| self.config.backoff.delay_ms(failed_attempt));
            self.publish(ConnectionPhase::Reconnecting, attempt, hint);
            tracing::debug!(delay_ms = delay, attempt = failed_attempt, "Backing off before reconnect");

            tokio::select! {
                () = tokio::time::sleep(Duration::from_millis(delay)) => {}
                changed = shutdown.changed() => {
                    if changed.is_err() || *shutdown.borrow() {
                        break;
                    }
                }
            }
        }

        self.publish(ConnectionPhase::Disconnected, 0, None);
        Ok(())
    }

    async fn open_stream(&self) -> Result<reqwest::Response, StreamError> {
        let response = self
            .http
            .get(self.config.event_url())
            .header("x-request-id", format!("req_{}", Uuid::new_v4().simple()))
            .send()
            .await
            .map_err(|error| StreamError::Request {
                message: error.to_string(),
            })?;

        let status = response.status();
        if status.is_success() {
            Ok(response)
        } else {
            Err(StreamError::Http {
                status,
                retry_after_ms: parse_retry_after(response.headers()),
            })
        }
    }

    async fn consume(
        &self,
        response: reqwest::Response,
        shutdown: &mut watch::Receiver<bool>,
    ) -> Result<(), StreamError> {
        let mut body = response.bytes_stream();
        let mut lines = LineBuffer::default();

        loop {
            tokio::select! {
                changed = shutdown.changed() => {
                    if changed.is_err() || *shutdown.borrow() {
                        return Ok(());
                    }
                }
                chunk = body.next() => match chunk {
                    None => {
                        if let Some(line) = lines.flush() {
                            self.process_line(&line);
                        }
                        return Ok(());
                    }
                    Some(Err(error)) => {
                        return Err(StreamError::Read {
                            message: error.to_string(),
                        });
                    }
                    Some(Ok(bytes)) => {
                        for line in lines.split(&bytes) {
                            self.process_line(&line);
                        }
                    }
                },
            }
        }
    }

    fn process_line(&self, line: &[u8]) {
        let Ok(text) = std::str::from_utf8(line) else {
            tracing::warn!("Dropping non-UTF-8 stream line");
            return;
        };
        let text = text.trim();
        if text.is_empty() {
            return;
        }
        let envelope: EventEnvelope = match serde_json::from_str(text) {
            Ok(envelope) => envelope,
            Err(error) => {
                tracing::warn!(error = %error, "Dropping undecodable stream line");
                return;
            }
        };

        let event = classify(&envelope);
        let mut store = self.lock_store();
        // A disposal notice means the server discarded its session state
        // without dropping the connection; same clean-slate path as a
        // reconnect.
        if matches!(event, StreamEvent::ServerDisposed) {
            tracing::debug!("Server disposed its state, resyncing store");
            store.reset_realtime_state();
        }
        store.apply_event(event);
    }

    fn publish(&self, phase: ConnectionPhase, attempt: u32, retry_hint_ms: Option<u64>) {
        self.state_tx.send_replace(ConnectionState {
            phase,
            attempt,
            retry_hint_ms,
        });
    }

    fn lock_store(&self) -> MutexGuard<'_, SyncStore> {
        self.store.lock().unwrap_or_else(PoisonError::into_inner)
    }
}

fn attempt_phase(first_connection: bool, attempt: u32) -> ConnectionPhase {
    if first_connection && attempt == 1 {
        ConnectionPhase::Connecting
    } else {
        ConnectionPhase::Reconnecting
    }
}

fn parse_retry_after(headers: &HeaderMap) -> Option<u64> {
    headers
        .get(RETRY_AFTER)?
        .to_str()
        .ok()?
        .trim()
        .parse::<u64>()
        .ok()
        .map(|seconds| seconds.saturating_mul(1_000))
}

/// Incremental splitter for the line-delimited stream body. Chunks arrive at
/// arbitrary boundaries; a carriage return before the newline is tolerated.
#[derive(Debug, Default)]
pub struct LineBuffer {
    pending: Vec<u8>,
}

impl LineBuffer {
    /// Absorb one chunk, returning every line it completed.
    pub fn split(&mut self, chunk: &[u8]) -> Vec<Vec<u8>> {
        self.pending.extend_from_slice(chunk);
        let mut lines = Vec::new();
        while let Some(newline) = self.pending.iter().position(|byte| *byte == b'\n') {
            let mut line: Vec<u8> = self.pending.drain(..=newline).collect();
            line.pop();
            if line.last() == Some(&b'\r') {
                line.pop();
            }
            lines.push(line);
        }
        lines
    }

    /// Hand back the unterminated tail, if any, at end of stream.
    pub fn flush(&mut self) -> Option<Vec<u8>> {
        if self.pending.is_empty() {
            None
        } else {
            Some(std::mem::take(&mut self.pending))
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn backoff_schedule_doubles_up_to_ceiling() {
        let policy = BackoffPolicy {
            base_delay_ms: 1_000,
            factor: 2.0,
            max_delay_ms: 16_000,
        };
        let delays: Vec<u64> = (1..=5).map(|attempt| policy.delay_ms(attempt)).collect();
        assert_eq!(delays, [1_000, 2_000, 4_000, 8_000, 16_000]);
        // The sixth failure would be 32s unclamped; the ceiling holds.
        assert_eq!(policy.delay_ms(6), 16_000);
    }

    #[test]
    fn backoff_is_non_decreasing() {
        let policy = BackoffPolicy::default();
        let mut previous = 0;
        for attempt in 1..=20 {
            let delay = policy.delay_ms(attempt);
            assert!(delay >= previous);
            assert!(delay <= policy.max_delay_ms);
            previous = delay;
        }
    }

    #[test]
    fn backoff_restarts_at_base_after_success() {
        let policy = BackoffPolicy::default();
        // After any successful connection the attempt counter is zeroed, so
        // the next failure is attempt 1 again.
        assert_eq!(policy.delay_ms(1), policy.base_delay_ms);
    }

    #[test]
    fn first_attempt_connects_later_attempts_reconnect() {
        assert_eq!(attempt_phase(true, 1), ConnectionPhase::Connecting);
        assert_eq!(attempt_phase(true, 2), ConnectionPhase::Reconnecting);
        assert_eq!(attempt_phase(false, 1), ConnectionPhase::Reconnecting);
    }

    #[test]
    fn line_buffer_reassembles_across_chunk_boundaries() {
        let mut buffer = LineBuffer::default();
        assert!(buffer.split(b"{\"type\":\"ses").is_empty());
        let lines = buffer.split(b"sion.idle\"}\n{\"type\":");
        assert_eq!(lines, vec![b"{\"type\":\"session.idle\"}".to_vec()]);
        let lines = buffer.split(b"\"server.heartbeat\"}\n");
        assert_eq!(lines, vec![b"{\"type\":\"server.heartbeat\"}".to_vec()]);
        assert!(buffer.flush().is_none());
    }

    #[test]
    fn line_buffer_trims_carriage_returns_and_flushes_tail() {
        let mut buffer = LineBuffer::default();
        let lines = buffer.split(b"one\r\ntwo");
        assert_eq!(lines, vec![b"one".to_vec()]);
        assert_eq!(buffer.flush(), Some(b"two".to_vec()));
        assert!(buffer.flush().is_none());
    }

    #[test]
    fn retry_after_header_parses_to_millis() {
        let mut headers = HeaderMap::new();
        headers.insert(RETRY_AFTER, "3".parse().unwrap());
        assert_eq!(parse_retry_after(&headers), Some(3_000));

        let mut bad = HeaderMap::new();
        bad.insert(RETRY_AFTER, "soon".parse().unwrap());
        assert_eq!(parse_retry_after(&bad), None);
        assert_eq!(parse_retry_after(&HeaderMap::new()), None);
    }

    #[test]
    fn event_url_tolerates_trailing_slash() {
        let config = StreamConfig::new("http://127.0.0.1:9099/");
        assert_eq!(config.event_url(), "http://127.0.0.1:9099/event");
    }

    #[tokio::test]
    async fn bounded_attempts_end_in_terminal_disconnect() {
        // Port 1 is never serving; every open fails immediately.
        let config = StreamConfig {
            base_url: "http://127.0.0.1:1".to_owned(),
            backoff: BackoffPolicy {
                base_delay_ms: 1,
                factor: 2.0,
                max_delay_ms: 4,
            },
            max_attempts: Some(2),
        };
        let client = SyncClient::new(config, Arc::new(Mutex::new(SyncStore::new())));
        let state = client.connection_state();
        let (_shutdown_tx, shutdown_rx) = watch::channel(false);

        let result = client.run(shutdown_rx).await;
        assert!(matches!(result, Err(StreamError::AttemptsExhausted)));
        assert_eq!(state.borrow().phase, ConnectionPhase::Disconnected);
    }

    #[tokio::test]
    async fn shutdown_aborts_backoff_wait_promptly() {
        let config = StreamConfig {
            base_url: "http://127.0.0.1:1".to_owned(),
            backoff: BackoffPolicy {
                base_delay_ms: 60_000,
                factor: 2.0,
                max_delay_ms: 60_000,
            },
            max_attempts: None,
        };
        let client = Arc::new(SyncClient::new(
            config,
            Arc::new(Mutex::new(SyncStore::new())),
        ));
        let (shutdown_tx, shutdown_rx) = watch::channel(false);

        let runner = Arc::clone(&client);
        let task = tokio::spawn(async move { runner.run(shutdown_rx).await });

        // Give the loop time to fail its first open and enter the backoff
        // sleep, then cancel; the task must finish well before the 60s delay.
        tokio::time::sleep(Duration::from_millis(200)).await;
        shutdown_tx.send_replace(true);
        let result = tokio::time::timeout(Duration::from_secs(5), task)
            .await
            .unwrap()
            .unwrap();
        assert!(result.is_ok());
        assert_eq!(
            client.connection_state().borrow().phase,
            ConnectionPhase::Disconnected
        );
    }
}
