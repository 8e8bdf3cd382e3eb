//! Per-connection session lifecycle.
//!
//! The upstream dialogue protocol is staged: StartConnection must be
//! acknowledged before StartSession, and StartSession before any
//! TaskRequest. Client traffic that arrives ahead of its gate is parked in
//! a bounded FIFO and replayed when the gate opens.
//!
//! `Session` is a pure value: transition methods mutate state and return the
//! ordered frames to transmit, so every transition is atomic with its side
//! effects and testable without sockets. All I/O lives in the bridge.

use std::collections::VecDeque;
use std::time::{SystemTime, UNIX_EPOCH};

use crate::config::SessionConfig;
use crate::error::Result;
use crate::protocol::{events, OutboundFrame};

/// Maximum number of deferred client items per session.
pub const MAX_DEFERRED_ITEMS: usize = 512;

// ================== Pre-Ready Buffer ==================

/// Bounded FIFO for client traffic awaiting a lifecycle gate.
#[derive(Debug)]
pub struct PreReadyBuffer<T> {
    items: VecDeque<T>,
    capacity: usize,
}

impl<T> PreReadyBuffer<T> {
    pub fn new(capacity: usize) -> Self {
        Self {
            items: VecDeque::new(),
            capacity,
        }
    }

    /// Appends an item; returns false (item refused) when the buffer is full.
    pub fn push(&mut self, item: T) -> bool {
        if self.items.len() >= self.capacity {
            return false;
        }
        self.items.push_back(item);
        true
    }

    /// Removes and returns every buffered item in arrival order.
    pub fn drain(&mut self) -> Vec<T> {
        self.items.drain(..).collect()
    }

    pub fn len(&self) -> usize {
        self.items.len()
    }

    pub fn is_empty(&self) -> bool {
        self.items.is_empty()
    }
}

// ================== Session ==================

/// Lifecycle states, in the order a healthy session traverses them.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SessionState {
    Idle,
    Connecting,
    Connected,
    SessionStarting,
    SessionActive,
    SessionEnding,
    Closed,
}

/// A deferred client item awaiting the session gate.
#[derive(Debug)]
enum Deferred {
    Audio(Vec<u8>),
    Text(String),
}

/// Where a client task-request ended up.
#[derive(Debug)]
pub enum Disposition {
    /// Session active; transmit now.
    Forward(OutboundFrame),
    /// Parked until SESSION_STARTED.
    Deferred,
    /// Upstream unusable or buffer full; discarded.
    Dropped,
}

/// Per-connection lifecycle tracker.
#[derive(Debug)]
pub struct Session {
    state: SessionState,
    connection_established: bool,
    session_id: String,
    system_role: String,
    model: String,
    pending_start: Option<SessionConfig>,
    deferred: PreReadyBuffer<Deferred>,
    message_count: u64,
}

impl Default for Session {
    fn default() -> Self {
        Self::new()
    }
}

impl Session {
    pub fn new() -> Self {
        Self {
            state: SessionState::Idle,
            connection_established: false,
            session_id: String::new(),
            system_role: String::new(),
            model: String::new(),
            pending_start: None,
            deferred: PreReadyBuffer::new(MAX_DEFERRED_ITEMS),
            message_count: 0,
        }
    }

    pub fn state(&self) -> SessionState {
        self.state
    }

    pub fn session_id(&self) -> &str {
        &self.session_id
    }

    pub fn system_role(&self) -> &str {
        &self.system_role
    }

    pub fn model(&self) -> &str {
        &self.model
    }

    pub fn connection_established(&self) -> bool {
        self.connection_established
    }

    /// True between SESSION_STARTED and the first finish step.
    pub fn session_active(&self) -> bool {
        self.state == SessionState::SessionActive
    }

    pub fn deferred_len(&self) -> usize {
        self.deferred.len()
    }

    pub fn message_count(&self) -> u64 {
        self.message_count
    }

    /// Counts one processed client message.
    pub fn count_message(&mut self) {
        self.message_count += 1;
    }

    // ================== Lifecycle transitions ==================

    /// Upstream handshake initiated.
    pub fn upstream_connecting(&mut self) {
        self.state = SessionState::Connecting;
    }

    /// Upstream socket open; the proxy introduces itself.
    pub fn upstream_open(&mut self) -> OutboundFrame {
        self.state = SessionState::Connected;
        OutboundFrame::event_json(events::START_CONNECTION, None, serde_json::json!({}))
    }

    /// CONNECTION_STARTED observed. Opens the connection gate and releases a
    /// pending session start, which must go out before anything else.
    pub fn on_connection_started(&mut self) -> Result<Vec<OutboundFrame>> {
        self.connection_established = true;
        let mut out = Vec::new();
        if let Some(config) = self.pending_start.take() {
            self.state = SessionState::SessionStarting;
            out.push(self.start_session_frame(&config)?);
        }
        Ok(out)
    }

    /// SESSION_STARTED observed. Adopts a server-supplied session id and
    /// replays deferred task requests in arrival order.
    pub fn on_session_started(&mut self, server_session_id: Option<&str>) -> Vec<OutboundFrame> {
        self.state = SessionState::SessionActive;
        if let Some(id) = server_session_id {
            if !id.is_empty() {
                self.session_id = id.to_string();
            }
        }
        self.deferred
            .drain()
            .into_iter()
            .map(|item| match item {
                Deferred::Audio(pcm) => OutboundFrame::audio(self.session_id.clone(), pcm),
                Deferred::Text(text) => self.text_task_frame(&text),
            })
            .collect()
    }

    /// SESSION_FINISHED observed.
    pub fn on_session_finished(&mut self) {
        match self.state {
            SessionState::SessionEnding => self.state = SessionState::Closed,
            // Server ended the session on its own; the connection survives.
            SessionState::SessionActive => self.state = SessionState::Connected,
            _ => {}
        }
    }

    /// Upstream socket gone, for whatever reason.
    pub fn on_upstream_closed(&mut self) {
        self.state = SessionState::Closed;
    }

    // ================== Client requests ==================

    /// Client asked for a session. Emits StartSession immediately when the
    /// connection gate is open, otherwise parks the request.
    pub fn start_session(
        &mut self,
        session_id: Option<String>,
        system_message: Option<String>,
        model: Option<String>,
    ) -> Result<Option<OutboundFrame>> {
        self.session_id = match session_id {
            Some(id) if !id.is_empty() => id,
            _ => format!("session_{}", epoch_millis()),
        };
        let config = SessionConfig::for_client(system_message, model);
        self.system_role = config.dialog.system_role.clone();
        self.model = config.dialog.model.clone();

        if self.connection_established {
            self.state = SessionState::SessionStarting;
            Ok(Some(self.start_session_frame(&config)?))
        } else {
            self.pending_start = Some(config);
            Ok(None)
        }
    }

    /// Routes one client audio chunk through the session gate.
    pub fn push_audio(&mut self, pcm: Vec<u8>) -> Disposition {
        match self.state {
            SessionState::SessionActive => {
                Disposition::Forward(OutboundFrame::audio(self.session_id.clone(), pcm))
            }
            SessionState::Connecting
            | SessionState::Connected
            | SessionState::SessionStarting => {
                if self.deferred.push(Deferred::Audio(pcm)) {
                    Disposition::Deferred
                } else {
                    Disposition::Dropped
                }
            }
            _ => Disposition::Dropped,
        }
    }

    /// Routes one client text turn through the session gate.
    pub fn push_text(&mut self, text: String) -> Disposition {
        match self.state {
            SessionState::SessionActive => Disposition::Forward(self.text_task_frame(&text)),
            SessionState::Connecting
            | SessionState::Connected
            | SessionState::SessionStarting => {
                if self.deferred.push(Deferred::Text(text)) {
                    Disposition::Deferred
                } else {
                    Disposition::Dropped
                }
            }
            _ => Disposition::Dropped,
        }
    }

    /// Client (or shutdown path) asked to finish the session.
    pub fn finish_session(&mut self) -> Option<OutboundFrame> {
        if self.state != SessionState::SessionActive {
            return None;
        }
        self.state = SessionState::SessionEnding;
        Some(OutboundFrame::event_json(
            events::FINISH_SESSION,
            Some(self.session_id.clone()),
            serde_json::json!({}),
        ))
    }

    /// Client (or shutdown path) asked to finish the connection.
    pub fn finish_connection(&mut self) -> OutboundFrame {
        OutboundFrame::event_json(events::FINISH_CONNECTION, None, serde_json::json!({}))
    }

    fn start_session_frame(&self, config: &SessionConfig) -> Result<OutboundFrame> {
        Ok(OutboundFrame::event_json(
            events::START_SESSION,
            Some(self.session_id.clone()),
            serde_json::to_value(config)?,
        ))
    }

    fn text_task_frame(&self, text: &str) -> OutboundFrame {
        OutboundFrame::event_json(
            events::TASK_REQUEST,
            Some(self.session_id.clone()),
            serde_json::json!({
                "text": text,
                "input_text": text,
                "input_mod": "text",
                "input_mode": "text",
            }),
        )
    }
}

fn epoch_millis() -> u128 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| d.as_millis())
        .unwrap_or(0)
}
