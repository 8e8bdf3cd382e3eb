//! Doubao session bridge.
//!
//! One bridge per client connection: it dials the upstream, owns the
//! lifecycle state machine, translates client control messages and audio
//! into upstream frames, and demultiplexes decoded upstream frames onto the
//! client-facing JSON + binary stream.
//!
//! Client-facing protocol:
//!
//! | Direction | Frame | Content |
//! |---|---|---|
//! | Client → Proxy | Text | `{"type":"start_session"\|"audio_data"\|"text_input"\|"finish_session"\|"finish_connection", ...}` |
//! | Client → Proxy | Binary | raw PCM16 LE, 16 kHz mono |
//! | Proxy → Client | Text | `{"type":"session_started"\|"asr_response"\|"chat_response"\|"chat_ended"\|"speech_started"\|"error", ...}` |
//! | Proxy → Client | Binary | raw TTS PCM16 LE, 24 kHz mono |
//!
//! All work for one session runs on this single task; the only suspension
//! points are the two sockets, upstream sends and the shutdown deferral.

use std::time::Duration;

use axum::extract::ws::{CloseFrame, Message as ClientMessage, WebSocket};
use base64::engine::general_purpose::STANDARD as BASE64;
use base64::Engine;
use futures::stream::{SplitSink, SplitStream};
use futures::{SinkExt, StreamExt};
use serde::Deserialize;
use serde_json::{json, Value};
use tokio_tungstenite::tungstenite::Message as UpstreamMessage;
use tracing::{debug, info, warn};

use crate::config::DoubaoUpstream;
use crate::error::Result;
use crate::protocol::{self, events, Frame, MessageType, OutboundFrame, Payload};
use crate::session::{Disposition, Session};
use crate::upstream::{self, UpstreamStream};

/// Close code substituted for an observed abnormal closure; 1006 is
/// reserved and must never be sent on the wire.
const CLOSE_NORMAL: u16 = 1000;
const CLOSE_ABNORMAL: u16 = 1006;

/// Deferral between FINISH_SESSION and FINISH_CONNECTION on teardown.
const FINISH_DEFERRAL: Duration = Duration::from_millis(100);

/// Interval of the per-session status log.
const STATUS_INTERVAL: Duration = Duration::from_secs(2);

/// How long to wait for the first upstream response before warning.
const FIRST_RESPONSE_WARN: Duration = Duration::from_secs(5);

type ClientSink = SplitSink<WebSocket, ClientMessage>;
type ClientStream = SplitStream<WebSocket>;
type UpstreamSink = SplitSink<UpstreamStream, UpstreamMessage>;

// ================== Client control messages ==================

/// JSON control messages accepted from the browser.
#[derive(Debug, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
enum ClientCommand {
    StartSession {
        #[serde(rename = "sessionId")]
        session_id: Option<String>,
        #[serde(rename = "systemMessage")]
        system_message: Option<String>,
        model: Option<String>,
    },
    /// Legacy base64 audio path.
    AudioData {
        data: String,
        #[serde(rename = "isLast", default)]
        is_last: bool,
    },
    TextInput {
        text: String,
    },
    FinishSession,
    FinishConnection,
}

/// One step of client-facing or upstream-facing output.
#[derive(Debug)]
enum Action {
    ClientJson(Value),
    ClientBinary(Vec<u8>),
    Upstream(OutboundFrame),
}

// ================== Bridge entry point ==================

/// Runs one client connection to completion.
pub async fn run(client: WebSocket, upstream_config: DoubaoUpstream) {
    let conn_id = uuid::Uuid::new_v4().to_string()[..8].to_string();
    let conn = conn_id.as_str();
    info!(conn, "client connected");

    let (mut client_tx, mut client_rx) = client.split();
    let mut session = Session::new();
    session.upstream_connecting();

    // Dial the upstream while already buffering early client traffic.
    let upstream_stream =
        match connect_phase(&upstream_config, &mut client_rx, &mut session, conn).await {
            ConnectOutcome::Connected(stream) => stream,
            ConnectOutcome::ClientGone => {
                info!(conn, "client left before upstream connected");
                return;
            }
            ConnectOutcome::Failed(e) => {
                warn!(conn, error = %e, "upstream handshake failed");
                let _ = send_client_json(
                    &mut client_tx,
                    &json!({"type": "error", "error": format!("服务器连接错误: {}", e)}),
                )
                .await;
                let _ = client_tx.send(ClientMessage::Close(None)).await;
                return;
            }
        };

    let (mut up_tx, mut up_rx) = upstream_stream.split();

    // StartConnection goes out as soon as the socket is open.
    let open_frame = session.upstream_open();
    if let Err(e) = send_upstream(&mut up_tx, &open_frame).await {
        warn!(conn, error = %e, "failed to send StartConnection");
        let _ = send_client_json(
            &mut client_tx,
            &json!({"type": "error", "error": format!("服务器连接错误: {}", e)}),
        )
        .await;
        let _ = client_tx.send(ClientMessage::Close(None)).await;
        return;
    }

    let mut status_interval = tokio::time::interval(STATUS_INTERVAL);
    let first_response_warn = tokio::time::sleep(FIRST_RESPONSE_WARN);
    tokio::pin!(first_response_warn);
    let mut got_first_response = false;

    loop {
        tokio::select! {
            msg = client_rx.next() => match msg {
                Some(Ok(ClientMessage::Text(text))) => {
                    session.count_message();
                    let frames = handle_client_text(text.as_str(), &mut session);
                    if send_upstream_all(&mut up_tx, &frames).await.is_err() {
                        upstream_lost(&mut client_tx, conn, "send failed").await;
                        break;
                    }
                }
                Some(Ok(ClientMessage::Binary(data))) => {
                    session.count_message();
                    if let Some(frame) = route_audio(data.to_vec(), &mut session) {
                        if send_upstream(&mut up_tx, &frame).await.is_err() {
                            upstream_lost(&mut client_tx, conn, "send failed").await;
                            break;
                        }
                    }
                }
                Some(Ok(ClientMessage::Close(_))) | None => {
                    info!(conn, "client disconnected, tearing down upstream");
                    teardown_upstream(&mut session, &mut up_tx).await;
                    break;
                }
                Some(Ok(_)) => {} // ping/pong are answered by the server layer
                Some(Err(e)) => {
                    warn!(conn, error = %e, "client socket error");
                    teardown_upstream(&mut session, &mut up_tx).await;
                    break;
                }
            },

            msg = up_rx.next() => match msg {
                Some(Ok(UpstreamMessage::Binary(data))) => {
                    got_first_response = true;
                    match protocol::unmarshal(&data) {
                        Some(frame) => {
                            let actions = dispatch_frame(frame, &mut session);
                            if let Err(e) = apply_actions(actions, &mut client_tx, &mut up_tx).await {
                                warn!(conn, error = %e, "session i/o failed");
                                break;
                            }
                        }
                        None => warn!(conn, bytes = data.len(), "undecodable upstream frame dropped"),
                    }
                }
                Some(Ok(UpstreamMessage::Text(text))) => {
                    got_first_response = true;
                    debug!(conn, "ignoring upstream text frame: {}", text);
                }
                Some(Ok(UpstreamMessage::Close(close))) => {
                    session.on_upstream_closed();
                    let (code, reason) = match close {
                        Some(cf) => (u16::from(cf.code), cf.reason.to_string()),
                        None => (CLOSE_NORMAL, String::new()),
                    };
                    info!(conn, code, reason = %reason, "upstream closed");
                    close_client_after_upstream(&mut client_tx, code, &reason).await;
                    break;
                }
                Some(Ok(_)) => {}
                Some(Err(e)) => {
                    session.on_upstream_closed();
                    upstream_lost(&mut client_tx, conn, &e.to_string()).await;
                    break;
                }
                None => {
                    session.on_upstream_closed();
                    upstream_lost(&mut client_tx, conn, "connection lost").await;
                    break;
                }
            },

            _ = status_interval.tick() => {
                debug!(
                    conn,
                    state = ?session.state(),
                    session_id = session.session_id(),
                    model = session.model(),
                    messages = session.message_count(),
                    deferred = session.deferred_len(),
                    "session status",
                );
            }

            _ = &mut first_response_warn, if !got_first_response => {
                warn!(conn, "no upstream response within {:?} of connection open", FIRST_RESPONSE_WARN);
                got_first_response = true;
            }
        }
    }

    info!(conn, messages = session.message_count(), "session closed");
}

// ================== Connect phase ==================

enum ConnectOutcome {
    Connected(UpstreamStream),
    ClientGone,
    Failed(crate::error::Error),
}

/// Dials the upstream while buffering whatever the client sends meanwhile.
async fn connect_phase(
    upstream_config: &DoubaoUpstream,
    client_rx: &mut ClientStream,
    session: &mut Session,
    conn: &str,
) -> ConnectOutcome {
    let dial = upstream::dial_doubao(upstream_config);
    tokio::pin!(dial);

    loop {
        tokio::select! {
            result = &mut dial => {
                return match result {
                    Ok(stream) => ConnectOutcome::Connected(stream),
                    Err(e) => ConnectOutcome::Failed(e),
                };
            }
            msg = client_rx.next() => match msg {
                Some(Ok(ClientMessage::Binary(data))) => {
                    session.count_message();
                    // Gates are closed while connecting; this always defers.
                    let _ = route_audio(data.to_vec(), session);
                }
                Some(Ok(ClientMessage::Text(text))) => {
                    session.count_message();
                    let frames = handle_client_text(text.as_str(), session);
                    if !frames.is_empty() {
                        // Gates are closed during the handshake; the only
                        // frame producible here is FinishConnection.
                        debug!(conn, "client finished before upstream was ready");
                        return ConnectOutcome::ClientGone;
                    }
                }
                Some(Ok(ClientMessage::Close(_))) | None => return ConnectOutcome::ClientGone,
                Some(Ok(_)) => {}
                Some(Err(e)) => {
                    warn!(conn, error = %e, "client socket error during handshake");
                    return ConnectOutcome::ClientGone;
                }
            },
        }
    }
}

// ================== Inbound (client -> upstream) ==================

/// Translates one client JSON message into the upstream frames it implies.
fn handle_client_text(text: &str, session: &mut Session) -> Vec<OutboundFrame> {
    let command = match serde_json::from_str::<ClientCommand>(text) {
        Ok(command) => command,
        Err(e) => {
            warn!("unrecognized client message dropped: {}", e);
            return Vec::new();
        }
    };

    match command {
        ClientCommand::StartSession {
            session_id,
            system_message,
            model,
        } => match session.start_session(session_id, system_message, model) {
            Ok(Some(frame)) => vec![frame],
            Ok(None) => {
                debug!("start_session deferred until the connection is established");
                Vec::new()
            }
            Err(e) => {
                warn!("start_session failed: {}", e);
                Vec::new()
            }
        },
        ClientCommand::AudioData { data, is_last } => {
            if is_last {
                debug!("legacy audio_data chunk marked last");
            }
            match BASE64.decode(&data) {
                Ok(pcm) => route_audio(pcm, session).into_iter().collect(),
                Err(e) => {
                    warn!("invalid base64 audio dropped: {}", e);
                    Vec::new()
                }
            }
        }
        ClientCommand::TextInput { text } => match session.push_text(text) {
            Disposition::Forward(frame) => vec![frame],
            Disposition::Deferred => {
                debug!("text input deferred until the session starts");
                Vec::new()
            }
            Disposition::Dropped => {
                warn!("text input dropped, session unavailable");
                Vec::new()
            }
        },
        ClientCommand::FinishSession => session.finish_session().into_iter().collect(),
        ClientCommand::FinishConnection => vec![session.finish_connection()],
    }
}

/// Routes one audio chunk through the session gate.
fn route_audio(pcm: Vec<u8>, session: &mut Session) -> Option<OutboundFrame> {
    match session.push_audio(pcm) {
        Disposition::Forward(frame) => Some(frame),
        Disposition::Deferred => {
            debug!(deferred = session.deferred_len(), "audio deferred until the session starts");
            None
        }
        Disposition::Dropped => {
            warn!(state = ?session.state(), "audio chunk dropped");
            None
        }
    }
}

// ================== Outbound (upstream -> client) ==================

/// Demultiplexes one decoded upstream frame onto client emissions and
/// follow-up upstream frames.
fn dispatch_frame(frame: Frame, session: &mut Session) -> Vec<Action> {
    let mut actions = Vec::new();

    // Raw payloads are the TTS audio channel; forward them untouched. An
    // ack frame carries nothing else worth dispatching.
    if let Payload::Binary(bytes) = &frame.payload {
        actions.push(Action::ClientBinary(bytes.clone()));
        if frame.message_type == MessageType::ServerAck {
            return actions;
        }
    }

    if frame.message_type == MessageType::ErrorInfo {
        actions.push(Action::ClientJson(error_info_json(&frame)));
        return actions;
    }

    let Some(event) = frame.event else {
        debug!("upstream frame without event id dropped");
        return actions;
    };

    match event {
        events::CONNECTION_STARTED => {
            debug!("connection established");
            match session.on_connection_started() {
                Ok(frames) => actions.extend(frames.into_iter().map(Action::Upstream)),
                Err(e) => warn!("pending session start failed: {}", e),
            }
        }
        events::CONNECTION_FAILED => {
            actions.push(Action::ClientJson(json!({
                "type": "error",
                "error": payload_error_text(&frame),
            })));
        }
        events::SESSION_STARTED => {
            let dialog_id = frame
                .payload
                .as_json()
                .and_then(|v| v.get("dialog_id"))
                .cloned()
                .unwrap_or(Value::Null);
            let server_id = frame.session_id.clone();
            let replay = session.on_session_started(server_id.as_deref());
            info!(
                session_id = session.session_id(),
                model = session.model(),
                system_role = session.system_role(),
                replayed = replay.len(),
                "session started",
            );
            actions.push(Action::ClientJson(json!({
                "type": "session_started",
                "session_id": session.session_id(),
                "dialog_id": dialog_id,
            })));
            actions.extend(replay.into_iter().map(Action::Upstream));
        }
        events::SESSION_FAILED => {
            actions.push(Action::ClientJson(json!({
                "type": "error",
                "error": payload_error_text(&frame),
            })));
        }
        events::SESSION_FINISHED => {
            session.on_session_finished();
            debug!("session finished");
        }
        events::CONNECTION_FINISHED => debug!("connection finished"),
        events::ASR_INFO => {
            actions.push(Action::ClientJson(json!({
                "type": "speech_started",
                "question_id": payload_field(&frame, "question_id"),
            })));
        }
        events::ASR_RESPONSE => {
            actions.push(Action::ClientJson(json!({
                "type": "asr_response",
                "results": payload_field(&frame, "results"),
            })));
        }
        events::ASR_ENDED => debug!("asr turn ended"),
        events::TTS_RESPONSE => {
            // Binary TTS payloads were already forwarded above.
            if frame.payload.as_binary().is_none() {
                debug!("tts response without binary payload dropped");
            }
        }
        events::CHAT_RESPONSE => {
            actions.push(Action::ClientJson(json!({
                "type": "chat_response",
                "content": payload_field(&frame, "content"),
                "question_id": payload_field(&frame, "question_id"),
                "reply_id": payload_field(&frame, "reply_id"),
            })));
        }
        events::CHAT_ENDED => {
            actions.push(Action::ClientJson(json!({
                "type": "chat_ended",
                "question_id": payload_field(&frame, "question_id"),
                "reply_id": payload_field(&frame, "reply_id"),
            })));
        }
        other => debug!(event = other, "unhandled upstream event"),
    }

    actions
}

/// Builds the client-facing error for an ERROR_INFO frame.
fn error_info_json(frame: &Frame) -> Value {
    let details = match &frame.payload {
        Payload::Json(v) => v.clone(),
        Payload::Text(t) => Value::String(t.clone()),
        Payload::Binary(b) => Value::String(String::from_utf8_lossy(b).into_owned()),
    };

    let message = frame
        .payload
        .as_json()
        .and_then(|v| {
            v.get("error")
                .or_else(|| v.get("message"))
                .or_else(|| v.get("code"))
        })
        .map(|v| match v {
            Value::String(s) => s.clone(),
            other => other.to_string(),
        })
        .or_else(|| frame.error_code.map(|c| c.to_string()))
        .unwrap_or_else(|| "unknown".to_string());

    json!({
        "type": "error",
        "error": format!("服务器错误: {}", message),
        "details": details,
    })
}

/// Extracts a human-readable error from a failure event payload.
fn payload_error_text(frame: &Frame) -> String {
    match &frame.payload {
        Payload::Json(v) => v
            .get("error")
            .or_else(|| v.get("message"))
            .and_then(|s| s.as_str())
            .map(str::to_string)
            .unwrap_or_else(|| v.to_string()),
        Payload::Text(t) => t.clone(),
        Payload::Binary(b) => String::from_utf8_lossy(b).into_owned(),
    }
}

fn payload_field(frame: &Frame, key: &str) -> Value {
    frame
        .payload
        .as_json()
        .and_then(|v| v.get(key))
        .cloned()
        .unwrap_or(Value::Null)
}

// ================== I/O helpers ==================

async fn apply_actions(
    actions: Vec<Action>,
    client_tx: &mut ClientSink,
    up_tx: &mut UpstreamSink,
) -> Result<()> {
    for action in actions {
        match action {
            Action::ClientJson(value) => send_client_json(client_tx, &value).await?,
            Action::ClientBinary(bytes) => {
                client_tx.send(ClientMessage::Binary(bytes.into())).await?;
            }
            Action::Upstream(frame) => send_upstream(up_tx, &frame).await?,
        }
    }
    Ok(())
}

async fn send_client_json(client_tx: &mut ClientSink, value: &Value) -> Result<()> {
    let text = serde_json::to_string(value)?;
    client_tx.send(ClientMessage::Text(text.into())).await?;
    Ok(())
}

async fn send_upstream(up_tx: &mut UpstreamSink, frame: &OutboundFrame) -> Result<()> {
    let data = protocol::marshal(frame)?;
    up_tx.send(UpstreamMessage::Binary(data.into())).await?;
    Ok(())
}

async fn send_upstream_all(up_tx: &mut UpstreamSink, frames: &[OutboundFrame]) -> Result<()> {
    for frame in frames {
        send_upstream(up_tx, frame).await?;
    }
    Ok(())
}

/// Best-effort upstream teardown after the client side went away.
async fn teardown_upstream(session: &mut Session, up_tx: &mut UpstreamSink) {
    if let Some(frame) = session.finish_session() {
        if send_upstream(up_tx, &frame).await.is_err() {
            let _ = up_tx.close().await;
            return;
        }
        tokio::time::sleep(FINISH_DEFERRAL).await;
    }
    let frame = session.finish_connection();
    let _ = send_upstream(up_tx, &frame).await;
    let _ = up_tx.close().await;
}

/// Informs the client of an upstream loss, then closes its socket.
async fn upstream_lost(client_tx: &mut ClientSink, conn: &str, detail: &str) {
    warn!(conn, detail, "upstream connection lost");
    let _ = send_client_json(
        client_tx,
        &json!({"type": "error", "error": format!("服务器连接关闭: {}", detail)}),
    )
    .await;
    let _ = client_tx
        .send(ClientMessage::Close(Some(CloseFrame {
            code: CLOSE_NORMAL,
            reason: "Server connection closed".into(),
        })))
        .await;
}

/// Propagates an observed upstream close to the client. An abnormal 1006
/// must not be re-emitted; it becomes a normal closure.
async fn close_client_after_upstream(client_tx: &mut ClientSink, code: u16, reason: &str) {
    let detail = if reason.is_empty() {
        code.to_string()
    } else {
        format!("{} {}", code, reason)
    };
    let _ = send_client_json(
        client_tx,
        &json!({"type": "error", "error": format!("服务器连接关闭: {}", detail)}),
    )
    .await;

    let close_code = if code == CLOSE_ABNORMAL { CLOSE_NORMAL } else { code };
    let _ = client_tx
        .send(ClientMessage::Close(Some(CloseFrame {
            code: close_code,
            reason: "Server connection closed".into(),
        })))
        .await;
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::protocol::{flags, gzip_compress, Serialization};
    use bytes::{BufMut, BytesMut};

    fn ready_session() -> Session {
        let mut session = Session::new();
        session.upstream_connecting();
        session.upstream_open();
        session.on_connection_started().unwrap();
        session
    }

    fn active_session() -> Session {
        let mut session = ready_session();
        session
            .start_session(Some("sess-1".to_string()), None, None)
            .unwrap();
        session.on_session_started(Some("srv-abc"));
        session
    }

    fn server_json_frame(event: u32, session_id: &str, payload: Value) -> Frame {
        Frame {
            message_type: MessageType::FullServerResponse,
            flags: flags::HAS_EVENT,
            sequence: None,
            event: Some(event),
            session_id: Some(session_id.to_string()),
            error_code: None,
            payload: Payload::Json(payload),
            gzip_failed: false,
        }
    }

    #[test]
    fn server_ack_audio_is_forwarded_and_stops_dispatch() {
        let mut session = active_session();
        let frame = Frame {
            message_type: MessageType::ServerAck,
            flags: flags::HAS_EVENT,
            sequence: None,
            event: Some(events::TTS_RESPONSE),
            session_id: Some("srv-abc".to_string()),
            error_code: None,
            payload: Payload::Binary(vec![0x7f; 4800]),
            gzip_failed: false,
        };
        let actions = dispatch_frame(frame, &mut session);
        assert_eq!(actions.len(), 1);
        match &actions[0] {
            Action::ClientBinary(bytes) => assert_eq!(bytes.len(), 4800),
            other => panic!("expected binary forward, got {:?}", other),
        }
    }

    #[test]
    fn gzip_tts_frame_decodes_to_forwarded_pcm() {
        // End-to-end through the codec: gzip'd ack payload comes out as the
        // original PCM bytes.
        let pcm = vec![0x11u8; 4800];
        let mut buf = BytesMut::new();
        buf.put_u8(0x11);
        buf.put_u8((MessageType::ServerAck as u8) << 4 | flags::HAS_EVENT);
        buf.put_u8((Serialization::None as u8) << 4 | 0b0001);
        buf.put_u8(0x00);
        buf.put_u32(events::TTS_RESPONSE);
        buf.put_i32(7);
        buf.put_slice(b"srv-abc");
        let compressed = gzip_compress(&pcm).unwrap();
        buf.put_u32(compressed.len() as u32);
        buf.put_slice(&compressed);

        let frame = protocol::unmarshal(&buf).unwrap();
        let mut session = active_session();
        let actions = dispatch_frame(frame, &mut session);
        assert_eq!(actions.len(), 1);
        match &actions[0] {
            Action::ClientBinary(bytes) => assert_eq!(bytes, &pcm),
            other => panic!("expected binary forward, got {:?}", other),
        }
    }

    #[test]
    fn error_info_maps_to_client_error_without_closing() {
        let mut session = active_session();
        let frame = Frame {
            message_type: MessageType::ErrorInfo,
            flags: 0,
            sequence: None,
            event: None,
            session_id: None,
            error_code: Some(40001),
            payload: Payload::Json(json!({"error": "invalid auth"})),
            gzip_failed: false,
        };
        let actions = dispatch_frame(frame, &mut session);
        assert_eq!(actions.len(), 1);
        match &actions[0] {
            Action::ClientJson(value) => {
                assert_eq!(
                    value,
                    &json!({
                        "type": "error",
                        "error": "服务器错误: invalid auth",
                        "details": {"error": "invalid auth"},
                    })
                );
            }
            other => panic!("expected client json, got {:?}", other),
        }
        // The session is untouched; the connection stays up.
        assert!(session.session_active());
    }

    #[test]
    fn error_info_without_payload_fields_uses_error_code() {
        let mut session = active_session();
        let frame = Frame {
            message_type: MessageType::ErrorInfo,
            flags: 0,
            sequence: None,
            event: None,
            session_id: None,
            error_code: Some(55000000),
            payload: Payload::Json(json!({})),
            gzip_failed: false,
        };
        let actions = dispatch_frame(frame, &mut session);
        match &actions[0] {
            Action::ClientJson(value) => {
                assert_eq!(value["error"], "服务器错误: 55000000");
            }
            other => panic!("expected client json, got {:?}", other),
        }
    }

    #[test]
    fn session_started_adopts_id_and_replays_before_new_audio() {
        let mut session = ready_session();
        session
            .start_session(Some("client-id".to_string()), None, None)
            .unwrap();
        // Two chunks arrive before the session gate opens.
        session.push_audio(vec![1; 8]);
        session.push_audio(vec![2; 8]);

        let frame = server_json_frame(events::SESSION_STARTED, "srv-abc", json!({"dialog_id": "d-1"}));
        let actions = dispatch_frame(frame, &mut session);

        assert_eq!(session.session_id(), "srv-abc");
        assert_eq!(actions.len(), 3);
        match &actions[0] {
            Action::ClientJson(value) => {
                assert_eq!(
                    value,
                    &json!({
                        "type": "session_started",
                        "session_id": "srv-abc",
                        "dialog_id": "d-1",
                    })
                );
            }
            other => panic!("expected session_started json, got {:?}", other),
        }
        for (i, action) in actions[1..].iter().enumerate() {
            match action {
                Action::Upstream(frame) => {
                    assert_eq!(frame.event, Some(events::TASK_REQUEST));
                    assert_eq!(frame.session_id.as_deref(), Some("srv-abc"));
                    match &frame.payload {
                        crate::protocol::OutboundPayload::Binary(b) => {
                            assert_eq!(b, &vec![(i + 1) as u8; 8]);
                        }
                        other => panic!("expected audio payload, got {:?}", other),
                    }
                }
                other => panic!("expected upstream replay, got {:?}", other),
            }
        }
    }

    #[test]
    fn connection_started_releases_pending_session() {
        let mut session = Session::new();
        session.upstream_connecting();
        session.upstream_open();
        session
            .start_session(None, Some("你是助手".to_string()), Some("O2.0".to_string()))
            .unwrap();

        let frame = server_json_frame(events::CONNECTION_STARTED, "", json!({}));
        let actions = dispatch_frame(frame, &mut session);
        assert_eq!(actions.len(), 1);
        match &actions[0] {
            Action::Upstream(frame) => {
                assert_eq!(frame.event, Some(events::START_SESSION));
            }
            other => panic!("expected upstream start_session, got {:?}", other),
        }
    }

    #[test]
    fn chat_and_asr_events_map_to_client_json() {
        let mut session = active_session();

        let chat = server_json_frame(
            events::CHAT_RESPONSE,
            "srv-abc",
            json!({"content": "你好", "question_id": "q1", "reply_id": "r1"}),
        );
        match &dispatch_frame(chat, &mut session)[0] {
            Action::ClientJson(value) => assert_eq!(
                value,
                &json!({
                    "type": "chat_response",
                    "content": "你好",
                    "question_id": "q1",
                    "reply_id": "r1",
                })
            ),
            other => panic!("unexpected {:?}", other),
        }

        let ended = server_json_frame(
            events::CHAT_ENDED,
            "srv-abc",
            json!({"question_id": "q1", "reply_id": "r1"}),
        );
        match &dispatch_frame(ended, &mut session)[0] {
            Action::ClientJson(value) => assert_eq!(value["type"], "chat_ended"),
            other => panic!("unexpected {:?}", other),
        }

        let asr = server_json_frame(
            events::ASR_RESPONSE,
            "srv-abc",
            json!({"results": [{"text": "hello"}]}),
        );
        match &dispatch_frame(asr, &mut session)[0] {
            Action::ClientJson(value) => {
                assert_eq!(value["type"], "asr_response");
                assert_eq!(value["results"][0]["text"], "hello");
            }
            other => panic!("unexpected {:?}", other),
        }

        let info = server_json_frame(events::ASR_INFO, "srv-abc", json!({"question_id": "q2"}));
        match &dispatch_frame(info, &mut session)[0] {
            Action::ClientJson(value) => assert_eq!(
                value,
                &json!({"type": "speech_started", "question_id": "q2"})
            ),
            other => panic!("unexpected {:?}", other),
        }
    }

    #[test]
    fn log_only_events_emit_nothing() {
        let mut session = active_session();
        for event in [events::ASR_ENDED, events::CONNECTION_FINISHED] {
            let frame = server_json_frame(event, "srv-abc", json!({}));
            assert!(dispatch_frame(frame, &mut session).is_empty());
        }
    }

    #[test]
    fn frame_without_event_is_dropped() {
        let mut session = active_session();
        let frame = Frame {
            message_type: MessageType::FullServerResponse,
            flags: 0,
            sequence: None,
            event: None,
            session_id: Some("srv-abc".to_string()),
            error_code: None,
            payload: Payload::Json(json!({"noise": true})),
            gzip_failed: false,
        };
        assert!(dispatch_frame(frame, &mut session).is_empty());
    }

    #[test]
    fn text_input_becomes_task_request() {
        let mut session = active_session();
        let frames = handle_client_text(r#"{"type":"text_input","text":"hello"}"#, &mut session);
        assert_eq!(frames.len(), 1);
        assert_eq!(frames[0].event, Some(events::TASK_REQUEST));
        match &frames[0].payload {
            crate::protocol::OutboundPayload::Json(v) => {
                assert_eq!(v["text"], "hello");
                assert_eq!(v["input_text"], "hello");
                assert_eq!(v["input_mod"], "text");
                assert_eq!(v["input_mode"], "text");
            }
            other => panic!("expected json payload, got {:?}", other),
        }
    }

    #[test]
    fn start_session_command_uses_camel_case_keys() {
        let mut session = ready_session();
        let frames = handle_client_text(
            r#"{"type":"start_session","sessionId":"s-9","systemMessage":"你是助手","model":"O2.0"}"#,
            &mut session,
        );
        assert_eq!(frames.len(), 1);
        assert_eq!(frames[0].event, Some(events::START_SESSION));
        assert_eq!(frames[0].session_id.as_deref(), Some("s-9"));
    }

    #[test]
    fn legacy_audio_data_is_decoded_and_gated() {
        let mut session = active_session();
        let encoded = BASE64.encode([1u8, 2, 3, 4]);
        let frames = handle_client_text(
            &format!(r#"{{"type":"audio_data","data":"{}"}}"#, encoded),
            &mut session,
        );
        assert_eq!(frames.len(), 1);
        match &frames[0].payload {
            crate::protocol::OutboundPayload::Binary(b) => assert_eq!(b, &vec![1, 2, 3, 4]),
            other => panic!("expected audio payload, got {:?}", other),
        }
    }

    #[test]
    fn unknown_client_message_is_dropped() {
        let mut session = active_session();
        assert!(handle_client_text(r#"{"type":"dance"}"#, &mut session).is_empty());
        assert!(handle_client_text("not json", &mut session).is_empty());
    }

    #[test]
    fn finish_commands_emit_lifecycle_frames() {
        let mut session = active_session();
        let frames = handle_client_text(r#"{"type":"finish_session"}"#, &mut session);
        assert_eq!(frames.len(), 1);
        assert_eq!(frames[0].event, Some(events::FINISH_SESSION));

        let frames = handle_client_text(r#"{"type":"finish_connection"}"#, &mut session);
        assert_eq!(frames.len(), 1);
        assert_eq!(frames[0].event, Some(events::FINISH_CONNECTION));
        assert_eq!(frames[0].session_id, None);
    }
}
