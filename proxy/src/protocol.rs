//! Binary wire protocol of the upstream realtime dialogue service.
//!
//! Frame layout:
//! - Header (4 bytes):
//!   - (4bits) version + (4bits) header_size (units of 4 bytes)
//!   - (4bits) message_type + (4bits) flags
//!   - (4bits) serialization + (4bits) compression
//!   - (8bits) reserved
//!
//! - Body:
//!   - [flags & 0b0010] sequence (4 bytes)
//!   - [flags & 0b0100] event (4 bytes)
//!   - [server frames]  session_id (4 bytes len + data)
//!   - [error frames]   error_code (4 bytes)
//!   - payload_size (4 bytes) + payload_data
//!
//! The session_id length prefix is a *signed* int32 while payload_size is an
//! unsigned uint32; both are big-endian. This asymmetry is part of the wire
//! format and must not be normalized.

use std::io::{Cursor, Read, Write};

use bytes::{Buf, BufMut, BytesMut};
use flate2::read::GzDecoder;
use flate2::write::GzEncoder;
use flate2::Compression as GzLevel;
use tracing::warn;

use crate::error::{Error, Result};

// ================== Protocol Constants ==================

/// Protocol version nibble. Only V1 exists.
pub const PROTOCOL_VERSION: u8 = 0b0001;

/// Header size nibble, in units of 4 bytes. Always one unit.
pub const HEADER_SIZE: u8 = 0b0001;

/// Message type.
#[repr(u8)]
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum MessageType {
    #[default]
    FullClientRequest = 0b0001,
    AudioOnlyRequest = 0b0010,
    FullServerResponse = 0b1001,
    /// Also carries TTS audio; the service reuses this type as an ack.
    ServerAck = 0b1011,
    ErrorInfo = 0b1111,
}

impl MessageType {
    /// Maps a wire nibble to a message type. Unknown values are not mapped.
    pub fn from_wire(v: u8) -> Option<Self> {
        match v {
            0b0001 => Some(MessageType::FullClientRequest),
            0b0010 => Some(MessageType::AudioOnlyRequest),
            0b1001 => Some(MessageType::FullServerResponse),
            0b1011 => Some(MessageType::ServerAck),
            0b1111 => Some(MessageType::ErrorInfo),
            _ => None,
        }
    }

    /// Returns true for the two server response types that carry the
    /// session-id prefix.
    pub fn is_server_response(self) -> bool {
        matches!(self, MessageType::FullServerResponse | MessageType::ServerAck)
    }
}

/// Message flag bits. The remaining bits of the nibble are reserved.
pub mod flags {
    /// Body carries a sequence number.
    pub const HAS_SEQUENCE: u8 = 0b0010;
    /// Body carries an event id.
    pub const HAS_EVENT: u8 = 0b0100;
}

/// Serialization type.
#[repr(u8)]
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum Serialization {
    #[default]
    None = 0b0000,
    Json = 0b0001,
}

impl From<u8> for Serialization {
    fn from(v: u8) -> Self {
        match v {
            0b0001 => Serialization::Json,
            _ => Serialization::None,
        }
    }
}

/// Compression type.
#[repr(u8)]
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum Compression {
    #[default]
    None = 0b0000,
    Gzip = 0b0001,
}

impl From<u8> for Compression {
    fn from(v: u8) -> Self {
        match v {
            0b0001 => Compression::Gzip,
            _ => Compression::None,
        }
    }
}

/// Protocol event ids.
pub mod events {
    // Client -> upstream
    /// Start connection request.
    pub const START_CONNECTION: u32 = 1;
    /// Finish connection request.
    pub const FINISH_CONNECTION: u32 = 2;
    /// Start session request.
    pub const START_SESSION: u32 = 100;
    /// Finish session request.
    pub const FINISH_SESSION: u32 = 102;
    /// Task request (audio chunk or text turn).
    pub const TASK_REQUEST: u32 = 200;

    // Upstream -> client
    /// Connection started.
    pub const CONNECTION_STARTED: u32 = 50;
    /// Connection failed.
    pub const CONNECTION_FAILED: u32 = 51;
    /// Connection finished.
    pub const CONNECTION_FINISHED: u32 = 52;
    /// Session started.
    pub const SESSION_STARTED: u32 = 150;
    /// Session finished.
    pub const SESSION_FINISHED: u32 = 152;
    /// Session failed.
    pub const SESSION_FAILED: u32 = 153;
    /// TTS audio chunk.
    pub const TTS_RESPONSE: u32 = 352;
    /// Speech detected.
    pub const ASR_INFO: u32 = 450;
    /// ASR transcript.
    pub const ASR_RESPONSE: u32 = 451;
    /// ASR turn ended.
    pub const ASR_ENDED: u32 = 459;
    /// Chat text chunk.
    pub const CHAT_RESPONSE: u32 = 550;
    /// Chat turn ended.
    pub const CHAT_ENDED: u32 = 559;
}

// ================== Frames ==================

/// Decoded payload of an upstream frame.
#[derive(Debug, Clone, PartialEq)]
pub enum Payload {
    /// JSON-serialized payload that parsed cleanly.
    Json(serde_json::Value),
    /// JSON-serialized payload that did not parse; kept as text.
    Text(String),
    /// Raw bytes (serialization = None).
    Binary(Vec<u8>),
}

impl Payload {
    /// Returns the raw bytes when the payload is binary.
    pub fn as_binary(&self) -> Option<&[u8]> {
        match self {
            Payload::Binary(b) => Some(b),
            _ => None,
        }
    }

    /// Returns the parsed JSON value when the payload is JSON.
    pub fn as_json(&self) -> Option<&serde_json::Value> {
        match self {
            Payload::Json(v) => Some(v),
            _ => None,
        }
    }
}

/// A decoded upstream frame.
#[derive(Debug, Clone)]
pub struct Frame {
    pub message_type: MessageType,
    pub flags: u8,
    /// Sequence number, when flag 0b0010 was set.
    pub sequence: Option<u32>,
    /// Event id, when flag 0b0100 was set.
    pub event: Option<u32>,
    /// Session id; present on every server response frame (may be empty).
    pub session_id: Option<String>,
    /// Error code; present on ERROR_INFO frames only.
    pub error_code: Option<u32>,
    pub payload: Payload,
    /// Set when a GZIP payload failed to inflate and raw bytes were kept.
    pub gzip_failed: bool,
}

/// Payload of an outbound (client -> upstream) frame.
#[derive(Debug, Clone)]
pub enum OutboundPayload {
    Json(serde_json::Value),
    Binary(Vec<u8>),
}

/// An outbound frame prior to encoding.
#[derive(Debug, Clone)]
pub struct OutboundFrame {
    pub message_type: MessageType,
    pub flags: u8,
    pub sequence: Option<u32>,
    pub event: Option<u32>,
    pub session_id: Option<String>,
    pub payload: OutboundPayload,
    pub compress: bool,
}

impl OutboundFrame {
    /// A full-client event frame with a JSON payload.
    pub fn event_json(
        event: u32,
        session_id: Option<String>,
        payload: serde_json::Value,
    ) -> Self {
        Self {
            message_type: MessageType::FullClientRequest,
            flags: flags::HAS_EVENT,
            sequence: None,
            event: Some(event),
            session_id,
            payload: OutboundPayload::Json(payload),
            compress: true,
        }
    }

    /// An audio-only TASK_REQUEST frame carrying raw PCM.
    pub fn audio(session_id: String, pcm: Vec<u8>) -> Self {
        Self {
            message_type: MessageType::AudioOnlyRequest,
            flags: flags::HAS_EVENT,
            sequence: None,
            event: Some(events::TASK_REQUEST),
            session_id: Some(session_id),
            payload: OutboundPayload::Binary(pcm),
            compress: true,
        }
    }
}

// ================== Encode / Decode ==================

/// Encodes an outbound frame into wire bytes.
pub fn marshal(frame: &OutboundFrame) -> Result<Vec<u8>> {
    // Raw bytes keep serialization None; everything else is JSON.
    let serialization = match &frame.payload {
        OutboundPayload::Binary(_) => Serialization::None,
        OutboundPayload::Json(_) => Serialization::Json,
    };
    let compression = if frame.compress {
        Compression::Gzip
    } else {
        Compression::None
    };

    let mut buf = BytesMut::with_capacity(256);

    // Header (4 bytes)
    buf.put_u8(PROTOCOL_VERSION << 4 | HEADER_SIZE);
    buf.put_u8((frame.message_type as u8) << 4 | frame.flags);
    buf.put_u8((serialization as u8) << 4 | (compression as u8));
    buf.put_u8(0x00); // reserved

    // Body prefix fields, in strict order: sequence, event, session_id.
    if let Some(sequence) = frame.sequence {
        buf.put_u32(sequence);
    }
    if let Some(event) = frame.event {
        buf.put_u32(event);
    }
    if let Some(ref session_id) = frame.session_id {
        buf.put_i32(session_id.len() as i32);
        buf.put_slice(session_id.as_bytes());
    }

    // Payload
    let serialized = match &frame.payload {
        OutboundPayload::Binary(bytes) => bytes.clone(),
        OutboundPayload::Json(value) => serde_json::to_vec(value)?,
    };
    let payload = if frame.compress {
        gzip_compress(&serialized)?
    } else {
        serialized
    };

    buf.put_u32(payload.len() as u32);
    buf.put_slice(&payload);

    Ok(buf.to_vec())
}

/// Decodes wire bytes into a frame.
///
/// Returns `None` for under-length buffers, unknown message types and
/// truncated bodies. A corrupt GZIP payload is kept raw and flagged rather
/// than rejected.
pub fn unmarshal(data: &[u8]) -> Option<Frame> {
    if data.len() < 8 {
        return None;
    }

    let mut cursor = Cursor::new(data);

    let version_and_size = cursor.get_u8();
    let type_and_flags = cursor.get_u8();
    let ser_and_comp = cursor.get_u8();
    let _reserved = cursor.get_u8();

    let message_type = MessageType::from_wire(type_and_flags >> 4)?;
    let frame_flags = type_and_flags & 0x0f;
    let serialization = Serialization::from(ser_and_comp >> 4);
    let compression = Compression::from(ser_and_comp & 0x0f);

    // Body starts after header_size * 4 bytes.
    let header_size = (version_and_size & 0x0f) as usize;
    if header_size > 1 {
        let extra = (header_size - 1) * 4;
        if cursor.remaining() < extra {
            return None;
        }
        cursor.advance(extra);
    }

    let mut sequence = None;
    let mut event = None;
    let mut session_id = None;
    let mut error_code = None;

    match message_type {
        MessageType::FullServerResponse | MessageType::ServerAck => {
            if frame_flags & flags::HAS_SEQUENCE != 0 {
                sequence = Some(read_u32(&mut cursor)?);
            }
            if frame_flags & flags::HAS_EVENT != 0 {
                event = Some(read_u32(&mut cursor)?);
            }
            // Server responses always carry the session-id prefix; a zero
            // size yields an empty id.
            let id_size = read_i32(&mut cursor)?;
            if id_size < 0 || cursor.remaining() < id_size as usize {
                return None;
            }
            let mut id_bytes = vec![0u8; id_size as usize];
            cursor.copy_to_slice(&mut id_bytes);
            session_id = Some(String::from_utf8_lossy(&id_bytes).into_owned());
        }
        MessageType::ErrorInfo => {
            error_code = Some(read_u32(&mut cursor)?);
        }
        // Client request types never appear on the response path.
        _ => return None,
    }

    let payload_size = read_u32(&mut cursor)? as usize;
    if cursor.remaining() < payload_size {
        return None;
    }
    let mut raw = vec![0u8; payload_size];
    cursor.copy_to_slice(&mut raw);

    let mut gzip_failed = false;
    if compression == Compression::Gzip && !raw.is_empty() {
        match gzip_decompress(&raw) {
            Ok(inflated) => raw = inflated,
            Err(e) => {
                warn!("gzip inflate failed, keeping raw payload: {}", e);
                gzip_failed = true;
            }
        }
    }

    let payload = match serialization {
        Serialization::Json => match serde_json::from_slice(&raw) {
            Ok(value) => Payload::Json(value),
            Err(_) => Payload::Text(String::from_utf8_lossy(&raw).into_owned()),
        },
        Serialization::None => Payload::Binary(raw),
    };

    Some(Frame {
        message_type,
        flags: frame_flags,
        sequence,
        event,
        session_id,
        error_code,
        payload,
        gzip_failed,
    })
}

fn read_u32(cursor: &mut Cursor<&[u8]>) -> Option<u32> {
    if cursor.remaining() < 4 {
        return None;
    }
    Some(cursor.get_u32())
}

fn read_i32(cursor: &mut Cursor<&[u8]>) -> Option<i32> {
    if cursor.remaining() < 4 {
        return None;
    }
    Some(cursor.get_i32())
}

/// Gzip compress data.
pub fn gzip_compress(data: &[u8]) -> Result<Vec<u8>> {
    let mut encoder = GzEncoder::new(Vec::new(), GzLevel::default());
    encoder
        .write_all(data)
        .map_err(|e| Error::Protocol(format!("gzip compress: {}", e)))?;
    encoder
        .finish()
        .map_err(|e| Error::Protocol(format!("gzip finish: {}", e)))
}

/// Gzip decompress data.
pub fn gzip_decompress(data: &[u8]) -> Result<Vec<u8>> {
    let mut decoder = GzDecoder::new(data);
    let mut decompressed = Vec::new();
    decoder
        .read_to_end(&mut decompressed)
        .map_err(|e| Error::Protocol(format!("gzip decompress: {}", e)))?;
    Ok(decompressed)
}

#[cfg(test)]
mod tests {
    use super::*;

    /// Builds server-response wire bytes by hand, mirroring what the
    /// upstream emits.
    fn server_frame_bytes(
        msg_type: MessageType,
        frame_flags: u8,
        sequence: Option<u32>,
        event: Option<u32>,
        session_id: &str,
        serialization: Serialization,
        compression: Compression,
        payload: &[u8],
    ) -> Vec<u8> {
        let mut buf = BytesMut::new();
        buf.put_u8(PROTOCOL_VERSION << 4 | HEADER_SIZE);
        buf.put_u8((msg_type as u8) << 4 | frame_flags);
        buf.put_u8((serialization as u8) << 4 | (compression as u8));
        buf.put_u8(0x00);
        if let Some(seq) = sequence {
            buf.put_u32(seq);
        }
        if let Some(ev) = event {
            buf.put_u32(ev);
        }
        buf.put_i32(session_id.len() as i32);
        buf.put_slice(session_id.as_bytes());
        buf.put_u32(payload.len() as u32);
        buf.put_slice(payload);
        buf.to_vec()
    }

    #[test]
    fn round_trip_server_response_json_gzip() {
        let body = serde_json::json!({"dialog_id": "d-1", "results": ["你好"]});
        let raw = serde_json::to_vec(&body).unwrap();
        let compressed = gzip_compress(&raw).unwrap();
        let data = server_frame_bytes(
            MessageType::FullServerResponse,
            flags::HAS_EVENT,
            None,
            Some(events::ASR_RESPONSE),
            "srv-abc",
            Serialization::Json,
            Compression::Gzip,
            &compressed,
        );

        let frame = unmarshal(&data).expect("decodes");
        assert_eq!(frame.message_type, MessageType::FullServerResponse);
        assert_eq!(frame.event, Some(events::ASR_RESPONSE));
        assert_eq!(frame.session_id.as_deref(), Some("srv-abc"));
        assert_eq!(frame.sequence, None);
        assert!(!frame.gzip_failed);
        assert_eq!(frame.payload, Payload::Json(body));
    }

    #[test]
    fn round_trip_with_sequence_flag() {
        let data = server_frame_bytes(
            MessageType::FullServerResponse,
            flags::HAS_SEQUENCE | flags::HAS_EVENT,
            Some(7),
            Some(events::SESSION_STARTED),
            "s",
            Serialization::Json,
            Compression::None,
            b"{}",
        );
        let frame = unmarshal(&data).unwrap();
        assert_eq!(frame.sequence, Some(7));
        assert_eq!(frame.event, Some(events::SESSION_STARTED));
    }

    #[test]
    fn empty_json_payload_round_trips_with_gzip() {
        let compressed = gzip_compress(b"{}").unwrap();
        let data = server_frame_bytes(
            MessageType::FullServerResponse,
            flags::HAS_EVENT,
            None,
            Some(events::CONNECTION_STARTED),
            "",
            Serialization::Json,
            Compression::Gzip,
            &compressed,
        );
        let frame = unmarshal(&data).unwrap();
        assert_eq!(frame.payload, Payload::Json(serde_json::json!({})));
        // A zero-length session id decodes to an empty string, not an error.
        assert_eq!(frame.session_id.as_deref(), Some(""));
    }

    #[test]
    fn server_ack_audio_payload_is_binary() {
        let pcm = vec![0x55u8; 4800];
        let compressed = gzip_compress(&pcm).unwrap();
        let data = server_frame_bytes(
            MessageType::ServerAck,
            flags::HAS_EVENT,
            None,
            Some(events::TTS_RESPONSE),
            "srv-abc",
            Serialization::None,
            Compression::Gzip,
            &compressed,
        );
        let frame = unmarshal(&data).unwrap();
        assert_eq!(frame.message_type, MessageType::ServerAck);
        assert_eq!(frame.payload.as_binary().map(<[u8]>::len), Some(4800));
        assert_eq!(frame.payload, Payload::Binary(pcm));
    }

    #[test]
    fn zero_payload_size_decodes_to_empty_payload() {
        let data = server_frame_bytes(
            MessageType::ServerAck,
            0,
            None,
            None,
            "s",
            Serialization::None,
            Compression::None,
            b"",
        );
        let frame = unmarshal(&data).unwrap();
        assert_eq!(frame.payload, Payload::Binary(vec![]));
    }

    #[test]
    fn error_info_without_event_prefix() {
        let mut buf = BytesMut::new();
        buf.put_u8(PROTOCOL_VERSION << 4 | HEADER_SIZE);
        buf.put_u8((MessageType::ErrorInfo as u8) << 4);
        buf.put_u8((Serialization::Json as u8) << 4);
        buf.put_u8(0x00);
        buf.put_u32(40001); // error code
        let body = br#"{"error":"invalid auth"}"#;
        buf.put_u32(body.len() as u32);
        buf.put_slice(body);

        let frame = unmarshal(&buf).expect("error frames decode without an event");
        assert_eq!(frame.message_type, MessageType::ErrorInfo);
        assert_eq!(frame.error_code, Some(40001));
        assert_eq!(frame.event, None);
        assert_eq!(
            frame.payload,
            Payload::Json(serde_json::json!({"error": "invalid auth"}))
        );
    }

    #[test]
    fn under_length_buffer_is_rejected() {
        assert!(unmarshal(&[0x11, 0x94, 0x11]).is_none());
        assert!(unmarshal(&[]).is_none());
    }

    #[test]
    fn unknown_message_type_is_rejected() {
        let mut data = server_frame_bytes(
            MessageType::FullServerResponse,
            0,
            None,
            None,
            "",
            Serialization::Json,
            Compression::None,
            b"{}",
        );
        data[1] = 0b0101 << 4; // no such message type
        assert!(unmarshal(&data).is_none());
    }

    #[test]
    fn client_request_types_are_not_decoded() {
        let frame = OutboundFrame::event_json(events::START_CONNECTION, None, serde_json::json!({}));
        let data = marshal(&frame).unwrap();
        assert!(unmarshal(&data).is_none());
    }

    #[test]
    fn truncated_body_is_rejected() {
        let data = server_frame_bytes(
            MessageType::FullServerResponse,
            flags::HAS_EVENT,
            None,
            Some(events::SESSION_STARTED),
            "srv-abc",
            Serialization::Json,
            Compression::None,
            b"{}",
        );
        assert!(unmarshal(&data[..data.len() - 1]).is_none());
        assert!(unmarshal(&data[..9]).is_none());
    }

    #[test]
    fn corrupt_gzip_keeps_raw_bytes_and_flags_frame() {
        let data = server_frame_bytes(
            MessageType::ServerAck,
            0,
            None,
            None,
            "s",
            Serialization::None,
            Compression::Gzip,
            b"not gzip at all",
        );
        let frame = unmarshal(&data).unwrap();
        assert!(frame.gzip_failed);
        assert_eq!(frame.payload, Payload::Binary(b"not gzip at all".to_vec()));
    }

    #[test]
    fn json_parse_failure_falls_back_to_text() {
        let data = server_frame_bytes(
            MessageType::FullServerResponse,
            flags::HAS_EVENT,
            None,
            Some(events::CHAT_ENDED),
            "s",
            Serialization::Json,
            Compression::None,
            b"not json",
        );
        let frame = unmarshal(&data).unwrap();
        assert_eq!(frame.payload, Payload::Text("not json".to_string()));
    }

    #[test]
    fn marshal_orders_prefix_fields_and_compresses() {
        let frame = OutboundFrame {
            message_type: MessageType::FullClientRequest,
            flags: flags::HAS_SEQUENCE | flags::HAS_EVENT,
            sequence: Some(3),
            event: Some(events::TASK_REQUEST),
            session_id: Some("sess".to_string()),
            payload: OutboundPayload::Json(serde_json::json!({"text": "hi"})),
            compress: true,
        };
        let data = marshal(&frame).unwrap();

        assert_eq!(data[0], 0x11);
        assert_eq!(data[1], (0b0001 << 4) | 0b0110);
        assert_eq!(data[2], (0b0001 << 4) | 0b0001); // JSON + GZIP
        // sequence, then event, then session id length.
        assert_eq!(&data[4..8], &3u32.to_be_bytes());
        assert_eq!(&data[8..12], &events::TASK_REQUEST.to_be_bytes());
        assert_eq!(&data[12..16], &4i32.to_be_bytes());
        assert_eq!(&data[16..20], b"sess");

        let payload_size =
            u32::from_be_bytes([data[20], data[21], data[22], data[23]]) as usize;
        let inflated = gzip_decompress(&data[24..24 + payload_size]).unwrap();
        assert_eq!(
            serde_json::from_slice::<serde_json::Value>(&inflated).unwrap(),
            serde_json::json!({"text": "hi"})
        );
    }

    #[test]
    fn marshal_audio_uses_raw_serialization() {
        let frame = OutboundFrame::audio("sess".to_string(), vec![1, 2, 3, 4]);
        let data = marshal(&frame).unwrap();
        assert_eq!(data[1] >> 4, MessageType::AudioOnlyRequest as u8);
        assert_eq!(data[2] >> 4, Serialization::None as u8);
        assert_eq!(data[2] & 0x0f, Compression::Gzip as u8);
    }
}
