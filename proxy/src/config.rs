//! Upstream credentials and session configuration.
//!
//! Credentials come from the process environment; the session configuration
//! is the JSON body of the StartSession event, built from the client's
//! `start_session` control message plus fixed audio defaults.

use serde::{Deserialize, Serialize};

use crate::error::{Error, Result};

/// Doubao realtime dialogue endpoint.
pub const DOUBAO_DIALOGUE_URL: &str =
    "wss://openspeech.bytedance.com/api/v3/realtime/dialogue";

/// GLM realtime endpoint.
pub const GLM_REALTIME_URL: &str = "wss://open.bigmodel.cn/api/paas/v4/realtime";

/// Resource id of the realtime dialogue service.
pub const RESOURCE_DIALOGUE: &str = "volc.speech.dialog";

/// Fixed X-Api-App-Key for the realtime dialogue API. A documented constant,
/// not a user credential.
pub const APP_KEY_DIALOGUE: &str = "PlgvMymc7f3tQnJ6";

/// Default dialogue model.
pub const DEFAULT_MODEL: &str = "O2.0";

/// Default TTS speaker voice.
pub const DEFAULT_SPEAKER: &str = "zh_female_vv_jupiter_bigtts";

/// Default bot display name.
pub const DEFAULT_BOT_NAME: &str = "豆包";

// ================== Credentials ==================

/// Doubao upstream connection settings.
#[derive(Debug, Clone)]
pub struct DoubaoUpstream {
    /// WebSocket URL of the dialogue endpoint.
    pub ws_url: String,
    pub app_id: String,
    pub access_key: String,
    /// Loaded and validated alongside the other credentials; the dialogue
    /// handshake itself does not consume it.
    pub secret_key: String,
}

impl DoubaoUpstream {
    /// Reads `DOUBAO_APP_ID`, `DOUBAO_ACCESS_KEY` and `DOUBAO_SECRET_KEY`
    /// from the environment.
    pub fn from_env() -> Result<Self> {
        Ok(Self {
            ws_url: DOUBAO_DIALOGUE_URL.to_string(),
            app_id: require_env("DOUBAO_APP_ID")?,
            access_key: require_env("DOUBAO_ACCESS_KEY")?,
            secret_key: require_env("DOUBAO_SECRET_KEY")?,
        })
    }
}

/// GLM upstream connection settings.
#[derive(Debug, Clone)]
pub struct GlmUpstream {
    /// WebSocket URL of the realtime endpoint.
    pub ws_url: String,
    /// Sent verbatim as the `Authorization` header.
    pub api_key: String,
}

impl GlmUpstream {
    /// Reads `API_KEY` from the environment.
    pub fn from_env() -> Result<Self> {
        Ok(Self {
            ws_url: GLM_REALTIME_URL.to_string(),
            api_key: require_env("API_KEY")?,
        })
    }
}

fn require_env(name: &str) -> Result<String> {
    match std::env::var(name) {
        Ok(v) if !v.is_empty() => Ok(v),
        _ => Err(Error::Config(format!(
            "missing required environment variable {}",
            name
        ))),
    }
}

// ================== Session Configuration ==================

/// StartSession payload: ASR, TTS and dialog options.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct SessionConfig {
    #[serde(default)]
    pub asr: AsrConfig,
    #[serde(default)]
    pub tts: TtsConfig,
    #[serde(default)]
    pub dialog: DialogConfig,
}

/// ASR options.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct AsrConfig {
    #[serde(default)]
    pub extra: AsrExtra,
}

/// ASR tuning knobs.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AsrExtra {
    /// End-of-speech smoothing window in milliseconds.
    #[serde(default = "default_end_smooth_window_ms")]
    pub end_smooth_window_ms: u32,
    #[serde(default)]
    pub enable_custom_vad: bool,
    #[serde(default)]
    pub enable_two_pass: bool,
}

fn default_end_smooth_window_ms() -> u32 {
    1500
}

impl Default for AsrExtra {
    fn default() -> Self {
        Self {
            end_smooth_window_ms: 1500,
            enable_custom_vad: false,
            enable_two_pass: false,
        }
    }
}

/// TTS options.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TtsConfig {
    /// Speaker voice.
    #[serde(default = "default_speaker")]
    pub speaker: String,
    #[serde(default)]
    pub audio_config: AudioConfig,
}

fn default_speaker() -> String {
    DEFAULT_SPEAKER.to_string()
}

impl Default for TtsConfig {
    fn default() -> Self {
        Self {
            speaker: default_speaker(),
            audio_config: AudioConfig::default(),
        }
    }
}

/// Output audio parameters.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AudioConfig {
    /// Number of channels.
    #[serde(default = "default_channel")]
    pub channel: i32,
    /// Audio format; raw signed 16-bit little-endian PCM.
    #[serde(default = "default_format")]
    pub format: String,
    /// Sample rate in Hz.
    #[serde(default = "default_sample_rate")]
    pub sample_rate: i32,
}

fn default_channel() -> i32 {
    1
}
fn default_format() -> String {
    "pcm_s16le".to_string()
}
fn default_sample_rate() -> i32 {
    24000
}

impl Default for AudioConfig {
    fn default() -> Self {
        Self {
            channel: 1,
            format: "pcm_s16le".to_string(),
            sample_rate: 24000,
        }
    }
}

/// Dialog options.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DialogConfig {
    /// Dialogue model identifier.
    #[serde(default = "default_model")]
    pub model: String,
    /// Bot display name.
    #[serde(default = "default_bot_name")]
    pub bot_name: String,
    /// System role prompt.
    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub system_role: String,
    /// Speaking style.
    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub speaking_style: String,
    #[serde(default)]
    pub extra: DialogExtra,
}

fn default_model() -> String {
    DEFAULT_MODEL.to_string()
}
fn default_bot_name() -> String {
    DEFAULT_BOT_NAME.to_string()
}

impl Default for DialogConfig {
    fn default() -> Self {
        Self {
            model: default_model(),
            bot_name: default_bot_name(),
            system_role: String::new(),
            speaking_style: String::new(),
            extra: DialogExtra::default(),
        }
    }
}

/// Dialog tuning knobs.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DialogExtra {
    #[serde(default)]
    pub strict_audit: bool,
    /// Input modality.
    #[serde(default = "default_input_mod")]
    pub input_mod: String,
    /// Receive timeout in seconds.
    #[serde(default = "default_recv_timeout")]
    pub recv_timeout: u32,
}

fn default_input_mod() -> String {
    "audio".to_string()
}
fn default_recv_timeout() -> u32 {
    10
}

impl Default for DialogExtra {
    fn default() -> Self {
        Self {
            strict_audit: false,
            input_mod: "audio".to_string(),
            recv_timeout: 10,
        }
    }
}

impl SessionConfig {
    /// Builds the configuration for a client-requested session.
    pub fn for_client(system_message: Option<String>, model: Option<String>) -> Self {
        let mut config = Self::default();
        if let Some(system_role) = system_message {
            config.dialog.system_role = system_role;
        }
        if let Some(model) = model {
            if !model.is_empty() {
                config.dialog.model = model;
            }
        }
        config
    }
}
