//! Audio settings for voice chat
//!
//! Persisted per-user configuration consumed by every graph: device
//! selection, volumes, the local mute list, recording format and the
//! speaking mode.

use std::collections::{BTreeMap, BTreeSet};

use serde::{Deserialize, Serialize};

// =============================================================================
// Constants
// =============================================================================

/// Default PTT key (backtick)
pub const DEFAULT_PTT_KEY: &str = "`";

/// System default device identifier
pub const SYSTEM_DEFAULT_DEVICE: &str = "";

/// Upper bound of every volume slider
pub const MAX_VOLUME: u8 = 100;

/// Default mic volume (maps to unity gain)
pub const DEFAULT_MIC_VOLUME: u8 = 20;

/// Default speaker, mix and per-peer volume
pub const DEFAULT_VOLUME: u8 = 100;

/// Divisor of the mic volume-to-gain mapping; volumes above it amplify
pub const MIC_GAIN_DIVISOR: f32 = 20.0;

/// Map the mic slider to a gain (volume / 20, so 100 gives 5x amplification)
pub fn mic_gain(volume: u8) -> f32 {
    volume.min(MAX_VOLUME) as f32 / MIC_GAIN_DIVISOR
}

/// Map a speaker, mix or peer slider to a gain (percent / 100)
pub fn linear_gain(volume: u8) -> f32 {
    volume.min(MAX_VOLUME) as f32 / 100.0
}

// =============================================================================
// Speaking Mode
// =============================================================================

/// How the outbound microphone track is gated
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum SpeakingMode {
    /// Always transmitting; gating is left to the server and peers
    #[default]
    Automatic,
    /// Transmit only while the push-to-talk key is held
    PushToTalk,
}

// =============================================================================
// Record Format
// =============================================================================

/// File format of recording artifacts
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum RecordFormat {
    /// 16-bit PCM WAV
    #[default]
    Wav,
    /// 32-bit float WAV
    WavFloat,
}

impl RecordFormat {
    /// MIME type tagged on the recording session
    pub fn mime_type(self) -> &'static str {
        match self {
            RecordFormat::Wav => "audio/wav",
            RecordFormat::WavFloat => "audio/wav;codecs=float",
        }
    }

    /// File extension of the artifact
    pub fn extension(self) -> &'static str {
        "wav"
    }
}

// =============================================================================
// Audio Settings
// =============================================================================

/// Audio settings for voice chat
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct AudioSettings {
    /// Input device name (empty string = system default)
    pub input_device: String,

    /// Output device name (empty string = system default)
    pub output_device: String,

    /// Microphone volume, 0-100 (gain = volume / 20)
    pub mic_volume: u8,

    /// Whether the microphone is muted (set when the volume reaches zero)
    pub mic_muted: bool,

    /// Last non-zero mic volume, restored when unmuting
    pub mic_volume_before_mute: u8,

    /// Master speaker volume, 0-100
    pub speaker_volume: u8,

    /// System audio (mix mode) volume, 0-100
    pub mix_volume: u8,

    /// Per-peer playback volume, keyed by user id
    pub peer_volumes: BTreeMap<String, u8>,

    /// Users muted locally
    pub muted_users: BTreeSet<String>,

    /// Recording artifact format
    pub record_format: RecordFormat,

    /// Automatic or push-to-talk transmission
    pub speaking_mode: SpeakingMode,

    /// Push-to-talk key binding
    pub ptt_key: String,
}

impl Default for AudioSettings {
    fn default() -> Self {
        Self {
            input_device: SYSTEM_DEFAULT_DEVICE.to_string(),
            output_device: SYSTEM_DEFAULT_DEVICE.to_string(),
            mic_volume: DEFAULT_MIC_VOLUME,
            mic_muted: false,
            mic_volume_before_mute: DEFAULT_MIC_VOLUME,
            speaker_volume: DEFAULT_VOLUME,
            mix_volume: DEFAULT_VOLUME,
            peer_volumes: BTreeMap::new(),
            muted_users: BTreeSet::new(),
            record_format: RecordFormat::default(),
            speaking_mode: SpeakingMode::default(),
            ptt_key: DEFAULT_PTT_KEY.to_string(),
        }
    }
}

impl AudioSettings {
    /// Check if using system default input device
    pub fn is_default_input(&self) -> bool {
        self.input_device.is_empty()
    }

    /// Check if using system default output device
    pub fn is_default_output(&self) -> bool {
        self.output_device.is_empty()
    }

    /// Check if a peer is in the local mute list
    pub fn is_user_muted(&self, user_id: &str) -> bool {
        self.muted_users.contains(user_id)
    }

    /// Playback volume of a peer (defaults to 100)
    pub fn peer_volume(&self, user_id: &str) -> u8 {
        self.peer_volumes
            .get(user_id)
            .copied()
            .unwrap_or(DEFAULT_VOLUME)
    }
}

// =============================================================================
// Tests
// =============================================================================
