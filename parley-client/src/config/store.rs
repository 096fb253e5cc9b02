//! Settings persistence and change notification
//!
//! Settings are stored in `config.json` under the platform config directory.
//! Every mutation writes through to disk and notifies subscribers.

use std::fs;
#[cfg(unix)]
use std::path::Path;
use std::path::PathBuf;

use tokio::sync::watch;
use tracing::{debug, warn};

use super::audio::{AudioSettings, DEFAULT_MIC_VOLUME, MAX_VOLUME, RecordFormat, SpeakingMode};
use crate::constants::{APP_DIR_NAME, CONFIG_FILE_NAME};
use crate::error::{PipelineError, PipelineResult};

/// File permissions for the settings file on Unix (owner read/write only)
#[cfg(unix)]
const SETTINGS_FILE_MODE: u32 = 0o600;

/// Owns the persisted [`AudioSettings`]
///
/// There is exactly one store per client. Graphs read from it directly; UI
/// layers observe changes through [`SettingsStore::subscribe`].
#[derive(Debug)]
pub struct SettingsStore {
    /// Where settings are saved (None keeps them in memory only)
    path: Option<PathBuf>,
    /// Current settings
    settings: AudioSettings,
    /// Change notification channel
    changes: watch::Sender<AudioSettings>,
}

impl SettingsStore {
    /// Create an in-memory store that never touches disk
    pub fn in_memory(settings: AudioSettings) -> Self {
        let (changes, _) = watch::channel(settings.clone());
        Self {
            path: None,
            settings,
            changes,
        }
    }

    /// Get the platform-specific settings file path
    ///
    /// Returns None if the config directory cannot be determined.
    pub fn settings_path() -> Option<PathBuf> {
        dirs::config_dir().map(|dir| dir.join(APP_DIR_NAME).join(CONFIG_FILE_NAME))
    }

    /// Load settings from the default location
    pub fn load() -> Self {
        match Self::settings_path() {
            Some(path) => Self::load_from(path),
            None => Self::in_memory(AudioSettings::default()),
        }
    }

    /// Load settings from a file, or fall back to defaults
    ///
    /// Defaults are used if the file doesn't exist, cannot be read, or
    /// contains invalid JSON. The path is kept for later saves either way.
    pub fn load_from(path: PathBuf) -> Self {
        let settings = if path.exists()
            && let Ok(contents) = fs::read_to_string(&path)
        {
            serde_json::from_str::<AudioSettings>(&contents).unwrap_or_else(|e| {
                warn!(path = %path.display(), error = %e, "invalid settings file, using defaults");
                AudioSettings::default()
            })
        } else {
            AudioSettings::default()
        };

        let (changes, _) = watch::channel(settings.clone());
        Self {
            path: Some(path),
            settings,
            changes,
        }
    }

    /// Current settings
    pub fn settings(&self) -> &AudioSettings {
        &self.settings
    }

    /// Subscribe to settings changes
    pub fn subscribe(&self) -> watch::Receiver<AudioSettings> {
        self.changes.subscribe()
    }

    /// Save settings to disk with restrictive permissions
    ///
    /// Creates the config directory if it doesn't exist. A store without a
    /// path saves nothing.
    pub fn save(&self) -> PipelineResult<()> {
        let Some(path) = &self.path else {
            return Ok(());
        };

        if let Some(parent) = path.parent() {
            fs::create_dir_all(parent)?;
        }

        let json = serde_json::to_string_pretty(&self.settings)
            .map_err(|e| PipelineError::Settings(e.to_string()))?;
        fs::write(path, json)?;

        #[cfg(unix)]
        Self::set_settings_permissions(path)?;

        Ok(())
    }

    /// Set settings file permissions to owner read/write only on Unix systems
    #[cfg(unix)]
    fn set_settings_permissions(path: &Path) -> PipelineResult<()> {
        use std::os::unix::fs::PermissionsExt;

        let mut perms = fs::metadata(path)?.permissions();
        perms.set_mode(SETTINGS_FILE_MODE);
        fs::set_permissions(path, perms)?;
        Ok(())
    }

    /// Apply a mutation, then persist and notify if anything changed
    fn update(&mut self, mutate: impl FnOnce(&mut AudioSettings)) {
        let before = self.settings.clone();
        mutate(&mut self.settings);
        if self.settings == before {
            return;
        }

        if let Err(e) = self.save() {
            warn!(error = %e, "failed to save settings");
        }
        self.changes.send_replace(self.settings.clone());
    }

    // =========================================================================
    // Devices
    // =========================================================================

    pub fn set_input_device(&mut self, name: &str) {
        self.update(|s| s.input_device = name.to_string());
    }

    pub fn set_output_device(&mut self, name: &str) {
        self.update(|s| s.output_device = name.to_string());
    }

    // =========================================================================
    // Volumes
    // =========================================================================

    /// Set the mic volume
    ///
    /// Zero mutes the mic and remembers the last non-zero volume so that
    /// [`SettingsStore::toggle_mic_mute`] can restore it exactly.
    pub fn set_mic_volume(&mut self, volume: u8) {
        let volume = volume.min(MAX_VOLUME);
        self.update(|s| {
            if volume == 0 {
                if s.mic_volume > 0 {
                    s.mic_volume_before_mute = s.mic_volume;
                }
                s.mic_volume = 0;
                s.mic_muted = true;
            } else {
                s.mic_volume = volume;
                s.mic_muted = false;
            }
        });
        debug!(volume, muted = self.settings.mic_muted, "mic volume changed");
    }

    /// Toggle mic mute, restoring the pre-mute volume when unmuting
    pub fn toggle_mic_mute(&mut self) {
        self.update(|s| {
            if s.mic_muted {
                s.mic_volume = if s.mic_volume_before_mute > 0 {
                    s.mic_volume_before_mute
                } else {
                    DEFAULT_MIC_VOLUME
                };
                s.mic_muted = false;
            } else {
                if s.mic_volume > 0 {
                    s.mic_volume_before_mute = s.mic_volume;
                }
                s.mic_volume = 0;
                s.mic_muted = true;
            }
        });
    }

    pub fn set_speaker_volume(&mut self, volume: u8) {
        self.update(|s| s.speaker_volume = volume.min(MAX_VOLUME));
    }

    pub fn set_mix_volume(&mut self, volume: u8) {
        self.update(|s| s.mix_volume = volume.min(MAX_VOLUME));
    }

    pub fn set_peer_volume(&mut self, user_id: &str, volume: u8) {
        self.update(|s| {
            s.peer_volumes
                .insert(user_id.to_string(), volume.min(MAX_VOLUME));
        });
    }

    // =========================================================================
    // Mute List
    // =========================================================================

    pub fn mute_user(&mut self, user_id: &str) {
        self.update(|s| {
            s.muted_users.insert(user_id.to_string());
        });
    }

    pub fn unmute_user(&mut self, user_id: &str) {
        self.update(|s| {
            s.muted_users.remove(user_id);
        });
    }

    // =========================================================================
    // Modes
    // =========================================================================

    pub fn set_record_format(&mut self, format: RecordFormat) {
        self.update(|s| s.record_format = format);
    }

    pub fn set_speaking_mode(&mut self, mode: SpeakingMode) {
        self.update(|s| s.speaking_mode = mode);
    }

    pub fn set_ptt_key(&mut self, key: &str) {
        self.update(|s| s.ptt_key = key.to_string());
    }
}

// =============================================================================
// Tests
// =============================================================================
