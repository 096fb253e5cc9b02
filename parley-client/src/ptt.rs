//! Push-to-talk (PTT) handling
//!
//! Global hotkey support for push-to-talk using the global-hotkey crate.
//! Hotkey events are polled off the crate's global receiver and forwarded
//! into the pipeline, which gates the outbound track while the key is held.

use std::time::Duration;

use crossbeam_channel::TryRecvError;
use global_hotkey::hotkey::{Code, HotKey, Modifiers};
use global_hotkey::{GlobalHotKeyEvent, GlobalHotKeyManager, HotKeyState};
use tokio::sync::mpsc;
use tracing::{debug, warn};

use crate::error::{PipelineError, PipelineResult};

// =============================================================================
// Constants
// =============================================================================

/// Poll interval for checking hotkey events (milliseconds)
const PTT_POLL_INTERVAL_MS: u64 = 10;

// =============================================================================
// PTT State
// =============================================================================

/// Current state of push-to-talk
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum PttState {
    /// Not transmitting
    #[default]
    Idle,
    /// Key held, transmitting
    Transmitting,
}

impl PttState {
    pub fn is_transmitting(self) -> bool {
        self == PttState::Transmitting
    }
}

/// Hold-state tracking, independent of the OS hotkey registration
#[derive(Debug, Default)]
struct HoldTracker {
    active: bool,
    in_voice: bool,
}

impl HoldTracker {
    fn set_in_voice(&mut self, in_voice: bool) -> Option<PttState> {
        self.in_voice = in_voice;
        if !in_voice && self.active {
            self.active = false;
            return Some(PttState::Idle);
        }
        None
    }

    fn apply(&mut self, state: HotKeyState) -> Option<PttState> {
        if !self.in_voice {
            return None;
        }
        match state {
            HotKeyState::Pressed if !self.active => {
                self.active = true;
                Some(PttState::Transmitting)
            }
            HotKeyState::Released if self.active => {
                self.active = false;
                Some(PttState::Idle)
            }
            _ => None,
        }
    }
}

// =============================================================================
// PTT Manager
// =============================================================================

/// Manages push-to-talk hotkey registration and hold state
pub struct PttManager {
    /// The global hotkey manager
    manager: GlobalHotKeyManager,
    /// Currently registered hotkey
    hotkey: Option<HotKey>,
    tracker: HoldTracker,
}

impl PttManager {
    /// Create a new PTT manager
    ///
    /// Fails if the platform hotkey system cannot be initialized (for
    /// example, no display server).
    pub fn new() -> PipelineResult<Self> {
        let manager = GlobalHotKeyManager::new()
            .map_err(|e| PipelineError::Device(format!("Failed to initialize hotkey manager: {}", e)))?;

        Ok(Self {
            manager,
            hotkey: None,
            tracker: HoldTracker::default(),
        })
    }

    /// Register the PTT hotkey
    ///
    /// # Arguments
    /// * `key` - Key name (e.g., "`", "F1", "Space")
    pub fn register_hotkey(&mut self, key: &str) -> PipelineResult<()> {
        self.unregister_hotkey();

        let code = parse_key_code(key)?;
        let hotkey = HotKey::new(Some(Modifiers::empty()), code);

        self.manager
            .register(hotkey)
            .map_err(|e| PipelineError::Device(format!("Failed to register hotkey: {}", e)))?;

        debug!(key, "push-to-talk hotkey registered");
        self.hotkey = Some(hotkey);
        Ok(())
    }

    /// Unregister the current PTT hotkey
    pub fn unregister_hotkey(&mut self) {
        if let Some(hotkey) = self.hotkey.take()
            && let Err(e) = self.manager.unregister(hotkey)
        {
            warn!(error = %e, "failed to unregister hotkey");
        }
    }

    /// Set whether we're in a voice session
    ///
    /// Outside a session the hotkey is ignored. Leaving while the key is
    /// held returns [`PttState::Idle`].
    pub fn set_in_voice(&mut self, in_voice: bool) -> Option<PttState> {
        self.tracker.set_in_voice(in_voice)
    }

    /// Handle a hotkey event
    ///
    /// # Returns
    /// * `Some(PttState)` - State changed, caller should act on it
    /// * `None` - Not our hotkey or no state change
    pub fn handle_event(&mut self, event: GlobalHotKeyEvent) -> Option<PttState> {
        let hotkey = self.hotkey?;
        if event.id() != hotkey.id() {
            return None;
        }
        self.tracker.apply(event.state())
    }
}

impl Drop for PttManager {
    fn drop(&mut self) {
        self.unregister_hotkey();
    }
}

// =============================================================================
// Event Loop
// =============================================================================

/// Forward global hotkey events to `output` until it closes
///
/// The global receiver is a crossbeam channel; it is polled with a short
/// sleep so the task stays cancellable.
pub async fn ptt_event_loop(output: mpsc::UnboundedSender<GlobalHotKeyEvent>) {
    let receiver = GlobalHotKeyEvent::receiver();

    loop {
        match receiver.try_recv() {
            Ok(event) => {
                if output.send(event).is_err() {
                    break;
                }
            }
            Err(TryRecvError::Empty) => {
                if output.is_closed() {
                    break;
                }
                tokio::time::sleep(Duration::from_millis(PTT_POLL_INTERVAL_MS)).await;
            }
            Err(TryRecvError::Disconnected) => break,
        }
    }
}

// =============================================================================
// Key Code Parsing
// =============================================================================

/// Parse a key name to a [`Code`]
///
/// Accepts the character itself for punctuation and alphanumerics, plus
/// the usual names ("Space", "F5", "KeyA", "Numpad3"). Case-insensitive.
pub fn parse_key_code(key: &str) -> PipelineResult<Code> {
    let code = match key.to_lowercase().as_str() {
        // Special characters
        "`" | "backquote" | "grave" => Code::Backquote,
        "-" | "minus" => Code::Minus,
        "=" | "equal" => Code::Equal,
        "[" | "bracketleft" => Code::BracketLeft,
        "]" | "bracketright" => Code::BracketRight,
        "\\" | "backslash" => Code::Backslash,
        ";" | "semicolon" => Code::Semicolon,
        "'" | "quote" => Code::Quote,
        "," | "comma" => Code::Comma,
        "." | "period" => Code::Period,
        "/" | "slash" => Code::Slash,

        // Function keys
        "f1" => Code::F1,
        "f2" => Code::F2,
        "f3" => Code::F3,
        "f4" => Code::F4,
        "f5" => Code::F5,
        "f6" => Code::F6,
        "f7" => Code::F7,
        "f8" => Code::F8,
        "f9" => Code::F9,
        "f10" => Code::F10,
        "f11" => Code::F11,
        "f12" => Code::F12,

        // Number keys
        "0" | "digit0" => Code::Digit0,
        "1" | "digit1" => Code::Digit1,
        "2" | "digit2" => Code::Digit2,
        "3" | "digit3" => Code::Digit3,
        "4" | "digit4" => Code::Digit4,
        "5" | "digit5" => Code::Digit5,
        "6" | "digit6" => Code::Digit6,
        "7" | "digit7" => Code::Digit7,
        "8" | "digit8" => Code::Digit8,
        "9" | "digit9" => Code::Digit9,

        // Letter keys
        "a" | "keya" => Code::KeyA,
        "b" | "keyb" => Code::KeyB,
        "c" | "keyc" => Code::KeyC,
        "d" | "keyd" => Code::KeyD,
        "e" | "keye" => Code::KeyE,
        "f" | "keyf" => Code::KeyF,
        "g" | "keyg" => Code::KeyG,
        "h" | "keyh" => Code::KeyH,
        "i" | "keyi" => Code::KeyI,
        "j" | "keyj" => Code::KeyJ,
        "k" | "keyk" => Code::KeyK,
        "l" | "keyl" => Code::KeyL,
        "m" | "keym" => Code::KeyM,
        "n" | "keyn" => Code::KeyN,
        "o" | "keyo" => Code::KeyO,
        "p" | "keyp" => Code::KeyP,
        "q" | "keyq" => Code::KeyQ,
        "r" | "keyr" => Code::KeyR,
        "s" | "keys" => Code::KeyS,
        "t" | "keyt" => Code::KeyT,
        "u" | "keyu" => Code::KeyU,
        "v" | "keyv" => Code::KeyV,
        "w" | "keyw" => Code::KeyW,
        "x" | "keyx" => Code::KeyX,
        "y" | "keyy" => Code::KeyY,
        "z" | "keyz" => Code::KeyZ,

        // Control keys
        "space" => Code::Space,
        "enter" | "return" => Code::Enter,
        "tab" => Code::Tab,
        "capslock" => Code::CapsLock,
        "insert" => Code::Insert,
        "home" => Code::Home,
        "end" => Code::End,
        "pageup" => Code::PageUp,
        "pagedown" => Code::PageDown,
        "pause" => Code::Pause,
        "scrolllock" => Code::ScrollLock,

        // Arrow keys
        "arrowup" | "up" => Code::ArrowUp,
        "arrowdown" | "down" => Code::ArrowDown,
        "arrowleft" | "left" => Code::ArrowLeft,
        "arrowright" | "right" => Code::ArrowRight,

        // Numpad keys
        "numpad0" => Code::Numpad0,
        "numpad1" => Code::Numpad1,
        "numpad2" => Code::Numpad2,
        "numpad3" => Code::Numpad3,
        "numpad4" => Code::Numpad4,
        "numpad5" => Code::Numpad5,
        "numpad6" => Code::Numpad6,
        "numpad7" => Code::Numpad7,
        "numpad8" => Code::Numpad8,
        "numpad9" => Code::Numpad9,
        "numpadadd" | "numpad+" => Code::NumpadAdd,
        "numpadsubtract" | "numpad-" => Code::NumpadSubtract,
        "numpadmultiply" | "numpad*" => Code::NumpadMultiply,
        "numpaddivide" | "numpad/" => Code::NumpadDivide,
        "numpaddecimal" | "numpad." => Code::NumpadDecimal,
        "numpadenter" => Code::NumpadEnter,

        _ => {
            return Err(PipelineError::Settings(format!("Unknown key code: {}", key)));
        }
    };

    Ok(code)
}

// =============================================================================
// Tests
// =============================================================================

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_key_code_special() {
        assert_eq!(parse_key_code("`").unwrap(), Code::Backquote);
        assert_eq!(parse_key_code("grave").unwrap(), Code::Backquote);
        assert_eq!(parse_key_code("-").unwrap(), Code::Minus);
        assert_eq!(parse_key_code("/").unwrap(), Code::Slash);
    }

    #[test]
    fn test_parse_key_code_case_insensitive() {
        assert_eq!(parse_key_code("F1").unwrap(), Code::F1);
        assert_eq!(parse_key_code("f12").unwrap(), Code::F12);
        assert_eq!(parse_key_code("A").unwrap(), Code::KeyA);
        assert_eq!(parse_key_code("KeyZ").unwrap(), Code::KeyZ);
        assert_eq!(parse_key_code("Space").unwrap(), Code::Space);
        assert_eq!(parse_key_code("Numpad+").unwrap(), Code::NumpadAdd);
    }

    #[test]
    fn test_parse_key_code_invalid() {
        assert!(matches!(
            parse_key_code("hyper"),
            Err(PipelineError::Settings(_))
        ));
        assert!(parse_key_code("").is_err());
    }

    #[test]
    fn test_hold_tracker_press_release() {
        let mut tracker = HoldTracker::default();
        assert_eq!(tracker.apply(HotKeyState::Pressed), None);

        tracker.set_in_voice(true);
        assert_eq!(tracker.apply(HotKeyState::Pressed), Some(PttState::Transmitting));
        // Key repeat while held
        assert_eq!(tracker.apply(HotKeyState::Pressed), None);
        assert_eq!(tracker.apply(HotKeyState::Released), Some(PttState::Idle));
        assert_eq!(tracker.apply(HotKeyState::Released), None);
    }

    #[test]
    fn test_leaving_voice_releases_key() {
        let mut tracker = HoldTracker::default();
        tracker.set_in_voice(true);
        tracker.apply(HotKeyState::Pressed);

        assert_eq!(tracker.set_in_voice(false), Some(PttState::Idle));
        assert_eq!(tracker.set_in_voice(false), None);
    }

    #[test]
    fn test_ptt_state_default() {
        assert_eq!(PttState::default(), PttState::Idle);
        assert!(PttState::Transmitting.is_transmitting());
    }
}
