//! Application-wide constants
//!
//! Shared constants used across multiple modules.

/// Application directory name (used in config directory path)
pub const APP_DIR_NAME: &str = "parley";

/// Config file name
pub const CONFIG_FILE_NAME: &str = "config.json";

/// Level reporting id used for the system-audio (mix) path
pub const MIX_LEVEL_ID: &str = "mix";

/// Prefix of recording artifact file names
pub const RECORDING_FILE_PREFIX: &str = "session";
