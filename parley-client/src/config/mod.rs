//! Persisted client configuration

pub mod audio;
pub mod store;

pub use audio::{AudioSettings, RecordFormat, SpeakingMode};
pub use store::SettingsStore;
