//! Audio format constants shared by every part of the pipeline
//!
//! The pipeline runs at a single fixed format: 48kHz mono f32 samples
//! normalized to -1.0..1.0. Everything is rendered in 10ms quanta.

/// Sample rate for all pipeline audio (48kHz, required by Opus)
pub const SAMPLE_RATE: u32 = 48000;

/// Number of audio channels (mono)
pub const CHANNELS: u16 = 1;

/// Render quantum duration in milliseconds
pub const QUANTUM_DURATION_MS: u64 = 10;

/// Number of samples per render quantum at 48kHz with 10ms quanta
pub const SAMPLES_PER_QUANTUM: usize = (SAMPLE_RATE as u64 * QUANTUM_DURATION_MS / 1000) as usize;
