//! Parley Common Library
//!
//! Shared types for the Parley voice client: the signaling protocol spoken
//! with the media server, envelope I/O, and audio format constants.

pub mod audio;
pub mod io;
pub mod protocol;
