//! I/O utilities for sending and receiving signaling envelopes
//!
//! This module provides the interface between the protocol message types
//! and the wire format: one JSON-encoded [`Envelope`] per line.

use std::io;

use tokio::io::{AsyncBufRead, AsyncBufReadExt, AsyncReadExt, AsyncWrite, AsyncWriteExt};

use crate::protocol::Envelope;

/// Maximum length of a single envelope line in bytes (1MB)
pub const MAX_LINE_LENGTH: usize = 1024 * 1024;

/// Read the next envelope from a buffered reader
///
/// Returns `Ok(None)` if the connection is cleanly closed. Blank lines are
/// skipped.
///
/// # Errors
///
/// Returns an error if the line exceeds [`MAX_LINE_LENGTH`], is not valid
/// JSON, or an I/O error occurs.
pub async fn read_envelope<R>(reader: &mut R) -> io::Result<Option<Envelope>>
where
    R: AsyncBufRead + Unpin,
{
    let mut line = Vec::new();
    loop {
        line.clear();
        let read = (&mut *reader)
            .take(MAX_LINE_LENGTH as u64 + 1)
            .read_until(b'\n', &mut line)
            .await?;

        if read == 0 {
            return Ok(None);
        }

        if line.len() > MAX_LINE_LENGTH {
            return Err(io::Error::new(
                io::ErrorKind::InvalidData,
                "envelope exceeds maximum line length",
            ));
        }

        let trimmed = line.trim_ascii();
        if trimmed.is_empty() {
            continue;
        }

        return serde_json::from_slice(trimmed)
            .map(Some)
            .map_err(|e| io::Error::new(io::ErrorKind::InvalidData, e));
    }
}

/// Write an envelope as a single line and flush
pub async fn write_envelope<W>(writer: &mut W, envelope: &Envelope) -> io::Result<()>
where
    W: AsyncWrite + Unpin,
{
    let mut bytes = serde_json::to_vec(envelope).map_err(io::Error::other)?;
    bytes.push(b'\n');
    writer.write_all(&bytes).await?;
    writer.flush().await
}
