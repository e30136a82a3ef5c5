// src/link/error.rs
//
// Error type for the gateway's caller-facing operations. Decode-level
// corruption never surfaces here: non-finite packets fall back to text
// parsing and malformed UTF-8 is replaced, so the stream keeps flowing.

use thiserror::Error;

#[derive(Debug, Error)]
pub enum LinkError {
    /// `send` was called with no open link. No bytes were written.
    #[error("not connected")]
    NotConnected,

    /// The device could not be opened (busy, missing, or permission denied).
    #[error("failed to open {port}: {reason}")]
    OpenFailed { port: String, reason: String },

    /// A command write failed or timed out. The link may have closed
    /// underneath the caller; a fresh `connect` is the recovery path.
    #[error("command send failed: {reason}")]
    SendFailed { reason: String },

    /// Serial port enumeration failed.
    #[error("failed to enumerate serial ports: {reason}")]
    Ports { reason: String },
}
