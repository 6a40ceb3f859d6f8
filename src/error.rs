//! Crate-wide error taxonomy.

use thiserror::Error;

/// Errors raised by building, signing, uploading, and publishing.
///
/// Per-relay and per-upload transport failures are normally folded into
/// result structures so sibling endpoints keep going; the variants here
/// surface when a single failure must abort the whole run.
#[derive(Debug, Error)]
pub enum Error {
    /// Malformed signer descriptor, key encoding, or URL. Fatal before any
    /// network I/O happens.
    #[error("validation: {0}")]
    Validation(String),

    /// Relay or upload I/O failure.
    #[error("transport: {0}")]
    Transport(String),

    /// Post-signing verification failed or a signer returned an unexpected
    /// pubkey. Fatal for the event set.
    #[error("signature rejected: {0}")]
    SignatureRejected(String),

    /// A signer approval or network operation missed its deadline.
    #[error("timed out: {0}")]
    Timeout(String),

    /// The caller cancelled the operation.
    #[error("cancelled")]
    Cancelled,
}

pub type Result<T> = std::result::Result<T, Error>;

impl Error {
    /// Classify an I/O-layer error as transport.
    pub fn transport(e: impl std::fmt::Display) -> Self {
        Error::Transport(e.to_string())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn display_includes_category() {
        assert!(Error::Validation("bad key".into())
            .to_string()
            .starts_with("validation:"));
        assert!(Error::Transport("refused".into())
            .to_string()
            .starts_with("transport:"));
        assert_eq!(Error::Cancelled.to_string(), "cancelled");
    }
}
