//! Session layer errors

use garlic_core::IdentHash;
use thiserror::Error;

/// Failures of the external tunnel-send primitive
#[derive(Debug, Error)]
pub enum TunnelError {
    #[error("No outbound tunnel available")]
    NoOutboundTunnel,
    #[error("No usable lease for {0}")]
    NoLease(IdentHash),
    #[error("Transport closed")]
    Closed,
}

/// Errors surfaced by `send`/`encrypt`.
///
/// Inbound decryption never returns these; it yields `None` instead.
#[derive(Debug, Error)]
pub enum SessionError {
    #[error("No reply tunnel available for acknowledgments")]
    NoReplyTunnel,
    #[error("No public key known for {0}")]
    UnknownPeer(IdentHash),
    #[error("Tunnel send failed: {0}")]
    Transport(#[from] TunnelError),
    #[error("Codec error: {0}")]
    Codec(#[from] garlic_core::Error),
    #[error("Tag pool emptied while locked")]
    NoUsableTag,
    #[error("Session registry shut down")]
    ShutDown,
}

impl SessionError {
    /// Connectivity failures: nothing was sent and nothing will be retried
    pub fn is_connectivity(&self) -> bool {
        matches!(self, Self::NoReplyTunnel | Self::Transport(_))
    }
}
