//! Interfaces to the collaborators this layer does not implement
//!
//! Tunnel building, transports and the network database live elsewhere; the
//! session layer only sees them through these traits.

use crate::error::TunnelError;
use crate::outbound::GarlicCreationResult;
use garlic_core::{ElGamalPublicKey, IdentHash, LeaseSet, TunnelId};

/// Inbound tunnel endpoint that acknowledgments are routed back through
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct ReplyEndpoint {
    /// Gateway router of one of our inbound tunnels
    pub gateway: IdentHash,
    /// Tunnel id at that gateway
    pub tunnel_id: TunnelId,
}

/// Routes a finished garlic message out through an outbound tunnel.
///
/// Implementations must not block on network I/O.
pub trait TunnelSend: Send + Sync {
    fn send(
        &self,
        lease_set: Option<&LeaseSet>,
        garlic: &GarlicCreationResult,
    ) -> Result<(), TunnelError>;
}

/// Chooses an inbound tunnel for acknowledgments
pub trait ReplyTunnelSelector: Send + Sync {
    fn select_reply_tunnel(&self) -> Option<ReplyEndpoint>;
}

/// Looks up remote ElGamal encryption keys
pub trait KeyDirectory: Send + Sync {
    fn public_key(&self, identity: &IdentHash) -> Option<ElGamalPublicKey>;
}

impl<F> ReplyTunnelSelector for F
where
    F: Fn() -> Option<ReplyEndpoint> + Send + Sync,
{
    fn select_reply_tunnel(&self) -> Option<ReplyEndpoint> {
        self()
    }
}
