//! In-process tunnel network
//!
//! Connects local identities without real tunnels. Every attached identity
//! gets one reply endpoint (gateway = itself, random tunnel id) and one
//! delivery queue. Sends can be paused to simulate loss.

use crate::identity::CloveForwarder;
use bytes::Bytes;
use garlic_core::{
    Clove, DeliveryTarget, ElGamalPublicKey, I2npMessage, I2npPayload, IdentHash, LeaseSet,
    TunnelId,
};
use garlic_session::{
    GarlicCreationResult, KeyDirectory, ReplyEndpoint, ReplyTunnelSelector, TunnelError,
    TunnelSend,
};
use parking_lot::RwLock;
use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Arc;
use tokio::sync::mpsc;
use tracing::{debug, trace};

/// Something arriving at an identity over the loopback network
#[derive(Debug, Clone)]
pub enum Delivery {
    /// Encrypted garlic addressed to the identity
    Garlic(Bytes),
    /// A message that came out of one of the identity's inbound tunnels
    Tunnel(I2npMessage),
}

struct Node {
    public_key: ElGamalPublicKey,
    reply: ReplyEndpoint,
    queue: mpsc::UnboundedSender<Delivery>,
}

/// Shared in-process network
#[derive(Default)]
pub struct LoopbackNetwork {
    nodes: RwLock<HashMap<IdentHash, Node>>,
    paused: AtomicBool,
    tunnels_down: AtomicBool,
    delivered: AtomicU64,
    lost: AtomicU64,
}

impl LoopbackNetwork {
    pub fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }

    /// Attach an identity; returns its port and delivery queue.
    pub fn attach(
        self: &Arc<Self>,
        identity: IdentHash,
        public_key: ElGamalPublicKey,
    ) -> (LoopbackPort, mpsc::UnboundedReceiver<Delivery>) {
        let (queue, rx) = mpsc::unbounded_channel();
        let reply = ReplyEndpoint {
            gateway: identity,
            tunnel_id: TunnelId(rand::random()),
        };
        self.nodes.write().insert(
            identity,
            Node {
                public_key,
                reply,
                queue,
            },
        );
        debug!("Attached {} to loopback network", identity);
        (
            LoopbackPort {
                network: self.clone(),
                local: identity,
                reply,
            },
            rx,
        )
    }

    pub fn detach(&self, identity: &IdentHash) {
        self.nodes.write().remove(identity);
    }

    /// Silently drop every delivery while paused
    pub fn set_paused(&self, paused: bool) {
        self.paused.store(paused, Ordering::Relaxed);
    }

    /// Report no outbound or reply tunnels while down
    pub fn set_tunnels_down(&self, down: bool) {
        self.tunnels_down.store(down, Ordering::Relaxed);
    }

    pub fn delivered(&self) -> u64 {
        self.delivered.load(Ordering::Relaxed)
    }

    pub fn lost(&self) -> u64 {
        self.lost.load(Ordering::Relaxed)
    }

    fn deliver(&self, to: &IdentHash, delivery: Delivery) -> Result<(), TunnelError> {
        if self.paused.load(Ordering::Relaxed) {
            self.lost.fetch_add(1, Ordering::Relaxed);
            trace!("Dropped delivery to {} (paused)", to);
            return Ok(());
        }
        let nodes = self.nodes.read();
        let node = nodes.get(to).ok_or(TunnelError::NoLease(*to))?;
        node.queue.send(delivery).map_err(|_| TunnelError::Closed)?;
        self.delivered.fetch_add(1, Ordering::Relaxed);
        Ok(())
    }

    fn gateway_owner(&self, gateway: &IdentHash, tunnel_id: TunnelId) -> Option<IdentHash> {
        self.nodes
            .read()
            .iter()
            .find(|(_, node)| node.reply.gateway == *gateway && node.reply.tunnel_id == tunnel_id)
            .map(|(id, _)| *id)
    }
}

/// One identity's view of the loopback network
#[derive(Clone)]
pub struct LoopbackPort {
    network: Arc<LoopbackNetwork>,
    local: IdentHash,
    reply: ReplyEndpoint,
}

impl LoopbackPort {
    pub fn local(&self) -> IdentHash {
        self.local
    }

    pub fn network(&self) -> &Arc<LoopbackNetwork> {
        &self.network
    }
}

impl TunnelSend for LoopbackPort {
    fn send(
        &self,
        _lease_set: Option<&LeaseSet>,
        garlic: &GarlicCreationResult,
    ) -> Result<(), TunnelError> {
        if self.network.tunnels_down.load(Ordering::Relaxed) {
            return Err(TunnelError::NoOutboundTunnel);
        }
        self.network
            .deliver(&garlic.destination, Delivery::Garlic(garlic.wire.clone()))
    }
}

impl ReplyTunnelSelector for LoopbackPort {
    fn select_reply_tunnel(&self) -> Option<ReplyEndpoint> {
        (!self.network.tunnels_down.load(Ordering::Relaxed)).then_some(self.reply)
    }
}

impl KeyDirectory for LoopbackPort {
    fn public_key(&self, identity: &IdentHash) -> Option<ElGamalPublicKey> {
        self.network
            .nodes
            .read()
            .get(identity)
            .map(|node| node.public_key.clone())
    }
}

impl CloveForwarder for LoopbackPort {
    fn forward(&self, clove: &Clove) -> Result<(), TunnelError> {
        let message = clove.message.clone();
        match &clove.instruction.target {
            DeliveryTarget::Tunnel {
                gateway,
                tunnel_id,
            } => {
                let owner = self
                    .network
                    .gateway_owner(gateway, *tunnel_id)
                    .ok_or(TunnelError::NoLease(*gateway))?;
                self.network.deliver(&owner, Delivery::Tunnel(message))
            }
            DeliveryTarget::Destination(to) | DeliveryTarget::Router(to) => {
                let delivery = match message.payload {
                    I2npPayload::Garlic(data) => Delivery::Garlic(data),
                    _ => Delivery::Tunnel(message),
                };
                self.network.deliver(to, delivery)
            }
            DeliveryTarget::Local => Ok(()),
        }
    }
}
