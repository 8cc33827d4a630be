//! Per-identity registry of peer sessions
//!
//! Owns one (outbound store, delivery window) pair per remote peer, created
//! on first use. Delivery-status ids are matched against every peer, and
//! outcomes are published on a broadcast channel.

use crate::config::SessionConfig;
use crate::error::SessionError;
use crate::outbound::{GarlicCreationResult, OutboundSessionStore};
use crate::tunnel::{KeyDirectory, ReplyTunnelSelector, TunnelSend};
use crate::window::{DeliveryStatusOutcome, DeliveryTrackingWindow, RunReport};
use garlic_core::{Clove, IdentHash, LeaseSet};
use parking_lot::RwLock;
use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Instant;
use tokio::sync::broadcast;
use tracing::{debug, info};

const EVENT_CHANNEL_CAPACITY: usize = 256;

/// Session lifecycle notifications
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum SessionEvent {
    /// A tracked send was confirmed by its delivery status
    MessageAcknowledged { remote: IdentHash, tracking_id: u32 },
    /// A tag batch became usable
    TagsConfirmed {
        remote: IdentHash,
        count: usize,
        bootstrap: bool,
    },
    /// An unacknowledged bootstrap forced the session to renegotiate
    SessionReset { remote: IdentHash },
}

/// Snapshot of registry state
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct SessionStats {
    pub peers: usize,
    pub usable_tags: usize,
    pub pending_tags: usize,
    pub outstanding_sends: usize,
    pub resends: u64,
    pub resets: u64,
}

/// Outbound state for one remote peer
pub struct PeerSession {
    pub outbound: Arc<OutboundSessionStore>,
    pub window: DeliveryTrackingWindow,
}

/// Session registry for one local identity
pub struct SessionRegistry {
    local: IdentHash,
    config: SessionConfig,
    keys: Arc<dyn KeyDirectory>,
    replies: Arc<dyn ReplyTunnelSelector>,
    transport: Arc<dyn TunnelSend>,
    peers: RwLock<HashMap<IdentHash, Arc<PeerSession>>>,
    events: broadcast::Sender<SessionEvent>,
    shut_down: AtomicBool,
}

impl SessionRegistry {
    pub fn new(
        local: IdentHash,
        config: SessionConfig,
        keys: Arc<dyn KeyDirectory>,
        replies: Arc<dyn ReplyTunnelSelector>,
        transport: Arc<dyn TunnelSend>,
    ) -> Self {
        let (events, _) = broadcast::channel(EVENT_CHANNEL_CAPACITY);
        Self {
            local,
            config,
            keys,
            replies,
            transport,
            peers: RwLock::new(HashMap::new()),
            events,
            shut_down: AtomicBool::new(false),
        }
    }

    pub fn local(&self) -> IdentHash {
        self.local
    }

    pub fn config(&self) -> &SessionConfig {
        &self.config
    }

    /// Subscribe to session events
    pub fn subscribe(&self) -> broadcast::Receiver<SessionEvent> {
        self.events.subscribe()
    }

    fn ensure_running(&self) -> Result<(), SessionError> {
        if self.shut_down.load(Ordering::Acquire) {
            return Err(SessionError::ShutDown);
        }
        Ok(())
    }

    /// Session for `remote`, created on first use.
    pub fn peer(&self, remote: IdentHash) -> Result<Arc<PeerSession>, SessionError> {
        self.ensure_running()?;
        if let Some(peer) = self.peers.read().get(&remote) {
            return Ok(peer.clone());
        }

        let remote_key = self
            .keys
            .public_key(&remote)
            .ok_or(SessionError::UnknownPeer(remote))?;

        let mut peers = self.peers.write();
        let peer = peers.entry(remote).or_insert_with(|| {
            debug!("New session {} -> {}", self.local, remote);
            let outbound = Arc::new(OutboundSessionStore::new(
                remote,
                remote_key,
                self.config.clone(),
            ));
            Arc::new(PeerSession {
                window: DeliveryTrackingWindow::new(outbound.clone(), self.config.clone()),
                outbound,
            })
        });
        Ok(peer.clone())
    }

    fn snapshot(&self) -> Vec<(IdentHash, Arc<PeerSession>)> {
        self.peers
            .read()
            .iter()
            .map(|(id, peer)| (*id, peer.clone()))
            .collect()
    }

    /// Encrypt `cloves` to `remote` and hand them to the tunnel layer.
    pub fn send(
        &self,
        remote: IdentHash,
        explicit_ack: bool,
        cloves: &[Clove],
    ) -> Result<GarlicCreationResult, SessionError> {
        self.send_at(Instant::now(), remote, explicit_ack, cloves)
    }

    pub fn send_at(
        &self,
        now: Instant,
        remote: IdentHash,
        explicit_ack: bool,
        cloves: &[Clove],
    ) -> Result<GarlicCreationResult, SessionError> {
        let peer = self.peer(remote)?;
        peer.window.send_at(
            now,
            explicit_ack,
            cloves,
            self.replies.as_ref(),
            self.transport.as_ref(),
        )
    }

    /// Store a fresh lease set for its destination
    pub fn update_lease_set(&self, lease_set: LeaseSet) -> Result<(), SessionError> {
        let peer = self.peer(lease_set.destination)?;
        peer.window.update_lease_set(lease_set);
        Ok(())
    }

    /// Handle a delivery-status message id from any source.
    ///
    /// Returns the peer it matched, if any.
    pub fn delivery_status_received(
        &self,
        ack_id: u32,
    ) -> Option<(IdentHash, DeliveryStatusOutcome)> {
        self.delivery_status_received_at(ack_id, Instant::now())
    }

    pub fn delivery_status_received_at(
        &self,
        ack_id: u32,
        now: Instant,
    ) -> Option<(IdentHash, DeliveryStatusOutcome)> {
        for (remote, peer) in self.snapshot() {
            let outcome = peer.window.delivery_status(ack_id, now);
            if !outcome.matched() {
                continue;
            }
            if let Some(tags) = outcome.tags.filter(|t| t.tags_added > 0) {
                let _ = self.events.send(SessionEvent::TagsConfirmed {
                    remote,
                    count: tags.tags_added,
                    bootstrap: tags.bootstrap_confirmed,
                });
            }
            if let Some(tracking_id) = outcome.tracking_id {
                let _ = self.events.send(SessionEvent::MessageAcknowledged {
                    remote,
                    tracking_id,
                });
            }
            return Some((remote, outcome));
        }
        debug!("Delivery status {:#010x} matched no session", ack_id);
        None
    }

    /// One maintenance pass over every peer window
    pub fn run(&self) -> RunReport {
        self.run_at(Instant::now())
    }

    pub fn run_at(&self, now: Instant) -> RunReport {
        let mut total = RunReport::default();
        if self.ensure_running().is_err() {
            return total;
        }
        for (remote, peer) in self.snapshot() {
            let report =
                peer.window
                    .periodic_run_at(now, self.replies.as_ref(), self.transport.as_ref());
            if report.session_reset {
                let _ = self.events.send(SessionEvent::SessionReset { remote });
            }
            total.resent += report.resent;
            total.resend_failures += report.resend_failures;
            total.expired += report.expired;
            total.dropped += report.dropped;
            total.session_reset |= report.session_reset;
        }
        total
    }

    pub fn peer_count(&self) -> usize {
        self.peers.read().len()
    }

    pub fn stats(&self) -> SessionStats {
        self.stats_at(Instant::now())
    }

    pub fn stats_at(&self, now: Instant) -> SessionStats {
        let peers = self.snapshot();
        let mut stats = SessionStats {
            peers: peers.len(),
            ..SessionStats::default()
        };
        for (_, peer) in peers {
            stats.usable_tags += peer.outbound.usable_tags(now);
            stats.pending_tags += peer.outbound.pending_tags();
            stats.outstanding_sends += peer.window.outstanding();
            stats.resends += peer.window.total_resends();
            stats.resets += peer.window.total_resets();
        }
        stats
    }

    /// Drop every session. Later sends fail with [`SessionError::ShutDown`].
    pub fn shutdown(&self) {
        if self.shut_down.swap(true, Ordering::AcqRel) {
            return;
        }
        let peers: Vec<_> = self.peers.write().drain().collect();
        for (_, peer) in &peers {
            peer.window.clear();
        }
        info!(
            "Session registry for {} shut down ({} peers)",
            self.local,
            peers.len()
        );
    }

    pub fn is_shut_down(&self) -> bool {
        self.shut_down.load(Ordering::Acquire)
    }
}
