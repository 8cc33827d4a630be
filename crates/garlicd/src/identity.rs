//! Local identity: owns the session registry and the inbound store
//!
//! Delivery-status ids arrive from two places and feed one handler:
//! - tunnel level: a DeliveryStatus message that came straight out of one of
//!   our inbound tunnels
//! - provider level: a DeliveryStatus clove found inside decrypted garlic
//!
//! Both are plain mpsc queues drained by the same task.

use crate::keys::NodeKeys;
use crate::loopback::Delivery;
use bytes::Bytes;
use garlic_core::{Clove, DeliveryInstruction, DeliveryTarget, I2npMessage, I2npPayload, IdentHash};
use garlic_session::{
    GarlicCreationResult, InboundSessionStore, InboundStats, KeyDirectory, ReplyTunnelSelector,
    SessionConfig, SessionError, SessionEvent, SessionRegistry, SessionStats, TunnelError,
    TunnelSend,
};
use parking_lot::Mutex;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use tokio::sync::{broadcast, mpsc};
use tokio::task::JoinHandle;
use tokio::time::interval;
use tracing::{debug, info, warn};

/// Garlic nested deeper than this is dropped
const MAX_GARLIC_NESTING: usize = 4;

/// Delivers cloves addressed to other routers, destinations or tunnels
pub trait CloveForwarder: Send + Sync {
    fn forward(&self, clove: &Clove) -> Result<(), TunnelError>;
}

/// External collaborators of one identity
#[derive(Clone)]
pub struct Collaborators {
    pub keys: Arc<dyn KeyDirectory>,
    pub replies: Arc<dyn ReplyTunnelSelector>,
    pub transport: Arc<dyn TunnelSend>,
    pub forwarder: Option<Arc<dyn CloveForwarder>>,
}

/// Application payload received by an identity
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct AppMessage {
    pub message_id: u32,
    pub payload: Bytes,
}

/// Inbound dispatch counters
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct IdentityStats {
    pub sessions: SessionStats,
    pub inbound: InboundStats,
    pub delivered_local: u64,
    pub forwarded: u64,
    pub unforwarded: u64,
    pub status_received: u64,
}

/// Receiving ends handed out once at construction
pub struct IdentityChannels {
    /// Application payloads addressed to this identity
    pub app: mpsc::UnboundedReceiver<AppMessage>,
    tunnel_status: mpsc::UnboundedReceiver<u32>,
    provider_status: mpsc::UnboundedReceiver<u32>,
}

/// One local identity and its session state
pub struct LocalIdentity {
    ident: IdentHash,
    config: SessionConfig,
    registry: Arc<SessionRegistry>,
    inbound: InboundSessionStore,
    forwarder: Option<Arc<dyn CloveForwarder>>,
    tunnel_status_tx: mpsc::UnboundedSender<u32>,
    provider_status_tx: mpsc::UnboundedSender<u32>,
    app_tx: mpsc::UnboundedSender<AppMessage>,
    shutdown_tx: broadcast::Sender<()>,
    tasks: Mutex<Vec<JoinHandle<()>>>,
    delivered_local: AtomicU64,
    forwarded: AtomicU64,
    unforwarded: AtomicU64,
    status_received: AtomicU64,
}

impl LocalIdentity {
    /// Create the identity. Call [`start`](Self::start) inside a tokio runtime
    /// to begin processing delivery-status ids and maintenance.
    pub fn new(
        keys: &NodeKeys,
        config: SessionConfig,
        collaborators: Collaborators,
    ) -> (Arc<Self>, IdentityChannels) {
        let registry = Arc::new(SessionRegistry::new(
            keys.identity,
            config.clone(),
            collaborators.keys,
            collaborators.replies,
            collaborators.transport,
        ));
        let inbound =
            InboundSessionStore::new(keys.identity, keys.encryption.private.clone(), &config);

        let (tunnel_status_tx, tunnel_status) = mpsc::unbounded_channel();
        let (provider_status_tx, provider_status) = mpsc::unbounded_channel();
        let (app_tx, app) = mpsc::unbounded_channel();
        let (shutdown_tx, _) = broadcast::channel(1);

        let identity = Arc::new(Self {
            ident: keys.identity,
            config,
            registry,
            inbound,
            forwarder: collaborators.forwarder,
            tunnel_status_tx,
            provider_status_tx,
            app_tx,
            shutdown_tx,
            tasks: Mutex::new(Vec::new()),
            delivered_local: AtomicU64::new(0),
            forwarded: AtomicU64::new(0),
            unforwarded: AtomicU64::new(0),
            status_received: AtomicU64::new(0),
        });
        let channels = IdentityChannels {
            app,
            tunnel_status,
            provider_status,
        };
        (identity, channels)
    }

    pub fn ident(&self) -> IdentHash {
        self.ident
    }

    pub fn registry(&self) -> &Arc<SessionRegistry> {
        &self.registry
    }

    pub fn subscribe(&self) -> broadcast::Receiver<SessionEvent> {
        self.registry.subscribe()
    }

    /// Sender for tunnel-level delivery-status ids
    pub fn tunnel_status_sender(&self) -> mpsc::UnboundedSender<u32> {
        self.tunnel_status_tx.clone()
    }

    /// Spawn the delivery-status handler and the maintenance tick.
    ///
    /// Returns the application receiver; status queues are consumed here.
    pub fn start(self: &Arc<Self>, channels: IdentityChannels) -> mpsc::UnboundedReceiver<AppMessage> {
        let IdentityChannels {
            app,
            tunnel_status,
            provider_status,
        } = channels;

        let status = tokio::spawn(
            self.clone()
                .handle_delivery_status(tunnel_status, provider_status),
        );
        let maintenance = tokio::spawn(self.clone().run_maintenance());
        self.tasks.lock().extend([status, maintenance]);
        info!("Identity {} started", self.ident);
        app
    }

    /// Spawn a task draining an inbound delivery queue
    pub fn attach_network(self: &Arc<Self>, mut deliveries: mpsc::UnboundedReceiver<Delivery>) {
        let identity = self.clone();
        let mut shutdown_rx = self.shutdown_tx.subscribe();
        let task = tokio::spawn(async move {
            loop {
                tokio::select! {
                    delivery = deliveries.recv() => {
                        match delivery {
                            Some(Delivery::Garlic(raw)) => {
                                identity.handle_inbound_garlic(&raw);
                            }
                            Some(Delivery::Tunnel(message)) => {
                                identity.handle_tunnel_message(message);
                            }
                            None => break,
                        }
                    }
                    _ = shutdown_rx.recv() => break,
                }
            }
        });
        self.tasks.lock().push(task);
    }

    /// Send `cloves` to `remote`
    pub fn send(
        &self,
        remote: IdentHash,
        explicit_ack: bool,
        cloves: &[Clove],
    ) -> Result<GarlicCreationResult, SessionError> {
        self.registry.send(remote, explicit_ack, cloves)
    }

    /// Send one application payload for local delivery at `remote`
    pub fn send_data(
        &self,
        remote: IdentHash,
        payload: impl Into<Bytes>,
        explicit_ack: bool,
    ) -> Result<GarlicCreationResult, SessionError> {
        let clove = Clove::new(DeliveryInstruction::local(), I2npMessage::data(payload));
        self.send(remote, explicit_ack, &[clove])
    }

    /// Decrypt and dispatch an inbound garlic message.
    ///
    /// Returns the number of cloves dispatched; undecryptable input yields 0.
    pub fn handle_inbound_garlic(&self, raw: &[u8]) -> usize {
        self.dispatch_garlic(raw, 0)
    }

    fn dispatch_garlic(&self, raw: &[u8], depth: usize) -> usize {
        if depth >= MAX_GARLIC_NESTING {
            warn!("Dropping garlic nested {} deep at {}", depth, self.ident);
            return 0;
        }
        let Some(garlic) = self.inbound.decrypt_inbound(raw) else {
            return 0;
        };
        debug!(
            "Garlic {:#010x} at {}: {} cloves",
            garlic.message_id,
            self.ident,
            garlic.cloves.len()
        );
        let count = garlic.cloves.len();
        for clove in garlic.cloves {
            self.dispatch_clove(clove, depth);
        }
        count
    }

    fn dispatch_clove(&self, clove: Clove, depth: usize) {
        if clove.instruction.target != DeliveryTarget::Local {
            self.forward_clove(&clove);
            return;
        }
        match clove.message.payload {
            I2npPayload::DeliveryStatus { status_id, .. } => {
                let _ = self.provider_status_tx.send(status_id);
            }
            I2npPayload::Data(payload) => {
                self.delivered_local.fetch_add(1, Ordering::Relaxed);
                let _ = self.app_tx.send(AppMessage {
                    message_id: clove.message.message_id,
                    payload,
                });
            }
            I2npPayload::Garlic(inner) => {
                self.dispatch_garlic(&inner, depth + 1);
            }
            I2npPayload::Other { type_id, .. } => {
                debug!("Ignoring local I2NP type {} at {}", type_id, self.ident);
            }
        }
    }

    fn forward_clove(&self, clove: &Clove) {
        let Some(forwarder) = &self.forwarder else {
            self.unforwarded.fetch_add(1, Ordering::Relaxed);
            debug!(
                "No forwarder at {}, dropping clove {:#010x}",
                self.ident, clove.clove_id
            );
            return;
        };
        match forwarder.forward(clove) {
            Ok(()) => {
                self.forwarded.fetch_add(1, Ordering::Relaxed);
            }
            Err(e) => {
                self.unforwarded.fetch_add(1, Ordering::Relaxed);
                warn!(
                    "Forwarding clove {:#010x} from {} failed: {}",
                    clove.clove_id, self.ident, e
                );
            }
        }
    }

    /// A message that arrived through one of our inbound tunnels
    pub fn handle_tunnel_message(&self, message: I2npMessage) {
        match message.payload {
            I2npPayload::DeliveryStatus { status_id, .. } => {
                let _ = self.tunnel_status_tx.send(status_id);
            }
            I2npPayload::Garlic(raw) => {
                self.handle_inbound_garlic(&raw);
            }
            I2npPayload::Data(payload) => {
                self.delivered_local.fetch_add(1, Ordering::Relaxed);
                let _ = self.app_tx.send(AppMessage {
                    message_id: message.message_id,
                    payload,
                });
            }
            I2npPayload::Other { type_id, .. } => {
                debug!("Ignoring tunnel I2NP type {} at {}", type_id, self.ident);
            }
        }
    }

    async fn handle_delivery_status(
        self: Arc<Self>,
        mut tunnel_status: mpsc::UnboundedReceiver<u32>,
        mut provider_status: mpsc::UnboundedReceiver<u32>,
    ) {
        let mut shutdown_rx = self.shutdown_tx.subscribe();
        loop {
            let status_id = tokio::select! {
                Some(id) = tunnel_status.recv() => id,
                Some(id) = provider_status.recv() => id,
                _ = shutdown_rx.recv() => break,
                else => break,
            };
            self.delivery_status(status_id);
        }
    }

    /// Shared handler for both delivery-status sources
    pub fn delivery_status(&self, status_id: u32) {
        self.status_received.fetch_add(1, Ordering::Relaxed);
        if let Some((remote, _)) = self.registry.delivery_status_received(status_id) {
            debug!(
                "Delivery status {:#010x} at {} matched session to {}",
                status_id, self.ident, remote
            );
        }
    }

    /// Maintenance loop: one registry pass per tick until shutdown
    pub async fn run_maintenance(self: Arc<Self>) {
        let mut ticker = interval(self.config.tick_interval());
        let mut shutdown_rx = self.shutdown_tx.subscribe();
        loop {
            tokio::select! {
                _ = ticker.tick() => {
                    let report = self.registry.run();
                    if report.resent + report.expired + report.dropped > 0 || report.session_reset {
                        debug!(
                            "Maintenance at {}: resent {}, expired {}, dropped {}",
                            self.ident, report.resent, report.expired, report.dropped
                        );
                    }
                }
                _ = shutdown_rx.recv() => break,
            }
        }
    }

    pub fn stats(&self) -> IdentityStats {
        IdentityStats {
            sessions: self.registry.stats(),
            inbound: self.inbound.stats(),
            delivered_local: self.delivered_local.load(Ordering::Relaxed),
            forwarded: self.forwarded.load(Ordering::Relaxed),
            unforwarded: self.unforwarded.load(Ordering::Relaxed),
            status_received: self.status_received.load(Ordering::Relaxed),
        }
    }

    /// Tear down sessions and stop background tasks
    pub fn shutdown(&self) {
        let _ = self.shutdown_tx.send(());
        self.registry.shutdown();
        self.inbound.clear();
        for task in self.tasks.lock().drain(..) {
            task.abort();
        }
        info!("Identity {} shut down", self.ident);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::loopback::LoopbackNetwork;
    use std::sync::OnceLock;
    use std::time::Duration;
    use tokio::time::timeout;

    fn node_keys(index: usize) -> &'static NodeKeys {
        static KEYS: OnceLock<[NodeKeys; 2]> = OnceLock::new();
        &KEYS.get_or_init(|| [NodeKeys::generate(), NodeKeys::generate()])[index]
    }

    fn spawn_pair() -> (
        Arc<LocalIdentity>,
        mpsc::UnboundedReceiver<AppMessage>,
        Arc<LocalIdentity>,
        mpsc::UnboundedReceiver<AppMessage>,
    ) {
        let network = LoopbackNetwork::new();
        let mut out = Vec::new();
        for index in 0..2 {
            let keys = node_keys(index);
            let (port, deliveries) = network.attach(keys.identity, keys.encryption.public.clone());
            let port = Arc::new(port);
            let collaborators = Collaborators {
                keys: port.clone(),
                replies: port.clone(),
                transport: port.clone(),
                forwarder: Some(port),
            };
            let (identity, channels) =
                LocalIdentity::new(keys, SessionConfig::default(), collaborators);
            let app = identity.start(channels);
            identity.attach_network(deliveries);
            out.push((identity, app));
        }
        let (bob, bob_app) = out.pop().unwrap();
        let (alice, alice_app) = out.pop().unwrap();
        (alice, alice_app, bob, bob_app)
    }

    #[tokio::test]
    async fn test_data_delivered_and_tags_confirmed() {
        let (alice, _alice_app, bob, mut bob_app) = spawn_pair();
        let mut events = alice.subscribe();

        alice.send_data(bob.ident(), &b"hello bob"[..], false).unwrap();

        let received = timeout(Duration::from_secs(5), bob_app.recv())
            .await
            .unwrap()
            .unwrap();
        assert_eq!(received.payload, Bytes::from_static(b"hello bob"));

        let event = timeout(Duration::from_secs(5), events.recv())
            .await
            .unwrap()
            .unwrap();
        assert!(matches!(
            event,
            SessionEvent::TagsConfirmed { count: 15, bootstrap: true, .. }
        ));
        assert_eq!(alice.stats().sessions.usable_tags, 15);

        alice.shutdown();
        bob.shutdown();
    }

    #[test]
    fn test_unforwarded_clove_counted() {
        let keys = node_keys(0);
        let network = LoopbackNetwork::new();
        let (port, _deliveries) = network.attach(keys.identity, keys.encryption.public.clone());
        let port = Arc::new(port);
        let (identity, _channels) = LocalIdentity::new(
            keys,
            SessionConfig::default(),
            Collaborators {
                keys: port.clone(),
                replies: port.clone(),
                transport: port,
                forwarder: None,
            },
        );

        identity.forward_clove(&Clove::new(
            DeliveryInstruction::router(IdentHash([9; 32])),
            I2npMessage::data(&b"x"[..]),
        ));
        assert_eq!(identity.stats().unforwarded, 1);
    }

    #[tokio::test]
    async fn test_garbage_inbound_dispatches_nothing() {
        let (alice, _a, bob, _b) = spawn_pair();
        assert_eq!(bob.handle_inbound_garlic(&[0u8; 100]), 0);
        assert_eq!(bob.stats().inbound.dropped, 1);
        alice.shutdown();
        bob.shutdown();
    }

    #[tokio::test]
    async fn test_send_after_shutdown_fails() {
        let (alice, _a, bob, _b) = spawn_pair();
        alice.shutdown();
        assert!(matches!(
            alice.send_data(bob.ident(), &b"late"[..], false),
            Err(SessionError::ShutDown)
        ));
        bob.shutdown();
    }
}
