//! Outstanding-send window for one remote peer
//!
//! Sends that need confirmation are tracked here by tracking id and by every
//! delivery-status id that can confirm them. Unconfirmed entries are
//! re-encrypted once per resend interval and silently evicted after the
//! window lifetime; callers never hear about a send that timed out.

use crate::config::SessionConfig;
use crate::error::SessionError;
use crate::outbound::{GarlicCreationResult, OutboundSessionStore, TagAck};
use crate::tunnel::{ReplyTunnelSelector, TunnelSend};
use garlic_core::{Clove, IdentHash, KeyType, LeaseSet};
use parking_lot::{Mutex, RwLock};
use std::collections::HashMap;
use std::sync::atomic::{AtomicU32, AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Instant;
use tracing::{debug, warn};

/// A send awaiting confirmation
#[derive(Debug, Clone)]
pub struct OutstandingSend {
    pub tracking_id: u32,
    pub cloves: Vec<Clove>,
    pub explicit_ack: bool,
    pub key_type: KeyType,
    /// Every delivery-status id that confirms this send, across resends
    pub ack_ids: Vec<u32>,
    pub created: Instant,
    pub last_send: Instant,
    pub resends: u32,
}

#[derive(Default)]
struct Outstanding {
    by_tracking: HashMap<u32, OutstandingSend>,
    by_ack: HashMap<u32, u32>,
}

impl Outstanding {
    fn insert(&mut self, entry: OutstandingSend) {
        for &ack in &entry.ack_ids {
            self.by_ack.insert(ack, entry.tracking_id);
        }
        self.by_tracking.insert(entry.tracking_id, entry);
    }

    fn remove(&mut self, tracking_id: u32) -> Option<OutstandingSend> {
        let entry = self.by_tracking.remove(&tracking_id)?;
        for ack in &entry.ack_ids {
            self.by_ack.remove(ack);
        }
        Some(entry)
    }
}

/// What a delivery-status message matched
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct DeliveryStatusOutcome {
    /// Tracked send confirmed by this id
    pub tracking_id: Option<u32>,
    /// Tag batch confirmed by this id
    pub tags: Option<TagAck>,
}

impl DeliveryStatusOutcome {
    pub fn matched(&self) -> bool {
        self.tracking_id.is_some() || self.tags.is_some()
    }
}

/// Result of one maintenance pass
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct RunReport {
    pub resent: usize,
    pub resend_failures: usize,
    pub expired: usize,
    pub dropped: usize,
    pub session_reset: bool,
}

/// Tracks unconfirmed sends to one peer and drives their resends
pub struct DeliveryTrackingWindow {
    remote: IdentHash,
    outbound: Arc<OutboundSessionStore>,
    config: SessionConfig,
    lease_set: RwLock<Option<LeaseSet>>,
    outstanding: Mutex<Outstanding>,
    next_tracking_id: AtomicU32,
    resends: AtomicU64,
    resets: AtomicU64,
}

impl DeliveryTrackingWindow {
    pub fn new(outbound: Arc<OutboundSessionStore>, config: SessionConfig) -> Self {
        Self {
            remote: outbound.remote(),
            outbound,
            config,
            lease_set: RwLock::new(None),
            outstanding: Mutex::new(Outstanding::default()),
            next_tracking_id: AtomicU32::new(1),
            resends: AtomicU64::new(0),
            resets: AtomicU64::new(0),
        }
    }

    pub fn outbound(&self) -> &Arc<OutboundSessionStore> {
        &self.outbound
    }

    /// Replace the peer's lease set used for subsequent sends
    pub fn update_lease_set(&self, lease_set: LeaseSet) {
        debug!(
            "Lease set for {} updated ({} leases)",
            self.remote,
            lease_set.leases.len()
        );
        *self.lease_set.write() = Some(lease_set);
    }

    pub fn lease_set(&self) -> Option<LeaseSet> {
        self.lease_set.read().clone()
    }

    /// Encrypt and send `cloves`, tracking the send when it needs confirmation.
    pub fn send(
        &self,
        explicit_ack: bool,
        cloves: &[Clove],
        replies: &dyn ReplyTunnelSelector,
        transport: &dyn TunnelSend,
    ) -> Result<GarlicCreationResult, SessionError> {
        self.send_at(Instant::now(), explicit_ack, cloves, replies, transport)
    }

    pub fn send_at(
        &self,
        now: Instant,
        explicit_ack: bool,
        cloves: &[Clove],
        replies: &dyn ReplyTunnelSelector,
        transport: &dyn TunnelSend,
    ) -> Result<GarlicCreationResult, SessionError> {
        let tracking_id = self.next_tracking_id.fetch_add(1, Ordering::Relaxed);
        let result = self
            .outbound
            .encrypt_at(now, explicit_ack, tracking_id, cloves, replies)?;

        let tracked = explicit_ack
            || result.key_type == KeyType::ElGamal
            || result.bootstrap_ack_id.is_some();
        // tracked before the handoff: the ack can arrive before send returns
        if tracked {
            self.outstanding.lock().insert(OutstandingSend {
                tracking_id,
                cloves: result.cloves.clone(),
                explicit_ack,
                key_type: result.key_type,
                ack_ids: ack_ids(&result),
                created: now,
                last_send: now,
                resends: 0,
            });
        }

        let lease_set = self.lease_set();
        if let Err(e) = transport.send(lease_set.as_ref(), &result) {
            if tracked {
                self.outstanding.lock().remove(tracking_id);
            }
            return Err(e.into());
        }
        if tracked {
            debug!("Tracking send {} to {}", tracking_id, self.remote);
        }
        Ok(result)
    }

    /// Handle a delivery-status id: confirm tags and remove the tracked send.
    pub fn delivery_status(&self, ack_id: u32, now: Instant) -> DeliveryStatusOutcome {
        let tags = self.outbound.acknowledge_tags(ack_id, now);

        let mut outstanding = self.outstanding.lock();
        let matched = outstanding.by_ack.get(&ack_id).copied();
        let tracking_id = matched
            .and_then(|id| outstanding.remove(id))
            .map(|entry| entry.tracking_id);
        drop(outstanding);

        if let Some(id) = tracking_id {
            debug!("Send {} to {} acknowledged", id, self.remote);
        }
        DeliveryStatusOutcome { tracking_id, tags }
    }

    /// Periodic maintenance: bootstrap timeout, eviction and resends.
    pub fn periodic_run(
        &self,
        replies: &dyn ReplyTunnelSelector,
        transport: &dyn TunnelSend,
    ) -> RunReport {
        self.periodic_run_at(Instant::now(), replies, transport)
    }

    pub fn periodic_run_at(
        &self,
        now: Instant,
        replies: &dyn ReplyTunnelSelector,
        transport: &dyn TunnelSend,
    ) -> RunReport {
        let resend_interval = self.config.resend_interval();
        let window_lifetime = self.config.window_lifetime();
        let mut report = RunReport::default();

        if self.outbound.reset_if_bootstrap_stuck(now, resend_interval) {
            warn!(
                "Bootstrap to {} unacknowledged after {:?}, session reset",
                self.remote, resend_interval
            );
            self.resets.fetch_add(1, Ordering::Relaxed);
            report.session_reset = true;
        }
        let bootstrap_outstanding =
            report.session_reset || self.outbound.bootstrap_pending().is_some();

        let due: Vec<OutstandingSend> = {
            let mut outstanding = self.outstanding.lock();

            let expired: Vec<u32> = outstanding
                .by_tracking
                .values()
                .filter(|e| now.saturating_duration_since(e.created) > window_lifetime)
                .map(|e| e.tracking_id)
                .collect();
            for id in expired {
                outstanding.remove(id);
                report.expired += 1;
            }

            let stale: Vec<u32> = outstanding
                .by_tracking
                .values()
                .filter(|e| now.saturating_duration_since(e.last_send) >= resend_interval)
                .map(|e| e.tracking_id)
                .collect();

            let mut due = Vec::with_capacity(stale.len());
            for id in stale {
                let needs_ack = outstanding
                    .by_tracking
                    .get(&id)
                    .is_some_and(|e| e.explicit_ack);
                if needs_ack || bootstrap_outstanding {
                    if let Some(entry) = outstanding.by_tracking.get(&id) {
                        due.push(entry.clone());
                    }
                } else {
                    outstanding.remove(id);
                    report.dropped += 1;
                }
            }
            due
        };

        let mut resent: Vec<u32> = Vec::with_capacity(due.len());
        for entry in &due {
            let sent = self
                .outbound
                .encrypt_at(now, entry.explicit_ack, entry.tracking_id, &entry.cloves, replies)
                .and_then(|result| {
                    self.register_acks(entry.tracking_id, &ack_ids(&result));
                    let lease_set = self.lease_set();
                    transport.send(lease_set.as_ref(), &result)?;
                    Ok(result)
                });
            match sent {
                Ok(_) => {
                    report.resent += 1;
                    resent.push(entry.tracking_id);
                }
                Err(e) => {
                    warn!(
                        "Resend of {} to {} failed: {}",
                        entry.tracking_id, self.remote, e
                    );
                    report.resend_failures += 1;
                }
            }
        }

        // failed attempts wait a full interval too, but only successes count
        {
            let mut outstanding = self.outstanding.lock();
            for entry in &due {
                if let Some(tracked) = outstanding.by_tracking.get_mut(&entry.tracking_id) {
                    tracked.last_send = now;
                    if resent.contains(&entry.tracking_id) {
                        tracked.resends += 1;
                    }
                }
            }
        }

        self.resends
            .fetch_add(report.resent as u64, Ordering::Relaxed);
        if report.resent + report.expired + report.dropped > 0 {
            debug!(
                "Window {}: resent {}, expired {}, dropped {}",
                self.remote, report.resent, report.expired, report.dropped
            );
        }
        report
    }

    /// Map new ack ids to a tracked send, if it is still tracked
    fn register_acks(&self, tracking_id: u32, acks: &[u32]) {
        let mut guard = self.outstanding.lock();
        let outstanding = &mut *guard;
        let Some(entry) = outstanding.by_tracking.get_mut(&tracking_id) else {
            return;
        };
        entry.ack_ids.extend(acks.iter().copied());
        for &ack in acks {
            outstanding.by_ack.insert(ack, tracking_id);
        }
    }

    /// Number of tracked sends
    pub fn outstanding(&self) -> usize {
        self.outstanding.lock().by_tracking.len()
    }

    /// Snapshot of one tracked send
    pub fn outstanding_send(&self, tracking_id: u32) -> Option<OutstandingSend> {
        self.outstanding.lock().by_tracking.get(&tracking_id).cloned()
    }

    pub fn total_resends(&self) -> u64 {
        self.resends.load(Ordering::Relaxed)
    }

    pub fn total_resets(&self) -> u64 {
        self.resets.load(Ordering::Relaxed)
    }

    /// Forget every tracked send and reset the outbound session
    pub fn clear(&self) {
        let mut outstanding = self.outstanding.lock();
        outstanding.by_tracking.clear();
        outstanding.by_ack.clear();
        drop(outstanding);
        self.outbound.reset();
    }
}

fn ack_ids(result: &GarlicCreationResult) -> Vec<u32> {
    let mut ids: Vec<u32> = result
        .ack_message_id
        .into_iter()
        .chain(result.refresh_ack_id)
        .collect();
    ids.dedup();
    ids
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::TunnelError;
    use crate::tunnel::ReplyEndpoint;
    use garlic_core::{DeliveryInstruction, ElGamalKeyPair, I2npMessage, TunnelId};
    use std::sync::OnceLock;
    use std::time::Duration;

    fn peer_keys() -> &'static ElGamalKeyPair {
        static KEYS: OnceLock<ElGamalKeyPair> = OnceLock::new();
        KEYS.get_or_init(ElGamalKeyPair::generate)
    }

    #[derive(Default)]
    struct Recorder {
        sent: Mutex<Vec<GarlicCreationResult>>,
    }

    impl TunnelSend for Recorder {
        fn send(
            &self,
            _lease_set: Option<&LeaseSet>,
            garlic: &GarlicCreationResult,
        ) -> Result<(), TunnelError> {
            self.sent.lock().push(garlic.clone());
            Ok(())
        }
    }

    struct Unreachable;

    impl TunnelSend for Unreachable {
        fn send(&self, _: Option<&LeaseSet>, _: &GarlicCreationResult) -> Result<(), TunnelError> {
            Err(TunnelError::NoOutboundTunnel)
        }
    }

    /// Acknowledges every explicit ack id before `send` returns
    struct InstantAck<'a> {
        window: &'a DeliveryTrackingWindow,
        matched: Mutex<Vec<Option<u32>>>,
    }

    impl TunnelSend for InstantAck<'_> {
        fn send(
            &self,
            _lease_set: Option<&LeaseSet>,
            garlic: &GarlicCreationResult,
        ) -> Result<(), TunnelError> {
            if let Some(ack) = garlic.ack_message_id {
                let outcome = self.window.delivery_status(ack, Instant::now());
                self.matched.lock().push(outcome.tracking_id);
            }
            Ok(())
        }
    }

    fn reply() -> Option<ReplyEndpoint> {
        Some(ReplyEndpoint {
            gateway: IdentHash([0xaa; 32]),
            tunnel_id: TunnelId(7),
        })
    }

    fn window() -> DeliveryTrackingWindow {
        let config = SessionConfig::default();
        let outbound = Arc::new(OutboundSessionStore::new(
            IdentHash([0xbb; 32]),
            peer_keys().public.clone(),
            config.clone(),
        ));
        DeliveryTrackingWindow::new(outbound, config)
    }

    fn payload() -> Vec<Clove> {
        vec![Clove::new(
            DeliveryInstruction::local(),
            I2npMessage::data(&b"hello"[..]),
        )]
    }

    /// Bootstrap the session and confirm it so later sends take the tag path
    fn establish(window: &DeliveryTrackingWindow, transport: &Recorder, at: Instant) {
        let first = window.send_at(at, false, &payload(), &reply, transport).unwrap();
        let outcome = window.delivery_status(first.refresh_ack_id.unwrap(), at);
        assert!(outcome.tags.unwrap().bootstrap_confirmed);
        assert_eq!(window.outstanding(), 0);
    }

    #[test]
    fn test_untracked_tag_send() {
        let window = window();
        let transport = Recorder::default();
        let now = Instant::now();
        establish(&window, &transport, now);

        let result = window.send_at(now, false, &payload(), &reply, &transport).unwrap();
        assert_eq!(result.key_type, KeyType::Aes);
        assert_eq!(window.outstanding(), 0);
        assert_eq!(transport.sent.lock().len(), 2);
    }

    #[test]
    fn test_explicit_ack_removes_entry() {
        let window = window();
        let transport = Recorder::default();
        let now = Instant::now();
        establish(&window, &transport, now);

        let result = window.send_at(now, true, &payload(), &reply, &transport).unwrap();
        assert_eq!(window.outstanding(), 1);

        let outcome = window.delivery_status(result.ack_message_id.unwrap(), now);
        assert_eq!(outcome.tracking_id, Some(result.tracking_id));
        assert!(outcome.tags.is_none());
        assert_eq!(window.outstanding(), 0);

        // duplicate status is a no-op
        assert!(!window.delivery_status(result.ack_message_id.unwrap(), now).matched());
    }

    #[test]
    fn test_resend_once_per_interval_until_window_closes() {
        let window = window();
        let transport = Recorder::default();
        let t0 = Instant::now();
        establish(&window, &transport, t0);

        let result = window.send_at(t0, true, &payload(), &reply, &transport).unwrap();
        let mut resends = 0;
        for step in 1..=24 {
            let report = window.periodic_run_at(t0 + Duration::from_secs(step * 5), &reply, &transport);
            assert!(!report.session_reset);
            if step % 3 == 0 {
                assert_eq!(report.resent, 1, "tick at {}s", step * 5);
            } else {
                assert_eq!(report.resent, 0, "tick at {}s", step * 5);
            }
            resends += report.resent;
        }
        assert_eq!(resends, 8);

        let entry = window.outstanding_send(result.tracking_id).unwrap();
        assert_eq!(entry.resends, 8);
        assert_eq!(entry.cloves, result.cloves);

        let report = window.periodic_run_at(t0 + Duration::from_secs(125), &reply, &transport);
        assert_eq!(report.expired, 1);
        assert_eq!(report.resent, 0);
        assert_eq!(window.outstanding(), 0);
        // bootstrap + original + 8 resends
        assert_eq!(transport.sent.lock().len(), 10);
        assert!(transport
            .sent
            .lock()
            .iter()
            .skip(1)
            .all(|r| r.tracking_id == result.tracking_id));
    }

    #[test]
    fn test_ack_of_resend_removes_entry() {
        let window = window();
        let transport = Recorder::default();
        let t0 = Instant::now();
        establish(&window, &transport, t0);

        let original = window.send_at(t0, true, &payload(), &reply, &transport).unwrap();
        window.periodic_run_at(t0 + Duration::from_secs(15), &reply, &transport);
        let resent = transport.sent.lock().last().cloned().unwrap();
        assert_ne!(resent.ack_message_id, original.ack_message_id);

        let outcome = window.delivery_status(resent.ack_message_id.unwrap(), t0);
        assert_eq!(outcome.tracking_id, Some(original.tracking_id));
        assert_eq!(window.outstanding(), 0);
    }

    #[test]
    fn test_stuck_bootstrap_resets_and_renegotiates() {
        let window = window();
        let transport = Recorder::default();
        let t0 = Instant::now();

        window.send_at(t0, false, &payload(), &reply, &transport).unwrap();
        assert_eq!(window.outstanding(), 1);

        let report = window.periodic_run_at(t0 + Duration::from_secs(10), &reply, &transport);
        assert!(!report.session_reset);

        let t1 = t0 + Duration::from_secs(16);
        let report = window.periodic_run_at(t1, &reply, &transport);
        assert!(report.session_reset);
        assert_eq!(report.resent, 1);
        assert_eq!(window.total_resets(), 1);

        let resent = transport.sent.lock().last().cloned().unwrap();
        assert_eq!(resent.key_type, KeyType::ElGamal);
        assert_eq!(window.outbound().bootstrap_pending().map(|(_, at)| at), Some(t1));
    }

    #[test]
    fn test_unacked_entry_dropped_once_bootstrap_confirmed() {
        let window = window();
        let transport = Recorder::default();
        let t0 = Instant::now();

        let a = window.send_at(t0, false, &payload(), &reply, &transport).unwrap();
        let b = window.send_at(t0, false, &payload(), &reply, &transport).unwrap();
        assert_eq!(window.outstanding(), 2);
        assert_eq!(a.bootstrap_ack_id, b.bootstrap_ack_id);

        let outcome = window.delivery_status(a.refresh_ack_id.unwrap(), t0);
        assert_eq!(outcome.tracking_id, Some(a.tracking_id));
        assert!(window.outbound().bootstrap_pending().is_none());

        let report = window.periodic_run_at(t0 + Duration::from_secs(15), &reply, &transport);
        assert_eq!(report.dropped, 1);
        assert_eq!(report.resent, 0);
        assert_eq!(window.outstanding(), 0);
    }

    #[test]
    fn test_failed_send_is_not_tracked() {
        let window = window();
        let err = window
            .send_at(Instant::now(), true, &payload(), &reply, &Unreachable)
            .unwrap_err();
        assert!(err.is_connectivity());
        assert_eq!(window.outstanding(), 0);
    }

    #[test]
    fn test_ack_during_handoff_is_matched() {
        let window = window();
        let t0 = Instant::now();
        establish(&window, &Recorder::default(), t0);

        let transport = InstantAck {
            window: &window,
            matched: Mutex::new(Vec::new()),
        };
        let result = window.send_at(t0, true, &payload(), &reply, &transport).unwrap();
        assert_eq!(*transport.matched.lock(), vec![Some(result.tracking_id)]);
        assert_eq!(window.outstanding(), 0);

        let report = window.periodic_run_at(t0 + Duration::from_secs(15), &reply, &transport);
        assert_eq!(report.resent, 0);
    }

    #[test]
    fn test_failed_resend_not_counted() {
        let window = window();
        let transport = Recorder::default();
        let t0 = Instant::now();
        establish(&window, &transport, t0);

        let result = window.send_at(t0, true, &payload(), &reply, &transport).unwrap();
        let report = window.periodic_run_at(t0 + Duration::from_secs(15), &reply, &Unreachable);
        assert_eq!(report.resent, 0);
        assert_eq!(report.resend_failures, 1);
        assert_eq!(window.outstanding_send(result.tracking_id).unwrap().resends, 0);
        assert_eq!(window.total_resends(), 0);

        // the failed attempt still waits a full interval
        let report = window.periodic_run_at(t0 + Duration::from_secs(25), &reply, &transport);
        assert_eq!(report.resent, 0);
        let report = window.periodic_run_at(t0 + Duration::from_secs(30), &reply, &transport);
        assert_eq!(report.resent, 1);
        assert_eq!(window.outstanding_send(result.tracking_id).unwrap().resends, 1);
    }

    #[test]
    fn test_lease_set_passthrough() {
        let window = window();
        assert!(window.lease_set().is_none());
        let lease_set = LeaseSet::new(IdentHash([0xbb; 32]), Vec::new());
        window.update_lease_set(lease_set.clone());
        assert_eq!(window.lease_set(), Some(lease_set));
    }
}
