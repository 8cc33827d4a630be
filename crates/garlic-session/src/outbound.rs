//! Outbound session: session key and tag pools for one remote peer
//!
//! Chooses between the two encryption paths for every message:
//!
//! - **reuse**: a usable tag exists; it is removed and prepended to an AES
//!   block encrypted with the session key, `IV = SHA-256(tag)[0..16]`.
//! - **bootstrap**: no usable tag; an ElGamal block carries the session key
//!   and a pre-IV, followed by the AES block with `IV = SHA-256(preIV)[0..16]`.
//!
//! Newly minted tags travel inside the AES block but stay pending until the
//! delivery-status clove appended alongside them comes back.

use crate::config::SessionConfig;
use crate::error::SessionError;
use crate::tag_pool::TagPool;
use crate::tunnel::{ReplyEndpoint, ReplyTunnelSelector};
use bytes::{BufMut, Bytes, BytesMut};
use garlic_core::crypto::{ELGAMAL_BLOCK_LEN, ELGAMAL_DATA_LEN};
use garlic_core::garlic::DEFAULT_CLOVE_TTL;
use garlic_core::{
    expiration_in, AesBlock, Clove, DeliveryInstruction, ElGamalPublicKey, Garlic, I2npMessage,
    IdentHash, KeyType, SessionKey, SessionTag,
};
use parking_lot::Mutex;
use rand::{Rng, RngCore};
use std::collections::HashMap;
use std::time::Instant;
use tracing::{debug, info};

/// Everything produced by one encryption, handed to the tunnel layer
#[derive(Debug, Clone)]
pub struct GarlicCreationResult {
    /// Remote peer the garlic is encrypted to
    pub destination: IdentHash,
    /// Caller-supplied cloves (without ack cloves), kept for resends
    pub cloves: Vec<Clove>,
    /// Encrypted bytes ready for the tunnel
    pub wire: Bytes,
    /// Path taken
    pub key_type: KeyType,
    /// Usable tags left after this message
    pub tags_remaining: usize,
    /// Caller's tracking id, preserved across resends
    pub tracking_id: u32,
    /// Delivery-status id that confirms this message, if any
    pub ack_message_id: Option<u32>,
    /// Delivery-status id that confirms the tags minted with it, if any
    pub refresh_ack_id: Option<u32>,
    /// Outstanding bootstrap ack for this peer at the time of encryption
    pub bootstrap_ack_id: Option<u32>,
}

/// Result of a matching refresh acknowledgment
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct TagAck {
    /// Tags moved into the usable pool
    pub tags_added: usize,
    /// The bootstrap barrier was lifted by this ack
    pub bootstrap_confirmed: bool,
}

#[derive(Debug)]
struct PendingTags {
    tags: Vec<SessionTag>,
    key: SessionKey,
    created: Instant,
    bootstrap: bool,
}

#[derive(Debug, Clone, Copy)]
struct BootstrapBarrier {
    ack_id: u32,
    started: Instant,
}

struct OutboundState {
    session_key: Option<SessionKey>,
    usable: TagPool<SessionTag, ()>,
    pending: HashMap<u32, PendingTags>,
    bootstrap: Option<BootstrapBarrier>,
}

/// Session key and tag state for one remote peer
pub struct OutboundSessionStore {
    remote: IdentHash,
    remote_key: ElGamalPublicKey,
    config: SessionConfig,
    state: Mutex<OutboundState>,
}

/// Path decided under the lock, before anything is mutated
enum Path {
    Reuse,
    Bootstrap,
}

impl OutboundSessionStore {
    pub fn new(remote: IdentHash, remote_key: ElGamalPublicKey, config: SessionConfig) -> Self {
        let usable = TagPool::new(config.usable_sent_tag_lifetime());
        Self {
            remote,
            remote_key,
            config,
            state: Mutex::new(OutboundState {
                session_key: None,
                usable,
                pending: HashMap::new(),
                bootstrap: None,
            }),
        }
    }

    pub fn remote(&self) -> IdentHash {
        self.remote
    }

    /// Encrypt `cloves` for the remote peer.
    pub fn encrypt(
        &self,
        explicit_ack: bool,
        tracking_id: u32,
        cloves: &[Clove],
        replies: &dyn ReplyTunnelSelector,
    ) -> Result<GarlicCreationResult, SessionError> {
        self.encrypt_at(Instant::now(), explicit_ack, tracking_id, cloves, replies)
    }

    /// [`encrypt`](Self::encrypt) evaluated at monotonic time `now`.
    ///
    /// Fails with [`SessionError::NoReplyTunnel`] before touching any state
    /// when an ack clove is needed and no reply endpoint exists.
    pub fn encrypt_at(
        &self,
        now: Instant,
        explicit_ack: bool,
        tracking_id: u32,
        cloves: &[Clove],
        replies: &dyn ReplyTunnelSelector,
    ) -> Result<GarlicCreationResult, SessionError> {
        let mut state = self.state.lock();
        let pending_lifetime = self.config.pending_tag_lifetime();

        state.usable.purge_expired(now);
        state
            .pending
            .retain(|_, p| now.saturating_duration_since(p.created) <= pending_lifetime);

        let live = state.usable.count(now);
        let path = if live > 0 { Path::Reuse } else { Path::Bootstrap };
        let remaining = live.saturating_sub(1);
        let refresh = matches!(path, Path::Bootstrap) || remaining <= self.config.low_watermark;

        let reply = if refresh || explicit_ack {
            Some(
                replies
                    .select_reply_tunnel()
                    .ok_or(SessionError::NoReplyTunnel)?,
            )
        } else {
            None
        };

        // Build the cleartext first so a codec failure leaves no trace.
        let mut all_cloves = cloves.to_vec();
        let mut new_tags = Vec::new();
        let mut refresh_ack_id = None;
        if let (true, Some(endpoint)) = (refresh, reply) {
            let ack_id = fresh_ack_id();
            new_tags = SessionTag::batch(self.config.refill_batch);
            all_cloves.push(ack_clove(endpoint, ack_id));
            refresh_ack_id = Some(ack_id);
        }

        let mut ack_message_id = refresh_ack_id;
        if let (true, Some(endpoint)) = (explicit_ack, reply) {
            if self.config.explicit_ack_clove || refresh_ack_id.is_none() {
                let ack_id = fresh_ack_id();
                all_cloves.push(ack_clove(endpoint, ack_id));
                ack_message_id = Some(ack_id);
            }
        }

        let garlic = Garlic::new(all_cloves, expiration_in(DEFAULT_CLOVE_TTL));
        let payload = garlic.to_bytes()?;

        // Commit: consume a tag or settle the session key.
        let (key, tag) = match path {
            Path::Reuse => {
                let (tag, ()) = state
                    .usable
                    .pick_random(now)
                    .ok_or(SessionError::NoUsableTag)?;
                let key = state
                    .session_key
                    .clone()
                    .ok_or(SessionError::NoUsableTag)?;
                (key, Some(tag))
            }
            Path::Bootstrap => {
                // concurrent bootstraps share the key behind the pending barrier
                if state.bootstrap.is_none() || state.session_key.is_none() {
                    state.session_key = Some(SessionKey::random());
                    state.usable.clear();
                }
                let key = state
                    .session_key
                    .clone()
                    .ok_or(SessionError::NoUsableTag)?;
                (key, None)
            }
        };
        let key_type = if tag.is_some() {
            KeyType::Aes
        } else {
            KeyType::ElGamal
        };

        if let Some(ack_id) = refresh_ack_id {
            state.pending.insert(
                ack_id,
                PendingTags {
                    tags: new_tags.clone(),
                    key: key.clone(),
                    created: now,
                    bootstrap: key_type == KeyType::ElGamal,
                },
            );
            if key_type == KeyType::ElGamal && state.bootstrap.is_none() {
                state.bootstrap = Some(BootstrapBarrier {
                    ack_id,
                    started: now,
                });
                info!(
                    "Bootstrapping session to {} (ack {:#010x})",
                    self.remote, ack_id
                );
            }
        }

        let tags_remaining = state.usable.count(now);
        let bootstrap_ack_id = state.bootstrap.map(|b| b.ack_id);
        drop(state);

        let block = AesBlock::new(new_tags, None, payload);
        let wire = match tag {
            Some(tag) => {
                let encrypted = block.encrypt(&key, tag.as_bytes())?;
                let mut wire = BytesMut::with_capacity(32 + encrypted.len());
                wire.put_slice(tag.as_bytes());
                wire.put_slice(&encrypted);
                wire
            }
            None => {
                let mut elgamal_data = [0u8; ELGAMAL_DATA_LEN];
                rand::rngs::OsRng.fill_bytes(&mut elgamal_data);
                elgamal_data[..32].copy_from_slice(key.as_bytes());
                let mut pre_iv = [0u8; 32];
                pre_iv.copy_from_slice(&elgamal_data[32..64]);

                let elgamal_block = self.remote_key.encrypt(&elgamal_data);
                let encrypted = block.encrypt(&key, &pre_iv)?;
                let mut wire = BytesMut::with_capacity(ELGAMAL_BLOCK_LEN + encrypted.len());
                wire.put_slice(&elgamal_block);
                wire.put_slice(&encrypted);
                wire
            }
        };

        debug!(
            "Encrypted garlic for {} via {:?}: {} bytes, {} tags left, tracking {}",
            self.remote,
            key_type,
            wire.len(),
            tags_remaining,
            tracking_id
        );

        Ok(GarlicCreationResult {
            destination: self.remote,
            cloves: cloves.to_vec(),
            wire: wire.freeze(),
            key_type,
            tags_remaining,
            tracking_id,
            ack_message_id,
            refresh_ack_id,
            bootstrap_ack_id,
        })
    }

    /// Handle a delivery status for a refresh ack.
    ///
    /// Moves the matching batch into the usable pool in one step. Returns
    /// `None` when `ack_id` is not a pending refresh of this session.
    pub fn acknowledge_tags(&self, ack_id: u32, now: Instant) -> Option<TagAck> {
        let mut state = self.state.lock();
        let batch = state.pending.remove(&ack_id)?;

        if state.session_key.as_ref() != Some(&batch.key) {
            debug!("Dropping tag batch for a replaced session key ({})", self.remote);
            return Some(TagAck {
                tags_added: 0,
                bootstrap_confirmed: false,
            });
        }

        let tags_added = batch.tags.len();
        for tag in batch.tags {
            state.usable.insert(tag, (), batch.created);
        }

        let barrier_matches = state.bootstrap.is_some_and(|b| b.ack_id == ack_id);
        let bootstrap_confirmed = state.bootstrap.is_some() && (batch.bootstrap || barrier_matches);
        if bootstrap_confirmed {
            state.bootstrap = None;
            info!("Session to {} established", self.remote);
        }

        debug!(
            "Confirmed {} tags for {} (ack {:#010x})",
            tags_added, self.remote, ack_id
        );
        Some(TagAck {
            tags_added,
            bootstrap_confirmed,
        })
    }

    /// Whether `ack_id` is a refresh ack this session is waiting for
    pub fn is_pending_ack(&self, ack_id: u32) -> bool {
        self.state.lock().pending.contains_key(&ack_id)
    }

    /// Outstanding bootstrap ack id and when it was sent
    pub fn bootstrap_pending(&self) -> Option<(u32, Instant)> {
        self.state.lock().bootstrap.map(|b| (b.ack_id, b.started))
    }

    /// Reset the bootstrap if it has been outstanding longer than `timeout`.
    ///
    /// Returns true when the session was reset.
    pub fn reset_if_bootstrap_stuck(&self, now: Instant, timeout: std::time::Duration) -> bool {
        let stuck = self
            .state
            .lock()
            .bootstrap
            .is_some_and(|b| now.saturating_duration_since(b.started) > timeout);
        if stuck {
            self.reset();
        }
        stuck
    }

    /// Discard session key, tags, pending batches and the bootstrap barrier
    pub fn reset(&self) {
        let mut state = self.state.lock();
        state.session_key = None;
        state.usable.clear();
        state.pending.clear();
        state.bootstrap = None;
        info!("Reset outbound session to {}", self.remote);
    }

    /// Live usable tags at `now`
    pub fn usable_tags(&self, now: Instant) -> usize {
        self.state.lock().usable.count(now)
    }

    /// Tags minted but not yet confirmed
    pub fn pending_tags(&self) -> usize {
        self.state
            .lock()
            .pending
            .values()
            .map(|p| p.tags.len())
            .sum()
    }

    pub fn has_session_key(&self) -> bool {
        self.state.lock().session_key.is_some()
    }
}

fn fresh_ack_id() -> u32 {
    // zero is reserved as "no id" by some peers
    rand::thread_rng().gen_range(1..=u32::MAX)
}

fn ack_clove(endpoint: ReplyEndpoint, ack_id: u32) -> Clove {
    Clove::new(
        DeliveryInstruction::tunnel(endpoint.gateway, endpoint.tunnel_id),
        I2npMessage::delivery_status(ack_id),
    )
}
