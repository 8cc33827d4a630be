//! Inbound garlic decryption and received-tag bookkeeping
//!
//! Every failure on this path is logged and turned into `None`; nothing
//! malformed or tampered ever surfaces as an error to the caller.

use crate::config::SessionConfig;
use crate::tag_pool::TagPool;
use bytes::Bytes;
use garlic_core::crypto::{ELGAMAL_BLOCK_LEN, ELGAMAL_DATA_LEN};
use garlic_core::{
    AesBlock, ElGamalPrivateKey, Garlic, IdentHash, SessionKey, SessionTag, SESSION_TAG_LEN,
};
use parking_lot::Mutex;
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::Instant;
use tracing::{debug, warn};

/// Counters for the inbound path
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct InboundStats {
    pub tag_hits: u64,
    pub elgamal_decrypts: u64,
    pub dropped: u64,
    pub tags_received: u64,
}

/// Received session tags and the local private key
pub struct InboundSessionStore {
    local: IdentHash,
    private_key: ElGamalPrivateKey,
    tags: Mutex<TagPool<SessionTag, SessionKey>>,
    tag_hits: AtomicU64,
    elgamal_decrypts: AtomicU64,
    dropped: AtomicU64,
    tags_received: AtomicU64,
}

impl InboundSessionStore {
    pub fn new(local: IdentHash, private_key: ElGamalPrivateKey, config: &SessionConfig) -> Self {
        Self {
            local,
            private_key,
            tags: Mutex::new(TagPool::new(config.received_tag_lifetime())),
            tag_hits: AtomicU64::new(0),
            elgamal_decrypts: AtomicU64::new(0),
            dropped: AtomicU64::new(0),
            tags_received: AtomicU64::new(0),
        }
    }

    /// Decrypt a garlic message addressed to the local identity.
    pub fn decrypt_inbound(&self, raw: &[u8]) -> Option<Garlic> {
        self.decrypt_inbound_at(Instant::now(), raw)
    }

    pub fn decrypt_inbound_at(&self, now: Instant, raw: &[u8]) -> Option<Garlic> {
        let decoded = self.decrypt_block(now, raw).and_then(|block| {
            self.harvest(&block, now);
            match Garlic::decode(&block.payload) {
                Ok((garlic, _)) => Some(garlic),
                Err(e) => {
                    warn!("Dropping inbound garlic for {}: {}", self.local, e);
                    None
                }
            }
        });
        if decoded.is_none() {
            self.dropped.fetch_add(1, Ordering::Relaxed);
        }
        decoded
    }

    /// Decrypt the AES block via a known tag or, failing that, ElGamal.
    fn decrypt_block(&self, now: Instant, raw: &[u8]) -> Option<DecryptedBlock> {
        let tagged = {
            let mut tags = self.tags.lock();
            tags.purge_expired(now);
            raw.get(..SESSION_TAG_LEN)
                .and_then(|head| <[u8; SESSION_TAG_LEN]>::try_from(head).ok())
                .map(SessionTag)
                .and_then(|tag| tags.remove(&tag, now).map(|key| (tag, key)))
        };

        if let Some((tag, key)) = tagged {
            self.tag_hits.fetch_add(1, Ordering::Relaxed);
            return match AesBlock::decrypt(&key, tag.as_bytes(), &raw[SESSION_TAG_LEN..]) {
                Ok(block) => Some(DecryptedBlock::new(block, key)),
                Err(e) => {
                    warn!("Dropping tagged garlic for {}: {}", self.local, e);
                    None
                }
            };
        }

        if raw.len() < ELGAMAL_BLOCK_LEN {
            warn!(
                "Dropping garlic for {}: {} bytes, no known tag",
                self.local,
                raw.len()
            );
            return None;
        }

        let data: [u8; ELGAMAL_DATA_LEN] =
            match self.private_key.decrypt(&raw[..ELGAMAL_BLOCK_LEN]) {
                Ok(data) => data,
                Err(e) => {
                    warn!("Dropping garlic for {}: {}", self.local, e);
                    return None;
                }
            };
        self.elgamal_decrypts.fetch_add(1, Ordering::Relaxed);

        let mut key = [0u8; 32];
        key.copy_from_slice(&data[..32]);
        let key = SessionKey(key);
        let mut pre_iv = [0u8; 32];
        pre_iv.copy_from_slice(&data[32..64]);

        match AesBlock::decrypt(&key, &pre_iv, &raw[ELGAMAL_BLOCK_LEN..]) {
            Ok(block) => Some(DecryptedBlock::new(block, key)),
            Err(e) => {
                warn!("Dropping bootstrap garlic for {}: {}", self.local, e);
                None
            }
        }
    }

    /// Store tags carried by `block` under its (possibly replaced) session key
    fn harvest(&self, block: &DecryptedBlock, now: Instant) {
        if block.tags.is_empty() {
            return;
        }
        let mut tags = self.tags.lock();
        for tag in &block.tags {
            tags.insert(*tag, block.session_key.clone(), now);
        }
        drop(tags);
        self.tags_received
            .fetch_add(block.tags.len() as u64, Ordering::Relaxed);
        debug!("Received {} tags for {}", block.tags.len(), self.local);
    }

    /// Live received tags
    pub fn known_tags(&self) -> usize {
        self.known_tags_at(Instant::now())
    }

    pub fn known_tags_at(&self, now: Instant) -> usize {
        self.tags.lock().count(now)
    }

    /// Forget every received tag
    pub fn clear(&self) {
        self.tags.lock().clear();
    }

    pub fn stats(&self) -> InboundStats {
        InboundStats {
            tag_hits: self.tag_hits.load(Ordering::Relaxed),
            elgamal_decrypts: self.elgamal_decrypts.load(Ordering::Relaxed),
            dropped: self.dropped.load(Ordering::Relaxed),
            tags_received: self.tags_received.load(Ordering::Relaxed),
        }
    }
}

/// A verified AES block plus the key its carried tags belong to
struct DecryptedBlock {
    tags: Vec<SessionTag>,
    session_key: SessionKey,
    payload: Bytes,
}

impl DecryptedBlock {
    fn new(block: AesBlock, key: SessionKey) -> Self {
        let AesBlock {
            tags,
            new_session_key,
            payload,
        } = block;
        Self {
            session_key: new_session_key.unwrap_or(key),
            tags,
            payload,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::outbound::OutboundSessionStore;
    use crate::tunnel::ReplyEndpoint;
    use garlic_core::{
        Clove, DeliveryInstruction, ElGamalKeyPair, I2npMessage, I2npPayload, KeyType, TunnelId,
    };
    use std::sync::OnceLock;
    use std::time::Duration;

    fn bob_keys() -> &'static ElGamalKeyPair {
        static KEYS: OnceLock<ElGamalKeyPair> = OnceLock::new();
        KEYS.get_or_init(ElGamalKeyPair::generate)
    }

    const BOB: IdentHash = IdentHash([0xbb; 32]);

    fn reply() -> Option<ReplyEndpoint> {
        Some(ReplyEndpoint {
            gateway: IdentHash([0xaa; 32]),
            tunnel_id: TunnelId(3),
        })
    }

    fn pair() -> (OutboundSessionStore, InboundSessionStore) {
        let config = SessionConfig::default();
        let outbound = OutboundSessionStore::new(BOB, bob_keys().public.clone(), config.clone());
        let inbound = InboundSessionStore::new(BOB, bob_keys().private.clone(), &config);
        (outbound, inbound)
    }

    fn message(body: &'static [u8]) -> Vec<Clove> {
        vec![Clove::new(DeliveryInstruction::local(), I2npMessage::data(body))]
    }

    fn data_of(garlic: &Garlic) -> Option<Bytes> {
        match &garlic.cloves.first()?.message.payload {
            I2npPayload::Data(data) => Some(data.clone()),
            _ => None,
        }
    }

    #[test]
    fn test_bootstrap_then_tag_path() {
        let (outbound, inbound) = pair();
        let now = Instant::now();

        let first = outbound.encrypt_at(now, false, 1, &message(b"P"), &reply).unwrap();
        let garlic = inbound.decrypt_inbound_at(now, &first.wire).unwrap();
        assert_eq!(data_of(&garlic).as_deref(), Some(&b"P"[..]));
        // payload + refresh ack
        assert_eq!(garlic.cloves.len(), 2);
        assert_eq!(inbound.known_tags_at(now), 15);

        outbound.acknowledge_tags(first.refresh_ack_id.unwrap(), now).unwrap();
        let second = outbound.encrypt_at(now, false, 2, &message(b"P2"), &reply).unwrap();
        assert_eq!(second.key_type, KeyType::Aes);

        let garlic = inbound.decrypt_inbound_at(now, &second.wire).unwrap();
        assert_eq!(data_of(&garlic).as_deref(), Some(&b"P2"[..]));
        assert_eq!(inbound.known_tags_at(now), 14);

        let stats = inbound.stats();
        assert_eq!(stats.tag_hits, 1);
        assert_eq!(stats.elgamal_decrypts, 1);
        assert_eq!(stats.dropped, 0);
    }

    #[test]
    fn test_tag_is_single_use() {
        let (outbound, inbound) = pair();
        let now = Instant::now();
        let first = outbound.encrypt_at(now, false, 1, &message(b"P"), &reply).unwrap();
        inbound.decrypt_inbound_at(now, &first.wire).unwrap();
        outbound.acknowledge_tags(first.refresh_ack_id.unwrap(), now).unwrap();

        let second = outbound.encrypt_at(now, false, 2, &message(b"P"), &reply).unwrap();
        assert!(inbound.decrypt_inbound_at(now, &second.wire).is_some());
        assert!(inbound.decrypt_inbound_at(now, &second.wire).is_none());
        assert_eq!(inbound.stats().dropped, 1);
    }

    #[test]
    fn test_tampered_payload_is_dropped() {
        let (outbound, inbound) = pair();
        let now = Instant::now();
        let first = outbound.encrypt_at(now, false, 1, &message(b"P"), &reply).unwrap();
        inbound.decrypt_inbound_at(now, &first.wire).unwrap();
        outbound.acknowledge_tags(first.refresh_ack_id.unwrap(), now).unwrap();

        let second = outbound.encrypt_at(now, false, 2, &message(b"P"), &reply).unwrap();
        let mut wire = second.wire.to_vec();
        // inside the payload region of the second cipher block
        wire[SESSION_TAG_LEN + 40] ^= 0x01;
        assert!(inbound.decrypt_inbound_at(now, &wire).is_none());
    }

    #[test]
    fn test_tampered_bootstrap_is_dropped() {
        let (outbound, inbound) = pair();
        let now = Instant::now();
        let first = outbound.encrypt_at(now, false, 1, &message(b"P"), &reply).unwrap();

        let mut wire = first.wire.to_vec();
        wire[100] ^= 0x80;
        assert!(inbound.decrypt_inbound_at(now, &wire).is_none());
        assert_eq!(inbound.known_tags_at(now), 0);
    }

    #[test]
    fn test_garbage_is_dropped() {
        let (_, inbound) = pair();
        assert!(inbound.decrypt_inbound(&[]).is_none());
        assert!(inbound.decrypt_inbound(&[0u8; 48]).is_none());
        assert!(inbound.decrypt_inbound(&[0u8; 600]).is_none());
        assert_eq!(inbound.stats().dropped, 3);
    }

    #[test]
    fn test_received_tags_expire() {
        let (outbound, inbound) = pair();
        let t0 = Instant::now();
        let first = outbound.encrypt_at(t0, false, 1, &message(b"P"), &reply).unwrap();
        inbound.decrypt_inbound_at(t0, &first.wire).unwrap();
        outbound.acknowledge_tags(first.refresh_ack_id.unwrap(), t0).unwrap();

        let second = outbound.encrypt_at(t0, false, 2, &message(b"P"), &reply).unwrap();
        let later = t0 + Duration::from_secs(17 * 60) + Duration::from_millis(1);
        assert_eq!(inbound.known_tags_at(later), 0);
        assert!(inbound.decrypt_inbound_at(later, &second.wire).is_none());
    }

    #[test]
    fn test_clear_forgets_tags() {
        let (outbound, inbound) = pair();
        let now = Instant::now();
        let first = outbound.encrypt_at(now, false, 1, &message(b"P"), &reply).unwrap();
        inbound.decrypt_inbound_at(now, &first.wire).unwrap();
        assert_eq!(inbound.known_tags(), 15);
        inbound.clear();
        assert_eq!(inbound.known_tags(), 0);
    }
}
