//! Tamper evidence for the journal: content hashes, the per-campaign hash
//! chain, and HMAC signatures under a rotating key ring.
//!
//! For each event:
//!
//! ```text
//! hash       = hex(SHA-256(canonical_json(content)))
//! prev_hash  = chain_hash of seq - 1, or GENESIS_HASH for seq 1
//! chain_hash = hex(SHA-256(hash || prev_hash))
//! signature  = hex(HMAC-SHA256(campaign_key, chain_hash))
//! ```
//!
//! `campaign_key` is derived from the root secret of the signing key and
//! the campaign id, so the root secret itself is never used as a MAC key
//! and never persisted.

use std::collections::HashMap;
use std::fmt;

use hmac::{Hmac, Mac};
use sha2::{Digest, Sha256};

use crate::canonical::to_canonical_string;
use crate::error::IntegrityError;
use crate::event::StoredEvent;

type HmacSha256 = Hmac<Sha256>;

/// `prev_hash` of the first event in every campaign.
pub const GENESIS_HASH: &str = "0000000000000000000000000000000000000000000000000000000000000000";

const KEY_CONTEXT: &[u8] = b"campaign-es/v1/campaign:";

/// Root secrets by key id, with one key active for signing.
///
/// Old keys stay in the ring after rotation so earlier signatures keep
/// verifying; each event names the key that signed it.
///
/// # Examples
///
/// ```
/// use campaign_es::KeyRing;
///
/// let ring = KeyRing::new("k1", b"first-root-secret")
///     .with_key("k2", b"second-root-secret")
///     .activate("k2")
///     .expect("k2 is in the ring");
/// assert_eq!(ring.active_key_id(), "k2");
/// ```
#[derive(Clone)]
pub struct KeyRing {
    keys: HashMap<String, Vec<u8>>,
    active: String,
}

impl KeyRing {
    /// A ring holding one key, active for signing.
    pub fn new(key_id: impl Into<String>, root_secret: impl AsRef<[u8]>) -> Self {
        let key_id = key_id.into();
        let mut keys = HashMap::new();
        keys.insert(key_id.clone(), root_secret.as_ref().to_vec());
        Self { keys, active: key_id }
    }

    /// Add a verification key without changing the active one.
    pub fn with_key(mut self, key_id: impl Into<String>, root_secret: impl AsRef<[u8]>) -> Self {
        self.keys.insert(key_id.into(), root_secret.as_ref().to_vec());
        self
    }

    /// Sign new events with `key_id` from now on.
    ///
    /// # Errors
    ///
    /// Returns [`IntegrityError::UnknownKey`] if the id is not in the ring.
    pub fn activate(mut self, key_id: &str) -> Result<Self, IntegrityError> {
        if !self.keys.contains_key(key_id) {
            return Err(IntegrityError::UnknownKey(key_id.to_owned()));
        }
        self.active = key_id.to_owned();
        Ok(self)
    }

    pub fn active_key_id(&self) -> &str {
        &self.active
    }

    pub fn contains(&self, key_id: &str) -> bool {
        self.keys.contains_key(key_id)
    }

    fn campaign_mac(&self, key_id: &str, campaign_id: &str) -> Result<HmacSha256, IntegrityError> {
        let root = self
            .keys
            .get(key_id)
            .ok_or_else(|| IntegrityError::UnknownKey(key_id.to_owned()))?;

        let mut kdf = HmacSha256::new_from_slice(root).map_err(|_| IntegrityError::NoActiveKey)?;
        kdf.update(KEY_CONTEXT);
        kdf.update(campaign_id.as_bytes());
        let campaign_key = kdf.finalize().into_bytes();

        HmacSha256::new_from_slice(&campaign_key).map_err(|_| IntegrityError::NoActiveKey)
    }

    /// Sign `chain_hash` with the active key. Returns `(signature, key_id)`.
    pub fn sign(&self, campaign_id: &str, chain_hash: &str) -> Result<(String, String), IntegrityError> {
        let mut mac = self.campaign_mac(&self.active, campaign_id)?;
        mac.update(chain_hash.as_bytes());
        Ok((hex::encode(mac.finalize().into_bytes()), self.active.clone()))
    }

    /// Check a signature with the key it names.
    ///
    /// # Errors
    ///
    /// Returns [`IntegrityError::UnknownKey`] if `key_id` is not in the ring.
    pub fn verify(
        &self,
        campaign_id: &str,
        key_id: &str,
        chain_hash: &str,
        signature: &str,
    ) -> Result<bool, IntegrityError> {
        let mut mac = self.campaign_mac(key_id, campaign_id)?;
        mac.update(chain_hash.as_bytes());
        let Ok(expected) = hex::decode(signature) else {
            return Ok(false);
        };
        Ok(mac.verify_slice(&expected).is_ok())
    }
}

impl fmt::Debug for KeyRing {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let mut ids: Vec<_> = self.keys.keys().collect();
        ids.sort();
        f.debug_struct("KeyRing")
            .field("keys", &ids)
            .field("active", &self.active)
            .field("secrets", &"<redacted>")
            .finish()
    }
}

/// SHA-256 over the canonical content of an event.
pub fn content_hash(event: &StoredEvent) -> String {
    let canonical = to_canonical_string(&event.content_value());
    hex::encode(Sha256::digest(canonical.as_bytes()))
}

/// Link an event's content hash to its predecessor.
pub fn chain_hash(hash: &str, prev_hash: &str) -> String {
    let mut hasher = Sha256::new();
    hasher.update(hash.as_bytes());
    hasher.update(prev_hash.as_bytes());
    hex::encode(hasher.finalize())
}

/// Fill in the integrity fields of a freshly sequenced event.
pub(crate) fn seal(event: &mut StoredEvent, prev_hash: &str, keys: &KeyRing) -> Result<(), IntegrityError> {
    event.hash = content_hash(event);
    event.prev_hash = prev_hash.to_owned();
    event.chain_hash = chain_hash(&event.hash, prev_hash);
    let (signature, key_id) = keys.sign(&event.campaign_id, &event.chain_hash)?;
    event.signature = signature;
    event.signature_key_id = key_id;
    Ok(())
}

/// Result of walking a campaign's chain from the first event.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum IntegrityReport {
    /// Every event verified.
    Ok { events: u64 },
    /// Verification failed; events before `at_seq` verified.
    Corrupted { at_seq: u64, reason: String },
}

impl IntegrityReport {
    pub fn is_ok(&self) -> bool {
        matches!(self, IntegrityReport::Ok { .. })
    }

    pub fn corrupted_at(&self) -> Option<u64> {
        match self {
            IntegrityReport::Ok { .. } => None,
            IntegrityReport::Corrupted { at_seq, .. } => Some(*at_seq),
        }
    }
}

/// A single verification failure.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Corruption {
    pub at_seq: u64,
    pub reason: String,
}

/// Incremental chain verifier. Feed events in journal order.
pub struct ChainVerifier<'a> {
    campaign_id: &'a str,
    keys: &'a KeyRing,
    expected_seq: u64,
    prev_chain: String,
}

impl<'a> ChainVerifier<'a> {
    pub fn new(campaign_id: &'a str, keys: &'a KeyRing) -> Self {
        Self {
            campaign_id,
            keys,
            expected_seq: 1,
            prev_chain: GENESIS_HASH.to_owned(),
        }
    }

    /// Number of events verified so far.
    pub fn verified(&self) -> u64 {
        self.expected_seq - 1
    }

    /// The seq the next event must carry.
    pub fn expected_seq(&self) -> u64 {
        self.expected_seq
    }

    pub fn push(&mut self, event: &StoredEvent) -> Result<(), Corruption> {
        let at_seq = self.expected_seq;
        let fail = |reason: String| Corruption { at_seq, reason };

        if event.seq != self.expected_seq {
            return Err(fail(format!("expected seq {}, found {}", self.expected_seq, event.seq)));
        }
        if event.campaign_id != self.campaign_id {
            return Err(fail(format!("event belongs to campaign {}", event.campaign_id)));
        }
        if content_hash(event) != event.hash {
            return Err(fail("content hash mismatch".to_owned()));
        }
        if event.prev_hash != self.prev_chain {
            return Err(fail("prev_hash does not match preceding chain hash".to_owned()));
        }
        if chain_hash(&event.hash, &event.prev_hash) != event.chain_hash {
            return Err(fail("chain hash mismatch".to_owned()));
        }
        match self.keys.verify(
            self.campaign_id,
            &event.signature_key_id,
            &event.chain_hash,
            &event.signature,
        ) {
            Ok(true) => {}
            Ok(false) => return Err(fail("signature mismatch".to_owned())),
            Err(e) => return Err(fail(e.to_string())),
        }

        self.prev_chain.clone_from(&event.chain_hash);
        self.expected_seq += 1;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::event::stored_fixture;
    use serde_json::json;

    fn sealed_chain(keys: &KeyRing, n: u64) -> Vec<StoredEvent> {
        let mut prev = GENESIS_HASH.to_owned();
        (1..=n)
            .map(|seq| {
                let mut event = stored_fixture("c-1", seq, "note.added", json!({"text": format!("n{seq}")}));
                seal(&mut event, &prev, keys).expect("seal");
                prev = event.chain_hash.clone();
                event
            })
            .collect()
    }

    fn verify(keys: &KeyRing, events: &[StoredEvent]) -> Result<u64, Corruption> {
        let mut verifier = ChainVerifier::new("c-1", keys);
        for event in events {
            verifier.push(event)?;
        }
        Ok(verifier.verified())
    }

    #[test]
    fn genesis_is_64_zeros() {
        assert_eq!(GENESIS_HASH.len(), 64);
        assert!(GENESIS_HASH.bytes().all(|b| b == b'0'));
    }

    #[test]
    fn sealed_chain_verifies() {
        let keys = KeyRing::new("k1", b"secret");
        let events = sealed_chain(&keys, 4);
        assert_eq!(events[0].prev_hash, GENESIS_HASH);
        assert_eq!(events[1].prev_hash, events[0].chain_hash);
        assert_eq!(verify(&keys, &events), Ok(4));
    }

    #[test]
    fn payload_edit_detected_at_its_seq() {
        let keys = KeyRing::new("k1", b"secret");
        let mut events = sealed_chain(&keys, 5);
        events[2].payload = json!({"text": "tampered"});
        let err = verify(&keys, &events).unwrap_err();
        assert_eq!(err.at_seq, 3);
        assert!(err.reason.contains("content hash"));
    }

    #[test]
    fn deletion_detected() {
        let keys = KeyRing::new("k1", b"secret");
        let mut events = sealed_chain(&keys, 4);
        events.remove(1);
        assert_eq!(verify(&keys, &events).unwrap_err().at_seq, 2);
    }

    #[test]
    fn rehashed_edit_fails_signature() {
        let keys = KeyRing::new("k1", b"secret");
        let mut events = sealed_chain(&keys, 3);
        events[1].payload = json!({"text": "forged"});
        events[1].hash = content_hash(&events[1]);
        events[1].chain_hash = chain_hash(&events[1].hash, &events[1].prev_hash);
        let err = verify(&keys, &events).unwrap_err();
        assert_eq!(err.at_seq, 2);
        assert_eq!(err.reason, "signature mismatch");
    }

    #[test]
    fn rotation_keeps_old_signatures_valid() {
        let old = KeyRing::new("k1", b"old-secret");
        let mut events = sealed_chain(&old, 2);

        let rotated = old.with_key("k2", b"new-secret").activate("k2").unwrap();
        let mut next = stored_fixture("c-1", 3, "note.added", json!({"text": "n3"}));
        seal(&mut next, &events[1].chain_hash, &rotated).unwrap();
        assert_eq!(next.signature_key_id, "k2");
        events.push(next);

        assert_eq!(verify(&rotated, &events), Ok(3));
    }

    #[test]
    fn missing_key_is_reported_as_corruption() {
        let keys = KeyRing::new("k1", b"secret");
        let events = sealed_chain(&keys, 1);
        let other = KeyRing::new("k9", b"other");
        let err = verify(&other, &events).unwrap_err();
        assert_eq!(err.at_seq, 1);
        assert!(err.reason.contains("k1"));
    }

    #[test]
    fn campaign_keys_differ() {
        let keys = KeyRing::new("k1", b"secret");
        let (a, _) = keys.sign("c-1", "abc").unwrap();
        let (b, _) = keys.sign("c-2", "abc").unwrap();
        assert_ne!(a, b);
    }

    #[test]
    fn activate_unknown_key_fails() {
        let err = KeyRing::new("k1", b"s").activate("k2").unwrap_err();
        assert_eq!(err, IntegrityError::UnknownKey("k2".into()));
    }

    #[test]
    fn debug_redacts_secrets() {
        let keys = KeyRing::new("k1", b"super-secret");
        let debug = format!("{keys:?}");
        assert!(!debug.contains("super-secret"));
        assert!(debug.contains("redacted"));
    }
}
