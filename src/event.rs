//! Nostr event model, id hashing, and signature verification.

use secp256k1::{schnorr::Signature, Message, Secp256k1, XOnlyPublicKey};
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};

use crate::error::{Error, Result};

/// Kind for the replaceable application metadata event.
pub const KIND_APP_METADATA: u32 = 32267;
/// Kind for the replaceable release event.
pub const KIND_RELEASE: u32 = 30063;
/// Kind for asset (file metadata) events, one per published binary.
pub const KIND_ASSET: u32 = 1063;
/// Kind for ephemeral upload authorization events.
pub const KIND_UPLOAD_AUTH: u32 = 24242;
/// Kind for bunker RPC request/response events.
pub const KIND_BUNKER_RPC: u32 = 24133;

/// Wrapper for a Nostr tag expressed as an array of strings.
///
/// Tags appear as small arrays where the first element denotes the type and
/// the following elements hold data. Examples from the release vocabulary:
///
/// - `d` – unique identifier for replaceable events
/// - `e` – links a release to one of its asset events
/// - `x` – sha256 of a published binary
/// - `f` – supported platform identifier
///
/// Each tag is stored verbatim so order and custom entries are preserved.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct Tag(pub Vec<String>);

impl Tag {
    /// Build a tag from string-ish parts.
    pub fn new<I, S>(parts: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        Tag(parts.into_iter().map(Into::into).collect())
    }

    /// The tag key (first element), if present.
    pub fn key(&self) -> Option<&str> {
        self.0.first().map(|s| s.as_str())
    }

    /// The tag value (second element), if present.
    pub fn value(&self) -> Option<&str> {
        self.0.get(1).map(|s| s.as_str())
    }
}

/// Core Nostr event as built, signed, and published by this crate.
///
/// ```json
/// {
///   "id": "aa11",
///   "pubkey": "a9f3...",
///   "kind": 30063,
///   "created_at": 1700000000,
///   "tags": [["d", "com.example.app@2.0.0"], ["version", "2.0.0"]],
///   "content": "changelog",
///   "sig": "deadbeef"
/// }
/// ```
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct Event {
    /// Event identifier (hex of SHA-256 of the serialized fields).
    pub id: String,
    /// Author public key (x-only hex).
    pub pubkey: String,
    /// Kind number, e.g. `1063` or `30063`.
    pub kind: u32,
    /// Unix timestamp of creation.
    pub created_at: u64,
    /// Ordered tags; order is part of the wire format.
    pub tags: Vec<Tag>,
    /// Event content body.
    pub content: String,
    /// Schnorr signature over the event hash; empty until signed, and left
    /// empty permanently for external-signing handoff.
    pub sig: String,
}

impl Event {
    /// Build an unsigned event with empty `pubkey`, `id`, and `sig`.
    pub fn unsigned(kind: u32, created_at: u64, tags: Vec<Tag>, content: String) -> Self {
        Event {
            id: String::new(),
            pubkey: String::new(),
            kind,
            created_at,
            tags,
            content,
            sig: String::new(),
        }
    }

    /// First value of the tag with the given key, if any.
    pub fn tag_value(&self, key: &str) -> Option<&str> {
        self.tags
            .iter()
            .find(|t| t.key() == Some(key))
            .and_then(|t| t.value())
    }

    /// Compute and store the event id from the current fields.
    ///
    /// The pubkey must already be assigned; the id covers it.
    pub fn finalize_id(&mut self) -> Result<()> {
        self.id = hex::encode(event_hash(self)?);
        Ok(())
    }
}

/// Recompute the Nostr event hash from its fields.
///
/// The id is a pure function of `(pubkey, created_at, kind, tags, content)`
/// and is independent of `sig`.
pub fn event_hash(ev: &Event) -> Result<[u8; 32]> {
    let arr = serde_json::json!([0, ev.pubkey, ev.created_at, ev.kind, ev.tags, ev.content]);
    let data = serde_json::to_vec(&arr)
        .map_err(|e| Error::Validation(format!("event serialization: {e}")))?;
    let hash = Sha256::digest(&data);
    Ok(hash.into())
}

/// Verify an event's id and Schnorr signature.
pub fn verify_event(ev: &Event) -> Result<()> {
    let hash = event_hash(ev)?;
    let calc_id = hex::encode(hash);
    if calc_id != ev.id {
        return Err(Error::SignatureRejected(format!(
            "id mismatch: expected {calc_id}, got {}",
            ev.id
        )));
    }
    let sig_bytes =
        hex::decode(&ev.sig).map_err(|e| Error::SignatureRejected(format!("sig hex: {e}")))?;
    let sig = Signature::from_slice(&sig_bytes)
        .map_err(|e| Error::SignatureRejected(format!("sig: {e}")))?;
    let pk_bytes =
        hex::decode(&ev.pubkey).map_err(|e| Error::SignatureRejected(format!("pubkey hex: {e}")))?;
    let pk = XOnlyPublicKey::from_slice(&pk_bytes)
        .map_err(|e| Error::SignatureRejected(format!("pubkey: {e}")))?;
    let secp = Secp256k1::verification_only();
    let msg = Message::from_digest_slice(&hash)
        .map_err(|e| Error::SignatureRejected(format!("digest: {e}")))?;
    secp.verify_schnorr(&sig, &msg, &pk)
        .map_err(|e| Error::SignatureRejected(format!("schnorr: {e}")))?;
    Ok(())
}
